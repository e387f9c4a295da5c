//! Inbound WhatsApp webhook deliveries.
//!
//! Meta calls the webhook in two ways:
//! * a `GET` subscription handshake, carrying `hub.mode`, `hub.verify_token` and `hub.challenge`
//!   query parameters, which must be answered by echoing the challenge;
//! * a `POST` for each batch of events, signed with the app secret in the `X-Hub-Signature-256`
//!   header.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use snafu::Snafu;
use subtle::ConstantTimeEq;

/// The header carrying the signature of a webhook delivery.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

type HmacSha256 = Hmac<Sha256>;

/// Query parameters of a subscription handshake.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Subscription {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Reasons a webhook delivery is rejected.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SignatureError {
    #[snafu(display("missing {SIGNATURE_HEADER} header"))]
    Missing,
    #[snafu(display("malformed signature: {reason}"))]
    Format { reason: String },
    #[snafu(display("signature does not match payload"))]
    Mismatch,
}

/// Authenticates requests to the webhook.
#[derive(Clone, Debug)]
pub struct Verifier {
    verify_token: String,
    app_secret: Option<String>,
}

impl Verifier {
    /// Check subscriptions against `verify_token`, and deliveries against `app_secret`.
    ///
    /// Without an app secret, deliveries are accepted unsigned.
    pub fn new(verify_token: String, app_secret: Option<String>) -> Self {
        Self {
            verify_token,
            app_secret,
        }
    }

    /// Answer a subscription handshake.
    ///
    /// # Returns
    ///
    /// The challenge to echo back if the subscription is accepted, or [`None`] if it should be
    /// refused.
    pub fn subscribe<'a>(&self, sub: &'a Subscription) -> Option<&'a str> {
        if sub.mode.as_deref() == Some("subscribe")
            && sub.verify_token.as_deref() == Some(self.verify_token.as_str())
        {
            Some(sub.challenge.as_deref().unwrap_or_default())
        } else {
            None
        }
    }

    /// Check the signature of a delivery against its raw body.
    pub fn verify_signature(&self, body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        let Some(secret) = &self.app_secret else {
            return Ok(());
        };
        let header = header.ok_or(SignatureError::Missing)?;
        let hex_signature = header
            .strip_prefix("sha256=")
            .ok_or_else(|| SignatureError::Format {
                reason: "missing sha256= prefix".into(),
            })?;
        let signature = hex::decode(hex_signature).map_err(|err| SignatureError::Format {
            reason: err.to_string(),
        })?;
        if bool::from(mac(secret, body)?.ct_eq(&signature)) {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// The header value a correctly signed delivery of `body` carries, if signing is enabled.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.app_secret.as_ref()?;
        Some(format!("sha256={}", hex::encode(mac(secret, body).ok()?)))
    }
}

fn mac(secret: &str, body: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|err| SignatureError::Format {
            reason: err.to_string(),
        })?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// The body of a webhook delivery.
///
/// Only the parts needed to extract inbound text messages are modeled. Delivery receipts and other
/// event types deserialize to empty message lists.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

/// A message sent to the business phone number.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InboundMessage {
    /// The sender's phone number.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub text: Option<Text>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Text {
    pub body: String,
}

impl Payload {
    /// The `(sender, text)` of every text message in this delivery, in order.
    pub fn text_messages(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entry
            .iter()
            .flat_map(|entry| &entry.changes)
            .flat_map(|change| &change.value.messages)
            .filter_map(|msg| Some((msg.from.as_str(), msg.text.as_ref()?.body.as_str())))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe() {
        let verifier = Verifier::new("secret-token".into(), None);
        let sub = Subscription {
            mode: Some("subscribe".into()),
            verify_token: Some("secret-token".into()),
            challenge: Some("1158201444".into()),
        };
        assert_eq!(verifier.subscribe(&sub), Some("1158201444"));

        let wrong_token = Subscription {
            verify_token: Some("guess".into()),
            ..sub.clone()
        };
        assert_eq!(verifier.subscribe(&wrong_token), None);

        let wrong_mode = Subscription {
            mode: Some("unsubscribe".into()),
            ..sub
        };
        assert_eq!(verifier.subscribe(&wrong_mode), None);
        assert_eq!(verifier.subscribe(&Subscription::default()), None);
    }

    #[test]
    fn test_signature() {
        let verifier = Verifier::new("t".into(), Some("app-secret".into()));
        let body = br#"{"entry":[]}"#;
        let signature = verifier.sign(body).unwrap();
        assert!(signature.starts_with("sha256="));

        verifier.verify_signature(body, Some(&signature)).unwrap();
        assert_eq!(
            verifier.verify_signature(b"tampered", Some(&signature)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verifier.verify_signature(body, None),
            Err(SignatureError::Missing)
        );
        assert!(matches!(
            verifier.verify_signature(body, Some("md5=abcd")),
            Err(SignatureError::Format { .. })
        ));
        assert!(matches!(
            verifier.verify_signature(body, Some("sha256=not-hex")),
            Err(SignatureError::Format { .. })
        ));

        let signed_elsewhere = Verifier::new("t".into(), Some("other".into()))
            .sign(body)
            .unwrap();
        assert_eq!(
            verifier.verify_signature(body, Some(&signed_elsewhere)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_unsigned_deliveries_accepted_without_secret() {
        let verifier = Verifier::new("t".into(), None);
        verifier.verify_signature(b"anything", None).unwrap();
        assert_eq!(verifier.sign(b"anything"), None);
    }

    #[test]
    fn test_text_messages() {
        let payload: Payload = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "1",
                "changes": [
                    {
                        "field": "messages",
                        "value": {
                            "messaging_product": "whatsapp",
                            "messages": [
                                { "from": "15550001111", "type": "text", "text": { "body": "ACCEPT TKT-1" } },
                                { "from": "15550002222", "type": "image", "image": { "id": "x" } },
                            ],
                        },
                    },
                    { "field": "messages", "value": { "statuses": [{ "status": "read" }] } },
                    { "field": "messages" },
                ],
            }, {
                "id": "2",
                "changes": [{
                    "value": {
                        "messages": [
                            { "from": "15550003333", "text": { "body": "STATUS TKT-1" } },
                        ],
                    },
                }],
            }],
        }))
        .unwrap();

        assert_eq!(
            payload.text_messages().collect::<Vec<_>>(),
            [
                ("15550001111", "ACCEPT TKT-1"),
                ("15550003333", "STATUS TKT-1"),
            ]
        );
        assert_eq!(
            serde_json::from_value::<Payload>(json!({}))
                .unwrap()
                .text_messages()
                .count(),
            0
        );
    }
}
