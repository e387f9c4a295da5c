//! A WhatsApp Cloud API client.

use super::Messenger;
use anyhow::Error;
use async_trait::async_trait;
use serde::Serialize;
use surf::Url;

/// The Graph API version messages are sent through.
const API_VERSION: &str = "v19.0";

/// A WhatsApp Cloud API client.
pub struct Client {
    client: surf::Client,
    api: Url,
    token: Option<String>,
    phone_number_id: Option<String>,
}

impl Client {
    /// Connect to the Cloud API at `api`, usually `https://graph.facebook.com/`.
    ///
    /// A client without a token or phone number ID is allowed, so that the rest of the system can
    /// run without WhatsApp configured. Such a client logs and drops every message.
    pub fn new(api: Url, token: Option<String>, phone_number_id: Option<String>) -> Self {
        Self {
            client: surf::Client::new(),
            api,
            token,
            phone_number_id,
        }
    }

    fn messages_url(&self, phone_number_id: &str) -> Result<Url, Error> {
        Ok(self
            .api
            .join(&format!("{API_VERSION}/{phone_number_id}/messages"))?)
    }
}

#[async_trait]
impl Messenger for Client {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), Error> {
        let (Some(token), Some(phone_number_id)) = (&self.token, &self.phone_number_id) else {
            tracing::warn!(%to, "WhatsApp config is missing, skipping send");
            return Ok(());
        };

        let url = self.messages_url(phone_number_id)?;
        tracing::info!(%to, "WhatsApp send");
        let mut res = self
            .client
            .post(url.as_str())
            .header("Authorization", format!("Bearer {token}"))
            .body_json(&OutgoingMessage::text(to, body))
            .map_err(Error::msg)?
            .send()
            .await
            .map_err(Error::msg)?;
        if !res.status().is_success() {
            let body = res.body_string().await.unwrap_or_default();
            return Err(Error::msg(format!(
                "WhatsApp API error {}: {body}",
                res.status()
            )));
        }
        Ok(())
    }
}

/// The body of a request to the `messages` endpoint.
#[derive(Clone, Debug, Serialize)]
struct OutgoingMessage<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    text: Text<'a>,
}

#[derive(Clone, Debug, Serialize)]
struct Text<'a> {
    body: &'a str,
}

impl<'a> OutgoingMessage<'a> {
    fn text(to: &'a str, body: &'a str) -> Self {
        Self {
            messaging_product: "whatsapp",
            to,
            kind: "text",
            text: Text { body },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_body() {
        assert_eq!(
            serde_json::to_value(OutgoingMessage::text("+15550001111", "hi")).unwrap(),
            json!({
                "messaging_product": "whatsapp",
                "to": "+15550001111",
                "type": "text",
                "text": { "body": "hi" },
            })
        );
    }

    #[test]
    fn test_messages_url() {
        let client = Client::new(
            "https://graph.facebook.com/".parse().unwrap(),
            None,
            None,
        );
        assert_eq!(
            client.messages_url("1234").unwrap().as_str(),
            "https://graph.facebook.com/v19.0/1234/messages"
        );
    }

    #[async_std::test]
    async fn test_unconfigured_client_drops_messages() {
        // Nothing listens on this port, so any attempt to send would fail.
        let client = Client::new("http://127.0.0.1:9/".parse().unwrap(), None, None);
        client.send_text("+15550001111", "hi").await.unwrap();
    }
}
