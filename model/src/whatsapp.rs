//! Outbound messaging over WhatsApp.

use anyhow::Error;
use async_trait::async_trait;
use clap::Args;
use futures::future::join_all;
use surf::Url;

mod client;

pub use client::Client;

#[cfg(any(test, feature = "testing"))]
pub use testing::{Message, RecordingMessenger};

/// Something that can deliver text messages to a phone number.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a plain text message to the phone number `to`.
    async fn send_text(&self, to: &str, body: &str) -> Result<(), Error>;
}

/// Send the same message to many recipients at once.
///
/// Failures are logged and do not prevent delivery to the other recipients.
///
/// # Returns
///
/// The number of messages delivered successfully.
pub async fn broadcast(messenger: &dyn Messenger, recipients: &[String], body: &str) -> usize {
    let sends = recipients.iter().map(|to| async move {
        match messenger.send_text(to, body).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(%to, "failed to send WhatsApp message: {err:#}");
                false
            }
        }
    });
    join_all(sends).await.into_iter().filter(|ok| *ok).count()
}

/// WhatsApp Cloud API options.
#[derive(Clone, Debug, Args)]
#[group(skip)]
pub struct Options {
    /// Access token for the WhatsApp Cloud API.
    ///
    /// If this or the phone number ID is missing, outgoing messages are logged and dropped.
    #[clap(long = "wa-token", env = "WHATSAPP_TOKEN")]
    pub token: Option<String>,

    /// ID of the WhatsApp business phone number messages are sent from.
    #[clap(long = "wa-phone-number-id", env = "WHATSAPP_PHONE_NUMBER_ID")]
    pub phone_number_id: Option<String>,

    /// Token Meta must present when subscribing to the webhook.
    #[clap(
        long = "wa-verify-token",
        env = "WA_VERIFY_TOKEN",
        default_value = "verify_token"
    )]
    pub verify_token: String,

    /// Phones of the EHS managers, separated by commas.
    ///
    /// Managers are notified of new tickets no resolver group claims, and of every SLA escalation.
    #[clap(long = "wa-managers", env = "WA_MANAGERS", value_delimiter = ',')]
    pub managers: Vec<String>,

    /// App secret used to check the signatures of webhook deliveries.
    #[clap(long = "wa-app-secret", env = "WA_APP_SECRET")]
    pub app_secret: Option<String>,

    /// Base URL of the Graph API.
    #[clap(
        long = "wa-api-url",
        env = "WHATSAPP_API_URL",
        default_value = "https://graph.facebook.com/"
    )]
    pub api_url: Url,
}

impl Options {
    /// Connect to the WhatsApp Cloud API.
    pub fn client(&self) -> Client {
        Client::new(
            self.api_url.clone(),
            self.token.clone(),
            self.phone_number_id.clone(),
        )
    }

    /// The manager phone numbers, trimmed, with blanks dropped.
    pub fn managers(&self) -> Vec<String> {
        self.managers
            .iter()
            .map(|phone| phone.trim())
            .filter(|phone| !phone.is_empty())
            .map(String::from)
            .collect()
    }

    /// Checks for inbound webhook requests.
    pub fn verifier(&self) -> crate::webhook::Verifier {
        crate::webhook::Verifier::new(self.verify_token.clone(), self.app_secret.clone())
    }
}

#[cfg(any(test, feature = "testing"))]
mod testing {
    use super::Messenger;
    use anyhow::Error;
    use async_std::sync::{Arc, Mutex};
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// A message captured by [`RecordingMessenger`].
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Message {
        pub to: String,
        pub body: String,
    }

    /// A [`Messenger`] which records messages instead of sending them.
    ///
    /// Clones share the same record.
    #[derive(Clone, Debug, Default)]
    pub struct RecordingMessenger {
        sent: Arc<Mutex<Vec<Message>>>,
        unreachable: Arc<Mutex<HashSet<String>>>,
    }

    impl RecordingMessenger {
        /// Fail every future send to `phone`.
        pub async fn make_unreachable(&self, phone: impl Into<String>) {
            self.unreachable.lock().await.insert(phone.into());
        }

        /// Every message sent so far, in order.
        pub async fn sent(&self) -> Vec<Message> {
            self.sent.lock().await.clone()
        }

        /// The bodies of messages sent to `to`, in order.
        pub async fn sent_to(&self, to: &str) -> Vec<String> {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|msg| msg.to == to)
                .map(|msg| msg.body.clone())
                .collect()
        }

        /// Forget all messages sent so far.
        pub async fn clear(&self) {
            self.sent.lock().await.clear();
        }
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send_text(&self, to: &str, body: &str) -> Result<(), Error> {
            if self.unreachable.lock().await.contains(to) {
                return Err(Error::msg(format!("{to} is unreachable")));
            }
            self.sent.lock().await.push(Message {
                to: to.into(),
                body: body.into(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[clap(flatten)]
        whatsapp: Options,
    }

    #[async_std::test]
    async fn test_broadcast() {
        let messenger = RecordingMessenger::default();
        messenger.make_unreachable("+15550002222").await;
        let recipients = ["+15550001111", "+15550002222", "+15550003333"]
            .map(String::from)
            .to_vec();

        let delivered = broadcast(&messenger, &recipients, "hello").await;
        assert_eq!(delivered, 2);
        assert_eq!(messenger.sent_to("+15550001111").await, ["hello"]);
        assert!(messenger.sent_to("+15550002222").await.is_empty());
        assert_eq!(messenger.sent_to("+15550003333").await, ["hello"]);
    }

    #[test]
    fn test_managers() {
        let cli = Cli::parse_from([
            "relay",
            "--wa-managers",
            " +15550001111, ,+15550002222 ,",
        ]);
        assert_eq!(cli.whatsapp.managers(), ["+15550001111", "+15550002222"]);
        assert_eq!(cli.whatsapp.verify_token, "verify_token");
        assert_eq!(cli.whatsapp.api_url.as_str(), "https://graph.facebook.com/");
    }
}
