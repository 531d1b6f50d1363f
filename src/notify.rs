//! Post-ack notification collaborator.
//!
//! Once a message is confirmed, the producer-side status message (sent by the
//! bot front-end when it submitted the text) is edited to show delivery. The
//! target is carried in the message's opaque metadata as `chat_id` plus
//! `status_message_id`; messages without those fields are skipped. Failures
//! are logged by the caller and never block or roll back the ack.

use serde_json::{json, Value};

use crate::error::{RelayError, Result};

const DELIVERED_TEXT: &str = "✅ Delivered";

#[derive(Clone)]
pub struct AckNotifier {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl AckNotifier {
    pub fn new(base_url: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bot_token: bot_token.into(),
        }
    }

    /// Edit the status message referenced by `metadata`, if any.
    pub async fn message_delivered(&self, metadata: &Value) -> Result<()> {
        let Some(chat_id) = metadata.get("chat_id") else {
            return Ok(());
        };
        let Some(status_id) = metadata.get("status_message_id") else {
            return Ok(());
        };

        let url = format!(
            "{}/bot{}/editMessageText",
            self.base_url.trim_end_matches('/'),
            self.bot_token
        );
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "message_id": status_id,
                "text": DELIVERED_TEXT,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Notify(format!(
                "editMessageText failed ({status}): {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::AckNotifier;

    #[tokio::test]
    async fn edits_status_message_from_metadata() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bottok_test/editMessageText")
                    .json_body_partial(r#"{"chat_id": 42, "message_id": 9}"#);
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;

        let notifier = AckNotifier::new(server.base_url(), "tok_test");
        notifier
            .message_delivered(&json!({"chat_id": 42, "status_message_id": 9}))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn metadata_without_target_is_skipped() {
        // no server: would panic on any outbound request
        let notifier = AckNotifier::new("http://127.0.0.1:9", "tok_test");
        notifier
            .message_delivered(&json!({"unrelated": true}))
            .await
            .unwrap();
        notifier
            .message_delivered(&json!({"chat_id": 42}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn api_rejection_surfaces_as_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bottok_test/editMessageText");
                then.status(400)
                    .json_body(json!({"ok": false, "description": "message not found"}));
            })
            .await;

        let notifier = AckNotifier::new(server.base_url(), "tok_test");
        let err = notifier
            .message_delivered(&json!({"chat_id": 1, "status_message_id": 2}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("editMessageText failed"));
    }
}
