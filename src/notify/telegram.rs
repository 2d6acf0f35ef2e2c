//! Telegram Bot API delivery and the plaintext secret decryptor.

use async_trait::async_trait;

use super::{NotificationSender, NotifyError, OutboundMessage, SecretDecryptor};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Sends messages via the Bot API `sendMessage` endpoint.
#[derive(Debug, Clone)]
pub struct TelegramSender {
    client: reqwest::Client,
    api_base: String,
}

impl Default for TelegramSender {
    fn default() -> Self {
        Self::new()
    }
}

impl TelegramSender {
    pub fn new() -> Self {
        Self::with_api_base(TELEGRAM_API)
    }

    /// Point the sender at a different API host.
    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl NotificationSender for TelegramSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        if message.token.is_empty() || message.chat_id.is_empty() {
            return Err(NotifyError::Config(
                "telegram token and chat id are required".to_string(),
            ));
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, message.token);
        let body = serde_json::json!({
            "chat_id": message.chat_id,
            "text": message.text,
            "disable_web_page_preview": message.disable_preview,
        });

        tracing::debug!(chat_id = %message.chat_id, "Sending Telegram notification");

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        let resp_body: serde_json::Value = response.json().await?;

        if resp_body.get("ok") == Some(&serde_json::Value::Bool(true)) {
            return Ok(());
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp_body
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(|v| v.as_u64())
                .unwrap_or(30);
            return Err(NotifyError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let description = resp_body
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown Telegram API error");
        Err(NotifyError::Api {
            status: status.as_u16(),
            description: description.to_string(),
        })
    }
}

/// Identity decryptor for deployments that keep the token unencrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextDecryptor;

impl SecretDecryptor for PlaintextDecryptor {
    fn decrypt_blob(&self, ciphertext: &str) -> Result<String, NotifyError> {
        Ok(ciphertext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn fake_api(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line,
                    body.len(),
                    body
                );
                let _ = sock.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}", addr)
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            token: "123:abc".to_string(),
            chat_id: "42".to_string(),
            text: "hello".to_string(),
            disable_preview: true,
        }
    }

    #[tokio::test]
    async fn test_send_ok() {
        let base = fake_api("200 OK", r#"{"ok":true,"result":{}}"#).await;
        let sender = TelegramSender::with_api_base(&base);
        sender.send(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let base = fake_api(
            "429 Too Many Requests",
            r#"{"ok":false,"parameters":{"retry_after":7}}"#,
        )
        .await;
        let sender = TelegramSender::with_api_base(&base);
        let err = sender.send(&message()).await.unwrap_err();
        assert!(matches!(err, NotifyError::RateLimited { retry_after_secs: 7 }));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let sender = TelegramSender::new();
        let mut msg = message();
        msg.token.clear();
        assert!(matches!(sender.send(&msg).await, Err(NotifyError::Config(_))));
    }

    #[test]
    fn test_plaintext_decryptor() {
        assert_eq!(PlaintextDecryptor.decrypt_blob("secret").unwrap(), "secret");
    }
}
