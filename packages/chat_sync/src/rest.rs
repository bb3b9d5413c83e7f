use std::time::Duration;

use tracing::debug;

use crate::codec::{InboundEnvelope, OutboundEnvelope};
use crate::error::ChannelError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP fallback for sending a message while the socket is down.
///
/// POSTs the same JSON the socket would carry and expects one complete
/// `{"response": ...}` body back. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    url: String,
}

impl RestClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn post_chat(
        &self,
        envelope: &OutboundEnvelope,
        token: Option<&str>,
    ) -> Result<String, ChannelError> {
        let mut request = self.client.post(&self.url).json(envelope);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "chat endpoint returned {status}: {body}"
            )));
        }

        let reply: InboundEnvelope = resp.json().await.map_err(from_reqwest)?;
        if let Some(error) = reply.error {
            return Err(ChannelError::Transport(error));
        }
        debug!(bytes = reply.response.len(), "rest reply received");
        Ok(reply.response)
    }
}

fn from_reqwest(err: reqwest::Error) -> ChannelError {
    if err.is_connect() {
        ChannelError::NotConnected
    } else {
        ChannelError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot_server(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            // Read headers, then as much body as content-length promises.
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let expected = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + expected {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}/chat"), handle)
    }

    #[tokio::test]
    async fn connect_error_is_not_connected() {
        // Port 1 is reserved and nothing listens on it.
        let client = RestClient::new("http://127.0.0.1:1/chat").unwrap();
        let err = client
            .post_chat(&OutboundEnvelope::new("hi", "u"), None)
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::NotConnected);
    }

    #[tokio::test]
    async fn successful_post_returns_response_and_sends_bearer() {
        let (url, server) = one_shot_server("200 OK", r#"{"response":"pong"}"#).await;
        let client = RestClient::new(url).unwrap();

        let reply = client
            .post_chat(&OutboundEnvelope::new("ping", "u-1"), Some("tok"))
            .await
            .unwrap();
        assert_eq!(reply, "pong");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat"));
        assert!(request.to_lowercase().contains("authorization: bearer tok"));
        assert!(request.contains(r#""message":"ping""#));
    }

    #[tokio::test]
    async fn server_error_is_transport_error() {
        let (url, _server) = one_shot_server("500 Internal Server Error", "{}").await;
        let client = RestClient::new(url).unwrap();
        let err = client
            .post_chat(&OutboundEnvelope::new("ping", "u"), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "transport_error");
        assert!(err.to_string().contains("500"));
    }
}
