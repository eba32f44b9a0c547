//! HTTP client for a running chatrelay server

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use url::Url;

use crate::error::{CliError, CliResult};
use crate::output::truncate_string;

/// Address the server listens on by default
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";

pub struct ServerClient {
    http: reqwest::Client,
    base: Url,
}

impl ServerClient {
    pub fn new(base: &str) -> CliResult<Self> {
        let mut base = Url::parse(base.trim())?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> CliResult<Url> {
        Ok(self.base.join(path)?)
    }

    /// `GET /health`
    pub async fn health(&self) -> CliResult<Value> {
        let response = self.http.get(self.endpoint("health")?).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// `POST /chat/stream`, returning the raw event stream body
    pub async fn stream_chat(
        &self,
        request: &Value,
    ) -> CliResult<BoxStream<'static, CliResult<Bytes>>> {
        let response = self
            .http
            .post(self.endpoint("chat/stream")?)
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(response.bytes_stream().map_err(CliError::from).boxed())
    }
}

async fn check_status(response: reqwest::Response) -> CliResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| truncate_string(body.trim(), 200));

    Err(CliError(format!("Server returned {status}: {message}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let client = ServerClient::new("http://example.com/relay").unwrap();
        assert_eq!(
            client.endpoint("chat/stream").unwrap().as_str(),
            "http://example.com/relay/chat/stream"
        );
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok"})),
            )
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri()).unwrap();
        assert_eq!(client.health().await.unwrap()["status"], "ok");
    }

    #[tokio::test]
    async fn test_error_status_surfaces_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"message": "Conversation not found"})),
            )
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri()).unwrap();
        let err = client
            .stream_chat(&serde_json::json!({}))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Conversation not found"));
    }
}
