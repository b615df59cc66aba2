use std::time::Duration;

use async_trait::async_trait;

use crate::error::FailureReason;

/// A fully built callback request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Whatever the subscriber answered, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Outbound HTTP collaborator. `Err` means no response was received.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(&self, request: OutboundRequest) -> Result<HttpResponse, FailureReason>;
}

/// [`WebhookClient`] backed by a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookClient for ReqwestClient {
    async fn post(&self, request: OutboundRequest) -> Result<HttpResponse, FailureReason> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(classify_error)?;
        let status = response.status().as_u16();
        let body = read_capped(response).await;
        Ok(HttpResponse { status, body })
    }
}

/// Enough bytes for the stored body prefix, whatever the encoding.
pub const MAX_READ_BYTES: usize = 4 * 1024;

/// Read at most [`MAX_READ_BYTES`] of the body; the rest is never pulled
/// off the socket.
async fn read_capped(mut response: reqwest::Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < MAX_READ_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buf.truncate(MAX_READ_BYTES);
    String::from_utf8_lossy(&buf).into_owned()
}

fn classify_error(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else if err.is_connect() {
        FailureReason::Connect(err.to_string())
    } else {
        FailureReason::Request(err.to_string())
    }
}
