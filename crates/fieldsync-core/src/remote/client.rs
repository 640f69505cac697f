//! HTTP client for the remote data store.
//!
//! Inserts are sent PostgREST-style: `POST <base>/<destination>` with a JSON
//! array holding the single payload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Url};
use serde_json::Value;
use tracing::{debug, warn};

use super::{FetchedResponse, Fetcher, RemoteError, RemoteStore};

/// HTTP request timeout in seconds.
/// 30s allows for slow mobile links while failing fast enough to queue the write.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Client for the remote store.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    initial_backoff: Duration,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Send `key` as both the `apikey` header and a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[cfg(test)]
    fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Host and port of the remote store, for reachability checks.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        let url = Url::parse(&self.base_url).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        Some((host, port))
    }

    fn table_url(&self, destination: &str) -> String {
        format!("{}/{}", self.base_url, destination.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, RemoteError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref key) = self.api_key {
            let invalid = |e: header::InvalidHeaderValue| RemoteError::InvalidRequest(e.to_string());
            headers.insert("apikey", header::HeaderValue::from_str(key).map_err(invalid)?);
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", key)).map_err(invalid)?,
            );
        }
        Ok(headers)
    }
}

#[async_trait]
impl RemoteStore for RestClient {
    async fn insert(&self, destination: &str, payload: &Value) -> Result<(), RemoteError> {
        let url = self.table_url(destination);
        let body = Value::Array(vec![payload.clone()]);
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self
                .client
                .post(&url)
                .headers(self.auth_headers()?)
                .header("Prefer", "return=minimal")
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                debug!(destination, status = status.as_u16(), "Remote insert accepted");
                return Ok(());
            }

            if status.as_u16() == 429 {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(RemoteError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), &text));
        }
    }
}

#[async_trait]
impl Fetcher for RestClient {
    async fn get(&self, url: &str) -> Result<FetchedResponse, RemoteError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        debug!(url, status, bytes = body.len(), "Fetched resource");

        Ok(FetchedResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Read one request and return its body.
    async fn read_body(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-request");
            buf.extend_from_slice(&chunk[..n]);

            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let start = end + 4;
            if buf.len() >= start + length {
                return String::from_utf8_lossy(&buf[start..start + length]).to_string();
            }
        }
    }

    /// Answer one connection per status, in order, and return the request
    /// bodies once every status has been served.
    async fn serve(statuses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut bodies = Vec::new();
            for (status, body) in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                bodies.push(read_body(&mut socket).await);
                let response = format!(
                    "HTTP/1.1 {} Canned\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
            bodies
        });
        (base, server)
    }

    fn client_for(base: &str) -> RestClient {
        RestClient::new(base)
            .unwrap()
            .with_initial_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_table_url_joins_cleanly() {
        let client = RestClient::new("https://db.example.com/rest/v1/").unwrap();
        assert_eq!(
            client.table_url("daily_reports"),
            "https://db.example.com/rest/v1/daily_reports"
        );
        assert_eq!(
            client.table_url("/daily_reports"),
            "https://db.example.com/rest/v1/daily_reports"
        );
    }

    #[test]
    fn test_endpoint_uses_default_port() {
        let client = RestClient::new("https://db.example.com/rest/v1").unwrap();
        assert_eq!(client.endpoint(), Some(("db.example.com".to_string(), 443)));

        let local = RestClient::new("http://127.0.0.1:54321").unwrap();
        assert_eq!(local.endpoint(), Some(("127.0.0.1".to_string(), 54321)));
    }

    #[test]
    fn test_auth_headers() {
        let client = RestClient::new("https://db.example.com").unwrap();
        assert!(client.auth_headers().unwrap().is_empty());

        let keyed = client.with_api_key("anon-key");
        let headers = keyed.auth_headers().unwrap();
        assert_eq!(headers.get("apikey").unwrap(), "anon-key");
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer anon-key");
    }

    #[tokio::test]
    async fn test_insert_created_is_accepted() {
        let (base, server) = serve(vec![(201, "")]).await;
        let payload = json!({"site": "north", "count": 3});

        client_for(&base).insert("reports", &payload).await.unwrap();

        let bodies = server.await.unwrap();
        let sent: Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(sent, json!([payload]));
    }

    #[tokio::test]
    async fn test_insert_conflict_is_rejected() {
        let (base, server) = serve(vec![(409, "duplicate key")]).await;

        let err = client_for(&base)
            .insert("reports", &json!({"id": 1}))
            .await
            .unwrap_err();

        match err {
            RemoteError::Rejected { status, body } => {
                assert_eq!(status, 409);
                assert_eq!(body, "duplicate key");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_retries_rate_limit_then_succeeds() {
        let (base, server) = serve(vec![(429, ""), (429, ""), (204, "")]).await;

        client_for(&base).insert("reports", &json!({"id": 1})).await.unwrap();

        let bodies = server.await.unwrap();
        assert_eq!(bodies.len(), 3);
        assert!(bodies.iter().all(|b| b == &bodies[0]));
    }

    #[tokio::test]
    async fn test_insert_gives_up_after_max_rate_limit_retries() {
        let attempts = (MAX_RATE_LIMIT_RETRIES + 1) as usize;
        let (base, server) = serve(vec![(429, ""); attempts]).await;

        let err = client_for(&base)
            .insert("reports", &json!({"id": 1}))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::RateLimited));
        assert_eq!(server.await.unwrap().len(), attempts);
    }

    #[tokio::test]
    async fn test_insert_to_unreachable_host_is_network_error() {
        // Port 9 on localhost is the discard port and normally closed
        let client = RestClient::new("http://127.0.0.1:9").unwrap();
        let err = client
            .insert("reports", &serde_json::json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }
}
