//! Back-office API client.
//!
//! Every endpoint answers with the same envelope,
//! `{ ok: boolean, rows?: [...], error?: string }`. A request counts as
//! successful only when the HTTP status is 2xx *and* `ok` is true. Every
//! request runs under a deadline and a cancellation token; hitting either
//! is reported as a transient failure.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{FetchError, SyncError};

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the back-office base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

/// `{base}/api/{resource}` or `{base}/api/{resource}/{id}`.
pub fn resource_url(base: &str, resource: &str, id: Option<&str>) -> String {
    let resource = resource.trim_matches('/');
    let resource = resource.strip_prefix("api/").unwrap_or(resource);
    match id {
        Some(id) => format!("{base}/api/{resource}/{}", percent_encode(id)),
        None => format!("{base}/api/{resource}"),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Failure text that indicates a temporary condition: the request may work
/// if tried again later, and cached rows should stay on screen meanwhile.
pub fn is_transient_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("temporaril")
        || lower.contains("unavailable")
        || lower.contains("server busy")
        || lower.contains("econnrefused")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("networkerror")
        || lower.contains("network error")
        || lower.contains("failed to fetch")
        || lower.contains("cannot reach")
        || lower.contains("aborted")
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 502 | 503 | 504)
}

/// Convert a `reqwest::Error` into a classified, user-friendly failure.
fn classify_reqwest_error(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::TimedOut(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return FetchError::Transient(format!("Cannot reach back-office server at {url}"));
    }
    if err.is_builder() {
        return FetchError::Rejected(format!("Invalid back-office URL: {url}"));
    }
    FetchError::Transient(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session expired, please sign in again".to_string(),
        403 => "Not authorized for this branch".to_string(),
        404 => "Back-office endpoint not found".to_string(),
        503 => "Back-office server temporarily unavailable".to_string(),
        s if s >= 500 => format!("Back-office server error (HTTP {s})"),
        s => format!("Unexpected response from back-office server (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Response body shared by every endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub rows: Option<Vec<Value>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Id assigned by a create, when the server reports it.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub row: Option<Value>,
}

impl Envelope {
    /// Server id from `id` or `row.id`, as a string.
    pub fn created_id(&self) -> Option<String> {
        let raw = self
            .id
            .as_ref()
            .or_else(|| self.row.as_ref().and_then(|r| r.get("id")))?;
        match raw {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Interpret a raw response. `what` names the request in failure messages,
/// e.g. `"fetch recoveries"`.
pub fn parse_envelope(status: StatusCode, body: &str, what: &str) -> Result<Envelope, FetchError> {
    let trimmed = body.trim();
    let parsed = if trimmed.is_empty() {
        None
    } else {
        serde_json::from_str::<Envelope>(trimmed).ok()
    };

    if !status.is_success() {
        let server_message = parsed
            .as_ref()
            .and_then(|e| e.error.clone())
            .filter(|m| !m.trim().is_empty())
            .map(|m| format!("{m} (HTTP {})", status.as_u16()));
        return Err(match server_message {
            Some(m) if is_transient_status(status) => FetchError::Unavailable(m),
            Some(m) => FetchError::from_message(m),
            None => {
                let m = format!("Could not {what}: {}", status_error(status));
                if is_transient_status(status) {
                    FetchError::Unavailable(m)
                } else {
                    FetchError::from_message(m)
                }
            }
        });
    }

    let Some(envelope) = parsed else {
        return Err(FetchError::Rejected(format!(
            "Malformed response to {what} (HTTP {})",
            status.as_u16()
        )));
    };
    if !envelope.ok {
        let message = envelope
            .error
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Could not {what}: server answered without ok"));
        return Err(FetchError::from_message(message));
    }
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Deadlines
// ---------------------------------------------------------------------------

/// Run `fut` until it resolves, `timeout` elapses, or `cancel` fires.
/// Timeout and cancellation both behave as a network failure.
pub async fn with_deadline<T, F>(
    fut: F,
    timeout: Duration,
    cancel: &CancellationToken,
    what: &str,
) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(what, "request aborted by cancellation");
            Err(FetchError::Transient(format!("Request to {what} aborted")))
        }
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => {
                warn!(what, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(FetchError::TimedOut(format!(
                    "Request to {what} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Remote collection
// ---------------------------------------------------------------------------

/// The authoritative collection behind a list page.
pub trait RemoteCollection: Send + Sync {
    /// Read the full list. Each element is one raw row.
    fn fetch_list(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Value>, FetchError>> + Send;

    /// Create a row. `client_request_id` is sent as the idempotency key.
    fn create(
        &self,
        resource: &str,
        body: Value,
        client_request_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Envelope, FetchError>> + Send;

    fn update(
        &self,
        resource: &str,
        id: &str,
        body: Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Envelope, FetchError>> + Send;

    fn delete(
        &self,
        resource: &str,
        id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Envelope, FetchError>> + Send;

    /// Abort in-flight and future requests. Aborted requests fail as
    /// transient.
    fn shutdown(&self) {}
}

/// [`RemoteCollection`] over HTTP.
pub struct HttpCollection {
    client: Client,
    base_url: String,
    session_cookie: Option<String>,
    cancel: CancellationToken,
}

impl HttpCollection {
    pub fn new(config: &Config) -> Result<Self, SyncError> {
        let client = Client::builder()
            .build()
            .map_err(|e| SyncError::config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&config.api_url),
            session_cookie: config.session_cookie.clone().filter(|c| !c.trim().is_empty()),
            cancel: CancellationToken::new(),
        })
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        idempotency_key: Option<&str>,
        timeout: Duration,
        what: &str,
    ) -> Result<Envelope, FetchError> {
        let mut req = self
            .client
            .request(method.clone(), &url)
            .timeout(timeout)
            .header("Content-Type", "application/json");
        if let Some(cookie) = self.session_cookie.as_deref() {
            req = req.header("Cookie", cookie);
        }
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let base = self.base_url.as_str();
        let exchange = async {
            let resp = req
                .send()
                .await
                .map_err(|e| classify_reqwest_error(base, &e))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| classify_reqwest_error(base, &e))?;
            Ok::<_, FetchError>((status, text))
        };

        let (status, text) = with_deadline(exchange, timeout, &self.cancel, what).await?;
        debug!(%method, url = %url, status = status.as_u16(), bytes = text.len(), "back-office response");
        parse_envelope(status, &text, what)
    }
}

impl RemoteCollection for HttpCollection {
    async fn fetch_list(&self, resource: &str, timeout: Duration) -> Result<Vec<Value>, FetchError> {
        let url = resource_url(&self.base_url, resource, None);
        let what = format!("fetch {}", resource.trim_matches('/'));
        let envelope = self.send(Method::GET, url, None, None, timeout, &what).await?;
        Ok(envelope.rows.unwrap_or_default())
    }

    async fn create(
        &self,
        resource: &str,
        body: Value,
        client_request_id: &str,
        timeout: Duration,
    ) -> Result<Envelope, FetchError> {
        let url = resource_url(&self.base_url, resource, None);
        let what = format!("save {}", resource.trim_matches('/'));
        self.send(Method::POST, url, Some(body), Some(client_request_id), timeout, &what)
            .await
    }

    async fn update(
        &self,
        resource: &str,
        id: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Envelope, FetchError> {
        let url = resource_url(&self.base_url, resource, Some(id));
        let what = format!("update {}", resource.trim_matches('/'));
        self.send(Method::PUT, url, Some(body), None, timeout, &what)
            .await
    }

    async fn delete(&self, resource: &str, id: &str, timeout: Duration) -> Result<Envelope, FetchError> {
        let url = resource_url(&self.base_url, resource, Some(id));
        let what = format!("delete {}", resource.trim_matches('/'));
        self.send(Method::DELETE, url, None, None, timeout, &what)
            .await
    }

    fn shutdown(&self) {
        info!("cancelling outstanding back-office requests");
        self.cancel.cancel();
    }
}

/// Fetch a lookup list (customers, employees) for form pickers. A transient
/// failure yields an empty list so the page stays usable.
pub async fn fetch_lookup_rows<C: RemoteCollection>(
    remote: &C,
    resource: &str,
    timeout: Duration,
) -> Result<Vec<Value>, FetchError> {
    match remote.fetch_list(resource, timeout).await {
        Ok(rows) => Ok(rows),
        Err(e) if e.is_transient() => {
            warn!(resource, error = %e, "lookup list unavailable, continuing with none");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(api_url: &str) -> Config {
        Config {
            api_url: api_url.to_string(),
            ..Config::default()
        }
    }

    /// Serve one connection: read the request head, answer with `status`
    /// and `body`, then close.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("bunk.example.com/api/"), "https://bunk.example.com");
        assert_eq!(normalize_base_url("localhost:5000/"), "http://localhost:5000");
        assert_eq!(normalize_base_url(" https://x.example// "), "https://x.example");
    }

    #[test]
    fn test_resource_url_encodes_id() {
        assert_eq!(
            resource_url("https://x", "/api/recoveries", None),
            "https://x/api/recoveries"
        );
        assert_eq!(
            resource_url("https://x", "recoveries", Some("a b/c")),
            "https://x/api/recoveries/a%20b%2Fc"
        );
    }

    #[test]
    fn test_transient_classification() {
        for msg in [
            "canceling statement due to statement timeout",
            "Query timed out",
            "Database temporarily unavailable",
            "server busy, retry",
            "connect ECONNREFUSED 127.0.0.1:5432",
            "NetworkError when attempting to fetch resource",
            "Failed to fetch",
        ] {
            assert!(is_transient_error(msg), "{msg} should be transient");
        }
        for msg in ["received_amount is required", "Invalid customer", "Forbidden"] {
            assert!(!is_transient_error(msg), "{msg} should be hard");
        }
    }

    #[test]
    fn test_parse_envelope_success_and_failures() {
        let ok = parse_envelope(StatusCode::OK, r#"{"ok":true,"rows":[{"id":"R1"}]}"#, "fetch recoveries")
            .unwrap();
        assert_eq!(ok.rows.unwrap().len(), 1);

        let err = parse_envelope(StatusCode::OK, "<html>oops</html>", "fetch recoveries").unwrap_err();
        assert!(matches!(err, FetchError::Rejected(_)));

        let err = parse_envelope(StatusCode::OK, r#"{"ok":false,"error":"Validation failed"}"#, "save recoveries")
            .unwrap_err();
        assert_eq!(err, FetchError::Rejected("Validation failed".into()));

        let err = parse_envelope(StatusCode::OK, r#"{"ok":false,"error":"Query timed out"}"#, "fetch recoveries")
            .unwrap_err();
        assert!(err.is_transient());

        let err = parse_envelope(StatusCode::SERVICE_UNAVAILABLE, "", "fetch recoveries").unwrap_err();
        assert!(err.is_transient());

        let err = parse_envelope(StatusCode::BAD_REQUEST, r#"{"ok":false,"error":"bad date"}"#, "save recoveries")
            .unwrap_err();
        assert_eq!(err, FetchError::Rejected("bad date (HTTP 400)".into()));
    }

    #[test]
    fn test_parse_envelope_status_classification() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            let err = parse_envelope(status, "", "fetch recoveries").unwrap_err();
            assert!(matches!(err, FetchError::Unavailable(_)), "{status} should be transient");

            let err = parse_envelope(status, r#"{"ok":false,"error":"Invalid customer"}"#, "fetch recoveries")
                .unwrap_err();
            assert!(err.is_transient(), "{status} with a server message should be transient");
        }

        let err = parse_envelope(StatusCode::INTERNAL_SERVER_ERROR, "", "fetch recoveries").unwrap_err();
        assert_eq!(
            err,
            FetchError::Rejected("Could not fetch recoveries: Back-office server error (HTTP 500)".into())
        );

        let err = parse_envelope(
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"ok":false,"error":"Database temporarily unavailable"}"#,
            "delete recoveries",
        )
        .unwrap_err();
        assert_eq!(err, FetchError::Unavailable("Database temporarily unavailable (HTTP 503)".into()));
    }

    #[test]
    fn test_created_id_reads_id_or_row() {
        let e: Envelope = serde_json::from_str(r#"{"ok":true,"id":42}"#).unwrap();
        assert_eq!(e.created_id().as_deref(), Some("42"));
        let e: Envelope = serde_json::from_str(r#"{"ok":true,"row":{"id":"R9"}}"#).unwrap();
        assert_eq!(e.created_id().as_deref(), Some("R9"));
        let e: Envelope = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(e.created_id(), None);
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let cancel = CancellationToken::new();
        let slow = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, FetchError>(1)
        };
        let err = with_deadline(slow, Duration::from_millis(20), &cancel, "fetch recoveries")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TimedOut(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_with_deadline_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, FetchError>(1)
        };
        let err = with_deadline(slow, Duration::from_secs(5), &cancel, "delete recoveries")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }

    #[tokio::test]
    async fn test_http_fetch_list_reads_rows() {
        let url = serve_once("200 OK", r#"{"ok":true,"rows":[{"id":"R1"},{"id":"R2"}]}"#).await;
        let client = HttpCollection::new(&test_config(&url)).unwrap();
        let rows = client
            .fetch_list("recoveries", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_http_server_error_message_is_classified() {
        let url = serve_once("500 Internal Server Error", r#"{"ok":false,"error":"Query timed out"}"#).await;
        let client = HttpCollection::new(&test_config(&url)).unwrap();
        let err = client
            .fetch_list("recoveries", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_http_unreachable_server_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpCollection::new(&test_config(&format!("http://{addr}"))).unwrap();
        let err = client
            .fetch_list("recoveries", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_http_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = HttpCollection::new(&test_config(&format!("http://{addr}"))).unwrap();
        let err = client
            .fetch_list("recoveries", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = HttpCollection::new(&test_config(&format!("http://{addr}"))).unwrap();
        client.shutdown();
        let err = client
            .delete("recoveries", "R5", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Transient("Request to delete recoveries aborted".into()));
    }
}
