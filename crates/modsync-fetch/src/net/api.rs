//! Remote calls the transfer engine depends on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::http::{HttpClient, HttpResponse};
use crate::data::{ContentHash, FileSizeEntry};
use crate::error::{Error, Result};

/// Statuses that mean "this server does not speak the POST shape".
const LEGACY_FALLBACK_STATUSES: [u16; 4] = [400, 404, 405, 415];

/// Client for the metadata service and the per-host queue protocol.
pub struct HostApi<C> {
    client: Arc<C>,
    service: Url,
    request_timeout: Duration,
}

impl<C> Clone for HostApi<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            service: self.service.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<C: HttpClient> HostApi<C> {
    pub fn new(client: Arc<C>, service: Url, request_timeout: Duration) -> Self {
        Self {
            client,
            service,
            request_timeout,
        }
    }

    pub fn service(&self) -> &Url { &self.service }

    /// Look up size, existence, forbidden flag and delivery location for
    /// each hash.
    ///
    /// Tries `POST files/getFileSizes` first and falls back to the older
    /// `GET ...?hash=` form when the server rejects the new shape.
    pub async fn file_sizes(&self, hashes: &[ContentHash]) -> Result<Vec<FileSizeEntry>> {
        let url = endpoint(&self.service, "files/getFileSizes", &[])?;
        let body = json!({ "hashes": hashes });
        let response = self.timed(self.client.post_json(&url, &body)).await?;

        let response = if LEGACY_FALLBACK_STATUSES.contains(&response.status) {
            debug!(status = response.status, "size lookup rejected POST shape, retrying with GET");
            let query: Vec<(&str, &str)> = hashes.iter().map(|h| ("hash", h.as_str())).collect();
            let legacy = endpoint(&self.service, "files/getFileSizes", &query)?;
            let response = self.timed(self.client.get(&legacy)).await?;
            response.error_for_status(&legacy)?
        } else {
            response.error_for_status(&url)?
        };

        let body = self.timed(response.bytes()).await?;
        parse_size_rows(&body)
    }

    /// Ask `host` to prepare a block for `hashes`. Returns the request id.
    pub async fn enqueue(&self, host: &Url, hashes: &[ContentHash]) -> Result<Uuid> {
        let url = endpoint(host, "request/enqueue", &[])?;
        let response = self.timed(self.client.post_json(&url, &json!(hashes))).await?;
        let body = self.timed(response.error_for_status(&url)?.bytes()).await?;
        parse_request_id(&body)
    }

    /// Poll readiness of a queued request; doubles as the keepalive.
    ///
    /// A non-success status is logged and reported as not ready.
    pub async fn check(&self, host: &Url, request_id: Uuid, hashes: &[ContentHash]) -> Result<bool> {
        let id = request_id.to_string();
        let url = endpoint(host, "request/check", &[("requestId", id.as_str())])?;
        let response = self.timed(self.client.post_json(&url, &json!(hashes))).await?;
        if !response.is_success() {
            debug!(%request_id, status = response.status, "queue check returned non-success");
            return Ok(false);
        }
        let body = self.timed(response.bytes()).await?;
        Ok(parse_ready_flag(&body))
    }

    /// Best-effort release of a queued request on `host`. Never fails.
    pub async fn cancel(&self, host: &Url, request_id: Uuid) {
        let id = request_id.to_string();
        let url = match endpoint(host, "request/cancel", &[("requestId", id.as_str())]) {
            Ok(url) => url,
            Err(e) => {
                debug!(%request_id, error = %e, "cannot build cancel url");
                return;
            }
        };
        match self.timed(self.client.post_json(&url, &Value::Null)).await {
            Ok(response) if response.is_success() => debug!(%request_id, "queued request cancelled"),
            Ok(response) => debug!(%request_id, status = response.status, "cancel returned non-success"),
            Err(e) => debug!(%request_id, error = %e, "cancel failed"),
        }
    }

    /// Open the container body of a ready request.
    pub async fn block(&self, host: &Url, request_id: Uuid) -> Result<HttpResponse> {
        let id = request_id.to_string();
        let url = endpoint(host, "cache/get", &[("requestId", id.as_str())])?;
        self.client.get(&url).await?.error_for_status(&url)
    }

    /// Open a direct CDN body. The status is left for the caller to route on.
    pub async fn direct(&self, url: &Url) -> Result<HttpResponse> { self.client.get(url).await }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Network(format!("request timed out after {:?}", self.request_timeout))),
        }
    }
}

/// `base` with `path` appended as segments and `query` as pairs.
pub(crate) fn endpoint(base: &Url, path: &str, query: &[(&str, &str)]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("{base} cannot be used as a base URL")))?
        .pop_if_empty()
        .extend(path.split('/'));
    url.set_query(None);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter().copied());
    }
    Ok(url)
}

/// Accepts a JSON array, or a JSON string whose contents are that array.
pub(crate) fn parse_size_rows(body: &[u8]) -> Result<Vec<FileSizeEntry>> {
    match serde_json::from_slice::<Value>(body)? {
        Value::String(inner) => {
            debug!("size lookup returned a double-encoded body");
            Ok(serde_json::from_str(&inner)?)
        }
        value => Ok(serde_json::from_value(value)?),
    }
}

pub(crate) fn parse_request_id(body: &[u8]) -> Result<Uuid> {
    if let Ok(id) = serde_json::from_slice::<Uuid>(body) {
        return Ok(id);
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim().trim_matches('"');
    Uuid::parse_str(text).map_err(|_| Error::InvalidResponse(format!("not a request id: {text:?}")))
}

fn parse_ready_flag(body: &[u8]) -> bool {
    match serde_json::from_slice::<bool>(body) {
        Ok(ready) => ready,
        Err(_) => String::from_utf8_lossy(body).trim().eq_ignore_ascii_case("true"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_appends_segments() {
        let base = Url::parse("https://files.example/api/").unwrap();
        let url = endpoint(&base, "request/check", &[("requestId", "abc")]).unwrap();
        assert_eq!(url.as_str(), "https://files.example/api/request/check?requestId=abc");

        let bare = Url::parse("https://files.example").unwrap();
        let url = endpoint(&bare, "files/getFileSizes", &[("hash", "AA"), ("hash", "BB")]).unwrap();
        assert_eq!(url.as_str(), "https://files.example/files/getFileSizes?hash=AA&hash=BB");
    }

    #[test]
    fn test_parse_size_rows_plain_and_double_encoded() {
        let plain = br#"[{"hash":"AA","size":3,"fileExists":true,"url":"https://cdn.example/AA"}]"#;
        let rows = parse_size_rows(plain).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url.as_deref(), Some("https://cdn.example/AA"));

        let double = serde_json::to_vec(&String::from_utf8(plain.to_vec()).unwrap()).unwrap();
        assert_eq!(parse_size_rows(&double).unwrap(), rows);

        assert!(matches!(parse_size_rows(b"{\"oops\":1}"), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_request_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_request_id(format!("\"{id}\"").as_bytes()).unwrap(), id);
        assert_eq!(parse_request_id(format!(" {id}\n").as_bytes()).unwrap(), id);
        assert!(parse_request_id(b"nope").is_err());
    }

    #[test]
    fn test_parse_ready_flag() {
        assert!(parse_ready_flag(b"true"));
        assert!(parse_ready_flag(b" True "));
        assert!(!parse_ready_flag(b"false"));
        assert!(!parse_ready_flag(b"garbage"));
    }
}
