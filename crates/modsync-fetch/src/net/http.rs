use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use url::Url;

use crate::error::{Error, Result};

/// A boxed stream type for HTTP response bodies.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Status line and streaming body of a response.
///
/// Non-success statuses are returned, not raised; callers decide which ones
/// are routing signals.
pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl HttpResponse {
    pub fn new(
        status: u16,
        content_length: Option<u64>,
        body: BoxStream<'static, io::Result<Bytes>>,
    ) -> Self {
        Self {
            status,
            content_length,
            body,
        }
    }

    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }

    /// Turn a non-success status into [`Error::Http`].
    pub fn error_for_status(self, url: &Url) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Http {
                status: self.status,
                url: url.to_string(),
            })
        }
    }

    /// Collect the whole body into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Asynchronous HTTP client abstraction.
///
/// This is the only seam between the transfer engine and the network.
/// Implementations handle redirects and TLS; they map transport failures to
/// [`Error::Network`] and return every received status as an
/// [`HttpResponse`].
///
/// # Implementations
///
/// - [`ReqwestClient`]: Production implementation using `reqwest`
/// - Mock implementations for testing
pub trait HttpClient: Send + Sync + 'static {
    /// Issue a GET and return the response with a streaming body.
    fn get(&self, url: &Url) -> impl Future<Output = Result<HttpResponse>> + Send;

    /// Issue a POST with a JSON body.
    fn post_json(
        &self,
        url: &Url,
        body: &serde_json::Value,
    ) -> impl Future<Output = Result<HttpResponse>> + Send;
}

#[cfg(feature = "reqwest")]
mod reqwest_impl {
    use super::*;

    /// Production HTTP client implementation using reqwest.
    #[derive(Clone)]
    pub struct ReqwestClient {
        client: reqwest::Client,
        bearer_token: Option<String>,
    }

    impl ReqwestClient {
        /// Create a new ReqwestClient with default configuration.
        pub fn new() -> Result<Self> {
            let client = reqwest::Client::builder()
                .user_agent(concat!("modsync/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| Error::Network(e.to_string()))?;
            Ok(Self::from_client(client))
        }

        pub fn from_client(client: reqwest::Client) -> Self {
            Self {
                client,
                bearer_token: None,
            }
        }

        /// Send `Authorization: Bearer <token>` with every request.
        #[must_use]
        pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
            self.bearer_token = Some(token.into());
            self
        }

        async fn send(&self, mut request: reqwest::RequestBuilder) -> Result<HttpResponse> {
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| Error::Network(e.to_string()))?;
            let status = response.status().as_u16();
            let content_length = response.content_length();
            let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
            Ok(HttpResponse::new(status, content_length, Box::pin(body)))
        }
    }

    impl HttpClient for ReqwestClient {
        async fn get(&self, url: &Url) -> Result<HttpResponse> {
            self.send(self.client.get(url.clone())).await
        }

        async fn post_json(&self, url: &Url, body: &serde_json::Value) -> Result<HttpResponse> {
            self.send(self.client.post(url.clone()).json(body)).await
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestClient;

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn response(status: u16, chunks: Vec<&'static [u8]>) -> HttpResponse {
        let body = stream::iter(chunks.into_iter().map(|c| Ok::<_, io::Error>(Bytes::from_static(c))));
        HttpResponse::new(status, None, Box::pin(body))
    }

    #[tokio::test]
    async fn test_bytes_collects_chunks() {
        let body = response(200, vec![&b"ab"[..], &b""[..], &b"cd"[..]]).bytes().await.unwrap();
        assert_eq!(&body[..], b"abcd");
    }

    #[test]
    fn test_error_for_status() {
        let url = Url::parse("https://host.example/x").unwrap();
        assert!(response(204, vec![]).error_for_status(&url).is_ok());
        match response(503, vec![]).error_for_status(&url) {
            Err(Error::Http { status, url }) => {
                assert_eq!(status, 503);
                assert_eq!(url, "https://host.example/x");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
