use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// HTTP response with status, length headers, and body stream
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Length header value, if present
    pub content_length: Option<u64>,
    /// First byte position announced by a Content-Range header, if present
    pub content_range_start: Option<u64>,
    /// Full resource length announced by a Content-Range header, if known
    pub complete_length: Option<u64>,
    /// Response body as a stream of bytes
    pub body: ByteStream,
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Get a streaming response, asking for the bytes from `range_start`
    /// onwards when given. Servers are free to ignore the range.
    async fn get_stream(
        &self,
        url: &str,
        range_start: Option<u64>,
    ) -> Result<HttpResponse, reqwest::Error>;
}

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Create a new ReqwestClient with default settings
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a new ReqwestClient with a custom reqwest::Client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_stream(
        &self,
        url: &str,
        range_start: Option<u64>,
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(start) = range_start {
            request = request.header(reqwest::header::RANGE, format!("bytes={start}-"));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok());
        let content_range_start = content_range.and_then(parse_content_range_start);
        let complete_length = content_range.and_then(parse_content_range_total);

        let body: ByteStream = Box::pin(response.bytes_stream());

        Ok(HttpResponse {
            status,
            content_length,
            content_range_start,
            complete_length,
            body,
        })
    }
}

/// Extract the first byte position from a `Content-Range` value such as
/// `bytes 6-10/11`.
pub fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Extract the complete length from a `Content-Range` value such as
/// `bytes 6-10/11` or `bytes */11`. An unknown length (`*`) yields `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?;
    let (_, total) = range.rsplit_once('/')?;
    total.trim().parse().ok()
}
