//! Streaming GET over `http(s)://` and `file://`.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode, Url};
use std::path::PathBuf;
use std::pin::Pin;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// How many blob transfers the downloader and validator may run at once.
pub const MAX_PARALLEL_TRANSFERS: usize = 5;

/// A streaming response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One successful GET: the body stream plus a length hint when the source
/// knows it.
pub struct FetchResponse {
    pub stream: ByteStream,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Abstraction over fetching server-relative resources.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `{base}/{path}` and return a streaming byte source.
    async fn fetch(&self, path: &str) -> Result<FetchResponse>;

    /// GET and collect the whole body. Used for small resources such as the
    /// manifest itself.
    async fn fetch_bytes(&self, path: &str) -> Result<Bytes> {
        let mut response = self.fetch(path).await?;
        let mut buf = BytesMut::with_capacity(
            response.content_length.unwrap_or(0).min(1 << 20) as usize
        );
        while let Some(chunk) = response.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Builder for [`HttpFetcher`].
#[derive(Default)]
pub struct HttpFetcherBuilder {
    base: Option<Url>,
    client: Option<Client>,
}

impl HttpFetcherBuilder {
    /// Set the server base URL (e.g. `https://updates.example.com/app/` or
    /// `file:///srv/bundles/`).
    pub fn base_url(mut self, url: Url) -> Self {
        self.base = Some(url);
        self
    }

    /// Provide a custom reqwest client instance.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Build the fetcher.
    pub fn build(self) -> Result<HttpFetcher> {
        let mut base = self
            .base
            .ok_or_else(|| EngineError::validation("fetcher requires a base URL"))?;
        match base.scheme() {
            "http" | "https" | "file" => {}
            other => {
                return Err(EngineError::validation(format!(
                    "unsupported URL scheme {other:?}"
                )))
            }
        }
        // Joins are relative to the last path segment, so the base must end
        // with a slash to keep its final directory.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = self.client.unwrap_or_else(Client::new);
        Ok(HttpFetcher { base, client })
    }
}

/// Fetcher over a shared HTTP client, also serving `file://` bases by
/// mirroring the server layout on a local directory.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    base: Url,
    client: Client,
}

impl HttpFetcher {
    /// Create a new builder.
    pub fn builder() -> HttpFetcherBuilder {
        HttpFetcherBuilder::default()
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| EngineError::validation(format!("invalid resource path {path:?}: {err}")))
    }

    async fn fetch_http(&self, url: Url) -> Result<FetchResponse> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }
        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EngineError::from));
        Ok(FetchResponse {
            stream: Box::pin(stream),
            content_length,
        })
    }

    async fn fetch_file(&self, url: Url) -> Result<FetchResponse> {
        let path: PathBuf = url
            .to_file_path()
            .map_err(|_| EngineError::validation(format!("invalid file URL {url}")))?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            // Missing local files are the 404 class, not a transport error.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::HttpRejected(404, url.to_string()))
            }
            Err(err) => return Err(EngineError::network(err)),
        };
        let content_length = file
            .metadata()
            .await
            .ok()
            .map(|metadata| metadata.len());
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(EngineError::network));
        Ok(FetchResponse {
            stream: Box::pin(stream),
            content_length,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, path: &str) -> Result<FetchResponse> {
        let url = self.resolve(path)?;
        debug!(%url, "fetching");
        match url.scheme() {
            "file" => self.fetch_file(url).await,
            _ => self.fetch_http(url).await,
        }
    }
}

/// Map a non-2xx status to the retryable or final error class.
fn classify_status(status: StatusCode, url: &Url) -> EngineError {
    let code = status.as_u16();
    if status.is_server_error() || code == 408 || code == 429 {
        EngineError::HttpRetryable(code, url.to_string())
    } else {
        EngineError::HttpRejected(code, url.to_string())
    }
}
