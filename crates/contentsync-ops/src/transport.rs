//! Remote access seam and its HTTP implementation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use url::Url;

use crate::error::TransportError;

/// Type alias for boxed futures returned by transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Stream of body chunks.
pub type ChunkStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An open download.
pub struct Download {
    /// Length advertised by the server, if any.
    pub content_length: Option<u64>,
    /// Body chunks in order.
    pub chunks: ChunkStream,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl Download {
    /// A download whose whole body is already in memory.
    pub fn from_bytes(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            content_length: Some(body.len() as u64),
            chunks: stream::once(async move { Ok(body) }).boxed(),
        }
    }
}

/// How the orchestrator reaches the content server.
pub trait Transport: Send + Sync {
    /// Quick reachability probe run before any fetch.
    fn check_connectivity(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }

    /// Fetch a whole document.
    fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, TransportError>>;

    /// Open a streaming download.
    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Download, TransportError>>;
}

/// Resolve `href` against `base` unless it is already absolute.
pub fn resolve_url(base: &str, href: &str) -> Result<String, TransportError> {
    if let Ok(absolute) = Url::parse(href) {
        return Ok(absolute.into());
    }
    let base_url = Url::parse(base).map_err(|e| TransportError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    base_url
        .join(href)
        .map(Into::into)
        .map_err(|e| TransportError::InvalidUrl {
            url: href.to_string(),
            reason: e.to_string(),
        })
}

/// Transport over HTTP(S), with `file://` URLs read from disk.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    auth_token: Option<String>,
    probe_url: Option<String>,
}

impl HttpTransport {
    /// Create a transport with sensible timeouts.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("contentsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| TransportError::Unavailable {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            auth_token: None,
            probe_url: None,
        })
    }

    /// Send a bearer token with every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// URL hit by [`Transport::check_connectivity`].
    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = Some(url.into());
        self
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, TransportError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| classify(url, e))?;
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransportError::Unauthorized {
                url: url.to_string(),
                status: status.as_u16(),
            }),
            _ if !status.is_success() => Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
            _ => Ok(response),
        }
    }
}

impl Transport for HttpTransport {
    fn check_connectivity(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Some(url) = &self.probe_url else {
                return true;
            };
            if file_path(url).is_some() {
                return true;
            }
            match self.client.head(url.as_str()).send().await {
                Ok(_) => true,
                Err(err) => {
                    tracing::debug!(%url, %err, "connectivity probe failed");
                    false
                }
            }
        })
    }

    fn fetch_document<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes, TransportError>> {
        Box::pin(async move {
            if let Some(path) = file_path(url) {
                return read_local(url, path).await;
            }
            let response = self.send(url).await?;
            response.bytes().await.map_err(|e| TransportError::Body {
                url: url.to_string(),
                message: e.to_string(),
            })
        })
    }

    fn download<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Download, TransportError>> {
        Box::pin(async move {
            if let Some(path) = file_path(url) {
                return read_local(url, path).await.map(Download::from_bytes);
            }
            let response = self.send(url).await?;
            let content_length = response.content_length();
            let owned_url = url.to_string();
            let chunks = response
                .bytes_stream()
                .map(move |chunk| {
                    chunk.map_err(|e| TransportError::Body {
                        url: owned_url.clone(),
                        message: e.to_string(),
                    })
                })
                .boxed();
            Ok(Download {
                content_length,
                chunks,
            })
        })
    }
}

fn classify(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_connect() || err.is_timeout() {
        TransportError::Unavailable {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        TransportError::Body {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

fn file_path(url: &str) -> Option<std::path::PathBuf> {
    let parsed = Url::parse(url).ok()?;
    if parsed.scheme() != "file" {
        return None;
    }
    parsed.to_file_path().ok()
}

async fn read_local(url: &str, path: std::path::PathBuf) -> Result<Bytes, TransportError> {
    match tokio::fs::read(&path).await {
        Ok(data) => Ok(Bytes::from(data)),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(TransportError::Unauthorized {
                url: url.to_string(),
                status: 403,
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(TransportError::Status {
            url: url.to_string(),
            status: 404,
        }),
        Err(err) => Err(TransportError::Body {
            url: url.to_string(),
            message: err.to_string(),
        }),
    }
}
