//! Remote dataset download.
//!
//! A [`DatasetFetcher`] only moves bytes; caching, parsing and retry
//! decisions belong to [`crate::dataset::DatasetCache`].

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors raised while refreshing the dataset.
///
/// `Clone` so that callers coalesced onto one refresh can all receive its result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("No dataset URL configured")]
    NotConfigured,

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Download timed out after {0} seconds")]
    Timeout(u64),

    #[error("Dataset could not be parsed: {0}")]
    Parse(String),

    #[error("Dataset contained no records")]
    Empty,
}

/// Retrieves a byte blob from a remote location.
#[async_trait]
pub trait DatasetFetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain HTTP(S) GET, following redirects.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sicil/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DatasetFetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let request_error = |e: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(request_error)?;
        debug!("Downloaded {} bytes", body.len());

        Ok(body.to_vec())
    }
}
