//! Fetching of source documents from the remote resource.
//!
//! The source tier knows nothing about where documents live, it only talks to a
//! [`SourceFetcher`]. The concrete fetcher is chosen by [`FetcherConfig`].

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::{header, Client, StatusCode};

use crate::caching::FetchError;
use crate::config::{Config, FetcherConfig};
use crate::types::SourceId;

/// The user agent string sent with every outgoing request.
pub const USER_AGENT: &str = concat!("attrcache/", env!("CARGO_PKG_VERSION"));

/// Retrieves the content of a source document.
pub trait SourceFetcher: fmt::Debug + Send + Sync + 'static {
    /// Fetches the document of `source_id`.
    ///
    /// An empty document is reported as [`FetchError::Empty`].
    fn fetch(&self, source_id: SourceId) -> BoxFuture<'_, Result<Bytes, FetchError>>;
}

/// Various timeouts for the fetchers.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            max_download: Duration::from_secs(30),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Creates the fetcher selected in the configuration.
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn SourceFetcher>> {
    let fetcher: Arc<dyn SourceFetcher> = match &config.source {
        FetcherConfig::Http { url } => {
            let timeouts = DownloadTimeouts::from_config(config);
            let client = create_client(&timeouts)?;
            Arc::new(HttpFetcher::new(client, url.clone(), timeouts))
        }
        FetcherConfig::Filesystem { path } => Arc::new(FilesystemFetcher::new(path.clone())),
    };
    Ok(fetcher)
}

fn non_empty(bytes: Bytes) -> Result<Bytes, FetchError> {
    if bytes.is_empty() {
        Err(FetchError::Empty)
    } else {
        Ok(bytes)
    }
}

/// Fetcher implementation that downloads documents from an HTTP server.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    url_template: String,
    timeouts: DownloadTimeouts,
}

impl HttpFetcher {
    /// Creates a fetcher for `url_template`, in which `{id}` is replaced by the source id.
    pub fn new(client: Client, url_template: String, timeouts: DownloadTimeouts) -> Self {
        Self {
            client,
            url_template,
            timeouts,
        }
    }

    fn url(&self, source_id: SourceId) -> String {
        self.url_template.replace("{id}", &source_id.to_string())
    }

    async fn download(&self, source_id: SourceId) -> Result<Bytes, FetchError> {
        let url = self.url(source_id);
        tracing::debug!("Fetching source document from `{}`", url);

        let request = self
            .client
            .get(&url)
            .header(header::USER_AGENT, USER_AGENT)
            .send();

        let response = match tokio::time::timeout(self.timeouts.max_download, request).await {
            Ok(response) => response.map_err(|err| self.map_reqwest_error(err))?,
            Err(_) => return Err(FetchError::Timeout(self.timeouts.max_download)),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(&url, status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.map_reqwest_error(err))?;
        non_empty(body)
    }

    fn map_reqwest_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeouts.max_download)
        } else {
            tracing::debug!(error = &err as &dyn std::error::Error, "failed to download source");
            err.into()
        }
    }
}

fn map_status(url: &str, status: StatusCode) -> FetchError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");
        FetchError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        FetchError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        FetchError::DownloadError(status.to_string())
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, source_id: SourceId) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.download(source_id).await;
            metric!(timer("sources.download.duration") = start.elapsed(), "fetcher" => "http");
            result
        })
    }
}

/// Fetcher implementation that reads documents from a local directory.
///
/// Usually only used for testing and local setups.
#[derive(Debug)]
pub struct FilesystemFetcher {
    path: PathBuf,
}

impl FilesystemFetcher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SourceFetcher for FilesystemFetcher {
    fn fetch(&self, source_id: SourceId) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            let path = self.path.join(source_id.to_string());
            tracing::debug!("Fetching source document from {:?}", path);

            let contents = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => FetchError::NotFound,
                io::ErrorKind::PermissionDenied => FetchError::PermissionDenied(e.to_string()),
                _ => FetchError::DownloadError(e.to_string()),
            })?;
            non_empty(contents.into())
        })
    }
}
