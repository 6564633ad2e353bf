use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};

use crate::config::{DatasetDescriptor, FetchSpec};
use crate::domain::{DatasetId, SourceId, compact_date};
use crate::error::SyncError;

pub trait FetchClient: Send + Sync {
    fn fetch(&self, date: NaiveDate, destination: &Path) -> Result<u64, SyncError>;
}

pub fn expand_template(template: &str, date: NaiveDate) -> String {
    template
        .replace("{YYYYMMDD}", &compact_date(date))
        .replace("{YYYY}", &format!("{:04}", date.year()))
        .replace("{MM}", &format!("{:02}", date.month()))
        .replace("{DD}", &format!("{:02}", date.day()))
        .replace("{DOY}", &format!("{:03}", date.ordinal()))
}

#[derive(Clone)]
pub struct HttpFetchClient {
    client: Client,
    url_template: String,
}

impl HttpFetchClient {
    pub fn new(
        url_template: &str,
        timeout: Duration,
        token_env: Option<&str>,
    ) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ocean-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::InvalidConfig(err.to_string()))?,
        );
        if let Some(name) = token_env {
            if let Ok(token) = std::env::var(name) {
                if !token.trim().is_empty() {
                    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                        .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Network(err.to_string()))?;

        Ok(Self {
            client,
            url_template: url_template.to_string(),
        })
    }

    pub fn url_for(&self, date: NaiveDate) -> String {
        expand_template(&self.url_template, date)
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<u64, SyncError> {
        let expected = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let mut file =
            File::create(destination).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let written = std::io::copy(&mut response, &mut file).map_err(|err| {
            if err.kind() == std::io::ErrorKind::TimedOut {
                SyncError::Timeout(err.to_string())
            } else {
                SyncError::Network(err.to_string())
            }
        })?;
        if let Some(expected) = expected {
            if written != expected {
                return Err(SyncError::Corruption(format!(
                    "received {written} of {expected} bytes"
                )));
            }
        }
        Ok(written)
    }
}

impl FetchClient for HttpFetchClient {
    fn fetch(&self, date: NaiveDate, destination: &Path) -> Result<u64, SyncError> {
        let url = self.url_for(date);
        let response = self.client.get(&url).send().map_err(|err| {
            if err.is_timeout() {
                SyncError::Timeout(format!("{url}: {err}"))
            } else {
                SyncError::Network(format!("{url}: {err}"))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }
        self.write_response_to_file(response, destination)
    }
}

fn classify_status(status: StatusCode, url: &str) -> SyncError {
    let message = format!("{url} returned {}", status.as_u16());
    match status.as_u16() {
        404 | 410 => SyncError::NotFound(message),
        401 | 403 => SyncError::Auth(message),
        408 | 504 => SyncError::Timeout(message),
        _ => SyncError::Network(message),
    }
}

#[derive(Debug, Clone)]
pub struct LocalDirFetchClient {
    root: PathBuf,
    pattern: String,
}

impl LocalDirFetchClient {
    pub fn new(root: impl Into<PathBuf>, pattern: &str) -> Self {
        Self {
            root: root.into(),
            pattern: pattern.to_string(),
        }
    }
}

impl FetchClient for LocalDirFetchClient {
    fn fetch(&self, date: NaiveDate, destination: &Path) -> Result<u64, SyncError> {
        let source = self.root.join(expand_template(&self.pattern, date));
        if !source.is_file() {
            return Err(SyncError::NotFound(source.display().to_string()));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        fs::copy(&source, destination).map_err(|err| SyncError::Filesystem(err.to_string()))
    }
}

#[derive(Clone, Default)]
pub struct SourceRegistry {
    clients: HashMap<(DatasetId, SourceId), Arc<dyn FetchClient>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_datasets(datasets: &[DatasetDescriptor]) -> Result<Self, SyncError> {
        let mut registry = Self::new();
        for dataset in datasets {
            for window in &dataset.sources {
                let client: Arc<dyn FetchClient> = match &window.fetch {
                    FetchSpec::Http {
                        url,
                        timeout_secs,
                        token_env,
                    } => Arc::new(HttpFetchClient::new(
                        url,
                        Duration::from_secs(*timeout_secs),
                        token_env.as_deref(),
                    )?),
                    FetchSpec::LocalDir { root, pattern } => {
                        Arc::new(LocalDirFetchClient::new(root, pattern))
                    }
                };
                registry.insert(dataset.id.clone(), window.source_id.clone(), client);
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, dataset: DatasetId, source: SourceId, client: Arc<dyn FetchClient>) {
        self.clients.insert((dataset, source), client);
    }

    pub fn get(&self, dataset: &DatasetId, source: &SourceId) -> Option<Arc<dyn FetchClient>> {
        self.clients
            .get(&(dataset.clone(), source.clone()))
            .cloned()
    }
}
