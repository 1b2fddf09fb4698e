use crate::cache::index::CacheIndexFile;
use crate::core::path::is_plain_file_name;
use crate::core::FetchError;
use crate::di::ArtifactSource;
use crate::fetcher::FetchRequest;
use crate::net::HttpClients;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::PathBuf;
use tracing::debug;

/// A local directory of artifacts: a configured find-links directory or the
/// wheelhouse scope. Uses the directory's `index.json` when present and
/// falls back to the published file name.
pub struct FindLinksSource {
    dir: PathBuf,
}

impl FindLinksSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn locate(&self, request: &FetchRequest) -> Result<Option<PathBuf>, FetchError> {
        let index = CacheIndexFile::load(&self.dir).map_err(|e| FetchError::Storage(e.to_string()))?;
        if let Some(path) = index
            .get(&request.name, &request.version)
            .and_then(|entry| entry.located_in(&self.dir))
        {
            if path.is_file() {
                return Ok(Some(path));
            }
        }
        if !is_plain_file_name(&request.filename) {
            return Ok(None);
        }
        let by_name = self.dir.join(&request.filename);
        Ok(by_name.is_file().then_some(by_name))
    }
}

#[async_trait]
impl ArtifactSource for FindLinksSource {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, FetchError> {
        match self.locate(request)? {
            Some(path) => {
                debug!("found {} in {}", request.filename, self.dir.display());
                Ok(Some(tokio::fs::read(&path).await?))
            }
            None => Ok(None),
        }
    }
}

/// Downloads over HTTP: the release URL published by the index first, then
/// `{index_url}/{name}/{filename}` for each configured index.
pub struct HttpSource {
    base_urls: Vec<String>,
    clients: HttpClients,
}

impl HttpSource {
    pub fn new(base_urls: Vec<String>, clients: HttpClients) -> Self {
        Self {
            base_urls: base_urls
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            clients,
        }
    }

    fn candidate_urls(&self, request: &FetchRequest) -> Vec<String> {
        let mut urls: Vec<String> = request.url.iter().cloned().collect();
        for base in &self.base_urls {
            let url = format!(
                "{}/{}/{}",
                base,
                urlencoding::encode(&request.name),
                urlencoding::encode(&request.filename)
            );
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let response = self
            .clients
            .for_url(url)
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await.map_err(|e| classify(url, e))?;
            return Ok(Some(bytes.to_vec()));
        }
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            return Err(FetchError::Transient {
                origin: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }
        debug!("{} answered {}", url, status);
        Ok(None)
    }
}

fn classify(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            origin: url.to_string(),
            seconds: 0,
        }
    } else {
        FetchError::Transient {
            origin: url.to_string(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    fn describe(&self) -> String {
        match self.base_urls.first() {
            Some(base) => base.clone(),
            None => "release URLs".to_string(),
        }
    }

    fn is_remote(&self) -> bool {
        true
    }

    /// 404/410 and other client errors mean "not here"; 408, 429 and 5xx are
    /// transient.
    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, FetchError> {
        for url in self.candidate_urls(request) {
            if let Some(bytes) = self.get(&url).await? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }
}
