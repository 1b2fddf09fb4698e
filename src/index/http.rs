use crate::core::path::is_plain_file_name;
use crate::core::{ProvisionError, ProvisionResult};
use crate::di::PackageIndex;
use crate::index::{IndexDocument, Release};
use crate::manifest::normalize_name;
use crate::net::HttpClients;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::{debug, warn};

/// Remote index serving `{base_url}/{name}/index.json`.
pub struct HttpIndex {
    base_url: String,
    clients: HttpClients,
}

impl HttpIndex {
    pub fn new(base_url: &str, clients: HttpClients) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            clients,
        }
    }

    fn document_url(&self, name: &str) -> String {
        format!("{}/{}/index.json", self.base_url, urlencoding::encode(name))
    }
}

#[async_trait]
impl PackageIndex for HttpIndex {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn is_remote(&self) -> bool {
        true
    }

    async fn releases(&self, name: &str) -> ProvisionResult<Vec<Release>> {
        let url = self.document_url(name);
        debug!("querying {}", url);

        let response = self.clients.for_url(&url).get(&url).send().await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Ok(Vec::new());
        }
        let document: IndexDocument = response.error_for_status()?.json().await?;

        if normalize_name(&document.name) != name {
            return Err(ProvisionError::Config(format!(
                "index {} answered for '{}' when asked for '{}'",
                self.base_url, document.name, name
            )));
        }

        let base = Url::parse(&url).map_err(|e| {
            ProvisionError::Config(format!("Invalid index URL '{}': {}", url, e))
        })?;

        document
            .releases
            .into_iter()
            .map(|mut release| {
                if let Some(f) = release.filename.take() {
                    if is_plain_file_name(&f) {
                        release.filename = Some(f);
                    } else {
                        warn!(
                            "{}: ignoring unsafe file name '{}' for {} {}",
                            self.base_url, f, name, release.version
                        );
                    }
                }
                // Relative and missing URLs are resolved against the document
                let target = match (&release.url, &release.filename) {
                    (Some(u), _) => Some(u.clone()),
                    (None, Some(f)) => Some(urlencoding::encode(f).into_owned()),
                    (None, None) => None,
                };
                if let Some(target) = target {
                    let joined = base.join(&target).map_err(|e| {
                        ProvisionError::Config(format!(
                            "Invalid artifact URL '{}' in {}: {}",
                            target, url, e
                        ))
                    })?;
                    release.url = Some(joined.to_string());
                }
                Ok(release)
            })
            .collect()
    }
}
