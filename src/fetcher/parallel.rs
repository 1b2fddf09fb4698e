use crate::cache::{ArtifactCache, ArtifactRecord};
use crate::core::{ProvisionError, ProvisionResult};
use crate::fetcher::Fetcher;
use crate::resolver::ResolvedPackage;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Runs a tier's fetch stage: every resolved package is ensured in the cache
/// by a bounded pool of workers.
pub struct ParallelFetcher {
    cache: ArtifactCache,
    fetcher: Arc<Fetcher>,
    max_concurrent: usize,
    show_progress: bool,
}

impl ParallelFetcher {
    pub fn new(cache: ArtifactCache, fetcher: Arc<Fetcher>, max_concurrent: usize) -> Self {
        Self {
            cache,
            fetcher,
            max_concurrent: max_concurrent.max(1),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Ensure every package, returning records in input order.
    ///
    /// In-flight fetches always run to completion; if any failed, the first
    /// failure in input order is returned.
    pub async fn fetch_all(
        &self,
        packages: &[ResolvedPackage],
    ) -> ProvisionResult<Vec<ArtifactRecord>> {
        let progress = if self.show_progress && !packages.is_empty() {
            let pb = ProgressBar::new(packages.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let mut results: Vec<Option<ProvisionResult<ArtifactRecord>>> =
            (0..packages.len()).map(|_| None).collect();
        let mut join_set = JoinSet::new();

        for (position, package) in packages.iter().enumerate() {
            if join_set.len() >= self.max_concurrent {
                // Wait for one task to complete before adding another
                if let Some(joined) = join_set.join_next().await {
                    Self::collect(joined, &mut results, progress.as_ref());
                }
            }

            let cache = self.cache.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let package = package.clone();
            join_set.spawn(async move {
                let result = cache.ensure(&package, &fetcher).await;
                (position, package.name, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            Self::collect(joined, &mut results, progress.as_ref());
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        let mut records = Vec::with_capacity(packages.len());
        for result in results {
            match result {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProvisionError::Cache(
                        "fetch worker ended without a result".to_string(),
                    ))
                }
            }
        }
        Ok(records)
    }

    fn collect(
        joined: Result<(usize, String, ProvisionResult<ArtifactRecord>), tokio::task::JoinError>,
        results: &mut [Option<ProvisionResult<ArtifactRecord>>],
        progress: Option<&ProgressBar>,
    ) {
        // A panicked worker leaves its slot empty and is reported above
        if let Ok((position, name, result)) = joined {
            if let Some(pb) = progress {
                pb.set_message(name);
                pb.inc(1);
            }
            results[position] = Some(result);
        }
    }
}
