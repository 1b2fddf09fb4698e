//! In-memory implementations of the service traits for testing
//!
//! Every mock counts the calls it receives so tests can assert on network
//! traffic (idempotence, single download under contention, offline mode).

use super::traits::{ArtifactSource, ImportProbe, PackageIndex};
use crate::core::{FetchError, ProvisionResult, Tier};
use crate::fetcher::FetchRequest;
use crate::index::Release;
use crate::installer::InstalledMarker;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Mock available-artifact index
///
/// # Example
///
/// ```
/// use provision::di::mocks::MockPackageIndex;
/// use provision::index::Release;
/// use provision::Version;
///
/// let index = MockPackageIndex::new("primary").remote();
/// index.add_release("pandas", Release::new(Version::parse("2.2.1").unwrap()));
/// assert_eq!(index.query_count(), 0);
/// ```
pub struct MockPackageIndex {
    label: String,
    remote: bool,
    releases: Mutex<HashMap<String, Vec<Release>>>,
    queries: AtomicUsize,
}

impl MockPackageIndex {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            remote: false,
            releases: Mutex::new(HashMap::new()),
            queries: AtomicUsize::new(0),
        }
    }

    /// Mark the index as needing network access
    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    pub fn add_release(&self, name: &str, release: Release) {
        self.releases
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(release);
    }

    /// Number of `releases` calls received
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageIndex for MockPackageIndex {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn releases(&self, name: &str) -> ProvisionResult<Vec<Release>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Failure injected into the next calls of a [`MockArtifactSource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBehavior {
    /// Fail with `FetchError::Transient`
    Transient,
    /// Never answer; the caller's timeout has to fire
    Hang,
}

#[derive(Default)]
struct SourceState {
    artifacts: HashMap<(String, String), Vec<u8>>,
    failures: HashMap<String, VecDeque<SourceBehavior>>,
    attempts: HashMap<String, u32>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Mock artifact source keyed by (name, version)
///
/// # Example
///
/// ```
/// use provision::di::mocks::{MockArtifactSource, SourceBehavior};
///
/// let source = MockArtifactSource::new("primary").remote();
/// source.add_artifact("pandas", "2.2.1", b"bytes".to_vec());
/// source.fail_next("pandas", SourceBehavior::Transient, 2);
/// assert_eq!(source.download_count(), 0);
/// ```
pub struct MockArtifactSource {
    label: String,
    remote: bool,
    delay: Mutex<Duration>,
    state: Mutex<SourceState>,
    downloads: AtomicUsize,
}

impl MockArtifactSource {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            remote: false,
            delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(SourceState::default()),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// Serve `bytes` for (name, version), replacing anything served before
    pub fn add_artifact(&self, name: &str, version: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .artifacts
            .insert((name.to_string(), version.to_string()), bytes);
    }

    /// Make the next `count` calls for `name` misbehave
    pub fn fail_next(&self, name: &str, behavior: SourceBehavior, count: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.failures.entry(name.to_string()).or_default();
        queue.extend(std::iter::repeat(behavior).take(count));
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Calls received for `name`, successful or not
    pub fn attempts(&self, name: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Calls that delivered bytes
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn leave(&self) {
        self.state.lock().unwrap().in_flight -= 1;
    }
}

#[async_trait]
impl ArtifactSource for MockArtifactSource {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Option<Vec<u8>>, FetchError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            *state.attempts.entry(request.name.clone()).or_insert(0) += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state
                .failures
                .get_mut(&request.name)
                .and_then(|queue| queue.pop_front())
        };

        // Dropped with the future when the caller's timeout fires
        struct InFlight<'a>(&'a MockArtifactSource);
        impl Drop for InFlight<'_> {
            fn drop(&mut self) {
                self.0.leave();
            }
        }
        let _guard = InFlight(self);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match behavior {
            Some(SourceBehavior::Transient) => {
                return Err(FetchError::Transient {
                    origin: self.label.clone(),
                    message: "connection reset by peer".to_string(),
                })
            }
            Some(SourceBehavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            None => {}
        }

        let bytes = self
            .state
            .lock()
            .unwrap()
            .artifacts
            .get(&(request.name.clone(), request.version.to_string()))
            .cloned();
        if bytes.is_some() {
            self.downloads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(bytes)
    }
}

/// Mock import probe: passes everything except packages told to fail
#[derive(Default)]
pub struct MockImportProbe {
    failures: Mutex<HashMap<String, String>>,
    probed: Mutex<Vec<(Tier, String)>>,
}

impl MockImportProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, name: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), message.to_string());
    }

    pub fn probe_count(&self) -> usize {
        self.probed.lock().unwrap().len()
    }

    /// (tier, package) pairs in the order they were probed
    pub fn probed(&self) -> Vec<(Tier, String)> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImportProbe for MockImportProbe {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn probe(
        &self,
        tier: Tier,
        marker: &InstalledMarker,
        _lookup_path: &[PathBuf],
    ) -> Result<(), String> {
        self.probed
            .lock()
            .unwrap()
            .push((tier, marker.name.clone()));
        match self.failures.lock().unwrap().get(&marker.name) {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }
}
