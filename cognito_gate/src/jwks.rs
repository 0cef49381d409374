//! A locally cached, periodically refreshed JSON Web Key Set (JWKS)

use std::{
    error, fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use aliri::{jwa, jwk, Jwk, Jwks};
use aliri_clock::{Clock, System, UnixTime};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};

use crate::UserPoolConfig;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORTEST_PERIOD: Duration = Duration::from_secs(1);

/// A failure to obtain a usable key set from a [`JwksSource`]
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request could not be sent or the response could not be read
    #[error("unable to reach JWKS endpoint")]
    Transport(#[from] reqwest::Error),
    /// The endpoint answered with an unexpected status code
    #[error("JWKS endpoint returned status {0}")]
    Status(u16),
    /// The response was not a JSON Web Key Set
    #[error("malformed JWKS document")]
    Malformed(#[from] serde_json::Error),
    /// The document held no keys usable for verifying signatures
    #[error("JWKS contains no usable keys")]
    EmptyKeySet,
    /// Any other failure reported by a custom source
    #[error(transparent)]
    Custom(Box<dyn error::Error + Send + Sync + 'static>),
}

/// The initial key set could not be fetched
///
/// Nothing can be verified without a key set, so this is fatal to the
/// component being constructed.
#[derive(Debug, Error)]
#[error("JWKS unavailable from {url}")]
pub struct KeySetUnavailable {
    url: String,
    #[source]
    source: FetchError,
}

impl KeySetUnavailable {
    /// The key set location that was being fetched
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A refresh of an already initialized key set failed
///
/// The previously cached keys remain in use.
#[derive(Debug, Error)]
#[error("JWKS refresh from {url} failed")]
pub struct RefreshFailed {
    url: String,
    #[source]
    source: FetchError,
}

impl RefreshFailed {
    /// The underlying cause
    pub fn cause(&self) -> &FetchError {
        &self.source
    }
}

/// HTTP cache validators of the response a key set was read from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheValidators {
    /// The `ETag` response header
    pub etag: Option<String>,
    /// The `Last-Modified` response header
    pub last_modified: Option<String>,
}

/// The outcome of a successful fetch
#[derive(Debug)]
pub enum Fetched {
    /// The keys have not changed since the response described by the
    /// validators passed to [`JwksSource::fetch`]
    NotModified,
    /// A new key set
    Keys {
        /// The keys
        jwks: Jwks,
        /// Validators to send with the next fetch
        validators: CacheValidators,
    },
}

/// A place key sets can be fetched from
#[async_trait]
pub trait JwksSource: fmt::Debug + Send + Sync {
    /// A human-readable location, used in logs and errors
    fn location(&self) -> &str;

    /// Fetches the current key set
    ///
    /// Sources that understand conditional requests should answer
    /// [`Fetched::NotModified`] when `validators` still describe the
    /// current keys.
    async fn fetch(&self, validators: &CacheValidators) -> Result<Fetched, FetchError>;
}

/// A fixed key set, for tests and deployments that pin their keys
#[async_trait]
impl JwksSource for Jwks {
    fn location(&self) -> &str {
        "static"
    }

    async fn fetch(&self, _: &CacheValidators) -> Result<Fetched, FetchError> {
        Ok(Fetched::Keys {
            jwks: self.clone(),
            validators: CacheValidators::default(),
        })
    }
}

/// A key set published at an HTTP(S) URL
#[derive(Debug, Clone)]
pub struct RemoteJwks {
    url: String,
    client: Client,
}

impl RemoteJwks {
    /// Fetches from `url`, giving up on any request after `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("cognito_gate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self::with_client(url, client))
    }

    /// Fetches from `url` using an existing client
    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl JwksSource for RemoteJwks {
    fn location(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, validators: &CacheValidators) -> Result<Fetched, FetchError> {
        let mut request = self.client.get(&self.url);

        if let Some(etag) = &validators.etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        } else if let Some(last_modified) = &validators.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        } else if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let header_str = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        };
        let validators = CacheValidators {
            etag: header_str(header::ETAG),
            last_modified: header_str(header::LAST_MODIFIED),
        };

        let body = response.bytes().await?;
        let jwks: Jwks = serde_json::from_slice(&body)?;

        Ok(Fetched::Keys { jwks, validators })
    }
}

/// An immutable snapshot of the trusted signing keys
#[derive(Debug, Clone)]
pub struct KeySet {
    jwks: Jwks,
    source: String,
    refreshed_at: UnixTime,
    validators: CacheValidators,
}

impl KeySet {
    /// A key set read from `source` just now
    pub fn new(source: impl Into<String>, jwks: Jwks) -> Self {
        Self {
            jwks,
            source: source.into(),
            refreshed_at: System.now(),
            validators: CacheValidators::default(),
        }
    }

    /// The keys in this set
    pub fn jwks(&self) -> &Jwks {
        &self.jwks
    }

    /// Where the keys were fetched from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// When the keys were fetched
    pub fn refreshed_at(&self) -> UnixTime {
        self.refreshed_at
    }

    /// The number of usable keys
    pub fn len(&self) -> usize {
        self.jwks.keys().len()
    }

    /// Whether the set holds no usable keys
    pub fn is_empty(&self) -> bool {
        self.jwks.keys().is_empty()
    }

    /// Selects the key a token names by `kid`, compatible with `alg`
    ///
    /// A key without an id is only chosen when the token has no `kid`.
    pub fn get_key(&self, kid: Option<&jwk::KeyIdRef>, alg: jwa::Algorithm) -> Option<&Jwk> {
        self.jwks.get_key_by_opt(kid, alg)
    }
}

struct Inner {
    current: ArcSwap<KeySet>,
    source: Box<dyn JwksSource>,
    min_refresh_interval: Duration,
    epoch: Instant,
    last_attempt_ms: AtomicU64,
    refreshing: AtomicBool,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeySetCache")
            .field("source", &self.source)
            .field("keys", &self.current.load().len())
            .field("min_refresh_interval", &self.min_refresh_interval)
            .finish()
    }
}

/// The process's copy of one user pool's signing keys
///
/// Cloning is cheap; all clones share the same keys. Reads never block:
/// a refresh publishes a complete new [`KeySet`] in one atomic swap, so a
/// reader sees either the old or the new set, never a mix.
#[derive(Debug, Clone)]
#[must_use]
pub struct KeySetCache {
    inner: Arc<Inner>,
}

impl KeySetCache {
    /// Fetches the key set at `url` and caches it
    ///
    /// Refreshes are attempted no more often than `min_refresh_interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable or returns something
    /// other than a non-empty key set.
    pub async fn initialize(
        url: impl Into<String>,
        min_refresh_interval: Duration,
    ) -> Result<Self, KeySetUnavailable> {
        let url = url.into();
        let source = RemoteJwks::new(url.clone(), DEFAULT_REQUEST_TIMEOUT)
            .map_err(|source| KeySetUnavailable { url, source })?;

        Self::with_source(source, min_refresh_interval).await
    }

    /// Fetches the key set of the configured user pool and caches it
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be fetched.
    pub async fn from_config(config: &UserPoolConfig) -> Result<Self, KeySetUnavailable> {
        let url = config.jwks_url();
        let source = RemoteJwks::new(url.clone(), config.request_timeout)
            .map_err(|source| KeySetUnavailable { url, source })?;

        Self::with_source(source, config.min_refresh_interval).await
    }

    /// Fetches from an arbitrary source and caches the result
    ///
    /// A `min_refresh_interval` shorter than one second is raised to one
    /// second.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails or yields no usable keys.
    pub async fn with_source<S>(
        source: S,
        min_refresh_interval: Duration,
    ) -> Result<Self, KeySetUnavailable>
    where
        S: JwksSource + 'static,
    {
        let url = source.location().to_owned();

        let key_set = match source.fetch(&CacheValidators::default()).await {
            Ok(Fetched::Keys { jwks, validators }) if !jwks.keys().is_empty() => KeySet {
                validators,
                ..KeySet::new(url.clone(), jwks)
            },
            Ok(Fetched::Keys { .. }) => {
                return Err(KeySetUnavailable {
                    url,
                    source: FetchError::EmptyKeySet,
                })
            }
            Ok(Fetched::NotModified) => {
                return Err(KeySetUnavailable {
                    url,
                    source: FetchError::Status(StatusCode::NOT_MODIFIED.as_u16()),
                })
            }
            Err(source) => {
                let error: &dyn error::Error = &source;
                tracing::error!(jwks.url = %url, error, "unable to load initial JWKS");
                return Err(KeySetUnavailable { url, source });
            }
        };

        tracing::info!(jwks.url = %url, jwks.keys = key_set.len(), "JWKS loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                current: ArcSwap::from_pointee(key_set),
                source: Box::new(source),
                min_refresh_interval: min_refresh_interval.max(SHORTEST_PERIOD),
                epoch: Instant::now(),
                last_attempt_ms: AtomicU64::new(0),
                refreshing: AtomicBool::new(false),
            }),
        })
    }

    /// The minimum time between two refresh attempts
    pub fn min_refresh_interval(&self) -> Duration {
        self.inner.min_refresh_interval
    }

    /// The most recently fetched key set
    ///
    /// If the minimum refresh interval has passed since the last attempt, a
    /// refresh is started in the background; this call still returns the
    /// current keys immediately.
    pub fn current_key_set(&self) -> Arc<KeySet> {
        if self.refresh_due() {
            self.refresh_in_background();
        }

        self.inner.current.load_full()
    }

    /// Replaces the cached keys with a locally supplied set
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the current keys in place, if `jwks` is empty.
    pub fn set_key_set(&self, jwks: Jwks) -> Result<(), RefreshFailed> {
        if jwks.keys().is_empty() {
            return Err(self.refresh_failed(FetchError::EmptyKeySet));
        }

        self.inner
            .current
            .store(Arc::new(KeySet::new(self.inner.source.location(), jwks)));
        Ok(())
    }

    /// Refreshes the key set from its source
    ///
    /// No retries are attempted. On failure the cached keys are left as
    /// they were and remain in use.
    #[tracing::instrument(skip(self), fields(jwks.url = %self.inner.source.location()))]
    pub async fn refresh(&self) -> Result<(), RefreshFailed> {
        self.inner
            .last_attempt_ms
            .store(self.elapsed_ms(), Ordering::Release);

        tracing::debug!("refreshing JWKS");
        let validators = self.inner.current.load().validators.clone();

        match self.inner.source.fetch(&validators).await {
            Ok(Fetched::NotModified) => {
                let now = System.now();
                self.inner.current.rcu(|current| KeySet {
                    refreshed_at: now,
                    ..KeySet::clone(current)
                });
                tracing::debug!("JWKS not modified");
                Ok(())
            }
            Ok(Fetched::Keys { jwks, validators }) if !jwks.keys().is_empty() => {
                let key_set = KeySet {
                    validators,
                    ..KeySet::new(self.inner.source.location(), jwks)
                };
                let keys = key_set.len();
                self.inner.current.store(Arc::new(key_set));
                tracing::info!(jwks.keys = keys, "JWKS refreshed");
                Ok(())
            }
            Ok(Fetched::Keys { .. }) => {
                tracing::warn!("JWKS refresh failed; document held no usable keys");
                Err(self.refresh_failed(FetchError::EmptyKeySet))
            }
            Err(err) => {
                let error: &dyn error::Error = &err;
                tracing::warn!(error, "JWKS refresh failed; keeping cached keys");
                Err(self.refresh_failed(err))
            }
        }
    }

    /// Starts a task that refreshes the key set every minimum refresh interval
    ///
    /// The task runs until the returned handle is cancelled or dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn_refresh(&self) -> RefreshTask {
        let this = self.clone();
        let period = self.inner.min_refresh_interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                timer.tick().await;
                // Failures are logged by `refresh`; the cached keys stay in use
                let _ = this.refresh().await;
            }
        });

        RefreshTask {
            handle: Some(handle),
        }
    }

    fn refresh_due(&self) -> bool {
        let last = self.inner.last_attempt_ms.load(Ordering::Acquire);
        let interval =
            u64::try_from(self.inner.min_refresh_interval.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms().saturating_sub(last) >= interval
    }

    fn refresh_in_background(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::trace!("no async runtime available; skipping background JWKS refresh");
            return;
        };

        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let in_flight = InFlight(Arc::clone(&self.inner));
        let this = self.clone();
        runtime.spawn(async move {
            let _in_flight = in_flight;
            let _ = this.refresh().await;
        });
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.inner.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn refresh_failed(&self, source: FetchError) -> RefreshFailed {
        RefreshFailed {
            url: self.inner.source.location().to_owned(),
            source,
        }
    }
}

/// Clears the in-flight flag however the background refresh ends
struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
    }
}

/// Handle to a periodic key set refresh task
///
/// Dropping the handle cancels the task. Use [`detach`](Self::detach) to let
/// it run for the life of the runtime.
#[derive(Debug)]
#[must_use = "the refresh task is cancelled when this handle is dropped"]
pub struct RefreshTask {
    handle: Option<JoinHandle<()>>,
}

impl RefreshTask {
    /// Stops refreshing
    ///
    /// The key set cache keeps serving the last keys it fetched.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Lets the task run until the runtime shuts down
    pub fn detach(mut self) {
        self.handle.take();
    }

    /// Whether the task has stopped
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::{atomic::AtomicUsize, Mutex},
    };

    use aliri::jwt::{self, CoreHeaders, HasAlgorithm};
    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };
    use color_eyre::Result;
    use tracing_test::traced_test;

    use super::*;
    use crate::test;

    #[derive(Debug, Default)]
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Fetched, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: impl IntoIterator<Item = Result<Fetched, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JwksSource for Arc<ScriptedSource> {
        fn location(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, _: &CacheValidators) -> Result<Fetched, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Status(503)))
        }
    }

    fn keys(jwks: Jwks) -> Result<Fetched, FetchError> {
        Ok(Fetched::Keys {
            jwks,
            validators: CacheValidators::default(),
        })
    }

    fn has_key(cache: &KeySetCache, kid: &str) -> bool {
        cache
            .inner
            .current
            .load()
            .get_key(Some(jwk::KeyIdRef::from_str(kid)), jwa::Algorithm::HS256)
            .is_some()
    }

    #[tokio::test]
    async fn initializes_from_static_keys() -> Result<()> {
        let cache = KeySetCache::with_source(test::jwks(), Duration::from_secs(900)).await?;

        let key_set = cache.current_key_set();
        assert_eq!(key_set.len(), 1);
        assert_eq!(key_set.source(), "static");
        assert!(has_key(&cache, test::KEY_ID));
        Ok(())
    }

    #[tokio::test]
    async fn empty_key_set_is_unavailable() {
        let err = KeySetCache::with_source(Jwks::default(), Duration::from_secs(900))
            .await
            .unwrap_err();

        assert!(matches!(err.source, FetchError::EmptyKeySet));
    }

    #[tokio::test]
    #[traced_test]
    async fn unreachable_source_is_unavailable() {
        let source = ScriptedSource::new([Err(FetchError::Status(500))]);

        let err = KeySetCache::with_source(source, Duration::from_secs(900))
            .await
            .unwrap_err();

        assert_eq!(err.url(), "scripted");
        assert!(matches!(err.source, FetchError::Status(500)));
        assert!(logs_contain("unable to load initial JWKS"));
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_refresh_keeps_previous_keys() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks()), Err(FetchError::Status(503))]);
        let cache = KeySetCache::with_source(source.clone(), Duration::from_secs(900)).await?;

        let err = cache.refresh().await.unwrap_err();

        assert!(matches!(err.cause(), FetchError::Status(503)));
        assert!(has_key(&cache, test::KEY_ID));
        assert_eq!(source.calls(), 2);
        assert!(logs_contain("JWKS refresh failed"));
        Ok(())
    }

    #[tokio::test]
    async fn refresh_to_empty_set_keeps_previous_keys() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks()), keys(Jwks::default())]);
        let cache = KeySetCache::with_source(source, Duration::from_secs(900)).await?;

        let err = cache.refresh().await.unwrap_err();

        assert!(matches!(err.cause(), FetchError::EmptyKeySet));
        assert!(has_key(&cache, test::KEY_ID));
        Ok(())
    }

    #[tokio::test]
    async fn successful_refresh_replaces_keys_wholesale() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks()), keys(test::jwks_of([test::other_key()]))]);
        let cache = KeySetCache::with_source(source, Duration::from_secs(900)).await?;
        let before = cache.current_key_set();

        cache.refresh().await?;

        assert!(!has_key(&cache, test::KEY_ID));
        assert!(has_key(&cache, test::OTHER_KEY_ID));
        // Snapshots taken before the swap are unaffected
        assert_eq!(before.len(), 1);
        assert!(before
            .get_key(Some(jwk::KeyIdRef::from_str(test::KEY_ID)), jwa::Algorithm::HS256)
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn not_modified_keeps_keys() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks()), Ok(Fetched::NotModified)]);
        let cache = KeySetCache::with_source(source, Duration::from_secs(900)).await?;

        cache.refresh().await?;

        assert!(has_key(&cache, test::KEY_ID));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn access_triggers_refresh_only_after_minimum_interval() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks()), keys(test::jwks_of([test::other_key()]))]);
        let cache = KeySetCache::with_source(source.clone(), Duration::from_secs(60)).await?;

        let _ = cache.current_key_set();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;

        let stale = cache.current_key_set();
        assert!(stale
            .get_key(Some(jwk::KeyIdRef::from_str(test::KEY_ID)), jwa::Algorithm::HS256)
            .is_some());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);
        assert!(has_key(&cache, test::OTHER_KEY_ID));

        let _ = cache.current_key_set();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_background_refresh_is_rate_limited() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks())]);
        let cache = KeySetCache::with_source(source.clone(), Duration::from_secs(60)).await?;

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = cache.current_key_set();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);

        for _ in 0..10 {
            let _ = cache.current_key_set();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(source.calls(), 2);
        assert!(has_key(&cache, test::KEY_ID));
        Ok(())
    }

    #[derive(Debug, Default)]
    struct PanicsOnFirstRefresh {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JwksSource for Arc<PanicsOnFirstRefresh> {
        fn location(&self) -> &str {
            "panicking"
        }

        async fn fetch(&self, _: &CacheValidators) -> Result<Fetched, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("key source blew up");
            }
            keys(test::jwks_of([test::other_key()]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_background_refresh_does_not_block_later_ones() -> Result<()> {
        let source = Arc::new(PanicsOnFirstRefresh::default());
        let cache = KeySetCache::with_source(source.clone(), Duration::from_secs(60)).await?;

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = cache.current_key_set();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(!cache.inner.refreshing.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = cache.current_key_set();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_one_second() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks()), keys(test::jwks())]);
        let cache = KeySetCache::with_source(source.clone(), Duration::ZERO).await?;

        assert_eq!(cache.min_refresh_interval(), Duration::from_secs(1));
        for _ in 0..10 {
            let _ = cache.current_key_set();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let _ = cache.current_key_set();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_refreshes_until_cancelled() -> Result<()> {
        let source = ScriptedSource::new([
            keys(test::jwks()),
            keys(test::jwks_of([test::other_key()])),
            keys(test::jwks()),
        ]);
        let cache = KeySetCache::with_source(source.clone(), Duration::from_secs(60)).await?;

        let task = cache.spawn_refresh();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(source.calls(), 2);
        assert!(has_key(&cache, test::OTHER_KEY_ID));

        task.cancel();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(source.calls(), 2);
        assert!(has_key(&cache, test::OTHER_KEY_ID));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_task_handle_stops_refreshing() -> Result<()> {
        let source = ScriptedSource::new([keys(test::jwks())]);
        let cache = KeySetCache::with_source(source.clone(), Duration::from_secs(60)).await?;

        drop(cache.spawn_refresh());
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(source.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn set_key_set_rejects_empty_set() -> Result<()> {
        let cache = KeySetCache::with_source(test::jwks(), Duration::from_secs(900)).await?;

        assert!(cache.set_key_set(Jwks::default()).is_err());
        assert!(has_key(&cache, test::KEY_ID));

        cache.set_key_set(test::jwks_of([test::other_key()]))?;
        assert!(has_key(&cache, test::OTHER_KEY_ID));
        Ok(())
    }

    #[test]
    fn key_lookup_follows_token_kid() -> Result<()> {
        let key_set = KeySet::new("memory", test::jwks_of([test::key(), test::other_key()]));
        let token = test::sign_with(&test::other_key(), &test::access_claims(&[]));
        let decomposed: jwt::Decomposed = token.decompose()?;

        let key = key_set
            .get_key(decomposed.kid(), decomposed.alg())
            .and_then(Jwk::key_id);

        assert_eq!(key.map(|k| k.as_str()), Some(test::OTHER_KEY_ID));
        Ok(())
    }

    struct JwksServer {
        body: String,
        requests: AtomicUsize,
        fail: AtomicBool,
    }

    const ETAG: &str = "\"v1\"";

    async fn serve_jwks(State(server): State<Arc<JwksServer>>, headers: HeaderMap) -> Response {
        server.requests.fetch_add(1, Ordering::SeqCst);

        if server.fail.load(Ordering::SeqCst) {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let if_none_match = headers
            .get(header::IF_NONE_MATCH.as_str())
            .and_then(|v| v.to_str().ok());
        if if_none_match == Some(ETAG) {
            return StatusCode::NOT_MODIFIED.into_response();
        }

        (StatusCode::OK, [("etag", ETAG)], server.body.clone()).into_response()
    }

    async fn spawn_server(body: String) -> Result<(SocketAddr, Arc<JwksServer>)> {
        let server = Arc::new(JwksServer {
            body,
            requests: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/.well-known/jwks.json", get(serve_jwks))
            .with_state(server.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });

        Ok((addr, server))
    }

    #[tokio::test]
    async fn fetches_remote_jwks_and_revalidates_with_etag() -> Result<()> {
        let (addr, server) = spawn_server(serde_json::to_string(&test::jwks())?).await?;
        let url = format!("http://{addr}/.well-known/jwks.json");

        let cache = KeySetCache::initialize(url, Duration::from_secs(900)).await?;
        assert!(has_key(&cache, test::KEY_ID));
        assert_eq!(
            cache.inner.current.load().validators.etag.as_deref(),
            Some(ETAG)
        );

        cache.refresh().await?;
        assert_eq!(server.requests.load(Ordering::SeqCst), 2);
        assert!(has_key(&cache, test::KEY_ID));

        server.fail.store(true, Ordering::SeqCst);
        assert!(cache.refresh().await.is_err());
        assert!(has_key(&cache, test::KEY_ID));
        Ok(())
    }

    #[tokio::test]
    async fn remote_garbage_is_malformed() -> Result<()> {
        let (addr, _) = spawn_server("<html>not a key set</html>".to_owned()).await?;
        let config = UserPoolConfig::new("eu-west-1", "eu-west-1_test")
            .with_jwks_url(format!("http://{addr}/.well-known/jwks.json"));

        let err = KeySetCache::from_config(&config).await.unwrap_err();

        assert!(matches!(err.source, FetchError::Malformed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn remote_error_status_is_unavailable() -> Result<()> {
        let (addr, _) = spawn_server(String::new()).await?;

        let err = KeySetCache::initialize(format!("http://{addr}/missing"), Duration::from_secs(900))
            .await
            .unwrap_err();

        assert!(matches!(err.source, FetchError::Status(404)));
        Ok(())
    }
}
