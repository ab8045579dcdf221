// Update detector: heuristics over cached, budgeted registry lookups.
// Expected failure modes never surface as errors; they come back as stale results.

mod budget;
mod heuristics;

pub use budget::RateBudget;
pub use heuristics::{available_version, decide, newer_tag, parse_version};

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache_repo::CacheRepo;
use crate::models::{EndpointId, ImageRef, UpdateCheck, UpdateCheckEntry, UpdateSource};
use crate::remote::RemoteClient;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub cache_ttl: Duration,
    pub max_checks: u32,
    pub window: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::hours(6),
            max_checks: 50,
            window: Duration::hours(6),
        }
    }
}

#[derive(Debug, Default)]
pub struct DetectorStats {
    pub registry_calls: AtomicU64,
    /// Checks answered from stale data because the budget was exhausted.
    pub budget_fallbacks: AtomicU64,
}

/// Budget and cache of one endpoint.
struct EndpointState {
    budget: Mutex<RateBudget>,
    cache: Mutex<HashMap<String, UpdateCheckEntry>>,
}

pub struct UpdateDetector {
    client: Arc<dyn RemoteClient>,
    config: DetectorConfig,
    endpoints: RwLock<HashMap<EndpointId, Arc<EndpointState>>>,
    repo: Option<Arc<CacheRepo>>,
    stats: DetectorStats,
}

impl UpdateDetector {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        config: DetectorConfig,
        repo: Option<Arc<CacheRepo>>,
    ) -> Self {
        Self {
            client,
            config,
            endpoints: RwLock::new(HashMap::new()),
            repo,
            stats: DetectorStats::default(),
        }
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    fn state(&self, endpoint: EndpointId) -> Arc<EndpointState> {
        if let Some(state) = self
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&endpoint)
        {
            return Arc::clone(state);
        }
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(endpoints.entry(endpoint).or_insert_with(|| {
            Arc::new(EndpointState {
                budget: Mutex::new(RateBudget::new(self.config.max_checks, self.config.window)),
                cache: Mutex::new(HashMap::new()),
            })
        }))
    }

    /// Registry calls counted in the endpoint's current window.
    pub fn budget_used(&self, endpoint: EndpointId) -> u32 {
        self.budget_used_at(endpoint, Utc::now())
    }

    pub fn budget_used_at(&self, endpoint: EndpointId, now: DateTime<Utc>) -> u32 {
        let Some(state) = self
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&endpoint)
            .cloned()
        else {
            return 0;
        };
        state.budget.lock().unwrap_or_else(|e| e.into_inner()).used(now)
    }

    pub fn budget_remaining(&self, endpoint: EndpointId) -> u32 {
        self.config
            .max_checks
            .saturating_sub(self.budget_used(endpoint))
    }

    pub fn cached(&self, endpoint: EndpointId, image: &ImageRef) -> Option<UpdateCheckEntry> {
        let state = self
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&endpoint)
            .cloned()?;
        state
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&image.name_with_tag())
            .cloned()
    }

    pub async fn check_update(
        &self,
        endpoint: EndpointId,
        image: &ImageRef,
        container_created: Option<DateTime<Utc>>,
    ) -> UpdateCheck {
        self.check_update_at(endpoint, image, container_created, Utc::now())
            .await
    }

    /// Decide whether `image` likely has a newer version, as of `now`.
    ///
    /// A `latest` tag short-circuits without touching cache or budget, and so does a reference
    /// pinned by digest only (it cannot move). Otherwise a fresh cache entry is served as-is;
    /// past its TTL one budget unit is spent on a registry call. With the budget exhausted the
    /// expired entry (or "unknown") is returned flagged stale.
    pub async fn check_update_at(
        &self,
        endpoint: EndpointId,
        image: &ImageRef,
        container_created: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> UpdateCheck {
        let mut check = self
            .lookup(endpoint, image, container_created, now)
            .await;
        check.current_version = image.version_label();
        check
    }

    /// Drop the cached decision for `image`, e.g. after it was pulled.
    pub fn forget(&self, endpoint: EndpointId, image: &ImageRef) {
        if let Some(state) = self
            .endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&endpoint)
        {
            state
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&image.name_with_tag());
        }
    }

    async fn lookup(
        &self,
        endpoint: EndpointId,
        image: &ImageRef,
        container_created: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> UpdateCheck {
        if image.is_latest() || image.is_digest_pinned() {
            let pinned = image.is_digest_pinned();
            return UpdateCheck {
                available: !pinned,
                stale: false,
                source: if pinned {
                    UpdateSource::NoSignal
                } else {
                    UpdateSource::LatestTag
                },
                checked_at: Some(now),
                current_version: None,
                available_version: None,
            };
        }

        let key = image.name_with_tag();
        let state = self.state(endpoint);
        let cached = state
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        if let Some(entry) = &cached
            && entry.is_fresh(now)
        {
            return entry.to_check(false);
        }

        let acquired = state
            .budget
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_acquire(now);
        if !acquired {
            self.stats.budget_fallbacks.fetch_add(1, Ordering::Relaxed);
            debug!(
                endpoint_id = endpoint,
                image = %key,
                "registry budget exhausted, serving stale result"
            );
            return cached
                .map(|e| e.to_check(true))
                .unwrap_or_else(UpdateCheck::stale_unknown);
        }
        self.stats.registry_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(repo) = &self.repo
            && let Err(e) = repo.record_budget_use(endpoint, now).await
        {
            warn!(error = %e, operation = "record_budget_use", "failed to persist budget use");
        }

        let expires_at = now + self.config.cache_ttl;
        let entry = match self.client.get_image_metadata(endpoint, image).await {
            Ok(meta) => {
                let (available, source) = decide(image, &meta, container_created);
                debug!(endpoint_id = endpoint, image = %key, available, source = source.as_str(), "update check");
                UpdateCheckEntry {
                    image: key.clone(),
                    checked_at: now,
                    expires_at,
                    available,
                    source,
                    last_error: None,
                    available_version: available_version(image, &meta, source),
                }
            }
            Err(e) => {
                warn!(
                    endpoint_id = endpoint,
                    image = %key,
                    error = %e,
                    operation = "get_image_metadata",
                    "registry lookup failed; not retrying before the cache entry expires"
                );
                let (available, source, available_version) = cached
                    .map(|prev| (prev.available, prev.source, prev.available_version))
                    .unwrap_or((false, UpdateSource::Unchecked, None));
                UpdateCheckEntry {
                    image: key.clone(),
                    checked_at: now,
                    expires_at,
                    available,
                    source,
                    last_error: Some(e.to_string()),
                    available_version,
                }
            }
        };

        state
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry.clone());
        if let Some(repo) = &self.repo
            && let Err(e) = repo.save_entry(endpoint, &entry).await
        {
            warn!(error = %e, operation = "save_entry", "failed to persist update check");
        }
        entry.to_check(false)
    }

    /// Load persisted cache entries and the budget window.
    pub async fn restore(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let Some(repo) = &self.repo else {
            return Ok(());
        };
        let entries = repo.load_entries().await?;
        let usage = repo.load_budget_usage(now - self.config.window).await?;
        let (n_entries, n_usage) = (entries.len(), usage.len());

        for (endpoint, entry) in entries {
            self.state(endpoint)
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(entry.image.clone(), entry);
        }
        let mut by_endpoint: HashMap<EndpointId, Vec<DateTime<Utc>>> = HashMap::new();
        for (endpoint, at) in usage {
            by_endpoint.entry(endpoint).or_default().push(at);
        }
        for (endpoint, times) in by_endpoint {
            self.state(endpoint)
                .budget
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .restore(times, now);
        }
        info!(
            cache_entries = n_entries,
            budget_units = n_usage,
            "restored update-check state"
        );
        Ok(())
    }

    /// Drop persisted budget rows that left the window.
    pub async fn prune_persisted(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        match &self.repo {
            Some(repo) => repo.prune_budget_usage(now - self.config.window).await,
            None => Ok(0),
        }
    }
}
