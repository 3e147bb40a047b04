//! End-to-end calculation flow.
//!
//! ```text
//! calculate(request)
//!   ├─ rate limit (when configured)
//!   ├─ mutation? ─▶ validate ─▶ pool.get ─▶ version check ─▶ write cells ─▶ bump
//!   ├─ fingerprint(service@generation, inputs)
//!   ├─ cache.lookup ── hit ──▶ return cached outputs
//!   └─ miss ─▶ pool.get ─▶ instance.apply ─▶ cache.store ─▶ return outputs
//! ```
//!
//! Every accepted mutation bumps a per-service generation that is folded
//! into the fingerprint, so results computed before a write are never
//! served after it. Versions move only after the engine accepted the write;
//! a failed write leaves them where they were.
//!
//! Version keys:
//!
//! | Key | Counts |
//! |-----|--------|
//! | `area:{service_id}:{area}` | writes to one area |
//! | `generation:{service_id}` | writes to any area of the service |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use calcplane_storage::{BlobStore, KvStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{CacheTier, ResultCache},
    compute::{ComputeInstance, ComputeProvider, Values},
    config::{ControlPlaneConfig, RateLimitConfig},
    error::{ConfigError, ControlError, Result},
    fingerprint::{Fingerprint, fingerprint},
    mutex::ResourceMutexRegistry,
    pool::InstancePool,
    rate_limit::{RateLimiter, StoreRateLimiter},
    validator::{CellWrite, validate_mutation},
    version::{StoreVersionMap, VersionTracker},
};

/// Cell writes to apply before calculating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Logical area name; each area of a service is versioned separately.
    pub area: String,
    /// Range the caller may write, e.g. `B2:D10`.
    pub allowed_area: String,
    /// Cells to write.
    pub cells: Vec<CellWrite>,
    /// Version the caller last observed. `None` skips the conflict check.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

/// One calculation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRequest {
    /// Resource the calculation runs against.
    pub service_id: String,
    /// Named inputs.
    #[serde(default)]
    pub inputs: Values,
    /// Optional writes applied first.
    #[serde(default)]
    pub mutation: Option<Mutation>,
}

/// Calculation outputs and provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationOutcome {
    /// Named outputs.
    pub outputs: Values,
    /// Cache key of the outputs.
    pub fingerprint: Fingerprint,
    /// Tier that served the outputs, or `None` if freshly computed.
    pub cached: Option<CacheTier>,
    /// New area version when a mutation was applied.
    pub version: Option<u64>,
}

/// Orchestrates cache, pool, validation and versioning.
pub struct CalculationService {
    provider: Arc<dyn ComputeProvider>,
    pool: InstancePool,
    cache: ResultCache,
    versions: Arc<dyn VersionTracker>,
    writers: ResourceMutexRegistry,
    limiter: Option<Arc<dyn RateLimiter>>,
    rate_limit: RateLimitConfig,
    result_ttl: Duration,
}

impl std::fmt::Debug for CalculationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationService")
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("rate_limited", &self.limiter.is_some())
            .field("result_ttl", &self.result_ttl)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl CalculationService {
    /// Assembles a service from its parts.
    ///
    /// Without a `limiter`, calculations are not rate limited and
    /// `rate_limit` is ignored.
    #[builder]
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        pool: InstancePool,
        cache: ResultCache,
        versions: Arc<dyn VersionTracker>,
        limiter: Option<Arc<dyn RateLimiter>>,
        #[builder(default)] rate_limit: RateLimitConfig,
        #[builder(default = Duration::from_secs(60 * 60))] result_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            pool,
            cache,
            versions,
            writers: ResourceMutexRegistry::new(),
            limiter,
            rate_limit,
            result_ttl,
        }
    }
}

impl CalculationService {
    /// Builds a service whose pool locks, shared cache tier, versions and
    /// rate limit counters all live in `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn from_config(
        provider: Arc<dyn ComputeProvider>,
        store: Arc<dyn KvStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        config: &ControlPlaneConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let mut cache = ResultCache::new(config.cache.clone()).with_shared(Arc::clone(&store));
        if let Some(blobs) = blobs {
            cache = cache.with_blobs(blobs);
        }
        Ok(Self::builder()
            .provider(provider)
            .pool(InstancePool::new(Arc::clone(&store), &config.pool))
            .cache(cache)
            .versions(Arc::new(StoreVersionMap::new(Arc::clone(&store))))
            .limiter(Arc::new(StoreRateLimiter::new(store)))
            .rate_limit(config.rate_limit.clone())
            .result_ttl(config.result_ttl)
            .build())
    }

    /// Runs one calculation.
    ///
    /// # Errors
    ///
    /// - [`ControlError::Validation`] if the mutation is rejected; nothing
    ///   is written
    /// - [`ControlError::RateLimitExceeded`] if the service's request budget
    ///   is spent
    /// - [`ControlError::VersionConflict`] if `expected_version` is stale
    /// - [`ControlError::ComputeFault`] if the engine fails
    /// - [`ControlError::LockTimeout`] or [`ControlError::Storage`] from
    ///   instance creation or versioning
    #[instrument(skip(self, request), fields(service_id = %request.service_id))]
    pub async fn calculate(&self, request: &CalculationRequest) -> Result<CalculationOutcome> {
        let service_id = request.service_id.as_str();

        if let Some(limiter) = &self.limiter {
            limiter
                .check(
                    &format!("calculate:{service_id}"),
                    self.rate_limit.window(),
                    self.rate_limit.max_requests(),
                )
                .await?;
        }

        let version = match &request.mutation {
            Some(mutation) => Some(self.apply_mutation(service_id, mutation).await?),
            None => None,
        };

        let generation = self.versions.current_version(&generation_key(service_id)).await?;
        let fp = fingerprint(&format!("{service_id}@{generation}"), &request.inputs);

        if version.is_none()
            && let Some(entry) = self.cache.lookup(&fp).await
        {
            match serde_json::from_slice::<Values>(&entry.payload) {
                Ok(outputs) => {
                    return Ok(CalculationOutcome {
                        outputs,
                        fingerprint: fp,
                        cached: Some(entry.tier),
                        version: None,
                    });
                },
                Err(err) => {
                    warn!(tier = %entry.tier, error = %err, "discarding undecodable cached result");
                    self.cache.invalidate(&fp).await;
                },
            }
        }

        let instance = self.instance(service_id).await?;
        let outputs = self
            .writers
            .with_lock(service_id, || async { instance.apply(&request.inputs).await })
            .await?;

        match serde_json::to_vec(&outputs) {
            Ok(payload) => self.cache.store(&fp, Bytes::from(payload), self.result_ttl).await,
            Err(err) => warn!(error = %err, "result not cacheable"),
        }

        debug!(fingerprint = %fp.short(), "calculation computed");
        Ok(CalculationOutcome { outputs, fingerprint: fp, cached: None, version })
    }

    /// Current version of one area of `service_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Storage`] if a shared version store fails.
    pub async fn area_version(&self, service_id: &str, area: &str) -> Result<u64> {
        self.versions.current_version(&area_key(service_id, area)).await
    }

    /// Drops the pooled instance for `service_id`.
    pub fn evict(&self, service_id: &str) -> bool {
        self.pool.remove(service_id)
    }

    /// Instance pool.
    #[must_use]
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Result cache.
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    async fn apply_mutation(&self, service_id: &str, mutation: &Mutation) -> Result<u64> {
        let update = validate_mutation(&mutation.cells, &mutation.allowed_area).inspect_err(|err| {
            warn!(area = %mutation.area, error = %err, "mutation rejected");
        })?;

        let instance = self.instance(service_id).await?;
        let area_key = area_key(service_id, &mutation.area);

        self.writers
            .with_lock(service_id, || async {
                let current = self.versions.current_version(&area_key).await?;
                if let Some(expected) = mutation.expected_version
                    && expected != current
                {
                    return Err(ControlError::version_conflict(area_key.as_str(), expected, current));
                }
                instance.write_cells(&update).await?;
                // Generation first so cached results retire even if the area
                // bump loses a race with another process.
                self.versions.check_and_bump(&generation_key(service_id), None).await?;
                let version = self.versions.check_and_bump(&area_key, Some(current)).await?;
                info!(
                    audit.action = "apply_mutation",
                    audit.resource = %area_key,
                    audit.result = "success",
                    cells = update.len(),
                    version,
                    "audit_event"
                );
                Ok::<_, ControlError>(version)
            })
            .await
    }

    async fn instance(&self, service_id: &str) -> Result<Arc<dyn ComputeInstance>> {
        let provider = Arc::clone(&self.provider);
        self.pool
            .get(service_id, || async move {
                provider.create(service_id).await.map_err(ControlError::from)
            })
            .await
    }
}

fn area_key(service_id: &str, area: &str) -> String {
    format!("area:{service_id}:{area}")
}

fn generation_key(service_id: &str) -> String {
    format!("generation:{service_id}")
}
