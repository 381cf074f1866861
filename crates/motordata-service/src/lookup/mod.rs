//! The lookup coordinators that page-level loaders actually call.
//!
//! A [`LookupCache`] ties the pieces from [`caching`](crate::caching) and
//! [`fetch`](crate::fetch) together for one domain: consult the store,
//! join or start the deduplicated upstream request, write the result back.
//! [`Lookups`] holds one coordinator per domain, and [`LookupService`]
//! additionally wires them to the production [`FetchService`] endpoints.

use std::future::Future;
use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CacheContents, CacheError, CacheKey, CacheKeyBuilder, CacheName, InFlightRequests, TtlStore,
};
use crate::config::{Config, DomainCacheConfig, RetryConfig};
use crate::fetch::{self, FetchService};

pub mod fields;


pub use fields::{VehicleIdent, id_key, normalize_fuel_type};

/// Coordinates all lookups of one domain.
///
/// Holds no per-call state: everything a single lookup needs lives on its
/// own future, and everything shared (the store, the in-flight map) has its
/// own lifecycle. Constructed once per domain and passed by reference.
pub struct LookupCache<T: Clone + Send + Sync + 'static> {
    store: Arc<TtlStore<T>>,
    inflight: InFlightRequests<T>,
    retry: RetryConfig,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for LookupCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupCache")
            .field("name", &self.store.name())
            .field("inflight", &self.inflight)
            .finish()
    }
}

impl<T> LookupCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn from_config(
        name: CacheName,
        config: &Config,
        domain: &DomainCacheConfig,
    ) -> io::Result<Self> {
        Ok(LookupCache {
            store: Arc::new(TtlStore::from_config(name, config, domain)?),
            inflight: InFlightRequests::new(name),
            retry: config.fetch.retry,
        })
    }

    /// Looks up `key`, fetching it at most once.
    ///
    /// The cache tiers are consulted first; on a miss, concurrent callers
    /// for the same key share a single retried `fetch` invocation and its
    /// outcome. A successful result is written back to the store before the
    /// shared future settles, so no caller can observe a partially written
    /// entry. Errors are never cached and reach every sharing caller
    /// unchanged.
    pub async fn lookup_cached<F, Fut>(&self, key: CacheKey, fetch: F) -> CacheContents<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheContents<T>> + Send + 'static,
    {
        if key.is_empty() {
            return Err(CacheError::BadRequest(
                "lookup without any identifying fields".into(),
            ));
        }

        if let Some(data) = self.store.get(&key) {
            return Ok(data);
        }

        let name = self.store.name();
        let store = Arc::clone(&self.store);
        let retry = self.retry;
        let write_back_key = key.clone();

        let computation = async move {
            metric!(counter("caches.computation") += 1, "cache" => name.as_ref());
            let result = fetch::retry(&retry, fetch).await;

            if let Ok(data) = &result {
                // Failures of the write are already handled inside the
                // store; the caller gets the data regardless.
                store.set(&write_back_key, data.clone());
            }

            result
        };

        self.inflight.spawn_deduplicated(key, computation).await
    }

    /// Explicitly removes one entry from both cache tiers.
    pub fn invalidate(&self, key: &CacheKey) {
        self.store.invalidate(key);
    }

    /// Removes every cached entry of this domain.
    pub fn clear(&self) {
        self.store.invalidate_all();
    }

    pub fn name(&self) -> CacheName {
        self.store.name()
    }
}

/// One lookup coordinator per domain.
pub struct Lookups {
    /// Technical specifications, keyed by make/model/year/fuel.
    pub tech_specs: LookupCache<Value>,
    /// Repair times, keyed like technical specifications.
    pub repair_times: LookupCache<Value>,
    /// The MOT inspection manual, keyed by defect or section id.
    pub defect_manual: LookupCache<Value>,
    /// AI condition analysis, keyed by registration.
    pub analysis: LookupCache<Value>,
}

impl Lookups {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Ok(Self {
            tech_specs: LookupCache::from_config(
                CacheName::TechSpecs,
                config,
                &config.caches.tech_specs,
            )?,
            repair_times: LookupCache::from_config(
                CacheName::RepairTimes,
                config,
                &config.caches.repair_times,
            )?,
            defect_manual: LookupCache::from_config(
                CacheName::DefectManual,
                config,
                &config.caches.defect_manual,
            )?,
            analysis: LookupCache::from_config(
                CacheName::Analysis,
                config,
                &config.caches.analysis,
            )?,
        })
    }

    /// Clears every domain's caches, both tiers.
    pub fn clear_all(&self) {
        // Destructure so we do not accidentally forget one of our members.
        let Self {
            tech_specs,
            repair_times,
            defect_manual,
            analysis,
        } = self;
        tech_specs.clear();
        repair_times.clear();
        defect_manual.clear();
        analysis.clear();
    }
}

/// Subject prefixes keying the vehicle-shaped domains. Stable: changing one
/// orphans everything previously cached under it. The record-based lookups
/// key separately from the make/model ones since the upstream may answer
/// them with a differently matched dataset.
const TECH_SPECS_SUBJECT: &str = "tech_specs";
const TECH_SPECS_RECORD_SUBJECT: &str = "tech_specs_lookup";
const REPAIR_TIMES_SUBJECT: &str = "vehicle";
const REPAIR_TIMES_RECORD_SUBJECT: &str = "vehicle_lookup";

/// The domain lookups wired to the production upstream endpoints.
///
/// This is the surface page-level loaders consume; every method is fully
/// coordinated (cached, deduplicated, retried).
pub struct LookupService {
    lookups: Lookups,
    fetch: FetchService,
}

impl LookupService {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Ok(Self {
            lookups: Lookups::from_config(config)?,
            fetch: FetchService::new(config),
        })
    }

    pub fn lookups(&self) -> &Lookups {
        &self.lookups
    }

    /// Technical specifications for a vehicle.
    pub async fn tech_specs(
        &self,
        ident: &VehicleIdent,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let key = ident.cache_key(TECH_SPECS_SUBJECT);
        let fetch = self.fetch.clone();
        let ident = ident.clone();
        let token = token.clone();
        self.lookups
            .tech_specs
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let ident = ident.clone();
                let token = token.clone();
                async move {
                    fetch
                        .tech_specs(
                            &ident.make,
                            &ident.model,
                            ident.year,
                            ident.fuel_type.as_deref(),
                            &token,
                        )
                        .await
                }
            })
            .await
    }

    /// Repair times for a vehicle.
    pub async fn repair_times(
        &self,
        ident: &VehicleIdent,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let key = ident.cache_key(REPAIR_TIMES_SUBJECT);
        let fetch = self.fetch.clone();
        let ident = ident.clone();
        let token = token.clone();
        self.lookups
            .repair_times
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let ident = ident.clone();
                let token = token.clone();
                async move {
                    fetch
                        .repair_times(&ident.make, &ident.model, ident.year, &token)
                        .await
                }
            })
            .await
    }

    /// Technical specifications matched from a complete vehicle record, as
    /// returned by a registration lookup.
    ///
    /// The record's own fuel type is canonicalized before it is sent
    /// upstream, so spelled-out variants match the same dataset.
    pub async fn tech_specs_for_record(
        &self,
        record: &Value,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let ident = VehicleIdent::from_record(record)?;
        let key = ident.cache_key(TECH_SPECS_RECORD_SUBJECT);
        let body = normalized_record(record, &ident);
        let fetch = self.fetch.clone();
        let token = token.clone();
        self.lookups
            .tech_specs
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let body = body.clone();
                let token = token.clone();
                async move { fetch.tech_specs_lookup(&body, &token).await }
            })
            .await
    }

    /// Repair times matched from a complete vehicle record.
    pub async fn repair_times_for_record(
        &self,
        record: &Value,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let ident = VehicleIdent::from_record(record)?;
        let key = ident.cache_key(REPAIR_TIMES_RECORD_SUBJECT);
        let body = normalized_record(record, &ident);
        let fetch = self.fetch.clone();
        let token = token.clone();
        self.lookups
            .repair_times
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let body = body.clone();
                let token = token.clone();
                async move { fetch.repair_times_lookup(&body, &token).await }
            })
            .await
    }

    /// The list of vehicles the upstream has data for.
    pub async fn available_vehicles(
        &self,
        data_type: Option<&str>,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        let mut builder = CacheKeyBuilder::new();
        builder.field("available_vehicles").opt_field(data_type);
        let key = builder.build();

        let fetch = self.fetch.clone();
        let data_type = data_type.map(str::to_owned);
        let token = token.clone();
        self.lookups
            .tech_specs
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let data_type = data_type.clone();
                let token = token.clone();
                async move { fetch.available_vehicles(data_type.as_deref(), &token).await }
            })
            .await
    }

    /// A single defect from the MOT inspection manual.
    pub async fn defect(
        &self,
        defect_id: &str,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        if defect_id.trim().is_empty() {
            return Err(CacheError::BadRequest("defect id is required".into()));
        }
        let key = id_key("defect", defect_id);
        let fetch = self.fetch.clone();
        let defect_id = defect_id.to_owned();
        let token = token.clone();
        self.lookups
            .defect_manual
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let defect_id = defect_id.clone();
                let token = token.clone();
                async move { fetch.defect(&defect_id, &token).await }
            })
            .await
    }

    /// A section, subsection or item of the MOT inspection manual.
    pub async fn manual_section(
        &self,
        path: &str,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        if path.trim().is_empty() {
            return Err(CacheError::BadRequest("section id is required".into()));
        }
        let subject = match path.split('.').count() {
            1 => "section",
            2 => "subsection",
            _ => "item",
        };
        let key = id_key(subject, path);
        let fetch = self.fetch.clone();
        let path = path.to_owned();
        let token = token.clone();
        self.lookups
            .defect_manual
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let path = path.clone();
                let token = token.clone();
                async move { fetch.manual_section(&path, &token).await }
            })
            .await
    }

    /// The MOT inspection manual's table of contents.
    pub async fn manual_toc(&self, token: &CancellationToken) -> CacheContents<Value> {
        let mut builder = CacheKeyBuilder::new();
        builder.field("all_sections");
        let key = builder.build();
        let fetch = self.fetch.clone();
        let token = token.clone();
        self.lookups
            .defect_manual
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let token = token.clone();
                async move { fetch.manual_toc(&token).await }
            })
            .await
    }

    /// The AI condition analysis for a registration.
    pub async fn analysis(
        &self,
        registration: &str,
        token: &CancellationToken,
    ) -> CacheContents<Value> {
        if registration.trim().is_empty() {
            return Err(CacheError::BadRequest("registration is required".into()));
        }
        let key = id_key("analysis", registration);
        let fetch = self.fetch.clone();
        let registration = registration.to_owned();
        let token = token.clone();
        self.lookups
            .analysis
            .lookup_cached(key, move || {
                let fetch = fetch.clone();
                let registration = registration.clone();
                let token = token.clone();
                async move { fetch.analysis(&registration, &token).await }
            })
            .await
    }

    /// Drops the cached technical specifications for a vehicle.
    pub fn invalidate_tech_specs(&self, ident: &VehicleIdent) {
        self.lookups
            .tech_specs
            .invalidate(&ident.cache_key(TECH_SPECS_SUBJECT));
    }

    /// Drops the cached repair times for a vehicle.
    pub fn invalidate_repair_times(&self, ident: &VehicleIdent) {
        self.lookups
            .repair_times
            .invalidate(&ident.cache_key(REPAIR_TIMES_SUBJECT));
    }

    /// Drops the cached condition analysis for a registration.
    pub fn invalidate_analysis(&self, registration: &str) {
        self.lookups
            .analysis
            .invalidate(&id_key("analysis", registration));
    }

    /// Clears every domain's caches, both tiers.
    pub fn clear_all(&self) {
        self.lookups.clear_all();
    }
}

/// A copy of the record with the canonicalized fuel type written back, when
/// one was determined.
fn normalized_record(record: &Value, ident: &VehicleIdent) -> Value {
    let mut record = record.clone();
    if let (Some(object), Some(fuel_type)) = (record.as_object_mut(), &ident.fuel_type) {
        object.insert("fuelType".into(), Value::String(fuel_type.clone()));
    }
    record
}
