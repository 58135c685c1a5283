//! Client-side labour-access status cache.
//!
//! The cached blob answers the fast path without a network round trip; an
//! asynchronous reconcile against the backend then updates the cache and any
//! subscribed UI state. Checks are event-driven (mount, explicit action,
//! app-foreground) — never a fixed polling interval, to keep rate-limit
//! pressure off the backend.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::api::ApiClient;
use crate::error::{ApiError, ApiResult};

const ACCESS_ROUTE: &str = "/v1/labour/access";

/// Labour-access window as confirmed by the backend.
///
/// `days_remaining` is deliberately not a field: it is always derived from
/// `end_date` minus "now", so a stored counter can never drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabourAccess {
    pub has_access: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl LabourAccess {
    /// Whole days left in the access window at `now`, clamped at zero.
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        if !self.has_access {
            return 0;
        }
        self.end_date
            .map_or(0, |end| (end - now).num_days().max(0))
    }

    pub fn days_remaining(&self) -> i64 {
        self.days_remaining_at(Utc::now())
    }
}

/// Device-local persistence for the access blob.
pub trait AccessStore: Send + Sync {
    fn load(&self) -> ApiResult<Option<LabourAccess>>;
    fn save(&self, access: &LabourAccess) -> ApiResult<()>;
    fn clear(&self) -> ApiResult<()>;
}

/// In-memory access store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryAccessStore {
    slot: StdMutex<Option<String>>,
}

impl AccessStore for MemoryAccessStore {
    fn load(&self) -> ApiResult<Option<LabourAccess>> {
        let guard = self
            .slot
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        match guard.as_deref() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    fn save(&self, access: &LabourAccess) -> ApiResult<()> {
        let raw = serde_json::to_string(access)?;
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        *guard = Some(raw);
        Ok(())
    }

    fn clear(&self) -> ApiResult<()> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        *guard = None;
        Ok(())
    }
}

/// Shared access-status cache with backend reconciliation.
pub struct LabourAccessCache {
    api: Arc<ApiClient>,
    store: Arc<dyn AccessStore>,
    cached: StdMutex<Option<LabourAccess>>,
    updates: watch::Sender<Option<LabourAccess>>,
    reconcile_gate: Mutex<()>,
}

impl LabourAccessCache {
    pub fn new(api: Arc<ApiClient>, store: Arc<dyn AccessStore>) -> Self {
        let (updates, _) = watch::channel(None);
        Self {
            api,
            store,
            cached: StdMutex::new(None),
            updates,
            reconcile_gate: Mutex::new(()),
        }
    }

    /// Loads the persisted blob into memory at startup.
    pub fn restore(&self) -> ApiResult<Option<LabourAccess>> {
        let loaded = self.store.load()?;
        let mut guard = self.lock_cached()?;
        guard.clone_from(&loaded);
        drop(guard);
        let _ = self.updates.send(loaded.clone());
        Ok(loaded)
    }

    /// Current cached value; no network.
    pub fn cached(&self) -> Option<LabourAccess> {
        self.lock_cached().ok().and_then(|guard| guard.clone())
    }

    /// Watch channel fed by every reconcile; UI state subscribes here.
    pub fn subscribe(&self) -> watch::Receiver<Option<LabourAccess>> {
        self.updates.subscribe()
    }

    /// Checks labour access: cached value first, reconcile in the background.
    ///
    /// With a cached value the call returns immediately and kicks off an
    /// asynchronous reconcile; with an empty cache it waits for the backend.
    pub async fn check(self: &Arc<Self>) -> ApiResult<Option<LabourAccess>> {
        if let Some(cached) = self.cached() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = this.reconcile().await {
                    tracing::warn!("Background access reconcile failed: {error}");
                }
            });
            return Ok(Some(cached));
        }
        self.reconcile().await
    }

    /// Reconciles the cache against the backend.
    ///
    /// A reconcile already in flight suppresses this one; the caller gets the
    /// current cached value instead of a duplicate backend call.
    pub async fn reconcile(&self) -> ApiResult<Option<LabourAccess>> {
        let Ok(_gate) = self.reconcile_gate.try_lock() else {
            return Ok(self.cached());
        };

        let payload: AccessPayload = self.api.get(ACCESS_ROUTE).await?;
        let access = LabourAccess {
            has_access: payload.has_access,
            start_date: payload.start_date,
            end_date: payload.end_date,
        };
        self.store.save(&access)?;
        {
            let mut guard = self.lock_cached()?;
            *guard = Some(access.clone());
        }
        let _ = self.updates.send(Some(access.clone()));
        Ok(Some(access))
    }

    /// Optimistically grants access locally pending server confirmation.
    ///
    /// Internal test builds only; this is a client-side trust decision, not a
    /// security boundary.
    #[cfg(feature = "dev-bypass")]
    pub fn grant_labour_access(&self, days: i64) -> ApiResult<LabourAccess> {
        let now = Utc::now();
        let access = LabourAccess {
            has_access: true,
            start_date: Some(now),
            end_date: Some(now + chrono::Duration::days(days)),
        };
        self.store.save(&access)?;
        {
            let mut guard = self.lock_cached()?;
            *guard = Some(access.clone());
        }
        let _ = self.updates.send(Some(access.clone()));
        Ok(access)
    }

    fn lock_cached(&self) -> ApiResult<std::sync::MutexGuard<'_, Option<LabourAccess>>> {
        self.cached
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))
    }
}

impl fmt::Debug for LabourAccessCache {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LabourAccessCache")
            .field("cached", &self.cached())
            .finish_non_exhaustive()
    }
}

/// Wire payload for the access route. The backend also sends a
/// `days_remaining` counter; it is ignored in favour of deriving locally.
#[derive(Debug, Deserialize)]
struct AccessPayload {
    has_access: bool,
    #[serde(default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;

    use super::*;
    use crate::api::test_support::{seeded_manager, ScriptedTransport};

    fn access_body(has_access: bool, end_in_days: i64) -> String {
        let now = Utc::now();
        serde_json::json!({
            "status": "success",
            "data": {
                "has_access": has_access,
                "start_date": now.to_rfc3339(),
                "end_date": (now + Duration::days(end_in_days) + Duration::hours(1)).to_rfc3339(),
                "days_remaining": 999
            }
        })
        .to_string()
    }

    fn cache_with(transport: Arc<ScriptedTransport>) -> Arc<LabourAccessCache> {
        let (tokens, _) = seeded_manager("access-1");
        let api = Arc::new(
            ApiClient::with_transport("https://api.fundi.app", transport, tokens).unwrap(),
        );
        Arc::new(LabourAccessCache::new(
            api,
            Arc::new(MemoryAccessStore::default()),
        ))
    }

    #[test]
    fn days_remaining_is_derived_from_end_date() {
        let now = Utc::now();
        let access = LabourAccess {
            has_access: true,
            start_date: Some(now - Duration::days(5)),
            end_date: Some(now + Duration::days(10) + Duration::hours(2)),
        };
        assert_eq!(access.days_remaining_at(now), 10);
        // Re-derived, not a stored counter: three days later it has moved.
        assert_eq!(access.days_remaining_at(now + Duration::days(3)), 7);
        // Clamped at zero once the window has lapsed.
        assert_eq!(access.days_remaining_at(now + Duration::days(30)), 0);
    }

    #[test]
    fn days_remaining_is_zero_without_access() {
        let access = LabourAccess {
            has_access: false,
            start_date: None,
            end_date: Some(Utc::now() + Duration::days(10)),
        };
        assert_eq!(access.days_remaining(), 0);
    }

    #[tokio::test]
    async fn empty_cache_reconciles_against_the_backend() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::OK, &access_body(true, 14));
        let cache = cache_with(Arc::clone(&transport));

        let access = cache.check().await.unwrap().unwrap();
        assert!(access.has_access);
        assert_eq!(access.days_remaining(), 14);
        assert_eq!(transport.request_count(), 1);
        // The wire counter (999) was ignored in favour of local derivation.
        assert!(access.days_remaining() < 999);
    }

    #[tokio::test]
    async fn repeated_checks_yield_identical_values() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::OK, &access_body(true, 30));
        transport.push(StatusCode::OK, &access_body(true, 30));
        let cache = cache_with(transport);

        let first = cache.reconcile().await.unwrap().unwrap();
        let second = cache.reconcile().await.unwrap().unwrap();
        assert_eq!(first.has_access, second.has_access);
        assert_eq!(
            first.days_remaining_at(Utc::now()),
            second.days_remaining_at(Utc::now())
        );
    }

    #[tokio::test]
    async fn cached_value_answers_the_fast_path() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::OK, &access_body(true, 7));
        transport.push(StatusCode::OK, &access_body(true, 7));
        let cache = cache_with(Arc::clone(&transport));

        cache.reconcile().await.unwrap();
        let cached = cache.check().await.unwrap().unwrap();
        assert!(cached.has_access);
    }

    #[tokio::test]
    async fn explicit_reconcile_hits_the_backend_despite_a_warm_cache() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::OK, &access_body(true, 7));
        transport.push(StatusCode::OK, &access_body(false, 0));
        let cache = cache_with(Arc::clone(&transport));

        cache.reconcile().await.unwrap();
        assert_eq!(transport.request_count(), 1);

        // An explicit refresh must complete against the backend before
        // returning, not ride on a detached task.
        let refreshed = cache.reconcile().await.unwrap().unwrap();
        assert_eq!(transport.request_count(), 2);
        assert!(!refreshed.has_access);
        assert_eq!(cache.cached(), Some(refreshed));
    }

    #[tokio::test]
    async fn in_flight_reconcile_suppresses_a_redundant_one() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push(StatusCode::OK, &access_body(true, 7));
        let cache = cache_with(Arc::clone(&transport));

        // Hold the gate as an in-flight reconcile would.
        let gate = cache.reconcile_gate.lock().await;
        let suppressed = cache.reconcile().await.unwrap();
        assert_eq!(suppressed, None);
        assert_eq!(transport.request_count(), 0);
        drop(gate);

        let reconciled = cache.reconcile().await.unwrap();
        assert!(reconciled.is_some());
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn restore_loads_the_persisted_blob() {
        let store = Arc::new(MemoryAccessStore::default());
        let access = LabourAccess {
            has_access: true,
            start_date: None,
            end_date: Some(Utc::now() + Duration::days(3)),
        };
        store.save(&access).unwrap();

        let transport = Arc::new(ScriptedTransport::default());
        let (tokens, _) = seeded_manager("access-1");
        let api = Arc::new(
            ApiClient::with_transport("https://api.fundi.app", transport, tokens).unwrap(),
        );
        let cache = LabourAccessCache::new(api, store);

        let restored = cache.restore().unwrap().unwrap();
        assert_eq!(restored, access);
        assert_eq!(cache.cached(), Some(access));
    }

    #[cfg(feature = "dev-bypass")]
    #[tokio::test]
    async fn dev_bypass_grant_is_local_and_optimistic() {
        let transport = Arc::new(ScriptedTransport::default());
        let cache = cache_with(Arc::clone(&transport));

        let granted = cache.grant_labour_access(30).unwrap();
        assert!(granted.has_access);
        assert_eq!(granted.days_remaining(), 29);
        assert_eq!(transport.request_count(), 0);
        assert_eq!(cache.cached(), Some(granted));
    }
}
