//! Admin dashboard stats state.
//!
//! Holds the last successfully fetched stats and deliberately keeps them
//! visible when a refresh fails: a transient backend fault must not blank the
//! dashboard to zeros. Manual refreshes honour a fixed client-side cooldown
//! so an impatient operator cannot hammer the stats route.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::api::ApiClient;
use crate::error::{ApiError, ApiResult};

const STATS_ROUTE: &str = "/v1/admin/stats";

/// Fixed cooldown between manual refresh actions.
pub const MANUAL_REFRESH_COOLDOWN: Duration = Duration::from_secs(20);

/// Aggregate marketplace counters returned by the admin stats route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DashboardStats {
    #[serde(default)]
    pub total_customers: u64,
    #[serde(default)]
    pub total_providers: u64,
    #[serde(default)]
    pub active_jobs: u64,
    #[serde(default)]
    pub completed_jobs: u64,
    #[serde(default)]
    pub pending_requests: u64,
}

/// What the dashboard screen renders.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Last successfully fetched stats; survives failed refreshes.
    pub stats: Option<DashboardStats>,
    /// Message from the most recent failed refresh, if any.
    pub last_error: Option<String>,
    /// Set when the backend rejected the caller's role (HTTP 403).
    pub access_denied: bool,
}

/// Outcome of a manual refresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Fetched(DashboardStats),
    /// Within the cooldown window; no request was made.
    CoolingDown,
}

#[derive(Debug, Default)]
struct PanelState {
    snapshot: StatsSnapshot,
    last_attempt: Option<Instant>,
}

/// Stats fetcher with stale-data preservation and refresh cooldown.
#[derive(Debug)]
pub struct StatsPanel {
    api: Arc<ApiClient>,
    state: StdMutex<PanelState>,
}

impl StatsPanel {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            state: StdMutex::new(PanelState::default()),
        }
    }

    /// Current renderable state.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.state
            .lock()
            .map_or_else(|_| StatsSnapshot::default(), |guard| guard.snapshot.clone())
    }

    /// Fetches fresh stats unless a refresh ran within the cooldown window.
    ///
    /// On failure the previous stats stay in place; only the error fields of
    /// the snapshot change.
    pub async fn refresh(&self) -> ApiResult<RefreshOutcome> {
        {
            let mut guard = self.lock_state()?;
            if let Some(last) = guard.last_attempt {
                if last.elapsed() < MANUAL_REFRESH_COOLDOWN {
                    tracing::debug!("Stats refresh skipped; cooldown active");
                    return Ok(RefreshOutcome::CoolingDown);
                }
            }
            guard.last_attempt = Some(Instant::now());
        }

        match self.api.get::<DashboardStats>(STATS_ROUTE).await {
            Ok(stats) => {
                let mut guard = self.lock_state()?;
                guard.snapshot.stats = Some(stats.clone());
                guard.snapshot.last_error = None;
                guard.snapshot.access_denied = false;
                Ok(RefreshOutcome::Fetched(stats))
            }
            Err(error) => {
                // Keep previously loaded stats visible; record the failure.
                let mut guard = self.lock_state()?;
                guard.snapshot.access_denied = matches!(error, ApiError::Forbidden(_));
                guard.snapshot.last_error = Some(error.to_string());
                Err(error)
            }
        }
    }

    fn lock_state(&self) -> ApiResult<std::sync::MutexGuard<'_, PanelState>> {
        self.state
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))
    }
}
