//! Connection recovery: event-driven session revalidation.
//!
//! Platform shells feed network and foreground transitions into a single
//! process-wide task. Regaining connectivity or focus triggers one
//! revalidation pass through the token manager, which refreshes a stale token
//! as a side effect so UI polling resumes with fresh data. The task never
//! retries arbitrary failed requests; it only re-arms the preconditions other
//! components depend on.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::access::LabourAccessCache;
use crate::auth::{SessionState, TokenManager};
use crate::error::ApiError;

const SIGNAL_BUFFER: usize = 16;

/// Device/network transitions reported by the platform shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSignal {
    Online,
    Offline,
    Foregrounded,
    Backgrounded,
}

/// Handle to the single recovery task.
///
/// The handle owns the only signal receiver, so remounting a screen cannot
/// create duplicate subscriptions; shells keep one handle for the process
/// lifetime and tear it down explicitly.
pub struct RecoveryHandle {
    signals: mpsc::Sender<AppSignal>,
    session: watch::Receiver<SessionState>,
    connectivity: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Sender for platform signals; cloneable across shell layers.
    pub fn signals(&self) -> mpsc::Sender<AppSignal> {
        self.signals.clone()
    }

    /// Last session state observed by a revalidation pass.
    pub fn session(&self) -> watch::Receiver<SessionState> {
        self.session.clone()
    }

    /// Last known connectivity, as reported by the shell.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.clone()
    }

    /// Tears the subscription down and waits for the task to finish.
    pub async fn shutdown(self) {
        drop(self.signals);
        let _ = self.task.await;
    }
}

/// Spawns the process-wide recovery task.
///
/// When an access cache is supplied, each revalidation pass also reconciles
/// it, so regaining focus or connectivity refreshes the labour-access status
/// alongside the token. The cache's own gate suppresses duplicate reconciles.
pub fn spawn(
    tokens: Arc<TokenManager>,
    access: Option<Arc<LabourAccessCache>>,
) -> RecoveryHandle {
    let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (session_tx, session_rx) = watch::channel(tokens.session_state());
    let (connectivity_tx, connectivity_rx) = watch::channel(true);

    let task = tokio::spawn(run(tokens, access, signal_rx, session_tx, connectivity_tx));

    RecoveryHandle {
        signals: signal_tx,
        session: session_rx,
        connectivity: connectivity_rx,
        task,
    }
}

async fn run(
    tokens: Arc<TokenManager>,
    access: Option<Arc<LabourAccessCache>>,
    mut signals: mpsc::Receiver<AppSignal>,
    session: watch::Sender<SessionState>,
    connectivity: watch::Sender<bool>,
) {
    while let Some(signal) = signals.recv().await {
        record_connectivity(&connectivity, signal);
        if !triggers_revalidation(signal) {
            continue;
        }

        revalidate(&tokens, &session).await;
        if let Some(cache) = &access {
            if let Err(error) = cache.reconcile().await {
                tracing::warn!("Access reconcile on recovery failed: {error}");
            }
        }

        // Signals that queued up while the pass was in flight would only
        // trigger a redundant pass; drain them, keeping connectivity current.
        while let Ok(queued) = signals.try_recv() {
            record_connectivity(&connectivity, queued);
        }
    }
    tracing::debug!("Recovery signal channel closed; task exiting");
}

const fn triggers_revalidation(signal: AppSignal) -> bool {
    matches!(signal, AppSignal::Online | AppSignal::Foregrounded)
}

fn record_connectivity(connectivity: &watch::Sender<bool>, signal: AppSignal) {
    match signal {
        AppSignal::Online => {
            let _ = connectivity.send(true);
        }
        AppSignal::Offline => {
            let _ = connectivity.send(false);
        }
        AppSignal::Foregrounded | AppSignal::Backgrounded => {}
    }
}

async fn revalidate(tokens: &TokenManager, session: &watch::Sender<SessionState>) {
    let state = match tokens.get_valid_token().await {
        Ok(_) => tokens.session_state(),
        Err(ApiError::SessionExpired) => SessionState::Expired,
        Err(error) => {
            tracing::warn!("Revalidation pass failed: {error}");
            tokens.session_state()
        }
    };
    let _ = session.send(state);
}
