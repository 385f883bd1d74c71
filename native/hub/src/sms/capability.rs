//! Two-phase flow for obtaining the default SMS role.
//!
//! [`CapabilityGate::request_capability`] shows the system prompt and returns immediately with a
//! [`PendingRequest`]. The answer arrives later through [`CapabilityGate::on_capability_result`],
//! either from the UI or from [`CapabilityGate::watch_for_grant`] polling the device. Nothing here
//! retries a restore; that decision stays with the caller.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::{sync::Mutex, time};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait CapabilityRequester: Send + Sync {
    /// Whether the write capability is currently held
    async fn is_granted(&self) -> Result<bool>;
    /// Starts the user-facing grant prompt. Does not wait for the answer.
    async fn request(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: Uuid,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityStatus {
    Granted,
    Denied,
}

impl CapabilityStatus {
    pub fn from_granted(granted: bool) -> Self {
        if granted { Self::Granted } else { Self::Denied }
    }

    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Granted => "Default SMS granted. Try restore again.",
            Self::Denied => "Default SMS not granted.",
        }
    }
}

/// Tracks the single outstanding capability request, if any.
#[derive(Debug, Default)]
pub struct CapabilityGate {
    pending: Mutex<Option<PendingRequest>>,
}

impl CapabilityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shows the grant prompt unless one is already outstanding, in which case the existing
    /// request is returned.
    #[instrument(level = "debug", skip(self, requester), err)]
    pub async fn request_capability(
        &self,
        requester: &dyn CapabilityRequester,
    ) -> Result<PendingRequest> {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.as_ref() {
            debug!(id = %existing.id, "Capability request already pending");
            return Ok(existing.clone());
        }

        requester.request().await?;
        let request = PendingRequest { id: Uuid::new_v4(), requested_at: Instant::now() };
        info!(id = %request.id, "Requested default SMS role");
        *pending = Some(request.clone());
        Ok(request)
    }

    /// Resolves the pending request. Returns `None` if `id` is not the outstanding request
    /// (already resolved, or never issued).
    #[instrument(level = "debug", skip(self))]
    pub async fn on_capability_result(&self, id: Uuid, granted: bool) -> Option<CapabilityStatus> {
        let mut pending = self.pending.lock().await;
        match pending.as_ref() {
            Some(request) if request.id == id => {
                let waited = request.requested_at.elapsed();
                *pending = None;
                let status = CapabilityStatus::from_granted(granted);
                info!(%id, ?status, ?waited, "Capability request resolved");
                Some(status)
            }
            _ => {
                warn!(%id, "Ignoring result for unknown or stale capability request");
                None
            }
        }
    }

    pub async fn pending(&self) -> Option<PendingRequest> {
        self.pending.lock().await.clone()
    }

    /// Polls `requester` until the capability shows up or `timeout` passes, then resolves
    /// `request`. Stops early if someone else resolved it first.
    #[instrument(level = "debug", skip(self, requester, request), fields(id = %request.id))]
    pub async fn watch_for_grant(
        &self,
        requester: &dyn CapabilityRequester,
        request: &PendingRequest,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<CapabilityStatus> {
        let deadline = time::Instant::now() + timeout;
        let mut interval = time::interval(poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.pending().await.is_none_or(|p| p.id != request.id) {
                debug!("Request resolved elsewhere, stop polling");
                return None;
            }
            match requester.is_granted().await {
                Ok(true) => return self.on_capability_result(request.id, true).await,
                Ok(false) => {}
                Err(e) => debug!(error = %format!("{e:#}"), "Failed to query capability"),
            }
            if time::Instant::now() >= deadline {
                return self.on_capability_result(request.id, false).await;
            }
        }
    }
}
