use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Why a push was enqueued. Kept for logs and diagnostics; a dispatched
/// push always applies the full current desired set regardless of reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushReason {
    PeerAdded(Uuid),
    PeerRemoved(Uuid),
}

/// One queued request to converge a gateway's peer set.
#[derive(Debug, Clone)]
pub struct PushTicket {
    pub reason: PushReason,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO push queues, one per gateway.
///
/// Tickets stay queued until a push is confirmed applied, so a failed
/// dispatch loses nothing; deleting a gateway cancels everything still
/// pending for it.
#[derive(Default)]
pub struct PushQueues {
    inner: DashMap<Uuid, VecDeque<PushTicket>>,
}

impl PushQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, gateway_id: Uuid, reason: PushReason) {
        let ticket = PushTicket {
            reason,
            enqueued_at: Utc::now(),
        };
        self.inner.entry(gateway_id).or_default().push_back(ticket);
        tracing::debug!(%gateway_id, ?reason, "push enqueued");
    }

    /// Number of tickets still pending for a gateway.
    pub fn pending(&self, gateway_id: Uuid) -> usize {
        self.inner.get(&gateway_id).map_or(0, |q| q.len())
    }

    /// Remove and return all tickets, oldest first. Called only after a
    /// push is confirmed applied.
    pub fn drain(&self, gateway_id: Uuid) -> Vec<PushTicket> {
        self.inner
            .remove(&gateway_id)
            .map(|(_, q)| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Cancel every still-pending ticket for a gateway being deleted.
    pub fn cancel(&self, gateway_id: Uuid) -> usize {
        let dropped = self.inner.remove(&gateway_id).map_or(0, |(_, q)| q.len());
        if dropped > 0 {
            tracing::info!(%gateway_id, dropped, "cancelled pending pushes");
        }
        dropped
    }
}
