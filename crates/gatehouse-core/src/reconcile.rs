// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The gateway lifecycle state machine.
//!
//! One periodic tick drives all reconciliation; each gateway's action runs
//! under its own lock, so at most one action per gateway is in flight while
//! different gateways proceed in parallel. User-facing mutations persist
//! desired state and return; convergence happens here, on the tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gatehouse_types::agent::DesiredConfig;
use gatehouse_types::cloud::{MachineSpec, MachineState};
use gatehouse_types::{Gateway, GatewayState};

use crate::error::LifecycleError;
use crate::lock::GatewayLocks;
use crate::provider::{CloudProvisioner, GatewayAgent};
use crate::queue::PushQueues;
use crate::registry;
use crate::settings::ReconcilerSettings;
use crate::store::{NewGateway, Store};
use crate::subnet;

/// Outcome of the most recent reconciliation action for a gateway.
///
/// Ephemeral: kept in memory for backoff scheduling and user-visible error
/// surfacing, never persisted.
#[derive(Debug, Clone)]
pub struct ReconcileAttempt {
    pub at: DateTime<Utc>,
    pub error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy)]
struct PushBackoff {
    failures: u32,
    next_after: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct TeardownProgress {
    push_attempts: u32,
    peers_cleared: bool,
    terminate_issued: bool,
    confirm_attempts: u32,
}

/// Exponential backoff with a ceiling: start, 2*start, 4*start, ... cap.
fn backoff_delay(start: Duration, cap: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    start.saturating_mul(1u32 << exp).min(cap)
}

pub struct Reconciler<S, P, A> {
    store: Arc<S>,
    provisioner: Arc<P>,
    agent: Arc<A>,
    settings: Arc<ReconcilerSettings>,
    locks: Arc<GatewayLocks>,
    queues: Arc<PushQueues>,
    health_misses: DashMap<Uuid, u32>,
    push_backoff: DashMap<Uuid, PushBackoff>,
    teardowns: DashMap<Uuid, TeardownProgress>,
    attempts: DashMap<Uuid, ReconcileAttempt>,
}

impl<S, P, A> Reconciler<S, P, A>
where
    S: Store,
    P: CloudProvisioner,
    A: GatewayAgent,
{
    pub fn new(
        store: Arc<S>,
        provisioner: Arc<P>,
        agent: Arc<A>,
        settings: Arc<ReconcilerSettings>,
        locks: Arc<GatewayLocks>,
        queues: Arc<PushQueues>,
    ) -> Self {
        Self {
            store,
            provisioner,
            agent,
            settings,
            locks,
            queues,
            health_misses: DashMap::new(),
            push_backoff: DashMap::new(),
            teardowns: DashMap::new(),
            attempts: DashMap::new(),
        }
    }

    /// Run ticks forever at the configured interval.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            Arc::clone(&self).tick().await;
        }
    }

    /// One scheduler tick: reconcile every non-terminal gateway, each in
    /// its own task, and wait for all of them.
    pub async fn tick(self: Arc<Self>) {
        let gateways = match self.store.active_gateways().await {
            Ok(gateways) => gateways,
            Err(e) => {
                error!(error = %e, "failed to list gateways for tick");
                return;
            }
        };
        debug!(gateway_count = gateways.len(), "reconciliation tick");

        let mut tasks = Vec::with_capacity(gateways.len());
        for gateway in gateways {
            tasks.push(tokio::spawn(
                Arc::clone(&self).reconcile_gateway(gateway.id),
            ));
        }
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "reconcile task panicked");
            }
        }
    }

    /// Schedule an immediate reconciliation for one gateway, without
    /// waiting for the next tick. Fire-and-forget.
    pub fn kick(self: Arc<Self>, id: Uuid) {
        tokio::spawn(self.reconcile_gateway(id));
    }

    /// Run one reconciliation action for a gateway, under its lock.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_gateway(self: Arc<Self>, id: Uuid) {
        let _guard = self.locks.hold(id).await;

        let gateway = match self.store.gateway(id).await {
            Ok(Some(gateway)) => gateway,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to load gateway");
                return;
            }
        };

        match gateway.state {
            GatewayState::Requested => self.begin_provisioning(gateway).await,
            GatewayState::Provisioning => self.poll_provisioning(gateway).await,
            GatewayState::Running | GatewayState::Degraded => {
                self.health_and_pushes(gateway).await
            }
            GatewayState::Terminating => self.teardown(gateway).await,
            GatewayState::Terminated | GatewayState::Failed => {}
        }

        if let Err(e) = self.store.touch_reconciled(id, Utc::now()).await {
            // The record may have just been deleted by teardown.
            debug!(error = %e, "could not stamp last_reconciled_at");
        }
    }

    /// The latest reconciliation outcome for a gateway, if any.
    pub fn last_attempt(&self, id: Uuid) -> Option<ReconcileAttempt> {
        self.attempts.get(&id).map(|a| a.clone())
    }

    // -- User-facing lifecycle requests --------------------------------------

    /// Persist a new gateway in `requested` state. The caller is expected
    /// to `kick` it afterwards; this never waits on the cloud.
    #[tracing::instrument(skip(self))]
    pub async fn request_gateway(
        &self,
        owner_id: Uuid,
        region: &str,
        machine_class: &str,
    ) -> Result<Gateway, LifecycleError> {
        let live = self
            .store
            .gateways_by_owner(owner_id)
            .await?
            .into_iter()
            .filter(|g| !g.state.is_terminal())
            .count() as u32;
        let limit = self.settings.max_gateways_per_user;
        if live >= limit {
            return Err(LifecycleError::TooManyGateways { limit });
        }

        let in_use = self.store.live_subnets(owner_id).await?;
        let subnet = subnet::allocate(&in_use).ok_or(LifecycleError::SubnetExhausted)?;

        let gateway = self
            .store
            .create_gateway(NewGateway {
                owner_id,
                region: region.to_string(),
                machine_class: machine_class.to_string(),
                subnet,
            })
            .await?;

        info!(gateway_id = %gateway.id, %subnet, "gateway requested");
        Ok(gateway)
    }

    /// Move a gateway to `terminating` and cancel its pending pushes.
    ///
    /// Waits for any in-flight action to finish (it holds the lock), then
    /// preempts whatever the gateway was doing. Teardown itself happens on
    /// subsequent ticks.
    #[tracing::instrument(skip(self))]
    pub async fn remove_gateway(&self, id: Uuid) -> Result<Gateway, LifecycleError> {
        let _guard = self.locks.hold(id).await;

        let mut gateway = self
            .store
            .gateway(id)
            .await?
            .ok_or(LifecycleError::GatewayNotFound)?;

        if matches!(
            gateway.state,
            GatewayState::Terminating | GatewayState::Terminated
        ) {
            return Ok(gateway);
        }

        self.queues.cancel(id);
        gateway.state = GatewayState::Terminating;
        gateway.state_reason = None;
        self.store.update_gateway(&gateway).await?;

        info!(gateway_id = %id, "gateway termination requested");
        Ok(gateway)
    }

    // -- Attempt bookkeeping -------------------------------------------------

    fn record_ok(&self, id: Uuid) {
        self.attempts.insert(
            id,
            ReconcileAttempt {
                at: Utc::now(),
                error: None,
                consecutive_failures: 0,
            },
        );
    }

    fn record_error(&self, id: Uuid, error: &impl ToString) {
        let consecutive_failures = self
            .attempts
            .get(&id)
            .map_or(0, |a| a.consecutive_failures)
            + 1;
        self.attempts.insert(
            id,
            ReconcileAttempt {
                at: Utc::now(),
                error: Some(error.to_string()),
                consecutive_failures,
            },
        );
    }

    // -- State handlers ------------------------------------------------------

    /// `requested → provisioning`, or straight to `failed`.
    ///
    /// A failed create is not retried automatically: quota and credential
    /// problems need user action, and a create that timed out may have
    /// leaked a machine whose id we never learned. Users re-request.
    async fn begin_provisioning(&self, mut gateway: Gateway) {
        let spec = MachineSpec {
            region: gateway.region.clone(),
            machine_class: gateway.machine_class.clone(),
            name: format!("gatehouse-{}", gateway.id),
        };

        match self.provisioner.create_machine(&spec).await {
            Ok(cloud_id) => {
                info!(gateway_id = %gateway.id, %cloud_id, "machine create issued");
                gateway.cloud_id = Some(cloud_id);
                gateway.state = GatewayState::Provisioning;
                gateway.state_reason = None;
                self.record_ok(gateway.id);
            }
            Err(e) => {
                warn!(gateway_id = %gateway.id, error = %e, "machine create failed");
                gateway.state = GatewayState::Failed;
                gateway.state_reason = Some(e.to_string());
                self.record_error(gateway.id, &e);
            }
        }

        if let Err(e) = self.store.update_gateway(&gateway).await {
            error!(gateway_id = %gateway.id, error = %e, "failed to persist gateway");
        }
    }

    /// `provisioning → running`, `failed` on fatal errors or timeout.
    async fn poll_provisioning(&self, mut gateway: Gateway) {
        let waited = Utc::now()
            .signed_duration_since(gateway.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if waited >= self.settings.provision_timeout {
            // Best-effort cleanup of the half-created machine, issued once:
            // the gateway leaves `provisioning` right after.
            if let Some(cloud_id) = &gateway.cloud_id {
                if let Err(e) = self.provisioner.terminate_machine(cloud_id).await {
                    warn!(%cloud_id, error = %e, "best-effort terminate failed");
                }
            }
            warn!(gateway_id = %gateway.id, ?waited, "provisioning timed out");
            gateway.state = GatewayState::Failed;
            gateway.state_reason = Some("provisioning timeout".to_string());
            self.record_error(gateway.id, &"provisioning timeout");
            if let Err(e) = self.store.update_gateway(&gateway).await {
                error!(gateway_id = %gateway.id, error = %e, "failed to persist gateway");
            }
            return;
        }

        let Some(cloud_id) = gateway.cloud_id.clone() else {
            // Provisioning without a machine id cannot make progress.
            gateway.state = GatewayState::Failed;
            gateway.state_reason = Some("provisioning lost the machine id".to_string());
            let _ = self.store.update_gateway(&gateway).await;
            return;
        };

        match self.provisioner.describe_machine(&cloud_id).await {
            Ok(desc) => {
                if let Some(addr) = desc.public_addr {
                    gateway.public_addr = Some(addr);
                }

                if desc.state == MachineState::Active {
                    if let Some(endpoint) = gateway.public_addr.clone() {
                        // Running requires both the machine active and the
                        // agent confirming the interface up.
                        match self.agent.interface_status(&endpoint).await {
                            Ok(status) if status.up => {
                                if status.public_key.is_some() {
                                    gateway.public_key = status.public_key;
                                }
                                gateway.state = GatewayState::Running;
                                gateway.state_reason = None;
                                self.record_ok(gateway.id);
                                info!(gateway_id = %gateway.id, endpoint, "gateway running");
                            }
                            Ok(_) => {
                                debug!(gateway_id = %gateway.id, "interface not up yet");
                            }
                            Err(e) => {
                                debug!(gateway_id = %gateway.id, error = %e, "agent not reachable yet");
                                self.record_error(gateway.id, &e);
                            }
                        }
                    }
                }

                if let Err(e) = self.store.update_gateway(&gateway).await {
                    error!(gateway_id = %gateway.id, error = %e, "failed to persist gateway");
                }
            }
            Err(e) if e.is_fatal() => {
                warn!(gateway_id = %gateway.id, error = %e, "provisioning failed");
                gateway.state = GatewayState::Failed;
                gateway.state_reason = Some(e.to_string());
                self.record_error(gateway.id, &e);
                if let Err(e) = self.store.update_gateway(&gateway).await {
                    error!(gateway_id = %gateway.id, error = %e, "failed to persist gateway");
                }
            }
            Err(e) => {
                debug!(gateway_id = %gateway.id, error = %e, "describe failed, will re-poll");
                self.record_error(gateway.id, &e);
            }
        }
    }

    /// Health poll for `running`/`degraded` gateways, then push dispatch.
    async fn health_and_pushes(&self, mut gateway: Gateway) {
        let Some(endpoint) = gateway.public_addr.clone() else {
            error!(gateway_id = %gateway.id, "running gateway has no public address");
            return;
        };

        match self.agent.interface_status(&endpoint).await {
            Ok(status) => {
                self.health_misses.remove(&gateway.id);
                if status.public_key.is_some() {
                    gateway.public_key = status.public_key;
                }
                if gateway.state == GatewayState::Degraded {
                    info!(gateway_id = %gateway.id, "agent reachable again, gateway recovered");
                    gateway.state = GatewayState::Running;
                    gateway.state_reason = None;
                }
                self.record_ok(gateway.id);
            }
            Err(e) => {
                let misses = {
                    let mut entry = self.health_misses.entry(gateway.id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                self.record_error(gateway.id, &e);
                if gateway.state == GatewayState::Running
                    && misses >= self.settings.health_fail_threshold
                {
                    warn!(gateway_id = %gateway.id, misses, "gateway degraded");
                    gateway.state = GatewayState::Degraded;
                    gateway.state_reason = Some(e.to_string());
                }
            }
        }

        if let Err(e) = self.store.update_gateway(&gateway).await {
            error!(gateway_id = %gateway.id, error = %e, "failed to persist gateway");
            return;
        }

        // Degraded gateways keep serving already-applied peers; pushes stay
        // queued until the agent answers again.
        if gateway.state == GatewayState::Running {
            self.dispatch_pushes(&gateway).await;
        }
    }

    /// Converge the live peer set with the desired one, FIFO per gateway.
    async fn dispatch_pushes(&self, gateway: &Gateway) {
        if self.queues.pending(gateway.id) == 0 {
            return;
        }
        if let Some(backoff) = self.push_backoff.get(&gateway.id) {
            if Instant::now() < backoff.next_after {
                debug!(gateway_id = %gateway.id, "push backoff in effect");
                return;
            }
        }
        let Some(endpoint) = gateway.public_addr.clone() else {
            return;
        };

        let set = match registry::desired_set(
            self.store.as_ref(),
            gateway,
            self.settings.listen_port,
        )
        .await
        {
            Ok(set) => set,
            Err(e) => {
                error!(gateway_id = %gateway.id, error = %e, "failed to build desired set");
                return;
            }
        };

        // Compare before applying: an unchanged desired set must not churn
        // the interface.
        let outcome = match self.agent.current_config(&endpoint).await {
            Ok(applied) if set.config.matches(&applied) => {
                debug!(gateway_id = %gateway.id, "applied set already matches desired");
                Ok(applied)
            }
            Ok(_) => self.agent.apply_config(&endpoint, &set.config).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => {
                if let Err(e) = self
                    .store
                    .set_peers_applied(gateway.id, &set.included)
                    .await
                {
                    error!(gateway_id = %gateway.id, error = %e, "failed to mark peers applied");
                    return;
                }
                for peer_id in &set.removing {
                    if let Err(e) = self.store.delete_peer(*peer_id).await {
                        error!(%peer_id, error = %e, "failed to delete removed peer");
                    }
                }
                let drained = self.queues.drain(gateway.id);
                self.push_backoff.remove(&gateway.id);
                self.record_ok(gateway.id);
                info!(
                    gateway_id = %gateway.id,
                    pushes = drained.len(),
                    peer_count = set.included.len(),
                    "peer set converged"
                );
            }
            Err(e) => {
                let failures = self
                    .push_backoff
                    .get(&gateway.id)
                    .map_or(0, |b| b.failures)
                    + 1;
                let delay = backoff_delay(
                    self.settings.push_backoff_start,
                    self.settings.push_backoff_cap,
                    failures,
                );
                self.push_backoff.insert(
                    gateway.id,
                    PushBackoff {
                        failures,
                        next_after: Instant::now() + delay,
                    },
                );
                self.record_error(gateway.id, &e);
                warn!(
                    gateway_id = %gateway.id,
                    error = %e,
                    failures,
                    retry_in = ?delay,
                    "peer-set push failed, backing off"
                );
            }
        }
    }

    /// `terminating → terminated`: clear peers, terminate, confirm, delete.
    ///
    /// Every external step is bounded; if the cloud never confirms, the
    /// record is marked terminated anyway so a stuck resource cannot block
    /// user-visible deletion.
    async fn teardown(&self, gateway: Gateway) {
        self.queues.cancel(gateway.id);

        let mut progress = self
            .teardowns
            .get(&gateway.id)
            .map(|p| *p)
            .unwrap_or_default();

        // Clear the live peer set first so no orphaned peers stay routable
        // on a machine that outlives us. Best-effort with a bounded budget.
        if !progress.peers_cleared {
            match gateway.public_addr.clone() {
                Some(endpoint) if progress.push_attempts < self.settings.teardown_push_attempts => {
                    let empty = DesiredConfig {
                        interface_address: format!(
                            "{}/{}",
                            subnet::gateway_address(gateway.subnet),
                            gateway.subnet.prefix()
                        ),
                        listen_port: self.settings.listen_port,
                        peers: Vec::new(),
                    };
                    match self.agent.apply_config(&endpoint, &empty).await {
                        Ok(_) => {
                            progress.peers_cleared = true;
                            info!(gateway_id = %gateway.id, "live peer set cleared");
                        }
                        Err(e) => {
                            progress.push_attempts += 1;
                            self.record_error(gateway.id, &e);
                            self.teardowns.insert(gateway.id, progress);
                            if progress.push_attempts < self.settings.teardown_push_attempts {
                                return;
                            }
                            warn!(
                                gateway_id = %gateway.id,
                                error = %e,
                                "giving up on clearing the peer set, terminating anyway"
                            );
                        }
                    }
                }
                Some(_) => {
                    // Budget already spent on earlier ticks.
                }
                None => {
                    progress.peers_cleared = true;
                }
            }
        }

        let Some(cloud_id) = gateway.cloud_id.clone() else {
            // Never got a machine; nothing to terminate or confirm.
            self.finish_teardown(gateway, true).await;
            return;
        };

        if !progress.terminate_issued {
            match self.provisioner.terminate_machine(&cloud_id).await {
                Ok(()) => {
                    progress.terminate_issued = true;
                    info!(gateway_id = %gateway.id, %cloud_id, "machine terminate issued");
                }
                Err(e) if e.is_fatal() => {
                    // The provider no longer knows the machine; treat it as
                    // already gone.
                    progress.terminate_issued = true;
                    warn!(gateway_id = %gateway.id, error = %e, "terminate rejected, assuming gone");
                }
                Err(e) => {
                    self.record_error(gateway.id, &e);
                    progress.confirm_attempts += 1;
                    if progress.confirm_attempts >= self.settings.terminate_confirm_attempts {
                        warn!(gateway_id = %gateway.id, "terminate never went through, marking terminated");
                        self.finish_teardown(gateway, false).await;
                        return;
                    }
                    self.teardowns.insert(gateway.id, progress);
                    return;
                }
            }
        }

        match self.provisioner.describe_machine(&cloud_id).await {
            Ok(desc) if desc.state == MachineState::Gone => {
                self.finish_teardown(gateway, true).await;
            }
            other => {
                if let Err(e) = other {
                    self.record_error(gateway.id, &e);
                }
                progress.confirm_attempts += 1;
                if progress.confirm_attempts >= self.settings.terminate_confirm_attempts {
                    warn!(
                        gateway_id = %gateway.id,
                        attempts = progress.confirm_attempts,
                        "termination unconfirmed after budget, marking terminated anyway"
                    );
                    self.finish_teardown(gateway, false).await;
                    return;
                }
                self.teardowns.insert(gateway.id, progress);
            }
        }
    }

    async fn finish_teardown(&self, mut gateway: Gateway, confirmed: bool) {
        let id = gateway.id;
        self.queues.cancel(id);
        self.health_misses.remove(&id);
        self.push_backoff.remove(&id);
        self.teardowns.remove(&id);

        if confirmed {
            if let Err(e) = self.store.delete_gateway(id).await {
                error!(gateway_id = %id, error = %e, "failed to delete gateway record");
                return;
            }
            self.attempts.remove(&id);
            self.locks.forget(id);
            info!(gateway_id = %id, "gateway deleted");
        } else {
            // Operator escape hatch: the record stays, flagged for
            // out-of-band cleanup, but its peers are gone from our side.
            if let Err(e) = self.store.delete_peers_by_gateway(id).await {
                error!(gateway_id = %id, error = %e, "failed to delete peers");
            }
            gateway.state = GatewayState::Terminated;
            gateway.state_reason = Some("termination unconfirmed by provider".to_string());
            if let Err(e) = self.store.update_gateway(&gateway).await {
                error!(gateway_id = %id, error = %e, "failed to persist gateway");
            }
            info!(gateway_id = %id, "gateway marked terminated without confirmation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 5; "first failure")]
    #[test_case(2, 10; "second doubles")]
    #[test_case(3, 20; "third doubles again")]
    #[test_case(7, 300; "capped at ceiling")]
    #[test_case(30, 300; "huge counts stay capped")]
    fn backoff_doubles_to_cap(failures: u32, expected_secs: u64) {
        let delay = backoff_delay(
            Duration::from_secs(5),
            Duration::from_secs(300),
            failures,
        );
        assert_eq!(delay, Duration::from_secs(expected_secs));
    }

    #[test]
    fn backoff_zero_failures_uses_start() {
        let delay = backoff_delay(Duration::from_secs(5), Duration::from_secs(300), 0);
        assert_eq!(delay, Duration::from_secs(5));
    }
}
