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

//! End-to-end lifecycle tests against in-memory fakes: a scriptable cloud,
//! a scriptable agent, the real store, registry and reconciler.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use gatehouse_core::error::{LifecycleError, ProvisionError, RegistryError, RenderError};
use gatehouse_core::error::AgentError;
use gatehouse_core::keys;
use gatehouse_core::lock::GatewayLocks;
use gatehouse_core::provider::{CloudProvisioner, GatewayAgent};
use gatehouse_core::queue::{PushQueues, PushReason};
use gatehouse_core::reconcile::Reconciler;
use gatehouse_core::registry::Registry;
use gatehouse_core::render;
use gatehouse_core::settings::ReconcilerSettings;
use gatehouse_core::store::memory::MemoryStore;
use gatehouse_core::store::Store;
use gatehouse_core::subnet;
use gatehouse_types::agent::{AppliedConfig, DesiredConfig, InterfaceStatus};
use gatehouse_types::cloud::{MachineDescription, MachineSpec, MachineState};
use gatehouse_types::{Gateway, GatewayState};

const KEY_SECRET: [u8; 32] = [7u8; 32];

/// Cloud fake: machine state is set by the test, every call is counted.
struct FakeCloud {
    create_calls: AtomicU32,
    terminate_calls: AtomicU32,
    fail_create: AtomicBool,
    create_error_transient: AtomicBool,
    fail_terminate: AtomicBool,
    machine_state: Mutex<MachineState>,
    public_addr: Mutex<Option<String>>,
}

impl FakeCloud {
    fn new() -> Self {
        Self {
            create_calls: AtomicU32::new(0),
            terminate_calls: AtomicU32::new(0),
            fail_create: AtomicBool::new(false),
            create_error_transient: AtomicBool::new(false),
            fail_terminate: AtomicBool::new(false),
            machine_state: Mutex::new(MachineState::Pending),
            public_addr: Mutex::new(None),
        }
    }

    fn set_active(&self, addr: &str) {
        *self.machine_state.lock().unwrap() = MachineState::Active;
        *self.public_addr.lock().unwrap() = Some(addr.to_string());
    }

    fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

impl CloudProvisioner for FakeCloud {
    async fn create_machine(&self, _spec: &MachineSpec) -> Result<String, ProvisionError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(if self.create_error_transient.load(Ordering::SeqCst) {
                ProvisionError::Transient("api throttled".into())
            } else {
                ProvisionError::Fatal("instance quota exceeded".into())
            });
        }
        Ok("m-0123456789".to_string())
    }

    async fn describe_machine(&self, _cloud_id: &str) -> Result<MachineDescription, ProvisionError> {
        Ok(MachineDescription {
            state: *self.machine_state.lock().unwrap(),
            public_addr: self.public_addr.lock().unwrap().clone(),
        })
    }

    async fn terminate_machine(&self, _cloud_id: &str) -> Result<(), ProvisionError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate.load(Ordering::SeqCst) {
            return Err(ProvisionError::Transient("api throttled".into()));
        }
        *self.machine_state.lock().unwrap() = MachineState::Gone;
        Ok(())
    }
}

/// Agent fake: remembers the last applied peer set, flips reachable/up on
/// demand, counts apply calls so idempotence is observable.
struct FakeAgent {
    reachable: AtomicBool,
    iface_up: AtomicBool,
    apply_calls: AtomicU32,
    applied: Mutex<AppliedConfig>,
    public_key: Mutex<Option<String>>,
}

impl FakeAgent {
    fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            iface_up: AtomicBool::new(true),
            apply_calls: AtomicU32::new(0),
            applied: Mutex::new(AppliedConfig::default()),
            public_key: Mutex::new(Some("srv-pub-key".to_string())),
        }
    }

    fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    fn applied_peer_count(&self) -> usize {
        self.applied.lock().unwrap().peers.len()
    }
}

impl GatewayAgent for FakeAgent {
    async fn apply_config(
        &self,
        _endpoint: &str,
        desired: &DesiredConfig,
    ) -> Result<AppliedConfig, AgentError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AgentError::Unreachable("connection timed out".into()));
        }
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let applied = AppliedConfig {
            peers: desired.peers.clone(),
        };
        *self.applied.lock().unwrap() = applied.clone();
        Ok(applied)
    }

    async fn current_config(&self, _endpoint: &str) -> Result<AppliedConfig, AgentError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AgentError::Unreachable("connection timed out".into()));
        }
        Ok(self.applied.lock().unwrap().clone())
    }

    async fn interface_status(&self, _endpoint: &str) -> Result<InterfaceStatus, AgentError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AgentError::Unreachable("connection timed out".into()));
        }
        Ok(InterfaceStatus {
            up: self.iface_up.load(Ordering::SeqCst),
            public_key: self.public_key.lock().unwrap().clone(),
        })
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    cloud: Arc<FakeCloud>,
    agent: Arc<FakeAgent>,
    queues: Arc<PushQueues>,
    reconciler: Arc<Reconciler<MemoryStore, FakeCloud, FakeAgent>>,
    registry: Registry<MemoryStore>,
}

fn harness() -> Harness {
    harness_with(ReconcilerSettings::default())
}

fn harness_with(settings: ReconcilerSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cloud = Arc::new(FakeCloud::new());
    let agent = Arc::new(FakeAgent::new());
    let locks = Arc::new(GatewayLocks::new());
    let queues = Arc::new(PushQueues::new());
    let settings = Arc::new(settings);

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&cloud),
        Arc::clone(&agent),
        Arc::clone(&settings),
        Arc::clone(&locks),
        Arc::clone(&queues),
    ));
    let registry = Registry::new(Arc::clone(&store), locks, Arc::clone(&queues), settings, KEY_SECRET);

    Harness {
        store,
        cloud,
        agent,
        queues,
        reconciler,
        registry,
    }
}

impl Harness {
    async fn tick(&self) {
        Arc::clone(&self.reconciler).tick().await;
    }

    async fn gateway(&self, id: Uuid) -> Option<Gateway> {
        self.store.gateway(id).await.unwrap()
    }

    /// Drive a fresh gateway all the way to running.
    async fn running_gateway(&self) -> Gateway {
        let gw = self
            .reconciler
            .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
            .await
            .unwrap();
        self.cloud.set_active("203.0.113.10");
        self.tick().await; // requested -> provisioning
        self.tick().await; // provisioning -> running
        let gw = self.gateway(gw.id).await.unwrap();
        assert_eq!(gw.state, GatewayState::Running);
        gw
    }
}

#[tokio::test]
async fn gateway_provisions_to_running() {
    let h = harness();
    let gw = h
        .reconciler
        .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
        .await
        .unwrap();
    assert_eq!(gw.state, GatewayState::Requested);

    h.tick().await;
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Provisioning);
    assert_eq!(gw.cloud_id.as_deref(), Some("m-0123456789"));
    assert_eq!(h.cloud.create_calls(), 1);

    // Machine pending: another poll makes no transition.
    h.tick().await;
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Provisioning);

    h.cloud.set_active("203.0.113.10");
    h.tick().await;
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Running);
    assert_eq!(gw.public_addr.as_deref(), Some("203.0.113.10"));
    assert_eq!(gw.public_key.as_deref(), Some("srv-pub-key"));
    assert_eq!(h.cloud.create_calls(), 1);
}

#[tokio::test]
async fn failed_create_is_not_retried() {
    let h = harness();
    h.cloud.fail_create.store(true, Ordering::SeqCst);
    let gw = h
        .reconciler
        .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
        .await
        .unwrap();

    h.tick().await;
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Failed);
    assert!(gw.state_reason.as_deref().unwrap().contains("quota"));

    // Failed is terminal: further ticks never touch the cloud again.
    h.tick().await;
    h.tick().await;
    assert_eq!(h.cloud.create_calls(), 1);
}

#[tokio::test]
async fn transient_create_failure_is_also_terminal() {
    let h = harness();
    h.cloud.fail_create.store(true, Ordering::SeqCst);
    h.cloud.create_error_transient.store(true, Ordering::SeqCst);
    let gw = h
        .reconciler
        .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
        .await
        .unwrap();

    h.tick().await;
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Failed);
    assert!(gw.state_reason.as_deref().unwrap().contains("throttled"));
    assert_eq!(h.cloud.create_calls(), 1);
}

#[tokio::test]
async fn provisioning_timeout_fails_and_terminates_once() {
    let h = harness_with(ReconcilerSettings {
        provision_timeout: Duration::ZERO,
        ..ReconcilerSettings::default()
    });
    let gw = h
        .reconciler
        .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
        .await
        .unwrap();

    h.tick().await; // requested -> provisioning
    h.tick().await; // deadline already passed -> failed

    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Failed);
    assert_eq!(gw.state_reason.as_deref(), Some("provisioning timeout"));
    assert_eq!(h.cloud.terminate_calls(), 1);

    // Best-effort terminate is issued exactly once.
    h.tick().await;
    h.tick().await;
    assert_eq!(h.cloud.terminate_calls(), 1);
}

#[tokio::test]
async fn peer_addresses_are_monotonic_and_never_reused() {
    let h = harness();
    let gw = h.running_gateway().await;

    let a = h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    let b = h.registry.allocate(gw.id, "phone", "ios").await.unwrap();
    let c = h.registry.allocate(gw.id, "tablet", "ios").await.unwrap();
    assert_eq!(a.peer.host_index, 2);
    assert_eq!(b.peer.host_index, 3);
    assert_eq!(c.peer.host_index, 4);
    assert_eq!(
        subnet::host_address(gw.subnet, a.peer.host_index).to_string(),
        "10.10.0.2"
    );

    // Remove the middle peer and let the push converge its deletion.
    h.registry.deallocate(b.peer.id).await.unwrap();
    h.tick().await;
    assert!(h.store.peer(b.peer.id).await.unwrap().is_none());

    // The freed index is never handed out again.
    let d = h.registry.allocate(gw.id, "desktop", "windows").await.unwrap();
    assert_eq!(d.peer.host_index, 5);
    assert_eq!(
        subnet::host_address(gw.subnet, d.peer.host_index).to_string(),
        "10.10.0.5"
    );
}

#[tokio::test]
async fn capacity_exceeded_mutates_nothing() {
    let h = harness_with(ReconcilerSettings {
        max_peers_per_gateway: 2,
        ..ReconcilerSettings::default()
    });
    let gw = h.running_gateway().await;

    h.registry.allocate(gw.id, "one", "linux").await.unwrap();
    h.registry.allocate(gw.id, "two", "linux").await.unwrap();

    let err = h.registry.allocate(gw.id, "three", "linux").await.unwrap_err();
    assert!(matches!(err, RegistryError::CapacityExceeded { limit: 2 }));

    assert_eq!(h.store.count_peers(gw.id).await.unwrap(), 2);
    // The index cursor did not move for the rejected request.
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.next_host_index, 3);
}

#[tokio::test]
async fn peers_rejected_until_gateway_is_ready() {
    let h = harness();
    let gw = h
        .reconciler
        .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
        .await
        .unwrap();

    let err = h.registry.allocate(gw.id, "early", "linux").await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::GatewayNotReady {
            state: GatewayState::Requested
        }
    ));
    assert_eq!(h.store.count_peers(gw.id).await.unwrap(), 0);
}

#[tokio::test]
async fn push_applies_peer_and_is_idempotent() {
    let h = harness();
    let gw = h.running_gateway().await;

    let created = h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    assert!(!created.peer.applied);

    h.tick().await;
    let peer = h.store.peer(created.peer.id).await.unwrap().unwrap();
    assert!(peer.applied);
    assert_eq!(h.agent.apply_calls(), 1);
    assert_eq!(h.agent.applied_peer_count(), 1);

    // A push whose desired set already matches the live set must not
    // touch the interface again.
    h.queues.enqueue(gw.id, PushReason::PeerAdded(peer.id));
    h.tick().await;
    assert_eq!(h.agent.apply_calls(), 1);
    assert_eq!(h.queues.pending(gw.id), 0);
}

#[tokio::test]
async fn degraded_after_three_misses_then_recovery_flushes_queue() {
    let h = harness_with(ReconcilerSettings {
        push_backoff_start: Duration::ZERO,
        ..ReconcilerSettings::default()
    });
    let gw = h.running_gateway().await;

    let first = h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    h.tick().await;
    assert_eq!(h.agent.apply_calls(), 1);

    h.agent.set_reachable(false);
    // Allocation still works while the gateway is running or degraded;
    // the push just stays queued.
    let second = h.registry.allocate(gw.id, "phone", "ios").await.unwrap();

    h.tick().await;
    h.tick().await;
    let gw_mid = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw_mid.state, GatewayState::Running);

    h.tick().await;
    let gw_down = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw_down.state, GatewayState::Degraded);
    assert!(gw_down.state_reason.is_some());
    // Already-applied peers are untouched, new ones still pending.
    assert!(h.store.peer(first.peer.id).await.unwrap().unwrap().applied);
    assert!(!h.store.peer(second.peer.id).await.unwrap().unwrap().applied);
    assert!(h.queues.pending(gw.id) > 0);

    h.agent.set_reachable(true);
    h.tick().await;
    let gw_up = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw_up.state, GatewayState::Running);
    assert!(h.store.peer(second.peer.id).await.unwrap().unwrap().applied);
    assert_eq!(h.queues.pending(gw.id), 0);
    assert_eq!(h.agent.applied_peer_count(), 2);
}

#[tokio::test]
async fn gateway_delete_cascades_to_peers() {
    let h = harness();
    let gw = h.running_gateway().await;

    h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    h.registry.allocate(gw.id, "phone", "ios").await.unwrap();
    h.tick().await;
    assert_eq!(h.agent.applied_peer_count(), 2);

    let gw = h.reconciler.remove_gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Terminating);

    h.tick().await;
    assert!(h.gateway(gw.id).await.is_none());
    assert_eq!(h.store.count_peers(gw.id).await.unwrap(), 0);
    assert_eq!(h.cloud.terminate_calls(), 1);
    // The live peer set was cleared before the machine went away.
    assert_eq!(h.agent.applied_peer_count(), 0);
}

#[tokio::test]
async fn unconfirmed_termination_marks_record_terminated() {
    let h = harness_with(ReconcilerSettings {
        terminate_confirm_attempts: 2,
        ..ReconcilerSettings::default()
    });
    let gw = h.running_gateway().await;
    h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    h.tick().await;

    h.cloud.fail_terminate.store(true, Ordering::SeqCst);
    h.reconciler.remove_gateway(gw.id).await.unwrap();

    h.tick().await; // terminate fails, attempt 1
    assert_eq!(
        h.gateway(gw.id).await.unwrap().state,
        GatewayState::Terminating
    );

    h.tick().await; // attempt 2 exhausts the budget
    let gw = h.gateway(gw.id).await.unwrap();
    assert_eq!(gw.state, GatewayState::Terminated);
    assert!(gw.state_reason.as_deref().unwrap().contains("unconfirmed"));
    // The record survives for out-of-band cleanup, its peers do not.
    assert_eq!(h.store.count_peers(gw.id).await.unwrap(), 0);
}

#[tokio::test]
async fn config_renders_only_after_peer_applied() {
    let h = harness();
    let gw = h.running_gateway().await;
    let created = h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    let private_key = created.private_key.reveal();

    let gw_now = h.gateway(gw.id).await.unwrap();
    let pending = h.store.peer(created.peer.id).await.unwrap().unwrap();
    let err = render::client_config(&gw_now, &pending, &private_key, &[], 51820).unwrap_err();
    assert!(matches!(err, RenderError::PeerNotApplied));

    h.tick().await;
    let applied = h.store.peer(created.peer.id).await.unwrap().unwrap();
    let doc = render::client_config(
        &gw_now,
        &applied,
        &private_key,
        &["1.1.1.1".to_string()],
        51820,
    )
    .unwrap();
    assert!(doc.contains("Address = 10.10.0.2/32"));
    assert!(doc.contains("Endpoint = 203.0.113.10:51820"));
    assert!(doc.contains("PublicKey = srv-pub-key"));
    assert!(doc.contains(&format!("PrivateKey = {private_key}")));

    // The same key is recoverable from the sealed copy, nowhere else.
    let opened = keys::open(
        &KEY_SECRET,
        &applied.private_key_enc,
        &applied.private_key_nonce,
    )
    .unwrap();
    assert_eq!(opened, private_key);
}

#[tokio::test]
async fn per_user_gateway_cap_and_distinct_subnets() {
    let h = harness_with(ReconcilerSettings {
        max_gateways_per_user: 2,
        ..ReconcilerSettings::default()
    });
    let owner = Uuid::new_v4();

    let a = h
        .reconciler
        .request_gateway(owner, "us-east-1", "t3.micro")
        .await
        .unwrap();
    let b = h
        .reconciler
        .request_gateway(owner, "eu-west-1", "t3.micro")
        .await
        .unwrap();
    assert_ne!(a.subnet, b.subnet);

    let err = h
        .reconciler
        .request_gateway(owner, "us-east-1", "t3.micro")
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::TooManyGateways { limit: 2 }));

    // A different user is unaffected by the first user's cap.
    h.reconciler
        .request_gateway(Uuid::new_v4(), "us-east-1", "t3.micro")
        .await
        .unwrap();
}

#[tokio::test]
async fn deallocate_on_terminal_gateway_deletes_directly() {
    let h = harness();
    let gw = h.running_gateway().await;
    let created = h.registry.allocate(gw.id, "laptop", "linux").await.unwrap();
    h.tick().await;

    // The gateway dies out from under its peers.
    let mut dead = h.gateway(gw.id).await.unwrap();
    dead.state = GatewayState::Failed;
    dead.state_reason = Some("machine disappeared".to_string());
    h.store.update_gateway(&dead).await.unwrap();

    // Nothing live to converge: the record goes immediately, no push
    // gets queued.
    h.registry.deallocate(created.peer.id).await.unwrap();
    assert!(h.store.peer(created.peer.id).await.unwrap().is_none());
    assert_eq!(h.queues.pending(gw.id), 0);
}
