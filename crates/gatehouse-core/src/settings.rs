use std::time::Duration;

/// Tuning knobs for the reconciler and peer registry.
///
/// By default a gateway that is not running within five minutes is declared
/// failed, three missed health polls degrade it, and push retries back off
/// exponentially to a five minute ceiling.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Interval between scheduler ticks.
    pub tick_interval: Duration,
    /// Maximum wall-clock time a gateway may spend provisioning.
    pub provision_timeout: Duration,
    /// Consecutive failed health polls before `running → degraded`.
    pub health_fail_threshold: u32,
    /// First retry delay after a failed peer-set push.
    pub push_backoff_start: Duration,
    /// Ceiling for the exponential push backoff.
    pub push_backoff_cap: Duration,
    /// Attempts to clear the live peer set during teardown (best-effort).
    pub teardown_push_attempts: u32,
    /// Polls waiting for the cloud to confirm termination before the record
    /// is marked terminated anyway.
    pub terminate_confirm_attempts: u32,
    /// Maximum peers per gateway.
    pub max_peers_per_gateway: u32,
    /// Maximum live gateways per user.
    pub max_gateways_per_user: u32,
    /// WireGuard listen port on the gateway.
    pub listen_port: u16,
    /// DNS servers pushed into client configs.
    pub dns_servers: Vec<String>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            provision_timeout: Duration::from_secs(300),
            health_fail_threshold: 3,
            push_backoff_start: Duration::from_secs(5),
            push_backoff_cap: Duration::from_secs(300),
            teardown_push_attempts: 3,
            terminate_confirm_attempts: 5,
            max_peers_per_gateway: 16,
            max_gateways_per_user: 3,
            listen_port: 51820,
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}
