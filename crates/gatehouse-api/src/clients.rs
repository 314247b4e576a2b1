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

//! HTTP implementations of the provisioner and agent collaborators.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use gatehouse_core::error::{AgentError, ProvisionError};
use gatehouse_core::provider::{CloudProvisioner, GatewayAgent};
use gatehouse_types::agent::{AppliedConfig, DesiredConfig, InterfaceStatus};
use gatehouse_types::cloud::{MachineDescription, MachineSpec, MachineState};

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Client for the machine-provisioning service.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreatedMachine {
    id: String,
}

impl HttpProvisioner {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: build_client(Duration::from_secs(30)),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// 4xx means the request itself is bad and retrying is pointless; anything
/// else (throttling, 5xx, transport) is worth another poll.
fn provision_status_error(status: StatusCode, body: String) -> ProvisionError {
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        ProvisionError::Fatal(format!("{status}: {body}"))
    } else {
        ProvisionError::Transient(format!("{status}: {body}"))
    }
}

impl CloudProvisioner for HttpProvisioner {
    #[tracing::instrument(skip(self, spec), fields(region = %spec.region))]
    async fn create_machine(&self, spec: &MachineSpec) -> Result<String, ProvisionError> {
        let resp = self
            .client
            .post(self.url("/v1/machines"))
            .bearer_auth(&self.token)
            .json(spec)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, body = %body, "machine create rejected");
            return Err(provision_status_error(status, body));
        }

        let created: CreatedMachine = resp
            .json()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;
        debug!(machine_id = %created.id, "machine create accepted");
        Ok(created.id)
    }

    #[tracing::instrument(skip(self))]
    async fn describe_machine(&self, cloud_id: &str) -> Result<MachineDescription, ProvisionError> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/machines/{cloud_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        // An unknown machine is a definite answer, not a failure.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(MachineDescription {
                state: MachineState::Gone,
                public_addr: None,
            });
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provision_status_error(status, body));
        }

        resp.json()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))
    }

    #[tracing::instrument(skip(self))]
    async fn terminate_machine(&self, cloud_id: &str) -> Result<(), ProvisionError> {
        let resp = self
            .client
            .delete(self.url(&format!("/v1/machines/{cloud_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;

        // Already gone is the goal state.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(provision_status_error(status, body));
        }
        Ok(())
    }
}

/// Client for the agent process running on each gateway machine.
#[derive(Debug, Clone)]
pub struct HttpAgent {
    client: Client,
    port: u16,
}

impl HttpAgent {
    pub fn new(port: u16) -> Self {
        Self {
            // Agents answer from a single in-memory state; long timeouts
            // only delay degradation detection.
            client: build_client(Duration::from_secs(10)),
            port,
        }
    }

    fn url(&self, endpoint: &str, path: &str) -> String {
        format!("http://{endpoint}:{}{path}", self.port)
    }
}

async fn agent_error(resp: reqwest::Response) -> AgentError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status.is_client_error() {
        AgentError::Rejected(format!("{status}: {body}"))
    } else {
        AgentError::Unreachable(format!("{status}: {body}"))
    }
}

impl GatewayAgent for HttpAgent {
    #[tracing::instrument(skip(self, desired), fields(peer_count = desired.peers.len()))]
    async fn apply_config(
        &self,
        endpoint: &str,
        desired: &DesiredConfig,
    ) -> Result<AppliedConfig, AgentError> {
        let resp = self
            .client
            .put(self.url(endpoint, "/v1/config"))
            .json(desired)
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(agent_error(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))
    }

    #[tracing::instrument(skip(self))]
    async fn current_config(&self, endpoint: &str) -> Result<AppliedConfig, AgentError> {
        let resp = self
            .client
            .get(self.url(endpoint, "/v1/config"))
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(agent_error(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))
    }

    #[tracing::instrument(skip(self))]
    async fn interface_status(&self, endpoint: &str) -> Result<InterfaceStatus, AgentError> {
        let resp = self
            .client
            .get(self.url(endpoint, "/v1/interface"))
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(agent_error(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))
    }
}
