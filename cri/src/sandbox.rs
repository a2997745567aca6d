//! Pod sandbox verbs.
//!
//! A sandbox is one infra container created from the pod infra image. Its
//! identity lives in the container's labels; application containers point
//! back at it through [`SANDBOX_ID_KEY`].

use tracing::{info, warn};

use dockershim_core::{EntityKind, Result, ShimError};

use crate::config_mapper::sandbox_create_config;
use crate::cri_api::*;
use crate::labels::{matches_selector, SandboxRecord, SANDBOX_ID_KEY};
use crate::network::PodNetworkRef;
use crate::runtime_service::RuntimeService;
use crate::translate;

impl RuntimeService {
    pub async fn run_pod_sandbox(&self, req: RunPodSandboxRequest) -> Result<RunPodSandboxResponse> {
        let config = req
            .config
            .ok_or_else(|| ShimError::InvalidArgument("pod sandbox config is required".to_string()))?;
        let create = sandbox_create_config(&config, &self.pod_infra_image)?;
        let name = create.name.clone();
        info!(sandbox = %name, image = %self.pod_infra_image, "CRI RunPodSandbox");

        self.images.ensure_image(&self.pod_infra_image).await?;

        let id = self.engine.create_container(create).await.map_err(|e| {
            if e.is_conflict() {
                ShimError::AlreadyExists {
                    kind: EntityKind::Sandbox,
                    id: name.clone(),
                }
            } else {
                e.classify(EntityKind::Sandbox, &name)
            }
        })?;

        if let Err(e) = self.engine.start_container(&id).await {
            if let Err(cleanup) = self.engine.remove_container(&id, true).await {
                warn!(sandbox_id = %id, error = %cleanup, "Failed to remove unstarted infra container");
            }
            return Err(e.classify(EntityKind::Sandbox, &id));
        }

        if !config.host_network() {
            let pod = pod_network_ref(&config, &id);
            if let Err(e) = self.network.set_up_pod(&pod).await {
                warn!(sandbox_id = %id, error = %e, "Pod network setup failed, tearing down");
                if let Err(teardown) = self.network.tear_down_pod(&pod).await {
                    warn!(sandbox_id = %id, error = %teardown, "Pod network teardown failed");
                }
                if let Err(stop) = self.engine.stop_container(&id, self.sandbox_stop_grace).await {
                    if !stop.is_not_modified() {
                        warn!(sandbox_id = %id, error = %stop, "Failed to stop infra container");
                    }
                }
                return Err(e);
            }
        }

        info!(sandbox_id = %id, "Pod sandbox ready");
        Ok(RunPodSandboxResponse { pod_sandbox_id: id })
    }

    /// Stop every container of the sandbox, release its network and stop the
    /// infra container. Stopping a missing sandbox succeeds.
    pub async fn stop_pod_sandbox(&self, req: StopPodSandboxRequest) -> Result<StopPodSandboxResponse> {
        let requested = req.pod_sandbox_id.as_str();
        info!(sandbox_id = %requested, "CRI StopPodSandbox");
        let details = match self.engine.inspect_container(requested).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => return Ok(StopPodSandboxResponse {}),
            Err(e) => return Err(e.classify(EntityKind::Sandbox, requested)),
        };
        let id = details.id.as_str();

        for container in self.sandbox_containers(id).await? {
            match self.engine.stop_container(&container, self.sandbox_stop_grace).await {
                Ok(()) => {}
                Err(e) if e.is_not_modified() || e.is_not_found() => {}
                Err(e) => return Err(e.classify(EntityKind::Container, &container)),
            }
        }

        if details.network_mode != "host" {
            match SandboxRecord::decode(&details.labels) {
                Ok(record) => {
                    let pod = PodNetworkRef {
                        namespace: record.metadata.namespace,
                        name: record.metadata.name,
                        sandbox_id: id.to_string(),
                    };
                    if let Err(e) = self.network.tear_down_pod(&pod).await {
                        warn!(sandbox_id = %id, error = %e, "Pod network teardown failed");
                    }
                }
                Err(e) => {
                    warn!(
                        sandbox_id = %id,
                        error = %e,
                        "Skipping pod network teardown, sandbox labels unusable"
                    );
                }
            }
        }

        match self.engine.stop_container(id, self.sandbox_stop_grace).await {
            Ok(()) => {}
            Err(e) if e.is_not_modified() || e.is_not_found() => {}
            Err(e) => return Err(e.classify(EntityKind::Sandbox, id)),
        }
        Ok(StopPodSandboxResponse {})
    }

    /// Remove the sandbox and everything in it, stopping it first if needed.
    pub async fn remove_pod_sandbox(
        &self,
        req: RemovePodSandboxRequest,
    ) -> Result<RemovePodSandboxResponse> {
        let requested = req.pod_sandbox_id.as_str();
        info!(sandbox_id = %requested, "CRI RemovePodSandbox");
        let details = match self.engine.inspect_container(requested).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => return Ok(RemovePodSandboxResponse {}),
            Err(e) => return Err(e.classify(EntityKind::Sandbox, requested)),
        };
        let id = details.id.clone();

        if details.state.running {
            self.stop_pod_sandbox(StopPodSandboxRequest {
                pod_sandbox_id: id.clone(),
            })
            .await?;
        }

        for container in self.sandbox_containers(&id).await? {
            match self.engine.remove_container(&container, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.classify(EntityKind::Container, &container)),
            }
        }
        match self.engine.remove_container(&id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.classify(EntityKind::Sandbox, &id)),
        }
        Ok(RemovePodSandboxResponse {})
    }

    pub async fn pod_sandbox_status(
        &self,
        req: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse> {
        let details = self.infra_container(&req.pod_sandbox_id).await?;
        let mut info = std::collections::HashMap::new();
        if req.verbose {
            let verbose = serde_json::json!({
                "image": details.image,
                "networkMode": details.network_mode,
                "containers": self.sandbox_containers(&details.id).await?,
            });
            info.insert("info".to_string(), verbose.to_string());
        }
        Ok(PodSandboxStatusResponse {
            status: Some(translate::sandbox_status(&details)),
            info,
        })
    }

    pub async fn list_pod_sandbox(&self, req: ListPodSandboxRequest) -> Result<ListPodSandboxResponse> {
        let filter = req.filter.unwrap_or_default();
        let containers = self
            .engine
            .list_containers(true)
            .await
            .map_err(|e| e.classify(EntityKind::Sandbox, "list"))?;

        let items = containers
            .iter()
            .filter_map(translate::sandbox_from_summary)
            .filter(|sb| filter.id.is_empty() || sb.id.starts_with(&filter.id))
            .filter(|sb| filter.state.as_ref().map_or(true, |s| s.state == sb.state))
            .filter(|sb| {
                filter.label_selector.is_empty() || matches_selector(&sb.labels, &filter.label_selector)
            })
            .collect();
        Ok(ListPodSandboxResponse { items })
    }

    /// Ids of all application containers, running or not, that belong to
    /// `sandbox_id`. Matches on the raw label so damaged entries still count.
    pub(crate) async fn sandbox_containers(&self, sandbox_id: &str) -> Result<Vec<String>> {
        let containers = self
            .engine
            .list_containers(true)
            .await
            .map_err(|e| e.classify(EntityKind::Sandbox, sandbox_id))?;
        Ok(containers
            .into_iter()
            .filter(|c| c.labels.get(SANDBOX_ID_KEY).map(String::as_str) == Some(sandbox_id))
            .map(|c| c.id)
            .collect())
    }
}

fn pod_network_ref(config: &PodSandboxConfig, sandbox_id: &str) -> PodNetworkRef {
    let metadata = config.metadata.clone().unwrap_or_default();
    PodNetworkRef {
        namespace: metadata.namespace,
        name: metadata.name,
        sandbox_id: sandbox_id.to_string(),
    }
}
