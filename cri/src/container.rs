//! Container verbs.
//!
//! Application containers join their sandbox's namespaces through the infra
//! container. Nothing is cached: each call goes back to the engine.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use dockershim_core::{EntityKind, Result, ShimError};

use crate::config_mapper::container_create_config;
use crate::cri_api::*;
use crate::labels::{matches_selector, ContainerRecord, SandboxRecord};
use crate::runtime_service::RuntimeService;
use crate::translate;

impl RuntimeService {
    pub async fn create_container(&self, req: CreateContainerRequest) -> Result<CreateContainerResponse> {
        let sandbox_id = req.pod_sandbox_id.as_str();
        let config = req
            .config
            .ok_or_else(|| ShimError::InvalidArgument("container config is required".to_string()))?;

        let sandbox = self.infra_container(sandbox_id).await?;
        let record = SandboxRecord::decode(&sandbox.labels).map_err(|e| {
            ShimError::not_found(EntityKind::Sandbox, sandbox_id, format!("unusable sandbox labels: {}", e))
        })?;
        if !sandbox.state.running {
            return Err(ShimError::conflict(
                EntityKind::Sandbox,
                sandbox_id,
                "sandbox is not ready",
            ));
        }

        let log_directory = req
            .sandbox_config
            .as_ref()
            .map(|c| c.log_directory.as_str());
        let create = container_create_config(&sandbox.id, &record.metadata, &config, log_directory)?;
        let name = create.name.clone();
        let image = create.image.clone();
        info!(sandbox_id = %sandbox.id, container = %name, image = %image, "CRI CreateContainer");

        self.engine.inspect_image(&image).await.map_err(|e| {
            if e.is_not_found() {
                ShimError::not_found(EntityKind::Image, &image, "image is not present, pull it first")
            } else {
                e.classify(EntityKind::Image, &image)
            }
        })?;

        let id = self.engine.create_container(create).await.map_err(|e| {
            if e.is_conflict() {
                return ShimError::AlreadyExists {
                    kind: EntityKind::Container,
                    id: name.clone(),
                };
            }
            if e.is_not_found() {
                return ShimError::not_found(EntityKind::Image, &image, e.to_string());
            }
            match e.classify(EntityKind::Container, &name) {
                ShimError::Unavailable(message) => ShimError::Unavailable(message),
                other => ShimError::internal(
                    EntityKind::Container,
                    &name,
                    format!("create failed: {}", other),
                ),
            }
        })?;
        Ok(CreateContainerResponse { container_id: id })
    }

    /// Only a created container is started. Starting a running one succeeds;
    /// an exited container is never brought back.
    pub async fn start_container(&self, req: StartContainerRequest) -> Result<StartContainerResponse> {
        let id = req.container_id.as_str();
        info!(container_id = %id, "CRI StartContainer");
        let details = self
            .engine
            .inspect_container(id)
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;
        match translate::container_state(&details) {
            ContainerState::ContainerCreated => {}
            ContainerState::ContainerRunning => return Ok(StartContainerResponse {}),
            ContainerState::ContainerExited => {
                return Err(ShimError::conflict(
                    EntityKind::Container,
                    id,
                    "container has exited and cannot be started again",
                ));
            }
            ContainerState::ContainerUnknown => {
                return Err(ShimError::conflict(
                    EntityKind::Container,
                    id,
                    format!("container is in state {:?}", details.state.status),
                ));
            }
        }
        match self.engine.start_container(&details.id).await {
            Ok(()) => Ok(StartContainerResponse {}),
            Err(e) if e.is_not_modified() => Ok(StartContainerResponse {}),
            Err(e) => Err(e.classify(EntityKind::Container, id)),
        }
    }

    /// Stopping a stopped container succeeds; a missing one does not.
    pub async fn stop_container(&self, req: StopContainerRequest) -> Result<StopContainerResponse> {
        let id = req.container_id.as_str();
        let grace = Duration::from_secs(req.timeout.max(0) as u64);
        info!(container_id = %id, ?grace, "CRI StopContainer");
        match self.engine.stop_container(id, grace).await {
            Ok(()) => Ok(StopContainerResponse {}),
            Err(e) if e.is_not_modified() => Ok(StopContainerResponse {}),
            Err(e) => Err(e.classify(EntityKind::Container, id)),
        }
    }

    /// Removing a missing container succeeds. A running container is only
    /// removed with `force`, after being stopped without grace.
    pub async fn remove_container(&self, req: RemoveContainerRequest) -> Result<RemoveContainerResponse> {
        let requested = req.container_id.as_str();
        info!(container_id = %requested, force = req.force, "CRI RemoveContainer");
        let details = match self.engine.inspect_container(requested).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => return Ok(RemoveContainerResponse {}),
            Err(e) => return Err(e.classify(EntityKind::Container, requested)),
        };
        let id = details.id.as_str();

        if details.state.running {
            if !req.force {
                return Err(ShimError::conflict(
                    EntityKind::Container,
                    id,
                    "container is running, stop it first or remove with force",
                ));
            }
            match self.engine.stop_container(id, Duration::ZERO).await {
                Ok(()) => {}
                Err(e) if e.is_not_modified() || e.is_not_found() => {}
                Err(e) => return Err(e.classify(EntityKind::Container, id)),
            }
        }

        match self.engine.remove_container(id, req.force).await {
            Ok(()) => Ok(RemoveContainerResponse {}),
            Err(e) if e.is_not_found() => Ok(RemoveContainerResponse {}),
            Err(e) => Err(e.classify(EntityKind::Container, id)),
        }
    }

    pub async fn container_status(&self, req: ContainerStatusRequest) -> Result<ContainerStatusResponse> {
        let id = req.container_id.as_str();
        let details = self
            .engine
            .inspect_container(id)
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;

        let mut info = HashMap::new();
        if req.verbose {
            let sandbox_id = ContainerRecord::decode(&details.labels)
                .map(|r| r.sandbox_id)
                .unwrap_or_default();
            let verbose = serde_json::json!({
                "sandboxId": sandbox_id,
                "tty": details.tty,
                "networkMode": details.network_mode,
            });
            info.insert("info".to_string(), verbose.to_string());
        }
        Ok(ContainerStatusResponse {
            status: Some(translate::container_status(&details)),
            info,
        })
    }

    pub async fn list_containers(&self, req: ListContainersRequest) -> Result<ListContainersResponse> {
        let filter = req.filter.unwrap_or_default();
        let summaries = self
            .engine
            .list_containers(true)
            .await
            .map_err(|e| e.classify(EntityKind::Container, "list"))?;

        let containers: Vec<Container> = summaries
            .iter()
            .filter_map(translate::container_from_summary)
            .filter(|c| filter.id.is_empty() || c.id.starts_with(&filter.id))
            .filter(|c| filter.pod_sandbox_id.is_empty() || c.pod_sandbox_id == filter.pod_sandbox_id)
            .filter(|c| filter.state.as_ref().map_or(true, |s| s.state == c.state))
            .filter(|c| {
                filter.label_selector.is_empty() || matches_selector(&c.labels, &filter.label_selector)
            })
            .collect();
        debug!(count = containers.len(), "CRI ListContainers");
        Ok(ListContainersResponse { containers })
    }

    pub async fn update_container_resources(
        &self,
        req: UpdateContainerResourcesRequest,
    ) -> Result<UpdateContainerResourcesResponse> {
        let id = req.container_id.as_str();
        let Some(resources) = req.linux else {
            return Ok(UpdateContainerResourcesResponse {});
        };
        self.engine
            .update_container(id, translate::resources_to_engine(&resources))
            .await
            .map_err(|e| e.classify(EntityKind::Container, id))?;
        Ok(UpdateContainerResourcesResponse {})
    }
}
