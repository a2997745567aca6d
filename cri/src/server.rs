//! Service wiring.
//!
//! Builds the runtime and image services around one engine client and runs
//! the streaming listener their exec/attach/port-forward URLs point at.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use dockershim_core::ShimConfig;

use crate::engine::EngineClient;
use crate::image_service::ImageService;
use crate::network::NetworkPlugin;
use crate::runtime_service::RuntimeService;
use crate::streaming::{StreamingRouter, StreamingServer};

/// The CRI runtime and image services plus their streaming endpoint.
pub struct CriServer {
    runtime: RuntimeService,
    images: ImageService,
    streaming: StreamingServer,
}

impl CriServer {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        network: Arc<dyn NetworkPlugin>,
        config: &ShimConfig,
    ) -> Self {
        let images = ImageService::new(engine.clone(), config.image_pull_progress_deadline());
        let router = StreamingRouter::new(engine.clone(), &config.streaming);
        let runtime = RuntimeService::new(engine, images.clone(), network, router.clone(), config);
        Self {
            runtime,
            images,
            streaming: StreamingServer::new(router),
        }
    }

    pub fn runtime(&self) -> &RuntimeService {
        &self.runtime
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    /// Serve streaming connections until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        match self.runtime.logs().is_cri_supported_log_driver().await {
            Ok(true) => {}
            Ok(false) => warn!("Engine logging driver does not support CRI log retrieval"),
            Err(e) => warn!(error = %e, "Cannot determine engine logging driver"),
        }

        let listener = TcpListener::bind(self.runtime.streaming().addr()).await?;
        tokio::select! {
            result = self.streaming.serve_listener(listener) => result,
            _ = shutdown => {
                info!("Shutting down");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cri_api::*;
    use crate::engine::FakeEngine;
    use crate::network::NoopNetworkPlugin;

    #[tokio::test]
    async fn test_services_share_engine() {
        let engine = FakeEngine::new();
        let server = CriServer::new(
            Arc::new(engine.clone()),
            Arc::new(NoopNetworkPlugin),
            &ShimConfig::default(),
        );

        server
            .images()
            .pull_image(PullImageRequest {
                image: Some(ImageSpec::new("busybox")),
                ..Default::default()
            })
            .await
            .unwrap();
        let listed = server
            .runtime()
            .list_pod_sandbox(ListPodSandboxRequest::default())
            .await
            .unwrap();
        assert!(listed.items.is_empty());
        assert_eq!(server.images().list_images(ListImagesRequest::default()).await.unwrap().images.len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut config = ShimConfig::default();
        config.streaming.addr = "127.0.0.1:0".parse().unwrap();
        let server = CriServer::new(
            Arc::new(FakeEngine::new()),
            Arc::new(NoopNetworkPlugin),
            &config,
        );
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run(async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
