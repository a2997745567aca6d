//! Pod network plugin contract.
//!
//! The shim only calls the plugin; the network data plane is somebody else's.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use dockershim_core::Result;

/// What the plugin needs to know about a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNetworkRef {
    pub namespace: String,
    pub name: String,
    pub sandbox_id: String,
}

#[async_trait]
pub trait NetworkPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Wire up the sandbox's network namespace. Called before the sandbox is
    /// reported ready.
    async fn set_up_pod(&self, pod: &PodNetworkRef) -> Result<()>;

    /// Release whatever `set_up_pod` allocated. Called before the infra
    /// container is stopped.
    async fn tear_down_pod(&self, pod: &PodNetworkRef) -> Result<()>;
}

/// Plugin that leaves networking to the engine's default bridge.
#[derive(Debug, Default, Clone)]
pub struct NoopNetworkPlugin;

#[async_trait]
impl NetworkPlugin for NoopNetworkPlugin {
    fn name(&self) -> &str {
        "noop"
    }

    async fn set_up_pod(&self, _pod: &PodNetworkRef) -> Result<()> {
        Ok(())
    }

    async fn tear_down_pod(&self, _pod: &PodNetworkRef) -> Result<()> {
        Ok(())
    }
}

/// Call recorded by [`RecordingNetworkPlugin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCall {
    SetUp(String),
    TearDown(String),
}

/// Plugin that records calls and can be told to fail. Used by tests.
#[derive(Default, Clone)]
pub struct RecordingNetworkPlugin {
    calls: Arc<Mutex<Vec<NetworkCall>>>,
    fail_set_up: Arc<Mutex<Option<String>>>,
    fail_tear_down: Arc<Mutex<Option<String>>>,
}

impl RecordingNetworkPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<NetworkCall> {
        self.calls.lock().clone()
    }

    pub fn fail_set_up(&self, message: &str) {
        *self.fail_set_up.lock() = Some(message.to_string());
    }

    pub fn fail_tear_down(&self, message: &str) {
        *self.fail_tear_down.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl NetworkPlugin for RecordingNetworkPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    async fn set_up_pod(&self, pod: &PodNetworkRef) -> Result<()> {
        self.calls
            .lock()
            .push(NetworkCall::SetUp(pod.sandbox_id.clone()));
        match self.fail_set_up.lock().clone() {
            Some(message) => Err(dockershim_core::ShimError::internal(
                dockershim_core::EntityKind::Sandbox,
                pod.sandbox_id.clone(),
                message,
            )),
            None => Ok(()),
        }
    }

    async fn tear_down_pod(&self, pod: &PodNetworkRef) -> Result<()> {
        self.calls
            .lock()
            .push(NetworkCall::TearDown(pod.sandbox_id.clone()));
        match self.fail_tear_down.lock().clone() {
            Some(message) => Err(dockershim_core::ShimError::internal(
                dockershim_core::EntityKind::Sandbox,
                pod.sandbox_id.clone(),
                message,
            )),
            None => Ok(()),
        }
    }
}
