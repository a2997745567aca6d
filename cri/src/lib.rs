//! dockershim CRI - Kubernetes Container Runtime Interface over the Docker engine.
//!
//! Maps CRI concepts onto a pod-agnostic engine:
//! - Pod Sandbox → infra container whose labels carry the pod identity
//! - Container → engine container joined to the infra container's namespaces

pub mod config_mapper;
pub mod container;
pub mod cri_api;
pub mod engine;
pub mod error;
pub mod image_service;
pub mod labels;
pub mod logs;
pub mod network;
pub mod runtime_service;
pub mod sandbox;
pub mod server;
pub mod streaming;
pub mod translate;
