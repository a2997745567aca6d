//! Pod metadata encoded as engine labels.
//!
//! The engine has no notion of a pod, so everything CRI needs to rebuild a
//! sandbox or container record is stored in the labels of the engine
//! container backing it. Keys fall into three disjoint namespaces:
//!
//! - `io.kubernetes.cri.*` - reserved keys written by the shim
//! - `label.<key>` - CRI labels supplied by the caller
//! - `annotation.<key>` - CRI annotations supplied by the caller
//!
//! Caller-supplied keys are always prefixed, so no caller input can collide
//! with a reserved key and decoding an encoded record gives back exactly the
//! record that was encoded.
//!
//! # Reserved keys
//!
//! - `io.kubernetes.cri.type` - `sandbox` or `container`
//! - `io.kubernetes.cri.pod.name`, `.pod.namespace`, `.pod.uid`, `.pod.attempt`
//! - `io.kubernetes.cri.container.name`, `.container.attempt`
//! - `io.kubernetes.cri.sandbox.id` - owning sandbox of a container
//! - `io.kubernetes.cri.container.log-path`
//!
//! Engine containers without a type key were not created by the shim and are
//! ignored by listings.

use std::collections::HashMap;

use thiserror::Error;

use crate::cri_api::{ContainerMetadata, PodSandboxMetadata};

pub const RESERVED_PREFIX: &str = "io.kubernetes.cri.";
pub const LABEL_PREFIX: &str = "label.";
pub const ANNOTATION_PREFIX: &str = "annotation.";

pub const TYPE_KEY: &str = "io.kubernetes.cri.type";
pub const POD_NAME_KEY: &str = "io.kubernetes.cri.pod.name";
pub const POD_NAMESPACE_KEY: &str = "io.kubernetes.cri.pod.namespace";
pub const POD_UID_KEY: &str = "io.kubernetes.cri.pod.uid";
pub const POD_ATTEMPT_KEY: &str = "io.kubernetes.cri.pod.attempt";
pub const CONTAINER_NAME_KEY: &str = "io.kubernetes.cri.container.name";
pub const CONTAINER_ATTEMPT_KEY: &str = "io.kubernetes.cri.container.attempt";
pub const SANDBOX_ID_KEY: &str = "io.kubernetes.cri.sandbox.id";
pub const LOG_PATH_KEY: &str = "io.kubernetes.cri.container.log-path";

const TYPE_SANDBOX: &str = "sandbox";
const TYPE_CONTAINER: &str = "container";

/// Label decoding failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("missing label {0}")]
    Missing(&'static str),

    #[error("malformed label {key}={value}: {reason}")]
    Malformed {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("entry is a {found}, expected a {expected}")]
    WrongType {
        expected: &'static str,
        found: String,
    },
}

/// What kind of CRI entity an engine container backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Sandbox,
    Container,
}

/// Classify an engine container by its labels. `None` means not ours.
pub fn entry_type(labels: &HashMap<String, String>) -> Option<EntryType> {
    match labels.get(TYPE_KEY).map(String::as_str) {
        Some(TYPE_SANDBOX) => Some(EntryType::Sandbox),
        Some(TYPE_CONTAINER) => Some(EntryType::Container),
        _ => None,
    }
}

/// Sandbox identity recovered from an infra container's labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxRecord {
    pub metadata: PodSandboxMetadata,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl SandboxRecord {
    pub fn encode(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(TYPE_KEY.to_string(), TYPE_SANDBOX.to_string());
        out.insert(POD_NAME_KEY.to_string(), self.metadata.name.clone());
        out.insert(POD_NAMESPACE_KEY.to_string(), self.metadata.namespace.clone());
        out.insert(POD_UID_KEY.to_string(), self.metadata.uid.clone());
        out.insert(POD_ATTEMPT_KEY.to_string(), self.metadata.attempt.to_string());
        encode_user(&mut out, &self.labels, &self.annotations);
        out
    }

    pub fn decode(labels: &HashMap<String, String>) -> Result<Self, LabelError> {
        expect_type(labels, TYPE_SANDBOX)?;
        let (user_labels, annotations) = decode_user(labels);
        Ok(Self {
            metadata: PodSandboxMetadata {
                name: required(labels, POD_NAME_KEY)?,
                namespace: required(labels, POD_NAMESPACE_KEY)?,
                uid: required(labels, POD_UID_KEY)?,
                attempt: attempt(labels, POD_ATTEMPT_KEY)?,
            },
            labels: user_labels,
            annotations,
        })
    }
}

/// Container identity recovered from an engine container's labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerRecord {
    pub metadata: ContainerMetadata,
    pub sandbox_id: String,
    pub log_path: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl ContainerRecord {
    pub fn encode(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(TYPE_KEY.to_string(), TYPE_CONTAINER.to_string());
        out.insert(CONTAINER_NAME_KEY.to_string(), self.metadata.name.clone());
        out.insert(
            CONTAINER_ATTEMPT_KEY.to_string(),
            self.metadata.attempt.to_string(),
        );
        out.insert(SANDBOX_ID_KEY.to_string(), self.sandbox_id.clone());
        out.insert(LOG_PATH_KEY.to_string(), self.log_path.clone());
        encode_user(&mut out, &self.labels, &self.annotations);
        out
    }

    pub fn decode(labels: &HashMap<String, String>) -> Result<Self, LabelError> {
        expect_type(labels, TYPE_CONTAINER)?;
        let sandbox_id = required(labels, SANDBOX_ID_KEY)?;
        if sandbox_id.is_empty() {
            return Err(LabelError::Malformed {
                key: SANDBOX_ID_KEY,
                value: sandbox_id,
                reason: "empty sandbox id".to_string(),
            });
        }
        let (user_labels, annotations) = decode_user(labels);
        Ok(Self {
            metadata: ContainerMetadata {
                name: required(labels, CONTAINER_NAME_KEY)?,
                attempt: attempt(labels, CONTAINER_ATTEMPT_KEY)?,
            },
            sandbox_id,
            // Older entries may lack a log path; that is not fatal.
            log_path: labels.get(LOG_PATH_KEY).cloned().unwrap_or_default(),
            labels: user_labels,
            annotations,
        })
    }
}

fn encode_user(
    out: &mut HashMap<String, String>,
    labels: &HashMap<String, String>,
    annotations: &HashMap<String, String>,
) {
    for (k, v) in labels {
        out.insert(format!("{}{}", LABEL_PREFIX, k), v.clone());
    }
    for (k, v) in annotations {
        out.insert(format!("{}{}", ANNOTATION_PREFIX, k), v.clone());
    }
}

fn decode_user(labels: &HashMap<String, String>) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut user_labels = HashMap::new();
    let mut annotations = HashMap::new();
    for (key, value) in labels {
        if let Some(k) = key.strip_prefix(LABEL_PREFIX) {
            user_labels.insert(k.to_string(), value.clone());
        } else if let Some(k) = key.strip_prefix(ANNOTATION_PREFIX) {
            annotations.insert(k.to_string(), value.clone());
        }
    }
    (user_labels, annotations)
}

fn expect_type(labels: &HashMap<String, String>, expected: &'static str) -> Result<(), LabelError> {
    let found = labels.get(TYPE_KEY).ok_or(LabelError::Missing(TYPE_KEY))?;
    if found != expected {
        return Err(LabelError::WrongType {
            expected,
            found: found.clone(),
        });
    }
    Ok(())
}

fn required(labels: &HashMap<String, String>, key: &'static str) -> Result<String, LabelError> {
    labels.get(key).cloned().ok_or(LabelError::Missing(key))
}

fn attempt(labels: &HashMap<String, String>, key: &'static str) -> Result<u32, LabelError> {
    let raw = labels.get(key).ok_or(LabelError::Missing(key))?;
    raw.parse::<u32>().map_err(|e| LabelError::Malformed {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

/// Whether every selector entry is present with the same value.
pub fn matches_selector(
    labels: &HashMap<String, String>,
    selector: &HashMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map_or(false, |actual| actual == v))
}
