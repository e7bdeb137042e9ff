//! NetworkAttachmentDefinition type and lookup capability
//!
//! Only the metadata of a NetworkAttachmentDefinition matters to the injector:
//! its annotations name the device resource and node selector a network needs.

pub mod cache;

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cache::{NadCache, DEFAULT_STOP_TIMEOUT};

/// Spec for a NetworkAttachmentDefinition (k8s.cni.cncf.io/v1)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    shortname = "net-attach-def",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinitionSpec {
    /// CNI configuration JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// Annotations of one NetworkAttachmentDefinition
pub type Annotations = Arc<BTreeMap<String, String>>;

/// Point lookups of NetworkAttachmentDefinition annotations
///
/// `None` means the definition does not exist. A definition without
/// annotations yields an empty map.
pub trait NetworkDefinitions: Send + Sync {
    /// Annotations of `namespace/name`
    fn lookup(&self, namespace: &str, name: &str) -> Option<Annotations>;
}

/// Cache key of a definition
pub(crate) fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}
