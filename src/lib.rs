//! Network Resources Injector - mutating admission webhook for Pod network resources
//!
//! Intercepts Pod creation, reads the Multus network-selection annotations and
//! injects everything the selected networks need before the Pod is persisted:
//! device resource requests/limits, node selectors, a downward-API volume
//! (labels, annotations and hugepage sizes) and operator/user-defined patches.
//!
//! # Architecture
//!
//! The admission path is synchronous and read-only with respect to shared state:
//! - [`webhook`] decodes the AdmissionReview and runs the decision pipeline
//!   (selection parsing, resource aggregation, patch building)
//! - [`nad`] mirrors NetworkAttachmentDefinition annotations so lookups never
//!   touch the API server on the hot path
//! - [`config`] holds the control switches and patch tables, refreshed by a
//!   periodic ConfigMap synchronizer
//!
//! # Modules
//!
//! - [`config`] - Control switches, patch tables and the ConfigMap synchronizer
//! - [`nad`] - NetworkAttachmentDefinition type and annotation cache
//! - [`webhook`] - Admission handler, selection parser, aggregator and patch builder
//! - [`signal`] - Open/closed lifecycle signal with bounded waits
//! - [`tls`] - Serving key pair loading and hot reload
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod nad;
pub mod signal;
pub mod tls;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the mutating webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// Default port for the plain-HTTP health check server
pub const DEFAULT_HEALTH_CHECK_PORT: u16 = 8444;

/// Default namespace holding the control ConfigMaps when `NAMESPACE` is unset
pub const DEFAULT_CONFIG_NAMESPACE: &str = "kube-system";

/// Default annotation key on a NetworkAttachmentDefinition naming its device resource
pub const DEFAULT_RESOURCE_NAME_KEY: &str = "k8s.v1.cni.cncf.io/resourceName";

/// Pod annotation listing additional networks
pub const NETWORKS_ANNOTATION_KEY: &str = "k8s.v1.cni.cncf.io/networks";

/// Pod annotation overriding the cluster default network
pub const DEFAULT_NETWORK_ANNOTATION_KEY: &str = "v1.multus-cni.io/default-network";

/// NetworkAttachmentDefinition annotation carrying a `label=value` node selector
pub const NODE_SELECTOR_ANNOTATION_KEY: &str = "k8s.v1.cni.cncf.io/nodeSelector";

/// Name of the ConfigMap holding control switches and user-defined injections
pub const CONTROL_SWITCHES_CONFIGMAP: &str = "nri-control-switches";

/// Name of the ConfigMap holding operator-defined injections (one patch per key)
pub const OPERATOR_INJECTIONS_CONFIGMAP: &str = "nri-user-defined-injections";

/// ConfigMap data key holding the JSON configuration document
pub const CONFIGMAP_MAIN_FILE_KEY: &str = "config.json";

/// Path where the downward-API volume is mounted in the first container
pub const DOWNWARD_API_MOUNT_PATH: &str = "/etc/podnetinfo";

/// Name of the injected downward-API volume
pub const DOWNWARD_API_VOLUME_NAME: &str = "podnetinfo";

/// Env var injected into containers that get hugepage files
pub const CONTAINER_NAME_ENV: &str = "CONTAINER_NAME";

/// Maximum accepted admission request body (1 MiB)
pub const MAX_REQUEST_BODY_BYTES: usize = 1 << 20;
