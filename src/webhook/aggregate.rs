//! Resource aggregation over network selections
//!
//! Every selected network contributes one unit of each device resource its
//! NetworkAttachmentDefinition names, plus at most one node-selector label.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use super::selection::NetworkSelectionElement;
use crate::nad::NetworkDefinitions;
use crate::NODE_SELECTOR_ANNOTATION_KEY;

/// Resource name to number of networks requesting it
pub type ResourceRequests = BTreeMap<String, i64>;

/// Node label to required value
pub type DesiredNodeSelector = BTreeMap<String, String>;

/// Errors that abort an admission call
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    /// The selected NetworkAttachmentDefinition does not exist
    #[error("could not find network attachment definition '{namespace}/{name}'")]
    DefinitionNotFound {
        /// Namespace of the selection
        namespace: String,
        /// Name of the selection
        name: String,
    },

    /// The node-selector annotation holds more than one label
    #[error("node selector in net-attach-def {network} has more than one label")]
    InvalidNodeSelector {
        /// Name of the offending definition
        network: String,
    },
}

/// Fold one selection into the running requests and node selector.
///
/// On error the caller discards both accumulators.
pub fn aggregate<D: NetworkDefinitions + ?Sized>(
    element: &NetworkSelectionElement,
    requests: &mut ResourceRequests,
    node_selector: &mut DesiredNodeSelector,
    resource_name_keys: &[String],
    definitions: &D,
) -> Result<(), AggregateError> {
    let annotations = definitions
        .lookup(&element.namespace, &element.name)
        .ok_or_else(|| AggregateError::DefinitionNotFound {
            namespace: element.namespace.clone(),
            name: element.name.clone(),
        })?;

    for key in resource_name_keys {
        if let Some(resource) = annotations.get(key) {
            *requests.entry(resource.clone()).or_insert(0) += 1;
            debug!(
                resource = %resource,
                namespace = %element.namespace,
                name = %element.name,
                "Resource requested for network"
            );
        }
    }

    if let Some(selector) = annotations.get(NODE_SELECTOR_ANNOTATION_KEY) {
        let mut parts = selector.split('=');
        let label = parts.next().unwrap_or_default().trim();
        let value = parts.next().map(str::trim).unwrap_or_default();
        if parts.next().is_some() {
            return Err(AggregateError::InvalidNodeSelector {
                network: element.name.clone(),
            });
        }
        node_selector.insert(label.to_string(), value.to_string());
    }

    Ok(())
}
