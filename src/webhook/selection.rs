//! Network selection annotation parser
//!
//! Accepts both forms the Multus annotations use:
//! - JSON array: `[{"name":"net1","namespace":"ns1","interface":"eth1"}]`
//! - shorthand:  `ns1/net1@eth1, net2`

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// One requested network attachment
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct NetworkSelectionElement {
    /// Namespace of the NetworkAttachmentDefinition
    #[serde(default)]
    pub namespace: String,
    /// Name of the NetworkAttachmentDefinition
    pub name: String,
    /// Requested interface name inside the Pod
    #[serde(default, rename = "interface")]
    pub interface_request: String,
}

impl NetworkSelectionElement {
    /// Element with no interface request
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            interface_request: String::new(),
        }
    }
}

/// Errors from parsing a selection annotation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// A shorthand unit that cannot be parsed
    #[error("invalid network selection element '{unit}': {reason}")]
    MalformedSelection {
        /// The offending unit
        unit: String,
        /// What is wrong with it
        reason: String,
    },
}

impl SelectionError {
    fn malformed(unit: &str, reason: impl Into<String>) -> Self {
        Self::MalformedSelection {
            unit: unit.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parse a selection annotation value.
///
/// An empty value yields no elements. Elements without a namespace get
/// `default_namespace`.
pub fn parse_network_selections(
    input: &str,
    default_namespace: &str,
) -> Result<Vec<NetworkSelectionElement>, SelectionError> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }

    // JSON `null` selects nothing
    let mut elements = match serde_json::from_str::<Option<Vec<NetworkSelectionElement>>>(input) {
        Ok(elements) => elements.unwrap_or_default(),
        Err(e) => {
            debug!(error = %e, "Selection is not a JSON array, parsing as comma separated list");
            input
                .split(',')
                .map(|unit| parse_selection_unit(unit.trim(), default_namespace))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    for element in &mut elements {
        if element.namespace.is_empty() {
            element.namespace = default_namespace.to_string();
        }
    }
    Ok(elements)
}

/// Parse one `[namespace/]name[@interface]` unit
fn parse_selection_unit(
    unit: &str,
    default_namespace: &str,
) -> Result<NetworkSelectionElement, SelectionError> {
    let (namespace, rest) = match unit.split_once('/') {
        None => (default_namespace, unit),
        Some((_, rest)) if rest.contains('/') => {
            return Err(SelectionError::malformed(unit, "more than one '/'"));
        }
        Some((namespace, rest)) => (namespace, rest),
    };

    let (name, interface) = match rest.split_once('@') {
        None => (rest, ""),
        Some((_, iface)) if iface.contains('@') => {
            return Err(SelectionError::malformed(unit, "more than one '@'"));
        }
        Some((name, iface)) => (name, iface),
    };

    for part in [namespace, name, interface] {
        if !part.is_empty() && !is_dns_label(part) {
            return Err(SelectionError::malformed(
                unit,
                format!("'{part}' is not a valid DNS label"),
            ));
        }
    }

    Ok(NetworkSelectionElement {
        namespace: namespace.to_string(),
        name: name.to_string(),
        interface_request: interface.to_string(),
    })
}

/// `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$`
fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            alnum(first) && alnum(last) && bytes.iter().all(|b| alnum(b) || *b == b'-')
        }
        _ => false,
    }
}
