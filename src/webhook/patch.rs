//! JSON patch construction
//!
//! Operations are emitted in a fixed order:
//! 1. empty `requests`/`limits` maps on container 0
//! 2. one request and one limit per aggregated resource
//! 3. `CONTAINER_NAME` env var for containers with hugepages
//! 4. merged node selector
//! 5. downward-API volume mount, then the volume
//! 6. operator and user injections
//!
//! Steps 1 and 2 only run when some network requested a resource.

use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EnvVar, ObjectFieldSelector, Pod,
    ResourceFieldSelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::Value;
use tracing::{debug, warn};

use super::aggregate::{DesiredNodeSelector, ResourceRequests};
use super::quantity::ParsedQuantity;
use crate::{CONTAINER_NAME_ENV, DOWNWARD_API_MOUNT_PATH, DOWNWARD_API_VOLUME_NAME};

/// Downward-API file exposing Pod labels
pub const LABELS_PATH: &str = "labels";

/// Downward-API file exposing Pod annotations
pub const ANNOTATIONS_PATH: &str = "annotations";

/// Hugepage sizes are exposed in MiB
pub const HUGEPAGE_DIVISOR: &str = "1Mi";

const HUGEPAGES_PREFIX: &str = "hugepages-";

/// A hugepage quantity exposed through the downward API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HugepageResource {
    /// `requests.hugepages-<size>` or `limits.hugepages-<size>`
    pub resource_name: String,
    /// Container the quantity belongs to
    pub container_name: String,
    /// File name in the downward-API volume
    pub path: String,
}

/// Everything the builder needs for one Pod
#[derive(Debug)]
pub struct PatchInputs<'a> {
    /// The Pod being admitted
    pub pod: &'a Pod,
    /// Aggregated resource counts
    pub requests: &'a ResourceRequests,
    /// Aggregated node selector
    pub node_selector: &'a DesiredNodeSelector,
    /// Add counts to existing requests/limits instead of replacing them
    pub honor_existing_resources: bool,
    /// Expose hugepage sizes through the downward API
    pub hugepage_down_api: bool,
    /// Selected operator then user injections
    pub injections: &'a [PatchOperation],
}

/// Build the ordered patch for one Pod
pub fn build_patch(inputs: &PatchInputs<'_>) -> Vec<PatchOperation> {
    let containers: &[Container] = inputs
        .pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();
    let first = containers.first();

    let mut ops = Vec::new();

    match first {
        Some(container) if !inputs.requests.is_empty() => {
            resource_patch(&mut ops, container, inputs.requests, inputs.honor_existing_resources);
        }
        None if !inputs.requests.is_empty() => {
            warn!("Pod has no containers, skipping resource injection");
        }
        _ => {}
    }

    let hugepages = if inputs.hugepage_down_api {
        hugepage_patch(&mut ops, containers)
    } else {
        Vec::new()
    };

    let existing_selector = inputs
        .pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_selector.as_ref());
    node_selector_patch(&mut ops, existing_selector, inputs.node_selector);

    if let Some(container) = first {
        let pod_has_volumes = inputs
            .pod
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.as_ref())
            .is_some_and(|v| !v.is_empty());
        volume_patch(&mut ops, container, pod_has_volumes, &hugepages);
    }

    ops.extend(inputs.injections.iter().cloned());
    ops
}

fn add(path: PointerBuf, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

fn container_path(index: usize, rest: &[&str]) -> PointerBuf {
    let index = index.to_string();
    let mut path = PointerBuf::from_tokens(["spec", "containers", index.as_str()]);
    for token in rest {
        path.push_back(*token);
    }
    path
}

fn resource_patch(
    ops: &mut Vec<PatchOperation>,
    container: &Container,
    requests: &ResourceRequests,
    honor_existing: bool,
) {
    let resources = container.resources.as_ref();
    let existing_requests = resources
        .and_then(|r| r.requests.as_ref())
        .filter(|m| !m.is_empty());
    let existing_limits = resources
        .and_then(|r| r.limits.as_ref())
        .filter(|m| !m.is_empty());

    if existing_requests.is_none() {
        ops.push(add(container_path(0, &["resources", "requests"]), Value::Object(Default::default())));
    }
    if existing_limits.is_none() {
        ops.push(add(container_path(0, &["resources", "limits"]), Value::Object(Default::default())));
    }

    for (name, count) in requests {
        let count = ParsedQuantity::from_count(*count);
        let (request, limit) = if honor_existing {
            (
                add_existing(existing_requests, name, count),
                add_existing(existing_limits, name, count),
            )
        } else {
            (count, count)
        };

        // PointerBuf escapes '~' and '/' in resource names
        ops.push(add(
            container_path(0, &["resources", "requests", name]),
            Value::String(request.to_string()),
        ));
        ops.push(add(
            container_path(0, &["resources", "limits", name]),
            Value::String(limit.to_string()),
        ));
    }
}

fn add_existing(
    existing: Option<&BTreeMap<String, Quantity>>,
    name: &str,
    count: ParsedQuantity,
) -> ParsedQuantity {
    let Some(current) = existing.and_then(|m| m.get(name)) else {
        return count;
    };
    match ParsedQuantity::parse(&current.0).map(|q| q.checked_add(count)) {
        Ok(Some(sum)) => sum,
        Ok(None) => {
            warn!(resource = %name, quantity = %current.0, "Existing quantity overflows, replacing it");
            count
        }
        Err(e) => {
            warn!(resource = %name, error = %e, "Cannot parse existing quantity, replacing it");
            count
        }
    }
}

/// Non-zero `hugepages-<size>` requests then limits of one container
pub fn detect_hugepages(container: &Container) -> Vec<HugepageResource> {
    let resources = container.resources.as_ref();
    let sections = [
        ("requests", "request", resources.and_then(|r| r.requests.as_ref())),
        ("limits", "limit", resources.and_then(|r| r.limits.as_ref())),
    ];

    let mut found = Vec::new();
    for (section, file_kind, quantities) in sections {
        let Some(quantities) = quantities else {
            continue;
        };
        for (name, quantity) in quantities {
            let Some(size) = name.strip_prefix(HUGEPAGES_PREFIX) else {
                continue;
            };
            match ParsedQuantity::parse(&quantity.0) {
                Ok(q) if !q.is_zero() => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(container = %container.name, resource = %name, error = %e, "Skipping unparseable hugepage quantity");
                    continue;
                }
            }
            let size = size.strip_suffix('i').unwrap_or(size);
            found.push(HugepageResource {
                resource_name: format!("{section}.{name}"),
                container_name: container.name.clone(),
                path: format!("hugepages_{size}_{file_kind}_{}", container.name),
            });
        }
    }
    found
}

fn hugepage_patch(ops: &mut Vec<PatchOperation>, containers: &[Container]) -> Vec<HugepageResource> {
    let mut all = Vec::new();
    for (index, container) in containers.iter().enumerate() {
        let found = detect_hugepages(container);
        if found.is_empty() {
            continue;
        }
        debug!(container = %container.name, count = found.len(), "Exposing hugepages through downward API");
        env_patch(ops, index, container);
        all.extend(found);
    }
    all
}

fn env_patch(ops: &mut Vec<PatchOperation>, index: usize, container: &Container) {
    let env = EnvVar {
        name: CONTAINER_NAME_ENV.to_string(),
        value: Some(container.name.clone()),
        ..Default::default()
    };

    match container.env.as_deref() {
        None | Some([]) => ops.push(add(
            container_path(index, &["env"]),
            serde_json::to_value(vec![env]).unwrap_or_default(),
        )),
        Some(existing) => {
            if let Some(current) = existing.iter().find(|e| e.name == CONTAINER_NAME_ENV) {
                if current.value.as_deref() != Some(container.name.as_str()) {
                    warn!(
                        container = %container.name,
                        value = ?current.value,
                        "Container already sets {CONTAINER_NAME_ENV} to a different value"
                    );
                }
                return;
            }
            ops.push(add(
                container_path(index, &["env", "-"]),
                serde_json::to_value(env).unwrap_or_default(),
            ));
        }
    }
}

fn node_selector_patch(
    ops: &mut Vec<PatchOperation>,
    existing: Option<&BTreeMap<String, String>>,
    desired: &DesiredNodeSelector,
) {
    let mut merged = existing.cloned().unwrap_or_default();
    merged.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    if merged.is_empty() {
        return;
    }
    ops.push(add(
        PointerBuf::from_tokens(["spec", "nodeSelector"]),
        serde_json::to_value(merged).unwrap_or_default(),
    ));
}

/// Downward-API volume carrying labels, annotations and hugepage sizes
pub fn downward_api_volume(hugepages: &[HugepageResource]) -> Volume {
    let field = |path: &str, field_path: &str| DownwardAPIVolumeFile {
        path: path.to_string(),
        field_ref: Some(ObjectFieldSelector {
            field_path: field_path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut items = vec![
        field(LABELS_PATH, "metadata.labels"),
        field(ANNOTATIONS_PATH, "metadata.annotations"),
    ];
    items.extend(hugepages.iter().map(|h| DownwardAPIVolumeFile {
        path: h.path.clone(),
        resource_field_ref: Some(ResourceFieldSelector {
            container_name: Some(h.container_name.clone()),
            divisor: Some(Quantity(HUGEPAGE_DIVISOR.to_string())),
            resource: h.resource_name.clone(),
        }),
        ..Default::default()
    }));

    Volume {
        name: DOWNWARD_API_VOLUME_NAME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(items),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_patch(
    ops: &mut Vec<PatchOperation>,
    container: &Container,
    pod_has_volumes: bool,
    hugepages: &[HugepageResource],
) {
    let mount = VolumeMount {
        name: DOWNWARD_API_VOLUME_NAME.to_string(),
        mount_path: DOWNWARD_API_MOUNT_PATH.to_string(),
        read_only: Some(false),
        ..Default::default()
    };
    let has_mounts = container
        .volume_mounts
        .as_ref()
        .is_some_and(|m| !m.is_empty());
    ops.push(if has_mounts {
        add(
            container_path(0, &["volumeMounts", "-"]),
            serde_json::to_value(mount).unwrap_or_default(),
        )
    } else {
        add(
            container_path(0, &["volumeMounts"]),
            serde_json::to_value(vec![mount]).unwrap_or_default(),
        )
    });

    let volume = downward_api_volume(hugepages);
    ops.push(if pod_has_volumes {
        add(
            PointerBuf::from_tokens(["spec", "volumes", "-"]),
            serde_json::to_value(volume).unwrap_or_default(),
        )
    } else {
        add(
            PointerBuf::from_tokens(["spec", "volumes"]),
            serde_json::to_value(vec![volume]).unwrap_or_default(),
        )
    });
}
