//! Pod mutation handler
//!
//! Transport problems (wrong content type, unreadable or non-AdmissionReview
//! body, undecodable Pod) are answered with an HTTP error status. Everything
//! else is answered with an AdmissionReview: business failures such as a
//! missing NetworkAttachmentDefinition deny the Pod through `allowed: false`.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tracing::{debug, error, info, warn};

use super::aggregate::{aggregate, AggregateError, DesiredNodeSelector, ResourceRequests};
use super::owner::resolve_namespace;
use super::patch::{build_patch, PatchInputs};
use super::selection::{parse_network_selections, SelectionError};
use super::WebhookState;
use crate::config::injections::{annotation_from_patches, select_for_labels};
use crate::config::ConfigSnapshot;
use crate::{DEFAULT_NETWORK_ANNOTATION_KEY, MAX_REQUEST_BODY_BYTES, NETWORKS_ANNOTATION_KEY};

/// Message returned for Pods that select no networks
pub const NO_NETWORKS_MESSAGE: &str = "Pod spec doesn't have network annotations. Skipping...";

const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors answered with an HTTP error status
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The body is not a usable AdmissionReview
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// Content-Type is not `application/json`
    #[error("invalid Content-Type {0:?}, expected `application/json`")]
    UnsupportedMediaType(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
            WebhookError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Business failures that deny the Pod
#[derive(Debug, thiserror::Error)]
enum Denial {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("{0}")]
    Namespace(String),
}

/// Handle `POST /mutate`
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    match read_review(&headers, body).await {
        Ok(req) => {
            let response = match mutate_pod(&state, &req).await {
                Ok(response) => response,
                Err(e) => return e.into_response(),
            };
            Json(response.into_review()).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejecting admission request");
            e.into_response()
        }
    }
}

async fn read_review(
    headers: &HeaderMap,
    body: Body,
) -> Result<AdmissionRequest<DynamicObject>, WebhookError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != JSON_CONTENT_TYPE {
        return Err(WebhookError::UnsupportedMediaType(content_type.to_string()));
    }

    let bytes = to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| WebhookError::InvalidReview(format!("failed to read body: {e}")))?;
    if bytes.is_empty() {
        return Err(WebhookError::InvalidReview("empty body".to_string()));
    }

    let review: AdmissionReview<DynamicObject> = serde_json::from_slice(&bytes)
        .map_err(|e| WebhookError::InvalidReview(e.to_string()))?;
    if review.types.kind != ADMISSION_REVIEW_KIND {
        return Err(WebhookError::InvalidReview(format!(
            "unexpected kind {:?}",
            review.types.kind
        )));
    }

    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|e| WebhookError::InvalidReview(format!("{e}")))?;
    Ok(request)
}

/// Decide on one admission request
pub async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> Result<AdmissionResponse, WebhookError> {
    let uid = request.uid.clone();

    let Some(object) = &request.object else {
        debug!(uid = %uid, "No object in request, allowing unchanged");
        return Ok(AdmissionResponse::from(request));
    };

    let mut pod: Pod = serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| WebhookError::InvalidReview(format!("failed to decode Pod: {e}")))?;

    if let Err(e) = fill_namespace(state, request, &mut pod).await {
        warn!(uid = %uid, error = %e, "Denying Pod");
        return Ok(AdmissionResponse::from(request).deny(e.to_string()));
    }

    let config = state.config.snapshot().await;
    let injections = selected_injections(&config, &pod);

    let default_network = network_annotation(&pod, DEFAULT_NETWORK_ANNOTATION_KEY, &injections);
    let networks = network_annotation(&pod, NETWORKS_ANNOTATION_KEY, &injections);
    if default_network.is_none() && networks.is_none() {
        info!(uid = %uid, "Pod spec doesn't have network annotations, skipping");
        let mut response = AdmissionResponse::from(request);
        response.result.message = NO_NETWORKS_MESSAGE.to_string();
        return Ok(response);
    }

    let (requests, node_selector) =
        match collect_requirements(state, &config, &pod, default_network, networks) {
            Ok(found) => found,
            Err(e) => {
                warn!(uid = %uid, error = %e, "Denying Pod");
                return Ok(AdmissionResponse::from(request).deny(e.to_string()));
            }
        };

    let switches = &config.switches;
    let ops = build_patch(&PatchInputs {
        pod: &pod,
        requests: &requests,
        node_selector: &node_selector,
        honor_existing_resources: switches.is_honor_existing_resources_enabled(),
        hugepage_down_api: switches.is_hugepage_down_api_enabled(),
        injections: &injections,
    });

    if ops.is_empty() {
        debug!(uid = %uid, "Nothing to inject");
        return Ok(AdmissionResponse::from(request));
    }

    info!(
        uid = %uid,
        pod = %pod_name(&pod),
        resources = requests.len(),
        patch_ops = ops.len(),
        "Mutating Pod"
    );

    Ok(
        match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %uid, error = %e, "Failed to serialize patch");
                AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
            }
        },
    )
}

/// Pod namespace, else request namespace, else the owner's namespace
async fn fill_namespace(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
    pod: &mut Pod,
) -> Result<(), Denial> {
    if pod.metadata.namespace.as_deref().is_some_and(|ns| !ns.is_empty()) {
        return Ok(());
    }
    if let Some(ns) = request.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        pod.metadata.namespace = Some(ns.to_string());
        return Ok(());
    }

    let owner = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.first())
        .ok_or_else(|| Denial::Namespace("pod namespace is not found".to_string()))?;

    match resolve_namespace(state.owners.as_ref(), owner).await {
        Ok(Some(ns)) => {
            debug!(namespace = %ns, owner = %owner.name, "Resolved Pod namespace from owner");
            pod.metadata.namespace = Some(ns);
            Ok(())
        }
        Ok(None) => Err(Denial::Namespace("pod namespace is not found".to_string())),
        Err(e) => Err(Denial::Namespace(format!(
            "failed to resolve pod namespace from {} {}: {e}",
            owner.kind, owner.name
        ))),
    }
}

/// Operator then user injections the Pod's labels opt into
fn selected_injections(config: &ConfigSnapshot, pod: &Pod) -> Vec<PatchOperation> {
    let labels = pod.metadata.labels.as_ref();
    let mut selected = select_for_labels(&config.operator_injections, labels);
    selected.extend(select_for_labels(&config.user_injections, labels));
    selected
}

/// Annotation from the Pod itself, else from an injected annotations patch
fn network_annotation(pod: &Pod, key: &str, injections: &[PatchOperation]) -> Option<String> {
    if let Some(value) = pod.metadata.annotations.as_ref().and_then(|a| a.get(key)) {
        return Some(value.clone());
    }
    annotation_from_patches(injections, key).map(|value| {
        debug!(key = %key, "Network annotation supplied by injection");
        value.to_string()
    })
}

fn collect_requirements(
    state: &WebhookState,
    config: &ConfigSnapshot,
    pod: &Pod,
    default_network: Option<String>,
    networks: Option<String>,
) -> Result<(ResourceRequests, DesiredNodeSelector), Denial> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let keys = config.switches.resource_name_keys();
    let definitions = state.definitions.as_ref();

    let mut requests = ResourceRequests::new();
    let mut node_selector = DesiredNodeSelector::new();

    if let Some(selection) = default_network.filter(|s| !s.is_empty()) {
        match parse_network_selections(&selection, &namespace)?.as_slice() {
            [element] => aggregate(element, &mut requests, &mut node_selector, keys, definitions)?,
            elements => warn!(
                count = elements.len(),
                "Default network annotation must select exactly one network, ignoring it"
            ),
        }
    }

    if let Some(selection) = networks.filter(|s| !s.is_empty()) {
        for element in parse_network_selections(&selection, &namespace)? {
            aggregate(&element, &mut requests, &mut node_selector, keys, definitions)?;
        }
    }

    Ok((requests, node_selector))
}

fn pod_name(pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, ControlSwitches, InjectionSource};
    use crate::nad::{NadCache, NetworkAttachmentDefinition, NetworkAttachmentDefinitionSpec};
    use crate::webhook::owner::MockOwnerNamespaceResolver;
    use crate::webhook::webhook_router;
    use axum::http::Request;
    use kube::runtime::watcher::Event;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    const FOO: &str = "example.com/foo";

    fn definition(namespace: &str, name: &str, annotations: &[(&str, &str)]) -> NetworkAttachmentDefinition {
        let mut nad = NetworkAttachmentDefinition::new(name, NetworkAttachmentDefinitionSpec::default());
        nad.metadata.namespace = Some(namespace.to_string());
        nad.metadata.resource_version = Some("1".to_string());
        nad.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        nad
    }

    fn state_with(owners: MockOwnerNamespaceResolver) -> Arc<WebhookState> {
        let cache = NadCache::new();
        cache.apply(Event::Apply(definition(
            "default",
            "sriov-net",
            &[(crate::DEFAULT_RESOURCE_NAME_KEY, FOO)],
        )));
        cache.apply(Event::Apply(definition(
            "default",
            "zoned",
            &[(crate::NODE_SELECTOR_ANNOTATION_KEY, "zone=a=b")],
        )));
        Arc::new(WebhookState::new(
            Arc::new(ConfigStore::new(ControlSwitches::new(
                false,
                false,
                crate::DEFAULT_RESOURCE_NAME_KEY,
            ))),
            Arc::new(cache),
            Arc::new(owners),
        ))
    }

    fn state() -> Arc<WebhookState> {
        state_with(MockOwnerNamespaceResolver::new())
    }

    fn review(pod: Value) -> Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "userInfo": {},
                "object": pod,
                "dryRun": false
            }
        })
    }

    fn pod_with_annotations(annotations: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "default", "annotations": annotations},
            "spec": {"containers": [{"name": "app", "image": "busybox"}]}
        })
    }

    async fn post(state: Arc<WebhookState>, content_type: &str, body: String) -> (StatusCode, Value) {
        let response = webhook_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mutate")
                    .header(CONTENT_TYPE, content_type)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn admit(state: Arc<WebhookState>, pod: Value) -> AdmissionResponse {
        let (status, body) = post(state, JSON_CONTENT_TYPE, review(pod).to_string()).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(body).unwrap();
        review.response.expect("review should carry a response")
    }

    fn patch_of(response: &AdmissionResponse) -> Value {
        serde_json::from_slice(response.patch.as_ref().expect("patch")).unwrap()
    }

    // =========================================================================
    // Transport errors
    // =========================================================================

    #[tokio::test]
    async fn wrong_content_type_is_415() {
        let (status, _) = post(state(), "text/plain", review(json!({})).to_string()).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn empty_body_is_400() {
        let (status, _) = post(state(), JSON_CONTENT_TYPE, String::new()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_400() {
        let body = " ".repeat(MAX_REQUEST_BODY_BYTES + 1);
        let (status, _) = post(state(), JSON_CONTENT_TYPE, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_admission_review_is_400() {
        let mut body = review(pod_with_annotations(json!({})));
        body["kind"] = json!("ConfigMap");
        let (status, _) = post(state(), JSON_CONTENT_TYPE, body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn undecodable_pod_is_400() {
        let pod = json!({"metadata": {"name": "p"}, "spec": {"containers": "nope"}});
        let (status, _) = post(state(), JSON_CONTENT_TYPE, review(pod).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: a Pod without network annotations is admitted untouched
    #[tokio::test]
    async fn story_no_networks_allowed_with_message() {
        let response = admit(state(), pod_with_annotations(json!({}))).await;
        assert!(response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.result.message, NO_NETWORKS_MESSAGE);
    }

    /// Story: an SR-IOV network gets its device requested
    #[tokio::test]
    async fn story_network_resource_is_injected() {
        let response = admit(
            state(),
            pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "sriov-net, sriov-net"})),
        )
        .await;
        assert!(response.allowed);

        let patch = patch_of(&response);
        let request = patch
            .as_array()
            .unwrap()
            .iter()
            .find(|op| op["path"] == "/spec/containers/0/resources/requests/example.com~1foo")
            .expect("resource request patch");
        assert_eq!(request["value"], "2");
    }

    /// Story: a dangling network reference denies the Pod with a readable reason
    #[tokio::test]
    async fn story_missing_definition_denies() {
        let response = admit(
            state(),
            pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "other/ghost"})),
        )
        .await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("other/ghost"));
    }

    /// Story: a malformed selection is a denial, not a transport error
    #[tokio::test]
    async fn story_malformed_selection_denies() {
        let response = admit(
            state(),
            pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "a/b/c"})),
        )
        .await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("a/b/c"));
    }

    #[tokio::test]
    async fn invalid_node_selector_denies() {
        let response = admit(
            state(),
            pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "zoned"})),
        )
        .await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("more than one label"));
    }

    /// Story: the default network contributes like any other selection
    #[tokio::test]
    async fn story_default_network_is_aggregated() {
        let response = admit(
            state(),
            pod_with_annotations(json!({
                DEFAULT_NETWORK_ANNOTATION_KEY: "sriov-net",
                NETWORKS_ANNOTATION_KEY: "sriov-net"
            })),
        )
        .await;
        let patch = patch_of(&response);
        assert!(patch.as_array().unwrap().iter().any(|op| {
            op["path"] == "/spec/containers/0/resources/limits/example.com~1foo" && op["value"] == "2"
        }));
    }

    /// Story: an operator injection supplies the networks annotation for a
    /// labelled Pod and is appended to the patch
    #[tokio::test]
    async fn story_injection_supplies_networks() {
        let state = state();
        let data = BTreeMap::from([(
            "sriov".to_string(),
            json!({
                "op": "add",
                "path": "/metadata/annotations",
                "value": {NETWORKS_ANNOTATION_KEY: "sriov-net"}
            })
            .to_string(),
        )]);
        state
            .config
            .update_injections(InjectionSource::Operator, |t| {
                Some(crate::config::injections::operator_table_from(t, &data))
            })
            .await;

        let mut pod = pod_with_annotations(json!({}));
        pod["metadata"]["labels"] = json!({"sriov": "True"});
        let response = admit(state, pod).await;

        let patch = patch_of(&response);
        let ops = patch.as_array().unwrap();
        assert_eq!(ops.last().unwrap()["path"], "/metadata/annotations");
        assert!(ops
            .iter()
            .any(|op| op["path"] == "/spec/containers/0/resources/requests/example.com~1foo"));
    }

    /// Story: a Pod's own annotation wins over an injected one
    #[tokio::test]
    async fn story_pod_annotation_wins_over_injection() {
        let state = state();
        let data = BTreeMap::from([(
            "sriov".to_string(),
            json!({
                "op": "add",
                "path": "/metadata/annotations",
                "value": {NETWORKS_ANNOTATION_KEY: "other/ghost"}
            })
            .to_string(),
        )]);
        state
            .config
            .update_injections(InjectionSource::User, |t| {
                Some(crate::config::injections::operator_table_from(t, &data))
            })
            .await;

        let mut pod = pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "sriov-net"}));
        pod["metadata"]["labels"] = json!({"sriov": "true"});
        let response = admit(state, pod).await;
        assert!(response.allowed);
    }

    /// Story: a Pod created by a ReplicaSet without a namespace takes the
    /// ReplicaSet's namespace
    #[tokio::test]
    async fn story_namespace_from_owner() {
        let mut owners = MockOwnerNamespaceResolver::new();
        owners
            .expect_find_namespace()
            .returning(|_, _, _| Ok(Some("default".to_string())));

        let mut pod = pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "sriov-net"}));
        pod["metadata"]["namespace"] = Value::Null;
        pod["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": "web-5d4f", "uid": "uid-1"
        }]);

        let response = admit(state_with(owners), pod).await;
        assert!(response.allowed);
        assert!(response.patch.is_some());
    }

    #[tokio::test]
    async fn missing_owner_namespace_denies() {
        let mut owners = MockOwnerNamespaceResolver::new();
        owners.expect_find_namespace().returning(|_, _, _| Ok(None));

        let mut pod = pod_with_annotations(json!({NETWORKS_ANNOTATION_KEY: "sriov-net"}));
        pod["metadata"]["namespace"] = Value::Null;
        pod["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "apps/v1", "kind": "DaemonSet", "name": "ds", "uid": "uid-2"
        }]);

        let response = admit(state_with(owners), pod).await;
        assert!(!response.allowed);
        assert!(response.result.message.contains("namespace"));
    }

    #[tokio::test]
    async fn no_namespace_and_no_owner_denies() {
        let mut pod = pod_with_annotations(json!({}));
        pod["metadata"]["namespace"] = Value::Null;
        let response = admit(state(), pod).await;
        assert!(!response.allowed);
    }

    #[tokio::test]
    async fn response_echoes_api_version() {
        let mut body = review(pod_with_annotations(json!({})));
        body["apiVersion"] = json!("admission.k8s.io/v1beta1");
        let (status, value) = post(state(), JSON_CONTENT_TYPE, body.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["apiVersion"], "admission.k8s.io/v1beta1");
        assert_eq!(value["response"]["uid"], "req-1");
    }
}
