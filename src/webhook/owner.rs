//! Pod namespace fallback through the owner reference
//!
//! Older admission payloads can carry a Pod without a namespace. The namespace
//! is then taken from the workload that owns the Pod.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::ReplicationController;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::Result;

/// Namespace used for owners whose kind cannot be looked up
pub const FALLBACK_NAMESPACE: &str = "default";

/// Owner kinds that can be resolved to a namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerKind {
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 ReplicationController
    ReplicationController,
}

impl OwnerKind {
    /// Parse an owner reference kind
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ReplicaSet" => Some(Self::ReplicaSet),
            "DaemonSet" => Some(Self::DaemonSet),
            "StatefulSet" => Some(Self::StatefulSet),
            "ReplicationController" => Some(Self::ReplicationController),
            _ => None,
        }
    }
}

/// Finds the namespace of a Pod's owning workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OwnerNamespaceResolver: Send + Sync {
    /// Namespace of the `kind` object with this name and uid, `None` if absent
    async fn find_namespace(&self, kind: OwnerKind, name: &str, uid: &str) -> Result<Option<String>>;
}

/// Namespace for a Pod owned by `owner`.
///
/// Unsupported kinds resolve to [`FALLBACK_NAMESPACE`].
pub async fn resolve_namespace<R: OwnerNamespaceResolver + ?Sized>(
    resolver: &R,
    owner: &OwnerReference,
) -> Result<Option<String>> {
    match OwnerKind::from_kind(&owner.kind) {
        Some(kind) => resolver.find_namespace(kind, &owner.name, &owner.uid).await,
        None => {
            info!(kind = %owner.kind, "Owner reference kind is not supported, using default namespace");
            Ok(Some(FALLBACK_NAMESPACE.to_string()))
        }
    }
}

/// [`OwnerNamespaceResolver`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeOwnerResolver {
    client: Client,
}

impl KubeOwnerResolver {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn find<K>(&self, name: &str, uid: &str) -> Result<Option<String>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("metadata.name={name}"));
        let owners = api.list(&params).await?;
        Ok(owners
            .items
            .into_iter()
            .find(|o| o.name_any() == name && o.uid().as_deref() == Some(uid))
            .and_then(|o| o.namespace()))
    }
}

#[async_trait]
impl OwnerNamespaceResolver for KubeOwnerResolver {
    async fn find_namespace(&self, kind: OwnerKind, name: &str, uid: &str) -> Result<Option<String>> {
        match kind {
            OwnerKind::ReplicaSet => self.find::<ReplicaSet>(name, uid).await,
            OwnerKind::DaemonSet => self.find::<DaemonSet>(name, uid).await,
            OwnerKind::StatefulSet => self.find::<StatefulSet>(name, uid).await,
            OwnerKind::ReplicationController => {
                self.find::<ReplicationController>(name, uid).await
            }
        }
    }
}
