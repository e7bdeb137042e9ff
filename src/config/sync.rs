//! ConfigMap synchronizer
//!
//! Polls the control ConfigMap and the operator injection ConfigMap and
//! installs the parsed result in the [`ConfigStore`]. Fetches happen before
//! any lock is taken; only the in-memory replace runs under a lock.
//!
//! Per ConfigMap:
//! - fetch error or timeout: skip, keep the current state
//! - not found: reset switches to their startup values / clear the table
//! - found: parse and replace

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::injections::{operator_table_from, user_table_from, InjectionSource, PatchTable};
use super::ConfigStore;
use crate::{Result, CONTROL_SWITCHES_CONFIGMAP, OPERATOR_INJECTIONS_CONFIGMAP};

/// Default poll interval
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on a single ConfigMap fetch
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider of raw ConfigMap data
///
/// Abstracts the API server so sync passes can be tested without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapSource: Send + Sync {
    /// Data of the named ConfigMap, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>>;
}

/// [`ConfigMapSource`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeConfigMapSource {
    client: Client,
}

impl KubeConfigMapSource {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigMapSource for KubeConfigMapSource {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api.get_opt(name).await?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }
}

/// Synchronizer settings
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Namespace holding both ConfigMaps
    pub namespace: String,
    /// Time between passes
    pub interval: Duration,
    /// Bound on each fetch
    pub fetch_timeout: Duration,
}

impl SyncConfig {
    /// Settings with default interval and timeout
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            interval: DEFAULT_SYNC_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

enum Fetched {
    Found(BTreeMap<String, String>),
    NotFound,
    Failed,
}

/// Periodic ConfigMap poller
pub struct Synchronizer<S> {
    source: S,
    store: Arc<ConfigStore>,
    config: SyncConfig,
}

impl<S: ConfigMapSource> Synchronizer<S> {
    /// Create a synchronizer writing into `store`
    pub fn new(source: S, store: Arc<ConfigStore>, config: SyncConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Run one pass over both ConfigMaps
    pub async fn sync_once(&self) {
        match self.fetch(CONTROL_SWITCHES_CONFIGMAP).await {
            Fetched::Found(data) => {
                self.store
                    .update_switches(|s| s.apply_control_config(&data))
                    .await;
                self.store
                    .update_injections(InjectionSource::User, |current| {
                        user_table_from(current, &data)
                    })
                    .await;
            }
            Fetched::NotFound => {
                info!(
                    configmap = CONTROL_SWITCHES_CONFIGMAP,
                    "ConfigMap not found, restoring initial switches and clearing user injections"
                );
                self.store.update_switches(|s| s.reset_to_initial()).await;
                self.store
                    .update_injections(InjectionSource::User, |_| Some(PatchTable::new()))
                    .await;
            }
            Fetched::Failed => {}
        }

        match self.fetch(OPERATOR_INJECTIONS_CONFIGMAP).await {
            Fetched::Found(data) => {
                self.store
                    .update_injections(InjectionSource::Operator, |current| {
                        Some(operator_table_from(current, &data))
                    })
                    .await;
            }
            Fetched::NotFound => {
                debug!(
                    configmap = OPERATOR_INJECTIONS_CONFIGMAP,
                    "ConfigMap not found, clearing operator injections"
                );
                self.store
                    .update_injections(InjectionSource::Operator, |_| Some(PatchTable::new()))
                    .await;
            }
            Fetched::Failed => {}
        }

        let switches = self.store.switches().await;
        debug!(switches = %switches, "Sync pass complete");
    }

    /// Run passes every `interval` until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            namespace = %self.config.namespace,
            interval = ?self.config.interval,
            "Starting ConfigMap synchronizer"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ConfigMap synchronizer stopped");
                    return;
                }
                _ = ticker.tick() => self.sync_once().await,
            }
        }
    }

    async fn fetch(&self, name: &str) -> Fetched {
        let namespace = self.config.namespace.as_str();
        match tokio::time::timeout(self.config.fetch_timeout, self.source.get(namespace, name)).await
        {
            Ok(Ok(Some(data))) => Fetched::Found(data),
            Ok(Ok(None)) => Fetched::NotFound,
            Ok(Err(e)) => {
                warn!(%namespace, configmap = %name, error = %e, "Failed to fetch ConfigMap, keeping current state");
                Fetched::Failed
            }
            Err(_) => {
                warn!(%namespace, configmap = %name, timeout = ?self.config.fetch_timeout, "ConfigMap fetch timed out, keeping current state");
                Fetched::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSwitches;
    use crate::{Error, CONFIGMAP_MAIN_FILE_KEY};

    const PATCH: &str = r#"{"op":"add","path":"/metadata/annotations","value":{"k8s.v1.cni.cncf.io/networks":"net1"}}"#;

    fn control(document: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(CONFIGMAP_MAIN_FILE_KEY.to_string(), document.to_string())])
    }

    fn store() -> Arc<ConfigStore> {
        Arc::new(ConfigStore::new(ControlSwitches::new(
            false,
            false,
            crate::DEFAULT_RESOURCE_NAME_KEY,
        )))
    }

    fn synchronizer(source: MockConfigMapSource, store: Arc<ConfigStore>) -> Synchronizer<MockConfigMapSource> {
        Synchronizer::new(source, store, SyncConfig::new("kube-system"))
    }

    /// Source answering each ConfigMap name with a fixed result
    fn source_with(
        control_cm: fn() -> Result<Option<BTreeMap<String, String>>>,
        operator_cm: fn() -> Result<Option<BTreeMap<String, String>>>,
    ) -> MockConfigMapSource {
        let mut source = MockConfigMapSource::new();
        source
            .expect_get()
            .withf(|ns, name| ns == "kube-system" && name == CONTROL_SWITCHES_CONFIGMAP)
            .returning(move |_, _| control_cm());
        source
            .expect_get()
            .withf(|ns, name| ns == "kube-system" && name == OPERATOR_INJECTIONS_CONFIGMAP)
            .returning(move |_, _| operator_cm());
        source
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    /// Story: a pass applies switches, user injections and operator injections
    #[tokio::test]
    async fn story_sync_pass_populates_store() {
        let store = store();
        let source = source_with(
            || {
                Ok(Some(control(&format!(
                    r#"{{"features":{{"enableHugePageDownApi":true}},"user-defined-injections":{{"user-key":{PATCH}}}}}"#
                ))))
            },
            || {
                Ok(Some(BTreeMap::from([(
                    "op-key".to_string(),
                    PATCH.to_string(),
                )])))
            },
        );

        synchronizer(source, store.clone()).sync_once().await;

        let snapshot = store.snapshot().await;
        assert!(snapshot.switches.is_hugepage_down_api_enabled());
        assert!(snapshot.user_injections.contains_key("user-key"));
        assert!(snapshot.operator_injections.contains_key("op-key"));
    }

    /// Story: deleting the ConfigMaps restores safe defaults
    #[tokio::test]
    async fn story_not_found_resets_state() {
        let store = store();
        store
            .update_switches(|s| s.apply_control_config(&control(r#"{"features":{"enableHonorExistingResources":true}}"#)))
            .await;
        store
            .update_injections(InjectionSource::Operator, |t| {
                Some(operator_table_from(
                    t,
                    &BTreeMap::from([("k".to_string(), PATCH.to_string())]),
                ))
            })
            .await;

        synchronizer(source_with(|| Ok(None), || Ok(None)), store.clone())
            .sync_once()
            .await;

        let snapshot = store.snapshot().await;
        assert!(!snapshot.switches.is_honor_existing_resources_enabled());
        assert!(snapshot.operator_injections.is_empty());
        assert!(snapshot.user_injections.is_empty());
    }

    /// Story: an API error freezes the last known state instead of resetting it
    #[tokio::test]
    async fn story_fetch_error_keeps_state() {
        let store = store();
        store
            .update_switches(|s| s.apply_control_config(&control(r#"{"features":{"enableHonorExistingResources":true}}"#)))
            .await;
        store
            .update_injections(InjectionSource::Operator, |t| {
                Some(operator_table_from(
                    t,
                    &BTreeMap::from([("k".to_string(), PATCH.to_string())]),
                ))
            })
            .await;

        synchronizer(
            source_with(
                || Err(Error::internal("connection refused")),
                || Err(Error::internal("connection refused")),
            ),
            store.clone(),
        )
        .sync_once()
        .await;

        let snapshot = store.snapshot().await;
        assert!(snapshot.switches.is_honor_existing_resources_enabled());
        assert!(snapshot.operator_injections.contains_key("k"));
    }

    /// Story: the loop exits promptly once cancelled
    #[tokio::test]
    async fn story_run_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let sync = Synchronizer::new(
            source_with(|| Ok(None), || Ok(None)),
            store(),
            SyncConfig {
                interval: Duration::from_millis(10),
                ..SyncConfig::new("kube-system")
            },
        );

        let handle = tokio::spawn(sync.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("synchronizer should stop")
            .unwrap();
    }
}
