//! Runtime configuration shared by the admission path and the synchronizer
//!
//! [`ConfigStore`] owns three independently locked values: the control
//! switches and the two patch tables. Readers clone a snapshot, writers compute
//! the replacement in memory and install it under one write lock, so an
//! admission call sees either the whole old value or the whole new one.

pub mod injections;
pub mod switches;
pub mod sync;

use tokio::sync::RwLock;

pub use injections::{InjectionSource, PatchTable};
pub use switches::{ControlSwitches, SwitchState};
pub use sync::{ConfigMapSource, KubeConfigMapSource, SyncConfig, Synchronizer};

/// Consistent copy of the configuration taken at the start of an admission call
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    /// Feature switches and resource-name keys
    pub switches: ControlSwitches,
    /// Operator defined patches
    pub operator_injections: PatchTable,
    /// User defined patches
    pub user_injections: PatchTable,
}

/// Shared, concurrently updated configuration
#[derive(Debug)]
pub struct ConfigStore {
    switches: RwLock<ControlSwitches>,
    operator_injections: RwLock<PatchTable>,
    user_injections: RwLock<PatchTable>,
}

impl ConfigStore {
    /// Create a store with startup switches and empty tables
    pub fn new(switches: ControlSwitches) -> Self {
        Self {
            switches: RwLock::new(switches),
            operator_injections: RwLock::new(PatchTable::new()),
            user_injections: RwLock::new(PatchTable::new()),
        }
    }

    /// Current switches
    pub async fn switches(&self) -> ControlSwitches {
        self.switches.read().await.clone()
    }

    /// Current table for `source`
    pub async fn injections(&self, source: InjectionSource) -> PatchTable {
        self.table(source).read().await.clone()
    }

    /// Copy every piece of configuration
    pub async fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            switches: self.switches().await,
            operator_injections: self.injections(InjectionSource::Operator).await,
            user_injections: self.injections(InjectionSource::User).await,
        }
    }

    /// Mutate the switches under the write lock
    pub async fn update_switches<F>(&self, f: F)
    where
        F: FnOnce(&mut ControlSwitches),
    {
        let mut guard = self.switches.write().await;
        f(&mut guard);
    }

    /// Replace a table with the value computed from the current one.
    ///
    /// `f` returning `None` keeps the current table.
    pub async fn update_injections<F>(&self, source: InjectionSource, f: F)
    where
        F: FnOnce(&PatchTable) -> Option<PatchTable>,
    {
        let mut guard = self.table(source).write().await;
        if let Some(next) = f(&guard) {
            *guard = next;
        }
    }

    fn table(&self, source: InjectionSource) -> &RwLock<PatchTable> {
        match source {
            InjectionSource::Operator => &self.operator_injections,
            InjectionSource::User => &self.user_injections,
        }
    }
}
