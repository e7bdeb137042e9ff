//! Local mirror of NetworkAttachmentDefinition annotations
//!
//! Fed by a kube watcher stream. Admission lookups read the mirror only, so
//! the hot path never waits on the API server. Watch errors leave the current
//! content in place until the stream recovers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{key, Annotations, NetworkAttachmentDefinition, NetworkDefinitions};
use crate::signal::Signal;
use crate::Result;

/// How long `stop` waits for the watch loop to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct Entry {
    resource_version: Option<String>,
    annotations: Annotations,
}

impl Entry {
    fn from_definition(nad: &NetworkAttachmentDefinition) -> Self {
        Self {
            resource_version: nad.resource_version(),
            annotations: Arc::new(nad.annotations().clone()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    // Objects seen since the last Init, swapped in on InitDone
    relist: Option<HashMap<String, Entry>>,
}

/// Watch-fed NetworkAttachmentDefinition annotation cache
#[derive(Debug, Default)]
pub struct NadCache {
    state: Mutex<State>,
    running: Signal,
    cancel: CancellationToken,
}

/// Watcher stream over NetworkAttachmentDefinitions in every namespace
pub fn watch_stream(
    client: Client,
) -> impl Stream<Item = std::result::Result<Event<NetworkAttachmentDefinition>, watcher::Error>> + Send
{
    let api: Api<NetworkAttachmentDefinition> = Api::all(client);
    // Shorter than the client read timeout so the server closes the watch first
    watcher::watcher(api, watcher::Config::default().timeout(25)).default_backoff()
}

impl NadCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached definitions
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether the cache holds no definitions
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the watch loop is running
    pub fn is_running(&self) -> bool {
        self.running.is_open()
    }

    /// Apply one watcher event
    pub fn apply(&self, event: Event<NetworkAttachmentDefinition>) {
        let mut state = self.state();
        match event {
            Event::Apply(nad) => {
                let k = key(&nad.namespace().unwrap_or_default(), &nad.name_any());
                let version = nad.resource_version();
                if let Some(existing) = state.entries.get(&k) {
                    if version.is_some() && existing.resource_version == version {
                        debug!(key = %k, "No change in NetworkAttachmentDefinition, ignoring update");
                        return;
                    }
                }
                debug!(key = %k, "Caching NetworkAttachmentDefinition");
                state.entries.insert(k, Entry::from_definition(&nad));
            }
            Event::Delete(nad) => {
                let k = key(&nad.namespace().unwrap_or_default(), &nad.name_any());
                debug!(key = %k, "Removing NetworkAttachmentDefinition");
                state.entries.remove(&k);
            }
            Event::Init => {
                state.relist = Some(HashMap::new());
            }
            Event::InitApply(nad) => {
                let k = key(&nad.namespace().unwrap_or_default(), &nad.name_any());
                state
                    .relist
                    .get_or_insert_with(HashMap::new)
                    .insert(k, Entry::from_definition(&nad));
            }
            Event::InitDone => {
                if let Some(relisted) = state.relist.take() {
                    info!(
                        count = relisted.len(),
                        "NetworkAttachmentDefinition cache synchronized"
                    );
                    state.entries = relisted;
                }
            }
        }
    }

    /// Drive `events` into the cache until [`stop`](Self::stop) is called or the
    /// stream ends
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = std::result::Result<Event<NetworkAttachmentDefinition>, watcher::Error>>
            + Send,
    {
        let mut events = std::pin::pin!(events);
        self.running.open();
        info!("Starting NetworkAttachmentDefinition watch");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        warn!(error = %e, "NetworkAttachmentDefinition watch error, serving cached content");
                    }
                    None => {
                        warn!("NetworkAttachmentDefinition watch stream ended");
                        break;
                    }
                },
            }
        }

        info!("NetworkAttachmentDefinition watch stopped");
        self.running.close();
    }

    /// Stop the watch loop and clear the cache.
    ///
    /// Waits up to `timeout` for the loop to exit. The content is cleared only
    /// once it has; on timeout it is left in place and the error returned.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        self.running.wait_until_closed(timeout).await?;

        let mut state = self.state();
        state.entries.clear();
        state.relist = None;
        info!("NetworkAttachmentDefinition cache cleared");
        Ok(())
    }
}

impl NetworkDefinitions for NadCache {
    fn lookup(&self, namespace: &str, name: &str) -> Option<Annotations> {
        self.state()
            .entries
            .get(&key(namespace, name))
            .map(|entry| entry.annotations.clone())
    }
}
