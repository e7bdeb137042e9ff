//! Serving key pair with hot reload
//!
//! The HTTPS server shares one [`RustlsConfig`] with the [`KeyPairWatcher`].
//! When both the certificate and the key file have changed since the last
//! reload, the watcher swaps the config in place; new handshakes pick up the
//! new pair while in-flight connections keep the old one.
//!
//! The API server authenticates with a client certificate unless
//! [`ClientAuth::Disabled`] is chosen. The client CA pool is read once at
//! startup and kept across reloads.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use notify::{EventKind, RecursiveMode, Watcher};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::signal::Signal;
use crate::{Error, Result};

/// Default bound on watcher start and stop
pub const DEFAULT_WATCHER_TIMEOUT: Duration = Duration::from_secs(5);

/// CA used to verify client certificates when none is configured
pub const DEFAULT_CLIENT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Entry the kubelet swaps when it updates a mounted Secret
const ATOMIC_WRITER_DATA_DIR: &str = "..data";

/// Client certificate requirement of the webhook endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientAuth {
    /// Accept clients without a certificate
    Disabled,
    /// Require a client certificate signed by one of these CA files
    Required(Vec<PathBuf>),
}

/// Server-side TLS settings that do not change on reload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSettings {
    /// Client certificate requirement
    pub client_auth: ClientAuth,
    /// Offer HTTP/2 through ALPN
    pub enable_http2: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            client_auth: ClientAuth::Disabled,
            enable_http2: false,
        }
    }
}

/// Certificate and key paths plus the live rustls config built from them
#[derive(Clone)]
pub struct KeyPair {
    cert_path: PathBuf,
    key_path: PathBuf,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
    alpn_protocols: Vec<Vec<u8>>,
    config: RustlsConfig,
}

impl KeyPair {
    /// Load a PEM certificate chain and private key
    pub async fn load(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        settings: &TlsSettings,
    ) -> Result<Self> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();

        let client_verifier = match &settings.client_auth {
            ClientAuth::Disabled => {
                info!("Client certificate verification disabled");
                None
            }
            ClientAuth::Required(ca_paths) => Some(client_verifier(ca_paths).await?),
        };
        let alpn_protocols = if settings.enable_http2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        let server_config =
            server_config(&cert_path, &key_path, client_verifier.clone(), &alpn_protocols).await?;
        Ok(Self {
            cert_path,
            key_path,
            client_verifier,
            alpn_protocols,
            config: RustlsConfig::from_config(server_config),
        })
    }

    /// Config handed to the HTTPS server; reloads are visible through it
    pub fn config(&self) -> RustlsConfig {
        self.config.clone()
    }

    /// Certificate file path
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Private key file path
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Re-read both files and swap the serving config
    pub async fn reload(&self) -> Result<()> {
        let server_config = server_config(
            &self.cert_path,
            &self.key_path,
            self.client_verifier.clone(),
            &self.alpn_protocols,
        )
        .await
        .map_err(|e| Error::tls(format!("failed to reload certificate: {e}")))?;
        self.config.reload_from_config(server_config);
        info!(cert = %self.cert_path.display(), "Certificate reloaded");
        Ok(())
    }
}

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::tls(format!("failed to read {what} '{}': {e}", path.display())))
}

async fn load_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path, what).await?;
    let found = certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("failed to parse {what} '{}': {e}", path.display())))?;
    if found.is_empty() {
        return Err(Error::tls(format!("no certificate found in {what} '{}'", path.display())));
    }
    Ok(found)
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path, "private key").await?;
    private_key(&mut pem.as_slice())
        .map_err(|e| Error::tls(format!("failed to parse private key '{}': {e}", path.display())))?
        .ok_or_else(|| Error::tls(format!("no private key found in '{}'", path.display())))
}

async fn client_verifier(ca_paths: &[PathBuf]) -> Result<Arc<dyn ClientCertVerifier>> {
    if ca_paths.is_empty() {
        return Err(Error::tls("no client CA file path(s) found"));
    }

    let mut roots = RootCertStore::empty();
    for path in ca_paths {
        for cert in load_certs(path, "client CA file").await? {
            roots.add(cert).map_err(|e| {
                Error::tls(format!("failed to add client CA from '{}': {e}", path.display()))
            })?;
        }
        info!(path = %path.display(), "Loaded client CA");
    }

    WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::tls(format!("failed to build client verifier: {e}")))
}

async fn server_config(
    cert_path: &Path,
    key_path: &Path,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
    alpn_protocols: &[Vec<u8>],
) -> Result<Arc<ServerConfig>> {
    let chain = load_certs(cert_path, "certificate").await?;
    let key = load_private_key(key_path).await?;

    // rustls speaks TLS 1.2 and 1.3 only
    let builder = ServerConfig::builder();
    let builder = match client_verifier {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(chain, key)
        .map_err(|e| Error::tls(format!("invalid key pair: {e}")))?;
    config.alpn_protocols = alpn_protocols.to_vec();
    Ok(Arc::new(config))
}

/// Watches the key pair files and reloads the config when both change
pub struct KeyPairWatcher {
    key_pair: Arc<KeyPair>,
    status: Arc<Signal>,
    quit: CancellationToken,
}

impl KeyPairWatcher {
    /// Create a stopped watcher
    pub fn new(key_pair: Arc<KeyPair>) -> Self {
        Self {
            key_pair,
            status: Arc::new(Signal::new()),
            quit: CancellationToken::new(),
        }
    }

    /// Whether the watch loop is running
    pub fn is_running(&self) -> bool {
        self.status.is_open()
    }

    /// Start watching and wait up to `timeout` until the loop is up.
    ///
    /// The directories holding the files are watched rather than the files, so
    /// rotations by rename or remove-and-create keep being seen. The returned
    /// task ends with an error if a reload fails.
    pub async fn start(&self, timeout: Duration) -> Result<JoinHandle<Result<()>>> {
        if self.status.is_open() {
            return Err(Error::tls("watcher must have exited before starting again"));
        }
        for path in [self.key_pair.cert_path(), self.key_pair.key_path()] {
            if !path.exists() {
                return Err(Error::tls(format!("file does not exist at path '{}'", path.display())));
            }
        }

        let targets = [
            WatchTarget::new(self.key_pair.cert_path()),
            WatchTarget::new(self.key_pair.key_path()),
        ];

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The receiver only goes away once the loop has exited
            let _ = tx.send(res);
        })
        .map_err(|e| Error::tls(format!("failed to create file watcher: {e}")))?;
        let dirs: BTreeSet<&Path> = targets.iter().map(|t| t.dir.as_path()).collect();
        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|e| Error::tls(format!("failed to watch {}: {e}", dir.display())))?;
        }

        let key_pair = self.key_pair.clone();
        let status = self.status.clone();
        let quit = self.quit.clone();
        let handle = tokio::spawn(async move {
            // Dropping the watcher stops notifications
            let _watcher = watcher;
            status.open();
            info!("Starting TLS key and cert file watcher");
            let result = monitor(&key_pair, &targets, rx, quit).await;
            if let Err(e) = &result {
                error!(error = %e, "TLS file watcher failed");
            }
            status.close();
            result
        });

        self.status.wait_until_open(timeout).await?;
        Ok(handle)
    }

    /// Stop the loop and wait up to `timeout` for it to exit
    pub async fn quit(&self, timeout: Duration) -> Result<()> {
        info!("Terminating TLS cert and key watcher");
        self.quit.cancel();
        self.status.wait_until_closed(timeout).await
    }
}

/// A watched file as the directory notify reports it under plus its name
struct WatchTarget {
    dir: PathBuf,
    name: PathBuf,
}

impl WatchTarget {
    fn new(path: &Path) -> Self {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path.file_name().map(PathBuf::from).unwrap_or_default();
        Self { dir, name }
    }

    /// Whether an event on `path` may have changed this file
    fn touched_by(&self, path: &Path) -> bool {
        if path.parent() != Some(self.dir.as_path()) {
            return false;
        }
        match path.file_name() {
            Some(name) => name == self.name.as_os_str() || name == OsStr::new(ATOMIC_WRITER_DATA_DIR),
            None => false,
        }
    }
}

async fn monitor(
    key_pair: &KeyPair,
    [cert, key]: &[WatchTarget; 2],
    mut events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    quit: CancellationToken,
) -> Result<()> {
    let mut cert_updated = false;
    let mut key_updated = false;

    loop {
        tokio::select! {
            _ = quit.cancelled() => {
                info!("TLS cert and key file watcher finished");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    for path in &event.paths {
                        if cert.touched_by(path) || key.touched_by(path) {
                            debug!(path = %path.display(), kind = ?event.kind, "Key pair file changed");
                        }
                        cert_updated |= cert.touched_by(path);
                        key_updated |= key.touched_by(path);
                    }
                    if cert_updated && key_updated {
                        key_pair.reload().await?;
                        cert_updated = false;
                        key_updated = false;
                    }
                }
                Some(Err(e)) => warn!(error = %e, "TLS file watcher error"),
                None => {
                    warn!("File watcher channel closed");
                    return Err(Error::internal("file watcher channel closed"));
                }
            },
        }
    }
}
