//! Network Resources Injector - mutating admission webhook for Pod network resources

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use network_resources_injector::config::{
    ConfigStore, ControlSwitches, KubeConfigMapSource, SyncConfig, Synchronizer,
};
use network_resources_injector::nad::cache::watch_stream;
use network_resources_injector::nad::{NadCache, DEFAULT_STOP_TIMEOUT};
use network_resources_injector::tls::{
    ClientAuth, KeyPair, KeyPairWatcher, TlsSettings, DEFAULT_CLIENT_CA, DEFAULT_WATCHER_TIMEOUT,
};
use network_resources_injector::webhook::owner::KubeOwnerResolver;
use network_resources_injector::webhook::{health_router, webhook_router, WebhookState};
use network_resources_injector::{
    Error, DEFAULT_CONFIG_NAMESPACE, DEFAULT_HEALTH_CHECK_PORT, DEFAULT_RESOURCE_NAME_KEY,
    DEFAULT_WEBHOOK_PORT,
};

/// Grace period for in-flight admission requests on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Network Resources Injector - injects network resources into Pods on admission
#[derive(Parser, Debug)]
#[command(name = "network-resources-injector", version, about, long_about = None)]
struct Cli {
    /// Webhook server port
    #[arg(long, default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// Webhook server bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// File containing the x509 certificate for HTTPS
    #[arg(long)]
    tls_cert_file: PathBuf,

    /// File containing the x509 private key matching --tls-cert-file
    #[arg(long)]
    tls_private_key_file: PathBuf,

    /// File containing a client CA; repeat for more than one
    #[arg(long = "client-ca")]
    client_ca: Vec<PathBuf>,

    /// Do not require client certificates
    #[arg(long)]
    insecure: bool,

    /// Offer HTTP/2 on the webhook server
    #[arg(long)]
    enable_http2: bool,

    /// Health check server port
    #[arg(long, default_value_t = DEFAULT_HEALTH_CHECK_PORT)]
    health_check_port: u16,

    /// Enable hugepage requests and limits in the downward API volume
    #[arg(long)]
    inject_hugepage_down_api: bool,

    /// Add to existing resource requests and limits instead of replacing them
    #[arg(long)]
    honor_resources: bool,

    /// Comma separated NetworkAttachmentDefinition annotation keys naming the device resource
    #[arg(long, default_value = DEFAULT_RESOURCE_NAME_KEY)]
    network_resource_name_keys: String,

    /// Seconds between control ConfigMap synchronizations
    #[arg(long, default_value_t = 30)]
    config_sync_interval: u64,

    /// Namespace holding the control ConfigMaps
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_CONFIG_NAMESPACE)]
    namespace: String,
}

/// Validated runtime settings
#[derive(Debug)]
struct WebhookConfig {
    webhook_addr: SocketAddr,
    health_addr: SocketAddr,
    cert_file: PathBuf,
    key_file: PathBuf,
    tls: TlsSettings,
    switches: ControlSwitches,
    sync: SyncConfig,
}

impl Cli {
    fn validate(self) -> Result<WebhookConfig, Error> {
        for port in [self.port, self.health_check_port] {
            if port < 1024 {
                return Err(Error::config(format!(
                    "invalid port number {port}. Choose between 1024 and 65535"
                )));
            }
        }
        if self.port == self.health_check_port {
            return Err(Error::config(format!(
                "health check port {} must differ from webhook port",
                self.health_check_port
            )));
        }
        if self.network_resource_name_keys.trim().is_empty() {
            return Err(Error::config("--network-resource-name-keys must not be empty"));
        }
        if self.config_sync_interval == 0 {
            return Err(Error::config("--config-sync-interval must be at least one second"));
        }

        let client_auth = if self.insecure {
            ClientAuth::Disabled
        } else if self.client_ca.is_empty() {
            ClientAuth::Required(vec![PathBuf::from(DEFAULT_CLIENT_CA)])
        } else {
            ClientAuth::Required(self.client_ca)
        };

        let mut sync = SyncConfig::new(self.namespace);
        sync.interval = Duration::from_secs(self.config_sync_interval);

        Ok(WebhookConfig {
            webhook_addr: SocketAddr::new(self.bind_address, self.port),
            health_addr: SocketAddr::new(self.bind_address, self.health_check_port),
            cert_file: self.tls_cert_file,
            key_file: self.tls_private_key_file,
            tls: TlsSettings {
                client_auth,
                enable_http2: self.enable_http2,
            },
            switches: ControlSwitches::new(
                self.inject_hugepage_down_api,
                self.honor_resources,
                &self.network_resource_name_keys,
            ),
            sync,
        })
    }
}

/// Resolves with the signal name on SIGINT or SIGTERM.
///
/// Handlers are installed before this returns.
fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = &'static str>> {
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,network_resources_injector=debug,kube=info,hyper=warn")
        }))
        .init();

    let config = Cli::parse().validate()?;
    tracing::info!(
        webhook = %config.webhook_addr,
        health = %config.health_addr,
        namespace = %config.sync.namespace,
        switches = %config.switches,
        "Starting network resources injector"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let cancel = CancellationToken::new();

    // NetworkAttachmentDefinition cache
    let cache = Arc::new(NadCache::new());
    let cache_task = {
        let cache = cache.clone();
        let events = watch_stream(client.clone());
        tokio::spawn(async move { cache.run(events).await })
    };

    // Control switches and patch tables
    let store = Arc::new(ConfigStore::new(config.switches));
    let synchronizer = Synchronizer::new(
        KubeConfigMapSource::new(client.clone()),
        store.clone(),
        config.sync,
    );
    synchronizer.sync_once().await;
    let sync_task = tokio::spawn(synchronizer.run(cancel.child_token()));

    // Serving key pair
    let key_pair = Arc::new(KeyPair::load(&config.cert_file, &config.key_file, &config.tls).await?);
    let key_watcher = KeyPairWatcher::new(key_pair.clone());
    let mut watcher_task = key_watcher.start(DEFAULT_WATCHER_TIMEOUT).await?;

    // Health check server
    let health_listener = tokio::net::TcpListener::bind(config.health_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind health check server: {}", e))?;
    let health_cancel = cancel.child_token();
    let health_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(health_listener, health_router())
            .with_graceful_shutdown(health_cancel.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Health check server error");
        }
    });

    // Webhook server
    let state = Arc::new(WebhookState::new(
        store,
        cache.clone(),
        Arc::new(KubeOwnerResolver::new(client)),
    ));
    let server_handle = axum_server::Handle::new();
    let mut webhook_task = {
        let handle = server_handle.clone();
        let tls = key_pair.config();
        let addr = config.webhook_addr;
        tokio::spawn(async move {
            tracing::info!(addr = %addr, "Starting webhook HTTPS server");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(webhook_router(state).into_make_service())
                .await
        })
    };

    let shutdown = shutdown_signal()?;

    tokio::select! {
        name = shutdown => {
            tracing::info!(signal = name, "Received shutdown signal");
        }
        result = &mut webhook_task => {
            match result {
                Ok(Ok(())) => tracing::info!("Webhook server completed"),
                Ok(Err(e)) => tracing::error!(error = %e, "Webhook server error"),
                Err(e) => tracing::error!(error = %e, "Webhook server task failed"),
            }
        }
        result = &mut watcher_task => {
            match result {
                Ok(Ok(())) => tracing::info!("TLS file watcher completed"),
                Ok(Err(e)) => tracing::error!(error = %e, "TLS file watcher stopped"),
                Err(e) => tracing::error!(error = %e, "TLS file watcher task failed"),
            }
        }
    }

    server_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    cancel.cancel();

    if let Err(e) = key_watcher.quit(DEFAULT_WATCHER_TIMEOUT).await {
        tracing::warn!(error = %e, "TLS file watcher did not stop in time");
    }
    if let Err(e) = cache.stop(DEFAULT_STOP_TIMEOUT).await {
        tracing::warn!(error = %e, "NetworkAttachmentDefinition cache did not stop in time");
    }
    let _ = tokio::join!(cache_task, sync_task, health_task);

    tracing::info!("Network resources injector shutting down");
    Ok(())
}
