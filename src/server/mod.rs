//! HTTP server

pub mod handler;
pub mod identity;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::admin::AdminToken;
use crate::blacklist::{Ban, BlacklistStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, KeysConfig};
use crate::gate::AccessGate;
use crate::keys::{Key, KeyManager, KeyStore, spawn_sweeper};
use crate::mailbox::{Mailbox, Notice};
use crate::snapshot::{JsonFile, MemorySnapshot, Snapshot};
use crate::{Error, Result};

pub use handler::{KeyView, create_router};
pub use identity::{ClientIdentity, client_identity};

/// Persistence backends for every collection.
pub struct Snapshots {
    /// Key collection.
    pub keys: Arc<dyn Snapshot<Key>>,
    /// Tokens that may never be issued again.
    pub retired: Arc<dyn Snapshot<String>>,
    /// Blacklist.
    pub blacklist: Arc<dyn Snapshot<Ban>>,
    /// Notice queue.
    pub notices: Arc<dyn Snapshot<Notice>>,
}

impl Snapshots {
    /// JSON files under the configured data directory, created as `[]` when
    /// missing.
    pub async fn json_files(config: &crate::config::StorageConfig) -> Result<Self> {
        let keys = JsonFile::new(config.keys_path());
        let retired = JsonFile::new(config.retired_path());
        let blacklist = JsonFile::new(config.blacklist_path());
        let notices = JsonFile::new(config.notifications_path());
        for file in [&keys, &retired, &blacklist, &notices] {
            file.ensure_exists().await?;
        }
        Ok(Self {
            keys: Arc::new(keys),
            retired: Arc::new(retired),
            blacklist: Arc::new(blacklist),
            notices: Arc::new(notices),
        })
    }

    /// Empty in-memory collections.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            keys: Arc::new(MemorySnapshot::<Key>::new()),
            retired: Arc::new(MemorySnapshot::<String>::new()),
            blacklist: Arc::new(MemorySnapshot::<Ban>::new()),
            notices: Arc::new(MemorySnapshot::<Notice>::new()),
        }
    }
}

/// Shared handler state.
pub struct AppState {
    /// Key lifecycle.
    pub keys: Arc<KeyManager>,
    /// Allow/deny decisions.
    pub gate: Arc<AccessGate>,
    /// Bans.
    pub blacklist: Arc<BlacklistStore>,
    /// Notices for polling clients.
    pub mailbox: Arc<Mailbox>,
    /// Admin secret; `None` disables the admin endpoints.
    pub admin: Option<AdminToken>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl AppState {
    /// Load every collection and wire the components together.
    pub async fn build(
        clock: Arc<dyn Clock>,
        admin: Option<AdminToken>,
        keys_config: &KeysConfig,
        request_timeout: Duration,
        snapshots: Snapshots,
    ) -> Result<Self> {
        let store = Arc::new(
            KeyStore::open(snapshots.keys, snapshots.retired, keys_config.token_prefix.clone())
                .await?,
        );
        let blacklist = Arc::new(BlacklistStore::open(snapshots.blacklist).await?);
        let mailbox = Arc::new(Mailbox::open(snapshots.notices).await?);

        let keys = Arc::new(KeyManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            keys_config.policy(),
        ));
        let gate = Arc::new(AccessGate::new(
            store,
            Arc::clone(&blacklist),
            Arc::clone(&clock),
        ));

        Ok(Self {
            keys,
            gate,
            blacklist,
            mailbox,
            admin,
            clock,
            request_timeout,
        })
    }

    /// State backed by the configured JSON files.
    pub async fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let admin = config.admin.resolve_token().map(AdminToken::new);
        let snapshots = Snapshots::json_files(&config.storage).await?;
        Self::build(
            clock,
            admin,
            &config.keys,
            config.server.request_timeout,
            snapshots,
        )
        .await
    }

    /// State over explicit snapshots with default key settings.
    pub async fn with_snapshots(
        clock: Arc<dyn Clock>,
        admin: Option<AdminToken>,
        keys: Arc<dyn Snapshot<Key>>,
        retired: Arc<dyn Snapshot<String>>,
        blacklist: Arc<dyn Snapshot<Ban>>,
        notices: Arc<dyn Snapshot<Notice>>,
    ) -> Result<Self> {
        let defaults = Config::default();
        Self::build(
            clock,
            admin,
            &defaults.keys,
            defaults.server.request_timeout,
            Snapshots {
                keys,
                retired,
                blacklist,
                notices,
            },
        )
        .await
    }

    /// Fresh in-memory state with default key settings.
    pub async fn in_memory(clock: Arc<dyn Clock>, admin: Option<AdminToken>) -> Result<Self> {
        let defaults = Config::default();
        Self::build(
            clock,
            admin,
            &defaults.keys,
            defaults.server.request_timeout,
            Snapshots::in_memory(),
        )
        .await
    }

    /// Response view of a key.
    #[must_use]
    pub fn view(&self, key: Key) -> KeyView {
        let expires_in_secs = key.remaining(self.clock.now()).num_seconds();
        KeyView {
            key,
            expires_in_secs,
        }
    }
}

/// keygate HTTP server
pub struct Server {
    /// Configuration
    config: Config,
    /// Shared state
    state: Arc<AppState>,
}

impl Server {
    /// Open the collections and prepare the server.
    pub async fn new(config: Config) -> Result<Self> {
        let state = AppState::open(&config, Arc::new(SystemClock)).await?;

        match (&state.admin, config.admin.token.as_deref()) {
            (Some(token), Some("auto")) => {
                info!(token = %token.expose(), "Generated admin token (valid until restart)");
            }
            (Some(_), _) => info!("Admin endpoints enabled"),
            (None, _) => warn!("No admin token configured - admin endpoints disabled"),
        }

        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    /// Serve until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let sweep_interval = self.config.keys.sweep_interval;
        let sweeper = if sweep_interval.is_zero() {
            info!("Key sweeper disabled");
            None
        } else {
            Some(spawn_sweeper(
                Arc::clone(&self.state.keys),
                sweep_interval,
                shutdown_tx.subscribe(),
            ))
        };

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("KEYGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            data_dir = %self.config.storage.data_dir.display(),
            keys = self.state.keys.store().len().await,
            bans = self.state.blacklist.list().await.len(),
            "Collections loaded"
        );
        info!(
            ttl_hours = self.config.keys.default_ttl_hours,
            max_users = self.config.keys.default_max_users,
            sweep_interval = ?sweep_interval,
            "Key policy"
        );
        info!("============================================================");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Key sweeper task failed");
            }
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
