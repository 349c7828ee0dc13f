//! Session Gate - Client-side session core for token-authenticated APIs
//!
//! Keeps an opaque access/refresh token pair usable across concurrent
//! requests and across several execution contexts (windows, processes)
//! sharing one persistent store.
//!
//! ## Features
//!
//! - Namespaced session storage with lazy TTL expiry
//! - Request gateway with credential injection and single-flight refresh
//! - Cross-context change notifications for credentials and user data
//! - Startup restore, sign-in and sign-out with optimistic hydration
//! - Pluggable storage (memory, JSON file, OS keyring) and HTTP transport
//!
//! ## Architecture
//!
//! - **Storage**: raw key-value backends behind [`storage::KeyValueStore`]
//! - **Session**: namespacing, records and expiry over a backend
//! - **Broadcast**: in-process pub/sub plus a relay to other contexts
//! - **Gateway**: dispatch, envelope checks, refresh protocol
//! - **Coordinator**: session lifecycle for one context
//! - **Security**: zeroizing secrets and log sanitization

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod security;
pub mod session;
pub mod storage;

use std::sync::Arc;

use broadcast::{Broadcaster, ContextTransport};
use config::ClientConfig;
use coordinator::SessionCoordinator;
use gateway::{HttpTransport, ReqwestTransport, TokenGateway};
use session::SessionStore;
use storage::{FileStorage, KeyValueStore, StorageError};

/// Session components of one execution context, wired together
#[derive(Clone)]
pub struct SessionContext {
    pub broadcaster: Broadcaster,
    pub store: Arc<SessionStore>,
    pub gateway: TokenGateway,
    pub coordinator: SessionCoordinator,
}

impl SessionContext {
    /// Wires a context that does not talk to other contexts
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        Self::assemble(config, backend, http, Broadcaster::new())
    }

    /// Wires a context that exchanges session changes over `transport`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connected(
        config: ClientConfig,
        backend: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpTransport>,
        transport: Arc<dyn ContextTransport>,
    ) -> Self {
        Self::assemble(config, backend, http, Broadcaster::with_transport(transport))
    }

    /// Standalone context persisting to `session-store.json` in the config
    /// directory and talking HTTP through reqwest
    pub fn open_default(config: ClientConfig) -> Result<Self, StorageError> {
        let storage = FileStorage::in_config_dir().ok_or_else(|| {
            StorageError::Unavailable("could not determine config directory".to_string())
        })?;
        tracing::info!("Persisting session to {}", storage.path().display());
        Ok(Self::new(
            config,
            Arc::new(storage),
            Arc::new(ReqwestTransport::new()),
        ))
    }

    fn assemble(
        config: ClientConfig,
        backend: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpTransport>,
        broadcaster: Broadcaster,
    ) -> Self {
        let store = Arc::new(
            SessionStore::new(backend, config.storage_prefix.clone())
                .with_broadcaster(broadcaster.clone()),
        );
        let gateway = TokenGateway::new(config, Arc::clone(&store), http);
        let coordinator = SessionCoordinator::new(gateway.clone(), broadcaster.clone());

        Self {
            broadcaster,
            store,
            gateway,
            coordinator,
        }
    }
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into());
    let filter = match "session_gate=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Logging initialized");
    }
}
