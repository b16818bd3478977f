//! ProxyGateway — connection acceptance, wiring, and teardown.
//!
//! Owns the session registry and the pending-deletion table for the
//! lifetime of the process. Each accepted connection is classified by
//! its request head: WebSocket upgrades are relayed frame-by-frame
//! through the rewriting pipeline ([`upgrade`]); plain control-plane
//! requests are forwarded through `reqwest` with the kernel-creation
//! exchange observed to populate the registry ([`http`]).

pub mod http;
pub mod upgrade;

use crate::config::ProxyConfig;
use crate::notebooks::FileNotebookStore;
use crate::reaper::{HttpKernelDeleter, KernelDeleter, KernelReaper};
use crate::registry::SessionRegistry;
use crate::rewrite::MessageRewriter;
use cellgate_core::{GateResult, NotebookStore};
use http::HttpHead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Details of an accepted proxied connection, handed to observers.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub kernel_id: String,
    pub peer: SocketAddr,
    pub target: String,
}

/// Callback invoked once per accepted proxied connection.
pub type ConnectionObserver = Box<dyn Fn(&HttpHead, &ConnectionInfo) + Send + Sync>;

/// The proxy server instance.
pub struct ProxyGateway {
    pub(crate) config: ProxyConfig,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) rewriter: Arc<MessageRewriter>,
    pub(crate) reaper: Arc<KernelReaper>,
    pub(crate) http: reqwest::Client,
    observers: tokio::sync::RwLock<Vec<ConnectionObserver>>,
}

impl ProxyGateway {
    /// Create a gateway with explicit collaborators (used by tests).
    pub fn new(
        config: ProxyConfig,
        store: Arc<dyn NotebookStore>,
        deleter: Arc<dyn KernelDeleter>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let rewriter = Arc::new(MessageRewriter::new(Arc::clone(&registry), store));
        let reaper = Arc::new(KernelReaper::new(
            deleter,
            Duration::from_secs(config.retention_secs),
        ));
        Arc::new(Self {
            config,
            registry,
            rewriter,
            reaper,
            http: reqwest::Client::new(),
            observers: tokio::sync::RwLock::new(Vec::new()),
        })
    }

    /// Create a gateway with the production collaborators: file-backed
    /// notebooks and REST kernel deletion.
    pub fn from_config(config: ProxyConfig) -> Arc<Self> {
        let store = Arc::new(FileNotebookStore::new(config.notebook_dir.clone()));
        let deleter = Arc::new(HttpKernelDeleter::new(
            config.gateway_url.clone(),
            config.auth_token.clone(),
        ));
        Self::new(config, store, deleter)
    }

    /// Register a callback invoked for every accepted proxied connection.
    pub async fn on_connection<F>(&self, callback: F)
    where
        F: Fn(&HttpHead, &ConnectionInfo) + Send + Sync + 'static,
    {
        self.observers.write().await.push(Box::new(callback));
    }

    pub(crate) async fn notify_observers(&self, head: &HttpHead, info: &ConnectionInfo) {
        for observer in self.observers.read().await.iter() {
            observer(head, info);
        }
    }

    /// Bind the listener (separated from `serve` so tests can learn the
    /// ephemeral port).
    pub async fn bind(&self) -> GateResult<TcpListener> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %listener.local_addr()?,
            gateway = %self.config.gateway_url,
            prefix = %self.config.prefix,
            "proxy listening"
        );
        Ok(listener)
    }

    /// Accept connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> GateResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        gateway.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>) -> GateResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let (head_bytes, leftover) = match http::read_head(&mut stream).await {
            Ok(parts) => parts,
            Err(e) => {
                debug!(peer = %peer, error = %e, "failed to read request head");
                return;
            }
        };
        let head = match HttpHead::parse(&head_bytes) {
            Ok(head) => head,
            Err(e) => {
                debug!(peer = %peer, error = %e, "unparseable request head");
                return;
            }
        };

        debug!(peer = %peer, method = %head.method, target = %head.target, "request");

        if head.is_upgrade() {
            upgrade::proxy_upgrade(self, stream, peer, head, leftover).await;
        } else {
            http::proxy_api_request(&self, &mut stream, head, leftover).await;
        }
    }
}
