//! LAN teams: one peer leads, the others join over HTTP and stay in sync
//! through a WebSocket to the leader.

pub mod api;
pub mod archive;
pub mod client;
pub mod config;
pub mod connection_manager;
pub mod coordinator;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod index;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod skills;
pub mod state;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::NodeConfig;
pub use coordinator::TeamCoordinator;
pub use error::{Result, TeamError};
pub use peer::{Identity, Team, TeamMember};

use client::LeaderClient;
use config::TransportConfig;
use connection_manager::ConnectionManager;
use coordinator::CoordinatorParts;
use directory::TeamDirectory;
use discovery::{Advertiser, MdnsAdvertiser};
use hub::LeaderHub;
use index::IndexRegistry;
use network::{InterfaceSource, NetworkResolver, SystemInterfaces};
use protocol::AuthPayload;
use skills::SkillProvider;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::{DataDir, IdentityStore, NetworkConfigStore};
use sync::SyncEngine;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Seams a caller may swap out, mostly so tests need no LAN or multicast.
pub struct NodeOptions {
    pub interfaces: Arc<dyn InterfaceSource>,
    /// `None` advertises over mDNS.
    pub advertiser: Option<Arc<dyn Advertiser>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            interfaces: Arc::new(SystemInterfaces),
            advertiser: None,
        }
    }
}

/// Every long-lived component of a node, wired together.
pub struct Services {
    pub data: DataDir,
    pub identity: Arc<IdentityStore>,
    pub network: Arc<NetworkConfigStore>,
    pub resolver: NetworkResolver,
    pub directory: Arc<TeamDirectory>,
    pub indexes: Arc<IndexRegistry>,
    pub hub: Arc<LeaderHub>,
    pub connections: Arc<ConnectionManager>,
    pub sync: Arc<SyncEngine>,
    pub coordinator: Arc<TeamCoordinator>,
    pub client: LeaderClient,
    pub skills: SkillProvider,
    pub root: CancellationToken,
}

impl Services {
    /// `port` is the one peers reach this node on.
    pub fn build(config: &NodeConfig, port: u16, options: NodeOptions) -> Result<Self> {
        Self::build_with(config, config.transport(), port, options)
    }

    pub fn build_with(
        config: &NodeConfig,
        transport: TransportConfig,
        port: u16,
        options: NodeOptions,
    ) -> Result<Self> {
        let data = DataDir::new(&config.data_dir);
        let identity = Arc::new(IdentityStore::open(&data));
        let network = Arc::new(NetworkConfigStore::open(&data));
        let resolver = NetworkResolver::new(options.interfaces);
        let advertiser: Arc<dyn Advertiser> = match options.advertiser {
            Some(advertiser) => advertiser,
            None => Arc::new(MdnsAdvertiser::new()?),
        };
        let directory = Arc::new(TeamDirectory::open(data.clone()));
        let indexes = Arc::new(IndexRegistry::new(data.clone()));
        let client = LeaderClient::new(config.request_timeout(), config.download_timeout())?;

        let root = CancellationToken::new();
        let hub = Arc::new(LeaderHub::new(transport.clone(), root.child_token()));
        let sync = SyncEngine::new(directory.clone(), indexes.clone(), client.clone());

        let auth = identity
            .get()
            .map(|i| AuthPayload {
                member_id: i.id,
                member_name: i.name,
                endpoint: String::new(),
            })
            .unwrap_or(AuthPayload {
                member_id: String::new(),
                member_name: String::new(),
                endpoint: String::new(),
            });
        let connections = Arc::new(ConnectionManager::new(
            transport,
            auth,
            sync.clone(),
            root.child_token(),
        ));

        let coordinator = Arc::new(TeamCoordinator::new(CoordinatorParts {
            identity: identity.clone(),
            network: network.clone(),
            resolver: resolver.clone(),
            advertiser,
            directory: directory.clone(),
            indexes: indexes.clone(),
            hub: hub.clone(),
            connections: connections.clone(),
            client: client.clone(),
            port,
        }));
        hub.set_handler(coordinator.clone());
        sync.add_observer(coordinator.clone());

        Ok(Self {
            skills: SkillProvider::new(data.skills_root()),
            data,
            identity,
            network,
            resolver,
            directory,
            indexes,
            hub,
            connections,
            sync,
            coordinator,
            client,
            root,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            coordinator: self.coordinator.clone(),
            directory: self.directory.clone(),
            indexes: self.indexes.clone(),
            hub: self.hub.clone(),
            identity: self.identity.clone(),
            skills: self.skills.clone(),
        }
    }
}

/// A running peer: HTTP listener, leader hub, member connections and the
/// periodic sync loop.
pub struct Node {
    services: Services,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
    periodic: JoinHandle<()>,
}

impl Node {
    pub async fn start(config: NodeConfig, options: NodeOptions) -> Result<Self> {
        Self::start_with(config, None, options).await
    }

    /// Like [`Node::start`] with explicit transport timings.
    pub async fn start_with(
        config: NodeConfig,
        transport: Option<TransportConfig>,
        options: NodeOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.bind.as_str(), config.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => TeamError::PortInUse(config.port),
                _ => TeamError::Io(e),
            })?;
        let local_addr = listener.local_addr()?;

        let transport = transport.unwrap_or_else(|| config.transport());
        let services = Services::build_with(&config, transport, local_addr.port(), options)?;
        services.coordinator.restore().await;

        let periodic = services
            .sync
            .spawn_periodic(config.sync_interval(), services.root.child_token());

        let router = api::build_router(services.app_state());
        let stop = services.root.clone();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "HTTP server stopped");
            }
        });

        tracing::info!(%local_addr, data_dir = %config.data_dir.display(), "Node listening");
        Ok(Self {
            services,
            local_addr,
            server,
            periodic,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn coordinator(&self) -> &Arc<TeamCoordinator> {
        &self.services.coordinator
    }

    pub fn directory(&self) -> &Arc<TeamDirectory> {
        &self.services.directory
    }

    pub fn indexes(&self) -> &Arc<IndexRegistry> {
        &self.services.indexes
    }

    pub fn hub(&self) -> &Arc<LeaderHub> {
        &self.services.hub
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.services.connections
    }

    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.services.sync
    }

    /// Stops advertising, closes every team connection and the listener.
    pub async fn shutdown(self) {
        self.services.coordinator.shutdown();
        self.services.root.cancel();
        self.periodic.abort();
        let mut server = self.server;
        if tokio::time::timeout(Duration::from_secs(5), &mut server)
            .await
            .is_err()
        {
            tracing::warn!("HTTP server did not stop in time");
            server.abort();
        }
        tracing::info!(local_addr = %self.local_addr, "Node stopped");
    }
}
