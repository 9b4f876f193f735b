// AgentDaemon: wires the components together and owns their lifetimes.
//
// One bus client and one stream connection, shared by reference:
//
//   StreamConnection ──queue──▶ MessageRouter ──▶ BusApi (claim/reply/status)
//   DiscoveryReconciler ──▶ AgentRegistry + HeartbeatScheduler
//
// Shutdown order matters: discovery → stream → heartbeats → deregistration.
// Reversing it lets a heartbeat fire against an agent that is already gone.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::discovery::DiscoveryReconciler;
use super::heartbeat::HeartbeatScheduler;
use super::lifecycle::DaemonLifecycle;
use super::registry::AgentRegistry;
use crate::bus::{BusApi, BusClient};
use crate::config::Config;
use crate::node::MachineIdentity;
use crate::router::{CommandHandler, Inbox, MessageHandler, MessageRouter};
use crate::server::{self, StatusState};
use crate::session::{SessionDirectory, SessionSource};
use crate::stream::StreamConnection;

/// External collaborators the daemon is built from.
pub struct DaemonParts {
    pub bus: Arc<dyn BusApi>,
    pub sessions: Arc<dyn SessionSource>,
    pub handler: Option<Arc<dyn MessageHandler>>,
}

struct Tasks {
    discovery_cancel: CancellationToken,
    discovery: JoinHandle<()>,
    router_cancel: CancellationToken,
    router: JoinHandle<()>,
    server_cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

pub struct AgentDaemon {
    config: Config,
    machine_id: String,
    registry: AgentRegistry,
    heartbeats: Arc<HeartbeatScheduler>,
    stream: Arc<StreamConnection>,
    reconciler: Arc<DiscoveryReconciler>,
    router: Arc<MessageRouter>,
    tasks: Mutex<Option<Tasks>>,
}

impl AgentDaemon {
    pub fn new(config: Config, machine_id: impl Into<String>, parts: DaemonParts) -> Self {
        let machine_id = machine_id.into();
        let registry = AgentRegistry::new();
        let heartbeats = Arc::new(HeartbeatScheduler::new(
            parts.bus.clone(),
            config.heartbeat.interval(),
        ));
        let stream = Arc::new(StreamConnection::new(
            parts.bus.clone(),
            machine_id.clone(),
            config.stream.clone(),
        ));
        let reconciler = Arc::new(DiscoveryReconciler::new(
            parts.bus.clone(),
            machine_id.clone(),
            parts.sessions,
            registry.clone(),
            heartbeats.clone(),
            stream.clone(),
            config.discovery.interval(),
        ));
        let router = Arc::new(MessageRouter::new(
            parts.bus,
            machine_id.clone(),
            registry.clone(),
            parts.handler,
            config.handler.timeout(),
            Inbox::new(config.paths.inbox_dir()),
        ));

        Self {
            config,
            machine_id,
            registry,
            heartbeats,
            stream,
            reconciler,
            router,
            tasks: Mutex::new(None),
        }
    }

    /// Build the production daemon from configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate_for_daemon()?;
        let identity = MachineIdentity::resolve(
            config.machine_id.as_deref(),
            &config.paths.machine_id_file(),
        )?;
        let bus: Arc<dyn BusApi> =
            Arc::new(BusClient::new(&config.bus).context("Failed to create bus client")?);
        let sessions: Arc<dyn SessionSource> =
            Arc::new(SessionDirectory::new(config.paths.sessions_dir()));
        let handler = CommandHandler::from_config(&config.handler)
            .map(|h| Arc::new(h) as Arc<dyn MessageHandler>);
        if handler.is_none() {
            warn!("No handler.command configured; push messages will be left pending");
        }

        Ok(Self::new(
            config,
            identity.id,
            DaemonParts {
                bus,
                sessions,
                handler,
            },
        ))
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatScheduler> {
        &self.heartbeats
    }

    pub fn stream(&self) -> &Arc<StreamConnection> {
        &self.stream
    }

    pub fn reconciler(&self) -> &Arc<DiscoveryReconciler> {
        &self.reconciler
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Start every component. No-op if already started.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        // Subscribe before connecting so no event is missed.
        let router_cancel = CancellationToken::new();
        let router = self
            .router
            .clone()
            .spawn(self.stream.subscribe(), router_cancel.clone());
        self.stream.connect().await;

        let discovery_cancel = CancellationToken::new();
        let discovery = self.reconciler.clone().spawn(discovery_cancel.clone());

        let server_cancel = CancellationToken::new();
        let server = if self.config.server.enabled {
            let state = StatusState {
                machine_id: self.machine_id.clone(),
                stream: self.stream.clone(),
                registry: self.registry.clone(),
                started_at: Utc::now(),
            };
            let bind = self.config.server.bind_address.clone();
            let cancel = server_cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server::serve(&bind, state, cancel).await {
                    warn!(error = %e, "status server stopped");
                }
            }))
        } else {
            None
        };

        info!(machine_id = %self.machine_id, "agent daemon started");
        *tasks = Some(Tasks {
            discovery_cancel,
            discovery,
            router_cancel,
            router,
            server_cancel,
            server,
        });
        Ok(())
    }

    /// Stop everything in dependency order. Idempotent.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        info!("agent daemon shutting down");

        tasks.discovery_cancel.cancel();
        let _ = tasks.discovery.await;

        self.stream.disconnect().await;

        self.heartbeats.stop_all().await;

        let removed = self.reconciler.deregister_all().await;
        info!(count = removed.len(), "agents deregistered");

        tasks.router_cancel.cancel();
        let _ = tasks.router.await;

        tasks.server_cancel.cancel();
        if let Some(server) = tasks.server {
            let _ = server.await;
        }
        info!("agent daemon stopped");
    }
}

/// Run the daemon in the foreground until Ctrl-C or SIGTERM.
pub async fn run_foreground(config: Config) -> Result<()> {
    let lifecycle = DaemonLifecycle::new(config.paths.pid_file());
    lifecycle.acquire()?;

    let daemon = AgentDaemon::from_config(config)?;
    let started = daemon.start().await;
    if started.is_ok() {
        wait_for_shutdown_signal().await;
    }
    daemon.shutdown().await;

    if let Err(e) = lifecycle.cleanup() {
        warn!(error = %e, "failed to remove PID file");
    }
    started
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received Ctrl-C"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C");
    }
}
