// Daemon module
//
// The long-lived process: registers local sessions as agents, keeps their
// presence alive, consumes the event stream and routes messages.

pub mod discovery;
pub mod heartbeat;
pub mod lifecycle;
pub mod registry;
mod runner;

pub use discovery::{DiscoveryReconciler, ReconcileReport};
pub use heartbeat::{HeartbeatScheduler, AUTH_FAILURE_ALERT_THRESHOLD};
pub use lifecycle::{process_exists, DaemonLifecycle, DaemonStatus};
pub use registry::{AgentRegistry, LocalAgent};
pub use runner::{run_foreground, AgentDaemon, DaemonParts};
