// Agentlink - presence, discovery and message routing for assistant agents
// Library exports

pub mod bus;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod router;
pub mod server;
pub mod session;
pub mod stream;
pub mod subscription;
