// Logging setup
//
// `RUST_LOG` wins when set; otherwise the CLI verbosity picks the level for
// this crate and everything else stays at `warn`. `log` records from
// dependencies are bridged into tracing.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "agentlink=info,warn",
        1 => "agentlink=debug,info",
        _ => "agentlink=trace,debug",
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbosity: u8) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr));

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        let _ = tracing_log::LogTracer::init();
    }
}
