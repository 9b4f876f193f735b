// CLI module

mod args;
mod commands;

pub use args::{
    ChannelAction, Cli, Commands, ConfigAction, DaemonAction, DeliveryModeArg, MessageTypeArg,
    PasteAction, PresenceArg,
};
pub use commands::{build_message, format_agents, format_inbox, format_message, run};
