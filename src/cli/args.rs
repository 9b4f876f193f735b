// Command-line definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::bus::{MessageType, Presence};
use crate::router::DeliveryMode;

#[derive(Parser)]
#[command(name = "agentlink")]
#[command(author, version, about = "Presence, discovery and message routing for assistant agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Config file (default: ~/.agentlink/config.toml)
    #[arg(long, global = true, env = "AGENTLINK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run or control the agent daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// List agents registered on the bus
    Agents {
        /// Only agents on this machine
        #[arg(long)]
        machine: Option<String>,

        /// Only agents with this presence
        #[arg(long, value_enum)]
        status: Option<PresenceArg>,
    },

    /// Send a message
    Send {
        /// Target address (agent://machine/session, project://machine/path, channel://name)
        target: String,

        /// Message content
        content: String,

        /// Sender agent id
        #[arg(long = "from", env = "AGENTLINK_AGENT_ID")]
        sender: String,

        #[arg(long = "type", value_enum, default_value = "command")]
        message_type: MessageTypeArg,

        /// Delivery mode (default: push)
        #[arg(long, value_enum)]
        mode: Option<DeliveryModeArg>,

        #[arg(long)]
        channel: Option<String>,

        /// Reply within an existing thread
        #[arg(long)]
        thread: Option<String>,

        /// Expire the message if unclaimed after this many seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Wait up to this many seconds for a reply
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Show a thread in order
    Thread { thread_id: String },

    /// Print messages posted to a channel as they arrive
    Listen { channel: String },

    /// Show the local pull inbox
    Inbox {
        /// Target key (lists targets when omitted)
        target: Option<String>,

        /// Remove the entries after printing them
        #[arg(long)]
        drain: bool,
    },

    /// Manage channels
    Channels {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Share or fetch pastes
    Paste {
        #[command(subcommand)]
        action: PasteAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Run the daemon in the foreground
    Run,
    /// Stop a running daemon
    Stop,
    /// Show whether the daemon is running and its stream health
    Status,
}

#[derive(Subcommand)]
pub enum ChannelAction {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        channel_id: String,
    },
}

#[derive(Subcommand)]
pub enum PasteAction {
    /// Create a paste from a file, or stdin when no file is given
    Create {
        file: Option<PathBuf>,
        #[arg(long = "from", env = "AGENTLINK_AGENT_ID")]
        created_by: Option<String>,
        /// Seconds until the paste expires
        #[arg(long)]
        ttl: Option<u64>,
    },
    Get {
        paste_id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default config file
    Init,
    /// Show the effective configuration
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PresenceArg {
    Active,
    Idle,
    Offline,
}

impl From<PresenceArg> for Presence {
    fn from(arg: PresenceArg) -> Self {
        match arg {
            PresenceArg::Active => Self::Active,
            PresenceArg::Idle => Self::Idle,
            PresenceArg::Offline => Self::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MessageTypeArg {
    Command,
    Chat,
    Response,
}

impl From<MessageTypeArg> for MessageType {
    fn from(arg: MessageTypeArg) -> Self {
        match arg {
            MessageTypeArg::Command => Self::Command,
            MessageTypeArg::Chat => Self::Chat,
            MessageTypeArg::Response => Self::Response,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeliveryModeArg {
    Push,
    Pull,
    Broadcast,
}

impl From<DeliveryModeArg> for DeliveryMode {
    fn from(arg: DeliveryModeArg) -> Self {
        match arg {
            DeliveryModeArg::Push => Self::Push,
            DeliveryModeArg::Pull => Self::Pull,
            DeliveryModeArg::Broadcast => Self::Broadcast,
        }
    }
}
