// Command handlers
//
// Each subcommand loads configuration, talks to the bus or local state, and
// prints a plain-text report. Formatting lives in small `format_*` helpers so
// it can be tested without a bus.

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::args::{ChannelAction, Cli, Commands, ConfigAction, DaemonAction, PasteAction};
use crate::bus::thread::{fetch_thread, wait_for_reply};
use crate::bus::{
    Agent, AgentQuery, BusApi, BusClient, Channel, Message, MessageType, NewChannel, NewMessage,
    NewPaste, TargetAddress, TargetType,
};
use crate::config::{self, Config};
use crate::daemon::{self, DaemonLifecycle, DaemonStatus};
use crate::node::MachineIdentity;
use crate::router::{DeliveryMode, Inbox, InboxEntry, DELIVERY_MODE_KEY};
use crate::subscription::SubscriptionRegistry;

const REPLY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };

    match cli.command {
        Commands::Config { action } => handle_config(action, &config_path),
        Commands::Daemon { action } => {
            let config = config::load_config_from(&config_path)?;
            handle_daemon(action, config).await
        }
        Commands::Inbox { target, drain } => {
            let config = config::load_config_from(&config_path)?;
            let inbox = Inbox::new(config.paths.inbox_dir());
            print!("{}", handle_inbox(&inbox, target.as_deref(), drain)?);
            Ok(())
        }
        command => {
            let config = config::load_config_from(&config_path)?;
            let bus = connect_bus(&config)?;
            handle_bus_command(command, &config, bus).await
        }
    }
}

fn connect_bus(config: &Config) -> Result<Arc<dyn BusApi>> {
    if config.bus.api_key.trim().is_empty() {
        anyhow::bail!("No bus credential configured. Set bus.api_key or AGENTLINK_API_KEY");
    }
    let client = BusClient::new(&config.bus).context("Failed to create bus client")?;
    Ok(Arc::new(client))
}

async fn handle_bus_command(command: Commands, config: &Config, bus: Arc<dyn BusApi>) -> Result<()> {
    match command {
        Commands::Agents { machine, status } => {
            let query = AgentQuery {
                machine_id: machine,
                status: status.map(Into::into),
                ..Default::default()
            };
            let agents = bus.list_agents(&query).await?;
            print!("{}", format_agents(&agents, Utc::now()));
        }
        Commands::Send {
            target,
            content,
            sender,
            message_type,
            mode,
            channel,
            thread,
            ttl,
            wait,
        } => {
            let message = build_message(
                &sender,
                &target,
                message_type.into(),
                mode.map(Into::into),
                &content,
                channel,
                thread,
                ttl.map(Duration::from_secs),
            );
            let sent = bus.send_message(&message).await?;
            println!("Sent {} (thread {})", sent.id, sent.thread_key());

            if let Some(secs) = wait {
                let reply = wait_for_reply(
                    bus.as_ref(),
                    sent.thread_key(),
                    &sent.id,
                    Duration::from_secs(secs),
                    REPLY_POLL_INTERVAL,
                )
                .await?;
                match reply {
                    Some(reply) => print!("{}", format_message(&reply)),
                    None => anyhow::bail!("No reply within {}s", secs),
                }
            }
        }
        Commands::Thread { thread_id } => {
            let thread = fetch_thread(bus.as_ref(), &thread_id).await?;
            if thread.is_empty() {
                println!("No messages in thread {}", thread_id);
            }
            for message in &thread {
                print!("{}", format_message(message));
            }
        }
        Commands::Listen { channel } => listen(config, bus, &channel).await?,
        Commands::Channels { action } => handle_channels(action, bus.as_ref()).await?,
        Commands::Paste { action } => handle_paste(action, bus.as_ref()).await?,
        Commands::Daemon { .. } | Commands::Inbox { .. } | Commands::Config { .. } => {
            anyhow::bail!("command does not use the bus")
        }
    }
    Ok(())
}

async fn handle_daemon(action: DaemonAction, config: Config) -> Result<()> {
    let lifecycle = DaemonLifecycle::new(config.paths.pid_file());
    match action {
        DaemonAction::Run => daemon::run_foreground(config).await,
        DaemonAction::Stop => {
            match lifecycle.stop_daemon()? {
                Some(pid) => println!("Stopped daemon (PID {})", pid),
                None => println!("Daemon is not running"),
            }
            Ok(())
        }
        DaemonAction::Status => {
            match lifecycle.status() {
                DaemonStatus::Running { pid } => println!("Daemon running (PID {})", pid),
                DaemonStatus::Stale => println!("Daemon not running (stale PID file)"),
                DaemonStatus::NotRunning => println!("Daemon not running"),
            }
            if config.server.enabled {
                match fetch_health(&config.server.bind_address).await {
                    Ok(health) => print!("{}", format_health(&health)),
                    Err(e) => tracing::debug!(error = %e, "status server unreachable"),
                }
            }
            Ok(())
        }
    }
}

async fn fetch_health(bind_address: &str) -> Result<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(STATUS_REQUEST_TIMEOUT)
        .build()?;
    let health = client
        .get(format!("http://{}/health", bind_address))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(health)
}

fn handle_config(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => {
            config::write_default_config(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
        ConfigAction::Show => {
            let mut config = config::load_config_from(path)?;
            if !config.bus.api_key.is_empty() {
                config.bus.api_key = "********".to_string();
            }
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn handle_inbox(inbox: &Inbox, target: Option<&str>, drain: bool) -> Result<String> {
    let Some(target) = target else {
        let targets = inbox.targets()?;
        if targets.is_empty() {
            return Ok("Inbox is empty\n".to_string());
        }
        return Ok(targets.iter().map(|t| format!("{}\n", t)).collect());
    };

    let entries = if drain { inbox.drain(target)? } else { inbox.read(target)? };
    Ok(format_inbox(target, &entries))
}

async fn handle_channels(action: ChannelAction, bus: &dyn BusApi) -> Result<()> {
    match action {
        ChannelAction::List => print!("{}", format_channels(&bus.list_channels().await?)),
        ChannelAction::Create { name, description } => {
            let channel = bus.create_channel(&NewChannel { name, description }).await?;
            println!("Created channel {} ({})", channel.name, channel.id);
        }
        ChannelAction::Delete { channel_id } => {
            bus.delete_channel(&channel_id).await?;
            println!("Deleted channel {}", channel_id);
        }
    }
    Ok(())
}

async fn handle_paste(action: PasteAction, bus: &dyn BusApi) -> Result<()> {
    match action {
        PasteAction::Create { file, created_by, ttl } => {
            let content = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read stdin")?;
                    buf
                }
            };
            let paste = bus
                .create_paste(&NewPaste {
                    content,
                    created_by,
                    ttl_seconds: ttl,
                })
                .await?;
            println!("{}", paste.id);
        }
        PasteAction::Get { paste_id } => {
            let paste = bus.get_paste(&paste_id).await?;
            print!("{}", paste.content);
            if !paste.content.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

async fn listen(config: &Config, bus: Arc<dyn BusApi>, channel: &str) -> Result<()> {
    let identity =
        MachineIdentity::resolve(config.machine_id.as_deref(), &config.paths.machine_id_file())?;
    let registry = SubscriptionRegistry::new(bus, identity.id, config.stream.clone());
    registry
        .subscribe(channel, |message| {
            print!("{}", format_message(message));
            Ok(())
        })
        .await;
    println!("Listening on channel {} (Ctrl-C to stop)", channel);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    registry.close().await;
    Ok(())
}

/// Build an outbound message. The target type follows the address scheme;
/// a bare key is treated as an agent address.
#[allow(clippy::too_many_arguments)]
pub fn build_message(
    sender: &str,
    target: &str,
    message_type: MessageType,
    mode: Option<DeliveryMode>,
    content: &str,
    channel: Option<String>,
    thread: Option<String>,
    ttl: Option<Duration>,
) -> NewMessage {
    let address = TargetAddress::parse(target);
    let target_type = address.scheme.unwrap_or(TargetType::Agent);
    let thread = thread.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut message = NewMessage::new(sender, target_type, target, message_type, content)
        .with_thread(thread)
        .with_metadata(DELIVERY_MODE_KEY, mode.unwrap_or_default().as_str());
    if let Some(channel) = channel {
        message = message.with_channel(channel);
    } else if target_type == TargetType::Channel {
        message = message.with_channel(address.key);
    }
    if let Some(ttl) = ttl {
        message = message.with_ttl(ttl);
    }
    message
}

pub fn format_agents(agents: &[Agent], now: chrono::DateTime<Utc>) -> String {
    if agents.is_empty() {
        return "No agents registered\n".to_string();
    }
    let mut out = format!(
        "{:<38} {:<20} {:<8} {}\n",
        "ID", "MACHINE", "STATUS", "SESSION"
    );
    for agent in agents {
        let label = agent
            .session_name
            .as_deref()
            .or(agent.project_path.as_deref())
            .unwrap_or(&agent.session_id);
        out.push_str(&format!(
            "{:<38} {:<20} {:<8} {}\n",
            agent.id,
            agent.machine_id,
            agent.presence(now).as_str(),
            label
        ));
    }
    out
}

pub fn format_message(message: &Message) -> String {
    let when = message
        .created_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "[{}] {} {} -> {} ({}, {})\n{}\n\n",
        when,
        message.id,
        message.sender_id,
        message.target_address,
        message.message_type.as_str(),
        message.status.as_str(),
        message.content
    )
}

pub fn format_inbox(target: &str, entries: &[InboxEntry]) -> String {
    if entries.is_empty() {
        return format!("No messages for {}\n", target);
    }
    let mut out = format!("{} message(s) for {}\n\n", entries.len(), target);
    for entry in entries {
        out.push_str(&format_message(&entry.message));
    }
    out
}

fn format_channels(channels: &[Channel]) -> String {
    if channels.is_empty() {
        return "No channels\n".to_string();
    }
    channels
        .iter()
        .map(|c| match &c.description {
            Some(description) => format!("{}  {}  {}\n", c.id, c.name, description),
            None => format!("{}  {}\n", c.id, c.name),
        })
        .collect()
}

fn format_health(health: &serde_json::Value) -> String {
    let stream = &health["stream"];
    let agents = health["agents"].as_array().map(|a| a.len()).unwrap_or(0);
    format!(
        "Machine:    {}\nStatus:     {}\nStream:     {} (reconnects: {})\nAgents:     {}\n",
        health["machineId"].as_str().unwrap_or("?"),
        health["status"].as_str().unwrap_or("?"),
        if stream["connected"].as_bool().unwrap_or(false) { "connected" } else { "disconnected" },
        stream["reconnectCount"].as_u64().unwrap_or(0),
        agents
    )
}
