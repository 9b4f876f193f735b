// Handler boundary
//
// The router hands a routed message to a `MessageHandler` as (task text,
// routing context) and gets back (output text, success, elapsed). How the
// handler runs is its own business; `CommandHandler` runs a configured
// program with the task on stdin.

use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::bus::{Message, MessageType};
use crate::config::HandlerConfig;

/// Routing metadata injected alongside the task so the handler can tell
/// routed input from direct human input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerContext {
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub message_id: String,
    pub message_type: MessageType,
    pub thread_id: String,
    /// Local agent the message was resolved to.
    pub target_agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerRequest {
    pub task: String,
    pub context: HandlerContext,
}

impl HandlerRequest {
    pub fn for_message(message: &Message, target_agent_id: &str, target_session_id: Option<&str>) -> Self {
        Self {
            task: message.content.clone(),
            context: HandlerContext {
                sender_id: message.sender_id.clone(),
                channel_id: message.channel_id.clone(),
                message_id: message.id.clone(),
                message_type: message.message_type,
                thread_id: message.thread_key().to_string(),
                target_agent_id: target_agent_id.to_string(),
                target_session_id: target_session_id.map(String::from),
            },
        }
    }

    /// Task text prefixed with a routing header.
    pub fn prompt(&self) -> String {
        let ctx = &self.context;
        let mut header = format!(
            "[routed message {} from {} ({})",
            ctx.message_id,
            ctx.sender_id,
            ctx.message_type.as_str()
        );
        if let Some(channel) = &ctx.channel_id {
            header.push_str(&format!(" in channel {}", channel));
        }
        header.push(']');
        format!("{}\n\n{}", header, self.task)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    pub text: String,
    pub success: bool,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to start handler '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no handler configured")]
    NotConfigured,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutput, HandlerError>;
}

/// Runs a configured program per message.
///
/// The prompt goes to stdin; the context is also exported as
/// `AGENTLINK_SENDER_ID`, `AGENTLINK_MESSAGE_ID`, `AGENTLINK_MESSAGE_TYPE`,
/// `AGENTLINK_THREAD_ID`, `AGENTLINK_CHANNEL_ID` and `AGENTLINK_TARGET_AGENT_ID`.
/// Stdout is the reply. A non-zero exit is a failed run whose output is
/// stderr (or stdout if stderr is empty).
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &HandlerConfig) -> Option<Self> {
        config
            .is_configured()
            .then(|| Self::new(config.command.trim(), config.args.clone()))
    }
}

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutput, HandlerError> {
        let started = Instant::now();
        let ctx = &request.context;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("AGENTLINK_SENDER_ID", &ctx.sender_id)
            .env("AGENTLINK_MESSAGE_ID", &ctx.message_id)
            .env("AGENTLINK_MESSAGE_TYPE", ctx.message_type.as_str())
            .env("AGENTLINK_THREAD_ID", &ctx.thread_id)
            .env("AGENTLINK_TARGET_AGENT_ID", &ctx.target_agent_id)
            .env("AGENTLINK_CHANNEL_ID", ctx.channel_id.as_deref().unwrap_or(""))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The router's timeout drops this future; take the child with it.
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| HandlerError::Spawn {
            command: self.program.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt();
            // A handler that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(HandlerError::Io(e));
                }
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        if output.status.success() {
            Ok(HandlerOutput {
                text: stdout,
                success: true,
                elapsed: started.elapsed(),
            })
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = if stderr.is_empty() { stdout } else { stderr };
            Ok(HandlerOutput {
                text: format!("exit {}: {}", code, detail),
                success: false,
                elapsed: started.elapsed(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task: &str) -> HandlerRequest {
        HandlerRequest {
            task: task.to_string(),
            context: HandlerContext {
                sender_id: "agentA".to_string(),
                channel_id: None,
                message_id: "m1".to_string(),
                message_type: MessageType::Command,
                thread_id: "t1".to_string(),
                target_agent_id: "a2".to_string(),
                target_session_id: Some("s2".to_string()),
            },
        }
    }

    #[test]
    fn test_prompt_carries_routing_header() {
        let prompt = request("ping").prompt();
        assert!(prompt.starts_with("[routed message m1 from agentA (command)]"));
        assert!(prompt.ends_with("\n\nping"));
    }

    #[test]
    fn test_from_config_requires_command() {
        assert!(CommandHandler::from_config(&HandlerConfig::default()).is_none());
        let config = HandlerConfig {
            command: "cat".to_string(),
            ..Default::default()
        };
        assert!(CommandHandler::from_config(&config).is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_reads_stdin_and_env() {
        let handler = CommandHandler::new(
            "sh",
            vec![
                "-c".to_string(),
                "tail -n 1; printf ' from %s' \"$AGENTLINK_SENDER_ID\"".to_string(),
            ],
        );
        let output = handler.handle(request("ping")).await.unwrap();
        assert!(output.success);
        assert_eq!(output.text, "ping from agentA");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_nonzero_exit_is_failure() {
        let handler = CommandHandler::new(
            "sh",
            vec!["-c".to_string(), "cat >/dev/null; echo boom >&2; exit 3".to_string()],
        );
        let output = handler.handle(request("ping")).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.text, "exit 3: boom");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let handler = CommandHandler::new("/definitely/not/a/program", Vec::new());
        let err = handler.handle(request("ping")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Spawn { .. }));
    }
}
