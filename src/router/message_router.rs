// MessageRouter: turns one inbound message into exactly one local side
// effect and, for push messages, exactly one reply.
//
//   observed → classified ─push──▶ resolved → claimed → handled → replied → delivered
//                          ├pull──▶ inbox
//                          └broadcast ▶ ignored
//
// The claim is the only exclusivity point across daemons. Losing it is the
// normal "someone else got it" outcome and is never retried.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::SeenMessages;
use super::delivery::DeliveryMode;
use super::handler::{HandlerError, HandlerOutput, HandlerRequest, MessageHandler};
use super::inbox::Inbox;
use super::resolve::{resolve_target, Resolution};
use crate::bus::{
    BusApi, ClaimOutcome, Message, MessageStatus, MessageType, NewMessage, TargetAddress,
    TargetType,
};
use crate::bus::thread::IN_REPLY_TO_KEY;
use crate::daemon::AgentRegistry;
use crate::metrics::record_routed;
use crate::stream::{ConnectionStatus, StreamEvent};

/// Why a message was left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Responses are read by thread readers, never handled.
    Response,
    NotPending,
    Expired,
    Broadcast,
    UnknownMode(String),
    ChannelTarget,
    OtherMachine,
    NoHandler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Ignored(IgnoreReason),
    /// Seen recently; replay after a stream resume.
    Duplicate,
    Inboxed { target: String },
    /// No local agent matches; left pending for another daemon or expiry.
    Unresolved,
    /// Another daemon claimed it first.
    ClaimLost,
    Delivered { reply_id: Option<String> },
    /// Claimed and attempted; the handler failed. Still marked delivered.
    HandlerFailed { reply_id: Option<String>, error: String },
    /// A bus call failed before the message was claimed.
    Failed(String),
}

impl RouteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Ignored(_) | RouteOutcome::Duplicate => "ignored",
            RouteOutcome::Inboxed { .. } => "inboxed",
            RouteOutcome::Unresolved => "unresolved",
            RouteOutcome::ClaimLost => "claim_lost",
            RouteOutcome::Delivered { .. } => "delivered",
            RouteOutcome::HandlerFailed { .. } => "handler_failed",
            RouteOutcome::Failed(_) => "error",
        }
    }
}

pub struct MessageRouter {
    bus: Arc<dyn BusApi>,
    machine_id: String,
    registry: AgentRegistry,
    handler: Option<Arc<dyn MessageHandler>>,
    handler_timeout: Duration,
    inbox: Inbox,
    seen: SeenMessages,
}

impl MessageRouter {
    pub fn new(
        bus: Arc<dyn BusApi>,
        machine_id: impl Into<String>,
        registry: AgentRegistry,
        handler: Option<Arc<dyn MessageHandler>>,
        handler_timeout: Duration,
        inbox: Inbox,
    ) -> Self {
        Self {
            bus,
            machine_id: machine_id.into(),
            registry,
            handler,
            handler_timeout,
            inbox,
            seen: SeenMessages::default(),
        }
    }

    /// Consume stream events until cancelled. Each message is routed on its
    /// own task so a slow handler never holds up the queue.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    event = events.recv() => match event {
                        None => break,
                        Some(StreamEvent::Message(message)) => {
                            let router = self.clone();
                            in_flight.spawn(async move {
                                router.route(message).await;
                            });
                        }
                        Some(StreamEvent::Status(ConnectionStatus::Connected)) => {
                            debug!("router: stream connected");
                        }
                        Some(StreamEvent::Status(ConnectionStatus::Disconnected { reason })) => {
                            debug!(%reason, "router: stream disconnected");
                        }
                    },
                }
            }
            // Dropping in-flight work kills handler children (kill_on_drop).
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            debug!("router stopped");
        })
    }

    /// Route one message.
    pub async fn route(&self, message: Message) -> RouteOutcome {
        let outcome = self.route_inner(&message).await;
        record_routed(outcome.label());
        outcome
    }

    async fn route_inner(&self, message: &Message) -> RouteOutcome {
        if message.message_type == MessageType::Response {
            return RouteOutcome::Ignored(IgnoreReason::Response);
        }
        if message.status != MessageStatus::Pending {
            return RouteOutcome::Ignored(IgnoreReason::NotPending);
        }
        if message.is_expired(Utc::now()) {
            debug!(message_id = %message.id, "skipping expired message");
            return RouteOutcome::Ignored(IgnoreReason::Expired);
        }

        let mode = match DeliveryMode::classify(&message.metadata) {
            Ok(mode) => mode,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "ignoring message with unrecognized delivery mode");
                return RouteOutcome::Ignored(IgnoreReason::UnknownMode(e.0));
            }
        };
        if mode == DeliveryMode::Broadcast {
            debug!(message_id = %message.id, "broadcast message; nothing to route");
            return RouteOutcome::Ignored(IgnoreReason::Broadcast);
        }
        if message.target_type == TargetType::Channel {
            return RouteOutcome::Ignored(IgnoreReason::ChannelTarget);
        }

        let address = TargetAddress::parse(&message.target_address);
        if !address.is_for_machine(&self.machine_id) {
            return RouteOutcome::Ignored(IgnoreReason::OtherMachine);
        }

        if !self.seen.first_sighting(&message.id) {
            debug!(message_id = %message.id, "already seen; skipping replay");
            return RouteOutcome::Duplicate;
        }

        let agents = self.registry.agents().await;
        let resolution = resolve_target(&address, &self.machine_id, &agents);

        match mode {
            DeliveryMode::Pull => self.file_in_inbox(message, &address, resolution),
            DeliveryMode::Push => match resolution {
                Some(resolution) => self.deliver(message, resolution).await,
                None => {
                    info!(
                        message_id = %message.id,
                        target = %message.target_address,
                        "no local agent matches target; leaving it pending"
                    );
                    // A matching agent may register before the message expires.
                    self.seen.forget(&message.id);
                    RouteOutcome::Unresolved
                }
            },
            DeliveryMode::Broadcast => RouteOutcome::Ignored(IgnoreReason::Broadcast),
        }
    }

    fn file_in_inbox(
        &self,
        message: &Message,
        address: &TargetAddress,
        resolution: Option<Resolution>,
    ) -> RouteOutcome {
        // Machine-less addresses reach every daemon; only the one hosting a
        // matching agent files it.
        let target = match (resolution, &address.machine) {
            (Some(resolution), _) => resolution.agent.session_id,
            (None, Some(_)) => address.key.clone(),
            (None, None) => {
                self.seen.forget(&message.id);
                return RouteOutcome::Unresolved;
            }
        };
        match self.inbox.append(&target, message) {
            Ok(path) => {
                info!(message_id = %message.id, target = %target, path = %path.display(), "message filed in inbox");
                RouteOutcome::Inboxed { target }
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "failed to write inbox");
                self.seen.forget(&message.id);
                RouteOutcome::Failed(e.to_string())
            }
        }
    }

    async fn deliver(&self, message: &Message, resolution: Resolution) -> RouteOutcome {
        let Some(handler) = self.handler.clone() else {
            debug!(message_id = %message.id, "no handler configured; leaving message pending");
            self.seen.forget(&message.id);
            return RouteOutcome::Ignored(IgnoreReason::NoHandler);
        };
        let agent = resolution.agent;

        match self.bus.claim_message(&message.id, &agent.id).await {
            Ok(ClaimOutcome::Claimed(_)) => {
                debug!(message_id = %message.id, agent_id = %agent.id, matched = ?resolution.matched, "claimed message");
            }
            Ok(ClaimOutcome::Lost) => {
                debug!(message_id = %message.id, "claim lost to another daemon");
                return RouteOutcome::ClaimLost;
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "claim request failed");
                self.seen.forget(&message.id);
                return RouteOutcome::Failed(e.to_string());
            }
        }

        let request = HandlerRequest::for_message(message, &agent.id, Some(&agent.session_id));
        let result = match tokio::time::timeout(self.handler_timeout, handler.handle(request)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(self.handler_timeout)),
        };

        let (reply, failure) = match result {
            Ok(HandlerOutput { text, success: true, elapsed }) => {
                info!(message_id = %message.id, elapsed_ms = elapsed.as_millis() as u64, "handler finished");
                (self.reply_to(message, &agent.id, text).with_metadata("elapsedMs", elapsed.as_millis() as u64), None)
            }
            Ok(HandlerOutput { text, success: false, elapsed }) => {
                error!(message_id = %message.id, elapsed_ms = elapsed.as_millis() as u64, output = %text, "handler reported failure");
                (self.failure_ack(message, &agent.id, &text), Some(text))
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "handler failed");
                let error = e.to_string();
                (self.failure_ack(message, &agent.id, &error), Some(error))
            }
        };

        let reply_id = match self.bus.send_message(&reply).await {
            Ok(sent) => Some(sent.id),
            Err(e) => {
                error!(message_id = %message.id, error = %e, "failed to post reply");
                None
            }
        };

        // Attempted means delivered, whatever the handler did.
        if let Err(e) = self
            .bus
            .update_message_status(&message.id, MessageStatus::Delivered)
            .await
        {
            warn!(message_id = %message.id, error = %e, "failed to mark message delivered");
        }

        match failure {
            None => RouteOutcome::Delivered { reply_id },
            Some(error) => RouteOutcome::HandlerFailed { reply_id, error },
        }
    }

    fn reply_to(&self, original: &Message, from_agent: &str, content: String) -> NewMessage {
        let mut reply = NewMessage::new(
            from_agent,
            TargetType::Agent,
            TargetAddress::for_agent_id(&original.sender_id),
            MessageType::Response,
            content,
        )
        .with_thread(original.thread_key())
        .with_metadata(IN_REPLY_TO_KEY, original.id.clone());
        if let Some(channel) = &original.channel_id {
            reply = reply.with_channel(channel.clone());
        }
        reply
    }

    fn failure_ack(&self, original: &Message, from_agent: &str, error: &str) -> NewMessage {
        self.reply_to(original, from_agent, format!("Failed to handle message: {}", error))
            .with_metadata("failed", true)
            .with_metadata("error", error.to_string())
    }
}
