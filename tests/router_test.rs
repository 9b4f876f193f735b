// Message routing against an in-memory bus

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use agentlink::bus::thread::fetch_thread;
use agentlink::bus::{BusApi, MessageStatus, MessageType};
use agentlink::config::StreamConfig;
use agentlink::daemon::{AgentRegistry, LocalAgent};
use agentlink::router::{
    HandlerError, HandlerOutput, HandlerRequest, IgnoreReason, Inbox, MessageHandler,
    MessageRouter, RouteOutcome,
};
use agentlink::session::LocalSession;
use agentlink::stream::{StreamConnection, StreamEvent};
use agentlink::bus::thread::wait_for_reply;
use common::{agent, insert_record, pending_message, FakeBus};
use tokio_util::sync::CancellationToken;

/// Answers "ping" with "pong" and counts invocations.
#[derive(Default)]
struct PongHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for PongHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if request.task == "ping" { "pong" } else { "?" };
        Ok(HandlerOutput {
            text: text.to_string(),
            success: true,
            elapsed: Duration::from_millis(5),
        })
    }
}

struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _request: HandlerRequest) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::Failed("model unavailable".to_string()))
    }
}

struct SlowHandler;

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _request: HandlerRequest) -> Result<HandlerOutput, HandlerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(HandlerOutput {
            text: "late".to_string(),
            success: true,
            elapsed: Duration::from_secs(3600),
        })
    }
}

/// Holds "hold" requests until released; answers everything else at once.
#[derive(Default)]
struct GatedHandler {
    gate: tokio::sync::Notify,
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle(&self, request: HandlerRequest) -> Result<HandlerOutput, HandlerError> {
        if request.task == "hold" {
            self.gate.notified().await;
        }
        Ok(HandlerOutput {
            text: format!("done: {}", request.task),
            success: true,
            elapsed: Duration::from_millis(1),
        })
    }
}

async fn registry_with(agent_id: &str, machine_id: &str, session_id: &str) -> AgentRegistry {
    let registry = AgentRegistry::new();
    registry
        .insert(LocalAgent {
            agent: agent(agent_id, machine_id, session_id),
            session: LocalSession::new(session_id),
        })
        .await;
    registry
}

fn router(
    bus: Arc<FakeBus>,
    registry: AgentRegistry,
    handler: Option<Arc<dyn MessageHandler>>,
    inbox_dir: &TempDir,
) -> MessageRouter {
    MessageRouter::new(
        bus,
        "m2",
        registry,
        handler,
        Duration::from_secs(5),
        Inbox::new(inbox_dir.path()),
    )
}

#[tokio::test]
async fn test_ping_pong_round_trip() {
    let bus = Arc::new(FakeBus::new());
    let ping = pending_message("m1", "agent://m2/s2", "push");
    bus.insert_message(ping.clone());

    let handler = Arc::new(PongHandler::default());
    let dir = TempDir::new().unwrap();
    let router = router(
        bus.clone(),
        registry_with("a2", "m2", "s2").await,
        Some(handler.clone()),
        &dir,
    );

    let outcome = router.route(ping).await;
    let RouteOutcome::Delivered { reply_id: Some(reply_id) } = outcome else {
        panic!("expected delivery, got {:?}", outcome);
    };

    let reply = bus.message(&reply_id).unwrap();
    assert_eq!(reply.content, "pong");
    assert_eq!(reply.message_type, MessageType::Response);
    assert_eq!(reply.sender_id, "a2");
    assert_eq!(reply.target_address, "agent://agentA");
    assert_eq!(reply.thread_id.as_deref(), Some("t1"));
    assert_eq!(reply.metadata["inReplyTo"], "m1");

    assert_eq!(bus.message("m1").unwrap().status, MessageStatus::Delivered);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    // The sender sees the ordered pair on the thread.
    let thread = fetch_thread(bus.as_ref(), "t1").await.unwrap();
    let kinds: Vec<_> = thread.iter().map(|m| m.message_type).collect();
    assert_eq!(kinds, [MessageType::Command, MessageType::Response]);
}

#[tokio::test]
async fn test_claim_race_has_one_winner() {
    let bus = Arc::new(FakeBus::new());
    let ping = pending_message("m1", "agent://s2", "push");
    bus.insert_message(ping.clone());

    let first = Arc::new(PongHandler::default());
    let second = Arc::new(PongHandler::default());
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let router_a = router(bus.clone(), registry_with("a2", "m2", "s2").await, Some(first.clone()), &dir_a);
    let router_b = router(bus.clone(), registry_with("b2", "m2", "s2").await, Some(second.clone()), &dir_b);

    let (a, b) = tokio::join!(router_a.route(ping.clone()), router_b.route(ping));

    let outcomes = [a, b];
    let delivered = outcomes
        .iter()
        .filter(|o| matches!(o, RouteOutcome::Delivered { .. }))
        .count();
    let lost = outcomes
        .iter()
        .filter(|o| matches!(o, RouteOutcome::ClaimLost))
        .count();
    assert_eq!((delivered, lost), (1, 1));
    assert_eq!(
        first.calls.load(Ordering::SeqCst) + second.calls.load(Ordering::SeqCst),
        1,
        "exactly one handler invocation"
    );
    let replies = bus
        .messages()
        .into_iter()
        .filter(|m| m.message_type == MessageType::Response)
        .count();
    assert_eq!(replies, 1);
}

#[tokio::test]
async fn test_pull_message_goes_to_inbox_without_claim() {
    let bus = Arc::new(FakeBus::new());
    let message = pending_message("m1", "agent://m2/s2", "pull");
    bus.insert_message(message.clone());

    let handler = Arc::new(PongHandler::default());
    let dir = TempDir::new().unwrap();
    let router = router(bus.clone(), registry_with("a2", "m2", "s2").await, Some(handler.clone()), &dir);

    assert_eq!(
        router.route(message).await,
        RouteOutcome::Inboxed { target: "s2".to_string() }
    );
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(bus.count_calls("claim"), 0);

    let entries = Inbox::new(dir.path()).read("s2").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, "m1");
    assert_eq!(bus.message("m1").unwrap().status, MessageStatus::Pending);
}

#[tokio::test]
async fn test_broadcast_and_other_machine_are_ignored() {
    let bus = Arc::new(FakeBus::new());
    let dir = TempDir::new().unwrap();
    let router = router(
        bus.clone(),
        registry_with("a2", "m2", "s2").await,
        Some(Arc::new(PongHandler::default())),
        &dir,
    );

    let broadcast = pending_message("m1", "agent://m2/s2", "broadcast");
    assert_eq!(
        router.route(broadcast).await,
        RouteOutcome::Ignored(IgnoreReason::Broadcast)
    );

    let elsewhere = pending_message("m2", "agent://m9/s2", "push");
    assert_eq!(
        router.route(elsewhere).await,
        RouteOutcome::Ignored(IgnoreReason::OtherMachine)
    );

    let odd = pending_message("m3", "agent://m2/s2", "carrier-pigeon");
    assert!(matches!(
        router.route(odd).await,
        RouteOutcome::Ignored(IgnoreReason::UnknownMode(_))
    ));
    assert_eq!(bus.count_calls("claim"), 0);
}

#[tokio::test]
async fn test_unresolved_push_is_left_pending_and_retried() {
    let bus = Arc::new(FakeBus::new());
    let message = pending_message("m1", "agent://m2/s7", "push");
    bus.insert_message(message.clone());
    let dir = TempDir::new().unwrap();
    let registry = registry_with("a2", "m2", "s2").await;
    let router = router(bus.clone(), registry.clone(), Some(Arc::new(PongHandler::default())), &dir);

    assert_eq!(router.route(message.clone()).await, RouteOutcome::Unresolved);
    assert_eq!(bus.message("m1").unwrap().status, MessageStatus::Pending);

    // The session registers later; a replay is routed, not dropped as a duplicate.
    registry
        .insert(LocalAgent {
            agent: agent("a7", "m2", "s7"),
            session: LocalSession::new("s7"),
        })
        .await;
    assert!(matches!(
        router.route(message).await,
        RouteOutcome::Delivered { .. }
    ));
}

#[tokio::test]
async fn test_replay_is_duplicate() {
    let bus = Arc::new(FakeBus::new());
    let message = pending_message("m1", "agent://m2/s2", "push");
    bus.insert_message(message.clone());
    let handler = Arc::new(PongHandler::default());
    let dir = TempDir::new().unwrap();
    let router = router(bus.clone(), registry_with("a2", "m2", "s2").await, Some(handler.clone()), &dir);

    assert!(matches!(router.route(message.clone()).await, RouteOutcome::Delivered { .. }));
    assert_eq!(router.route(message).await, RouteOutcome::Duplicate);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_failure_sends_failure_ack() {
    let bus = Arc::new(FakeBus::new());
    let message = pending_message("m1", "agent://m2/s2", "push");
    bus.insert_message(message.clone());
    let dir = TempDir::new().unwrap();
    let router = router(bus.clone(), registry_with("a2", "m2", "s2").await, Some(Arc::new(FailingHandler)), &dir);

    let RouteOutcome::HandlerFailed { reply_id: Some(reply_id), error } = router.route(message).await
    else {
        panic!("expected handler failure");
    };
    assert!(error.contains("model unavailable"));

    let ack = bus.message(&reply_id).unwrap();
    assert_eq!(ack.metadata["failed"], true);
    assert_eq!(ack.message_type, MessageType::Response);
    assert_eq!(ack.thread_id.as_deref(), Some("t1"));
    // Attempted means delivered.
    assert_eq!(bus.message("m1").unwrap().status, MessageStatus::Delivered);
}

#[tokio::test(start_paused = true)]
async fn test_handler_timeout_is_a_failure() {
    let bus = Arc::new(FakeBus::new());
    let message = pending_message("m1", "agent://m2/s2", "push");
    bus.insert_message(message.clone());
    let dir = TempDir::new().unwrap();
    let router = router(bus.clone(), registry_with("a2", "m2", "s2").await, Some(Arc::new(SlowHandler)), &dir);

    let outcome = router.route(message).await;
    assert!(
        matches!(&outcome, RouteOutcome::HandlerFailed { error, .. } if error.contains("timed out")),
        "got {:?}",
        outcome
    );
    assert_eq!(bus.message("m1").unwrap().status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_no_handler_leaves_push_pending() {
    let bus = Arc::new(FakeBus::new());
    let message = pending_message("m1", "agent://m2/s2", "push");
    bus.insert_message(message.clone());
    let dir = TempDir::new().unwrap();
    let router = router(bus.clone(), registry_with("a2", "m2", "s2").await, None, &dir);

    assert_eq!(
        router.route(message).await,
        RouteOutcome::Ignored(IgnoreReason::NoHandler)
    );
    assert_eq!(bus.count_calls("claim"), 0);
}

#[tokio::test]
async fn test_stream_to_router_end_to_end() {
    let bus = Arc::new(FakeBus::new());
    let feed = bus.script_stream();

    let registry = registry_with("a2", "m2", "s2").await;
    let dir = TempDir::new().unwrap();
    let router = Arc::new(router(
        bus.clone(),
        registry,
        Some(Arc::new(PongHandler::default())),
        &dir,
    ));
    let stream = StreamConnection::new(bus.clone(), "m2", StreamConfig::default());
    let cancel = CancellationToken::new();
    let task = router.clone().spawn(stream.subscribe(), cancel.clone());
    stream.connect().await;

    // The sender posts, the bus fans it out on the stream.
    let sent = bus
        .send_message(&agentlink::cli::build_message(
            "agentA",
            "agent://m2/s2",
            MessageType::Command,
            None,
            "ping",
            None,
            Some("t-e2e".to_string()),
            None,
        ))
        .await
        .unwrap();
    feed.send(Ok(insert_record(1, &sent))).unwrap();

    let reply = wait_for_reply(
        bus.as_ref(),
        "t-e2e",
        &sent.id,
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await
    .unwrap()
    .expect("reply within timeout");
    assert_eq!(reply.content, "pong");
    assert_eq!(stream.health().last_event_id.as_deref(), Some("1"));

    stream.disconnect().await;
    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_slow_handler_does_not_hold_up_later_messages() {
    let bus = Arc::new(FakeBus::new());
    let mut held = pending_message("m1", "agent://m2/s2", "push");
    held.content = "hold".to_string();
    let mut quick = pending_message("m2", "agent://m2/s2", "push");
    quick.content = "quick".to_string();
    quick.thread_id = Some("t2".to_string());
    bus.insert_message(held.clone());
    bus.insert_message(quick.clone());

    let handler = Arc::new(GatedHandler::default());
    let dir = TempDir::new().unwrap();
    let router = Arc::new(router(
        bus.clone(),
        registry_with("a2", "m2", "s2").await,
        Some(handler.clone()),
        &dir,
    ));
    let (events, queue) = tokio::sync::mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = router.spawn(queue, cancel.clone());

    events.send(StreamEvent::Message(held)).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while bus.message("m1").unwrap().status != MessageStatus::Claimed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first message claimed and in its handler");

    events.send(StreamEvent::Message(quick)).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while bus.message("m2").unwrap().status != MessageStatus::Delivered {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second message delivered while the first is still handled");
    assert_eq!(bus.message("m1").unwrap().status, MessageStatus::Claimed);

    handler.gate.notify_one();
    tokio::time::timeout(Duration::from_secs(2), async {
        while bus.message("m1").unwrap().status != MessageStatus::Delivered {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first message delivered once released");

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unthreaded_message_and_reply_form_a_thread() {
    let bus = Arc::new(FakeBus::new());
    let mut ping = pending_message("m1", "agent://m2/s2", "push");
    ping.thread_id = None;
    bus.insert_message(ping.clone());

    let dir = TempDir::new().unwrap();
    let router = router(
        bus.clone(),
        registry_with("a2", "m2", "s2").await,
        Some(Arc::new(PongHandler::default())),
        &dir,
    );
    let RouteOutcome::Delivered { reply_id: Some(reply_id) } = router.route(ping).await else {
        panic!("expected delivery");
    };
    assert_eq!(bus.message(&reply_id).unwrap().thread_id.as_deref(), Some("m1"));

    let thread = fetch_thread(bus.as_ref(), "m1").await.unwrap();
    let ids: Vec<_> = thread.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m1", reply_id.as_str()]);

    // A plain thread does not look up a root.
    fetch_thread(bus.as_ref(), "t-missing").await.unwrap();
    assert_eq!(bus.count_calls("get_message"), 1);
}
