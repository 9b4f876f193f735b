// Thread helpers
//
// A thread is a query axis over messages sharing a threadId. A reply is any
// later message in the same thread with messageType=response.

use std::time::Duration;

/// Metadata key on a reply naming the message it answers.
pub const IN_REPLY_TO_KEY: &str = "inReplyTo";

use super::error::BusResult;
use super::types::{Message, MessageQuery, MessageType};
use super::BusApi;

/// Sort a thread into creation order. Messages without a timestamp keep
/// their relative position after those that have one.
pub fn order_thread(messages: &mut [Message]) {
    messages.sort_by(|a, b| match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// First response that comes after `after_id` in an ordered thread.
pub fn find_reply<'a>(thread: &'a [Message], after_id: &str) -> Option<&'a Message> {
    let start = thread.iter().position(|m| m.id == after_id)?;
    thread[start + 1..]
        .iter()
        .find(|m| m.message_type == MessageType::Response)
}

/// Fetch a thread in creation order.
///
/// A message sent without a thread id starts a thread keyed by its own id,
/// and replies carry that id as their thread. The bus only indexes the
/// replies, so the unthreaded first message is fetched on its own.
pub async fn fetch_thread(bus: &dyn BusApi, thread_id: &str) -> BusResult<Vec<Message>> {
    let mut messages = bus.list_messages(&MessageQuery::thread(thread_id)).await?;

    let has_root = messages.iter().any(|m| m.id == thread_id);
    let replies_to_root = messages
        .iter()
        .any(|m| m.metadata.get(IN_REPLY_TO_KEY).and_then(|v| v.as_str()) == Some(thread_id));
    if !has_root && replies_to_root {
        match bus.get_message(thread_id).await {
            Ok(root) if root.thread_id.is_none() => messages.push(root),
            Ok(_) => {}
            Err(e) if e.status() == Some(404) => {}
            Err(e) => return Err(e),
        }
    }

    order_thread(&mut messages);
    Ok(messages)
}

/// Poll a thread until a reply to `after_id` shows up or `timeout` elapses.
pub async fn wait_for_reply(
    bus: &dyn BusApi,
    thread_id: &str,
    after_id: &str,
    timeout: Duration,
    poll: Duration,
) -> BusResult<Option<Message>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let thread = fetch_thread(bus, thread_id).await?;
        if let Some(reply) = find_reply(&thread, after_id) {
            return Ok(Some(reply.clone()));
        }
        if tokio::time::Instant::now() + poll > deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll).await;
    }
}
