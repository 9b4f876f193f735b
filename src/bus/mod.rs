// Bus module: typed access to the directory/message-bus service.
//
// Everything that talks to the bus goes through the `BusApi` trait so the
// daemon's components can share one client and tests can swap in a fake.

pub mod address;
pub mod client;
pub mod error;
pub mod presence;
pub mod thread;
pub mod types;

pub use address::TargetAddress;
pub use client::BusClient;
pub use error::{BusError, BusResult};
pub use presence::Presence;
pub use types::{
    Agent, AgentQuery, Channel, ClaimOutcome, Message, MessageQuery, MessageStatus, MessageType,
    NewChannel, NewMessage, NewPaste, Paste, RegisterAgent, TargetType,
};

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Raw bytes of the push event stream, as they arrive.
pub type EventByteStream = BoxStream<'static, BusResult<Vec<u8>>>;

/// Operations the daemon consumes from the bus.
#[async_trait]
pub trait BusApi: Send + Sync {
    /// `POST /agents`
    async fn register_agent(&self, request: &RegisterAgent) -> BusResult<Agent>;

    /// `PATCH /agents/{id}/heartbeat`
    async fn heartbeat(&self, agent_id: &str) -> BusResult<Agent>;

    /// `DELETE /agents/{id}`
    async fn deregister_agent(&self, agent_id: &str) -> BusResult<()>;

    /// `GET /agents`
    async fn list_agents(&self, query: &AgentQuery) -> BusResult<Vec<Agent>>;

    /// `POST /messages`
    async fn send_message(&self, message: &NewMessage) -> BusResult<Message>;

    /// `PATCH /messages/{id}/claim`. The one mutual-exclusion point.
    async fn claim_message(&self, message_id: &str, agent_id: &str) -> BusResult<ClaimOutcome>;

    /// `PATCH /messages/{id}/status`
    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> BusResult<Message>;

    /// `GET /messages/{id}`
    async fn get_message(&self, message_id: &str) -> BusResult<Message>;

    /// `GET /messages`
    async fn list_messages(&self, query: &MessageQuery) -> BusResult<Vec<Message>>;

    async fn create_channel(&self, channel: &NewChannel) -> BusResult<Channel>;

    async fn list_channels(&self) -> BusResult<Vec<Channel>>;

    async fn get_channel(&self, channel_id: &str) -> BusResult<Channel>;

    async fn delete_channel(&self, channel_id: &str) -> BusResult<()>;

    async fn create_paste(&self, paste: &NewPaste) -> BusResult<Paste>;

    async fn get_paste(&self, paste_id: &str) -> BusResult<Paste>;

    /// Open the push event stream for `machine_id`, resuming after `cursor`
    /// when one is given.
    async fn open_stream(&self, machine_id: &str, cursor: Option<&str>)
        -> BusResult<EventByteStream>;

    /// Cheap read used to check the bus is reachable.
    async fn probe(&self, machine_id: &str) -> BusResult<()> {
        let query = AgentQuery {
            machine_id: Some(machine_id.to_string()),
            limit: Some(1),
            ..Default::default()
        };
        self.list_agents(&query).await.map(|_| ())
    }
}
