// Router module
// Routing of inbound bus messages to local handlers

mod dedup;
mod delivery;
mod handler;
mod inbox;
mod message_router;
mod resolve;

pub use dedup::SeenMessages;
pub use delivery::{DeliveryMode, UnknownDeliveryMode, DELIVERY_MODE_KEY};
pub use handler::{
    CommandHandler, HandlerContext, HandlerError, HandlerOutput, HandlerRequest, MessageHandler,
};
pub use inbox::{Inbox, InboxEntry};
pub use message_router::{IgnoreReason, MessageRouter, RouteOutcome};
pub use resolve::{resolve_target, MatchKind, Resolution};
