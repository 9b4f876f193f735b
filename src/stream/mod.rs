// Stream module: the bus push feed, from raw bytes to typed events.
//
//   parser      line records → decoded messages (key casing normalized here)
//   state       explicit connection state machine + backoff arithmetic
//   connection  the reconnecting read loop with keepalive probes

pub mod connection;
pub mod parser;
pub mod state;

pub use connection::{ConnectionStatus, StreamConnection, StreamEvent, StreamHealth};
pub use parser::{decode_record, normalize_keys, Decoded, RecordParser, StreamRecord};
pub use state::{Backoff, ConnectionInput, ConnectionState};
