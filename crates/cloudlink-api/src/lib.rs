// cloudlink-api: wire layer for the EchoCloud game-server link

pub mod backend;
pub mod error;
pub mod protocol;
pub mod pubsub;
pub mod transport;
pub mod websocket;

pub use backend::{BackendClient, StorageAction};
pub use error::Error;
pub use protocol::{
    HeartbeatRequest, HeartbeatResponse, Inbound, LogEvent, ResponseKind, ServerMessage,
    ServerState,
};
pub use transport::{TlsMode, TransportConfig};
