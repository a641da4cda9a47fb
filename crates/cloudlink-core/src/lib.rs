// cloudlink-core: self-healing link between a game server and its fleet backend.

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod metrics;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bus::EventBus;
pub use config::{
    ConnectionConfig, Endpoint, LinkSettings, PubSubEndpoint, SharedConfig, StreamEndpoint,
    TlsVerification,
};
pub use controller::ConnectionController;
pub use error::LinkError;
pub use event::{ChannelOperation, Event, LifecycleEvent, Observer, StreamStatusKind, Verdict};
pub use metrics::{MetricsSource, ResponseBuilder, ResponseOptions};
pub use scheduler::Scheduler;
pub use state::ConnectionState;
pub use storage::CloudStorage;
pub use transport::{PubSubTransport, StreamTransport, Transport, TransportContext, TransportKind};

// Wire types hosts need alongside the controller.
pub use cloudlink_api::{HeartbeatRequest, HeartbeatResponse, LogEvent, ServerState};
