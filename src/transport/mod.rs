//! Transport to the remote detection service.
//!
//! `protocol` defines the JSON messages, `channel` the reconnecting state
//! machine, and `ws` / `loopback` the concrete connectors.

pub mod channel;
pub mod loopback;
pub mod protocol;
pub mod ws;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelState, ChannelStats, Connection, ConnectionEvent,
    Connector, DetectionChannel, ReconnectPolicy, ScheduledRetry, SendOutcome,
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_DELAY,
};
pub use loopback::{LoopbackConnection, LoopbackConnector, LoopbackEndpoint};
pub use protocol::{
    parse_inbound, DetectionResult, InboundMessage, OutboundMessage, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
pub use ws::{WsConnection, WsConnector};
