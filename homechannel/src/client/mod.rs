//! Client side of HomeChannel
//!
//! ```text
//! Connection ──► SignalingConnector (WebSocket) ──► coordinator
//!     │
//!     ├─ ConnectionStateMachine   Disconnected ─► Connecting ─► Connected
//!     ├─ EventBus                 state / connected / disconnected / error
//!     └─ ChannelMultiplexer       control + per-app channels over PeerTransport
//! ```

pub mod connection;
pub mod events;
pub mod mux;
pub mod state;

pub use connection::{ConnectError, ConnectOptions, Connection};
pub use events::{ConnectionEvent, EventBus, EventKind, SubscriptionId};
pub use mux::{AppChannel, ChannelMultiplexer, MuxConfig, MuxError, PresentationSurface};
pub use state::{ConnectionState, ConnectionStateMachine, StateTransitionError};
