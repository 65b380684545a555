//! HomeChannel
//!
//! Reach a service on a private network from anywhere, without opening
//! inbound ports. A public coordinator relays a short signaling exchange
//! between a client and an agent; after that the two talk over a direct
//! peer transport and the coordinator is out of the path.
//!
//! ```text
//!   Client ──ws──▸ Coordinator ◂──udp── Agent
//!     │                                   │
//!     └──────── direct peer transport ────┘
//! ```

pub mod agent;
pub mod apps;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod rtc;
pub mod signaling;

pub use error::ErrorKind;
