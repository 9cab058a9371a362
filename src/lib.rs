//! IPC Mailbox Server
//!
//! Message router for cooperating database processes. Peers connect over a
//! WebSocket and are partitioned into broadcast groups by database name;
//! peers in the same group exchange coordination messages (lock requests,
//! allocation notices, subscription events, change notifications) through
//! the mailbox, while peers in different groups never see each other.
//!
//! # Protocol
//!
//! 1. A peer upgrades at `/{group}/connect?id=...&v=...` and receives a
//!    `welcome:` frame carrying the payload budget
//! 2. Frames without a `to:` prefix are broadcast to every other peer in
//!    the group; `to:<peer>;<body>` delivers to a single peer as `msg:<body>`
//! 3. Bodies above the payload budget are spilled to a short-lived slot and
//!    forwarded as `get:<slotId>`, fetched back over HTTP `/{group}/receive`
//! 4. HTTP `/{group}/send` injects frames from peers whose payload exceeds
//!    what the WebSocket accepts; `/{group}/clients` lists the live group

pub mod config;
pub mod error;
pub mod frame;
pub mod listener;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod spill;

pub use config::{ServerConfig, TlsOptions};
pub use error::ServerError;
pub use registry::GroupRegistry;
pub use router::Router;
pub use server::MailboxServer;
pub use session::PeerSession;
pub use spill::SpillStore;

/// Default maximum inbound WebSocket frame size in bytes
pub const DEFAULT_MAX_PAYLOAD: usize = 16384;

/// Minimum accepted peer id length
pub const MIN_PEER_ID_LEN: usize = 5;

/// Supported client IPC protocol major version
pub const SUPPORTED_MAJOR_VERSION: u64 = 1;

/// Seconds a spilled payload stays retrievable
pub const SLOT_TTL_SECS: u64 = 60;

/// Queued outbound bytes at which a send reports back-pressure
pub const BACKPRESSURE_WATERMARK_BYTES: usize = 64 * 1024;

/// Queued outbound bytes at which the session is closed (1 MiB)
pub const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Upper bound on sideband HTTP request bodies (8 MiB)
pub const MAX_SIDEBAND_BODY_BYTES: usize = 8 * 1024 * 1024;
