//! Trap Core
//!
//! Wire-level primitives for the Trap transport-abstraction protocol.
//!
//! This crate provides:
//! - The protocol frame model ([`Message`], [`Operation`], [`Format`])
//! - Regular and seven-bit-safe frame encoding ([`codec`])
//! - Payload compression ([`compression`])
//! - Text key/value configuration ([`Configuration`])

pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod message;

pub use codec::{decode, encode, FrameDecoder};
pub use config::Configuration;
pub use error::{Error, Result};
pub use message::{Format, Message, ObjectPayload, Operation};

/// Size of every frame header, in both formats
pub const HEADER_SIZE: usize = 16;

/// Largest auth blob the 16-bit length field allows
pub const MAX_AUTH_DATA_LEN: usize = 65535;

/// Default fragment size for channels
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Message ids wrap back to 1 after this value
pub const DEFAULT_MAX_MESSAGE_ID: u32 = 0x800_0000;

/// Whether endpoints compress payloads unless told otherwise
pub const COMPRESSION_ENABLED_DEFAULT: bool = true;

/// Handshake key carrying the endpoint (session) id
pub const ENDPOINT_ID: &str = "trap.endpoint-id";

/// Endpoint id before any has been assigned
pub const ENDPOINT_ID_UNDEFINED: &str = "UNDEFINED";

/// Endpoint id a client uses until the server assigns one
pub const ENDPOINT_ID_CLIENT: &str = "NEW";

/// Handshake key carrying the per-client connection token
pub const CONNECTION_TOKEN: &str = "trap.connection-token";

/// Handshake key carrying the MD5 of the client configuration
pub const CONFIG_HASH: &str = "trap.confighash";

/// Maximum chunk size option
pub const OPTION_MAX_CHUNK_SIZE: &str = "trap.maxchunksize";

/// Compression option
pub const OPTION_ENABLE_COMPRESSION: &str = "trap.enablecompression";

/// Hostname the listener substitutes into client configuration
pub const OPTION_AUTO_HOSTNAME: &str = "trap.auto_hostname";

/// Window in which concurrent transports of one client join one session
pub const OPTION_CONCURRENT_CONNECTION_WINDOW: &str = "trap.concurrent-connection-window";

/// Keepalive interval option (seconds)
pub const OPTION_KEEPALIVE_INTERVAL: &str = "trap.keepalive.interval";

/// Keepalive expiry option (milliseconds)
pub const OPTION_KEEPALIVE_EXPIRY: &str = "trap.keepalive.expiry";

/// Reconnect deadline option (milliseconds)
pub const OPTION_RECONNECT_TIMEOUT: &str = "trap.reconnect-timeout";

/// Prefix of per-transport options
pub const TRANSPORT_PREFIX: &str = "trap.transport";
