pub mod archive;
pub mod commands;
pub mod cryptography;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod networking;
pub mod offer;
pub mod pipeline;
pub mod relay;
pub mod transit;
pub mod wormhole;

pub use error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const CHUNK_SIZE: usize = 4096;
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

pub const CONNECT_TIMEOUT_SECS: u64 = 10;
