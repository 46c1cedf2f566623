//! # Commands Module
//!
//! Command handlers for the portal binary.
//!
//! ## `relay`
//! Runs a transit relay server:
//! - Accepts TCP connections from senders and receivers
//! - Pairs two connections that present the same relay token with
//!   different side identifiers
//! - Answers `ok` to both once paired
//! - Shuttles the encrypted record stream between them until either
//!   side closes
//!
//! Sending and receiving need an established wormhole mailbox connection
//! and are driven through the library API rather than a subcommand.

pub mod relay;
