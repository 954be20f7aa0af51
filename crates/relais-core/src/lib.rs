//! relais-core: Framing, protocol state machines and connection management
//! for the relais RPC client.
//!
//! This crate defines:
//! - The wire frame and its incremental decoder ([`Frame`], [`FrameDecoder`])
//! - API descriptions and transition trees ([`ApiDescription`], [`TransitionTree`], [`Next`])
//! - Per-session channel halves ([`Channel`], [`Rx`], [`Tx`], [`Recv`])
//! - The multiplexed connection ([`Connection`])
//! - Error types ([`Error`], [`ServiceError`], [`FrameError`])

#![forbid(unsafe_code)]

mod api;
mod channel;
mod connection;
mod error;
mod frame;

pub use api::*;
pub use channel::*;
pub use connection::*;
pub use error::*;
pub use frame::*;
