//! relais: an asynchronous msgpack RPC client with locator-based service
//! discovery.
//!
//! # Quick Start
//!
//! Name a service; the locator tells the client where it lives and what it
//! speaks, and the connection is dialed on first use:
//!
//! ```ignore
//! use relais::prelude::*;
//!
//! let service = Service::new("echo").with_version(1);
//! let mut channel = service.call("ping", vec![Value::from("hello")]).await?;
//!
//! match channel.get().await? {
//!     Recv::Chunk(reply) => println!("reply: {reply}"),
//!     Recv::Error(e) => eprintln!("service failed: {e}"),
//!     Recv::Close => println!("stream closed"),
//! }
//! ```
//!
//! # Sessions
//!
//! One connection carries any number of concurrent calls. Each call opens a
//! session with its own id; frames tagged with that id reach only that
//! session, in arrival order. A [`Channel`] is the session's pair of
//! halves: [`Rx`] yields what the peer sends ([`Recv::Chunk`],
//! [`Recv::Error`], [`Recv::Close`]) and [`Tx`] pushes follow-up verbs such
//! as `write` and `close` for methods that accept them. Which message types
//! a session accepts at any moment is driven by the transition trees in the
//! service's [`ApiDescription`].
//!
//! # Resolution
//!
//! A [`Locator`] at a well-known endpoint (`localhost:10053` by default)
//! maps service names to `(endpoint, version, api)` triples. A [`Service`]
//! built [`with_version`](Service::with_version) refuses to connect when
//! the advertised version differs; version zero accepts anything. A
//! disconnected service re-resolves on its next call, so a redeployed
//! backend is picked up without rebuilding the client.
//!
//! # Errors
//!
//! Everything fallible returns [`Error`]. Application-level failures
//! reported by the peer arrive in-band as [`Recv::Error`] carrying a
//! [`ServiceError`]; transport-level ones ([`Error::ConnectionClosed`],
//! [`Error::DeadlineExceeded`]) come out of the call that hit them, and a
//! closed connection fails every session still waiting on it.

#![forbid(unsafe_code)]

mod service;

pub use relais_core::{
    // Default payload transform
    streamed,
    // API descriptions and transition trees
    ApiDescription,
    MethodDescriptor,
    Next,
    Transition,
    TransitionTree,
    // Per-session channel halves
    Channel,
    Protocol,
    Recv,
    Rx,
    Tx,
    // The multiplexed connection (for advanced use)
    Connection,
    // Raw framing (for advanced use)
    Frame,
    FrameDecoder,
    // Error types
    Error,
    FrameError,
    ServiceError,
};

pub use service::{
    locator_api, Locator, Service, ServiceDescriptor, LOCATOR_DEFAULT_HOST, LOCATOR_DEFAULT_PORT,
    LOCATOR_NAME,
};

// Re-export rmpv so callers build payload values against the same version.
pub use rmpv;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use relais::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Channel, Error, Locator, Recv, Rx, Service, ServiceError, Tx};

    pub use rmpv::Value;
}
