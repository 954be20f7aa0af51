//! Per-session receive and send handles.
//!
//! A [`Channel`] is what an invocation returns: the [`Rx`] half yields the
//! call's results in arrival order, the [`Tx`] half pushes follow-up frames
//! for streaming methods. Frame-to-event translation happens on the read
//! loop's side; these handles only consume and emit.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rmpv::Value;
use tokio::sync::mpsc;

use crate::{Connection, Error, Frame, ServiceError, TransitionTree};

/// One semantic outcome read off a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Recv {
    /// A payload chunk produced by the call.
    Chunk(Value),
    /// The remote service reported an application error for this call.
    Error(ServiceError),
    /// Normal end of the session's stream.
    Close,
}

/// Translates a named event and its payload into an outcome. Pluggable per
/// call site; [`streamed`] is the default.
pub type Protocol = fn(&str, Value) -> Result<Recv, Error>;

/// The default event transform: `"write"` carries a chunk, `"error"` a
/// service fault, `"close"` the end marker.
pub fn streamed(event: &str, payload: Value) -> Result<Recv, Error> {
    match event {
        "write" => Ok(Recv::Chunk(payload)),
        "error" => Ok(Recv::Error(ServiceError::from_payload(&payload))),
        "close" => Ok(Recv::Close),
        other => Err(Error::UnexpectedEvent {
            event: other.to_owned(),
        }),
    }
}

/// What the read loop hands to a session's consumer.
#[derive(Debug)]
pub(crate) enum RxItem {
    Event { event: String, payload: Value },
    Failed(Error),
}

/// The receive side of a session.
///
/// Events arrive in the exact order their frames did. Once the session has
/// ended (drained after its terminal transition, or failed), every further
/// `get` yields [`Recv::Close`].
#[derive(Debug)]
pub struct Rx {
    session: u64,
    items: mpsc::UnboundedReceiver<RxItem>,
    depth: Arc<AtomicUsize>,
    finished: bool,
}

impl Rx {
    pub(crate) fn new(
        session: u64,
        items: mpsc::UnboundedReceiver<RxItem>,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            session,
            items,
            depth,
            finished: false,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Wait for the next outcome, translating events with [`streamed`].
    ///
    /// Never hangs on a dead session: terminal state, teardown and
    /// connection closure all unblock the wait.
    pub async fn get(&mut self) -> Result<Recv, Error> {
        self.get_with(streamed).await
    }

    /// Like [`get`](Self::get), failing with [`Error::DeadlineExceeded`] if
    /// nothing arrives within `deadline`. A timed-out wait consumes no
    /// event; the next `get` still observes everything, in order.
    pub async fn get_timeout(&mut self, deadline: Duration) -> Result<Recv, Error> {
        self.get_with_timeout(streamed, deadline).await
    }

    /// Wait for the next outcome, translating events with `protocol`.
    pub async fn get_with(&mut self, protocol: Protocol) -> Result<Recv, Error> {
        if self.finished {
            return Ok(Recv::Close);
        }
        match self.items.recv().await {
            Some(RxItem::Event { event, payload }) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                protocol(&event, payload)
            }
            Some(RxItem::Failed(err)) => {
                self.finished = true;
                Err(err)
            }
            // Sender gone: the session was unregistered after its terminal
            // transition and the queue is drained.
            None => {
                self.finished = true;
                Ok(Recv::Close)
            }
        }
    }

    /// [`get_with`](Self::get_with) under a deadline.
    pub async fn get_with_timeout(
        &mut self,
        protocol: Protocol,
        deadline: Duration,
    ) -> Result<Recv, Error> {
        match tokio::time::timeout(deadline, self.get_with(protocol)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::DeadlineExceeded),
        }
    }
}

/// The send side of a session: writes verb frames on the shared connection.
///
/// Verbs are addressed by name in the session's tx tree; the tree is
/// consulted but never advanced by sends.
#[derive(Debug)]
pub struct Tx {
    session: u64,
    tree: Arc<TransitionTree>,
    conn: Connection,
}

impl Tx {
    pub(crate) fn new(session: u64, tree: Arc<TransitionTree>, conn: Connection) -> Self {
        Self {
            session,
            tree,
            conn,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Send a follow-up frame on this session.
    pub async fn send(&self, verb: &str, args: Vec<Value>) -> Result<(), Error> {
        let ty = self.tree.event_type(verb).ok_or_else(|| Error::UnknownVerb {
            verb: verb.to_owned(),
        })?;
        tracing::debug!(session = self.session, verb, ty, "sending verb frame");
        self.conn
            .write_frame(Frame::new(self.session, ty, Value::Array(args)))
            .await
    }
}

/// The paired handles for one call.
#[derive(Debug)]
pub struct Channel {
    pub rx: Rx,
    pub tx: Tx,
}

impl Channel {
    pub fn session(&self) -> u64 {
        self.rx.session()
    }

    /// Shorthand for `self.rx.get()`.
    pub async fn get(&mut self) -> Result<Recv, Error> {
        self.rx.get().await
    }

    /// Shorthand for `self.rx.get_timeout(deadline)`.
    pub async fn get_timeout(&mut self, deadline: Duration) -> Result<Recv, Error> {
        self.rx.get_timeout(deadline).await
    }

    /// Shorthand for `self.tx.send(verb, args)`.
    pub async fn send(&self, verb: &str, args: Vec<Value>) -> Result<(), Error> {
        self.tx.send(verb, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_rx() -> (mpsc::UnboundedSender<RxItem>, Rx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (tx, Rx::new(7, rx, depth))
    }

    fn event(name: &str, payload: Value) -> RxItem {
        RxItem::Event {
            event: name.to_owned(),
            payload,
        }
    }

    #[test]
    fn test_streamed_transform() {
        assert_eq!(
            streamed("write", Value::from(1)).unwrap(),
            Recv::Chunk(Value::from(1))
        );
        assert_eq!(
            streamed(
                "error",
                Value::Array(vec![Value::from(5), Value::from("oops")])
            )
            .unwrap(),
            Recv::Error(ServiceError::new(5, "oops"))
        );
        assert_eq!(streamed("close", Value::Nil).unwrap(), Recv::Close);
        assert!(matches!(
            streamed("drain", Value::Nil),
            Err(Error::UnexpectedEvent { .. })
        ));
    }

    #[tokio::test]
    async fn test_events_come_out_in_order() {
        let (tx, mut rx) = open_rx();
        for i in 0..3 {
            tx.send(event("write", Value::from(i))).unwrap();
        }

        for i in 0..3 {
            assert_eq!(rx.get().await.unwrap(), Recv::Chunk(Value::from(i)));
        }
    }

    #[tokio::test]
    async fn test_close_after_drain_and_forever_after() {
        let (tx, mut rx) = open_rx();
        tx.send(event("write", Value::from("last"))).unwrap();
        drop(tx);

        assert_eq!(rx.get().await.unwrap(), Recv::Chunk(Value::from("last")));
        assert_eq!(rx.get().await.unwrap(), Recv::Close);
        assert_eq!(rx.get().await.unwrap(), Recv::Close);
    }

    #[tokio::test]
    async fn test_failure_is_surfaced_once_then_close() {
        let (tx, mut rx) = open_rx();
        tx.send(RxItem::Failed(Error::InvalidMessageType { ty: 9 }))
            .unwrap();
        drop(tx);

        assert!(matches!(
            rx.get().await,
            Err(Error::InvalidMessageType { ty: 9 })
        ));
        assert_eq!(rx.get().await.unwrap(), Recv::Close);
    }

    #[tokio::test]
    async fn test_timed_out_get_consumes_nothing() {
        let (tx, mut rx) = open_rx();

        assert!(matches!(
            rx.get_timeout(Duration::from_millis(50)).await,
            Err(Error::DeadlineExceeded)
        ));

        tx.send(event("write", Value::from("late"))).unwrap();
        assert_eq!(rx.get().await.unwrap(), Recv::Chunk(Value::from("late")));
    }

    #[tokio::test]
    async fn test_custom_protocol_transform() {
        fn emit_only(event: &str, payload: Value) -> Result<Recv, Error> {
            match event {
                "emit" => Ok(Recv::Chunk(payload)),
                _ => Ok(Recv::Close),
            }
        }

        let (tx, mut rx) = open_rx();
        tx.send(event("emit", Value::from(3))).unwrap();
        tx.send(event("whatever", Value::Nil)).unwrap();

        assert_eq!(
            rx.get_with(emit_only).await.unwrap(),
            Recv::Chunk(Value::from(3))
        );
        assert_eq!(rx.get_with(emit_only).await.unwrap(), Recv::Close);
    }
}
