//! Connection management: one duplex stream, many sessions.
//!
//! A [`Connection`] owns at most one live stream. The write half serves
//! every session's [`Tx`]; a single reader task is the sole consumer of the
//! read half, feeding the frame decoder and routing complete frames to the
//! session table. No other code touches the read half, so sessions can
//! never compete for incoming bytes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::RxItem;
use crate::{ApiDescription, Channel, Error, Frame, FrameDecoder, Next, Rx, TransitionTree, Tx};

const DEFAULT_SESSION_BACKLOG: usize = 8192;

/// Per-session cap on buffered events. A consumer that falls this far
/// behind fails its own session rather than stalling the shared read loop,
/// which would head-of-line-block every other session on the connection.
fn session_backlog() -> usize {
    std::env::var("RELAIS_SESSION_BACKLOG")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_SESSION_BACKLOG)
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

/// Read-loop side of one session: the current subtree and the channel
/// feeding the consumer's [`Rx`].
struct SessionGate {
    tree: Arc<TransitionTree>,
    items: mpsc::UnboundedSender<RxItem>,
    depth: Arc<AtomicUsize>,
    backlog: usize,
}

/// Outcome of pushing one frame into a session.
enum Push {
    /// The session remains open.
    Open,
    /// The terminal transition fired; unregister the session.
    Done,
    /// The frame was illegal or the consumer is too far behind; unregister.
    Failed(String),
}

impl SessionGate {
    fn push(&mut self, ty: u64, payload: Value) -> Push {
        let Some(transition) = self.tree.transition(ty) else {
            return self.fail(Error::InvalidMessageType { ty });
        };
        let event = transition.event.clone();
        let next = transition.next.clone();

        if self.depth.fetch_add(1, Ordering::Relaxed) >= self.backlog {
            return self.fail(Error::BacklogExceeded {
                limit: self.backlog,
            });
        }
        let _ = self.items.send(RxItem::Event { event, payload });

        match next {
            Next::Terminal => Push::Done,
            Next::Stay => Push::Open,
            Next::Advance(subtree) => {
                self.tree = subtree;
                Push::Open
            }
        }
    }

    fn fail(&self, err: Error) -> Push {
        let reason = err.to_string();
        let _ = self.items.send(RxItem::Failed(err));
        Push::Failed(reason)
    }
}

/// Endpoint and API a connection dials. Swapped in whole, so a caller never
/// observes an endpoint from one resolution paired with the API of another.
struct Target {
    host: String,
    port: u16,
    api: Arc<ApiDescription>,
}

struct Inner {
    /// Service name, carried on every log event from this connection.
    name: String,
    target: Mutex<Option<Target>>,
    /// Serializes the connected check against the dial, so concurrent
    /// callers produce at most one stream.
    connect_gate: AsyncMutex<()>,
    /// Write half of the live stream. Frames are pre-encoded and written
    /// whole under the inner lock, so sessions never interleave mid-frame.
    writer: Mutex<Option<Arc<AsyncMutex<BoxedWriter>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    sessions: Mutex<HashMap<u64, SessionGate>>,
    next_session: AtomicU64,
}

impl Inner {
    fn register(&self, session: u64, tree: Arc<TransitionTree>) -> Rx {
        let (items, consumer) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let gate = SessionGate {
            tree,
            items,
            depth: depth.clone(),
            backlog: session_backlog(),
        };
        self.sessions.lock().insert(session, gate);
        Rx::new(session, consumer, depth)
    }

    fn unregister(&self, session: u64) {
        self.sessions.lock().remove(&session);
    }

    /// Hand one decoded frame to its session. Unknown ids are dropped, not
    /// fatal: the session may have completed while the frame was in flight.
    fn route(&self, frame: Frame) {
        let mut sessions = self.sessions.lock();
        let Some(gate) = sessions.get_mut(&frame.session) else {
            tracing::warn!(
                service = %self.name,
                session = frame.session,
                ty = frame.ty,
                "dropping frame for unknown session"
            );
            return;
        };
        match gate.push(frame.ty, frame.payload) {
            Push::Open => {}
            Push::Done => {
                tracing::debug!(
                    service = %self.name,
                    session = frame.session,
                    "session reached terminal state"
                );
                sessions.remove(&frame.session);
            }
            Push::Failed(reason) => {
                tracing::warn!(
                    service = %self.name,
                    session = frame.session,
                    reason = %reason,
                    "session torn down"
                );
                sessions.remove(&frame.session);
            }
        }
    }

    /// Drop the stream and fail every outstanding session. Idempotent;
    /// later calls find nothing to do.
    fn teardown(&self) {
        *self.writer.lock() = None;
        let drained: Vec<(u64, SessionGate)> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().collect()
        };
        for (session, gate) in drained {
            tracing::debug!(
                service = %self.name,
                session,
                "failing pending session: connection closed"
            );
            let _ = gate.items.send(RxItem::Failed(Error::ConnectionClosed));
        }
    }
}

/// Reads until the stream closes. Decode faults are absorbed: the decoder
/// has already resynced, and no session can be blamed for bytes that never
/// became a frame.
async fn run_read_loop(inner: Arc<Inner>, mut reader: BoxedReader) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(service = %inner.name, "peer closed the stream");
                break;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(frame)) => {
                            tracing::debug!(
                                service = %inner.name,
                                session = frame.session,
                                ty = frame.ty,
                                "frame received"
                            );
                            inner.route(frame);
                        }
                        Ok(None) => break,
                        Err(fault) => {
                            tracing::warn!(service = %inner.name, %fault, "skipping bad frame");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(service = %inner.name, error = %e, "read failed");
                break;
            }
        }
    }
    inner.teardown();
}

/// A client connection: one duplex stream shared by any number of sessions.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.inner.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// A connection that already knows its endpoint and API. Bootstrap
    /// services use this; dynamically resolved ones start
    /// [`unresolved`](Self::unresolved).
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        api: Arc<ApiDescription>,
    ) -> Self {
        let conn = Self::unresolved(name);
        conn.set_target(host, port, api);
        conn
    }

    /// A connection with no endpoint yet; resolution supplies one through
    /// [`set_target`](Self::set_target).
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                target: Mutex::new(None),
                connect_gate: AsyncMutex::new(()),
                writer: Mutex::new(None),
                reader_task: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_connected(&self) -> bool {
        self.inner.writer.lock().is_some()
    }

    /// Adopt an endpoint and API description in one step.
    pub fn set_target(&self, host: impl Into<String>, port: u16, api: Arc<ApiDescription>) {
        *self.inner.target.lock() = Some(Target {
            host: host.into(),
            port,
            api,
        });
    }

    /// The API description currently in effect, if any.
    pub fn api(&self) -> Option<Arc<ApiDescription>> {
        self.inner.target.lock().as_ref().map(|t| t.api.clone())
    }

    /// Ensure a live stream, dialing the target if necessary. Idempotent;
    /// concurrent callers dial at most once.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        let _gate = self.inner.connect_gate.lock().await;
        if self.is_connected() {
            // Another caller connected while we queued on the gate.
            return Ok(());
        }
        let (host, port) = {
            let target = self.inner.target.lock();
            let Some(target) = target.as_ref() else {
                return Err(Error::Unresolved {
                    service: self.inner.name.clone(),
                });
            };
            (target.host.clone(), target.port)
        };
        tracing::debug!(service = %self.inner.name, host = %host, port, "connecting");
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        self.install(stream);
        tracing::debug!(service = %self.inner.name, "connection established");
        Ok(())
    }

    /// Drive this connection over a caller-supplied duplex stream instead
    /// of dialing the target.
    pub async fn attach<S>(&self, stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let _gate = self.inner.connect_gate.lock().await;
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        self.install(stream);
        Ok(())
    }

    fn install<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        *self.inner.writer.lock() = Some(Arc::new(AsyncMutex::new(Box::new(writer))));
        let task = tokio::spawn(run_read_loop(self.inner.clone(), Box::new(reader)));
        *self.inner.reader_task.lock() = Some(task);
    }

    /// Close the stream and fail outstanding sessions with
    /// [`Error::ConnectionClosed`]. The connection may be reused; the next
    /// `connect` dials again.
    pub async fn disconnect(&self) {
        let _gate = self.inner.connect_gate.lock().await;
        let task = self.inner.reader_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        let writer = self.inner.writer.lock().take();
        if let Some(writer) = writer {
            let mut writer = writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.inner.teardown();
        tracing::debug!(service = %self.inner.name, "disconnected");
    }

    /// Start a call: allocate a session, register its receive side, then
    /// write the invocation frame `[session, method_id, args]`.
    ///
    /// Registration happens before the write so a response racing back
    /// cannot find the session missing. If the write fails the registration
    /// is rolled back; an unknown method writes nothing at all.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Channel, Error> {
        self.connect().await?;

        let (method_id, tx_tree, rx_tree) = {
            let target = self.inner.target.lock();
            let Some(target) = target.as_ref() else {
                return Err(Error::Unresolved {
                    service: self.inner.name.clone(),
                });
            };
            let Some(descriptor) = target.api.method(method) else {
                return Err(Error::UnknownMethod {
                    method: method.to_owned(),
                });
            };
            (descriptor.id, descriptor.tx.clone(), descriptor.rx.clone())
        };

        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let rx = self.inner.register(session, rx_tree);
        tracing::debug!(
            service = %self.inner.name,
            session,
            method,
            method_id,
            "invoking"
        );

        if let Err(e) = self
            .write_frame(Frame::new(session, method_id, Value::Array(args)))
            .await
        {
            self.inner.unregister(session);
            return Err(e);
        }

        let tx = Tx::new(session, tx_tree, self.clone());
        Ok(Channel { rx, tx })
    }

    /// Encode and write one frame; the bytes go out in a single locked
    /// write.
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), Error> {
        let writer = self
            .inner
            .writer
            .lock()
            .as_ref()
            .cloned()
            .ok_or(Error::ConnectionClosed)?;
        let bytes = frame.into_bytes()?;
        let mut writer = writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Sessions currently awaiting frames (diagnostics).
    pub fn open_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}
