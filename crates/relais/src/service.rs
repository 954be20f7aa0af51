//! Locator-backed services.
//!
//! Every service except the locator itself is found at runtime: the client
//! asks the locator for the service's endpoint, version and API description,
//! checks the version against what the caller asked for, and only then
//! dials. The locator's own endpoint and API are fixed up front.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::Mutex as AsyncMutex;

use relais_core::{ApiDescription, Channel, Connection, Error, Next, Recv, TransitionTree};

/// Name the locator answers to in logs and error messages.
pub const LOCATOR_NAME: &str = "locator";

/// Endpoint a freshly built [`Locator`] dials.
pub const LOCATOR_DEFAULT_HOST: &str = "localhost";
pub const LOCATOR_DEFAULT_PORT: u16 = 10053;

/// The locator's API: a single `resolve` method whose response is one
/// `write`, `error` or `close` frame, each of which ends the session.
pub fn locator_api() -> Arc<ApiDescription> {
    let rx = TransitionTree::new()
        .with(0, "write", Next::Terminal)
        .with(1, "error", Next::Terminal)
        .with(2, "close", Next::Terminal);
    Arc::new(ApiDescription::new().with(0, "resolve", TransitionTree::new(), rx))
}

/// Client for the locator service.
#[derive(Clone, Debug)]
pub struct Locator {
    conn: Connection,
}

impl Locator {
    /// A locator at the default endpoint, `localhost:10053`.
    pub fn new() -> Self {
        Self::with_endpoint(LOCATOR_DEFAULT_HOST, LOCATOR_DEFAULT_PORT)
    }

    pub fn with_endpoint(host: impl Into<String>, port: u16) -> Self {
        Self {
            conn: Connection::new(LOCATOR_NAME, host, port, locator_api()),
        }
    }

    /// Ask the locator where `name` lives and what it speaks.
    pub async fn resolve(&self, name: &str) -> Result<ServiceDescriptor, Error> {
        tracing::debug!(service = name, "resolving");
        let mut channel = self.conn.invoke("resolve", vec![Value::from(name)]).await?;
        match channel.get().await? {
            Recv::Chunk(value) => ServiceDescriptor::from_value(&value),
            Recv::Error(e) => Err(Error::Service(e)),
            Recv::Close => Err(Error::InvalidDescriptor(
                "resolution ended without a result".to_owned(),
            )),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }
}

impl Default for Locator {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a service lives and what it speaks.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub host: String,
    pub port: u16,
    pub version: u64,
    pub api: Arc<ApiDescription>,
}

impl ServiceDescriptor {
    /// Parses a resolution result, `[[host, port], version, api]`. Trailing
    /// endpoint elements are ignored.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let items = value.as_array().ok_or_else(|| {
            Error::InvalidDescriptor("resolution result is not an array".to_owned())
        })?;
        let [endpoint, version, api] = items.as_slice() else {
            return Err(Error::InvalidDescriptor(format!(
                "expected [endpoint, version, api], got {} elements",
                items.len()
            )));
        };

        let endpoint = endpoint
            .as_array()
            .ok_or_else(|| Error::InvalidDescriptor("endpoint is not an array".to_owned()))?;
        let (Some(host), Some(port)) = (
            endpoint.first().and_then(Value::as_str),
            endpoint.get(1).and_then(Value::as_u64),
        ) else {
            return Err(Error::InvalidDescriptor(
                "endpoint is not a [host, port] pair".to_owned(),
            ));
        };
        let port = u16::try_from(port)
            .map_err(|_| Error::InvalidDescriptor(format!("port {port} out of range")))?;

        let version = version.as_u64().ok_or_else(|| {
            Error::InvalidDescriptor("version is not an unsigned integer".to_owned())
        })?;

        Ok(Self {
            host: host.to_owned(),
            port,
            version,
            api: Arc::new(ApiDescription::from_value(api)?),
        })
    }
}

/// A named service reached through the locator.
///
/// The service resolves lazily: nothing touches the network until the first
/// [`call`](Self::call) (or an explicit [`connect`](Self::connect)), and a
/// disconnected service re-resolves on its next use, picking up whatever
/// endpoint the locator currently advertises.
pub struct Service {
    name: String,
    version: u64,
    locator: Locator,
    conn: Connection,
    /// Serializes resolution so concurrent first callers resolve once.
    resolve_gate: AsyncMutex<()>,
    resolved: Mutex<Option<u64>>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// A service found through a locator at the default endpoint, accepting
    /// whatever version the locator advertises.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            conn: Connection::unresolved(name.clone()),
            name,
            version: 0,
            locator: Locator::new(),
            resolve_gate: AsyncMutex::new(()),
            resolved: Mutex::new(None),
        }
    }

    /// Requires this exact version at resolution; zero accepts anything.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_locator(mut self, locator: Locator) -> Self {
        self.locator = locator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Version reported by the most recent successful resolution.
    pub fn resolved_version(&self) -> Option<u64> {
        *self.resolved.lock()
    }

    /// Resolve (if necessary) and connect. Idempotent; concurrent callers
    /// share one resolution and one dial.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.conn.is_connected() {
            return Ok(());
        }
        let _gate = self.resolve_gate.lock().await;
        if self.conn.is_connected() {
            return Ok(());
        }

        let descriptor = self.locator.resolve(&self.name).await?;
        if self.version != 0 && descriptor.version != self.version {
            return Err(Error::VersionMismatch {
                service: self.name.clone(),
                requested: self.version,
                resolved: descriptor.version,
            });
        }
        tracing::debug!(
            service = %self.name,
            host = %descriptor.host,
            port = descriptor.port,
            version = descriptor.version,
            "resolved"
        );
        self.conn
            .set_target(descriptor.host, descriptor.port, descriptor.api);
        *self.resolved.lock() = Some(descriptor.version);
        self.conn.connect().await
    }

    /// Invoke a method by name, connecting first if necessary.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Channel, Error> {
        self.connect().await?;
        self.conn.invoke(method, args).await
    }

    /// Close the connection, failing outstanding sessions with
    /// [`Error::ConnectionClosed`]. The next call resolves afresh.
    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(Value, Value)>) -> Value {
        Value::Map(entries)
    }

    fn resolution_value() -> Value {
        let rx = map(vec![
            (
                Value::from(0),
                Value::Array(vec![Value::from("write"), Value::Nil]),
            ),
            (
                Value::from(2),
                Value::Array(vec![Value::from("close"), map(vec![])]),
            ),
        ]);
        let api = map(vec![(
            Value::from(0),
            Value::Array(vec![Value::from("ping"), map(vec![]), rx]),
        )]);
        Value::Array(vec![
            Value::Array(vec![Value::from("node-7"), Value::from(20054)]),
            Value::from(3),
            api,
        ])
    }

    #[test]
    fn test_locator_api_has_the_fixed_resolve_method() {
        let api = locator_api();
        let resolve = api.method("resolve").unwrap();
        assert_eq!(resolve.id, 0);
        assert!(resolve.tx.is_empty());
        for (ty, event) in [(0, "write"), (1, "error"), (2, "close")] {
            let transition = resolve.rx.transition(ty).unwrap();
            assert_eq!(transition.event, event);
            assert!(matches!(transition.next, Next::Terminal));
        }
    }

    #[test]
    fn test_descriptor_parses_a_resolution_result() {
        let descriptor = ServiceDescriptor::from_value(&resolution_value()).unwrap();
        assert_eq!(descriptor.host, "node-7");
        assert_eq!(descriptor.port, 20054);
        assert_eq!(descriptor.version, 3);
        assert_eq!(descriptor.api.method("ping").unwrap().id, 0);
    }

    #[test]
    fn test_descriptor_ignores_trailing_endpoint_elements() {
        let mut value = resolution_value();
        if let Value::Array(items) = &mut value {
            if let Value::Array(endpoint) = &mut items[0] {
                endpoint.push(Value::from("ipv6"));
            }
        }
        let descriptor = ServiceDescriptor::from_value(&value).unwrap();
        assert_eq!(descriptor.host, "node-7");
    }

    #[test]
    fn test_descriptor_rejects_malformed_results() {
        let bad = [
            Value::from("not an array"),
            Value::Array(vec![Value::from(1), Value::from(2)]),
            // endpoint is not [host, port]
            Value::Array(vec![
                Value::Array(vec![Value::from(10053)]),
                Value::from(1),
                Value::Map(vec![]),
            ]),
            // port out of range
            Value::Array(vec![
                Value::Array(vec![Value::from("host"), Value::from(70000)]),
                Value::from(1),
                Value::Map(vec![]),
            ]),
            // version is not an unsigned integer
            Value::Array(vec![
                Value::Array(vec![Value::from("host"), Value::from(10053)]),
                Value::from("one"),
                Value::Map(vec![]),
            ]),
        ];
        for value in &bad {
            assert!(
                matches!(
                    ServiceDescriptor::from_value(value),
                    Err(Error::InvalidDescriptor(_))
                ),
                "accepted {value}"
            );
        }
    }

    #[test]
    fn test_service_starts_unresolved() {
        let service = Service::new("echo").with_version(1);
        assert_eq!(service.name(), "echo");
        assert!(!service.is_connected());
        assert_eq!(service.resolved_version(), None);
    }
}
