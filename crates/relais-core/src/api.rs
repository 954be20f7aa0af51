//! Transition trees and API descriptions.
//!
//! A session's protocol is a recursive tree: each node maps a message type
//! to the semantic event it carries plus the subtree governing the messages
//! after it. On the wire the subtree slot is overloaded (an empty map ends
//! the session, nil keeps the current subtree, and a non-empty map replaces
//! it), so the decoded form makes the three cases an explicit enum.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;

use crate::Error;

/// What becomes of a session's subtree after a transition fires.
#[derive(Debug, Clone)]
pub enum Next {
    /// No further messages are legal; the session is complete.
    Terminal,
    /// The current subtree stays in effect.
    Stay,
    /// The subtree is replaced for subsequent messages.
    Advance(Arc<TransitionTree>),
}

impl Next {
    fn from_value(value: &Value) -> Result<Self, Error> {
        match value {
            Value::Nil => Ok(Self::Stay),
            Value::Map(entries) if entries.is_empty() => Ok(Self::Terminal),
            Value::Map(_) => Ok(Self::Advance(Arc::new(TransitionTree::from_value(value)?))),
            other => Err(Error::InvalidDescriptor(format!(
                "transition subtree must be a map or nil, got {other}"
            ))),
        }
    }
}

/// One edge of the protocol state machine.
#[derive(Debug, Clone)]
pub struct Transition {
    pub event: String,
    pub next: Next,
}

/// Message type -> transition, for one state of a session. Keeps a name
/// index alongside so the send side can address verbs by name.
#[derive(Debug, Clone, Default)]
pub struct TransitionTree {
    entries: HashMap<u64, Transition>,
    by_event: HashMap<String, u64>,
}

impl TransitionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ty: u64, event: impl Into<String>, next: Next) {
        let event = event.into();
        self.by_event.insert(event.clone(), ty);
        self.entries.insert(ty, Transition { event, next });
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, ty: u64, event: impl Into<String>, next: Next) -> Self {
        self.insert(ty, event, next);
        self
    }

    /// The transition fired by an incoming message of type `ty`.
    pub fn transition(&self, ty: u64) -> Option<&Transition> {
        self.entries.get(&ty)
    }

    /// The message type to emit for the named event, if the tree has one.
    pub fn event_type(&self, event: &str) -> Option<u64> {
        self.by_event.get(event).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Parse a tree from its wire form: a map `{message_type: [event_name,
    /// subtree, ...]}`. Elements past the subtree exist in some peers'
    /// descriptions and carry nothing a client needs; they are ignored.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let entries = value
            .as_map()
            .ok_or_else(|| Error::InvalidDescriptor("transition tree is not a map".into()))?;
        let mut tree = Self::new();
        for (ty, edge) in entries {
            let ty = ty.as_u64().ok_or_else(|| {
                Error::InvalidDescriptor(format!("message type {ty} is not an unsigned integer"))
            })?;
            let edge = edge
                .as_array()
                .ok_or_else(|| Error::InvalidDescriptor("transition edge is not an array".into()))?;
            let [event, subtree, ..] = edge.as_slice() else {
                return Err(Error::InvalidDescriptor(format!(
                    "transition edge has {} elements, expected at least 2",
                    edge.len()
                )));
            };
            let event = event.as_str().ok_or_else(|| {
                Error::InvalidDescriptor("transition event name is not a string".into())
            })?;
            tree.insert(ty, event, Next::from_value(subtree)?);
        }
        Ok(tree)
    }
}

/// One callable method of a service: its wire id, name, and the transition
/// trees governing each side of a session.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub id: u64,
    pub name: String,
    pub tx: Arc<TransitionTree>,
    pub rx: Arc<TransitionTree>,
}

/// Everything a client needs to speak to one service: the method table
/// keyed by wire id, plus a name index for lookups at call sites.
#[derive(Debug, Clone, Default)]
pub struct ApiDescription {
    methods: HashMap<u64, MethodDescriptor>,
    by_name: HashMap<String, u64>,
}

impl ApiDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, descriptor: MethodDescriptor) {
        self.by_name.insert(descriptor.name.clone(), descriptor.id);
        self.methods.insert(descriptor.id, descriptor);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, id: u64, name: &str, tx: TransitionTree, rx: TransitionTree) -> Self {
        self.insert(MethodDescriptor {
            id,
            name: name.to_owned(),
            tx: Arc::new(tx),
            rx: Arc::new(rx),
        });
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.by_name.get(name).and_then(|id| self.methods.get(id))
    }

    pub fn method_by_id(&self, id: u64) -> Option<&MethodDescriptor> {
        self.methods.get(&id)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Parse a description from its wire form: a map
    /// `{method_id: [method_name, tx_tree, rx_tree]}`.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let entries = value
            .as_map()
            .ok_or_else(|| Error::InvalidDescriptor("API description is not a map".into()))?;
        let mut api = Self::new();
        for (id, entry) in entries {
            let id = id.as_u64().ok_or_else(|| {
                Error::InvalidDescriptor(format!("method id {id} is not an unsigned integer"))
            })?;
            let entry = entry
                .as_array()
                .ok_or_else(|| Error::InvalidDescriptor("method entry is not an array".into()))?;
            let [name, tx, rx] = entry.as_slice() else {
                return Err(Error::InvalidDescriptor(format!(
                    "method entry has {} elements, expected 3",
                    entry.len()
                )));
            };
            let name = name.as_str().ok_or_else(|| {
                Error::InvalidDescriptor("method name is not a string".into())
            })?;
            api.insert(MethodDescriptor {
                id,
                name: name.to_owned(),
                tx: Arc::new(TransitionTree::from_value(tx)?),
                rx: Arc::new(TransitionTree::from_value(rx)?),
            });
        }
        Ok(api)
    }
}
