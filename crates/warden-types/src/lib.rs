//! warden-types: value types shared by the event, cron and host crates.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

// ──────────────────── Identifiers ────────────────────

/// Numeric identifier of a registered event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypeId(pub u32);

impl fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an actor (player, server, bot) on the game server.
///
/// Events only carry the identity; the actor itself is looked up through an
/// [`ActorDirectory`] when a handler needs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl From<&str> for ActorId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActorId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves actor identities to actors on demand.
pub trait ActorDirectory {
    type Actor;

    fn resolve(&self, id: &ActorId) -> Option<Self::Actor>;
}

impl<A: Clone> ActorDirectory for HashMap<ActorId, A> {
    type Actor = A;

    fn resolve(&self, id: &ActorId) -> Option<A> {
        self.get(id).cloned()
    }
}

// ──────────────────── Event ────────────────────

/// A typed occurrence detected on the game server.
///
/// Built once by the collaborator that detected it and never mutated after
/// being handed to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since the unix epoch.
    timestamp: i64,
    event_type: EventTypeId,
    /// Opaque payload, interpreted by the handlers of this event type.
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<ActorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<ActorId>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: EventTypeId, data: serde_json::Value) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            event_type,
            data,
            source: None,
            target: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<ActorId>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<ActorId>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Override the timestamp, e.g. when replaying a server log.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn event_type(&self) -> EventTypeId {
        self.event_type
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn source(&self) -> Option<&ActorId> {
        self.source.as_ref()
    }

    pub fn target(&self) -> Option<&ActorId> {
        self.target.as_ref()
    }

    /// Look up the source actor, if it is still known to `directory`.
    pub fn source_in<D: ActorDirectory>(&self, directory: &D) -> Option<D::Actor> {
        self.source.as_ref().and_then(|id| directory.resolve(id))
    }

    /// Look up the target actor, if it is still known to `directory`.
    pub fn target_in<D: ActorDirectory>(&self, directory: &D) -> Option<D::Actor> {
        self.target.as_ref().and_then(|id| directory.resolve(id))
    }
}

// ──────────────────── Handlers ────────────────────

/// What a handler wants to happen to the event after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Keep delivering to the remaining subscribers.
    #[default]
    Continue,
    /// Veto: later subscribers do not see this event.
    Stop,
}

/// Outcome of a handler. `Err` is a handler failure, never a veto.
pub type HandlerResult = anyhow::Result<Propagation>;

/// Event handler shared between the dispatcher and its owner.
pub type Callback = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;

/// Wrap a closure taking the event.
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure that does not look at the event.
pub fn nullary<F>(f: F) -> Callback
where
    F: Fn() -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |_event: &Event| f())
}

/// Whether two callbacks are the same closure instance.
pub fn same_callback(a: &Callback, b: &Callback) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ──────────────────── Plugins ────────────────────

/// Name and enabled flag of a plugin.
#[derive(Debug)]
pub struct PluginState {
    name: String,
    enabled: AtomicBool,
}

impl PluginState {
    /// A new state, enabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Set the flag and return its previous value.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }
}

/// Anything that owns subscriptions or schedule entries.
///
/// Registrations bound to an owner are skipped while `is_enabled()` is false
/// and resume once it is true again.
pub trait PluginOwner: Send + Sync {
    fn state(&self) -> &PluginState;

    fn name(&self) -> &str {
        self.state().name()
    }

    fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Look up a handler the owner exports under `name`.
    fn resolve_handler(&self, _name: &str) -> Option<Callback> {
        None
    }

    /// Handler used when a subscription names no callback.
    fn fallback_handler(&self) -> Option<Callback> {
        None
    }
}

impl PluginOwner for PluginState {
    fn state(&self) -> &PluginState {
        self
    }
}
