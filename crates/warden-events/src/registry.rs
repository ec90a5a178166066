//! Event type registry: maps symbolic keys to stable numeric ids and labels.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::debug;

use warden_types::{ActorId, Event, EventTypeId};

use crate::builtin::{self, BUILTIN_EVENTS};
use crate::error::{EventError, Result};

/// A registered `(id, key, label)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventType {
    pub id: EventTypeId,
    pub key: String,
    pub label: String,
}

/// Either an event id or a key (or a numeric string standing for an id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRef {
    Id(EventTypeId),
    Key(String),
}

impl From<EventTypeId> for EventRef {
    fn from(id: EventTypeId) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for EventRef {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for EventRef {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl std::fmt::Display for EventRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Key(key) => f.write_str(key),
        }
    }
}

#[derive(Default)]
struct Tables {
    entries: HashMap<String, EventType>,
    last_id: u32,
}

impl Tables {
    fn is_taken(&self, id: EventTypeId) -> bool {
        builtin::by_id(id).is_some() || self.entries.values().any(|e| e.id == id)
    }

    fn next_free_id(&mut self) -> EventTypeId {
        loop {
            self.last_id += 1;
            let candidate = EventTypeId(self.last_id);
            if !self.is_taken(candidate) {
                return candidate;
            }
        }
    }
}

/// Process-wide table of event types.
///
/// Grows monotonically: event types are never removed or renumbered.
pub struct EventRegistry {
    tables: RwLock<Tables>,
    /// Reverse lookups already resolved. Ids never change once assigned.
    key_cache: Mutex<HashMap<EventTypeId, String>>,
}

impl EventRegistry {
    /// An empty registry. Call [`EventRegistry::init`] to seed built-ins.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            key_cache: Mutex::new(HashMap::new()),
        }
    }

    /// A registry seeded with the built-in event types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.init();
        registry
    }

    /// Register every built-in event type.
    pub fn init(&self) {
        for event in BUILTIN_EVENTS {
            // Built-in keys are valid by construction.
            let _ = self.create_event(event.key, Some(event.label));
        }
        debug!(count = BUILTIN_EVENTS.len(), "Registered built-in event types");
    }

    /// Register `key`, or relabel it if it already exists.
    ///
    /// A new key takes its built-in id when it has one, otherwise the next
    /// free id. Without a label the key is stored as `"Unnamed (<key>)"`.
    pub fn create_event(&self, key: &str, label: Option<&str>) -> Result<EventTypeId> {
        validate_key(key)?;
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unnamed ({key})"));

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tables.entries.get_mut(key) {
            existing.label = label;
            return Ok(existing.id);
        }

        let id = match builtin::by_key(key) {
            Some(event) => event.id,
            None => tables.next_free_id(),
        };
        tables.last_id = tables.last_id.max(id.0);
        tables.entries.insert(
            key.to_string(),
            EventType {
                id,
                key: key.to_string(),
                label,
            },
        );
        debug!(%id, key, "Registered event type");
        Ok(id)
    }

    /// Resolve a key, or parse a purely numeric string as a raw id.
    ///
    /// Raw ids are returned without checking that they are registered.
    pub fn get_id(&self, key_or_id: &str) -> Option<EventTypeId> {
        let trimmed = key_or_id.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return trimmed.parse().ok().map(EventTypeId);
        }
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key_or_id)
            .map(|e| e.id)
    }

    /// Resolve an [`EventRef`] to an id.
    pub fn resolve(&self, event: &EventRef) -> Option<EventTypeId> {
        match event {
            EventRef::Id(id) => Some(*id),
            EventRef::Key(key) => self.get_id(key),
        }
    }

    /// Reverse lookup of the key registered for `id`.
    pub fn get_key(&self, id: EventTypeId) -> Result<String> {
        if let Some(key) = self
            .key_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(key.clone());
        }

        let keys: Vec<String> = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .filter(|e| e.id == id)
            .map(|e| e.key.clone())
            .collect();

        match keys.as_slice() {
            [] => Err(EventError::NotFound(id)),
            [key] => {
                self.key_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, key.clone());
                Ok(key.clone())
            }
            _ => Err(EventError::Inconsistent { id, keys }),
        }
    }

    /// Label for a key or numeric id; `"Unknown (<key>)"` when unregistered.
    pub fn get_name(&self, key_or_id: &str) -> String {
        self.get_id(key_or_id)
            .and_then(|id| self.label(id))
            .unwrap_or_else(|| format!("Unknown ({key_or_id})"))
    }

    /// Label registered for `id`.
    pub fn label(&self, id: EventTypeId) -> Option<String> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .find(|e| e.id == id)
            .map(|e| e.label.clone())
    }

    /// Build an event of a registered type.
    pub fn construct(
        &self,
        event: impl Into<EventRef>,
        data: serde_json::Value,
        source: Option<ActorId>,
        target: Option<ActorId>,
    ) -> Result<Event> {
        let event = event.into();
        let id = self
            .resolve(&event)
            .ok_or_else(|| EventError::UnknownEvent(event.to_string()))?;
        // Reject raw ids nobody registered.
        self.get_key(id)?;

        let mut built = Event::new(id, data);
        if let Some(source) = source {
            built = built.with_source(source);
        }
        if let Some(target) = target {
            built = built.with_target(target);
        }
        Ok(built)
    }

    /// All registered event types, ordered by id.
    pub fn list(&self) -> Vec<EventType> {
        let mut all: Vec<EventType> = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|e| e.id);
        all
    }

    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = |reason| {
        Err(EventError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return invalid("empty");
    }
    if key.bytes().all(|b| b.is_ascii_digit()) {
        return invalid("purely numeric keys are read as ids");
    }
    if !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return invalid("only ASCII letters, digits and '_' are allowed");
    }
    Ok(())
}
