//! warden-events: event-type registry and synchronous dispatch.
//!
//! Collaborators (log parsers, plugins, cron commands) resolve event keys
//! through the [`EventRegistry`], build [`Event`]s, and hand them to the
//! [`Dispatcher`], which delivers them in registration order to every
//! subscribed plugin handler.

pub mod builtin;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod stats;

pub use dispatch::{DispatchReport, Dispatcher, HandlerRef};
pub use error::{EventError, Result};
pub use registry::{EventRef, EventRegistry, EventType};
pub use stats::{HandlingStats, HandlingSummary};

pub use warden_types::{Event, EventTypeId, Propagation};
