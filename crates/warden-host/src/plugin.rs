//! Plugin contract and the context plugins register through at startup.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use warden_cron::{Command, CronToken, Schedule};
use warden_events::{EventRef, HandlerRef};
use warden_types::PluginOwner;

use crate::Host;
use crate::error::Result;

/// A module loaded into the host.
///
/// Everything registered through the [`PluginContext`] is bound to the plugin
/// and is suspended while the plugin is disabled.
pub trait Plugin: PluginOwner {
    /// Register event types, subscriptions and schedules.
    ///
    /// An error rolls back everything registered so far and the plugin is
    /// not installed.
    fn on_startup(&self, ctx: &PluginContext<'_>) -> anyhow::Result<()>;

    fn on_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A plugin's view of the host during [`Plugin::on_startup`].
pub struct PluginContext<'a> {
    host: &'a Host,
    owner: Arc<dyn PluginOwner>,
    settings: Value,
    schedules: Mutex<Vec<CronToken>>,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(host: &'a Host, owner: Arc<dyn PluginOwner>, settings: Value) -> Self {
        Self {
            host,
            owner,
            settings,
            schedules: Mutex::new(Vec::new()),
        }
    }

    pub fn host(&self) -> &Host {
        self.host
    }

    pub fn name(&self) -> &str {
        self.owner.name()
    }

    /// The `plugins.<name>.settings` section of the config.
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Subscribe this plugin's `handlers` to `event`.
    pub fn subscribe(&self, event: impl Into<EventRef>, handlers: Vec<HandlerRef>) -> Result<usize> {
        self.host.subscribe(event, &self.owner, handlers)
    }

    pub fn schedule_recurring(
        &self,
        name: &str,
        schedule: Schedule,
        command: Command,
    ) -> CronToken {
        self.track(
            self.host
                .schedule_recurring(Some(self.owner.clone()), name, schedule, command),
        )
    }

    pub fn schedule_once(&self, name: &str, schedule: Schedule, command: Command) -> CronToken {
        self.track(
            self.host
                .schedule_once(Some(self.owner.clone()), name, schedule, command),
        )
    }

    fn track(&self, token: CronToken) -> CronToken {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token);
        token
    }

    /// Undo every registration made through this context.
    /// Returns (subscriptions, schedules) removed.
    pub(crate) fn rollback(&self) -> (usize, usize) {
        let subscriptions = self.host.dispatcher().unsubscribe_all(self.name());
        let tokens = std::mem::take(
            &mut *self.schedules.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let schedules = tokens
            .into_iter()
            .filter(|token| self.host.scheduler().get(*token).is_some())
            .filter(|token| self.host.cancel_schedule(*token))
            .count();
        (subscriptions, schedules)
    }
}
