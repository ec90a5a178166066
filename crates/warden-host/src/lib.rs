//! warden-host: the surface plugins and the host application talk to.
//!
//! [`Host`] wires an [`EventRegistry`], a [`Dispatcher`] and a
//! [`CronScheduler`] together from a [`WardenConfig`], installs plugins and
//! flips their enabled flag.
//!
//! ```rust,ignore
//! struct Spree { state: PluginState }
//!
//! impl PluginOwner for Spree {
//!     fn state(&self) -> &PluginState { &self.state }
//! }
//!
//! impl Plugin for Spree {
//!     fn on_startup(&self, ctx: &PluginContext<'_>) -> anyhow::Result<()> {
//!         ctx.host().register_event_type("SPREE_START", Some("Spree started"))?;
//!         ctx.subscribe("CLIENT_KILL", vec![callback(|_| Ok(Propagation::Continue)).into()])?;
//!         ctx.schedule_recurring("reset", Schedule::new(0, "*", "*", "*", "*")?, command(|| Ok(())));
//!         Ok(())
//!     }
//! }
//!
//! let host = Host::new(load_config()?)?;
//! host.install_plugin(Arc::new(Spree { state: PluginState::new("spree") }))?;
//! host.start();
//! ```

pub mod error;
pub mod logging;
pub mod plugin;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use warden_config::WardenConfig;
use warden_cron::{
    Command, CronEntry, CronScheduler, CronToken, Schedule, SchedulerConfig, SchedulerState,
};
use warden_events::{
    DispatchReport, Dispatcher, EventError, EventRef, EventRegistry, HandlerRef, HandlingSummary,
};
use warden_types::{ActorId, Event, EventTypeId, PluginOwner, panic_message};

pub use error::{HostError, Result};
pub use logging::init_logging;
pub use plugin::{Plugin, PluginContext};

struct Installed {
    name: String,
    plugin: Arc<dyn Plugin>,
}

/// The event/cron core plus the installed plugins.
pub struct Host {
    config: WardenConfig,
    registry: Arc<EventRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<CronScheduler>,
    plugins: Mutex<Vec<Installed>>,
}

impl Host {
    /// Build the core, registering built-in and configured custom event types.
    pub fn new(config: WardenConfig) -> Result<Self> {
        let registry = Arc::new(EventRegistry::with_builtins());
        for (key, label) in &config.events.custom {
            registry.create_event(key, Some(label))?;
        }

        let dispatcher = Arc::new(Dispatcher::with_stats_window(
            registry.clone(),
            config.events.stats_window,
        ));
        let scheduler = Arc::new(CronScheduler::new(SchedulerConfig {
            stop_timeout: Duration::from_secs(config.cron.stop_timeout_secs),
            minute_slack_secs: config.cron.minute_slack_secs,
            overrun_delay: Duration::from_secs(config.cron.overrun_delay_secs),
        }));

        info!(
            event_types = registry.len(),
            custom = config.events.custom.len(),
            "Host initialised"
        );
        Ok(Self {
            config,
            registry,
            dispatcher,
            scheduler,
            plugins: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    // ──────────────────── Events ────────────────────

    pub fn register_event_type(&self, key: &str, label: Option<&str>) -> Result<EventTypeId> {
        Ok(self.registry.create_event(key, label)?)
    }

    pub fn lookup_event_id(&self, key: &str) -> Option<EventTypeId> {
        self.registry.get_id(key)
    }

    pub fn event_name(&self, key_or_id: &str) -> String {
        self.registry.get_name(key_or_id)
    }

    pub fn construct_event(
        &self,
        event: impl Into<EventRef>,
        data: serde_json::Value,
        source: Option<ActorId>,
        target: Option<ActorId>,
    ) -> Result<Event> {
        Ok(self.registry.construct(event, data, source, target)?)
    }

    pub fn publish(&self, event: &Event) -> DispatchReport {
        self.dispatcher.publish(event)
    }

    /// Subscribe `owner` to an event given by id or key.
    pub fn subscribe(
        &self,
        event: impl Into<EventRef>,
        owner: &Arc<dyn PluginOwner>,
        handlers: Vec<HandlerRef>,
    ) -> Result<usize> {
        let event = event.into();
        let id = self
            .registry
            .resolve(&event)
            .ok_or_else(|| EventError::UnknownEvent(event.to_string()))?;
        Ok(self.dispatcher.subscribe(id, owner, handlers))
    }

    /// Log and return per (plugin, event) handling latency statistics.
    pub fn dump_event_handling_stats(&self) -> Vec<HandlingSummary> {
        self.dispatcher.dump_stats()
    }

    // ──────────────────── Schedules ────────────────────

    pub fn schedule_recurring(
        &self,
        owner: Option<Arc<dyn PluginOwner>>,
        name: &str,
        schedule: Schedule,
        command: Command,
    ) -> CronToken {
        self.scheduler.add(self.entry(owner, name, schedule, command))
    }

    /// Schedule a single run at the next time `schedule` matches.
    pub fn schedule_once(
        &self,
        owner: Option<Arc<dyn PluginOwner>>,
        name: &str,
        schedule: Schedule,
        command: Command,
    ) -> CronToken {
        self.scheduler
            .add(self.entry(owner, name, schedule, command).with_max_runs(1))
    }

    fn entry(
        &self,
        owner: Option<Arc<dyn PluginOwner>>,
        name: &str,
        schedule: Schedule,
        command: Command,
    ) -> CronEntry {
        let entry = CronEntry::new(name, schedule, command)
            .with_stats_window(self.config.cron.stats_window);
        match owner {
            Some(owner) => entry.with_owner(owner),
            None => entry,
        }
    }

    pub fn cancel_schedule(&self, token: CronToken) -> bool {
        self.scheduler.cancel(token)
    }

    pub fn list_schedules(&self) -> Vec<(CronToken, Arc<CronEntry>)> {
        self.scheduler.list()
    }

    // ──────────────────── Plugins ────────────────────

    /// Run `plugin`'s startup and keep it if it succeeds.
    ///
    /// The configured `enabled` flag is applied first. On failure the
    /// plugin's registrations are rolled back and the host carries on.
    pub fn install_plugin<P: Plugin + 'static>(&self, plugin: Arc<P>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.installed(&name).is_some() {
            return Err(HostError::DuplicatePlugin(name));
        }

        let settings = self.config.plugin(&name);
        plugin.state().set_enabled(settings.enabled);

        let owner: Arc<dyn PluginOwner> = plugin.clone();
        let ctx = PluginContext::new(self, owner, settings.settings);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| plugin.on_startup(&ctx)))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())))
            });

        if let Err(e) = outcome {
            let (subscriptions, schedules) = ctx.rollback();
            error!(plugin = %name, subscriptions, schedules, "Plugin startup failed, rolled back: {e:?}");
            return Err(HostError::Startup { plugin: name, reason: e });
        }

        info!(plugin = %name, enabled = settings.enabled, "Plugin installed");
        self.lock_plugins().push(Installed { name, plugin });
        Ok(())
    }

    /// Flip a plugin's enabled flag. Returns false for an unknown plugin.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> bool {
        let Some(plugin) = self.installed(name) else {
            warn!(plugin = name, "No such plugin");
            return false;
        };
        let was = plugin.state().set_enabled(enabled);
        if was != enabled {
            info!(plugin = name, enabled, "Plugin toggled");
        }
        true
    }

    /// Names of installed plugins, in install order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.lock_plugins().iter().map(|p| p.name.clone()).collect()
    }

    fn installed(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.lock_plugins()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.plugin.clone())
    }

    fn lock_plugins(&self) -> std::sync::MutexGuard<'_, Vec<Installed>> {
        self.plugins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ──────────────────── Lifecycle ────────────────────

    /// Start the scheduler loop. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Stop the scheduler, then shut plugins down in install order.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;

        let plugins: Vec<(String, Arc<dyn Plugin>)> = self
            .lock_plugins()
            .iter()
            .map(|p| (p.name.clone(), p.plugin.clone()))
            .collect();
        for (name, plugin) in plugins {
            match panic::catch_unwind(AssertUnwindSafe(|| plugin.on_shutdown())) {
                Ok(Ok(())) => debug!(plugin = %name, "Plugin shut down"),
                Ok(Err(e)) => error!(plugin = %name, "Plugin shutdown failed: {e:?}"),
                Err(payload) => error!(
                    plugin = %name,
                    "Plugin shutdown panicked: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }
        info!("Host shut down");
    }
}
