//! Dispatcher: per event type subscription table and synchronous delivery.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use warden_types::{
    Callback, Event, EventTypeId, PluginOwner, Propagation, panic_message, same_callback,
};

use crate::registry::EventRegistry;
use crate::stats::{DEFAULT_STATS_WINDOW, HandlingStats, HandlingSummary};

/// A handler passed to [`Dispatcher::subscribe`].
#[derive(Clone)]
pub enum HandlerRef {
    /// A closure registered directly.
    Callback(Callback),
    /// A handler the owner exports under this name.
    Named(String),
}

impl From<Callback> for HandlerRef {
    fn from(callback: Callback) -> Self {
        Self::Callback(callback)
    }
}

impl From<&str> for HandlerRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for HandlerRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

#[derive(Clone, PartialEq)]
enum Origin {
    Direct,
    Named(String),
    Fallback,
}

#[derive(Clone)]
struct Subscription {
    owner: Arc<dyn PluginOwner>,
    callback: Callback,
    origin: Origin,
}

impl Subscription {
    fn same_as(&self, other: &Subscription) -> bool {
        if self.owner.name() != other.owner.name() {
            return false;
        }
        match (&self.origin, &other.origin) {
            (Origin::Direct, Origin::Direct) => same_callback(&self.callback, &other.callback),
            (a, b) => a == b,
        }
    }
}

/// What happened while publishing one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned normally.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
    /// Handlers whose owner was disabled.
    pub skipped: usize,
    /// Owner whose handler stopped propagation, if any.
    pub vetoed_by: Option<String>,
}

/// Delivers events to subscribed handlers in registration order.
pub struct Dispatcher {
    registry: Arc<EventRegistry>,
    table: RwLock<HashMap<EventTypeId, Vec<Subscription>>>,
    owners: RwLock<HashMap<String, BTreeSet<EventTypeId>>>,
    stats: HandlingStats,
}

impl Dispatcher {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self::with_stats_window(registry, DEFAULT_STATS_WINDOW)
    }

    pub fn with_stats_window(registry: Arc<EventRegistry>, window: usize) -> Self {
        Self {
            registry,
            table: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            stats: HandlingStats::new(window),
        }
    }

    /// Register `handlers` of `owner` for `event`. Returns how many were added.
    ///
    /// With no handlers, the owner's fallback handler is registered instead.
    /// Named handlers the owner cannot resolve are skipped; the others in the
    /// same call still register. Re-registering an existing handler is a no-op.
    pub fn subscribe(
        &self,
        event: EventTypeId,
        owner: &Arc<dyn PluginOwner>,
        handlers: Vec<HandlerRef>,
    ) -> usize {
        let mut candidates = Vec::with_capacity(handlers.len().max(1));

        if handlers.is_empty() {
            match owner.fallback_handler() {
                Some(callback) => candidates.push(Subscription {
                    owner: owner.clone(),
                    callback,
                    origin: Origin::Fallback,
                }),
                None => {
                    warn!(
                        owner = owner.name(),
                        %event,
                        "No handler given and owner has no fallback handler"
                    );
                    return 0;
                }
            }
        }

        for handler in handlers {
            let (callback, origin) = match handler {
                HandlerRef::Callback(callback) => (callback, Origin::Direct),
                HandlerRef::Named(name) => match owner.resolve_handler(&name) {
                    Some(callback) => (callback, Origin::Named(name)),
                    None => {
                        warn!(
                            owner = owner.name(),
                            %event,
                            handler = %name,
                            "Handler is not callable, skipping"
                        );
                        continue;
                    }
                },
            };
            candidates.push(Subscription {
                owner: owner.clone(),
                callback,
                origin,
            });
        }

        let mut added = 0;
        {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let list = table.entry(event).or_default();
            for candidate in candidates {
                if list.iter().any(|existing| existing.same_as(&candidate)) {
                    trace!(owner = owner.name(), %event, "Handler already subscribed");
                    continue;
                }
                list.push(candidate);
                added += 1;
            }
        }

        if added > 0 {
            self.owners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(owner.name().to_string())
                .or_default()
                .insert(event);
            debug!(owner = owner.name(), %event, added, "Subscribed");
        }
        added
    }

    /// Deliver `event` to every subscriber of its type, in registration order.
    ///
    /// Each handler is isolated: an error or panic is logged and delivery
    /// continues. A handler returning [`Propagation::Stop`] ends delivery.
    pub fn publish(&self, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::default();

        // Snapshot so handlers may subscribe or publish re-entrantly.
        let subscriptions: Vec<Subscription> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type())
            .cloned()
            .unwrap_or_default();
        if subscriptions.is_empty() {
            trace!(event = %event.event_type(), "No subscribers");
            return report;
        }

        let event_key = self
            .registry
            .get_key(event.event_type())
            .unwrap_or_else(|_| event.event_type().to_string());

        for subscription in subscriptions {
            let owner = subscription.owner.name();
            if !subscription.owner.is_enabled() {
                trace!(owner, event = %event_key, "Owner disabled, skipping");
                report.skipped += 1;
                continue;
            }

            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscription.callback)(event)));
            self.stats.record(owner, &event_key, started.elapsed());

            match outcome {
                Ok(Ok(Propagation::Continue)) => report.delivered += 1,
                Ok(Ok(Propagation::Stop)) => {
                    report.delivered += 1;
                    report.vetoed_by = Some(owner.to_string());
                    debug!(owner, event = %event_key, "Propagation stopped");
                    break;
                }
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!(owner, event = %event_key, "Handler failed: {e:?}");
                }
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        owner,
                        event = %event_key,
                        "Handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        report
    }

    /// Event types `owner` is subscribed to.
    pub fn subscriptions_of(&self, owner: &str) -> Vec<EventTypeId> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .map(|events| events.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `event`.
    pub fn subscriber_count(&self, event: EventTypeId) -> usize {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Remove every handler of `owner`. Returns how many were removed.
    pub fn unsubscribe_all(&self, owner: &str) -> usize {
        let Some(events) = self
            .owners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner)
        else {
            return 0;
        };

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for event in events {
            if let Some(list) = table.get_mut(&event) {
                let before = list.len();
                list.retain(|s| s.owner.name() != owner);
                removed += before - list.len();
                if list.is_empty() {
                    table.remove(&event);
                }
            }
        }
        debug!(owner, removed, "Unsubscribed");
        removed
    }

    pub fn stats(&self) -> &HandlingStats {
        &self.stats
    }

    /// Log and return latency summaries for every (owner, event) pair.
    pub fn dump_stats(&self) -> Vec<HandlingSummary> {
        let summaries = self.stats.summaries();
        for s in &summaries {
            info!(
                owner = %s.owner,
                event = %s.event,
                samples = s.samples,
                "min {:.3}ms, max {:.3}ms, mean {:.3}ms, stddev {:.3}ms",
                s.min_ms,
                s.max_ms,
                s.mean_ms,
                s.stddev_ms
            );
        }
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use warden_types::{PluginState, callback, nullary};

    use crate::builtin::{CLIENT_KILL, CLIENT_SAY};

    struct TestPlugin {
        state: PluginState,
        hits: Arc<AtomicU32>,
    }

    impl TestPlugin {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                state: PluginState::new(name),
                hits: Arc::new(AtomicU32::new(0)),
            })
        }
    }

    impl PluginOwner for TestPlugin {
        fn state(&self) -> &PluginState {
            &self.state
        }

        fn resolve_handler(&self, name: &str) -> Option<Callback> {
            let hits = self.hits.clone();
            match name {
                "on_kill" => Some(nullary(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(Propagation::Continue)
                })),
                _ => None,
            }
        }

        fn fallback_handler(&self) -> Option<Callback> {
            let hits = self.hits.clone();
            Some(nullary(move || {
                hits.fetch_add(100, Ordering::SeqCst);
                Ok(Propagation::Continue)
            }))
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(EventRegistry::with_builtins()))
    }

    fn owner(name: &str) -> Arc<dyn PluginOwner> {
        Arc::new(PluginState::new(name))
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Callback {
        let log = log.clone();
        nullary(move || {
            log.lock().unwrap().push(tag);
            Ok(Propagation::Continue)
        })
    }

    #[test]
    fn test_publish_in_registration_order() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = owner("a");
        let b = owner("b");
        d.subscribe(CLIENT_SAY, &a, vec![recorder(&log, "a1").into(), recorder(&log, "a2").into()]);
        d.subscribe(CLIENT_SAY, &b, vec![recorder(&log, "b1").into()]);

        let report = d.publish(&Event::new(CLIENT_SAY, serde_json::Value::Null));
        assert_eq!(*log.lock().unwrap(), ["a1", "a2", "b1"]);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_failure_does_not_stop_delivery() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = owner("p");
        let failing = nullary(|| anyhow::bail!("handler exploded"));
        let panicking = nullary(|| panic!("handler panicked"));
        d.subscribe(
            CLIENT_KILL,
            &p,
            vec![
                recorder(&log, "first").into(),
                failing.into(),
                panicking.into(),
                recorder(&log, "last").into(),
            ],
        );

        let report = d.publish(&Event::new(CLIENT_KILL, serde_json::Value::Null));
        assert_eq!(*log.lock().unwrap(), ["first", "last"]);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn test_veto_stops_later_subscribers() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        let censor = owner("censor");
        let other = owner("other");
        let veto_log = log.clone();
        d.subscribe(
            CLIENT_SAY,
            &censor,
            vec![callback(move |_| {
                veto_log.lock().unwrap().push("censor");
                Ok(Propagation::Stop)
            })
            .into()],
        );
        d.subscribe(CLIENT_SAY, &other, vec![recorder(&log, "other").into()]);

        let report = d.publish(&Event::new(CLIENT_SAY, serde_json::Value::Null));
        assert_eq!(*log.lock().unwrap(), ["censor"]);
        assert_eq!(report.vetoed_by.as_deref(), Some("censor"));
    }

    #[test]
    fn test_duplicate_callback_is_ignored() {
        let d = dispatcher();
        let p = owner("p");
        let log = Arc::new(Mutex::new(Vec::new()));
        let cb = recorder(&log, "x");
        assert_eq!(d.subscribe(CLIENT_SAY, &p, vec![cb.clone().into()]), 1);
        assert_eq!(d.subscribe(CLIENT_SAY, &p, vec![cb.clone().into(), cb.into()]), 0);
        assert_eq!(d.subscriber_count(CLIENT_SAY), 1);
    }

    #[test]
    fn test_invalid_handler_skipped_valid_registered() {
        let d = dispatcher();
        let plugin = TestPlugin::new("spree");
        let as_owner: Arc<dyn PluginOwner> = plugin.clone();
        let added = d.subscribe(
            CLIENT_KILL,
            &as_owner,
            vec!["no_such_handler".into(), "on_kill".into()],
        );
        assert_eq!(added, 1);
        // Named handlers dedupe by name.
        assert_eq!(d.subscribe(CLIENT_KILL, &as_owner, vec!["on_kill".into()]), 0);

        d.publish(&Event::new(CLIENT_KILL, serde_json::Value::Null));
        assert_eq!(plugin.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fallback_handler_when_no_callbacks() {
        let d = dispatcher();
        let plugin = TestPlugin::new("spree");
        let as_owner: Arc<dyn PluginOwner> = plugin.clone();
        assert_eq!(d.subscribe(CLIENT_SAY, &as_owner, vec![]), 1);
        assert_eq!(d.subscribe(CLIENT_SAY, &as_owner, vec![]), 0);

        d.publish(&Event::new(CLIENT_SAY, serde_json::Value::Null));
        assert_eq!(plugin.hits.load(Ordering::SeqCst), 100);

        // A bare owner has no fallback.
        assert_eq!(d.subscribe(CLIENT_SAY, &owner("bare"), vec![]), 0);
    }

    #[test]
    fn test_disabled_owner_is_skipped() {
        let d = dispatcher();
        let plugin = TestPlugin::new("tk");
        let as_owner: Arc<dyn PluginOwner> = plugin.clone();
        d.subscribe(CLIENT_KILL, &as_owner, vec!["on_kill".into()]);

        plugin.state.set_enabled(false);
        let report = d.publish(&Event::new(CLIENT_KILL, serde_json::Value::Null));
        assert_eq!(report.skipped, 1);
        assert_eq!(plugin.hits.load(Ordering::SeqCst), 0);

        plugin.state.set_enabled(true);
        d.publish(&Event::new(CLIENT_KILL, serde_json::Value::Null));
        assert_eq!(plugin.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscriptions_of_and_unsubscribe_all() {
        let d = dispatcher();
        let p = owner("p");
        let q = owner("q");
        let log = Arc::new(Mutex::new(Vec::new()));
        d.subscribe(CLIENT_SAY, &p, vec![recorder(&log, "p").into()]);
        d.subscribe(CLIENT_KILL, &p, vec![recorder(&log, "p").into()]);
        d.subscribe(CLIENT_SAY, &q, vec![recorder(&log, "q").into()]);

        assert_eq!(d.subscriptions_of("p"), vec![CLIENT_SAY, CLIENT_KILL]);
        assert_eq!(d.unsubscribe_all("p"), 2);
        assert!(d.subscriptions_of("p").is_empty());
        assert_eq!(d.subscriber_count(CLIENT_SAY), 1);
        assert_eq!(d.subscriber_count(CLIENT_KILL), 0);
        assert_eq!(d.unsubscribe_all("p"), 0);
    }

    #[test]
    fn test_handling_stats_recorded_per_owner_and_key() {
        let d = dispatcher();
        let p = owner("p");
        let log = Arc::new(Mutex::new(Vec::new()));
        d.subscribe(CLIENT_SAY, &p, vec![recorder(&log, "p").into()]);
        for _ in 0..3 {
            d.publish(&Event::new(CLIENT_SAY, serde_json::Value::Null));
        }
        let summaries = d.dump_stats();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].owner, "p");
        assert_eq!(summaries[0].event, "CLIENT_SAY");
        assert_eq!(summaries[0].samples, 3);
    }
}
