//! Event bus
//!
//! Synchronous pub/sub connecting the workflow engine, operators and the rule
//! engine. Publishing runs the middleware chain and then every handler whose
//! pattern matches the event name (`*` matches all), in registration order.
//!
//! Dispatch is synchronous: a slow handler delays the ones after it. Hosts that
//! need fire-and-forget delivery should forward events onto their own queue.

pub mod middleware;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub use middleware::{LoggingMiddleware, Middleware, Next, RetryMiddleware, TimingMiddleware};

/// Pattern that matches every event name
pub const WILDCARD: &str = "*";

/// Lifecycle event names published by the workflow engine
///
/// Payload shapes:
/// - `workflowStarted`   `{workflowId, contextId, steps}`
/// - `stepStarted`       `{workflowId, contextId, step, stepIndex}`
/// - `stepCompleted`     `{workflowId, contextId, step, stepIndex, result, attemptCount}`
/// - `stepError`         `{workflowId, contextId, step, stepIndex, error, errorKind, attemptCount}`
/// - `stepRetry`         `{workflowId, contextId, step, attempt, delayMs, error}`
/// - `stepSkipped`       `{workflowId, contextId, step, stepIndex}`
/// - `workflowCompleted` `{workflowId, contextId, stepsExecuted}`
/// - `workflowError`     `{workflowId, contextId, failedAt, error, errorKind}`
/// - `workflowCancelled` `{workflowId, contextId, stepIndex}`
pub mod names {
    pub const WORKFLOW_STARTED: &str = "workflowStarted";
    pub const STEP_STARTED: &str = "stepStarted";
    pub const STEP_COMPLETED: &str = "stepCompleted";
    pub const STEP_ERROR: &str = "stepError";
    pub const STEP_RETRY: &str = "stepRetry";
    pub const STEP_SKIPPED: &str = "stepSkipped";
    pub const WORKFLOW_COMPLETED: &str = "workflowCompleted";
    pub const WORKFLOW_ERROR: &str = "workflowError";
    pub const WORKFLOW_CANCELLED: &str = "workflowCancelled";
}

/* ===================== Event ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub payload: JsonValue,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: JsonValue, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/* ===================== Bus ===================== */

pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
}

pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus keeping the last `history_capacity` events (0 disables history)
    pub fn new(history_capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to an event name, or to [`WILDCARD`]
    pub fn subscribe<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.into(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(WILDCARD, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Append a middleware to the end of the chain
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        self.middleware.write().push(Arc::new(middleware));
    }

    /* ===================== Publishing ===================== */

    pub fn publish(&self, name: impl Into<String>, payload: JsonValue) -> Event {
        self.publish_event(Event::new(name, payload, "bus"))
    }

    pub fn publish_from(
        &self,
        name: impl Into<String>,
        payload: JsonValue,
        source: impl Into<String>,
    ) -> Event {
        self.publish_event(Event::new(name, payload, source))
    }

    /// Record the event in history, then run it through the middleware chain
    ///
    /// Handler failures are logged and never returned to the publisher.
    pub fn publish_event(&self, event: Event) -> Event {
        self.record(&event);

        let chain = self.middleware.read().clone();
        let next = Next::new(&chain, self);
        if let Err(e) = next.run(&event) {
            tracing::warn!(event = %event.name, error = %e, "event dispatch reported failures");
        }

        event
    }

    /// Deliver to matching handlers (end of the middleware chain)
    ///
    /// Named and wildcard handlers share one list in registration order.
    pub(crate) fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        // Snapshot so handlers may subscribe or publish without deadlocking
        let handlers: Vec<Handler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.pattern == WILDCARD || s.pattern == event.name)
            .map(|s| s.handler.clone())
            .collect();

        let mut failures = 0;
        for handler in handlers {
            if let Err(e) = handler(event) {
                failures += 1;
                tracing::warn!(event = %event.name, error = %e, "event handler failed");
            }
        }

        if failures > 0 {
            anyhow::bail!("{} handler(s) failed for '{}'", failures, event.name);
        }
        Ok(())
    }

    /* ===================== History ===================== */

    fn record(&self, event: &Event) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Oldest-first copy of the retained events
    pub fn history(&self) -> Vec<Event> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(bus: &EventBus, pattern: &str, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) {
        let log = log.clone();
        bus.subscribe(pattern, move |e| {
            log.lock().push(format!("{}:{}", tag, e.name));
            Ok(())
        });
    }

    #[test]
    fn test_named_and_wildcard_handlers_in_registration_order() {
        let bus = EventBus::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "a", "first", &log);
        recorder(&bus, WILDCARD, "any", &log);
        recorder(&bus, "b", "other", &log);
        recorder(&bus, "a", "second", &log);

        bus.publish("a", json!({}));

        assert_eq!(
            log.lock().as_slice(),
            &["first:a".to_string(), "any:a".into(), "second:a".into()]
        );
    }

    #[test]
    fn test_handler_failure_does_not_stop_delivery() {
        let bus = EventBus::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("a", |_| anyhow::bail!("broken handler"));
        recorder(&bus, "a", "after", &log);

        bus.publish("a", json!(null));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.publish(format!("e{}", i), json!(i));
        }
        let names: Vec<String> = bus.history().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let id = bus.subscribe("a", move |_| {
            sink.lock().push(1);
            Ok(())
        });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish("a", json!(null));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_handler_may_publish_reentrantly() {
        let bus = Arc::new(EventBus::new(10));
        let inner = Arc::downgrade(&bus);
        bus.subscribe("outer", move |_| {
            if let Some(bus) = inner.upgrade() {
                bus.publish("inner", json!(null));
            }
            Ok(())
        });

        bus.publish("outer", json!(null));
        let names: Vec<String> = bus.history().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["outer", "inner"]);
    }
}
