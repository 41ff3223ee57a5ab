//! Built-in operators
//!
//! Small general-purpose operators every host gets for free, registered under
//! the `core` library by [`register_builtins`]:
//!
//! - `set`   - returns its parameters as data (assigns variables)
//! - `delay` - sleeps `ms` milliseconds, honouring cancellation
//! - `log`   - writes `message` through tracing
//! - `emit`  - publishes `event` with `payload` on the event bus

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Lifecycle, Operator, OperatorIdentity, OperatorRegistry, OperatorSpec};
use crate::events::EventBus;
use crate::types::{OperationResult, ValidationResult};

pub const CORE_LIBRARY: &str = "core";

/// Register `set`, `delay`, `log` and `emit` on a registry
pub fn register_builtins(registry: &OperatorRegistry, bus: Arc<EventBus>) {
    registry.register_fn("set", |spec: OperatorSpec| async move {
        Ok(Arc::new(SetOperator::new(spec.identity)) as Arc<dyn Operator>)
    });

    registry.register_fn("delay", |spec: OperatorSpec| async move {
        Ok(Arc::new(DelayOperator::new(spec.identity)) as Arc<dyn Operator>)
    });

    registry.register_fn("log", |spec: OperatorSpec| async move {
        Ok(Arc::new(LogOperator::new(spec.identity)) as Arc<dyn Operator>)
    });

    registry.register_fn("emit", move |spec: OperatorSpec| {
        let bus = bus.clone();
        async move { Ok(Arc::new(EmitOperator::new(spec.identity, bus)) as Arc<dyn Operator>) }
    });
}

fn names(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/* ===================== set ===================== */

pub struct SetOperator {
    identity: OperatorIdentity,
    lifecycle: Lifecycle,
}

impl SetOperator {
    pub fn new(identity: OperatorIdentity) -> Self {
        Self {
            identity,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl Operator for SetOperator {
    fn identity(&self) -> &OperatorIdentity {
        &self.identity
    }

    fn capabilities(&self) -> BTreeSet<String> {
        names(&["assign"])
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn validate(&self, params: &JsonValue) -> ValidationResult {
        if params.is_object() {
            ValidationResult::ok()
        } else {
            ValidationResult::invalid(vec!["set expects an object of assignments".to_string()])
        }
    }

    async fn run(&self, params: JsonValue, _cancel: CancellationToken) -> OperationResult {
        OperationResult::ok(params)
    }
}

/* ===================== delay ===================== */

pub struct DelayOperator {
    identity: OperatorIdentity,
    lifecycle: Lifecycle,
}

impl DelayOperator {
    pub fn new(identity: OperatorIdentity) -> Self {
        Self {
            identity,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl Operator for DelayOperator {
    fn identity(&self) -> &OperatorIdentity {
        &self.identity
    }

    fn capabilities(&self) -> BTreeSet<String> {
        names(&["wait", "cancellable"])
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn validate(&self, params: &JsonValue) -> ValidationResult {
        match params.get("ms") {
            Some(ms) if ms.is_u64() => ValidationResult::ok(),
            Some(_) => ValidationResult::invalid(vec!["'ms' must be a non-negative integer".into()]),
            None => ValidationResult::require_keys(params, &["ms"]),
        }
    }

    async fn run(&self, params: JsonValue, cancel: CancellationToken) -> OperationResult {
        let ms = params.get("ms").and_then(JsonValue::as_u64).unwrap_or(0);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                OperationResult::ok(json!({ "sleptMs": ms }))
            }
            _ = cancel.cancelled() => OperationResult::failure("delay cancelled"),
        }
    }
}

/* ===================== log ===================== */

pub struct LogOperator {
    identity: OperatorIdentity,
    lifecycle: Lifecycle,
}

impl LogOperator {
    pub fn new(identity: OperatorIdentity) -> Self {
        Self {
            identity,
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl Operator for LogOperator {
    fn identity(&self) -> &OperatorIdentity {
        &self.identity
    }

    fn capabilities(&self) -> BTreeSet<String> {
        names(&["log"])
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn validate(&self, params: &JsonValue) -> ValidationResult {
        ValidationResult::require_keys(params, &["message"])
    }

    async fn run(&self, params: JsonValue, _cancel: CancellationToken) -> OperationResult {
        let message = match params.get("message") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };

        match params.get("level").and_then(JsonValue::as_str) {
            Some("warn") => tracing::warn!(operator = %self.identity, "{}", message),
            Some("error") => tracing::error!(operator = %self.identity, "{}", message),
            Some("debug") => tracing::debug!(operator = %self.identity, "{}", message),
            _ => tracing::info!(operator = %self.identity, "{}", message),
        }

        OperationResult::ok(json!({ "message": message }))
    }
}

/* ===================== emit ===================== */

pub struct EmitOperator {
    identity: OperatorIdentity,
    lifecycle: Lifecycle,
    bus: Arc<EventBus>,
}

impl EmitOperator {
    pub fn new(identity: OperatorIdentity, bus: Arc<EventBus>) -> Self {
        Self {
            identity,
            lifecycle: Lifecycle::new(),
            bus,
        }
    }
}

#[async_trait]
impl Operator for EmitOperator {
    fn identity(&self) -> &OperatorIdentity {
        &self.identity
    }

    fn capabilities(&self) -> BTreeSet<String> {
        names(&["emit"])
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn validate(&self, params: &JsonValue) -> ValidationResult {
        match params.get("event") {
            Some(JsonValue::String(name)) if !name.is_empty() => ValidationResult::ok(),
            Some(_) => ValidationResult::invalid(vec!["'event' must be a non-empty string".into()]),
            None => ValidationResult::require_keys(params, &["event"]),
        }
    }

    async fn run(&self, params: JsonValue, _cancel: CancellationToken) -> OperationResult {
        let Some(name) = params.get("event").and_then(JsonValue::as_str) else {
            return OperationResult::failure("missing event name");
        };
        let payload = params.get("payload").cloned().unwrap_or(JsonValue::Null);

        let event = self
            .bus
            .publish_from(name, payload, self.identity.to_string());

        OperationResult::ok(json!({ "eventId": event.id.to_string(), "event": name }))
    }
}
