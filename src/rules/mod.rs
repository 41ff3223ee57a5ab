//! Reactive rules
//!
//! A rule is `trigger -> conditions -> actions`. Rules react to bus events,
//! run in priority order (highest first) and issue commands, emit derived
//! events, or rewrite values in the rule engine's data store.
//!
//! ```json
//! {
//!   "id": "throttle",
//!   "priority": 10,
//!   "trigger": {
//!     "event": "stepError",
//!     "conditions": [{"type": "equals", "path": "errorKind", "value": "TimeoutError"}]
//!   },
//!   "actions": [
//!     {"type": "stop_operator", "operator": {"library": "web", "type": "Fetch", "id": "main"}},
//!     {"type": "emit_event", "event": "throttled", "payload": {"step": "${step}"}}
//!   ]
//! }
//! ```

pub mod commands;
pub mod engine;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::events::WILDCARD;
use crate::operator::OperatorIdentity;

pub use commands::{CommandSink, OperatorCommandRunner, RecordingSink, RuleCommand};
pub use engine::{Adjuster, ItemPredicate, RuleEngine, RulePredicate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Higher runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    pub fn new(id: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger: Trigger {
                event: event.into(),
                conditions: Vec::new(),
            },
            actions: Vec::new(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.trigger.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn from_json_str(source: &str) -> serde_json::Result<Self> {
        serde_json::from_str(source)
    }

    pub fn triggered_by(&self, event_name: &str) -> bool {
        self.trigger.event == WILDCARD || self.trigger.event == event_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Event name, or `*` for every event
    pub event: String,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
}

/// Predicate over the triggering event's payload. Paths are dotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    Equals { path: String, value: JsonValue },
    NotEquals { path: String, value: JsonValue },
    Exists { path: String },
    GreaterThan { path: String, value: f64 },
    LessThan { path: String, value: f64 },
    Contains { path: String, value: JsonValue },
    Custom { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    StartOperator {
        operator: OperatorIdentity,
        #[serde(default)]
        config: JsonValue,
    },
    StopOperator {
        operator: OperatorIdentity,
    },
    /// Payload strings are templates over the triggering event's payload
    EmitEvent {
        event: String,
        #[serde(default)]
        payload: JsonValue,
    },
    /// `store[key] = adjuster(store[key], argument)`
    AdjustParameter {
        key: String,
        adjuster: String,
        #[serde(default)]
        argument: JsonValue,
    },
    /// `store[target] = items.filter(predicate)`, where `items` is read from
    /// the payload at `source`, falling back to the data store
    FilterCollection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        predicate: String,
        target: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_from_json() {
        let rule = Rule::from_json_str(
            r#"{
                "id": "throttle",
                "priority": 10,
                "trigger": {
                    "event": "stepError",
                    "conditions": [
                        {"type": "equals", "path": "errorKind", "value": "TimeoutError"},
                        {"type": "greater_than", "path": "attemptCount", "value": 2}
                    ]
                },
                "actions": [
                    {"type": "stop_operator", "operator": {"library": "web", "type": "Fetch", "id": "main"}},
                    {"type": "emit_event", "event": "throttled", "payload": {"step": "${step}"}}
                ]
            }"#,
        )
        .unwrap();

        assert!(rule.enabled);
        assert_eq!(rule.priority, 10);
        assert_eq!(
            rule.trigger.conditions[1],
            RuleCondition::GreaterThan {
                path: "attemptCount".into(),
                value: 2.0
            }
        );
        assert_eq!(
            rule.actions[0],
            RuleAction::StopOperator {
                operator: OperatorIdentity::new("web", "Fetch", "main")
            }
        );
        assert_eq!(
            rule.actions[1],
            RuleAction::EmitEvent {
                event: "throttled".into(),
                payload: json!({"step": "${step}"})
            }
        );
    }

    #[test]
    fn test_wildcard_trigger() {
        assert!(Rule::new("r", "*").triggered_by("anything"));
        assert!(Rule::new("r", "a").triggered_by("a"));
        assert!(!Rule::new("r", "a").triggered_by("b"));
    }
}
