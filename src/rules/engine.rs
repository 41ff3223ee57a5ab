//! Rule dispatch
//!
//! Matching rules run highest priority first; ties keep registration order.
//! Within one dispatch cycle the first start/stop issued for an operator owns
//! that operator, and opposing commands from lower-priority rules are dropped.
//!
//! Events emitted by actions are queued rather than dispatched in place. Each
//! cascade drains breadth-first on the thread that started it, up to
//! `max_cascade_events` dispatches; unrelated publishers are never counted
//! against it.

use anyhow::{anyhow, bail, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use super::commands::{CommandSink, RuleCommand};
use super::{Rule, RuleAction, RuleCondition};
use crate::config::RulesConfig;
use crate::events::{Event, EventBus, SubscriptionId};
use crate::operator::OperatorIdentity;
use crate::resolver::contains;
use crate::types::Variables;
use crate::workflow::template::{lookup_dotted, resolve_value};

/// `(current, argument) -> new value`
pub type Adjuster = Arc<dyn Fn(&JsonValue, &JsonValue) -> Result<JsonValue> + Send + Sync>;
/// Keeps an element in `filter_collection`
pub type ItemPredicate = Arc<dyn Fn(&JsonValue) -> bool + Send + Sync>;
/// Backs `custom` conditions
pub type RulePredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Queued events of each in-progress cascade, keyed by the draining thread
type Pending = HashMap<ThreadId, VecDeque<Event>>;

pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
    sink: Arc<dyn CommandSink>,
    max_cascade_events: usize,
    bus: RwLock<Option<Weak<EventBus>>>,
    pending: Mutex<Pending>,
    data: RwLock<Variables>,
    adjusters: RwLock<HashMap<String, Adjuster>>,
    item_predicates: RwLock<HashMap<String, ItemPredicate>>,
    predicates: RwLock<HashMap<String, RulePredicate>>,
}

impl RuleEngine {
    pub fn new(sink: Arc<dyn CommandSink>, config: &RulesConfig) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            sink,
            max_cascade_events: config.max_cascade_events,
            bus: RwLock::new(None),
            pending: Mutex::new(Pending::default()),
            data: RwLock::new(Variables::new()),
            adjusters: RwLock::new(HashMap::new()),
            item_predicates: RwLock::new(HashMap::new()),
            predicates: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to every event on `bus`; emitted events are published there too
    ///
    /// The subscription holds a weak reference, so dropping the engine
    /// silently detaches it.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) -> SubscriptionId {
        *self.bus.write() = Some(Arc::downgrade(bus));
        let engine = Arc::downgrade(self);
        bus.subscribe_all(move |event| {
            if let Some(engine) = engine.upgrade() {
                engine.process_event(event);
            }
            Ok(())
        })
    }

    /* ===================== Rule storage ===================== */

    /// Add a rule, replacing any rule with the same id in place
    pub fn add_rule(&self, rule: Rule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                tracing::debug!(rule_id = %rule.id, "rule replaced");
                *existing = rule;
            }
            None => rules.push(rule),
        }
    }

    pub fn remove_rule(&self, id: &str) -> Option<Rule> {
        let mut rules = self.rules.write();
        let idx = rules.iter().position(|r| r.id == id)?;
        Some(rules.remove(idx))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        self.update(id, |rule| rule.enabled = enabled)
    }

    pub fn set_priority(&self, id: &str, priority: i32) -> bool {
        self.update(id, |rule| rule.priority = priority)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Rule)) -> bool {
        match self.rules.write().iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                f(rule);
                true
            }
            None => false,
        }
    }

    pub fn rule(&self, id: &str) -> Option<Rule> {
        self.rules.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    /* ===================== Host hooks ===================== */

    pub fn register_adjuster<F>(&self, name: impl Into<String>, adjuster: F)
    where
        F: Fn(&JsonValue, &JsonValue) -> Result<JsonValue> + Send + Sync + 'static,
    {
        self.adjusters.write().insert(name.into(), Arc::new(adjuster));
    }

    pub fn register_item_predicate<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&JsonValue) -> bool + Send + Sync + 'static,
    {
        self.item_predicates
            .write()
            .insert(name.into(), Arc::new(predicate));
    }

    pub fn register_predicate<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicates.write().insert(name.into(), Arc::new(predicate));
    }

    /* ===================== Data store ===================== */

    pub fn data(&self) -> Variables {
        self.data.read().clone()
    }

    pub fn get_data(&self, key: &str) -> Option<JsonValue> {
        self.data.read().get(key).cloned()
    }

    pub fn set_data(&self, key: impl Into<String>, value: JsonValue) {
        self.data.write().insert(key.into(), value);
    }

    /* ===================== Dispatch ===================== */

    /// Ids of the rules `event` would fire, in execution order
    pub fn matching(&self, event: &Event) -> Vec<String> {
        self.matching_rules(event).into_iter().map(|r| r.id).collect()
    }

    fn matching_rules(&self, event: &Event) -> Vec<Rule> {
        let mut matched: Vec<Rule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.triggered_by(&event.name))
            .filter(|r| r.trigger.conditions.iter().all(|c| self.condition_holds(c, event)))
            .cloned()
            .collect();
        // stable: equal priorities keep registration order
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }

    /// Dispatch `event`, then every event its rules emit, breadth-first
    ///
    /// A call made while this thread is already draining (an action emitting
    /// through the bus) only queues the event. Publishers on other threads
    /// start cascades of their own, each with its own limit.
    pub fn process_event(&self, event: &Event) {
        let cascade = thread::current().id();
        {
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.get_mut(&cascade) {
                queue.push_back(event.clone());
                return;
            }
            pending.insert(cascade, VecDeque::from([event.clone()]));
        }

        let mut processed = 0usize;
        loop {
            let next = {
                let mut pending = self.pending.lock();
                let Some(queue) = pending.get_mut(&cascade) else {
                    break;
                };
                if processed >= self.max_cascade_events && !queue.is_empty() {
                    let dropped = queue.len();
                    pending.remove(&cascade);
                    tracing::warn!(
                        limit = self.max_cascade_events,
                        dropped,
                        "rule cascade limit reached; remaining events dropped"
                    );
                    break;
                }
                match queue.pop_front() {
                    Some(event) => event,
                    None => {
                        pending.remove(&cascade);
                        break;
                    }
                }
            };
            processed += 1;
            self.dispatch(&next);
        }
    }

    fn dispatch(&self, event: &Event) {
        let matched = self.matching_rules(event);
        if matched.is_empty() {
            return;
        }
        tracing::debug!(event = %event.name, rules = matched.len(), "dispatching rules");

        let mut owners: HashMap<OperatorIdentity, (bool, String)> = HashMap::new();
        for rule in &matched {
            for action in &rule.actions {
                if let Err(e) = self.apply_action(rule, action, event, &mut owners) {
                    tracing::warn!(
                        rule_id = %rule.id,
                        event = %event.name,
                        error = %format!("{:#}", e),
                        "rule action failed"
                    );
                }
            }
        }
    }

    fn apply_action(
        &self,
        rule: &Rule,
        action: &RuleAction,
        event: &Event,
        owners: &mut HashMap<OperatorIdentity, (bool, String)>,
    ) -> Result<()> {
        match action {
            RuleAction::StartOperator { operator, config } => self.issue(
                RuleCommand::Start {
                    operator: operator.clone(),
                    config: config.clone(),
                    rule_id: rule.id.clone(),
                },
                owners,
            ),
            RuleAction::StopOperator { operator } => self.issue(
                RuleCommand::Stop {
                    operator: operator.clone(),
                    rule_id: rule.id.clone(),
                },
                owners,
            ),
            RuleAction::EmitEvent {
                event: name,
                payload,
            } => {
                let payload = resolve_value(payload, &payload_variables(event));
                self.emit(name, payload, &rule.id);
                Ok(())
            }
            RuleAction::AdjustParameter {
                key,
                adjuster,
                argument,
            } => {
                let adjust = self
                    .adjusters
                    .read()
                    .get(adjuster)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown adjuster '{}'", adjuster))?;
                let argument = resolve_value(argument, &payload_variables(event));
                let current = self.get_data(key).unwrap_or(JsonValue::Null);
                let updated = adjust(&current, &argument)?;
                tracing::debug!(rule_id = %rule.id, key = %key, "parameter adjusted");
                self.set_data(key.clone(), updated);
                Ok(())
            }
            RuleAction::FilterCollection {
                source,
                predicate,
                target,
            } => {
                let keep = self
                    .item_predicates
                    .read()
                    .get(predicate)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown predicate '{}'", predicate))?;
                let items = self.collection(source.as_deref(), event)?;
                let kept: Vec<JsonValue> = items.into_iter().filter(|item| keep(item)).collect();
                self.set_data(target.clone(), JsonValue::Array(kept));
                Ok(())
            }
        }
    }

    fn issue(
        &self,
        command: RuleCommand,
        owners: &mut HashMap<OperatorIdentity, (bool, String)>,
    ) -> Result<()> {
        let target = command.target().clone();
        if let Some((is_start, owner)) = owners.get(&target) {
            if *is_start != command.is_start() {
                tracing::debug!(
                    operator = %target,
                    rule_id = %command.rule_id(),
                    owner = %owner,
                    "conflicting command dropped"
                );
                return Ok(());
            }
        } else {
            owners.insert(target, (command.is_start(), command.rule_id().to_string()));
        }
        self.sink.submit(command)
    }

    fn emit(&self, name: &str, payload: JsonValue, rule_id: &str) {
        let source = format!("rule:{}", rule_id);
        let bus = self.bus.read().as_ref().and_then(Weak::upgrade);
        match bus {
            // the bus hands the event back to us through the subscription
            Some(bus) => {
                bus.publish_from(name, payload, source);
            }
            None => self.process_event(&Event::new(name, payload, source)),
        }
    }

    /// Array at `source` in the payload, else in the data store; the whole
    /// payload when no source is given
    fn collection(&self, source: Option<&str>, event: &Event) -> Result<Vec<JsonValue>> {
        let value = match source {
            None => Some(event.payload.clone()),
            Some(path) => lookup_dotted(&event.payload, path).cloned().or_else(|| {
                let data = JsonValue::Object(self.data());
                lookup_dotted(&data, path).cloned()
            }),
        };
        match value {
            Some(JsonValue::Array(items)) => Ok(items),
            Some(other) => bail!("collection at {:?} is not an array: {}", source, other),
            None => bail!("no collection at {:?}", source),
        }
    }

    fn condition_holds(&self, condition: &RuleCondition, event: &Event) -> bool {
        let at = |path: &str| lookup_dotted(&event.payload, path);
        match condition {
            RuleCondition::Equals { path, value } => at(path) == Some(value),
            RuleCondition::NotEquals { path, value } => at(path) != Some(value),
            RuleCondition::Exists { path } => at(path).is_some(),
            RuleCondition::GreaterThan { path, value } => {
                at(path).and_then(JsonValue::as_f64).is_some_and(|v| v > *value)
            }
            RuleCondition::LessThan { path, value } => {
                at(path).and_then(JsonValue::as_f64).is_some_and(|v| v < *value)
            }
            RuleCondition::Contains { path, value } => {
                at(path).is_some_and(|actual| contains(actual, value))
            }
            RuleCondition::Custom { name } => {
                let predicate = self.predicates.read().get(name).cloned();
                match predicate {
                    Some(predicate) => predicate(event),
                    None => {
                        tracing::warn!(predicate = %name, "unknown rule predicate; condition is false");
                        false
                    }
                }
            }
        }
    }
}

/// Template variables for action payloads: the payload's own keys, plus
/// `event` and `payload`
fn payload_variables(event: &Event) -> Variables {
    let mut vars = match &event.payload {
        JsonValue::Object(map) => map.clone(),
        _ => Variables::new(),
    };
    vars.entry("payload").or_insert_with(|| event.payload.clone());
    vars.entry("event")
        .or_insert_with(|| JsonValue::String(event.name.clone()));
    vars
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
