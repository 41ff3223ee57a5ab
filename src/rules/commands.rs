//! Commands issued by rules, and the runner applying them to the registry

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::operator::{OperatorIdentity, OperatorRegistry, OperatorState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RuleCommand {
    Start {
        operator: OperatorIdentity,
        config: JsonValue,
        rule_id: String,
    },
    Stop {
        operator: OperatorIdentity,
        rule_id: String,
    },
}

impl RuleCommand {
    pub fn target(&self) -> &OperatorIdentity {
        match self {
            RuleCommand::Start { operator, .. } | RuleCommand::Stop { operator, .. } => operator,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, RuleCommand::Start { .. })
    }

    pub fn rule_id(&self) -> &str {
        match self {
            RuleCommand::Start { rule_id, .. } | RuleCommand::Stop { rule_id, .. } => rule_id,
        }
    }
}

/// Where the rule engine sends its commands
pub trait CommandSink: Send + Sync {
    fn submit(&self, command: RuleCommand) -> Result<()>;
}

impl CommandSink for mpsc::UnboundedSender<RuleCommand> {
    fn submit(&self, command: RuleCommand) -> Result<()> {
        self.send(command)
            .map_err(|e| anyhow!("command channel closed; dropped {:?}", e.0))
    }
}

/// Keeps commands in memory instead of applying them
#[derive(Debug, Default)]
pub struct RecordingSink {
    commands: Mutex<Vec<RuleCommand>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<RuleCommand> {
        self.commands.lock().clone()
    }

    pub fn take(&self) -> Vec<RuleCommand> {
        std::mem::take(&mut *self.commands.lock())
    }
}

impl CommandSink for RecordingSink {
    fn submit(&self, command: RuleCommand) -> Result<()> {
        self.commands.lock().push(command);
        Ok(())
    }
}

/* ===================== Runner ===================== */

/// Consumes rule commands from a channel and applies them to the registry
///
/// Start creates (or reuses) the instance and initializes it when idle or
/// stopped. Stop stops a cached instance; stopping an unknown instance is a
/// no-op.
pub struct OperatorCommandRunner {
    registry: Arc<OperatorRegistry>,
    receiver: mpsc::UnboundedReceiver<RuleCommand>,
}

impl OperatorCommandRunner {
    pub fn new(registry: Arc<OperatorRegistry>) -> (Self, mpsc::UnboundedSender<RuleCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { registry, receiver }, sender)
    }

    /// Apply commands until every sender is dropped; returns how many succeeded
    pub async fn run(mut self) -> usize {
        let mut applied = 0;
        while let Some(command) = self.receiver.recv().await {
            match apply_command(&self.registry, &command).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(
                    rule_id = %command.rule_id(),
                    operator = %command.target(),
                    error = %format!("{:#}", e),
                    "rule command failed"
                ),
            }
        }
        tracing::debug!(applied, "command runner stopped");
        applied
    }

    pub fn spawn(self) -> JoinHandle<usize> {
        tokio::spawn(self.run())
    }
}

pub async fn apply_command(registry: &OperatorRegistry, command: &RuleCommand) -> Result<()> {
    match command {
        RuleCommand::Start {
            operator, config, ..
        } => {
            let op = registry
                .create_operator(&operator.library, &operator.operator_type, &operator.id, config.clone())
                .await
                .with_context(|| format!("Failed to create operator {}", operator))?;
            let gate = op.lifecycle().execution_gate();
            let _turn = gate.lock().await;
            if matches!(op.state(), OperatorState::Idle | OperatorState::Stopped) {
                op.initialize()
                    .await
                    .with_context(|| format!("Failed to initialize operator {}", operator))?;
            }
            tracing::info!(operator = %operator, rule_id = %command.rule_id(), "operator started by rule");
            Ok(())
        }
        RuleCommand::Stop { operator, .. } => {
            let Some(op) = registry.cached(operator) else {
                tracing::debug!(operator = %operator, "stop for unknown operator ignored");
                return Ok(());
            };
            if op.state() != OperatorState::Stopped {
                op.stop()
                    .await
                    .with_context(|| format!("Failed to stop operator {}", operator))?;
            }
            tracing::info!(operator = %operator, rule_id = %command.rule_id(), "operator stopped by rule");
            Ok(())
        }
    }
}
