// Automation - event-driven rule matching and execution
//
// Flat trigger/condition/action rules plus the trigger matcher that feeds
// both rules and flow graphs from the event bus.

pub mod autopilot;
pub mod conditions;
pub mod matcher;
pub mod rules;
pub mod runner;
pub mod store;

pub use autopilot::{check_send, AutopilotMode, AutopilotPolicy, AutopilotStore, GuardrailDecision, SendCheck};
pub use conditions::{evaluate, Condition, ConditionGroup, ConditionNode, FailurePolicy};
pub use matcher::TriggerMatcher;
pub use rules::{
    Action, ActionKind, Execution, ExecutionStatus, OnError, Rule, Trigger, TriggerConfig,
    TriggerKind,
};
pub use runner::RuleRunner;
pub use store::{ExecutionStore, RuleStore};
