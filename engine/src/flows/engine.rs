// Flow Execution Engine - depth-bounded, cycle-guarded graph traversal

use beacon_shared::DomainEvent;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::model::{
    Flow, FlowEdge, FlowVersion, FlowWait, RunEventRecord, RunEventType, RunStatus,
};
use super::store::FlowStore;
use crate::events::{topics, EventBus};
use crate::steps::{StepContext, StepError, StepKind, StepOutcome, StepRegistry};

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow has no start node")]
    NoStartNode,
    #[error("flow has no published version")]
    NotPublished,
    #[error("node '{0}' not found in version")]
    NodeMissing(String),
    #[error("maximum node hops ({0}) exceeded")]
    DepthExceeded(u32),
    #[error("no matching edge from node '{node}' for path '{path}'")]
    NoMatchingEdge { node: String, path: String },
    #[error("step '{node}' failed: {source}")]
    Step {
        node: String,
        #[source]
        source: StepError,
    },
    #[error("run {0} not found")]
    RunMissing(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// How a traversal ended
#[derive(Debug)]
pub enum WalkResult {
    Completed { output: Value },
    Suspended { node_key: String, resume_at: DateTime<Utc>, payload: Value },
}

/// Where a traversal begins
#[derive(Debug, Clone, Copy)]
pub enum WalkEntry<'a> {
    /// At the version's start/channel_in node
    Start,
    /// At the successor of the named node (used to resume past a wait)
    AfterNode(&'a str),
}

/// Walk a version's graph node by node. Pure with respect to persistence:
/// traversal events accumulate in `events` and the caller decides what to do
/// with them, which keeps the walker testable without a database.
pub async fn walk(
    version: &FlowVersion,
    registry: &StepRegistry,
    ctx: &mut StepContext,
    entry: WalkEntry<'_>,
    max_hops: u32,
    events: &mut Vec<RunEventRecord>,
) -> Result<WalkResult, FlowError> {
    let mut current = match entry {
        WalkEntry::Start => version.entry_node().ok_or(FlowError::NoStartNode)?,
        WalkEntry::AfterNode(key) => {
            let outgoing = version.edges_from(key);
            let Some(edge) = select_edge(&outgoing, None, false) else {
                return Ok(WalkResult::Completed { output: Value::Null });
            };
            version
                .node(&edge.target)
                .ok_or_else(|| FlowError::NodeMissing(edge.target.clone()))?
        }
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut hops: u32 = 0;
    let mut last_output = Value::Null;

    loop {
        if visited.contains(&current.key) {
            events.push(RunEventRecord::new(
                &current.key,
                RunEventType::Warning,
                format!("circular reference detected at node '{}', stopping traversal", current.key),
            ));
            return Ok(WalkResult::Completed { output: last_output });
        }
        visited.insert(current.key.clone());

        hops += 1;
        if hops > max_hops {
            events.push(RunEventRecord::new(
                &current.key,
                RunEventType::Error,
                format!("maximum node hops ({}) exceeded", max_hops),
            ));
            return Err(FlowError::DepthExceeded(max_hops));
        }

        events.push(RunEventRecord::new(
            &current.key,
            RunEventType::NodeEnter,
            format!("entering node '{}' ({})", current.key, current.kind),
        ));

        let outcome = match registry.execute(current, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                events.push(
                    RunEventRecord::new(&current.key, RunEventType::Error, e.to_string()),
                );
                return Err(FlowError::Step { node: current.key.clone(), source: e });
            }
        };

        match outcome {
            StepOutcome::Suspend { resume_at, payload } => {
                events.push(
                    RunEventRecord::new(
                        &current.key,
                        RunEventType::Wait,
                        format!("run suspended until {}", resume_at.to_rfc3339()),
                    )
                    .with_data(payload.clone()),
                );
                return Ok(WalkResult::Suspended {
                    node_key: current.key.clone(),
                    resume_at,
                    payload,
                });
            }
            StepOutcome::Complete { mut output, path } => {
                // An end node without its own configured output yields the
                // previous node's result
                if current.kind == StepKind::End && output.is_null() {
                    output = last_output.clone();
                }

                events.push(
                    RunEventRecord::new(
                        &current.key,
                        RunEventType::NodeExit,
                        format!("node '{}' completed", current.key),
                    )
                    .with_data(json!({ "output": output, "path": path })),
                );

                if current.kind == StepKind::End {
                    return Ok(WalkResult::Completed { output });
                }

                let outgoing = version.edges_from(&current.key);
                if outgoing.is_empty() {
                    return Ok(WalkResult::Completed { output });
                }

                let strict = current.kind.is_branching();
                let Some(edge) = select_edge(&outgoing, path.as_deref(), strict) else {
                    let path = path.unwrap_or_default();
                    events.push(RunEventRecord::new(
                        &current.key,
                        RunEventType::Error,
                        format!("no matching edge for path '{}'", path),
                    ));
                    return Err(FlowError::NoMatchingEdge { node: current.key.clone(), path });
                };

                last_output = output;
                current = version
                    .node(&edge.target)
                    .ok_or_else(|| FlowError::NodeMissing(edge.target.clone()))?;
            }
        }
    }
}

/// Pick the outgoing edge for a step result. Branching nodes (condition /
/// switch) are strict: the result's port must match, with `default` as the
/// only fallback. Everything else degrades to the first available edge.
fn select_edge<'a>(edges: &[&'a FlowEdge], path: Option<&str>, strict: bool) -> Option<&'a FlowEdge> {
    match path {
        Some(p) => edges
            .iter()
            .find(|e| e.source_port.as_deref() == Some(p))
            .or_else(|| edges.iter().find(|e| e.source_port.as_deref() == Some("default")))
            .or_else(|| {
                if strict {
                    None
                } else {
                    edges.iter().find(|e| e.source_port.is_none()).or_else(|| edges.first())
                }
            })
            .copied(),
        None => edges.first().copied(),
    }
}

pub struct FlowEngine {
    store: FlowStore,
    registry: Arc<StepRegistry>,
    bus: EventBus,
    max_hops: u32,
}

impl FlowEngine {
    pub fn new(store: FlowStore, registry: Arc<StepRegistry>, bus: EventBus, max_hops: u32) -> Self {
        Self { store, registry, bus, max_hops }
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    /// Execute a flow's published version against the given input. The run
    /// outcome is persisted; the returned id can be used to inspect it.
    pub async fn start_run(&self, flow: &Flow, input: Value) -> Result<Uuid, FlowError> {
        let version_id = flow.current_version_id.ok_or(FlowError::NotPublished)?;
        let version = self
            .store
            .get_version(version_id)
            .await?
            .ok_or(FlowError::NotPublished)?;

        let run_id = self.store.create_run(flow.id, version.id, flow.tenant_id, &input).await?;
        info!("Started run {} for flow '{}'", run_id, flow.name);

        let mut ctx = StepContext::new(run_id, flow.tenant_id, input);
        let mut events = Vec::new();
        let result = walk(&version, &self.registry, &mut ctx, WalkEntry::Start, self.max_hops, &mut events).await;

        self.finalize(flow, run_id, &mut ctx, result, events).await?;
        Ok(run_id)
    }

    /// Re-enter a suspended run at the waited node's successor. This is the
    /// resumption entry point for waits; the wait resumer task feeds it.
    pub async fn resume_run(&self, wait: &FlowWait) -> Result<(), FlowError> {
        let run = self
            .store
            .get_run(wait.run_id)
            .await?
            .ok_or(FlowError::RunMissing(wait.run_id))?;

        if run.status != RunStatus::Waiting {
            // Cancelled or already finished while suspended; retire the wait
            self.store.mark_wait_processed(wait.id).await?;
            return Ok(());
        }

        let version = self
            .store
            .get_version(run.version_id)
            .await?
            .ok_or(FlowError::NotPublished)?;
        let flow = self
            .store
            .get_flow(run.flow_id)
            .await?
            .ok_or(FlowError::RunMissing(run.flow_id))?;

        self.store.mark_wait_processed(wait.id).await?;
        self.store.set_run_running(run.id).await?;
        info!("Resuming run {} at node '{}'", run.id, wait.node_key);

        let mut ctx = StepContext::new(run.id, run.tenant_id, run.input.clone());
        ctx.restore_variables(&run.context);

        let mut events = Vec::new();
        let result = walk(
            &version,
            &self.registry,
            &mut ctx,
            WalkEntry::AfterNode(&wait.node_key),
            self.max_hops,
            &mut events,
        )
        .await;

        // A wait with nothing after it finishes the run with the wait payload
        let result = match result {
            Ok(WalkResult::Completed { output }) if output.is_null() => {
                Ok(WalkResult::Completed { output: wait.payload.clone() })
            }
            other => other,
        };

        self.finalize(&flow, run.id, &mut ctx, result, events).await
    }

    /// Claim and resume every due wait. Called on an interval by the wait
    /// resumer task.
    pub async fn resume_due_waits(&self) -> Result<usize, FlowError> {
        let due = self.store.due_waits(Utc::now()).await?;
        let count = due.len();
        for wait in due {
            if let Err(e) = self.resume_run(&wait).await {
                error!("Failed to resume run {} from wait {}: {}", wait.run_id, wait.id, e);
            }
        }
        Ok(count)
    }

    /// Mark a run cancelled. Best-effort and non-preemptive: in-flight
    /// external calls are not interrupted.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<(), FlowError> {
        self.store.finish_run(run_id, RunStatus::Cancelled, None, None).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        flow: &Flow,
        run_id: Uuid,
        ctx: &mut StepContext,
        result: Result<WalkResult, FlowError>,
        events: Vec<RunEventRecord>,
    ) -> Result<(), FlowError> {
        self.store.append_run_events(run_id, &events).await?;

        match result {
            Ok(WalkResult::Completed { output }) => {
                self.store
                    .finish_run(run_id, RunStatus::Completed, Some(&output), None)
                    .await?;
                self.bus.publish(DomainEvent::new(
                    topics::FLOW_COMPLETED,
                    flow.tenant_id,
                    json!({ "flow_id": flow.id, "run_id": run_id, "output": output }),
                ));
                Ok(())
            }
            Ok(WalkResult::Suspended { node_key, resume_at, payload }) => {
                self.store.create_wait(run_id, &node_key, resume_at, &payload).await?;
                self.store.set_run_waiting(run_id, &ctx.snapshot_variables()).await?;
                self.bus.publish(DomainEvent::new(
                    topics::FLOW_WAITING,
                    flow.tenant_id,
                    json!({
                        "flow_id": flow.id,
                        "run_id": run_id,
                        "node_key": node_key,
                        "resume_at": resume_at.to_rfc3339()
                    }),
                ));
                Ok(())
            }
            Err(e) => {
                warn!("Run {} of flow '{}' failed: {}", run_id, flow.name, e);
                self.store
                    .finish_run(run_id, RunStatus::Failed, None, Some(&e.to_string()))
                    .await?;
                self.bus.publish(DomainEvent::new(
                    topics::FLOW_FAILED,
                    flow.tenant_id,
                    json!({ "flow_id": flow.id, "run_id": run_id, "error": e.to_string() }),
                ));
                Ok(())
            }
        }
    }
}

/// Periodically resume runs whose waits have come due
pub fn spawn_wait_resumer(engine: Arc<FlowEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.resume_due_waits().await {
                Ok(0) => {}
                Ok(n) => info!("Resumed {} waiting flow runs", n),
                Err(e) => error!("Wait resumer pass failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::model::FlowNode;
    use crate::steps::basic::BasicSteps;
    use crate::steps::condition::ConditionSteps;

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register(Box::new(BasicSteps::new(reqwest::Client::new(), None)));
        registry.register(Box::new(ConditionSteps));
        registry
    }

    fn version(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowVersion {
        FlowVersion {
            id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            version: 1,
            is_published: true,
            nodes,
            edges,
            created_at: Utc::now(),
        }
    }

    fn ctx(input: Value) -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), input)
    }

    #[tokio::test]
    async fn test_linear_flow_completes_with_end_output() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("setvar", StepKind::SetVariable, json!({"name": "x", "value": 1})),
                FlowNode::new("end", StepKind::End, json!({"output": {"done": true}})),
            ],
            vec![FlowEdge::new("start", "setvar"), FlowEdge::new("setvar", "end")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let result = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        match result {
            WalkResult::Completed { output } => assert_eq!(output["done"], true),
            _ => panic!("expected completion"),
        }
        // enter/exit pairs for three nodes
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].event_type, RunEventType::NodeEnter);
        assert_eq!(events[5].event_type, RunEventType::NodeExit);
    }

    #[tokio::test]
    async fn test_end_without_output_returns_previous_result() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("setvar", StepKind::SetVariable, json!({"name": "x", "value": 42})),
                FlowNode::new("end", StepKind::End, json!({})),
            ],
            vec![FlowEdge::new("start", "setvar"), FlowEdge::new("setvar", "end")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let result = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        match result {
            WalkResult::Completed { output } => assert_eq!(output["value"], 42),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_no_edges_ends_with_node_result() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("setvar", StepKind::SetVariable, json!({"name": "x", "value": "last"})),
            ],
            vec![FlowEdge::new("start", "setvar")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let result = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        match result {
            WalkResult::Completed { output } => assert_eq!(output["value"], "last"),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_self_edge_terminates_with_circular_warning() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("loop", StepKind::SetVariable, json!({"name": "x", "value": 1})),
            ],
            vec![FlowEdge::new("start", "loop"), FlowEdge::new("loop", "loop")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let result = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        assert!(matches!(result, WalkResult::Completed { .. }));
        let warning = events
            .iter()
            .find(|e| e.event_type == RunEventType::Warning)
            .expect("expected a circular reference warning");
        assert!(warning.message.contains("circular reference"));
    }

    #[tokio::test]
    async fn test_depth_limit_exceeded_is_fatal() {
        // A long chain of distinct nodes so the visited set never trips
        let mut nodes = vec![FlowNode::new("start", StepKind::Start, json!({}))];
        let mut edges = Vec::new();
        let mut prev = "start".to_string();
        for i in 0..10 {
            let key = format!("n{}", i);
            nodes.push(FlowNode::new(&key, StepKind::SetVariable, json!({"name": "i", "value": i})));
            edges.push(FlowEdge::new(&prev, &key));
            prev = key;
        }
        let version = version(nodes, edges);

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let err = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 5, &mut events)
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::DepthExceeded(5)));
        assert!(events.iter().any(|e| e.event_type == RunEventType::Error));
    }

    #[tokio::test]
    async fn test_condition_routes_only_through_true_port() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new(
                    "check",
                    StepKind::Condition,
                    json!({"conditions": {"field": "priority", "operator": "equals", "value": "high"}}),
                ),
                FlowNode::new("yes", StepKind::SetVariable, json!({"name": "route", "value": "yes"})),
                FlowNode::new("no", StepKind::SetVariable, json!({"name": "route", "value": "no"})),
            ],
            vec![
                FlowEdge::new("start", "check"),
                FlowEdge::new("check", "yes").from_port("true"),
                FlowEdge::new("check", "no").from_port("false"),
            ],
        );

        let mut ctx = ctx(json!({"priority": "high"}));
        let mut events = Vec::new();
        walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        assert_eq!(ctx.var_str("route").as_deref(), Some("yes"));
        assert!(!events.iter().any(|e| e.node_key == "no"));
    }

    #[tokio::test]
    async fn test_condition_without_matching_port_or_default_fails() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new(
                    "check",
                    StepKind::Condition,
                    json!({"conditions": {"field": "priority", "operator": "equals", "value": "high"}}),
                ),
                FlowNode::new("no", StepKind::SetVariable, json!({"name": "route", "value": "no"})),
            ],
            vec![
                FlowEdge::new("start", "check"),
                FlowEdge::new("check", "no").from_port("false"),
            ],
        );

        let mut ctx = ctx(json!({"priority": "high"}));
        let mut events = Vec::new();
        let err = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::NoMatchingEdge { path, .. } if path == "true"));
    }

    #[tokio::test]
    async fn test_switch_falls_back_to_default_port() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new(
                    "route",
                    StepKind::Switch,
                    json!({"field": "tier"}),
                ),
                FlowNode::new("gold", StepKind::SetVariable, json!({"name": "lane", "value": "gold"})),
                FlowNode::new("rest", StepKind::SetVariable, json!({"name": "lane", "value": "rest"})),
            ],
            vec![
                FlowEdge::new("start", "route"),
                FlowEdge::new("route", "gold").from_port("gold"),
                FlowEdge::new("route", "rest").from_port("default"),
            ],
        );

        let mut ctx = ctx(json!({"tier": "silver"}));
        let mut events = Vec::new();
        walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        assert_eq!(ctx.var_str("lane").as_deref(), Some("rest"));
    }

    #[tokio::test]
    async fn test_wait_node_suspends_run() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("pause", StepKind::Wait, json!({"delay_seconds": 60})),
                FlowNode::new("after", StepKind::SetVariable, json!({"name": "resumed", "value": true})),
            ],
            vec![FlowEdge::new("start", "pause"), FlowEdge::new("pause", "after")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let result = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap();

        match result {
            WalkResult::Suspended { node_key, .. } => assert_eq!(node_key, "pause"),
            _ => panic!("expected suspension"),
        }
        // The node after the wait must not have run
        assert!(ctx.var_str("resumed").is_none());
        assert!(events.iter().any(|e| e.event_type == RunEventType::Wait));
    }

    #[tokio::test]
    async fn test_resume_entry_continues_after_wait_node() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("pause", StepKind::Wait, json!({"delay_seconds": 60})),
                FlowNode::new("after", StepKind::SetVariable, json!({"name": "resumed", "value": true})),
            ],
            vec![FlowEdge::new("start", "pause"), FlowEdge::new("pause", "after")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let result = walk(
            &version,
            &registry(),
            &mut ctx,
            WalkEntry::AfterNode("pause"),
            50,
            &mut events,
        )
        .await
        .unwrap();

        assert!(matches!(result, WalkResult::Completed { .. }));
        assert!(ctx.variables.get("resumed").and_then(|v| v.as_bool()).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_missing_executor_fails_node() {
        let version = version(
            vec![
                FlowNode::new("start", StepKind::Start, json!({})),
                FlowNode::new("ticket", StepKind::CreateTicket, json!({"subject": "x"})),
            ],
            vec![FlowEdge::new("start", "ticket")],
        );

        let mut ctx = ctx(json!({}));
        let mut events = Vec::new();
        let err = walk(&version, &registry(), &mut ctx, WalkEntry::Start, 50, &mut events)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FlowError::Step { source: StepError::NoExecutor(_), .. }
        ));
        assert!(events.iter().any(|e| e.event_type == RunEventType::Error));
    }
}
