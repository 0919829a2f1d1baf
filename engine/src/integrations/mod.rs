// External orchestrator integration - client, graph sync and run monitoring

pub mod monitor;
pub mod orchestrator;
pub mod sync;

pub use monitor::{map_external_status, ExecutionMonitor, MonitorError};
pub use orchestrator::{
    ExternalConnection, ExternalConnections, ExternalExecution, ExternalNode, ExternalWorkflow,
    OrchestratorClient, OrchestratorError,
};
pub use sync::{
    external_type, internal_kind, map_external_to_graph, map_external_to_rule,
    map_graph_to_external, rule_to_graph, SyncError, WorkflowSyncService,
};
