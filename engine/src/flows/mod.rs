// Flow graphs - versioned node/edge automations and their execution engine

pub mod engine;
pub mod model;
pub mod store;

pub use engine::{spawn_wait_resumer, walk, FlowEngine, FlowError, WalkEntry, WalkResult};
pub use model::{
    Flow, FlowEdge, FlowNode, FlowRun, FlowRunEvent, FlowStatus, FlowVersion, FlowWait,
    Position, RunEventRecord, RunEventType, RunStatus,
};
pub use store::FlowStore;
