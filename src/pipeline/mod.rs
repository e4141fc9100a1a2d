mod job;
pub mod stage;
mod state;

pub use job::{
    Job, JobInput, JobSnapshot, ReviewInput, RevisionRequest, StageContext, StageResult,
};
pub use stage::{Documents, SchemaError, Stage, StageOutput};
pub use state::{StateMachine, WorkflowState};
