//! Crew 层：定义、依赖图、Agent、任务执行与结果组装

pub mod agent;
pub mod definition;
pub mod executor;
pub mod graph;
pub mod job;
pub mod ledger;
pub mod registry;
pub mod result;
pub mod types;

pub use agent::{extract_json, Agent, InvocationOptions};
pub use definition::{CrewBuilder, CrewDefinition};
pub use executor::{live_state_key, CrewExecutor, ExecutorSettings, RunControl};
pub use graph::TaskGraph;
pub use registry::{CrewFactory, CrewRegistry};
pub use result::CrewResult;
pub use types::{
    AgentSpec, CrewConfig, ErrorRecord, OutputContract, Process, RuleFallback, SkipReason, TaskAction,
    TaskId, TaskInput, TaskOutput, TaskSpec, TaskState,
};
