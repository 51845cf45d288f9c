//! Runtime assembly: ranking dispatch, skill execution, the web surface
//! and the supervisor that ties them to a config file.

pub mod dispatcher;
pub mod metrics;
pub mod runner;
pub mod supervisor;
pub mod web;

pub use dispatcher::{Candidate, Dispatcher, ParserSlot};
pub use metrics::Metrics;
pub use runner::{ConnectorOutbound, SkillRunner};
pub use supervisor::{
    build_registry, RunState, ScriptOnlySource, SkillSource, Supervisor, DRAIN_DEADLINE,
};
pub use web::{router, spawn_server, WebState};
