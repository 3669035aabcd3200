pub mod checkpoint;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod recursion;
pub mod resources;
pub mod services;
pub mod units;
