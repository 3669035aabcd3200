//! CLI command implementations.
//!
//! | Module        | Commands handled |
//! |---------------|------------------|
//! | `run`         | `Run`            |
//! | `plan`        | `Plan`           |
//! | `config`      | `Config`         |
//! | `checkpoints` | `Checkpoints`    |

pub mod checkpoints;
pub mod config;
pub mod plan;
pub mod run;

pub use checkpoints::cmd_checkpoints;
pub use config::cmd_config;
pub use plan::cmd_plan;
pub use run::cmd_run;
