//! CLI command implementations.
//!
//! | Module      | Commands handled  |
//! |-------------|-------------------|
//! | `run`       | `Run`, `Steps`    |
//! | `serve`     | `Serve`           |
//! | `config`    | `Config`          |
//! | `snapshot`  | `Snapshot`        |

pub mod config;
pub mod run;
pub mod serve;
pub mod snapshot;

pub use config::cmd_config;
pub use run::{cmd_run, cmd_steps};
pub use serve::cmd_serve;
pub use snapshot::cmd_snapshot;
