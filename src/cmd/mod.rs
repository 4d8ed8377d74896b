//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `run`           | `Run`                                              |
//! | `status`        | `Status`, `List`, `Cancel`, `Reset`                |
//! | `pipeline`      | `Init`, `Validate`                                 |

pub mod pipeline;
pub mod run;
pub mod status;

pub use pipeline::{cmd_init, cmd_validate};
pub use run::cmd_run;
pub use status::{cmd_cancel, cmd_list, cmd_reset, cmd_status};
