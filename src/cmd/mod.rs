//! CLI command implementations.
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`                                            |
//! | `config`        | `Config`                                           |

pub mod config;
pub mod serve;

pub use config::cmd_config;
pub use serve::{ServeArgs, cmd_serve};
