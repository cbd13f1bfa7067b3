//! CLI command implementations.

mod provision;
mod show;
mod validate;

pub use provision::run_provision;
pub use show::run_show;
pub use validate::run_validate;
