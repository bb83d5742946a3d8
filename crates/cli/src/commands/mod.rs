//! CLI command implementations.

pub mod call;
pub mod graph;
pub mod list;
pub mod run;
pub mod scan;
pub mod sign;
pub mod validate;
pub mod watch;
