//! # Model inputs
//!
//! Containers for the simulator projections consumed by the meta-model
//! fitting engine. One [`ScriptResult`] per initial age; a meta-model pools
//! several compatible result sets for one stratum group.

pub mod script_result;

pub use script_result::{ScriptResult, ScriptResultError, ScriptResultRecord};
