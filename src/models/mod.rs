//! # Models
//!
//! The meta-model fitting engine and the small matrix layer it is built on.

pub mod matrix_ops;
pub mod metamodel;
