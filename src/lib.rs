//! kube-loadgen library — exposes all internal modules so integration tests in tests/ can
//! import them. The lib target exists solely to give the test suite access to internal types.
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::must_use_candidate,   // internal helpers; callers are tests, not library consumers
    clippy::missing_errors_doc,   // errors are documented on the thiserror enums themselves
    clippy::missing_panics_doc,
)]

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod indexer;
pub mod job;
pub mod k8s;
pub mod measurements;
pub mod ratelimit;
pub mod template;
pub mod workerpool;
