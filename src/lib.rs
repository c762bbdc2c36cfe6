//! mxpool - streaming worker-pool engine for matrix products.
//!
//! A coordinator streams input matrices through a fixed pool of workers,
//! either re-executed subprocesses talking over pipes or in-process threads,
//! and merges their partial products into one result state.

pub mod accumulator;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod matrix;
pub mod output;
pub mod worker;
