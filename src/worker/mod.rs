//! Worker pool for streaming matrix products.
//!
//! Two interchangeable backends compute the same product:
//!
//! ```text
//!                      ┌──────────────────┐
//!                      │   Coordinator    │
//!                      │ (accumulator)    │
//!                      └────────┬─────────┘
//!         frames over pipes     │   crossbeam channels + shared mutex
//!            ┌──────────────────┼──────────────────┐
//!      ┌─────▼─────┐      ┌─────▼─────┐      ┌─────▼─────┐
//!      │ Worker 0  │      │ Worker 1  │      │ Worker N  │
//!      │ row 0     │      │ row 1     │      │ cell r,c  │
//!      └───────────┘      └───────────┘      └───────────┘
//! ```
//!
//! - **process**: one re-executed `mxpool --internal-worker` per
//!   (weight, row), talking fixed-size frames over its stdin/stdout pipes.
//! - **thread**: one thread per (weight, row, col), writing its cell into
//!   the [`SharedAccumulator`](crate::accumulator::SharedAccumulator).

mod disposition;
mod ipc;
mod pool;
mod proc;
mod protocol;
mod spawn;
mod thread;
pub mod worker_main;

pub use disposition::Disposition;
pub use pool::{DispatchPolicy, Shard, WorkerPlan, WorkerPool, plan_workers, pool_size};
pub use protocol::{Origin, PartialResult, WIRE_VERSION, WorkItem};
pub use spawn::{INBOUND_FD, OUTBOUND_FD};
pub use worker_main::{WorkerStartup, run_worker_main};
