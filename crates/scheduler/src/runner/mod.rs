//! Task scheduler runner -- priority queues, dispatcher thread and worker pool.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, shared state, submission and accessors
//! - `lifecycle`: start/stop of the dispatcher and worker pool
//! - `dispatch`: dispatch loop, dependency gating and auto-failure
//! - `completion`: worker body and result recording
//! - `control`: cancel, pause, resume and removal of individual tasks

mod completion;
mod control;
mod core;
mod dispatch;
mod lifecycle;

pub use self::core::Scheduler;
