//! Per-node render supervision: drives the local agent process over IPC,
//! emits progress events into the farm, and reports chunk outcomes.

pub mod messages;
pub mod supervisor;

pub use supervisor::RenderSupervisor;
