//! # punchclock gateway
//!
//! HTTP surface over a shared [`punchclock_scheduler::FlowEngine`]:
//! start a run, inspect status, events and history, retry, reset, and edit
//! the blocked-day settings.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start_server};
