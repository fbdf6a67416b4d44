//! `jobrun-server` — the HTTP surface and process wiring of the runner.
//!
//! Route plumbing only: every handler is a thin translation between HTTP
//! and the run controller / store underneath.

pub mod app;
pub mod http;

pub use app::{build_router, AppState};
