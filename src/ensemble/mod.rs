// src/ensemble/mod.rs

pub mod actor;
pub mod event;
pub mod message;
pub mod orchestrator;
pub mod pattern;
pub mod reasoner;
pub mod router;
pub mod session;

// Explicitly export the front-door types so callers reach them as
// ensemble::Orchestrator instead of ensemble::orchestrator::Orchestrator.
pub use orchestrator::Orchestrator;
pub use session::{Session, SessionConfig, SessionStatus};
