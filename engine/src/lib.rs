//! Decoy engine - adversarial dialogue strategy for engaging suspected
//! fraudsters.
//!
//! Each inbound turn takes the session lock, runs the five-stage pipeline
//! (Detect, Strategize, Supervise, Write, Safety), feeds the delayed reward
//! back into the shared tactic policy and hands the updated session to a
//! background persister.

pub mod api;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod payoff;
pub mod pipeline;
pub mod policy;
pub mod safety;
pub mod service;
pub mod session;

pub use config::EngineConfig;
pub use error::EngineError;
pub use service::{DecoyEngine, SharedDecoyEngine};
