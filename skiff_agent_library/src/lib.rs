//! Skiff Agent Library
//!
//! The services the agent is built from: image transfer, container lifecycle updates,
//! background reclamation, and the RPC surface that exposes them.

pub mod agent_api;
pub mod error;
pub mod services;
