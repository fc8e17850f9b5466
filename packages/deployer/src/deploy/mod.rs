//! Deployment workflow
//!
//! Drives the register → endpoint → deployment → traffic sequence.

pub mod orchestrator;
