//! Platform client abstractions
//!
//! Defines the client interface to the managed ML platform and its
//! REST implementation.

pub mod client;
pub mod rest;
