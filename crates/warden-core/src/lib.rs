//! Core of the panel warden: limit enforcement for delegated admin panels.
//!
//! The remote panel service, the database and the chat front-end live behind
//! ports (traits) implemented in adapter crates.

pub mod audit;
pub mod config;
pub mod credentials;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod formatting;
pub mod limits;
pub mod locks;
pub mod logging;
pub mod messaging;
pub mod monitor;
pub mod notify;
pub mod ports;
pub mod provisioning;
pub mod security;
pub mod sessions;
pub mod traffic;

#[cfg(test)]
mod test_support;

pub use errors::{Error, Result};
