//! Outbound messaging abstraction used for operator notifications.

pub mod port;
pub mod throttled;
pub mod types;
