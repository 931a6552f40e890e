//! Passive discovery of TLS SNI hostnames from live network traffic.
//!
//! The engine lives in [`monitor`]; [`logger`] is the structured event log
//! shared by every task.

pub mod logger;
pub mod monitor;
