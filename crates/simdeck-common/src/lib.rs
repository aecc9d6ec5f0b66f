//! Shared types for simdeck.
//!
//! This crate contains:
//! - **Models** - modems, ports, SIM cards, eSIM profiles and notifications
//! - **Protocol messages** - the eSIM download WebSocket exchange and the
//!   inventory event stream pushed to browsers

pub mod models;
pub mod protocol;
