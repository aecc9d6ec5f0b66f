//! simdeck agent library.
//!
//! Re-exports the API router, shared state, provisioning service and the
//! simulated hardware so they can be used by integration tests.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod keymutex;
pub mod lpa;
pub mod modem;
pub mod service;
pub mod simulate;
pub mod state;
pub mod ws_inventory;

pub use error::{Error, Result};
