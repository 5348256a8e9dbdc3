// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Passgate API Library
//!
//! Token issuance, credential checks and second-factor challenges behind an
//! Axum router.

pub mod auth;
pub mod config;
pub mod email;
pub mod error;
pub mod routes;
pub mod state;
pub mod users;

pub use config::Config;
pub use error::{AuthError, AuthResult};
pub use state::AppState;
