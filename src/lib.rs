//! Call Guard: rule matching and conversational deflection for calls and SMS.

pub mod config;
pub mod error;
pub mod guard;
pub mod routes;
pub mod store;
