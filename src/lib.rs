//! whisper: one-time and time-limited secret sharing.
//!
//! Clients encrypt in the browser and upload only ciphertext plus a
//! password; the server keeps a bcrypt verifier and hands the ciphertext back
//! to whoever presents the password before the secret expires.

pub mod api;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod store;
pub mod vault;
