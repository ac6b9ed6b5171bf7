//! duet-relay: untrusted relay for the duet end-to-end encrypted chat
//!
//! The relay exchanges public keys, stores ciphertext it cannot read and
//! pushes new ciphertext to connected participants. Live delivery is
//! at-most-once; clients reconcile from history after reconnecting.

pub mod api;
pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod relay;
pub mod server;
pub mod store;
pub mod ws;

pub use config::ServerConfig;
pub use error::RelayError;
pub use server::RelayServer;
