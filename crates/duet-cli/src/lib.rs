//! duet CLI - command-line client for duet chat
//!
//! This crate provides commands for:
//! - Publishing the device identity key
//! - Listing users and conversations
//! - Starting a conversation
//! - Chatting interactively in one conversation

pub mod chat;
pub mod cli;
pub mod output;

pub use cli::Cli;
pub use output::{OutputFormat, OutputFormatter};

use duet_core::CoreError;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: General error
/// - 2: Authentication failed (missing, expired or rejected credential)
/// - 4: Connection failed
/// - 5: Invalid input
/// - 6: Not found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    AuthenticationFailed = 2,
    ConnectionFailed = 4,
    InvalidInput = 5,
    NotFound = 6,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Pick the exit code for a failed command.
    pub fn for_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<CoreError>() {
            Some(CoreError::Unauthorized) | Some(CoreError::SessionExpired) => {
                ExitCode::AuthenticationFailed
            }
            Some(CoreError::Transport(_)) | Some(CoreError::Relay) => ExitCode::ConnectionFailed,
            Some(CoreError::InvalidOperation(_)) => ExitCode::InvalidInput,
            Some(CoreError::NotFound(_)) => ExitCode::NotFound,
            _ => ExitCode::GeneralError,
        }
    }
}
