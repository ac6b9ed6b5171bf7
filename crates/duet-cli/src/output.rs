//! Output formatting for CLI results
//!
//! Three formats:
//! - Table: human-readable tables (default)
//! - JSON: structured output for scripting
//! - Quiet: nothing but the exit code

use std::str::FromStr;

use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;

use duet_core::{DisplayMessage, MessageBody};
use duet_proto::{ConversationView, UserId, UserSummary};

use crate::ExitCode;

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => Err(format!("Unknown output format: {s}")),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::Json => write!(f, "json"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

/// Standard JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: String,
    pub command: String,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn success(data: T, command: &str) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            exit_code: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: command.to_string(),
        }
    }
}

/// Published identity, as reported by `publish-key`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityOutput {
    pub user_id: UserId,
    pub fingerprint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationRow<'a> {
    id: String,
    peer: &'a str,
    updated_at: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageLine<'a> {
    id: String,
    sender: &'a str,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    undecryptable: bool,
}

/// Formats output for different modes
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn format_identity(&self, identity: &IdentityOutput) -> String {
        match self.format {
            OutputFormat::Table => {
                let mut table = new_table();
                table.set_header(vec!["User", "Key fingerprint"]);
                table.add_row(vec![identity.user_id.to_string(), identity.fingerprint.clone()]);
                table.to_string()
            }
            OutputFormat::Json => to_json(&JsonResponse::success(identity, "publish-key")),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_users(&self, users: &[UserSummary]) -> String {
        match self.format {
            OutputFormat::Table => {
                if users.is_empty() {
                    return "No other users.".to_string();
                }
                let mut table = new_table();
                table.set_header(vec!["Username", "User ID"]);
                for user in users {
                    table.add_row(vec![user.username.clone(), user.id.to_string()]);
                }
                table.to_string()
            }
            OutputFormat::Json => to_json(&JsonResponse::success(users, "users")),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_conversations(&self, conversations: &[ConversationView], me: UserId) -> String {
        let rows: Vec<ConversationRow<'_>> = conversations
            .iter()
            .map(|c| ConversationRow {
                id: c.id.to_string(),
                peer: c.peer_of(me).map(|p| p.username.as_str()).unwrap_or("?"),
                updated_at: c.updated_at.to_rfc3339(),
            })
            .collect();
        match self.format {
            OutputFormat::Table => {
                if rows.is_empty() {
                    return "No conversations yet.".to_string();
                }
                let mut table = new_table();
                table.set_header(vec!["Conversation", "With", "Last activity"]);
                for row in &rows {
                    table.add_row(vec![row.id.clone(), row.peer.to_string(), row.updated_at.clone()]);
                }
                table.to_string()
            }
            OutputFormat::Json => to_json(&JsonResponse::success(&rows, "conversations")),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_conversation(&self, conversation: &ConversationView, me: UserId) -> String {
        match self.format {
            OutputFormat::Table => self.format_conversations(std::slice::from_ref(conversation), me),
            OutputFormat::Json => to_json(&JsonResponse::success(conversation, "start")),
            OutputFormat::Quiet => String::new(),
        }
    }

    /// One chat line. JSON mode emits one object per line.
    pub fn format_message(&self, message: &DisplayMessage) -> String {
        let text = match &message.body {
            MessageBody::Text(text) => Some(text.as_str()),
            MessageBody::Undecryptable => None,
        };
        match self.format {
            OutputFormat::Table => format!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M"),
                message.sender.username,
                text.unwrap_or("<undecryptable>")
            ),
            OutputFormat::Json => serde_json::to_string(&MessageLine {
                id: message.id.to_string(),
                sender: &message.sender.username,
                created_at: message.created_at.to_rfc3339(),
                text,
                undecryptable: text.is_none(),
            })
            .unwrap_or_default(),
            OutputFormat::Quiet => String::new(),
        }
    }

    pub fn format_error(&self, error: &anyhow::Error, code: ExitCode) -> String {
        match self.format {
            OutputFormat::Table => format!("Error: {error:#}"),
            OutputFormat::Json => to_json(&JsonResponse::<()> {
                success: false,
                data: None,
                error: Some(format!("{error:#}")),
                exit_code: Some(code as i32),
                timestamp: chrono::Utc::now().to_rfc3339(),
                command: String::new(),
            }),
            OutputFormat::Quiet => String::new(),
        }
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
}
