//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};

use duet_core::{
    bootstrap_identity, CoreError, DeliveryOrchestrator, FileKeyStore, HttpRelayClient, KeyStore, RelayApi,
    SendPath, Session, SessionCredential, WsChannel,
};
use duet_proto::{ConversationId, UserId, UserSummary};

use crate::output::{IdentityOutput, OutputFormat, OutputFormatter};
use crate::ExitCode;

/// duet - end-to-end encrypted chat for two
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about = "duet - end-to-end encrypted chat for two")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Relay base URL
    #[arg(long, env = "DUET_SERVER", default_value = "http://127.0.0.1:8080", global = true)]
    pub server: String,

    /// Session credential issued at login
    #[arg(long, env = "DUET_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Identity file (defaults to the platform data directory)
    #[arg(long = "identity", env = "DUET_IDENTITY_PATH", global = true)]
    pub identity_path: Option<PathBuf>,

    /// Output format: table, json, quiet
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load or create this device's identity and publish its public key
    PublishKey,
    /// List the other users on the relay
    Users,
    /// List your conversations, most recent first
    Conversations,
    /// Start (or find) the conversation with a user
    Start {
        /// Username or user id
        peer: String,
    },
    /// Open a conversation and chat interactively
    Chat {
        conversation_id: ConversationId,
        /// Send through the REST endpoint instead of the live channel
        #[arg(long)]
        http: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output);
        let session = self.session()?;
        let api = Arc::new(HttpRelayClient::new(session.clone())?);

        match self.command {
            Commands::PublishKey => {
                let identity = bootstrap_identity(self.keystore()?, api.as_ref()).await?;
                print_nonempty(formatter.format_identity(&IdentityOutput {
                    user_id: session.user_id(),
                    fingerprint: identity.fingerprint(),
                }));
            }
            Commands::Users => {
                print_nonempty(formatter.format_users(&api.users().await?));
            }
            Commands::Conversations => {
                let conversations = api.conversations().await?;
                print_nonempty(formatter.format_conversations(&conversations, session.user_id()));
            }
            Commands::Start { ref peer } => {
                let users = api.users().await?;
                let peer = resolve_peer(&users, peer)?;
                let conversation = api.start_conversation(peer.id).await?;
                print_nonempty(formatter.format_conversation(&conversation, session.user_id()));
            }
            Commands::Chat {
                conversation_id,
                http,
            } => {
                // the peer needs our key as much as we need theirs
                let keystore = self.keystore()?;
                bootstrap_identity(keystore.clone(), api.as_ref()).await?;

                let channel = WsChannel::connect(session.clone()).await?;
                let path = if http { SendPath::Http } else { SendPath::Live };
                let orch = DeliveryOrchestrator::new(
                    session,
                    keystore,
                    api,
                    Box::new(channel),
                    conversation_id,
                )
                .with_send_path(path);
                crate::chat::run(orch, &formatter).await?;
            }
        }
        Ok(ExitCode::Success)
    }

    fn session(&self) -> anyhow::Result<Arc<Session>> {
        let token = self.token.clone().ok_or_else(|| {
            anyhow::Error::new(CoreError::Unauthorized)
                .context("no session credential: pass --token or set DUET_TOKEN")
        })?;
        let credential = SessionCredential::from_token(token).context("reading session credential")?;
        let session = Session::new(self.server.clone(), credential);
        session.ensure_valid()?;
        Ok(Arc::new(session))
    }

    fn keystore(&self) -> anyhow::Result<Arc<KeyStore>> {
        let path = match &self.identity_path {
            Some(path) => path.clone(),
            None => FileKeyStore::default_path()
                .ok_or_else(|| anyhow!("no data directory; pass --identity"))?,
        };
        Ok(Arc::new(KeyStore::file(path)))
    }
}

fn print_nonempty(text: String) {
    if !text.is_empty() {
        println!("{text}");
    }
}

/// Match `peer` against usernames first, then ids.
pub fn resolve_peer<'a>(users: &'a [UserSummary], peer: &str) -> anyhow::Result<&'a UserSummary> {
    if let Some(user) = users.iter().find(|u| u.username == peer) {
        return Ok(user);
    }
    if let Ok(id) = peer.parse::<UserId>() {
        if let Some(user) = users.iter().find(|u| u.id == id) {
            return Ok(user);
        }
    }
    Err(anyhow!("no user named {peer}"))
}
