//! duet-relay binary entry point

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use duet_proto::validation::validate_username;
use duet_proto::UserId;
use duet_relay::auth::TokenVerifier;
use duet_relay::server::open_store;
use duet_relay::store::Store;
use duet_relay::{RelayServer, ServerConfig};

/// duet relay server
#[derive(Parser, Debug)]
#[command(name = "duet-relay")]
#[command(version, about = "Relay for duet end-to-end encrypted chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default)
    Serve,
    /// Register a user and print its id
    AddUser {
        #[arg(long)]
        username: String,
    },
    /// Print a session credential for a user
    IssueToken {
        #[arg(long)]
        user_id: UserId,
        /// Lifetime in hours; defaults to the configured token TTL
        #[arg(long)]
        ttl_hours: Option<u64>,
    },
    /// List registered users
    ListUsers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load().context("loading configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let server = RelayServer::new(config).await?;
            server.run().await?;
        }
        Command::AddUser { username } => {
            validate_username(&username)?;
            let store = open_store(&config).await?;
            let user = store.create_user(&username).await?;
            println!("{}\t{}", user.id, user.username);
        }
        Command::IssueToken { user_id, ttl_hours } => {
            let store = open_store(&config).await?;
            if store.get_user(user_id).await?.is_none() {
                anyhow::bail!("unknown user {}", user_id);
            }
            let ttl = ttl_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or_else(|| config.token_ttl());
            let verifier = TokenVerifier::new(config.jwt_secret.as_bytes());
            println!("{}", verifier.issue(user_id, ttl)?);
        }
        Command::ListUsers => {
            let store = open_store(&config).await?;
            for user in store.list_users().await? {
                println!("{}\t{}", user.id, user.username);
            }
        }
    }

    Ok(())
}
