use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, prepare_database_url},
    entities::{Contact, Conversation},
};
use shared::domain::{EntityKind, Peer};
use storage::Storage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mirror-tools", about = "Inspect and purge the local chat cache")]
struct Cli {
    /// Overrides `database_url` from mirror.toml and the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Row count per entity kind.
    Stats,
    /// Cached conversations with their unread counts.
    Conversations,
    /// Cached address book entries.
    Contacts,
    /// Deletes one conversation and its cached history.
    Purge {
        #[arg(long)]
        peer: Peer,
    },
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load_settings();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let raw_url = cli.database_url.unwrap_or(settings.database_url);
    let database_url = prepare_database_url(&raw_url)?;
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;

    match cli.command {
        Command::Stats => {
            for (kind, count) in storage.count_by_kind().await? {
                println!("{kind:<18} {count}");
            }
        }
        Command::Conversations => {
            for row in storage.list_entities(EntityKind::Conversation).await? {
                match serde_json::from_value::<Conversation>(row.body) {
                    Ok(conversation) => println!(
                        "{:<24} unread={:<5} muted={} updated={}",
                        conversation.peer.to_string(),
                        conversation.unread_count,
                        conversation.is_muted(),
                        row.updated_at.to_rfc3339()
                    ),
                    Err(err) => warn!(key = %row.key, error = %err, "tools: unreadable conversation row"),
                }
            }
        }
        Command::Contacts => {
            for row in storage.list_entities(EntityKind::Contact).await? {
                match serde_json::from_value::<Contact>(row.body) {
                    Ok(contact) => println!("user:{:<19} mutual={}", contact.user.0, contact.mutual),
                    Err(err) => warn!(key = %row.key, error = %err, "tools: unreadable contact row"),
                }
            }
        }
        Command::Purge { peer } => {
            let scope = peer.to_string();
            let messages = storage.delete_scope(EntityKind::Message, &scope).await?;
            let conversation = storage
                .delete_entity(EntityKind::Conversation, &scope)
                .await?;
            match peer {
                Peer::Group(_) | Peer::Channel(_) => {
                    storage.delete_entity(EntityKind::Group, &scope).await?;
                }
                Peer::Secret(session) => {
                    storage
                        .delete_entity(EntityKind::EncryptedSession, &session.0.to_string())
                        .await?;
                }
                Peer::User(_) => {}
            }
            info!(peer = %peer, messages, conversation, "tools: purged");
            println!("purged {peer}: {messages} messages, conversation removed={conversation}");
        }
        Command::Health => {
            storage.health_check().await?;
            println!("ok");
        }
    }

    Ok(())
}
