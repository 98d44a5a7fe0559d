//! SyncPad session server.
//!
//! Serves `/ws/notes/{note_id}` over WebSocket. Notes live in memory unless
//! `--storage-path` is given and the binary was built with `--features rocks`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use syncpad_collab::access::{AccessPolicy, OpenAccess, StaticAccess};
use syncpad_collab::server::{ServerConfig, SyncServer};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "syncpad-server")]
#[command(about = "Real-time collaborative note session server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "SYNCPAD_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Per-session broadcast buffer, in messages
    #[arg(long, env = "SYNCPAD_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Participants allowed in one note session
    #[arg(long, env = "SYNCPAD_MAX_PARTICIPANTS", default_value_t = 100)]
    max_participants: usize,

    /// RocksDB directory for note content and operation logs
    #[arg(long, env = "SYNCPAD_STORAGE_PATH", value_name = "PATH")]
    storage_path: Option<PathBuf>,

    /// Treat every user as free tier (no real-time edits or cursors)
    #[arg(long, env = "SYNCPAD_FREE_TIER")]
    free_tier: bool,

    /// Only these user ids are premium; everyone else is free tier.
    /// Without this list every user is premium unless --free-tier is set
    #[arg(long, env = "SYNCPAD_PREMIUM_USERS", value_delimiter = ',', value_name = "IDS")]
    premium_users: Vec<String>,

    /// Users that may read but not edit
    #[arg(long, env = "SYNCPAD_READ_ONLY_USERS", value_delimiter = ',', value_name = "IDS")]
    read_only_users: Vec<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            max_participants_per_session: self.max_participants,
            broadcast_capacity: self.broadcast_capacity,
            storage_path: self.storage_path.clone(),
        }
    }

    fn access_policy(&self) -> Arc<dyn AccessPolicy> {
        if self.premium_users.is_empty() && self.read_only_users.is_empty() {
            return if self.free_tier {
                Arc::new(OpenAccess::free())
            } else {
                Arc::new(OpenAccess::premium())
            };
        }

        let mut policy = StaticAccess::new()
            .all_premium(self.premium_users.is_empty() && !self.free_tier)
            .premium_users(self.premium_users.iter().cloned());
        for user_id in &self.read_only_users {
            policy = policy.read_only_user(user_id.clone());
        }
        Arc::new(policy)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = args.server_config();
    info!(
        "Starting syncpad-server on {} (max {} per session, store: {})",
        config.bind_addr,
        config.max_participants_per_session,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    );

    let server = SyncServer::from_config(config, args.access_policy())?;
    server.run().await?;
    Ok(())
}
