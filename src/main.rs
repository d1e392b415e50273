//! grip-node: local operator CLI for the context file dependency engine
//!
//! Opens the node's graph database and blob directory and runs one
//! operation against them. Peer transport is not part of this binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use grip_node::config::{parse_size, Config};
use grip_node::{
    Contribution, Digest, Ed25519Verifier, Engine, FsBlobStore, GripNode, NodeKey, Signer,
    SqliteStore,
};

#[derive(Parser)]
#[command(name = "grip-node")]
#[command(about = "Context file dependency engine for grip peer-to-peer sync")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "grip-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "GRIP_DATA_DIR")]
    data_dir: Option<String>,

    /// Node ID (overrides config file)
    #[arg(long, env = "GRIP_NODE_ID")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory, node key, database and account
    Init,

    /// List registered contexts
    Contexts,

    /// Create a new context owned by this node
    CreateContext { name: String },

    /// Add a local file to a context
    AddFile {
        /// Context digest (hex)
        #[arg(long)]
        context: String,

        /// Local file to read
        file: PathBuf,

        /// Logical path inside the context (defaults to the file name)
        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        index: bool,

        #[arg(long)]
        snapshot: bool,

        /// data_dep_dig (hex) of a file this one depends on; repeatable
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,

        /// Login that submitted the file
        #[arg(long)]
        user: Option<String>,
    },

    /// Show the head files of a context
    Heads {
        #[arg(long)]
        context: String,
    },

    /// Show graph and quota status of a context
    Status {
        #[arg(long)]
        context: String,
    },

    /// Free space in a context, e.g. `--bytes 200MB`
    Reclaim {
        #[arg(long)]
        context: String,

        #[arg(long)]
        bytes: String,
    },

    /// List quarantined files of a context
    Quarantine {
        #[arg(long)]
        context: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grip_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Config file: {}", cli.config);
    let mut config = Config::load(std::path::Path::new(&cli.config))?;

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }

    info!("Node: {}", config.node.id);
    info!("Data dir: {}", config.node.data_dir.display());

    std::fs::create_dir_all(&config.node.data_dir)?;
    let key = NodeKey::load_or_generate(&config.key_file())?;
    let store = SqliteStore::open(&config.database_path())?;
    let blobs = FsBlobStore::new(config.blob_dir())?;
    let engine = Engine::new(store, blobs, config.reclaim_policy()?);
    let account = engine.open_account(&config.account.id, config.max_disk_space()?)?;

    let node_id = key.node_id();
    let node = GripNode::new(
        engine,
        Arc::new(key),
        Arc::new(Ed25519Verifier),
        account.account_id.clone(),
    );

    match cli.command {
        Command::Init => {
            println!("node id:  {}", node_id);
            println!("account:  {} ({} bytes)", account.account_id, account.max_disk_space);
            println!("database: {}", config.database_path().display());
        }
        Command::Contexts => {
            for ctx in node.engine().contexts()? {
                println!("{}  {}", ctx.dig(), ctx.name());
            }
        }
        Command::CreateContext { name } => {
            let ctx = node.create_context(&name).await?;
            println!("{}", ctx.dig());
        }
        Command::AddFile {
            context,
            file,
            path,
            index,
            snapshot,
            depends_on,
            user,
        } => {
            let data = std::fs::read(&file)?;
            let path = path.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let depends_on = depends_on
                .iter()
                .map(|d| Digest::from_hex(d))
                .collect::<Result<Vec<_>, _>>()?;

            let contribution = Contribution {
                path,
                data,
                index,
                snapshot,
                depends_on,
                context_user: user,
            };
            let (file, admission) = node.contribute(Digest::from_hex(&context)?, contribution).await?;
            println!("{}  {:?}", file.data_dep_dig(), admission);
        }
        Command::Heads { context } => {
            for head in node.heads(Digest::from_hex(&context)?).await? {
                println!(
                    "{}  {}  {} bytes",
                    head.data_dep_dig(),
                    head.file.path(),
                    head.file.size()
                );
            }
        }
        Command::Status { context } => {
            let status = node.status(Digest::from_hex(&context)?).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Reclaim { context, bytes } => {
            let report = node
                .reclaim(Digest::from_hex(&context)?, parse_size(&bytes)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Quarantine { context } => {
            for q in node.engine().quarantined(&Digest::from_hex(&context)?)? {
                println!("{}  {}", q.file.data_dep_dig(), q.reason);
            }
        }
    }

    Ok(())
}
