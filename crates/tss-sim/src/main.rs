//! TSS Simulator CLI
//!
//! Runs threshold sessions between in-process validator nodes:
//! - Distributed Key Generation
//! - Signing
//! - Resharing to a new committee

mod keystore;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use keystore::FileKeystore;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tss_dispatcher::{
    dispatcher_for, key_path, Dispatcher, DispatcherConfig, ElectionCommitter, Keystore,
    MemoryNetwork, NodeContext, Outcome, ReshareParams, SessionParams, SessionRequest,
};
use tss_engine::{LocalSaveData, SigningAlgo};

/// TSS Simulator - local validator committee
#[derive(Parser)]
#[command(name = "tss-sim")]
#[command(about = "Threshold signing sessions between in-process validator nodes")]
#[command(version)]
struct Cli {
    /// Validator accounts (comma-separated)
    #[arg(short, long, value_delimiter = ',', default_value = "alice,bob,carol")]
    nodes: Vec<String>,

    /// Signature scheme
    #[arg(short, long, default_value = "eddsa")]
    algo: SigningAlgo,

    /// Data directory; each node keeps its shares in a subdirectory
    #[arg(short, long, env = "TSS_DEST", default_value = "./data")]
    dest: PathBuf,

    /// Settle time before the engines start
    #[arg(long, env = "TSS_GRACE_MS", default_value = "200")]
    grace_ms: u64,

    /// Session timeout
    #[arg(long, env = "TSS_TIMEOUT_SECS", default_value = "30")]
    timeout_secs: u64,

    /// Accounts whose traffic is dropped
    #[arg(long)]
    silent: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run distributed key generation
    Keygen {
        #[arg(short, long, default_value = "main")]
        key_id: String,

        #[arg(short, long, default_value = "1")]
        epoch: u64,
    },

    /// Sign a message
    Sign {
        #[arg(short, long, default_value = "main")]
        key_id: String,

        #[arg(short, long, default_value = "1")]
        epoch: u64,

        /// Message to sign (hex; a 32-byte digest for ecdsa)
        #[arg(short, long)]
        message: String,
    },

    /// Hand the key over to a new committee
    Reshare {
        #[arg(short, long, default_value = "main")]
        key_id: String,

        #[arg(short, long, default_value = "1")]
        epoch: u64,

        #[arg(long)]
        new_epoch: u64,

        /// New committee (comma-separated)
        #[arg(long, value_delimiter = ',')]
        new_nodes: Vec<String>,
    },

    /// Show stored key shares
    Info {
        #[arg(short, long, default_value = "main")]
        key_id: String,

        #[arg(short, long, default_value = "1")]
        epoch: u64,
    },
}

/// In-process committee sharing one network and one election record
struct Simulation {
    network: Arc<MemoryNetwork>,
    committer: Arc<ElectionCommitter>,
    config: DispatcherConfig,
    dest: PathBuf,
}

impl Simulation {
    fn new(cli: &Cli) -> Result<Self> {
        let config = DispatcherConfig::default()
            .with_grace_delay(Duration::from_millis(cli.grace_ms))
            .with_session_timeout(Duration::from_secs(cli.timeout_secs));
        config.validate()?;

        let network = MemoryNetwork::new();
        for account in &cli.silent {
            network.mute(account);
        }

        Ok(Self {
            network,
            committer: Arc::new(ElectionCommitter::new()),
            config,
            dest: cli.dest.clone(),
        })
    }

    fn keystore(&self, account: &str) -> FileKeystore {
        FileKeystore::new(self.dest.join(account))
    }

    fn context(&self, account: &str) -> NodeContext {
        NodeContext::new(
            account,
            Arc::new(self.network.endpoint(account)),
            Arc::new(self.keystore(account)),
            self.committer.clone(),
        )
        .with_config(self.config.clone())
    }

    /// Run `request` on every node in `accounts` and print the commitments
    async fn run(&self, accounts: &[String], request: SessionRequest) -> Result<Vec<Outcome>> {
        info!(session_id = request.session_id(), nodes = accounts.len(), "Opening session");

        let sessions: Vec<Arc<dyn Dispatcher>> = accounts
            .iter()
            .map(|account| {
                let session = dispatcher_for(request.clone(), self.context(account));
                self.network.register(account, &session);
                session
            })
            .collect();

        for (account, started) in accounts
            .iter()
            .zip(join_all(sessions.iter().map(|s| s.start())).await)
        {
            started.with_context(|| format!("{account} failed to start"))?;
        }

        let mut outcomes = Vec::with_capacity(sessions.len());
        for (account, done) in accounts
            .iter()
            .zip(join_all(sessions.iter().map(|s| s.done())).await)
        {
            let outcome = done.with_context(|| format!("{account} failed"))?;
            println!("{account}: {}", serde_json::to_string_pretty(&outcome.commitment())?);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dest)?;
    let sim = Simulation::new(&cli)?;

    match &cli.command {
        Commands::Keygen { key_id, epoch } => {
            run_keygen(&cli, &sim, key_id, *epoch).await?;
        }
        Commands::Sign {
            key_id,
            epoch,
            message,
        } => {
            run_sign(&cli, &sim, key_id, *epoch, message).await?;
        }
        Commands::Reshare {
            key_id,
            epoch,
            new_epoch,
            new_nodes,
        } => {
            run_reshare(&cli, &sim, key_id, *epoch, *new_epoch, new_nodes).await?;
        }
        Commands::Info { key_id, epoch } => {
            show_info(&cli, &sim, key_id, *epoch).await?;
        }
    }

    Ok(())
}

fn session_params(cli: &Cli, key_id: &str, epoch: u64) -> SessionParams {
    SessionParams {
        session_id: uuid::Uuid::new_v4().to_string(),
        key_id: key_id.to_string(),
        epoch,
        block_height: 0,
        algo: cli.algo,
        participants: cli.nodes.clone(),
    }
}

async fn run_keygen(cli: &Cli, sim: &Simulation, key_id: &str, epoch: u64) -> Result<()> {
    info!(nodes = ?cli.nodes, algo = %cli.algo, key_id, epoch, "Starting DKG");
    sim.committer.record_election(epoch, cli.nodes.clone());

    let request = SessionRequest::Keygen(session_params(cli, key_id, epoch));
    let outcomes = sim.run(&cli.nodes, request).await?;

    if let Some(Outcome::KeyGen(result)) = outcomes.first() {
        println!("Public Key: {}", hex::encode(&result.public_key));
    }
    Ok(())
}

async fn run_sign(
    cli: &Cli,
    sim: &Simulation,
    key_id: &str,
    epoch: u64,
    message: &str,
) -> Result<()> {
    let message = hex::decode(message).context("message must be hex")?;
    if cli.algo == SigningAlgo::Ecdsa && message.len() != 32 {
        bail!("ecdsa signs a 32-byte digest, got {} bytes", message.len());
    }

    info!(nodes = ?cli.nodes, key_id, epoch, "Starting DSG");
    let request = SessionRequest::Sign {
        params: session_params(cli, key_id, epoch),
        message,
    };
    let outcomes = sim.run(&cli.nodes, request).await?;

    if let Some(Outcome::Sign(result)) = outcomes.first() {
        println!("Signature: {}", hex::encode(&result.signature));
    }
    Ok(())
}

async fn run_reshare(
    cli: &Cli,
    sim: &Simulation,
    key_id: &str,
    epoch: u64,
    new_epoch: u64,
    new_nodes: &[String],
) -> Result<()> {
    if new_nodes.is_empty() {
        bail!("--new-nodes is required");
    }
    sim.committer.record_election(epoch, cli.nodes.clone());
    sim.committer.record_election(new_epoch, new_nodes.to_vec());

    // every node of either committee takes part
    let mut accounts = cli.nodes.clone();
    for account in new_nodes {
        if !accounts.contains(account) {
            accounts.push(account.clone());
        }
    }

    info!(old = ?cli.nodes, new = ?new_nodes, epoch, new_epoch, "Starting resharing");
    let request = SessionRequest::Reshare(ReshareParams {
        session_id: uuid::Uuid::new_v4().to_string(),
        key_id: key_id.to_string(),
        block_height: 0,
        algo: cli.algo,
        epoch,
        participants: cli.nodes.clone(),
        new_epoch,
        new_participants: new_nodes.to_vec(),
    });
    sim.run(&accounts, request).await?;
    Ok(())
}

#[derive(Serialize)]
struct ShareInfo<'a> {
    account: &'a str,
    algo: SigningAlgo,
    threshold: usize,
    share_index: u64,
    committee: Vec<&'a str>,
    public_key: String,
}

async fn show_info(cli: &Cli, sim: &Simulation, key_id: &str, epoch: u64) -> Result<()> {
    for account in &cli.nodes {
        let keystore = sim.keystore(account);
        let bytes = match keystore.get(&key_path(key_id, epoch)).await {
            Ok(bytes) => bytes,
            Err(e) => {
                println!("{account}: {e} (in {})", keystore.root().display());
                continue;
            }
        };
        let save: LocalSaveData = serde_json::from_slice(&bytes)?;
        let info = ShareInfo {
            account,
            algo: save.algo,
            threshold: save.threshold,
            share_index: save.share_index,
            committee: save.committee.iter().map(|m| m.id.as_str()).collect(),
            public_key: hex::encode(save.compressed_public_key()?),
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
    }
    Ok(())
}
