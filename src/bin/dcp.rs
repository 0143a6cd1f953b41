//! DCP command line
//!
//! Commands:
//!   dcp -c <config> run        start the configured storage or data owner node
//!   dcp -c <config> upload     slice, encrypt and replicate a file
//!   dcp -c <config> download   fetch and verify a file
//!   dcp -c <config> challenge  run one challenge round for a file
//!   dcp -c <config> train      run this party's half of a training task
//!   dcp keygen                 create or show a node key
//!   dcp shamir                 split or recover a secret
//!   dcp demo                   PSI + VFL + storage round trip in one process

use clap::{Parser, Subcommand};
use dcp_core::config::{DataOwnerSettings, MpcSettings, NodeType, Settings, StorageSettings};
use dcp_core::crypto::shamir::{self, Share};
use dcp_core::crypto::signer::NodeKey;
use dcp_core::error::{DcpError, Result};
use dcp_core::mpc::{LocalTransport, MemoryResults, MpcNode, NodeConfig, PeerPool, StepHandler};
use dcp_core::network::Server;
use dcp_core::storage::{
    ChallengeAlgorithm, ChallengerSettings, Copier, DataOwner, Encryptor, LocalFsStore, LocalStorageNetwork, Ledger,
    MaterialStore, MemoryChain, MemoryStore, MerkleChallenger, Slicer, StorageNode, TcpStorageClient,
};
use dcp_core::vfl::{Algorithm, DataSet, TrainParams, TrainTask};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Parser)]
#[command(version, about("Data collaboration platform node"), long_about = None)]
struct Cli {
    /// Node configuration (TOML or JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the configured node and serve until interrupted
    Run,
    /// Upload a file as the configured data owner
    Upload {
        file: PathBuf,
        #[arg(long, default_value = "default")]
        ns: String,
        #[arg(long, default_value_t = 30)]
        expire_days: u32,
    },
    /// Download a file into `out`
    Download { file_id: String, out: PathBuf },
    /// Challenge every node holding a file once
    Challenge { file_id: String },
    /// Run one party of a training task and wait for its model
    Train {
        /// TrainTask as JSON
        #[arg(long)]
        task: PathBuf,
        /// CSV dataset of this party
        #[arg(long)]
        data: PathBuf,
    },
    /// Create a node key, or print the id of an existing one
    Keygen {
        #[arg(short, long, default_value = "dcp-node.key")]
        out: PathBuf,
    },
    /// Threshold secret sharing
    Shamir {
        #[command(subcommand)]
        action: ShamirAction,
    },
    /// PSI, two-party training and a storage round trip in one process
    Demo,
}

#[derive(Subcommand)]
enum ShamirAction {
    /// Split a hex secret into shares, printed as JSON
    Split {
        #[arg(long)]
        secret: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long, default_value_t = 3)]
        threshold: usize,
    },
    /// Recover the hex secret from a JSON file of shares
    Recover { shares: PathBuf },
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = path.ok_or_else(|| DcpError::Param("this command needs -c <config>".into()))?;
    Settings::load(path)
}

fn open_ledger(path: Option<&Path>, heartbeat: Duration) -> Result<Arc<dyn Ledger>> {
    match path {
        Some(p) => Ok(Arc::new(MemoryChain::open(p, heartbeat)?)),
        None => {
            warn!("no ledger_path configured; the ledger lives in this process only");
            Ok(Arc::new(MemoryChain::new(heartbeat)))
        }
    }
}

fn build_owner(s: &DataOwnerSettings) -> Result<Arc<DataOwner>> {
    let key = NodeKey::load_or_create(&s.key_path)?;
    let password = match &s.encryptor.password {
        Some(p) => p.as_bytes().to_vec(),
        None => key.secret_bytes(),
    };
    let ledger = open_ledger(s.ledger_path.as_deref(), s.monitor.interval())?;
    let client = Arc::new(TcpStorageClient::new(&s.address, s.rpc_timeout()));
    let owner = DataOwner::new(
        key,
        ledger,
        client,
        Slicer::new(s.slicer.block_size)?,
        Encryptor::new(&password)?,
        s.copier(),
        s.challenger(),
        MaterialStore::open(&s.challenger.merkle.material_root)?,
    )?;
    Ok(Arc::new(owner))
}

async fn shutdown_signal(stop: &watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {}", e);
    }
    info!("shutting down");
    let _ = stop.send(true);
}

async fn run_storage(s: &StorageSettings) -> Result<()> {
    let key = NodeKey::load_or_create(&s.key_path)?;
    let ledger = open_ledger(s.ledger_path.as_deref(), s.monitor.interval())?;
    let blobs = Arc::new(LocalFsStore::open(&s.blob_root)?);
    let node = Arc::new(StorageNode::new(key, &s.address, blobs));
    node.register(ledger.as_ref()).await?;
    info!("storage node {} listening on {}", node.node_id(), s.address);

    let listener = TcpListener::bind(&s.address).await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let heartbeat = s
        .monitor
        .enabled
        .then(|| node.clone().spawn_heartbeat(ledger.clone(), s.monitor.interval(), stop_rx.clone()));
    let server = tokio::spawn(Server::new(s.address.clone(), node).run(listener, stop_rx));
    shutdown_signal(&stop_tx).await;
    server.await??;
    if let Some(h) = heartbeat {
        h.await?;
    }
    Ok(())
}

async fn start_mpc(s: &MpcSettings, results: Arc<dyn dcp_core::mpc::ResultHandler>, stop: watch::Receiver<bool>) -> Result<(MpcNode, Arc<PeerPool>)> {
    let pool = Arc::new(PeerPool::new(&s.address, &s.peers, s.pool_config()));
    let node = MpcNode::start(s.node_config(), pool.clone(), results);
    let listener = TcpListener::bind(&s.address).await?;
    tokio::spawn(Server::new(s.address.clone(), node.handler()).run(listener, stop));
    info!("MPC node listening on {}", s.address);
    Ok((node, pool))
}

async fn run_owner(settings: &Settings) -> Result<()> {
    let s = settings.data_owner()?;
    let owner = build_owner(s)?;
    info!("data owner {} started", owner.owner_id());
    let (stop_tx, stop_rx) = watch::channel(false);
    let challenges = owner
        .clone()
        .spawn_challenge_loop(s.challenger().interval, stop_rx.clone());
    let mpc = match &settings.mpc {
        Some(m) => {
            let results = Arc::new(dcp_core::mpc::FileResults::new(&m.result_dir)?);
            Some(start_mpc(m, results, stop_rx).await?)
        }
        None => None,
    };
    shutdown_signal(&stop_tx).await;
    challenges.await?;
    if let Some((_, pool)) = mpc {
        pool.shutdown().await;
    }
    Ok(())
}

async fn train(settings: &Settings, task: &Path, data: &Path) -> Result<()> {
    let m = settings
        .mpc
        .as_ref()
        .ok_or_else(|| DcpError::Param("training needs an mpc block".into()))?;
    let task: TrainTask = serde_json::from_str(&std::fs::read_to_string(task)?)?;
    let dataset = DataSet::from_csv_path(data, task.algorithm, &task.params)?;
    let results = Arc::new(MemoryResults::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let (node, pool) = start_mpc(m, results.clone(), stop_rx).await?;
    node.start_train(task.clone(), dataset).await?;

    let task_id = task.task_id.clone();
    let outcome = results
        .wait_for(Duration::from_secs(24 * 3600), |o| {
            if let Some(model) = o.models.get(&task_id) {
                return Some(Ok(model.clone()));
            }
            o.failures
                .get(&task_id)
                .map(|body| Err(DcpError::from_body(body.clone())))
        })
        .await
        .ok_or_else(|| DcpError::Internal(format!("task {} did not finish", task_id)))?;
    let model = outcome?;
    std::fs::create_dir_all(&m.result_dir)?;
    let path = m.result_dir.join(format!("{}.model.json", task_id));
    model.save(&path)?;
    info!("task {} finished after {} rounds, model at {}", task_id, model.rounds, path.display());
    pool.shutdown().await;
    let _ = stop_tx.send(true);
    Ok(())
}

fn shamir_command(action: ShamirAction) -> Result<()> {
    match action {
        ShamirAction::Split {
            secret,
            count,
            threshold,
        } => {
            let shares = shamir::split(&hex::decode(secret.trim())?, count, threshold)?;
            println!("{}", serde_json::to_string_pretty(&shares)?);
        }
        ShamirAction::Recover { shares } => {
            let shares: Vec<Share> = serde_json::from_str(&std::fs::read_to_string(shares)?)?;
            println!("{}", hex::encode(shamir::recover(&shares)?));
        }
    }
    Ok(())
}

/// Party A holds `f`, party B holds `g` and `y = 2f + 3g + 1`; B lists
/// its rows in another order and has a few ids A lacks
fn demo_datasets(n: usize) -> (DataSet, DataSet) {
    let ids: Vec<String> = (0..n).map(|i| format!("user-{:03}", i)).collect();
    let f: Vec<f64> = (0..n).map(|i| (i % 7) as f64).collect();
    let g: Vec<f64> = (0..n).map(|i| ((i * 3) % 5) as f64).collect();
    let a = DataSet {
        id_name: "id".into(),
        ids: ids.clone(),
        features: vec!["f".into()],
        rows: f.iter().map(|v| vec![*v]).collect(),
        label: None,
        labels: None,
    };
    let mut b_ids: Vec<String> = ids.iter().rev().cloned().collect();
    let mut b_rows: Vec<Vec<f64>> = g.iter().rev().map(|v| vec![*v]).collect();
    let mut b_labels: Vec<f64> = f
        .iter()
        .zip(&g)
        .rev()
        .map(|(f, g)| 2.0 * f + 3.0 * g + 1.0)
        .collect();
    for extra in 0..3 {
        b_ids.push(format!("only-b-{}", extra));
        b_rows.push(vec![1.0]);
        b_labels.push(0.0);
    }
    let b = DataSet {
        id_name: "id".into(),
        ids: b_ids,
        features: vec!["g".into()],
        rows: b_rows,
        label: Some("y".into()),
        labels: Some(b_labels),
    };
    (a, b)
}

async fn demo() -> Result<()> {
    info!("== two-party training over the in-process transport ==");
    let net = LocalTransport::new();
    let results_a = Arc::new(MemoryResults::new());
    let results_b = Arc::new(MemoryResults::new());
    let config = |local: &str| NodeConfig {
        local: local.into(),
        paillier_bits: 256,
        ..NodeConfig::default()
    };
    let a = MpcNode::start(config("A"), Arc::new(net.endpoint("A")), results_a.clone());
    let b = MpcNode::start(config("B"), Arc::new(net.endpoint("B")), results_b.clone());
    let handler_a: Arc<StepHandler> = a.handler();
    let handler_b: Arc<StepHandler> = b.handler();
    net.register("A", Arc::downgrade(&handler_a));
    net.register("B", Arc::downgrade(&handler_b));

    let task = |peer: &str, tag: bool| TrainTask {
        task_id: "demo-linreg".into(),
        algorithm: Algorithm::LinRegVL,
        params: TrainParams {
            alpha: 0.5,
            label: "y".into(),
            is_tag_part: tag,
            max_rounds: 60,
            ..TrainParams::default()
        },
        peer: peer.into(),
        eval_params: None,
        lival_params: None,
    };
    let (da, db) = demo_datasets(40);
    a.start_train(task("B", false), da).await?;
    b.start_train(task("A", true), db).await?;
    let wait = Duration::from_secs(600);
    for (name, results) in [("A", &results_a), ("B", &results_b)] {
        let model = results
            .wait_for(wait, |o| o.models.get("demo-linreg").cloned())
            .await
            .ok_or_else(|| DcpError::Internal(format!("party {} produced no model", name)))?;
        info!(
            "party {}: {} rounds, cost {:.6}, thetas {:?}",
            name, model.rounds, model.final_cost, model.thetas
        );
    }

    info!("== storage round trip over in-process storage nodes ==");
    let chain = Arc::new(MemoryChain::new(Duration::from_secs(60)));
    let storage = Arc::new(LocalStorageNetwork::new());
    for i in 0..4 {
        let node = Arc::new(StorageNode::new(
            NodeKey::generate(),
            &format!("storage-{}", i),
            Arc::new(MemoryStore::new()),
        ));
        node.register(chain.as_ref()).await?;
        storage.add(node);
    }
    let owner = DataOwner::new(
        NodeKey::generate(),
        chain.clone(),
        storage.clone(),
        Slicer::new(1024)?,
        Encryptor::new(b"demo password")?,
        Copier::default(),
        ChallengerSettings {
            algorithm: ChallengeAlgorithm::Merkle,
            merkle: MerkleChallenger {
                ranges: 5,
                ..MerkleChallenger::default()
            },
            ..ChallengerSettings::default()
        },
        MaterialStore::in_memory(),
    )?;
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 256) as u8).collect();
    let record = owner.upload("demo.bin", "demo", &payload[..], 1).await?;
    info!(
        "uploaded {} as {} slices on {} nodes",
        record.file_id,
        record.slices.len(),
        record.nodes().len()
    );
    let back = owner.download(&record.file_id).await?;
    if back != payload {
        return Err(DcpError::Internal("downloaded bytes differ from the upload".into()));
    }
    let bundles = owner.challenge_file(&record.file_id).await?;
    info!(
        "challenge round: {}/{} nodes passed",
        bundles.iter().filter(|b| b.passed).count(),
        bundles.len()
    );
    Ok(())
}

async fn execute(cli: Cli) -> Result<()> {
    let config = cli.config.as_deref();
    match cli.command {
        Command::Run => {
            let settings = load_settings(config)?;
            match settings.node_type {
                NodeType::Storage => run_storage(settings.storage()?).await,
                NodeType::DataOwner => run_owner(&settings).await,
            }
        }
        Command::Upload {
            file,
            ns,
            expire_days,
        } => {
            let settings = load_settings(config)?;
            let owner = build_owner(settings.data_owner()?)?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let reader = std::io::BufReader::new(std::fs::File::open(&file)?);
            let record = owner.upload(&name, &ns, reader, expire_days).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Download { file_id, out } => {
            let settings = load_settings(config)?;
            let owner = build_owner(settings.data_owner()?)?;
            let data = owner.download(&file_id).await?;
            std::fs::write(&out, &data)?;
            info!("wrote {} bytes to {}", data.len(), out.display());
            Ok(())
        }
        Command::Challenge { file_id } => {
            let settings = load_settings(config)?;
            let owner = build_owner(settings.data_owner()?)?;
            let bundles = owner.challenge_file(&file_id).await?;
            println!("{}", serde_json::to_string_pretty(&bundles)?);
            Ok(())
        }
        Command::Train { task, data } => {
            let settings = load_settings(config)?;
            train(&settings, &task, &data).await
        }
        Command::Keygen { out } => {
            let key = NodeKey::load_or_create(&out)?;
            println!("{}", key.id_hex());
            Ok(())
        }
        Command::Shamir { action } => shamir_command(action),
        Command::Demo => demo().await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = cli
        .config
        .as_deref()
        .and_then(|p| Settings::load(p).ok())
        .map(|s| s.log.level)
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    if let Err(e) = execute(cli).await {
        eprintln!("{}", e.to_json());
        std::process::exit(-1);
    }
}
