//! Upload, download, challenge and migration against TCP storage nodes
//! sharing a file-backed ledger

use dcp_core::crypto::signer::NodeKey;
use dcp_core::network::Server;
use dcp_core::storage::{
    ChallengeAlgorithm, ChallengerSettings, Copier, DataOwner, Encryptor, Health, Ledger, LocalFsStore,
    MaterialStore, MemoryChain, MerkleChallenger, PairingChallenger, Slicer, StorageNode, TcpStorageClient,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct RunningNode {
    id: String,
    stop: watch::Sender<bool>,
    server: JoinHandle<dcp_core::Result<()>>,
    heartbeat: JoinHandle<()>,
}

impl RunningNode {
    async fn stop(self) {
        self.stop.send(true).unwrap();
        self.server.await.unwrap().unwrap();
        self.heartbeat.await.unwrap();
    }
}

async fn start_node(dir: &Path, i: usize, ledger: Arc<dyn Ledger>) -> RunningNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let blobs = Arc::new(LocalFsStore::open(&dir.join(format!("node-{}", i))).unwrap());
    let node = Arc::new(StorageNode::new(NodeKey::generate(), &addr, blobs));
    node.register(ledger.as_ref()).await.unwrap();
    let (stop, stop_rx) = watch::channel(false);
    let heartbeat = node
        .clone()
        .spawn_heartbeat(ledger, Duration::from_secs(1), stop_rx.clone());
    let id = node.node_id();
    let server = tokio::spawn(Server::new(addr, node).run(listener, stop_rx));
    RunningNode {
        id,
        stop,
        server,
        heartbeat,
    }
}

fn owner(dir: &Path, key: &NodeKey, algorithm: ChallengeAlgorithm, ledger: Arc<dyn Ledger>) -> DataOwner {
    DataOwner::new(
        NodeKey::from_secret_bytes(&key.secret_bytes()).unwrap(),
        ledger,
        Arc::new(TcpStorageClient::new("owner", Duration::from_secs(3))),
        Slicer::new(512).unwrap(),
        Encryptor::new(&key.secret_bytes()).unwrap(),
        Copier {
            replicas: 2,
            quorum: 2,
            max_retries: 2,
        },
        ChallengerSettings {
            algorithm,
            interval: Duration::from_secs(3600),
            strike_threshold: 2,
            merkle: MerkleChallenger {
                ranges: 6,
                segment_size: 4,
                shrink_size: 64,
            },
            pairing: PairingChallenger {
                sample_count: 2,
                tag_rounds: 3,
            },
        },
        MaterialStore::open(&dir.join("materials")).unwrap(),
    )
    .unwrap()
}

fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dcp-lifecycle-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 131) % 256) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_merkle_lifecycle_with_migration() {
    let dir = test_dir();
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryChain::open(&dir.join("ledger.json"), Duration::from_secs(1)).unwrap());
    let mut nodes = Vec::new();
    for i in 0..3 {
        nodes.push(start_node(&dir, i, ledger.clone()).await);
    }
    let key = NodeKey::generate();
    let data = payload(2000);

    let file_id = {
        let first = owner(&dir, &key, ChallengeAlgorithm::Merkle, ledger.clone());
        let record = first.upload("report.bin", "team", &data[..], 3).await.unwrap();
        assert_eq!(record.slices.len(), 4);
        record.file_id
    };

    // a fresh owner reopens the persisted materials
    let second = owner(&dir, &key, ChallengeAlgorithm::Merkle, ledger.clone());
    assert_eq!(second.files().unwrap().len(), 1);
    assert_eq!(second.download(&file_id).await.unwrap(), data);
    let bundles = second.challenge_file(&file_id).await.unwrap();
    assert!(bundles.iter().all(|b| b.passed), "{:?}", bundles);

    let record = ledger.get_file(&file_id).await.unwrap();
    let victim_id = record.nodes()[0].clone();
    let pos = nodes.iter().position(|n| n.id == victim_id).unwrap();
    nodes.remove(pos).stop().await;

    let round1 = second.challenge_file(&file_id).await.unwrap();
    assert!(!round1.iter().find(|b| b.node_id == victim_id).unwrap().passed);
    let round2 = second.challenge_file(&file_id).await.unwrap();
    assert_eq!(
        round2.iter().find(|b| b.node_id == victim_id).unwrap().node_health,
        Health::Bad
    );

    let migrated = ledger.get_file(&file_id).await.unwrap();
    assert_eq!(migrated.version, 2);
    assert!(!migrated.nodes().contains(&victim_id));
    assert_eq!(second.download(&file_id).await.unwrap(), data);

    second.delete(&file_id).await.unwrap();
    assert!(second.files().unwrap().is_empty());
    for n in nodes {
        n.stop().await;
    }
    let listed = ledger.list_nodes().await.unwrap();
    assert!(listed.iter().all(|n| !n.online));
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pairing_lifecycle() {
    let dir = test_dir();
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryChain::open(&dir.join("ledger.json"), Duration::from_secs(1)).unwrap());
    let mut nodes = Vec::new();
    for i in 0..2 {
        nodes.push(start_node(&dir, i, ledger.clone()).await);
    }
    let key = NodeKey::generate();
    let data = payload(1500);
    let owner = owner(&dir, &key, ChallengeAlgorithm::Pairing, ledger.clone());
    let record = owner.upload("model.bin", "team", &data[..], 3).await.unwrap();
    assert!(record.pdp_pubkey.is_some());

    for _ in 0..4 {
        let bundles = owner.challenge_file(&record.file_id).await.unwrap();
        assert_eq!(bundles.len(), 2);
        assert!(bundles.iter().all(|b| b.passed), "{:?}", bundles);
    }
    assert_eq!(owner.download(&record.file_id).await.unwrap(), data);

    for n in nodes {
        n.stop().await;
    }
    let _ = std::fs::remove_dir_all(&dir);
}
