//! Multi-node sessions over the in-memory network

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tss_dispatcher::participant::get_threshold;
use tss_dispatcher::{
    dispatcher_for, key_path, CommitmentKind, DispatchError, Dispatcher, DispatcherConfig,
    ElectionCommitter, Keystore, MemoryKeystore, MemoryNetwork, NodeContext, Outcome,
    ReshareParams, SessionParams, SessionRequest, SessionStatus, SetCommitter,
};
use tss_engine::{LocalSaveData, SigningAlgo};

const KEY_ID: &str = "main";

struct Node {
    account: String,
    keystore: Arc<MemoryKeystore>,
}

struct Cluster {
    network: Arc<MemoryNetwork>,
    committer: Arc<ElectionCommitter>,
    config: DispatcherConfig,
    nodes: Vec<Node>,
}

impl Cluster {
    fn new(accounts: &[&str], timeout: Duration) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        Self {
            network: MemoryNetwork::new(),
            committer: Arc::new(ElectionCommitter::new()),
            config: DispatcherConfig::default()
                .with_grace_delay(Duration::from_millis(50))
                .with_session_timeout(timeout),
            nodes: accounts
                .iter()
                .map(|a| Node {
                    account: a.to_string(),
                    keystore: Arc::new(MemoryKeystore::new()),
                })
                .collect(),
        }
    }

    fn node(&self, account: &str) -> &Node {
        self.nodes.iter().find(|n| n.account == account).unwrap()
    }

    fn context(&self, account: &str) -> NodeContext {
        let node = self.node(account);
        NodeContext::new(
            account,
            Arc::new(self.network.endpoint(account)),
            node.keystore.clone(),
            self.committer.clone(),
        )
        .with_config(self.config.clone())
    }

    /// Share persisted by `account` for `epoch`
    async fn stored_share(&self, account: &str, epoch: u64) -> LocalSaveData {
        let bytes = self
            .node(account)
            .keystore
            .get(&key_path(KEY_ID, epoch))
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// One registered session per account
    fn open(&self, accounts: &[&str], request: &SessionRequest) -> Vec<Arc<dyn Dispatcher>> {
        accounts
            .iter()
            .map(|account| {
                let session = dispatcher_for(request.clone(), self.context(account));
                self.network.register(account, &session);
                session
            })
            .collect()
    }

    /// Start every session together, then wait for all of them
    async fn run(&self, sessions: &[Arc<dyn Dispatcher>]) -> Vec<Outcome> {
        let started = join_all(sessions.iter().map(|s| s.start())).await;
        for result in started {
            result.unwrap();
        }
        join_all(sessions.iter().map(|s| s.done()))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    async fn keygen(&self, accounts: &[&str], algo: SigningAlgo, epoch: u64) -> Vec<u8> {
        let request = SessionRequest::Keygen(params(&format!("keygen-{epoch}"), accounts, algo, epoch));
        let outcomes = self.run(&self.open(accounts, &request)).await;
        match &outcomes[0] {
            Outcome::KeyGen(result) => result.public_key.clone(),
            other => panic!("keygen failed: {other:?}"),
        }
    }
}

fn strings(accounts: &[&str]) -> Vec<String> {
    accounts.iter().map(|a| a.to_string()).collect()
}

fn params(session_id: &str, accounts: &[&str], algo: SigningAlgo, epoch: u64) -> SessionParams {
    SessionParams {
        session_id: session_id.to_string(),
        key_id: KEY_ID.to_string(),
        epoch,
        block_height: 1000 + epoch,
        algo,
        participants: strings(accounts),
    }
}

fn verify_eddsa(public_key: &[u8], message: &[u8], signature: &[u8]) {
    let public_key: [u8; 32] = public_key.try_into().unwrap();
    let signature: [u8; 64] = signature.try_into().unwrap();
    VerifyingKey::from_bytes(&public_key)
        .unwrap()
        .verify(message, &Signature::from_bytes(&signature))
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ecdsa_keygen_three_parties() {
    let accounts = ["alice", "bob", "carol"];
    let cluster = Cluster::new(&accounts, Duration::from_secs(5));
    cluster.committer.record_election(1, strings(&accounts));

    let request = SessionRequest::Keygen(params("kg", &accounts, SigningAlgo::Ecdsa, 1));
    let sessions = cluster.open(&accounts, &request);
    let outcomes = cluster.run(&sessions).await;

    let expected_digest = cluster.committer.set_to_commitment(&strings(&accounts), 1);
    let mut keys = Vec::new();
    for (outcome, account) in outcomes.iter().zip(accounts) {
        let Outcome::KeyGen(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(result.public_key.len(), 33);
        assert_eq!(result.digest, expected_digest);
        assert!(cluster.node(account).keystore.contains(&key_path(KEY_ID, 1)));

        let share = cluster.stored_share(account, 1).await;
        assert_eq!(share.threshold, get_threshold(accounts.len()).unwrap() + 1);
        assert_eq!(share.threshold, 2);

        let commitment = outcome.commitment();
        assert_eq!(commitment.kind, CommitmentKind::Keygen);
        assert_eq!(commitment.public_key, Some(hex::encode(&result.public_key)));
        assert_eq!(commitment.epoch, 1);
        assert_eq!(commitment.block_height, 1001);
        keys.push(result.public_key.clone());
    }
    assert!(keys.windows(2).all(|w| w[0] == w[1]));
    assert!(sessions.iter().all(|s| s.status() == SessionStatus::Completed));

    // the outcome is handed out once
    assert!(matches!(
        sessions[0].done().await,
        Err(DispatchError::AlreadyAwaited)
    ));
    assert!(matches!(
        sessions[0].start().await,
        Err(DispatchError::AlreadyStarted)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eddsa_keygen_then_sign() {
    let accounts = ["alice", "bob", "carol"];
    let cluster = Cluster::new(&accounts, Duration::from_secs(5));
    let public_key = cluster.keygen(&accounts, SigningAlgo::Eddsa, 1).await;
    assert_eq!(public_key.len(), 32);

    let message = b"validator set update".to_vec();
    let request = SessionRequest::Sign {
        params: params("sign", &accounts, SigningAlgo::Eddsa, 1),
        message: message.clone(),
    };
    let outcomes = cluster.run(&cluster.open(&accounts, &request)).await;

    for outcome in &outcomes {
        let Outcome::Sign(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        verify_eddsa(&public_key, &message, &result.signature);
        assert_eq!(result.message, message);

        let commitment = outcome.commitment();
        assert_eq!(commitment.kind, CommitmentKind::SignResult);
        assert!(commitment.public_key.is_none());
        assert!(commitment.commitment.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ecdsa_signatures_agree_across_nodes() {
    let accounts = ["alice", "bob", "carol"];
    let cluster = Cluster::new(&accounts, Duration::from_secs(5));
    cluster.keygen(&accounts, SigningAlgo::Ecdsa, 1).await;

    let request = SessionRequest::Sign {
        params: params("sign", &accounts, SigningAlgo::Ecdsa, 1),
        message: vec![0x5a; 32],
    };
    let outcomes = cluster.run(&cluster.open(&accounts, &request)).await;

    let signatures: Vec<Vec<u8>> = outcomes
        .iter()
        .map(|outcome| match outcome {
            Outcome::Sign(result) => result.signature.clone(),
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));

    let parsed = k256::ecdsa::Signature::from_der(&signatures[0]).unwrap();
    assert!(parsed.normalize_s().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sign_without_key_fails_to_start() {
    let accounts = ["alice", "bob", "carol"];
    let cluster = Cluster::new(&accounts, Duration::from_secs(5));

    let request = SessionRequest::Sign {
        params: params("sign", &accounts, SigningAlgo::Ecdsa, 4),
        message: vec![1; 32],
    };
    let session = cluster.open(&["alice"], &request).remove(0);

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, DispatchError::KeyNotFound { epoch: 4, .. }));
    assert!(err.is_configuration());
    assert_eq!(session.status(), SessionStatus::Created);
    assert!(matches!(session.done().await, Err(DispatchError::NotStarted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sign_rejects_foreign_algorithm_and_bad_digest() {
    let accounts = ["alice", "bob", "carol"];
    let cluster = Cluster::new(&accounts, Duration::from_secs(5));
    cluster.keygen(&accounts, SigningAlgo::Ecdsa, 1).await;

    let request = SessionRequest::Sign {
        params: params("sign-ed", &accounts, SigningAlgo::Eddsa, 1),
        message: b"hello".to_vec(),
    };
    let session = cluster.open(&["alice"], &request).remove(0);
    assert!(session.start().await.unwrap_err().is_configuration());

    let request = SessionRequest::Sign {
        params: params("sign-short", &accounts, SigningAlgo::Ecdsa, 1),
        message: vec![1; 20],
    };
    let session = cluster.open(&["alice"], &request).remove(0);
    assert!(matches!(
        session.start().await,
        Err(DispatchError::InvalidConfig(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_self_fails_to_start() {
    let cluster = Cluster::new(&["alice", "bob", "carol", "mallory"], Duration::from_secs(5));
    let request = SessionRequest::Keygen(params(
        "kg",
        &["alice", "bob", "carol"],
        SigningAlgo::Eddsa,
        1,
    ));
    let session = cluster.open(&["mallory"], &request).remove(0);
    assert!(matches!(
        session.start().await,
        Err(DispatchError::SelfNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_keygen_timeout_blames_silent_peer() {
    let accounts = ["alice", "bob", "carol"];
    let cluster = Cluster::new(&accounts, Duration::from_millis(500));
    cluster.committer.record_election(1, strings(&accounts));
    cluster.network.mute("carol");

    let request = SessionRequest::Keygen(params("kg", &accounts, SigningAlgo::Eddsa, 1));
    let sessions = cluster.open(&accounts, &request);
    let outcomes = cluster.run(&sessions).await;

    for (outcome, session) in outcomes.iter().zip(&sessions).take(2) {
        let Outcome::Timeout(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(result.culprits, vec!["carol".to_string()]);
        assert_eq!(session.status(), SessionStatus::TimedOut);

        let commitment = outcome.commitment();
        assert_eq!(commitment.kind, CommitmentKind::Blame);
        assert_eq!(
            commitment.commitment,
            cluster.committer.set_to_commitment(&strings(&["carol"]), 1)
        );
    }
    assert!(!cluster.node("alice").keystore.contains(&key_path(KEY_ID, 1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshare_timeout_blames_silent_new_member() {
    let old = ["alice", "bob", "carol", "dave", "erin"];
    let new = ["alice", "bob", "carol", "frank"];
    let everyone = ["alice", "bob", "carol", "dave", "erin", "frank"];

    let mut cluster = Cluster::new(&everyone, Duration::from_secs(5));
    cluster.keygen(&old, SigningAlgo::Ecdsa, 2).await;

    cluster.config = cluster
        .config
        .clone()
        .with_session_timeout(Duration::from_millis(600));
    cluster.network.mute("frank");

    let request = SessionRequest::Reshare(ReshareParams {
        session_id: "reshare".into(),
        key_id: KEY_ID.into(),
        block_height: 2000,
        algo: SigningAlgo::Ecdsa,
        epoch: 2,
        participants: strings(&old),
        new_epoch: 3,
        new_participants: strings(&new),
    });
    let sessions = cluster.open(&everyone, &request);
    let outcomes = cluster.run(&sessions).await;

    // frank's own session is muted too; every other node blames only frank
    for outcome in &outcomes[..5] {
        let Outcome::Timeout(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(result.culprits, vec!["frank".to_string()]);
        assert_eq!(result.header.epoch, 3);
    }
    for account in &new[..3] {
        assert!(!cluster.node(account).keystore.contains(&key_path(KEY_ID, 3)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshare_to_larger_committee_keeps_key() {
    let old = ["alice", "bob", "carol"];
    let new = ["alice", "bob", "carol", "dave"];

    let cluster = Cluster::new(&new, Duration::from_secs(5));
    cluster.committer.record_election(3, strings(&new));
    let public_key = cluster.keygen(&old, SigningAlgo::Eddsa, 2).await;

    let request = SessionRequest::Reshare(ReshareParams {
        session_id: "reshare".into(),
        key_id: KEY_ID.into(),
        block_height: 2000,
        algo: SigningAlgo::Eddsa,
        epoch: 2,
        participants: strings(&old),
        new_epoch: 3,
        new_participants: strings(&new),
    });
    let outcomes = cluster.run(&cluster.open(&new, &request)).await;

    let expected_digest = cluster.committer.set_to_commitment(&strings(&new), 3);
    for (outcome, account) in outcomes.iter().zip(new) {
        let Outcome::Reshare(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(result.digest, expected_digest);
        assert!(cluster.node(account).keystore.contains(&key_path(KEY_ID, 3)));

        // the new committee's engines run one above GetThreshold(4)
        let share = cluster.stored_share(account, 3).await;
        assert_eq!(share.threshold, get_threshold(new.len()).unwrap() + 1);
        assert_eq!(share.threshold, 3);
        assert_eq!(share.committee.len(), new.len());

        let commitment = outcome.commitment();
        assert_eq!(commitment.kind, CommitmentKind::Reshare);
        assert_eq!(commitment.epoch, 3);
        assert!(commitment.public_key.is_none());
    }

    // the new committee signs under the original key
    let message = b"epoch 3 checkpoint".to_vec();
    let request = SessionRequest::Sign {
        params: params("sign-3", &new, SigningAlgo::Eddsa, 3),
        message: message.clone(),
    };
    let outcomes = cluster.run(&cluster.open(&new, &request)).await;
    for outcome in &outcomes {
        let Outcome::Sign(result) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        verify_eddsa(&public_key, &message, &result.signature);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshare_old_only_member_ends_by_timeout() {
    let old = ["alice", "bob", "carol"];
    let new = ["bob", "carol", "dave"];
    let everyone = ["alice", "bob", "carol", "dave"];

    let mut cluster = Cluster::new(&everyone, Duration::from_secs(5));
    cluster.committer.record_election(3, strings(&new));
    let public_key = cluster.keygen(&old, SigningAlgo::Ecdsa, 2).await;

    cluster.config = cluster
        .config
        .clone()
        .with_session_timeout(Duration::from_millis(1500));

    let request = SessionRequest::Reshare(ReshareParams {
        session_id: "reshare".into(),
        key_id: KEY_ID.into(),
        block_height: 2000,
        algo: SigningAlgo::Ecdsa,
        epoch: 2,
        participants: strings(&old),
        new_epoch: 3,
        new_participants: strings(&new),
    });
    let sessions = cluster.open(&everyone, &request);
    let outcomes = cluster.run(&sessions).await;

    // alice only deals; with every ack in she still has nobody to blame
    let Outcome::Timeout(result) = &outcomes[0] else {
        panic!("unexpected outcome {:?}", outcomes[0]);
    };
    assert!(result.culprits.is_empty());
    assert_eq!(result.header.epoch, 3);
    assert_eq!(sessions[0].status(), SessionStatus::TimedOut);
    assert_eq!(outcomes[0].commitment().kind, CommitmentKind::Blame);
    assert!(!cluster.node("alice").keystore.contains(&key_path(KEY_ID, 3)));

    for (outcome, account) in outcomes[1..].iter().zip(new) {
        assert!(matches!(outcome, Outcome::Reshare(_)), "{account}: {outcome:?}");
        let share = cluster.stored_share(account, 3).await;
        assert_eq!(share.compressed_public_key().unwrap(), public_key);
    }
}
