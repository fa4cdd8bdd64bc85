//! End-to-end pipeline tests against an in-process mock mail server.
//!
//! The mock server speaks the real line-delimited JSON-RPC protocol
//! over a real TCP socket; the wallet and chain directory are
//! deterministic in-memory fakes. The "encryption" wraps the
//! plaintext message in a sealed envelope verbatim, so round-trips
//! exercise the genuine classify/merge paths without key material.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use chainmail_client::{
    AccountRecord, ChainDirectory, MailClient, Wallet, WalletAccount,
};
use chainmail_protocol::hash::address_of_key;
use chainmail_protocol::message::{EmailPayload, Message, TransactionNoticePayload};
use chainmail_storage::{MailDb, ProcessingRecord};
use chainmail_types::config::MailConfig;
use chainmail_types::{
    Address, MailError, MailEvent, MailStatus, MessageId, MessageKind, PublicKey, Result,
    ServerSet, Timestamp,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns a unique temporary directory for each test.
fn temp_dir() -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "chainmail-pipeline-test-{}-{}-{}",
        std::process::id(),
        id,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    ));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// Polls `condition` every 50 ms for up to 10 s.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn next_event(rx: &mut UnboundedReceiver<MailEvent>) -> MailEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// A proof-of-work ceiling no realistic mining run will satisfy.
fn impossible_target() -> MessageId {
    let mut bytes = [0u8; 20];
    bytes[19] = 1;
    MessageId::new(bytes)
}

// ---------------------------------------------------------------------------
// Mock wallet
// ---------------------------------------------------------------------------

struct MockWallet {
    keys: HashMap<String, PublicKey>,
    labels: HashMap<PublicKey, String>,
    accounts: Vec<WalletAccount>,
    scanned: Mutex<Vec<String>>,
}

impl MockWallet {
    fn new(account_names: &[&str]) -> Self {
        let mut keys = HashMap::new();
        let mut labels = HashMap::new();
        let mut accounts = Vec::new();
        for (i, name) in account_names.iter().enumerate() {
            let key = PublicKey::new([i as u8 + 2; 33]);
            keys.insert(name.to_string(), key);
            labels.insert(key, name.to_string());
            accounts.push(WalletAccount {
                name: name.to_string(),
                address: address_of_key(&key),
                registration_date: Timestamp::from_secs(1),
            });
        }
        Self {
            keys,
            labels,
            accounts,
            scanned: Mutex::new(Vec::new()),
        }
    }

    fn key_for(&self, name: &str) -> PublicKey {
        *self.keys.get(name).expect("unknown test account")
    }

    fn scanned(&self) -> Vec<String> {
        self.scanned.lock().expect("lock").clone()
    }

    /// Seals a message the way `mail_encrypt` does.
    fn seal(&self, plaintext: &Message) -> Message {
        Message {
            kind: MessageKind::Encrypted,
            timestamp: plaintext.timestamp,
            nonce: 0,
            recipient: plaintext.recipient,
            payload: serde_json::to_vec(plaintext).expect("seal"),
        }
    }
}

impl Wallet for MockWallet {
    fn is_open(&self) -> bool {
        true
    }

    fn is_unlocked(&self) -> bool {
        true
    }

    fn mail_create(
        &self,
        from: &str,
        subject: &str,
        body: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Message> {
        let from_key = *self.keys.get(from).ok_or_else(|| MailError::WalletError {
            reason: format!("unknown account {from}"),
        })?;
        let payload = EmailPayload {
            from_key,
            subject: subject.into(),
            body: body.into(),
            reply_to,
        }
        .encode()?;
        Ok(Message {
            kind: MessageKind::Email,
            timestamp: Timestamp::now(),
            nonce: 0,
            recipient: PublicKey::default(),
            payload,
        })
    }

    fn mail_encrypt(&self, _active_key: &PublicKey, plaintext: &Message) -> Result<Message> {
        Ok(self.seal(plaintext))
    }

    fn mail_open_by_key(&self, _key: &PublicKey, ciphertext: &Message) -> Result<Message> {
        open_sealed(ciphertext)
    }

    fn mail_open_by_address(&self, _address: &Address, ciphertext: &Message) -> Result<Message> {
        open_sealed(ciphertext)
    }

    fn key_label(&self, key: &PublicKey) -> Result<String> {
        self.labels.get(key).cloned().ok_or_else(|| MailError::WalletError {
            reason: "unknown signing key".into(),
        })
    }

    fn my_accounts(&self) -> Vec<WalletAccount> {
        self.accounts.clone()
    }

    fn scan_transaction(&self, txid: &str, _unconditional: bool) -> Result<()> {
        self.scanned.lock().expect("lock").push(txid.to_string());
        Ok(())
    }
}

fn open_sealed(ciphertext: &Message) -> Result<Message> {
    if ciphertext.kind != MessageKind::Encrypted {
        return Ok(ciphertext.clone());
    }
    serde_json::from_slice(&ciphertext.payload).map_err(|e| MailError::WalletError {
        reason: format!("failed to open sealed message: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Mock chain directory
// ---------------------------------------------------------------------------

struct MockChain {
    accounts: Mutex<HashMap<String, AccountRecord>>,
}

impl MockChain {
    fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
        }
    }

    fn register_user(&self, name: &str, key: PublicKey, mail_servers: &[&str]) {
        let record = AccountRecord {
            name: name.into(),
            owner_key: key,
            active_key: key,
            registration_date: Timestamp::from_secs(1),
            public_data: serde_json::json!({ "mail_servers": mail_servers }),
        };
        self.accounts.lock().expect("lock").insert(name.into(), record);
    }

    fn register_server(&self, name: &str, endpoint: &str) {
        let record = AccountRecord {
            name: name.into(),
            owner_key: PublicKey::new([0x77; 33]),
            active_key: PublicKey::new([0x77; 33]),
            registration_date: Timestamp::from_secs(1),
            public_data: serde_json::json!({ "mail_server_endpoint": endpoint }),
        };
        self.accounts.lock().expect("lock").insert(name.into(), record);
    }
}

impl ChainDirectory for MockChain {
    fn get_account(&self, name: &str) -> Option<AccountRecord> {
        self.accounts.lock().expect("lock").get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Mock mail server
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum ServerMode {
    /// Store everything.
    Accept,
    /// Refuse every store with this error text.
    Reject(String),
    /// Refuse the first store with `timestamp_too_old`, then accept.
    StaleOnce,
}

struct ServerState {
    stored: Mutex<BTreeMap<MessageId, (Timestamp, Message)>>,
    mode: Mutex<ServerMode>,
    store_calls: AtomicU32,
}

struct MockServer {
    endpoint: String,
    state: Arc<ServerState>,
}

impl MockServer {
    async fn start(mode: ServerMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let endpoint = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(ServerState {
            stored: Mutex::new(BTreeMap::new()),
            mode: Mutex::new(mode),
            store_calls: AtomicU32::new(0),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(Arc::clone(&accept_state), stream));
            }
        });

        Self { endpoint, state }
    }

    fn set_mode(&self, mode: ServerMode) {
        *self.state.mode.lock().expect("lock") = mode;
    }

    fn preload(&self, message: Message) {
        let id = message.id();
        self.state
            .stored
            .lock()
            .expect("lock")
            .insert(id, (Timestamp::now(), message));
    }

    fn stored_count(&self) -> usize {
        self.state.stored.lock().expect("lock").len()
    }

    fn store_calls(&self) -> u32 {
        self.state.store_calls.load(Ordering::Relaxed)
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: tokio::net::TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half);
    loop {
        let mut line = String::new();
        match lines.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let Ok(request) = serde_json::from_str::<serde_json::Value>(&line) else {
            break;
        };
        let reply = handle_request(&state, &request);
        let mut out = reply.to_string();
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn handle_request(state: &ServerState, request: &serde_json::Value) -> serde_json::Value {
    let id = request["id"].clone();
    let params = &request["params"];
    match request["method"].as_str() {
        Some("mail_store_message") => {
            state.store_calls.fetch_add(1, Ordering::Relaxed);
            let mode = {
                let mut mode = state.mode.lock().expect("lock");
                let current = mode.clone();
                if matches!(current, ServerMode::StaleOnce) {
                    *mode = ServerMode::Accept;
                }
                current
            };
            match mode {
                ServerMode::Reject(reason) => {
                    serde_json::json!({"id": id, "error": {"message": reason}})
                }
                ServerMode::StaleOnce => {
                    serde_json::json!({"id": id, "error": {"message": "timestamp_too_old"}})
                }
                ServerMode::Accept => {
                    let message: Message =
                        serde_json::from_value(params[0].clone()).expect("store params");
                    state
                        .stored
                        .lock()
                        .expect("lock")
                        .insert(message.id(), (Timestamp::now(), message));
                    serde_json::json!({"id": id, "result": true})
                }
            }
        }
        Some("mail_fetch_message") => {
            let message_id: MessageId =
                serde_json::from_value(params[0].clone()).expect("fetch params");
            match state.stored.lock().expect("lock").get(&message_id) {
                Some((_, message)) => serde_json::json!({"id": id, "result": message}),
                None => serde_json::json!({"id": id, "error": {"message": "message not found"}}),
            }
        }
        Some("mail_fetch_inventory") => {
            let owner: Address = serde_json::from_value(params[0].clone()).expect("owner");
            let since = Timestamp::from_secs(params[1].as_i64().expect("since"));
            let limit = params[2].as_u64().expect("limit") as usize;

            let mut entries: Vec<(Timestamp, MessageId)> = state
                .stored
                .lock()
                .expect("lock")
                .iter()
                .filter(|(_, (seen_at, message))| {
                    address_of_key(&message.recipient) == owner && *seen_at > since
                })
                .map(|(message_id, (seen_at, _))| (*seen_at, *message_id))
                .collect();
            entries.sort();
            entries.truncate(limit);
            serde_json::json!({"id": id, "result": entries})
        }
        _ => serde_json::json!({"id": id, "error": {"message": "unknown method"}}),
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    dir: PathBuf,
    wallet: Arc<MockWallet>,
    chain: Arc<MockChain>,
    client: MailClient,
}

impl Harness {
    /// Opens a client for accounts alice and bob, with bob's mail
    /// routed to the given servers.
    async fn open(servers: &[(&str, &MockServer)], pow_target: MessageId) -> Self {
        let wallet = Arc::new(MockWallet::new(&["alice", "bob"]));
        let chain = Arc::new(MockChain::new());
        let server_names: Vec<&str> = servers.iter().map(|(name, _)| *name).collect();
        chain.register_user("alice", wallet.key_for("alice"), &server_names);
        chain.register_user("bob", wallet.key_for("bob"), &server_names);
        for (name, server) in servers {
            chain.register_server(name, &server.endpoint);
        }

        let dir = temp_dir();
        let client = Self::open_client(&dir, &wallet, &chain, pow_target).await;
        Self {
            dir,
            wallet,
            chain,
            client,
        }
    }

    async fn open_client(
        dir: &PathBuf,
        wallet: &Arc<MockWallet>,
        chain: &Arc<MockChain>,
        pow_target: MessageId,
    ) -> MailClient {
        let config = MailConfig {
            pow_target,
            pow_slice_millis: 100,
            ..MailConfig::default()
        };
        MailClient::open(
            dir,
            config,
            Arc::clone(wallet) as Arc<dyn Wallet>,
            Arc::clone(chain) as Arc<dyn ChainDirectory>,
        )
        .await
        .expect("open client")
    }

    fn status_of(&self, id: MessageId) -> Option<MailStatus> {
        self.client.get_message(id).ok().map(|record| record.status)
    }

    /// Builds a sealed email addressed to one of the wallet accounts.
    fn sealed_email(&self, from: &str, to: &str, subject: &str, body: &str) -> Message {
        let to_key = self.wallet.key_for(to);
        let mut plaintext = self
            .wallet
            .mail_create(from, subject, body, None)
            .expect("create");
        plaintext.recipient = to_key;
        self.wallet.seal(&plaintext)
    }
}

// ---------------------------------------------------------------------------
// Outgoing scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_two_servers() {
    let server_a = MockServer::start(ServerMode::Accept).await;
    let server_b = MockServer::start(ServerMode::Accept).await;
    let mut harness =
        Harness::open(&[("mail-a", &server_a), ("mail-b", &server_b)], MessageId::MAX).await;
    let mut events = harness.client.take_event_receiver().expect("events");

    let id = harness
        .client
        .send_email("alice", "bob", "hi", "hello", None)
        .expect("send");

    wait_for("message to reach the archive", || {
        matches!(harness.status_of(id), Some(MailStatus::Accepted))
    })
    .await;

    // Both servers hold the message; processing is empty.
    assert_eq!(server_a.stored_count(), 1);
    assert_eq!(server_b.stored_count(), 1);
    assert!(harness
        .client
        .get_processing_messages()
        .expect("processing")
        .is_empty());

    let record = harness.client.get_message(id).expect("get");
    assert_eq!(record.servers.len(), 2);
    assert_eq!(record.header.subject, "hi");
    assert_eq!(record.content.as_email().expect("email").body, "hello");

    match next_event(&mut events).await {
        MailEvent::MessageAccepted { id: stable, final_id } => {
            assert_eq!(stable, id);
            // No mining happened (the target accepts everything), so
            // the final id equals the stable id.
            assert_eq!(final_id, id);
        }
        other => panic!("expected MessageAccepted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_timestamp_triggers_repow() {
    let server = MockServer::start(ServerMode::StaleOnce).await;
    let mut harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;
    let mut events = harness.client.take_event_receiver().expect("events");

    let stable_id = harness
        .client
        .send_email("alice", "bob", "retry", "body", None)
        .expect("send");

    wait_for("archive row after re-mining", || {
        harness
            .client
            .get_archive_messages()
            .map(|rows| !rows.is_empty())
            .unwrap_or(false)
    })
    .await;

    // The rejection bumped the nonce, so the archive id differs from
    // the handle the caller holds.
    assert!(server.store_calls() >= 2, "server must see a retry");
    match next_event(&mut events).await {
        MailEvent::MessageAccepted { id, final_id } => {
            assert_eq!(id, stable_id);
            assert_ne!(final_id, stable_id);
            assert!(harness
                .client
                .get_message(final_id)
                .expect("archived record")
                .servers
                .contains_key("mail-a"));
        }
        other => panic!("expected MessageAccepted, got {other:?}"),
    }
    assert!(harness
        .client
        .get_processing_messages()
        .expect("processing")
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_failure_then_retry() {
    let server = MockServer::start(ServerMode::Reject("server busy".into())).await;
    let harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;

    let id = harness
        .client
        .send_email("alice", "bob", "hi", "hello", None)
        .expect("send");

    wait_for("terminal failure", || {
        matches!(harness.status_of(id), Some(MailStatus::Failed))
    })
    .await;
    let record = harness.client.get_message(id).expect("get");
    assert_eq!(record.failure_reason.as_deref(), Some("server busy"));
    assert_eq!(
        harness.client.get_processing_messages().expect("processing"),
        vec![(MailStatus::Failed, id)],
    );

    // The server recovers; a retry re-runs the whole pipeline.
    server.set_mode(ServerMode::Accept);
    harness.client.retry_message(id).expect("retry");

    wait_for("archive row after retry", || {
        matches!(harness.status_of(id), Some(MailStatus::Accepted))
    })
    .await;
    assert_eq!(server.stored_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_during_mining() {
    let server = MockServer::start(ServerMode::Accept).await;
    let harness = Harness::open(&[("mail-a", &server)], impossible_target()).await;

    let id = harness
        .client
        .send_email("alice", "bob", "doomed", "body", None)
        .expect("send");

    wait_for("mining to start", || {
        matches!(harness.status_of(id), Some(MailStatus::ProofOfWork))
    })
    .await;

    harness.client.cancel_message(id).expect("cancel");

    // The next slice boundary observes the flag.
    wait_for("cancellation to land", || {
        matches!(harness.status_of(id), Some(MailStatus::Failed))
    })
    .await;
    let record = harness.client.get_message(id).expect("get");
    assert_eq!(record.failure_reason.as_deref(), Some("Canceled by user."));
    assert_eq!(server.stored_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_boundary_is_enforced() {
    let server = MockServer::start(ServerMode::Reject("server busy".into())).await;
    let harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;

    // Unknown ids are rejected outright.
    match harness.client.cancel_message(MessageId::new([9; 20])) {
        Err(MailError::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    // A failed record is past the cancellation boundary.
    let id = harness
        .client
        .send_email("alice", "bob", "hi", "hello", None)
        .expect("send");
    wait_for("terminal failure", || {
        matches!(harness.status_of(id), Some(MailStatus::Failed))
    })
    .await;
    match harness.client.cancel_message(id) {
        Err(MailError::PreconditionFailed { .. }) => {}
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }

    // An accepted record no longer exists in processing at all.
    server.set_mode(ServerMode::Accept);
    harness.client.retry_message(id).expect("retry");
    wait_for("archive row", || {
        matches!(harness.status_of(id), Some(MailStatus::Accepted))
    })
    .await;
    match harness.client.cancel_message(id) {
        Err(MailError::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_server_set_fails_at_submit() {
    let wallet = Arc::new(MockWallet::new(&["alice", "bob"]));
    let chain = Arc::new(MockChain::new());
    // bob publishes an empty server list, and there are no defaults.
    chain.register_user("alice", wallet.key_for("alice"), &[]);
    chain.register_user("bob", wallet.key_for("bob"), &[]);

    let dir = temp_dir();
    let client = MailClient::open(
        &dir,
        MailConfig::default(),
        Arc::clone(&wallet) as Arc<dyn Wallet>,
        Arc::clone(&chain) as Arc<dyn ChainDirectory>,
    )
    .await
    .expect("open");

    let id = client
        .send_email("alice", "bob", "hi", "hello", None)
        .expect("send");

    let record = client.get_message(id).expect("get");
    assert_eq!(record.status, MailStatus::Failed);
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("Could not find mail servers for this recipient."),
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_after_interrupted_mining() {
    let server = MockServer::start(ServerMode::Accept).await;
    let wallet = Arc::new(MockWallet::new(&["alice", "bob"]));
    let chain = Arc::new(MockChain::new());
    chain.register_user("alice", wallet.key_for("alice"), &["mail-a"]);
    chain.register_user("bob", wallet.key_for("bob"), &["mail-a"]);
    chain.register_server("mail-a", &server.endpoint);

    let dir = temp_dir();

    // Seed the stores as a crashed client would have left them: the
    // record persisted mid proof-of-work, mining condition already
    // met, transmit never enqueued.
    let stable_id = {
        let db = MailDb::open(&dir).expect("seed open");
        let mut plaintext = wallet
            .mail_create("alice", "resumed", "body", None)
            .expect("create");
        plaintext.recipient = wallet.key_for("bob");
        let ciphertext = wallet.seal(&plaintext);
        let mut record =
            ProcessingRecord::new("alice", "bob", wallet.key_for("bob"), ciphertext);
        record.status = MailStatus::ProofOfWork;
        record.pow_target = MessageId::MAX;
        let mut servers = ServerSet::new();
        servers.insert("mail-a".into(), server.endpoint.clone());
        record.servers = servers;
        db.processing().put(record.id, &record).expect("seed put");
        record.id
    };

    let harness_client = Harness::open_client(&dir, &wallet, &chain, MessageId::MAX).await;

    wait_for("resumed message to reach the archive", || {
        harness_client
            .get_message(stable_id)
            .map(|record| record.status == MailStatus::Accepted)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(server.stored_count(), 1);
    assert!(harness_client
        .get_processing_messages()
        .expect("processing")
        .is_empty());
}

// ---------------------------------------------------------------------------
// Inbound scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inbound_dedup_across_servers() {
    let server_a = MockServer::start(ServerMode::Accept).await;
    let server_b = MockServer::start(ServerMode::Accept).await;
    let harness =
        Harness::open(&[("mail-a", &server_a), ("mail-b", &server_b)], MessageId::MAX).await;

    let sealed = harness.sealed_email("alice", "bob", "dup", "same message");
    let id = sealed.id();
    server_a.preload(sealed.clone());
    server_b.preload(sealed);

    let count = harness
        .client
        .check_new_messages(false)
        .await
        .expect("check");
    assert_eq!(count, 1, "one message, however many servers hold it");

    let inbox = harness.client.get_inbox().expect("inbox");
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].id, id);
    assert_eq!(inbox[0].sender, "alice");

    let record = harness.client.get_message(id).expect("get");
    assert_eq!(record.status, MailStatus::Received);
    assert_eq!(record.servers.len(), 2, "both servers recorded as holders");

    // A second pass finds nothing new and changes nothing.
    let count = harness
        .client
        .check_new_messages(false)
        .await
        .expect("second check");
    assert_eq!(count, 0);
    assert_eq!(harness.client.get_inbox().expect("inbox").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_then_fetch_round_trip() {
    let server = MockServer::start(ServerMode::Accept).await;
    let mut harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;
    let mut events = harness.client.take_event_receiver().expect("events");

    let id = harness
        .client
        .send_email("alice", "bob", "hi", "hello", None)
        .expect("send");
    wait_for("archive row", || {
        matches!(harness.status_of(id), Some(MailStatus::Accepted))
    })
    .await;
    match next_event(&mut events).await {
        MailEvent::MessageAccepted { .. } => {}
        other => panic!("expected MessageAccepted, got {other:?}"),
    }

    // Fetch the copy the server now holds; the record we sent flips
    // to received and counts as new mail.
    let count = harness
        .client
        .check_new_messages(false)
        .await
        .expect("check");
    assert_eq!(count, 1);
    match next_event(&mut events).await {
        MailEvent::NewMail { count } => assert_eq!(count, 1),
        other => panic!("expected NewMail, got {other:?}"),
    }

    let record = harness.client.get_message(id).expect("get");
    assert_eq!(record.status, MailStatus::Received);
    let email = record.content.as_email().expect("plaintext email");
    assert_eq!(email.subject, "hi");
    assert_eq!(email.body, "hello");
    assert_eq!(record.header.sender, "alice");
    assert_eq!(record.header.recipient, "bob");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transaction_notice_is_scanned_and_notified() {
    let server = MockServer::start(ServerMode::Accept).await;
    let mut harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;
    let mut events = harness.client.take_event_receiver().expect("events");

    let notice = TransactionNoticePayload {
        from_key: harness.wallet.key_for("alice"),
        txid: "feedface".into(),
    };
    let plaintext = Message {
        kind: MessageKind::TransactionNotice,
        timestamp: Timestamp::now(),
        nonce: 0,
        recipient: harness.wallet.key_for("bob"),
        payload: notice.encode().expect("encode"),
    };
    server.preload(harness.wallet.seal(&plaintext));

    let count = harness
        .client
        .check_new_messages(false)
        .await
        .expect("check");
    assert_eq!(count, 1);

    assert_eq!(harness.wallet.scanned(), vec!["feedface".to_string()]);
    let inbox = harness.client.get_inbox().expect("inbox");
    assert_eq!(inbox[0].subject, "Transaction Notification");
    assert_eq!(inbox[0].sender, "alice");

    match next_event(&mut events).await {
        MailEvent::TransactionReceived { txid, sender } => {
            assert_eq!(txid, "feedface");
            assert_eq!(sender, "alice");
        }
        other => panic!("expected TransactionReceived, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_signer_is_labeled_invalid() {
    let server = MockServer::start(ServerMode::Accept).await;
    let harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;

    let payload = EmailPayload {
        from_key: PublicKey::new([0xEE; 33]),
        subject: "??".into(),
        body: "anonymous".into(),
        reply_to: None,
    }
    .encode()
    .expect("encode");
    let plaintext = Message {
        kind: MessageKind::Email,
        timestamp: Timestamp::now(),
        nonce: 0,
        recipient: harness.wallet.key_for("bob"),
        payload,
    };
    server.preload(harness.wallet.seal(&plaintext));

    let count = harness
        .client
        .check_new_messages(false)
        .await
        .expect("check");
    assert_eq!(count, 1);
    let inbox = harness.client.get_inbox().expect("inbox");
    assert_eq!(inbox[0].sender, "INVALID SIGNATURE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archive_message_clears_inbox_only() {
    let server = MockServer::start(ServerMode::Accept).await;
    let harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;

    let sealed = harness.sealed_email("alice", "bob", "keep", "me");
    let id = sealed.id();
    server.preload(sealed);
    harness
        .client
        .check_new_messages(false)
        .await
        .expect("check");
    assert_eq!(harness.client.get_inbox().expect("inbox").len(), 1);

    harness.client.archive_message(id).expect("archive");
    assert!(harness.client.get_inbox().expect("inbox").is_empty());
    // The archive copy stays.
    assert_eq!(
        harness.client.get_message(id).expect("get").status,
        MailStatus::Received,
    );
}

// ---------------------------------------------------------------------------
// Removal rules
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_message_rules() {
    let server = MockServer::start(ServerMode::Reject("server busy".into())).await;
    let harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;

    // Failed processing records can be removed.
    let id = harness
        .client
        .send_email("alice", "bob", "hi", "hello", None)
        .expect("send");
    wait_for("terminal failure", || {
        matches!(harness.status_of(id), Some(MailStatus::Failed))
    })
    .await;
    harness.client.remove_message(id).expect("remove failed record");
    assert!(matches!(
        harness.client.get_message(id),
        Err(MailError::NotFound { .. }),
    ));

    // Archived records can be removed too.
    server.set_mode(ServerMode::Accept);
    let id = harness
        .client
        .send_email("alice", "bob", "hi again", "hello", None)
        .expect("send");
    wait_for("archive row", || {
        matches!(harness.status_of(id), Some(MailStatus::Accepted))
    })
    .await;
    harness.client.remove_message(id).expect("remove archived record");
    assert!(matches!(
        harness.client.get_message(id),
        Err(MailError::NotFound { .. }),
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_rejected_while_processing() {
    let server = MockServer::start(ServerMode::Accept).await;
    let harness = Harness::open(&[("mail-a", &server)], impossible_target()).await;

    let id = harness
        .client
        .send_email("alice", "bob", "busy", "mining", None)
        .expect("send");
    wait_for("mining to start", || {
        matches!(harness.status_of(id), Some(MailStatus::ProofOfWork))
    })
    .await;

    match harness.client.remove_message(id) {
        Err(MailError::PreconditionFailed { .. }) => {}
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }

    // Clean up the miner so the test exits promptly.
    harness.client.cancel_message(id).expect("cancel");
}

// ---------------------------------------------------------------------------
// Index coherence
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn index_rebuild_matches_archive() {
    let server = MockServer::start(ServerMode::Accept).await;
    let mut harness = Harness::open(&[("mail-a", &server)], MessageId::MAX).await;

    for (subject, body) in [("one", "first"), ("two", "second")] {
        let id = harness
            .client
            .send_email("alice", "bob", subject, body, None)
            .expect("send");
        wait_for("archive row", || {
            matches!(harness.status_of(id), Some(MailStatus::Accepted))
        })
        .await;
    }

    // Live inserts from finalize serve queries immediately.
    wait_for("live index", || {
        harness
            .client
            .get_messages_by_sender("alice")
            .map(|headers| headers.len() == 2)
            .unwrap_or(false)
    })
    .await;

    // Reopen: the index is rebuilt from the archive in the background
    // and converges to the same rows.
    harness.client.shutdown().await;
    let Harness {
        dir, wallet, chain, ..
    } = harness;
    let client = Harness::open_client(&dir, &wallet, &chain, MessageId::MAX).await;

    wait_for("rebuilt index", || {
        client
            .get_messages_by_sender("alice")
            .map(|headers| headers.len() == 2)
            .unwrap_or(false)
    })
    .await;

    let from_to = client.get_messages_from_to("alice", "bob").expect("from_to");
    assert_eq!(from_to.len(), 2);
    let by_recipient = client.get_messages_by_recipient("bob").expect("by_recipient");
    assert_eq!(by_recipient.len(), 2);
    assert!(client.get_messages_by_sender("bob").expect("none").is_empty());

    // Every archive row has exactly one matching index row.
    let archive = client.get_archive_messages().expect("archive");
    assert_eq!(archive.len(), 2);
    for (_, id) in archive {
        let header = client.get_message(id).expect("get").header;
        assert!(by_recipient.iter().filter(|h| h.id == header.id).count() == 1);
    }
}
