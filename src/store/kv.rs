// src/store/kv.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::resolver::model::ResolvedConfig;
use crate::store::{ConfigStore, StoreBackend, StoreError};

/// A value read from the key-value store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Stored bytes
    pub value: Vec<u8>,

    /// Revision of the last modification, used for compare-and-swap
    pub mod_revision: i64,
}

/// Condition checked by a transaction before it writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnGuard {
    /// The key was last modified at this revision
    Revision(String, i64),

    /// The key does not exist
    Absent(String),
}

impl TxnGuard {
    /// Guard for a key expected at `revision`, or absent for `None`
    pub fn expecting(key: &str, revision: Option<i64>) -> Self {
        match revision {
            Some(revision) => TxnGuard::Revision(key.to_string(), revision),
            None => TxnGuard::Absent(key.to_string()),
        }
    }
}

/// Minimal key-value client the distributed store needs
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Reads one key
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Keys under a prefix, in lexical order
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Writes one key unconditionally
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Writes every entry of `puts` if and only if all guards hold, as one
    /// atomic step. Returns whether the writes happened.
    async fn txn(&self, guards: &[TxnGuard], puts: &[(String, Vec<u8>)]) -> Result<bool, StoreError>;

    /// Writes `value` only if the key's revision is still `expected`
    /// (`None`: the key must not exist). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: Vec<u8>,
    ) -> Result<bool, StoreError> {
        self.txn(&[TxnGuard::expecting(key, expected)], &[(key.to_string(), value)])
            .await
    }

    /// Removes one key
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Distributed store: one key per version plus a current-version pointer
pub struct KvStore<C: KvClient> {
    client: Arc<C>,
    namespace: String,
    current: Arc<watch::Sender<Option<u64>>>,
}

impl<C: KvClient + 'static> KvStore<C> {
    /// Opens the store, reading the current pointer once
    pub async fn new(client: Arc<C>, namespace: &str) -> Result<Self, StoreError> {
        let namespace = namespace.trim_end_matches('/').to_string();
        let (current, _) = watch::channel(None);
        let store = Self {
            client,
            namespace,
            current: Arc::new(current),
        };

        let version = store.pointer().await?.map(|(version, _)| version);
        store.current.send_replace(version);

        Ok(store)
    }

    fn pointer_key(&self) -> String {
        format!("{}/current", self.namespace)
    }

    fn versions_prefix(&self) -> String {
        format!("{}/versions/", self.namespace)
    }

    fn version_key(&self, version: u64) -> String {
        format!("{}{:020}", self.versions_prefix(), version)
    }

    /// Current version and the pointer's revision
    async fn pointer(&self) -> Result<Option<(u64, i64)>, StoreError> {
        match self.client.get(&self.pointer_key()).await? {
            Some(entry) => {
                let version = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| StoreError::Corrupt("current-version pointer".to_string()))?;
                Ok(Some((version, entry.mod_revision)))
            }
            None => Ok(None),
        }
    }

    /// Polls the pointer so commits made by other nodes reach watchers.
    /// The task ends when `shutdown` flips to true.
    pub fn spawn_watch(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let key = self.pointer_key();
        let current = self.current.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let seen = match client.get(&key).await {
                    Ok(Some(entry)) => std::str::from_utf8(&entry.value)
                        .ok()
                        .and_then(|v| v.trim().parse::<u64>().ok()),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Failed to poll current config version: {}", e);
                        continue;
                    }
                };

                if let Some(seen) = seen {
                    advance(&current, seen);
                }
            }
            debug!("Key-value watch stopped");
        })
    }
}

/// Moves the watched version forward, never backwards
fn advance(current: &watch::Sender<Option<u64>>, version: u64) {
    current.send_if_modified(|value| match value {
        Some(known) if *known >= version => false,
        _ => {
            *value = Some(version);
            true
        }
    });
}

#[async_trait]
impl<C: KvClient + 'static> ConfigStore for KvStore<C> {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Distributed
    }

    async fn current_version(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.pointer().await?.map(|(version, _)| version))
    }

    async fn read(&self, version: u64) -> Result<ResolvedConfig, StoreError> {
        let raw = self.read_raw(version).await?;
        ResolvedConfig::from_bytes(&raw)
            .map_err(|e| StoreError::Corrupt(format!("version {}: {}", version, e)))
    }

    async fn read_raw(&self, version: u64) -> Result<Vec<u8>, StoreError> {
        self.client
            .get(&self.version_key(version))
            .await?
            .map(|entry| entry.value)
            .ok_or(StoreError::NotFound(version))
    }

    async fn commit(&self, config: &ResolvedConfig) -> Result<(), StoreError> {
        let raw = config
            .to_bytes()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        // Check the version moves forward
        let pointer = self.pointer().await?;
        let current = pointer.map(|(version, _)| version).unwrap_or(0);
        if config.version <= current {
            return Err(StoreError::StaleVersion {
                current,
                attempted: config.version,
            });
        }

        // Version key and pointer move together, and a version key is
        // written once
        let key = self.version_key(config.version);
        let pointer_key = self.pointer_key();
        let guards = [
            TxnGuard::expecting(&pointer_key, pointer.map(|(_, revision)| revision)),
            TxnGuard::Absent(key.clone()),
        ];
        let puts = [(key, raw), (pointer_key, config.version.to_string().into_bytes())];

        if !self.client.txn(&guards, &puts).await? {
            return Err(StoreError::Conflict);
        }

        advance(&self.current, config.version);
        debug!(version = config.version, "Committed config to key-value store");

        Ok(())
    }

    async fn versions(&self) -> Result<Vec<u64>, StoreError> {
        let prefix = self.versions_prefix();
        let current = self.current_version().await?.unwrap_or(0);
        let mut versions: Vec<u64> = self
            .client
            .keys(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .filter(|version| *version <= current)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn prune(&self, retain: usize) -> Result<usize, StoreError> {
        let versions = self.versions().await?;
        let excess = versions.len().saturating_sub(retain.max(1));
        for version in &versions[..excess] {
            self.client.delete(&self.version_key(*version)).await?;
        }
        Ok(excess)
    }

    fn watch(&self) -> watch::Receiver<Option<u64>> {
        self.current.subscribe()
    }
}

/// In-process key-value client
#[derive(Default)]
pub struct MemoryKvClient {
    entries: Mutex<BTreeMap<String, KvEntry>>,
    revision: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryKvClient {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail as if the store could not be reached
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl KvClient for MemoryKvClient {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.check()?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        Ok(self
            .entries
            .lock()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check()?;
        let mod_revision = self.next_revision();
        self.entries
            .lock()
            .await
            .insert(key.to_string(), KvEntry { value, mod_revision });
        Ok(())
    }

    async fn txn(&self, guards: &[TxnGuard], puts: &[(String, Vec<u8>)]) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        let holds = guards.iter().all(|guard| match guard {
            TxnGuard::Revision(key, revision) => entries.get(key).map(|entry| entry.mod_revision) == Some(*revision),
            TxnGuard::Absent(key) => !entries.contains_key(key),
        });
        if !holds {
            return Ok(false);
        }

        // One revision for the whole transaction
        let mod_revision = self.next_revision();
        for (key, value) in puts {
            entries.insert(
                key.clone(),
                KvEntry {
                    value: value.clone(),
                    mod_revision,
                },
            );
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// Client for the etcd v3 JSON gateway
pub struct EtcdGatewayClient {
    client: Client<HttpConnector>,
    base_url: String,
    timeout: Duration,
}

impl EtcdGatewayClient {
    /// Creates a client for the gateway at `base_url`; only `http` is supported
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid gateway URL {}: {}", base_url, e)))?;
        if parsed.scheme() != "http" {
            return Err(StoreError::Unavailable(format!(
                "unsupported gateway scheme {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn call(&self, endpoint: &str, body: Value) -> Result<Value, StoreError> {
        let uri = format!("{}/v3/kv/{}", self.base_url, endpoint);
        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Ok::<_, StoreError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| StoreError::Timeout)??;

        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "{} returned {}: {}",
                uri,
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }

        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    fn decode(field: Option<&Value>) -> Result<Vec<u8>, StoreError> {
        match field.and_then(Value::as_str) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// int64 fields come back as strings from the gateway
    fn revision(field: Option<&Value>) -> i64 {
        match field {
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            _ => 0,
        }
    }

    /// Smallest key greater than every key with the given prefix
    fn range_end(prefix: &str) -> Vec<u8> {
        let mut end = prefix.as_bytes().to_vec();
        while let Some(last) = end.pop() {
            if last < 0xff {
                end.push(last + 1);
                return end;
            }
        }
        vec![0]
    }
}

#[async_trait]
impl KvClient for EtcdGatewayClient {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let response = self
            .call("range", json!({ "key": Self::encode(key.as_bytes()) }))
            .await?;

        match response.get("kvs").and_then(Value::as_array).and_then(|kvs| kvs.first()) {
            Some(kv) => Ok(Some(KvEntry {
                value: Self::decode(kv.get("value"))?,
                mod_revision: Self::revision(kv.get("mod_revision")),
            })),
            None => Ok(None),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let response = self
            .call(
                "range",
                json!({
                    "key": Self::encode(prefix.as_bytes()),
                    "range_end": Self::encode(&Self::range_end(prefix)),
                    "keys_only": true,
                    "sort_order": "ASCEND",
                    "sort_target": "KEY",
                }),
            )
            .await?;

        let mut keys = Vec::new();
        for kv in response.get("kvs").and_then(Value::as_array).into_iter().flatten() {
            let key = Self::decode(kv.get("key"))?;
            keys.push(String::from_utf8(key).map_err(|e| StoreError::Corrupt(e.to_string()))?);
        }
        Ok(keys)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.call(
            "put",
            json!({
                "key": Self::encode(key.as_bytes()),
                "value": Self::encode(&value),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn txn(&self, guards: &[TxnGuard], puts: &[(String, Vec<u8>)]) -> Result<bool, StoreError> {
        let compare: Vec<Value> = guards
            .iter()
            .map(|guard| match guard {
                TxnGuard::Revision(key, revision) => json!({
                    "key": Self::encode(key.as_bytes()),
                    "target": "MOD",
                    "result": "EQUAL",
                    "mod_revision": revision.to_string(),
                }),
                TxnGuard::Absent(key) => json!({
                    "key": Self::encode(key.as_bytes()),
                    "target": "CREATE",
                    "result": "EQUAL",
                    "create_revision": "0",
                }),
            })
            .collect();
        let success: Vec<Value> = puts
            .iter()
            .map(|(key, value)| {
                json!({
                    "request_put": {
                        "key": Self::encode(key.as_bytes()),
                        "value": Self::encode(value),
                    }
                })
            })
            .collect();

        let response = self
            .call("txn", json!({ "compare": compare, "success": success }))
            .await?;

        Ok(response
            .get("succeeded")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.call("deleterange", json!({ "key": Self::encode(key.as_bytes()) }))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::model::fixtures::resolved;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn memory_store() -> (Arc<MemoryKvClient>, KvStore<MemoryKvClient>) {
        let client = Arc::new(MemoryKvClient::new());
        let store = KvStore::new(client.clone(), "/morio/config/").await.unwrap();
        (client, store)
    }

    #[tokio::test]
    async fn commits_move_the_pointer() {
        let (client, store) = memory_store().await;
        let config = resolved(1, &["a.example.com", "b.example.com", "c.example.com"]);
        store.commit(&config).await.unwrap();

        let pointer = client.get("/morio/config/current").await.unwrap().unwrap();
        assert_eq!(pointer.value, b"1".to_vec());
        assert!(client
            .get("/morio/config/versions/00000000000000000001")
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.read(1).await.unwrap(), config);
    }

    #[tokio::test]
    async fn pointer_swaps_require_the_expected_revision() {
        let (client, store) = memory_store().await;
        store.commit(&resolved(1, &["a.example.com"])).await.unwrap();

        let entry = client.get("/morio/config/current").await.unwrap().unwrap();
        assert!(!client
            .compare_and_swap("/morio/config/current", Some(entry.mod_revision + 100), b"9".to_vec())
            .await
            .unwrap());
        assert!(client
            .compare_and_swap("/morio/config/current", Some(entry.mod_revision), b"1".to_vec())
            .await
            .unwrap());
        assert_eq!(store.current_version().await.unwrap(), Some(1));
    }

    /// Shares a client but holds every transaction until released
    struct Held {
        inner: Arc<MemoryKvClient>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl KvClient for Held {
        async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
            self.inner.get(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(prefix).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn txn(&self, guards: &[TxnGuard], puts: &[(String, Vec<u8>)]) -> Result<bool, StoreError> {
            self.release.notified().await;
            self.inner.txn(guards, puts).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn racing_commits_leave_the_winner_intact() {
        let shared = Arc::new(MemoryKvClient::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let slow = KvStore::new(
            Arc::new(Held {
                inner: shared.clone(),
                release: release.clone(),
            }),
            "/morio/config/",
        )
        .await
        .unwrap();
        let fast = KvStore::new(shared.clone(), "/morio/config/").await.unwrap();

        let losing = resolved(1, &["a.example.com"]);
        let winning = resolved(1, &["b.example.com"]);
        let (lost, won) = tokio::join!(slow.commit(&losing), async {
            let won = fast.commit(&winning).await;
            release.notify_one();
            won
        });

        won.unwrap();
        assert!(matches!(
            lost,
            Err(StoreError::Conflict) | Err(StoreError::StaleVersion { .. })
        ));
        assert_eq!(fast.current_version().await.unwrap(), Some(1));
        assert_eq!(fast.read_raw(1).await.unwrap(), winning.to_bytes().unwrap());
        assert_eq!(slow.read(1).await.unwrap(), winning);
    }

    #[tokio::test]
    async fn version_keys_are_never_overwritten() {
        let (client, store) = memory_store().await;
        client
            .put("/morio/config/versions/00000000000000000001", b"leftover".to_vec())
            .await
            .unwrap();

        let err = store.commit(&resolved(1, &["a.example.com"])).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        assert_eq!(store.current_version().await.unwrap(), None);
        assert_eq!(
            store.read_raw(1).await.unwrap(),
            b"leftover".to_vec()
        );
    }

    #[tokio::test]
    async fn unreachable_store_fails_transiently() {
        let (client, store) = memory_store().await;
        client.set_unavailable(true);
        let err = store.commit(&resolved(1, &["a.example.com"])).await.unwrap_err();
        assert!(err.is_transient());
        client.set_unavailable(false);
        assert_eq!(store.current_version().await.unwrap(), None);
    }

    #[tokio::test]
    async fn pruning_drops_oldest_version_keys() {
        let (_client, store) = memory_store().await;
        for version in 1..=4 {
            store.commit(&resolved(version, &["a.example.com"])).await.unwrap();
        }
        assert_eq!(store.prune(3).await.unwrap(), 1);
        assert_eq!(store.versions().await.unwrap(), vec![2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_watch_sees_foreign_commits() {
        let (client, store) = memory_store().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut versions = store.watch();
        let handle = store.spawn_watch(Duration::from_millis(100), shutdown_rx);

        client
            .put("/morio/config/current", b"7".to_vec())
            .await
            .unwrap();
        versions.changed().await.unwrap();
        assert_eq!(*versions.borrow(), Some(7));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn gateway_client_decodes_range_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kvs": [{
                    "key": STANDARD.encode("/morio/config/current"),
                    "value": STANDARD.encode("12"),
                    "mod_revision": "42"
                }]
            })))
            .mount(&server)
            .await;

        let client = EtcdGatewayClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let entry = client.get("/morio/config/current").await.unwrap().unwrap();
        assert_eq!(entry.value, b"12".to_vec());
        assert_eq!(entry.mod_revision, 42);
    }

    #[tokio::test]
    async fn gateway_commits_send_one_guarded_transaction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/txn"))
            .and(body_partial_json(json!({
                "compare": [
                    { "target": "CREATE", "key": STANDARD.encode("/morio/config/current") },
                    { "target": "CREATE", "key": STANDARD.encode("/morio/config/versions/00000000000000000001") }
                ],
                "success": [
                    { "request_put": { "key": STANDARD.encode("/morio/config/versions/00000000000000000001") } },
                    { "request_put": { "key": STANDARD.encode("/morio/config/current"), "value": STANDARD.encode("1") } }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "succeeded": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/put"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = EtcdGatewayClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let store = KvStore::new(Arc::new(client), "/morio/config").await.unwrap();
        store.commit(&resolved(1, &["a.example.com"])).await.unwrap();
        assert_eq!(*store.watch().borrow(), Some(1));
    }

    #[tokio::test]
    async fn gateway_client_reports_failed_transactions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kv/txn"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
            .mount(&server)
            .await;

        let client = EtcdGatewayClient::new(&server.uri(), Duration::from_secs(2)).unwrap();
        let swapped = client
            .compare_and_swap("/morio/config/current", Some(3), b"4".to_vec())
            .await
            .unwrap();
        assert!(!swapped);
    }

    #[test]
    fn range_end_increments_the_last_byte() {
        assert_eq!(EtcdGatewayClient::range_end("/a/"), b"/a0".to_vec());
    }
}
