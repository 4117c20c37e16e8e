#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use modsync_fetch::codec::{compress_frame, encode_container};
use modsync_fetch::{
    ContentHash, FlatDirStore, ReqwestClient, RequestedFile, TransferConfig, TransferSession,
};
use modsync_verify::{Sha256Hasher, to_hex_upper};
use serde_json::{Value, json};
use tempfile::TempDir;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub type Session = TransferSession<ReqwestClient, FlatDirStore>;

/// A file as the hosts serve it.
#[derive(Debug, Clone)]
pub struct Asset {
    pub hash: ContentHash,
    pub content: Vec<u8>,
    pub frame: Vec<u8>,
}

impl Asset {
    pub fn new(content: &[u8]) -> Self {
        let hash = ContentHash::parse(&to_hex_upper(&Sha256Hasher::digest(content))).unwrap();
        Self {
            hash,
            content: content.to_vec(),
            frame: compress_frame(content).unwrap(),
        }
    }

    pub fn requested(&self, game_path: &str) -> RequestedFile {
        RequestedFile::new(self.hash.clone(), game_path)
    }

    /// Size row offering only queued delivery.
    pub fn queued_row(&self) -> Value {
        json!({
            "hash": self.hash.as_str(),
            "size": self.frame.len(),
            "fileExists": true,
            "isForbidden": false,
        })
    }

    /// Size row with a direct location on `server`.
    pub fn direct_row(&self, server: &MockServer) -> Value {
        let mut row = self.queued_row();
        row["url"] = json!(direct_url(server, &self.hash));
        row
    }
}

pub fn direct_path(hash: &ContentHash) -> String { format!("/cdn/{hash}") }

pub fn direct_url(server: &MockServer, hash: &ContentHash) -> String {
    format!("{}{}", server.uri(), direct_path(hash))
}

pub struct Fixture {
    pub server: MockServer,
    pub store: Arc<FlatDirStore>,
    pub session: Session,
    pub store_dir: TempDir,
    pub temp_dir: TempDir,
}

impl Fixture {
    pub async fn start() -> Self { Self::with_config(|c| c).await }

    pub async fn with_config(tune: impl FnOnce(TransferConfig) -> TransferConfig) -> Self {
        let server = MockServer::start().await;
        let store_dir = tempfile::tempdir().unwrap();
        let temp_dir = tempfile::tempdir().unwrap();
        Self::build(server, store_dir, temp_dir, tune)
    }

    /// Like [`with_config`](Self::with_config) but over an already populated
    /// store directory.
    pub async fn with_store(store_dir: TempDir) -> Self {
        let server = MockServer::start().await;
        let temp_dir = tempfile::tempdir().unwrap();
        Self::build(server, store_dir, temp_dir, |c| c)
    }

    fn build(
        server: MockServer,
        store_dir: TempDir,
        temp_dir: TempDir,
        tune: impl FnOnce(TransferConfig) -> TransferConfig,
    ) -> Self {
        let config = tune(
            TransferConfig::default()
                .with_ready_poll_interval(Duration::from_millis(10))
                .with_temp_dir(temp_dir.path().join("blocks")),
        );
        let store = Arc::new(FlatDirStore::open(store_dir.path()).unwrap());
        let client = Arc::new(ReqwestClient::new().unwrap());
        let service = Url::parse(&format!("{}/", server.uri())).unwrap();
        let session = TransferSession::new(client, service, Arc::clone(&store), config);
        Self {
            server,
            store,
            session,
            store_dir,
            temp_dir,
        }
    }

    pub async fn mount_sizes(&self, rows: Vec<Value>) {
        Mock::given(method("POST"))
            .and(path("/files/getFileSizes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(rows)))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_direct(&self, asset: &Asset) {
        Mock::given(method("GET"))
            .and(path(direct_path(&asset.hash)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(asset.frame.clone()))
            .mount(&self.server)
            .await;
    }

    /// Queue protocol that is ready on the first check and serves `block`.
    pub async fn mount_queue(&self, request_id: Uuid, block: Vec<u8>) {
        self.mount_enqueue(request_id).await;
        self.mount_check(true).await;
        Mock::given(method("GET"))
            .and(path("/cache/get"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(block))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_enqueue(&self, request_id: Uuid) {
        Mock::given(method("POST"))
            .and(path("/request/enqueue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(request_id.to_string()))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/request/cancel"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_check(&self, ready: bool) {
        Mock::given(method("POST"))
            .and(path("/request/check"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ready.to_string()))
            .mount(&self.server)
            .await;
    }

    /// Number of requests the server saw whose path starts with `prefix`.
    pub async fn hits(&self, prefix: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path().starts_with(prefix))
            .count()
    }

    pub fn stored(&self, asset: &Asset, extension: &str) -> Option<Vec<u8>> {
        std::fs::read(self.store_dir.path().join(format!("{}.{extension}", asset.hash))).ok()
    }

    pub fn block_dir(&self) -> std::path::PathBuf { self.temp_dir.path().join("blocks") }
}

/// A container carrying each asset's frame under its hash.
pub fn block_of(assets: &[&Asset]) -> Vec<u8> {
    encode_container(assets.iter().map(|a| (a.hash.as_str(), a.frame.as_slice()))).unwrap()
}

/// Incompressible bytes, so a frame is about as large as its content.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Poll until a file containing `marker` shows up in `dir`.
pub async fn wait_for_file(dir: &Path, marker: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while leftovers(dir, marker) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {marker} file appeared in {}", dir.display()));
}

/// Files left in `dir` whose name contains `marker`. A missing directory
/// counts as empty.
pub fn leftovers(dir: &Path, marker: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(marker))
        .count()
}
