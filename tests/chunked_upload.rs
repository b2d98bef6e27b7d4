//! End-to-end transfer tests: a real listener on loopback driven by the real
//! client orchestrator, plus raw-protocol checks against the chunk endpoint.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

use reeldrop::sequencer::ChunkWriter;
use reeldrop::session::SessionStore;
use reeldrop::storage::MediaStore;
use reeldrop::upload::UploadLimits;
use reeldrop::{ClientError, TransferProgress, UploadClient};

const MIB: u64 = 1024 * 1024;

struct TestServer {
    _temp: TempDir,
    addr: SocketAddr,
    library: std::path::PathBuf,
}

impl TestServer {
    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn spawn_server() -> TestServer {
    let temp = tempdir().expect("tempdir");
    let library = temp.path().join("library");
    let staging = temp.path().join("staging");

    let store = Arc::new(MediaStore::new(library.clone(), staging));
    store.ensure_roots().await.expect("create roots");
    let sessions = Arc::new(SessionStore::new());
    let writer = Arc::new(ChunkWriter::new());
    let limits = Arc::new(UploadLimits { max_total_size: 0 });

    let app = reeldrop::api_router(store, sessions, writer, limits);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestServer {
        _temp: temp,
        addr,
        library,
    }
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_source(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, pattern_bytes(len)).expect("write source");
    path
}

#[tokio::test]
async fn whole_transfer_round_trips_through_the_protocol() {
    let server = spawn_server().await;
    let source_dir = tempdir().expect("source dir");
    let total = (2 * MIB + 123) as usize;
    let source = write_source(source_dir.path(), "episode.mkv", total);

    let state_dir = source_dir.path().join("state");
    let mut client = UploadClient::new(&source, server.base_url())
        .with_folder("shows")
        .with_chunk_size(MIB)
        .with_state_dir(&state_dir);

    let samples: Arc<Mutex<Vec<TransferProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = samples.clone();
    client.on_progress(move |progress| {
        sink.lock().unwrap().push(progress);
    });

    let plan = client.init().await.expect("init");
    assert_eq!(plan.chunk_size, MIB);
    assert_eq!(plan.total_chunks, 3);
    assert!(
        state_dir
            .join(format!("upload-{}.json", plan.upload_id))
            .exists(),
        "session record should be persisted"
    );

    let done = client.upload_all().await.expect("upload");
    assert!(done.path.ends_with("shows/episode.mkv"));

    let final_file = server.library.join("shows").join("episode.mkv");
    assert_eq!(
        std::fs::read(&final_file).expect("read final file"),
        pattern_bytes(total)
    );

    // 会话收尾后即删除，本地记录同步清掉。
    assert!(matches!(
        client.status().await,
        Err(ClientError::SessionNotFound)
    ));
    assert!(!state_dir
        .join(format!("upload-{}.json", plan.upload_id))
        .exists());

    let samples = samples.lock().unwrap();
    assert!(!samples.is_empty(), "progress callback should have fired");
    let last = samples.last().unwrap();
    assert_eq!(last.uploaded_bytes, total as u64);
    assert_eq!(last.chunks_completed, 3);
}

async fn raw_init(
    http: &reqwest::Client,
    base: &str,
    file_name: &str,
    total_size: u64,
    chunk_size: u64,
) -> serde_json::Value {
    http.post(format!("{base}/upload/init"))
        .json(&serde_json::json!({
            "fileName": file_name,
            "folderName": "films",
            "totalSize": total_size,
            "chunkSize": chunk_size,
        }))
        .send()
        .await
        .expect("init request")
        .json()
        .await
        .expect("init json")
}

async fn raw_chunk(
    http: &reqwest::Client,
    base: &str,
    upload_id: &str,
    index: u32,
    bytes: Vec<u8>,
) -> (reqwest::StatusCode, serde_json::Value) {
    let form = reqwest::multipart::Form::new()
        .text("uploadId", upload_id.to_string())
        .text("chunkIndex", index.to_string())
        .part(
            "chunk",
            reqwest::multipart::Part::bytes(bytes).file_name("blob"),
        );
    let response = http
        .post(format!("{base}/upload/chunk"))
        .multipart(form)
        .send()
        .await
        .expect("chunk request");
    let status = response.status();
    (status, response.json().await.expect("chunk json"))
}

#[tokio::test]
async fn duplicate_chunks_are_idempotent_and_complete_reports_missing() {
    let server = spawn_server().await;
    let base = server.base_url();
    let http = reqwest::Client::new();

    let total = 2 * MIB + 77;
    let init = raw_init(&http, &base, "movie.mkv", total, MIB).await;
    assert_eq!(init["success"], serde_json::json!(true));
    assert_eq!(init["totalChunks"], serde_json::json!(3));
    let upload_id = init["uploadId"].as_str().expect("uploadId").to_string();

    let chunk1 = pattern_bytes(MIB as usize);
    let (status, first) = raw_chunk(&http, &base, &upload_id, 1, chunk1.clone()).await;
    assert!(status.is_success());
    assert_eq!(first["success"], serde_json::json!(true));
    assert_eq!(first["bytesWritten"], serde_json::json!(MIB));

    // 重发同一分片：直接成功、不再写盘。
    let (status, second) = raw_chunk(&http, &base, &upload_id, 1, chunk1).await;
    assert!(status.is_success());
    assert_eq!(second["success"], serde_json::json!(true));
    assert_eq!(second["bytesWritten"], serde_json::json!(0));

    let status_reply: serde_json::Value = http
        .get(format!("{base}/upload/status/{upload_id}"))
        .send()
        .await
        .expect("status request")
        .json()
        .await
        .expect("status json");
    assert_eq!(status_reply["receivedChunks"], serde_json::json!(1));
    assert_eq!(status_reply["missingChunks"], serde_json::json!([0, 2]));
    assert_eq!(status_reply["isComplete"], serde_json::json!(false));

    let complete: serde_json::Value = http
        .post(format!("{base}/upload/complete"))
        .json(&serde_json::json!({ "uploadId": upload_id }))
        .send()
        .await
        .expect("complete request")
        .json()
        .await
        .expect("complete json");
    assert_eq!(complete["success"], serde_json::json!(false));
    assert_eq!(complete["missingChunks"], serde_json::json!([0, 2]));

    // 失败的收尾不应影响会话继续查询。
    let still_there = http
        .get(format!("{base}/upload/status/{upload_id}"))
        .send()
        .await
        .expect("status request");
    assert!(still_there.status().is_success());
}

#[tokio::test]
async fn out_of_order_chunks_assemble_in_index_order() {
    let server = spawn_server().await;
    let base = server.base_url();
    let http = reqwest::Client::new();

    let total = 2 * MIB + 400;
    let bytes = pattern_bytes(total as usize);
    let init = raw_init(&http, &base, "scene.mp4", total, MIB).await;
    let upload_id = init["uploadId"].as_str().expect("uploadId").to_string();

    for index in [2u32, 0, 1] {
        let start = index as u64 * MIB;
        let end = (start + MIB).min(total);
        let (status, reply) = raw_chunk(
            &http,
            &base,
            &upload_id,
            index,
            bytes[start as usize..end as usize].to_vec(),
        )
        .await;
        assert!(status.is_success());
        assert_eq!(reply["success"], serde_json::json!(true));
    }

    let complete: serde_json::Value = http
        .post(format!("{base}/upload/complete"))
        .json(&serde_json::json!({ "uploadId": upload_id }))
        .send()
        .await
        .expect("complete request")
        .json()
        .await
        .expect("complete json");
    assert_eq!(complete["success"], serde_json::json!(true));

    let final_file = server.library.join("films").join("scene.mp4");
    assert_eq!(std::fs::read(&final_file).expect("final file"), bytes);
}

#[tokio::test]
async fn legacy_single_request_upload_lands_in_library() {
    let server = spawn_server().await;
    let base = server.base_url();
    let http = reqwest::Client::new();

    let payload = pattern_bytes(64 * 1024);
    let form = reqwest::multipart::Form::new()
        .text("folderName", "inbox")
        .part(
            "file",
            reqwest::multipart::Part::bytes(payload.clone()).file_name("short.webm"),
        );
    let reply: serde_json::Value = http
        .post(format!("{base}/upload"))
        .multipart(form)
        .send()
        .await
        .expect("upload request")
        .json()
        .await
        .expect("upload json");
    assert_eq!(reply["success"], serde_json::json!(true));

    let final_file = server.library.join("inbox").join("short.webm");
    assert_eq!(std::fs::read(&final_file).expect("final file"), payload);
}
