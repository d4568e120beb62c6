//! HTTP providers against in-process mocks of their upload protocols.

mod helpers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use helpers::{MIB, write_package};
use stowage_core::config::TransferConfig;
use stowage_entity::package::{Package, UploadInfo};
use stowage_entity::storage::{DropboxSettings, GDriveSettings, OAuthToken, OneDriveSettings};
use stowage_storage::client::ChunkedTransferClient;
use stowage_storage::engine::{StepContext, StepOutcome, copy_from_default};
use stowage_storage::providers::digest::dropbox_content_hash_bytes;
use stowage_storage::providers::dropbox::DropboxClient;
use stowage_storage::providers::gdrive::GDriveClient;
use stowage_storage::providers::onedrive::OneDriveClient;
use stowage_storage::registry::{ApiEndpoints, ClientContext};

const STORAGE_ID: i64 = 11;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // Chunks are larger than axum's default request body cap.
        axum::serve(listener, app.layer(DefaultBodyLimit::disable()))
            .await
            .unwrap();
    });
    format!("http://{addr}")
}

fn context(base: &str) -> ClientContext {
    ClientContext {
        transfer: TransferConfig {
            http_timeout_seconds: 10,
            ..TransferConfig::default()
        },
        backup_dir: PathBuf::from("."),
        endpoints: ApiEndpoints::rooted_at(base),
    }
}

fn token() -> OAuthToken {
    OAuthToken {
        access_token: "access".into(),
        refresh_token: String::new(),
        expires_at: None,
    }
}

fn step() -> StepContext {
    StepContext::with_budget(Duration::from_secs(30))
}

/// Run steps until the transfer leaves the in-flight states or `limit` is hit.
async fn drive(
    client: &mut dyn ChunkedTransferClient,
    package: &Package,
    info: &mut UploadInfo,
    limit: usize,
) -> Vec<StepOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..limit {
        let outcome = copy_from_default(client, package, info, 0, &step()).await;
        outcomes.push(outcome);
        if info.is_finished() {
            break;
        }
    }
    outcomes
}

fn start_of(content_range: &str) -> Option<u64> {
    content_range
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

fn total_of(content_range: &str) -> Option<u64> {
    content_range.rsplit('/').next()?.parse().ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

// Google Drive

#[derive(Default)]
struct Drive {
    base: String,
    session: Vec<u8>,
    /// Persist the next chunk but answer 503, as if the reply was lost.
    drop_next_reply: bool,
    md5: Option<String>,
    /// Report a digest that does not match what was received.
    corrupt: bool,
    probes: usize,
    /// Hold the next chunk reply past any reasonable slice.
    stall_next: bool,
}

type DriveState = Arc<Mutex<Drive>>;

async fn drive_list() -> Response {
    axum::Json(json!({ "files": [] })).into_response()
}

async fn drive_open(State(state): State<DriveState>) -> Response {
    let mut drive = state.lock().unwrap();
    drive.session.clear();
    let location = format!("{}/google/session/s1", drive.base);
    (StatusCode::OK, [(header::LOCATION, location)]).into_response()
}

fn drive_progress(len: usize) -> Response {
    if len == 0 {
        return StatusCode::PERMANENT_REDIRECT.into_response();
    }
    (
        StatusCode::PERMANENT_REDIRECT,
        [(header::RANGE, format!("bytes=0-{}", len - 1))],
    )
        .into_response()
}

async fn drive_put(State(state): State<DriveState>, headers: HeaderMap, body: Bytes) -> Response {
    let stall = std::mem::take(&mut state.lock().unwrap().stall_next);
    if stall {
        tokio::time::sleep(Duration::from_secs(6)).await;
    }
    let mut drive = state.lock().unwrap();
    let range = header_str(&headers, "content-range").to_string();
    if range == "bytes */*" {
        drive.probes += 1;
        return drive_progress(drive.session.len());
    }
    let (Some(start), Some(total)) = (start_of(&range), total_of(&range)) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if start != drive.session.len() as u64 {
        return drive_progress(drive.session.len());
    }
    drive.session.extend_from_slice(&body);
    if drive.drop_next_reply {
        drive.drop_next_reply = false;
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if drive.session.len() as u64 == total {
        let md5 = format!("{:x}", md5::compute(&drive.session));
        drive.md5 = Some(md5.clone());
        return (
            StatusCode::OK,
            axum::Json(json!({ "id": "f1", "md5Checksum": md5 })),
        )
            .into_response();
    }
    drive_progress(drive.session.len())
}

async fn drive_file(State(state): State<DriveState>, Path(id): Path<String>) -> Response {
    let drive = state.lock().unwrap();
    let md5 = if drive.corrupt {
        Some("0".repeat(32))
    } else {
        drive.md5.clone()
    };
    axum::Json(json!({ "id": id, "md5Checksum": md5 })).into_response()
}

async fn drive_mock() -> (String, DriveState) {
    let state: DriveState = Arc::default();
    let app = Router::new()
        .route("/google/drive/v3/files", get(drive_list))
        .route("/google/drive/v3/files/{id}", get(drive_file))
        .route("/google/upload/drive/v3/files", post(drive_open))
        .route("/google/session/{id}", put(drive_put))
        .with_state(state.clone());
    let base = serve(app).await;
    state.lock().unwrap().base = base.clone();
    (base, state)
}

fn drive_client(base: &str) -> GDriveClient {
    let settings = GDriveSettings {
        token: token(),
        client_id: "id".into(),
        client_secret: "secret".into(),
        storage_folder: String::new(),
        max_packages: 0,
    };
    GDriveClient::new(&settings, &context(base)).unwrap()
}

#[tokio::test]
async fn test_drive_probe_recovers_persisted_range() {
    let (base, state) = drive_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let size = 6 * MIB;
    let package = write_package(dir.path(), size, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = drive_client(&base);

    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::Progressed);
    assert_eq!(info.archive_offset, 2 * MIB);
    assert!(info.data.ends_with("/google/session/s1"));

    state.lock().unwrap().drop_next_reply = true;
    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::RecoverableError);
    assert_eq!(state.lock().unwrap().probes, 1);
    assert_eq!(info.archive_offset, 4_194_304);
    assert_eq!(info.failure_count, 1);
    assert!(!info.failed);

    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::Completed);
    assert!(info.copied_archive);

    let original = tokio::fs::read(package.local_dir.join(&package.archive_name))
        .await
        .unwrap();
    assert_eq!(state.lock().unwrap().session, original);
}

#[tokio::test]
async fn test_drive_checksum_mismatch_is_fatal() {
    let (base, state) = drive_mock().await;
    state.lock().unwrap().corrupt = true;
    let dir = tempfile::tempdir().unwrap();
    let package = write_package(dir.path(), 1024, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = drive_client(&base);

    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::Failed);
    assert!(info.failed);
    assert!(!info.copied_archive);
    assert!(info.status_message.contains("checksum mismatch"));
}

#[tokio::test]
async fn test_drive_chunk_stops_at_slice_end() {
    let (base, state) = drive_mock().await;
    state.lock().unwrap().stall_next = true;
    let dir = tempfile::tempdir().unwrap();
    let package = write_package(dir.path(), 4 * MIB, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = drive_client(&base);

    let started = Instant::now();
    let slice = StepContext::with_budget(Duration::from_secs(1));
    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &slice).await;
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    assert_eq!(outcome, StepOutcome::TimedOut);
    assert_eq!(info.archive_offset, 0);
    assert_eq!(info.failure_count, 0);
    assert!(!info.failed);
}

// Dropbox

#[derive(Default)]
struct Dropbox {
    sessions: HashMap<String, Vec<u8>>,
    files: HashMap<String, Vec<u8>>,
    drop_next_reply: bool,
}

type DropboxState = Arc<Mutex<Dropbox>>;

fn api_arg(headers: &HeaderMap) -> Value {
    serde_json::from_str(header_str(headers, "dropbox-api-arg")).unwrap_or(Value::Null)
}

fn incorrect_offset(correct: usize, nested: bool) -> Response {
    let error = json!({ ".tag": "incorrect_offset", "correct_offset": correct });
    let error = if nested {
        json!({ ".tag": "lookup_failed", "lookup_failed": error })
    } else {
        error
    };
    (
        StatusCode::CONFLICT,
        axum::Json(json!({ "error_summary": "incorrect_offset/..", "error": error })),
    )
        .into_response()
}

async fn dropbox_start(State(state): State<DropboxState>, body: Bytes) -> Response {
    let mut dropbox = state.lock().unwrap();
    let id = format!("sess{}", dropbox.sessions.len() + 1);
    dropbox.sessions.insert(id.clone(), body.to_vec());
    axum::Json(json!({ "session_id": id })).into_response()
}

async fn dropbox_append(
    State(state): State<DropboxState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let arg = api_arg(&headers);
    let id = arg["cursor"]["session_id"].as_str().unwrap_or_default().to_string();
    let offset = arg["cursor"]["offset"].as_u64().unwrap_or_default() as usize;
    let mut dropbox = state.lock().unwrap();
    let drop_reply = std::mem::take(&mut dropbox.drop_next_reply);
    let Some(session) = dropbox.sessions.get_mut(&id) else {
        return (
            StatusCode::CONFLICT,
            axum::Json(json!({ "error": { ".tag": "not_found" } })),
        )
            .into_response();
    };
    if offset != session.len() {
        return incorrect_offset(session.len(), false);
    }
    session.extend_from_slice(&body);
    if drop_reply {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    axum::Json(Value::Null).into_response()
}

async fn dropbox_finish(
    State(state): State<DropboxState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let arg = api_arg(&headers);
    let id = arg["cursor"]["session_id"].as_str().unwrap_or_default().to_string();
    let offset = arg["cursor"]["offset"].as_u64().unwrap_or_default() as usize;
    let path = arg["commit"]["path"].as_str().unwrap_or_default().to_string();
    let mut dropbox = state.lock().unwrap();
    let Some(mut session) = dropbox.sessions.remove(&id) else {
        return (
            StatusCode::CONFLICT,
            axum::Json(json!({ "error": { ".tag": "lookup_failed", "lookup_failed": { ".tag": "not_found" } } })),
        )
            .into_response();
    };
    if offset != session.len() {
        let len = session.len();
        dropbox.sessions.insert(id, session);
        return incorrect_offset(len, true);
    }
    session.extend_from_slice(&body);
    let hash = dropbox_content_hash_bytes(&session);
    dropbox.files.insert(path.clone(), session);
    axum::Json(json!({ "path_display": path, "content_hash": hash })).into_response()
}

async fn dropbox_mock() -> (String, DropboxState) {
    let state: DropboxState = Arc::default();
    let app = Router::new()
        .route("/dropbox/content/files/upload_session/start", post(dropbox_start))
        .route("/dropbox/content/files/upload_session/append_v2", post(dropbox_append))
        .route("/dropbox/content/files/upload_session/finish", post(dropbox_finish))
        .with_state(state.clone());
    (serve(app).await, state)
}

#[tokio::test]
async fn test_dropbox_incorrect_offset_corrects_cursor() {
    let (base, state) = dropbox_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let size = 5 * MIB;
    let package = write_package(dir.path(), size, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let settings = DropboxSettings {
        token: token(),
        app_key: "key".into(),
        app_secret: "secret".into(),
        storage_folder: "/backups".into(),
        max_packages: 0,
    };
    let mut client = DropboxClient::new(&settings, &context(&base)).unwrap();

    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::Progressed);
    assert_eq!(info.archive_offset, 2 * MIB);
    assert_eq!(info.upload_id, "sess1");

    state.lock().unwrap().drop_next_reply = true;
    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::RecoverableError);
    assert_eq!(info.archive_offset, 4 * MIB);
    assert_eq!(info.failure_count, 1);

    let outcomes = drive(&mut client, &package, &mut info, 4).await;
    assert_eq!(outcomes.last(), Some(&StepOutcome::Completed));
    assert_eq!(info.failure_count, 0);

    let original = tokio::fs::read(package.local_dir.join(&package.archive_name))
        .await
        .unwrap();
    let stored = state.lock().unwrap().files.get(&format!("/backups/{}", package.archive_name)).cloned();
    assert_eq!(stored, Some(original));
}

// OneDrive

#[derive(Default)]
struct Graph {
    base: String,
    upload: Vec<u8>,
    drop_next_reply: bool,
    /// Accept the next chunk with a bare 202 and no range report.
    blank_next_reply: bool,
    /// Leave `sha256Hash` out of the final item, as business drives do.
    omit_hash: bool,
    sessions: usize,
    finished: Option<String>,
}

type GraphState = Arc<Mutex<Graph>>;

async fn graph_session(State(state): State<GraphState>) -> Response {
    let mut graph = state.lock().unwrap();
    graph.upload.clear();
    graph.sessions += 1;
    axum::Json(json!({
        "uploadUrl": format!("{}/graph-upload/u1", graph.base),
        "expirationDateTime": (chrono::Utc::now() + chrono::Duration::days(1)).to_rfc3339(),
        "nextExpectedRanges": ["0-"],
    }))
    .into_response()
}

fn expected_ranges(len: usize) -> Response {
    (
        StatusCode::ACCEPTED,
        axum::Json(json!({ "nextExpectedRanges": [format!("{len}-")] })),
    )
        .into_response()
}

async fn graph_put(State(state): State<GraphState>, headers: HeaderMap, body: Bytes) -> Response {
    if headers.contains_key(header::AUTHORIZATION) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let range = header_str(&headers, "content-range").to_string();
    let (Some(start), Some(total)) = (start_of(&range), total_of(&range)) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let mut graph = state.lock().unwrap();
    if start != graph.upload.len() as u64 {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            axum::Json(json!({ "error": { "code": "invalidRange" } })),
        )
            .into_response();
    }
    graph.upload.extend_from_slice(&body);
    if std::mem::take(&mut graph.drop_next_reply) {
        return StatusCode::BAD_GATEWAY.into_response();
    }
    if graph.upload.len() as u64 == total {
        let hash = hex::encode(Sha256::digest(&graph.upload)).to_uppercase();
        graph.finished = Some(hash.clone());
        let hashes = if graph.omit_hash {
            json!({ "quickXorHash": "AAAA" })
        } else {
            json!({ "sha256Hash": hash })
        };
        return (
            StatusCode::CREATED,
            axum::Json(json!({
                "name": "archive",
                "size": total,
                "file": { "hashes": hashes },
            })),
        )
            .into_response();
    }
    if std::mem::take(&mut graph.blank_next_reply) {
        return StatusCode::ACCEPTED.into_response();
    }
    expected_ranges(graph.upload.len())
}

async fn graph_probe(State(state): State<GraphState>) -> Response {
    let graph = state.lock().unwrap();
    (
        StatusCode::OK,
        axum::Json(json!({ "nextExpectedRanges": [format!("{}-", graph.upload.len())] })),
    )
        .into_response()
}

/// Freshly uploaded items are not yet visible to item lookups.
async fn graph_item() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn graph_mock() -> (String, GraphState) {
    let state: GraphState = Arc::default();
    let app = Router::new()
        .route(
            "/graph/me/drive/root:/{*path}",
            post(graph_session).get(graph_item),
        )
        .route("/graph-upload/u1", put(graph_put).get(graph_probe))
        .with_state(state.clone());
    let base = serve(app).await;
    state.lock().unwrap().base = base.clone();
    (base, state)
}

const GRAPH_CHUNK: u64 = 10 * 320 * 1024;

fn onedrive_client(base: &str, is_business: bool) -> OneDriveClient {
    let settings = OneDriveSettings {
        token: token(),
        client_id: "id".into(),
        client_secret: "secret".into(),
        storage_folder: "backups".into(),
        is_business,
        max_packages: 0,
    };
    OneDriveClient::new(&settings, &context(base)).unwrap()
}

#[tokio::test]
async fn test_onedrive_next_expected_ranges_drive_resume() {
    let (base, state) = graph_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let chunk = GRAPH_CHUNK;
    let size = 3 * chunk + 1000;
    let package = write_package(dir.path(), size, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = onedrive_client(&base, false);

    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::Progressed);
    assert_eq!(info.archive_offset, chunk);

    state.lock().unwrap().drop_next_reply = true;
    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::RecoverableError);
    assert_eq!(info.archive_offset, 2 * chunk);

    let outcomes = drive(&mut client, &package, &mut info, 4).await;
    assert_eq!(outcomes.last(), Some(&StepOutcome::Completed));
    assert!(info.copied_archive);
    assert!(state.lock().unwrap().finished.is_some());
}

#[tokio::test]
async fn test_onedrive_accepted_without_ranges_counts_as_failure() {
    let (base, state) = graph_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let size = 3 * GRAPH_CHUNK + 1000;
    let package = write_package(dir.path(), size, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = onedrive_client(&base, false);

    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::Progressed);

    state.lock().unwrap().blank_next_reply = true;
    let outcome = copy_from_default(&mut client, &package, &mut info, 0, &step()).await;
    assert_eq!(outcome, StepOutcome::RecoverableError);
    assert_eq!(info.failure_count, 1);
    // The session status query puts the cursor where the upload really is.
    assert_eq!(info.archive_offset, 2 * GRAPH_CHUNK);

    let outcomes = drive(&mut client, &package, &mut info, 4).await;
    assert_eq!(outcomes.last(), Some(&StepOutcome::Completed));
    let graph = state.lock().unwrap();
    assert_eq!(graph.sessions, 1);
    assert_eq!(graph.upload.len() as u64, size);
}

#[tokio::test]
async fn test_onedrive_business_item_lag_is_tolerated() {
    let (base, state) = graph_mock().await;
    state.lock().unwrap().omit_hash = true;
    let dir = tempfile::tempdir().unwrap();
    let package = write_package(dir.path(), GRAPH_CHUNK + 1000, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = onedrive_client(&base, true);

    let outcomes = drive(&mut client, &package, &mut info, 4).await;
    assert_eq!(outcomes.last(), Some(&StepOutcome::Completed));
    assert!(info.copied_archive);
    assert!(!info.failed);
}

#[tokio::test]
async fn test_onedrive_personal_item_missing_after_upload_is_fatal() {
    let (base, state) = graph_mock().await;
    state.lock().unwrap().omit_hash = true;
    let dir = tempfile::tempdir().unwrap();
    let package = write_package(dir.path(), GRAPH_CHUNK + 1000, STORAGE_ID).await;
    let mut info = package.upload_info(STORAGE_ID).cloned().unwrap();
    info.copied_installer = true;
    let mut client = onedrive_client(&base, false);

    let outcomes = drive(&mut client, &package, &mut info, 4).await;
    assert_eq!(outcomes.last(), Some(&StepOutcome::Failed));
    assert!(info.failed);
    assert!(!info.copied_archive);
}
