//! Session-level tests driving the state machine with crafted messages.
//!
//! Uses the JSON codec and in-memory storage from tether-mocks; messages are
//! built the way the parser façade would deliver them.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tether_mocks::{JsonCodec, MemoryStore, MockStorageProvider};

use tether_core::auth::{encode_md5_auth, AuthType};
use tether_core::config::{DatabasePair, SessionConfig};
use tether_core::device_info::DeviceInfo;
use tether_core::persist::changelog::ChangeLog;
use tether_core::persist::nonces::NonceStore;
use tether_core::persist::Database;
use tether_core::proto::{
    ProtocolVersion, Role, StatusCode, AUTH_FORMAT_BASIC, AUTH_FORMAT_MD5, FORMAT_ENCODING_B64,
};
use tether_core::session::{SessionHandler, SyncState};
use tether_core::storage::conflict::ConflictPolicy;
use tether_core::storage::LocalChanges;
use tether_core::sync_mode::{SyncDirection, SyncMode};
use tether_core::wire::{
    AlertParams, Challenge, CommandKind, CommandParams, Fragment, HeaderParams, ItemParams,
    MapItem, MapParams, MetaParams, OutgoingMessage, ParsedMessage, StatusParams, SyncParams,
};

const CLIENT_DEVICE: &str = "IMEI:1234";
const SERVER_DEVICE: &str = "pc-suite";

fn base_config(db_path: &str) -> SessionConfig {
    SessionConfig {
        local_device_name: CLIENT_DEVICE.to_string(),
        remote_device_name: SERVER_DEVICE.to_string(),
        protocol_version: ProtocolVersion::V12,
        sync_mode: SyncMode::default(),
        auth_type: AuthType::None,
        username: String::new(),
        password: String::new(),
        conflict_policy: ConflictPolicy::PreferLocal,
        max_changes_per_message: 22,
        database_file_path: db_path.to_string(),
        database_pairs: vec![DatabasePair {
            source: "./contacts".to_string(),
            target: "./contacts".to_string(),
        }],
        disabled_databases: Vec::new(),
        extensions: Default::default(),
        receive_timeout_secs: None,
        device_info: DeviceInfo { device_id: CLIENT_DEVICE.to_string(), ..Default::default() },
    }
}

async fn client_session(
    config: SessionConfig,
    store: Arc<Mutex<MemoryStore>>,
) -> SessionHandler {
    let mut provider = MockStorageProvider::new();
    provider.add_shared_store("./contacts", store);
    SessionHandler::new(config, Role::Client, Box::new(provider), Arc::new(JsonCodec::new()))
        .await
        .expect("session setup")
}

async fn server_session(
    config: SessionConfig,
    store: Arc<Mutex<MemoryStore>>,
) -> SessionHandler {
    let mut provider = MockStorageProvider::new();
    provider.add_shared_store("./contacts", store);
    SessionHandler::new(config, Role::Server, Box::new(provider), Arc::new(JsonCodec::new()))
        .await
        .expect("session setup")
}

/// Seed a previous session's anchors so a fast sync is possible.
async fn seed_changelog(db_path: &str, remote_device: &str, local: &str, remote: &str) {
    let db = Database::open(db_path).await.unwrap();
    let mut log = ChangeLog::new(remote_device, "./contacts", SyncDirection::TwoWay);
    log.set_last_local_anchor(local);
    log.set_last_remote_anchor(remote);
    log.set_last_sync_time(chrono::Utc::now());
    log.save(&db).await.unwrap();
}

// ---- message crafting ----

fn peer_header(session_id: &str, msg_id: u32) -> HeaderParams {
    HeaderParams {
        ver_dtd: "1.2".to_string(),
        ver_proto: "SyncML/1.2".to_string(),
        session_id: session_id.to_string(),
        msg_id,
        target_device: CLIENT_DEVICE.to_string(),
        source_device: SERVER_DEVICE.to_string(),
        ..Default::default()
    }
}

fn hdr_status(msg_ref: u32, code: StatusCode) -> StatusParams {
    StatusParams {
        cmd_id: 1,
        msg_ref,
        cmd_ref: 0,
        cmd: "SyncHdr".to_string(),
        target_ref: None,
        source_ref: None,
        code: code.as_u16(),
        next_anchor: None,
        items: Vec::new(),
        chal: None,
    }
}

fn cmd_status(msg_ref: u32, cmd_ref: u32, cmd: &str, code: StatusCode) -> StatusParams {
    StatusParams {
        cmd_id: 2,
        msg_ref,
        cmd_ref,
        cmd: cmd.to_string(),
        target_ref: None,
        source_ref: None,
        code: code.as_u16(),
        next_anchor: None,
        items: Vec::new(),
        chal: None,
    }
}

fn ack_alert(code: u16, next_anchor: &str) -> AlertParams {
    AlertParams {
        cmd_id: 9,
        no_resp: false,
        code,
        cred: None,
        target_database: Some("./contacts".to_string()),
        source_database: Some("./contacts".to_string()),
        last_anchor: None,
        next_anchor: Some(next_anchor.to_string()),
        mime: None,
    }
}

fn add_command(cmd_id: u32, remote_key: &str, data: &[u8]) -> CommandParams {
    CommandParams {
        kind: CommandKind::Add,
        cmd_id,
        no_resp: false,
        meta: MetaParams { mime: Some("text/x-vcard".to_string()), ..Default::default() },
        items: vec![ItemParams {
            source: Some(remote_key.to_string()),
            data: data.to_vec(),
            ..Default::default()
        }],
    }
}

fn replace_chunk(cmd_id: u32, local_key: &str, data: &[u8], more: bool, size: Option<u64>) -> CommandParams {
    CommandParams {
        kind: CommandKind::Replace,
        cmd_id,
        no_resp: false,
        meta: MetaParams { mime: Some("text/x-vcard".to_string()), ..Default::default() },
        items: vec![ItemParams {
            target: Some(local_key.to_string()),
            data: data.to_vec(),
            more_data: more,
            meta: MetaParams { size, ..Default::default() },
            ..Default::default()
        }],
    }
}

fn message(fragments: Vec<Fragment>) -> ParsedMessage {
    ParsedMessage { fragments }
}

// ---- outbound inspection ----

fn statuses(msg: &OutgoingMessage) -> Vec<&StatusParams> {
    msg.body
        .iter()
        .filter_map(|f| match f {
            Fragment::Status(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn sync_containers(msg: &OutgoingMessage) -> Vec<&SyncParams> {
    msg.body
        .iter()
        .filter_map(|f| match f {
            Fragment::Sync(s) => Some(s),
            _ => None,
        })
        .collect()
}

fn alerts(msg: &OutgoingMessage) -> Vec<&AlertParams> {
    msg.body
        .iter()
        .filter_map(|f| match f {
            Fragment::Alert(a) => Some(a),
            _ => None,
        })
        .collect()
}

fn maps(msg: &OutgoingMessage) -> Vec<&MapParams> {
    msg.body
        .iter()
        .filter_map(|f| match f {
            Fragment::Map(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn status_with_code(msg: &OutgoingMessage, code: StatusCode) -> Option<&StatusParams> {
    statuses(msg).into_iter().find(|s| s.code == code.as_u16())
}

/// Find the cmd id of the first command of `kind` in a sync container.
fn command_id(msg: &OutgoingMessage, kind: CommandKind) -> Option<u32> {
    sync_containers(msg)
        .iter()
        .flat_map(|s| s.commands.iter())
        .find(|c| c.kind == kind)
        .map(|c| c.cmd_id)
}

// ---- scenario 1: client fast two-way success ----

#[tokio::test]
async fn client_fast_two_way_success() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L-prev", "R-prev").await;

    let store = MemoryStore::shared();
    {
        let mut s = store.lock().unwrap();
        s.insert("A", b"new card");
        s.insert("B", b"changed card");
        s.local_changes = LocalChanges {
            added: vec!["A".to_string()],
            modified: vec!["B".to_string()],
            removed: vec![],
        };
    }

    let mut session = client_session(base_config(db_path), store.clone()).await;

    // Package 1: initialization with a fast two-way alert.
    let init = session.initiate().await.unwrap().expect("init message");
    assert!(init.final_marker);
    let init_alerts = alerts(&init);
    assert_eq!(init_alerts.len(), 1);
    assert_eq!(init_alerts[0].code, 200);
    assert_eq!(init_alerts[0].last_anchor.as_deref(), Some("L-prev"));
    let client_next_anchor = init_alerts[0].next_anchor.clone().unwrap();
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = init_alerts[0].cmd_id;

    // Server accepts the alert and finishes its init package.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(200, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    // Package 2: our modifications.
    let modifications = outcome.response.expect("modifications message");
    assert!(modifications.final_marker);
    let container = &sync_containers(&modifications)[0];
    assert_eq!(container.source_database, "./contacts");
    let kinds: Vec<CommandKind> = container.commands.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![CommandKind::Add, CommandKind::Replace]);
    assert_eq!(container.commands[0].items[0].source.as_deref(), Some("A"));
    assert_eq!(container.commands[1].items[0].source.as_deref(), Some("B"));
    let add_cmd_id = container.commands[0].cmd_id;
    let replace_cmd_id = container.commands[1].cmd_id;
    let modifications_msg_id = modifications.header.msg_id;

    // Server acknowledges our items and sends one Add of its own.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 2)),
            Fragment::Status(hdr_status(2, StatusCode::Success)),
            Fragment::Status(cmd_status(modifications_msg_id, add_cmd_id, "Add", StatusCode::ItemAdded)),
            Fragment::Status(cmd_status(modifications_msg_id, replace_cmd_id, "Replace", StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: Some(1),
                meta: MetaParams::default(),
                commands: vec![add_command(4, "X", b"server card")],
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    // Package 3: status for the server's Add plus the Map command.
    let mappings = outcome.response.expect("mapping message");
    assert!(mappings.final_marker);

    // One status per inbound item plus the container status and the header
    // status.
    let status_codes: Vec<u16> = statuses(&mappings).iter().map(|s| s.code).collect();
    assert!(status_codes.contains(&StatusCode::ItemAdded.as_u16()));
    assert_eq!(statuses(&mappings).len(), 3);

    let map = &maps(&mappings)[0];
    assert_eq!(map.map_items.len(), 1);
    assert_eq!(map.map_items[0].target, "X");
    let new_local_key = map.map_items[0].source.clone();
    assert!(store.lock().unwrap().items.contains_key(&new_local_key));
    let map_cmd_id = map.cmd_id;
    let mappings_msg_id = mappings.header.msg_id;

    // Server acknowledges the mapping; session finalizes.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 3)),
            Fragment::Status(hdr_status(3, StatusCode::Success)),
            Fragment::Status(cmd_status(mappings_msg_id, map_cmd_id, "Map", StatusCode::Success)),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    assert!(outcome.finished);
    assert_eq!(session.state(), SyncState::SyncFinished);
    assert!(session.results().is_success());
    assert_eq!(session.results().targets()["./contacts"].remote.added, 1);
    assert_eq!(session.results().targets()["./contacts"].remote.modified, 1);
    assert_eq!(session.results().targets()["./contacts"].local.added, 1);

    // Anchors advanced and the mapping was persisted.
    let db = Database::open(db_path).await.unwrap();
    let mut log = ChangeLog::new(SERVER_DEVICE, "./contacts", SyncDirection::TwoWay);
    assert!(log.load(&db).await.unwrap());
    assert_eq!(log.last_local_anchor(), client_next_anchor);
    assert_eq!(log.last_remote_anchor(), "S-next");
    assert_eq!(log.maps().len(), 1);
    assert_eq!(log.maps()[0].remote_uid, "X");
    assert_eq!(log.maps()[0].local_uid, new_local_key);
}

// ---- scenario 2: slow-sync fallback ----

#[tokio::test]
async fn client_reverts_to_slow_sync_on_server_alert() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;

    let store = MemoryStore::shared();
    {
        let mut s = store.lock().unwrap();
        s.insert("A", b"card a");
        s.insert("B", b"card b");
        // Scripted incremental answer; must NOT be used after the revert.
        s.local_changes = LocalChanges {
            added: vec![],
            modified: vec!["B".to_string()],
            removed: vec![],
        };
    }

    let mut session = client_session(base_config(db_path), store).await;
    let init = session.initiate().await.unwrap().unwrap();
    assert_eq!(alerts(&init)[0].code, 200, "fast sync requested");
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = alerts(&init)[0].cmd_id;

    // Server replies with a slow-sync alert: its anchors disagreed.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(201, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    // All items go out as additions, via get_all.
    let modifications = outcome.response.unwrap();
    let container = &sync_containers(&modifications)[0];
    assert_eq!(container.commands.len(), 2);
    assert!(container.commands.iter().all(|c| c.kind == CommandKind::Add));
    let sent: Vec<_> =
        container.commands.iter().map(|c| c.items[0].source.clone().unwrap()).collect();
    assert_eq!(sent, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn server_forces_slow_sync_on_anchor_mismatch() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    // Stored remote anchor L2; client will present L1.
    seed_changelog(db_path, CLIENT_DEVICE, "S-prev", "L2").await;

    let store = MemoryStore::shared();
    let mut config = base_config(db_path);
    config.local_device_name = SERVER_DEVICE.to_string();
    config.remote_device_name = CLIENT_DEVICE.to_string();
    config.device_info.device_id = SERVER_DEVICE.to_string();
    let mut session = server_session(config, store).await;
    assert!(session.initiate().await.unwrap().is_none());

    let outcome = session
        .process_message(message(vec![
            Fragment::Header(HeaderParams {
                ver_dtd: "1.2".to_string(),
                ver_proto: "SyncML/1.2".to_string(),
                session_id: "77".to_string(),
                msg_id: 1,
                target_device: SERVER_DEVICE.to_string(),
                source_device: CLIENT_DEVICE.to_string(),
                ..Default::default()
            }),
            Fragment::Alert(AlertParams {
                cmd_id: 1,
                no_resp: false,
                code: 200,
                cred: None,
                target_database: Some("./contacts".to_string()),
                source_database: Some("./contacts".to_string()),
                last_anchor: Some("L1".to_string()),
                next_anchor: Some("N1".to_string()),
                mime: None,
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    let response = outcome.response.expect("server init response");
    // The acknowledging alert downgrades to slow sync (code 201).
    let response_alerts = alerts(&response);
    assert_eq!(response_alerts.len(), 1);
    assert_eq!(response_alerts[0].code, 201);
    // The client's alert itself was accepted.
    assert!(status_with_code(&response, StatusCode::Success).is_some());
}

// ---- scenario 3: MD5 authentication with next-nonce ----

#[tokio::test]
async fn md5_authentication_rotates_nonce() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    // Nonce from a previous session.
    {
        let db = Database::open(db_path).await.unwrap();
        NonceStore::new(CLIENT_DEVICE, SERVER_DEVICE).set_nonce(&db, b"N0").await.unwrap();
    }

    let store = MemoryStore::shared();
    store.lock().unwrap().insert("A", b"card");
    let mut config = base_config(db_path);
    config.auth_type = AuthType::Md5;
    config.username = "u".to_string();
    config.password = "p".to_string();

    let mut session = client_session(config, store).await;
    let init = session.initiate().await.unwrap().unwrap();

    // Credentials are MD5 over the stored nonce N0.
    let cred = init.header.cred.as_ref().expect("credentials");
    assert_eq!(cred.meta.mime.as_deref(), Some(AUTH_FORMAT_MD5));
    assert_eq!(cred.data, BASE64.encode(encode_md5_auth("u", "p", b"N0")));
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = alerts(&init)[0].cmd_id;

    // Server accepts and issues next-nonce N1.
    session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(StatusParams {
                chal: Some(Challenge {
                    meta: MetaParams {
                        mime: Some(AUTH_FORMAT_MD5.to_string()),
                        format: Some(FORMAT_ENCODING_B64.to_string()),
                        next_nonce: Some(BASE64.encode(b"N1")),
                        ..Default::default()
                    },
                }),
                ..hdr_status(1, StatusCode::AuthAccepted)
            }),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(201, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    // The stored nonce is now exactly N1, ready for the next session.
    let db = Database::open(db_path).await.unwrap();
    let stored = NonceStore::new(CLIENT_DEVICE, SERVER_DEVICE).nonce(&db).await.unwrap();
    assert_eq!(stored, b"N1");
}

// ---- scenario 4: large object across three messages ----

#[tokio::test]
async fn large_object_reassembled_across_messages() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;

    let store = MemoryStore::shared();
    store.lock().unwrap().insert("K", b"old value");

    let mut session = client_session(base_config(db_path), store.clone()).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = alerts(&init)[0].cmd_id;

    // Server accepts; client sends its (empty) modifications.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(200, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();
    assert!(outcome.response.unwrap().final_marker);

    // First chunk declares Size=12.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 2)),
            Fragment::Status(hdr_status(2, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: None,
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"ABCD", true, Some(12))],
            }),
        ]))
        .await
        .unwrap();
    let response = outcome.response.expect("chunk ack");
    assert!(!response.final_marker, "server package still open");
    assert!(status_with_code(&response, StatusCode::ChunkedItemAccepted).is_some());

    // Second chunk continues.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 3)),
            Fragment::Status(hdr_status(3, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: None,
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"EFGH", true, None)],
            }),
        ]))
        .await
        .unwrap();
    let response = outcome.response.expect("chunk ack");
    assert!(status_with_code(&response, StatusCode::ChunkedItemAccepted).is_some());

    // Final chunk commits the item.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 4)),
            Fragment::Status(hdr_status(4, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: None,
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"IJKL", false, None)],
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();
    let response = outcome.response.expect("commit ack");
    assert!(status_with_code(&response, StatusCode::Success).is_some());

    // Byte-for-byte reassembly.
    assert_eq!(store.lock().unwrap().items["K"].data, b"ABCDEFGHIJKL");
}

#[tokio::test]
async fn large_object_size_mismatch_is_rejected() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;

    let store = MemoryStore::shared();
    store.lock().unwrap().insert("K", b"old value");

    let mut session = client_session(base_config(db_path), store.clone()).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = alerts(&init)[0].cmd_id;

    session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(200, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 2)),
            Fragment::Status(hdr_status(2, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: None,
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"ABCD", true, Some(12))],
            }),
        ]))
        .await
        .unwrap();

    // Declared 12 bytes, delivering only 8.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 3)),
            Fragment::Status(hdr_status(3, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: None,
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"EFGH", false, None)],
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    let response = outcome.response.expect("rejection");
    assert!(status_with_code(&response, StatusCode::SizeMismatch).is_some());
    // The datastore kept the old value.
    assert_eq!(store.lock().unwrap().items["K"].data, b"old value");
}

// ---- scenario 5: conflict, prefer-local ----

#[tokio::test]
async fn conflict_prefer_local_keeps_local_modification() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;

    let store = MemoryStore::shared();
    {
        let mut s = store.lock().unwrap();
        s.insert("K", b"locally edited");
        s.local_changes = LocalChanges {
            added: vec![],
            modified: vec!["K".to_string()],
            removed: vec![],
        };
    }

    let mut session = client_session(base_config(db_path), store.clone()).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = alerts(&init)[0].cmd_id;

    // Init acknowledged; our modifications (Replace K) go out.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(200, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();
    let modifications = outcome.response.unwrap();
    assert!(command_id(&modifications, CommandKind::Replace).is_some());

    // The server replaces the same item we modified locally.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 2)),
            Fragment::Status(hdr_status(2, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: Some(1),
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"server version", false, None)],
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    let response = outcome.response.unwrap();
    // Resolved client-winning: the peer learns its change was not taken.
    assert!(status_with_code(&response, StatusCode::ResolvedClientWinning).is_some());
    // Local record unchanged.
    assert_eq!(store.lock().unwrap().items["K"].data, b"locally edited");
}

#[tokio::test]
async fn conflict_prefer_remote_drops_local_change() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;

    let store = MemoryStore::shared();
    {
        let mut s = store.lock().unwrap();
        s.insert("K", b"locally edited");
        s.local_changes = LocalChanges {
            added: vec![],
            modified: vec!["K".to_string()],
            removed: vec![],
        };
    }

    let mut config = base_config(db_path);
    config.conflict_policy = ConflictPolicy::PreferRemote;

    let mut session = client_session(config, store.clone()).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();
    let alert_cmd_id = alerts(&init)[0].cmd_id;

    // Deliver the server's conflicting replace while initialization
    // acknowledges; the collapsed form keeps the test compact.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Status(cmd_status(1, alert_cmd_id, "Alert", StatusCode::Success)),
            Fragment::Alert(ack_alert(200, "S-next")),
            Fragment::Final,
        ]))
        .await
        .unwrap();
    // Our modifications went out with the Replace for K.
    let modifications = outcome.response.unwrap();
    assert!(command_id(&modifications, CommandKind::Replace).is_some());

    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 2)),
            Fragment::Status(hdr_status(2, StatusCode::Success)),
            Fragment::Sync(SyncParams {
                cmd_id: 3,
                no_resp: false,
                target_database: "./contacts".to_string(),
                source_database: "./contacts".to_string(),
                number_of_changes: Some(1),
                meta: MetaParams::default(),
                commands: vec![replace_chunk(4, "K", b"server version", false, None)],
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    let response = outcome.response.unwrap();
    assert!(status_with_code(&response, StatusCode::Success).is_some());
    // Remote side won: datastore carries the server version.
    assert_eq!(store.lock().unwrap().items["K"].data, b"server version");
}

// ---- scenario 6: basic challenge when MD5 is enforced ----

#[tokio::test]
async fn basic_challenge_when_md5_enforced_fails_auth() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    {
        let db = Database::open(db_path).await.unwrap();
        NonceStore::new(CLIENT_DEVICE, SERVER_DEVICE).set_nonce(&db, b"N0").await.unwrap();
    }

    let store = MemoryStore::shared();
    store.lock().unwrap().insert("A", b"card");
    let mut config = base_config(db_path);
    config.auth_type = AuthType::Md5;
    config.username = "u".to_string();
    config.password = "p".to_string();

    let mut session = client_session(config, store).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();

    // Server rejects our credentials and challenges with basic: a downgrade.
    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(StatusParams {
                chal: Some(Challenge {
                    meta: MetaParams {
                        mime: Some(AUTH_FORMAT_BASIC.to_string()),
                        ..Default::default()
                    },
                }),
                ..hdr_status(1, StatusCode::InvalidCred)
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    assert!(outcome.finished);
    assert_eq!(session.state(), SyncState::AuthFailed);
    assert!(session.results().error_string().contains("MD5 is enforced"));

    // Failed sessions leave anchors untouched.
    let db = Database::open(db_path).await.unwrap();
    let mut log = ChangeLog::new(SERVER_DEVICE, "./contacts", SyncDirection::TwoWay);
    assert!(!log.load(&db).await.unwrap());
}

// ---- remote busy ----

#[tokio::test]
async fn busy_status_holds_next_send() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;
    let store = MemoryStore::shared();
    let mut session = client_session(base_config(db_path), store).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();

    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::InProgress)),
        ]))
        .await
        .unwrap();

    assert!(outcome.busy);
    assert!(outcome.response.is_none());
    assert!(!outcome.finished);
}

// ---- forbidden commands ----

#[tokio::test]
async fn map_to_client_is_not_allowed() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;
    let store = MemoryStore::shared();
    let mut session = client_session(base_config(db_path), store).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();

    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header(&session_id, 1)),
            Fragment::Status(hdr_status(1, StatusCode::Success)),
            Fragment::Map(MapParams {
                cmd_id: 2,
                target: "./contacts".to_string(),
                source: "./contacts".to_string(),
                map_items: vec![MapItem { target: "a".to_string(), source: "b".to_string() }],
            }),
        ]))
        .await
        .unwrap();

    let response = outcome.response.expect("status response");
    assert!(status_with_code(&response, StatusCode::CommandNotAllowed).is_some());
}

#[tokio::test]
async fn sync_before_negotiation_is_rejected_on_server() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    let store = MemoryStore::shared();
    let mut config = base_config(db_path);
    config.local_device_name = SERVER_DEVICE.to_string();
    config.remote_device_name = CLIENT_DEVICE.to_string();
    // The pairing table does not know this database, so even the collapsed
    // initialization cannot set it up.
    config.database_pairs.clear();
    config.disabled_databases.push("./secret".to_string());

    let mut session = server_session(config, store).await;
    session.initiate().await.unwrap();

    let outcome = session
        .process_message(message(vec![
            Fragment::Header(HeaderParams {
                ver_dtd: "1.2".to_string(),
                ver_proto: "SyncML/1.2".to_string(),
                session_id: "42".to_string(),
                msg_id: 1,
                target_device: SERVER_DEVICE.to_string(),
                source_device: CLIENT_DEVICE.to_string(),
                ..Default::default()
            }),
            Fragment::Sync(SyncParams {
                cmd_id: 2,
                no_resp: false,
                target_database: "./secret".to_string(),
                source_database: "./secret".to_string(),
                number_of_changes: None,
                meta: MetaParams::default(),
                commands: vec![add_command(3, "X", b"data")],
            }),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    let response = outcome.response.expect("rejection statuses");
    assert!(status_with_code(&response, StatusCode::NotFound).is_some());
}

// ---- unsupported protocol version ----

#[tokio::test]
async fn unsupported_protocol_version_terminates() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;
    let store = MemoryStore::shared();
    let mut session = client_session(base_config(db_path), store).await;
    let init = session.initiate().await.unwrap().unwrap();
    let session_id = init.header.session_id.clone();

    let mut header = peer_header(&session_id, 1);
    header.ver_proto = "SyncML/3.0".to_string();

    let outcome = session
        .process_message(message(vec![Fragment::Header(header), Fragment::Final]))
        .await
        .unwrap();

    assert!(outcome.finished);
    assert_eq!(session.state(), SyncState::UnsupportedProtocol);
    let response = outcome.response.expect("status 513 goes out");
    assert!(status_with_code(&response, StatusCode::UnsupportedProtocolVersion).is_some());
}

// ---- session id must not change mid-session ----

#[tokio::test]
async fn session_id_change_mid_session_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db_path = tmp.path().join("sync.db");
    let db_path = db_path.to_str().unwrap();

    seed_changelog(db_path, SERVER_DEVICE, "L1", "R1").await;
    let store = MemoryStore::shared();
    let mut session = client_session(base_config(db_path), store).await;
    session.initiate().await.unwrap();

    let outcome = session
        .process_message(message(vec![
            Fragment::Header(peer_header("some-other-session", 1)),
            Fragment::Final,
        ]))
        .await
        .unwrap();

    assert!(outcome.finished);
    assert_eq!(session.state(), SyncState::InvalidSyncmlMessage);
    let response = outcome.response.expect("status 506 goes out");
    assert!(status_with_code(&response, StatusCode::ProcessingError).is_some());
}
