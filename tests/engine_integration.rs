//! End-to-end behaviour of the write and read engines over an on-disk
//! database.

use std::sync::Arc;

use agora_store::db::provables::get_by_fingerprints;
use agora_store::db::{KeyRow, ProvableRow};
use agora_store::entities::{ProvableFields, UpdateFields};
use agora_store::{
    Address, AddressSearch, Board, BoardOwner, Config, Engine, EngineContext, EngineDb, Entity,
    EntityKind, FixedClock, Key, Post, ReadOptions, StorageError, Subprotocol, Thread, Timestamp,
    Vote,
};
use tempfile::TempDir;

const T0: Timestamp = 1_700_000_000;

struct Harness {
    engine: Engine,
    clock: Arc<FixedClock>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: dir.path().to_path_buf(),
        node_id: "local-node".into(),
        lock_retry_backoff_ms: 1,
        ..Config::default()
    };
    let clock = Arc::new(FixedClock::new(T0));
    let ctx = EngineContext::with_clock(&config, clock.clone());
    let db = Arc::new(EngineDb::open(dir.path()).unwrap());
    Harness {
        engine: Engine::new(db, Arc::new(ctx)),
        clock,
        _dir: dir,
    }
}

fn provable(fp: &str, creation: Timestamp) -> ProvableFields {
    ProvableFields {
        fingerprint: fp.into(),
        creation,
        proof_of_work: format!("pow-{}", fp),
        signature: format!("sig-{}", fp),
    }
}

fn updated(last_update: Timestamp) -> UpdateFields {
    UpdateFields {
        last_update,
        update_proof_of_work: "upow".into(),
        update_signature: "usig".into(),
    }
}

fn key(fp: &str) -> Entity {
    Entity::Key(Key {
        provable: provable(fp, 100),
        key_type: "ed25519".into(),
        public_key: format!("pk-{}", fp),
        entity_version: 1,
        verified: true,
        ..Default::default()
    })
}

fn board(fp: &str, owner: &str, owners: &[(&str, u8)]) -> Board {
    Board {
        provable: provable(fp, 100),
        name: format!("board-{}", fp),
        board_owners: owners
            .iter()
            .map(|(k, level)| BoardOwner {
                key_fingerprint: k.to_string(),
                expiry: 0,
                level: *level,
            })
            .collect(),
        owner: owner.into(),
        owner_public_key: format!("pk-{}", owner),
        entity_version: 1,
        verified: true,
        ..Default::default()
    }
}

fn thread(fp: &str, board: &str, owner: &str) -> Entity {
    Entity::Thread(Thread {
        provable: provable(fp, 100),
        board: board.into(),
        name: format!("thread-{}", fp),
        owner: owner.into(),
        owner_public_key: format!("pk-{}", owner),
        entity_version: 1,
        verified: true,
        ..Default::default()
    })
}

fn post(fp: &str, board: &str, thread: &str, parent: &str, owner: &str) -> Entity {
    Entity::Post(Post {
        provable: provable(fp, 100),
        board: board.into(),
        thread: thread.into(),
        parent: parent.into(),
        body: format!("body of {}", fp),
        owner: owner.into(),
        owner_public_key: format!("pk-{}", owner),
        entity_version: 1,
        verified: true,
        ..Default::default()
    })
}

fn last_referenced(engine: &Engine, kind: EntityKind, fp: &str) -> Timestamp {
    let fps = vec![fp.to_string()];
    engine
        .db
        .with_conn(|conn| {
            let lr = match kind {
                EntityKind::Keys => get_by_fingerprints::<KeyRow>(conn, &fps)?
                    .first()
                    .map(|r| r.last_referenced()),
                EntityKind::Boards => get_by_fingerprints::<agora_store::db::BoardRow>(conn, &fps)?
                    .first()
                    .map(|r| r.last_referenced()),
                EntityKind::Threads => {
                    get_by_fingerprints::<agora_store::db::ThreadRow>(conn, &fps)?
                        .first()
                        .map(|r| r.last_referenced())
                }
                EntityKind::Posts => get_by_fingerprints::<agora_store::db::PostRow>(conn, &fps)?
                    .first()
                    .map(|r| r.last_referenced()),
                other => panic!("not used for {}", other),
            };
            Ok(lr.unwrap_or_else(|| panic!("{} {} not stored", kind, fp)))
        })
        .unwrap()
}

fn read_by_fp(engine: &Engine, kind: EntityKind, fp: &str) -> agora_store::Response {
    engine
        .reader
        .read(kind, &[fp.to_string()], &[], 0, 0, false, &ReadOptions::default())
        .unwrap()
}

#[test]
fn redelivery_is_idempotent() {
    let h = harness();
    let writer = &h.engine.writer;

    let first = writer.batch_insert(vec![key("k1")]).unwrap();
    assert_eq!(first.inserted, 1);

    h.clock.advance(60);
    let second = writer.batch_insert(vec![key("k1"), key("k1")]).unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 2);

    assert_eq!(h.engine.reader.database_counts().unwrap().keys, 1);
    let response = read_by_fp(&h.engine, EntityKind::Keys, "k1");
    assert_eq!(response.keys.len(), 1);
    assert!(response.keys[0].verified);
}

#[test]
fn updates_only_land_after_creation() {
    let h = harness();
    let writer = &h.engine.writer;
    writer
        .batch_insert(vec![Entity::Board(board("b1", "k1", &[]))])
        .unwrap();

    let edit = |last_update: Timestamp| {
        let mut b = board("b1", "k1", &[]);
        b.update = updated(last_update);
        b.description = format!("edited at {}", last_update);
        Entity::Board(b)
    };

    // Creation is 100
    for stale in [99, 100] {
        let m = writer.batch_insert(vec![edit(stale)]).unwrap();
        assert_eq!(m.skipped, 1);
        let stored = &read_by_fp(&h.engine, EntityKind::Boards, "b1").boards[0];
        assert_eq!(stored.description, "");
        assert_eq!(stored.update.last_update, 0);
    }

    let m = writer.batch_insert(vec![edit(101)]).unwrap();
    assert_eq!(m.updated, 1);
    let stored = &read_by_fp(&h.engine, EntityKind::Boards, "b1").boards[0];
    assert_eq!(stored.description, "edited at 101");
    assert_eq!(stored.update.last_update, 101);
    // Creation group is untouched
    assert_eq!(stored.provable, provable("b1", 100));

    // Re-sending the same update changes nothing
    let m = writer.batch_insert(vec![edit(101)]).unwrap();
    assert_eq!(m.skipped, 1);
}

#[test]
fn board_owner_set_is_reconciled() {
    let h = harness();
    let writer = &h.engine.writer;
    writer
        .batch_insert(vec![Entity::Board(board(
            "b1",
            "k0",
            &[("kA", 1), ("kB", 1), ("kC", 1)],
        ))])
        .unwrap();

    let mut b = board("b1", "k0", &[("kA", 2), ("kB", 1), ("kD", 1), ("kD", 3)]);
    b.update = updated(200);
    writer.batch_insert(vec![Entity::Board(b)]).unwrap();

    let owners = h.engine.reader.read_board_owners("b1", None).unwrap();
    let keys: Vec<(&str, u8)> = owners
        .iter()
        .map(|o| (o.key_fingerprint.as_str(), o.level))
        .collect();
    assert_eq!(keys, vec![("kA", 2), ("kB", 1), ("kD", 3)]);

    // A gated-out update must not touch the owner set
    let mut stale = board("b1", "k0", &[("kZ", 1)]);
    stale.update = updated(150);
    writer.batch_insert(vec![Entity::Board(stale)]).unwrap();
    assert_eq!(h.engine.reader.read_board_owners("b1", None).unwrap().len(), 3);

    let board = &read_by_fp(&h.engine, EntityKind::Boards, "b1").boards[0];
    assert_eq!(board.board_owners.len(), 3);
}

#[test]
fn self_parented_post_is_dropped_silently() {
    let h = harness();
    let m = h
        .engine
        .writer
        .batch_insert(vec![
            post("p1", "b1", "t1", "p1", "k1"),
            post("p2", "b1", "t1", "t1", "k1"),
        ])
        .unwrap();
    assert_eq!(m.dropped, 1);
    assert_eq!(m.inserted, 1);

    assert!(read_by_fp(&h.engine, EntityKind::Posts, "p1").posts.is_empty());
    assert_eq!(read_by_fp(&h.engine, EntityKind::Posts, "p2").posts.len(), 1);
}

#[test]
fn touch_cascade_follows_references() {
    let h = harness();
    let e = &h.engine;

    e.writer.batch_insert(vec![key("k1"), key("k2"), key("k3"), key("k4")]).unwrap();
    assert_eq!(last_referenced(e, EntityKind::Keys, "k1"), T0);

    h.clock.set(T0 + 1_000);
    e.writer
        .batch_insert(vec![Entity::Board(board("b1", "k1", &[("k4", 1)]))])
        .unwrap();
    assert_eq!(last_referenced(e, EntityKind::Keys, "k1"), T0 + 1_000);
    assert_eq!(last_referenced(e, EntityKind::Keys, "k4"), T0 + 1_000);

    // Stale re-delivery of the board touches nothing
    h.clock.set(T0 + 2_000);
    let m = e
        .writer
        .batch_insert(vec![Entity::Board(board("b1", "k1", &[("k4", 1)]))])
        .unwrap();
    assert_eq!(m.skipped, 1);
    assert_eq!(last_referenced(e, EntityKind::Keys, "k1"), T0 + 1_000);
    assert_eq!(last_referenced(e, EntityKind::Boards, "b1"), T0 + 1_000);

    h.clock.set(T0 + 3_000);
    e.writer
        .batch_insert(vec![
            thread("t1", "b1", "k2"),
            post("p1", "b1", "t1", "t1", "k3"),
        ])
        .unwrap();

    h.clock.set(T0 + 4_000);
    e.writer
        .batch_insert(vec![post("p2", "b1", "t1", "p1", "k3")])
        .unwrap();

    let now = T0 + 4_000;
    assert_eq!(last_referenced(e, EntityKind::Posts, "p1"), now);
    assert_eq!(last_referenced(e, EntityKind::Threads, "t1"), now);
    assert_eq!(last_referenced(e, EntityKind::Boards, "b1"), now);
    for k in ["k1", "k2", "k3", "k4"] {
        assert_eq!(last_referenced(e, EntityKind::Keys, k), now, "key {}", k);
    }
}

#[test]
fn vote_touches_only_its_owner() {
    let h = harness();
    let e = &h.engine;
    e.writer
        .batch_insert(vec![key("k1"), key("k2"), post("p1", "b1", "t1", "t1", "k1")])
        .unwrap();

    h.clock.set(T0 + 500);
    let vote = Entity::Vote(Vote {
        provable: provable("v1", 100),
        board: "b1".into(),
        thread: "t1".into(),
        target: "p1".into(),
        owner: "k2".into(),
        owner_public_key: "pk-k2".into(),
        type_class: 1,
        vote_type: 1,
        entity_version: 1,
        verified: true,
        ..Default::default()
    });
    e.writer.batch_insert(vec![vote]).unwrap();

    assert_eq!(last_referenced(e, EntityKind::Keys, "k2"), T0 + 500);
    assert_eq!(last_referenced(e, EntityKind::Posts, "p1"), T0);
    assert_eq!(last_referenced(e, EntityKind::Keys, "k1"), T0);
}

#[test]
fn fingerprints_and_window_are_exclusive() {
    let h = harness();
    let e = &h.engine;
    e.writer.batch_insert(vec![key("k1")]).unwrap();
    let fps = vec!["k1".to_string()];
    let opts = ReadOptions::default();

    let both = e.reader.read(EntityKind::Keys, &fps, &[], T0 - 100, 0, false, &opts);
    assert!(matches!(both, Err(StorageError::InvalidRequest(_))));

    let by_fp = e.reader.read(EntityKind::Keys, &fps, &[], 0, 0, false, &opts).unwrap();
    assert_eq!(by_fp.keys.len(), 1);

    let by_window = e
        .reader
        .read(EntityKind::Keys, &[], &[], T0 - 100, 0, false, &opts)
        .unwrap();
    assert_eq!(by_window.keys.len(), 1);

    // The local application may combine both
    let privileged = e
        .reader
        .read(EntityKind::Keys, &fps, &[], T0 - 100, 0, true, &opts)
        .unwrap();
    assert_eq!(privileged.keys.len(), 1);
}

#[test]
fn cache_boundary_hides_older_rows_from_peers() {
    let h = harness();
    let e = &h.engine;
    e.writer.batch_insert(vec![key("old")]).unwrap();
    h.clock.set(T0 + 1_000);
    e.writer.batch_insert(vec![key("new")]).unwrap();

    e.ctx.set_last_cache_generation(T0 + 500);
    let opts = ReadOptions::default();

    let peer = e.reader.read(EntityKind::Keys, &[], &[], 1, 0, false, &opts).unwrap();
    let fps: Vec<&str> = peer.keys.iter().map(|k| k.provable.fingerprint.as_str()).collect();
    assert_eq!(fps, vec!["new"]);

    let local = e.reader.read(EntityKind::Keys, &[], &[], 1, 0, true, &opts).unwrap();
    assert_eq!(local.keys.len(), 2);
}

#[test]
fn embeds_carry_every_owner_key() {
    let h = harness();
    let e = &h.engine;
    e.writer
        .batch_insert(vec![
            key("k1"),
            key("k2"),
            Entity::Board(board("b1", "k1", &[])),
            thread("t1", "b1", "k2"),
        ])
        .unwrap();

    let response = e
        .reader
        .read(
            EntityKind::Boards,
            &["b1".to_string()],
            &["threads".to_string(), "keys".to_string()],
            0,
            0,
            false,
            &ReadOptions::default(),
        )
        .unwrap();

    assert_eq!(response.boards.len(), 1);
    assert_eq!(response.threads.len(), 1);
    let mut keys: Vec<&str> = response.keys.iter().map(|k| k.provable.fingerprint.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["k1", "k2"]);

    let unknown = e.reader.read(
        EntityKind::Boards,
        &["b1".to_string()],
        &["comments".to_string()],
        0,
        0,
        false,
        &ReadOptions::default(),
    );
    assert!(matches!(unknown, Err(StorageError::InvalidRequest(_))));
}

#[test]
fn unsupported_shapes_are_request_errors() {
    let h = harness();
    let e = &h.engine;
    e.writer.batch_insert(vec![key("k1"), thread("t1", "b1", "k1")]).unwrap();

    let paged = ReadOptions {
        limit: 10,
        ..Default::default()
    };
    assert!(e.reader.read(EntityKind::Threads, &[], &[], 0, 0, true, &paged).is_err());

    let negative = ReadOptions {
        owner: Some("k1".into()),
        offset: -1,
        ..Default::default()
    };
    assert!(e.reader.read(EntityKind::Threads, &[], &[], 0, 0, true, &negative).is_err());

    let owned = ReadOptions {
        owner: Some("k1".into()),
        limit: 10,
        ..Default::default()
    };
    let response = e.reader.read(EntityKind::Threads, &[], &[], 0, 0, true, &owned).unwrap();
    assert_eq!(response.threads.len(), 1);

    let addresses = e.reader.read(EntityKind::Addresses, &[], &[], 0, 0, true, &owned);
    assert!(matches!(addresses, Err(StorageError::InvalidRequest(_))));
}

fn full_address(location: &str, ping: Timestamp) -> Address {
    Address {
        location: location.into(),
        location_type: 4,
        port: 49999,
        address_type: 2,
        last_successful_ping: ping,
        last_successful_sync: ping,
        protocol_version_major: 1,
        protocol_version_minor: 2,
        subprotocols: vec![Subprotocol {
            name: "c0".into(),
            version_major: 1,
            version_minor: 0,
            supported_entities: vec!["board".into(), "thread".into(), "post".into()],
        }],
        client_version_major: 2,
        client_version_minor: 1,
        client_version_patch: 7,
        client_name: "agora".into(),
        entity_version: 1,
        verified: true,
        ..Default::default()
    }
}

fn basic(location: &str) -> AddressSearch {
    AddressSearch::Basic {
        location: location.into(),
        sublocation: String::new(),
        port: 49999,
    }
}

#[test]
fn third_party_addresses_are_stripped() {
    let h = harness();
    let e = &h.engine;
    let m = e
        .writer
        .batch_insert(vec![Entity::Address(full_address("203.0.113.5", T0 - 10))])
        .unwrap();
    assert_eq!(m.addresses_received, 1);
    assert_eq!(m.inserted, 1);

    let stored = e.reader.read_addresses(&basic("203.0.113.5")).unwrap();
    assert_eq!(stored.len(), 1);
    let a = &stored[0];
    assert_eq!(a.entity_version, 1);
    assert_eq!(a.protocol_version_major, 0);
    assert_eq!(a.client_version_major, 0);
    assert_eq!(a.client_name, "");
    assert_eq!(a.last_successful_ping, 0);
    assert_eq!(a.last_successful_sync, 0);
    assert!(a.subprotocols.is_empty());

    // Localhost is not a valid remote
    let m = e
        .writer
        .batch_insert(vec![Entity::Address(full_address("127.0.0.1", T0))])
        .unwrap();
    assert_eq!(m.dropped, 1);
}

#[test]
fn first_party_addresses_keep_details() {
    let h = harness();
    let e = &h.engine;

    let errors = e
        .writer
        .insert_or_update_addresses(vec![full_address("198.51.100.7", T0 - 10)]);
    assert!(errors.is_empty(), "{:?}", errors);

    let a = &e.reader.read_addresses(&basic("198.51.100.7")).unwrap()[0];
    assert_eq!(a.client_name, "agora");
    assert_eq!(a.last_successful_ping, T0 - 10);
    assert_eq!(a.subprotocols.len(), 1);
    assert_eq!(a.subprotocols[0].supported_entities, vec!["board", "thread", "post"]);

    // Ping never moves backwards
    let errors = e
        .writer
        .insert_or_update_addresses(vec![full_address("198.51.100.7", T0 - 500)]);
    assert!(errors.is_empty());
    let a = &e.reader.read_addresses(&basic("198.51.100.7")).unwrap()[0];
    assert_eq!(a.last_successful_ping, T0 - 10);

    // Missing subprotocols is refused; the valid sibling still lands
    let mut bare = full_address("198.51.100.8", T0);
    bare.subprotocols.clear();
    let errors = e
        .writer
        .insert_or_update_addresses(vec![bare, full_address("198.51.100.9", T0)]);
    assert_eq!(errors.len(), 1);
    assert!(e.reader.read_addresses(&basic("198.51.100.8")).unwrap().is_empty());
    assert_eq!(e.reader.read_addresses(&basic("198.51.100.9")).unwrap().len(), 1);

    let subprotocols = e.reader.read_subprotocols("198.51.100.9", "", 49999).unwrap();
    assert_eq!(subprotocols.len(), 1);
    assert_eq!(subprotocols[0].supported_entities, "board,thread,post");
}

#[test]
fn counts_and_nodes() {
    let h = harness();
    let e = &h.engine;
    e.writer
        .batch_insert(vec![
            key("k1"),
            Entity::Board(board("b1", "k1", &[])),
            thread("t1", "b1", "k1"),
            thread("t2", "b1", "k1"),
            post("p1", "b1", "t1", "t1", "k1"),
        ])
        .unwrap();

    assert_eq!(e.reader.board_thread_count("b1").unwrap(), 2);
    assert_eq!(e.reader.thread_post_count("t1").unwrap(), 1);
    assert_eq!(e.reader.thread_post_count("t2").unwrap(), 0);

    assert!(matches!(e.reader.read_node("remote"), Err(StorageError::NotFound(_))));
    let node = agora_store::db::NodeRow {
        fingerprint: "remote".into(),
        posts_last_checkin: T0,
        ..Default::default()
    };
    e.writer.insert_node(&node).unwrap();
    assert_eq!(e.reader.read_node("remote").unwrap(), node);
}

#[test]
fn shutdown_turns_calls_into_no_ops() {
    let h = harness();
    let e = &h.engine;
    e.writer.batch_insert(vec![key("k1")]).unwrap();
    e.ctx.begin_shutdown();

    let m = e.writer.batch_insert(vec![key("k2")]).unwrap();
    assert_eq!(m.received(), 0);
    let response = read_by_fp(e, EntityKind::Keys, "k1");
    assert!(response.is_empty());
}
