use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use witnessd_core::config::Config;
use witnessd_core::datadir::DataDir;
use witnessd_core::declaration::{Declaration, Modality};
use witnessd_core::engine::{self, Engine};
use witnessd_core::evidence::{Builder, Packet, Tier};
use witnessd_core::keyhierarchy;
use witnessd_core::sentinel::TrackingSession;
use witnessd_core::wal::{self, EntryKind, Wal};

fn setup(tmp: &TempDir) -> DataDir {
    let data_dir = DataDir::new(tmp.path().join("witnessd"));
    Engine::init(&data_dir).expect("init");

    let mut config = Config::load_or_default(&data_dir.config_path()).expect("config");
    config.vdf.iterations_per_second = 10_000;
    config.vdf.min_iterations = 10;
    config.vdf.max_iterations = 1_000_000;
    config.persist(&data_dir.config_path()).expect("persist");

    data_dir
}

#[test]
fn test_full_pipeline() {
    let tmp = TempDir::new().unwrap();
    let data_dir = setup(&tmp);
    let doc = tmp.path().join("essay.md");

    // 1. Write and checkpoint a document three times.
    fs::write(&doc, "It was a dark and stormy night.").unwrap();
    let mut engine = Engine::open(data_dir.clone()).expect("open engine");
    engine
        .commit(&doc, Some("first draft".into()), Some(Duration::from_millis(1)))
        .expect("commit 0");

    fs::write(&doc, "It was a dark and stormy night. The rain fell in torrents.").unwrap();
    engine
        .commit(&doc, None, Some(Duration::from_millis(1)))
        .expect("commit 1");

    fs::write(
        &doc,
        "It was a dark and stormy night. The rain fell in torrents, except at occasional intervals.",
    )
    .unwrap();
    engine
        .commit(&doc, Some("final".into()), Some(Duration::from_millis(1)))
        .expect("commit 2");

    // 2. The chain verifies end to end.
    let verification = engine.verify_document(&doc).expect("verify");
    assert!(verification.chain.valid);
    assert_eq!(verification.chain.events, 3);
    assert_eq!(verification.certificate_valid, Some(true));
    assert_eq!(verification.signatures_valid, Some(true));

    let stats = engine.stats().expect("stats");
    assert!(stats.integrity_ok);
    assert_eq!(stats.event_count, 3);

    // 3. Sign a declaration over the final state.
    let events = engine.events_for(&doc).expect("events");
    let last = events.last().unwrap();
    let declaration = Declaration::new(
        "essay.md",
        last.content_hash,
        last.event_hash,
        Modality::Keyboard,
        "Drafted over several sittings, typed by hand.",
    )
    .sign(&engine.master_signing_key().expect("master key"))
    .expect("sign declaration");
    assert!(declaration.verify());

    // 4. Export a standard tier packet with the key hierarchy section.
    let record_path = keyhierarchy::session_state_path(
        &data_dir.sessions_dir(),
        &engine::document_fingerprint(&last.file_path),
    );
    let record = keyhierarchy::load_session_record(&record_path).expect("session record");
    let kh_evidence = keyhierarchy::evidence_from_record(engine.identity(), &record);

    let packet = Builder::new(&events, engine.vdf_params(), Tier::Standard)
        .expect("builder")
        .with_declaration(&declaration)
        .with_key_hierarchy(&kh_evidence)
        .build();

    // 5. The packet round-trips and verifies offline.
    let decoded = Packet::decode(&packet.encode().expect("encode")).expect("decode");
    let result = decoded.verify();
    assert!(result.chain_valid);
    assert_eq!(result.declaration_valid, Some(true));
    assert_eq!(result.key_hierarchy_valid, Some(true));
    assert!(result.all_valid());
    assert_eq!(decoded.document.checkpoints, 3);
}

#[test]
fn test_chain_survives_process_restart() {
    let tmp = TempDir::new().unwrap();
    let data_dir = setup(&tmp);
    let doc = tmp.path().join("notes.txt");
    fs::write(&doc, "session one").unwrap();

    let genesis_hash;
    {
        let mut engine = Engine::open(data_dir.clone()).expect("open engine");
        let event = engine
            .commit(&doc, None, Some(Duration::from_millis(1)))
            .expect("commit 0");
        genesis_hash = event.event_hash;
        engine.end_sessions();
    }

    // A new process continues the same per-file chain.
    {
        fs::write(&doc, "session one, then session two").unwrap();
        let mut engine = Engine::open(data_dir.clone()).expect("reopen engine");
        let event = engine
            .commit(&doc, None, Some(Duration::from_millis(1)))
            .expect("commit 1");
        assert_eq!(event.previous_hash, genesis_hash);
        assert_eq!(event.vdf_input, genesis_hash);

        let verification = engine.verify_document(&doc).expect("verify");
        assert!(verification.chain.valid);
        assert_eq!(verification.chain.events, 2);
    }
}

#[test]
fn test_tamper_detection_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let data_dir = setup(&tmp);
    let doc = tmp.path().join("doc.txt");
    fs::write(&doc, "untampered content").unwrap();

    {
        let mut engine = Engine::open(data_dir.clone()).expect("open engine");
        engine
            .commit(&doc, None, Some(Duration::from_millis(1)))
            .expect("commit 0");
        fs::write(&doc, "untampered content, extended").unwrap();
        engine
            .commit(&doc, None, Some(Duration::from_millis(1)))
            .expect("commit 1");
    }

    // Flip one bit in a stored content hash behind the store's back.
    {
        let conn = rusqlite::Connection::open(data_dir.events_db_path()).unwrap();
        let hash: Vec<u8> = conn
            .query_row(
                "SELECT content_hash FROM secure_events WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let mut tampered = hash;
        tampered[0] ^= 0x01;
        conn.execute(
            "UPDATE secure_events SET content_hash = ?",
            rusqlite::params![tampered],
        )
        .unwrap();
    }

    let engine = Engine::open(data_dir).expect("reopen engine");
    let stats = engine.stats().expect("stats");
    assert!(!stats.integrity_ok);

    let verification = engine.verify_document(&doc).expect("verify");
    assert!(!verification.chain.valid);
    assert_eq!(verification.chain.first_invalid, Some(0));
}

#[test]
fn test_signature_rebinding_detected() {
    let tmp = TempDir::new().unwrap();
    let data_dir = setup(&tmp);
    let doc = tmp.path().join("doc.txt");
    fs::write(&doc, "version one").unwrap();

    let mut engine = Engine::open(data_dir.clone()).expect("open engine");
    engine
        .commit(&doc, None, Some(Duration::from_millis(1)))
        .expect("commit 0");
    fs::write(&doc, "version one and two").unwrap();
    engine
        .commit(&doc, None, Some(Duration::from_millis(1)))
        .expect("commit 1");

    // Rebind the session's signatures: swap the (key, hash, signature)
    // triples between the two records while keeping the index fields.
    // Each record still verifies against the hash it carries.
    let events = engine.events_for(&doc).expect("events");
    let record_path = keyhierarchy::session_state_path(
        &data_dir.sessions_dir(),
        &engine::document_fingerprint(&events[0].file_path),
    );
    let mut record = keyhierarchy::load_session_record(&record_path).expect("record");
    let (pk0, hash0, sig0) = (
        record.signatures[0].public_key.clone(),
        record.signatures[0].event_hash,
        record.signatures[0].signature,
    );
    record.signatures[0].public_key = record.signatures[1].public_key.clone();
    record.signatures[0].event_hash = record.signatures[1].event_hash;
    record.signatures[0].signature = record.signatures[1].signature;
    record.signatures[1].public_key = pk0;
    record.signatures[1].event_hash = hash0;
    record.signatures[1].signature = sig0;
    keyhierarchy::verify_signature_records(&record.signatures).expect("internally consistent");
    fs::write(&record_path, serde_json::to_vec_pretty(&record).unwrap()).unwrap();

    // The store-backed verification joins signatures to the recomputed
    // chain and rejects the rebinding.
    let verification = engine.verify_document(&doc).expect("verify");
    assert!(verification.chain.valid);
    assert_eq!(verification.certificate_valid, Some(true));
    assert_eq!(verification.signatures_valid, Some(false));

    // The same rebinding inside an exported packet is caught offline: the
    // builder accepts the internally consistent section, the cross-bind
    // against the packet's checkpoints does not.
    let kh = keyhierarchy::evidence_from_record(engine.identity(), &record);
    let packet = Builder::new(&events, engine.vdf_params(), Tier::Standard)
        .expect("builder")
        .with_key_hierarchy(&kh)
        .build();
    assert!(packet.key_hierarchy.is_some());

    let result = packet.verify();
    assert!(result.chain_valid);
    assert_eq!(result.key_hierarchy_valid, Some(false));
}

#[test]
fn test_tracking_session_with_wal() {
    let tmp = TempDir::new().unwrap();
    let data_dir = setup(&tmp);
    let doc = tmp.path().join("tracked.md");
    fs::write(&doc, "tracked content").unwrap();

    // Start a tracking session and log activity counts to its WAL.
    let session = TrackingSession::begin(&doc);
    session.save(&data_dir.tracking_dir()).expect("save session");

    let wal = Wal::open(data_dir.wal_dir(), &session.session_id).expect("open wal");
    wal.append(EntryKind::SessionStart, b"").unwrap();
    wal.append(EntryKind::KeystrokeBatch, &120u32.to_be_bytes())
        .unwrap();
    wal.append(EntryKind::JitterSample, &[0u8; 16]).unwrap();
    wal.append(EntryKind::Checkpoint, &[1u8; 32]).unwrap();
    wal.append(EntryKind::KeystrokeBatch, &80u32.to_be_bytes())
        .unwrap();
    wal.close().unwrap();

    // Recovery after an unclean exit counts what was captured.
    let report = wal::recover(wal.path(), &session.session_id).expect("recover");
    assert_eq!(report.entries_recovered, 5);
    assert_eq!(report.keystrokes_recovered, 200);
    assert_eq!(report.jitter_samples_recovered, 1);
    assert_eq!(report.last_checkpoint_seq, Some(3));
    assert!(!report.clean_shutdown);

    // The loaded session points at the same WAL.
    let loaded = TrackingSession::load(&data_dir.tracking_dir()).expect("load session");
    assert_eq!(loaded.session_id, session.session_id);
    TrackingSession::clear(&data_dir.tracking_dir()).expect("clear");
}

#[test]
fn test_large_document_chunked_shadow_path() {
    let tmp = TempDir::new().unwrap();
    let data_dir = setup(&tmp);
    let doc = tmp.path().join("big.bin");

    // Above the full-shadow ceiling: the second commit diffs against the
    // cached chunk list instead of raw bytes.
    let mut content: Vec<u8> = (0..400_000u32).flat_map(|i| i.to_be_bytes()).collect();
    fs::write(&doc, &content).unwrap();

    let mut engine = Engine::open(data_dir).expect("open engine");
    engine
        .commit(&doc, None, Some(Duration::from_millis(1)))
        .expect("commit 0");

    for b in content[100_000..101_000].iter_mut() {
        *b = 0xEE;
    }
    fs::write(&doc, &content).unwrap();
    let event = engine
        .commit(&doc, None, Some(Duration::from_millis(1)))
        .expect("commit 1");

    assert_eq!(event.size_delta, 0);
    assert!(!event.regions.is_empty());

    let verification = engine.verify_document(&doc).expect("verify");
    assert!(verification.chain.valid);
}
