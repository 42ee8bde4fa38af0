//! End-to-end pipeline tests: configuration → reader → parser → builder →
//! ring → writer → file sink, with checkpoints on disk.

use redostream::common::{LobId, Scn, Xid};
use redostream::config::Config;
use redostream::metadata::checkpoint::CheckpointRecord;
use redostream::reader::{
    ColumnChange, ColumnValue, DmlOp, LobCharset, RedoBatch, RedoPayload, RedoRecord,
};
use redostream::supervisor::Supervisor;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["redo", "state", "swap", "out"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Fixture { dir }
    }

    fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    fn output_file(&self) -> PathBuf {
        self.path("out").join("stream.json")
    }

    fn config_path(&self) -> PathBuf {
        self.path("config.json")
    }

    /// Write the schema catalog cache the supervisor seeds from.
    fn write_catalog(&self, tables: Value) {
        let scripts = self.path("state").join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        fs::write(scripts.join("db.json"), tables.to_string()).unwrap();
    }

    fn default_catalog(&self) {
        self.write_catalog(json!([{
            "obj": 10,
            "owner": "APP",
            "name": "USERS",
            "columns": [
                {"name": "ID", "key": true},
                {"name": "NAME"},
                {"name": "DOC"},
            ],
        }]));
    }

    fn write_config(&self, overrides: impl FnOnce(&mut Value)) {
        let mut config = json!({
            "version": "1.8.5",
            "log-level": 2,
            "source": [{
                "name": "db",
                "memory": {
                    "min-mb": 16,
                    "max-mb": 32,
                    "swap-mb": 4,
                    "swap-path": self.path("swap").to_str().unwrap(),
                },
                "state": {
                    "path": self.path("state").to_str().unwrap(),
                    "interval-s": 600,
                    "keep-checkpoints": 4,
                },
                "reader": {
                    "type": "batch",
                    "path": self.path("redo").to_str().unwrap(),
                    "arch-read-tries": 2,
                    "arch-read-sleep-us": 1000,
                },
                "filter": {
                    "table": [{"owner": "APP", "table": ".*"}],
                },
            }],
            "target": [{
                "writer": {
                    "type": "file",
                    "output": self.output_file().to_str().unwrap(),
                },
            }],
        });
        overrides(&mut config);
        fs::write(self.config_path(), config.to_string()).unwrap();
    }

    fn write_redo(&self, sequence: u32, batches: &[RedoBatch]) {
        let path = self.path("redo").join(format!("db-{sequence:09}.redo"));
        let mut file = fs::File::create(path).unwrap();
        for batch in batches {
            writeln!(file, "{}", serde_json::to_string(batch).unwrap()).unwrap();
        }
    }

    fn run(&self) {
        let handle = Config::load(self.config_path()).unwrap();
        let supervisor = Supervisor::new(&handle).unwrap();
        supervisor.run().unwrap();
    }

    fn output_lines(&self) -> Vec<Value> {
        match fs::read_to_string(self.output_file()) {
            Ok(body) => body
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| serde_json::from_str(l).unwrap())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn checkpoint(&self) -> CheckpointRecord {
        let body = fs::read_to_string(self.path("state").join("db.json")).unwrap();
        CheckpointRecord::from_json(&body).unwrap()
    }
}

fn record(scn: u64, xid: Xid, payload: RedoPayload) -> RedoRecord {
    RedoRecord { scn: Scn(scn), subscn: 0, offset: 0, xid, payload }
}

fn insert(obj: u32, scn: u64, xid: Xid, columns: Vec<(&str, ColumnValue)>) -> RedoRecord {
    record(
        scn,
        xid,
        RedoPayload::Dml {
            kind: DmlOp::Insert,
            obj,
            rid: None,
            columns: columns
                .into_iter()
                .map(|(name, value)| ColumnChange {
                    name: name.to_string(),
                    before: None,
                    after: Some(value),
                })
                .collect(),
        },
    )
}

fn batch(sequence: u32, block_offset: u64, lwn_scn: u64, records: Vec<RedoRecord>) -> RedoBatch {
    RedoBatch { sequence, block_offset, lwn_scn: Scn(lwn_scn), records }
}

fn number(text: &str) -> ColumnValue {
    ColumnValue::Number(text.to_string())
}

#[test]
fn test_small_transaction_single_frame() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    // Suppress BEGIN/COMMIT markers so the transaction is exactly one
    // frame.
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    let xid = Xid::new(1, 2, 3);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            100,
            vec![
                record(100, xid, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 100, xid, vec![("ID", number("1"))]),
                record(101, xid, RedoPayload::Commit { timestamp: 1_700_000_000 }),
            ],
        )],
    );

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 1);
    let frame = &lines[0];
    assert_eq!(frame["scn"], json!(101));
    assert_eq!(frame["xid"], json!("0x0001.002.00000003"));
    assert_eq!(frame["payload"][0]["op"], json!("c"));
    assert_eq!(frame["payload"][0]["after"]["ID"], json!(1));

    let checkpoint = fixture.checkpoint();
    assert_eq!(checkpoint.confirmed_id, Some(0));
    assert_eq!(checkpoint.scn, Scn(101));
    assert!(checkpoint.open_xids.is_empty());
}

#[test]
fn test_begin_and_commit_markers_by_default() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|_| {});

    let xid = Xid::new(1, 0, 9);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            200,
            vec![
                record(200, xid, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 200, xid, vec![("ID", number("7")), ("NAME", ColumnValue::String("ada".into()))]),
                record(201, xid, RedoPayload::Commit { timestamp: 1_700_000_000 }),
            ],
        )],
    );

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["payload"][0]["op"], json!("begin"));
    assert_eq!(lines[1]["payload"][0]["op"], json!("c"));
    assert_eq!(lines[1]["payload"][0]["after"]["NAME"], json!("ada"));
    assert_eq!(lines[1]["payload"][0]["schema"]["owner"], json!("APP"));
    assert_eq!(lines[2]["payload"][0]["op"], json!("commit"));
    // Commit SCN is carried by every frame of the transaction.
    for line in &lines {
        assert_eq!(line["scn"], json!(201));
    }
}

#[test]
fn test_rollback_emits_nothing() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|_| {});

    let xid = Xid::new(4, 1, 7);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            300,
            vec![
                record(300, xid, RedoPayload::Begin { attributes: vec![] }),
                record(
                    300,
                    xid,
                    RedoPayload::Dml {
                        kind: DmlOp::Delete,
                        obj: 10,
                        rid: None,
                        columns: vec![ColumnChange {
                            name: "ID".into(),
                            before: Some(number("5")),
                            after: None,
                        }],
                    },
                ),
                record(301, xid, RedoPayload::Rollback),
            ],
        )],
    );

    fixture.run();

    assert!(fixture.output_lines().is_empty());
    let checkpoint = fixture.checkpoint();
    assert!(checkpoint.open_xids.is_empty());
}

#[test]
fn test_large_transaction_spills_to_swap() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    // Forty ~0.8 MiB rows against a 4 MiB swap threshold: the memory
    // manager must spill while the transaction is in flight.
    let xid = Xid::new(2, 2, 2);
    let big = "x".repeat(800 * 1024);
    let mut records = vec![record(1000, xid, RedoPayload::Begin { attributes: vec![] })];
    for i in 0..40u64 {
        records.push(insert(
            10,
            1000 + i,
            xid,
            vec![("ID", number(&i.to_string())), ("NAME", ColumnValue::String(big.clone()))],
        ));
    }
    records.push(record(1100, xid, RedoPayload::Commit { timestamp: 1_700_000_000 }));
    fixture.write_redo(1, &[batch(1, 0, 1000, records)]);

    let handle = Config::load(fixture.config_path()).unwrap();
    let supervisor = Supervisor::new(&handle).unwrap();
    let ctx = supervisor.ctx();
    supervisor.run().unwrap();

    assert!(ctx.swap.stats().swapped_out_total > 0, "expected swap activity");

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 40);
    for (i, line) in lines.iter().enumerate() {
        assert_eq!(line["payload"][0]["after"]["ID"], json!(i));
    }

    // Swap files are removed once the transaction is released.
    let leftovers: Vec<_> = fs::read_dir(fixture.path("swap"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(leftovers.is_empty(), "swap directory should be empty: {leftovers:?}");
}

#[test]
fn test_lob_reconstruction_in_page_order() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    let xid = Xid::new(3, 0, 5);
    let lob = LobId(0xAB);
    let pages: Vec<String> = (0..5).map(|i| format!("page-{i}-").repeat(1200)).collect();

    let mut records = vec![
        record(500, xid, RedoPayload::Begin { attributes: vec![] }),
        record(
            500,
            xid,
            RedoPayload::LobIndex {
                lob,
                obj: 10,
                charset: LobCharset::Utf8,
                // Deliberately out of order; reassembly follows page
                // numbers.
                pages: vec![(2, 9002), (0, 9000), (4, 9004), (1, 9001), (3, 9003)],
            },
        ),
    ];
    for (i, page) in pages.iter().enumerate() {
        records.push(record(
            501,
            xid,
            RedoPayload::LobData { dba: 9000 + i as u64, bytes: page.clone().into_bytes() },
        ));
    }
    records.push(insert(10, 502, xid, vec![("ID", number("1")), ("DOC", ColumnValue::Lob(lob))]));
    records.push(record(503, xid, RedoPayload::Commit { timestamp: 1_700_000_000 }));
    fixture.write_redo(1, &[batch(1, 0, 500, records)]);

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 1);
    let expected: String = pages.concat();
    assert_eq!(lines[0]["payload"][0]["after"]["DOC"], json!(expected));
}

#[test]
fn test_missing_lob_page_degrades_column() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    let xid = Xid::new(3, 1, 6);
    let lob = LobId(0xCD);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            600,
            vec![
                record(600, xid, RedoPayload::Begin { attributes: vec![] }),
                record(
                    600,
                    xid,
                    RedoPayload::LobIndex {
                        lob,
                        obj: 10,
                        charset: LobCharset::Utf8,
                        pages: vec![(0, 9000), (1, 9001)],
                    },
                ),
                record(601, xid, RedoPayload::LobData { dba: 9000, bytes: b"only".to_vec() }),
                insert(10, 602, xid, vec![("ID", number("1")), ("DOC", ColumnValue::Lob(lob))]),
                record(603, xid, RedoPayload::Commit { timestamp: 1_700_000_000 }),
            ],
        )],
    );

    fixture.run();

    // Degraded, not fatal: the column is marked unknown.
    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["payload"][0]["after"]["DOC"], json!("?"));
}

#[test]
fn test_filter_skips_unlisted_tables() {
    let fixture = Fixture::new();
    fixture.write_catalog(json!([
        {"obj": 10, "owner": "APP", "name": "USERS",
         "columns": [{"name": "ID", "key": true}]},
        {"obj": 11, "owner": "SYS", "name": "AUDIT",
         "columns": [{"name": "ID", "key": true}]},
    ]));
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
        config["source"][0]["filter"] =
            json!({"table": [{"owner": "APP", "table": "USERS"}]});
    });

    let xid = Xid::new(6, 0, 6);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            700,
            vec![
                record(700, xid, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 700, xid, vec![("ID", number("1"))]),
                insert(11, 701, xid, vec![("ID", number("2"))]),
                record(702, xid, RedoPayload::Commit { timestamp: 1_700_000_000 }),
            ],
        )],
    );

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["payload"][0]["after"]["ID"], json!(1));
}

#[test]
fn test_skip_xid_drops_whole_transaction() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
        config["source"][0]["filter"] = json!({
            "table": [{"owner": "APP", "table": ".*"}],
            "skip-xid": ["7.0.7"],
        });
    });

    let skipped = Xid::new(7, 0, 7);
    let kept = Xid::new(8, 0, 8);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            800,
            vec![
                record(800, skipped, RedoPayload::Begin { attributes: vec![] }),
                record(800, kept, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 801, skipped, vec![("ID", number("666"))]),
                insert(10, 802, kept, vec![("ID", number("1"))]),
                record(803, skipped, RedoPayload::Commit { timestamp: 1 }),
                record(804, kept, RedoPayload::Commit { timestamp: 1 }),
            ],
        )],
    );

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["payload"][0]["after"]["ID"], json!(1));
}

#[test]
fn test_interleaved_transactions_emit_in_commit_order() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    let a = Xid::new(1, 0, 1);
    let b = Xid::new(2, 0, 2);
    // B commits before A even though A began first.
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            900,
            vec![
                record(900, a, RedoPayload::Begin { attributes: vec![] }),
                record(901, b, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 902, a, vec![("ID", number("100"))]),
                insert(10, 903, b, vec![("ID", number("200"))]),
                record(904, b, RedoPayload::Commit { timestamp: 1 }),
                insert(10, 905, a, vec![("ID", number("101"))]),
                record(906, a, RedoPayload::Commit { timestamp: 1 }),
            ],
        )],
    );

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 3);
    // B's row first, then A's rows in append order.
    assert_eq!(lines[0]["payload"][0]["after"]["ID"], json!(200));
    assert_eq!(lines[1]["payload"][0]["after"]["ID"], json!(100));
    assert_eq!(lines[2]["payload"][0]["after"]["ID"], json!(101));
    // Commit SCNs are non-decreasing over the emitted sequence.
    let scns: Vec<u64> = lines.iter().map(|l| l["scn"].as_u64().unwrap()).collect();
    assert!(scns.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_checkpoint_resume_does_not_duplicate() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    let mut batches = Vec::new();
    for i in 0..5u64 {
        let xid = Xid::new(1, 0, i as u32 + 1);
        batches.push(batch(
            1,
            i * 512,
            2000 + i * 10,
            vec![
                record(2000 + i * 10, xid, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 2000 + i * 10, xid, vec![("ID", number(&i.to_string()))]),
                record(2001 + i * 10, xid, RedoPayload::Commit { timestamp: 1 }),
            ],
        ));
    }
    fixture.write_redo(1, &batches);

    fixture.run();
    let first = fixture.output_lines();
    assert_eq!(first.len(), 5);

    let checkpoint = fixture.checkpoint();
    assert_eq!(checkpoint.confirmed_id, Some(4));
    assert_eq!(checkpoint.resume.sequence, 1);

    // Second run over the same redo: everything is at or below the
    // checkpoint, so nothing new may appear.
    fixture.run();
    let second = fixture.output_lines();
    assert_eq!(second.len(), first.len());

    // Message ids continue from the checkpoint on the next emission.
    let checkpoint = fixture.checkpoint();
    assert_eq!(checkpoint.confirmed_id, Some(4));
}

#[test]
fn test_resume_emits_transactions_after_checkpoint() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"message": 12});
    });

    let first_xid = Xid::new(1, 0, 1);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            3000,
            vec![
                record(3000, first_xid, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 3000, first_xid, vec![("ID", number("1"))]),
                record(3001, first_xid, RedoPayload::Commit { timestamp: 1 }),
            ],
        )],
    );
    fixture.run();
    assert_eq!(fixture.output_lines().len(), 1);

    // New redo arrives after the restart point.
    let second_xid = Xid::new(1, 0, 2);
    let path = fixture.path("redo").join("db-000000001.redo");
    let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
    let late = batch(
        1,
        512,
        3100,
        vec![
            record(3100, second_xid, RedoPayload::Begin { attributes: vec![] }),
            insert(10, 3100, second_xid, vec![("ID", number("2"))]),
            record(3101, second_xid, RedoPayload::Commit { timestamp: 1 }),
        ],
    );
    writeln!(file, "{}", serde_json::to_string(&late).unwrap()).unwrap();
    drop(file);

    fixture.run();
    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["payload"][0]["after"]["ID"], json!(2));
    assert_eq!(fixture.checkpoint().confirmed_id, Some(1));
}

#[test]
fn test_protobuf_output_is_length_prefixed() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|config| {
        config["source"][0]["format"] = json!({"type": "protobuf", "message": 12});
        config["target"][0]["writer"]["output"] =
            json!(fixture.path("out").join("stream.bin").to_str().unwrap());
    });

    let xid = Xid::new(1, 1, 1);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            100,
            vec![
                record(100, xid, RedoPayload::Begin { attributes: vec![] }),
                insert(10, 100, xid, vec![("ID", number("1"))]),
                record(101, xid, RedoPayload::Commit { timestamp: 1 }),
            ],
        )],
    );

    fixture.run();

    let body = fs::read(fixture.path("out").join("stream.bin")).unwrap();
    assert!(body.len() > 8);
    let len = u64::from_le_bytes(body[..8].try_into().unwrap()) as usize;
    assert_eq!(body.len(), 8 + len);
}

#[test]
fn test_transaction_attributes_on_begin_frame() {
    let fixture = Fixture::new();
    fixture.default_catalog();
    fixture.write_config(|_| {});

    let xid = Xid::new(5, 0, 5);
    fixture.write_redo(
        1,
        &[batch(
            1,
            0,
            400,
            vec![
                record(
                    400,
                    xid,
                    RedoPayload::Begin {
                        attributes: vec![("client".into(), "etl".into())],
                    },
                ),
                insert(10, 400, xid, vec![("ID", number("1"))]),
                record(401, xid, RedoPayload::Commit { timestamp: 1 }),
            ],
        )],
    );

    fixture.run();

    let lines = fixture.output_lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["attributes"]["client"], json!("etl"));
    assert!(lines[1].get("attributes").is_none());
}

fn wait_until(deadline: std::time::Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = std::time::Instant::now() + deadline;
    while std::time::Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    false
}

#[test]
fn test_config_reload_rescans_schema() {
    use redostream::common::Ctx;
    use redostream::memory::ArenaConfig;
    use redostream::metadata::checkpoint::{Checkpoint, CheckpointSettings};
    use redostream::metadata::schema::TableDef;
    use redostream::metadata::state::StateDisk;
    use redostream::metadata::Metadata;
    use redostream::supervisor::apply_filter;
    use std::sync::Arc;
    use std::time::Duration;

    let fixture = Fixture::new();
    fixture.write_config(|config| {
        config["source"][0]["filter"] =
            json!({"table": [{"owner": "APP", "table": "USERS"}]});
    });

    let ctx = Ctx::new(
        ArenaConfig {
            chunks_min: 1,
            chunks_max: 4,
            chunks_swap: 0,
            read_buffer_min: 0,
            read_buffer_max: 4,
            write_buffer_min: 0,
            write_buffer_max: 4,
            unswap_buffer_min: 0,
        },
        fixture.path("swap"),
        0,
        0,
        0,
    )
    .unwrap();
    let metadata = Metadata::new("db", StateDisk::new(fixture.path("state"), "db", 2));
    let catalog = vec![
        TableDef {
            obj: 10,
            owner: "APP".into(),
            name: "USERS".into(),
            columns: vec![],
        },
        TableDef {
            obj: 11,
            owner: "APP".into(),
            name: "ORDERS".into(),
            columns: vec![],
        },
    ];
    metadata.set_catalog(catalog);

    let handle = Config::load(fixture.config_path()).unwrap();
    apply_filter(handle.config.source(), &metadata, false).unwrap();
    assert!(metadata.schema().get(10).is_some());
    assert!(metadata.schema().get(11).is_none());

    let config_path = fixture.config_path();
    let reload_path = config_path.clone();
    let checkpoint = Checkpoint::new(
        Arc::clone(&ctx),
        Arc::clone(&metadata),
        CheckpointSettings {
            interval: Duration::from_secs(600),
            interval_mb: 500,
            schema_force_interval: 20,
            stop_after: 0,
        },
        config_path.clone(),
        Box::new(move |metadata| {
            let config = Config::reload(&reload_path)?;
            apply_filter(config.source(), metadata, true)
        }),
    );

    let worker = {
        let checkpoint = Arc::clone(&checkpoint);
        std::thread::spawn(move || checkpoint.run())
    };

    // Give the watcher a baseline, then add a table for the same owner.
    std::thread::sleep(Duration::from_millis(300));
    fixture.write_config(|config| {
        config["source"][0]["filter"] = json!({"table": [
            {"owner": "APP", "table": "USERS"},
            {"owner": "APP", "table": "ORDERS"},
        ]});
    });

    assert!(
        wait_until(Duration::from_secs(5), || metadata.schema().get(11).is_some()),
        "reload should capture the added table without restart"
    );

    ctx.stop_hard();
    worker.join().unwrap().unwrap();

    // The handle keeps holding the configuration lock for the process
    // lifetime.
    drop(handle);
}
