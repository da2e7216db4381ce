//! Integration tests for sofadb
//! Exercises the public database API end to end against on-disk databases

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use sofadb::{
    AllDocsOptions, BulkOptions, ChangesOptions, Database, DatabaseConfig, DbError, GetOptions,
};

/// Open a database in its own directory under `tempdir`.
fn open_db(tempdir: &TempDir, name: &str) -> Database {
    Database::open(DatabaseConfig::new(name, tempdir.path().join(name)))
        .expect("Failed to open database")
}

fn replicated(id: &str, revs: &[&str]) -> Value {
    let leaf = revs[0];
    let start: u64 = leaf
        .split('-')
        .next()
        .and_then(|p| p.parse().ok())
        .expect("rev position");
    let ids: Vec<&str> = revs
        .iter()
        .map(|r| r.split_once('-').map(|(_, h)| h).unwrap_or(r))
        .collect();
    json!({"_id": id, "_rev": leaf, "_revisions": {"start": start, "ids": ids}})
}

fn rev_of(doc: &Value) -> String {
    doc["_rev"].as_str().expect("_rev").to_string()
}

// ============================================================================
// Integration Tests
// ============================================================================

#[tokio::test]
async fn test_put_get_round_trip() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "roundtrip");

    let rev1 = db.put(json!({"_id": "doc", "title": "first"})).await.unwrap();
    assert!(rev1.starts_with("1-"));

    let doc = db.get("doc", &GetOptions::default()).await.unwrap().doc;
    assert_eq!(doc["title"], json!("first"));
    assert_eq!(rev_of(&doc), rev1);

    // Writing back what was read produces the next generation
    let mut edited = doc.clone();
    edited["title"] = json!("second");
    let rev2 = db.put(edited).await.unwrap();
    assert!(rev2.starts_with("2-"), "Expected generation 2, got {}", rev2);

    // The stale revision can no longer be edited
    let stale = db.put(json!({"_id": "doc", "_rev": rev1, "title": "stale"})).await;
    assert!(matches!(stale, Err(DbError::RevisionConflict)));

    let info = db.info().await.unwrap();
    assert_eq!(info.doc_count, 1);
    assert_eq!(info.update_seq, 2);
}

#[tokio::test]
async fn test_winner_is_deterministic() {
    let tmpdir = TempDir::new().unwrap();
    let one = open_db(&tmpdir, "one");
    let two = open_db(&tmpdir, "two");
    let opts = BulkOptions { new_edits: false };

    let aaa = replicated("c", &["3-aaa", "2-b", "1-a"]);
    let bbb = replicated("c", &["3-bbb", "2-b", "1-a"]);

    one.bulk_docs(vec![aaa.clone(), bbb.clone()], &opts).await.unwrap();
    two.bulk_docs(vec![bbb], &opts).await.unwrap();
    two.bulk_docs(vec![aaa], &opts).await.unwrap();

    let conflicts = GetOptions {
        conflicts: true,
        ..Default::default()
    };
    for db in [&one, &two] {
        let doc = db.get("c", &conflicts).await.unwrap().doc;
        assert_eq!(doc["_rev"], json!("3-bbb"));
        assert_eq!(doc["_conflicts"], json!(["3-aaa"]));
    }
}

#[tokio::test]
async fn test_deleted_branch_is_not_a_conflict() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "deleted-branch");
    let opts = BulkOptions { new_edits: false };

    let mut deleted = replicated("c", &["2-c", "1-a"]);
    deleted["_deleted"] = json!(true);
    db.bulk_docs(
        vec![
            replicated("c", &["3-aaa", "2-b", "1-a"]),
            replicated("c", &["3-bbb", "2-b", "1-a"]),
            deleted,
        ],
        &opts,
    )
    .await
    .unwrap();

    let tree = db.get_revision_tree("c").await.unwrap();
    let conflicts: Vec<String> = tree.collect_conflicts().iter().map(|r| r.to_string()).collect();
    let deleted: Vec<String> = tree
        .collect_deleted_conflicts()
        .iter()
        .map(|r| r.to_string())
        .collect();
    assert_eq!(conflicts, vec!["3-aaa"]);
    assert_eq!(deleted, vec!["2-c"]);
}

#[tokio::test]
async fn test_replication_replay_is_idempotent() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "replay");
    let opts = BulkOptions { new_edits: false };
    let docs = vec![
        replicated("x", &["2-b", "1-a"]),
        replicated("y", &["1-z"]),
    ];

    db.bulk_docs(docs.clone(), &opts).await.unwrap();
    let before = db.info().await.unwrap();
    let feed_before = db.changes(&ChangesOptions::default()).await.unwrap();

    let results = db.bulk_docs(docs, &opts).await.unwrap();
    assert!(results.iter().all(|r| r.is_ok()));

    let after = db.info().await.unwrap();
    assert_eq!(after.update_seq, before.update_seq);
    assert_eq!(after.doc_count, 2);
    assert_eq!(db.changes(&ChangesOptions::default()).await.unwrap(), feed_before);

    let mut query = BTreeMap::new();
    query.insert("x".to_string(), vec!["2-b".to_string(), "1-a".to_string()]);
    assert!(db.revs_diff(&query).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_attachment_dedup_and_orphan_removal() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "attachments");
    let payload = json!({"logo.png": {"content_type": "image/png", "data": "AAECAwQ="}});

    let rev_a = db
        .put(json!({"_id": "a", "_attachments": payload.clone()}))
        .await
        .unwrap();
    let rev_b = db
        .put(json!({"_id": "b", "_attachments": payload}))
        .await
        .unwrap();

    let digest = db.get("a", &GetOptions::default()).await.unwrap().doc["_attachments"]
        ["logo.png"]["digest"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(digest.starts_with("md5-"));
    assert_eq!(
        db.get_attachment("b", "logo.png", None).await.unwrap(),
        vec![0, 1, 2, 3, 4]
    );

    db.remove("a", &rev_a).await.unwrap();
    let summary = db.compact().await.unwrap();
    assert_eq!(summary.docs_compacted, 1);
    // Still referenced by b
    assert_eq!(
        db.get_attachment("b", "logo.png", None).await.unwrap(),
        vec![0, 1, 2, 3, 4]
    );

    db.remove("b", &rev_b).await.unwrap();
    db.compact().await.unwrap();
    assert!(matches!(
        db.get_attachment("b", "logo.png", Some(&rev_b)).await,
        Err(DbError::MissingDoc(_))
    ));
    assert_eq!(db.info().await.unwrap().doc_count, 0);

    // The content is gone, so a stub can no longer refer to it
    let stub = json!({"logo.png": {"stub": true, "digest": digest}});
    assert!(matches!(
        db.put(json!({"_id": "c", "_attachments": stub})).await,
        Err(DbError::MissingAttachmentStub(_))
    ));
}

#[tokio::test]
async fn test_change_feed_order_and_resume() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "feed");

    let rev = db.put(json!({"_id": "a"})).await.unwrap();
    db.put(json!({"_id": "b"})).await.unwrap();
    db.put(json!({"_id": "c"})).await.unwrap();
    db.put(json!({"_id": "a", "_rev": rev, "edited": true}))
        .await
        .unwrap();

    let feed = db.changes(&ChangesOptions::default()).await.unwrap();
    let seqs: Vec<u64> = feed.results.iter().map(|c| c.seq).collect();
    let ids: Vec<&str> = feed.results.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c", "a"]);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(feed.last_seq, 4);

    let resumed = db
        .changes(&ChangesOptions {
            since: feed.last_seq,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(resumed.results.is_empty());

    let limited = db
        .changes(&ChangesOptions {
            since: 2,
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.results.len(), 1);
    assert_eq!(limited.results[0].id, "c");
}

#[tokio::test]
async fn test_old_revision_readable_until_compaction() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "two-writes");

    let rev1 = db.put(json!({"_id": "x", "v": 1})).await.unwrap();
    let rev2 = db.put(json!({"_id": "x", "_rev": rev1, "v": 2})).await.unwrap();

    let at = |rev: &str| GetOptions {
        rev: Some(rev.to_string()),
        ..Default::default()
    };
    assert_eq!(db.get("x", &at(&rev1)).await.unwrap().doc["v"], json!(1));

    let summary = db.compact().await.unwrap();
    assert_eq!(summary.revs_purged, 1);
    assert!(matches!(
        db.get("x", &at(&rev1)).await,
        Err(DbError::MissingDoc(_))
    ));
    assert_eq!(db.get("x", &at(&rev2)).await.unwrap().doc["v"], json!(2));

    let info = GetOptions {
        revs_info: true,
        ..Default::default()
    };
    let doc = db.get("x", &info).await.unwrap().doc;
    assert_eq!(doc["_revs_info"][0]["status"], json!("available"));
    assert_eq!(doc["_revs_info"][1]["status"], json!("missing"));
}

#[tokio::test]
async fn test_concurrent_reads_see_whole_batches() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "isolation");

    let docs: Vec<Value> = (0..50).map(|i| json!({"_id": format!("doc{:02}", i)})).collect();
    let writer = {
        let db = db.clone();
        tokio::spawn(async move { db.bulk_docs(docs, &BulkOptions::default()).await })
    };

    let mut readers = Vec::new();
    for _ in 0..20 {
        let db = db.clone();
        readers.push(tokio::spawn(async move {
            let rows = db.all_docs(&AllDocsOptions::default()).await.unwrap().rows.len();
            let info = db.info().await.unwrap();
            (rows, info.doc_count)
        }));
    }

    let results = writer.await.expect("writer panicked").unwrap();
    assert!(results.iter().all(|r| r.is_ok()));
    for reader in readers {
        let (rows, doc_count) = reader.await.expect("reader panicked");
        assert!(rows == 0 || rows == 50, "Saw a partial batch: {} rows", rows);
        assert!(doc_count == 0 || doc_count == 50);
    }
}

#[tokio::test]
async fn test_reopen_keeps_documents_and_counters() {
    let tmpdir = TempDir::new().unwrap();
    let instance_id = {
        let db = open_db(&tmpdir, "reopen");
        db.put(json!({"_id": "kept", "n": 1})).await.unwrap();
        db.put_local(json!({"_id": "_local/checkpoint", "seq": 1}))
            .await
            .unwrap();
        let id = db.id().await.unwrap();
        db.close().await.unwrap();
        id
    };

    let db = open_db(&tmpdir, "reopen");
    assert_eq!(db.id().await.unwrap(), instance_id);
    assert_eq!(db.info().await.unwrap().update_seq, 1);
    assert_eq!(
        db.get("kept", &GetOptions::default()).await.unwrap().doc["n"],
        json!(1)
    );
    assert_eq!(
        db.get_local("_local/checkpoint").await.unwrap()["seq"],
        json!(1)
    );

    let rev = db.put(json!({"_id": "next"})).await.unwrap();
    assert!(rev.starts_with("1-"));
    assert_eq!(db.info().await.unwrap().update_seq, 2);
}

#[tokio::test]
async fn test_live_feed_follows_concurrent_writers() {
    let tmpdir = TempDir::new().unwrap();
    let db = open_db(&tmpdir, "live");

    let mut feed = db
        .live_changes(ChangesOptions {
            limit: Some(10),
            include_docs: true,
            ..Default::default()
        })
        .unwrap();

    let mut writers = Vec::new();
    for i in 0..10 {
        let db = db.clone();
        writers.push(tokio::spawn(async move {
            db.put(json!({"_id": format!("w{}", i), "i": i})).await
        }));
    }
    for writer in writers {
        writer.await.expect("writer panicked").unwrap();
    }

    let mut seen = Vec::new();
    while let Some(change) = tokio::time::timeout(Duration::from_secs(2), feed.next())
        .await
        .expect("live feed stalled")
    {
        assert!(change.doc.is_some());
        seen.push(change.seq);
    }
    assert_eq!(seen, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_destroy_removes_everything() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.path().join("doomed");
    let db = Database::open(DatabaseConfig::new("doomed", &path)).unwrap();
    db.put_attachment("doc", "f", None, b"bytes", "text/plain")
        .await
        .unwrap();

    db.destroy().await.unwrap();
    assert!(!path.exists());
    assert!(matches!(db.info().await, Err(DbError::NotOpen)));
    drop(db);

    let fresh = Database::open(DatabaseConfig::new("doomed", &path)).unwrap();
    assert_eq!(fresh.info().await.unwrap().update_seq, 0);
    assert!(matches!(
        fresh.get("doc", &GetOptions::default()).await,
        Err(DbError::MissingDoc(_))
    ));
}
