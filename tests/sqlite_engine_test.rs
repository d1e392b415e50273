//! On-disk engine integration tests
//!
//! Runs the engine over the SQLite store and filesystem blob store and
//! checks that graph state, tombstones and quotas survive a reopen.

use grip_node::{
    Admission, BlobStore, Context, ContextFile, Engine, FsBlobStore, NodeKey, ReclaimPolicy,
    SqliteStore,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Engine<SqliteStore, FsBlobStore> {
    let store = SqliteStore::open(&dir.path().join("grip.db")).unwrap();
    let blobs = FsBlobStore::new(dir.path()).unwrap();
    Engine::new(store, blobs, ReclaimPolicy::default())
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let key = NodeKey::from_secret([7u8; 32]);
    let ctx = Context::new("persisted", &key);

    let (s1, s2) = {
        let engine = open(&dir);
        engine.open_account("acct", 1000).unwrap();
        engine.register_context(&ctx, "acct").unwrap();

        let c1 = engine.blobs().put(&[1u8; 300]).unwrap();
        let s1 = ContextFile::builder(*ctx.dig(), c1, 300).snapshot(true).sign(&key);
        let c2 = engine.blobs().put(&[2u8; 700]).unwrap();
        let s2 = ContextFile::builder(*ctx.dig(), c2, 700)
            .snapshot(true)
            .depends_on(*s1.data_dep_dig())
            .sign(&key);

        engine.admit(&s1).unwrap();
        engine.admit(&s2).unwrap();
        (s1, s2)
    };

    let engine = open(&dir);

    // Reopening keeps usage and takes the configured limit
    let account = engine.open_account("acct", 1000).unwrap();
    assert_eq!(account.disk_space_used, 1000);

    assert_eq!(engine.contexts().unwrap(), vec![ctx.clone()]);
    let s1_wrap = engine.context_file(s1.data_dep_dig()).unwrap().unwrap();
    assert_eq!(s1_wrap.file, s1);
    assert!(s1_wrap.wrap.covered_by_snapshot);
    assert_eq!(s1_wrap.wrap.depth, 1);

    assert_eq!(engine.admit(&s2).unwrap(), Admission::AlreadyStored);

    let report = engine.reclaim(ctx.dig(), 200).unwrap();
    assert_eq!(report.freed, 300);
    assert!(!engine.blobs().exists(s1.content()).unwrap());
    assert!(engine.blobs().exists(s2.content()).unwrap());
    drop(engine);

    let engine = open(&dir);
    assert_eq!(engine.account("acct").unwrap().unwrap().disk_space_used, 700);
    assert_eq!(engine.tombstones(ctx.dig()).unwrap().len(), 1);
    assert_eq!(engine.admit(&s1).unwrap(), Admission::PreviouslyDiscarded);

    let heads = engine.heads(ctx.dig()).unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].file, s2);
    assert!(heads[0].wrap.leaf);
}

#[test]
fn test_quarantine_persists() {
    let dir = TempDir::new().unwrap();
    let key = NodeKey::generate();
    let ctx = Context::new("q", &key);

    {
        let engine = open(&dir);
        engine.open_account("acct", 1000).unwrap();
        engine.register_context(&ctx, "acct").unwrap();
        let loose = ContextFile::builder(*ctx.dig(), grip_node::Digest::of(b"loose"), 5).sign(&key);
        assert!(engine.admit(&loose).is_err());
    }

    let engine = open(&dir);
    let quarantined = engine.quarantined(ctx.dig()).unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason, "file without dependencies must be a snapshot");
    assert!(engine.heads(ctx.dig()).unwrap().is_empty());
}
