//! Storage reclamation integration tests
//!
//! Covers:
//! - quota accounting and tombstones per deletion
//! - tier order and ordering within a tier
//! - all-or-nothing behaviour when the tiers run dry
//! - skipping victims whose blob cannot be deleted
//! - unconstructable marking after discarding uncovered history
//! - admission never evicting the incoming file's own dependencies
//! - blobs of uploads in flight and of rolled back evictions

use std::collections::HashSet;
use std::sync::Mutex;

use grip_node::{
    Admission, BlobStore, Context, ContextFile, Digest, Engine, GraphTx, GripError,
    MemoryBlobStore, MemoryStore, NodeKey, ReclaimPolicy, ReclaimTier, SqliteStore, Store,
};

struct Fixture<S: Store, B: BlobStore> {
    engine: Engine<S, B>,
    key: NodeKey,
    ctx: Context,
}

impl<S: Store, B: BlobStore> Fixture<S, B> {
    fn new(store: S, blobs: B, max_disk_space: u64) -> Self {
        let engine = Engine::new(store, blobs, ReclaimPolicy::default());
        let key = NodeKey::generate();
        let ctx = Context::new("reclaim", &key);
        engine.open_account("acct", max_disk_space).unwrap();
        engine.register_context(&ctx, "acct").unwrap();
        Self { engine, key, ctx }
    }

    /// Store `data` as a blob and build a signed file over it.
    fn build(&self, data: &[u8], snapshot: bool, index: bool, deps: &[Digest]) -> ContextFile {
        let content = self.engine.blobs().put(data).unwrap();
        let mut builder = ContextFile::builder(*self.ctx.dig(), content, data.len() as u64)
            .snapshot(snapshot)
            .index(index);
        for dep in deps {
            builder = builder.depends_on(*dep);
        }
        builder.sign(&self.key)
    }

    fn add(&self, data: &[u8], snapshot: bool, index: bool, deps: &[Digest]) -> ContextFile {
        let file = self.build(data, snapshot, index, deps);
        assert!(matches!(self.engine.admit(&file).unwrap(), Admission::Stored(_)));
        file
    }

    fn used(&self) -> u64 {
        self.engine.account("acct").unwrap().unwrap().disk_space_used
    }

    fn message(&self) -> String {
        self.engine.account("acct").unwrap().unwrap().message
    }

    fn stored(&self, file: &ContextFile) -> bool {
        self.engine.context_file(file.data_dep_dig()).unwrap().is_some()
    }
}

fn memory_fixture(max_disk_space: u64) -> Fixture<MemoryStore, MemoryBlobStore> {
    Fixture::new(MemoryStore::new(), MemoryBlobStore::new(), max_disk_space)
}

fn missing(label: &str) -> Digest {
    Digest::of(label.as_bytes())
}

// =============================================================================
// Quota accounting
// =============================================================================

fn run_quota_scenario<S: Store>(store: S) {
    let fx = Fixture::new(store, MemoryBlobStore::new(), 1000);
    let s1 = fx.add(&[1u8; 300], true, false, &[]);
    let s2 = fx.add(&[2u8; 700], true, false, &[*s1.data_dep_dig()]);
    assert_eq!(fx.used(), 1000);

    let report = fx.engine.reclaim(fx.ctx.dig(), 200).unwrap();
    assert_eq!(report.requested, 200);
    assert_eq!(report.freed, 300);
    assert_eq!(report.evictions.len(), 1);
    assert_eq!(report.evictions[0].tier, ReclaimTier::CoveredSnapshots);
    assert!(!report.damaging());
    assert_eq!(fx.used(), 700);

    // One tombstone, matching the deleted file
    let tombstones = fx.engine.tombstones(fx.ctx.dig()).unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].data_dep_dig, *s1.data_dep_dig());
    assert_eq!(tombstones[0].dig, *s1.dig());
    assert_eq!(tombstones[0].context, *fx.ctx.dig());
    assert_eq!(report.evictions[0].tombstone, tombstones[0]);

    assert!(!fx.stored(&s1));
    assert!(!fx.engine.blobs().exists(s1.content()).unwrap());
    assert!(fx.engine.blobs().exists(s2.content()).unwrap());

    let s2_wrap = fx.engine.context_file(s2.data_dep_dig()).unwrap().unwrap().wrap;
    assert!(s2_wrap.head);
    assert!(s2_wrap.leaf);
    assert_eq!(s2_wrap.depth, 0);

    // Discarded files are not taken back
    assert_eq!(fx.engine.admit(&s1).unwrap(), Admission::PreviouslyDiscarded);
    assert_eq!(fx.used(), 700);
}

#[test]
fn test_quota_scenario_memory() {
    run_quota_scenario(MemoryStore::new());
}

#[test]
fn test_quota_scenario_sqlite() {
    run_quota_scenario(SqliteStore::open_in_memory().unwrap());
}

#[test]
fn test_admission_reclaims_shortfall() {
    let fx = memory_fixture(1000);
    let s1 = fx.add(&[1u8; 300], true, false, &[]);
    let s2 = fx.add(&[2u8; 700], true, false, &[*s1.data_dep_dig()]);

    let s3 = fx.add(&[3u8; 200], true, false, &[*s2.data_dep_dig()]);
    assert!(!fx.stored(&s1));
    assert!(fx.stored(&s2));
    assert!(fx.stored(&s3));
    assert_eq!(fx.used(), 900);
}

#[test]
fn test_oversized_file_rejected() {
    let fx = memory_fixture(100);
    let s1 = fx.add(&[1u8; 40], true, false, &[]);

    let big = fx.build(&[9u8; 150], true, false, &[*s1.data_dep_dig()]);
    let err = fx.engine.admit(&big).unwrap_err();
    assert!(matches!(err, GripError::QuotaExhausted { .. }));

    assert!(fx.stored(&s1));
    assert!(!fx.stored(&big));
    assert_eq!(fx.used(), 40);
    assert_eq!(fx.message(), "out of space, index too large");
}

// =============================================================================
// Exhaustion
// =============================================================================

#[test]
fn test_exhaustion_deletes_nothing() {
    let fx = memory_fixture(1000);
    let only = fx.add(&[1u8; 300], true, false, &[]);

    let err = fx.engine.reclaim(fx.ctx.dig(), 500).unwrap_err();
    match err {
        GripError::QuotaExhausted { needed, reclaimable, .. } => {
            assert_eq!(needed, 500);
            assert_eq!(reclaimable, 300);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert!(fx.stored(&only));
    assert_eq!(fx.used(), 300);
    assert!(fx.engine.tombstones(fx.ctx.dig()).unwrap().is_empty());
    assert_eq!(fx.message(), "out of space, index too large");
}

#[test]
fn test_empty_context_has_nothing_to_reclaim() {
    let fx = memory_fixture(1000);
    assert!(matches!(
        fx.engine.reclaim(fx.ctx.dig(), 200),
        Err(GripError::QuotaExhausted { reclaimable: 0, .. })
    ));
    assert_eq!(fx.used(), 0);

    let report = fx.engine.reclaim(fx.ctx.dig(), 0).unwrap();
    assert!(report.evictions.is_empty());
}

#[test]
fn test_unknown_context_reclaim() {
    let fx = memory_fixture(1000);
    assert!(matches!(
        fx.engine.reclaim(&missing("nope"), 1),
        Err(GripError::UnknownContext(_))
    ));
}

// =============================================================================
// Tier order
// =============================================================================

#[test]
fn test_covered_snapshots_deepest_first() {
    let fx = memory_fixture(10_000);
    let a = fx.add(b"aaaaaaaaaa", true, false, &[]);
    let b = fx.add(b"bbbbbbbbbb", true, false, &[*a.data_dep_dig()]);
    let c = fx.add(b"cccccccccc", true, false, &[*b.data_dep_dig()]);

    let report = fx.engine.reclaim(fx.ctx.dig(), 20).unwrap();
    let order: Vec<_> = report.evictions.iter().map(|e| e.tombstone.data_dep_dig).collect();
    assert_eq!(order, vec![*a.data_dep_dig(), *b.data_dep_dig()]);
    assert_eq!(report.evictions[0].depth, 2);
    assert_eq!(report.evictions[1].depth, 1);
    assert!(fx.stored(&c));
    assert_eq!(fx.used(), 10);
}

#[test]
fn test_larger_first_within_depth() {
    let fx = memory_fixture(10_000);
    let small = fx.add(&[1u8; 50], true, false, &[]);
    let large = fx.add(&[2u8; 80], true, false, &[]);
    fx.add(&[3u8; 10], true, false, &[*small.data_dep_dig(), *large.data_dep_dig()]);

    let report = fx.engine.reclaim(fx.ctx.dig(), 1).unwrap();
    assert_eq!(report.evictions.len(), 1);
    assert_eq!(report.evictions[0].tombstone.data_dep_dig, *large.data_dep_dig());
    assert!(fx.stored(&small));
}

#[test]
fn test_tiers_exhausted_in_order() {
    let fx = memory_fixture(10_000);

    // Leaves whose dependencies never arrived
    let d = fx.add(&[1u8; 10], false, false, &[missing("x")]);
    fx.add(&[2u8; 100], true, false, &[*d.data_dep_dig()]);
    let di = fx.add(&[3u8; 10], false, true, &[missing("y")]);
    fx.add(&[4u8; 100], true, false, &[*di.data_dep_dig()]);
    fx.add(&[5u8; 10], false, false, &[missing("z")]);

    let report = fx.engine.reclaim(fx.ctx.dig(), 30).unwrap();
    assert_eq!(report.evictions.len(), 3);

    assert_eq!(report.evictions[0].tier, ReclaimTier::CoveredLeaves);
    assert_eq!(report.evictions[0].tombstone.data_dep_dig, *d.data_dep_dig());
    assert_eq!(report.evictions[1].tier, ReclaimTier::CoveredIndexLeaves);
    assert_eq!(report.evictions[1].tombstone.data_dep_dig, *di.data_dep_dig());
    assert_eq!(report.evictions[2].tier, ReclaimTier::UncoveredLeaves);
    assert_eq!(report.evictions[2].size, 100);
    assert!(report.damaging());
    assert_eq!(fx.used(), 230 - report.freed);
}

#[test]
fn test_custom_policy_without_damaging_tier() {
    let policy = ReclaimPolicy {
        tiers: vec![ReclaimTier::CoveredSnapshots],
        exhausted_message: "nothing safe to delete".to_string(),
    };
    let key = NodeKey::generate();
    let ctx = Context::new("policy", &key);
    let engine = Engine::new(MemoryStore::new(), MemoryBlobStore::new(), policy);
    engine.open_account("acct", 1000).unwrap();
    engine.register_context(&ctx, "acct").unwrap();

    let only = ContextFile::builder(*ctx.dig(), Digest::of(b"only"), 10)
        .snapshot(true)
        .sign(&key);
    engine.admit(&only).unwrap();

    assert!(matches!(
        engine.reclaim(ctx.dig(), 5),
        Err(GripError::QuotaExhausted { .. })
    ));
    assert_eq!(engine.account("acct").unwrap().unwrap().message, "nothing safe to delete");
}

// =============================================================================
// History loss
// =============================================================================

#[test]
fn test_uncovered_deletion_marks_dependents_unconstructable() {
    let fx = memory_fixture(10_000);
    let a = fx.add(&[1u8; 10], true, false, &[]);
    let b = fx.add(&[2u8; 10], false, false, &[*a.data_dep_dig()]);
    let c = fx.add(&[3u8; 10], true, false, &[*b.data_dep_dig()]);
    let d = fx.add(&[4u8; 10], false, false, &[*c.data_dep_dig()]);
    let b2 = fx.add(&[7u8; 10], false, false, &[*b.data_dep_dig()]);

    // b2 keeps b and a uncovered; only the root leaf qualifies, in the last tier
    let report = fx.engine.reclaim(fx.ctx.dig(), 10).unwrap();
    assert_eq!(report.evictions.len(), 1);
    assert_eq!(report.evictions[0].tombstone.data_dep_dig, *a.data_dep_dig());
    assert_eq!(report.evictions[0].tier, ReclaimTier::UncoveredLeaves);
    let marked: HashSet<Digest> = report.evictions[0].unconstructable.iter().copied().collect();
    assert_eq!(marked, HashSet::from([*b.data_dep_dig(), *b2.data_dep_dig()]));

    let wrap = |f: &ContextFile| fx.engine.context_file(f.data_dep_dig()).unwrap().unwrap().wrap;
    assert!(wrap(&b).unconstructable);
    assert!(wrap(&b).leaf);
    assert!(wrap(&b2).unconstructable);
    assert!(!wrap(&c).unconstructable);
    assert!(!wrap(&d).unconstructable);

    // New deltas on top of lost history inherit the flag
    let e = fx.add(&[5u8; 10], false, false, &[*b.data_dep_dig()]);
    assert!(wrap(&e).unconstructable);
    let snap = fx.add(&[6u8; 10], true, false, &[*b.data_dep_dig()]);
    assert!(!wrap(&snap).unconstructable);
}

// =============================================================================
// Failing deletions
// =============================================================================

/// Blob store whose deletes fail for selected digests
#[derive(Default)]
struct FailingBlobs {
    inner: MemoryBlobStore,
    fail: Mutex<HashSet<Digest>>,
}

impl BlobStore for FailingBlobs {
    fn put(&self, data: &[u8]) -> grip_node::Result<Digest> {
        self.inner.put(data)
    }

    fn get(&self, digest: &Digest) -> grip_node::Result<Vec<u8>> {
        self.inner.get(digest)
    }

    fn exists(&self, digest: &Digest) -> grip_node::Result<bool> {
        self.inner.exists(digest)
    }

    fn size(&self, digest: &Digest) -> grip_node::Result<u64> {
        self.inner.size(digest)
    }

    fn delete(&self, digest: &Digest) -> grip_node::Result<()> {
        if self.fail.lock().unwrap().contains(digest) {
            return Err(GripError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only blob",
            )));
        }
        self.inner.delete(digest)
    }
}

#[test]
fn test_failed_victim_is_skipped() {
    let fx = Fixture::new(MemoryStore::new(), FailingBlobs::default(), 10_000);
    let a = fx.add(b"aaaaaaaaaa", true, false, &[]);
    let b = fx.add(b"bbbbbbbbbb", true, false, &[*a.data_dep_dig()]);
    let c = fx.add(b"cccccccccc", true, false, &[*b.data_dep_dig()]);
    fx.engine.blobs().fail.lock().unwrap().insert(*a.content());

    let report = fx.engine.reclaim(fx.ctx.dig(), 10).unwrap();
    assert_eq!(report.skipped, vec![*a.data_dep_dig()]);
    assert_eq!(report.evictions.len(), 1);
    assert_eq!(report.evictions[0].tombstone.data_dep_dig, *b.data_dep_dig());

    // The failed step rolled back completely
    assert!(fx.stored(&a));
    assert!(fx.engine.blobs().exists(a.content()).unwrap());
    assert_eq!(fx.engine.tombstones(fx.ctx.dig()).unwrap().len(), 1);
    assert_eq!(fx.used(), 20);

    // a lost its only dependent but stays covered by the snapshot chain
    let a_wrap = fx.engine.context_file(a.data_dep_dig()).unwrap().unwrap().wrap;
    assert!(a_wrap.head);
    assert!(a_wrap.covered_by_snapshot);
    let c_wrap = fx.engine.context_file(c.data_dep_dig()).unwrap().unwrap().wrap;
    assert!(c_wrap.leaf);
}

#[test]
fn test_shared_content_blob_survives() {
    let fx = memory_fixture(10_000);
    let a = fx.add(b"same", true, false, &[]);
    let b = fx.add(b"top", true, false, &[*a.data_dep_dig()]);
    // Same bytes, different position in the graph
    let twin = fx.add(b"same", true, false, &[*b.data_dep_dig()]);
    assert_eq!(a.content(), twin.content());

    let report = fx.engine.reclaim(fx.ctx.dig(), 1).unwrap();
    assert_eq!(report.evictions[0].tombstone.data_dep_dig, *a.data_dep_dig());
    assert!(fx.engine.blobs().exists(a.content()).unwrap());
}

// =============================================================================
// Admission-triggered reclamation
// =============================================================================

#[test]
fn test_admission_keeps_its_own_base() {
    let fx = memory_fixture(1000);
    let s1 = fx.add(&[1u8; 300], true, false, &[]);
    let s2 = fx.add(&[2u8; 700], true, false, &[*s1.data_dep_dig()]);

    // s1 was covered by s2, but the newcomer builds on it
    let f = fx.build(&[3u8; 100], false, false, &[*s1.data_dep_dig()]);
    let err = fx.engine.admit(&f).unwrap_err();
    assert!(matches!(err, GripError::QuotaExhausted { .. }));

    assert!(fx.stored(&s1));
    assert!(fx.stored(&s2));
    assert!(!fx.stored(&f));
    assert!(fx.engine.tombstones(fx.ctx.dig()).unwrap().is_empty());
    assert_eq!(fx.used(), 1000);
    assert_eq!(fx.message(), "out of space, index too large");
}

#[test]
fn test_admission_reclaims_with_its_own_arrival() {
    let fx = memory_fixture(700);
    let x = fx.add(&[1u8; 100], true, false, &[]);
    let y = fx.add(&[2u8; 100], false, false, &[*x.data_dep_dig()]);
    let z = fx.add(&[3u8; 100], true, false, &[*y.data_dep_dig()]);
    let w = fx.add(&[4u8; 300], true, false, &[]);
    let v = fx.add(&[5u8; 100], true, false, &[*w.data_dep_dig()]);
    assert_eq!(fx.used(), 700);

    // Before f arrives x is the deepest covered snapshot. A second delta
    // on y uncovers it, leaving w as the only safe victim.
    let f = fx.build(&[6u8; 50], false, false, &[*y.data_dep_dig()]);
    assert!(matches!(fx.engine.admit(&f).unwrap(), Admission::Stored(_)));

    let tombstones = fx.engine.tombstones(fx.ctx.dig()).unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].data_dep_dig, *w.data_dep_dig());
    for kept in [&x, &y, &z, &v, &f] {
        assert!(fx.stored(kept));
    }
    let f_wrap = fx.engine.context_file(f.data_dep_dig()).unwrap().unwrap().wrap;
    assert!(!f_wrap.unconstructable);
    assert_eq!(fx.used(), 450);
}

// =============================================================================
// Blob lifetime
// =============================================================================

#[test]
fn test_upload_in_flight_survives_reclaim_elsewhere() {
    let fx = memory_fixture(10_000);
    let other = Context::new("other", &fx.key);
    fx.engine.register_context(&other, "acct").unwrap();

    let a1 = fx.add(b"shared", true, false, &[]);
    fx.add(b"top", true, false, &[*a1.data_dep_dig()]);

    // The only stored reference goes away while the same bytes are being
    // contributed to another context
    let (b1, admission) = fx
        .engine
        .admit_content(b"shared", |content| {
            let report = fx.engine.reclaim(fx.ctx.dig(), 1).unwrap();
            assert_eq!(report.evictions[0].tombstone.data_dep_dig, *a1.data_dep_dig());
            ContextFile::builder(*other.dig(), content, 6)
                .snapshot(true)
                .sign(&fx.key)
        })
        .unwrap();
    assert!(matches!(admission, Admission::Stored(_)));
    assert!(!fx.stored(&a1));
    assert!(fx.engine.blobs().exists(b1.content()).unwrap());

    // Once the upload is done the blob goes with its last reference
    let top = fx.engine.blobs().put(b"other top").unwrap();
    let above = ContextFile::builder(*other.dig(), top, 9)
        .snapshot(true)
        .depends_on(*b1.data_dep_dig())
        .sign(&fx.key);
    fx.engine.admit(&above).unwrap();
    let report = fx.engine.reclaim(other.dig(), 1).unwrap();
    assert_eq!(report.evictions[0].tombstone.data_dep_dig, *b1.data_dep_dig());
    assert!(!fx.engine.blobs().exists(b1.content()).unwrap());
}

/// Memory store that runs a chosen transaction to the end, then refuses
/// to commit it
#[derive(Default)]
struct CommitFails {
    inner: MemoryStore,
    /// Transactions to let through before the failing one
    fail_after: Mutex<Option<usize>>,
}

impl CommitFails {
    fn doomed(&self) -> bool {
        let mut left = self.fail_after.lock().unwrap();
        match *left {
            Some(0) => {
                *left = None;
                true
            }
            Some(n) => {
                *left = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

impl Store for CommitFails {
    fn transact<T, F>(&self, f: F) -> grip_node::Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> grip_node::Result<T>,
    {
        if self.doomed() {
            self.inner.dry_run(f)?;
            return Err(GripError::Internal("commit failed".into()));
        }
        self.inner.transact(f)
    }

    fn dry_run<T, F>(&self, f: F) -> grip_node::Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> grip_node::Result<T>,
    {
        self.inner.dry_run(f)
    }
}

#[test]
fn test_blob_restored_when_eviction_does_not_commit() {
    let fx = Fixture::new(CommitFails::default(), MemoryBlobStore::new(), 10_000);
    let a = fx.add(b"aaaaaaaaaa", true, false, &[]);
    let b = fx.add(b"bbbbbbbbbb", true, false, &[*a.data_dep_dig()]);

    // The account lookup commits, the eviction of a does not
    *fx.engine.store().fail_after.lock().unwrap() = Some(1);
    let err = fx.engine.reclaim(fx.ctx.dig(), 1).unwrap_err();
    assert!(matches!(err, GripError::QuotaExhausted { .. }));

    assert!(fx.stored(&a));
    assert!(fx.stored(&b));
    assert!(fx.engine.blobs().exists(a.content()).unwrap());
    assert_eq!(fx.engine.blobs().get(a.content()).unwrap(), b"aaaaaaaaaa".to_vec());
    assert!(fx.engine.tombstones(fx.ctx.dig()).unwrap().is_empty());
    assert_eq!(fx.used(), 20);
}
