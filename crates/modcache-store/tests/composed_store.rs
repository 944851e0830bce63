//! Two-tier lookup, write-through and failure policy of `CacheStore`.

use std::sync::Arc;

use modcache_store::{
    Artifact, CacheError, CacheStore, Digest, Fingerprint, LocalCache, Materialized,
    MemoryRemoteCache, RemoteTier, Tier,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fp(seed: &str) -> Fingerprint {
    Fingerprint::from_digest(Digest::compute(seed.as_bytes()))
}

fn two_tier() -> (tempfile::TempDir, Arc<MemoryRemoteCache>, CacheStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let local = LocalCache::new(dir.path()).expect("local cache");
    let remote = Arc::new(MemoryRemoteCache::new());
    let store = CacheStore::new(local, Some(RemoteTier::Memory(Arc::clone(&remote))));
    (dir, remote, store)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_then_fetch_returns_same_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CacheStore::local_only(LocalCache::new(dir.path()).expect("local"));
    let artifact = Artifact::new(b"Core.framework".to_vec());

    let outcome = store.store(&fp("core"), &artifact).await.expect("store");
    assert!(!outcome.remote_uploaded);

    let fetched = store.fetch(&fp("core")).await.expect("fetch").expect("hit");
    assert_eq!(fetched.content_digest(), artifact.content_digest());
}

#[tokio::test]
async fn remote_hit_is_written_through_to_local_tier() {
    let (_dir, remote, store) = two_tier();
    let artifact = Artifact::new(b"remote payload".to_vec());
    remote.insert(fp("r"), &artifact);

    assert_eq!(store.locate(&fp("r")).await.expect("locate"), Some(Tier::Remote));
    let (fetched, tier) = store
        .fetch_with_tier(&fp("r"))
        .await
        .expect("fetch")
        .expect("hit");
    assert_eq!(tier, Tier::Remote);
    assert_eq!(fetched, artifact);
    assert!(store.local().exists(&fp("r")).expect("exists"));

    let before = remote.requests();
    let (_, tier) = store
        .fetch_with_tier(&fp("r"))
        .await
        .expect("fetch")
        .expect("hit");
    assert_eq!(tier, Tier::Local);
    assert!(store.exists(&fp("r")).await.expect("exists"));
    assert_eq!(remote.requests(), before, "local hit must not touch the network");
}

#[tokio::test]
async fn corrupted_remote_artifact_is_a_miss_and_not_cached_locally() {
    let (_dir, remote, store) = two_tier();
    remote.insert(fp("c"), &Artifact::new(b"0123456789".to_vec()));
    remote.corrupt(&fp("c"), b"01234".to_vec());

    let fetched = store.fetch(&fp("c")).await.expect("fetch");

    assert!(fetched.is_none());
    assert!(!store.local().exists(&fp("c")).expect("exists"));
}

#[tokio::test]
async fn transport_errors_surface_when_local_misses() {
    let (_dir, remote, store) = two_tier();
    remote.set_offline(true);

    assert!(matches!(
        store.exists(&fp("x")).await,
        Err(CacheError::Transport(_))
    ));
    assert!(matches!(
        store.fetch(&fp("x")).await,
        Err(CacheError::Transport(_))
    ));
}

#[tokio::test]
async fn local_hit_does_not_consult_an_offline_remote() {
    let (_dir, remote, store) = two_tier();
    store
        .store(&fp("l"), &Artifact::new(b"local".to_vec()))
        .await
        .expect("store");
    remote.set_offline(true);

    assert!(store.exists(&fp("l")).await.expect("exists"));
    assert!(store.fetch(&fp("l")).await.expect("fetch").is_some());
}

#[tokio::test]
async fn store_uploads_to_remote() {
    let (_dir, remote, store) = two_tier();
    let outcome = store
        .store(&fp("u"), &Artifact::new(b"upload me".to_vec()))
        .await
        .expect("store");
    assert!(outcome.remote_uploaded);
    assert!(remote.contains(&fp("u")));
}

#[tokio::test]
async fn failed_upload_still_stores_locally() {
    let (_dir, remote, store) = two_tier();
    remote.set_offline(true);

    let outcome = store
        .store(&fp("o"), &Artifact::new(b"offline".to_vec()))
        .await
        .expect("local store succeeds");

    assert!(!outcome.remote_uploaded);
    assert!(store.local().exists(&fp("o")).expect("exists"));
}

#[tokio::test]
async fn entry_prefers_local_metadata() {
    let (_dir, remote, store) = two_tier();
    let artifact = Artifact::new(b"meta".to_vec());
    store.store(&fp("m"), &artifact).await.expect("store");
    let before = remote.requests();

    let entry = store.entry(&fp("m")).await.expect("entry").expect("present");

    assert_eq!(entry.content_digest, artifact.content_digest());
    assert_eq!(entry.size, artifact.size());
    assert_eq!(remote.requests(), before);
}

#[tokio::test]
async fn remote_copy_repairs_a_corrupted_local_artifact() {
    let (_dir, remote, store) = two_tier();
    let artifact = Artifact::new(b"intact payload".to_vec());
    store.store(&fp("d"), &artifact).await.expect("store");
    std::fs::write(store.local().artifact_path(&fp("d")), b"bad").expect("corrupt local copy");

    let before = remote.requests();
    let fetched = store.fetch(&fp("d")).await.expect("fetch").expect("remote hit");
    assert_eq!(fetched, artifact);
    assert_eq!(remote.requests() - before, 1);

    let before = remote.requests();
    for _ in 0..2 {
        let (_, tier) = store
            .fetch_with_tier(&fp("d"))
            .await
            .expect("fetch")
            .expect("hit");
        assert_eq!(tier, Tier::Local);
    }
    assert_eq!(remote.requests(), before, "repaired copy must be served locally");
    assert!(store.local().fetch(&fp("d")).expect("local fetch").is_some());
}

#[tokio::test]
async fn materialize_returns_the_local_entry_of_a_remote_hit() {
    let (_dir, remote, store) = two_tier();
    let artifact = Artifact::new(b"remote payload".to_vec());
    remote.insert(fp("mat"), &artifact);

    let before = remote.requests();
    let Materialized::Hit { entry, tier } = store.materialize(&fp("mat")).await.expect("lookup")
    else {
        panic!("expected a hit");
    };
    assert_eq!(tier, Tier::Remote);
    // one existence check, one download
    assert_eq!(remote.requests() - before, 2);
    assert_eq!(
        entry.location,
        store.local().artifact_path(&fp("mat")).display().to_string()
    );

    let before = remote.requests();
    assert!(matches!(
        store.materialize(&fp("mat")).await.expect("lookup"),
        Materialized::Hit {
            tier: Tier::Local,
            ..
        }
    ));
    assert_eq!(remote.requests(), before);
}

#[tokio::test]
async fn materialize_misses_without_downloading() {
    let (_dir, remote, store) = two_tier();

    let before = remote.requests();
    assert!(matches!(
        store.materialize(&fp("none")).await.expect("lookup"),
        Materialized::Miss
    ));
    assert_eq!(remote.requests() - before, 1);
}

#[tokio::test]
async fn materialize_surfaces_existence_check_failures() {
    let (_dir, remote, store) = two_tier();
    remote.set_offline(true);

    assert!(matches!(
        store.materialize(&fp("x")).await,
        Err(CacheError::Transport(_))
    ));
}

#[tokio::test]
async fn materialize_reports_a_failed_write_through() {
    let (dir, remote, store) = two_tier();
    let artifact = Artifact::new(b"unwritable".to_vec());
    remote.insert(fp("w"), &artifact);
    // A directory where the metadata file should go.
    let hex = fp("w").to_hex();
    std::fs::create_dir_all(dir.path().join(&hex[..2]).join(format!("{}.json", &hex[2..])))
        .expect("block metadata path");

    assert!(matches!(
        store.materialize(&fp("w")).await.expect("lookup"),
        Materialized::FetchFailed(CacheError::Io(_))
    ));

    // Plain fetches still hand the bytes back.
    let fetched = store.fetch(&fp("w")).await.expect("fetch").expect("hit");
    assert_eq!(fetched, artifact);
}

#[tokio::test]
async fn materialize_reports_a_corrupted_remote_artifact() {
    let (_dir, remote, store) = two_tier();
    remote.insert(fp("v"), &Artifact::new(b"0123456789".to_vec()));
    remote.corrupt(&fp("v"), b"01234".to_vec());

    assert!(matches!(
        store.materialize(&fp("v")).await.expect("lookup"),
        Materialized::FetchFailed(CacheError::Verification { .. })
    ));
    assert!(!store.local().exists(&fp("v")).expect("exists"));
}
