mod common;

use std::{
    fs,
    os::unix::fs::MetadataExt,
    sync::{atomic::Ordering, Arc},
    thread,
};

use rustix::process::geteuid;

use similar_asserts::assert_eq;

use layerstore::{
    creator::CreateSpec,
    dependency::ArtifactId,
    digest::{sha256_digest, ChainId},
    error::{ErrorKind, FetchErrorKind},
    idmap::IdMapping,
    locksmith::{image_lock_key, FileLocksmith, GLOBAL_LOCK_KEY},
    metrics::{IMAGE_CLEAN_TIME, IMAGE_CREATION_TIME, IMAGE_DELETION_TIME, UNPACK_TIME},
};

use common::{layer, Entry, TestStore};

fn base_layer() -> Vec<u8> {
    layer(&[
        Entry::Dir("etc"),
        Entry::File("etc/os-release", b"ID=test\n"),
        Entry::Dir("bin"),
        Entry::File("bin/sh", b"#!fake shell\n"),
    ])
}

fn app_layer() -> Vec<u8> {
    layer(&[Entry::Dir("app"), Entry::File("app/run", b"run\n")])
}

fn extra_layer() -> Vec<u8> {
    layer(&[Entry::File("app/extra", b"extra\n")])
}

fn spec(reference: &str, id: &str) -> CreateSpec {
    CreateSpec {
        id: id.to_string(),
        base_image: reference.to_string(),
        ..Default::default()
    }
}

/// `spec` unpacked into a user namespace whose root is host uid/gid 100000.
fn mapped_spec(reference: &str, id: &str) -> CreateSpec {
    let mapping: IdMapping = "0:100000:65536".parse().unwrap();
    CreateSpec {
        uid_mappings: vec![mapping],
        gid_mappings: vec![mapping],
        ..spec(reference, id)
    }
}

#[test]
fn test_create_builds_rootfs() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);

    let bundle = ts.store.create(&spec("app", "x")).unwrap();
    assert_eq!(bundle.path, ts.layout.images_dir().join("x"));
    assert_eq!(
        fs::read_to_string(bundle.rootfs.join("etc/os-release")).unwrap(),
        "ID=test\n"
    );
    assert_eq!(fs::read_to_string(bundle.rootfs.join("app/run")).unwrap(), "run\n");
    assert_eq!(bundle.chain_ids.len(), 2);
    assert_eq!(
        bundle.base_image_size,
        (base_layer().len() + app_layer().len()) as u64
    );

    let deps = ts.store.dependencies();
    assert_eq!(
        deps.dependencies(&ArtifactId::image("x")).unwrap(),
        bundle.chain_ids
    );
    assert_eq!(
        deps.dependencies(&ArtifactId::base_image("app")).unwrap(),
        bundle.chain_ids
    );
    assert_eq!(ts.store.bundle("x").unwrap(), bundle);
    assert_eq!(ts.store.ids().unwrap(), vec!["x".to_string()]);
}

#[test]
fn test_shared_prefix_is_deduplicated() {
    let ts = TestStore::new();
    ts.fetcher.add_image("short", vec![base_layer(), app_layer()]);
    ts.fetcher
        .add_image("long", vec![base_layer(), app_layer(), extra_layer()]);

    let x = ts.store.create(&spec("short", "x")).unwrap();
    let y = ts.store.create(&spec("long", "y")).unwrap();

    assert_eq!(x.chain_ids[..], y.chain_ids[..2]);
    assert_eq!(ts.volume_count(), 3);
    assert_eq!(ts.fetcher.streamed(&base_layer()), 1);
    assert_eq!(ts.fetcher.streamed(&app_layer()), 1);
    assert_eq!(ts.fetcher.streamed(&extra_layer()), 1);

    // the chain is the OCI ChainID chain over the diff IDs
    let diff_ids = [
        sha256_digest(base_layer()),
        sha256_digest(app_layer()),
        sha256_digest(extra_layer()),
    ];
    let expected = ChainId::compute_all(diff_ids.iter().map(String::as_str)).unwrap();
    assert_eq!(y.chain_ids, expected);
}

#[test]
fn test_delete_and_collect_scenario() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);

    ts.store.create(&spec("app", "x")).unwrap();
    ts.store.create(&spec("app", "y")).unwrap();
    assert_eq!(ts.volume_count(), 2);

    ts.store.delete("x").unwrap();
    assert!(!ts.layout.images_dir().join("x").exists());
    let outcome = ts.store.clean(0, &[], true).unwrap();
    assert!(!outcome.is_noop());
    assert_eq!(ts.volume_count(), 2, "y still needs both volumes");

    ts.store.delete("y").unwrap();
    ts.store.clean(0, &[], true).unwrap();
    assert_eq!(ts.volume_count(), 0);
    // the cached blobs went with their volumes
    assert_eq!(fs::read_dir(ts.layout.cache_dir()).unwrap().count(), 0);
    assert!(ts.store.dependencies().artifacts().unwrap().is_empty());
}

#[test]
fn test_clean_keeps_ignored_base_images() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);
    ts.store.create(&spec("app", "x")).unwrap();
    ts.store.delete("x").unwrap();

    ts.store.clean(0, &["app".to_string()], true).unwrap();
    assert_eq!(ts.volume_count(), 2);

    // recreating reuses the kept layers
    ts.store.create(&spec("app", "x")).unwrap();
    assert_eq!(ts.fetcher.total_streamed(), 2);
}

#[test]
fn test_collect_is_idempotent() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);
    ts.store.create(&spec("app", "x")).unwrap();
    ts.store.delete("x").unwrap();

    let first = ts.store.clean(0, &[], true).unwrap();
    let second = ts.store.clean(0, &[], true).unwrap();
    let layerstore::cleaner::CleanOutcome::Collected(first) = first else {
        panic!("expected a collection");
    };
    let layerstore::cleaner::CleanOutcome::Collected(second) = second else {
        panic!("expected a collection");
    };
    assert_eq!(first.volumes_removed.len(), 2);
    assert!(second.volumes_removed.is_empty());
}

#[test]
fn test_clean_below_threshold_is_noop() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);
    ts.store.create(&spec("app", "x")).unwrap();
    ts.store.delete("x").unwrap();

    assert!(ts.store.clean(u64::MAX, &[], true).unwrap().is_noop());
    assert_eq!(ts.volume_count(), 1);
}

#[test]
fn test_dry_run_previews_collection() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);
    let bundle = ts.store.create(&spec("app", "x")).unwrap();
    ts.store.delete("x").unwrap();

    let preview = ts.store.clean_dry_run(&[]).unwrap();
    let mut expected = bundle.chain_ids.clone();
    expected.sort();
    assert_eq!(preview.volumes_removed, expected);
    assert_eq!(ts.volume_count(), 2);
}

#[test]
fn test_concurrent_creates_share_volumes() {
    let ts = TestStore::with_locksmith(|layout| Arc::new(FileLocksmith::new(layout.locks_dir())));
    ts.fetcher
        .add_image("app", vec![base_layer(), app_layer(), extra_layer()]);

    let stores: Vec<_> = (0..4).map(|_| ts.reopen(0)).collect();
    let bundles: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = stores
            .iter()
            .enumerate()
            .map(|(n, store)| scope.spawn(move || store.create(&spec("app", &format!("c{n}")))))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect()
    });

    assert_eq!(bundles.len(), 4);
    assert_eq!(ts.volume_count(), 3);
    assert_eq!(ts.fetcher.total_streamed(), 3);
    for bundle in &bundles {
        assert_eq!(bundle.chain_ids, bundles[0].chain_ids);
        assert!(bundle.rootfs.join("app/extra").exists());
    }
}

#[test]
fn test_quota_is_passed_through() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);

    let bundle = ts
        .store
        .create(&CreateSpec {
            disk_limit: 10 << 20,
            exclude_base_image_from_quota: true,
            ..spec("app", "x")
        })
        .unwrap();
    assert_eq!(
        *ts.quota.limits.lock().unwrap(),
        vec![(bundle.rootfs.clone(), 10 << 20, true)]
    );
    assert!(bundle.exclusive_limit);
}

#[test]
fn test_inclusive_limit_below_base_size_is_rejected() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);

    let err = ts
        .store
        .create(&CreateSpec {
            disk_limit: 1,
            ..spec("app", "x")
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(!ts.layout.images_dir().join("x").exists());
    assert_eq!(
        ts.store
            .dependencies()
            .dependencies(&ArtifactId::image("x"))
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );

    // the same limit is fine when the base image is excluded
    ts.store
        .create(&CreateSpec {
            disk_limit: 1,
            exclude_base_image_from_quota: true,
            ..spec("app", "x")
        })
        .unwrap();
}

#[test]
fn test_quota_failure_leaves_nothing_behind() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);
    ts.quota.fail.store(true, Ordering::SeqCst);

    let err = ts
        .store
        .create(&CreateSpec {
            disk_limit: 10 << 20,
            exclude_base_image_from_quota: true,
            ..spec("app", "x")
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Quota);
    assert!(!ts.layout.images_dir().join("x").exists());
    assert!(ts
        .store
        .dependencies()
        .artifacts()
        .unwrap()
        .iter()
        .all(|artifact| !artifact.is_image()));
    assert!(!ts.any_locked(&[GLOBAL_LOCK_KEY, &image_lock_key("x")]));

    ts.quota.fail.store(false, Ordering::SeqCst);
    ts.store.create(&spec("app", "x")).unwrap();
}

#[test]
fn test_interrupted_fetch_leaves_no_cache_entry() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);
    ts.fetcher.interrupt.store(true, Ordering::SeqCst);

    let err = ts.store.create(&spec("app", "x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(!ts.cache.contains(&sha256_digest(base_layer())).unwrap());
    assert_eq!(fs::read_dir(ts.layout.cache_dir()).unwrap().count(), 0);
    assert_eq!(fs::read_dir(ts.layout.volumes_dir()).unwrap().count(), 0);
    assert!(!ts.layout.images_dir().join("x").exists());

    ts.fetcher.interrupt.store(false, Ordering::SeqCst);
    ts.store.create(&spec("app", "x")).unwrap();
    assert_eq!(ts.fetcher.streamed(&base_layer()), 2);
    assert!(ts.cache.contains(&sha256_digest(base_layer())).unwrap());
}

#[test]
fn test_whiteouts_hide_lower_layers() {
    let ts = TestStore::new();
    let lower = layer(&[
        Entry::File("gone", b"lower\n"),
        Entry::Dir("dir"),
        Entry::File("dir/old", b"old\n"),
        Entry::File("kept", b"kept\n"),
    ]);
    let upper = layer(&[
        Entry::File(".wh.gone", b""),
        Entry::Dir("dir"),
        Entry::File("dir/.wh..wh..opq", b""),
        Entry::File("dir/new", b"new\n"),
    ]);
    ts.fetcher.add_image("app", vec![lower, upper]);

    let bundle = ts.store.create(&spec("app", "x")).unwrap();
    assert!(!bundle.rootfs.join("gone").exists());
    assert!(!bundle.rootfs.join(".wh.gone").exists());
    assert!(!bundle.rootfs.join("dir/old").exists());
    assert!(!bundle.rootfs.join("dir/.wh..wh..opq").exists());
    assert_eq!(fs::read_to_string(bundle.rootfs.join("dir/new")).unwrap(), "new\n");
    assert_eq!(fs::read_to_string(bundle.rootfs.join("kept")).unwrap(), "kept\n");

    // the lower volume is untouched
    let lower_volume = ts.store.driver().volume_path(&bundle.chain_ids[0]);
    assert!(lower_volume.join("gone").exists());
    assert!(lower_volume.join("dir/old").exists());
}

#[test]
fn test_duplicate_id_is_rejected_before_pulling() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);
    ts.fetcher.add_image("other", vec![app_layer()]);
    ts.store.create(&spec("app", "x")).unwrap();

    let err = ts.store.create(&spec("other", "x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(err.to_string(), "image for id `x` already exists");
    assert_eq!(ts.fetcher.streamed(&app_layer()), 0);
    assert!(ts.layout.images_dir().join("x/rootfs/etc/os-release").exists());
}

#[test]
fn test_missing_image_releases_locks() {
    let ts = TestStore::new();
    let err = ts.store.create(&spec("nope", "x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fetch(FetchErrorKind::NotFound));
    assert!(!ts.any_locked(&[GLOBAL_LOCK_KEY, &image_lock_key("x")]));
    assert_eq!(ts.volume_count(), 0);
}

#[test]
fn test_delete_missing_bundle() {
    let ts = TestStore::new();
    let err = ts.store.delete("ghost").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!ts.any_locked(&[&image_lock_key("ghost")]));
}

#[test]
fn test_invalid_input_is_rejected_early() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);

    let err = ts.store.create(&spec("app", "../escape")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    // ownership outside the mapping
    let err = ts
        .store
        .create(&CreateSpec {
            uid_mappings: vec!["1:100000:65536".parse::<IdMapping>().unwrap()],
            ..spec("app", "x")
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(ts.volume_count(), 0);
    assert_eq!(ts.fetcher.total_streamed(), 1);
}

#[test]
fn test_records_survive_reopening() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);
    let bundle = ts.store.create(&spec("app", "x")).unwrap();

    let reopened = ts.reopen(0);
    assert_eq!(reopened.bundle("x").unwrap(), bundle);
    assert_eq!(
        reopened
            .dependencies()
            .dependencies(&ArtifactId::image("x"))
            .unwrap(),
        bundle.chain_ids
    );
    // the live bundle is a root for the reopened store's collector as well
    reopened.clean(0, &[], true).unwrap();
    assert_eq!(ts.volume_count(), 1);

    reopened.delete("x").unwrap();
    reopened.clean(0, &[], true).unwrap();
    assert_eq!(ts.volume_count(), 0);
}

#[test]
fn test_clean_on_create_collects_first() {
    let ts = TestStore::new();
    ts.fetcher.add_image("old", vec![app_layer()]);
    ts.fetcher.add_image("app", vec![base_layer()]);
    ts.store.create(&spec("old", "x")).unwrap();
    ts.store.delete("x").unwrap();
    assert_eq!(ts.volume_count(), 1);

    let store = ts.reopen(1);
    store
        .create(&CreateSpec {
            clean_on_create: true,
            ..spec("app", "y")
        })
        .unwrap();
    // the old layer went, the new one stayed
    assert_eq!(ts.volume_count(), 1);
    assert_eq!(
        ts.store.driver().volumes().unwrap(),
        store.bundle("y").unwrap().chain_ids
    );
}

#[test]
fn test_stats() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);
    ts.store.create(&spec("app", "x")).unwrap();

    let stats = ts.store.stats().unwrap();
    assert_eq!(stats.volumes, 2);
    assert_eq!(stats.images, 1);
    assert!(stats.cache_bytes > 0);
    assert!(stats.total_bytes > stats.cache_bytes);
}

#[test]
fn test_mapped_pulls_get_their_own_volumes() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);

    let plain = ts.store.create(&spec("app", "x")).unwrap();
    let mapped = ts.store.create(&mapped_spec("app", "y")).unwrap();
    assert_eq!(plain.namespace, None);
    assert!(mapped.namespace.is_some());
    assert_ne!(plain.chain_ids, mapped.chain_ids);
    assert_eq!(ts.volume_count(), 2);
    // the second unpack was served from the blob cache
    assert_eq!(ts.fetcher.streamed(&base_layer()), 1);

    let deps = ts.store.dependencies();
    assert_eq!(
        deps.dependencies(&ArtifactId::base_image("app")).unwrap(),
        plain.chain_ids
    );
    let namespaced = ArtifactId::namespaced_base_image("app", mapped.namespace.as_deref());
    assert_eq!(deps.dependencies(&namespaced).unwrap(), mapped.chain_ids);

    // the same mappings share volumes again
    let again = ts.store.create(&mapped_spec("app", "z")).unwrap();
    assert_eq!(again.chain_ids, mapped.chain_ids);
    assert_eq!(ts.volume_count(), 2);

    for id in ["x", "y", "z"] {
        ts.store.delete(id).unwrap();
    }
    // keeping the reference keeps it under every mapping
    ts.store.clean(0, &["app".to_string()], true).unwrap();
    assert_eq!(ts.volume_count(), 2);

    ts.store.clean(0, &[], true).unwrap();
    assert_eq!(ts.volume_count(), 0);
    assert!(ts.store.dependencies().artifacts().unwrap().is_empty());
}

#[test]
fn test_rootfs_ownership_follows_mapping() {
    if !geteuid().is_root() {
        eprintln!("skipping ownership checks: not running as root");
        return;
    }
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);

    let plain = ts.store.create(&spec("app", "x")).unwrap();
    for path in [plain.rootfs.clone(), plain.rootfs.join("etc/os-release")] {
        let metadata = fs::symlink_metadata(&path).unwrap();
        assert_eq!((metadata.uid(), metadata.gid()), (0, 0), "{}", path.display());
    }

    let mapped = ts.store.create(&mapped_spec("app", "y")).unwrap();
    for path in [
        mapped.rootfs.clone(),
        mapped.rootfs.join("etc/os-release"),
        mapped.rootfs.join("app/run"),
    ] {
        let metadata = fs::symlink_metadata(&path).unwrap();
        assert_eq!(
            (metadata.uid(), metadata.gid()),
            (100000, 100000),
            "{}",
            path.display()
        );
    }
}

#[test]
fn test_operations_are_timed() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer(), app_layer()]);

    ts.store.create(&spec("app", "x")).unwrap();
    assert_eq!(ts.metrics.count(IMAGE_CREATION_TIME), 1);
    assert_eq!(ts.metrics.count(UNPACK_TIME), 2);

    // failures are timed as well
    ts.store.create(&spec("app", "x")).unwrap_err();
    assert_eq!(ts.metrics.count(IMAGE_CREATION_TIME), 2);
    assert_eq!(ts.metrics.count(UNPACK_TIME), 2);

    ts.store.delete("x").unwrap();
    assert_eq!(ts.metrics.count(IMAGE_DELETION_TIME), 1);

    ts.store.clean(u64::MAX, &[], true).unwrap();
    ts.store.clean(0, &[], true).unwrap();
    assert_eq!(ts.metrics.count(IMAGE_CLEAN_TIME), 2);
}

#[test]
fn test_collect_sweeps_abandoned_downloads() {
    let ts = TestStore::new();
    ts.fetcher.add_image("app", vec![base_layer()]);
    let bundle = ts.store.create(&spec("app", "x")).unwrap();

    let cache_dir = ts.layout.cache_dir();
    let orphan = sha256_digest(b"no volume came from this");
    fs::write(cache_dir.join(&orphan["sha256:".len()..]), b"orphan").unwrap();
    let partial = cache_dir.join(format!(".partial-{}-a1b2c3", &orphan["sha256:".len()..]));
    fs::write(&partial, b"orph").unwrap();

    ts.store.clean(0, &[], true).unwrap();
    assert!(!partial.exists());
    assert!(!ts.cache.contains(&orphan).unwrap());
    // the blob behind the live bundle stays
    assert!(ts.cache.contains(&sha256_digest(base_layer())).unwrap());
    assert_eq!(ts.volume_count(), bundle.chain_ids.len());
}

#[test]
fn test_collect_removes_chain_lock_files() {
    let ts = TestStore::with_locksmith(|layout| Arc::new(FileLocksmith::new(layout.locks_dir())));
    ts.fetcher.add_image("app", vec![base_layer()]);
    let bundle = ts.store.create(&spec("app", "x")).unwrap();
    let chain_lock = ts
        .layout
        .locks_dir()
        .join(format!("{}.lock", layerstore::locksmith::chain_lock_key(&bundle.chain_ids[0])));
    assert!(chain_lock.exists());

    ts.store.delete("x").unwrap();
    ts.store.clean(0, &[], true).unwrap();
    assert!(!chain_lock.exists());
    assert!(ts.layout.locks_dir().join(format!("{GLOBAL_LOCK_KEY}.lock")).exists());
}
