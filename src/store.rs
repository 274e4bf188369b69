//! The store root and everything wired up inside it.
//!
//! ```text
//! <root>/
//! ├── images/               bundles, one directory per id
//! ├── volumes/              layer volumes, one per ChainID
//! ├── cache/                compressed blobs from remote sources
//! ├── locks/                flock()ed lock files
//! ├── meta/                 volume metadata
//! │   └── dependencies/     dependency records
//! └── tmp/                  staging for downloads and directory tars
//! ```

use std::{
    fmt, fs, io,
    os::unix::fs::{chown, PermissionsExt},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use log::debug;

use crate::{
    bundle::{Bundle, Bundler},
    cleaner::{CleanOutcome, Cleaner},
    creator::{CreateSpec, Creator},
    deleter::Deleter,
    dependency::{ArtifactId, DependencyManager},
    error::{IoContext, Result, StoreError},
    fetcher::{CacheDriver, Fetcher, FetcherSelector, LocalFetcher, RemoteFetcher, RemoteOptions},
    gc::{GarbageCollector, GcResult},
    locksmith::{FileLocksmith, Locksmith, GLOBAL_LOCK_KEY, LockGuard},
    measurer::StoreMeasurer,
    metrics::{LogEmitter, MetricsEmitter},
    puller::BaseImagePuller,
    volume::{
        quota::DEFAULT_QUOTA_HELPER, BtrfsDriver, CopyDriver, ProcessQuotaHelper, VolumeDriver,
    },
};

/// Paths inside a store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn dependencies_dir(&self) -> PathBuf {
        self.meta_dir().join("dependencies")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Every directory [`configure_store`] makes, parents first.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.images_dir(),
            self.volumes_dir(),
            self.cache_dir(),
            self.locks_dir(),
            self.meta_dir(),
            self.dependencies_dir(),
            self.tmp_dir(),
        ]
    }
}

fn ensure_not_file(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(metadata) if !metadata.is_dir() => Err(StoreError::invalid_input(format!(
            "path `{}` is not a directory",
            path.display()
        ))),
        _ => Ok(()),
    }
}

/// Create `path` if needed; returns whether we created it.
fn ensure_dir(path: &Path) -> Result<bool> {
    ensure_not_file(path)?;
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        // lost a race with another configurer, or already there
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(err) => Err(err).io_context(|| format!("making directory `{}`", path.display())),
    }
}

fn set_owner(path: &Path, owner: Option<(u32, u32)>) -> Result<()> {
    let Some((uid, gid)) = owner else {
        return Ok(());
    };
    chown(path, Some(uid), Some(gid))
        .io_context(|| format!("changing owner of {} to {uid}:{gid}", path.display()))
}

/// Create the store layout under `layout.root()`.
///
/// A root created here is owned by `owner` and closed to everyone else
/// (mode 0700); an existing root keeps its permissions. Every subdirectory is
/// handed to `owner`.
pub fn configure_store(layout: &StoreLayout, owner: Option<(u32, u32)>) -> Result<()> {
    let root = layout.root();
    debug!("configuring store at {}", root.display());

    if ensure_dir(root)? {
        set_owner(root, owner)?;
        fs::set_permissions(root, fs::Permissions::from_mode(0o700))
            .io_context(|| format!("changing permissions of {}", root.display()))?;
    }

    for dir in layout.required_dirs() {
        ensure_dir(&dir)?;
        set_owner(&dir, owner)?;
    }
    Ok(())
}

/// Which volume backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverKind {
    /// Plain directories and recursive copies; works anywhere.
    #[default]
    Copy,
    /// Btrfs subvolumes and snapshots.
    Btrfs,
}

impl FromStr for DriverKind {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "copy" => Ok(DriverKind::Copy),
            "btrfs" => Ok(DriverKind::Btrfs),
            other => Err(StoreError::invalid_input(format!(
                "unknown volume driver `{other}` (expected `copy` or `btrfs`)"
            ))),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverKind::Copy => "copy",
            DriverKind::Btrfs => "btrfs",
        })
    }
}

/// Resolved store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub driver: DriverKind,
    pub quota_helper_bin: PathBuf,
    pub btrfs_bin: Option<PathBuf>,
    /// UID and GID that own the store directories.
    pub owner: Option<(u32, u32)>,
    pub remote: RemoteOptions,
    /// Store size above which clean-on-create collects. Zero always collects.
    pub clean_threshold: u64,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            driver: DriverKind::default(),
            quota_helper_bin: DEFAULT_QUOTA_HELPER.into(),
            btrfs_bin: None,
            owner: None,
            remote: RemoteOptions::default(),
            clean_threshold: 0,
        }
    }
}

/// The collaborators a [`Store`] is built from.
pub struct Components {
    pub driver: Arc<dyn VolumeDriver>,
    pub fetcher: Arc<dyn Fetcher>,
    pub locksmith: Arc<dyn Locksmith>,
    /// The blob cache, if the fetcher goes through one.
    pub cache: Option<Arc<CacheDriver>>,
    pub clean_threshold: u64,
    /// Where operation durations go.
    pub metrics: Arc<dyn MetricsEmitter>,
}

/// Usage figures reported by [`Store::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_bytes: u64,
    pub cache_bytes: u64,
    pub volumes: usize,
    pub images: usize,
}

/// A configured store and its orchestrators.
pub struct Store {
    layout: StoreLayout,
    driver: Arc<dyn VolumeDriver>,
    locksmith: Arc<dyn Locksmith>,
    deps: DependencyManager,
    bundler: Arc<Bundler>,
    measurer: StoreMeasurer,
    gc: Arc<GarbageCollector>,
    cleaner: Arc<Cleaner>,
    creator: Creator,
    deleter: Deleter,
}

impl Store {
    /// Configure the store at `config.root` and wire up the production
    /// collaborators.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let layout = StoreLayout::new(&config.root);
        configure_store(&layout, config.owner)?;

        let quota = Arc::new(ProcessQuotaHelper::new(&config.quota_helper_bin));
        let driver: Arc<dyn VolumeDriver> = match config.driver {
            DriverKind::Copy => Arc::new(CopyDriver::new(layout.volumes_dir(), quota)),
            DriverKind::Btrfs => match &config.btrfs_bin {
                Some(bin) => Arc::new(BtrfsDriver::with_btrfs_bin(layout.volumes_dir(), bin, quota)),
                None => Arc::new(BtrfsDriver::new(layout.volumes_dir(), quota)),
            },
        };

        let remote = Arc::new(RemoteFetcher::new(layout.tmp_dir(), config.remote.clone()));
        let cache = Arc::new(CacheDriver::new(remote, layout.cache_dir()));
        let fetcher = Arc::new(FetcherSelector::new(
            Arc::new(LocalFetcher::new(layout.tmp_dir())),
            cache.clone(),
        ));

        Ok(Self::with_components(
            layout.clone(),
            Components {
                driver,
                fetcher,
                locksmith: Arc::new(FileLocksmith::new(layout.locks_dir())),
                cache: Some(cache),
                clean_threshold: config.clean_threshold,
                metrics: Arc::new(LogEmitter),
            },
        ))
    }

    /// Build a store from explicit collaborators. The layout must already
    /// be configured.
    pub fn with_components(layout: StoreLayout, components: Components) -> Self {
        let Components {
            driver,
            fetcher,
            locksmith,
            cache,
            clean_threshold,
            metrics,
        } = components;

        let deps = DependencyManager::new(layout.dependencies_dir());
        let bundler = Arc::new(Bundler::new(layout.images_dir(), driver.clone()));
        let measurer = StoreMeasurer::new(
            layout.volumes_dir(),
            layout.images_dir(),
            layout.cache_dir(),
        );
        let gc = Arc::new(GarbageCollector::new(
            driver.clone(),
            deps.clone(),
            cache,
            locksmith.clone(),
            layout.meta_dir(),
        ));
        let cleaner = Arc::new(Cleaner::new(
            locksmith.clone(),
            measurer.clone(),
            gc.clone(),
            metrics.clone(),
        ));
        let puller = Arc::new(BaseImagePuller::new(
            fetcher,
            driver.clone(),
            locksmith.clone(),
            metrics.clone(),
            layout.meta_dir(),
        ));
        let creator = Creator::new(
            locksmith.clone(),
            puller,
            bundler.clone(),
            deps.clone(),
            cleaner.clone(),
            clean_threshold,
            metrics.clone(),
        );
        let deleter = Deleter::new(locksmith.clone(), bundler.clone(), deps.clone(), metrics);

        Store {
            layout,
            driver,
            locksmith,
            deps,
            bundler,
            measurer,
            gc,
            cleaner,
            creator,
            deleter,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn driver(&self) -> &Arc<dyn VolumeDriver> {
        &self.driver
    }

    pub fn dependencies(&self) -> &DependencyManager {
        &self.deps
    }

    pub fn create(&self, spec: &CreateSpec) -> Result<Bundle> {
        self.creator.create(spec)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.deleter.delete(id)
    }

    /// See [`Cleaner::clean`]. `keep` names base image references.
    pub fn clean(
        &self,
        threshold: u64,
        keep: &[String],
        acquire_lock: bool,
    ) -> Result<CleanOutcome> {
        let keep: Vec<_> = keep.iter().map(ArtifactId::base_image).collect();
        self.cleaner.clean(threshold, &keep, acquire_lock)
    }

    /// What an unconditional clean would remove. Holds the global lock so the
    /// preview is consistent.
    pub fn clean_dry_run(&self, keep: &[String]) -> Result<GcResult> {
        let keep: Vec<_> = keep.iter().map(ArtifactId::base_image).collect();
        let guard = LockGuard::acquire(self.locksmith.as_ref(), GLOBAL_LOCK_KEY)?;
        let result = self.gc.dry_run(&keep)?;
        guard.release()?;
        Ok(result)
    }

    pub fn bundle(&self, id: &str) -> Result<Bundle> {
        self.bundler.load(id)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        self.bundler.ids()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            total_bytes: self.measurer.measure_store()?,
            cache_bytes: self.measurer.measure_cache()?,
            volumes: self.driver.volumes()?.len(),
            images: self.bundler.ids()?.len(),
        })
    }
}
