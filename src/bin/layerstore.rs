use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use layerstore::{
    cleaner::CleanOutcome,
    creator::CreateSpec,
    fetcher::RemoteOptions,
    idmap::parse_mappings,
    store::{DriverKind, Store, StoreConfig},
    volume::quota::DEFAULT_QUOTA_HELPER,
    ErrorKind, FetchErrorKind, StoreError,
};

/// layerstore
#[derive(Debug, Parser)]
#[clap(name = "layerstore", version)]
pub struct App {
    /// Root directory of the store
    #[clap(long, env = "LAYERSTORE_STORE", default_value = "/var/lib/layerstore")]
    store: PathBuf,
    /// Volume backend: `copy` or `btrfs`
    #[clap(long, env = "LAYERSTORE_DRIVER", default_value = "copy")]
    driver: DriverKind,
    /// Privileged helper used to apply disk quotas
    #[clap(long, env = "LAYERSTORE_QUOTA_HELPER_BIN", default_value = DEFAULT_QUOTA_HELPER)]
    quota_helper_bin: PathBuf,
    /// Path to the btrfs tool
    #[clap(long, env = "LAYERSTORE_BTRFS_BIN")]
    btrfs_bin: Option<PathBuf>,
    /// UID that owns the store directories
    #[clap(long, env = "LAYERSTORE_OWNER_UID", requires = "owner_gid")]
    owner_uid: Option<u32>,
    /// GID that owns the store directories
    #[clap(long, env = "LAYERSTORE_OWNER_GID", requires = "owner_uid")]
    owner_gid: Option<u32>,
    /// Registries (`host[:port]`) to use without TLS verification
    #[clap(long = "insecure-registry", env = "LAYERSTORE_INSECURE_REGISTRIES", value_delimiter = ',')]
    insecure_registries: Vec<String>,
    /// Registry credentials in containers-auth.json format
    #[clap(long, env = "LAYERSTORE_AUTHFILE")]
    authfile: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `layerstore=trace` (overrides RUST_LOG)
    #[clap(long, env = "LAYERSTORE_LOG_LEVEL")]
    log_level: Option<String>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates a root filesystem from a base image and prints its path
    Create {
        /// Local path (tarball or directory) or transport-prefixed reference
        base_image: String,
        id: String,
        /// <namespace id>:<host id>:<size>
        #[clap(long = "uid-mapping")]
        uid_mappings: Vec<String>,
        /// <namespace id>:<host id>:<size>
        #[clap(long = "gid-mapping")]
        gid_mappings: Vec<String>,
        /// Disk limit of the root filesystem; 0 for none
        #[clap(long, default_value_t = 0)]
        disk_limit_size_bytes: u64,
        /// Count only data written to the root filesystem against the limit
        #[clap(long)]
        exclude_image_from_quota: bool,
        /// Collect unused layers first if the store is over the threshold
        #[clap(long, overrides_with = "without_clean")]
        with_clean: bool,
        #[clap(long, overrides_with = "with_clean")]
        without_clean: bool,
        #[clap(long, env = "LAYERSTORE_CLEAN_THRESHOLD_BYTES", default_value_t = 0)]
        clean_threshold_bytes: u64,
        /// Print the bundle description as JSON
        #[clap(long)]
        json: bool,
    },
    /// Deletes a root filesystem
    Delete { id: String },
    /// Removes layers no root filesystem or kept base image needs
    Clean {
        /// Only clean if the store is larger than this; 0 always cleans
        #[clap(long, default_value_t = 0)]
        threshold_bytes: u64,
        /// Base image whose layers to keep
        #[clap(long = "ignore-image")]
        ignore_images: Vec<String>,
        /// Do not take the store lock (the caller holds it)
        #[clap(long)]
        no_lock: bool,
        /// Only report what would be removed
        #[clap(long, conflicts_with_all = ["no_lock", "threshold_bytes"])]
        dry_run: bool,
    },
    /// Prints store usage
    Stats,
    /// Lists root filesystem ids
    List,
}

impl App {
    fn config(&self, clean_threshold: u64) -> StoreConfig {
        StoreConfig {
            root: self.store.clone(),
            driver: self.driver,
            quota_helper_bin: self.quota_helper_bin.clone(),
            btrfs_bin: self.btrfs_bin.clone(),
            owner: self.owner_uid.zip(self.owner_gid),
            remote: RemoteOptions {
                insecure_registries: self.insecure_registries.clone(),
                authfile: self.authfile.clone(),
            },
            clean_threshold,
        }
    }
}

/// A message an operator can act on.
fn humanize(err: &StoreError) -> String {
    match err {
        StoreError::Fetch {
            kind, reference, ..
        } => match kind {
            FetchErrorKind::NotFound => format!("image `{reference}` does not exist: {err}"),
            FetchErrorKind::Unauthorized => {
                format!("not authorized to fetch `{reference}`; check the registry credentials: {err}")
            }
            FetchErrorKind::InsecureRegistry => format!(
                "the registry of `{reference}` is insecure; pass --insecure-registry to allow it: {err}"
            ),
            FetchErrorKind::Other => err.to_string(),
        },
        _ => match err.kind() {
            ErrorKind::DiskFull => format!("out of disk space: {err}"),
            ErrorKind::PermissionDenied => format!("permission denied: {err}"),
            _ => err.to_string(),
        },
    }
}

/// The message and exit code for a failed command: the context chain, with
/// the store error at its end replaced by its operator hint.
fn report(err: &anyhow::Error) -> (String, u8) {
    let Some(store_err) = err.downcast_ref::<StoreError>() else {
        return (format!("{err:#}"), 1);
    };
    let mut parts: Vec<String> = err
        .chain()
        .take_while(|cause| !cause.is::<StoreError>())
        .map(ToString::to_string)
        .collect();
    parts.push(humanize(store_err));
    (parts.join(": "), exit_code(store_err.kind()))
}

fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidInput => 2,
        ErrorKind::NotFound | ErrorKind::Fetch(FetchErrorKind::NotFound) => 3,
        ErrorKind::AlreadyExists => 4,
        ErrorKind::Fetch(_) => 5,
        ErrorKind::Integrity => 6,
        ErrorKind::DiskFull | ErrorKind::Quota => 7,
        _ => 1,
    }
}

fn run(args: App) -> Result<()> {
    match args.cmd {
        Command::Create {
            ref base_image,
            ref id,
            ref uid_mappings,
            ref gid_mappings,
            disk_limit_size_bytes,
            exclude_image_from_quota,
            with_clean,
            without_clean: _,
            clean_threshold_bytes,
            json,
        } => {
            let spec = CreateSpec {
                id: id.clone(),
                base_image: base_image.clone(),
                uid_mappings: parse_mappings(uid_mappings).context("parsing uid mappings")?,
                gid_mappings: parse_mappings(gid_mappings).context("parsing gid mappings")?,
                disk_limit: disk_limit_size_bytes,
                exclude_base_image_from_quota: exclude_image_from_quota,
                clean_on_create: with_clean,
            };
            let store = Store::open(&args.config(clean_threshold_bytes))?;
            let bundle = store.create(&spec)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&bundle)?);
            } else {
                println!("{}", bundle.path.display());
            }
        }
        Command::Delete { ref id } => {
            let store = Store::open(&args.config(0))?;
            store.delete(id)?;
            println!("image {id} deleted");
        }
        Command::Clean {
            threshold_bytes,
            ref ignore_images,
            no_lock,
            dry_run,
        } => {
            let store = Store::open(&args.config(0))?;
            if dry_run {
                let result = store.clean_dry_run(ignore_images)?;
                println!(
                    "would remove {} volume(s), {} bytes, {} cached blob(s)",
                    result.volumes_removed.len(),
                    result.volumes_bytes,
                    result.blobs_removed + result.partials_removed
                );
                for chain_id in &result.volumes_removed {
                    println!("  {chain_id}");
                }
                return Ok(());
            }
            match store.clean(threshold_bytes, ignore_images, !no_lock)? {
                CleanOutcome::Noop { usage } => {
                    println!("threshold not reached ({usage} bytes used): skipping clean");
                }
                CleanOutcome::Collected(result) => println!(
                    "removed {} volume(s), {} bytes, {} cached blob(s)",
                    result.volumes_removed.len(),
                    result.volumes_bytes,
                    result.blobs_removed + result.partials_removed
                ),
            }
        }
        Command::Stats => {
            let stats = Store::open(&args.config(0))?.stats()?;
            println!("total bytes: {}", stats.total_bytes);
            println!("cache bytes: {}", stats.cache_bytes);
            println!("volumes: {}", stats.volumes);
            println!("images: {}", stats.images);
        }
        Command::List => {
            for id in Store::open(&args.config(0))?.ids()? {
                println!("{id}");
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = App::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(filters) = &args.log_level {
        logger.parse_filters(filters);
    }
    logger.init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let (message, code) = report(&err);
            eprintln!("{message}");
            ExitCode::from(code)
        }
    }
}
