//! Base images from registries and other image transports, via skopeo.
//!
//! The containers image proxy speaks every transport skopeo knows
//! (`docker://`, `oci:`, `containers-storage:`, …) and handles TLS and
//! registry authentication for us. It is asynchronous; each fetcher call
//! drives it on a short-lived tokio runtime so the rest of the store stays
//! synchronous.
//!
//! An image is opened once, when its layers are listed, and stays open with
//! its manifest until [`Fetcher::close`]; every blob of the pull goes through
//! the same proxy session. Blobs are downloaded in full into an anonymous file
//! in the store's temp directory before being handed back, so the consumer
//! reads at its own pace.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    io::{Seek, SeekFrom},
    iter::zip,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use containers_image_proxy::{ImageProxy, ImageProxyConfig, OpenedImage};
use log::debug;
use oci_spec::image::{Descriptor, ImageConfiguration, ImageManifest};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    runtime::Runtime,
};

use super::{BaseImageInfo, BlobStream, Fetcher, LayerInfo};
use crate::error::{FetchErrorKind, IoContext, Result, StoreError};

/// Settings passed through to the image proxy.
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Registries (`host[:port]`) to reach without TLS verification.
    pub insecure_registries: Vec<String>,
    /// Registry credentials in containers-auth.json format.
    pub authfile: Option<PathBuf>,
}

pub struct RemoteFetcher {
    tmp_dir: PathBuf,
    options: RemoteOptions,
    /// Built on first use and dropped once the last session is closed; the
    /// proxies of open sessions are bound to it.
    runtime: Mutex<Option<Runtime>>,
    sessions: Mutex<HashMap<String, Session>>,
}

/// An image opened through the proxy.
struct Session {
    proxy: ImageProxy,
    img: OpenedImage,
    manifest: ImageManifest,
}

/// Sort a proxy error into the kinds callers can act on.
fn classify(reference: &str, err: impl fmt::Display) -> StoreError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    let kind = if ["unauthorized", "authentication required", "denied"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FetchErrorKind::Unauthorized
    } else if ["http response to https client", "x509", "certificate"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FetchErrorKind::InsecureRegistry
    } else if ["manifest unknown", "blob unknown", "name unknown", "not found"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        FetchErrorKind::NotFound
    } else {
        FetchErrorKind::Other
    };
    StoreError::fetch(kind, reference, message)
}

/// The registry host of a `docker://` reference.
fn registry_host(reference: &str) -> Option<&str> {
    let rest = reference.strip_prefix("docker://")?.trim_start_matches('/');
    let host = rest.split('/').next()?;
    // `docker://busybox` has no host part
    (rest.contains('/') && (host.contains('.') || host.contains(':') || host == "localhost"))
        .then_some(host)
}

impl RemoteFetcher {
    /// Blobs are staged in `tmp_dir`.
    pub fn new(tmp_dir: impl AsRef<Path>, options: RemoteOptions) -> Self {
        RemoteFetcher {
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
            options,
            runtime: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Drive `future` on the proxy runtime. Calls are serialized.
    fn block_on<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        let mut slot = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let runtime = match &mut *slot {
            Some(runtime) => runtime,
            empty => empty.insert(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .io_context(|| "starting image proxy runtime")?,
            ),
        };
        runtime.block_on(future)
    }

    fn take_session(&self, reference: &str) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference)
    }

    fn keep_session(&self, reference: &str, session: Session) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.to_string(), session);
    }

    /// The open session for `reference`, or a new one. Must run on the
    /// proxy runtime.
    async fn session(&self, reference: &str) -> Result<Session> {
        if let Some(session) = self.take_session(reference) {
            return Ok(session);
        }
        let (proxy, img) = self.open(reference).await?;
        let manifest = Self::manifest(&proxy, &img, reference).await?;
        Ok(Session {
            proxy,
            img,
            manifest,
        })
    }

    fn proxy_config(&self, reference: &str) -> ImageProxyConfig {
        let mut config = ImageProxyConfig::default();
        config.authfile = self.options.authfile.clone();
        if registry_host(reference).is_some_and(|host| {
            self.options
                .insecure_registries
                .iter()
                .any(|insecure| insecure == host)
        }) {
            config.insecure_skip_tls_verification = Some(true);
        }
        config
    }

    async fn open(&self, reference: &str) -> Result<(ImageProxy, OpenedImage)> {
        let proxy = ImageProxy::new_with_config(self.proxy_config(reference))
            .await
            .map_err(|err| classify(reference, err))?;
        let img = proxy
            .open_image(reference)
            .await
            .map_err(|err| classify(reference, err))?;
        Ok((proxy, img))
    }

    async fn manifest(
        proxy: &ImageProxy,
        img: &OpenedImage,
        reference: &str,
    ) -> Result<ImageManifest> {
        let (digest, raw_manifest) = proxy
            .fetch_manifest_raw_oci(img)
            .await
            .map_err(|err| classify(reference, err))?;
        debug!("{reference} resolved to manifest {digest}");
        ImageManifest::from_reader(raw_manifest.as_slice())
            .map_err(|err| StoreError::fetch(FetchErrorKind::Other, reference, err))
    }

    async fn config(
        proxy: &ImageProxy,
        img: &OpenedImage,
        descriptor: &Descriptor,
        reference: &str,
    ) -> Result<ImageConfiguration> {
        let (mut config, driver) = proxy
            .get_descriptor(img, descriptor)
            .await
            .map_err(|err| classify(reference, err))?;
        let config = async move {
            let mut s = Vec::new();
            config.read_to_end(&mut s).await?;
            std::io::Result::Ok(s)
        };
        let (config, driver) = tokio::join!(config, driver);
        driver.map_err(|err| classify(reference, err))?;
        let raw_config = config.io_context(|| format!("reading config of {reference}"))?;
        ImageConfiguration::from_reader(&raw_config[..])
            .map_err(|err| StoreError::fetch(FetchErrorKind::Other, reference, err))
    }

    async fn close_proxy(proxy: ImageProxy, img: OpenedImage, reference: &str) -> Result<()> {
        proxy
            .close_image(&img)
            .await
            .map_err(|err| classify(reference, err))?;
        proxy
            .finalize()
            .await
            .map_err(|err| classify(reference, err))
    }
}

impl Fetcher for RemoteFetcher {
    fn base_image_info(&self, reference: &str) -> Result<BaseImageInfo> {
        self.block_on(async {
            let session = self.session(reference).await?;
            let layers = Self::layers(&session, reference).await;
            self.keep_session(reference, session);
            Ok(BaseImageInfo { layers: layers? })
        })
    }

    fn stream_blob(&self, reference: &str, layer: &LayerInfo) -> Result<BlobStream> {
        let context = || format!("downloading {} of {reference}", layer.blob_digest);
        let mut file = tempfile::tempfile_in(&self.tmp_dir).io_context(context)?;
        let staging = file.try_clone().io_context(context)?;

        let size = self.block_on(async {
            let mut target = tokio::fs::File::from_std(staging);
            let session = self.session(reference).await?;
            let copied = Self::download(&session, reference, layer, &mut target).await;
            self.keep_session(reference, session);
            copied
        })?;

        file.seek(SeekFrom::Start(0)).io_context(context)?;
        debug!("downloaded {} ({size} bytes)", layer.blob_digest);
        Ok((Box::new(file), size))
    }

    fn close(&self, reference: &str) -> Result<()> {
        let Some(session) = self.take_session(reference) else {
            return Ok(());
        };
        debug!("closing {reference}");
        let result = self.block_on(Self::close_proxy(session.proxy, session.img, reference));

        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            *runtime = None;
        }
        result
    }
}

impl RemoteFetcher {
    async fn layers(session: &Session, reference: &str) -> Result<Vec<LayerInfo>> {
        let manifest = &session.manifest;
        let config = Self::config(&session.proxy, &session.img, manifest.config(), reference).await?;

        let diff_ids = config.rootfs().diff_ids();
        if diff_ids.len() != manifest.layers().len() {
            return Err(StoreError::fetch(
                FetchErrorKind::Other,
                reference,
                format!(
                    "manifest lists {} layers but config lists {} diff IDs",
                    manifest.layers().len(),
                    diff_ids.len()
                ),
            ));
        }

        Ok(zip(manifest.layers(), diff_ids)
            .map(|(descriptor, diff_id)| {
                let blob_digest: &str = descriptor.digest().as_ref();
                LayerInfo {
                    blob_digest: blob_digest.to_string(),
                    diff_id: diff_id.clone(),
                    size: descriptor.size(),
                    verify: true,
                }
            })
            .collect())
    }

    async fn download(
        session: &Session,
        reference: &str,
        layer: &LayerInfo,
        target: &mut tokio::fs::File,
    ) -> Result<u64> {
        let Some(descriptor) = session.manifest.layers().iter().find(|descriptor| {
            let digest: &str = descriptor.digest().as_ref();
            digest == layer.blob_digest
        }) else {
            return Err(StoreError::fetch(
                FetchErrorKind::NotFound,
                reference,
                format!("no layer {} in manifest", layer.blob_digest),
            ));
        };

        let (blob_reader, driver) = session
            .proxy
            .get_descriptor(&session.img, descriptor)
            .await
            .map_err(|err| classify(reference, err))?;
        // See https://github.com/containers/containers-image-proxy-rs/issues/71
        let mut blob_reader = blob_reader.take(descriptor.size());
        let copy = async {
            let copied = tokio::io::copy(&mut blob_reader, &mut *target).await?;
            target.flush().await?;
            std::io::Result::Ok(copied)
        };
        let (copied, driver) = tokio::join!(copy, driver);
        driver.map_err(|err| classify(reference, err))?;
        copied.io_context(|| format!("downloading {} of {reference}", layer.blob_digest))
    }
}
