//! Reference image acquisition and caching.
//!
//! A reference image is a versioned build of the dstack guest firmware/OS
//! whose `metadata.json` records the measurement values a correctly-launched
//! CVM must present. Images are cached on disk under
//! `<cache_root>/<folder_name>/`; the presence of `metadata.json` is the sole
//! readiness marker. A missing image is downloaded once, extracted into a
//! scratch directory and atomically renamed into place, so the cache never
//! holds a partially-populated entry.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::VerificationError;

/// Hardware variant of a reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVariant {
    Standard,
    Nvidia,
}

/// Release channel of a reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChannel {
    Release,
    Dev,
}

/// Parsed identity of a reference image.
///
/// Produced only by the strict parser: there is no fallback shape and no
/// default variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    pub variant: ImageVariant,
    pub channel: ReleaseChannel,
    pub version: String,
}

impl ImageName {
    /// Parse a cache folder name.
    ///
    /// Exactly four prefixes are recognized, longest first:
    /// `dstack-nvidia-dev-`, `dstack-nvidia-`, `dstack-dev-`, `dstack-`.
    /// Anything else, including an empty version suffix, is
    /// [`VerificationError::MalformedImageName`].
    pub fn parse(folder_name: &str) -> Result<Self, VerificationError> {
        const PATTERNS: &[(&str, ImageVariant, ReleaseChannel)] = &[
            ("dstack-nvidia-dev-", ImageVariant::Nvidia, ReleaseChannel::Dev),
            ("dstack-nvidia-", ImageVariant::Nvidia, ReleaseChannel::Release),
            ("dstack-dev-", ImageVariant::Standard, ReleaseChannel::Dev),
            ("dstack-", ImageVariant::Standard, ReleaseChannel::Release),
        ];
        for (prefix, variant, channel) in PATTERNS {
            if let Some(version) = folder_name.strip_prefix(prefix) {
                if version.is_empty() {
                    break;
                }
                return Ok(Self {
                    variant: *variant,
                    channel: *channel,
                    version: version.to_string(),
                });
            }
        }
        Err(VerificationError::MalformedImageName(
            folder_name.to_string(),
        ))
    }

    /// Folder name under the cache root.
    pub fn folder_name(&self) -> String {
        let prefix = match (self.variant, self.channel) {
            (ImageVariant::Nvidia, ReleaseChannel::Dev) => "dstack-nvidia-dev-",
            (ImageVariant::Nvidia, ReleaseChannel::Release) => "dstack-nvidia-",
            (ImageVariant::Standard, ReleaseChannel::Dev) => "dstack-dev-",
            (ImageVariant::Standard, ReleaseChannel::Release) => "dstack-",
        };
        format!("{prefix}{}", self.version)
    }

    /// Deterministic download URL for this image.
    pub fn download_url(&self, base_url: &str) -> String {
        format!(
            "{}/v{}/{}.tar.gz",
            base_url.trim_end_matches('/'),
            self.version,
            self.folder_name()
        )
    }
}

/// Expected measurements and provenance recorded in an image's
/// `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Expected MRTD (hex). Set at VM launch, compared directly against the
    /// quote rather than replayed.
    pub mrtd: String,
    /// Expected boot-chain registers (hex), when the build pins them.
    #[serde(default)]
    pub rtmr0: Option<String>,
    #[serde(default)]
    pub rtmr1: Option<String>,
    #[serde(default)]
    pub rtmr2: Option<String>,
    /// SHA-256 of the rootfs image (hex).
    #[serde(default)]
    pub os_image_hash: Option<String>,
    /// Versions of the tools that produced the build.
    #[serde(default)]
    pub tool_versions: BTreeMap<String, String>,
}

/// A usable cache entry: extracted artifacts plus parsed metadata.
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub path: PathBuf,
    pub metadata: ImageMetadata,
}

/// Capability for fetching an image archive.
///
/// The production implementation is [`HttpFetcher`]; tests substitute a
/// fixture that serves canned archives and counts invocations.
pub trait FetchImage: Send + Sync {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, VerificationError>> + Send;
}

/// HTTP(S) fetcher backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl FetchImage for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, VerificationError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| VerificationError::FetchFailed(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| VerificationError::FetchFailed(format!("GET {url}: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VerificationError::FetchFailed(format!("reading {url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// On-disk store of reference images, shared between verification jobs.
///
/// Extraction for a given folder name is serialized through a per-key async
/// mutex, so concurrent jobs needing the same image trigger exactly one
/// download and never race on the cache entry.
pub struct ImageStore<F> {
    cache_root: PathBuf,
    base_url: String,
    fetcher: F,
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<F: FetchImage> ImageStore<F> {
    pub fn new(cache_root: impl Into<PathBuf>, base_url: impl Into<String>, fetcher: F) -> Self {
        Self {
            cache_root: cache_root.into(),
            base_url: base_url.into(),
            fetcher,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, folder_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(folder_name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ensure the named image is present and usable, downloading it if
    /// necessary. Idempotent: a warm cache entry is returned without any
    /// network access.
    pub async fn ensure_image(&self, folder_name: &str) -> Result<CachedImage, VerificationError> {
        let name = ImageName::parse(folder_name)?;

        let lock = self.key_lock(folder_name);
        let _guard = lock.lock().await;

        let dir = self.cache_root.join(folder_name);
        if let Some(image) = load_cached(&dir)? {
            debug!("image {folder_name} served from cache");
            return Ok(image);
        }

        let url = name.download_url(&self.base_url);
        info!("fetching image {folder_name} from {url}");
        let archive = self.fetcher.fetch(&url).await?;

        let scratch = self.cache_root.join(format!(".{folder_name}.partial"));
        let result = extract_and_promote(archive, scratch.clone(), dir.clone()).await;
        if result.is_err() {
            // Leave no partially-populated entry behind.
            let _ = std::fs::remove_dir_all(&scratch);
        }
        result?;

        load_cached(&dir)?.ok_or_else(|| {
            VerificationError::FetchFailed(format!("{folder_name}: cache entry vanished"))
        })
    }
}

fn load_cached(dir: &Path) -> Result<Option<CachedImage>, VerificationError> {
    let manifest = dir.join("metadata.json");
    if !manifest.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&manifest)
        .map_err(|e| VerificationError::FetchFailed(format!("reading {manifest:?}: {e}")))?;
    let metadata: ImageMetadata = serde_json::from_slice(&bytes)
        .map_err(|e| VerificationError::FetchFailed(format!("parsing {manifest:?}: {e}")))?;
    Ok(Some(CachedImage {
        path: dir.to_path_buf(),
        metadata,
    }))
}

async fn extract_and_promote(
    archive: Vec<u8>,
    scratch: PathBuf,
    dir: PathBuf,
) -> Result<(), VerificationError> {
    tokio::task::spawn_blocking(move || {
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)
                .map_err(|e| VerificationError::FetchFailed(format!("clearing scratch: {e}")))?;
        }
        std::fs::create_dir_all(&scratch)
            .map_err(|e| VerificationError::FetchFailed(format!("creating scratch: {e}")))?;

        let decoder = flate2::read::GzDecoder::new(&archive[..]);
        tar::Archive::new(decoder)
            .unpack(&scratch)
            .map_err(|e| VerificationError::FetchFailed(format!("extracting archive: {e}")))?;

        // The manifest must exist before the entry is promoted.
        if !scratch.join("metadata.json").exists() {
            return Err(VerificationError::FetchFailed(
                "archive has no metadata.json".into(),
            ));
        }

        std::fs::rename(&scratch, &dir)
            .map_err(|e| VerificationError::FetchFailed(format!("promoting cache entry: {e}")))
    })
    .await
    .map_err(|e| VerificationError::FetchFailed(format!("extraction task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recognizes_all_four_shapes() {
        let name = ImageName::parse("dstack-0.5.3").unwrap();
        assert_eq!(name.variant, ImageVariant::Standard);
        assert_eq!(name.channel, ReleaseChannel::Release);
        assert_eq!(name.version, "0.5.3");

        let name = ImageName::parse("dstack-dev-0.5.3").unwrap();
        assert_eq!(name.variant, ImageVariant::Standard);
        assert_eq!(name.channel, ReleaseChannel::Dev);

        let name = ImageName::parse("dstack-nvidia-0.5.3").unwrap();
        assert_eq!(name.variant, ImageVariant::Nvidia);
        assert_eq!(name.channel, ReleaseChannel::Release);

        let name = ImageName::parse("dstack-nvidia-dev-0.5.3").unwrap();
        assert_eq!(name.variant, ImageVariant::Nvidia);
        assert_eq!(name.channel, ReleaseChannel::Dev);
    }

    #[test]
    fn test_parse_rejects_other_shapes() {
        for bad in ["", "dstack", "dstack-", "dstack-dev-", "ubuntu-24.04", "DSTACK-0.5.3"] {
            assert!(
                matches!(
                    ImageName::parse(bad),
                    Err(VerificationError::MalformedImageName(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_folder_name_roundtrip() {
        for folder in [
            "dstack-0.5.3",
            "dstack-dev-0.5.3",
            "dstack-nvidia-0.5.4.1",
            "dstack-nvidia-dev-0.5.4.1",
        ] {
            assert_eq!(ImageName::parse(folder).unwrap().folder_name(), folder);
        }
    }

    #[test]
    fn test_download_url_is_version_derived() {
        let name = ImageName::parse("dstack-nvidia-0.5.4.1").unwrap();
        assert_eq!(
            name.download_url("https://images.example.com/releases/"),
            "https://images.example.com/releases/v0.5.4.1/dstack-nvidia-0.5.4.1.tar.gz"
        );
    }

    #[test]
    fn test_metadata_parses_with_optional_fields_missing() {
        let metadata: ImageMetadata =
            serde_json::from_str(r#"{"mrtd": "b24d3b24"}"#).unwrap();
        assert_eq!(metadata.mrtd, "b24d3b24");
        assert!(metadata.rtmr0.is_none());
        assert!(metadata.tool_versions.is_empty());
    }
}
