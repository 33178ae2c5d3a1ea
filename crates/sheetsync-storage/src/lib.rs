//! Artifact download + fingerprinted local copy for sheetsync.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sheetsync-storage";

const TEMP_SUFFIX: &str = "tmp";
const SIDECAR_SUFFIX: &str = "sha256";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Where artifact bytes come from. Implementations write the whole payload into `dest`.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    fn describe(&self) -> String;

    /// Streams the artifact into `dest` and returns the number of bytes written.
    async fn download_to(&self, dest: &mut fs::File, dest_path: &Path) -> Result<u64, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Unauthenticated GET against a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpArtifactSource {
    client: reqwest::Client,
    url: String,
}

impl HttpArtifactSource {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn download_to(&self, dest: &mut fs::File, dest_path: &Path) -> Result<u64, FetchError> {
        let mut resp = self.client.get(&self.url).send().await?;
        let status: StatusCode = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            dest.write_all(&chunk)
                .await
                .map_err(|e| FetchError::io(dest_path, e))?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The artifact was replaced and the sidecar now holds `fingerprint`.
    Changed { fingerprint: String, byte_size: u64 },
    /// Downloaded bytes hash to the already accepted fingerprint; nothing was rewritten.
    Unchanged { fingerprint: String },
}

impl FetchOutcome {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Changed { fingerprint, .. } | Self::Unchanged { fingerprint } => fingerprint,
        }
    }
}

/// The locally accepted artifact plus its fingerprint sidecar.
///
/// Paths: `<path>` for the artifact, `<path>.sha256` for the hex digest and
/// `<path>.tmp` for an in-flight download. The artifact is only ever replaced
/// by renaming a fully written temp file over it.
#[derive(Debug, Clone)]
pub struct LocalArtifact {
    path: PathBuf,
}

impl LocalArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sidecar_path(&self) -> PathBuf {
        with_suffix(&self.path, SIDECAR_SUFFIX)
    }

    pub fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, TEMP_SUFFIX)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Fingerprint of the last accepted artifact, if one was ever recorded.
    pub async fn load_fingerprint(&self) -> Option<String> {
        let sidecar = self.sidecar_path();
        match fs::read_to_string(&sidecar).await {
            Ok(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %sidecar.display(), error = %err, "unreadable fingerprint sidecar");
                None
            }
        }
    }

    /// Downloads from `source` and swaps the result into place only when its digest changed.
    ///
    /// On any error the accepted artifact and sidecar are left as they were and the
    /// temp file is removed. Once the artifact has been replaced the call reports
    /// `Changed` even if the sidecar could not be written; the next refresh then
    /// counts as a change again.
    pub async fn refresh_from(
        &self,
        source: &dyn ArtifactSource,
    ) -> Result<FetchOutcome, FetchError> {
        let span = info_span!(
            "artifact_fetch",
            source = %source.describe(),
            path = %self.path.display()
        );
        async move {
            let temp_path = self.temp_path();
            let result = self.refresh_inner(source, &temp_path).await;
            if result.is_err() {
                let _ = fs::remove_file(&temp_path).await;
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn refresh_inner(
        &self,
        source: &dyn ArtifactSource,
        temp_path: &Path,
    ) -> Result<FetchOutcome, FetchError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::io(parent, e))?;
        }

        info!("downloading artifact");
        let mut file = fs::File::create(temp_path)
            .await
            .map_err(|e| FetchError::io(temp_path, e))?;
        let byte_size = source.download_to(&mut file, temp_path).await?;
        file.flush().await.map_err(|e| FetchError::io(temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| FetchError::io(temp_path, e))?;
        drop(file);

        let fingerprint = hash_file(temp_path).await?;
        // a sidecar without its artifact describes nothing on disk
        let previous = if self.exists().await {
            self.load_fingerprint().await
        } else {
            None
        };

        if previous.as_deref() == Some(fingerprint.as_str()) {
            info!(%fingerprint, "artifact unchanged");
            fs::remove_file(temp_path)
                .await
                .map_err(|e| FetchError::io(temp_path, e))?;
            return Ok(FetchOutcome::Unchanged { fingerprint });
        }

        // rename replaces the destination in one step, so readers see old or new bytes, never a mix
        fs::rename(temp_path, &self.path)
            .await
            .map_err(|e| FetchError::io(&self.path, e))?;
        if let Err(err) = self.store_fingerprint(&fingerprint).await {
            warn!(error = %err, "artifact replaced but fingerprint not persisted");
        }

        info!(%fingerprint, byte_size, previous = ?previous, "new artifact accepted");
        Ok(FetchOutcome::Changed {
            fingerprint,
            byte_size,
        })
    }

    async fn store_fingerprint(&self, fingerprint: &str) -> Result<(), FetchError> {
        let sidecar = self.sidecar_path();
        let staged = with_suffix(&sidecar, TEMP_SUFFIX);
        fs::write(&staged, fingerprint)
            .await
            .map_err(|e| FetchError::io(&staged, e))?;
        if let Err(err) = fs::rename(&staged, &sidecar).await {
            let _ = fs::remove_file(&staged).await;
            return Err(FetchError::io(&sidecar, err));
        }
        debug!(path = %sidecar.display(), "fingerprint persisted");
        Ok(())
    }
}

async fn hash_file(path: &Path) -> Result<String, FetchError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| FetchError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MemorySource {
        body: Mutex<Vec<u8>>,
    }

    impl MemorySource {
        fn new(body: &[u8]) -> Self {
            Self {
                body: Mutex::new(body.to_vec()),
            }
        }

        fn set(&self, body: &[u8]) {
            *self.body.lock().unwrap() = body.to_vec();
        }
    }

    #[async_trait]
    impl ArtifactSource for MemorySource {
        fn describe(&self) -> String {
            "memory".into()
        }

        async fn download_to(
            &self,
            dest: &mut fs::File,
            dest_path: &Path,
        ) -> Result<u64, FetchError> {
            let body = self.body.lock().unwrap().clone();
            dest.write_all(&body)
                .await
                .map_err(|e| FetchError::io(dest_path, e))?;
            Ok(body.len() as u64)
        }
    }

    /// Writes half the payload, then fails like a dropped connection.
    struct TruncatingSource;

    #[async_trait]
    impl ArtifactSource for TruncatingSource {
        fn describe(&self) -> String {
            "truncating".into()
        }

        async fn download_to(
            &self,
            dest: &mut fs::File,
            dest_path: &Path,
        ) -> Result<u64, FetchError> {
            dest.write_all(b"PK\x03\x04partial")
                .await
                .map_err(|e| FetchError::io(dest_path, e))?;
            Err(FetchError::io(
                dest_path,
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
            ))
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = LocalArtifact::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn sidecar_and_temp_sit_next_to_artifact() {
        let artifact = LocalArtifact::new("/data/catalog.xlsx");
        assert_eq!(artifact.sidecar_path(), PathBuf::from("/data/catalog.xlsx.sha256"));
        assert_eq!(artifact.temp_path(), PathBuf::from("/data/catalog.xlsx.tmp"));
    }

    #[tokio::test]
    async fn first_download_is_always_a_change() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("nested").join("catalog.xlsx"));
        let source = MemorySource::new(b"v1");

        let outcome = artifact.refresh_from(&source).await.expect("refresh");

        assert!(outcome.is_changed());
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"v1");
        assert_eq!(
            artifact.load_fingerprint().await.as_deref(),
            Some(LocalArtifact::sha256_hex(b"v1").as_str())
        );
        assert!(!artifact.temp_path().exists());
    }

    #[tokio::test]
    async fn identical_bytes_skip_rewrite() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        let source = MemorySource::new(b"same bytes");
        artifact.refresh_from(&source).await.expect("first");

        let artifact_mtime = std::fs::metadata(artifact.path()).unwrap().modified().unwrap();
        let sidecar_mtime = std::fs::metadata(artifact.sidecar_path())
            .unwrap()
            .modified()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = artifact.refresh_from(&source).await.expect("second");

        assert_eq!(
            outcome,
            FetchOutcome::Unchanged {
                fingerprint: LocalArtifact::sha256_hex(b"same bytes")
            }
        );
        assert_eq!(
            std::fs::metadata(artifact.path()).unwrap().modified().unwrap(),
            artifact_mtime
        );
        assert_eq!(
            std::fs::metadata(artifact.sidecar_path())
                .unwrap()
                .modified()
                .unwrap(),
            sidecar_mtime
        );
        assert!(!artifact.temp_path().exists());
    }

    #[tokio::test]
    async fn changed_bytes_replace_artifact_and_fingerprint() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        let source = MemorySource::new(b"v1");
        artifact.refresh_from(&source).await.expect("first");

        source.set(b"v2");
        let outcome = artifact.refresh_from(&source).await.expect("second");

        assert_eq!(
            outcome,
            FetchOutcome::Changed {
                fingerprint: LocalArtifact::sha256_hex(b"v2"),
                byte_size: 2
            }
        );
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn fingerprint_survives_a_new_handle() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.xlsx");
        let source = MemorySource::new(b"persisted");
        LocalArtifact::new(&path).refresh_from(&source).await.expect("first");

        let restarted = LocalArtifact::new(&path);
        let outcome = restarted.refresh_from(&source).await.expect("after restart");
        assert!(!outcome.is_changed());
    }

    #[tokio::test]
    async fn deleted_artifact_is_restored_despite_matching_sidecar() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        let source = MemorySource::new(b"catalog");
        artifact.refresh_from(&source).await.expect("first");

        std::fs::remove_file(artifact.path()).unwrap();
        let outcome = artifact.refresh_from(&source).await.expect("second");

        assert!(outcome.is_changed());
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"catalog");
        assert_eq!(
            artifact.load_fingerprint().await.as_deref(),
            Some(outcome.fingerprint())
        );
    }

    #[tokio::test]
    async fn failed_rename_keeps_previous_fingerprint() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        // a non-empty directory in the artifact's place makes the final rename fail
        std::fs::create_dir(artifact.path()).unwrap();
        std::fs::write(artifact.path().join("keep"), b"x").unwrap();
        std::fs::write(artifact.sidecar_path(), "previous").unwrap();

        let err = artifact
            .refresh_from(&MemorySource::new(b"complete download"))
            .await
            .expect_err("rename onto a directory must fail");

        assert!(matches!(err, FetchError::Io { .. }));
        assert!(!artifact.temp_path().exists());
        assert!(artifact.path().join("keep").exists());
        assert_eq!(artifact.load_fingerprint().await.as_deref(), Some("previous"));
    }

    #[tokio::test]
    async fn unwritable_sidecar_still_reports_the_replacement() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        std::fs::create_dir(artifact.sidecar_path()).unwrap();
        std::fs::write(artifact.sidecar_path().join("blocker"), b"x").unwrap();
        let source = MemorySource::new(b"v1");

        let first = artifact.refresh_from(&source).await.expect("first");
        assert!(first.is_changed());
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"v1");

        let second = artifact.refresh_from(&source).await.expect("second");
        assert!(second.is_changed());
    }

    #[tokio::test]
    async fn failed_download_keeps_previous_artifact() {
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        artifact
            .refresh_from(&MemorySource::new(b"accepted"))
            .await
            .expect("first");

        let err = artifact
            .refresh_from(&TruncatingSource)
            .await
            .expect_err("truncated download must fail");

        assert!(matches!(err, FetchError::Io { .. }));
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"accepted");
        assert_eq!(
            artifact.load_fingerprint().await.as_deref(),
            Some(LocalArtifact::sha256_hex(b"accepted").as_str())
        );
        assert!(!artifact.temp_path().exists());
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_source_streams_body() {
        let base = serve(axum::Router::new().route(
            "/catalog.xlsx",
            axum::routing::get(|| async { b"spreadsheet bytes".to_vec() }),
        ))
        .await;
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        let source =
            HttpArtifactSource::new(format!("{base}/catalog.xlsx"), HttpClientConfig::default())
                .expect("client");

        let outcome = artifact.refresh_from(&source).await.expect("download");

        assert!(outcome.is_changed());
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"spreadsheet bytes");
    }

    #[tokio::test]
    async fn http_error_status_is_an_error_not_unchanged() {
        let base = serve(axum::Router::new().route(
            "/catalog.xlsx",
            axum::routing::get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;
        let dir = tempdir().expect("tempdir");
        let artifact = LocalArtifact::new(dir.path().join("catalog.xlsx"));
        let source =
            HttpArtifactSource::new(format!("{base}/catalog.xlsx"), HttpClientConfig::default())
                .expect("client");

        let err = artifact.refresh_from(&source).await.expect_err("503");

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(!artifact.path().exists());
        assert!(artifact.load_fingerprint().await.is_none());
        assert!(!artifact.temp_path().exists());
    }
}
