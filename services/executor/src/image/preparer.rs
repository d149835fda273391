//! Rootfs artifact preparation.
//!
//! Turns an OCI image reference into a bootable ext4 image at a
//! deterministic path: the container runtime materializes the image
//! filesystem (create without start, export, remove), the payload is sized
//! and formatted, and an init binary is optionally injected. Artifacts are
//! built to a temp path and renamed into place, so readers only ever see
//! fully-formed files; published artifacts are never mutated.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, InitSettings};
use crate::task::{annotations, Task};

use super::init::{guest_init_path, inject_init, locate_init_binary};

/// Extra room in the ext4 image beyond the payload.
const SIZE_HEADROOM_FACTOR: f64 = 1.2;

/// Minimum ext4 image size.
const MIN_DISK_SIZE: u64 = 256 * 1024 * 1024;

/// Errors from rootfs preparation.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("image fetch failed: {0}")]
    FetchFailed(String),

    #[error("filesystem build failed: {0}")]
    BuildFailed(String),

    #[error("init injection failed: {0}")]
    InitInjectionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("rootfs preparation cancelled")]
    Cancelled,
}

/// Image preparation capability the executor composes.
#[async_trait]
pub trait ImagePreparer: Send + Sync {
    /// Materialize (or reuse) the rootfs for the task's image and annotate
    /// the task with its path and init metadata.
    async fn prepare(&self, task: &mut Task, cancel: &CancellationToken) -> Result<(), ImageError>;
}

/// Production preparer backed by the docker CLI and the host filesystem
/// tools (mkfs.ext4, mount, cp, umount).
pub struct DockerImagePreparer {
    rootfs_dir: PathBuf,
    init: InitSettings,
    headroom_factor: f64,
    min_disk_size: u64,
    /// Serializes concurrent builds of the same artifact.
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DockerImagePreparer {
    pub fn new(config: &Config) -> Self {
        Self {
            rootfs_dir: config.rootfs_dir.clone(),
            init: config.init,
            headroom_factor: SIZE_HEADROOM_FACTOR,
            min_disk_size: MIN_DISK_SIZE,
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn build_lock(&self, artifact: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        locks
            .entry(artifact.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn disk_size(&self, payload_bytes: u64) -> u64 {
        let with_headroom = (payload_bytes as f64 * self.headroom_factor) as u64;
        with_headroom.max(self.min_disk_size)
    }

    fn annotate(&self, task: &mut Task, artifact: &Path, injected_init: Option<&str>) {
        task.set_annotation(annotations::ROOTFS, artifact.to_string_lossy().to_string());

        if let Some(name) = injected_init {
            task.set_annotation(annotations::INIT_SYSTEM, name);
            task.set_annotation(
                annotations::INIT_PATH,
                guest_init_path(name).to_string_lossy().to_string(),
            );
            task.set_annotation(
                annotations::INIT_GRACE_SEC,
                self.init.grace_period_secs.to_string(),
            );
        }
    }

    /// The full build: materialize the payload, format, fill, inject, rename.
    async fn build_artifact(
        &self,
        image: &str,
        artifact: &Path,
        resolved_init: Option<&(String, PathBuf)>,
        cancel: &CancellationToken,
    ) -> Result<(), ImageError> {
        let docker = which::which("docker")
            .map_err(|_| ImageError::RuntimeUnavailable("docker".to_string()))?;

        fs::create_dir_all(&self.rootfs_dir)?;
        let build_dir = self.rootfs_dir.join(format!(
            ".build-{}-{}",
            artifact_stem(artifact),
            std::process::id()
        ));
        fs::create_dir_all(&build_dir)?;

        let result = self
            .build_in_dir(&docker, image, artifact, &build_dir, resolved_init, cancel)
            .await;

        // Unconditional teardown of build scratch; partial temp images go
        // with it because they live inside build_dir until the final rename.
        if let Err(e) = fs::remove_dir_all(&build_dir) {
            warn!(dir = %build_dir.display(), error = %e, "Failed to remove build dir");
        }

        result
    }

    async fn build_in_dir(
        &self,
        docker: &Path,
        image: &str,
        artifact: &Path,
        build_dir: &Path,
        resolved_init: Option<&(String, PathBuf)>,
        cancel: &CancellationToken,
    ) -> Result<(), ImageError> {
        check_cancel(cancel)?;

        // Pull only when the image is absent locally.
        if run_cli(docker, &["image", "inspect", image]).await.is_err() {
            info!(image = %image, "Pulling image");
            run_cli(docker, &["pull", image])
                .await
                .map_err(|e| ImageError::FetchFailed(format!("docker pull {image}: {e}")))?;
        }

        check_cancel(cancel)?;

        // Create without starting, stream the filesystem out, always remove.
        let container_id = run_cli(docker, &["create", image])
            .await
            .map_err(|e| ImageError::FetchFailed(format!("docker create {image}: {e}")))?
            .trim()
            .to_string();

        let payload_tar = build_dir.join("payload.tar");
        let export = run_cli(
            docker,
            &[
                "export",
                &container_id,
                "-o",
                &payload_tar.to_string_lossy(),
            ],
        )
        .await;
        if let Err(e) = run_cli(docker, &["rm", "-f", &container_id]).await {
            warn!(container = %container_id, error = %e, "Failed to remove export container");
        }
        export.map_err(|e| ImageError::FetchFailed(format!("docker export: {e}")))?;

        check_cancel(cancel)?;

        let tree_dir = build_dir.join("tree");
        fs::create_dir_all(&tree_dir)?;
        unpack_payload(&payload_tar, &tree_dir)?;
        let payload_bytes = dir_size(&tree_dir)?;

        let size = self.disk_size(payload_bytes);
        info!(
            image = %image,
            payload_bytes,
            image_bytes = size,
            "Formatting rootfs image"
        );

        let temp_image = build_dir.join("rootfs.ext4");
        let file = File::create(&temp_image)?;
        file.set_len(size)?;
        drop(file);

        run_host_tool("mkfs.ext4", &["-F", "-q", &temp_image.to_string_lossy()])
            .await
            .map_err(|e| ImageError::BuildFailed(format!("mkfs.ext4: {e}")))?;

        check_cancel(cancel)?;

        let mount_dir = build_dir.join("mnt");
        fs::create_dir_all(&mount_dir)?;
        run_host_tool(
            "mount",
            &[
                "-o",
                "loop",
                &temp_image.to_string_lossy(),
                &mount_dir.to_string_lossy(),
            ],
        )
        .await
        .map_err(|e| ImageError::BuildFailed(format!("mount: {e}")))?;

        // Everything between mount and umount must unmount on failure.
        let fill = self
            .fill_mounted_image(&tree_dir, &mount_dir, resolved_init)
            .await;
        let unmounted = run_host_tool("umount", &[&mount_dir.to_string_lossy()]).await;

        fill?;
        unmounted.map_err(|e| ImageError::BuildFailed(format!("umount: {e}")))?;

        // Publish atomically.
        fs::rename(&temp_image, artifact)?;
        info!(image = %image, artifact = %artifact.display(), "Rootfs artifact built");
        Ok(())
    }

    async fn fill_mounted_image(
        &self,
        tree_dir: &Path,
        mount_dir: &Path,
        resolved_init: Option<&(String, PathBuf)>,
    ) -> Result<(), ImageError> {
        run_host_tool(
            "cp",
            &[
                "-a",
                &format!("{}/.", tree_dir.display()),
                &mount_dir.to_string_lossy(),
            ],
        )
        .await
        .map_err(|e| ImageError::BuildFailed(format!("cp -a: {e}")))?;

        if let Some((name, source)) = resolved_init {
            // The mount succeeded; a copy failure here is fatal.
            inject_init(mount_dir, name, source)
                .map_err(|e| ImageError::InitInjectionFailed(format!("{name}: {e}")))?;
        }

        Ok(())
    }
}

#[async_trait]
impl ImagePreparer for DockerImagePreparer {
    async fn prepare(&self, task: &mut Task, cancel: &CancellationToken) -> Result<(), ImageError> {
        let image = task.runtime.image.clone();
        if image.is_empty() {
            return Err(ImageError::FetchFailed("empty image reference".to_string()));
        }

        // Resolve the init binary up front: the artifact name is keyed on
        // what actually gets injected, so a host without the binary shares
        // the no-init artifact instead of lying about injection.
        let resolved_init: Option<(String, PathBuf)> =
            self.init.system.binary_name().and_then(|name| {
                match locate_init_binary(name) {
                    Some(path) => Some((name.to_string(), path)),
                    None => {
                        warn!(init = %name, "Init binary not found on host, continuing without");
                        None
                    }
                }
            });

        let init_tag = resolved_init
            .as_ref()
            .map(|(name, _)| name.as_str())
            .unwrap_or("noinit");
        let artifact = self
            .rootfs_dir
            .join(artifact_file_name(&image, init_tag));

        let lock = self.build_lock(&artifact.to_string_lossy()).await;
        let _guard = lock.lock().await;

        if artifact.exists() {
            debug!(image = %image, artifact = %artifact.display(), "Rootfs cache hit");
            self.annotate(task, &artifact, resolved_init.as_ref().map(|(n, _)| n.as_str()));
            return Ok(());
        }

        self.build_artifact(&image, &artifact, resolved_init.as_ref(), cancel)
            .await?;

        self.annotate(task, &artifact, resolved_init.as_ref().map(|(n, _)| n.as_str()));
        Ok(())
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), ImageError> {
    if cancel.is_cancelled() {
        Err(ImageError::Cancelled)
    } else {
        Ok(())
    }
}

/// Artifact file name per the on-disk layout contract consumed by operator
/// tooling: `<image-slug>-<init-tag>.ext4`, the slug being the reference
/// with its separators replaced by `_`.
pub fn artifact_file_name(image: &str, init_tag: &str) -> String {
    let slug: String = image
        .chars()
        .map(|c| if matches!(c, ':' | '/' | '@') { '_' } else { c })
        .collect();

    format!("{slug}-{init_tag}.ext4")
}

fn artifact_stem(artifact: &Path) -> String {
    artifact
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "rootfs".to_string())
}

/// Run a docker CLI invocation, returning trimmed stdout.
async fn run_cli(binary: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new(binary)
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Run a host filesystem tool (mkfs.ext4, mount, cp, umount).
async fn run_host_tool(tool: &str, args: &[&str]) -> Result<(), String> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("{tool}: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// Unpack the exported filesystem tar (gzip-sniffed) into a directory,
/// refusing entries that escape it.
fn unpack_payload(tar_path: &Path, dest: &Path) -> Result<(), ImageError> {
    let file = File::open(tar_path)?;
    let reader = BufReader::new(file);

    if is_gzip(tar_path)? {
        extract_archive(&mut Archive::new(GzDecoder::new(reader)), dest)
    } else {
        extract_archive(&mut Archive::new(reader), dest)
    }
}

fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> Result<(), ImageError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| c == std::path::Component::ParentDir)
        {
            warn!(path = %path.display(), "Skipping entry with parent directory");
            continue;
        }

        let full_path = dest.join(&path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&full_path)?;
    }
    Ok(())
}

/// Check for the gzip magic bytes.
fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(_) => Ok(false),
    }
}

/// Recursive directory size in bytes.
fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                total += dir_size(&entry_path)?;
            } else {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InitSystem, Config};
    use crate::task::{Resources, RuntimeSpec};
    use tempfile::TempDir;

    fn preparer(dir: &TempDir) -> DockerImagePreparer {
        let mut config = Config::default();
        config.rootfs_dir = dir.path().to_path_buf();
        DockerImagePreparer::new(&config)
    }

    fn task(image: &str) -> Task {
        Task {
            task_id: "t1".to_string(),
            service_id: "svc".to_string(),
            node_id: "n".to_string(),
            runtime: RuntimeSpec {
                kind: "container".to_string(),
                image: image.to_string(),
                command: vec![],
                args: vec![],
                env: Default::default(),
                mounts: vec![],
            },
            resources: Resources::default(),
            networks: vec![],
            annotations: Default::default(),
        }
    }

    #[test]
    fn test_artifact_file_name_is_deterministic() {
        let a = artifact_file_name("nginx:latest", "tini");
        let b = artifact_file_name("nginx:latest", "tini");
        assert_eq!(a, b);
        assert_eq!(a, "nginx_latest-tini.ext4");
    }

    #[test]
    fn test_artifact_file_name_varies_by_image_and_init() {
        assert_ne!(
            artifact_file_name("nginx:latest", "tini"),
            artifact_file_name("nginx:1.25", "tini")
        );
        assert_ne!(
            artifact_file_name("nginx:latest", "tini"),
            artifact_file_name("nginx:latest", "noinit")
        );
    }

    #[test]
    fn test_artifact_file_name_sanitizes_reference() {
        assert_eq!(
            artifact_file_name("ghcr.io/org/app:v1", "noinit"),
            "ghcr.io_org_app_v1-noinit.ext4"
        );
        assert_eq!(
            artifact_file_name("registry:5000/app@sha256_abc", "tini"),
            "registry_5000_app_sha256_abc-tini.ext4"
        );
    }

    #[test]
    fn test_disk_size_floors_at_minimum_and_applies_headroom() {
        let dir = TempDir::new().unwrap();
        let preparer = preparer(&dir);

        assert_eq!(preparer.disk_size(1024), MIN_DISK_SIZE);

        let gib = 1024 * 1024 * 1024u64;
        let sized = preparer.disk_size(gib);
        assert!(sized > gib);
        assert!(sized < 2 * gib);
    }

    #[test]
    fn test_is_gzip_sniffs_magic() {
        let dir = TempDir::new().unwrap();

        let gz = dir.path().join("a.gz");
        fs::write(&gz, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        assert!(is_gzip(&gz).unwrap());

        let raw = dir.path().join("a.tar");
        fs::write(&raw, b"plain tar bytes").unwrap();
        assert!(!is_gzip(&raw).unwrap());

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(!is_gzip(&empty).unwrap());
    }

    #[test]
    fn test_unpack_payload_round_trip() {
        let dir = TempDir::new().unwrap();
        let tar_path = dir.path().join("payload.tar");

        {
            let file = File::create(&tar_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "etc/hostname", &b"guest"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let dest = dir.path().join("tree");
        fs::create_dir_all(&dest).unwrap();
        unpack_payload(&tar_path, &dest).unwrap();

        assert_eq!(fs::read(dest.join("etc/hostname")).unwrap(), b"guest");
        assert_eq!(dir_size(&dest).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cache_hit_annotates_without_runtime() {
        let dir = TempDir::new().unwrap();
        let preparer = preparer(&dir);

        // Default init policy is none, so the artifact carries the noinit tag.
        let artifact = dir
            .path()
            .join(artifact_file_name("nginx:latest", "noinit"));
        fs::write(&artifact, b"ext4-bytes").unwrap();
        let mtime_before = fs::metadata(&artifact).unwrap().modified().unwrap();

        let mut task = task("nginx:latest");
        let cancel = CancellationToken::new();
        preparer.prepare(&mut task, &cancel).await.unwrap();

        assert_eq!(
            task.annotation(annotations::ROOTFS),
            Some(artifact.to_string_lossy().as_ref())
        );
        assert_eq!(task.annotation(annotations::INIT_SYSTEM), None);

        // Cache hits never touch the artifact.
        let mtime_after = fs::metadata(&artifact).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[tokio::test]
    async fn test_two_prepares_share_one_artifact_path() {
        let dir = TempDir::new().unwrap();
        let preparer = preparer(&dir);

        let artifact = dir
            .path()
            .join(artifact_file_name("nginx:latest", "noinit"));
        fs::write(&artifact, b"ext4-bytes").unwrap();

        let cancel = CancellationToken::new();
        let mut t1 = task("nginx:latest");
        let mut t2 = task("nginx:latest");
        t2.task_id = "t2".to_string();

        preparer.prepare(&mut t1, &cancel).await.unwrap();
        preparer.prepare(&mut t2, &cancel).await.unwrap();

        assert_eq!(
            t1.annotation(annotations::ROOTFS),
            t2.annotation(annotations::ROOTFS)
        );
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn test_empty_image_reference_is_rejected() {
        let dir = TempDir::new().unwrap();
        let preparer = preparer(&dir);
        let mut task = task("");
        let cancel = CancellationToken::new();

        assert!(matches!(
            preparer.prepare(&mut task, &cancel).await,
            Err(ImageError::FetchFailed(_))
        ));
    }

    #[test]
    fn test_init_tag_tracks_configured_system() {
        // Sanity check on tag derivation inputs.
        assert_eq!(InitSystem::Tini.binary_name(), Some("tini"));
        assert_eq!(InitSystem::None.binary_name(), None);
    }
}
