//! Optional jailer launch routing.
//!
//! When enabled, the VMM is spawned through the jailer binary, which chroots
//! it and drops privileges. The executor's part is limited to laying out the
//! chroot, hard-linking guest artifacts into it, and rewriting the config
//! document paths to their in-chroot locations; cgroup and namespace policy
//! belongs to the jailer itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::JailerSettings;
use crate::vmm::config::VmConfigDocument;

/// Errors from chroot staging.
#[derive(Debug, Error)]
pub enum JailError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("artifact {0} has no file name")]
    BadArtifactPath(PathBuf),
}

/// Chroot layout for one jailed VM.
#[derive(Debug, Clone)]
pub struct Jail {
    task_id: String,
    chroot_base: PathBuf,
}

impl Jail {
    pub fn new(task_id: &str, settings: &JailerSettings) -> Self {
        Self {
            task_id: task_id.to_string(),
            chroot_base: settings.chroot_base.clone(),
        }
    }

    /// The jailer's chroot root for this VM.
    pub fn chroot_dir(&self) -> PathBuf {
        self.chroot_base
            .join("firecracker")
            .join(&self.task_id)
            .join("root")
    }

    /// Host-side path of the API socket the jailed VMM binds at `/run/<name>`.
    pub fn host_socket_path(&self, socket_name: &str) -> PathBuf {
        self.chroot_dir().join("run").join(socket_name)
    }

    /// In-chroot socket path handed to the VMM on its command line.
    pub fn guest_socket_path(&self, socket_name: &str) -> PathBuf {
        PathBuf::from("/run").join(socket_name)
    }

    /// Jailer arguments up to (not including) the `--` separator.
    pub fn jailer_args(&self, settings: &JailerSettings, firecracker_path: &Path) -> Vec<String> {
        vec![
            "--id".to_string(),
            self.task_id.clone(),
            "--exec-file".to_string(),
            firecracker_path.to_string_lossy().to_string(),
            "--uid".to_string(),
            settings.uid.to_string(),
            "--gid".to_string(),
            settings.gid.to_string(),
            "--chroot-base-dir".to_string(),
            self.chroot_base.to_string_lossy().to_string(),
        ]
    }

    /// Stage the document's artifacts into the chroot and rewrite their paths
    /// to in-chroot locations. Returns the rewritten document.
    pub fn stage(&self, doc: &VmConfigDocument) -> Result<VmConfigDocument, JailError> {
        let chroot = self.chroot_dir();
        fs::create_dir_all(chroot.join("run"))?;

        let mut staged = doc.clone();

        staged.boot_source.kernel_image_path =
            self.stage_file(&chroot, &doc.boot_source.kernel_image_path, "kernel")?;

        for (idx, drive) in staged.drives.iter_mut().enumerate() {
            let source = drive.path_on_host.clone();
            drive.path_on_host = self.stage_file(&chroot, &source, &format!("d{idx}"))?;
        }

        Ok(staged)
    }

    /// Hard-link (or copy, across filesystems) a host file into the chroot
    /// root; returns its in-chroot path. The caller-chosen prefix keys the
    /// staged name, so drives whose host sources share a basename cannot
    /// overwrite each other.
    fn stage_file(&self, chroot: &Path, source: &Path, prefix: &str) -> Result<PathBuf, JailError> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| JailError::BadArtifactPath(source.to_path_buf()))?;
        let staged_name = format!("{prefix}-{name}");
        let dest = chroot.join(&staged_name);

        if dest.exists() {
            fs::remove_file(&dest)?;
        }
        if fs::hard_link(source, &dest).is_err() {
            fs::copy(source, &dest)?;
        }

        debug!(source = %source.display(), dest = %dest.display(), "Staged artifact into jail");
        Ok(PathBuf::from("/").join(staged_name))
    }

    /// Tear the chroot down after the VM is removed.
    pub fn cleanup(&self) -> Result<(), JailError> {
        let dir = self
            .chroot_base
            .join("firecracker")
            .join(&self.task_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!(chroot = %dir.display(), "Removed jail chroot");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::config::{BootSource, DriveConfig, MachineConfig};
    use tempfile::TempDir;

    fn settings(base: &Path) -> JailerSettings {
        JailerSettings {
            enabled: true,
            uid: 1000,
            gid: 1000,
            chroot_base: base.to_path_buf(),
        }
    }

    #[test]
    fn test_chroot_layout() {
        let jail = Jail::new("t1", &settings(Path::new("/srv/jail")));
        assert_eq!(
            jail.chroot_dir(),
            PathBuf::from("/srv/jail/firecracker/t1/root")
        );
        assert_eq!(
            jail.host_socket_path("t1.sock"),
            PathBuf::from("/srv/jail/firecracker/t1/root/run/t1.sock")
        );
        assert_eq!(jail.guest_socket_path("t1.sock"), PathBuf::from("/run/t1.sock"));
    }

    #[test]
    fn test_jailer_args() {
        let settings = settings(Path::new("/srv/jail"));
        let jail = Jail::new("t1", &settings);
        let args = jail.jailer_args(&settings, Path::new("/usr/bin/firecracker"));

        assert!(args.contains(&"--id".to_string()));
        assert!(args.contains(&"t1".to_string()));
        assert!(args.contains(&"--exec-file".to_string()));
        assert!(args.contains(&"--chroot-base-dir".to_string()));
    }

    #[test]
    fn test_stage_rewrites_paths_and_links_files() {
        let base = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();

        let kernel = artifacts.path().join("vmlinux");
        let rootfs = artifacts.path().join("app.ext4");
        fs::write(&kernel, b"kernel").unwrap();
        fs::write(&rootfs, b"rootfs").unwrap();

        let doc = VmConfigDocument {
            boot_source: BootSource::new(kernel, "console=ttyS0".to_string()),
            machine: MachineConfig::new(1, 512),
            drives: vec![DriveConfig::rootfs(rootfs)],
            network_interfaces: vec![],
        };

        let settings = settings(base.path());
        let jail = Jail::new("t1", &settings);
        let staged = jail.stage(&doc).unwrap();

        assert_eq!(
            staged.boot_source.kernel_image_path,
            PathBuf::from("/kernel-vmlinux")
        );
        assert_eq!(staged.drives[0].path_on_host, PathBuf::from("/d0-rootfs.ext4"));
        assert!(jail.chroot_dir().join("kernel-vmlinux").exists());
        assert!(jail.chroot_dir().join("d0-rootfs.ext4").exists());

        jail.cleanup().unwrap();
        assert!(!jail.chroot_dir().exists());
    }

    #[test]
    fn test_stage_keeps_same_basename_drives_distinct() {
        let base = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();

        let kernel = artifacts.path().join("vmlinux");
        let rootfs = artifacts.path().join("rootfs.ext4");
        fs::write(&kernel, b"kernel").unwrap();
        fs::write(&rootfs, b"rootfs").unwrap();

        // Two mounts whose host sources share a basename.
        let vol_a = artifacts.path().join("a");
        let vol_b = artifacts.path().join("b");
        fs::create_dir_all(&vol_a).unwrap();
        fs::create_dir_all(&vol_b).unwrap();
        fs::write(vol_a.join("data.ext4"), b"volume-a").unwrap();
        fs::write(vol_b.join("data.ext4"), b"volume-b").unwrap();

        let doc = VmConfigDocument {
            boot_source: BootSource::new(kernel, "console=ttyS0".to_string()),
            machine: MachineConfig::new(1, 512),
            drives: vec![
                DriveConfig::rootfs(rootfs),
                DriveConfig::new("vol-a", vol_a.join("data.ext4"), false),
                DriveConfig::new("vol-b", vol_b.join("data.ext4"), false),
            ],
            network_interfaces: vec![],
        };

        let settings = settings(base.path());
        let jail = Jail::new("t1", &settings);
        let staged = jail.stage(&doc).unwrap();

        assert_eq!(staged.drives[1].path_on_host, PathBuf::from("/d1-data.ext4"));
        assert_eq!(staged.drives[2].path_on_host, PathBuf::from("/d2-data.ext4"));
        assert_ne!(staged.drives[1].path_on_host, staged.drives[2].path_on_host);

        // Each drive still backs its own content.
        assert_eq!(
            fs::read(jail.chroot_dir().join("d1-data.ext4")).unwrap(),
            b"volume-a"
        );
        assert_eq!(
            fs::read(jail.chroot_dir().join("d2-data.ext4")).unwrap(),
            b"volume-b"
        );
    }
}
