// src/chroot/mod.rs

//! Build chroots and the session pool leasing them out
//!
//! A [`Chroot`] is the long-lived, managed base image for one
//! (codename, architecture) pair, created by debootstrap into one of several
//! storage backends and registered with schroot. Builds never touch it
//! directly; they lease a disposable snapshot through the [`ChrootPool`].

pub mod pool;
pub mod sequence;

pub use pool::{ChrootKey, ChrootPool, ChrootSession, SchrootSessions, SessionProvider};
pub use sequence::{CallSequence, CommandRunner, SystemRunner};

use crate::error::{Error, Result};
use crate::status::{ManagedResource, ResourceKind, fingerprint};
use async_trait::async_trait;
use sequence::argv;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, info};

/// Storage backend of a chroot's base image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Backend {
    /// Plain directory with an overlay union per session
    Dir {
        #[serde(default = "default_union_type")]
        union_type: String,
    },
    /// Tarball unpacked per session
    File {
        #[serde(default)]
        compression: Compression,
    },
    /// Logical volume in an existing volume group, snapshotted per session
    Lvm {
        volume_group: String,
        #[serde(default = "default_filesystem")]
        filesystem: String,
        #[serde(default = "default_snapshot_size")]
        snapshot_size_gb: u32,
    },
    /// Like `Lvm`, but on a volume group living in a loop-mounted image file
    LoopLvm {
        #[serde(default = "default_filesystem")]
        filesystem: String,
        #[serde(default = "default_snapshot_size")]
        snapshot_size_gb: u32,
        #[serde(default = "default_loop_size")]
        loop_size_gb: u32,
    },
    /// btrfs subvolume, snapshotted per session
    BtrfsSnapshot,
}

fn default_union_type() -> String {
    "overlay".to_string()
}

fn default_filesystem() -> String {
    "ext2".to_string()
}

fn default_snapshot_size() -> u32 {
    4
}

fn default_loop_size() -> u32 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    fn extension(self) -> &'static str {
        match self {
            Compression::None => "tar",
            Compression::Gzip => "tar.gz",
            Compression::Bzip2 => "tar.bz2",
            Compression::Xz => "tar.xz",
        }
    }

    fn tar_flag(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Gzip => Some("--gzip"),
            Compression::Bzip2 => Some("--bzip2"),
            Compression::Xz => Some("--xz"),
        }
    }
}

/// Coarse backend family, as recorded on sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Directory,
    File,
    Lvm,
    Btrfs,
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Dir { .. } => BackendKind::Directory,
            Backend::File { .. } => BackendKind::File,
            Backend::Lvm { .. } | Backend::LoopLvm { .. } => BackendKind::Lvm,
            Backend::BtrfsSnapshot => BackendKind::Btrfs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootConfig {
    pub codename: String,

    pub architecture: String,

    pub backend: Backend,

    /// Mirror to bootstrap from; defaults to the codename's source
    #[serde(default)]
    pub mirror: Option<String>,

    #[serde(default = "default_debootstrap")]
    pub debootstrap_command: String,

    /// schroot personality; derived from the architecture when unset
    #[serde(default)]
    pub personality: Option<String>,
}

fn default_debootstrap() -> String {
    "/usr/sbin/debootstrap".to_string()
}

impl ChrootConfig {
    pub fn new(codename: &str, architecture: &str, backend: Backend) -> Self {
        Self {
            codename: codename.to_string(),
            architecture: architecture.to_string(),
            backend,
            mirror: None,
            debootstrap_command: default_debootstrap(),
            personality: None,
        }
    }

    /// schroot name, `mbd-<codename>-<arch>`
    pub fn name(&self) -> String {
        format!("mbd-{}-{}", self.codename, self.architecture)
    }

    pub fn personality(&self) -> &str {
        match (&self.personality, self.architecture.as_str()) {
            (Some(p), _) => p,
            (None, "i386") => "linux32",
            (None, _) => "linux",
        }
    }

    pub fn key(&self) -> ChrootKey {
        ChrootKey::new(&self.codename, &self.architecture)
    }
}

/// One chroot as a managed resource
pub struct Chroot {
    config: ChrootConfig,
    dir: PathBuf,
    schroot_conf_dir: PathBuf,
    mirror: String,
    runner: Arc<dyn CommandRunner>,
    loop_device: Option<String>,
}

impl std::fmt::Debug for Chroot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chroot")
            .field("name", &self.config.name())
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Chroot {
    pub fn new(
        config: ChrootConfig,
        chroots_dir: &Path,
        schroot_conf_dir: &Path,
        mirror: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let dir = chroots_dir.join(&config.codename).join(&config.architecture);
        let mirror = config.mirror.clone().unwrap_or_else(|| mirror.to_string());
        Self {
            config,
            dir,
            schroot_conf_dir: schroot_conf_dir.to_path_buf(),
            mirror,
            runner,
            loop_device: None,
        }
    }

    pub fn config(&self) -> &ChrootConfig {
        &self.config
    }

    pub fn name(&self) -> String {
        self.config.name()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn schroot_conf_file(&self) -> PathBuf {
        self.schroot_conf_dir.join(format!("{}.conf", self.name()))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.dir.join("tmp")
    }

    /// Where debootstrap writes the root filesystem
    fn fs_dir(&self) -> PathBuf {
        match &self.config.backend {
            Backend::Dir { .. } | Backend::BtrfsSnapshot => self.dir.join("source"),
            _ => self.tmp_dir(),
        }
    }

    fn tar_file(&self, compression: Compression) -> PathBuf {
        self.dir.join(format!("source.{}", compression.extension()))
    }

    fn loop_image(&self) -> PathBuf {
        self.dir.join("lvmloop.image")
    }

    fn volume_group(&self) -> String {
        match &self.config.backend {
            Backend::Lvm { volume_group, .. } => volume_group.clone(),
            _ => format!("mbd-loop-{}-{}", self.config.codename, self.config.architecture),
        }
    }

    fn lvm_device(&self) -> String {
        format!("/dev/{}/{}", self.volume_group(), self.name())
    }

    fn path(p: &Path) -> String {
        p.display().to_string()
    }

    fn debootstrap(&self) -> Vec<String> {
        vec![
            self.config.debootstrap_command.clone(),
            "--variant=buildd".to_string(),
            format!("--arch={}", self.config.architecture),
            self.config.codename.clone(),
            Self::path(&self.fs_dir()),
            self.mirror.clone(),
        ]
    }

    /// Steps that populate a mounted volume and unmount it again
    fn lvm_volume_steps(&self, filesystem: &str, size_gb: u32) -> CallSequence {
        let device = self.lvm_device();
        let tmp = Self::path(&self.tmp_dir());
        let mut seq = CallSequence::new();
        seq.push(
            vec![
                "lvcreate".into(),
                format!("--size={}G", size_gb),
                format!("--name={}", self.name()),
                self.volume_group(),
            ],
            argv(&["lvremove", "--verbose", "--force", &device]),
        );
        seq.push(vec![format!("mkfs.{}", filesystem), device.clone()], Vec::new());
        seq.push(argv(&["mkdir", "-p", &tmp]), argv(&["rm", "-r", "-f", &tmp]));
        seq.push(
            argv(&["mount", "-v", "-t", filesystem, &device, &tmp]),
            argv(&["umount", "-v", &tmp]),
        );
        seq.push(self.debootstrap(), Vec::new());
        seq.push(argv(&["umount", "-v", &tmp]), Vec::new());
        seq
    }

    /// Full prepare sequence; `loop_device` is required for loop-lvm
    pub fn sequence(&self, loop_device: Option<&str>) -> Result<CallSequence> {
        let dir = Self::path(&self.dir);
        let mut seq = CallSequence::new();
        seq.push(argv(&["mkdir", "-p", &dir]), argv(&["rm", "-r", "-f", &dir]));

        match &self.config.backend {
            Backend::Dir { .. } => {
                let fs = Self::path(&self.fs_dir());
                seq.push(argv(&["mkdir", "-p", &fs]), argv(&["rm", "-r", "-f", &fs]));
                seq.push(self.debootstrap(), Vec::new());
            }
            Backend::File { compression } => {
                let tmp = Self::path(&self.tmp_dir());
                let tar = Self::path(&self.tar_file(*compression));
                seq.push(argv(&["mkdir", "-p", &tmp]), argv(&["rm", "-r", "-f", &tmp]));
                seq.push(self.debootstrap(), Vec::new());
                let mut create = argv(&["tar", "--create", "--directory", &tmp, "--file", &tar]);
                if let Some(flag) = compression.tar_flag() {
                    create.push(flag.to_string());
                }
                create.push(".".to_string());
                seq.push(create, argv(&["rm", "-f", &tar]));
                seq.push(argv(&["rm", "-r", "-f", &tmp]), Vec::new());
            }
            Backend::Lvm {
                filesystem,
                snapshot_size_gb,
                ..
            } => {
                seq.extend(self.lvm_volume_steps(filesystem, *snapshot_size_gb));
            }
            Backend::LoopLvm {
                filesystem,
                snapshot_size_gb,
                loop_size_gb,
            } => {
                let device = loop_device.ok_or_else(|| {
                    Error::InitError(format!("{}: no loop device available", self.name()))
                })?;
                let image = Self::path(&self.loop_image());
                let vg = self.volume_group();
                seq.push(
                    vec![
                        "dd".into(),
                        "if=/dev/zero".into(),
                        format!("of={}", image),
                        "bs=1M".into(),
                        format!("seek={}", u64::from(*loop_size_gb) * 1024 - 1),
                        "count=1".into(),
                    ],
                    argv(&["rm", "-f", &image]),
                );
                seq.push(
                    argv(&["losetup", "-v", device, &image]),
                    argv(&["losetup", "-d", device]),
                );
                seq.push(argv(&["pvcreate", "-v", device]), argv(&["pvremove", "-v", device]));
                seq.push(
                    argv(&["vgcreate", "-v", &vg, device]),
                    argv(&["vgremove", "-v", "--force", &vg]),
                );
                seq.extend(self.lvm_volume_steps(filesystem, *snapshot_size_gb));
            }
            Backend::BtrfsSnapshot => {
                let fs = Self::path(&self.fs_dir());
                let snapshots = Self::path(&self.dir.join("snapshots"));
                seq.push(
                    argv(&["btrfs", "subvolume", "create", &fs]),
                    argv(&["btrfs", "subvolume", "delete", &fs]),
                );
                seq.push(
                    argv(&["mkdir", "-p", &snapshots]),
                    argv(&["rm", "-r", "-f", &snapshots]),
                );
                seq.push(self.debootstrap(), Vec::new());
            }
        }
        Ok(seq)
    }

    /// The schroot configuration stanza for this chroot
    pub fn schroot_conf(&self) -> String {
        let name = self.name();
        let mut conf = format!(
            "[{name}]\n\
             description=autobuild chroot {name}\n\
             groups=sbuild\n\
             root-groups=sbuild\n\
             source-root-groups=sbuild\n\
             personality={}\n",
            self.config.personality()
        );
        let backend = match &self.config.backend {
            Backend::Dir { union_type } => format!(
                "type=directory\ndirectory={}\nunion-type={}\n",
                self.fs_dir().display(),
                union_type
            ),
            Backend::File { compression } => {
                format!("type=file\nfile={}\n", self.tar_file(*compression).display())
            }
            Backend::Lvm {
                filesystem,
                snapshot_size_gb,
                ..
            }
            | Backend::LoopLvm {
                filesystem,
                snapshot_size_gb,
                ..
            } => format!(
                "type=lvm-snapshot\ndevice={}\nmount-options=-t {} -o noatime\nlvm-snapshot-options=--size {}G\n",
                self.lvm_device(),
                filesystem,
                snapshot_size_gb
            ),
            Backend::BtrfsSnapshot => format!(
                "type=btrfs-snapshot\nbtrfs-source-subvolume={}\nbtrfs-snapshot-directory={}\n",
                self.fs_dir().display(),
                self.dir.join("snapshots").display()
            ),
        };
        conf.push_str(&backend);
        conf
    }

    fn find_loop_device(&self) -> Result<Option<String>> {
        match &self.config.backend {
            Backend::LoopLvm { .. } => {
                if let Some(device) = &self.loop_device {
                    return Ok(Some(device.clone()));
                }
                let image = Self::path(&self.loop_image());
                let associated = if self.loop_image().exists() {
                    self.runner.run(&argv(&["losetup", "--associated", &image]))?
                } else {
                    String::new()
                };
                // "/dev/loop0: [2049]:1234 (/path/lvmloop.image)"
                let bound = associated
                    .lines()
                    .next()
                    .and_then(|line| line.split(':').next())
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty());
                match bound {
                    Some(device) => Ok(Some(device)),
                    None => {
                        let free = self.runner.run(&argv(&["losetup", "--find"]))?;
                        Ok(Some(free.trim().to_string()))
                    }
                }
            }
            _ => Ok(None),
        }
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn CommandRunner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let runner = Arc::clone(&self.runner);
        tokio::task::spawn_blocking(move || f(runner.as_ref()))
            .await
            .map_err(|e| Error::IoError(format!("chroot task panicked: {}", e)))?
    }
}

#[async_trait]
impl ManagedResource for Chroot {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Chroot
    }

    fn key(&self) -> String {
        self.name()
    }

    fn fingerprint(&self) -> String {
        fingerprint(&(&self.config, &self.mirror))
    }

    async fn prepare(&mut self) -> Result<()> {
        let loop_device = self.find_loop_device()?;
        let sequence = self.sequence(loop_device.as_deref())?;
        self.loop_device = loop_device;

        info!("[chroot] {}: bootstrapping from {}", self.name(), self.mirror);
        self.run_blocking(move |runner| sequence.run(runner)).await?;

        let conf_file = self.schroot_conf_file();
        if let Err(e) = std::fs::write(&conf_file, self.schroot_conf()) {
            let sequence = self.sequence(self.loop_device.as_deref())?;
            self.run_blocking(move |runner| {
                sequence.rollback_all(runner);
                Ok(())
            })
            .await?;
            return Err(Error::IoError(format!(
                "cannot write {}: {}",
                conf_file.display(),
                e
            )));
        }
        debug!("[chroot] wrote {}", conf_file.display());
        Ok(())
    }

    async fn check(&mut self) -> Result<()> {
        let name = self.name();
        let mut commands = vec![argv(&["schroot", "--chroot", &format!("source:{}", name), "--info"])];
        if let Backend::Lvm { filesystem, .. } | Backend::LoopLvm { filesystem, .. } =
            &self.config.backend
        {
            commands.push(argv(&["fsck", "-n", "-f", "-t", filesystem, &self.lvm_device()]));
        }
        self.run_blocking(move |runner| {
            for command in &commands {
                runner.run(command)?;
            }
            Ok(())
        })
        .await
    }

    async fn remove(&mut self) -> Result<()> {
        let conf_file = self.schroot_conf_file();
        if conf_file.exists() {
            std::fs::remove_file(&conf_file)?;
        }
        let loop_device = self.find_loop_device()?;
        let sequence = self.sequence(loop_device.as_deref())?;
        self.run_blocking(move |runner| {
            sequence.rollback_all(runner);
            Ok(())
        })
        .await?;
        self.loop_device = None;
        info!("[chroot] {}: removed", self.name());
        Ok(())
    }
}
