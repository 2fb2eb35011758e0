//! Narrow interfaces over the host tools the provisioner shells out to.
//!
//! Each trait covers one concern so tests can swap in fakes that record
//! calls and simulate failures, without root or a loop-device table.
//! The `Command*` types are the production implementations, built on
//! `tokio::process::Command`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::CsiError;

/// Attaches files to loop devices and detaches them again.
#[async_trait]
pub trait LoopDeviceManager: Send + Sync {
    /// Attach `file` to a loop device, reusing an existing attachment.
    /// Returns the device path, e.g. `/dev/loop3`.
    async fn attach(&self, file: &Path) -> Result<PathBuf, CsiError>;

    /// Detach every loop device backed by `file`. A file with no attached
    /// device is already detached.
    async fn detach(&self, file: &Path) -> Result<(), CsiError>;
}

/// Packs and unpacks directory trees for mount-volume snapshots.
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Write the contents of `src_dir` to the gzip'd tarball `archive`.
    async fn create(&self, src_dir: &Path, archive: &Path) -> Result<(), CsiError>;

    /// Unpack `archive` into `dest_dir`.
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), CsiError>;
}

/// Copies volume data.
#[async_trait]
pub trait DataCopier: Send + Sync {
    /// Byte-for-byte copy of `src` into `dest`.
    async fn copy_raw(&self, src: &Path, dest: &Path) -> Result<(), CsiError>;

    /// Recursively copy the contents of directory `src` into `dest`,
    /// preserving attributes.
    async fn copy_tree(&self, src: &Path, dest: &Path) -> Result<(), CsiError>;
}

/// The set of host tools a backend uses.
#[derive(Clone)]
pub struct HostTools {
    pub loop_devices: Arc<dyn LoopDeviceManager>,
    pub archiver: Arc<dyn ArchiveTool>,
    pub copier: Arc<dyn DataCopier>,
}

impl HostTools {
    /// Tools backed by `losetup`, `tar`, `dd` and `cp`.
    pub fn system() -> Self {
        Self {
            loop_devices: Arc::new(Losetup),
            archiver: Arc::new(TarArchiver),
            copier: Arc::new(CommandCopier),
        }
    }
}

/// Run `program` with `args`, failing with the captured output on a
/// non-zero exit. Returns stdout.
async fn run(program: &str, args: &[&str]) -> Result<String, CsiError> {
    let command = format!("{program} {}", args.join(" "));
    debug!(%command, "running host command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CsiError::CommandFailed {
            command: command.clone(),
            reason: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(CsiError::CommandFailed {
            command,
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn path_arg(path: &Path) -> Result<&str, CsiError> {
    path.to_str()
        .ok_or_else(|| CsiError::Internal(format!("non-UTF8 path {}", path.display())))
}

/// Loop devices through `losetup(8)`.
pub struct Losetup;

impl Losetup {
    /// Devices currently backed by `file`, parsed from `losetup -j`.
    async fn devices_for(file: &Path) -> Result<Vec<String>, CsiError> {
        let out = run("losetup", &["-j", path_arg(file)?]).await?;
        Ok(parse_backing_devices(&out))
    }
}

/// Device names from `losetup -j` output, one per line:
/// `/dev/loop0: [2049]:1234 (/path/to/file)`.
fn parse_backing_devices(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| line.split_once(':').map(|(dev, _)| dev.trim().to_owned()))
        .filter(|dev| !dev.is_empty())
        .collect()
}

#[async_trait]
impl LoopDeviceManager for Losetup {
    async fn attach(&self, file: &Path) -> Result<PathBuf, CsiError> {
        let to_device_err = |e: CsiError| CsiError::DeviceFailed {
            path: file.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(dev) = Self::devices_for(file)
            .await
            .map_err(to_device_err)?
            .into_iter()
            .next()
        {
            debug!(file = %file.display(), %dev, "file already attached");
            return Ok(PathBuf::from(dev));
        }
        let out = run("losetup", &["-f", "--show", path_arg(file)?])
            .await
            .map_err(to_device_err)?;
        Ok(PathBuf::from(out.trim()))
    }

    async fn detach(&self, file: &Path) -> Result<(), CsiError> {
        // losetup -j cannot look up a file that is gone.
        let to_device_err = |e: CsiError| CsiError::DeviceFailed {
            path: file.display().to_string(),
            reason: e.to_string(),
        };
        match tokio::fs::try_exists(file).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => return Err(to_device_err(CsiError::io("stat", file, e))),
        }
        for dev in Self::devices_for(file).await.map_err(to_device_err)? {
            run("losetup", &["-d", &dev]).await.map_err(to_device_err)?;
        }
        Ok(())
    }
}

/// Snapshot archives through `tar(1)`.
pub struct TarArchiver;

#[async_trait]
impl ArchiveTool for TarArchiver {
    async fn create(&self, src_dir: &Path, archive: &Path) -> Result<(), CsiError> {
        run("tar", &["czf", path_arg(archive)?, "-C", path_arg(src_dir)?, "."]).await?;
        Ok(())
    }

    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<(), CsiError> {
        run("tar", &["zxvf", path_arg(archive)?, "-C", path_arg(dest_dir)?]).await?;
        Ok(())
    }
}

/// Data copies through `dd(1)` and `cp(1)`.
pub struct CommandCopier;

#[async_trait]
impl DataCopier for CommandCopier {
    async fn copy_raw(&self, src: &Path, dest: &Path) -> Result<(), CsiError> {
        let input = format!("if={}", path_arg(src)?);
        let output = format!("of={}", path_arg(dest)?);
        // Without notrunc dd shrinks a larger destination to the source size.
        run("dd", &[&input, &output, "conv=notrunc"]).await?;
        Ok(())
    }

    async fn copy_tree(&self, src: &Path, dest: &Path) -> Result<(), CsiError> {
        let from = format!("{}/.", path_arg(src)?);
        let to = format!("{}/", path_arg(dest)?);
        run("cp", &["-a", &from, &to]).await?;
        Ok(())
    }
}
