//! Physical side effects of each access type.
//!
//! A [`Provisioner`] creates and removes the on-disk artifact of a volume
//! and moves data in and out of it. [`MountProvisioner`] works on plain
//! directories; [`BlockProvisioner`] on sparse files attached to loop
//! devices.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::capacity::MIB;
use super::host::HostTools;
use crate::error::CsiError;
use crate::types::AccessType;

/// Provisioning contract shared by all access types.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn access_type(&self) -> AccessType;

    /// Create the artifact at `path`. Succeeds if it already exists.
    async fn provision(&self, path: &Path, size_bytes: u64) -> Result<(), CsiError>;

    /// Remove the artifact at `path`. A missing artifact is not an error.
    async fn deprovision(&self, path: &Path) -> Result<(), CsiError>;

    /// Fill the volume at `dest` from the snapshot data at `snapshot`.
    async fn restore(&self, snapshot: &Path, dest: &Path) -> Result<(), CsiError>;

    /// Fill the volume at `dest` with the data of the volume at `src`.
    async fn clone_from(&self, src: &Path, dest: &Path) -> Result<(), CsiError>;

    /// Write the data of the volume at `src` to the snapshot file `snapshot`.
    async fn snapshot(&self, src: &Path, snapshot: &Path) -> Result<(), CsiError>;
}

/// Directory-backed volumes.
pub struct MountProvisioner {
    tools: HostTools,
}

impl MountProvisioner {
    pub fn new(tools: HostTools) -> Self {
        Self { tools }
    }
}

async fn dir_is_empty(path: &Path) -> Result<bool, CsiError> {
    let mut dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| CsiError::io("open volume dir", path, e))?;
    let first = dir
        .next_entry()
        .await
        .map_err(|e| CsiError::io("read volume dir", path, e))?;
    Ok(first.is_none())
}

#[async_trait]
impl Provisioner for MountProvisioner {
    fn access_type(&self) -> AccessType {
        AccessType::Mount
    }

    async fn provision(&self, path: &Path, _size_bytes: u64) -> Result<(), CsiError> {
        let existed = tokio::fs::try_exists(path)
            .await
            .map_err(|e| CsiError::io("stat dir", path, e))?;
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| CsiError::io("create dir", path, e))?;
        let chmod = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
            .await
            .map_err(|e| CsiError::io("chmod", path, e));
        if existed {
            chmod
        } else {
            discard_on_error(path, chmod).await
        }
    }

    async fn deprovision(&self, path: &Path) -> Result<(), CsiError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::io("remove dir", path, e)),
        }
    }

    async fn restore(&self, snapshot: &Path, dest: &Path) -> Result<(), CsiError> {
        self.tools.archiver.extract(snapshot, dest).await
    }

    async fn clone_from(&self, src: &Path, dest: &Path) -> Result<(), CsiError> {
        // cp fails on `src/.` when there is nothing to copy.
        if dir_is_empty(src).await? {
            debug!(src = %src.display(), "source volume is empty, nothing to copy");
            return Ok(());
        }
        self.tools.copier.copy_tree(src, dest).await
    }

    async fn snapshot(&self, src: &Path, snapshot: &Path) -> Result<(), CsiError> {
        self.tools.archiver.create(src, snapshot).await
    }
}

/// Sparse-file volumes exposed through loop devices.
pub struct BlockProvisioner {
    tools: HostTools,
}

impl BlockProvisioner {
    pub fn new(tools: HostTools) -> Self {
        Self { tools }
    }

    async fn attach(&self, path: &Path) -> Result<(), CsiError> {
        let device = self.tools.loop_devices.attach(path).await?;
        info!(path = %path.display(), device = %device.display(), "block file attached");
        Ok(())
    }
}

/// Block files are allocated in whole MiB, rounding up, at least one.
pub fn block_file_size(size_bytes: u64) -> Result<u64, CsiError> {
    size_bytes
        .div_ceil(MIB)
        .max(1)
        .checked_mul(MIB)
        .ok_or_else(|| CsiError::OutOfRange(format!("block size {size_bytes} is too large")))
}

/// Remove the artifact at `path` if `result` failed. Only for artifacts the
/// caller has just created; cleanup failures are logged and `result` wins.
async fn discard_on_error<T>(path: &Path, result: Result<T, CsiError>) -> Result<T, CsiError> {
    if let Err(err) = &result {
        let removed = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => debug!(path = %path.display(), error = %err, "discarded new artifact"),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to clean up new artifact")
            }
        }
    }
    result
}

#[async_trait]
impl Provisioner for BlockProvisioner {
    fn access_type(&self) -> AccessType {
        AccessType::Block
    }

    async fn provision(&self, path: &Path, size_bytes: u64) -> Result<(), CsiError> {
        let file_size = block_file_size(size_bytes)?;
        let existed = tokio::fs::try_exists(path)
            .await
            .map_err(|e| CsiError::io("stat block file", path, e))?;
        if existed {
            return self.attach(path).await;
        }

        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| CsiError::io("create block file", path, e))?;
        // From here on the file is ours and goes away on any failure.
        let result = match file.set_len(file_size).await {
            Ok(()) => self.attach(path).await,
            Err(e) => Err(CsiError::io("allocate block file", path, e)),
        };
        discard_on_error(path, result).await
    }

    async fn deprovision(&self, path: &Path) -> Result<(), CsiError> {
        // Keep the data while a device may still point at it.
        self.tools.loop_devices.detach(path).await?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::io("remove block file", path, e)),
        }
    }

    async fn restore(&self, snapshot: &Path, dest: &Path) -> Result<(), CsiError> {
        self.tools.copier.copy_raw(snapshot, dest).await
    }

    async fn clone_from(&self, src: &Path, dest: &Path) -> Result<(), CsiError> {
        self.tools.copier.copy_raw(src, dest).await
    }

    async fn snapshot(&self, src: &Path, snapshot: &Path) -> Result<(), CsiError> {
        self.tools.copier.copy_raw(src, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::hostpath::host::fake::{Call, FakeHost};
    use crate::error::ErrorCode;

    #[test]
    fn block_sizes_round_up_to_mib() {
        assert_eq!(block_file_size(0).unwrap(), MIB);
        assert_eq!(block_file_size(MIB).unwrap(), MIB);
        assert_eq!(block_file_size(MIB + 1).unwrap(), 2 * MIB);
        let err = block_file_size(u64::MAX - 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfRange);
    }

    #[tokio::test]
    async fn mount_provision_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        let prov = MountProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");

        prov.provision(&path, 0).await.unwrap();
        prov.provision(&path, 0).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        prov.deprovision(&path).await.unwrap();
        assert!(!path.exists());
        prov.deprovision(&path).await.unwrap();
    }

    #[tokio::test]
    async fn clone_of_empty_dir_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        let prov = MountProvisioner::new(fake.tools());
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        std::fs::create_dir(&src).unwrap();
        std::fs::create_dir(&dest).unwrap();

        prov.clone_from(&src, &dest).await.unwrap();
        assert!(fake.calls().is_empty());

        std::fs::write(src.join("data"), b"x").unwrap();
        prov.clone_from(&src, &dest).await.unwrap();
        assert_eq!(fake.calls(), vec![Call::CopyTree { src, dest }]);
    }

    #[tokio::test]
    async fn block_provision_allocates_sparse_file_and_attaches() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        let prov = BlockProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");

        prov.provision(&path, 3 * MIB + 10).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * MIB);
        assert_eq!(fake.calls(), vec![Call::Attach(path.clone())]);

        prov.deprovision(&path).await.unwrap();
        assert!(!path.exists());
        assert_eq!(fake.calls().last(), Some(&Call::Detach(path)));
    }

    #[tokio::test]
    async fn failed_attach_removes_fresh_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        fake.fail_attach.store(true, Ordering::SeqCst);
        let prov = BlockProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");

        let err = prov.provision(&path, MIB).await.unwrap_err();
        assert!(matches!(err, CsiError::DeviceFailed { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_attach_keeps_preexisting_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        fake.fail_attach.store(true, Ordering::SeqCst);
        let prov = BlockProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");
        std::fs::write(&path, b"data").unwrap();

        prov.provision(&path, MIB).await.unwrap_err();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn failed_detach_keeps_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        let prov = BlockProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");
        prov.provision(&path, MIB).await.unwrap();

        fake.fail_detach.store(true, Ordering::SeqCst);
        let err = prov.deprovision(&path).await.unwrap_err();
        assert!(matches!(err, CsiError::DeviceFailed { .. }));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn failed_allocation_removes_fresh_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        let prov = BlockProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");

        // Rounds to a valid u64 but is beyond what the file length can hold.
        let err = prov.provision(&path, (1 << 63) + 1).await.unwrap_err();
        assert!(matches!(err, CsiError::Io { .. }), "{err}");
        assert!(!path.exists());
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn oversized_block_request_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHost::default());
        let prov = BlockProvisioner::new(fake.tools());
        let path = tmp.path().join("vol");

        let err = prov.provision(&path, u64::MAX).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfRange);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn discard_on_error_removes_new_dir_and_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("dir");
        let file = tmp.path().join("file");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("data"), b"x").unwrap();
        std::fs::write(&file, b"x").unwrap();

        let chmod_failed: Result<(), CsiError> =
            Err(CsiError::io("chmod", &dir, "operation not permitted"));
        let err = discard_on_error(&dir, chmod_failed).await.unwrap_err();
        assert!(err.to_string().starts_with("chmod"));
        assert!(!dir.exists());

        discard_on_error(&file, Err::<(), _>(CsiError::internal("boom")))
            .await
            .unwrap_err();
        assert!(!file.exists());

        // Success leaves the artifact alone.
        std::fs::write(&file, b"x").unwrap();
        discard_on_error(&file, Ok(())).await.unwrap();
        assert!(file.exists());
    }
}
