//! Device Utilities
//!
//! Erasing and readiness checks shared by all device manager variants.

use super::exec::CommandRunner;
use super::PmemDeviceInfo;
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

// =============================================================================
// Constants
// =============================================================================

/// Blocks of 1KiB cleared when a device is not flushed completely; enough
/// to hide filesystem signatures from the next user of the space
pub const CLEAR_BLOCKS: u64 = 4;

/// Attempts made by [`wait_device_appears`]
pub const WAIT_DEVICE_RETRIES: u32 = 10;

/// Pause between two attempts of [`wait_device_appears`]
pub const WAIT_DEVICE_INTERVAL: Duration = Duration::from_millis(100);

const BLOCK_SIZE: u64 = 1024;

// =============================================================================
// Erasing
// =============================================================================

/// Erase a device before it is handed back to the pool.
///
/// With `flush` the whole device is overwritten, otherwise only the first
/// [`CLEAR_BLOCKS`] KiB.
pub async fn clear_device(
    runner: &dyn CommandRunner,
    device: &PmemDeviceInfo,
    flush: bool,
) -> Result<()> {
    debug!("ClearDevice: path: {} flush: {}", device.path, flush);
    let blocks = if flush { 0 } else { CLEAR_BLOCKS };
    flush_device(runner, device, blocks).await
}

/// Overwrite a device.
///
/// `blocks == 0` overwrites the entire device with random data in a single
/// pass. Otherwise `blocks` KiB at the start of the device are zeroed, never
/// more than the device size. The path must exist, be a block device and not
/// be open anywhere else.
pub async fn flush_device(
    runner: &dyn CommandRunner,
    device: &PmemDeviceInfo,
    blocks: u64,
) -> Result<()> {
    check_device(device).await?;
    erase_device(runner, device, blocks).await
}

/// Refuse anything but an existing block device nobody holds open
async fn check_device(device: &PmemDeviceInfo) -> Result<()> {
    let path = Path::new(&device.path);
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        error!("FlushDevice: {} does not exist", device.path);
        match e.kind() {
            ErrorKind::NotFound => Error::DeviceNotFound {
                name: device.path.clone(),
            },
            _ => Error::Io(e),
        }
    })?;
    if !metadata.file_type().is_block_device() {
        error!("FlushDevice: {} is not a device", device.path);
        return Err(Error::InvalidArgument(format!(
            "{} is not a block device",
            device.path
        )));
    }
    if device_opened(path).await? {
        return Err(Error::DeviceInUse {
            path: device.path.clone(),
        });
    }
    Ok(())
}

/// Overwrite the device without checking what `device.path` is
async fn erase_device(runner: &dyn CommandRunner, device: &PmemDeviceInfo, blocks: u64) -> Result<()> {
    if blocks == 0 {
        debug!("Wiping entire device: {}", device.path);
        // one iteration instead of shred's default of three, for speed
        runner
            .run("shred", &["-n", "1", &device.path])
            .await
            .map_err(|e| Error::Internal(format!("device shred failure: {}", e)))?;
    } else {
        let len = zeroing_len(blocks, device.size);
        debug!(
            "Zeroing {} bytes at start of device: {} size {}",
            len, device.path, device.size
        );
        zero_range(Path::new(&device.path), len)
            .await
            .map_err(|e| Error::Internal(format!("device zeroing failure: {}", e)))?;
    }
    Ok(())
}

/// Number of bytes zeroed for `blocks` KiB on a device of `size` bytes
pub fn zeroing_len(blocks: u64, size: u64) -> u64 {
    let blocks = blocks.min(size / BLOCK_SIZE);
    blocks * BLOCK_SIZE
}

async fn zero_range(path: &Path, len: u64) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    let zeros = vec![0u8; BLOCK_SIZE as usize];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(BLOCK_SIZE) as usize;
        file.write_all(&zeros[..chunk]).await?;
        remaining -= chunk as u64;
    }
    file.sync_all().await
}

/// Make a freshly allocated or reclaimed device safe to hand out: wait for
/// its device node, then clear its start
pub async fn prepare_device(runner: &dyn CommandRunner, device: &PmemDeviceInfo) -> Result<()> {
    wait_device_appears(device).await?;
    clear_device(runner, device, false).await
}

// =============================================================================
// Readiness
// =============================================================================

/// Check whether a block device is held open by someone else.
///
/// Opening a block device with `O_EXCL` fails with `EBUSY` while it is
/// mounted or claimed.
pub async fn device_opened(path: &Path) -> Result<bool> {
    let flags = nix::fcntl::OFlag::O_EXCL.bits();
    match tokio::fs::OpenOptions::new()
        .read(true)
        .custom_flags(flags)
        .open(path)
        .await
    {
        Ok(_) => Ok(false),
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) => Ok(true),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Err(Error::Permission(format!("{}: {}", path.display(), e)))
        }
        Err(e) => Err(Error::Io(e)),
    }
}

/// Wait for a device node to show up after allocation.
///
/// Device nodes are created asynchronously by the kernel and udev.
pub async fn wait_device_appears(device: &PmemDeviceInfo) -> Result<()> {
    wait_path_appears(Path::new(&device.path), WAIT_DEVICE_RETRIES, WAIT_DEVICE_INTERVAL).await
}

/// Poll for `path` up to `attempts` times, sleeping `interval` after each miss
pub async fn wait_path_appears(path: &Path, attempts: u32, interval: Duration) -> Result<()> {
    for attempt in 0..attempts {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        warn!(
            "WaitDeviceAppears[{}]: {} does not exist, sleep {:?} and retry",
            attempt,
            path.display(),
            interval
        );
        tokio::time::sleep(interval).await;
    }
    Err(Error::DeviceNotReady {
        path: path.display().to_string(),
        reason: format!("did not appear after {} retries", attempts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::exec::testing::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::time::Instant;
    use tempfile::TempDir;

    fn info(path: &Path, size: u64) -> PmemDeviceInfo {
        PmemDeviceInfo {
            volume_id: "vol".into(),
            path: path.display().to_string(),
            size,
        }
    }

    #[test]
    fn test_zeroing_len_clamps_to_device_size() {
        assert_eq!(zeroing_len(4, 1024 * 1024), 4096);
        assert_eq!(zeroing_len(4, 2048), 2048);
        assert_eq!(zeroing_len(4, 3000), 2048);
        assert_eq!(zeroing_len(4, 100), 0);
        assert!(zeroing_len(u64::MAX, 10 * 1024) <= 10 * 1024);
    }

    #[tokio::test]
    async fn test_erase_zeroes_clamped_start_only() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pmem-image");
        std::fs::write(&path, vec![0xabu8; 10 * 1024]).unwrap();
        let runner = ScriptedRunner::new();

        erase_device(&runner, &info(&path, 10 * 1024), CLEAR_BLOCKS)
            .await
            .unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 10 * 1024);
        assert!(data[..4096].iter().all(|b| *b == 0));
        assert!(data[4096..].iter().all(|b| *b == 0xab));

        // a 2.5KiB device only gets its two whole blocks zeroed
        std::fs::write(&path, vec![0xabu8; 2560]).unwrap();
        erase_device(&runner, &info(&path, 2560), CLEAR_BLOCKS)
            .await
            .unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 2560);
        assert!(data[..2048].iter().all(|b| *b == 0));
        assert!(data[2048..].iter().all(|b| *b == 0xab));
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_erase_whole_device_shreds_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pmem-image");
        std::fs::write(&path, b"data").unwrap();
        let runner = ScriptedRunner::new().on("shred", "");

        erase_device(&runner, &info(&path, 4), 0).await.unwrap();
        let expected = format!("shred -n 1 {}", path.display());
        assert!(runner.called(&expected));
        // zeroing was not used for the full wipe
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        let runner = ScriptedRunner::new().fail("shred", "I/O error");
        let err = erase_device(&runner, &info(&path, 4), 0).await.unwrap_err();
        assert_matches!(err, Error::Internal(_));
    }

    #[tokio::test]
    async fn test_regular_file_is_not_opened_exclusively() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pmem-image");
        std::fs::write(&path, b"").unwrap();
        assert!(!device_opened(&path).await.unwrap());
        assert_matches!(
            device_opened(&tmp.path().join("gone")).await,
            Err(Error::Io(_))
        );
    }

    #[tokio::test]
    async fn test_prepare_missing_device_does_not_clear() {
        let tmp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let err = prepare_device(&runner, &info(&tmp.path().join("never"), 4096))
            .await
            .unwrap_err();
        assert_matches!(err, Error::DeviceNotReady { .. });
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flush_refuses_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("not-a-device");
        std::fs::write(&path, b"precious data").unwrap();
        let runner = ScriptedRunner::new();

        for blocks in [0, 4] {
            let err = flush_device(&runner, &info(&path, 1024 * 1024), blocks)
                .await
                .unwrap_err();
            assert_matches!(err, Error::InvalidArgument(_));
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"precious data");
        assert!(runner.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flush_missing_path() {
        let tmp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let err = clear_device(&runner, &info(&tmp.path().join("gone"), 4096), true)
            .await
            .unwrap_err();
        assert_matches!(err, Error::DeviceNotFound { .. });
        assert!(!runner.called("shred"));
    }

    #[tokio::test]
    async fn test_wait_exhausts_retry_budget() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pmem0");
        let interval = Duration::from_millis(10);

        let start = Instant::now();
        let err = wait_path_appears(&path, 5, interval).await.unwrap_err();
        assert!(start.elapsed() >= interval * 5);
        assert_matches!(err, Error::DeviceNotReady { .. });
        assert!(err.to_string().contains("pmem0"));
    }

    #[tokio::test]
    async fn test_wait_sees_late_device() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pmem1");

        let late = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            tokio::fs::write(late, b"").await.unwrap();
        });

        wait_path_appears(&path, 100, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_existing_device_returns_immediately() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pmem2");
        std::fs::write(&path, b"").unwrap();

        let start = Instant::now();
        wait_device_appears(&info(&path, 0)).await.unwrap();
        assert!(start.elapsed() < WAIT_DEVICE_INTERVAL);
    }
}
