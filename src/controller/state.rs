//! Node Volume State
//!
//! The node controller remembers its volumes across restarts as one JSON
//! file per volume, `<dir>/<volumeId>.json`, holding the volume context.
//! Files are written to a temporary name first and renamed into place so a
//! crash never leaves a truncated entry behind.

use crate::error::{Error, Result};
use crate::parameters::VolumeContext;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STATE_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

/// Directory of persisted volume contexts
#[derive(Debug, Clone)]
pub struct FileState {
    dir: PathBuf,
}

impl FileState {
    /// Open the state directory, creating it if needed
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Configuration(format!("state directory {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.starts_with('.') || id.contains('/') || id.contains('\0') {
            return Err(Error::InvalidArgument(format!("invalid volume ID {:?}", id)));
        }
        Ok(self.dir.join(format!("{}{}", id, STATE_SUFFIX)))
    }

    /// Store the context of a volume, replacing an older entry
    pub async fn create(&self, id: &str, context: &VolumeContext) -> Result<()> {
        let path = self.path(id)?;
        let tmp = self.dir.join(format!("{}{}", id, TEMP_SUFFIX));
        let data = serde_json::to_vec_pretty(context)?;

        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Stored state of volume {} in {}", id, path.display());
        Ok(())
    }

    /// Remove the entry of a volume; unknown IDs are ignored
    pub async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &str) -> Result<VolumeContext> {
        let data = tokio::fs::read(self.path(id)?).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::VolumeNotFound {
                volume_id: id.to_string(),
            },
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// All stored volumes by ID. Unreadable entries are skipped.
    pub async fn get_all(&self) -> Result<BTreeMap<String, VolumeContext>> {
        let mut volumes = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(STATE_SUFFIX))
            else {
                continue;
            };
            match self.get(id).await {
                Ok(context) => {
                    volumes.insert(id.to_string(), context);
                }
                Err(e) => warn!("Skipping state entry {}: {}", entry.path().display(), e),
            }
        }
        Ok(volumes)
    }
}
