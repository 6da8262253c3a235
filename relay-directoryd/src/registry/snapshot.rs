use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::{Context, Result};
use shared::types::{DirectoryRecord, RecordList};
use tempfile::NamedTempFile;

/// Commands sent to the snapshot writer thread
pub enum SnapshotCommand {
    Save(RecordList, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// Handle to the single writer of the on-disk snapshot file
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::Sender<SnapshotCommand>,
}

impl SnapshotHandle {
    /// Spawn the writer thread for the snapshot at `path`
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<SnapshotCommand>(64);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    SnapshotCommand::Save(list, reply) => {
                        let result = write_snapshot(&path, &list);
                        let _ = reply.send(result);
                    }
                    SnapshotCommand::Shutdown => {
                        tracing::info!("Snapshot writer shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Replace the snapshot file with the given records
    pub async fn save(&self, records: Vec<DirectoryRecord>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SnapshotCommand::Save(RecordList { records }, reply)).await?;
        rx.await?
    }

    /// Shutdown the writer thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(SnapshotCommand::Shutdown).await?;
        Ok(())
    }
}

/// Read the records saved at `path`. A missing file is an empty directory.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<DirectoryRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let list: RecordList = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

    Ok(list.records)
}

/// Write the full list to a temporary file beside `path`, then rename it into place
fn write_snapshot(path: &Path, list: &RecordList) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut file, list).context("Failed to serialize snapshot")?;
    file.flush().context("Failed to flush snapshot")?;
    file.as_file().sync_all().context("Failed to sync snapshot")?;

    file.persist(path)
        .with_context(|| format!("Failed to replace snapshot: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{signed_proxy, signed_service};

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let handle = SnapshotHandle::spawn(path.clone());

        let records = vec![signed_proxy(1001, "allow *:*"), signed_service(1002)];
        handle.save(records.clone()).await.unwrap();

        assert_eq!(load(&path).unwrap(), records);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.json");
        let handle = SnapshotHandle::spawn(path.clone());

        handle.save(vec![signed_service(1), signed_service(2)]).await.unwrap();
        handle.save(vec![signed_service(3)]).await.unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].service_id, 3);

        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1, "temporary files should be renamed away");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path().join("absent.json")).unwrap().is_empty());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load(&path).is_err());
    }
}
