use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ferry_engine::{ChunkRequest, TransferPlan, Transport, TransportError, TransportFuture};
use ferry_transfer::{ByteRange, Direction, TaskId, validate_object_path};
use tracing::{debug, warn};

use crate::checksum::{checksum_bytes, file_checksum};

/// Directory under the root that holds uploads in progress.
pub const PART_DIR: &str = ".ferry-parts";

/// Object store backed by a local directory.
///
/// Keys are relative paths under `root`. Uploads are assembled in a part
/// file under [`PART_DIR`] and only appear under their key once complete.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
    verify: bool,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            verify: false,
        }
    }

    /// Reads every written chunk back and compares its SHA-256 with the
    /// source bytes.
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to its file under the root.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, TransportError> {
        validate_object_path(key).map_err(|e| TransportError::Fatal(e.to_string()))?;
        Ok(self.root.join(key))
    }

    fn part_path(&self, task_id: TaskId) -> PathBuf {
        self.root.join(PART_DIR).join(task_id.to_string())
    }

    /// Returns the hex SHA-256 of a stored object.
    pub async fn object_checksum(&self, key: &str) -> Result<String, TransportError> {
        let path = self.object_path(key)?;
        let key = key.to_string();
        blocking(move || {
            file_checksum(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => TransportError::NotFound(key),
                _ => classify(e, "checksum"),
            })
        })
        .await
    }

    /// Source and destination of a chunk for the request's direction.
    fn chunk_paths(&self, request: &ChunkRequest) -> Result<(PathBuf, PathBuf), TransportError> {
        match request.direction {
            Direction::Upload => Ok((request.local_path.clone(), self.part_path(request.task_id))),
            Direction::Download => Ok((
                self.object_path(&request.remote_key)?,
                request.local_path.clone(),
            )),
        }
    }
}

impl Transport for LocalTransport {
    fn transfer_chunk<'a>(&'a self, request: &'a ChunkRequest) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if request.cancel.is_cancelled() {
                return Err(TransportError::Retryable("cancelled".into()));
            }
            let (src, dst) = self.chunk_paths(request)?;
            let range = request.range;
            let verify = self.verify;
            let index = request.index;
            blocking(move || copy_range(&src, &dst, range, verify)).await?;
            debug!(task = %request.task_id, chunk = index, %range, "chunk written");
            Ok(())
        })
    }

    fn stat_object<'a>(&'a self, remote_key: &'a str) -> TransportFuture<'a, u64> {
        Box::pin(async move {
            let path = self.object_path(remote_key)?;
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(TransportError::NotFound(remote_key.to_string()));
                }
                Err(e) => return Err(classify(e, "stat")),
            };
            if !meta.is_file() {
                return Err(TransportError::NotFound(remote_key.to_string()));
            }
            Ok(meta.len())
        })
    }

    fn begin_transfer<'a>(&'a self, plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let target = match plan.direction {
                Direction::Upload => {
                    // Fail on a bad key before any bytes move.
                    self.object_path(&plan.remote_key)?;
                    self.part_path(plan.task_id)
                }
                Direction::Download => plan.local_path.clone(),
            };
            let size = plan.total_bytes;
            blocking(move || preallocate(&target, size)).await
        })
    }

    fn complete_transfer<'a>(&'a self, plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            match plan.direction {
                Direction::Upload => {
                    let part = self.part_path(plan.task_id);
                    let object = self.object_path(&plan.remote_key)?;
                    blocking(move || {
                        if let Some(parent) = object.parent() {
                            std::fs::create_dir_all(parent).map_err(|e| classify(e, "mkdir"))?;
                        }
                        std::fs::rename(&part, &object).map_err(|e| classify(e, "commit"))
                    })
                    .await?;
                    debug!(task = %plan.task_id, key = %plan.remote_key, "object committed");
                }
                Direction::Download => {
                    let local = plan.local_path.clone();
                    blocking(move || {
                        File::open(&local)
                            .and_then(|f| f.sync_all())
                            .map_err(|e| classify(e, "sync"))
                    })
                    .await?;
                }
            }
            Ok(())
        })
    }

    fn abort_transfer<'a>(&'a self, plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let leftover = match plan.direction {
                Direction::Upload => self.part_path(plan.task_id),
                Direction::Download => plan.local_path.clone(),
            };
            match tokio::fs::remove_file(&leftover).await {
                Ok(()) => {
                    debug!(
                        task = %plan.task_id,
                        path = %leftover.display(),
                        "partial file removed"
                    );
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    warn!(path = %leftover.display(), error = %e, "cannot remove partial file");
                    Err(classify(e, "cleanup"))
                }
            }
        })
    }
}

/// Runs blocking file I/O off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::Fatal(format!("I/O worker failed: {e}")))?
}

/// Maps an I/O error to a transport error.
///
/// NotFound, PermissionDenied and InvalidInput are fatal; any other kind,
/// a short read included, is retried.
fn classify(err: io::Error, op: &str) -> TransportError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            TransportError::Fatal(format!("{op}: {err}"))
        }
        _ => TransportError::Retryable(format!("{op}: {err}")),
    }
}

/// Creates (or truncates) `path` and sizes it to `size` bytes.
fn preallocate(path: &Path, size: u64) -> Result<(), TransportError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| classify(e, "mkdir"))?;
    }
    let file = File::create(path).map_err(|e| classify(e, "create"))?;
    file.set_len(size).map_err(|e| classify(e, "allocate"))
}

/// Copies `range` from `src` into `dst` at the same offset.
fn copy_range(
    src: &Path,
    dst: &Path,
    range: ByteRange,
    verify: bool,
) -> Result<(), TransportError> {
    let len = usize::try_from(range.len())
        .map_err(|_| TransportError::Fatal(format!("chunk {range} too large")))?;
    let mut buf = vec![0u8; len];

    let mut reader = File::open(src).map_err(|e| classify(e, "open source"))?;
    reader
        .seek(SeekFrom::Start(range.start))
        .map_err(|e| classify(e, "seek source"))?;
    reader
        .read_exact(&mut buf)
        .map_err(|e| classify(e, "read"))?;

    let mut writer = OpenOptions::new()
        .write(true)
        .open(dst)
        .map_err(|e| classify(e, "open destination"))?;
    writer
        .seek(SeekFrom::Start(range.start))
        .map_err(|e| classify(e, "seek destination"))?;
    writer.write_all(&buf).map_err(|e| classify(e, "write"))?;
    writer.flush().map_err(|e| classify(e, "flush"))?;

    if verify {
        let expected = checksum_bytes(&buf);
        let mut check = File::open(dst).map_err(|e| classify(e, "open for verify"))?;
        check
            .seek(SeekFrom::Start(range.start))
            .map_err(|e| classify(e, "seek for verify"))?;
        check
            .read_exact(&mut buf)
            .map_err(|e| classify(e, "read back"))?;
        if checksum_bytes(&buf) != expected {
            return Err(TransportError::Retryable(format!(
                "checksum mismatch for {range}"
            )));
        }
    }
    Ok(())
}
