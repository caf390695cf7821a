//! Disk side of media transfers.
//!
//! Downloads are written to a `.part` file next to the final path and renamed
//! into place once complete, so a visible file is always whole. Before a
//! download is requested the writer checks whether the target already exists.

use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};

use shared::domain::TransferId;
use tokio::{
    fs,
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOp {
    /// Answered with `AlreadyPresent` or `Missing`.
    Lookup {
        transfer: TransferId,
        path: PathBuf,
    },
    WriteChunk {
        transfer: TransferId,
        path: PathBuf,
        offset: i64,
        bytes: Vec<u8>,
    },
    Finalize {
        transfer: TransferId,
        partial: PathBuf,
        target: PathBuf,
    },
    Discard {
        transfer: TransferId,
        partial: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaIoResult {
    Finalized { transfer: TransferId, path: PathBuf },
    AlreadyPresent { transfer: TransferId, path: PathBuf },
    Missing { transfer: TransferId },
    Failed { transfer: TransferId, error: String },
}

pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

#[derive(Debug, Clone, Default)]
pub struct MediaSink {
    tx: Option<mpsc::UnboundedSender<MediaOp>>,
}

impl MediaSink {
    pub fn new(tx: mpsc::UnboundedSender<MediaOp>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MediaOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns `false` when the operation was dropped.
    pub fn submit(&self, op: MediaOp) -> bool {
        match &self.tx {
            Some(tx) => {
                if tx.send(op).is_err() {
                    warn!("media: writer stopped; dropping disk operation");
                    return false;
                }
                true
            }
            None => {
                debug!(?op, "media: no writer attached");
                false
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

pub async fn run_media_writer(
    mut ops: mpsc::UnboundedReceiver<MediaOp>,
    results: mpsc::UnboundedSender<MediaIoResult>,
) {
    while let Some(op) = ops.recv().await {
        let outcome = match op {
            MediaOp::Lookup { transfer, path } => Some(match fs::try_exists(&path).await {
                Ok(true) => MediaIoResult::AlreadyPresent { transfer, path },
                Ok(false) => MediaIoResult::Missing { transfer },
                Err(err) => {
                    debug!(transfer = transfer.0, error = %err, "media: cannot stat download target");
                    MediaIoResult::Missing { transfer }
                }
            }),
            MediaOp::WriteChunk {
                transfer,
                path,
                offset,
                bytes,
            } => write_chunk(&path, offset, &bytes)
                .await
                .err()
                .map(|err| MediaIoResult::Failed {
                    transfer,
                    error: err.to_string(),
                }),
            MediaOp::Finalize {
                transfer,
                partial,
                target,
            } => Some(match fs::rename(&partial, &target).await {
                Ok(()) => MediaIoResult::Finalized {
                    transfer,
                    path: target,
                },
                Err(err) => MediaIoResult::Failed {
                    transfer,
                    error: err.to_string(),
                },
            }),
            MediaOp::Discard { transfer, partial } => {
                if let Err(err) = remove_if_present(&partial).await {
                    warn!(transfer = transfer.0, error = %err, "media: failed to discard partial file");
                }
                None
            }
        };

        if let Some(outcome) = outcome {
            if results.send(outcome).is_err() {
                break;
            }
        }
    }
}

async fn write_chunk(path: &Path, offset: i64, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset.max(0) as u64)).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/cache/5/photo_-_1.jpg")),
            PathBuf::from("/cache/5/photo_-_1.jpg.part")
        );
    }

    #[tokio::test]
    async fn chunks_land_at_offsets_and_finalize_renames() {
        let root = tempfile::tempdir().expect("temp dir");
        let target = root.path().join("9").join("clip.bin");
        let partial = partial_path(&target);

        let (sink, ops) = MediaSink::channel();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        let transfer = TransferId(1);

        sink.submit(MediaOp::WriteChunk {
            transfer,
            path: partial.clone(),
            offset: 3,
            bytes: b"def".to_vec(),
        });
        sink.submit(MediaOp::WriteChunk {
            transfer,
            path: partial.clone(),
            offset: 0,
            bytes: b"abc".to_vec(),
        });
        sink.submit(MediaOp::Finalize {
            transfer,
            partial: partial.clone(),
            target: target.clone(),
        });
        drop(sink);

        run_media_writer(ops, results_tx).await;

        assert_eq!(
            results.recv().await.expect("result"),
            MediaIoResult::Finalized {
                transfer,
                path: target.clone()
            }
        );
        assert_eq!(
            fs::read(&target).await.expect("read target"),
            b"abcdef".to_vec()
        );
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn discard_tolerates_missing_file() {
        let root = tempfile::tempdir().expect("temp dir");
        let (sink, ops) = MediaSink::channel();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        sink.submit(MediaOp::Discard {
            transfer: TransferId(2),
            partial: root.path().join("never-written.part"),
        });
        drop(sink);

        run_media_writer(ops, results_tx).await;
        assert!(results.try_recv().is_err());
    }

    #[tokio::test]
    async fn lookup_reports_existing_and_missing_targets() {
        let root = tempfile::tempdir().expect("temp dir");
        let present = root.path().join("5").join("profile").join("me_-_77.jpg");
        fs::create_dir_all(present.parent().expect("parent"))
            .await
            .expect("create dirs");
        fs::write(&present, b"jpeg").await.expect("write file");

        let (sink, ops) = MediaSink::channel();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        assert!(sink.submit(MediaOp::Lookup {
            transfer: TransferId(1),
            path: present.clone(),
        }));
        assert!(sink.submit(MediaOp::Lookup {
            transfer: TransferId(2),
            path: root.path().join("absent.jpg"),
        }));
        drop(sink);

        run_media_writer(ops, results_tx).await;
        assert_eq!(
            results.recv().await.expect("first"),
            MediaIoResult::AlreadyPresent {
                transfer: TransferId(1),
                path: present
            }
        );
        assert_eq!(
            results.recv().await.expect("second"),
            MediaIoResult::Missing {
                transfer: TransferId(2)
            }
        );
    }

    #[test]
    fn detached_sink_reports_dropped_ops() {
        let sink = MediaSink::default();
        assert!(!sink.is_attached());
        assert!(!sink.submit(MediaOp::Discard {
            transfer: TransferId(3),
            partial: PathBuf::from("x.part"),
        }));
    }
}
