//! Uploads and downloads in flight, and their combined progress.

use std::{collections::HashMap, path::PathBuf};

use shared::{
    domain::{TransferId, UnifiedKey},
    protocol::{FileLocation, ProtocolRequest},
};
use tracing::{debug, info, warn};

use crate::{
    entities::{Transfer, TransferDirection, TransferState},
    entity_store::Provenance,
    media_io::{partial_path, MediaIoResult, MediaOp},
    media_path::{media_path, FileOwner},
    requests::RequestPurpose,
    Mirror, MirrorEvent,
};

/// Identity of a remote file, independent of access hash.
pub type LocationKey = (i32, i64, i64, i32);

pub fn location_key(location: &FileLocation) -> LocationKey {
    (
        location.dc_id,
        location.id,
        location.volume_id,
        location.local_id,
    )
}

/// Combined percentage over every tracked transfer.
///
/// Reaching 100% clears the tracked set and reports 0 again.
#[derive(Debug, Default)]
pub struct ProgressAggregate {
    tracked: HashMap<TransferId, (i64, i64)>,
    percent: u8,
}

impl ProgressAggregate {
    pub fn update(&mut self, transfer: TransferId, done: i64, total: i64) -> u8 {
        self.tracked.insert(transfer, (done.max(0), total.max(0)));
        self.recompute()
    }

    pub fn remove(&mut self, transfer: TransferId) -> u8 {
        self.tracked.remove(&transfer);
        self.recompute()
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn tracked(&self) -> usize {
        self.tracked.len()
    }

    fn recompute(&mut self) -> u8 {
        let (done, total) = self
            .tracked
            .values()
            .fold((0i64, 0i64), |(done, total), (d, t)| (done + d, total + t));
        self.percent = if total <= 0 {
            0
        } else {
            let percent = (done.min(total) * 100 / total) as u8;
            if percent >= 100 {
                self.tracked.clear();
                0
            } else {
                percent
            }
        };
        self.percent
    }
}

impl Mirror {
    fn allocate_transfer(&mut self) -> TransferId {
        let id = TransferId(self.next_transfer);
        self.next_transfer += 1;
        id
    }

    fn track_progress(&mut self, transfer: TransferId, done: i64, total: i64) {
        let before = self.progress.percent();
        let after = self.progress.update(transfer, done, total);
        if before != after {
            self.emit(MirrorEvent::AggregateProgress(after));
        }
    }

    fn untrack_progress(&mut self, transfer: TransferId) {
        let before = self.progress.percent();
        let after = self.progress.remove(transfer);
        if before != after {
            self.emit(MirrorEvent::AggregateProgress(after));
        }
    }

    /// Uploads the file of an optimistic message. Returns `None` for unknown messages.
    pub fn start_upload(&mut self, message: UnifiedKey, local_path: PathBuf) -> Option<TransferId> {
        let source = self.messages.lookup(&message)?;
        let peer = source.peer;
        let random_id = source.random_id?;
        let caption = source
            .media
            .as_ref()
            .map(|media| media.caption.clone())
            .unwrap_or_default();
        let kind = source.media.as_ref().map(|media| media.kind);

        let id = self.allocate_transfer();
        let owner = match kind {
            Some(kind) => FileOwner::message(peer, message, kind),
            None => FileOwner {
                conversation: Some(peer),
                message: Some(message),
                ..FileOwner::default()
            },
        };
        self.transfers.upsert(
            id,
            Transfer {
                id,
                direction: TransferDirection::Upload,
                owner,
                message: Some(message),
                location: None,
                transferred: 0,
                total: 0,
                path: local_path.clone(),
                state: TransferState::Active,
            },
            Provenance::LocalOptimistic,
        );
        self.issue(
            ProtocolRequest::SendMedia {
                peer,
                random_id,
                transfer: id,
                local_path: local_path.to_string_lossy().into_owned(),
                caption,
            },
            RequestPurpose::Upload {
                transfer: id,
                random_id,
            },
        );
        info!(transfer = id.0, key = %message, "transfer: upload started");
        Some(id)
    }

    /// Downloads a remote file to its derived cache path.
    ///
    /// Returns `None` without touching the network when the location is empty
    /// or the owning message already has the file. A download of the same
    /// location already in flight is returned as is. With a media writer
    /// attached the cache path is looked up first and the file is only
    /// requested when nothing is there.
    pub fn start_download(
        &mut self,
        owner: FileOwner,
        location: FileLocation,
        size: i64,
        real_name: Option<&str>,
    ) -> Option<TransferId> {
        if location.is_empty() {
            debug!("transfer: empty file location, nothing to download");
            return None;
        }
        let location_id = location_key(&location);
        if let Some(existing) = self.downloads.get(&location_id) {
            return Some(*existing);
        }
        let already_local = owner
            .message
            .and_then(|key| self.messages.lookup(&key))
            .and_then(|message| message.media.as_ref())
            .and_then(|media| media.local_path.as_ref())
            .is_some();
        if already_local && !owner.thumbnail {
            debug!("transfer: file already downloaded");
            return None;
        }

        let id = self.allocate_transfer();
        let path = media_path(&self.settings.download_root, &owner, &location, real_name);
        self.transfers.upsert(
            id,
            Transfer {
                id,
                direction: TransferDirection::Download,
                owner,
                message: None,
                location: Some(location),
                transferred: 0,
                total: size,
                path: path.clone(),
                state: TransferState::Checking,
            },
            Provenance::LocalOptimistic,
        );
        self.downloads.insert(location_id, id);

        let looking = self.media.is_attached()
            && self.media.submit(MediaOp::Lookup {
                transfer: id,
                path: path.clone(),
            });
        if looking {
            debug!(transfer = id.0, path = %path.display(), "transfer: checking download cache");
        } else {
            self.fetch_download(id);
        }
        Some(id)
    }

    fn fetch_download(&mut self, transfer: TransferId) {
        let Some(current) = self.transfers.lookup(&transfer).cloned() else {
            return;
        };
        let Some(location) = current.location else {
            return;
        };
        self.transfers
            .modify(&transfer, |t| t.state = TransferState::Active);
        self.track_progress(transfer, 0, current.total);
        self.issue(
            ProtocolRequest::GetFile {
                transfer,
                location,
                size: current.total,
            },
            RequestPurpose::Download(transfer),
        );
        info!(transfer = transfer.0, path = %current.path.display(), "transfer: download started");
    }

    /// Marks a download complete and hands its file to the owning message.
    fn complete_download(&mut self, current: Transfer, path: PathBuf) {
        let transfer = current.id;
        self.transfers.modify(&transfer, |t| {
            t.state = TransferState::Completed;
            if t.total > 0 {
                t.transferred = t.total;
            }
        });
        if let Some(location) = current.location {
            self.downloads.remove(&location_key(&location));
        }
        if let Some(key) = current.owner.message.filter(|_| !current.owner.thumbnail) {
            let attached = self.messages.modify(&key, |message| {
                if let Some(media) = message.media.as_mut() {
                    media.local_path = Some(path.clone());
                }
            });
            if attached {
                self.persist_message(&key);
                self.emit(MirrorEvent::MessageUpdated(key));
            }
        }
        info!(transfer = transfer.0, path = %path.display(), "transfer: download finished");
        self.emit(MirrorEvent::TransferFinished { transfer, path });
    }

    pub(crate) fn upload_progress(&mut self, transfer: TransferId, uploaded: i64, total: i64) {
        let updated = self.transfers.modify(&transfer, |t| {
            t.transferred = uploaded;
            t.total = total;
        });
        if !updated {
            return;
        }
        self.track_progress(transfer, uploaded, total);
        self.emit(MirrorEvent::TransferProgress {
            transfer,
            transferred: uploaded,
            total,
        });
    }

    pub(crate) fn finish_upload(&mut self, transfer: TransferId) {
        let mut total = 0;
        let mut path = PathBuf::new();
        self.transfers.modify(&transfer, |t| {
            t.transferred = t.total;
            t.state = TransferState::Completed;
            total = t.total;
            path = t.path.clone();
        });
        if total > 0 {
            self.track_progress(transfer, total, total);
        } else {
            self.untrack_progress(transfer);
        }
        self.emit(MirrorEvent::TransferFinished { transfer, path });
    }

    /// Returns whether more chunks are expected.
    pub(crate) fn on_file_chunk(
        &mut self,
        transfer: TransferId,
        offset: i64,
        bytes: Vec<u8>,
        total: i64,
    ) -> bool {
        let Some(current) = self.transfers.lookup(&transfer) else {
            return false;
        };
        if current.state != TransferState::Active {
            debug!(transfer = transfer.0, "transfer: chunk for inactive transfer ignored");
            return false;
        }
        let target = current.path.clone();
        let partial = partial_path(&target);
        let transferred = offset + bytes.len() as i64;
        let total = if total > 0 { total } else { current.total };
        let complete = total > 0 && transferred >= total;

        self.media.submit(MediaOp::WriteChunk {
            transfer,
            path: partial.clone(),
            offset,
            bytes,
        });
        self.transfers.modify(&transfer, |t| {
            t.transferred = transferred;
            t.total = total;
            if complete {
                t.state = TransferState::Finalizing;
            }
        });
        self.track_progress(transfer, transferred, total);
        self.emit(MirrorEvent::TransferProgress {
            transfer,
            transferred,
            total,
        });

        if complete {
            self.media.submit(MediaOp::Finalize {
                transfer,
                partial,
                target,
            });
        }
        !complete
    }

    /// Completion of disk work queued by a download.
    pub fn on_media_io(&mut self, result: MediaIoResult) {
        match result {
            MediaIoResult::Finalized { transfer, path } => {
                let Some(current) = self.transfers.lookup(&transfer).cloned() else {
                    return;
                };
                if current.state != TransferState::Finalizing {
                    return;
                }
                self.complete_download(current, path);
            }
            MediaIoResult::AlreadyPresent { transfer, path } => {
                let Some(current) = self.transfers.lookup(&transfer).cloned() else {
                    return;
                };
                if current.state != TransferState::Checking {
                    return;
                }
                debug!(transfer = transfer.0, "transfer: file found in download cache");
                self.complete_download(current, path);
            }
            MediaIoResult::Missing { transfer } => {
                let checking = self
                    .transfers
                    .lookup(&transfer)
                    .is_some_and(|t| t.state == TransferState::Checking);
                if checking {
                    self.fetch_download(transfer);
                }
            }
            MediaIoResult::Failed { transfer, error } => self.fail_transfer(transfer, error),
        }
    }

    pub(crate) fn fail_transfer(&mut self, transfer: TransferId, error: String) {
        let Some(current) = self.transfers.lookup(&transfer).cloned() else {
            return;
        };
        if current.state.is_terminal() {
            return;
        }
        warn!(transfer = transfer.0, error = %error, "transfer: failed");
        self.transfers
            .modify(&transfer, |t| t.state = TransferState::Failed);
        if let Some(location) = current.location {
            self.downloads.remove(&location_key(&location));
        }
        if current.direction == TransferDirection::Download {
            self.media.submit(MediaOp::Discard {
                transfer,
                partial: partial_path(&current.path),
            });
        }
        self.untrack_progress(transfer);
        self.emit(MirrorEvent::TransferFailed { transfer, error });
    }

    /// Stops a transfer. Calling it on a finished or unknown transfer does nothing.
    pub fn cancel_transfer(&mut self, transfer: TransferId) -> bool {
        let Some(current) = self.transfers.lookup(&transfer).cloned() else {
            return false;
        };
        if current.state.is_terminal() || current.state == TransferState::Finalizing {
            debug!(transfer = transfer.0, state = ?current.state, "transfer: cancel after completion ignored");
            return false;
        }
        if current.state == TransferState::Checking {
            self.transfers
                .modify(&transfer, |t| t.state = TransferState::Cancelled);
            if let Some(location) = current.location {
                self.downloads.remove(&location_key(&location));
            }
            info!(transfer = transfer.0, "transfer: cancelled before fetch");
            self.emit(MirrorEvent::TransferCancelled(transfer));
            return true;
        }

        if let Some(request) = self.requests.find(|purpose| purpose.transfer() == Some(transfer)) {
            self.requests.take(request);
        }
        self.issue(
            ProtocolRequest::CancelTransfer { transfer },
            RequestPurpose::CancelTransfer(transfer),
        );
        self.untrack_progress(transfer);

        match current.direction {
            TransferDirection::Upload => {
                self.transfers
                    .modify(&transfer, |t| t.state = TransferState::Cancelled);
                if let Some(key) = current.message {
                    let peer = self.messages.get(&key).peer;
                    let was_top = self.conversations.get(&peer).top_message == Some(key);
                    self.abandon_send(&key);
                    self.evict_message(key, true);
                    if was_top {
                        let fallback = self.ordering.messages(&peer).first().copied();
                        self.set_top_message(peer, fallback);
                    }
                }
            }
            TransferDirection::Download => {
                self.transfers.modify(&transfer, |t| {
                    t.transferred = 0;
                    t.total = 0;
                    t.state = TransferState::Cancelled;
                });
                if let Some(location) = current.location {
                    self.downloads.remove(&location_key(&location));
                }
                self.media.submit(MediaOp::Discard {
                    transfer,
                    partial: partial_path(&current.path),
                });
            }
        }
        info!(transfer = transfer.0, "transfer: cancelled");
        self.emit(MirrorEvent::TransferCancelled(transfer));
        true
    }

    /// Moves uploads of an acknowledged message to its canonical key.
    pub(crate) fn retarget_transfers(&mut self, from: UnifiedKey, to: UnifiedKey) {
        let affected: Vec<TransferId> = self
            .transfers
            .iter()
            .filter(|(_, transfer)| transfer.message == Some(from) || transfer.owner.message == Some(from))
            .map(|(id, _)| *id)
            .collect();
        for id in affected {
            self.transfers.modify(&id, |transfer| {
                if transfer.message == Some(from) {
                    transfer.message = Some(to);
                }
                if transfer.owner.message == Some(from) {
                    transfer.owner.message = Some(to);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_reports_weighted_percentage() {
        let mut progress = ProgressAggregate::default();
        progress.update(TransferId(1), 50, 100);
        assert_eq!(progress.update(TransferId(2), 50, 50), 66);
    }

    #[test]
    fn aggregate_resets_once_everything_completes() {
        let mut progress = ProgressAggregate::default();
        progress.update(TransferId(1), 50, 100);
        progress.update(TransferId(2), 50, 50);
        assert_eq!(progress.update(TransferId(3), 0, 10), 62);
        assert_eq!(progress.update(TransferId(1), 100, 100), 93);
        assert_eq!(progress.update(TransferId(3), 10, 10), 0);
        assert_eq!(progress.tracked(), 0);
    }

    #[test]
    fn removing_a_transfer_recomputes() {
        let mut progress = ProgressAggregate::default();
        progress.update(TransferId(1), 10, 100);
        progress.update(TransferId(2), 90, 100);
        assert_eq!(progress.remove(TransferId(2)), 10);
    }

    #[test]
    fn location_key_ignores_access_hash() {
        let a = FileLocation {
            dc_id: 1,
            id: 5,
            volume_id: 0,
            local_id: 0,
            access_hash: 1,
        };
        let b = FileLocation {
            access_hash: 2,
            ..a
        };
        assert_eq!(location_key(&a), location_key(&b));
    }
}
