use std::collections::HashSet;

use shared::{
    domain::{EntityKind, StickerSetId},
    protocol::{ProtocolRequest, StickerSetRecord},
};
use tracing::{debug, info};

use crate::{
    coalesce::{Admission, Waiter},
    entities::StickerSet,
    entity_store::Provenance,
    requests::RequestPurpose,
    Mirror, MirrorEvent,
};

/// Coalescing key for sticker requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StickerKey {
    All,
    Set(String),
}

impl Mirror {
    pub fn refresh_stickers(&mut self, waiter: Option<Waiter>) {
        if self.sticker_ops.begin(StickerKey::All, waiter) == Admission::Joined {
            return;
        }
        self.issue(ProtocolRequest::GetAllStickers, RequestPurpose::Stickers);
    }

    pub fn install_sticker_set(&mut self, short_name: String, waiter: Option<Waiter>) {
        if self
            .sticker_ops
            .begin(StickerKey::Set(short_name.clone()), waiter)
            == Admission::Joined
        {
            debug!(short_name = %short_name, "stickers: install already in flight");
            return;
        }
        self.issue(
            ProtocolRequest::InstallStickerSet {
                short_name: short_name.clone(),
            },
            RequestPurpose::InstallSticker(short_name),
        );
    }

    pub fn uninstall_sticker_set(&mut self, short_name: String, waiter: Option<Waiter>) {
        if self
            .sticker_ops
            .begin(StickerKey::Set(short_name.clone()), waiter)
            == Admission::Joined
        {
            debug!(short_name = %short_name, "stickers: uninstall already in flight");
            return;
        }
        self.issue(
            ProtocolRequest::UninstallStickerSet {
                short_name: short_name.clone(),
            },
            RequestPurpose::UninstallSticker(short_name),
        );
    }

    pub fn sticker_set_by_name(&self, short_name: &str) -> Option<&StickerSet> {
        self.sticker_index
            .get(short_name)
            .and_then(|id| self.sticker_sets.lookup(id))
    }

    /// The full installed list; sets missing from it are dropped.
    pub(crate) fn apply_sticker_sets(&mut self, sets: &[StickerSetRecord]) {
        let listed: HashSet<StickerSetId> = sets.iter().map(|set| set.id).collect();
        let mut stale: Vec<StickerSetId> = self
            .sticker_sets
            .keys()
            .filter(|id| !listed.contains(*id))
            .copied()
            .collect();
        stale.sort();
        for id in stale {
            self.drop_sticker_set(id);
        }
        for record in sets {
            self.store_sticker_set(record);
        }
        self.sticker_ops.complete(&StickerKey::All, Ok(()));
        info!(sets = sets.len(), "stickers: installed sets refreshed");
        self.emit(MirrorEvent::StickerSetsChanged);
    }

    pub(crate) fn apply_installed_set(&mut self, short_name: &str, set: &StickerSetRecord) {
        self.store_sticker_set(set);
        self.sticker_ops
            .complete(&StickerKey::Set(short_name.to_string()), Ok(()));
        self.emit(MirrorEvent::StickerSetsChanged);
    }

    pub(crate) fn remove_sticker_set(&mut self, short_name: &str) {
        if let Some(id) = self.sticker_index.get(short_name).copied() {
            self.drop_sticker_set(id);
        }
        self.sticker_ops
            .complete(&StickerKey::Set(short_name.to_string()), Ok(()));
        self.emit(MirrorEvent::StickerSetsChanged);
    }

    fn store_sticker_set(&mut self, record: &StickerSetRecord) {
        let set = StickerSet::from(record);
        self.sticker_index.insert(set.short_name.clone(), set.id);
        self.sticker_sets.upsert(set.id, set, Provenance::PullResponse);
        self.persist_sticker_set(&record.id);
    }

    fn drop_sticker_set(&mut self, id: StickerSetId) {
        self.sticker_index.retain(|_, indexed| *indexed != id);
        if self.sticker_sets.retire(&id) {
            self.store.delete(EntityKind::StickerSet, id.0.to_string());
            self.arm_graveyard();
        }
    }
}
