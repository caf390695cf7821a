//! Where downloaded media lives on disk.
//!
//! The layout is a pure function of the file's owner and location so a file
//! fetched before a restart is found again without a second download.

use std::path::{Path, PathBuf};

use shared::{
    domain::{Peer, UnifiedKey},
    protocol::{FileLocation, MediaKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnerKind {
    #[default]
    Message,
    UserPhoto,
    GroupPhoto,
    Sticker,
}

/// Explicit parentage of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileOwner {
    pub kind: OwnerKind,
    pub conversation: Option<Peer>,
    pub message: Option<UnifiedKey>,
    pub thumbnail: bool,
    pub media: Option<MediaKind>,
}

impl FileOwner {
    pub fn message(conversation: Peer, message: UnifiedKey, media: MediaKind) -> Self {
        let kind = if media == MediaKind::Sticker {
            OwnerKind::Sticker
        } else {
            OwnerKind::Message
        };
        Self {
            kind,
            conversation: Some(conversation),
            message: Some(message),
            thumbnail: false,
            media: Some(media),
        }
    }

    pub fn profile_photo(owner: Peer) -> Self {
        let kind = match owner {
            Peer::User(_) => OwnerKind::UserPhoto,
            _ => OwnerKind::GroupPhoto,
        };
        Self {
            kind,
            conversation: Some(owner),
            message: None,
            thumbnail: false,
            media: Some(MediaKind::Photo),
        }
    }

    pub fn thumbnail(mut self) -> Self {
        self.thumbnail = true;
        self
    }

    fn is_profile(&self) -> bool {
        matches!(self.kind, OwnerKind::UserPhoto | OwnerKind::GroupPhoto)
    }
}

pub fn media_path(
    root: &Path,
    owner: &FileOwner,
    location: &FileLocation,
    real_name: Option<&str>,
) -> PathBuf {
    let conversation = owner.conversation.map(|peer| peer.raw_id()).unwrap_or(0);
    let sticker = owner.kind == OwnerKind::Sticker;

    let mut dir = root.to_path_buf();
    if sticker {
        dir.push("sticker");
        if owner.thumbnail {
            dir.push("thumb");
        }
    } else {
        dir.push(conversation.to_string());
        if owner.thumbnail {
            dir.push("thumb");
        } else if owner.is_profile() {
            dir.push("profile");
        }
    }

    let stem = if sticker {
        None
    } else {
        real_name.map(file_stem).filter(|stem| !stem.is_empty())
    };
    let id_part = if location.access_hash != 0 {
        location.id.to_string()
    } else {
        format!("{}_{}", location.volume_id, location.local_id)
    };
    let mut file_name = match stem {
        Some(stem) => format!("{stem}_-_{id_part}"),
        None => id_part,
    };

    if let Some(extension) = extension_for(owner, real_name) {
        file_name.push('.');
        file_name.push_str(&extension);
    }

    dir.join(file_name)
}

fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) => &name[..dot],
        None => name,
    }
}

fn extension_for(owner: &FileOwner, real_name: Option<&str>) -> Option<String> {
    if owner.kind == OwnerKind::Sticker {
        return Some("webp".into());
    }
    if let Some(ext) = real_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
    {
        return Some(ext.to_ascii_lowercase());
    }
    if owner.thumbnail || owner.is_profile() || owner.media == Some(MediaKind::Photo) {
        return Some("jpg".into());
    }
    None
}

#[cfg(test)]
mod tests {
    use shared::domain::{unify, ChannelId, KeyScope, MessageId, UserId};

    use super::*;

    fn hashed(id: i64) -> FileLocation {
        FileLocation {
            dc_id: 2,
            id,
            volume_id: 0,
            local_id: 0,
            access_hash: 77,
        }
    }

    fn channel_owner(media: MediaKind) -> FileOwner {
        let peer = Peer::Channel(ChannelId(500));
        FileOwner::message(peer, unify(MessageId(1), KeyScope::Channel(ChannelId(500))), media)
    }

    #[test]
    fn document_keeps_real_name_stem_and_extension() {
        let path = media_path(
            Path::new("/cache"),
            &channel_owner(MediaKind::Document),
            &hashed(9001),
            Some("report.final.PDF"),
        );
        assert_eq!(path, PathBuf::from("/cache/500/report.final_-_9001.pdf"));
    }

    #[test]
    fn location_without_access_hash_uses_volume_and_local_id() {
        let location = FileLocation {
            dc_id: 1,
            id: 0,
            volume_id: 123,
            local_id: 45,
            access_hash: 0,
        };
        let owner = FileOwner::message(
            Peer::User(UserId(8)),
            unify(MessageId(3), KeyScope::Global),
            MediaKind::Photo,
        )
        .thumbnail();
        let path = media_path(Path::new("/cache"), &owner, &location, None);
        assert_eq!(path, PathBuf::from("/cache/8/thumb/123_45.jpg"));
    }

    #[test]
    fn stickers_share_one_directory_and_ignore_names() {
        let path = media_path(
            Path::new("/cache"),
            &channel_owner(MediaKind::Sticker),
            &hashed(42),
            Some("cat.png"),
        );
        assert_eq!(path, PathBuf::from("/cache/sticker/42.webp"));

        let thumb = media_path(
            Path::new("/cache"),
            &channel_owner(MediaKind::Sticker).thumbnail(),
            &hashed(42),
            None,
        );
        assert_eq!(thumb, PathBuf::from("/cache/sticker/thumb/42.webp"));
    }

    #[test]
    fn profile_photos_get_their_own_directory() {
        let owner = FileOwner::profile_photo(Peer::User(UserId(31)));
        let path = media_path(Path::new("/cache"), &owner, &hashed(7), None);
        assert_eq!(path, PathBuf::from("/cache/31/profile/7.jpg"));
    }

    #[test]
    fn derivation_is_stable() {
        let owner = channel_owner(MediaKind::Video);
        let a = media_path(Path::new("/d"), &owner, &hashed(1), Some("clip.mp4"));
        let b = media_path(Path::new("/d"), &owner, &hashed(1), Some("clip.mp4"));
        assert_eq!(a, b);
    }
}
