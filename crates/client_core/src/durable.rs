//! Write-through persistence of reconciled entities.
//!
//! The reconciliation core never awaits the database. It pushes [`StoreOp`]s
//! into a [`StoreSink`]; a background writer applies them in order.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use shared::domain::EntityKind;
use storage::{Storage, StoredEntity};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::entities::{Contact, Conversation, EncryptedSession, Group, Message, StickerSet, User};

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert(
        &self,
        kind: EntityKind,
        key: &str,
        scope: &str,
        body: &serde_json::Value,
    ) -> Result<()>;
    async fn delete(&self, kind: EntityKind, key: &str) -> Result<bool>;
    async fn delete_scope(&self, kind: EntityKind, scope: &str) -> Result<u64>;
    async fn find_all(&self, kind: EntityKind) -> Result<Vec<StoredEntity>>;
}

#[async_trait]
impl DurableStore for Storage {
    async fn upsert(
        &self,
        kind: EntityKind,
        key: &str,
        scope: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        self.upsert_entity(kind, key, scope, body).await
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> Result<bool> {
        self.delete_entity(kind, key).await
    }

    async fn delete_scope(&self, kind: EntityKind, scope: &str) -> Result<u64> {
        Storage::delete_scope(self, kind, scope).await
    }

    async fn find_all(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        self.list_entities(kind).await
    }
}

pub struct MissingDurableStore;

#[async_trait]
impl DurableStore for MissingDurableStore {
    async fn upsert(
        &self,
        _kind: EntityKind,
        _key: &str,
        _scope: &str,
        _body: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _kind: EntityKind, _key: &str) -> Result<bool> {
        Ok(false)
    }

    async fn delete_scope(&self, _kind: EntityKind, _scope: &str) -> Result<u64> {
        Ok(0)
    }

    async fn find_all(&self, _kind: EntityKind) -> Result<Vec<StoredEntity>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Upsert {
        kind: EntityKind,
        key: String,
        scope: String,
        body: serde_json::Value,
    },
    Delete {
        kind: EntityKind,
        key: String,
    },
    DeleteScope {
        kind: EntityKind,
        scope: String,
    },
}

/// Fire-and-forget handle to the store writer. A detached sink drops everything.
#[derive(Debug, Clone, Default)]
pub struct StoreSink {
    tx: Option<mpsc::UnboundedSender<StoreOp>>,
}

impl StoreSink {
    pub fn new(tx: mpsc::UnboundedSender<StoreOp>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StoreOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn upsert<T: Serialize>(&self, kind: EntityKind, key: String, scope: String, value: &T) {
        let body = match serde_json::to_value(value) {
            Ok(body) => body,
            Err(err) => {
                warn!(%kind, key = %key, error = %err, "durable: failed to encode entity");
                return;
            }
        };
        self.push(StoreOp::Upsert {
            kind,
            key,
            scope,
            body,
        });
    }

    pub fn delete(&self, kind: EntityKind, key: String) {
        self.push(StoreOp::Delete { kind, key });
    }

    pub fn delete_scope(&self, kind: EntityKind, scope: String) {
        self.push(StoreOp::DeleteScope { kind, scope });
    }

    fn push(&self, op: StoreOp) {
        if let Some(tx) = &self.tx {
            if tx.send(op).is_err() {
                warn!("durable: store writer stopped; dropping write");
            }
        }
    }
}

pub async fn run_store_writer(
    store: Arc<dyn DurableStore>,
    mut rx: mpsc::UnboundedReceiver<StoreOp>,
) {
    while let Some(op) = rx.recv().await {
        let outcome = match &op {
            StoreOp::Upsert {
                kind,
                key,
                scope,
                body,
            } => store.upsert(*kind, key, scope, body).await,
            StoreOp::Delete { kind, key } => store.delete(*kind, key).await.map(|_| ()),
            StoreOp::DeleteScope { kind, scope } => {
                store.delete_scope(*kind, scope).await.map(|removed| {
                    debug!(%kind, scope = %scope, removed, "durable: scope cleared");
                })
            }
        };
        if let Err(err) = outcome {
            warn!(?op, error = %err, "durable: write failed");
        }
    }
    debug!("durable: store writer finished");
}

/// Everything a warm start replays into memory.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub users: Vec<User>,
    pub groups: Vec<Group>,
    pub sessions: Vec<EncryptedSession>,
    pub sticker_sets: Vec<StickerSet>,
    pub contacts: Vec<Contact>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
            && self.messages.is_empty()
            && self.users.is_empty()
            && self.groups.is_empty()
            && self.sessions.is_empty()
            && self.sticker_sets.is_empty()
            && self.contacts.is_empty()
    }
}

pub async fn load_snapshot(store: &dyn DurableStore) -> Result<Snapshot> {
    Ok(Snapshot {
        conversations: load_kind(store, EntityKind::Conversation).await?,
        messages: load_kind(store, EntityKind::Message).await?,
        users: load_kind(store, EntityKind::User).await?,
        groups: load_kind(store, EntityKind::Group).await?,
        sessions: load_kind(store, EntityKind::EncryptedSession).await?,
        sticker_sets: load_kind(store, EntityKind::StickerSet).await?,
        contacts: load_kind(store, EntityKind::Contact).await?,
    })
}

async fn load_kind<T: DeserializeOwned>(store: &dyn DurableStore, kind: EntityKind) -> Result<Vec<T>> {
    let rows = store.find_all(kind).await?;
    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value(row.body) {
            Ok(value) => decoded.push(value),
            Err(err) => warn!(%kind, key = %row.key, error = %err, "durable: skipping undecodable row"),
        }
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use shared::domain::{Peer, UserId};

    use super::*;

    #[tokio::test]
    async fn writer_applies_ops_in_order_and_snapshot_reads_them_back() {
        let storage = Storage::new("sqlite::memory:").await.expect("storage");
        let store: Arc<dyn DurableStore> = Arc::new(storage);
        let (sink, rx) = StoreSink::channel();

        let user = User::stub(UserId(5));
        sink.upsert(EntityKind::User, "5".into(), String::new(), &user);
        sink.upsert(
            EntityKind::User,
            "6".into(),
            String::new(),
            &User::stub(UserId(6)),
        );
        sink.delete(EntityKind::User, "6".into());
        sink.upsert(
            EntityKind::Conversation,
            "user:5".into(),
            String::new(),
            &Conversation::local(Peer::User(UserId(5))),
        );
        let contact = Contact {
            user: UserId(5),
            mutual: true,
        };
        sink.upsert(EntityKind::Contact, "5".into(), String::new(), &contact);
        drop(sink);

        run_store_writer(store.clone(), rx).await;

        let snapshot = load_snapshot(store.as_ref()).await.expect("snapshot");
        assert_eq!(snapshot.users, vec![user]);
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.contacts, vec![contact]);
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn undecodable_rows_are_skipped() {
        let storage = Storage::new("sqlite::memory:").await.expect("storage");
        storage
            .upsert_entity(
                EntityKind::User,
                "bad",
                "",
                &serde_json::json!({"not": "a user"}),
            )
            .await
            .expect("seed");
        let snapshot = load_snapshot(&storage).await.expect("snapshot");
        assert!(snapshot.users.is_empty());
    }

    #[test]
    fn detached_sink_swallows_writes() {
        let sink = StoreSink::detached();
        sink.delete(EntityKind::Message, "g:1".into());
    }
}
