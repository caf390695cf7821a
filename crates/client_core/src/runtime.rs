//! The task that owns the [`Mirror`] and the handle used to reach it.
//!
//! Commands, protocol events, media completions and timer deadlines are all
//! funnelled into one `select!` loop, so reconciliation steps never overlap.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use shared::{
    domain::{GroupId, MessageId, Peer, TransferId, UnifiedKey, UserId},
    error::ProtocolError,
    protocol::{DialogListKind, FileLocation, InputContact, MediaKind, ProtocolEvent},
};
use storage::Storage;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, info};

use crate::{
    coalesce::Waiter,
    config::{prepare_database_url, MirrorSettings},
    durable::{load_snapshot, run_store_writer, DurableStore, StoreSink},
    entities::{Contact, Conversation, Message},
    error::{MirrorError, Result},
    gc::{MessageView, ViewId},
    media_io::{run_media_writer, MediaIoResult, MediaSink},
    media_path::FileOwner,
    protocol_client::ProtocolClient,
    Mirror, MirrorEvent,
};

type Job = Box<dyn FnOnce(&mut Mirror) + Send>;

pub enum Command {
    Apply(Job),
    Shutdown,
}

#[derive(Clone)]
pub struct MirrorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MirrorEvent>,
}

impl MirrorHandle {
    pub fn new(commands: mpsc::UnboundedSender<Command>, events: broadcast::Sender<MirrorEvent>) -> Self {
        Self { commands, events }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MirrorEvent> {
        self.events.subscribe()
    }

    /// Queues `job` without waiting for it to run.
    pub fn apply(&self, job: impl FnOnce(&mut Mirror) + Send + 'static) -> Result<()> {
        self.commands
            .send(Command::Apply(Box::new(job)))
            .map_err(|_| MirrorError::RuntimeClosed)
    }

    /// Runs `job` on the reconciliation task and returns its result.
    pub async fn query<R: Send + 'static>(
        &self,
        job: impl FnOnce(&mut Mirror) -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.apply(move |mirror| {
            let _ = tx.send(job(mirror));
        })?;
        rx.await.map_err(|_| MirrorError::RuntimeClosed)
    }

    /// Waits for a coalesced operation registered by `register`.
    async fn settled(&self, register: impl FnOnce(&mut Mirror, Waiter) + Send + 'static) -> Result<()> {
        let (tx, rx) = oneshot::channel::<std::result::Result<(), ProtocolError>>();
        self.apply(move |mirror| register(mirror, tx))?;
        rx.await
            .map_err(|_| MirrorError::RuntimeClosed)?
            .map_err(MirrorError::from)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn set_me(&self, me: UserId) -> Result<()> {
        self.apply(move |mirror| mirror.set_me(me))
    }

    pub async fn refresh_dialogs(&self, kind: DialogListKind) -> Result<()> {
        self.settled(move |mirror, waiter| mirror.refresh_dialogs(kind, Some(waiter)))
            .await
    }

    pub async fn mark_read(&self, peer: Peer) -> Result<()> {
        self.settled(move |mirror, waiter| mirror.mark_read(peer, Some(waiter)))
            .await
    }

    pub async fn refresh_stickers(&self) -> Result<()> {
        self.settled(|mirror, waiter| mirror.refresh_stickers(Some(waiter)))
            .await
    }

    pub async fn install_sticker_set(&self, short_name: String) -> Result<()> {
        self.settled(move |mirror, waiter| mirror.install_sticker_set(short_name, Some(waiter)))
            .await
    }

    pub async fn uninstall_sticker_set(&self, short_name: String) -> Result<()> {
        self.settled(move |mirror, waiter| mirror.uninstall_sticker_set(short_name, Some(waiter)))
            .await
    }

    pub async fn send_message(
        &self,
        peer: Peer,
        body: String,
        reply_to: Option<MessageId>,
    ) -> Result<Option<UnifiedKey>> {
        self.query(move |mirror| mirror.send_message(peer, body, reply_to))
            .await
    }

    pub async fn send_media(
        &self,
        peer: Peer,
        local_path: PathBuf,
        kind: MediaKind,
        caption: String,
    ) -> Result<Option<(UnifiedKey, TransferId)>> {
        self.query(move |mirror| mirror.send_media(peer, local_path, kind, caption))
            .await
    }

    pub async fn start_download(
        &self,
        owner: FileOwner,
        location: FileLocation,
        size: i64,
        real_name: Option<String>,
    ) -> Result<Option<TransferId>> {
        self.query(move |mirror| mirror.start_download(owner, location, size, real_name.as_deref()))
            .await
    }

    pub async fn cancel_transfer(&self, transfer: TransferId) -> Result<bool> {
        self.query(move |mirror| mirror.cancel_transfer(transfer)).await
    }

    pub fn load_history(&self, peer: Peer, offset_id: MessageId, limit: i32) -> Result<()> {
        self.apply(move |mirror| mirror.load_history(peer, offset_id, limit))
    }

    pub fn delete_history(&self, peer: Peer, delete_chat: bool) -> Result<()> {
        self.apply(move |mirror| mirror.delete_history(peer, delete_chat))
    }

    pub fn mute(&self, peer: Peer, muted: bool) -> Result<()> {
        self.apply(move |mirror| {
            if muted {
                mirror.mute(peer)
            } else {
                mirror.unmute(peer)
            }
        })
    }

    pub fn set_blocked(&self, user: UserId, blocked: bool) -> Result<()> {
        self.apply(move |mirror| {
            if blocked {
                mirror.block(user)
            } else {
                mirror.unblock(user)
            }
        })
    }

    pub fn request_secret_chat(&self, user: UserId) -> Result<()> {
        self.apply(move |mirror| mirror.request_secret_chat(user))
    }

    pub fn search(&self, query: String, peer: Option<Peer>, limit: i32) -> Result<()> {
        self.apply(move |mirror| mirror.search(query, peer, limit))
    }

    pub fn clear_search(&self) -> Result<()> {
        self.apply(|mirror| mirror.clear_search())
    }

    /// Asks for a cleanup sweep after the configured delay.
    pub fn schedule_sweep(&self) -> Result<()> {
        self.apply(|mirror| mirror.schedule_sweep())
    }

    pub fn refresh_contacts(&self) -> Result<()> {
        self.apply(|mirror| mirror.refresh_contacts())
    }

    pub fn add_contacts(&self, contacts: Vec<InputContact>) -> Result<()> {
        self.apply(move |mirror| mirror.add_contacts(contacts))
    }

    pub async fn forward_messages(
        &self,
        from: Peer,
        ids: Vec<MessageId>,
        to: Peer,
    ) -> Result<Vec<UnifiedKey>> {
        self.query(move |mirror| mirror.forward_messages(from, ids, to))
            .await
    }

    pub async fn create_group(&self, users: Vec<UserId>, title: String) -> Result<bool> {
        self.query(move |mirror| mirror.create_group(users, title)).await
    }

    pub async fn add_group_member(&self, group: GroupId, user: UserId, forward_limit: i32) -> Result<bool> {
        self.query(move |mirror| mirror.add_group_member(group, user, forward_limit))
            .await
    }

    pub fn edit_group_title(&self, group: GroupId, title: String) -> Result<()> {
        self.apply(move |mirror| mirror.edit_group_title(group, title))
    }

    pub fn set_typing(&self, peer: Peer, typing: bool) -> Result<()> {
        self.apply(move |mirror| mirror.set_typing(peer, typing))
    }

    pub fn catch_up_channel(&self, peer: Peer) -> Result<()> {
        self.apply(move |mirror| mirror.catch_up_channel(peer))
    }

    pub async fn register_view(&self, view: Arc<dyn MessageView>) -> Result<ViewId> {
        self.query(move |mirror| mirror.register_view(view)).await
    }

    pub async fn unregister_view(&self, id: ViewId) -> Result<bool> {
        self.query(move |mirror| mirror.unregister_view(id)).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.query(|mirror| {
            mirror
                .conversation_list()
                .iter()
                .map(|peer| mirror.conversation(peer).clone())
                .collect()
        })
        .await
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        self.query(|mirror| mirror.contact_list()).await
    }

    pub async fn messages(&self, peer: Peer) -> Result<Vec<Message>> {
        self.query(move |mirror| {
            mirror
                .messages_of(&peer)
                .iter()
                .map(|key| mirror.message(key).clone())
                .collect()
        })
        .await
    }
}

pub async fn run(
    mut mirror: Mirror,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut protocol_events: mpsc::UnboundedReceiver<ProtocolEvent>,
    mut media_results: mpsc::UnboundedReceiver<MediaIoResult>,
) {
    let mut protocol_open = true;
    let mut media_open = true;
    loop {
        let deadline = mirror.next_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Apply(job)) => job(&mut mirror),
                Some(Command::Shutdown) | None => break,
            },
            event = protocol_events.recv(), if protocol_open => match event {
                Some(event) => mirror.handle_protocol_event(event),
                None => {
                    info!("runtime: protocol event stream closed");
                    protocol_open = false;
                }
            },
            result = media_results.recv(), if media_open => match result {
                Some(result) => mirror.on_media_io(result),
                None => {
                    debug!("runtime: media writer stopped");
                    media_open = false;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                mirror.fire_due_timers(Instant::now());
            }
        }
    }
    info!("runtime: reconciliation task stopped");
}

/// Opens the configured database and starts the runtime on it.
pub async fn spawn(
    settings: MirrorSettings,
    protocol: Arc<dyn ProtocolClient>,
    protocol_events: mpsc::UnboundedReceiver<ProtocolEvent>,
) -> anyhow::Result<MirrorHandle> {
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open durable store at {database_url}"))?;
    spawn_with_store(settings, protocol, Arc::new(storage), protocol_events).await
}

/// Replays the warm-start snapshot, starts the writer tasks and the
/// reconciliation loop, and issues the first requests.
pub async fn spawn_with_store(
    settings: MirrorSettings,
    protocol: Arc<dyn ProtocolClient>,
    store: Arc<dyn DurableStore>,
    protocol_events: mpsc::UnboundedReceiver<ProtocolEvent>,
) -> anyhow::Result<MirrorHandle> {
    let snapshot = load_snapshot(store.as_ref())
        .await
        .context("failed to load warm-start snapshot")?;

    let (store_sink, store_ops) = StoreSink::channel();
    tokio::spawn(run_store_writer(store, store_ops));
    let (media_sink, media_ops) = MediaSink::channel();
    let (media_tx, media_results) = mpsc::unbounded_channel();
    tokio::spawn(run_media_writer(media_ops, media_tx));

    let mut mirror = Mirror::new(settings, protocol)
        .with_store_sink(store_sink)
        .with_media_sink(media_sink);
    mirror.replay(snapshot);
    mirror.start();

    let (commands, command_rx) = mpsc::unbounded_channel();
    let handle = MirrorHandle::new(commands, mirror.event_sender());
    tokio::spawn(run(mirror, command_rx, protocol_events, media_results));
    Ok(handle)
}
