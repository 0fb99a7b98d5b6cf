//! Hub actor implementation
//!
//! The central actor that owns every registry: clients, the per-user and
//! per-channel indices, and presence. Commands are applied one at a time in
//! arrival order, so none of that state needs a lock and a broadcast always
//! observes every subscription submitted before it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::HubConfig;
use crate::error::{AppError, ConfigError, DeliveryOutcome, DropReason, ProtocolError};
use crate::message::{ClientCommand, Frame, InboundFrame, ServerMessage};
use crate::presence::{PresenceRecord, PresenceStatus, PresenceTracker};
use crate::types::{ChannelId, ClientId, MessageId, UserId};

/// Commands sent to the Hub actor
#[derive(Debug)]
pub enum HubCommand {
    /// Admit a new connection (auto-joins `client.channels`)
    Register { client: Client },
    /// Connection closed; idempotent
    Unregister { client_id: ClientId },
    Subscribe {
        client_id: ClientId,
        channel_id: ChannelId,
    },
    Unsubscribe {
        client_id: ClientId,
        channel_id: ChannelId,
    },
    BroadcastToChannel {
        channel_id: ChannelId,
        message: ServerMessage,
    },
    /// Deliver to every connection of one user
    BroadcastToUser {
        user_id: UserId,
        message: ServerMessage,
    },
    /// Channel fan-out that skips the typing user's own connections
    BroadcastTyping {
        user_id: UserId,
        channel_id: ChannelId,
        is_typing: bool,
    },
    /// Point-to-point notice to the original sender's connections
    SendReadReceipt {
        message_id: MessageId,
        channel_id: ChannelId,
        reader_id: UserId,
        sender_id: UserId,
    },
    /// Decoded frame from a client's reader pump
    Inbound {
        client_id: ClientId,
        frame: InboundFrame,
    },
    /// Undecodable frame; answered with an `error` envelope
    Rejected {
        client_id: ClientId,
        error: ProtocolError,
    },
    /// Keepalive traffic seen on the connection
    Touch { client_id: ClientId },
    /// Evict idle clients and collect stale presence
    Cleanup,
    GetPresence {
        user_id: UserId,
        reply: oneshot::Sender<Option<PresenceRecord>>,
    },
    Stats { reply: oneshot::Sender<HubStats> },
    UserConnectionCount {
        user_id: UserId,
        reply: oneshot::Sender<usize>,
    },
    ChannelMembers {
        channel_id: ChannelId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
}

impl HubCommand {
    fn kind(&self) -> &'static str {
        match self {
            HubCommand::Register { .. } => "register",
            HubCommand::Unregister { .. } => "unregister",
            HubCommand::Subscribe { .. } => "subscribe",
            HubCommand::Unsubscribe { .. } => "unsubscribe",
            HubCommand::BroadcastToChannel { .. } => "broadcast_to_channel",
            HubCommand::BroadcastToUser { .. } => "broadcast_to_user",
            HubCommand::BroadcastTyping { .. } => "broadcast_typing",
            HubCommand::SendReadReceipt { .. } => "send_read_receipt",
            HubCommand::Inbound { .. } => "inbound",
            HubCommand::Rejected { .. } => "rejected",
            HubCommand::Touch { .. } => "touch",
            HubCommand::Cleanup => "cleanup",
            HubCommand::GetPresence { .. } => "get_presence",
            HubCommand::Stats { .. } => "stats",
            HubCommand::UserConnectionCount { .. } => "user_connection_count",
            HubCommand::ChannelMembers { .. } => "channel_members",
        }
    }
}

/// Why a client left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Transport closed or failed
    Closed,
    /// Outbound queue could not take another frame
    Dropped(DropReason),
    /// No activity within the inactivity timeout
    Inactive,
}

/// Per-operation delivery tally
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: Vec<(ClientId, DropReason)>,
}

/// Registry sizes, answered through the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub clients: usize,
    pub users: usize,
    pub channels: usize,
    pub presence_records: usize,
}

/// The Hub actor
pub struct Hub {
    config: HubConfig,
    /// All registered connections: ClientId -> Client
    clients: HashMap<ClientId, Client>,
    /// Connections per user
    users: HashMap<UserId, HashSet<ClientId>>,
    /// Connections per channel
    channels: HashMap<ChannelId, HashSet<ClientId>>,
    presence: PresenceTracker,
    /// Clients whose queue overflowed during the current operation
    evictions: VecDeque<(ClientId, DropReason)>,
    doomed: HashSet<ClientId>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Create a new Hub with the given command receiver
    pub fn new(config: HubConfig, receiver: mpsc::Receiver<HubCommand>) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            users: HashMap::new(),
            channels: HashMap::new(),
            presence: PresenceTracker::new(),
            evictions: VecDeque::new(),
            doomed: HashSet::new(),
            receiver,
        }
    }

    /// Validate `config`, build a hub with a bounded command queue and
    /// start its loop
    pub fn spawn(config: HubConfig) -> Result<(HubHandle, JoinHandle<()>), ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.command_queue_size);
        let hub = Hub::new(config, rx);
        Ok((HubHandle::new(tx), tokio::spawn(hub.run())))
    }

    /// Run the Hub event loop
    ///
    /// Processes commands until every handle is dropped. Cleanup is
    /// driven by an interval timer inside the same loop.
    pub async fn run(mut self) {
        info!("Hub started");

        let period = self.config.cleanup_interval();
        let mut cleanup = interval_at(Instant::now() + period, period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.dispatch(cmd),
                    None => break,
                },
                _ = cleanup.tick() => self.dispatch(HubCommand::Cleanup),
            }
        }

        info!(clients = self.clients.len(), "Hub shutting down");
    }

    /// Apply one command; a panic is logged and the loop keeps going
    fn dispatch(&mut self, cmd: HubCommand) {
        let kind = cmd.kind();
        self.guarded(kind, |hub| hub.handle_command(cmd));
    }

    fn guarded(&mut self, kind: &'static str, op: impl FnOnce(&mut Self)) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| op(self)));
        if let Err(payload) = outcome {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(command = kind, %reason, "hub operation panicked");
        }
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { client } => self.handle_register(client),
            HubCommand::Unregister { client_id } => {
                self.unregister(client_id, DisconnectReason::Closed);
            }
            HubCommand::Subscribe {
                client_id,
                channel_id,
            } => {
                self.subscribe(client_id, channel_id);
            }
            HubCommand::Unsubscribe {
                client_id,
                channel_id,
            } => {
                self.unsubscribe(client_id, channel_id);
            }
            HubCommand::BroadcastToChannel {
                channel_id,
                message,
            } => {
                self.broadcast_to_channel(channel_id, message);
            }
            HubCommand::BroadcastToUser { user_id, message } => {
                self.broadcast_to_user(user_id, message);
            }
            HubCommand::BroadcastTyping {
                user_id,
                channel_id,
                is_typing,
            } => {
                self.broadcast_typing(user_id, channel_id, is_typing);
            }
            HubCommand::SendReadReceipt {
                message_id,
                channel_id,
                reader_id,
                sender_id,
            } => {
                self.send_read_receipt(message_id, channel_id, reader_id, sender_id);
            }
            HubCommand::Inbound { client_id, frame } => self.handle_inbound(client_id, frame),
            HubCommand::Rejected { client_id, error } => {
                self.touch(client_id);
                debug!(client = %client_id, %error, "rejected inbound frame");
                self.send_to(client_id, error.into());
            }
            HubCommand::Touch { client_id } => self.touch(client_id),
            HubCommand::Cleanup => self.cleanup(),
            HubCommand::GetPresence { user_id, reply } => {
                let _ = reply.send(self.presence.get(user_id).cloned());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            HubCommand::UserConnectionCount { user_id, reply } => {
                let _ = reply.send(self.users.get(&user_id).map_or(0, HashSet::len));
            }
            HubCommand::ChannelMembers { channel_id, reply } => {
                let _ = reply.send(self.channel_members(channel_id));
            }
        }

        self.settle();
    }

    /// Handle new client registration
    fn handle_register(&mut self, client: Client) {
        let client_id = client.id;
        let user_id = client.user_id;

        if self.clients.contains_key(&client_id) {
            warn!(client = %client_id, "duplicate registration ignored");
            return;
        }

        for channel_id in &client.channels {
            self.channels.entry(*channel_id).or_default().insert(client_id);
        }
        let connections = self.users.entry(user_id).or_default();
        let first = connections.is_empty();
        connections.insert(client_id);

        info!(
            client = %client_id,
            user = %user_id,
            origin = %client.origin,
            channels = client.channels.len(),
            "client registered"
        );
        self.clients.insert(client_id, client);

        if first {
            let msg = ServerMessage::presence(self.presence.set_status(
                user_id,
                PresenceStatus::Online,
                "",
            ));
            self.broadcast_all(msg);
        } else {
            self.presence.touch(user_id);
        }

        let roster = ServerMessage::BulkPresence {
            presences: self.presence.snapshot(),
            timestamp: crate::message::now_unix(),
        };
        self.send_to(client_id, roster);

        debug!(
            "Total clients: {}, users: {}, channels: {}",
            self.clients.len(),
            self.users.len(),
            self.channels.len()
        );
    }

    /// Remove a client from every index and close its connection
    fn unregister(&mut self, client_id: ClientId, reason: DisconnectReason) {
        let Some(client) = self.clients.remove(&client_id) else {
            return;
        };
        let user_id = client.user_id;

        for channel_id in &client.channels {
            self.detach(client_id, *channel_id);
        }

        let last = match self.users.get_mut(&user_id) {
            Some(connections) => {
                connections.remove(&client_id);
                connections.is_empty()
            }
            None => true,
        };

        let session_secs = (Utc::now() - client.connected_at).num_seconds();
        info!(client = %client_id, user = %user_id, ?reason, session_secs, "client unregistered");
        // Dropping the client fires its close signal and ends both pumps.
        drop(client);

        if last {
            self.users.remove(&user_id);
            let msg = ServerMessage::presence(self.presence.set_status(
                user_id,
                PresenceStatus::Offline,
                "",
            ));
            self.broadcast_all(msg);
        }
    }

    /// Join a channel; returns false if already a member or unknown client
    fn subscribe(&mut self, client_id: ClientId, channel_id: ChannelId) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        if !client.channels.insert(channel_id) {
            return false;
        }
        self.channels.entry(channel_id).or_default().insert(client_id);
        debug!(client = %client_id, channel = %channel_id, "subscribed");
        true
    }

    /// Leave a channel; returns false if not a member or unknown client
    fn unsubscribe(&mut self, client_id: ClientId, channel_id: ChannelId) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        if !client.channels.remove(&channel_id) {
            return false;
        }
        self.detach(client_id, channel_id);
        debug!(client = %client_id, channel = %channel_id, "unsubscribed");
        true
    }

    fn detach(&mut self, client_id: ClientId, channel_id: ChannelId) {
        if let Some(members) = self.channels.get_mut(&channel_id) {
            members.remove(&client_id);
            if members.is_empty() {
                self.channels.remove(&channel_id);
            }
        }
    }

    fn broadcast_to_channel(&mut self, channel_id: ChannelId, message: ServerMessage) -> FanOut {
        let targets: Vec<ClientId> = self
            .channels
            .get(&channel_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        self.fan_out(targets, message)
    }

    fn broadcast_to_user(&mut self, user_id: UserId, message: ServerMessage) -> FanOut {
        let targets: Vec<ClientId> = self
            .users
            .get(&user_id)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default();
        self.fan_out(targets, message)
    }

    fn broadcast_typing(&mut self, user_id: UserId, channel_id: ChannelId, is_typing: bool) -> FanOut {
        let targets: Vec<ClientId> = match self.channels.get(&channel_id) {
            Some(members) => members
                .iter()
                .filter(|id| self.clients.get(*id).is_some_and(|c| c.user_id != user_id))
                .copied()
                .collect(),
            None => Vec::new(),
        };
        self.fan_out(targets, ServerMessage::typing(user_id, channel_id, is_typing))
    }

    fn send_read_receipt(
        &mut self,
        message_id: MessageId,
        channel_id: ChannelId,
        reader_id: UserId,
        sender_id: UserId,
    ) -> FanOut {
        let receipt = ServerMessage::read_receipt(message_id, channel_id, reader_id, sender_id);
        self.broadcast_to_user(sender_id, receipt)
    }

    /// Presence goes to every connected client, not just channel peers
    fn broadcast_all(&mut self, message: ServerMessage) -> FanOut {
        let targets: Vec<ClientId> = self.clients.keys().copied().collect();
        self.fan_out(targets, message)
    }

    fn send_to(&mut self, client_id: ClientId, message: ServerMessage) -> FanOut {
        self.fan_out([client_id], message)
    }

    /// Push one shared frame to each target without blocking
    ///
    /// A target that cannot take the frame is queued for eviction and
    /// skipped by any later fan-out in the same operation.
    fn fan_out(
        &mut self,
        targets: impl IntoIterator<Item = ClientId>,
        message: ServerMessage,
    ) -> FanOut {
        let kind = message.kind();
        let frame = Frame::new(message);
        let mut report = FanOut::default();

        for client_id in targets {
            if self.doomed.contains(&client_id) {
                continue;
            }
            let Some(client) = self.clients.get(&client_id) else {
                continue;
            };
            match client.try_deliver(frame.clone()) {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Dropped(reason) => {
                    warn!(client = %client_id, user = %client.user_id, %reason, envelope = kind, "dropping client");
                    self.doomed.insert(client_id);
                    self.evictions.push_back((client_id, reason));
                    report.dropped.push((client_id, reason));
                }
            }
        }

        report
    }

    /// Unregister every client that overflowed during this operation
    fn settle(&mut self) {
        while let Some((client_id, reason)) = self.evictions.pop_front() {
            self.doomed.remove(&client_id);
            self.unregister(client_id, DisconnectReason::Dropped(reason));
        }
    }

    fn touch(&mut self, client_id: ClientId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.touch();
            self.presence.touch(client.user_id);
        }
    }

    /// Apply a decoded client command
    fn handle_inbound(&mut self, client_id: ClientId, frame: InboundFrame) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        client.touch();
        let user_id = client.user_id;
        self.presence.touch(user_id);

        let kind = frame.command.kind();
        debug!(client = %client_id, command = kind, sent_at = ?frame.timestamp, "inbound command");
        let result: Result<bool, ProtocolError> = match frame.command {
            ClientCommand::Subscribe(p) => {
                self.subscribe(client_id, p.channel_id);
                Ok(true)
            }
            ClientCommand::Unsubscribe(p) => {
                self.unsubscribe(client_id, p.channel_id);
                Ok(true)
            }
            ClientCommand::SendMessage(p) => {
                let no_attachments = p.attachments.as_ref().map_or(true, Vec::is_empty);
                if p.content.trim().is_empty() && no_attachments {
                    Err(ProtocolError::EmptyContent)
                } else if !self.is_member(client_id, p.channel_id) {
                    Err(ProtocolError::NotSubscribed(p.channel_id))
                } else {
                    let msg = ServerMessage::chat(p.channel_id, user_id, p.content, p.attachments);
                    self.broadcast_to_channel(p.channel_id, msg);
                    Ok(true)
                }
            }
            ClientCommand::UpdatePresence(p) if p.status == PresenceStatus::Offline => {
                Err(ProtocolError::ReservedStatus(p.status))
            }
            ClientCommand::UpdatePresence(p) => {
                let msg = ServerMessage::presence(self.presence.set_status(
                    user_id,
                    p.status,
                    p.status_msg.unwrap_or_default(),
                ));
                info!(user = %user_id, status = %p.status, "presence updated");
                self.broadcast_all(msg);
                Ok(true)
            }
            ClientCommand::Typing(p) => {
                if self.is_member(client_id, p.channel_id) {
                    self.broadcast_typing(user_id, p.channel_id, p.is_typing);
                    Ok(false)
                } else {
                    Err(ProtocolError::NotSubscribed(p.channel_id))
                }
            }
            ClientCommand::ReadReceipt(p) => {
                self.send_read_receipt(p.message_id, p.channel_id, user_id, p.message_sender_id);
                Ok(true)
            }
        };

        match result {
            Ok(true) => {
                self.send_to(client_id, ServerMessage::ack(kind, frame.data));
            }
            Ok(false) => {}
            Err(error) => {
                debug!(client = %client_id, %error, command = kind, "command refused");
                self.send_to(client_id, error.into());
            }
        }
    }

    fn is_member(&self, client_id: ClientId, channel_id: ChannelId) -> bool {
        self.clients
            .get(&client_id)
            .is_some_and(|c| c.is_subscribed(channel_id))
    }

    /// Evict idle clients and collect stale offline presence
    fn cleanup(&mut self) {
        let timeout = self.config.inactivity_timeout();
        let now = Instant::now();
        let idle: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| now.saturating_duration_since(c.last_activity) > timeout)
            .map(|c| c.id)
            .collect();

        for client_id in idle {
            warn!(client = %client_id, "evicting inactive client");
            self.unregister(client_id, DisconnectReason::Inactive);
        }

        let collected = self.presence.gc(self.config.presence_retention());
        debug!(
            clients = self.clients.len(),
            presence_collected = collected,
            "cleanup finished"
        );
    }

    fn channel_members(&self, channel_id: ChannelId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .channels
            .get(&channel_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.clients.get(id).map(|c| c.user_id))
            .collect();
        users.sort();
        users.dedup();
        users
    }

    fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            users: self.users.len(),
            channels: self.channels.len(),
            presence_records: self.presence.len(),
        }
    }
}

/// Cloneable entry point to a running hub
///
/// Every method enqueues one command; queries wait for the loop's reply.
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::HubClosed)
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| AppError::HubClosed)
    }

    /// Register a client; returns its id for later commands
    pub async fn register(&self, client: Client) -> Result<ClientId, AppError> {
        let client_id = client.id;
        self.send(HubCommand::Register { client }).await?;
        Ok(client_id)
    }

    pub async fn unregister(&self, client_id: ClientId) -> Result<(), AppError> {
        self.send(HubCommand::Unregister { client_id }).await
    }

    pub async fn subscribe(&self, client_id: ClientId, channel_id: ChannelId) -> Result<(), AppError> {
        self.send(HubCommand::Subscribe {
            client_id,
            channel_id,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        client_id: ClientId,
        channel_id: ChannelId,
    ) -> Result<(), AppError> {
        self.send(HubCommand::Unsubscribe {
            client_id,
            channel_id,
        })
        .await
    }

    pub async fn broadcast_to_channel(
        &self,
        channel_id: ChannelId,
        message: ServerMessage,
    ) -> Result<(), AppError> {
        self.send(HubCommand::BroadcastToChannel {
            channel_id,
            message,
        })
        .await
    }

    pub async fn broadcast_to_user(
        &self,
        user_id: UserId,
        message: ServerMessage,
    ) -> Result<(), AppError> {
        self.send(HubCommand::BroadcastToUser { user_id, message }).await
    }

    pub async fn broadcast_typing(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        is_typing: bool,
    ) -> Result<(), AppError> {
        self.send(HubCommand::BroadcastTyping {
            user_id,
            channel_id,
            is_typing,
        })
        .await
    }

    pub async fn send_read_receipt(
        &self,
        message_id: MessageId,
        channel_id: ChannelId,
        reader_id: UserId,
        sender_id: UserId,
    ) -> Result<(), AppError> {
        self.send(HubCommand::SendReadReceipt {
            message_id,
            channel_id,
            reader_id,
            sender_id,
        })
        .await
    }

    pub async fn inbound(&self, client_id: ClientId, frame: InboundFrame) -> Result<(), AppError> {
        self.send(HubCommand::Inbound { client_id, frame }).await
    }

    pub async fn reject(&self, client_id: ClientId, error: ProtocolError) -> Result<(), AppError> {
        self.send(HubCommand::Rejected { client_id, error }).await
    }

    pub async fn touch(&self, client_id: ClientId) -> Result<(), AppError> {
        self.send(HubCommand::Touch { client_id }).await
    }

    /// Run a cleanup pass now instead of waiting for the timer
    pub async fn cleanup(&self) -> Result<(), AppError> {
        self.send(HubCommand::Cleanup).await
    }

    pub async fn presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>, AppError> {
        self.query(|reply| HubCommand::GetPresence { user_id, reply })
            .await
    }

    pub async fn stats(&self) -> Result<HubStats, AppError> {
        self.query(|reply| HubCommand::Stats { reply }).await
    }

    pub async fn user_connection_count(&self, user_id: UserId) -> Result<usize, AppError> {
        self.query(|reply| HubCommand::UserConnectionCount { user_id, reply })
            .await
    }

    /// Distinct users with at least one connection subscribed to the channel
    pub async fn channel_members(&self, channel_id: ChannelId) -> Result<Vec<UserId>, AppError> {
        self.query(|reply| HubCommand::ChannelMembers { channel_id, reply })
            .await
    }
}
