use crate::config::TransportConfig;
use crate::error::{Result, TeamError};
use crate::protocol::{AuthPayload, AuthResultPayload, Event, EventType, MemberStatusPayload};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receives inbound member events on the leader, including the synthetic
/// `member_online` / `member_offline` ones.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, team_id: &str, member_id: &str, event: Event);
}

struct MemberConn {
    conn_id: u64,
    member_name: String,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

struct Room {
    cancel: CancellationToken,
    members: HashMap<String, MemberConn>,
}

/// Accept side of team connections. One room per team this peer leads.
pub struct LeaderHub {
    config: TransportConfig,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    rooms: RwLock<HashMap<String, Room>>,
    next_conn: AtomicU64,
    root: CancellationToken,
}

impl LeaderHub {
    pub fn new(config: TransportConfig, root: CancellationToken) -> Self {
        Self {
            config,
            handler: RwLock::new(None),
            rooms: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            root,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut h) = self.handler.write() {
            *h = Some(handler);
        }
    }

    fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        self.handler.read().ok().and_then(|h| h.clone())
    }

    fn rooms_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Room>> {
        self.rooms.read().unwrap_or_else(|p| p.into_inner())
    }

    fn rooms_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Room>> {
        self.rooms.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Starts accepting connections for `team_id`.
    pub fn open_team(&self, team_id: &str) {
        self.rooms_write()
            .entry(team_id.to_string())
            .or_insert_with(|| Room {
                cancel: self.root.child_token(),
                members: HashMap::new(),
            });
    }

    pub fn is_open(&self, team_id: &str) -> bool {
        self.rooms_read().contains_key(team_id)
    }

    /// Drops every connection of the team and stops accepting new ones.
    pub fn close_team(&self, team_id: &str) {
        if let Some(room) = self.rooms_write().remove(team_id) {
            room.cancel.cancel();
            tracing::info!(team_id, members = room.members.len(), "Closed team hub");
        }
    }

    pub fn close(&self) {
        let rooms: Vec<Room> = self.rooms_write().drain().map(|(_, r)| r).collect();
        for room in rooms {
            room.cancel.cancel();
        }
    }

    pub fn connected_members(&self, team_id: &str) -> Vec<String> {
        self.rooms_read()
            .get(team_id)
            .map(|r| r.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, team_id: &str, member_id: &str) -> bool {
        self.rooms_read()
            .get(team_id)
            .map(|r| r.members.contains_key(member_id))
            .unwrap_or(false)
    }

    /// Waits (up to `grace`) for queued frames to reach the sockets, then
    /// closes the team.
    pub async fn close_team_when_drained(&self, team_id: &str, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline && !self.queues_empty(team_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.close_team(team_id);
    }

    fn queues_empty(&self, team_id: &str) -> bool {
        self.rooms_read()
            .get(team_id)
            .map(|r| {
                r.members
                    .values()
                    .all(|c| c.tx.is_closed() || c.tx.capacity() == c.tx.max_capacity())
            })
            .unwrap_or(true)
    }

    /// Sends to every connected member. Members with a full queue miss this
    /// event. Returns how many queues accepted it.
    pub fn broadcast(&self, team_id: &str, event: &Event) -> Result<usize> {
        self.broadcast_except(team_id, event, None)
    }

    pub fn broadcast_except(
        &self,
        team_id: &str,
        event: &Event,
        except: Option<&str>,
    ) -> Result<usize> {
        let json = event.to_json()?;
        let rooms = self.rooms_read();
        let Some(room) = rooms.get(team_id) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for (member_id, conn) in &room.members {
            if Some(member_id.as_str()) == except {
                continue;
            }
            match conn.tx.try_send(Message::Text(json.clone().into())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(team_id, %member_id, kind = %event.kind, "Send buffer full, skipping member");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(team_id, %member_id, "Member queue closed");
                }
            }
        }
        Ok(delivered)
    }

    pub fn send_to_member(&self, team_id: &str, member_id: &str, event: &Event) -> Result<()> {
        let json = event.to_json()?;
        let rooms = self.rooms_read();
        let conn = rooms
            .get(team_id)
            .and_then(|r| r.members.get(member_id))
            .ok_or(TeamError::NotConnected)?;
        conn.tx
            .try_send(Message::Text(json.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TeamError::SendBufferFull,
                mpsc::error::TrySendError::Closed(_) => TeamError::NotConnected,
            })
    }

    /// Adds a connection, replacing any previous one for the same member.
    fn register(
        &self,
        team_id: &str,
        member_id: &str,
        member_name: &str,
    ) -> Option<(u64, mpsc::Receiver<Message>, CancellationToken)> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);

        let mut rooms = self.rooms_write();
        let room = rooms.get_mut(team_id)?;
        let cancel = room.cancel.child_token();
        let previous = room.members.insert(
            member_id.to_string(),
            MemberConn {
                conn_id,
                member_name: member_name.to_string(),
                tx,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = previous {
            tracing::info!(team_id, member_id, "Replacing existing connection");
            old.cancel.cancel();
        }
        Some((conn_id, rx, cancel))
    }

    /// Removes the connection only if it is still the registered one.
    fn unregister(&self, team_id: &str, member_id: &str, conn_id: u64) -> Option<String> {
        let mut rooms = self.rooms_write();
        let room = rooms.get_mut(team_id)?;
        match room.members.get(member_id) {
            Some(conn) if conn.conn_id == conn_id => {
                room.members.remove(member_id).map(|c| c.member_name)
            }
            _ => None,
        }
    }

    fn emit_status(&self, team_id: &str, auth: &AuthPayload, online: bool) {
        let Some(handler) = self.handler() else { return };
        let kind = if online {
            EventType::MemberOnline
        } else {
            EventType::MemberOffline
        };
        let payload = MemberStatusPayload {
            member_id: auth.member_id.clone(),
            member_name: auth.member_name.clone(),
            endpoint: auth.endpoint.clone(),
            is_online: online,
        };
        match Event::new(kind, team_id, &payload) {
            Ok(event) => handler.handle_event(team_id, &auth.member_id, event),
            Err(e) => tracing::warn!(error = %e, "Failed to build status event"),
        }
    }

    /// Runs one accepted socket until it closes.
    pub async fn serve(self: Arc<Self>, mut socket: WebSocket, team_id: String) {
        let auth = match self.authenticate(&mut socket, &team_id).await {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(%team_id, error = %e, "Rejected team connection");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        };

        let Some((conn_id, rx, cancel)) =
            self.register(&team_id, &auth.member_id, &auth.member_name)
        else {
            // team closed between auth and registration
            return;
        };

        tracing::info!(%team_id, member_id = %auth.member_id, "Member connected");
        self.emit_status(&team_id, &auth, true);

        let (sink, stream) = socket.split();
        let writer = self.clone();
        let write_cancel = cancel.clone();
        let write_task = tokio::spawn(async move {
            writer.write_pump(sink, rx, write_cancel).await;
        });

        self.read_pump(stream, &team_id, &auth.member_id, cancel.clone())
            .await;
        cancel.cancel();
        let _ = write_task.await;

        if self.unregister(&team_id, &auth.member_id, conn_id).is_some() {
            tracing::info!(%team_id, member_id = %auth.member_id, "Member disconnected");
            self.emit_status(&team_id, &auth, false);
        }
    }

    async fn authenticate(&self, socket: &mut WebSocket, team_id: &str) -> Result<AuthPayload> {
        let first = tokio::time::timeout(self.config.handshake_timeout, next_text(socket))
            .await
            .map_err(|_| TeamError::Timeout("auth"))??;

        let verdict = match Event::from_json(&first) {
            Err(_) => Err("invalid message format".to_string()),
            Ok(event) if event.kind != EventType::Auth => Err("expected auth event".to_string()),
            Ok(event) => match event.parse_payload::<AuthPayload>() {
                Err(_) => Err("invalid auth payload".to_string()),
                Ok(auth) if auth.member_id.is_empty() => Err("member_id is required".to_string()),
                Ok(_) if !self.is_open(team_id) => Err("team not found".to_string()),
                Ok(auth) => Ok(auth),
            },
        };

        let reply = AuthResultPayload {
            success: verdict.is_ok(),
            error: verdict.as_ref().err().cloned(),
        };
        let frame = Event::new(EventType::AuthResult, team_id, &reply)?;
        socket
            .send(Message::Text(frame.to_json()?.into()))
            .await?;

        verdict.map_err(TeamError::AuthFailed)
    }

    async fn write_pump(
        &self,
        mut sink: SplitSink<WebSocket, Message>,
        mut rx: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    }

    async fn read_pump(
        &self,
        mut stream: SplitStream<WebSocket>,
        team_id: &str,
        member_id: &str,
        cancel: CancellationToken,
    ) {
        loop {
            // any inbound frame counts as proof of life
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.heartbeat_timeout, stream.next()) => next,
            };
            let msg = match next {
                Err(_) => {
                    tracing::warn!(team_id, member_id, "Member timed out");
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(msg))) => msg,
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let event = match Event::from_json(text.as_str()) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(team_id, member_id, error = %e, "Dropping malformed frame");
                    continue;
                }
            };
            match event.kind {
                EventType::Ping => {
                    let pong = Event::bare(EventType::Pong, team_id);
                    if let Err(e) = self.send_to_member(team_id, member_id, &pong) {
                        tracing::debug!(team_id, member_id, error = %e, "Pong not queued");
                    }
                }
                EventType::Pong => {}
                _ => {
                    if let Some(handler) = self.handler() {
                        handler.handle_event(team_id, member_id, event);
                    }
                }
            }
        }
    }
}

async fn next_text(socket: &mut WebSocket) -> Result<String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TeamError::WebSocket("closed before auth".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
