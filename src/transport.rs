use crate::client::path_segment;
use crate::config::TransportConfig;
use crate::error::{Result, TeamError};
use crate::network::{dial_with_fallback, parse_endpoint};
use crate::peer::MemberEndpoint;
use crate::protocol::{AuthPayload, AuthResultPayload, Event, EventType};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<TcpStream>;

/// Receives what arrives on a member's connection to its leader.
pub trait EventListener: Send + Sync {
    fn on_event(&self, team_id: &str, event: Event);
    fn on_connect(&self, team_id: &str);
    fn on_disconnect(&self, team_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub team_id: String,
    pub endpoint: String,
    pub state: ConnectionState,
    pub last_ping: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

/// A live socket: its outbound queue and the token that stops both pumps.
struct Session {
    id: u64,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

struct Inner {
    state: ConnectionState,
    session: Option<Session>,
    next_session: u64,
    last_ping: Option<DateTime<Utc>>,
    retry_count: u32,
}

/// One member's authenticated WebSocket to its team leader.
pub struct TeamConnection {
    team_id: String,
    endpoint: String,
    auth: RwLock<AuthPayload>,
    config: TransportConfig,
    listener: Arc<dyn EventListener>,
    /// Cancelled by `close`; every session token derives from it.
    closed: CancellationToken,
    inner: Mutex<Inner>,
}

impl TeamConnection {
    pub fn new(
        team_id: &str,
        endpoint: &str,
        auth: AuthPayload,
        config: TransportConfig,
        listener: Arc<dyn EventListener>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            team_id: team_id.to_string(),
            endpoint: endpoint.to_string(),
            auth: RwLock::new(auth),
            config,
            listener,
            closed: parent.child_token(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
                next_session: 0,
                last_ping: None,
                retry_count: 0,
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn info(&self) -> ConnectionInfo {
        let inner = self.inner();
        ConnectionInfo {
            team_id: self.team_id.clone(),
            endpoint: self.endpoint.clone(),
            state: inner.state,
            last_ping: inner.last_ping,
            retry_count: inner.retry_count,
        }
    }

    pub fn set_retry_count(&self, count: u32) {
        self.inner().retry_count = count;
    }

    /// New credentials take effect on the next handshake.
    pub fn set_identity(&self, auth: AuthPayload) {
        if let Ok(mut current) = self.auth.write() {
            *current = auth;
        }
    }

    fn url(&self) -> String {
        format!(
            "ws://{}/team/{}/ws",
            self.endpoint,
            path_segment(&self.team_id)
        )
    }

    /// Dials, authenticates and starts the pumps.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner();
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(TeamError::WebSocket("connect already in progress".into()))
                }
                ConnectionState::Disconnected if self.closed.is_cancelled() => {
                    return Err(TeamError::NotConnected)
                }
                ConnectionState::Disconnected => inner.state = ConnectionState::Connecting,
            }
        }

        let handshake = tokio::select! {
            _ = self.closed.cancelled() => Err(TeamError::NotConnected),
            result = self.handshake() => result,
        };
        let result = match handshake {
            Ok(ws) => self.start(ws),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let mut inner = self.inner();
            if inner.session.is_none() {
                inner.state = ConnectionState::Disconnected;
            }
        }
        result
    }

    async fn handshake(&self) -> Result<WsStream> {
        let timeout = self.config.handshake_timeout;
        let (host, port) = parse_endpoint(&self.endpoint)?;
        let target = MemberEndpoint {
            primary_ip: host,
            all_ips: Vec::new(),
            port,
            preferred_interface: String::new(),
        };
        let stream = dial_with_fallback(&target, timeout).await?;
        let limits = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_frame_size))
            .max_frame_size(Some(self.config.max_frame_size));
        let (mut ws, _) = tokio::time::timeout(
            timeout,
            tokio_tungstenite::client_async_with_config(self.url(), stream, Some(limits)),
        )
        .await
        .map_err(|_| TeamError::Timeout("websocket handshake"))??;

        let auth = self
            .auth
            .read()
            .map(|a| a.clone())
            .map_err(|_| TeamError::WebSocket("identity lock poisoned".into()))?;
        let hello = Event::new(EventType::Auth, &self.team_id, &auth)?;
        ws.send(Message::Text(hello.to_json()?.into())).await?;

        let result = tokio::time::timeout(timeout, wait_auth_result(&mut ws))
            .await
            .map_err(|_| TeamError::Timeout("auth result"));
        match result {
            Ok(Ok(())) => Ok(ws),
            Ok(Err(e)) | Err(e) => {
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    /// Fails when `close` won the race against the handshake; the socket is
    /// dropped unused.
    fn start(self: &Arc<Self>, ws: WsStream) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let cancel = self.closed.child_token();

        let session_id = {
            let mut inner = self.inner();
            if self.closed.is_cancelled() {
                inner.state = ConnectionState::Disconnected;
                tracing::debug!(team_id = %self.team_id, "Closed during handshake, dropping socket");
                return Err(TeamError::NotConnected);
            }
            inner.next_session += 1;
            let id = inner.next_session;
            inner.session = Some(Session {
                id,
                tx: tx.clone(),
                cancel: cancel.clone(),
            });
            inner.state = ConnectionState::Connected;
            inner.last_ping = Some(Utc::now());
            id
        };

        tracing::info!(team_id = %self.team_id, endpoint = %self.endpoint, "Connected to team leader");
        self.listener.on_connect(&self.team_id);

        let (sink, stream) = ws.split();
        let writer = self.clone();
        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            writer.write_pump(sink, rx, write_cancel).await;
            writer.handle_disconnect(session_id);
        });

        let reader = self.clone();
        tokio::spawn(async move {
            reader.read_pump(stream, tx, cancel).await;
            reader.handle_disconnect(session_id);
        });
        Ok(())
    }

    async fn write_pump(
        &self,
        mut sink: SplitSink<WsStream, Message>,
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
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(team_id = %self.team_id, error = %e, "Write failed");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = Event::bare(EventType::Ping, &self.team_id);
                    let frame = match ping.to_json() {
                        Ok(json) => Message::Text(json.into()),
                        Err(_) => continue,
                    };
                    if let Err(e) = sink.send(frame).await {
                        tracing::warn!(team_id = %self.team_id, error = %e, "Heartbeat failed");
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    }

    async fn read_pump(
        &self,
        mut stream: SplitStream<WsStream>,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.heartbeat_timeout, stream.next()) => next,
            };

            let msg = match next {
                Err(_) => {
                    tracing::warn!(team_id = %self.team_id, "Leader went silent");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(team_id = %self.team_id, error = %e, "Read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => {
                    if text.len() > self.config.max_frame_size {
                        tracing::warn!(team_id = %self.team_id, size = text.len(), "Frame too large");
                        break;
                    }
                    let event = match Event::from_json(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(team_id = %self.team_id, error = %e, "Dropping malformed frame");
                            continue;
                        }
                    };
                    match event.kind {
                        EventType::Ping => {
                            self.touch();
                            let pong = Event::bare(EventType::Pong, &self.team_id);
                            if let Ok(json) = pong.to_json() {
                                let _ = tx.try_send(Message::Text(json.into()));
                            }
                        }
                        EventType::Pong => self.touch(),
                        _ => self.listener.on_event(&self.team_id, event),
                    }
                }
                Message::Ping(_) | Message::Pong(_) => self.touch(),
                Message::Binary(data) => {
                    if data.len() > self.config.max_frame_size {
                        tracing::warn!(team_id = %self.team_id, size = data.len(), "Frame too large");
                        break;
                    }
                    tracing::debug!(team_id = %self.team_id, "Ignoring binary frame");
                }
                Message::Close(_) => break,
                Message::Frame(_) => {}
            }
        }
    }

    fn touch(&self) {
        self.inner().last_ping = Some(Utc::now());
    }

    /// Runs once per session, whichever pump stops first.
    fn handle_disconnect(&self, session_id: u64) {
        let was_connected = {
            let mut inner = self.inner();
            let current = inner.session.as_ref().map(|s| s.id);
            if current != Some(session_id) {
                return;
            }
            if let Some(session) = inner.session.take() {
                session.cancel.cancel();
            }
            let was = inner.state == ConnectionState::Connected;
            inner.state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            tracing::info!(team_id = %self.team_id, "Disconnected from team leader");
            self.listener.on_disconnect(&self.team_id);
        }
    }

    /// Queues an event. Never waits for room in the queue.
    pub fn send(&self, event: &Event) -> Result<()> {
        let inner = self.inner();
        let session = match (&inner.state, &inner.session) {
            (ConnectionState::Connected, Some(session)) => session,
            _ => return Err(TeamError::NotConnected),
        };
        let frame = Message::Text(event.to_json()?.into());
        session.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TeamError::SendBufferFull,
            mpsc::error::TrySendError::Closed(_) => TeamError::NotConnected,
        })
    }

    /// Stops the pumps and drops the socket, including one still in its
    /// handshake. The connection cannot be reused. Safe to call repeatedly.
    pub fn close(&self) {
        let was_connected = {
            let mut inner = self.inner();
            self.closed.cancel();
            let was = inner.session.take().is_some() && inner.state == ConnectionState::Connected;
            inner.state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            tracing::info!(team_id = %self.team_id, "Closed connection to team leader");
            self.listener.on_disconnect(&self.team_id);
        }
    }
}

async fn wait_auth_result(ws: &mut WsStream) -> Result<()> {
    loop {
        let msg = match ws.next().await {
            Some(msg) => msg?,
            None => return Err(TeamError::WebSocket("connection closed during auth".into())),
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(TeamError::WebSocket("connection closed during auth".into()))
            }
            _ => continue,
        };
        let event = Event::from_json(text.as_str())?;
        if event.kind != EventType::AuthResult {
            return Err(TeamError::UnexpectedEvent(event.kind.to_string()));
        }
        let result: AuthResultPayload = event.parse_payload()?;
        if !result.success {
            return Err(TeamError::AuthFailed(result.error.unwrap_or_default()));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        connects: Mutex<u32>,
        disconnects: Mutex<u32>,
        events: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, _team_id: &str, event: Event) {
            self.events.lock().unwrap().push(event);
        }
        fn on_connect(&self, _team_id: &str) {
            *self.connects.lock().unwrap() += 1;
        }
        fn on_disconnect(&self, _team_id: &str) {
            *self.disconnects.lock().unwrap() += 1;
        }
    }

    fn auth() -> AuthPayload {
        AuthPayload {
            member_id: "m1".into(),
            member_name: "bob".into(),
            endpoint: "10.0.0.2:19960".into(),
        }
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            handshake_timeout: Duration::from_secs(2),
            ..TransportConfig::default()
        }
    }

    fn accepted() -> Event {
        Event::new(
            EventType::AuthResult,
            "team-1",
            &AuthResultPayload {
                success: true,
                error: None,
            },
        )
        .unwrap()
    }

    /// Accepts one socket, swallows the auth frame and hands the rest of the
    /// conversation to `script`.
    async fn scripted_leader<F, Fut>(script: F) -> String
    where
        F: FnOnce(WsStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _auth = ws.next().await;
            script(ws).await;
        });
        addr
    }

    async fn wait_for(what: &str, check: impl Fn() -> bool) {
        for _ in 0..150 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Accepts one socket, reads the auth frame and answers with `reply`.
    async fn one_shot_leader(reply: Event) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _auth = ws.next().await;
            ws.send(Message::Text(reply.to_json().unwrap().into()))
                .await
                .unwrap();
            // keep the socket open briefly
            tokio::time::sleep(Duration::from_millis(500)).await;
        });
        addr
    }

    fn connection(endpoint: &str, listener: Arc<Recorder>) -> Arc<TeamConnection> {
        connection_with(endpoint, listener, fast_config())
    }

    fn connection_with(
        endpoint: &str,
        listener: Arc<Recorder>,
        config: TransportConfig,
    ) -> Arc<TeamConnection> {
        Arc::new(TeamConnection::new(
            "team-1",
            endpoint,
            auth(),
            config,
            listener,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn send_before_connect_fails_fast() {
        let conn = connection("127.0.0.1:9", Arc::new(Recorder::default()));
        let ev = Event::bare(EventType::Ping, "team-1");
        assert!(matches!(conn.send(&ev), Err(TeamError::NotConnected)));
        assert_eq!(conn.info().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_auth_leaves_connection_disconnected() {
        let reply = Event::new(
            EventType::AuthResult,
            "team-1",
            &AuthResultPayload {
                success: false,
                error: Some("not welcome".into()),
            },
        )
        .unwrap();
        let addr = one_shot_leader(reply).await;
        let recorder = Arc::new(Recorder::default());
        let conn = connection(&addr, recorder.clone());

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, TeamError::AuthFailed(ref m) if m == "not welcome"));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(*recorder.connects.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_first_reply_is_unexpected_event() {
        let reply = Event::bare(EventType::MemberJoined, "team-1");
        let addr = one_shot_leader(reply).await;
        let conn = connection(&addr, Arc::new(Recorder::default()));
        assert!(matches!(
            conn.connect().await,
            Err(TeamError::UnexpectedEvent(ref t)) if t == "member_joined"
        ));
    }

    #[tokio::test]
    async fn accepted_auth_connects_and_delivers_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _auth = ws.next().await;
            let ok = Event::new(
                EventType::AuthResult,
                "team-1",
                &AuthResultPayload {
                    success: true,
                    error: None,
                },
            )
            .unwrap();
            ws.send(Message::Text(ok.to_json().unwrap().into())).await.unwrap();
            ws.send(Message::Text("{garbage".to_string().into())).await.unwrap();
            let hello = Event::bare(EventType::ProjectConfigUpdated, "team-1");
            ws.send(Message::Text(hello.to_json().unwrap().into())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let recorder = Arc::new(Recorder::default());
        let conn = connection(&addr, recorder.clone());
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(*recorder.connects.lock().unwrap(), 1);

        let mut delivered = false;
        for _ in 0..50 {
            if !recorder.events.lock().unwrap().is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered, "event after malformed frame should arrive");
        assert_eq!(
            recorder.events.lock().unwrap()[0].kind,
            EventType::ProjectConfigUpdated
        );

        conn.close();
        conn.close();
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn close_during_handshake_never_goes_live() {
        let addr = scripted_leader(|mut ws| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if ws.send(Message::Text(accepted().to_json().unwrap().into())).await.is_err() {
                return;
            }
            for _ in 0..10 {
                let ev = Event::bare(EventType::ProjectConfigUpdated, "team-1");
                if ws.send(Message::Text(ev.to_json().unwrap().into())).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        let recorder = Arc::new(Recorder::default());
        let conn = connection(&addr, recorder.clone());

        let connecting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(TeamError::NotConnected)));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(*recorder.connects.lock().unwrap(), 0);
        assert!(recorder.events.lock().unwrap().is_empty());
        assert!(matches!(conn.connect().await, Err(TeamError::NotConnected)));
    }

    #[tokio::test]
    async fn close_reports_the_disconnect_once() {
        let addr = scripted_leader(|mut ws| async move {
            ws.send(Message::Text(accepted().to_json().unwrap().into())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;
        let recorder = Arc::new(Recorder::default());
        let conn = connection(&addr, recorder.clone());
        conn.connect().await.unwrap();

        conn.close();
        conn.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*recorder.disconnects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn silent_leader_is_dropped_after_heartbeat_timeout() {
        let addr = scripted_leader(|mut ws| async move {
            ws.send(Message::Text(accepted().to_json().unwrap().into())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        })
        .await;
        let recorder = Arc::new(Recorder::default());
        let config = TransportConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let conn = connection_with(&addr, recorder.clone(), config);
        conn.connect().await.unwrap();

        wait_for("silent leader dropped", || !conn.is_connected()).await;
        assert_eq!(*recorder.disconnects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn any_inbound_frame_keeps_the_connection_alive() {
        let addr = scripted_leader(|mut ws| async move {
            ws.send(Message::Text(accepted().to_json().unwrap().into())).await.unwrap();
            for _ in 0..15 {
                let ev = Event::bare(EventType::SessionShared, "team-1");
                if ws.send(Message::Text(ev.to_json().unwrap().into())).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        let recorder = Arc::new(Recorder::default());
        let config = TransportConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let conn = connection_with(&addr, recorder.clone(), config);
        conn.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(conn.is_connected());
        assert!(recorder.events.lock().unwrap().len() >= 5);
        conn.close();
    }

    #[tokio::test]
    async fn oversized_frame_drops_the_connection() {
        let addr = scripted_leader(|mut ws| async move {
            ws.send(Message::Text(accepted().to_json().unwrap().into())).await.unwrap();
            let big = Event::new(EventType::CodeShared, "team-1", &"x".repeat(8 * 1024)).unwrap();
            let _ = ws.send(Message::Text(big.to_json().unwrap().into())).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        })
        .await;
        let recorder = Arc::new(Recorder::default());
        let config = TransportConfig {
            max_frame_size: 1024,
            ..fast_config()
        };
        let conn = connection_with(&addr, recorder.clone(), config);
        conn.connect().await.unwrap();

        wait_for("oversized frame rejected", || !conn.is_connected()).await;
        assert!(recorder.events.lock().unwrap().is_empty());
    }
}
