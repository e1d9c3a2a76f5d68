//! WebSocket relay between clients and session channels.
//!
//! Each accepted connection owns one [`ReconnectingSubscriber`] on
//! `stream:{session_id}` and runs two pumps: outbound (channel to client)
//! on its own task, inbound (client to channel) on the handler task. Broker
//! resources and the registry entry are released on every exit path.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use codevec_core::stream::{channel_name, publish_notice};
use codevec_core::Notice;
use codevec_redis::Broker;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, Claims};
use crate::registry::{ChannelRegistry, ConnectionId, ConnectionInfo};
use crate::state::{AppState, RelaySettings};
use crate::subscriber::ReconnectingSubscriber;

/// Published on the session channel once a client is attached.
pub const HANDSHAKE_MESSAGE: &str = "Connection established";

/// Sent to the client when the broker cannot be reached at connection start.
pub const SETUP_FAILED_MESSAGE: &str = "Failed to connect to message server";

/// Close reason sent to clients when the gateway shuts down.
pub const SHUTDOWN_MESSAGE: &str = "Server shutting down";

const MISSING_SESSION: &str = "missing session id";

type ClientSink = SplitSink<WebSocket, Message>;
type ClientStream = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Draining,
    Closed,
}

struct Connection {
    id: ConnectionId,
    session_id: String,
    state: ConnectionState,
}

impl Connection {
    fn new(session_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            connection_id = %self.id,
            session_id = %self.session_id,
            from = ?self.state,
            to = ?next,
            "Connection state"
        );
        self.state = next;
    }
}

/// Registry entry held for the lifetime of a connection. Dropping the lease
/// deregisters, so a panicking handler cannot leak its entry.
pub struct SessionLease {
    registry: Arc<ChannelRegistry>,
    session_id: String,
    connection: ConnectionId,
    released: bool,
}

impl SessionLease {
    pub fn acquire(
        registry: Arc<ChannelRegistry>,
        session_id: &str,
        connection: ConnectionId,
        info: ConnectionInfo,
    ) -> Self {
        registry.register(session_id, connection, info);
        Self {
            registry,
            session_id: session_id.to_string(),
            connection,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.deregister(&self.session_id, self.connection);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundEnd {
    Cancelled,
    ClientGone,
    BrokerUnavailable,
    Crashed,
}

impl OutboundEnd {
    /// Close frame still owed to the client. A broker failure has already
    /// sent its own.
    fn close_frame(self) -> Option<CloseFrame> {
        match self {
            Self::Cancelled => Some(going_away()),
            Self::ClientGone | Self::BrokerUnavailable | Self::Crashed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundEnd {
    Cancelled,
    ClientClosed,
    ClientError,
}

impl InboundEnd {
    fn close_frame(self) -> Option<CloseFrame> {
        match self {
            Self::Cancelled => Some(going_away()),
            Self::ClientClosed | Self::ClientError => None,
        }
    }
}

type OutboundResult = (ReconnectingSubscriber, ClientSink, OutboundEnd);

/// Broker-side resources of one connection.
struct RelayLink {
    cancel: CancellationToken,
    outbound: Option<JoinHandle<OutboundResult>>,
    subscriber: Option<ReconnectingSubscriber>,
    sender: Option<ClientSink>,
    lease: SessionLease,
    drain_timeout: Duration,
}

impl RelayLink {
    fn new(
        subscriber: ReconnectingSubscriber,
        lease: SessionLease,
        cancel: CancellationToken,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            cancel,
            outbound: None,
            subscriber: Some(subscriber),
            sender: None,
            lease,
            drain_timeout,
        }
    }

    fn start_outbound(&mut self, sender: ClientSink, connection_id: ConnectionId) {
        if let Some(subscriber) = self.subscriber.take() {
            self.outbound = Some(tokio::spawn(pump_outbound(
                sender,
                subscriber,
                self.cancel.clone(),
                connection_id,
            )));
        }
    }

    /// Resolves when the outbound pump stops on its own.
    async fn outbound_finished(&mut self) -> OutboundEnd {
        let Some(handle) = self.outbound.as_mut() else {
            return std::future::pending().await;
        };
        let joined = handle.await;
        self.outbound = None;
        match joined {
            Ok((subscriber, sender, end)) => {
                self.subscriber = Some(subscriber);
                self.sender = Some(sender);
                end
            }
            Err(e) => {
                warn!(error = %e, "Outbound pump failed");
                OutboundEnd::Crashed
            }
        }
    }

    /// Stop the outbound pump, send `close` if the client is still owed
    /// one, unsubscribe and deregister. Running it again is a no-op.
    async fn teardown(&mut self, close: Option<CloseFrame>) {
        self.cancel.cancel();
        if let Some(mut handle) = self.outbound.take() {
            match tokio::time::timeout(self.drain_timeout, &mut handle).await {
                Ok(Ok((subscriber, sender, _))) => {
                    self.subscriber = Some(subscriber);
                    self.sender = Some(sender);
                }
                Ok(Err(e)) => warn!(error = %e, "Outbound pump failed during drain"),
                Err(_) => {
                    // The aborted task drops the subscriber, which releases it.
                    warn!("Outbound pump did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        if let (Some(mut sender), Some(frame)) = (self.sender.take(), close) {
            let send = sender.send(Message::Close(Some(frame)));
            if !matches!(tokio::time::timeout(self.drain_timeout, send).await, Ok(Ok(()))) {
                debug!("Client did not take the close frame");
            }
        }
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.close().await;
        }
        self.lease.release();
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// WebSocket upgrade handler for `/socket/ws/{session_id}?token=...`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let admitted = admit(&state, &session_id, params.token.as_deref());
    ws.on_upgrade(move |socket| async move {
        match admitted {
            Ok(claims) => relay(socket, state, session_id, claims).await,
            Err(reason) => reject(socket, reason).await,
        }
    })
}

/// Upgrade handler for `/socket/ws/` with no session id. The client still
/// gets a WebSocket close rather than a bare 404.
pub async fn ws_missing_session(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| reject(socket, MISSING_SESSION.to_string()))
}

fn admit(state: &AppState, session_id: &str, token: Option<&str>) -> Result<Claims, String> {
    if session_id.trim().is_empty() {
        return Err(MISSING_SESSION.to_string());
    }
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)
        .map_err(|e| e.to_string())?;
    state.verifier.verify(token).map_err(|e| e.to_string())
}

fn close_frame(code: u16, reason: &str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.to_string().into(),
    }
}

fn going_away() -> CloseFrame {
    close_frame(close_code::AWAY, SHUTDOWN_MESSAGE)
}

async fn reject(mut socket: WebSocket, reason: String) {
    info!(reason = %reason, "Rejecting WebSocket connection");
    let _ = socket
        .send(Message::Close(Some(close_frame(close_code::POLICY, &reason))))
        .await;
}

async fn setup_failed(mut socket: WebSocket) {
    if let Ok(text) = Notice::error(SETUP_FAILED_MESSAGE).to_json() {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(close_frame(close_code::ERROR, SETUP_FAILED_MESSAGE))))
        .await;
}

async fn relay(socket: WebSocket, state: AppState, session_id: String, claims: Claims) {
    let mut conn = Connection::new(&session_id);
    let channel = channel_name(&session_id);

    let subscriber = match ReconnectingSubscriber::connect(
        state.broker.clone(),
        &channel,
        state.relay.subscriber.clone(),
    )
    .await
    {
        Ok(subscriber) => subscriber,
        Err(e) => {
            warn!(
                connection_id = %conn.id,
                session_id = %session_id,
                error = %e,
                "Subscribe failed"
            );
            setup_failed(socket).await;
            conn.transition(ConnectionState::Closed);
            return;
        }
    };

    let lease = SessionLease::acquire(
        state.registry.clone(),
        &session_id,
        conn.id,
        ConnectionInfo::new(claims.sub),
    );
    let mut link = RelayLink::new(
        subscriber,
        lease,
        state.shutdown.child_token(),
        state.relay.drain_timeout,
    );

    let handshake = Notice::system(HANDSHAKE_MESSAGE);
    if let Err(e) = publish_notice(state.broker.as_ref(), &session_id, &handshake).await {
        warn!(
            connection_id = %conn.id,
            session_id = %session_id,
            error = %e,
            "Handshake publish failed"
        );
        conn.transition(ConnectionState::Draining);
        link.teardown(None).await;
        setup_failed(socket).await;
        conn.transition(ConnectionState::Closed);
        return;
    }

    conn.transition(ConnectionState::Active);
    info!(
        connection_id = %conn.id,
        session_id = %session_id,
        listeners = state.registry.listener_count(&session_id),
        "Client attached"
    );

    let (sender, receiver) = socket.split();
    link.start_outbound(sender, conn.id);
    let cancel = link.cancel.clone();

    let inbound = pump_inbound(
        receiver,
        state.broker.as_ref(),
        &state.relay,
        &channel,
        &cancel,
        conn.id,
    );
    let (reason, close) = tokio::select! {
        end = inbound => (format!("inbound {:?}", end), end.close_frame()),
        end = link.outbound_finished() => (format!("outbound {:?}", end), end.close_frame()),
    };

    conn.transition(ConnectionState::Draining);
    link.teardown(close).await;
    conn.transition(ConnectionState::Closed);
    info!(connection_id = %conn.id, session_id = %session_id, reason = %reason, "Client detached");
}

async fn pump_outbound(
    mut sender: ClientSink,
    mut subscriber: ReconnectingSubscriber,
    cancel: CancellationToken,
    connection_id: ConnectionId,
) -> OutboundResult {
    let end = loop {
        let message = match subscriber.next_message(&cancel).await {
            Ok(Some(message)) => message,
            Ok(None) => break OutboundEnd::Cancelled,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Closing connection");
                let frame = close_frame(close_code::ERROR, "Message server unavailable");
                let _ = sender.send(Message::Close(Some(frame))).await;
                break OutboundEnd::BrokerUnavailable;
            }
        };

        if !message.is_structured() {
            debug!(connection_id = %connection_id, "Forwarding unparsed payload as text");
        }
        let frame = Message::Text(message.into_raw().into());
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break OutboundEnd::Cancelled,
            sent = sender.send(frame) => sent,
        };
        if let Err(e) = sent {
            debug!(connection_id = %connection_id, error = %e, "Client send failed");
            break OutboundEnd::ClientGone;
        }
    };
    (subscriber, sender, end)
}

async fn pump_inbound(
    mut receiver: ClientStream,
    broker: &dyn Broker,
    relay: &RelaySettings,
    channel: &str,
    cancel: &CancellationToken,
    connection_id: ConnectionId,
) -> InboundEnd {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return InboundEnd::Cancelled,
            next = tokio::time::timeout(relay.inbound_timeout, receiver.next()) => next,
        };

        let frame = match next {
            Err(_idle) => continue,
            Ok(None) => return InboundEnd::ClientClosed,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %connection_id, error = %e, "Client read failed");
                return InboundEnd::ClientError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) if relay.allow_client_publish => {
                if let Err(e) = broker.publish(channel, text.as_str()).await {
                    warn!(
                        connection_id = %connection_id,
                        channel,
                        error = %e,
                        "Client publish failed"
                    );
                }
            }
            Message::Text(_) => {
                debug!(connection_id = %connection_id, "Client publishing disabled, frame ignored");
            }
            Message::Close(_) => return InboundEnd::ClientClosed,
            Message::Binary(_) => {
                debug!(connection_id = %connection_id, "Binary frame ignored");
            }
            _ => {}
        }
    }
}
