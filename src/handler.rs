//! WebSocket connection handler
//!
//! Handles individual client connections: admission and identity checks
//! during the handshake, then the two per-connection pumps that move frames
//! between the socket and the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::HubConfig;
use crate::connection_manager::{ConnectionManager, OriginSlot};
use crate::error::{AppError, ProtocolError};
use crate::hub::HubHandle;
use crate::message::{Frame, InboundFrame};
use crate::types::{parse_channel_list, ChannelId, ClientId, UserId};

/// Upstream-validated user id
pub const USER_ID_HEADER: &str = "x-user-id";
/// Comma-separated channel ids the user belongs to
pub const CHANNELS_HEADER: &str = "x-user-channels";

/// Identity resolved from the upgrade request
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub user_id: UserId,
    pub channels: Vec<ChannelId>,
    pub user_agent: Option<String>,
}

fn rejection(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Read the caller's identity and channel list from the upgrade headers
pub fn identify(request: &Request) -> Result<ConnectRequest, ErrorResponse> {
    let headers = request.headers();

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<UserId>().ok())
        .filter(|id| id.0 > 0)
        .ok_or_else(|| rejection(StatusCode::UNAUTHORIZED, "missing or invalid user id"))?;

    let channels = match headers.get(CHANNELS_HEADER) {
        None => Vec::new(),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| parse_channel_list(v).ok())
            .ok_or_else(|| rejection(StatusCode::BAD_REQUEST, "invalid channel list"))?,
    };

    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(ConnectRequest {
        user_id,
        channels,
        user_agent,
    })
}

/// Handle a new TCP connection
///
/// Rejects over-limit origins and unidentified callers before the upgrade,
/// registers the client, then runs the reader and writer pumps until
/// either one stops or the hub drops the client.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: HubHandle,
    admission: Arc<ConnectionManager>,
    config: Arc<HubConfig>,
) -> Result<(), AppError> {
    debug!("New TCP connection from {}", peer);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_frame_size);
    ws_config.max_frame_size = Some(config.max_frame_size);

    let mut identity = None;
    let mut slot = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        // Reserved before the upgrade so concurrent handshakes cannot overshoot
        let Some(reserved) = OriginSlot::try_acquire(admission.clone(), peer.ip()) else {
            warn!(%peer, "origin over connection limit");
            return Err(rejection(StatusCode::TOO_MANY_REQUESTS, "too many connections"));
        };
        slot = Some(reserved);
        identity = Some(identify(request)?);
        Ok(response)
    };

    // WebSocket handshake
    let ws_stream =
        match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
        {
            Ok(ws) => ws,
            Err(tungstenite::Error::Http(response)) => {
                info!(%peer, status = %response.status(), "handshake rejected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
    let (Some(request), Some(slot)) = (identity, slot) else {
        return Ok(());
    };
    debug!(origin = %slot.ip(), open = admission.connection_count(slot.ip()), "origin slot reserved");

    // Create the bounded queue for hub -> client frames
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(config.client_queue_size);
    let (close_tx, mut closed) = oneshot::channel::<()>();

    let mut client = Client::new(request.user_id, peer.to_string(), frame_tx)
        .with_channels(request.channels)
        .with_close_signal(close_tx);
    if let Some(agent) = request.user_agent {
        client = client.with_metadata("userAgent", serde_json::Value::String(agent));
    }

    let user_id = client.user_id;
    let client_id = hub.register(client).await.map_err(|e| {
        error!("Failed to register client from {} - hub closed", peer);
        e
    })?;
    info!(client = %client_id, user = %user_id, %peer, "client connected");

    let (ws_sender, ws_receiver) = ws_stream.split();

    let mut read_task = tokio::spawn(read_pump(
        ws_receiver,
        client_id,
        hub.clone(),
        config.clone(),
    ));
    let mut write_task = tokio::spawn(write_pump(ws_sender, frame_rx, client_id, config));

    // Wait for either pump to stop or the hub to drop the client;
    // everything else is torn down with it
    tokio::select! {
        result = &mut read_task => {
            match result {
                Ok(Err(e)) => debug!(client = %client_id, "read pump ended: {}", e),
                Err(e) => error!(client = %client_id, "read pump failed: {}", e),
                Ok(Ok(())) => debug!(client = %client_id, "read pump completed"),
            }
        }
        _ = &mut write_task => {
            debug!(client = %client_id, "write pump completed");
        }
        _ = &mut closed => {
            debug!(client = %client_id, "hub closed the connection");
        }
    }
    read_task.abort();
    write_task.abort();

    let _ = hub.unregister(client_id).await;

    info!(client = %client_id, user = %user_id, "client disconnected");

    Ok(())
}

/// Socket -> hub
///
/// Every frame must arrive within the read deadline; the writer's pings
/// make a healthy peer answer in time.
async fn read_pump(
    mut ws_receiver: SplitStream<WebSocketStream<TcpStream>>,
    client_id: ClientId,
    hub: HubHandle,
    config: Arc<HubConfig>,
) -> Result<(), AppError> {
    let deadline = config.read_deadline();

    loop {
        let next = match timeout(deadline, ws_receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(client = %client_id, "read deadline expired");
                return Err(AppError::ReadTimeout);
            }
        };

        let msg = match next {
            None => return Ok(()),
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(client = %client_id, "WebSocket error: {}", e);
                return Err(e.into());
            }
        };

        match msg {
            Message::Text(text) => match InboundFrame::parse(&text) {
                Ok(frame) => hub.inbound(client_id, frame).await?,
                Err(e) => {
                    debug!(client = %client_id, "invalid frame: {}", e);
                    hub.reject(client_id, e).await?;
                }
            },
            Message::Binary(_) => hub.reject(client_id, ProtocolError::Binary).await?,
            Message::Ping(_) | Message::Pong(_) => hub.touch(client_id).await?,
            Message::Close(_) => {
                debug!(client = %client_id, "client sent close frame");
                return Ok(());
            }
            _ => {}
        }
    }
}

/// Hub -> socket, plus the heartbeat
async fn write_pump(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut frame_rx: mpsc::Receiver<Frame>,
    client_id: ClientId,
    config: Arc<HubConfig>,
) {
    let period = config.heartbeat_interval();
    let wait = config.write_wait();
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                // None: the hub dropped this client
                let Some(frame) = frame else { break };
                match serde_json::to_string(&*frame) {
                    Ok(json) => {
                        if let Err(e) = send_within(&mut ws_sender, Message::Text(json.into()), wait).await {
                            debug!(client = %client_id, "WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        // Skip this frame, keep the connection
                        error!(client = %client_id, envelope = frame.kind(), "Failed to serialize message: {}", e);
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_within(&mut ws_sender, Message::Ping(Vec::new()), wait).await {
                    debug!(client = %client_id, "heartbeat failed: {}", e);
                    break;
                }
            }
        }
    }

    // Send close frame when done
    let _ = timeout(wait, ws_sender.close()).await;
}

/// A peer that stops reading eventually stalls the sink; give up after `wait`
async fn send_within(
    ws_sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    msg: Message,
    wait: Duration,
) -> Result<(), AppError> {
    match timeout(wait, ws_sender.send(msg)).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::WriteTimeout),
    }
}
