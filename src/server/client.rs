// src/server/client.rs
//! Client connection handling.
//!
//! This module handles individual client connections: the WebSocket upgrade,
//! the authentication phase, and dispatch of session packets. Outbound
//! packets are written by a dedicated writer task fed through the session's
//! channel.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::auth::challenge::ChallengeAuthenticator;
use crate::generation::tracker::{GenerationError, GenerationTracker};
use crate::protocol::serialization::{
    create_disconnect_packet, create_error_packet, get_packet_type_name, log_packet_info, packet_to_ws_message,
    ws_message_to_packet, MAX_MESSAGE_SIZE,
};
use crate::protocol::types::{disconnect_reason, error_code, PacketType};
use crate::server::core::ServerError;
use crate::server::session::{ClientSession, ConnectionId, Outbound, SessionManager};

/// How long the writer gets to flush the final `Disconnect`
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// What the read loop does after a packet
enum Flow {
    Continue,
    Close(u16, String),
}

/// Handle a client connection
pub async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    session_manager: Arc<SessionManager>,
    authenticator: Arc<ChallengeAuthenticator>,
    generations: Arc<GenerationTracker>,
    auth_timeout: Duration,
) -> Result<(), ServerError> {
    let mut forwarded_for = None;
    let capture_forwarded = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        forwarded_for = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        ..WebSocketConfig::default()
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(stream, capture_forwarded, Some(ws_config)).await?;
    debug!("WebSocket connection established with {}", addr);

    let (session, outbound) = session_manager.on_connect(addr, forwarded_for).await;
    let connection_id = session.connection_id();

    let (ws_sender, ws_receiver) = ws_stream.split();
    let writer = tokio::spawn(run_writer(ws_sender, outbound, connection_id));

    let (reason, message) = process_session(
        ws_receiver,
        &session,
        &session_manager,
        &authenticator,
        &generations,
        auth_timeout,
    )
    .await;

    session_manager.on_disconnect(connection_id, reason, &message).await;

    if time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!(connection = %connection_id, "Writer did not finish in time");
    }
    Ok(())
}

/// Drain the session's outbound channel into the socket
async fn run_writer<S>(
    mut ws_sender: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connection_id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Packet(packet) => {
                let message = match packet_to_ws_message(&packet) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(connection = %connection_id, error = %e, "Dropping unserializable {} packet", get_packet_type_name(&packet));
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(message).await {
                    trace!(connection = %connection_id, error = %e, "Write failed; stopping writer");
                    break;
                }
            }
            Outbound::Close { reason, message } => {
                let packet = create_disconnect_packet(reason, &message);
                log_packet_info(&packet, false);
                if let Ok(frame) = packet_to_ws_message(&packet) {
                    let _ = ws_sender.send(frame).await;
                }
                let _ = ws_sender.close().await;
                break;
            }
        }
    }
    trace!(connection = %connection_id, "Writer stopped");
}

/// Run the authentication phase and then the packet loop. Returns the
/// disconnect reason.
async fn process_session<S>(
    mut ws_receiver: S,
    session: &ClientSession,
    session_manager: &SessionManager,
    authenticator: &ChallengeAuthenticator,
    generations: &GenerationTracker,
    auth_timeout: Duration,
) -> (u16, String)
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let closed = session.close_token();

    // --- Authentication Phase: the first packet must be Hello ---
    let first = tokio::select! {
        _ = closed.cancelled() => return closed_elsewhere(session),
        result = time::timeout(auth_timeout, next_packet(&mut ws_receiver, session)) => result,
    };
    match first {
        Err(_) => {
            return (
                disconnect_reason::AUTHENTICATION_FAILED,
                "Authentication timed out".to_string(),
            )
        }
        Ok(None) => return (disconnect_reason::USER_INITIATED, "Connection closed".to_string()),
        Ok(Some(PacketType::Hello { client_version })) => {
            debug!(connection = %session.connection_id(), ?client_version, "Hello received");
            match authenticator.issue_challenge(session) {
                Ok(issued) => {
                    session.send(PacketType::Challenge {
                        challenge: issued.encoded(),
                        expires_at: issued.expires_at.timestamp_millis().max(1) as u64,
                    });
                }
                Err(e) => {
                    session.send(create_error_packet(error_code::INVALID_STATE, &e.to_string()));
                    return (disconnect_reason::PROTOCOL_VIOLATION, e.to_string());
                }
            }
        }
        Ok(Some(other)) => {
            session.send(create_error_packet(
                error_code::INVALID_MESSAGE,
                &format!("Expected Hello, got {}", get_packet_type_name(&other)),
            ));
            return (disconnect_reason::PROTOCOL_VIOLATION, "Handshake must start with Hello".to_string());
        }
    }

    // --- Packet loop ---
    loop {
        let packet = tokio::select! {
            _ = closed.cancelled() => return closed_elsewhere(session),
            packet = next_packet(&mut ws_receiver, session) => packet,
        };
        let packet = match packet {
            Some(packet) => packet,
            None => return (disconnect_reason::USER_INITIATED, "Connection closed".to_string()),
        };

        match dispatch(packet, session, session_manager, authenticator, generations).await {
            Flow::Continue => {}
            Flow::Close(reason, message) => return (reason, message),
        }
    }
}

/// Reason recorded by whoever closed the session first
fn closed_elsewhere(session: &ClientSession) -> (u16, String) {
    session
        .close_reason()
        .unwrap_or_else(|| (disconnect_reason::USER_INITIATED, "Session closed".to_string()))
}

/// Read the next valid packet. Malformed packets are answered with an
/// `Error` and skipped; `None` means the connection is gone.
async fn next_packet<S>(ws_receiver: &mut S, session: &ClientSession) -> Option<PacketType>
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = match ws_receiver.next().await? {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %session.connection_id(), error = %e, "WebSocket read error");
                return None;
            }
        };

        match message {
            WsMessage::Close(_) => return None,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            message => match ws_message_to_packet(&message) {
                Ok(packet) => {
                    log_packet_info(&packet, true);
                    return Some(packet);
                }
                Err(e) => {
                    debug!(connection = %session.connection_id(), error = %e, "Invalid message");
                    session.send(create_error_packet(error_code::INVALID_MESSAGE, &e.to_string()));
                }
            },
        }
    }
}

async fn dispatch(
    packet: PacketType,
    session: &ClientSession,
    session_manager: &SessionManager,
    authenticator: &ChallengeAuthenticator,
    generations: &GenerationTracker,
) -> Flow {
    let connection_id = session.connection_id();

    match packet {
        PacketType::ChallengeResponse { client_id, signature } => {
            match authenticator.verify(session, &client_id, &signature) {
                Ok(_) => {
                    session.send(PacketType::AuthResult { ok: true, reason: None });
                    Flow::Continue
                }
                Err(rejection) => {
                    session.send(PacketType::AuthResult {
                        ok: false,
                        reason: Some(rejection.as_str().to_string()),
                    });
                    Flow::Close(disconnect_reason::AUTHENTICATION_FAILED, rejection.to_string())
                }
            }
        }

        PacketType::Ping { timestamp, sequence } => {
            session.send(PacketType::Pong {
                echo_timestamp: timestamp,
                sequence,
            });
            Flow::Continue
        }

        PacketType::Pong { sequence, .. } => {
            if !session_manager.record_pong(connection_id, sequence).await {
                trace!(connection = %connection_id, sequence, "Unexpected pong");
            }
            Flow::Continue
        }

        PacketType::GenerateRequest { model, prompt } => {
            if session.is_authenticated() && session_manager.ensure_not_revoked(session).is_err() {
                return Flow::Close(disconnect_reason::ACCESS_REVOKED, "Access revoked".to_string());
            }

            match generations.start(session, model, prompt) {
                Ok(handle) => {
                    trace!(connection = %connection_id, generation_id = handle.generation_id, "Generation dispatched");
                }
                Err(e @ GenerationError::Conflict(_)) => {
                    session.send(PacketType::GenerateError {
                        code: error_code::GENERATION_CONFLICT,
                        message: e.to_string(),
                    });
                }
                Err(GenerationError::Closed(_)) => {
                    debug!(connection = %connection_id, "Generation refused; session closing");
                }
                Err(e) => {
                    session.send(PacketType::GenerateError {
                        code: error_code::UNAUTHORIZED,
                        message: e.to_string(),
                    });
                }
            }
            Flow::Continue
        }

        PacketType::GenerateCancel => {
            if let Err(e) = generations.cancel(connection_id) {
                debug!(connection = %connection_id, "Cancel ignored: {}", e);
            }
            Flow::Continue
        }

        PacketType::Disconnect { reason, message } => {
            debug!(connection = %connection_id, reason, "Client disconnect: {}", message);
            Flow::Close(disconnect_reason::USER_INITIATED, "Client disconnected".to_string())
        }

        PacketType::Hello { .. } => {
            session.send(create_error_packet(error_code::INVALID_STATE, "Handshake already started"));
            Flow::Close(disconnect_reason::PROTOCOL_VIOLATION, "Repeated Hello".to_string())
        }

        other => {
            session.send(create_error_packet(
                error_code::INVALID_MESSAGE,
                &format!("Unexpected {} packet from client", get_packet_type_name(&other)),
            ));
            Flow::Continue
        }
    }
}
