use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use courier_types::events::{ClientCommand, DeliveryEvent};

use crate::broker::Broker;
use crate::registry::ConnectionId;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve one gateway WebSocket until either side closes it.
///
/// The connection starts unbound and receives nothing until it identifies or
/// joins a conversation. On close every membership is discarded.
pub async fn handle_connection(socket: WebSocket, broker: Broker) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = broker.connect().await;
    debug!("Connection {} opened", conn_id);

    // Set by the reader on every Pong
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward routed events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode event for {}: {}", conn_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout on {} (missed {} pongs), dropping connection", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let broker_recv = broker.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => handle_command(&broker_recv, conn_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "Connection {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            truncate(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let identity = broker.registry().identity_of(conn_id).await;
    broker.disconnect(conn_id).await;
    match identity {
        Some((id, _)) => info!("{} disconnected from gateway ({})", id, conn_id),
        None => debug!("Unidentified connection {} closed", conn_id),
    }
}

async fn handle_command(broker: &Broker, conn_id: ConnectionId, cmd: ClientCommand) {
    match cmd {
        ClientCommand::Identify { id, role } => {
            broker.identify(conn_id, id, role).await;
        }

        ClientCommand::Join { room } => broker.join(conn_id, &room).await,

        ClientCommand::Leave { room } => broker.leave(conn_id, &room).await,

        ClientCommand::NewMessage(event) => {
            if let Err(reason) = admit(broker, conn_id, &event).await {
                warn!(
                    "Connection {} publish of {} rejected: {}",
                    conn_id, event.id, reason
                );
                return;
            }
            broker.publish(event).await;
        }
    }
}

/// A connection may only publish its own, correctly addressed messages.
async fn admit(broker: &Broker, conn_id: ConnectionId, event: &DeliveryEvent) -> Result<(), String> {
    let Some((identity, _)) = broker.registry().identity_of(conn_id).await else {
        return Err("connection has not identified".into());
    };
    if identity != event.sender_id {
        return Err(format!(
            "sender {} does not match bound identity {}",
            event.sender_id, identity
        ));
    }
    if !event.is_well_addressed() {
        return Err(format!(
            "conversation {} does not belong to {} and {}",
            event.conversation_id, event.sender_id, event.receiver_id
        ));
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_types::models::{MessageKind, Role};
    use courier_types::{MessageId, ParticipantId, resolve};

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn event(from: &str, to: &str) -> DeliveryEvent {
        DeliveryEvent {
            conversation_id: resolve(&pid(from), &pid(to)),
            id: MessageId::new("m1").unwrap(),
            sender_id: pid(from),
            sender_name: from.into(),
            receiver_id: pid(to),
            message: "hi".into(),
            message_type: MessageKind::Text,
            file_url: None,
            file_name: None,
            file_type: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn admission_requires_matching_bound_sender() {
        let broker = Broker::new();
        let (conn, _rx) = broker.connect().await;
        assert!(admit(&broker, conn, &event("A", "B")).await.is_err());

        broker.identify(conn, pid("A"), Role::User).await;
        assert!(admit(&broker, conn, &event("A", "B")).await.is_ok());
        assert!(admit(&broker, conn, &event("C", "B")).await.is_err());

        let mut misaddressed = event("A", "B");
        misaddressed.conversation_id = resolve(&pid("A"), &pid("C"));
        assert!(admit(&broker, conn, &misaddressed).await.is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 200), "hi");
    }
}
