use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use grove_core::Event;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::broadcast::Broadcaster;
use crate::protocol::Inbound;
use crate::registry::Channel;

/// Run one client connection from upgrade to close.
///
/// The socket is split: a writer task drains the channel's outbound queue,
/// while this task reads control messages and replies through the same
/// queue so per-channel ordering is kept. On any exit path the channel is
/// unregistered and the remaining viewers get `client_disconnected`.
pub async fn run_channel(socket: WebSocket, broadcaster: Arc<Broadcaster>, queue_size: usize) {
    let (channel, outbound) = Channel::new(queue_size);
    let span = tracing::info_span!("channel", channel_id = %channel.id());
    drive(socket, channel, outbound, broadcaster)
        .instrument(span)
        .await
}

async fn drive(
    socket: WebSocket,
    channel: Arc<Channel>,
    outbound: mpsc::Receiver<String>,
    broadcaster: Arc<Broadcaster>,
) {
    let send_timeout = broadcaster.send_timeout();
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(
        write_loop(sink, outbound, channel.clone(), send_timeout).in_current_span(),
    );

    let registry = broadcaster.registry().clone();
    registry.register(channel.clone());
    info!(connections = registry.count(), "channel opened");

    let greeting = Event::connection_established(registry.count());
    match broadcaster.send_to_one(&greeting, &channel).await {
        Ok(()) => read_loop(&mut stream, &channel, &broadcaster).await,
        Err(e) => warn!(error = %e, "greeting failed, closing channel"),
    }

    channel.close();
    registry.unregister(channel.id());
    let remaining = registry.count();
    info!(connections = remaining, "channel closed");
    broadcaster
        .broadcast_to_all(&Event::client_disconnected(remaining))
        .await;

    if tokio::time::timeout(send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    channel: &Channel,
    broadcaster: &Broadcaster,
) {
    loop {
        let frame = tokio::select! {
            _ = channel.closed() => {
                debug!("channel closed by server");
                return;
            }
            frame = stream.next() => frame,
        };

        let inbound = match frame {
            Some(Ok(Message::Text(text))) => Inbound::parse(text.as_str()),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => Inbound::parse(text),
                Err(_) => Inbound::Malformed,
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!("peer closed");
                return;
            }
            // Transport-level ping/pong is answered by the websocket layer.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "read failed");
                return;
            }
        };

        match &inbound {
            Inbound::Unrecognized { action } => {
                warn!(action = action.as_deref().unwrap_or("null"), "unrecognized action");
            }
            Inbound::Malformed => debug!("malformed message"),
            Inbound::Ping { .. } => {}
        }

        if let Err(e) = broadcaster.send_to_one(&inbound.reply(), channel).await {
            warn!(error = %e, "reply failed, closing channel");
            return;
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    channel: Arc<Channel>,
    send_timeout: Duration,
) {
    loop {
        let text = tokio::select! {
            biased;
            _ = channel.closed() => break,
            next = outbound.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };

        match tokio::time::timeout(send_timeout, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "socket write failed");
                break;
            }
            Err(_) => {
                warn!(timeout_ms = send_timeout.as_millis() as u64, "socket write timed out");
                break;
            }
        }
    }

    // Later deliveries fail fast and the reader wakes up.
    channel.close();
    outbound.close();
    let _ = tokio::time::timeout(send_timeout, sink.close()).await;
}
