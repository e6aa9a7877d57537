//! WebSocket Handler
//!
//! One reader loop per connection feeds the dispatcher; a writer task
//! drains the connection's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::authenticator::RequestContext;
use crate::connections::Outbound;
use crate::gateway::GatewayCore;

use super::dispatch::{ConnectionContext, DispatchResult, dispatch_frame};

/// How long a server-initiated close waits for queued messages to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle one upgraded WebSocket until either side closes it.
pub async fn handle_connection(socket: WebSocket, core: Arc<GatewayCore>, request: RequestContext) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = core.open_connection(tx);
    info!(conn_id = %connection_id, ip = %request.ip_address, "WebSocket connection opened");

    // Task to send messages to WebSocket
    let metrics = core.metrics().clone();
    let mut sender_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Message(msg) => msg,
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            metrics.message_sent();
        }
    });

    // Frames are dispatched one at a time, in arrival order.
    let ctx = ConnectionContext {
        connection_id: connection_id.clone(),
        request,
        core: core.clone(),
    };
    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if dispatch_frame(&ctx, text.as_str()) == DispatchResult::Close {
                        return true;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    core.metrics().websocket_error();
                    debug!(conn_id = %connection_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
        false
    };

    let server_closing = tokio::select! {
        _ = &mut sender_task => {
            debug!("Sender task ended");
            false
        }
        closing = input_task => {
            debug!("Input task ended");
            closing
        }
    };

    core.close_connection(&connection_id);
    if server_closing
        && tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut sender_task)
            .await
            .is_err()
    {
        debug!(conn_id = %connection_id, "Timed out flushing before close");
    }
    sender_task.abort();

    info!(conn_id = %connection_id, "WebSocket connection closed");
}
