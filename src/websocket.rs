use crate::app_state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

// Diffuse chaque événement (likes, favoris, vidage du cache) au client, en JSON.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let sid = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!("Websocket {sid} connected");

    let mut event_rx = state.events.subscribe();
    let send_sid = sid.clone();
    let send_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    let Ok(msg) = serde_json::to_string(event.as_ref()) else {
                        continue;
                    };
                    if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Websocket {send_sid} lagging, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Le client ne fait qu'écouter : ses messages sont ignorés jusqu'à la fermeture.
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    send_task.abort();
    info!("Websocket {sid} disconnected");
}
