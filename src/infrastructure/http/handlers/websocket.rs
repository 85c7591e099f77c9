//! WebSocket Handler - 任务进度推送

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::domain::task::TaskId;
use crate::infrastructure::http::state::AppState;

/// 任务 WebSocket 连接处理
///
/// 先推送历史事件，再推送实时事件；任务结束后服务端关闭连接
pub async fn task_websocket_handler(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_task_socket(socket, task_id, state))
}

async fn handle_task_socket(socket: WebSocket, raw_task_id: String, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // 验证任务存在
    let task_id = match TaskId::parse(&raw_task_id) {
        Some(id) if state.orchestrator.status(&id).is_ok() => id,
        _ => {
            tracing::warn!(task_id = %raw_task_id, "WebSocket connection rejected: unknown task");
            let _ = sender.close().await;
            return;
        }
    };

    let (mut event_rx, unsubscribe) = state.orchestrator.tracker().subscribe(task_id).into_parts();

    tracing::info!(task_id = %task_id, "WebSocket connected");

    // 事件转发任务
    let mut forward_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let msg = match serde_json::to_string(&event) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize event");
                    continue;
                }
            };

            if let Err(e) = sender.send(msg).await {
                tracing::debug!(task_id = %task_id, error = %e, "Failed to send WebSocket message");
                return;
            }
        }
        // 任务结束或订阅者被断开
        let _ = sender.close().await;
    });

    // 接收客户端消息（心跳）
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    tracing::info!(task_id = %task_id, "WebSocket closed by client");
                    break;
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    // 等待任一任务完成
    tokio::select! {
        _ = &mut forward_task => receive_task.abort(),
        _ = &mut receive_task => forward_task.abort(),
    }

    unsubscribe.unsubscribe();
    tracing::info!(task_id = %task_id, "WebSocket disconnected");
}
