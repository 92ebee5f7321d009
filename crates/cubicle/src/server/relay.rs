//! Websocket relay for interactive sessions
//!
//! Client frames are written to the program's stdin as-is; program output is
//! forwarded in arrival order, as text when it is valid UTF-8 and binary
//! otherwise. Closing the socket detaches the client but leaves the session
//! running.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{Instrument, debug, info_span, warn};

use crate::runner::{InteractiveEvent, Runner};

pub(crate) async fn upgrade(
    State(runner): State<Runner>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        let span = info_span!("relay", session = %session_id);
        relay(runner, session_id, socket).instrument(span)
    })
}

async fn relay(runner: Runner, session_id: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let (mut events, handle) = match runner.connect(&session_id).await {
        Ok(attached) => attached,
        Err(e) => {
            debug!(error = %e, "attach refused");
            let _ = sender.send(Message::Text(format!("error: {e}\n").into())).await;
            close(&mut sender).await;
            return;
        }
    };
    debug!("client attached");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(InteractiveEvent::Stdout(data)) | Some(InteractiveEvent::Stderr(data)) => {
                    if sender.send(frame(data)).await.is_err() {
                        break;
                    }
                }
                Some(InteractiveEvent::Exited(code)) => {
                    let line = match code {
                        Some(code) => format!("\n[process exited with code {code}]\n"),
                        None => "\n[process exited]\n".to_owned(),
                    };
                    let _ = sender.send(Message::Text(line.into())).await;
                    close(&mut sender).await;
                    break;
                }
                None => {
                    close(&mut sender).await;
                    break;
                }
            },

            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle.write(text.as_str().as_bytes()).await {
                        warn!(error = %e, "stdin closed");
                        close(&mut sender).await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = handle.write(&data).await {
                        warn!(error = %e, "stdin closed");
                        close(&mut sender).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "socket error");
                    break;
                }
            },
        }
    }
    debug!("client detached");
}

fn frame(data: Bytes) -> Message {
    match std::str::from_utf8(&data) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(data),
    }
}

async fn close(sender: &mut SplitSink<WebSocket, Message>) {
    let _ = sender.send(Message::Close(None)).await;
}
