use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Path, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    device::Slot,
    error::Error,
    http::AppContext,
    router::{ClientId, Router, WriteKind},
};

/// Close code used when an error escapes the receive loop.
const ABNORMAL_CLOSURE: u16 = 1011;

/// Upgrade handler for `/ws/:slot`.
///
/// The slot is validated against the current mapping before the handshake
/// completes; an unknown slot is turned away with a plain 404 instead of an
/// accepted-then-dropped websocket.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(slot): Path<String>,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(ctx): Extension<AppContext>,
) -> impl IntoResponse {
    let Ok(slot) = slot.parse::<Slot>() else {
        return (StatusCode::NOT_FOUND, format!("`{slot}` is not a slot id")).into_response();
    };

    if !ctx.store.snapshot().contains(slot) {
        return (
            StatusCode::NOT_FOUND,
            Error::UnknownSlot(slot.to_string()).to_string(),
        )
            .into_response();
    }

    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected for slot {slot}", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("client", %slot, %addr);
        handle_socket(socket, slot, ctx.router.clone()).instrument(span)
    })
    .into_response()
}

async fn handle_socket(mut socket: WebSocket, slot: Slot, router: Router) {
    let id = ClientId::new_v4();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

    if let Err(e) = router.register_client(slot, id, outbox_tx).await {
        // The mapping was replaced between handshake and upgrade.
        info!("Turning the client away after all: {e}");
        socket
            .send(Message::Close(Some(CloseFrame {
                code: ABNORMAL_CLOSURE,
                reason: e.to_string().into(),
            })))
            .await
            .ok();
        return;
    }

    let (sink, stream) = socket.split();
    let (close_tx, close_rx) = oneshot::channel();

    let write_handle = tokio::spawn(write(sink, outbox_rx, close_rx).in_current_span());

    let result = read(stream, slot, &router).await;

    match result {
        Ok(()) => {
            debug!("Client disconnected");
            drop(close_tx);
        }
        Err(e) => {
            warn!("Closing client connection: {e}");
            close_tx
                .send(CloseFrame {
                    code: ABNORMAL_CLOSURE,
                    reason: e.to_string().into(),
                })
                .ok();
        }
    }

    router.unregister_client(slot, id).await;

    // Courtesy note so the remaining observers of the slot see that
    // somebody left.
    router.broadcast(slot, "").await;

    // Bounded: the close channel is resolved and the outbox sender is gone.
    write_handle.await.ok();
}

/// Pump inbound messages until the peer goes away or routing fails.
async fn read(
    mut stream: SplitStream<WebSocket>,
    slot: Slot,
    router: &Router,
) -> Result<(), Error> {
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if router.handle_global_command(&text).await {
                    continue;
                }

                router
                    .route_to_device(slot, text.as_bytes(), WriteKind::Text)
                    .await?;
            }
            Message::Binary(_) => {
                debug!("Client sent binary data, ignoring");
            }
            Message::Ping(_) => {
                debug!("Socket ping");
            }
            Message::Pong(_) => {
                debug!("Socket pong");
            }
            Message::Close(_) => {
                debug!("Client sent close");
            }
        }
    }

    Ok(())
}

/// Pump broadcast lines out to the peer; a close frame request wins over
/// queued lines.
async fn write(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    mut close: oneshot::Receiver<CloseFrame<'static>>,
) {
    loop {
        tokio::select! {
            // A requested close beats queued lines; the peer is done for
            // either way.
            biased;

            frame = &mut close => {
                if let Ok(frame) = frame {
                    sink.send(Message::Close(Some(frame))).await.ok();
                }
                return;
            }

            line = outbox.recv() => match line {
                Some(line) => {
                    if sink.send(Message::Text(line)).await.is_err() {
                        debug!("Client went away mid-write");
                        return;
                    }
                }
                None => return,
            },
        }
    }
}
