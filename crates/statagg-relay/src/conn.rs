use axum::extract::ws::{CloseFrame, Message};
use statagg_core::protocol::{encode_message, RelayMessage, DEFAULT_MAX_FRAME_BYTES};
use tokio::sync::mpsc;
use tracing::warn;

/// Handle for one peer socket. Owns no business state; the registry and the
/// observer set hold clones and use it purely for delivery and close.
///
/// Sends are fire-and-forget: `try_send` onto the bounded writer queue, so
/// nothing ever blocks on a slow peer while hub locks are held.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: u64,
    sender: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(conn_id: u64, sender: mpsc::Sender<Message>) -> Self {
        Self { conn_id, sender }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue an outbound message. Returns false if the frame could not be
    /// accepted (encode failure, peer gone, or writer queue full).
    pub fn send(&self, message: &RelayMessage) -> bool {
        let frame = match encode_message(message, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "encode_error", conn_id = self.conn_id, error = %err);
                return false;
            }
        };
        let text = match String::from_utf8(frame) {
            Ok(text) => text,
            Err(_) => return false,
        };
        match self.sender.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_backpressure", conn_id = self.conn_id);
                false
            }
        }
    }

    pub fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: reason.to_string().into(),
        })));
    }
}
