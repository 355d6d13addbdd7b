//! The message channel every protocol step is written against.
//!
//! `PgConnection` implements it over a socket; `testing::ScriptedChannel`
//! replays a scripted server conversation.

use async_trait::async_trait;
use tracing::debug;

use super::{PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage, MessageKind};

/// Ordered, half-duplex exchange of protocol messages with one server.
///
/// Callers keep at most one request sequence outstanding and must consume
/// every reply it produces before starting the next.
#[async_trait]
pub trait MessageChannel: Send {
    /// Encode and write one message. May wait on socket backpressure.
    async fn send(&mut self, msg: FrontendMessage) -> PgResult<()>;

    /// Wait for the next message from the server.
    async fn recv(&mut self) -> PgResult<BackendMessage>;

    /// Wait for the next message whose kind is in `expected`.
    ///
    /// Notices, parameter status changes and notifications the caller did
    /// not ask for are logged and skipped. Any other message fails: an
    /// ErrorResponse as [`PgError::Server`], everything else as
    /// [`PgError::Protocol`].
    async fn reply(&mut self, expected: &[MessageKind]) -> PgResult<BackendMessage> {
        loop {
            let msg = self.recv().await?;
            if expected.contains(&msg.kind()) {
                return Ok(msg);
            }
            match msg {
                BackendMessage::NoticeResponse(notice) => {
                    debug!(severity = %notice.severity, message = %notice.message, "server notice");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    debug!(%name, %value, "parameter status");
                }
                BackendMessage::NotificationResponse { channel, .. } => {
                    debug!(%channel, "notification");
                }
                BackendMessage::ErrorResponse(fields) => return Err(PgError::Server(fields)),
                other => return Err(PgError::unexpected(expected, other.kind())),
            }
        }
    }
}
