//! Socket I/O for `PgConnection`.
//!
//! Frames go out through a reused write buffer; replies are decoded from a
//! growing read buffer, one complete frame at a time.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{MessageChannel, PgConnection, PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage};

/// Largest backend frame accepted before the stream is considered corrupt.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

#[async_trait]
impl MessageChannel for PgConnection {
    async fn send(&mut self, msg: FrontendMessage) -> PgResult<()> {
        self.write_buf.clear();
        msg.encode_to(&mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        // PostgreSQL waits on a full frame; don't let it sit in a buffer
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> PgResult<BackendMessage> {
        loop {
            if self.buffer.len() >= 5 {
                let msg_len = u32::from_be_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]) as usize;

                if !(4..=MAX_MESSAGE_LEN).contains(&msg_len) {
                    return Err(PgError::Protocol(format!(
                        "Invalid message length {} for type '{}'",
                        msg_len, self.buffer[0] as char
                    )));
                }

                if self.buffer.len() > msg_len {
                    let msg_bytes = self.buffer.split_to(msg_len + 1);
                    let (msg, _) = BackendMessage::decode(&msg_bytes).map_err(PgError::Protocol)?;
                    return Ok(msg);
                }
            }

            if self.buffer.capacity() - self.buffer.len() < 8192 {
                self.buffer.reserve(super::connection::BUFFER_CAPACITY);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(PgError::Connection("Connection closed".to_string()));
            }
        }
    }
}
