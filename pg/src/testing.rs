//! In-memory `MessageChannel` replaying a scripted server conversation.
//!
//! ```ignore
//! let mut channel = ScriptedChannel::new();
//! channel.push_query_result(&["one"], &[&[Some("1")]], "SELECT 1");
//! let rows = run_query("SELECT 1", &mut channel).await?;
//! assert!(channel.is_exhausted());
//! ```

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::driver::{MessageChannel, PgError, PgResult};
use crate::protocol::{
    BackendMessage, ErrorFields, FieldDescription, FrontendMessage, TransactionStatus,
};

/// `text` type oid
const TEXT_OID: u32 = 25;

/// Replies queued in order; every sent message is encoded (so encode errors
/// surface exactly as on a socket) and recorded.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    replies: VecDeque<BackendMessage>,
    sent: Vec<FrontendMessage>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: BackendMessage) -> &mut Self {
        self.replies.push_back(msg);
        self
    }

    /// ReadyForQuery, idle.
    pub fn push_ready(&mut self) -> &mut Self {
        self.push(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
    }

    /// A complete simple-query answer: RowDescription, DataRows,
    /// CommandComplete and ReadyForQuery.
    pub fn push_query_result(
        &mut self,
        columns: &[&str],
        rows: &[&[Option<&str>]],
        tag: &str,
    ) -> &mut Self {
        self.push(BackendMessage::RowDescription(
            columns.iter().map(|name| text_field(name)).collect(),
        ));
        for row in rows {
            self.push(BackendMessage::DataRow(
                row.iter()
                    .map(|value| value.map(|v| v.as_bytes().to_vec()))
                    .collect(),
            ));
        }
        self.push(BackendMessage::CommandComplete(tag.to_string()));
        self.push_ready()
    }

    /// ErrorResponse with severity ERROR.
    pub fn push_error(&mut self, code: &str, message: &str) -> &mut Self {
        self.push(BackendMessage::ErrorResponse(error_fields(code, message)))
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> &[FrontendMessage] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<FrontendMessage> {
        std::mem::take(&mut self.sent)
    }

    /// True once every scripted reply has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.replies.len()
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    async fn send(&mut self, msg: FrontendMessage) -> PgResult<()> {
        let mut buf = BytesMut::new();
        msg.encode_to(&mut buf)?;
        self.sent.push(msg);
        Ok(())
    }

    async fn recv(&mut self) -> PgResult<BackendMessage> {
        self.replies.pop_front().ok_or_else(|| {
            PgError::Connection("Connection closed (script exhausted)".to_string())
        })
    }
}

/// ERROR-severity fields with the given SQLSTATE and message.
pub fn error_fields(code: &str, message: &str) -> ErrorFields {
    ErrorFields {
        severity: "ERROR".to_string(),
        code: code.to_string(),
        message: message.to_string(),
        ..Default::default()
    }
}

/// A text-format column not tied to any table.
pub fn text_field(name: &str) -> FieldDescription {
    FieldDescription {
        name: name.to_string(),
        table_oid: 0,
        column_attr: 0,
        type_oid: TEXT_OID,
        type_size: -1,
        type_modifier: -1,
        format: 0,
    }
}
