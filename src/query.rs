//! Simple-protocol query runner for catalog lookups and EXPLAIN.

use tracing::debug;
use typeprobe_pg::{BackendMessage, FrontendMessage, MessageChannel, MessageKind, PgError, PgResult};

/// One result row, every value as text; SQL NULL is `None`.
pub type Row = Vec<Option<String>>;

/// Run `sql` with a simple Query message and collect its rows as text.
///
/// The channel is idle-ready when this returns, even when the server
/// rejected the query (that comes back as [`PgError::Server`]) or answered
/// it with something other than a result set.
pub async fn run_query<C>(sql: &str, channel: &mut C) -> PgResult<Vec<Row>>
where
    C: MessageChannel + ?Sized,
{
    debug!(%sql, "simple query");
    channel.send(FrontendMessage::Query(sql.to_string())).await?;

    match collect_rows(channel).await {
        Ok(rows) => {
            channel.reply(&[MessageKind::ReadyForQuery]).await?;
            Ok(rows)
        }
        Err(e @ (PgError::Server(_) | PgError::Protocol(_))) => {
            drain_to_ready(channel).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

async fn collect_rows<C>(channel: &mut C) -> PgResult<Vec<Row>>
where
    C: MessageChannel + ?Sized,
{
    channel.reply(&[MessageKind::RowDescription]).await?;

    let mut rows = Vec::new();
    loop {
        match channel
            .reply(&[MessageKind::DataRow, MessageKind::CommandComplete])
            .await?
        {
            BackendMessage::DataRow(columns) => rows.push(
                columns
                    .into_iter()
                    .map(|value| value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
                    .collect(),
            ),
            BackendMessage::CommandComplete(tag) => {
                debug!(%tag, rows = rows.len(), "command complete");
                return Ok(rows);
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "unexpected {:?} in query result",
                    other.kind()
                )));
            }
        }
    }
}

/// Skip whatever the server still has queued for a failed query.
async fn drain_to_ready<C>(channel: &mut C) -> PgResult<()>
where
    C: MessageChannel + ?Sized,
{
    loop {
        if let BackendMessage::ReadyForQuery(_) = channel.recv().await? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use typeprobe_pg::testing::ScriptedChannel;

    #[tokio::test]
    async fn test_rows_as_text() {
        let mut channel = ScriptedChannel::new();
        channel.push_query_result(
            &["oid", "typname"],
            &[&[Some("23"), Some("int4")], &[Some("25"), None]],
            "SELECT 2",
        );

        let rows = run_query("SELECT oid, typname FROM pg_type", &mut channel)
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("23".to_string()), Some("int4".to_string())],
                vec![Some("25".to_string()), None],
            ]
        );
        assert!(channel.is_exhausted());
        assert_eq!(
            channel.sent(),
            &[FrontendMessage::Query("SELECT oid, typname FROM pg_type".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_result() {
        let mut channel = ScriptedChannel::new();
        channel.push_query_result(&["x"], &[], "SELECT 0");

        let rows = run_query("SELECT 1 WHERE false", &mut channel).await.unwrap();
        assert!(rows.is_empty());
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_server_error_leaves_channel_ready() {
        let mut channel = ScriptedChannel::new();
        channel.push_error("42501", "permission denied for table secrets");
        channel.push_ready();

        let err = run_query("SELECT * FROM secrets", &mut channel)
            .await
            .unwrap_err();
        assert_eq!(err.server_fields().map(|f| f.code.as_str()), Some("42501"));
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_error_after_rows_drains() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::RowDescription(vec![
            typeprobe_pg::testing::text_field("n"),
        ]));
        channel.push(BackendMessage::DataRow(vec![Some(b"1".to_vec())]));
        channel.push_error("22012", "division by zero");
        channel.push_ready();

        let err = run_query("SELECT 1 / (n - 1) FROM t", &mut channel)
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Server(_)));
        assert!(channel.is_exhausted());
    }
}
