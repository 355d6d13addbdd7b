//! Executability check: `EXPLAIN EXECUTE` the prepared statement with all
//! arguments NULL, so permission and planner errors surface without running
//! the query.

use tracing::{debug, warn};
use typeprobe_pg::{
    BackendMessage, FrontendMessage, MessageChannel, MessageKind, PgError, PgResult, Target,
    statement_name,
};

use crate::escape::escape_identifier;
use crate::query::run_query;
use crate::types::{Outcome, ParseError, RawTypeData};

/// `EXPLAIN EXECUTE "<name>" (null, ...)`, one `null` per parameter and no
/// argument list at all for zero parameters.
pub fn explain_statement(name: &str, param_count: usize) -> String {
    let mut sql = format!("EXPLAIN EXECUTE {}", escape_identifier(name));
    if param_count > 0 {
        sql.push_str(" (");
        sql.push_str(&vec!["null"; param_count].join(", "));
        sql.push(')');
    }
    sql
}

/// Prove that a probed statement can actually run; returns the plan lines.
///
/// Passes an earlier [`Outcome::ServerError`] straight through. Whatever
/// happens in between, the statement is released and the connection is
/// idle-ready on return.
pub async fn validate<C>(
    sql: &str,
    type_data: &RawTypeData,
    channel: &mut C,
) -> PgResult<Outcome<Vec<String>>>
where
    C: MessageChannel + ?Sized,
{
    let description = match type_data {
        Outcome::Ok(description) => description,
        Outcome::ServerError(e) => return Ok(Outcome::ServerError(e.clone())),
    };

    let mut scope = PreparedScope::new(statement_name(sql));
    let result = explain(sql, description.params.len(), &mut scope, channel).await;
    let released = scope.release(channel).await;

    let outcome = result?;
    released?;
    Ok(outcome)
}

async fn explain<C>(
    sql: &str,
    param_count: usize,
    scope: &mut PreparedScope,
    channel: &mut C,
) -> PgResult<Outcome<Vec<String>>>
where
    C: MessageChannel + ?Sized,
{
    channel
        .send(FrontendMessage::Parse {
            name: scope.name.clone(),
            query: sql.to_string(),
            param_types: Vec::new(),
        })
        .await?;
    channel.send(FrontendMessage::Flush).await?;

    if let BackendMessage::ErrorResponse(fields) = channel
        .reply(&[MessageKind::ErrorResponse, MessageKind::ParseComplete])
        .await?
    {
        scope.latched = true;
        return Ok(Outcome::ServerError(ParseError::from_server(&fields)));
    }

    let explain_sql = explain_statement(&scope.name, param_count);
    match run_query(&explain_sql, channel).await {
        Ok(rows) => {
            let plan: Vec<String> = rows
                .into_iter()
                .filter_map(|row| row.into_iter().next().flatten())
                .collect();
            debug!(statement = %scope.name, lines = plan.len(), "explained");
            Ok(Outcome::Ok(plan))
        }
        Err(e) => {
            warn!(statement = %scope.name, error = %e, "explain failed");
            Ok(Outcome::ServerError(explain_failure(&e)))
        }
    }
}

fn explain_failure(e: &PgError) -> ParseError {
    match e.server_fields() {
        Some(fields) => {
            ParseError::explain_failed(fields.message.clone(), Some(fields.code.clone()))
        }
        None => ParseError::explain_failed(e.to_string(), None),
    }
}

/// Statement prepared for the explain step, released exactly once.
struct PreparedScope {
    name: String,
    /// The server rejected the Parse and is skipping input until Sync.
    latched: bool,
}

impl PreparedScope {
    fn new(name: String) -> Self {
        Self {
            name,
            latched: false,
        }
    }

    async fn release<C>(self, channel: &mut C) -> PgResult<()>
    where
        C: MessageChannel + ?Sized,
    {
        if self.latched {
            channel.send(FrontendMessage::Sync).await?;
            channel.reply(&[MessageKind::ReadyForQuery]).await?;
            return Ok(());
        }

        channel
            .send(FrontendMessage::Close {
                target: Target::Statement,
                name: self.name,
            })
            .await?;
        channel.send(FrontendMessage::Flush).await?;
        channel.send(FrontendMessage::Sync).await?;
        channel.reply(&[MessageKind::CloseComplete]).await?;
        channel.reply(&[MessageKind::ReadyForQuery]).await?;
        Ok(())
    }
}
