//! Parse/Describe probing: the server's view of a query's types without
//! executing it.

use tracing::debug;
use typeprobe_pg::{
    BackendMessage, ErrorFields, FrontendMessage, MessageChannel, MessageKind, PgError, PgResult,
    Target, statement_name,
};

use crate::types::{Outcome, ParseError, RawTypeData, TypeDescription};

/// Prepare `sql` under its deterministic statement name, describe it and
/// close it again.
///
/// A query the server rejects yields [`Outcome::ServerError`]; either way
/// the Sync has been answered before this returns.
pub async fn probe<C>(sql: &str, channel: &mut C) -> PgResult<RawTypeData>
where
    C: MessageChannel + ?Sized,
{
    let name = statement_name(sql);
    debug!(statement = %name, "probe");

    channel
        .send(FrontendMessage::Parse {
            name: name.clone(),
            query: sql.to_string(),
            param_types: Vec::new(),
        })
        .await?;
    channel
        .send(FrontendMessage::Describe {
            target: Target::Statement,
            name: name.clone(),
        })
        .await?;
    channel
        .send(FrontendMessage::Close {
            target: Target::Statement,
            name,
        })
        .await?;
    channel.send(FrontendMessage::Flush).await?;

    let parsed = channel
        .reply(&[MessageKind::ErrorResponse, MessageKind::ParseComplete])
        .await;
    // Sync on every path: the server holds the rest of the batch until then
    channel.send(FrontendMessage::Sync).await?;

    let described = match parsed? {
        BackendMessage::ErrorResponse(fields) => Err(fields),
        _ => describe_replies(channel).await?,
    };
    channel.reply(&[MessageKind::ReadyForQuery]).await?;

    Ok(match described {
        Ok(description) => {
            debug!(
                params = description.params.len(),
                fields = description.fields.len(),
                "described"
            );
            Outcome::Ok(description)
        }
        Err(fields) => {
            debug!(code = %fields.code, message = %fields.message, "rejected");
            Outcome::ServerError(ParseError::from_server(&fields))
        }
    })
}

/// ParameterDescription, RowDescription and CloseComplete; an ErrorResponse
/// in their place ends the batch.
async fn describe_replies<C>(channel: &mut C) -> PgResult<Result<TypeDescription, ErrorFields>>
where
    C: MessageChannel + ?Sized,
{
    let params = match channel
        .reply(&[
            MessageKind::ParameterDescription,
            MessageKind::NoData,
            MessageKind::ErrorResponse,
        ])
        .await?
    {
        BackendMessage::ParameterDescription(oids) => oids,
        BackendMessage::ErrorResponse(fields) => return Ok(Err(fields)),
        _ => Vec::new(),
    };

    let fields = match channel
        .reply(&[
            MessageKind::RowDescription,
            MessageKind::NoData,
            MessageKind::ErrorResponse,
        ])
        .await?
    {
        BackendMessage::RowDescription(fields) => fields.into_iter().map(Into::into).collect(),
        BackendMessage::ErrorResponse(fields) => return Ok(Err(fields)),
        _ => Vec::new(),
    };

    match channel
        .reply(&[MessageKind::CloseComplete, MessageKind::ErrorResponse])
        .await?
    {
        BackendMessage::CloseComplete => Ok(Ok(TypeDescription { params, fields })),
        BackendMessage::ErrorResponse(fields) => Ok(Err(fields)),
        other => Err(PgError::Protocol(format!(
            "unexpected {:?} after describe",
            other.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeField;
    use pretty_assertions::assert_eq;
    use typeprobe_pg::testing::ScriptedChannel;
    use typeprobe_pg::FieldDescription;

    const SQL: &str = "SELECT id, name FROM users WHERE id = $1";

    fn users_field(name: &str, attr: i16, type_oid: u32) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 16384,
            column_attr: attr,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }

    #[tokio::test]
    async fn test_probe_describes_statement() {
        let mut channel = ScriptedChannel::new();
        channel
            .push(BackendMessage::ParseComplete)
            .push(BackendMessage::ParameterDescription(vec![23]))
            .push(BackendMessage::RowDescription(vec![
                users_field("id", 1, 23),
                users_field("name", 2, 25),
            ]))
            .push(BackendMessage::CloseComplete)
            .push_ready();

        let data = probe(SQL, &mut channel).await.unwrap();
        let description = match data {
            Outcome::Ok(description) => description,
            other => panic!("expected description, got {:?}", other),
        };
        assert_eq!(description.params, vec![23]);
        assert_eq!(
            description.fields,
            vec![
                TypeField::from(users_field("id", 1, 23)),
                TypeField::from(users_field("name", 2, 25)),
            ]
        );

        let name = statement_name(SQL);
        assert_eq!(
            channel.sent(),
            &[
                FrontendMessage::Parse {
                    name: name.clone(),
                    query: SQL.to_string(),
                    param_types: vec![],
                },
                FrontendMessage::Describe {
                    target: Target::Statement,
                    name: name.clone(),
                },
                FrontendMessage::Close {
                    target: Target::Statement,
                    name,
                },
                FrontendMessage::Flush,
                FrontendMessage::Sync,
            ]
        );
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_probe_no_data() {
        let mut channel = ScriptedChannel::new();
        channel
            .push(BackendMessage::ParseComplete)
            .push(BackendMessage::NoData)
            .push(BackendMessage::NoData)
            .push(BackendMessage::CloseComplete)
            .push_ready();

        let data = probe("LISTEN jobs", &mut channel).await.unwrap();
        assert_eq!(data, Outcome::Ok(TypeDescription::default()));
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_probe_syntax_error() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::ErrorResponse(ErrorFields {
            severity: "ERROR".to_string(),
            code: "42601".to_string(),
            message: "syntax error at or near \"SELEC\"".to_string(),
            position: Some(1),
            routine: Some("scanner_yyerror".to_string()),
            ..Default::default()
        }));
        channel.push_ready();

        let data = probe("SELEC 1", &mut channel).await.unwrap();
        assert_eq!(
            data,
            Outcome::ServerError(ParseError {
                error_code: "scanner_yyerror".to_string(),
                message: "syntax error at or near \"SELEC\"".to_string(),
                hint: None,
                position: Some(1),
                sqlstate: Some("42601".to_string()),
            })
        );
        assert_eq!(channel.sent().last(), Some(&FrontendMessage::Sync));
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_probe_error_during_describe() {
        let mut channel = ScriptedChannel::new();
        channel
            .push(BackendMessage::ParseComplete)
            .push_error("42P18", "could not determine data type of parameter $1")
            .push_ready();

        let data = probe("SELECT $1", &mut channel).await.unwrap();
        assert!(matches!(data, Outcome::ServerError(e) if e.error_code == "42P18"));
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_probe_channel_failure_propagates() {
        let mut channel = ScriptedChannel::new();
        let err = probe("SELECT 1", &mut channel).await.unwrap_err();
        assert!(matches!(err, PgError::Connection(_)));
        // Sync still went out
        assert_eq!(channel.sent().last(), Some(&FrontendMessage::Sync));
    }
}
