//! Startup and authentication handshake.
//!
//! Sends the StartupMessage, answers whichever password mechanism the server
//! picks (cleartext, MD5 or SCRAM-SHA-256), then waits for ReadyForQuery.

use tracing::{debug, error, info};

use super::{ConnectionOptions, MessageChannel, PgError, PgResult};
use crate::protocol::{
    BackendMessage, FrontendMessage, MessageKind, SCRAM_SHA_256, SaslHelper, md5_password,
};

/// `application_name` reported to the server.
pub const APPLICATION_NAME: &str = "typeprobe";

/// Replies the server may give to a StartupMessage.
const AUTH_REQUESTS: &[MessageKind] = &[
    MessageKind::ReadyForQuery,
    MessageKind::AuthenticationOk,
    MessageKind::AuthenticationCleartextPassword,
    MessageKind::AuthenticationMD5Password,
    MessageKind::AuthenticationSASL,
];

/// Terminal result of the handshake. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Server trusted the connection without asking for a password
    NoAuthRequired,
    /// A password mechanism ran and the server accepted it
    Completed,
    /// The handshake failed; the connection is unusable
    Failed(String),
}

/// Run the startup handshake on a freshly opened channel.
///
/// Failures are logged and returned as [`AuthOutcome::Failed`]; the caller
/// decides whether that ends the process.
pub async fn authenticate<C, S>(
    options: &ConnectionOptions,
    channel: &mut C,
    sasl: &S,
) -> AuthOutcome
where
    C: MessageChannel + ?Sized,
    S: SaslHelper + ?Sized,
{
    match negotiate(options, channel, sasl).await {
        Ok(outcome) => {
            info!(user = %options.user, database = %options.database, ?outcome, "authenticated");
            outcome
        }
        Err(e) => {
            let reason = match e {
                PgError::Auth(reason) => reason,
                other => other.to_string(),
            };
            error!(user = %options.user, %reason, "authentication failed");
            AuthOutcome::Failed(reason)
        }
    }
}

async fn negotiate<C, S>(
    options: &ConnectionOptions,
    channel: &mut C,
    sasl: &S,
) -> PgResult<AuthOutcome>
where
    C: MessageChannel + ?Sized,
    S: SaslHelper + ?Sized,
{
    channel
        .send(FrontendMessage::Startup {
            user: options.user.clone(),
            database: options.database.clone(),
            params: vec![
                ("client_encoding".to_string(), "UTF8".to_string()),
                ("application_name".to_string(), APPLICATION_NAME.to_string()),
            ],
        })
        .await?;

    let request = channel.reply(AUTH_REQUESTS).await?;

    let password = || {
        options
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required but not provided".to_string()))
    };

    match request {
        BackendMessage::ReadyForQuery(_) => return Ok(AuthOutcome::NoAuthRequired),
        BackendMessage::AuthenticationOk => {
            drain_until_ready(channel).await?;
            return Ok(AuthOutcome::NoAuthRequired);
        }
        BackendMessage::AuthenticationCleartextPassword => {
            debug!("cleartext password requested");
            send_password(channel, password()?.to_string()).await?;
        }
        BackendMessage::AuthenticationMD5Password(salt) => {
            debug!("md5 password requested");
            let hashed = md5_password(&options.user, password()?, &salt);
            send_password(channel, hashed).await?;
        }
        BackendMessage::AuthenticationSASL(mechanisms) => {
            debug!(?mechanisms, "sasl requested");
            if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                return Err(PgError::Auth(format!(
                    "Unsupported SASL mechanisms: {:?}",
                    mechanisms
                )));
            }
            sasl_exchange(channel, sasl, password()?).await?;
        }
        other => return Err(PgError::unexpected(AUTH_REQUESTS, other.kind())),
    }

    Ok(AuthOutcome::Completed)
}

/// Cleartext or MD5: the password message, then AuthenticationOk.
async fn send_password<C>(channel: &mut C, password: String) -> PgResult<()>
where
    C: MessageChannel + ?Sized,
{
    channel.send(FrontendMessage::PasswordMessage(password)).await?;
    channel.reply(&[MessageKind::AuthenticationOk]).await?;
    drain_until_ready(channel).await
}

/// SCRAM-SHA-256. The nonce and expected signature live only in this frame.
async fn sasl_exchange<C, S>(channel: &mut C, sasl: &S, password: &str) -> PgResult<()>
where
    C: MessageChannel + ?Sized,
    S: SaslHelper + ?Sized,
{
    let initial = sasl.initial_response();
    channel
        .send(FrontendMessage::SASLInitialResponse {
            mechanism: SCRAM_SHA_256.to_string(),
            data: initial.response,
        })
        .await?;

    let server_first = match channel.reply(&[MessageKind::AuthenticationSASLContinue]).await? {
        BackendMessage::AuthenticationSASLContinue(data) => data,
        other => {
            return Err(PgError::unexpected(
                &[MessageKind::AuthenticationSASLContinue],
                other.kind(),
            ));
        }
    };

    let next = sasl
        .continue_response(password, &initial.client_nonce, &server_first)
        .map_err(PgError::Auth)?;
    channel.send(FrontendMessage::SASLResponse(next.response)).await?;

    let server_final = match channel.reply(&[MessageKind::AuthenticationSASLFinal]).await? {
        BackendMessage::AuthenticationSASLFinal(data) => data,
        other => {
            return Err(PgError::unexpected(
                &[MessageKind::AuthenticationSASLFinal],
                other.kind(),
            ));
        }
    };
    channel.reply(&[MessageKind::AuthenticationOk]).await?;
    drain_until_ready(channel).await?;

    sasl.verify_final(&server_final, &next.server_signature)
        .map_err(PgError::Auth)
}

/// Consume ParameterStatus and BackendKeyData in whatever order the server
/// sends them, stopping at ReadyForQuery.
async fn drain_until_ready<C>(channel: &mut C) -> PgResult<()>
where
    C: MessageChannel + ?Sized,
{
    loop {
        match channel
            .reply(&[
                MessageKind::ParameterStatus,
                MessageKind::BackendKeyData,
                MessageKind::ReadyForQuery,
            ])
            .await?
        {
            BackendMessage::ReadyForQuery(status) => {
                debug!(?status, "ready for query");
                return Ok(());
            }
            BackendMessage::ParameterStatus { name, value } => {
                debug!(%name, %value, "parameter status");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorFields, ScramSha256, TransactionStatus};
    use crate::testing::{ScriptedChannel, error_fields};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use pretty_assertions::assert_eq;

    const RFC_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const RFC_SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const RFC_SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    fn options(password: Option<&str>) -> ConnectionOptions {
        let options = ConnectionOptions::new("localhost", 5432, "user", "app");
        match password {
            Some(p) => options.password(p),
            None => options,
        }
    }

    fn push_post_auth(channel: &mut ScriptedChannel) {
        channel.push(BackendMessage::AuthenticationOk);
        channel.push(BackendMessage::ParameterStatus {
            name: "server_version".to_string(),
            value: "16.2".to_string(),
        });
        channel.push(BackendMessage::BackendKeyData {
            process_id: 42,
            secret_key: 7,
        });
        channel.push(BackendMessage::ParameterStatus {
            name: "TimeZone".to_string(),
            value: "UTC".to_string(),
        });
        channel.push_ready();
    }

    #[tokio::test]
    async fn test_startup_message_parameters() {
        let mut channel = ScriptedChannel::new();
        channel.push_ready();

        authenticate(&options(None), &mut channel, &ScramSha256::new()).await;

        assert_eq!(
            channel.sent()[0],
            FrontendMessage::Startup {
                user: "user".to_string(),
                database: "app".to_string(),
                params: vec![
                    ("client_encoding".to_string(), "UTF8".to_string()),
                    ("application_name".to_string(), "typeprobe".to_string()),
                ],
            }
        );
    }

    #[tokio::test]
    async fn test_trust_auth() {
        let mut channel = ScriptedChannel::new();
        push_post_auth(&mut channel);

        let outcome = authenticate(&options(None), &mut channel, &ScramSha256::new()).await;
        assert_eq!(outcome, AuthOutcome::NoAuthRequired);
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_bare_ready_for_query_needs_no_auth() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::ReadyForQuery(TransactionStatus::Idle));

        let outcome = authenticate(&options(None), &mut channel, &ScramSha256::new()).await;
        assert_eq!(outcome, AuthOutcome::NoAuthRequired);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_cleartext_password() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationCleartextPassword);
        push_post_auth(&mut channel);

        let outcome = authenticate(&options(Some("pw")), &mut channel, &ScramSha256::new()).await;
        assert_eq!(outcome, AuthOutcome::Completed);
        assert_eq!(
            channel.sent()[1],
            FrontendMessage::PasswordMessage("pw".to_string())
        );
        assert!(channel.is_exhausted());
    }

    #[tokio::test]
    async fn test_md5_password_is_hashed() {
        let salt = [0xde, 0xad, 0xbe, 0xef];
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationMD5Password(salt));
        push_post_auth(&mut channel);

        let options =
            ConnectionOptions::new("localhost", 5432, "postgres", "app").password("secret");
        let outcome = authenticate(&options, &mut channel, &ScramSha256::new()).await;
        assert_eq!(outcome, AuthOutcome::Completed);
        assert_eq!(
            channel.sent()[1],
            FrontendMessage::PasswordMessage("md5c546d0bbed2af888b328536b45c76348".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_password_fails() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationMD5Password([1, 2, 3, 4]));

        let outcome = authenticate(&options(None), &mut channel, &ScramSha256::new()).await;
        assert!(
            matches!(outcome, AuthOutcome::Failed(reason) if reason.contains("Password required"))
        );
        // Nothing beyond the startup message went out
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_scram_exchange() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationSASL(vec![
            "SCRAM-SHA-256-PLUS".to_string(),
            SCRAM_SHA_256.to_string(),
        ]));
        channel.push(BackendMessage::AuthenticationSASLContinue(
            RFC_SERVER_FIRST.as_bytes().to_vec(),
        ));
        channel.push(BackendMessage::AuthenticationSASLFinal(
            RFC_SERVER_FINAL.as_bytes().to_vec(),
        ));
        push_post_auth(&mut channel);

        let sasl = ScramSha256::with_nonce("user", RFC_NONCE);
        let outcome = authenticate(&options(Some("pencil")), &mut channel, &sasl).await;
        assert_eq!(outcome, AuthOutcome::Completed);
        assert!(channel.is_exhausted());

        let sent = channel.sent();
        assert_eq!(
            sent[1],
            FrontendMessage::SASLInitialResponse {
                mechanism: SCRAM_SHA_256.to_string(),
                data: format!("n,,n=user,r={}", RFC_NONCE).into_bytes(),
            }
        );
        assert_eq!(
            sent[2],
            FrontendMessage::SASLResponse(
                concat!(
                    "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,",
                    "p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
                )
                .as_bytes()
                .to_vec()
            )
        );
    }

    #[tokio::test]
    async fn test_scram_ready_immediately_after_auth_ok() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationSASL(vec![SCRAM_SHA_256.to_string()]));
        channel.push(BackendMessage::AuthenticationSASLContinue(
            RFC_SERVER_FIRST.as_bytes().to_vec(),
        ));
        channel.push(BackendMessage::AuthenticationSASLFinal(
            RFC_SERVER_FINAL.as_bytes().to_vec(),
        ));
        channel.push(BackendMessage::AuthenticationOk);
        channel.push_ready();

        let sasl = ScramSha256::with_nonce("user", RFC_NONCE);
        let outcome = authenticate(&options(Some("pencil")), &mut channel, &sasl).await;
        assert_eq!(outcome, AuthOutcome::Completed);
        assert!(channel.is_exhausted());
        // Startup, SASLInitialResponse, SASLResponse
        assert_eq!(channel.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_scram_forged_server_signature() {
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationSASL(vec![SCRAM_SHA_256.to_string()]));
        channel.push(BackendMessage::AuthenticationSASLContinue(
            RFC_SERVER_FIRST.as_bytes().to_vec(),
        ));
        channel.push(BackendMessage::AuthenticationSASLFinal(forged.into_bytes()));
        push_post_auth(&mut channel);

        let sasl = ScramSha256::with_nonce("user", RFC_NONCE);
        let outcome = authenticate(&options(Some("pencil")), &mut channel, &sasl).await;
        assert_eq!(
            outcome,
            AuthOutcome::Failed("Server signature verification failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_unsupported_sasl_mechanisms() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationSASL(vec![
            "SCRAM-SHA-256-PLUS".to_string(),
        ]));

        let outcome = authenticate(&options(Some("pw")), &mut channel, &ScramSha256::new()).await;
        assert!(
            matches!(outcome, AuthOutcome::Failed(reason) if reason.contains("Unsupported SASL"))
        );
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_ready_immediately_after_auth_ok() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationCleartextPassword);
        channel.push(BackendMessage::AuthenticationOk);
        channel.push_ready();

        let outcome = authenticate(&options(Some("pw")), &mut channel, &ScramSha256::new()).await;
        assert_eq!(outcome, AuthOutcome::Completed);
        assert!(channel.is_exhausted());
    }

    #[test]
    fn test_unexpected_startup_reply_lists_auth_requests() {
        let message = PgError::unexpected(AUTH_REQUESTS, MessageKind::DataRow).to_string();
        assert!(message.contains("AuthenticationMD5Password"), "{}", message);
        assert!(message.contains("AuthenticationSASL"), "{}", message);
        assert!(message.ends_with("got DataRow"), "{}", message);
    }

    #[tokio::test]
    async fn test_wrong_password_error_response() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationCleartextPassword);
        channel.push(BackendMessage::ErrorResponse(ErrorFields {
            routine: Some("auth_failed".to_string()),
            ..error_fields("28P01", "password authentication failed for user \"user\"")
        }));

        let outcome = authenticate(&options(Some("nope")), &mut channel, &ScramSha256::new()).await;
        match outcome {
            AuthOutcome::Failed(reason) => {
                assert!(reason.contains("password authentication failed"));
                assert!(reason.contains("28P01"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_message_fails() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::ParseComplete);

        let outcome = authenticate(&options(None), &mut channel, &ScramSha256::new()).await;
        assert!(matches!(outcome, AuthOutcome::Failed(reason) if reason.contains("ParseComplete")));
    }

    #[tokio::test]
    async fn test_channel_closed_mid_handshake() {
        let mut channel = ScriptedChannel::new();
        channel.push(BackendMessage::AuthenticationCleartextPassword);

        let outcome = authenticate(&options(Some("pw")), &mut channel, &ScramSha256::new()).await;
        assert!(
            matches!(outcome, AuthOutcome::Failed(reason) if reason.contains("Connection closed"))
        );
    }
}
