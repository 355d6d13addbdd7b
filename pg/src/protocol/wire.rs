//! PostgreSQL Wire Protocol Messages
//!
//! The subset of the Frontend/Backend Protocol 3.0 used for startup,
//! authentication, simple queries and statement description.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, BytesMut};
use std::fmt;

use super::EncodeError;

/// Protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608;

/// SSLRequest code: 80877103
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Object addressed by Describe and Close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn tag(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

/// Frontend (client → server) message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Startup message (sent first, no type byte)
    Startup {
        user: String,
        database: String,
        /// Extra run-time parameters, e.g. `client_encoding`
        params: Vec<(String, String)>,
    },
    /// Ask the server to upgrade the socket to TLS (no type byte)
    SslRequest,
    /// Password response (cleartext or `md5`-prefixed hash)
    PasswordMessage(String),
    /// SASL initial response (first message in SCRAM)
    SASLInitialResponse { mechanism: String, data: Vec<u8> },
    /// SASL response (subsequent messages in SCRAM)
    SASLResponse(Vec<u8>),
    Query(String),
    /// Parse (prepare a statement)
    Parse {
        name: String,
        query: String,
        param_types: Vec<u32>,
    },
    Describe { target: Target, name: String },
    Close { target: Target, name: String },
    Flush,
    Sync,
    Terminate,
}

/// Backend (server → client) message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password([u8; 4]),
    AuthenticationSASL(Vec<String>),
    AuthenticationSASLContinue(Vec<u8>),
    AuthenticationSASLFinal(Vec<u8>),
    /// Parameter status (server config)
    ParameterStatus { name: String, value: String },
    /// Backend key data (for cancel)
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    /// Notice response (warning/info messages, not errors)
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    CloseComplete,
    /// Parameter type OIDs of a described statement
    ParameterDescription(Vec<u32>),
    NoData,
    /// Notification response (async notification from LISTEN/NOTIFY)
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

/// Payload-free discriminant of [`BackendMessage`], used to state which
/// replies a protocol step is prepared to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password,
    AuthenticationSASL,
    AuthenticationSASLContinue,
    AuthenticationSASLFinal,
    ParameterStatus,
    BackendKeyData,
    ReadyForQuery,
    RowDescription,
    DataRow,
    CommandComplete,
    EmptyQueryResponse,
    ErrorResponse,
    NoticeResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    ParameterDescription,
    NoData,
    NotificationResponse,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,    // 'I'
    InBlock, // 'T'
    Failed,  // 'E'
}

/// Field description in RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Error fields from ErrorResponse / NoticeResponse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    pub severity: String,
    /// SQLSTATE (`C`)
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character offset into the query text (`P`)
    pub position: Option<u32>,
    /// Server source routine that raised the error (`R`)
    pub routine: Option<String>,
}

impl fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}

impl FrontendMessage {
    /// Encode message to bytes for sending over the wire.
    pub fn encode(&self) -> Result<BytesMut, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Append the encoded message to `buf`.
    ///
    /// On error the tail of `buf` holds a partial message and must be discarded.
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            FrontendMessage::Startup {
                user,
                database,
                params,
            } => {
                let start = buf.len();
                buf.put_i32(0);
                buf.put_i32(PROTOCOL_VERSION);
                put_cstr(buf, "user")?;
                put_cstr(buf, user)?;
                put_cstr(buf, "database")?;
                put_cstr(buf, database)?;
                for (name, value) in params {
                    put_cstr(buf, name)?;
                    put_cstr(buf, value)?;
                }
                buf.put_u8(0); // Terminator
                patch_len(buf, start);
            }
            FrontendMessage::SslRequest => {
                buf.put_i32(8);
                buf.put_i32(SSL_REQUEST_CODE);
            }
            FrontendMessage::PasswordMessage(password) => {
                frame(buf, b'p', |b| put_cstr(b, password))?;
            }
            FrontendMessage::SASLInitialResponse { mechanism, data } => {
                // SASLInitialResponse and SASLResponse share the 'p' tag
                frame(buf, b'p', |b| {
                    put_cstr(b, mechanism)?;
                    b.put_i32(data.len() as i32);
                    b.put_slice(data);
                    Ok(())
                })?;
            }
            FrontendMessage::SASLResponse(data) => {
                frame(buf, b'p', |b| {
                    b.put_slice(data);
                    Ok(())
                })?;
            }
            FrontendMessage::Query(sql) => {
                frame(buf, b'Q', |b| put_cstr(b, sql))?;
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => {
                if param_types.len() > i16::MAX as usize {
                    return Err(EncodeError::TooManyParameters(param_types.len()));
                }
                frame(buf, b'P', |b| {
                    put_cstr(b, name)?;
                    put_cstr(b, query)?;
                    b.put_i16(param_types.len() as i16);
                    for &oid in param_types {
                        b.put_u32(oid);
                    }
                    Ok(())
                })?;
            }
            FrontendMessage::Describe { target, name } => {
                frame(buf, b'D', |b| {
                    b.put_u8(target.tag());
                    put_cstr(b, name)
                })?;
            }
            FrontendMessage::Close { target, name } => {
                frame(buf, b'C', |b| {
                    b.put_u8(target.tag());
                    put_cstr(b, name)
                })?;
            }
            FrontendMessage::Flush => frame(buf, b'H', |_| Ok(()))?,
            FrontendMessage::Sync => frame(buf, b'S', |_| Ok(()))?,
            FrontendMessage::Terminate => frame(buf, b'X', |_| Ok(()))?,
        }
        Ok(())
    }
}

/// Write a tagged message whose length field covers itself and the body.
fn frame(
    buf: &mut BytesMut,
    tag: u8,
    body: impl FnOnce(&mut BytesMut) -> Result<(), EncodeError>,
) -> Result<(), EncodeError> {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf)?;
    patch_len(buf, start);
    Ok(())
}

fn patch_len(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, value: &str) -> Result<(), EncodeError> {
    if value.as_bytes().contains(&0) {
        return Err(EncodeError::NullByte);
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Bounds-checked cursor over a message payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], String> {
        if self.buf.len() - self.pos < n {
            return Err(format!("{} truncated", what));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8, String> {
        Ok(self.take(1, what)?[0])
    }

    fn i16(&mut self, what: &str) -> Result<i16, String> {
        let b = self.take(2, what)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self, what: &str) -> Result<i32, String> {
        let b = self.take(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, String> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn cstr(&mut self, what: &str) -> Result<String, String> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| format!("Missing null terminator in {}", what))?;
        let value = String::from_utf8_lossy(&rest[..end]).to_string();
        self.pos += end + 1;
        Ok(value)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn at_terminator(&self) -> bool {
        self.pos >= self.buf.len() || self.buf[self.pos] == 0
    }
}

impl BackendMessage {
    /// Decode a message from wire bytes.
    ///
    /// Returns the message and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), String> {
        if buf.len() < 5 {
            return Err("Buffer too short".to_string());
        }

        let msg_type = buf[0];
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(format!("Invalid message length: {}", len));
        }
        let len = len as usize;

        if buf.len() < len + 1 {
            return Err("Incomplete message".to_string());
        }

        let payload = &buf[5..len + 1];

        let message = match msg_type {
            b'R' => Self::decode_auth(payload)?,
            b'S' => Self::decode_parameter_status(payload)?,
            b'K' => Self::decode_backend_key(payload)?,
            b'Z' => Self::decode_ready_for_query(payload)?,
            b'T' => Self::decode_row_description(payload)?,
            b'D' => Self::decode_data_row(payload)?,
            b'C' => Self::decode_command_complete(payload),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(Self::parse_error_fields(payload)),
            b'N' => BackendMessage::NoticeResponse(Self::parse_error_fields(payload)),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b't' => Self::decode_parameter_description(payload)?,
            b'n' => BackendMessage::NoData,
            b'A' => Self::decode_notification_response(payload)?,
            _ => return Err(format!("Unknown message type: {}", msg_type as char)),
        };

        Ok((message, len + 1))
    }

    /// The payload-free kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            BackendMessage::AuthenticationOk => MessageKind::AuthenticationOk,
            BackendMessage::AuthenticationCleartextPassword => {
                MessageKind::AuthenticationCleartextPassword
            }
            BackendMessage::AuthenticationMD5Password(_) => MessageKind::AuthenticationMD5Password,
            BackendMessage::AuthenticationSASL(_) => MessageKind::AuthenticationSASL,
            BackendMessage::AuthenticationSASLContinue(_) => {
                MessageKind::AuthenticationSASLContinue
            }
            BackendMessage::AuthenticationSASLFinal(_) => MessageKind::AuthenticationSASLFinal,
            BackendMessage::ParameterStatus { .. } => MessageKind::ParameterStatus,
            BackendMessage::BackendKeyData { .. } => MessageKind::BackendKeyData,
            BackendMessage::ReadyForQuery(_) => MessageKind::ReadyForQuery,
            BackendMessage::RowDescription(_) => MessageKind::RowDescription,
            BackendMessage::DataRow(_) => MessageKind::DataRow,
            BackendMessage::CommandComplete(_) => MessageKind::CommandComplete,
            BackendMessage::EmptyQueryResponse => MessageKind::EmptyQueryResponse,
            BackendMessage::ErrorResponse(_) => MessageKind::ErrorResponse,
            BackendMessage::NoticeResponse(_) => MessageKind::NoticeResponse,
            BackendMessage::ParseComplete => MessageKind::ParseComplete,
            BackendMessage::BindComplete => MessageKind::BindComplete,
            BackendMessage::CloseComplete => MessageKind::CloseComplete,
            BackendMessage::ParameterDescription(_) => MessageKind::ParameterDescription,
            BackendMessage::NoData => MessageKind::NoData,
            BackendMessage::NotificationResponse { .. } => MessageKind::NotificationResponse,
        }
    }

    fn decode_auth(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        let auth_type = r.i32("Authentication request")?;
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let salt = r.take(4, "MD5 salt")?;
                Ok(BackendMessage::AuthenticationMD5Password([
                    salt[0], salt[1], salt[2], salt[3],
                ]))
            }
            10 => {
                // SASL - parse mechanism list
                let mut mechanisms = Vec::new();
                while !r.at_terminator() {
                    mechanisms.push(r.cstr("SASL mechanism")?);
                }
                Ok(BackendMessage::AuthenticationSASL(mechanisms))
            }
            // SASL Continue - server challenge
            11 => Ok(BackendMessage::AuthenticationSASLContinue(r.rest().to_vec())),
            // SASL Final - server signature
            12 => Ok(BackendMessage::AuthenticationSASLFinal(r.rest().to_vec())),
            _ => Err(format!("Unsupported auth type: {}", auth_type)),
        }
    }

    fn decode_parameter_status(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        Ok(BackendMessage::ParameterStatus {
            name: r.cstr("ParameterStatus name")?,
            value: r.cstr("ParameterStatus value")?,
        })
    }

    fn decode_backend_key(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        Ok(BackendMessage::BackendKeyData {
            process_id: r.i32("BackendKeyData")?,
            secret_key: r.i32("BackendKeyData")?,
        })
    }

    fn decode_ready_for_query(payload: &[u8]) -> Result<Self, String> {
        let status = match Reader::new(payload).u8("ReadyForQuery")? {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InBlock,
            b'E' => TransactionStatus::Failed,
            _ => return Err("Unknown transaction status".to_string()),
        };
        Ok(BackendMessage::ReadyForQuery(status))
    }

    fn decode_row_description(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        let field_count = r.i16("RowDescription")?.max(0) as usize;
        let mut fields = Vec::with_capacity(field_count);

        for _ in 0..field_count {
            fields.push(FieldDescription {
                name: r.cstr("field name")?,
                table_oid: r.u32("RowDescription field")?,
                column_attr: r.i16("RowDescription field")?,
                type_oid: r.u32("RowDescription field")?,
                type_size: r.i16("RowDescription field")?,
                type_modifier: r.i32("RowDescription field")?,
                format: r.i16("RowDescription field")?,
            });
        }

        Ok(BackendMessage::RowDescription(fields))
    }

    fn decode_data_row(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        let column_count = r.i16("DataRow")?.max(0) as usize;
        let mut columns = Vec::with_capacity(column_count);

        for _ in 0..column_count {
            let len = r.i32("DataRow")?;
            if len < 0 {
                // NULL value
                columns.push(None);
            } else {
                columns.push(Some(r.take(len as usize, "DataRow column data")?.to_vec()));
            }
        }

        Ok(BackendMessage::DataRow(columns))
    }

    fn decode_command_complete(payload: &[u8]) -> Self {
        let tag = String::from_utf8_lossy(payload)
            .trim_end_matches('\0')
            .to_string();
        BackendMessage::CommandComplete(tag)
    }

    fn decode_parameter_description(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        let count = r.i16("ParameterDescription")?.max(0) as usize;
        let mut oids = Vec::with_capacity(count);
        for _ in 0..count {
            oids.push(r.u32("ParameterDescription")?);
        }
        Ok(BackendMessage::ParameterDescription(oids))
    }

    fn parse_error_fields(payload: &[u8]) -> ErrorFields {
        let mut fields = ErrorFields::default();
        let mut r = Reader::new(payload);
        while !r.at_terminator() {
            let Ok(field_type) = r.u8("error field") else {
                break;
            };
            // Lenient: an unterminated trailing value is taken as-is
            let value = match r.cstr("error field") {
                Ok(value) => value,
                Err(_) => String::from_utf8_lossy(r.rest()).to_string(),
            };

            match field_type {
                b'S' => fields.severity = value,
                b'C' => fields.code = value,
                b'M' => fields.message = value,
                b'D' => fields.detail = Some(value),
                b'H' => fields.hint = Some(value),
                b'P' => fields.position = value.parse().ok(),
                b'R' => fields.routine = Some(value),
                _ => {}
            }
        }
        fields
    }

    fn decode_notification_response(payload: &[u8]) -> Result<Self, String> {
        let mut r = Reader::new(payload);
        Ok(BackendMessage::NotificationResponse {
            process_id: r.i32("NotificationResponse")?,
            channel: r.cstr("notification channel")?,
            payload: r.cstr("notification payload")?,
        })
    }
}
