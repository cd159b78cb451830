use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// `PostgreSQL` protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196_608; // (3 << 16) | 0

/// SSL request code
pub const SSL_REQUEST_CODE: i32 = 80_877_103; // Special code for SSL negotiation

/// Message types (from backend to frontend)
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const NO_DATA: u8 = b'n';
}

/// Message types (from frontend to backend)
pub mod frontend {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
    pub const PASSWORD: u8 = b'p';
}

/// Transaction status indicators
pub mod transaction_status {
    pub const IDLE: u8 = b'I'; // Not in transaction
}

/// `PostgreSQL` data type OIDs (simplified)
pub mod oid {
    pub const INT8: i32 = 20;
    pub const FLOAT8: i32 = 701;
    pub const BOOL: i32 = 16;
    pub const BYTEA: i32 = 17;
    pub const TEXT: i32 = 25;
}

/// SQLSTATE codes reported in error responses
pub mod sqlstate {
    pub const SYNTAX_ERROR: &str = "42601";
    pub const INVALID_PASSWORD: &str = "28P01";
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
}

/// Error field codes
pub mod error_field {
    pub const SEVERITY: u8 = b'S';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
}

/// Field metadata for a `RowDescription` message.
pub struct FieldDescription {
    pub name: String,
    pub type_oid: i32,
}

pub struct StartupMessage {
    pub parameters: HashMap<String, String>,
}

impl StartupMessage {
    /// Parse null-terminated `key\0value\0` pairs from a startup packet body.
    fn parse(params_buf: &[u8]) -> Self {
        let mut parameters = HashMap::new();
        let mut i = 0;
        while i < params_buf.len() {
            let key_start = i;
            while i < params_buf.len() && params_buf[i] != 0 {
                i += 1;
            }
            if i >= params_buf.len() {
                break; // Reached end or terminator
            }
            let key = String::from_utf8_lossy(&params_buf[key_start..i]).to_string();
            i += 1; // Skip null terminator

            if i >= params_buf.len() {
                break; // No value after key
            }

            let value_start = i;
            while i < params_buf.len() && params_buf[i] != 0 {
                i += 1;
            }
            let value = String::from_utf8_lossy(&params_buf[value_start..i]).to_string();
            i += 1; // Skip null terminator

            if !key.is_empty() {
                parameters.insert(key, value);
            }
        }

        Self { parameters }
    }
}

/// The first packet of a connection: either an SSL negotiation request or a
/// plain startup message.
pub enum Startup {
    Ssl,
    Message(StartupMessage),
}

impl Startup {
    pub async fn read<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Self> {
        // Read length (Int32), then the request code (Int32).
        let length = reader.read_i32().await?;
        if !(8..=10_000).contains(&length) {
            return Err(invalid_data(format!(
                "invalid startup packet length: {length}"
            )));
        }
        let code = reader.read_i32().await?;

        if code == SSL_REQUEST_CODE {
            return Ok(Self::Ssl);
        }
        if code != PROTOCOL_VERSION {
            return Err(invalid_data(format!(
                "unsupported protocol version: {code}"
            )));
        }

        // Read parameters (length - 8 bytes for the two Int32s already read)
        let params_length = (length - 8) as usize;
        let mut params_buf = vec![0u8; params_length];
        reader.read_exact(&mut params_buf).await?;

        Ok(Self::Message(StartupMessage::parse(&params_buf)))
    }
}

pub struct Message {
    buf: BytesMut,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Write message type and reserve space for length
    fn start(&mut self, msg_type: u8) -> usize {
        self.buf.put_u8(msg_type);
        let len_pos = self.buf.len();
        self.buf.put_i32(0); // Placeholder for length
        len_pos
    }

    /// Update the length field
    fn finish(&mut self, len_pos: usize) {
        let total_len = self.buf.len() - len_pos;
        let len_bytes = (total_len as i32).to_be_bytes();
        self.buf[len_pos..len_pos + 4].copy_from_slice(&len_bytes);
    }

    /// `AuthenticationOk` message
    #[must_use]
    pub fn authentication_ok() -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::AUTHENTICATION);
        msg.buf.put_i32(0); // 0 = AuthenticationOk
        msg.finish(len_pos);
        msg
    }

    /// `AuthenticationCleartextPassword` message
    #[must_use]
    pub fn authentication_cleartext_password() -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::AUTHENTICATION);
        msg.buf.put_i32(3); // 3 = AuthenticationCleartextPassword
        msg.finish(len_pos);
        msg
    }

    /// `ParameterStatus` message
    #[must_use]
    pub fn parameter_status(name: &str, value: &str) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::PARAMETER_STATUS);
        msg.put_cstring(name);
        msg.put_cstring(value);
        msg.finish(len_pos);
        msg
    }

    /// `BackendKeyData` message
    #[must_use]
    pub fn backend_key_data(process_id: i32, secret_key: i32) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::BACKEND_KEY_DATA);
        msg.buf.put_i32(process_id);
        msg.buf.put_i32(secret_key);
        msg.finish(len_pos);
        msg
    }

    /// `ReadyForQuery` message
    #[must_use]
    pub fn ready_for_query(status: u8) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::READY_FOR_QUERY);
        msg.buf.put_u8(status);
        msg.finish(len_pos);
        msg
    }

    /// `EmptyQueryResponse` message
    #[must_use]
    pub fn empty_query_response() -> Self {
        Self::empty(backend::EMPTY_QUERY_RESPONSE)
    }

    /// `ParseComplete` message
    #[must_use]
    pub fn parse_complete() -> Self {
        Self::empty(backend::PARSE_COMPLETE)
    }

    /// `BindComplete` message
    #[must_use]
    pub fn bind_complete() -> Self {
        Self::empty(backend::BIND_COMPLETE)
    }

    /// `NoData` message
    #[must_use]
    pub fn no_data() -> Self {
        Self::empty(backend::NO_DATA)
    }

    /// `ParameterDescription` message announcing zero parameters
    #[must_use]
    pub fn parameter_description() -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::PARAMETER_DESCRIPTION);
        msg.buf.put_i16(0);
        msg.finish(len_pos);
        msg
    }

    /// `ErrorResponse` message
    #[must_use]
    pub fn error_response(severity: &str, code: &str, message: &str) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::ERROR_RESPONSE);

        msg.buf.put_u8(error_field::SEVERITY);
        msg.put_cstring(severity);

        msg.buf.put_u8(error_field::CODE);
        msg.put_cstring(code);

        msg.buf.put_u8(error_field::MESSAGE);
        msg.put_cstring(message);

        // Terminator
        msg.buf.put_u8(0);

        msg.finish(len_pos);
        msg
    }

    /// `RowDescription` message
    #[must_use]
    pub fn row_description(fields: &[FieldDescription]) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::ROW_DESCRIPTION);

        msg.buf.put_i16(fields.len() as i16);

        for field in fields {
            msg.put_cstring(&field.name);
            msg.buf.put_i32(0); // table OID
            msg.buf.put_i16(0); // column attribute number
            msg.buf.put_i32(field.type_oid);
            msg.buf.put_i16(-1); // data type size (-1 = variable)
            msg.buf.put_i32(-1); // type modifier
            msg.buf.put_i16(0); // format code (0 = text)
        }

        msg.finish(len_pos);
        msg
    }

    /// `DataRow` message; `None` values are sent as the NULL marker
    #[must_use]
    pub fn data_row(values: &[Option<String>]) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::DATA_ROW);

        msg.buf.put_i16(values.len() as i16);

        for val in values {
            match val {
                Some(val) => {
                    let val_bytes = val.as_bytes();
                    msg.buf.put_i32(val_bytes.len() as i32);
                    msg.buf.put_slice(val_bytes);
                }
                None => msg.buf.put_i32(-1),
            }
        }

        msg.finish(len_pos);
        msg
    }

    /// `CommandComplete` message
    #[must_use]
    pub fn command_complete(tag: &str) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(backend::COMMAND_COMPLETE);
        msg.put_cstring(tag);
        msg.finish(len_pos);
        msg
    }

    /// A body-less message: just the type byte and its own length
    fn empty(msg_type: u8) -> Self {
        let mut msg = Self::new();
        let len_pos = msg.start(msg_type);
        msg.finish(len_pos);
        msg
    }

    /// Helper: write null-terminated string
    fn put_cstring(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Send the message to a writer
    pub async fn send<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Upper bound on a single frontend message, matching the bounded startup
/// packet check. Rejecting before allocation means a hostile length field
/// cannot drive a huge `vec![0; ..]`.
const MAX_FRONTEND_MESSAGE_LENGTH: i32 = 1_048_576;

/// Read a frontend message
pub async fn read_frontend_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> std::io::Result<(u8, Vec<u8>)> {
    let msg_type = reader.read_u8().await?;
    let length = reader.read_i32().await?;

    // Length includes itself (4 bytes) but not the message type. Validate
    // as a signed value before any cast: a negative length must not wrap
    // into an enormous allocation.
    if !(4..=MAX_FRONTEND_MESSAGE_LENGTH).contains(&length) {
        return Err(invalid_data(format!("invalid message length: {length}")));
    }

    let data_length = length as usize - 4;
    let mut data = vec![0u8; data_length];
    reader.read_exact(&mut data).await?;

    Ok((msg_type, data))
}

/// Extract null-terminated string from byte slice
#[must_use]
pub fn extract_cstring(data: &[u8]) -> Option<(String, usize)> {
    let mut end = 0;
    while end < data.len() && data[end] != 0 {
        end += 1;
    }

    if end >= data.len() {
        return None;
    }

    let s = String::from_utf8_lossy(&data[..end]).to_string();
    Some((s, end + 1)) // +1 to skip the null terminator
}

fn invalid_data(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
