use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::pg_protocol::{self, Message, frontend, sqlstate};
use crate::core::ServerError;

/// Performs the credential handshake for one connection.
///
/// An empty configured username disables authentication entirely: every
/// client is accepted immediately. Otherwise the client is challenged for a
/// cleartext password, which is compared byte-for-byte against the configured
/// one. The username the client sent in its startup packet is never
/// inspected; any username is accepted once the password matches.
///
/// On mismatch, or if the client answers with anything other than a password
/// message, a fatal `28P01` error is sent and the caller must close the
/// connection.
pub async fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    username: &str,
    password: &str,
) -> Result<(), ServerError>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    if username.is_empty() {
        Message::authentication_ok().send(writer).await?;
        return Ok(());
    }

    Message::authentication_cleartext_password()
        .send(writer)
        .await?;

    let (msg_type, data) = pg_protocol::read_frontend_message(reader).await?;
    if msg_type != frontend::PASSWORD {
        return fail(writer, "expected password message").await;
    }

    let supplied = match pg_protocol::extract_cstring(&data) {
        Some((password, _)) => password,
        None => return fail(writer, "malformed password message").await,
    };
    if supplied != password {
        return fail(writer, "password authentication failed").await;
    }

    Message::authentication_ok().send(writer).await?;
    Ok(())
}

async fn fail<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &str) -> Result<(), ServerError> {
    // Best effort; the connection is closing either way.
    let _ = Message::error_response("FATAL", sqlstate::INVALID_PASSWORD, message)
        .send(writer)
        .await;
    Err(ServerError::AuthenticationFailed)
}
