use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::auth;
use super::pg_protocol::{self, Message, Startup, frontend, sqlstate, transaction_status};
use super::query::execute_query;
use crate::core::ServerError;
use crate::store::{SqliteStore, Store};

/// Server parameters announced to every client after authentication.
const PARAMETER_STATUSES: [(&str, &str); 5] = [
    ("server_version", "14.0"),
    ("client_encoding", "UTF8"),
    ("server_encoding", "UTF8"),
    ("DateStyle", "ISO, MDY"),
    ("integer_datetimes", "on"),
];

/// Static configuration for [`Server`].
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub port: u16,
    /// Backing database file; `None` serves an empty in-memory database.
    pub db_path: Option<PathBuf>,
    /// Empty username disables authentication.
    pub username: String,
    pub password: String,
}

/// Read-only `PostgreSQL` wire protocol server backed by SQLite.
///
/// The published store handle is the only server-wide state mutated after
/// startup. [`Server::reload`] swaps it atomically; everything else is
/// immutable configuration.
pub struct Server {
    opts: ServerOptions,
    store: RwLock<Arc<dyn Store>>,
}

impl Server {
    /// Creates a server, opening the initial store handle. Fails fast if the
    /// backing file cannot be opened.
    pub fn new(opts: ServerOptions) -> Result<Self, ServerError> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(opts.db_path.as_deref())?);
        Ok(Self {
            opts,
            store: RwLock::new(store),
        })
    }

    /// Accepts connections until `shutdown` resolves, spawning one task per
    /// connection.
    ///
    /// Resolution of `shutdown` closes the listener and returns `Ok`;
    /// already-accepted connections are not interrupted and run until their
    /// client disconnects.
    pub async fn serve<F>(self: Arc<Self>, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(("0.0.0.0", self.opts.port)).await?;
        info!(port = self.opts.port, "listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received, closing listener");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    debug!(%peer, "accepted connection");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        match server.handle_conn(socket).await {
                            Ok(()) => debug!(%peer, "connection closed"),
                            Err(err) => debug!(%peer, error = %err, "connection closed"),
                        }
                    });
                }
            }
        }
    }

    /// Opens `path` and atomically publishes it as the current store handle.
    ///
    /// All-or-nothing with respect to publication: if the new file cannot be
    /// opened the previous handle stays published and the error is returned.
    /// The superseded handle is released outside the exclusive section; its
    /// connection closes once the last in-flight query drops its reference,
    /// so queries that captured it before the swap complete against a
    /// consistent snapshot.
    pub async fn reload(&self, path: &Path) -> Result<(), ServerError> {
        let new_store: Arc<dyn Store> = Arc::new(SqliteStore::open(Some(path))?);
        let old = {
            let mut guard = self.store.write().await;
            std::mem::replace(&mut *guard, new_store)
        };
        drop(old);
        info!(path = %path.display(), "reloaded backing database");
        Ok(())
    }

    /// The currently published store handle. Queries capture one handle and
    /// use it for their whole duration regardless of concurrent reloads.
    async fn current_store(&self) -> Arc<dyn Store> {
        Arc::clone(&*self.store.read().await)
    }

    /// Drives one connection end-to-end: startup negotiation,
    /// authentication, parameter announcements, then the query loop.
    async fn handle_conn(&self, socket: TcpStream) -> Result<(), ServerError> {
        let (mut reader, mut writer) = socket.into_split();

        let startup = match Startup::read(&mut reader).await? {
            Startup::Message(msg) => msg,
            Startup::Ssl => {
                // Decline SSL with a single byte, then expect a plain
                // startup message. A second SSL request is a framing error.
                writer.write_u8(b'N').await?;
                writer.flush().await?;
                match Startup::read(&mut reader).await? {
                    Startup::Message(msg) => msg,
                    Startup::Ssl => return Err(ServerError::MalformedStartup),
                }
            }
        };
        debug!(
            user = startup.parameters.get("user").map_or("", String::as_str),
            "startup accepted"
        );

        if let Err(err) = auth::authenticate(
            &mut reader,
            &mut writer,
            &self.opts.username,
            &self.opts.password,
        )
        .await
        {
            warn!(error = %err, "authentication failed");
            return Err(err);
        }

        for (name, value) in PARAMETER_STATUSES {
            Message::parameter_status(name, value).send(&mut writer).await?;
        }
        // Query cancellation is not supported, so the key data is a fixed dummy.
        Message::backend_key_data(1, 0).send(&mut writer).await?;
        Message::ready_for_query(transaction_status::IDLE)
            .send(&mut writer)
            .await?;

        // The single unnamed statement slot of the extended protocol; each
        // Parse overwrites it.
        let mut pending_statement = String::new();

        loop {
            let (msg_type, data) = match pg_protocol::read_frontend_message(&mut reader).await {
                Ok(msg) => msg,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            match msg_type {
                // ── Simple Query Protocol ────────────────────────────────
                frontend::QUERY => {
                    let Some((sql, _)) = pg_protocol::extract_cstring(&data) else {
                        Message::error_response(
                            "ERROR",
                            sqlstate::SYNTAX_ERROR,
                            "invalid query format",
                        )
                        .send(&mut writer)
                        .await?;
                        Message::ready_for_query(transaction_status::IDLE)
                            .send(&mut writer)
                            .await?;
                        continue;
                    };
                    let sql = sql.trim();
                    if sql.is_empty() || sql == ";" {
                        Message::empty_query_response().send(&mut writer).await?;
                    } else {
                        let store = self.current_store().await;
                        execute_query(&mut writer, store, sql).await?;
                    }
                    Message::ready_for_query(transaction_status::IDLE)
                        .send(&mut writer)
                        .await?;
                }

                // ── Extended Query Protocol ──────────────────────────────
                frontend::PARSE => {
                    pending_statement = parse_statement_text(&data);
                    Message::parse_complete().send(&mut writer).await?;
                }

                frontend::BIND => {
                    // Parameters and result-format requests are accepted but
                    // ignored; no parameter substitution is performed.
                    Message::bind_complete().send(&mut writer).await?;
                }

                frontend::DESCRIBE => {
                    Message::parameter_description().send(&mut writer).await?;
                    // Column metadata is only known at Execute; statement
                    // targets get NoData for now.
                    if data.first() == Some(&b'S') {
                        Message::no_data().send(&mut writer).await?;
                    }
                }

                frontend::EXECUTE => {
                    let sql = pending_statement.trim();
                    if sql.is_empty() || sql == ";" {
                        Message::empty_query_response().send(&mut writer).await?;
                    } else {
                        let store = self.current_store().await;
                        execute_query(&mut writer, store, sql).await?;
                    }
                    // ReadyForQuery is deferred to Sync.
                }

                frontend::SYNC => {
                    Message::ready_for_query(transaction_status::IDLE)
                        .send(&mut writer)
                        .await?;
                }

                frontend::TERMINATE => return Ok(()),

                other => {
                    let text = format!("unsupported message type '{}'", other as char);
                    Message::error_response("ERROR", sqlstate::FEATURE_NOT_SUPPORTED, &text)
                        .send(&mut writer)
                        .await?;
                    Message::ready_for_query(transaction_status::IDLE)
                        .send(&mut writer)
                        .await?;
                }
            }
        }
    }
}

/// The SQL text of a Parse message: statement name, then query text, both
/// null-terminated. The name and the trailing parameter type OIDs are
/// ignored since only the unnamed statement is supported.
fn parse_statement_text(data: &[u8]) -> String {
    let Some((_, consumed)) = pg_protocol::extract_cstring(data) else {
        return String::new();
    };
    match pg_protocol::extract_cstring(&data[consumed..]) {
        Some((sql, _)) => sql,
        None => String::new(),
    }
}
