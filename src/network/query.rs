use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use super::pg_protocol::{FieldDescription, Message, oid, sqlstate};
use crate::store::{QueryEvent, Store};

/// `PostgreSQL` type OID for a column's declared engine type.
///
/// Case-insensitive. Anything unrecognized, including absent declared types
/// (as for computed expressions) and all text/character names, is reported
/// as TEXT.
#[must_use]
pub fn type_oid(decl_type: Option<&str>) -> i32 {
    let Some(decl_type) = decl_type else {
        return oid::TEXT;
    };
    match decl_type.to_uppercase().as_str() {
        "INTEGER" | "INT" | "INT2" | "INT4" | "INT8" | "BIGINT" | "SMALLINT" => oid::INT8,
        "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "NUMERIC" | "DECIMAL" => oid::FLOAT8,
        "BOOL" | "BOOLEAN" => oid::BOOL,
        "BLOB" => oid::BYTEA,
        _ => oid::TEXT,
    }
}

/// Runs `sql` against the captured store handle and streams the result to
/// the client.
///
/// On success the client sees `RowDescription`, the data rows one at a time,
/// and a `SELECT {n}` completion tag; the count is only known once streaming
/// finishes. On failure an `ErrorResponse` carrying the engine's error text
/// is sent instead; rows already on the wire are not retracted, so a failure
/// mid-stream leaves the client with a truncated result followed by the
/// error. `ReadyForQuery` is the caller's responsibility.
pub async fn execute_query<W>(
    writer: &mut W,
    store: Arc<dyn Store>,
    sql: &str,
) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut events = store.run(sql.to_string());
    let mut row_count: u64 = 0;

    while let Some(event) = events.recv().await {
        match event {
            QueryEvent::Columns(columns) => {
                let fields: Vec<FieldDescription> = columns
                    .into_iter()
                    .map(|col| FieldDescription {
                        type_oid: type_oid(col.decl_type.as_deref()),
                        name: col.name,
                    })
                    .collect();
                Message::row_description(&fields).send(writer).await?;
            }
            QueryEvent::Row(values) => {
                Message::data_row(&values).send(writer).await?;
                row_count += 1;
            }
            QueryEvent::Finished => {
                let tag = format!("SELECT {row_count}");
                return Message::command_complete(&tag).send(writer).await;
            }
            QueryEvent::Failed(text) => {
                return Message::error_response("ERROR", sqlstate::SYNTAX_ERROR, &text)
                    .send(writer)
                    .await;
            }
        }
    }

    // The query task dropped the channel without a verdict.
    Message::error_response("ERROR", sqlstate::SYNTAX_ERROR, "query aborted")
        .send(writer)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ColumnInfo;
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::sync::mpsc;

    #[test]
    fn integer_family_maps_to_int8() {
        for name in ["INTEGER", "int", "Int4", "BIGINT", "smallint"] {
            assert_eq!(type_oid(Some(name)), oid::INT8, "{name}");
        }
    }

    #[test]
    fn float_family_maps_to_float8() {
        for name in ["REAL", "float", "DOUBLE", "numeric", "DECIMAL"] {
            assert_eq!(type_oid(Some(name)), oid::FLOAT8, "{name}");
        }
    }

    #[test]
    fn bool_and_blob_map_to_their_oids() {
        assert_eq!(type_oid(Some("BOOLEAN")), oid::BOOL);
        assert_eq!(type_oid(Some("bool")), oid::BOOL);
        assert_eq!(type_oid(Some("BLOB")), oid::BYTEA);
    }

    #[test]
    fn everything_else_maps_to_text() {
        assert_eq!(type_oid(Some("TEXT")), oid::TEXT);
        assert_eq!(type_oid(Some("VARCHAR(20)")), oid::TEXT);
        assert_eq!(type_oid(Some("made_up")), oid::TEXT);
        assert_eq!(type_oid(None), oid::TEXT);
    }

    /// A store that replays a fixed event script.
    struct ScriptedStore {
        events: std::sync::Mutex<Vec<QueryEvent>>,
    }

    impl ScriptedStore {
        fn new(events: Vec<QueryEvent>) -> Arc<Self> {
            Arc::new(Self {
                events: std::sync::Mutex::new(events),
            })
        }
    }

    impl Store for ScriptedStore {
        fn run(self: Arc<Self>, _sql: String) -> mpsc::Receiver<QueryEvent> {
            let (tx, rx) = mpsc::channel(8);
            let events: Vec<QueryEvent> = self.events.lock().unwrap().drain(..).collect();
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            rx
        }
    }

    async fn run_and_capture(events: Vec<QueryEvent>) -> Vec<u8> {
        let store = ScriptedStore::new(events);
        let (server_side, mut client_side) = duplex(64 * 1024);
        let (_, mut writer) = tokio::io::split(server_side);

        execute_query(&mut writer, store, "SELECT x").await.unwrap();
        drop(writer);

        let mut bytes = Vec::new();
        client_side.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    fn message_tags(mut bytes: &[u8]) -> Vec<u8> {
        let mut tags = Vec::new();
        while bytes.len() >= 5 {
            tags.push(bytes[0]);
            let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
            bytes = &bytes[1 + len..];
        }
        tags
    }

    #[tokio::test]
    async fn streams_rows_then_completion_tag() {
        let bytes = run_and_capture(vec![
            QueryEvent::Columns(vec![ColumnInfo {
                name: "n".to_string(),
                decl_type: Some("INTEGER".to_string()),
            }]),
            QueryEvent::Row(vec![Some("1".to_string())]),
            QueryEvent::Row(vec![Some("2".to_string())]),
            QueryEvent::Finished,
        ])
        .await;

        assert_eq!(message_tags(&bytes), vec![b'T', b'D', b'D', b'C']);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("SELECT 2"));
    }

    #[tokio::test]
    async fn failure_before_columns_sends_only_error() {
        let bytes =
            run_and_capture(vec![QueryEvent::Failed("near \"BOGUS\": syntax error".into())]).await;

        assert_eq!(message_tags(&bytes), vec![b'E']);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("42601"));
        assert!(text.contains("near \"BOGUS\": syntax error"));
    }

    #[tokio::test]
    async fn failure_mid_stream_leaves_truncated_result() {
        let bytes = run_and_capture(vec![
            QueryEvent::Columns(vec![ColumnInfo {
                name: "val".to_string(),
                decl_type: None,
            }]),
            QueryEvent::Row(vec![Some("partial".to_string())]),
            QueryEvent::Failed("disk I/O error".into()),
        ])
        .await;

        assert_eq!(message_tags(&bytes), vec![b'T', b'D', b'E']);
    }
}
