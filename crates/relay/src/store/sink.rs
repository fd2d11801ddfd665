use anyhow::{Context, Result};
use chrono::Utc;
use labsync_common::types::{EntityPayload, Operation};
use sqlx::{postgres::PgPool, types::Json, Postgres, QueryBuilder};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::capture::{raw_from_payload, table_name, RawMutation};

/// Where accepted edits go. The store applies them and its change feed
/// brings the committed rows back through capture.
#[derive(Debug, Clone)]
pub enum EditSink {
    /// Queue rows in `lab_edit_outbox` for the store to apply.
    Postgres(PgPool),
    /// Stand-in store: rows are turned straight into raw mutations for the
    /// caller to ingest.
    Loopback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Forwarded {
    Queued,
    Loopback(Vec<RawMutation>),
}

impl EditSink {
    pub async fn forward(
        &self,
        lab_id: Uuid,
        actor_id: Uuid,
        edit_id: Uuid,
        rows: &[(Operation, EntityPayload)],
    ) -> Result<Forwarded> {
        match self {
            Self::Loopback => {
                let committed_at = Utc::now();
                let raws = rows
                    .iter()
                    .enumerate()
                    .map(|(index, (op, payload))| {
                        raw_from_payload(*op, payload, format!("loopback:{edit_id}:{index}"), committed_at)
                            .context("failed to encode loopback row")
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Forwarded::Loopback(raws))
            }
            Self::Postgres(pool) => {
                if rows.is_empty() {
                    return Ok(Forwarded::Queued);
                }

                let mut builder = QueryBuilder::<Postgres>::new(
                    "
                    INSERT INTO lab_edit_outbox
                        (edit_id, position, lab_id, actor_id, table_name, op, row_image)
                    ",
                );
                builder.push_values(rows.iter().enumerate(), |mut row, (index, (op, payload))| {
                    row.push_bind(edit_id)
                        .push_bind(index as i32)
                        .push_bind(lab_id)
                        .push_bind(actor_id)
                        .push_bind(table_name(payload.kind()))
                        .push_bind(op.as_str())
                        .push_bind(Json(payload.clone()));
                });
                builder.push(
                    "
                    ON CONFLICT (edit_id, position)
                    DO NOTHING
                    ",
                );

                builder
                    .build()
                    .execute(pool)
                    .instrument(info_span!(
                        "relay.db.query",
                        query = "enqueue_edit",
                        lab_id = %lab_id,
                        edit_id = %edit_id
                    ))
                    .await
                    .context("failed to enqueue edit in lab_edit_outbox")?;

                Ok(Forwarded::Queued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labsync_common::types::Todo;

    #[tokio::test]
    async fn loopback_turns_rows_into_raw_mutations() {
        let lab_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        let edit_id = Uuid::new_v4();
        let todo = Todo {
            id: Uuid::new_v4(),
            lab_id,
            text: "label samples".into(),
            done: false,
            clock: 1,
            modified_by: actor_id,
        };

        let forwarded = EditSink::Loopback
            .forward(lab_id, actor_id, edit_id, &[(Operation::Insert, EntityPayload::Todo(todo))])
            .await
            .expect("loopback never fails for well-formed rows");

        let Forwarded::Loopback(raws) = forwarded else {
            panic!("loopback sink should hand rows back");
        };
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].table, "todos");
        assert_eq!(raws[0].commit_id, format!("loopback:{edit_id}:0"));
        assert!(raws[0].after.is_some());
    }
}
