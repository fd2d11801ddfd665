// Access to the authoritative lab store.
//
// The relay never writes lab rows itself. It reads them to hydrate a lab the
// first time the lab is touched, and reads `lab_change_log` to replay ranges
// that have been compacted out of memory.

mod sink;

pub use sink::{EditSink, Forwarded};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use labsync_common::state::LabState;
use labsync_common::types::{
    ChangeEvent, ChatMessage, EntityPayload, Lab, Membership, Operation, Stroke, Todo,
    UserProfile, Whiteboard,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{postgres::PgPool, types::Json};
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use crate::db::pool::{check_pool_health, create_pg_pool, PoolConfig};

#[derive(Debug, Clone)]
pub enum LabStore {
    Postgres(PgPool),
    /// No backing store: labs exist only through captured mutations.
    Memory,
}

#[derive(Debug, sqlx::FromRow)]
struct RowImage {
    row: Json<Value>,
    seq: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ChangeLogRow {
    seq: i64,
    entity_id: Uuid,
    op: String,
    payload: Json<EntityPayload>,
    committed_at: DateTime<Utc>,
}

impl LabStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pg_pool(database_url, PoolConfig::from_env())
            .await
            .context("failed to initialize relay PostgreSQL pool")?;
        check_pool_health(&pool).await?;
        Ok(Self::Postgres(pool))
    }

    pub fn pool(&self) -> Option<&PgPool> {
        match self {
            Self::Postgres(pool) => Some(pool),
            Self::Memory => None,
        }
    }

    /// Materialize a lab from its rows, or `None` when the lab does not exist.
    pub async fn load_lab(&self, lab_id: Uuid) -> Result<Option<LabState>> {
        let Self::Postgres(pool) = self else {
            return Ok(None);
        };

        async {
            let Some(lab) = sqlx::query_scalar::<_, Json<Value>>(
                "SELECT row_to_json(l) FROM labs AS l WHERE l.id = $1",
            )
            .bind(lab_id)
            .fetch_optional(pool)
            .await
            .context("failed to load lab row")?
            else {
                return Ok(None);
            };

            let mut state = LabState::new(lab_id);
            let mut apply = |seq: i64, payload: EntityPayload| {
                let event = ChangeEvent {
                    lab_id,
                    seq,
                    entity_id: payload.entity_id(),
                    op: Operation::Insert,
                    payload,
                    committed_at: Utc::now(),
                };
                if let Err(conflict) = state.apply_event(&event) {
                    error!(lab_id = %lab_id, error = %conflict, "merge conflict hydrating lab");
                }
            };

            apply(0, EntityPayload::Lab(parse::<Lab>("labs", lab.0)?));

            for image in self.rows(pool, lab_id, MEMBERS_QUERY).await? {
                apply(0, EntityPayload::Membership(parse::<Membership>("lab_members", image.row.0)?));
            }
            for image in self.rows(pool, lab_id, PROFILES_QUERY).await? {
                apply(0, EntityPayload::Profile(parse::<UserProfile>("profiles", image.row.0)?));
            }
            for image in self.rows(pool, lab_id, WHITEBOARDS_QUERY).await? {
                apply(0, EntityPayload::Whiteboard(parse::<Whiteboard>("whiteboards", image.row.0)?));
            }
            for image in self.rows(pool, lab_id, STROKES_QUERY).await? {
                apply(image.seq, EntityPayload::Stroke(parse::<Stroke>("strokes", image.row.0)?));
            }
            for image in self.rows(pool, lab_id, MESSAGES_QUERY).await? {
                apply(
                    image.seq,
                    EntityPayload::ChatMessage(parse::<ChatMessage>("chat_messages", image.row.0)?),
                );
            }
            for image in self.rows(pool, lab_id, TODOS_QUERY).await? {
                apply(0, EntityPayload::Todo(parse::<Todo>("todos", image.row.0)?));
            }

            Ok(Some(state))
        }
        .instrument(info_span!("relay.store.load_lab", lab_id = %lab_id))
        .await
    }

    /// Persisted events in `(after_seq, upto_seq]`, in sequence order.
    pub async fn fetch_change_log(
        &self,
        lab_id: Uuid,
        after_seq: i64,
        upto_seq: i64,
    ) -> Result<Vec<ChangeEvent>> {
        let Self::Postgres(pool) = self else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, ChangeLogRow>(
            "
            SELECT seq, entity_id, op, payload, committed_at
            FROM lab_change_log
            WHERE lab_id = $1 AND seq > $2 AND seq <= $3
            ORDER BY seq
            ",
        )
        .bind(lab_id)
        .bind(after_seq)
        .bind(upto_seq)
        .fetch_all(pool)
        .instrument(info_span!("relay.db.query", query = "fetch_change_log", lab_id = %lab_id))
        .await
        .context("failed to read lab_change_log")?;

        rows.into_iter()
            .map(|row| {
                let op = parse_operation(&row.op)
                    .ok_or_else(|| anyhow!("invalid operation '{}' in lab_change_log", row.op))?;
                Ok(ChangeEvent {
                    lab_id,
                    seq: row.seq,
                    entity_id: row.entity_id,
                    op,
                    payload: row.payload.0,
                    committed_at: row.committed_at,
                })
            })
            .collect()
    }

    async fn rows(&self, pool: &PgPool, lab_id: Uuid, query: &'static str) -> Result<Vec<RowImage>> {
        sqlx::query_as::<_, RowImage>(query)
            .bind(lab_id)
            .fetch_all(pool)
            .instrument(info_span!("relay.db.query", query = "hydrate_rows", lab_id = %lab_id))
            .await
            .context("failed to load lab rows")
    }
}

const MEMBERS_QUERY: &str = "
    SELECT row_to_json(m) AS row, 0::bigint AS seq
    FROM lab_members AS m
    WHERE m.lab_id = $1
";

const PROFILES_QUERY: &str = "
    SELECT row_to_json(p) AS row, 0::bigint AS seq
    FROM profiles AS p
    INNER JOIN lab_members AS m ON m.user_id = p.user_id
    WHERE m.lab_id = $1
";

const WHITEBOARDS_QUERY: &str = "
    SELECT row_to_json(w) AS row, 0::bigint AS seq
    FROM whiteboards AS w
    WHERE w.lab_id = $1
";

// Append-only rows keep the sequence they were first committed at so their
// order matches what live subscribers saw.
const STROKES_QUERY: &str = "
    SELECT row_to_json(s) AS row,
           COALESCE((
               SELECT MIN(c.seq) FROM lab_change_log AS c
               WHERE c.lab_id = s.lab_id AND c.entity_kind = 'stroke' AND c.entity_id = s.id
           ), 0) AS seq
    FROM strokes AS s
    WHERE s.lab_id = $1
";

const MESSAGES_QUERY: &str = "
    SELECT row_to_json(cm) AS row,
           COALESCE((
               SELECT MIN(c.seq) FROM lab_change_log AS c
               WHERE c.lab_id = cm.lab_id AND c.entity_kind = 'chat_message' AND c.entity_id = cm.id
           ), 0) AS seq
    FROM chat_messages AS cm
    WHERE cm.lab_id = $1
";

const TODOS_QUERY: &str = "
    SELECT row_to_json(t) AS row, 0::bigint AS seq
    FROM todos AS t
    WHERE t.lab_id = $1
";

fn parse<T: DeserializeOwned>(table: &str, row: Value) -> Result<T> {
    serde_json::from_value(row).with_context(|| format!("malformed row in `{table}`"))
}

pub(crate) fn parse_operation(value: &str) -> Option<Operation> {
    match value {
        "insert" => Some(Operation::Insert),
        "update" => Some(Operation::Update),
        "delete" => Some(Operation::Delete),
        _ => None,
    }
}
