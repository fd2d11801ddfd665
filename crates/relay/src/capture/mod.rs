// Change capture: raw row mutations from the store's change feed are
// projected into typed, lab-scoped changes.
//
// Projection happens by deserializing the row image into the entity's
// payload type, so columns the payload does not declare (credentials,
// storage metadata) are dropped here and never reach a subscriber.

mod dedupe;

pub use dedupe::{DedupeKey, DedupeWindow};

use chrono::{DateTime, Utc};
use labsync_common::types::{
    ChatMessage, EntityKind, EntityPayload, Lab, Membership, Operation, Stroke, Todo, UserProfile,
    Whiteboard,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// One row mutation as delivered by the change feed, at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMutation {
    pub table: String,
    pub op: Operation,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
    /// Store commit identifier. Together with the table and row id it
    /// identifies a redelivery.
    pub commit_id: String,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("table `{0}` is not captured")]
    UnknownTable(String),
    #[error("{op:?} on `{table}` carries no row image")]
    MissingRowImage { table: String, op: Operation },
    #[error("row from `{table}` is malformed: {message}")]
    InvalidRow { table: String, message: String },
}

/// A projected mutation, ready to be sequenced into its lab.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedChange {
    pub lab_id: Uuid,
    pub entity_id: Uuid,
    pub op: Operation,
    pub payload: EntityPayload,
    pub committed_at: DateTime<Utc>,
}

pub fn table_kind(table: &str) -> Option<EntityKind> {
    match table {
        "labs" => Some(EntityKind::Lab),
        "lab_members" => Some(EntityKind::Membership),
        "whiteboards" => Some(EntityKind::Whiteboard),
        "strokes" => Some(EntityKind::Stroke),
        "chat_messages" => Some(EntityKind::ChatMessage),
        "todos" => Some(EntityKind::Todo),
        "profiles" => Some(EntityKind::Profile),
        _ => None,
    }
}

pub fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Lab => "labs",
        EntityKind::Membership => "lab_members",
        EntityKind::Whiteboard => "whiteboards",
        EntityKind::Stroke => "strokes",
        EntityKind::ChatMessage => "chat_messages",
        EntityKind::Todo => "todos",
        EntityKind::Profile => "profiles",
    }
}

impl RawMutation {
    /// Image describing the row: the old row for deletes, otherwise the new one.
    pub fn row_image(&self) -> Result<&Value, CaptureError> {
        let image = match self.op {
            Operation::Delete => self.before.as_ref().or(self.after.as_ref()),
            Operation::Insert | Operation::Update => self.after.as_ref().or(self.before.as_ref()),
        };
        image.ok_or_else(|| CaptureError::MissingRowImage { table: self.table.clone(), op: self.op })
    }

    pub fn dedupe_key(&self) -> Result<DedupeKey, CaptureError> {
        let kind =
            table_kind(&self.table).ok_or_else(|| CaptureError::UnknownTable(self.table.clone()))?;
        let row = self.row_image()?;
        let field = |name: &str| {
            row.get(name).and_then(Value::as_str).ok_or_else(|| CaptureError::InvalidRow {
                table: self.table.clone(),
                message: format!("missing `{name}`"),
            })
        };
        let row_id = match kind {
            EntityKind::Membership => format!("{}:{}", field("lab_id")?, field("user_id")?),
            EntityKind::Profile => field("user_id")?.to_owned(),
            _ => field("id")?.to_owned(),
        };
        Ok(DedupeKey { table: self.table.clone(), row_id, commit_id: self.commit_id.clone() })
    }
}

/// Project `raw` into lab-scoped changes. Profile rows are not lab-scoped and
/// fan out to every lab `labs_of` reports for the user.
pub fn normalize<F>(raw: &RawMutation, labs_of: F) -> Result<Vec<CapturedChange>, CaptureError>
where
    F: FnOnce(Uuid) -> Vec<Uuid>,
{
    let kind =
        table_kind(&raw.table).ok_or_else(|| CaptureError::UnknownTable(raw.table.clone()))?;
    let row = raw.row_image()?;

    let payload = match kind {
        EntityKind::Lab => EntityPayload::Lab(parse_row::<Lab>(&raw.table, row)?),
        EntityKind::Membership => {
            EntityPayload::Membership(parse_row::<Membership>(&raw.table, row)?)
        }
        EntityKind::Whiteboard => {
            EntityPayload::Whiteboard(parse_row::<Whiteboard>(&raw.table, row)?)
        }
        EntityKind::Stroke => EntityPayload::Stroke(parse_row::<Stroke>(&raw.table, row)?),
        EntityKind::ChatMessage => {
            EntityPayload::ChatMessage(parse_row::<ChatMessage>(&raw.table, row)?)
        }
        EntityKind::Todo => EntityPayload::Todo(parse_row::<Todo>(&raw.table, row)?),
        EntityKind::Profile => EntityPayload::Profile(parse_row::<UserProfile>(&raw.table, row)?),
    };

    let entity_id = payload.entity_id();
    let labs = match payload.lab_id() {
        Some(lab_id) => vec![lab_id],
        None => labs_of(entity_id),
    };

    Ok(labs
        .into_iter()
        .map(|lab_id| CapturedChange {
            lab_id,
            entity_id,
            op: raw.op,
            payload: payload.clone(),
            committed_at: raw.committed_at,
        })
        .collect())
}

/// Raw mutation for a row the relay itself produced.
pub fn raw_from_payload(
    op: Operation,
    payload: &EntityPayload,
    commit_id: String,
    committed_at: DateTime<Utc>,
) -> Result<RawMutation, serde_json::Error> {
    let row = match payload {
        EntityPayload::Lab(row) => serde_json::to_value(row)?,
        EntityPayload::Membership(row) => serde_json::to_value(row)?,
        EntityPayload::Whiteboard(row) => serde_json::to_value(row)?,
        EntityPayload::Stroke(row) => serde_json::to_value(row)?,
        EntityPayload::ChatMessage(row) => serde_json::to_value(row)?,
        EntityPayload::Todo(row) => serde_json::to_value(row)?,
        EntityPayload::Profile(row) => serde_json::to_value(row)?,
    };
    let (before, after) = match op {
        Operation::Delete => (Some(row), None),
        Operation::Insert | Operation::Update => (None, Some(row)),
    };
    Ok(RawMutation {
        table: table_name(payload.kind()).to_owned(),
        op,
        before,
        after,
        commit_id,
        committed_at,
    })
}

fn parse_row<T: DeserializeOwned>(table: &str, row: &Value) -> Result<T, CaptureError> {
    T::deserialize(row).map_err(|error| CaptureError::InvalidRow {
        table: table.to_owned(),
        message: error.to_string(),
    })
}
