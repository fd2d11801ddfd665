use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use labsync_common::types::ChangeEvent;
use sqlx::{postgres::PgPool, types::Json, Postgres, QueryBuilder};
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct MaxSeqRow {
    lab_id: Uuid,
    max_seq: i64,
}

/// Arena of per-lab sequence counters. Labs never share sequence space and
/// no lock spans more than one lab's counter.
#[derive(Debug, Default)]
pub struct LabSequencer {
    counters: RwLock<HashMap<Uuid, Arc<AtomicI64>>>,
}

impl LabSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn next_seq(&self, lab_id: Uuid) -> i64 {
        async move {
            let counter = self.counter_for_lab(lab_id).await;
            counter.fetch_add(1, Ordering::SeqCst) + 1
        }
        .instrument(info_span!("relay.sequencer.next_seq", lab_id = %lab_id))
        .await
    }

    /// Last sequence number handed out for `lab_id`, 0 when none.
    pub async fn head(&self, lab_id: Uuid) -> i64 {
        self.counters
            .read()
            .await
            .get(&lab_id)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Raise the counter to `max_seq`. Never moves a counter backwards.
    pub async fn seed_counter(&self, lab_id: Uuid, max_seq: i64) {
        async move {
            let counter = self.counter_for_lab(lab_id).await;
            let mut current = counter.load(Ordering::SeqCst);

            while max_seq > current {
                match counter.compare_exchange(current, max_seq, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => return,
                    Err(next_current) => current = next_current,
                }
            }
        }
        .instrument(info_span!("relay.sequencer.seed_counter", lab_id = %lab_id, max_seq))
        .await
    }

    pub async fn forget(&self, lab_id: Uuid) {
        self.counters.write().await.remove(&lab_id);
    }

    pub async fn recover_from_change_log(&self, pool: &PgPool) -> Result<usize> {
        async {
            let rows = sqlx::query_as::<_, MaxSeqRow>(
                "
                SELECT lab_id, MAX(seq) AS max_seq
                FROM lab_change_log
                GROUP BY lab_id
                ",
            )
            .fetch_all(pool)
            .instrument(info_span!("relay.db.query", query = "recover_max_seq"))
            .await
            .context("failed to query max seq values from lab_change_log")?;

            let recovered = rows.len();
            for row in rows {
                self.seed_counter(row.lab_id, row.max_seq).await;
            }

            Ok(recovered)
        }
        .instrument(info_span!("relay.sequencer.recover_from_change_log"))
        .await
    }

    pub async fn persist_batch(&self, pool: &PgPool, events: &[ChangeEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        async {
            let mut builder = QueryBuilder::<Postgres>::new(
                "
                INSERT INTO lab_change_log
                    (lab_id, seq, entity_kind, entity_id, op, payload, committed_at)
                ",
            );

            builder.push_values(events, |mut row, event| {
                row.push_bind(event.lab_id)
                    .push_bind(event.seq)
                    .push_bind(event.kind().as_str())
                    .push_bind(event.entity_id)
                    .push_bind(event.op.as_str())
                    .push_bind(Json(&event.payload))
                    .push_bind(event.committed_at);
            });

            builder.push(
                "
                ON CONFLICT (lab_id, seq)
                DO NOTHING
                ",
            );

            builder
                .build()
                .execute(pool)
                .instrument(info_span!(
                    "relay.db.query",
                    query = "persist_change_batch",
                    event_count = events.len()
                ))
                .await
                .context("failed to persist sequenced events to lab_change_log")?;

            Ok(())
        }
        .instrument(info_span!("relay.sequencer.persist_batch", event_count = events.len()))
        .await
    }

    async fn counter_for_lab(&self, lab_id: Uuid) -> Arc<AtomicI64> {
        if let Some(existing) = self.counters.read().await.get(&lab_id).cloned() {
            return existing;
        }

        let mut counters = self.counters.write().await;
        counters.entry(lab_id).or_insert_with(|| Arc::new(AtomicI64::new(0))).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::LabSequencer;
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn assigns_monotonic_sequences_per_lab() {
        let sequencer = LabSequencer::new();
        let lab_a = Uuid::new_v4();
        let lab_b = Uuid::new_v4();

        assert_eq!(sequencer.next_seq(lab_a).await, 1);
        assert_eq!(sequencer.next_seq(lab_a).await, 2);
        assert_eq!(sequencer.next_seq(lab_b).await, 1);
        assert_eq!(sequencer.head(lab_a).await, 2);
        assert_eq!(sequencer.head(Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn seed_counter_recovers_without_regression() {
        let sequencer = LabSequencer::new();
        let lab_id = Uuid::new_v4();

        sequencer.seed_counter(lab_id, 10).await;
        assert_eq!(sequencer.next_seq(lab_id).await, 11);

        sequencer.seed_counter(lab_id, 5).await;
        assert_eq!(sequencer.next_seq(lab_id).await, 12);
    }

    #[tokio::test]
    async fn concurrent_callers_never_share_a_sequence() {
        let sequencer = Arc::new(LabSequencer::new());
        let lab_id = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sequencer = Arc::clone(&sequencer);
            tasks.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    seen.push(sequencer.next_seq(lab_id).await);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.expect("sequencing task should finish"));
        }
        all.sort_unstable();
        assert_eq!(all, (1..=400).collect::<Vec<i64>>());
    }
}
