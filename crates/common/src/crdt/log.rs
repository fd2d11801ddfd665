use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::{Merge, MergeConflict, Stamp};

/// Position of an entry relative to the lab sequence. Committed entries sort
/// before pending (optimistic, not yet sequenced) ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "status", content = "seq", rename_all = "snake_case")]
pub enum Sequence {
    Committed(i64),
    Pending,
}

/// Total order for append-only entries: lab sequence first, then
/// (logical clock, author id, author-local sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryOrder {
    pub seq: Sequence,
    pub clock: u64,
    pub author: Uuid,
    pub author_seq: u64,
}

impl EntryOrder {
    pub const fn committed(seq: i64, clock: u64, author: Uuid, author_seq: u64) -> Self {
        Self { seq: Sequence::Committed(seq), clock, author, author_seq }
    }

    pub const fn pending(clock: u64, author: Uuid, author_seq: u64) -> Self {
        Self { seq: Sequence::Pending, clock, author, author_seq }
    }

    fn stamp(&self) -> Stamp {
        Stamp::new(self.clock, self.author)
    }
}

/// Grow-only, totally ordered set of entries keyed by id.
///
/// An id keeps the smallest order it has been seen with, so a committed copy
/// always replaces an optimistic one regardless of arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedLog<T> {
    order: BTreeMap<EntryOrder, Uuid>,
    entries: HashMap<Uuid, (EntryOrder, T)>,
}

impl<T> Default for OrderedLog<T> {
    fn default() -> Self {
        Self { order: BTreeMap::new(), entries: HashMap::new() }
    }
}

impl<T: Clone + PartialEq> OrderedLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns whether the log changed.
    pub fn insert(&mut self, id: Uuid, order: EntryOrder, value: T) -> Result<bool, MergeConflict> {
        match self.entries.get(&id) {
            Some((existing_order, existing_value)) => {
                if order > *existing_order {
                    return Ok(false);
                }
                if order == *existing_order {
                    if *existing_value == value {
                        return Ok(false);
                    }
                    return Err(MergeConflict { field: "log.entry", stamp: order.stamp() });
                }
                self.order.remove(existing_order);
            }
            None => {}
        }

        if let Some(displaced) = self.order.insert(order, id) {
            // Two ids claiming one position means the order key is not unique.
            self.order.insert(order, displaced);
            return Err(MergeConflict { field: "log.order", stamp: order.stamp() });
        }
        self.entries.insert(id, (order, value));
        Ok(true)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<T> {
        let (order, value) = self.entries.remove(id)?;
        self.order.remove(&order);
        Some(value)
    }

    pub fn get(&self, id: &Uuid) -> Option<&T> {
        self.entries.get(id).map(|(_, value)| value)
    }

    pub fn order_of(&self, id: &Uuid) -> Option<EntryOrder> {
        self.entries.get(id).map(|(order, _)| *order)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in their agreed order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.order.values().filter_map(|id| self.entries.get(id).map(|(_, value)| value))
    }

    pub fn ids(&self) -> impl Iterator<Item = &Uuid> + '_ {
        self.order.values()
    }

    fn iter_entries(&self) -> impl Iterator<Item = (&EntryOrder, &Uuid, &T)> + '_ {
        self.order.iter().filter_map(|(order, id)| {
            self.entries.get(id).map(|(_, value)| (order, id, value))
        })
    }
}

impl<T: Clone + PartialEq> Merge for OrderedLog<T> {
    fn merge(&self, other: &Self) -> Result<Self, MergeConflict> {
        let mut merged = self.clone();
        for (order, id, value) in other.iter_entries() {
            merged.insert(*id, *order, value.clone())?;
        }
        Ok(merged)
    }
}

#[derive(Serialize)]
struct LogEntryRef<'a, T> {
    order: &'a EntryOrder,
    id: &'a Uuid,
    value: &'a T,
}

#[derive(Deserialize)]
struct LogEntry<T> {
    order: EntryOrder,
    id: Uuid,
    value: T,
}

impl<T: Serialize + Clone + PartialEq> Serialize for OrderedLog<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            self.iter_entries().map(|(order, id, value)| LogEntryRef { order, id, value }),
        )
    }
}

impl<'de, T> Deserialize<'de> for OrderedLog<T>
where
    T: Deserialize<'de> + Clone + PartialEq,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<LogEntry<T>>::deserialize(deserializer)?;
        let mut log = OrderedLog::new();
        for entry in entries {
            log.insert(entry.id, entry.order, entry.value).map_err(de::Error::custom)?;
        }
        Ok(log)
    }
}
