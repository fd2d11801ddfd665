use serde::{Deserialize, Serialize};

use super::{Merge, MergeConflict, Stamp};

/// A single value resolved by last-writer-wins on its [`Stamp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    pub value: T,
    pub stamp: Stamp,
}

impl<T: Clone + PartialEq> LwwRegister<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Apply a write. Returns whether the visible value or stamp changed.
    pub fn set(
        &mut self,
        value: T,
        stamp: Stamp,
        field: &'static str,
    ) -> Result<bool, MergeConflict> {
        let incoming = Self { value, stamp };
        let resolved = self.resolve(&incoming, field)?;
        let changed = resolved != *self;
        *self = resolved;
        Ok(changed)
    }

    /// Merge with a named field for conflict reporting.
    pub fn resolve(&self, other: &Self, field: &'static str) -> Result<Self, MergeConflict> {
        if self.stamp > other.stamp {
            return Ok(self.clone());
        }
        if other.stamp > self.stamp {
            return Ok(other.clone());
        }
        if self.value == other.value {
            return Ok(self.clone());
        }
        Err(MergeConflict { field, stamp: self.stamp })
    }
}

impl<T: Clone + PartialEq> Merge for LwwRegister<T> {
    fn merge(&self, other: &Self) -> Result<Self, MergeConflict> {
        self.resolve(other, "register")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn author(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn higher_clock_wins() {
        let a = LwwRegister::new(true, Stamp::new(5, author(1)));
        let b = LwwRegister::new(false, Stamp::new(6, author(2)));

        assert_eq!(a.merge(&b).unwrap().value, false);
        assert_eq!(b.merge(&a).unwrap().value, false);
    }

    #[test]
    fn equal_clock_breaks_tie_on_author() {
        let a = LwwRegister::new("a", Stamp::new(4, author(9)));
        let b = LwwRegister::new("b", Stamp::new(4, author(3)));

        assert_eq!(a.merge(&b).unwrap().value, "a");
        assert_eq!(b.merge(&a).unwrap().value, "a");
    }

    #[test]
    fn merge_is_idempotent() {
        let a = LwwRegister::new(1, Stamp::new(2, author(1)));
        assert_eq!(a.merge(&a).unwrap(), a);
    }

    #[test]
    fn identical_stamp_with_different_values_is_a_conflict() {
        let stamp = Stamp::new(7, author(1));
        let a = LwwRegister::new(true, stamp);
        let b = LwwRegister::new(false, stamp);

        let conflict = a.resolve(&b, "todo.done").unwrap_err();
        assert_eq!(conflict.field, "todo.done");
        assert_eq!(conflict.stamp, stamp);
    }

    #[test]
    fn set_reports_whether_state_changed() {
        let mut register = LwwRegister::new(false, Stamp::new(1, author(1)));
        assert!(register.set(true, Stamp::new(2, author(1)), "flag").unwrap());
        assert!(!register.set(false, Stamp::new(1, author(1)), "flag").unwrap());
        assert!(*register.get());
    }
}
