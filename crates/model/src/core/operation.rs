use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of mutation captured from the source store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Inserted,
    Updated,
    Deleted,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Inserted, Operation::Updated, Operation::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Inserted => "inserted",
            Operation::Updated => "updated",
            Operation::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subset of operations a binding replicates.
///
/// Defaults to all three; an empty set makes the binding inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSet {
    inserted: bool,
    updated: bool,
    deleted: bool,
}

impl Default for ActionSet {
    fn default() -> Self {
        ActionSet::all()
    }
}

impl ActionSet {
    pub fn all() -> Self {
        ActionSet {
            inserted: true,
            updated: true,
            deleted: true,
        }
    }

    pub fn empty() -> Self {
        ActionSet {
            inserted: false,
            updated: false,
            deleted: false,
        }
    }

    pub fn contains(&self, op: Operation) -> bool {
        match op {
            Operation::Inserted => self.inserted,
            Operation::Updated => self.updated,
            Operation::Deleted => self.deleted,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.inserted && !self.updated && !self.deleted
    }

    pub fn insert(&mut self, op: Operation) {
        match op {
            Operation::Inserted => self.inserted = true,
            Operation::Updated => self.updated = true,
            Operation::Deleted => self.deleted = true,
        }
    }
}

impl FromIterator<Operation> for ActionSet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        let mut set = ActionSet::empty();
        for op in iter {
            set.insert(op);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_roundtrip_lowercase() {
        let json = serde_json::to_string(&Operation::Inserted).unwrap();
        assert_eq!(json, "\"inserted\"");
        let op: Operation = serde_json::from_str("\"deleted\"").unwrap();
        assert_eq!(op, Operation::Deleted);
    }

    #[test]
    fn action_set_defaults_to_all() {
        let set = ActionSet::default();
        for op in Operation::ALL {
            assert!(set.contains(op));
        }
    }

    #[test]
    fn action_set_from_iter() {
        let set: ActionSet = [Operation::Inserted, Operation::Deleted].into_iter().collect();
        assert!(set.contains(Operation::Inserted));
        assert!(!set.contains(Operation::Updated));
        assert!(set.contains(Operation::Deleted));
        assert!(!set.is_empty());
        assert!(ActionSet::empty().is_empty());
    }
}
