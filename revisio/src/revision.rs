use sha2::{Digest, Sha256};

use crate::operation::{Action, Direction, Operation};

/// A named step in the schema's history.
///
/// A revision points at its parent and carries its operations in declared
/// order. Applied forward, the operations run in that order; applied backward,
/// each operation's reverse runs in the opposite order.
///
/// # IMPORTANT WARNING
///
/// **Once a revision has been applied to any database, its id, parent and
/// operations must NEVER change.** They feed the checksum recorded with the
/// version marker, and a mismatch stops every later run.
#[derive(Debug, Clone)]
pub struct Revision {
    id: String,
    parent: Option<String>,
    description: Option<String>,
    operations: Vec<Operation>,
}

impl Revision {
    /// A revision on top of `parent`.
    pub fn new(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: Some(parent.into()),
            description: None,
            operations: Vec::new(),
        }
    }

    /// The first revision of a line. Roots are baselines and carry no
    /// operations.
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            description: None,
            operations: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<Operation>) -> Self {
        self.operations.push(operation.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn summary(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// A revision is irreversible as soon as one operation lacks a reverse.
    pub fn is_reversible(&self) -> bool {
        self.operations.iter().all(Operation::is_reversible)
    }

    /// The actions to run in `direction`, in execution order.
    ///
    /// Returns `None` when going backward through an irreversible revision.
    pub(crate) fn actions(&self, direction: Direction) -> Option<Vec<Action<'_>>> {
        match direction {
            Direction::Forward => self
                .operations
                .iter()
                .map(|op| op.action(Direction::Forward))
                .collect(),
            Direction::Backward => self
                .operations
                .iter()
                .rev()
                .map(|op| op.action(Direction::Backward))
                .collect(),
        }
    }

    /// Number of operations that may destroy rows when run in `direction`.
    pub fn destructive_count(&self, direction: Direction) -> usize {
        self.actions(direction)
            .map(|actions| actions.iter().filter(|a| a.destroys().is_some()).count())
            .unwrap_or(0)
    }

    /// Checksum over id, parent and operation descriptions.
    /// This is used to verify that revisions haven't been modified after being applied.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.parent.as_deref().unwrap_or("").as_bytes());
        for operation in &self.operations {
            hasher.update(b"|");
            hasher.update(operation.describe().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{FieldDef, FieldType, Predicate};

    #[test]
    fn backward_actions_run_in_reverse_order() {
        let revision = Revision::new("2", "1")
            .operation(Operation::add_field("t", FieldDef::new("a", FieldType::Text)))
            .operation(Operation::raw("UPDATE t SET a = 'x'").reverse("UPDATE t SET a = NULL"));
        let forward: Vec<String> = revision
            .actions(Direction::Forward)
            .unwrap()
            .iter()
            .map(|a| a.describe())
            .collect();
        let backward: Vec<String> = revision
            .actions(Direction::Backward)
            .unwrap()
            .iter()
            .map(|a| a.describe())
            .collect();
        assert_eq!(forward[1], "raw sql [UPDATE t SET a = 'x']");
        assert_eq!(backward[0], "raw sql [UPDATE t SET a = NULL]");
        assert_eq!(backward[1], "remove field t.a");
    }

    #[test]
    fn irreversible_revision_has_no_backward_actions() {
        let revision = Revision::new("2", "1")
            .operation(Operation::add_field("t", FieldDef::new("a", FieldType::Text)))
            .operation(Operation::delete_rows(Predicate::all("t")));
        assert!(!revision.is_reversible());
        assert!(revision.actions(Direction::Backward).is_none());
        assert_eq!(revision.destructive_count(Direction::Forward), 1);
    }

    #[test]
    fn checksum_tracks_operations() {
        let a = Revision::new("2", "1").operation(Operation::raw("SELECT 1").reverse_noop());
        let b = Revision::new("2", "1").operation(Operation::raw("SELECT 2").reverse_noop());
        assert_eq!(a.checksum(), a.clone().checksum());
        assert_ne!(a.checksum(), b.checksum());
        // description is documentation only
        assert_eq!(a.checksum(), a.clone().description("noop").checksum());
    }
}
