use std::collections::{HashMap, HashSet};

use crate::error::Error;
use crate::operation::Direction;
use crate::revision::Revision;

/// Alias for the designated root revision.
pub const BASE: &str = "base";
/// Alias for the tip of the designated root's line.
pub const HEAD: &str = "head";

/// One revision to apply, and which way.
#[derive(Debug, Clone, Copy)]
pub struct Step<'r> {
    pub revision: &'r Revision,
    pub direction: Direction,
}

impl<'r> Step<'r> {
    /// The revision the store is at once this step has been applied.
    pub fn target(&self) -> &'r str {
        match self.direction {
            Direction::Forward => self.revision.id(),
            Direction::Backward => self
                .revision
                .parent()
                .unwrap_or_else(|| self.revision.id()),
        }
    }
}

/// The immutable set of known revisions, organised as singly linked lines.
///
/// Every revision except a root names a parent, no parent has two children,
/// and there are no cycles. Several independent lines may coexist; the line
/// of the first declared root is the designated one (`base` / `head`).
#[derive(Debug)]
pub struct RevisionRegistry {
    revisions: Vec<Revision>,
    /// Revision indices per line, root first.
    lines: Vec<Vec<usize>>,
    /// id -> (line, position in line)
    positions: HashMap<String, (usize, usize)>,
}

impl RevisionRegistry {
    /// Build a registry, validating the chain invariants.
    pub fn try_new(revisions: Vec<Revision>) -> Result<Self, Error> {
        if revisions.is_empty() {
            return Err(Error::InvalidRegistry(
                "a registry needs at least one revision".to_string(),
            ));
        }

        let mut ids: HashMap<&str, usize> = HashMap::new();
        for (index, revision) in revisions.iter().enumerate() {
            if ids.insert(revision.id(), index).is_some() {
                return Err(Error::InvalidRegistry(format!(
                    "duplicate revision id '{}'",
                    revision.id()
                )));
            }
        }

        // Check parents and branching
        let mut child_of: HashMap<&str, usize> = HashMap::new();
        let mut roots = Vec::new();
        for (index, revision) in revisions.iter().enumerate() {
            match revision.parent() {
                None => {
                    if !revision.operations().is_empty() {
                        return Err(Error::InvalidRegistry(format!(
                            "root revision '{}' must not carry operations",
                            revision.id()
                        )));
                    }
                    roots.push(index);
                }
                Some(parent) => {
                    if !ids.contains_key(parent) {
                        return Err(Error::InvalidRegistry(format!(
                            "revision '{}' names unknown parent '{}'",
                            revision.id(),
                            parent
                        )));
                    }
                    if let Some(sibling) = child_of.insert(parent, index) {
                        return Err(Error::InvalidRegistry(format!(
                            "revision '{}' has two children ('{}' and '{}'); branching is not supported",
                            parent,
                            revisions[sibling].id(),
                            revision.id()
                        )));
                    }
                }
            }
        }

        if roots.is_empty() {
            return Err(Error::InvalidRegistry(
                "no root revision found; the parents form a cycle".to_string(),
            ));
        }

        let mut lines = Vec::with_capacity(roots.len());
        let mut positions = HashMap::new();
        let mut visited = HashSet::new();
        for root in roots {
            let mut line = Vec::new();
            let mut cursor = Some(root);
            while let Some(index) = cursor {
                visited.insert(index);
                positions.insert(revisions[index].id().to_string(), (lines.len(), line.len()));
                line.push(index);
                cursor = child_of.get(revisions[index].id()).copied();
            }
            lines.push(line);
        }

        if visited.len() != revisions.len() {
            let mut stranded = revisions
                .iter()
                .enumerate()
                .filter(|(index, _)| !visited.contains(index))
                .map(|(_, revision)| revision.id())
                .collect::<Vec<_>>();
            stranded.sort();
            return Err(Error::InvalidRegistry(format!(
                "revisions {:?} are not reachable from any root; their parents form a cycle",
                stranded
            )));
        }

        Ok(Self {
            revisions,
            lines,
            positions,
        })
    }

    /// Build a registry, panicking if the revisions are invalid.
    /// For a non-panicking version, use `try_new`.
    pub fn new(revisions: Vec<Revision>) -> Self {
        match Self::try_new(revisions) {
            Ok(registry) => registry,
            Err(err) => panic!("{}", err),
        }
    }

    /// The designated root, used when a store has no version marker yet.
    pub fn base(&self) -> &Revision {
        &self.revisions[self.lines[0][0]]
    }

    /// Tip of the designated root's line.
    pub fn head(&self) -> &Revision {
        let line = &self.lines[0];
        &self.revisions[line[line.len() - 1]]
    }

    pub fn get(&self, id: &str) -> Option<&Revision> {
        self.positions
            .get(id)
            .map(|(line, position)| &self.revisions[self.lines[*line][*position]])
    }

    /// Resolve `base`, `head` or a literal id. Literal ids win over aliases.
    pub fn resolve(&self, id: &str) -> Result<&Revision, Error> {
        if let Some(revision) = self.get(id) {
            return Ok(revision);
        }
        match id {
            BASE => Ok(self.base()),
            HEAD => Ok(self.head()),
            _ => Err(Error::UnknownRevision(id.to_string())),
        }
    }

    /// All revisions in declaration order.
    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    /// Number of independent lines.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    fn position(&self, id: &str) -> Result<(usize, usize), Error> {
        let revision = self.resolve(id)?;
        Ok(self.positions[revision.id()])
    }

    /// The steps leading from `from` to `to`, in execution order.
    ///
    /// Fails before anything is applied when either id is unknown, when the
    /// two lie on different lines, or when a backward path crosses an
    /// irreversible revision. `from == to` yields no steps.
    pub fn resolve_path(&self, from: &str, to: &str) -> Result<Vec<Step<'_>>, Error> {
        let (from_line, from_position) = self.position(from)?;
        let (to_line, to_position) = self.position(to)?;
        if from_line != to_line {
            return Err(Error::DisconnectedChain {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let line = &self.lines[from_line];

        if to_position >= from_position {
            return Ok(line[from_position + 1..=to_position]
                .iter()
                .map(|index| Step {
                    revision: &self.revisions[*index],
                    direction: Direction::Forward,
                })
                .collect());
        }

        let mut steps = Vec::with_capacity(from_position - to_position);
        for index in line[to_position + 1..=from_position].iter().rev() {
            let revision = &self.revisions[*index];
            if !revision.is_reversible() {
                return Err(Error::IrreversibleRevision(revision.id().to_string()));
            }
            steps.push(Step {
                revision,
                direction: Direction::Backward,
            });
        }
        Ok(steps)
    }

    /// Revisions within an alembic-style range (`from:to`, either side
    /// optional), newest first. Without a range every line is listed.
    pub fn history(&self, range: Option<&str>) -> Result<Vec<&Revision>, Error> {
        let Some(range) = range else {
            return Ok(self
                .lines
                .iter()
                .flat_map(|line| line.iter().rev())
                .map(|index| &self.revisions[*index])
                .collect());
        };

        let (lower, upper) = match range.split_once(':') {
            Some((lower, upper)) => (lower.trim(), upper.trim()),
            None => (range.trim(), range.trim()),
        };
        let (line, lower_position, upper_position) = match (lower.is_empty(), upper.is_empty()) {
            (true, true) => (0, 0, self.lines[0].len() - 1),
            (false, true) => {
                let (line, position) = self.position(lower)?;
                (line, position, self.lines[line].len() - 1)
            }
            (true, false) => {
                let (line, position) = self.position(upper)?;
                (line, 0, position)
            }
            (false, false) => {
                let (lower_line, lower_position) = self.position(lower)?;
                let (upper_line, upper_position) = self.position(upper)?;
                if lower_line != upper_line {
                    return Err(Error::DisconnectedChain {
                        from: lower.to_string(),
                        to: upper.to_string(),
                    });
                }
                (lower_line, lower_position, upper_position)
            }
        };

        if lower_position > upper_position {
            return Err(Error::InvalidTarget(format!(
                "history range '{}' is reversed; expected older:newer",
                range
            )));
        }

        Ok(self.lines[line][lower_position..=upper_position]
            .iter()
            .rev()
            .map(|index| &self.revisions[*index])
            .collect())
    }
}
