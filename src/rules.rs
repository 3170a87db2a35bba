//! Rule aggregation: folding observations into a set of implication and
//! exclusion edges.
//!
//! | Observation field    | Edge                            |
//! |----------------------|---------------------------------|
//! | `engineAddedOptions` | `optionAdded` **implies** `id`  |
//! | `removedOptions`     | `optionAdded` **excludes** `id` |
//!
//! The same edge revealed by several base states is stored once.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use crate::observation::Observation;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKind {
    /// Adding the source forces the target on.
    Implies,
    /// Adding the source forces the target off.
    Excludes,
}

/// A learned edge between two options.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rule {
    pub kind: RuleKind,
    pub source: String,
    pub target: String,
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let op = match self.kind {
            RuleKind::Implies => "->",
            RuleKind::Excludes => "-x",
        };
        write!(f, "{} {} {}", self.source, op, self.target)
    }
}

/// Deduplicated, ordered set of rules.
///
/// Iteration is ordered by `(kind, source, target)`, which keeps everything
/// built from it deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeSet<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_observations<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> Self {
        let mut rules = Self::new();
        rules.extend_from(observations);
        rules
    }

    /// Adds the edges revealed by one observation. Returns the number of
    /// edges that were not yet known.
    pub fn add_observation(&mut self, obs: &Observation) -> usize {
        let mut added = 0;
        for id in &obs.engine_added_options {
            added += self.insert(RuleKind::Implies, &obs.option_added, id) as usize;
        }
        for id in &obs.removed_options {
            added += self.insert(RuleKind::Excludes, &obs.option_added, id) as usize;
        }
        added
    }

    pub fn extend_from<'a>(&mut self, observations: impl IntoIterator<Item = &'a Observation>) -> usize {
        observations.into_iter().map(|obs| self.add_observation(obs)).sum()
    }

    pub fn insert(&mut self, kind: RuleKind, source: &str, target: &str) -> bool {
        self.rules.insert(Rule {
            kind,
            source: source.to_string(),
            target: target.to_string(),
        })
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn count(&self, kind: RuleKind) -> usize {
        self.rules.iter().filter(|r| r.kind == kind).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Number of rules in `self` that are absent from `previous`.
    pub fn new_since(&self, previous: &RuleSet) -> usize {
        self.rules.difference(&previous.rules).count()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::collections::btree_set::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
