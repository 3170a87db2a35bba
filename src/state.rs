use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Separator between option ids in a base-state signature.
pub const SIGNATURE_SEPARATOR: char = '.';

/// A set of option ids used as the context of a probe.
///
/// Members are kept sorted and duplicate-free, so two states with the same
/// members are equal regardless of construction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct BaseState(Vec<String>);

impl BaseState {
    pub fn new(members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let set: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        Self(set.into_iter().collect())
    }

    pub fn members(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.binary_search_by(|m| m.as_str().cmp(id)).is_ok()
    }

    /// Canonical signature: sorted member ids joined with [`SIGNATURE_SEPARATOR`].
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                sig.push(SIGNATURE_SEPARATOR);
            }
            sig.push_str(id);
        }
        sig
    }

    /// Returns a copy with every id in `remove` dropped and `add` inserted.
    pub fn replacing<'a>(&self, remove: impl IntoIterator<Item = &'a str>, add: &str) -> Self {
        let remove: BTreeSet<&str> = remove.into_iter().collect();
        let kept = self.0.iter().map(String::as_str).filter(|id| !remove.contains(id));
        Self::new(kept.chain(std::iter::once(add)))
    }
}

impl From<Vec<String>> for BaseState {
    fn from(members: Vec<String>) -> Self {
        Self::new(members)
    }
}

impl From<BaseState> for Vec<String> {
    fn from(state: BaseState) -> Self {
        state.0
    }
}

impl Display for BaseState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.0.join(", "))
    }
}
