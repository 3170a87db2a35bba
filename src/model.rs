//! Constraint model: CNF compiled from the catalog structure and learned rules.
//!
//! Clauses are emitted in a fixed order, so identical inputs always produce a
//! byte-identical DIMACS document:
//!
//! 1. fixed truths, in catalog order (banned options forced false, standard
//!    options without alternatives forced true);
//! 2. families, in order of first appearance: pairwise at-most-one clauses,
//!    then the at-least-one clause of required families;
//! 3. learned rules, in rule-set order:
//!
//! | Rule              | Clause       |
//! |-------------------|--------------|
//! | `A implies B`     | `(¬A ∨ B)`   |
//! | `A excludes B`    | `(¬A ∨ ¬B)`  |
//!
//! Options without a family are not grouped: each one behaves as a family of
//! its own.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::catalog::{Catalog, OptionInfo};
use crate::error::{Error, Result};
use crate::io::{write_atomic, write_json};
use crate::policy::Policy;
use crate::rules::{RuleKind, RuleSet};

// ============================================================================
// Variable map
// ============================================================================

/// Bijection between modeled option ids and DIMACS variables `1..=n`.
///
/// Serializes as a JSON object in variable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarMap {
    ids: Vec<String>,
    index: HashMap<String, u32>,
}

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the variable of `id`, allocating the next one if needed.
    pub fn allocate(&mut self, id: &str) -> u32 {
        if let Some(&var) = self.index.get(id) {
            return var;
        }
        self.ids.push(id.to_string());
        let var = self.ids.len() as u32;
        self.index.insert(id.to_string(), var);
        var
    }

    pub fn var(&self, id: &str) -> Option<u32> {
        self.index.get(id).copied()
    }

    pub fn id(&self, var: u32) -> Option<&str> {
        let i = (var as usize).checked_sub(1)?;
        self.ids.get(i).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `(id, var)` pairs in variable order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.ids.iter().zip(1..).map(|(id, var)| (id.as_str(), var))
    }
}

impl Serialize for VarMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (id, var) in self.iter() {
            map.serialize_entry(id, &var)?;
        }
        map.end()
    }
}

// ============================================================================
// CNF
// ============================================================================

/// A CNF formula over variables `1..=num_vars`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintModel {
    pub num_vars: u32,
    pub clauses: Vec<Vec<i32>>,
}

impl ConstraintModel {
    pub fn new(num_vars: u32) -> Self {
        Self {
            num_vars,
            clauses: Vec::new(),
        }
    }

    pub fn num_clauses(&self) -> usize {
        self.clauses.len()
    }

    pub fn add_clause(&mut self, clause: Vec<i32>) {
        self.clauses.push(clause);
    }

    /// Checks that every literal is non-zero and within `1..=num_vars`.
    pub fn validate(&self) -> Result<()> {
        for &lit in self.clauses.iter().flatten() {
            if lit == 0 || lit.unsigned_abs() > self.num_vars {
                return Err(Error::LiteralOutOfRange {
                    literal: lit,
                    num_vars: self.num_vars,
                });
            }
        }
        Ok(())
    }

    /// Renders the model in DIMACS CNF format.
    pub fn to_dimacs(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "p cnf {} {}", self.num_vars, self.clauses.len());
        for clause in &self.clauses {
            for lit in clause {
                let _ = write!(out, "{} ", lit);
            }
            out.push_str("0\n");
        }
        out
    }

    /// Parses a DIMACS CNF document.
    ///
    /// Comment lines (`c ...`) are skipped and a clause may span several
    /// lines; each clause ends at a `0`. A `%` line ends the input.
    pub fn parse_dimacs<R: Read>(reader: R) -> Result<Self> {
        let mut header: Option<(u32, usize)> = None;
        let mut clauses = Vec::new();
        let mut current = Vec::new();

        for (i, line) in BufReader::new(reader).lines().enumerate() {
            let line_num = i + 1;
            let line = line.map_err(|e| Error::io("<dimacs>", e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('c') {
                continue;
            }
            if line.starts_with('%') {
                break;
            }
            let err = |message: String| Error::Dimacs { line: line_num, message };

            if line.starts_with('p') {
                if header.is_some() {
                    return Err(err("duplicate problem line".to_string()));
                }
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() != 4 || parts[1] != "cnf" {
                    return Err(err(format!("invalid problem line: {:?}", line)));
                }
                let num_vars = parts[2]
                    .parse::<u32>()
                    .map_err(|_| err(format!("invalid number of variables: {:?}", parts[2])))?;
                let num_clauses = parts[3]
                    .parse::<usize>()
                    .map_err(|_| err(format!("invalid number of clauses: {:?}", parts[3])))?;
                header = Some((num_vars, num_clauses));
                continue;
            }

            let Some((num_vars, _)) = header else {
                return Err(err("clause before problem line".to_string()));
            };
            for token in line.split_whitespace() {
                let lit: i32 = token
                    .parse()
                    .map_err(|_| err(format!("invalid literal: {:?}", token)))?;
                if lit == 0 {
                    clauses.push(std::mem::take(&mut current));
                } else if lit.unsigned_abs() > num_vars {
                    return Err(Error::LiteralOutOfRange { literal: lit, num_vars });
                } else {
                    current.push(lit);
                }
            }
        }

        let Some((num_vars, num_clauses)) = header else {
            return Err(Error::Dimacs {
                line: 0,
                message: "missing problem line".to_string(),
            });
        };
        if !current.is_empty() {
            log::warn!("Last clause is not terminated by 0, accepting it anyway");
            clauses.push(current);
        }
        if clauses.len() != num_clauses {
            log::warn!("Expected {} clauses but parsed {}", num_clauses, clauses.len());
        }
        Ok(Self { num_vars, clauses })
    }

    pub fn load_dimacs(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
        Self::parse_dimacs(file).map_err(|e| match e {
            Error::Io { source, .. } => Error::io(path, source),
            other => other,
        })
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Output of [`ModelBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltModel {
    pub model: ConstraintModel,
    pub varmap: VarMap,
    /// Families that must have a member selected, sorted.
    pub required_families: Vec<String>,
    /// Rules whose source or target is not a usable variable.
    pub dropped_rules: usize,
}

impl BuiltModel {
    /// Writes `model.cnf`, `varmap.json` and `required_families.json`.
    pub fn write(&self, cnf: &Path, varmap: &Path, required: &Path) -> Result<()> {
        write_atomic(cnf, self.model.to_dimacs().as_bytes())?;
        write_json(varmap, &self.varmap)?;
        write_json(required, &self.required_families)?;
        Ok(())
    }
}

pub struct ModelBuilder<'a> {
    catalog: &'a Catalog,
    policy: &'a Policy,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(catalog: &'a Catalog, policy: &'a Policy) -> Self {
        Self { catalog, policy }
    }

    pub fn build(&self, rules: &RuleSet) -> BuiltModel {
        let modeled: Vec<&OptionInfo> = self.catalog.iter().filter(|o| self.policy.is_modeled(o)).collect();

        let mut varmap = VarMap::new();
        for option in &modeled {
            varmap.allocate(&option.id);
        }
        let mut model = ConstraintModel::new(varmap.len() as u32);

        // Named families in order of first appearance.
        let mut families: Vec<(&str, Vec<&OptionInfo>)> = Vec::new();
        let mut family_index: HashMap<&str, usize> = HashMap::new();
        for &option in &modeled {
            if !option.has_family() {
                continue;
            }
            let i = *family_index.entry(option.family.as_str()).or_insert_with(|| {
                families.push((option.family.as_str(), Vec::new()));
                families.len() - 1
            });
            families[i].1.push(option);
        }

        // Fixed truths.
        for option in &modeled {
            let var = lit(&varmap, &option.id);
            if self.policy.is_banned(&option.id) {
                model.add_clause(vec![-var]);
            } else if option.is_standard {
                let alone = match family_index.get(option.family.as_str()) {
                    Some(&i) => families[i].1.len() == 1,
                    None => true,
                };
                if alone {
                    model.add_clause(vec![var]);
                }
            }
        }

        // Family cardinality.
        let mut required = BTreeSet::new();
        for (name, members) in &families {
            let usable: Vec<i32> = members
                .iter()
                .filter(|o| !self.policy.is_banned(&o.id))
                .map(|o| lit(&varmap, &o.id))
                .collect();
            if usable.len() < 2 {
                continue;
            }
            for (i, &a) in usable.iter().enumerate() {
                for &b in &usable[i + 1..] {
                    model.add_clause(vec![-a, -b]);
                }
            }
            if members.iter().any(|o| o.is_standard || o.is_selected) {
                model.add_clause(usable.clone());
                required.insert(name.to_string());
            }
        }

        // Learned rules.
        let usable = |id: &str| -> Option<i32> {
            if self.policy.is_banned(id) {
                return None;
            }
            varmap.var(id).map(|v| v as i32)
        };
        let mut dropped = 0;
        for rule in rules {
            match (usable(&rule.source), usable(&rule.target)) {
                (Some(a), Some(b)) => model.add_clause(match rule.kind {
                    RuleKind::Implies => vec![-a, b],
                    RuleKind::Excludes => vec![-a, -b],
                }),
                _ => {
                    log::debug!("Dropping rule {}: option is unmodeled or banned", rule);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            log::warn!("Dropped {} of {} rules referencing unusable options", dropped, rules.len());
        }

        log::info!(
            "Built model: {} vars, {} clauses, {} required families",
            model.num_vars,
            model.num_clauses(),
            required.len()
        );
        BuiltModel {
            model,
            varmap,
            required_families: required.into_iter().collect(),
            dropped_rules: dropped,
        }
    }
}

fn lit(varmap: &VarMap, id: &str) -> i32 {
    // Every modeled option was allocated before any clause is emitted.
    varmap.var(id).map_or(0, |v| v as i32)
}
