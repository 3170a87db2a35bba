//! Exact model counting.
//!
//! The analyzer only needs a number out of a [`ConstraintModel`], so counting
//! sits behind the [`ModelCounter`] trait. The built-in [`BddCounter`]
//! conjoins the clauses into a reduced ordered BDD (variable `1` at the top)
//! and counts its satisfying assignments:
//!
//! ```text
//! count(0) = 0
//! count(1) = 2^n
//! count(v ? hi : lo) = (count(lo) + count(hi)) / 2
//! ```
//!
//! The halving at each node accounts for the decided variable, so skipped
//! levels need no bookkeeping.

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::error::{Error, Result};
use crate::model::ConstraintModel;

pub trait ModelCounter {
    /// Number of assignments to `1..=num_vars` satisfying every clause.
    fn count(&self, model: &ConstraintModel) -> Result<BigUint>;
}

#[derive(Debug, Clone, Default)]
pub struct BddCounter {
    /// Give up once the diagram holds this many nodes.
    pub node_limit: Option<usize>,
}

impl BddCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_limit(mut self, limit: Option<usize>) -> Self {
        self.node_limit = limit;
        self
    }
}

impl ModelCounter for BddCounter {
    fn count(&self, model: &ConstraintModel) -> Result<BigUint> {
        model.validate()?;

        let mut bdd = Diagram::new(self.node_limit);
        let mut f = ONE;
        for (i, clause) in model.clauses.iter().enumerate() {
            let c = bdd.mk_clause(clause)?;
            f = bdd.apply_and(f, c)?;
            if f == ZERO {
                log::debug!("Model became unsatisfiable at clause {}", i + 1);
                break;
            }
        }
        log::debug!("BDD for {} clauses has {} nodes", model.num_clauses(), bdd.size());

        let count = bdd.sat_count(f, model.num_vars);
        log::info!("Model count: {}", count);
        Ok(count)
    }
}

// ─── Diagram ───

type NodeId = u32;

const ZERO: NodeId = 0;
const ONE: NodeId = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct Node {
    variable: u32,
    low: NodeId,
    high: NodeId,
}

/// Minimal ROBDD manager without complement edges.
struct Diagram {
    nodes: Vec<Node>,
    unique: HashMap<Node, NodeId>,
    and_cache: HashMap<(NodeId, NodeId), NodeId>,
    limit: Option<usize>,
}

impl Diagram {
    fn new(limit: Option<usize>) -> Self {
        // Terminals occupy slots 0 and 1; their variable sorts below every real one.
        let terminal = |id| Node {
            variable: u32::MAX,
            low: id,
            high: id,
        };
        Self {
            nodes: vec![terminal(ZERO), terminal(ONE)],
            unique: HashMap::new(),
            and_cache: HashMap::new(),
            limit,
        }
    }

    fn size(&self) -> usize {
        self.nodes.len()
    }

    fn mk_node(&mut self, variable: u32, low: NodeId, high: NodeId) -> Result<NodeId> {
        if low == high {
            return Ok(low);
        }
        let node = Node { variable, low, high };
        if let Some(&id) = self.unique.get(&node) {
            return Ok(id);
        }
        if let Some(limit) = self.limit {
            if self.nodes.len() >= limit {
                return Err(Error::Counter(format!("BDD exceeded {} nodes", limit)));
            }
        }
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        self.unique.insert(node, id);
        Ok(id)
    }

    /// Disjunction of the literals, built bottom-up.
    fn mk_clause(&mut self, clause: &[i32]) -> Result<NodeId> {
        let mut lits = clause.to_vec();
        lits.sort_by_key(|lit| (lit.unsigned_abs(), *lit));
        lits.dedup();
        if lits.windows(2).any(|w| w[0] == -w[1]) {
            return Ok(ONE);
        }

        let mut f = ZERO;
        for &lit in lits.iter().rev() {
            let v = lit.unsigned_abs();
            f = if lit > 0 {
                self.mk_node(v, f, ONE)?
            } else {
                self.mk_node(v, ONE, f)?
            };
        }
        Ok(f)
    }

    fn apply_and(&mut self, u: NodeId, v: NodeId) -> Result<NodeId> {
        if u == ZERO || v == ZERO {
            return Ok(ZERO);
        }
        if u == ONE || u == v {
            return Ok(v);
        }
        if v == ONE {
            return Ok(u);
        }
        let key = if u < v { (u, v) } else { (v, u) };
        if let Some(&res) = self.and_cache.get(&key) {
            return Ok(res);
        }

        let (nu, nv) = (self.nodes[u as usize], self.nodes[v as usize]);
        let top = nu.variable.min(nv.variable);
        let (u0, u1) = if nu.variable == top { (nu.low, nu.high) } else { (u, u) };
        let (v0, v1) = if nv.variable == top { (nv.low, nv.high) } else { (v, v) };

        let low = self.apply_and(u0, v0)?;
        let high = self.apply_and(u1, v1)?;
        let res = self.mk_node(top, low, high)?;
        self.and_cache.insert(key, res);
        Ok(res)
    }

    fn sat_count(&self, node: NodeId, num_vars: u32) -> BigUint {
        let max = BigUint::from(1u8) << num_vars;
        let mut cache = HashMap::new();
        self.sat_count_(node, &max, &mut cache)
    }

    fn sat_count_(&self, node: NodeId, max: &BigUint, cache: &mut HashMap<NodeId, BigUint>) -> BigUint {
        if node == ZERO {
            return BigUint::ZERO;
        } else if node == ONE {
            return max.clone();
        }
        if let Some(count) = cache.get(&node) {
            return count.clone();
        }

        let n = self.nodes[node as usize];
        let count: BigUint = (self.sat_count_(n.low, max, cache) + self.sat_count_(n.high, max, cache)) >> 1;
        cache.insert(node, count.clone());
        count
    }
}
