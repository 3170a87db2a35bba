//! Convergence analysis: run the whole pipeline at growing sampling budgets
//! and watch the learned model settle.
//!
//! For every budget `N` the [`Analyzer`] samples `N` base states, probes them,
//! folds the observations into the accumulated rule set, builds the CNF and
//! counts its models. Each budget yields one [`ConvergenceRow`]:
//!
//! | Column              | Meaning                                         |
//! |---------------------|-------------------------------------------------|
//! | `N`                 | sampling budget                                 |
//! | `probed_pairs`      | pairs answered at this budget                   |
//! | `unique_rules`      | size of the accumulated rule set                |
//! | `cnf_vars`          | model variables                                 |
//! | `cnf_clauses`       | model clauses                                   |
//! | `count`             | exact model count                               |
//! | `log10_count`       | `log10(count)`                                  |
//! | `ratio_to_prev`     | `count / previous count`                        |
//! | `delta_log10`       | `log10_count - previous log10_count`            |
//! | `new_rules_vs_prev` | rules not present at the previous budget        |
//!
//! The analyzer only reports the signal. Whether a run has converged is up to
//! the caller; [`is_converged`] is the usual test.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::counter::ModelCounter;
use crate::error::Result;
use crate::io::{write_atomic, write_json};
use crate::model::ModelBuilder;
use crate::observation::Observation;
use crate::oracle::Oracle;
use crate::policy::Policy;
use crate::probe::ProbeEngine;
use crate::rules::RuleSet;
use crate::sampler::{Sampler, SamplerConfig};
use crate::state::BaseState;

/// Budgets used when none are given.
pub const DEFAULT_SIZES: [usize; 4] = [1, 10, 30, 100];

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceRow {
    pub budget: usize,
    pub probed_pairs: usize,
    pub unique_rules: usize,
    pub cnf_vars: u32,
    pub cnf_clauses: usize,
    pub count: BigUint,
    /// `-inf` for an unsatisfiable model.
    pub log10_count: f64,
    pub ratio_to_prev: Option<f64>,
    pub delta_log10: Option<f64>,
    pub new_rules_vs_prev: usize,
}

impl ConvergenceRow {
    /// Whether this row shows no new rules and a count change within
    /// `tolerance` decades.
    pub fn is_stable(&self, tolerance: f64) -> bool {
        self.new_rules_vs_prev == 0 && self.delta_log10.is_some_and(|d| d.abs() <= tolerance)
    }
}

/// Whether the last row of a run is stable.
pub fn is_converged(rows: &[ConvergenceRow], tolerance: f64) -> bool {
    rows.last().is_some_and(|row| row.is_stable(tolerance))
}

/// Base-10 logarithm of an arbitrary-precision integer.
///
/// Large values are reduced to their top 64 bits first, which keeps the
/// result accurate to `f64` precision.
pub fn log10_biguint(n: &BigUint) -> f64 {
    let bits = n.bits();
    if bits <= 64 {
        return match u64::try_from(n) {
            Ok(0) | Err(_) => f64::NEG_INFINITY,
            Ok(v) => (v as f64).log10(),
        };
    }
    let shift = bits - 64;
    let top = u64::try_from(n >> shift).unwrap_or(u64::MAX);
    (top as f64).log10() + shift as f64 * std::f64::consts::LOG10_2
}

/// `(ratio, delta_log10)` of `current` against `previous`.
///
/// Both are `None` when `previous` is zero. The ratio is computed exactly in
/// `f64` while both counts fit in its mantissa.
pub fn compare_counts(previous: &BigUint, current: &BigUint) -> (Option<f64>, Option<f64>) {
    const EXACT_BITS: u64 = f64::MANTISSA_DIGITS as u64;

    if previous.bits() == 0 {
        return (None, None);
    }
    let delta = log10_biguint(current) - log10_biguint(previous);
    let ratio = if previous.bits() <= EXACT_BITS && current.bits() <= EXACT_BITS {
        match (u64::try_from(previous), u64::try_from(current)) {
            (Ok(p), Ok(c)) => c as f64 / p as f64,
            _ => 10f64.powf(delta),
        }
    } else {
        10f64.powf(delta)
    };
    (Some(ratio), delta.is_finite().then_some(delta))
}

// ============================================================================
// Analyzer
// ============================================================================

/// Per-budget statistics written to `stats.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub base_states_count: usize,
    pub probed_pairs_count: usize,
    pub unique_rule_count: usize,
    pub cache_hits: usize,
    pub new_probes: usize,
    pub failed_probes: usize,
    pub deferred_probes: usize,
    pub dropped_rules: usize,
}

pub struct Analyzer<'a, O, C> {
    catalog: &'a Catalog,
    policy: &'a Policy,
    sampler_config: SamplerConfig,
    required: Vec<String>,
    seeds: Vec<BaseState>,
    extra: Vec<Observation>,
    engine: ProbeEngine<O>,
    counter: C,
    out_dir: Option<PathBuf>,
}

impl<'a, O: Oracle, C: ModelCounter> Analyzer<'a, O, C> {
    pub fn new(
        catalog: &'a Catalog,
        policy: &'a Policy,
        required: Vec<String>,
        seeds: Vec<BaseState>,
        engine: ProbeEngine<O>,
        counter: C,
    ) -> Self {
        Self {
            catalog,
            policy,
            sampler_config: SamplerConfig::default(),
            required,
            seeds,
            extra: Vec::new(),
            engine,
            counter,
            out_dir: None,
        }
    }

    pub fn with_sampler_config(mut self, config: SamplerConfig) -> Self {
        self.sampler_config = config;
        self
    }

    /// Observations recorded outside of probing, folded in at every budget.
    pub fn with_extra_observations(mut self, extra: Vec<Observation>) -> Self {
        self.extra = extra;
        self
    }

    /// Writes per-budget artifacts under `<dir>/N<budget>/` and the
    /// convergence tables under `<dir>/`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    /// Runs every budget in order and returns one row per budget.
    pub fn run(&mut self, sizes: &[usize]) -> Result<Vec<ConvergenceRow>> {
        let sampler = Sampler::new(self.catalog, self.policy, self.sampler_config.clone());
        let builder = ModelBuilder::new(self.catalog, self.policy);
        let candidates = ProbeEngine::<O>::candidates(self.catalog, self.policy);
        log::info!("{} probe candidates", candidates.len());

        let mut rows: Vec<ConvergenceRow> = Vec::with_capacity(sizes.len());
        let mut rules = RuleSet::from_observations(&self.extra);

        for &n in sizes {
            log::info!("─── N = {} ───", n);
            let states = sampler.sample(&self.required, &self.seeds, n)?;
            let (observations, probe_stats) = self.engine.probe_states(&states, &candidates)?;

            let previous = rules.clone();
            rules.extend_from(&observations);
            let built = builder.build(&rules);
            let count = self.counter.count(&built.model)?;

            let log10_count = log10_biguint(&count);
            let (ratio_to_prev, delta_log10) = match rows.last() {
                Some(prev) => compare_counts(&prev.count, &count),
                None => (None, None),
            };
            let row = ConvergenceRow {
                budget: n,
                probed_pairs: observations.len(),
                unique_rules: rules.len(),
                cnf_vars: built.model.num_vars,
                cnf_clauses: built.model.num_clauses(),
                count,
                log10_count,
                ratio_to_prev,
                delta_log10,
                new_rules_vs_prev: rules.new_since(&previous),
            };
            log::info!(
                "[N={}] pairs={} rules={} (+{}) count={}",
                n,
                row.probed_pairs,
                row.unique_rules,
                row.new_rules_vs_prev,
                row.count
            );

            if let Some(out) = &self.out_dir {
                let dir = out.join(format!("N{}", n));
                let stats = RunStats {
                    base_states_count: states.len(),
                    probed_pairs_count: observations.len(),
                    unique_rule_count: rules.len(),
                    cache_hits: probe_stats.cache_hits,
                    new_probes: probe_stats.probed,
                    failed_probes: probe_stats.failed,
                    deferred_probes: probe_stats.deferred,
                    dropped_rules: built.dropped_rules,
                };
                write_json(dir.join("base_states.json"), &states)?;
                write_json(dir.join("constraints.json"), &observations)?;
                built.write(
                    &dir.join("model.cnf"),
                    &dir.join("varmap.json"),
                    &dir.join("required_families.json"),
                )?;
                write_atomic(dir.join("count_result.txt"), row.count.to_string().as_bytes())?;
                write_json(dir.join("stats.json"), &stats)?;
            }
            rows.push(row);
        }

        if let Some(out) = &self.out_dir {
            write_tables(out, &rows)?;
        }
        Ok(rows)
    }
}

// ============================================================================
// Tables
// ============================================================================

const COLUMNS: [&str; 10] = [
    "N",
    "probed_pairs",
    "unique_rules",
    "cnf_vars",
    "cnf_clauses",
    "count",
    "log10_count",
    "ratio_to_prev",
    "delta_log10",
    "new_rules_vs_prev",
];

/// Writes `convergence_table.csv` and `convergence_table.md` into `dir`.
pub fn write_tables(dir: &Path, rows: &[ConvergenceRow]) -> Result<()> {
    write_atomic(dir.join("convergence_table.csv"), to_csv(rows).as_bytes())?;
    write_atomic(dir.join("convergence_table.md"), to_markdown(rows).as_bytes())?;
    Ok(())
}

pub fn to_csv(rows: &[ConvergenceRow]) -> String {
    let mut out = COLUMNS.join(",");
    out.push('\n');
    for r in rows {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{}",
            r.budget,
            r.probed_pairs,
            r.unique_rules,
            r.cnf_vars,
            r.cnf_clauses,
            r.count,
            r.log10_count,
            opt(r.ratio_to_prev, |x| x.to_string()),
            opt(r.delta_log10, |x| x.to_string()),
            r.new_rules_vs_prev
        );
    }
    out
}

pub fn to_markdown(rows: &[ConvergenceRow]) -> String {
    let mut out = String::from("|N|probed|(rules)|vars|clauses|count|log10|ratio_to_prev|delta_log10|new_rules_vs_prev|\n");
    out.push_str("|-|-|-|-|-|-|-|-|-|-|\n");
    for r in rows {
        let _ = writeln!(
            out,
            "|{}|{}|{}|{}|{}|{}|{:.2}|{}|{}|{}|",
            r.budget,
            r.probed_pairs,
            r.unique_rules,
            r.cnf_vars,
            r.cnf_clauses,
            r.count,
            r.log10_count,
            opt(r.ratio_to_prev, |x| significant(x, 4)),
            opt(r.delta_log10, |x| format!("{:.4}", x)),
            r.new_rules_vs_prev
        );
    }
    out
}

fn opt(value: Option<f64>, f: impl Fn(f64) -> String) -> String {
    value.map(f).unwrap_or_default()
}

/// Formats `x` with `digits` significant digits, trailing zeros removed.
fn significant(x: f64, digits: usize) -> String {
    if x == 0.0 || !x.is_finite() {
        return x.to_string();
    }
    let exp = x.abs().log10().floor() as i32;
    if exp < -4 || exp >= digits as i32 {
        return format!("{:.*e}", digits - 1, x);
    }
    let decimals = (digits as i32 - 1 - exp).max(0) as usize;
    let s = format!("{:.*}", decimals, x);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}
