//! End-to-end tests: sampling, probing against a scripted oracle, model
//! building, counting and convergence reporting.

use std::fs;

use num_bigint::BigUint;
use serde_json::Value;

use optprobe::catalog::Catalog;
use optprobe::convergence::{is_converged, Analyzer};
use optprobe::counter::{BddCounter, ModelCounter};
use optprobe::model::{ConstraintModel, ModelBuilder};
use optprobe::oracle::{Oracle, OracleError, OracleReply};
use optprobe::policy::Policy;
use optprobe::probe::{ProbeCache, ProbeConfig, ProbeEngine};
use optprobe::rules::{RuleKind, RuleSet};
use optprobe::state::BaseState;

const CATALOG: &str = "\
optionId,family,isStandardEquipment,isSelected,equipmentType
X,F,True,False,option
Y,F,False,False,option
Z,F,False,False,option
T,F,False,False,tequipment
";

/// Adding `Y` always removes `Z`; nothing else has side effects.
#[derive(Default)]
struct ScriptedOracle {
    calls: usize,
}

impl Oracle for ScriptedOracle {
    fn query(&mut self, option_added: &str, _base: &BaseState) -> Result<OracleReply, OracleError> {
        self.calls += 1;
        let removed_options = if option_added == "Y" {
            vec!["Z".to_string()]
        } else {
            Vec::new()
        };
        Ok(OracleReply {
            removed_options,
            ..OracleReply::default()
        })
    }
}

fn catalog() -> Catalog {
    Catalog::parse(CATALOG.as_bytes()).unwrap()
}

fn fast() -> ProbeConfig {
    ProbeConfig::default().with_delay(std::time::Duration::ZERO)
}

// ─── Model ─────────────────────────────────────────────────────────────────────

#[test]
fn required_family_with_exclusion() {
    let catalog = catalog();
    let policy = Policy::default();
    let mut rules = RuleSet::new();
    rules.insert(RuleKind::Excludes, "Y", "Z");

    let built = ModelBuilder::new(&catalog, &policy).build(&rules);
    assert_eq!(built.model.num_vars, 3);
    assert_eq!(built.varmap.var("T"), None);
    assert_eq!(built.required_families, ["F"]);
    assert_eq!(
        built.model.to_dimacs(),
        "p cnf 3 5\n-1 -2 0\n-1 -3 0\n-2 -3 0\n1 2 3 0\n-2 -3 0\n"
    );

    let count = BddCounter::new().count(&built.model).unwrap();
    assert_eq!(count, BigUint::from(3u32));
}

#[test]
fn dimacs_survives_a_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog();
    let policy = Policy::default();
    let built = ModelBuilder::new(&catalog, &policy).build(&RuleSet::new());
    built
        .write(
            &dir.path().join("model.cnf"),
            &dir.path().join("varmap.json"),
            &dir.path().join("required_families.json"),
        )
        .unwrap();

    let model = ConstraintModel::load_dimacs(dir.path().join("model.cnf")).unwrap();
    assert_eq!(model, built.model);
    // Exactly one of X, Y, Z.
    assert_eq!(BddCounter::new().count(&model).unwrap(), BigUint::from(3u32));
}

// ─── Convergence ───────────────────────────────────────────────────────────────

#[test]
fn convergence_run_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog();
    let policy = Policy::default();
    let mut oracle = ScriptedOracle::default();

    let cache = ProbeCache::open(dir.path().join("probe_cache.json")).unwrap();
    let engine = ProbeEngine::new(&mut oracle, cache, fast());
    let mut analyzer = Analyzer::new(
        &catalog,
        &policy,
        vec!["F".to_string()],
        vec![BaseState::new(["X"])],
        engine,
        BddCounter::new(),
    )
    .with_output_dir(dir.path());
    let rows = analyzer.run(&[1, 3]).unwrap();
    drop(analyzer);

    // N=1 probes {X} with Y and Z; N=3 adds {Z} and {Y}, one new pair each.
    assert_eq!(oracle.calls, 4);
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].budget, 1);
    assert_eq!(rows[0].probed_pairs, 2);
    assert_eq!(rows[0].unique_rules, 1);
    assert_eq!(rows[0].new_rules_vs_prev, 1);
    assert_eq!((rows[0].cnf_vars, rows[0].cnf_clauses), (3, 5));
    assert_eq!(rows[0].count, BigUint::from(3u32));
    assert_eq!(rows[0].ratio_to_prev, None);

    assert_eq!(rows[1].probed_pairs, 4);
    assert_eq!(rows[1].new_rules_vs_prev, 0);
    assert_eq!(rows[1].ratio_to_prev, Some(1.0));
    assert_eq!(rows[1].delta_log10, Some(0.0));
    assert!(is_converged(&rows, 0.01));

    let n1 = dir.path().join("N1");
    assert_eq!(fs::read_to_string(n1.join("count_result.txt")).unwrap(), "3");
    assert_eq!(
        fs::read_to_string(n1.join("model.cnf")).unwrap(),
        "p cnf 3 5\n-1 -2 0\n-1 -3 0\n-2 -3 0\n1 2 3 0\n-2 -3 0\n"
    );
    let varmap: Value = serde_json::from_str(&fs::read_to_string(n1.join("varmap.json")).unwrap()).unwrap();
    assert_eq!(varmap, serde_json::json!({"X": 1, "Y": 2, "Z": 3}));
    let stats: Value = serde_json::from_str(&fs::read_to_string(n1.join("stats.json")).unwrap()).unwrap();
    assert_eq!(stats["base_states_count"], 1);
    assert_eq!(stats["probed_pairs_count"], 2);
    assert_eq!(stats["unique_rule_count"], 1);

    let states: Vec<BaseState> =
        serde_json::from_str(&fs::read_to_string(dir.path().join("N3").join("base_states.json")).unwrap()).unwrap();
    assert_eq!(
        states,
        vec![BaseState::new(["X"]), BaseState::new(["Z"]), BaseState::new(["Y"])]
    );

    let md = fs::read_to_string(dir.path().join("convergence_table.md")).unwrap();
    assert_eq!(md.lines().count(), 4);
    let csv = fs::read_to_string(dir.path().join("convergence_table.csv")).unwrap();
    assert!(csv.starts_with("N,probed_pairs,unique_rules,"));
}

#[test]
fn rerun_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = catalog();
    let policy = Policy::default();
    let cache_path = dir.path().join("probe_cache.json");
    let seeds = vec![BaseState::new(["X"])];
    let required = vec!["F".to_string()];

    let mut first = ScriptedOracle::default();
    let engine = ProbeEngine::new(&mut first, ProbeCache::open(&cache_path).unwrap(), fast());
    let rows_first = Analyzer::new(&catalog, &policy, required.clone(), seeds.clone(), engine, BddCounter::new())
        .run(&[3])
        .unwrap();
    assert_eq!(first.calls, 4);

    let mut second = ScriptedOracle::default();
    let engine = ProbeEngine::new(&mut second, ProbeCache::open(&cache_path).unwrap(), fast());
    let rows_second = Analyzer::new(&catalog, &policy, required, seeds, engine, BddCounter::new())
        .run(&[3])
        .unwrap();
    assert_eq!(second.calls, 0);
    assert_eq!(rows_second, rows_first);
}

#[test]
fn extra_observations_are_folded_in() {
    let catalog = catalog();
    let policy = Policy::default();
    let extra = vec![optprobe::observation::Observation::new("Z", BaseState::new(["X"])).with_engine_added(["X"])];

    let mut oracle = ScriptedOracle::default();
    let engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), fast());
    let rows = Analyzer::new(
        &catalog,
        &policy,
        vec!["F".to_string()],
        vec![BaseState::new(["X"])],
        engine,
        BddCounter::new(),
    )
    .with_extra_observations(extra)
    .run(&[1])
    .unwrap();

    // Z -> X contradicts "at most one of the family", so Z is dead.
    assert_eq!(rows[0].unique_rules, 2);
    assert_eq!(rows[0].count, BigUint::from(2u32));
}

#[test]
fn missing_seeds_are_fatal() {
    let catalog = catalog();
    let policy = Policy::default();
    let mut oracle = ScriptedOracle::default();
    let engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), fast());
    let result = Analyzer::new(&catalog, &policy, vec!["F".to_string()], Vec::new(), engine, BddCounter::new()).run(&[1]);
    assert!(matches!(result, Err(optprobe::Error::NoSeeds)));
    assert_eq!(oracle.calls, 0);
}
