//! Oracle probe engine and its persistent cache.
//!
//! Every probe is identified by `(base-state signature, added option)`. The
//! [`ProbeCache`] maps these keys to [`Observation`]s and is persisted as a
//! single JSON object:
//!
//! ```text
//! { "A.B.C|X": { "optionAdded": "X", "baseOptions": ["A", "B", "C"], ... }, ... }
//! ```
//!
//! The cache is loaded strictly: a key without the `|` separator, a value that
//! is not an observation, or a value that disagrees with its key aborts the
//! load. Writes go through a temporary file and a rename.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::io::{read_json, write_json};
use crate::observation::Observation;
use crate::oracle::Oracle;
use crate::policy::Policy;
use crate::state::BaseState;

/// Separator between the base-state signature and the option in cache keys.
pub const KEY_SEPARATOR: char = '|';

// ============================================================================
// Cache
// ============================================================================

/// Content-addressed memo table of probe results.
#[derive(Debug, Default)]
pub struct ProbeCache {
    path: Option<PathBuf>,
    entries: BTreeMap<(String, String), Observation>,
    dirty: bool,
}

impl ProbeCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the cache stored at `path`, or an empty one if the file does not
    /// exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut cache = Self {
            path: Some(path.clone()),
            ..Self::default()
        };
        if !path.exists() {
            log::info!("No probe cache at {}, starting empty", path.display());
            return Ok(cache);
        }

        let raw: Map<String, Value> = read_json(&path)?;
        for (key, value) in raw {
            let (signature, option) = split_key(&key)?;
            let obs: Observation = serde_json::from_value(value).map_err(|e| Error::MalformedCache {
                key: key.clone(),
                message: e.to_string(),
            })?;
            if obs.option_added != option || obs.base_options.signature() != signature {
                return Err(Error::MalformedCache {
                    key,
                    message: "observation does not match its key".to_string(),
                });
            }
            cache.entries.insert((signature.to_string(), option.to_string()), obs);
        }
        log::info!("Loaded {} cached probes from {}", cache.len(), path.display());
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, base: &BaseState, option: &str) -> Option<&Observation> {
        self.entries.get(&(base.signature(), option.to_string()))
    }

    pub fn contains(&self, base: &BaseState, option: &str) -> bool {
        self.get(base, option).is_some()
    }

    /// Stores an observation under its own key. An existing entry is kept.
    pub fn insert(&mut self, obs: Observation) -> bool {
        let key = (obs.base_options.signature(), obs.option_added.clone());
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, obs);
        self.dirty = true;
        true
    }

    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.entries.values()
    }

    /// Writes the cache to disk if it has a path and unsaved entries.
    pub fn persist(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        let map: BTreeMap<String, &Observation> = self
            .entries
            .iter()
            .map(|((signature, option), obs)| (format!("{}{}{}", signature, KEY_SEPARATOR, option), obs))
            .collect();
        write_json(path, &map)?;
        log::debug!("Persisted {} probes to {}", map.len(), path.display());
        self.dirty = false;
        Ok(())
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.rsplit_once(KEY_SEPARATOR) {
        Some((signature, option)) if !option.is_empty() => Ok((signature, option)),
        _ => Err(Error::MalformedCache {
            key: key.to_string(),
            message: format!("expected <base>{}<option>", KEY_SEPARATOR),
        }),
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Minimum time between two oracle requests.
    pub delay: Duration,
    /// Persist the cache after this many new probes (0: only at the end).
    pub flush_every: usize,
    /// Stop issuing new probes after this many (cache hits are unaffected).
    pub max_probes: Option<usize>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(200),
            flush_every: 50,
            max_probes: None,
        }
    }
}

impl ProbeConfig {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_flush_every(mut self, n: usize) -> Self {
        self.flush_every = n;
        self
    }

    pub fn with_max_probes(mut self, max: Option<usize>) -> Self {
        self.max_probes = max;
        self
    }
}

/// Counters for one [`ProbeEngine::probe_states`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    /// Pairs answered, from cache or oracle.
    pub pairs: usize,
    pub cache_hits: usize,
    /// New oracle answers.
    pub probed: usize,
    /// Oracle errors; these pairs stay unprobed.
    pub failed: usize,
    /// Pairs left out because `max_probes` was reached.
    pub deferred: usize,
}

/// Spaces out oracle requests by at least `delay`.
#[derive(Debug)]
struct Throttle {
    delay: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

pub struct ProbeEngine<O> {
    oracle: O,
    cache: ProbeCache,
    config: ProbeConfig,
    throttle: Throttle,
    /// New probes issued over the engine's lifetime.
    issued: usize,
}

impl<O: Oracle> ProbeEngine<O> {
    pub fn new(oracle: O, cache: ProbeCache, config: ProbeConfig) -> Self {
        let throttle = Throttle::new(config.delay);
        Self {
            oracle,
            cache,
            config,
            throttle,
            issued: 0,
        }
    }

    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    pub fn into_cache(self) -> ProbeCache {
        self.cache
    }

    /// Options worth adding to a base state, in catalog order.
    pub fn candidates(catalog: &Catalog, policy: &Policy) -> Vec<String> {
        catalog
            .iter()
            .filter(|o| policy.is_candidate(o))
            .map(|o| o.id.clone())
            .collect()
    }

    /// Probes one pair, answering from the cache when possible.
    ///
    /// Returns `Ok(None)` when the oracle failed; the failure is logged.
    pub fn probe(&mut self, base: &BaseState, option: &str) -> Result<Option<Observation>> {
        let mut stats = ProbeStats::default();
        let obs = self.probe_pair(base, option, &mut stats)?;
        self.cache.persist()?;
        Ok(obs)
    }

    /// Probes every candidate not already in each base state.
    ///
    /// The cache is fully persisted before this returns.
    pub fn probe_states(&mut self, states: &[BaseState], candidates: &[String]) -> Result<(Vec<Observation>, ProbeStats)> {
        let mut stats = ProbeStats::default();
        let mut observations = Vec::new();

        for (i, base) in states.iter().enumerate() {
            log::debug!("Probing base state {}/{} ({} options)", i + 1, states.len(), base.len());
            for option in candidates {
                if base.contains(option) {
                    continue;
                }
                if let Some(obs) = self.probe_pair(base, option, &mut stats)? {
                    observations.push(obs);
                }
            }
        }

        self.cache.persist()?;
        log::info!(
            "Probed {} pairs: {} cached, {} new, {} failed, {} deferred",
            stats.pairs,
            stats.cache_hits,
            stats.probed,
            stats.failed,
            stats.deferred
        );
        Ok((observations, stats))
    }

    fn probe_pair(&mut self, base: &BaseState, option: &str, stats: &mut ProbeStats) -> Result<Option<Observation>> {
        if let Some(obs) = self.cache.get(base, option) {
            stats.pairs += 1;
            stats.cache_hits += 1;
            return Ok(Some(obs.clone()));
        }
        if self.config.max_probes.is_some_and(|max| self.issued >= max) {
            stats.deferred += 1;
            return Ok(None);
        }

        self.throttle.wait();
        self.issued += 1;
        let reply = match self.oracle.query(option, base) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Probe {} on state of {} options failed: {}", option, base.len(), e);
                stats.failed += 1;
                return Ok(None);
            }
        };

        let obs = Observation {
            option_added: option.to_string(),
            base_options: base.clone(),
            engine_added_options: reply.engine_added_options,
            removed_options: reply.removed_options,
            user_added_options: reply.user_added_options,
            feasible_options: reply.feasible_options,
        };
        self.cache.insert(obs.clone());
        stats.pairs += 1;
        stats.probed += 1;

        if self.config.flush_every > 0 && stats.probed % self.config.flush_every == 0 {
            self.cache.persist()?;
        }
        Ok(Some(obs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleError, OracleReply};
    use test_log::test;

    /// Answers "adding X excludes every base member starting with X's first letter".
    #[derive(Default)]
    struct FamilyOracle {
        calls: usize,
        fail_on: Option<String>,
    }

    impl Oracle for FamilyOracle {
        fn query(&mut self, option_added: &str, base: &BaseState) -> Result<OracleReply, OracleError> {
            self.calls += 1;
            if self.fail_on.as_deref() == Some(option_added) {
                return Err(OracleError::Status(503));
            }
            let prefix = &option_added[..1];
            Ok(OracleReply {
                removed_options: base.members().iter().filter(|m| m.starts_with(prefix)).cloned().collect(),
                ..OracleReply::default()
            })
        }
    }

    fn config() -> ProbeConfig {
        ProbeConfig::default().with_delay(Duration::ZERO)
    }

    fn candidates() -> Vec<String> {
        ["A1", "A2", "B1", "B2"].map(String::from).to_vec()
    }

    #[test]
    fn test_second_run_hits_cache() {
        let mut oracle = FamilyOracle::default();
        let states = vec![BaseState::new(["A1", "B1"])];

        let mut engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), config());
        let (first, stats) = engine.probe_states(&states, &candidates()).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(stats.probed, 2);

        let (second, stats) = engine.probe_states(&states, &candidates()).unwrap();
        assert_eq!(second, first);
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.probed, 0);
        drop(engine);
        assert_eq!(oracle.calls, 2);
    }

    #[test]
    fn test_never_probes_members() {
        let mut oracle = FamilyOracle::default();
        let states = vec![BaseState::new(["A1", "A2", "B1", "B2"])];
        let mut engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), config());
        let (obs, stats) = engine.probe_states(&states, &candidates()).unwrap();
        assert!(obs.is_empty());
        assert_eq!(stats, ProbeStats::default());
        drop(engine);
        assert_eq!(oracle.calls, 0);
    }

    #[test]
    fn test_failure_is_skipped_and_retried_later() {
        let mut oracle = FamilyOracle {
            fail_on: Some("A2".to_string()),
            ..FamilyOracle::default()
        };
        let states = vec![BaseState::new(["A1", "B1"])];
        let mut engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), config());
        let (obs, stats) = engine.probe_states(&states, &candidates()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(stats.failed, 1);
        assert!(!engine.cache().contains(&states[0], "A2"));
        let cache = engine.into_cache();

        oracle.fail_on = None;
        let mut engine = ProbeEngine::new(&mut oracle, cache, config());
        let (obs, stats) = engine.probe_states(&states, &candidates()).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!((stats.cache_hits, stats.probed), (1, 1));
        assert_eq!(obs[0].removed_options, ["A1"]);
    }

    #[test]
    fn test_single_pair_is_cached_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe_cache.json");
        let base = BaseState::new(["A1", "B1"]);

        let mut oracle = FamilyOracle::default();
        let mut engine = ProbeEngine::new(&mut oracle, ProbeCache::open(&path).unwrap(), config());
        let obs = engine.probe(&base, "A2").unwrap().unwrap();
        assert_eq!(obs.removed_options, ["A1"]);
        assert_eq!(engine.probe(&base, "A2").unwrap(), Some(obs));
        drop(engine);
        assert_eq!(oracle.calls, 1);
        assert!(ProbeCache::open(&path).unwrap().contains(&base, "A2"));

        oracle.fail_on = Some("B2".to_string());
        let mut engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), config());
        assert_eq!(engine.probe(&base, "B2").unwrap(), None);
    }

    #[test]
    fn test_max_probes_defers() {
        let mut oracle = FamilyOracle::default();
        let states = vec![BaseState::new(["C"])];
        let mut engine = ProbeEngine::new(&mut oracle, ProbeCache::in_memory(), config().with_max_probes(Some(3)));
        let (obs, stats) = engine.probe_states(&states, &candidates()).unwrap();
        assert_eq!(obs.len(), 3);
        assert_eq!(stats.deferred, 1);
    }

    #[test]
    fn test_cache_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe_cache.json");
        let states = vec![BaseState::new(["A1", "B1"]), BaseState::new(["A2", "B2"])];

        let mut oracle = FamilyOracle::default();
        let cache = ProbeCache::open(&path).unwrap();
        assert!(cache.is_empty());
        let mut engine = ProbeEngine::new(&mut oracle, cache, config().with_flush_every(1));
        engine.probe_states(&states, &candidates()).unwrap();
        drop(engine);
        assert_eq!(oracle.calls, 4);

        let raw: Map<String, Value> = read_json(&path).unwrap();
        assert!(raw.contains_key("A1.B1|A2"));

        let cache = ProbeCache::open(&path).unwrap();
        assert_eq!(cache.len(), 4);
        let mut fresh = FamilyOracle::default();
        let mut engine = ProbeEngine::new(&mut fresh, cache, config());
        let (obs, _) = engine.probe_states(&states, &candidates()).unwrap();
        assert_eq!(obs.len(), 4);
        drop(engine);
        assert_eq!(fresh.calls, 0);
    }

    #[test]
    fn test_malformed_cache_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe_cache.json");

        std::fs::write(&path, r#"{"no-separator": {"optionAdded": "X", "baseOptions": []}}"#).unwrap();
        assert!(matches!(ProbeCache::open(&path), Err(Error::MalformedCache { .. })));

        std::fs::write(&path, r#"{"A|X": {"optionAdded": 3}}"#).unwrap();
        assert!(matches!(ProbeCache::open(&path), Err(Error::MalformedCache { .. })));

        std::fs::write(&path, r#"{"A|X": {"optionAdded": "Y", "baseOptions": ["A"]}}"#).unwrap();
        assert!(matches!(ProbeCache::open(&path), Err(Error::MalformedCache { .. })));

        std::fs::write(&path, r#"{"A|X": {"optionAdded": "X", "baseOptions": ["A"]}}"#).unwrap();
        assert_eq!(ProbeCache::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_candidates_follow_policy() {
        let catalog: Catalog = [
            ("S", true, "option"),
            ("A", false, "option"),
            ("T", false, "tequipment"),
            ("0UB.89.24931", false, "option"),
        ]
        .into_iter()
        .map(|(id, is_standard, equipment_type)| crate::catalog::OptionInfo {
            id: id.to_string(),
            family: String::new(),
            is_standard,
            is_selected: false,
            equipment_type: equipment_type.to_string(),
        })
        .collect();
        let candidates = ProbeEngine::<FamilyOracle>::candidates(&catalog, &Policy::default());
        assert_eq!(candidates, ["A"]);
    }
}
