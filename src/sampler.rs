//! Base-state sampler.
//!
//! Chooses which configurations to probe. With a fixed budget `N` the
//! sampler emits, in order:
//!
//! 1. every seed state (observed real-world configurations);
//! 2. the *default* state: the longest seed, completed with the top
//!    representative of every required family it does not touch;
//! 3. *pairwise* variations: for every pair of required families, every
//!    combination of their representatives substituted into the default state;
//! 4. *single-family* variations of the default state;
//! 5. a deterministic cycle that moves every family at once, as a last resort.
//!
//! States are deduplicated by signature as they are produced, and the output
//! never exceeds `N`.

use std::collections::HashSet;

use crate::catalog::{Catalog, OptionInfo};
use crate::error::{Error, Result};
use crate::policy::Policy;
use crate::state::BaseState;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Number of representatives kept per family.
    pub representatives: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { representatives: 3 }
    }
}

impl SamplerConfig {
    pub fn with_representatives(mut self, k: usize) -> Self {
        self.representatives = k;
        self
    }
}

/// Eligible members and ranked representatives of one required family.
#[derive(Debug, Clone)]
struct FamilyInfo {
    name: String,
    /// Eligible members, sorted by id.
    members: Vec<String>,
    /// Top-ranked members, best first.
    representatives: Vec<String>,
}

pub struct Sampler<'a> {
    catalog: &'a Catalog,
    policy: &'a Policy,
    config: SamplerConfig,
}

impl<'a> Sampler<'a> {
    pub fn new(catalog: &'a Catalog, policy: &'a Policy, config: SamplerConfig) -> Self {
        Self { catalog, policy, config }
    }

    /// Eligible members of `family`, sorted by id.
    pub fn eligible_members(&self, family: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .catalog
            .family_members(family)
            .filter(|o| self.policy.is_eligible(o))
            .map(|o| o.id.clone())
            .collect();
        members.sort();
        members
    }

    /// Top `k` eligible members of `family`, ranked by
    /// `(is_selected, is_standard, id)` descending.
    pub fn representatives(&self, family: &str) -> Vec<String> {
        let mut ranked: Vec<&OptionInfo> = self
            .catalog
            .family_members(family)
            .filter(|o| self.policy.is_eligible(o))
            .collect();
        ranked.sort_by(|a, b| {
            (b.is_selected, b.is_standard, &b.id).cmp(&(a.is_selected, a.is_standard, &a.id))
        });
        ranked
            .into_iter()
            .take(self.config.representatives)
            .map(|o| o.id.clone())
            .collect()
    }

    fn families(&self, required: &[String]) -> Vec<FamilyInfo> {
        let mut seen = HashSet::new();
        let mut families = Vec::new();
        for name in required {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let representatives = self.representatives(name);
            if representatives.is_empty() {
                log::debug!("Family {} has no eligible members, skipping", name);
                continue;
            }
            families.push(FamilyInfo {
                name: name.clone(),
                members: self.eligible_members(name),
                representatives,
            });
        }
        families
    }

    /// The longest seed (first one on ties), completed with the top
    /// representative of each required family it does not touch.
    pub fn default_state(&self, seeds: &[BaseState], required: &[String]) -> Result<BaseState> {
        let families = self.families(required);
        self.default_state_for(seeds, &families)
    }

    fn default_state_for(&self, seeds: &[BaseState], families: &[FamilyInfo]) -> Result<BaseState> {
        let mut longest: Option<&BaseState> = None;
        for seed in seeds {
            if longest.map_or(true, |l| seed.len() > l.len()) {
                longest = Some(seed);
            }
        }
        let seed = longest.ok_or(Error::NoSeeds)?;

        let mut members: Vec<String> = seed.members().to_vec();
        for family in families {
            if !family.members.iter().any(|m| seed.contains(m)) {
                log::debug!("Default state: adding {} for family {}", family.representatives[0], family.name);
                members.push(family.representatives[0].clone());
            }
        }
        Ok(BaseState::new(members))
    }

    /// Produces at most `n` distinct base states.
    ///
    /// Fails with [`Error::NoSeeds`] if `seeds` is empty.
    pub fn sample(&self, required: &[String], seeds: &[BaseState], n: usize) -> Result<Vec<BaseState>> {
        let families = self.families(required);
        let default = self.default_state_for(seeds, &families)?;

        let mut out = Collector::new(n);
        for seed in seeds {
            out.push(seed.clone());
        }
        out.push(default.clone());

        // Pairwise coverage
        'pairs: for (i, fa) in families.iter().enumerate() {
            for fb in &families[i + 1..] {
                for ra in &fa.representatives {
                    for rb in &fb.representatives {
                        if out.is_full() {
                            break 'pairs;
                        }
                        let state = default
                            .replacing(fa.members.iter().map(String::as_str), ra)
                            .replacing(fb.members.iter().map(String::as_str), rb);
                        out.push(state);
                    }
                }
            }
        }
        log::debug!("After pairwise coverage: {} states", out.len());

        // Single-family variations
        'single: for family in &families {
            for r in &family.representatives {
                if out.is_full() {
                    break 'single;
                }
                out.push(default.replacing(family.members.iter().map(String::as_str), r));
            }
        }

        // Deterministic cycle: round r puts family j on representative r + j,
        // varying all families together.
        if !families.is_empty() {
            let depth = families.iter().map(|f| f.representatives.len()).max().unwrap_or(0);
            for round in 0..families.len() * depth {
                if out.is_full() {
                    break;
                }
                let state = families.iter().enumerate().fold(default.clone(), |state, (j, family)| {
                    let r = &family.representatives[(round + j) % family.representatives.len()];
                    state.replacing(family.members.iter().map(String::as_str), r)
                });
                out.push(state);
            }
        }

        log::info!("Sampled {} base states (budget {})", out.len(), n);
        Ok(out.into_states())
    }
}

/// Ordered, deduplicating, bounded list of states.
struct Collector {
    states: Vec<BaseState>,
    seen: HashSet<BaseState>,
    limit: usize,
}

impl Collector {
    fn new(limit: usize) -> Self {
        Self {
            states: Vec::new(),
            seen: HashSet::new(),
            limit,
        }
    }

    fn len(&self) -> usize {
        self.states.len()
    }

    fn is_full(&self) -> bool {
        self.states.len() >= self.limit
    }

    fn push(&mut self, state: BaseState) {
        if self.is_full() || self.seen.contains(&state) {
            return;
        }
        self.seen.insert(state.clone());
        self.states.push(state);
    }

    fn into_states(self) -> Vec<BaseState> {
        self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn opt(id: &str, family: &str, is_standard: bool, is_selected: bool) -> OptionInfo {
        OptionInfo {
            id: id.to_string(),
            family: family.to_string(),
            is_standard,
            is_selected,
            equipment_type: "option".to_string(),
        }
    }

    fn catalog() -> Catalog {
        [
            opt("A1", "A", true, false),
            opt("A2", "A", false, true),
            opt("A3", "A", false, false),
            opt("A4", "A", false, false),
            opt("B1", "B", true, true),
            opt("B2", "B", false, false),
            opt("C1", "C", false, false),
            opt("C2", "C", false, false),
            opt("D1", "D", false, false),
            opt("X", "", false, false),
        ]
        .into_iter()
        .collect()
    }

    fn required() -> Vec<String> {
        ["A", "B", "C", "D"].map(String::from).to_vec()
    }

    fn policy() -> Policy {
        Policy::permissive().with_banned(["D1"])
    }

    #[test]
    fn test_representatives_ranking() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        // selected beats standard, then id descending
        assert_eq!(sampler.representatives("A"), ["A2", "A1", "A4"]);
        assert_eq!(sampler.representatives("B"), ["B1", "B2"]);
        assert!(sampler.representatives("D").is_empty());

        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default().with_representatives(1));
        assert_eq!(sampler.representatives("A"), ["A2"]);
    }

    #[test]
    fn test_default_state() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["X"]), BaseState::new(["A3", "X"]), BaseState::new(["A1", "B2"])];
        let default = sampler.default_state(&seeds, &required()).unwrap();
        // first longest seed is {A3, X}; B and C get their top representatives
        assert_eq!(default, BaseState::new(["A3", "X", "B1", "C2"]));
    }

    #[test]
    fn test_missing_seeds_is_fatal() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        assert!(matches!(sampler.sample(&required(), &[], 10), Err(Error::NoSeeds)));
    }

    #[test]
    fn test_budget_and_uniqueness() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["A1", "B1", "C1"]), BaseState::new(["A2"])];
        for n in 0..40 {
            let states = sampler.sample(&required(), &seeds, n).unwrap();
            assert!(states.len() <= n);
            let unique: HashSet<_> = states.iter().collect();
            assert_eq!(unique.len(), states.len());
        }
    }

    #[test]
    fn test_contains_seeds_and_default() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["A1", "B1", "C1"]), BaseState::new(["A2"])];
        let default = sampler.default_state(&seeds, &required()).unwrap();
        let states = sampler.sample(&required(), &seeds, 20).unwrap();
        assert_eq!(states[0], seeds[0]);
        assert_eq!(states[1], seeds[1]);
        assert!(states.contains(&default));
    }

    #[test]
    fn test_pairwise_first() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["A1", "B1", "C1"])];
        let states = sampler.sample(&required(), &seeds, 4).unwrap();
        // seed == default; then (A,B) pairs in rank order: (A2,B1), (A2,B2), ...
        assert_eq!(
            states,
            vec![
                BaseState::new(["A1", "B1", "C1"]),
                BaseState::new(["A2", "B1", "C1"]),
                BaseState::new(["A2", "B2", "C1"]),
                BaseState::new(["A1", "B2", "C1"]),
            ]
        );
    }

    #[test]
    fn test_saturation_is_bounded() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["A1", "B1", "C1"])];
        let states = sampler.sample(&required(), &seeds, 1000).unwrap();
        // A(3) x B(2) + A(3) x C(2) + B(2) x C(2) distinct combinations at most
        assert!(states.len() < 1000);
        assert!(states.len() >= 3 * 2 * 2 / 2);
    }

    #[test]
    fn test_cycle_varies_all_families() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["A1", "B1", "C1"])];
        let states = sampler.sample(&required(), &seeds, 1000).unwrap();
        // Pairwise and single variations reach the 10 states that keep at
        // least one family at its default; the cycle adds the other 2.
        assert_eq!(states.len(), 3 * 2 * 2);
        assert_eq!(
            states[10..],
            [BaseState::new(["A2", "B2", "C2"]), BaseState::new(["A4", "B2", "C2"])]
        );
    }

    #[test]
    fn test_empty_required_yields_seeds() {
        let catalog = catalog();
        let policy = policy();
        let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default());
        let seeds = vec![BaseState::new(["A1"]), BaseState::new(["B1", "C1"]), BaseState::new(["A1"])];
        let states = sampler.sample(&[], &seeds, 10).unwrap();
        assert_eq!(states, vec![BaseState::new(["A1"]), BaseState::new(["B1", "C1"])]);
    }
}
