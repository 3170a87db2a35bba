//! # optprobe: learning configurator rules from a feasibility oracle
//!
//! **`optprobe`** reverse-engineers the option rules of a product configurator.
//! The configurator is treated as a black box (the *oracle*): given a set of
//! selected options and one option to add, it reports which options the
//! engine switches on or off as a consequence. From many such answers the
//! crate learns implication and exclusion edges, compiles them together with
//! the catalog's family structure into a CNF formula, and counts the feasible
//! configurations.
//!
//! ## Pipeline
//!
//! ```text
//! catalog ─► sampler ─► base states ─► probe engine ─► observations
//!                                          │  ▲
//!                                          ▼  │
//!                                       probe cache
//!
//! observations ─► rule set ─► model builder ─► CNF ─► model counter
//! ```
//!
//! The [`convergence`] module drives the pipeline at growing sampling
//! budgets and reports how the model count evolves.
//!
//! ## Basic Usage
//!
//! ```rust
//! use optprobe::catalog::{Catalog, OptionInfo};
//! use optprobe::counter::{BddCounter, ModelCounter};
//! use optprobe::model::ModelBuilder;
//! use optprobe::policy::Policy;
//! use optprobe::rules::{RuleKind, RuleSet};
//!
//! let catalog: Catalog = [("X", true), ("Y", false), ("Z", false)]
//!     .into_iter()
//!     .map(|(id, is_standard)| OptionInfo {
//!         id: id.to_string(),
//!         family: "Wheels".to_string(),
//!         is_standard,
//!         is_selected: false,
//!         equipment_type: "option".to_string(),
//!     })
//!     .collect();
//!
//! // Adding Y was observed to remove Z.
//! let mut rules = RuleSet::new();
//! rules.insert(RuleKind::Excludes, "Y", "Z");
//!
//! let policy = Policy::permissive();
//! let built = ModelBuilder::new(&catalog, &policy).build(&rules);
//! assert_eq!(built.model.num_vars, 3);
//! assert_eq!(built.required_families, ["Wheels"]);
//!
//! let count = BddCounter::new().count(&built.model).unwrap();
//! assert_eq!(count, num_bigint::BigUint::from(3u32));
//! ```
//!
//! ## Core Components
//!
//! - **[`catalog`]**, **[`policy`]**: the option list and the filtering rules applied to it.
//! - **[`sampler`]**: chooses the base states to probe.
//! - **[`probe`]**, **[`oracle`]**: queries the oracle, with a persistent cache.
//! - **[`rules`]**: folds observations into implication/exclusion edges.
//! - **[`model`]**: compiles catalog and rules into DIMACS CNF.
//! - **[`counter`]**: exact model counting.
//! - **[`convergence`]**: budget sweeps and convergence tables.
//! - **[`pool`]**: decoder for the oracle's pooled-reference JSON.

pub mod catalog;
pub mod convergence;
pub mod counter;
pub mod error;
pub mod io;
pub mod model;
pub mod observation;
pub mod oracle;
pub mod policy;
pub mod pool;
pub mod probe;
pub mod rules;
pub mod sampler;
pub mod state;

pub use error::{Error, Result};
