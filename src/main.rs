use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use simplelog::LevelFilter;

use optprobe::catalog::Catalog;
use optprobe::convergence::{is_converged, to_markdown, Analyzer, DEFAULT_SIZES};
use optprobe::counter::{BddCounter, ModelCounter};
use optprobe::io::{load_families, load_seeds, read_json, write_atomic, write_json};
use optprobe::model::{ConstraintModel, ModelBuilder};
use optprobe::observation::{load_observations, Observation};
use optprobe::oracle::{HttpOracle, HttpOracleConfig};
use optprobe::policy::Policy;
use optprobe::pool::decode_pool;
use optprobe::probe::{ProbeCache, ProbeConfig, ProbeEngine};
use optprobe::rules::{RuleKind, RuleSet};
use optprobe::sampler::{Sampler, SamplerConfig};
use optprobe::state::BaseState;

#[derive(Parser)]
#[command(author, version, about = "Learn configurator option rules and count feasible configurations")]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CatalogArgs {
    /// Option catalog (CSV)
    #[arg(long, value_name = "FILE", default_value = "data/options.csv")]
    catalog: PathBuf,

    /// Policy file (JSON); defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    policy: Option<PathBuf>,
}

impl CatalogArgs {
    fn load(&self) -> Result<(Catalog, Policy)> {
        let catalog = Catalog::load(&self.catalog)?;
        let policy = match &self.policy {
            Some(path) => Policy::load(path)?,
            None => Policy::default(),
        };
        log::info!("Loaded {} options from {}", catalog.len(), self.catalog.display());
        Ok((catalog, policy))
    }
}

#[derive(Args)]
struct SamplingArgs {
    /// Required families (JSON array)
    #[arg(long, value_name = "FILE", default_value = "data/required_families.json")]
    required: PathBuf,

    /// Seed states (JSON array of option-id arrays)
    #[arg(long, value_name = "FILE", default_value = "data/seeds.json")]
    seeds: PathBuf,

    /// Representatives per family
    #[arg(short, long, default_value_t = 3)]
    k: usize,
}

#[derive(Args)]
struct OracleArgs {
    /// Feasibility endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Delay between requests, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 200)]
    delay_ms: u64,

    /// Persist the cache after this many new probes (0: only at the end)
    #[arg(long, default_value_t = 50)]
    flush_every: usize,

    /// Stop issuing new probes after this many
    #[arg(long)]
    max_probes: Option<usize>,
}

impl OracleArgs {
    fn oracle(&self) -> Result<HttpOracle> {
        let mut config = HttpOracleConfig::default();
        if let Some(endpoint) = &self.endpoint {
            config = config.with_endpoint(endpoint.as_str());
        }
        Ok(HttpOracle::new(config)?)
    }

    fn probe_config(&self) -> ProbeConfig {
        ProbeConfig::default()
            .with_delay(Duration::from_millis(self.delay_ms))
            .with_flush_every(self.flush_every)
            .with_max_probes(self.max_probes)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate base states for one budget
    Sample {
        #[command(flatten)]
        catalog: CatalogArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Number of base states
        #[arg(short, long)]
        n: usize,

        /// Output file
        #[arg(short, long, value_name = "FILE", default_value = "data/base_states.json")]
        output: PathBuf,
    },

    /// Probe base states against the configurator
    Probe {
        #[command(flatten)]
        catalog: CatalogArgs,

        #[command(flatten)]
        oracle: OracleArgs,

        /// Base states (JSON array of option-id arrays)
        #[arg(long, value_name = "FILE", default_value = "data/base_states.json")]
        states: PathBuf,

        /// Probe cache
        #[arg(long, value_name = "FILE", default_value = "data/probe_cache.json")]
        cache: PathBuf,

        /// Output observations
        #[arg(short, long, value_name = "FILE", default_value = "data/constraints.json")]
        output: PathBuf,
    },

    /// Build the CNF model from observation files
    Build {
        #[command(flatten)]
        catalog: CatalogArgs,

        /// Observation files; missing files are skipped
        #[arg(long = "constraints", value_name = "FILE", num_args = 1.., default_value = "data/constraints.json")]
        constraints: Vec<PathBuf>,

        /// Output directory for model.cnf, varmap.json and required_families.json
        #[arg(long, value_name = "DIR", default_value = "data")]
        out_dir: PathBuf,
    },

    /// Count the models of a DIMACS CNF file
    Count {
        /// Input CNF
        #[arg(value_name = "FILE")]
        cnf: PathBuf,

        /// Give up after this many BDD nodes
        #[arg(long)]
        node_limit: Option<usize>,

        /// Also write the count to this file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Run the pipeline at several budgets and report convergence
    Converge {
        #[command(flatten)]
        catalog: CatalogArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        #[command(flatten)]
        oracle: OracleArgs,

        /// Budgets, in increasing order
        #[arg(long, num_args = 1.., default_values_t = DEFAULT_SIZES)]
        sizes: Vec<usize>,

        /// Extra observation files folded into every budget
        #[arg(long, value_name = "FILE", num_args = 0..)]
        extra: Vec<PathBuf>,

        /// Run directory
        #[arg(long, value_name = "DIR", default_value = "runs")]
        out_dir: PathBuf,

        /// Largest |delta log10| still considered converged
        #[arg(long, default_value_t = 0.01)]
        tolerance: f64,
    },

    /// Decode a pooled-reference JSON document
    Decode {
        /// Input JSON
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file; stdout when omitted
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    simplelog::TermLogger::init(
        cli.log_level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    match cli.command {
        Commands::Sample {
            catalog,
            sampling,
            n,
            output,
        } => {
            let (catalog, policy) = catalog.load()?;
            let required = load_families(&sampling.required)?;
            let seeds = load_seeds(&sampling.seeds)?;
            let sampler = Sampler::new(&catalog, &policy, SamplerConfig::default().with_representatives(sampling.k));
            let states = sampler.sample(&required, &seeds, n)?;
            write_json(&output, &states)?;
            println!("Wrote {} base states to {}", states.len(), output.display());
        }

        Commands::Probe {
            catalog,
            oracle,
            states,
            cache,
            output,
        } => {
            let (catalog, policy) = catalog.load()?;
            let states: Vec<BaseState> = read_json(&states)?;
            let candidates = ProbeEngine::<HttpOracle>::candidates(&catalog, &policy);
            log::info!("Probing {} states with {} candidates", states.len(), candidates.len());

            let cache = ProbeCache::open(&cache)?;
            let mut engine = ProbeEngine::new(oracle.oracle()?, cache, oracle.probe_config());
            let (observations, stats) = engine.probe_states(&states, &candidates)?;
            write_json(&output, &observations)?;

            let rules = RuleSet::from_observations(&observations);
            println!(
                "Pairs: {} ({} cached, {} new, {} failed, {} deferred)",
                stats.pairs, stats.cache_hits, stats.probed, stats.failed, stats.deferred
            );
            println!(
                "Rules: {} ({} implies, {} excludes)",
                rules.len(),
                rules.count(RuleKind::Implies),
                rules.count(RuleKind::Excludes)
            );
        }

        Commands::Build {
            catalog,
            constraints,
            out_dir,
        } => {
            let (catalog, policy) = catalog.load()?;
            let observations = load_all(&constraints)?;
            let rules = RuleSet::from_observations(&observations);
            let built = ModelBuilder::new(&catalog, &policy).build(&rules);
            built.write(
                &out_dir.join("model.cnf"),
                &out_dir.join("varmap.json"),
                &out_dir.join("required_families.json"),
            )?;
            println!("vars: {}, clauses: {}", built.model.num_vars, built.model.num_clauses());
            println!(
                "required families: {} written to {}",
                built.required_families.len(),
                out_dir.join("required_families.json").display()
            );
        }

        Commands::Count {
            cnf,
            node_limit,
            output,
        } => {
            let model = ConstraintModel::load_dimacs(&cnf)?;
            log::info!("Loaded {} vars, {} clauses", model.num_vars, model.num_clauses());
            let count = BddCounter::new().with_node_limit(node_limit).count(&model)?;
            if let Some(output) = output {
                write_atomic(&output, count.to_string().as_bytes())?;
            }
            println!("{}", count);
        }

        Commands::Converge {
            catalog,
            sampling,
            oracle,
            sizes,
            extra,
            out_dir,
            tolerance,
        } => {
            if sizes.windows(2).any(|w| w[0] >= w[1]) {
                bail!("Budgets must be strictly increasing: {:?}", sizes);
            }
            let (catalog, policy) = catalog.load()?;
            let required = load_families(&sampling.required)?;
            let seeds = load_seeds(&sampling.seeds)?;
            let extra = load_all(&extra)?;

            let cache = ProbeCache::open(out_dir.join("probe_cache.json"))?;
            let engine = ProbeEngine::new(oracle.oracle()?, cache, oracle.probe_config());
            let mut analyzer = Analyzer::new(&catalog, &policy, required, seeds, engine, BddCounter::new())
                .with_sampler_config(SamplerConfig::default().with_representatives(sampling.k))
                .with_extra_observations(extra)
                .with_output_dir(&out_dir);
            let rows = analyzer.run(&sizes)?;

            print!("{}", to_markdown(&rows));
            if is_converged(&rows, tolerance) {
                println!("Converged at N={}", rows.last().map_or(0, |r| r.budget));
            } else {
                println!("Not converged (tolerance {})", tolerance);
            }
        }

        Commands::Decode { input, output } => {
            let doc: serde_json::Value = read_json(&input)?;
            let decoded = decode_pool(&doc).wrap_err_with(|| format!("Failed to decode {}", input.display()))?;
            match output {
                Some(output) => write_json(&output, &decoded)?,
                None => println!("{}", serde_json::to_string_pretty(&decoded)?),
            }
        }
    }

    Ok(())
}

/// Reads and concatenates observation files, skipping missing ones.
fn load_all(paths: &[PathBuf]) -> Result<Vec<Observation>> {
    let mut all = Vec::new();
    for path in paths {
        if !path.exists() {
            log::warn!("Skipping missing observation file {}", path.display());
            continue;
        }
        let observations = load_observations(path)?;
        log::info!("Read {} observations from {}", observations.len(), path.display());
        all.extend(observations);
    }
    Ok(all)
}
