//! Precomputing the empirical score distributions used by the
//! similarity measures to assign p-values.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;

use crate::annotations::AssociationContainer;
use crate::calc::{Boqa, Options};
use crate::common::trace_rss_now;
use crate::err::AppError;
use crate::ontology::obo;
use crate::sim::{ItemSimilarity, ScoreDistributions, SimOptions, TermSim};

/// Command line arguments for the `precompute` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Precompute score distributions for `query --measure`", long_about = None)]
pub struct Args {
    /// Path to the OBO file with the ontology definition.
    #[arg(long, required = true)]
    pub path_obo: String,
    /// Path to the TSV file with item name, term id, and optional
    /// frequency columns.
    #[arg(long, required = true)]
    pub path_annotations: String,
    /// Path of the output score-distribution artefact; a `.gz` suffix
    /// enables gzip compression.
    #[arg(long, required = true)]
    pub path_out_score_distribution: PathBuf,

    /// The similarity measure to precompute distributions for.
    #[arg(long, value_enum, default_value_t = TermSim::Resnik)]
    pub measure: TermSim,

    /// Number of random queries to simulate per item and query size.
    #[arg(long, default_value_t = 250_000, value_parser = clap::value_parser!(u64).range(2..))]
    pub num_simulations: u64,
    /// Maximal query size to precompute distributions for.
    #[arg(long, default_value_t = 20)]
    pub max_query_size: usize,
    /// Number of bins of the approximated distributions.
    #[arg(long, default_value_t = 10_000)]
    pub number_of_bins: usize,

    /// Number of threads to use for simulation (default is 1 thread per
    /// core).
    #[arg(long)]
    pub num_threads: Option<usize>,
    /// Seed for the random query generation.
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Main entry point for the `precompute` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), AppError> {
    info!("args_common = {:?}", &args_common);
    info!("args = {:?}", &args);

    if let Some(level) = args_common.verbose.log_level() {
        match level {
            log::Level::Trace | log::Level::Debug => {
                std::env::set_var("RUST_LOG", "debug");
                env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
            }
            _ => (),
        }
    }

    if let Some(num_threads) = args.num_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("building thread pool failed: {}", e))
            })?;
    }

    info!("Loading ontology...");
    let before_loading = Instant::now();
    let terms = obo::read_obo_file(&args.path_obo).map_err(AppError::Input)?;
    info!(
        "...done loading {} terms in {:?}",
        terms.len(),
        before_loading.elapsed()
    );

    info!("Loading annotations...");
    let before_loading = Instant::now();
    let associations =
        AssociationContainer::from_tsv_file(&args.path_annotations).map_err(AppError::Input)?;
    info!(
        "...done loading annotations of {} items in {:?}",
        associations.len(),
        before_loading.elapsed()
    );

    info!("Setting up the scoring core...");
    let before_setup = Instant::now();
    let boqa = Boqa::new(terms, &associations, Options::default())
        .map_err(|e| AppError::Input(e.into()))?;
    info!("...done setting up in {:?}", before_setup.elapsed());

    trace_rss_now();

    info!("Running simulations...");
    let before_simulations = Instant::now();
    let mut similarity = ItemSimilarity::new(&boqa, args.measure);
    similarity.precalculate_item_maxes();

    let distributions = ScoreDistributions::new(
        &boqa,
        SimOptions {
            size_of_score_distribution: args.num_simulations as usize,
            number_of_bins: args.number_of_bins,
            max_query_size: args.max_query_size,
            seed: args.seed.unwrap_or(9),
            path_score_distribution: Some(args.path_out_score_distribution.clone()),
            ..Default::default()
        },
    );
    distributions
        .precalculate(&similarity)
        .map_err(AppError::Internal)?;
    info!(
        "...done with simulations in {:?}",
        before_simulations.elapsed()
    );

    trace_rss_now();

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::{run, Args};
    use crate::sim::TermSim;

    static OBO: &str = "\
[Term]
id: T:0000001
name: root

[Term]
id: T:0000002
name: left
is_a: T:0000001

[Term]
id: T:0000003
name: right
is_a: T:0000001
";

    static ANNOTATIONS: &str = "\
I0\tT:0000002
I1\tT:0000003
";

    #[test]
    fn run_writes_artefact() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path_obo = tmp_dir.join("small.obo");
        let path_annotations = tmp_dir.join("annotations.tsv");
        let path_out = tmp_dir.join("scoreDistributions-resnik.json.gz");
        std::fs::File::create(&path_obo)?.write_all(OBO.as_bytes())?;
        std::fs::File::create(&path_annotations)?.write_all(ANNOTATIONS.as_bytes())?;

        let args = Args {
            path_obo: path_obo.to_string_lossy().to_string(),
            path_annotations: path_annotations.to_string_lossy().to_string(),
            path_out_score_distribution: path_out.clone(),
            measure: TermSim::Resnik,
            num_simulations: 50,
            max_query_size: 2,
            number_of_bins: 10,
            num_threads: None,
            seed: Some(1),
        };
        run(&crate::common::Args::default(), &args).map_err(|e| anyhow::anyhow!("{}", e))?;

        assert!(path_out.exists());

        Ok(())
    }
}
