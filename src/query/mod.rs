//! Ranking items against a term query on the command line.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;

use crate::annotations::AssociationContainer;
use crate::calc::{ModelVariant, Options};
use crate::common::trace_rss_now;
use crate::err::AppError;
use crate::ontology::{obo, TermId};
use crate::server::{Engine, QueryError};
use crate::sim::{self, ItemSimilarity, ScoreDistributions, SimOptions, TermSim};

/// Command line arguments for the `query` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Rank items against a set of query terms", long_about = None)]
pub struct Args {
    /// Path to the OBO file with the ontology definition.
    #[arg(long, required = true)]
    pub path_obo: String,
    /// Path to the TSV file with item name, term id, and optional
    /// frequency columns.
    #[arg(long, required = true)]
    pub path_annotations: String,

    /// Query term identifiers (comma separated).
    #[arg(long, required = true, value_delimiter = ',')]
    pub terms: Vec<String>,
    /// Number of top-ranked items to print.
    #[arg(long, default_value_t = 10)]
    pub top_k: usize,

    /// Ignore annotation frequencies during scoring.
    #[arg(long, default_value_t = false)]
    pub ignore_frequencies: bool,
    /// Only consider items that have at least one annotation with an
    /// explicit frequency.
    #[arg(long, default_value_t = false)]
    pub consider_frequencies_only: bool,
    /// Maximal number of explicit-frequency terms per item treated as
    /// variable.
    #[arg(long, default_value_t = 10)]
    pub max_frequency_terms: usize,

    /// Number of threads to use for scoring (default is 1 thread per
    /// core).
    #[arg(long)]
    pub num_threads: Option<usize>,

    /// Rank by a classical similarity measure with empirical p-values
    /// instead of the Bayesian model.
    #[arg(long, value_enum)]
    pub measure: Option<TermSim>,
    /// Path of the persisted score-distribution cache to load (only
    /// used with `--measure`; incompatible caches are recomputed).
    #[arg(long)]
    pub path_score_distribution: Option<PathBuf>,
    /// Number of random queries per empirical score distribution (only
    /// used with `--measure`).
    #[arg(long, default_value_t = 250_000)]
    pub num_simulations: usize,
}

/// Main entry point for the `query` sub command.
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

    let options = Options {
        model: ModelVariant {
            respect_frequencies: !args.ignore_frequencies,
            ..Default::default()
        },
        consider_frequencies_only: args.consider_frequencies_only,
        max_frequency_terms: args.max_frequency_terms,
        num_threads: args.num_threads,
        ..Default::default()
    };

    info!("Setting up the engine...");
    let before_setup = Instant::now();
    let engine = Engine::new(terms, &associations, options)
        .map_err(|e| AppError::Input(e.into()))?;
    info!("...done setting up in {:?}", before_setup.elapsed());

    trace_rss_now();

    let mut query = Vec::with_capacity(args.terms.len());
    for raw in &args.terms {
        let sorted_id = engine
            .id_of_term_id(&TermId::from(raw.as_str()))
            .ok_or_else(|| AppError::Input(anyhow::anyhow!("unknown query term {}", raw)))?;
        query.push(sorted_id);
    }

    if let Some(measure) = args.measure {
        return run_similarity(args, &engine, &query, measure);
    }

    info!("Scoring {} items...", engine.number_of_items());
    let before_scoring = Instant::now();
    let ranking = engine.score(&query).map_err(|e| match &e {
        QueryError::Score(_) => AppError::Internal(e.clone().into()),
        _ => AppError::Input(e.clone().into()),
    })?;
    info!("...done scoring in {:?}", before_scoring.elapsed());

    for (rank, entry) in ranking.iter().take(args.top_k).enumerate() {
        println!(
            "{}\t{:.6}\t{}",
            rank + 1,
            entry.score,
            engine.item_name(entry.item)
        );
    }

    Ok(())
}

/// Rank by similarity score and empirical p-value instead of the
/// Bayesian model.
fn run_similarity(
    args: &Args,
    engine: &Engine,
    query: &[usize],
    measure: TermSim,
) -> Result<(), AppError> {
    let observations = engine
        .observations(query)
        .map_err(|e| AppError::Input(e.clone().into()))?;

    let boqa = engine.boqa();
    let mut similarity = ItemSimilarity::new(boqa, measure);
    similarity.precalculate_item_maxes();
    let distributions = ScoreDistributions::new(
        boqa,
        SimOptions {
            size_of_score_distribution: args.num_simulations,
            path_score_distribution: args.path_score_distribution.clone(),
            ..Default::default()
        },
    );

    info!(
        "Scoring {} items with {}...",
        engine.number_of_items(),
        measure.name()
    );
    let before_scoring = Instant::now();
    let result = sim::rank(&similarity, &distributions, &observations);
    info!("...done scoring in {:?}", before_scoring.elapsed());

    let mut ranking: Vec<usize> = (0..result.scores.len()).collect();
    ranking.sort_by(|&a, &b| {
        result.p_values[a]
            .total_cmp(&result.p_values[b])
            .then(result.scores[b].total_cmp(&result.scores[a]))
            .then(a.cmp(&b))
    });

    for (rank, &item) in ranking.iter().take(args.top_k).enumerate() {
        println!(
            "{}\t{:.6}\t{:.6}\t{}",
            rank + 1,
            result.p_values[item],
            result.scores[item],
            engine.item_name(item)
        );
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::{Args, run};
    use crate::err::AppError;

    static OBO: &str = "\
format-version: 1.2

[Term]
id: T:0000001
name: root

[Term]
id: T:0000002
name: middle
is_a: T:0000001

[Term]
id: T:0000003
name: leaf
is_a: T:0000002
";

    static ANNOTATIONS: &str = "\
I0\tT:0000003\t50%
I1\tT:0000002
";

    fn write_inputs(dir: &std::path::Path) -> Result<(String, String), anyhow::Error> {
        let path_obo = dir.join("small.obo");
        let path_annotations = dir.join("annotations.tsv");
        std::fs::File::create(&path_obo)?.write_all(OBO.as_bytes())?;
        std::fs::File::create(&path_annotations)?.write_all(ANNOTATIONS.as_bytes())?;
        Ok((
            path_obo.to_string_lossy().to_string(),
            path_annotations.to_string_lossy().to_string(),
        ))
    }

    fn args(path_obo: String, path_annotations: String, terms: &[&str]) -> Args {
        Args {
            path_obo,
            path_annotations,
            terms: terms.iter().map(|s| s.to_string()).collect(),
            top_k: 10,
            ignore_frequencies: false,
            consider_frequencies_only: false,
            max_frequency_terms: 10,
            num_threads: Some(1),
            measure: None,
            path_score_distribution: None,
            num_simulations: 250_000,
        }
    }

    #[test]
    fn run_smoke() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let (path_obo, path_annotations) = write_inputs(&tmp_dir)?;

        let args = args(path_obo, path_annotations, &["T:0000003"]);
        run(&crate::common::Args::default(), &args).map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }

    #[test]
    fn run_with_similarity_measure_smoke() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let (path_obo, path_annotations) = write_inputs(&tmp_dir)?;

        let mut args = args(path_obo, path_annotations, &["T:0000003"]);
        args.measure = Some(crate::sim::TermSim::Resnik);
        args.num_simulations = 50;
        run(&crate::common::Args::default(), &args).map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }

    #[test]
    fn unknown_query_term_is_an_input_error() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let (path_obo, path_annotations) = write_inputs(&tmp_dir)?;

        let args = args(path_obo, path_annotations, &["T:9999999"]);
        let result = run(&crate::common::Args::default(), &args);
        assert!(matches!(result, Err(AppError::Input(_))));

        Ok(())
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let args = args(
            "/nonexistent/path.obo".to_string(),
            "/nonexistent/annotations.tsv".to_string(),
            &["T:0000003"],
        );
        let result = run(&crate::common::Args::default(), &args);
        assert!(matches!(result, Err(AppError::Input(_))));
    }
}
