//! Classical semantic similarity measures (Resnik, Lin, Jiang-Conrath)
//! and the empirical score distributions used to turn similarity scores
//! into p-values.
//!
//! These paths reuse the engine's precomputed arrays but are independent
//! of the Bayesian scoring itself.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rayon::prelude::*;

use crate::calc::observations::Observations;
use crate::calc::util::sparse_from_dense;
use crate::calc::Boqa;
use crate::common::{open_read_maybe_gz, open_write_maybe_gz};
use crate::ontology::SlimOntology;

pub mod distribution;

use distribution::ApproximatedEmpiricalDistribution;

/// Term-to-term similarity measure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum TermSim {
    Resnik,
    Lin,
    JiangConrath,
}

impl TermSim {
    /// Short name of the measure, used e.g. in cache file names.
    pub fn name(&self) -> &'static str {
        match self {
            TermSim::Resnik => "resnik",
            TermSim::Lin => "lin",
            TermSim::JiangConrath => "jc",
        }
    }
}

impl std::fmt::Display for TermSim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Options for the similarity paths.
#[derive(Clone, Debug)]
pub struct SimOptions {
    /// Number of random queries per empirical score distribution.
    pub size_of_score_distribution: usize,
    /// Number of bins of the approximated distributions.
    pub number_of_bins: usize,
    /// Maximal query size for which distributions are cached; larger
    /// queries are clamped.
    pub max_query_size: usize,
    /// Reject random queries in which one term is an ancestor or
    /// descendant of another.
    pub forbid_illegal_queries: bool,
    /// Seed for the random query generation.
    pub seed: u64,
    /// Path of the persisted score-distribution artefact, if any.
    pub path_score_distribution: Option<PathBuf>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            size_of_score_distribution: 250_000,
            number_of_bins: 10_000,
            max_query_size: 20,
            forbid_illegal_queries: true,
            seed: 9,
            path_score_distribution: None,
        }
    }
}

/// Similarity scoring of term lists against items.
///
/// The optional per-item max cache trades memory for a large speedup of
/// the random-query scoring.
pub struct ItemSimilarity<'a> {
    boqa: &'a Boqa,
    measure: TermSim,
    /// Per item and term, the best similarity of the term against the
    /// item's direct terms.
    max_score_for_item: Option<Vec<Vec<f64>>>,
}

impl<'a> ItemSimilarity<'a> {
    pub fn new(boqa: &'a Boqa, measure: TermSim) -> Self {
        Self {
            boqa,
            measure,
            max_score_for_item: None,
        }
    }

    pub fn boqa(&self) -> &Boqa {
        self.boqa
    }

    pub fn measure(&self) -> TermSim {
        self.measure
    }

    /// A common ancestor of `t1` and `t2` with maximal information
    /// content, or `None` if the terms share no ancestor.  A term
    /// counts as its own ancestor here.
    fn common_ancestor_with_max_ic(&self, t1: usize, t2: usize) -> Option<usize> {
        if t1 == t2 {
            return Some(t1);
        }

        let slim = self.boqa.slim();
        let a = with_self(slim.ancestors_of(t1), t1);
        let b = with_self(slim.ancestors_of(t2), t2);

        let mut best: Option<usize> = None;
        let mut best_ic = f64::NEG_INFINITY;
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let ic = self.boqa.ic(a[i]);
                    if ic > best_ic {
                        best_ic = ic;
                        best = Some(a[i]);
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        best
    }

    /// Similarity of two single terms under the configured measure.
    pub fn term_sim(&self, t1: usize, t2: usize) -> f64 {
        let Some(mica) = self.common_ancestor_with_max_ic(t1, t2) else {
            return 0.0;
        };
        let boqa = self.boqa;
        match self.measure {
            TermSim::Resnik => boqa.ic(mica),
            TermSim::Lin => {
                // The similarity of terms with information content of
                // zero is defined as one.
                let nominator = 2.0 * boqa.ic(mica);
                let denominator = boqa.ic(t1) + boqa.ic(t2);
                if nominator <= 0.0 && denominator <= 0.0 {
                    1.0
                } else {
                    nominator / denominator
                }
            }
            TermSim::JiangConrath => {
                1.0 / (1.0 + boqa.ic(t1) + boqa.ic(t2) - 2.0 * boqa.ic(mica))
            }
        }
    }

    /// Max-avg-of-best score of a term list against another.
    pub fn score_max_avg(&self, tl1: &[usize], tl2: &[usize]) -> f64 {
        if tl1.is_empty() {
            return 0.0;
        }

        let mut total = 0.0;
        for &t1 in tl1 {
            let best = tl2
                .iter()
                .map(|&t2| self.term_sim(t1, t2))
                .fold(f64::NEG_INFINITY, f64::max);
            if best > f64::NEG_INFINITY {
                total += best;
            }
        }
        total / tl1.len() as f64
    }

    /// Max-avg-of-best score of a term list against the item's direct
    /// annotations, using the per-item cache when available.
    pub fn score_vs_item(&self, tl1: &[usize], item: usize) -> f64 {
        if let Some(cache) = &self.max_score_for_item {
            if tl1.is_empty() {
                return 0.0;
            }
            let row = &cache[item];
            return tl1.iter().map(|&t| row[t]).sum::<f64>() / tl1.len() as f64;
        }

        self.score_max_avg(tl1, self.boqa.table().direct_terms(item))
    }

    /// Precompute, per item, the best similarity of every term against
    /// the item's direct annotations.
    pub fn precalculate_item_maxes(&mut self) {
        tracing::info!("calculating item maxes for {}", self.measure.name());
        let this: &Self = self;
        let boqa = this.boqa;
        let num_terms = boqa.slim().number_of_vertices();
        let rows: Vec<Vec<f64>> = (0..boqa.number_of_items())
            .into_par_iter()
            .map(|item| {
                let direct = boqa.table().direct_terms(item);
                (0..num_terms)
                    .map(|t| this.score_max_avg(&[t], direct))
                    .collect()
            })
            .collect();
        self.max_score_for_item = Some(rows);
        tracing::info!("calculated item maxes");
    }
}

/// The sorted list of ancestors with the term itself merged in.
fn with_self(ancestors: &[usize], t: usize) -> Vec<usize> {
    let mut result = Vec::with_capacity(ancestors.len() + 1);
    let position = ancestors.partition_point(|&a| a < t);
    result.extend_from_slice(&ancestors[..position]);
    result.push(t);
    result.extend_from_slice(&ancestors[position..]);
    result
}

/// Minimal subset of the given terms with the same ancestor closure:
/// the terms that have no strict descendant among the others.
pub fn most_specific_terms(slim: &SlimOntology, terms: &[usize]) -> Vec<usize> {
    terms
        .iter()
        .copied()
        .filter(|&t| !terms.iter().any(|&s| s != t && slim.is_descendant(s, t)))
        .collect()
}

/// Move `size` randomly selected entries of `storage` towards its end
/// and write them to `chosen`.  `storage` is permuted by the call so it
/// can be reused for the next draw.
fn choose(rng: &mut fastrand::Rng, size: usize, chosen: &mut [usize], storage: &mut [usize]) {
    for k in 0..size {
        let index = rng.usize(0..storage.len() - k);
        let term = storage[index];
        storage[index] = storage[storage.len() - k - 1];
        storage[storage.len() - k - 1] = term;
        chosen[k] = term;
    }
}

/// Draw a random query of `size` terms.  With `forbid_illegal`, queries
/// in which one term is an ancestor or descendant of another are
/// redrawn.
pub fn choose_terms(
    slim: &SlimOntology,
    rng: &mut fastrand::Rng,
    size: usize,
    chosen: &mut [usize],
    storage: &mut [usize],
    forbid_illegal: bool,
) {
    if !forbid_illegal {
        choose(rng, size, chosen, storage);
        return;
    }

    loop {
        choose(rng, size, chosen, storage);
        let valid = !chosen.iter().enumerate().any(|(i, &a)| {
            chosen
                .iter()
                .enumerate()
                .any(|(j, &b)| i != j && slim.is_descendant(a, b))
        });
        if valid {
            return;
        }
    }
}

/// Persisted form of the score distributions, keyed by a fingerprint of
/// the data they were computed for.
#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedScoreDistributions {
    fingerprint: u64,
    distributions: Vec<Option<ApproximatedEmpiricalDistribution>>,
}

/// Fingerprint over all item names, term identifiers, term names, the
/// distribution size, and the maximal cached query size.  Artefacts
/// with a different fingerprint are silently recomputed.
fn fingerprint(boqa: &Boqa, options: &SimOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    for item in 0..boqa.number_of_items() {
        boqa.table().item_name(item).hash(&mut hasher);
    }
    for t in 0..boqa.slim().number_of_vertices() {
        let term = boqa.slim().term_at_index(t);
        term.id.as_str().hash(&mut hasher);
        term.name.hash(&mut hasher);
    }
    options.size_of_score_distribution.hash(&mut hasher);
    options.max_query_size.hash(&mut hasher);
    hasher.finish()
}

/// Cache of random queries and per-item empirical score distributions.
///
/// Both caches follow a reader/writer discipline: lookups take the read
/// lock only, distribution computation happens outside any lock, and
/// the write lock re-checks before inserting.
pub struct ScoreDistributions {
    options: SimOptions,
    fingerprint: u64,
    /// One slot per query size `0..=max_query_size`.
    query_cache: RwLock<Vec<Option<Arc<Vec<Vec<usize>>>>>>,
    /// One slot per `(item, query size)` pair.
    distributions: RwLock<Vec<Option<Arc<ApproximatedEmpiricalDistribution>>>>,
}

impl ScoreDistributions {
    /// Create the caches, loading the persisted artefact if configured
    /// and compatible.
    pub fn new(boqa: &Boqa, options: SimOptions) -> Self {
        let fingerprint = fingerprint(boqa, &options);
        let slots = boqa.number_of_items() * (options.max_query_size + 1);

        let distributions = options
            .path_score_distribution
            .as_ref()
            .and_then(|path| try_load(path, fingerprint, slots))
            .unwrap_or_else(|| vec![None; slots]);

        Self {
            query_cache: RwLock::new(vec![None; options.max_query_size + 1]),
            distributions: RwLock::new(distributions),
            options,
            fingerprint,
        }
    }

    pub fn options(&self) -> &SimOptions {
        &self.options
    }

    fn slot(&self, item: usize, query_size: usize) -> usize {
        item * (self.options.max_query_size + 1) + query_size
    }

    /// The cached random queries of the given size, generating them on
    /// first use.
    fn randomized_queries(&self, boqa: &Boqa, query_size: usize) -> Arc<Vec<Vec<usize>>> {
        let query_size = query_size.min(self.options.max_query_size);

        {
            let cache = self.query_cache.read().expect("lock is not poisoned");
            if let Some(queries) = &cache[query_size] {
                return queries.clone();
            }
        }

        let mut cache = self.query_cache.write().expect("lock is not poisoned");
        if let Some(queries) = &cache[query_size] {
            return queries.clone();
        }

        let slim = boqa.slim();
        let mut rng = fastrand::Rng::with_seed(
            self.options
                .seed
                .wrapping_add((query_size as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)),
        );
        let mut storage: Vec<usize> = (0..slim.number_of_vertices()).collect();
        let mut queries = Vec::with_capacity(self.options.size_of_score_distribution);
        for _ in 0..self.options.size_of_score_distribution {
            let mut chosen = vec![0usize; query_size];
            choose_terms(
                slim,
                &mut rng,
                query_size,
                &mut chosen,
                &mut storage,
                self.options.forbid_illegal_queries,
            );
            queries.push(chosen);
        }

        let queries = Arc::new(queries);
        cache[query_size] = Some(queries.clone());
        queries
    }

    /// The empirical score distribution of random queries of the given
    /// size against the item, computing it on first use.
    pub fn distribution_for(
        &self,
        similarity: &ItemSimilarity,
        item: usize,
        query_size: usize,
    ) -> Arc<ApproximatedEmpiricalDistribution> {
        let query_size = query_size.min(self.options.max_query_size);
        let slot = self.slot(item, query_size);

        {
            let read = self.distributions.read().expect("lock is not poisoned");
            if let Some(distribution) = &read[slot] {
                return distribution.clone();
            }
        }

        // Compute outside of any lock; concurrent computations of the
        // same slot are possible but harmless.
        let queries = self.randomized_queries(similarity.boqa(), query_size);
        let scores: Vec<f64> = queries
            .iter()
            .map(|query| similarity.score_vs_item(query, item))
            .collect();
        let distribution =
            ApproximatedEmpiricalDistribution::new(&scores, self.options.number_of_bins);

        let mut write = self.distributions.write().expect("lock is not poisoned");
        if let Some(existing) = &write[slot] {
            return existing.clone();
        }
        let distribution = Arc::new(distribution);
        write[slot] = Some(distribution.clone());
        distribution
    }

    /// Precompute all distributions, in parallel over items, and store
    /// the artefact if a path is configured.
    pub fn precalculate(&self, similarity: &ItemSimilarity) -> Result<(), anyhow::Error> {
        tracing::info!(
            "precalculating score distribution for {}",
            similarity.measure().name()
        );
        let max_query_size = self
            .options
            .max_query_size
            .min(similarity.boqa().slim().number_of_vertices());
        (0..similarity.boqa().number_of_items())
            .into_par_iter()
            .for_each(|item| {
                for query_size in 1..=max_query_size {
                    let _ = self.distribution_for(similarity, item, query_size);
                }
            });
        tracing::info!("score distribution has been precalculated");

        if let Some(path) = &self.options.path_score_distribution {
            self.store(path)?;
            tracing::info!("score distribution written to {:?}", path);
        }
        Ok(())
    }

    /// Write the current distributions to the given path as gzipped
    /// JSON, prefixed by the fingerprint.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let read = self.distributions.read().expect("lock is not poisoned");
        let persisted = PersistedScoreDistributions {
            fingerprint: self.fingerprint,
            distributions: read
                .iter()
                .map(|slot| slot.as_ref().map(|arc| (**arc).clone()))
                .collect(),
        };
        let writer = open_write_maybe_gz(path)?;
        serde_json::to_writer(writer, &persisted)?;
        Ok(())
    }
}

/// Load distributions from the given path; `None` (silent recompute) on
/// a missing file, a parse error, a slot-count mismatch, or a
/// fingerprint mismatch.
fn try_load<P: AsRef<Path>>(
    path: P,
    expected_fingerprint: u64,
    expected_slots: usize,
) -> Option<Vec<Option<Arc<ApproximatedEmpiricalDistribution>>>> {
    let reader = open_read_maybe_gz(&path).ok()?;
    let persisted: PersistedScoreDistributions = serde_json::from_reader(reader).ok()?;
    if persisted.fingerprint != expected_fingerprint
        || persisted.distributions.len() != expected_slots
    {
        tracing::info!(
            "score distribution at {:?} does not match the current data, recomputing",
            path.as_ref()
        );
        return None;
    }
    tracing::info!("score distribution loaded from {:?}", path.as_ref());
    Some(
        persisted
            .distributions
            .into_iter()
            .map(|distribution| distribution.map(Arc::new))
            .collect(),
    )
}

/// Result of a similarity ranking.
#[derive(Clone, Debug)]
pub struct SimResult {
    /// Raw max-avg similarity score per item.
    pub scores: Vec<f64>,
    /// Upper-tail p-value of the score per item.
    pub p_values: Vec<f64>,
}

/// Rank all items against the observations: the observed terms are
/// reduced to their most specific representatives, scored against every
/// item, and the scores are turned into p-values via the empirical
/// distributions.
pub fn rank(
    similarity: &ItemSimilarity,
    distributions: &ScoreDistributions,
    observations: &Observations,
) -> SimResult {
    let boqa = similarity.boqa();
    let observed = most_specific_terms(boqa.slim(), &sparse_from_dense(observations.as_slice()));
    let query_size = observed.len().min(distributions.options().max_query_size);

    let mut scores = Vec::with_capacity(boqa.number_of_items());
    let mut p_values = Vec::with_capacity(boqa.number_of_items());
    for item in 0..boqa.number_of_items() {
        let score = similarity.score_vs_item(&observed, item);
        let distribution = distributions.distribution_for(similarity, item, query_size);
        scores.push(score);
        p_values.push(distribution.p_upper(score));
    }

    SimResult { scores, p_values }
}
