//! The Bayesian network scoring core.
//!
//! Given an ontology and frequency-annotated items, the engine computes
//! for every item the posterior probability that the item explains a
//! set of observed terms, marginalising over a grid of false-positive
//! and false-negative rates and over the hidden configurations implied
//! by annotation frequencies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::annotations::{AnnotationError, AnnotationTable, AssociationContainer};
use crate::ontology::{OntologyError, SlimOntology, Term};

pub mod cases;
pub mod diff;
pub mod observations;
pub mod subsets;
pub mod util;

use cases::{CaseCounts, NodeCase, WeightedCountsList};
use diff::DiffVectors;
use observations::Observations;
use util::log_add;

/// Which inheritance rules and frequency handling the model applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelVariant {
    /// False positives can be explained via inheritance: an observed
    /// child forces its ancestors to be observed.
    pub inherit_false_positives: bool,
    /// False negatives can be explained via inheritance: an unobserved
    /// parent forces its descendants to be unobserved.
    pub inherit_false_negatives: bool,
    /// Respect annotation frequencies when enumerating hidden
    /// configurations.
    pub respect_frequencies: bool,
}

impl Default for ModelVariant {
    fn default() -> Self {
        Self {
            inherit_false_positives: false,
            inherit_false_negatives: true,
            respect_frequencies: true,
        }
    }
}

/// What to do when an impossible hidden/observed combination is hit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Skip the node's contribution for the current configuration and
    /// continue, leaving a diagnostic in the log.
    #[default]
    Skip,
    /// Fail the whole scoring run with `ScoreError::NumericFault`.
    Strict,
}

/// Engine configuration.  All knobs are explicit; there is no global
/// state.
#[derive(Clone, Debug)]
pub struct Options {
    pub model: ModelVariant,
    /// Drop items without any explicit frequency below `1.0` at setup.
    pub consider_frequencies_only: bool,
    /// Maximal number of explicit-frequency terms per item that are
    /// treated as variable when enumerating hidden configurations.
    pub max_frequency_terms: usize,
    /// Grid of false-positive rates to marginalise over.
    pub alpha_grid: Vec<f64>,
    /// Grid of false-negative rates to marginalise over.
    pub beta_grid: Vec<f64>,
    /// Upper bound for the worker pool; effective count is
    /// `min(cpu_count, num_threads)`.  `None` uses all cores.
    pub num_threads: Option<usize>,
    pub fault_policy: FaultPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            model: ModelVariant::default(),
            consider_frequencies_only: false,
            max_frequency_terms: 10,
            alpha_grid: vec![1e-10, 0.0005, 0.001, 0.005, 0.01],
            beta_grid: vec![1e-10, 0.005, 0.01, 0.05, 0.1, 0.2, 0.4, 0.8, 0.9],
            num_threads: None,
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl Options {
    /// Replace the grids by ones adapted to the ontology size: the
    /// alpha grid spans a handful of expected false positives relative
    /// to the number of terms.
    pub fn with_adaptive_grids(mut self, num_terms: usize) -> Self {
        let t = num_terms as f64;
        self.alpha_grid = vec![1e-10, 1.0 / t, 2.0 / t, 3.0 / t, 4.0 / t, 5.0 / t, 6.0 / t];
        self.beta_grid = vec![0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 0.95];
        self
    }
}

/// Token that can be used to abort a running scoring pass.  It is
/// polled at the top of each per-item task and before each inner
/// configuration step; on cancellation no partial result is returned.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Errors during engine setup.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SetupError {
    #[error("invalid ontology: {0}")]
    InvalidOntology(#[from] OntologyError),
    #[error("invalid annotations: {0}")]
    InvalidAnnotations(#[from] AnnotationError),
}

/// Errors while scoring a query.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ScoreError {
    #[error("scoring was cancelled")]
    Cancelled,
    #[error("impossible hidden/observed configuration encountered")]
    NumericFault,
    #[error("could not build thread pool: {0}")]
    ThreadPool(String),
}

/// Result of a scoring pass; all arrays are indexed by the internal
/// item index.
#[derive(Clone, Debug)]
pub struct InferenceResult {
    scores: Vec<f64>,
    marginals: Vec<f64>,
    stats: Vec<CaseCounts>,
}

impl InferenceResult {
    pub fn len(&self) -> usize {
        self.marginals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marginals.is_empty()
    }

    /// Log-score of the item (unnormalised).
    pub fn score(&self, item: usize) -> f64 {
        self.scores[item]
    }

    /// Normalised marginal probability of the item.
    pub fn marginal(&self, item: usize) -> f64 {
        self.marginals[item]
    }

    pub fn marginals(&self) -> &[f64] {
        &self.marginals
    }

    /// Case tally snapshot of the item's final tracked configuration.
    pub fn stats(&self, item: usize) -> &CaseCounts {
        &self.stats[item]
    }
}

/// Mutable per-worker scoring state: the hidden bit vector and the
/// running case tally.
#[derive(Clone, Debug)]
struct ScratchState {
    hidden: Vec<bool>,
    counts: CaseCounts,
}

/// The scoring engine.  Owns the slim ontology view and all
/// precomputed arrays; immutable after construction and safe to share
/// across threads.
#[derive(Debug)]
pub struct Boqa {
    options: Options,
    slim: SlimOntology,
    table: AnnotationTable,
    diffs: DiffVectors,
    /// Per term, the number of items annotated to it (via the induced
    /// sets).
    items_annotated: Vec<usize>,
    /// Per term, the information content.
    ic: Vec<f64>,
}

impl Boqa {
    /// Set up the engine for the given term container and associations.
    pub fn new(
        terms: Vec<Term>,
        associations: &AssociationContainer,
        options: Options,
    ) -> Result<Self, SetupError> {
        let slim = SlimOntology::new(terms)?;
        let table = AnnotationTable::new(&slim, associations, options.consider_frequencies_only)?;

        tracing::info!(
            "considering {} items over {} terms",
            table.number_of_items(),
            slim.number_of_vertices()
        );

        let diffs = DiffVectors::new(options.max_frequency_terms, &slim, &table);

        let mut items_annotated = vec![0usize; slim.number_of_vertices()];
        for item in 0..table.number_of_items() {
            for &t in table.induced_terms(item) {
                items_annotated[t] += 1;
            }
        }
        let num_items = table.number_of_items() as f64;
        let ic = items_annotated
            .iter()
            .map(|&count| -(count as f64 / num_items).ln())
            .collect();

        Ok(Self {
            options,
            slim,
            table,
            diffs,
            items_annotated,
            ic,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn slim(&self) -> &SlimOntology {
        &self.slim
    }

    pub fn table(&self) -> &AnnotationTable {
        &self.table
    }

    /// Number of items `N`.
    pub fn number_of_items(&self) -> usize {
        self.table.number_of_items()
    }

    /// Number of items annotated to the given term (via induced sets).
    pub fn number_of_items_annotated_to(&self, t: usize) -> usize {
        self.items_annotated[t]
    }

    /// Information content of the given term.
    pub fn ic(&self, t: usize) -> f64 {
        self.ic[t]
    }

    /// Classify a single node under the given hidden and observed
    /// states.
    fn node_case(&self, t: usize, hidden: &[bool], observed: &[bool]) -> NodeCase {
        if self.options.model.inherit_false_positives {
            // False positives are inherited from below: any observed
            // child forces the node to be observed.
            for &child in self.slim.children_of(t) {
                if observed[child] {
                    if observed[t] {
                        return NodeCase::InheritTrue;
                    }
                    tracing::warn!(
                        "impossible configuration: a child of term {} is observed \
                         although the term itself is not",
                        t
                    );
                    return NodeCase::Fault;
                }
            }
        }

        if self.options.model.inherit_false_negatives {
            // False negatives are inherited from above: any unobserved
            // parent forces the node to be unobserved.
            for &parent in self.slim.parents_of(t) {
                if !observed[parent] {
                    if !observed[t] {
                        return NodeCase::InheritFalse;
                    }
                    tracing::warn!(
                        "impossible configuration: a parent of term {} is unobserved \
                         although the term itself is observed",
                        t
                    );
                    return NodeCase::Fault;
                }
            }
        }

        match (hidden[t], observed[t]) {
            (true, true) => NodeCase::TruePositive,
            (true, false) => NodeCase::FalseNegative,
            (false, false) => NodeCase::TrueNegative,
            (false, true) => NodeCase::FalsePositive,
        }
    }

    /// Tally the cases of all nodes in a full pass.
    fn determine_cases(&self, observed: &[bool], hidden: &[bool], counts: &mut CaseCounts) {
        for t in 0..self.slim.number_of_vertices() {
            counts.increment(self.node_case(t, hidden, observed));
        }
    }

    /// Apply an on/off delta to the hidden state while keeping the case
    /// tally consistent: each touched node's case is removed under the
    /// current state and re-added under the new one.
    ///
    /// Flipping a node's hidden bit can only change that node's own
    /// case (the inheritance rules are governed by the observed state,
    /// which does not change here).  When both inheritance directions
    /// are active the flipped node's children and parents are refreshed
    /// as well.
    fn apply_diff(
        &self,
        diff_on: &[usize],
        diff_off: &[usize],
        hidden: &mut [bool],
        observed: &[bool],
        counts: &mut CaseCounts,
    ) {
        let refresh_neighbors = self.options.model.inherit_false_positives
            && self.options.model.inherit_false_negatives;
        let mut neighbors = Vec::new();
        if refresh_neighbors {
            for &t in diff_on.iter().chain(diff_off.iter()) {
                neighbors.extend_from_slice(self.slim.children_of(t));
                neighbors.extend_from_slice(self.slim.parents_of(t));
            }
            neighbors.sort_unstable();
            neighbors.dedup();
            neighbors.retain(|t| {
                diff_on.binary_search(t).is_err() && diff_off.binary_search(t).is_err()
            });
        }

        for &t in diff_on.iter().chain(diff_off.iter()).chain(neighbors.iter()) {
            counts.decrement(self.node_case(t, hidden, observed));
        }

        for &t in diff_on {
            hidden[t] = true;
        }
        for &t in diff_off {
            hidden[t] = false;
        }

        for &t in diff_on.iter().chain(diff_off.iter()).chain(neighbors.iter()) {
            counts.increment(self.node_case(t, hidden, observed));
        }
    }

    /// Determine the weighted case tallies for the given item.
    ///
    /// With `previous`, the supplied state must correspond to the
    /// previous item (all-off for the first item) and is updated in
    /// place; without it, the state is reconstructed from scratch,
    /// which makes the call independent of any other item.
    fn cases_for_item(
        &self,
        item: usize,
        observed: &[bool],
        use_frequencies: bool,
        previous: Option<&mut ScratchState>,
        baseline: &CaseCounts,
        cancel: Option<&CancelToken>,
    ) -> WeightedCountsList {
        let num_terms = self.slim.number_of_vertices();

        let mut local;
        let state = match previous {
            Some(state) => state,
            None => {
                local = ScratchState {
                    hidden: vec![false; num_terms],
                    counts: CaseCounts::default(),
                };
                if !use_frequencies && item > 0 {
                    for &t in self.table.induced_terms(item - 1) {
                        local.hidden[t] = true;
                    }
                    self.determine_cases(observed, &local.hidden, &mut local.counts);
                } else {
                    local.counts = baseline.clone();
                }
                &mut local
            }
        };

        let mut list = WeightedCountsList::default();
        if !use_frequencies {
            self.apply_diff(
                &self.diffs.diff_on[item],
                &self.diffs.diff_off[item],
                &mut state.hidden,
                observed,
                &mut state.counts,
            );
            list.push(state.counts.clone(), 0.0);
        } else {
            // Frequency mode walks all configurations of the item,
            // starting from the all-off hidden state.
            state.hidden.iter_mut().for_each(|bit| *bit = false);
            state.counts = baseline.clone();

            for config in 0..self.diffs.factors[item].len() {
                if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                    break;
                }
                self.apply_diff(
                    &self.diffs.diff_on_freq[item][config],
                    &self.diffs.diff_off_freq[item][config],
                    &mut state.hidden,
                    observed,
                    &mut state.counts,
                );
                list.push(state.counts.clone(), self.diffs.factors[item][config]);
            }
        }

        list
    }

    /// Compute the log-score of one item by marginalising its weighted
    /// tallies over the (alpha, beta) grid.
    fn grid_score(&self, list: &WeightedCountsList) -> f64 {
        let mut score = f64::NEG_INFINITY;
        for &alpha in &self.options.alpha_grid {
            for &beta in &self.options.beta_grid {
                score = log_add(score, list.score(alpha, beta));
            }
        }
        score
    }

    /// Provide the marginal probabilities for the observations.
    pub fn assign_marginals(
        &self,
        observations: &Observations,
        use_frequencies: bool,
    ) -> Result<InferenceResult, ScoreError> {
        self.assign_marginals_with(observations, use_frequencies, None)
    }

    /// Provide the marginal probabilities for the observations, with an
    /// optional cancellation token.
    pub fn assign_marginals_with(
        &self,
        observations: &Observations,
        use_frequencies: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<InferenceResult, ScoreError> {
        let num_items = self.table.number_of_items();
        let num_terms = self.slim.number_of_vertices();
        let observed = observations.as_slice();
        debug_assert_eq!(observed.len(), num_terms);

        // Case tally of the all-off hidden state against the query.
        let all_off = vec![false; num_terms];
        let mut baseline = CaseCounts::default();
        self.determine_cases(observed, &all_off, &mut baseline);

        let mut scores = vec![f64::NEG_INFINITY; num_items];
        let mut stats = vec![CaseCounts::default(); num_items];
        let fault_seen = AtomicBool::new(false);

        let num_threads = self.effective_num_threads();
        if num_threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| ScoreError::ThreadPool(e.to_string()))?;
            pool.install(|| {
                scores
                    .par_iter_mut()
                    .zip(stats.par_iter_mut())
                    .enumerate()
                    .for_each(|(item, (score, stat))| {
                        if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                            return;
                        }
                        let list =
                            self.cases_for_item(item, observed, use_frequencies, None, &baseline, cancel);
                        if list.has_faults() {
                            fault_seen.store(true, Ordering::Relaxed);
                        }
                        *score = self.grid_score(&list);
                        if let Some(last) = list.iter().last() {
                            *stat = last.counts.clone();
                        }
                    });
            });
        } else {
            let mut state = ScratchState {
                hidden: vec![false; num_terms],
                counts: baseline.clone(),
            };
            for item in 0..num_items {
                if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                    break;
                }
                let list = self.cases_for_item(
                    item,
                    observed,
                    use_frequencies,
                    Some(&mut state),
                    &baseline,
                    cancel,
                );
                if list.has_faults() {
                    fault_seen.store(true, Ordering::Relaxed);
                }
                scores[item] = self.grid_score(&list);
                if let Some(last) = list.iter().last() {
                    stats[item] = last.counts.clone();
                }
            }
        }

        if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
            return Err(ScoreError::Cancelled);
        }
        if self.options.fault_policy == FaultPolicy::Strict && fault_seen.load(Ordering::Relaxed) {
            return Err(ScoreError::NumericFault);
        }

        let mut normalization = f64::NEG_INFINITY;
        for &score in &scores {
            normalization = log_add(normalization, score);
        }
        let marginals = scores
            .iter()
            .map(|&score| {
                if normalization == f64::NEG_INFINITY {
                    0.0
                } else {
                    (score - normalization).exp().min(1.0)
                }
            })
            .collect();

        Ok(InferenceResult {
            scores,
            marginals,
            stats,
        })
    }

    /// Effective worker count: `min(cpu_count, configured maximum)`.
    fn effective_num_threads(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        std::cmp::min(cpus, self.options.num_threads.unwrap_or(usize::MAX)).max(1)
    }
}

#[cfg(test)]
mod test {
    use crate::annotations::{Annotation, AssociationContainer};
    use crate::ontology::{Term, TermId};

    use super::cases::CaseCounts;
    use super::observations::Observations;
    use super::{
        Boqa, CancelToken, FaultPolicy, ModelVariant, Options, ScoreError, ScratchState,
    };

    fn chain(len: usize) -> Vec<Term> {
        (0..len)
            .map(|i| Term {
                id: TermId::new(format!("T:{}", i)),
                name: format!("term {}", i),
                parents: if i == 0 {
                    vec![]
                } else {
                    vec![TermId::new(format!("T:{}", i - 1))]
                },
            })
            .collect()
    }

    fn annotation(item: &str, term: &str, frequency: Option<&str>) -> Annotation {
        Annotation {
            item: item.to_string(),
            term_id: TermId::from(term),
            frequency: frequency.map(str::to_string),
        }
    }

    fn point_grid_options(alpha: f64, beta: f64) -> Options {
        Options {
            alpha_grid: vec![alpha],
            beta_grid: vec![beta],
            num_threads: Some(1),
            ..Default::default()
        }
    }

    fn observe(boqa: &Boqa, terms: &[&str]) -> Observations {
        let mut obs = Observations::new(boqa.slim().number_of_vertices());
        for term in terms {
            let t = boqa
                .slim()
                .index_of_term(&TermId::from(*term))
                .expect("term exists");
            obs.add_with_ancestors(boqa.slim(), t);
        }
        obs
    }

    #[test]
    fn trivial_chain_zero_noise() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", None),
            annotation("I1", "T:1", None),
        ]);
        let boqa = Boqa::new(chain(3), &container, point_grid_options(0.0, 0.0))?;

        let obs = observe(&boqa, &["T:2"]);
        let result = boqa.assign_marginals(&obs, false)?;

        assert!(float_cmp::approx_eq!(f64, result.marginal(0), 1.0, epsilon = 1e-12));
        assert!(float_cmp::approx_eq!(f64, result.marginal(1), 0.0, epsilon = 1e-12));

        assert_eq!(result.len(), 2);
        assert!(!result.is_empty());
        // A perfect match has log-score zero at zero noise rates.
        assert!(float_cmp::approx_eq!(f64, result.score(0), 0.0, epsilon = 1e-12));
        assert_eq!(result.score(1), f64::NEG_INFINITY);
        // The snapshot tally covers all terms.
        assert_eq!(result.stats(0).total() as usize, 3);

        Ok(())
    }

    #[test]
    fn noise_symmetry() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", None),
            annotation("I1", "T:1", None),
        ]);
        let boqa = Boqa::new(chain(3), &container, point_grid_options(0.5, 0.5))?;

        let obs = observe(&boqa, &["T:2"]);
        let result = boqa.assign_marginals(&obs, false)?;

        assert!(float_cmp::approx_eq!(
            f64,
            result.marginal(0),
            result.marginal(1),
            epsilon = 1e-9
        ));

        Ok(())
    }

    #[test]
    fn frequency_weighting_prefers_certain_annotation() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", Some("10%")),
            annotation("I1", "T:2", Some("100%")),
        ]);
        let boqa = Boqa::new(chain(3), &container, point_grid_options(0.01, 0.1))?;

        let obs = observe(&boqa, &["T:2"]);
        let result = boqa.assign_marginals(&obs, true)?;

        assert!(
            result.marginal(1) > result.marginal(0),
            "marginals: {:?}",
            result.marginals()
        );

        Ok(())
    }

    #[test]
    fn ancestor_closure_gives_both_items_mass() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:0", None),
            annotation("I0", "T:2", None),
            annotation("I1", "T:1", None),
        ]);
        let boqa = Boqa::new(
            chain(3),
            &container,
            Options {
                num_threads: Some(1),
                ..Default::default()
            },
        )?;

        let obs = observe(&boqa, &["T:2"]);
        let result = boqa.assign_marginals(&obs, true)?;

        assert!(result.marginal(0) > 0.0);
        assert!(result.marginal(1) > 0.0);

        Ok(())
    }

    #[test]
    fn marginals_are_normalised() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:4", Some("60%")),
            annotation("I1", "T:2", None),
            annotation("I2", "T:3", Some("30%")),
            annotation("I2", "T:1", None),
        ]);
        let boqa = Boqa::new(
            chain(5),
            &container,
            Options {
                num_threads: Some(1),
                ..Default::default()
            },
        )?;

        let obs = observe(&boqa, &["T:3"]);
        let result = boqa.assign_marginals(&obs, true)?;

        let total: f64 = result.marginals().iter().sum();
        assert!((total - 1.0).abs() <= 1e-9, "total = {}", total);

        Ok(())
    }

    #[test]
    fn monotone_in_alpha() -> Result<(), anyhow::Error> {
        // I1 incurs false positives for the query below, I0 does not;
        // raising alpha must shift relative mass towards I1.
        let records = vec![annotation("I0", "T:2", None), annotation("I1", "T:0", None)];

        let ratio = |alpha: f64| -> Result<f64, anyhow::Error> {
            let container = AssociationContainer::from_records(records.clone());
            let boqa = Boqa::new(chain(3), &container, point_grid_options(alpha, 0.1))?;
            let obs = observe(&boqa, &["T:2"]);
            let result = boqa.assign_marginals(&obs, false)?;
            Ok(result.marginal(1) / result.marginal(0))
        };

        assert!(ratio(0.1)? > ratio(0.01)?);

        Ok(())
    }

    #[test]
    fn incremental_equals_batch() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", None),
            annotation("I1", "T:4", None),
            annotation("I2", "T:1", None),
            annotation("I3", "T:3", None),
        ]);
        let boqa = Boqa::new(
            chain(5),
            &container,
            Options {
                num_threads: Some(1),
                ..Default::default()
            },
        )?;

        let obs = observe(&boqa, &["T:3"]);
        let observed = obs.as_slice();
        let num_terms = boqa.slim().number_of_vertices();

        let all_off = vec![false; num_terms];
        let mut baseline = CaseCounts::default();
        boqa.determine_cases(observed, &all_off, &mut baseline);

        let mut state = ScratchState {
            hidden: vec![false; num_terms],
            counts: baseline.clone(),
        };
        for item in 0..boqa.number_of_items() {
            boqa.cases_for_item(item, observed, false, Some(&mut state), &baseline, None);

            // Count conservation.
            assert_eq!(state.counts.total() as usize, num_terms);

            // The incremental tally equals a full recomputation on the
            // item's induced hidden state.
            let mut hidden = vec![false; num_terms];
            for &t in boqa.table().induced_terms(item) {
                hidden[t] = true;
            }
            assert_eq!(hidden, state.hidden);
            let mut batch = CaseCounts::default();
            boqa.determine_cases(observed, &hidden, &mut batch);
            assert_eq!(batch, state.counts, "item {}", item);
        }

        Ok(())
    }

    #[test]
    fn incremental_equals_batch_with_both_inheritance_directions() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", None),
            annotation("I1", "T:4", None),
            annotation("I2", "T:1", None),
        ]);
        let boqa = Boqa::new(
            chain(5),
            &container,
            Options {
                model: ModelVariant {
                    inherit_false_positives: true,
                    inherit_false_negatives: true,
                    respect_frequencies: false,
                },
                num_threads: Some(1),
                ..Default::default()
            },
        )?;

        let obs = observe(&boqa, &["T:2"]);
        let observed = obs.as_slice();
        let num_terms = boqa.slim().number_of_vertices();

        let all_off = vec![false; num_terms];
        let mut baseline = CaseCounts::default();
        boqa.determine_cases(observed, &all_off, &mut baseline);

        let mut state = ScratchState {
            hidden: vec![false; num_terms],
            counts: baseline.clone(),
        };
        for item in 0..boqa.number_of_items() {
            boqa.cases_for_item(item, observed, false, Some(&mut state), &baseline, None);
            assert_eq!(state.counts.total() as usize, num_terms);

            let mut hidden = vec![false; num_terms];
            for &t in boqa.table().induced_terms(item) {
                hidden[t] = true;
            }
            let mut batch = CaseCounts::default();
            boqa.determine_cases(observed, &hidden, &mut batch);
            assert_eq!(batch, state.counts, "item {}", item);
        }

        Ok(())
    }

    #[test]
    fn fault_policy() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![annotation("I0", "T:2", None)]);
        let options = |fault_policy: FaultPolicy| Options {
            model: ModelVariant {
                inherit_false_positives: true,
                inherit_false_negatives: false,
                respect_frequencies: false,
            },
            fault_policy,
            num_threads: Some(1),
            ..Default::default()
        };

        // Observations violating the ancestor closure: the leaf is on
        // while its ancestors are off.
        let inconsistent = Observations::from_sparse(3, &[2]);

        let strict = Boqa::new(chain(3), &container, options(FaultPolicy::Strict))?;
        assert!(matches!(
            strict.assign_marginals(&inconsistent, false),
            Err(ScoreError::NumericFault)
        ));

        // The default policy skips the faulty nodes and continues.
        let skipping = Boqa::new(chain(3), &container, options(FaultPolicy::Skip))?;
        let result = skipping.assign_marginals(&inconsistent, false)?;
        assert_eq!(result.len(), 1);

        Ok(())
    }

    #[test]
    fn deterministic_across_thread_counts() -> Result<(), anyhow::Error> {
        // Random-ish 200-term ontology with 20 items; fixed seed.
        let mut rng = fastrand::Rng::with_seed(42);
        let terms = (0..200)
            .map(|i| Term {
                id: TermId::new(format!("T:{}", i)),
                name: format!("term {}", i),
                parents: if i == 0 {
                    vec![]
                } else {
                    vec![TermId::new(format!("T:{}", rng.usize(0..i)))]
                },
            })
            .collect::<Vec<_>>();
        let records = (0..20)
            .flat_map(|item| {
                let count = rng.usize(1..5);
                (0..count)
                    .map(|_| {
                        let term = format!("T:{}", rng.usize(0..200));
                        let freq = if rng.bool() {
                            Some(format!("{}%", rng.usize(5..100)))
                        } else {
                            None
                        };
                        Annotation {
                            item: format!("I{}", item),
                            term_id: TermId::new(term),
                            frequency: freq,
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let query: Vec<String> = (0..5).map(|_| format!("T:{}", rng.usize(0..200))).collect();
        let query: Vec<&str> = query.iter().map(String::as_str).collect();

        let run = |num_threads: usize| -> Result<Vec<f64>, anyhow::Error> {
            let container = AssociationContainer::from_records(records.clone());
            let boqa = Boqa::new(
                terms.clone(),
                &container,
                Options {
                    num_threads: Some(num_threads),
                    ..Default::default()
                },
            )?;
            let obs = observe(&boqa, &query);
            Ok(boqa.assign_marginals(&obs, true)?.marginals().to_vec())
        };

        let single = run(1)?;
        let multi = run(8)?;
        assert_eq!(single.len(), multi.len());
        for (a, b) in single.iter().zip(multi.iter()) {
            assert!((a - b).abs() < 1e-12, "{} != {}", a, b);
        }

        Ok(())
    }

    #[test]
    fn adaptive_grids_scale_with_ontology_size() {
        let options = Options::default().with_adaptive_grids(100);

        assert_eq!(options.alpha_grid.len(), 7);
        assert!(float_cmp::approx_eq!(
            f64,
            options.alpha_grid[1],
            0.01,
            epsilon = 1e-12
        ));
        assert_eq!(options.beta_grid.len(), 11);
    }

    #[test]
    fn cancellation_returns_no_result() -> Result<(), anyhow::Error> {
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", None),
            annotation("I1", "T:1", None),
        ]);
        let boqa = Boqa::new(
            chain(3),
            &container,
            Options {
                num_threads: Some(1),
                ..Default::default()
            },
        )?;

        let obs = observe(&boqa, &["T:2"]);
        let token = CancelToken::new();
        token.cancel();

        assert!(matches!(
            boqa.assign_marginals_with(&obs, true, Some(&token)),
            Err(ScoreError::Cancelled)
        ));

        Ok(())
    }
}
