//! Precomputed term on/off deltas that let the scoring loop mutate the
//! hidden state incrementally instead of rebuilding it per item.

use crate::annotations::AnnotationTable;
use crate::ontology::SlimOntology;

use super::subsets::SubsetGenerator;
use super::util::{set_diff, sparse_from_dense};

/// On/off deltas between consecutive items and between adjacent
/// frequency-implied hidden configurations.
#[derive(Debug, Clone)]
pub struct DiffVectors {
    /// Per item, the terms to switch on when moving from the previous
    /// item's fully-included hidden state to this item's.  `diff_on[0]`
    /// is the full induced set of the first item.
    pub diff_on: Vec<Vec<usize>>,
    /// Per item, the terms to switch off; `diff_off[0]` is empty.
    pub diff_off: Vec<Vec<usize>>,
    /// Per item and frequency configuration, the terms to switch on
    /// relative to the previous configuration of the same item (starting
    /// from the empty hidden state).
    pub diff_on_freq: Vec<Vec<Vec<usize>>>,
    /// Per item and frequency configuration, the terms to switch off.
    pub diff_off_freq: Vec<Vec<Vec<usize>>>,
    /// Per item and frequency configuration, the log probability of the
    /// subset assignment.
    pub factors: Vec<Vec<f64>>,
}

impl DiffVectors {
    /// Precompute all deltas.  `max_frequency_terms` bounds the number of
    /// explicit-frequency terms per item that are treated as variable;
    /// the lowest-frequency ones are picked first.
    pub fn new(
        max_frequency_terms: usize,
        slim: &SlimOntology,
        table: &AnnotationTable,
    ) -> Self {
        let num_items = table.number_of_items();
        let num_terms = slim.number_of_vertices();

        tracing::debug!("determining differences between consecutive items");
        let mut diff_on = Vec::with_capacity(num_items);
        let mut diff_off = Vec::with_capacity(num_items);
        diff_on.push(table.induced_terms(0).to_vec());
        diff_off.push(Vec::new());
        let mut total = 0usize;
        for item in 1..num_items {
            let prev = table.induced_terms(item - 1);
            let curr = table.induced_terms(item);
            diff_on.push(set_diff(curr, prev));
            diff_off.push(set_diff(prev, curr));
            total += diff_on[item].len() + diff_off[item].len();
        }
        tracing::debug!(
            "{} differences detected ({:.2} per item)",
            total,
            total as f64 / num_items as f64
        );

        tracing::debug!(
            "determining differences between frequency configurations (at most {} variable terms)",
            max_frequency_terms
        );
        let mut diff_on_freq = Vec::with_capacity(num_items);
        let mut diff_off_freq = Vec::with_capacity(num_items);
        let mut factors = Vec::with_capacity(num_items);
        for item in 0..num_items {
            let (ons, offs, fs) =
                item_frequency_diffs(max_frequency_terms, num_terms, slim, table, item);
            diff_on_freq.push(ons);
            diff_off_freq.push(offs);
            factors.push(fs);
        }

        Self {
            diff_on,
            diff_off,
            diff_on_freq,
            diff_off_freq,
            factors,
        }
    }
}

/// Number of direct terms of the item that are treated as variable,
/// i.e. carry an explicit frequency below `1.0`, capped at
/// `max_frequency_terms`.
fn num_variable_terms(
    max_frequency_terms: usize,
    table: &AnnotationTable,
    item: usize,
) -> usize {
    let frequencies = table.term_frequencies(item);
    let order = table.frequency_order(item);

    let mut count = 0;
    for &position in order.iter().take(max_frequency_terms) {
        if frequencies[position] >= 1.0 {
            break;
        }
        count += 1;
    }
    count
}

/// Enumerate all hidden configurations implied by the item's variable
/// terms and record the delta between each configuration and its
/// predecessor, together with the log probability of the assignment.
#[allow(clippy::type_complexity)]
fn item_frequency_diffs(
    max_frequency_terms: usize,
    num_terms: usize,
    slim: &SlimOntology,
    table: &AnnotationTable,
    item: usize,
) -> (Vec<Vec<usize>>, Vec<Vec<usize>>, Vec<f64>) {
    let direct = table.direct_terms(item);
    let frequencies = table.term_frequencies(item);
    let order = table.frequency_order(item);
    let num_variable = num_variable_terms(max_frequency_terms, table, item);

    let num_configs = 1usize << num_variable;
    let mut diff_on = Vec::with_capacity(num_configs);
    let mut diff_off = Vec::with_capacity(num_configs);
    let mut factors = Vec::with_capacity(num_configs);

    let mut prev_sparse: Vec<usize> = Vec::new();
    for subset in SubsetGenerator::new(num_variable, num_variable) {
        let mut hidden = vec![false; num_terms];
        let mut taken = vec![false; num_variable];
        let mut factor = 0.0;

        // Activate the variable terms selected by the subset.
        for &position in &subset {
            let ti = order[position];
            slim.activate_with_ancestors(direct[ti], &mut hidden);
            factor += frequencies[ti].ln();
            taken[position] = true;
        }

        // The inactive variable terms also enter the factor.
        for (position, &taken) in taken.iter().enumerate() {
            if !taken {
                factor += (1.0 - frequencies[order[position]]).ln();
            }
        }

        // Mandatory terms are always set.
        for &position in order.iter().skip(num_variable) {
            slim.activate_with_ancestors(direct[position], &mut hidden);
        }

        let sparse = sparse_from_dense(&hidden);
        diff_on.push(set_diff(&sparse, &prev_sparse));
        diff_off.push(set_diff(&prev_sparse, &sparse));
        factors.push(factor);
        prev_sparse = sparse;
    }

    (diff_on, diff_off, factors)
}
