//! User-facing engine facade.
//!
//! All identifiers exposed by this module live in the *sorted* term id
//! space: terms are sorted case-insensitively by name and addressed by
//! their position in that order.  Conversion to the internal dense
//! indices happens at this boundary only.

use crate::annotations::AssociationContainer;
use crate::calc::observations::Observations;
use crate::calc::{Boqa, CancelToken, Options, ScoreError, SetupError};
use crate::ontology::Term;

/// Errors returned by `Engine::score`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum QueryError {
    #[error("query contains no terms")]
    EmptyQuery,
    #[error("unknown term id {0}")]
    UnknownTerm(usize),
    #[error(transparent)]
    Score(#[from] ScoreError),
}

/// One entry of a ranked result list.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemResult {
    /// Internal index of the item.
    pub item: usize,
    /// Marginal probability of the item.
    pub score: f64,
}

/// Engine facade tying the scoring core to a stable, sorted term id
/// space for user interfaces.
pub struct Engine {
    boqa: Boqa,
    /// Maps sorted ids to internal term indices.
    sorted_to_internal: Vec<usize>,
    /// Maps internal term indices to sorted ids.
    internal_to_sorted: Vec<usize>,
}

impl Engine {
    /// Set up the engine for the given term container and associations.
    pub fn new(
        terms: Vec<Term>,
        associations: &AssociationContainer,
        options: Options,
    ) -> Result<Self, SetupError> {
        tracing::info!("setting up the scoring core");
        let boqa = Boqa::new(terms, associations, options)?;

        tracing::info!("sorting terms");
        let num_terms = boqa.slim().number_of_vertices();
        let mut sorted_to_internal: Vec<usize> = (0..num_terms).collect();
        sorted_to_internal.sort_by(|&a, &b| {
            let name_a = &boqa.slim().term_at_index(a).name;
            let name_b = &boqa.slim().term_at_index(b).name;
            name_a
                .to_lowercase()
                .cmp(&name_b.to_lowercase())
                .then(a.cmp(&b))
        });
        let mut internal_to_sorted = vec![0usize; num_terms];
        for (sorted, &internal) in sorted_to_internal.iter().enumerate() {
            internal_to_sorted[internal] = sorted;
        }

        Ok(Self {
            boqa,
            sorted_to_internal,
            internal_to_sorted,
        })
    }

    /// The underlying scoring core.
    pub fn boqa(&self) -> &Boqa {
        &self.boqa
    }

    /// Number of terms of the ontology.
    pub fn number_of_terms(&self) -> usize {
        self.sorted_to_internal.len()
    }

    /// Number of items of the catalogue.
    pub fn number_of_items(&self) -> usize {
        self.boqa.number_of_items()
    }

    /// The term at the given sorted id.
    pub fn term_at(&self, sorted_id: usize) -> &Term {
        self.boqa
            .slim()
            .term_at_index(self.sorted_to_internal[sorted_id])
    }

    /// The sorted id of the given term.
    pub fn id_of_term(&self, term: &Term) -> Option<usize> {
        self.boqa
            .slim()
            .index_of_term(&term.id)
            .map(|internal| self.internal_to_sorted[internal])
    }

    /// The sorted id of the term with the given identifier string.
    pub fn id_of_term_id(&self, term_id: &crate::ontology::TermId) -> Option<usize> {
        self.boqa
            .slim()
            .index_of_term(term_id)
            .map(|internal| self.internal_to_sorted[internal])
    }

    /// Iterate over terms in sorted order, optionally restricted to
    /// those whose name or identifier contains the pattern
    /// (case-insensitively).
    pub fn terms<'a>(&'a self, pattern: Option<&'a str>) -> impl Iterator<Item = &'a Term> + 'a {
        let pattern = pattern.map(str::to_lowercase);
        (0..self.number_of_terms())
            .map(|sorted_id| self.term_at(sorted_id))
            .filter(move |term| match &pattern {
                None => true,
                Some(pattern) => {
                    pattern.is_empty()
                        || term.name.to_lowercase().contains(pattern)
                        || term.id.as_str().to_lowercase().contains(pattern)
                }
            })
    }

    /// Number of terms matching the pattern.
    pub fn number_of_matching_terms(&self, pattern: Option<&str>) -> usize {
        match pattern {
            None => self.number_of_terms(),
            Some(_) => self.terms(pattern).count(),
        }
    }

    /// Name of the given item.
    pub fn item_name(&self, item: usize) -> &str {
        self.boqa.table().item_name(item)
    }

    /// Sorted ids of the terms directly annotated to the item, parallel
    /// to `frequencies_directly_annotated_to`.
    pub fn terms_directly_annotated_to(&self, item: usize) -> Vec<usize> {
        self.boqa
            .table()
            .direct_terms(item)
            .iter()
            .map(|&t| self.internal_to_sorted[t])
            .collect()
    }

    /// Frequencies of the terms directly annotated to the item.
    pub fn frequencies_directly_annotated_to(&self, item: usize) -> &[f64] {
        self.boqa.table().term_frequencies(item)
    }

    /// Sorted ids of the parents of the term at the given sorted id.
    pub fn parents_of(&self, sorted_id: usize) -> Vec<usize> {
        self.boqa
            .slim()
            .parents_of(self.sorted_to_internal[sorted_id])
            .iter()
            .map(|&t| self.internal_to_sorted[t])
            .collect()
    }

    /// Number of items annotated to the term at the given sorted id.
    pub fn number_of_items_annotated_to(&self, sorted_id: usize) -> usize {
        self.boqa
            .number_of_items_annotated_to(self.sorted_to_internal[sorted_id])
    }

    /// Score all items against the query given as sorted term ids and
    /// return them ordered by descending marginal probability (ties
    /// broken by smaller item index).
    pub fn score(&self, sorted_ids: &[usize]) -> Result<Vec<ItemResult>, QueryError> {
        self.score_with(sorted_ids, None)
    }

    /// Build the ancestor-closed observation vector for the query given
    /// as sorted term ids.
    pub fn observations(&self, sorted_ids: &[usize]) -> Result<Observations, QueryError> {
        if sorted_ids.is_empty() {
            return Err(QueryError::EmptyQuery);
        }

        let mut observations = Observations::new(self.boqa.slim().number_of_vertices());
        for &sorted_id in sorted_ids {
            let &internal = self
                .sorted_to_internal
                .get(sorted_id)
                .ok_or(QueryError::UnknownTerm(sorted_id))?;
            observations.add_with_ancestors(self.boqa.slim(), internal);
        }
        Ok(observations)
    }

    /// Like `score`, with an optional cancellation token.
    pub fn score_with(
        &self,
        sorted_ids: &[usize],
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<ItemResult>, QueryError> {
        let start = std::time::Instant::now();

        let observations = self.observations(sorted_ids)?;

        let use_frequencies = self.boqa.options().model.respect_frequencies;
        let result = self
            .boqa
            .assign_marginals_with(&observations, use_frequencies, cancel)?;

        let mut ranking: Vec<ItemResult> = (0..result.len())
            .map(|item| ItemResult {
                item,
                score: result.marginal(item),
            })
            .collect();
        ranking.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.item.cmp(&b.item)));

        tracing::info!("calculation took {:?}", start.elapsed());

        Ok(ranking)
    }
}
