//! Observed state for a query.

use crate::ontology::SlimOntology;

/// One bit per ontology term: whether the term was observed in the
/// query.  Scoring expects the vector to be closed under taking
/// ancestors, which `add_with_ancestors` maintains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observations {
    observed: Vec<bool>,
}

impl Observations {
    /// All-off observation vector for an ontology with `num_terms`
    /// vertices.
    pub fn new(num_terms: usize) -> Self {
        Self {
            observed: vec![false; num_terms],
        }
    }

    /// Build an observation vector from sparsely given on-terms without
    /// touching their ancestors.
    pub fn from_sparse(num_terms: usize, on_terms: &[usize]) -> Self {
        let mut result = Self::new(num_terms);
        for &t in on_terms {
            result.observed[t] = true;
        }
        result
    }

    /// Mark the term and all of its ancestors as observed.
    pub fn add_with_ancestors(&mut self, slim: &SlimOntology, t: usize) {
        slim.activate_with_ancestors(t, &mut self.observed);
    }

    /// The dense bit vector.
    pub fn as_slice(&self) -> &[bool] {
        &self.observed
    }

    /// Number of observed terms.
    pub fn count_on(&self) -> usize {
        self.observed.iter().filter(|&&on| on).count()
    }
}
