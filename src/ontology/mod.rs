//! Ontology terms and the dense, index-based view of the ontology DAG.
//!
//! The slim view replaces all graph pointers by dense indices in
//! `[0, T)` so that the scoring hot path only ever indexes into flat
//! arrays.  It is built once at setup time and immutable afterwards.

use std::collections::HashMap;

pub mod obo;

/// Stable external identifier of a term, e.g. `HP:0000118`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TermId(String);

impl TermId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TermId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TermId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A term (vertex) of the ontology as supplied by the ontology source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Term {
    /// Stable external identifier.
    pub id: TermId,
    /// Display name.
    pub name: String,
    /// Identifiers of the direct parents (IS_A edges point child to parent).
    pub parents: Vec<TermId>,
}

/// Errors that can occur when constructing the slim ontology view.
#[derive(thiserror::Error, Debug, Clone)]
pub enum OntologyError {
    #[error("ontology has no terms")]
    Empty,
    #[error("ontology graph contains a cycle")]
    Cyclic,
    #[error("term {child} refers to unknown parent {parent}")]
    UnknownParent { child: TermId, parent: TermId },
    #[error("duplicate term identifier {0}")]
    DuplicateTerm(TermId),
}

/// Dense, index-based view of the ontology DAG.
///
/// All per-term attributes are stored in arrays of length `T` indexed by
/// the dense term index.  Ancestor and descendant arrays contain strict
/// ancestors/descendants (the term itself is excluded) in sorted order.
#[derive(Debug, Clone)]
pub struct SlimOntology {
    terms: Vec<Term>,
    id_to_index: HashMap<TermId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    ancestors: Vec<Vec<usize>>,
    descendants: Vec<Vec<usize>>,
    topological_order: Vec<usize>,
    topological_rank: Vec<usize>,
}

impl SlimOntology {
    /// Build the slim view from a term container.
    ///
    /// Fails with `OntologyError::Cyclic` if the IS_A relation contains a
    /// cycle and with `OntologyError::UnknownParent` if a term refers to a
    /// parent that is not part of the container.
    pub fn new(terms: Vec<Term>) -> Result<Self, OntologyError> {
        if terms.is_empty() {
            return Err(OntologyError::Empty);
        }

        let mut id_to_index = HashMap::with_capacity(terms.len());
        for (i, term) in terms.iter().enumerate() {
            if id_to_index.insert(term.id.clone(), i).is_some() {
                return Err(OntologyError::DuplicateTerm(term.id.clone()));
            }
        }

        let mut parents = Vec::with_capacity(terms.len());
        for term in &terms {
            let mut ps = Vec::with_capacity(term.parents.len());
            for parent in &term.parents {
                let idx = *id_to_index
                    .get(parent)
                    .ok_or_else(|| OntologyError::UnknownParent {
                        child: term.id.clone(),
                        parent: parent.clone(),
                    })?;
                ps.push(idx);
            }
            ps.sort_unstable();
            ps.dedup();
            parents.push(ps);
        }

        let mut children = vec![Vec::new(); terms.len()];
        for (child, ps) in parents.iter().enumerate() {
            for &parent in ps {
                children[parent].push(child);
            }
        }
        // Children were pushed in ascending child order already.

        let topological_order = topological_sort(&parents, &children)?;
        let mut topological_rank = vec![0usize; terms.len()];
        for (rank, &t) in topological_order.iter().enumerate() {
            topological_rank[t] = rank;
        }

        // Walk from the roots down; every parent is processed before any
        // of its children, so ancestor sets can be unioned incrementally.
        let mut ancestors: Vec<Vec<usize>> = vec![Vec::new(); terms.len()];
        for &t in &topological_order {
            let mut anc = Vec::new();
            for &parent in &parents[t] {
                anc.push(parent);
                anc.extend_from_slice(&ancestors[parent]);
            }
            anc.sort_unstable();
            anc.dedup();
            ancestors[t] = anc;
        }

        let mut descendants: Vec<Vec<usize>> = vec![Vec::new(); terms.len()];
        for t in 0..terms.len() {
            for &a in &ancestors[t] {
                descendants[a].push(t);
            }
        }
        // Descendants were pushed in ascending order of `t` already.

        Ok(Self {
            terms,
            id_to_index,
            parents,
            children,
            ancestors,
            descendants,
            topological_order,
            topological_rank,
        })
    }

    /// Number of vertices `T` of the DAG.
    pub fn number_of_vertices(&self) -> usize {
        self.terms.len()
    }

    /// The term stored at the given dense index.
    pub fn term_at_index(&self, t: usize) -> &Term {
        &self.terms[t]
    }

    /// The dense index of the term with the given identifier.
    pub fn index_of_term(&self, id: &TermId) -> Option<usize> {
        self.id_to_index.get(id).copied()
    }

    /// Sorted indices of the direct parents of `t`.
    pub fn parents_of(&self, t: usize) -> &[usize] {
        &self.parents[t]
    }

    /// Sorted indices of the direct children of `t`.
    pub fn children_of(&self, t: usize) -> &[usize] {
        &self.children[t]
    }

    /// Sorted indices of all strict ancestors of `t`.
    pub fn ancestors_of(&self, t: usize) -> &[usize] {
        &self.ancestors[t]
    }

    /// Sorted indices of all strict descendants of `t`.
    pub fn descendants_of(&self, t: usize) -> &[usize] {
        &self.descendants[t]
    }

    /// Term indices in a fixed topological order (parents first).
    pub fn topological_order(&self) -> &[usize] {
        &self.topological_order
    }

    /// Rank of `t` within the topological order.
    pub fn topological_rank(&self, t: usize) -> usize {
        self.topological_rank[t]
    }

    /// Returns whether `a` is a strict descendant of `b`.
    pub fn is_descendant(&self, a: usize, b: usize) -> bool {
        self.ancestors[a].binary_search(&b).is_ok()
    }

    /// Activate `t` and all of its ancestors in the given state vector.
    pub fn activate_with_ancestors(&self, t: usize, states: &mut [bool]) {
        states[t] = true;
        for &a in &self.ancestors[t] {
            states[a] = true;
        }
    }
}

/// Kahn's algorithm over the child-to-parent edge relation.  The returned
/// order lists parents before their children.
fn topological_sort(
    parents: &[Vec<usize>],
    children: &[Vec<usize>],
) -> Result<Vec<usize>, OntologyError> {
    let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
    let mut queue: std::collections::VecDeque<usize> = (0..parents.len())
        .filter(|&t| in_degree[t] == 0)
        .collect();

    let mut order = Vec::with_capacity(parents.len());
    while let Some(t) = queue.pop_front() {
        order.push(t);
        for &child in &children[t] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if order.len() != parents.len() {
        return Err(OntologyError::Cyclic);
    }
    Ok(order)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{OntologyError, SlimOntology, Term, TermId};

    fn term(id: &str, name: &str, parents: &[&str]) -> Term {
        Term {
            id: TermId::from(id),
            name: name.to_string(),
            parents: parents.iter().map(|p| TermId::from(*p)).collect(),
        }
    }

    /// A small diamond: T0 is the root, T1 and T2 are children of T0,
    /// T3 is a child of both T1 and T2.
    fn diamond() -> Vec<Term> {
        vec![
            term("T:0", "root", &[]),
            term("T:1", "left", &["T:0"]),
            term("T:2", "right", &["T:0"]),
            term("T:3", "bottom", &["T:1", "T:2"]),
        ]
    }

    #[test]
    fn diamond_closures() -> Result<(), anyhow::Error> {
        let slim = SlimOntology::new(diamond())?;

        assert_eq!(slim.number_of_vertices(), 4);
        assert_eq!(slim.parents_of(3), &[1, 2]);
        assert_eq!(slim.children_of(0), &[1, 2]);
        assert_eq!(slim.ancestors_of(3), &[0, 1, 2]);
        assert_eq!(slim.ancestors_of(0), &[] as &[usize]);
        assert_eq!(slim.descendants_of(0), &[1, 2, 3]);
        assert_eq!(slim.descendants_of(3), &[] as &[usize]);

        Ok(())
    }

    #[test]
    fn topological_order_respects_edges() -> Result<(), anyhow::Error> {
        let slim = SlimOntology::new(diamond())?;

        assert_eq!(slim.topological_order().len(), slim.number_of_vertices());
        for t in 0..slim.number_of_vertices() {
            for &parent in slim.parents_of(t) {
                assert!(slim.topological_rank(parent) < slim.topological_rank(t));
            }
        }

        Ok(())
    }

    #[test]
    fn is_descendant() -> Result<(), anyhow::Error> {
        let slim = SlimOntology::new(diamond())?;

        assert!(slim.is_descendant(3, 0));
        assert!(slim.is_descendant(1, 0));
        assert!(!slim.is_descendant(0, 3));
        assert!(!slim.is_descendant(1, 2));

        Ok(())
    }

    #[test]
    fn cycle_is_rejected() {
        let terms = vec![
            term("T:0", "a", &["T:1"]),
            term("T:1", "b", &["T:0"]),
        ];

        assert!(matches!(
            SlimOntology::new(terms),
            Err(OntologyError::Cyclic)
        ));
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let terms = vec![term("T:0", "a", &["T:9"])];

        assert!(matches!(
            SlimOntology::new(terms),
            Err(OntologyError::UnknownParent { .. })
        ));
    }

    #[test]
    fn empty_is_rejected() {
        assert!(matches!(SlimOntology::new(vec![]), Err(OntologyError::Empty)));
    }

    #[test]
    fn activate_with_ancestors() -> Result<(), anyhow::Error> {
        let slim = SlimOntology::new(diamond())?;

        let mut states = vec![false; slim.number_of_vertices()];
        slim.activate_with_ancestors(3, &mut states);
        assert_eq!(states, vec![true, true, true, true]);

        let mut states = vec![false; slim.number_of_vertices()];
        slim.activate_with_ancestors(1, &mut states);
        assert_eq!(states, vec![true, true, false, false]);

        Ok(())
    }
}
