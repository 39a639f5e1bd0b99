//! Annotation sources linking items (e.g. diseases) to ontology terms.
//!
//! An annotation optionally carries a frequency which is interpreted as
//! the probability that the term is truly present in the item.

use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

use indexmap::IndexMap;

use crate::common::open_read_maybe_gz;
use crate::ontology::{SlimOntology, TermId};

/// One annotation record as supplied by the annotation source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    /// Name of the annotated item.
    pub item: String,
    /// Identifier of the annotated term.
    pub term_id: TermId,
    /// Raw frequency string, if any.
    pub frequency: Option<String>,
}

/// Container grouping annotations by item.
///
/// The iteration order of the items is the order in which they first
/// appear in the source; it defines the internal item index space.
#[derive(Debug, Default, Clone)]
pub struct AssociationContainer {
    items: IndexMap<String, Vec<Annotation>>,
}

impl AssociationContainer {
    /// Build a container from individual annotation records.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Annotation>,
    {
        let mut items: IndexMap<String, Vec<Annotation>> = IndexMap::new();
        for record in records {
            items.entry(record.item.clone()).or_default().push(record);
        }
        Self { items }
    }

    /// Read annotations from a tab-separated file with columns item name,
    /// term identifier, and optional frequency (transparently ungzipping
    /// `.gz` files).  Empty lines and lines starting with `#` are skipped.
    pub fn from_tsv_file<P>(path: P) -> Result<Self, anyhow::Error>
    where
        P: AsRef<Path>,
    {
        Self::from_tsv(open_read_maybe_gz(path)?)
    }

    /// Read annotations from a tab-separated reader.
    pub fn from_tsv<R: BufRead>(reader: R) -> Result<Self, anyhow::Error> {
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields = line.split('\t').collect::<Vec<_>>();
            if fields.len() < 2 {
                anyhow::bail!("annotation line has fewer than two columns: {:?}", &line);
            }
            records.push(Annotation {
                item: fields[0].to_string(),
                term_id: TermId::from(fields[1]),
                frequency: fields
                    .get(2)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string()),
            });
        }
        Ok(Self::from_records(records))
    }

    /// Number of annotated items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over (item name, annotations) in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Annotation>)> {
        self.items.iter()
    }
}

static PERCENT_RE: OnceLock<regex::Regex> = OnceLock::new();
static FRACTION_RE: OnceLock<regex::Regex> = OnceLock::new();
static N_OF_M_RE: OnceLock<regex::Regex> = OnceLock::new();

/// Convert a frequency string to a probability in `[0, 1]`.
///
/// Supports `"N%"`, `"N.M%"`, `"N/M"`, `"N of M"`, and the named buckets
/// (`very rare`, `occasional`, `frequent`, `very frequent`, `obligate`)
/// including their legacy synonyms.  Unknown strings map to `1.0` with a
/// diagnostic.
pub fn parse_frequency(freq: &str) -> f64 {
    let percent_re = PERCENT_RE
        .get_or_init(|| regex::Regex::new(r"^(\d+)\.?(\d*)\s*%$").expect("could not parse RE"));
    let fraction_re = FRACTION_RE
        .get_or_init(|| regex::Regex::new(r"^(\d+)/(\d+)$").expect("could not parse RE"));
    let n_of_m_re = N_OF_M_RE
        .get_or_init(|| regex::Regex::new(r"^(\d+) of (\d+)$").expect("could not parse RE"));

    let freq = freq.trim();
    if freq.is_empty() {
        return 1.0;
    }

    let raw = if let Some(c) = percent_re.captures(freq) {
        let whole: f64 = c[1].parse().expect("matched digits");
        let frac_digits = &c[2];
        let frac: f64 = if frac_digits.is_empty() {
            0.0
        } else {
            frac_digits.parse::<f64>().expect("matched digits")
                / 10f64.powi(frac_digits.len() as i32)
        };
        (whole + frac) / 100.0
    } else if let Some(c) = fraction_re.captures(freq).or_else(|| n_of_m_re.captures(freq)) {
        let n: f64 = c[1].parse().expect("matched digits");
        let m: f64 = c[2].parse().expect("matched digits");
        n / m
    } else {
        // Normalize legacy wordings before looking up the buckets.
        let named = match freq.to_ascii_lowercase().as_str() {
            "typical" | "common" | "variable" => "frequent".to_string(),
            "hallmark" => "very frequent".to_string(),
            "rare" => "occasional".to_string(),
            other => other.to_string(),
        };
        match named.as_str() {
            "very rare" => 0.02,
            "occasional" => 0.1,
            "frequent" => 0.5,
            "very frequent" => 0.9,
            "obligate" => 1.0,
            _ => {
                tracing::warn!("unknown frequency identifier: {:?}", freq);
                1.0
            }
        }
    };

    if !(0.0..=1.0).contains(&raw) {
        tracing::warn!("frequency {:?} is out of [0, 1], clamping", freq);
        raw.clamp(0.0, 1.0)
    } else {
        raw
    }
}

/// Errors that can occur when building the annotation table.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AnnotationError {
    #[error("annotation of item {item} refers to unknown term {term}")]
    UnknownTerm { item: String, term: TermId },
    #[error("no items left after frequency filtering")]
    NoItemsLeft,
}

/// Per-item annotation arrays used by the scoring core.
///
/// All term references are dense indices into the slim ontology.  The
/// internal item index space is defined by the iteration order of the
/// association source.
#[derive(Debug, Clone)]
pub struct AnnotationTable {
    /// Names of the items, indexed by item.
    item_names: Vec<String>,
    /// Per item, the sorted indices of directly annotated terms.
    direct_terms: Vec<Vec<usize>>,
    /// Per item, the sorted ancestor closure of the direct terms.
    induced_terms: Vec<Vec<usize>>,
    /// Per item, frequencies parallel to `direct_terms`.
    term_frequencies: Vec<Vec<f64>>,
    /// Per item, the permutation of positions into `direct_terms` that
    /// orders the direct terms by ascending frequency.
    frequency_order: Vec<Vec<usize>>,
    /// Per item, whether any annotation carries an explicit frequency
    /// below `1.0`.
    has_explicit_frequency: Vec<bool>,
}

impl AnnotationTable {
    /// Build the table from an association container.
    ///
    /// With `consider_frequencies_only`, items without a single explicit
    /// frequency below `1.0` are dropped.
    pub fn new(
        slim: &SlimOntology,
        associations: &AssociationContainer,
        consider_frequencies_only: bool,
    ) -> Result<Self, AnnotationError> {
        let mut table = Self {
            item_names: Vec::new(),
            direct_terms: Vec::new(),
            induced_terms: Vec::new(),
            term_frequencies: Vec::new(),
            frequency_order: Vec::new(),
            has_explicit_frequency: Vec::new(),
        };

        for (item, annotations) in associations.iter() {
            let mut directs: Vec<(usize, f64)> = Vec::with_capacity(annotations.len());
            for annotation in annotations {
                let t = slim.index_of_term(&annotation.term_id).ok_or_else(|| {
                    AnnotationError::UnknownTerm {
                        item: item.clone(),
                        term: annotation.term_id.clone(),
                    }
                })?;
                let frequency = annotation
                    .frequency
                    .as_deref()
                    .map(parse_frequency)
                    .unwrap_or(1.0);
                // A term is assumed to be annotated at most once; keep the
                // first frequency seen.
                if !directs.iter().any(|&(d, _)| d == t) {
                    directs.push((t, frequency));
                }
            }
            directs.sort_unstable_by_key(|&(t, _)| t);

            let has_explicit = directs.iter().any(|&(_, f)| f < 1.0);
            if consider_frequencies_only && !has_explicit {
                continue;
            }

            let direct_terms: Vec<usize> = directs.iter().map(|&(t, _)| t).collect();
            let term_frequencies: Vec<f64> = directs.iter().map(|&(_, f)| f).collect();

            let mut induced: Vec<usize> = Vec::new();
            for &t in &direct_terms {
                induced.push(t);
                induced.extend_from_slice(slim.ancestors_of(t));
            }
            induced.sort_unstable();
            induced.dedup();

            let mut frequency_order: Vec<usize> = (0..direct_terms.len()).collect();
            frequency_order.sort_by(|&a, &b| term_frequencies[a].total_cmp(&term_frequencies[b]));

            table.item_names.push(item.clone());
            table.direct_terms.push(direct_terms);
            table.induced_terms.push(induced);
            table.term_frequencies.push(term_frequencies);
            table.frequency_order.push(frequency_order);
            table.has_explicit_frequency.push(has_explicit);
        }

        if table.item_names.is_empty() {
            return Err(AnnotationError::NoItemsLeft);
        }

        Ok(table)
    }

    /// Number of items `N`.
    pub fn number_of_items(&self) -> usize {
        self.item_names.len()
    }

    /// Name of the given item.
    pub fn item_name(&self, item: usize) -> &str {
        &self.item_names[item]
    }

    /// Sorted indices of the terms directly annotated to the item.
    pub fn direct_terms(&self, item: usize) -> &[usize] {
        &self.direct_terms[item]
    }

    /// Sorted ancestor closure of the item's direct terms.
    pub fn induced_terms(&self, item: usize) -> &[usize] {
        &self.induced_terms[item]
    }

    /// Frequencies parallel to `direct_terms`.
    pub fn term_frequencies(&self, item: usize) -> &[f64] {
        &self.term_frequencies[item]
    }

    /// Positions into `direct_terms` ordered by ascending frequency.
    pub fn frequency_order(&self, item: usize) -> &[usize] {
        &self.frequency_order[item]
    }

    /// Whether the item carries an explicit frequency below `1.0`.
    pub fn has_explicit_frequency(&self, item: usize) -> bool {
        self.has_explicit_frequency[item]
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use crate::ontology::{SlimOntology, Term, TermId};

    use super::{Annotation, AnnotationError, AnnotationTable, AssociationContainer};

    #[rstest::rstest]
    #[case("50%", 0.5)]
    #[case("12.5%", 0.125)]
    #[case("3/4", 0.75)]
    #[case("3 of 4", 0.75)]
    #[case("very rare", 0.02)]
    #[case("occasional", 0.1)]
    #[case("frequent", 0.5)]
    #[case("very frequent", 0.9)]
    #[case("obligate", 1.0)]
    #[case("hallmark", 0.9)]
    #[case("typical", 0.5)]
    #[case("rare", 0.1)]
    #[case("", 1.0)]
    #[case("no idea", 1.0)]
    fn parse_frequency(#[case] raw: &str, #[case] expected: f64) {
        let actual = super::parse_frequency(raw);
        assert!(
            float_cmp::approx_eq!(f64, expected, actual, ulps = 2),
            "{:?} -> {} != {}",
            raw,
            actual,
            expected
        );
    }

    fn chain() -> SlimOntology {
        // T0 <- T1 <- T2
        let terms = vec![
            Term {
                id: TermId::from("T:0"),
                name: "root".into(),
                parents: vec![],
            },
            Term {
                id: TermId::from("T:1"),
                name: "middle".into(),
                parents: vec![TermId::from("T:0")],
            },
            Term {
                id: TermId::from("T:2"),
                name: "leaf".into(),
                parents: vec![TermId::from("T:1")],
            },
        ];
        SlimOntology::new(terms).expect("chain is valid")
    }

    fn annotation(item: &str, term: &str, frequency: Option<&str>) -> Annotation {
        Annotation {
            item: item.to_string(),
            term_id: TermId::from(term),
            frequency: frequency.map(str::to_string),
        }
    }

    #[test]
    fn from_tsv() -> Result<(), anyhow::Error> {
        let tsv = "# comment\nI0\tT:2\t50%\nI1\tT:1\nI0\tT:1\n";
        let container = AssociationContainer::from_tsv(std::io::Cursor::new(tsv))?;

        assert_eq!(container.len(), 2);
        let items = container.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
        assert_eq!(items, vec!["I0".to_string(), "I1".to_string()]);

        Ok(())
    }

    #[test]
    fn induced_terms_are_ancestor_closed() -> Result<(), anyhow::Error> {
        let slim = chain();
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", None),
            annotation("I1", "T:1", None),
        ]);

        let table = AnnotationTable::new(&slim, &container, false)?;
        assert_eq!(table.number_of_items(), 2);
        assert_eq!(table.direct_terms(0), &[2]);
        assert_eq!(table.induced_terms(0), &[0, 1, 2]);
        assert_eq!(table.direct_terms(1), &[1]);
        assert_eq!(table.induced_terms(1), &[0, 1]);

        Ok(())
    }

    #[test]
    fn frequency_order_is_ascending() -> Result<(), anyhow::Error> {
        let slim = chain();
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:0", Some("90%")),
            annotation("I0", "T:1", Some("10%")),
            annotation("I0", "T:2", None),
        ]);

        let table = AnnotationTable::new(&slim, &container, false)?;
        assert_eq!(table.direct_terms(0), &[0, 1, 2]);
        assert_eq!(table.term_frequencies(0), &[0.9, 0.1, 1.0]);
        assert_eq!(table.frequency_order(0), &[1, 0, 2]);
        assert!(table.has_explicit_frequency(0));

        Ok(())
    }

    #[test]
    fn frequency_filtering() -> Result<(), anyhow::Error> {
        let slim = chain();
        let container = AssociationContainer::from_records(vec![
            annotation("I0", "T:2", Some("50%")),
            annotation("I1", "T:1", None),
        ]);

        let table = AnnotationTable::new(&slim, &container, true)?;
        assert_eq!(table.number_of_items(), 1);
        assert_eq!(table.item_name(0), "I0");

        Ok(())
    }

    #[test]
    fn no_items_left_is_rejected() {
        let slim = chain();
        let container =
            AssociationContainer::from_records(vec![annotation("I0", "T:2", None)]);

        assert!(matches!(
            AnnotationTable::new(&slim, &container, true),
            Err(AnnotationError::NoItemsLeft)
        ));
    }

    #[test]
    fn unknown_term_is_rejected() {
        let slim = chain();
        let container =
            AssociationContainer::from_records(vec![annotation("I0", "T:9", None)]);

        assert!(matches!(
            AnnotationTable::new(&slim, &container, false),
            Err(AnnotationError::UnknownTerm { .. })
        ));
    }
}
