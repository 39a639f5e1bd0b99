//! Minimal adaptor for reading term definitions from OBO files.
//!
//! Only the fields needed to build the slim view are extracted: term
//! identifier, name, and `is_a` parents.  Obsolete terms are skipped.

use std::io::BufRead;
use std::path::Path;

use crate::common::open_read_maybe_gz;
use crate::ontology::{Term, TermId};

/// Read term definitions from the OBO file at the given path
/// (transparently ungzipping `.gz` files).
pub fn read_obo_file<P>(path: P) -> Result<Vec<Term>, anyhow::Error>
where
    P: AsRef<Path>,
{
    read_obo(open_read_maybe_gz(path)?)
}

/// Read term definitions from an OBO-formatted reader.
pub fn read_obo<R: BufRead>(reader: R) -> Result<Vec<Term>, anyhow::Error> {
    let mut terms = Vec::new();

    let mut in_term = false;
    let mut id: Option<TermId> = None;
    let mut name: Option<String> = None;
    let mut parents: Vec<TermId> = Vec::new();
    let mut obsolete = false;

    let flush = |id: &mut Option<TermId>,
                     name: &mut Option<String>,
                     parents: &mut Vec<TermId>,
                     obsolete: &mut bool,
                     terms: &mut Vec<Term>|
     -> Result<(), anyhow::Error> {
        if let Some(id) = id.take() {
            if !*obsolete {
                terms.push(Term {
                    name: name
                        .take()
                        .ok_or_else(|| anyhow::anyhow!("term {} has no name", &id))?,
                    id,
                    parents: std::mem::take(parents),
                });
            }
        }
        name.take();
        parents.clear();
        *obsolete = false;
        Ok(())
    };

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();

        if line.starts_with('[') {
            flush(&mut id, &mut name, &mut parents, &mut obsolete, &mut terms)?;
            in_term = line == "[Term]";
            continue;
        }
        if !in_term || line.is_empty() {
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim();
            match key {
                "id" => id = Some(TermId::from(value)),
                "name" => name = Some(value.to_string()),
                "is_a" => {
                    // Strip the optional `! label` comment.
                    let target = value.split('!').next().unwrap_or_default().trim();
                    if !target.is_empty() {
                        parents.push(TermId::from(target));
                    }
                }
                "is_obsolete" => obsolete = value == "true",
                _ => (),
            }
        }
    }
    flush(&mut id, &mut name, &mut parents, &mut obsolete, &mut terms)?;

    Ok(terms)
}
