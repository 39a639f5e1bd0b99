//! Stepwise enumeration of bounded-cardinality subsets.

/// Generates all subsets of `{0, .., n-1}` with cardinality at most `m`,
/// starting with the empty subset.  The total number of emitted subsets
/// is the sum of the binomial coefficients `C(n, 0) + .. + C(n, m)`.
///
/// The generator keeps a strictly increasing index prefix `j[0..r]` and
/// either extends it (append `j[r-1] + 1`), or reduces and increments the
/// new tail.  The enumeration order is relied upon by the diff-vector
/// precomputation, which records deltas between adjacent subsets.
pub struct SubsetGenerator {
    n: usize,
    m: usize,
    j: Vec<usize>,
    r: usize,
    first: bool,
    done: bool,
}

impl SubsetGenerator {
    pub fn new(n: usize, m: usize) -> Self {
        Self {
            n,
            m,
            j: vec![0; m],
            r: 0,
            first: true,
            done: false,
        }
    }
}

impl Iterator for SubsetGenerator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }

        if self.r == 0 {
            if self.first {
                self.first = false;
                return Some(Vec::new());
            }

            // No non-empty subsets exist for an empty set or m = 0.
            if self.n == 0 || self.m == 0 {
                self.done = true;
                return None;
            }

            self.j[0] = 0;
            self.r = 1;
            return Some(self.j[..1].to_vec());
        }

        if self.j[self.r - 1] < self.n - 1 && self.r < self.m {
            // Extend.
            self.j[self.r] = self.j[self.r - 1] + 1;
            self.r += 1;
        } else {
            // Reduce, then increment the new tail.
            if self.j[self.r - 1] >= self.n - 1 {
                self.r -= 1;
            }
            if self.r == 0 {
                self.done = true;
                return None;
            }
            self.j[self.r - 1] += 1;
        }

        Some(self.j[..self.r].to_vec())
    }
}
