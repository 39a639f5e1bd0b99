//! Approximated empirical distributions.

/// An empirical probability distribution approximated by equidistant
/// bins between the smallest and largest observation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApproximatedEmpiricalDistribution {
    min: f64,
    max: f64,
    cum_counts: Vec<u32>,
}

impl ApproximatedEmpiricalDistribution {
    /// Approximate the distribution of the given observations with the
    /// given number of bins.
    ///
    /// # Panics
    ///
    /// Panics if `observations` is empty or `number_of_bins` is zero.
    pub fn new(observations: &[f64], number_of_bins: usize) -> Self {
        assert!(!observations.is_empty());
        assert!(number_of_bins > 0);

        let mut sorted = observations.to_vec();
        sorted.sort_by(f64::total_cmp);
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];

        let mut counts = vec![0u32; number_of_bins];
        for &observation in &sorted {
            let bin = find_bin(min, max, number_of_bins, observation)
                .clamp(0, number_of_bins as i64 - 1) as usize;
            counts[bin] += 1;
        }
        for i in 1..number_of_bins {
            counts[i] += counts[i - 1];
        }

        Self {
            min,
            max,
            cum_counts: counts,
        }
    }

    fn find_bin(&self, x: f64) -> i64 {
        find_bin(self.min, self.max, self.cum_counts.len(), x)
    }

    fn total(&self) -> f64 {
        self.cum_counts[self.cum_counts.len() - 1] as f64
    }

    /// Distribution function `F(x) = P(X <= x)` (up to bin resolution).
    pub fn cdf(&self, x: f64) -> f64 {
        let bin = self.find_bin(x);
        if bin < 0 {
            0.0
        } else if bin >= self.cum_counts.len() as i64 {
            1.0
        } else {
            self.cum_counts[bin as usize] as f64 / self.total()
        }
    }

    /// Probability mass of the bin that `x` falls into.
    pub fn prob(&self, x: f64) -> f64 {
        let bin = self.find_bin(x);
        if bin <= 0 {
            return self.cdf(x);
        }
        let bin = (bin as usize).min(self.cum_counts.len() - 1);
        (self.cum_counts[bin] - self.cum_counts[bin - 1]) as f64 / self.total()
    }

    /// Upper-tail probability `P(X >= x)` (up to bin resolution).
    pub fn p_upper(&self, x: f64) -> f64 {
        1.0 - (self.cdf(x) - self.prob(x))
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

fn find_bin(min: f64, max: f64, number_of_bins: usize, x: f64) -> i64 {
    if max == min {
        // Degenerate distribution: everything sits in the first bin.
        return if x < min {
            -1
        } else if x > max {
            number_of_bins as i64
        } else {
            0
        };
    }
    ((x - min) / (max - min) * number_of_bins as f64).floor() as i64
}

#[cfg(test)]
mod test {
    use super::ApproximatedEmpiricalDistribution;

    #[test]
    fn cdf_of_uniform_observations() {
        let observations: Vec<f64> = (0..1000).map(|i| i as f64 / 1000.0).collect();
        let distribution = ApproximatedEmpiricalDistribution::new(&observations, 100);

        assert!(float_cmp::approx_eq!(f64, distribution.cdf(-1.0), 0.0, epsilon = 1e-12));
        assert!(float_cmp::approx_eq!(f64, distribution.cdf(2.0), 1.0, epsilon = 1e-12));
        assert!((distribution.cdf(0.5) - 0.5).abs() < 0.02);
    }

    #[test]
    fn p_upper_is_monotone() {
        let observations: Vec<f64> = (0..1000).map(|i| i as f64 / 1000.0).collect();
        let distribution = ApproximatedEmpiricalDistribution::new(&observations, 100);

        let p_low = distribution.p_upper(0.1);
        let p_high = distribution.p_upper(0.9);
        assert!(p_low > p_high);
        assert!(p_high > 0.0);
    }

    #[test]
    fn degenerate_distribution() {
        let distribution = ApproximatedEmpiricalDistribution::new(&[1.5, 1.5, 1.5], 10);

        assert!(float_cmp::approx_eq!(f64, distribution.cdf(1.0), 0.0, epsilon = 1e-12));
        assert!(float_cmp::approx_eq!(f64, distribution.cdf(1.5), 1.0, epsilon = 1e-12));
        assert!(float_cmp::approx_eq!(f64, distribution.p_upper(1.5), 1.0, epsilon = 1e-12));
    }

    #[test]
    fn serde_roundtrip() -> Result<(), anyhow::Error> {
        let distribution = ApproximatedEmpiricalDistribution::new(&[0.0, 0.5, 1.0], 4);
        let json = serde_json::to_string(&distribution)?;
        let back: ApproximatedEmpiricalDistribution = serde_json::from_str(&json)?;
        assert_eq!(distribution, back);

        Ok(())
    }
}
