use crate::prob_table::{ProbabilityTable, Value};

/// Whether this calculator scores one feature list against its own
/// conditioning prefix, or multiplies the unconditioned probabilities of
/// several independent feature lists (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    Product,
}

/// One table's worth of input to a scoring pass: the probability table to
/// query, the feature ids in the order the table was recorded with, and the
/// observed values for those features.
pub struct ScoreInput<'a> {
    pub table: &'a mut ProbabilityTable,
    pub feats: &'a [u8],
    pub vals: &'a [Value],
}

/// Result of one `score` call. `preferred` is whichever of `raw`/`relative`
/// the threshold manager should compare against, chosen by which score
/// flavor was actually requested.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInfo {
    pub raw: Option<f64>,
    pub relative: Option<f64>,
    pub preferred: f64,
}

/// Resolves a "prefix length" option that may be negative (counted back
/// from the end of the feature list), per spec.md §4.3.
fn resolve_prefix(raw: i64, len: usize) -> usize {
    if raw >= 0 {
        raw as usize
    } else {
        (len as i64 + raw).max(0) as usize
    }
}

/// Configured once per detector, drives `score` on every packet the
/// detector's scoring conditions admit (spec.md §4.3).
pub struct ScoreCalculator {
    pub mode: Mode,
    /// Conditioning prefix length for single-probability mode. Negative
    /// counts back from the end of the feature list.
    pub cond_prefix_len: i64,
    pub raw_score: bool,
    pub relative_score: bool,
    /// Picks the `-log2(p)` formula over the legacy `-log(p/ln2)` one for
    /// the raw score (spec.md §4.3 step 4).
    pub corrected_raw: bool,
    /// `(prefix_len, min_count)`: below this observed count at the given
    /// prefix, the event is unscoreable.
    pub min_obs: Option<(i64, f64)>,
    /// `(prefix_len, max_entropy)`: above this entropy at the given prefix,
    /// the event is scored but never anomalous.
    pub max_entropy: Option<(i64, f64)>,
}

impl ScoreCalculator {
    /// `score(event) -> (score_info?, enough_obs?)` per spec.md §4.3.
    /// `inputs` holds one entry in single-probability mode, or one per
    /// product-mode feature list.
    pub fn score(&self, inputs: &mut [ScoreInput<'_>]) -> (Option<ScoreInfo>, bool) {
        match self.mode {
            Mode::Single => {
                let input = inputs.first_mut().expect("single mode needs exactly one input");
                self.score_single(input)
            }
            Mode::Product => {
                if inputs.is_empty() {
                    return (None, false);
                }
                (Some(self.score_product(inputs)), true)
            }
        }
    }

    fn score_single(&self, input: &mut ScoreInput<'_>) -> (Option<ScoreInfo>, bool) {
        let ScoreInput { table, feats, vals } = input;

        if let Some((prefix_raw, min_count)) = self.min_obs {
            let p = resolve_prefix(prefix_raw, feats.len());
            if table.count(feats, vals, p) + 1.0 < min_count {
                return (None, false);
            }
        }
        if let Some((prefix_raw, max_h)) = self.max_entropy {
            let p = resolve_prefix(prefix_raw, feats.len());
            if table.entropy(feats, vals, p) > max_h {
                return (None, true);
            }
        }

        let cond_len = resolve_prefix(self.cond_prefix_len, feats.len());
        let p = table.probability_plus_one(feats, vals, cond_len);

        let raw = self.raw_score.then(|| {
            if self.corrected_raw {
                -p.log2()
            } else {
                -(p / std::f64::consts::LN_2).ln()
            }
        });
        let relative = self.relative_score.then(|| {
            let b = table.count(feats, vals, cond_len) + 1.0;
            p.ln() / (1.0 / b).ln()
        });

        let preferred = relative.or(raw).unwrap_or(p);
        (Some(ScoreInfo { raw, relative, preferred }), true)
    }

    fn score_product(&self, inputs: &mut [ScoreInput<'_>]) -> ScoreInfo {
        let product: f64 = inputs
            .iter_mut()
            .map(|input| {
                let prefix = resolve_prefix(-1, input.feats.len());
                input.table.probability_plus_one(input.feats, input.vals, prefix)
            })
            .product();
        let raw = -product.log2();
        ScoreInfo { raw: Some(raw), relative: None, preferred: raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefix_counts_back_from_the_end() {
        assert_eq!(resolve_prefix(-1, 1), 0);
        assert_eq!(resolve_prefix(-1, 3), 2);
        assert_eq!(resolve_prefix(1, 3), 1);
    }

    #[test]
    fn below_min_observation_count_is_unscoreable() {
        let mut table = ProbabilityTable::new();
        table.record(&[0], &[1]);
        let calc = ScoreCalculator {
            mode: Mode::Single,
            cond_prefix_len: 0,
            raw_score: true,
            relative_score: false,
            corrected_raw: true,
            min_obs: Some((0, 10.0)),
            max_entropy: None,
        };
        let feats = [0u8];
        let vals = [1u32];
        let mut inputs = [ScoreInput { table: &mut table, feats: &feats, vals: &vals }];
        let (info, enough) = calc.score(&mut inputs);
        assert!(info.is_none());
        assert!(!enough);
    }

    #[test]
    fn raw_score_is_nonnegative_for_a_well_observed_value() {
        let mut table = ProbabilityTable::new();
        for _ in 0..100 {
            table.record(&[0], &[1]);
        }
        let calc = ScoreCalculator {
            mode: Mode::Single,
            cond_prefix_len: 0,
            raw_score: true,
            relative_score: false,
            corrected_raw: true,
            min_obs: None,
            max_entropy: None,
        };
        let feats = [0u8];
        let vals = [1u32];
        let mut inputs = [ScoreInput { table: &mut table, feats: &feats, vals: &vals }];
        let (info, enough) = calc.score(&mut inputs);
        assert!(enough);
        assert!(info.unwrap().raw.unwrap() >= 0.0);
    }

    #[test]
    fn product_mode_multiplies_unconditioned_probabilities() {
        let mut t1 = ProbabilityTable::new();
        let mut t2 = ProbabilityTable::new();
        t1.record(&[0], &[5]);
        t2.record(&[1], &[9]);
        let calc = ScoreCalculator {
            mode: Mode::Product,
            cond_prefix_len: 0,
            raw_score: false,
            relative_score: false,
            corrected_raw: true,
            min_obs: None,
            max_entropy: None,
        };
        let f1 = [0u8];
        let v1 = [5u32];
        let f2 = [1u8];
        let v2 = [9u32];
        let mut inputs = [
            ScoreInput { table: &mut t1, feats: &f1, vals: &v1 },
            ScoreInput { table: &mut t2, feats: &f2, vals: &v2 },
        ];
        let (info, enough) = calc.score(&mut inputs);
        assert!(enough);
        assert!(info.is_some());
    }
}
