use std::collections::VecDeque;

/// Resolves a target report count for the period that just elapsed.
/// `targetspec >= 1` is an absolute packets-per-hour rate scaled to the
/// period length; `targetspec < 1` is a fraction of the packets scored in
/// the *previous* period (spec.md §4.5 "Target specification"). Grounded in
/// `examples/original_source/src/thresh_adapter.c`'s `floor(0.5+...)`
/// rounding, which also guarantees at least one.
fn resolve_target(targetspec: f64, period_secs: u64, prev_period_scored: u64) -> usize {
    let raw = if targetspec >= 1.0 {
        targetspec * period_secs as f64 / 3600.0
    } else {
        prev_period_scored as f64 * targetspec
    };
    ((raw + 0.5).floor() as i64).max(1) as usize
}

/// Keeps the `k` largest values pushed to it, sorted descending. Mirrors
/// `adapt1_data.top_list`/`adapt3_data.anoms` in
/// `examples/original_source/src/thresh_adapter.c`, seeded with two zeros
/// so a period with too few observations still has a "bottom" and
/// "runner-up" to average.
fn push_capped_top(top: &mut Vec<f64>, cap: usize, value: f64) {
    let pos = top.partition_point(|&x| x > value);
    top.insert(pos, value);
    top.truncate(cap);
}

enum Mode {
    /// Mode 1: single sorted top list, EMA-blended with the prior threshold.
    TopAverage { target: usize, new_obs_weight: f64, top: Vec<f64> },
    /// Mode 2: short/medium/long period hierarchy.
    Hierarchy {
        targetspec: f64,
        ns: usize,
        nm: usize,
        nl: usize,
        current_short: Vec<f64>,
        short_history: VecDeque<Vec<f64>>,
        mid_history: VecDeque<f64>,
        long_history: VecDeque<f64>,
    },
    /// Mode 3: circular history of past periods' ideal thresholds.
    CircularMean { targetspec: f64, no: usize, current: Vec<f64>, history: VecDeque<f64> },
    /// Mode 4: one-shot fixed value.
    Fixed { thresh: f64 },
}

/// Periodically recomputes a detector's report threshold from recently
/// observed anomaly scores (spec.md §4.5 Adapter).
pub struct Adapter {
    mode: Mode,
    period_secs: u64,
    period_start: Option<u64>,
    scored_this_period: u64,
    prev_period_scored: u64,
    current_threshold: f64,
    done: bool,
}

impl Adapter {
    fn new(mode: Mode, period_secs: u64, initial_threshold: f64) -> Self {
        Self {
            mode,
            period_secs,
            period_start: None,
            scored_this_period: 0,
            prev_period_scored: 0,
            current_threshold: initial_threshold,
            done: false,
        }
    }

    pub fn mode1(target: usize, period_secs: u64, new_obs_weight: f64, initial_threshold: f64) -> Self {
        Self::new(
            Mode::TopAverage { target, new_obs_weight, top: vec![0.0, 0.0] },
            period_secs,
            initial_threshold,
        )
    }

    pub fn mode2(targetspec: f64, period_secs: u64, ns: usize, nm: usize, nl: usize, initial_threshold: f64) -> Self {
        Self::new(
            Mode::Hierarchy {
                targetspec,
                ns,
                nm,
                nl,
                current_short: Vec::new(),
                short_history: VecDeque::new(),
                mid_history: VecDeque::new(),
                long_history: VecDeque::new(),
            },
            period_secs,
            initial_threshold,
        )
    }

    pub fn mode3(targetspec: f64, period_secs: u64, no: usize, initial_threshold: f64) -> Self {
        Self::new(
            Mode::CircularMean { targetspec, no, current: Vec::new(), history: VecDeque::new() },
            period_secs,
            initial_threshold,
        )
    }

    pub fn mode4(thresh: f64, period_secs: u64) -> Self {
        Self::new(Mode::Fixed { thresh }, period_secs, thresh)
    }

    pub fn current_threshold(&self) -> f64 {
        self.current_threshold
    }

    /// spec.md §4.5 Adapter's implicit per-score accumulation (feeds the
    /// top lists/history that `advance_time` consolidates at period end).
    pub fn new_score(&mut self, score: f64) {
        self.scored_this_period += 1;
        match &mut self.mode {
            Mode::TopAverage { target, top, .. } => push_capped_top(top, *target + 1, score),
            Mode::Hierarchy { current_short, .. } => current_short.push(score),
            Mode::CircularMean { current, .. } => current.push(score),
            Mode::Fixed { .. } => {}
        }
    }

    /// spec.md §4.5 `advance_time`, specialized to the adapter: returns the
    /// freshly computed threshold once `period_secs` has elapsed since the
    /// last period boundary, else `None`.
    pub fn advance_time(&mut self, now: u64) -> Option<f64> {
        if self.done {
            return None;
        }
        let start = *self.period_start.get_or_insert(now);
        if now <= start + self.period_secs {
            return None;
        }
        let new_threshold = self.finish_period();
        self.prev_period_scored = self.scored_this_period;
        self.scored_this_period = 0;
        self.period_start = Some(start + self.period_secs);
        Some(new_threshold)
    }

    fn finish_period(&mut self) -> f64 {
        let period_secs = self.period_secs;
        let prev_period_scored = self.prev_period_scored;
        match &mut self.mode {
            Mode::Fixed { thresh } => {
                self.done = true;
                *thresh
            }
            Mode::TopAverage { new_obs_weight, top, .. } => {
                let avg = (top[0] + top[1]) / 2.0;
                self.current_threshold = (1.0 - *new_obs_weight) * self.current_threshold + *new_obs_weight * avg;
                top.clear();
                top.push(0.0);
                top.push(0.0);
                self.current_threshold
            }
            Mode::Hierarchy { targetspec, ns, nm, nl, current_short, short_history, mid_history, long_history } => {
                let target = resolve_target(*targetspec, period_secs, prev_period_scored);

                let mut finished = std::mem::take(current_short);
                finished.sort_by(|a, b| b.partial_cmp(a).unwrap());
                finished.truncate(target.max(1));
                short_history.push_back(finished);
                while short_history.len() > *ns {
                    short_history.pop_front();
                }

                let mut merged: Vec<f64> = short_history.iter().flatten().copied().collect();
                merged.sort_by(|a, b| b.partial_cmp(a).unwrap());
                let short_comp = merged.get(target.saturating_sub(1)).copied().unwrap_or(0.0);

                mid_history.push_back(short_comp);
                while mid_history.len() > *nm {
                    mid_history.pop_front();
                }
                let mid_comp = mid_history.iter().sum::<f64>() / mid_history.len() as f64;

                long_history.push_back(mid_comp);
                while long_history.len() > *nl {
                    long_history.pop_front();
                }
                let long_comp = long_history.iter().sum::<f64>() / long_history.len() as f64;

                let (sum, count) = if long_history.len() == *nl {
                    (short_comp + mid_comp + long_comp, 3.0)
                } else if mid_history.len() == *nm {
                    (short_comp + mid_comp, 2.0)
                } else {
                    (short_comp, 1.0)
                };
                self.current_threshold = sum / count;
                self.current_threshold
            }
            Mode::CircularMean { targetspec, no, current, history } => {
                let target = resolve_target(*targetspec, period_secs, prev_period_scored);
                let mut finished = std::mem::take(current);
                finished.sort_by(|a, b| b.partial_cmp(a).unwrap());
                let ideal = finished.get(target.saturating_sub(1)).copied().unwrap_or(0.0);
                history.push_back(ideal);
                while history.len() > *no {
                    history.pop_front();
                }
                self.current_threshold = history.iter().sum::<f64>() / history.len() as f64;
                self.current_threshold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode1_blends_old_threshold_with_top_pair_average() {
        let mut a = Adapter::mode1(1, 100, 0.5, 0.5);
        a.advance_time(0);
        a.new_score(0.9);
        a.new_score(0.8);
        a.new_score(0.1);
        let new = a.advance_time(101).unwrap();
        assert!((new - (0.5 * 0.5 + 0.5 * 0.85)).abs() < 1e-9);
    }

    #[test]
    fn mode4_fires_once_then_stops() {
        let mut a = Adapter::mode4(0.95, 60);
        a.advance_time(0);
        assert_eq!(a.advance_time(61), Some(0.95));
        assert_eq!(a.advance_time(1000), None);
    }

    #[test]
    fn mode3_threshold_is_mean_of_history() {
        let mut a = Adapter::mode3(2.0, 60, 3, 0.0);
        a.advance_time(0);
        for s in [1.0, 2.0, 3.0] {
            a.new_score(s);
        }
        let t1 = a.advance_time(61).unwrap();
        assert!(t1 > 0.0);
    }
}
