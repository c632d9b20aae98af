//! One-shot threshold adviser (spec.md §4.5 Adviser). Runs for a fixed
//! horizon, keeps the top `obs_size + 1` anomaly scores seen, then writes a
//! suggested threshold. Never touches the live threshold, unlike [`super::Adapter`].
//!
//! Grounded in `examples/original_source/src/thresh_adviser.c`'s
//! `top_anom_list`: an ascending-sorted list capped at `obs_size + 1`
//! entries, seeded with a single `0.0` so the suggestion is always
//! well-defined even with too few observations.

/// Ascending-sorted cap-list of the highest scores seen, per
/// `thresh_adviser_new_score`: bounded to `obs_size + 1` entries so the
/// smallest kept value is always the boundary of "top `obs_size`".
pub struct Adviser {
    obs_size: usize,
    obs_secs: u64,
    top: Vec<f64>,
    start_time: Option<u64>,
    done: bool,
}

impl Adviser {
    pub fn new(obs_size: usize, obs_secs: u64) -> Self {
        Self {
            obs_size,
            obs_secs,
            top: vec![0.0],
            start_time: None,
            done: false,
        }
    }

    /// `thresh_adviser_new_score`: insert in ascending order, keep at most
    /// `obs_size + 1` entries.
    pub fn new_score(&mut self, score: f64) {
        if self.done {
            return;
        }
        let cap = self.obs_size + 1;
        if self.top.len() < cap {
            let pos = self.top.partition_point(|&x| x < score);
            self.top.insert(pos, score);
        } else if score > self.top[0] {
            let pos = self.top[1..].partition_point(|&x| x < score) + 1;
            self.top.remove(0);
            self.top.insert(pos.saturating_sub(1), score);
        }
    }

    /// `thresh_adviser_new_time`: returns `true` the first time `now`
    /// crosses `obs_start_time + obs_secs`.
    pub fn advance_time(&mut self, now: u64) -> bool {
        if self.done {
            return false;
        }
        let start = *self.start_time.get_or_insert(now);
        if now > start + self.obs_secs {
            self.done = true;
            true
        } else {
            false
        }
    }

    /// `thresh_adviser_write_advice`: `None` if fewer than two scores were
    /// ever observed.
    pub fn advice(&self) -> Option<(f64, f64)> {
        if self.top.len() < 2 {
            return None;
        }
        let suggested = (self.top[0] + self.top[1]) / 2.0;
        let hours = self.obs_secs as f64 / 3600.0;
        let rate = if hours > 0.0 {
            self.top.len() as f64 / hours
        } else {
            0.0
        };
        Some((suggested, rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advice_is_mean_of_two_smallest_kept() {
        let mut a = Adviser::new(2, 3600);
        for s in [0.9, 0.8, 0.95] {
            a.new_score(s);
        }
        let (thresh, _rate) = a.advice().unwrap();
        assert!((thresh - (0.8 + 0.9) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn finishes_exactly_once_after_horizon() {
        let mut a = Adviser::new(10, 100);
        assert!(!a.advance_time(0));
        assert!(a.advance_time(101));
        assert!(!a.advance_time(200));
    }
}
