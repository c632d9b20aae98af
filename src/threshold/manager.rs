//! Threshold manager: composes an [`Adapter`], an [`Adviser`], and a
//! [`Surveyor`] (at most one of each per detector) around a detector's live
//! reporting threshold, per spec.md §4.5 and grounded in
//! `examples/original_source/src/score_mgr.c`.

use super::adapter::Adapter;
use super::adviser::Adviser;
use super::surveyor::{SurveyLine, Surveyor};

#[derive(Default)]
pub struct ThresholdManager {
    adapter: Option<Adapter>,
    adviser: Option<Adviser>,
    surveyor: Option<Surveyor>,
    threshold: f64,
}

impl ThresholdManager {
    /// `threshold` is the detector's configured (possibly fixed, possibly
    /// adapter-mode-4-seeded) starting value; negative disables reporting
    /// entirely until an adapter/adviser sets one.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    pub fn with_adapter(mut self, adapter: Adapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_adviser(mut self, adviser: Adviser) -> Self {
        self.adviser = Some(adviser);
        self
    }

    pub fn with_surveyor(mut self, surveyor: Surveyor) -> Self {
        self.surveyor = Some(surveyor);
        self
    }

    pub fn current_threshold(&self) -> f64 {
        self.threshold
    }

    /// `score_mgr_new_time`: advances every enabled helper. Returns
    /// `(threshold_changed, advising_completed, survey_lines)`.
    pub fn advance_time(&mut self, now: u64) -> (bool, bool, Vec<SurveyLine>) {
        let mut changed = false;
        if let Some(adapter) = &mut self.adapter {
            if let Some(new_thresh) = adapter.advance_time(now) {
                self.threshold = new_thresh;
                changed = true;
            }
        }
        let advising_completed = self
            .adviser
            .as_mut()
            .map(|a| a.advance_time(now))
            .unwrap_or(false);
        let survey_lines = self
            .surveyor
            .as_mut()
            .map(|s| s.advance_time(now))
            .unwrap_or_default();
        (changed, advising_completed, survey_lines)
    }

    /// `score_mgr_new_event`: `true` iff `score` exceeded the live threshold
    /// and the report callback should fire, per spec.md §4.5 `observe`.
    pub fn observe(&mut self, score: f64) -> bool {
        let exceeded = self.threshold >= 0.0 && score >= self.threshold;
        if let Some(adapter) = &mut self.adapter {
            adapter.new_score(score);
        }
        if let Some(adviser) = &mut self.adviser {
            adviser.new_score(score);
        }
        if let Some(surveyor) = &mut self.surveyor {
            surveyor.new_score(score);
        }
        exceeded
    }

    /// `score_mgr_file_print_log`'s adviser half: the suggested threshold
    /// and report rate, once the adviser has completed.
    pub fn adviser_advice(&self) -> Option<(f64, f64)> {
        self.adviser.as_ref().and_then(|a| a.advice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_fires_only_at_or_above_threshold() {
        let mut m = ThresholdManager::new(0.5);
        assert!(!m.observe(0.4));
        assert!(m.observe(0.5));
        assert!(m.observe(0.6));
    }

    #[test]
    fn negative_threshold_never_exceeds() {
        let mut m = ThresholdManager::new(-1.0);
        assert!(!m.observe(1000.0));
    }

    #[test]
    fn adapter_change_is_reported() {
        let mut m = ThresholdManager::new(0.5).with_adapter(Adapter::mode4(0.9, 10));
        let (changed, _, _) = m.advance_time(0);
        assert!(!changed);
        let (changed, _, _) = m.advance_time(11);
        assert!(changed);
        assert!((m.current_threshold() - 0.9).abs() < 1e-9);
    }
}
