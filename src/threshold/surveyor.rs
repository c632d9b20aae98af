//! Score surveyor (spec.md §4.5 Surveyor). Writes one line per interval with
//! the period index, packet count, and the 50th/90th/99th percentile of
//! scores seen in that interval, using linear interpolation between
//! adjacent sorted scores.
//!
//! Grounded in `examples/original_source/src/anomscore_surveyer.c`'s
//! `survey_ostat`: position `= loc*(n) + (1-loc)` (1-indexed), but its
//! cursor walk lands one rank past that position's floor, interpolating
//! between that rank and the next using the position's fractional part.

/// One surveyed interval's summary line.
#[derive(Debug, Clone, Copy)]
pub struct SurveyLine {
    pub period: u64,
    pub packet_count: u64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

fn percentile(sorted: &[f64], loc: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let posnum = loc * sorted.len() as f64 + (1.0 - loc);
    // `survey_ostat`'s cursor walk lands one rank past `posnum`'s floor:
    // rank (1-indexed) = floor(posnum) + 1, capped at the list length.
    let rank = (posnum.floor() as usize + 1).min(sorted.len());
    let idx = rank - 1;
    let from_next = posnum - posnum.floor();
    if from_next == 0.0 || rank >= sorted.len() {
        sorted[idx]
    } else {
        sorted[idx] * (1.0 - from_next) + sorted[idx + 1] * from_next
    }
}

/// Periodically summarizes scores into percentile lines, per spec.md §4.5.
pub struct Surveyor {
    interval_secs: u64,
    period: u64,
    scores: Vec<f64>,
    packet_count: u64,
    interval_start: Option<u64>,
}

impl Surveyor {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            period: 1,
            scores: Vec::new(),
            packet_count: 0,
            interval_start: None,
        }
    }

    pub fn new_score(&mut self, score: f64) {
        let pos = self.scores.partition_point(|&x| x < score);
        self.scores.insert(pos, score);
        self.packet_count += 1;
    }

    /// `anomscore_surveyer_new_time`: may emit more than one line if `now`
    /// skips past several intervals at once.
    pub fn advance_time(&mut self, now: u64) -> Vec<SurveyLine> {
        let mut lines = Vec::new();
        loop {
            let start = match self.interval_start {
                None => {
                    self.interval_start = Some(now);
                    return lines;
                }
                Some(s) => s,
            };
            if now <= start + self.interval_secs {
                break;
            }
            lines.push(SurveyLine {
                period: self.period,
                packet_count: self.packet_count,
                p50: percentile(&self.scores, 0.5),
                p90: percentile(&self.scores, 0.9),
                p99: percentile(&self.scores, 0.99),
            });
            self.scores.clear();
            self.packet_count = 0;
            self.period += 1;
            self.interval_start = Some(start + self.interval_secs);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_three_lands_one_rank_past_the_floor() {
        let sorted = vec![1.0, 2.0, 3.0];
        assert!((percentile(&sorted, 0.5) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn median_of_four_interpolates_the_top_two_ranks() {
        let sorted = vec![10.0, 20.0, 30.0, 40.0];
        assert!((percentile(&sorted, 0.5) - 35.0).abs() < 1e-9);
    }

    #[test]
    fn emits_a_line_per_elapsed_interval() {
        let mut s = Surveyor::new(10);
        s.advance_time(0);
        s.new_score(1.0);
        s.new_score(2.0);
        let lines = s.advance_time(11);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].packet_count, 2);
    }
}
