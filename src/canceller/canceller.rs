use crate::arena::{Arena, Index};
use crate::port_status::PortStatus;

use super::hash::{hash1, hash2, LEVEL1_SIZE, LEVEL2_SIZE};

struct Entry<R> {
    sip: u32,
    sport: u32,
    dip: u32,
    dport: u32,
    portless: bool,
    insertion_second: u64,
    /// `None` once `note_response` has handled this entry; it stays in the
    /// arena and the time wheel until `advance_time` drains its bucket, per
    /// spec.md §4.4.
    report: Option<R>,
}

type EntryIdx<R> = Index<Entry<R>>;

/// A lazily-populated second-level hash table: 256 buckets of entry
/// indices, per `prc_lookup_table2` in
/// `examples/original_source/src/packet_resp_canceller.c`.
struct Level2<R> {
    buckets: Vec<Vec<EntryIdx<R>>>,
}

impl<R> Level2<R> {
    fn new() -> Self {
        Self {
            buckets: (0..LEVEL2_SIZE).map(|_| Vec::new()).collect(),
        }
    }
}

/// Delays tentative reports for a fixed window, canceling them if a later
/// packet implies a different port status before the window elapses
/// (spec.md §4.4). Grounded in
/// `examples/original_source/src/packet_resp_canceller.c`.
pub struct ResponseCanceller<R> {
    entries: Arena<Entry<R>>,
    level1: Vec<Option<Box<Level2<R>>>>,
    /// `wheel[s % wheel.len()]` holds every entry inserted in second `s`.
    wheel: Vec<Vec<EntryIdx<R>>>,
    last_timeout: u64,
    timeout_implication: PortStatus,
}

impl<R> ResponseCanceller<R> {
    /// `wait_secs` is the window `W`; the wheel holds `W + 1` buckets so a
    /// report inserted in the current second is never immediately expired.
    pub fn new(wait_secs: u64, timeout_implication: PortStatus) -> Self {
        Self {
            entries: Arena::new(),
            level1: (0..LEVEL1_SIZE).map(|_| None).collect(),
            wheel: (0..=wait_secs).map(|_| Vec::new()).collect(),
            last_timeout: 0,
            timeout_implication,
        }
    }

    fn hash_keys(sip: u32, sport: u32, dip: u32, dport: u32, portless: bool) -> (usize, usize) {
        let h1 = if portless { hash1(sip, dip) } else { hash1(sport, dport) };
        (h1, hash2(sip, dip))
    }

    /// spec.md §4.4 `add_report`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_report(&mut self, report: R, sip: u32, sport: u32, dip: u32, dport: u32, portless: bool, insertion_second: u64) {
        let (h1, h2) = Self::hash_keys(sip, sport, dip, dport, portless);
        let idx = self.entries.alloc(Entry {
            sip,
            sport,
            dip,
            dport,
            portless,
            insertion_second,
            report: Some(report),
        });
        self.level1[h1].get_or_insert_with(|| Box::new(Level2::new())).buckets[h2].push(idx);
        let slot = (insertion_second % self.wheel.len() as u64) as usize;
        self.wheel[slot].push(idx);
    }

    fn remove_from_hash_chain(&mut self, idx: EntryIdx<R>) {
        let entry = self.entries.get(idx);
        let (h1, h2) = Self::hash_keys(entry.sip, entry.sport, entry.dip, entry.dport, entry.portless);
        if let Some(level2) = self.level1[h1].as_mut() {
            level2.buckets[h2].retain(|&i| i != idx);
        }
    }

    /// spec.md §4.4 `note_response`: find every still-pending entry whose
    /// 4-tuple matches exactly, deliver `implied_status`, and detach it
    /// from the hash chain (it stays in the time wheel until drained).
    pub fn note_response(
        &mut self,
        implied_status: PortStatus,
        sip: u32,
        sport: u32,
        dip: u32,
        dport: u32,
        portless: bool,
        status_callback: &mut impl FnMut(R, PortStatus),
    ) {
        let (h1, h2) = Self::hash_keys(sip, sport, dip, dport, portless);
        let Some(level2) = self.level1[h1].as_mut() else {
            return;
        };
        let candidates: Vec<EntryIdx<R>> = level2.buckets[h2]
            .iter()
            .copied()
            .filter(|&idx| {
                let e = self.entries.get(idx);
                e.report.is_some() && e.sip == sip && e.dip == dip && e.sport == sport && e.dport == dport
            })
            .collect();
        for idx in candidates {
            self.remove_from_hash_chain(idx);
            let report = self.entries.get_mut(idx).report.take();
            if let Some(report) = report {
                status_callback(report, implied_status);
            }
        }
    }

    /// spec.md §4.4 `advance_time`: drain every bucket covering
    /// `(last_timeout, now]`, capped at `W + 1` buckets so a large clock
    /// jump doesn't walk buckets twice.
    pub fn advance_time(&mut self, now: u64, status_callback: &mut impl FnMut(R, PortStatus)) {
        let elapsed = now.saturating_sub(self.last_timeout).min(self.wheel.len() as u64);
        for i in 1..=elapsed {
            let slot = ((self.last_timeout + i) % self.wheel.len() as u64) as usize;
            let pending = std::mem::take(&mut self.wheel[slot]);
            for idx in pending {
                let still_linked = self.entries.get(idx).report.is_some();
                if still_linked {
                    self.remove_from_hash_chain(idx);
                }
                let entry = self.entries.free(idx);
                if let Some(report) = entry.report {
                    status_callback(report, self.timeout_implication);
                }
            }
        }
        self.last_timeout = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_response_cancels_before_timeout() {
        let mut c = ResponseCanceller::new(5, PortStatus::LikelyClosed);
        c.add_report(42u32, 10, 1234, 20, 80, false, 100);
        let mut delivered = Vec::new();
        let mut cb = |r: u32, s: PortStatus| delivered.push((r, s));
        c.note_response(PortStatus::Open, 10, 1234, 20, 80, false, &mut cb);
        assert_eq!(delivered, vec![(42, PortStatus::Open)]);
        c.advance_time(110, &mut cb);
        assert_eq!(delivered.len(), 1, "entry must not fire twice");
    }

    #[test]
    fn unanswered_report_times_out() {
        let mut c = ResponseCanceller::new(5, PortStatus::LikelyClosed);
        c.add_report(7u32, 10, 1234, 20, 80, false, 100);
        let mut delivered = Vec::new();
        let mut cb = |r: u32, s: PortStatus| delivered.push((r, s));
        c.advance_time(106, &mut cb);
        assert_eq!(delivered, vec![(7, PortStatus::LikelyClosed)]);
    }

    #[test]
    fn mismatched_4tuple_does_not_cancel() {
        let mut c = ResponseCanceller::new(5, PortStatus::LikelyClosed);
        c.add_report(1u32, 10, 1234, 20, 80, false, 100);
        let mut delivered = Vec::new();
        let mut cb = |r: u32, s: PortStatus| delivered.push((r, s));
        c.note_response(PortStatus::Open, 10, 1234, 20, 81, false, &mut cb);
        assert!(delivered.is_empty());
        c.advance_time(106, &mut cb);
        assert_eq!(delivered, vec![(1, PortStatus::LikelyClosed)]);
    }
}
