//! Belief about a destination port's open/closed status, and sets of such
//! beliefs (spec.md §4.6, §9 "Port-status lattice").
//!
//! Grounded in `examples/original_source/src/spade_report.h`'s
//! `port_status_t`/`port_status_set_t`: status values double as bit
//! positions in a 12-bit set, with `PORT_UNKNOWN` (0) treated as "every
//! belief at all" by `with_stronger`.

/// One point in the `{open, closed} x {probably, likely, definitely}`
/// lattice, plus `Unknown`. The discriminants match the original bit
/// positions exactly: [`PortStatusSet`] relies on `1 << status as u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PortStatus {
    Unknown = 0,
    ProbablyOpen = 4,
    LikelyOpen = 5,
    Open = 6,
    ProbablyClosed = 8,
    LikelyClosed = 9,
    Closed = 10,
}

const STRENGTH_MASK: u16 = 0x3;
const PROBABLY: u16 = 0;
const LIKELY: u16 = 1;
const DEFINITE: u16 = 2;

impl PortStatus {
    fn strength(self) -> u16 {
        (self as u16) & STRENGTH_MASK
    }

    fn base(self) -> u16 {
        (self as u16) & !STRENGTH_MASK
    }

    fn at_strength(base: u16, strength: u16) -> PortStatus {
        match base | strength {
            0 => PortStatus::Unknown,
            4 => PortStatus::ProbablyOpen,
            5 => PortStatus::LikelyOpen,
            6 => PortStatus::Open,
            8 => PortStatus::ProbablyClosed,
            9 => PortStatus::LikelyClosed,
            10 => PortStatus::Closed,
            other => unreachable!("not a valid port_status_t bit pattern: {other}"),
        }
    }
}

/// A 12-bit bitset of [`PortStatus`] values, one bit per status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatusSet(u16);

impl PortStatusSet {
    pub const EMPTY: PortStatusSet = PortStatusSet(0);

    pub fn just(status: PortStatus) -> PortStatusSet {
        PortStatusSet(1 << status as u16)
    }

    /// `status` and every belief at least as strong in the same direction
    /// (open or closed); `Unknown` matches every status.
    pub fn with_stronger(status: PortStatus) -> PortStatusSet {
        if status == PortStatus::Unknown {
            return PortStatusSet(0xFFF);
        }
        let mut set = Self::just(status).0;
        if status.strength() < LIKELY {
            set |= Self::just(PortStatus::at_strength(status.base(), LIKELY)).0;
        }
        if status.strength() < DEFINITE {
            set |= Self::just(PortStatus::at_strength(status.base(), DEFINITE)).0;
        }
        PortStatusSet(set)
    }

    pub fn add(&mut self, status: PortStatus) {
        self.0 |= Self::just(status).0;
    }

    pub fn union(self, other: PortStatusSet) -> PortStatusSet {
        PortStatusSet(self.0 | other.0)
    }

    pub fn contains(self, status: PortStatus) -> bool {
        self.0 & Self::just(status).0 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_stronger_includes_likely_and_definite() {
        let set = PortStatusSet::with_stronger(PortStatus::ProbablyOpen);
        assert!(set.contains(PortStatus::ProbablyOpen));
        assert!(set.contains(PortStatus::LikelyOpen));
        assert!(set.contains(PortStatus::Open));
        assert!(!set.contains(PortStatus::ProbablyClosed));
    }

    #[test]
    fn definite_belief_has_no_stronger_beliefs() {
        let set = PortStatusSet::with_stronger(PortStatus::Closed);
        assert_eq!(set, PortStatusSet::just(PortStatus::Closed));
    }

    #[test]
    fn unknown_matches_every_status() {
        let set = PortStatusSet::with_stronger(PortStatus::Unknown);
        assert!(set.contains(PortStatus::Open));
        assert!(set.contains(PortStatus::Closed));
    }
}
