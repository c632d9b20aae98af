//! The packet condition classifier (spec.md §4.6): derives the bitset of
//! event conditions a packet satisfies from its decoded header fields.
//!
//! Grounded in `examples/original_source/src/netspade.c`'s packet-condition
//! block (`netspade_on_packet`, ~line 870-950). The original only computes
//! a condition if some table or detector currently needs it
//! (`conds_to_calc`); this always computes the full set, which is simpler
//! and behaviorally identical — a condition bit no manager or detector
//! references is harmless to compute and immediately discarded by
//! `all_of_in`/`any_of_in` checks downstream.

use crate::condition::ConditionSet;
use crate::homenet::HomeNet;
use crate::packet::{tcp_flags, Origin, Protocol, RawPacket};

pub const IS_TCP: ConditionSet = ConditionSet(1 << 0);
pub const IS_UDP: ConditionSet = ConditionSet(1 << 1);
pub const IS_ICMP: ConditionSet = ConditionSet(1 << 2);
pub const IS_UNRCHTCP: ConditionSet = ConditionSet(1 << 3);
pub const IS_UNRCHUDP: ConditionSet = ConditionSet(1 << 4);
pub const IS_UNRCHICMP: ConditionSet = ConditionSet(1 << 5);
pub const SYNONLY: ConditionSet = ConditionSet(1 << 6);
pub const NORMAL_RST: ConditionSet = ConditionSet(1 << 7);
pub const SYNACK: ConditionSet = ConditionSet(1 << 8);
pub const WEIRDFLAGS: ConditionSet = ConditionSet(1 << 9);
pub const SETUPFLAGS: ConditionSet = ConditionSet(1 << 10);
pub const ESTFLAGS: ConditionSet = ConditionSet(1 << 11);
pub const TEARDOWNFLAGS: ConditionSet = ConditionSet(1 << 12);
pub const ICMPERR: ConditionSet = ConditionSet(1 << 13);
pub const ICMPNOTERR: ConditionSet = ConditionSet(1 << 14);
pub const SIP_IN_HOMENET: ConditionSet = ConditionSet(1 << 15);
pub const SIP_NOT_IN_HOMENET: ConditionSet = ConditionSet(1 << 16);
pub const DIP_IN_HOMENET: ConditionSet = ConditionSet(1 << 17);
pub const DIP_NOT_IN_HOMENET: ConditionSet = ConditionSet(1 << 18);

use crate::condition::ConditionSet as CS;

/// Classifies the TCP flag byte's lower 6 bits into the SYN/ACK/RST
/// vocabulary of spec.md §4.6 ("TCP flag bits ... classified into
/// SYNONLY ..."). `flags` must already be masked to 6 bits.
fn classify_tcp_flags(flags: u8) -> ConditionSet {
    use tcp_flags::{ACK, FIN, RST, SYN};
    if flags == SYN {
        return SYNONLY;
    }
    if flags == (SYN | ACK) {
        return SYNACK;
    }

    let weird = if flags & (SYN | ACK | RST) == 0 {
        true
    } else if flags & ACK != 0 {
        let srf = flags & (SYN | FIN | RST);
        srf != 0 && srf != FIN && srf != RST
    } else {
        !(flags == FIN || flags == SYN || flags == RST)
    };
    if weird {
        return WEIRDFLAGS;
    }

    match flags & (SYN | FIN | RST) {
        0x00 => ESTFLAGS,
        v if v == SYN => SETUPFLAGS,
        v if v == FIN => TEARDOWNFLAGS,
        v if v == RST => NORMAL_RST | TEARDOWNFLAGS,
        _ => ConditionSet::EMPTY,
    }
}

/// Computes the full condition set a packet satisfies, per spec.md §4.6.
pub fn classify(raw: &RawPacket, origin: Origin, homenet: &HomeNet) -> ConditionSet {
    let mut conds = CS::EMPTY;

    match origin {
        Origin::EmbeddedInIcmpUnreach => {
            conds |= match raw.protocol {
                Protocol::Tcp => IS_UNRCHTCP,
                Protocol::Udp => IS_UNRCHUDP,
                Protocol::Icmp => IS_UNRCHICMP,
                Protocol::Other => CS::EMPTY,
            };
        }
        Origin::Top => match raw.protocol {
            Protocol::Tcp => {
                conds |= IS_TCP;
                conds |= classify_tcp_flags(raw.tcp_flags & tcp_flags::MASK);
            }
            Protocol::Udp => conds |= IS_UDP,
            Protocol::Icmp => {
                conds |= IS_ICMP;
                conds |= match raw.icmp_type {
                    3..=5 | 11 | 12 => ICMPERR,
                    _ => ICMPNOTERR,
                };
            }
            Protocol::Other => {}
        },
    }

    let (sip, dip) = match origin {
        Origin::Top => (raw.sip, raw.dip),
        Origin::EmbeddedInIcmpUnreach => (raw.dip, raw.sip),
    };
    conds |= if homenet.contains(sip) { SIP_IN_HOMENET } else { SIP_NOT_IN_HOMENET };
    conds |= if homenet.contains(dip) { DIP_IN_HOMENET } else { DIP_NOT_IN_HOMENET };

    conds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;

    fn tcp(flags: u8) -> RawPacket {
        RawPacket { sip: 1, dip: 2, sport: 3, dport: 4, protocol: Protocol::Tcp, tcp_flags: flags, icmp_type: 0, icmp_code: 0 }
    }

    #[test]
    fn lone_syn_is_synonly() {
        let c = classify(&tcp(tcp_flags::SYN), Origin::Top, &HomeNet::empty());
        assert!(c.contains(SYNONLY));
    }

    #[test]
    fn syn_ack_is_synack() {
        let c = classify(&tcp(tcp_flags::SYN | tcp_flags::ACK), Origin::Top, &HomeNet::empty());
        assert!(c.contains(SYNACK));
    }

    #[test]
    fn lone_rst_is_normal_rst_and_teardown() {
        let c = classify(&tcp(tcp_flags::RST), Origin::Top, &HomeNet::empty());
        assert!(c.contains(NORMAL_RST));
        assert!(c.contains(TEARDOWNFLAGS));
    }

    #[test]
    fn no_syn_ack_rst_is_weird() {
        let c = classify(&tcp(tcp_flags::PSH), Origin::Top, &HomeNet::empty());
        assert!(c.contains(WEIRDFLAGS));
    }

    #[test]
    fn ack_with_both_fin_and_rst_is_weird() {
        let c = classify(&tcp(tcp_flags::ACK | tcp_flags::FIN | tcp_flags::RST), Origin::Top, &HomeNet::empty());
        assert!(c.contains(WEIRDFLAGS));
    }

    #[test]
    fn ack_alone_is_established() {
        let c = classify(&tcp(tcp_flags::ACK), Origin::Top, &HomeNet::empty());
        assert!(c.contains(ESTFLAGS));
        assert!(!c.contains(WEIRDFLAGS));
    }

    #[test]
    fn icmp_type_3_is_err() {
        let raw = RawPacket { sip: 1, dip: 2, sport: 0, dport: 0, protocol: Protocol::Icmp, tcp_flags: 0, icmp_type: 3, icmp_code: 1 };
        let c = classify(&raw, Origin::Top, &HomeNet::empty());
        assert!(c.contains(ICMPERR));
    }

    #[test]
    fn empty_homenet_marks_everything_in_homenet() {
        let c = classify(&tcp(tcp_flags::SYN), Origin::Top, &HomeNet::empty());
        assert!(c.contains(SIP_IN_HOMENET));
        assert!(c.contains(DIP_IN_HOMENET));
    }
}
