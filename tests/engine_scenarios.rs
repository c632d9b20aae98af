//! End-to-end scenarios from spec.md §8 that exercise only the public
//! `Engine` API, the way a host program would. Scenarios 1 and 2 already
//! have near-identical coverage as inline unit tests in `src/engine.rs`;
//! this file covers the ones that need a full engine-level checkpoint
//! round trip or a timeout that inline tests don't reach.

use spade_engine::engine::{Engine, ReportInfo};
use spade_engine::packet::{tcp_flags, Origin, Protocol, RawPacket};
use spade_engine::port_status::PortStatus;

fn tcp_syn(sip: u32, dip: u32, sport: u32, dport: u32) -> RawPacket {
    RawPacket {
        sip,
        dip,
        sport,
        dport,
        protocol: Protocol::Tcp,
        tcp_flags: tcp_flags::SYN,
        icmp_type: 0,
        icmp_code: 0,
    }
}

const CLOSED_DPORT_OPTS: &str = "type=closed-dport wait=5 tcpflags=synonly thresh=0.0 minobs=0 relscore=0 corrscore=1";

/// Scenario 3: no SYN-ACK ever arrives, so the canceller must deliver the
/// timeout implication (`PORT_LIKELYCLOSED`) exactly once at `wait+1`
/// seconds, not before.
#[test]
fn canceller_timeout_reports_likely_closed_once() {
    let mut engine: Engine<u32> = Engine::new(0, None);
    let reports = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let reports_cb = reports.clone();
    engine.set_callbacks(
        Some(Box::new(move |r: &ReportInfo<'_, u32>| reports_cb.borrow_mut().push((*r.native, r.port_status)))),
        None,
        Some(Box::new(|n: &u32| *n)),
        None,
    );
    engine.new_detector(CLOSED_DPORT_OPTS).unwrap();

    for t in 0..50u64 {
        engine.on_packet(t, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1024 + t as u32, 80), &(t as u32));
    }
    engine.on_packet(100, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 9999, 81), &9999);

    assert!(reports.borrow().is_empty(), "must not report before the timeout elapses");

    engine.on_packet(105, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1025, 80), &0);
    assert!(reports.borrow().is_empty(), "must not report at wait seconds, only after wait+1");

    engine.on_packet(106, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1026, 80), &0);

    let got = reports.borrow();
    let matches: Vec<_> = got.iter().filter(|&&(n, _)| n == 9999).collect();
    assert_eq!(matches.len(), 1, "exactly one callback for the parked report");
    assert_eq!(matches[0].1, PortStatus::LikelyClosed);
}

/// Scenario 6: checkpointing after the 1000th packet and recovering into a
/// fresh engine must reproduce the 1001st packet's score exactly, since the
/// restored table holds the same counts the original would have carried
/// forward.
#[test]
fn checkpoint_round_trip_preserves_the_next_packets_score() {
    const OPTS: &str = "type=closed-dport thresh=0.0 minobs=0 relscore=0 corrscore=1";

    let mut baseline: Engine<u32> = Engine::new(0, None);
    baseline.set_homenet_from_str("").unwrap();
    baseline.new_detector(OPTS).unwrap();
    let baseline_scores = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let cb_scores = baseline_scores.clone();
    baseline.set_callbacks(
        Some(Box::new(move |r: &ReportInfo<'_, u32>| cb_scores.borrow_mut().push(r.score))),
        None,
        None,
        None,
    );
    for i in 0..1000u32 {
        baseline.on_packet(i as u64, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1024 + i, 80), &i);
    }
    baseline.on_packet(1000, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 2024, 81), &2024);
    let baseline_score = *baseline_scores.borrow().last().expect("baseline must have scored the 1001st packet");

    let dir = std::env::temp_dir();
    let path = dir.join(format!("spade-engine-checkpoint-test-{}.bin", std::process::id()));

    let mut checkpointed: Engine<u32> = Engine::new(0, None);
    checkpointed.set_homenet_from_str("").unwrap();
    checkpointed.new_detector(OPTS).unwrap();
    checkpointed.set_checkpointing(path.clone(), 1000);
    for i in 0..1000u32 {
        checkpointed.on_packet(i as u64, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1024 + i, 80), &i);
    }

    let mut recovered: Engine<u32> = Engine::new_from_statefile(&path, 0, None);
    std::fs::remove_file(&path).ok();
    recovered.set_homenet_from_str("").unwrap();
    recovered.new_detector(OPTS).unwrap();
    let recovered_scores = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let cb_recovered = recovered_scores.clone();
    recovered.set_callbacks(
        Some(Box::new(move |r: &ReportInfo<'_, u32>| cb_recovered.borrow_mut().push(r.score))),
        None,
        None,
        None,
    );
    recovered.on_packet(1000, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 2024, 81), &2024);
    let recovered_score = *recovered_scores.borrow().last().expect("recovered engine must have scored the 1001st packet");

    assert!((baseline_score - recovered_score).abs() < 1e-12);
}

/// An excluded destination port must never reach the report callback, even
/// though the same packet would otherwise exceed the threshold.
#[test]
fn excluded_destination_port_never_reports() {
    let mut engine: Engine<()> = Engine::new(0, None);
    engine.set_homenet_from_str("").unwrap();
    engine
        .new_detector("type=closed-dport thresh=0.0 minobs=0 relscore=0 corrscore=1 xdports=81")
        .unwrap();

    for i in 0..1000u32 {
        engine.on_packet(i as u64, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1024 + i, 80), &());
    }

    let reports = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let reports_cb = reports.clone();
    engine.set_callbacks(
        Some(Box::new(move |r: &ReportInfo<'_, ()>| reports_cb.borrow_mut().push(r.score))),
        None,
        None,
        None,
    );
    engine.on_packet(1000, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 2024, 81), &());

    assert!(reports.borrow().is_empty(), "excluded port must never produce a report");
}
