//! Detector construction and the five built-in detection types (spec.md
//! §4.6, §6 "Detection types"), grounded in
//! `examples/original_source/src/netspade.c`'s `netspade_new_detector`.

use std::collections::BTreeMap;

use crate::classify;
use crate::condition::ConditionSet;
use crate::config::{
    ClosedDportConfig, CommonOptions, DeadDestConfig, HomenetSide, IcmpTypeMode, OddDportConfig, OddPortDestConfig, OddTypecodeConfig,
    TcpFlagMode, WireProtocol,
};
use crate::message::MsgCallback;
use crate::packet::Feature;
use crate::port_status::{PortStatus, PortStatusSet};
use crate::recorder::EventHandle;
use crate::score::{Mode, ScoreCalculator};
use crate::threshold::ThresholdManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionType {
    ClosedDport,
    OddTypecode,
    OddDport,
    OddPortDest,
    DeadDest,
}

impl DetectionType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "closed-dport" => Some(Self::ClosedDport),
            "odd-typecode" => Some(Self::OddTypecode),
            "odd-dport" => Some(Self::OddDport),
            "odd-port-dest" => Some(Self::OddPortDest),
            "dead-dest" => Some(Self::DeadDest),
            _ => None,
        }
    }
}

/// `IS_UNRCHTCP`/`IS_UNRCHUDP`/`IS_UNRCHICMP`, used by `cancel_closed_conds`
/// when a detector waits for an ICMP-unreachable echo of its own probe.
fn unreach_condition(protocol: WireProtocol) -> ConditionSet {
    match protocol {
        WireProtocol::Tcp => classify::IS_UNRCHTCP,
        WireProtocol::Udp => classify::IS_UNRCHUDP,
        WireProtocol::Icmp => classify::IS_UNRCHICMP,
    }
}

fn protocol_condition(protocol: WireProtocol) -> ConditionSet {
    match protocol {
        WireProtocol::Tcp => ConditionSet::EMPTY,
        WireProtocol::Udp => classify::IS_UDP,
        WireProtocol::Icmp => classify::IS_ICMP,
    }
}

fn tcp_flag_condition(mode: TcpFlagMode) -> ConditionSet {
    match mode {
        TcpFlagMode::SynOnly => classify::SYNONLY,
        TcpFlagMode::Weird => classify::WEIRDFLAGS,
        TcpFlagMode::SynAck => classify::SYNACK,
        TcpFlagMode::Established => classify::ESTFLAGS,
        TcpFlagMode::Teardown => classify::TEARDOWNFLAGS,
        TcpFlagMode::Setup => classify::SETUPFLAGS,
    }
}

fn icmp_type_condition(mode: IcmpTypeMode) -> ConditionSet {
    match mode {
        IcmpTypeMode::Any => classify::IS_ICMP,
        IcmpTypeMode::Err => classify::ICMPERR,
        IcmpTypeMode::NotErr => classify::ICMPNOTERR,
    }
}

fn homenet_condition(side: HomenetSide, in_bit: ConditionSet, not_in_bit: ConditionSet) -> ConditionSet {
    match side {
        HomenetSide::Any => ConditionSet::EMPTY,
        HomenetSide::Home => in_bit,
        HomenetSide::NotHome => not_in_bit,
    }
}

/// Flips `SIP_IN_HOMENET`/`DIP_IN_HOMENET` bits (and their negations) so a
/// cancelling packet, which travels in the opposite direction from the
/// packet that triggered scoring, is still matched against the same
/// home-network restriction. Grounded in `netspade.c`'s
/// `flipped_homenet_conds`.
fn flipped_homenet_conds(conds: ConditionSet) -> ConditionSet {
    let mut out = ConditionSet::EMPTY;
    if conds.contains(classify::SIP_IN_HOMENET) {
        out |= classify::DIP_IN_HOMENET;
    }
    if conds.contains(classify::SIP_NOT_IN_HOMENET) {
        out |= classify::DIP_NOT_IN_HOMENET;
    }
    if conds.contains(classify::DIP_IN_HOMENET) {
        out |= classify::SIP_IN_HOMENET;
    }
    if conds.contains(classify::DIP_NOT_IN_HOMENET) {
        out |= classify::SIP_NOT_IN_HOMENET;
    }
    out
}

/// The feature layout, cancellation wiring, and thresholding a detector
/// runs with. Owns one [`EventHandle`] into the engine's shared
/// [`crate::recorder::EventRecorder`] for its primary (scored) feature
/// list.
pub struct Detector {
    pub id: String,
    pub detect_type: DetectionType,
    pub store_conds: ConditionSet,
    pub scorecalc_conds: ConditionSet,
    pub cancel_open_conds: ConditionSet,
    pub cancel_closed_conds: ConditionSet,
    pub port_report_criteria: PortStatusSet,
    pub thresh_exc_port_impl: PortStatus,
    pub calculator: ScoreCalculator,
    pub handle: EventHandle,
    pub feats: Vec<u8>,
    pub wait: u64,
    pub canceller_timeout_implication: PortStatus,
    pub exclude_broadcast_dip: bool,
    pub threshold: ThresholdManager,
    pub xsips: Option<String>,
    pub xdips: Option<String>,
    pub xsports: Option<String>,
    pub xdports: Option<String>,
}

/// Everything [`Detector::compile`] needs beyond the option string itself:
/// a place to bind the detector's feature list into a table.
pub trait TableBinder {
    fn open(
        &mut self,
        feats: &[u8],
        feat_names: &[String],
        conditions: ConditionSet,
        scale_freq: u64,
        scale_factor: f64,
        prune_threshold: f64,
        calc_feats: Option<Vec<u8>>,
    ) -> EventHandle;
}

struct BuiltDetector {
    detect_type: DetectionType,
    feats: Vec<u8>,
    calc_feats: Option<Vec<u8>>,
    store_conds: ConditionSet,
    scorecalc_conds: ConditionSet,
    cancel_open_conds: ConditionSet,
    cancel_closed_conds: ConditionSet,
    thresh_exc_port_impl: PortStatus,
    port_report_criteria: PortStatusSet,
    calculator: ScoreCalculator,
    thresh: f64,
    wait: u64,
    exclude_broadcast_dip: bool,
    scale_freq_secs: u64,
    scale_factor: f64,
    scale_cutoff: f64,
    common: CommonOptions,
}

fn feature_names(feats: &[u8]) -> Vec<String> {
    const ALL: [Feature; 8] = [
        Feature::Sip,
        Feature::Dip,
        Feature::Sport,
        Feature::Dport,
        Feature::IpProto,
        Feature::TcpFlags,
        Feature::IcmpType,
        Feature::IcmpTypeCode,
    ];
    feats.iter().map(|&f| ALL[f as usize].name().to_string()).collect()
}

impl Detector {
    /// Parses `option_string`, resolves detection-type defaults, opens (or
    /// reuses) the backing probability table via `binder`, and returns a
    /// fully wired detector. Mirrors `netspade_new_detector`'s common tail
    /// (cancellation wiring, homenet-flip for cancel conditions, score
    /// calculator assembly) shared by every detection type.
    pub fn compile(option_string: &str, binder: &mut impl TableBinder, mut cb: Option<&mut MsgCallback<'_>>) -> Option<Self> {
        let map = crate::config::parse_option_string(option_string, cb.as_deref_mut());
        let type_str = map.get("type").map(String::as_str).unwrap_or("closed-dport");
        let detect_type = DetectionType::parse(type_str)?;

        let built = match detect_type {
            DetectionType::ClosedDport => build_closed_dport(&map, cb.as_deref_mut()),
            DetectionType::OddTypecode => build_odd_typecode(&map, cb.as_deref_mut()),
            DetectionType::OddDport => build_odd_dport(&map, cb.as_deref_mut()),
            DetectionType::OddPortDest => build_odd_port_dest(&map, cb.as_deref_mut()),
            DetectionType::DeadDest => build_dead_dest(&map, cb.as_deref_mut()),
        };

        let BuiltDetector {
            detect_type,
            feats,
            calc_feats,
            store_conds,
            scorecalc_conds,
            mut cancel_open_conds,
            mut cancel_closed_conds,
            thresh_exc_port_impl,
            mut port_report_criteria,
            calculator,
            thresh,
            wait,
            exclude_broadcast_dip,
            scale_freq_secs,
            scale_factor,
            scale_cutoff,
            common,
        } = built;

        let mut canceller_timeout_implication = PortStatus::Unknown;
        if wait > 0 && (cancel_open_conds.is_not_false() || cancel_closed_conds.is_not_false()) {
            let (timeout_impl, response_impl) = if cancel_closed_conds.is_not_false() {
                cancel_open_conds = ConditionSet::ALWAYS_FALSE;
                (PortStatus::Unknown, PortStatus::Closed)
            } else {
                cancel_closed_conds = ConditionSet::ALWAYS_FALSE;
                (PortStatus::LikelyClosed, PortStatus::Open)
            };
            canceller_timeout_implication = timeout_impl;
            port_report_criteria = PortStatusSet::just(timeout_impl).union(PortStatusSet::with_stronger(response_impl));
        } else {
            cancel_open_conds = ConditionSet::ALWAYS_FALSE;
            cancel_closed_conds = ConditionSet::ALWAYS_FALSE;
        }

        let cancel_homenet_conds = flipped_homenet_conds(scorecalc_conds);
        if cancel_open_conds.is_not_false() {
            cancel_open_conds |= cancel_homenet_conds;
        }
        if cancel_closed_conds.is_not_false() {
            cancel_closed_conds |= cancel_homenet_conds;
        }

        let handle = binder.open(&feats, &feature_names(&feats), store_conds, scale_freq_secs, scale_factor, scale_cutoff, calc_feats);

        let id = common.id.clone().unwrap_or_else(|| type_str.to_string());

        Some(Detector {
            id,
            detect_type,
            store_conds,
            scorecalc_conds,
            cancel_open_conds,
            cancel_closed_conds,
            port_report_criteria,
            thresh_exc_port_impl,
            calculator,
            handle,
            feats,
            wait,
            canceller_timeout_implication,
            exclude_broadcast_dip,
            threshold: ThresholdManager::new(thresh),
            xsips: common.xsips,
            xdips: common.xdips,
            xsports: common.xsports,
            xdports: common.xdports,
        })
    }
}

fn build_closed_dport(map: &BTreeMap<String, String>, cb: Option<&mut MsgCallback<'_>>) -> BuiltDetector {
    let cfg = ClosedDportConfig::parse(map, cb).expect("infallible");
    let all_feats = [Feature::Dip.id(), Feature::Dport.id(), Feature::Sip.id(), Feature::Sport.id()];
    let probmode = cfg.probmode.clamp(1, 3);
    let feats = all_feats[..(5 - probmode) as usize].to_vec();

    let mut store_conds = ConditionSet::EMPTY;
    let mut scorecalc_conds = ConditionSet::EMPTY;
    let mut cancel_open_conds = ConditionSet::ALWAYS_FALSE;
    let mut cancel_closed_conds = ConditionSet::ALWAYS_FALSE;

    let homenet_conds = homenet_condition(cfg.to, classify::DIP_IN_HOMENET, classify::DIP_NOT_IN_HOMENET);
    store_conds |= homenet_conds;
    scorecalc_conds |= homenet_conds;

    if cfg.protocol == WireProtocol::Udp {
        store_conds |= classify::IS_UDP;
        scorecalc_conds |= classify::IS_UDP;
        cancel_closed_conds = unreach_condition(WireProtocol::Udp);
    } else {
        store_conds |= classify::SYNONLY;
        match cfg.tcpflags {
            TcpFlagMode::Weird => {
                scorecalc_conds |= classify::WEIRDFLAGS;
            }
            TcpFlagMode::SynAck => {
                scorecalc_conds |= classify::SYNACK;
                cancel_closed_conds = classify::NORMAL_RST;
            }
            TcpFlagMode::Established => {
                scorecalc_conds |= classify::ESTFLAGS;
                cancel_closed_conds = classify::NORMAL_RST;
            }
            TcpFlagMode::Teardown => {
                scorecalc_conds |= classify::TEARDOWNFLAGS;
                cancel_closed_conds = classify::NORMAL_RST;
            }
            _ => {
                scorecalc_conds |= classify::SYNONLY;
                cancel_open_conds = classify::SYNACK;
            }
        }
    }

    let wait = if cfg.common.wait == 0 && matches!(cfg.tcpflags, TcpFlagMode::SynAck | TcpFlagMode::Established | TcpFlagMode::Teardown) {
        5
    } else {
        cfg.common.wait
    };

    let scale_freq_secs = cfg.common.scalefreq_secs.unwrap_or(240 * 60);
    let scale_factor = cfg.common.resolved_scalefactor(0.96409, scale_freq_secs);
    let scale_cutoff = cfg.common.scalecutoff.unwrap_or(0.18);

    let calculator = ScoreCalculator {
        mode: Mode::Single,
        cond_prefix_len: 0,
        raw_score: !cfg.relscore,
        relative_score: cfg.relscore,
        corrected_raw: cfg.corrscore,
        min_obs: (cfg.minobs > 0.0).then_some((0, cfg.minobs)),
        max_entropy: None,
    };

    BuiltDetector {
        detect_type: DetectionType::ClosedDport,
        feats,
        calc_feats: None,
        store_conds,
        scorecalc_conds,
        cancel_open_conds,
        cancel_closed_conds,
        thresh_exc_port_impl: PortStatus::ProbablyClosed,
        port_report_criteria: PortStatusSet::with_stronger(PortStatus::ProbablyClosed),
        calculator,
        thresh: cfg.thresh,
        wait,
        exclude_broadcast_dip: false,
        scale_freq_secs,
        scale_factor,
        scale_cutoff,
        common: cfg.common,
    }
}

fn build_odd_typecode(map: &BTreeMap<String, String>, cb: Option<&mut MsgCallback<'_>>) -> BuiltDetector {
    let cfg = OddTypecodeConfig::parse(map, cb);
    let feats = vec![Feature::IcmpTypeCode.id()];

    let homenet_conds = homenet_condition(cfg.to, classify::DIP_IN_HOMENET, classify::DIP_NOT_IN_HOMENET);
    let icmp_conds = icmp_type_condition(cfg.icmptype);

    let scale_freq_secs = cfg.common.scalefreq_secs.unwrap_or(240 * 60);
    let scale_factor = cfg.common.resolved_scalefactor(0.96409, scale_freq_secs);
    let scale_cutoff = cfg.common.scalecutoff.unwrap_or(0.18);

    let calculator = ScoreCalculator {
        mode: Mode::Single,
        cond_prefix_len: 0,
        raw_score: false,
        relative_score: true,
        corrected_raw: true,
        min_obs: Some((0, cfg.minobs)),
        max_entropy: None,
    };

    BuiltDetector {
        detect_type: DetectionType::OddTypecode,
        feats,
        calc_feats: None,
        store_conds: homenet_conds | icmp_conds,
        scorecalc_conds: homenet_conds | icmp_conds,
        cancel_open_conds: classify::ICMPNOTERR,
        cancel_closed_conds: ConditionSet::ALWAYS_FALSE,
        thresh_exc_port_impl: PortStatus::Unknown,
        port_report_criteria: PortStatusSet::with_stronger(PortStatus::Unknown),
        calculator,
        thresh: cfg.thresh,
        wait: cfg.common.wait,
        exclude_broadcast_dip: false,
        scale_freq_secs,
        scale_factor,
        scale_cutoff,
        common: cfg.common,
    }
}

fn build_odd_dport(map: &BTreeMap<String, String>, cb: Option<&mut MsgCallback<'_>>) -> BuiltDetector {
    let cfg = OddDportConfig::parse(map, cb);
    let feats = vec![Feature::Sip.id(), Feature::Dport.id()];

    let homenet_conds = homenet_condition(cfg.from, classify::SIP_IN_HOMENET, classify::SIP_NOT_IN_HOMENET);
    let mut store_conds = homenet_conds;
    let mut scorecalc_conds = homenet_conds;
    let mut cancel_open_conds = ConditionSet::ALWAYS_FALSE;
    let mut cancel_closed_conds = ConditionSet::ALWAYS_FALSE;

    if cfg.protocol == WireProtocol::Udp {
        store_conds |= classify::IS_UDP;
        scorecalc_conds |= classify::IS_UDP;
        cancel_closed_conds = unreach_condition(WireProtocol::Udp);
    } else {
        store_conds |= classify::SYNONLY;
        scorecalc_conds |= classify::SYNONLY;
        cancel_open_conds = classify::SYNACK;
    }

    let scale_freq_secs = cfg.common.scalefreq_secs.unwrap_or(240 * 60);
    let scale_factor = cfg.common.resolved_scalefactor(0.98363, scale_freq_secs);
    let scale_cutoff = cfg.common.scalecutoff.unwrap_or(0.18);
    let minobs = cfg.common.minobs_override.unwrap_or(600.0);

    let calculator = ScoreCalculator {
        mode: Mode::Single,
        cond_prefix_len: 1,
        raw_score: false,
        relative_score: true,
        corrected_raw: true,
        min_obs: Some((-1, minobs)),
        max_entropy: None,
    };

    BuiltDetector {
        detect_type: DetectionType::OddDport,
        feats,
        calc_feats: None,
        store_conds,
        scorecalc_conds,
        cancel_open_conds,
        cancel_closed_conds,
        thresh_exc_port_impl: PortStatus::Unknown,
        port_report_criteria: PortStatusSet::with_stronger(PortStatus::Unknown),
        calculator,
        thresh: cfg.thresh,
        wait: cfg.common.wait,
        exclude_broadcast_dip: false,
        scale_freq_secs,
        scale_factor,
        scale_cutoff,
        common: cfg.common,
    }
}

fn build_odd_port_dest(map: &BTreeMap<String, String>, cb: Option<&mut MsgCallback<'_>>) -> BuiltDetector {
    let cfg = OddPortDestConfig::parse(map, cb);
    let feats = vec![Feature::Sip.id(), Feature::Dport.id(), Feature::Dip.id()];

    let homenet_conds = homenet_condition(cfg.from, classify::SIP_IN_HOMENET, classify::SIP_NOT_IN_HOMENET);
    let mut store_conds = homenet_conds;
    let mut scorecalc_conds = homenet_conds;
    let mut cancel_open_conds = ConditionSet::ALWAYS_FALSE;
    let mut cancel_closed_conds = ConditionSet::ALWAYS_FALSE;

    if cfg.protocol == WireProtocol::Udp {
        store_conds |= classify::IS_UDP;
        scorecalc_conds |= classify::IS_UDP;
        cancel_closed_conds = unreach_condition(WireProtocol::Udp);
    } else {
        store_conds |= classify::SYNONLY;
        scorecalc_conds |= classify::SYNONLY;
        cancel_open_conds = classify::SYNACK;
    }

    let scale_freq_secs = cfg.common.scalefreq_secs.unwrap_or(90 * 60);
    let scale_factor = cfg.common.resolved_scalefactor(0.97957, scale_freq_secs);
    let scale_cutoff = cfg.common.scalecutoff.unwrap_or(0.25);
    let minobs = cfg.default_minobs(cfg.protocol);

    let calculator = ScoreCalculator {
        mode: Mode::Single,
        cond_prefix_len: 1,
        raw_score: false,
        relative_score: true,
        corrected_raw: true,
        min_obs: Some((-1, minobs)),
        max_entropy: Some((-1, cfg.maxentropy)),
    };

    BuiltDetector {
        detect_type: DetectionType::OddPortDest,
        feats,
        calc_feats: None,
        store_conds,
        scorecalc_conds,
        cancel_open_conds,
        cancel_closed_conds,
        thresh_exc_port_impl: PortStatus::Unknown,
        port_report_criteria: PortStatusSet::with_stronger(PortStatus::Unknown),
        calculator,
        thresh: cfg.thresh,
        wait: cfg.common.wait,
        exclude_broadcast_dip: false,
        scale_freq_secs,
        scale_factor,
        scale_cutoff,
        common: cfg.common,
    }
}

fn build_dead_dest(map: &BTreeMap<String, String>, cb: Option<&mut MsgCallback<'_>>) -> BuiltDetector {
    let cfg = DeadDestConfig::parse(map, cb);
    let feats = vec![Feature::Sip.id()];
    let calc_feats = vec![Feature::Dip.id()];

    let mut store_conds = classify::SIP_IN_HOMENET;
    let mut scorecalc_conds = classify::DIP_IN_HOMENET;
    let mut cancel_open_conds = ConditionSet::ALWAYS_FALSE;
    let cancel_closed_conds = ConditionSet::ALWAYS_FALSE;

    match cfg.protocol {
        WireProtocol::Udp => {
            scorecalc_conds |= classify::IS_UDP;
            cancel_open_conds = classify::IS_UDP;
        }
        WireProtocol::Icmp => {
            scorecalc_conds |= icmp_type_condition(cfg.icmptype);
            cancel_open_conds = classify::IS_ICMP;
        }
        WireProtocol::Tcp => {
            let flag_cond = tcp_flag_condition(cfg.tcpflags);
            scorecalc_conds |= flag_cond;
            store_conds |= classify::SYNONLY;
            cancel_open_conds = match cfg.tcpflags {
                TcpFlagMode::Weird => ConditionSet::ALWAYS_FALSE,
                _ => classify::IS_TCP,
            };
        }
    }

    let scale_freq_secs = cfg.common.scalefreq_secs.unwrap_or(60 * 60);
    let scale_factor = cfg.common.resolved_scalefactor(0.94387, scale_freq_secs);
    let scale_cutoff = cfg.common.scalecutoff.unwrap_or(0.25);
    let minobs = cfg.common.minobs_override.unwrap_or(2000.0);
    let wait = if cfg.common.wait == 0 { 2 } else { cfg.common.wait };

    let calculator = ScoreCalculator {
        mode: Mode::Single,
        cond_prefix_len: 0,
        raw_score: false,
        relative_score: true,
        corrected_raw: true,
        min_obs: Some((0, minobs)),
        max_entropy: None,
    };

    BuiltDetector {
        detect_type: DetectionType::DeadDest,
        feats,
        calc_feats: Some(calc_feats),
        store_conds,
        scorecalc_conds,
        cancel_open_conds,
        cancel_closed_conds,
        thresh_exc_port_impl: PortStatus::ProbablyClosed,
        port_report_criteria: PortStatusSet::with_stronger(PortStatus::ProbablyClosed),
        calculator,
        thresh: 1.0,
        wait,
        exclude_broadcast_dip: true,
        scale_freq_secs,
        scale_factor,
        scale_cutoff,
        common: cfg.common,
    }
}

impl TableBinder for crate::recorder::EventRecorder {
    fn open(
        &mut self,
        feats: &[u8],
        feat_names: &[String],
        conditions: ConditionSet,
        scale_freq: u64,
        scale_factor: f64,
        prune_threshold: f64,
        calc_feats: Option<Vec<u8>>,
    ) -> EventHandle {
        self.open_event_file(feats, feat_names, conditions, scale_freq, scale_factor, prune_threshold, false, calc_feats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::EventRecorder;

    #[test]
    fn closed_dport_default_has_no_canceller_when_wait_zero() {
        let mut rec = EventRecorder::new();
        let d = Detector::compile("type=closed-dport thresh=0 minobs=0 relscore=0 corrscore=1", &mut rec, None).unwrap();
        assert_eq!(d.wait, 0);
        assert!(d.port_report_criteria.contains(d.thresh_exc_port_impl));
    }

    #[test]
    fn closed_dport_synack_enables_a_five_second_wait() {
        let mut rec = EventRecorder::new();
        let d = Detector::compile("type=closed-dport wait=5 tcpflags=synonly", &mut rec, None).unwrap();
        assert_eq!(d.wait, 5);
        assert_eq!(d.cancel_open_conds, classify::SYNACK);
        assert!(d.port_report_criteria.contains(PortStatus::Open));
        assert!(d.port_report_criteria.contains(d.canceller_timeout_implication));
    }

    #[test]
    fn dead_dest_has_calc_feats_and_default_wait() {
        let mut rec = EventRecorder::new();
        let d = Detector::compile("type=dead-dest", &mut rec, None).unwrap();
        assert_eq!(d.wait, 2);
        assert_eq!(d.feats, vec![Feature::Sip.id()]);
    }

    #[test]
    fn unknown_type_returns_none() {
        let mut rec = EventRecorder::new();
        assert!(Detector::compile("type=not-a-real-type", &mut rec, None).is_none());
    }
}
