//! The engine: wires a home network, global exclusions, a shared event
//! recorder, and a set of detectors around the per-packet hot path
//! (spec.md §4.6, §5, §6). Grounded in `netspade_new_pkt` in
//! `examples/original_source/src/netspade.c`.

use std::path::{Path, PathBuf};

use crate::checkpoint;
use crate::condition::ConditionSet;
use crate::detector::Detector;
use crate::error::{MessageLevel, SpadeResult};
use crate::homenet::{ExclusionList, HomeNet};
use crate::message::{self, Message};
use crate::packet::{Origin, PacketEvent, Protocol, RawPacket};
use crate::port_status::PortStatus;
use crate::recorder::EventRecorder;
use crate::score::ScoreInput;
use crate::threshold::Adapter;
use crate::threshold::{Adviser, Surveyor};
use crate::canceller::ResponseCanceller;

/// A report handed to the host, either immediately or once a cancellation
/// window confirms/denies it (spec.md §4.6).
pub struct ReportInfo<'a, N> {
    pub detector_id: &'a str,
    pub time_seconds: u64,
    pub score: f64,
    pub port_status: PortStatus,
    pub native: &'a N,
}

pub type ReportCallback<N> = dyn for<'a> FnMut(&ReportInfo<'a, N>);
pub type ThresholdChangedCallback = dyn FnMut(&str, f64);
pub type NativeCopier<N> = dyn Fn(&N) -> N;
pub type NativeFreer<N> = dyn FnMut(N);

/// What [`Engine::write_log`] includes beyond the packet/detector counts it
/// always logs, per spec.md §6 `engine_set_output_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    pub entropy: bool,
    pub uncond_prob: bool,
    pub cond_prob: bool,
}

/// A report parked in a detector's canceller, awaiting confirmation, denial,
/// or timeout. Holds an owned copy of the host's native packet handle since
/// the borrow the triggering `on_packet` call received does not outlive it.
struct PendingReport<N> {
    time_seconds: u64,
    score: f64,
    native: N,
}

struct DetectorSlot<N> {
    detector: Detector,
    canceller: Option<ResponseCanceller<PendingReport<N>>>,
    exclusions: ExclusionList,
}

fn own_tuple(raw: &RawPacket, origin: Origin) -> (u32, u32, u32, u32, bool) {
    let portless = !matches!(raw.protocol, Protocol::Tcp | Protocol::Udp);
    match origin {
        Origin::Top => (raw.sip, raw.sport, raw.dip, raw.dport, portless),
        Origin::EmbeddedInIcmpUnreach => (raw.dip, raw.dport, raw.sip, raw.sport, portless),
    }
}

/// Owns every detector, the shared event recorder, and the home-network /
/// exclusion configuration around them. `N` is the host's opaque per-packet
/// handle, only ever copied (via `native_copier`) or freed (via
/// `native_freer`) — the engine never inspects it.
pub struct Engine<N: 'static> {
    recorder: EventRecorder,
    detectors: Vec<DetectorSlot<N>>,
    homenet: HomeNet,
    global_exclusions: ExclusionList,
    total_packets: u64,
    last_time: Option<u64>,

    checkpoint_path: Option<PathBuf>,
    checkpoint_freq: u64,
    records_since_checkpoint: u64,
    output_file: Option<PathBuf>,
    output_stats: OutputStats,
    debug_level: u8,

    report_cb: Option<Box<ReportCallback<N>>>,
    threshold_changed_cb: Option<Box<ThresholdChangedCallback>>,
    native_copier: Option<Box<NativeCopier<N>>>,
    native_freer: Option<Box<NativeFreer<N>>>,
    msg_cb: Option<Box<dyn FnMut(&Message)>>,
}

impl<N: 'static> Engine<N> {
    pub fn new(debug_level: u8, msg_cb: Option<Box<dyn FnMut(&Message)>>) -> Self {
        Self {
            recorder: EventRecorder::new(),
            detectors: Vec::new(),
            homenet: HomeNet::empty(),
            global_exclusions: ExclusionList::default(),
            total_packets: 0,
            last_time: None,
            checkpoint_path: None,
            checkpoint_freq: 0,
            records_since_checkpoint: 0,
            output_file: None,
            output_stats: OutputStats::default(),
            debug_level,
            report_cb: None,
            threshold_changed_cb: None,
            native_copier: None,
            native_freer: None,
            msg_cb,
        }
    }

    /// `engine_new_from_statefile`: recovers table managers from `path`.
    /// Falls back to a clean, empty engine on any recovery failure, per
    /// spec.md §7. The host is expected to re-run its original
    /// `new_detector` calls afterward so each detector reattaches to its
    /// restored manager.
    pub fn new_from_statefile(path: impl AsRef<Path>, debug_level: u8, mut msg_cb: Option<Box<dyn FnMut(&Message)>>) -> Self {
        match checkpoint::read(path.as_ref()) {
            Ok((recorder, total_packets, last_time)) => {
                message::emit(MessageLevel::Info, "recovered engine state from checkpoint", msg_cb.as_deref_mut());
                let mut engine = Self::new(debug_level, msg_cb);
                engine.recorder = recorder;
                engine.total_packets = total_packets;
                engine.last_time = last_time;
                engine
            }
            Err(e) => {
                message::emit(
                    MessageLevel::Warning,
                    format!("{e}; starting with a clean slate"),
                    msg_cb.as_deref_mut(),
                );
                Self::new(debug_level, msg_cb)
            }
        }
    }

    pub fn set_callbacks(
        &mut self,
        report_cb: Option<Box<ReportCallback<N>>>,
        threshold_changed_cb: Option<Box<ThresholdChangedCallback>>,
        native_copier: Option<Box<NativeCopier<N>>>,
        native_freer: Option<Box<NativeFreer<N>>>,
    ) {
        self.report_cb = report_cb;
        self.threshold_changed_cb = threshold_changed_cb;
        self.native_copier = native_copier;
        self.native_freer = native_freer;
    }

    pub fn set_checkpointing(&mut self, path: impl Into<PathBuf>, every_n_records: u64) {
        self.checkpoint_path = Some(path.into());
        self.checkpoint_freq = every_n_records;
        self.records_since_checkpoint = 0;
    }

    pub fn set_output_file(&mut self, path: impl Into<PathBuf>) {
        self.output_file = Some(path.into());
    }

    pub fn set_output_stats(&mut self, stats: OutputStats) {
        self.output_stats = stats;
    }

    pub fn set_homenet_from_str(&mut self, s: &str) -> SpadeResult<()> {
        self.homenet = HomeNet::parse(s)?;
        Ok(())
    }

    pub fn add_global_exclusions(&mut self, xsips: &str, xdips: &str, xsports: &str, xdports: &str) -> SpadeResult<()> {
        self.global_exclusions = ExclusionList::parse(xsips, xdips, xsports, xdports)?;
        Ok(())
    }

    /// `engine_new_detector`: parses `option_string`, compiles a detector
    /// against the shared recorder, and returns its id (the detector's
    /// explicit `id=` option, or its detection type name if unset).
    pub fn new_detector(&mut self, option_string: &str) -> Option<String> {
        let detector = Detector::compile(option_string, &mut self.recorder, self.msg_cb.as_deref_mut())?;

        let exclusions = ExclusionList::parse(
            detector.xsips.as_deref().unwrap_or(""),
            detector.xdips.as_deref().unwrap_or(""),
            detector.xsports.as_deref().unwrap_or(""),
            detector.xdports.as_deref().unwrap_or(""),
        )
        .unwrap_or_else(|e| {
            message::emit(MessageLevel::Warning, format!("{e}, ignoring detector exclusions"), self.msg_cb.as_deref_mut());
            ExclusionList::default()
        });

        let canceller = (detector.wait > 0).then(|| ResponseCanceller::new(detector.wait, detector.canceller_timeout_implication));

        let id = detector.id.clone();
        self.detectors.push(DetectorSlot { detector, canceller, exclusions });
        Some(id)
    }

    fn find_detector_idx(&self, id: &str) -> Option<usize> {
        self.detectors.iter().position(|slot| slot.detector.id == id)
    }

    pub fn setup_detector_adapt1(&mut self, id: &str, target: usize, period_secs: u64, new_obs_weight: f64) -> bool {
        let Some(i) = self.find_detector_idx(id) else { return false };
        let d = &mut self.detectors[i].detector;
        let initial = d.threshold.current_threshold();
        d.threshold = std::mem::take(&mut d.threshold).with_adapter(Adapter::mode1(target, period_secs, new_obs_weight, initial));
        true
    }

    pub fn setup_detector_adapt2(&mut self, id: &str, targetspec: f64, period_secs: u64, ns: usize, nm: usize, nl: usize) -> bool {
        let Some(i) = self.find_detector_idx(id) else { return false };
        let d = &mut self.detectors[i].detector;
        let initial = d.threshold.current_threshold();
        d.threshold = std::mem::take(&mut d.threshold).with_adapter(Adapter::mode2(targetspec, period_secs, ns, nm, nl, initial));
        true
    }

    pub fn setup_detector_adapt3(&mut self, id: &str, targetspec: f64, period_secs: u64, no: usize) -> bool {
        let Some(i) = self.find_detector_idx(id) else { return false };
        let d = &mut self.detectors[i].detector;
        let initial = d.threshold.current_threshold();
        d.threshold = std::mem::take(&mut d.threshold).with_adapter(Adapter::mode3(targetspec, period_secs, no, initial));
        true
    }

    pub fn setup_detector_adapt4(&mut self, id: &str, thresh: f64, period_secs: u64) -> bool {
        let Some(i) = self.find_detector_idx(id) else { return false };
        let d = &mut self.detectors[i].detector;
        d.threshold = std::mem::take(&mut d.threshold).with_adapter(Adapter::mode4(thresh, period_secs));
        true
    }

    pub fn setup_detector_advise(&mut self, id: &str, obs_size: usize, obs_secs: u64) -> bool {
        let Some(i) = self.find_detector_idx(id) else { return false };
        let d = &mut self.detectors[i].detector;
        d.threshold = std::mem::take(&mut d.threshold).with_adviser(Adviser::new(obs_size, obs_secs));
        true
    }

    pub fn setup_detector_survey(&mut self, id: &str, interval_secs: u64) -> bool {
        let Some(i) = self.find_detector_idx(id) else { return false };
        let d = &mut self.detectors[i].detector;
        d.threshold = std::mem::take(&mut d.threshold).with_surveyor(Surveyor::new(interval_secs));
        true
    }

    /// spec.md §4.6 `on_packet`: advances every time-driven component up to
    /// `time_seconds`, classifies the packet, scores/cancels/records it
    /// against each detector, and emits or parks reports.
    pub fn on_packet(&mut self, time_seconds: u64, origin: Origin, raw: RawPacket, native: &N) {
        let needs_advance = self.last_time.map(|last| time_seconds > last).unwrap_or(true);
        if needs_advance {
            self.advance_time_to(time_seconds);
        }
        self.last_time = Some(time_seconds);
        self.total_packets += 1;

        let event = PacketEvent::from_raw(time_seconds, origin, raw, native);
        let conds = crate::classify::classify(&event.raw, origin, &self.homenet);
        let (own_sip, own_sport, own_dip, own_dport, portless) = own_tuple(&event.raw, origin);

        for i in 0..self.detectors.len() {
            let (info, _enough) = {
                let slot = &self.detectors[i];
                let broadcast_excluded = slot.detector.exclude_broadcast_dip && (event.raw.dip & 0xFF == 0xFF);
                if slot.detector.scorecalc_conds.all_of_in(conds) && !broadcast_excluded {
                    let vals: Vec<u32> = slot.detector.feats.iter().map(|&f| event.feature(f)).collect();
                    let manager = self.recorder.manager_mut(slot.detector.handle);
                    let mut inputs = [ScoreInput { table: &mut manager.table, feats: &slot.detector.feats, vals: &vals }];
                    slot.detector.calculator.score(&mut inputs)
                } else {
                    (None, false)
                }
            };
            if let Some(info) = info {
                let exceeded = self.detectors[i].detector.threshold.observe(info.preferred);
                if exceeded {
                    self.handle_exceeded(i, time_seconds, info.preferred, &event.raw, native, (own_sip, own_sport, own_dip, own_dport, portless));
                }
            }

            let (cancel_open, cancel_closed) = {
                let d = &self.detectors[i].detector;
                (d.cancel_open_conds, d.cancel_closed_conds)
            };
            if cancel_open.is_not_false() && cancel_open.all_of_in(conds) {
                self.deliver_cancellation(i, PortStatus::Open, own_dip, own_dport, own_sip, own_sport, portless);
            }
            if cancel_closed.is_not_false() && cancel_closed.all_of_in(conds) {
                self.deliver_cancellation(i, PortStatus::Closed, own_dip, own_dport, own_sip, own_sport, portless);
            }
        }

        let matched = self.recorder.record(&event.features, conds);
        self.records_since_checkpoint += matched as u64;
        if self.checkpoint_freq > 0 && self.records_since_checkpoint >= self.checkpoint_freq {
            self.do_checkpoint();
            self.records_since_checkpoint = 0;
        }
    }

    fn advance_time_to(&mut self, now: u64) {
        for i in 0..self.detectors.len() {
            let (changed, _advising_completed, survey_lines) = {
                let slot = &mut self.detectors[i];
                slot.detector.threshold.advance_time(now)
            };
            let id = self.detectors[i].detector.id.clone();
            for line in &survey_lines {
                log::info!(
                    "detector {id} survey period {} n={} p50={:.4} p90={:.4} p99={:.4}",
                    line.period,
                    line.packet_count,
                    line.p50,
                    line.p90,
                    line.p99
                );
            }
            if changed {
                let new_thresh = self.detectors[i].detector.threshold.current_threshold();
                if let Some(cb) = self.threshold_changed_cb.as_deref_mut() {
                    cb(&id, new_thresh);
                }
            }
            self.advance_canceller(i, now);
        }
        self.recorder.advance_time(now);
    }

    fn advance_canceller(&mut self, i: usize, now: u64) {
        let id = self.detectors[i].detector.id.clone();
        let criteria = self.detectors[i].detector.port_report_criteria;
        let report_cb = &mut self.report_cb;
        let native_freer = &mut self.native_freer;
        if let Some(canceller) = self.detectors[i].canceller.as_mut() {
            let mut deliver = |pending: PendingReport<N>, status: PortStatus| {
                if criteria.contains(status) {
                    if let Some(cb) = report_cb.as_deref_mut() {
                        cb(&ReportInfo {
                            detector_id: &id,
                            time_seconds: pending.time_seconds,
                            score: pending.score,
                            port_status: status,
                            native: &pending.native,
                        });
                    }
                }
                if let Some(freer) = native_freer.as_deref_mut() {
                    freer(pending.native);
                }
            };
            canceller.advance_time(now, &mut deliver);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver_cancellation(&mut self, i: usize, implied_status: PortStatus, sip: u32, sport: u32, dip: u32, dport: u32, portless: bool) {
        let id = self.detectors[i].detector.id.clone();
        let criteria = self.detectors[i].detector.port_report_criteria;
        let report_cb = &mut self.report_cb;
        let native_freer = &mut self.native_freer;
        if let Some(canceller) = self.detectors[i].canceller.as_mut() {
            let mut deliver = |pending: PendingReport<N>, status: PortStatus| {
                if criteria.contains(status) {
                    if let Some(cb) = report_cb.as_deref_mut() {
                        cb(&ReportInfo {
                            detector_id: &id,
                            time_seconds: pending.time_seconds,
                            score: pending.score,
                            port_status: status,
                            native: &pending.native,
                        });
                    }
                }
                if let Some(freer) = native_freer.as_deref_mut() {
                    freer(pending.native);
                }
            };
            canceller.note_response(implied_status, sip, sport, dip, dport, portless, &mut deliver);
        }
    }

    /// A threshold-exceeding event on detector `i`: emit immediately if the
    /// detector's report criteria already admit the bare (unconfirmed)
    /// implication, park it in the detector's canceller if one is
    /// configured, or drop it, per spec.md §4.6.
    #[allow(clippy::too_many_arguments)]
    fn handle_exceeded(
        &mut self,
        i: usize,
        time_seconds: u64,
        score: f64,
        raw: &RawPacket,
        native: &N,
        own: (u32, u32, u32, u32, bool),
    ) {
        let excluded = self.global_exclusions.excludes(raw.sip, raw.dip, raw.sport, raw.dport)
            || self.detectors[i].exclusions.excludes(raw.sip, raw.dip, raw.sport, raw.dport);
        if excluded {
            return;
        }

        let (id, criteria, bare_impl) = {
            let d = &self.detectors[i].detector;
            (d.id.clone(), d.port_report_criteria, d.thresh_exc_port_impl)
        };

        if criteria.contains(bare_impl) {
            if let Some(cb) = self.report_cb.as_deref_mut() {
                cb(&ReportInfo { detector_id: &id, time_seconds, score, port_status: bare_impl, native });
            }
            return;
        }

        if self.detectors[i].canceller.is_none() {
            return;
        }
        let Some(copier) = self.native_copier.as_deref() else {
            return;
        };
        let pending = PendingReport { time_seconds, score, native: copier(native) };
        let (own_sip, own_sport, own_dip, own_dport, portless) = own;
        if let Some(canceller) = self.detectors[i].canceller.as_mut() {
            canceller.add_report(pending, own_sip, own_sport, own_dip, own_dport, portless, time_seconds);
        }
    }

    fn do_checkpoint(&mut self) {
        let Some(path) = self.checkpoint_path.clone() else { return };
        if let Err(e) = checkpoint::write(&self.recorder, self.total_packets, self.last_time, &path) {
            message::emit(MessageLevel::Warning, format!("{e}"), self.msg_cb.as_deref_mut());
        }
    }

    /// `engine_write_log`: a summary line plus, if `output_stats` asks for
    /// it, one line per detector. Full textual report formatting is a host
    /// responsibility (spec.md §1 Non-goals); this only feeds `log`.
    pub fn write_log(&mut self) {
        log::info!("spade engine: {} packets processed across {} detectors", self.total_packets, self.detectors.len());
        if self.output_stats.entropy || self.output_stats.uncond_prob || self.output_stats.cond_prob {
            for slot in &self.detectors {
                log::debug!(
                    "detector {}: threshold={:.4}",
                    slot.detector.id,
                    slot.detector.threshold.current_threshold()
                );
            }
        }
        if let Some(path) = &self.output_file {
            log::debug!("output file configured at {} (textual formatting is a host responsibility)", path.display());
        }
    }

    /// `engine_dump`: write the log, then checkpoint if configured.
    pub fn dump(&mut self) {
        self.write_log();
        self.do_checkpoint();
    }

    /// `engine_cleanup`: same as `dump`, the final call before the host
    /// drops the engine.
    pub fn cleanup(&mut self) {
        self.dump();
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn debug_level(&self) -> u8 {
        self.debug_level
    }

    pub fn detector_threshold(&self, id: &str) -> Option<f64> {
        self.find_detector_idx(id).map(|i| self.detectors[i].detector.threshold.current_threshold())
    }

    pub fn detector_advice(&self, id: &str) -> Option<(f64, f64)> {
        self.find_detector_idx(id).and_then(|i| self.detectors[i].detector.threshold.adviser_advice())
    }

    pub fn needed_conditions(&self) -> ConditionSet {
        self.recorder.needed_conditions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_syn(sip: u32, dip: u32, sport: u32, dport: u32) -> RawPacket {
        RawPacket {
            sip,
            dip,
            sport,
            dport,
            protocol: Protocol::Tcp,
            tcp_flags: crate::packet::tcp_flags::SYN,
            icmp_type: 0,
            icmp_code: 0,
        }
    }

    fn syn_ack(sip: u32, dip: u32, sport: u32, dport: u32) -> RawPacket {
        RawPacket {
            sip,
            dip,
            sport,
            dport,
            protocol: Protocol::Tcp,
            tcp_flags: crate::packet::tcp_flags::SYN | crate::packet::tcp_flags::ACK,
            icmp_type: 0,
            icmp_code: 0,
        }
    }

    #[test]
    fn closed_dport_scores_an_unseen_destination_port() {
        let mut engine: Engine<()> = Engine::new(0, None);
        engine.set_homenet_from_str("10.0.0.0/8").unwrap();
        let id = engine.new_detector("type=closed-dport thresh=0.0 minobs=0 relscore=0 corrscore=1").unwrap();

        for i in 0..1000u32 {
            engine.on_packet(i as u64, Origin::Top, tcp_syn(0x0200_0002 + i % 5, 0x0A00_0001, 1024 + i, 80), &());
        }

        let mut reports = Vec::new();
        engine.set_callbacks(
            Some(Box::new(|r: &ReportInfo<'_, ()>| reports.push((r.detector_id.to_string(), r.score)))),
            None,
            None,
            None,
        );
        engine.on_packet(1000, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 2024, 81), &());
        assert!(!reports.is_empty());
        assert_eq!(reports[0].0, id);
        assert!(reports[0].1 > 0.0);
    }

    #[test]
    fn synack_cancellation_confirms_port_open_before_timeout() {
        let mut engine: Engine<u32> = Engine::new(0, None);
        let reports = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let reports_cb = reports.clone();
        engine.set_callbacks(
            Some(Box::new(move |r: &ReportInfo<'_, u32>| reports_cb.borrow_mut().push((*r.native, r.port_status)))),
            None,
            Some(Box::new(|n: &u32| *n)),
            None,
        );
        engine.new_detector("type=closed-dport wait=5 tcpflags=synonly thresh=0.0 minobs=0 relscore=0 corrscore=1").unwrap();

        for t in 0..50u64 {
            engine.on_packet(t, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 1024 + t as u32, 80), &(t as u32));
        }
        engine.on_packet(100, Origin::Top, tcp_syn(0x0200_0002, 0x0A00_0001, 9999, 81), &9999);
        engine.on_packet(102, Origin::Top, syn_ack(0x0A00_0001, 0x0200_0002, 81, 9999), &0);

        let got = reports.borrow();
        assert!(got.iter().any(|&(n, status)| n == 9999 && status == PortStatus::Open));
    }
}
