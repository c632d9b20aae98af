//! Option-string configuration (spec.md §6). A detector is configured from
//! one space-separated `key=value` string; this module tokenizes it into a
//! map and then into one typed struct per detection type, grounded in
//! `examples/original_source/src/netspade.c`'s `netspade_new_detector`.

use std::collections::BTreeMap;

use crate::error::MessageLevel;
use crate::message::{self, MsgCallback};

const RECOGNIZED_KEYS: &[&str] = &[
    "type",
    "id",
    "thresh",
    "wait",
    "minobs",
    "scalefreq",
    "scalefactor",
    "scalecutoff",
    "scalehalflife",
    "probmode",
    "relscore",
    "corrscore",
    "protocol",
    "proto",
    "to",
    "from",
    "tcpflags",
    "icmptype",
    "maxentropy",
    "revwaitrpt",
    "xsips",
    "xsip",
    "xdips",
    "xdip",
    "xsports",
    "xsport",
    "xdports",
    "xdport",
];

/// Splits `s` on whitespace into `key=value` tokens, warning on (and
/// dropping) anything that isn't a recognized key, per spec.md §6.
pub fn parse_option_string(s: &str, mut cb: Option<&mut MsgCallback<'_>>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for token in s.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            message::emit(MessageLevel::Warning, format!("ignoring malformed option token \"{token}\""), cb.as_deref_mut());
            continue;
        };
        let key = key.to_ascii_lowercase();
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            message::emit(MessageLevel::Warning, format!("unknown option key \"{key}\""), cb.as_deref_mut());
            continue;
        }
        out.insert(key, value.to_string());
    }
    out
}

fn get_str<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str)
}

fn get_f64(map: &BTreeMap<String, String>, key: &str, cb: Option<&mut MsgCallback<'_>>) -> Option<f64> {
    match map.get(key) {
        None => None,
        Some(v) => match v.parse() {
            Ok(f) => Some(f),
            Err(_) => {
                message::emit(MessageLevel::Warning, format!("\"{key}\" value \"{v}\" is not a number, ignoring"), cb);
                None
            }
        },
    }
}

fn get_u64(map: &BTreeMap<String, String>, key: &str, cb: Option<&mut MsgCallback<'_>>) -> Option<u64> {
    match map.get(key) {
        None => None,
        Some(v) => match v.parse() {
            Ok(u) => Some(u),
            Err(_) => {
                message::emit(MessageLevel::Warning, format!("\"{key}\" value \"{v}\" is not an integer, ignoring"), cb);
                None
            }
        },
    }
}

fn get_bool(map: &BTreeMap<String, String>, key: &str, cb: Option<&mut MsgCallback<'_>>) -> Option<bool> {
    match map.get(key) {
        None => None,
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => {
                message::emit(MessageLevel::Warning, format!("\"{key}\" value \"{v}\" is not a boolean, ignoring"), cb);
                None
            }
        },
    }
}

/// `to=`/`from=` restrict a detector's feature list to packets whose IP of
/// interest is, or is not, in the home network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomenetSide {
    Home,
    NotHome,
    Any,
}

impl HomenetSide {
    fn parse(raw: Option<&str>, field: &str, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        match raw {
            None | Some("home") => HomenetSide::Home,
            Some("any") => HomenetSide::Any,
            Some("nothome") => HomenetSide::NotHome,
            Some(other) => {
                message::emit(MessageLevel::Warning, format!("\"{field}\" setting {other} not valid, using home"), cb.as_deref_mut());
                HomenetSide::Home
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Tcp,
    Udp,
    Icmp,
}

impl WireProtocol {
    fn parse_tcp_or_udp(raw: Option<&str>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        match raw {
            Some("udp") => WireProtocol::Udp,
            None | Some("tcp") => WireProtocol::Tcp,
            Some(other) => {
                message::emit(MessageLevel::Warning, format!("Protocol {other} not valid, using tcp"), cb.as_deref_mut());
                WireProtocol::Tcp
            }
        }
    }

    fn parse_any(raw: Option<&str>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        match raw {
            Some("udp") => WireProtocol::Udp,
            Some("icmp") => WireProtocol::Icmp,
            None | Some("tcp") => WireProtocol::Tcp,
            Some(other) => {
                message::emit(MessageLevel::Warning, format!("Protocol {other} not valid, using tcp"), cb.as_deref_mut());
                WireProtocol::Tcp
            }
        }
    }
}

/// Which TCP flag combination a detector conditions on, per spec.md §4.6's
/// flag vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlagMode {
    SynOnly,
    Weird,
    SynAck,
    Established,
    Teardown,
    Setup,
}

impl TcpFlagMode {
    fn parse(raw: Option<&str>, allow_setup: bool, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        match raw {
            Some("weird") => TcpFlagMode::Weird,
            Some("synack") => TcpFlagMode::SynAck,
            Some("established") => TcpFlagMode::Established,
            Some("teardown") => TcpFlagMode::Teardown,
            Some("setup") if allow_setup => TcpFlagMode::Setup,
            None | Some("synonly") => TcpFlagMode::SynOnly,
            Some(other) => {
                message::emit(MessageLevel::Warning, format!("TCP flags {other} not valid, using synonly"), cb.as_deref_mut());
                TcpFlagMode::SynOnly
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpTypeMode {
    Any,
    Err,
    NotErr,
}

impl IcmpTypeMode {
    fn parse(raw: Option<&str>, default: IcmpTypeMode, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        match raw {
            Some("any") => IcmpTypeMode::Any,
            Some("err") => IcmpTypeMode::Err,
            Some("noterr") => IcmpTypeMode::NotErr,
            None => default,
            Some(other) => {
                message::emit(MessageLevel::Warning, format!("ICMP type {other} not valid, using default"), cb.as_deref_mut());
                default
            }
        }
    }
}

/// Fields shared by every detection type's option string, per
/// `netspade_new_detector`'s common `formatstr` prefix.
#[derive(Debug, Clone)]
pub struct CommonOptions {
    pub id: Option<String>,
    pub wait: u64,
    pub minobs_override: Option<f64>,
    pub scalefreq_secs: Option<u64>,
    pub scalefactor: Option<f64>,
    pub scalecutoff: Option<f64>,
    pub scalehalflife_hrs: Option<f64>,
    pub revwaitrpt: bool,
    pub xsips: Option<String>,
    pub xdips: Option<String>,
    pub xsports: Option<String>,
    pub xdports: Option<String>,
}

impl CommonOptions {
    fn parse(map: &BTreeMap<String, String>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        Self {
            id: get_str(map, "id").map(str::to_string),
            wait: get_u64(map, "wait", cb.as_deref_mut()).unwrap_or(0),
            minobs_override: get_f64(map, "minobs", cb.as_deref_mut()),
            scalefreq_secs: get_u64(map, "scalefreq", cb.as_deref_mut()).map(|mins| mins * 60),
            scalefactor: get_f64(map, "scalefactor", cb.as_deref_mut()),
            scalecutoff: get_f64(map, "scalecutoff", cb.as_deref_mut()),
            scalehalflife_hrs: get_f64(map, "scalehalflife", cb.as_deref_mut()),
            revwaitrpt: get_bool(map, "revwaitrpt", cb.as_deref_mut()).unwrap_or(false),
            xsips: get_str(map, "xsips").or_else(|| get_str(map, "xsip")).map(str::to_string),
            xdips: get_str(map, "xdips").or_else(|| get_str(map, "xdip")).map(str::to_string),
            xsports: get_str(map, "xsports").or_else(|| get_str(map, "xsport")).map(str::to_string),
            xdports: get_str(map, "xdports").or_else(|| get_str(map, "xdport")).map(str::to_string),
        }
    }

    /// `scalefactor`, resolved against `scalehalflife` if given, per
    /// `netspade.c`'s `exp((scalefreqmins/(scalehalflifehrs*60))*log(0.5))`.
    pub fn resolved_scalefactor(&self, default: f64, scalefreq_secs: u64) -> f64 {
        if let Some(halflife_hrs) = self.scalehalflife_hrs.filter(|h| *h >= 0.0) {
            let halflife_secs = halflife_hrs * 3600.0;
            (scalefreq_secs as f64 / halflife_secs * 0.5f64.ln()).exp()
        } else {
            self.scalefactor.unwrap_or(default)
        }
    }
}

/// `closed-dport`: scores `(dip, dport[, sip, sport])` against TCP SYNs (or
/// UDP datagrams) to a home-network destination.
#[derive(Debug, Clone)]
pub struct ClosedDportConfig {
    pub common: CommonOptions,
    pub protocol: WireProtocol,
    pub to: HomenetSide,
    pub tcpflags: TcpFlagMode,
    pub thresh: f64,
    pub relscore: bool,
    pub probmode: u8,
    pub corrscore: bool,
    pub minobs: f64,
}

impl TryFrom<&BTreeMap<String, String>> for ClosedDportConfig {
    type Error = std::convert::Infallible;
    fn try_from(map: &BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::parse(map, None)
    }
}

impl ClosedDportConfig {
    pub fn parse(map: &BTreeMap<String, String>, mut cb: Option<&mut MsgCallback<'_>>) -> Result<Self, std::convert::Infallible> {
        let common = CommonOptions::parse(map, cb.as_deref_mut());
        let relscore = get_bool(map, "relscore", cb.as_deref_mut()).unwrap_or(true);
        let thresh = get_f64(map, "thresh", cb.as_deref_mut()).unwrap_or(if relscore { 0.85 } else { 0.0 });
        let probmode = get_u64(map, "probmode", cb.as_deref_mut()).unwrap_or(3);
        let probmode = if probmode > 3 {
            message::emit(MessageLevel::Warning, format!("Probability mode {probmode} not valid, using mode 3"), cb.as_deref_mut());
            3
        } else if probmode == 0 {
            message::emit(MessageLevel::Warning, "probability mode 0 (product of independent conditionals) is not supported, using mode 1", cb.as_deref_mut());
            1
        } else {
            probmode as u8
        };
        let minobs = common.minobs_override.unwrap_or(if probmode == 0 { 0.0 } else if relscore { 400.0 } else { 0.0 });
        Ok(Self {
            protocol: WireProtocol::parse_tcp_or_udp(get_str(map, "protocol").or_else(|| get_str(map, "proto")), cb.as_deref_mut()),
            to: HomenetSide::parse(get_str(map, "to"), "to", cb.as_deref_mut()),
            tcpflags: TcpFlagMode::parse(get_str(map, "tcpflags"), false, cb.as_deref_mut()),
            thresh,
            relscore,
            probmode,
            corrscore: get_bool(map, "corrscore", cb.as_deref_mut()).unwrap_or(true),
            minobs,
            common,
        })
    }
}

/// `odd-typecode`: scores the packed ICMP `(type, code)` feature.
#[derive(Debug, Clone)]
pub struct OddTypecodeConfig {
    pub common: CommonOptions,
    pub to: HomenetSide,
    pub thresh: f64,
    pub icmptype: IcmpTypeMode,
    pub minobs: f64,
}

impl TryFrom<&BTreeMap<String, String>> for OddTypecodeConfig {
    type Error = std::convert::Infallible;
    fn try_from(map: &BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Ok(Self::parse(map, None))
    }
}

impl OddTypecodeConfig {
    pub fn parse(map: &BTreeMap<String, String>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        let common = CommonOptions::parse(map, cb.as_deref_mut());
        let icmptype = IcmpTypeMode::parse(get_str(map, "icmptype"), IcmpTypeMode::Any, cb.as_deref_mut());
        let minobs = common.minobs_override.unwrap_or(match icmptype {
            IcmpTypeMode::Any => 4000.0,
            IcmpTypeMode::Err | IcmpTypeMode::NotErr => 2000.0,
        });
        Self {
            to: HomenetSide::parse(get_str(map, "to"), "to", cb.as_deref_mut()),
            thresh: get_f64(map, "thresh", cb.as_deref_mut()).unwrap_or(0.9),
            icmptype,
            minobs,
            common,
        }
    }
}

/// `odd-dport`: scores `(sip, dport)` for connection-opening packets from a
/// home-network source.
#[derive(Debug, Clone)]
pub struct OddDportConfig {
    pub common: CommonOptions,
    pub protocol: WireProtocol,
    pub from: HomenetSide,
    pub thresh: f64,
}

impl TryFrom<&BTreeMap<String, String>> for OddDportConfig {
    type Error = std::convert::Infallible;
    fn try_from(map: &BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Ok(Self::parse(map, None))
    }
}

impl OddDportConfig {
    pub fn parse(map: &BTreeMap<String, String>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        Self {
            common: CommonOptions::parse(map, cb.as_deref_mut()),
            protocol: WireProtocol::parse_tcp_or_udp(get_str(map, "protocol").or_else(|| get_str(map, "proto")), cb.as_deref_mut()),
            from: HomenetSide::parse(get_str(map, "from"), "from", cb.as_deref_mut()),
            thresh: get_f64(map, "thresh", cb.as_deref_mut()).unwrap_or(0.8),
        }
    }
}

/// `odd-port-dest`: scores `(sip, dport, dip)` with an entropy-derived
/// `minobs` default.
#[derive(Debug, Clone)]
pub struct OddPortDestConfig {
    pub common: CommonOptions,
    pub protocol: WireProtocol,
    pub from: HomenetSide,
    pub thresh: f64,
    pub maxentropy: f64,
}

impl TryFrom<&BTreeMap<String, String>> for OddPortDestConfig {
    type Error = std::convert::Infallible;
    fn try_from(map: &BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Ok(Self::parse(map, None))
    }
}

impl OddPortDestConfig {
    pub fn parse(map: &BTreeMap<String, String>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        Self {
            common: CommonOptions::parse(map, cb.as_deref_mut()),
            protocol: WireProtocol::parse_tcp_or_udp(get_str(map, "protocol").or_else(|| get_str(map, "proto")), cb.as_deref_mut()),
            from: HomenetSide::parse(get_str(map, "from"), "from", cb.as_deref_mut()),
            thresh: get_f64(map, "thresh", cb.as_deref_mut()).unwrap_or(0.9),
            maxentropy: get_f64(map, "maxentropy", cb.as_deref_mut()).unwrap_or(2.5),
        }
    }

    /// `minobs = 2^maxentropy * (100 or 200)`, per `netspade.c`'s comment
    /// "default is N times the minimum number of observations needed to
    /// achieve maxentropy".
    pub fn default_minobs(&self, protocol: WireProtocol) -> f64 {
        let multiplier = if protocol == WireProtocol::Udp { 200.0 } else { 100.0 };
        self.common.minobs_override.unwrap_or(2f64.powf(self.maxentropy) * multiplier)
    }
}

/// `dead-dest`: scores `sip` (conditioned on destination liveness signals),
/// recording `dip` purely as a calculated feature.
#[derive(Debug, Clone)]
pub struct DeadDestConfig {
    pub common: CommonOptions,
    pub protocol: WireProtocol,
    pub tcpflags: TcpFlagMode,
    pub icmptype: IcmpTypeMode,
}

impl TryFrom<&BTreeMap<String, String>> for DeadDestConfig {
    type Error = std::convert::Infallible;
    fn try_from(map: &BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Ok(Self::parse(map, None))
    }
}

impl DeadDestConfig {
    pub fn parse(map: &BTreeMap<String, String>, mut cb: Option<&mut MsgCallback<'_>>) -> Self {
        Self {
            common: CommonOptions::parse(map, cb.as_deref_mut()),
            protocol: WireProtocol::parse_any(get_str(map, "protocol").or_else(|| get_str(map, "proto")), cb.as_deref_mut()),
            tcpflags: TcpFlagMode::parse(get_str(map, "tcpflags"), true, cb.as_deref_mut()),
            icmptype: IcmpTypeMode::parse(get_str(map, "icmptype"), IcmpTypeMode::NotErr, cb.as_deref_mut()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_dropped_with_a_warning() {
        let mut warnings = Vec::new();
        let mut cb = |m: &crate::message::Message| warnings.push(m.text.clone());
        let map = parse_option_string("type=closed-dport bogus=1 thresh=0.5", Some(&mut cb));
        assert_eq!(map.get("thresh").map(String::as_str), Some("0.5"));
        assert!(!map.contains_key("bogus"));
        assert!(warnings.iter().any(|w| w.contains("bogus")));
    }

    #[test]
    fn closed_dport_defaults_follow_relscore() {
        let map = parse_option_string("type=closed-dport", None);
        let cfg = ClosedDportConfig::parse(&map, None).unwrap();
        assert!((cfg.thresh - 0.85).abs() < 1e-9);
        assert_eq!(cfg.minobs, 400.0);
    }

    #[test]
    fn closed_dport_fixed_score_defaults_to_zero_threshold() {
        let map = parse_option_string("type=closed-dport relscore=0", None);
        let cfg = ClosedDportConfig::parse(&map, None).unwrap();
        assert_eq!(cfg.thresh, 0.0);
        assert_eq!(cfg.minobs, 0.0);
    }

    #[test]
    fn odd_port_dest_minobs_scales_with_maxentropy() {
        let map = parse_option_string("type=odd-port-dest maxentropy=3", None);
        let cfg = OddPortDestConfig::parse(&map, None);
        assert_eq!(cfg.default_minobs(WireProtocol::Tcp), 2f64.powf(3.0) * 100.0);
        assert_eq!(cfg.default_minobs(WireProtocol::Udp), 2f64.powf(3.0) * 200.0);
    }

    #[test]
    fn scalehalflife_overrides_explicit_scalefactor() {
        let map = parse_option_string("type=closed-dport scalehalflife=4 scalefreq=240", None);
        let common = CommonOptions::parse(&map, None);
        let factor = common.resolved_scalefactor(0.5, 240 * 60);
        assert!((factor - 0.5f64.powf(1.0)).abs() < 1e-9);
    }
}
