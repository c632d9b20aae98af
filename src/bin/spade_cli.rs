//! Demo CLI: configures an [`Engine`] from detector option strings on the
//! command line, replays a synthetic packet stream, and logs whatever
//! fires. Reading a real packet capture is a host responsibility (spec.md
//! §1 Non-goals); this binary exists to smoke-test the engine end to end.

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use spade_engine::engine::Engine;
use spade_engine::packet::{tcp_flags, Origin, Protocol, RawPacket};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Detector option string, e.g. "type=closed-dport wait=5 thresh=0.5".
    /// Repeatable; at least one is required.
    #[arg(long = "detector", required = true)]
    detectors: Vec<String>,

    /// CIDR list describing the monitored home network, e.g. "10.0.0.0/8".
    #[arg(long, default_value = "")]
    homenet: String,

    /// Number of synthetic packets to replay.
    #[arg(long, default_value_t = 5000)]
    packets: u64,

    /// Checkpoint file to write every `checkpoint_every` recorded events.
    #[arg(long)]
    checkpoint: Option<String>,

    #[arg(long, default_value_t = 1000)]
    checkpoint_every: u64,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn init_log() {
    std::fs::create_dir_all("logs").expect("create logs directory");
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("time moves forward")
        .as_secs();
    let file = simplelog::WriteLogger::new(
        log::LevelFilter::Debug,
        config.clone(),
        std::fs::File::create(format!("logs/spade-{time}.log")).expect("create log file"),
    );
    let term = simplelog::TermLogger::new(
        log::LevelFilter::Info,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    simplelog::CombinedLogger::init(vec![term, file]).expect("install logger");
}

fn synthetic_packet(rng: &mut SmallRng) -> RawPacket {
    let attacker = 0x0200_0000 | rng.random_range(0..256);
    RawPacket {
        sip: attacker,
        dip: 0x0A00_0001,
        sport: rng.random_range(1024..65535),
        dport: rng.random_range(1..1024),
        protocol: Protocol::Tcp,
        tcp_flags: tcp_flags::SYN,
        icmp_type: 0,
        icmp_code: 0,
    }
}

fn main() {
    init_log();
    let args = Args::parse();

    let mut engine: Engine<u64> = match &args.checkpoint {
        Some(path) if std::path::Path::new(path).exists() => Engine::new_from_statefile(path, 1, None),
        _ => Engine::new(1, None),
    };
    engine.set_homenet_from_str(&args.homenet).expect("valid homenet CIDR list");

    for option_string in &args.detectors {
        match engine.new_detector(option_string) {
            Some(id) => log::info!("compiled detector '{id}' from '{option_string}'"),
            None => log::warn!("failed to compile detector from '{option_string}'"),
        }
    }

    if let Some(path) = &args.checkpoint {
        engine.set_checkpointing(path.clone(), args.checkpoint_every);
    }

    let mut reported = 0u64;
    engine.set_callbacks(
        Some(Box::new(move |report| {
            reported += 1;
            log::warn!(
                "[{}] t={} score={:.4} status={:?} packet#{}",
                report.detector_id,
                report.time_seconds,
                report.score,
                report.port_status,
                report.native,
            );
        })),
        Some(Box::new(|id, thresh| log::info!("detector '{id}' threshold now {thresh:.4}"))),
        Some(Box::new(|n: &u64| *n)),
        None,
    );

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let progress = indicatif::ProgressBar::new(args.packets);
    for t in 0..args.packets {
        let raw = synthetic_packet(&mut rng);
        engine.on_packet(t, Origin::Top, raw, &t);
        progress.inc(1);
    }
    progress.finish();

    engine.cleanup();
}
