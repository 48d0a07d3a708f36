//! acqstream-client - receive a stream and optionally record it
//!
//! ```text
//! acqstream-client -h host[:port] [-p TCP|UDP] [-f dir] [-t wav|tdms] [-v level]
//! ```
//!
//! Connects to a running `acqstream` server, decodes every packet, and
//! reports bandwidth and loss every 5 seconds. With `-f` the received
//! windows are written to container files in `dir`.

use acqstream::config::{Protocol, Role, SaveMode};
use acqstream::core::calibration::CalibrationSnapshot;
use acqstream::core::stats::SessionStats;
use acqstream::core::types::StopReason;
use acqstream::storage::sink::SinkStatus;
use acqstream::storage::{ContainerFormat, ContainerLayout, FileSink, FileSinkConfig};
use acqstream::streaming::wire::{DecodedPacket, WireOptions};
use acqstream::streaming::{PacketReceiver, TransportConfig, create_transport};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_PORT: u16 = 8900;
/// Undecimated rate of the reference hardware, for file headers
const BASE_RATE_HZ: u32 = 125_000_000;
const ADC_BITS: u8 = 14;
const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const INBOX_DEPTH: usize = 1024;

const EXIT_STARTUP: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[derive(Debug)]
struct Args {
    addr: String,
    protocol: Protocol,
    dir: Option<PathBuf>,
    format: ContainerFormat,
    log_level: String,
}

fn usage() -> String {
    "usage: acqstream-client -h host[:port] [-p TCP|UDP] [-f dir] [-t wav|tdms] [-v level]"
        .to_string()
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut parsed = Args {
        addr: String::new(),
        protocol: Protocol::Tcp,
        dir: None,
        format: ContainerFormat::Simple,
        log_level: "info".to_string(),
    };

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        if flag == "--help" {
            return Err(usage());
        }
        let value = iter
            .next()
            .ok_or_else(|| format!("{} needs a value\n{}", flag, usage()))?;
        match flag.as_str() {
            "-h" | "--host" => {
                parsed.addr = if value.contains(':') {
                    value.clone()
                } else {
                    format!("{}:{}", value, DEFAULT_PORT)
                };
            }
            "-p" | "--protocol" => {
                parsed.protocol = match value.to_ascii_uppercase().as_str() {
                    "TCP" => Protocol::Tcp,
                    "UDP" => Protocol::Udp,
                    other => return Err(format!("unknown protocol: {}", other)),
                };
            }
            "-f" | "--dir" => parsed.dir = Some(PathBuf::from(value)),
            "-t" | "--type" => {
                parsed.format = match value.to_ascii_lowercase().as_str() {
                    "wav" => ContainerFormat::Simple,
                    "tdms" | "acq" => ContainerFormat::Structured,
                    other => return Err(format!("unknown file type: {}", other)),
                };
            }
            "-v" | "--log-level" => parsed.log_level = value.clone(),
            other => return Err(format!("unknown option: {}\n{}", other, usage())),
        }
    }

    if parsed.addr.is_empty() {
        return Err(usage());
    }
    Ok(parsed)
}

/// Open the file sink once the first packet tells us the stream layout
fn open_sink(
    args: &Args,
    dir: &Path,
    packet: &DecodedPacket<'_>,
    stats: &Arc<SessionStats>,
    events: &Sender<StopReason>,
) -> acqstream::Result<Option<FileSink>> {
    let Some(mask) = packet.mask() else {
        return Ok(None);
    };
    let decimation = packet.header.sample_rate_code.max(1);
    let config = FileSinkConfig {
        dir: dir.to_path_buf(),
        prefix: "data_file".to_string(),
        session: chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
        format: args.format,
        layout: ContainerLayout {
            options: WireOptions {
                resolution: packet.header.resolution,
                calibrated: false,
                mask,
                adc_bits: ADC_BITS,
            },
            sample_rate_hz: BASE_RATE_HZ / decimation,
        },
        save_mode: SaveMode::Single,
        rotate_windows: 0,
        rotate_bytes: 0,
        min_reserve_bytes: 0,
        space_check_interval: Duration::from_secs(1),
        queue_depth: 64,
        sample_limit: None,
    };
    FileSink::start(config, Arc::clone(stats), events.clone()).map(Some)
}

struct Progress {
    started: Instant,
    last: Instant,
    last_bytes: u64,
}

impl Progress {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            last_bytes: 0,
        }
    }

    fn report(&mut self, receiver: &PacketReceiver, overflow: u64) {
        let stats = receiver.stats();
        let secs = self.last.elapsed().as_secs_f64().max(1e-3);
        let rate = (stats.bytes - self.last_bytes) as f64 / secs / (1024.0 * 1024.0);
        log::info!(
            "{:.0}s: {:.2} MB/s, {} packets, samples {}/{}, missing ids {}, reported lost {}, dropped {} (decode {}, inbox {})",
            self.started.elapsed().as_secs_f64(),
            rate,
            stats.packets,
            stats.samples[0],
            stats.samples[1],
            stats.missing_ids,
            stats.hinted_lost_samples,
            stats.decode_failures + overflow,
            stats.decode_failures,
            overflow
        );
        self.last = Instant::now();
        self.last_bytes = stats.bytes;
    }
}

fn run(args: Args, shutdown: Arc<AtomicBool>) -> Result<Option<StopReason>, acqstream::Error> {
    if let Some(dir) = &args.dir {
        std::fs::create_dir_all(dir)?;
        let free = fs2::available_space(dir)?;
        log::info!(
            "Recording to {} ({:.1} GiB free)",
            dir.display(),
            free as f64 / (1024.0 * 1024.0 * 1024.0)
        );
    }

    let stats = Arc::new(SessionStats::new());
    let (events_tx, events_rx) = bounded::<StopReason>(8);
    let (inbox_tx, inbox_rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = bounded(INBOX_DEPTH);
    let overflow = Arc::new(AtomicU64::new(0));

    let mut transport = create_transport(
        TransportConfig {
            role: Role::Client,
            protocol: args.protocol,
            addr: args.addr.clone(),
            queue_depth: 16,
            connect_timeout: Duration::from_secs(3),
        },
        Arc::clone(&stats),
    );
    let dropped = Arc::clone(&overflow);
    transport.on_receive(Box::new(move |data| {
        if let Err(TrySendError::Full(_)) = inbox_tx.try_send(data.to_vec()) {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }));
    let errors = events_tx.clone();
    transport.on_error(Box::new(move |e| {
        let _ = errors.try_send(StopReason::TransportFailed(e.to_string()));
    }));
    transport.start()?;
    log::info!("Connected to {} over {:?}", args.addr, args.protocol);

    let mut receiver = PacketReceiver::new(ADC_BITS);
    let mut sink: Option<FileSink> = None;
    let mut progress = Progress::new();
    let mut stop = None;

    while !shutdown.load(Ordering::Relaxed) {
        if let Ok(reason) = events_rx.try_recv() {
            stop = Some(reason);
            break;
        }

        match inbox_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(bytes) => {
                if let Some(packet) = receiver.accept(&bytes)
                    && let Some(dir) = &args.dir
                {
                    if sink.is_none() {
                        sink = open_sink(&args, dir, &packet, &stats, &events_tx)?;
                    }
                    if let (Some(sink), Some(window)) = (&sink, receiver.to_window(&packet))
                        && sink.try_submit(window, CalibrationSnapshot::default())
                            == SinkStatus::Backpressure
                    {
                        log::debug!("Writer behind; packet {} not recorded", packet.header.id);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if progress.last.elapsed() >= REPORT_INTERVAL {
            progress.report(&receiver, overflow.load(Ordering::Relaxed));
        }
    }

    transport.stop();
    progress.report(&receiver, overflow.load(Ordering::Relaxed));
    if let Some(sink) = sink {
        let report = sink.finish()?;
        for info in &report.files {
            log::info!(
                "Wrote {}: {} windows, {} samples/channel",
                info.path.display(),
                info.windows,
                info.samples_per_channel
            );
        }
    }
    Ok(stop)
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.as_str()),
    )
    .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            log::error!("Failed to register signal handlers: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    let flag = Arc::clone(&shutdown);
    let spawned = thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {}, shutting down...", sig);
                flag.store(true, Ordering::Relaxed);
            }
        });
    if let Err(e) = spawned {
        log::error!("Failed to spawn signal handler thread: {}", e);
        return ExitCode::from(EXIT_STARTUP);
    }

    match run(args, shutdown) {
        Ok(Some(reason)) if reason.is_failure() => {
            log::error!("Stopped: {}", reason);
            ExitCode::from(EXIT_RUNTIME)
        }
        Ok(Some(reason)) => {
            log::info!("Stopped: {}", reason);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(EXIT_STARTUP)
        }
    }
}
