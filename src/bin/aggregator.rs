//! Aggregator: receives per-camera rays over TCP, triangulates them once per
//! cycle, matches and tracks the skeleton, and streams it downstream.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt as _;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use ray_fusion::config::Config;
use ray_fusion::control::ControlFlags;
use ray_fusion::cycle::{
    run_cycle_loop, ChannelSink, CycleStats, FrameSource, JsonLinesSink, LiveSource, ReplaySource,
    SkeletonSink,
};
use ray_fusion::intake::RayIntake;
use ray_fusion::log;
use ray_fusion::logging::Logger;
use ray_fusion::pipeline::Pipeline;
use ray_fusion::protocol::{self, AggregatorMessage, CameraMessage, DownstreamMessage};
use ray_fusion::receiver::{drain_broadcast, CameraHub};
use ray_fusion::recording::load_recording;
use ray_fusion::registry::{CameraRegistry, Registration};

const DEFAULT_CONFIG_PATH: &str = "aggregator.toml";
const DOWNSTREAM_QUEUE: usize = 64;
const CAMERA_BROADCAST_QUEUE: usize = 64;
const STOP_GRACE: Duration = Duration::from_millis(500);

struct Args {
    config_path: String,
    replay: Option<String>,
    dump: Option<String>,
    record: bool,
}

// Usage: aggregator [--config <path>] [--replay <file>] [--dump <file>] [--record]
fn parse_args() -> Result<Args> {
    let mut args = Args { config_path: DEFAULT_CONFIG_PATH.to_string(), replay: None, dump: None, record: false };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config_path = it.next().context("--config needs a path")?,
            "--replay" => args.replay = Some(it.next().context("--replay needs a file")?),
            "--dump" => args.dump = Some(it.next().context("--dump needs a file")?),
            "--record" => args.record = true,
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

// ===========================================================================
// Downstream: one outbound connection, reconnected on failure
// ===========================================================================

async fn downstream_loop(addr: String, mut rx: mpsc::Receiver<DownstreamMessage>, logger: Logger) {
    loop {
        log!(logger, "[downstream] connecting to {}...", addr);
        match TcpStream::connect(&addr).await {
            Ok(tcp) => {
                let _ = tcp.set_nodelay(true);
                log!(logger, "[downstream] connected");
                let mut stream = protocol::message_stream(tcp);
                loop {
                    let Some(msg) = rx.recv().await else {
                        log!(logger, "[downstream] cycle loop finished");
                        return;
                    };
                    if let Err(e) = protocol::send_message(&mut stream, &msg).await {
                        log!(logger, "[downstream] send failed: {e:#}");
                        break;
                    }
                }
            }
            Err(e) => {
                log!(logger, "[downstream] connection failed: {e}");
            }
        }
        log!(logger, "[downstream] reconnecting in 2s...");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

// ===========================================================================
// Cameras: one task per connection
// ===========================================================================

async fn camera_session(
    tcp: TcpStream,
    peer: SocketAddr,
    hub: Arc<CameraHub>,
    camera_tx: broadcast::Sender<AggregatorMessage>,
    logger: Logger,
    verbose: bool,
) -> Result<()> {
    let framed = protocol::message_stream(tcp);
    let (mut sink, mut reader) = framed.split();
    let mut camera_rx = camera_tx.subscribe();
    let mut registration: Option<Registration> = None;

    loop {
        tokio::select! {
            result = reader.next() => {
                let bytes = match result {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                };
                let reply = match protocol::decode::<CameraMessage>(&bytes)? {
                    CameraMessage::Hello { identity, frame_width, frame_height } => {
                        let (reg, reply) = hub.camera_ready(&identity)?;
                        log!(logger, "[camera] {} ({}) -> {} {}x{}{} [{} registered]",
                            identity, peer, reg.slot, frame_width, frame_height,
                            if reg.newly_registered { "" } else { " (reconnect)" },
                            hub.registry().len());
                        registration = Some(reg);
                        reply
                    }
                    CameraMessage::Rays { rays } => {
                        let Some(reg) = registration.as_ref() else {
                            bail!("{} sent rays before hello", peer);
                        };
                        let (outcome, reply) = hub.rays_reported(reg, &rays);
                        if verbose {
                            log!(logger, "[verbose] {}: {} rays {:?}", reg.slot, rays.len(), outcome);
                        }
                        reply
                    }
                    CameraMessage::Command(command) => {
                        log!(logger, "[command] {:?} from {}", command, peer);
                        hub.command(command)
                    }
                };
                if let Some(msg) = reply.direct {
                    protocol::send_to_sink(&mut sink, &msg).await?;
                }
                if let Some(msg) = reply.broadcast {
                    let _ = camera_tx.send(msg);
                }
            }
            out = camera_rx.recv() => {
                match out {
                    Ok(msg) => protocol::send_to_sink(&mut sink, &msg).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log!(logger, "[camera] {} lagged, {} broadcasts skipped", peer, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    hub: Arc<CameraHub>,
    camera_tx: broadcast::Sender<AggregatorMessage>,
    logger: Logger,
    verbose: bool,
) -> Result<()> {
    loop {
        let (tcp, peer) = listener.accept().await?;
        tcp.set_nodelay(true)?;
        log!(logger, "[tcp] camera connected from {}", peer);
        let hub = Arc::clone(&hub);
        let camera_tx = camera_tx.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            if let Err(e) = camera_session(tcp, peer, hub, camera_tx, logger.clone(), verbose).await {
                log!(logger, "[tcp] {} session error: {e:#}", peer);
            }
            log!(logger, "[tcp] {} disconnected", peer);
        });
    }
}

// ===========================================================================
// Cycle loop (sync, blocking)
// ===========================================================================

fn spawn_cycle_loop<S, K>(
    mut source: S,
    mut sink: K,
    config: Config,
    flags: Arc<ControlFlags>,
    logger: Logger,
) -> tokio::task::JoinHandle<Result<(CycleStats, K)>>
where
    S: FrameSource + Send + 'static,
    K: SkeletonSink + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut pipeline = Pipeline::new(&config);
        let stats = run_cycle_loop(&mut source, &mut pipeline, &mut sink, &flags, &config, &logger)?;
        Ok((stats, sink))
    })
}

fn log_stats(logger: &Logger, stats: &CycleStats) {
    log!(logger, "[stats] cycles={} matches={} match_failures={} tracked_points={} stale_points={} stalls={} recorded_frames={}",
        stats.cycles, stats.matches, stats.match_failures, stats.tracked_points,
        stats.stale_points, stats.stalls, stats.recorded_frames);
}

async fn run_replay(path: &str, args: &Args, config: Config, flags: Arc<ControlFlags>, logger: &Logger) -> Result<()> {
    let frames = load_recording(path)?;
    log!(logger, "[replay] {} frames from {}", frames.len(), path);
    let source = ReplaySource::new(frames);

    match &args.dump {
        Some(dump) => {
            let file = File::create(dump).with_context(|| format!("failed to create {}", dump))?;
            let sink = JsonLinesSink::new(BufWriter::new(file));
            let (stats, sink) = spawn_cycle_loop(source, sink, config, flags, logger.clone()).await??;
            sink.into_inner().flush()?;
            log!(logger, "[replay] skeleton updates written to {}", dump);
            log_stats(logger, &stats);
        }
        None => {
            let (tx, rx) = mpsc::channel(DOWNSTREAM_QUEUE);
            let downstream = tokio::spawn(downstream_loop(config.server.downstream_addr.clone(), rx, logger.clone()));
            let (stats, sink) = spawn_cycle_loop(source, ChannelSink::new(tx), config, flags, logger.clone()).await??;
            log_stats(logger, &stats);
            log!(logger, "[downstream] {} messages dropped", sink.dropped());
            drop(sink);
            let _ = tokio::time::timeout(Duration::from_secs(2), downstream).await;
        }
    }
    Ok(())
}

async fn run_live(config: Config, flags: Arc<ControlFlags>, logger: &Logger) -> Result<()> {
    let registry = Arc::new(CameraRegistry::new());
    let intake = Arc::new(RayIntake::new(Arc::clone(&registry), config.intake.max_rays_per_bucket));
    let hub = Arc::new(CameraHub::new(registry, Arc::clone(&intake), Arc::clone(&flags)));
    let (camera_tx, _) = broadcast::channel::<AggregatorMessage>(CAMERA_BROADCAST_QUEUE);

    let listener = TcpListener::bind(&config.server.camera_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.camera_listen_addr))?;
    log!(logger, "[tcp] listening for cameras on {}", config.server.camera_listen_addr);

    let (tx, rx) = mpsc::channel(DOWNSTREAM_QUEUE);
    tokio::spawn(downstream_loop(config.server.downstream_addr.clone(), rx, logger.clone()));

    let verbose = config.server.verbose;
    let cycle = spawn_cycle_loop(LiveSource::new(Arc::clone(&intake)), ChannelSink::new(tx), config, flags, logger.clone());

    tokio::select! {
        result = accept_loop(listener, hub, camera_tx.clone(), logger.clone(), verbose) => {
            result?;
        }
        result = cycle => {
            let (stats, sink) = result??;
            log_stats(logger, &stats);
            let intake_stats = intake.stats();
            log!(logger, "[intake] completed={} overwritten={} ignored={} truncated_rays={} unconsumed={}",
                intake_stats.completed_frames, intake_stats.overwritten_reports,
                intake_stats.ignored_reports, intake_stats.truncated_rays, intake_stats.unconsumed_frames);
            log!(logger, "[downstream] {} messages dropped", sink.dropped());
            // let camera sessions pass on a forwarded Stop before the runtime goes away
            if !drain_broadcast(&camera_tx, STOP_GRACE).await {
                log!(logger, "[tcp] some cameras did not receive the final broadcast");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let config = Config::load_or_default(&args.config_path)?;
    let (logger, _log_path) = Logger::open("aggregator")?;

    log!(logger, "Ray Fusion Aggregator ({})", env!("GIT_VERSION"));
    log!(logger, "Config: {}", args.config_path);
    if let Err(e) = config.validate() {
        log!(logger, "invalid configuration: {e:#}");
        return Err(e);
    }
    log!(logger, "Cycle: {}ms, stall timeout {}ms", config.cycle.period_ms, config.cycle.stall_timeout_ms);
    log!(logger, "Downstream: {}", config.server.downstream_addr);
    if config.server.verbose { log!(logger, "Verbose mode: ON"); }

    let flags = Arc::new(ControlFlags::new());
    signal_hook::flag::register(signal_hook::consts::SIGINT, flags.shutdown_flag())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flags.shutdown_flag())?;
    if args.record {
        log!(logger, "[record] recording enabled from start");
        flags.request_save_rays();
    }

    match args.replay.clone() {
        Some(path) => run_replay(&path, &args, config, flags, &logger).await?,
        None => run_live(config, flags, &logger).await?,
    }
    log!(logger, "Aggregator stopped");
    Ok(())
}
