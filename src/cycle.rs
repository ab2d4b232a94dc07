//! The fixed-rate main loop: wait for a complete frame, process it, emit the pose.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::Config;
use crate::control::ControlFlags;
use crate::intake::{IntakeProgress, RayFrame, RayIntake};
use crate::log;
use crate::logging::Logger;
use crate::pipeline::{Pipeline, SkeletonStep};
use crate::protocol::{DownstreamMessage, SkeletonUpdate};
use crate::recording::FrameRecorder;
use crate::skeleton::JOINT_COUNT;
use crate::tracker::TrackReport;
use crate::triangulation::Clouds;

pub enum FramePoll {
    Ready(RayFrame),
    Pending,
    /// No more frames will ever arrive
    Exhausted,
}

/// Where the cycle loop gets its frames from.
pub trait FrameSource {
    fn poll_frame(&mut self) -> FramePoll;

    fn progress(&self) -> Option<IntakeProgress> {
        None
    }
}

/// Frames completed by the live camera receivers.
pub struct LiveSource {
    intake: Arc<RayIntake>,
}

impl LiveSource {
    pub fn new(intake: Arc<RayIntake>) -> Self {
        Self { intake }
    }
}

impl FrameSource for LiveSource {
    fn poll_frame(&mut self) -> FramePoll {
        match self.intake.take_if_ready() {
            Some(frame) => FramePoll::Ready(frame),
            None => FramePoll::Pending,
        }
    }

    fn progress(&self) -> Option<IntakeProgress> {
        Some(self.intake.progress())
    }
}

/// Pre-recorded frames, served in order.
pub struct ReplaySource {
    frames: VecDeque<RayFrame>,
}

impl ReplaySource {
    pub fn new(frames: Vec<RayFrame>) -> Self {
        Self { frames: frames.into() }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn poll_frame(&mut self) -> FramePoll {
        match self.frames.pop_front() {
            Some(frame) => FramePoll::Ready(frame),
            None => FramePoll::Exhausted,
        }
    }
}

/// Where each cycle's pose (and optionally its clouds) goes.
pub trait SkeletonSink {
    fn skeleton(&mut self, update: &SkeletonUpdate) -> Result<()>;

    fn clouds(&mut self, _cycle: u64, _clouds: &Clouds) -> Result<()> {
        Ok(())
    }
}

fn cloud_message(cycle: u64, clouds: &Clouds) -> DownstreamMessage {
    DownstreamMessage::PointCloud { cycle, high: clouds.high.live_points(), low: clouds.low.live_points() }
}

/// Hands messages to the async downstream writer without blocking.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<DownstreamMessage>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::Sender<DownstreamMessage>) -> Self {
        Self { tx, dropped: 0 }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn offer(&mut self, msg: DownstreamMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => self.dropped += 1,
        }
    }
}

impl SkeletonSink for ChannelSink {
    fn skeleton(&mut self, update: &SkeletonUpdate) -> Result<()> {
        self.offer(DownstreamMessage::Skeleton(update.clone()));
        Ok(())
    }

    fn clouds(&mut self, cycle: u64, clouds: &Clouds) -> Result<()> {
        self.offer(cloud_message(cycle, clouds));
        Ok(())
    }
}

/// One JSON object per line, for replay runs.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write(&mut self, msg: &DownstreamMessage) -> Result<()> {
        serde_json::to_writer(&mut self.writer, msg)?;
        writeln!(self.writer)?;
        Ok(())
    }
}

impl<W: Write> SkeletonSink for JsonLinesSink<W> {
    fn skeleton(&mut self, update: &SkeletonUpdate) -> Result<()> {
        self.write(&DownstreamMessage::Skeleton(update.clone()))
    }

    fn clouds(&mut self, cycle: u64, clouds: &Clouds) -> Result<()> {
        self.write(&cloud_message(cycle, clouds))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub matches: u64,
    pub match_failures: u64,
    pub tracked_points: u64,
    pub stale_points: u64,
    /// Waits longer than the stall timeout
    pub stalls: u64,
    pub recorded_frames: u64,
}

impl CycleStats {
    fn add_track(&mut self, report: &TrackReport) {
        self.tracked_points += report.tracked() as u64;
        self.stale_points += report.stale() as u64;
    }
}

/// Runs until the shutdown flag is set or the source is exhausted.
///
/// Each iteration waits for one complete frame, processes it and then sleeps
/// out the rest of the cycle period.
pub fn run_cycle_loop<S: FrameSource, K: SkeletonSink>(
    source: &mut S,
    pipeline: &mut Pipeline,
    sink: &mut K,
    flags: &ControlFlags,
    config: &Config,
    logger: &Logger,
) -> Result<CycleStats> {
    let period = Duration::from_millis(config.cycle.period_ms);
    let poll_interval = Duration::from_micros(config.cycle.poll_interval_us);
    let stall_timeout = Duration::from_millis(config.cycle.stall_timeout_ms);
    let verbose = config.server.verbose;

    let mut stats = CycleStats::default();
    let mut recorder: Option<FrameRecorder<BufWriter<File>>> = None;
    let mut fps_timer = Instant::now();
    let mut fps_cycles: u32 = 0;
    let mut fps_stalls_before = 0u64;

    'cycles: loop {
        if flags.is_shutdown() {
            log!(logger, "[cycle] shutdown requested");
            break;
        }
        let cycle_start = Instant::now();

        let mut wait_start = Instant::now();
        let frame = loop {
            match source.poll_frame() {
                FramePoll::Ready(frame) => break frame,
                FramePoll::Exhausted => {
                    log!(logger, "[cycle] frame source exhausted after {} cycles", stats.cycles);
                    break 'cycles;
                }
                FramePoll::Pending => {
                    if flags.is_shutdown() {
                        log!(logger, "[cycle] shutdown requested while waiting for a frame");
                        break 'cycles;
                    }
                    if wait_start.elapsed() >= stall_timeout {
                        stats.stalls += 1;
                        match source.progress() {
                            Some(p) => log!(logger,
                                "[stall] no complete frame for {}ms ({}/{} cameras reported, frame {})",
                                stall_timeout.as_millis(), p.reported, p.expected, p.cycle),
                            None => log!(logger, "[stall] no complete frame for {}ms", stall_timeout.as_millis()),
                        }
                        wait_start = Instant::now();
                    }
                    std::thread::sleep(poll_interval);
                }
            }
        };

        if flags.take_rematch() {
            log!(logger, "[match] re-match requested");
            pipeline.request_rematch();
        }

        if flags.saving_rays() && recorder.is_none() {
            match FrameRecorder::create_in(&config.server.record_dir) {
                Ok((r, path)) => {
                    log!(logger, "[record] saving rays to {}", path.display());
                    recorder = Some(r);
                }
                Err(e) => {
                    log!(logger, "[record] cannot start recording: {:#}", e);
                    flags.cancel_save_rays();
                }
            }
        }
        if let Some(r) = recorder.as_mut() {
            match r.record(&frame) {
                Ok(()) => stats.recorded_frames += 1,
                Err(e) => {
                    log!(logger, "[record] write failed, recording stopped: {:#}", e);
                    recorder = None;
                    flags.cancel_save_rays();
                }
            }
        }

        let outcome = pipeline.process(&frame);
        stats.cycles += 1;
        match &outcome.step {
            SkeletonStep::Matched => {
                stats.matches += 1;
                log!(logger, "[match] skeleton matched at frame {} ({} high-confidence points)",
                    outcome.cycle, outcome.clouds.high.len());
            }
            SkeletonStep::MatchFailed { reason } => {
                stats.match_failures += 1;
                if verbose {
                    log!(logger, "[verbose] frame {}: match failed: {}", outcome.cycle, reason);
                }
            }
            SkeletonStep::Tracked(report) => {
                stats.add_track(report);
                if verbose && report.stale() > 0 {
                    log!(logger, "[verbose] frame {}: {}/{} points tracked",
                        outcome.cycle, report.tracked(), JOINT_COUNT);
                }
            }
        }

        sink.skeleton(&pipeline.update(outcome.cycle))?;
        if config.cycle.debug_clouds || flags.debugging() {
            sink.clouds(outcome.cycle, &outcome.clouds)?;
        }

        fps_cycles += 1;
        let elapsed = fps_timer.elapsed();
        if elapsed >= Duration::from_secs(1) {
            log!(logger, "[fps] {:.1} (rays={} high={} low={} stalls={})",
                fps_cycles as f32 / elapsed.as_secs_f32(),
                frame.ray_count(), outcome.clouds.high.len(), outcome.clouds.low.len(),
                stats.stalls - fps_stalls_before);
            fps_cycles = 0;
            fps_stalls_before = stats.stalls;
            fps_timer = Instant::now();
        }

        if let Some(rest) = period.checked_sub(cycle_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    Ok(stats)
}
