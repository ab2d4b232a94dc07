//! Double-buffered ray intake shared between the camera receivers and the cycle loop.
//!
//! Receivers write into the back frame. When every camera latched for that
//! frame has reported once, the back frame becomes the front frame and the
//! cycle loop can take it.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::geometry::Ray;
use crate::registry::{CameraRegistry, CameraSlot};

/// One camera's rays for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleBucket {
    pub rays: Vec<Ray>,
}

/// One bucket per camera slot, indexed by slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RayFrame {
    pub cycle: u64,
    pub buckets: Vec<CycleBucket>,
}

impl RayFrame {
    fn empty(cameras: usize) -> Self {
        Self { cycle: 0, buckets: vec![CycleBucket::default(); cameras] }
    }

    pub fn camera_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn ray_count(&self) -> usize {
        self.buckets.iter().map(|b| b.rays.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Stored; the frame is still waiting on other cameras.
    Accepted,
    /// Stored and this report completed the frame.
    Completed,
    /// The camera had already reported this frame; its bucket was replaced.
    Overwrote,
    /// The slot is not part of the current frame's roster.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub completed_frames: u64,
    pub overwritten_reports: u64,
    pub ignored_reports: u64,
    pub truncated_rays: u64,
    /// Completed frames replaced before the cycle loop took them.
    pub unconsumed_frames: u64,
}

/// Where the back frame stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeProgress {
    pub cycle: u64,
    pub reported: usize,
    pub expected: usize,
}

#[derive(Debug)]
struct IntakeState {
    frames: [RayFrame; 2],
    front: usize,
    ready: bool,
    reported: Vec<bool>,
    reported_count: usize,
    expected: usize,
    next_cycle: u64,
    stats: IntakeStats,
}

impl IntakeState {
    fn open_back_frame(&mut self, cameras: usize) {
        self.expected = cameras;
        self.frames[1 - self.front] = RayFrame::empty(cameras);
        self.reported = vec![false; cameras];
        self.reported_count = 0;
    }
}

pub struct RayIntake {
    state: Mutex<IntakeState>,
    registry: Arc<CameraRegistry>,
    capacity: usize,
}

impl RayIntake {
    /// `capacity` is the per-camera ray limit; extra rays are dropped.
    pub fn new(registry: Arc<CameraRegistry>, capacity: usize) -> Self {
        Self {
            state: Mutex::new(IntakeState {
                frames: [RayFrame::default(), RayFrame::default()],
                front: 0,
                ready: false,
                reported: Vec::new(),
                reported_count: 0,
                expected: 0,
                next_cycle: 0,
                stats: IntakeStats::default(),
            }),
            registry,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IntakeState> {
        // poisoning is ignored: no update leaves the state half-written
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Latches the registry's camera count when no frame is open yet.
    ///
    /// Called when the first camera registers; later registrations join at
    /// the next frame boundary.
    pub fn latch_expected(&self) {
        let mut state = self.lock();
        if state.expected == 0 {
            let cameras = self.registry.len();
            state.open_back_frame(cameras);
        }
    }

    pub fn report(&self, slot: CameraSlot, rays: &[Ray]) -> ReportOutcome {
        let mut state = self.lock();
        let index = slot.index();
        if index >= state.expected {
            state.stats.ignored_reports += 1;
            return ReportOutcome::Ignored;
        }

        let kept = rays.len().min(self.capacity);
        state.stats.truncated_rays += (rays.len() - kept) as u64;
        let back = 1 - state.front;
        state.frames[back].buckets[index] = CycleBucket { rays: rays[..kept].to_vec() };

        if state.reported[index] {
            state.stats.overwritten_reports += 1;
            return ReportOutcome::Overwrote;
        }
        state.reported[index] = true;
        state.reported_count += 1;
        if state.reported_count < state.expected {
            return ReportOutcome::Accepted;
        }

        state.frames[back].cycle = state.next_cycle;
        state.next_cycle += 1;
        if state.ready {
            state.stats.unconsumed_frames += 1;
        }
        state.front = back;
        state.ready = true;
        state.stats.completed_frames += 1;
        let cameras = self.registry.len();
        state.open_back_frame(cameras);
        ReportOutcome::Completed
    }

    /// Copies out the most recently completed frame if it has not been taken yet.
    pub fn take_if_ready(&self) -> Option<RayFrame> {
        let mut state = self.lock();
        if !state.ready {
            return None;
        }
        state.ready = false;
        Some(state.frames[state.front].clone())
    }

    pub fn progress(&self) -> IntakeProgress {
        let state = self.lock();
        IntakeProgress { cycle: state.next_cycle, reported: state.reported_count, expected: state.expected }
    }

    pub fn stats(&self) -> IntakeStats {
        self.lock().stats
    }
}
