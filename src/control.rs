use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::protocol::Command;

/// Flags shared between the receiver tasks, the signal handler and the cycle loop.
///
/// Each flag is its own atomic; none of them guards other data.
#[derive(Debug, Default)]
pub struct ControlFlags {
    save_rays: AtomicBool,
    rematch: AtomicBool,
    debug: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an operator command. Returns true when it should also go out to every camera.
    pub fn apply(&self, command: Command) -> bool {
        match command {
            Command::SaveRays => self.save_rays.store(true, Ordering::Relaxed),
            Command::MatchSkeleton => self.rematch.store(true, Ordering::Relaxed),
            Command::StartDebugging => self.debug.store(true, Ordering::Relaxed),
            Command::StopDebugging => self.debug.store(false, Ordering::Relaxed),
            Command::Stop => {
                self.shutdown.store(true, Ordering::Relaxed);
                return true;
            }
            Command::EstimatePose
            | Command::SendGrayscale
            | Command::SendBinarized
            | Command::SaveFramesToFile
            | Command::BinarizationThreshold(_)
            | Command::NoFrames => return true,
        }
        false
    }

    pub fn request_save_rays(&self) {
        self.save_rays.store(true, Ordering::Relaxed);
    }

    pub fn cancel_save_rays(&self) {
        self.save_rays.store(false, Ordering::Relaxed);
    }

    pub fn saving_rays(&self) -> bool {
        self.save_rays.load(Ordering::Relaxed)
    }

    pub fn request_rematch(&self) {
        self.rematch.store(true, Ordering::Relaxed);
    }

    /// Consumes a pending re-match request.
    pub fn take_rematch(&self) -> bool {
        self.rematch.swap(false, Ordering::Relaxed)
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
    }

    pub fn debugging(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// The raw shutdown flag, for `signal_hook::flag::register`.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}
