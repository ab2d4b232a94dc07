//! Inbound camera events, independent of the transport that carries them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::control::ControlFlags;
use crate::geometry::Ray;
use crate::intake::{ReportOutcome, RayIntake};
use crate::protocol::{AggregatorMessage, Command};
use crate::registry::{CameraRegistry, Registration};

/// What a camera connection should send after handling an event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    /// Only to the camera that sent the event
    pub direct: Option<AggregatorMessage>,
    /// To every connected camera
    pub broadcast: Option<AggregatorMessage>,
}

/// Shared state every camera connection writes into.
pub struct CameraHub {
    registry: Arc<CameraRegistry>,
    intake: Arc<RayIntake>,
    flags: Arc<ControlFlags>,
}

impl CameraHub {
    pub fn new(registry: Arc<CameraRegistry>, intake: Arc<RayIntake>, flags: Arc<ControlFlags>) -> Self {
        Self { registry, intake, flags }
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    /// Registers the camera. The very first camera starts the capture cycle.
    pub fn camera_ready(&self, identity: &str) -> anyhow::Result<(Registration, Reply)> {
        let registration = self.registry.register_or_lookup(identity)?;
        let mut reply = Reply {
            direct: Some(AggregatorMessage::Welcome { slot: registration.slot.0 }),
            broadcast: None,
        };
        if registration.first {
            self.intake.latch_expected();
            reply.broadcast = Some(AggregatorMessage::GrabFrame);
        }
        Ok((registration, reply))
    }

    /// Stores a camera's rays. Completing a frame asks every camera for the next one.
    pub fn rays_reported(&self, registration: &Registration, rays: &[Ray]) -> (ReportOutcome, Reply) {
        let outcome = self.intake.report(registration.slot, rays);
        let mut reply = Reply::default();
        if outcome == ReportOutcome::Completed {
            reply.broadcast = Some(AggregatorMessage::GrabFrame);
        }
        (outcome, reply)
    }

    pub fn command(&self, command: Command) -> Reply {
        let mut reply = Reply::default();
        if self.flags.apply(command) {
            reply.broadcast = Some(AggregatorMessage::Command(command));
        }
        reply
    }
}

/// Waits until every subscriber has picked up all queued broadcasts.
///
/// Returns false if `limit` ran out first.
pub async fn drain_broadcast<T: Clone>(tx: &broadcast::Sender<T>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while tx.len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
