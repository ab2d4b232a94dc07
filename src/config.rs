use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub triangulation: TriangulationConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Camera nodes connect here
    #[serde(default = "default_camera_listen_addr")]
    pub camera_listen_addr: String,
    /// Skeleton consumer (renderer / bridge)
    #[serde(default = "default_downstream_addr")]
    pub downstream_addr: String,
    #[serde(default = "default_record_dir")]
    pub record_dir: String,
    #[serde(default)]
    pub verbose: bool,
}

fn default_camera_listen_addr() -> String { "0.0.0.0:5557".to_string() }
fn default_downstream_addr() -> String { "127.0.0.1:5556".to_string() }
fn default_record_dir() -> String { "recordings".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            camera_listen_addr: default_camera_listen_addr(),
            downstream_addr: default_downstream_addr(),
            record_dir: default_record_dir(),
            verbose: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CycleConfig {
    /// Main loop period (25ms = 40Hz)
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Sleep between intake polls while waiting for a frame
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// A frame not completing within this window counts as a stall
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// Forward both point clouds downstream every cycle
    #[serde(default)]
    pub debug_clouds: bool,
}

fn default_period_ms() -> u64 { 25 }
fn default_poll_interval_us() -> u64 { 200 }
fn default_stall_timeout_ms() -> u64 { 1000 }

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            poll_interval_us: default_poll_interval_us(),
            stall_timeout_ms: default_stall_timeout_ms(),
            debug_clouds: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntakeConfig {
    #[serde(default = "default_max_rays_per_bucket")]
    pub max_rays_per_bucket: usize,
}

fn default_max_rays_per_bucket() -> usize { 100 }

impl Default for IntakeConfig {
    fn default() -> Self {
        Self { max_rays_per_bucket: default_max_rays_per_bucket() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriangulationConfig {
    /// Max closest-approach gap for the two-camera pass
    #[serde(default = "default_low_confidence_gap")]
    pub low_confidence_gap: f32,
    /// Max pairwise gap for the three-camera consensus pass
    #[serde(default = "default_high_confidence_gap")]
    pub high_confidence_gap: f32,
    /// Points closer than this are fused
    #[serde(default = "default_merge_distance")]
    pub merge_distance: f32,
    /// Points at or below this elevation are discarded
    #[serde(default = "default_floor_elevation")]
    pub floor_elevation: f32,
    /// |d1 x d2|^2 at or below this counts as parallel
    #[serde(default = "default_parallel_epsilon")]
    pub parallel_epsilon: f32,
}

fn default_low_confidence_gap() -> f32 { 0.7 }
fn default_high_confidence_gap() -> f32 { 1.0 }
fn default_merge_distance() -> f32 { 3.0 }
fn default_floor_elevation() -> f32 { -3.0 }
fn default_parallel_epsilon() -> f32 { 1e-6 }

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            low_confidence_gap: default_low_confidence_gap(),
            high_confidence_gap: default_high_confidence_gap(),
            merge_distance: default_merge_distance(),
            floor_elevation: default_floor_elevation(),
            parallel_epsilon: default_parallel_epsilon(),
        }
    }
}

/// Anatomical search thresholds, in world units and degrees.
#[derive(Debug, Deserialize, Clone)]
pub struct MatcherConfig {
    #[serde(default = "default_foot_height_tolerance")]
    pub foot_height_tolerance: f32,
    /// Horizontal foot separation and body cylinder diameter bounds
    #[serde(default = "default_min_shoulder_span")]
    pub min_shoulder_span: f32,
    #[serde(default = "default_max_shoulder_span")]
    pub max_shoulder_span: f32,
    #[serde(default = "default_knee_height_tolerance")]
    pub knee_height_tolerance: f32,
    #[serde(default = "default_max_knee_elevation")]
    pub max_knee_elevation: f32,
    #[serde(default = "default_max_knee_foot_angle_deg")]
    pub max_knee_foot_angle_deg: f32,
    /// Chest and hip must sit at least this far above the higher knee
    #[serde(default = "default_hip_knee_offset")]
    pub hip_knee_offset: f32,
    #[serde(default = "default_shoulder_height_tolerance")]
    pub shoulder_height_tolerance: f32,
    #[serde(default = "default_max_shoulder_foot_angle_deg")]
    pub max_shoulder_foot_angle_deg: f32,
    /// Elbows and hands, measured from the shoulder midpoint
    #[serde(default = "default_arm_height_tolerance")]
    pub arm_height_tolerance: f32,
    #[serde(default = "default_max_arm_foot_angle_deg")]
    pub max_arm_foot_angle_deg: f32,
    /// Allowed deviation around each measured limb length
    #[serde(default = "default_constraint_slack")]
    pub constraint_slack: f32,
}

fn default_foot_height_tolerance() -> f32 { 5.0 }
fn default_min_shoulder_span() -> f32 { 25.0 }
fn default_max_shoulder_span() -> f32 { 50.0 }
fn default_knee_height_tolerance() -> f32 { 5.0 }
fn default_max_knee_elevation() -> f32 { 60.0 }
fn default_max_knee_foot_angle_deg() -> f32 { 10.0 }
fn default_hip_knee_offset() -> f32 { 10.0 }
fn default_shoulder_height_tolerance() -> f32 { 5.0 }
fn default_max_shoulder_foot_angle_deg() -> f32 { 30.0 }
fn default_arm_height_tolerance() -> f32 { 10.0 }
fn default_max_arm_foot_angle_deg() -> f32 { 30.0 }
fn default_constraint_slack() -> f32 { 5.0 }

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            foot_height_tolerance: default_foot_height_tolerance(),
            min_shoulder_span: default_min_shoulder_span(),
            max_shoulder_span: default_max_shoulder_span(),
            knee_height_tolerance: default_knee_height_tolerance(),
            max_knee_elevation: default_max_knee_elevation(),
            max_knee_foot_angle_deg: default_max_knee_foot_angle_deg(),
            hip_knee_offset: default_hip_knee_offset(),
            shoulder_height_tolerance: default_shoulder_height_tolerance(),
            max_shoulder_foot_angle_deg: default_max_shoulder_foot_angle_deg(),
            arm_height_tolerance: default_arm_height_tolerance(),
            max_arm_foot_angle_deg: default_max_arm_foot_angle_deg(),
            constraint_slack: default_constraint_slack(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Max distance a point may move between cycles
    #[serde(default = "default_max_displacement")]
    pub max_displacement: f32,
}

fn default_max_displacement() -> f32 { 10.0 }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { max_displacement: default_max_displacement() }
    }
}

fn positive(name: &str, value: f32) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        bail!("{} must be positive (got {})", name, value);
    }
    Ok(())
}

fn angle(name: &str, deg: f32) -> Result<()> {
    if !(deg.is_finite() && (0.0..=90.0).contains(&deg)) {
        bail!("{} must be within [0, 90] degrees (got {})", name, deg);
    }
    Ok(())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Missing file gives defaults; an unreadable or malformed one is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cycle.period_ms == 0 {
            bail!("cycle.period_ms must be positive");
        }
        if self.cycle.stall_timeout_ms == 0 {
            bail!("cycle.stall_timeout_ms must be positive");
        }
        if self.intake.max_rays_per_bucket == 0 {
            bail!("intake.max_rays_per_bucket must be positive");
        }

        let t = &self.triangulation;
        positive("triangulation.low_confidence_gap", t.low_confidence_gap)?;
        positive("triangulation.high_confidence_gap", t.high_confidence_gap)?;
        positive("triangulation.merge_distance", t.merge_distance)?;
        positive("triangulation.parallel_epsilon", t.parallel_epsilon)?;
        if !t.floor_elevation.is_finite() {
            bail!("triangulation.floor_elevation must be finite");
        }

        let m = &self.matcher;
        positive("matcher.foot_height_tolerance", m.foot_height_tolerance)?;
        positive("matcher.min_shoulder_span", m.min_shoulder_span)?;
        positive("matcher.max_shoulder_span", m.max_shoulder_span)?;
        if m.min_shoulder_span > m.max_shoulder_span {
            bail!(
                "matcher.min_shoulder_span ({}) exceeds matcher.max_shoulder_span ({})",
                m.min_shoulder_span, m.max_shoulder_span
            );
        }
        positive("matcher.knee_height_tolerance", m.knee_height_tolerance)?;
        positive("matcher.max_knee_elevation", m.max_knee_elevation)?;
        positive("matcher.hip_knee_offset", m.hip_knee_offset)?;
        positive("matcher.shoulder_height_tolerance", m.shoulder_height_tolerance)?;
        positive("matcher.arm_height_tolerance", m.arm_height_tolerance)?;
        positive("matcher.constraint_slack", m.constraint_slack)?;
        angle("matcher.max_knee_foot_angle_deg", m.max_knee_foot_angle_deg)?;
        angle("matcher.max_shoulder_foot_angle_deg", m.max_shoulder_foot_angle_deg)?;
        angle("matcher.max_arm_foot_angle_deg", m.max_arm_foot_angle_deg)?;

        positive("tracker.max_displacement", self.tracker.max_displacement)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.cycle.period_ms, 25);
        assert_eq!(config.intake.max_rays_per_bucket, 100);
        assert!((config.triangulation.merge_distance - 3.0).abs() < 1e-6);
        assert!((config.tracker.max_displacement - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::parse(
            r#"
            [matcher]
            max_shoulder_span = 60.0

            [cycle]
            period_ms = 50
            debug_clouds = true
            "#,
        )
        .unwrap();
        assert!((config.matcher.max_shoulder_span - 60.0).abs() < 1e-6);
        assert!((config.matcher.min_shoulder_span - 25.0).abs() < 1e-6);
        assert_eq!(config.cycle.period_ms, 50);
        assert!(config.cycle.debug_clouds);
        assert_eq!(config.server.camera_listen_addr, "0.0.0.0:5557");
        config.validate().unwrap();
    }

    #[test]
    fn test_inverted_span_rejected() {
        let mut config = Config::default();
        config.matcher.min_shoulder_span = 60.0;
        let err = config.validate().unwrap_err();
        assert!(format!("{}", err).contains("min_shoulder_span"));
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut config = Config::default();
        config.tracker.max_displacement = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.matcher.max_arm_foot_angle_deg = 120.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cycle.period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.triangulation.high_confidence_gap = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("aggregator.toml");
        let config = Config::load(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cycle.period_ms, Config::default().cycle.period_ms);
        assert_eq!(config.server.record_dir, "recordings");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("does/not/exist.toml").unwrap();
        assert_eq!(config.server.downstream_addr, "127.0.0.1:5556");
    }
}
