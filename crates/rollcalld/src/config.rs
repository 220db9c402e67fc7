use anyhow::{bail, Context, Result};
use rollcall_core::tracker::{AbsenceReset, IdentitySwitch, TrackerPolicy};
use rollcall_hw::RetryPolicy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the control interface is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

/// Daemon configuration: defaults, then the TOML file named by
/// `ROLLCALL_CONFIG`, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// One subdirectory of images per identity.
    pub dataset_dir: PathBuf,
    pub store_path: PathBuf,
    pub attendance_db: PathBuf,
    /// Cosine distance above which a probe is Unknown.
    pub rejection_threshold: f32,
    /// Confidence a match must exceed to be logged.
    pub acceptance_threshold: f32,
    pub cooldown_secs: u64,
    /// Classify every Nth frame.
    pub decimation: u32,
    pub frame_interval_ms: u64,
    pub camera_retries: u32,
    pub camera_backoff_ms: u64,
    /// Consecutive read failures before the camera is reacquired.
    pub max_read_failures: u32,
    /// Run face detection on dataset images during a rebuild.
    pub detect_on_build: bool,
    pub identity_switch: IdentitySwitch,
    pub absence_reset: AbsenceReset,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: rollcall_core::recognizer::default_model_dir(),
            dataset_dir: PathBuf::from("dataset"),
            store_path: PathBuf::from("embeddings.json"),
            attendance_db: PathBuf::from("attendance.db"),
            rejection_threshold: 0.55,
            acceptance_threshold: 0.60,
            cooldown_secs: 3,
            decimation: 10,
            frame_interval_ms: 30,
            camera_retries: 5,
            camera_backoff_ms: 500,
            max_read_failures: 5,
            detect_on_build: true,
            identity_switch: IdentitySwitch::default(),
            absence_reset: AbsenceReset::default(),
            bus: BusKind::default(),
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Apply `ROLLCALL_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        env.string("ROLLCALL_CAMERA_DEVICE", &mut self.camera_device);
        env.parsed("ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        env.parsed("ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
        env.path("ROLLCALL_MODEL_DIR", &mut self.model_dir);
        env.path("ROLLCALL_DATASET_DIR", &mut self.dataset_dir);
        env.path("ROLLCALL_STORE_PATH", &mut self.store_path);
        env.path("ROLLCALL_ATTENDANCE_DB", &mut self.attendance_db);
        env.parsed("ROLLCALL_REJECTION_THRESHOLD", &mut self.rejection_threshold);
        env.parsed("ROLLCALL_ACCEPTANCE_THRESHOLD", &mut self.acceptance_threshold);
        env.parsed("ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        env.parsed("ROLLCALL_DECIMATION", &mut self.decimation);
        env.parsed("ROLLCALL_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        env.parsed("ROLLCALL_CAMERA_RETRIES", &mut self.camera_retries);
        env.parsed("ROLLCALL_CAMERA_BACKOFF_MS", &mut self.camera_backoff_ms);
        env.parsed("ROLLCALL_MAX_READ_FAILURES", &mut self.max_read_failures);
        env.flag("ROLLCALL_DETECT_ON_BUILD", &mut self.detect_on_build);
        env.keyword("ROLLCALL_IDENTITY_SWITCH", &mut self.identity_switch);
        env.keyword("ROLLCALL_ABSENCE_RESET", &mut self.absence_reset);
        env.keyword("ROLLCALL_BUS", &mut self.bus);
    }

    pub fn validate(&self) -> Result<()> {
        if self.decimation == 0 {
            bail!("decimation must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.rejection_threshold) {
            bail!("rejection_threshold {} is not a cosine distance", self.rejection_threshold);
        }
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            bail!("acceptance_threshold {} must be within [0, 1]", self.acceptance_threshold);
        }
        if self.acceptance_threshold < 1.0 - self.rejection_threshold {
            tracing::warn!(
                acceptance = self.acceptance_threshold,
                rejection = self.rejection_threshold,
                "acceptance threshold admits matches the matcher already rejects"
            );
        }
        Ok(())
    }

    pub fn tracker_policy(&self) -> TrackerPolicy {
        TrackerPolicy {
            acceptance_threshold: self.acceptance_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            identity_switch: self.identity_switch,
            absence_reset: self.absence_reset,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = Duration::from_millis(self.camera_backoff_ms);
        RetryPolicy {
            attempts: self.camera_retries,
            backoff,
            max_backoff: backoff.max(RetryPolicy::default().max_backoff),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, slot: &mut String) {
        if let Some(v) = (self.0)(key) {
            *slot = v;
        }
    }

    fn path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(v) = (self.0)(key) {
            *slot = PathBuf::from(v);
        }
    }

    fn flag(&self, key: &str, slot: &mut bool) {
        if let Some(v) = (self.0)(key) {
            *slot = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        if let Some(v) = (self.0)(key) {
            match v.parse() {
                Ok(parsed) => *slot = parsed,
                Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable environment override"),
            }
        }
    }

    fn keyword<T: DeserializeOwned>(&self, key: &str, slot: &mut T) {
        use serde::de::value::{Error as ValueError, StrDeserializer};
        use serde::de::IntoDeserializer;

        if let Some(v) = (self.0)(key) {
            let de: StrDeserializer<'_, ValueError> = v.as_str().into_deserializer();
            match T::deserialize(de) {
                Ok(parsed) => *slot = parsed,
                Err(e) => tracing::warn!(key, value = %v, error = %e, "ignoring unknown keyword"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.rejection_threshold, 0.55);
        assert_eq!(config.acceptance_threshold, 0.60);
        assert_eq!(config.decimation, 10);
        assert_eq!(config.tracker_policy(), TrackerPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            camera_device = "/dev/video2"
            cooldown_secs = 10
            identity_switch = "immediate"
            absence_reset = "after-cooldown"
            bus = "system"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.cooldown_secs, 10);
        assert_eq!(config.identity_switch, IdentitySwitch::Immediate);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.decimation, 10);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("camera = \"/dev/video1\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_CAMERA_DEVICE", "/dev/video4"),
            ("ROLLCALL_ACCEPTANCE_THRESHOLD", "0.75"),
            ("ROLLCALL_DECIMATION", "5"),
            ("ROLLCALL_DETECT_ON_BUILD", "0"),
            ("ROLLCALL_ABSENCE_RESET", "immediate"),
            ("ROLLCALL_STORE_PATH", "/var/lib/rollcall/embeddings.json"),
        ]));
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.acceptance_threshold, 0.75);
        assert_eq!(config.decimation, 5);
        assert!(!config.detect_on_build);
        assert_eq!(config.absence_reset, AbsenceReset::Immediate);
        assert_eq!(config.store_path, PathBuf::from("/var/lib/rollcall/embeddings.json"));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_COOLDOWN_SECS", "soon"),
            ("ROLLCALL_IDENTITY_SWITCH", "sometimes"),
        ]));
        assert_eq!(config.cooldown_secs, 3);
        assert_eq!(config.identity_switch, IdentitySwitch::HoldUntilCooldown);
    }

    #[test]
    fn test_validate_rejects_zero_decimation() {
        let config = Config {
            decimation: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("rollcall.toml");
        std::fs::write(&path, "frame_interval_ms = 50\ncamera_retries = 2\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.frame_interval(), Duration::from_millis(50));
        assert_eq!(config.retry_policy().attempts, 2);
    }
}
