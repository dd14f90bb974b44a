//! Engine configuration
//!
//! Loaded from YAML or built in code with the `with_*` methods.
//!
//! ```yaml
//! candidates_accept_period_ms: 4000
//! check_timeout_ms: 3000
//! media_manager_selection: first-registered
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CANDIDATES_ACCEPT_PERIOD_MS, DEFAULT_CHECK_TIMEOUT_MS, DEFAULT_MIN_CHECK_TIMEOUT_MS,
};
use crate::errors::{JingleError, JingleResult};

/// What to do when no media manager supports every offered payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MediaManagerSelection {
    /// Fall back to the first registered manager
    #[default]
    FirstRegistered,
    /// Reject the content as unsupported
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JingleConfig {
    /// Window in which remote candidates are checked
    pub candidates_accept_period_ms: u64,
    /// Hard ceiling for a single candidate check
    pub check_timeout_ms: u64,
    /// Lower bound of the per-candidate check budget
    pub min_check_timeout_ms: u64,
    pub media_manager_selection: MediaManagerSelection,
    /// Advertise the Jingle feature when the manager is created
    pub advertise_feature: bool,
    /// Require `node@domain/resource` for outgoing responders
    pub validate_full_jid: bool,
}

impl Default for JingleConfig {
    fn default() -> Self {
        Self {
            candidates_accept_period_ms: DEFAULT_CANDIDATES_ACCEPT_PERIOD_MS,
            check_timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
            min_check_timeout_ms: DEFAULT_MIN_CHECK_TIMEOUT_MS,
            media_manager_selection: MediaManagerSelection::default(),
            advertise_feature: true,
            validate_full_jid: true,
        }
    }
}

impl JingleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> JingleResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| JingleError::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> JingleResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            JingleError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> JingleResult<()> {
        if self.check_timeout_ms == 0 {
            return Err(JingleError::Config("check_timeout_ms must be positive".into()));
        }
        if self.min_check_timeout_ms > self.check_timeout_ms {
            return Err(JingleError::Config(
                "min_check_timeout_ms cannot exceed check_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn with_candidates_accept_period(mut self, period: Duration) -> Self {
        self.candidates_accept_period_ms = millis(period);
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout_ms = millis(timeout);
        self
    }

    pub fn with_min_check_timeout(mut self, timeout: Duration) -> Self {
        self.min_check_timeout_ms = millis(timeout);
        self
    }

    pub fn with_media_manager_selection(mut self, selection: MediaManagerSelection) -> Self {
        self.media_manager_selection = selection;
        self
    }

    pub fn with_advertise_feature(mut self, advertise: bool) -> Self {
        self.advertise_feature = advertise;
        self
    }

    pub fn with_full_jid_validation(mut self, validate: bool) -> Self {
        self.validate_full_jid = validate;
        self
    }

    /// Timeout for checking one of `candidates` remote candidates.
    ///
    /// The accept period plus the check ceiling is shared between all
    /// candidates of a batch, clamped to `[min_check_timeout, check_timeout]`.
    pub fn candidate_check_timeout(&self, candidates: usize) -> Duration {
        let total = self
            .candidates_accept_period_ms
            .saturating_add(self.check_timeout_ms);
        let share = total / candidates.max(1) as u64;
        let min = self.min_check_timeout_ms.min(self.check_timeout_ms);
        Duration::from_millis(share.clamp(min, self.check_timeout_ms))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = JingleConfig::default();
        assert_eq!(config.candidates_accept_period_ms, 4000);
        assert_eq!(config.check_timeout_ms, 3000);
        assert_eq!(config.media_manager_selection, MediaManagerSelection::FirstRegistered);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = JingleConfig::from_yaml_str("media_manager_selection: reject\n").unwrap();
        assert_eq!(config.media_manager_selection, MediaManagerSelection::Reject);
        assert_eq!(config.check_timeout_ms, 3000);
    }

    #[test]
    fn invalid_yaml_is_config_error() {
        let err = JingleConfig::from_yaml_str("check_timeout_ms: [").unwrap_err();
        assert!(matches!(err, JingleError::Config(_)));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let yaml = "check_timeout_ms: 100\nmin_check_timeout_ms: 500\n";
        assert!(JingleConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn check_budget_is_shared_and_clamped() {
        let config = JingleConfig::default();
        // 7000ms over 1 candidate is capped by the per-check ceiling
        assert_eq!(config.candidate_check_timeout(1), Duration::from_millis(3000));
        assert_eq!(config.candidate_check_timeout(7), Duration::from_millis(1000));
        assert_eq!(config.candidate_check_timeout(1000), Duration::from_millis(200));
        assert_eq!(config.candidate_check_timeout(0), Duration::from_millis(3000));
    }

    #[test]
    fn huge_values_saturate() {
        let yaml = format!(
            "candidates_accept_period_ms: {}\ncheck_timeout_ms: {}\n",
            u64::MAX,
            u64::MAX
        );
        let config = JingleConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.candidate_check_timeout(2), Duration::from_millis(u64::MAX / 2));

        let config = JingleConfig::default().with_check_timeout(Duration::MAX);
        assert_eq!(config.check_timeout_ms, u64::MAX);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jingle.yaml");
        std::fs::write(&path, "check_timeout_ms: 1500\nadvertise_feature: false\n").unwrap();

        let config = JingleConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.check_timeout_ms, 1500);
        assert!(!config.advertise_feature);
    }
}
