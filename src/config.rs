//! Harness configuration loaded from `harness.toml`.
//!
//! Resolution order for the file: `--config`, `HARNESS_CONFIG`, then
//! `./harness.toml`. A missing file yields the defaults. Secrets can be
//! supplied through the environment (a `.env` file is honoured by the binary):
//!
//! | Variable | Overrides |
//! |---|---|
//! | `HARNESS_API_URL` | `platform.api_url` |
//! | `HARNESS_CLIENT_ID` | `auth.client_id` |
//! | `HARNESS_CLIENT_SECRET` | `auth.client_secret` |
//! | `HARNESS_STATIC_TOKEN` | `auth.static_token` |
//!
//! # File format
//!
//! ```toml
//! [platform]
//! api_url = "https://api.example.com/v6"
//! timeout_secs = 30
//!
//! [auth]
//! token_url = "https://auth.example.com/oauth/token"
//! audience = "https://api.example.com/"
//!
//! [engine]
//! poll_interval_secs = 5
//! review_discovery_attempts = 12
//!
//! [flows.standard]
//! name_prefix = "Harness"
//! copilot = "copilot1"
//! reviewers = ["reviewer1"]
//! submitters = ["alice", "bob"]
//! review_scorecard_id = "30001"
//! submission_zip_path = "./fixtures/submission.zip"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "harness.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub flows: FlowsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.topcoder-dev.com/v6".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub audience: String,
    /// Pre-issued bearer token; takes precedence over the client-credentials exchange.
    #[serde(default)]
    pub static_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub upload_url: String,
    /// Base URL submissions reference; defaults to `upload_url`.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "harness-submissions".to_string()
}

impl StorageConfig {
    pub fn public_url(&self) -> &str {
        self.public_url.as_deref().unwrap_or(&self.upload_url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the last-run snapshot is persisted (default: data dir).
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    /// Directory for the rolling log file (default: data dir).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_review_discovery_attempts")]
    pub review_discovery_attempts: u32,
    #[serde(default = "default_review_discovery_interval_secs")]
    pub review_discovery_interval_secs: u64,
    #[serde(default = "default_phase_lag_grace_secs")]
    pub phase_lag_grace_secs: u64,
    /// Fixed RNG seed for reproducible answers and appeal choices.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_review_discovery_attempts() -> u32 {
    12
}

fn default_review_discovery_interval_secs() -> u64 {
    5
}

fn default_phase_lag_grace_secs() -> u64 {
    15
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            log_dir: None,
            poll_interval_secs: default_poll_interval_secs(),
            review_discovery_attempts: default_review_discovery_attempts(),
            review_discovery_interval_secs: default_review_discovery_interval_secs(),
            phase_lag_grace_secs: default_phase_lag_grace_secs(),
            seed: None,
        }
    }
}

impl EngineConfig {
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(|| data_dir().join("last-run.json"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| data_dir().join("logs"))
    }

    pub fn review_discovery_interval(&self) -> Duration {
        Duration::from_secs(self.review_discovery_interval_secs)
    }

    pub fn phase_lag_grace(&self) -> Duration {
        Duration::from_secs(self.phase_lag_grace_secs)
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("challenge-harness")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Settings shared by every flow: how the challenge is created and staffed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSettings {
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub project_id: u64,
    #[serde(default)]
    pub type_id: String,
    #[serde(default)]
    pub track_id: String,
    #[serde(default)]
    pub timeline_template_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub copilot: String,
    #[serde(default)]
    pub submitters: Vec<String>,
    /// Placement prizes in USD, first place first.
    #[serde(default = "default_prizes")]
    pub prizes: Vec<f64>,
    #[serde(default)]
    pub submission_zip_path: Option<PathBuf>,
    /// Seconds between phase polls; falls back to `engine.poll_interval_secs`.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    /// Create a pending review when none can be found instead of stopping.
    #[serde(default)]
    pub create_missing_reviews: bool,
}

fn default_name_prefix() -> String {
    "Harness".to_string()
}

fn default_prizes() -> Vec<f64> {
    vec![500.0, 200.0]
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            name_prefix: default_name_prefix(),
            project_id: 0,
            type_id: String::new(),
            track_id: String::new(),
            timeline_template_id: String::new(),
            tags: Vec::new(),
            copilot: String::new(),
            submitters: Vec::new(),
            prizes: default_prizes(),
            submission_zip_path: None,
            poll_interval_secs: None,
            create_missing_reviews: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardFlowConfig {
    #[serde(flatten)]
    pub challenge: ChallengeSettings,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default = "default_one")]
    pub submissions_per_submitter: u32,
    #[serde(default)]
    pub review_scorecard_id: String,
    /// Chance that a review-item comment gets appealed.
    #[serde(default = "default_half")]
    pub appeal_probability: f64,
    /// Chance that an appeal is accepted.
    #[serde(default = "default_half")]
    pub appeal_accept_probability: f64,
}

fn default_one() -> u32 {
    1
}

fn default_half() -> f64 {
    0.5
}

impl Default for StandardFlowConfig {
    fn default() -> Self {
        Self {
            challenge: ChallengeSettings::default(),
            reviewers: Vec::new(),
            submissions_per_submitter: default_one(),
            review_scorecard_id: String::new(),
            appeal_probability: default_half(),
            appeal_accept_probability: default_half(),
        }
    }
}

/// First2Finish and Topgear share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeFlowConfig {
    #[serde(flatten)]
    pub challenge: ChallengeSettings,
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub scorecard_id: String,
    /// Submissions created up front before the review loop starts.
    #[serde(default = "default_one")]
    pub initial_submissions: u32,
    #[serde(default = "default_submission_delay_ms")]
    pub submission_delay_ms: u64,
    /// Failed reviews before the passing submission is made.
    #[serde(default = "default_failures_before_pass")]
    pub failures_before_pass: u32,
}

fn default_submission_delay_ms() -> u64 {
    2_000
}

fn default_failures_before_pass() -> u32 {
    2
}

impl Default for IterativeFlowConfig {
    fn default() -> Self {
        Self {
            challenge: ChallengeSettings::default(),
            reviewer: String::new(),
            scorecard_id: String::new(),
            initial_submissions: default_one(),
            submission_delay_ms: default_submission_delay_ms(),
            failures_before_pass: default_failures_before_pass(),
        }
    }
}

/// Per-phase scorecards for the design flow. Missing entries fall back
/// towards `review`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignScorecards {
    #[serde(default)]
    pub checkpoint_screening: Option<String>,
    #[serde(default)]
    pub checkpoint_review: Option<String>,
    #[serde(default)]
    pub screening: Option<String>,
    #[serde(default)]
    pub review: Option<String>,
    #[serde(default)]
    pub approval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignFlowConfig {
    #[serde(flatten)]
    pub challenge: ChallengeSettings,
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub screener: Option<String>,
    #[serde(default)]
    pub checkpoint_screener: Option<String>,
    #[serde(default)]
    pub checkpoint_reviewer: Option<String>,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default = "default_two")]
    pub checkpoint_submissions_per_submitter: u32,
    #[serde(default = "default_one")]
    pub submissions_per_submitter: u32,
    #[serde(default = "default_checkpoint_prizes")]
    pub checkpoint_prizes: Vec<f64>,
    #[serde(default)]
    pub scorecards: DesignScorecards,
}

fn default_two() -> u32 {
    2
}

fn default_checkpoint_prizes() -> Vec<f64> {
    vec![50.0]
}

impl Default for DesignFlowConfig {
    fn default() -> Self {
        Self {
            challenge: ChallengeSettings::default(),
            reviewer: String::new(),
            screener: None,
            checkpoint_screener: None,
            checkpoint_reviewer: None,
            approver: None,
            checkpoint_submissions_per_submitter: default_two(),
            submissions_per_submitter: default_one(),
            checkpoint_prizes: default_checkpoint_prizes(),
            scorecards: DesignScorecards::default(),
        }
    }
}

impl DesignFlowConfig {
    pub fn screener(&self) -> &str {
        self.screener.as_deref().unwrap_or(&self.reviewer)
    }

    pub fn checkpoint_screener(&self) -> &str {
        self.checkpoint_screener
            .as_deref()
            .unwrap_or_else(|| self.screener())
    }

    pub fn checkpoint_reviewer(&self) -> &str {
        self.checkpoint_reviewer.as_deref().unwrap_or(&self.reviewer)
    }

    pub fn approver(&self) -> &str {
        self.approver.as_deref().unwrap_or(&self.reviewer)
    }

    pub fn review_scorecard(&self) -> Option<&str> {
        self.scorecards.review.as_deref()
    }

    pub fn screening_scorecard(&self) -> Option<&str> {
        self.scorecards
            .screening
            .as_deref()
            .or_else(|| self.review_scorecard())
    }

    pub fn checkpoint_screening_scorecard(&self) -> Option<&str> {
        self.scorecards
            .checkpoint_screening
            .as_deref()
            .or_else(|| self.screening_scorecard())
    }

    pub fn checkpoint_review_scorecard(&self) -> Option<&str> {
        self.scorecards
            .checkpoint_review
            .as_deref()
            .or_else(|| self.review_scorecard())
    }

    pub fn approval_scorecard(&self) -> Option<&str> {
        self.scorecards
            .approval
            .as_deref()
            .or_else(|| self.review_scorecard())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowsConfig {
    #[serde(default)]
    pub standard: StandardFlowConfig,
    #[serde(default)]
    pub first2finish: IterativeFlowConfig,
    /// Used by both `topgear` and `topgear-late`.
    #[serde(default)]
    pub topgear: IterativeFlowConfig,
    #[serde(default)]
    pub design: DesignFlowConfig,
}

impl HarnessConfig {
    /// Resolve the config path from an explicit flag, the environment, or the
    /// working directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("HARNESS_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load from `path`, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid harness configuration")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Apply environment overrides using `lookup` (injectable for tests).
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("HARNESS_API_URL").filter(|v| !v.is_empty()) {
            self.platform.api_url = url;
        }
        if let Some(id) = lookup("HARNESS_CLIENT_ID").filter(|v| !v.is_empty()) {
            self.auth.client_id = id;
        }
        if let Some(secret) = lookup("HARNESS_CLIENT_SECRET").filter(|v| !v.is_empty()) {
            self.auth.client_secret = secret;
        }
        if let Some(token) = lookup("HARNESS_STATIC_TOKEN").filter(|v| !v.is_empty()) {
            self.auth.static_token = Some(token);
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.platform.timeout_secs)
    }

    /// Human-readable problems that would make a run fail or misbehave.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.auth.static_token.is_none()
            && (self.auth.client_id.is_empty() || self.auth.client_secret.is_empty())
        {
            warnings.push(
                "auth: neither static_token nor client_id/client_secret is set".to_string(),
            );
        }
        if self.auth.static_token.is_none() && self.auth.token_url.is_empty() {
            warnings.push("auth.token_url is empty".to_string());
        }
        if self.storage.upload_url.is_empty() {
            warnings.push(
                "storage.upload_url is empty; submissions cannot be uploaded".to_string(),
            );
        }
        if self.engine.poll_interval_secs == 0 {
            warnings.push("engine.poll_interval_secs is 0; polling will spin".to_string());
        }

        let standard = &self.flows.standard;
        check_challenge("flows.standard", &standard.challenge, &mut warnings);
        if standard.reviewers.is_empty() {
            warnings.push("flows.standard.reviewers is empty".to_string());
        }
        if standard.review_scorecard_id.is_empty() {
            warnings.push("flows.standard.review_scorecard_id is empty".to_string());
        }
        check_probability(
            "flows.standard.appeal_probability",
            standard.appeal_probability,
            &mut warnings,
        );
        check_probability(
            "flows.standard.appeal_accept_probability",
            standard.appeal_accept_probability,
            &mut warnings,
        );

        for (section, flow) in [
            ("flows.first2finish", &self.flows.first2finish),
            ("flows.topgear", &self.flows.topgear),
        ] {
            check_challenge(section, &flow.challenge, &mut warnings);
            if flow.reviewer.is_empty() {
                warnings.push(format!("{section}.reviewer is empty"));
            }
            if flow.scorecard_id.is_empty() {
                warnings.push(format!("{section}.scorecard_id is empty"));
            }
        }

        let design = &self.flows.design;
        check_challenge("flows.design", &design.challenge, &mut warnings);
        if design.reviewer.is_empty() {
            warnings.push("flows.design.reviewer is empty".to_string());
        }
        if design.review_scorecard().is_none() {
            warnings.push("flows.design.scorecards.review is not set".to_string());
        }
        if design.checkpoint_submissions_per_submitter < 2 {
            warnings.push(
                "flows.design.checkpoint_submissions_per_submitter should be at least 2 so one can fail screening"
                    .to_string(),
            );
        }

        warnings
    }
}

fn check_challenge(section: &str, challenge: &ChallengeSettings, warnings: &mut Vec<String>) {
    if challenge.copilot.is_empty() {
        warnings.push(format!("{section}.copilot is empty"));
    }
    if challenge.submitters.is_empty() {
        warnings.push(format!("{section}.submitters is empty"));
    }
    if challenge.type_id.is_empty() || challenge.track_id.is_empty() {
        warnings.push(format!("{section}: type_id and track_id must be set"));
    }
    match &challenge.submission_zip_path {
        None => warnings.push(format!("{section}.submission_zip_path is not set")),
        Some(path) if !path.exists() => warnings.push(format!(
            "{section}.submission_zip_path does not exist: {}",
            path.display()
        )),
        Some(_) => {}
    }
}

fn check_probability(field: &str, value: f64, warnings: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&value) {
        warnings.push(format!("{field} must be between 0 and 1 (got {value})"));
    }
}

/// Commented starter file written by `config init`.
pub const TEMPLATE: &str = r#"# challenge-harness configuration

[platform]
api_url = "https://api.topcoder-dev.com/v6"
timeout_secs = 30

[auth]
# Either a pre-issued token (or HARNESS_STATIC_TOKEN) ...
# static_token = ""
# ... or machine credentials (HARNESS_CLIENT_ID / HARNESS_CLIENT_SECRET)
token_url = ""
audience = ""

[storage]
upload_url = ""
key_prefix = "harness-submissions"

[engine]
poll_interval_secs = 5
review_discovery_attempts = 12
review_discovery_interval_secs = 5
phase_lag_grace_secs = 15
# seed = 42

[server]
host = "127.0.0.1"
port = 3000

[flows.standard]
name_prefix = "Harness"
type_id = ""
track_id = ""
timeline_template_id = ""
copilot = ""
reviewers = []
submitters = []
review_scorecard_id = ""
submission_zip_path = "./submission.zip"
appeal_probability = 0.5
appeal_accept_probability = 0.5

[flows.first2finish]
reviewer = ""
submitters = []
scorecard_id = ""
initial_submissions = 1
failures_before_pass = 2

[flows.topgear]
reviewer = ""
submitters = []
scorecard_id = ""

[flows.design]
reviewer = ""
submitters = []
checkpoint_submissions_per_submitter = 2

[flows.design.scorecards]
# review = ""
"#;
