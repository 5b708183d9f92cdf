//! Configuration types for cohort

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{CohortError, CohortResult};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Root directory for every job's artifacts
    pub output_dir: PathBuf,
    /// Number of replicate brains per condition
    #[serde(default = "default_replicates")]
    pub replicates: u32,
    /// Whether jobs train, test or do both
    #[serde(default)]
    pub mode: RunMode,
    /// Experimental conditions
    #[serde(default)]
    pub conditions: ConditionsConfig,
    /// Device and memory settings
    #[serde(default)]
    pub resources: ResourcesConfig,
    /// Dispatch settings
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Settings forwarded to the training worker
    #[serde(default)]
    pub training: TrainingConfig,
    /// Worker process settings
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Status API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

fn default_replicates() -> u32 {
    1
}

impl RunConfig {
    /// Create a configuration with defaults for everything but the output directory
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            replicates: default_replicates(),
            mode: RunMode::default(),
            conditions: ConditionsConfig::default(),
            resources: ResourcesConfig::default(),
            launch: LaunchConfig::default(),
            training: TrainingConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> CohortResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CohortError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| CohortError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check caller input that does not depend on devices or ports
    pub fn validate(&self) -> CohortResult<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(CohortError::Validation(
                "output_dir is required".to_string(),
            ));
        }
        if self.replicates == 0 {
            return Err(CohortError::Validation(
                "replicates must be at least 1".to_string(),
            ));
        }
        if self.conditions.known.is_empty() {
            return Err(CohortError::Validation(
                "at least one known condition is required".to_string(),
            ));
        }
        if !self.resources.buffer.is_finite() || self.resources.buffer < 1.0 {
            return Err(CohortError::Validation(format!(
                "buffer must be a finite multiplier >= 1.0, got {}",
                self.resources.buffer
            )));
        }
        if let JobMemory::Gib(gib) = self.resources.job_memory {
            if !gib.is_finite() || gib <= 0.0 {
                return Err(CohortError::Validation(format!(
                    "job_memory must be positive, got {} GiB",
                    gib
                )));
            }
        }
        if self.training.checkpoint_freq == 0 && self.training.save_checkpoints {
            return Err(CohortError::Validation(
                "checkpoint_freq must be positive when checkpoints are saved".to_string(),
            ));
        }
        if self.mode.trains() && self.training.train_iterations().is_none() {
            return Err(CohortError::Validation(format!(
                "steps_per_episode ({}) x train_episodes ({}) overflows the iteration count",
                self.training.steps_per_episode, self.training.train_episodes
            )));
        }
        if self.mode.tests() && self.training.test_iterations().is_none() {
            return Err(CohortError::Validation(
                "test_episodes x num_test_conditions x steps_per_episode overflows the iteration count"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Run mode shared by every job of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Train,
    Test,
    #[default]
    Full,
}

impl RunMode {
    pub fn trains(&self) -> bool {
        matches!(self, RunMode::Train | RunMode::Full)
    }

    pub fn tests(&self) -> bool {
        matches!(self, RunMode::Test | RunMode::Full)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Train => write!(f, "train"),
            RunMode::Test => write!(f, "test"),
            RunMode::Full => write!(f, "full"),
        }
    }
}

impl FromStr for RunMode {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(RunMode::Train),
            "test" => Ok(RunMode::Test),
            "full" => Ok(RunMode::Full),
            other => Err(CohortError::Validation(format!(
                "Unknown mode type '{}', should be one of train, test, full",
                other
            ))),
        }
    }
}

/// Known and selected experimental conditions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionsConfig {
    /// Every condition the environment supports
    #[serde(default)]
    pub known: Vec<String>,
    /// Subset to run; all known conditions when absent
    #[serde(default)]
    pub selected: Option<Vec<String>>,
}

/// Per-job device memory requirement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawJobMemory", into = "RawJobMemory")]
pub enum JobMemory {
    /// Measure with a probe job before scheduling
    Auto,
    /// Explicit budget in GiB
    Gib(f64),
}

impl JobMemory {
    /// Bytes for an explicit budget, before the buffer is applied
    pub fn explicit_bytes(&self) -> Option<u64> {
        match self {
            JobMemory::Auto => None,
            JobMemory::Gib(gib) => Some((gib * GIB) as u64),
        }
    }
}

impl Default for JobMemory {
    fn default() -> Self {
        JobMemory::Gib(4.0)
    }
}

impl fmt::Display for JobMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobMemory::Auto => write!(f, "auto"),
            JobMemory::Gib(gib) => write!(f, "{} GiB", gib),
        }
    }
}

impl FromStr for JobMemory {
    type Err = CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(JobMemory::Auto);
        }
        s.trim()
            .parse::<f64>()
            .map(JobMemory::Gib)
            .map_err(|_| {
                CohortError::Validation(format!(
                    "job_memory must be \"auto\" or a number of GiB, got '{}'",
                    s
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawJobMemory {
    Number(f64),
    Text(String),
}

impl TryFrom<RawJobMemory> for JobMemory {
    type Error = CohortError;

    fn try_from(raw: RawJobMemory) -> Result<Self, Self::Error> {
        match raw {
            RawJobMemory::Number(gib) => Ok(JobMemory::Gib(gib)),
            RawJobMemory::Text(text) => text.parse(),
        }
    }
}

impl From<JobMemory> for RawJobMemory {
    fn from(memory: JobMemory) -> Self {
        match memory {
            JobMemory::Auto => RawJobMemory::Text("auto".to_string()),
            JobMemory::Gib(gib) => RawJobMemory::Number(gib),
        }
    }
}

/// Device and memory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Per-job memory budget
    pub job_memory: JobMemory,
    /// Safety multiplier applied to the budget
    pub buffer: f64,
    /// Devices to use; all visible devices when absent
    pub devices: Option<Vec<u32>>,
    /// How the scheduler picks the next device
    pub placement: PlacementPolicy,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            job_memory: JobMemory::default(),
            buffer: 1.2,
            devices: None,
            placement: PlacementPolicy::RoundRobin,
        }
    }
}

impl ResourcesConfig {
    /// Apply the buffer to a raw per-job requirement
    pub fn buffered(&self, bytes: u64) -> u64 {
        (self.buffer * bytes as f64) as u64
    }
}

/// Device selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// Rotate through devices, one job per turn
    #[default]
    RoundRobin,
    /// Always pick the device with the most remaining free memory
    MostFree,
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementPolicy::RoundRobin => write!(f, "round-robin"),
            PlacementPolicy::MostFree => write!(f, "most-free"),
        }
    }
}

/// Order in which waitlisted jobs are promoted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitlistOrder {
    /// First waitlisted, first promoted
    #[default]
    Fifo,
    /// Most recently waitlisted first
    Lifo,
}

/// Dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// First port tried for worker environments
    pub base_port: u16,
    /// Block until every job has finished
    pub synchronous: bool,
    /// Delay between worker submissions in milliseconds
    pub stagger_ms: u64,
    /// Waitlist promotion discipline
    pub waitlist_order: WaitlistOrder,
    /// How often a job may be re-dispatched after losing its port
    pub max_port_retries: u32,
    /// Let worker output through instead of writing it to the job's logs
    pub verbose: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            base_port: 5004,
            synchronous: false,
            stagger_ms: 1000,
            waitlist_order: WaitlistOrder::Fifo,
            max_port_retries: 10,
            verbose: true,
        }
    }
}

/// Settings forwarded to the training worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub train_episodes: u64,
    pub test_episodes: u64,
    pub steps_per_episode: u64,
    /// Number of test conditions exposed by the environment
    pub num_test_conditions: u64,
    /// Recurrent policies test per episode rather than per step
    pub recurrent_policy: bool,
    pub save_checkpoints: bool,
    pub checkpoint_freq: u64,
    pub reward: RewardType,
    pub batch_mode: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_episodes: 1000,
            test_episodes: 20,
            steps_per_episode: 1000,
            num_test_conditions: 1,
            recurrent_policy: false,
            save_checkpoints: false,
            checkpoint_freq: 30_000,
            reward: RewardType::Unsupervised,
            batch_mode: true,
        }
    }
}

impl TrainingConfig {
    /// Training iterations per job, `None` on overflow
    pub fn train_iterations(&self) -> Option<u64> {
        self.steps_per_episode.checked_mul(self.train_episodes)
    }

    /// Testing iterations per job, `None` on overflow
    pub fn test_iterations(&self) -> Option<u64> {
        let episodes = self.test_episodes.checked_mul(self.num_test_conditions)?;
        if self.recurrent_policy {
            Some(episodes)
        } else {
            episodes.checked_mul(self.steps_per_episode)
        }
    }
}

/// Reward signal used by the brain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardType {
    Supervised,
    #[default]
    Unsupervised,
}

impl fmt::Display for RewardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewardType::Supervised => write!(f, "supervised"),
            RewardType::Unsupervised => write!(f, "unsupervised"),
        }
    }
}

/// Worker process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program launched for every job
    pub program: PathBuf,
    /// Arguments; `{condition}`, `{replicate_id}`, `{device}`, `{port}`,
    /// `{job_dir}`, `{mode}` and `{estimate_memory}` are substituted
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Exit code a worker uses to report that its port was already bound
    pub port_conflict_exit_code: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("cohort-worker"),
            args: Vec::new(),
            env: BTreeMap::new(),
            port_conflict_exit_code: 98,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the status server
    pub address: String,
    /// Port for the status server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RunConfig {
        let mut config = RunConfig::new("/tmp/cohort-run");
        config.conditions.known = vec!["object1".to_string(), "object2".to_string()];
        config
    }

    #[test]
    fn test_default_run_config() {
        let config = RunConfig::new("/tmp/out");
        assert_eq!(config.replicates, 1);
        assert_eq!(config.mode, RunMode::Full);
        assert_eq!(config.resources.job_memory, JobMemory::Gib(4.0));
        assert_eq!(config.launch.base_port, 5004);
        assert_eq!(config.launch.waitlist_order, WaitlistOrder::Fifo);
    }

    #[test]
    fn test_run_config_parse() {
        let toml_str = r#"
output_dir = "runs/imprinting"
replicates = 3
mode = "train"

[conditions]
known = ["object1", "object2", "object3"]
selected = ["object1"]

[resources]
job_memory = "auto"
buffer = 1.5
devices = [0, 2]
placement = "most-free"

[launch]
synchronous = true
waitlist_order = "lifo"

[worker]
program = "/usr/bin/python3"
args = ["train.py", "--port", "{port}"]
"#;
        let config: RunConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.replicates, 3);
        assert_eq!(config.mode, RunMode::Train);
        assert_eq!(config.resources.job_memory, JobMemory::Auto);
        assert_eq!(config.resources.devices, Some(vec![0, 2]));
        assert_eq!(config.resources.placement, PlacementPolicy::MostFree);
        assert!(config.launch.synchronous);
        assert_eq!(config.launch.waitlist_order, WaitlistOrder::Lifo);
        assert_eq!(config.launch.stagger_ms, 1000);
        assert_eq!(config.worker.args[2], "{port}");
    }

    #[test]
    fn test_job_memory_number_parse() {
        let config: RunConfig = toml::from_str(
            r#"
output_dir = "out"
[resources]
job_memory = 6.5
"#,
        )
        .unwrap();
        assert_eq!(config.resources.job_memory, JobMemory::Gib(6.5));
    }

    #[test]
    fn test_job_memory_rejects_unknown_keyword() {
        let result: Result<RunConfig, _> = toml::from_str(
            r#"
output_dir = "out"
[resources]
job_memory = "plenty"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_output_dir_fails_to_parse() {
        let result: Result<RunConfig, _> = toml::from_str("replicates = 2");
        assert!(result.is_err());
    }

    #[test]
    fn test_buffered_budget() {
        let resources = ResourcesConfig {
            buffer: 1.2,
            ..ResourcesConfig::default()
        };
        assert_eq!(resources.buffered(450_000_000), 540_000_000);
        assert_eq!(JobMemory::Gib(1.0).explicit_bytes(), Some(1024 * 1024 * 1024));
        assert_eq!(JobMemory::Auto.explicit_bytes(), None);
    }

    #[test]
    fn test_validate() {
        assert!(valid_config().validate().is_ok());

        let mut config = valid_config();
        config.replicates = 0;
        assert!(matches!(config.validate(), Err(CohortError::Validation(_))));

        let mut config = valid_config();
        config.resources.buffer = 0.5;
        assert!(matches!(config.validate(), Err(CohortError::Validation(_))));

        let mut config = valid_config();
        config.conditions.known.clear();
        assert!(matches!(config.validate(), Err(CohortError::Validation(_))));

        let mut config = valid_config();
        config.resources.job_memory = JobMemory::Gib(0.0);
        assert!(matches!(config.validate(), Err(CohortError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_iteration_overflow() {
        let mut config = valid_config();
        config.training.steps_per_episode = u64::MAX;
        config.training.train_episodes = 2;
        assert!(matches!(config.validate(), Err(CohortError::Validation(_))));

        let mut config = valid_config();
        config.mode = RunMode::Test;
        config.training.test_episodes = u64::MAX / 2;
        config.training.num_test_conditions = 3;
        assert!(matches!(config.validate(), Err(CohortError::Validation(_))));

        // Recurrent policies never multiply by steps_per_episode
        let mut config = valid_config();
        config.mode = RunMode::Test;
        config.training.steps_per_episode = u64::MAX;
        config.training.recurrent_policy = true;
        assert!(config.validate().is_ok());
        assert_eq!(config.training.test_iterations(), Some(20));
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!("TRAIN".parse::<RunMode>().unwrap(), RunMode::Train);
        assert!(RunMode::Full.trains() && RunMode::Full.tests());
        assert!(!RunMode::Test.trains());
        assert!(matches!(
            "evaluate".parse::<RunMode>(),
            Err(CohortError::Validation(_))
        ));
    }
}
