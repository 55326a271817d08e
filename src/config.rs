use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GridError, Result};

/// Preference keys understood by [`BridgeConfig::apply_preferences`].
pub const PREF_RETRIEVAL_METHOD: &str = "GridFinishedJobRetrievalMethod";
pub const PREF_ACCOUNTING_URL: &str = "GridJobAccountingURL";
pub const PREF_ACCOUNTING_USERNAME: &str = "GridJobAccountingUsername";
pub const PREF_ACCOUNTING_PASSWORD: &str = "GridJobAccountingPassword";
pub const PREF_USE_ARRAY_JOBS: &str = "GridUseArrayJobs";
pub const PREF_JOB_FILTER: &str = "GridJobFilter";

/// Where finished-job information comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalMethod {
    /// The local table maintained by the accounting synchronizer.
    #[default]
    LocalLog,
    /// An external accounting database (ARCo schema).
    ExternalAccounting,
}

impl FromStr for RetrievalMethod {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "local" => Ok(RetrievalMethod::LocalLog),
            "arco" | "external" => Ok(RetrievalMethod::ExternalAccounting),
            _ => Err(GridError::UnsupportedMethod(s.trim().to_string())),
        }
    }
}

/// Location of the Grid Engine installation and its qmaster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub sge_root: PathBuf,
    pub sge_cell: String,
    /// host:port of the qmaster
    pub qmaster_addr: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            sge_root: PathBuf::from("/opt/sge"),
            sge_cell: "default".to_string(),
            qmaster_addr: "127.0.0.1:6444".to_string(),
        }
    }
}

impl ClusterConfig {
    fn common_dir(&self) -> PathBuf {
        self.sge_root.join(&self.sge_cell).join("common")
    }

    /// `<root>/<cell>/common/accounting`
    pub fn accounting_file(&self) -> PathBuf {
        self.common_dir().join("accounting")
    }

    /// Host currently acting as qmaster, as recorded in
    /// `<root>/<cell>/common/act_qmaster`.
    pub fn act_qmaster_host(&self) -> Option<String> {
        let contents = std::fs::read_to_string(self.common_dir().join("act_qmaster")).ok()?;
        contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 15_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl MonitorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Submission and kill command settings.
#[derive(Debug, Clone)]
pub struct SubmitConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    /// Upper bound on a single qsub/qdel invocation.
    pub command_timeout_ms: u64,
    pub qsub_program: String,
    pub qdel_program: String,
    pub sudo_program: String,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 2_000,
            command_timeout_ms: 120_000,
            qsub_program: "qsub".to_string(),
            qdel_program: "qdel".to_string(),
            sudo_program: "sudo".to_string(),
        }
    }
}

/// Accounting synchronizer settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Accounting log to tail; defaults to the cluster's accounting file.
    pub accounting_file: Option<PathBuf>,
    /// Scratch directory for decompressing rotated logs.
    pub work_dir: PathBuf,
    /// Local SQLite database holding finished records and the sync cursor.
    pub database_path: PathBuf,
    pub pool_size: usize,
    pub poll_interval_ms: u64,
    pub tail_interval_ms: u64,
    pub default_window_secs: u64,
    pub sync_slack_secs: u64,
    pub sweep_interval_ms: u64,
    pub retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            accounting_file: None,
            work_dir: PathBuf::from("."),
            database_path: PathBuf::from("accounting.db"),
            pool_size: 2,
            poll_interval_ms: 10_000,
            tail_interval_ms: 2_000,
            default_window_secs: 24 * 60 * 60,
            sync_slack_secs: 5 * 60,
            sweep_interval_ms: 30 * 60 * 1000,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// External accounting database (ARCo) settings.
#[derive(Debug, Clone)]
pub struct AccountingBackendConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for AccountingBackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            pool_size: 5,
            reconnect_delay_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub cluster: ClusterConfig,
    pub monitor: MonitorConfig,
    pub submit: SubmitConfig,
    pub sync: SyncConfig,
    pub accounting: AccountingBackendConfig,
    pub retrieval_method: RetrievalMethod,
    pub use_array_jobs: bool,
    pub job_filter: String,
    pub api_addr: Option<SocketAddr>,
}

impl BridgeConfig {
    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            ..Default::default()
        }
    }

    pub fn with_retrieval_method(mut self, method: RetrievalMethod) -> Self {
        self.retrieval_method = method;
        self
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    /// The accounting log the synchronizer tails.
    pub fn accounting_file(&self) -> PathBuf {
        self.sync
            .accounting_file
            .clone()
            .unwrap_or_else(|| self.cluster.accounting_file())
    }

    /// Apply orchestrator preferences. Unknown keys are ignored; an unsupported
    /// retrieval method is rejected.
    pub fn apply_preferences(&mut self, prefs: &HashMap<String, String>) -> Result<()> {
        if let Some(method) = prefs.get(PREF_RETRIEVAL_METHOD) {
            self.retrieval_method = method.parse()?;
        }
        if let Some(url) = prefs.get(PREF_ACCOUNTING_URL) {
            self.accounting.url = non_empty(url);
        }
        if let Some(user) = prefs.get(PREF_ACCOUNTING_USERNAME) {
            self.accounting.username = non_empty(user);
        }
        if let Some(password) = prefs.get(PREF_ACCOUNTING_PASSWORD) {
            self.accounting.password = non_empty(password);
        }
        if let Some(flag) = prefs.get(PREF_USE_ARRAY_JOBS) {
            self.use_array_jobs = flag.trim().eq_ignore_ascii_case("true");
        }
        if let Some(filter) = prefs.get(PREF_JOB_FILTER) {
            self.job_filter = filter.clone();
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
