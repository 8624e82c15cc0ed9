use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackendKind {
    Json,
    Sqlite,
}

impl SessionBackendKind {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(anyhow::anyhow!(
                "Invalid DECOY_SESSION_BACKEND '{other}'. Expected 'json' or 'sqlite'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    Hybrid,
    EpsilonGreedy,
}

impl PolicyMode {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "hybrid" => Ok(Self::Hybrid),
            "epsilon_greedy" => Ok(Self::EpsilonGreedy),
            other => Err(anyhow::anyhow!(
                "Invalid DECOY_POLICY_MODE '{other}'. Expected 'hybrid' or 'epsilon_greedy'"
            )),
        }
    }
}

/// Remote model endpoint used for proposals and adjudication.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port the HTTP API listens on
    pub port: u16,
    /// Required `x-api-key` header value, if any
    pub api_key: Option<String>,
    /// Root for session files and learning snapshots
    pub data_dir: PathBuf,
    pub session_backend: SessionBackendKind,
    pub database_url: String,
    /// How long a turn waits for its session lock before degrading
    pub lock_timeout: Duration,
    /// Budget for the whole five-stage pipeline
    pub turn_budget: Duration,
    /// Budget for a single collaborator call
    pub collaborator_timeout: Duration,
    pub solver_timeout: Duration,
    pub session_cache_capacity: usize,
    pub lock_table_capacity: usize,
    /// Minimum spacing between durable writes of one session
    pub persist_interval: Duration,
    pub checkpoint_interval: Duration,
    pub history_limit: usize,
    pub policy_mode: PolicyMode,
    /// Economic value credited per confirmed intel item, in rupees
    pub intel_value_inr: f64,
    pub llm: Option<LlmConfig>,
    /// JSONL file receiving audit records; tracing events when unset
    pub audit_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
            data_dir: PathBuf::from("./data"),
            session_backend: SessionBackendKind::Json,
            database_url: "sqlite:./data/sessions.db".to_string(),
            lock_timeout: Duration::from_millis(600),
            turn_budget: Duration::from_millis(1200),
            collaborator_timeout: Duration::from_millis(900),
            solver_timeout: Duration::from_millis(150),
            session_cache_capacity: 2000,
            lock_table_capacity: 5000,
            persist_interval: Duration::from_millis(2000),
            checkpoint_interval: Duration::from_secs(30),
            history_limit: 120,
            policy_mode: PolicyMode::Hybrid,
            intel_value_inr: 500.0,
            llm: None,
            audit_log: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let data_dir = PathBuf::from(env_str(
            "DECOY_DATA_DIR",
            &defaults.data_dir.to_string_lossy(),
        ));
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite:{}", data_dir.join("sessions.db").to_string_lossy())
        });

        let llm = match (env_opt("LLM_API_KEY"), env_opt("LLM_MODEL")) {
            (Some(api_key), model) => Some(LlmConfig {
                api_base: env_str("LLM_API_BASE", "https://api.openai.com/v1"),
                api_key,
                model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            }),
            (None, _) => None,
        };

        Ok(Self {
            port: env_parse("DECOY_PORT", defaults.port)?,
            api_key: env_opt("DECOY_API_KEY"),
            data_dir,
            session_backend: SessionBackendKind::from_env(&env_str(
                "DECOY_SESSION_BACKEND",
                "json",
            ))?,
            database_url,
            lock_timeout: Duration::from_millis(env_parse("DECOY_LOCK_TIMEOUT_MS", 600)?),
            turn_budget: Duration::from_millis(env_parse("DECOY_TURN_BUDGET_MS", 1200)?),
            collaborator_timeout: Duration::from_millis(env_parse(
                "DECOY_COLLABORATOR_TIMEOUT_MS",
                900,
            )?),
            solver_timeout: Duration::from_millis(env_parse("DECOY_SOLVER_TIMEOUT_MS", 150)?),
            session_cache_capacity: env_parse(
                "DECOY_SESSION_CACHE_CAPACITY",
                defaults.session_cache_capacity,
            )?,
            lock_table_capacity: env_parse(
                "DECOY_LOCK_TABLE_CAPACITY",
                defaults.lock_table_capacity,
            )?,
            persist_interval: Duration::from_millis(env_parse("DECOY_PERSIST_INTERVAL_MS", 2000)?),
            checkpoint_interval: Duration::from_secs(env_parse(
                "DECOY_CHECKPOINT_INTERVAL_SECS",
                30,
            )?),
            history_limit: env_parse("DECOY_HISTORY_LIMIT", defaults.history_limit)?,
            policy_mode: PolicyMode::from_env(&env_str("DECOY_POLICY_MODE", "hybrid"))?,
            intel_value_inr: env_parse("DECOY_INTEL_VALUE_INR", defaults.intel_value_inr)?,
            llm,
            audit_log: env_opt("DECOY_AUDIT_LOG").map(PathBuf::from),
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn learning_dir(&self) -> PathBuf {
        self.data_dir.join("learning")
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!(
            SessionBackendKind::from_env("sqlite").unwrap(),
            SessionBackendKind::Sqlite
        );
        assert!(SessionBackendKind::from_env("redis").is_err());
        assert_eq!(
            PolicyMode::from_env("epsilon_greedy").unwrap(),
            PolicyMode::EpsilonGreedy
        );
    }

    #[test]
    fn test_env_parse_reports_key() {
        std::env::set_var("DECOY_TEST_BAD_PORT", "eighty");
        let err = env_parse::<u16>("DECOY_TEST_BAD_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("DECOY_TEST_BAD_PORT"));
        std::env::remove_var("DECOY_TEST_BAD_PORT");
        assert_eq!(env_parse::<u16>("DECOY_TEST_BAD_PORT", 7).unwrap(), 7);
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_millis(600));
        assert_eq!(config.session_cache_capacity, 2000);
        assert_eq!(config.lock_table_capacity, 5000);
        assert_eq!(config.history_limit, 120);
        assert_eq!(config.sessions_dir(), PathBuf::from("./data/sessions"));
    }
}
