use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::schedule::{RunRetry, WeeklyTrigger};

pub const DEFAULT_LISTING_URL: &str = "https://lcf.ca.gov/city-clerk/agenda-minutes/";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub llm: LlmConfig,
    pub email: EmailConfig,
    pub schedule: ScheduleConfig,
    pub alerts: AlertConfig,
    #[serde(skip)]
    pub bodies: Vec<BodyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub data_dir: PathBuf,
    pub environment: String,
    pub debug: bool,
    pub days_back: u32,
    pub fetch_concurrency: usize,
    pub bodies_file: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            environment: "production".to_string(),
            debug: false,
            days_back: 30,
            fetch_concurrency: 2,
            bodies_file: PathBuf::from("bodies.yaml"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_calls_per_run: usize,
    pub call_delay_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub max_input_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 1000,
            temperature: 0.3,
            max_calls_per_run: 50,
            call_delay_ms: 1000,
            max_retries: 2,
            retry_delay_ms: 2000,
            request_timeout_secs: 60,
            max_input_chars: 15_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub send_empty_report: bool,
    pub outbox: bool,
    pub webhook_url: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            from: None,
            to: Vec::new(),
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            send_empty_report: false,
            outbox: true,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub day: String,
    pub time: String,
    pub utc_offset: String,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            day: "monday".to_string(),
            time: "09:00".to_string(),
            utc_offset: "-08:00".to_string(),
            max_attempts: 3,
            retry_delay_secs: 120,
        }
    }
}

impl ScheduleConfig {
    pub fn trigger(&self) -> Result<WeeklyTrigger> {
        WeeklyTrigger::parse(&self.day, &self.time, &self.utc_offset)
    }

    pub fn retry(&self) -> RunRetry {
        RunRetry {
            max_attempts: self.max_attempts,
            delay: std::time::Duration::from_secs(self.retry_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
}

/// One tracked government body and where its documents come from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BodyConfig {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub source: SourceConfig,
}

impl BodyConfig {
    pub fn web(name: &str, keywords: &[&str], url: &str) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            source: SourceConfig::Web {
                url: url.to_string(),
            },
        }
    }

    /// True when `text` mentions one of the body's keywords (or its name).
    pub fn matches(&self, text: &str) -> bool {
        let lowered = crate::identity::normalize(&text.replace(['_', '-'], " "));
        if lowered.contains(&self.name.to_lowercase()) {
            return true;
        }
        self.keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Web { url: String },
    Folder { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
struct BodiesFile {
    bodies: Vec<BodyConfig>,
}

/// La Cañada Flintridge bodies tracked when no `bodies.yaml` exists.
pub fn default_bodies() -> Vec<BodyConfig> {
    vec![
        BodyConfig::web("City Council", &["city council"], DEFAULT_LISTING_URL),
        BodyConfig::web("Design Commission", &["design"], DEFAULT_LISTING_URL),
        BodyConfig::web(
            "Investment & Financing Advisory Committee",
            &["investment", "financing"],
            DEFAULT_LISTING_URL,
        ),
        BodyConfig::web("Parks & Recreation Commission", &["parks"], DEFAULT_LISTING_URL),
        BodyConfig::web("Planning Commission", &["planning"], DEFAULT_LISTING_URL),
        BodyConfig::web("Public Safety Commission", &["safety"], DEFAULT_LISTING_URL),
        BodyConfig::web(
            "Public Works and Traffic Commission",
            &["works", "traffic"],
            DEFAULT_LISTING_URL,
        ),
        BodyConfig::web(
            "Sustainability and Resilience Commission",
            &["sustainability", "resilience"],
            DEFAULT_LISTING_URL,
        ),
    ]
}

impl Config {
    /// Loads `civic.toml` (defaults when absent), the bodies registry and
    /// environment overrides, then validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(env)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let bodies_path = if config.general.bodies_file.is_absolute() {
            config.general.bodies_file.clone()
        } else {
            base.join(&config.general.bodies_file)
        };
        config.bodies = load_bodies(&bodies_path)?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = env("DATA_DIR") {
            self.general.data_dir = PathBuf::from(value);
        }
        if let Some(value) = env("ENVIRONMENT") {
            self.general.environment = value;
        }
        if let Some(value) = env("DEBUG") {
            self.general.debug = parse_flag(&value);
        }
        if let Some(value) = env("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.llm.api_key = Some(value);
        }
        if let Some(value) = env("OPENAI_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = env("MAX_TOKENS") {
            self.llm.max_tokens = parse_number("MAX_TOKENS", &value)?;
        }
        if let Some(value) = env("MAX_API_CALLS_PER_RUN") {
            self.llm.max_calls_per_run = parse_number("MAX_API_CALLS_PER_RUN", &value)?;
        }
        if let Some(value) = env("API_CALL_DELAY_MS") {
            self.llm.call_delay_ms = parse_number("API_CALL_DELAY_MS", &value)?;
        }
        if let Some(value) = env("SEND_EMAIL") {
            self.email.enabled = parse_flag(&value);
        }
        if let Some(value) = env("EMAIL_FROM") {
            self.email.from = Some(value);
        }
        if let Some(value) = env("EMAIL_TO") {
            self.email.to = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = env("SMTP_SERVER") {
            self.email.smtp_server = value;
        }
        if let Some(value) = env("SMTP_PORT") {
            self.email.smtp_port = parse_number("SMTP_PORT", &value)?;
        }
        if let Some(value) = env("SMTP_USERNAME") {
            self.email.smtp_username = Some(value);
        }
        if let Some(value) = env("SMTP_PASSWORD") {
            self.email.smtp_password = Some(value);
        }
        if let Some(value) = env("EMAIL_WEBHOOK_URL") {
            self.email.webhook_url = Some(value);
        }
        if let Some(value) = env("SCHEDULE_DAY") {
            self.schedule.day = value.to_lowercase();
        }
        if let Some(value) = env("SCHEDULE_TIME") {
            self.schedule.time = value;
        }
        if let Some(value) = env("SCHEDULE_UTC_OFFSET") {
            self.schedule.utc_offset = value;
        }
        if let Some(value) = env("SCHEDULE_MAX_ATTEMPTS") {
            self.schedule.max_attempts = parse_number("SCHEDULE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = env("SCHEDULE_RETRY_DELAY_SECS") {
            self.schedule.retry_delay_secs = parse_number("SCHEDULE_RETRY_DELAY_SECS", &value)?;
        }
        if let Some(value) = env("ALERT_WEBHOOK_URL") {
            self.alerts.webhook_url = Some(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.fetch_concurrency == 0 {
            bail!("general.fetch_concurrency must be at least 1");
        }
        if self.schedule.max_attempts == 0 {
            bail!("schedule.max_attempts must be at least 1");
        }
        if self.bodies.is_empty() {
            bail!("no government bodies configured");
        }
        for body in &self.bodies {
            if body.name.trim().is_empty() {
                bail!("a configured body has an empty name");
            }
        }
        self.schedule.trigger()?;
        Ok(())
    }

    /// Names of settings a production deployment is expected to provide.
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.llm.api_key.is_none() {
            missing.push("OPENAI_API_KEY");
        }
        if self.email.enabled {
            if self.email.from.is_none() {
                missing.push("EMAIL_FROM");
            }
            if self.email.to.is_empty() {
                missing.push("EMAIL_TO");
            }
            if self.email.smtp_username.is_none() {
                missing.push("SMTP_USERNAME");
            }
            if self.email.smtp_password.is_none() {
                missing.push("SMTP_PASSWORD");
            }
        }
        missing
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.general.data_dir)
    }
}

fn load_bodies(path: &Path) -> Result<Vec<BodyConfig>> {
    if !path.exists() {
        return Ok(default_bodies());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading bodies registry {}", path.display()))?;
    let parsed: BodiesFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing bodies registry {}", path.display()))?;
    Ok(parsed.bodies)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{name} must be a number, got {value:?}"))
}

/// On-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub archive_dir: PathBuf,
    pub public_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub lock_file: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            archive_dir: root.join("archive"),
            public_dir: root.join("public"),
            reports_dir: root.join("reports"),
            lock_file: root.join(".run.lock"),
            root,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.archive_dir)?;
        fs::create_dir_all(&self.public_dir)?;
        fs::create_dir_all(&self.reports_dir)?;
        Ok(())
    }
}
