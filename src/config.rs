use std::env;

/// Runtime settings, environment-driven. Every option has a default so the
/// engine starts against a local Prometheus with no configuration at all.
#[derive(Debug, Clone)]
pub struct Settings {
    pub prom_url: String,
    pub alertmanager_url: String,
    /// SQLite path for the durable store; an optional `sqlite://` prefix is
    /// accepted and stripped.
    pub database_url: String,
    /// Fallback query when discovery is disabled or returns nothing.
    pub prom_query: String,
    /// Retention window W_R in hours; delta-sync cold start reaches this far back.
    pub lookback_hours: i64,
    pub check_interval_minutes: u64,
    pub prom_skip_ssl: bool,
    pub am_skip_ssl: bool,
    pub alert_repeat_interval_minutes: i64,
    pub contamination: f64,
    pub metric_discovery_enabled: bool,
    pub metric_discovery_pattern: String,
    pub max_workers: usize,
    /// Analysis window W_A in hours: cache span and detector history span.
    pub analysis_window_hours: i64,

    pub telegram_enabled: bool,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,

    pub email_enabled: bool,
    pub email_recipients: Vec<String>,
    pub smtp_from: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,

    pub alertmanager_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prom_url: "http://localhost:9090".to_string(),
            alertmanager_url: "http://localhost:9093".to_string(),
            database_url: "aiops.db".to_string(),
            prom_query: "up".to_string(),
            lookback_hours: 720,
            check_interval_minutes: 5,
            prom_skip_ssl: false,
            am_skip_ssl: false,
            alert_repeat_interval_minutes: 60,
            contamination: 0.05,
            metric_discovery_enabled: true,
            metric_discovery_pattern:
                "^(up|node_cpu_seconds_total|node_memory_.*|node_filesystem_.*|node_network_.*)$"
                    .to_string(),
            max_workers: 10,
            analysis_window_hours: 168,
            telegram_enabled: false,
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            email_enabled: false,
            email_recipients: Vec::new(),
            smtp_from: "aiops@domain.com".to_string(),
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            alertmanager_enabled: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        let (smtp_server, smtp_port) = parse_smarthost(
            &env_or("SMTP_SMARTHOST", "smtp.gmail.com:587"),
            defaults.smtp_port,
        );
        Self {
            prom_url: env_or("PROM_URL", &defaults.prom_url),
            alertmanager_url: env_or("ALERTMANAGER_URL", &defaults.alertmanager_url),
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            prom_query: env_or("PROM_QUERY", &defaults.prom_query),
            lookback_hours: env_parsed("LOOKBACK_HOURS", defaults.lookback_hours),
            check_interval_minutes: env_parsed(
                "CHECK_INTERVAL_MINUTES",
                defaults.check_interval_minutes,
            ),
            prom_skip_ssl: env_bool("PROM_SKIP_SSL", false),
            am_skip_ssl: env_bool("AM_SKIP_SSL", false),
            alert_repeat_interval_minutes: env_parsed(
                "ALERT_REPEAT_INTERVAL_MINUTES",
                defaults.alert_repeat_interval_minutes,
            ),
            contamination: env_parsed("CONTAMINATION", defaults.contamination),
            metric_discovery_enabled: env_bool("METRIC_DISCOVERY_ENABLED", true),
            metric_discovery_pattern: env_or(
                "METRIC_DISCOVERY_PATTERN",
                &defaults.metric_discovery_pattern,
            ),
            max_workers: env_parsed("MAX_WORKERS", defaults.max_workers),
            analysis_window_hours: env_parsed(
                "ANALYSIS_WINDOW_HOURS",
                defaults.analysis_window_hours,
            ),
            telegram_enabled: env_bool("TELEGRAM_ENABLED", false),
            telegram_bot_token: env_or("TELEGRAM_BOT_TOKEN", ""),
            telegram_chat_id: env_or("TELEGRAM_CHAT_ID", ""),
            email_enabled: env_bool("EMAIL_ENABLED", false),
            email_recipients: split_recipients(&env_or("EMAIL_RECIPIENTS", "")),
            smtp_from: env_or("SMTP_FROM", &defaults.smtp_from),
            smtp_server,
            smtp_port,
            smtp_username: env_or("SMTP_AUTH_USERNAME", ""),
            smtp_password: env_or("SMTP_AUTH_PASSWORD", ""),
            alertmanager_enabled: env_bool("ALERTMANAGER_ENABLED", false),
        }
    }

    /// Filesystem path of the SQLite store.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v.to_lowercase() == "true",
        Err(_) => default,
    }
}

/// Split a `host:port` smarthost; a bare host keeps the default port.
fn parse_smarthost(smarthost: &str, default_port: u16) -> (String, u16) {
    match smarthost.split_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (smarthost.to_string(), default_port),
    }
}

fn split_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
