use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    /// Maximum lifetime of a registry subscription before it is force-closed
    /// (15 minutes in production). Overridable so integration tests don't
    /// have to wait 15 real minutes.
    pub session_max_duration: Duration,
    /// Bounded number of optimistic-conflict retry attempts.
    pub retry_max_attempts: u32,
    /// Fixed backoff between retry attempts.
    pub retry_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            session_max_duration: Duration::from_secs(
                env::var("SESSION_MAX_DURATION_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(900),
            ),
            retry_max_attempts: env::var("RETRY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            retry_backoff: Duration::from_millis(
                env::var("RETRY_BACKOFF_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100),
            ),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for Config {
    /// Sensible defaults for tests that don't care about the database.
    fn default() -> Self {
        Config {
            database_url: String::new(),
            server_host: "127.0.0.1".into(),
            server_port: 8080,
            session_max_duration: Duration::from_secs(900),
            retry_max_attempts: 5,
            retry_backoff: Duration::from_millis(100),
        }
    }
}
