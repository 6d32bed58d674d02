use serde::Deserialize;

/// Complete Atrium configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AtriumConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

/// Telemetry database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "atrium.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Sensor polling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// How often the demo loop refreshes each sensor (seconds)
    #[serde(default = "default_poll_interval")]
    pub interval_seconds: u64,
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval(),
        }
    }
}

impl Default for AtriumConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AtriumConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: AtriumConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AtriumConfig::default();
        assert_eq!(config.database.path, "atrium.db");
        assert_eq!(config.poll.interval_seconds, 10);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [database]
            path = "/var/lib/atrium/telemetry.db"

            [poll]
            interval_seconds = 5
        "#;

        let config: AtriumConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database.path, "/var/lib/atrium/telemetry.db");
        assert_eq!(config.poll.interval_seconds, 5);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [poll]
            interval_seconds = 30
        "#;

        let config: AtriumConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.poll.interval_seconds, 30);
        assert_eq!(config.database.path, "atrium.db"); // Default
    }
}
