//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use transfer_core::settings::{MAX_FAN_OUT, MAX_QUEUE_CAPACITY, MAX_RETENTION_DAYS, MAX_WORKERS};
use transfer_core::{DuplicateAction, EngineSettings, HashAlgorithm};

/// Line-oriented `key = value` file configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// SQLite database holding job records.
    pub database_path: Option<PathBuf>,
    /// Provider targets file replacing the built-in list.
    pub targets_file: Option<PathBuf>,
    /// Directory for staging areas and download archives.
    pub jobs_dir: Option<PathBuf>,
    /// Bound on concurrent provider calls within one job.
    pub fan_out_concurrency: Option<usize>,
    /// Number of jobs run at once.
    pub worker_count: Option<usize>,
    /// Number of accepted jobs that may wait for a worker.
    pub queue_capacity: Option<usize>,
    /// Days until a ticket becomes eligible for cleanup.
    pub retention_days: Option<u32>,
    /// Algorithm computed when the provider supplies none.
    pub default_hash_algorithm: Option<HashAlgorithm>,
    /// Upload policy when a same-titled file exists.
    pub duplicate_action: Option<DuplicateAction>,
    /// Suffix template for disambiguated titles.
    pub duplicate_title_template: Option<String>,
    /// Provider HTTP connect timeout in seconds.
    pub http_connect_timeout_secs: Option<u64>,
    /// Provider HTTP read timeout in seconds.
    pub http_read_timeout_secs: Option<u64>,
    /// GitHub API root (GitHub Enterprise).
    pub github_api_url: Option<String>,
}

impl FileConfig {
    /// Validates config values against engine constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("fan_out_concurrency", self.fan_out_concurrency, 1, MAX_FAN_OUT)?;
        validate_range("worker_count", self.worker_count, 1, MAX_WORKERS)?;
        validate_range("queue_capacity", self.queue_capacity, 1, MAX_QUEUE_CAPACITY)?;
        if let Some(days) = self.retention_days
            && !(1..=MAX_RETENTION_DAYS).contains(&days)
        {
            bail!(
                "Invalid config value for `retention_days`: {days}. Expected range: 1..={MAX_RETENTION_DAYS}"
            );
        }
        if let Some(template) = &self.duplicate_title_template
            && template.matches('*').count() != 1
        {
            bail!(
                "Invalid config value for `duplicate_title_template`: '{template}'. Expected exactly one '*'"
            );
        }
        validate_timeout_secs("http_connect_timeout_secs", self.http_connect_timeout_secs)?;
        validate_timeout_secs("http_read_timeout_secs", self.http_read_timeout_secs)?;
        Ok(())
    }

    /// Overlays the configured engine values onto `settings`.
    pub fn apply_to(&self, settings: &mut EngineSettings) {
        if let Some(jobs_dir) = &self.jobs_dir {
            settings.jobs_dir.clone_from(jobs_dir);
        }
        if let Some(value) = self.fan_out_concurrency {
            settings.fan_out_concurrency = value;
        }
        if let Some(value) = self.worker_count {
            settings.worker_count = value;
        }
        if let Some(value) = self.queue_capacity {
            settings.queue_capacity = value;
        }
        if let Some(value) = self.retention_days {
            settings.retention_days = value;
        }
        if let Some(value) = self.default_hash_algorithm {
            settings.default_hash_algorithm = value;
        }
        if let Some(value) = self.duplicate_action {
            settings.duplicate_action = value;
        }
        if let Some(template) = &self.duplicate_title_template {
            settings.duplicate_title_template.clone_from(template);
        }
    }
}

fn validate_range(field: &str, value: Option<usize>, min: usize, max: usize) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/transfer/config.toml`
/// 2. `$HOME/.config/transfer/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("transfer").join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("transfer")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given, else the default path if it exists.
///
/// An explicit path that does not exist is an error; a missing default file
/// yields an empty config.
pub fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    if let Some(path) = explicit {
        return load_file_config(path);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_no = line_index + 1;
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "database_path" => {
                cfg.database_path = Some(PathBuf::from(parse_string_literal(value).with_context(invalid)?));
            }
            "targets_file" => {
                cfg.targets_file = Some(PathBuf::from(parse_string_literal(value).with_context(invalid)?));
            }
            "jobs_dir" => {
                cfg.jobs_dir = Some(PathBuf::from(parse_string_literal(value).with_context(invalid)?));
            }
            "fan_out_concurrency" => {
                cfg.fan_out_concurrency = Some(parse_integer_usize(value).with_context(invalid)?);
            }
            "worker_count" => {
                cfg.worker_count = Some(parse_integer_usize(value).with_context(invalid)?);
            }
            "queue_capacity" => {
                cfg.queue_capacity = Some(parse_integer_usize(value).with_context(invalid)?);
            }
            "retention_days" => {
                let parsed = parse_integer_u64(value).with_context(invalid)?;
                let days = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("retention_days out of range for u32"))
                    .with_context(invalid)?;
                cfg.retention_days = Some(days);
            }
            "default_hash_algorithm" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                let algorithm = parsed
                    .parse::<HashAlgorithm>()
                    .map_err(anyhow::Error::msg)
                    .with_context(invalid)?;
                cfg.default_hash_algorithm = Some(algorithm);
            }
            "duplicate_action" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                let action = parsed
                    .parse::<DuplicateAction>()
                    .map_err(anyhow::Error::msg)
                    .with_context(invalid)?;
                cfg.duplicate_action = Some(action);
            }
            "duplicate_title_template" => {
                cfg.duplicate_title_template = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "http_connect_timeout_secs" => {
                cfg.http_connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "http_read_timeout_secs" => {
                cfg.http_read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "github_api_url" => {
                cfg.github_api_url = Some(parse_string_literal(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_integer_usize(raw_value: &str) -> Result<usize> {
    let value = parse_integer_u64(raw_value)?;
    usize::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for usize"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
worker_count = 8
duplicate_action = "update"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.worker_count, Some(8));
        assert_eq!(cfg.duplicate_action, Some(DuplicateAction::Update));
        assert!(cfg.database_path.is_none());
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(
            r#"
fan_out_concurrency = 4 # parallel listings
duplicate_title_template = " #*" # hash inside the string is kept
"#,
        )
        .expect("config with comments should parse");
        assert_eq!(cfg.fan_out_concurrency, Some(4));
        assert_eq!(cfg.duplicate_title_template.as_deref(), Some(" #*"));
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_values() {
        let err = parse_config_str("fan_out_concurrency = 0").expect_err("0 is below range");
        assert!(err.to_string().contains("fan_out_concurrency"));

        let err = parse_config_str("retention_days = 366").expect_err("366 is above range");
        assert!(err.to_string().contains("retention_days"));

        let err = parse_config_str("http_read_timeout_secs = 0").expect_err("0 is below range");
        assert!(err.to_string().contains("http_read_timeout_secs"));
    }

    #[test]
    fn test_parse_config_rejects_template_without_star() {
        let err = parse_config_str(r#"duplicate_title_template = " (copy)""#)
            .expect_err("template needs one star");
        assert!(err.to_string().contains("duplicate_title_template"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_hash_algorithm() {
        let err = parse_config_str(r#"default_hash_algorithm = "crc32""#)
            .expect_err("crc32 is not supported");
        assert!(format!("{err:#}").contains("default_hash_algorithm"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_paths() {
        let err = parse_config_str("database_path = /tmp/jobs.db").expect_err("paths are quoted");
        assert!(err.to_string().contains("database_path"));
    }

    #[test]
    fn test_apply_to_overrides_only_set_fields() {
        let cfg = parse_config_str(
            r#"
jobs_dir = "/var/lib/transfer"
retention_days = 10
default_hash_algorithm = "md5"
"#,
        )
        .expect("config should parse");
        let mut settings = EngineSettings::default();
        cfg.apply_to(&mut settings);
        assert_eq!(settings.jobs_dir, PathBuf::from("/var/lib/transfer"));
        assert_eq!(settings.retention_days, 10);
        assert_eq!(settings.default_hash_algorithm, HashAlgorithm::Md5);
        assert_eq!(settings.worker_count, EngineSettings::default().worker_count);
    }
}
