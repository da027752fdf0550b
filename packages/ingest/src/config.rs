//! Loads [`IngestConfig`] from an optional TOML file plus environment
//! overrides.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, then
//! `VK_API_URL`, `VK_REQUESTS_PER_SECOND` and `VK_ACCESS_TOKEN`.

use std::path::{Path, PathBuf};

use vk_ingest_models::IngestConfig;
use vk_ingest_source::AccessToken;

/// Environment variable holding the VK access token.
pub const ACCESS_TOKEN_VAR: &str = "VK_ACCESS_TOKEN";

/// Environment variable overriding [`IngestConfig::api_url`].
pub const API_URL_VAR: &str = "VK_API_URL";

/// Environment variable overriding [`IngestConfig::requests_per_second`].
pub const REQUESTS_PER_SECOND_VAR: &str = "VK_REQUESTS_PER_SECOND";

/// Errors that can occur while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`IngestConfig`].
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Resolved worker settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: IngestConfig,
    /// Token from the environment, if set.
    pub access_token: Option<AccessToken>,
}

impl Settings {
    /// Loads settings from `path` (if given) and the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Like [`Self::load`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the resulting configuration is invalid.
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                log::debug!("Loaded config from {}", path.display());
                parse(&text)?
            }
            None => IngestConfig::default(),
        };

        let config = apply_overrides(config, &lookup)?;
        validate(&config)?;

        let access_token = lookup(ACCESS_TOKEN_VAR)
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
            .map(AccessToken::new);

        Ok(Self {
            config,
            access_token,
        })
    }
}

/// Parses a TOML document into [`IngestConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] on malformed TOML or unknown value types.
pub fn parse(text: &str) -> Result<IngestConfig, ConfigError> {
    Ok(toml::from_str(text)?)
}

/// Applies environment overrides to `config`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if an override cannot be parsed.
pub fn apply_overrides(
    mut config: IngestConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<IngestConfig, ConfigError> {
    if let Some(url) = lookup(API_URL_VAR) {
        log::debug!("{API_URL_VAR} overrides api_url");
        config.api_url = url;
    }

    if let Some(rate) = lookup(REQUESTS_PER_SECOND_VAR) {
        config.requests_per_second =
            rate.trim().parse().map_err(|e| ConfigError::Invalid {
                message: format!("{REQUESTS_PER_SECOND_VAR}={rate:?}: {e}"),
            })?;
    }

    Ok(config)
}

/// Parses a comma-separated list of VK group ids.
///
/// Accepts wall owner ids (`-123`) and `club123`/`public123` forms, and
/// drops duplicates while keeping the first-seen order.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for an empty list or an id that is not
/// a positive number.
pub fn parse_group_ids(input: &str) -> Result<Vec<i64>, ConfigError> {
    let mut ids = Vec::new();

    for raw in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let digits = raw
            .strip_prefix("club")
            .or_else(|| raw.strip_prefix("public"))
            .unwrap_or(raw);
        let id = digits
            .parse::<i64>()
            .ok()
            .map(i64::abs)
            .filter(|&id| id > 0)
            .ok_or_else(|| ConfigError::Invalid {
                message: format!("not a VK group id: {raw:?}"),
            })?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        return Err(ConfigError::Invalid {
            message: "no group ids given".to_owned(),
        });
    }
    Ok(ids)
}

fn validate(config: &IngestConfig) -> Result<(), ConfigError> {
    let problems = config.problems();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            message: problems.join("; "),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = Settings::load_with(None, env(&[])).unwrap();

        assert_eq!(settings.config, IngestConfig::default());
        assert!(settings.access_token.is_none());
    }

    #[test]
    fn env_overrides_file_values() {
        let config = parse("requests_per_second = 2\napi_url = \"http://file\"").unwrap();
        let config = apply_overrides(
            config,
            env(&[
                (REQUESTS_PER_SECOND_VAR, "1"),
                (API_URL_VAR, "http://localhost:9000"),
            ]),
        )
        .unwrap();

        assert_eq!(config.requests_per_second, 1);
        assert_eq!(config.api_url, "http://localhost:9000");
    }

    #[test]
    fn reads_token_from_env() {
        let settings =
            Settings::load_with(None, env(&[(ACCESS_TOKEN_VAR, "  secret  ")])).unwrap();

        assert_eq!(settings.access_token.unwrap().expose(), "secret");
    }

    #[test]
    fn blank_token_is_ignored() {
        let settings = Settings::load_with(None, env(&[(ACCESS_TOKEN_VAR, " ")])).unwrap();
        assert!(settings.access_token.is_none());
    }

    #[test]
    fn rejects_unparseable_rate() {
        let result = Settings::load_with(None, env(&[(REQUESTS_PER_SECOND_VAR, "fast")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_zero_rate() {
        let result = Settings::load_with(None, env(&[(REQUESTS_PER_SECOND_VAR, "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = Settings::load_with(Some(Path::new("/nonexistent/vk.toml")), env(&[]));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn parses_group_id_forms() {
        assert_eq!(
            parse_group_ids("100, -200,club300,public400,100").unwrap(),
            vec![100, 200, 300, 400]
        );
    }

    #[test]
    fn rejects_bad_group_ids() {
        assert!(parse_group_ids("").is_err());
        assert!(parse_group_ids("100,durov").is_err());
        assert!(parse_group_ids("0").is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            parse("requests_per_second = \"three\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
