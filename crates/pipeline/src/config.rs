use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use soulgen_core::job::{SubmissionFlags, DEFAULT_IMAGE_SIZE};
use soulgen_dashscope::api::{DashScopeConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};

use crate::error::GenerationError;
use crate::poller::PollSettings;
use crate::retry::RetryPolicy;

/// Generation pipeline configuration loaded from environment variables.
///
/// Everything except the API key has a default suitable for local
/// development. Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Default size descriptor, e.g. `1024*1024`.
    pub image_size: String,
    pub flags: SubmissionFlags,
    /// Directory generated images are written to.
    pub output_dir: PathBuf,
    /// URL path the output directory is served under.
    pub public_url_prefix: String,
    pub poll: PollSettings,
    /// Per-request HTTP timeout for API calls.
    pub request_timeout: Duration,
    /// Whole-transfer timeout for artifact downloads.
    pub download_timeout: Duration,
}

impl GenerationConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                         | Default                                 |
    /// |---------------------------------|-----------------------------------------|
    /// | `DASHSCOPE_API_KEY`             | required                                |
    /// | `WAN_API_BASE_URL`              | `https://dashscope.aliyuncs.com/api/v1` |
    /// | `WAN_IMAGE_MODEL`               | `wan2.5-t2i-preview`                    |
    /// | `WAN_IMAGE_SIZE`                | `1024*1024`                             |
    /// | `WAN_PROMPT_EXTEND`             | `true`                                  |
    /// | `WAN_WATERMARK`                 | `false`                                 |
    /// | `WAN_IMAGE_OUTPUT_DIR`          | `generated_images`                      |
    /// | `WAN_PUBLIC_URL_PREFIX`         | `/generated`                            |
    /// | `WAN_POLL_TIMEOUT_SECS`         | `300`                                   |
    /// | `WAN_POLL_INTERVAL_SECS`        | `10`                                    |
    /// | `WAN_INITIAL_POLL_DELAY_SECS`   | `1`                                     |
    /// | `WAN_UNKNOWN_STATUS_DELAY_SECS` | `5`                                     |
    /// | `WAN_MAX_RETRIES`               | `5`                                     |
    /// | `WAN_REQUEST_TIMEOUT_SECS`      | `30`                                    |
    /// | `WAN_DOWNLOAD_TIMEOUT_SECS`     | `120`                                   |
    pub fn from_env() -> Result<Self, GenerationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GenerationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("DASHSCOPE_API_KEY").ok_or_else(|| {
            GenerationError::Configuration("DASHSCOPE_API_KEY must be set".into())
        })?;

        let flags = SubmissionFlags {
            prompt_extend: parse_or(&get, "WAN_PROMPT_EXTEND", true, parse_bool)?,
            watermark: parse_or(&get, "WAN_WATERMARK", false, parse_bool)?,
        };

        let max_retries: u32 = parse_or(&get, "WAN_MAX_RETRIES", 5, parse_from_str)?;

        let poll = PollSettings {
            timeout: secs_or(&get, "WAN_POLL_TIMEOUT_SECS", 300)?,
            poll_interval: secs_or(&get, "WAN_POLL_INTERVAL_SECS", 10)?,
            initial_delay: secs_or(&get, "WAN_INITIAL_POLL_DELAY_SECS", 1)?,
            unknown_status_delay: secs_or(&get, "WAN_UNKNOWN_STATUS_DELAY_SECS", 5)?,
            retry: RetryPolicy {
                max_network_attempts: max_retries,
                max_application_attempts: max_retries,
                ..RetryPolicy::default()
            },
        };

        if poll.timeout.is_zero() {
            return Err(GenerationError::Configuration(
                "WAN_POLL_TIMEOUT_SECS must be greater than 0".into(),
            ));
        }

        Ok(Self {
            api_key,
            base_url: get("WAN_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            model: get("WAN_IMAGE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            image_size: get("WAN_IMAGE_SIZE").unwrap_or_else(|| DEFAULT_IMAGE_SIZE.into()),
            flags,
            output_dir: get("WAN_IMAGE_OUTPUT_DIR")
                .unwrap_or_else(|| "generated_images".into())
                .into(),
            public_url_prefix: get("WAN_PUBLIC_URL_PREFIX")
                .unwrap_or_else(|| "/generated".into()),
            poll,
            request_timeout: secs_or(&get, "WAN_REQUEST_TIMEOUT_SECS", 30)?,
            download_timeout: secs_or(&get, "WAN_DOWNLOAD_TIMEOUT_SECS", 120)?,
        })
    }

    /// Connection settings for the DashScope client.
    pub fn dashscope(&self) -> DashScopeConfig {
        DashScopeConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

fn parse_or<G, T>(
    get: &G,
    key: &str,
    default: T,
    parse: fn(&str) -> Option<T>,
) -> Result<T, GenerationError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => parse(&raw).ok_or_else(|| {
            GenerationError::Configuration(format!("{key} has an invalid value: '{raw}'"))
        }),
    }
}

fn secs_or<G>(get: &G, key: &str, default: u64) -> Result<Duration, GenerationError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default, parse_from_str).map(Duration::from_secs)
}

fn parse_from_str<T: FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<GenerationConfig, GenerationError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GenerationConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn missing_api_key_is_configuration_error() {
        assert_matches!(load(&[]), Err(GenerationError::Configuration(msg)) if msg.contains("DASHSCOPE_API_KEY"));
    }

    #[test]
    fn blank_api_key_is_configuration_error() {
        assert_matches!(
            load(&[("DASHSCOPE_API_KEY", "   ")]),
            Err(GenerationError::Configuration(_))
        );
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("DASHSCOPE_API_KEY", "sk-test")]).unwrap();

        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.image_size, "1024*1024");
        assert!(config.flags.prompt_extend);
        assert!(!config.flags.watermark);
        assert_eq!(config.output_dir, PathBuf::from("generated_images"));
        assert_eq!(config.public_url_prefix, "/generated");
        assert_eq!(config.poll, PollSettings::default());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides_apply() {
        let config = load(&[
            ("DASHSCOPE_API_KEY", "sk-test"),
            ("WAN_API_BASE_URL", "https://dashscope-intl.aliyuncs.com/api/v1"),
            ("WAN_IMAGE_SIZE", "1280*720"),
            ("WAN_WATERMARK", "yes"),
            ("WAN_PROMPT_EXTEND", "0"),
            ("WAN_POLL_TIMEOUT_SECS", "60"),
            ("WAN_MAX_RETRIES", "2"),
        ])
        .unwrap();

        assert_eq!(config.base_url, "https://dashscope-intl.aliyuncs.com/api/v1");
        assert_eq!(config.image_size, "1280*720");
        assert!(config.flags.watermark);
        assert!(!config.flags.prompt_extend);
        assert_eq!(config.poll.timeout, Duration::from_secs(60));
        assert_eq!(config.poll.retry.max_network_attempts, 2);
        assert_eq!(config.poll.retry.max_application_attempts, 2);
    }

    #[test]
    fn invalid_number_is_configuration_error() {
        assert_matches!(
            load(&[("DASHSCOPE_API_KEY", "k"), ("WAN_POLL_INTERVAL_SECS", "ten")]),
            Err(GenerationError::Configuration(msg)) if msg.contains("WAN_POLL_INTERVAL_SECS")
        );
    }

    #[test]
    fn invalid_bool_is_configuration_error() {
        assert_matches!(
            load(&[("DASHSCOPE_API_KEY", "k"), ("WAN_WATERMARK", "maybe")]),
            Err(GenerationError::Configuration(_))
        );
    }

    #[test]
    fn zero_timeout_rejected() {
        assert_matches!(
            load(&[("DASHSCOPE_API_KEY", "k"), ("WAN_POLL_TIMEOUT_SECS", "0")]),
            Err(GenerationError::Configuration(_))
        );
    }

    #[test]
    fn dashscope_settings_follow_config() {
        let config = load(&[("DASHSCOPE_API_KEY", "sk-test"), ("WAN_IMAGE_MODEL", "wan2.2-t2i-flash")]).unwrap();
        let ds = config.dashscope();
        assert_eq!(ds.api_key, "sk-test");
        assert_eq!(ds.model, "wan2.2-t2i-flash");
    }
}
