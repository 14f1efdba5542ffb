use std::env;
use std::time::Duration;

use crate::error::MidjourneyError;

pub const DEFAULT_API_BASE: &str = "midjourney.com";
pub const DEFAULT_SUFFIX: &str = "--v 7";
pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 600;

const COOKIE_TOKEN_R: &str = "__Host-Midjourney.AuthUserTokenV3_r";
const COOKIE_TOKEN_I: &str = "__Host-Midjourney.AuthUserTokenV3_i";

/// Session credentials, read once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub token_r: String,
    pub token_i: String,
    pub channel_id: String,
    /// Apex domain of the provider, without scheme or `www.`.
    pub api_base: String,
}

impl AuthContext {
    pub fn validate(&self) -> Result<(), MidjourneyError> {
        let mut missing = Vec::new();
        if self.token_r.is_empty() {
            missing.push("TOKEN_R");
        }
        if self.token_i.is_empty() {
            missing.push("TOKEN_I");
        }
        if self.channel_id.is_empty() {
            missing.push("CHANNEL_ID");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MidjourneyError::Configuration(missing))
        }
    }

    pub fn cookie_header(&self) -> String {
        format!(
            "{COOKIE_TOKEN_R}={}; {COOKIE_TOKEN_I}={}",
            self.token_r, self.token_i
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidjourneyConfig {
    pub auth: AuthContext,
    /// Appended to every prompt after the aspect ratio flag.
    pub suffix: String,
    pub poll_timeout: Duration,
}

impl MidjourneyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let poll_timeout_s = read("MJ_POLL_TIMEOUT")
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(|value| value.clamp(10, 3600))
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECONDS);

        Self {
            auth: AuthContext {
                token_r: read("TOKEN_R").unwrap_or_default(),
                token_i: read("TOKEN_I").unwrap_or_default(),
                channel_id: read("CHANNEL_ID").unwrap_or_default(),
                api_base: read("API_BASE")
                    .map(|value| normalize_api_base(&value))
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            },
            suffix: read("SUFFIX").unwrap_or_else(|| DEFAULT_SUFFIX.to_string()),
            poll_timeout: Duration::from_secs(poll_timeout_s),
        }
    }
}

fn normalize_api_base(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_scheme.trim_end_matches('/');
    host.strip_prefix("www.").unwrap_or(host).to_string()
}
