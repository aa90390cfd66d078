use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BotConfig {
    #[serde(default)]
    pub token: String,
    /// 0 leaves every admin-only path unreachable.
    #[serde(default)]
    pub admin_id: u64,
    /// Chat id of the group whose membership events are counted. 0 matches no chat.
    #[serde(default)]
    pub group_id: i64,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardsConfig {
    #[serde(default = "default_invite_threshold")]
    pub invite_threshold: u32,
    #[serde(default = "default_style_count")]
    pub style_count: usize,
    #[serde(default = "default_styles_per_page")]
    pub styles_per_page: usize,
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    #[serde(default = "default_assets_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    pub watermark_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Public base URL the platform can reach; unset means long polling.
    pub public_url: Option<String>,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_delay_ms")]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_invite_threshold() -> u32 {
    10
}
fn default_style_count() -> usize {
    8
}
fn default_styles_per_page() -> usize {
    4
}
fn default_session_idle_minutes() -> i64 {
    30
}
fn default_assets_dir() -> PathBuf {
    PathBuf::from("public")
}
fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_bind_port() -> u16 {
    8443
}
fn default_broadcast_delay_ms() -> u64 {
    100
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot: BotConfig::default(),
            rewards: RewardsConfig::default(),
            assets: AssetsConfig::default(),
            webhook: WebhookConfig::default(),
            broadcast: BroadcastConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            invite_threshold: default_invite_threshold(),
            style_count: default_style_count(),
            styles_per_page: default_styles_per_page(),
            session_idle_minutes: default_session_idle_minutes(),
        }
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            dir: default_assets_dir(),
            scratch_dir: default_scratch_dir(),
            watermark_text: None,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_url: None,
            bind_port: default_bind_port(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_broadcast_delay_ms(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Loads the YAML config if the file exists, then overlays the environment
/// variables the hosted deployment sets instead of shipping a config file.
pub fn load_config(path: &PathBuf) -> Result<Config> {
    let mut cfg = if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_yaml::from_str(&text).context("parse yaml")?
    } else {
        Config::default()
    };
    apply_env(&mut cfg);
    Ok(cfg)
}

fn apply_env(cfg: &mut Config) {
    if let Ok(token) = std::env::var("TELEGRAM_TOKEN") {
        cfg.bot.token = token;
    }
    if let Ok(id) = std::env::var("ADMIN_ID") {
        if let Ok(id) = id.trim().parse::<u64>() {
            cfg.bot.admin_id = id;
        }
    }
    if let Ok(id) = std::env::var("TARGET_GROUP_ID") {
        if let Ok(id) = id.trim().parse::<i64>() {
            cfg.bot.group_id = id;
        }
    }
    if let Ok(url) = std::env::var("PUBLIC_URL") {
        if !url.trim().is_empty() {
            cfg.webhook.public_url = Some(url);
        }
    }
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.bot.token.is_empty() {
        return Err(anyhow!(
            "bot token missing: set bot.token in the config file or TELEGRAM_TOKEN in the environment"
        ));
    }
    if cfg.rewards.invite_threshold == 0 {
        return Err(anyhow!("rewards.invite_threshold must be > 0"));
    }
    if cfg.rewards.style_count == 0 {
        return Err(anyhow!("rewards.style_count must be > 0"));
    }
    if cfg.rewards.styles_per_page == 0 {
        return Err(anyhow!("rewards.styles_per_page must be > 0"));
    }
    if cfg.rewards.session_idle_minutes <= 0 {
        return Err(anyhow!("rewards.session_idle_minutes must be > 0"));
    }
    Ok(())
}

pub fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.rewards.invite_threshold, 10);
        assert_eq!(cfg.rewards.style_count, 8);
        assert_eq!(cfg.rewards.styles_per_page, 4);
        assert_eq!(cfg.broadcast.delay_ms, 100);
        assert_eq!(cfg.bot.admin_id, 0);
        assert!(cfg.webhook.public_url.is_none());
    }

    #[test]
    fn missing_token_rejected() {
        let cfg = Config::default();
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "bot:\n  token: \"123:abc\"\n  admin_id: 42\nrewards:\n  invite_threshold: 3\n",
        )
        .unwrap();
        assert_eq!(cfg.bot.token, "123:abc");
        assert_eq!(cfg.bot.admin_id, 42);
        assert_eq!(cfg.rewards.invite_threshold, 3);
        assert_eq!(cfg.rewards.style_count, 8);
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn config_arg_parsed() {
        let args = vec!["--config".to_string(), "x.yaml".to_string()];
        assert_eq!(parse_config_arg(&args), Some(PathBuf::from("x.yaml")));
        assert_eq!(parse_config_arg(&[]), None);
    }
}
