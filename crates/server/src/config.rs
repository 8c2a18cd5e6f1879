use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use mirror::MirrorSettings;
use serde::Deserialize;
use shared::domain::{ChannelId, UserId};

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub discord_api_base: String,
    pub discord_token: Option<String>,
    pub progress_channel_id: Option<ChannelId>,
    /// Users allowed to run operator commands.
    pub owner_ids: Vec<UserId>,
    pub bot_user_id: Option<UserId>,
    pub disable_failing_links: bool,
    pub rate_limit_permits: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".into(),
            database_url: "sqlite://./data/relay.db".into(),
            discord_api_base: "https://discord.com/api/v10".into(),
            discord_token: None,
            progress_channel_id: None,
            owner_ids: Vec::new(),
            bot_user_id: None,
            disable_failing_links: true,
            rate_limit_permits: 45,
        }
    }
}

impl Settings {
    pub fn mirror_settings(&self) -> MirrorSettings {
        let mut mirror = MirrorSettings::default();
        mirror.progress.channel_id = self.progress_channel_id;
        mirror.disable_failing_links = self.disable_failing_links;
        mirror.rate_limit_permits = self.rate_limit_permits.max(1);
        mirror.rate_limit_period = Duration::from_secs(1);
        mirror
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.bind_addr = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "discord_api_base" => self.discord_api_base = value.to_string(),
            "discord_token" => self.discord_token = Some(value.to_string()),
            "progress_channel_id" => {
                if let Ok(parsed) = value.trim().parse::<i64>() {
                    self.progress_channel_id = Some(ChannelId(parsed));
                }
            }
            "owner_ids" => self.owner_ids = parse_id_list(value).map(UserId).collect(),
            "bot_user_id" => {
                if let Ok(parsed) = value.trim().parse::<i64>() {
                    self.bot_user_id = Some(UserId(parsed));
                }
            }
            "disable_failing_links" => {
                if let Some(parsed) = parse_flag(value) {
                    self.disable_failing_links = parsed;
                }
            }
            "rate_limit_permits" => {
                if let Ok(parsed) = value.trim().parse::<usize>() {
                    self.rate_limit_permits = parsed;
                }
            }
            _ => {}
        }
    }
}

const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("RELAY_BIND", "bind_addr"),
    ("APP__BIND_ADDR", "bind_addr"),
    ("DATABASE_URL", "database_url"),
    ("APP__DATABASE_URL", "database_url"),
    ("DISCORD_API_BASE", "discord_api_base"),
    ("DISCORD_TOKEN", "discord_token"),
    ("APP__DISCORD_TOKEN", "discord_token"),
    ("APP__PROGRESS_CHANNEL_ID", "progress_channel_id"),
    ("APP__OWNER_IDS", "owner_ids"),
    ("APP__BOT_USER_ID", "bot_user_id"),
    ("APP__DISABLE_FAILING_LINKS", "disable_failing_links"),
    ("APP__RATE_LIMIT_PERMITS", "rate_limit_permits"),
];

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("relay.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            for (key, value) in &file_cfg {
                settings.apply(key, value);
            }
        }
    }

    for (var, key) in ENV_OVERRIDES {
        if let Ok(value) = std::env::var(var) {
            settings.apply(key, &value);
        }
    }

    settings
}

fn parse_id_list(raw: &str) -> impl Iterator<Item = i64> + '_ {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return sqlite_url_for(path);
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return sqlite_url_for(path);
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    sqlite_url_for(raw_database_url)
}

/// Drive-letter paths keep a single colon so sqlx does not read the drive as a host.
fn sqlite_url_for(path: &str) -> String {
    let path = path.replace('\\', "/");
    let bytes = path.as_bytes();
    let has_drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'/';
    if has_drive {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
