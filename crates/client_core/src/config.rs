use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "mirror.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSettings {
    pub database_url: String,
    pub download_root: PathBuf,
    pub cleanup_delay_ms: u64,
    pub graveyard_flush_ms: u64,
    pub typing_expiry_ms: u64,
    pub dialog_refresh_ms: u64,
    pub contact_refresh_ms: u64,
    pub fetch_retry_limit: u32,
    pub auto_accept_secret_chats: bool,
    pub global_mute: bool,
    pub dialog_page_size: i32,
    pub log_filter: String,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/mirror.db".into(),
            download_root: PathBuf::from("./data/downloads"),
            cleanup_delay_ms: 60_000,
            graveyard_flush_ms: 3_000,
            typing_expiry_ms: 6_000,
            dialog_refresh_ms: 1_000,
            contact_refresh_ms: 1_000,
            fetch_retry_limit: 3,
            auto_accept_secret_chats: false,
            global_mute: true,
            dialog_page_size: 100,
            log_filter: "info".into(),
        }
    }
}

impl MirrorSettings {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn graveyard_flush(&self) -> Duration {
        Duration::from_millis(self.graveyard_flush_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn dialog_refresh(&self) -> Duration {
        Duration::from_millis(self.dialog_refresh_ms)
    }

    pub fn contact_refresh(&self) -> Duration {
        Duration::from_millis(self.contact_refresh_ms)
    }
}

const KEYS: [&str; 12] = [
    "database_url",
    "download_root",
    "cleanup_delay_ms",
    "graveyard_flush_ms",
    "typing_expiry_ms",
    "dialog_refresh_ms",
    "contact_refresh_ms",
    "fetch_retry_limit",
    "auto_accept_secret_chats",
    "global_mute",
    "dialog_page_size",
    "log_filter",
];

pub fn load_settings() -> MirrorSettings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_settings_from(path: &Path) -> MirrorSettings {
    let mut settings = MirrorSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file_overrides(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());

    settings
}

fn apply_file_overrides(settings: &mut MirrorSettings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!(error = %err, "config: ignoring unreadable settings file");
            return;
        }
    };

    for key in KEYS {
        if let Some(value) = file_cfg.get(key) {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            apply(settings, key, &value);
        }
    }
}

/// `MIRROR_<KEY>` first, then `APP__<KEY>`, so the `APP__` form wins.
fn apply_env_overrides(settings: &mut MirrorSettings, lookup: impl Fn(&str) -> Option<String>) {
    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = lookup(&format!("MIRROR_{upper}")) {
            apply(settings, key, &v);
        }
        if let Some(v) = lookup(&format!("APP__{upper}")) {
            apply(settings, key, &v);
        }
    }
}

fn apply(settings: &mut MirrorSettings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "database_url" => settings.database_url = value.to_string(),
        "download_root" => settings.download_root = PathBuf::from(value),
        "cleanup_delay_ms" => set_parsed(&mut settings.cleanup_delay_ms, key, value),
        "graveyard_flush_ms" => set_parsed(&mut settings.graveyard_flush_ms, key, value),
        "typing_expiry_ms" => set_parsed(&mut settings.typing_expiry_ms, key, value),
        "dialog_refresh_ms" => set_parsed(&mut settings.dialog_refresh_ms, key, value),
        "contact_refresh_ms" => set_parsed(&mut settings.contact_refresh_ms, key, value),
        "fetch_retry_limit" => set_parsed(&mut settings.fetch_retry_limit, key, value),
        "auto_accept_secret_chats" => {
            set_parsed(&mut settings.auto_accept_secret_chats, key, value)
        }
        "global_mute" => set_parsed(&mut settings.global_mute, key, value),
        "dialog_page_size" => set_parsed(&mut settings.dialog_page_size, key, value),
        "log_filter" => settings.log_filter = value.to_string(),
        _ => {}
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "config: ignoring unparsable value"),
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
        return MirrorSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
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
