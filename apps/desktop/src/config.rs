use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "keychain.toml";

#[derive(Parser, Debug, Default)]
#[command(name = "keychain", about = "Counter display for a BLE keychain button")]
pub struct Args {
    /// Settings file; `keychain.toml` in the working directory is used when present.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    #[arg(long = "adapter")]
    pub adapter_index: Option<usize>,
    #[arg(long)]
    pub name_prefix: Option<String>,
    /// Track only the counter, without subscribing to the battery service.
    #[arg(long)]
    pub no_battery: bool,
    /// Print one JSON object per session event instead of text.
    #[arg(long)]
    pub json: bool,
    #[arg(long)]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Btleplug,
    Simulated,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Btleplug => "btleplug",
            Self::Simulated => "simulated",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "btleplug" | "bluetooth" => Ok(Self::Btleplug),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend: BackendKind,
    pub adapter_index: usize,
    pub name_prefix: Option<String>,
    pub track_battery: bool,
    pub log_filter: String,
    pub json_events: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Btleplug,
            adapter_index: 0,
            name_prefix: None,
            track_battery: true,
            log_filter: "info".into(),
            json_events: false,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    backend: Option<BackendKind>,
    adapter_index: Option<usize>,
    name_prefix: Option<String>,
    track_battery: Option<bool>,
    log_filter: Option<String>,
    json_events: Option<bool>,
}

/// Defaults, then the settings file, then `KEYCHAIN__*` variables, then flags.
pub fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match &args.config {
        Some(path) => apply_file(&mut settings, path)?,
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                apply_file(&mut settings, path)?;
            }
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    apply_args(&mut settings, args);
    Ok(settings)
}

fn apply_file(settings: &mut Settings, path: &Path) -> anyhow::Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    apply_toml(settings, &raw)
        .with_context(|| format!("invalid settings file '{}'", path.display()))
}

fn apply_toml(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file_cfg.backend {
        settings.backend = v;
    }
    if let Some(v) = file_cfg.adapter_index {
        settings.adapter_index = v;
    }
    if let Some(v) = file_cfg.name_prefix {
        settings.name_prefix = non_empty(v);
    }
    if let Some(v) = file_cfg.track_battery {
        settings.track_battery = v;
    }
    if let Some(v) = file_cfg.log_filter {
        if v.trim().is_empty() {
            bail!("log_filter must not be empty");
        }
        settings.log_filter = v;
    }
    if let Some(v) = file_cfg.json_events {
        settings.json_events = v;
    }
    Ok(())
}

/// Unparsable values are ignored and the previous setting is kept.
fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("KEYCHAIN__BACKEND") {
        if let Ok(parsed) = v.parse() {
            settings.backend = parsed;
        }
    }
    if let Some(v) = lookup("KEYCHAIN__ADAPTER_INDEX") {
        if let Ok(parsed) = v.trim().parse() {
            settings.adapter_index = parsed;
        }
    }
    if let Some(v) = lookup("KEYCHAIN__NAME_PREFIX") {
        settings.name_prefix = non_empty(v);
    }
    if let Some(v) = lookup("KEYCHAIN__TRACK_BATTERY") {
        if let Some(parsed) = parse_flag(&v) {
            settings.track_battery = parsed;
        }
    }
    if let Some(v) = lookup("KEYCHAIN__LOG_FILTER") {
        if !v.trim().is_empty() {
            settings.log_filter = v;
        }
    }
}

fn apply_args(settings: &mut Settings, args: &Args) {
    if let Some(v) = args.backend {
        settings.backend = v;
    }
    if let Some(v) = args.adapter_index {
        settings.adapter_index = v;
    }
    if let Some(v) = &args.name_prefix {
        settings.name_prefix = non_empty(v.clone());
    }
    if args.no_battery {
        settings.track_battery = false;
    }
    if args.json {
        settings.json_events = true;
    }
    if let Some(v) = &args.log_filter {
        settings.log_filter = v.clone();
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
