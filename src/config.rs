use std::path::PathBuf;

use crate::settings::{Settings, SettingsError};

const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Process-level configuration read from the environment. Scoring behaviour
/// lives in [`Settings`], loaded from the file this points at.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings_path: Option<PathBuf>,
    pub max_concurrent_evals: usize,
    pub render_metrics: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            settings_path: std::env::var("AGENT_JUDGE_SETTINGS")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            max_concurrent_evals: env_parse("MAX_CONCURRENT_EVALS", DEFAULT_MAX_CONCURRENT).max(1),
            render_metrics: env_parse("AGENT_JUDGE_RENDER_METRICS", true),
        }
    }

    /// Settings from the configured file, or the built-in defaults.
    pub fn load_settings(&self) -> Result<Settings, SettingsError> {
        match &self.settings_path {
            Some(path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }

    pub fn print_banner(&self, settings: &Settings) {
        let providers: Vec<String> = settings
            .judge
            .providers
            .iter()
            .map(|p| format!("{}:{}", p.kind, p.model))
            .collect();
        let settings_source = self
            .settings_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string());

        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║           agent-judge v{:<26}║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Settings:          {:<28}║", settings_source);
        tracing::info!("║  Max concurrent:    {:<28}║", self.max_concurrent_evals);
        tracing::info!("║  Redistribution:    {:<28}║", format!("{:?}", settings.redistribution).to_lowercase());
        tracing::info!("║  Pipeline budget:   {:<26}ms ║", settings.pipeline_timeout().as_millis());
        tracing::info!("║  Judge providers:   {:<28}║", providers.join(", "));
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
