use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context;
use render_bus::RenderConfig;

pub struct DerotConfig {
    output_dir: PathBuf,
    preview_quality: u8,
}

impl DerotConfig {
    pub fn new(output_dir: &str, preview_quality: u8) -> Self {
        Self {
            output_dir: PathBuf::from(output_dir),
            preview_quality: preview_quality.clamp(1, 100),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn preview_quality(&self) -> u8 {
        self.preview_quality
    }
}

pub fn config() -> &'static DerotConfig {
    static CONFIG: LazyLock<DerotConfig> = LazyLock::new(|| {
        let output_dir = std::env::var("DEROT_OUTPUT_DIR").unwrap_or_else(|_| ".".to_string());
        let quality = std::env::var("DEROT_PREVIEW_QUALITY")
            .ok()
            .and_then(|q| q.parse().ok())
            .unwrap_or(90);
        DerotConfig::new(&output_dir, quality)
    });
    &CONFIG
}

/// Reads a render config from JSON, defaults when `path` is `None`.
pub fn load_render_config(path: Option<&Path>) -> anyhow::Result<RenderConfig> {
    let Some(path) = path else {
        return Ok(RenderConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config '{}'", path.display()))?;
    let config: RenderConfig = serde_json::from_str(&text)
        .with_context(|| format!("parse config '{}'", path.display()))?;
    config.validate()?;
    Ok(config)
}

pub fn save_render_config(path: &Path, config: &RenderConfig) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(path, text).with_context(|| format!("write config '{}'", path.display()))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
