// =============================================================================
// CONFIGURATION - Load renderer settings from config.toml
// =============================================================================
//
// Every section falls back to defaults field by field, so a config file only
// needs to name what it changes. Pool sizes live here because exhausting a
// pool is treated as a configuration error, not something to recover from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::PresentMode;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RendererConfig {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub pools: PoolConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Render Sandbox".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Vulkan,
    Headless,
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: BackendKind,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Sync slots (M); clamped to the presentable image count
    pub max_frames_in_flight: usize,
    /// Presentable images to ask the surface for (N)
    pub image_count: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vulkan,
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            image_count: 3,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "render_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// Fixed pool sizes; running out of any of these is fatal
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Command lists a single queue may allocate
    pub max_command_lists: usize,
    /// Descriptor sets per pipeline pool, multiplied by the image count
    pub max_sets_per_image: u32,
    pub uniform_buffers: u32,
    pub storage_buffers: u32,
    pub sampled_images: u32,
    pub samplers: u32,
    pub combined_image_samplers: u32,
    pub storage_images: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_command_lists: 64,
            max_sets_per_image: 10,
            uniform_buffers: 10,
            storage_buffers: 10,
            sampled_images: 1000,
            samplers: 1000,
            combined_image_samplers: 1000,
            storage_images: 10,
        }
    }
}

/// Shader loading and hot reload
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: PathBuf,
    pub hot_reload: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("shaders"),
            hot_reload: true,
        }
    }
}

impl RendererConfig {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            RendererConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(RendererConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RendererConfig = toml::from_str(content)?;
        if config.graphics.max_frames_in_flight == 0 {
            anyhow::bail!("graphics.max_frames_in_flight must be at least 1");
        }
        if config.pools.max_command_lists == 0 {
            anyhow::bail!("pools.max_command_lists must be at least 1");
        }
        Ok(config)
    }

    /// Config for windowless use: headless backend, no file logging, no watcher
    pub fn headless() -> Self {
        let mut config = RendererConfig::default();
        config.graphics.backend = BackendKind::Headless;
        config.debug.validation_layers = false;
        config.shaders.hot_reload = false;
        config
    }

    /// Requested present mode; unknown names fall back to FIFO
    pub fn present_mode(&self) -> PresentMode {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => PresentMode::Immediate,
            "mailbox" => PresentMode::Mailbox,
            "fifo" => PresentMode::Fifo,
            "fifo_relaxed" => PresentMode::FifoRelaxed,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                PresentMode::Fifo
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = RendererConfig::from_toml(
            r#"
            [graphics]
            backend = "headless"
            max_frames_in_flight = 3

            [pools]
            max_command_lists = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.backend, BackendKind::Headless);
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.graphics.image_count, 3);
        assert_eq!(config.pools.max_command_lists, 4);
        assert_eq!(config.pools.sampled_images, 1000);
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let result = RendererConfig::from_toml("[graphics]\nmax_frames_in_flight = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let mut config = RendererConfig::default();
        config.graphics.present_mode = "vsync-please".to_string();
        assert_eq!(config.present_mode(), PresentMode::Fifo);

        config.graphics.present_mode = "Immediate".to_string();
        assert_eq!(config.present_mode(), PresentMode::Immediate);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = RendererConfig::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.graphics.backend, BackendKind::Vulkan);
    }
}
