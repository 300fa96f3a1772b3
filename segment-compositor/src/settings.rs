//! Pipeline settings
//!
//! Loaded from and saved to a JSON file. Every field has a default so partial
//! files and older files keep working.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::LogConfig;

/// Which canvas implementation renders composited frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CanvasBackend {
    /// Software rasterizer, always available
    #[default]
    Cpu,
    /// wgpu device (headless offscreen target)
    Gpu,
}

impl CanvasBackend {
    pub fn display_name(&self) -> &'static str {
        match self {
            CanvasBackend::Cpu => "CPU",
            CanvasBackend::Gpu => "GPU (wgpu)",
        }
    }
}

/// Settings for one compositing pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Number of frames a background video is re-sampled to
    #[serde(default = "default_background_frame_budget")]
    pub background_frame_budget: usize,

    /// Upper bound for background-video extraction, in milliseconds
    #[serde(default = "default_extraction_timeout_ms")]
    pub extraction_timeout_ms: u64,

    /// Base URL of the mask inference service
    #[serde(default = "default_mask_service_url")]
    pub mask_service_url: String,

    /// Masks composited per frame (extra masks are ignored with a warning)
    #[serde(default = "default_max_mask_layers")]
    pub max_mask_layers: usize,

    /// Background sets larger than this use binary search for nearest lookup
    #[serde(default = "default_nearest_scan_limit")]
    pub nearest_scan_limit: usize,

    /// Rendered frames between two diagnostics reports
    #[serde(default = "default_stats_interval_frames")]
    pub stats_interval_frames: u64,

    #[serde(default)]
    pub canvas: CanvasBackend,

    /// Read size when streaming a source file into the demuxer
    #[serde(default = "default_file_read_chunk_bytes")]
    pub file_read_chunk_bytes: usize,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_background_frame_budget() -> usize {
    90
}

fn default_extraction_timeout_ms() -> u64 {
    30_000
}

fn default_mask_service_url() -> String {
    "http://localhost:7263".to_string()
}

fn default_max_mask_layers() -> usize {
    3
}

fn default_nearest_scan_limit() -> usize {
    64
}

fn default_stats_interval_frames() -> u64 {
    30
}

fn default_file_read_chunk_bytes() -> usize {
    1024 * 1024
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            background_frame_budget: default_background_frame_budget(),
            extraction_timeout_ms: default_extraction_timeout_ms(),
            mask_service_url: default_mask_service_url(),
            max_mask_layers: default_max_mask_layers(),
            nearest_scan_limit: default_nearest_scan_limit(),
            stats_interval_frames: default_stats_interval_frames(),
            canvas: CanvasBackend::default(),
            file_read_chunk_bytes: default_file_read_chunk_bytes(),
            log: LogConfig::default(),
        }
    }
}

impl PipelineSettings {
    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let mut settings: Self = serde_json::from_str(&contents)?;
        settings.sanitize();
        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Clamp values that would stall the pipeline.
    pub fn sanitize(&mut self) {
        self.background_frame_budget = self.background_frame_budget.max(1);
        self.max_mask_layers = self.max_mask_layers.clamp(1, crate::render::MAX_MASK_LAYERS);
        self.stats_interval_frames = self.stats_interval_frames.max(1);
        self.file_read_chunk_bytes = self.file_read_chunk_bytes.max(4096);
    }

    pub fn extraction_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.extraction_timeout_ms)
    }
}

/// Settings-related errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.background_frame_budget, 90);
        assert_eq!(settings.extraction_timeout_ms, 30_000);
        assert_eq!(settings.mask_service_url, "http://localhost:7263");
        assert_eq!(settings.max_mask_layers, 3);
        assert_eq!(settings.canvas, CanvasBackend::Cpu);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: PipelineSettings =
            serde_json::from_str(r#"{"canvas": "gpu", "max_mask_layers": 2}"#).unwrap();
        assert_eq!(settings.canvas, CanvasBackend::Gpu);
        assert_eq!(settings.max_mask_layers, 2);
        assert_eq!(settings.nearest_scan_limit, 64);
        assert_eq!(settings.file_read_chunk_bytes, 1024 * 1024);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let mut settings = PipelineSettings::default();
        settings.background_frame_budget = 24;
        settings.log.json_format = true;
        settings.save(&path).unwrap();

        let loaded = PipelineSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_sanitize_clamps_zero_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"background_frame_budget": 0, "stats_interval_frames": 0}"#).unwrap();

        let loaded = PipelineSettings::load(&path).unwrap();
        assert_eq!(loaded.background_frame_budget, 1);
        assert_eq!(loaded.stats_interval_frames, 1);
    }

    #[test]
    fn test_load_missing_file() {
        let err = PipelineSettings::load("/nonexistent/pipeline.json").unwrap_err();
        assert!(matches!(err, SettingsError::Io(_)));
    }
}
