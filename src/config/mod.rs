//! Config module - pipeline configuration and settings

pub mod toml_config;

pub use toml_config::{
    default_config_path, load_config, save_config, GatewayConfig, LlmConfig, PipelineConfig,
    ProfilerConfig, StageConfig,
};
