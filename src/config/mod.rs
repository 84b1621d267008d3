//! Configuration module.
//!
//! Security limits, engine defaults, cache backend and data source settings.

mod settings;

pub use settings::{
    expand_env_vars, CacheBackend, CacheSettings, EngineSettings, Settings, SettingsError,
    SourceSettings,
};
