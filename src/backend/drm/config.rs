//! Environment controlled tweaks of the drm backend

use tracing::info;

const USE_LEGACY: &str = "KMS_OUTPUT_USE_LEGACY";
const NO_MODIFIERS: &str = "KMS_OUTPUT_NO_MODIFIERS";
const SOFTWARE_CURSOR: &str = "KMS_OUTPUT_FORCE_SOFTWARE_CURSOR";

/// Configuration of a [`DrmGpu`](super::DrmGpu)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmConfig {
    /// Never use atomic mode-setting, even if the driver supports it
    pub force_legacy: bool,
    /// Ignore framebuffer modifier support of the driver
    pub disable_modifiers: bool,
    /// Do not allocate hardware cursor buffers
    pub force_software_cursor: bool,
}

impl DrmConfig {
    /// Reads the configuration from the environment
    ///
    /// - `KMS_OUTPUT_USE_LEGACY` forces legacy mode-setting
    /// - `KMS_OUTPUT_NO_MODIFIERS` disables framebuffer modifiers
    /// - `KMS_OUTPUT_FORCE_SOFTWARE_CURSOR` disables hardware cursors
    pub fn from_env() -> DrmConfig {
        let config = DrmConfig {
            force_legacy: env_flag(USE_LEGACY),
            disable_modifiers: env_flag(NO_MODIFIERS),
            force_software_cursor: env_flag(SOFTWARE_CURSOR),
        };
        if config.force_legacy {
            info!("{} is set. Forcing legacy mode-setting.", USE_LEGACY);
        }
        if config.disable_modifiers {
            info!("{} is set. Not using framebuffer modifiers.", NO_MODIFIERS);
        }
        config
    }

    /// Sets `force_legacy`
    pub fn with_legacy(mut self, force_legacy: bool) -> Self {
        self.force_legacy = force_legacy;
        self
    }

    /// Sets `disable_modifiers`
    pub fn with_modifiers_disabled(mut self, disable_modifiers: bool) -> Self {
        self.disable_modifiers = disable_modifiers;
        self
    }

    /// Sets `force_software_cursor`
    pub fn with_software_cursor(mut self, force_software_cursor: bool) -> Self {
        self.force_software_cursor = force_software_cursor;
        self
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|x| truthy(&x)).unwrap_or(false)
}

fn truthy(value: &str) -> bool {
    let value = value.to_lowercase();
    value == "1" || value == "true" || value == "yes" || value == "y"
}
