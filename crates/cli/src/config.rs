//! Interpreter configuration
//!
//! A `yan.toml` next to the project (or passed via `--config`) tunes the
//! collector and diagnostics. Everything has a default, so the file is
//! optional and may be partial.
//!
//! ```toml
//! [vm]
//! gc_threshold = 1048576
//! gc_growth = 2
//! trace_execution = false
//! ```

use std::path::Path;

use serde::Deserialize;
use yan_runtime::VmOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vm: VmSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmSection {
    /// Bytes allocated before the first collection.
    #[serde(default = "default_gc_threshold")]
    pub gc_threshold: usize,
    /// Threshold multiplier applied after each sweep.
    #[serde(default = "default_gc_growth")]
    pub gc_growth: usize,
    /// Collect before every allocation (debugging aid).
    #[serde(default)]
    pub gc_stress: bool,
    /// Trace every executed instruction.
    #[serde(default)]
    pub trace_execution: bool,
}

fn default_gc_threshold() -> usize {
    yan_core::heap::DEFAULT_GC_THRESHOLD
}

fn default_gc_growth() -> usize {
    yan_core::heap::DEFAULT_GC_GROWTH
}

impl Default for VmSection {
    fn default() -> Self {
        VmSection {
            gc_threshold: default_gc_threshold(),
            gc_growth: default_gc_growth(),
            gc_stress: false,
            trace_execution: false,
        }
    }
}

impl Config {
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| format!("配置解析失败：{e}"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("无法读取配置 {}：{e}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn vm_options(&self) -> VmOptions {
        VmOptions {
            gc_threshold: self.vm.gc_threshold,
            gc_growth: self.vm.gc_growth,
            gc_stress: self.vm.gc_stress,
            trace_execution: self.vm.trace_execution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.vm.gc_threshold, yan_core::heap::DEFAULT_GC_THRESHOLD);
        assert_eq!(config.vm.gc_growth, yan_core::heap::DEFAULT_GC_GROWTH);
        assert!(!config.vm.trace_execution);
    }

    #[test]
    fn test_partial_vm_section() {
        let config = Config::from_toml("[vm]\ngc_threshold = 4096\n").unwrap();
        assert_eq!(config.vm.gc_threshold, 4096);
        assert_eq!(config.vm.gc_growth, yan_core::heap::DEFAULT_GC_GROWTH);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::from_toml("[vm\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vm]\ngc_stress = true").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(config.vm.gc_stress);
    }
}
