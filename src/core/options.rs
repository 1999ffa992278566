// This module defines CompileOptions, the explicit mutable options record threaded through
// the pass pipeline by reference. It replaces process-wide option state: passes that need
// to flip a module-wide switch (for example disabling EU fusion) write to the record handed
// to them, and the lowering and encoding steps read the same record afterwards. Options are
// built with chained setters and can be overridden from the environment with apply_env(),
// which recognizes XEC_DUMP_DIR, XEC_OVERRIDE_DIR, XEC_DISABLE_COMPACTION and
// XEC_ENCODER_TIMING.

//! Compilation options shared by the pipeline, lowering and encoder.

use crate::encoder::ged::Platform;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub platform: Platform,
    /// SIMD width used when a kernel does not request one.
    pub default_simd: u32,
    /// Set by the divergence scan; reported to the runtime in the patch info.
    pub disable_eu_fusion: bool,
    /// The unit is being recompiled after a failed first attempt.
    pub retry: bool,
    pub disable_inlining: bool,
    pub enable_compaction: bool,
    pub encoder_timing: bool,
    pub dump_dir: Option<PathBuf>,
    pub override_dir: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            platform: Platform::XeHpc,
            default_simd: 16,
            disable_eu_fusion: false,
            retry: false,
            disable_inlining: false,
            enable_compaction: true,
            encoder_timing: false,
            dump_dir: None,
            override_dir: None,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_default_simd(mut self, simd: u32) -> Self {
        self.default_simd = simd;
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_disable_inlining(mut self, disable: bool) -> Self {
        self.disable_inlining = disable;
        self
    }

    pub fn with_compaction(mut self, enable: bool) -> Self {
        self.enable_compaction = enable;
        self
    }

    pub fn with_encoder_timing(mut self, enable: bool) -> Self {
        self.encoder_timing = enable;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    pub fn with_override_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.override_dir = Some(dir.into());
        self
    }

    /// Apply overrides from `XEC_*` environment variables.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("XEC_DUMP_DIR").filter(|d| !d.is_empty()) {
            self.dump_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("XEC_OVERRIDE_DIR").filter(|d| !d.is_empty()) {
            self.override_dir = Some(PathBuf::from(dir));
        }
        if lookup("XEC_DISABLE_COMPACTION").is_some_and(|v| is_truthy(&v)) {
            self.enable_compaction = false;
        }
        if lookup("XEC_ENCODER_TIMING").is_some_and(|v| is_truthy(&v)) {
            self.encoder_timing = true;
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "off" | "no")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("XEC_DUMP_DIR", "/tmp/dumps"),
            ("XEC_DISABLE_COMPACTION", "1"),
            ("XEC_ENCODER_TIMING", "0"),
        ]
        .into_iter()
        .collect();
        let mut opts = CompileOptions::new();
        opts.apply_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(opts.dump_dir, Some(PathBuf::from("/tmp/dumps")));
        assert_eq!(opts.override_dir, None);
        assert!(!opts.enable_compaction);
        assert!(!opts.encoder_timing);
    }

    #[test]
    fn builder_chains() {
        let opts = CompileOptions::new().with_platform(Platform::XeLp).with_retry(true).with_compaction(false);
        assert_eq!(opts.platform, Platform::XeLp);
        assert!(opts.retry);
        assert!(!opts.enable_compaction);
        assert!(!opts.disable_eu_fusion);
    }
}
