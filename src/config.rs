// Matcher tuning profiles.
//
// A profile is an ordered list of passes, coarse to fine. Each pass indexes the old
// content in blocks of `block_size` and probes the new content every `stride` bytes.

use std::path::PathBuf;

/// Default cap on old offsets verified per probe when many blocks share a hash.
pub const DEFAULT_MAX_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPass {
    /// Anchor block width in bytes.
    pub block_size: usize,
    /// Distance between probed positions in the new content.
    pub stride: usize,
    /// Maximum number of same-hash old blocks verified per probe.
    pub max_candidates: usize,
}

impl MatchPass {
    pub const fn new(block_size: usize, stride: usize) -> Self {
        Self {
            block_size,
            stride,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticConfig {
    /// Keep staged inputs when a staged diff fails.
    pub enabled: bool,
    /// Where preserved staging files go. Falls back to the system temp dir.
    pub preserve_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffConfig {
    pub name: &'static str,
    pub passes: Vec<MatchPass>,
    pub diagnostics: DiagnosticConfig,
}

impl DiffConfig {
    /// Single coarse pass: bulk copies and appends only.
    pub fn fast() -> Self {
        Self {
            name: "fast",
            passes: vec![MatchPass::new(1024, 64)],
            diagnostics: DiagnosticConfig::default(),
        }
    }

    pub fn thorough() -> Self {
        Self {
            name: "thorough",
            passes: vec![
                MatchPass::new(4096, 256),
                MatchPass::new(1024, 64),
                MatchPass::new(256, 16),
                MatchPass::new(64, 4),
                MatchPass::new(16, 1),
            ],
            diagnostics: DiagnosticConfig::default(),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "fast" => Some(Self::fast()),
            "default" => Some(Self::default()),
            "thorough" => Some(Self::thorough()),
            _ => None,
        }
    }

    pub fn with_diagnostics(mut self, preserve_dir: Option<PathBuf>) -> Self {
        self.diagnostics = DiagnosticConfig {
            enabled: true,
            preserve_dir,
        };
        self
    }

    /// Drop passes that can never match (zero sizes), keeping the order.
    pub(crate) fn effective_passes(&self) -> impl Iterator<Item = &MatchPass> {
        self.passes
            .iter()
            .filter(|p| p.block_size > 0 && p.stride > 0 && p.max_candidates > 0)
    }
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            name: "default",
            passes: vec![
                MatchPass::new(1024, 64),
                MatchPass::new(256, 16),
                MatchPass::new(64, 4),
            ],
            diagnostics: DiagnosticConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_coarse_to_fine() {
        for config in [DiffConfig::fast(), DiffConfig::default(), DiffConfig::thorough()] {
            for pair in config.passes.windows(2) {
                assert!(pair[0].block_size > pair[1].block_size, "{}", config.name);
                assert!(pair[0].stride >= pair[1].stride, "{}", config.name);
            }
        }
    }

    #[test]
    fn test_by_name() {
        assert_eq!(DiffConfig::by_name("default"), Some(DiffConfig::default()));
        assert_eq!(DiffConfig::by_name("thorough").unwrap().passes.len(), 5);
        assert!(DiffConfig::by_name("nope").is_none());
    }

    #[test]
    fn test_zero_sized_passes_are_skipped() {
        let config = DiffConfig {
            name: "custom",
            passes: vec![MatchPass::new(0, 4), MatchPass::new(64, 0), MatchPass::new(8, 2)],
            diagnostics: DiagnosticConfig::default(),
        };
        let passes: Vec<_> = config.effective_passes().collect();
        assert_eq!(passes, vec![&MatchPass::new(8, 2)]);
    }
}
