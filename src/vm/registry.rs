//! Layout selection by build fingerprint.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use crate::{assembly::Code, vm::layout::LayoutConfig, Result};

/// Fingerprint of a protector build.
///
/// Computed as the SHA-1 over the opcode sequence of the VM dispatch initializer. Handler order
/// and the number of registered opcodes change between builds, while renaming does not touch
/// opcodes, so the hash identifies a build across differently named modules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildFingerprint(String);

impl BuildFingerprint {
    /// Hashes an instruction opcode sequence.
    #[must_use]
    pub fn from_codes(codes: &[Code]) -> Self {
        let mut hasher = Sha1::new();
        for code in codes {
            hasher.update(code.value().to_le_bytes());
        }
        BuildFingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Wraps an already computed hex digest.
    #[must_use]
    pub fn from_hex(hex: &str) -> Self {
        BuildFingerprint(hex.to_ascii_lowercase())
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BuildFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Known layouts keyed by build fingerprint.
#[derive(Debug, Clone, Default)]
pub struct LayoutRegistry {
    layouts: HashMap<BuildFingerprint, LayoutConfig>,
    fallback: LayoutConfig,
}

impl LayoutRegistry {
    /// Creates a registry that falls back to `fallback` for unknown builds.
    #[must_use]
    pub fn new(fallback: LayoutConfig) -> Self {
        LayoutRegistry {
            layouts: HashMap::new(),
            fallback,
        }
    }

    /// Registers the layout of a known build.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Layout`] if the layout is inconsistent.
    pub fn register(&mut self, fingerprint: BuildFingerprint, layout: LayoutConfig) -> Result<()> {
        layout.validate()?;
        self.layouts.insert(fingerprint, layout);
        Ok(())
    }

    /// Returns the layout registered for `fingerprint`, or the fallback.
    #[must_use]
    pub fn select(&self, fingerprint: &BuildFingerprint) -> &LayoutConfig {
        self.layouts.get(fingerprint).unwrap_or(&self.fallback)
    }

    /// Returns `true` if `fingerprint` has a dedicated layout.
    #[must_use]
    pub fn is_known(&self, fingerprint: &BuildFingerprint) -> bool {
        self.layouts.contains_key(fingerprint)
    }

    /// Number of registered builds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Returns `true` if no build is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}
