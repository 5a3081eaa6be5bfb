use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::foundation::geom::CanonicalRect;

/// Engine-wide configuration.
///
/// Everything the evaluator and scheduler consult at run time lives here so
/// renders are reproducible from a single value; nothing is read from process
/// globals after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker threads for tile splitting and frame production.
    /// `None` means the machine's logical core count.
    pub threads: Option<usize>,
    /// Byte budget of the in-memory image cache.
    pub image_cache_max_bytes: usize,
    /// Byte budget of the persistent image cache.
    pub disk_cache_max_bytes: usize,
    /// Concatenate chains of matrix-only transforms before pulling inputs.
    pub transform_concatenation: bool,
    /// When an effect cannot render at the requested scale, also request its
    /// inputs at full scale (better quality, more work).
    pub scale_one_inputs_when_unsupported: bool,
    /// Frames the output scheduler buffers before parking producers.
    pub scheduler_buffer_capacity: usize,
    /// Default project format, the fallback for infinite regions of
    /// definition with no finite upstream.
    pub project_format: CanonicalRect,
    /// Root directory of the persistent cache (`SMALT_CACHE_ROOT`).
    pub cache_root: Option<PathBuf>,
    /// OCIO configuration path (`SMALT_OCIO`); opaque to the core, surfaced
    /// to effects as-is.
    pub ocio_config: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threads: None,
            image_cache_max_bytes: 2 * 1024 * 1024 * 1024,
            disk_cache_max_bytes: 8 * 1024 * 1024 * 1024,
            transform_concatenation: true,
            scale_one_inputs_when_unsupported: false,
            scheduler_buffer_capacity: 32,
            project_format: CanonicalRect::new(0.0, 0.0, 1920.0, 1080.0),
            cache_root: None,
            ocio_config: None,
        }
    }
}

impl Settings {
    /// Apply the environment inputs the core recognizes.
    pub fn with_env(mut self) -> Self {
        if let Some(root) = std::env::var_os("SMALT_CACHE_ROOT") {
            self.cache_root = Some(PathBuf::from(root));
        }
        if let Some(ocio) = std::env::var_os("SMALT_OCIO") {
            self.ocio_config = Some(PathBuf::from(ocio));
        }
        self
    }

    /// Worker count, clamped to at least one and at most the logical core
    /// count.
    pub fn effective_threads(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        match self.threads {
            Some(n) => n.clamp(1, cores),
            None => cores,
        }
    }
}
