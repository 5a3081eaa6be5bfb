//! Output device writing delivered frames as raw image files.
//!
//! Files use the same bit-exact header + row-major payload as the disk
//! cache, one file per frame: `<stem>.<frame>.smimg`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::disk::encode_entry;
use crate::cache::image::Image;
use crate::foundation::error::SmaltResult;
use crate::output::device::{OutputDevice, StopCode};

/// Frame-sequence writer device used by headless renders.
pub struct SequenceWriterDevice {
    dir: PathBuf,
    stem: String,
    range: Option<(i64, i64)>,
}

impl SequenceWriterDevice {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, first: i64, last: i64) -> Self {
        self.range = Some((first, last));
        self
    }

    pub fn frame_path(&self, frame: i64) -> PathBuf {
        self.dir.join(format!("{}.{frame:06}.smimg", self.stem))
    }
}

impl OutputDevice for SequenceWriterDevice {
    fn deliver(&self, frame: i64, _view: i32, image: &Arc<Image>) -> SmaltResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut params = image.params().clone();
        params.bounds = image.bounds();
        let blob = encode_entry(image.key(), &params, &image.snapshot_bytes());
        let mut f = std::fs::File::create(self.frame_path(frame))?;
        f.write_all(&blob)?;
        Ok(())
    }

    fn frame_range_to_render(&self) -> Option<(i64, i64)> {
        self.range
    }

    fn on_render_stopped(&self, code: StopCode) {
        if code != StopCode::Finished {
            tracing::warn!(stem = %self.stem, ?code, "sequence write ended early");
        }
    }

    fn report_failure(&self, message: &str) {
        tracing::error!(stem = %self.stem, message, "sequence write failed");
    }
}
