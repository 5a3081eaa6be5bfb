//! Effects whose whole behavior is an identity declaration in time.

use crate::cache::image::ScratchPlane;
use crate::foundation::error::SmaltResult;
use crate::foundation::geom::CanonicalRect;
use crate::foundation::hash::StableHasher;
use crate::graph::effect::{Effect, Identity, RenderActionArgs};

/// Pure retime: identity to input 0 at `time + offset`. Its own render is
/// never called.
pub struct TimeOffset {
    offset: f64,
}

impl TimeOffset {
    pub fn new(offset: f64) -> Self {
        Self { offset }
    }
}

impl Effect for TimeOffset {
    fn plugin_id(&self) -> &str {
        "smalt.time.offset"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_f64(self.offset);
    }

    fn input_count(&self) -> usize {
        1
    }

    fn is_identity(
        &self,
        time: f64,
        _view: i32,
        _mip_level: u32,
        _rod: &CanonicalRect,
    ) -> Identity {
        Identity::Input {
            input: 0,
            time: time + self.offset,
        }
    }

    fn render(
        &self,
        _args: &RenderActionArgs<'_>,
        _planes: &mut [ScratchPlane],
    ) -> SmaltResult<()> {
        Err(crate::foundation::error::SmaltError::invariant(
            "render called on a pure identity effect",
        ))
    }
}

/// Freeze the clip at `held_frame`: identity on itself at another time,
/// resolved with one re-entry of the evaluator.
pub struct FrameHold {
    held_frame: f64,
}

impl FrameHold {
    pub fn new(held_frame: f64) -> Self {
        Self { held_frame }
    }
}

impl Effect for FrameHold {
    fn plugin_id(&self) -> &str {
        "smalt.time.framehold"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_f64(self.held_frame);
    }

    fn input_count(&self) -> usize {
        1
    }

    fn is_identity(
        &self,
        time: f64,
        _view: i32,
        _mip_level: u32,
        _rod: &CanonicalRect,
    ) -> Identity {
        if time == self.held_frame {
            // At the held frame the node is a plain identity to its input.
            Identity::Input {
                input: 0,
                time,
            }
        } else {
            Identity::SelfAtTime {
                time: self.held_frame,
            }
        }
    }

    fn render(
        &self,
        _args: &RenderActionArgs<'_>,
        _planes: &mut [ScratchPlane],
    ) -> SmaltResult<()> {
        Err(crate::foundation::error::SmaltError::invariant(
            "render called on a pure identity effect",
        ))
    }

    fn is_frame_varying(&self) -> bool {
        false
    }
}
