//! The effect seam: everything the core may ask of a node in the graph.
//!
//! Effects are pull-driven. The evaluator asks for the region of definition,
//! identity, needed frames and regions of interest, then hands the effect a
//! set of scratch planes to draw into. All answers must be pure given the
//! node hash; the action cache relies on it.

use std::collections::BTreeMap;

use crate::cache::image::ScratchPlane;
use crate::foundation::error::SmaltResult;
use crate::foundation::geom::{CanonicalRect, PixelRect};
use crate::foundation::hash::StableHasher;
use crate::graph::plane::Plane;

/// Thread-safety contract of an effect's `render`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderSafety {
    /// One `render` at a time across every instance of the plugin.
    Unsafe,
    /// One `render` at a time per instance.
    InstanceSafe,
    /// Concurrent `render` calls per instance are fine.
    FullySafe,
    /// Fully safe, and the host may split one request into tiles rendered
    /// concurrently.
    HostTiled,
}

/// Whether frames must be rendered in sequence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequentialPreference {
    Any,
    Only,
    Not,
}

/// Whether the effect can render at a scale other than 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderScaleSupport {
    Yes,
    No,
    /// Unknown until the first scaled query succeeds or fails.
    Maybe,
}

/// Role of the node, used where the original discriminated with downcasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectKind {
    Generator,
    Filter,
    Reader,
    Writer,
    Viewer,
    /// A node whose only job is to persist its input through the disk cache.
    DiskCache,
}

/// Answer of the identity action.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Identity {
    /// The effect actually renders.
    No,
    /// Output equals `input`'s output at `time`.
    Input { input: usize, time: f64 },
    /// Output equals this same node's output at another time.
    SelfAtTime { time: f64 },
}

/// Frames each input needs, per view: `input -> view -> [first, last] list`.
pub type FramesNeeded = BTreeMap<usize, BTreeMap<i32, Vec<(f64, f64)>>>;

/// Canonical region each input must cover for a given output region.
pub type RoiMap = BTreeMap<usize, CanonicalRect>;

/// A matrix-only transform declaration, for concatenation across the graph.
#[derive(Clone, Copy, Debug)]
pub struct TransformDecl {
    /// The input the transform applies to.
    pub input: usize,
    /// Canonical-space transform from input to output.
    pub matrix: kurbo::Affine,
}

/// Upstream answers the host computes for trait default implementations.
pub trait UpstreamQuery {
    fn input_count(&self) -> usize;
    /// `None` when the input is not connected.
    fn input_rod(&self, input: usize, time: f64, view: i32, mip: u32)
    -> SmaltResult<Option<CanonicalRect>>;
    fn project_format(&self) -> CanonicalRect;
}

/// Access to the input images pre-rendered for the current tile.
///
/// Must only be used from within `render`, where a render context is active;
/// the evaluator logs a diagnostic and recomputes on demand otherwise.
pub trait InputImageSource {
    fn get_image(
        &self,
        input: usize,
        time: f64,
        view: i32,
        plane: &Plane,
    ) -> SmaltResult<std::sync::Arc<crate::cache::image::Image>>;
}

/// Arguments of the region-of-definition action.
#[derive(Clone, Copy, Debug)]
pub struct RodArgs {
    pub time: f64,
    pub view: i32,
    pub mip_level: u32,
}

/// Arguments of the render action.
pub struct RenderActionArgs<'a> {
    pub time: f64,
    pub view: i32,
    /// Scale of the caller's request.
    pub original_scale: f64,
    /// Scale the render actually runs at (1.0 when falling back to full
    /// scale for effects without render-scale support).
    pub mapped_scale: f64,
    /// Pixel rectangle to fill, in the mapped scale.
    pub rect: PixelRect,
    pub is_sequential: bool,
    pub is_interactive: bool,
    pub inputs: &'a dyn InputImageSource,
    /// Concatenated matrices for rerouted inputs; present only when this
    /// effect declared [`Effect::can_concatenate_transforms`].
    pub input_transforms: &'a BTreeMap<usize, kurbo::Affine>,
}

/// Arguments of the sequence bracket actions.
#[derive(Clone, Copy, Debug)]
pub struct SequenceArgs {
    pub first: f64,
    pub last: f64,
    pub step: f64,
    pub interactive: bool,
    pub scale: f64,
    pub view: i32,
}

/// An image-processing effect: the only thing the core knows about a node's
/// behavior.
pub trait Effect: Send + Sync {
    /// Stable plugin identifier; instances of the same plugin share the
    /// plugin-wide render lock when `safety` is [`RenderSafety::Unsafe`].
    fn plugin_id(&self) -> &str;

    /// Fold every parameter that affects output into the node hash.
    fn fold_params(&self, h: &mut StableHasher);

    /// Number of input slots.
    fn input_count(&self) -> usize;

    /// Canonical region on which output is defined. The default is the
    /// union of the connected inputs, falling back to the project format.
    fn region_of_definition(
        &self,
        args: &RodArgs,
        up: &dyn UpstreamQuery,
    ) -> SmaltResult<CanonicalRect> {
        let mut acc = CanonicalRect::default();
        let mut any = false;
        for i in 0..self.input_count() {
            if let Some(rod) = up.input_rod(i, args.time, args.view, args.mip_level)? {
                acc = if any { acc.union(&rod) } else { rod };
                any = true;
            }
        }
        Ok(if any { acc } else { up.project_format() })
    }

    /// Canonical region needed from each input to produce `out_rect`.
    /// Defaults to the same region for every connected input.
    fn regions_of_interest(
        &self,
        time: f64,
        view: i32,
        mip_level: u32,
        out_rect: &CanonicalRect,
    ) -> RoiMap {
        let _ = (time, view, mip_level);
        (0..self.input_count()).map(|i| (i, *out_rect)).collect()
    }

    /// Frames needed from each input. Defaults to the current frame on the
    /// current view for every input.
    fn frames_needed(&self, time: f64, view: i32) -> FramesNeeded {
        (0..self.input_count())
            .map(|i| (i, BTreeMap::from([(view, vec![(time, time)])])))
            .collect()
    }

    /// Identity declaration for the given request.
    fn is_identity(
        &self,
        time: f64,
        view: i32,
        mip_level: u32,
        rod: &CanonicalRect,
    ) -> Identity {
        let _ = (time, view, mip_level, rod);
        Identity::No
    }

    /// First and last frame on which the effect is defined.
    fn time_domain(&self) -> (f64, f64) {
        (1.0, 1.0)
    }

    /// Planes this effect can produce at `time`.
    fn produced_planes(&self, time: f64, view: i32) -> Vec<Plane> {
        let _ = (time, view);
        vec![Plane::rgba()]
    }

    /// Input through which non-produced planes pass, if any.
    fn pass_through_input(&self, time: f64, view: i32) -> Option<usize> {
        let _ = (time, view);
        (self.input_count() > 0).then_some(0)
    }

    /// Declare a matrix-only transform for concatenation, if this effect is
    /// one.
    fn transform_at(&self, time: f64, view: i32) -> Option<TransformDecl> {
        let _ = (time, view);
        None
    }

    /// Whether this effect can sample its inputs through a host-supplied
    /// matrix, making it a concatenation anchor.
    fn can_concatenate_transforms(&self) -> bool {
        false
    }

    /// Fill `planes` over `args.rect`. Input images are reachable through
    /// `args.inputs`.
    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()>;

    fn supports_tiles(&self) -> bool {
        true
    }

    /// Pixel aspect ratio of the output, applied horizontally.
    fn pixel_aspect_ratio(&self) -> f64 {
        1.0
    }

    fn supports_multiresolution(&self) -> bool {
        true
    }

    fn supports_render_scale(&self) -> RenderScaleSupport {
        RenderScaleSupport::Yes
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::FullySafe
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Filter
    }

    fn sequential_preference(&self) -> SequentialPreference {
        SequentialPreference::Any
    }

    /// True when output changes with time even under a constant hash
    /// (readers, animated generators). Folded into the image key.
    fn is_frame_varying(&self) -> bool {
        true
    }

    fn begin_sequence(&self, args: &SequenceArgs) -> SmaltResult<()> {
        let _ = args;
        Ok(())
    }

    fn end_sequence(&self, args: &SequenceArgs) -> SmaltResult<()> {
        let _ = args;
        Ok(())
    }
}
