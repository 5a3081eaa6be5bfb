//! Tile dispatch across worker threads, honoring each effect's declared
//! thread safety.
//!
//! Host-tiled effects get the request split into bands rendered on the
//! shared pool, with the render context snapshotted into each worker.
//! Instance-safe and unsafe effects serialize on the node or plugin lock.
//! Every tile renders into scratch planes and pastes under the image lock,
//! so `rendering` cells never expose partial pixels.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::cache::image::{Image, ScratchPlane};
use crate::eval::context::{FrameState, RenderContext};
use crate::eval::evaluator::{Evaluator, TileInputs};
use crate::eval::transform::RedirectMap;
use crate::foundation::error::{SmaltError, SmaltResult};
use crate::foundation::geom::{CanonicalRect, PixelRect};
use crate::graph::effect::{RenderActionArgs, RenderSafety};
use crate::graph::node::Node;
use crate::graph::plane::Plane;

/// One output plane of the current render.
pub(crate) struct PlaneEntry {
    pub plane: Plane,
    /// Level-0 sibling the effect draws into when it cannot render at the
    /// requested scale. Same image as `output` otherwise.
    pub fullscale: Arc<Image>,
    /// The image whose bitmap tracks progress and which the cache holds.
    pub output: Arc<Image>,
}

impl PlaneEntry {
    fn render_target(&self, render_full_scale: bool) -> &Arc<Image> {
        if render_full_scale {
            &self.fullscale
        } else {
            &self.output
        }
    }
}

pub(crate) struct DispatchArgs<'a> {
    pub eval: &'a Evaluator,
    pub node: &'a Arc<Node>,
    pub frame: &'a FrameState,
    pub ctx: &'a RenderContext,
    pub entries: &'a [PlaneEntry],
    /// Rectangle to render, in output-image pixel space.
    pub rect: PixelRect,
    pub rod: &'a CanonicalRect,
    pub par: f64,
    pub output_mip: u32,
    pub use_trimap: bool,
    pub render_full_scale: bool,
    pub use_image_as_output: bool,
    pub original_scale: f64,
    pub mapped_scale: f64,
    pub redirects: &'a RedirectMap,
}

pub(crate) enum DispatchOutcome {
    Rendered,
    /// Some of the rectangle is being produced by a peer; the caller waits
    /// through the tri-map.
    Elsewhere,
}

pub(crate) fn dispatch(args: &DispatchArgs<'_>) -> SmaltResult<DispatchOutcome> {
    let effect = args.node.effect().clone();
    let threads = args.eval.pool().current_num_threads();
    let mut safety = effect.safety();
    if matches!(safety, RenderSafety::HostTiled)
        && (!effect.supports_tiles() || threads <= 1 || args.rect.height() <= 1)
    {
        safety = RenderSafety::FullySafe;
    }

    let matrices: BTreeMap<usize, kurbo::Affine> = args
        .redirects
        .iter()
        .map(|(i, r)| (*i, r.matrix))
        .collect();

    match safety {
        RenderSafety::HostTiled => {
            let bands = args.rect.split_into_bands(threads);
            let results: Vec<SmaltResult<bool>> = args.eval.pool().install(|| {
                bands
                    .par_iter()
                    .map(|band| {
                        let ctx = args.ctx.snapshot();
                        render_tile(args, &ctx, *band, true, &matrices)
                    })
                    .collect()
            });
            let mut elsewhere = false;
            let mut failure: Option<SmaltError> = None;
            for r in results {
                match r {
                    Ok(e) => elsewhere |= e,
                    Err(err) if err.is_abort() => return Err(err),
                    Err(err) => failure = Some(failure.take().unwrap_or(err)),
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }
            Ok(if elsewhere {
                DispatchOutcome::Elsewhere
            } else {
                DispatchOutcome::Rendered
            })
        }
        RenderSafety::InstanceSafe => {
            let _guard = args.node.instance_lock().lock().expect("instance lock");
            single(args, &matrices)
        }
        RenderSafety::Unsafe => {
            let lock = args.node.plugin_lock().clone();
            let _guard = lock.lock().expect("plugin lock");
            single(args, &matrices)
        }
        RenderSafety::FullySafe => single(args, &matrices),
    }
}

fn single(
    args: &DispatchArgs<'_>,
    matrices: &BTreeMap<usize, kurbo::Affine>,
) -> SmaltResult<DispatchOutcome> {
    let ctx = args.ctx.snapshot();
    let elsewhere = render_tile(args, &ctx, args.rect, false, matrices)?;
    Ok(if elsewhere {
        DispatchOutcome::Elsewhere
    } else {
        DispatchOutcome::Rendered
    })
}

/// Render one tile. Returns whether part of the requested rectangle is in
/// flight on a peer thread.
fn render_tile(
    args: &DispatchArgs<'_>,
    ctx: &RenderContext,
    rect: PixelRect,
    host_tiled: bool,
    matrices: &BTreeMap<usize, kurbo::Affine>,
) -> SmaltResult<bool> {
    let node = args.node;
    let frame = args.frame;
    let trimap = node.trimap();
    let first = &args.entries[0];

    if frame.aborted(node, ctx.node_hash) {
        return Err(SmaltError::Aborted);
    }

    // A long-queued worker re-checks the bitmap: a peer may have rendered
    // (or be rendering) part of its band since the split was planned.
    let mut elsewhere = false;
    let actual_out = if host_tiled {
        let minimal = if args.use_trimap {
            let (m, e) = first.output.minimal_rect_trimap(&rect);
            elsewhere = e;
            m
        } else {
            first.output.minimal_rect(&rect)
        };
        if minimal.is_empty() {
            return Ok(elsewhere);
        }
        // Never grow past the planned band.
        if rect.contains(&minimal) { minimal } else { rect }
    } else {
        rect
    };

    // Map into the render-scale space when the effect draws at level 0.
    let render_rect = if args.render_full_scale && !args.use_image_as_output {
        let canonical = actual_out.to_canonical(args.output_mip, args.par);
        match canonical
            .to_pixel_enclosing(0, args.par)
            .intersect(&first.fullscale.bounds())
        {
            Some(r) => r,
            None => return Ok(elsewhere),
        }
    } else {
        actual_out
    };

    if args.use_trimap {
        for e in args.entries {
            trimap.mark_rendering(&e.output, &actual_out);
        }
    }

    let mut scratch: Vec<ScratchPlane> = args
        .entries
        .iter()
        .map(|e| {
            ScratchPlane::new(
                Plane {
                    layer: e.plane.layer.clone(),
                    components: e.render_target(args.render_full_scale).components(),
                },
                render_rect,
            )
        })
        .collect();

    let inputs = TileInputs {
        eval: args.eval,
        node,
        frame,
        ctx: Some(ctx),
        redirects: args.redirects,
    };
    let render_args = RenderActionArgs {
        time: ctx.time,
        view: ctx.view,
        original_scale: args.original_scale,
        mapped_scale: args.mapped_scale,
        rect: render_rect,
        is_sequential: frame.is_sequential,
        is_interactive: frame.is_interactive,
        inputs: &inputs,
        input_transforms: matrices,
    };

    let status = node.effect().render(&render_args, &mut scratch);

    if let Err(err) = status {
        let failed = !err.is_abort();
        if args.use_trimap {
            for e in args.entries {
                trimap.clear(&e.output, &actual_out, failed);
            }
        }
        return Err(err);
    }

    if frame.aborted(node, ctx.node_hash) {
        if args.use_trimap {
            for e in args.entries {
                trimap.clear(&e.output, &actual_out, false);
            }
        }
        return Err(SmaltError::Aborted);
    }

    for (e, s) in args.entries.iter().zip(scratch.iter()) {
        if Image::scratch_has_nans(s) {
            tracing::warn!(
                node = node.name(),
                plane = e.plane.layer.label(),
                ?render_rect,
                "rendered tile contains non-finite values"
            );
        }
        let target = e.render_target(args.render_full_scale);
        target.paste_scratch(s, &render_rect)?;
        if args.render_full_scale && !args.use_image_as_output {
            // Level-0 pixels live in a local sibling; fold them down into
            // the cached output right away.
            e.fullscale.downscale_into(&e.output, &actual_out)?;
        }
        if args.use_trimap {
            trimap.mark_rendered(&e.output, &actual_out);
        } else {
            e.output.mark_rendered(&actual_out);
        }
    }

    Ok(elsewhere)
}
