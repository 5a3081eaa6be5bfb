//! The recursive pull engine.
//!
//! `render_region` is the spine of the core: identity and pass-through
//! short-circuits, action-cached queries, cache lookup with conversion
//! policies, tile planning against the bitmap, input pre-rendering, memory
//! pressure re-planning, idempotent allocation, safety-aware dispatch and
//! final downscale/convert.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::cache::image::{Image, ImageKey, ImageParams, PlaneImages};
use crate::eval::context::{FrameState, RenderContext};
use crate::eval::tiles::{self, DispatchArgs, PlaneEntry};
use crate::eval::transform::{RedirectMap, collect_redirects, inverse_map_rect};
use crate::foundation::error::{SmaltError, SmaltResult};
use crate::foundation::geom::{CanonicalRect, PixelRect, scale_from_mip_level};
use crate::foundation::hash::NodeHash;
use crate::graph::effect::{
    FramesNeeded, Identity, InputImageSource, RenderScaleSupport, RodArgs, UpstreamQuery,
};
use crate::graph::node::{Node, Project};
use crate::graph::plane::{BitDepth, Plane};

/// Arguments of one `render_region` call.
#[derive(Clone)]
pub struct RenderRegionArgs {
    pub time: f64,
    pub view: i32,
    pub mip_level: u32,
    /// Pixel rectangle at `mip_level`, or `None` for the whole RoD.
    pub roi: Option<PixelRect>,
    pub planes: SmallVec<[Plane; 2]>,
    pub depth: BitDepth,
    pub bypass_cache: bool,
    pub precomputed_rod: Option<CanonicalRect>,
    /// Set while resolving an identity-on-self hop, to refuse chains.
    self_retime_hop: bool,
}

impl RenderRegionArgs {
    pub fn new(time: f64, view: i32, planes: impl IntoIterator<Item = Plane>) -> Self {
        Self {
            time,
            view,
            mip_level: 0,
            roi: None,
            planes: planes.into_iter().collect(),
            depth: BitDepth::F32,
            bypass_cache: false,
            precomputed_rod: None,
            self_retime_hop: false,
        }
    }

    pub fn with_roi(mut self, roi: PixelRect) -> Self {
        self.roi = Some(roi);
        self
    }

    pub fn with_mip_level(mut self, mip: u32) -> Self {
        self.mip_level = mip;
        self
    }

    pub fn with_depth(mut self, depth: BitDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// The pull evaluator. One per engine; cheap to share.
pub struct Evaluator {
    project: Arc<Project>,
    pool: Arc<rayon::ThreadPool>,
}

struct UpstreamCtx<'a> {
    eval: &'a Evaluator,
    node: &'a Arc<Node>,
    frame: &'a FrameState,
}

impl UpstreamQuery for UpstreamCtx<'_> {
    fn input_count(&self) -> usize {
        self.node.input_count()
    }

    fn input_rod(
        &self,
        input: usize,
        time: f64,
        view: i32,
        mip: u32,
    ) -> SmaltResult<Option<CanonicalRect>> {
        match self.node.input(input) {
            Some(n) => Ok(Some(self.eval.cached_rod(&n, self.frame, time, view, mip)?.0)),
            None => Ok(None),
        }
    }

    fn project_format(&self) -> CanonicalRect {
        self.eval.project.settings().project_format
    }
}

/// Input-image access handed to effects during `render`.
pub(crate) struct TileInputs<'a> {
    pub(crate) eval: &'a Evaluator,
    pub(crate) node: &'a Arc<Node>,
    pub(crate) frame: &'a FrameState,
    pub(crate) ctx: Option<&'a RenderContext>,
    pub(crate) redirects: &'a RedirectMap,
}

impl InputImageSource for TileInputs<'_> {
    fn get_image(
        &self,
        input: usize,
        time: f64,
        view: i32,
        plane: &Plane,
    ) -> SmaltResult<Arc<Image>> {
        let input_node = match self.redirects.get(&input) {
            Some(r) => r.target.clone(),
            None => self.node.input(input).ok_or_else(|| SmaltError::MissingUpstream {
                node: self.node.name().to_owned(),
                input,
            })?,
        };
        let input_hash = input_node.current_hash();

        if let Some(ctx) = self.ctx {
            let found = ctx.input_images.iter().find(|img| {
                let k = img.key();
                k.node_hash == input_hash
                    && k.layer == plane.layer
                    && (!k.frame_varying || k.time == time)
                    && k.view == view
                    && plane.components_convertible_from(img.components())
            });
            if let Some(img) = found {
                return Ok(img.clone());
            }
            tracing::error!(
                node = self.node.name(),
                input,
                time,
                "input image was not pre-rendered; recomputing on demand"
            );
        } else {
            tracing::error!(
                node = self.node.name(),
                input,
                "get_image called without an active render context; recomputing on demand"
            );
        }

        // Recovery path: pull the input now over the region of interest the
        // context recorded (or its whole RoD without one).
        let mut args = RenderRegionArgs::new(time, view, [plane.clone()]);
        if let Some(ctx) = self.ctx {
            args.mip_level = ctx.mip_level;
            if let Some(roi) = ctx.roi_map.get(&input) {
                let par = input_node.effect().pixel_aspect_ratio();
                args.roi = Some(roi.to_pixel_enclosing(ctx.mip_level, par));
            }
        }
        let planes = self.eval.render_region(&input_node, self.frame, &args)?;
        planes
            .into_iter()
            .next()
            .ok_or_else(|| SmaltError::plugin("input produced no planes"))
    }
}

impl Evaluator {
    pub fn new(project: Arc<Project>) -> SmaltResult<Self> {
        let threads = project.settings().effective_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("smalt-tile-{i}"))
            .build()
            .map_err(|e| SmaltError::Other(anyhow::anyhow!("building tile pool: {e}")))?;
        Ok(Self {
            project,
            pool: Arc::new(pool),
        })
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub(crate) fn pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.pool
    }

    /// Region-of-definition action through the per-node cache, with the
    /// infinity heuristic applied. Returns the rod and whether it fell back
    /// to the project default format.
    pub fn cached_rod(
        &self,
        node: &Arc<Node>,
        frame: &FrameState,
        time: f64,
        view: i32,
        mip: u32,
    ) -> SmaltResult<(CanonicalRect, bool)> {
        let hash = self.ensure_hash(node);
        let format = self.project.settings().project_format;
        if let Some(rod) = node.actions().get_rod(hash, time, view, mip) {
            return Ok((rod, rod == format));
        }
        let rod = node.effect().region_of_definition(
            &RodArgs {
                time,
                view,
                mip_level: mip,
            },
            &UpstreamCtx {
                eval: self,
                node,
                frame,
            },
        )?;
        let (rod, is_format) = if rod.is_infinite() {
            self.apply_infinity_heuristic(node, frame, time, view, mip, rod)?
        } else {
            (rod, false)
        };
        node.actions().set_rod(time, view, mip, rod);
        Ok((rod, is_format))
    }

    /// Clip an infinite rod to the union of upstream rods, falling back to
    /// the project default format.
    fn apply_infinity_heuristic(
        &self,
        node: &Arc<Node>,
        frame: &FrameState,
        time: f64,
        view: i32,
        mip: u32,
        rod: CanonicalRect,
    ) -> SmaltResult<(CanonicalRect, bool)> {
        let mut union = CanonicalRect::default();
        let mut any = false;
        for (_, input) in node.connected_inputs() {
            let (input_rod, _) = self.cached_rod(&input, frame, time, view, mip)?;
            if !input_rod.is_infinite() && !input_rod.is_empty() {
                union = if any { union.union(&input_rod) } else { input_rod };
                any = true;
            }
        }
        if any {
            Ok((rod.clamp_infinite_to(&union), false))
        } else {
            let format = self.project.settings().project_format;
            Ok((rod.clamp_infinite_to(&format), true))
        }
    }

    fn cached_identity(
        &self,
        node: &Arc<Node>,
        time: f64,
        view: i32,
        mip: u32,
        rod: &CanonicalRect,
    ) -> Identity {
        let hash = node.current_hash();
        if let Some(id) = node.actions().get_identity(hash, time, view, mip) {
            return id;
        }
        let id = node.effect().is_identity(time, view, mip, rod);
        node.actions().set_identity(time, view, mip, id);
        id
    }

    /// Time-domain action through the per-node cache.
    pub fn cached_time_domain(&self, node: &Arc<Node>) -> (f64, f64) {
        let hash = self.ensure_hash(node);
        if let Some(td) = node.actions().get_time_domain(hash) {
            return td;
        }
        let td = node.effect().time_domain();
        node.actions().set_time_domain(td.0, td.1);
        td
    }

    fn ensure_hash(&self, node: &Arc<Node>) -> NodeHash {
        let mut hash = node.current_hash();
        if hash == NodeHash::NONE {
            hash = node.refresh_hash();
        }
        if node.actions().current_tag() != hash {
            node.actions().invalidate_all(hash);
        }
        hash
    }

    /// Pull one frame of `node` at the requested planes and depth.
    #[tracing::instrument(skip_all, fields(node = node.name(), time = frame.time))]
    pub fn render_frame(
        &self,
        node: &Arc<Node>,
        frame: &FrameState,
        planes: impl IntoIterator<Item = Plane>,
        depth: BitDepth,
    ) -> SmaltResult<PlaneImages> {
        let mut args = RenderRegionArgs::new(frame.time, frame.view, planes);
        args.depth = depth;
        // Writers must re-run their render action every time, but their
        // upstream pulls still use the cache.
        args.bypass_cache = node.is_writer();
        self.render_region(node, frame, &args)
    }

    /// The pull engine (spec steps 1–16). Returns the produced plane
    /// images; `Err(Aborted)` for cooperative cancellation.
    pub fn render_region(
        &self,
        node: &Arc<Node>,
        frame: &FrameState,
        args: &RenderRegionArgs,
    ) -> SmaltResult<PlaneImages> {
        // 1. Nothing requested is a caller bug.
        if args.planes.is_empty() {
            return Err(SmaltError::invalid("render_region with no planes requested"));
        }

        // 2. Hash and action-cache coherence.
        let node_hash = self.ensure_hash(node);
        if frame.aborted(node, node_hash) {
            return Err(SmaltError::Aborted);
        }

        let effect = node.effect().clone();
        let par = effect.pixel_aspect_ratio();

        // 3. Render-scale decision (tri-state support refinable).
        let mip = args.mip_level;
        let mut scale_support = node.scale_support();
        let mut render_full_scale =
            matches!(scale_support, RenderScaleSupport::No) && mip != 0;
        let mut mapped_mip = if render_full_scale { 0 } else { mip };
        let use_scale_one_inputs = {
            let s = self.project.settings();
            render_full_scale
                && (s.scale_one_inputs_when_unsupported || !effect.supports_multiresolution())
        };

        // 4. Region of definition.
        let (rod, rod_is_format) = match args.precomputed_rod {
            Some(rod) => (rod, false),
            None => self.cached_rod(node, frame, args.time, args.view, mapped_mip)?,
        };
        if rod.is_empty() {
            return Ok(PlaneImages::new());
        }
        if matches!(scale_support, RenderScaleSupport::Maybe) && mapped_mip != 0 {
            // The rod action may have refined support; recompute the
            // full-scale decision.
            scale_support = node.scale_support();
            render_full_scale = matches!(scale_support, RenderScaleSupport::No) && mip != 0;
            mapped_mip = if render_full_scale { 0 } else { mip };
        }

        // 5. Identity short-circuits.
        match self.cached_identity(node, args.time, args.view, mapped_mip, &rod) {
            Identity::No => {}
            Identity::SelfAtTime { time } => {
                if time == args.time {
                    return Err(SmaltError::plugin(format!(
                        "'{}' declares identity to itself at its own time {time}",
                        node.name()
                    )));
                }
                if args.self_retime_hop {
                    return Err(SmaltError::invariant(format!(
                        "'{}' chains identity-on-self hops",
                        node.name()
                    )));
                }
                let mut sub = args.clone();
                sub.time = time;
                sub.precomputed_rod = None;
                sub.self_retime_hop = true;
                return self.render_region(node, frame, &sub);
            }
            Identity::Input { input, time } => {
                let input_node =
                    node.input(input)
                        .ok_or_else(|| SmaltError::MissingUpstream {
                            node: node.name().to_owned(),
                            input,
                        })?;
                let mut sub = args.clone();
                sub.time = time;
                sub.precomputed_rod = None;
                sub.self_retime_hop = false;
                return self.render_region(&input_node, frame, &sub);
            }
        }

        // 6. Plane pass-through: split requested planes into those this node
        // produces and those fetched from an upstream producer.
        let available = node.available_planes(args.time, args.view);
        let mut produced: SmallVec<[Plane; 2]> = SmallVec::new();
        let mut fetched = PlaneImages::new();
        for plane in &args.planes {
            let Some((avail_plane, producer)) = available
                .iter()
                .find(|(p, _)| p.layer == plane.layer)
                .cloned()
            else {
                // Unknown plane: skipped, the consumer sees black.
                tracing::debug!(node = node.name(), plane = plane.layer.label(), "plane unavailable");
                continue;
            };
            if Arc::ptr_eq(&producer, node) {
                let _ = avail_plane;
                produced.push(plane.clone());
            } else {
                let mut sub = args.clone();
                sub.planes = SmallVec::from_iter([plane.clone()]);
                sub.precomputed_rod = None;
                let mut upstream = self.render_region(&producer, frame, &sub)?;
                fetched.append(&mut upstream);
            }
        }
        if produced.is_empty() {
            if fetched.is_empty() {
                return Err(SmaltError::invalid(format!(
                    "'{}' produces none of the requested planes",
                    node.name()
                )));
            }
            return Ok(fetched);
        }

        // 7. Transform concatenation (scoped to this call; data-only, so it
        // unwinds on every exit path).
        let redirects = if self.project.settings().transform_concatenation
            && effect.can_concatenate_transforms()
        {
            collect_redirects(node, args.time, args.view)
        } else {
            RedirectMap::new()
        };

        let mut produced_images = self.render_produced_planes(
            node,
            frame,
            args,
            node_hash,
            &produced,
            rod,
            rod_is_format,
            par,
            render_full_scale,
            use_scale_one_inputs,
            mapped_mip,
            &redirects,
        )?;
        produced_images.append(&mut fetched);
        Ok(produced_images)
    }

    /// Steps 8–16: cache lookup through final conversion, for the planes
    /// this node itself produces.
    #[allow(clippy::too_many_arguments)]
    fn render_produced_planes(
        &self,
        node: &Arc<Node>,
        frame: &FrameState,
        args: &RenderRegionArgs,
        node_hash: NodeHash,
        produced: &[Plane],
        rod: CanonicalRect,
        rod_is_format: bool,
        par: f64,
        render_full_scale: bool,
        use_scale_one_inputs: bool,
        mapped_mip: u32,
        redirects: &RedirectMap,
    ) -> SmaltResult<PlaneImages> {
        let effect = node.effect().clone();
        let store = self.project.store().clone();
        let settings = self.project.settings();
        let tiles_supported = effect.supports_tiles();
        let use_image_as_output = render_full_scale && use_scale_one_inputs;
        let output_mip = if use_image_as_output { 0 } else { args.mip_level };

        // Output-space bounds and region of interest.
        let full_bounds = rod.to_pixel_enclosing(output_mip, par);
        let mut roi = match args.roi {
            Some(r) => {
                let r = if use_image_as_output && args.mip_level != 0 {
                    r.to_canonical(args.mip_level, par).to_pixel_enclosing(0, par)
                } else {
                    r
                };
                match r.intersect(&full_bounds) {
                    Some(r) => r,
                    // Empty request: nothing mutated, nothing returned.
                    None => return Ok(PlaneImages::new()),
                }
            }
            None => full_bounds,
        };
        if !tiles_supported {
            roi = full_bounds;
        }
        // Allocate only what the request needs when tiles are supported.
        let alloc_bounds = if tiles_supported { roi } else { full_bounds };

        // Stale-hash housecleaning: a changed hash evicts the previous
        // render's entries wholesale.
        if let Some(prev) = node.take_stale_render(node_hash) {
            if node.is_disk_cache() {
                if let Some(disk) = self.project.disk_cache() {
                    disk.evict_all_with_hash(prev);
                }
            }
            store.evict_all_with_hash(prev);
        }

        let frame_varying = node.is_frame_varying_recursive();
        let make_key = |plane: &Plane| ImageKey {
            node_hash,
            layer: plane.layer.clone(),
            time: args.time,
            view: args.view,
            mip_level: output_mip,
            frame_varying,
        };

        // 8. Cache lookup with the all-or-nothing plane policy.
        let mut bypass = args.bypass_cache;
        let create_in_cache = !node.is_writer();
        let mut entries: Vec<(Plane, Option<Arc<Image>>)> = Vec::with_capacity(produced.len());
        let mut frames_needed: Option<FramesNeeded> = None;
        {
            let mut all_hit = true;
            for plane in produced {
                let key = make_key(plane);
                let mut hit = store.find_compatible(&key, plane, args.depth, &settings.project_format);
                if bypass {
                    if let Some(img) = hit.take() {
                        store.evict_instance(&img);
                    }
                    // Writers always re-run render but keep using the cache
                    // upstream.
                    if node.is_writer() {
                        bypass = false;
                    }
                }
                if hit.is_none() && node.is_disk_cache() {
                    hit = self.revive_from_disk(&key)?;
                }
                // A hit at a different (higher-res) level is only usable as
                // a complete downscale source.
                if let Some(img) = &hit
                    && img.key().mip_level != output_mip
                {
                    let conv = roi
                        .to_canonical(output_mip, par)
                        .to_pixel_enclosing(img.key().mip_level, par);
                    if !img.rest_to_render(&conv).is_empty() {
                        hit = None;
                    }
                }
                if hit.is_none() {
                    all_hit = false;
                }
                if let Some(img) = &hit
                    && frames_needed.is_none()
                {
                    frames_needed = Some(img.params().frames_needed.clone());
                }
                entries.push((plane.clone(), hit));
            }
            if !all_hit {
                // Drop the partial set so the render produces a consistent
                // one.
                for (_, hit) in entries.iter_mut() {
                    if let Some(img) = hit.take() {
                        store.evict_instance(&img);
                    }
                }
                frames_needed = None;
            }
        }
        let frames_needed =
            frames_needed.unwrap_or_else(|| effect.frames_needed(args.time, args.view));

        // 9. Plan the rectangles still needing work.
        let first_hit = entries.first().and_then(|(_, h)| h.clone());
        let mut being_rendered_elsewhere = false;
        let mut redo_lookup = false;
        let mut original_serials: Vec<Option<u64>> = vec![None; entries.len()];
        let mut rects: Vec<PixelRect> = match &first_hit {
            Some(img) if img.key().mip_level == output_mip => {
                let (rest, elsewhere) = if frame.uses_trimap() {
                    img.rest_to_render_trimap(&roi)
                } else {
                    (img.rest_to_render(&roi), false)
                };
                being_rendered_elsewhere = elsewhere;
                rest
            }
            Some(_) => Vec::new(),
            None => vec![if tiles_supported { roi } else { full_bounds }],
        };

        if !rects.is_empty() && first_hit.is_some() && store.is_almost_full() {
            // Memory pressure: let the cache reclaim the partial image and
            // plan the full rectangle so nothing stays transitively pinned.
            rects = vec![roi];
            for (i, (_, hit)) in entries.iter_mut().enumerate() {
                original_serials[i] = hit.as_ref().map(|h| h.serial());
                *hit = None;
            }
            redo_lookup = true;
        } else if !tiles_supported && !rects.is_empty() && first_hit.is_some() {
            rects = vec![full_bounds];
        }

        // 10. Pre-render inputs for each planned rectangle.
        let mut per_rect_inputs: Vec<(crate::graph::effect::RoiMap, Vec<Arc<Image>>)> =
            Vec::with_capacity(rects.len());
        for rect in &rects {
            let canonical = rect
                .to_canonical(output_mip, par)
                .intersect(&rod)
                .unwrap_or_default();
            per_rect_inputs.push(self.render_inputs_for_rect(
                node,
                frame,
                args,
                &canonical,
                redirects,
                if use_scale_one_inputs { 0 } else { args.mip_level },
                bypass,
                &frames_needed,
                produced,
            )?);
        }

        // 11. Post-fetch cache re-check after a memory-pressure drop.
        if redo_lookup {
            let mut matched = true;
            for (i, (plane, hit)) in entries.iter_mut().enumerate() {
                let key = make_key(plane);
                let again = store.find_compatible(&key, plane, args.depth, &settings.project_format);
                let same_instance = matches!(
                    (&again, original_serials[i]),
                    (Some(img), Some(serial)) if img.serial() == serial
                );
                if same_instance {
                    *hit = again;
                } else {
                    matched = false;
                    break;
                }
            }
            if !matched {
                for (_, hit) in entries.iter_mut() {
                    *hit = None;
                }
                rects = vec![if tiles_supported { roi } else { full_bounds }];
                per_rect_inputs.clear();
                for rect in &rects {
                    let canonical = rect
                        .to_canonical(output_mip, par)
                        .intersect(&rod)
                        .unwrap_or_default();
                    per_rect_inputs.push(self.render_inputs_for_rect(
                        node,
                        frame,
                        args,
                        &canonical,
                        redirects,
                        if use_scale_one_inputs { 0 } else { args.mip_level },
                        bypass,
                        &frames_needed,
                        produced,
                    )?);
                }
            }
        }

        // 12. Allocate output planes (idempotent across racing peers).
        let mut plane_entries: Vec<PlaneEntry> = Vec::with_capacity(entries.len());
        for (plane, hit) in &entries {
            let params = ImageParams {
                rod,
                bounds: alloc_bounds,
                components: plane.components,
                depth: args.depth,
                par,
                rod_is_project_format: rod_is_format,
                frames_needed: frames_needed.clone(),
            };
            let output: Arc<Image> = match hit {
                Some(img) => {
                    if img.key().mip_level == output_mip {
                        img.ensure_bounds(&alloc_bounds)?;
                    }
                    img.allocate()?;
                    img.clone()
                }
                None => {
                    let key = make_key(plane);
                    let img = if create_in_cache {
                        let (img, _created) = store.get_or_create(key, params.clone(), true);
                        img.ensure_bounds(&alloc_bounds)?;
                        img
                    } else {
                        Arc::new(Image::new(key, params.clone(), true))
                    };
                    img.allocate()?;
                    img
                }
            };
            // The render-mapped sibling at full scale, when scale support
            // forces level-0 rendering.
            let fullscale: Arc<Image> = if render_full_scale && !use_image_as_output {
                let mut key0 = make_key(plane);
                key0.mip_level = 0;
                let mut p0 = params.clone();
                p0.bounds = rod.to_pixel_enclosing(0, par);
                let img = Arc::new(Image::new(key0, p0, false));
                img.allocate()?;
                img
            } else {
                output.clone()
            };
            plane_entries.push(PlaneEntry {
                plane: plane.clone(),
                fullscale,
                output,
            });
        }

        let has_work = !rects.is_empty();
        if !has_work && !being_rendered_elsewhere {
            if frame.aborted(node, node_hash) {
                return Err(SmaltError::Aborted);
            }
            return self.finish_planes(node, args, node_hash, plane_entries, &roi, par, output_mip, render_full_scale, use_image_as_output);
        }

        // 13. Tri-map registration for the whole dispatch.
        let use_trimap = frame.uses_trimap();
        if use_trimap {
            for e in &plane_entries {
                node.trimap().begin(&e.output);
            }
        }

        // 14. Sequence bracket: sequential writers are bracketed by the
        // scheduler at the range level instead.
        let sequential_writer = node.is_writer()
            && matches!(
                effect.sequential_preference(),
                crate::graph::effect::SequentialPreference::Only
            );
        let seq_args = crate::graph::effect::SequenceArgs {
            first: args.time,
            last: args.time,
            step: 1.0,
            interactive: frame.is_interactive,
            scale: scale_from_mip_level(mapped_mip),
            view: args.view,
        };
        if !sequential_writer {
            effect.begin_sequence(&seq_args)?;
        }

        // 15. Dispatch each planned rectangle across tiles.
        let mut failed: Option<SmaltError> = None;
        for (rect, (roi_map, input_images)) in rects.iter().zip(per_rect_inputs.into_iter()) {
            let mut ctx = RenderContext::new(args.time, args.view, mapped_mip, node_hash);
            ctx.rod = rod;
            ctx.roi_map = roi_map;
            ctx.frame_range = self.cached_time_domain(node);
            ctx.input_images = input_images;

            let outcome = tiles::dispatch(&DispatchArgs {
                eval: self,
                node,
                frame,
                ctx: &ctx,
                entries: &plane_entries,
                rect: *rect,
                rod: &rod,
                par,
                output_mip,
                use_trimap,
                render_full_scale,
                use_image_as_output,
                original_scale: scale_from_mip_level(args.mip_level),
                mapped_scale: scale_from_mip_level(mapped_mip),
                redirects,
            });
            match outcome {
                Ok(tiles::DispatchOutcome::Rendered) => {}
                Ok(tiles::DispatchOutcome::Elsewhere) => being_rendered_elsewhere = true,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if !sequential_writer {
            effect.end_sequence(&seq_args)?;
        }

        // 16. Tri-map release: wait for peers, surface failures, unwind
        // aborts.
        let aborted_now = frame.aborted(node, node_hash)
            || failed.as_ref().map(SmaltError::is_abort).unwrap_or(false);
        if use_trimap {
            for e in &plane_entries {
                if aborted_now {
                    // Abort never records failure; the incomplete image
                    // leaves the cache instead.
                    node.trimap().end(&e.output, false);
                    store.evict_instance(&e.output);
                } else if failed.is_some() || !being_rendered_elsewhere {
                    node.trimap().end(&e.output, failed.is_some());
                } else {
                    let nh = node_hash;
                    let res = node.trimap().wait_until_done_elsewhere(
                        &e.output,
                        &roi,
                        &|| frame.aborted(node, nh),
                    );
                    node.trimap().end(&e.output, false);
                    let rest = res?;
                    if !rest.is_empty() {
                        // The peer we waited on gave the cells back (it
                        // failed or unwound); this render fails too.
                        return Err(SmaltError::plugin(format!(
                            "'{}': peer thread did not complete the shared image",
                            node.name()
                        )));
                    }
                }
            }
        }
        if aborted_now {
            return Err(SmaltError::Aborted);
        }
        if let Some(e) = failed {
            return Err(e);
        }

        self.finish_planes(node, args, node_hash, plane_entries, &roi, par, output_mip, render_full_scale, use_image_as_output)
    }

    /// Final downscale / conversion and last-render bookkeeping.
    #[allow(clippy::too_many_arguments)]
    fn finish_planes(
        &self,
        node: &Arc<Node>,
        args: &RenderRegionArgs,
        node_hash: NodeHash,
        plane_entries: Vec<PlaneEntry>,
        roi: &PixelRect,
        par: f64,
        output_mip: u32,
        _render_full_scale: bool,
        _use_image_as_output: bool,
    ) -> SmaltResult<PlaneImages> {
        let mut out = PlaneImages::new();
        let requested_mip = args.mip_level;
        let canonical_roi = roi.to_canonical(output_mip, par);
        for e in &plane_entries {
            let mut img = e.output.clone();
            // Bring the result to the requested level: a full-scale render
            // (or a higher-resolution cache hit) is folded down into a
            // local, uncached image.
            if img.key().mip_level != requested_mip {
                let mut key = img.key().clone();
                key.mip_level = requested_mip;
                let bounds = canonical_roi.to_pixel_enclosing(requested_mip, par);
                let mut params = img.params().clone();
                params.bounds = bounds;
                let local = Arc::new(Image::new(key, params, false));
                local.allocate()?;
                img.downscale_into(&local, &bounds)?;
                img = local;
            }
            // Convert components/depth when the request differs from what
            // the cache held.
            if img.components() != e.plane.components || img.depth() != args.depth {
                let bounds = canonical_roi.to_pixel_enclosing(requested_mip, par);
                let mut params = img.params().clone();
                params.components = e.plane.components;
                params.depth = args.depth;
                params.bounds = bounds;
                let local = Arc::new(Image::new(img.key().clone(), params, false));
                local.allocate()?;
                let read = img.read_rect(&bounds)?;
                local.paste_scratch(&read, &bounds)?;
                img = local;
            }
            out.push(img);
        }

        if node.is_disk_cache()
            && let Some(disk) = self.project.disk_cache()
        {
            for e in &plane_entries {
                disk.save(&e.output)?;
            }
        }

        node.note_render(node_hash, &out.iter().cloned().collect::<Vec<_>>());
        Ok(out)
    }

    /// Step 10 helper: regions of interest (with concatenated transforms
    /// applied), frames needed, and the recursive pulls that satisfy them.
    #[allow(clippy::too_many_arguments)]
    fn render_inputs_for_rect(
        &self,
        node: &Arc<Node>,
        frame: &FrameState,
        args: &RenderRegionArgs,
        canonical_roi: &CanonicalRect,
        redirects: &RedirectMap,
        input_mip: u32,
        bypass: bool,
        frames_needed: &FramesNeeded,
        produced: &[Plane],
    ) -> SmaltResult<(crate::graph::effect::RoiMap, Vec<Arc<Image>>)> {
        let effect = node.effect();
        let mut roi_map =
            effect.regions_of_interest(args.time, args.view, args.mip_level, canonical_roi);
        for (idx, redirect) in redirects {
            if let Some(r) = roi_map.get_mut(idx) {
                *r = inverse_map_rect(&redirect.matrix, r);
            }
        }

        let mut images = Vec::new();
        for (input_idx, views) in frames_needed {
            let input_node = match redirects.get(input_idx) {
                Some(r) => r.target.clone(),
                None => match node.input(*input_idx) {
                    Some(n) => n,
                    None => continue,
                },
            };
            let Some(region) = roi_map.get(input_idx) else {
                continue;
            };
            if region.is_infinite() {
                return Err(SmaltError::invalid(format!(
                    "'{}' asks for an infinite region of input {input_idx}",
                    node.name()
                )));
            }
            if region.is_empty() {
                continue;
            }
            let input_par = input_node.effect().pixel_aspect_ratio();
            let pixel_roi = region.to_pixel_enclosing(input_mip, input_par);
            for (view, ranges) in views {
                for (first, last) in ranges {
                    let mut t = *first;
                    while t <= *last {
                        let mut sub = RenderRegionArgs::new(t, *view, produced.iter().cloned());
                        sub.mip_level = input_mip;
                        sub.roi = Some(pixel_roi);
                        sub.depth = args.depth;
                        sub.bypass_cache = bypass;
                        let mut rendered = self.render_region(&input_node, frame, &sub)?;
                        images.extend(rendered.drain(..));
                        t += 1.0;
                    }
                }
            }
        }
        Ok((roi_map, images))
    }

    fn revive_from_disk(&self, key: &ImageKey) -> SmaltResult<Option<Arc<Image>>> {
        let Some(disk) = self.project.disk_cache() else {
            return Ok(None);
        };
        let Some((params, pixels)) = disk.load(key)? else {
            return Ok(None);
        };
        let bounds = params.bounds;
        let (img, created) = self.project.store().get_or_create(key.clone(), params, true);
        if created {
            img.load_bytes(&pixels)?;
            img.mark_rendered(&bounds);
        }
        Ok(Some(img))
    }
}
