//! Mipmap requests against effects with and without render-scale support.

use std::sync::Arc;

use smalt::foundation::hash::StableHasher;
use smalt::graph::effect::{
    Effect, RenderActionArgs, RenderScaleSupport, RodArgs, UpstreamQuery,
};
use smalt::{
    CanonicalRect, Evaluator, FrameState, PixelRect, Plane, Project, RenderRegionArgs,
    ScratchPlane, Settings, SmaltResult,
};

/// Horizontal gradient generator that refuses to render at reduced scale.
struct FullScaleGradient;

impl Effect for FullScaleGradient {
    fn plugin_id(&self) -> &str {
        "test.full-scale-gradient"
    }

    fn fold_params(&self, _h: &mut StableHasher) {}

    fn input_count(&self) -> usize {
        0
    }

    fn region_of_definition(
        &self,
        _args: &RodArgs,
        _up: &dyn UpstreamQuery,
    ) -> SmaltResult<CanonicalRect> {
        Ok(CanonicalRect::new(0.0, 0.0, 16.0, 16.0))
    }

    fn supports_render_scale(&self) -> RenderScaleSupport {
        RenderScaleSupport::No
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        // An effect without render-scale support must only ever see scale 1.
        assert_eq!(args.mapped_scale, 1.0);
        for p in planes {
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    p.put(x, y, 0, x as f32 / 16.0);
                    p.put(x, y, 3, 1.0);
                }
            }
        }
        Ok(())
    }

    fn is_frame_varying(&self) -> bool {
        false
    }
}

#[test]
fn unsupported_render_scale_falls_back_to_full_scale_and_downscales() {
    let project = Project::new(Settings::default()).unwrap();
    let node = project.add_node("gradient", Arc::new(FullScaleGradient));
    project.refresh_hashes();
    let eval = Evaluator::new(project.clone()).unwrap();

    let fs = FrameState::interactive(1.0, 0, node.current_hash());
    let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_mip_level(1);
    let planes = eval.render_region(&node, &fs, &args).unwrap();
    let img = &planes[0];

    // Output arrives at the requested level.
    assert_eq!(img.key().mip_level, 1);
    let bounds = img.bounds();
    assert_eq!((bounds.width(), bounds.height()), (8, 8));

    // Each level-1 pixel is the box average of a 2x2 full-scale block.
    let read = img.read_rect(&PixelRect::new(0, 0, 8, 8)).unwrap();
    let expected = |x: i64| ((2 * x) as f32 / 16.0 + (2 * x + 1) as f32 / 16.0) / 2.0;
    assert!((read.get(0, 0, 0) - expected(0)).abs() < 1e-6);
    assert!((read.get(5, 3, 0) - expected(5)).abs() < 1e-6);
    assert_eq!(read.get(7, 7, 3), 1.0);
}

#[test]
fn supported_render_scale_renders_directly_at_the_level() {
    let project = Project::new(Settings::default()).unwrap();
    let node = project.add_node(
        "bg",
        Arc::new(smalt::effects::SolidColor::opaque([0.5; 4], 16.0, 16.0)),
    );
    project.refresh_hashes();
    let eval = Evaluator::new(project.clone()).unwrap();

    let fs = FrameState::interactive(1.0, 0, node.current_hash());
    let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_mip_level(2);
    let planes = eval.render_region(&node, &fs, &args).unwrap();
    let img = &planes[0];
    assert_eq!(img.key().mip_level, 2);
    assert_eq!((img.bounds().width(), img.bounds().height()), (4, 4));
    let read = img.read_rect(&PixelRect::new(0, 0, 4, 4)).unwrap();
    assert_eq!(read.get(2, 2, 1), 0.5);
}

#[test]
fn higher_resolution_cache_hit_serves_a_lower_resolution_request() {
    let project = Project::new(Settings::default()).unwrap();
    let node = project.add_node(
        "bg",
        Arc::new(smalt::effects::SolidColor::opaque([0.25, 0.5, 0.75, 1.0], 16.0, 16.0)),
    );
    project.refresh_hashes();
    let eval = Evaluator::new(project.clone()).unwrap();

    // Prime the cache at full resolution.
    let fs = FrameState::interactive(1.0, 0, node.current_hash());
    let full = eval
        .render_region(&node, &fs, &RenderRegionArgs::new(1.0, 0, [Plane::rgba()]))
        .unwrap();
    assert_eq!(full[0].key().mip_level, 0);
    let store_len = project.store().len();

    // A level-1 request downsamples the cached level-0 image instead of
    // invoking the effect again.
    let fs = FrameState::interactive(1.0, 0, node.current_hash());
    let half = eval
        .render_region(
            &node,
            &fs,
            &RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_mip_level(1),
        )
        .unwrap();
    assert_eq!(half[0].key().mip_level, 1);
    assert_eq!((half[0].bounds().width(), half[0].bounds().height()), (8, 8));
    let read = half[0].read_rect(&PixelRect::new(0, 0, 8, 8)).unwrap();
    assert_eq!(read.get(4, 4, 2), 0.75);
    // No new cached entry appeared for the downscale.
    assert_eq!(project.store().len(), store_len);
}
