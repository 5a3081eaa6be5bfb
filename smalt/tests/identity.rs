//! Identity short-circuits: to an input, to self at another time, and the
//! guards around them.

use std::sync::Arc;

use smalt::effects::{FrameHold, SolidColor, TimeOffset};
use smalt::foundation::hash::StableHasher;
use smalt::graph::effect::{Effect, Identity, RenderActionArgs, RodArgs, UpstreamQuery};
use smalt::{
    CanonicalRect, Evaluator, FrameState, Node, Plane, Project, RenderRegionArgs, ScratchPlane,
    Settings, SmaltError, SmaltResult,
};

fn fixture() -> (Arc<Project>, Evaluator) {
    let project = Project::new(Settings::default()).unwrap();
    let eval = Evaluator::new(project.clone()).unwrap();
    (project, eval)
}

fn render_color(
    eval: &Evaluator,
    node: &Arc<Node>,
    time: f64,
) -> smalt::PlaneImages {
    node.refresh_hash();
    let fs = FrameState::interactive(time, 0, node.current_hash());
    let args = RenderRegionArgs::new(time, 0, [Plane::rgba()]);
    eval.render_region(node, &fs, &args).unwrap()
}

#[test]
fn identity_to_input_returns_the_inputs_image() {
    let (project, eval) = fixture();
    let bg = project.add_node(
        "bg",
        Arc::new(SolidColor::animated([0.1, 0.2, 0.3, 1.0], 16.0, 16.0, 0.05)),
    );
    let offset = project.add_node("offset", Arc::new(TimeOffset::new(2.0)));
    project.connect(&offset, 0, &bg).unwrap();
    project.refresh_hashes();

    let planes = render_color(&eval, &offset, 5.0);
    assert_eq!(planes.len(), 1);
    let img = &planes[0];

    // The image is keyed to the input node, at the offset time; the offset
    // node itself never rendered and owns nothing in the store.
    assert_eq!(img.key().node_hash, bg.current_hash());
    assert_eq!(img.key().time, 7.0);
    let offset_key = smalt::ImageKey {
        node_hash: offset.current_hash(),
        layer: smalt::PlaneLayer::Color,
        time: 5.0,
        view: 0,
        mip_level: 0,
        frame_varying: true,
    };
    assert!(project.store().get(&offset_key).is_none());

    // Bit-equal to rendering the input directly at the mapped time.
    let direct = render_color(&eval, &bg, 7.0);
    assert_eq!(img.snapshot_bytes(), direct[0].snapshot_bytes());
}

#[test]
fn identity_on_self_resolves_through_one_reentry() {
    let (project, eval) = fixture();
    let bg = project.add_node(
        "bg",
        Arc::new(SolidColor::animated([0.1, 0.2, 0.3, 1.0], 16.0, 16.0, 0.05)),
    );
    let hold = project.add_node("hold", Arc::new(FrameHold::new(1.0)));
    project.connect(&hold, 0, &bg).unwrap();
    project.refresh_hashes();

    let held = render_color(&eval, &hold, 9.0);
    let direct = render_color(&eval, &bg, 1.0);
    assert_eq!(held[0].snapshot_bytes(), direct[0].snapshot_bytes());
}

struct SelfSameTime;

impl Effect for SelfSameTime {
    fn plugin_id(&self) -> &str {
        "test.self-same-time"
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
        Ok(CanonicalRect::new(0.0, 0.0, 8.0, 8.0))
    }

    fn is_identity(
        &self,
        time: f64,
        _view: i32,
        _mip: u32,
        _rod: &CanonicalRect,
    ) -> Identity {
        Identity::SelfAtTime { time }
    }

    fn render(
        &self,
        _args: &RenderActionArgs<'_>,
        _planes: &mut [ScratchPlane],
    ) -> SmaltResult<()> {
        unreachable!("identity never renders")
    }
}

#[test]
fn identity_on_self_at_the_same_time_fails() {
    let (project, eval) = fixture();
    let node = project.add_node("bad", Arc::new(SelfSameTime));
    project.refresh_hashes();

    let fs = FrameState::interactive(3.0, 0, node.current_hash());
    let args = RenderRegionArgs::new(3.0, 0, [Plane::rgba()]);
    let err = eval.render_region(&node, &fs, &args).unwrap_err();
    assert!(matches!(err, SmaltError::PluginFailure(_)), "{err}");
}

struct SelfRetimeChain;

impl Effect for SelfRetimeChain {
    fn plugin_id(&self) -> &str {
        "test.self-retime-chain"
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
        Ok(CanonicalRect::new(0.0, 0.0, 8.0, 8.0))
    }

    fn is_identity(
        &self,
        time: f64,
        _view: i32,
        _mip: u32,
        _rod: &CanonicalRect,
    ) -> Identity {
        // Always points one frame back: a chain that never terminates.
        Identity::SelfAtTime { time: time - 1.0 }
    }

    fn render(
        &self,
        _args: &RenderActionArgs<'_>,
        _planes: &mut [ScratchPlane],
    ) -> SmaltResult<()> {
        unreachable!("identity never renders")
    }
}

#[test]
fn chained_self_retime_is_refused_after_one_hop() {
    let (project, eval) = fixture();
    let node = project.add_node("chain", Arc::new(SelfRetimeChain));
    project.refresh_hashes();

    let fs = FrameState::interactive(5.0, 0, node.current_hash());
    let args = RenderRegionArgs::new(5.0, 0, [Plane::rgba()]);
    let err = eval.render_region(&node, &fs, &args).unwrap_err();
    assert!(matches!(err, SmaltError::InternalInvariant(_)), "{err}");
}

#[test]
fn identity_to_a_disconnected_input_is_missing_upstream() {
    let (project, eval) = fixture();
    let offset = project.add_node("offset", Arc::new(TimeOffset::new(1.0)));
    project.refresh_hashes();

    let fs = FrameState::interactive(1.0, 0, offset.current_hash());
    let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]);
    let err = eval.render_region(&offset, &fs, &args).unwrap_err();
    assert!(matches!(err, SmaltError::MissingUpstream { input: 0, .. }), "{err}");
}

#[test]
fn empty_requested_rectangle_is_a_no_op() {
    let (project, eval) = fixture();
    let bg = project.add_node("bg", Arc::new(SolidColor::opaque([0.5; 4], 16.0, 16.0)));
    project.refresh_hashes();

    let fs = FrameState::interactive(1.0, 0, bg.current_hash());
    let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()])
        .with_roi(smalt::PixelRect::new(50, 50, 50, 50));
    let planes = eval.render_region(&bg, &fs, &args).unwrap();
    assert!(planes.is_empty());
    assert_eq!(project.store().len(), 0);
}
