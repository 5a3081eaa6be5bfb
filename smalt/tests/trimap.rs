//! Two threads racing on overlapping rectangles of the same image: the
//! overlap renders exactly once, the loser waits and reads fresh pixels.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use smalt::foundation::hash::StableHasher;
use smalt::graph::effect::{Effect, RenderActionArgs, RenderSafety, RodArgs, UpstreamQuery};
use smalt::{
    CanonicalRect, Evaluator, FrameState, PixelRect, Plane, Project, RenderRegionArgs,
    ScratchPlane, Settings, SmaltResult, TileState,
};

/// Fills a constant color, counting the pixel area actually rendered and
/// dwelling long enough for peers to observe the `rendering` cells.
struct CountingSolid {
    area: Arc<AtomicI64>,
    rects: Arc<Mutex<Vec<PixelRect>>>,
    dwell: Duration,
}

impl Effect for CountingSolid {
    fn plugin_id(&self) -> &str {
        "test.counting-solid"
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
        Ok(CanonicalRect::new(0.0, 0.0, 64.0, 64.0))
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        self.area.fetch_add(args.rect.area(), Ordering::SeqCst);
        self.rects.lock().unwrap().push(args.rect);
        std::thread::sleep(self.dwell);
        for p in planes {
            p.fill(&[0.25, 0.5, 0.75, 1.0]);
        }
        Ok(())
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::FullySafe
    }

    fn is_frame_varying(&self) -> bool {
        false
    }
}

#[test]
fn overlapping_requests_render_the_overlap_once() {
    let area = Arc::new(AtomicI64::new(0));
    let rects = Arc::new(Mutex::new(Vec::new()));
    let project = Project::new(Settings::default()).unwrap();
    let node = project.add_node(
        "counting",
        Arc::new(CountingSolid {
            area: area.clone(),
            rects: rects.clone(),
            dwell: Duration::from_millis(80),
        }),
    );
    project.refresh_hashes();
    let eval = Arc::new(Evaluator::new(project.clone()).unwrap());

    let rect_a = PixelRect::new(0, 0, 64, 48);
    let rect_b = PixelRect::new(0, 16, 64, 64);

    let (eval_a, node_a) = (eval.clone(), node.clone());
    let thread_a = std::thread::spawn(move || {
        let fs = FrameState::interactive(1.0, 0, node_a.current_hash());
        let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_roi(rect_a);
        eval_a.render_region(&node_a, &fs, &args).unwrap()
    });
    // Give A time to claim its cells before B plans.
    std::thread::sleep(Duration::from_millis(25));
    let (eval_b, node_b) = (eval.clone(), node.clone());
    let thread_b = std::thread::spawn(move || {
        let fs = FrameState::interactive(1.0, 0, node_b.current_hash());
        let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_roi(rect_b);
        eval_b.render_region(&node_b, &fs, &args).unwrap()
    });

    let planes_a = thread_a.join().unwrap();
    let planes_b = thread_b.join().unwrap();

    // The union covers 64x64; the overlap (rows 16..48) rendered once, so
    // the total rendered area equals the union, not the sum.
    assert_eq!(area.load(Ordering::SeqCst), 64 * 64);
    let all_rects = rects.lock().unwrap().clone();
    assert!(all_rects.len() >= 2, "both threads rendered something");

    // Both callers observe fully rendered pixels over their rectangles.
    for (planes, roi) in [(&planes_a, rect_a), (&planes_b, rect_b)] {
        let img = &planes[0];
        assert!(img.rest_to_render(&roi).is_empty());
        let read = img.read_rect(&roi).unwrap();
        assert_eq!(read.get(roi.x1, roi.y1, 0), 0.25);
        assert_eq!(read.get(roi.x2 - 1, roi.y2 - 1, 2), 0.75);
    }

    // Same image instance underneath, with a settled bitmap and no
    // outstanding tri-map participants.
    assert_eq!(planes_a[0].serial(), planes_b[0].serial());
    let img = &planes_a[0];
    assert_eq!(img.count_cells(TileState::Rendering), 0);
    assert_eq!(node.trimap().ref_count(img), 0);
}

#[test]
fn failure_poisons_waiters_instead_of_spinning() {
    use smalt::SmaltError;

    struct FailingSolid {
        dwell: Duration,
    }

    impl Effect for FailingSolid {
        fn plugin_id(&self) -> &str {
            "test.failing-solid"
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
            Ok(CanonicalRect::new(0.0, 0.0, 32.0, 32.0))
        }

        fn render(
            &self,
            _args: &RenderActionArgs<'_>,
            _planes: &mut [ScratchPlane],
        ) -> SmaltResult<()> {
            std::thread::sleep(self.dwell);
            Err(SmaltError::plugin("wired to fail"))
        }

        fn safety(&self) -> RenderSafety {
            RenderSafety::FullySafe
        }

        fn is_frame_varying(&self) -> bool {
            false
        }
    }

    let project = Project::new(Settings::default()).unwrap();
    let node = project.add_node(
        "failing",
        Arc::new(FailingSolid {
            dwell: Duration::from_millis(60),
        }),
    );
    project.refresh_hashes();
    let eval = Arc::new(Evaluator::new(project.clone()).unwrap());

    let rect = PixelRect::new(0, 0, 32, 32);
    let (eval_a, node_a) = (eval.clone(), node.clone());
    let a = std::thread::spawn(move || {
        let fs = FrameState::interactive(1.0, 0, node_a.current_hash());
        let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_roi(rect);
        eval_a.render_region(&node_a, &fs, &args)
    });
    std::thread::sleep(Duration::from_millis(20));
    let (eval_b, node_b) = (eval.clone(), node.clone());
    let b = std::thread::spawn(move || {
        let fs = FrameState::interactive(1.0, 0, node_b.current_hash());
        let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_roi(rect);
        eval_b.render_region(&node_b, &fs, &args)
    });

    // Both observe a failure; the waiter exits rather than spinning on the
    // peer's cells.
    assert!(a.join().unwrap().is_err());
    assert!(b.join().unwrap().is_err());
}
