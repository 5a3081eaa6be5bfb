//! Disk-cache nodes: render-through persists, a cold store revives from
//! disk without re-running upstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use smalt::foundation::hash::StableHasher;
use smalt::graph::effect::{Effect, RenderActionArgs, RodArgs, UpstreamQuery};
use smalt::effects::DiskCacheNode;
use smalt::{
    CanonicalRect, Evaluator, FrameState, PixelRect, Plane, Project, RenderRegionArgs,
    ScratchPlane, Settings, SmaltResult,
};

struct CountingGradient {
    renders: Arc<AtomicUsize>,
}

impl Effect for CountingGradient {
    fn plugin_id(&self) -> &str {
        "test.counting-gradient"
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

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        for p in planes {
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    p.put(x, y, 0, y as f32 / 8.0);
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

fn cache_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("smalt_dct_{tag}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn disk_cache_node_persists_and_revives() {
    let dir = cache_dir("revive");
    let renders = Arc::new(AtomicUsize::new(0));

    let build = |renders: Arc<AtomicUsize>| -> (Arc<Project>, Arc<smalt::Node>) {
        let settings = Settings {
            cache_root: Some(dir.clone()),
            ..Settings::default()
        };
        let project = Project::new(settings).unwrap();
        let src = project.add_node("src", Arc::new(CountingGradient { renders }));
        let dc = project.add_node("cached", Arc::new(DiskCacheNode));
        project.connect(&dc, 0, &src).unwrap();
        project.refresh_hashes();
        (project, dc)
    };

    let roi = PixelRect::new(0, 0, 8, 8);
    let expected_bytes;
    {
        let (project, dc) = build(renders.clone());
        let eval = Evaluator::new(project.clone()).unwrap();
        let fs = FrameState::interactive(1.0, 0, dc.current_hash());
        let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_roi(roi);
        let planes = eval.render_region(&dc, &fs, &args).unwrap();
        expected_bytes = planes[0].snapshot_bytes();
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        // An entry landed on disk.
        assert!(
            std::fs::read_dir(&dir)
                .unwrap()
                .filter_map(Result::ok)
                .any(|e| e.path().extension().is_some_and(|x| x == "smimg"))
        );
    }

    // A fresh project (cold memory store) revives the plane from disk and
    // never calls the upstream render again.
    {
        let (project, dc) = build(renders.clone());
        let eval = Evaluator::new(project.clone()).unwrap();
        let fs = FrameState::interactive(1.0, 0, dc.current_hash());
        let args = RenderRegionArgs::new(1.0, 0, [Plane::rgba()]).with_roi(roi);
        let planes = eval.render_region(&dc, &fs, &args).unwrap();
        assert_eq!(planes[0].snapshot_bytes(), expected_bytes);
        assert_eq!(renders.load(Ordering::SeqCst), 1, "no re-render after revival");
    }

    let _ = std::fs::remove_dir_all(&dir);
}
