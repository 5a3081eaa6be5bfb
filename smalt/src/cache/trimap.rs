//! Cross-thread coordination over in-flight tile rectangles.
//!
//! One entry per image being rendered, holding a refcount of active
//! renderers/waiters, a per-image condition variable and the render-failed
//! flag. The entry is dropped when the last participant leaves, which also
//! resets the failure flag for the next render age. The store lock is never
//! involved here; waiters hold only the per-image lock.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cache::image::Image;
use crate::foundation::error::{SmaltError, SmaltResult};
use crate::foundation::geom::PixelRect;

struct IbrState {
    ref_count: usize,
    render_failed: bool,
}

struct Ibr {
    state: Mutex<IbrState>,
    cond: Condvar,
}

/// Per-node coordinator of images being rendered.
#[derive(Default)]
pub struct TriMap {
    inner: Mutex<HashMap<u64, Arc<Ibr>>>,
}

impl TriMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, image: &Image) -> Arc<Ibr> {
        let mut inner = self.inner.lock().expect("trimap lock");
        inner
            .entry(image.serial())
            .or_insert_with(|| {
                Arc::new(Ibr {
                    state: Mutex::new(IbrState {
                        ref_count: 0,
                        render_failed: false,
                    }),
                    cond: Condvar::new(),
                })
            })
            .clone()
    }

    fn existing(&self, image: &Image) -> Option<Arc<Ibr>> {
        self.inner
            .lock()
            .expect("trimap lock")
            .get(&image.serial())
            .cloned()
    }

    fn release(&self, image: &Image, ibr: &Arc<Ibr>) {
        let remove = {
            let st = ibr.state.lock().expect("ibr lock");
            st.ref_count == 0
        };
        if remove {
            let mut inner = self.inner.lock().expect("trimap lock");
            if let Some(cur) = inner.get(&image.serial()) {
                let still_zero = cur.state.lock().expect("ibr lock").ref_count == 0;
                if still_zero {
                    inner.remove(&image.serial());
                }
            }
        }
    }

    /// Register this thread as rendering `image` without touching cells
    /// (coarse bracket around a dispatch).
    pub fn begin(&self, image: &Image) {
        if !image.uses_bitmap() {
            return;
        }
        let ibr = self.entry(image);
        ibr.state.lock().expect("ibr lock").ref_count += 1;
    }

    /// Close a [`TriMap::begin`] bracket. A failed close records the
    /// failure so waiters exit instead of spinning.
    pub fn end(&self, image: &Image, failed: bool) {
        if !image.uses_bitmap() {
            return;
        }
        let Some(ibr) = self.existing(image) else {
            return;
        };
        {
            let mut st = ibr.state.lock().expect("ibr lock");
            if failed {
                st.render_failed = true;
            }
            st.ref_count = st.ref_count.saturating_sub(1);
            ibr.cond.notify_all();
        }
        self.release(image, &ibr);
    }

    /// Claim `rect` for this thread: covered `unrendered` cells become
    /// `rendering` and the refcount grows by one.
    pub fn mark_rendering(&self, image: &Image, rect: &PixelRect) {
        if !image.uses_bitmap() {
            return;
        }
        image.mark_for_rendering(rect);
        let ibr = self.entry(image);
        ibr.state.lock().expect("ibr lock").ref_count += 1;
    }

    /// Publish `rect`: cells become `rendered`, waiters wake.
    pub fn mark_rendered(&self, image: &Image, rect: &PixelRect) {
        if !image.uses_bitmap() {
            return;
        }
        image.mark_rendered(rect);
        if let Some(ibr) = self.existing(image) {
            {
                let mut st = ibr.state.lock().expect("ibr lock");
                st.ref_count = st.ref_count.saturating_sub(1);
                ibr.cond.notify_all();
            }
            self.release(image, &ibr);
        }
    }

    /// Give `rect` back after a failure or abort: `rendering` cells revert
    /// to `unrendered`, waiters wake. `failed` additionally poisons the
    /// entry for the rest of this render age.
    pub fn clear(&self, image: &Image, rect: &PixelRect, failed: bool) {
        if !image.uses_bitmap() {
            return;
        }
        image.clear_bitmap(rect);
        if let Some(ibr) = self.existing(image) {
            {
                let mut st = ibr.state.lock().expect("ibr lock");
                if failed {
                    st.render_failed = true;
                }
                st.ref_count = st.ref_count.saturating_sub(1);
                ibr.cond.notify_all();
            }
            self.release(image, &ibr);
        }
    }

    /// True when a failure was recorded for the current render of `image`.
    pub fn render_failed(&self, image: &Image) -> bool {
        self.existing(image)
            .map(|ibr| ibr.state.lock().expect("ibr lock").render_failed)
            .unwrap_or(false)
    }

    /// Outstanding participants on `image`, for invariant checks.
    pub fn ref_count(&self, image: &Image) -> usize {
        self.existing(image)
            .map(|ibr| ibr.state.lock().expect("ibr lock").ref_count)
            .unwrap_or(0)
    }

    /// Sleep while a peer renders inside `rect`, then report what is still
    /// unrendered. Returns `Err(Aborted)` when `aborted()` turns true, and
    /// the remaining rectangles when the peer finished, failed or cleared.
    ///
    /// Waiters are woken by peers; the timeout only bounds abort latency
    /// when no peer makes progress.
    pub fn wait_until_done_elsewhere(
        &self,
        image: &Image,
        rect: &PixelRect,
        aborted: &dyn Fn() -> bool,
    ) -> SmaltResult<Vec<PixelRect>> {
        if !image.uses_bitmap() {
            return Ok(Vec::new());
        }
        let ibr = self.entry(image);
        {
            let mut st = ibr.state.lock().expect("ibr lock");
            st.ref_count += 1;
        }

        let result = loop {
            let (rest, elsewhere) = image.rest_to_render_trimap(rect);
            if aborted() {
                break Err(SmaltError::Aborted);
            }
            let failed = {
                let st = ibr.state.lock().expect("ibr lock");
                st.render_failed
            };
            if !elsewhere || failed {
                break Ok(rest);
            }
            let st = ibr.state.lock().expect("ibr lock");
            let (_st, _timeout) = ibr
                .cond
                .wait_timeout(st, Duration::from_millis(50))
                .expect("ibr lock");
        };

        {
            let mut st = ibr.state.lock().expect("ibr lock");
            st.ref_count = st.ref_count.saturating_sub(1);
            ibr.cond.notify_all();
        }
        self.release(image, &ibr);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::image::{ImageKey, ImageParams};
    use crate::foundation::geom::CanonicalRect;
    use crate::foundation::hash::NodeHash;
    use crate::graph::effect::FramesNeeded;
    use crate::graph::plane::{BitDepth, Components, PlaneLayer};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn image() -> Arc<Image> {
        let bounds = PixelRect::new(0, 0, 8, 8);
        let img = Image::new(
            ImageKey {
                node_hash: NodeHash(1),
                layer: PlaneLayer::Color,
                time: 0.0,
                view: 0,
                mip_level: 0,
                frame_varying: true,
            },
            ImageParams {
                rod: CanonicalRect::new(0.0, 0.0, 8.0, 8.0),
                bounds,
                components: Components::Rgba,
                depth: BitDepth::F32,
                par: 1.0,
                rod_is_project_format: false,
                frames_needed: FramesNeeded::default(),
            },
            true,
        );
        img.allocate().unwrap();
        Arc::new(img)
    }

    #[test]
    fn refcount_matches_outstanding_marks() {
        let tm = TriMap::new();
        let img = image();
        let rect = PixelRect::new(0, 0, 4, 4);
        tm.mark_rendering(&img, &rect);
        assert_eq!(tm.ref_count(&img), 1);
        tm.mark_rendering(&img, &PixelRect::new(4, 0, 8, 4));
        assert_eq!(tm.ref_count(&img), 2);
        tm.mark_rendered(&img, &rect);
        assert_eq!(tm.ref_count(&img), 1);
        tm.clear(&img, &PixelRect::new(4, 0, 8, 4), false);
        assert_eq!(tm.ref_count(&img), 0);
    }

    #[test]
    fn failure_flag_is_scoped_to_the_entry() {
        let tm = TriMap::new();
        let img = image();
        let rect = PixelRect::new(0, 0, 8, 8);
        tm.begin(&img);
        tm.mark_rendering(&img, &rect);
        tm.clear(&img, &rect, true);
        assert!(tm.render_failed(&img));
        tm.end(&img, false);
        // Entry is gone; a fresh render sees a clean flag.
        assert!(!tm.render_failed(&img));
    }

    #[test]
    fn waiter_sees_peer_completion() {
        let tm = Arc::new(TriMap::new());
        let img = image();
        let rect = PixelRect::new(0, 0, 8, 8);
        tm.mark_rendering(&img, &rect);

        let tm2 = tm.clone();
        let img2 = img.clone();
        let waiter = std::thread::spawn(move || {
            tm2.wait_until_done_elsewhere(&img2, &rect, &|| false)
                .unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        tm.mark_rendered(&img, &rect);
        let rest = waiter.join().unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn waiter_observes_abort() {
        let tm = Arc::new(TriMap::new());
        let img = image();
        let rect = PixelRect::new(0, 0, 8, 8);
        tm.mark_rendering(&img, &rect);

        let aborted = Arc::new(AtomicBool::new(false));
        let (tm2, img2, ab) = (tm.clone(), img.clone(), aborted.clone());
        let waiter = std::thread::spawn(move || {
            tm2.wait_until_done_elsewhere(&img2, &rect, &|| ab.load(Ordering::SeqCst))
        });
        std::thread::sleep(Duration::from_millis(20));
        aborted.store(true, Ordering::SeqCst);
        let res = waiter.join().unwrap();
        assert!(matches!(res, Err(SmaltError::Aborted)));
        tm.clear(&img, &rect, false);
        assert_eq!(tm.ref_count(&img), 0);
    }
}
