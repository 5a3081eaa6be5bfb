//! Bounded, ordered frame buffer between producers and the consumer.
//!
//! Entries are unique by (frame, view). The consumer pops exactly the frame
//! it expects next; producers park on the capacity condition when the
//! consumer lags. Neither side ever holds the buffer lock while delivering
//! or rendering.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use smallvec::SmallVec;

use crate::cache::image::Image;

struct BufInner {
    frames: BTreeMap<i64, SmallVec<[(i32, Arc<Image>); 1]>>,
    open: bool,
}

pub(crate) struct FrameBuffer {
    inner: Mutex<BufInner>,
    /// Signaled when a frame arrives or the buffer closes.
    arrived: Condvar,
    /// Signaled when space frees up.
    drained: Condvar,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufInner {
                frames: BTreeMap::new(),
                open: true,
            }),
            arrived: Condvar::new(),
            drained: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock").frames.len()
    }

    /// Re-open for a new run, dropping leftovers.
    pub fn reset(&self) {
        let mut b = self.inner.lock().expect("buffer lock");
        b.frames.clear();
        b.open = true;
    }

    /// Close the buffer: pending and future pushes are dropped, all waiters
    /// wake.
    pub fn close(&self) {
        let mut b = self.inner.lock().expect("buffer lock");
        b.open = false;
        b.frames.clear();
        self.arrived.notify_all();
        self.drained.notify_all();
    }

    /// Insert a frame, replacing an entry with the same (frame, view).
    /// Returns false when the buffer is closed and the frame was dropped.
    pub fn push(&self, frame: i64, view: i32, image: Arc<Image>) -> bool {
        let mut b = self.inner.lock().expect("buffer lock");
        if !b.open {
            return false;
        }
        let slot = b.frames.entry(frame).or_default();
        match slot.iter_mut().find(|(v, _)| *v == view) {
            Some(e) => e.1 = image,
            None => slot.push((view, image)),
        }
        self.arrived.notify_all();
        true
    }

    /// Park a producer until there is room, the buffer closes, or
    /// `should_stop` answers true. Returns whether the producer may go on.
    pub fn wait_for_room(&self, should_stop: &dyn Fn() -> bool) -> bool {
        let mut b = self.inner.lock().expect("buffer lock");
        loop {
            if !b.open || should_stop() {
                return false;
            }
            if b.frames.len() < self.capacity {
                return true;
            }
            let (guard, _) = self
                .drained
                .wait_timeout(b, Duration::from_millis(50))
                .expect("buffer lock");
            b = guard;
        }
    }

    /// Block until the expected frame is buffered; pop and return its
    /// views. `None` once the buffer closes or `should_stop` answers true.
    pub fn pop_expected(
        &self,
        frame: i64,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<SmallVec<[(i32, Arc<Image>); 1]>> {
        let mut b = self.inner.lock().expect("buffer lock");
        loop {
            if !b.open || should_stop() {
                return None;
            }
            if let Some(views) = b.frames.remove(&frame) {
                self.drained.notify_all();
                return Some(views);
            }
            let (guard, _) = self
                .arrived
                .wait_timeout(b, Duration::from_millis(50))
                .expect("buffer lock");
            b = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::image::{ImageKey, ImageParams};
    use crate::foundation::geom::{CanonicalRect, PixelRect};
    use crate::foundation::hash::NodeHash;
    use crate::graph::effect::FramesNeeded;
    use crate::graph::plane::{BitDepth, Components, PlaneLayer};

    fn img() -> Arc<Image> {
        Arc::new(Image::new(
            ImageKey {
                node_hash: NodeHash(1),
                layer: PlaneLayer::Color,
                time: 0.0,
                view: 0,
                mip_level: 0,
                frame_varying: true,
            },
            ImageParams {
                rod: CanonicalRect::new(0.0, 0.0, 1.0, 1.0),
                bounds: PixelRect::new(0, 0, 1, 1),
                components: Components::Rgba,
                depth: BitDepth::F32,
                par: 1.0,
                rod_is_project_format: false,
                frames_needed: FramesNeeded::default(),
            },
            false,
        ))
    }

    #[test]
    fn pop_returns_only_the_expected_frame() {
        let buf = FrameBuffer::new(8);
        buf.push(3, 0, img());
        buf.push(1, 0, img());

        let got = buf.pop_expected(1, &|| false).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn push_is_unique_by_frame_and_view() {
        let buf = FrameBuffer::new(8);
        buf.push(1, 0, img());
        buf.push(1, 0, img());
        buf.push(1, 1, img());
        let got = buf.pop_expected(1, &|| false).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn producers_park_at_capacity_and_resume() {
        let buf = Arc::new(FrameBuffer::new(1));
        buf.push(1, 0, img());
        assert_eq!(buf.len(), 1);

        let b2 = buf.clone();
        let t = std::thread::spawn(move || {
            let ok = b2.wait_for_room(&|| false);
            assert!(ok);
            b2.push(2, 0, img());
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(buf.len(), 1);
        buf.pop_expected(1, &|| false).unwrap();
        t.join().unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn close_wakes_and_drops() {
        let buf = Arc::new(FrameBuffer::new(2));
        buf.push(1, 0, img());
        let b2 = buf.clone();
        let t = std::thread::spawn(move || b2.pop_expected(99, &|| false));
        std::thread::sleep(Duration::from_millis(10));
        buf.close();
        assert!(t.join().unwrap().is_none());
        assert!(!buf.push(5, 0, img()));
    }
}
