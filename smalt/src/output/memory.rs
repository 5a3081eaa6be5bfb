//! In-memory output device for tests and debugging.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::image::Image;
use crate::foundation::error::SmaltResult;
use crate::output::device::{OutputDevice, RenderDirection, StopCode};

/// Everything an output device can observe, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    Started,
    Stopped(StopCode),
    Delivered { frame: i64, view: i32 },
    FrameRendered(i64),
    Failure(String),
    Fps { actual: f64, desired: f64 },
}

/// Records deliveries and lifecycle events; optionally slows delivery down
/// to exercise backpressure.
#[derive(Default)]
pub struct MemoryOutput {
    events: Mutex<Vec<DeviceEvent>>,
    delivered: Mutex<Vec<(i64, i32, Arc<Image>)>>,
    timeline: AtomicI64,
    range: Option<(i64, i64)>,
    delivery_delay: Option<std::time::Duration>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, first: i64, last: i64) -> Self {
        self.range = Some((first, last));
        self
    }

    pub fn with_delivery_delay(mut self, delay: std::time::Duration) -> Self {
        self.delivery_delay = Some(delay);
        self
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn delivered(&self) -> Vec<(i64, i32)> {
        self.delivered
            .lock()
            .expect("delivered lock")
            .iter()
            .map(|(f, v, _)| (*f, *v))
            .collect()
    }

    pub fn delivered_images(&self) -> Vec<(i64, Arc<Image>)> {
        self.delivered
            .lock()
            .expect("delivered lock")
            .iter()
            .map(|(f, _, img)| (*f, img.clone()))
            .collect()
    }

    pub fn stop_codes(&self) -> Vec<StopCode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::Stopped(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::Failure(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn push(&self, e: DeviceEvent) {
        self.events.lock().expect("events lock").push(e);
    }
}

impl OutputDevice for MemoryOutput {
    fn deliver(&self, frame: i64, view: i32, image: &Arc<Image>) -> SmaltResult<()> {
        if let Some(d) = self.delivery_delay {
            std::thread::sleep(d);
        }
        self.push(DeviceEvent::Delivered { frame, view });
        self.delivered
            .lock()
            .expect("delivered lock")
            .push((frame, view, image.clone()));
        Ok(())
    }

    fn timeline_step(&self, direction: RenderDirection) {
        let delta = match direction {
            RenderDirection::Forward => 1,
            RenderDirection::Backward => -1,
        };
        self.timeline.fetch_add(delta, Ordering::SeqCst);
    }

    fn timeline_goto(&self, frame: i64) {
        self.timeline.store(frame, Ordering::SeqCst);
    }

    fn timeline_get_time(&self) -> i64 {
        self.timeline.load(Ordering::SeqCst)
    }

    fn frame_range_to_render(&self) -> Option<(i64, i64)> {
        self.range
    }

    fn on_render_started(&self) {
        self.push(DeviceEvent::Started);
    }

    fn on_render_stopped(&self, code: StopCode) {
        self.push(DeviceEvent::Stopped(code));
    }

    fn report_fps(&self, actual: f64, desired: f64) {
        self.push(DeviceEvent::Fps { actual, desired });
    }

    fn report_frame_rendered(&self, frame: i64) {
        self.push(DeviceEvent::FrameRendered(frame));
    }

    fn report_failure(&self, message: &str) {
        self.push(DeviceEvent::Failure(message.to_owned()));
    }
}
