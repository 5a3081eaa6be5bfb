//! The output-device seam: everything the scheduler may ask of a viewer or
//! writer.

use std::sync::Arc;
use std::sync::mpsc;

use crate::cache::image::Image;
use crate::foundation::error::{SmaltError, SmaltResult};

/// Direction of a frame-range render.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderDirection {
    Forward,
    Backward,
}

/// Why a render run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCode {
    Finished,
    Aborted,
    Failed,
}

/// Consumer side of the scheduler: receives frames in range order and the
/// run's lifecycle events.
pub trait OutputDevice: Send + Sync {
    /// Called by the scheduler's consumer in strict frame order.
    fn deliver(&self, frame: i64, view: i32, image: &Arc<Image>) -> SmaltResult<()>;

    fn timeline_step(&self, _direction: RenderDirection) {}

    fn timeline_goto(&self, _frame: i64) {}

    fn timeline_get_time(&self) -> i64 {
        0
    }

    /// Range this device wants rendered; `None` defers to the node's time
    /// domain.
    fn frame_range_to_render(&self) -> Option<(i64, i64)> {
        None
    }

    fn on_render_started(&self) {}

    fn on_render_stopped(&self, _code: StopCode) {}

    /// Achieved vs requested FPS; only called when regulation is on.
    fn report_fps(&self, _actual: f64, _desired: f64) {}

    /// A producer finished computing `frame` (not yet delivered).
    fn report_frame_rendered(&self, _frame: i64) {}

    /// A producer failed; called at most once per run.
    fn report_failure(&self, _message: &str) {}
}

/// Where the consumer runs the delivery.
#[derive(Clone)]
pub enum DeliveryMode {
    /// The consumer calls `deliver` on its own thread.
    OnSchedulerThread,
    /// The consumer hands frames to the main task and awaits its
    /// acknowledgement. Ordering is unchanged.
    OnMainThread(MainGateSender),
}

pub(crate) struct DeliverRequest {
    pub frame: i64,
    pub view: i32,
    pub image: Arc<Image>,
    pub ack: mpsc::SyncSender<SmaltResult<()>>,
}

/// Sender half owned by the scheduler's consumer.
#[derive(Clone)]
pub struct MainGateSender {
    tx: mpsc::SyncSender<DeliverRequest>,
}

impl MainGateSender {
    pub(crate) fn deliver(
        &self,
        frame: i64,
        view: i32,
        image: &Arc<Image>,
    ) -> SmaltResult<()> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.tx
            .send(DeliverRequest {
                frame,
                view,
                image: image.clone(),
                ack: ack_tx,
            })
            .map_err(|_| SmaltError::plugin("main-thread gate is gone"))?;
        ack_rx
            .recv()
            .map_err(|_| SmaltError::plugin("main-thread gate dropped the acknowledgement"))?
    }
}

/// Receiver half pumped by the application's main task.
pub struct MainThreadGate {
    rx: mpsc::Receiver<DeliverRequest>,
}

impl MainThreadGate {
    /// Build a gate pair with a bounded hand-off channel.
    pub fn new(capacity: usize) -> (Self, MainGateSender) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        (Self { rx }, MainGateSender { tx })
    }

    /// Serve one delivery against `device`, blocking until one arrives.
    /// Returns false once all senders are gone.
    pub fn pump_one(&self, device: &dyn OutputDevice) -> bool {
        match self.rx.recv() {
            Ok(req) => {
                let res = device.deliver(req.frame, req.view, &req.image);
                let _ = req.ack.send(res);
                true
            }
            Err(_) => false,
        }
    }

    /// Serve deliveries until the scheduler side hangs up.
    pub fn pump_until_closed(&self, device: &dyn OutputDevice) {
        while self.pump_one(device) {}
    }
}
