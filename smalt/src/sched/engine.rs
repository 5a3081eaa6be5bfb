//! The render engine facade: one scheduler per output node.

use std::sync::Arc;

use crate::eval::context::FrameState;
use crate::eval::evaluator::Evaluator;
use crate::foundation::error::SmaltResult;
use crate::graph::node::Node;
use crate::graph::plane::{BitDepth, Plane};
use crate::output::device::{DeliveryMode, OutputDevice, RenderDirection};
use crate::sched::scheduler::{OutputScheduler, PlaybackMode, SchedulerConfig};

/// Owns the scheduler driving one output node (viewer or writer) and maps
/// the device kind to a delivery policy.
pub struct RenderEngine {
    evaluator: Arc<Evaluator>,
    node: Arc<Node>,
    device: Arc<dyn OutputDevice>,
    scheduler: OutputScheduler,
}

impl RenderEngine {
    /// Engine for an interactive viewer: FPS-regulated delivery.
    pub fn for_viewer(
        evaluator: Arc<Evaluator>,
        node: Arc<Node>,
        device: Arc<dyn OutputDevice>,
        fps: f64,
        delivery: DeliveryMode,
    ) -> Self {
        let settings = evaluator.project().settings();
        let cfg = SchedulerConfig {
            delivery,
            fps: Some(fps),
            playback: PlaybackMode::Once,
            buffer_capacity: settings.scheduler_buffer_capacity,
            threads: settings.effective_threads(),
            view: 0,
            planes: vec![Plane::rgba()],
            depth: BitDepth::F32,
        };
        Self::with_config(evaluator, node, device, cfg)
    }

    /// Engine for a writer: unregulated, ordered delivery.
    pub fn for_writer(
        evaluator: Arc<Evaluator>,
        node: Arc<Node>,
        device: Arc<dyn OutputDevice>,
    ) -> Self {
        let settings = evaluator.project().settings();
        let cfg = SchedulerConfig {
            delivery: DeliveryMode::OnSchedulerThread,
            fps: None,
            playback: PlaybackMode::Once,
            buffer_capacity: settings.scheduler_buffer_capacity,
            threads: settings.effective_threads(),
            view: 0,
            planes: vec![Plane::rgba()],
            depth: BitDepth::F32,
        };
        Self::with_config(evaluator, node, device, cfg)
    }

    pub fn with_config(
        evaluator: Arc<Evaluator>,
        node: Arc<Node>,
        device: Arc<dyn OutputDevice>,
        cfg: SchedulerConfig,
    ) -> Self {
        let scheduler = OutputScheduler::new(evaluator.clone(), node.clone(), device.clone(), cfg);
        Self {
            evaluator,
            node,
            device,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &OutputScheduler {
        &self.scheduler
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Render `first..=last` in `direction`.
    pub fn render_frame_range(
        &self,
        first: i64,
        last: i64,
        direction: RenderDirection,
    ) -> SmaltResult<()> {
        self.scheduler.start(Some((first, last)), direction)
    }

    /// Render the device's (or node's) own range.
    pub fn render_own_range(&self, direction: RenderDirection) -> SmaltResult<()> {
        self.scheduler.start(None, direction)
    }

    /// One-shot interactive render of the timeline's current frame,
    /// delivered directly. Goes stale through hash comparison rather than
    /// the abort flag.
    pub fn render_current_frame(&self) -> SmaltResult<()> {
        let frame = self.device.timeline_get_time();
        self.evaluator.project().refresh_hashes();
        let fs = FrameState::interactive(frame as f64, 0, self.node.current_hash());
        let planes = self.evaluator.render_frame(
            &self.node,
            &fs,
            [Plane::rgba()],
            BitDepth::F32,
        )?;
        if let Some(image) = planes.first() {
            self.device.deliver(frame, 0, image)?;
        }
        Ok(())
    }

    pub fn abort(&self, blocking: bool) {
        self.scheduler.abort(blocking);
    }

    pub fn wait_until_idle(&self) {
        self.scheduler.wait_until_idle();
    }

    pub fn is_working(&self) -> bool {
        self.scheduler.is_working()
    }

    /// Terminal shutdown; the engine is unusable afterwards.
    pub fn quit(&self) {
        self.scheduler.quit();
    }
}
