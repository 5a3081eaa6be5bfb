//! The output scheduler: a pool of frame producers, one ordered consumer,
//! a bounded buffer between them, and the abort/quit protocol.
//!
//! Producers pick frame indices, evaluate the output node and append to the
//! buffer; the consumer drains it in strict range order and delivers to the
//! output device, pacing to the target FPS when regulation is on. Abort is
//! cooperative: the flag plus a render-age bump, observed by every frame at
//! its next check. `abort(blocking)` must never run on a producer thread:
//! it waits for the pool to drain and would deadlock on itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::eval::context::{AbortFlag, FrameState};
use crate::eval::evaluator::Evaluator;
use crate::foundation::error::{SmaltError, SmaltResult};
use crate::graph::effect::{SequenceArgs, SequentialPreference};
use crate::graph::node::Node;
use crate::graph::plane::{BitDepth, Plane};
use crate::output::device::{DeliveryMode, OutputDevice, RenderDirection, StopCode};
use crate::sched::buffer::FrameBuffer;
use crate::sched::fps::FpsRegulator;

/// What happens when the range is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackMode {
    Once,
    Loop,
    Bounce,
}

/// Scheduler lifecycle. `Quitting` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Starting,
    Running,
    Stopping,
    Quitting,
}

/// Static configuration of one scheduler.
#[derive(Clone)]
pub struct SchedulerConfig {
    pub delivery: DeliveryMode,
    /// Target FPS; `Some` turns regulation on.
    pub fps: Option<f64>,
    pub playback: PlaybackMode,
    pub buffer_capacity: usize,
    pub threads: usize,
    pub view: i32,
    pub planes: Vec<Plane>,
    pub depth: BitDepth,
}

#[derive(Clone, Copy)]
struct RunArgs {
    first: i64,
    last: i64,
    direction: RenderDirection,
}

/// Direction-aware frame index source shared by the producers.
struct FramePicker {
    first: i64,
    last: i64,
    direction: RenderDirection,
    mode: PlaybackMode,
    next: Option<i64>,
}

impl FramePicker {
    fn new(run: RunArgs, mode: PlaybackMode) -> Self {
        let next = Some(match run.direction {
            RenderDirection::Forward => run.first,
            RenderDirection::Backward => run.last,
        });
        Self {
            first: run.first,
            last: run.last,
            direction: run.direction,
            mode,
            next,
        }
    }

    fn pick(&mut self) -> Option<i64> {
        let cur = self.next?;
        self.next = match self.direction {
            RenderDirection::Forward if cur < self.last => Some(cur + 1),
            RenderDirection::Backward if cur > self.first => Some(cur - 1),
            _ => match self.mode {
                PlaybackMode::Once => None,
                PlaybackMode::Loop => Some(match self.direction {
                    RenderDirection::Forward => self.first,
                    RenderDirection::Backward => self.last,
                }),
                PlaybackMode::Bounce => {
                    self.direction = match self.direction {
                        RenderDirection::Forward => RenderDirection::Backward,
                        RenderDirection::Backward => RenderDirection::Forward,
                    };
                    if self.first == self.last {
                        Some(cur)
                    } else {
                        Some(match self.direction {
                            RenderDirection::Forward => self.first + 1,
                            RenderDirection::Backward => self.last - 1,
                        })
                    }
                }
            },
        };
        Some(cur)
    }
}

struct SchedState {
    phase: SchedulerPhase,
    run: Option<RunArgs>,
    active_producers: usize,
    failed: bool,
    handles: Vec<JoinHandle<()>>,
}

struct SchedInner {
    node: Arc<Node>,
    device: Arc<dyn OutputDevice>,
    evaluator: Arc<Evaluator>,
    cfg: SchedulerConfig,
    state: Mutex<SchedState>,
    cond: Condvar,
    buffer: FrameBuffer,
    picker: Mutex<Option<FramePicker>>,
    abort: Arc<AbortFlag>,
    fps: FpsRegulator,
    failure_reported: AtomicBool,
    quit: AtomicBool,
}

/// Producer/consumer pipeline in front of one output node.
pub struct OutputScheduler {
    inner: Arc<SchedInner>,
}

impl OutputScheduler {
    pub fn new(
        evaluator: Arc<Evaluator>,
        node: Arc<Node>,
        device: Arc<dyn OutputDevice>,
        cfg: SchedulerConfig,
    ) -> Self {
        let buffer = FrameBuffer::new(cfg.buffer_capacity);
        let fps = FpsRegulator::new(cfg.fps.unwrap_or(24.0));
        Self {
            inner: Arc::new(SchedInner {
                node,
                device,
                evaluator,
                cfg,
                state: Mutex::new(SchedState {
                    phase: SchedulerPhase::Idle,
                    run: None,
                    active_producers: 0,
                    failed: false,
                    handles: Vec::new(),
                }),
                cond: Condvar::new(),
                buffer,
                picker: Mutex::new(None),
                abort: Arc::new(AbortFlag::new()),
                fps,
                failure_reported: AtomicBool::new(false),
                quit: AtomicBool::new(false),
            }),
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.inner.state.lock().expect("scheduler state").phase
    }

    pub fn is_working(&self) -> bool {
        self.phase() != SchedulerPhase::Idle
    }

    pub fn abort_flag(&self) -> Arc<AbortFlag> {
        self.inner.abort.clone()
    }

    pub fn set_desired_fps(&self, fps: f64) {
        self.inner.fps.set_desired(fps);
    }

    /// Render `range` (or the device's / node's range) in `direction`.
    pub fn start(
        &self,
        range: Option<(i64, i64)>,
        direction: RenderDirection,
    ) -> SmaltResult<()> {
        let inner = &self.inner;
        if inner.quit.load(Ordering::SeqCst) {
            return Err(SmaltError::invalid("scheduler has quit"));
        }
        {
            let mut st = inner.state.lock().expect("scheduler state");
            if st.phase != SchedulerPhase::Idle {
                return Err(SmaltError::invalid("scheduler is already running"));
            }
            st.phase = SchedulerPhase::Starting;
            // Reap threads of the previous run.
            for h in st.handles.drain(..) {
                let _ = h.join();
            }
        }

        let (first, last) = match range.or_else(|| inner.device.frame_range_to_render()) {
            Some(r) => r,
            None => {
                let (f, l) = inner.evaluator.cached_time_domain(&inner.node);
                (f.floor() as i64, l.floor() as i64)
            }
        };
        if first > last {
            let mut st = inner.state.lock().expect("scheduler state");
            st.phase = SchedulerPhase::Idle;
            inner.cond.notify_all();
            return Err(SmaltError::invalid(format!(
                "frame range {first}-{last} is empty"
            )));
        }
        let run = RunArgs {
            first,
            last,
            direction,
        };

        inner.evaluator.project().refresh_hashes();
        inner.abort.renew();
        inner.failure_reported.store(false, Ordering::SeqCst);
        inner.buffer.reset();
        inner.fps.restart();
        *inner.picker.lock().expect("picker lock") =
            Some(FramePicker::new(run, inner.cfg.playback));

        let sequential = inner.node.is_writer()
            && matches!(
                inner.node.effect().sequential_preference(),
                SequentialPreference::Only
            );
        if sequential {
            inner.node.effect().begin_sequence(&SequenceArgs {
                first: first as f64,
                last: last as f64,
                step: 1.0,
                interactive: false,
                scale: 1.0,
                view: inner.cfg.view,
            })?;
        }

        inner.device.on_render_started();
        inner.device.timeline_goto(match direction {
            RenderDirection::Forward => first,
            RenderDirection::Backward => last,
        });

        let producer_count = if sequential {
            1
        } else {
            inner.cfg.threads.max(1)
        };
        let mut handles = Vec::with_capacity(producer_count + 1);
        {
            // Running must be visible before any worker can observe (and
            // finish) the run, or a fast consumer's Idle would be clobbered.
            let mut st = inner.state.lock().expect("scheduler state");
            st.run = Some(run);
            st.failed = false;
            st.active_producers = producer_count;
            st.phase = SchedulerPhase::Running;
        }
        for i in 0..producer_count {
            let inner = self.inner.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("smalt-producer-{i}"))
                    .spawn(move || producer_loop(&inner))
                    .expect("spawn producer"),
            );
        }
        {
            let inner = self.inner.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("smalt-consumer".to_owned())
                    .spawn(move || consumer_loop(&inner, run, sequential))
                    .expect("spawn consumer"),
            );
        }
        let mut st = inner.state.lock().expect("scheduler state");
        st.handles = handles;
        inner.cond.notify_all();
        Ok(())
    }

    /// Request cancellation. With `blocking`, returns only after every
    /// producer observed the abort and unwound; never call it from a
    /// producer.
    pub fn abort(&self, blocking: bool) {
        let inner = &self.inner;
        {
            let st = inner.state.lock().expect("scheduler state");
            if matches!(st.phase, SchedulerPhase::Idle | SchedulerPhase::Quitting) {
                return;
            }
        }
        inner.abort.abort();
        inner.buffer.close();
        if blocking {
            let mut st = inner.state.lock().expect("scheduler state");
            while !matches!(st.phase, SchedulerPhase::Idle | SchedulerPhase::Quitting)
                || st.active_producers > 0
            {
                st = inner.cond.wait(st).expect("scheduler state");
            }
        }
    }

    /// Block until the current run fully stopped.
    pub fn wait_until_idle(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock().expect("scheduler state");
        while !matches!(st.phase, SchedulerPhase::Idle | SchedulerPhase::Quitting)
            || st.active_producers > 0
        {
            st = inner.cond.wait(st).expect("scheduler state");
        }
    }

    /// Terminal: abort, join every thread, leave the scheduler unusable.
    pub fn quit(&self) {
        let inner = &self.inner;
        if inner.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort(true);
        let handles = {
            let mut st = inner.state.lock().expect("scheduler state");
            st.phase = SchedulerPhase::Quitting;
            std::mem::take(&mut st.handles)
        };
        for h in handles {
            let _ = h.join();
        }
        inner.cond.notify_all();
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        self.quit();
    }
}

fn should_stop(inner: &SchedInner) -> bool {
    inner.abort.is_aborted() || inner.quit.load(Ordering::SeqCst)
}

/// Direction-aware frame pick with capacity backpressure. `None` tells the
/// producer to exit.
fn pick_next_frame(inner: &SchedInner) -> Option<i64> {
    loop {
        if should_stop(inner) {
            return None;
        }
        if !inner.buffer.wait_for_room(&|| should_stop(inner)) {
            return None;
        }
        let mut picker = inner.picker.lock().expect("picker lock");
        return picker.as_mut()?.pick();
    }
}

fn notify_render_failure(inner: &SchedInner, message: &str) {
    if !inner.failure_reported.swap(true, Ordering::SeqCst) {
        inner.device.report_failure(message);
    }
    {
        let mut st = inner.state.lock().expect("scheduler state");
        st.failed = true;
    }
    // Abort the rest of the run without blocking (we may be a producer).
    inner.abort.abort();
    inner.buffer.close();
}

fn producer_loop(inner: &Arc<SchedInner>) {
    while let Some(frame) = pick_next_frame(inner) {
        let time = frame as f64;
        let root_hash = inner.node.current_hash();
        let fs = FrameState::playback(time, inner.cfg.view, root_hash, inner.abort.clone());
        match inner.evaluator.render_frame(
            &inner.node,
            &fs,
            inner.cfg.planes.iter().cloned(),
            inner.cfg.depth,
        ) {
            Ok(planes) => {
                let Some(image) = planes.into_iter().next() else {
                    notify_render_failure(inner, "output node produced no planes");
                    break;
                };
                inner.device.report_frame_rendered(frame);
                if !inner.buffer.push(frame, inner.cfg.view, image) {
                    break;
                }
            }
            Err(e) if e.is_abort() => break,
            Err(e) => {
                notify_render_failure(inner, &e.to_string());
                break;
            }
        }
    }
    let mut st = inner.state.lock().expect("scheduler state");
    st.active_producers = st.active_producers.saturating_sub(1);
    inner.cond.notify_all();
}

fn consumer_loop(inner: &Arc<SchedInner>, run: RunArgs, sequential: bool) {
    let mut expected = match run.direction {
        RenderDirection::Forward => run.first,
        RenderDirection::Backward => run.last,
    };
    let mut direction = run.direction;
    let mut finished = false;

    loop {
        if should_stop(inner) {
            break;
        }
        let Some(views) = inner
            .buffer
            .pop_expected(expected, &|| should_stop(inner))
        else {
            break;
        };
        if inner.cfg.fps.is_some() {
            let (actual, desired) = inner.fps.regulate();
            inner.device.report_fps(actual, desired);
        }
        let mut delivery_failed = false;
        for (view, image) in views {
            let res = match &inner.cfg.delivery {
                DeliveryMode::OnSchedulerThread => inner.device.deliver(expected, view, &image),
                DeliveryMode::OnMainThread(gate) => gate.deliver(expected, view, &image),
            };
            if let Err(e) = res {
                notify_render_failure(inner, &e.to_string());
                delivery_failed = true;
                break;
            }
        }
        if delivery_failed {
            break;
        }
        inner.device.timeline_step(direction);

        // Advance the expectation, honoring the playback mode.
        let at_end = match direction {
            RenderDirection::Forward => expected >= run.last,
            RenderDirection::Backward => expected <= run.first,
        };
        if !at_end {
            expected += match direction {
                RenderDirection::Forward => 1,
                RenderDirection::Backward => -1,
            };
            continue;
        }
        match inner.cfg.playback {
            PlaybackMode::Once => {
                finished = true;
                break;
            }
            PlaybackMode::Loop => {
                expected = match direction {
                    RenderDirection::Forward => run.first,
                    RenderDirection::Backward => run.last,
                };
                inner.device.timeline_goto(expected);
            }
            PlaybackMode::Bounce => {
                direction = match direction {
                    RenderDirection::Forward => RenderDirection::Backward,
                    RenderDirection::Backward => RenderDirection::Forward,
                };
                if run.first != run.last {
                    expected += match direction {
                        RenderDirection::Forward => 1,
                        RenderDirection::Backward => -1,
                    };
                }
            }
        }
    }

    finish_run(inner, run, sequential, finished);
}

fn finish_run(inner: &Arc<SchedInner>, run: RunArgs, sequential: bool, finished: bool) {
    {
        let mut st = inner.state.lock().expect("scheduler state");
        if st.phase == SchedulerPhase::Running || st.phase == SchedulerPhase::Starting {
            st.phase = SchedulerPhase::Stopping;
        }
    }
    // Unblock and drain the pool before reporting the stop.
    inner.buffer.close();
    {
        let mut st = inner.state.lock().expect("scheduler state");
        while st.active_producers > 0 {
            st = inner.cond.wait(st).expect("scheduler state");
        }
    }

    if sequential {
        // A writer that cannot finalize its sequence failed the run, even
        // when every frame rendered.
        if let Err(e) = inner.node.effect().end_sequence(&SequenceArgs {
            first: run.first as f64,
            last: run.last as f64,
            step: 1.0,
            interactive: false,
            scale: 1.0,
            view: inner.cfg.view,
        }) {
            notify_render_failure(inner, &e.to_string());
        }
    }

    let code = {
        let st = inner.state.lock().expect("scheduler state");
        if st.failed {
            StopCode::Failed
        } else if finished {
            StopCode::Finished
        } else {
            StopCode::Aborted
        }
    };
    inner.device.on_render_stopped(code);

    let mut st = inner.state.lock().expect("scheduler state");
    if st.phase != SchedulerPhase::Quitting {
        st.phase = SchedulerPhase::Idle;
    }
    st.run = None;
    inner.cond.notify_all();
}
