//! Output-side effects: writers and the disk-cache pass-through.

use std::sync::{Arc, Mutex};

use crate::cache::image::ScratchPlane;
use crate::foundation::error::SmaltResult;
use crate::foundation::hash::StableHasher;
use crate::graph::effect::{
    Effect, EffectKind, RenderActionArgs, RenderSafety, SequenceArgs, SequentialPreference,
};

/// Events a writer observes, recorded for sequence-bracket assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum SequenceEvent {
    Begin { first: f64, last: f64 },
    Render { time: f64 },
    End { first: f64, last: f64 },
}

/// A writer node: pulls its input through the evaluator and hands the frame
/// to the output device. Rendering copies the input; persisting is the
/// device's job.
pub struct WriteSink {
    preference: SequentialPreference,
    first: f64,
    last: f64,
    log: Arc<Mutex<Vec<SequenceEvent>>>,
}

impl WriteSink {
    pub fn new(first: f64, last: f64) -> Self {
        Self {
            preference: SequentialPreference::Any,
            first,
            last,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sequential(mut self) -> Self {
        self.preference = SequentialPreference::Only;
        self
    }

    /// Shared view of the begin/render/end event log.
    pub fn sequence_log(&self) -> Arc<Mutex<Vec<SequenceEvent>>> {
        self.log.clone()
    }
}

impl Effect for WriteSink {
    fn plugin_id(&self) -> &str {
        "smalt.output.write"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_f64(self.first);
        h.write_f64(self.last);
        h.write_u8(match self.preference {
            SequentialPreference::Any => 0,
            SequentialPreference::Only => 1,
            SequentialPreference::Not => 2,
        });
    }

    fn input_count(&self) -> usize {
        1
    }

    fn time_domain(&self) -> (f64, f64) {
        (self.first, self.last)
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        self.log
            .lock()
            .expect("sequence log")
            .push(SequenceEvent::Render { time: args.time });
        for plane in planes {
            let src = args
                .inputs
                .get_image(0, args.time, args.view, &plane.plane)?;
            let input = src.read_rect(&args.rect)?;
            let n = plane.plane.components.count();
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    for c in 0..n {
                        plane.put(x, y, c, input.get(x, y, c));
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_sequence(&self, args: &SequenceArgs) -> SmaltResult<()> {
        self.log.lock().expect("sequence log").push(SequenceEvent::Begin {
            first: args.first,
            last: args.last,
        });
        Ok(())
    }

    fn end_sequence(&self, args: &SequenceArgs) -> SmaltResult<()> {
        self.log.lock().expect("sequence log").push(SequenceEvent::End {
            first: args.first,
            last: args.last,
        });
        Ok(())
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Writer
    }

    fn sequential_preference(&self) -> SequentialPreference {
        self.preference
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::InstanceSafe
    }

    /// Writers never cache their own output; caching would skip the write.
    fn supports_tiles(&self) -> bool {
        false
    }
}

/// Pass-through node that persists its input through the disk cache.
pub struct DiskCacheNode;

impl Effect for DiskCacheNode {
    fn plugin_id(&self) -> &str {
        "smalt.cache.disk"
    }

    fn fold_params(&self, _h: &mut StableHasher) {}

    fn input_count(&self) -> usize {
        1
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        for plane in planes {
            let src = args
                .inputs
                .get_image(0, args.time, args.view, &plane.plane)?;
            let input = src.read_rect(&args.rect)?;
            let n = plane.plane.components.count();
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    for c in 0..n {
                        plane.put(x, y, c, input.get(x, y, c));
                    }
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> EffectKind {
        EffectKind::DiskCache
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::FullySafe
    }
}
