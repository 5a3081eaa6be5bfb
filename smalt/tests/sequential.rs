//! Sequential writers: one begin/end bracket around the whole range, frames
//! rendered strictly in order by a single producer.

use std::sync::Arc;

use smalt::effects::{SequenceEvent, SolidColor, WriteSink};
use smalt::{
    Evaluator, MemoryOutput, Project, RenderDirection, RenderEngine, Settings, StopCode,
};

#[test]
fn sequential_writer_brackets_the_range() {
    let project = Project::new(Settings::default()).unwrap();
    let bg = project.add_node(
        "bg",
        Arc::new(SolidColor::animated([0.3, 0.3, 0.3, 1.0], 24.0, 24.0, 0.01)),
    );
    let sink = WriteSink::new(1.0, 3.0).sequential();
    let log = sink.sequence_log();
    let writer = project.add_node("writer", Arc::new(sink));
    project.connect(&writer, 0, &bg).unwrap();
    project.refresh_hashes();

    let evaluator = Arc::new(Evaluator::new(project).unwrap());
    let device = Arc::new(MemoryOutput::new());
    let engine = RenderEngine::for_writer(evaluator, writer, device.clone());
    engine
        .render_frame_range(1, 3, RenderDirection::Forward)
        .unwrap();
    engine.wait_until_idle();

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events.first(),
        Some(&SequenceEvent::Begin { first: 1.0, last: 3.0 })
    );
    assert_eq!(
        events.last(),
        Some(&SequenceEvent::End { first: 1.0, last: 3.0 })
    );
    let renders: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            SequenceEvent::Render { time } => Some(*time),
            _ => None,
        })
        .collect();
    assert_eq!(renders, vec![1.0, 2.0, 3.0]);
    // Exactly one bracket, no per-frame begin/end.
    let begins = events
        .iter()
        .filter(|e| matches!(e, SequenceEvent::Begin { .. }))
        .count();
    let ends = events
        .iter()
        .filter(|e| matches!(e, SequenceEvent::End { .. }))
        .count();
    assert_eq!((begins, ends), (1, 1));

    assert_eq!(device.delivered(), vec![(1, 0), (2, 0), (3, 0)]);
    assert_eq!(device.stop_codes(), vec![StopCode::Finished]);
    engine.quit();
}

#[test]
fn non_sequential_writer_brackets_each_frame() {
    // One producer keeps the shared event log strictly ordered.
    let project = Project::new(Settings {
        threads: Some(1),
        ..Settings::default()
    })
    .unwrap();
    let bg = project.add_node("bg", Arc::new(SolidColor::opaque([0.5; 4], 16.0, 16.0)));
    let sink = WriteSink::new(1.0, 2.0);
    let log = sink.sequence_log();
    let writer = project.add_node("writer", Arc::new(sink));
    project.connect(&writer, 0, &bg).unwrap();
    project.refresh_hashes();

    let evaluator = Arc::new(Evaluator::new(project).unwrap());
    let device = Arc::new(MemoryOutput::new());
    let engine = RenderEngine::for_writer(evaluator, writer, device.clone());
    engine
        .render_frame_range(1, 2, RenderDirection::Forward)
        .unwrap();
    engine.wait_until_idle();

    let events = log.lock().unwrap().clone();
    // Every render sits inside its own single-frame bracket.
    let begins = events
        .iter()
        .filter(|e| matches!(e, SequenceEvent::Begin { .. }))
        .count();
    assert_eq!(begins, 2);
    for w in events.windows(3) {
        if let SequenceEvent::Render { time } = w[1] {
            assert_eq!(w[0], SequenceEvent::Begin { first: time, last: time });
            assert_eq!(w[2], SequenceEvent::End { first: time, last: time });
        }
    }
    engine.quit();
}

#[test]
fn failing_end_sequence_fails_the_run() {
    use smalt::foundation::hash::StableHasher;
    use smalt::graph::effect::{
        Effect, EffectKind, RenderActionArgs, SequenceArgs, SequentialPreference,
    };
    use smalt::{ScratchPlane, SmaltError, SmaltResult};

    struct UnflushableWriter;

    impl Effect for UnflushableWriter {
        fn plugin_id(&self) -> &str {
            "test.unflushable-writer"
        }

        fn fold_params(&self, _h: &mut StableHasher) {}

        fn input_count(&self) -> usize {
            1
        }

        fn time_domain(&self) -> (f64, f64) {
            (1.0, 2.0)
        }

        fn render(
            &self,
            args: &RenderActionArgs<'_>,
            planes: &mut [ScratchPlane],
        ) -> SmaltResult<()> {
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

        fn end_sequence(&self, _args: &SequenceArgs) -> SmaltResult<()> {
            Err(SmaltError::plugin("cannot finalize the sequence"))
        }

        fn kind(&self) -> EffectKind {
            EffectKind::Writer
        }

        fn sequential_preference(&self) -> SequentialPreference {
            SequentialPreference::Only
        }

        fn supports_tiles(&self) -> bool {
            false
        }
    }

    let project = Project::new(Settings::default()).unwrap();
    let bg = project.add_node("bg", Arc::new(SolidColor::opaque([0.5; 4], 16.0, 16.0)));
    let writer = project.add_node("writer", Arc::new(UnflushableWriter));
    project.connect(&writer, 0, &bg).unwrap();
    project.refresh_hashes();

    let evaluator = Arc::new(Evaluator::new(project).unwrap());
    let device = Arc::new(MemoryOutput::new());
    let engine = RenderEngine::for_writer(evaluator, writer, device.clone());
    engine
        .render_frame_range(1, 2, RenderDirection::Forward)
        .unwrap();
    engine.wait_until_idle();

    // Every frame rendered and was delivered, but the failed finalization
    // still surfaces exactly once and fails the run.
    assert_eq!(device.delivered(), vec![(1, 0), (2, 0)]);
    let failures = device.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("cannot finalize"));
    assert_eq!(device.stop_codes(), vec![StopCode::Failed]);
    engine.quit();
}
