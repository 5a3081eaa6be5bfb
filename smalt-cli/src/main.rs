use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use smalt::output::device::OutputDevice;
use smalt::{
    Evaluator, FrameState, RenderDirection, RenderEngine, SequenceWriterDevice, StopCode,
};

mod project;

#[derive(Parser, Debug)]
#[command(name = "smalt", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render every (or the selected) writer of a project to completion.
    Render(RenderArgs),
    /// Print the graph with per-node regions of definition and time domains.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Project JSON.
    #[arg(long)]
    project: PathBuf,

    /// Writer node names to run; all writers when omitted.
    #[arg(long = "writer")]
    writers: Vec<String>,

    /// Frame range override, `first-last`.
    #[arg(long)]
    range: Option<String>,

    /// Override the worker thread count.
    #[arg(long)]
    threads: Option<usize>,

    /// Suppress per-frame progress output.
    #[arg(long, default_value_t = false)]
    background: bool,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Project JSON.
    #[arg(long)]
    project: PathBuf,
}

/// Wraps the sequence writer to record the run outcome.
struct RecordingWriter {
    seq: SequenceWriterDevice,
    background: bool,
    outcome: Mutex<Option<StopCode>>,
}

impl OutputDevice for RecordingWriter {
    fn deliver(
        &self,
        frame: i64,
        view: i32,
        image: &std::sync::Arc<smalt::Image>,
    ) -> smalt::SmaltResult<()> {
        self.seq.deliver(frame, view, image)
    }

    fn frame_range_to_render(&self) -> Option<(i64, i64)> {
        self.seq.frame_range_to_render()
    }

    fn on_render_stopped(&self, code: StopCode) {
        *self.outcome.lock().expect("outcome lock") = Some(code);
    }

    fn report_frame_rendered(&self, frame: i64) {
        if !self.background {
            eprintln!("rendered frame {frame}");
        }
    }

    fn report_failure(&self, message: &str) {
        eprintln!("render failure: {message}");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Probe(args) => cmd_probe(args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(64)
        }
    }
}

fn parse_range(s: &str) -> anyhow::Result<(i64, i64)> {
    let (a, b) = s
        .split_once('-')
        .with_context(|| format!("range '{s}' is not of the form first-last"))?;
    let first: i64 = a.trim().parse().with_context(|| format!("bad first frame in '{s}'"))?;
    let last: i64 = b.trim().parse().with_context(|| format!("bad last frame in '{s}'"))?;
    anyhow::ensure!(first <= last, "range '{s}' is empty");
    Ok((first, last))
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<ExitCode> {
    let range = args.range.as_deref().map(parse_range).transpose()?;
    let threads = args.threads;
    let loaded = project::load(&args.project, move |mut s| {
        if let Some(n) = threads {
            s.threads = Some(n);
        }
        s
    })?;

    let mut selected = loaded.writers;
    if !args.writers.is_empty() {
        selected.retain(|(node, _)| args.writers.iter().any(|w| w == node.name()));
        anyhow::ensure!(
            !selected.is_empty(),
            "none of the requested writers exist in the project"
        );
    }
    anyhow::ensure!(!selected.is_empty(), "project has no writer nodes");

    let evaluator = Arc::new(Evaluator::new(loaded.project.clone())?);
    let mut any_aborted = false;
    let mut any_failed = false;

    for (node, params) in selected {
        let (first, last) = range.unwrap_or((params.first, params.last));
        let stem_path = PathBuf::from(&params.path_stem);
        let dir = stem_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = stem_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("frame")
            .to_owned();
        let device = Arc::new(RecordingWriter {
            seq: SequenceWriterDevice::new(dir, stem).with_range(first, last),
            background: args.background,
            outcome: Mutex::new(None),
        });

        if !args.background {
            eprintln!(
                "rendering '{}' frames {first}-{last} -> {}",
                node.name(),
                params.path_stem
            );
        }
        let engine = RenderEngine::for_writer(evaluator.clone(), node, device.clone());
        engine.render_frame_range(first, last, RenderDirection::Forward)?;
        engine.wait_until_idle();
        engine.quit();

        match device.outcome.lock().expect("outcome lock").take() {
            Some(StopCode::Finished) => {}
            Some(StopCode::Aborted) => any_aborted = true,
            Some(StopCode::Failed) | None => any_failed = true,
        }
    }

    Ok(if any_failed {
        ExitCode::from(2)
    } else if any_aborted {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_probe(args: ProbeArgs) -> anyhow::Result<ExitCode> {
    let loaded = project::load(&args.project, |s| s)?;
    let evaluator = Evaluator::new(loaded.project.clone())?;

    for node in loaded.project.nodes() {
        let (first, last) = evaluator.cached_time_domain(&node);
        let fs = FrameState::interactive(first, 0, node.current_hash());
        let rod = evaluator.cached_rod(&node, &fs, first, 0, 0);
        match rod {
            Ok((rod, is_format)) => println!(
                "{:24} {:28} frames {first}-{last} rod ({:.1}, {:.1})-({:.1}, {:.1}){}",
                node.name(),
                node.effect().plugin_id(),
                rod.x1,
                rod.y1,
                rod.x2,
                rod.y2,
                if is_format { " [project format]" } else { "" },
            ),
            Err(e) => println!(
                "{:24} {:28} frames {first}-{last} rod unavailable: {e}",
                node.name(),
                node.effect().plugin_id(),
            ),
        }
    }
    Ok(ExitCode::SUCCESS)
}
