//! JSON project files: a flat node list wired into a graph of built-in
//! effects.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use serde::Deserialize;

use smalt::effects::{AuxVectors, BoxBlur, FrameHold, Gain, SolidColor, TimeOffset, Translate2D, WriteSink};
use smalt::graph::effect::Effect;
use smalt::{Node, Project, Settings};

#[derive(Debug, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub settings: Option<Settings>,
    pub nodes: Vec<NodeDef>,
}

#[derive(Debug, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub effect: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SolidParams {
    color: [f32; 4],
    width: f64,
    height: f64,
    per_frame_bias: f64,
}

impl Default for SolidParams {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            width: 1920.0,
            height: 1080.0,
            per_frame_bias: 0.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GainParams {
    gain: f64,
}

#[derive(Debug, Deserialize)]
struct BlurParams {
    radius: i64,
}

#[derive(Debug, Deserialize)]
struct TranslateParams {
    dx: f64,
    dy: f64,
}

#[derive(Debug, Deserialize)]
struct TimeOffsetParams {
    offset: f64,
}

#[derive(Debug, Deserialize)]
struct FrameHoldParams {
    frame: f64,
}

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    pub first: i64,
    pub last: i64,
    /// Output path stem; frames land at `<stem>.<frame>.smimg`.
    pub path_stem: String,
    #[serde(default)]
    pub sequential: bool,
}

fn effect_from_def(def: &NodeDef) -> anyhow::Result<Arc<dyn Effect>> {
    let params = def.params.clone();
    let parse = |what: &str| format!("node '{}': bad {what} params", def.name);
    Ok(match def.effect.as_str() {
        "solid" => {
            let p: SolidParams = serde_json::from_value(params).with_context(|| parse("solid"))?;
            if p.per_frame_bias != 0.0 {
                Arc::new(SolidColor::animated(p.color, p.width, p.height, p.per_frame_bias))
            } else {
                Arc::new(SolidColor::opaque(p.color, p.width, p.height))
            }
        }
        "aux_vectors" => {
            let p: SolidParams = serde_json::from_value(params).with_context(|| parse("aux_vectors"))?;
            Arc::new(AuxVectors::new(p.width, p.height))
        }
        "gain" => {
            let p: GainParams = serde_json::from_value(params).with_context(|| parse("gain"))?;
            Arc::new(Gain::new(p.gain))
        }
        "box_blur" => {
            let p: BlurParams = serde_json::from_value(params).with_context(|| parse("box_blur"))?;
            Arc::new(BoxBlur::new(p.radius))
        }
        "translate" => {
            let p: TranslateParams =
                serde_json::from_value(params).with_context(|| parse("translate"))?;
            Arc::new(Translate2D::new(p.dx, p.dy))
        }
        "time_offset" => {
            let p: TimeOffsetParams =
                serde_json::from_value(params).with_context(|| parse("time_offset"))?;
            Arc::new(TimeOffset::new(p.offset))
        }
        "frame_hold" => {
            let p: FrameHoldParams =
                serde_json::from_value(params).with_context(|| parse("frame_hold"))?;
            Arc::new(FrameHold::new(p.frame))
        }
        "write" => {
            let p: WriteParams = serde_json::from_value(params).with_context(|| parse("write"))?;
            let sink = WriteSink::new(p.first as f64, p.last as f64);
            if p.sequential {
                Arc::new(sink.sequential())
            } else {
                Arc::new(sink)
            }
        }
        other => bail!("node '{}': unknown effect '{other}'", def.name),
    })
}

pub struct LoadedProject {
    pub project: Arc<Project>,
    pub writers: Vec<(Arc<Node>, WriteParams)>,
}

/// Parse and wire a project file.
pub fn load(path: &Path, settings_override: impl FnOnce(Settings) -> Settings) -> anyhow::Result<LoadedProject> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading project '{}'", path.display()))?;
    let file: ProjectFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing project '{}'", path.display()))?;

    let settings = settings_override(file.settings.unwrap_or_default().with_env());
    let project = Project::new(settings)?;

    let mut by_name: HashMap<String, Arc<Node>> = HashMap::new();
    for def in &file.nodes {
        if by_name.contains_key(&def.name) {
            bail!("duplicate node name '{}'", def.name);
        }
        let node = project.add_node(def.name.clone(), effect_from_def(def)?);
        by_name.insert(def.name.clone(), node);
    }
    let mut writers = Vec::new();
    for def in &file.nodes {
        let node = by_name[&def.name].clone();
        for (i, input_name) in def.inputs.iter().enumerate() {
            let upstream = by_name
                .get(input_name)
                .with_context(|| format!("node '{}': unknown input '{input_name}'", def.name))?;
            project.connect(&node, i, upstream)?;
        }
        if def.effect == "write" {
            let p: WriteParams = serde_json::from_value(def.params.clone())
                .with_context(|| format!("node '{}': bad write params", def.name))?;
            writers.push((node, p));
        }
    }
    project.refresh_hashes();
    Ok(LoadedProject { project, writers })
}
