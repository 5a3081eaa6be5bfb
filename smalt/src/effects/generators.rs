//! Source effects: no inputs, fully defined output.

use std::sync::Mutex;

use crate::cache::image::ScratchPlane;
use crate::foundation::error::SmaltResult;
use crate::foundation::geom::CanonicalRect;
use crate::foundation::hash::StableHasher;
use crate::graph::effect::{
    Effect, EffectKind, RenderActionArgs, RenderSafety, RodArgs, UpstreamQuery,
};
use crate::graph::plane::{Components, Plane};

/// Constant-color generator. With a non-zero `per_frame_bias` the red
/// channel drifts with time, making the output frame-varying.
pub struct SolidColor {
    color: Mutex<[f32; 4]>,
    width: f64,
    height: f64,
    per_frame_bias: f64,
    delay: Option<std::time::Duration>,
}

impl SolidColor {
    pub fn opaque(color: [f32; 4], width: f64, height: f64) -> Self {
        Self {
            color: Mutex::new(color),
            width,
            height,
            per_frame_bias: 0.0,
            delay: None,
        }
    }

    /// A generator whose output changes every frame.
    pub fn animated(color: [f32; 4], width: f64, height: f64, per_frame_bias: f64) -> Self {
        Self {
            per_frame_bias,
            ..Self::opaque(color, width, height)
        }
    }

    /// Sleep inside every render call; playback/abort tests use this to
    /// keep producers busy.
    pub fn with_render_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_color(&self, color: [f32; 4]) {
        *self.color.lock().expect("color lock") = color;
    }

    fn color_at(&self, time: f64) -> [f32; 4] {
        let mut c = *self.color.lock().expect("color lock");
        if self.per_frame_bias != 0.0 {
            c[0] = (c[0] + (self.per_frame_bias * time) as f32).clamp(0.0, 1.0);
        }
        c
    }
}

impl Effect for SolidColor {
    fn plugin_id(&self) -> &str {
        "smalt.generate.solid"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        for v in *self.color.lock().expect("color lock") {
            h.write_f64(f64::from(v));
        }
        h.write_f64(self.width);
        h.write_f64(self.height);
        h.write_f64(self.per_frame_bias);
    }

    fn input_count(&self) -> usize {
        0
    }

    fn region_of_definition(
        &self,
        _args: &RodArgs,
        _up: &dyn UpstreamQuery,
    ) -> SmaltResult<CanonicalRect> {
        Ok(CanonicalRect::new(0.0, 0.0, self.width, self.height))
    }

    fn time_domain(&self) -> (f64, f64) {
        (1.0, f64::MAX)
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
        let c = self.color_at(args.time);
        for plane in planes {
            let n = plane.plane.components.count();
            plane.fill(&c[..n.min(4)]);
        }
        Ok(())
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::HostTiled
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Generator
    }

    fn is_frame_varying(&self) -> bool {
        self.per_frame_bias != 0.0
    }
}

/// Generator producing both a color plane and an auxiliary `motion` plane
/// (constant unit vectors), for plane pass-through coverage.
pub struct AuxVectors {
    width: f64,
    height: f64,
}

impl AuxVectors {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn motion_plane() -> Plane {
        Plane::aux("motion", Components::Xy)
    }
}

impl Effect for AuxVectors {
    fn plugin_id(&self) -> &str {
        "smalt.generate.auxvectors"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_f64(self.width);
        h.write_f64(self.height);
    }

    fn input_count(&self) -> usize {
        0
    }

    fn region_of_definition(
        &self,
        _args: &RodArgs,
        _up: &dyn UpstreamQuery,
    ) -> SmaltResult<CanonicalRect> {
        Ok(CanonicalRect::new(0.0, 0.0, self.width, self.height))
    }

    fn produced_planes(&self, _time: f64, _view: i32) -> Vec<Plane> {
        vec![Plane::rgba(), Self::motion_plane()]
    }

    fn render(&self, _args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        for plane in planes {
            if plane.plane.layer.is_color() {
                plane.fill(&[0.25, 0.5, 0.75, 1.0]);
            } else {
                plane.fill(&[1.0, -1.0]);
            }
        }
        Ok(())
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::FullySafe
    }

    fn kind(&self) -> EffectKind {
        EffectKind::Generator
    }

    fn is_frame_varying(&self) -> bool {
        false
    }
}
