//! Single-input pixel filters.

use std::sync::Mutex;

use crate::cache::image::ScratchPlane;
use crate::foundation::error::SmaltResult;
use crate::foundation::geom::CanonicalRect;
use crate::foundation::hash::StableHasher;
use crate::graph::effect::{
    Effect, RenderActionArgs, RenderSafety, RodArgs, RoiMap, TransformDecl, UpstreamQuery,
};

/// Multiply color channels by a constant. The workhorse test filter.
pub struct Gain {
    k: Mutex<f64>,
    safety: RenderSafety,
    delay: Option<std::time::Duration>,
}

impl Gain {
    pub fn new(k: f64) -> Self {
        Self {
            k: Mutex::new(k),
            safety: RenderSafety::HostTiled,
            delay: None,
        }
    }

    pub fn with_safety(mut self, safety: RenderSafety) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_render_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_gain(&self, k: f64) {
        *self.k.lock().expect("gain lock") = k;
    }
}

impl Effect for Gain {
    fn plugin_id(&self) -> &str {
        "smalt.filter.gain"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_f64(*self.k.lock().expect("gain lock"));
    }

    fn input_count(&self) -> usize {
        1
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        if let Some(d) = self.delay {
            std::thread::sleep(d);
        }
        let k = *self.k.lock().expect("gain lock") as f32;
        for plane in planes {
            let src = args
                .inputs
                .get_image(0, args.time, args.view, &plane.plane)?;
            let input = src.read_rect(&args.rect)?;
            let n = plane.plane.components.count();
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    for c in 0..n {
                        let v = input.get(x, y, c);
                        // Alpha passes through untouched.
                        let scaled = if plane.plane.layer.is_color() && c == 3 { v } else { v * k };
                        plane.put(x, y, c, scaled);
                    }
                }
            }
        }
        Ok(())
    }

    fn safety(&self) -> RenderSafety {
        self.safety
    }
}

/// Box blur with a pixel radius; expands its region of interest so tiles
/// pull enough source.
pub struct BoxBlur {
    radius: i64,
}

impl BoxBlur {
    pub fn new(radius: i64) -> Self {
        Self { radius: radius.max(0) }
    }
}

impl Effect for BoxBlur {
    fn plugin_id(&self) -> &str {
        "smalt.filter.boxblur"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_i64(self.radius);
    }

    fn input_count(&self) -> usize {
        1
    }

    fn regions_of_interest(
        &self,
        _time: f64,
        _view: i32,
        mip_level: u32,
        out_rect: &CanonicalRect,
    ) -> RoiMap {
        let pad = self.radius as f64 / crate::foundation::geom::scale_from_mip_level(mip_level);
        RoiMap::from([(
            0usize,
            CanonicalRect::new(
                out_rect.x1 - pad,
                out_rect.y1 - pad,
                out_rect.x2 + pad,
                out_rect.y2 + pad,
            ),
        )])
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        let r = self.radius;
        for plane in planes {
            let src = args
                .inputs
                .get_image(0, args.time, args.view, &plane.plane)?;
            let mut wide = args.rect;
            wide.x1 -= r;
            wide.y1 -= r;
            wide.x2 += r;
            wide.y2 += r;
            let input = src.read_rect(&wide)?;
            let n = plane.plane.components.count();
            let count = ((2 * r + 1) * (2 * r + 1)) as f32;
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    for c in 0..n {
                        let mut acc = 0.0f32;
                        for dy in -r..=r {
                            for dx in -r..=r {
                                acc += input.get(x + dx, y + dy, c);
                            }
                        }
                        plane.put(x, y, c, acc / count);
                    }
                }
            }
        }
        Ok(())
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::HostTiled
    }
}

/// Integer-pixel translation declaring a concatenatable matrix transform.
pub struct Translate2D {
    dx: f64,
    dy: f64,
}

impl Translate2D {
    pub fn new(dx: f64, dy: f64) -> Self {
        Self { dx, dy }
    }
}

impl Effect for Translate2D {
    fn plugin_id(&self) -> &str {
        "smalt.transform.translate"
    }

    fn fold_params(&self, h: &mut StableHasher) {
        h.write_f64(self.dx);
        h.write_f64(self.dy);
    }

    fn input_count(&self) -> usize {
        1
    }

    fn region_of_definition(
        &self,
        args: &RodArgs,
        up: &dyn UpstreamQuery,
    ) -> SmaltResult<CanonicalRect> {
        let rod = up
            .input_rod(0, args.time, args.view, args.mip_level)?
            .unwrap_or_else(|| up.project_format());
        Ok(CanonicalRect::new(
            rod.x1 + self.dx,
            rod.y1 + self.dy,
            rod.x2 + self.dx,
            rod.y2 + self.dy,
        ))
    }

    fn regions_of_interest(
        &self,
        _time: f64,
        _view: i32,
        _mip_level: u32,
        out_rect: &CanonicalRect,
    ) -> RoiMap {
        RoiMap::from([(
            0usize,
            CanonicalRect::new(
                out_rect.x1 - self.dx,
                out_rect.y1 - self.dy,
                out_rect.x2 - self.dx,
                out_rect.y2 - self.dy,
            ),
        )])
    }

    fn transform_at(&self, _time: f64, _view: i32) -> Option<TransformDecl> {
        Some(TransformDecl {
            input: 0,
            matrix: kurbo::Affine::translate((self.dx, self.dy)),
        })
    }

    fn can_concatenate_transforms(&self) -> bool {
        true
    }

    fn render(&self, args: &RenderActionArgs<'_>, planes: &mut [ScratchPlane]) -> SmaltResult<()> {
        let s = args.mapped_scale;
        // When input 0 was rerouted past a transform chain, the chain's
        // combined offset composes with the local one.
        let (cdx, cdy) = match args.input_transforms.get(&0) {
            Some(m) => {
                let t = m.translation();
                (self.dx + t.x, self.dy + t.y)
            }
            None => (self.dx, self.dy),
        };
        let (dx, dy) = ((cdx * s).round() as i64, (cdy * s).round() as i64);
        for plane in planes {
            let src = args
                .inputs
                .get_image(0, args.time, args.view, &plane.plane)?;
            let mut shifted = args.rect;
            shifted.x1 -= dx;
            shifted.y1 -= dy;
            shifted.x2 -= dx;
            shifted.y2 -= dy;
            let input = src.read_rect(&shifted)?;
            let n = plane.plane.components.count();
            for y in args.rect.y1..args.rect.y2 {
                for x in args.rect.x1..args.rect.x2 {
                    for c in 0..n {
                        plane.put(x, y, c, input.get(x - dx, y - dy, c));
                    }
                }
            }
        }
        Ok(())
    }

    fn safety(&self) -> RenderSafety {
        RenderSafety::FullySafe
    }
}
