//! Cached images: metadata, growable pixel storage and the tri-state
//! rendering bitmap.
//!
//! Pixel writes go through scratch planes: a worker renders into a private
//! buffer and pastes it under the image lock, so partially written tiles are
//! never observable while their cells are in the `rendering` state.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::foundation::error::{SmaltError, SmaltResult};
use crate::foundation::geom::{CanonicalRect, PixelRect};
use crate::foundation::hash::{NodeHash, StableHasher};
use crate::graph::effect::FramesNeeded;
use crate::graph::plane::{BitDepth, Components, Plane, PlaneLayer};

/// Rendering state of one pixel in the bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TileState {
    Unrendered = 0,
    Rendering = 1,
    Rendered = 2,
}

/// Content address of a plane instance in the store.
#[derive(Clone, Debug)]
pub struct ImageKey {
    pub node_hash: NodeHash,
    pub layer: PlaneLayer,
    pub time: f64,
    pub view: i32,
    pub mip_level: u32,
    /// When false, output does not depend on time and lookups ignore it.
    pub frame_varying: bool,
}

impl ImageKey {
    fn time_bits(&self) -> u64 {
        if self.frame_varying {
            self.time.to_bits()
        } else {
            0
        }
    }

    /// Stable 64-bit digest, used to address disk-cache entries.
    pub fn digest(&self) -> u64 {
        let mut h = StableHasher::new();
        h.write_u64(self.node_hash.0);
        self.layer.fold(&mut h);
        h.write_u64(self.time_bits());
        h.write_i32(self.view);
        h.write_u32(self.mip_level);
        h.write_bool(self.frame_varying);
        h.finish()
    }
}

impl PartialEq for ImageKey {
    fn eq(&self, other: &Self) -> bool {
        self.node_hash == other.node_hash
            && self.layer == other.layer
            && self.time_bits() == other.time_bits()
            && self.view == other.view
            && self.mip_level == other.mip_level
            && self.frame_varying == other.frame_varying
    }
}

impl Eq for ImageKey {}

impl std::hash::Hash for ImageKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_hash.0.hash(state);
        self.layer.hash(state);
        self.time_bits().hash(state);
        self.view.hash(state);
        self.mip_level.hash(state);
        self.frame_varying.hash(state);
    }
}

/// Non-key metadata stored beside the pixels.
#[derive(Clone, Debug)]
pub struct ImageParams {
    pub rod: CanonicalRect,
    pub bounds: PixelRect,
    pub components: Components,
    pub depth: BitDepth,
    pub par: f64,
    /// True when the RoD fell back to the project default format; such
    /// entries are invalidated when the project format changes.
    pub rod_is_project_format: bool,
    /// Frames-needed map computed when the image was first planned, reused
    /// on cache hits to skip the action.
    pub frames_needed: FramesNeeded,
}

struct ImageState {
    bounds: PixelRect,
    allocated: bool,
    pixels: Vec<u8>,
    bitmap: Option<Vec<u8>>,
}

static NEXT_IMAGE_SERIAL: AtomicU64 = AtomicU64::new(1);

/// One plane instance. Shared across threads through `Arc`; interior state
/// (bounds, pixels, bitmap) is guarded by a single short-held lock.
pub struct Image {
    key: ImageKey,
    params: ImageParams,
    serial: u64,
    uses_bitmap: bool,
    state: Mutex<ImageState>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("key", &self.key)
            .field("bounds", &self.bounds())
            .field("serial", &self.serial)
            .finish()
    }
}

impl Image {
    pub fn new(key: ImageKey, params: ImageParams, uses_bitmap: bool) -> Self {
        let bounds = params.bounds;
        Self {
            key,
            params,
            serial: NEXT_IMAGE_SERIAL.fetch_add(1, Ordering::Relaxed),
            uses_bitmap,
            state: Mutex::new(ImageState {
                bounds,
                allocated: false,
                pixels: Vec::new(),
                bitmap: None,
            }),
        }
    }

    pub fn key(&self) -> &ImageKey {
        &self.key
    }

    pub fn params(&self) -> &ImageParams {
        &self.params
    }

    /// Unique identity of this instance, for tri-map keying and
    /// pointer-identity comparisons after a cache re-lookup.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn uses_bitmap(&self) -> bool {
        self.uses_bitmap
    }

    pub fn components(&self) -> Components {
        self.params.components
    }

    pub fn depth(&self) -> BitDepth {
        self.params.depth
    }

    pub fn mip_level(&self) -> u32 {
        self.key.mip_level
    }

    pub fn par(&self) -> f64 {
        self.params.par
    }

    pub fn rod(&self) -> CanonicalRect {
        self.params.rod
    }

    pub fn bounds(&self) -> PixelRect {
        self.state.lock().expect("image lock").bounds
    }

    fn pixel_byte_len(&self, bounds: &PixelRect) -> usize {
        bounds.area() as usize * self.params.components.count() * self.params.depth.byte_size()
    }

    /// Resident bytes, for cache accounting (pixels + bitmap).
    pub fn byte_size(&self) -> usize {
        let st = self.state.lock().expect("image lock");
        st.pixels.len() + st.bitmap.as_ref().map_or(0, Vec::len)
    }

    /// Allocate the pixel buffer (and bitmap). Idempotent; racing callers
    /// are fine, exactly one allocates.
    pub fn allocate(&self) -> SmaltResult<()> {
        let mut st = self.state.lock().expect("image lock");
        if st.allocated {
            return Ok(());
        }
        let len = self.pixel_byte_len(&st.bounds.clone());
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|_| SmaltError::allocation(format!("pixel buffer of {len} bytes")))?;
        pixels.resize(len, 0);
        if self.uses_bitmap {
            let cells = st.bounds.area() as usize;
            let mut bitmap = Vec::new();
            bitmap
                .try_reserve_exact(cells)
                .map_err(|_| SmaltError::allocation(format!("tile bitmap of {cells} cells")))?;
            bitmap.resize(cells, TileState::Unrendered as u8);
            st.bitmap = Some(bitmap);
        }
        st.pixels = pixels;
        st.allocated = true;
        Ok(())
    }

    /// Grow storage to cover `bounds() ∪ new_bounds`, preserving pixel
    /// values and bitmap states. Never shrinks.
    pub fn ensure_bounds(&self, new_bounds: &PixelRect) -> SmaltResult<()> {
        let mut st = self.state.lock().expect("image lock");
        if st.bounds.contains(new_bounds) {
            return Ok(());
        }
        let merged = st.bounds.union(new_bounds);
        if !st.allocated {
            st.bounds = merged;
            return Ok(());
        }
        let comps = self.params.components.count();
        let depth = self.params.depth.byte_size();
        let px = comps * depth;
        let mut pixels = vec![0u8; merged.area() as usize * px];
        let mut bitmap = self
            .uses_bitmap
            .then(|| vec![TileState::Unrendered as u8; merged.area() as usize]);

        let old = st.bounds;
        let old_row = old.width() as usize;
        let new_row = merged.width() as usize;
        for y in old.y1..old.y2 {
            let src_off = ((y - old.y1) as usize) * old_row;
            let dst_off = ((y - merged.y1) as usize) * new_row + (old.x1 - merged.x1) as usize;
            pixels[dst_off * px..(dst_off + old_row) * px]
                .copy_from_slice(&st.pixels[src_off * px..(src_off + old_row) * px]);
            if let (Some(new_bm), Some(old_bm)) = (bitmap.as_mut(), st.bitmap.as_ref()) {
                new_bm[dst_off..dst_off + old_row]
                    .copy_from_slice(&old_bm[src_off..src_off + old_row]);
            }
        }
        st.pixels = pixels;
        st.bitmap = bitmap;
        st.bounds = merged;
        Ok(())
    }

    fn with_bitmap<R>(&self, f: impl FnOnce(&mut Vec<u8>, PixelRect) -> R) -> Option<R> {
        let mut st = self.state.lock().expect("image lock");
        let bounds = st.bounds;
        st.bitmap.as_mut().map(|bm| f(bm, bounds))
    }

    fn for_each_cell(bm: &mut [u8], bounds: PixelRect, rect: &PixelRect, mut f: impl FnMut(&mut u8)) {
        let Some(r) = rect.intersect(&bounds) else {
            return;
        };
        let row = bounds.width() as usize;
        for y in r.y1..r.y2 {
            let base = ((y - bounds.y1) as usize) * row;
            let x0 = (r.x1 - bounds.x1) as usize;
            let x1 = (r.x2 - bounds.x1) as usize;
            for c in &mut bm[base + x0..base + x1] {
                f(c);
            }
        }
    }

    /// Transition covered `unrendered` cells to `rendering`.
    pub fn mark_for_rendering(&self, rect: &PixelRect) {
        let _ = self.with_bitmap(|bm, bounds| {
            Self::for_each_cell(bm, bounds, rect, |c| {
                if *c == TileState::Unrendered as u8 {
                    *c = TileState::Rendering as u8;
                }
            });
        });
    }

    /// Transition covered cells to `rendered`, making their pixels readable.
    pub fn mark_rendered(&self, rect: &PixelRect) {
        let _ = self.with_bitmap(|bm, bounds| {
            Self::for_each_cell(bm, bounds, rect, |c| *c = TileState::Rendered as u8);
        });
    }

    /// Revert covered `rendering` cells to `unrendered` after a failure or
    /// abort.
    pub fn clear_bitmap(&self, rect: &PixelRect) {
        let _ = self.with_bitmap(|bm, bounds| {
            Self::for_each_cell(bm, bounds, rect, |c| {
                if *c == TileState::Rendering as u8 {
                    *c = TileState::Unrendered as u8;
                }
            });
        });
    }

    fn runs_where(
        bm: &[u8],
        bounds: PixelRect,
        rect: &PixelRect,
        pred: impl Fn(u8) -> bool,
    ) -> Vec<PixelRect> {
        let Some(r) = rect.intersect(&bounds) else {
            return Vec::new();
        };
        let row = bounds.width() as usize;
        // Row runs, merged with the previous row when horizontally equal.
        let mut out: Vec<PixelRect> = Vec::new();
        for y in r.y1..r.y2 {
            let base = ((y - bounds.y1) as usize) * row;
            let mut x = r.x1;
            while x < r.x2 {
                let v = bm[base + (x - bounds.x1) as usize];
                if !pred(v) {
                    x += 1;
                    continue;
                }
                let start = x;
                while x < r.x2 && pred(bm[base + (x - bounds.x1) as usize]) {
                    x += 1;
                }
                let run = PixelRect::new(start, y, x, y + 1);
                if let Some(last) = out.last_mut()
                    && last.x1 == run.x1
                    && last.x2 == run.x2
                    && last.y2 == run.y1
                {
                    last.y2 = run.y2;
                } else {
                    out.push(run);
                }
            }
        }
        out
    }

    /// Rectangles inside `rect` whose cells are not yet `rendered`.
    ///
    /// Without a bitmap the whole `rect` is reported when unallocated.
    pub fn rest_to_render(&self, rect: &PixelRect) -> Vec<PixelRect> {
        self.with_bitmap(|bm, bounds| {
            Self::runs_where(bm, bounds, rect, |v| v != TileState::Rendered as u8)
        })
        .unwrap_or_else(|| vec![*rect])
    }

    /// Tri-map variant: only `unrendered` cells are reported as work; cells
    /// currently `rendering` by a peer set the second flag instead.
    pub fn rest_to_render_trimap(&self, rect: &PixelRect) -> (Vec<PixelRect>, bool) {
        self.with_bitmap(|bm, bounds| {
            let rest = Self::runs_where(bm, bounds, rect, |v| v == TileState::Unrendered as u8);
            let mut elsewhere = false;
            Self::for_each_cell(bm, bounds, rect, |c| {
                elsewhere |= *c == TileState::Rendering as u8;
            });
            (rest, elsewhere)
        })
        .unwrap_or_else(|| (vec![*rect], false))
    }

    fn minimal_where(
        bm: &[u8],
        bounds: PixelRect,
        rect: &PixelRect,
        pred: impl Fn(u8) -> bool,
    ) -> PixelRect {
        let Some(r) = rect.intersect(&bounds) else {
            return PixelRect::EMPTY;
        };
        let row = bounds.width() as usize;
        let (mut x1, mut y1, mut x2, mut y2) = (i64::MAX, i64::MAX, i64::MIN, i64::MIN);
        for y in r.y1..r.y2 {
            let base = ((y - bounds.y1) as usize) * row;
            for x in r.x1..r.x2 {
                if pred(bm[base + (x - bounds.x1) as usize]) {
                    x1 = x1.min(x);
                    y1 = y1.min(y);
                    x2 = x2.max(x + 1);
                    y2 = y2.max(y + 1);
                }
            }
        }
        if x2 <= x1 {
            PixelRect::EMPTY
        } else {
            PixelRect::new(x1, y1, x2, y2)
        }
    }

    /// Bounding rectangle of the not-yet-rendered cells of `rect`.
    pub fn minimal_rect(&self, rect: &PixelRect) -> PixelRect {
        self.with_bitmap(|bm, bounds| {
            Self::minimal_where(bm, bounds, rect, |v| v != TileState::Rendered as u8)
        })
        .unwrap_or(*rect)
    }

    /// Tri-map variant of [`Image::minimal_rect`]: bounding rectangle of
    /// `unrendered` cells, plus whether a peer is rendering inside `rect`.
    pub fn minimal_rect_trimap(&self, rect: &PixelRect) -> (PixelRect, bool) {
        self.with_bitmap(|bm, bounds| {
            let min = Self::minimal_where(bm, bounds, rect, |v| v == TileState::Unrendered as u8);
            let mut elsewhere = false;
            Self::for_each_cell(bm, bounds, rect, |c| {
                elsewhere |= *c == TileState::Rendering as u8;
            });
            (min, elsewhere)
        })
        .unwrap_or((*rect, false))
    }

    /// Count of cells currently in a given state, for invariant checks.
    pub fn count_cells(&self, state: TileState) -> usize {
        self.with_bitmap(|bm, _| bm.iter().filter(|&&v| v == state as u8).count())
            .unwrap_or(0)
    }

    fn sample_to_bytes(depth: BitDepth, v: f32, out: &mut [u8]) {
        match depth {
            BitDepth::U8 => out[0] = (v.clamp(0.0, 1.0) * 255.0).round() as u8,
            BitDepth::U16 => {
                out[..2].copy_from_slice(&(((v.clamp(0.0, 1.0)) * 65535.0).round() as u16).to_le_bytes());
            }
            BitDepth::F32 => out[..4].copy_from_slice(&v.to_le_bytes()),
        }
    }

    fn sample_from_bytes(depth: BitDepth, bytes: &[u8]) -> f32 {
        match depth {
            BitDepth::U8 => f32::from(bytes[0]) / 255.0,
            BitDepth::U16 => f32::from(u16::from_le_bytes([bytes[0], bytes[1]])) / 65535.0,
            BitDepth::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Paste a scratch plane into this image over `rect` (which must be
    /// inside both the scratch bounds and the image bounds), converting
    /// components and depth as needed.
    pub fn paste_scratch(&self, scratch: &ScratchPlane, rect: &PixelRect) -> SmaltResult<()> {
        let mut st = self.state.lock().expect("image lock");
        if !st.allocated {
            return Err(SmaltError::invariant("paste into unallocated image"));
        }
        let Some(r) = rect.intersect(&st.bounds).and_then(|r| r.intersect(&scratch.bounds)) else {
            return Ok(());
        };
        let dst_comps = self.params.components.count();
        let src_comps = scratch.plane.components.count();
        let depth = self.params.depth;
        let px = dst_comps * depth.byte_size();
        let dst_row = st.bounds.width() as usize;
        let src_row = scratch.bounds.width() as usize;
        let bounds = st.bounds;
        for y in r.y1..r.y2 {
            let dst_base = (((y - bounds.y1) as usize) * dst_row) * px;
            let src_base = ((y - scratch.bounds.y1) as usize) * src_row * src_comps;
            for x in r.x1..r.x2 {
                let d = dst_base + ((x - bounds.x1) as usize) * px;
                let s = src_base + ((x - scratch.bounds.x1) as usize) * src_comps;
                for c in 0..dst_comps {
                    let v = map_component(
                        &scratch.samples[s..s + src_comps],
                        scratch.plane.components,
                        self.params.components,
                        c,
                    );
                    let off = d + c * depth.byte_size();
                    Self::sample_to_bytes(depth, v, &mut st.pixels[off..off + depth.byte_size()]);
                }
            }
        }
        Ok(())
    }

    /// Read `rect` into a scratch plane with this image's components.
    pub fn read_rect(&self, rect: &PixelRect) -> SmaltResult<ScratchPlane> {
        let st = self.state.lock().expect("image lock");
        let comps = self.params.components;
        let mut out = ScratchPlane::new(
            Plane {
                layer: self.key.layer.clone(),
                components: comps,
            },
            *rect,
        );
        if !st.allocated {
            return Ok(out);
        }
        let Some(r) = rect.intersect(&st.bounds) else {
            return Ok(out);
        };
        let n = comps.count();
        let depth = self.params.depth;
        let px = n * depth.byte_size();
        let src_row = st.bounds.width() as usize;
        for y in r.y1..r.y2 {
            let src_base = ((y - st.bounds.y1) as usize) * src_row * px;
            for x in r.x1..r.x2 {
                let s = src_base + ((x - st.bounds.x1) as usize) * px;
                for c in 0..n {
                    let off = s + c * depth.byte_size();
                    let v = Self::sample_from_bytes(depth, &st.pixels[off..off + depth.byte_size()]);
                    out.put(x, y, c, v);
                }
            }
        }
        Ok(out)
    }

    /// Raw pixel bytes, row-major over the current bounds. For the disk
    /// codec and bit-equality tests.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.state.lock().expect("image lock").pixels.clone()
    }

    /// Overwrite the full pixel buffer from raw bytes (disk-cache load).
    pub fn load_bytes(&self, bytes: &[u8]) -> SmaltResult<()> {
        self.allocate()?;
        let mut st = self.state.lock().expect("image lock");
        if st.pixels.len() != bytes.len() {
            return Err(SmaltError::invalid(format!(
                "pixel payload of {} bytes does not match buffer of {}",
                bytes.len(),
                st.pixels.len()
            )));
        }
        st.pixels.copy_from_slice(bytes);
        Ok(())
    }

    /// Box-filter this image down into `dst` (a lower-resolution sibling)
    /// over the canonical region both share.
    pub fn downscale_into(&self, dst: &Image, dst_rect: &PixelRect) -> SmaltResult<()> {
        let level_delta = dst.mip_level().saturating_sub(self.mip_level());
        let factor = 1i64 << level_delta.min(31);
        let src_rect = dst_rect.upscale_po2(level_delta);
        let src = self.read_rect(&src_rect)?;
        let comps = dst.components().count().min(self.components().count());
        let mut out = ScratchPlane::new(
            Plane {
                layer: dst.key().layer.clone(),
                components: dst.components(),
            },
            *dst_rect,
        );
        for y in dst_rect.y1..dst_rect.y2 {
            for x in dst_rect.x1..dst_rect.x2 {
                for c in 0..comps {
                    let mut acc = 0.0f32;
                    let mut n = 0.0f32;
                    for sy in (y * factor)..((y + 1) * factor) {
                        for sx in (x * factor)..((x + 1) * factor) {
                            if src.bounds.contains_point(sx, sy) {
                                acc += src.get(sx, sy, c);
                                n += 1.0;
                            }
                        }
                    }
                    out.put(x, y, c, if n > 0.0 { acc / n } else { 0.0 });
                }
            }
        }
        dst.paste_scratch(&out, dst_rect)
    }

    /// Scan `rect` for non-finite float samples. Returns true when any were
    /// found (the caller logs; the tile still counts as rendered).
    pub fn scratch_has_nans(scratch: &ScratchPlane) -> bool {
        scratch.samples.iter().any(|v| !v.is_finite())
    }
}

/// Map one destination component from a source sample, converting within the
/// color family (alpha expands to opaque gray, RGB gains opaque alpha).
fn map_component(src: &[f32], from: Components, to: Components, dst_c: usize) -> f32 {
    use Components::*;
    match (from, to) {
        (a, b) if a == b => src[dst_c],
        (Alpha, Rgb) => src[0],
        (Alpha, Rgba) => {
            if dst_c < 3 {
                src[0]
            } else {
                1.0
            }
        }
        (Rgb, Rgba) => {
            if dst_c < 3 {
                src[dst_c]
            } else {
                1.0
            }
        }
        (Rgba, Rgb) => src[dst_c],
        (Rgb, Alpha) | (Rgba, Alpha) => {
            // Luminance-free collapse: take the first channel.
            src[0]
        }
        _ => 0.0,
    }
}

/// A private float buffer an effect draws into before the result is pasted
/// into the shared image.
#[derive(Clone, Debug)]
pub struct ScratchPlane {
    pub plane: Plane,
    pub bounds: PixelRect,
    pub samples: Vec<f32>,
}

impl ScratchPlane {
    pub fn new(plane: Plane, bounds: PixelRect) -> Self {
        let len = bounds.area() as usize * plane.components.count();
        Self {
            plane,
            bounds,
            samples: vec![0.0; len],
        }
    }

    fn idx(&self, x: i64, y: i64, c: usize) -> usize {
        debug_assert!(self.bounds.contains_point(x, y));
        let row = self.bounds.width() as usize;
        let n = self.plane.components.count();
        (((y - self.bounds.y1) as usize) * row + (x - self.bounds.x1) as usize) * n + c
    }

    pub fn put(&mut self, x: i64, y: i64, c: usize, v: f32) {
        let i = self.idx(x, y, c);
        self.samples[i] = v;
    }

    pub fn get(&self, x: i64, y: i64, c: usize) -> f32 {
        if !self.bounds.contains_point(x, y) {
            return 0.0;
        }
        self.samples[self.idx(x, y, c)]
    }

    pub fn fill(&mut self, v: &[f32]) {
        let n = self.plane.components.count();
        for (i, s) in self.samples.iter_mut().enumerate() {
            *s = v[i % n];
        }
    }
}

/// Output of one `render_region` call: the produced plane images.
pub type PlaneImages = SmallVec<[std::sync::Arc<Image>; 2]>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(mip: u32) -> ImageKey {
        ImageKey {
            node_hash: NodeHash(7),
            layer: PlaneLayer::Color,
            time: 3.0,
            view: 0,
            mip_level: mip,
            frame_varying: true,
        }
    }

    fn test_image(bounds: PixelRect, bitmap: bool) -> Image {
        let img = Image::new(
            test_key(0),
            ImageParams {
                rod: bounds.to_canonical(0, 1.0),
                bounds,
                components: Components::Rgba,
                depth: BitDepth::F32,
                par: 1.0,
                rod_is_project_format: false,
                frames_needed: FramesNeeded::default(),
            },
            bitmap,
        );
        img.allocate().unwrap();
        img
    }

    #[test]
    fn key_ignores_time_when_not_frame_varying() {
        let mut a = test_key(0);
        let mut b = test_key(0);
        a.frame_varying = false;
        b.frame_varying = false;
        b.time = 99.0;
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn allocate_is_idempotent() {
        let img = test_image(PixelRect::new(0, 0, 4, 4), true);
        let size = img.byte_size();
        img.allocate().unwrap();
        assert_eq!(img.byte_size(), size);
    }

    #[test]
    fn bitmap_transitions_and_rest_to_render() {
        let img = test_image(PixelRect::new(0, 0, 8, 8), true);
        let left = PixelRect::new(0, 0, 4, 8);
        img.mark_for_rendering(&left);
        assert_eq!(img.count_cells(TileState::Rendering), 32);

        let (rest, elsewhere) = img.rest_to_render_trimap(&PixelRect::new(0, 0, 8, 8));
        assert!(elsewhere);
        assert_eq!(rest, vec![PixelRect::new(4, 0, 8, 8)]);

        img.mark_rendered(&left);
        assert_eq!(img.count_cells(TileState::Rendering), 0);
        let rest = img.rest_to_render(&PixelRect::new(0, 0, 8, 8));
        assert_eq!(rest, vec![PixelRect::new(4, 0, 8, 8)]);
    }

    #[test]
    fn clear_reverts_only_rendering_cells() {
        let img = test_image(PixelRect::new(0, 0, 4, 1), true);
        img.mark_rendered(&PixelRect::new(0, 0, 2, 1));
        img.mark_for_rendering(&PixelRect::new(2, 0, 4, 1));
        img.clear_bitmap(&PixelRect::new(0, 0, 4, 1));
        assert_eq!(img.count_cells(TileState::Rendered), 2);
        assert_eq!(img.count_cells(TileState::Rendering), 0);
        assert_eq!(img.count_cells(TileState::Unrendered), 2);
    }

    #[test]
    fn ensure_bounds_unions_and_preserves() {
        let img = test_image(PixelRect::new(0, 0, 2, 2), true);
        let mut s = ScratchPlane::new(Plane::rgba(), PixelRect::new(0, 0, 2, 2));
        s.fill(&[0.5, 0.25, 0.125, 1.0]);
        img.paste_scratch(&s, &PixelRect::new(0, 0, 2, 2)).unwrap();
        img.mark_rendered(&PixelRect::new(0, 0, 2, 2));

        img.ensure_bounds(&PixelRect::new(2, 0, 4, 2)).unwrap();
        img.ensure_bounds(&PixelRect::new(0, 2, 2, 4)).unwrap();
        assert_eq!(img.bounds(), PixelRect::new(0, 0, 4, 4));

        // Old pixels and bitmap state survive the two grows.
        let back = img.read_rect(&PixelRect::new(0, 0, 2, 2)).unwrap();
        assert_eq!(back.get(1, 1, 0), 0.5);
        assert_eq!(back.get(1, 1, 3), 1.0);
        assert_eq!(img.count_cells(TileState::Rendered), 4);

        // Same final bounds as a single union'd call.
        let img2 = test_image(PixelRect::new(0, 0, 2, 2), true);
        img2.ensure_bounds(&PixelRect::new(0, 0, 4, 4)).unwrap();
        assert_eq!(img.bounds(), img2.bounds());
    }

    #[test]
    fn paste_converts_components() {
        let key = test_key(0);
        let img = Image::new(
            key,
            ImageParams {
                rod: CanonicalRect::new(0.0, 0.0, 2.0, 1.0),
                bounds: PixelRect::new(0, 0, 2, 1),
                components: Components::Rgba,
                depth: BitDepth::U8,
                par: 1.0,
                rod_is_project_format: false,
                frames_needed: FramesNeeded::default(),
            },
            false,
        );
        img.allocate().unwrap();
        let mut s = ScratchPlane::new(Plane::rgb(), PixelRect::new(0, 0, 2, 1));
        s.fill(&[1.0, 0.0, 0.0]);
        img.paste_scratch(&s, &PixelRect::new(0, 0, 2, 1)).unwrap();
        let back = img.read_rect(&PixelRect::new(0, 0, 2, 1)).unwrap();
        assert_eq!(back.get(0, 0, 0), 1.0);
        // Alpha synthesized as opaque.
        assert_eq!(back.get(0, 0, 3), 1.0);
    }

    #[test]
    fn downscale_box_filters() {
        let src = test_image(PixelRect::new(0, 0, 4, 4), false);
        let mut s = ScratchPlane::new(Plane::rgba(), PixelRect::new(0, 0, 4, 4));
        for y in 0..4 {
            for x in 0..4 {
                // Left half 1.0, right half 0.0.
                s.put(x, y, 0, if x < 2 { 1.0 } else { 0.0 });
                s.put(x, y, 3, 1.0);
            }
        }
        src.paste_scratch(&s, &PixelRect::new(0, 0, 4, 4)).unwrap();

        let dst = Image::new(
            test_key(1),
            ImageParams {
                rod: CanonicalRect::new(0.0, 0.0, 4.0, 4.0),
                bounds: PixelRect::new(0, 0, 2, 2),
                components: Components::Rgba,
                depth: BitDepth::F32,
                par: 1.0,
                rod_is_project_format: false,
                frames_needed: FramesNeeded::default(),
            },
            false,
        );
        dst.allocate().unwrap();
        src.downscale_into(&dst, &PixelRect::new(0, 0, 2, 2)).unwrap();
        let back = dst.read_rect(&PixelRect::new(0, 0, 2, 2)).unwrap();
        assert_eq!(back.get(0, 0, 0), 1.0);
        assert_eq!(back.get(1, 0, 0), 0.0);
        assert_eq!(back.get(0, 1, 3), 1.0);
    }

    #[test]
    fn nan_scan_detects_bad_samples() {
        let mut s = ScratchPlane::new(Plane::rgba(), PixelRect::new(0, 0, 2, 1));
        assert!(!Image::scratch_has_nans(&s));
        s.put(1, 0, 2, f32::NAN);
        assert!(Image::scratch_has_nans(&s));
    }
}
