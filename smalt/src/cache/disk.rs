//! Persistent image cache with a bit-exact on-disk layout.
//!
//! Each entry is one file: a little-endian header (magic, version, key
//! fields, RoD, bounds, mipmap level, bit depth, components, pixel aspect
//! ratio, payload checksum) followed by raw pixels in row-major order.
//! Files are addressed by the image-key digest; eviction is LRU by access.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::image::{Image, ImageKey, ImageParams};
use crate::foundation::error::{SmaltError, SmaltResult};
use crate::foundation::geom::{CanonicalRect, PixelRect};
use crate::foundation::hash::{NodeHash, StableHasher};
use crate::graph::effect::FramesNeeded;
use crate::graph::plane::{BitDepth, Components, PlaneLayer};

const MAGIC: u32 = 0x534D_4C54; // "SMLT"
const VERSION: u32 = 1;

fn components_tag(c: Components) -> u8 {
    match c {
        Components::Alpha => 0,
        Components::Xy => 1,
        Components::Rgb => 2,
        Components::Rgba => 3,
    }
}

fn components_from_tag(t: u8) -> SmaltResult<Components> {
    Ok(match t {
        0 => Components::Alpha,
        1 => Components::Xy,
        2 => Components::Rgb,
        3 => Components::Rgba,
        _ => return Err(SmaltError::serde(format!("bad components tag {t}"))),
    })
}

fn depth_tag(d: BitDepth) -> u8 {
    match d {
        BitDepth::U8 => 0,
        BitDepth::U16 => 1,
        BitDepth::F32 => 2,
    }
}

fn depth_from_tag(t: u8) -> SmaltResult<BitDepth> {
    Ok(match t {
        0 => BitDepth::U8,
        1 => BitDepth::U16,
        2 => BitDepth::F32,
        _ => return Err(SmaltError::serde(format!("bad depth tag {t}"))),
    })
}

/// Serialize header + pixels. The layout is stable across platforms; every
/// multi-byte field is little-endian.
pub fn encode_entry(key: &ImageKey, params: &ImageParams, pixels: &[u8]) -> Vec<u8> {
    let mut checksum = StableHasher::new();
    checksum.write_bytes(pixels);

    let mut out = Vec::with_capacity(128 + pixels.len());
    let w = &mut out;
    w.extend_from_slice(&MAGIC.to_le_bytes());
    w.extend_from_slice(&VERSION.to_le_bytes());
    w.extend_from_slice(&key.digest().to_le_bytes());
    w.extend_from_slice(&key.node_hash.0.to_le_bytes());
    w.extend_from_slice(&key.time.to_bits().to_le_bytes());
    w.extend_from_slice(&key.view.to_le_bytes());
    w.extend_from_slice(&key.mip_level.to_le_bytes());
    w.push(u8::from(key.frame_varying));
    match &key.layer {
        PlaneLayer::Color => {
            w.push(0);
            w.extend_from_slice(&0u32.to_le_bytes());
        }
        PlaneLayer::Aux(name) => {
            w.push(1);
            w.extend_from_slice(&(name.len() as u32).to_le_bytes());
            w.extend_from_slice(name.as_bytes());
        }
    }
    for v in [params.rod.x1, params.rod.y1, params.rod.x2, params.rod.y2] {
        w.extend_from_slice(&v.to_bits().to_le_bytes());
    }
    for v in [
        params.bounds.x1,
        params.bounds.y1,
        params.bounds.x2,
        params.bounds.y2,
    ] {
        w.extend_from_slice(&v.to_le_bytes());
    }
    w.push(components_tag(params.components));
    w.push(depth_tag(params.depth));
    w.push(u8::from(params.rod_is_project_format));
    w.extend_from_slice(&params.par.to_bits().to_le_bytes());
    w.extend_from_slice(&(pixels.len() as u64).to_le_bytes());
    w.extend_from_slice(&checksum.finish().to_le_bytes());
    w.extend_from_slice(pixels);
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> SmaltResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SmaltError::serde("truncated cache entry"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> SmaltResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> SmaltResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn i32(&mut self) -> SmaltResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> SmaltResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn i64(&mut self) -> SmaltResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn f64(&mut self) -> SmaltResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }
}

/// Deserialize one entry, verifying magic, version and checksum.
pub fn decode_entry(bytes: &[u8]) -> SmaltResult<(ImageKey, ImageParams, Vec<u8>)> {
    let mut c = Cursor { buf: bytes, pos: 0 };
    if c.u32()? != MAGIC {
        return Err(SmaltError::serde("bad cache magic"));
    }
    if c.u32()? != VERSION {
        return Err(SmaltError::serde("unsupported cache version"));
    }
    let digest = c.u64()?;
    let node_hash = NodeHash(c.u64()?);
    let time = c.f64()?;
    let view = c.i32()?;
    let mip_level = c.u32()?;
    let frame_varying = c.u8()? != 0;
    let layer = match c.u8()? {
        0 => {
            c.u32()?;
            PlaneLayer::Color
        }
        1 => {
            let len = c.u32()? as usize;
            let name = std::str::from_utf8(c.take(len)?)
                .map_err(|_| SmaltError::serde("bad plane name"))?;
            PlaneLayer::Aux(name.to_owned())
        }
        t => return Err(SmaltError::serde(format!("bad layer tag {t}"))),
    };
    let rod = CanonicalRect::new(c.f64()?, c.f64()?, c.f64()?, c.f64()?);
    let bounds = PixelRect::new(c.i64()?, c.i64()?, c.i64()?, c.i64()?);
    let components = components_from_tag(c.u8()?)?;
    let depth = depth_from_tag(c.u8()?)?;
    let rod_is_project_format = c.u8()? != 0;
    let par = c.f64()?;
    let payload_len = c.u64()? as usize;
    let checksum = c.u64()?;
    let pixels = c.take(payload_len)?.to_vec();

    let mut h = StableHasher::new();
    h.write_bytes(&pixels);
    if h.finish() != checksum {
        return Err(SmaltError::serde("cache entry checksum mismatch"));
    }

    let key = ImageKey {
        node_hash,
        layer,
        time,
        view,
        mip_level,
        frame_varying,
    };
    if key.digest() != digest {
        return Err(SmaltError::serde("cache entry key digest mismatch"));
    }
    let params = ImageParams {
        rod,
        bounds,
        components,
        depth,
        par,
        rod_is_project_format,
        frames_needed: FramesNeeded::default(),
    };
    Ok((key, params, pixels))
}

struct DiskEntry {
    path: PathBuf,
    bytes: u64,
    touch: u64,
    node_hash: NodeHash,
}

struct DiskInner {
    index: HashMap<u64, DiskEntry>,
    tick: u64,
}

/// LRU-evicting persistent cache rooted at one directory.
pub struct DiskCache {
    root: PathBuf,
    max_bytes: u64,
    inner: Mutex<DiskInner>,
}

impl DiskCache {
    /// Open (and index) the cache at `root`, creating the directory if
    /// needed. Unreadable entries are ignored.
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64) -> SmaltResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let mut index = HashMap::new();
        let mut tick = 0u64;
        for dirent in std::fs::read_dir(&root)? {
            let dirent = dirent?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("smimg") {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let Ok((key, _, _)) = decode_entry(&bytes) else {
                tracing::warn!(path = %path.display(), "dropping unreadable cache entry");
                let _ = std::fs::remove_file(&path);
                continue;
            };
            tick += 1;
            index.insert(
                key.digest(),
                DiskEntry {
                    path,
                    bytes: bytes.len() as u64,
                    touch: tick,
                    node_hash: key.node_hash,
                },
            );
        }
        Ok(Self {
            root,
            max_bytes,
            inner: Mutex::new(DiskInner { index, tick }),
        })
    }

    fn entry_path(&self, digest: u64) -> PathBuf {
        self.root.join(format!("{digest:016x}.smimg"))
    }

    /// Persist `image`'s current pixels.
    pub fn save(&self, image: &Image) -> SmaltResult<()> {
        let pixels = image.snapshot_bytes();
        let mut params = image.params().clone();
        params.bounds = image.bounds();
        let blob = encode_entry(image.key(), &params, &pixels);
        let digest = image.key().digest();
        let path = self.entry_path(digest);
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&blob)?;

        let mut inner = self.inner.lock().expect("disk cache lock");
        inner.tick += 1;
        let tick = inner.tick;
        inner.index.insert(
            digest,
            DiskEntry {
                path,
                bytes: blob.len() as u64,
                touch: tick,
                node_hash: image.key().node_hash,
            },
        );
        self.evict_to_budget_locked(&mut inner);
        Ok(())
    }

    /// Fetch the entry for `key`, if present and intact.
    pub fn load(&self, key: &ImageKey) -> SmaltResult<Option<(ImageParams, Vec<u8>)>> {
        let digest = key.digest();
        let path = {
            let mut inner = self.inner.lock().expect("disk cache lock");
            inner.tick += 1;
            let tick = inner.tick;
            match inner.index.get_mut(&digest) {
                Some(e) => {
                    e.touch = tick;
                    e.path.clone()
                }
                None => return Ok(None),
            }
        };
        let mut bytes = Vec::new();
        match std::fs::File::open(&path) {
            Ok(mut f) => {
                f.read_to_end(&mut bytes)?;
            }
            Err(_) => {
                self.forget(digest);
                return Ok(None);
            }
        }
        match decode_entry(&bytes) {
            Ok((stored_key, params, pixels)) if &stored_key == key => Ok(Some((params, pixels))),
            Ok(_) | Err(_) => {
                tracing::warn!(path = %path.display(), "evicting mismatched cache entry");
                self.forget(digest);
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    /// Drop the entry for `key` (memory-cache authority after a project
    /// format change).
    pub fn evict(&self, key: &ImageKey) {
        let digest = key.digest();
        let path = {
            let mut inner = self.inner.lock().expect("disk cache lock");
            inner.index.remove(&digest).map(|e| e.path)
        };
        if let Some(path) = path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Drop every entry produced under `hash`.
    pub fn evict_all_with_hash(&self, hash: NodeHash) {
        let paths: Vec<PathBuf> = {
            let mut inner = self.inner.lock().expect("disk cache lock");
            let digests: Vec<u64> = inner
                .index
                .iter()
                .filter(|(_, e)| e.node_hash == hash)
                .map(|(d, _)| *d)
                .collect();
            digests
                .into_iter()
                .filter_map(|d| inner.index.remove(&d).map(|e| e.path))
                .collect()
        };
        for p in paths {
            let _ = std::fs::remove_file(p);
        }
    }

    fn forget(&self, digest: u64) {
        let mut inner = self.inner.lock().expect("disk cache lock");
        inner.index.remove(&digest);
    }

    fn evict_to_budget_locked(&self, inner: &mut DiskInner) {
        if self.max_bytes == 0 {
            return;
        }
        let mut total: u64 = inner.index.values().map(|e| e.bytes).sum();
        if total <= self.max_bytes {
            return;
        }
        let mut order: Vec<(u64, u64)> =
            inner.index.iter().map(|(d, e)| (e.touch, *d)).collect();
        order.sort_unstable();
        for (_, digest) in order {
            if total <= self.max_bytes {
                break;
            }
            if let Some(e) = inner.index.remove(&digest) {
                total = total.saturating_sub(e.bytes);
                let _ = std::fs::remove_file(e.path);
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::image::ScratchPlane;
    use crate::graph::plane::Plane;

    fn sample_image(hash: u64) -> Image {
        let bounds = PixelRect::new(0, 0, 4, 2);
        let img = Image::new(
            ImageKey {
                node_hash: NodeHash(hash),
                layer: PlaneLayer::Color,
                time: 2.0,
                view: 0,
                mip_level: 0,
                frame_varying: true,
            },
            ImageParams {
                rod: CanonicalRect::new(0.0, 0.0, 4.0, 2.0),
                bounds,
                components: Components::Rgba,
                depth: BitDepth::U16,
                par: 1.0,
                rod_is_project_format: false,
                frames_needed: FramesNeeded::default(),
            },
            false,
        );
        img.allocate().unwrap();
        let mut s = ScratchPlane::new(Plane::rgba(), bounds);
        s.fill(&[0.25, 0.5, 0.75, 1.0]);
        img.paste_scratch(&s, &bounds).unwrap();
        img
    }

    #[test]
    fn header_round_trip_is_bit_exact() {
        let img = sample_image(11);
        let blob = encode_entry(img.key(), img.params(), &img.snapshot_bytes());
        let (key, params, pixels) = decode_entry(&blob).unwrap();
        assert_eq!(&key, img.key());
        assert_eq!(params.bounds, img.bounds());
        assert_eq!(params.depth, BitDepth::U16);
        assert_eq!(pixels, img.snapshot_bytes());
        // Encoding again yields identical bytes.
        assert_eq!(encode_entry(&key, &params, &pixels), blob);
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let img = sample_image(12);
        let mut blob = encode_entry(img.key(), img.params(), &img.snapshot_bytes());
        let n = blob.len();
        blob[n - 1] ^= 0xff;
        assert!(decode_entry(&blob).is_err());
    }

    #[test]
    fn save_load_evict_cycle() {
        let dir = std::env::temp_dir().join(format!("smalt_disk_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let cache = DiskCache::open(&dir, u64::MAX).unwrap();
        let img = sample_image(13);
        cache.save(&img).unwrap();

        let (params, pixels) = cache.load(img.key()).unwrap().unwrap();
        assert_eq!(params.components, Components::Rgba);
        assert_eq!(pixels, img.snapshot_bytes());

        // Reopen finds the entry on disk.
        drop(cache);
        let cache = DiskCache::open(&dir, u64::MAX).unwrap();
        assert!(cache.load(img.key()).unwrap().is_some());

        cache.evict_all_with_hash(NodeHash(13));
        assert!(cache.load(img.key()).unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn lru_eviction_respects_budget() {
        let dir = std::env::temp_dir().join(format!("smalt_disk_lru_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let a = sample_image(21);
        let b = sample_image(22);
        let blob_len =
            encode_entry(a.key(), a.params(), &a.snapshot_bytes()).len() as u64;
        let cache = DiskCache::open(&dir, blob_len + blob_len / 2).unwrap();
        cache.save(&a).unwrap();
        cache.save(&b).unwrap();
        // Budget holds one entry; the older one was evicted.
        assert!(cache.load(a.key()).unwrap().is_none());
        assert!(cache.load(b.key()).unwrap().is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
