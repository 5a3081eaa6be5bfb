//! The shared, content-addressed image repository.
//!
//! Lookups are two-staged: an exact map keyed by everything except mipmap
//! level, components and depth, then a policy scan over the small candidate
//! list (component conversion on the color plane, higher-resolution sources,
//! depth floor). Reads are lock-free once a handle is out; the store lock is
//! never held while waiting on anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::image::{Image, ImageKey, ImageParams};
use crate::foundation::geom::CanonicalRect;
use crate::foundation::hash::NodeHash;
use crate::graph::plane::{BitDepth, Plane, PlaneLayer};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct LookupKey {
    node_hash: NodeHash,
    layer: PlaneLayer,
    time_bits: u64,
    view: i32,
    frame_varying: bool,
}

impl LookupKey {
    fn of(key: &ImageKey) -> Self {
        Self {
            node_hash: key.node_hash,
            layer: key.layer.clone(),
            time_bits: if key.frame_varying {
                key.time.to_bits()
            } else {
                0
            },
            view: key.view,
            frame_varying: key.frame_varying,
        }
    }
}

struct Entry {
    image: Arc<Image>,
    touch: u64,
}

struct StoreInner {
    map: HashMap<LookupKey, Vec<Entry>>,
    tick: u64,
}

/// Shared image cache with a byte budget and LRU eviction.
pub struct ImageStore {
    inner: Mutex<StoreInner>,
    max_bytes: usize,
}

impl ImageStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                map: HashMap::new(),
                tick: 0,
            }),
            max_bytes,
        }
    }

    /// Exact-key fetch or insert. Returns the image and whether it was
    /// created by this call. Params of an existing image are left untouched.
    pub fn get_or_create(
        &self,
        key: ImageKey,
        params: ImageParams,
        uses_bitmap: bool,
    ) -> (Arc<Image>, bool) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.map.entry(LookupKey::of(&key)).or_default();
        if let Some(e) = slot.iter_mut().find(|e| e.image.key() == &key) {
            e.touch = tick;
            return (e.image.clone(), false);
        }
        let image = Arc::new(Image::new(key, params, uses_bitmap));
        slot.push(Entry {
            image: image.clone(),
            touch: tick,
        });
        (image, true)
    }

    /// Exact-key fetch.
    pub fn get(&self, key: &ImageKey) -> Option<Arc<Image>> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.map.get_mut(&LookupKey::of(key))?;
        let e = slot.iter_mut().find(|e| e.image.key() == key)?;
        e.touch = tick;
        Some(e.image.clone())
    }

    /// Policy lookup for the evaluator's cache stage.
    ///
    /// - Exact components at the requested level always match.
    /// - On the color plane, convertible components are accepted when the
    ///   stored depth is at least the requested depth; a lower mipmap level
    ///   (higher resolution) is accepted as a downscale source, a higher one
    ///   never is.
    /// - Auxiliary planes require exact components and level.
    /// - Entries whose RoD depended on a project format other than
    ///   `project_format` are evicted on sight.
    pub fn find_compatible(
        &self,
        key: &ImageKey,
        requested: &Plane,
        requested_depth: BitDepth,
        project_format: &CanonicalRect,
    ) -> Option<Arc<Image>> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.map.get_mut(&LookupKey::of(key))?;

        slot.retain(|e| {
            let p = e.image.params();
            !(p.rod_is_project_format && p.rod != *project_format)
        });

        let mut best: Option<usize> = None;
        for (i, e) in slot.iter().enumerate() {
            let img = &e.image;
            let p = img.params();
            if !requested.components_convertible_from(p.components) {
                continue;
            }
            if p.depth < requested_depth {
                continue;
            }
            let level = img.key().mip_level;
            let acceptable_level = if requested.is_color() {
                level <= key.mip_level
            } else {
                level == key.mip_level
            };
            if !acceptable_level {
                continue;
            }
            // Prefer the closest resolution, then the first found.
            match best {
                Some(b) if slot[b].image.key().mip_level >= level => {}
                Some(_) => best = Some(i),
                None => best = Some(i),
            }
        }
        // Highest mip level still <= requested is the cheapest source.
        let i = best?;
        slot[i].touch = tick;
        Some(slot[i].image.clone())
    }

    /// Drop every entry with the exact key.
    pub fn evict(&self, key: &ImageKey) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(slot) = inner.map.get_mut(&LookupKey::of(key)) {
            slot.retain(|e| e.image.key() != key);
        }
    }

    /// Drop one specific instance (pointer identity), wherever it is keyed.
    pub fn evict_instance(&self, image: &Arc<Image>) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(slot) = inner.map.get_mut(&LookupKey::of(image.key())) {
            slot.retain(|e| e.image.serial() != image.serial());
        }
    }

    /// Drop every image produced under `hash`.
    pub fn evict_all_with_hash(&self, hash: NodeHash) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.map.retain(|k, _| k.node_hash != hash);
    }

    /// Resident bytes across all entries.
    pub fn resident_bytes(&self) -> usize {
        let inner = self.inner.lock().expect("store lock");
        inner
            .map
            .values()
            .flat_map(|slot| slot.iter())
            .map(|e| e.image.byte_size())
            .sum()
    }

    /// True when the cache is close enough to its budget that the evaluator
    /// should stop pinning partial results (memory-pressure re-plan).
    pub fn is_almost_full(&self) -> bool {
        self.max_bytes > 0 && self.resident_bytes() * 10 >= self.max_bytes * 9
    }

    /// Evict least-recently-used images nobody else holds until resident
    /// bytes fit the budget. Pinned images (outstanding handles) survive.
    pub fn evict_to_budget(&self) {
        if self.max_bytes == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("store lock");
        let mut resident: usize = inner
            .map
            .values()
            .flat_map(|slot| slot.iter())
            .map(|e| e.image.byte_size())
            .sum();
        if resident <= self.max_bytes {
            return;
        }
        let mut victims: Vec<(u64, u64)> = inner
            .map
            .values()
            .flat_map(|slot| slot.iter())
            .filter(|e| Arc::strong_count(&e.image) == 1)
            .map(|e| (e.touch, e.image.serial()))
            .collect();
        victims.sort_unstable();
        for (_, serial) in victims {
            if resident <= self.max_bytes {
                break;
            }
            for slot in inner.map.values_mut() {
                if let Some(pos) = slot.iter().position(|e| e.image.serial() == serial) {
                    resident = resident.saturating_sub(slot[pos].image.byte_size());
                    slot.remove(pos);
                    break;
                }
            }
        }
        inner.map.retain(|_, slot| !slot.is_empty());
    }

    /// Number of resident images, for tests.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("store lock");
        inner.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::geom::PixelRect;
    use crate::graph::effect::FramesNeeded;
    use crate::graph::plane::Components;

    fn key(hash: u64, mip: u32) -> ImageKey {
        ImageKey {
            node_hash: NodeHash(hash),
            layer: PlaneLayer::Color,
            time: 1.0,
            view: 0,
            mip_level: mip,
            frame_varying: true,
        }
    }

    fn params(components: Components, depth: BitDepth, mip: u32) -> ImageParams {
        let bounds = PixelRect::new(0, 0, 16 >> mip, 16 >> mip);
        ImageParams {
            rod: CanonicalRect::new(0.0, 0.0, 16.0, 16.0),
            bounds,
            components,
            depth,
            par: 1.0,
            rod_is_project_format: false,
            frames_needed: FramesNeeded::default(),
        }
    }

    const FMT: CanonicalRect = CanonicalRect::new(0.0, 0.0, 1920.0, 1080.0);

    #[test]
    fn get_or_create_dedups_on_key() {
        let store = ImageStore::new(usize::MAX);
        let (a, created_a) = store.get_or_create(key(1, 0), params(Components::Rgba, BitDepth::F32, 0), true);
        let (b, created_b) = store.get_or_create(key(1, 0), params(Components::Rgb, BitDepth::U8, 0), true);
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a.serial(), b.serial());
        // Params of the first insert win.
        assert_eq!(b.components(), Components::Rgba);
    }

    #[test]
    fn compatible_hit_never_lowers_depth() {
        let store = ImageStore::new(usize::MAX);
        store.get_or_create(key(1, 0), params(Components::Rgba, BitDepth::U8, 0), true);
        assert!(
            store
                .find_compatible(&key(1, 0), &Plane::rgba(), BitDepth::F32, &FMT)
                .is_none()
        );
        assert!(
            store
                .find_compatible(&key(1, 0), &Plane::rgba(), BitDepth::U8, &FMT)
                .is_some()
        );
    }

    #[test]
    fn color_plane_accepts_convertible_components_and_higher_res() {
        let store = ImageStore::new(usize::MAX);
        store.get_or_create(key(1, 0), params(Components::Rgb, BitDepth::F32, 0), true);
        // Request at level 1: the level-0 RGB image is a valid source.
        let hit = store
            .find_compatible(&key(1, 1), &Plane::rgba(), BitDepth::F32, &FMT)
            .unwrap();
        assert_eq!(hit.key().mip_level, 0);
        // The reverse (lower-res source for a higher-res request) is not.
        let store2 = ImageStore::new(usize::MAX);
        store2.get_or_create(key(1, 1), params(Components::Rgba, BitDepth::F32, 1), true);
        assert!(
            store2
                .find_compatible(&key(1, 0), &Plane::rgba(), BitDepth::F32, &FMT)
                .is_none()
        );
    }

    #[test]
    fn aux_planes_match_exactly() {
        let store = ImageStore::new(usize::MAX);
        let mut k = key(1, 0);
        k.layer = PlaneLayer::Aux("motion".into());
        store.get_or_create(k.clone(), params(Components::Xy, BitDepth::F32, 0), true);
        let motion = Plane::aux("motion", Components::Xy);
        assert!(store.find_compatible(&k, &motion, BitDepth::F32, &FMT).is_some());
        let mut k1 = k.clone();
        k1.mip_level = 1;
        assert!(store.find_compatible(&k1, &motion, BitDepth::F32, &FMT).is_none());
    }

    #[test]
    fn project_format_change_evicts_dependent_entries() {
        let store = ImageStore::new(usize::MAX);
        let mut p = params(Components::Rgba, BitDepth::F32, 0);
        p.rod_is_project_format = true;
        p.rod = CanonicalRect::new(0.0, 0.0, 100.0, 100.0);
        store.get_or_create(key(1, 0), p, true);
        assert!(
            store
                .find_compatible(&key(1, 0), &Plane::rgba(), BitDepth::F32, &FMT)
                .is_none()
        );
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn hash_eviction_and_lru_budget() {
        let store = ImageStore::new(usize::MAX);
        let (img, _) = store.get_or_create(key(1, 0), params(Components::Rgba, BitDepth::F32, 0), true);
        store.get_or_create(key(2, 0), params(Components::Rgba, BitDepth::F32, 0), true);
        store.evict_all_with_hash(NodeHash(1));
        assert!(store.get(&key(1, 0)).is_none());
        assert!(store.get(&key(2, 0)).is_some());
        drop(img);

        let tiny = ImageStore::new(64);
        let (a, _) = tiny.get_or_create(key(3, 0), params(Components::Rgba, BitDepth::F32, 0), true);
        a.allocate().unwrap();
        let held = tiny
            .get_or_create(key(4, 0), params(Components::Rgba, BitDepth::F32, 0), true)
            .0;
        held.allocate().unwrap();
        drop(a);
        tiny.evict_to_budget();
        // The unheld image went; the held one is pinned.
        assert!(tiny.get(&key(3, 0)).is_none());
        assert!(tiny.get(&key(4, 0)).is_some());
    }
}
