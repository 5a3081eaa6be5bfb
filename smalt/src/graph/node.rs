//! Graph nodes and the project that owns them.
//!
//! A node couples an effect instance with its input connections, its action
//! cache, its tri-map coordinator and the locks matching the effect's
//! declared thread safety. The project owns the shared caches and hands out
//! plugin-wide locks so `Unsafe` effects serialize across instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::actions::ActionCache;
use crate::cache::disk::DiskCache;
use crate::cache::image::Image;
use crate::cache::store::ImageStore;
use crate::cache::trimap::TriMap;
use crate::foundation::error::{SmaltError, SmaltResult};
use crate::foundation::hash::{NodeHash, StableHasher};
use crate::foundation::settings::Settings;
use crate::graph::effect::{Effect, EffectKind, RenderScaleSupport};
use crate::graph::plane::{Plane, PlaneLayer};

struct LastRender {
    hash: NodeHash,
    /// Weak so the cache stays free to evict under its byte budget.
    planes: Vec<std::sync::Weak<Image>>,
}

/// One node in the composition graph.
pub struct Node {
    name: String,
    serial: u64,
    effect: Arc<dyn Effect>,
    inputs: Mutex<Vec<Option<Arc<Node>>>>,
    actions: ActionCache,
    trimap: TriMap,
    instance_lock: Mutex<()>,
    plugin_lock: Arc<Mutex<()>>,
    live_hash: AtomicU64,
    scale_support: Mutex<RenderScaleSupport>,
    last_render: Mutex<LastRender>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("plugin", &self.effect.plugin_id())
            .field("hash", &self.current_hash())
            .finish()
    }
}

impl Node {
    fn new(name: String, serial: u64, effect: Arc<dyn Effect>, plugin_lock: Arc<Mutex<()>>) -> Self {
        let input_count = effect.input_count();
        let scale = effect.supports_render_scale();
        Self {
            name,
            serial,
            effect,
            inputs: Mutex::new(vec![None; input_count]),
            actions: ActionCache::new(),
            trimap: TriMap::new(),
            instance_lock: Mutex::new(()),
            plugin_lock,
            live_hash: AtomicU64::new(0),
            scale_support: Mutex::new(scale),
            last_render: Mutex::new(LastRender {
                hash: NodeHash::NONE,
                planes: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn effect(&self) -> &Arc<dyn Effect> {
        &self.effect
    }

    pub fn actions(&self) -> &ActionCache {
        &self.actions
    }

    pub fn trimap(&self) -> &TriMap {
        &self.trimap
    }

    pub fn instance_lock(&self) -> &Mutex<()> {
        &self.instance_lock
    }

    pub fn plugin_lock(&self) -> &Arc<Mutex<()>> {
        &self.plugin_lock
    }

    pub fn input_count(&self) -> usize {
        self.inputs.lock().expect("inputs lock").len()
    }

    pub fn input(&self, idx: usize) -> Option<Arc<Node>> {
        self.inputs.lock().expect("inputs lock").get(idx)?.clone()
    }

    pub fn connected_inputs(&self) -> Vec<(usize, Arc<Node>)> {
        self.inputs
            .lock()
            .expect("inputs lock")
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.clone().map(|n| (i, n)))
            .collect()
    }

    pub fn is_writer(&self) -> bool {
        matches!(self.effect.kind(), EffectKind::Writer)
    }

    pub fn is_reader(&self) -> bool {
        matches!(self.effect.kind(), EffectKind::Reader)
    }

    pub fn is_disk_cache(&self) -> bool {
        matches!(self.effect.kind(), EffectKind::DiskCache)
    }

    /// Hash of the node as last refreshed; the evaluator snapshots it per
    /// frame, and staleness checks compare against it.
    pub fn current_hash(&self) -> NodeHash {
        NodeHash(self.live_hash.load(Ordering::Acquire))
    }

    /// Recompute this node's hash from its parameters and input hashes,
    /// recursively. Two nodes with identical upstream state hash equal and
    /// share cache entries.
    pub fn refresh_hash(&self) -> NodeHash {
        let mut h = StableHasher::new();
        h.write_str(self.effect.plugin_id());
        self.effect.fold_params(&mut h);
        let inputs = self.inputs.lock().expect("inputs lock").clone();
        for input in inputs {
            match input {
                Some(n) => h.write_u64(n.refresh_hash().0),
                None => h.write_u64(0),
            }
        }
        let hash = h.finish_node_hash();
        self.live_hash.store(hash.0, Ordering::Release);
        hash
    }

    /// Whether output varies with time anywhere upstream of (and including)
    /// this node.
    pub fn is_frame_varying_recursive(&self) -> bool {
        if self.effect.is_frame_varying() {
            return true;
        }
        self.connected_inputs()
            .iter()
            .any(|(_, n)| n.is_frame_varying_recursive())
    }

    /// Tri-state render-scale support, refined once a `Maybe` effect is
    /// actually exercised at scale.
    pub fn scale_support(&self) -> RenderScaleSupport {
        *self.scale_support.lock().expect("scale support lock")
    }

    pub fn set_scale_support(&self, s: RenderScaleSupport) {
        *self.scale_support.lock().expect("scale support lock") = s;
    }

    /// Remember the planes of the most recent render. Returns the previous
    /// hash when it differed, so the caller can evict stale cache entries.
    pub fn note_render(&self, hash: NodeHash, planes: &[Arc<Image>]) -> Option<NodeHash> {
        let mut lr = self.last_render.lock().expect("last render lock");
        let prev = (lr.hash != NodeHash::NONE && lr.hash != hash).then_some(lr.hash);
        lr.hash = hash;
        lr.planes = planes.iter().map(Arc::downgrade).collect();
        prev
    }

    /// Stale-hash probe without recording a new render.
    pub fn take_stale_render(&self, hash: NodeHash) -> Option<NodeHash> {
        let mut lr = self.last_render.lock().expect("last render lock");
        if lr.hash != NodeHash::NONE && lr.hash != hash && !lr.planes.is_empty() {
            let prev = lr.hash;
            lr.planes.clear();
            Some(prev)
        } else {
            None
        }
    }

    /// Which node produces each plane reachable from here: this node's own
    /// planes, then (through the pass-through input) upstream producers for
    /// layers not produced locally.
    pub fn available_planes(self: &Arc<Self>, time: f64, view: i32) -> Vec<(Plane, Arc<Node>)> {
        let mut out: Vec<(Plane, Arc<Node>)> = self
            .effect
            .produced_planes(time, view)
            .into_iter()
            .map(|p| (p, self.clone()))
            .collect();
        if let Some(pt) = self.effect.pass_through_input(time, view)
            && let Some(input) = self.input(pt)
        {
            for (plane, producer) in input.available_planes(time, view) {
                let covered = out.iter().any(|(p, _)| p.layer == plane.layer);
                if !covered {
                    out.push((plane, producer));
                }
            }
        }
        out
    }

    /// The producer of `layer` as seen from this node, if any.
    pub fn producer_of(self: &Arc<Self>, layer: &PlaneLayer, time: f64, view: i32) -> Option<(Plane, Arc<Node>)> {
        self.available_planes(time, view)
            .into_iter()
            .find(|(p, _)| &p.layer == layer)
    }
}

/// Owner of the graph and the shared caches.
pub struct Project {
    settings: Settings,
    store: Arc<ImageStore>,
    disk: Option<Arc<DiskCache>>,
    serials: AtomicU64,
    plugin_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl Project {
    pub fn new(settings: Settings) -> SmaltResult<Arc<Self>> {
        let store = Arc::new(ImageStore::new(settings.image_cache_max_bytes));
        let disk = match &settings.cache_root {
            Some(root) => Some(Arc::new(DiskCache::open(
                root.clone(),
                settings.disk_cache_max_bytes as u64,
            )?)),
            None => None,
        };
        Ok(Arc::new(Self {
            settings,
            store,
            disk,
            serials: AtomicU64::new(1),
            plugin_locks: Mutex::new(HashMap::new()),
            nodes: Mutex::new(Vec::new()),
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    pub fn disk_cache(&self) -> Option<&Arc<DiskCache>> {
        self.disk.as_ref()
    }

    /// Create a node, sharing the plugin lock among instances of the same
    /// plugin.
    pub fn add_node(&self, name: impl Into<String>, effect: Arc<dyn Effect>) -> Arc<Node> {
        let lock = {
            let mut locks = self.plugin_locks.lock().expect("plugin locks");
            locks
                .entry(effect.plugin_id().to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let serial = self.serials.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(Node::new(name.into(), serial, effect, lock));
        self.nodes.lock().expect("nodes lock").push(node.clone());
        node
    }

    /// Connect `upstream` into slot `idx` of `node`.
    pub fn connect(&self, node: &Arc<Node>, idx: usize, upstream: &Arc<Node>) -> SmaltResult<()> {
        let mut inputs = node.inputs.lock().expect("inputs lock");
        let slot = inputs.get_mut(idx).ok_or_else(|| {
            SmaltError::invalid(format!(
                "node '{}' has no input slot {idx}",
                node.name()
            ))
        })?;
        *slot = Some(upstream.clone());
        Ok(())
    }

    pub fn disconnect(&self, node: &Arc<Node>, idx: usize) -> SmaltResult<()> {
        let mut inputs = node.inputs.lock().expect("inputs lock");
        let slot = inputs.get_mut(idx).ok_or_else(|| {
            SmaltError::invalid(format!(
                "node '{}' has no input slot {idx}",
                node.name()
            ))
        })?;
        *slot = None;
        Ok(())
    }

    /// Recompute hashes of every node (leaves first through recursion).
    pub fn refresh_hashes(&self) {
        let nodes = self.nodes.lock().expect("nodes lock").clone();
        for node in nodes {
            node.refresh_hash();
        }
    }

    pub fn find_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .lock()
            .expect("nodes lock")
            .iter()
            .find(|n| n.name() == name)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().expect("nodes lock").clone()
    }
}
