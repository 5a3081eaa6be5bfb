//! Explicit per-render state.
//!
//! The original engine carried this in thread-local storage; here it is two
//! plain values. [`FrameState`] spans one frame evaluation and is shared by
//! every node pulled for it; [`RenderContext`] spans one `render_region`
//! call on one node and is snapshotted into tile workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::cache::image::Image;
use crate::foundation::geom::CanonicalRect;
use crate::foundation::hash::NodeHash;
use crate::graph::effect::{Identity, RoiMap};
use crate::graph::node::Node;

/// Cooperative cancellation flag plus the render-age counter.
///
/// The age is bumped on every abort so work targeted at a previous age is
/// discarded at its next cancellation check even if it missed the flag
/// window.
#[derive(Debug, Default)]
pub struct AbortFlag {
    aborted: AtomicBool,
    age: AtomicU64,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.age.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-arm for a new render, returning the new age.
    pub fn renew(&self) -> u64 {
        self.aborted.store(false, Ordering::SeqCst);
        self.age.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> u64 {
        self.age.load(Ordering::SeqCst)
    }
}

/// State of one frame evaluation, shared by every node pulled for it.
#[derive(Clone)]
pub struct FrameState {
    pub time: f64,
    pub view: i32,
    /// Hash of the output node when the frame was launched.
    pub root_hash: NodeHash,
    /// Age of mask/roto overlays folded into the frame; a mismatch with the
    /// live value makes an interactive frame stale.
    pub roto_age: u64,
    /// Age this frame belongs to; an abort bumps the shared counter.
    pub render_age: u64,
    pub is_sequential: bool,
    /// Render issued in response to user interaction (viewer) rather than
    /// playback or an export.
    pub is_interactive: bool,
    /// Whether the abort flag applies to this frame. Interactive one-shot
    /// renders instead go stale through hash comparison.
    pub can_abort: bool,
    pub abort: Arc<AbortFlag>,
}

impl FrameState {
    /// Frame state for playback or export: abortable, not interactive.
    pub fn playback(time: f64, view: i32, root_hash: NodeHash, abort: Arc<AbortFlag>) -> Self {
        Self {
            time,
            view,
            root_hash,
            roto_age: 0,
            render_age: abort.age(),
            is_sequential: true,
            is_interactive: false,
            can_abort: true,
            abort,
        }
    }

    /// Frame state for a one-shot interactive render: not abortable, goes
    /// stale when the node hash moves on.
    pub fn interactive(time: f64, view: i32, root_hash: NodeHash) -> Self {
        Self {
            time,
            view,
            root_hash,
            roto_age: 0,
            render_age: 0,
            is_sequential: false,
            is_interactive: true,
            can_abort: false,
            abort: Arc::new(AbortFlag::new()),
        }
    }

    /// The tri-map is only engaged for renders that cannot be aborted:
    /// abortable renders drop their work instead of handing it over.
    pub fn uses_trimap(&self) -> bool {
        !self.can_abort && self.is_interactive
    }

    /// Cancellation check, sampled at every major step boundary.
    ///
    /// Playback renders observe the abort flag and the render age;
    /// interactive renders compare the snapshot hash against the node's
    /// live hash.
    pub fn aborted(&self, node: &Node, node_hash: NodeHash) -> bool {
        if self.can_abort {
            return self.abort.is_aborted() || self.abort.age() != self.render_age;
        }
        if self.is_interactive {
            let live = node.current_hash();
            return live != NodeHash::NONE && live != node_hash;
        }
        false
    }
}

/// State of one `render_region` call on one node.
///
/// Workers spawned for host tiling receive a snapshot; the keep-alive image
/// list makes sure the cache cannot evict inputs mid-render.
#[derive(Clone)]
pub struct RenderContext {
    pub time: f64,
    pub view: i32,
    pub mip_level: u32,
    pub node_hash: NodeHash,
    pub identity: Identity,
    pub rod: CanonicalRect,
    pub roi_map: RoiMap,
    /// Time domain of the enclosing sequence.
    pub frame_range: (f64, f64),
    /// Keep-alive roots: inputs rendered for the current tile.
    pub input_images: Vec<Arc<Image>>,
}

impl RenderContext {
    pub fn new(time: f64, view: i32, mip_level: u32, node_hash: NodeHash) -> Self {
        Self {
            time,
            view,
            mip_level,
            node_hash,
            identity: Identity::No,
            rod: CanonicalRect::default(),
            roi_map: RoiMap::default(),
            frame_range: (time, time),
            input_images: Vec::new(),
        }
    }

    /// Copy for a spawned tile worker.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}
