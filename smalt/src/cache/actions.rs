//! Per-node memoization of the pure graph actions.
//!
//! Not a performance cache: plugins re-ask for the region of definition and
//! identity recursively during a single render, and the answers must be
//! stable for the duration of one node hash. Tag mismatch is a miss; a new
//! tag wipes everything.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::foundation::geom::CanonicalRect;
use crate::foundation::hash::NodeHash;
use crate::graph::effect::Identity;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ActionKey {
    time_bits: u64,
    view: i32,
    mip_level: u32,
}

impl ActionKey {
    fn new(time: f64, view: i32, mip_level: u32) -> Self {
        Self {
            time_bits: time.to_bits(),
            view,
            mip_level,
        }
    }
}

#[derive(Default)]
struct ActionTables {
    tag: NodeHash,
    rod: HashMap<ActionKey, CanonicalRect>,
    identity: HashMap<ActionKey, Identity>,
    time_domain: Option<(f64, f64)>,
}

/// Memoized rod / identity / time-domain answers, tagged by node hash.
#[derive(Default)]
pub struct ActionCache {
    tables: Mutex<ActionTables>,
}

impl ActionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every table and adopt `new_hash` as the current tag.
    pub fn invalidate_all(&self, new_hash: NodeHash) {
        let mut t = self.tables.lock().expect("action cache lock");
        *t = ActionTables {
            tag: new_hash,
            ..ActionTables::default()
        };
    }

    pub fn current_tag(&self) -> NodeHash {
        self.tables.lock().expect("action cache lock").tag
    }

    pub fn get_rod(
        &self,
        hash: NodeHash,
        time: f64,
        view: i32,
        mip_level: u32,
    ) -> Option<CanonicalRect> {
        let t = self.tables.lock().expect("action cache lock");
        if t.tag != hash {
            return None;
        }
        t.rod.get(&ActionKey::new(time, view, mip_level)).copied()
    }

    /// First write wins; a second write for the same key is a bug upstream,
    /// diagnosed and ignored.
    pub fn set_rod(&self, time: f64, view: i32, mip_level: u32, rod: CanonicalRect) {
        let mut t = self.tables.lock().expect("action cache lock");
        let key = ActionKey::new(time, view, mip_level);
        if let Some(prev) = t.rod.get(&key) {
            if *prev != rod {
                tracing::warn!(
                    time,
                    view,
                    mip_level,
                    ?prev,
                    ?rod,
                    "set_rod would overwrite an existing entry; keeping the first"
                );
            }
            return;
        }
        t.rod.insert(key, rod);
    }

    pub fn get_identity(
        &self,
        hash: NodeHash,
        time: f64,
        view: i32,
        mip_level: u32,
    ) -> Option<Identity> {
        let t = self.tables.lock().expect("action cache lock");
        if t.tag != hash {
            return None;
        }
        t.identity
            .get(&ActionKey::new(time, view, mip_level))
            .copied()
    }

    /// Unlike rod entries, identity may be overwritten.
    pub fn set_identity(&self, time: f64, view: i32, mip_level: u32, identity: Identity) {
        let mut t = self.tables.lock().expect("action cache lock");
        t.identity
            .insert(ActionKey::new(time, view, mip_level), identity);
    }

    pub fn get_time_domain(&self, hash: NodeHash) -> Option<(f64, f64)> {
        let t = self.tables.lock().expect("action cache lock");
        if t.tag != hash {
            return None;
        }
        t.time_domain
    }

    pub fn set_time_domain(&self, first: f64, last: f64) {
        let mut t = self.tables.lock().expect("action cache lock");
        t.time_domain = Some((first, last));
    }
}
