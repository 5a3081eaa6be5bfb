//! Concatenation of matrix-only transform chains.
//!
//! When a node can apply input transforms itself, chains of matrix-only
//! effects above it are collapsed: inputs are redirected past the chain to
//! its source and the combined matrix travels with the redirect, so the
//! intermediate transforms never render and upstream only produces what the
//! inverse-mapped region of interest really needs. The redirect is plain
//! call-local data, so it unwinds on every exit path by construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use kurbo::Affine;

use crate::foundation::geom::CanonicalRect;
use crate::graph::node::Node;

/// A rerouted input: fetch from `target` instead of the direct input, with
/// the concatenated matrix mapping target space into this node's input
/// space.
#[derive(Clone)]
pub struct ConcatRedirect {
    pub target: Arc<Node>,
    pub matrix: Affine,
}

pub type RedirectMap = BTreeMap<usize, ConcatRedirect>;

/// Walk each input of `node`; for chains of transform-declaring effects,
/// multiply the matrices and redirect to the first non-transform source.
pub fn collect_redirects(node: &Node, time: f64, view: i32) -> RedirectMap {
    let mut out = RedirectMap::new();
    for (idx, input) in node.connected_inputs() {
        let mut matrix = Affine::IDENTITY;
        let mut hops = 0usize;
        let mut cursor = input;
        loop {
            let Some(decl) = cursor.effect().transform_at(time, view) else {
                break;
            };
            let Some(next) = cursor.input(decl.input) else {
                break;
            };
            matrix = matrix * decl.matrix;
            hops += 1;
            cursor = next;
        }
        if hops > 0 {
            out.insert(
                idx,
                ConcatRedirect {
                    target: cursor,
                    matrix,
                },
            );
        }
    }
    out
}

/// Bounding box of `rect` mapped through the inverse of `matrix`.
pub fn inverse_map_rect(matrix: &Affine, rect: &CanonicalRect) -> CanonicalRect {
    let inv = matrix.inverse();
    let corners = [
        inv * kurbo::Point::new(rect.x1, rect.y1),
        inv * kurbo::Point::new(rect.x2, rect.y1),
        inv * kurbo::Point::new(rect.x1, rect.y2),
        inv * kurbo::Point::new(rect.x2, rect.y2),
    ];
    let xs = corners.iter().map(|p| p.x);
    let ys = corners.iter().map(|p| p.y);
    CanonicalRect::new(
        xs.clone().fold(f64::INFINITY, f64::min),
        ys.clone().fold(f64::INFINITY, f64::min),
        xs.fold(f64::NEG_INFINITY, f64::max),
        ys.fold(f64::NEG_INFINITY, f64::max),
    )
}
