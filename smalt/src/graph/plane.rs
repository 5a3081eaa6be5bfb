//! Plane identifiers, component sets and bit depths.

use serde::{Deserialize, Serialize};

use crate::foundation::hash::StableHasher;

/// Channel layout of a plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Components {
    Alpha,
    Rgb,
    Rgba,
    /// Two-channel data such as motion vectors or disparity.
    Xy,
}

impl Components {
    pub fn count(self) -> usize {
        match self {
            Self::Alpha => 1,
            Self::Xy => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    /// Component conversion is only defined within the color family.
    pub fn is_color(self) -> bool {
        matches!(self, Self::Alpha | Self::Rgb | Self::Rgba)
    }
}

/// Storage depth of one channel sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    U8,
    U16,
    F32,
}

impl BitDepth {
    pub fn byte_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Identity of an image plane: the color plane or a named auxiliary plane.
///
/// The color plane admits component conversion on cache hits; auxiliary
/// planes match exactly or not at all.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaneLayer {
    Color,
    Aux(String),
}

impl PlaneLayer {
    pub fn is_color(&self) -> bool {
        matches!(self, Self::Color)
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Color => "color",
            Self::Aux(name) => name,
        }
    }

    pub fn fold(&self, h: &mut StableHasher) {
        match self {
            Self::Color => h.write_u8(0),
            Self::Aux(name) => {
                h.write_u8(1);
                h.write_str(name);
            }
        }
    }
}

/// A plane request or instance: which layer, with which components.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plane {
    pub layer: PlaneLayer,
    pub components: Components,
}

impl Plane {
    pub fn rgba() -> Self {
        Self {
            layer: PlaneLayer::Color,
            components: Components::Rgba,
        }
    }

    pub fn rgb() -> Self {
        Self {
            layer: PlaneLayer::Color,
            components: Components::Rgb,
        }
    }

    pub fn alpha() -> Self {
        Self {
            layer: PlaneLayer::Color,
            components: Components::Alpha,
        }
    }

    pub fn aux(name: impl Into<String>, components: Components) -> Self {
        Self {
            layer: PlaneLayer::Aux(name.into()),
            components,
        }
    }

    pub fn is_color(&self) -> bool {
        self.layer.is_color()
    }

    /// Whether a cached image with `have` components can satisfy a request
    /// for this plane without re-rendering.
    pub fn components_convertible_from(&self, have: Components) -> bool {
        if self.layer.is_color() {
            have.is_color() && self.components.is_color()
        } else {
            have == self.components
        }
    }
}
