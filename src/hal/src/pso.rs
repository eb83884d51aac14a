//! Descriptors, samplers, and pipeline state.

use crate::Backend;

/// The two descriptor heap families of the native API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// UAV / SRV / CBV descriptors.
    View,
    /// Sampler descriptors.
    Sampler,
}

/// Texture addressing outside `[0, 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// Clamp to the nearest edge texel.
    ClampToEdge,
    /// Clamp to the border color.
    ClampToBorder,
    /// Repeat the image.
    Repeat,
    /// Repeat, flipping on each wrap.
    MirroredRepeat,
    /// No addressing; coordinates are taken as-is.
    None,
}

/// Texel filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterMode {
    /// Nearest-texel.
    Nearest,
    /// Linear interpolation.
    Linear,
}

/// Immutable sampler description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    /// Addressing mode, identical for all coordinates.
    pub address_mode: AddressMode,
    /// Minification/magnification filter.
    pub filter: FilterMode,
    /// Whether the kernel samples with normalized coordinates.
    pub normalized_coords: bool,
}

/// What to write into a descriptor slot.
///
/// Buffer views carry an element window so suballocated resources can expose
/// just their slice of the parent heap.
#[derive(Debug)]
pub enum Descriptor<'a, B: Backend> {
    /// Read/write buffer view.
    UavBuffer {
        /// Viewed allocation.
        memory: &'a B::Memory,
        /// Window start, in bytes.
        offset: u64,
        /// Window length, in bytes.
        size: u64,
    },
    /// Read-only buffer view.
    SrvBuffer {
        /// Viewed allocation.
        memory: &'a B::Memory,
        /// Window start, in bytes.
        offset: u64,
        /// Window length, in bytes.
        size: u64,
    },
    /// Sampler state.
    Sampler(SamplerDesc),
}
