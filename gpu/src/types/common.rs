//! Common types shared across the resource API.

use ash::vk;

/// 3D extent for textures and copy regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth in pixels (1 for 2D textures).
    pub depth: u32,
}

impl Extent3d {
    /// Create a new 2D extent.
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    /// Create a new 3D extent.
    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Number of texels covered by this extent.
    pub fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Returns true if any dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    pub(crate) fn to_vk(self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }
}

/// Texel offset of a region inside a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Origin3d {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Origin3d {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub(crate) fn to_vk(self) -> vk::Offset3D {
        vk::Offset3D {
            x: self.x as i32,
            y: self.y as i32,
            z: self.z as i32,
        }
    }
}

/// A box inside a texture, used by uploads, downloads and blits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureRegion {
    pub origin: Origin3d,
    pub extent: Extent3d,
}

impl TextureRegion {
    /// Region covering the whole texture of the given size.
    pub fn full(extent: Extent3d) -> Self {
        Self {
            origin: Origin3d::ZERO,
            extent,
        }
    }

    /// Returns true if the region lies entirely within `bounds`.
    pub fn fits_within(&self, bounds: Extent3d) -> bool {
        self.origin.x as u64 + self.extent.width as u64 <= bounds.width as u64
            && self.origin.y as u64 + self.extent.height as u64 <= bounds.height as u64
            && self.origin.z as u64 + self.extent.depth as u64 <= bounds.depth as u64
    }

    /// Exclusive end corner of the region.
    pub(crate) fn end(&self) -> vk::Offset3D {
        vk::Offset3D {
            x: (self.origin.x + self.extent.width) as i32,
            y: (self.origin.y + self.extent.height) as i32,
            z: (self.origin.z + self.extent.depth) as i32,
        }
    }
}

/// RGBA clear color.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearColor(pub [f32; 4]);

impl ClearColor {
    pub const TRANSPARENT: Self = Self([0.0; 4]);

    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self([r, g, b, a])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_bounds() {
        let size = Extent3d::new_2d(64, 32);
        assert!(TextureRegion::full(size).fits_within(size));

        let region = TextureRegion {
            origin: Origin3d::new(60, 0, 0),
            extent: Extent3d::new_2d(8, 8),
        };
        assert!(!region.fits_within(size));
        assert_eq!(region.end(), vk::Offset3D { x: 68, y: 8, z: 1 });
    }

    #[test]
    fn test_extent_texels() {
        assert_eq!(Extent3d::new_3d(4, 4, 2).texel_count(), 32);
        assert!(Extent3d::new_2d(0, 4).is_empty());
    }
}
