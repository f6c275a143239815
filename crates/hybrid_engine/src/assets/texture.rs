//! Texture data and GPU texture assets
//!
//! Textures are `width × height` RGBA `f32` pixels, uploaded as
//! `R32G32B32A32_SFLOAT` images and sampled through the pool's shared sampler.

use ash::vk;

use super::AssetError;
use crate::foundation::logging::debug;
use crate::render::api::{ImageDesc, ImageHandle, RenderDevice};

/// Texture image format
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Stable texture identity, never reused while the pool lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TextureId(pub u32);

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Decoded texture pixels
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl TextureData {
    /// Wrap decoded pixels, row-major from the top-left corner
    pub fn new(width: u32, height: u32, pixels: Vec<[f32; 4]>) -> Result<Self, AssetError> {
        if width == 0 || height == 0 {
            return Err(AssetError::InvalidData(format!("texture extent {width}x{height}")));
        }
        if pixels.len() != width as usize * height as usize {
            return Err(AssetError::InvalidData(format!(
                "{} pixels for a {width}x{height} texture",
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels })
    }

    /// Single-color texture
    pub fn solid(width: u32, height: u32, color: [f32; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    /// Texture generated per pixel
    pub fn from_fn(width: u32, height: u32, mut pixel: impl FnMut(u32, u32) -> [f32; 4]) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| pixel(x, y))
            .collect();
        Self { width, height, pixels }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel at `(x, y)`, clamped to the edge
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.width - 1) as usize;
        let y = y.min(self.height - 1) as usize;
        self.pixels[y * self.width as usize + x]
    }

    /// All pixels
    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }

    /// Raw bytes as uploaded
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }
}

/// A texture resident on the device
#[derive(Debug, Clone)]
pub struct TextureAsset {
    pub(crate) id: TextureId,
    pub(crate) name: String,
    pub(crate) image: ImageHandle,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) binding_slot: u32,
}

impl TextureAsset {
    /// Create the image and upload `data` synchronously
    pub(crate) fn upload(
        device: &mut dyn RenderDevice,
        id: TextureId,
        data: &TextureData,
        name: &str,
    ) -> Result<Self, AssetError> {
        let image = device.create_image(&ImageDesc::color(
            data.width,
            data.height,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        ))?;
        if let Err(err) = device.upload_image(image, data.as_bytes()) {
            device.destroy_image(image);
            return Err(err.into());
        }
        debug!("[ASSETS] Uploaded {id} '{name}' ({}x{})", data.width, data.height);
        Ok(Self {
            id,
            name: name.to_string(),
            image,
            width: data.width,
            height: data.height,
            binding_slot: 0,
        })
    }

    /// Stable identity
    pub fn id(&self) -> TextureId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device image
    pub fn image(&self) -> ImageHandle {
        self.image
    }

    /// Extent in pixels
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Dense bindless slot, valid until the next load or destroy
    pub fn binding_slot(&self) -> u32 {
        self.binding_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_count_must_match_extent() {
        assert!(TextureData::new(2, 2, vec![[0.0; 4]; 3]).is_err());
        assert!(TextureData::new(0, 2, Vec::new()).is_err());
        assert!(TextureData::new(2, 1, vec![[1.0; 4]; 2]).is_ok());
    }

    #[test]
    fn test_from_fn_is_row_major() {
        let texture = TextureData::from_fn(3, 2, |x, y| [x as f32, y as f32, 0.0, 1.0]);
        assert_eq!(texture.pixels()[4], [1.0, 1.0, 0.0, 1.0]);
        assert_eq!(texture.pixel(2, 0), [2.0, 0.0, 0.0, 1.0]);
        assert_eq!(texture.pixel(10, 10), [2.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_bytes_are_rgba_f32() {
        let texture = TextureData::solid(1, 1, [1.0; 4]);
        assert_eq!(texture.as_bytes().len(), 16);
    }
}
