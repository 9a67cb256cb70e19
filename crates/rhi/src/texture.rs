//! Sampled 2D textures.
//!
//! A [`Texture2D`] is a device-local image with one view and one sampler.
//! Its contents arrive through
//! [`TransferEngine::upload_texture`](crate::transfer::TransferEngine::upload_texture),
//! which leaves it in `SHADER_READ_ONLY_OPTIMAL`.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::color_subresource_range;
use crate::error::{RhiError, RhiResult};
use crate::gpu::Gpu;
use crate::memory::{allocate_and_bind_image, allocate_image2d};

/// Format of uploaded pixel data: tightly packed RGBA, one byte per channel.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Bytes per texel of [`TEXTURE_FORMAT`].
pub const TEXEL_SIZE: u64 = 4;

pub struct Texture2D<G: Gpu> {
    gpu: Arc<G>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    extent: vk::Extent2D,
}

impl<G: Gpu> Texture2D<G> {
    /// Creates an empty texture in `UNDEFINED` layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the image, its memory, the view or the sampler
    /// cannot be created. Whatever was created before the failure is
    /// destroyed.
    pub fn new(gpu: Arc<G>, extent: vk::Extent2D) -> RhiResult<Self> {
        let image = allocate_image2d(
            gpu.as_ref(),
            extent,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;

        let memory = match allocate_and_bind_image(
            gpu.as_ref(),
            image,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok((memory, _)) => memory,
            Err(e) => {
                gpu.destroy_image(image);
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());

        let view = match gpu.create_image_view(&view_info) {
            Ok(view) => view,
            Err(e) => {
                gpu.destroy_image(image);
                gpu.free_memory(memory);
                return Err(e);
            }
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(0.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        let sampler = match gpu.create_sampler(&sampler_info) {
            Ok(sampler) => sampler,
            Err(e) => {
                gpu.destroy_image_view(view);
                gpu.destroy_image(image);
                gpu.free_memory(memory);
                return Err(e);
            }
        };

        debug!("Created {}x{} texture", extent.width, extent.height);

        Ok(Self {
            gpu,
            image,
            memory,
            view,
            sampler,
            extent,
        })
    }

    /// Number of bytes an upload for this texture must supply.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.extent.width) * u64::from(self.extent.height) * TEXEL_SIZE
    }

    /// Checks that `pixels` matches the texture's extent.
    pub fn check_pixels(&self, pixels: &[u8]) -> RhiResult<()> {
        if pixels.len() as u64 != self.byte_size() {
            return Err(RhiError::TransferFailed(format!(
                "{} bytes supplied for a {}x{} RGBA8 texture",
                pixels.len(),
                self.extent.width,
                self.extent.height
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl<G: Gpu> Drop for Texture2D<G> {
    fn drop(&mut self) {
        self.gpu.destroy_sampler(self.sampler);
        self.gpu.destroy_image_view(self.view);
        self.gpu.destroy_image(self.image);
        self.gpu.free_memory(self.memory);
        debug!(
            "Destroyed {}x{} texture",
            self.extent.width, self.extent.height
        );
    }
}
