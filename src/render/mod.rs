//! Surface drawing
//!
//! A graphics context produces images on the draw thread of a
//! [`SurfaceDrawingPipeline`], which renders each image onto every attached
//! [`RenderTarget`] (typically the input surface of a video codec).

pub mod drawing;
pub mod software;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::RenderError;

pub use drawing::SurfaceDrawingPipeline;
pub use software::{ImageFeed, ResourceCounter, SoftwareGraphics};

/// Packed RGB picture handed from the context to the targets
#[derive(Debug, Clone, PartialEq)]
pub struct VideoImage {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes, row-major
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
}

impl VideoImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp_us: u64) -> Self {
        Self {
            width,
            height,
            data,
            timestamp_us,
        }
    }

    pub fn black(width: u32, height: u32, timestamp_us: u64) -> Self {
        Self::new(width, height, vec![0; width as usize * height as usize * 3], timestamp_us)
    }

    /// Nearest-neighbour rescale, used when a target differs in size
    pub fn scaled(&self, width: u32, height: u32) -> VideoImage {
        if width == self.width && height == self.height {
            return self.clone();
        }
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as usize;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as usize;
                let i = (sy * self.width as usize + sx) * 3;
                data.extend_from_slice(&self.data[i..i + 3]);
            }
        }
        VideoImage::new(width, height, data, self.timestamp_us)
    }
}

/// Identity of a render target inside a drawing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(u64);

impl SurfaceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SurfaceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Creates graphics contexts; called on the draw thread
pub trait GraphicsBackend: Send + Sync {
    fn create_context(&self, width: u32, height: u32) -> Result<Box<dyn GraphicsContext>, RenderError>;
}

/// Source of images for one drawing session; released on drop
pub trait GraphicsContext: Send {
    /// Wait up to `timeout` for the next image
    fn next_image(&mut self, timeout: Duration) -> Result<Option<VideoImage>, RenderError>;
}

/// Something images are drawn onto; released on drop
pub trait RenderTarget: Send {
    fn id(&self) -> SurfaceId;

    fn size(&self) -> (u32, u32);

    fn render(&mut self, image: &VideoImage) -> Result<(), RenderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_picks_nearest_pixels() {
        let data = vec![
            1, 1, 1, 2, 2, 2, //
            3, 3, 3, 4, 4, 4,
        ];
        let image = VideoImage::new(2, 2, data, 7);

        let up = image.scaled(4, 4);
        assert_eq!(up.data.len(), 4 * 4 * 3);
        assert_eq!(&up.data[0..3], &[1, 1, 1]);
        assert_eq!(&up.data[(4 * 4 - 1) * 3..], &[4, 4, 4]);
        assert_eq!(up.timestamp_us, 7);

        let down = image.scaled(1, 1);
        assert_eq!(down.data, vec![1, 1, 1]);
    }

    #[test]
    fn test_surface_ids_are_unique() {
        assert_ne!(SurfaceId::next(), SurfaceId::next());
    }
}
