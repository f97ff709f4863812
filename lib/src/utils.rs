use crate::{tensor::Tensor, Error};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the session
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + ?Sized + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// The dimensions an image of `width x height` is resized to so that its
/// shorter edge is `size`, keeping the aspect ratio
pub fn shorter_edge_dims(width: u32, height: u32, size: u32) -> (u32, u32) {
    if width <= height {
        let long = (u64::from(size) * u64::from(height) / u64::from(width.max(1))) as u32;
        (size, long)
    } else {
        let long = (u64::from(size) * u64::from(width) / u64::from(height.max(1))) as u32;
        (long, size)
    }
}

/// Loads an image as RGB, resizing it so its shorter edge is `size`
pub(crate) fn load_image(src: ImageSource<'_>, size: u32) -> Result<image::RgbImage, Error> {
    use image::GenericImageView;

    let img = load_dynamic_image(src)?;
    let (width, height) = shorter_edge_dims(img.width(), img.height(), size);

    let img = if img.width() != width || img.height() != height {
        log::debug!(
            "resizing {}x{} image to {}x{}",
            img.width(),
            img.height(),
            width,
            height
        );
        image::imageops::resize(&img.to_rgb8(), width, height, image::imageops::Triangle)
    } else {
        img.to_rgb8()
    };

    Ok(img)
}

/// Converts an image into a `[1, 3, height, width]` tensor with values in
/// `[0, 1]`
pub fn image_to_tensor(img: &image::RgbImage) -> Tensor {
    let (width, height) = img.dimensions();
    Tensor::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
        f32::from(img.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

/// Converts the first image of a tensor back into 8-bit RGB, scaling by 255,
/// rounding, and clamping
pub fn tensor_to_rgb(t: &Tensor) -> image::RgbImage {
    let (_, channels, height, width) = t.dim();
    image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let mut px = [0u8; 3];
        for (c, v) in px.iter_mut().enumerate() {
            // grayscale tensors are broadcast to every channel
            let value = t[[0, c.min(channels - 1), y as usize, x as usize]];
            *v = (value * 255.0 + 0.5).max(0.0).min(255.0) as u8;
        }
        image::Rgb(px)
    })
}

/// Crops the central `size x size` square out of an image tensor
pub fn center_crop(t: &Tensor, size: u32) -> Result<Tensor, Error> {
    let (_, _, height, width) = t.dim();
    let crop = size as usize;

    if crop == 0 || crop > width || crop > height {
        return Err(Error::CropTooLarge {
            crop: size,
            width: width as u32,
            height: height as u32,
        });
    }

    let top = height / 2 - crop / 2;
    let left = width / 2 - crop / 2;

    Ok(t
        .slice(ndarray::s![.., .., top..top + crop, left..left + crop])
        .to_owned())
}

/// Checks that the format implied by a path's extension is one images can
/// be written as
pub fn check_output_format(path: &Path) -> Result<(), Error> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "bmp" => Ok(()),
        _ => Err(Error::UnsupportedOutputFormat(ext)),
    }
}
