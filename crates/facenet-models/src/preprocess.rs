//! Image decoding and pixel normalization

use crate::utils::candle_err;
use candle_core::{DType, Device as CandleDevice, Tensor, D};
use facenet_types::{DataFormat, FacenetError, Result};
use image::imageops::FilterType;
use std::path::Path;
use tracing::debug;

/// Map `[0, 255]` pixel values to `[-1, 1]` (`x / 127.5 - 1`).
///
/// The mapping is applied unconditionally: a tensor that is already
/// normalized will be shifted again.
pub fn preprocess_input(x: &Tensor) -> Result<Tensor> {
    x.to_dtype(DType::F32)
        .and_then(|x| x.affine(1.0 / 127.5, -1.0))
        .map_err(candle_err("preprocess_input"))
}

/// Decode an image file and resize it to `(height, width)`.
///
/// Returns raw `f32` pixel values in `[0, 255]` with shape `(h, w, c)` for
/// channels-last or `(c, h, w)` for channels-first. Only 1 (luma) and 3 (RGB)
/// channels can be produced.
pub fn load_image(
    path: &Path,
    (height, width): (usize, usize),
    channels: usize,
    format: DataFormat,
    device: &CandleDevice,
) -> Result<Tensor> {
    let img = image::open(path).map_err(|e| {
        FacenetError::invalid_format(format!("Failed to decode {}: {}", path.display(), e))
    })?;
    debug!(
        "Decoded {} ({}x{}), resizing to {}x{}",
        path.display(),
        img.width(),
        img.height(),
        width,
        height
    );
    let img = img.resize_exact(width as u32, height as u32, FilterType::Triangle);

    let pixels = match channels {
        1 => img.to_luma8().into_raw(),
        3 => img.to_rgb8().into_raw(),
        other => {
            return Err(FacenetError::unsupported(format!(
                "Images can be loaded with 1 or 3 channels, not {}",
                other
            )))
        }
    };

    let hwc = Tensor::from_vec(pixels, (height, width, channels), device)
        .and_then(|t| t.to_dtype(DType::F32))
        .map_err(candle_err("load_image"))?;
    match format {
        DataFormat::ChannelsLast => Ok(hwc),
        DataFormat::ChannelsFirst => hwc
            .permute((2, 0, 1))
            .and_then(|t| t.contiguous())
            .map_err(candle_err("load_image")),
    }
}

/// Load several images into one batch tensor.
pub fn load_images<P: AsRef<Path>>(
    paths: &[P],
    size: (usize, usize),
    channels: usize,
    format: DataFormat,
    device: &CandleDevice,
) -> Result<Tensor> {
    if paths.is_empty() {
        return Err(FacenetError::invalid_parameter("No images given"));
    }
    let images = paths
        .iter()
        .map(|p| load_image(p.as_ref(), size, channels, format, device))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&images, 0).map_err(candle_err("load_images"))
}

/// Scale each row of a `(batch, features)` tensor to unit L2 norm.
pub fn l2_normalize(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings
        .sqr()
        .and_then(|t| t.sum_keepdim(D::Minus1))
        .and_then(|t| t.sqrt())
        .and_then(|t| t.clamp(1e-10f32, f32::MAX))
        .map_err(candle_err("l2_normalize"))?;
    embeddings
        .broadcast_div(&norm)
        .map_err(candle_err("l2_normalize"))
}
