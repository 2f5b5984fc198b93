use crate::config::{DEFAULT_INPUT_SIZE, LETTERBOX_COLOR};
use crate::{Preprocess, PreprocessResult};
use common::span;
use fast_image_resize::{
    FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer,
    images::{Image, ImageRef},
};
use ndarray::{Array, Axis, IxDyn};

pub struct CpuPreProcessor {
    pub input_size: (u32, u32),
    letterboxed_buffer: Vec<u8>,
}

impl CpuPreProcessor {
    pub fn new(input_size: (u32, u32)) -> Self {
        Self {
            input_size,
            letterboxed_buffer: vec![LETTERBOX_COLOR; (input_size.0 * input_size.1 * 3) as usize],
        }
    }

    pub fn preprocess_from_u8_slice(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<(Array<f32, IxDyn>, f32, f32, f32)> {
        let _s = span!("preprocess_image");

        tracing::trace!(
            width,
            height,
            pixel_bytes = pixels.len(),
            "Preprocessing image dimensions"
        );

        if width == 0 || height == 0 {
            anyhow::bail!("Cannot preprocess an empty image ({}x{})", width, height);
        }

        let expected_size = (width * height * 3) as usize;
        if pixels.len() != expected_size {
            anyhow::bail!(
                "Buffer size mismatch: expected {}, got {} bytes",
                expected_size,
                pixels.len()
            );
        }

        let (scale, offset_x, offset_y, resized) =
            self.resize_and_letterbox(pixels, width, height)?;

        let input = Self::normalize(&resized)?;

        Ok((input, scale, offset_x, offset_y))
    }

    fn resize_and_letterbox(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<(f32, f32, f32, Image<'_>)> {
        let _s = span!("resize_and_letterbox");

        let scale =
            (self.input_size.0 as f32 / width as f32).min(self.input_size.1 as f32 / height as f32);
        let new_width = ((width as f32 * scale).round() as u32).clamp(1, self.input_size.0);
        let new_height = ((height as f32 * scale).round() as u32).clamp(1, self.input_size.1);

        let offset_x = (self.input_size.0 - new_width) / 2;
        let offset_y = (self.input_size.1 - new_height) / 2;

        let src = ImageRef::new(width, height, pixels, PixelType::U8x3)?;

        let mut resized = Image::new(new_width, new_height, PixelType::U8x3);

        Resizer::new().resize(
            &src,
            &mut resized,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )?;

        self.letterboxed_buffer.fill(LETTERBOX_COLOR);

        let resized_data = resized.buffer();
        let stride = self.input_size.0 * 3;

        for y in 0..new_height {
            let src_row = (y * new_width * 3) as usize;
            let dst_row = ((y + offset_y) * stride + offset_x * 3) as usize;

            self.letterboxed_buffer[dst_row..dst_row + (new_width * 3) as usize]
                .copy_from_slice(&resized_data[src_row..src_row + (new_width * 3) as usize]);
        }

        let final_img = Image::from_slice_u8(
            self.input_size.0,
            self.input_size.1,
            &mut self.letterboxed_buffer,
            PixelType::U8x3,
        )?;

        Ok((scale, offset_x as f32, offset_y as f32, final_img))
    }

    /// HWC u8 -> NCHW f32 in `[0, 1]`. YOLO exports expect no mean/std shift.
    fn normalize(image: &Image) -> anyhow::Result<Array<f32, IxDyn>> {
        let _s = span!("normalize");

        let width = image.width() as usize;
        let height = image.height() as usize;
        let spatial = width * height;

        let mut output = vec![0.0f32; 3 * spatial];
        let buf = image.buffer();

        for (i, px) in buf.chunks_exact(3).enumerate() {
            output[i] = px[0] as f32 / 255.0;
            output[i + spatial] = px[1] as f32 / 255.0;
            output[i + 2 * spatial] = px[2] as f32 / 255.0;
        }

        Ok(Array::from_shape_vec(
            IxDyn(&[1, 3, height, width]),
            output,
        )?)
    }
}

impl Default for CpuPreProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE)
    }
}

impl Preprocess for CpuPreProcessor {
    fn preprocess(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> anyhow::Result<PreprocessResult> {
        let (tensor, scale, offset_x, offset_y) =
            self.preprocess_from_u8_slice(pixels, width, height)?;
        Ok(PreprocessResult {
            tensor,
            scale,
            offset_x,
            offset_y,
        })
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }
}

/// Mirror an NCHW tensor left-to-right (test-time augmentation pass).
pub fn flip_horizontal(tensor: &Array<f32, IxDyn>) -> Array<f32, IxDyn> {
    let mut flipped = tensor.clone();
    flipped.invert_axis(Axis(3));
    flipped.as_standard_layout().into_owned()
}
