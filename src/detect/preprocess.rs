//! Frame → model input tensor.
//!
//! Nearest-neighbor resize to the model's fixed input size (x and y scaled independently),
//! 4-channel capture layout to 3-channel planar RGB, each channel normalized to [0, 1].
//! Rows are converted in parallel on the rayon pool. The output buffer and the column
//! lookup table are allocated once and reused while the source dimensions stay the same.

use anyhow::{anyhow, Result};
use rayon::prelude::*;

use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Scale factors from model input space back to original frame space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinateMapping {
    pub scale_x: f32,
    pub scale_y: f32,
    pub frame_width: f32,
    pub frame_height: f32,
}

impl CoordinateMapping {
    pub fn new(frame_width: u32, frame_height: u32, input_width: u32, input_height: u32) -> Self {
        Self {
            scale_x: frame_width as f32 / input_width as f32,
            scale_y: frame_height as f32 / input_height as f32,
            frame_width: frame_width as f32,
            frame_height: frame_height as f32,
        }
    }

    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale_x, y * self.scale_y)
    }

    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (x / self.scale_x, y / self.scale_y)
    }
}

/// Reusable planar-RGB tensor builder for one model input size.
pub struct Preprocessor {
    input_width: usize,
    input_height: usize,
    buffer: Vec<f32>,
    column_lut: Vec<usize>,
    lut_source_width: u32,
}

impl Preprocessor {
    pub fn new(input_width: u32, input_height: u32) -> Self {
        let plane = input_width as usize * input_height as usize;
        Self {
            input_width: input_width as usize,
            input_height: input_height as usize,
            buffer: vec![0.0; plane * 3],
            column_lut: Vec::with_capacity(input_width as usize),
            lut_source_width: 0,
        }
    }

    /// Fill the internal buffer from `frame` and return it as `[3][H][W]` floats.
    pub fn prepare(&mut self, frame: &Frame) -> Result<(&[f32], CoordinateMapping)> {
        let src_w = frame.width();
        let src_h = frame.height();
        if src_w == 0 || src_h == 0 {
            return Err(anyhow!("cannot preprocess an empty frame"));
        }
        if self.lut_source_width != src_w {
            self.rebuild_column_lut(src_w);
        }

        let dst_w = self.input_width;
        let dst_h = self.input_height;
        let plane = dst_w * dst_h;
        let stride = frame.stride();
        let pixels = frame.pixels();
        let (r_off, g_off, b_off) = frame.format().rgb_offsets();
        let lut = &self.column_lut;

        let (red, rest) = self.buffer.split_at_mut(plane);
        let (green, blue) = rest.split_at_mut(plane);

        red.par_chunks_mut(dst_w)
            .zip(green.par_chunks_mut(dst_w))
            .zip(blue.par_chunks_mut(dst_w))
            .enumerate()
            .for_each(|(y, ((r_row, g_row), b_row))| {
                let src_y = (y * src_h as usize / dst_h).min(src_h as usize - 1);
                let row = &pixels[src_y * stride..];
                for (x, &src_offset) in lut.iter().enumerate() {
                    let px = &row[src_offset..src_offset + BYTES_PER_PIXEL];
                    r_row[x] = px[r_off] as f32 / 255.0;
                    g_row[x] = px[g_off] as f32 / 255.0;
                    b_row[x] = px[b_off] as f32 / 255.0;
                }
            });

        let mapping = CoordinateMapping::new(src_w, src_h, dst_w as u32, dst_h as u32);
        Ok((self.buffer.as_slice(), mapping))
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width as u32, self.input_height as u32)
    }

    fn rebuild_column_lut(&mut self, src_w: u32) {
        let dst_w = self.input_width;
        self.column_lut.clear();
        self.column_lut.extend((0..dst_w).map(|x| {
            let src_x = (x * src_w as usize / dst_w).min(src_w as usize - 1);
            src_x * BYTES_PER_PIXEL
        }));
        self.lut_source_width = src_w;
    }
}
