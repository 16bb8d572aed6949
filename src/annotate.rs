use crate::frame::{Frame, Region};
use crate::label::LabelPolicy;
use crate::recognition::Detection;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;
const CAPTION_BACKGROUND: [u8; 3] = [0, 0, 0];
const CAPTION_FOREGROUND: [u8; 3] = [255, 255, 255];

/// Draws face boxes and captions onto copies of frames.
#[derive(Debug, Clone)]
pub struct Annotator {
    policy: LabelPolicy,
    scale: u32,
    line_width: u32,
}

impl Annotator {
    pub fn new(policy: LabelPolicy) -> Self {
        Self {
            policy,
            scale: 2,
            line_width: 2,
        }
    }

    pub fn with_scale(mut self, scale: u32) -> Self {
        self.scale = scale.max(1);
        self
    }

    /// Captions for every detection that will be drawn.
    pub fn captions(&self, detections: &[Detection]) -> Vec<String> {
        detections
            .iter()
            .filter(|detection| detection.region.is_some())
            .map(|detection| self.policy.caption(&detection.name))
            .collect()
    }

    /// Width and height of `text` in the bitmap font, in pixels.
    pub fn measure(&self, text: &str) -> (u32, u32) {
        let chars = text.chars().count() as u32;
        let width = if chars == 0 {
            0
        } else {
            (chars * GLYPH_ADVANCE - 1) * self.scale
        };
        (width, GLYPH_HEIGHT * self.scale)
    }

    /// Annotated copy of `frame`. Uses OpenCV drawing when built with the
    /// `opencv` feature and the bitmap font otherwise.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Frame {
        #[cfg(feature = "opencv")]
        match self.annotate_native(frame, detections) {
            Ok(annotated) => return annotated,
            Err(err) => tracing::warn!("OpenCV drawing failed, using bitmap font: {}", err),
        }
        self.annotate_bitmap(frame, detections)
    }

    /// Draws with the built-in 5x7 font only.
    pub fn annotate_bitmap(&self, frame: &Frame, detections: &[Detection]) -> Frame {
        let mut canvas = Canvas {
            width: frame.width(),
            height: frame.height(),
            channels: frame.channels(),
            pixels: frame.to_pixels(),
        };

        for (region, detection) in visible(frame, detections) {
            let profile = self.policy.resolve(&detection.name);
            canvas.outline(region, self.line_width, profile.color);

            let caption = self.policy.caption(&detection.name);
            self.draw_caption(&mut canvas, region, &caption, profile.color);
        }

        frame.with_pixels(canvas.pixels)
    }

    /// Top left corner of a caption box: centred over the region, above it
    /// when there is room, never outside the frame.
    fn place_caption(
        &self,
        region: Region,
        box_width: u32,
        box_height: u32,
        frame_width: u32,
        frame_height: u32,
    ) -> (i64, i64) {
        let centered = region.center_x() as i64 - box_width as i64 / 2;
        let max_x = (frame_width as i64 - box_width as i64).max(0);
        let above = region.y as i64 - box_height as i64 - self.line_width as i64;
        let max_y = (frame_height as i64 - box_height as i64).max(0);
        (centered.clamp(0, max_x), above.clamp(0, max_y))
    }

    fn draw_caption(&self, canvas: &mut Canvas, region: Region, caption: &str, accent: [u8; 3]) {
        let (text_width, text_height) = self.measure(caption);
        let pad = self.scale;
        let box_width = text_width + 2 * pad;
        let box_height = text_height + 2 * pad;
        let (x, y) = self.place_caption(region, box_width, box_height, canvas.width, canvas.height);

        canvas.fill(x, y, box_width, box_height, CAPTION_BACKGROUND);
        canvas.fill(x, y + box_height as i64 - 1, box_width, 1, accent);
        self.draw_text(canvas, x + pad as i64, y + pad as i64, caption);
    }

    fn draw_text(&self, canvas: &mut Canvas, mut x: i64, y: i64, text: &str) {
        let scale = self.scale as i64;
        for ch in text.chars() {
            let glyph = glyph_bits(ch);
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        canvas.fill(
                            x + col as i64 * scale,
                            y + row as i64 * scale,
                            self.scale,
                            self.scale,
                            CAPTION_FOREGROUND,
                        );
                    }
                }
            }
            x += GLYPH_ADVANCE as i64 * scale;
        }
    }
}

/// Detections that have a region inside the frame.
fn visible<'a>(
    frame: &Frame,
    detections: &'a [Detection],
) -> impl Iterator<Item = (Region, &'a Detection)> {
    let (width, height) = (frame.width(), frame.height());
    detections.iter().filter_map(move |detection| {
        let region = detection.region?;
        let region = Region::clamped(
            region.x as i64,
            region.y as i64,
            region.width as i64,
            region.height as i64,
            width,
            height,
        )?;
        Some((region, detection))
    })
}

#[cfg(feature = "opencv")]
mod native {
    use opencv::core::{Mat, Point, Rect, Scalar};
    use opencv::imgproc;
    use opencv::prelude::*;

    use super::{visible, Annotator, CAPTION_BACKGROUND, CAPTION_FOREGROUND};
    use crate::detector::frame_to_mat;
    use crate::frame::{Frame, Region};
    use crate::recognition::Detection;

    const FONT: i32 = imgproc::FONT_HERSHEY_SIMPLEX;

    fn scalar([b, g, r]: [u8; 3]) -> Scalar {
        Scalar::new(b as f64, g as f64, r as f64, 0.0)
    }

    fn rect(x: i64, y: i64, width: u32, height: u32) -> Rect {
        Rect::new(x as i32, y as i32, width as i32, height as i32)
    }

    impl Annotator {
        pub(crate) fn annotate_native(
            &self,
            frame: &Frame,
            detections: &[Detection],
        ) -> anyhow::Result<Frame> {
            let mut image = frame_to_mat(frame)?;
            for (region, detection) in visible(frame, detections) {
                let profile = self.policy.resolve(&detection.name);
                imgproc::rectangle(
                    &mut image,
                    rect(region.x as i64, region.y as i64, region.width, region.height),
                    scalar(profile.color),
                    self.line_width as i32,
                    imgproc::LineTypes::LINE_8 as i32,
                    0,
                )?;

                let caption = self.policy.caption(&detection.name);
                self.put_caption(&mut image, frame, region, &caption, profile.color)?;
            }
            Ok(frame.with_pixels(image.data_bytes()?.to_vec()))
        }

        fn put_caption(
            &self,
            image: &mut Mat,
            frame: &Frame,
            region: Region,
            caption: &str,
            accent: [u8; 3],
        ) -> anyhow::Result<()> {
            let font_scale = 0.4 * self.scale as f64;
            let mut baseline = 0;
            let text = imgproc::get_text_size(caption, FONT, font_scale, 1, &mut baseline)?;
            let pad = self.scale;
            let box_width = text.width.max(0) as u32 + 2 * pad;
            let box_height = (text.height + baseline).max(0) as u32 + 2 * pad;
            let (x, y) =
                self.place_caption(region, box_width, box_height, frame.width(), frame.height());

            imgproc::rectangle(
                image,
                rect(x, y, box_width, box_height),
                scalar(CAPTION_BACKGROUND),
                imgproc::FILLED,
                imgproc::LineTypes::LINE_8 as i32,
                0,
            )?;
            imgproc::rectangle(
                image,
                rect(x, y + box_height as i64 - 1, box_width, 1),
                scalar(accent),
                imgproc::FILLED,
                imgproc::LineTypes::LINE_8 as i32,
                0,
            )?;
            imgproc::put_text(
                image,
                caption,
                Point::new(x as i32 + pad as i32, y as i32 + pad as i32 + text.height),
                FONT,
                font_scale,
                scalar(CAPTION_FOREGROUND),
                1,
                imgproc::LineTypes::LINE_8 as i32,
                false,
            )?;
            Ok(())
        }
    }
}

struct Canvas {
    width: u32,
    height: u32,
    channels: u8,
    pixels: Vec<u8>,
}

impl Canvas {
    fn put(&mut self, x: i64, y: i64, bgr: [u8; 3]) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let channels = self.channels as usize;
        let offset = (y as usize * self.width as usize + x as usize) * channels;
        if channels == 1 {
            let luma = (bgr[0] as u32 * 29 + bgr[1] as u32 * 150 + bgr[2] as u32 * 77) >> 8;
            self.pixels[offset] = luma as u8;
        } else {
            self.pixels[offset..offset + 3].copy_from_slice(&bgr);
        }
    }

    fn fill(&mut self, x: i64, y: i64, width: u32, height: u32, bgr: [u8; 3]) {
        for py in y..y + height as i64 {
            for px in x..x + width as i64 {
                self.put(px, py, bgr);
            }
        }
    }

    fn outline(&mut self, region: Region, line_width: u32, bgr: [u8; 3]) {
        let line = line_width.min(region.width).min(region.height).max(1);
        let (x, y) = (region.x as i64, region.y as i64);
        let (right, bottom) = (x + region.width as i64, y + region.height as i64);
        self.fill(x, y, region.width, line, bgr);
        self.fill(x, bottom - line as i64, region.width, line, bgr);
        self.fill(x, y, line, region.height, bgr);
        self.fill(right - line as i64, y, line, region.height, bgr);
    }
}

fn glyph_bits(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ' ' => [0; 7],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        ',' => [0, 0, 0, 0, 0b01100, 0b00100, 0b01000],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '\'' => [0b00100, 0b00100, 0b01000, 0, 0, 0, 0],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0, 0b00100],
        // '?' and anything without a glyph
        _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0, 0b00100],
    }
}
