//! Face boxes and identity captions drawn onto preview frames.

use crate::frame::{Frame, FrameError};
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rollcall_core::Recognition;

/// DejaVu Sans Mono, see `assets/LICENSE-DejaVu.txt`.
static FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

/// Box color for a recognized face.
pub const MATCH_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
/// Box color for an unknown face.
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: u32 = 2;
const TEXT_SCALE: f32 = 14.0;
const LINE_HEIGHT: i64 = 16;
const PADDING: i64 = 4;

/// Draws recognitions with a bundled font.
pub struct Overlay {
    font: FontRef<'static>,
    scale: PxScale,
}

impl Overlay {
    pub fn new() -> Result<Self, FrameError> {
        Ok(Self {
            font: FontRef::try_from_slice(FONT_DATA)?,
            scale: PxScale::from(TEXT_SCALE),
        })
    }

    /// Box each face (green known, red unknown) and caption it along the
    /// bottom edge of the box.
    pub fn annotate(&self, frame: Frame, recognitions: &[Recognition]) -> Result<Frame, FrameError> {
        let sequence = frame.sequence;
        let mut image = frame.into_image()?;
        for recognition in recognitions {
            self.draw(&mut image, recognition);
        }
        let mut annotated = Frame::from_image(image);
        annotated.sequence = sequence;
        Ok(annotated)
    }

    fn draw(&self, image: &mut RgbImage, recognition: &Recognition) {
        let b = &recognition.bbox;
        if ![b.x, b.y, b.width, b.height].iter().all(|v| v.is_finite()) {
            return;
        }
        let left = b.x.floor() as i64;
        let top = b.y.floor() as i64;
        let right = (b.x + b.width).ceil() as i64;
        let bottom = (b.y + b.height).ceil() as i64;
        let Some(face) = clip(image, left, top, right - left, bottom - top) else {
            return;
        };

        let color = if recognition.is_known() { MATCH_COLOR } else { UNKNOWN_COLOR };
        for inset in 0..BOX_THICKNESS {
            if face.width() > 2 * inset && face.height() > 2 * inset {
                let rect = Rect::at(face.left() + inset as i32, face.top() + inset as i32)
                    .of_size(face.width() - 2 * inset, face.height() - 2 * inset);
                draw_hollow_rect_mut(image, rect, color);
            }
        }

        let lines = recognition.caption();
        let text_width = lines
            .iter()
            .map(|line| text_size(self.scale, &self.font, line).0 as i64)
            .max()
            .unwrap_or(0);
        let label_height = LINE_HEIGHT * lines.len() as i64 + PADDING;
        let label_left = i64::from(face.left());
        let label_top = (i64::from(face.bottom()) + 1 - label_height).max(0);
        if let Some(label) = clip(image, label_left, label_top, text_width + 2 * PADDING, label_height) {
            draw_filled_rect_mut(image, label, color);
        }
        for (i, line) in lines.iter().enumerate() {
            let y = label_top + PADDING / 2 + LINE_HEIGHT * i as i64;
            draw_text_mut(
                image,
                TEXT_COLOR,
                (label_left + PADDING) as i32,
                y as i32,
                self.scale,
                &self.font,
                line,
            );
        }
    }
}

/// Intersect a rectangle with the image bounds; `None` if nothing is left.
fn clip(image: &RgbImage, x: i64, y: i64, width: i64, height: i64) -> Option<Rect> {
    let (w, h) = (i64::from(image.width()), i64::from(image.height()));
    let x0 = x.clamp(0, w);
    let y0 = y.clamp(0, h);
    let x1 = x.saturating_add(width).clamp(0, w);
    let y1 = y.saturating_add(height).clamp(0, h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Rect::at(x0 as i32, y0 as i32).of_size((x1 - x0) as u32, (y1 - y0) as u32))
}
