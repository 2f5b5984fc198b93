use crate::detection::Detection;
use image::{Rgb, RgbImage};

// Same ordering as the reference plotting palette
const PALETTE: [[u8; 3]; 10] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
];

pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Line width scaled to the image, never thinner than 2px.
fn line_width(width: u32, height: u32) -> u32 {
    (((width + height) as f32 / 2.0 * 0.003).round() as u32).max(2)
}

/// Draw every detection onto a copy of `image`.
///
/// Each box gets an outline plus a filled tab above its top-left corner whose
/// width grows with the confidence, so overlapping boxes stay tellable apart.
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return canvas;
    }

    let thickness = line_width(width, height);

    for det in detections {
        let color = class_color(det.class_id);
        let left = det.bbox.x1.round() as i64;
        let top = det.bbox.y1.round() as i64;
        let right = det.bbox.x2.round() as i64;
        let bottom = det.bbox.y2.round() as i64;

        for t in 0..thickness as i64 {
            draw_rectangle(&mut canvas, left + t, top + t, right - t, bottom - t, color);
        }

        let tab_height = (thickness * 6) as i64;
        let tab_width = ((right - left) as f32 * det.confidence.clamp(0.0, 1.0)).round() as i64;
        let tab_top = if top - tab_height >= 0 {
            top - tab_height
        } else {
            top
        };
        fill_rect(
            &mut canvas,
            left,
            tab_top,
            left + tab_width.max(thickness as i64),
            tab_top + tab_height,
            color,
        );
    }

    canvas
}

fn draw_rectangle(image: &mut RgbImage, left: i64, top: i64, right: i64, bottom: i64, color: Rgb<u8>) {
    if left > right || top > bottom {
        return;
    }
    for x in left..=right {
        put_pixel(image, x, top, color);
        put_pixel(image, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel(image, left, y, color);
        put_pixel(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i64, top: i64, right: i64, bottom: i64, color: Rgb<u8>) {
    for y in top..bottom {
        for x in left..right {
            put_pixel(image, x, y, color);
        }
    }
}

#[inline]
fn put_pixel(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}
