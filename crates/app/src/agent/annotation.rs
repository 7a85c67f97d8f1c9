//! Overlay drawn on streamed frames: severity-coloured boxes, a status
//! banner, a LIVE badge and the FPS readout. Purely cosmetic.

use image::{Rgb, RgbImage};
use ml_core::{DominantDetection, Severity};

use crate::agent::data::OverlayBox;

const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const ALERT: Rgb<u8> = Rgb([200, 0, 0]);
const CLEAR: Rgb<u8> = Rgb([0, 140, 0]);

pub fn severity_color(severity: Severity) -> Rgb<u8> {
    match severity {
        Severity::Large => Rgb([255, 0, 0]),
        Severity::Medium => Rgb([255, 165, 0]),
        Severity::Small => Rgb([0, 255, 0]),
        Severity::Tiny => Rgb([255, 255, 0]),
    }
}

pub fn box_label(overlay: &OverlayBox) -> String {
    format!(
        "{} {:.2} ({}PX)",
        overlay.severity.label(),
        overlay.confidence,
        overlay.area
    )
}

pub fn banner_text(dominant: &DominantDetection, subject: &str) -> String {
    match (dominant.detection(), dominant.severity()) {
        (Some(found), Some(severity)) => format!(
            "{} DETECTED: {} ({}PX)",
            subject.to_uppercase(),
            severity.label(),
            found.area
        ),
        _ => format!("NO {} DETECTED", subject.to_uppercase()),
    }
}

/// Draw the overlay in place.
pub fn annotate(
    image: &mut RgbImage,
    boxes: &[OverlayBox],
    dominant: &DominantDetection,
    subject: &str,
    fps: f32,
) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;

    for overlay in boxes {
        let color = severity_color(overlay.severity);
        let b = overlay.bbox;
        draw_rectangle(image, b.x1, b.y1, b.x2, b.y2, color);
        draw_rectangle(image, b.x1 + 1, b.y1 + 1, b.x2 - 1, b.y2 - 1, color);

        let text = box_label(overlay);
        let label_x = b.x1;
        let label_y = (b.y1 - GLYPH_HEIGHT - 5).max(0);
        fill_rect(
            image,
            label_x,
            label_y,
            label_x + text_width(&text, 1) + 2,
            label_y + GLYPH_HEIGHT + 2,
            BLACK,
        );
        draw_label(image, label_x + 1, label_y + 1, &text, color, 1);
    }

    let banner = banner_text(dominant, subject);
    let banner_bg = if dominant.is_found() { ALERT } else { CLEAR };
    fill_rect(
        image,
        0,
        0,
        text_width(&banner, 2) + 12,
        GLYPH_HEIGHT * 2 + 10,
        banner_bg,
    );
    draw_label(image, 6, 5, &banner, WHITE, 2);

    let badge = "LIVE";
    let badge_w = text_width(badge, 1) + 6;
    let badge_x = (width - badge_w - 4).max(0);
    fill_rect(image, badge_x, 4, badge_x + badge_w, 4 + GLYPH_HEIGHT + 5, ALERT);
    draw_label(image, badge_x + 3, 7, badge, WHITE, 1);

    let readout = format!("FPS: {fps:.1}");
    let readout_y = (height - GLYPH_HEIGHT - 6).max(0);
    fill_rect(
        image,
        0,
        readout_y,
        text_width(&readout, 1) + 6,
        height - 1,
        BLACK,
    );
    draw_label(image, 3, readout_y + 3, &readout, WHITE, 1);
}

fn text_width(text: &str, scale: i32) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE * scale
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if right < left || bottom < top {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(
    image: &mut RgbImage,
    mut x: i32,
    y: i32,
    text: &str,
    color: Rgb<u8>,
    scale: i32,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if (0..width).contains(&px) && (0..height).contains(&py) {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
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
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
