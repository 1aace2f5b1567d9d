//! Burns a location/time panel into the bottom of a photo.
//!
//! Text is drawn with the 8x8 bitmap glyphs from `font8x8`, scaled to the
//! panel's font size. Layout is computed separately from drawing so it can
//! be inspected without pixels.

use chrono::{DateTime, Local, TimeZone};
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{DynamicImage, Pixel, Rgba, RgbaImage};
use std::fmt::Display;

use crate::constants::{
    GEOTAG_CORNER_RADIUS_PX, GEOTAG_HEADER, GEOTAG_MAX_FONT_PX, GEOTAG_MIN_FONT_PX, GEOTAG_PADDING_PX,
};
use crate::geo::{Coordinate, PositionSample};
use crate::geocoding::{join_non_empty, AddressRecord};

const PANEL_FILL: Rgba<u8> = Rgba([0, 0, 0, 102]);
const TOP_BORDER: Rgba<u8> = Rgba([255, 215, 0, 153]);
const TOP_BORDER_PX: u32 = 2;
const SHADOW: Rgba<u8> = Rgba([0, 0, 0, 204]);
const SHADOW_OFFSET: i64 = 2;
const HEADER_COLOR: Rgba<u8> = Rgba([255, 215, 0, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Font size for an image width: width / 25 clamped to [18, 28].
pub fn font_size_for_width(width: u32) -> u32 {
    (width / 25).clamp(GEOTAG_MIN_FONT_PX, GEOTAG_MAX_FONT_PX)
}

// Bitmap glyphs read best slightly narrower than the em size.
fn glyph_px(font_px: u32) -> u32 {
    (font_px * 3 / 4).max(8)
}

/// Rendered width of `text` at `font_px`.
pub fn text_width(text: &str, font_px: u32) -> u32 {
    text.chars().count() as u32 * glyph_px(font_px)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    /// Top-left corner of the first glyph.
    pub x: i64,
    pub y: i64,
    pub font_px: u32,
    pub bold: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeotagLayout {
    pub font_px: u32,
    pub line_height: u32,
    pub panel_top: u32,
    pub panel_height: u32,
    pub header: TextRun,
    pub left: Vec<TextRun>,
    pub right: Vec<TextRun>,
}

/// Left column text: the place line and the road line, blank ones dropped.
pub fn address_lines(address: &AddressRecord) -> Vec<String> {
    let place = if address.area.trim().is_empty() {
        &address.locality
    } else {
        &address.area
    };
    [
        join_non_empty(&[place, &address.state, &address.country]),
        join_non_empty(&[&address.road, &address.postcode]),
    ]
    .into_iter()
    .filter(|line| !line.is_empty())
    .collect()
}

pub fn coordinate_lines(coordinate: Coordinate) -> [String; 2] {
    [
        format!("Lat {:.6}°", coordinate.latitude),
        format!("Long {:.6}°", coordinate.longitude),
    ]
}

impl GeotagLayout {
    pub fn compute<Tz>(
        width: u32,
        height: u32,
        coordinate: Coordinate,
        address: &AddressRecord,
        taken_at: &DateTime<Tz>,
    ) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let font_px = font_size_for_width(width);
        let line_height = font_px + 8;
        let padding = GEOTAG_PADDING_PX;

        let mut left_text = address_lines(address);
        left_text.push(taken_at.format("%d/%m/%Y %H:%M:%S GMT%:z").to_string());
        let right_text = coordinate_lines(coordinate);

        let rows = left_text.len().max(right_text.len()) as u32;
        let header_height = line_height + 4;
        let panel_height = padding * 2 + header_height + rows * line_height;
        let panel_top = height.saturating_sub(panel_height);

        let header_px = font_px + 4;
        let header_x = (i64::from(width) - i64::from(text_width(GEOTAG_HEADER, header_px))) / 2;
        let header = TextRun {
            text: GEOTAG_HEADER.to_string(),
            x: header_x.max(0),
            y: i64::from(panel_top + padding),
            font_px: header_px,
            bold: true,
        };

        let content_top = i64::from(panel_top + padding + header_height);
        let row_y = |row: usize| content_top + row as i64 * i64::from(line_height);

        let left = left_text
            .into_iter()
            .enumerate()
            .map(|(row, text)| TextRun {
                text,
                x: i64::from(padding),
                y: row_y(row),
                font_px,
                bold: false,
            })
            .collect();

        let right = right_text
            .into_iter()
            .enumerate()
            .map(|(row, text)| {
                let x = i64::from(width) - i64::from(padding) - i64::from(text_width(&text, font_px));
                TextRun {
                    text,
                    x,
                    y: row_y(row),
                    font_px,
                    bold: false,
                }
            })
            .collect();

        Self {
            font_px,
            line_height,
            panel_top,
            panel_height,
            header,
            left,
            right,
        }
    }
}

fn blend_at(canvas: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= i64::from(canvas.width()) || y >= i64::from(canvas.height()) {
        return;
    }
    canvas.get_pixel_mut(x as u32, y as u32).blend(&color);
}

// Whether (x, y) inside a w x h box falls outside one of its rounded corners.
fn outside_corner(x: u32, y: u32, w: u32, h: u32, r: u32) -> bool {
    let cx = if x < r {
        r
    } else if x >= w.saturating_sub(r) {
        w.saturating_sub(r + 1)
    } else {
        return false;
    };
    let cy = if y < r {
        r
    } else if y >= h.saturating_sub(r) {
        h.saturating_sub(r + 1)
    } else {
        return false;
    };
    let dx = i64::from(x) - i64::from(cx);
    let dy = i64::from(y) - i64::from(cy);
    dx * dx + dy * dy > i64::from(r) * i64::from(r)
}

fn draw_panel(canvas: &mut RgbaImage, top: u32, height: u32) {
    let width = canvas.width();
    let height = height.min(canvas.height().saturating_sub(top));
    let radius = GEOTAG_CORNER_RADIUS_PX.min(width / 2).min(height / 2);

    for y in 0..height {
        for x in 0..width {
            if outside_corner(x, y, width, height, radius) {
                continue;
            }
            let fill = if y < TOP_BORDER_PX { TOP_BORDER } else { PANEL_FILL };
            canvas.get_pixel_mut(x, top + y).blend(&fill);
        }
    }
}

fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS
        .get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or([0; 8])
}

fn draw_text(canvas: &mut RgbaImage, run: &TextRun, dx: i64, dy: i64, color: Rgba<u8>) {
    let size = glyph_px(run.font_px);
    let mut pen_x = run.x + dx;
    for c in run.text.chars() {
        let rows = glyph(c);
        for oy in 0..size {
            let bits = rows[(oy * 8 / size) as usize];
            for ox in 0..size {
                if bits & (1 << (ox * 8 / size)) == 0 {
                    continue;
                }
                let px = pen_x + i64::from(ox);
                let py = run.y + dy + i64::from(oy);
                blend_at(canvas, px, py, color);
                if run.bold {
                    blend_at(canvas, px + 1, py, color);
                }
            }
        }
        pen_x += i64::from(size);
    }
}

fn draw_run(canvas: &mut RgbaImage, run: &TextRun, color: Rgba<u8>) {
    draw_text(canvas, run, SHADOW_OFFSET, SHADOW_OFFSET, SHADOW);
    draw_text(canvas, run, 0, 0, color);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeotagRenderer;

impl GeotagRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Draws the panel onto `image`, dated now in local time. Works with any
    /// address, including the synthetic fallback.
    pub fn annotate(&self, image: DynamicImage, location: &PositionSample, address: &AddressRecord) -> DynamicImage {
        self.annotate_at(image, location, address, &Local::now())
    }

    /// Like [`annotate`](Self::annotate) with an explicit capture time. The
    /// fix may be older than the photo when it came from the cache.
    pub fn annotate_at<Tz>(
        &self,
        image: DynamicImage,
        location: &PositionSample,
        address: &AddressRecord,
        captured_at: &DateTime<Tz>,
    ) -> DynamicImage
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut canvas = image.to_rgba8();
        let layout = GeotagLayout::compute(
            canvas.width(),
            canvas.height(),
            location.coordinate,
            address,
            captured_at,
        );
        self.render(&mut canvas, &layout);
        DynamicImage::ImageRgba8(canvas)
    }

    pub fn render(&self, canvas: &mut RgbaImage, layout: &GeotagLayout) {
        if canvas.width() == 0 || canvas.height() == 0 {
            return;
        }
        draw_panel(canvas, layout.panel_top, layout.panel_height);
        draw_run(canvas, &layout.header, HEADER_COLOR);
        for run in layout.left.iter().chain(&layout.right) {
            draw_run(canvas, run, TEXT_COLOR);
        }
    }
}
