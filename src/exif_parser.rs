//! EXIF reads on in-memory photos: orientation and embedded GPS.

use exif::{In, Reader, Tag, Value};
use image::DynamicImage;
use std::io::Cursor;

use crate::geo::Coordinate;

fn read_exif(data: &[u8]) -> Option<exif::Exif> {
    Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()
}

/// EXIF orientation (1-8), defaulting to 1 when absent.
pub fn orientation(data: &[u8]) -> u32 {
    read_exif(data)
        .and_then(|exif| {
            exif.get_field(Tag::Orientation, In::PRIMARY)
                .and_then(|f| f.value.get_uint(0))
        })
        .unwrap_or(1)
}

/// Rotates/flips `img` so it displays upright.
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn gps_component(exif: &exif::Exif, coord_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let coord = exif.get_field(coord_tag, In::PRIMARY)?;
    let Value::Rational(ref dms) = coord.value else {
        return None;
    };
    if dms.len() != 3 {
        return None;
    }
    let mut decimal = dms[0].to_f64() + dms[1].to_f64() / 60.0 + dms[2].to_f64() / 3600.0;

    // S and W hemispheres are negative
    let hemisphere = exif
        .get_field(ref_tag, In::PRIMARY)
        .map(|f| f.display_value().to_string())
        .unwrap_or_default();
    if hemisphere.starts_with('S') || hemisphere.starts_with('W') {
        decimal = -decimal;
    }
    Some(decimal)
}

/// Coordinate embedded by the camera, if any.
pub fn gps_coordinate(data: &[u8]) -> Option<Coordinate> {
    let exif = read_exif(data)?;
    let latitude = gps_component(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef)?;
    let longitude = gps_component(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef)?;
    let coordinate = Coordinate::new(latitude, longitude);
    coordinate.is_valid().then_some(coordinate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn tall_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(4, 10))
    }

    #[test]
    fn no_exif_means_upright_and_no_gps() {
        let png = {
            let mut out = Cursor::new(Vec::new());
            tall_image().write_to(&mut out, image::ImageFormat::Png).unwrap();
            out.into_inner()
        };
        assert_eq!(orientation(&png), 1);
        assert_eq!(gps_coordinate(&png), None);
        assert_eq!(gps_coordinate(b"not an image"), None);
    }

    #[test]
    fn quarter_turns_swap_dimensions() {
        for o in [5, 6, 7, 8] {
            let rotated = apply_orientation(tall_image(), o);
            assert_eq!((rotated.width(), rotated.height()), (10, 4), "orientation {o}");
        }
        for o in [1, 2, 3, 4, 0, 42] {
            let same = apply_orientation(tall_image(), o);
            assert_eq!((same.width(), same.height()), (4, 10), "orientation {o}");
        }
    }
}
