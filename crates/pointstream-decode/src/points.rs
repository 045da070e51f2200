//! Point record decoding.

use glam::{DVec3, Vec3};

use crate::error::{DecodeError, DecodeResult};
use crate::normals::{unpack_oct16, unpack_spheremapped};
use crate::reader::ByteReader;
use crate::{DecodedBuffers, PointAttribute, TightBounds, TileFormat};

/// Decode a tile of fixed-size point records.
///
/// # Format
///
/// The tile is a plain array of records laid out as described by
/// `format.layout`. Quantized positions are multiplied by `format.scale` and
/// are relative to `origin`, which is normally the minimum corner of the
/// node's bounding box.
///
/// # Errors
///
/// Returns an error if the layout has no (or more than one) position
/// attribute, or if the buffer length is not a multiple of the record size.
pub fn decode_points(
    data: &[u8],
    format: &TileFormat,
    origin: DVec3,
) -> DecodeResult<DecodedBuffers> {
    let layout = &format.layout;
    let position_count = layout
        .attributes
        .iter()
        .filter(|a| **a == PointAttribute::PositionCartesian)
        .count();
    if position_count != 1 {
        return Err(DecodeError::InvalidFormat {
            context: "layout",
            detail: format!("expected exactly one position attribute, found {position_count}"),
        });
    }

    let record_size = layout.record_size();
    if !data.len().is_multiple_of(record_size) {
        return Err(DecodeError::BufferTooSmall {
            expected: record_size,
            actual: data.len(),
        });
    }
    let count = data.len() / record_size;

    let mut out = DecodedBuffers {
        origin,
        positions: Vec::with_capacity(count),
        ..DecodedBuffers::default()
    };
    for attribute in &layout.attributes {
        match attribute {
            PointAttribute::ColorRgba => out.colors = Some(Vec::with_capacity(count)),
            PointAttribute::Intensity => out.intensities = Some(Vec::with_capacity(count)),
            PointAttribute::Classification => {
                out.classifications = Some(Vec::with_capacity(count));
            }
            PointAttribute::NormalSphereMapped
            | PointAttribute::NormalOct16
            | PointAttribute::Normal => out.normals = Some(Vec::with_capacity(count)),
            PointAttribute::PositionCartesian | PointAttribute::Padding(_) => {}
        }
    }

    let mut reader = ByteReader::new(data);
    for _ in 0..count {
        for attribute in &layout.attributes {
            read_attribute(&mut reader, *attribute, format.scale, &mut out)?;
        }
    }

    let (bounds, mean) = summarize(&out.positions);
    out.bounds = bounds;
    out.mean = mean;

    Ok(out)
}

#[allow(clippy::cast_possible_truncation)]
fn read_attribute(
    reader: &mut ByteReader<'_>,
    attribute: PointAttribute,
    scale: DVec3,
    out: &mut DecodedBuffers,
) -> DecodeResult<()> {
    match attribute {
        PointAttribute::PositionCartesian => {
            let x = reader.read_u32("position")?;
            let y = reader.read_u32("position")?;
            let z = reader.read_u32("position")?;
            let local = DVec3::new(f64::from(x), f64::from(y), f64::from(z)) * scale;
            out.positions.push(local.as_vec3());
        }
        PointAttribute::ColorRgba => {
            let rgba = [
                reader.read_u8("color")?,
                reader.read_u8("color")?,
                reader.read_u8("color")?,
                reader.read_u8("color")?,
            ];
            push(&mut out.colors, rgba);
        }
        PointAttribute::Intensity => {
            let intensity = reader.read_u16("intensity")?;
            push(&mut out.intensities, f32::from(intensity));
        }
        PointAttribute::Classification => {
            let class = reader.read_u8("classification")?;
            push(&mut out.classifications, class);
        }
        PointAttribute::NormalSphereMapped => {
            let bx = reader.read_u8("normal")?;
            let by = reader.read_u8("normal")?;
            push(&mut out.normals, unpack_spheremapped(bx, by));
        }
        PointAttribute::NormalOct16 => {
            let bx = reader.read_u8("normal")?;
            let by = reader.read_u8("normal")?;
            push(&mut out.normals, unpack_oct16(bx, by));
        }
        PointAttribute::Normal => {
            let x = reader.read_f32("normal")?;
            let y = reader.read_f32("normal")?;
            let z = reader.read_f32("normal")?;
            push(&mut out.normals, Vec3::new(x, y, z));
        }
        PointAttribute::Padding(n) => reader.skip(usize::from(n), "padding")?,
    }
    Ok(())
}

fn push<T>(buffer: &mut Option<Vec<T>>, value: T) {
    if let Some(buffer) = buffer {
        buffer.push(value);
    }
}

#[allow(clippy::cast_precision_loss)]
fn summarize(positions: &[Vec3]) -> (TightBounds, Vec3) {
    if positions.is_empty() {
        return (TightBounds::default(), Vec3::ZERO);
    }

    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    let mut sum = DVec3::ZERO;
    for p in positions {
        min = min.min(*p);
        max = max.max(*p);
        sum += p.as_dvec3();
    }

    let mean = (sum / positions.len() as f64).as_vec3();
    (TightBounds { min, max }, mean)
}
