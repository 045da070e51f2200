//! Hierarchy index chunk parsing.

use std::collections::VecDeque;

use crate::error::{DecodeError, DecodeResult};
use crate::reader::ByteReader;

/// Size of one hierarchy record in bytes.
pub const RECORD_SIZE: usize = 5;

/// One node entry in a hierarchy chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyRecord {
    /// Full node name, e.g. `"r042"`.
    pub name: String,
    /// Bit `i` is set when child `i` exists.
    pub child_mask: u8,
    /// Number of points stored in the node itself.
    pub point_count: u32,
}

impl HierarchyRecord {
    /// Depth of the node below the dataset root.
    #[must_use]
    pub fn level(&self) -> usize {
        self.name.len().saturating_sub(1)
    }
}

/// Parse a breadth-first hierarchy chunk rooted at `root_name`.
///
/// # Format
///
/// A sequence of 5-byte records in breadth-first order:
/// - Byte 0: child mask
/// - Bytes 1-4: point count (`u32`, little-endian)
///
/// The first record describes `root_name`. Child names are the parent name
/// followed by the child index digit, assigned in ascending index order.
/// Children announced by the mask but missing from the chunk belong to a
/// deeper chunk and are simply absent from the output.
///
/// # Errors
///
/// Returns an error if the length is not a multiple of the record size or
/// the chunk holds more records than its masks announce.
pub fn parse_hierarchy(data: &[u8], root_name: &str) -> DecodeResult<Vec<HierarchyRecord>> {
    if !data.len().is_multiple_of(RECORD_SIZE) {
        return Err(DecodeError::BufferTooSmall {
            expected: RECORD_SIZE,
            actual: data.len(),
        });
    }

    let count = data.len() / RECORD_SIZE;
    let mut records = Vec::with_capacity(count);
    let mut names: VecDeque<String> = VecDeque::from([root_name.to_string()]);
    let mut reader = ByteReader::new(data);

    for _ in 0..count {
        let child_mask = reader.read_u8("hierarchy")?;
        let point_count = reader.read_u32("hierarchy")?;
        let Some(name) = names.pop_front() else {
            return Err(DecodeError::InvalidFormat {
                context: "hierarchy",
                detail: format!("record {} has no announcing parent", records.len()),
            });
        };

        for index in 0..8u8 {
            if child_mask & (1 << index) != 0 {
                let mut child = name.clone();
                child.push(char::from(b'0' + index));
                names.push_back(child);
            }
        }

        records.push(HierarchyRecord {
            name,
            child_mask,
            point_count,
        });
    }

    Ok(records)
}
