// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Extent-sequence synthesis.
//!
//! Given the ordered partition list and the total size of the device,
//! [`plan_partitioned`] produces the sequence of extents that the descriptor
//! will declare. The sequence always covers the sector range
//! `[0, device_sectors)` exactly once: the sidecar-backed header extent
//! first, then for each partition an optional zero-fill extent closing the
//! gap before it followed by its data extent, and finally a zero-fill extent
//! up to the declared device size if the last partition stops short of it.

use crate::partitions::Partition;

/// One contiguous region of the synthesized virtual disk. All extents are
/// read-write, serialized as `RW`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    /// Length of the region, in sectors.
    pub size_sectors: u64,
    /// What backs the region.
    pub kind: ExtentKind,
}

/// What backs an extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentKind {
    /// Backed by the file or device at `path`, starting `offset_sectors`
    /// into it.
    Flat {
        path: String,
        offset_sectors: u64,
    },
    /// Unbacked region that reads as zeroes.
    Zero,
}

impl Extent {
    fn flat(size_sectors: u64, path: impl Into<String>, offset_sectors: u64) -> Extent {
        Extent {
            size_sectors,
            kind: ExtentKind::Flat {
                path: path.into(),
                offset_sectors,
            },
        }
    }

    fn zero(size_sectors: u64) -> Extent {
        Extent {
            size_sectors,
            kind: ExtentKind::Zero,
        }
    }
}

/// The supplied partition list cannot be laid out as extents. These are
/// caller errors and are reported rather than silently repaired.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionViolation {
    #[error("partition list is empty")]
    NoPartitions,
    #[error("partition {index} ends before it starts")]
    InvertedRange { index: usize },
    #[error("partition {index} overlaps the region before it or is out of order")]
    OutOfOrder { index: usize },
    #[error("partition {index} extends past the declared end of the device")]
    PastEnd { index: usize },
}

/// Produces the extent sequence for a partitioned device.
///
/// `header_sectors` is the size of the region copied into the sidecar file
/// at `header_path`; the orchestration sets it to the first partition's
/// starting sector. When it is 0 (a partition starting at sector 0), no
/// header extent is emitted at all.
///
/// In `relative` mode, each data extent references the per-partition device
/// node `{device_name}{i}` (1-based, in table order) at offset 0 instead of
/// an offset into the whole device.
pub fn plan_partitioned(
    partitions: &[Partition],
    device_sectors: u64,
    header_sectors: u64,
    header_path: &str,
    relative: bool,
    device_name: &str,
) -> Result<Vec<Extent>, PreconditionViolation> {
    if partitions.is_empty() {
        return Err(PreconditionViolation::NoPartitions);
    }

    let mut extents = Vec::with_capacity(partitions.len() * 2 + 2);

    let mut cursor = header_sectors;
    if header_sectors > 0 {
        extents.push(Extent::flat(header_sectors, header_path, 0));
    }

    for (index, partition) in partitions.iter().enumerate() {
        if partition.first_lba > partition.last_lba {
            return Err(PreconditionViolation::InvertedRange { index });
        }
        if partition.first_lba < cursor {
            return Err(PreconditionViolation::OutOfOrder { index });
        }

        // Unallocated space before the partition reads as zeroes.
        if partition.first_lba > cursor {
            extents.push(Extent::zero(partition.first_lba - cursor));
            cursor = partition.first_lba;
        }

        let size = (partition.last_lba - partition.first_lba)
            .checked_add(1)
            .ok_or(PreconditionViolation::PastEnd { index })?;
        if relative {
            extents.push(Extent::flat(size, format!("{}{}", device_name, index + 1), 0));
        } else {
            extents.push(Extent::flat(size, device_name, partition.first_lba));
        }

        cursor = cursor
            .checked_add(size)
            .ok_or(PreconditionViolation::PastEnd { index })?;
        if cursor > device_sectors {
            return Err(PreconditionViolation::PastEnd { index });
        }
    }

    // Pad up to the declared device size, so that the extents cover the
    // addressable range exactly.
    if cursor < device_sectors {
        extents.push(Extent::zero(device_sectors - cursor));
    }

    Ok(extents)
}

/// Produces the single-extent sequence of a non-partitioned device: the
/// whole device as one `FLAT` extent at offset 0.
pub fn plan_full_device(device_sectors: u64, device_name: &str) -> Vec<Extent> {
    vec![Extent::flat(device_sectors, device_name, 0)]
}
