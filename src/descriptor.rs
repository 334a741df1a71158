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

//! Serialization of a [`DiskDescriptor`] to the VMDK descriptor text format.
//!
//! The format is a header block, one line per extent, then fixed
//! disk-database (`ddb.*`) metadata lines. The geometry uses the
//! conventional 16 heads and 63 sectors per track, with the cylinder count
//! clamped to 16383 as BIOS CHS addressing requires.

use crate::plan::{Extent, ExtentKind};
use std::{fmt, fs, io, path::Path};
use uuid::Uuid;

pub const HEADS: u64 = 16;
pub const SECTORS_PER_TRACK: u64 = 63;
const MAX_CYLINDERS: u64 = 16383;

/// Which `createType` the descriptor declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// One extent spanning the whole device.
    FullDevice,
    /// Header, data and zero-fill extents following the partition table.
    PartitionedDevice,
}

impl LayoutKind {
    fn as_str(self) -> &'static str {
        match self {
            LayoutKind::FullDevice => "fullDevice",
            LayoutKind::PartitionedDevice => "partitionedDevice",
        }
    }
}

/// Everything that goes into one descriptor file.
#[derive(Debug)]
pub struct DiskDescriptor {
    /// Identifier written as `ddb.uuid.image`.
    pub image_uuid: Uuid,
    pub layout: LayoutKind,
    /// CHS cylinder count, see [`cylinders`].
    pub cylinders: u64,
    /// Ordered extent sequence covering the device exactly.
    pub extents: Vec<Extent>,
}

impl DiskDescriptor {
    /// Builds a descriptor with a freshly generated image identifier.
    pub fn new(layout: LayoutKind, device_sectors: u64, extents: Vec<Extent>) -> DiskDescriptor {
        DiskDescriptor {
            image_uuid: Uuid::new_v4(),
            layout,
            cylinders: cylinders(device_sectors),
            extents,
        }
    }

    /// Writes the rendered descriptor to a file at `path`.
    ///
    /// The content is rendered in memory first and written in one operation.
    /// If writing fails, the partially written file is removed before the
    /// error is returned; a half-written descriptor must never be left
    /// behind looking like valid output.
    pub fn write_file(&self, path: &Path) -> Result<(), io::Error> {
        match fs::write(path, self.to_string().as_bytes()) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(path);
                Err(err)
            }
        }
    }
}

impl fmt::Display for DiskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "# Disk DescriptorFile")?;
        writeln!(f, "version=1")?;
        writeln!(f, "CID=8902101c")?;
        writeln!(f, "parentCID=ffffffff")?;
        writeln!(f, "createType=\"{}\"", self.layout.as_str())?;
        for extent in &self.extents {
            writeln!(f, "{}", extent)?;
        }
        writeln!(f, "ddb.virtualHWVersion = \"4\"")?;
        writeln!(f, "ddb.adapterType=\"ide\"")?;
        writeln!(f, "ddb.geometry.cylinders=\"{}\"", self.cylinders)?;
        writeln!(f, "ddb.geometry.heads=\"{}\"", HEADS)?;
        writeln!(f, "ddb.geometry.sectors=\"{}\"", SECTORS_PER_TRACK)?;
        writeln!(f, "ddb.geometry.biosCylinders=\"{}\"", self.cylinders)?;
        writeln!(f, "ddb.geometry.biosHeads=\"{}\"", HEADS)?;
        writeln!(f, "ddb.geometry.biosSectors=\"{}\"", SECTORS_PER_TRACK)?;
        writeln!(f, "ddb.uuid.image=\"{}\"", self.image_uuid)?;
        writeln!(
            f,
            "ddb.uuid.parent=\"00000000-0000-0000-0000-000000000000\""
        )?;
        writeln!(
            f,
            "ddb.uuid.modification=\"b0004a36-2323-433e-9bbc-103368bc5e41\""
        )?;
        write!(
            f,
            "ddb.uuid.parentmodification=\"00000000-0000-0000-0000-000000000000\""
        )
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ExtentKind::Flat {
                path,
                offset_sectors,
            } => write!(
                f,
                "RW {} FLAT \"{}\" {}",
                self.size_sectors, path, offset_sectors
            ),
            ExtentKind::Zero => write!(f, "RW {} ZERO", self.size_sectors),
        }
    }
}

/// CHS cylinder count of a device: `device_sectors / heads / sectors per
/// track`, clamped to 16383.
pub fn cylinders(device_sectors: u64) -> u64 {
    (device_sectors / HEADS / SECTORS_PER_TRACK).min(MAX_CYLINDERS)
}
