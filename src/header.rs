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

//! Copy of the pre-partition region of a device into a sidecar file.
//!
//! The region between the start of the device and the first partition holds
//! the boot sector, the partition table, and on GPT disks the partition
//! entry array. Hypervisors cannot reference that region inside a raw device
//! through a `partitionedDevice` descriptor, so it is copied into a small
//! file stored next to the descriptor and referenced from there.

use std::{
    ffi::OsString,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

/// Result of copying the pre-partition region of a device.
#[derive(Debug)]
pub struct CapturedHeader {
    /// Path of the sidecar file, next to the descriptor.
    pub path: PathBuf,
    /// Number of bytes copied into it.
    pub len: u64,
}

/// Builds the sidecar path from the descriptor path by inserting `-pt`
/// before the extension: `usb.vmdk` becomes `usb-pt.vmdk`.
pub fn sidecar_path(descriptor: &Path) -> PathBuf {
    let mut name = descriptor
        .file_stem()
        .map(OsString::from)
        .unwrap_or_default();
    name.push("-pt");
    if let Some(extension) = descriptor.extension() {
        name.push(".");
        name.push(extension);
    }
    descriptor.with_file_name(name)
}

/// Copies exactly `num_bytes` bytes from `device` into a new file at
/// `sidecar`.
///
/// `device` must be positioned at byte 0 of the device; in practice it is
/// the replay reader of a [`crate::prefix::DevicePrefix`], so the bytes that
/// the partition parser already consumed are not read from the device again.
///
/// On any failure, including the device ending before `num_bytes`, the
/// partially written sidecar file is removed before the error is returned.
pub fn capture(
    device: impl Read,
    num_bytes: u64,
    sidecar: &Path,
) -> Result<CapturedHeader, io::Error> {
    let mut out = fs::File::create(sidecar)?;

    let result = io::copy(&mut device.take(num_bytes), &mut out).and_then(|copied| {
        if copied == num_bytes {
            Ok(copied)
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device ended before the end of the pre-partition region",
            ))
        }
    });

    match result {
        Ok(copied) => {
            log::info!("Copied {} bytes to {}", copied, sidecar.display());
            Ok(CapturedHeader {
                path: sidecar.to_path_buf(),
                len: copied,
            })
        }
        Err(err) => {
            let _ = fs::remove_file(sidecar);
            Err(err)
        }
    }
}
