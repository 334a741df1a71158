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

//! Descriptor synthesis for one device.
//!
//! [`create_raw_vmdk`] runs the whole pipeline: read the device prefix,
//! decode the partition table, capture the pre-partition region into the
//! sidecar file, plan the extent sequence, render and write the descriptor.
//! Everything is synchronous and single-pass; any failure aborts the run
//! and no partially written output is left behind.
//!
//! The function is a pure function of the device content and the [`Config`];
//! running it twice with the same inputs produces equivalent output files.
//! Synthesizing two descriptors for the same device concurrently is not
//! supported, since both runs would write the same sidecar path.

use crate::{
    descriptor::{DiskDescriptor, LayoutKind},
    header, partitions, plan,
    prefix::DevicePrefix,
};
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

/// Logical sector size assumed when the device doesn't report one.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Inputs of one descriptor synthesis.
#[derive(Debug)]
pub struct Config<'a> {
    /// Path of the device as the hypervisor will resolve it. Written
    /// verbatim into `FLAT` extent lines.
    pub device_name: &'a str,

    /// Total size of the device, in sectors.
    pub device_sectors: u64,

    /// Logical sector size of the device, in bytes.
    pub sector_size: u64,

    /// Path where to write the descriptor. Any existing file will be
    /// overwritten. The sidecar file is created next to it.
    pub output_file: &'a Path,

    /// If true, read the partition table and describe each partition
    /// individually; otherwise emit a single extent covering the whole
    /// device without touching the device at all.
    pub partitioned: bool,

    /// If true, data extents reference the per-partition device nodes
    /// (`{device_name}1`, `{device_name}2`, ...) at offset 0 instead of
    /// offsets into the whole device.
    pub relative: bool,
}

/// Side outputs of a successful synthesis.
#[derive(Debug)]
pub struct CreateOutput {
    /// Path of the sidecar file holding the pre-partition region, if one
    /// was created.
    pub header_file: Option<PathBuf>,
    /// Number of bytes copied into it.
    pub header_bytes: u64,
}

/// Error that can happen during a synthesis.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device could not be read.
    #[error("Failed to read from device {device}: {err}")]
    DeviceRead {
        device: String,
        #[source]
        err: io::Error,
    },

    /// Neither a GPT nor an MBR was recognized on the device.
    #[error("No GPT or MBR partition table recognized on {0}")]
    PartitionTableUnrecognized(String),

    /// Copying the pre-partition region into the sidecar file failed. The
    /// sidecar file has been removed.
    #[error("Failed to capture the device header into {}: {}", .path.display(), .err)]
    HeaderCapture {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    /// Writing the descriptor failed. The output file has been removed.
    #[error("Failed to write the descriptor to {}: {}", .path.display(), .err)]
    DescriptorWrite {
        path: PathBuf,
        #[source]
        err: io::Error,
    },

    /// The partition table cannot be laid out as extents.
    #[error("Invalid partition layout: {0}")]
    PreconditionViolation(#[from] plan::PreconditionViolation),
}

/// Synthesizes the descriptor for one device.
///
/// `device` must read the raw device from byte 0; it is only consumed in
/// partitioned mode, sequentially and exactly once.
pub fn create_raw_vmdk(device: impl Read, config: &Config) -> Result<CreateOutput, Error> {
    if !config.partitioned {
        log::info!(
            "Describing {} as a single {}-sector extent",
            config.device_name,
            config.device_sectors
        );
        let extents = plan::plan_full_device(config.device_sectors, config.device_name);
        let descriptor = DiskDescriptor::new(LayoutKind::FullDevice, config.device_sectors, extents);
        write_descriptor(&descriptor, config.output_file)?;
        return Ok(CreateOutput {
            header_file: None,
            header_bytes: 0,
        });
    }

    let prefix = DevicePrefix::read_from(device).map_err(|err| Error::DeviceRead {
        device: config.device_name.to_owned(),
        err,
    })?;

    let partitions = partitions::read_partition_table(prefix.bytes(), config.sector_size)
        .ok()
        .filter(|partitions| !partitions.is_empty())
        .ok_or_else(|| Error::PartitionTableUnrecognized(config.device_name.to_owned()))?;
    log::info!(
        "Found {} partitions on {}",
        partitions.len(),
        config.device_name
    );

    let header_sectors = partitions[0].first_lba;
    let sidecar = header::sidecar_path(config.output_file);

    let captured = if header_sectors > 0 {
        let num_bytes = header_sectors
            .checked_mul(config.sector_size)
            .ok_or_else(|| Error::HeaderCapture {
                path: sidecar.clone(),
                err: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "size of the pre-partition region overflows",
                ),
            })?;
        let captured =
            header::capture(prefix.into_reader(), num_bytes, &sidecar).map_err(|err| {
                Error::HeaderCapture {
                    path: sidecar.clone(),
                    err,
                }
            })?;
        Some(captured)
    } else {
        None
    };

    let header_name = sidecar
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let result = plan::plan_partitioned(
        &partitions,
        config.device_sectors,
        header_sectors,
        &header_name,
        config.relative,
        config.device_name,
    )
    .map_err(Error::from)
    .and_then(|extents| {
        let descriptor =
            DiskDescriptor::new(LayoutKind::PartitionedDevice, config.device_sectors, extents);
        write_descriptor(&descriptor, config.output_file)
    });

    if let Err(err) = result {
        // Don't leave an orphaned sidecar file behind when the descriptor
        // that would reference it was never written.
        if let Some(captured) = &captured {
            let _ = fs::remove_file(&captured.path);
        }
        return Err(err);
    }

    Ok(CreateOutput {
        header_file: captured.as_ref().map(|c| c.path.clone()),
        header_bytes: captured.as_ref().map(|c| c.len).unwrap_or(0),
    })
}

fn write_descriptor(descriptor: &DiskDescriptor, path: &Path) -> Result<(), Error> {
    log::info!("Writing descriptor to {}", path.display());
    descriptor
        .write_file(path)
        .map_err(|err| Error::DescriptorWrite {
            path: path.to_path_buf(),
            err,
        })
}

#[cfg(test)]
mod tests {
    use super::{create_raw_vmdk, Config, Error};
    use byteorder::{ByteOrder as _, LittleEndian};
    use std::{fs, io::Cursor, path::Path};
    use tempdir::TempDir;

    /// A 2 MiB device image (4096 sectors of 512 bytes) holding an MBR with
    /// one partition covering sectors 2048 to 4095.
    fn mbr_device() -> Vec<u8> {
        let mut image = vec![0; 4096 * 512];
        image[510] = 0x55;
        image[511] = 0xaa;
        image[446 + 4] = 0x83;
        LittleEndian::write_u32(&mut image[446 + 8..], 2048);
        LittleEndian::write_u32(&mut image[446 + 12..], 2048);
        image
    }

    fn config<'a>(out: &'a Path, partitioned: bool, relative: bool) -> Config<'a> {
        Config {
            device_name: "/dev/sdb",
            device_sectors: 4096,
            sector_size: 512,
            output_file: out,
            partitioned,
            relative,
        }
    }

    #[test]
    fn partitioned_device_end_to_end() {
        let dir = TempDir::new("vmdk-create-test").unwrap();
        let out = dir.path().join("usb.vmdk");

        let output = create_raw_vmdk(Cursor::new(mbr_device()), &config(&out, true, false)).unwrap();

        let sidecar = dir.path().join("usb-pt.vmdk");
        assert_eq!(output.header_file.as_deref(), Some(&*sidecar));
        assert_eq!(output.header_bytes, 2048 * 512);
        assert_eq!(fs::metadata(&sidecar).unwrap().len(), 2048 * 512);

        let rendered = fs::read_to_string(&out).unwrap();
        assert!(rendered.contains("createType=\"partitionedDevice\""));
        assert!(rendered.contains("RW 2048 FLAT \"usb-pt.vmdk\" 0"));
        assert!(rendered.contains("RW 2048 FLAT \"/dev/sdb\" 2048"));
        assert!(!rendered.contains("ZERO"));
    }

    #[test]
    fn relative_mode_end_to_end() {
        let dir = TempDir::new("vmdk-create-test").unwrap();
        let out = dir.path().join("usb.vmdk");

        create_raw_vmdk(Cursor::new(mbr_device()), &config(&out, true, true)).unwrap();

        let rendered = fs::read_to_string(&out).unwrap();
        assert!(rendered.contains("RW 2048 FLAT \"/dev/sdb1\" 0"));
    }

    #[test]
    fn full_device_mode_never_reads_the_device() {
        let dir = TempDir::new("vmdk-create-test").unwrap();
        let out = dir.path().join("usb.vmdk");

        // An empty reader; full-device mode must not even look at it.
        let output = create_raw_vmdk(Cursor::new(Vec::new()), &config(&out, false, false)).unwrap();
        assert!(output.header_file.is_none());

        let rendered = fs::read_to_string(&out).unwrap();
        assert!(rendered.contains("createType=\"fullDevice\""));
        assert!(rendered.contains("RW 4096 FLAT \"/dev/sdb\" 0"));
        assert!(!dir.path().join("usb-pt.vmdk").exists());
    }

    #[test]
    fn unrecognized_table_creates_no_files() {
        let dir = TempDir::new("vmdk-create-test").unwrap();
        let out = dir.path().join("usb.vmdk");

        let device = vec![0; 64 * 1024];
        let result = create_raw_vmdk(Cursor::new(device), &config(&out, true, false));
        assert!(matches!(result, Err(Error::PartitionTableUnrecognized(_))));
        assert!(!out.exists());
        assert!(!dir.path().join("usb-pt.vmdk").exists());
    }

    #[test]
    fn declared_size_smaller_than_partition_removes_sidecar() {
        let dir = TempDir::new("vmdk-create-test").unwrap();
        let out = dir.path().join("usb.vmdk");

        let mut config = config(&out, true, false);
        config.device_sectors = 3000; // partition ends at 4095
        let result = create_raw_vmdk(Cursor::new(mbr_device()), &config);
        assert!(matches!(result, Err(Error::PreconditionViolation(_))));
        assert!(!out.exists());
        assert!(!dir.path().join("usb-pt.vmdk").exists());
    }

    #[test]
    fn device_shorter_than_header_region_fails_cleanly() {
        let dir = TempDir::new("vmdk-create-test").unwrap();
        let out = dir.path().join("usb.vmdk");

        // Valid MBR but the device ends before the first partition starts.
        let device = mbr_device()[..100 * 512].to_vec();
        let result = create_raw_vmdk(Cursor::new(device), &config(&out, true, false));
        assert!(matches!(result, Err(Error::HeaderCapture { .. })));
        assert!(!dir.path().join("usb-pt.vmdk").exists());
    }
}
