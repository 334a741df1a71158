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

use raw_vmdk_builder::create::{self, Config, DEFAULT_SECTOR_SIZE};
use std::{fs, path::PathBuf, process};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "raw-vmdk-builder",
    about = "Generates a VMDK descriptor exposing a raw block device to a virtual machine."
)]
struct CliOptions {
    /// Block device (or disk image) to describe.
    #[structopt(parse(from_os_str))]
    device: PathBuf,

    /// Path to the output descriptor. Any existing file will be overwritten.
    #[structopt(short, long, parse(from_os_str))]
    out: PathBuf,

    /// Describe the whole device as a single extent instead of reading its
    /// partition table.
    #[structopt(long)]
    full_device: bool,

    /// Reference the per-partition device nodes (`<device>1`, `<device>2`,
    /// ...) instead of offsets into the whole device.
    #[structopt(long)]
    relative: bool,

    /// Logical sector size of the device, in bytes.
    #[structopt(long, default_value = "512")]
    sector_size: u64,

    /// Total size of the device, in sectors.
    ///
    /// If no value is passed, the size is derived from the metadata of
    /// `device`; pass it explicitly for block devices whose metadata
    /// reports a zero length.
    #[structopt(long)]
    device_sectors: Option<u64>,
}

fn main() {
    env_logger::init();
    let cli = CliOptions::from_args();

    if cli.sector_size == 0 {
        eprintln!("Sector size must not be 0");
        process::exit(1);
    }
    if cli.sector_size != DEFAULT_SECTOR_SIZE {
        log::info!("Using a sector size of {} bytes", cli.sector_size);
    }

    let device_sectors = match cli.device_sectors {
        Some(sectors) => sectors,
        None => match fs::metadata(&cli.device) {
            Ok(metadata) => metadata.len() / cli.sector_size,
            Err(err) => {
                eprintln!("Failed to query the size of {}: {}", cli.device.display(), err);
                process::exit(1);
            }
        },
    };

    let device = match fs::File::open(&cli.device) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("Failed to open {}: {}", cli.device.display(), err);
            process::exit(1);
        }
    };

    let device_name = cli.device.display().to_string();
    let config = Config {
        device_name: &device_name,
        device_sectors,
        sector_size: cli.sector_size,
        output_file: &cli.out,
        partitioned: !cli.full_device,
        relative: cli.relative,
    };

    match create::create_raw_vmdk(device, &config) {
        Ok(output) => {
            println!("Descriptor written to {}", cli.out.display());
            if let Some(header_file) = output.header_file {
                println!(
                    "Device header ({} bytes) captured in {}",
                    output.header_bytes,
                    header_file.display()
                );
            }
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    }
}
