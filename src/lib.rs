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

//! Generates VMDK descriptors that expose a raw block device to a virtual
//! machine without copying any of the device's data.
//!
//! # Overview
//!
//! A VMDK descriptor of `createType="fullDevice"` or
//! `createType="partitionedDevice"` is a small text file that a hypervisor
//! mounts as a virtual hard disk. Instead of holding the disk content itself,
//! it lists *extents*: contiguous sector ranges that are either backed by a
//! file or device (`FLAT`) or read as zeroes (`ZERO`). Concatenated in order,
//! the extents must reconstruct the device's addressable range exactly, with
//! no gap and no overlap.
//!
//! Building such a descriptor for a partitioned device requires:
//!
//! - reading the partition table of the device (GPT, falling back to legacy
//!   MBR), see [`partitions`];
//! - copying the boot sector and everything else that precedes the first
//!   partition into a sidecar file, see [`header`];
//! - synthesizing the extent sequence covering the whole device, see
//!   [`plan`];
//! - serializing the result to the descriptor text format, see
//!   [`descriptor`].
//!
//! The [`create`] module ties these steps together. The device is only ever
//! read from, never written to, and is read sequentially from the start: the
//! bytes needed by the table parser are buffered once and reused as the
//! beginning of the sidecar copy.

pub mod create;
pub mod descriptor;
pub mod header;
pub mod partitions;
pub mod plan;
pub mod prefix;
