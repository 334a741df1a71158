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

//! Read-ahead buffer over the start of a device.
//!
//! The partition table and the pre-partition region that gets copied into
//! the sidecar file overlap: both live at the very start of the device. On
//! top of that, some platforms only hand out forward-only reads on raw block
//! devices. A [`DevicePrefix`] therefore reads the first few kilobytes once,
//! lets the parser inspect them in memory, and later replays them as the
//! beginning of the sidecar copy so that no byte is read twice from the
//! device, or dropped at the buffer boundary.

use std::io::{self, Cursor, Read};

/// Number of bytes read ahead from the start of the device. Large enough to
/// hold the GPT header plus a full 128-entry array, even with 4096-byte
/// sectors.
pub const PREFIX_LEN: u64 = 32 * 1024;

/// The buffered prefix of a device, together with the still-unread remainder.
pub struct DevicePrefix<R> {
    buffer: Vec<u8>,
    rest: R,
}

impl<R: Read> DevicePrefix<R> {
    /// Reads up to [`PREFIX_LEN`] bytes from the start of `device`.
    ///
    /// Devices smaller than [`PREFIX_LEN`] simply produce a shorter buffer.
    pub fn read_from(mut device: R) -> Result<Self, io::Error> {
        let mut buffer = Vec::with_capacity(PREFIX_LEN as usize);
        (&mut device).take(PREFIX_LEN).read_to_end(&mut buffer)?;
        Ok(DevicePrefix {
            buffer,
            rest: device,
        })
    }

    /// The buffered bytes, for the partition-table parser.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Turns the prefix back into a reader over the whole device, starting
    /// again from byte 0. The buffered bytes are replayed first, after which
    /// reading continues on the underlying device.
    pub fn into_reader(self) -> impl Read {
        Cursor::new(self.buffer).chain(self.rest)
    }
}

#[cfg(test)]
mod tests {
    use super::{DevicePrefix, PREFIX_LEN};
    use std::io::{Cursor, Read as _};

    #[test]
    fn replays_the_buffer_without_losing_bytes() {
        let device = (0..=255u8).cycle().take(40 * 1024).collect::<Vec<_>>();
        let prefix = DevicePrefix::read_from(Cursor::new(device.clone())).unwrap();
        assert_eq!(prefix.bytes().len() as u64, PREFIX_LEN);
        assert_eq!(prefix.bytes(), &device[..PREFIX_LEN as usize]);

        let mut replayed = Vec::new();
        prefix.into_reader().read_to_end(&mut replayed).unwrap();
        assert_eq!(replayed, device);
    }

    #[test]
    fn short_device() {
        let device = vec![0x5a; 1000];
        let prefix = DevicePrefix::read_from(Cursor::new(device.clone())).unwrap();
        assert_eq!(prefix.bytes(), &device[..]);

        let mut replayed = Vec::new();
        prefix.into_reader().read_to_end(&mut replayed).unwrap();
        assert_eq!(replayed, device);
    }
}
