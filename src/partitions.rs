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

//! Partition-table decoding.
//!
//! [`read_partition_table`] looks for a GPT first, then falls back to a
//! legacy MBR. Both tables live entirely within the first few kilobytes of
//! the device, so parsing operates on an in-memory copy of the device prefix
//! (see [`crate::prefix`]) and never touches the device itself.
//!
//! Partitions are returned in on-disk table order. Nothing is sorted or
//! repaired here; feeding an out-of-order or overlapping table to the
//! planner is reported there as a precondition violation.

use byteorder::{ByteOrder as _, LittleEndian};
use std::convert::TryFrom as _;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_HEADER_SIZE: usize = 92;
const GPT_MIN_ENTRY_SIZE: usize = 128;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;

/// Inclusive range of logical sectors occupied by one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// First sector of the partition.
    pub first_lba: u64,
    /// Last sector of the partition. Always `>= first_lba`.
    pub last_lba: u64,
}

/// Neither a GPT nor an MBR could be decoded from the device prefix.
#[derive(Debug, thiserror::Error)]
#[error("no GPT or MBR partition table recognized")]
pub struct NoTable;

/// Decodes the partition table found at the start of `prefix`.
///
/// `sector_size` is the logical sector size of the device the prefix was
/// read from; the GPT header is expected in the second sector.
///
/// Empty slots (null type GUID for GPT, type byte 0 for MBR) are not
/// included in the result. The result itself can be empty, for example for
/// a valid GPT whose every entry is unused.
pub fn read_partition_table(prefix: &[u8], sector_size: u64) -> Result<Vec<Partition>, NoTable> {
    if let Some(partitions) = parse_gpt(prefix, sector_size) {
        log::debug!("Found a GPT with {} used entries", partitions.len());
        return Ok(partitions);
    }

    if let Some(partitions) = parse_mbr(prefix) {
        log::debug!("Found an MBR with {} partitions", partitions.len());
        return Ok(partitions);
    }

    Err(NoTable)
}

/// Tries to decode a GPT. Returns `None` if anything doesn't look like a
/// valid GPT, in which case the caller falls back to the MBR.
fn parse_gpt(prefix: &[u8], sector_size: u64) -> Option<Vec<Partition>> {
    let sector_size = usize::try_from(sector_size).ok()?;
    if sector_size < GPT_MIN_HEADER_SIZE {
        return None;
    }

    // The GPT header occupies LBA 1, right after the protective MBR.
    let header = prefix.get(sector_size..sector_size.checked_mul(2)?)?;
    if header[..8] != GPT_SIGNATURE[..] {
        return None;
    }

    let header_size = usize::try_from(LittleEndian::read_u32(&header[12..16])).ok()?;
    if header_size < GPT_MIN_HEADER_SIZE || header_size > header.len() {
        return None;
    }

    // The stored CRC32 is computed with the CRC field itself zeroed out.
    let stored_crc = LittleEndian::read_u32(&header[16..20]);
    let mut scratch = header[..header_size].to_vec();
    for byte in &mut scratch[16..20] {
        *byte = 0;
    }
    if crc::crc32::checksum_ieee(&scratch) != stored_crc {
        return None;
    }

    let entries_lba = LittleEndian::read_u64(&header[72..80]);
    let num_entries = usize::try_from(LittleEndian::read_u32(&header[80..84])).ok()?;
    let entry_size = usize::try_from(LittleEndian::read_u32(&header[84..88])).ok()?;
    if entry_size < GPT_MIN_ENTRY_SIZE {
        return None;
    }

    let array_start = usize::try_from(entries_lba)
        .ok()?
        .checked_mul(sector_size)?;
    let array_len = num_entries.checked_mul(entry_size)?;
    let array = prefix.get(array_start..array_start.checked_add(array_len)?)?;

    let mut partitions = Vec::new();
    for entry in array.chunks_exact(entry_size) {
        // A null type GUID marks an unused slot. Unused slots can appear
        // anywhere in the array and are skipped, not treated as the end.
        if entry[..16].iter().all(|byte| *byte == 0) {
            continue;
        }

        let first_lba = LittleEndian::read_u64(&entry[32..40]);
        let last_lba = LittleEndian::read_u64(&entry[40..48]);
        partitions.push(Partition { first_lba, last_lba });
    }

    Some(partitions)
}

/// Tries to decode a legacy MBR. Returns `None` if the boot signature is
/// missing.
fn parse_mbr(prefix: &[u8]) -> Option<Vec<Partition>> {
    let sector = prefix.get(..512)?;
    if sector[510] != 0x55 || sector[511] != 0xaa {
        return None;
    }

    let mut partitions = Vec::new();
    let table = &sector[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 4 * MBR_ENTRY_SIZE];
    for entry in table.chunks_exact(MBR_ENTRY_SIZE) {
        // Primary entries are conventionally packed before any empty slot;
        // the first empty entry therefore ends the table.
        let type_byte = entry[4];
        let num_sectors = LittleEndian::read_u32(&entry[12..16]);
        if type_byte == 0 || num_sectors == 0 {
            break;
        }

        let first_lba = u64::from(LittleEndian::read_u32(&entry[8..12]));
        let last_lba = first_lba + u64::from(num_sectors) - 1;
        partitions.push(Partition { first_lba, last_lba });
    }

    Some(partitions)
}

#[cfg(test)]
mod tests {
    use super::{read_partition_table, Partition};
    use byteorder::{ByteOrder as _, LittleEndian};

    /// Builds a 1 KiB buffer holding an MBR with the given
    /// `(type, start_lba, num_sectors)` entries.
    fn mbr_image(entries: &[(u8, u32, u32)]) -> Vec<u8> {
        assert!(entries.len() <= 4);
        let mut buffer = vec![0; 1024];
        buffer[510] = 0x55;
        buffer[511] = 0xaa;
        for (i, (type_byte, start, num)) in entries.iter().enumerate() {
            let offset = 446 + i * 16;
            buffer[offset + 4] = *type_byte;
            LittleEndian::write_u32(&mut buffer[offset + 8..], *start);
            LittleEndian::write_u32(&mut buffer[offset + 12..], *num);
        }
        buffer
    }

    /// Builds a 32 KiB buffer holding a valid GPT whose entry array contains
    /// the given `(first_lba, last_lba)` ranges. `None` produces an unused
    /// slot at that position.
    fn gpt_image(sector_size: usize, entries: &[Option<(u64, u64)>]) -> Vec<u8> {
        let mut buffer = vec![0; 32 * 1024];
        let header = sector_size;
        buffer[header..header + 8].copy_from_slice(b"EFI PART");
        LittleEndian::write_u32(&mut buffer[header + 8..], 0x0001_0000); // revision
        LittleEndian::write_u32(&mut buffer[header + 12..], 92); // header size
        LittleEndian::write_u64(&mut buffer[header + 24..], 1); // current LBA
        LittleEndian::write_u64(&mut buffer[header + 72..], 2); // entries LBA
        LittleEndian::write_u32(&mut buffer[header + 80..], entries.len() as u32);
        LittleEndian::write_u32(&mut buffer[header + 84..], 128); // entry size

        let array = 2 * sector_size;
        for (i, entry) in entries.iter().enumerate() {
            if let Some((first, last)) = entry {
                let offset = array + i * 128;
                buffer[offset..offset + 16].copy_from_slice(&[0xaa; 16]); // type GUID
                LittleEndian::write_u64(&mut buffer[offset + 32..], *first);
                LittleEndian::write_u64(&mut buffer[offset + 40..], *last);
            }
        }

        // The CRC field is still zero at this point, which is exactly how
        // the checksum is defined to be computed.
        let crc = crc::crc32::checksum_ieee(&buffer[header..header + 92]);
        LittleEndian::write_u32(&mut buffer[header + 16..], crc);
        buffer
    }

    #[test]
    fn mbr_single_partition() {
        let image = mbr_image(&[(0x83, 2048, 1_046_528)]);
        let partitions = read_partition_table(&image, 512).unwrap();
        assert_eq!(
            partitions,
            vec![Partition { first_lba: 2048, last_lba: 1_048_575 }]
        );
    }

    #[test]
    fn mbr_stops_at_first_empty_entry() {
        let image = mbr_image(&[(0x83, 2048, 100), (0, 0, 0), (0x83, 5000, 100)]);
        let partitions = read_partition_table(&image, 512).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].first_lba, 2048);
    }

    #[test]
    fn mbr_all_entries_empty_yields_empty_list() {
        let image = mbr_image(&[]);
        assert!(read_partition_table(&image, 512).unwrap().is_empty());
    }

    #[test]
    fn gpt_skips_unused_slots() {
        let image = gpt_image(512, &[Some((34, 1000)), None, Some((2000, 3000))]);
        let partitions = read_partition_table(&image, 512).unwrap();
        assert_eq!(
            partitions,
            vec![
                Partition { first_lba: 34, last_lba: 1000 },
                Partition { first_lba: 2000, last_lba: 3000 },
            ]
        );
    }

    #[test]
    fn gpt_preferred_over_mbr() {
        // Both tables are valid; the GPT one must win.
        let mut image = gpt_image(512, &[Some((4096, 8191))]);
        let mbr = mbr_image(&[(0x83, 1, 10)]);
        image[..512].copy_from_slice(&mbr[..512]);
        let partitions = read_partition_table(&image, 512).unwrap();
        assert_eq!(partitions, vec![Partition { first_lba: 4096, last_lba: 8191 }]);
    }

    #[test]
    fn corrupted_gpt_falls_back_to_mbr() {
        let mut image = gpt_image(512, &[Some((4096, 8191))]);
        let mbr = mbr_image(&[(0x83, 1, 10)]);
        image[..512].copy_from_slice(&mbr[..512]);
        // Corrupt one byte of the GPT header, breaking its checksum.
        image[512 + 40] ^= 0xff;
        let partitions = read_partition_table(&image, 512).unwrap();
        assert_eq!(partitions, vec![Partition { first_lba: 1, last_lba: 10 }]);
    }

    #[test]
    fn gpt_with_4096_byte_sectors() {
        let image = gpt_image(4096, &[Some((256, 511))]);
        let partitions = read_partition_table(&image, 4096).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].first_lba, 256);
    }

    #[test]
    fn unrecognized_table() {
        let image = vec![0; 32 * 1024];
        assert!(read_partition_table(&image, 512).is_err());
    }

    #[test]
    fn short_buffer_is_not_a_table() {
        assert!(read_partition_table(&[0; 100], 512).is_err());
    }

    #[test]
    fn degenerate_sector_size_is_not_a_gpt() {
        // A sector too small to hold a GPT header must fall through to the
        // MBR path instead of tripping a slice bounds check.
        assert!(read_partition_table(&[0; 1024], 4).is_err());

        let image = mbr_image(&[(0x83, 2048, 100)]);
        let partitions = read_partition_table(&image, 4).unwrap();
        assert_eq!(partitions[0].first_lba, 2048);
    }
}
