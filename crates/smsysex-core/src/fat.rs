//! FAT filesystem helpers.
//!
//! The device stores files on a FAT volume and expects FAT-packed date and
//! time words in `open` and `mkdir` commands. Directory entries carry the
//! same encoding plus the classic attribute bits.

use chrono::{Datelike, Local, Timelike};

/// Entry is read-only.
pub const ATTR_READ_ONLY: u8 = 0x01;
/// Entry is hidden.
pub const ATTR_HIDDEN: u8 = 0x02;
/// Entry belongs to the system.
pub const ATTR_SYSTEM: u8 = 0x04;
/// Entry is a directory.
pub const ATTR_DIRECTORY: u8 = 0x10;
/// Entry has the archive bit set.
pub const ATTR_ARCHIVE: u8 = 0x20;

/// Pack a calendar date into a FAT date word.
///
/// Layout: bits 15-9 year since 1980, bits 8-5 month, bits 4-0 day.
/// Years before 1980 clamp to 1980, after 2107 to 2107.
#[must_use]
pub fn pack_date(year: i32, month: u32, day: u32) -> u16 {
    let year = year.clamp(1980, 2107) - 1980;
    ((year as u16) << 9) | ((month as u16 & 0x0F) << 5) | (day as u16 & 0x1F)
}

/// Pack a wall-clock time into a FAT time word.
///
/// Layout: bits 15-11 hour, bits 10-5 minute, bits 4-0 seconds / 2.
#[must_use]
pub fn pack_time(hour: u32, minute: u32, second: u32) -> u16 {
    ((hour as u16 & 0x1F) << 11) | ((minute as u16 & 0x3F) << 5) | (second as u16 / 2 & 0x1F)
}

/// Unpack a FAT date word into `(year, month, day)`.
#[must_use]
pub fn unpack_date(date: u16) -> (i32, u32, u32) {
    (
        i32::from(date >> 9) + 1980,
        u32::from((date >> 5) & 0x0F),
        u32::from(date & 0x1F),
    )
}

/// Unpack a FAT time word into `(hour, minute, second)`.
#[must_use]
pub fn unpack_time(time: u16) -> (u32, u32, u32) {
    (
        u32::from(time >> 11),
        u32::from((time >> 5) & 0x3F),
        u32::from(time & 0x1F) * 2,
    )
}

/// FAT date and time words for the current local wall-clock time.
#[must_use]
pub fn now() -> (u16, u16) {
    let now = Local::now();
    (
        pack_date(now.year(), now.month(), now.day()),
        pack_time(now.hour(), now.minute(), now.second()),
    )
}
