//! exFAT packed date/time encoding.
//!
//! exFAT stores timestamps as a 16-bit date, a 16-bit time, a 10ms
//! increment (0-199) and a signed UTC offset in 15 minute units, exactly
//! as decoded in the teacher's `dir::entry::parsed::ParsedFileEntry`
//! timestamp handling and produced by
//! `original_source/trunk/libexfat/utils.c`'s `exfat_unix2exfat`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// An exFAT timestamp: packed date, packed time, 10ms subsecond increment
/// and an optional UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub date: u16,
    pub time: u16,
    pub increment_10ms: u8,
    /// UTC offset in 15 minute units, `None` if the offset field is marked
    /// unset (high bit of the offset byte clear).
    pub utc_offset: Option<i8>,
}

const DAYS_IN_MONTH: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

impl Timestamp {
    /// Builds a timestamp from a `SystemTime`, storing no UTC offset
    /// (matching local-time-naive tools that always write `0x00`).
    pub fn from_system_time(t: SystemTime) -> Self {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let mut days = secs / 86400;
        let day_secs = secs % 86400;

        let mut year = 1970u64;
        loop {
            let year_days = if is_leap(year) { 366 } else { 365 };
            if days < year_days {
                break;
            }
            days -= year_days;
            year += 1;
        }

        let mut month = 0usize;
        loop {
            let mut month_days = DAYS_IN_MONTH[month];
            if month == 1 && is_leap(year) {
                month_days += 1;
            }
            if days < month_days {
                break;
            }
            days -= month_days;
            month += 1;
        }
        let day = days + 1;
        let month = month as u64 + 1;

        let hour = day_secs / 3600;
        let minute = (day_secs % 3600) / 60;
        let second = day_secs % 60;

        let year_offset = year.saturating_sub(1980).min(127);
        let date = ((year_offset as u16) << 9) | ((month as u16) << 5) | day as u16;
        let time = ((hour as u16) << 11) | ((minute as u16) << 5) | (second / 2) as u16;
        let increment_10ms = ((second % 2) * 100) as u8;

        Timestamp {
            date,
            time,
            increment_10ms,
            utc_offset: None,
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Converts to a `SystemTime`, ignoring any stored UTC offset (callers
    /// that need local time can combine `utc_offset` with this result).
    pub fn to_system_time(self) -> SystemTime {
        let day = (self.date & 0x1F) as u64;
        let month = ((self.date >> 5) & 0xF) as u64;
        let year = 1980 + ((self.date >> 9) & 0x7F) as u64;

        let second = ((self.time & 0x1F) as u64) * 2 + (self.increment_10ms as u64 / 100);
        let minute = ((self.time >> 5) & 0x3F) as u64;
        let hour = ((self.time >> 11) & 0x1F) as u64;

        let mut days = 0u64;
        for y in 1970..year {
            days += if is_leap(y) { 366 } else { 365 };
        }
        for m in 0..month.saturating_sub(1) as usize {
            days += DAYS_IN_MONTH[m];
            if m == 1 && is_leap(year) {
                days += 1;
            }
        }
        days += day.saturating_sub(1);

        let secs = days * 86400 + hour * 3600 + minute * 60 + second;
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// Decodes a raw UTC-offset byte as stored in a directory entry: bit 7
    /// marks the offset as present, bits 0-6 are a two's-complement count
    /// of 15 minute units.
    pub fn decode_utc_offset(raw: u8) -> Option<i8> {
        if raw & 0x80 != 0 {
            let bits = raw & 0x7F;
            let signed = if bits & 0x40 != 0 {
                bits.wrapping_sub(0x80) as i8
            } else {
                bits as i8
            };
            Some(signed)
        } else {
            None
        }
    }

    pub fn encode_utc_offset(offset: Option<i8>) -> u8 {
        match offset {
            None => 0,
            Some(v) => 0x80 | ((v as u8) & 0x7F),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_round_trip() {
        let t = Timestamp {
            date: (0 << 9) | (1 << 5) | 1,
            time: 0,
            increment_10ms: 0,
            utc_offset: None,
        };
        let st = t.to_system_time();
        assert_eq!(st.duration_since(UNIX_EPOCH).unwrap().as_secs() / 86400, 3652);
    }

    #[test]
    fn system_time_round_trips_through_packing() {
        let now = SystemTime::now();
        let secs_now = now.duration_since(UNIX_EPOCH).unwrap().as_secs();
        let ts = Timestamp::from_system_time(now);
        let back = ts.to_system_time();
        let secs_back = back.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(secs_now.abs_diff(secs_back) <= 1);
    }

    #[test]
    fn utc_offset_round_trip() {
        assert_eq!(Timestamp::decode_utc_offset(Timestamp::encode_utc_offset(Some(-4))), Some(-4));
        assert_eq!(Timestamp::decode_utc_offset(Timestamp::encode_utc_offset(None)), None);
        assert_eq!(Timestamp::decode_utc_offset(Timestamp::encode_utc_offset(Some(36))), Some(36));
    }
}
