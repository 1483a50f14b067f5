//! Small shared helpers: UUID validation, file hashing, sizes, ratios
//! and timecode arithmetic.

// Copyright 2024 Logan Wemyss
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use base64::Engine;
use regex::Regex;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::Error;

/// Progress callback for [`sha1_b64`]: `(path, bytes_done, bytes_total,
/// seconds_elapsed)`.
pub type HashProgress<'a> = &'a (dyn Fn(&Path, u64, u64, f64) + 'a);

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    })
}

fn uuid_rfc4122_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[8-9a-b][0-9a-f]{3}-[0-9a-f]{12}$",
        )
        .unwrap()
    })
}

fn uuid_find_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
    })
}

/// Checks that `uuid` is a lowercase hex UUID.
#[must_use]
pub fn check_uuid(uuid: &str) -> bool {
    uuid_re().is_match(uuid)
}

/// Checks that `uuid` is a lowercase RFC 4122 UUID (version 1-5,
/// variant 1).
#[must_use]
pub fn check_uuid_rfc4122(uuid: &str) -> bool {
    uuid_rfc4122_re().is_match(uuid)
}

/// Extracts the first UUID embedded in `input`, eg. from a file name.
#[must_use]
pub fn extract_uuid(input: &str) -> Option<&str> {
    uuid_find_re().find(input).map(|m| m.as_str())
}

/// Formats 16 bytes as a canonical lowercase UUID string.
#[must_use]
pub fn uuid_from_bytes(bytes: &[u8; 16]) -> String {
    let h = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Computes the SHA-1 of a file, base64 encoded, the form used by
/// PackingList `Hash` elements.
///
/// The file is read in 64 KiB chunks. An optional `callback` receives
/// progress reports, rate limited to one every 200ms per file plus a
/// final report on completion.
///
/// # Errors
///
/// Returns `Err` when the file cannot be opened or read.
pub fn sha1_b64(path: &Path, callback: Option<HashProgress<'_>>) -> Result<String, Error> {
    const BUF_SIZE: usize = 65536;

    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let total = file.metadata().map_err(|e| Error::io(path, e))?.len();

    let mut sha1 = Sha1::new();
    let mut buf = [0_u8; BUF_SIZE];
    let mut done: u64 = 0;
    let start = Instant::now();
    let mut last_report = start;

    loop {
        let read = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if read == 0 {
            break;
        }
        done += read as u64;
        sha1.update(&buf[..read]);

        if let Some(cb) = callback {
            let now = Instant::now();
            let due = now.duration_since(last_report).as_secs_f64() > 0.2;
            if due || done == total {
                last_report = now;
                cb(path, done, total, now.duration_since(start).as_secs_f64());
            }
        }
    }

    Ok(base64::engine::general_purpose::STANDARD.encode(sha1.finalize()))
}

/// Total size in bytes of all regular files under `folder`.
#[must_use]
pub fn folder_size(folder: &Path) -> u64 {
    WalkDir::new(folder)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Human readable size, power-of-1024 units.
#[must_use]
pub fn human_size(nbytes: u64) -> String {
    let mut size = nbytes as f64;
    for unit in ["", "ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if size.abs() < 1024.0 {
            return format!("{size:.2} {unit}B");
        }
        size /= 1024.0;
    }
    format!("{size:.2} YiB")
}

/// Converts a rational string (`"24000 1001"` or `"48000/1"`) to a
/// decimal value rounded to 2 digits. Plain decimal strings are parsed
/// as-is; anything else yields `None`.
#[must_use]
pub fn format_ratio(input: &str) -> Option<f64> {
    let sep = if input.contains('/') { '/' } else { ' ' };
    let parts: Vec<&str> = input.trim().split(sep).collect();

    let value = match parts.as_slice() {
        [num, den] => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        [single] => single.trim().parse().ok()?,
        _ => return None,
    };

    Some((value * 100.0).round() / 100.0)
}

/// Compares two decimal values up to a ±0.05 tolerance, the precision
/// kept when folding rational metadata to floats.
#[must_use]
pub fn compare_ratio(a: f64, b: f64) -> bool {
    (a - b).abs() <= 0.05
}

/// Converts a sample count to a `HH:MM:SS:FF` timecode at `edit_rate`.
#[must_use]
pub fn frames_to_timecode(edit_count: i64, edit_rate: f64) -> String {
    let rate = edit_rate.round() as i64;
    if rate == 0 || edit_count == 0 {
        return "00:00:00:00".to_owned();
    }

    let (s, f) = (edit_count / rate, edit_count % rate);
    let (m, s) = (s / 60, s % 60);
    let (h, m) = (m / 60, m % 60);
    format!("{h:02}:{m:02}:{s:02}:{f:02}")
}

/// Converts a `HH:MM:SS:FF` timecode to a sample count at `edit_rate`.
#[must_use]
pub fn timecode_to_frames(tc: &str, edit_rate: f64) -> Option<i64> {
    let rate = edit_rate.round() as i64;
    let parts: Vec<i64> = tc.split(':').map(|p| p.parse().ok()).collect::<Option<_>>()?;
    let [hours, minutes, seconds, frames] = parts.as_slice() else {
        return None;
    };

    Some(hours * rate * 3600 + minutes * rate * 60 + seconds * rate + frames)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    #[rstest]
    #[case("123e4567-e89b-12d3-a456-426655440000", true)]
    #[case("23e4567-e89b-12d3-a456-426655440000", false)]
    #[case("123E4567-E89B-12D3-A456-426655440000", false)]
    fn uuid_form(#[case] uuid: &str, #[case] valid: bool) {
        assert_eq!(check_uuid(uuid), valid);
    }

    #[rstest]
    #[case("123e4567-e89b-12d3-a456-426655440000", true)]
    // Version nibble 0 is not a valid RFC 4122 version.
    #[case("123e4567-e89b-02d3-a456-426655440000", false)]
    // Variant nibble must be 8-b.
    #[case("123e4567-e89b-12d3-c456-426655440000", false)]
    fn uuid_rfc4122_form(#[case] uuid: &str, #[case] valid: bool) {
        assert_eq!(check_uuid_rfc4122(uuid), valid);
    }

    #[rstest]
    fn uuid_extraction() {
        assert_eq!(
            extract_uuid("jp2k_123e4567-e89b-12d3-a456-426655440000_ecl"),
            Some("123e4567-e89b-12d3-a456-426655440000")
        );
        assert_eq!(extract_uuid("abcdefg"), None);
    }

    #[rstest]
    fn uuid_bytes_rendering() {
        let bytes = [
            0x12, 0x3e, 0x45, 0x67, 0xe8, 0x9b, 0x12, 0xd3, 0xa4, 0x56, 0x42, 0x66, 0x55, 0x44,
            0x00, 0x00,
        ];
        assert_eq!(
            uuid_from_bytes(&bytes),
            "123e4567-e89b-12d3-a456-426655440000"
        );
    }

    #[rstest]
    #[case("48000/1", Some(48000.0))]
    #[case("24000 1000", Some(24.0))]
    #[case("24000 1001", Some(23.98))]
    #[case("1,77", None)]
    #[case("1.77", Some(1.77))]
    fn ratio_formatting(#[case] input: &str, #[case] expected: Option<f64>) {
        assert_eq!(format_ratio(input), expected);
    }

    #[rstest]
    fn ratio_comparison() {
        assert!(compare_ratio(23.98, 24.0));
        assert!(!compare_ratio(23.9, 24.0));
    }

    #[rstest]
    #[case(48, 24.0, "00:00:02:00")]
    #[case(0, 24.0, "00:00:00:00")]
    #[case(86473, 24.0, "01:00:03:01")]
    fn timecode_from_frames(#[case] frames: i64, #[case] rate: f64, #[case] tc: &str) {
        assert_eq!(frames_to_timecode(frames, rate), tc);
    }

    #[rstest]
    fn frames_from_timecode() {
        assert_eq!(timecode_to_frames("00:00:02:00", 24.0), Some(48));
        assert_eq!(timecode_to_frames("garbage", 24.0), None);
    }

    #[rstest]
    fn hash_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.bin");
        std::fs::write(&path, b"the quick brown fox").unwrap();

        let first = sha1_b64(&path, None).unwrap();
        let second = sha1_b64(&path, None).unwrap();
        assert_eq!(first, second);
        // Known vector, sha1("the quick brown fox") base64 encoded.
        assert_eq!(first, "ztcfpyNSMb7Tg/rP3EHE3cwi7PE=");
    }

    #[rstest]
    fn size_rendering() {
        assert_eq!(human_size(0), "0.00 B");
        assert_eq!(human_size(65_425_721), "62.39 MiB");
    }
}
