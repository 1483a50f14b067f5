//! Drivers for the external essence inspection tools.
//!
//! MXF metadata, MXF unwrapping and audio statistics are delegated to
//! `asdcp-info`, `asdcp-unwrap` and `sox`, treated as black boxes whose
//! textual output is the interface. Everything is normalized into a
//! uniform [`ProbeRecord`] so checks never look at tool output
//! directly, and tests can substitute a [`MockProber`].

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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::util::format_ratio;
use crate::Error;

/// SMPTE 429-2 `ChannelFormat` codes mapped to a label and the allowed
/// channel count range.
pub const CONFIGURATION_CHANNELS: &[(i64, &str, i64, i64)] = &[
    (1, "5.1 with optional HI/VI", 6, 8),
    (2, "6.1 (5.1 + center surround) with optional HI/VI", 7, 10),
    (3, "7.1 (SDDS) with optional HI/VI", 8, 10),
    (4, "Wild Track Format", 1, 16),
    (5, "7.1 DS with optional HI/VI", 8, 10),
];

/// Looks up the channel configuration for a SMPTE `ChannelFormat` code.
#[must_use]
pub fn channel_configuration(code: i64) -> Option<(&'static str, i64, i64)> {
    CONFIGURATION_CHANNELS
        .iter()
        .find(|(c, _, _, _)| *c == code)
        .map(|(_, label, min, max)| (*label, *min, *max))
}

/// Per-track audio level statistics gathered from `sox`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct AudioStats {
    /// Per-channel RMS levels in dB, `|` separated.
    pub rms_lvl_db: String,
    /// Per-channel peak levels in dB, `|` separated.
    pub pk_lvl_db: String,
    pub rms_lvl_db_overall: String,
    pub pk_lvl_db_overall: String,
}

/// Normalized essence metadata extracted from an MXF file.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ProbeRecord {
    /// `SMPTE` or `MXFInterop`.
    pub label_set_type: Option<String>,
    pub asset_uuid: Option<String>,
    pub encrypted_essence: Option<bool>,
    pub cryptographic_key_id: Option<String>,
    pub container_duration: Option<i64>,
    pub edit_rate: Option<f64>,
    pub sample_rate: Option<f64>,

    // Picture.
    pub aspect_ratio: Option<f64>,
    pub stored_width: Option<i64>,
    pub stored_height: Option<i64>,
    /// `WxH`, derived from the stored dimensions.
    pub resolution: Option<String>,
    pub decomposition_levels: Option<i64>,
    pub precincts: Option<i64>,
    /// Mb/s.
    pub max_bitrate: Option<f64>,
    /// Mb/s.
    pub average_bitrate: Option<f64>,

    // Sound.
    pub audio_sampling_rate: Option<f64>,
    pub channel_count: Option<i64>,
    pub channel_format: Option<i64>,
    pub channel_configuration: Option<String>,
    pub quantization_bits: Option<i64>,
    pub block_align: Option<i64>,
    pub audio_analyze: Option<AudioStats>,

    // Atmos.
    pub max_channel_count: Option<i64>,
    pub max_object_count: Option<i64>,
    pub data_essence_coding: Option<String>,

    // Timed text.
    pub namespace_name: Option<String>,
    /// The MXF `ResourceID` of the wrapped timed-text document.
    pub asset_id: Option<String>,
}

/// The essence probing collaborator.
pub trait MxfProber {
    /// Probes the essence descriptor metadata of an MXF file.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the tool is missing, fails, or its output
    /// cannot be interpreted.
    fn probe(&self, path: &Path, stereoscopic: bool) -> Result<ProbeRecord, Error>;

    /// Unwraps the content of an MXF (timed-text XML plus ancillary
    /// resources, or audio tracks) into a scratch directory, removed
    /// when the returned guard drops.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the tool is missing or fails.
    fn unwrap(
        &self,
        path: &Path,
        key: Option<&str>,
        extra_args: &[String],
        prefix: Option<&str>,
    ) -> Result<tempfile::TempDir, Error>;

    /// Gathers RMS/peak statistics over a frame range of a sound MXF.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the tools are missing or fail.
    fn audio_stats(
        &self,
        path: &Path,
        channels: i64,
        entry_point: i64,
        duration: i64,
    ) -> Result<AudioStats, Error>;
}

/// Checks that a command is available on the system.
#[must_use]
pub fn check_command(name: &str) -> bool {
    which::which(name).is_ok()
}

fn execute_command(args: &[String]) -> Result<(String, String), Error> {
    let [program, rest @ ..] = args else {
        return Err(Error::Command("empty argument list".to_owned()));
    };

    let output = Command::new(program)
        .args(rest)
        .output()
        .map_err(|e| Error::Command(format!("error calling process {program}: {e}")))?;

    if !output.status.success() {
        return Err(Error::Command(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok((
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Production prober backed by the asdcplib tools and sox.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandProber;

impl CommandProber {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MxfProber for CommandProber {
    fn probe(&self, path: &Path, stereoscopic: bool) -> Result<ProbeRecord, Error> {
        if !path.is_file() {
            return Err(Error::Command(format!("file not found: {}", path.display())));
        }
        if !check_command("asdcp-info") {
            return Err(Error::Command("asdcp-info not available".to_owned()));
        }

        // Bitrate violations are checked here, not by the tool, so its
        // own threshold is pushed out of the way.
        let mut args = vec![
            "asdcp-info".to_owned(),
            "-v".to_owned(),
            "-i".to_owned(),
            "-d".to_owned(),
            "-r".to_owned(),
            "-t".to_owned(),
            "1000000".to_owned(),
        ];
        if stereoscopic {
            args.push("-3".to_owned());
        }
        args.push(path.display().to_string());

        let (stdout, stderr) = execute_command(&args)?;
        if !stderr.trim().is_empty() {
            return Err(Error::Command(format!("asdcp-info: {}", stderr.trim())));
        }

        Ok(ProbeRecord::from_tool_output(&stdout))
    }

    fn unwrap(
        &self,
        path: &Path,
        key: Option<&str>,
        extra_args: &[String],
        prefix: Option<&str>,
    ) -> Result<tempfile::TempDir, Error> {
        if !path.is_file() {
            return Err(Error::Command(format!("file not found: {}", path.display())));
        }
        if !check_command("asdcp-unwrap") {
            return Err(Error::Command("asdcp-unwrap not available".to_owned()));
        }

        let dir = tempfile::tempdir()
            .map_err(|e| Error::Command(format!("scratch directory: {e}")))?;

        let stem = path
            .file_stem()
            .map_or_else(|| "unwrap".to_owned(), |s| s.to_string_lossy().into_owned());
        let unwrap_prefix = dir.path().join(prefix.unwrap_or(&stem));

        let mut args = vec!["asdcp-unwrap".to_owned()];
        if let Some(key) = key {
            args.push("-k".to_owned());
            args.push(key.to_owned());
        }
        args.extend_from_slice(extra_args);
        args.push(path.display().to_string());
        args.push(unwrap_prefix.display().to_string());

        execute_command(&args)?;
        Ok(dir)
    }

    fn audio_stats(
        &self,
        path: &Path,
        channels: i64,
        entry_point: i64,
        duration: i64,
    ) -> Result<AudioStats, Error> {
        if !check_command("sox") {
            return Err(Error::Command("sox not available".to_owned()));
        }

        const PREFIX: &str = "wav_track";
        let unwrap_args = vec![
            "-1".to_owned(),
            "-f".to_owned(),
            entry_point.to_string(),
            "-d".to_owned(),
            duration.to_string(),
        ];
        let dir = self.unwrap(path, None, &unwrap_args, Some(PREFIX))?;

        let mut args = vec![
            "sox".to_owned(),
            "-t".to_owned(),
            "wavpcm".to_owned(),
            "-M".to_owned(),
        ];
        for channel in 1..=channels {
            args.push(
                dir.path()
                    .join(format!("{PREFIX}_{channel:02}.wav"))
                    .display()
                    .to_string(),
            );
        }
        args.push("-n".to_owned());
        args.push("stats".to_owned());

        // sox prints its stats report on stderr.
        let (_, stderr) = execute_command(&args)?;
        Ok(parse_sox_stats(&stderr))
    }
}

impl ProbeRecord {
    /// Normalizes the `Key : Value` stdout of the MXF metadata tool.
    #[must_use]
    pub fn from_tool_output(stdout: &str) -> Self {
        let mut map = BTreeMap::new();
        for line in stdout.lines() {
            if !line.contains(':') {
                continue;
            }
            let squeezed: String = line.chars().filter(|c| *c != ' ').collect();
            let Some((key, value)) = squeezed.split_once(':') else {
                continue;
            };
            let value = value.strip_suffix("Mb/s").unwrap_or(value);
            if value.is_empty() {
                continue;
            }
            map.insert(key.to_owned(), value.to_owned());
        }
        Self::from_map(&map)
    }

    fn from_map(map: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| map.get(key).cloned();
        let get_i64 = |key: &str| map.get(key).and_then(|v| v.parse::<i64>().ok());
        let get_f64 = |key: &str| map.get(key).and_then(|v| format_ratio(v));
        let get_bool = |key: &str| {
            map.get(key).map(|v| v == "Yes" || v == "true" || v == "True")
        };

        let mut record = Self {
            label_set_type: get("LabelSetType"),
            asset_uuid: get("AssetUUID"),
            encrypted_essence: get_bool("EncryptedEssence"),
            cryptographic_key_id: get("CryptographicKeyID"),
            container_duration: get_i64("ContainerDuration"),
            edit_rate: get_f64("EditRate"),
            sample_rate: get_f64("SampleRate"),
            aspect_ratio: get_f64("AspectRatio"),
            stored_width: get_i64("StoredWidth"),
            stored_height: get_i64("StoredHeight"),
            resolution: None,
            decomposition_levels: get_i64("DecompositionLevels"),
            precincts: get_i64("Precincts"),
            max_bitrate: get_f64("MaxBitRate"),
            average_bitrate: get_f64("AverageBitRate"),
            audio_sampling_rate: get_f64("AudioSamplingRate"),
            channel_count: get_i64("ChannelCount"),
            channel_format: get_i64("ChannelFormat"),
            channel_configuration: None,
            quantization_bits: get_i64("QuantizationBits"),
            block_align: get_i64("BlockAlign"),
            audio_analyze: None,
            max_channel_count: get_i64("MaxChannelCount"),
            max_object_count: get_i64("MaxObjectCount"),
            data_essence_coding: get("DataEssenceCoding"),
            namespace_name: get("NamespaceName"),
            asset_id: get("AssetID"),
        };

        if let (Some(w), Some(h)) = (record.stored_width, record.stored_height) {
            record.resolution = Some(format!("{w}x{h}"));
        }
        if let Some(format) = record.channel_format {
            record.channel_configuration =
                channel_configuration(format).map(|(label, _, _)| label.to_owned());
        }

        record
    }
}

fn parse_sox_stats(stderr: &str) -> AudioStats {
    let mut rms: Vec<String> = Vec::new();
    let mut peak: Vec<String> = Vec::new();

    for line in stderr.lines() {
        for (stat, out) in [("RMS lev dB", &mut rms), ("Pk lev dB", &mut peak)] {
            if let Some(rest) = line.strip_prefix(stat) {
                *out = rest
                    .split_whitespace()
                    .map(|v| if v == "-inf" { ".".to_owned() } else { v.to_owned() })
                    .collect();
            }
        }
    }

    // First column is the overall value, the rest are per channel.
    AudioStats {
        rms_lvl_db: rms.get(1..).unwrap_or(&[]).join("|"),
        pk_lvl_db: peak.get(1..).unwrap_or(&[]).join("|"),
        rms_lvl_db_overall: rms.first().cloned().unwrap_or_default(),
        pk_lvl_db_overall: peak.first().cloned().unwrap_or_default(),
    }
}

/// Glyph-coverage collaborator. The real implementation (FreeType
/// driven) lives outside this crate; [`NoopFontInspector`] reports no
/// coverage information so the glyph check is skipped.
pub trait FontInspector {
    /// The set of characters covered by the font at `path`, or `None`
    /// when the font cannot be inspected.
    fn glyphs(&self, path: &Path) -> Option<HashSet<char>>;
}

/// Default inspector: glyph coverage never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFontInspector;

impl FontInspector for NoopFontInspector {
    fn glyphs(&self, _path: &Path) -> Option<HashSet<char>> {
        None
    }
}

/// Test prober returning canned records.
#[derive(Debug, Default, Clone)]
pub struct MockProber {
    pub records: HashMap<PathBuf, ProbeRecord>,
}

impl MockProber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, record: ProbeRecord) {
        self.records.insert(path.into(), record);
    }
}

impl MxfProber for MockProber {
    fn probe(&self, path: &Path, _stereoscopic: bool) -> Result<ProbeRecord, Error> {
        self.records
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Command(format!("no canned probe for {}", path.display())))
    }

    fn unwrap(
        &self,
        path: &Path,
        _key: Option<&str>,
        _extra_args: &[String],
        _prefix: Option<&str>,
    ) -> Result<tempfile::TempDir, Error> {
        Err(Error::Command(format!(
            "no canned unwrap for {}",
            path.display()
        )))
    }

    fn audio_stats(
        &self,
        path: &Path,
        _channels: i64,
        _entry_point: i64,
        _duration: i64,
    ) -> Result<AudioStats, Error> {
        Err(Error::Command(format!(
            "no canned audio stats for {}",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    const PICTURE_DUMP: &str = "\
File essence type is JPEG 2000 pictures.\n\
LabelSetType: SMPTE\n\
AssetUUID: b91f0dd6-26d7-4b2a-9a95-0b04ffbbe6e3\n\
EncryptedEssence: No\n\
ContainerDuration: 480\n\
EditRate: 24/1\n\
SampleRate: 24/1\n\
AspectRatio: 185/100\n\
StoredWidth: 1998\n\
StoredHeight: 1080\n\
DecompositionLevels: 5\n\
Max BitRate: 207.71 Mb/s\n\
Average BitRate: 98.21 Mb/s\n";

    #[rstest]
    fn picture_dump_is_normalized() {
        let record = ProbeRecord::from_tool_output(PICTURE_DUMP);
        assert_eq!(record.label_set_type.as_deref(), Some("SMPTE"));
        assert_eq!(record.encrypted_essence, Some(false));
        assert_eq!(record.container_duration, Some(480));
        assert_eq!(record.edit_rate, Some(24.0));
        assert_eq!(record.aspect_ratio, Some(1.85));
        assert_eq!(record.resolution.as_deref(), Some("1998x1080"));
        assert_eq!(record.decomposition_levels, Some(5));
        assert_eq!(record.max_bitrate, Some(207.71));
        assert_eq!(record.average_bitrate, Some(98.21));
    }

    #[rstest]
    fn sound_dump_derives_channel_configuration() {
        let record = ProbeRecord::from_tool_output(
            "LabelSetType: SMPTE\n\
             AudioSamplingRate: 48000/1\n\
             ChannelCount: 6\n\
             ChannelFormat: 1\n\
             QuantizationBits: 24\n\
             BlockAlign: 18\n",
        );
        assert_eq!(record.audio_sampling_rate, Some(48000.0));
        assert_eq!(record.channel_count, Some(6));
        assert_eq!(
            record.channel_configuration.as_deref(),
            Some("5.1 with optional HI/VI")
        );
    }

    #[rstest]
    fn sox_stats_are_split_per_channel() {
        let stats = parse_sox_stats(
            "DC offset   0.000015  0.000015  0.000011\n\
             RMS lev dB  -27.30    -26.20    -31.10\n\
             Pk lev dB   -6.00     -5.10     -9.30\n",
        );
        assert_eq!(stats.rms_lvl_db_overall, "-27.30");
        assert_eq!(stats.rms_lvl_db, "-26.20|-31.10");
        assert_eq!(stats.pk_lvl_db, "-5.10|-9.30");
    }
}
