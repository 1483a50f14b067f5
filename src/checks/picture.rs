//! Picture essence checks: DCI resolutions, JPEG 2000 wavelet levels,
//! bitrate ceilings and edit rate policies.

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

use super::{Checker, CheckResult};
use crate::model::{Asset, CompositionPlaylist, EssenceKind};
use crate::util::compare_ratio;
use crate::Schema;

/// Standard 2K container resolutions.
pub const RESOLUTIONS_2K: [&str; 3] = ["1998x1080", "2048x858", "2048x1080"];
/// Standard 4K container resolutions.
pub const RESOLUTIONS_4K: [&str; 3] = ["3996x2160", "4096x1716", "4096x2160"];

/// Allowed edit rates per container and dimension.
const EDITRATES_2K_2D: [f64; 6] = [24.0, 25.0, 30.0, 48.0, 50.0, 60.0];
const EDITRATES_2K_3D: [f64; 6] = [24.0, 25.0, 30.0, 48.0, 50.0, 60.0];
const EDITRATES_4K_2D: [f64; 3] = [24.0, 25.0, 30.0];
const EDITRATES_4K_3D: [f64; 0] = [];

/// Archival edit rates, playable on a limited hardware base.
const EDITRATES_ARCHIVAL: [f64; 4] = [16.0, 200.0 / 11.0, 20.0, 240.0 / 11.0];

/// Minimum edit rates requiring a Series II (HFR capable) projection
/// server.
const MIN_EDITRATE_SERIES2_2D: f64 = 96.0;
const MIN_EDITRATE_SERIES2_3D: f64 = 48.0;

/// Bitrate ceilings (Mb/s) from the DCI recommended practice.
const MAX_DCI_BITRATE: f64 = 250.0;
const MAX_HFR_BITRATE: f64 = 500.0;
const MAX_DVI_BITRATE: f64 = 400.0;

/// The measured maximum is a worst-case approximation (biggest frame
/// times the edit rate), encrypted tracks add KLV overhead on top.
const BITRATE_TOLERANCE: f64 = 0.05;

/// Average bitrate must sit this percentage below the ceiling.
const AVERAGE_BITRATE_MARGIN: f64 = 2.0;

/// Wavelet transform levels mandated by SMPTE 429-2.
const DWT_LEVELS_2K: i64 = 5;
const DWT_LEVELS_4K: i64 = 6;

/// Edit rate threshold switching to the HFR bitrate ceiling, per
/// container and dimension.
fn hfr_bitrate_threshold(resolution: &str, stereoscopic: bool) -> Option<f64> {
    if RESOLUTIONS_2K.contains(&resolution) {
        Some(if stereoscopic { 48.0 } else { 60.0 })
    } else if RESOLUTIONS_4K.contains(&resolution) {
        Some(if stereoscopic { 0.0 } else { 48.0 })
    } else {
        None
    }
}

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for cpl in &dcp.cpls {
        for (kind, asset) in cpl.assets() {
            if kind != EssenceKind::Picture {
                continue;
            }
            let stack = vec![cpl.file_name.clone(), asset.handle()];

            checker.run_check(
                "check_picture_cpl_resolution",
                "Picture resolution DCI compliance.",
                &stack,
                |c| check_picture_cpl_resolution(c, asset),
            );
            checker.run_check(
                "check_picture_cpl_encoding",
                "Picture wavelet transform levels SMPTE compliance.",
                &stack,
                |c| check_picture_cpl_encoding(c, asset),
            );
            checker.run_check(
                "check_picture_cpl_max_bitrate",
                "Picture maximum bitrate DCI compliance.",
                &stack,
                |c| check_picture_cpl_max_bitrate(c, cpl, asset),
            );
            checker.run_check(
                "check_picture_cpl_avg_bitrate",
                "Picture average bitrate DCI compliance.",
                &stack,
                |c| check_picture_cpl_avg_bitrate(c, cpl, asset),
            );
            checker.run_check(
                "check_picture_cpl_framerate",
                "Picture framerate DCI compliance.",
                &stack,
                |c| check_picture_cpl_framerate(c, asset),
            );
            checker.run_check(
                "check_picture_cpl_archival_framerate",
                "Picture archival framerate.",
                &stack,
                |c| check_picture_cpl_archival_framerate(c, asset),
            );
            checker.run_check(
                "check_picture_cpl_hfr_framerate",
                "Picture HFR capable (Series II) framerate.",
                &stack,
                |c| check_picture_cpl_hfr_framerate(c, asset),
            );
            checker.run_check(
                "check_picture_cpl_editrate_framerate",
                "Picture editrate / framerate coherence check.",
                &stack,
                |c| check_picture_cpl_editrate_framerate(c, asset),
            );
        }
    }
}

/// The bitrate ceiling applying to this asset: DolbyVision, HFR or
/// plain DCI.
fn picture_max_bitrate(cpl: &CompositionPlaylist, asset: &Asset) -> f64 {
    let resolution = asset
        .probe
        .as_ref()
        .and_then(|p| p.resolution.as_deref())
        .unwrap_or("");
    let edit_rate = asset
        .probe
        .as_ref()
        .and_then(|p| p.edit_rate)
        .unwrap_or(0.0);
    let stereoscopic = asset.stereoscopic.unwrap_or(false);

    if cpl.dolby_vision {
        return MAX_DVI_BITRATE;
    }
    match hfr_bitrate_threshold(resolution, stereoscopic) {
        Some(threshold) if edit_rate >= threshold => MAX_HFR_BITRATE,
        _ => MAX_DCI_BITRATE,
    }
}

fn check_picture_cpl_resolution(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(resolution) = asset.probe.as_ref().and_then(|p| p.resolution.as_deref()) else {
        return Ok(());
    };

    let is_dci =
        RESOLUTIONS_2K.contains(&resolution) || RESOLUTIONS_4K.contains(&resolution);
    if !is_dci {
        c.error("Picture have non-DCI Resolution");
    }
    Ok(())
}

fn check_picture_cpl_encoding(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    if c.dcp.schema != Schema::Smpte {
        return Ok(());
    }
    let Some(probe) = &asset.probe else {
        return Ok(());
    };
    let (Some(levels), Some(resolution)) =
        (probe.decomposition_levels, probe.resolution.as_deref())
    else {
        return Ok(());
    };

    let expected = if RESOLUTIONS_2K.contains(&resolution) {
        DWT_LEVELS_2K
    } else if RESOLUTIONS_4K.contains(&resolution) {
        DWT_LEVELS_4K
    } else {
        return Ok(());
    };

    if levels != expected {
        c.error(format!(
            "Picture must have {expected} wavelet transform levels, {levels} found"
        ));
    }
    Ok(())
}

fn check_picture_cpl_max_bitrate(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
    asset: &Asset,
) -> CheckResult {
    let Some(max_bitrate) = asset.probe.as_ref().and_then(|p| p.max_bitrate) else {
        return Ok(());
    };

    let ceiling = picture_max_bitrate(cpl, asset) + BITRATE_TOLERANCE;
    if max_bitrate > ceiling {
        c.error(format!(
            "Exceed DCI maximum bitrate ({ceiling} Mb/s) : {max_bitrate} Mb/s"
        ));
    }
    Ok(())
}

fn check_picture_cpl_avg_bitrate(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
    asset: &Asset,
) -> CheckResult {
    let Some(avg_bitrate) = asset.probe.as_ref().and_then(|p| p.average_bitrate) else {
        return Ok(());
    };

    let dci_bitrate = picture_max_bitrate(cpl, asset);
    let ceiling = dci_bitrate - (dci_bitrate * AVERAGE_BITRATE_MARGIN) / 100.0;
    if avg_bitrate > ceiling {
        c.error(format!(
            "Exceed DCI safe average bitrate ({ceiling} Mb/s) : {avg_bitrate} Mb/s"
        ));
    }
    Ok(())
}

fn check_picture_cpl_framerate(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(resolution) = asset.probe.as_ref().and_then(|p| p.resolution.as_deref()) else {
        return Ok(());
    };
    let Some(edit_rate) = asset.edit_rate else {
        return Ok(());
    };
    let stereoscopic = asset.stereoscopic.unwrap_or(false);
    let dimension = if stereoscopic { "3D" } else { "2D" };

    let allowed: &[f64] = if RESOLUTIONS_2K.contains(&resolution) {
        if stereoscopic {
            &EDITRATES_2K_3D
        } else {
            &EDITRATES_2K_2D
        }
    } else if RESOLUTIONS_4K.contains(&resolution) {
        if stereoscopic {
            &EDITRATES_4K_3D
        } else {
            &EDITRATES_4K_2D
        }
    } else {
        return Ok(());
    };

    if !allowed.iter().any(|rate| compare_ratio(*rate, edit_rate)) {
        let container = if RESOLUTIONS_2K.contains(&resolution) {
            "2K"
        } else {
            "4K"
        };
        c.error(format!(
            "Invalid EditRate {edit_rate} for {container} {dimension} content"
        ));
    }
    Ok(())
}

fn check_picture_cpl_archival_framerate(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(edit_rate) = asset.edit_rate else {
        return Ok(());
    };

    if EDITRATES_ARCHIVAL
        .iter()
        .any(|rate| compare_ratio(*rate, edit_rate))
    {
        c.error(format!(
            "Archival EditRate {edit_rate} may not play safely on all hardware"
        ));
    }
    Ok(())
}

fn check_picture_cpl_hfr_framerate(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(edit_rate) = asset.edit_rate else {
        return Ok(());
    };
    let threshold = if asset.stereoscopic.unwrap_or(false) {
        MIN_EDITRATE_SERIES2_3D
    } else {
        MIN_EDITRATE_SERIES2_2D
    };

    if edit_rate >= threshold {
        c.error(format!(
            "EditRate {edit_rate} require an HFR capable projection server \
             (Series II), may not play safely on all hardware"
        ));
    }
    Ok(())
}

fn check_picture_cpl_editrate_framerate(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let (Some(edit_rate), Some(frame_rate)) = (asset.edit_rate, asset.frame_rate) else {
        return Ok(());
    };

    if asset.stereoscopic.unwrap_or(false) {
        if !compare_ratio(edit_rate * 2.0, frame_rate) {
            c.error("3D FrameRate must be double of EditRate");
        }
    } else if !compare_ratio(edit_rate, frame_rate) {
        c.error("2D FrameRate must be equal to EditRate");
    }
    Ok(())
}
