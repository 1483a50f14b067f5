//! Sound essence checks: channel counts and configuration, sampling
//! rate, quantization and block alignment.

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
use crate::model::{Asset, EssenceKind};
use crate::probe::channel_configuration;

/// SMPTE 428-2 audio characteristics.
const SAMPLING_RATES: [f64; 2] = [48000.0, 96000.0];
const MAX_CHANNEL_COUNT: i64 = 16;
const QUANTIZATION_BITS: i64 = 24;

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for cpl in &dcp.cpls {
        for (kind, asset) in cpl.assets() {
            if kind != EssenceKind::Sound || asset.probe.is_none() {
                continue;
            }
            let stack = vec![cpl.file_name.clone(), asset.handle()];

            checker.run_check(
                "check_sound_cpl_channels",
                "Sound max channels count.",
                &stack,
                |c| check_sound_cpl_channels(c, asset),
            );
            checker.run_check(
                "check_sound_cpl_channels_odd",
                "Sound channels count must be an even number.",
                &stack,
                |c| check_sound_cpl_channels_odd(c, asset),
            );
            checker.run_check(
                "check_sound_cpl_format",
                "Sound channels count coherence with format.",
                &stack,
                |c| check_sound_cpl_format(c, asset),
            );
            checker.run_check(
                "check_sound_cpl_sampling",
                "Sound sampling rate check.",
                &stack,
                |c| check_sound_cpl_sampling(c, asset),
            );
            checker.run_check(
                "check_sound_cpl_quantization",
                "Sound quantization check.",
                &stack,
                |c| check_sound_cpl_quantization(c, asset),
            );
            checker.run_check(
                "check_sound_cpl_blockalign",
                "Sound block alignement check.",
                &stack,
                |c| check_sound_cpl_blockalign(c, asset),
            );
        }
    }
}

fn check_sound_cpl_channels(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(count) = asset.probe.as_ref().and_then(|p| p.channel_count) else {
        return Ok(());
    };

    if count > MAX_CHANNEL_COUNT {
        c.error(format!(
            "Invalid Sound ChannelCount, should be less than {MAX_CHANNEL_COUNT} \
             but got {count}"
        ));
    }
    Ok(())
}

fn check_sound_cpl_channels_odd(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(count) = asset.probe.as_ref().and_then(|p| p.channel_count) else {
        return Ok(());
    };

    if count % 2 != 0 {
        c.error(format!(
            "Invalid Sound ChannelCount, should be an even number, got {count}"
        ));
    }
    Ok(())
}

fn check_sound_cpl_format(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(probe) = asset.probe.as_ref() else {
        return Ok(());
    };
    let (Some(format), Some(count)) = (probe.channel_format, probe.channel_count) else {
        return Ok(());
    };

    if let Some((label, min, max)) = channel_configuration(format) {
        if count < min || count > max {
            c.error(format!(
                "Invalid Sound ChannelCount, {label} require between {min} and \
                 {max} channels, got {count}"
            ));
        }
    }
    Ok(())
}

fn check_sound_cpl_sampling(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(rate) = asset.probe.as_ref().and_then(|p| p.audio_sampling_rate) else {
        return Ok(());
    };

    if !SAMPLING_RATES.contains(&rate) {
        c.error(format!(
            "Invalid Sound SamplingRate, expected {SAMPLING_RATES:?} but got {rate}"
        ));
    }
    Ok(())
}

fn check_sound_cpl_quantization(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(depth) = asset.probe.as_ref().and_then(|p| p.quantization_bits) else {
        return Ok(());
    };

    if depth != QUANTIZATION_BITS {
        c.error(format!(
            "Invalid Sound Quantization, expected {QUANTIZATION_BITS} but got {depth}"
        ));
    }
    Ok(())
}

fn check_sound_cpl_blockalign(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(probe) = asset.probe.as_ref() else {
        return Ok(());
    };
    let (Some(align), Some(count)) = (probe.block_align, probe.channel_count) else {
        return Ok(());
    };

    let expected = count * (QUANTIZATION_BITS / 8);
    if align != expected {
        c.error(format!(
            "Invalid Sound BlockAlign, expected {expected} but got {align} \
             (it should be ChannelCount x 3)"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;
    use crate::checks::Checker;
    use crate::probe::ProbeRecord;

    fn sound_asset(count: i64, format: i64, rate: f64, bits: i64, align: i64) -> Asset {
        Asset {
            kind: Some(EssenceKind::Sound),
            probe: Some(ProbeRecord {
                channel_count: Some(count),
                channel_format: Some(format),
                audio_sampling_rate: Some(rate),
                quantization_bits: Some(bits),
                block_align: Some(align),
                ..ProbeRecord::default()
            }),
            ..Asset::default()
        }
    }

    fn run_single(
        asset: &Asset,
        body: impl FnOnce(&mut Checker<'_>, &Asset) -> CheckResult,
    ) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let dcp = crate::dcp::Dcp::new(dir.path()).unwrap();
        let profile = crate::profile::Profile::default();
        let prober = crate::probe::MockProber::new();
        let mut checker = Checker::new(
            &dcp,
            &profile,
            &prober,
            &crate::xml::NoopValidator,
            &crate::probe::NoopFontInspector,
        );
        let stack = checker.dcp_stack();
        checker.run_check("check_sound", "Sound check.", &stack, |c| body(c, asset));
        checker
            .into_executions()
            .into_iter()
            .flat_map(|e| e.errors.into_iter().map(|err| err.message))
            .collect()
    }

    #[rstest]
    fn conformant_51_track_passes() {
        let asset = sound_asset(6, 1, 48000.0, 24, 18);
        assert!(run_single(&asset, check_sound_cpl_channels).is_empty());
        assert!(run_single(&asset, check_sound_cpl_channels_odd).is_empty());
        assert!(run_single(&asset, check_sound_cpl_format).is_empty());
        assert!(run_single(&asset, check_sound_cpl_sampling).is_empty());
        assert!(run_single(&asset, check_sound_cpl_quantization).is_empty());
        assert!(run_single(&asset, check_sound_cpl_blockalign).is_empty());
    }

    #[rstest]
    fn too_many_channels_is_flagged() {
        let asset = sound_asset(18, 4, 48000.0, 24, 54);
        assert!(!run_single(&asset, check_sound_cpl_channels).is_empty());
    }

    #[rstest]
    fn odd_channel_count_is_flagged() {
        let asset = sound_asset(7, 4, 48000.0, 24, 21);
        assert!(!run_single(&asset, check_sound_cpl_channels_odd).is_empty());
    }

    #[rstest]
    fn format_channel_range_is_enforced() {
        // ChannelFormat 1 (5.1) requires between 6 and 8 channels.
        let asset = sound_asset(4, 1, 48000.0, 24, 12);
        let errors = run_single(&asset, check_sound_cpl_format);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("5.1 with optional HI/VI"));
    }

    #[rstest]
    #[case(44100.0, false)]
    #[case(48000.0, true)]
    #[case(96000.0, true)]
    fn sampling_rates(#[case] rate: f64, #[case] valid: bool) {
        let asset = sound_asset(6, 1, rate, 24, 18);
        assert_eq!(run_single(&asset, check_sound_cpl_sampling).is_empty(), valid);
    }

    #[rstest]
    fn wrong_quantization_and_blockalign_are_flagged() {
        let asset = sound_asset(6, 1, 48000.0, 16, 12);
        assert!(!run_single(&asset, check_sound_cpl_quantization).is_empty());
        assert!(!run_single(&asset, check_sound_cpl_blockalign).is_empty());
    }
}
