//! Naming convention checks: the CPL content title parsed against the
//! ISDCF DCNC rules, and each embedded qualifier verified against the
//! actual composition content.

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

use chrono::NaiveDate;

use super::{Checker, CheckResult};
use crate::checks::picture::{RESOLUTIONS_2K, RESOLUTIONS_4K};
use crate::model::{CompositionPlaylist, EssenceKind};

/// ISDCF audio type codes mapped to a minimum channel count.
const FORMAT_CHANNELS: &[(&str, i64)] =
    &[("10", 1), ("20", 2), ("51", 6), ("61", 7), ("71", 8)];

/// Projector aspect ratio codes and their decimal values.
const ASPECT_RATIOS: &[(&str, f64)] = &[("F", 1.85), ("S", 2.39), ("C", 1.90)];

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for cpl in &dcp.cpls {
        let stack = vec![cpl.file_name.clone()];

        checker.run_check(
            "check_dcnc_compliance",
            "Digital Cinema Naming Convention compliance (9.6).",
            &stack,
            |c| check_dcnc_compliance(c, cpl),
        );

        // Individual qualifier checks only make sense on a title that
        // parsed cleanly.
        if !cpl.naming_errors.is_empty() {
            continue;
        }

        let field_checks: [(&str, &str, CheckFn); 13] = [
            (
                "check_dcnc_field_redband",
                "RedBand qualifier is restricted to Trailer.",
                check_dcnc_field_redband,
            ),
            (
                "check_dcnc_field_dimension",
                "3D content shall specify 2D or 3D version.",
                check_dcnc_field_dimension,
            ),
            (
                "check_dcnc_field_aspect_ratio",
                "ImageAspectRatio qualifier forbidden for Trailer.",
                check_dcnc_field_aspect_ratio,
            ),
            (
                "check_dcnc_field_date",
                "Composition Date validation.",
                check_dcnc_field_date,
            ),
            (
                "check_dcnc_field_package_type",
                "Version qualifier is forbidden for OV package.",
                check_dcnc_field_package_type,
            ),
            (
                "check_dcnc_field_claim_framerate",
                "FrameRate from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_framerate,
            ),
            (
                "check_dcnc_field_claim_dimension",
                "Dimension from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_dimension,
            ),
            (
                "check_dcnc_field_claim_aspectratio",
                "AspectRatio from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_aspectratio,
            ),
            (
                "check_dcnc_field_claim_subtitle",
                "Subtitle (presence) from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_subtitle,
            ),
            (
                "check_dcnc_field_claim_caption",
                "Caption (presence) from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_caption,
            ),
            (
                "check_dcnc_field_claim_audio",
                "Audio format from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_audio,
            ),
            (
                "check_dcnc_field_claim_immersive_sound",
                "Immersive audio format imply Auxiliary track in CPL.",
                check_dcnc_field_claim_immersive_sound,
            ),
            (
                "check_dcnc_field_claim_resolution",
                "Picture resolution from CPL and ContentTitleText shall match.",
                check_dcnc_field_claim_resolution,
            ),
        ];

        for (name, doc, body) in field_checks {
            checker.run_check(name, doc, &stack, |c| body(c, cpl));
        }

        checker.run_check(
            "check_dcnc_field_claim_standard",
            "DCP Standard coherence check.",
            &stack,
            |c| check_dcnc_field_claim_standard(c, cpl),
        );
        checker.run_check(
            "check_dcnc_field_claim_packagetype",
            "DCP type (OV / VF) coherence check.",
            &stack,
            |c| check_dcnc_field_claim_packagetype(c, cpl),
        );
        checker.run_check(
            "check_dcnc_field_claim_dolbyvision",
            "DolbyVision metadata shall be present in CPL.",
            &stack,
            |c| check_dcnc_field_claim_dolbyvision(c, cpl),
        );
        checker.run_check(
            "check_dcnc_field_claim_eclaircolor",
            "EclairColor metadata shall be present in CPL.",
            &stack,
            |c| check_dcnc_field_claim_eclaircolor(c, cpl),
        );
    }
}

type CheckFn = fn(&mut Checker<'_>, &CompositionPlaylist) -> CheckResult;

fn check_dcnc_compliance(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    if !cpl.naming_errors.is_empty() {
        return Err(c.fatal_error(cpl.naming_errors.join("\n")));
    }
    Ok(())
}

fn check_dcnc_field_redband(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    let is_trailer = cpl.naming.attr("ContentType", "Type") == "TLR";
    if !is_trailer && cpl.naming.has("ContentType", "RedBand") {
        c.error("RedBand qualifier is only for trailer content");
    }
    Ok(())
}

fn check_dcnc_field_dimension(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    let is_3d = cpl.naming.attr("Standard", "Dimension") == "3D";
    if is_3d && !cpl.naming.has("ContentType", "Dimension") {
        c.error("Content Type should specify 2D version or 3D version for 3D Movie");
    }
    Ok(())
}

fn check_dcnc_field_aspect_ratio(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let is_trailer = cpl.naming.attr("ContentType", "Type") == "TLR";
    if is_trailer && cpl.naming.has("ProjectorAspectRatio", "ImageAspectRatio") {
        c.error("Trailer content should not contain ImageAspectRatio qualifier");
    }
    Ok(())
}

fn check_dcnc_field_date(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    let date_str = cpl.naming.attr("Date", "Value");
    if date_str.is_empty() {
        return Ok(());
    }

    match NaiveDate::parse_from_str(date_str, "%Y%m%d") {
        Ok(date) => {
            if date > chrono::Local::now().date_naive() {
                c.error_as(
                    "Date suggest a composition from the future",
                    "future",
                    "",
                );
            }
        }
        Err(_) => c.error(format!("Invalid Date field : {date_str}")),
    }
    Ok(())
}

fn check_dcnc_field_package_type(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let pkg_type = cpl.naming.attr("PackageType", "Type");
    if pkg_type == "OV" && cpl.naming.has("PackageType", "Version") {
        c.error("OV Package can't include a version number in the package type field");
    }
    Ok(())
}

fn check_dcnc_field_claim_framerate(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.attr("ContentType", "FrameRate");
    if claimed.is_empty() {
        return Ok(());
    }

    if let Some(rate) = cpl.aggregates.edit_rate.value() {
        if claimed != rate.to_string() {
            c.error(format!(
                "ContentTitle / CPL Framerate mismatch : {claimed} / {rate}"
            ));
        }
    }
    Ok(())
}

fn check_dcnc_field_claim_dimension(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.attr("ContentType", "Dimension");
    if claimed.is_empty() {
        return Ok(());
    }

    if let Some(stereo) = cpl.aggregates.stereoscopic.value() {
        let claimed_stereo = claimed == "3D";
        if claimed_stereo != *stereo {
            c.error(format!("ContentTitle suggest {claimed} but CPL is not"));
        }
    }
    Ok(())
}

fn check_dcnc_field_claim_aspectratio(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let code = cpl.naming.attr("ProjectorAspectRatio", "AspectRatio");
    let Some((_, claimed)) = ASPECT_RATIOS.iter().find(|(k, _)| *k == code) else {
        return Ok(());
    };

    if let Some(actual) = cpl.aggregates.screen_aspect_ratio.value() {
        if !crate::util::compare_ratio(*claimed, *actual) {
            c.error(format!(
                "ContentTitle / CPL AspectRatio mismatch : {claimed} / {actual}"
            ));
        }
    }
    Ok(())
}

fn check_dcnc_field_claim_subtitle(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    // Burned-in subtitles live in the picture, not in a track.
    if cpl.naming.burned_subtitle {
        return Ok(());
    }
    if cpl.naming.subtitle != cpl.aggregates.subtitle {
        if cpl.naming.subtitle {
            c.error("ContentTitle suggest Subtitle but CPL have none");
        } else {
            c.error("CPL have Subtitle but ContentTitle suggest none");
        }
    }
    Ok(())
}

fn check_dcnc_field_claim_caption(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    match cpl.naming.attr("Language", "Caption") {
        "CCAP" if !cpl.aggregates.closed_caption => {
            c.error("ContentTitle claims CCAP but CPL have no ClosedCaption track");
        }
        "OCAP" if !cpl.aggregates.open_caption => {
            c.error("ContentTitle claims OCAP but CPL have no OpenCaption track");
        }
        _ => {}
    }
    Ok(())
}

fn check_dcnc_field_claim_audio(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.attr("AudioType", "Channels");
    let Some((_, minimum)) = FORMAT_CHANNELS.iter().find(|(k, _)| *k == claimed) else {
        return Ok(());
    };

    let sound = cpl.assets().find(|(kind, asset)| {
        *kind == EssenceKind::Sound && asset.probe.is_some()
    });
    if let Some((_, asset)) = sound {
        let count = asset
            .probe
            .as_ref()
            .and_then(|p| p.channel_count)
            .unwrap_or(0);
        if count < *minimum {
            c.error(format!(
                "ContentTitle claims {claimed} audio but CPL contains only \
                 {count} channels"
            ));
        }
    }
    Ok(())
}

fn check_dcnc_field_claim_immersive_sound(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let immersive = cpl.naming.attr("AudioType", "ImmersiveSound");
    if immersive.is_empty() {
        return Ok(());
    }

    let auxdatas: Vec<_> = cpl
        .assets()
        .filter(|(kind, asset)| *kind == EssenceKind::AuxData && asset.probe.is_some())
        .collect();

    if auxdatas.is_empty() {
        c.error(format!(
            "ContentTitle claims immersive audio ({immersive}) but CPL have \
             no Auxiliary tracks"
        ));
        return Ok(());
    }

    let matching = auxdatas.iter().any(|(_, asset)| {
        asset.schema.as_str().eq_ignore_ascii_case(immersive)
    });
    if !matching {
        c.error(format!(
            "ContentTitle claims immersive audio ({immersive}) but CPL is not"
        ));
    }
    Ok(())
}

fn check_dcnc_field_claim_resolution(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.attr("Resolution", "Value");
    if claimed.is_empty() {
        return Ok(());
    }

    let Some(actual) = cpl.aggregates.resolution.value() else {
        return Ok(());
    };

    let family: &[&str] = match claimed {
        "2K" => &RESOLUTIONS_2K,
        "4K" => &RESOLUTIONS_4K,
        _ => return Ok(()),
    };

    if !family.contains(&actual.as_str()) {
        c.error(format!(
            "ContentTitle claims {claimed} but CPL Picture track resolution is {actual}"
        ));
    }
    Ok(())
}

fn check_dcnc_field_claim_standard(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.attr("Standard", "Schema");
    if !claimed.is_empty() && claimed != c.dcp.schema.as_str() {
        c.error(format!("ContentTitle claims {claimed} but DCP is not"));
    }
    Ok(())
}

fn check_dcnc_field_claim_packagetype(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.attr("PackageType", "Type");
    if !claimed.is_empty() && claimed != c.dcp.package_type.as_str() {
        c.error(format!(
            "ContentTitle claims {claimed} but DCP is {}",
            c.dcp.package_type
        ));
    }
    Ok(())
}

fn check_dcnc_field_claim_dolbyvision(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.has("ContentType", "DolbyVision");
    if claimed && !cpl.dolby_vision {
        c.error("ContentTitle claims DolbyVision but CPL miss required metadata");
    } else if !claimed && cpl.dolby_vision {
        c.error("CPL imply DolbyVision but ContentTitle miss DVis ContentType field");
    }
    Ok(())
}

fn check_dcnc_field_claim_eclaircolor(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let claimed = cpl.naming.has("ContentType", "EclairColor");
    if claimed && !cpl.eclair_color {
        c.error("ContentTitle claims EclairColor but CPL miss required metadata");
    } else if !claimed && cpl.eclair_color {
        c.error("CPL imply EclairColor but ContentTitle miss EC ContentType field");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;
    use crate::checks::Checker;
    use crate::model::Agg;

    fn cpl_with_title(title: &str) -> CompositionPlaylist {
        let dir = tempfile::tempdir().unwrap();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<CompositionPlaylist xmlns="http://www.smpte-ra.org/schemas/429-7/2006/CPL">
  <Id>urn:uuid:77777777-6666-1555-8444-333333333333</Id>
  <ContentTitleText>{title}</ContentTitleText>
  <ReelList/>
</CompositionPlaylist>
"#
        );
        let path = dir.path().join("cpl.xml");
        std::fs::write(&path, xml).unwrap();
        crate::parse::parse_cpl(&path).unwrap()
    }

    fn run_single(
        cpl: &CompositionPlaylist,
        body: impl FnOnce(&mut Checker<'_>, &CompositionPlaylist) -> CheckResult,
    ) -> Vec<(String, String)> {
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
        checker.run_check("check_dcnc_field", "Field check.", &stack, |c| body(c, cpl));
        checker
            .into_executions()
            .into_iter()
            .flat_map(|e| {
                e.errors
                    .into_iter()
                    .map(|err| (err.name.clone(), err.message))
            })
            .collect()
    }

    #[rstest]
    fn future_date_fails_but_other_fields_pass() {
        let cpl =
            cpl_with_title("Foo_FTR_F_EN-XX_US-R_51_2K_DI_20501231_ECL_SMPTE_OV");
        assert!(cpl.naming_errors.is_empty());

        let failures = run_single(&cpl, check_dcnc_field_date);
        assert!(failures
            .iter()
            .any(|(name, m)| name == "future" && m.contains("from the future")));

        assert!(run_single(&cpl, check_dcnc_field_redband).is_empty());
        assert!(run_single(&cpl, check_dcnc_field_package_type).is_empty());
        assert!(run_single(&cpl, check_dcnc_field_aspect_ratio).is_empty());
    }

    #[rstest]
    fn redband_requires_trailer() {
        let cpl =
            cpl_with_title("Foo_FTR-RedBand_F_EN-XX_US-R_51_2K_DI_20240125_ECL_SMPTE_OV");
        assert!(!run_single(&cpl, check_dcnc_field_redband).is_empty());
    }

    #[rstest]
    fn ov_version_number_is_rejected() {
        let cpl =
            cpl_with_title("Foo_FTR_F_EN-XX_US-R_51_2K_DI_20240125_ECL_SMPTE_OV-2");
        assert!(!run_single(&cpl, check_dcnc_field_package_type).is_empty());
    }

    #[rstest]
    fn framerate_claim_is_compared_to_aggregate() {
        let mut cpl =
            cpl_with_title("Foo_FTR-48_F_EN-XX_US-R_51_2K_DI_20240125_ECL_SMPTE_OV");
        cpl.aggregates.edit_rate = Agg::Value(24.0);

        let failures = run_single(&cpl, check_dcnc_field_claim_framerate);
        assert!(failures
            .iter()
            .any(|(_, m)| m.contains("Framerate mismatch : 48 / 24")));
    }

    #[rstest]
    fn subtitle_claim_is_compared_to_tracks() {
        let mut cpl =
            cpl_with_title("Foo_FTR_F_EN-FR_US-R_51_2K_DI_20240125_ECL_SMPTE_OV");
        cpl.aggregates.subtitle = false;

        assert!(!run_single(&cpl, check_dcnc_field_claim_subtitle).is_empty());

        cpl.aggregates.subtitle = true;
        assert!(run_single(&cpl, check_dcnc_field_claim_subtitle).is_empty());
    }
}
