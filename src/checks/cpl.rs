//! CompositionPlaylist checks: document fields, reel coherence, cut
//! arithmetic and per-asset CPL/MXF metadata coherence.

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
use crate::util::{check_uuid_rfc4122, compare_ratio, extract_uuid};
use crate::Schema;

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for cpl in &dcp.cpls {
        let stack = vec![cpl.file_name.clone()];

        checker.run_check(
            "check_cpl_xml",
            "CPL XML syntax and structure check.",
            &stack,
            |c| {
                c.xml_integrity(&cpl.path, &cpl.xmlns, cpl.schema);
                Ok(())
            },
        );
        checker.run_check(
            "check_cpl_id_rfc4122",
            "CPL UUID RFC4122 compliance.",
            &stack,
            |c| check_cpl_id_rfc4122(c, cpl),
        );
        checker.run_check(
            "check_cpl_contenttitle_annotationtext_match",
            "CPL ContentTitleText and AnnotationText shall match.",
            &stack,
            |c| check_contenttitle_annotationtext(c, cpl),
        );
        checker.run_check(
            "check_cpl_contenttitle_pklannotationtext_match",
            "CPL ContentTitleText and PKL AnnotationText shall match.",
            &stack,
            |c| check_contenttitle_pklannotationtext(c, cpl),
        );
        checker.run_check(
            "check_cpl_issuedate",
            "CPL Issue Date validation.",
            &stack,
            |c| {
                c.check_issue_date(cpl.issue_date.as_deref());
                Ok(())
            },
        );
        checker.run_check(
            "check_cpl_referenced_by_pkl",
            "CPL shall be present in PKL.",
            &stack,
            |c| check_cpl_referenced_by_pkl(c, cpl),
        );
        checker.run_check(
            "check_cpl_reel_coherence",
            "CPL reel attributes shall be coherents across all reels.",
            &stack,
            |c| check_cpl_reel_coherence(c, cpl),
        );
        checker.run_check(
            "check_cpl_reel_duration",
            "CPL reels shall last at least one second.",
            &stack,
            |c| check_cpl_reel_duration(c, cpl),
        );
        checker.run_check(
            "check_cpl_reel_duration_picture_sound",
            "CPL reels picture and audio tracks duration shall match.",
            &stack,
            |c| check_duration_pair(c, cpl, EssenceKind::Sound),
        );
        checker.run_check(
            "check_cpl_reel_duration_picture_aux",
            "CPL reels picture and auxiliary tracks duration shall match.",
            &stack,
            |c| check_duration_pair(c, cpl, EssenceKind::AuxData),
        );
        checker.run_check(
            "check_cpl_reel_duration_picture_subtitles",
            "CPL reels subtitle duration shall fit the picture track.",
            &stack,
            |c| check_duration_subtitles(c, cpl),
        );
        checker.run_check(
            "check_cpl_subtitle_tracks_coherence",
            "CPL timed-text tracks shall be present in all reels or none.",
            &stack,
            |c| check_subtitle_tracks_coherence(c, cpl),
        );
        checker.run_check(
            "check_cpl_reels_cut",
            "CPL reels cut coherence check.",
            &stack,
            |c| check_cpl_reels_cut(c, cpl),
        );

        for (_, asset) in cpl.assets() {
            let asset_stack = vec![cpl.file_name.clone(), asset.handle()];

            checker.run_check(
                "check_assets_cpl_missing_from_vf",
                "CPL assets referencing external package.",
                &asset_stack,
                |c| check_assets_cpl_missing_from_vf(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_labels",
                "CPL assets labels check.",
                &asset_stack,
                |c| check_assets_cpl_labels(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_labels_schema",
                "CPL assets labels / schema coherence check.",
                &asset_stack,
                |c| check_assets_cpl_labels_schema(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_uuid",
                "CPL assets UUID RFC4122 compliance.",
                &asset_stack,
                |c| check_assets_cpl_uuid(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_filename_uuid",
                "CPL assets file name UUID check.",
                &asset_stack,
                |c| check_assets_cpl_filename_uuid(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_hash",
                "CPL assets Hash shall be present alongside KeyId (encrypted).",
                &asset_stack,
                |c| check_assets_cpl_hash(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_cut",
                "CPL assets cut coherence check.",
                &asset_stack,
                |c| check_assets_cpl_cut(c, asset),
            );
            checker.run_check(
                "check_assets_cpl_metadata",
                "CPL assets metadata coherence with MXF tracks.",
                &asset_stack,
                |c| check_assets_cpl_metadata(c, asset),
            );
        }
    }
}

fn check_cpl_id_rfc4122(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    if !check_uuid_rfc4122(&cpl.id) {
        c.error(format!("CPL ID invalid (RFC 4122) : {}", cpl.id));
    }
    Ok(())
}

fn check_contenttitle_annotationtext(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    if let Some(annotation) = &cpl.annotation_text {
        if !annotation.is_empty() && annotation != &cpl.content_title {
            c.error(format!(
                "CPL ContentTitleText / AnnotationText mismatch : {} / {annotation}",
                cpl.content_title
            ));
        }
    }
    Ok(())
}

fn check_contenttitle_pklannotationtext(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let pkl = c
        .dcp
        .pkls
        .iter()
        .find(|pkl| Some(&pkl.id) == cpl.pkl_id.as_ref());
    let Some(annotation) = pkl.and_then(|p| p.annotation_text.as_deref()) else {
        return Ok(());
    };
    if annotation.is_empty() {
        return Ok(());
    }

    // A multi-CPL package can only carry one PKL AnnotationText, a
    // common prefix of the composition titles is accepted there.
    let matches = if c.dcp.cpls.len() > 1 {
        cpl.content_title.starts_with(annotation)
    } else {
        annotation == cpl.content_title
    };

    if !matches {
        c.error(format!(
            "CPL ContentTitleText / PKL AnnotationText mismatch : {} / {annotation}",
            cpl.content_title
        ));
    }
    Ok(())
}

fn check_cpl_referenced_by_pkl(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    if cpl.pkl_id.is_none() {
        c.error("CPL is not referenced in any PKL");
    }
    Ok(())
}

fn check_cpl_reel_coherence(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    let agg = &cpl.aggregates;
    let coherence: [(&str, bool); 14] = [
        ("EditRate", agg.edit_rate.is_mixed()),
        ("FrameRate", agg.frame_rate.is_mixed()),
        ("HighFrameRate", agg.high_frame_rate.is_mixed()),
        ("ScreenAspectRatio", agg.screen_aspect_ratio.is_mixed()),
        ("Stereoscopic", agg.stereoscopic.is_mixed()),
        ("Resolution", agg.resolution.is_mixed()),
        ("Encrypted", agg.encrypted.is_mixed()),
        ("DecompositionLevels", agg.decomposition_levels.is_mixed()),
        ("Precincts", agg.precincts.is_mixed()),
        ("ChannelCount", agg.channel_count.is_mixed()),
        ("ChannelFormat", agg.channel_format.is_mixed()),
        ("ChannelConfiguration", agg.channel_configuration.is_mixed()),
        ("SoundLanguage", agg.sound_language.is_mixed()),
        ("SubtitleLanguage", agg.subtitle_language.is_mixed()),
    ];

    for (key, mixed) in coherence {
        if mixed {
            c.error_as(format!("{key} is not coherent for all reels"), key, "");
        }
    }
    Ok(())
}

fn check_cpl_reel_duration(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    for reel in &cpl.reels {
        let Some(picture) = reel.asset(EssenceKind::Picture) else {
            continue;
        };
        let edit_rate = picture.edit_rate.unwrap_or(0.0).round() as i64;
        let duration = picture.duration.unwrap_or(0);
        let intrinsic = picture.intrinsic_duration.unwrap_or(0);

        if duration < edit_rate || intrinsic < edit_rate {
            c.error(format!("Reel {} last less than one second", reel.position));
        }
    }
    Ok(())
}

fn check_duration_pair(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
    other: EssenceKind,
) -> CheckResult {
    for reel in &cpl.reels {
        let durations: Vec<i64> = [EssenceKind::Picture, other]
            .iter()
            .filter_map(|kind| reel.asset(*kind))
            .filter_map(|asset| asset.duration)
            .collect();

        if durations.len() == 2 && durations[0] != durations[1] {
            c.error(format!(
                "Picture / {other} duration mismatch for Reel {}",
                reel.position
            ));
        }
    }
    Ok(())
}

fn check_duration_subtitles(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    for reel in &cpl.reels {
        let picture = reel.asset(EssenceKind::Picture).and_then(|a| a.duration);
        let subtitle = reel.asset(EssenceKind::Subtitle).and_then(|a| a.duration);
        let (Some(picture), Some(subtitle)) = (picture, subtitle) else {
            continue;
        };

        // SMPTE timed text may cover only part of the reel, Interop
        // subtitles must span it exactly.
        let mismatch = match c.dcp.schema {
            Schema::Smpte => subtitle > picture,
            _ => subtitle != picture,
        };
        if mismatch {
            c.error(format!(
                "Picture / Subtitle duration mismatch for Reel {}",
                reel.position
            ));
        }
    }
    Ok(())
}

fn check_subtitle_tracks_coherence(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
) -> CheckResult {
    let total = cpl.reels.len();
    for kind in [
        EssenceKind::Subtitle,
        EssenceKind::OpenCaption,
        EssenceKind::ClosedCaption,
    ] {
        let count = cpl
            .reels
            .iter()
            .filter(|reel| reel.assets.contains_key(&kind))
            .count();
        if count > 0 && count < total {
            c.error(format!(
                "{kind} track must be present in all reels or none, found in {count} of {total}"
            ));
        }
    }
    Ok(())
}

fn check_cpl_reels_cut(c: &mut Checker<'_>, cpl: &CompositionPlaylist) -> CheckResult {
    let mut cpl_position = 0_i64;

    for reel in &cpl.reels {
        for asset in reel.assets.values() {
            let (Some(start), Some(end), Some(duration)) =
                (asset.cpl_entry_point, asset.cpl_out_point, asset.duration)
            else {
                continue;
            };

            if start != cpl_position {
                c.error(format!("Invalid CPLEntryPoint in Reel {}", reel.position));
            }
            if end - start != duration {
                c.error(format!("Invalid Duration in Reel {}", reel.position));
            }
        }

        if let Some(picture) = reel.asset(EssenceKind::Picture) {
            cpl_position += picture.duration.unwrap_or(0);
        }
    }
    Ok(())
}

fn check_assets_cpl_missing_from_vf(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let is_vf_asset = !c.dcp.asset_index.contains_key(&asset.id);
    let is_relinked_from_ov = asset.probe.is_some();

    if is_vf_asset && !is_relinked_from_ov {
        c.error("Asset reference OV package");
    }
    Ok(())
}

fn check_assets_cpl_labels(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    if let Some(label) = asset.probe.as_ref().and_then(|p| p.label_set_type.as_deref()) {
        if label != "MXFInterop" && label != "SMPTE" {
            c.error(format!("MXF Label invalid : {label}"));
        }
    }
    Ok(())
}

fn check_assets_cpl_labels_schema(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let expected = match c.dcp.schema {
        Schema::Interop => "MXFInterop",
        Schema::Smpte => "SMPTE",
        _ => return Ok(()),
    };

    if let Some(label) = asset.probe.as_ref().and_then(|p| p.label_set_type.as_deref()) {
        if label != expected {
            c.error(format!(
                "MXF Label incoherent, got {label} but expected {expected}"
            ));
        }
    }
    Ok(())
}

fn check_assets_cpl_uuid(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    if !check_uuid_rfc4122(&asset.id) {
        c.error(format!("Asset ID invalid (RFC 4122) : {}", asset.id));
    }
    Ok(())
}

fn check_assets_cpl_filename_uuid(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    if asset.path.is_empty() {
        return Ok(());
    }

    if let Some(file_uuid) = extract_uuid(&asset.path.to_lowercase()) {
        let file_uuid = file_uuid.to_owned();
        c.compare_uuid(("FILENAME", &file_uuid), ("CPL", &asset.id));
    }
    Ok(())
}

fn check_assets_cpl_hash(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    if asset.key_id.is_some() && asset.hash.is_none() {
        c.error("Encrypted asset must have a Hash element");
    }
    Ok(())
}

fn check_assets_cpl_cut(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let (Some(start), Some(end), Some(intrinsic)) =
        (asset.entry_point, asset.out_point, asset.intrinsic_duration)
    else {
        return Ok(());
    };

    if start >= intrinsic {
        c.error("Invalid EntryPoint");
    }
    if end > intrinsic {
        c.error("Invalid Duration");
    }
    Ok(())
}

fn check_assets_cpl_metadata(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let Some(probe) = &asset.probe else {
        return Ok(());
    };

    fn pair_f64(
        c: &mut Checker<'_>,
        key: &str,
        mxf_key: &str,
        cpl_value: Option<f64>,
        mxf_value: Option<f64>,
    ) {
        match (cpl_value, mxf_value) {
            (Some(cpl), Some(mxf)) if !compare_ratio(cpl, mxf) => c.error(format!(
                "{key} metadata mismatch, CPL claims {cpl} but MXF {mxf}"
            )),
            (Some(_), None) => c.error(format!("Missing MXF Metadata {mxf_key}")),
            _ => {}
        }
    }

    pair_f64(c, "EditRate", "EditRate", asset.edit_rate, probe.edit_rate);
    pair_f64(
        c,
        "FrameRate",
        "SampleRate",
        asset.frame_rate,
        probe.sample_rate,
    );
    pair_f64(
        c,
        "ScreenAspectRatio",
        "AspectRatio",
        asset.screen_aspect_ratio,
        probe.aspect_ratio,
    );

    match (asset.intrinsic_duration, probe.container_duration) {
        (Some(cpl), Some(mxf)) if cpl != mxf => c.error(format!(
            "IntrinsicDuration metadata mismatch, CPL claims {cpl} but MXF {mxf}"
        )),
        (Some(_), None) => c.error("Missing MXF Metadata ContainerDuration"),
        _ => {}
    }

    match (probe.encrypted_essence, asset.encrypted) {
        (Some(mxf), cpl) if mxf != cpl => c.error(format!(
            "Encrypted metadata mismatch, CPL claims {cpl} but MXF {mxf}"
        )),
        (None, _) => c.error("Missing MXF Metadata EncryptedEssence"),
        _ => {}
    }

    match &probe.asset_uuid {
        Some(mxf) if !mxf.eq_ignore_ascii_case(&asset.id) => c.error(format!(
            "Id metadata mismatch, CPL claims {} but MXF {mxf}",
            asset.id
        )),
        None => c.error("Missing MXF Metadata AssetUUID"),
        _ => {}
    }

    match (&asset.key_id, &probe.cryptographic_key_id) {
        (Some(cpl), Some(mxf)) if !mxf.eq_ignore_ascii_case(cpl) => c.error(format!(
            "KeyId metadata mismatch, CPL claims {cpl} but MXF {mxf}"
        )),
        (Some(_), None) => c.error("Missing MXF Metadata CryptographicKeyID"),
        (None, Some(_)) => c.error("Missing CPL Metadata KeyId for asset"),
        _ => {}
    }

    Ok(())
}
