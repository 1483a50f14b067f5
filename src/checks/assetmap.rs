//! AssetMap checks: naming, mandatory fields, per-asset UUID, path
//! policy, chunk geometry and on-disk sizes.

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

use std::path::Component;
use std::sync::OnceLock;

use regex::Regex;

use super::{Checker, CheckResult};
use crate::model::{AmAsset, AssetMap};
use crate::util::check_uuid_rfc4122;
use crate::Schema;

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for am in &dcp.assetmaps {
        let stack = vec![am.file_name.clone()];

        checker.run_check(
            "check_am_xml",
            "AssetMap XML syntax and structure check.",
            &stack,
            |c| {
                c.xml_integrity(&am.path, &am.xmlns, am.schema);
                Ok(())
            },
        );
        checker.run_check(
            "check_am_name",
            "AssetMap file name respect DCP standard.",
            &stack,
            |c| check_am_name(c, am),
        );
        checker.run_check(
            "check_am_volume_count",
            "The VolumeCount element shall be 1.",
            &stack,
            |c| check_am_volume_count(c, am),
        );
        checker.run_check(
            "check_am_empty_text_fields",
            "AssetMap empty text fields check.",
            &stack,
            |c| check_empty_text_fields(c, &[
                ("Creator", am.creator.as_deref(), true),
                ("Issuer", am.issuer.as_deref(), false),
                ("AnnotationText", am.annotation_text.as_deref(), false),
            ]),
        );

        for asset in &am.assets {
            let asset_stack = vec![am.file_name.clone(), asset.path.clone()];

            checker.run_check(
                "check_assets_am_uuid",
                "AssetMap UUIDs validation.",
                &asset_stack,
                |c| check_assets_am_uuid(c, asset),
            );
            checker.run_check(
                "check_assets_am_volindex_one",
                "AssetMap Asset VolumeIndex element shall be 1 or absent.",
                &asset_stack,
                |c| check_assets_am_volindex_one(c, asset),
            );
            checker.run_check(
                "check_assets_am_path",
                "AssetMap assets path validation.",
                &asset_stack,
                |c| check_assets_am_path(c, asset),
            );
            checker.run_check(
                "check_assets_am_offset",
                "AssetMap Chunk Offset check.",
                &asset_stack,
                |c| check_assets_am_offset(c, asset),
            );
            checker.run_check(
                "check_assets_am_size",
                "AssetMap assets size check.",
                &asset_stack,
                |c| check_assets_am_size(c, asset),
            );
        }
    }
}

fn check_am_name(c: &mut Checker<'_>, am: &AssetMap) -> CheckResult {
    let mandatory = match am.schema {
        Schema::Interop => "ASSETMAP",
        Schema::Smpte => "ASSETMAP.xml",
        _ => return Ok(()),
    };

    if am.file_name != mandatory {
        c.error(format!(
            "{} Assetmap must be named {mandatory}, got {} instead",
            am.schema, am.file_name
        ));
    }
    Ok(())
}

fn check_am_volume_count(c: &mut Checker<'_>, am: &AssetMap) -> CheckResult {
    if am.schema != Schema::Smpte {
        return Ok(());
    }

    match am.volume_count {
        Some(1) => {}
        Some(count) => c.error(format!("Invalid VolumeCount value: {count}")),
        None => c.error("Missing VolumeCount element"),
    }
    Ok(())
}

/// Empty `Creator`, `Issuer` or `AnnotationText` fields are not
/// invalid per specification, but other checking tools flag them, so
/// this aligns the reports.
pub(super) fn check_empty_text_fields(
    c: &mut Checker<'_>,
    fields: &[(&str, Option<&str>, bool)],
) -> CheckResult {
    let mut empty = Vec::new();
    let mut missing = Vec::new();

    for (name, value, mandatory) in fields {
        match value {
            Some("") => empty.push(*name),
            None if *mandatory => missing.push(*name),
            _ => {}
        }
    }

    if !empty.is_empty() {
        c.error(format!("Empty {} field(s)", empty.join(", ")));
    }
    if !missing.is_empty() {
        c.error_as(
            format!("Missing {} field(s)", missing.join(", ")),
            "missing",
            "",
        );
    }
    Ok(())
}

fn check_assets_am_uuid(c: &mut Checker<'_>, asset: &AmAsset) -> CheckResult {
    if !check_uuid_rfc4122(&asset.id) {
        c.error(format!("Invalid uuid found : {}", asset.id));
    }
    Ok(())
}

fn check_assets_am_volindex_one(c: &mut Checker<'_>, asset: &AmAsset) -> CheckResult {
    if let Some(index) = asset.volume_index {
        if index != 1 {
            c.error(format!(
                "VolIndex is now deprecated and shall always be 1, got {index}"
            ));
        }
    }
    Ok(())
}

fn path_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9._/-]").unwrap())
}

fn check_assets_am_path(c: &mut Checker<'_>, asset: &AmAsset) -> CheckResult {
    let path = &asset.path;

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > 10 {
        c.error(format!(">10 path segments: {}", segments.len()));
    }

    let longest = segments.iter().map(|s| s.len()).max().unwrap_or(0);
    if longest > 100 {
        c.error(format!("Path segment >100 characters: {longest}"));
    }

    if path.len() > 100 {
        c.error(format!("Path >100 characters: {}", path.len()));
    }

    let invalid: std::collections::BTreeSet<String> = path_chars_re()
        .find_iter(path)
        .map(|m| m.as_str().to_owned())
        .collect();
    if !invalid.is_empty() {
        c.error(format!(
            "Invalid characters in path: {}",
            invalid.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    if path.starts_with('/') {
        c.error("Path is not relative");
    }

    let escapes_root = std::path::Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir));
    if escapes_root {
        c.error("Path points outside of DCP root");
    }

    if !c.dcp.path.join(path).is_file() {
        let basename = path.rsplit('/').next().unwrap_or(path);
        c.error(format!("Missing asset file: {basename}"));
    }
    Ok(())
}

fn check_assets_am_offset(c: &mut Checker<'_>, asset: &AmAsset) -> CheckResult {
    if let Some(offset) = asset.offset {
        if offset != 0 {
            c.error(format!("Invalid offset value {offset}"));
        }
    }
    Ok(())
}

fn check_assets_am_size(c: &mut Checker<'_>, asset: &AmAsset) -> CheckResult {
    let Some(length) = asset.length else {
        return Ok(());
    };

    let path = c.dcp.path.join(&asset.path);
    if let Ok(metadata) = path.metadata() {
        let actual = metadata.len();
        if actual != length {
            c.error(format!(
                "Invalid size value, expected {length} but got {actual}"
            ));
        }
    }
    Ok(())
}
