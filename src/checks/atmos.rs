//! Atmos auxiliary data checks: data essence coding universal label
//! and channel / object ceilings.

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
use crate::Schema;

/// Dolby Atmos data essence coding universal label, SMPTE 429-18.
pub const ATMOS_SMPTE_UL: &str = "060e2b34.04010105.0e090604.00000000";

/// Ceilings from SMPTE 429-18 table 4.
const MAX_CHANNEL_COUNT: i64 = 64;
const MAX_OBJECT_COUNT: i64 = 118;

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for cpl in &dcp.cpls {
        for (kind, asset) in cpl.assets() {
            let is_atmos = kind == EssenceKind::AuxData && asset.schema == Schema::Atmos;
            if !is_atmos || asset.probe.is_none() {
                continue;
            }
            let stack = vec![cpl.file_name.clone(), asset.handle()];

            checker.run_check(
                "check_atmos_cpl_essence_encoding",
                "Atmos data essence coding universal label.",
                &stack,
                |c| check_atmos_cpl_essence_encoding(c, asset),
            );
            checker.run_check(
                "check_atmos_cpl_channels",
                "Atmos maximum channels count.",
                &stack,
                |c| check_atmos_cpl_channels(c, asset),
            );
            checker.run_check(
                "check_atmos_cpl_objects",
                "Atmos maximum objects count.",
                &stack,
                |c| check_atmos_cpl_objects(c, asset),
            );
        }
    }
}

fn check_atmos_cpl_essence_encoding(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let cpl_ul = asset
        .data_type
        .as_deref()
        .unwrap_or("")
        .replace("urn:smpte:ul:", "")
        .trim()
        .to_lowercase();
    let mxf_ul = asset
        .probe
        .as_ref()
        .and_then(|p| p.data_essence_coding.as_deref())
        .unwrap_or("")
        .to_lowercase();

    if cpl_ul.is_empty() {
        return Err(c.fatal_error("Missing Atmos DataType tag (CPL/AuxData)"));
    }
    if mxf_ul.is_empty() {
        return Err(c.fatal_error("Missing Atmos Essence Coding UL (MXF)"));
    }

    if cpl_ul != mxf_ul {
        c.error(format!(
            "Incoherent Atmos Data Essence Coding, CPL {cpl_ul} / MXF {mxf_ul}"
        ));
    } else if mxf_ul != ATMOS_SMPTE_UL {
        c.error(format!(
            "Unknown Atmos Data Essence Coding, expecting {ATMOS_SMPTE_UL} but got {mxf_ul}"
        ));
    }
    Ok(())
}

fn check_atmos_cpl_channels(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    match asset.probe.as_ref().and_then(|p| p.max_channel_count) {
        None => c.error("Missing MaxChannelCount field"),
        Some(count) if count > MAX_CHANNEL_COUNT => c.error(format!(
            "Invalid Atmos MaxChannelCount, got {count} but maximum is {MAX_CHANNEL_COUNT}"
        )),
        Some(_) => {}
    }
    Ok(())
}

fn check_atmos_cpl_objects(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    match asset.probe.as_ref().and_then(|p| p.max_object_count) {
        None => c.error("Missing MaxObjectCount field"),
        Some(count) if count > MAX_OBJECT_COUNT => c.error(format!(
            "Invalid Atmos MaxObjectCount, got {count} but maximum is {MAX_OBJECT_COUNT}"
        )),
        Some(_) => {}
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

    fn atmos_asset(mxf_ul: &str, channels: i64, objects: i64) -> Asset {
        Asset {
            kind: Some(EssenceKind::AuxData),
            schema: Schema::Atmos,
            data_type: Some(format!("urn:smpte:ul:{ATMOS_SMPTE_UL}")),
            probe: Some(ProbeRecord {
                data_essence_coding: Some(mxf_ul.to_owned()),
                max_channel_count: Some(channels),
                max_object_count: Some(objects),
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
        checker.run_check("check_atmos", "Atmos check.", &stack, |c| body(c, asset));
        checker
            .into_executions()
            .into_iter()
            .flat_map(|e| e.errors.into_iter().map(|err| err.message))
            .collect()
    }

    #[rstest]
    fn conformant_atmos_track_passes() {
        let asset = atmos_asset(ATMOS_SMPTE_UL, 64, 118);
        assert!(run_single(&asset, check_atmos_cpl_essence_encoding).is_empty());
        assert!(run_single(&asset, check_atmos_cpl_channels).is_empty());
        assert!(run_single(&asset, check_atmos_cpl_objects).is_empty());
    }

    #[rstest]
    fn label_mismatch_is_flagged() {
        let asset = atmos_asset("060e2b34.04010105.0e090604.ffffffff", 64, 118);
        let errors = run_single(&asset, check_atmos_cpl_essence_encoding);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Incoherent Atmos Data Essence Coding"));
    }

    #[rstest]
    fn ceilings_are_enforced() {
        let asset = atmos_asset(ATMOS_SMPTE_UL, 65, 119);
        assert!(!run_single(&asset, check_atmos_cpl_channels).is_empty());
        assert!(!run_single(&asset, check_atmos_cpl_objects).is_empty());
    }
}
