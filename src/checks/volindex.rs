//! VolumeIndex checks.

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
use crate::model::VolumeIndex;
use crate::Schema;

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for vol in &dcp.volindexes {
        let stack = vec![vol.file_name.clone()];

        checker.run_check(
            "check_vol_xml",
            "VolIndex XML syntax and structure check.",
            &stack,
            |c| check_vol_xml(c, vol),
        );
        checker.run_check(
            "check_vol_name",
            "VolIndex file name respect DCP standard.",
            &stack,
            |c| check_vol_name(c, vol),
        );
    }
}

fn check_vol_xml(c: &mut Checker<'_>, vol: &VolumeIndex) -> CheckResult {
    // The Interop VolumeIndex has no schema to validate against.
    if c.dcp.schema == Schema::Interop {
        return Ok(());
    }

    c.xml_integrity(&vol.path, &vol.xmlns, vol.schema);
    Ok(())
}

fn check_vol_name(c: &mut Checker<'_>, vol: &VolumeIndex) -> CheckResult {
    let mandatory = match vol.schema {
        Schema::Interop => "VOLINDEX",
        Schema::Smpte => "VOLINDEX.xml",
        _ => return Ok(()),
    };

    if vol.file_name != mandatory {
        return Err(c.fatal_error(format!(
            "{} VolIndex must be named {mandatory}, got {} instead",
            vol.schema, vol.file_name
        )));
    }
    Ok(())
}
