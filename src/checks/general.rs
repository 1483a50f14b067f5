//! Package level checks: stray files, descriptor cardinality, OV/VF
//! relink coherence and the encrypted-content signature requirement.

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

use walkdir::WalkDir;

use super::{Checker, CheckResult};
use crate::model::Agg;
use crate::{PackageType, Schema};

pub(super) fn run(checker: &mut Checker<'_>) {
    let stack = checker.dcp_stack();

    checker.run_check(
        "check_dcp_empty_dir",
        "Empty directory detection.",
        &stack,
        check_dcp_empty_dir,
    );
    checker.run_check(
        "check_dcp_hidden_files",
        "Hidden files detection.",
        &stack,
        check_dcp_hidden_files,
    );
    checker.run_check(
        "check_dcp_foreign_files",
        "Foreign files detection (not listed in AssetMap).",
        &stack,
        check_dcp_foreign_files,
    );
    checker.run_check(
        "check_dcp_multiple_am_or_vol",
        "Only one AssetMap and VolIndex shall be present.",
        &stack,
        check_dcp_multiple_am_or_vol,
    );
    checker.run_check(
        "check_dcp_signed",
        "DCP with encrypted content must be digitally signed.",
        &stack,
        check_dcp_signed,
    );

    if checker.ov_dcp.is_some() {
        checker.run_check(
            "check_link_ov_coherence",
            "Relink OV/VF sanity checks.",
            &stack,
            check_link_ov_coherence,
        );

        let dcp = checker.dcp;
        for cpl in &dcp.cpls {
            for (kind, asset) in cpl.assets() {
                checker.run_check(
                    "check_link_ov_asset",
                    "VF package shall reference assets present in OV.",
                    &stack,
                    |c| check_link_ov_asset(c, kind.as_str(), asset),
                );
            }
        }
    }
}

fn check_dcp_empty_dir(c: &mut Checker<'_>) -> CheckResult {
    let mut empty_dirs = Vec::new();
    for entry in WalkDir::new(&c.dcp.path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
    {
        let is_empty = std::fs::read_dir(entry.path())
            .map(|mut dir| dir.next().is_none())
            .unwrap_or(false);
        if is_empty {
            empty_dirs.push(
                entry
                    .path()
                    .strip_prefix(&c.dcp.path)
                    .unwrap_or(entry.path())
                    .display()
                    .to_string(),
            );
        }
    }

    if !empty_dirs.is_empty() {
        empty_dirs.sort();
        c.error(format!("Empty directories detected : {empty_dirs:?}"));
    }
    Ok(())
}

fn check_dcp_hidden_files(c: &mut Checker<'_>) -> CheckResult {
    let hidden: Vec<String> = c
        .dcp
        .list_files
        .iter()
        .filter(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        })
        .map(|f| {
            f.strip_prefix(&c.dcp.path)
                .unwrap_or(f)
                .display()
                .to_string()
        })
        .collect();

    if !hidden.is_empty() {
        c.error(format!("Hidden files detected : {hidden:?}"));
    }
    Ok(())
}

fn check_dcp_foreign_files(c: &mut Checker<'_>) -> CheckResult {
    let allowed = &c.profile.allowed_foreign_files;
    let foreign: Vec<String> = c
        .dcp
        .unreferenced_files()
        .into_iter()
        .filter(|f| !allowed.contains(f))
        .collect();

    if !foreign.is_empty() {
        c.error(foreign.join("\n"));
    }
    Ok(())
}

fn check_dcp_multiple_am_or_vol(c: &mut Checker<'_>) -> CheckResult {
    let cardinalities = [
        ("Assetmap", c.dcp.assetmaps.len()),
        ("VolIndex", c.dcp.volindexes.len()),
    ];

    for (name, count) in cardinalities {
        if count == 0 {
            c.error(format!("Missing {name} file"));
        }
        if count > 1 {
            c.error(format!("Multiple {name} files found"));
        }
    }
    Ok(())
}

fn check_dcp_signed(c: &mut Checker<'_>) -> CheckResult {
    for cpl in &c.dcp.cpls {
        if cpl.aggregates.encrypted != Agg::Value(true) {
            continue;
        }

        let mut signed = vec![cpl.signature.is_some()];
        signed.extend(
            c.dcp
                .pkls
                .iter()
                .filter(|pkl| Some(&pkl.id) == cpl.pkl_id.as_ref())
                .map(|pkl| pkl.signature.is_some()),
        );

        if signed.contains(&false) {
            c.error("Encrypted DCP must be signed");
        }
    }
    Ok(())
}

fn check_link_ov_coherence(c: &mut Checker<'_>) -> CheckResult {
    if c.dcp.package_type != PackageType::Vf {
        c.error("Package checked must be a VF");
    }
    if let Some(ov) = c.ov_dcp {
        if ov.package_type != PackageType::Ov {
            c.error("Package referenced must be a OV");
        }
        if ov.schema != Schema::Unknown && ov.schema != c.dcp.schema {
            c.error(format!(
                "Schema mismatch between VF ({}) and OV ({})",
                c.dcp.schema, ov.schema
            ));
        }
    }
    Ok(())
}

fn check_link_ov_asset(
    c: &mut Checker<'_>,
    essence: &str,
    asset: &crate::model::Asset,
) -> CheckResult {
    if !asset.path.is_empty() {
        return Ok(());
    }

    match &asset.absolute_path {
        None => c.error(format!(
            "Asset missing ({essence}) from OV : {}",
            asset.id
        )),
        Some(path) if !path.exists() => c.error(format!(
            "Asset missing ({essence}) from OV (MXF not found) : {}",
            path.display()
        )),
        Some(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use crate::checks::Checker;
    use crate::dcp::Dcp;
    use crate::probe::{MockProber, NoopFontInspector};
    use crate::profile::Profile;
    use crate::xml::NoopValidator;

    fn findings_for(dcp: &Dcp, profile: &Profile, check: &str) -> Vec<String> {
        let prober = MockProber::new();
        let mut checker = Checker::new(
            dcp,
            profile,
            &prober,
            &NoopValidator,
            &NoopFontInspector,
        );
        super::run(&mut checker);
        checker
            .into_executions()
            .into_iter()
            .filter(|e| e.name == check)
            .flat_map(|e| e.errors.into_iter().map(|err| err.message))
            .collect()
    }

    #[rstest]
    fn missing_descriptors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut dcp = Dcp::new(dir.path()).unwrap();
        dcp.parse(&MockProber::new(), false).unwrap();

        let errors = findings_for(&dcp, &Profile::default(), "check_dcp_multiple_am_or_vol");
        assert!(errors.iter().any(|e| e.contains("Missing Assetmap")));
        assert!(errors.iter().any(|e| e.contains("Missing VolIndex")));
    }

    #[rstest]
    fn hidden_and_empty_entries_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        std::fs::create_dir(dir.path().join("hollow")).unwrap();

        let mut dcp = Dcp::new(dir.path()).unwrap();
        dcp.parse(&MockProber::new(), false).unwrap();

        let profile = Profile::default();
        assert!(!findings_for(&dcp, &profile, "check_dcp_hidden_files").is_empty());
        assert!(!findings_for(&dcp, &profile, "check_dcp_empty_dir").is_empty());
    }

    #[rstest]
    fn allowed_foreign_files_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"delivery notes").unwrap();

        let mut dcp = Dcp::new(dir.path()).unwrap();
        dcp.parse(&MockProber::new(), false).unwrap();

        let strict = Profile::default();
        assert!(!findings_for(&dcp, &strict, "check_dcp_foreign_files").is_empty());

        let lenient = Profile {
            allowed_foreign_files: vec!["notes.txt".to_owned()],
            ..Profile::default()
        };
        assert!(findings_for(&dcp, &lenient, "check_dcp_foreign_files").is_empty());
    }
}
