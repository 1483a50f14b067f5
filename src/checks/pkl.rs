//! PackingList checks: document fields plus per-asset AssetMap
//! reference, on-disk size and SHA-1 hash verification.

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
use crate::model::{PackingList, PklAsset};
use crate::util::sha1_b64;

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for pkl in &dcp.pkls {
        let stack = vec![pkl.file_name.clone()];

        checker.run_check(
            "check_pkl_xml",
            "PKL XML syntax and structure check.",
            &stack,
            |c| {
                c.xml_integrity(&pkl.path, &pkl.xmlns, pkl.schema);
                Ok(())
            },
        );
        checker.run_check(
            "check_pkl_empty_text_fields",
            "PKL empty text fields check.",
            &stack,
            |c| {
                super::assetmap::check_empty_text_fields(c, &[
                    ("Creator", pkl.creator.as_deref(), true),
                    ("Issuer", pkl.issuer.as_deref(), false),
                    ("AnnotationText", pkl.annotation_text.as_deref(), false),
                ])
            },
        );
        checker.run_check(
            "check_pkl_issuedate",
            "PKL Issue Date validation.",
            &stack,
            |c| {
                c.check_issue_date(pkl.issue_date.as_deref());
                Ok(())
            },
        );

        for asset in &pkl.assets {
            let handle = asset.path.clone().unwrap_or_else(|| asset.id.clone());
            let asset_stack = vec![pkl.file_name.clone(), handle];

            checker.run_check(
                "check_assets_pkl_referenced_by_assetmap",
                "PKL assets shall be present in AssetMap.",
                &asset_stack,
                |c| check_assets_pkl_referenced_by_assetmap(c, asset),
            );
            checker.run_check(
                "check_assets_pkl_size",
                "PKL assets size check.",
                &asset_stack,
                |c| check_assets_pkl_size(c, pkl, asset),
            );
            checker.run_check(
                "check_assets_pkl_hash",
                "PKL assets hash check.",
                &asset_stack,
                |c| check_assets_pkl_hash(c, pkl, asset),
            );
        }
    }
}

fn check_assets_pkl_referenced_by_assetmap(
    c: &mut Checker<'_>,
    asset: &PklAsset,
) -> CheckResult {
    if !c.dcp.asset_index.contains_key(&asset.id) {
        return Err(c.fatal_error("Not present in Assetmap"));
    }
    Ok(())
}

fn check_assets_pkl_size(
    c: &mut Checker<'_>,
    pkl: &PackingList,
    asset: &PklAsset,
) -> CheckResult {
    let Some(relative) = &asset.path else {
        return Ok(());
    };
    let path = pkl
        .path
        .parent()
        .unwrap_or(&c.dcp.path)
        .join(relative);
    let Ok(metadata) = path.metadata() else {
        return Ok(());
    };

    let Some(declared) = asset.size else {
        return Err(c.fatal_error("Missing Size element"));
    };
    let actual = metadata.len();
    if actual != declared {
        return Err(c.fatal_error(format!(
            "Invalid size, expected {declared} but got {actual}"
        )));
    }
    Ok(())
}

fn check_assets_pkl_hash(
    c: &mut Checker<'_>,
    pkl: &PackingList,
    asset: &PklAsset,
) -> CheckResult {
    let Some(relative) = &asset.path else {
        return Ok(());
    };
    let path = pkl
        .path
        .parent()
        .unwrap_or(&c.dcp.path)
        .join(relative);
    if !path.is_file() {
        return Ok(());
    }

    let Some(declared) = asset.hash.clone() else {
        return Err(c.fatal_error("Missing Hash element"));
    };

    // Memoized by UUID so multi-PKL packages hash each file once.
    if !c.hash_map.contains_key(&asset.id) {
        let computed = match sha1_b64(&path, c.hash_callback) {
            Ok(hash) => hash,
            Err(e) => return Err(c.fatal_error(e.to_string())),
        };
        c.hash_map.insert(asset.id.clone(), computed);
    }

    let computed = c.hash_map[&asset.id].clone();
    if computed != declared {
        return Err(c.fatal_error(format!(
            "Corrupt file, expected hash {declared} but got {computed}"
        )));
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

    fn package_with_pkl(essence: &[u8], declared_size: u64, declared_hash: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("essence.mxf"), essence).unwrap();

        let assetmap = r#"<?xml version="1.0" encoding="UTF-8"?>
<AssetMap xmlns="http://www.smpte-ra.org/schemas/429-9/2007/AM">
  <Id>urn:uuid:11111111-2222-1333-8444-555555555555</Id>
  <Creator>maker</Creator>
  <VolumeCount>1</VolumeCount>
  <AssetList>
    <Asset>
      <Id>urn:uuid:aaaaaaaa-bbbb-1ccc-8ddd-eeeeeeeeeeee</Id>
      <ChunkList><Chunk><Path>essence.mxf</Path></Chunk></ChunkList>
    </Asset>
  </AssetList>
</AssetMap>
"#;
        std::fs::write(dir.path().join("ASSETMAP.xml"), assetmap).unwrap();

        let pkl = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<PackingList xmlns="http://www.smpte-ra.org/schemas/429-8/2007/PKL">
  <Id>urn:uuid:99999999-8888-1777-8666-555555555555</Id>
  <IssueDate>2024-01-25T10:00:00+00:00</IssueDate>
  <Creator>maker</Creator>
  <AssetList>
    <Asset>
      <Id>urn:uuid:aaaaaaaa-bbbb-1ccc-8ddd-eeeeeeeeeeee</Id>
      <Hash>{declared_hash}</Hash>
      <Size>{declared_size}</Size>
      <Type>application/mxf</Type>
    </Asset>
  </AssetList>
</PackingList>
"#
        );
        std::fs::write(dir.path().join("pkl.xml"), pkl).unwrap();

        dir
    }

    fn failures(dir: &tempfile::TempDir) -> Vec<(String, String)> {
        let mut dcp = Dcp::new(dir.path()).unwrap();
        dcp.parse(&MockProber::new(), false).unwrap();

        let profile = Profile::default();
        let prober = MockProber::new();
        let mut checker = Checker::new(
            &dcp,
            &profile,
            &prober,
            &NoopValidator,
            &NoopFontInspector,
        );
        super::run(&mut checker);

        checker
            .into_executions()
            .into_iter()
            .flat_map(|e| {
                let name = e.name.clone();
                e.errors
                    .into_iter()
                    .map(move |err| (name.clone(), err.message))
            })
            .collect()
    }

    #[rstest]
    fn valid_pkl_passes_size_and_hash() {
        // sha1("the quick brown fox"), base64 encoded.
        let dir = package_with_pkl(
            b"the quick brown fox",
            19,
            "ztcfpyNSMb7Tg/rP3EHE3cwi7PE=",
        );
        let failures = failures(&dir);

        assert!(!failures.iter().any(|(n, _)| n == "check_assets_pkl_size"));
        assert!(!failures.iter().any(|(n, _)| n == "check_assets_pkl_hash"));
        assert!(!failures
            .iter()
            .any(|(n, _)| n == "check_assets_pkl_referenced_by_assetmap"));
    }

    #[rstest]
    fn corrupt_essence_fails_hash() {
        let dir = package_with_pkl(
            b"the quick brown cat",
            19,
            "ztcfpyNSMb7Tg/rP3EHE3cwi7PE=",
        );
        let failures = failures(&dir);

        assert!(failures
            .iter()
            .any(|(n, m)| n == "check_assets_pkl_hash" && m.contains("Corrupt file")));
    }

    #[rstest]
    fn size_mismatch_is_reported() {
        let dir = package_with_pkl(
            b"the quick brown fox",
            4096,
            "ztcfpyNSMb7Tg/rP3EHE3cwi7PE=",
        );
        let failures = failures(&dir);

        assert!(failures.iter().any(
            |(n, m)| n == "check_assets_pkl_size"
                && m.contains("expected 4096 but got 19")
        ));
    }

    #[rstest]
    fn future_issue_date_is_reported() {
        let dir = package_with_pkl(b"x", 1, "unused");
        let pkl = std::fs::read_to_string(dir.path().join("pkl.xml"))
            .unwrap()
            .replace("2024-01-25", "2150-01-25");
        std::fs::write(dir.path().join("pkl.xml"), pkl).unwrap();

        let failures = failures(&dir);
        assert!(failures
            .iter()
            .any(|(n, m)| n == "check_pkl_issuedate" && m.contains("post dated")));
    }
}
