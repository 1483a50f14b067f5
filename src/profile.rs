//! Check profiles: per-check criticality overrides, bypass list and
//! allowed foreign files, loaded from and saved to JSON.

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

use std::collections::BTreeMap;
use std::path::Path;

use crate::{Criticality, Error};

/// A checker profile.
///
/// `criticality` maps check-name patterns to levels. A pattern matches
/// anywhere in the error's full name, `*` matches any run of
/// characters, the longest matching pattern wins and `default`
/// supplies the fallback.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Profile {
    pub criticality: BTreeMap<String, String>,

    /// Name prefixes of checks to skip. Skipped checks still appear in
    /// the report as bypassed stubs.
    pub bypass: Vec<String>,

    /// Paths relative to the package root that the foreign-files check
    /// tolerates.
    #[serde(default)]
    pub allowed_foreign_files: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        let criticality = [
            ("default", "ERROR"),
            ("check_dcnc_", "WARNING"),
            ("check_dcp_foreign_files", "WARNING"),
            ("check_assets_am_volindex_one", "WARNING"),
            ("check_*_empty_text_fields", "WARNING"),
            ("check_*_empty_text_fields_missing", "ERROR"),
            ("check_*_xml_constraints_line_ending", "WARNING"),
            ("check_cpl_contenttitle_annotationtext_match", "WARNING"),
            ("check_cpl_contenttitle_pklannotationtext_match", "WARNING"),
            ("check_assets_cpl_missing_from_vf", "WARNING"),
            ("check_assets_cpl_labels_schema", "WARNING"),
            ("check_assets_cpl_filename_uuid", "WARNING"),
            ("check_certif_multi_role", "WARNING"),
            ("check_certif_date_overflow", "WARNING"),
            ("check_picture_cpl_avg_bitrate", "WARNING"),
            ("check_picture_cpl_resolution", "WARNING"),
            ("check_picture_cpl_archival_framerate", "WARNING"),
            ("check_picture_cpl_hfr_framerate", "WARNING"),
            ("check_sound_cpl_format", "WARNING"),
            ("check_subtitle_cpl_reel_number", "WARNING"),
            ("check_subtitle_cpl_empty", "WARNING"),
            ("check_subtitle_cpl_uuid_case", "WARNING"),
            ("check_subtitle_cpl_duplicated_uuid", "WARNING"),
            ("check_atmos_cpl_channels", "WARNING"),
            ("check_atmos_cpl_objects", "WARNING"),
        ];

        Self {
            criticality: criticality
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            bypass: Vec::new(),
            allowed_foreign_files: Vec::new(),
        }
    }
}

impl Profile {
    /// The fallback criticality for unmatched error names.
    #[must_use]
    pub fn default_criticality(&self) -> Criticality {
        self.criticality
            .get("default")
            .and_then(|level| level.parse().ok())
            .unwrap_or(Criticality::Error)
    }

    /// Whether a check name is covered by the bypass list.
    #[must_use]
    pub fn is_bypassed(&self, check_name: &str) -> bool {
        self.bypass.iter().any(|b| check_name.starts_with(b.as_str()))
    }
}

/// Loads a profile from a JSON file, validating the required keys and
/// the criticality levels.
///
/// # Errors
///
/// Returns `Err` when the file is missing, not `.json`, malformed, or
/// names an unknown criticality level.
pub fn load_profile(path: &Path) -> Result<Profile, Error> {
    if !path.is_file() {
        return Err(Error::Profile(format!(
            "{} file not found",
            path.display()
        )));
    }
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return Err(Error::Profile(format!(
            "{} must be a valid json file",
            path.display()
        )));
    }

    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let profile: Profile = serde_json::from_str(&text)
        .map_err(|e| Error::Profile(format!("{}: {e}", path.display())))?;

    for level in profile.criticality.values() {
        level.parse::<Criticality>()?;
    }

    Ok(profile)
}

/// Saves a profile to a JSON file.
///
/// # Errors
///
/// Returns `Err` on i/o failure.
pub fn save_profile(profile: &Profile, path: &Path) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(profile)
        .map_err(|e| Error::Profile(e.to_string()))?;
    std::fs::write(path, text).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    #[rstest]
    fn default_profile_is_error_based() {
        let profile = Profile::default();
        assert_eq!(profile.default_criticality(), Criticality::Error);
        assert!(profile.bypass.is_empty());
    }

    #[rstest]
    fn bypass_matches_prefixes() {
        let profile = Profile {
            bypass: vec!["check_assets_pkl_hash".to_owned()],
            ..Profile::default()
        };
        assert!(profile.is_bypassed("check_assets_pkl_hash"));
        assert!(!profile.is_bypassed("check_assets_pkl_size"));
    }

    #[rstest]
    fn profile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");

        let mut profile = Profile::default();
        profile.bypass.push("check_assets_pkl_hash".to_owned());
        profile
            .allowed_foreign_files
            .push("notes/readme.txt".to_owned());

        save_profile(&profile, &path).unwrap();
        assert_eq!(load_profile(&path).unwrap(), profile);
    }

    #[rstest]
    fn unknown_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(
            &path,
            r#"{"criticality": {"default": "LOUD"}, "bypass": []}"#,
        )
        .unwrap();

        assert!(load_profile(&path).is_err());
    }

    #[rstest]
    fn non_json_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        std::fs::write(&path, "{}").unwrap();

        assert!(load_profile(&path).is_err());
    }
}
