//! Report aggregation: criticality resolution from the profile,
//! human-readable rendering and the structured dictionary form.

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

use std::collections::{BTreeMap, BTreeSet, HashSet};

use regex::Regex;

use crate::checks::CheckExecution;
use crate::dcp::Dcp;
use crate::profile::Profile;
use crate::util::human_size;
use crate::Criticality;

/// The outcome of one validation run.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub dcp_path: String,
    pub dcp_size: u64,
    pub profile: Profile,
    /// `DD/MM/YYYY HH:MM:SS`.
    pub date: String,
    pub duration_seconds: f64,
    pub checks: Vec<CheckExecution>,

    /// Descriptor file names mapped to a human friendly title.
    titles: BTreeMap<String, String>,
}

impl CheckReport {
    /// Builds the report: resolves each finding's criticality from the
    /// profile and captures display titles for the descriptors.
    #[must_use]
    pub fn new(
        dcp: &Dcp,
        profile: &Profile,
        mut checks: Vec<CheckExecution>,
        duration_seconds: f64,
    ) -> Self {
        resolve_criticality(&mut checks, profile);

        let mut titles = BTreeMap::new();
        for cpl in &dcp.cpls {
            titles.insert(cpl.file_name.clone(), cpl.content_title.clone());
        }
        for pkl in &dcp.pkls {
            if let Some(annotation) = &pkl.annotation_text {
                titles.insert(pkl.file_name.clone(), annotation.clone());
            }
        }

        Self {
            dcp_path: dcp.path.display().to_string(),
            dcp_size: dcp.size,
            profile: profile.clone(),
            date: chrono::Local::now().format("%d/%m/%Y %H:%M:%S").to_string(),
            duration_seconds,
            checks,
            titles,
        }
    }

    /// Overall validity: no un-bypassed finding resolved to ERROR.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|c| c.is_valid(Criticality::Error))
    }

    /// Number of distinct checks executed (bypassed excluded).
    #[must_use]
    pub fn checks_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| !c.bypass)
            .map(|c| c.name.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Checks that raised at least one finding.
    #[must_use]
    pub fn checks_failed(&self) -> Vec<&CheckExecution> {
        self.checks.iter().filter(|c| c.has_errors()).collect()
    }

    /// Checks that completed without findings (bypassed excluded).
    #[must_use]
    pub fn checks_succeeded(&self) -> Vec<&CheckExecution> {
        self.checks
            .iter()
            .filter(|c| !c.has_errors() && !c.bypass)
            .collect()
    }

    #[must_use]
    pub fn checks_bypassed(&self) -> Vec<&CheckExecution> {
        self.checks.iter().filter(|c| c.bypass).collect()
    }

    /// Formats the report in a human friendly way. SILENT findings are
    /// suppressed here but kept in [`CheckReport::to_dict`].
    #[must_use]
    pub fn pretty_str(&self) -> String {
        let mut report = String::new();
        report += &format!(
            "Status : {}\n",
            if self.is_valid() { "Success" } else { "Fail" }
        );
        report += &format!("Path : {}\n", self.dcp_path);
        report += &format!("Size : {}\n", human_size(self.dcp_size));
        report += &format!("Total check : {}\n", self.checks_count());
        report += &format!("Total time : {:.2} sec\n", self.duration_seconds);
        report += "\n";

        for criticality in [Criticality::Error, Criticality::Warning, Criticality::Info] {
            let mut root = StackNode::default();
            for check in self.checks_failed() {
                let errors: Vec<_> = check
                    .errors
                    .iter()
                    .filter(|e| e.criticality == criticality)
                    .collect();
                if errors.is_empty() {
                    continue;
                }

                let mut lines = vec![format!(". {}", check.short_desc())];
                for error in errors {
                    let desc = error.short_desc();
                    if desc.is_empty() || desc == check.short_desc() {
                        lines.push(error.message.clone());
                    } else {
                        lines.push(format!(". {}\n{}", desc, error.message));
                    }
                }

                root.insert(&check.asset_stack, lines.join("\n"));
            }

            if !root.children.is_empty() {
                report += &format!("{}:\n", criticality.pretty());
                for (name, child) in &root.children {
                    report += &self.dump_stack(name, child, 0);
                    report += "\n";
                }
            }
        }

        let bypassed: BTreeSet<String> = self
            .checks_bypassed()
            .iter()
            .map(|c| format!("  . {}", c.short_desc()))
            .collect();
        if !bypassed.is_empty() {
            report += "Bypass(s):\n";
            for line in bypassed {
                report += &line;
                report += "\n";
            }
        }

        report
    }

    fn dump_stack(&self, name: &str, node: &StackNode, indent_level: usize) -> String {
        let indent_char = ' ';
        let ind = 2 + indent_level;

        let mut out = String::new();
        out += &indent_char.to_string().repeat(ind);
        out += "+ ";
        out += name;
        if let Some(title) = self.titles.get(name) {
            out += &format!(" ({title})");
        }

        for message in &node.messages {
            let continuation = format!("\n{}", indent_char.to_string().repeat(ind + 4));
            out += "\n";
            out += &indent_char.to_string().repeat(ind + 2);
            out += &message.split('\n').collect::<Vec<_>>().join(&continuation);
        }

        for (child_name, child) in &node.children {
            out += "\n";
            out += &self.dump_stack(child_name, child, indent_level + 2);
        }

        out
    }

    /// The structured report, shaped for JSON output.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "dcp_path": self.dcp_path,
            "dcp_size": self.dcp_size,
            "valid": self.is_valid(),
            "profile": self.profile,
            "date": self.date,
            "duration_seconds": self.duration_seconds,
            "message": self.pretty_str(),
            "unique_checks_count": self.checks_count(),
            "checks": self.checks.iter().map(CheckExecution::to_dict).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Default)]
struct StackNode {
    messages: Vec<String>,
    children: BTreeMap<String, StackNode>,
}

impl StackNode {
    fn insert(&mut self, stack: &[String], message: String) {
        let mut node = self;
        for name in stack {
            node = node.children.entry(name.clone()).or_default();
        }
        node.messages.push(message);
    }
}

/// Resolves every finding's criticality from the profile map: a
/// pattern matches anywhere in the error's full name, `*` matches any
/// run of characters and the longest matching pattern wins.
pub fn resolve_criticality(checks: &mut [CheckExecution], profile: &Profile) {
    let default = profile.default_criticality();

    let patterns: Vec<(usize, Regex, Criticality)> = profile
        .criticality
        .iter()
        .filter(|(name, _)| name.as_str() != "default")
        .filter_map(|(name, level)| {
            let level: Criticality = level.parse().ok()?;
            let translated = name
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            Some((translated.len(), Regex::new(&translated).ok()?, level))
        })
        .collect();

    for check in checks {
        for error in &mut check.errors {
            let full_name = error.full_name();
            let mut best = (0, default);
            for (length, pattern, level) in &patterns {
                if *length > best.0 && pattern.is_match(&full_name) {
                    best = (*length, *level);
                }
            }
            error.criticality = best.1;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;
    use crate::checks::CheckError;

    fn execution(name: &str, error_names: &[&str]) -> CheckExecution {
        CheckExecution {
            name: name.to_owned(),
            doc: "Example check.".to_owned(),
            bypass: false,
            seconds_elapsed: 0.1,
            asset_stack: vec!["PKL.xml".to_owned()],
            errors: error_names
                .iter()
                .map(|sub| CheckError {
                    name: (*sub).to_owned(),
                    parent_name: name.to_owned(),
                    doc: String::new(),
                    message: "boom".to_owned(),
                    criticality: Criticality::Error,
                })
                .collect(),
        }
    }

    fn profile_with(levels: &[(&str, &str)]) -> Profile {
        Profile {
            criticality: levels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            bypass: Vec::new(),
            allowed_foreign_files: Vec::new(),
        }
    }

    #[rstest]
    fn longest_pattern_wins() {
        let profile = profile_with(&[
            ("default", "ERROR"),
            ("check_example", "WARNING"),
            ("check_example_encrypted", "INFO"),
        ]);
        let mut checks = vec![execution("check_example", &["encrypted", "other"])];

        resolve_criticality(&mut checks, &profile);

        assert_eq!(checks[0].errors[0].criticality, Criticality::Info);
        assert_eq!(checks[0].errors[1].criticality, Criticality::Warning);
    }

    #[rstest]
    fn unmatched_names_take_default() {
        let profile = profile_with(&[("default", "WARNING")]);
        let mut checks = vec![execution("check_other", &[""])];

        resolve_criticality(&mut checks, &profile);

        assert_eq!(checks[0].errors[0].criticality, Criticality::Warning);
    }

    #[rstest]
    fn wildcard_patterns_match() {
        let profile = profile_with(&[
            ("default", "ERROR"),
            ("check_*_empty_text_fields", "WARNING"),
        ]);
        let mut checks = vec![execution("check_am_empty_text_fields", &[""])];

        resolve_criticality(&mut checks, &profile);

        assert_eq!(checks[0].errors[0].criticality, Criticality::Warning);
    }

    #[rstest]
    fn validity_follows_error_level() {
        let profile = profile_with(&[("default", "WARNING")]);
        let mut checks = vec![execution("check_example", &[""])];
        resolve_criticality(&mut checks, &profile);
        assert!(checks[0].is_valid(Criticality::Error));

        let profile = profile_with(&[("default", "ERROR")]);
        let mut checks = vec![execution("check_example", &[""])];
        resolve_criticality(&mut checks, &profile);
        assert!(!checks[0].is_valid(Criticality::Error));
    }

    #[rstest]
    fn silent_findings_are_suppressed_from_text() {
        let dir = tempfile::tempdir().unwrap();
        let dcp = crate::dcp::Dcp::new(dir.path()).unwrap();
        let profile = profile_with(&[("default", "SILENT")]);
        let checks = vec![execution("check_example", &[""])];

        let report = CheckReport::new(&dcp, &profile, checks, 0.1);

        assert!(report.is_valid());
        assert!(!report.pretty_str().contains("boom"));
        let dict = report.to_dict();
        assert_eq!(
            dict["checks"][0]["errors"][0]["criticality"],
            serde_json::json!("SILENT")
        );
    }

    #[rstest]
    fn dict_shape() {
        let dir = tempfile::tempdir().unwrap();
        let dcp = crate::dcp::Dcp::new(dir.path()).unwrap();
        let profile = Profile::default();
        let report = CheckReport::new(&dcp, &profile, vec![execution("check_example", &[""])], 1.5);

        let dict = report.to_dict();
        for key in [
            "dcp_path",
            "dcp_size",
            "valid",
            "profile",
            "date",
            "duration_seconds",
            "message",
            "unique_checks_count",
            "checks",
        ] {
            assert!(dict.get(key).is_some(), "missing report key {key}");
        }
        assert_eq!(dict["unique_checks_count"], serde_json::json!(1));
        assert_eq!(dict["valid"], serde_json::json!(false));
    }
}
