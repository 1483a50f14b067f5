//! The check framework: execution records, error accumulation, bypass
//! handling and the driver running every domain module.
//!
//! Each check is registered at its call site with a static name
//! (`check_` prefix convention) and a one line description. A check
//! body reports findings through [`Checker::error`] and can halt early
//! with [`Checker::fatal_error`]; a panic inside a body is converted
//! into a synthetic `internal_error` finding and the run continues.

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

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::dcp::Dcp;
use crate::probe::{FontInspector, MxfProber};
use crate::profile::Profile;
use crate::util::HashProgress;
use crate::xml::XsdValidator;
use crate::Criticality;

pub mod assetmap;
pub mod atmos;
pub mod cpl;
pub mod general;
pub mod naming;
pub mod picture;
pub mod pkl;
pub mod signature;
pub mod sound;
pub mod subtitle;
pub mod volindex;

/// One finding reported by a check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckError {
    /// Optional sub-name appended to the check name for criticality
    /// resolution.
    pub name: String,
    pub parent_name: String,
    pub doc: String,
    pub message: String,
    pub criticality: Criticality,
}

impl CheckError {
    /// `parent_name` or `parent_name_subname`.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.name.is_empty() {
            self.parent_name.clone()
        } else {
            format!("{}_{}", self.parent_name, self.name)
        }
    }

    /// First line of the error documentation.
    #[must_use]
    pub fn short_desc(&self) -> &str {
        self.doc.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
    }

    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "pretty_name": self.short_desc(),
            "doc": self.doc,
            "message": self.message,
            "criticality": self.criticality,
        })
    }
}

/// One check execution with its findings and metadata.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckExecution {
    pub name: String,
    pub doc: String,
    pub bypass: bool,
    pub seconds_elapsed: f64,

    /// Breadcrumb of descriptor file names / asset paths identifying
    /// the object under test.
    pub asset_stack: Vec<String>,
    pub errors: Vec<CheckError>,
}

impl CheckExecution {
    /// First line of the check documentation, or the name.
    #[must_use]
    pub fn short_desc(&self) -> &str {
        self.doc
            .lines()
            .find(|l| !l.trim().is_empty())
            .map_or(self.name.as_str(), str::trim)
    }

    /// Whether the check raised no finding at or above `criticality`.
    #[must_use]
    pub fn is_valid(&self, criticality: Criticality) -> bool {
        !self.errors.iter().any(|e| e.criticality >= criticality)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "pretty_name": self.short_desc(),
            "doc": self.doc,
            "bypass": self.bypass,
            "seconds_elapsed": self.seconds_elapsed,
            "asset_stack": self.asset_stack,
            "errors": self.errors.iter().map(CheckError::to_dict).collect::<Vec<_>>(),
        })
    }
}

/// Sentinel returned by [`Checker::fatal_error`]: the finding is
/// recorded and the rest of the check body is skipped.
#[derive(Debug, Clone, Copy)]
pub struct Fatal;

/// Return type of every check body.
pub type CheckResult = Result<(), Fatal>;

/// Runs every registered check against a parsed package.
pub struct Checker<'a> {
    pub dcp: &'a Dcp,
    pub profile: &'a Profile,
    pub prober: &'a dyn MxfProber,
    pub xsd: &'a dyn XsdValidator,
    pub fonts: &'a dyn FontInspector,

    /// Parsed OV package when the caller supplied one for VF relink.
    pub ov_dcp: Option<&'a Dcp>,

    pub hash_callback: Option<HashProgress<'a>>,

    /// Hashes memoized by asset UUID across multi-PKL packages.
    pub hash_map: HashMap<String, String>,

    executions: Vec<CheckExecution>,
    errors: Vec<CheckError>,
}

impl<'a> Checker<'a> {
    #[must_use]
    pub fn new(
        dcp: &'a Dcp,
        profile: &'a Profile,
        prober: &'a dyn MxfProber,
        xsd: &'a dyn XsdValidator,
        fonts: &'a dyn FontInspector,
    ) -> Self {
        Self {
            dcp,
            profile,
            prober,
            xsd,
            fonts,
            ov_dcp: None,
            hash_callback: None,
            hash_map: HashMap::new(),
            executions: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Records a finding on the current check.
    pub fn error(&mut self, message: impl Into<String>) {
        self.error_as(message, "", "");
    }

    /// Records a finding with a sub-name (alphanumeric and underscores
    /// only) and an optional description.
    pub fn error_as(&mut self, message: impl Into<String>, name: &str, doc: &str) {
        debug_assert!(
            name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "error name invalid: {name}"
        );
        self.errors.push(CheckError {
            name: name.to_lowercase(),
            parent_name: String::new(),
            doc: doc.to_owned(),
            message: message.into(),
            criticality: Criticality::Error,
        });
    }

    /// Records a finding and halts the current check body.
    #[must_use]
    pub fn fatal_error(&mut self, message: impl Into<String>) -> Fatal {
        self.error(message);
        Fatal
    }

    /// Records a named finding and halts the current check body.
    #[must_use]
    pub fn fatal_error_as(&mut self, message: impl Into<String>, name: &str) -> Fatal {
        self.error_as(message, name, "");
        Fatal
    }

    /// Executes one check under the framework guard: bypass stubs,
    /// timing, error collection, fatal halt and panic conversion.
    pub fn run_check(
        &mut self,
        name: &str,
        doc: &str,
        stack: &[String],
        body: impl FnOnce(&mut Self) -> CheckResult,
    ) {
        if self.profile.is_bypassed(name) {
            self.executions.push(CheckExecution {
                name: name.to_owned(),
                doc: doc.to_owned(),
                bypass: true,
                seconds_elapsed: 0.0,
                asset_stack: stack.to_vec(),
                errors: Vec::new(),
            });
            return;
        }

        let start = Instant::now();
        self.errors.clear();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *self)));

        let mut errors = std::mem::take(&mut self.errors);
        if let Err(payload) = outcome {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            log::error!("{name}: internal error: {message}");
            errors.push(CheckError {
                name: "internal_error".to_owned(),
                parent_name: String::new(),
                doc: "Internal error".to_owned(),
                message,
                criticality: Criticality::Error,
            });
        }

        for error in &mut errors {
            error.parent_name = name.to_owned();
            if error.doc.is_empty() {
                error.doc = doc.to_owned();
            }
        }

        self.executions.push(CheckExecution {
            name: name.to_owned(),
            doc: doc.to_owned(),
            bypass: false,
            seconds_elapsed: start.elapsed().as_secs_f64(),
            asset_stack: stack.to_vec(),
            errors,
        });
    }

    /// Runs every domain module in driver order and returns the
    /// execution list.
    #[must_use]
    pub fn check(mut self) -> Vec<CheckExecution> {
        log::info!("Checking DCP : {}", self.dcp.path.display());

        general::run(&mut self);
        assetmap::run(&mut self);
        volindex::run(&mut self);
        pkl::run(&mut self);
        cpl::run(&mut self);
        picture::run(&mut self);
        sound::run(&mut self);
        atmos::run(&mut self);
        subtitle::run(&mut self);
        naming::run(&mut self);
        signature::run(&mut self);

        self.executions
    }

    /// The executions recorded so far (used by tests driving a single
    /// module).
    #[must_use]
    pub fn into_executions(self) -> Vec<CheckExecution> {
        self.executions
    }

    /// Base asset stack: the package path.
    #[must_use]
    pub fn dcp_stack(&self) -> Vec<String> {
        vec![self.dcp.path.display().to_string()]
    }

    /// Shared descriptor XML validation: D-Cinema constraints, known
    /// namespace, schema coherence with the package, XSD validation.
    pub(crate) fn xml_integrity(
        &mut self,
        path: &std::path::Path,
        xmlns: &str,
        doc_schema: crate::Schema,
    ) {
        for (name, message) in crate::xml::check_constraints(path) {
            self.error_as(message, name, "");
        }

        let schema_id = crate::xml::schema_id_for_namespace(xmlns);
        if schema_id.is_none() {
            self.error_as(format!("Namespace unknown : {xmlns}"), "namespace", "");
        }

        if doc_schema != self.dcp.schema {
            self.error_as(
                format!(
                    "Schema is not valid got {doc_schema} but was expecting {}",
                    self.dcp.schema
                ),
                "schema_coherence",
                "",
            );
        }

        match schema_id.and_then(|id| self.xsd.validate(path, id)) {
            None => log::info!("Schema validation skipped : {}", path.display()),
            Some(Ok(())) => {}
            Some(Err(message)) => self.error_as(
                format!(
                    "Schema validation error : {message}\nUsing schema : {}",
                    schema_id.unwrap_or("")
                ),
                "schema_validation",
                "",
            ),
        }
    }

    /// Shared IssueDate validation: the date, compared at its own
    /// offset, must not lie in the future.
    pub(crate) fn check_issue_date(&mut self, date: Option<&str>) {
        let Some(date) = date else {
            self.error("Missing IssueDate field");
            return;
        };

        match chrono::DateTime::parse_from_rfc3339(date) {
            Ok(parsed) => {
                if parsed > chrono::Utc::now() {
                    self.error(format!("IssueDate is post dated : {parsed}"));
                }
            }
            Err(_) => self.error(format!("IssueDate invalid : {date}")),
        }
    }

    /// Shared UUID comparison: validates the candidate form and
    /// compares it, case folded, against the reference.
    pub(crate) fn compare_uuid(
        &mut self,
        to_check: (&str, &str),
        reference: (&str, &str),
    ) {
        let (name, uuid) = to_check;
        let (name_ref, uuid_ref) = reference;

        if !crate::util::check_uuid(&uuid.to_lowercase()) {
            self.error(format!("Invalid {name} uuid found : {uuid}"));
        }
        if uuid.to_lowercase() != uuid_ref.to_lowercase() {
            self.error(format!(
                "Uuid {name} ({uuid}) not equal to {name_ref} ({uuid_ref})"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;
    use crate::probe::{MockProber, NoopFontInspector};
    use crate::xml::NoopValidator;

    fn empty_dcp() -> Dcp {
        let dir = tempfile::tempdir().unwrap();
        let dcp = Dcp::new(dir.path()).unwrap();
        // Leak the directory so the path stays alive for the test.
        std::mem::forget(dir);
        dcp
    }

    fn run_one(
        body: impl FnOnce(&mut Checker<'_>) -> CheckResult,
    ) -> Vec<CheckExecution> {
        let dcp = empty_dcp();
        let profile = Profile::default();
        let prober = MockProber::new();
        let mut checker = Checker::new(
            &dcp,
            &profile,
            &prober,
            &NoopValidator,
            &NoopFontInspector,
        );
        let stack = checker.dcp_stack();
        checker.run_check("check_example", "Example check.", &stack, body);
        checker.into_executions()
    }

    #[rstest]
    fn errors_accumulate_without_aborting() {
        let executions = run_one(|c| {
            c.error("first");
            c.error("second");
            Ok(())
        });

        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].errors.len(), 2);
        assert!(!executions[0].is_valid(Criticality::Error));
    }

    #[rstest]
    fn fatal_error_halts_the_body() {
        let executions = run_one(|c| {
            c.error("before");
            Err(c.fatal_error("fatal"))
        });

        assert_eq!(executions[0].errors.len(), 2);
        assert_eq!(executions[0].errors[1].message, "fatal");
    }

    #[rstest]
    fn panic_becomes_internal_error() {
        let executions = run_one(|_| panic!("checks should never do this"));

        assert_eq!(executions[0].errors.len(), 1);
        assert_eq!(executions[0].errors[0].name, "internal_error");
        assert!(executions[0].errors[0]
            .message
            .contains("checks should never do this"));
    }

    #[rstest]
    fn bypass_records_a_stub() {
        let dcp = empty_dcp();
        let profile = Profile {
            bypass: vec!["check_example".to_owned()],
            ..Profile::default()
        };
        let prober = MockProber::new();
        let mut checker = Checker::new(
            &dcp,
            &profile,
            &prober,
            &NoopValidator,
            &NoopFontInspector,
        );
        let stack = checker.dcp_stack();
        checker.run_check("check_example", "Example check.", &stack, |c| {
            c.error("never recorded");
            Ok(())
        });

        let executions = checker.into_executions();
        assert!(executions[0].bypass);
        assert!(executions[0].errors.is_empty());
    }

    #[rstest]
    fn sub_names_extend_the_check_name() {
        let executions = run_one(|c| {
            c.error_as("encrypted mismatch", "Encrypted", "");
            Ok(())
        });

        assert_eq!(executions[0].errors[0].full_name(), "check_example_encrypted");
    }
}
