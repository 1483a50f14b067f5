#![doc = include_str!("../README.md")]
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
#![warn(clippy::pedantic, clippy::enum_glob_use)]
#![allow(
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cognitive_complexity
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod checks;
pub mod dcp;
pub mod isdcf;
pub mod model;
pub mod parse;
pub mod probe;
pub mod profile;
pub mod report;
pub mod sign;
pub mod util;
pub mod xml;

/// The descriptor family a package or document conforms to, deduced
/// from its XML namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Interop,
    Smpte,

    /// The stereoscopic picture sub-schema (SMPTE ST 429-10 or the
    /// Interop 437-Y equivalent).
    SmpteStereoscopic,

    /// The Dolby Atmos auxiliary data sub-schema.
    Atmos,

    Unknown,
}

impl Schema {
    /// The display name, also used when comparing against probe labels
    /// and naming-convention fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interop => "Interop",
            Self::Smpte => "SMPTE",
            Self::SmpteStereoscopic => "SMPTE Stereoscopic",
            Self::Atmos => "Atmos",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for Schema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Whether a package is self contained or references assets delivered
/// in another package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    /// Original Version, all assets resolved inside the package.
    Ov,

    /// Version File, at least one asset must be supplied by an OV.
    Vf,

    Unknown,
}

impl PackageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ov => "OV",
            Self::Vf => "VF",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for PackageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Severity of a single check finding, resolved from the profile once
/// all checks have run.
///
/// The ordering matters: a package is invalid when any un-bypassed
/// finding resolves to [`Criticality::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Criticality {
    Silent,
    Info,
    Warning,
    Error,
}

impl Criticality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silent => "SILENT",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    /// Section title used by the rendered report.
    #[must_use]
    pub fn pretty(self) -> &'static str {
        match self {
            Self::Silent => "Supressed(s)",
            Self::Info => "Info(s)",
            Self::Warning => "Warning(s)",
            Self::Error => "Error(s)",
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criticality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SILENT" => Ok(Self::Silent),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            other => Err(Error::Profile(format!(
                "unknown criticality level: {other}"
            ))),
        }
    }
}

impl serde::Serialize for Criticality {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Unrecoverable errors raised by the library.
///
/// Regular conformance findings never surface here, they accumulate in
/// the check report instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{} is not a valid folder", .0.display())]
    NotAFolder(PathBuf),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing XML {}: {message}", path.display())]
    Xml { path: PathBuf, message: String },

    /// Probing found a structurally impossible package, for example a
    /// reel carrying two assets of the same essence kind. Aborts the
    /// whole run.
    #[error("probing failed: {0}")]
    Probe(String),

    #[error("external command failed: {0}")]
    Command(String),

    #[error("profile error: {0}")]
    Profile(String),

    #[error("cryptography error: {0}")]
    Crypto(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_ordering() {
        assert!(Criticality::Error > Criticality::Warning);
        assert!(Criticality::Warning > Criticality::Info);
        assert!(Criticality::Info > Criticality::Silent);
    }

    #[test]
    fn criticality_round_trip() {
        for level in ["SILENT", "INFO", "WARNING", "ERROR"] {
            assert_eq!(level.parse::<Criticality>().unwrap().as_str(), level);
        }
        assert!("FATAL".parse::<Criticality>().is_err());
    }
}
