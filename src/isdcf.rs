//! Tolerant parser for the ISDCF Digital Cinema Naming Convention, the
//! 12-part underscore-separated format used for CPL content titles.
//!
//! See <http://isdcf.com/dcnc/index.html> (convention 9.6).

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
use std::sync::OnceLock;

use regex::Regex;

/// Version of the naming convention the rule table encodes.
pub const DCNC_VERSION: &str = "9.6";

/// Field names in convention order.
pub const RULES_ORDER: [&str; 12] = [
    "FilmTitle",
    "ContentType",
    "ProjectorAspectRatio",
    "Language",
    "TerritoryRating",
    "AudioType",
    "Resolution",
    "Studio",
    "Date",
    "Facility",
    "Standard",
    "PackageType",
];

/// When a part fails to match its expected rule, the parser scans at
/// most this many rules ahead before giving up on the part.
const MAX_FIELD_SHIFT: usize = 3;

fn rules() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            ("FilmTitle", r"^[a-zA-Z0-9-]{1,14}$"),
            (
                "ContentType",
                r"(?x)^
                (?P<Type>FTR|EPS|TLR|TSR|PRO|TST|RTG-F|RTG-T|SHR|ADV|XSN|PSA|POL)
                (-(?P<Version>\d))?
                (-(?P<Temporary>Temp))?
                (-(?P<PreRelease>Pre))?
                (-(?P<RedBand>RedBand))?
                (-(?P<TheatreChain>[a-zA-Z0-9]))?
                (-(?P<Dimension>2D|3D))?
                (-(?P<MasteringLuminance>\d+fl))?
                (-(?P<FrameRate>\d+))?
                (-(?P<DolbyVision>DVis))?
                (-(?P<EclairColor>EC))?
                $",
            ),
            (
                "ProjectorAspectRatio",
                r"^(?P<AspectRatio>F|S|C)(-(?P<ImageAspectRatio>\d{1,3}))?$",
            ),
            (
                "Language",
                r"(?x)^
                (?P<AudioLanguage>[A-Z]{2,3})
                -(?P<SubtitleLanguage>[A-Za-z]{2,3})
                (-(?P<SubtitleLanguage2>[A-Za-z]{2,3}))?
                (-(?P<Caption>CCAP|OCAP))?
                $",
            ),
            (
                "TerritoryRating",
                r"^(?P<ReleaseTerritory>[A-Z]{2,3})(-(?P<LocalRating>[A-Z0-9+]{1,3}))?$",
            ),
            (
                "AudioType",
                r"(?x)^
                (?P<Channels>10|20|51|71|MOS)
                (-(?P<HearingImpaired>HI))?
                (-(?P<VisionImpaired>VI))?
                (-(?P<SignLanguage>SL))?
                (-(?P<ImmersiveSound>ATMOS|Atmos|AURO|DTS-X))?
                (-(?P<MotionSimulator>DBOX|Dbox))?
                $",
            ),
            ("Resolution", r"^(?P<Value>2K|4K)$"),
            ("Studio", r"^[A-Z0-9]{2,4}$"),
            ("Date", r"^(?P<Value>\d{8})$"),
            ("Facility", r"^[A-Z0-9]{2,3}$"),
            (
                "Standard",
                r"^(?P<Schema>IOP|SMPTE)(-(?P<Dimension>3D))?$",
            ),
            (
                "PackageType",
                r"^(?P<Type>OV|VF)(-(?P<Version>\d))?$",
            ),
        ]
        .into_iter()
        .map(|(name, re)| (name, Regex::new(re).expect("static rule")))
        .collect()
    })
}

/// One parsed naming-convention field: the raw part plus its named
/// qualifiers (absent qualifiers are empty strings).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Field {
    pub value: String,
    pub attrs: BTreeMap<String, String>,
}

/// All fields extracted from a content title, plus the derived
/// subtitle qualifiers from DCNC Appendix 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct NamingFields {
    fields: BTreeMap<&'static str, Field>,

    /// The subtitle language code is lowercase, meaning subtitles are
    /// burned into the picture.
    pub burned_subtitle: bool,

    /// A subtitle language is present and is not the `XX` placeholder.
    pub subtitle: bool,
}

impl NamingFields {
    /// The raw part consumed by `field`, or `""`.
    #[must_use]
    pub fn value(&self, field: &str) -> &str {
        self.fields.get(field).map_or("", |f| f.value.as_str())
    }

    /// A named qualifier of `field`, or `""` when absent.
    #[must_use]
    pub fn attr(&self, field: &str, key: &str) -> &str {
        self.fields
            .get(field)
            .and_then(|f| f.attrs.get(key))
            .map_or("", String::as_str)
    }

    /// Whether a flag-like qualifier is present (non-empty).
    #[must_use]
    pub fn has(&self, field: &str, key: &str) -> bool {
        !self.attr(field, key).is_empty()
    }
}

/// Parses a content title against the ordered rule table.
///
/// Parsing is tolerant: a part that does not match its expected rule is
/// tried against the next [`MAX_FIELD_SHIFT`] rules, and every anomaly
/// is reported in the returned error list while still extracting as
/// many fields as possible.
#[must_use]
pub fn parse_isdcf(title: &str) -> (NamingFields, Vec<String>) {
    let mut errors = Vec::new();
    let mut fields: BTreeMap<&'static str, Field> = BTreeMap::new();

    for (name, re) in rules() {
        let mut field = Field::default();
        for group in re.capture_names().flatten() {
            field.attrs.insert(group.to_owned(), String::new());
        }
        fields.insert(*name, field);
    }

    let parts: Vec<&str> = title.split('_').collect();
    if parts.len() != 12 {
        errors.push(format!(
            "ContentTitle should have 12 parts to be fully compliant with \
             ISDCF naming convention version {DCNC_VERSION}, {} part(s) found",
            parts.len()
        ));
    }

    let mut remaining: &[(&'static str, Regex)] = rules();
    let mut matched_names: Vec<&'static str> = Vec::new();

    for (idx_part, part) in parts.iter().enumerate() {
        let mut matched = false;

        for (idx_rule, (name, re)) in remaining.iter().enumerate() {
            let captures = re.captures(part);

            if idx_part == 0 && captures.is_none() {
                // The film title always consumes the first rule, even
                // when it breaks the character policy.
                errors.push(format!(
                    "ContentTitle Film Name does not respect naming convention rules : {part}"
                ));
            } else if let Some(captures) = &captures {
                if idx_rule >= MAX_FIELD_SHIFT {
                    continue;
                }
                let field = fields.get_mut(name).expect("initialized above");
                for group in re.capture_names().flatten() {
                    if let Some(m) = captures.name(group) {
                        field.attrs.insert(group.to_owned(), m.as_str().to_owned());
                    }
                }
            } else {
                continue;
            }

            fields.get_mut(name).expect("initialized above").value = (*part).to_owned();
            matched_names.push(*name);
            remaining = &remaining[idx_rule + 1..];
            matched = true;
            break;
        }

        if !matched {
            errors.push(format!(
                "ContentTitle Part {part} not matching any naming convention field"
            ));
        }
    }

    for name in RULES_ORDER {
        if !matched_names.contains(&name) {
            errors.push(format!("Field {name} not found in ContentTitle"));
        }
    }

    let mut naming = NamingFields {
        fields,
        burned_subtitle: false,
        subtitle: false,
    };
    post_parse(&mut naming);

    (naming, errors)
}

fn post_parse(naming: &mut NamingFields) {
    // Normalize the standard spelling.
    if let Some(standard) = naming.fields.get_mut("Standard") {
        if standard.attrs.get("Schema").map(String::as_str) == Some("IOP") {
            standard.attrs.insert("Schema".to_owned(), "Interop".to_owned());
        }
    }

    // DCNC Appendix 1, subtitle qualifiers.
    let st_lang = naming.attr("Language", "SubtitleLanguage").to_owned();
    naming.subtitle = !st_lang.is_empty() && st_lang != "XX";
    naming.burned_subtitle =
        !st_lang.is_empty() && st_lang.chars().all(|c| !c.is_ascii_uppercase());
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    const FULL_TITLE: &str = "MovieName_FTR-1-3D-48_S-239_EN-fr-CCAP_UK-U_51-HI-VI-ATMOS_4K_ST_20240125_FAC_SMPTE-3D_VF-2";

    #[rstest]
    fn full_title_extracts_every_field() {
        let (fields, errors) = parse_isdcf(FULL_TITLE);

        assert_eq!(errors, Vec::<String>::new());
        assert_eq!(fields.value("FilmTitle"), "MovieName");
        assert_eq!(fields.attr("ContentType", "Type"), "FTR");
        assert_eq!(fields.attr("ContentType", "Version"), "1");
        assert_eq!(fields.attr("ContentType", "Dimension"), "3D");
        assert_eq!(fields.attr("ContentType", "FrameRate"), "48");
        assert_eq!(fields.attr("ProjectorAspectRatio", "AspectRatio"), "S");
        assert_eq!(fields.attr("ProjectorAspectRatio", "ImageAspectRatio"), "239");
        assert_eq!(fields.attr("Language", "AudioLanguage"), "EN");
        assert_eq!(fields.attr("Language", "Caption"), "CCAP");
        assert_eq!(fields.attr("TerritoryRating", "ReleaseTerritory"), "UK");
        assert_eq!(fields.attr("AudioType", "Channels"), "51");
        assert_eq!(fields.attr("AudioType", "ImmersiveSound"), "ATMOS");
        assert!(fields.has("AudioType", "HearingImpaired"));
        assert_eq!(fields.attr("Resolution", "Value"), "4K");
        assert_eq!(fields.value("Studio"), "ST");
        assert_eq!(fields.attr("Date", "Value"), "20240125");
        assert_eq!(fields.value("Facility"), "FAC");
        assert_eq!(fields.attr("Standard", "Schema"), "SMPTE");
        assert_eq!(fields.attr("Standard", "Dimension"), "3D");
        assert_eq!(fields.attr("PackageType", "Type"), "VF");
        assert_eq!(fields.attr("PackageType", "Version"), "2");
    }

    #[rstest]
    fn subtitle_derivations() {
        let (fields, _) = parse_isdcf(FULL_TITLE);
        assert!(fields.subtitle);
        assert!(fields.burned_subtitle);

        let (fields, _) = parse_isdcf(
            "Foo_FTR_F_EN-XX_US-R_51_2K_DI_20501231_ECL_SMPTE_OV",
        );
        assert!(!fields.subtitle);
        assert!(!fields.burned_subtitle);
    }

    #[rstest]
    fn iop_standard_is_rewritten() {
        let (fields, _) =
            parse_isdcf("Foo_FTR_F_EN-XX_US-R_51_2K_DI_20501231_ECL_IOP_OV");
        assert_eq!(fields.attr("Standard", "Schema"), "Interop");
    }

    #[rstest]
    fn missing_part_is_tolerated() {
        // No aspect ratio part: Language aligns by scanning forward.
        let (fields, errors) =
            parse_isdcf("Foo_FTR_EN-XX_US-R_51_2K_DI_20501231_ECL_SMPTE_OV");

        assert_eq!(fields.attr("Language", "AudioLanguage"), "EN");
        assert_eq!(fields.attr("PackageType", "Type"), "OV");
        assert!(errors.iter().any(|e| e.contains("11 part(s) found")));
        assert!(errors
            .iter()
            .any(|e| e.contains("Field ProjectorAspectRatio not found")));
    }

    #[rstest]
    fn unparseable_part_is_reported() {
        let (_, errors) =
            parse_isdcf("Foo_FTR_F_EN-XX_US-R_51_2K_DI_20501231_ECL_SMPTE_??!");
        assert!(errors
            .iter()
            .any(|e| e.contains("not matching any naming convention field")));
    }

    #[rstest]
    fn invalid_film_title_still_consumes_first_rule() {
        let (fields, errors) =
            parse_isdcf("A Very Long Movie Title!_FTR_F_EN-XX_US-R_51_2K_DI_20501231_ECL_SMPTE_OV");
        assert_eq!(fields.value("FilmTitle"), "A Very Long Movie Title!");
        assert!(errors
            .iter()
            .any(|e| e.contains("Film Name does not respect")));
    }
}
