//! Timed-text checks: subtitle document structure, fonts, timing and
//! coherence with the CPL track.
//!
//! Interop subtitles are standalone XML files next to the CPL; SMPTE
//! subtitles are MXF-wrapped and unwrapped (decrypted when a KDM
//! content key is available) into a scratch directory first.

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

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::{Checker, CheckResult};
use crate::model::{Asset, CompositionPlaylist, EssenceKind};
use crate::util::{frames_to_timecode, human_size, timecode_to_frames};
use crate::xml::read_source;
use crate::Schema;

/// Maximum font file size, Interop TI subtitle specification.
const FONT_MAX_SIZE: u64 = 655_360;

/// Structural ceilings per subtitle event.
const MAX_TEXT_ELEMENTS: usize = 6;
const MAX_IMAGE_ELEMENTS: usize = 6;

/// At most this many subtitles may be visible at the same instant.
const MAX_SIMULTANEOUS: usize = 2;

/// A font loaded by a subtitle document.
#[derive(Debug, Clone, Default)]
pub struct LoadFont {
    pub id: String,
    pub uri: String,
}

/// One `Subtitle` event.
#[derive(Debug, Clone, Default)]
pub struct SubtitleEvent {
    pub spot_number: String,
    pub time_in: String,
    pub time_out: String,
    pub fade_up: Option<String>,
    pub fade_down: Option<String>,
    pub text_count: usize,
    pub image_count: usize,
    pub texts: Vec<String>,
    /// Image references (PNG file names for Interop).
    pub images: Vec<String>,
    /// `(VAlign, VPosition)` pairs found on the event's elements.
    pub positions: Vec<(String, f64)>,
}

/// A parsed subtitle document (Interop `DCSubtitle` or SMPTE
/// `SubtitleReel`).
#[derive(Debug, Clone)]
pub struct SubtitleDoc {
    pub path: PathBuf,
    pub schema: Schema,
    pub xmlns: String,
    pub id: Option<String>,
    pub language: Option<String>,
    pub reel_number: Option<i64>,
    /// SMPTE only.
    pub time_code_rate: Option<f64>,
    pub load_fonts: Vec<LoadFont>,
    pub font_refs: Vec<String>,
    pub events: Vec<SubtitleEvent>,
}

impl SubtitleDoc {
    /// Parses a subtitle XML file.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the file cannot be read or is not an
    /// Interop / SMPTE subtitle document.
    pub fn parse(path: &Path) -> Result<Self, crate::Error> {
        let text = read_source(path)?;
        let doc = roxmltree::Document::parse(&text).map_err(|e| crate::Error::Xml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let root = doc.root_element();

        let schema = match root.tag_name().name() {
            "DCSubtitle" => Schema::Interop,
            "SubtitleReel" => Schema::Smpte,
            other => {
                return Err(crate::Error::Xml {
                    path: path.to_path_buf(),
                    message: format!("unexpected subtitle root element {other}"),
                })
            }
        };

        let child_text = |name: &str| {
            root.children()
                .find(|c| c.is_element() && c.tag_name().name() == name)
                .and_then(|c| c.text())
                .map(|t| t.trim().to_owned())
        };

        let id = match schema {
            Schema::Interop => child_text("SubtitleID"),
            _ => child_text("Id").map(|id| {
                id.trim().strip_prefix("urn:uuid:").unwrap_or(id.trim()).to_owned()
            }),
        };

        let mut load_fonts = Vec::new();
        let mut font_refs = Vec::new();
        for node in doc.descendants().filter(roxmltree::Node::is_element) {
            match node.tag_name().name() {
                // Interop spells the attribute Id, SMPTE spells it ID;
                // both forms are accepted on either schema.
                "LoadFont" => load_fonts.push(LoadFont {
                    id: node
                        .attribute("ID")
                        .or_else(|| node.attribute("Id"))
                        .unwrap_or("")
                        .to_owned(),
                    uri: node
                        .attribute("URI")
                        .map(str::to_owned)
                        .or_else(|| node.text().map(|t| t.trim().to_owned()))
                        .unwrap_or_default(),
                }),
                "Font" => {
                    if let Some(id) = node.attribute("ID").or_else(|| node.attribute("Id")) {
                        font_refs.push(id.to_owned());
                    }
                }
                _ => {}
            }
        }

        let events = doc
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "Subtitle")
            .map(|node| parse_event(node))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            schema,
            xmlns: root.tag_name().namespace().unwrap_or("").to_owned(),
            id,
            language: child_text("Language"),
            reel_number: child_text("ReelNumber").and_then(|t| t.parse().ok()),
            time_code_rate: child_text("TimeCodeRate").and_then(|t| t.parse().ok()),
            load_fonts,
            font_refs,
            events,
        })
    }
}

fn parse_event(node: roxmltree::Node<'_, '_>) -> SubtitleEvent {
    let mut event = SubtitleEvent {
        spot_number: node.attribute("SpotNumber").unwrap_or("").to_owned(),
        time_in: node.attribute("TimeIn").unwrap_or("").to_owned(),
        time_out: node.attribute("TimeOut").unwrap_or("").to_owned(),
        fade_up: node.attribute("FadeUpTime").map(str::to_owned),
        fade_down: node.attribute("FadeDownTime").map(str::to_owned),
        ..SubtitleEvent::default()
    };

    for child in node.descendants().filter(roxmltree::Node::is_element) {
        match child.tag_name().name() {
            "Text" => {
                event.text_count += 1;
                let content: String = child
                    .descendants()
                    .filter(|n| n.is_text())
                    .filter_map(|n| n.text())
                    .collect::<Vec<_>>()
                    .join("");
                event.texts.push(content.trim().to_owned());
            }
            "Image" => {
                event.image_count += 1;
                if let Some(reference) = child.text() {
                    event.images.push(reference.trim().to_owned());
                }
            }
            _ => {}
        }
    }

    for element in node.descendants().filter(|n| n.is_element()) {
        let valign = element.attribute("VAlign");
        let vposition = element.attribute("VPosition");
        if valign.is_some() || vposition.is_some() {
            event.positions.push((
                valign.unwrap_or("").to_owned(),
                vposition.and_then(|v| v.parse().ok()).unwrap_or(0.0),
            ));
        }
    }

    event
}

/// Converts a tick count (4ms units) to frames, rounding up.
fn ticks_to_frames(ticks: i64, edit_rate: f64) -> i64 {
    (ticks as f64 * 0.004 * edit_rate).ceil() as i64
}

fn tick_tc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2}):(?P<Tick>\d{2,3})$").unwrap()
    })
}

fn fract_tc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<H>\d{2}):(?P<M>\d{2}):(?P<S>\d{2})\.(?P<Fract>\d{1,3})$").unwrap()
    })
}

/// Converts a subtitle time to a frame count.
///
/// Interop times are `HH:MM:SS:TTT` (ticks of 4ms), `HH:MM:SS.sss` or a
/// bare tick count; SMPTE times are `HH:MM:SS:E+` in the track's
/// `TimeCodeRate`.
#[must_use]
pub fn subtitle_time_to_frames(tc: &str, edit_rate: f64, schema: Schema) -> Option<i64> {
    let tc = tc.trim();

    if schema == Schema::Interop {
        if tc.len() <= 3 && tc.chars().all(|c| c.is_ascii_digit()) {
            return Some(ticks_to_frames(tc.parse().ok()?, edit_rate));
        }
        if let Some(caps) = tick_tc_re().captures(tc) {
            let frames = ticks_to_frames(caps["Tick"].parse().ok()?, edit_rate);
            let base = format!("{}:{}:{}:00", &caps["H"], &caps["M"], &caps["S"]);
            return Some(timecode_to_frames(&base, edit_rate)? + frames);
        }
        if let Some(caps) = fract_tc_re().captures(tc) {
            let fract: f64 = format!("0.{}", &caps["Fract"]).parse().ok()?;
            let frames = (fract * edit_rate) as i64;
            let base = format!("{}:{}:{}:00", &caps["H"], &caps["M"], &caps["S"]);
            return Some(timecode_to_frames(&base, edit_rate)? + frames);
        }
    }

    timecode_to_frames(tc, edit_rate)
}

/// Minimal RFC 5646 primary-subtag equivalences for the language
/// coherence check (2-letter vs 3-letter spellings).
const LANGUAGE_ALIASES: &[(&str, &[&str])] = &[
    ("en", &["eng"]),
    ("fr", &["fra", "fre"]),
    ("de", &["deu", "ger"]),
    ("es", &["spa"]),
    ("it", &["ita"]),
    ("pt", &["por"]),
    ("nl", &["nld", "dut"]),
    ("ja", &["jpn"]),
    ("ko", &["kor"]),
    ("zh", &["zho", "chi"]),
    ("ru", &["rus"]),
    ("ar", &["ara"]),
    ("hi", &["hin"]),
    ("pl", &["pol"]),
    ("tr", &["tur"]),
];

fn languages_match(a: &str, b: &str) -> bool {
    let normalize = |code: &str| {
        code.split('-')
            .next()
            .unwrap_or(code)
            .to_lowercase()
    };
    let (a, b) = (normalize(a), normalize(b));
    if a == b {
        return true;
    }

    LANGUAGE_ALIASES.iter().any(|(short, longs)| {
        (a == *short && longs.contains(&b.as_str()))
            || (b == *short && longs.contains(&a.as_str()))
    })
}

pub(super) fn run(checker: &mut Checker<'_>) {
    let dcp = checker.dcp;

    for cpl in &dcp.cpls {
        for (kind, asset) in cpl.assets() {
            let timed_text =
                kind == EssenceKind::Subtitle || kind == EssenceKind::ClosedCaption;
            if !timed_text || asset.path.is_empty() {
                continue;
            }
            let stack = vec![cpl.file_name.clone(), asset.handle()];

            checker.run_check(
                "check_subtitle_dcp_format",
                "Subtitle format (related to DCP Standard) check.",
                &stack,
                |c| check_subtitle_dcp_format(c, asset),
            );
            checker.run_check(
                "check_subtitle_cpl_entry_point",
                "SMPTE timed-text EntryPoint shall be 0.",
                &stack,
                |c| check_subtitle_cpl_entry_point(c, asset),
            );

            run_folder_checks(checker, cpl, asset, &stack);
        }
    }
}

/// Locates (Interop) or unwraps (SMPTE) the subtitle document, then
/// runs every check that needs it.
fn run_folder_checks(
    checker: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
    asset: &Asset,
    stack: &[String],
) {
    let Some(absolute) = &asset.absolute_path else {
        return;
    };

    let is_mxf = absolute.extension().and_then(|e| e.to_str()) == Some("mxf");
    let scratch;
    let (folder, xml_path): (PathBuf, PathBuf) = match checker.dcp.schema {
        Schema::Smpte if is_mxf && absolute.is_file() => {
            let key = if asset.encrypted {
                match asset.key_id.as_deref().and_then(|k| checker.dcp.content_key_for(k)) {
                    Some(key) => Some(key),
                    None => {
                        log::info!(
                            "Subtitle inspection skipped : no content key for {}",
                            absolute.display()
                        );
                        return;
                    }
                }
            } else {
                None
            };

            match checker
                .prober
                .unwrap(absolute, key.as_deref(), &[], None)
            {
                Ok(dir) => {
                    let stem = absolute
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let xml = dir.path().join(stem);
                    scratch = dir;
                    (scratch.path().to_path_buf(), xml)
                }
                Err(e) => {
                    log::info!("Subtitle inspection skipped : {e}");
                    return;
                }
            }
        }
        Schema::Interop => {
            let folder = absolute
                .parent()
                .map_or_else(|| checker.dcp.path.clone(), Path::to_path_buf);
            (folder.clone(), absolute.clone())
        }
        _ => return,
    };

    let doc = SubtitleDoc::parse(&xml_path).ok();
    let doc = doc.as_ref();

    checker.run_check(
        "check_subtitle_cpl_xml",
        "Subtitle XML file syntax and structure validation.",
        stack,
        |c| check_subtitle_cpl_xml(c, asset, &xml_path, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_reel_number",
        "Subtitle reel number coherence with CPL.",
        stack,
        |c| check_subtitle_cpl_reel_number(c, cpl, asset, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_language",
        "Subtitle language coherence with CPL.",
        stack,
        |c| check_subtitle_cpl_language(c, asset, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_loadfont",
        "Text subtitle must contains one and only one LoadFont element.",
        stack,
        |c| check_subtitle_cpl_loadfont(c, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_font_ref",
        "Subtitle font references check.",
        stack,
        |c| check_subtitle_cpl_font_ref(c, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_font",
        "Subtitle font file exists.",
        stack,
        |c| check_subtitle_cpl_font(c, doc, &folder),
    );
    checker.run_check(
        "check_subtitle_cpl_font_size",
        "Subtitle maximum font size.",
        stack,
        |c| check_subtitle_cpl_font_size(c, doc, &folder),
    );
    checker.run_check(
        "check_subtitle_cpl_font_glyph",
        "Check for missing font glyphs.",
        stack,
        |c| check_subtitle_cpl_font_glyph(c, doc, &folder),
    );
    checker.run_check(
        "check_subtitle_cpl_st_timing",
        "Subtitle individual duration / fade time check.",
        stack,
        |c| check_subtitle_cpl_st_timing(c, asset, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_duration",
        "Subtitle duration coherence with CPL.",
        stack,
        |c| check_subtitle_cpl_duration(c, cpl, asset, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_editrate",
        "Subtitle editrate coherence with CPL.",
        stack,
        |c| check_subtitle_cpl_editrate(c, asset, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_uuid",
        "Subtitle UUID coherence.",
        stack,
        |c| check_subtitle_cpl_uuid(c, asset, doc, &folder),
    );
    checker.run_check(
        "check_subtitle_cpl_uuid_case",
        "Subtitle UUID case mismatch.",
        stack,
        |c| check_subtitle_cpl_uuid_case(c, asset, doc, &folder),
    );
    checker.run_check(
        "check_subtitle_cpl_duplicated_uuid",
        "Issue when using the same UUID for Subtitle XML and MXF.",
        stack,
        |c| check_subtitle_cpl_duplicated_uuid(c, asset, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_empty",
        "Empty Subtitle file check.",
        stack,
        |c| check_subtitle_cpl_empty(c, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_content",
        "Subtitle individual structure check.",
        stack,
        |c| check_subtitle_cpl_content(c, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_position",
        "Subtitles vertical position (out of screen) check.",
        stack,
        |c| check_subtitle_cpl_position(c, doc),
    );
    checker.run_check(
        "check_subtitle_cpl_image",
        "Subtitle image element must reference a valid PNG file.",
        stack,
        |c| check_subtitle_cpl_image(c, doc, &folder),
    );
    checker.run_check(
        "check_subtitle_cpl_simultaneous",
        "At most two subtitles shall be visible at the same time.",
        stack,
        |c| check_subtitle_cpl_simultaneous(c, asset, doc),
    );
}

fn subtitle_edit_rate(asset: &Asset, doc: &SubtitleDoc) -> Option<f64> {
    match doc.schema {
        Schema::Smpte => doc.time_code_rate,
        _ => asset.edit_rate,
    }
}

fn check_subtitle_dcp_format(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    let expected = match c.dcp.schema {
        Schema::Interop => "xml",
        Schema::Smpte => "mxf",
        _ => return Ok(()),
    };

    let extension = Path::new(&asset.path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if extension != expected {
        c.error(format!("Wrong subtitle format for asset {}", asset.path));
    }
    Ok(())
}

fn check_subtitle_cpl_entry_point(c: &mut Checker<'_>, asset: &Asset) -> CheckResult {
    if c.dcp.schema != Schema::Smpte {
        return Ok(());
    }

    if let Some(entry) = asset.entry_point {
        if entry != 0 {
            c.error(format!(
                "SMPTE timed-text EntryPoint must be 0, got {entry}"
            ));
        }
    }
    Ok(())
}

fn check_subtitle_cpl_xml(
    c: &mut Checker<'_>,
    asset: &Asset,
    xml_path: &Path,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    if !xml_path.exists() {
        return Err(c.fatal_error(format!(
            "Subtitle not found : {}",
            xml_path.display()
        )));
    }
    if !xml_path.is_file() {
        return Err(c.fatal_error(format!(
            "Subtitle must be a file : {}",
            xml_path.display()
        )));
    }
    let Some(doc) = doc else {
        return Err(c.fatal_error(format!(
            "Subtitle cannot be parsed : {}",
            xml_path.display()
        )));
    };

    match doc.schema {
        Schema::Interop => {
            // The Interop subtitle format predates namespaces, there
            // is no XSD to check against.
            for (name, message) in crate::xml::check_constraints(xml_path) {
                c.error_as(message, name, "");
            }
        }
        _ => {
            let label = asset
                .probe
                .as_ref()
                .and_then(|p| p.label_set_type.as_deref());
            let label_schema = match label {
                Some("MXFInterop") => Schema::Interop,
                Some("SMPTE") => Schema::Smpte,
                _ => doc.schema,
            };
            c.xml_integrity(xml_path, &doc.xmlns, label_schema);
        }
    }
    Ok(())
}

fn check_subtitle_cpl_reel_number(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let Some(reel_number) = doc.reel_number else {
        return Ok(());
    };

    if let Some(reel) = cpl.reel_for_asset(&asset.id) {
        if reel_number != reel.position as i64 {
            c.error(format!(
                "Subtitle file indicate Reel {reel_number} but actually used in \
                 Reel {}",
                reel.position
            ));
        }
    }
    Ok(())
}

fn check_subtitle_cpl_language(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let (Some(st_lang), Some(cpl_lang)) = (doc.language.as_deref(), asset.language.as_deref())
    else {
        return Ok(());
    };

    if !languages_match(st_lang, cpl_lang) {
        c.error(format!(
            "Subtitle language mismatch, CPL claims {cpl_lang} but XML {st_lang}"
        ));
    }
    Ok(())
}

fn check_subtitle_cpl_loadfont(c: &mut Checker<'_>, doc: Option<&SubtitleDoc>) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };

    let has_text = doc.events.iter().any(|e| e.text_count > 0);
    if !has_text {
        return Ok(());
    }

    if doc.load_fonts.len() != 1 {
        c.error(format!(
            "Text based subtitle shall contain one and only one LoadFont \
             element, found {}",
            doc.load_fonts.len()
        ));
    } else if doc.load_fonts[0].id.is_empty() {
        c.error("LoadFont element with an empty ID attribute");
    }
    Ok(())
}

fn check_subtitle_cpl_font_ref(c: &mut Checker<'_>, doc: Option<&SubtitleDoc>) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let Some(loaded) = doc.load_fonts.first() else {
        return Ok(());
    };

    for reference in &doc.font_refs {
        if reference != &loaded.id {
            c.error(format!(
                "Subtitle reference unknown font {reference} (loaded {})",
                loaded.id
            ));
        }
    }
    Ok(())
}

fn font_path(doc: &SubtitleDoc, folder: &Path) -> Option<(PathBuf, String)> {
    let font = doc.load_fonts.first()?;
    if font.uri.is_empty() {
        return None;
    }
    let uri = match doc.schema {
        Schema::Smpte => font.uri.to_lowercase(),
        _ => font.uri.clone(),
    };
    Some((folder.join(&uri), uri))
}

fn check_subtitle_cpl_font(
    c: &mut Checker<'_>,
    doc: Option<&SubtitleDoc>,
    folder: &Path,
) -> CheckResult {
    let Some((path, uri)) = doc.and_then(|d| font_path(d, folder)) else {
        return Ok(());
    };

    if !path.exists() {
        c.error(format!("Subtitle missing font file : {uri}"));
    }
    Ok(())
}

fn check_subtitle_cpl_font_size(
    c: &mut Checker<'_>,
    doc: Option<&SubtitleDoc>,
    folder: &Path,
) -> CheckResult {
    let Some((path, _)) = doc.and_then(|d| font_path(d, folder)) else {
        return Ok(());
    };
    let Ok(metadata) = path.metadata() else {
        return Ok(());
    };

    if metadata.len() > FONT_MAX_SIZE {
        c.error(format!(
            "Subtitle font maximum size is {}, got {}",
            human_size(FONT_MAX_SIZE),
            human_size(metadata.len())
        ));
    }
    Ok(())
}

fn check_subtitle_cpl_font_glyph(
    c: &mut Checker<'_>,
    doc: Option<&SubtitleDoc>,
    folder: &Path,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let Some((path, _)) = font_path(doc, folder) else {
        return Ok(());
    };
    let Some(coverage) = c.fonts.glyphs(&path) else {
        // No inspector available, coverage cannot be checked.
        return Ok(());
    };

    let mut missing: Vec<char> = doc
        .events
        .iter()
        .flat_map(|e| e.texts.iter())
        .flat_map(|text| text.chars())
        .filter(|ch| !coverage.contains(ch))
        .collect();
    missing.sort_unstable();
    missing.dedup();

    if !missing.is_empty() {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let missing: Vec<String> = missing.iter().map(ToString::to_string).collect();
        c.error(format!(
            "Font ({file}) is missing required glyphs : {}",
            missing.join(", ")
        ));
    }
    Ok(())
}

fn check_subtitle_cpl_st_timing(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let Some(rate) = subtitle_edit_rate(asset, doc) else {
        return Ok(());
    };

    for event in &doc.events {
        let frames = |tc: &str| subtitle_time_to_frames(tc, rate, doc.schema);
        let (Some(time_in), Some(time_out)) =
            (frames(&event.time_in), frames(&event.time_out))
        else {
            continue;
        };
        let duration = time_out - time_in;

        if duration <= 0 {
            c.error(format!(
                "Subtitle {} null or negative duration",
                event.spot_number
            ));
            continue;
        }

        let fade_up = event.fade_up.as_deref().and_then(|t| frames(t));
        let fade_down = event.fade_down.as_deref().and_then(|t| frames(t));
        if fade_up.is_some_and(|f| f > duration) {
            c.error(format!(
                "Subtitle {} FadeUpTime longer than duration",
                event.spot_number
            ));
        }
        if fade_down.is_some_and(|f| f > duration) {
            c.error(format!(
                "Subtitle {} FadeDownTime longer than duration",
                event.spot_number
            ));
        }
    }
    Ok(())
}

fn check_subtitle_cpl_duration(
    c: &mut Checker<'_>,
    cpl: &CompositionPlaylist,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let (Some(st_rate), Some(cpl_rate), Some(cpl_duration)) =
        (subtitle_edit_rate(asset, doc), asset.edit_rate, asset.duration)
    else {
        return Ok(());
    };
    if cpl_rate == 0.0 || st_rate == 0.0 {
        return Ok(());
    }

    let last = doc
        .events
        .iter()
        .filter_map(|e| subtitle_time_to_frames(&e.time_out, st_rate, doc.schema))
        .max()
        .unwrap_or(0);

    let ratio = st_rate / cpl_rate;
    let last_on_track = (last as f64 / ratio) as i64;

    if last_on_track > cpl_duration {
        let reel = cpl
            .reel_for_asset(&asset.id)
            .map_or(0, |reel| reel.position);
        c.error(format!(
            "Subtitle exceed track duration. Subtitle {} - Track {} - Reel {reel}",
            frames_to_timecode(last_on_track, cpl_rate),
            frames_to_timecode(cpl_duration, cpl_rate)
        ));
    }
    Ok(())
}

fn check_subtitle_cpl_editrate(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    if c.dcp.schema != Schema::Smpte {
        return Ok(());
    }

    let (Some(st_rate), Some(cpl_rate)) = (doc.time_code_rate, asset.edit_rate) else {
        return Ok(());
    };
    if !crate::util::compare_ratio(st_rate, cpl_rate) {
        c.error(format!(
            "Subtitle EditRate mismatch, Subtitle claims {st_rate} but CPL {cpl_rate}"
        ));
    }
    Ok(())
}

fn check_subtitle_cpl_uuid(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
    folder: &Path,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let Some(st_uuid) = doc.id.as_deref() else {
        return Ok(());
    };
    let st_uuid_lc = st_uuid.to_lowercase();

    match c.dcp.schema {
        Schema::Interop => {
            let cpl_uuid = asset.id.to_lowercase();
            if st_uuid_lc != cpl_uuid {
                c.error(format!(
                    "Subtitle UUID mismatch, Subtitle claims {st_uuid_lc} but CPL {cpl_uuid}"
                ));
            }

            let folder_name = folder
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if !folder_name.contains(&st_uuid_lc) {
                c.error(format!(
                    "Subtitle directory name unexpected, should contain {st_uuid_lc} \
                     but got {folder_name}"
                ));
            }
        }
        Schema::Smpte => {
            let resource = asset
                .probe
                .as_ref()
                .and_then(|p| p.asset_id.as_deref())
                .unwrap_or("")
                .to_lowercase();
            if resource != st_uuid_lc {
                c.error(format!(
                    "Subtitle UUID mismatch, Subtitle claims {st_uuid_lc} but MXF {resource}"
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_subtitle_cpl_uuid_case(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
    folder: &Path,
) -> CheckResult {
    if c.dcp.schema != Schema::Interop {
        return Ok(());
    }
    let Some(doc) = doc else { return Ok(()) };
    let Some(st_uuid) = doc.id.as_deref() else {
        return Ok(());
    };

    let cpl_uuid = &asset.id;
    if st_uuid != cpl_uuid && st_uuid.eq_ignore_ascii_case(cpl_uuid) {
        c.error(format!(
            "Subtitle UUID case mismatch, Subtitle {st_uuid} - CPL {cpl_uuid}"
        ));
    }

    let folder_name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !folder_name.contains(st_uuid)
        && folder_name.to_lowercase().contains(&st_uuid.to_lowercase())
    {
        c.error(format!(
            "Subtitle directory name case mismatch, Folder {folder_name} - CPL {st_uuid}"
        ));
    }
    Ok(())
}

fn check_subtitle_cpl_duplicated_uuid(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    if c.dcp.schema != Schema::Smpte {
        return Ok(());
    }
    let Some(doc) = doc else { return Ok(()) };
    let (Some(st_uuid), Some(mxf_uuid)) = (
        doc.id.as_deref(),
        asset.probe.as_ref().and_then(|p| p.asset_uuid.as_deref()),
    ) else {
        return Ok(());
    };

    if st_uuid.eq_ignore_ascii_case(mxf_uuid) {
        c.error(
            "Using the same UUID for Subtitle ID and MXF UUID can cause issue \
             on Dolby server prior to 2.8.18 firmware.",
        );
    }
    Ok(())
}

fn check_subtitle_cpl_empty(c: &mut Checker<'_>, doc: Option<&SubtitleDoc>) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };

    if doc.events.is_empty() {
        c.error("Subtitle file is empty");
    }
    Ok(())
}

fn check_subtitle_cpl_content(c: &mut Checker<'_>, doc: Option<&SubtitleDoc>) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };

    for event in &doc.events {
        if event.text_count == 0 && event.image_count == 0 {
            c.error(format!(
                "Subtitle {} element must define one Text or Image",
                event.spot_number
            ));
        }
        if event.text_count > MAX_TEXT_ELEMENTS {
            c.error(format!(
                "Subtitle {} contains {} Text elements, maximum is {MAX_TEXT_ELEMENTS}",
                event.spot_number, event.text_count
            ));
        }
        if event.image_count > MAX_IMAGE_ELEMENTS {
            c.error(format!(
                "Subtitle {} contains {} Image elements, maximum is {MAX_IMAGE_ELEMENTS}",
                event.spot_number, event.image_count
            ));
        }
    }
    Ok(())
}

fn check_subtitle_cpl_position(c: &mut Checker<'_>, doc: Option<&SubtitleDoc>) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };

    for event in &doc.events {
        for (valign, vposition) in &event.positions {
            if valign == "top" && *vposition == 0.0 {
                c.error(format!(
                    "Subtitle {} is out of screen (top)",
                    event.spot_number
                ));
            }
            if valign == "bottom" && *vposition == 0.0 {
                c.error(format!(
                    "Subtitle {} is nearly out of screen (bottom), some characters \
                     will be cut",
                    event.spot_number
                ));
            }
        }
    }
    Ok(())
}

fn check_subtitle_cpl_image(
    c: &mut Checker<'_>,
    doc: Option<&SubtitleDoc>,
    folder: &Path,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    // PNG references are inline resources on SMPTE, only Interop
    // references sibling files.
    if c.dcp.schema != Schema::Interop {
        return Ok(());
    }

    for image in doc.events.iter().flat_map(|e| e.images.iter()) {
        if !folder.join(image).exists() {
            c.error(format!(
                "Subtitle image reference {image} not found in folder {}",
                folder.display()
            ));
        }
    }
    Ok(())
}

fn check_subtitle_cpl_simultaneous(
    c: &mut Checker<'_>,
    asset: &Asset,
    doc: Option<&SubtitleDoc>,
) -> CheckResult {
    let Some(doc) = doc else { return Ok(()) };
    let Some(rate) = subtitle_edit_rate(asset, doc) else {
        return Ok(());
    };

    // Sweep over the visibility envelopes (fades happen inside the
    // TimeIn..TimeOut window, so the envelope is the window itself).
    let mut bounds = Vec::new();
    for event in &doc.events {
        let frames = |tc: &str| subtitle_time_to_frames(tc, rate, doc.schema);
        if let (Some(time_in), Some(time_out)) =
            (frames(&event.time_in), frames(&event.time_out))
        {
            bounds.push((time_in, 1_i32));
            bounds.push((time_out, -1_i32));
        }
    }
    bounds.sort_unstable();

    let mut visible = 0_i32;
    let mut peak = 0_i32;
    for (_, delta) in bounds {
        visible += delta;
        peak = peak.max(visible);
    }

    if peak > MAX_SIMULTANEOUS as i32 {
        c.error(format!(
            "Up to {peak} subtitles visible simultaneously, maximum is \
             {MAX_SIMULTANEOUS}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    const INTEROP_SUBTITLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DCSubtitle Version="1.0">
  <SubtitleID>a8b9c0d1-e2f3-1a4b-8c5d-6e7f8a9b0c1d</SubtitleID>
  <MovieTitle>Foo</MovieTitle>
  <ReelNumber>1</ReelNumber>
  <Language>French</Language>
  <LoadFont Id="theFont" URI="arial.ttf"/>
  <Font Id="theFont" Size="42" Color="FFFFFFFF">
    <Subtitle SpotNumber="1" TimeIn="00:00:05:000" TimeOut="00:00:07:120" FadeUpTime="20" FadeDownTime="20">
      <Text VAlign="bottom" VPosition="10.0">Une phrase.</Text>
    </Subtitle>
    <Subtitle SpotNumber="2" TimeIn="00:00:09:000" TimeOut="00:00:11:000">
      <Text VAlign="top" VPosition="0">Une autre phrase.</Text>
    </Subtitle>
  </Font>
</DCSubtitle>
"#;

    fn write_doc(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subtitle.xml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn run_single(
        dcp_schema: Schema,
        body: impl FnOnce(&mut Checker<'_>) -> CheckResult,
    ) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let mut dcp = crate::dcp::Dcp::new(dir.path()).unwrap();
        dcp.schema = dcp_schema;
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
        checker.run_check("check_subtitle", "Subtitle check.", &stack, body);
        checker
            .into_executions()
            .into_iter()
            .flat_map(|e| e.errors.into_iter().map(|err| err.message))
            .collect()
    }

    #[rstest]
    fn interop_document_is_parsed() {
        let (_dir, path) = write_doc(INTEROP_SUBTITLE);
        let doc = SubtitleDoc::parse(&path).unwrap();

        assert_eq!(doc.schema, Schema::Interop);
        assert_eq!(doc.id.as_deref(), Some("a8b9c0d1-e2f3-1a4b-8c5d-6e7f8a9b0c1d"));
        assert_eq!(doc.reel_number, Some(1));
        assert_eq!(doc.language.as_deref(), Some("French"));
        assert_eq!(doc.load_fonts.len(), 1);
        assert_eq!(doc.load_fonts[0].id, "theFont");
        assert_eq!(doc.load_fonts[0].uri, "arial.ttf");
        assert_eq!(doc.events.len(), 2);
        assert_eq!(doc.events[0].text_count, 1);
        assert_eq!(doc.events[0].texts[0], "Une phrase.");
    }

    #[rstest]
    #[case("25", 24.0, 3)] // 25 ticks = 100ms -> ceil(2.4) frames
    #[case("250", 25.0, 25)] // 1 second of ticks
    fn interop_ticks_conversion(#[case] tc: &str, #[case] rate: f64, #[case] frames: i64) {
        assert_eq!(
            subtitle_time_to_frames(tc, rate, Schema::Interop),
            Some(frames)
        );
    }

    #[rstest]
    fn interop_timecode_forms() {
        // 5 seconds at 24 fps.
        assert_eq!(
            subtitle_time_to_frames("00:00:05:000", 24.0, Schema::Interop),
            Some(120)
        );
        // 4ms ticks: 120 ticks = 480ms -> ceil(11.52) = 12 frames.
        assert_eq!(
            subtitle_time_to_frames("00:00:00:120", 24.0, Schema::Interop),
            Some(12)
        );
        // Fractional seconds.
        assert_eq!(
            subtitle_time_to_frames("00:00:02.5", 24.0, Schema::Interop),
            Some(60)
        );
    }

    #[rstest]
    fn smpte_timecode_uses_edit_units() {
        assert_eq!(
            subtitle_time_to_frames("00:00:02:12", 24.0, Schema::Smpte),
            Some(60)
        );
    }

    #[rstest]
    fn out_of_screen_position_is_flagged() {
        let (_dir, path) = write_doc(INTEROP_SUBTITLE);
        let doc = SubtitleDoc::parse(&path).unwrap();

        let errors = run_single(Schema::Interop, |c| {
            check_subtitle_cpl_position(c, Some(&doc))
        });
        assert_eq!(errors, vec!["Subtitle 2 is out of screen (top)".to_owned()]);
    }

    #[rstest]
    fn loadfont_must_be_unique() {
        let duplicated = INTEROP_SUBTITLE.replace(
            "<LoadFont Id=\"theFont\" URI=\"arial.ttf\"/>",
            "<LoadFont Id=\"theFont\" URI=\"arial.ttf\"/>\n  <LoadFont Id=\"other\" URI=\"other.ttf\"/>",
        );
        let (_dir, path) = write_doc(&duplicated);
        let doc = SubtitleDoc::parse(&path).unwrap();

        let errors = run_single(Schema::Interop, |c| {
            check_subtitle_cpl_loadfont(c, Some(&doc))
        });
        assert!(errors[0].contains("one and only one LoadFont"));
    }

    #[rstest]
    fn unknown_font_reference_is_flagged() {
        let unknown = INTEROP_SUBTITLE
            .replace("<Font Id=\"theFont\"", "<Font Id=\"ghost\"");
        let (_dir, path) = write_doc(&unknown);
        let doc = SubtitleDoc::parse(&path).unwrap();

        let errors = run_single(Schema::Interop, |c| {
            check_subtitle_cpl_font_ref(c, Some(&doc))
        });
        assert!(errors[0].contains("unknown font ghost"));
    }

    #[rstest]
    fn negative_duration_is_flagged() {
        let swapped = INTEROP_SUBTITLE.replace(
            "TimeIn=\"00:00:05:000\" TimeOut=\"00:00:07:120\"",
            "TimeIn=\"00:00:07:120\" TimeOut=\"00:00:05:000\"",
        );
        let (_dir, path) = write_doc(&swapped);
        let doc = SubtitleDoc::parse(&path).unwrap();
        let asset = Asset {
            edit_rate: Some(24.0),
            ..Asset::default()
        };

        let errors = run_single(Schema::Interop, |c| {
            check_subtitle_cpl_st_timing(c, &asset, Some(&doc))
        });
        assert_eq!(
            errors,
            vec!["Subtitle 1 null or negative duration".to_owned()]
        );
    }

    #[rstest]
    fn overlapping_events_beyond_two_are_flagged() {
        let overlapping = r#"<?xml version="1.0" encoding="UTF-8"?>
<DCSubtitle Version="1.0">
  <SubtitleID>a8b9c0d1-e2f3-1a4b-8c5d-6e7f8a9b0c1d</SubtitleID>
  <LoadFont Id="f" URI="arial.ttf"/>
  <Font Id="f">
    <Subtitle SpotNumber="1" TimeIn="00:00:01:000" TimeOut="00:00:10:000"><Text>a</Text></Subtitle>
    <Subtitle SpotNumber="2" TimeIn="00:00:02:000" TimeOut="00:00:10:000"><Text>b</Text></Subtitle>
    <Subtitle SpotNumber="3" TimeIn="00:00:03:000" TimeOut="00:00:10:000"><Text>c</Text></Subtitle>
  </Font>
</DCSubtitle>
"#;
        let (_dir, path) = write_doc(overlapping);
        let doc = SubtitleDoc::parse(&path).unwrap();
        let asset = Asset {
            edit_rate: Some(24.0),
            ..Asset::default()
        };

        let errors = run_single(Schema::Interop, |c| {
            check_subtitle_cpl_simultaneous(c, &asset, Some(&doc))
        });
        assert!(errors[0].contains("Up to 3 subtitles visible"));
    }

    #[rstest]
    fn uuid_mismatch_is_flagged() {
        let (_dir, path) = write_doc(INTEROP_SUBTITLE);
        let doc = SubtitleDoc::parse(&path).unwrap();
        let asset = Asset {
            id: "ffffffff-e2f3-1a4b-8c5d-6e7f8a9b0c1d".to_owned(),
            ..Asset::default()
        };

        let errors = run_single(Schema::Interop, |c| {
            check_subtitle_cpl_uuid(c, &asset, Some(&doc), Path::new("/tmp/somewhere"))
        });
        assert!(errors
            .iter()
            .any(|m| m.contains("Subtitle UUID mismatch")));
    }

    #[rstest]
    fn language_aliases_are_accepted() {
        assert!(languages_match("fr", "fra"));
        assert!(languages_match("en-US", "eng"));
        assert!(!languages_match("fr", "eng"));
    }
}
