//! XML kernel: namespace tables, D-Cinema XML constraints, document
//! loading helpers and Canonical XML rendering for signature checks.

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
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Schema};

/// W3C XML-DSig namespace.
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
/// Signature method required for Interop documents.
pub const INTEROP_SIG_URI: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
/// Signature method required for SMPTE documents.
pub const SMPTE_SIG_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
/// The only allowed reference transform.
pub const ENVELOPED_SIG_URI: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
/// The only allowed canonicalization method.
pub const C14N_URI: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
/// The only allowed digest method.
pub const SHA1_URI: &str = "http://www.w3.org/2000/09/xmldsig#sha1";

/// Recognized D-Cinema namespaces, keyed by the schema identifier used
/// for XSD lookup.
pub const NAMESPACES: &[(&str, &str)] = &[
    ("xml", "http://www.w3.org/XML/1998/namespace"),
    ("xmldsig", XMLDSIG_NS),
    (
        "cpl_metadata_href",
        "http://isdcf.com/schemas/draft/2011/cpl-metadata",
    ),
    (
        "interop_pkl",
        "http://www.digicine.com/PROTO-ASDCP-PKL-20040311#",
    ),
    (
        "interop_cpl",
        "http://www.digicine.com/PROTO-ASDCP-CPL-20040511#",
    ),
    (
        "interop_am",
        "http://www.digicine.com/PROTO-ASDCP-AM-20040311#",
    ),
    (
        "interop_vl",
        "http://www.digicine.com/PROTO-ASDCP-VL-20040311#",
    ),
    (
        "interop_stereo",
        "http://www.digicine.com/schemas/437-Y/2007/Main-Stereo-Picture-CPL",
    ),
    ("interop_subtitle", "interop_subtitle"),
    (
        "smpte_pkl_2006",
        "http://www.smpte-ra.org/schemas/429-8/2006/PKL",
    ),
    (
        "smpte_pkl_2007",
        "http://www.smpte-ra.org/schemas/429-8/2007/PKL",
    ),
    ("smpte_cpl", "http://www.smpte-ra.org/schemas/429-7/2006/CPL"),
    (
        "smpte_cpl_metadata",
        "http://www.smpte-ra.org/schemas/429-16/2014/CPL-Metadata",
    ),
    (
        "smpte_am_2006",
        "http://www.smpte-ra.org/schemas/429-9/2006/AM",
    ),
    (
        "smpte_am_2007",
        "http://www.smpte-ra.org/schemas/429-9/2007/AM",
    ),
    (
        "smpte_stereo_2007",
        "http://www.smpte-ra.org/schemas/429-10/2007/Main-Stereo-Picture-CPL",
    ),
    (
        "smpte_stereo_2008",
        "http://www.smpte-ra.org/schemas/429-10/2008/Main-Stereo-Picture-CPL",
    ),
    (
        "smpte_subtitles_2007",
        "http://www.smpte-ra.org/schemas/428-7/2007/DCST",
    ),
    (
        "smpte_subtitles_2010",
        "http://www.smpte-ra.org/schemas/428-7/2010/DCST",
    ),
    (
        "smpte_subtitles_2014",
        "http://www.smpte-ra.org/schemas/428-7/2014/DCST",
    ),
    ("smpte_tt", "http://www.smpte-ra.org/schemas/429-12/2008/TT"),
    ("smpte_etm", "http://www.smpte-ra.org/schemas/430-3/2006/ETM"),
    ("smpte_kdm", "http://www.smpte-ra.org/schemas/430-1/2006/KDM"),
    ("atmos", "http://www.dolby.com/schemas/2012/AD"),
];

/// Returns the schema identifier for a namespace URI, if recognized.
#[must_use]
pub fn schema_id_for_namespace(uri: &str) -> Option<&'static str> {
    NAMESPACES
        .iter()
        .find(|(_, ns)| *ns == uri)
        .map(|(id, _)| *id)
}

/// Deduces the descriptor family from a namespace URI.
#[must_use]
pub fn schema_for_namespace(uri: &str) -> Schema {
    match schema_id_for_namespace(uri) {
        Some(id) if id.starts_with("smpte_stereo") => Schema::SmpteStereoscopic,
        Some(id) if id.starts_with("smpte") => Schema::Smpte,
        Some(id) if id.starts_with("interop") => Schema::Interop,
        Some(id) if id.starts_with("atmos") => Schema::Atmos,
        _ => Schema::Unknown,
    }
}

/// Reads a file and returns its XML source, with a BOM stripped if
/// present so `roxmltree` accepts the document.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read.
pub fn read_source(path: &Path) -> Result<String, Error> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(text.trim_start_matches('\u{feff}').to_owned())
}

/// Sniffs the root element of an XML file.
///
/// Returns `(local_name, namespace_uri)`, or `None` when the file is
/// not well-formed XML.
#[must_use]
pub fn sniff_root(path: &Path) -> Option<(String, String)> {
    let text = read_source(path).ok()?;
    let doc = roxmltree::Document::parse(&text).ok()?;
    let root = doc.root_element();
    Some((
        root.tag_name().name().to_owned(),
        root.tag_name().namespace().unwrap_or("").to_owned(),
    ))
}

/// One D-Cinema XML constraint violation: `(sub_name, message)`.
pub type ConstraintViolation = (&'static str, String);

fn xml_decl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // XMLDecl per the XML spec, restricted to version 1.0, mandatory
    // UTF-8 encoding and an optional standalone="no".
    RE.get_or_init(|| {
        let s = r"[\x20\x09\x0D\x0A]";
        let eq = format!("(?:{s}?={s}?)");
        let version = format!(r#"{s}version{eq}(?:'1\.0'|"1\.0")"#);
        let encoding = format!(r#"{s}encoding{eq}(?:"UTF\-8"|'UTF\-8')"#);
        let standalone = format!(r#"(?:{s}standalone{eq}(?:'no'|"no"))?"#);
        Regex::new(&format!(r"^<\?xml{version}{encoding}{standalone}{s}?\?>")).unwrap()
    })
}

/// Scans a descriptor for the D-Cinema XML constraints: no BOM, strict
/// `<?xml version="1.0" encoding="UTF-8"?>` declaration, Unix or DOS
/// line endings only.
#[must_use]
pub fn check_constraints(path: &Path) -> Vec<ConstraintViolation> {
    let mut violations = Vec::new();

    let Ok(raw) = fs::read_to_string(path) else {
        return violations;
    };

    let has_bom = raw.starts_with('\u{feff}');
    if has_bom {
        violations.push(("constraints_bom", "BOM not allowed in XML file".to_owned()));
    }

    let body = raw.trim_start_matches('\u{feff}');
    if !xml_decl_re().is_match(body) {
        violations.push((
            "constraints_declaration",
            "Invalid XML Declaration".to_owned(),
        ));
    }

    let lf = body.matches('\n').count();
    let crlf = body.matches("\r\n").count();
    let cr = body.matches('\r').count();
    let mixed = (crlf > 0 && crlf != lf) || (cr > 0 && cr != crlf);
    if mixed {
        violations.push((
            "constraints_line_ending",
            "XML file has invalid line endings".to_owned(),
        ));
    }

    violations
}

/// XSD validation collaborator. The real implementation lives outside
/// this crate; [`NoopValidator`] reports every document as skipped.
pub trait XsdValidator {
    /// Validates `path` against the XSD identified by `schema_id`.
    /// Returns `None` when validation was skipped, `Some(Err(_))` with
    /// a message on schema violation.
    fn validate(&self, path: &Path, schema_id: &str) -> Option<Result<(), String>>;
}

/// Default validator: XSD validation always skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl XsdValidator for NoopValidator {
    fn validate(&self, _path: &Path, _schema_id: &str) -> Option<Result<(), String>> {
        None
    }
}

/// Canonicalizes a whole document (C14N 1.0), optionally stripping the
/// enveloped `Signature` subtree. This is the byte stream the DSig
/// `DigestValue` covers.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read or parsed.
pub fn canonicalize_document(path: &Path, strip_signature: bool) -> Result<Vec<u8>, Error> {
    let text = read_source(path)?;
    let doc = roxmltree::Document::parse(&text).map_err(|e| Error::Xml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut out = String::new();
    render(doc.root_element(), &BTreeMap::new(), strip_signature, &mut out);
    Ok(out.into_bytes())
}

/// Canonicalizes the first subtree whose element local name is
/// `local_name` (typically `SignedInfo`), with all in-scope namespaces
/// declared on the apex element per C14N document-subset rules.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read or parsed, or the subtree
/// is absent.
pub fn canonicalize_subtree(path: &Path, local_name: &str) -> Result<Vec<u8>, Error> {
    let text = read_source(path)?;
    let doc = roxmltree::Document::parse(&text).map_err(|e| Error::Xml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let node = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == local_name)
        .ok_or_else(|| Error::Xml {
            path: path.to_path_buf(),
            message: format!("{local_name} element not found"),
        })?;

    let mut out = String::new();
    render(node, &BTreeMap::new(), false, &mut out);
    Ok(out.into_bytes())
}

fn render(
    node: roxmltree::Node<'_, '_>,
    rendered_ns: &BTreeMap<String, String>,
    strip_signature: bool,
    out: &mut String,
) {
    if strip_signature
        && node.tag_name().name() == "Signature"
        && node.tag_name().namespace() == Some(XMLDSIG_NS)
    {
        return;
    }

    let qname = qualified_name(node);
    let _ = write!(out, "<{qname}");

    // Namespace axis: declarations in scope here that an output
    // ancestor has not already rendered, default namespace first.
    let mut in_scope = BTreeMap::new();
    for ns in node.namespaces() {
        let prefix = ns.name().unwrap_or("");
        if prefix == "xml" {
            continue;
        }
        in_scope.insert(prefix.to_owned(), ns.uri().to_owned());
    }
    for (prefix, uri) in &in_scope {
        if rendered_ns.get(prefix) == Some(uri) {
            continue;
        }
        if prefix.is_empty() {
            let _ = write!(out, " xmlns=\"{}\"", escape_attr(uri));
        } else {
            let _ = write!(out, " xmlns:{prefix}=\"{}\"", escape_attr(uri));
        }
    }

    // Attribute axis, sorted by (namespace URI, local name), the empty
    // URI sorting first.
    let mut attrs = BTreeMap::new();
    for attr in node.attributes() {
        let key = (
            attr.namespace().unwrap_or("").to_owned(),
            attr.name().to_owned(),
        );
        attrs.insert(key, attr);
    }
    for ((ns_uri, local), attr) in &attrs {
        let name = if ns_uri.is_empty() {
            local.clone()
        } else {
            match node.lookup_prefix(ns_uri) {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
                _ => local.clone(),
            }
        };
        let _ = write!(out, " {name}=\"{}\"", escape_attr(attr.value()));
    }

    out.push('>');

    for child in node.children() {
        if child.is_element() {
            render(child, &in_scope, strip_signature, out);
        } else if child.is_text() {
            out.push_str(&escape_text(child.text().unwrap_or("")));
        }
        // Comments and processing instructions are dropped, per the
        // without-comments canonical form.
    }

    let _ = write!(out, "</{qname}>");
}

fn qualified_name(node: roxmltree::Node<'_, '_>) -> String {
    let local = node.tag_name().name();
    match node.tag_name().namespace().and_then(|ns| node.lookup_prefix(ns)) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
        _ => local.to_owned(),
    }
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '"' => escaped.push_str("&quot;"),
            '\t' => escaped.push_str("&#x9;"),
            '\n' => escaped.push_str("&#xA;"),
            '\r' => escaped.push_str("&#xD;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\r' => escaped.push_str("&#xD;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    fn write_temp(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[rstest]
    #[case("http://www.smpte-ra.org/schemas/429-7/2006/CPL", Schema::Smpte)]
    #[case(
        "http://www.digicine.com/PROTO-ASDCP-CPL-20040511#",
        Schema::Interop
    )]
    #[case(
        "http://www.smpte-ra.org/schemas/429-10/2007/Main-Stereo-Picture-CPL",
        Schema::SmpteStereoscopic
    )]
    #[case("http://www.dolby.com/schemas/2012/AD", Schema::Atmos)]
    #[case("urn:unheard-of", Schema::Unknown)]
    fn namespace_to_schema(#[case] uri: &str, #[case] schema: Schema) {
        assert_eq!(schema_for_namespace(uri), schema);
    }

    #[rstest]
    fn root_sniffing() {
        let (_dir, path) = write_temp(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <PackingList xmlns=\"http://www.smpte-ra.org/schemas/429-8/2007/PKL\"/>\n",
        );
        let (name, ns) = sniff_root(&path).unwrap();
        assert_eq!(name, "PackingList");
        assert_eq!(ns, "http://www.smpte-ra.org/schemas/429-8/2007/PKL");
    }

    #[rstest]
    fn constraints_accept_valid_declaration() {
        let (_dir, path) =
            write_temp("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<AssetMap/>\n");
        assert!(check_constraints(&path).is_empty());
    }

    #[rstest]
    fn constraints_reject_missing_encoding() {
        let (_dir, path) = write_temp("<?xml version=\"1.0\"?>\n<AssetMap/>\n");
        let violations = check_constraints(&path);
        assert!(violations
            .iter()
            .any(|(name, _)| *name == "constraints_declaration"));
    }

    #[rstest]
    fn constraints_reject_bom() {
        let (_dir, path) = write_temp(
            "\u{feff}<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<AssetMap/>\n",
        );
        let violations = check_constraints(&path);
        assert!(violations.iter().any(|(name, _)| *name == "constraints_bom"));
    }

    #[rstest]
    fn canonical_form_sorts_attributes_and_keeps_namespaces() {
        let (_dir, path) = write_temp(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Root xmlns=\"urn:a\" zeta=\"2\" alpha=\"1\"><Child>x &amp; y</Child></Root>",
        );
        let bytes = canonicalize_document(&path, false).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "<Root xmlns=\"urn:a\" alpha=\"1\" zeta=\"2\"><Child>x &amp; y</Child></Root>"
        );
    }

    #[rstest]
    fn canonical_form_strips_signature_subtree() {
        let (_dir, path) = write_temp(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Root xmlns=\"urn:a\" xmlns:dsig=\"http://www.w3.org/2000/09/xmldsig#\">\
             <Keep/><dsig:Signature><dsig:SignedInfo/></dsig:Signature></Root>",
        );
        let bytes = canonicalize_document(&path, true).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("Signature"));
        assert!(text.contains("<Keep></Keep>"));
    }

    #[rstest]
    fn canonical_subtree_declares_inherited_namespaces() {
        let (_dir, path) = write_temp(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Root xmlns:dsig=\"http://www.w3.org/2000/09/xmldsig#\">\
             <dsig:Signature><dsig:SignedInfo><dsig:Reference URI=\"\"/>\
             </dsig:SignedInfo></dsig:Signature></Root>",
        );
        let bytes = canonicalize_subtree(&path, "SignedInfo").unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(
            "<dsig:SignedInfo xmlns:dsig=\"http://www.w3.org/2000/09/xmldsig#\">"
        ));
    }
}
