//! Typed in-memory model of a Digital Cinema Package: descriptors,
//! reels, assets and their cross references.

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
use std::fmt;
use std::path::PathBuf;

use crate::isdcf::NamingFields;
use crate::probe::ProbeRecord;
use crate::Schema;

/// A per-CPL aggregate folded over reels: a single agreed value, a
/// `Mixed` marker when reels disagree, or `Unknown` when no reel
/// carries the attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Agg<T> {
    #[default]
    Unknown,
    Value(T),
    Mixed,
}

impl<T: PartialEq> Agg<T> {
    /// Folds one observed value into the aggregate.
    pub fn absorb(&mut self, value: T) {
        match self {
            Self::Unknown => *self = Self::Value(value),
            Self::Value(current) if *current != value => *self = Self::Mixed,
            _ => {}
        }
    }

    /// Folds an optional observation; `None` leaves the aggregate
    /// untouched.
    pub fn absorb_opt(&mut self, value: Option<T>) {
        if let Some(value) = value {
            self.absorb(value);
        }
    }

    /// The agreed value, if the aggregate is neither mixed nor unknown.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_mixed(&self) -> bool {
        matches!(self, Self::Mixed)
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl<T: fmt::Display> fmt::Display for Agg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown"),
            Self::Mixed => f.write_str("Mixed"),
            Self::Value(v) => v.fmt(f),
        }
    }
}

impl<T: serde::Serialize> serde::Serialize for Agg<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unknown => serializer.serialize_str("Unknown"),
            Self::Mixed => serializer.serialize_str("Mixed"),
            Self::Value(v) => v.serialize(serializer),
        }
    }
}

/// The essence slots a reel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum EssenceKind {
    Picture,
    Sound,
    AuxData,
    Subtitle,
    ClosedCaption,
    OpenCaption,
    Markers,
    Metadata,
}

impl EssenceKind {
    /// Essence kinds that reference an essence file (as opposed to
    /// inline CPL structures).
    pub const FILE_BACKED: [Self; 6] = [
        Self::Picture,
        Self::Sound,
        Self::AuxData,
        Self::Subtitle,
        Self::OpenCaption,
        Self::ClosedCaption,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Picture => "Picture",
            Self::Sound => "Sound",
            Self::AuxData => "AuxData",
            Self::Subtitle => "Subtitle",
            Self::ClosedCaption => "ClosedCaption",
            Self::OpenCaption => "OpenCaption",
            Self::Markers => "Markers",
            Self::Metadata => "Metadata",
        }
    }
}

impl fmt::Display for EssenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One AssetMap entry.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AmAsset {
    pub id: String,

    /// Chunk path, relative to the package root, `file://` prefixes
    /// stripped.
    pub path: String,

    /// The entry identifies a PackingList. Interop marks this with an
    /// empty `<PackingList/>`, SMPTE with `<PackingList>true</PackingList>`.
    pub packing_list: bool,

    pub volume_index: Option<u64>,
    pub offset: Option<u64>,
    pub length: Option<u64>,
}

/// A parsed `ASSETMAP` / `ASSETMAP.xml` descriptor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AssetMap {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub schema: Schema,
    /// Root element namespace URI.
    pub xmlns: String,
    pub id: String,
    pub creator: Option<String>,
    pub issuer: Option<String>,
    pub annotation_text: Option<String>,
    pub issue_date: Option<String>,
    pub volume_count: Option<u64>,
    pub assets: Vec<AmAsset>,

    /// Sum of the declared chunk lengths.
    pub assets_size_bytes: u64,

    /// Sum of the on-disk sizes of the chunks that exist.
    pub assets_on_disk_size_bytes: u64,
}

/// A parsed `VOLINDEX` / `VOLINDEX.xml` descriptor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VolumeIndex {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub schema: Schema,
    /// Root element namespace URI.
    pub xmlns: String,
    pub index: Option<u64>,
}

/// One certificate of a `Signature` block, in document order (leaf
/// first).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct XmlCertificate {
    pub issuer_name: String,
    pub serial_number: String,
    /// Base64 DER.
    pub data: String,
}

/// The `Signer` + `Signature` block carried by signed PKL and CPL
/// documents.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SignatureBlock {
    pub signer_issuer_name: String,
    pub signer_serial_number: String,
    pub canonicalization_method: String,
    pub signature_method: String,
    pub transform: String,
    pub digest_method: String,
    pub digest_value: String,
    pub signature_value: String,
    pub certificates: Vec<XmlCertificate>,
}

/// One PackingList asset entry.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PklAsset {
    pub id: String,
    pub hash: Option<String>,
    pub size: Option<u64>,
    pub mime_type: String,
    pub annotation_text: Option<String>,

    /// Path relative to the package root, resolved through the
    /// AssetMap UUID index.
    pub path: Option<String>,
}

/// A parsed PackingList descriptor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PackingList {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub schema: Schema,
    /// Root element namespace URI.
    pub xmlns: String,
    pub id: String,
    pub annotation_text: Option<String>,
    pub issue_date: Option<String>,
    pub issuer: Option<String>,
    pub creator: Option<String>,
    pub assets: Vec<PklAsset>,
    pub assets_size_bytes: u64,
    pub signature: Option<SignatureBlock>,
}

/// A marker on the Markers track.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Marker {
    pub label: String,
    pub offset: i64,
}

/// One essence asset of a reel.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Asset {
    pub kind: Option<EssenceKind>,
    pub schema: Schema,
    pub id: String,
    pub annotation_text: Option<String>,

    pub edit_rate: Option<f64>,
    pub intrinsic_duration: Option<i64>,
    pub entry_point: Option<i64>,
    pub duration: Option<i64>,

    /// `EntryPoint + Duration`.
    pub out_point: Option<i64>,

    /// Position of the asset on the CPL timeline (prefix sum of the
    /// preceding reel durations).
    pub cpl_entry_point: Option<i64>,
    pub cpl_out_point: Option<i64>,
    pub timecode_in: Option<String>,
    pub timecode_out: Option<String>,
    pub timecode_duration: Option<String>,

    /// Presence means the essence is encrypted.
    pub key_id: Option<String>,
    pub hash: Option<String>,
    pub encrypted: bool,

    /// Relative path resolved through the AssetMap; empty when the
    /// asset lives in another package (VF).
    pub path: String,
    #[serde(skip)]
    pub absolute_path: Option<PathBuf>,

    // Picture specific.
    pub frame_rate: Option<f64>,
    pub screen_aspect_ratio: Option<f64>,
    pub stereoscopic: Option<bool>,
    pub high_frame_rate: Option<bool>,

    // Sound / timed-text specific.
    pub language: Option<String>,

    // Atmos specific, `urn:smpte:ul:` data type.
    pub data_type: Option<String>,

    pub markers: Vec<Marker>,

    pub probe: Option<ProbeRecord>,
    pub probe_error: Option<String>,
}

impl Asset {
    /// Display handle for report stacks: the relative path when
    /// resolved, the UUID otherwise.
    #[must_use]
    pub fn handle(&self) -> String {
        if self.path.is_empty() {
            self.id.clone()
        } else {
            self.path.clone()
        }
    }
}

/// A time-contiguous segment of a CPL.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Reel {
    /// 1-based.
    pub position: usize,
    pub id: String,
    pub annotation_text: Option<String>,
    pub assets: BTreeMap<EssenceKind, Asset>,
}

impl Reel {
    #[must_use]
    pub fn asset(&self, kind: EssenceKind) -> Option<&Asset> {
        self.assets.get(&kind)
    }
}

/// Aggregated characteristics of a CPL, folded over its reels.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CplAggregates {
    pub edit_rate: Agg<f64>,
    pub frame_rate: Agg<f64>,
    pub high_frame_rate: Agg<bool>,
    pub screen_aspect_ratio: Agg<f64>,
    pub stereoscopic: Agg<bool>,
    pub encrypted: Agg<bool>,
    pub resolution: Agg<String>,
    pub decomposition_levels: Agg<i64>,
    pub precincts: Agg<i64>,
    pub channel_count: Agg<i64>,
    pub channel_format: Agg<i64>,
    pub channel_configuration: Agg<String>,
    pub sound_language: Agg<String>,
    pub subtitle_language: Agg<String>,
    pub open_caption_language: Agg<String>,
    pub closed_caption_language: Agg<String>,

    pub picture: bool,
    pub sound: bool,
    pub subtitle: bool,
    pub open_caption: bool,
    pub closed_caption: bool,
    pub aux_data: bool,
    pub markers: bool,
    pub metadata: bool,
}

/// A parsed CompositionPlaylist descriptor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompositionPlaylist {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub schema: Schema,
    /// Root element namespace URI.
    pub xmlns: String,
    pub id: String,
    pub content_title: String,
    pub content_kind: Option<String>,
    pub annotation_text: Option<String>,
    pub issue_date: Option<String>,
    pub issuer: Option<String>,
    pub creator: Option<String>,

    /// Id of the PackingList referencing this CPL, back-filled after
    /// all descriptors are parsed.
    pub pkl_id: Option<String>,

    pub naming: NamingFields,
    pub naming_errors: Vec<String>,

    pub reels: Vec<Reel>,
    pub aggregates: CplAggregates,

    pub dolby_vision: bool,
    pub eclair_color: bool,
    pub dbox: bool,
    pub eidr: String,

    /// Sum of the picture durations over all reels, in frames.
    pub total_duration: i64,
    pub total_duration_timecode: String,

    pub signature: Option<SignatureBlock>,
}

impl CompositionPlaylist {
    /// Iterates `(kind, asset)` over every reel, restricted to file
    /// backed essence kinds.
    pub fn assets(&self) -> impl Iterator<Item = (EssenceKind, &Asset)> {
        self.reels.iter().flat_map(|reel| {
            reel.assets
                .iter()
                .filter(|(kind, _)| EssenceKind::FILE_BACKED.contains(kind))
                .map(|(kind, asset)| (*kind, asset))
        })
    }

    /// The reel carrying the asset with `id`, if any.
    #[must_use]
    pub fn reel_for_asset(&self, id: &str) -> Option<&Reel> {
        self.reels
            .iter()
            .find(|reel| reel.assets.values().any(|a| a.id == id))
    }
}

/// One wrapped content key of a KDM.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct KdmKey {
    /// `MDIK` (image), `MDAK` (audio), `MDSK` (subtitle) or `MDEK`
    /// (Atmos), from the public key list.
    pub key_type: Option<String>,

    /// Base64 RSA-OAEP wrapped payload.
    pub cipher: String,

    /// Populated once the cipher is unwrapped with the recipient's
    /// private key.
    pub info: Option<KdmKeyInfo>,
}

/// Fields of an unwrapped KDM key payload, fixed layout per
/// SMPTE ST 430-1 section 6.1.2.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct KdmKeyInfo {
    /// Hex, 16 bytes.
    pub structure_id: String,
    /// Base64, 20 bytes.
    pub certificate_thumbprint: String,
    pub cpl_id: String,
    pub key_type: String,
    pub key_id: String,
    pub not_valid_before: String,
    pub not_valid_after: String,
    /// Hex, 16 bytes, the AES content key.
    pub content_key: String,
}

/// A parsed Key Delivery Message.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Kdm {
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub content_title: Option<String>,
    pub cpl_id: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub recipient: Option<String>,
    pub authorized_devices: Vec<String>,
    pub image_keys: usize,
    pub audio_keys: usize,
    pub subtitle_keys: usize,
    pub atmos_keys: usize,

    /// Keyed by `KeyId`.
    pub keys: BTreeMap<String, KdmKey>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;

    #[rstest]
    fn aggregate_agreement_keeps_value() {
        let mut agg = Agg::Unknown;
        agg.absorb(24.0);
        agg.absorb(24.0);
        assert_eq!(agg, Agg::Value(24.0));
        assert_eq!(agg.to_string(), "24");
    }

    #[rstest]
    fn aggregate_disagreement_is_mixed() {
        let mut agg = Agg::Unknown;
        agg.absorb(24.0);
        agg.absorb(25.0);
        assert!(agg.is_mixed());
        assert_eq!(agg.to_string(), "Mixed");
    }

    #[rstest]
    fn aggregate_absence_is_unknown() {
        let mut agg: Agg<bool> = Agg::Unknown;
        agg.absorb_opt(None);
        assert_eq!(agg, Agg::Unknown);
        assert_eq!(agg.to_string(), "Unknown");
    }
}
