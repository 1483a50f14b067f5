//! Descriptor parsers: AssetMap, VolumeIndex, PackingList,
//! CompositionPlaylist and KDM documents into the typed model.
//!
//! A descriptor that cannot be parsed fails soft: the caller logs the
//! error and drops it from the package lists. The one structural
//! exception is a reel carrying two assets of the same essence kind,
//! which aborts the whole run.

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

use std::path::Path;

use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;

use crate::model::{
    AmAsset, Asset, AssetMap, CompositionPlaylist, CplAggregates, EssenceKind, Kdm, KdmKey,
    KdmKeyInfo, Marker, PackingList, PklAsset, Reel, SignatureBlock, VolumeIndex, XmlCertificate,
};
use crate::util::{format_ratio, frames_to_timecode, uuid_from_bytes};
use crate::xml::{read_source, schema_for_namespace};
use crate::{Error, Schema};

/// The edit rate at (or above) which a picture track is tagged High
/// Frame Rate.
pub const MIN_HFR_EDITRATE: f64 = 48.0;

type Node<'a, 'i> = roxmltree::Node<'a, 'i>;

fn xml_error(path: &Path, message: impl Into<String>) -> Error {
    Error::Xml {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn strip_urn(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix("urn:uuid:")
        .unwrap_or(value)
        .to_owned()
}

fn find_child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Option<Node<'a, 'i>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn children<'a, 'i>(node: Node<'a, 'i>, name: &'a str) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    find_child(node, name).map(|c| c.text().unwrap_or("").trim().to_owned())
}

fn child_u64(node: Node<'_, '_>, name: &str) -> Option<u64> {
    child_text(node, name).and_then(|t| t.parse().ok())
}

fn child_i64(node: Node<'_, '_>, name: &str) -> Option<i64> {
    child_text(node, name).and_then(|t| t.parse().ok())
}

fn child_ratio(node: Node<'_, '_>, name: &str) -> Option<f64> {
    child_text(node, name).and_then(|t| format_ratio(&t))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(String::new, |n| n.to_string_lossy().into_owned())
}

fn parse_document<T>(
    path: &Path,
    root_name: &str,
    build: impl FnOnce(Node<'_, '_>, Schema) -> Result<T, Error>,
) -> Result<T, Error> {
    let text = read_source(path)?;
    let doc = roxmltree::Document::parse(&text)
        .map_err(|e| xml_error(path, e.to_string()))?;
    let root = doc.root_element();

    if root.tag_name().name() != root_name {
        return Err(xml_error(
            path,
            format!("expected {root_name} root, got {}", root.tag_name().name()),
        ));
    }

    let schema = schema_for_namespace(root.tag_name().namespace().unwrap_or(""));
    build(root, schema)
}

/// Parses an `ASSETMAP` / `ASSETMAP.xml` descriptor.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read or is not a well-formed
/// AssetMap document.
pub fn parse_assetmap(path: &Path, dcp_root: &Path) -> Result<AssetMap, Error> {
    parse_document(path, "AssetMap", |root, schema| {
        let mut assets = Vec::new();
        let mut declared_size = 0_u64;
        let mut on_disk_size = 0_u64;

        if let Some(asset_list) = find_child(root, "AssetList") {
            for asset_node in children(asset_list, "Asset") {
                let chunk = find_child(asset_node, "ChunkList")
                    .and_then(|cl| find_child(cl, "Chunk"));

                let mut asset = AmAsset {
                    id: strip_urn(&child_text(asset_node, "Id").unwrap_or_default()),
                    packing_list: find_child(asset_node, "PackingList").is_some(),
                    ..AmAsset::default()
                };

                if let Some(chunk) = chunk {
                    let raw_path = child_text(chunk, "Path").unwrap_or_default();
                    asset.path = raw_path
                        .trim_start_matches("file:///")
                        .trim_start_matches("file://")
                        .to_owned();
                    asset.volume_index = child_u64(chunk, "VolumeIndex");
                    asset.offset = child_u64(chunk, "Offset");
                    asset.length = child_u64(chunk, "Length");
                }

                declared_size += asset.length.unwrap_or(0);
                if let Ok(meta) = dcp_root.join(&asset.path).metadata() {
                    on_disk_size += meta.len();
                }

                assets.push(asset);
            }
        }

        Ok(AssetMap {
            file_name: file_name(path),
            path: path.to_path_buf(),
            schema,
            xmlns: root.tag_name().namespace().unwrap_or("").to_owned(),
            id: strip_urn(&child_text(root, "Id").unwrap_or_default()),
            creator: child_text(root, "Creator"),
            issuer: child_text(root, "Issuer"),
            annotation_text: child_text(root, "AnnotationText"),
            issue_date: child_text(root, "IssueDate"),
            volume_count: child_u64(root, "VolumeCount"),
            assets,
            assets_size_bytes: declared_size,
            assets_on_disk_size_bytes: on_disk_size,
        })
    })
}

/// Parses a `VOLINDEX` / `VOLINDEX.xml` descriptor.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read or is not a well-formed
/// VolumeIndex document.
pub fn parse_volindex(path: &Path) -> Result<VolumeIndex, Error> {
    parse_document(path, "VolumeIndex", |root, schema| {
        Ok(VolumeIndex {
            file_name: file_name(path),
            path: path.to_path_buf(),
            schema,
            xmlns: root.tag_name().namespace().unwrap_or("").to_owned(),
            index: child_u64(root, "Index"),
        })
    })
}

fn parse_signature(root: Node<'_, '_>) -> Option<SignatureBlock> {
    let signer = find_child(root, "Signer")?;
    let signature = find_child(root, "Signature")?;

    let issuer_serial = |x509_data: Node<'_, '_>| {
        let serial = find_child(x509_data, "X509IssuerSerial");
        (
            serial
                .and_then(|s| child_text(s, "X509IssuerName"))
                .unwrap_or_default(),
            serial
                .and_then(|s| child_text(s, "X509SerialNumber"))
                .unwrap_or_default(),
        )
    };

    let (signer_issuer_name, signer_serial_number) =
        find_child(signer, "X509Data").map(issuer_serial)?;

    let signed_info = find_child(signature, "SignedInfo");
    let reference = signed_info.and_then(|si| find_child(si, "Reference"));

    let attr_of = |node: Option<Node<'_, '_>>, name: &str| {
        node.and_then(|n| find_child(n, name))
            .and_then(|n| n.attribute("Algorithm"))
            .unwrap_or("")
            .to_owned()
    };

    let mut certificates = Vec::new();
    if let Some(key_info) = find_child(signature, "KeyInfo") {
        for x509_data in children(key_info, "X509Data") {
            let (issuer_name, serial_number) = issuer_serial(x509_data);
            certificates.push(XmlCertificate {
                issuer_name,
                serial_number,
                data: child_text(x509_data, "X509Certificate")
                    .unwrap_or_default()
                    .split_whitespace()
                    .collect(),
            });
        }
    }

    Some(SignatureBlock {
        signer_issuer_name,
        signer_serial_number,
        canonicalization_method: attr_of(signed_info, "CanonicalizationMethod"),
        signature_method: attr_of(signed_info, "SignatureMethod"),
        transform: attr_of(
            reference.and_then(|r| find_child(r, "Transforms")),
            "Transform",
        ),
        digest_method: attr_of(reference, "DigestMethod"),
        digest_value: reference
            .and_then(|r| child_text(r, "DigestValue"))
            .unwrap_or_default(),
        signature_value: find_child(signature, "SignatureValue")
            .and_then(|n| n.text())
            .map(|t| t.split_whitespace().collect::<String>())
            .unwrap_or_default(),
        certificates,
    })
}

/// Parses a PackingList descriptor.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read or is not a well-formed
/// PackingList document.
pub fn parse_pkl(path: &Path) -> Result<PackingList, Error> {
    parse_document(path, "PackingList", |root, schema| {
        let mut assets = Vec::new();
        let mut total_size = 0_u64;

        if let Some(asset_list) = find_child(root, "AssetList") {
            for asset_node in children(asset_list, "Asset") {
                let asset = PklAsset {
                    id: strip_urn(&child_text(asset_node, "Id").unwrap_or_default()),
                    hash: child_text(asset_node, "Hash"),
                    size: child_u64(asset_node, "Size"),
                    mime_type: child_text(asset_node, "Type").unwrap_or_default(),
                    annotation_text: child_text(asset_node, "AnnotationText"),
                    path: None,
                };
                total_size += asset.size.unwrap_or(0);
                assets.push(asset);
            }
        }

        Ok(PackingList {
            file_name: file_name(path),
            path: path.to_path_buf(),
            schema,
            xmlns: root.tag_name().namespace().unwrap_or("").to_owned(),
            id: strip_urn(&child_text(root, "Id").unwrap_or_default()),
            annotation_text: child_text(root, "AnnotationText"),
            issue_date: child_text(root, "IssueDate"),
            issuer: child_text(root, "Issuer"),
            creator: child_text(root, "Creator"),
            assets,
            assets_size_bytes: total_size,
            signature: parse_signature(root),
        })
    })
}

/// CPL `AssetList` element names mapped to essence kinds.
const ASSET_MAPPING: &[(&str, EssenceKind)] = &[
    ("MainPicture", EssenceKind::Picture),
    ("MainStereoscopicPicture", EssenceKind::Picture),
    ("MainSound", EssenceKind::Sound),
    ("AuxData", EssenceKind::AuxData),
    ("MainSubtitle", EssenceKind::Subtitle),
    ("MainMarkers", EssenceKind::Markers),
    ("CompositionMetadataAsset", EssenceKind::Metadata),
    ("MainCaption", EssenceKind::OpenCaption),
    ("ClosedCaption", EssenceKind::ClosedCaption),
    ("MainClosedCaption", EssenceKind::ClosedCaption),
];

/// Parses a CompositionPlaylist descriptor.
///
/// # Errors
///
/// Returns [`Error::Xml`] on malformed documents, and [`Error::Probe`]
/// when a reel carries two assets of the same essence kind, which
/// aborts the whole run.
pub fn parse_cpl(path: &Path) -> Result<CompositionPlaylist, Error> {
    parse_document(path, "CompositionPlaylist", |root, schema| {
        let content_title = child_text(root, "ContentTitleText").unwrap_or_default();
        let (naming, naming_errors) = crate::isdcf::parse_isdcf(&content_title);

        let mut cpl = CompositionPlaylist {
            file_name: file_name(path),
            path: path.to_path_buf(),
            schema,
            xmlns: root.tag_name().namespace().unwrap_or("").to_owned(),
            id: strip_urn(&child_text(root, "Id").unwrap_or_default()),
            content_title,
            content_kind: child_text(root, "ContentKind"),
            annotation_text: child_text(root, "AnnotationText"),
            issue_date: child_text(root, "IssueDate"),
            issuer: child_text(root, "Issuer"),
            creator: child_text(root, "Creator"),
            pkl_id: None,
            naming,
            naming_errors,
            reels: Vec::new(),
            aggregates: CplAggregates::default(),
            dolby_vision: false,
            eclair_color: false,
            dbox: false,
            eidr: String::new(),
            total_duration: 0,
            total_duration_timecode: "00:00:00:00".to_owned(),
            signature: parse_signature(root),
        };

        let mut global_editrate = 0.0_f64;
        let mut timeline_position = 0_i64;

        if let Some(reel_list) = find_child(root, "ReelList") {
            for (index, reel_node) in children(reel_list, "Reel").enumerate() {
                let Some(asset_list) = find_child(reel_node, "AssetList") else {
                    continue;
                };

                let mut reel = Reel {
                    position: index + 1,
                    id: strip_urn(&child_text(reel_node, "Id").unwrap_or_default()),
                    annotation_text: child_text(reel_node, "AnnotationText"),
                    ..Reel::default()
                };

                for (element, kind) in ASSET_MAPPING {
                    for asset_node in children(asset_list, element) {
                        if reel.assets.contains_key(kind) {
                            return Err(Error::Probe(format!(
                                "Duplicated {element} asset in CPL {}, Reel {}",
                                cpl.content_title, reel.position
                            )));
                        }

                        let mut asset = parse_cpl_asset(asset_node, *kind, timeline_position);
                        if *kind == EssenceKind::Picture {
                            asset.stereoscopic = Some(*element == "MainStereoscopicPicture");
                            let edit_rate = asset.edit_rate.unwrap_or(0.0);
                            asset.high_frame_rate = Some(edit_rate >= MIN_HFR_EDITRATE);
                            global_editrate = edit_rate;
                        }
                        if *kind == EssenceKind::Metadata {
                            scan_extension_metadata(asset_node, &mut cpl);
                        }
                        reel.assets.insert(*kind, asset);
                    }
                }

                if let Some(picture) = reel.assets.get(&EssenceKind::Picture) {
                    timeline_position += picture.duration.unwrap_or(0);
                }

                cpl.reels.push(reel);
            }
        }

        cpl.total_duration = timeline_position;
        cpl.total_duration_timecode = frames_to_timecode(timeline_position, global_editrate);
        extract_aggregates(&mut cpl);

        Ok(cpl)
    })
}

fn parse_cpl_asset(node: Node<'_, '_>, kind: EssenceKind, position: i64) -> Asset {
    let mut asset = Asset {
        kind: Some(kind),
        schema: schema_for_namespace(node.tag_name().namespace().unwrap_or("")),
        id: strip_urn(&child_text(node, "Id").unwrap_or_default()),
        annotation_text: child_text(node, "AnnotationText"),
        edit_rate: child_ratio(node, "EditRate"),
        intrinsic_duration: child_i64(node, "IntrinsicDuration"),
        entry_point: child_i64(node, "EntryPoint"),
        duration: child_i64(node, "Duration"),
        key_id: child_text(node, "KeyId").map(|k| strip_urn(&k)),
        hash: child_text(node, "Hash"),
        language: child_text(node, "Language"),
        data_type: child_text(node, "DataType"),
        frame_rate: child_ratio(node, "FrameRate"),
        screen_aspect_ratio: child_ratio(node, "ScreenAspectRatio"),
        ..Asset::default()
    };
    asset.encrypted = asset.key_id.is_some();

    // Cut geometry: OutPoint on the track, entry/out on the CPL
    // timeline, plus timecode renditions.
    if let (Some(edit_rate), Some(entry), Some(duration)) =
        (asset.edit_rate, asset.entry_point, asset.duration)
    {
        asset.out_point = Some(entry + duration);
        asset.cpl_entry_point = Some(position);
        asset.cpl_out_point = Some(position + duration);
        asset.timecode_in = Some(frames_to_timecode(position, edit_rate));
        asset.timecode_out = Some(frames_to_timecode(position + duration, edit_rate));
        asset.timecode_duration = Some(frames_to_timecode(duration, edit_rate));
    }

    if kind == EssenceKind::Markers {
        if let Some(list) = find_child(node, "MarkerList") {
            for marker in children(list, "Marker") {
                asset.markers.push(Marker {
                    label: child_text(marker, "Label").unwrap_or_default(),
                    offset: child_i64(marker, "Offset").unwrap_or(0),
                });
            }
        }
    }

    asset
}

fn scan_extension_metadata(node: Node<'_, '_>, cpl: &mut CompositionPlaylist) {
    let Some(ext_list) = find_child(node, "ExtensionMetadataList") else {
        return;
    };

    for ext in children(ext_list, "ExtensionMetadata") {
        match child_text(ext, "Name").unwrap_or_default().as_str() {
            "Dolby EDR" => cpl.dolby_vision = true,
            "Eclair Color" => cpl.eclair_color = true,
            "D-BOX Enabled" => cpl.dbox = true,
            "EIDR" => {
                for prop_list in children(ext, "PropertyList") {
                    for prop in children(prop_list, "Property") {
                        if child_text(prop, "Name").as_deref() == Some("structural-type") {
                            cpl.eidr = child_text(prop, "Value")
                                .unwrap_or_default()
                                .replace("urn:eidr:10.5240:", "")
                                .trim()
                                .to_owned();
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// Recomputes the per-CPL aggregates by folding over the reels. Called
/// after parsing, and again once probe records are attached.
pub fn extract_aggregates(cpl: &mut CompositionPlaylist) {
    let mut agg = CplAggregates::default();

    for reel in &cpl.reels {
        if let Some(picture) = reel.asset(EssenceKind::Picture) {
            agg.edit_rate.absorb_opt(picture.edit_rate);
            agg.frame_rate.absorb_opt(picture.frame_rate);
            agg.high_frame_rate.absorb_opt(picture.high_frame_rate);
            agg.screen_aspect_ratio
                .absorb_opt(picture.screen_aspect_ratio);
            agg.stereoscopic.absorb_opt(picture.stereoscopic);
            agg.encrypted.absorb(picture.encrypted);
            if let Some(probe) = &picture.probe {
                agg.decomposition_levels
                    .absorb_opt(probe.decomposition_levels);
                agg.precincts.absorb_opt(probe.precincts);
                agg.resolution.absorb_opt(probe.resolution.clone());
            }
        }

        if let Some(sound) = reel.asset(EssenceKind::Sound) {
            agg.edit_rate.absorb_opt(sound.edit_rate);
            agg.encrypted.absorb(sound.encrypted);
            agg.sound_language.absorb_opt(sound.language.clone());
            if let Some(probe) = &sound.probe {
                agg.channel_count.absorb_opt(probe.channel_count);
                agg.channel_format.absorb_opt(probe.channel_format);
                agg.channel_configuration
                    .absorb_opt(probe.channel_configuration.clone());
            }
        }

        if let Some(aux) = reel.asset(EssenceKind::AuxData) {
            agg.edit_rate.absorb_opt(aux.edit_rate);
            agg.encrypted.absorb(aux.encrypted);
        }

        if let Some(subtitle) = reel.asset(EssenceKind::Subtitle) {
            agg.edit_rate.absorb_opt(subtitle.edit_rate);
            agg.subtitle_language.absorb_opt(subtitle.language.clone());
        }
        if let Some(caption) = reel.asset(EssenceKind::OpenCaption) {
            agg.open_caption_language.absorb_opt(caption.language.clone());
        }
        if let Some(caption) = reel.asset(EssenceKind::ClosedCaption) {
            agg.closed_caption_language
                .absorb_opt(caption.language.clone());
        }

        agg.picture |= reel.assets.contains_key(&EssenceKind::Picture);
        agg.sound |= reel.assets.contains_key(&EssenceKind::Sound);
        agg.subtitle |= reel.assets.contains_key(&EssenceKind::Subtitle);
        agg.open_caption |= reel.assets.contains_key(&EssenceKind::OpenCaption);
        agg.closed_caption |= reel.assets.contains_key(&EssenceKind::ClosedCaption);
        agg.aux_data |= reel.assets.contains_key(&EssenceKind::AuxData);
        agg.markers |= reel.assets.contains_key(&EssenceKind::Markers);
        agg.metadata |= reel.assets.contains_key(&EssenceKind::Metadata);
    }

    cpl.aggregates = agg;
}

/// Parses a Key Delivery Message.
///
/// # Errors
///
/// Returns `Err` when the file cannot be read or is not a well-formed
/// `DCinemaSecurityMessage` document.
pub fn parse_kdm(path: &Path) -> Result<Kdm, Error> {
    parse_document(path, "DCinemaSecurityMessage", |root, _schema| {
        let auth_pub = find_child(root, "AuthenticatedPublic")
            .ok_or_else(|| xml_error(path, "missing AuthenticatedPublic"))?;
        let req_ext = find_child(auth_pub, "RequiredExtensions")
            .ok_or_else(|| xml_error(path, "missing RequiredExtensions"))?;
        let kdm_ext = find_child(req_ext, "KDMRequiredExtensions").unwrap_or(req_ext);

        let mut kdm = Kdm {
            file_name: file_name(path),
            path: path.to_path_buf(),
            content_title: child_text(kdm_ext, "ContentTitleText"),
            cpl_id: strip_urn(
                &child_text(kdm_ext, "CompositionPlaylistId").unwrap_or_default(),
            ),
            start_date: child_text(kdm_ext, "ContentKeysNotValidBefore"),
            end_date: child_text(kdm_ext, "ContentKeysNotValidAfter"),
            recipient: find_child(kdm_ext, "Recipient")
                .and_then(|r| child_text(r, "X509SubjectName"))
                .and_then(|name| name.split(',').nth(1).map(str::to_owned)),
            ..Kdm::default()
        };

        if let Some(devices) = find_child(kdm_ext, "AuthorizedDeviceInfo")
            .and_then(|info| find_child(info, "DeviceList"))
        {
            kdm.authorized_devices = children(devices, "CertificateThumbprint")
                .map(|n| n.text().unwrap_or("").trim().to_owned())
                .collect();
        }

        let ciphers: Vec<String> = find_child(root, "AuthenticatedPrivate")
            .map(|private| {
                children(private, "EncryptedKey")
                    .filter_map(|key| {
                        find_child(key, "CipherData")
                            .and_then(|data| child_text(data, "CipherValue"))
                            .map(|v| v.split_whitespace().collect())
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(key_list) = find_child(kdm_ext, "KeyIdList") {
            for (index, typed_key) in children(key_list, "TypedKeyId").enumerate() {
                let key_id =
                    strip_urn(&child_text(typed_key, "KeyId").unwrap_or_default());
                let key_type = child_text(typed_key, "KeyType");

                match key_type.as_deref() {
                    Some("MDIK") => kdm.image_keys += 1,
                    Some("MDAK") => kdm.audio_keys += 1,
                    Some("MDSK") => kdm.subtitle_keys += 1,
                    Some("MDEK") => kdm.atmos_keys += 1,
                    _ => {}
                }

                kdm.keys.insert(
                    key_id,
                    KdmKey {
                        key_type,
                        cipher: ciphers.get(index).cloned().unwrap_or_default(),
                        info: None,
                    },
                );
            }
        }

        Ok(kdm)
    })
}

/// Unwraps every KDM key cipher with the recipient's RSA private key
/// (PEM, PKCS#8 or PKCS#1) and extracts the plaintext fields.
///
/// # Errors
///
/// Returns `Err` when the key file cannot be read or parsed; a cipher
/// that fails to decrypt only skips that key.
pub fn decrypt_kdm_keys(kdm: &mut Kdm, pkey_path: &Path) -> Result<(), Error> {
    let pem = std::fs::read_to_string(pkey_path).map_err(|e| Error::io(pkey_path, e))?;
    let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| Error::Crypto(format!("cannot load private key: {e}")))?;

    for (key_id, key) in &mut kdm.keys {
        let Ok(cipher) = base64::engine::general_purpose::STANDARD.decode(&key.cipher) else {
            log::warn!("KDM key {key_id}: cipher is not valid base64");
            continue;
        };

        match private_key.decrypt(Oaep::new::<Sha1>(), &cipher) {
            Ok(plain) => match extract_key_info(&plain) {
                Ok(info) => key.info = Some(info),
                Err(e) => log::warn!("KDM key {key_id}: {e}"),
            },
            Err(e) => log::warn!("KDM key {key_id}: decryption failed: {e}"),
        }
    }

    Ok(())
}

/// Splits an unwrapped KDM key payload into its fields, fixed layout
/// per SMPTE ST 430-1 section 6.1.2.
///
/// # Errors
///
/// Returns `Err` when the payload is shorter than the 138 byte layout.
pub fn extract_key_info(data: &[u8]) -> Result<KdmKeyInfo, Error> {
    if data.len() < 138 {
        return Err(Error::Crypto(format!(
            "key payload too short: {} bytes, expected at least 138",
            data.len()
        )));
    }

    let uuid_at = |range: std::ops::Range<usize>| {
        let mut bytes = [0_u8; 16];
        bytes.copy_from_slice(&data[range]);
        uuid_from_bytes(&bytes)
    };

    Ok(KdmKeyInfo {
        structure_id: hex::encode(&data[0..16]),
        certificate_thumbprint: base64::engine::general_purpose::STANDARD.encode(&data[16..36]),
        cpl_id: uuid_at(36..52),
        key_type: String::from_utf8_lossy(&data[52..56]).into_owned(),
        key_id: uuid_at(56..72),
        not_valid_before: String::from_utf8_lossy(&data[72..97]).into_owned(),
        not_valid_after: String::from_utf8_lossy(&data[97..122]).into_owned(),
        content_key: hex::encode(&data[122..138]),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;
    use crate::model::Agg;

    fn write_temp(name: &str, content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    const ASSETMAP: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<AssetMap xmlns="http://www.smpte-ra.org/schemas/429-9/2007/AM">
  <Id>urn:uuid:11111111-2222-1333-8444-555555555555</Id>
  <Creator>maker v1.0</Creator>
  <VolumeCount>1</VolumeCount>
  <IssueDate>2024-01-25T10:00:00+00:00</IssueDate>
  <Issuer>studio</Issuer>
  <AssetList>
    <Asset>
      <Id>urn:uuid:aaaaaaaa-bbbb-1ccc-8ddd-eeeeeeeeeeee</Id>
      <PackingList>true</PackingList>
      <ChunkList>
        <Chunk>
          <Path>pkl.xml</Path>
          <VolumeIndex>1</VolumeIndex>
          <Offset>0</Offset>
          <Length>1024</Length>
        </Chunk>
      </ChunkList>
    </Asset>
    <Asset>
      <Id>urn:uuid:bbbbbbbb-cccc-1ddd-8eee-ffffffffffff</Id>
      <ChunkList>
        <Chunk>
          <Path>file:///picture.mxf</Path>
          <Length>2048</Length>
        </Chunk>
      </ChunkList>
    </Asset>
  </AssetList>
</AssetMap>
"#;

    #[rstest]
    fn assetmap_parsing() {
        let (dir, path) = write_temp("ASSETMAP.xml", ASSETMAP);
        let am = parse_assetmap(&path, dir.path()).unwrap();

        assert_eq!(am.schema, Schema::Smpte);
        assert_eq!(am.id, "11111111-2222-1333-8444-555555555555");
        assert_eq!(am.creator.as_deref(), Some("maker v1.0"));
        assert_eq!(am.volume_count, Some(1));
        assert_eq!(am.assets.len(), 2);
        assert!(am.assets[0].packing_list);
        assert_eq!(am.assets[0].path, "pkl.xml");
        assert_eq!(am.assets[1].path, "picture.mxf");
        assert!(!am.assets[1].packing_list);
        assert_eq!(am.assets_size_bytes, 3072);
    }

    const PKL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<PackingList xmlns="http://www.smpte-ra.org/schemas/429-8/2007/PKL">
  <Id>urn:uuid:99999999-8888-1777-8666-555555555555</Id>
  <AnnotationText>MovieName_FTR</AnnotationText>
  <IssueDate>2024-01-25T10:00:00+00:00</IssueDate>
  <Issuer>studio</Issuer>
  <Creator>maker v1.0</Creator>
  <AssetList>
    <Asset>
      <Id>urn:uuid:bbbbbbbb-cccc-1ddd-8eee-ffffffffffff</Id>
      <Hash>2jmj7l5rSw0yVb/vlWAYkK/YBwk=</Hash>
      <Size>2048</Size>
      <Type>application/mxf</Type>
    </Asset>
  </AssetList>
</PackingList>
"#;

    #[rstest]
    fn pkl_parsing() {
        let (_dir, path) = write_temp("pkl.xml", PKL);
        let pkl = parse_pkl(&path).unwrap();

        assert_eq!(pkl.schema, Schema::Smpte);
        assert_eq!(pkl.id, "99999999-8888-1777-8666-555555555555");
        assert_eq!(pkl.annotation_text.as_deref(), Some("MovieName_FTR"));
        assert_eq!(pkl.assets.len(), 1);
        assert_eq!(
            pkl.assets[0].hash.as_deref(),
            Some("2jmj7l5rSw0yVb/vlWAYkK/YBwk=")
        );
        assert_eq!(pkl.assets_size_bytes, 2048);
        assert!(pkl.signature.is_none());
    }

    fn cpl_with_reels(reels: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<CompositionPlaylist xmlns="http://www.smpte-ra.org/schemas/429-7/2006/CPL">
  <Id>urn:uuid:77777777-6666-1555-8444-333333333333</Id>
  <ContentTitleText>Foo_FTR_F_EN-XX_US-R_51_2K_DI_20240125_ECL_SMPTE_OV</ContentTitleText>
  <AnnotationText>Foo_FTR_F_EN-XX_US-R_51_2K_DI_20240125_ECL_SMPTE_OV</AnnotationText>
  <IssueDate>2024-01-25T10:00:00+00:00</IssueDate>
  <ReelList>{reels}</ReelList>
</CompositionPlaylist>
"#
        )
    }

    fn reel(id: u32, duration: i64, edit_rate: &str) -> String {
        format!(
            r#"<Reel>
  <Id>urn:uuid:00000000-0000-1000-8000-{id:012}</Id>
  <AssetList>
    <MainPicture>
      <Id>urn:uuid:10000000-0000-1000-8000-{id:012}</Id>
      <EditRate>{edit_rate}</EditRate>
      <FrameRate>{edit_rate}</FrameRate>
      <ScreenAspectRatio>1998 1080</ScreenAspectRatio>
      <IntrinsicDuration>{duration}</IntrinsicDuration>
      <EntryPoint>0</EntryPoint>
      <Duration>{duration}</Duration>
    </MainPicture>
    <MainSound>
      <Id>urn:uuid:20000000-0000-1000-8000-{id:012}</Id>
      <EditRate>{edit_rate}</EditRate>
      <IntrinsicDuration>{duration}</IntrinsicDuration>
      <EntryPoint>0</EntryPoint>
      <Duration>{duration}</Duration>
    </MainSound>
  </AssetList>
</Reel>"#
        )
    }

    #[rstest]
    fn cpl_cut_arithmetic_and_aggregates() {
        let xml = cpl_with_reels(&format!(
            "{}{}",
            reel(1, 240, "24 1"),
            reel(2, 480, "24 1")
        ));
        let (_dir, path) = write_temp("cpl.xml", &xml);
        let cpl = parse_cpl(&path).unwrap();

        assert_eq!(cpl.reels.len(), 2);
        assert_eq!(cpl.total_duration, 720);
        assert_eq!(cpl.total_duration_timecode, "00:00:30:00");

        let second_picture = cpl.reels[1].asset(EssenceKind::Picture).unwrap();
        assert_eq!(second_picture.cpl_entry_point, Some(240));
        assert_eq!(second_picture.cpl_out_point, Some(720));
        assert_eq!(second_picture.out_point, Some(480));
        assert_eq!(second_picture.stereoscopic, Some(false));
        assert_eq!(second_picture.high_frame_rate, Some(false));

        assert_eq!(cpl.aggregates.edit_rate, Agg::Value(24.0));
        assert_eq!(cpl.aggregates.stereoscopic, Agg::Value(false));
        assert_eq!(cpl.aggregates.encrypted, Agg::Value(false));
        assert!(cpl.aggregates.picture);
        assert!(cpl.aggregates.sound);
        assert!(!cpl.aggregates.subtitle);
    }

    #[rstest]
    fn cpl_mixed_edit_rate_is_detected() {
        let xml = cpl_with_reels(&format!(
            "{}{}",
            reel(1, 240, "24 1"),
            reel(2, 500, "25 1")
        ));
        let (_dir, path) = write_temp("cpl.xml", &xml);
        let cpl = parse_cpl(&path).unwrap();

        assert!(cpl.aggregates.edit_rate.is_mixed());
        assert!(cpl.aggregates.frame_rate.is_mixed());
    }

    #[rstest]
    fn cpl_duplicated_essence_kind_is_fatal() {
        let duplicated = r#"<Reel>
  <AssetList>
    <MainPicture><Id>urn:uuid:10000000-0000-1000-8000-000000000001</Id></MainPicture>
    <MainPicture><Id>urn:uuid:10000000-0000-1000-8000-000000000002</Id></MainPicture>
  </AssetList>
</Reel>"#;
        let (_dir, path) = write_temp("cpl.xml", &cpl_with_reels(duplicated));

        assert!(matches!(parse_cpl(&path), Err(Error::Probe(_))));
    }

    #[rstest]
    fn key_info_layout() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0xf1; 16]); // StructureID
        payload.extend_from_slice(&[0xab; 20]); // CertThumbprint
        payload.extend_from_slice(&[0x11; 16]); // CPL UUID
        payload.extend_from_slice(b"MDIK");
        payload.extend_from_slice(&[0x22; 16]); // KeyId
        payload.extend_from_slice(b"2024-01-25T00:00:00+00:00");
        payload.extend_from_slice(b"2024-02-25T00:00:00+00:00");
        payload.extend_from_slice(&[0x33; 16]); // ContentKey

        let info = extract_key_info(&payload).unwrap();
        assert_eq!(info.structure_id, "f1".repeat(16));
        assert_eq!(info.key_type, "MDIK");
        assert_eq!(info.cpl_id, "11111111-1111-1111-1111-111111111111");
        assert_eq!(info.not_valid_before, "2024-01-25T00:00:00+00:00");
        assert_eq!(info.content_key, "33".repeat(16));

        assert!(extract_key_info(&payload[..100]).is_err());
    }
}
