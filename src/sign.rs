//! X.509 helpers for the signature checks: certificate decoding,
//! distinguished-name access, extension lookup and RSA signature
//! verification.

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

use base64::Engine;
use chrono::{DateTime, Utc};
use der::asn1::{Ia5StringRef, PrintableStringRef, TeletexStringRef, Utf8StringRef};
use der::oid::ObjectIdentifier;
use der::{Decode, Encode, Tag, Tagged};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::Certificate;

pub const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
pub const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
pub const OID_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
pub const OID_DN_QUALIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.46");

pub const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub const OID_SHA1_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");

pub const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
pub const OID_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");
pub const OID_SUBJECT_KEY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.14");
pub const OID_AUTHORITY_KEY_IDENTIFIER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.5.29.35");

/// A certificate decoded from a `X509Certificate` element.
#[derive(Debug, Clone)]
pub struct DecodedCert {
    pub certificate: Certificate,
    pub der: Vec<u8>,
}

/// Decodes a base64 DER certificate.
///
/// # Errors
///
/// Returns a message when the payload is not base64 or not ASN.1 DER.
pub fn decode_certificate(data_b64: &str) -> Result<DecodedCert, String> {
    let der = base64::engine::general_purpose::STANDARD
        .decode(data_b64)
        .map_err(|e| format!("invalid base64: {e}"))?;
    let certificate =
        Certificate::from_der(&der).map_err(|e| format!("invalid DER: {e}"))?;
    Ok(DecodedCert { certificate, der })
}

fn any_to_string(value: &der::Any) -> Option<String> {
    match value.tag() {
        Tag::PrintableString => PrintableStringRef::try_from(value)
            .ok()
            .map(|s| s.to_string()),
        Tag::Utf8String => Utf8StringRef::try_from(value).ok().map(|s| s.to_string()),
        Tag::Ia5String => Ia5StringRef::try_from(value).ok().map(|s| s.to_string()),
        Tag::TeletexString => TeletexStringRef::try_from(value)
            .ok()
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// First attribute of a distinguished name matching `oid`, as a
/// string.
#[must_use]
pub fn name_attribute(name: &Name, oid: ObjectIdentifier) -> Option<String> {
    name.0.iter().find_map(|rdn| {
        rdn.0
            .iter()
            .find(|atv| atv.oid == oid)
            .and_then(|atv| any_to_string(&atv.value))
    })
}

/// ASN.1 tags of every attribute in a distinguished name, paired with
/// the attribute OID.
#[must_use]
pub fn name_attribute_tags(name: &Name) -> Vec<(ObjectIdentifier, Tag)> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .map(|atv| (atv.oid, atv.value.tag()))
        .collect()
}

/// Serial number as a decimal string (certificate serials routinely
/// exceed 64 bits).
#[must_use]
pub fn serial_decimal(certificate: &Certificate) -> String {
    bytes_to_decimal(certificate.tbs_certificate.serial_number.as_bytes())
}

fn bytes_to_decimal(bytes: &[u8]) -> String {
    let mut digits = vec![0_u8];

    for byte in bytes {
        // digits = digits * 256 + byte, little-endian base 10.
        let mut carry = u32::from(*byte);
        for digit in &mut digits {
            let value = u32::from(*digit) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    digits
        .iter()
        .rev()
        .map(|d| char::from(b'0' + d))
        .collect()
}

/// Looks up a raw extension by OID.
#[must_use]
pub fn extension<'c>(
    certificate: &'c Certificate,
    oid: ObjectIdentifier,
) -> Option<&'c Extension> {
    certificate
        .tbs_certificate
        .extensions
        .as_deref()
        .and_then(|exts| exts.iter().find(|ext| ext.extn_id == oid))
}

/// Decoded `BasicConstraints`, when present.
#[must_use]
pub fn basic_constraints(certificate: &Certificate) -> Option<BasicConstraints> {
    extension(certificate, OID_BASIC_CONSTRAINTS)
        .and_then(|ext| BasicConstraints::from_der(ext.extn_value.as_bytes()).ok())
}

/// Key usage flags, named the way validation reports spell them.
#[must_use]
pub fn key_usage_flags(certificate: &Certificate) -> Option<Vec<&'static str>> {
    let ext = extension(certificate, OID_KEY_USAGE)?;
    let usage = KeyUsage::from_der(ext.extn_value.as_bytes()).ok()?;

    let names = [
        (KeyUsages::DigitalSignature, "Digital Signature"),
        (KeyUsages::NonRepudiation, "Non Repudiation"),
        (KeyUsages::KeyEncipherment, "Key Encipherment"),
        (KeyUsages::DataEncipherment, "Data Encipherment"),
        (KeyUsages::KeyAgreement, "Key Agreement"),
        (KeyUsages::KeyCertSign, "Certificate Sign"),
        (KeyUsages::CRLSign, "CRL Sign"),
        (KeyUsages::EncipherOnly, "Encipher Only"),
        (KeyUsages::DecipherOnly, "Decipher Only"),
    ];

    Some(
        names
            .into_iter()
            .filter(|(flag, _)| usage.0.contains(*flag))
            .map(|(_, name)| name)
            .collect(),
    )
}

/// `(NotBefore, NotAfter)` as UTC datetimes.
#[must_use]
pub fn validity(certificate: &Certificate) -> (DateTime<Utc>, DateTime<Utc>) {
    let validity = &certificate.tbs_certificate.validity;
    let to_utc = |time: &x509_cert::time::Time| {
        let secs = time.to_unix_duration().as_secs() as i64;
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    };
    (to_utc(&validity.not_before), to_utc(&validity.not_after))
}

/// The RSA public key of the certificate subject.
///
/// # Errors
///
/// Returns a message when the key is not a PKCS#1 RSA key.
pub fn public_key(certificate: &Certificate) -> Result<RsaPublicKey, String> {
    let bits = certificate
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    RsaPublicKey::from_pkcs1_der(bits).map_err(|e| format!("not an RSA public key: {e}"))
}

/// The DER (PKCS#1) encoding of the subject public key, the input of
/// the dnQualifier thumbprint.
#[must_use]
pub fn public_key_der(certificate: &Certificate) -> &[u8] {
    certificate
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes()
}

/// Base64 SHA-1 thumbprint of the subject public key, the value the
/// dnQualifier attribute must carry per SMPTE 430-2.
#[must_use]
pub fn public_key_thumbprint(certificate: &Certificate) -> String {
    let digest = Sha1::digest(public_key_der(certificate));
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Verifies an RSA-PKCS#1 v1.5 signature over `data`.
///
/// # Errors
///
/// Returns a message on digest algorithm mismatch or verification
/// failure.
pub fn verify_rsa_signature(
    data: &[u8],
    signature: &[u8],
    key: &RsaPublicKey,
    algorithm: ObjectIdentifier,
) -> Result<(), String> {
    let result = if algorithm == OID_SHA256_WITH_RSA {
        key.verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(data),
            signature,
        )
    } else if algorithm == OID_SHA1_WITH_RSA {
        key.verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data), signature)
    } else {
        return Err(format!("unsupported signature algorithm {algorithm}"));
    };

    result.map_err(|e| format!("signature verification failed: {e}"))
}

/// Verifies a certificate's signature against its issuer's public
/// key.
///
/// # Errors
///
/// Returns a message when the TBS section cannot be re-encoded or the
/// signature does not verify.
pub fn verify_certificate_signature(
    certificate: &Certificate,
    issuer_key: &RsaPublicKey,
) -> Result<(), String> {
    let tbs = certificate
        .tbs_certificate
        .to_der()
        .map_err(|e| format!("cannot re-encode TBS certificate: {e}"))?;
    verify_rsa_signature(
        &tbs,
        certificate.signature.raw_bytes(),
        issuer_key,
        certificate.signature_algorithm.oid,
    )
}

/// Renders a distinguished name the way D-Cinema Signer blocks spell
/// it: `dnQualifier=…,CN=…,OU=…,O=…`.
#[must_use]
pub fn dn_string(name: &Name) -> String {
    let get = |oid| name_attribute(name, oid).unwrap_or_default();
    format!(
        "dnQualifier={},CN={},OU={},O={}",
        get(OID_DN_QUALIFIER),
        get(OID_COMMON_NAME),
        get(OID_ORGANIZATIONAL_UNIT),
        get(OID_ORGANIZATION)
    )
}

/// Compares two comma-separated `key=value` distinguished names field
/// by field, ignoring ordering.
#[must_use]
pub fn dn_match(a: &str, b: &str) -> bool {
    let fields = |dn: &str| {
        dn.split(',')
            .filter_map(|field| {
                field
                    .split_once('=')
                    .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            })
            .collect::<std::collections::BTreeMap<_, _>>()
    };
    fields(a) == fields(b)
}

/// The roles carried by a CommonName: everything before the first dot,
/// whitespace separated.
#[must_use]
pub fn common_name_roles(common_name: &str) -> Vec<String> {
    common_name
        .split('.')
        .next()
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}
