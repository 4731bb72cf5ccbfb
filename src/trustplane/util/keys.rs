/*
 * Copyright (C) 2024 The Trustplane Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Key and certificate material generated on behalf of managed components.

use super::error::{BoxError, ResultContext};
use openssl::asn1::Asn1Time;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use rand::Rng;

const CA_VALIDITY_DAYS: u32 = 3650;
const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// PEM encoded ECDSA key pair.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private_pem: Vec<u8>,
    pub public_pem: Vec<u8>,
}

/// PEM encoded certificate authority material. The private key is encrypted
/// with the password it was generated for.
#[derive(Clone, Debug)]
pub struct CertificateAuthority {
    pub private_pem: Vec<u8>,
    pub public_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
}

/// Subject fields of a generated certificate authority.
#[derive(Clone, Debug, Default)]
pub struct CaSubject<'a> {
    pub common_name: &'a str,
    pub organization: &'a str,
    pub email: &'a str,
}

fn gen_ecc_key() -> Result<PKey<Private>, BoxError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).context("loading P-256 curve")?;
    let ec_key = EcKey::generate(&group).context("generating EC key")?;
    PKey::from_ec_key(ec_key).context("wrapping EC key")
}

pub fn generate_key_pair() -> Result<KeyPair, BoxError> {
    let key = gen_ecc_key()?;
    Ok(KeyPair {
        private_pem: key
            .private_key_to_pem_pkcs8()
            .context("encoding private key")?,
        public_pem: key.public_key_to_pem().context("encoding public key")?,
    })
}

/// Self-signed CA whose private key is encrypted with `password`.
pub fn generate_certificate_authority(
    subject: &CaSubject<'_>,
    password: &[u8],
) -> Result<CertificateAuthority, BoxError> {
    let key = gen_ecc_key()?;

    let mut name = X509Name::builder().context("building subject")?;
    if !subject.common_name.is_empty() {
        name.append_entry_by_nid(Nid::COMMONNAME, subject.common_name)
            .context("setting common name")?;
    }
    if !subject.organization.is_empty() {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, subject.organization)
            .context("setting organization")?;
    }
    if !subject.email.is_empty() {
        name.append_entry_by_nid(Nid::PKCS9_EMAILADDRESS, subject.email)
            .context("setting email")?;
    }
    let name = name.build();

    let mut builder = X509::builder().context("creating certificate builder")?;
    builder.set_version(2).context("setting version")?;
    builder.set_subject_name(&name).context("setting subject")?;
    builder.set_issuer_name(&name).context("setting issuer")?;
    builder.set_pubkey(&key).context("setting public key")?;
    let not_before = Asn1Time::days_from_now(0).context("computing notBefore")?;
    let not_after = Asn1Time::days_from_now(CA_VALIDITY_DAYS).context("computing notAfter")?;
    builder
        .set_not_before(&not_before)
        .context("setting notBefore")?;
    builder.set_not_after(&not_after).context("setting notAfter")?;
    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(None, None))
        .context("building subject key identifier")?;
    builder.append_extension(ski).context("adding SKI")?;
    builder
        .append_extension(
            BasicConstraints::new()
                .critical()
                .ca()
                .build()
                .context("building basic constraints")?,
        )
        .context("adding basic constraints")?;
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()
                .context("building key usage")?,
        )
        .context("adding key usage")?;
    builder
        .sign(&key, MessageDigest::sha256())
        .context("signing certificate")?;
    let cert = builder.build();

    Ok(CertificateAuthority {
        private_pem: key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), password)
            .context("encrypting private key")?,
        public_pem: key.public_key_to_pem().context("encoding public key")?,
        cert_pem: cert.to_pem().context("encoding certificate")?,
    })
}

/// Public half of a PEM private key, decrypted with `password` when given.
pub fn public_key_from_private(private_pem: &[u8], password: Option<&[u8]>) -> Result<Vec<u8>, BoxError> {
    let key = match password {
        Some(password) => PKey::private_key_from_pem_passphrase(private_pem, password)
            .context("decrypting private key")?,
        None => PKey::private_key_from_pem(private_pem).context("parsing private key")?,
    };
    key.public_key_to_pem().context("encoding public key")
}

pub fn random_password(length: usize) -> String {
    Alphanumeric.sample_string(&mut OsRng, length)
}

/// Suffix appended to `generateName` prefixes.
pub fn random_name_suffix(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| {
            let index = rng.gen_range(0..NAME_SUFFIX_ALPHABET.len());
            NAME_SUFFIX_ALPHABET[index] as char
        })
        .collect()
}
