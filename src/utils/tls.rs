//! TLS server setup.
//!
//! Clients verify either a CA-signed chain or a pinned SHA-256
//! fingerprint of the leaf certificate's SubjectPublicKeyInfo, so the
//! fingerprint is computed here once and surfaced through the admin
//! console.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use ring::digest;
use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{version, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::utils::assets;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("asset {0} could not be resolved")]
    MissingAsset(String),
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("certificate rejected: {0}")]
    BadCertificate(tokio_rustls::rustls::Error),
    #[error("certificate is not valid DER")]
    MalformedCertificate,
}

/// Server TLS identity: the acceptor plus the pinned-key fingerprint
/// displayed by `ShowIdentity`.
pub struct ServerIdentity {
    pub acceptor: TlsAcceptor,
    pub spki_fingerprint: String,
}

/// Loads the certificate chain and private key named in the config and
/// builds the acceptor. rustls only speaks TLS 1.2 and newer, which
/// covers the protocol floor by construction.
pub fn load_identity(cert_asset: &str, key_asset: &str) -> Result<ServerIdentity, TlsError> {
    let cert_path = assets::resolve(cert_asset)
        .ok_or_else(|| TlsError::MissingAsset(cert_asset.to_string()))?;
    let key_path = assets::resolve(key_asset)
        .ok_or_else(|| TlsError::MissingAsset(key_asset.to_string()))?;

    let mut cert_reader = BufReader::new(
        File::open(&cert_path).map_err(|err| TlsError::Io(cert_asset.to_string(), err))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|err| TlsError::Io(cert_asset.to_string(), err))?;

    let mut key_reader = BufReader::new(
        File::open(&key_path).map_err(|err| TlsError::Io(key_asset.to_string(), err))?,
    );
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|err| TlsError::Io(key_asset.to_string(), err))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_asset.to_string()))?;

    let leaf = certs.first().ok_or(TlsError::MalformedCertificate)?;
    let spki_fingerprint = spki_fingerprint(leaf.as_ref())?;

    let config = ServerConfig::builder_with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::BadCertificate)?;

    Ok(ServerIdentity {
        acceptor: TlsAcceptor::from(Arc::new(config)),
        spki_fingerprint,
    })
}

/// Reads one DER element, returning (tag, raw element, contents, rest).
fn der_element(input: &[u8]) -> Option<(u8, &[u8], &[u8], &[u8])> {
    let tag = *input.first()?;
    let first_len = *input.get(1)?;

    let (header_len, len) = if first_len < 0x80 {
        (2usize, first_len as usize)
    } else {
        let count = (first_len & 0x7F) as usize;
        // Lengths above u32 cannot occur in a certificate
        if count == 0 || count > 4 || input.len() < 2 + count {
            return None;
        }
        let mut len = 0usize;
        for byte in &input[2..2 + count] {
            len = (len << 8) | *byte as usize;
        }
        (2 + count, len)
    };

    let total = header_len.checked_add(len)?;
    if input.len() < total {
        return None;
    }

    Some((
        tag,
        &input[..total],
        &input[header_len..total],
        &input[total..],
    ))
}

/// Walks the certificate structure to the SubjectPublicKeyInfo element
/// and returns its SHA-256 digest in colon-separated hex.
fn spki_fingerprint(cert_der: &[u8]) -> Result<String, TlsError> {
    // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }
    let (tag, _, cert_body, _) =
        der_element(cert_der).ok_or(TlsError::MalformedCertificate)?;
    if tag != 0x30 {
        return Err(TlsError::MalformedCertificate);
    }

    let (tag, _, mut tbs, _) = der_element(cert_body).ok_or(TlsError::MalformedCertificate)?;
    if tag != 0x30 {
        return Err(TlsError::MalformedCertificate);
    }

    // tbsCertificate ::= SEQUENCE { [0] version OPTIONAL, serialNumber,
    //   signature, issuer, validity, subject, subjectPublicKeyInfo, ... }
    if tbs.first() == Some(&0xA0) {
        let (_, _, _, rest) = der_element(tbs).ok_or(TlsError::MalformedCertificate)?;
        tbs = rest;
    }

    // serialNumber through subject
    for _ in 0..5 {
        let (_, _, _, rest) = der_element(tbs).ok_or(TlsError::MalformedCertificate)?;
        tbs = rest;
    }

    let (tag, spki, _, _) = der_element(tbs).ok_or(TlsError::MalformedCertificate)?;
    if tag != 0x30 {
        return Err(TlsError::MalformedCertificate);
    }

    let hash = digest::digest(&digest::SHA256, spki);
    let hex: Vec<String> = hash
        .as_ref()
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect();

    Ok(hex.join(":"))
}
