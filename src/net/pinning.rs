//! Public key pinning.
//!
//! A pin is the hex SHA-256 of a server certificate's DER
//! `SubjectPublicKeyInfo`. With pins configured, the end-entity certificate
//! must match one of them on top of the usual WebPKI chain validation.

use crate::crypto::{constant_time_eq, sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinError {
    #[error("Invalid pin {0:?}: expected 64 hex characters")]
    InvalidPin(String),
    #[error("Certificate is not valid DER")]
    MalformedCertificate,
    #[error("Server key matches no pin")]
    Mismatch,
}

#[derive(Debug, Clone, Default)]
pub struct SpkiPins {
    pins: Vec<[u8; 32]>,
}

impl SpkiPins {
    pub fn from_hex(pins: &[String]) -> Result<Self, PinError> {
        let pins = pins
            .iter()
            .map(|pin| {
                let bytes = hex::decode(pin.trim()).map_err(|_| PinError::InvalidPin(pin.clone()))?;
                <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| PinError::InvalidPin(pin.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pins })
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Checks a DER certificate against the pin set.
    pub fn check(&self, cert_der: &[u8]) -> Result<(), PinError> {
        let digest = sha256(subject_public_key_info(cert_der)?);
        if self.pins.iter().any(|pin| constant_time_eq(pin, &digest)) {
            Ok(())
        } else {
            log::warn!("Certificate pin mismatch: {}", hex::encode(digest));
            Err(PinError::Mismatch)
        }
    }
}

struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
    raw: &'a [u8],
    rest: &'a [u8],
}

fn tlv(input: &[u8]) -> Result<Tlv<'_>, PinError> {
    let (&tag, after_tag) = input.split_first().ok_or(PinError::MalformedCertificate)?;
    let (&first, after_len) = after_tag.split_first().ok_or(PinError::MalformedCertificate)?;
    let (len, body) = if first < 0x80 {
        (first as usize, after_len)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || after_len.len() < n {
            return Err(PinError::MalformedCertificate);
        }
        let len = after_len[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &after_len[n..])
    };
    if body.len() < len {
        return Err(PinError::MalformedCertificate);
    }
    let header = input.len() - body.len();
    Ok(Tlv {
        tag,
        content: &body[..len],
        raw: &input[..header + len],
        rest: &body[len..],
    })
}

fn sequence(input: &[u8]) -> Result<Tlv<'_>, PinError> {
    let t = tlv(input)?;
    if t.tag != 0x30 {
        return Err(PinError::MalformedCertificate);
    }
    Ok(t)
}

/// The DER `SubjectPublicKeyInfo` of an X.509 certificate, tag included.
pub fn subject_public_key_info(cert_der: &[u8]) -> Result<&[u8], PinError> {
    let cert = sequence(cert_der)?;
    let tbs = sequence(cert.content)?;

    let mut cursor = tbs.content;
    // [0] EXPLICIT version
    let first = tlv(cursor)?;
    if first.tag == 0xa0 {
        cursor = first.rest;
    }
    // serialNumber, signature, issuer, validity, subject
    for _ in 0..5 {
        cursor = tlv(cursor)?.rest;
    }
    Ok(sequence(cursor)?.raw)
}

#[cfg(feature = "http")]
pub use verifier::PinnedCertVerifier;

#[cfg(feature = "http")]
mod verifier {
    use std::sync::Arc;
    use std::time::SystemTime;

    use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
    use rustls::{Certificate, CertificateError, ClientConfig, Error as TlsError, OwnedTrustAnchor, RootCertStore, ServerName};

    use super::SpkiPins;

    /// WebPKI validation plus an SPKI pin check on the end-entity certificate.
    pub struct PinnedCertVerifier {
        inner: WebPkiVerifier,
        pins: SpkiPins,
    }

    impl PinnedCertVerifier {
        pub fn new(pins: SpkiPins) -> Self {
            let mut roots = RootCertStore::empty();
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
            }));
            Self { inner: WebPkiVerifier::new(roots, None), pins }
        }

        pub fn client_config(self) -> ClientConfig {
            ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(self))
                .with_no_client_auth()
        }
    }

    impl ServerCertVerifier for PinnedCertVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &Certificate,
            intermediates: &[Certificate],
            server_name: &ServerName,
            scts: &mut dyn Iterator<Item = &[u8]>,
            ocsp_response: &[u8],
            now: SystemTime,
        ) -> Result<ServerCertVerified, TlsError> {
            self.pins
                .check(&end_entity.0)
                .map_err(|_| TlsError::InvalidCertificate(CertificateError::ApplicationVerificationFailure))?;
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, scts, ocsp_response, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = include_bytes!("testdata/pinned_cert.der");
    const CERT_PIN: &str = "7d6437fa43de07a1827dd75f4e189ba7caa2e90b5689ccf1228309a33f70d9ab";
    const OTHER_PIN: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    fn pins(list: &[&str]) -> SpkiPins {
        SpkiPins::from_hex(&list.iter().map(|p| p.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_extracts_subject_public_key_info() {
        let spki = subject_public_key_info(CERT).unwrap();
        assert_eq!(spki.len(), 91);
        assert_eq!(spki[0], 0x30);
        assert_eq!(hex::encode(sha256(spki)), CERT_PIN);
    }

    #[test]
    fn test_pin_match() {
        assert_eq!(pins(&[OTHER_PIN, CERT_PIN]).check(CERT), Ok(()));
        assert_eq!(pins(&[&CERT_PIN.to_uppercase()]).check(CERT), Ok(()));
    }

    #[test]
    fn test_pin_mismatch() {
        assert_eq!(pins(&[OTHER_PIN]).check(CERT), Err(PinError::Mismatch));
        assert_eq!(pins(&[]).check(CERT), Err(PinError::Mismatch));
    }

    #[test]
    fn test_malformed_certificate() {
        assert_eq!(pins(&[CERT_PIN]).check(b"\x30\x05abc"), Err(PinError::MalformedCertificate));
        assert_eq!(pins(&[CERT_PIN]).check(&CERT[..120]), Err(PinError::MalformedCertificate));
        assert_eq!(subject_public_key_info(&[]), Err(PinError::MalformedCertificate));
    }

    #[test]
    fn test_invalid_pins_rejected() {
        assert!(matches!(SpkiPins::from_hex(&["abcd".to_string()]), Err(PinError::InvalidPin(_))));
        assert!(matches!(SpkiPins::from_hex(&["zz".repeat(32)]), Err(PinError::InvalidPin(_))));
        assert!(SpkiPins::from_hex(&[]).unwrap().is_empty());
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_verifier_checks_pin_before_chain() {
        use rustls::client::ServerCertVerifier;
        use rustls::{Certificate, CertificateError, Error as TlsError, ServerName};

        let cert = Certificate(CERT.to_vec());
        let name = ServerName::try_from("pinned.example.com").unwrap();
        let verify = |pin: &str| {
            PinnedCertVerifier::new(pins(&[pin])).verify_server_cert(
                &cert,
                &[],
                &name,
                &mut std::iter::empty(),
                &[],
                std::time::SystemTime::now(),
            )
        };

        let pin_failure = TlsError::InvalidCertificate(CertificateError::ApplicationVerificationFailure);
        assert_eq!(verify(OTHER_PIN).err(), Some(pin_failure.clone()));
        // Pin accepted; the self-signed chain is still rejected.
        let chain = verify(CERT_PIN).err();
        assert!(chain.is_some());
        assert_ne!(chain, Some(pin_failure));
    }
}
