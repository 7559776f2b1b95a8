//! Self-signed certificate served until the first real issuance lands

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use time::{Duration, OffsetDateTime};

use super::error::TlsConfigError;

/// Validity of the placeholder certificate
const PLACEHOLDER_VALIDITY: Duration = Duration::days(7);

/// Generate a self-signed certificate for `names`
///
/// Returns `(certificate_pem, private_key_pem)`. Clients will not trust it;
/// it only keeps the HTTPS listener answering before a CA-issued certificate
/// exists.
pub fn self_signed(names: &[String]) -> Result<(String, String), TlsConfigError> {
    let names = if names.is_empty() {
        vec!["localhost".to_string()]
    } else {
        names.to_vec()
    };

    let mut params = CertificateParams::new(names.clone())
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("placeholder names rejected: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names[0].as_str());
    dn.push(DnType::OrganizationName, "tlsward placeholder");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    params.not_after = now + PLACEHOLDER_VALIDITY;

    let key = KeyPair::generate()
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("placeholder key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| TlsConfigError::InvalidMaterial(format!("placeholder signing failed: {}", e)))?;

    Ok((cert.pem(), key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_defaults_to_localhost() {
        let (cert, key) = self_signed(&[]).unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_placeholder_is_short_lived() {
        let (cert, _) = self_signed(&["example.test".to_string()]).unwrap();
        let not_after = crate::tls::material::leaf_not_after(&cert).unwrap();
        let days = (not_after - chrono::Utc::now()).num_days();
        assert!((6..=7).contains(&days));
    }
}
