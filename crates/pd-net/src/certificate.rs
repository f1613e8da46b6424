//! Reading the trust-relevant fields out of a DER certificate.

use chrono::DateTime;
use chrono::Utc;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_trust::DistinguishedName;
use pd_trust::IdentitySnapshot;
use std::collections::BTreeSet;
use x509_parser::prelude::AttributeTypeAndValue;
use x509_parser::prelude::X509Name;
use x509_parser::prelude::parse_x509_certificate;

/// Builds the snapshot compared against a domain's pin.
///
/// Missing name attributes read as empty strings.
pub fn identity_from_der(
    der: &[u8],
    ip_addresses: BTreeSet<String>,
) -> BrowserResult<IdentitySnapshot> {
    let (_, certificate) = parse_x509_certificate(der).map_err(|error| {
        BrowserError::new(
            "net.cert.parse_failed",
            format!("failed to parse server certificate: {error}"),
        )
    })?;

    let validity = certificate.validity();
    let valid_from = timestamp(validity.not_before.timestamp(), "notBefore")?;
    let valid_to = timestamp(validity.not_after.timestamp(), "notAfter")?;

    Ok(IdentitySnapshot::new(
        distinguished_name(certificate.subject()),
        distinguished_name(certificate.issuer()),
        valid_from,
        valid_to,
    )
    .with_ip_addresses(ip_addresses))
}

fn distinguished_name(name: &X509Name<'_>) -> DistinguishedName {
    DistinguishedName::new(
        first_value(name.iter_common_name()),
        first_value(name.iter_organization()),
        first_value(name.iter_organizational_unit()),
    )
}

fn first_value<'a, 'b: 'a>(
    mut values: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> String {
    values
        .next()
        .and_then(|attribute| attribute.as_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn timestamp(seconds: i64, field: &str) -> BrowserResult<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        BrowserError::new(
            "net.cert.validity_out_of_range",
            format!("certificate {field} is outside the representable range"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::identity_from_der;
    use chrono::TimeZone;
    use chrono::Utc;
    use rcgen::CertificateParams;
    use rcgen::DnType;
    use rcgen::KeyPair;
    use std::collections::BTreeSet;

    fn self_signed(configure: impl FnOnce(&mut CertificateParams)) -> Vec<u8> {
        let mut params = CertificateParams::new(vec!["example.com".to_owned()])
            .unwrap_or_else(|error| panic!("{error}"));
        configure(&mut params);
        let key = KeyPair::generate().unwrap_or_else(|error| panic!("{error}"));
        let certificate = params
            .self_signed(&key)
            .unwrap_or_else(|error| panic!("{error}"));
        certificate.der().to_vec()
    }

    #[test]
    fn reads_names_and_validity_window() {
        let der = self_signed(|params| {
            params.distinguished_name.push(DnType::CommonName, "example.com");
            params
                .distinguished_name
                .push(DnType::OrganizationName, "Example Org");
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, "Web");
            params.not_before = rcgen::date_time_ymd(2024, 1, 1);
            params.not_after = rcgen::date_time_ymd(2025, 1, 1);
        });
        let ips: BTreeSet<String> = ["192.0.2.1".to_owned()].into_iter().collect();

        let identity = identity_from_der(&der, ips.clone()).unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(identity.issued_to.common_name, "example.com");
        assert_eq!(identity.issued_to.organization, "Example Org");
        assert_eq!(identity.issued_to.organizational_unit, "Web");
        assert_eq!(identity.issued_by, identity.issued_to);
        assert_eq!(
            Some(identity.valid_from),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single()
        );
        assert_eq!(
            Some(identity.valid_to),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single()
        );
        assert_eq!(identity.ip_addresses, ips);
    }

    #[test]
    fn missing_attributes_are_empty() {
        let der = self_signed(|params| {
            params.distinguished_name.push(DnType::CommonName, "example.com");
        });

        let identity =
            identity_from_der(&der, BTreeSet::new()).unwrap_or_else(|error| panic!("{error}"));
        assert_eq!(identity.issued_to.organization, "");
        assert_eq!(identity.issued_to.organizational_unit, "");
        assert!(identity.ip_addresses.is_empty());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let parsed = identity_from_der(b"not a certificate", BTreeSet::new());
        assert_eq!(parsed.map_err(|error| error.code), Err("net.cert.parse_failed"));
    }
}
