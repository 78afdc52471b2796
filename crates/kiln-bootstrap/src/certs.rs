//! Etcd PKI.
//!
//! One self-signed CA per cluster and a single server/client certificate
//! shared by every datastore member and every control plane talking to it.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use kiln_common::{Error, Result};

/// Subject of the etcd certificate authority
pub const ETCD_CA_COMMON_NAME: &str = "etcd cluster";

/// Subject of the etcd member certificate
pub const ETCD_COMMON_NAME: &str = "etcd";

/// Validity of both certificates
const VALIDITY_DAYS: i64 = 10 * 365;

/// PEM material written to the datastore and control plane nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdCerts {
    /// CA certificate
    pub ca_cert: String,
    /// Member certificate, valid for serving and as a client
    pub etcd_cert: String,
    /// Member private key
    pub etcd_key: String,
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("kiln".to_string()),
    );
    dn
}

fn validity(params: &mut CertificateParams) {
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(VALIDITY_DAYS);
}

fn cert_error(what: &str, e: rcgen::Error) -> Error {
    Error::certificate(format!("{}: {}", what, e))
}

/// Generate the etcd CA and member certificate.
///
/// # Arguments
/// * `private_ips` - Datastore private addresses; each becomes an IP SAN next
///   to `127.0.0.1` and `localhost`
pub fn generate_etcd_certs(private_ips: &[String]) -> Result<EtcdCerts> {
    let mut sans = vec![SanType::IpAddress(IpAddr::from([127, 0, 0, 1]))];
    for ip in private_ips {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| Error::certificate(format!("invalid datastore address '{}'", ip)))?;
        sans.push(SanType::IpAddress(addr));
    }
    let localhost = Ia5String::try_from("localhost".to_string())
        .map_err(|e| cert_error("invalid DNS name", e))?;
    sans.push(SanType::DnsName(localhost));

    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = distinguished_name(ETCD_CA_COMMON_NAME);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    validity(&mut ca_params);

    let ca_key = KeyPair::generate().map_err(|e| cert_error("failed to generate CA key", e))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| cert_error("failed to create CA certificate", e))?;
    let ca_pem = ca_cert.pem();

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(ETCD_COMMON_NAME);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.subject_alt_names = sans;
    validity(&mut params);

    let key = KeyPair::generate().map_err(|e| cert_error("failed to generate etcd key", e))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_pem, &ca_key)
        .map_err(|e| cert_error("failed to load CA", e))?;
    let cert = params
        .signed_by(&key, &issuer)
        .map_err(|e| cert_error("failed to sign etcd certificate", e))?;

    Ok(EtcdCerts {
        ca_cert: ca_pem,
        etcd_cert: cert.pem(),
        etcd_key: key.serialize_pem(),
    })
}
