//! Pure option building for the rumqttc client
//!
//! This module contains pure functions turning a broker URL and
//! [`ConnectOptions`] into rumqttc options. Links speak MQTT 3.1.1 in both
//! compat and normal mode; rumqttc has no MQTT 3.1 (MQIsdp) support.

use crate::message::Qos;
use crate::transport::{ConnectOptions, TransportError};
use rumqttc::tokio_rustls::rustls;
use rumqttc::{LastWill, MqttOptions, QoS, TlsConfiguration, Transport as RumqttcTransport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use url::Url;

/// Host, port and TLS flag extracted from a broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://host:port` or `mqtts://host:port` (pure function)
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, TransportError> {
    let url =
        Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.into()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(TransportError::InvalidBrokerUrl(broker_url.into())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.into()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
        tls,
    })
}

pub fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn from_mqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

/// How the server certificate of a TLS link is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Chain checked against the native root store
    Verified,
    /// Any certificate is accepted
    Unverified,
}

/// TLS mode for an address, `None` for plain TCP (pure function)
pub fn tls_mode(address: &BrokerAddress, options: &ConnectOptions) -> Option<TlsMode> {
    match (address.tls, options.verify_server_cert) {
        (false, _) => None,
        (true, true) => Some(TlsMode::Verified),
        (true, false) => Some(TlsMode::Unverified),
    }
}

fn tls_transport(mode: TlsMode) -> RumqttcTransport {
    match mode {
        TlsMode::Verified => RumqttcTransport::tls_with_default_config(),
        TlsMode::Unverified => {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth();
            RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
        }
    }
}

/// Certificate verifier for brokers configured without server verification
#[derive(Debug)]
pub struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// MQTT 3.1.1 client options (pure function apart from loading native roots)
pub fn configure_mqtt_options(
    broker_url: &str,
    options: &ConnectOptions,
) -> Result<MqttOptions, TransportError> {
    let address = parse_broker_url(broker_url)?;
    let mode = tls_mode(&address, options);
    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), address.host, address.port);

    if let Some(mode) = mode {
        mqtt_options.set_transport(tls_transport(mode));
    }
    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);

    if let Some(will) = &options.will {
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            to_mqtt_qos(will.qos),
            will.retain,
        ));
    }

    Ok(mqtt_options)
}
