//! Pure connection configuration for the MQTT client
//!
//! Maps a resolved [`ConnectionConfig`] onto rumqttc options. Nothing here
//! touches the network.

use crate::config::{ConnectionConfig, TlsMaterial};
use crate::transport::QualityOfService;
use rumqttc::{MqttOptions, QoS, Transport as RumqttcTransport};

/// Largest packet accepted or sent, in either direction
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Link state reported by the event-loop supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Waiting for the first CONNACK
    Connecting,
    /// CONNACK received
    Connected,
    /// Network dropped after CONNACK; retrying (attempt count)
    Reconnecting(u32),
    /// Broker answered the CONNECT with a failure code
    Refused(String),
    /// Initial connect failed before any CONNACK
    Failed(String),
    /// Connection is gone for good
    Closed(String),
}

/// Build rumqttc options from a resolved configuration
pub fn configure_mqtt_options(config: &ConnectionConfig) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        config.client_id.clone(),
        config.broker.host.clone(),
        config.broker.port,
    );

    match &config.tls {
        TlsMaterial::Disabled => {}
        TlsMaterial::PlatformRoots => {
            mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
        }
        TlsMaterial::CustomCa(ca) => {
            mqtt_options.set_transport(RumqttcTransport::tls(ca.clone(), None, None));
        }
    }

    if let Some(credentials) = &config.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    mqtt_options
        .set_keep_alive(config.keep_alive)
        .set_clean_session(config.clean_session)
        .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    mqtt_options
}

/// Map the session-level QoS onto rumqttc's
pub fn to_mqtt_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::time::Duration;

    fn plain_config() -> ConnectionConfig {
        ConnectionConfig::new("mqtt://localhost:1883", "device-1").unwrap()
    }

    #[test]
    fn test_configure_plain_options() {
        let options = configure_mqtt_options(&plain_config());
        assert_eq!(options.client_id(), "device-1");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.clean_session());
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_configure_credentials_and_session_flags() {
        let mut config = plain_config();
        config.credentials = Some(Credentials {
            username: "device-1".to_string(),
            password: "secret".to_string(),
        });
        config.clean_session = false;
        config.keep_alive = Duration::from_secs(45);

        let options = configure_mqtt_options(&config);
        assert_eq!(
            options.credentials(),
            Some(("device-1".to_string(), "secret".to_string()))
        );
        assert!(!options.clean_session());
        assert_eq!(options.keep_alive(), Duration::from_secs(45));
    }

    #[test]
    fn test_configure_tls_endpoint() {
        let config = ConnectionConfig::new("ssl://mqtt3.example.com", "device-1").unwrap();
        let options = configure_mqtt_options(&config);
        assert_eq!(
            options.broker_address(),
            ("mqtt3.example.com".to_string(), 8883)
        );
        assert!(matches!(options.transport(), RumqttcTransport::Tls(_)));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_mqtt_qos(QualityOfService::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(QualityOfService::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(QualityOfService::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn test_link_state_equality() {
        assert_eq!(LinkState::Reconnecting(2), LinkState::Reconnecting(2));
        assert_ne!(LinkState::Connected, LinkState::Closed("gone".to_string()));
    }
}
