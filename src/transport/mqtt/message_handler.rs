//! Pure routing decisions for rumqttc events

use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};

/// What the supervisor should do with one event-loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK accepted; ready to publish/subscribe
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed filter
    MessageReceived { topic: String, payload: Bytes },
    /// Broker acknowledged an outbound publish (PUBACK or PUBCOMP)
    DeliveryComplete { packet_id: u16 },
    /// Broker closed the session
    Disconnected,
    /// SUBACK carried one or more failure codes
    SubscriptionRejected { packet_id: u16 },
    /// Our own DISCONNECT left the socket
    DisconnectSent,
    /// PINGRESP, SUBACK success and similar bookkeeping
    InfrastructureEvent(String),
    /// Other outgoing traffic (handled by rumqttc)
    OutgoingEvent,
}

/// Route an event-loop event
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                session_present: connack.session_present,
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
            },
            Packet::PubAck(ack) => EventRoute::DeliveryComplete {
                packet_id: ack.pkid,
            },
            Packet::PubComp(comp) => EventRoute::DeliveryComplete {
                packet_id: comp.pkid,
            },
            Packet::SubAck(suback) if !subscription_succeeded(&suback.return_codes) => {
                EventRoute::SubscriptionRejected {
                    packet_id: suback.pkid,
                }
            }
            Packet::Disconnect => EventRoute::Disconnected,
            other => EventRoute::InfrastructureEvent(format!("{other:?}")),
        },
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Validate subscription success from SUBACK return codes
pub fn subscription_succeeded(return_codes: &[SubscribeReasonCode]) -> bool {
    !return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, PubComp, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged {
                session_present: false
            }
        );
    }

    #[test]
    fn test_route_publish() {
        let event = Event::Incoming(Packet::Publish(Publish::new(
            "channels/1/subscribe/fields/field2",
            QoS::AtLeastOnce,
            "42",
        )));
        assert_eq!(
            route_mqtt_event(&event),
            EventRoute::MessageReceived {
                topic: "channels/1/subscribe/fields/field2".to_string(),
                payload: Bytes::from_static(b"42"),
            }
        );
    }

    #[test]
    fn test_route_delivery_acks() {
        let puback = Event::Incoming(Packet::PubAck(PubAck::new(7)));
        assert_eq!(
            route_mqtt_event(&puback),
            EventRoute::DeliveryComplete { packet_id: 7 }
        );

        let pubcomp = Event::Incoming(Packet::PubComp(PubComp::new(9)));
        assert_eq!(
            route_mqtt_event(&pubcomp),
            EventRoute::DeliveryComplete { packet_id: 9 }
        );
    }

    #[test]
    fn test_route_suback() {
        let ok = Event::Incoming(Packet::SubAck(SubAck::new(
            3,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        )));
        assert!(matches!(
            route_mqtt_event(&ok),
            EventRoute::InfrastructureEvent(_)
        ));

        let rejected = Event::Incoming(Packet::SubAck(SubAck::new(
            4,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            route_mqtt_event(&rejected),
            EventRoute::SubscriptionRejected { packet_id: 4 }
        );
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_ping_is_infrastructure() {
        assert!(matches!(
            route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }
}
