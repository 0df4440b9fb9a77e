//! Pure routing of rumqttc events
//!
//! Incoming packets are mapped onto an [`EventRoute`], and
//! [`MessageHandler::next_step`] decides what the poll loop reports upward.

use super::connection::from_mqtt_qos;
use crate::message::InboundPublish;
use crate::transport::TransportEvent;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Broker answered the CONNECT with a failure code
    ConnectionRefused(String),
    /// Message received on a subscribed filter
    MessageReceived(InboundPublish),
    /// Broker sent DISCONNECT
    Disconnected,
    /// The event loop failed (network error, refused connection, ...)
    ConnectionLost(String),
    /// Infrastructure event (PingResp, SubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// What the poll loop does with a routed event
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    /// Report the event and keep polling
    Emit(TransportEvent),
    /// Report the event and stop polling
    Finish(TransportEvent),
    /// Nothing to report
    Skip,
}

impl MessageHandler {
    /// Route an MQTT event (pure function)
    pub fn route_event(event: &rumqttc::Event) -> EventRoute {
        use rumqttc::{ConnectReturnCode, Event, Packet};

        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAcknowledged
                }
                Packet::ConnAck(ack) => EventRoute::ConnectionRefused(format!("{:?}", ack.code)),
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundPublish {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: from_mqtt_qos(publish.qos),
                    retain: publish.retain,
                }),
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Decide what to report for a routed event (pure function)
    ///
    /// A loss before the first acknowledgement is an error of the attempt; a
    /// loss afterwards closes an established connection. Either way the loop
    /// stops, reconnecting is up to the broker connection.
    pub fn next_step(route: EventRoute, acknowledged: &mut bool) -> LoopStep {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *acknowledged = true;
                LoopStep::Emit(TransportEvent::Connected)
            }
            EventRoute::ConnectionRefused(reason) => {
                LoopStep::Finish(TransportEvent::Error(format!("connection refused: {reason}")))
            }
            EventRoute::MessageReceived(publish) => LoopStep::Emit(TransportEvent::Message(publish)),
            EventRoute::Disconnected if *acknowledged => LoopStep::Finish(TransportEvent::Closed),
            EventRoute::Disconnected => LoopStep::Finish(TransportEvent::Error(
                "broker disconnected before acknowledging".to_string(),
            )),
            EventRoute::ConnectionLost(_) if *acknowledged => LoopStep::Finish(TransportEvent::Closed),
            EventRoute::ConnectionLost(reason) => LoopStep::Finish(TransportEvent::Error(reason)),
            EventRoute::InfrastructureEvent(_) | EventRoute::OutgoingEvent => LoopStep::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Qos;
    use bytes::Bytes;

    #[test]
    fn test_route_event() {
        use rumqttc::{ConnAck, ConnectReturnCode, Event, Packet, Publish, QoS};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        }));
        assert!(matches!(
            MessageHandler::route_event(&refused),
            EventRoute::ConnectionRefused(_)
        ));

        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "sensors/room1/temp",
            QoS::AtLeastOnce,
            "21.5",
        )));
        assert_eq!(
            MessageHandler::route_event(&publish),
            EventRoute::MessageReceived(InboundPublish {
                topic: "sensors/room1/temp".to_string(),
                payload: Bytes::from("21.5"),
                qos: Qos::AtLeastOnce,
                retain: false,
            })
        );

        assert_eq!(
            MessageHandler::route_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert!(matches!(
            MessageHandler::route_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_loss_before_ack_is_an_error() {
        let mut acknowledged = false;
        assert_eq!(
            MessageHandler::next_step(
                EventRoute::ConnectionLost("connection refused".to_string()),
                &mut acknowledged
            ),
            LoopStep::Finish(TransportEvent::Error("connection refused".to_string()))
        );
        assert!(!acknowledged);
    }

    #[test]
    fn test_loss_after_ack_closes() {
        let mut acknowledged = false;
        assert_eq!(
            MessageHandler::next_step(EventRoute::ConnectionAcknowledged, &mut acknowledged),
            LoopStep::Emit(TransportEvent::Connected)
        );
        assert!(acknowledged);
        assert_eq!(
            MessageHandler::next_step(EventRoute::ConnectionLost("reset".into()), &mut acknowledged),
            LoopStep::Finish(TransportEvent::Closed)
        );
        assert_eq!(
            MessageHandler::next_step(EventRoute::Disconnected, &mut acknowledged),
            LoopStep::Finish(TransportEvent::Closed)
        );
    }

    #[test]
    fn test_infrastructure_events_are_skipped() {
        let mut acknowledged = true;
        assert_eq!(
            MessageHandler::next_step(EventRoute::OutgoingEvent, &mut acknowledged),
            LoopStep::Skip
        );
        assert_eq!(
            MessageHandler::next_step(
                EventRoute::InfrastructureEvent("PingResp".into()),
                &mut acknowledged
            ),
            LoopStep::Skip
        );
    }
}
