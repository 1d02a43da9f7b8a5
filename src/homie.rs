//! Publishes a Sanremo Cube as a Homie 5 device over MQTT.

mod filter_node;
mod heater_node;
mod node;
mod switch_node;
mod value;

use crate::connection::Transport;
use crate::device::Device;
use crate::homie::node::{DeviceCommand, Node, Reading};
use homie5::client::{Publish, QoS, Subscription};
use homie5::device_description::HomieDeviceDescription;
use homie5::{Homie5DeviceProtocol, HomieDeviceStatus, HomieID, PropertyRef};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// How the machine is presented to the home automation system.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presentation {
    /// Heater with power, current and target temperatures plus filter maintenance.
    HeaterCooler,
    /// Standby switch with a boiler temperature sensor.
    Switch,
}

impl Presentation {
    fn nodes(self) -> Vec<Box<dyn Node>> {
        match self {
            Presentation::HeaterCooler => vec![
                Box::new(heater_node::HeaterNode::new()) as Box<dyn Node>,
                Box::new(filter_node::FilterNode::new()) as _,
            ],
            Presentation::Switch => vec![
                Box::new(switch_node::SwitchNode::new()) as Box<dyn Node>,
                Box::new(switch_node::TemperatureSensorNode::new()) as _,
            ],
        }
    }

    /// Whether any of the properties depend on the read-write parameter block.
    fn reads_settings(self) -> bool {
        matches!(self, Presentation::HeaterCooler)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not hand a message to the MQTT client")]
    Mqtt(#[source] rumqttc::v5::ClientError),
    #[error("could not prepare the homie device description: {0}")]
    Description(String),
    #[error("the MQTT event loop has stopped")]
    EventLoopGone,
}

pub struct CubeDevice<T> {
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    state: HomieDeviceStatus,
    description: HomieDeviceDescription,
    presentation: Presentation,
    nodes: BTreeMap<HomieID, Box<dyn Node>>,
    device: Arc<Device<T>>,
    /// Values last published for each `(node, property)`.
    published: BTreeMap<(HomieID, HomieID), String>,
    commands: mpsc::UnboundedReceiver<Command>,
    poll_interval: Duration,
}

impl<T: Transport> CubeDevice<T> {
    pub fn new(
        mqtt: rumqttc::v5::AsyncClient,
        protocol: Homie5DeviceProtocol,
        device: Arc<Device<T>>,
        presentation: Presentation,
        commands: mpsc::UnboundedReceiver<Command>,
        poll_interval: Duration,
    ) -> Self {
        let nodes = presentation.nodes();
        let mut description =
            homie5::device_description::DeviceDescriptionBuilder::new().name("Sanremo Cube");
        for node in &nodes {
            description = description.add_node(node.node_id(), node.description());
        }
        let description = description.build();
        let nodes = nodes.into_iter().map(|v| (v.node_id(), v)).collect();
        Self {
            mqtt,
            protocol,
            state: HomieDeviceStatus::Init,
            description,
            presentation,
            nodes,
            device,
            published: BTreeMap::new(),
            commands,
            poll_interval,
        }
    }

    pub async fn publish_device(&mut self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    self.state = HomieDeviceStatus::Init;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Mqtt)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(|e| Error::Description(e.to_string()))?;
                    self.mqtt.homie_publish(p).await.map_err(Error::Mqtt)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    // Retained values may have been lost along with the previous session.
                    self.published.clear();
                    self.poll().await?;
                    // rumqttc appears to be sending publishes in a weird order that results in
                    // some of the properties getting published *after* `$state = Ready` unless we
                    // yield here...
                    tokio::task::yield_now().await;
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    let mut p = self
                        .protocol
                        .subscribe_props(&self.description)
                        .map_err(|e| Error::Description(e.to_string()))?
                        .peekable();
                    if p.peek().is_some() {
                        self.mqtt.homie_subscribe(p).await.map_err(Error::Mqtt)?;
                    }
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    tracing::debug!("device becomes ready...");
                    self.state = HomieDeviceStatus::Ready;
                    let p = self.protocol.publish_state(self.state);
                    self.mqtt.homie_publish(p).await.map_err(Error::Mqtt)?;
                }
            }
        }
        Ok(())
    }

    async fn read(&self) -> Reading {
        let snapshot = self.device.read_only_state().await;
        let target_temperature = if self.presentation.reads_settings() {
            self.device.target_temperature().await
        } else {
            0.0
        };
        Reading { snapshot, target_temperature }
    }

    /// Read the device out and publish whatever property values have changed.
    async fn poll(&mut self) -> Result<(), Error> {
        let reading = self.read().await;
        tracing::trace!(?reading, "polled the device");
        let changes = changed_values(&self.nodes, &mut self.published, &reading);
        for (node_id, prop_id, value) in changes {
            let retained = self
                .description
                .get_property_by_id(&node_id, &prop_id)
                .map(|pd| pd.retained)
                .unwrap_or(true);
            let msg = self.protocol.publish_value(&node_id, &prop_id, value, retained);
            self.mqtt.homie_publish(msg).await.map_err(Error::Mqtt)?;
        }
        Ok(())
    }

    async fn handle_set(&mut self, property: PropertyRef, value: String) {
        if property.device_id() != self.protocol.device_ref().device_id() {
            tracing::debug!(?property, "set command for another device");
            return;
        }
        let Some(node) = self.nodes.get(property.node_id()) else {
            tracing::warn!(?property, "set command for an unknown node");
            return;
        };
        let command = match node.set(property.prop_id(), &value) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    message = "rejecting set command",
                    value,
                    error = (&e as &dyn std::error::Error)
                );
                return;
            }
        };
        tracing::info!(?command, "executing set command");
        let result = match command {
            DeviceCommand::SetPower(on) => self.device.set_power(on).await,
            DeviceCommand::SetTargetTemperature(c) => self.device.set_target_temperature(c).await,
            DeviceCommand::ResetFilterExpiration => self.device.reset_filter_expiration().await,
            DeviceCommand::Nothing => Ok(()),
        };
        // Commands are best-effort: the next read-out tells whether it had the desired effect.
        if let Err(e) = result {
            tracing::warn!(
                message = "device command failed",
                ?command,
                error = (&e as &dyn std::error::Error)
            );
        }
    }

    /// Serve the device until the MQTT event loop goes away.
    pub async fn run(mut self) -> Result<(), Error> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick(), if matches!(self.state, HomieDeviceStatus::Ready) => {
                    self.poll().await?;
                },
                command = self.commands.recv() => {
                    match command.ok_or(Error::EventLoopGone)? {
                        Command::Publish => {
                            self.publish_device().await?;
                            interval.reset();
                        }
                        Command::Set { property, value } => {
                            self.handle_set(property, value).await;
                            self.poll().await?;
                            interval.reset();
                        }
                    }
                },
            }
        }
    }
}

fn changed_values(
    nodes: &BTreeMap<HomieID, Box<dyn Node>>,
    published: &mut BTreeMap<(HomieID, HomieID), String>,
    reading: &Reading,
) -> Vec<(HomieID, HomieID, String)> {
    let mut changes = Vec::new();
    for (node_id, node) in nodes {
        for (prop_id, value) in node.values(reading) {
            let key = (node_id.clone(), prop_id.clone());
            if published.get(&key) == Some(&value) {
                continue;
            }
            published.insert(key, value.clone());
            changes.push((node_id.clone(), prop_id, value));
        }
    }
    changes
}

trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: Publish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        self.subscribe_many(
            subs.map(|sub| {
                rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos))
            }),
        )
        .await
    }
}

pub fn convert_qos(homie: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match homie {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

/// Work for the bridge originating from the MQTT connection.
pub enum Command {
    /// The broker (re)accepted our session: publish the device from scratch.
    Publish,
    Set { property: PropertyRef, value: String },
}

impl Command {
    pub fn try_from_mqtt_command(
        msg: rumqttc::v5::mqttbytes::v5::Publish,
    ) -> Result<Self, rumqttc::v5::mqttbytes::v5::Publish> {
        let Ok(topic) = std::str::from_utf8(&msg.topic) else {
            return Err(msg);
        };
        match homie5::parse_mqtt_message(topic, &msg.payload) {
            Ok(homie5::Homie5Message::PropertySet {
                property,
                set_value,
            }) => Ok(Self::Set {
                property,
                value: set_value,
            }),
            _ => Err(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Snapshot;
    use crate::registers::StatusFlags;

    fn nodes(presentation: Presentation) -> BTreeMap<HomieID, Box<dyn Node>> {
        presentation.nodes().into_iter().map(|v| (v.node_id(), v)).collect()
    }

    #[test]
    fn only_changes_are_published() {
        let nodes = nodes(Presentation::HeaterCooler);
        let mut published = BTreeMap::new();
        let mut reading = Reading {
            snapshot: Snapshot {
                temperature: 90,
                status: StatusFlags::from_bits(0),
                filter_days_remaining: 30,
                filter_change_threshold_days: 60,
                ..Snapshot::default()
            },
            target_temperature: 120.0,
        };
        assert_eq!(changed_values(&nodes, &mut published, &reading).len(), 9);
        assert!(changed_values(&nodes, &mut published, &reading).is_empty());

        reading.snapshot.temperature = 95;
        reading.snapshot.status = StatusFlags::READY;
        let changes = changed_values(&nodes, &mut published, &reading);
        let changes = changes
            .iter()
            .map(|(n, p, v)| (n.to_string(), p.to_string(), v.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            changes,
            [
                ("heater".to_string(), "current-temperature".to_string(), "95"),
                ("heater".to_string(), "state".to_string(), "idle"),
            ]
        );
    }

    #[test]
    fn presentations_expose_distinct_nodes() {
        let heater = nodes(Presentation::HeaterCooler);
        let ids = heater.keys().map(|id| id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, ["filter", "heater"]);
        let switch = nodes(Presentation::Switch);
        let ids = switch.keys().map(|id| id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids, ["switch", "temperature-sensor"]);
        assert!(Presentation::HeaterCooler.reads_settings());
        assert!(!Presentation::Switch.reads_settings());
    }
}
