fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod registers {
    use crate::output::{self, Record};
    use crate::registers::{ALARM_BITS, REGISTERS, Request, STATUS_BITS};

    /// Search and output known registers, status bits and device requests.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only show the entries mentioning this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register list")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize, strum::IntoStaticStr, Clone, Copy)]
    #[serde(rename_all = "kebab-case")]
    #[strum(serialize_all = "kebab-case")]
    pub enum Kind {
        Register,
        StatusBit,
        AlarmBit,
        Request,
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub kind: Kind,
        pub location: String,
        pub name: &'static str,
        pub scale: Option<u8>,
        pub description: String,
    }

    impl Record for RegisterSchema {
        const HEADERS: &'static [&'static str] =
            &["Kind", "Location", "Name", "Scale", "Description"];

        fn cells(&self) -> Vec<String> {
            vec![
                <&str>::from(self.kind).to_string(),
                self.location.clone(),
                self.name.to_string(),
                self.scale.map(|v| v.to_string()).unwrap_or_default(),
                self.description.clone(),
            ]
        }
    }

    impl RegisterSchema {
        pub fn all() -> impl Iterator<Item = Self> {
            let registers = REGISTERS.iter().map(|r| RegisterSchema {
                kind: Kind::Register,
                location: format!("{} {}", r.block, r.index),
                name: r.name,
                scale: Some(r.scale),
                description: r.description.to_string(),
            });
            let status = STATUS_BITS.iter().map(|&(flag, name, description)| RegisterSchema {
                kind: Kind::StatusBit,
                location: format!("STATUS & {}", flag.bits()),
                name,
                scale: None,
                description: description.to_string(),
            });
            let alarm = ALARM_BITS.iter().map(|&(flag, name, description)| RegisterSchema {
                kind: Kind::AlarmBit,
                location: format!("ALARM & {}", flag.bits()),
                name,
                scale: None,
                description: description.to_string(),
            });
            let requests = Request::all().into_iter().map(|r| RegisterSchema {
                kind: Kind::Request,
                location: r.body(),
                name: r.name(),
                scale: None,
                description: if r.is_write() { "command" } else { "query" }.to_string(),
            });
            registers.chain(status).chain(alarm).chain(requests)
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.to_uppercase().contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
                || self.location.to_uppercase().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output::<RegisterSchema>()?;
        for schema in RegisterSchema::all() {
            if let Some(pattern) = &args.filter {
                if !schema.is_match(pattern) {
                    continue;
                }
            }
            output.record(&schema)?;
        }
        Ok(output.commit()?)
    }

}

pub mod read {
    use crate::connection::{self, HttpTransport};
    use crate::device::{self, Device, HeaterState, Snapshot};
    use crate::output::{self, Record};

    /// Read the current state of the machine.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not read the device state")]
        Read(#[source] device::Error),
        #[error("could not output the device state")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct State {
        pub temperature: i64,
        pub target_temperature: f64,
        pub active: bool,
        pub ready: bool,
        pub heater_state: HeaterState,
        pub status: Vec<&'static str>,
        pub alarms: Vec<&'static str>,
        pub filter_days_remaining: i64,
        pub filter_change_threshold_days: u32,
        pub filter_life_percent: f64,
    }

    impl State {
        pub fn new(snapshot: Snapshot, target_temperature: f64) -> Self {
            Self {
                temperature: snapshot.temperature,
                target_temperature,
                active: snapshot.is_active(),
                ready: snapshot.is_ready(),
                heater_state: snapshot.heater_state(),
                status: snapshot.status.names().collect(),
                alarms: snapshot.alarm.names().collect(),
                filter_days_remaining: snapshot.filter_days_remaining,
                filter_change_threshold_days: snapshot.filter_change_threshold_days,
                filter_life_percent: snapshot.filter_life_percent(),
            }
        }
    }

    impl Record for State {
        const HEADERS: &'static [&'static str] = &[
            "Temperature",
            "Target",
            "Active",
            "Ready",
            "Heater",
            "Status",
            "Alarms",
            "Filter days",
            "Filter threshold",
            "Filter life %",
        ];

        fn cells(&self) -> Vec<String> {
            vec![
                self.temperature.to_string(),
                self.target_temperature.to_string(),
                self.active.to_string(),
                self.ready.to_string(),
                <&str>::from(&self.heater_state).to_string(),
                self.status.join(" "),
                self.alarms.join(" "),
                self.filter_days_remaining.to_string(),
                self.filter_change_threshold_days.to_string(),
                format!("{:.2}", self.filter_life_percent),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let transport = HttpTransport::new(&args.connection).map_err(Error::Connect)?;
        let device = Device::new(transport);
        let rt = super::runtime().map_err(Error::Runtime)?;
        let (snapshot, target) = rt
            .block_on(futures::future::try_join(
                device.fetch_read_only_state(),
                device.fetch_read_write_state(),
            ))
            .map_err(Error::Read)?;
        let mut output = args.output.to_output::<State>()?;
        output.record(&State::new(snapshot, target))?;
        Ok(output.commit()?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::device::decode_read_only;
        use crate::device::testing::READ_ONLY_RESPONSE;

        #[test]
        fn state_of_sample_response() {
            let snapshot = decode_read_only(READ_ONLY_RESPONSE).expect("sample decodes");
            let state = State::new(snapshot, 120.0);
            assert!(!state.active);
            assert!(state.ready);
            assert_eq!(state.status, ["standby", "ready"]);
            assert!(state.alarms.is_empty());
            let cells = state.cells();
            assert_eq!(cells.len(), State::HEADERS.len());
            assert_eq!(cells[1], "120");
            assert_eq!(cells[9], "8.33");
        }
    }
}

pub mod info {
    use crate::connection::{self, HttpTransport};
    use crate::device::{self, Device};

    /// Print the device information document (firmware, model and the like).
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not read the device information")]
        Read(#[source] device::Error),
        #[error("could not serialize the device information")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let transport = HttpTransport::new(&args.connection).map_err(Error::Connect)?;
        let device = Device::new(transport);
        let rt = super::runtime().map_err(Error::Runtime)?;
        let info = rt.block_on(device.device_info()).map_err(Error::Read)?;
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &info).map_err(Error::SerializeJson)?;
        writeln!(stdout).map_err(Error::WriteStdout)
    }
}

pub mod set {
    use crate::connection::{self, HttpTransport, Transport};
    use crate::device::{self, Device};

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum Power {
        On,
        Off,
    }

    #[derive(clap::Subcommand, Clone, Debug)]
    pub enum Setting {
        /// Wake the machine up or put it into standby.
        Power { state: Power },
        /// Change the boiler setpoint. Values outside of 115..=130 °C are clamped.
        Temperature { celsius: i32 },
        /// Restart the water filter replacement countdown.
        ResetFilter,
    }

    /// Issue a single command to the machine.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[command(subcommand)]
        setting: Setting,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the device did not accept the command")]
        Command(#[source] device::Error),
    }

    pub async fn apply<T: Transport>(device: &Device<T>, setting: Setting) -> Result<(), device::Error> {
        match setting {
            Setting::Power { state } => device.set_power(matches!(state, Power::On)).await,
            Setting::Temperature { celsius } => device.set_target_temperature(celsius).await,
            Setting::ResetFilter => device.reset_filter_expiration().await,
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let transport = HttpTransport::new(&args.connection).map_err(Error::Connect)?;
        let device = Device::new(transport);
        let rt = super::runtime().map_err(Error::Runtime)?;
        tracing::info!(setting = ?args.setting, "sending command");
        rt.block_on(apply(&device, args.setting)).map_err(Error::Command)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::device::testing::FakeTransport;
        use crate::registers::Request;

        #[tokio::test]
        async fn settings_map_to_requests() {
            let device = Device::new(FakeTransport::default());
            apply(&device, Setting::Power { state: Power::On }).await.expect("power on");
            apply(&device, Setting::Power { state: Power::Off }).await.expect("power off");
            apply(&device, Setting::Temperature { celsius: 121 }).await.expect("temperature");
            apply(&device, Setting::ResetFilter).await.expect("reset filter");
            assert_eq!(
                device.transport().requests(),
                [
                    "key=200&id=11&value=1",
                    "key=200&id=12&value=1",
                    "key=200&id=1&value=121",
                    "key=200&id=23&value=0",
                ]
            );

            device.transport().fail(Request::ResetFilterExpiration, 500);
            assert!(apply(&device, Setting::ResetFilter).await.is_err());
        }
    }
}

pub mod homie {
    use crate::connection::{self, HttpTransport};
    use crate::device::Device;
    use crate::homie::{Command, CubeDevice, Presentation, convert_qos};
    use homie5::{Homie5DeviceProtocol, HomieDomain, HomieID};
    use rumqttc::v5::mqttbytes::v5::{LastWill, Packet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::task::AbortOnDropHandle;

    /// Expose the machine as a Homie 5 device over MQTT.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// Host name of the MQTT broker.
        #[arg(long)]
        mqtt_host: String,
        #[arg(long, default_value_t = 1883)]
        mqtt_port: u16,
        #[arg(long, requires = "mqtt_password")]
        mqtt_user: Option<String>,
        #[arg(long, requires = "mqtt_user")]
        mqtt_password: Option<String>,

        /// Homie device ID, also used as the MQTT client ID.
        #[arg(long, default_value = "sanremo-cube")]
        device_id: String,

        /// How the machine is modelled as Homie nodes.
        #[arg(long, value_enum, default_value_t = Presentation::HeaterCooler)]
        presentation: Presentation,

        /// How often to read the machine out and publish changed values.
        #[arg(long, default_value = "10s")]
        poll_interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("`{1}` is not a valid homie device ID: {0}")]
        DeviceId(String, String),
        #[error("the homie device has stopped")]
        Homie(#[source] crate::homie::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let transport = HttpTransport::new(&args.connection).map_err(Error::Connect)?;
        let device = Arc::new(Device::new(transport));
        let device_id = HomieID::try_from(args.device_id.clone())
            .map_err(|e| Error::DeviceId(e.to_string(), args.device_id.clone()))?;
        let (protocol, last_will) = Homie5DeviceProtocol::new(device_id, HomieDomain::Default);

        let mut options =
            rumqttc::v5::MqttOptions::new(&args.device_id, &args.mqtt_host, args.mqtt_port);
        options.set_keep_alive(Duration::from_secs(5));
        options.set_last_will(LastWill::new(
            last_will.topic,
            last_will.message,
            convert_qos(last_will.qos),
            last_will.retain,
            None,
        ));
        if let (Some(user), Some(password)) = (&args.mqtt_user, &args.mqtt_password) {
            options.set_credentials(user, password);
        }

        let rt = super::runtime().map_err(Error::Runtime)?;
        rt.block_on(async move {
            let (mqtt, mut event_loop) = rumqttc::v5::AsyncClient::new(options, 100);
            let (commands_tx, commands) = mpsc::unbounded_channel();
            let _event_loop_task = AbortOnDropHandle::new(tokio::spawn(async move {
                loop {
                    let command = match event_loop.poll().await {
                        Ok(rumqttc::v5::Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("connected to the MQTT broker");
                            Command::Publish
                        }
                        Ok(rumqttc::v5::Event::Incoming(Packet::Publish(p))) => {
                            match Command::try_from_mqtt_command(p) {
                                Ok(command) => command,
                                Err(p) => {
                                    tracing::debug!(topic = ?p.topic, "ignoring publish");
                                    continue;
                                }
                            }
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(
                                message = "MQTT connection error",
                                error = (&e as &dyn std::error::Error)
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    if commands_tx.send(command).is_err() {
                        break;
                    }
                }
            }));
            CubeDevice::new(
                mqtt,
                protocol,
                device,
                args.presentation,
                commands,
                *args.poll_interval,
            )
            .run()
            .await
            .map_err(Error::Homie)
        })
    }
}
