//! MQTT transport for the table layer.
//!
//! Publishes are retained QoS 1 so dashboards can attach at any time. A
//! drain thread owns the connection event loop and parks inbound publishes
//! on watched topics in a queue for [`KvBackend::take_writes`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use rumqttc::v5::{
    mqttbytes::v5::Packet, mqttbytes::QoS, Client, Connection, ConnectionError, Event, MqttOptions,
};
use rumqttc::Transport;
use serde_json::Value;

use crate::table::KvBackend;

#[derive(Clone, Debug, PartialEq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

pub fn parse_broker_addr(addr: &str) -> Result<BrokerEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported broker scheme: {other}")),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(BrokerEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid broker address: {addr}"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing broker port in {addr}"))?;
        let port: u16 = port.parse().context("invalid broker port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing broker port in {addr}"))?;
    let port: u16 = port.parse().context("invalid broker port")?;
    Ok((host.to_string(), port))
}

pub struct MqttBackend {
    client: Client,
    inbound: Arc<Mutex<VecDeque<(String, Value)>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBackend {
    pub fn connect(addr: &str, client_id: &str) -> Result<Self> {
        let endpoint = parse_broker_addr(addr)?;
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, 64);
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let drain = spawn_drain(connection, Arc::clone(&inbound));
        info!(
            "table connected to broker {}:{} (tls: {})",
            endpoint.host, endpoint.port, endpoint.use_tls
        );
        Ok(Self {
            client,
            inbound,
            drain: Mutex::new(Some(drain)),
        })
    }

    /// Flushes the connection and joins the drain thread.
    pub fn shutdown(&self) -> Result<()> {
        self.client.disconnect().context("mqtt disconnect")?;
        let handle = self
            .drain
            .lock()
            .map_err(|_| anyhow!("mqtt drain handle lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn spawn_drain(
    mut connection: Connection,
    inbound: Arc<Mutex<VecDeque<(String, Value)>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = match String::from_utf8(publish.topic.to_vec()) {
                        Ok(topic) => topic,
                        Err(_) => {
                            warn!("dropping publish with non-utf8 topic");
                            continue;
                        }
                    };
                    // Dashboards sometimes write bare strings rather than
                    // JSON; accept both.
                    let value = serde_json::from_slice(&publish.payload).unwrap_or_else(|_| {
                        Value::String(String::from_utf8_lossy(&publish.payload).into_owned())
                    });
                    match inbound.lock() {
                        Ok(mut queue) => queue.push_back((topic, value)),
                        Err(_) => {
                            warn!("mqtt inbound queue lock poisoned, stopping drain");
                            break;
                        }
                    }
                }
                Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                // the client half was dropped; this is the normal way a
                // per-camera connection winds down
                Err(ConnectionError::RequestsDone) => {
                    debug!("mqtt client gone, stopping drain");
                    break;
                }
                Err(e) => {
                    warn!("mqtt connection error: {e}");
                    break;
                }
            }
        }
    })
}

impl KvBackend for MqttBackend {
    fn publish(&self, path: &str, value: &Value) -> Result<()> {
        let payload = serde_json::to_vec(value).context("encode table value")?;
        self.client
            .publish(path, QoS::AtLeastOnce, true, payload)
            .with_context(|| format!("publish table value to {path}"))?;
        Ok(())
    }

    fn watch(&self, path: &str) -> Result<()> {
        self.client
            .subscribe(path, QoS::AtLeastOnce)
            .with_context(|| format!("subscribe to {path}"))?;
        Ok(())
    }

    fn take_writes(&self) -> Result<Vec<(String, Value)>> {
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| anyhow!("mqtt inbound queue lock poisoned"))?;
        Ok(inbound.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_host_port() {
        let ep = parse_broker_addr("127.0.0.1:1883").unwrap();
        assert_eq!(
            ep,
            BrokerEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1883,
                use_tls: false,
            }
        );
    }

    #[test]
    fn parses_schemes() {
        assert!(!parse_broker_addr("mqtt://broker:1883").unwrap().use_tls);
        assert!(!parse_broker_addr("tcp://broker:1883").unwrap().use_tls);
        assert!(parse_broker_addr("mqtts://broker:8883").unwrap().use_tls);
        assert!(parse_broker_addr("ssl://broker:8883").unwrap().use_tls);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let ep = parse_broker_addr("[::1]:1883").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn rejects_missing_port_and_bad_scheme() {
        assert!(parse_broker_addr("brokeronly").is_err());
        assert!(parse_broker_addr("http://broker:80").is_err());
        assert!(parse_broker_addr("[::1]").is_err());
    }
}
