//! Link side of the simulator
//!
//! Listens for telecommands, runs them on the [`Device`] and answers the way
//! the electronics do: a receive acknowledgment, the reply fragments, then
//! the execution acknowledgment. Housekeeping telemetry is published
//! periodically while enabled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use lanternlib::{LinkConfig, Publisher, Subscriber, TransportContext};
use lanternlibgs::{
    fields, Codec, Direction, Fields, LanternError, LanternResult, Packet, SchemaStore, Value,
};

use crate::device::{Device, ERR_CRC};

/// Name of the housekeeping telemetry type
pub const HK_KIND: &str = "hk";

/// Default housekeeping period
pub const DEFAULT_HK_INTERVAL: Duration = Duration::from_secs(1);

const IDLE_DELAY: Duration = Duration::from_millis(5);

/// Simulated device attached to the bus
pub struct Simulator {
    codec: Codec,
    device: Device,
    publisher: Box<dyn Publisher>,
    subscriber: Box<dyn Subscriber>,
    system_id: u8,
    next_packet_id: u16,
    rack_type: i64,
    eack_type: i64,
    reply_type: i64,
    hk_type: Option<i64>,
    hk_interval: Duration,
    last_hk: Instant,
    hk_counter: u32,
}

impl Simulator {
    /// Create a simulator for the link in `config`: it subscribes to the
    /// telecommand endpoint and publishes on the telemetry endpoint
    pub fn new(config: &LinkConfig, context: &TransportContext) -> LanternResult<Self> {
        let schemas = SchemaStore::load(&config.descriptors)?;
        Self::with_codec(config, Codec::new(Arc::new(schemas)), context)
    }

    pub fn with_codec(config: &LinkConfig, codec: Codec, context: &TransportContext) -> LanternResult<Self> {
        let schemas = codec.schemas();
        let sentinel = |kind: Option<i64>, name: &str| {
            kind.ok_or_else(|| LanternError::schema(format!("no '{}' telemetry type", name)))
        };
        let rack_type = sentinel(schemas.rack_type(), "rack")?;
        let eack_type = sentinel(schemas.eack_type(), "eack")?;
        let reply_type = sentinel(schemas.reply_type(), "tc_reply")?;
        let hk_type = schemas.packet_types().into_iter().find(|t| {
            schemas
                .telemetry_type(*t)
                .map(|s| s.name == HK_KIND)
                .unwrap_or(false)
        });

        let subscriber = context.subscriber(&config.connection.tc_endpoint)?;
        let publisher = context.publisher(&config.connection.tm_endpoint)?;
        info!(
            "Simulator listening on {}, publishing on {}",
            subscriber.endpoint(),
            publisher.endpoint()
        );

        Ok(Self {
            codec,
            device: Device::new(),
            publisher,
            subscriber,
            system_id: config.general.system_id,
            next_packet_id: 0,
            rack_type,
            eack_type,
            reply_type,
            hk_type,
            hk_interval: DEFAULT_HK_INTERVAL,
            last_hk: Instant::now(),
            hk_counter: 0,
        })
    }

    pub fn with_hk_interval(mut self, interval: Duration) -> Self {
        self.hk_interval = interval;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Serve until `running` is cleared
    pub fn run(&mut self, running: Arc<AtomicBool>) -> LanternResult<()> {
        while running.load(Ordering::SeqCst) {
            if !self.poll()? {
                thread::sleep(IDLE_DELAY);
            }
            if self.device.hk_enabled && self.last_hk.elapsed() >= self.hk_interval {
                self.send_hk()?;
            }
        }
        info!("Simulator stopped");
        Ok(())
    }

    /// Handle one telecommand if one is waiting. Returns whether one was.
    pub fn poll(&mut self) -> LanternResult<bool> {
        match self.subscriber.try_recv()? {
            Some(bytes) => {
                self.handle(&bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn handle(&mut self, bytes: &[u8]) -> LanternResult<()> {
        let tc = match self.codec.unpack(bytes) {
            Ok(tc) => tc,
            Err(e) => {
                warn!("Ignoring undecodable telecommand ({}): {}", e, hex::encode(bytes));
                return Ok(());
            }
        };
        let (packet_id, command_id) = match (tc.direction(), tc.packet_id(), tc.command_id()) {
            (Ok(Direction::Telecommand), Some(packet_id), Some(command_id)) => (packet_id, command_id),
            _ => {
                warn!("Ignoring frame that is not a telecommand: {}", hex::encode(bytes));
                return Ok(());
            }
        };
        let acknowledged = fields! { "packet_id" => packet_id, "command_id" => command_id };

        self.emit(self.rack_type, acknowledged.clone())?;

        let error = if self.codec.check_crc(&tc)? {
            let outcome = self.device.execute(&tc.data);
            for reply in outcome.replies {
                let mut data = acknowledged.clone();
                data.insert("tc_reply_data".to_string(), Value::Map(reply));
                self.emit(self.reply_type, data)?;
            }
            outcome.error
        } else {
            warn!("CRC mismatch on telecommand {}", packet_id);
            ERR_CRC
        };

        debug!("Command {} (packet {}) done: {}", command_id, packet_id, error);
        let mut data = acknowledged;
        data.insert("error".to_string(), Value::from(error));
        self.emit(self.eack_type, data)
    }

    fn send_hk(&mut self) -> LanternResult<()> {
        self.last_hk = Instant::now();
        let hk_type = match self.hk_type {
            Some(hk_type) => hk_type,
            None => return Ok(()),
        };

        let mut rng = rand::thread_rng();
        let data = fields! {
            "temperature" => self.device.temperature + rng.gen_range(-0.05f32..0.05),
            "voltage_hv" => self.device.voltage_hv + rng.gen_range(-0.5f32..0.5),
            "voltage_5v" => self.device.voltage_5v + rng.gen_range(-0.01f32..0.01),
            "counter" => self.hk_counter,
        };
        self.hk_counter = self.hk_counter.wrapping_add(1);
        self.emit(hk_type, data)
    }

    fn emit(&mut self, packet_type: i64, data: Fields) -> LanternResult<()> {
        let header = fields! {
            "system_id" => self.system_id,
            "packet_type" => packet_type,
            "packet_id" => self.next_packet_id,
        };
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        let (_, bytes): (Packet, Vec<u8>) = self.codec.frame(header, data)?;
        self.publisher.publish(&bytes)
    }
}
