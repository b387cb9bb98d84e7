//! Transport driver: command generation, transmission and the receive loop
//!
//! A driver owns one publisher (telecommands out) and one subscriber
//! (telemetry in), both created from a shared [`TransportContext`]. Commands
//! are framed by the codec, stamped with the next packet id and recorded in
//! the [`Ledger`]. A background thread polls the subscriber, decodes
//! telemetry and attaches acknowledgments and replies to their commands.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use lanternlibgs::{
    Codec, Fields, LanternError, LanternResult, Packet, SchemaStore, Value,
    DIRECTION_BIT,
};

use crate::config::LinkConfig;
use crate::ledger::{CommandRecord, Ledger};
use crate::transport::{Publisher, Subscriber, TransportContext};

/// Connection state of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Connected,
    /// Connected with the receive loop running
    Receiving,
}

/// How much of the incoming telemetry is logged. Never affects delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent = 0,
    /// Receive acknowledgments
    Rack = 1,
    /// Receive and execution acknowledgments, command replies
    Acks = 2,
    /// Every packet
    All = 3,
}

impl Verbosity {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Verbosity::Silent,
            1 => Verbosity::Rack,
            2 => Verbosity::Acks,
            _ => Verbosity::All,
        }
    }

    fn logs(&self, kind: TelemetryKind) -> bool {
        match kind {
            TelemetryKind::Rack => *self >= Verbosity::Rack,
            TelemetryKind::Eack | TelemetryKind::Reply => *self >= Verbosity::Acks,
            TelemetryKind::Other => *self >= Verbosity::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelemetryKind {
    Rack,
    Eack,
    Reply,
    Other,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TelemetryKind::Rack => "rack",
            TelemetryKind::Eack => "eack",
            TelemetryKind::Reply => "reply",
            TelemetryKind::Other => "telemetry",
        };
        f.write_str(name)
    }
}

/// Sentinel packet types the receive loop classifies against
#[derive(Debug, Clone, Copy)]
struct Sentinels {
    rack: Option<i64>,
    eack: Option<i64>,
    reply: Option<i64>,
}

impl Sentinels {
    fn from_store(store: &SchemaStore) -> Self {
        Self {
            rack: store.rack_type(),
            eack: store.eack_type(),
            reply: store.reply_type(),
        }
    }

    fn classify(&self, packet_type: Option<i64>) -> TelemetryKind {
        match packet_type {
            t if t.is_some() && t == self.rack => TelemetryKind::Rack,
            t if t.is_some() && t == self.eack => TelemetryKind::Eack,
            t if t.is_some() && t == self.reply => TelemetryKind::Reply,
            _ => TelemetryKind::Other,
        }
    }
}

/// Driver for the link to one device
pub struct TransportDriver {
    codec: Codec,
    context: TransportContext,
    config: LinkConfig,
    next_packet_id: AtomicU64,
    id_capacity: u64,
    ledger: Arc<Ledger>,
    publisher: Option<Box<dyn Publisher>>,
    subscriber: Option<Box<dyn Subscriber>>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<LanternResult<Box<dyn Subscriber>>>>,
}

impl TransportDriver {
    /// Create a driver, loading the descriptor files named in `config`
    pub fn new(config: LinkConfig, context: TransportContext) -> LanternResult<Self> {
        let schemas = SchemaStore::load(&config.descriptors)?;
        Ok(Self::with_codec(config, Codec::new(Arc::new(schemas)), context))
    }

    /// Create a driver sharing an already loaded codec
    pub fn with_codec(config: LinkConfig, codec: Codec, context: TransportContext) -> Self {
        let id_capacity = codec.schemas().packet_id_capacity();
        let ledger = Arc::new(Ledger::new(
            config.driver.max_commands,
            config.driver.max_telemetry,
        ));
        Self {
            codec,
            context,
            config,
            next_packet_id: AtomicU64::new(0),
            id_capacity,
            ledger,
            publisher: None,
            subscriber: None,
            running: Arc::new(AtomicBool::new(false)),
            receiver: None,
        }
    }

    pub fn state(&self) -> DriverState {
        match (&self.publisher, &self.receiver) {
            (None, _) => DriverState::Disconnected,
            (Some(_), Some(_)) if self.running.load(Ordering::SeqCst) => DriverState::Receiving,
            // The receive loop failed and took the subscriber with it
            (Some(_), Some(_)) => DriverState::Disconnected,
            (Some(_), None) => DriverState::Connected,
        }
    }

    /// Open the telecommand publisher and the telemetry subscriber
    pub fn connect(&mut self) -> LanternResult<()> {
        if self.state() != DriverState::Disconnected {
            warn!("Driver already connected");
            return Ok(());
        }
        if self.receiver.is_some() {
            if let Err(e) = self.stop_receiver() {
                warn!("Previous receive loop failed: {}", e);
            }
        }

        let publisher = self.context.publisher(&self.config.connection.tc_endpoint)?;
        let subscriber = self.context.subscriber(&self.config.connection.tm_endpoint)?;
        info!(
            "Connected: telecommands to {}, telemetry from {}",
            publisher.endpoint(),
            subscriber.endpoint()
        );
        self.publisher = Some(publisher);
        self.subscriber = Some(subscriber);
        Ok(())
    }

    /// Stop the receive loop and release both endpoints
    pub fn disconnect(&mut self) -> LanternResult<()> {
        if self.state() == DriverState::Disconnected && self.receiver.is_none() {
            warn!("Driver already disconnected");
            return Ok(());
        }

        let stopped = self.stop_receiver();
        self.publisher = None;
        self.subscriber = None;
        info!("Disconnected");
        stopped
    }

    /// Build a telecommand without sending it
    ///
    /// The packet id is consumed even if the packet is never sent.
    pub fn generate(&self, command_id: i64, params: Fields) -> LanternResult<Packet> {
        let schema = self.codec.schemas().command(command_id)?;

        let mut data = Fields::new();
        data.insert("command_id".to_string(), Value::Int(command_id));
        if schema.root.child("params").is_some() {
            data.insert("params".to_string(), Value::Map(params));
        } else if !params.is_empty() {
            return Err(LanternError::encode(format!(
                "command '{}' takes no parameters",
                schema.name
            )));
        }

        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst) % self.id_capacity;
        let mut header = Fields::new();
        header.insert(
            "system_id".to_string(),
            Value::from(self.config.general.system_id | DIRECTION_BIT),
        );
        header.insert("packet_id".to_string(), Value::Int(packet_id as i64));

        let (packet, _) = self.codec.frame(header, data)?;
        debug!("Generated {} as packet {}", schema.name, packet_id);
        Ok(packet)
    }

    /// Transmit a telecommand and record it in the ledger
    pub fn send(&mut self, packet: Packet) -> LanternResult<()> {
        let publisher = self.publisher.as_mut().ok_or(LanternError::NotConnected)?;
        let bytes = self.codec.pack(&packet)?;

        // Recorded first so a fast acknowledgment finds its command
        let record = CommandRecord::new(packet)?;
        let packet_id = record.packet_id;
        self.ledger.push_tc(record)?;

        if let Err(e) = publisher.publish(&bytes) {
            self.ledger.discard_tc(packet_id)?;
            return Err(e);
        }
        trace!("Sent packet {}: {}", packet_id, hex::encode(&bytes));
        Ok(())
    }

    /// Generate and send a telecommand, returning the packet sent
    pub fn command(&mut self, command_id: i64, params: Fields) -> LanternResult<Packet> {
        let packet = self.generate(command_id, params)?;
        self.send(packet.clone())?;
        Ok(packet)
    }

    /// Spawn the background receive loop
    pub fn start_receiver(&mut self) -> LanternResult<()> {
        if self.receiver.is_some() {
            if self.running.load(Ordering::SeqCst) {
                warn!("Receive loop already running");
                return Ok(());
            }
            self.stop_receiver()?;
        }
        let subscriber = self.subscriber.take().ok_or(LanternError::NotConnected)?;

        let receive_loop = ReceiveLoop {
            codec: self.codec.clone(),
            sentinels: Sentinels::from_store(self.codec.schemas()),
            ledger: self.ledger.clone(),
            running: self.running.clone(),
            poll_interval: self.config.driver.poll_interval(),
            verbosity: Verbosity::from_u8(self.config.driver.verbosity),
        };

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("lantern-receive".to_string())
            .spawn(move || receive_loop.run(subscriber))?;
        self.receiver = Some(handle);
        debug!("Receive loop started");
        Ok(())
    }

    /// Stop the receive loop, waiting for it to finish its iteration
    ///
    /// If the loop had ended on an error the subscriber is lost with it: the
    /// error is returned and the driver is left disconnected.
    pub fn stop_receiver(&mut self) -> LanternResult<()> {
        self.running.store(false, Ordering::SeqCst);

        let handle = match self.receiver.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let joined = handle
            .join()
            .map_err(|_| LanternError::transport("receive thread panicked"))
            .and_then(|result| result);
        match joined {
            Ok(subscriber) => {
                self.subscriber = Some(subscriber);
                debug!("Receive loop stopped");
                Ok(())
            }
            Err(e) => {
                self.publisher = None;
                self.subscriber = None;
                Err(e)
            }
        }
    }

    /// Wait for the execution acknowledgment of the last command
    pub fn validate_last_tc(&self, timeout: Duration) -> LanternResult<()> {
        self.ledger.validate_last_tc(timeout)
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}

impl Drop for TransportDriver {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            if let Err(e) = self.stop_receiver() {
                error!("Error stopping receive loop: {}", e);
            }
        }
    }
}

struct ReceiveLoop {
    codec: Codec,
    sentinels: Sentinels,
    ledger: Arc<Ledger>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    verbosity: Verbosity,
}

impl ReceiveLoop {
    /// Poll until stopped, handing the subscriber back on exit
    fn run(self, mut subscriber: Box<dyn Subscriber>) -> LanternResult<Box<dyn Subscriber>> {
        while self.running.load(Ordering::SeqCst) {
            match subscriber.try_recv() {
                Ok(Some(bytes)) => self.handle(&bytes)?,
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    error!("Receive from {} failed: {}", subscriber.endpoint(), e);
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(subscriber)
    }

    fn handle(&self, bytes: &[u8]) -> LanternResult<()> {
        let packet = match self.codec.unpack(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping undecodable packet ({}): {}", e, hex::encode(bytes));
                return Ok(());
            }
        };

        let kind = self.sentinels.classify(packet.packet_type());
        if self.verbosity.logs(kind) {
            info!("Received {}: {:?}", kind, packet.data);
        }

        match self.codec.check_crc(&packet) {
            Ok(true) => {}
            Ok(false) => warn!(
                "CRC mismatch on {} packet {:?}, delivering anyway",
                kind,
                packet.packet_id()
            ),
            Err(e) => warn!("Cannot check CRC of {}: {}", kind, e),
        }

        self.ledger.push_tm(
            packet,
            kind == TelemetryKind::Eack,
            kind == TelemetryKind::Reply,
        )
    }
}
