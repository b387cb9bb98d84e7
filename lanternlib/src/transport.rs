//! Publish/subscribe transport for telecommands and telemetry
//!
//! Each direction of the link is one unfiltered pub/sub channel named by an
//! endpoint string:
//!
//! | endpoint           | publisher                  | subscriber                     |
//! |--------------------|----------------------------|--------------------------------|
//! | `udp://host:port`  | sends datagrams to address | binds address, non-blocking    |
//! | `inproc://name`    | fans out to subscribers    | receives from the named topic  |
//!
//! Endpoints are created from a [`TransportContext`], an explicit handle that
//! owns the in-process topics and is passed to every driver. Delivery is best
//! effort: a datagram may be lost, and an in-process message published while
//! nobody subscribes is dropped.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};

use lanternlibgs::{LanternError, LanternResult};

use crate::config::constants::RECV_BUFFER_SIZE;

/// Sending half of a channel
pub trait Publisher: Send {
    /// Send one message without blocking
    fn publish(&mut self, message: &[u8]) -> LanternResult<()>;

    fn endpoint(&self) -> &Endpoint;
}

/// Receiving half of a channel
pub trait Subscriber: Send {
    /// Receive one message if one is ready. `Ok(None)` means nothing yet.
    fn try_recv(&mut self) -> LanternResult<Option<Vec<u8>>>;

    fn endpoint(&self) -> &Endpoint;
}

/// Parsed endpoint string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Udp(SocketAddr),
    Inproc(String),
}

impl FromStr for Endpoint {
    type Err = LanternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("udp://") {
            let addr = addr
                .to_socket_addrs()
                .map_err(|e| LanternError::Config(format!("Invalid endpoint '{}': {}", s, e)))?
                .next()
                .ok_or_else(|| LanternError::Config(format!("Endpoint '{}' does not resolve", s)))?;
            return Ok(Endpoint::Udp(addr));
        }
        if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(LanternError::Config(format!("Endpoint '{}' has no name", s)));
            }
            return Ok(Endpoint::Inproc(name.to_string()));
        }
        Err(LanternError::Config(format!("Unsupported endpoint '{}'", s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Udp(addr) => write!(f, "udp://{}", addr),
            Endpoint::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

/// Shared transport state. Cloning yields another handle to the same context.
#[derive(Clone, Default)]
pub struct TransportContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    topics: Mutex<HashMap<String, Vec<Sender<Vec<u8>>>>>,
    terminated: AtomicBool,
}

impl TransportContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the publishing side of `endpoint`
    pub fn publisher(&self, endpoint: &str) -> LanternResult<Box<dyn Publisher>> {
        self.check_alive()?;
        match endpoint.parse()? {
            Endpoint::Udp(addr) => Ok(Box::new(UdpPublisher::new(addr)?)),
            Endpoint::Inproc(name) => Ok(Box::new(InprocPublisher {
                endpoint: Endpoint::Inproc(name.clone()),
                name,
                context: self.inner.clone(),
            })),
        }
    }

    /// Open the subscribing side of `endpoint`, receiving everything
    pub fn subscriber(&self, endpoint: &str) -> LanternResult<Box<dyn Subscriber>> {
        self.check_alive()?;
        match endpoint.parse()? {
            Endpoint::Udp(addr) => Ok(Box::new(UdpSubscriber::bind(addr)?)),
            Endpoint::Inproc(name) => {
                let (tx, rx) = mpsc::channel();
                self.inner.topics.lock()?.entry(name.clone()).or_default().push(tx);
                debug!("Subscribed to inproc://{}", name);
                Ok(Box::new(InprocSubscriber {
                    endpoint: Endpoint::Inproc(name),
                    rx,
                }))
            }
        }
    }

    /// Tear the context down. In-process subscribers are disconnected and no
    /// new endpoints can be opened.
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        match self.inner.topics.lock() {
            Ok(mut topics) => topics.clear(),
            Err(e) => warn!("Transport context lock poisoned during terminate: {}", e),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> LanternResult<()> {
        if self.is_terminated() {
            return Err(LanternError::transport("context terminated"));
        }
        Ok(())
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Datagram publisher
pub struct UdpPublisher {
    socket: UdpSocket,
    endpoint: Endpoint,
    target: SocketAddr,
}

impl UdpPublisher {
    pub fn new(target: SocketAddr) -> LanternResult<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse()
        } else {
            "[::]:0".parse()
        }
        .map_err(|e| LanternError::Config(format!("Invalid local address: {}", e)))?;

        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            endpoint: Endpoint::Udp(target),
            target,
        })
    }
}

impl Publisher for UdpPublisher {
    fn publish(&mut self, message: &[u8]) -> LanternResult<()> {
        match self.socket.send_to(message, self.target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(LanternError::transport(format!("send to {} would block", self.target)))
            }
            Err(e) => Err(LanternError::Io(e)),
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Datagram subscriber bound to the endpoint address
pub struct UdpSubscriber {
    socket: UdpSocket,
    endpoint: Endpoint,
    recv_buffer: Vec<u8>,
}

impl UdpSubscriber {
    pub fn bind(addr: SocketAddr) -> LanternResult<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let socket: UdpSocket = socket.into();

        // Port 0 binds an ephemeral port, report the real one
        let endpoint = Endpoint::Udp(socket.local_addr()?);
        debug!("Subscriber bound to {}", endpoint);
        Ok(Self {
            socket,
            endpoint,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }
}

impl Subscriber for UdpSubscriber {
    fn try_recv(&mut self) -> LanternResult<Option<Vec<u8>>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((size, _)) => Ok(Some(self.recv_buffer[..size].to_vec())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(LanternError::Io(e)),
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

struct InprocPublisher {
    name: String,
    endpoint: Endpoint,
    context: Arc<ContextInner>,
}

impl Publisher for InprocPublisher {
    fn publish(&mut self, message: &[u8]) -> LanternResult<()> {
        if self.context.terminated.load(Ordering::SeqCst) {
            return Err(LanternError::transport("context terminated"));
        }
        let mut topics = self.context.topics.lock()?;
        if let Some(subscribers) = topics.get_mut(&self.name) {
            // Forget subscribers that went away
            subscribers.retain(|tx| tx.send(message.to_vec()).is_ok());
        }
        Ok(())
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

struct InprocSubscriber {
    endpoint: Endpoint,
    rx: Receiver<Vec<u8>>,
}

impl Subscriber for InprocSubscriber {
    fn try_recv(&mut self) -> LanternResult<Option<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(LanternError::transport(format!(
                "{} disconnected",
                self.endpoint
            ))),
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
