//! Driver and ledger over a real bus, with the test playing the device

use std::net::UdpSocket;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use lanternlib::{
    ConnectionConfig, DriverState, LinkConfig, Subscriber, TransportContext, TransportDriver,
};
use lanternlibgs::{fields, Codec, Descriptors, Fields, LanternError, Packet};

fn config(tc_endpoint: String, tm_endpoint: String) -> LinkConfig {
    LinkConfig::new(
        1,
        ConnectionConfig {
            tc_endpoint,
            tm_endpoint,
        },
        Descriptors::in_folder(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../schemas")),
    )
}

fn inproc_config(name: &str) -> LinkConfig {
    config(format!("inproc://{}-tc", name), format!("inproc://{}-tm", name))
}

fn telemetry(codec: &Codec, packet_type: i64, data: Fields) -> Vec<u8> {
    let header = fields! { "system_id" => 1, "packet_type" => packet_type, "packet_id" => 0 };
    codec.frame(header, data).unwrap().1
}

fn eack(codec: &Codec, packet: &Packet, error: &str) -> Vec<u8> {
    let data = fields! {
        "packet_id" => packet.packet_id().unwrap(),
        "command_id" => packet.command_id().unwrap(),
        "error" => error,
    };
    telemetry(codec, 2, data)
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

struct Link {
    context: TransportContext,
    driver: TransportDriver,
    device_tc: Box<dyn Subscriber>,
    codec: Codec,
}

impl Link {
    fn inproc(name: &str) -> Self {
        let context = TransportContext::new();
        let config = inproc_config(name);
        let device_tc = context.subscriber(&config.connection.tc_endpoint).unwrap();

        let mut driver = TransportDriver::new(config, context.clone()).unwrap();
        driver.connect().unwrap();
        driver.start_receiver().unwrap();
        let codec = driver.codec().clone();
        Self {
            context,
            driver,
            device_tc,
            codec,
        }
    }

    /// Publish telemetry as the device
    fn device_send(&self, bytes: &[u8]) {
        let tm_endpoint = &self.driver.config().connection.tm_endpoint;
        let mut publisher = self.context.publisher(tm_endpoint).unwrap();
        publisher.publish(bytes).unwrap();
    }

    fn device_recv(&mut self) -> Packet {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(bytes) = self.device_tc.try_recv().unwrap() {
                return self.codec.unpack(&bytes).unwrap();
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("no telecommand received");
    }
}

#[test]
fn test_ack_ok() {
    let mut link = Link::inproc("ok");
    let sent = link.driver.command(5, Fields::new()).unwrap();

    let received = link.device_recv();
    assert_eq!(received, sent);
    assert!(link.codec.check_crc(&received).unwrap());

    link.device_send(&eack(&link.codec, &received, "OK"));
    link.driver.validate_last_tc(Duration::from_secs(2)).unwrap();
}

#[test]
fn test_ack_busy() {
    let mut link = Link::inproc("busy");
    link.driver.command(6, Fields::new()).unwrap();
    let received = link.device_recv();

    link.device_send(&eack(&link.codec, &received, "ERR_BUSY"));
    let err = link.driver.validate_last_tc(Duration::from_secs(2)).unwrap_err();
    assert!(matches!(err, LanternError::Rejected(_)));
    assert!(err.to_string().contains("ERR_BUSY"));
}

#[test]
fn test_timeout_without_device() {
    let mut link = Link::inproc("silent");
    link.driver.command(5, Fields::new()).unwrap();

    let start = Instant::now();
    let result = link.driver.validate_last_tc(Duration::from_millis(150));
    assert!(matches!(result, Err(LanternError::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[test]
fn test_ack_for_older_command_ignored_by_last() {
    let mut link = Link::inproc("older");
    link.driver.command(5, Fields::new()).unwrap();
    let first = link.device_recv();
    link.driver.command(6, Fields::new()).unwrap();
    let _second = link.device_recv();

    link.device_send(&eack(&link.codec, &first, "OK"));
    assert!(matches!(
        link.driver.validate_last_tc(Duration::from_millis(100)),
        Err(LanternError::Timeout)
    ));

    let ledger = link.driver.ledger();
    assert!(ledger.find_tc(0).unwrap().unwrap().ack.is_some());
    assert!(ledger.find_tc(1).unwrap().unwrap().ack.is_none());
}

#[test]
fn test_malformed_dropped() {
    let link = Link::inproc("malformed");
    let ledger = link.driver.ledger();

    link.device_send(&[0x01, 0x02]);
    link.device_send(&[0x01, 0x63, 0, 0, 0, 0, 0, 0, 0, 0]);
    let hk = telemetry(
        &link.codec,
        4,
        fields! { "temperature" => 20.0f32, "voltage_hv" => 1.0f32, "voltage_5v" => 5.0f32, "counter" => 1u32 },
    );
    link.device_send(&hk);

    // Only the valid packet makes it to the ledger
    assert!(wait_for(|| ledger.len_tm().unwrap() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(ledger.len_tm().unwrap(), 1);
    assert_eq!(ledger.telemetry().unwrap()[0].packet_type(), Some(4));
}

#[test]
fn test_crc_mismatch_still_delivered() {
    let mut link = Link::inproc("crc");
    link.driver.command(5, Fields::new()).unwrap();
    let received = link.device_recv();

    let mut bytes = eack(&link.codec, &received, "OK");
    // Corrupt the CRC field of the telemetry header
    bytes[6] ^= 0xff;
    link.device_send(&bytes);

    link.driver.validate_last_tc(Duration::from_secs(2)).unwrap();
    let telemetry = link.driver.ledger().telemetry().unwrap();
    assert!(!link.codec.check_crc(&telemetry[0]).unwrap());
}

#[test]
fn test_replies_attached_in_arrival_order() {
    let mut link = Link::inproc("replies");
    link.driver.command(11, fields! { "sequence" => 1 }).unwrap();
    let received = link.device_recv();

    for start in [200u16, 0] {
        let data = fields! {
            "packet_id" => received.packet_id().unwrap(),
            "command_id" => 11,
            "tc_reply_data" => fields! {
                "sequence" => 1,
                "npoints" => 201,
                "startpoint" => start,
                "xmod" => vec![start as f32; if start == 0 { 200 } else { 1 }],
                "ymod" => vec![0.0f32; if start == 0 { 200 } else { 1 }],
            },
        };
        link.device_send(&telemetry(&link.codec, 3, data));
    }
    link.device_send(&eack(&link.codec, &received, "OK"));

    let record = link
        .driver
        .ledger()
        .wait_last_reply(Duration::from_secs(2), |replies| replies.len() == 2)
        .unwrap();
    let starts: Vec<_> = record
        .replies
        .iter()
        .map(|r| r.reply_data().unwrap()["startpoint"].as_i64().unwrap())
        .collect();
    assert_eq!(starts, vec![200, 0]);

    let series = lanternlib::reassemble(&record.replies, "startpoint", &["xmod"], 201).unwrap();
    assert_eq!(series["xmod"][200], 200.0);
    assert_eq!(series["xmod"][0], 0.0);
}

#[test]
fn test_disconnect_and_reconnect() {
    let mut link = Link::inproc("reconnect");
    link.driver.disconnect().unwrap();
    assert_eq!(link.driver.state(), DriverState::Disconnected);
    assert!(matches!(
        link.driver.command(5, Fields::new()),
        Err(LanternError::NotConnected)
    ));

    link.driver.connect().unwrap();
    link.driver.start_receiver().unwrap();
    link.driver.command(5, Fields::new()).unwrap();
    let received = link.device_recv();
    assert_eq!(received.packet_id(), Some(1));
}

#[test]
fn test_terminated_context_stops_receiver() {
    let mut link = Link::inproc("terminate");
    link.context.terminate();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(link.driver.state(), DriverState::Disconnected);
    assert!(matches!(
        link.driver.stop_receiver(),
        Err(LanternError::Transport(_))
    ));
    assert_eq!(link.driver.state(), DriverState::Disconnected);
    assert!(matches!(link.driver.start_receiver(), Err(LanternError::NotConnected)));
    let packet = link.driver.generate(5, Fields::new()).unwrap();
    assert!(matches!(link.driver.send(packet), Err(LanternError::NotConnected)));
}

#[test]
fn test_failed_receiver_collected_on_start() {
    let mut link = Link::inproc("collect");
    link.context.terminate();
    thread::sleep(Duration::from_millis(50));
    assert!(matches!(link.driver.start_receiver(), Err(LanternError::Transport(_))));
    assert_eq!(link.driver.state(), DriverState::Disconnected);
    link.driver.disconnect().unwrap();
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[test]
fn test_udp_link() {
    let tc = format!("udp://127.0.0.1:{}", free_udp_port());
    let tm = format!("udp://127.0.0.1:{}", free_udp_port());
    let context = TransportContext::new();
    let mut device_tc = context.subscriber(&tc).unwrap();

    let mut driver = TransportDriver::new(config(tc, tm.clone()), context.clone()).unwrap();
    driver.connect().unwrap();
    driver.start_receiver().unwrap();
    let codec = driver.codec().clone();

    let sent = driver.command(1, fields! { "message" => vec![1u8, 2, 3] }).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    let bytes = loop {
        if let Some(bytes) = device_tc.try_recv().unwrap() {
            break bytes;
        }
        assert!(Instant::now() < deadline, "telecommand not received");
        thread::sleep(Duration::from_millis(1));
    };
    // Direction bit, packet id 0, payload of command id plus three bytes
    assert_eq!(bytes[0], 0x81);
    assert_eq!(&bytes[9..], &[1u8, 1, 2, 3]);
    assert_eq!(codec.unpack(&bytes).unwrap(), sent);

    let mut device_tm = context.publisher(&tm).unwrap();
    device_tm.publish(&eack(&codec, &sent, "OK")).unwrap();
    driver.validate_last_tc(Duration::from_secs(2)).unwrap();
}
