//! Client against the simulator over an in-process bus

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::NaiveDate;
use lanternlib::{BoardConfig, ConnectionConfig, LanternClient, LinkConfig, TransportContext};
use lanternlibgs::{Descriptors, LanternError};
use lanternsim::device::FIRMWARE_VERSION;
use lanternsim::{Sequence, Simulator};

const TIMEOUT: Duration = Duration::from_secs(2);

struct Bench {
    client: LanternClient,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Simulator>>,
}

impl Bench {
    fn start(name: &str) -> Self {
        Self::start_with(name, |_| {})
    }

    fn start_with<F: FnOnce(&mut Simulator)>(name: &str, setup: F) -> Self {
        let context = TransportContext::new();
        let config = LinkConfig::new(
            1,
            ConnectionConfig {
                tc_endpoint: format!("inproc://{}-tc", name),
                tm_endpoint: format!("inproc://{}-tm", name),
            },
            Descriptors::in_folder(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../schemas")),
        );

        let mut simulator = Simulator::new(&config, &context)
            .unwrap()
            .with_hk_interval(Duration::from_millis(50));
        setup(&mut simulator);

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let handle = thread::spawn(move || {
            simulator.run(r).unwrap();
            simulator
        });

        let client = LanternClient::connect(config, context)
            .unwrap()
            .with_ack_timeout(TIMEOUT);
        Self {
            client,
            running,
            handle: Some(handle),
        }
    }

    fn stop(mut self) -> Simulator {
        self.running.store(false, Ordering::SeqCst);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for Bench {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_echo() {
    let mut bench = Bench::start("echo");
    assert_eq!(bench.client.echo(&[1, 2, 3]).unwrap(), vec![1, 2, 3]);
    assert_eq!(bench.client.echo(&[42]).unwrap(), vec![42]);

    let record = bench.client.driver().ledger().last_tc().unwrap().unwrap();
    assert_eq!(record.packet_id, 1);
    assert_eq!(record.replies.len(), 1);
    assert_eq!(record.ack.unwrap().error_name(), Some("OK"));
}

#[test]
fn test_readings() {
    let mut bench = Bench::start("readings");

    let version = bench.client.get_version().unwrap();
    assert_eq!(version.version, FIRMWARE_VERSION);
    assert_eq!(version.name, "lanternsim");

    assert!((bench.client.get_temperature().unwrap() - 21.5).abs() < 1e-6);
    assert!((bench.client.get_voltage_hv().unwrap() - 150.0).abs() < 1e-6);
    assert!((bench.client.get_voltage_5v().unwrap() - 5.0).abs() < 1e-6);
}

#[test]
fn test_piezo() {
    let mut bench = Bench::start("piezo");
    bench.client.move_piezo(1.5, -2.25).unwrap();
    assert_eq!(bench.client.get_piezo_position().unwrap(), (1.5, -2.25));

    let sim = bench.stop();
    assert_eq!(sim.device().piezo, (1.5, -2.25));
}

#[test]
fn test_datetime() {
    let mut bench = Bench::start("datetime");
    let when = NaiveDate::from_ymd_opt(2026, 3, 14)
        .unwrap()
        .and_hms_opt(15, 9, 26)
        .unwrap();
    bench.client.set_datetime(when).unwrap();
    assert_eq!(bench.client.get_datetime().unwrap(), when);
}

#[test]
fn test_switches() {
    let mut bench = Bench::start("switches");
    bench.client.switch_control_loop(true).unwrap();
    bench.client.switch_hk_data(false).unwrap();
    bench.client.reset_modulation_loop().unwrap();

    let sim = bench.stop();
    assert!(sim.device().control_loop);
    assert!(!sim.device().hk_enabled);
}

#[test]
fn test_retrieve_sequence() {
    let xmod: Vec<f32> = (0..500).map(|i| i as f32 * 0.5).collect();
    let ymod: Vec<f32> = (0..500).map(|i| -(i as f32)).collect();
    let stored = Sequence {
        xmod: xmod.clone(),
        ymod: ymod.clone(),
    };
    let mut bench = Bench::start_with("retrieve", |sim| sim.device_mut().store(2, stored));

    let (x, y) = bench.client.retrieve_modulation_sequence(2, TIMEOUT).unwrap();
    assert_eq!(x.len(), 500);
    assert_eq!(x, xmod.iter().map(|v| *v as f64).collect::<Vec<_>>());
    assert_eq!(y, ymod.iter().map(|v| *v as f64).collect::<Vec<_>>());

    // Fragments arrived last first and were placed by start index
    let record = bench.client.driver().ledger().last_tc().unwrap().unwrap();
    assert_eq!(record.replies.len(), 3);
}

#[test]
fn test_upload_then_retrieve() {
    let mut bench = Bench::start("upload");
    let xmod: Vec<f32> = (0..625).map(|i| (i as f32).sin()).collect();
    let ymod: Vec<f32> = (0..625).map(|i| (i as f32).cos()).collect();

    bench
        .client
        .upload_modulation_sequence(4, &xmod, &ymod, TIMEOUT)
        .unwrap();
    let (x, y) = bench.client.retrieve_modulation_sequence(4, TIMEOUT).unwrap();
    assert_eq!(x, xmod.iter().map(|v| *v as f64).collect::<Vec<_>>());
    assert_eq!(y, ymod.iter().map(|v| *v as f64).collect::<Vec<_>>());

    let sim = bench.stop();
    assert!(!sim.device().flashing);
    assert!(!sim.device().modulation);
}

#[test]
fn test_upload_rejects_bad_arguments() {
    let mut bench = Bench::start("upload-args");
    let long = vec![0.0f32; 626];
    assert!(matches!(
        bench.client.upload_modulation_sequence(1, &long, &long, TIMEOUT),
        Err(LanternError::InvalidArgument(_))
    ));
    assert!(matches!(
        bench.client.upload_modulation_sequence(1, &[1.0], &[], TIMEOUT),
        Err(LanternError::InvalidArgument(_))
    ));
    assert!(matches!(
        bench.client.retrieve_modulation_sequence(0, TIMEOUT),
        Err(LanternError::InvalidArgument(_))
    ));
    // Nothing was sent
    assert_eq!(bench.client.driver().ledger().len_tc().unwrap(), 0);
}

#[test]
fn test_upload_outside_flashing_mode_rejected() {
    let mut bench = Bench::start("no-flash");
    let err = bench
        .client
        .set_modulation_sequence(0, &[1.0], &[2.0])
        .unwrap_err();
    assert!(matches!(err, LanternError::Rejected(ref name) if name == "ERR_BUSY"));
}

#[test]
fn test_busy_device() {
    let mut bench = Bench::start_with("busy", |sim| sim.device_mut().set_busy(true));
    let err = bench.client.get_temperature().unwrap_err();
    assert!(err.to_string().contains("ERR_BUSY"));
}

#[test]
fn test_housekeeping_logged() {
    let bench = Bench::start("hk");
    thread::sleep(Duration::from_millis(300));

    let telemetry = bench.client.driver().ledger().telemetry().unwrap();
    let hk: Vec<_> = telemetry
        .iter()
        .filter(|p| p.packet_type() == Some(4))
        .collect();
    assert!(!hk.is_empty());
    assert!(hk.iter().all(|p| p.data.contains_key("counter")));
}

#[test]
fn test_download_dataset() {
    let mut bench = Bench::start("dataset");
    bench.client.move_piezo(1000.0, 2000.0).unwrap();

    let dataset = bench
        .client
        .download_dataset(120, 2, Duration::from_millis(20), TIMEOUT)
        .unwrap();
    assert_eq!(dataset.len(), 120);
    assert_eq!(dataset.counter[..3], [0, 2, 4]);
    assert_eq!(*dataset.counter.last().unwrap(), 238);
    assert!(dataset.xcom.iter().all(|c| *c == 1000));
    assert!(dataset.ypos.iter().all(|p| *p == 2000.0));

    // Rows arrived in three fragments of at most 50
    let record = bench.client.driver().ledger().last_tc().unwrap().unwrap();
    assert_eq!(record.replies.len(), 3);

    let sim = bench.stop();
    assert_eq!(sim.device().max_counter_to_save, 240);
    assert_eq!(sim.device().decimation, 2);
}

#[test]
fn test_dataset_counter_overflow_rejected() {
    let mut bench = Bench::start("dataset-overflow");
    assert!(matches!(
        bench.client.download_dataset(u32::MAX, 2, Duration::ZERO, TIMEOUT),
        Err(LanternError::InvalidArgument(_))
    ));
    assert_eq!(bench.client.driver().ledger().len_tc().unwrap(), 0);
}

#[test]
fn test_configuration_file_reboot() {
    let mut bench = Bench::start("board-config");
    let config = BoardConfig {
        name: "bench".to_string(),
        decimation: 1,
        piezo_command_upper_limit: 65535,
        hk_active_on_boot: 1,
        control_active_on_boot: 1,
        piezo_x_setpoint_on_boot: 300.0,
        piezo_y_setpoint_on_boot: 400.0,
        ..BoardConfig::default()
    };
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&config).unwrap().as_bytes())
        .unwrap();

    assert_eq!(bench.client.get_version().unwrap().name, "lanternsim");
    bench
        .client
        .upload_configuration_file(2, file.path(), true)
        .unwrap();

    let version = bench.client.get_version().unwrap();
    assert_eq!(version.name, "bench");
    assert_eq!(version.version, FIRMWARE_VERSION);
    assert_eq!(bench.client.get_piezo_position().unwrap(), (300.0, 400.0));

    let sim = bench.stop();
    assert!(sim.device().control_loop);
    assert_eq!(sim.device().boot_config, 2);
}

#[test]
fn test_configuration_slot_checked() {
    let mut bench = Bench::start("board-config-slot");
    let config = BoardConfig {
        name: "bench".to_string(),
        decimation: 1,
        ..BoardConfig::default()
    };
    assert!(matches!(
        bench.client.upload_config(4, &config),
        Err(LanternError::InvalidArgument(_))
    ));
    // Slot 3 was never uploaded, so the device refuses to boot from it
    let err = bench.client.use_config_on_next_boot(3).unwrap_err();
    assert!(matches!(err, LanternError::Rejected(ref name) if name == "ERR_INVALID_PARAMETER"));
}

#[test]
fn test_pointing_commands() {
    let mut bench = Bench::start("pointing");
    bench.client.set_target_coords(6.0, 0.0).unwrap();
    bench.client.set_lst_seconds(6.0 * 3600.0).unwrap();
    bench.client.switch_tracking(true).unwrap();

    assert_eq!(bench.client.get_target_coords().unwrap(), (6.0, 0.0));
    assert_eq!(bench.client.get_lst_seconds().unwrap(), 21600.0);
    assert!(bench.client.get_tracking().unwrap());
    assert!(bench.client.get_parangle().unwrap().abs() < 1e-3);
    assert!(matches!(
        bench.client.set_lst_seconds(-1.0),
        Err(LanternError::InvalidArgument(_))
    ));
}

#[test]
fn test_modulation_settings() {
    let stored = Sequence {
        xmod: vec![1.0, 2.0],
        ymod: vec![3.0, 4.0],
    };
    let mut bench = Bench::start_with("modulation", |sim| sim.device_mut().store(5, stored));

    assert_eq!(bench.client.get_modulation_sequence_id().unwrap(), 0);
    bench.client.load_sequence_from_flash(5).unwrap();
    assert_eq!(bench.client.get_modulation_sequence_id().unwrap(), 5);
    let err = bench.client.load_sequence_from_flash(4).unwrap_err();
    assert!(matches!(err, LanternError::Rejected(ref name) if name == "ERR_FLASH"));

    bench.client.set_modulation_scale(0.25).unwrap();
    assert_eq!(bench.client.get_modulation_scale().unwrap(), 0.25);
    bench.client.set_modulation_prescaler(8).unwrap();
    assert_eq!(bench.client.get_modulation_prescaler().unwrap(), 8);
    bench.client.set_modulation_offset(&[0.5, 1.5], &[-0.5, -1.5]).unwrap();
    bench.client.switch_closed_loop(true).unwrap();
    bench.client.switch_control_data(true).unwrap();
    bench.client.start_output_trigger(12).unwrap();

    bench.client.move_piezo(500.0, 600.0).unwrap();
    bench.client.delta_move_piezo(-100.0, 50.0).unwrap();
    assert_eq!(bench.client.get_piezo_command().unwrap(), (400, 650));

    let sim = bench.stop();
    let device = sim.device();
    assert_eq!(device.offsets.ymod, vec![-0.5, -1.5]);
    assert!(device.closed_loop && device.control_data);
    assert_eq!(device.output_trigger, Some(12));
}
