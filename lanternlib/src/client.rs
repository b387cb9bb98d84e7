//! High-level client interface for lanternlib
//!
//! Provides typed methods for the command catalogue on top of a
//! [`TransportDriver`], plus the multi-packet transfers: modulation
//! sequences, control data downloads and board configuration uploads.

use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use lanternlibgs::{
    crc32, fields, CommandKind, Fields, LanternError, LanternResult, Value, DEFAULT_BOARD_CONFIG,
    MAX_MODULATION_POINTS, MODULATION_POINTS_PER_PACKET, MODULATION_SEQUENCES,
};

use crate::board_config::{check_config_id, BoardConfig};

use crate::config::constants::DEFAULT_ACK_TIMEOUT;
use crate::config::LinkConfig;
use crate::driver::TransportDriver;
use crate::ledger::CommandRecord;
use crate::reassembly::{concatenate, covered_points, reassemble, received_rows};
use crate::transport::TransportContext;

const START_FIELD: &str = "startpoint";
const SERIES_FIELDS: [&str; 2] = ["xmod", "ymod"];
const DATA_FIELDS: [&str; 10] = [
    "counter",
    "microseconds",
    "xcom",
    "ycom",
    "xpos",
    "ypos",
    "xset",
    "yset",
    "xset_shaped",
    "yset_shaped",
];

/// Seconds in a sidereal day as counted by the electronics
pub const LST_SECONDS_PER_DAY: f32 = 86_400.0;

/// Firmware version reported by the electronics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    /// Name of the configuration in use
    pub name: String,
}

/// Control loop samples saved by the electronics, one entry per row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlDataset {
    pub counter: Vec<u32>,
    /// Time of each sample in microseconds
    pub microseconds: Vec<u32>,
    /// Piezo DAC commands
    pub xcom: Vec<u16>,
    pub ycom: Vec<u16>,
    /// Strain gauge positions
    pub xpos: Vec<f64>,
    pub ypos: Vec<f64>,
    pub xset: Vec<f64>,
    pub yset: Vec<f64>,
    pub xset_shaped: Vec<f64>,
    pub yset_shaped: Vec<f64>,
}

impl ControlDataset {
    pub fn len(&self) -> usize {
        self.counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counter.is_empty()
    }

    fn from_series(mut series: std::collections::BTreeMap<String, Vec<f64>>) -> Self {
        let mut take = |name: &str| series.remove(name).unwrap_or_default();
        Self {
            counter: take("counter").into_iter().map(|v| v as u32).collect(),
            microseconds: take("microseconds").into_iter().map(|v| v as u32).collect(),
            xcom: take("xcom").into_iter().map(|v| v as u16).collect(),
            ycom: take("ycom").into_iter().map(|v| v as u16).collect(),
            xpos: take("xpos"),
            ypos: take("ypos"),
            xset: take("xset"),
            yset: take("yset"),
            xset_shaped: take("xset_shaped"),
            yset_shaped: take("yset_shaped"),
        }
    }
}

/// High-level client for the lantern electronics
pub struct LanternClient {
    driver: TransportDriver,
    ack_timeout: Duration,
}

impl LanternClient {
    /// Wrap a driver. The driver should be connected and receiving.
    pub fn new(driver: TransportDriver) -> Self {
        Self {
            driver,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    /// Create a driver for `config`, connect it and start receiving
    pub fn connect(config: LinkConfig, context: TransportContext) -> LanternResult<Self> {
        let mut driver = TransportDriver::new(config, context)?;
        driver.connect()?;
        driver.start_receiver()?;
        Ok(Self::new(driver))
    }

    /// Time allowed for each execution acknowledgment
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Send a command and wait for its acknowledgment, and for its first
    /// reply when the command has one
    pub fn execute(&mut self, command_id: i64, params: Fields) -> LanternResult<CommandRecord> {
        self.execute_within(command_id, params, self.ack_timeout)
    }

    fn execute_within(
        &mut self,
        command_id: i64,
        params: Fields,
        timeout: Duration,
    ) -> LanternResult<CommandRecord> {
        self.driver.command(command_id, params)?;
        let ledger = self.driver.ledger();
        if self.driver.codec().schemas().has_reply(command_id) {
            ledger.wait_last_reply(timeout, |replies| !replies.is_empty())
        } else {
            ledger.validate_last_tc(timeout)?;
            ledger.last_tc()?.ok_or(LanternError::NoCommand)
        }
    }

    fn run(&mut self, kind: CommandKind, params: Fields) -> LanternResult<CommandRecord> {
        self.execute(kind.to_u8() as i64, params)
    }

    fn query(&mut self, kind: CommandKind) -> LanternResult<Fields> {
        let record = self.run(kind, Fields::new())?;
        first_reply(&record)
    }

    /// Send bytes and receive them back
    pub fn echo(&mut self, message: &[u8]) -> LanternResult<Vec<u8>> {
        let params = fields! { "message" => message.to_vec() };
        let record = self.run(CommandKind::Echo, params)?;
        let reply = first_reply(&record)?;
        byte_field(&reply, "message")
    }

    pub fn switch_flashing_mode(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchFlashingMode, fields! { "state" => state })
            .map(|_| ())
    }

    pub fn switch_modulation_loop(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchModulationLoop, fields! { "state" => state })
            .map(|_| ())
    }

    pub fn reset_modulation_loop(&mut self) -> LanternResult<()> {
        self.run(CommandKind::ResetModulationLoop, Fields::new()).map(|_| ())
    }

    pub fn get_version(&mut self) -> LanternResult<Version> {
        let reply = self.query(CommandKind::GetVersion)?;
        let name = byte_field(&reply, "name")?;
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        Ok(Version {
            version: int_field(&reply, "version")? as u32,
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
        })
    }

    /// Board temperature in degrees Celsius
    pub fn get_temperature(&mut self) -> LanternResult<f64> {
        let reply = self.query(CommandKind::GetTemperature)?;
        float_field(&reply, "temperature")
    }

    /// Piezo high voltage line
    pub fn get_voltage_hv(&mut self) -> LanternResult<f64> {
        let reply = self.query(CommandKind::GetVoltageHv)?;
        float_field(&reply, "voltage")
    }

    pub fn get_voltage_5v(&mut self) -> LanternResult<f64> {
        let reply = self.query(CommandKind::GetVoltage5v)?;
        float_field(&reply, "voltage")
    }

    /// Set the piezo setpoint
    pub fn move_piezo(&mut self, x: f32, y: f32) -> LanternResult<()> {
        self.run(CommandKind::MovePiezo, fields! { "x" => x, "y" => y })
            .map(|_| ())
    }

    /// Piezo position measured by the strain gauges
    pub fn get_piezo_position(&mut self) -> LanternResult<(f64, f64)> {
        let reply = self.query(CommandKind::GetPiezoPosition)?;
        Ok((float_field(&reply, "x_pos")?, float_field(&reply, "y_pos")?))
    }

    /// Request a stored sequence. Fragments keep arriving after the first one;
    /// see [`LanternClient::retrieve_modulation_sequence`].
    pub fn get_modulation_sequence(&mut self, sequence: u8) -> LanternResult<CommandRecord> {
        self.run(CommandKind::GetModulationSequence, fields! { "sequence" => sequence })
    }

    /// Write points `startpoint..startpoint + xmod.len()` of the RAM sequence
    pub fn set_modulation_sequence(&mut self, startpoint: u16, xmod: &[f32], ymod: &[f32]) -> LanternResult<()> {
        if xmod.len() != ymod.len() {
            return Err(LanternError::invalid_argument("xmod and ymod differ in length"));
        }
        let params = fields! {
            "startpoint" => startpoint,
            "npoints" => xmod.len(),
            "xmod" => xmod.to_vec(),
            "ymod" => ymod.to_vec(),
        };
        self.run(CommandKind::SetModulationSequence, params).map(|_| ())
    }

    /// Copy the RAM sequence to flash slot `sequence`
    pub fn flash_sequence(&mut self, sequence: u8, npoints: u16, xcrc: u32, ycrc: u32) -> LanternResult<()> {
        let params = fields! {
            "sequence" => sequence,
            "npoints" => npoints,
            "xcrc" => xcrc,
            "ycrc" => ycrc,
        };
        self.run(CommandKind::FlashSequence, params).map(|_| ())
    }

    pub fn software_reboot(&mut self) -> LanternResult<()> {
        self.run(CommandKind::SoftwareReboot, Fields::new()).map(|_| ())
    }

    pub fn switch_control_loop(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchControlLoop, fields! { "state" => state })
            .map(|_| ())
    }

    pub fn switch_hk_data(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchHkData, fields! { "state" => state })
            .map(|_| ())
    }

    /// Set the real time clock
    pub fn set_datetime(&mut self, datetime: NaiveDateTime) -> LanternResult<()> {
        let year = u16::try_from(datetime.year())
            .map_err(|_| LanternError::invalid_argument(format!("year {} out of range", datetime.year())))?;
        let params = fields! {
            "year" => year,
            "month" => datetime.month(),
            "day" => datetime.day(),
            "hour" => datetime.hour(),
            "minute" => datetime.minute(),
            "second" => datetime.second(),
        };
        self.run(CommandKind::SetDatetime, params).map(|_| ())
    }

    /// Set the real time clock to the current UTC time
    pub fn set_datetime_now(&mut self) -> LanternResult<()> {
        self.set_datetime(Utc::now().naive_utc())
    }

    pub fn get_datetime(&mut self) -> LanternResult<NaiveDateTime> {
        let reply = self.query(CommandKind::GetDatetime)?;
        let part = |name: &str| -> LanternResult<u32> { Ok(int_field(&reply, name)? as u32) };
        NaiveDate::from_ymd_opt(int_field(&reply, "year")? as i32, part("month")?, part("day")?)
            .and_then(|date| date.and_hms_opt(part("hour").ok()?, part("minute").ok()?, part("second").ok()?))
            .ok_or_else(|| LanternError::malformed(format!("invalid date in reply: {:?}", reply)))
    }

    /// Make flash slot `sequence` the running modulation sequence
    pub fn load_sequence_from_flash(&mut self, sequence: u8) -> LanternResult<()> {
        check_sequence(sequence)?;
        self.run(CommandKind::LoadSequenceFromFlash, fields! { "sequence" => sequence })
            .map(|_| ())
    }

    /// Flash slot of the running modulation sequence, 0 when none was loaded
    pub fn get_modulation_sequence_id(&mut self) -> LanternResult<u8> {
        let reply = self.query(CommandKind::GetModulationSequenceId)?;
        Ok(int_field(&reply, "sequence")? as u8)
    }

    /// Offset added to the first `x_offset.len()` modulation points
    pub fn set_modulation_offset(&mut self, x_offset: &[f32], y_offset: &[f32]) -> LanternResult<()> {
        if x_offset.len() != y_offset.len() {
            return Err(LanternError::invalid_argument("x_offset and y_offset differ in length"));
        }
        let npoints = u8::try_from(x_offset.len()).map_err(|_| {
            LanternError::invalid_argument(format!("{} offset points exceed 255", x_offset.len()))
        })?;
        let params = fields! {
            "npoints" => npoints,
            "x_offset" => x_offset.to_vec(),
            "y_offset" => y_offset.to_vec(),
        };
        self.run(CommandKind::SetModulationOffset, params).map(|_| ())
    }

    pub fn get_modulation_scale(&mut self) -> LanternResult<f64> {
        let reply = self.query(CommandKind::GetModulationScale)?;
        float_field(&reply, "scale")
    }

    /// Factor applied to every modulation point
    pub fn set_modulation_scale(&mut self, scale: f32) -> LanternResult<()> {
        self.run(CommandKind::SetModulationScale, fields! { "scale" => scale })
            .map(|_| ())
    }

    pub fn get_modulation_prescaler(&mut self) -> LanternResult<u16> {
        let reply = self.query(CommandKind::GetModulationPrescaler)?;
        Ok(int_field(&reply, "prescaler")? as u16)
    }

    /// Number of modulation periods spent on each point
    pub fn set_modulation_prescaler(&mut self, prescaler: u16) -> LanternResult<()> {
        self.run(CommandKind::SetModulationPrescaler, fields! { "prescaler" => prescaler })
            .map(|_| ())
    }

    /// Close or open the position loop around the strain gauges
    pub fn switch_closed_loop(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchClosedLoop, fields! { "state" => state })
            .map(|_| ())
    }

    pub fn switch_control_data(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchControlData, fields! { "state" => state })
            .map(|_| ())
    }

    /// Move the piezo setpoint by a relative amount
    pub fn delta_move_piezo(&mut self, dx: f32, dy: f32) -> LanternResult<()> {
        self.run(CommandKind::DeltaMovePiezo, fields! { "dx" => dx, "dy" => dy })
            .map(|_| ())
    }

    /// DAC commands currently driving the piezo
    pub fn get_piezo_command(&mut self) -> LanternResult<(u16, u16)> {
        let reply = self.query(CommandKind::GetPiezoCommand)?;
        Ok((int_field(&reply, "x_com")? as u16, int_field(&reply, "y_com")? as u16))
    }

    /// Emit a trigger `delay` ms after each modulation move
    pub fn start_output_trigger(&mut self, delay: u16) -> LanternResult<()> {
        self.run(CommandKind::StartOutputTrigger, fields! { "delay" => delay })
            .map(|_| ())
    }

    pub fn stop_output_trigger(&mut self) -> LanternResult<()> {
        self.run(CommandKind::StopOutputTrigger, Fields::new()).map(|_| ())
    }

    /// Local sidereal time in seconds
    pub fn get_lst_seconds(&mut self) -> LanternResult<f64> {
        let reply = self.query(CommandKind::GetLstSeconds)?;
        float_field(&reply, "seconds")
    }

    pub fn set_lst_seconds(&mut self, seconds: f32) -> LanternResult<()> {
        if !(0.0..=LST_SECONDS_PER_DAY).contains(&seconds) {
            return Err(LanternError::invalid_argument(format!(
                "{} seconds outside one sidereal day",
                seconds
            )));
        }
        self.run(CommandKind::SetLstSeconds, fields! { "seconds" => seconds })
            .map(|_| ())
    }

    pub fn get_tracking(&mut self) -> LanternResult<bool> {
        let reply = self.query(CommandKind::GetTracking)?;
        field(&reply, "state")?
            .as_bool()
            .ok_or_else(|| LanternError::malformed("'state' is not a boolean"))
    }

    /// Follow the parallactic angle of the target
    pub fn switch_tracking(&mut self, state: bool) -> LanternResult<()> {
        self.run(CommandKind::SwitchTracking, fields! { "state" => state })
            .map(|_| ())
    }

    /// Right ascension in hours and declination in degrees
    pub fn get_target_coords(&mut self) -> LanternResult<(f64, f64)> {
        let reply = self.query(CommandKind::GetTargetCoords)?;
        Ok((float_field(&reply, "ra")?, float_field(&reply, "dec")?))
    }

    pub fn set_target_coords(&mut self, ra: f32, dec: f32) -> LanternResult<()> {
        self.run(CommandKind::SetTargetCoords, fields! { "ra" => ra, "dec" => dec })
            .map(|_| ())
    }

    /// Parallactic angle of the target in degrees
    pub fn get_parangle(&mut self) -> LanternResult<f64> {
        let reply = self.query(CommandKind::GetParangle)?;
        float_field(&reply, "parangle")
    }

    /// Request the saved control data. Fragments keep arriving after the
    /// first one; see [`LanternClient::download_dataset`].
    pub fn download_data(&mut self) -> LanternResult<CommandRecord> {
        self.run(CommandKind::DownloadData, Fields::new())
    }

    /// Restart the saved control data from counter 0
    pub fn reset_control_data_counter(&mut self) -> LanternResult<()> {
        self.run(CommandKind::ResetControlDataCounter, Fields::new()).map(|_| ())
    }

    /// Last counter saved in the data buffer, `u32::MAX` to save forever
    pub fn set_max_counter_to_save(&mut self, counter: u32) -> LanternResult<()> {
        self.run(CommandKind::SetMaxCounterToSave, fields! { "counter" => counter })
            .map(|_| ())
    }

    /// Save one control loop sample in `decimation`
    pub fn set_decimation(&mut self, decimation: u16) -> LanternResult<()> {
        if decimation == 0 {
            return Err(LanternError::invalid_argument("decimation must be at least 1"));
        }
        self.run(CommandKind::SetDecimation, fields! { "decimation" => decimation })
            .map(|_| ())
    }

    /// Store a board configuration in slot `config_id`
    pub fn upload_config(&mut self, config_id: u8, config: &BoardConfig) -> LanternResult<()> {
        let params = config.to_params(config_id)?;
        self.run(CommandKind::UploadConfig, params).map(|_| ())
    }

    /// Select the configuration used from the next boot on: a slot, or
    /// [`DEFAULT_BOARD_CONFIG`] for the built-in defaults
    pub fn use_config_on_next_boot(&mut self, config_id: u8) -> LanternResult<()> {
        if config_id != DEFAULT_BOARD_CONFIG {
            check_config_id(config_id)?;
        }
        self.run(CommandKind::UseConfigOnNextBoot, fields! { "config_id" => config_id })
            .map(|_| ())
    }

    /// Read a stored modulation sequence, reassembling its reply fragments
    pub fn retrieve_modulation_sequence(
        &mut self,
        sequence: u8,
        timeout: Duration,
    ) -> LanternResult<(Vec<f64>, Vec<f64>)> {
        check_sequence(sequence)?;
        self.driver
            .command(CommandKind::GetModulationSequence.to_u8() as i64, fields! { "sequence" => sequence })?;

        let record = self.driver.ledger().wait_last_reply(timeout, |replies| {
            match replies.first().and_then(|r| r.reply_data()).and_then(|d| int_field(d, "npoints").ok()) {
                Some(npoints) => covered_points(replies, START_FIELD, SERIES_FIELDS[0]) >= npoints as usize,
                None => false,
            }
        })?;

        let npoints = record
            .replies
            .first()
            .and_then(|r| r.reply_data())
            .ok_or_else(|| LanternError::Incomplete("no reply".to_string()))
            .and_then(|d| int_field(d, "npoints"))? as usize;
        let mut series = reassemble(&record.replies, START_FIELD, &SERIES_FIELDS, npoints)?;
        debug!(
            "Sequence {} retrieved in {} fragments",
            sequence,
            record.replies.len()
        );

        let xmod = series.remove(SERIES_FIELDS[0]).unwrap_or_default();
        let ymod = series.remove(SERIES_FIELDS[1]).unwrap_or_default();
        Ok((xmod, ymod))
    }

    /// Store a modulation sequence in flash slot `sequence`
    ///
    /// Stops the modulation, enters flashing mode, uploads the points in
    /// packets of [`MODULATION_POINTS_PER_PACKET`], flashes them with the CRC
    /// of each series and leaves flashing mode. Every step must be
    /// acknowledged within `timeout`.
    pub fn upload_modulation_sequence(
        &mut self,
        sequence: u8,
        xmod: &[f32],
        ymod: &[f32],
        timeout: Duration,
    ) -> LanternResult<()> {
        check_sequence(sequence)?;
        if xmod.len() != ymod.len() {
            return Err(LanternError::invalid_argument("xmod and ymod should be of same length"));
        }
        if xmod.len() > MAX_MODULATION_POINTS {
            return Err(LanternError::invalid_argument(format!(
                "modulation sequence of {} points exceeds the limit of {}",
                xmod.len(),
                MAX_MODULATION_POINTS
            )));
        }

        let previous = self.ack_timeout;
        self.ack_timeout = timeout;
        let result = self.upload_steps(sequence, xmod, ymod);
        self.ack_timeout = previous;
        result
    }

    fn upload_steps(&mut self, sequence: u8, xmod: &[f32], ymod: &[f32]) -> LanternResult<()> {
        self.switch_modulation_loop(false)?;
        self.switch_flashing_mode(true)?;

        for (index, (x, y)) in xmod
            .chunks(MODULATION_POINTS_PER_PACKET)
            .zip(ymod.chunks(MODULATION_POINTS_PER_PACKET))
            .enumerate()
        {
            let startpoint = (index * MODULATION_POINTS_PER_PACKET) as u16;
            self.set_modulation_sequence(startpoint, x, y)?;
        }

        let xcrc = series_crc(xmod);
        let ycrc = series_crc(ymod);
        self.flash_sequence(sequence, xmod.len() as u16, xcrc, ycrc)?;
        self.switch_flashing_mode(false)?;
        info!("Sequence {} flashed with {} points", sequence, xmod.len());
        Ok(())
    }

    /// Record a control dataset of `npoints` rows, one sample in `decimation`
    ///
    /// Sets the buffer limit and the decimation, restarts the counter, lets
    /// the control loop run for `settle`, then downloads the buffer. Rows are
    /// concatenated in arrival order once `npoints` have arrived within
    /// `timeout`.
    pub fn download_dataset(
        &mut self,
        npoints: u32,
        decimation: u16,
        settle: Duration,
        timeout: Duration,
    ) -> LanternResult<ControlDataset> {
        let max_counter = npoints.checked_mul(decimation as u32).ok_or_else(|| {
            LanternError::invalid_argument(format!(
                "{} points at decimation {} overflow the counter",
                npoints, decimation
            ))
        })?;
        self.set_max_counter_to_save(max_counter)?;
        self.set_decimation(decimation)?;
        self.reset_control_data_counter()?;
        thread::sleep(settle);

        self.driver.command(CommandKind::DownloadData.to_u8() as i64, Fields::new())?;
        let record = self.driver.ledger().wait_last_reply(timeout, |replies| {
            !replies.is_empty() && received_rows(replies, DATA_FIELDS[0]) >= npoints as usize
        })?;

        let dataset = ControlDataset::from_series(concatenate(&record.replies, &DATA_FIELDS)?);
        debug!(
            "Dataset of {} rows downloaded in {} fragments",
            dataset.len(),
            record.replies.len()
        );
        Ok(dataset)
    }

    /// Upload a configuration file to slot `config_id`
    ///
    /// With `reboot`, the slot is selected for the next boot and the board is
    /// rebooted into it.
    pub fn upload_configuration_file<P: AsRef<Path>>(
        &mut self,
        config_id: u8,
        path: P,
        reboot: bool,
    ) -> LanternResult<()> {
        check_config_id(config_id)?;
        let config = BoardConfig::load(path)?;
        self.upload_config(config_id, &config)?;
        info!("Configuration '{}' stored in slot {}", config.name, config_id);
        if reboot {
            self.use_config_on_next_boot(config_id)?;
            self.software_reboot()?;
        }
        Ok(())
    }

    pub fn driver(&self) -> &TransportDriver {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut TransportDriver {
        &mut self.driver
    }

    /// Stop receiving and release the endpoints
    pub fn close(mut self) -> LanternResult<()> {
        self.driver.disconnect()
    }
}

/// CRC the electronics compute over a series: CRC-32 of the little-endian
/// `f32` values
pub fn series_crc(series: &[f32]) -> u32 {
    let bytes: Vec<u8> = series.iter().flat_map(|v| v.to_le_bytes()).collect();
    crc32(&bytes)
}

fn check_sequence(sequence: u8) -> LanternResult<()> {
    if !MODULATION_SEQUENCES.contains(&sequence) {
        return Err(LanternError::invalid_argument(format!(
            "sequence {} outside {}..={}",
            sequence,
            MODULATION_SEQUENCES.start(),
            MODULATION_SEQUENCES.end()
        )));
    }
    Ok(())
}

fn first_reply(record: &CommandRecord) -> LanternResult<Fields> {
    record
        .replies
        .first()
        .and_then(|r| r.reply_data())
        .cloned()
        .ok_or_else(|| LanternError::Incomplete(format!("no reply to packet {}", record.packet_id)))
}

fn field<'a>(fields: &'a Fields, name: &str) -> LanternResult<&'a Value> {
    fields
        .get(name)
        .ok_or_else(|| LanternError::malformed(format!("reply without '{}'", name)))
}

fn int_field(fields: &Fields, name: &str) -> LanternResult<i64> {
    field(fields, name)?
        .as_i64()
        .ok_or_else(|| LanternError::malformed(format!("'{}' is not an integer", name)))
}

fn float_field(fields: &Fields, name: &str) -> LanternResult<f64> {
    field(fields, name)?
        .as_f64()
        .ok_or_else(|| LanternError::malformed(format!("'{}' is not a number", name)))
}

/// Bytes of a field decoded as a byte run or as a series of `B` values
fn byte_field(fields: &Fields, name: &str) -> LanternResult<Vec<u8>> {
    let value = field(fields, name)?;
    if let Some(bytes) = value.as_bytes() {
        return Ok(bytes.to_vec());
    }
    let items = match value {
        Value::List(items) => items.clone(),
        other => vec![other.clone()],
    };
    items
        .iter()
        .map(|v| v.as_i64().and_then(|i| u8::try_from(i).ok()))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| LanternError::malformed(format!("'{}' is not a byte series", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_crc() {
        assert_eq!(series_crc(&[]), 0xffff_ffff);
        let bytes: Vec<u8> = [1.0f32, -2.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(series_crc(&[1.0, -2.5]), crc32(&bytes));
    }

    #[test]
    fn test_check_sequence() {
        assert!(check_sequence(1).is_ok());
        assert!(check_sequence(5).is_ok());
        assert!(matches!(check_sequence(0), Err(LanternError::InvalidArgument(_))));
        assert!(matches!(check_sequence(6), Err(LanternError::InvalidArgument(_))));
    }

    #[test]
    fn test_byte_field() {
        let reply = fields! { "a" => vec![1u8, 2, 3], "b" => 7u8, "c" => Value::Bytes(vec![9, 8]) };
        assert_eq!(byte_field(&reply, "a").unwrap(), vec![1, 2, 3]);
        assert_eq!(byte_field(&reply, "b").unwrap(), vec![7]);
        assert_eq!(byte_field(&reply, "c").unwrap(), vec![9, 8]);
        assert!(byte_field(&fields! { "d" => -1 }, "d").is_err());
    }
}
