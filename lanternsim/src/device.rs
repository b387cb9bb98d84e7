//! Simulated state of the lantern electronics
//!
//! The device executes decoded telecommands against an in-memory model and
//! answers with reply payloads and an error name for the execution
//! acknowledgment.

use std::collections::BTreeMap;

use log::{debug, info};

use lanternlib::series_crc;
use lanternlibgs::{
    fields, CommandKind, Fields, Value, BOARD_CONFIGS, DEFAULT_BOARD_CONFIG, MAX_MODULATION_POINTS,
    MODULATION_POINTS_PER_PACKET, MODULATION_SEQUENCES,
};

pub const ERR_OK: &str = "OK";
pub const ERR_BUSY: &str = "ERR_BUSY";
pub const ERR_UNKNOWN_COMMAND: &str = "ERR_UNKNOWN_COMMAND";
pub const ERR_INVALID_PARAMETER: &str = "ERR_INVALID_PARAMETER";
pub const ERR_CRC: &str = "ERR_CRC";
pub const ERR_FLASH: &str = "ERR_FLASH";

/// Firmware version reported by `get_version`
pub const FIRMWARE_VERSION: u32 = 0x0001_0200;

/// Rows the control data buffer holds
pub const DATA_BUFFER_ROWS: usize = 2000;

/// Control data rows carried by one reply packet
pub const DATA_ROWS_PER_PACKET: usize = 50;

/// Period of the simulated control loop
pub const CONTROL_LOOP_PERIOD_US: u32 = 100;

/// Latitude used for the parallactic angle until a configuration sets one
pub const DEFAULT_LATITUDE: f32 = 19.825;

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

/// Result of executing one command
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Reply payloads, sent in this order before the acknowledgment
    pub replies: Vec<Fields>,
    /// Error name of the execution acknowledgment
    pub error: &'static str,
}

impl Outcome {
    fn ok() -> Self {
        Self::error(ERR_OK)
    }

    fn error(error: &'static str) -> Self {
        Self {
            replies: Vec::new(),
            error,
        }
    }

    fn reply(data: Fields) -> Self {
        Self {
            replies: vec![data],
            error: ERR_OK,
        }
    }
}

/// A modulation sequence, one value per axis and point
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequence {
    pub xmod: Vec<f32>,
    pub ymod: Vec<f32>,
}

/// In-memory model of the electronics
#[derive(Debug, Clone)]
pub struct Device {
    pub flashing: bool,
    pub modulation: bool,
    pub control_loop: bool,
    pub hk_enabled: bool,
    pub piezo: (f32, f32),
    pub temperature: f32,
    pub voltage_hv: f32,
    pub voltage_5v: f32,
    /// Sequence being uploaded, indexed by point
    pub ram: Sequence,
    pub flash: BTreeMap<u8, Sequence>,
    pub datetime: [i64; 6],
    pub config_name: String,
    pub closed_loop: bool,
    pub control_data: bool,
    pub tracking: bool,
    pub modulation_scale: f32,
    pub modulation_prescaler: u16,
    /// Offsets added to the first modulation points
    pub offsets: Sequence,
    /// Flash slot of the running sequence, 0 for none
    pub active_sequence: u8,
    pub decimation: u16,
    pub max_counter_to_save: u32,
    /// Delay of the output trigger in ms while it runs
    pub output_trigger: Option<u16>,
    pub lst_seconds: f32,
    /// Right ascension in hours and declination in degrees
    pub target: (f32, f32),
    pub latitude: f32,
    /// Uploaded configurations by slot, as received
    pub configs: BTreeMap<u8, Fields>,
    pub boot_config: u8,
    busy: bool,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            flashing: false,
            modulation: true,
            control_loop: false,
            hk_enabled: true,
            piezo: (0.0, 0.0),
            temperature: 21.5,
            voltage_hv: 150.0,
            voltage_5v: 5.0,
            ram: Sequence {
                xmod: vec![0.0; MAX_MODULATION_POINTS],
                ymod: vec![0.0; MAX_MODULATION_POINTS],
            },
            flash: BTreeMap::new(),
            datetime: [2000, 1, 1, 0, 0, 0],
            config_name: "lanternsim".to_string(),
            closed_loop: false,
            control_data: false,
            tracking: false,
            modulation_scale: 1.0,
            modulation_prescaler: 1,
            offsets: Sequence::default(),
            active_sequence: 0,
            decimation: 1,
            max_counter_to_save: 0,
            output_trigger: None,
            lst_seconds: 0.0,
            target: (0.0, 0.0),
            latitude: DEFAULT_LATITUDE,
            configs: BTreeMap::new(),
            boot_config: DEFAULT_BOARD_CONFIG,
            busy: false,
        }
    }
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    /// While busy every command is refused with `ERR_BUSY`
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Store a sequence directly in flash
    pub fn store(&mut self, slot: u8, sequence: Sequence) {
        self.flash.insert(slot, sequence);
    }

    /// Execute a decoded telecommand payload
    pub fn execute(&mut self, data: &Fields) -> Outcome {
        if self.busy {
            return Outcome::error(ERR_BUSY);
        }

        let command_id = data.get("command_id").and_then(Value::as_i64).unwrap_or(-1);
        let kind = match u8::try_from(command_id).ok().and_then(CommandKind::from_u8) {
            Some(kind) => kind,
            None => return Outcome::error(ERR_UNKNOWN_COMMAND),
        };
        let empty = Fields::new();
        let params = data.get("params").and_then(Value::as_map).unwrap_or(&empty);
        debug!("Executing {} {:?}", kind.name(), params);

        match kind {
            CommandKind::Echo => match params.get("message") {
                Some(message) => Outcome::reply(fields! { "message" => message.clone() }),
                None => Outcome::error(ERR_INVALID_PARAMETER),
            },
            CommandKind::SwitchFlashingMode => self.switch(params, |d, s| d.flashing = s),
            CommandKind::SwitchModulationLoop => self.switch(params, |d, s| d.modulation = s),
            CommandKind::SwitchControlLoop => self.switch(params, |d, s| d.control_loop = s),
            CommandKind::SwitchHkData => self.switch(params, |d, s| d.hk_enabled = s),
            CommandKind::ResetModulationLoop => Outcome::ok(),
            CommandKind::GetVersion => Outcome::reply(fields! {
                "version" => FIRMWARE_VERSION,
                "name" => Value::Bytes(self.config_name.as_bytes().to_vec()),
            }),
            CommandKind::GetTemperature => {
                Outcome::reply(fields! { "temperature" => self.temperature })
            }
            CommandKind::GetVoltageHv => Outcome::reply(fields! { "voltage" => self.voltage_hv }),
            CommandKind::GetVoltage5v => Outcome::reply(fields! { "voltage" => self.voltage_5v }),
            CommandKind::MovePiezo => match (float(params, "x"), float(params, "y")) {
                (Some(x), Some(y)) => {
                    self.piezo = (x, y);
                    Outcome::ok()
                }
                _ => Outcome::error(ERR_INVALID_PARAMETER),
            },
            CommandKind::GetPiezoPosition => Outcome::reply(fields! {
                "x_pos" => self.piezo.0,
                "y_pos" => self.piezo.1,
            }),
            CommandKind::GetModulationSequence => self.get_modulation_sequence(params),
            CommandKind::SetModulationSequence => self.set_modulation_sequence(params),
            CommandKind::FlashSequence => self.flash_sequence(params),
            CommandKind::SoftwareReboot => {
                self.reboot();
                Outcome::ok()
            }
            CommandKind::SetDatetime => {
                let names = ["year", "month", "day", "hour", "minute", "second"];
                let mut datetime = [0i64; 6];
                for (slot, name) in datetime.iter_mut().zip(names) {
                    match params.get(name).and_then(Value::as_i64) {
                        Some(v) => *slot = v,
                        None => return Outcome::error(ERR_INVALID_PARAMETER),
                    }
                }
                self.datetime = datetime;
                Outcome::ok()
            }
            CommandKind::GetDatetime => {
                let [year, month, day, hour, minute, second] = self.datetime;
                Outcome::reply(fields! {
                    "year" => year,
                    "month" => month,
                    "day" => day,
                    "hour" => hour,
                    "minute" => minute,
                    "second" => second,
                })
            }
            CommandKind::LoadSequenceFromFlash => self.load_sequence_from_flash(params),
            CommandKind::GetModulationSequenceId => {
                Outcome::reply(fields! { "sequence" => self.active_sequence })
            }
            CommandKind::SetModulationOffset => self.set_modulation_offset(params),
            CommandKind::GetModulationScale => {
                Outcome::reply(fields! { "scale" => self.modulation_scale })
            }
            CommandKind::SetModulationScale => match float(params, "scale") {
                Some(scale) if scale.is_finite() => {
                    self.modulation_scale = scale;
                    Outcome::ok()
                }
                _ => Outcome::error(ERR_INVALID_PARAMETER),
            },
            CommandKind::GetModulationPrescaler => {
                Outcome::reply(fields! { "prescaler" => self.modulation_prescaler })
            }
            CommandKind::SetModulationPrescaler => {
                match int(params, "prescaler").and_then(|p| u16::try_from(p).ok()) {
                    Some(prescaler) if prescaler > 0 => {
                        self.modulation_prescaler = prescaler;
                        Outcome::ok()
                    }
                    _ => Outcome::error(ERR_INVALID_PARAMETER),
                }
            }
            CommandKind::SwitchClosedLoop => self.switch(params, |d, s| d.closed_loop = s),
            CommandKind::SwitchControlData => self.switch(params, |d, s| d.control_data = s),
            CommandKind::SwitchTracking => self.switch(params, |d, s| d.tracking = s),
            CommandKind::GetTracking => Outcome::reply(fields! { "state" => self.tracking }),
            CommandKind::DeltaMovePiezo => match (float(params, "dx"), float(params, "dy")) {
                (Some(dx), Some(dy)) => {
                    self.piezo = (self.piezo.0 + dx, self.piezo.1 + dy);
                    Outcome::ok()
                }
                _ => Outcome::error(ERR_INVALID_PARAMETER),
            },
            CommandKind::GetPiezoCommand => {
                let (x_com, y_com) = self.piezo_command();
                Outcome::reply(fields! { "x_com" => x_com, "y_com" => y_com })
            }
            CommandKind::StartOutputTrigger => {
                match int(params, "delay").and_then(|d| u16::try_from(d).ok()) {
                    Some(delay) => {
                        self.output_trigger = Some(delay);
                        Outcome::ok()
                    }
                    None => Outcome::error(ERR_INVALID_PARAMETER),
                }
            }
            CommandKind::StopOutputTrigger => {
                self.output_trigger = None;
                Outcome::ok()
            }
            CommandKind::GetLstSeconds => Outcome::reply(fields! { "seconds" => self.lst_seconds }),
            CommandKind::SetLstSeconds => match float(params, "seconds") {
                Some(seconds) if (0.0..=86_400.0).contains(&seconds) => {
                    self.lst_seconds = seconds;
                    Outcome::ok()
                }
                _ => Outcome::error(ERR_INVALID_PARAMETER),
            },
            CommandKind::GetTargetCoords => Outcome::reply(fields! {
                "ra" => self.target.0,
                "dec" => self.target.1,
            }),
            CommandKind::SetTargetCoords => match (float(params, "ra"), float(params, "dec")) {
                (Some(ra), Some(dec))
                    if (0.0..24.0).contains(&ra) && (-90.0..=90.0).contains(&dec) =>
                {
                    self.target = (ra, dec);
                    Outcome::ok()
                }
                _ => Outcome::error(ERR_INVALID_PARAMETER),
            },
            CommandKind::GetParangle => Outcome::reply(fields! { "parangle" => self.parangle() }),
            CommandKind::DownloadData => self.download_data(),
            CommandKind::ResetControlDataCounter => Outcome::ok(),
            CommandKind::SetMaxCounterToSave => {
                match int(params, "counter").and_then(|c| u32::try_from(c).ok()) {
                    Some(counter) => {
                        self.max_counter_to_save = counter;
                        Outcome::ok()
                    }
                    None => Outcome::error(ERR_INVALID_PARAMETER),
                }
            }
            CommandKind::SetDecimation => {
                match int(params, "decimation").and_then(|d| u16::try_from(d).ok()) {
                    Some(decimation) if decimation > 0 => {
                        self.decimation = decimation;
                        Outcome::ok()
                    }
                    _ => Outcome::error(ERR_INVALID_PARAMETER),
                }
            }
            CommandKind::UploadConfig => {
                match int(params, "config_id").and_then(|c| u8::try_from(c).ok()) {
                    Some(slot) if BOARD_CONFIGS.contains(&slot) => {
                        let mut config = params.clone();
                        config.remove("config_id");
                        info!("Stored configuration {}", slot);
                        self.configs.insert(slot, config);
                        Outcome::ok()
                    }
                    _ => Outcome::error(ERR_INVALID_PARAMETER),
                }
            }
            CommandKind::UseConfigOnNextBoot => {
                match int(params, "config_id").and_then(|c| u8::try_from(c).ok()) {
                    Some(slot)
                        if slot == DEFAULT_BOARD_CONFIG || self.configs.contains_key(&slot) =>
                    {
                        self.boot_config = slot;
                        Outcome::ok()
                    }
                    _ => Outcome::error(ERR_INVALID_PARAMETER),
                }
            }
        }
    }

    /// Restart from the defaults, keeping flash and the stored configurations,
    /// then apply the boot configuration
    fn reboot(&mut self) {
        info!("Software reboot");
        let flash = std::mem::take(&mut self.flash);
        let configs = std::mem::take(&mut self.configs);
        let boot_config = self.boot_config;
        *self = Device {
            flash,
            configs,
            boot_config,
            ..Device::default()
        };
        if let Some(config) = self.configs.get(&boot_config).cloned() {
            self.apply_config(&config);
        }
    }

    fn apply_config(&mut self, config: &Fields) {
        let flag = |name: &str| int(config, name).map(|v| v != 0);
        if let Some(name) = config.get("name").and_then(Value::as_bytes) {
            let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
            self.config_name = String::from_utf8_lossy(&name[..end]).into_owned();
        }
        if let Some(state) = flag("hk_active_on_boot") {
            self.hk_enabled = state;
        }
        if let Some(state) = flag("control_active_on_boot") {
            self.control_loop = state;
        }
        if let Some(state) = flag("modulation_active_on_boot") {
            self.modulation = state;
        }
        if let Some(state) = flag("data_active_on_boot") {
            self.control_data = state;
        }
        if let Some(state) = flag("close_loop_on_boot") {
            self.closed_loop = state;
        }
        if let (Some(x), Some(y)) = (
            float(config, "piezo_x_setpoint_on_boot"),
            float(config, "piezo_y_setpoint_on_boot"),
        ) {
            self.piezo = (x, y);
        }
        if let Some(decimation) = int(config, "decimation").and_then(|d| u16::try_from(d).ok()) {
            self.decimation = decimation.max(1);
        }
        if let Some(counter) = int(config, "max_counter_to_save").and_then(|c| u32::try_from(c).ok()) {
            self.max_counter_to_save = counter;
        }
        if let Some(latitude) = float(config, "location_lat") {
            self.latitude = latitude;
        }
        debug!("Booted with configuration '{}'", self.config_name);
    }

    /// DAC commands for the current setpoint
    fn piezo_command(&self) -> (u16, u16) {
        let dac = |v: f32| v.round().clamp(0.0, u16::MAX as f32) as u16;
        (dac(self.piezo.0), dac(self.piezo.1))
    }

    /// Parallactic angle of the target in degrees
    fn parangle(&self) -> f32 {
        let hour_angle = (self.lst_seconds as f64 / 3600.0 - self.target.0 as f64) * 15.0;
        let ha = hour_angle.to_radians();
        let dec = (self.target.1 as f64).to_radians();
        let lat = (self.latitude as f64).to_radians();
        let angle = ha.sin().atan2(lat.tan() * dec.cos() - dec.sin() * ha.cos());
        angle.to_degrees() as f32
    }

    fn switch<F>(&mut self, params: &Fields, apply: F) -> Outcome
    where
        F: FnOnce(&mut Device, bool),
    {
        match params.get("state").and_then(Value::as_bool) {
            Some(state) => {
                apply(self, state);
                Outcome::ok()
            }
            None => Outcome::error(ERR_INVALID_PARAMETER),
        }
    }

    /// Replies in fragments of [`MODULATION_POINTS_PER_PACKET`], last fragment first
    fn get_modulation_sequence(&self, params: &Fields) -> Outcome {
        let slot = match sequence_slot(params) {
            Some(slot) => slot,
            None => return Outcome::error(ERR_INVALID_PARAMETER),
        };
        let empty = Sequence::default();
        let sequence = self.flash.get(&slot).unwrap_or(&empty);
        let npoints = sequence.xmod.len();

        let mut replies: Vec<Fields> = sequence
            .xmod
            .chunks(MODULATION_POINTS_PER_PACKET)
            .zip(sequence.ymod.chunks(MODULATION_POINTS_PER_PACKET))
            .enumerate()
            .map(|(index, (x, y))| {
                fields! {
                    "sequence" => slot,
                    "npoints" => npoints,
                    "startpoint" => index * MODULATION_POINTS_PER_PACKET,
                    "xmod" => x.to_vec(),
                    "ymod" => y.to_vec(),
                }
            })
            .collect();
        if replies.is_empty() {
            replies.push(fields! {
                "sequence" => slot,
                "npoints" => 0,
                "startpoint" => 0,
                "xmod" => Vec::<f32>::new(),
                "ymod" => Vec::<f32>::new(),
            });
        }
        replies.reverse();

        Outcome {
            replies,
            error: ERR_OK,
        }
    }

    fn load_sequence_from_flash(&mut self, params: &Fields) -> Outcome {
        let slot = match sequence_slot(params) {
            Some(slot) => slot,
            None => return Outcome::error(ERR_INVALID_PARAMETER),
        };
        let sequence = match self.flash.get(&slot) {
            Some(s) if s.xmod.len() == s.ymod.len() && s.xmod.len() <= MAX_MODULATION_POINTS => s,
            _ => return Outcome::error(ERR_FLASH),
        };
        let n = sequence.xmod.len();
        self.ram.xmod[..n].copy_from_slice(&sequence.xmod);
        self.ram.ymod[..n].copy_from_slice(&sequence.ymod);
        self.active_sequence = slot;
        info!("Running sequence {} with {} points", slot, n);
        Outcome::ok()
    }

    fn set_modulation_offset(&mut self, params: &Fields) -> Outcome {
        let npoints = int(params, "npoints");
        let x = series(params, "x_offset");
        let y = series(params, "y_offset");
        match (npoints, x, y) {
            (Some(n), Some(x), Some(y)) if x.len() == n && y.len() == n => {
                self.offsets = Sequence { xmod: x, ymod: y };
                Outcome::ok()
            }
            _ => Outcome::error(ERR_INVALID_PARAMETER),
        }
    }

    /// Rows saved since the counter reset, in fragments of
    /// [`DATA_ROWS_PER_PACKET`] sent in order
    fn download_data(&self) -> Outcome {
        let decimation = self.decimation.max(1) as u32;
        let rows = ((self.max_counter_to_save / decimation) as usize).min(DATA_BUFFER_ROWS);
        let (xcom, ycom) = self.piezo_command();
        let (x, y) = self.piezo;

        let counters: Vec<u32> = (0..rows as u32).map(|i| i * decimation).collect();
        let mut replies: Vec<Fields> = counters
            .chunks(DATA_ROWS_PER_PACKET)
            .map(|chunk| {
                let n = chunk.len();
                let microseconds: Vec<u32> = chunk
                    .iter()
                    .map(|c| c.wrapping_mul(CONTROL_LOOP_PERIOD_US))
                    .collect();
                let mut row = fields! {
                    "counter" => chunk.to_vec(),
                    "microseconds" => microseconds,
                    "xcom" => vec![xcom; n],
                    "ycom" => vec![ycom; n],
                };
                for (name, value) in DATA_FIELDS[4..].iter().zip([x, y, x, y, x, y]) {
                    row.insert(name.to_string(), Value::from(vec![value; n]));
                }
                row
            })
            .collect();
        if replies.is_empty() {
            let mut row = Fields::new();
            for name in DATA_FIELDS {
                row.insert(name.to_string(), Value::List(Vec::new()));
            }
            replies.push(row);
        }
        debug!("Downloading {} rows in {} fragments", rows, replies.len());

        Outcome {
            replies,
            error: ERR_OK,
        }
    }

    fn set_modulation_sequence(&mut self, params: &Fields) -> Outcome {
        if !self.flashing {
            return Outcome::error(ERR_BUSY);
        }
        let startpoint = int(params, "startpoint");
        let npoints = int(params, "npoints");
        let xmod = series(params, "xmod");
        let ymod = series(params, "ymod");

        match (startpoint, npoints, xmod, ymod) {
            (Some(start), Some(n), Some(x), Some(y))
                if x.len() == n && y.len() == n && start + n <= MAX_MODULATION_POINTS =>
            {
                self.ram.xmod[start..start + n].copy_from_slice(&x);
                self.ram.ymod[start..start + n].copy_from_slice(&y);
                Outcome::ok()
            }
            _ => Outcome::error(ERR_INVALID_PARAMETER),
        }
    }

    fn flash_sequence(&mut self, params: &Fields) -> Outcome {
        if !self.flashing {
            return Outcome::error(ERR_BUSY);
        }
        let (slot, npoints) = match (sequence_slot(params), int(params, "npoints")) {
            (Some(slot), Some(n)) if n <= MAX_MODULATION_POINTS => (slot, n),
            _ => return Outcome::error(ERR_INVALID_PARAMETER),
        };

        let xmod = self.ram.xmod[..npoints].to_vec();
        let ymod = self.ram.ymod[..npoints].to_vec();
        let xcrc = int(params, "xcrc").map(|c| c as u32);
        let ycrc = int(params, "ycrc").map(|c| c as u32);
        if xcrc != Some(series_crc(&xmod)) || ycrc != Some(series_crc(&ymod)) {
            return Outcome::error(ERR_CRC);
        }

        info!("Flashed sequence {} with {} points", slot, npoints);
        self.flash.insert(slot, Sequence { xmod, ymod });
        Outcome::ok()
    }
}

fn sequence_slot(params: &Fields) -> Option<u8> {
    int(params, "sequence")
        .and_then(|s| u8::try_from(s).ok())
        .filter(|s| MODULATION_SEQUENCES.contains(s))
}

fn int(params: &Fields, name: &str) -> Option<usize> {
    params
        .get(name)
        .and_then(Value::as_i64)
        .and_then(|v| usize::try_from(v).ok())
}

fn float(params: &Fields, name: &str) -> Option<f32> {
    params.get(name).and_then(Value::as_f64).map(|v| v as f32)
}

fn series(params: &Fields, name: &str) -> Option<Vec<f32>> {
    params
        .get(name)
        .and_then(Value::to_f64_vec)
        .map(|v| v.into_iter().map(|f| f as f32).collect())
}
