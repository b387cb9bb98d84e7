//! Board configurations stored in the electronics
//!
//! The electronics keep up to three configurations in flash and pick one at
//! boot. A configuration is uploaded with `upload_config`, which carries every
//! field below. Files are JSON objects with one key per field.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use lanternlibgs::{Fields, LanternError, LanternResult, Value, BOARD_CONFIGS};

/// Longest configuration name, the width of the `name` field
pub const CONFIG_NAME_LEN: usize = 16;

/// One board configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    pub name: String,
    pub system_id: u8,
    pub control_loop_period: u32,
    pub modulation_period: u32,
    pub hk_period: u32,
    pub data_period: u32,
    pub sg_adc_period: u16,
    pub tx_timeout: u32,
    pub i2c_timeout: u32,
    pub conversion_factor_hv: f32,
    pub conversion_factor_5v: f32,
    pub internal_trigger: u8,
    pub output_trigger_delay: u16,
    pub close_loop_on_boot: u8,
    pub location_lat: f32,
    pub location_lon: f32,
    pub sky_in_sg_origin_x: f32,
    pub sky_in_sg_origin_y: f32,
    pub sky_to_sg_conversion_matrix_11: f32,
    pub sky_to_sg_conversion_matrix_12: f32,
    pub sky_to_sg_conversion_matrix_21: f32,
    pub sky_to_sg_conversion_matrix_22: f32,
    pub sg_in_com_origin_x: f32,
    pub sg_in_com_origin_y: f32,
    pub sg_to_com_conversion_matrix_11: f32,
    pub sg_to_com_conversion_matrix_12: f32,
    pub sg_to_com_conversion_matrix_21: f32,
    pub sg_to_com_conversion_matrix_22: f32,
    pub piezo_command_lower_limit: u16,
    pub piezo_command_upper_limit: u16,
    pub sg_adc_filter_omega_knot: f32,
    pub max_piezo_step: f32,
    pub xdac_address: u8,
    pub ydac_address: u8,
    pub xsg_ind: u8,
    pub ysg_ind: u8,
    pub max_counter_to_save: u32,
    pub decimation: u16,
    pub hk_active_on_boot: u8,
    pub data_active_on_boot: u8,
    pub control_active_on_boot: u8,
    pub modulation_active_on_boot: u8,
    pub piezo_x_setpoint_on_boot: f32,
    pub piezo_y_setpoint_on_boot: f32,
    pub use_shaping: u8,
    pub shaping_slope: f32,
    pub pid_coeff_p: f32,
    pub pid_coeff_i: f32,
    pub pid_coeff_d: f32,
}

impl BoardConfig {
    /// Read a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> LanternResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: BoardConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LanternResult<()> {
        if self.name.len() > CONFIG_NAME_LEN {
            return Err(LanternError::Config(format!(
                "config name '{}' is longer than {} bytes",
                self.name, CONFIG_NAME_LEN
            )));
        }
        if self.decimation == 0 {
            return Err(LanternError::Config("decimation must be at least 1".to_string()));
        }
        if self.piezo_command_lower_limit > self.piezo_command_upper_limit {
            return Err(LanternError::Config(format!(
                "piezo command limits {}..{} are reversed",
                self.piezo_command_lower_limit, self.piezo_command_upper_limit
            )));
        }
        Ok(())
    }

    /// Parameters of the `upload_config` command storing this configuration
    /// as `config_id`
    pub fn to_params(&self, config_id: u8) -> LanternResult<Fields> {
        check_config_id(config_id)?;
        self.validate()?;
        match Value::from(serde_json::to_value(self)?) {
            Value::Map(mut fields) => {
                fields.insert("config_id".to_string(), Value::from(config_id));
                Ok(fields)
            }
            other => Err(LanternError::encode(format!("config serialized to {}", other))),
        }
    }
}

/// Configurations are stored in slots 1 to 3
pub fn check_config_id(config_id: u8) -> LanternResult<()> {
    if !BOARD_CONFIGS.contains(&config_id) {
        return Err(LanternError::invalid_argument(format!(
            "config_id {} outside {}..={}",
            config_id,
            BOARD_CONFIGS.start(),
            BOARD_CONFIGS.end()
        )));
    }
    Ok(())
}
