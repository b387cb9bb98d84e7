//! Command catalogue of the lantern electronics
//!
//! The wire layout of each command lives in the descriptor files; this is the
//! list of ids the ground tooling knows by name.

use serde::{Deserialize, Serialize};

/// Modulation sequences stored in flash are numbered 1 to 5
pub const MODULATION_SEQUENCES: std::ops::RangeInclusive<u8> = 1..=5;

/// Longest modulation sequence the electronics accept
pub const MAX_MODULATION_POINTS: usize = 625;

/// Modulation points carried by one upload or reply packet
pub const MODULATION_POINTS_PER_PACKET: usize = 200;

/// Board configurations the electronics can hold
pub const BOARD_CONFIGS: std::ops::RangeInclusive<u8> = 1..=3;

/// `use_config_on_next_boot` id that falls back to the built-in defaults
pub const DEFAULT_BOARD_CONFIG: u8 = 255;

/// Command types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Echo,
    SwitchFlashingMode,
    SwitchModulationLoop,
    ResetModulationLoop,
    GetVersion,
    GetTemperature,
    GetVoltageHv,
    #[serde(rename = "get_voltage_5v")]
    GetVoltage5v,
    MovePiezo,
    GetPiezoPosition,
    GetModulationSequence,
    SetModulationSequence,
    LoadSequenceFromFlash,
    DownloadData,
    ResetControlDataCounter,
    SetMaxCounterToSave,
    FlashSequence,
    UploadConfig,
    UseConfigOnNextBoot,
    SoftwareReboot,
    SwitchControlLoop,
    SwitchHkData,
    SetDatetime,
    GetDatetime,
    SetModulationOffset,
    SwitchClosedLoop,
    SetDecimation,
    SwitchControlData,
    GetModulationScale,
    SetModulationScale,
    GetModulationPrescaler,
    SetModulationPrescaler,
    GetPiezoCommand,
    StartOutputTrigger,
    StopOutputTrigger,
    GetModulationSequenceId,
    GetLstSeconds,
    SetLstSeconds,
    GetTracking,
    SwitchTracking,
    GetTargetCoords,
    SetTargetCoords,
    GetParangle,
    DeltaMovePiezo,
}

impl CommandKind {
    pub const ALL: [CommandKind; 44] = [
        CommandKind::Echo,
        CommandKind::SwitchFlashingMode,
        CommandKind::SwitchModulationLoop,
        CommandKind::ResetModulationLoop,
        CommandKind::GetVersion,
        CommandKind::GetTemperature,
        CommandKind::GetVoltageHv,
        CommandKind::GetVoltage5v,
        CommandKind::MovePiezo,
        CommandKind::GetPiezoPosition,
        CommandKind::GetModulationSequence,
        CommandKind::SetModulationSequence,
        CommandKind::LoadSequenceFromFlash,
        CommandKind::DownloadData,
        CommandKind::ResetControlDataCounter,
        CommandKind::SetMaxCounterToSave,
        CommandKind::FlashSequence,
        CommandKind::UploadConfig,
        CommandKind::UseConfigOnNextBoot,
        CommandKind::SoftwareReboot,
        CommandKind::SwitchControlLoop,
        CommandKind::SwitchHkData,
        CommandKind::SetDatetime,
        CommandKind::GetDatetime,
        CommandKind::SetModulationOffset,
        CommandKind::SwitchClosedLoop,
        CommandKind::SetDecimation,
        CommandKind::SwitchControlData,
        CommandKind::GetModulationScale,
        CommandKind::SetModulationScale,
        CommandKind::GetModulationPrescaler,
        CommandKind::SetModulationPrescaler,
        CommandKind::GetPiezoCommand,
        CommandKind::StartOutputTrigger,
        CommandKind::StopOutputTrigger,
        CommandKind::GetModulationSequenceId,
        CommandKind::GetLstSeconds,
        CommandKind::SetLstSeconds,
        CommandKind::GetTracking,
        CommandKind::SwitchTracking,
        CommandKind::GetTargetCoords,
        CommandKind::SetTargetCoords,
        CommandKind::GetParangle,
        CommandKind::DeltaMovePiezo,
    ];

    pub fn to_u8(&self) -> u8 {
        match self {
            CommandKind::Echo => 1,
            CommandKind::SwitchFlashingMode => 2,
            CommandKind::SwitchModulationLoop => 3,
            CommandKind::ResetModulationLoop => 4,
            CommandKind::GetVersion => 5,
            CommandKind::GetTemperature => 6,
            CommandKind::GetVoltageHv => 7,
            CommandKind::GetVoltage5v => 8,
            CommandKind::MovePiezo => 9,
            CommandKind::GetPiezoPosition => 10,
            CommandKind::GetModulationSequence => 11,
            CommandKind::SetModulationSequence => 12,
            CommandKind::LoadSequenceFromFlash => 13,
            CommandKind::DownloadData => 14,
            CommandKind::ResetControlDataCounter => 15,
            CommandKind::SetMaxCounterToSave => 16,
            CommandKind::FlashSequence => 17,
            CommandKind::UploadConfig => 18,
            CommandKind::UseConfigOnNextBoot => 19,
            CommandKind::SoftwareReboot => 20,
            CommandKind::SwitchControlLoop => 21,
            CommandKind::SwitchHkData => 22,
            CommandKind::SetDatetime => 23,
            CommandKind::GetDatetime => 24,
            CommandKind::SetModulationOffset => 25,
            CommandKind::SwitchClosedLoop => 26,
            CommandKind::SetDecimation => 27,
            CommandKind::SwitchControlData => 28,
            CommandKind::GetModulationScale => 29,
            CommandKind::SetModulationScale => 30,
            CommandKind::GetModulationPrescaler => 31,
            CommandKind::SetModulationPrescaler => 32,
            CommandKind::GetPiezoCommand => 33,
            CommandKind::StartOutputTrigger => 34,
            CommandKind::StopOutputTrigger => 35,
            CommandKind::GetModulationSequenceId => 36,
            CommandKind::GetLstSeconds => 37,
            CommandKind::SetLstSeconds => 38,
            CommandKind::GetTracking => 39,
            CommandKind::SwitchTracking => 40,
            CommandKind::GetTargetCoords => 41,
            CommandKind::SetTargetCoords => 42,
            CommandKind::GetParangle => 43,
            CommandKind::DeltaMovePiezo => 44,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.to_u8() == value)
    }

    /// Name used in the descriptor files and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Echo => "echo",
            CommandKind::SwitchFlashingMode => "switch_flashing_mode",
            CommandKind::SwitchModulationLoop => "switch_modulation_loop",
            CommandKind::ResetModulationLoop => "reset_modulation_loop",
            CommandKind::GetVersion => "get_version",
            CommandKind::GetTemperature => "get_temperature",
            CommandKind::GetVoltageHv => "get_voltage_hv",
            CommandKind::GetVoltage5v => "get_voltage_5v",
            CommandKind::MovePiezo => "move_piezo",
            CommandKind::GetPiezoPosition => "get_piezo_position",
            CommandKind::GetModulationSequence => "get_modulation_sequence",
            CommandKind::SetModulationSequence => "set_modulation_sequence",
            CommandKind::LoadSequenceFromFlash => "load_sequence_from_flash",
            CommandKind::DownloadData => "download_data",
            CommandKind::ResetControlDataCounter => "reset_control_data_counter",
            CommandKind::SetMaxCounterToSave => "set_max_counter_to_save",
            CommandKind::FlashSequence => "flash_sequence",
            CommandKind::UploadConfig => "upload_config",
            CommandKind::UseConfigOnNextBoot => "use_config_on_next_boot",
            CommandKind::SoftwareReboot => "software_reboot",
            CommandKind::SwitchControlLoop => "switch_control_loop",
            CommandKind::SwitchHkData => "switch_hk_data",
            CommandKind::SetDatetime => "set_datetime",
            CommandKind::GetDatetime => "get_datetime",
            CommandKind::SetModulationOffset => "set_modulation_offset",
            CommandKind::SwitchClosedLoop => "switch_closed_loop",
            CommandKind::SetDecimation => "set_decimation",
            CommandKind::SwitchControlData => "switch_control_data",
            CommandKind::GetModulationScale => "get_modulation_scale",
            CommandKind::SetModulationScale => "set_modulation_scale",
            CommandKind::GetModulationPrescaler => "get_modulation_prescaler",
            CommandKind::SetModulationPrescaler => "set_modulation_prescaler",
            CommandKind::GetPiezoCommand => "get_piezo_command",
            CommandKind::StartOutputTrigger => "start_output_trigger",
            CommandKind::StopOutputTrigger => "stop_output_trigger",
            CommandKind::GetModulationSequenceId => "get_modulation_sequence_id",
            CommandKind::GetLstSeconds => "get_lst_seconds",
            CommandKind::SetLstSeconds => "set_lst_seconds",
            CommandKind::GetTracking => "get_tracking",
            CommandKind::SwitchTracking => "switch_tracking",
            CommandKind::GetTargetCoords => "get_target_coords",
            CommandKind::SetTargetCoords => "set_target_coords",
            CommandKind::GetParangle => "get_parangle",
            CommandKind::DeltaMovePiezo => "delta_move_piezo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// Whether the device answers with reply data before the execution ack
    pub fn has_reply(&self) -> bool {
        matches!(
            self,
            CommandKind::Echo
                | CommandKind::GetVersion
                | CommandKind::GetTemperature
                | CommandKind::GetVoltageHv
                | CommandKind::GetVoltage5v
                | CommandKind::GetPiezoPosition
                | CommandKind::GetModulationSequence
                | CommandKind::DownloadData
                | CommandKind::GetDatetime
                | CommandKind::GetModulationScale
                | CommandKind::GetModulationPrescaler
                | CommandKind::GetPiezoCommand
                | CommandKind::GetModulationSequenceId
                | CommandKind::GetLstSeconds
                | CommandKind::GetTracking
                | CommandKind::GetTargetCoords
                | CommandKind::GetParangle
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::workspace_store;

    #[test]
    fn test_command_kind_conversion() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_u8(kind.to_u8()), Some(kind));
            assert_eq!(CommandKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(CommandKind::from_u8(0xff), None);
        assert_eq!(CommandKind::from_name("self_destruct"), None);
    }

    #[test]
    fn test_catalogue_matches_descriptors() {
        let store = workspace_store();
        for kind in CommandKind::ALL {
            let schema = store.command(kind.to_u8() as i64).unwrap();
            assert_eq!(schema.name, kind.name());
            assert_eq!(store.has_reply(kind.to_u8() as i64), kind.has_reply(), "{}", kind.name());
        }
    }

    #[test]
    fn test_catalogue_covers_every_descriptor() {
        let store = workspace_store();
        let mut ids: Vec<u8> = CommandKind::ALL.iter().map(CommandKind::to_u8).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), CommandKind::ALL.len());
        for id in 0..=u8::MAX {
            assert_eq!(
                store.command(id as i64).is_ok(),
                CommandKind::from_u8(id).is_some(),
                "command id {}",
                id
            );
        }
    }

    #[test]
    fn test_serde_names() {
        for kind in CommandKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.name()));
        }
    }
}
