//! Modbus-RTU frame codec for Sydpower devices.
//!
//! Devices speak a Modbus-flavoured binary protocol carried as raw bytes over
//! MQTT: read-holding (function 3) and write-single (function 6) frames with a
//! trailing CRC-16, answered by register dumps the device publishes on its
//! response topics. Encoding of writes is gated by [`WRITABLE_REGISTERS`]:
//! firmware does not clamp values, and an out-of-range write can permanently
//! damage a unit, so no frame is produced for a register/value pair outside
//! the allowlist.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{Error, ValidationError};

/// Modbus unit identifier used by every known Sydpower model unless the API
/// reports a per-device override.
pub const DEFAULT_SLAVE_ADDRESS: u8 = 17;

/// Registers requested by a full read unless the API reports a per-device
/// override.
pub const DEFAULT_REGISTER_COUNT: u16 = 80;

/// Function code: read holding registers.
const FUNCTION_READ_HOLDING: u8 = 3;
/// Function code: write single register.
const FUNCTION_WRITE_SINGLE: u8 = 6;

/// MQTT payloads prefix the register data with this many header bytes.
pub const PAYLOAD_HEADER_LEN: usize = 6;

/// Fewer decoded registers than this carry nothing usable.
pub const MIN_REGISTER_COUNT: usize = 57;

/// Register count of a full device dump.
pub const FULL_REGISTER_COUNT: usize = 81;

/// Register indices observed in device dumps.
///
/// Values sourced from the vendor's BrightEMS app traffic; only the registers
/// the decoder or the allowlist touch are named.
pub mod register {
    /// DC input power (W).
    pub const DC_INPUT: u16 = 4;
    /// Total input power (W).
    pub const TOTAL_INPUT: u16 = 6;
    /// AC charging rate (W).
    pub const AC_CHARGING_RATE: u16 = 13;
    /// AC output voltage, decivolts.
    pub const AC_OUTPUT_VOLTAGE: u16 = 18;
    /// AC output frequency, decihertz.
    pub const AC_OUTPUT_FREQUENCY: u16 = 19;
    /// Maximum charging current (A).
    pub const MAXIMUM_CHARGING_CURRENT: u16 = 20;
    /// AC input voltage, decivolts.
    pub const AC_INPUT_VOLTAGE: u16 = 21;
    /// AC input frequency, centihertz.
    pub const AC_INPUT_FREQUENCY: u16 = 22;
    /// USB output switch.
    pub const USB_OUTPUT: u16 = 24;
    /// DC output switch.
    pub const DC_OUTPUT: u16 = 25;
    /// AC output switch.
    pub const AC_OUTPUT: u16 = 26;
    /// LED mode (0 off, 1 always, 2 SOS, 3 flash).
    pub const LED: u16 = 27;
    /// Total output power (W).
    pub const TOTAL_OUTPUT: u16 = 39;
    /// Bitfield of active outputs.
    pub const ACTIVE_OUTPUT_LIST: u16 = 41;
    /// First slave battery pack state of charge, permille.
    pub const SOC_SLAVE_1: u16 = 53;
    /// Second slave battery pack state of charge, permille.
    pub const SOC_SLAVE_2: u16 = 55;
    /// Main state of charge, permille.
    pub const STATE_OF_CHARGE: u16 = 56;
    /// AC silent charging switch.
    pub const AC_SILENT_CHARGING: u16 = 57;
    /// USB standby time (minutes).
    pub const USB_STANDBY_TIME: u16 = 59;
    /// AC standby time (minutes).
    pub const AC_STANDBY_TIME: u16 = 60;
    /// DC standby time (minutes).
    pub const DC_STANDBY_TIME: u16 = 61;
    /// Screen rest time (seconds).
    pub const SCREEN_REST_TIME: u16 = 62;
    /// Stop charging after N minutes.
    pub const STOP_CHARGE_AFTER: u16 = 63;
    /// Discharge lower limit, permille.
    pub const DISCHARGE_LIMIT: u16 = 66;
    /// AC charging upper limit, permille.
    pub const CHARGING_LIMIT: u16 = 67;
    /// Whole-machine sleep time (minutes).
    pub const SLEEP_TIME: u16 = 68;
}

/// Permitted raw values for a writable register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSet {
    /// Exact finite set of permitted values.
    Discrete(&'static [u16]),
    /// Contiguous inclusive range of permitted values.
    Range { min: u16, max: u16 },
}

impl ValueSet {
    pub fn contains(&self, value: u16) -> bool {
        match self {
            ValueSet::Discrete(values) => values.contains(&value),
            ValueSet::Range { min, max } => (*min..=*max).contains(&value),
        }
    }
}

impl fmt::Display for ValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSet::Discrete(values) => {
                write!(f, "{{")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            ValueSet::Range { min, max } => write!(f, "{min}..={max}"),
        }
    }
}

const BOOL: ValueSet = ValueSet::Discrete(&[0, 1]);

/// Every register the encoder will write, with its exact permitted values.
///
/// Firmware applies no clamping; anything outside these sets is refused
/// before a byte is produced. Sets confirmed against vendor app behaviour.
pub const WRITABLE_REGISTERS: &[(u16, ValueSet)] = &[
    (register::MAXIMUM_CHARGING_CURRENT, ValueSet::Range { min: 1, max: 20 }),
    (register::USB_OUTPUT, BOOL),
    (register::DC_OUTPUT, BOOL),
    (register::AC_OUTPUT, BOOL),
    (register::LED, ValueSet::Discrete(&[0, 1, 2, 3])),
    (register::AC_SILENT_CHARGING, BOOL),
    (register::USB_STANDBY_TIME, ValueSet::Discrete(&[0, 3, 5, 10, 30])),
    (register::AC_STANDBY_TIME, ValueSet::Discrete(&[0, 480, 960, 1440])),
    (register::DC_STANDBY_TIME, ValueSet::Discrete(&[0, 480, 960, 1440])),
    (register::SCREEN_REST_TIME, ValueSet::Discrete(&[0, 180, 300, 600, 1800])),
    (register::STOP_CHARGE_AFTER, ValueSet::Range { min: 0, max: 1440 }),
    (register::DISCHARGE_LIMIT, ValueSet::Range { min: 0, max: 1000 }),
    (register::CHARGING_LIMIT, ValueSet::Range { min: 0, max: 1000 }),
    (register::SLEEP_TIME, ValueSet::Discrete(&[5, 10, 30, 480])),
];

/// Looks up the permitted values for a register, if it is writable at all.
pub fn allowed_values(register: u16) -> Option<&'static ValueSet> {
    WRITABLE_REGISTERS
        .iter()
        .find(|(reg, _)| *reg == register)
        .map(|(_, set)| set)
}

/// Classic Modbus CRC-16: seed 0xFFFF, reversed polynomial 0xA001.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Appends the CRC high byte first, the order the devices expect.
fn push_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push((crc >> 8) as u8);
    frame.push((crc & 0xFF) as u8);
}

/// Checks a received frame's trailing CRC against a recomputation over the
/// rest of the frame.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (data, tail) = frame.split_at(frame.len() - 2);
    crc16(data) == high_low_to_int(tail[0], tail[1])
}

fn high_low_to_int(high: u8, low: u8) -> u16 {
    (u16::from(high) << 8) | u16::from(low)
}

/// Builds a read-holding frame for `count` registers starting at 0.
pub fn encode_read(slave: u8, count: u16) -> Vec<u8> {
    let mut frame = vec![slave, FUNCTION_READ_HOLDING];
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    push_crc(&mut frame);
    frame
}

/// Builds a write-single frame, refusing anything the allowlist does not
/// explicitly permit. The only path that produces write bytes.
pub fn encode_write(slave: u8, register: u16, value: u16) -> Result<Vec<u8>, ValidationError> {
    let allowed =
        allowed_values(register).ok_or(ValidationError::UnknownRegister(register))?;
    if !allowed.contains(value) {
        return Err(ValidationError::ValueOutOfRange {
            register,
            value,
            allowed: allowed.to_string(),
        });
    }
    let mut frame = vec![slave, FUNCTION_WRITE_SINGLE];
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    push_crc(&mut frame);
    Ok(frame)
}

/// One decoded device attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl AttrValue {
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            AttrValue::Int(v) => u16::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<u16> for AttrValue {
    fn from(v: u16) -> Self {
        AttrValue::Int(i64::from(v))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

/// Attribute map for a single device, as returned to callers.
pub type DeviceState = HashMap<String, AttrValue>;

/// Splits an MQTT payload into registers: strips the 6-byte header and pairs
/// the remaining bytes big-endian. `None` for anything too short or odd.
pub fn registers_from_payload(payload: &[u8]) -> Option<Vec<u16>> {
    if payload.len() < PAYLOAD_HEADER_LEN + 2 {
        return None;
    }
    let data = &payload[PAYLOAD_HEADER_LEN..];
    if data.len() % 2 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(2)
            .map(|pair| high_low_to_int(pair[0], pair[1]))
            .collect(),
    )
}

/// State of charge: permille register to a one-decimal percentage.
fn soc_percent(raw: u16) -> f64 {
    (f64::from(raw) / 1000.0 * 100.0 * 10.0).round() / 10.0
}

/// Slave-pack state of charge carries a firmware bias of -1 after the
/// permille conversion; kept verbatim to match the vendor app.
fn slave_soc_percent(raw: u16) -> f64 {
    soc_percent(raw) - 1.0
}

fn insert_soc_fields(update: &mut DeviceState, registers: &[u16]) {
    update.insert(
        "soc".to_string(),
        soc_percent(registers[register::STATE_OF_CHARGE as usize]).into(),
    );
    // Raw 0 means the slave pack is absent, not empty
    let s1 = registers[register::SOC_SLAVE_1 as usize];
    if s1 != 0 {
        update.insert("soc_s1".to_string(), slave_soc_percent(s1).into());
    }
    let s2 = registers[register::SOC_SLAVE_2 as usize];
    if s2 != 0 {
        update.insert("soc_s2".to_string(), slave_soc_percent(s2).into());
    }
}

/// Decodes a register dump into an attribute map.
///
/// The topic selects the view: `.../client/04` responses carry live sensor
/// data, `.../client/data` responses carry the settings page. Register counts
/// between [`MIN_REGISTER_COUNT`] and the full dump yield a partial update
/// with the state-of-charge fields only. Anything else decodes to an empty
/// map; this function never fails.
pub fn parse_registers(registers: &[u16], topic: &str) -> DeviceState {
    let mut update = DeviceState::new();

    if registers.len() == FULL_REGISTER_COUNT {
        if topic.contains("device/response/client/04") {
            insert_soc_fields(&mut update, registers);
            update.insert(
                "dcInput".to_string(),
                registers[register::DC_INPUT as usize].into(),
            );
            update.insert(
                "totalInput".to_string(),
                registers[register::TOTAL_INPUT as usize].into(),
            );
            update.insert(
                "totalOutput".to_string(),
                registers[register::TOTAL_OUTPUT as usize].into(),
            );
            update.insert(
                "acOutputVoltage".to_string(),
                (f64::from(registers[register::AC_OUTPUT_VOLTAGE as usize]) / 10.0).into(),
            );
            update.insert(
                "acOutputFrequency".to_string(),
                (f64::from(registers[register::AC_OUTPUT_FREQUENCY as usize]) / 10.0).into(),
            );
            update.insert(
                "acInputVoltage".to_string(),
                (f64::from(registers[register::AC_INPUT_VOLTAGE as usize]) / 10.0).into(),
            );
            // Input frequency is reported in centihertz, unlike its output twin
            update.insert(
                "acInputFrequency".to_string(),
                (f64::from(registers[register::AC_INPUT_FREQUENCY as usize]) / 100.0).into(),
            );

            // Output switches live in one bitfield; positions counted from
            // the MSB side: 3 = LED, 4 = AC, 5 = DC, 6 = USB.
            let outputs = registers[register::ACTIVE_OUTPUT_LIST as usize];
            update.insert("usbOutput".to_string(), (outputs & (1 << 9) != 0).into());
            update.insert("dcOutput".to_string(), (outputs & (1 << 10) != 0).into());
            update.insert("acOutput".to_string(), (outputs & (1 << 11) != 0).into());
            update.insert("ledOutput".to_string(), (outputs & (1 << 12) != 0).into());
        } else if topic.contains("device/response/client/data") {
            update.insert(
                "acChargingRate".to_string(),
                registers[register::AC_CHARGING_RATE as usize].into(),
            );
            update.insert(
                "maximumChargingCurrent".to_string(),
                registers[register::MAXIMUM_CHARGING_CURRENT as usize].into(),
            );
            update.insert(
                "acSilentCharging".to_string(),
                (registers[register::AC_SILENT_CHARGING as usize] == 1).into(),
            );
            update.insert(
                "usbStandbyTime".to_string(),
                registers[register::USB_STANDBY_TIME as usize].into(),
            );
            update.insert(
                "acStandbyTime".to_string(),
                registers[register::AC_STANDBY_TIME as usize].into(),
            );
            update.insert(
                "dcStandbyTime".to_string(),
                registers[register::DC_STANDBY_TIME as usize].into(),
            );
            update.insert(
                "screenRestTime".to_string(),
                registers[register::SCREEN_REST_TIME as usize].into(),
            );
            update.insert(
                "stopChargeAfter".to_string(),
                registers[register::STOP_CHARGE_AFTER as usize].into(),
            );
            // Stored in permille, presented as percent
            update.insert(
                "dischargeLowerLimit".to_string(),
                (f64::from(registers[register::DISCHARGE_LIMIT as usize]) / 10.0).into(),
            );
            update.insert(
                "acChargingUpperLimit".to_string(),
                (f64::from(registers[register::CHARGING_LIMIT as usize]) / 10.0).into(),
            );
            update.insert(
                "wholeMachineUnusedTime".to_string(),
                registers[register::SLEEP_TIME as usize].into(),
            );
        }
    } else if registers.len() >= MIN_REGISTER_COUNT {
        insert_soc_fields(&mut update, registers);
    }

    update
}

/// Full decode pipe: payload bytes plus topic hint to attribute map.
/// Total over arbitrary input; malformed payloads decode to an empty map.
pub fn decode(payload: &[u8], topic: &str) -> DeviceState {
    match registers_from_payload(payload) {
        Some(registers) => parse_registers(&registers, topic),
        None => DeviceState::new(),
    }
}

/// A device command as accepted by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Named entry in the pre-encoded catalogue, e.g. `REGEnableUSBOutput`.
    Preset(String),
    /// Validated write of a single register.
    WriteRegister { register: u16, value: u16 },
}

impl Command {
    /// Resolves the command to frame bytes, enforcing the allowlist.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        match self {
            Command::Preset(name) => COMMANDS
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| Error::State(format!("unknown command: {name}"))),
            Command::WriteRegister { register, value } => {
                Ok(encode_write(DEFAULT_SLAVE_ADDRESS, *register, *value)?)
            }
        }
    }
}

/// Write commands in the catalogue: name, register, value.
const PRESET_WRITES: &[(&str, u16, u16)] = &[
    ("REGDisableUSBOutput", register::USB_OUTPUT, 0),
    ("REGEnableUSBOutput", register::USB_OUTPUT, 1),
    ("REGDisableDCOutput", register::DC_OUTPUT, 0),
    ("REGEnableDCOutput", register::DC_OUTPUT, 1),
    ("REGDisableACOutput", register::AC_OUTPUT, 0),
    ("REGEnableACOutput", register::AC_OUTPUT, 1),
    ("REGDisableLED", register::LED, 0),
    ("REGEnableLEDAlways", register::LED, 1),
    ("REGEnableLEDSOS", register::LED, 2),
    ("REGEnableLEDFlash", register::LED, 3),
    ("REGDisableACSilentChg", register::AC_SILENT_CHARGING, 0),
    ("REGEnableACSilentChg", register::AC_SILENT_CHARGING, 1),
];

/// Pre-encoded command catalogue keyed by the vendor command names.
///
/// Built once on first use; a catalogue entry failing allowlist validation is
/// a programming error and aborts startup rather than shipping a frame that
/// was never vetted.
pub static COMMANDS: Lazy<HashMap<&'static str, Vec<u8>>> = Lazy::new(|| {
    let mut catalogue = HashMap::with_capacity(PRESET_WRITES.len() + 1);
    catalogue.insert(
        "REGRequestSettings",
        encode_read(DEFAULT_SLAVE_ADDRESS, DEFAULT_REGISTER_COUNT),
    );
    for &(name, reg, value) in PRESET_WRITES {
        let frame = encode_write(DEFAULT_SLAVE_ADDRESS, reg, value)
            .unwrap_or_else(|err| panic!("command catalogue entry {name}: {err}"));
        catalogue.insert(name, frame);
    }
    catalogue
});
