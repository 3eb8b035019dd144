//! Serial port handling
//!
//! Port discovery, descriptors and low-level serial port setup.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use super::LinkError;
use crate::config::LinkConfig;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// A port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Flow control applied when a port is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// Everything needed to open one candidate port
///
/// Built from enumeration plus configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Platform path or identifier
    pub path: String,
    /// Line speed in bits per second
    pub baud_rate: u32,
    /// Bound on each blocking read
    pub read_timeout: Duration,
    /// Bound on each blocking write
    pub write_timeout: Duration,
    /// Flow control mode
    pub flow_control: FlowControl,
    /// Assert DTR after opening
    pub dtr_enable: bool,
    /// Assert RTS after opening
    pub rts_enable: bool,
}

impl PortDescriptor {
    /// Describe `path` using the port settings of `config`
    pub fn new(path: impl Into<String>, config: &LinkConfig) -> Self {
        Self {
            path: path.into(),
            baud_rate: config.baud_rate,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            flow_control: config.flow_control,
            dtr_enable: config.dtr_enable,
            rts_enable: config.rts_enable,
        }
    }
}

/// Predicate deciding whether an enumerated port is a candidate
pub type PortFilter = Arc<dyn Fn(&PortInfo) -> bool + Send + Sync>;

/// Source of candidate ports, tried in the order returned
pub trait PortEnumerator: Send + Sync {
    /// List candidate descriptors; empty when nothing matches, never fails
    fn list_candidates(&self) -> Vec<PortDescriptor>;
}

/// Filter matching the device files USB serial adapters show up as on this platform
pub fn default_port_filter() -> PortFilter {
    Arc::new(|info: &PortInfo| is_usb_serial_name(&info.name))
}

#[cfg(target_os = "linux")]
fn is_usb_serial_name(name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    basename.starts_with("ttyACM") || basename.starts_with("ttyUSB")
}

#[cfg(target_os = "macos")]
fn is_usb_serial_name(name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    basename.starts_with("cu.usb")
}

#[cfg(target_os = "windows")]
fn is_usb_serial_name(name: &str) -> bool {
    name.to_ascii_uppercase().starts_with("COM")
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn is_usb_serial_name(_name: &str) -> bool {
    true
}

/// Enumerates the machine's serial ports
pub struct SerialEnumerator {
    config: LinkConfig,
    filter: PortFilter,
}

impl SerialEnumerator {
    /// Enumerator using the platform's default filter
    pub fn new(config: LinkConfig) -> Self {
        Self::with_filter(config, default_port_filter())
    }

    /// Enumerator using a custom candidate predicate
    pub fn with_filter(config: LinkConfig, filter: PortFilter) -> Self {
        Self { config, filter }
    }
}

impl PortEnumerator for SerialEnumerator {
    fn list_candidates(&self) -> Vec<PortDescriptor> {
        candidates_from(list_ports(), &self.filter, &self.config)
    }
}

/// A fixed, ordered list of ports
///
/// Used when the configuration names an explicit port.
#[derive(Debug, Clone, Default)]
pub struct FixedEnumerator {
    descriptors: Vec<PortDescriptor>,
}

impl FixedEnumerator {
    /// Enumerator yielding exactly `descriptors`, in order
    pub fn new(descriptors: Vec<PortDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Build descriptors for `paths` using the settings of `config`
    pub fn from_paths<I, S>(paths: I, config: &LinkConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            paths
                .into_iter()
                .map(|p| PortDescriptor::new(p, config))
                .collect(),
        )
    }
}

impl PortEnumerator for FixedEnumerator {
    fn list_candidates(&self) -> Vec<PortDescriptor> {
        self.descriptors.clone()
    }
}

/// Apply the filter and build descriptors, keeping the input order
pub fn candidates_from(
    ports: Vec<PortInfo>,
    filter: &PortFilter,
    config: &LinkConfig,
) -> Vec<PortDescriptor> {
    ports
        .into_iter()
        .filter(|p| filter(p))
        .map(|p| PortDescriptor::new(p.name, config))
        .collect()
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev sometimes lags behind the device nodes
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port as described, 8N1 with the descriptor's flow control
pub fn open_port(descriptor: &PortDescriptor) -> Result<Box<dyn SerialPort>, LinkError> {
    let mut port = serialport::new(&descriptor.path, descriptor.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(descriptor.flow_control.into())
        .timeout(descriptor.read_timeout)
        .open()
        .map_err(|e| LinkError::SerialError(format!("{}: {}", descriptor.path, e)))?;

    configure_port(port.as_mut(), descriptor);
    Ok(port)
}

/// Apply modem control lines
///
/// Failures are logged and ignored; plenty of adapters do not wire DTR/RTS.
pub fn configure_port(port: &mut dyn SerialPort, descriptor: &PortDescriptor) {
    if let Err(e) = port.write_data_terminal_ready(descriptor.dtr_enable) {
        tracing::debug!(port = %descriptor.path, "failed to set DTR: {e} (continuing)");
    }
    if let Err(e) = port.write_request_to_send(descriptor.rts_enable) {
        tracing::debug!(port = %descriptor.path, "failed to set RTS: {e} (continuing)");
    }
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| LinkError::SerialError(e.to_string()))
}
