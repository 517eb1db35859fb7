//! Port abstraction for the serial link to the target.
//!
//! The transfer session only needs a byte-oriented duplex channel: write a
//! frame, read whatever control bytes have arrived, close. The `Port` trait
//! captures that, with a native implementation on top of the `serialport`
//! crate.
//!
//! ```text
//! +------------------+
//! | TransferSession  |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    Port trait    |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    NativePort    |
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use iapflash::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> iapflash::Result<()> {
//!     port.write_frame(&[0xAF, 0x00, 0x04, 0x00, 0x00, 0x01, 0x00])?;
//!
//!     let mut buf = [0u8; 16];
//!     let n = port.read_available(&mut buf)?;
//!     println!("Received: {:02X?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "native")]
pub mod native;

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout; bounds how long a single poll of the port may block.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(10),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the data bits.
    #[must_use]
    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Set the flow control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Check the configuration before opening a port.
    pub fn validate(&self) -> Result<()> {
        if self.port_name.trim().is_empty() {
            return Err(Error::Config("serial port name is empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("port read timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = Error;

    fn try_from(bits: u8) -> Result<Self> {
        match bits {
            5 => Ok(Self::Five),
            6 => Ok(Self::Six),
            7 => Ok(Self::Seven),
            8 => Ok(Self::Eight),
            other => Err(Error::Config(format!(
                "unsupported data bits: {other} (expected 5, 6, 7 or 8)"
            ))),
        }
    }
}

impl FromStr for DataBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bits: u8 = s
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid data bits: '{s}'")))?;
        Self::try_from(bits)
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        };
        write!(f, "{bits}")
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "even" | "e" => Ok(Self::Even),
            "odd" | "o" => Ok(Self::Odd),
            _ => Err(Error::Config(format!(
                "invalid parity: '{s}' (expected none, even or odd)"
            ))),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Even => "even",
            Self::Odd => "odd",
        })
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

impl FromStr for StopBits {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "one" => Ok(Self::One),
            "2" | "two" => Ok(Self::Two),
            _ => Err(Error::Config(format!(
                "invalid stop bits: '{s}' (expected 1 or 2)"
            ))),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::One => "1",
            Self::Two => "2",
        })
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Software flow control (XON/XOFF).
    Software,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

impl FromStr for FlowControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "software" | "xonxoff" => Ok(Self::Software),
            "hardware" | "rtscts" => Ok(Self::Hardware),
            _ => Err(Error::Config(format!(
                "invalid flow control: '{s}' (expected none, software or hardware)"
            ))),
        }
    }
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Software => "software",
            Self::Hardware => "hardware",
        })
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte-oriented duplex channel to the target.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, all further I/O fails with `NotConnected`.
    fn close(&mut self) -> Result<()>;

    /// Write a complete frame and flush it.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.write_all(frame)?;
        self.flush()?;
        Ok(())
    }

    /// Read whatever bytes are currently available.
    ///
    /// Blocks for at most the port timeout and returns `Ok(0)` when nothing
    /// arrived in that window.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<P: Port + ?Sized> Port for &mut P {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports matching the given VID/PID.
    fn find_by_vid_pid(vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0", 921600)
            .with_timeout(Duration::from_secs(5))
            .with_parity(Parity::Even)
            .with_stop_bits(StopBits::Two)
            .with_data_bits(DataBits::Seven)
            .with_flow_control(FlowControl::Hardware);

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 921600);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn test_serial_config_validate() {
        assert!(SerialConfig::new("/dev/ttyUSB0", 115200).validate().is_ok());
        assert!(matches!(
            SerialConfig::new("", 115200).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SerialConfig::new("COM3", 0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SerialConfig::new("COM3", 9600)
                .with_timeout(Duration::ZERO)
                .validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_data_bits_parse() {
        assert_eq!("5".parse::<DataBits>().unwrap(), DataBits::Five);
        assert_eq!("8".parse::<DataBits>().unwrap(), DataBits::Eight);
        assert!("9".parse::<DataBits>().is_err());
        assert!("eight".parse::<DataBits>().is_err());
        assert_eq!(DataBits::Six.to_string(), "6");
    }

    #[test]
    fn test_parity_parse() {
        assert_eq!("none".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("Even".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("o".parse::<Parity>().unwrap(), Parity::Odd);
        assert!("mark".parse::<Parity>().is_err());
    }

    #[test]
    fn test_stop_bits_parse() {
        assert_eq!("1".parse::<StopBits>().unwrap(), StopBits::One);
        assert_eq!("two".parse::<StopBits>().unwrap(), StopBits::Two);
        assert!("1.5".parse::<StopBits>().is_err());
    }

    #[test]
    fn test_flow_control_parse() {
        assert_eq!("none".parse::<FlowControl>().unwrap(), FlowControl::None);
        assert_eq!(
            "software".parse::<FlowControl>().unwrap(),
            FlowControl::Software
        );
        assert_eq!(
            "RTSCTS".parse::<FlowControl>().unwrap(),
            FlowControl::Hardware
        );
        assert!("dtr".parse::<FlowControl>().is_err());
    }

    #[test]
    fn test_display_parse_agree() {
        for parity in [Parity::None, Parity::Even, Parity::Odd] {
            assert_eq!(parity.to_string().parse::<Parity>().unwrap(), parity);
        }
        for flow in [
            FlowControl::None,
            FlowControl::Software,
            FlowControl::Hardware,
        ] {
            assert_eq!(flow.to_string().parse::<FlowControl>().unwrap(), flow);
        }
    }
}
