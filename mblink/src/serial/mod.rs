//! Serial framings and port configuration

pub(crate) mod ascii;
pub(crate) mod bin;
pub(crate) mod rtu;

use std::str::FromStr;

use crate::error::ConfigError;

/// Number of data bits per character
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataBits {
    /// 5 data bits
    Five,
    /// 6 data bits
    Six,
    /// 7 data bits
    Seven,
    /// 8 data bits
    Eight,
}

impl DataBits {
    /// Convert from the raw bit count
    pub fn from_count(count: u8) -> Result<Self, ConfigError> {
        match count {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ConfigError::BadDataBits(other)),
        }
    }
}

/// Parity checking mode
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Parity bit keeps the character even
    Even,
    /// Parity bit keeps the character odd
    Odd,
    /// Parity bit always set
    Mark,
    /// Parity bit always clear
    Space,
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(Parity::None),
            "even" => Ok(Parity::Even),
            "odd" => Ok(Parity::Odd),
            "mark" => Ok(Parity::Mark),
            "space" => Ok(Parity::Space),
            _ => Err(ConfigError::BadParity(value.to_string())),
        }
    }
}

/// Number of stop bits per character
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopBits {
    /// 1 stop bit
    One,
    /// 1.5 stop bits
    OnePointFive,
    /// 2 stop bits
    Two,
}

impl FromStr for StopBits {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            _ => Err(ConfigError::BadStopBits(value.to_string())),
        }
    }
}

/// Flow control lines, combinable as a bitmask. A direction with no bits set
/// has flow control disabled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlowControl(u32);

impl FlowControl {
    /// No flow control
    pub const DISABLED: FlowControl = FlowControl(0);
    /// Software flow control on receive
    pub const XON_XOFF_IN: FlowControl = FlowControl(1 << 0);
    /// Software flow control on transmit
    pub const XON_XOFF_OUT: FlowControl = FlowControl(1 << 1);
    /// Assert RTS
    pub const RTS: FlowControl = FlowControl(1 << 2);
    /// Monitor CTS
    pub const CTS: FlowControl = FlowControl(1 << 3);
    /// Assert DTR
    pub const DTR: FlowControl = FlowControl(1 << 4);
    /// Monitor DSR
    pub const DSR: FlowControl = FlowControl(1 << 5);

    /// RTS/CTS hardware flow control
    pub const fn rts_cts() -> FlowControl {
        FlowControl(Self::RTS.0 | Self::CTS.0)
    }

    /// DSR/DTR hardware flow control
    pub const fn dsr_dtr() -> FlowControl {
        FlowControl(Self::DSR.0 | Self::DTR.0)
    }

    /// True if every bit of `other` is set in `self`
    pub const fn contains(self, other: FlowControl) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no flow control is enabled
    pub const fn is_disabled(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FlowControl {
    type Output = FlowControl;

    fn bitor(self, rhs: Self) -> Self::Output {
        FlowControl(self.0 | rhs.0)
    }
}

impl FromStr for FlowControl {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(FlowControl::DISABLED),
            "xon/xoff in" => Ok(FlowControl::XON_XOFF_IN),
            "xon/xoff out" => Ok(FlowControl::XON_XOFF_OUT),
            "rts/cts" => Ok(FlowControl::rts_cts()),
            "dsr/dtr" => Ok(FlowControl::dsr_dtr()),
            _ => Err(ConfigError::BadFlowControl(value.to_string())),
        }
    }
}

/// Framing used on the serial line
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SerialEncoding {
    /// ASCII framing, hexadecimal on the wire with an LRC
    Ascii,
    /// RTU framing, raw binary with a CRC
    Rtu,
    /// BIN framing, token-delimited binary with a CRC
    Bin,
}

impl FromStr for SerialEncoding {
    type Err = ConfigError;

    // only the two standard framings are accepted from configuration text,
    // BIN can be selected programmatically
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "ascii" => Ok(SerialEncoding::Ascii),
            "rtu" => Ok(SerialEncoding::Rtu),
            _ => Err(ConfigError::BadEncoding(value.to_string())),
        }
    }
}

/// Serial port configuration
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SerialSettings {
    /// baud rate, must be non-zero
    pub baud_rate: u32,
    /// data bits per character
    pub data_bits: DataBits,
    /// parity mode
    pub parity: Parity,
    /// stop bits per character
    pub stop_bits: StopBits,
    /// flow control on the receive side
    pub flow_control_in: FlowControl,
    /// flow control on the transmit side
    pub flow_control_out: FlowControl,
    /// framing used on the line
    pub encoding: SerialEncoding,
    /// half-duplex line that echoes every transmitted frame back
    pub echo: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control_in: FlowControl::DISABLED,
            flow_control_out: FlowControl::DISABLED,
            encoding: SerialEncoding::Rtu,
            echo: false,
        }
    }
}

impl SerialSettings {
    /// reject settings the driver cannot express before any port is opened
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::BadBaudRate(self.baud_rate));
        }
        if matches!(self.parity, Parity::Mark | Parity::Space) {
            return Err(ConfigError::Unsupported("mark/space parity"));
        }
        if self.stop_bits == StopBits::OnePointFive {
            return Err(ConfigError::Unsupported("1.5 stop bits"));
        }
        let flow = self.flow_control_in | self.flow_control_out;
        if !flow.is_disabled()
            && !flow.contains(FlowControl::XON_XOFF_IN)
            && !flow.contains(FlowControl::XON_XOFF_OUT)
            && !flow.contains(FlowControl::RTS)
            && !flow.contains(FlowControl::CTS)
        {
            return Err(ConfigError::Unsupported("dsr/dtr flow control"));
        }
        Ok(())
    }
}

/// Open a serial port with the provided settings.
///
/// Mark and space parity and 1.5 stop bits pass configuration parsing but
/// cannot be expressed by the underlying driver, so they fail here.
#[cfg(feature = "serial")]
pub(crate) fn open(
    path: &str,
    settings: &SerialSettings,
) -> Result<tokio_serial::SerialStream, crate::error::EndpointError> {
    use tokio_serial::SerialPortBuilderExt;

    settings.validate()?;

    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Mark | Parity::Space => {
            return Err(ConfigError::Unsupported("mark/space parity").into())
        }
    };

    let stop_bits = match settings.stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
        StopBits::OnePointFive => return Err(ConfigError::Unsupported("1.5 stop bits").into()),
    };

    let data_bits = match settings.data_bits {
        DataBits::Five => tokio_serial::DataBits::Five,
        DataBits::Six => tokio_serial::DataBits::Six,
        DataBits::Seven => tokio_serial::DataBits::Seven,
        DataBits::Eight => tokio_serial::DataBits::Eight,
    };

    let flow = settings.flow_control_in | settings.flow_control_out;
    let flow_control = if flow.is_disabled() {
        tokio_serial::FlowControl::None
    } else if flow.contains(FlowControl::XON_XOFF_IN) || flow.contains(FlowControl::XON_XOFF_OUT) {
        tokio_serial::FlowControl::Software
    } else {
        tokio_serial::FlowControl::Hardware
    };

    let stream = tokio_serial::new(path, settings.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .open_native_async()
        .map_err(|err| {
            crate::error::EndpointError::Unavailable(std::io::Error::from(err).kind())
        })?;
    Ok(stream)
}
