use std::io::{BufRead, Write};

use serialport::{SerialPortInfo, SerialPortType};

use crate::error::{Error, Result};

/// Substrings of a port description that suggest a microcontroller (or the
/// kind of generic USB-serial bridge that boards tend to use).
pub const DEVICE_MARKERS: [&str; 2] = ["Arduino", "USB Serial"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub description: String,
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> PortCandidate {
        let description = match info.port_type {
            SerialPortType::UsbPort(usb) => match (usb.product, usb.manufacturer) {
                (Some(product), Some(manufacturer)) => format!("{product} ({manufacturer})"),
                (Some(product), None) => product,
                (None, Some(manufacturer)) => manufacturer,
                (None, None) => format!("USB device {:04x}:{:04x}", usb.vid, usb.pid),
            },
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::Unknown => "Unknown".to_string(),
        };
        PortCandidate {
            name: info.port_name,
            description,
        }
    }
}

pub fn available_candidates() -> Result<Vec<PortCandidate>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(PortCandidate::from)
        .collect())
}

/// Returns the first port that looks like our device. This is purely a guess
/// based on the description: nobody checks that the device actually speaks our
/// protocol until the session starts reading from it.
pub fn find_device_port(candidates: &[PortCandidate]) -> Option<&PortCandidate> {
    candidates.iter().find(|candidate| {
        DEVICE_MARKERS
            .iter()
            .any(|marker| candidate.description.contains(marker))
    })
}

/// Decides which port a session should open.
pub trait PortResolver {
    fn resolve(&mut self) -> Result<String>;
}

/// A port chosen up front, e.g. on the command line.
pub struct FixedPort(pub String);

impl PortResolver for FixedPort {
    fn resolve(&mut self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Auto-detects the device, and asks the operator if that fails.
pub struct PromptResolver<R: BufRead, W: Write> {
    candidates: Vec<PortCandidate>,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptResolver<R, W> {
    pub fn new(candidates: Vec<PortCandidate>, input: R, output: W) -> PromptResolver<R, W> {
        PromptResolver {
            candidates,
            input,
            output,
        }
    }
}

impl PromptResolver<std::io::StdinLock<'static>, std::io::Stderr> {
    pub fn from_system() -> Result<Self> {
        Ok(PromptResolver::new(
            available_candidates()?,
            std::io::stdin().lock(),
            std::io::stderr(),
        ))
    }
}

impl<R: BufRead, W: Write> PortResolver for PromptResolver<R, W> {
    fn resolve(&mut self) -> Result<String> {
        if let Some(candidate) = find_device_port(&self.candidates) {
            log::info!(
                "Found device on {} ({})",
                candidate.name,
                candidate.description
            );
            return Ok(candidate.name.clone());
        }

        writeln!(self.output, "No device found. Available ports:")?;
        for candidate in &self.candidates {
            writeln!(
                self.output,
                "  {}: {}",
                candidate.name, candidate.description
            )?;
        }
        write!(self.output, "Please enter your port manually: ")?;
        self.output.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        match line.trim() {
            "" => Err(Error::NoPortSelected),
            port => Ok(port.to_string()),
        }
    }
}
