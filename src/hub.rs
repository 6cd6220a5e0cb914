// Opaque link to the physical hub
//
// The console never inspects the transport: the link is a fire-and-forget
// sink for wire commands plus a connected flag.

use std::io::Write;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{info, warn};

use crate::command::WireCommand;
use crate::error::Result;

pub const DEFAULT_BAUDRATE: u32 = 115_200;
const WRITE_TIMEOUT_MS: u64 = 100;

/// Boundary to the physical robot. Commands are fire-and-forget.
pub trait HubLink {
    fn is_connected(&self) -> bool;
    fn send_command(&mut self, cmd: &WireCommand);
}

/// Hub link over a serial port, sending newline-delimited JSON commands
pub struct SerialHubLink {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialHubLink {
    /// Open a connection to the hub on the given serial port
    pub fn open(port_name: &str) -> Result<Self> {
        info!("Opening hub link on {}", port_name);
        let port = serialport::new(port_name, DEFAULT_BAUDRATE)
            .timeout(Duration::from_millis(WRITE_TIMEOUT_MS))
            .open()?;
        Ok(Self { port: Some(port) })
    }

    /// A link with no hub attached; `is_connected` stays false
    pub fn disconnected() -> Self {
        Self { port: None }
    }
}

impl HubLink for SerialHubLink {
    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn send_command(&mut self, cmd: &WireCommand) {
        let Some(port) = &mut self.port else {
            return;
        };
        let mut line = match serde_json::to_vec(cmd) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode command: {}", e);
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = port.write_all(&line) {
            warn!("Hub write failed, dropping link: {}", e);
            self.port = None;
        }
    }
}
