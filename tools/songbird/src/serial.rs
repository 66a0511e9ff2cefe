use crate::errors::SongbirdError;
use crate::logging::append_run_log;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Written during the probe stage. The firmware ignores line terminators.
const PROBE_BYTE: u8 = b'\n';

/// Serial control path of the effects device. One ASCII byte selects a mode; nothing is read back.
pub trait ControlChannel: Send + Sync {
    fn probe(&self, path: &Path, timeout: Duration) -> Result<(), SongbirdError>;
    fn configure(&self, path: &Path, baud_rate: u32) -> Result<(), SongbirdError>;
    fn send_command(&self, path: &Path, command: u8) -> Result<(), SongbirdError>;
}

const DEFAULT_BAUD_RATE: u32 = 115_200;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens the port per operation so a replugged device is picked up without restarting.
/// `configure` records the baud rate used by later commands.
pub struct SerialControlChannel {
    baud_rate: Mutex<u32>,
    write_timeout: Duration,
}

impl Default for SerialControlChannel {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE, DEFAULT_WRITE_TIMEOUT)
    }
}

impl SerialControlChannel {
    pub fn new(baud_rate: u32, write_timeout: Duration) -> Self {
        Self {
            baud_rate: Mutex::new(baud_rate),
            write_timeout,
        }
    }

    fn current_baud(&self) -> u32 {
        self.baud_rate
            .lock()
            .map(|baud| *baud)
            .unwrap_or(DEFAULT_BAUD_RATE)
    }

    fn open(
        &self,
        path: &Path,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn serialport::SerialPort>, SongbirdError> {
        serialport::new(path.to_string_lossy(), baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| SongbirdError::Hardware(format!("open {}: {e}", path.display())))
    }

    fn write_byte(
        port: &mut dyn serialport::SerialPort,
        path: &Path,
        byte: u8,
    ) -> Result<(), SongbirdError> {
        port.write_all(&[byte])
            .and_then(|()| port.flush())
            .map_err(|e| SongbirdError::Hardware(format!("write {}: {e}", path.display())))
    }
}

impl ControlChannel for SerialControlChannel {
    fn probe(&self, path: &Path, timeout: Duration) -> Result<(), SongbirdError> {
        let mut port = self.open(path, self.current_baud(), timeout)?;
        Self::write_byte(port.as_mut(), path, PROBE_BYTE)
    }

    fn configure(&self, path: &Path, baud_rate: u32) -> Result<(), SongbirdError> {
        let mut port = self.open(path, baud_rate, self.write_timeout)?;
        port.set_baud_rate(baud_rate)
            .and_then(|()| port.set_data_bits(serialport::DataBits::Eight))
            .and_then(|()| port.set_parity(serialport::Parity::None))
            .and_then(|()| port.set_stop_bits(serialport::StopBits::One))
            .map_err(|e| SongbirdError::Hardware(format!("configure {}: {e}", path.display())))?;
        if let Ok(mut slot) = self.baud_rate.lock() {
            *slot = baud_rate;
        }
        Ok(())
    }

    fn send_command(&self, path: &Path, command: u8) -> Result<(), SongbirdError> {
        let mut port = self.open(path, self.current_baud(), self.write_timeout)?;
        Self::write_byte(port.as_mut(), path, command)?;
        append_run_log(
            "debug",
            "device.command.sent",
            json!({
                "device_path": path.display().to_string(),
                "command": char::from(command).to_string(),
            }),
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Probe(PathBuf),
    Configure(PathBuf, u32),
    Command(PathBuf, u8),
}

/// Records every call; individual operations can be scripted to fail.
#[derive(Default, Clone)]
pub struct FakeControlChannel {
    calls: Arc<Mutex<Vec<ChannelCall>>>,
    probe_failures: Arc<Mutex<usize>>,
    configure_failures: Arc<Mutex<usize>>,
    command_failures: Arc<Mutex<usize>>,
}

impl FakeControlChannel {
    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Command bytes sent so far, as characters.
    pub fn commands(&self) -> String {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChannelCall::Command(_, byte) => Some(char::from(byte)),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next_probes(&self, count: usize) {
        *self.probe_failures.lock().expect("probe lock") = count;
    }

    pub fn fail_next_configures(&self, count: usize) {
        *self.configure_failures.lock().expect("configure lock") = count;
    }

    pub fn fail_next_commands(&self, count: usize) {
        *self.command_failures.lock().expect("command lock") = count;
    }

    fn take_failure(slot: &Mutex<usize>) -> bool {
        let mut remaining = slot.lock().expect("failure lock");
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
        false
    }
}

impl ControlChannel for FakeControlChannel {
    fn probe(&self, path: &Path, _timeout: Duration) -> Result<(), SongbirdError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(ChannelCall::Probe(path.to_path_buf()));
        if Self::take_failure(&self.probe_failures) {
            return Err(SongbirdError::Hardware(format!(
                "write {}: timed out",
                path.display()
            )));
        }
        Ok(())
    }

    fn configure(&self, path: &Path, baud_rate: u32) -> Result<(), SongbirdError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(ChannelCall::Configure(path.to_path_buf(), baud_rate));
        if Self::take_failure(&self.configure_failures) {
            return Err(SongbirdError::Hardware(format!(
                "configure {}: permission denied",
                path.display()
            )));
        }
        Ok(())
    }

    fn send_command(&self, path: &Path, command: u8) -> Result<(), SongbirdError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(ChannelCall::Command(path.to_path_buf(), command));
        if Self::take_failure(&self.command_failures) {
            return Err(SongbirdError::Hardware(format!(
                "write {}: device disconnected",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_channel_records_commands_and_consumes_failures() {
        let channel = FakeControlChannel::default();
        let path = Path::new("/dev/ttyACM0");
        channel.fail_next_commands(1);

        assert!(channel.send_command(path, b'n').is_err());
        channel.send_command(path, b'p').expect("second send");
        assert_eq!(channel.commands(), "np");
    }

    #[test]
    fn opening_a_missing_port_is_a_hardware_error() {
        let channel = SerialControlChannel::new(115_200, Duration::from_millis(50));
        let err = channel
            .probe(Path::new("/nonexistent/songbird-port"), Duration::from_millis(50))
            .expect_err("missing port");
        assert!(matches!(err, SongbirdError::Hardware(_)));
    }
}
