// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transports
//!
//! Byte-stream channels to a TPM: the kernel device (`/dev/tpmrm0` or
//! `/dev/tpm0`) and the Microsoft TPM simulator's TCP protocol.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// A duplex channel carrying one command/response exchange at a time.
pub trait Transport: Send {
    /// (Re)open the underlying channel.
    fn connect(&mut self) -> Result<()>;

    /// Send one complete command.
    fn send(&mut self, command: &[u8]) -> Result<()>;

    /// Block until one complete response has arrived.
    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Power the TPM off and on again. Only simulators can do this.
    fn power_cycle(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "power cycle is only available on a simulator".to_string(),
        ))
    }

    fn close(&mut self) -> Result<()>;

    /// Send a command and wait for its response
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.send(command)?;
        self.receive()
    }
}

fn not_connected(what: &str) -> Error {
    Error::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("{} is not connected", what),
    ))
}

/// Kernel TPM character device
pub struct DeviceTransport {
    path: PathBuf,
    timeout: Duration,
    file: Option<File>,
}

impl DeviceTransport {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            file: None,
        }
    }

    /// Open a TPM device
    pub fn open(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let mut device = Self::new(path, timeout);
        device.connect()?;
        Ok(device)
    }

    /// Detect and open the default TPM device, preferring the resource manager
    pub fn detect(timeout: Duration) -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::open(path, timeout),
            None => Err(Error::Config("TPM device not found".to_string())),
        }
    }

    pub(crate) fn default_path() -> Option<&'static Path> {
        ["/dev/tpmrm0", "/dev/tpm0"]
            .into_iter()
            .map(Path::new)
            .find(|p| p.exists())
    }

    /// Get the device path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wait_readable(file: &File, timeout: Duration) -> Result<()> {
        let mut pollfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            // SAFETY: pollfd is a single valid entry and the fd stays open for the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            match rc {
                0 => return Err(Error::Timeout),
                n if n > 0 => return Ok(()),
                _ => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(Error::Transport(err));
                    }
                }
            }
        }
    }
}

impl Transport for DeviceTransport {
    fn connect(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(Error::Transport)?;
        info!("opened TPM device {}", self.path.display());
        self.file = Some(file);
        Ok(())
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| not_connected("TPM device"))?;
        file.write_all(command)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let file = self.file.as_mut().ok_or_else(|| not_connected("TPM device"))?;
        Self::wait_readable(file, self.timeout)?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = file.read(&mut response)?;
        if n == 0 {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} returned no response", self.path.display()),
            )));
        }
        response.truncate(n);
        Ok(response)
    }

    fn close(&mut self) -> Result<()> {
        if self.file.take().is_some() {
            info!("closed TPM device {}", self.path.display());
        }
        Ok(())
    }
}

/// TPM simulator commands on the command port
mod mssim {
    pub const TPM_SEND_COMMAND: u32 = 8;
    pub const TPM_SESSION_END: u32 = 20;

    // Platform port
    pub const SIGNAL_POWER_ON: u32 = 1;
    pub const SIGNAL_POWER_OFF: u32 = 2;
    pub const SIGNAL_NV_ON: u32 = 11;
}

/// Microsoft TPM 2.0 simulator over TCP
pub struct SimulatorTransport {
    host: String,
    port: u16,
    platform_port: u16,
    locality: u8,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl SimulatorTransport {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 2321;

    /// The platform port is always the command port plus one.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            platform_port: port.wrapping_add(1),
            locality: 0,
            timeout,
            stream: None,
        }
    }

    pub fn with_locality(mut self, locality: u8) -> Self {
        self.locality = locality;
        self
    }

    fn open_stream(&self, port: u16) -> Result<TcpStream> {
        let addr = (self.host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve {}:{}", self.host, port)))?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn read_u32(stream: &mut TcpStream) -> Result<u32> {
        let mut b = [0u8; 4];
        stream.read_exact(&mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn expect_ack(stream: &mut TcpStream, what: &str) -> Result<()> {
        match Self::read_u32(stream)? {
            0 => Ok(()),
            code => Err(Error::Transport(io::Error::new(
                io::ErrorKind::Other,
                format!("simulator rejected {} with {}", what, code),
            ))),
        }
    }

    fn platform_signal(&self, signal: u32) -> Result<()> {
        let mut stream = self.open_stream(self.platform_port)?;
        stream.write_all(&signal.to_be_bytes())?;
        Self::expect_ack(&mut stream, "platform signal")
    }
}

impl Transport for SimulatorTransport {
    fn connect(&mut self) -> Result<()> {
        self.stream = Some(self.open_stream(self.port)?);
        info!("connected to TPM simulator at {}:{}", self.host, self.port);
        Ok(())
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        let locality = self.locality;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| not_connected("TPM simulator"))?;
        let mut frame = Vec::with_capacity(9 + command.len());
        frame.extend_from_slice(&mssim::TPM_SEND_COMMAND.to_be_bytes());
        frame.push(locality);
        frame.extend_from_slice(&(command.len() as u32).to_be_bytes());
        frame.extend_from_slice(command);
        stream.write_all(&frame)?;
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| not_connected("TPM simulator"))?;
        let len = Self::read_u32(stream)? as usize;
        if len > TPM_MAX_COMMAND_SIZE {
            return Err(Error::malformed(format!(
                "simulator response of {} bytes",
                len
            )));
        }
        let mut response = vec![0u8; len];
        stream.read_exact(&mut response)?;
        Self::expect_ack(stream, "command")?;
        Ok(response)
    }

    fn power_cycle(&mut self) -> Result<()> {
        debug!("power cycling TPM simulator");
        self.platform_signal(mssim::SIGNAL_POWER_OFF)?;
        self.platform_signal(mssim::SIGNAL_POWER_ON)?;
        self.platform_signal(mssim::SIGNAL_NV_ON)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            // The simulator drops the connection either way.
            let _ = stream.write_all(&mssim::TPM_SESSION_END.to_be_bytes());
            info!("disconnected from TPM simulator at {}:{}", self.host, self.port);
        }
        Ok(())
    }
}

impl Drop for SimulatorTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
