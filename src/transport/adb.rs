//! ADB server client
//!
//! Speaks the ADB host smart-socket protocol: every request is a 4 digit
//! hex length followed by the payload, answered by `OKAY` or `FAIL` with a
//! hex-length-prefixed message. After `host:transport:<serial>` the same
//! socket is bound to the device and the next request selects a device
//! service.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::config::ConnectionConfig;
use crate::error::{TransportError, TransportResult};
use crate::transport::{BoxedConnection, Transport};

/// Largest payload of one sync `DATA` packet
const SYNC_CHUNK_SIZE: usize = 64 * 1024;

/// Regular file, rw-r--r--
const PUSH_FILE_MODE: u32 = 0o100644;

/// Device state reported for usable devices
const STATE_DEVICE: &str = "device";

/// A device known to the ADB server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device serial
    pub serial: String,
    /// Connection state (`device`, `offline`, `unauthorized`, ...)
    pub state: String,
}

impl DeviceInfo {
    /// Whether the device accepts commands
    pub fn is_online(&self) -> bool {
        self.state == STATE_DEVICE
    }
}

/// Transport backed by a running ADB server
#[derive(Debug, Clone)]
pub struct AdbTransport {
    address: String,
}

impl AdbTransport {
    /// Creates a transport for the ADB server at `address` (`host:port`)
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Creates a transport from the connection settings
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.adb_address())
    }

    /// Returns the ADB server address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Lists devices known to the ADB server
    pub async fn list_devices(&self) -> TransportResult<Vec<DeviceInfo>> {
        let mut stream = self.connect().await?;
        request(&mut stream, "host:devices").await?;
        let listing = read_length_prefixed(&mut stream).await?;
        Ok(parse_device_list(&listing))
    }

    async fn connect(&self) -> TransportResult<TcpStream> {
        let stream = TcpStream::connect(self.address.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Opens a socket bound to `serial`
    async fn device_stream(&self, serial: &str) -> TransportResult<TcpStream> {
        let mut stream = self.connect().await?;
        match request(&mut stream, &format!("host:transport:{}", serial)).await {
            Ok(()) => Ok(stream),
            Err(TransportError::Rejected(reason)) => {
                debug!("Transport to {} rejected: {}", serial, reason);
                Err(TransportError::DeviceNotFound(serial.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Transport for AdbTransport {
    async fn resolve_device(&self, serial: &str) -> TransportResult<()> {
        let devices = self.list_devices().await?;
        match devices.iter().find(|d| d.serial == serial) {
            Some(device) if device.is_online() => Ok(()),
            Some(device) => Err(TransportError::DeviceNotFound(format!(
                "{} is {}",
                serial, device.state
            ))),
            None => Err(TransportError::DeviceNotFound(serial.to_string())),
        }
    }

    async fn open_named_connection(
        &self,
        serial: &str,
        name: &str,
    ) -> TransportResult<BoxedConnection> {
        let mut stream = self.device_stream(serial).await?;
        match request(&mut stream, &format!("localabstract:{}", name)).await {
            Ok(()) => {
                trace!("Opened localabstract:{} on {}", name, serial);
                Ok(Box::new(stream))
            }
            Err(TransportError::Rejected(reason)) => Err(TransportError::NotAvailable(format!(
                "{} ({})",
                name, reason
            ))),
            Err(e) => Err(e),
        }
    }

    async fn push_file(&self, serial: &str, local: &Path, remote: &str) -> TransportResult<()> {
        let mut file = File::open(local).await?;
        let mut stream = self.device_stream(serial).await?;
        request(&mut stream, "sync:").await?;

        let size = sync_send(&mut stream, &mut file, remote, unix_time()).await?;
        info!("Pushed {} ({} bytes) to {}", local.display(), size, remote);
        Ok(())
    }

    async fn execute(&self, serial: &str, argv: &[String]) -> TransportResult<BoxedConnection> {
        let command = argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Executing on {}: {}", serial, command);

        let mut stream = self.device_stream(serial).await?;
        request(&mut stream, &format!("shell:{}", command)).await?;
        Ok(Box::new(stream))
    }
}

/// Sends one smart-socket request and waits for its status
async fn request<S>(stream: &mut S, payload: &str) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    trace!("ADB request: {}", payload);
    stream.write_all(&encode_request(payload)).await?;
    read_status(stream).await
}

fn encode_request(payload: &str) -> Vec<u8> {
    format!("{:04x}{}", payload.len(), payload).into_bytes()
}

async fn read_status<S>(stream: &mut S) -> TransportResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => Err(TransportError::Rejected(read_length_prefixed(stream).await?)),
        other => Err(TransportError::Protocol(format!(
            "unexpected status {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Reads a 4 hex digit length and that many bytes
async fn read_length_prefixed<S>(stream: &mut S) -> TransportResult<String>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = std::str::from_utf8(&len)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| TransportError::Protocol("invalid length prefix".to_string()))?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn parse_device_list(listing: &str) -> Vec<DeviceInfo> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            Some(DeviceInfo {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Runs a sync `SEND` of `source` to `remote` and returns the bytes sent
async fn sync_send<S, R>(stream: &mut S, source: &mut R, remote: &str, mtime: u32) -> TransportResult<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let target = format!("{},{}", remote, PUSH_FILE_MODE);
    write_sync_header(stream, b"SEND", target.len() as u32).await?;
    stream.write_all(target.as_bytes()).await?;

    let mut buf = vec![0u8; SYNC_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_sync_header(stream, b"DATA", n as u32).await?;
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    write_sync_header(stream, b"DONE", mtime).await?;
    stream.flush().await?;

    let mut status = [0u8; 8];
    stream.read_exact(&mut status).await?;
    let len = u32::from_le_bytes([status[4], status[5], status[6], status[7]]) as usize;
    match &status[..4] {
        b"OKAY" => {}
        b"FAIL" => {
            let mut message = vec![0u8; len];
            stream.read_exact(&mut message).await?;
            return Err(TransportError::Rejected(
                String::from_utf8_lossy(&message).into_owned(),
            ));
        }
        other => {
            return Err(TransportError::Protocol(format!(
                "unexpected sync status {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    }

    write_sync_header(stream, b"QUIT", 0).await?;
    Ok(total)
}

async fn write_sync_header<S>(stream: &mut S, id: &[u8; 4], value: u32) -> TransportResult<()>
where
    S: AsyncWrite + Unpin,
{
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(id);
    header[4..].copy_from_slice(&value.to_le_bytes());
    stream.write_all(&header).await?;
    Ok(())
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Quotes an argument for the device shell when needed
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
