//! Server deployment and connection handshake
//!
//! The device server is pushed and started through the transport, then the
//! client opens the video connection (retrying until the server listens)
//! and the control connection, and reads the device name and initial
//! resolution from the video connection.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ServerConfig};
use crate::error::{HandshakeError, MirrorError, Result};
use crate::transport::{BoxedConnection, Transport};
use crate::video::Resolution;

/// Protocol version the client speaks
pub const SERVER_VERSION: &str = "1.20";

/// Where the server jar is pushed on the device
pub const REMOTE_SERVER_PATH: &str = "/data/local/tmp/scrcpy-server.jar";

const SERVER_CLASS: &str = "com.genymobile.scrcpy.Server";

/// Size of the NUL padded device name field
pub const DEVICE_NAME_FIELD_LEN: usize = 64;

/// Delay between attempts to open the video connection
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Identity announced by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Device name
    pub device_name: String,
    /// Initial video resolution
    pub resolution: Resolution,
}

/// Connections and identity produced by a successful handshake
pub struct Handshake {
    /// Stream of the server process, closed to end it
    pub server: BoxedConnection,
    /// Video elementary stream, positioned after the header
    pub video: BoxedConnection,
    /// Control connection, absent when control is disabled
    pub control: Option<BoxedConnection>,
    /// Device identity
    pub info: DeviceIdentity,
}

/// Builds the server command line
///
/// Arguments are positional; their order is part of the protocol.
pub fn server_args(config: &ServerConfig) -> Vec<String> {
    fn or_dash(value: &Option<String>) -> String {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or("-")
            .to_string()
    }

    vec![
        format!("CLASSPATH={}", REMOTE_SERVER_PATH),
        "app_process".to_string(),
        "/".to_string(),
        SERVER_CLASS.to_string(),
        SERVER_VERSION.to_string(),
        config.log_level.clone(),
        config.max_size.to_string(),
        config.bitrate.to_string(),
        config.max_fps.to_string(),
        config.lock_screen_orientation.to_string(),
        // tunnel forward
        "true".to_string(),
        or_dash(&config.crop),
        // send frame meta
        "false".to_string(),
        config.control.to_string(),
        config.display_id.to_string(),
        // show touches
        "false".to_string(),
        config.stay_awake.to_string(),
        or_dash(&config.codec_options),
        or_dash(&config.encoder_name),
        config.power_off_on_close.to_string(),
    ]
}

/// Pushes the server jar and starts it
///
/// Nothing is read from the returned stream; dropping it ends the server.
pub async fn deploy_server(
    transport: &dyn Transport,
    serial: &str,
    config: &ServerConfig,
) -> Result<BoxedConnection> {
    transport
        .push_file(serial, &config.server_path, REMOTE_SERVER_PATH)
        .await?;

    let args = server_args(config);
    debug!("Starting server: {}", args.join(" "));
    let stream = transport.execute(serial, &args).await?;
    info!("Server {} started on {}", SERVER_VERSION, serial);
    Ok(stream)
}

/// Opens a named connection, retrying while the server is not listening
///
/// # Errors
///
/// Returns `MirrorError::ConnectionTimeout` once `timeout` elapses and
/// `MirrorError::Transport` on any other transport failure
pub async fn open_with_retry(
    transport: &dyn Transport,
    serial: &str,
    name: &str,
    timeout: Duration,
) -> Result<BoxedConnection> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt =
            tokio::time::timeout(remaining, transport.open_named_connection(serial, name)).await;

        match attempt {
            Ok(Ok(stream)) => {
                debug!("Opened {} after {} attempt(s)", name, attempts);
                return Ok(stream);
            }
            Ok(Err(e)) if e.is_not_available() => {
                trace!("{} not available yet: {}", name, e);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }

        if Instant::now() + RETRY_INTERVAL >= deadline {
            break;
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }

    warn!("Gave up opening {} after {} attempt(s)", name, attempts);
    Err(MirrorError::ConnectionTimeout(timeout))
}

/// Reads the leading dummy byte
pub async fn read_dummy_byte<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    read_field(stream, &mut byte, "dummy byte").await?;
    match byte[0] {
        0 => Ok(()),
        other => Err(HandshakeError::UnexpectedDummyByte(other).into()),
    }
}

/// Reads the device name and initial resolution
pub async fn read_device_info<S>(stream: &mut S) -> Result<DeviceIdentity>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut name = [0u8; DEVICE_NAME_FIELD_LEN];
    read_field(stream, &mut name, "device name").await?;
    let device_name = parse_device_name(&name)?;

    let mut size = [0u8; 4];
    read_field(stream, &mut size, "resolution").await?;
    let width = u16::from_be_bytes([size[0], size[1]]);
    let height = u16::from_be_bytes([size[2], size[3]]);

    Ok(DeviceIdentity {
        device_name,
        resolution: Resolution::new(width.into(), height.into()),
    })
}

fn parse_device_name(field: &[u8]) -> std::result::Result<String, HandshakeError> {
    let name = std::str::from_utf8(field).map_err(|_| HandshakeError::InvalidDeviceName)?;
    let name = name.trim_end_matches('\0');
    if name.is_empty() {
        return Err(HandshakeError::EmptyDeviceName);
    }
    Ok(name.to_string())
}

async fn read_field<S>(stream: &mut S, buf: &mut [u8], field: &'static str) -> Result<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(HandshakeError::StreamClosed(field).into())
        }
        Err(e) => Err(MirrorError::Socket(format!("reading {}: {}", field, e))),
    }
}

/// Deploys the server and performs the full handshake
///
/// Everything opened so far is dropped, and therefore closed, on failure.
pub async fn connect(transport: &dyn Transport, serial: &str, config: &Config) -> Result<Handshake> {
    let server = deploy_server(transport, serial, &config.server).await?;

    let socket = config.connection.socket_name.as_str();
    let timeout = config.connection.connection_timeout();
    let mut video = open_with_retry(transport, serial, socket, timeout).await?;
    read_dummy_byte(&mut video).await?;

    let control = if config.server.control {
        Some(transport.open_named_connection(serial, socket).await?)
    } else {
        None
    };

    let info = read_device_info(&mut video).await?;
    info!(
        "Connected to {} ({}) at {}",
        info.device_name, serial, info.resolution
    );

    Ok(Handshake {
        server,
        video,
        control,
        info,
    })
}
