//! Satellite listener and sessions

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

use super::device::{DeviceCapabilities, SatelliteDevice};
use super::protocol::{error_reply, parse_line, quote, Command, PROTOCOL_VERSION};
use super::{hub_device_id, SatelliteConfig, DEFAULT_KEYS_PER_ROW, DEFAULT_KEYS_TOTAL};
use crate::error::HubError;
use crate::surface::{DeviceInfo, SurfaceAdapter, SurfaceHost};

/// Lines buffered per bridge socket before output is dropped
const OUTBOUND_CAPACITY: usize = 1024;

/// Why a command was refused; the message is the reply text
#[derive(Debug, Error)]
pub enum SatelliteError {
    /// Required field absent or empty
    #[error("Missing {0}")]
    MissingField(&'static str),

    /// Field present but unparsable
    #[error("Invalid {0}")]
    InvalidField(&'static str),

    /// Same socket added this device already
    #[error("Device already added")]
    AlreadyAdded,

    /// Another socket owns this device id
    #[error("Device exists elsewhere")]
    ExistsElsewhere,

    /// No such device on any socket
    #[error("Device not found")]
    DeviceNotFound,

    /// Device belongs to another socket
    #[error("Device not owned by this connection")]
    NotOwned,

    /// The surface layer refused
    #[error("{0}")]
    Surface(#[from] HubError),
}

impl From<SatelliteError> for HubError {
    fn from(err: SatelliteError) -> Self {
        match err {
            SatelliteError::Surface(inner) => inner,
            other @ SatelliteError::NotOwned => HubError::Unauthorized(other.to_string()),
            other => HubError::Protocol(other.to_string()),
        }
    }
}

/// State shared by every session
struct Shared {
    config: SatelliteConfig,
    surfaces: SurfaceHost,
    /// Bridge device id → device, owned by the socket that added it
    devices: DashMap<String, SatelliteDevice>,
    next_socket: AtomicU64,
}

/// TCP listener for satellite bridges
pub struct SatelliteServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl SatelliteServer {
    /// Bind the listen address
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind(config: SatelliteConfig, surfaces: SurfaceHost) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        info!(addr = %listener.local_addr()?, "Listening for satellite bridges");
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                surfaces,
                devices: DashMap::new(),
                next_socket: AtomicU64::new(1),
            }),
        })
    }

    /// Bound address (resolves port 0)
    ///
    /// # Errors
    ///
    /// Returns the socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept bridges until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let socket_id = self.shared.next_socket.fetch_add(1, Ordering::Relaxed);
                        let shared = Arc::clone(&self.shared);
                        let shutdown = shutdown.clone();
                        tokio::spawn(
                            serve_socket(stream, socket_id, shared, shutdown)
                                .instrument(tracing::info_span!("satellite_socket", socket_id, %peer)),
                        );
                    }
                    Err(e) => error!(error = %e, "Satellite accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Satellite listener stopped");
    }
}

enum Flow {
    Continue,
    Quit,
}

struct Session {
    socket_id: u64,
    shared: Arc<Shared>,
    out: mpsc::Sender<String>,
}

async fn serve_socket(
    stream: TcpStream,
    socket_id: u64,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, mut write) = stream.into_split();
    let (out, mut outbound) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

    let mut writer = tokio::spawn(async move {
        while let Some(line) = outbound.recv().await {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if let Err(e) = write.write_all(&bytes).await {
                debug!(error = %e, "Satellite write failed");
                break;
            }
        }
    });

    let session = Session {
        socket_id,
        shared,
        out,
    };
    session.send(format!(
        "BEGIN KeyhubVersion={} ApiVersion={PROTOCOL_VERSION}",
        env!("CARGO_PKG_VERSION")
    ));
    info!("Satellite bridge connected");

    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Flow::Quit = session.handle(&line).await {
                        debug!("Bridge sent QUIT");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Satellite read failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    session.detach_all().await;
    drop(session);
    if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    info!("Satellite bridge disconnected");
}

impl Session {
    fn send(&self, line: String) {
        match self.out.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(line)) => debug!(%line, "Satellite output queue full, reply dropped"),
            Err(TrySendError::Closed(_)) => debug!("Satellite writer gone, reply dropped"),
        }
    }

    async fn handle(&self, line: &str) -> Flow {
        let Some(cmd) = parse_line(line) else {
            return Flow::Continue;
        };

        let result = match cmd.name.as_str() {
            "ADD-DEVICE" => self.add_device(&cmd).await,
            "REMOVE-DEVICE" => self.remove_device(&cmd).await,
            "KEY-PRESS" => self.key_press(&cmd),
            "PING" => {
                if cmd.rest.is_empty() {
                    self.send("PONG".to_string());
                } else {
                    self.send(format!("PONG {}", cmd.rest));
                }
                Ok(())
            }
            "PONG" => Ok(()),
            "QUIT" => return Flow::Quit,
            other => {
                self.send(error_reply(None, &format!("Unknown command: {other}")));
                return Flow::Continue;
            }
        };

        if let Err(e) = result {
            debug!(command = %cmd.name, error = %e, "Satellite command refused");
            self.send(error_reply(Some(cmd.name.as_str()), &e.to_string()));
        }
        Flow::Continue
    }

    async fn add_device(&self, cmd: &Command) -> Result<(), SatelliteError> {
        let raw_id = required(cmd, "DEVICEID")?;
        let product = required(cmd, "PRODUCT_NAME")?;
        let config = &self.shared.config;
        let keys_total = cmd
            .u32_field("KEYS_TOTAL")
            .unwrap_or(DEFAULT_KEYS_TOTAL)
            .clamp(1, config.max_keys_total);
        let keys_per_row = cmd
            .u32_field("KEYS_PER_ROW")
            .unwrap_or(DEFAULT_KEYS_PER_ROW)
            .clamp(1, config.max_keys_per_row);
        let capabilities = DeviceCapabilities {
            bitmaps: flag(cmd, "BITMAPS", true)?,
            colors: flag(cmd, "COLORS", false)?,
            text: flag(cmd, "TEXT", false)?,
        };

        let device = SatelliteDevice::new(
            raw_id,
            self.socket_id,
            capabilities,
            keys_total,
            keys_per_row,
            self.out.clone(),
        );
        match self.shared.devices.entry(raw_id.to_string()) {
            Entry::Occupied(owner) if owner.get().socket_id() == self.socket_id => {
                return Err(SatelliteError::AlreadyAdded)
            }
            Entry::Occupied(_) => return Err(SatelliteError::ExistsElsewhere),
            Entry::Vacant(slot) => {
                slot.insert(device.clone());
            }
        }

        self.send(format!("ADD-DEVICE OK DEVICEID={}", quote(raw_id)));

        let info = DeviceInfo {
            id: hub_device_id(raw_id),
            name: product.to_string(),
            uid: raw_id.to_string(),
        };
        let (keys_total, keys_per_row) = device.grid();
        info!(
            device_id = %info.id,
            keys_total,
            keys_per_row,
            capabilities = ?device.capabilities(),
            "Satellite device added"
        );

        // The OK is already out, so a refused attach is reported as an error
        // for the same command and the id is freed again
        if let Err(e) = self
            .shared
            .surfaces
            .surface_connected(info, SurfaceAdapter::Satellite(device))
            .await
        {
            warn!(device = raw_id, error = %e, "Surface host refused satellite device");
            self.release(raw_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Forget a device if this socket still owns it
    fn release(&self, raw_id: &str) {
        self.shared
            .devices
            .remove_if(raw_id, |_, device| device.socket_id() == self.socket_id);
    }

    async fn remove_device(&self, cmd: &Command) -> Result<(), SatelliteError> {
        let raw_id = required(cmd, "DEVICEID")?;
        self.check_owner(raw_id)?;
        self.release(raw_id);

        if let Err(e) = self
            .shared
            .surfaces
            .surface_disconnected(&hub_device_id(raw_id))
            .await
        {
            debug!(device = raw_id, error = %e, "Surface already detached");
        }
        self.send(format!("REMOVE-DEVICE OK DEVICEID={}", quote(raw_id)));
        Ok(())
    }

    fn key_press(&self, cmd: &Command) -> Result<(), SatelliteError> {
        let raw_id = required(cmd, "DEVICEID")?;
        let slot = required(cmd, "SLOT")?;
        let pressed = match cmd.bool_field("PRESSED") {
            Some(Ok(pressed)) => pressed,
            Some(Err(())) => return Err(SatelliteError::InvalidField("PRESSED")),
            None => return Err(SatelliteError::MissingField("PRESSED")),
        };
        self.check_owner(raw_id)?;

        self.shared
            .surfaces
            .surface_control_input(&hub_device_id(raw_id), slot, pressed)?;
        self.send("KEY-PRESS OK".to_string());
        Ok(())
    }

    fn check_owner(&self, raw_id: &str) -> Result<(), SatelliteError> {
        match self.shared.devices.get(raw_id) {
            None => Err(SatelliteError::DeviceNotFound),
            Some(device) if device.socket_id() != self.socket_id => Err(SatelliteError::NotOwned),
            Some(_) => Ok(()),
        }
    }

    /// Disconnect every device this socket added
    async fn detach_all(&self) {
        let mine: Vec<String> = self
            .shared
            .devices
            .iter()
            .filter(|entry| entry.value().socket_id() == self.socket_id)
            .map(|entry| entry.key().clone())
            .collect();

        for raw_id in mine {
            self.release(&raw_id);
            if let Err(e) = self
                .shared
                .surfaces
                .surface_disconnected(&hub_device_id(&raw_id))
                .await
            {
                debug!(device = %raw_id, error = %e, "Surface already detached");
            }
        }
    }
}

fn required<'c>(cmd: &'c Command, key: &'static str) -> Result<&'c str, SatelliteError> {
    cmd.field(key)
        .filter(|value| !value.is_empty())
        .ok_or(SatelliteError::MissingField(key))
}

fn flag(cmd: &Command, key: &'static str, default: bool) -> Result<bool, SatelliteError> {
    match cmd.bool_field(key) {
        None => Ok(default),
        Some(Ok(value)) => Ok(value),
        Some(Err(())) => Err(SatelliteError::InvalidField(key)),
    }
}
