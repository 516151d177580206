//! adb server device tracker.
//!
//! Speaks the `host:track-devices` service of a local adb server:
//!
//! ```text
//! client: <len:4 hex>host:track-devices
//! server: OKAY                      | FAIL<len:4 hex><message>
//! server: <len:4 hex><serial>\t<state>\n...   (one snapshot per change)
//! ```
//!
//! Each snapshot lists every attached device. Consecutive snapshots are
//! diffed into add/change/remove events.
//!
//! The connection is read by its own task, which hands whole snapshots to
//! the tracker over a channel. A `next_event` call dropped mid-read loses
//! nothing.

use std::collections::{HashMap, VecDeque};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeviceTracker, TrackerError};
use crate::device::{Device, DeviceEvent, DeviceKind};

pub const DEFAULT_ADB_HOST: &str = "127.0.0.1";
pub const DEFAULT_ADB_PORT: u16 = 5037;

const TRACK_DEVICES: &str = "host:track-devices";

/// Snapshots buffered between the reader task and the tracker.
const SNAPSHOT_BUFFER: usize = 16;

/// Tracks devices through an adb server connection.
#[derive(Debug)]
pub struct AdbTracker {
    snapshots: Option<mpsc::Receiver<Result<String, TrackerError>>>,
    reader: JoinHandle<()>,
    known: HashMap<String, DeviceKind>,
    pending: VecDeque<DeviceEvent>,
}

impl AdbTracker {
    /// Connect to the adb server and start tracking.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TrackerError> {
        let addr = format!("{}:{}", host, port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| TrackerError::Connect {
                addr: addr.clone(),
                source,
            })?;

        stream.write_all(encode_request(TRACK_DEVICES).as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut status = [0u8; 4];
        reader.read_exact(&mut status).await?;

        match &status {
            b"OKAY" => {}
            b"FAIL" => {
                let message = read_message(&mut reader).await?;
                return Err(TrackerError::Rejected(message));
            }
            other => {
                return Err(TrackerError::Protocol(format!(
                    "unexpected status {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        }

        info!(addr = %addr, "Tracking devices");

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let reader = tokio::spawn(read_snapshots(reader, tx));

        Ok(Self {
            snapshots: Some(rx),
            reader,
            known: HashMap::new(),
            pending: VecDeque::new(),
        })
    }

    /// Connection ended: every known device is gone.
    fn close(&mut self) {
        self.snapshots = None;

        let mut removed: Vec<_> = self.known.drain().collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        self.pending.extend(
            removed
                .into_iter()
                .map(|(serial, kind)| DeviceEvent::Removed(Device::new(serial, kind))),
        );
    }
}

#[async_trait::async_trait]
impl DeviceTracker for AdbTracker {
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>, TrackerError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(snapshots) = self.snapshots.as_mut() else {
                return Ok(None);
            };

            let snapshot = match snapshots.recv().await {
                Some(Ok(snapshot)) => snapshot,
                Some(Err(e)) => {
                    self.close();
                    return Err(e);
                }
                None => {
                    warn!("adb server closed the tracking connection");
                    self.close();
                    continue;
                }
            };

            let devices = parse_snapshot(&snapshot)?;
            debug!(devices = devices.len(), "Device snapshot");

            let events = diff_snapshot(&self.known, &devices);
            self.known = devices.into_iter().map(|d| (d.serial, d.kind)).collect();
            self.pending.extend(events);
        }
    }
}

impl Drop for AdbTracker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Forward snapshots until the connection ends or the tracker goes away.
///
/// A clean end of stream closes the channel; any other failure is sent
/// first.
async fn read_snapshots<R>(mut reader: R, tx: mpsc::Sender<Result<String, TrackerError>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = match read_message(&mut reader).await {
            Err(TrackerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            result => result,
        };
        let failed = result.is_err();

        if tx.send(result).await.is_err() || failed {
            return;
        }
    }
}

fn encode_request(service: &str) -> String {
    format!("{:04x}{}", service.len(), service)
}

/// Read one `<len:4 hex><payload>` message.
async fn read_message<R>(reader: &mut R) -> Result<String, TrackerError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let header = std::str::from_utf8(&header)
        .map_err(|_| TrackerError::Protocol("length header is not utf-8".to_string()))?;
    let len = usize::from_str_radix(header, 16)
        .map_err(|_| TrackerError::Protocol(format!("invalid length header {:?}", header)))?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    String::from_utf8(payload)
        .map_err(|_| TrackerError::Protocol("payload is not utf-8".to_string()))
}

/// Parse a snapshot of `serial\tstate` lines.
pub fn parse_snapshot(snapshot: &str) -> Result<Vec<Device>, TrackerError> {
    snapshot
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (serial, state) = line
                .split_once('\t')
                .ok_or_else(|| TrackerError::Protocol(format!("invalid device line {:?}", line)))?;
            Ok(Device::new(serial, DeviceKind::parse(state.trim())))
        })
        .collect()
}

/// Events that turn `known` into `current`.
///
/// Additions and changes follow snapshot order; removals follow serial order.
pub fn diff_snapshot(known: &HashMap<String, DeviceKind>, current: &[Device]) -> Vec<DeviceEvent> {
    let mut events = Vec::new();

    for device in current {
        match known.get(&device.serial) {
            None => events.push(DeviceEvent::Added(device.clone())),
            Some(kind) if *kind != device.kind => events.push(DeviceEvent::Changed(device.clone())),
            Some(_) => {}
        }
    }

    let mut removed: Vec<_> = known
        .iter()
        .filter(|(serial, _)| !current.iter().any(|d| &d.serial == *serial))
        .map(|(serial, kind)| Device::new(serial.clone(), kind.clone()))
        .collect();
    removed.sort_by(|a, b| a.serial.cmp(&b.serial));
    events.extend(removed.into_iter().map(DeviceEvent::Removed));

    events
}
