//! Physical sensor board on a serial link, plus the still-capture camera
//!
//! Protocol (9600 8N1), board → gateway, 5-byte frames:
//! - `[0xFE, kind, hi, lo, 0x0E]`, value = big-endian u16 (`hi << 8 | lo`)
//! - kind 0x01: button, value 1 = PLACE, 2 = TAKE
//! - kind 0x02: ranging sensor, value = distance in millimetres
//! - kind 0x03: face detector, value = face width in pixels
//!
//! Frames may arrive split across reads; the decoder keeps partial bytes and
//! resynchronizes on the header byte after garbage.
//!
//! Frames are captured by running an external still-capture command that
//! writes a JPEG to `{output}`; the child is killed when the capture future
//! is dropped (timeout or session abort).

use crate::domain::error::HardwareError;
use crate::domain::types::{Channel, ImageRef};
use crate::infra::config::Config;
use crate::services::hardware::{RawSignal, SignalSource};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

// Protocol constants
const HEADER: u8 = 0xFE;
const TAIL: u8 = 0x0E;
const FRAME_LEN: usize = 5;

const KIND_BUTTON: u8 = 0x01;
const KIND_DISTANCE_MM: u8 = 0x02;
const KIND_FACE_WIDTH_PX: u8 = 0x03;

const BUTTON_PLACE: u16 = 1;
const BUTTON_TAKE: u16 = 2;

/// Face width (px) observed at the reference distance
const REFERENCE_FACE_WIDTH_PX: f64 = 150.0;
const REFERENCE_FACE_DISTANCE_CM: f64 = 50.0;

const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Estimate distance from an apparent face width (pinhole model)
pub fn face_width_to_distance_cm(width_px: u16) -> Option<f64> {
    if width_px == 0 {
        return None;
    }
    Some(REFERENCE_FACE_WIDTH_PX * REFERENCE_FACE_DISTANCE_CM / f64::from(width_px))
}

/// Incremental frame decoder over a byte stream
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(64) }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop bytes until the buffer starts with the header byte
    fn synchronize(&mut self) {
        match self.buffer.iter().position(|&b| b == HEADER) {
            Some(0) => {}
            Some(start) => {
                debug!(discarded = start, "serial_sync_discarded_bytes");
                self.buffer.advance(start);
            }
            None => {
                if !self.buffer.is_empty() {
                    debug!(discarded = self.buffer.len(), "serial_sync_no_header");
                    self.buffer.clear();
                }
            }
        }
    }

    /// Next decodable signal, or `None` when more bytes are needed
    pub fn next_signal(&mut self) -> Option<RawSignal> {
        loop {
            self.synchronize();
            if self.buffer.len() < FRAME_LEN {
                return None;
            }

            if self.buffer[FRAME_LEN - 1] != TAIL {
                // False header; skip it and resync
                self.buffer.advance(1);
                continue;
            }

            let frame = self.buffer.split_to(FRAME_LEN);
            let kind = frame[1];
            let value = u16::from_be_bytes([frame[2], frame[3]]);
            trace!(kind = %kind, value = %value, raw = %hex::encode(&frame[..]), "serial_frame");

            match Self::to_signal(kind, value) {
                Some(signal) => return Some(signal),
                None => {
                    warn!(kind = %kind, value = %value, "serial_frame_unrecognized");
                }
            }
        }
    }

    fn to_signal(kind: u8, value: u16) -> Option<RawSignal> {
        match kind {
            KIND_BUTTON => match value {
                BUTTON_PLACE => Some(RawSignal::Button { channel: Channel::Place }),
                BUTTON_TAKE => Some(RawSignal::Button { channel: Channel::Take }),
                _ => None,
            },
            KIND_DISTANCE_MM => {
                Some(RawSignal::Proximity { distance_cm: f64::from(value) / 10.0, face_id: None })
            }
            KIND_FACE_WIDTH_PX => face_width_to_distance_cm(value)
                .map(|distance_cm| RawSignal::Proximity { distance_cm, face_id: None }),
            _ => None,
        }
    }
}

pub struct SerialBoard {
    device: String,
    baud: u32,
    port: tokio::sync::Mutex<Option<SerialStream>>,
    capture_command: Vec<String>,
    capture_dir: PathBuf,
    frame_counter: AtomicU64,
}

impl SerialBoard {
    /// Open the serial port; failure means the physical variant is unavailable
    pub fn open(config: &Config) -> Result<Self, HardwareError> {
        if config.capture_command().is_empty() {
            return Err(HardwareError::Unavailable("no capture command configured".to_string()));
        }

        let port = tokio_serial::new(config.serial_device(), config.serial_baud())
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| {
                HardwareError::Unavailable(format!("{}: {e}", config.serial_device()))
            })?;

        info!(device = %config.serial_device(), baud = %config.serial_baud(), "serial_port_opened");

        Ok(Self {
            device: config.serial_device().to_string(),
            baud: config.serial_baud(),
            port: tokio::sync::Mutex::new(Some(port)),
            capture_command: config.capture_command().to_vec(),
            capture_dir: config.capture_dir(),
            frame_counter: AtomicU64::new(0),
        })
    }

    fn build_capture_args(&self, output: &str) -> Vec<String> {
        self.capture_command.iter().skip(1).map(|arg| arg.replace(OUTPUT_PLACEHOLDER, output)).collect()
    }
}

#[async_trait]
impl SignalSource for SerialBoard {
    fn name(&self) -> &str {
        "serial_board"
    }

    async fn run(&self, tx: mpsc::Sender<RawSignal>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut port) = self.port.lock().await.take() else {
            warn!(device = %self.device, "serial_board_already_running");
            return;
        };
        info!(device = %self.device, baud = %self.baud, "serial_board_started");

        let mut decoder = FrameDecoder::new();
        let mut read_buf = [0u8; 64];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                read = port.read(&mut read_buf) => {
                    match read {
                        Ok(0) => tokio::time::sleep(Duration::from_millis(50)).await,
                        Ok(n) => {
                            decoder.extend(&read_buf[..n]);
                            while let Some(signal) = decoder.next_signal() {
                                if tx.send(signal).await.is_err() {
                                    info!("serial_board_consumer_gone");
                                    return;
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!(device = %self.device, error = %e, "serial_read_error");
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }
        info!(device = %self.device, "serial_board_stopped");
    }

    async fn capture(&self) -> Result<ImageRef, HardwareError> {
        let n = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("cam-{}-{n}", chrono::Utc::now().format("%Y%m%dT%H%M%S"));
        let path = self.capture_dir.join(format!("{id}.jpg"));

        tokio::fs::create_dir_all(&self.capture_dir)
            .await
            .map_err(|e| HardwareError::Unavailable(format!("capture dir: {e}")))?;

        let program = &self.capture_command[0];
        let output = Command::new(program)
            .args(self.build_capture_args(&path.display().to_string()))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HardwareError::Unavailable(format!("{program} spawn failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HardwareError::Unavailable(format!(
                "{program} failed: {}",
                stderr.trim()
            )));
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.len() > 0 => Ok(ImageRef::new(id, path)),
            _ => Err(HardwareError::Unavailable(format!("{program} produced no frame"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_button_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xFE, 0x01, 0x00, 0x01, 0x0E, 0xFE, 0x01, 0x00, 0x02, 0x0E]);

        assert_eq!(decoder.next_signal(), Some(RawSignal::Button { channel: Channel::Place }));
        assert_eq!(decoder.next_signal(), Some(RawSignal::Button { channel: Channel::Take }));
        assert_eq!(decoder.next_signal(), None);
    }

    #[test]
    fn test_decode_split_frame() {
        let mut decoder = FrameDecoder::new();
        // 450 mm = 0x01C2
        decoder.extend(&[0xFE, 0x02, 0x01]);
        assert_eq!(decoder.next_signal(), None);
        assert_eq!(decoder.buffered(), 3);

        decoder.extend(&[0xC2, 0x0E]);
        assert_eq!(
            decoder.next_signal(),
            Some(RawSignal::Proximity { distance_cm: 45.0, face_id: None })
        );
    }

    #[test]
    fn test_decoder_resyncs_after_garbage() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x00, 0x13, 0xFE, 0x99, 0xFE, 0x01, 0x00, 0x02, 0x0E]);
        assert_eq!(decoder.next_signal(), Some(RawSignal::Button { channel: Channel::Take }));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_unknown_frames_are_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xFE, 0x07, 0x00, 0x01, 0x0E, 0xFE, 0x01, 0x00, 0x09, 0x0E]);
        decoder.extend(&[0xFE, 0x01, 0x00, 0x01, 0x0E]);
        assert_eq!(decoder.next_signal(), Some(RawSignal::Button { channel: Channel::Place }));
    }

    #[test]
    fn test_face_width_distance() {
        assert_eq!(face_width_to_distance_cm(150), Some(50.0));
        assert_eq!(face_width_to_distance_cm(300), Some(25.0));
        assert_eq!(face_width_to_distance_cm(0), None);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xFE, 0x03, 0x00, 0x4B, 0x0E]); // 75 px
        assert_eq!(
            decoder.next_signal(),
            Some(RawSignal::Proximity { distance_cm: 100.0, face_id: None })
        );
    }

    #[tokio::test]
    async fn test_open_missing_device_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[hardware]\nserial_device = \"{}\"\n",
            dir.path().join("no-such-tty").display()
        );
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, toml).unwrap();
        let config = Config::from_file(&path).unwrap();

        assert!(matches!(SerialBoard::open(&config), Err(HardwareError::Unavailable(_))));
    }
}
