//! IO modules - external system interfaces
//!
//! - `serial_board` - serial sensor board and still-capture command
//! - `simulator` - in-process board driven by injected signals
//! - `classifier` - HTTP image classifier client
//! - `snapshot` - inventory snapshot file
//! - `mqtt_egress` - MQTT notification transport
//! - `http_server` - Prometheus metrics and inventory endpoints

pub mod classifier;
pub mod http_server;
pub mod mqtt_egress;
pub mod serial_board;
pub mod simulator;
pub mod snapshot;

pub use classifier::HttpClassifier;
pub use mqtt_egress::MqttTransport;
pub use serial_board::SerialBoard;
pub use simulator::{SimulatedBoard, SimulatorHandle};
pub use snapshot::SnapshotFile;
