#![deny(missing_docs)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! Device orchestration for a fleet of 3d printers: serial and network
//! transports behind one trait, per-device print queues with priority
//! scheduling, circuit-breaker failure recovery, and a broadcast event
//! surface, all behind a single [Orchestrator] facade.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod telemetry;
pub mod transport;

pub use config::{DeviceConfig, FarmConfig, TransportConfig};
pub use error::{Error, Result};
pub use event::Event;
pub use job::{FileRef, JobStatus, PrintJob, MAX_PRIORITY};
pub use orchestrator::Orchestrator;
pub use telemetry::{ConnectionStatus, DeviceSnapshot, PrinterStatus, Telemetry};
