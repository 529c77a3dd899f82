//! Node assembly: everything below this crate is a subsystem; this crate
//! wires them into a running storage/sequencer node and owns the ordered
//! shutdown sequence.

pub mod appender;
pub mod config_file;
pub mod network_glue;
pub mod server;
pub mod storage_handlers;

pub use config_file::NodeConfigFile;
pub use server::Server;
