pub mod logs_config;
pub mod serde_duration;
pub mod server_config;
pub mod settings;
pub mod updateable;

pub use logs_config::{LogAttributes, LogsConfig};
pub use server_config::{NodeConfig, NodeLocation, ServerConfig};
pub use settings::{GossipSettings, RebuildingSettings, Settings};
pub use updateable::{ConfigSubscription, UpdateableConfig, UpdateableSettings};
