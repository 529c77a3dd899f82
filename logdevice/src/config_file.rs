use logd_config::{GossipSettings, LogsConfig, RebuildingSettings, ServerConfig, Settings};
use logd_store::LogsDbSettings;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// The on-disk configuration of one node: cluster topology, logs, and
/// every runtime settings block. JSON, like everything operators edit.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodeConfigFile {
    /// Which node of the cluster this process is.
    pub my_node_index: u16,
    pub data_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub server: ServerConfig,
    pub logs: LogsConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub gossip: GossipSettings,
    #[serde(default)]
    pub rebuilding: RebuildingSettings,
    #[serde(default)]
    pub logsdb: LogsDbSettings,
}

impl NodeConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<NodeConfigFile> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        let config: NodeConfigFile = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.validate()?;
        anyhow::ensure!(
            self.server.node(self.my_node_index).is_some(),
            "my_node_index {} is not in the cluster config",
            self.my_node_index
        );
        Ok(())
    }
}
