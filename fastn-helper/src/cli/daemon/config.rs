//! `helper.json`: settings that outlive a single daemon run

use std::path::Path;

pub const CONFIG_FILE: &str = "helper.json";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Upcalls that may queue up before network activity waits for the host.
    pub upcall_capacity: usize,
    pub bind_port: Option<u16>,
    pub discovery: bool,
    pub relay: bool,
    /// Protocols accepted from peers before the host registers any.
    pub stream_handlers: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            upcall_capacity: fastn_helper_core::DEFAULT_UPCALL_CAPACITY,
            bind_port: None,
            discovery: true,
            relay: true,
            stream_handlers: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Reads `helper.json` from FASTN_HOME. A missing file is written with
    /// the defaults so there is something to edit.
    pub async fn load(fastn_home: &Path) -> eyre::Result<Self> {
        let path = fastn_home.join(CONFIG_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                match config.save(fastn_home).await {
                    Ok(()) => eprintln!("📝 Wrote default config to: {}", path.display()),
                    Err(e) => eprintln!("⚠️  Could not write {} ({e})", path.display()),
                }
                return Ok(config);
            }
            Err(e) => return Err(eyre::eyre!("failed to read {}: {e}", path.display())),
        };

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| eyre::eyre!("invalid config in {}: {e}", path.display()))?;
        if config.upcall_capacity == 0 {
            return Err(eyre::eyre!(
                "upcall_capacity in {} must be at least 1",
                path.display()
            ));
        }
        Ok(config)
    }

    pub async fn save(&self, fastn_home: &Path) -> eyre::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(fastn_home.join(CONFIG_FILE), content).await?;
        Ok(())
    }

    /// Applies command line flags on top of the file.
    pub fn with_options(mut self, options: &super::DaemonOptions) -> Self {
        if let Some(capacity) = options.upcall_capacity {
            self.upcall_capacity = capacity.max(1);
        }
        if options.port.is_some() {
            self.bind_port = options.port;
        }
        if options.no_discovery {
            self.discovery = false;
        }
        self
    }
}
