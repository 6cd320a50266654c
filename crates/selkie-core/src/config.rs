//! Node configuration model
//!
//! TigerStyle: Explicit defaults, validation with field-level errors.
//!
//! `config.json` holds an array of node configurations; the binary selects
//! its own entry by sid. Boot services listed under `services` are created
//! before startup completes; any failure there is fatal.

use crate::constants::WORKER_COUNT_MAX;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration of one server node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Server id, unique within the deployment
    pub sid: u32,

    /// Human-readable node name
    pub name: String,

    /// Number of workers (OS threads hosting service loops)
    #[serde(default = "default_thread")]
    pub thread: usize,

    /// Address other nodes reach this node on
    #[serde(default)]
    pub inner_host: String,

    /// Address clients reach this node on
    #[serde(default)]
    pub outer_host: String,

    /// Log level filter: debug, info, warn, error
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Services created at boot, in order
    #[serde(default)]
    pub services: Vec<ServiceBootConfig>,
}

fn default_thread() -> usize {
    4
}

fn default_loglevel() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sid == 0 {
            return Err(Error::invalid_configuration("sid", "must be non-zero"));
        }
        if self.thread == 0 || self.thread > WORKER_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "thread",
                format!("must be in 1..={}", WORKER_COUNT_MAX),
            ));
        }
        match self.loglevel.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::invalid_configuration(
                    "loglevel",
                    format!("unknown level {:?}", other),
                ));
            }
        }
        for (index, service) in self.services.iter().enumerate() {
            service
                .validate()
                .map_err(|e| Error::invalid_configuration(format!("services[{}]", index), e.to_string()))?;
        }
        Ok(())
    }
}

/// One boot-time service entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceBootConfig {
    /// Registered service kind
    #[serde(rename = "type")]
    pub kind: String,

    /// Service name; required when `unique` is set
    #[serde(default)]
    pub name: String,

    /// Register the name globally, at most one service per name
    #[serde(default)]
    pub unique: bool,

    /// Whether the worker may host other services alongside this one
    #[serde(default = "default_shared")]
    pub shared: bool,

    /// Explicit 1-based worker placement; 0 lets the server choose
    #[serde(default)]
    pub threadid: u32,

    /// Free-form parameters handed to the service's init hook
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_shared() -> bool {
    true
}

impl ServiceBootConfig {
    fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::invalid_configuration("type", "must not be empty"));
        }
        if self.unique && self.name.is_empty() {
            return Err(Error::invalid_configuration(
                "name",
                "unique services need a name",
            ));
        }
        Ok(())
    }
}

/// The parsed `config.json`: one entry per node
#[derive(Debug, Clone)]
pub struct ServerConfigFile {
    nodes: Vec<NodeConfig>,
}

impl ServerConfigFile {
    /// Parse and validate the configuration document
    pub fn parse(text: &str) -> Result<Self> {
        let nodes: Vec<NodeConfig> =
            serde_json::from_str(text).map_err(|e| Error::invalid_configuration("config", e.to_string()))?;
        for node in &nodes {
            node.validate()?;
        }
        let mut sids: Vec<u32> = nodes.iter().map(|n| n.sid).collect();
        sids.sort_unstable();
        sids.dedup();
        if sids.len() != nodes.len() {
            return Err(Error::invalid_configuration("sid", "duplicate sid"));
        }
        Ok(Self { nodes })
    }

    /// Find the node configuration for `sid`
    pub fn find(&self, sid: u32) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.sid == sid)
    }

    /// All node configurations
    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }
}
