//! Registration-time descriptions of the executor, its framework and the node

use serde::{Deserialize, Serialize};

/// Identity of this executor as known to the node agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub source: Option<String>,
}

/// The framework (scheduler) this executor works for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub framework_id: String,

    pub name: String,

    #[serde(default)]
    pub user: Option<String>,
}

/// The machine the node agent runs on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,

    pub hostname: String,

    #[serde(default)]
    pub port: Option<u16>,
}
