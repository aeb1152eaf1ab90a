use serde::{Deserialize, Serialize};

use crate::domain::{Child, Factory, Tree};
use crate::ids::{FactoryId, TreeId};

pub const CONNECTED_MESSAGE: &str = "Connected to WebSocket";
pub const PONG_MESSAGE: &str = "Pong!";
pub const INVALID_JSON_MESSAGE: &str = "Invalid JSON format";

/// Messages pushed from the server to connected viewers.
///
/// Wire shape is always `{"action": <tag>, "data": {...}}`. Events are never
/// persisted; they live for a single delivery attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum Event {
    ConnectionEstablished {
        message: String,
        connections: usize,
    },

    Pong {
        message: String,
        timestamp: Option<serde_json::Value>,
    },

    Error {
        message: String,
    },

    ClientDisconnected {
        connections: usize,
    },

    FactoryCreated(FactoryCreated),

    FactoryUpdated(FactoryUpdated),

    FactoryDeleted {
        id: FactoryId,
        tree_id: TreeId,
    },

    ChildrenGenerated {
        factory_id: FactoryId,
        children: Vec<Child>,
    },

    TreeUpdated {
        id: TreeId,
        name: String,
    },

    TreeDeleted {
        id: TreeId,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactoryCreated {
    pub id: FactoryId,
    pub name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub child_count: u32,
    pub tree_id: TreeId,
    pub children: Vec<Child>,
}

/// Same as [`FactoryCreated`] minus the children, which an update never touches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactoryUpdated {
    pub id: FactoryId,
    pub name: String,
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub child_count: u32,
    pub tree_id: TreeId,
}

impl Event {
    pub fn connection_established(connections: usize) -> Self {
        Self::ConnectionEstablished {
            message: CONNECTED_MESSAGE.into(),
            connections,
        }
    }

    pub fn pong(timestamp: Option<serde_json::Value>) -> Self {
        Self::Pong {
            message: PONG_MESSAGE.into(),
            timestamp,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn client_disconnected(connections: usize) -> Self {
        Self::ClientDisconnected { connections }
    }

    pub fn factory_created(factory: &Factory) -> Self {
        Self::FactoryCreated(FactoryCreated {
            id: factory.id.clone(),
            name: factory.name.clone(),
            lower_bound: factory.lower_bound,
            upper_bound: factory.upper_bound,
            child_count: factory.child_count,
            tree_id: factory.tree_id.clone(),
            children: factory.children.clone(),
        })
    }

    pub fn factory_updated(factory: &Factory) -> Self {
        Self::FactoryUpdated(FactoryUpdated {
            id: factory.id.clone(),
            name: factory.name.clone(),
            lower_bound: factory.lower_bound,
            upper_bound: factory.upper_bound,
            child_count: factory.child_count,
            tree_id: factory.tree_id.clone(),
        })
    }

    pub fn factory_deleted(id: &FactoryId, tree_id: &TreeId) -> Self {
        Self::FactoryDeleted {
            id: id.clone(),
            tree_id: tree_id.clone(),
        }
    }

    pub fn children_generated(factory: &Factory) -> Self {
        Self::ChildrenGenerated {
            factory_id: factory.id.clone(),
            children: factory.children.clone(),
        }
    }

    pub fn tree_updated(tree: &Tree) -> Self {
        Self::TreeUpdated {
            id: tree.id.clone(),
            name: tree.name.clone(),
        }
    }

    pub fn tree_deleted(id: &TreeId) -> Self {
        Self::TreeDeleted { id: id.clone() }
    }

    /// The wire tag, for logs and metric labels.
    pub fn action(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::ClientDisconnected { .. } => "client_disconnected",
            Self::FactoryCreated(_) => "factory_created",
            Self::FactoryUpdated(_) => "factory_updated",
            Self::FactoryDeleted { .. } => "factory_deleted",
            Self::ChildrenGenerated { .. } => "children_generated",
            Self::TreeUpdated { .. } => "tree_updated",
            Self::TreeDeleted { .. } => "tree_deleted",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
