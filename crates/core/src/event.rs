//! Change events pushed by collectors.

use serde::{Deserialize, Serialize};

use crate::Object;

/// One observed change. Encoded as tagged JSON, e.g. `{"type":"upsert","id":...}`.
///
/// Tags this build does not know decode to [`ObjectEvent::Unknown`] so a newer collector
/// cannot stall an older consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectEvent {
    Upsert(Object),
    Delete(Object),
    /// Every object from the cluster is gone (cluster disconnected).
    ClusterRemoved { cluster: String },
    #[serde(other)]
    Unknown,
}

impl ObjectEvent {
    /// Coalescing key: object id, or the cluster name for cluster-wide events.
    pub fn key(&self) -> Option<String> {
        match self {
            ObjectEvent::Upsert(o) | ObjectEvent::Delete(o) => Some(o.id.clone()),
            ObjectEvent::ClusterRemoved { cluster } => Some(format!("cluster:{}", cluster)),
            ObjectEvent::Unknown => None,
        }
    }
}
