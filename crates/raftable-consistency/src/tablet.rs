// Static membership definition
// tablets.json maps a tablet name to the members replicating it:
// {"default": [{"id": "node-1", "ip": "10.0.0.1", "tcpPort": 9876}, ...]}

use std::collections::HashMap;
use std::path::Path;

use raftable_api::DatabaseError;
use raftable_cluster::{ControllerNode, NodeId};

pub type TabletDefinition = HashMap<String, Vec<ControllerNode>>;

/// Members of one tablet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablet {
    pub name: String,
    pub members: Vec<ControllerNode>,
}

impl Tablet {
    /// Load `name` from the definition file at `path`
    pub async fn load(path: impl AsRef<Path>, name: &str) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DatabaseError::Storage(format!("cannot read membership file {:?}: {}", path, e))
        })?;
        Self::parse(&bytes, name)
    }

    pub fn parse(bytes: &[u8], name: &str) -> Result<Self, DatabaseError> {
        let mut tablets: TabletDefinition = serde_json::from_slice(bytes)
            .map_err(|e| DatabaseError::Serialization(format!("invalid membership file: {}", e)))?;
        let members = tablets.remove(name).ok_or_else(|| {
            DatabaseError::IllegalState(format!("membership file has no tablet named {}", name))
        })?;
        if members.is_empty() {
            return Err(DatabaseError::IllegalState(format!("tablet {} has no members", name)));
        }
        Ok(Self {
            name: name.to_string(),
            members,
        })
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    /// Smallest majority of the members
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLETS: &str = r#"{
        "default": [
            {"id": "node-1", "ip": "127.0.0.1", "tcpPort": 9876},
            {"id": "node-2", "ip": "127.0.0.1", "tcpPort": 9877},
            {"id": "node-3", "ip": "127.0.0.1", "tcpPort": 9878}
        ],
        "other": [{"id": "node-9", "ip": "127.0.0.1", "tcpPort": 9999}]
    }"#;

    #[test]
    fn test_parse_default_tablet() {
        let tablet = Tablet::parse(TABLETS.as_bytes(), "default").unwrap();
        assert_eq!(tablet.members.len(), 3);
        assert_eq!(tablet.quorum(), 2);
        assert!(tablet.contains(&"node-2".into()));
        assert!(!tablet.contains(&"node-9".into()));
        assert_eq!(tablet.members[1].tcp_port, 9877);
    }

    #[test]
    fn test_missing_tablet_is_an_error() {
        let err = Tablet::parse(TABLETS.as_bytes(), "absent").unwrap_err();
        assert!(matches!(err, DatabaseError::IllegalState(_)));
        let err = Tablet::parse(b"not json", "default").unwrap_err();
        assert!(matches!(err, DatabaseError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tablets.json");
        assert!(matches!(
            Tablet::load(&path, "default").await,
            Err(DatabaseError::Storage(_))
        ));

        std::fs::write(&path, TABLETS).unwrap();
        let tablet = Tablet::load(&path, "other").await.unwrap();
        assert_eq!(tablet.member_ids(), vec![NodeId::from("node-9")]);
        assert_eq!(tablet.quorum(), 1);
    }
}
