use std::{collections::HashMap, sync::Arc};

use anyhow::bail;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Family, Server};

/// Every registered family, along with the root family
/// players land in when joining the network.
pub struct FamilyRegistry {
    families: RwLock<HashMap<String, Arc<Family>>>,
    root: String,
}

impl FamilyRegistry {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            families: RwLock::new(HashMap::new()),
            root: root.into(),
        }
    }

    /// ID of the root family.
    pub fn root_id(&self) -> &str {
        &self.root
    }

    pub async fn root(&self) -> Option<Arc<Family>> {
        self.find(&self.root).await
    }

    /// Registers a family.
    pub async fn register(&self, family: Arc<Family>) -> anyhow::Result<()> {
        let mut families = self.families.write().await;
        if families.contains_key(&family.id) {
            bail!("Family `{}` is already registered", family.id);
        }
        families.insert(family.id.clone(), family);
        Ok(())
    }

    /// Unregisters a family and shuts it down.
    ///
    /// Returns the family and the servers it had.
    pub async fn unregister(&self, id: &str) -> Option<(Arc<Family>, Vec<Arc<Server>>)> {
        let family = self.families.write().await.remove(id)?;
        let servers = family.shutdown().await;
        Some((family, servers))
    }

    pub async fn find(&self, id: &str) -> Option<Arc<Family>> {
        self.families.read().await.get(id).cloned()
    }

    /// Snapshot of every family.
    pub async fn families(&self) -> Vec<Arc<Family>> {
        self.families.read().await.values().cloned().collect()
    }

    /// Looks a server up across every family.
    pub async fn find_server(&self, uuid: &Uuid) -> Option<Arc<Server>> {
        for family in self.families().await {
            if let Some(server) = family.find_server(uuid).await {
                return Some(server);
            }
        }
        None
    }

    /// Family a server belongs to.
    pub async fn family_of(&self, server: &Server) -> Option<Arc<Family>> {
        let id = server.family()?;
        self.find(&id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::FamilyConfig, events::EventManager, ServerDetails};

    fn family(id: &str) -> Arc<Family> {
        let config = FamilyConfig {
            id: id.to_owned(),
            display_name: None,
            parent: None,
            load_balancer: Default::default(),
        };
        let events = Arc::new(EventManager::new(Duration::from_secs(1)));
        Arc::new(Family::new(&config, events).unwrap())
    }

    #[tokio::test]
    async fn unregistering_cascades() {
        let registry = FamilyRegistry::new("lobby");
        registry.register(family("lobby")).await.unwrap();
        registry.register(family("games")).await.unwrap();
        assert!(registry.register(family("games")).await.is_err());

        let server = Arc::new(Server::new(ServerDetails {
            uuid: Uuid::new_v4(),
            address: "10.0.0.5:25566".to_owned(),
            display_name: None,
            pod_name: None,
            weight: 0,
            soft_cap: 20,
            hard_cap: 30,
            timeout: 15,
        }));
        let games = registry.find("games").await.unwrap();
        games.add_server(server.clone()).await;
        assert_eq!(server.family().as_deref(), Some("games"));
        assert!(registry.find_server(&server.uuid).await.is_some());

        let (_, servers) = registry.unregister("games").await.unwrap();
        assert_eq!(servers.len(), 1);
        assert!(registry.find("games").await.is_none());
        assert!(registry.find_server(&server.uuid).await.is_none());
        assert_eq!(server.family(), None);
        assert_eq!(registry.root().await.unwrap().id, "lobby");
    }

    #[test]
    fn family_ids_are_bounded() {
        let config = FamilyConfig {
            id: "a".repeat(25),
            display_name: None,
            parent: None,
            load_balancer: Default::default(),
        };
        let events = Arc::new(EventManager::new(Duration::from_secs(1)));
        assert!(Family::new(&config, events).is_err());
    }
}
