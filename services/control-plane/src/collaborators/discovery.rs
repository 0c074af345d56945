//! Service discovery backed by a fixed cell table.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use lrp_id::CellId;

use super::{CollaboratorError, ServiceDiscovery};

/// Resolves cells from a table supplied at startup.
#[derive(Debug, Default)]
pub struct StaticServiceDiscovery {
    cells: RwLock<HashMap<CellId, String>>,
}

impl StaticServiceDiscovery {
    pub fn new(cells: HashMap<CellId, String>) -> Self {
        Self {
            cells: RwLock::new(cells),
        }
    }

    /// Adds or replaces a cell address.
    pub fn register(&self, cell_id: CellId, address: impl Into<String>) {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cell_id, address.into());
    }

    pub fn deregister(&self, cell_id: &CellId) {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cell_id);
    }
}

#[async_trait]
impl ServiceDiscovery for StaticServiceDiscovery {
    async fn resolve(&self, cell_id: &CellId) -> Result<String, CollaboratorError> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cell_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::CellNotFound(cell_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_registered_cells() {
        let discovery = StaticServiceDiscovery::default();
        let cell = CellId::parse("cell-z1-0").unwrap();

        assert!(matches!(
            discovery.resolve(&cell).await,
            Err(CollaboratorError::CellNotFound(_))
        ));

        discovery.register(cell.clone(), "http://10.0.16.4:1800");
        assert_eq!(discovery.resolve(&cell).await.unwrap(), "http://10.0.16.4:1800");

        discovery.deregister(&cell);
        assert!(discovery.resolve(&cell).await.is_err());
    }
}
