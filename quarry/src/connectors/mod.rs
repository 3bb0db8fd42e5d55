//! Dataset metadata and schema access.
//!
//! Concrete warehouse/lake connectors live outside this crate;
//! `DatasetConnector` is the seam. `StaticConnector` serves fixed schemas
//! for tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::types::{DatasetId, OrgId};

/// A registered dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub org_id: OrgId,
    pub name: String,
    pub description: String,
    /// Host path handed to the sandbox as a read-only mount.
    pub location: String,
    pub row_count: Option<u64>,
}

/// Column-level schema for prompt construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchemaDoc {
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl SchemaDoc {
    /// Compact rendering used inside prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("table {}:\n", table.name));
            for column in &table.columns {
                out.push_str(&format!("  {} ({})", column.name, column.data_type));
                if let Some(desc) = &column.description {
                    out.push_str(&format!(" -- {desc}"));
                }
                out.push('\n');
            }
        }
        out
    }
}

#[async_trait]
pub trait DatasetConnector: Send + Sync {
    async fn fetch_schema(&self, dataset: &Dataset) -> Result<SchemaDoc>;

    /// Up to `limit` example rows, used to ground prompt construction.
    async fn fetch_sample(&self, dataset: &Dataset, limit: usize)
        -> Result<Vec<serde_json::Value>>;

    async fn test_connection(&self, dataset: &Dataset) -> Result<()>;
}

/// Serves fixed schemas and samples from memory.
#[derive(Default)]
pub struct StaticConnector {
    schemas: DashMap<DatasetId, SchemaDoc>,
    samples: DashMap<DatasetId, Vec<serde_json::Value>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_schema(&self, dataset_id: DatasetId, schema: SchemaDoc) {
        self.schemas.insert(dataset_id, schema);
    }

    pub fn set_sample(&self, dataset_id: DatasetId, rows: Vec<serde_json::Value>) {
        self.samples.insert(dataset_id, rows);
    }
}

#[async_trait]
impl DatasetConnector for StaticConnector {
    async fn fetch_schema(&self, dataset: &Dataset) -> Result<SchemaDoc> {
        Ok(self
            .schemas
            .get(&dataset.id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn fetch_sample(
        &self,
        dataset: &Dataset,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .samples
            .get(&dataset.id)
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn test_connection(&self, _dataset: &Dataset) -> Result<()> {
        Ok(())
    }
}

/// Known datasets plus the connector that can describe them.
pub struct DatasetRegistry {
    datasets: DashMap<DatasetId, Dataset>,
    connector: Arc<dyn DatasetConnector>,
}

impl DatasetRegistry {
    pub fn new(connector: Arc<dyn DatasetConnector>) -> Self {
        Self {
            datasets: DashMap::new(),
            connector,
        }
    }

    pub fn register(&self, dataset: Dataset) {
        self.datasets.insert(dataset.id, dataset);
    }

    pub fn get(&self, id: DatasetId) -> Result<Dataset> {
        self.datasets
            .get(&id)
            .map(|d| d.clone())
            .ok_or(Error::DatasetNotFound(id))
    }

    pub async fn schema(&self, id: DatasetId) -> Result<SchemaDoc> {
        let dataset = self.get(id)?;
        self.connector.fetch_schema(&dataset).await
    }

    pub async fn sample(&self, id: DatasetId, limit: usize) -> Result<Vec<serde_json::Value>> {
        let dataset = self.get(id)?;
        self.connector.fetch_sample(&dataset, limit).await
    }

    /// Sandbox mounts for a request: dataset name -> host path.
    pub fn mounts(&self, id: DatasetId) -> Result<HashMap<String, String>> {
        let dataset = self.get(id)?;
        let mut mounts = HashMap::new();
        mounts.insert(dataset.name.clone(), dataset.location.clone());
        Ok(mounts)
    }
}
