//! Artifact version queries. One row per `(checkpoint, type, key, version)`;
//! the maximum version per key is the live artifact. The store only tracks
//! blob references, it never copies or deletes blobs.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::models::*;
use super::Db;

const ARTIFACT_COLUMNS: &str = "id, checkpoint_id, artifact_type, artifact_key, blob_url, \
     blob_key, version, parent_artifact_id, metadata, size_bytes, created_at";

/// Fields for a new artifact row; the id and timestamp are generated.
pub struct NewArtifact<'a> {
    pub checkpoint_id: &'a str,
    pub artifact_type: ArtifactType,
    pub artifact_key: &'a str,
    pub blob_url: &'a str,
    pub blob_key: &'a str,
    pub version: i64,
    pub parent_artifact_id: Option<&'a str>,
    pub metadata: Option<&'a serde_json::Value>,
    pub size_bytes: Option<i64>,
}

impl Db {
    pub fn create_artifact(&self, new: NewArtifact<'_>) -> Result<Artifact> {
        let id = new_artifact_id();
        self.conn()
            .execute(
                "INSERT INTO artifacts (
                    id, checkpoint_id, artifact_type, artifact_key, blob_url,
                    blob_key, version, parent_artifact_id, metadata, size_bytes
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    new.checkpoint_id,
                    new.artifact_type.as_str(),
                    new.artifact_key,
                    new.blob_url,
                    new.blob_key,
                    new.version,
                    new.parent_artifact_id,
                    new.metadata.map(|m| m.to_string()),
                    new.size_bytes,
                ],
            )
            .context("Failed to insert artifact")?;
        self.get_artifact(&id)?
            .context("Artifact not found after insert")
    }

    pub fn get_artifact(&self, id: &str) -> Result<Option<Artifact>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM artifacts WHERE id = ?1",
                ARTIFACT_COLUMNS
            ))
            .context("Failed to prepare get_artifact")?;
        let row = stmt
            .query_row(params![id], ArtifactRow::from_row)
            .optional()
            .context("Failed to query artifact")?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    /// All versions of all artifacts under a checkpoint, ordered by key
    /// then version.
    pub fn list_artifacts(&self, checkpoint_id: &str) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM artifacts WHERE checkpoint_id = ?1
                 ORDER BY artifact_key, version",
                ARTIFACT_COLUMNS
            ))
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![checkpoint_id], ArtifactRow::from_row)
            .context("Failed to query artifacts")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }

    /// The highest-version row for one `(type, key)` pair.
    pub fn latest_artifact(
        &self,
        checkpoint_id: &str,
        artifact_type: ArtifactType,
        artifact_key: &str,
    ) -> Result<Option<Artifact>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM artifacts
                 WHERE checkpoint_id = ?1 AND artifact_type = ?2 AND artifact_key = ?3
                 ORDER BY version DESC LIMIT 1",
                ARTIFACT_COLUMNS
            ))
            .context("Failed to prepare latest_artifact")?;
        let row = stmt
            .query_row(
                params![checkpoint_id, artifact_type.as_str(), artifact_key],
                ArtifactRow::from_row,
            )
            .optional()
            .context("Failed to query latest artifact")?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    /// Latest version of every `(type, key)` pair under a checkpoint.
    /// Handles mixed versions (beat_0 v1, beat_1 v3, chunk_2 v2).
    pub fn latest_artifacts_per_key(&self, checkpoint_id: &str) -> Result<Vec<Artifact>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM artifacts a
                 JOIN (
                     SELECT artifact_type AS t, artifact_key AS k, MAX(version) AS v
                     FROM artifacts WHERE checkpoint_id = ?1
                     GROUP BY artifact_type, artifact_key
                 ) latest
                 ON a.artifact_type = latest.t
                 AND a.artifact_key = latest.k
                 AND a.version = latest.v
                 WHERE a.checkpoint_id = ?1
                 ORDER BY a.artifact_type, a.artifact_key",
                ARTIFACT_COLUMNS
                    .split(", ")
                    .map(|c| format!("a.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
            ))
            .context("Failed to prepare latest_artifacts_per_key")?;
        let rows = stmt
            .query_map(params![checkpoint_id], ArtifactRow::from_row)
            .context("Failed to query latest artifacts")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }

    /// `max + 1` for the `(checkpoint, type, key)` triple, `1` if none.
    pub fn next_artifact_version(
        &self,
        checkpoint_id: &str,
        artifact_type: ArtifactType,
        artifact_key: &str,
    ) -> Result<i64> {
        let max: i64 = self
            .conn()
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM artifacts
                 WHERE checkpoint_id = ?1 AND artifact_type = ?2 AND artifact_key = ?3",
                params![checkpoint_id, artifact_type.as_str(), artifact_key],
                |row| row.get(0),
            )
            .context("Failed to compute next artifact version")?;
        Ok(max + 1)
    }

    /// Patch metadata and/or parent lineage on an existing row. Version
    /// bumps always insert new rows instead.
    pub fn update_artifact(
        &self,
        id: &str,
        metadata: Option<&serde_json::Value>,
        parent_artifact_id: Option<&str>,
    ) -> Result<bool> {
        let mut updates = Vec::new();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(metadata) = metadata {
            updates.push(format!("metadata = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(metadata.to_string()));
        }
        if let Some(parent) = parent_artifact_id {
            updates.push(format!("parent_artifact_id = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(parent.to_string()));
        }
        if updates.is_empty() {
            return Ok(false);
        }

        params_vec.push(Box::new(id.to_string()));
        let sql = format!(
            "UPDATE artifacts SET {} WHERE id = ?{}",
            updates.join(", "),
            params_vec.len()
        );
        let updated = self
            .conn()
            .execute(
                &sql,
                rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            )
            .context("Failed to update artifact")?;
        Ok(updated > 0)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

struct ArtifactRow {
    id: String,
    checkpoint_id: String,
    artifact_type: String,
    artifact_key: String,
    blob_url: String,
    blob_key: String,
    version: i64,
    parent_artifact_id: Option<String>,
    metadata: Option<String>,
    size_bytes: Option<i64>,
    created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            checkpoint_id: row.get(1)?,
            artifact_type: row.get(2)?,
            artifact_key: row.get(3)?,
            blob_url: row.get(4)?,
            blob_key: row.get(5)?,
            version: row.get(6)?,
            parent_artifact_id: row.get(7)?,
            metadata: row.get(8)?,
            size_bytes: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_artifact(self) -> Result<Artifact> {
        let artifact_type = ArtifactType::from_str(&self.artifact_type)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse artifact type")?;
        let metadata = self
            .metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to parse artifact metadata")?;
        Ok(Artifact {
            id: self.id,
            checkpoint_id: self.checkpoint_id,
            artifact_type,
            artifact_key: self.artifact_key,
            blob_url: self.blob_url,
            blob_key: self.blob_key,
            version: self.version,
            parent_artifact_id: self.parent_artifact_id,
            metadata,
            size_bytes: self.size_bytes,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
