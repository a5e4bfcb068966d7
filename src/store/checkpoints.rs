//! Checkpoint DAG queries: creation, approval, branch naming, version
//! counters, and the tree/leaf views the API serves.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::models::*;
use super::Db;

const CHECKPOINT_COLUMNS: &str = "id, video_id, branch_name, phase_number, version, \
     parent_checkpoint_id, status, approved_at, created_at, phase_output, cost_usd, \
     owner_id, edit_description";

/// Fields for a new checkpoint row; the id and timestamps are generated.
pub struct NewCheckpoint<'a> {
    pub video_id: &'a str,
    pub branch_name: &'a str,
    pub phase_number: u8,
    pub version: i64,
    pub parent_checkpoint_id: Option<&'a str>,
    pub phase_output: &'a serde_json::Value,
    pub cost_usd: f64,
    pub owner_id: &'a str,
    pub edit_description: Option<&'a str>,
}

impl Db {
    pub fn create_checkpoint(&self, new: NewCheckpoint<'_>) -> Result<Checkpoint> {
        let id = new_checkpoint_id();
        self.conn()
            .execute(
                "INSERT INTO checkpoints (
                    id, video_id, branch_name, phase_number, version,
                    parent_checkpoint_id, status, phase_output, cost_usd,
                    owner_id, edit_description
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?10)",
                params![
                    id,
                    new.video_id,
                    new.branch_name,
                    new.phase_number,
                    new.version,
                    new.parent_checkpoint_id,
                    new.phase_output.to_string(),
                    new.cost_usd,
                    new.owner_id,
                    new.edit_description,
                ],
            )
            .context("Failed to insert checkpoint")?;
        self.get_checkpoint(&id)?
            .context("Checkpoint not found after insert")
    }

    pub fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM checkpoints WHERE id = ?1",
                CHECKPOINT_COLUMNS
            ))
            .context("Failed to prepare get_checkpoint")?;
        let row = stmt
            .query_row(params![id], CheckpointRow::from_row)
            .optional()
            .context("Failed to query checkpoint")?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Like `get_checkpoint` but enforces the owner filter.
    pub fn get_checkpoint_owned(&self, id: &str, owner_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .get_checkpoint(id)?
            .filter(|cp| cp.owner_id == owner_id))
    }

    pub fn list_checkpoints(
        &self,
        video_id: &str,
        branch: Option<&str>,
    ) -> Result<Vec<Checkpoint>> {
        let rows = match branch {
            Some(branch) => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE video_id = ?1 AND branch_name = ?2
                     ORDER BY created_at, rowid",
                    CHECKPOINT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![video_id, branch], CheckpointRow::from_row)
                    .context("Failed to query checkpoints")?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = self.conn().prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE video_id = ?1 ORDER BY created_at, rowid",
                    CHECKPOINT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![video_id], CheckpointRow::from_row)
                    .context("Failed to query checkpoints")?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    /// Most recent pending checkpoint, i.e. the one awaiting a continue.
    pub fn current_checkpoint(&self, video_id: &str) -> Result<Option<Checkpoint>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM checkpoints WHERE video_id = ?1 AND status = 'pending'
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                CHECKPOINT_COLUMNS
            ))
            .context("Failed to prepare current_checkpoint")?;
        let row = stmt
            .query_row(params![video_id], CheckpointRow::from_row)
            .optional()
            .context("Failed to query current checkpoint")?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Checkpoints with no children anywhere: the active branch tips.
    pub fn leaf_checkpoints(&self, video_id: &str) -> Result<Vec<Checkpoint>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "SELECT {} FROM checkpoints c
                 WHERE c.video_id = ?1
                 AND c.id NOT IN (
                     SELECT parent_checkpoint_id FROM checkpoints
                     WHERE parent_checkpoint_id IS NOT NULL
                 )
                 ORDER BY c.created_at DESC, c.rowid DESC",
                CHECKPOINT_COLUMNS
            ))
            .context("Failed to prepare leaf_checkpoints")?;
        let rows = stmt
            .query_map(params![video_id], CheckpointRow::from_row)
            .context("Failed to query leaf checkpoints")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    /// Idempotent: a second approve keeps the original approved_at.
    pub fn approve_checkpoint(&self, id: &str) -> Result<bool> {
        let updated = self
            .conn()
            .execute(
                "UPDATE checkpoints
                 SET status = 'approved',
                     approved_at = COALESCE(approved_at, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                 WHERE id = ?1",
                params![id],
            )
            .context("Failed to approve checkpoint")?;
        Ok(updated > 0)
    }

    /// True iff any artifact under the checkpoint has version > 1.
    pub fn checkpoint_has_edits(&self, id: &str) -> Result<bool> {
        let exists: bool = self
            .conn()
            .query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM artifacts WHERE checkpoint_id = ?1 AND version > 1
                 )",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to check checkpoint edits")?;
        Ok(exists)
    }

    /// `max + 1`, `1` if the `(branch, phase)` pair has no checkpoints yet.
    pub fn next_checkpoint_version(
        &self,
        video_id: &str,
        branch: &str,
        phase: u8,
    ) -> Result<i64> {
        let max: i64 = self
            .conn()
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM checkpoints
                 WHERE video_id = ?1 AND branch_name = ?2 AND phase_number = ?3",
                params![video_id, branch, phase],
                |row| row.get(0),
            )
            .context("Failed to compute next version")?;
        Ok(max + 1)
    }

    /// Pick the next free child suffix of `parent_branch` for this video:
    /// `main -> main-1`, `main-1 -> main-1-1`. Only immediate children
    /// (single numeric suffix) count.
    pub fn generate_branch_name(&self, video_id: &str, parent_branch: &str) -> Result<String> {
        let like = format!("{}-%", parent_branch);
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT DISTINCT branch_name FROM checkpoints
                 WHERE video_id = ?1 AND branch_name LIKE ?2",
            )
            .context("Failed to prepare branch query")?;
        let branches = stmt
            .query_map(params![video_id, like], |row| row.get::<_, String>(0))
            .context("Failed to query branches")?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let prefix = format!("{}-", parent_branch);
        let max_counter = branches
            .iter()
            .filter_map(|b| b.strip_prefix(&prefix))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        Ok(format!("{}-{}", parent_branch, max_counter + 1))
    }

    /// Record what an artifact edit did, for humans browsing the tree.
    pub fn set_checkpoint_edit_description(&self, id: &str, description: &str) -> Result<bool> {
        let updated = self
            .conn()
            .execute(
                "UPDATE checkpoints SET edit_description = ?1 WHERE id = ?2",
                params![description, id],
            )
            .context("Failed to set edit description")?;
        Ok(updated > 0)
    }

    /// Merge updates into a checkpoint's phase_output blob.
    pub fn update_checkpoint_phase_output(
        &self,
        id: &str,
        updates: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool> {
        let checkpoint = match self.get_checkpoint(id)? {
            Some(cp) => cp,
            None => return Ok(false),
        };
        let mut output = match checkpoint.phase_output {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in updates {
            output.insert(key.clone(), value.clone());
        }
        let updated = self
            .conn()
            .execute(
                "UPDATE checkpoints SET phase_output = ?1 WHERE id = ?2",
                params![serde_json::Value::Object(output).to_string(), id],
            )
            .context("Failed to update checkpoint phase output")?;
        Ok(updated > 0)
    }

    /// Full DAG, breadth-first by depth then creation time, folded into
    /// nested nodes client-side.
    pub fn checkpoint_tree(&self, video_id: &str) -> Result<Vec<TreeNode>> {
        let mut stmt = self
            .conn()
            .prepare(&format!(
                "WITH RECURSIVE checkpoint_tree AS (
                     SELECT {cols}, rowid AS rid, 0 AS depth
                     FROM checkpoints
                     WHERE video_id = ?1 AND parent_checkpoint_id IS NULL

                     UNION ALL

                     SELECT {child_cols}, c.rowid, t.depth + 1
                     FROM checkpoints c
                     JOIN checkpoint_tree t ON c.parent_checkpoint_id = t.id
                 )
                 SELECT {cols} FROM checkpoint_tree
                 ORDER BY depth, created_at, rid",
                cols = CHECKPOINT_COLUMNS,
                child_cols = CHECKPOINT_COLUMNS
                    .split(", ")
                    .map(|c| format!("c.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
            ))
            .context("Failed to prepare checkpoint_tree")?;
        let rows = stmt
            .query_map(params![video_id], CheckpointRow::from_row)
            .context("Failed to query checkpoint tree")?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let checkpoints = rows
            .into_iter()
            .map(CheckpointRow::into_checkpoint)
            .collect::<Result<Vec<_>>>()?;

        Ok(fold_tree(checkpoints))
    }

    /// Leaf checkpoints rendered as branch summaries.
    pub fn active_branches(&self, video_id: &str) -> Result<Vec<BranchInfo>> {
        let leaves = self.leaf_checkpoints(video_id)?;
        Ok(leaves
            .into_iter()
            .map(|cp| BranchInfo {
                can_continue: cp.status == CheckpointStatus::Pending,
                branch_name: cp.branch_name,
                latest_checkpoint_id: cp.id,
                phase_number: cp.phase_number,
                status: cp.status,
            })
            .collect())
    }
}

/// Fold a depth-ordered checkpoint list into nested tree nodes. Parents
/// always precede children, so a single pass suffices.
fn fold_tree(checkpoints: Vec<Checkpoint>) -> Vec<TreeNode> {
    use std::collections::HashMap;

    let mut nodes: HashMap<String, TreeNode> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for cp in checkpoints {
        order.push(cp.id.clone());
        nodes.insert(
            cp.id.clone(),
            TreeNode {
                checkpoint: cp,
                children: Vec::new(),
            },
        );
    }

    let mut roots = Vec::new();
    // Attach children to parents from the deepest up, so each subtree is
    // complete before it is moved into its parent.
    for id in order.iter().rev() {
        let node = nodes.remove(id).expect("node present");
        match node.checkpoint.parent_checkpoint_id.clone() {
            Some(parent_id) if nodes.contains_key(&parent_id) => {
                nodes
                    .get_mut(&parent_id)
                    .expect("parent present")
                    .children
                    .insert(0, node);
            }
            _ => roots.insert(0, node),
        }
    }
    roots
}

// ── Internal row helpers ──────────────────────────────────────────────

struct CheckpointRow {
    id: String,
    video_id: String,
    branch_name: String,
    phase_number: i64,
    version: i64,
    parent_checkpoint_id: Option<String>,
    status: String,
    approved_at: Option<String>,
    created_at: String,
    phase_output: String,
    cost_usd: f64,
    owner_id: String,
    edit_description: Option<String>,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            video_id: row.get(1)?,
            branch_name: row.get(2)?,
            phase_number: row.get(3)?,
            version: row.get(4)?,
            parent_checkpoint_id: row.get(5)?,
            status: row.get(6)?,
            approved_at: row.get(7)?,
            created_at: row.get(8)?,
            phase_output: row.get(9)?,
            cost_usd: row.get(10)?,
            owner_id: row.get(11)?,
            edit_description: row.get(12)?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint> {
        let status = CheckpointStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse checkpoint status")?;
        let phase_output = serde_json::from_str(&self.phase_output)
            .context("Failed to parse checkpoint phase output")?;
        Ok(Checkpoint {
            id: self.id,
            video_id: self.video_id,
            branch_name: self.branch_name,
            phase_number: self.phase_number as u8,
            version: self.version,
            parent_checkpoint_id: self.parent_checkpoint_id,
            status,
            approved_at: self.approved_at,
            created_at: self.created_at,
            phase_output,
            cost_usd: self.cost_usd,
            owner_id: self.owner_id,
            edit_description: self.edit_description,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_video(db: &Db) -> String {
        db.create_video("user-1", "test prompt", &[], false)
            .unwrap()
            .id
    }

    fn make_checkpoint(
        db: &Db,
        video_id: &str,
        branch: &str,
        phase: u8,
        version: i64,
        parent: Option<&str>,
    ) -> Checkpoint {
        db.create_checkpoint(NewCheckpoint {
            video_id,
            branch_name: branch,
            phase_number: phase,
            version,
            parent_checkpoint_id: parent,
            phase_output: &serde_json::json!({}),
            cost_usd: 0.1,
            owner_id: "user-1",
            edit_description: None,
        })
        .unwrap()
    }

    #[test]
    fn create_and_fetch_checkpoint() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp = make_checkpoint(&db, &video_id, "main", 1, 1, None);

        assert!(cp.id.starts_with("cp-"));
        assert_eq!(cp.status, CheckpointStatus::Pending);
        assert_eq!(cp.branch_name, "main");
        assert!(cp.approved_at.is_none());

        let fetched = db.get_checkpoint(&cp.id)?.expect("checkpoint exists");
        assert_eq!(fetched.video_id, video_id);
        Ok(())
    }

    #[test]
    fn unique_constraint_on_branch_phase_version() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        make_checkpoint(&db, &video_id, "main", 1, 1, None);

        let dup = db.create_checkpoint(NewCheckpoint {
            video_id: &video_id,
            branch_name: "main",
            phase_number: 1,
            version: 1,
            parent_checkpoint_id: None,
            phase_output: &serde_json::json!({}),
            cost_usd: 0.0,
            owner_id: "user-1",
            edit_description: None,
        });
        assert!(dup.is_err());
        Ok(())
    }

    #[test]
    fn approve_is_idempotent() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp = make_checkpoint(&db, &video_id, "main", 1, 1, None);

        assert!(db.approve_checkpoint(&cp.id)?);
        let first = db.get_checkpoint(&cp.id)?.unwrap();
        assert_eq!(first.status, CheckpointStatus::Approved);
        let approved_at = first.approved_at.clone().expect("approved_at set");

        assert!(db.approve_checkpoint(&cp.id)?);
        let second = db.get_checkpoint(&cp.id)?.unwrap();
        assert_eq!(second.approved_at.as_deref(), Some(approved_at.as_str()));
        Ok(())
    }

    #[test]
    fn branch_name_generation_picks_free_suffix() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);

        assert_eq!(db.generate_branch_name(&video_id, "main")?, "main-1");

        make_checkpoint(&db, &video_id, "main-1", 2, 1, None);
        make_checkpoint(&db, &video_id, "main-2", 2, 1, None);
        assert_eq!(db.generate_branch_name(&video_id, "main")?, "main-3");

        // Grandchildren do not count as immediate children of `main`.
        make_checkpoint(&db, &video_id, "main-1-1", 3, 1, None);
        assert_eq!(db.generate_branch_name(&video_id, "main")?, "main-3");
        assert_eq!(db.generate_branch_name(&video_id, "main-1")?, "main-1-2");
        Ok(())
    }

    #[test]
    fn branch_names_are_scoped_per_video() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_a = make_video(&db);
        let video_b = make_video(&db);
        make_checkpoint(&db, &video_a, "main-1", 2, 1, None);
        assert_eq!(db.generate_branch_name(&video_b, "main")?, "main-1");
        Ok(())
    }

    #[test]
    fn next_version_counts_per_branch_and_phase() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);

        assert_eq!(db.next_checkpoint_version(&video_id, "main", 1)?, 1);
        make_checkpoint(&db, &video_id, "main", 1, 1, None);
        assert_eq!(db.next_checkpoint_version(&video_id, "main", 1)?, 2);
        assert_eq!(db.next_checkpoint_version(&video_id, "main", 2)?, 1);
        assert_eq!(db.next_checkpoint_version(&video_id, "main-1", 1)?, 1);
        Ok(())
    }

    #[test]
    fn current_checkpoint_is_latest_pending() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp1 = make_checkpoint(&db, &video_id, "main", 1, 1, None);
        let cp2 = make_checkpoint(&db, &video_id, "main", 2, 1, Some(&cp1.id));

        let current = db.current_checkpoint(&video_id)?.expect("pending exists");
        assert_eq!(current.id, cp2.id);

        db.approve_checkpoint(&cp2.id)?;
        let current = db.current_checkpoint(&video_id)?.expect("cp1 still pending");
        assert_eq!(current.id, cp1.id);

        db.approve_checkpoint(&cp1.id)?;
        assert!(db.current_checkpoint(&video_id)?.is_none());
        Ok(())
    }

    #[test]
    fn leaves_are_branch_tips() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp1 = make_checkpoint(&db, &video_id, "main", 1, 1, None);
        let cp2 = make_checkpoint(&db, &video_id, "main", 2, 1, Some(&cp1.id));
        let cp3 = make_checkpoint(&db, &video_id, "main-1", 2, 1, Some(&cp1.id));

        let leaves = db.leaf_checkpoints(&video_id)?;
        let ids: Vec<&str> = leaves.iter().map(|cp| cp.id.as_str()).collect();
        assert_eq!(leaves.len(), 2);
        assert!(ids.contains(&cp2.id.as_str()));
        assert!(ids.contains(&cp3.id.as_str()));

        let branches = db.active_branches(&video_id)?;
        assert!(branches.iter().all(|b| b.can_continue));
        Ok(())
    }

    #[test]
    fn tree_nests_children_under_parents() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp1 = make_checkpoint(&db, &video_id, "main", 1, 1, None);
        let cp2 = make_checkpoint(&db, &video_id, "main", 2, 1, Some(&cp1.id));
        let cp3 = make_checkpoint(&db, &video_id, "main-1", 2, 1, Some(&cp1.id));
        let cp4 = make_checkpoint(&db, &video_id, "main", 3, 1, Some(&cp2.id));

        let tree = db.checkpoint_tree(&video_id)?;
        assert_eq!(tree.len(), 1);
        let root = &tree[0];
        assert_eq!(root.checkpoint.id, cp1.id);
        assert_eq!(root.children.len(), 2);

        let main_child = root
            .children
            .iter()
            .find(|n| n.checkpoint.id == cp2.id)
            .expect("cp2 under root");
        assert_eq!(main_child.children.len(), 1);
        assert_eq!(main_child.children[0].checkpoint.id, cp4.id);

        let fork_child = root
            .children
            .iter()
            .find(|n| n.checkpoint.id == cp3.id)
            .expect("cp3 under root");
        assert!(fork_child.children.is_empty());
        Ok(())
    }

    #[test]
    fn phase_output_updates_merge() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp = db.create_checkpoint(NewCheckpoint {
            video_id: &video_id,
            branch_name: "main",
            phase_number: 1,
            version: 1,
            parent_checkpoint_id: None,
            phase_output: &serde_json::json!({"spec": {"duration": 20}}),
            cost_usd: 0.0,
            owner_id: "user-1",
            edit_description: None,
        })?;

        let mut updates = serde_json::Map::new();
        updates.insert("next_branch".into(), serde_json::json!("main-1"));
        assert!(db.update_checkpoint_phase_output(&cp.id, &updates)?);

        let fetched = db.get_checkpoint(&cp.id)?.unwrap();
        assert_eq!(fetched.phase_output["next_branch"], "main-1");
        assert_eq!(fetched.phase_output["spec"]["duration"], 20);
        Ok(())
    }

    #[test]
    fn cascade_delete_from_video() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let cp = make_checkpoint(&db, &video_id, "main", 1, 1, None);

        assert!(db.delete_video(&video_id, "user-1")?);
        assert!(db.get_checkpoint(&cp.id)?.is_none());
        Ok(())
    }

    #[test]
    fn phase_number_check_constraint() -> Result<()> {
        let db = Db::new_in_memory()?;
        let video_id = make_video(&db);
        let bad = db.create_checkpoint(NewCheckpoint {
            video_id: &video_id,
            branch_name: "main",
            phase_number: 5,
            version: 1,
            parent_checkpoint_id: None,
            phase_output: &serde_json::json!({}),
            cost_usd: 0.0,
            owner_id: "user-1",
            edit_description: None,
        });
        assert!(bad.is_err());
        Ok(())
    }
}
