//! Run-scoped persistence of cross-step state.
//!
//! The snapshot is a small JSON document rewritten after every mutation so a
//! later step (or a later `to-step` run inspecting the last run) can look up
//! ids produced earlier: the challenge id, submissions per submitter, review
//! ids, appeals, and resource assignments.
//!
//! The store is owned by one run at a time. [`SnapshotStore::begin_run`]
//! clears the snapshot and hands out a [`RunSnapshotHandle`]; handles from a
//! previous run are rejected afterwards, so two runs can never interleave
//! writes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SnapshotError;
use crate::names::{RoleIds, RoleName};

/// A participant resource discovered on the challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub id: String,
    pub member_id: String,
    pub member_handle: String,
    pub role_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSnapshot {
    pub run_id: Option<Uuid>,
    pub flow: Option<String>,
    pub challenge_id: Option<String>,
    pub challenge_name: Option<String>,
    /// Submitter handle → submission ids, in creation order.
    pub submissions: BTreeMap<String, Vec<String>>,
    /// `reviewer:submitter:submissionId` → review id.
    pub reviews: BTreeMap<String, String>,
    pub appeals: Vec<String>,
    pub appealed_comment_ids: BTreeSet<String>,
    pub responded_appeal_ids: BTreeSet<String>,
    /// Handle → first resource id assigned to that handle.
    pub resources: BTreeMap<String, String>,
    /// Handle → role name → resource id.
    pub role_resources: BTreeMap<String, BTreeMap<String, String>>,
    pub participants: Vec<ParticipantRecord>,
    /// Role name → role id.
    pub role_ids: BTreeMap<String, String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn review_key(reviewer: &str, submitter: &str, submission_id: &str) -> String {
        format!("{}:{}:{}", reviewer, submitter, submission_id)
    }

    pub fn set_challenge(&mut self, id: &str, name: &str) {
        self.challenge_id.get_or_insert_with(|| id.to_string());
        self.challenge_name.get_or_insert_with(|| name.to_string());
    }

    pub fn add_submission(&mut self, handle: &str, submission_id: &str) {
        let ids = self.submissions.entry(handle.to_string()).or_default();
        if !ids.iter().any(|id| id == submission_id) {
            ids.push(submission_id.to_string());
        }
    }

    pub fn submissions_for(&self, handle: &str) -> &[String] {
        self.submissions
            .get(handle)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All `(submitter handle, submission id)` pairs.
    pub fn all_submissions(&self) -> Vec<(String, String)> {
        self.submissions
            .iter()
            .flat_map(|(handle, ids)| ids.iter().map(move |id| (handle.clone(), id.clone())))
            .collect()
    }

    /// Handle that created `submission_id`.
    pub fn submitter_of(&self, submission_id: &str) -> Option<&str> {
        self.submissions
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| id == submission_id))
            .map(|(handle, _)| handle.as_str())
    }

    pub fn set_review(&mut self, key: &str, review_id: &str) {
        self.reviews
            .entry(key.to_string())
            .or_insert_with(|| review_id.to_string());
    }

    pub fn has_review(&self, key: &str) -> bool {
        self.reviews.contains_key(key)
    }

    /// Record an appeal filed against `comment_id`. Returns `false` when the
    /// comment had already been appealed.
    pub fn record_appeal(&mut self, comment_id: &str, appeal_id: &str) -> bool {
        if !self.appealed_comment_ids.insert(comment_id.to_string()) {
            return false;
        }
        self.appeals.push(appeal_id.to_string());
        true
    }

    /// Mark `comment_id` as appealed when the platform already holds an
    /// appeal whose id this run never saw.
    pub fn mark_appealed(&mut self, comment_id: &str) -> bool {
        self.appealed_comment_ids.insert(comment_id.to_string())
    }

    pub fn is_appealed(&self, comment_id: &str) -> bool {
        self.appealed_comment_ids.contains(comment_id)
    }

    pub fn mark_responded(&mut self, appeal_id: &str) -> bool {
        self.responded_appeal_ids.insert(appeal_id.to_string())
    }

    pub fn set_resource(&mut self, handle: &str, role: RoleName, resource_id: &str) {
        self.resources
            .entry(handle.to_string())
            .or_insert_with(|| resource_id.to_string());
        self.role_resources
            .entry(handle.to_string())
            .or_default()
            .entry(role.as_str().to_string())
            .or_insert_with(|| resource_id.to_string());
    }

    pub fn resource_for(&self, handle: &str, role: RoleName) -> Option<&str> {
        self.role_resources
            .get(handle)
            .and_then(|roles| roles.get(role.as_str()))
            .map(String::as_str)
    }

    /// Resource ids held by `handle` across all roles.
    pub fn resources_of(&self, handle: &str) -> Vec<String> {
        self.role_resources
            .get(handle)
            .map(|roles| roles.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_participants(&mut self, records: impl IntoIterator<Item = ParticipantRecord>) {
        for record in records {
            if !self.participants.iter().any(|p| p.id == record.id) {
                self.participants.push(record);
            }
        }
    }

    pub fn participant(&self, handle: &str) -> Option<&ParticipantRecord> {
        self.participants
            .iter()
            .find(|p| p.member_handle.eq_ignore_ascii_case(handle))
    }

    pub fn set_role_ids(&mut self, ids: &RoleIds) {
        for (role, id) in ids.iter() {
            self.role_ids
                .entry(role.as_str().to_string())
                .or_insert_with(|| id.to_string());
        }
    }

    pub fn role_ids(&self) -> RoleIds {
        RoleIds::from_pairs(self.role_ids.iter().map(|(name, id)| (name.as_str(), id.as_str())))
    }
}

struct StoreState {
    owner: Option<Uuid>,
    snapshot: RunSnapshot,
}

/// File-backed holder of the last run's snapshot.
pub struct SnapshotStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl SnapshotStore {
    /// Open the store, loading the previous run's snapshot if one exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let path = path.into();
        let snapshot = Self::load(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(StoreState {
                owner: None,
                snapshot,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<RunSnapshot, SnapshotError> {
        if !path.exists() {
            return Ok(RunSnapshot::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| SnapshotError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| SnapshotError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn persist(&self, snapshot: &RunSnapshot) -> Result<(), SnapshotError> {
        let write_err = |source| SnapshotError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| write_err(std::io::Error::other(e)))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clear the snapshot and hand ownership to `run_id`.
    pub fn begin_run(
        self: &Arc<Self>,
        run_id: Uuid,
        flow: &str,
    ) -> Result<RunSnapshotHandle, SnapshotError> {
        let mut state = self.state();
        let fresh = RunSnapshot {
            run_id: Some(run_id),
            flow: Some(flow.to_string()),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        self.persist(&fresh)?;
        state.owner = Some(run_id);
        state.snapshot = fresh;
        tracing::debug!(%run_id, path = %self.path.display(), "snapshot reset for new run");
        Ok(RunSnapshotHandle {
            store: Arc::clone(self),
            run_id,
        })
    }

    /// Copy of the current snapshot.
    pub fn current(&self) -> RunSnapshot {
        self.state().snapshot.clone()
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.state().owner
    }

    /// Drop the snapshot entirely (file included) and release ownership.
    pub fn reset(&self) -> Result<(), SnapshotError> {
        let mut state = self.state();
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|source| SnapshotError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        state.owner = None;
        state.snapshot = RunSnapshot::default();
        Ok(())
    }
}

/// A run's write access to the snapshot store.
#[derive(Clone)]
pub struct RunSnapshotHandle {
    store: Arc<SnapshotStore>,
    run_id: Uuid,
}

impl RunSnapshotHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn read(&self) -> RunSnapshot {
        self.store.current()
    }

    /// Read-modify-write the snapshot and persist it.
    pub fn update<R>(&self, f: impl FnOnce(&mut RunSnapshot) -> R) -> Result<R, SnapshotError> {
        let mut state = self.store.state();
        if state.owner != Some(self.run_id) {
            return Err(SnapshotError::StaleRun {
                run_id: self.run_id,
            });
        }
        let mut next = state.snapshot.clone();
        let out = f(&mut next);
        next.updated_at = Some(Utc::now());
        self.store.persist(&next)?;
        state.snapshot = next;
        Ok(out)
    }
}
