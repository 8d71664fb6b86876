//! Shared context pool for a running workflow.
//!
//! Task outputs are stored here as they complete so dependents can read
//! them. Entries may reference each other and may carry a TTL.

use crate::core::TaskId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    TaskOutput,
    SharedMemory,
    Artifact,
    Document,
    Code,
    Configuration,
    ValidationResult,
    Error,
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContextType::TaskOutput => "task_output",
            ContextType::SharedMemory => "shared_memory",
            ContextType::Artifact => "artifact",
            ContextType::Document => "document",
            ContextType::Code => "code",
            ContextType::Configuration => "configuration",
            ContextType::ValidationResult => "validation_result",
            ContextType::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub workflow_id: String,
    pub task_id: TaskId,
    pub content_type: ContextType,
    pub content: Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ids of entries this one builds on.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl ContextEntry {
    pub fn new(
        workflow_id: &str,
        task_id: TaskId,
        content_type: ContextType,
        content: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ctx-{}", uuid::Uuid::new_v4()),
            workflow_id: workflow_id.to_string(),
            task_id,
            content_type,
            content,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            references: Vec::new(),
            ttl_seconds: None,
        }
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_seconds.is_some_and(|ttl| {
            let age = (now - self.created_at).num_seconds();
            age > 0 && age as u64 > ttl
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextPoolStats {
    pub total_entries: usize,
    pub total_workflows: usize,
    pub total_tasks: usize,
    pub type_distribution: BTreeMap<String, usize>,
    pub total_size_bytes: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, ContextEntry>,
    by_workflow: HashMap<String, Vec<String>>,
    by_task: HashMap<TaskId, Vec<String>>,
}

impl Inner {
    fn detach(&mut self, id: &str) -> Option<ContextEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(ids) = self.by_workflow.get_mut(&entry.workflow_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_workflow.remove(&entry.workflow_id);
            }
        }
        if let Some(ids) = self.by_task.get_mut(&entry.task_id) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                self.by_task.remove(&entry.task_id);
            }
        }
        Some(entry)
    }

    fn collect_chain(
        &self,
        id: &str,
        depth: usize,
        max_depth: usize,
        visited: &mut HashSet<String>,
        out: &mut Vec<ContextEntry>,
    ) {
        if depth >= max_depth || !visited.insert(id.to_string()) {
            return;
        }
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        for reference in &entry.references {
            self.collect_chain(reference, depth + 1, max_depth, visited, out);
        }
        out.push(entry.clone());
    }
}

#[derive(Default)]
pub struct ContextPool {
    inner: RwLock<Inner>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; an entry with the same id is replaced.
    pub fn add(&self, entry: ContextEntry) -> String {
        let mut inner = self.inner.write();
        let id = entry.id.clone();
        inner.detach(&id);
        inner
            .by_workflow
            .entry(entry.workflow_id.clone())
            .or_default()
            .push(id.clone());
        inner
            .by_task
            .entry(entry.task_id.clone())
            .or_default()
            .push(id.clone());
        inner.entries.insert(id.clone(), entry);
        id
    }

    pub fn get(&self, id: &str) -> Option<ContextEntry> {
        self.inner.read().entries.get(id).cloned()
    }

    pub fn task_context(&self, task_id: &TaskId) -> Vec<ContextEntry> {
        let inner = self.inner.read();
        inner
            .by_task
            .get(task_id)
            .map(|ids| ids.iter().filter_map(|id| inner.entries.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn workflow_context(&self, workflow_id: &str) -> Vec<ContextEntry> {
        let inner = self.inner.read();
        inner
            .by_workflow
            .get(workflow_id)
            .map(|ids| ids.iter().filter_map(|id| inner.entries.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Entries of a task plus everything they reference, referenced entries
    /// first, following at most `max_depth` levels.
    pub fn get_context_chain(&self, task_id: &TaskId, max_depth: usize) -> Vec<ContextEntry> {
        let inner = self.inner.read();
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        if let Some(ids) = inner.by_task.get(task_id) {
            for id in ids {
                inner.collect_chain(id, 0, max_depth, &mut visited, &mut out);
            }
        }
        out
    }

    pub fn update(&self, id: &str, content: Value) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::Validation(format!("context entry not found: {}", id)))?;
        entry.content = content;
        entry.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<ContextEntry> {
        self.inner
            .write()
            .detach(id)
            .ok_or_else(|| Error::Validation(format!("context entry not found: {}", id)))
    }

    pub fn clear_workflow(&self, workflow_id: &str) -> usize {
        let mut inner = self.inner.write();
        let ids = inner.by_workflow.get(workflow_id).cloned().unwrap_or_default();
        ids.iter().filter(|id| inner.detach(id).is_some()).count()
    }

    /// Drop entries past their TTL; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.id.clone())
            .collect();
        for id in &expired {
            inner.detach(id);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "expired context entries removed");
        }
        expired.len()
    }

    pub fn stats(&self) -> ContextPoolStats {
        let inner = self.inner.read();
        let mut stats = ContextPoolStats {
            total_entries: inner.entries.len(),
            total_workflows: inner.by_workflow.len(),
            total_tasks: inner.by_task.len(),
            ..ContextPoolStats::default()
        };
        for entry in inner.entries.values() {
            *stats
                .type_distribution
                .entry(entry.content_type.to_string())
                .or_insert(0) += 1;
            stats.total_size_bytes += entry.content.to_string().len();
        }
        stats
    }

    /// Store a completed task's output.
    pub fn record_output(&self, workflow_id: &str, task_id: &TaskId, output: Value) -> String {
        self.add(ContextEntry::new(
            workflow_id,
            task_id.clone(),
            ContextType::TaskOutput,
            output,
        ))
    }

    /// Latest output a task recorded within one workflow.
    pub fn task_output(&self, workflow_id: &str, task_id: &TaskId) -> Option<Value> {
        let inner = self.inner.read();
        inner.by_task.get(task_id).and_then(|ids| {
            ids.iter()
                .rev()
                .filter_map(|id| inner.entries.get(id))
                .find(|entry| {
                    entry.workflow_id == workflow_id
                        && entry.content_type == ContextType::TaskOutput
                })
                .map(|entry| entry.content.clone())
        })
    }

    /// Outputs for each dependency within a workflow, or the first
    /// dependency with none.
    pub fn dependency_outputs(
        &self,
        workflow_id: &str,
        dependencies: &[TaskId],
    ) -> std::result::Result<Vec<(TaskId, Value)>, TaskId> {
        dependencies
            .iter()
            .map(|dep| {
                self.task_output(workflow_id, dep)
                    .map(|output| (dep.clone(), output))
                    .ok_or_else(|| dep.clone())
            })
            .collect()
    }
}
