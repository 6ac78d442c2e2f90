//! Namespace builder: merges flat per-device file records into one tree.
//!
//! Shape of every tree produced here:
//!
//! ```text
//! Core
//! ├── Devices   (files source, one child per device)
//! ├── Sync      (sync source)
//! ├── Shared    (shared source)
//! └── Cloud     (s3files source)
//! ```
//!
//! Under each category node records are grouped by device, then walked
//! segment by segment. `build` is a pure function of its inputs, so
//! overlapping rebuilds can never corrupt each other: each produces a fresh
//! tree.

use crate::device::Device;
use crate::records::{
    is_directory_kind, normalize_path, Availability, FileRecord, RecordKey, Source, FOLDER_KIND,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

pub const ROOT_ID: &str = "core";
pub const ROOT_NAME: &str = "Core";
pub const DEVICE_KIND: &str = "Device";
pub const CATEGORY_KIND: &str = "Category";

/// One node of the namespace tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    /// Stable id derived from category, device and path segments
    pub id: String,
    pub file_name: String,
    /// Namespace-relative path below the device node
    pub file_path: String,
    pub kind: String,
    /// Id of the parent node (None only for the root)
    pub file_parent: Option<String>,
    /// Present iff the node can hold children
    pub children: Option<Vec<TreeNode>>,
    /// Denormalized copy of the record this node renders
    pub record: Option<FileRecord>,
}

impl TreeNode {
    fn container(id: String, file_name: &str, file_path: String, kind: &str, parent: &str) -> Self {
        Self {
            id,
            file_name: file_name.to_string(),
            file_path,
            kind: kind.to_string(),
            file_parent: Some(parent.to_string()),
            children: Some(Vec::new()),
            record: None,
        }
    }

    fn root() -> Self {
        let mut root = Self {
            id: ROOT_ID.to_string(),
            file_name: ROOT_NAME.to_string(),
            file_path: String::new(),
            kind: CATEGORY_KIND.to_string(),
            file_parent: None,
            children: Some(Vec::with_capacity(4)),
            record: None,
        };
        for source in Source::ALL {
            root.push_child(TreeNode::container(
                category_id(source).to_string(),
                category_name(source),
                String::new(),
                CATEGORY_KIND,
                ROOT_ID,
            ));
        }
        root
    }

    pub fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    pub fn children(&self) -> &[TreeNode] {
        self.children.as_deref().unwrap_or(&[])
    }

    fn push_child(&mut self, child: TreeNode) -> &mut TreeNode {
        let children = self.children.get_or_insert_with(Vec::new);
        children.push(child);
        let last = children.len() - 1;
        &mut children[last]
    }

    fn child_index(&self, file_name: &str) -> Option<usize> {
        self.children()
            .iter()
            .position(|c| c.file_name == file_name)
    }

    /// Top-level node for a source category.
    pub fn category(&self, source: Source) -> Option<&TreeNode> {
        self.children().iter().find(|c| c.id == category_id(source))
    }

    fn category_mut(&mut self, source: Source) -> &mut TreeNode {
        let id = category_id(source);
        let children = self.children.get_or_insert_with(Vec::new);
        match children.iter().position(|c| c.id == id) {
            Some(i) => &mut children[i],
            None => {
                children.push(TreeNode::container(
                    id.to_string(),
                    category_name(source),
                    String::new(),
                    CATEGORY_KIND,
                    ROOT_ID,
                ));
                let last = children.len() - 1;
                &mut children[last]
            }
        }
    }

    /// Find a node by id anywhere below (and including) this node.
    pub fn find(&self, id: &str) -> Option<&TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(id))
    }

    /// All nodes in pre-order.
    pub fn walk(&self) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children().iter().rev());
        }
        out
    }

    /// Nodes without a children list.
    pub fn leaves(&self) -> Vec<&TreeNode> {
        self.walk()
            .into_iter()
            .filter(|n| !n.is_directory())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }
}

pub fn category_id(source: Source) -> &'static str {
    match source {
        Source::Files => "devices",
        Source::Sync => "sync",
        Source::Shared => "shared",
        Source::S3files => "cloud",
    }
}

pub fn category_name(source: Source) -> &'static str {
    match source {
        Source::Files => "Devices",
        Source::Sync => "Sync",
        Source::Shared => "Shared",
        Source::S3files => "Cloud",
    }
}

fn device_node_id(source: Source, device: &str) -> String {
    format!("{}/{}", category_id(source), device)
}

/// Build a fresh namespace tree from flat records and the known devices.
///
/// Deterministic: children appear in first-appearance order of the input,
/// devices known only from `devices` are appended after file-derived ones.
pub fn build(records: &[FileRecord], devices: &[Device]) -> TreeNode {
    let mut root = TreeNode::root();
    let online: HashMap<&str, bool> = devices
        .iter()
        .map(|d| (d.name(), d.is_online()))
        .collect();

    // Group by (category, device), first appearance wins the position.
    let mut groups: Vec<((Source, &str), Vec<&FileRecord>)> = Vec::new();
    let mut index: HashMap<(Source, &str), usize> = HashMap::new();
    for record in records {
        if record.device_name.is_empty() {
            debug!("Dropping record without device: {}", record.file_path);
            continue;
        }
        let key = (record.source, record.device_name.as_str());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(record);
    }

    for ((source, device), group) in groups {
        let category = root.category_mut(source);
        let device_node = device_node_mut(category, source, device);
        for record in group {
            let mut record = record.clone();
            if let Some(is_online) = online.get(record.device_name.as_str()) {
                record.available = Availability::from_online(*is_online);
            }
            insert_record(device_node, source, device, record);
        }
    }

    let category = root.category_mut(Source::Files);
    for device in devices {
        if device.name().is_empty() {
            continue;
        }
        device_node_mut(category, Source::Files, device.name());
    }

    root
}

/// Merge new records into a previously built tree.
///
/// Records already carried by `previous` are unioned with `records`; a new
/// record with the same `(file_path, device_name, source)` replaces the old
/// one in place. The result is a fresh tree.
pub fn merge(previous: &TreeNode, records: &[FileRecord], devices: &[Device]) -> TreeNode {
    let merged = dedup(collect_records(previous).into_iter().chain(records.iter().cloned()));
    build(&merged, devices)
}

/// Union records, keeping the first position and the last value per key.
pub fn dedup(records: impl IntoIterator<Item = FileRecord>) -> Vec<FileRecord> {
    let mut out: Vec<FileRecord> = Vec::new();
    let mut index: HashMap<RecordKey, usize> = HashMap::new();
    for record in records {
        match index.get(&record.key()) {
            Some(&i) => out[i] = record,
            None => {
                index.insert(record.key(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Records carried on a tree's nodes, in an order that rebuilds the same tree.
pub fn collect_records(tree: &TreeNode) -> Vec<FileRecord> {
    let mut out = Vec::new();
    collect_into(tree, &mut out);
    out
}

fn collect_into(node: &TreeNode, out: &mut Vec<FileRecord>) {
    // A directory whose kind is still "Folder" was created as an
    // intermediate before its own record arrived; emit that record after the
    // children so a rebuild walks through it first again.
    let record_after = node.kind == FOLDER_KIND
        && node
            .record
            .as_ref()
            .map(|r| r.kind != FOLDER_KIND)
            .unwrap_or(false);

    if !record_after {
        out.extend(node.record.iter().cloned());
    }
    for child in node.children() {
        collect_into(child, out);
    }
    if record_after {
        out.extend(node.record.iter().cloned());
    }
}

fn device_node_mut<'a>(category: &'a mut TreeNode, source: Source, device: &str) -> &'a mut TreeNode {
    match category.child_index(device) {
        Some(i) => &mut category.children.get_or_insert_with(Vec::new)[i],
        None => {
            let parent = category.id.clone();
            category.push_child(TreeNode::container(
                device_node_id(source, device),
                device,
                String::new(),
                DEVICE_KIND,
                &parent,
            ))
        }
    }
}

fn insert_record(device_node: &mut TreeNode, source: Source, device: &str, record: FileRecord) {
    let path = normalize_path(&record.file_path);
    if path.is_empty() {
        // No structure to walk; attach at the device itself.
        device_node.record = Some(record);
        return;
    }

    let segments: Vec<&str> = path.split('/').collect();
    let (last, intermediate) = match segments.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut node = device_node;
    let mut walked = String::new();
    for segment in intermediate {
        if !walked.is_empty() {
            walked.push('/');
        }
        walked.push_str(segment);
        node = intermediate_mut(node, source, device, segment, &walked);
    }

    if !walked.is_empty() {
        walked.push('/');
    }
    walked.push_str(last);

    match node.child_index(last) {
        Some(i) => {
            let existing = &mut node.children.get_or_insert_with(Vec::new)[i];
            if !existing.is_directory() {
                existing.kind = record.kind.clone();
                if record.is_directory() {
                    existing.children = Some(Vec::new());
                }
            }
            existing.record = Some(record);
        }
        None => {
            let parent = node.id.clone();
            let children = record.is_directory().then(Vec::new);
            node.push_child(TreeNode {
                id: format!("{}/{}", device_node_id(source, device), walked),
                file_name: last.to_string(),
                file_path: walked,
                kind: record.kind.clone(),
                file_parent: Some(parent),
                children,
                record: Some(record),
            });
        }
    }
}

/// Reuse the child named `segment` or create a "Folder" node for it.
fn intermediate_mut<'a>(
    node: &'a mut TreeNode,
    source: Source,
    device: &str,
    segment: &str,
    walked: &str,
) -> &'a mut TreeNode {
    match node.child_index(segment) {
        Some(i) => {
            let child = &mut node.children.get_or_insert_with(Vec::new)[i];
            if !child.is_directory() {
                // A file leaf now has descendants: it becomes a folder.
                child.kind = FOLDER_KIND.to_string();
                child.children = Some(Vec::new());
            }
            child
        }
        None => {
            let parent = node.id.clone();
            node.push_child(TreeNode::container(
                format!("{}/{}", device_node_id(source, device), walked),
                segment,
                walked.to_string(),
                FOLDER_KIND,
                &parent,
            ))
        }
    }
}
