//! Hierarchy store — path lookups over the immutable category/tool tree.
//!
//! The tree is validated and built once at load time and never mutated, so
//! every method takes `&self` and needs no locking.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::errors::GatewayError;

use super::node::{
    CategoryListing, CategoryNode, HierarchyNode, PersistedCategory, PersistedNode, ToolNode,
    PATH_SEPARATOR,
};

/// Read-only hierarchy of categories and tools.
#[derive(Debug, Clone)]
pub struct HierarchyStore {
    root: HierarchyNode,
}

impl HierarchyStore {
    /// Load and validate a persisted hierarchy JSON file.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::HierarchyLoad {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let store = Self::from_json_str(&raw).map_err(|e| GatewayError::HierarchyLoad {
            reason: format!("{}: {e}", path.display()),
        })?;

        tracing::info!(
            path = %path.display(),
            tools = store.tool_count(),
            servers = store.server_names().len(),
            "hierarchy loaded"
        );
        Ok(store)
    }

    /// Parse and validate a hierarchy from JSON text.
    pub fn from_json_str(raw: &str) -> Result<Self, GatewayError> {
        let root: PersistedNode =
            serde_json::from_str(raw).map_err(|e| GatewayError::HierarchyLoad {
                reason: format!("failed to parse hierarchy: {e}"),
            })?;
        match root {
            PersistedNode::Category(category) => Self::from_persisted(category),
            PersistedNode::Tool(_) => Err(GatewayError::HierarchyLoad {
                reason: "the root node must be a category".into(),
            }),
        }
    }

    /// Build the runtime tree from a persisted root category.
    pub fn from_persisted(root: PersistedCategory) -> Result<Self, GatewayError> {
        let root = build_category(String::new(), root)?;
        Ok(Self {
            root: HierarchyNode::Category(root),
        })
    }

    /// Resolve a dot-separated path; `""` is the root.
    pub fn lookup(&self, path: &str) -> Result<&HierarchyNode, GatewayError> {
        if path.is_empty() {
            return Ok(&self.root);
        }

        let mut current = &self.root;
        for segment in path.split(PATH_SEPARATOR) {
            let next = match current {
                HierarchyNode::Category(category) => category.child(segment),
                HierarchyNode::Tool(_) => None,
            };
            current = next.ok_or_else(|| GatewayError::PathNotFound {
                path: path.to_string(),
                segment: segment.to_string(),
            })?;
        }
        Ok(current)
    }

    /// List a category's children split into categories and tools.
    pub fn list_children(&self, path: &str) -> Result<CategoryListing, GatewayError> {
        match self.lookup(path)? {
            HierarchyNode::Category(category) => Ok(CategoryListing::of(category)),
            HierarchyNode::Tool(_) => Err(GatewayError::NotACategory {
                path: path.to_string(),
            }),
        }
    }

    /// Resolve a path that must name a tool.
    pub fn resolve_tool(&self, path: &str) -> Result<&ToolNode, GatewayError> {
        match self.lookup(path)? {
            HierarchyNode::Tool(tool) => Ok(tool),
            HierarchyNode::Category(_) => Err(GatewayError::NotATool {
                path: path.to_string(),
            }),
        }
    }

    /// Every backend server referenced by a tool node.
    pub fn server_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        visit_tools(&self.root, &mut |tool| {
            names.insert(tool.server.clone());
        });
        names
    }

    /// Total number of tool nodes.
    pub fn tool_count(&self) -> usize {
        let mut count = 0;
        visit_tools(&self.root, &mut |_| count += 1);
        count
    }
}

fn visit_tools<'a>(node: &'a HierarchyNode, f: &mut dyn FnMut(&'a ToolNode)) {
    match node {
        HierarchyNode::Tool(tool) => f(tool),
        HierarchyNode::Category(category) => {
            for child in category.children.values() {
                visit_tools(child, f);
            }
        }
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}{PATH_SEPARATOR}{name}")
    }
}

fn build_category(path: String, persisted: PersistedCategory) -> Result<CategoryNode, GatewayError> {
    let mut children = BTreeMap::new();

    for (name, child) in persisted.children {
        if name.is_empty() || name.contains(PATH_SEPARATOR) {
            return Err(GatewayError::HierarchyLoad {
                reason: format!(
                    "invalid child name '{name}' under '{path}': names must be non-empty and must not contain '{PATH_SEPARATOR}'"
                ),
            });
        }
        let child_path = join_path(&path, &name);

        let node = match child {
            PersistedNode::Category(category) => {
                HierarchyNode::Category(build_category(child_path, category)?)
            }
            PersistedNode::Tool(tool) => {
                if tool.server.trim().is_empty() || tool.tool.trim().is_empty() {
                    return Err(GatewayError::HierarchyLoad {
                        reason: format!("tool '{child_path}' needs a non-empty server and tool"),
                    });
                }
                HierarchyNode::Tool(ToolNode {
                    path: child_path,
                    description: tool.description,
                    server: tool.server,
                    tool: tool.tool,
                    input_schema: tool.input_schema,
                })
            }
        };
        children.insert(name, node);
    }

    Ok(CategoryNode {
        path,
        description: persisted.description,
        children,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
