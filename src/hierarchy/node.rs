//! Hierarchy node types.
//!
//! `PersistedNode` mirrors the on-disk description written by the offline
//! crawler; `HierarchyNode` is the validated, immutable runtime tree built
//! from it. A node with `server` and `tool` fields is a tool, anything else
//! is a category.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

// ─── Persisted Form ──────────────────────────────────────────────────────────

/// A node as stored in the hierarchy file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PersistedNode {
    Tool(PersistedTool),
    Category(PersistedCategory),
}

/// Persisted tool descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistedTool {
    /// Owning backend server name.
    pub server: String,
    /// The backend's native tool identifier.
    pub tool: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Persisted category descriptor.
///
/// Unknown fields are rejected so a malformed tool entry (say, missing
/// `tool`) fails to load instead of silently becoming an empty category.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedCategory {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub children: BTreeMap<String, PersistedNode>,
}

// ─── Runtime Form ────────────────────────────────────────────────────────────

/// Whether a node is browsable or invocable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Category,
    Tool,
}

/// A node in the immutable hierarchy tree.
#[derive(Debug, Clone, PartialEq)]
pub enum HierarchyNode {
    Category(CategoryNode),
    Tool(ToolNode),
}

impl HierarchyNode {
    /// Full dot-separated path; the root's path is `""`.
    pub fn path(&self) -> &str {
        match self {
            HierarchyNode::Category(c) => &c.path,
            HierarchyNode::Tool(t) => &t.path,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            HierarchyNode::Category(c) => &c.description,
            HierarchyNode::Tool(t) => &t.description,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            HierarchyNode::Category(_) => NodeKind::Category,
            HierarchyNode::Tool(_) => NodeKind::Tool,
        }
    }
}

/// A category: named children plus its own description.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryNode {
    pub(crate) path: String,
    pub(crate) description: String,
    pub(crate) children: BTreeMap<String, HierarchyNode>,
}

impl CategoryNode {
    pub fn children(&self) -> &BTreeMap<String, HierarchyNode> {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&HierarchyNode> {
        self.children.get(name)
    }
}

/// A tool: where it lives and how to call it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolNode {
    pub(crate) path: String,
    pub(crate) description: String,
    pub(crate) server: String,
    pub(crate) tool: String,
    pub(crate) input_schema: serde_json::Value,
}

impl ToolNode {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Owning backend server name.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The backend's native tool identifier.
    pub fn tool_id(&self) -> &str {
        &self.tool
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &serde_json::Value {
        &self.input_schema
    }

    /// Description shown when browsing the parent category.
    ///
    /// The argument schema is appended when present so the agent can build
    /// `execute_tool` arguments without a separate lookup.
    pub fn listing_description(&self) -> String {
        if self.input_schema.is_null() {
            return self.description.clone();
        }
        let schema = serde_json::to_string(&self.input_schema).unwrap_or_default();
        if self.description.is_empty() {
            format!("Arguments: {schema}")
        } else {
            format!("{}\nArguments: {schema}", self.description)
        }
    }
}

// ─── Listing ─────────────────────────────────────────────────────────────────

/// Children of one category, split by kind, as returned to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryListing {
    pub categories: BTreeMap<String, String>,
    pub tools: BTreeMap<String, String>,
}

impl CategoryListing {
    pub(crate) fn of(category: &CategoryNode) -> Self {
        let mut listing = Self::default();
        for (name, child) in &category.children {
            match child {
                HierarchyNode::Category(c) => {
                    listing
                        .categories
                        .insert(name.clone(), c.description.clone());
                }
                HierarchyNode::Tool(t) => {
                    listing.tools.insert(name.clone(), t.listing_description());
                }
            }
        }
        listing
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_tool_vs_category() {
        let tool: PersistedNode = serde_json::from_str(
            r#"{"server": "serena", "tool": "find_symbol", "description": "Find a symbol"}"#,
        )
        .unwrap();
        assert!(matches!(tool, PersistedNode::Tool(ref t) if t.tool == "find_symbol"));

        let category: PersistedNode =
            serde_json::from_str(r#"{"description": "Code tools", "children": {}}"#).unwrap();
        assert!(matches!(category, PersistedNode::Category(_)));
    }

    #[test]
    fn test_tool_missing_native_id_is_rejected() {
        let result = serde_json::from_str::<PersistedNode>(r#"{"server": "serena"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_listing_description_appends_schema() {
        let tool = ToolNode {
            path: "a.b".into(),
            description: "Find a symbol".into(),
            server: "serena".into(),
            tool: "find_symbol".into(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        assert_eq!(
            tool.listing_description(),
            "Find a symbol\nArguments: {\"type\":\"object\"}"
        );

        let bare = ToolNode {
            input_schema: serde_json::Value::Null,
            ..tool
        };
        assert_eq!(bare.listing_description(), "Find a symbol");
    }
}
