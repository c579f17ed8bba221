//! Hierarchy — the browsable category/tool tree.
//!
//! Loaded once at startup from the crawler's output and shared read-only
//! by every request.

pub mod node;
pub mod store;

pub use node::{CategoryListing, CategoryNode, HierarchyNode, NodeKind, ToolNode, PATH_SEPARATOR};
pub use store::HierarchyStore;
