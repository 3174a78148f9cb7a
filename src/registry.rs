//! The aggregated tool catalog: one namespace built from every supervised
//! server's `tools/list`, with deterministic collision resolution.
//!
//! When two or more servers offer a tool with the same name, the
//! *canonical* definition — the one an unqualified `tool_call` resolves
//! to — is chosen by `(priority ascending, discovery-order ascending)`.
//! Every other definition remains reachable only via its qualified name
//! `server_id/tool_name`.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::ToolDefinition;

/// One server's advertised tool, alongside the bookkeeping the registry
/// needs to resolve collisions.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub server_id: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub priority: i32,
    /// Monotonically increasing counter assigned when this tool was first
    /// discovered, used to break priority ties.
    pub discovery_order: u64,
}

impl RegisteredTool {
    fn from_definition(server_id: &str, priority: i32, discovery_order: u64, def: ToolDefinition) -> Self {
        Self {
            server_id: server_id.to_string(),
            name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            priority,
            discovery_order,
        }
    }

    /// The qualified name a caller can always use to reach this exact tool.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server_id, self.name)
    }
}

/// A name with more than one server offering it. `canonical` is the entry
/// an unqualified lookup currently resolves to; `others` lists the rest,
/// ordered the same way canonical selection is computed.
#[derive(Debug, Clone)]
pub struct Collision {
    pub tool_name: String,
    pub canonical: RegisteredTool,
    pub others: Vec<RegisteredTool>,
}

/// The aggregated catalog. Owned and mutated by [`crate::router::Router`]
/// as servers start, stop, and report `tools_changed`.
#[derive(Default)]
pub struct Registry {
    /// Every known tool, keyed by `(server_id, tool_name)`.
    by_server: HashMap<(String, String), RegisteredTool>,
    /// Unqualified name -> ordered list of every server offering it, head
    /// is always the current canonical entry.
    by_name: HashMap<String, Vec<(String, String)>>,
    next_discovery_order: u64,
}

/// What changed in the catalog as a result of a `replace_server_tools` call,
/// so the router can tell clients about new/lost tools without diffing
/// the whole registry itself.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces everything known about `server_id`'s tools with a freshly
    /// discovered list, preserving discovery order for tools that survive
    /// the refresh (so tie-breaking doesn't reshuffle on every poll) while
    /// assigning fresh discovery order to genuinely new tools.
    pub fn replace_server_tools(
        &mut self,
        server_id: &str,
        priority: i32,
        tools: Vec<ToolDefinition>,
    ) -> DiscoveryDelta {
        let previous_names: Vec<String> = self
            .by_server
            .keys()
            .filter(|(sid, _)| sid == server_id)
            .map(|(_, name)| name.clone())
            .collect();

        let new_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();

        let mut delta = DiscoveryDelta::default();

        for name in &previous_names {
            if !new_names.contains(name) {
                self.remove_entry(server_id, name);
                delta.removed.push(name.clone());
            }
        }

        for def in tools {
            let key = (server_id.to_string(), def.name.clone());
            let existing_discovery_order = self.by_server.get(&key).map(|existing| existing.discovery_order);
            let discovery_order = match existing_discovery_order {
                Some(order) => order,
                None => self.alloc_discovery_order(),
            };
            let is_new = !self.by_server.contains_key(&key);
            let tool = RegisteredTool::from_definition(server_id, priority, discovery_order, def);
            self.insert_entry(tool);
            if is_new {
                delta.added.push(key.1);
            }
        }

        delta
    }

    fn alloc_discovery_order(&mut self) -> u64 {
        let order = self.next_discovery_order;
        self.next_discovery_order += 1;
        order
    }

    fn insert_entry(&mut self, tool: RegisteredTool) {
        let key = (tool.server_id.clone(), tool.name.clone());
        let name = tool.name.clone();
        self.by_server.insert(key.clone(), tool);

        let bucket = self.by_name.entry(name.clone()).or_default();
        if !bucket.contains(&key) {
            bucket.push(key);
        }
        self.resort_bucket_for(&name);
    }

    fn remove_entry(&mut self, server_id: &str, tool_name: &str) {
        let key = (server_id.to_string(), tool_name.to_string());
        self.by_server.remove(&key);
        if let Some(bucket) = self.by_name.get_mut(tool_name) {
            bucket.retain(|k| k != &key);
            if bucket.is_empty() {
                self.by_name.remove(tool_name);
            }
        }
    }

    /// Re-sorts the bucket for `tool_name` by `(priority asc, discovery_order asc)`.
    fn resort_bucket_for(&mut self, tool_name: &str) {
        if let Some(bucket) = self.by_name.get_mut(tool_name) {
            let by_server = &self.by_server;
            bucket.sort_by(|a, b| {
                let ta = &by_server[a];
                let tb = &by_server[b];
                ta.priority
                    .cmp(&tb.priority)
                    .then(ta.discovery_order.cmp(&tb.discovery_order))
            });
        }
    }

    /// Drops every tool belonging to `server_id`, e.g. when its supervisor
    /// stops. Returns the names that lost their only provider entirely.
    pub fn remove_server(&mut self, server_id: &str) -> Vec<String> {
        let names: Vec<String> = self
            .by_server
            .keys()
            .filter(|(sid, _)| sid == server_id)
            .map(|(_, name)| name.clone())
            .collect();
        let mut fully_removed = Vec::new();
        for name in names {
            self.remove_entry(server_id, &name);
            if !self.by_name.contains_key(&name) {
                fully_removed.push(name);
            }
        }
        fully_removed
    }

    /// Looks up a tool by unqualified name, returning its current canonical
    /// definition.
    #[must_use]
    pub fn resolve_unqualified(&self, tool_name: &str) -> Option<&RegisteredTool> {
        let bucket = self.by_name.get(tool_name)?;
        let key = bucket.first()?;
        self.by_server.get(key)
    }

    /// Looks up a tool by qualified `server_id/tool_name`, bypassing
    /// collision resolution entirely.
    #[must_use]
    pub fn resolve_qualified(&self, server_id: &str, tool_name: &str) -> Option<&RegisteredTool> {
        self.by_server.get(&(server_id.to_string(), tool_name.to_string()))
    }

    /// Every tool currently known, across every server.
    pub fn all_tools(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.by_server.values()
    }

    /// Every name with more than one provider, with the canonical entry
    /// first.
    #[must_use]
    pub fn collisions(&self) -> Vec<Collision> {
        self.by_name
            .iter()
            .filter(|(_, bucket)| bucket.len() > 1)
            .map(|(name, bucket)| {
                let mut tools = bucket.iter().map(|k| self.by_server[k].clone());
                let canonical = tools.next().expect("bucket is non-empty");
                Collision {
                    tool_name: name.clone(),
                    canonical,
                    others: tools.collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: None,
            input_schema: Value::Null,
        }
    }

    #[test]
    fn unqualified_resolution_picks_lowest_priority_then_discovery_order() {
        let mut registry = Registry::new();
        registry.replace_server_tools("b", 5, vec![def("search")]);
        registry.replace_server_tools("a", 5, vec![def("search")]);

        let canonical = registry.resolve_unqualified("search").unwrap();
        assert_eq!(canonical.server_id, "b", "discovered first, equal priority");

        registry.replace_server_tools("c", 1, vec![def("search")]);
        let canonical = registry.resolve_unqualified("search").unwrap();
        assert_eq!(canonical.server_id, "c", "lower priority number wins outright");
    }

    #[test]
    fn qualified_resolution_reaches_non_canonical_entries() {
        let mut registry = Registry::new();
        registry.replace_server_tools("b", 5, vec![def("search")]);
        registry.replace_server_tools("a", 5, vec![def("search")]);

        let tool = registry.resolve_qualified("a", "search").unwrap();
        assert_eq!(tool.server_id, "a");
    }

    #[test]
    fn collisions_lists_every_name_with_multiple_providers() {
        let mut registry = Registry::new();
        registry.replace_server_tools("a", 0, vec![def("search"), def("unique_a")]);
        registry.replace_server_tools("b", 0, vec![def("search")]);

        let collisions = registry.collisions();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].tool_name, "search");
        assert_eq!(collisions[0].others.len(), 1);
    }

    #[test]
    fn replace_server_tools_reports_added_and_removed() {
        let mut registry = Registry::new();
        let delta = registry.replace_server_tools("a", 0, vec![def("x"), def("y")]);
        assert_eq!(delta.added.len(), 2);
        assert!(delta.removed.is_empty());

        let delta = registry.replace_server_tools("a", 0, vec![def("x"), def("z")]);
        assert_eq!(delta.added, vec!["z".to_string()]);
        assert_eq!(delta.removed, vec!["y".to_string()]);
    }

    #[test]
    fn remove_server_drops_only_its_own_tools() {
        let mut registry = Registry::new();
        registry.replace_server_tools("a", 0, vec![def("x")]);
        registry.replace_server_tools("b", 0, vec![def("y")]);

        let fully_removed = registry.remove_server("a");
        assert_eq!(fully_removed, vec!["x".to_string()]);
        assert!(registry.resolve_unqualified("x").is_none());
        assert!(registry.resolve_unqualified("y").is_some());
    }

    #[test]
    fn discovery_order_is_preserved_across_a_refresh() {
        let mut registry = Registry::new();
        registry.replace_server_tools("a", 0, vec![def("search")]);
        registry.replace_server_tools("b", 0, vec![def("search")]);
        assert_eq!(registry.resolve_unqualified("search").unwrap().server_id, "a");

        // Re-discovering "a" again (e.g. after a tools_changed refresh)
        // must not let it jump ahead of or behind "b".
        registry.replace_server_tools("a", 0, vec![def("search")]);
        assert_eq!(registry.resolve_unqualified("search").unwrap().server_id, "a");
    }
}
