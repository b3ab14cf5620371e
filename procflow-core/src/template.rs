//! Template validation.
//!
//! A template version must pass these checks before it may become
//! latest: node relations reference existing nodes of the same graph,
//! the graph is well-shaped (one start, reachable ends), service
//! handler names resolve in the registry, and every parallel fork has a
//! computable join.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use crate::error::{EngineError, Result};
use crate::handlers::ServiceRegistry;
use crate::types::{NodeConfig, NodeType, Template};

fn graph_of(nodes: &[NodeConfig]) -> DiGraphMap<&str, ()> {
    let mut graph = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node.node_key.as_str());
    }
    for node in nodes {
        for next in &node.next_nodes {
            graph.add_edge(node.node_key.as_str(), next.as_str(), ());
        }
    }
    graph
}

/// Assert that `prev_nodes`, `next_nodes`, `parallel_nodes`,
/// `branch_nodes` and `default_branch` only reference nodes of this
/// template, and that node keys are unique.
pub fn validate_node_relations(template: &Template) -> Result<()> {
    let mut keys = HashSet::new();
    for node in &template.node_config {
        if !keys.insert(node.node_key.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate node key {}",
                node.node_key
            )));
        }
    }

    for node in &template.node_config {
        let refs = node
            .prev_nodes
            .iter()
            .chain(&node.next_nodes)
            .chain(&node.parallel_nodes)
            .chain(&node.branch_nodes)
            .chain(node.default_branch.iter());
        for target in refs {
            if !keys.contains(target.as_str()) {
                return Err(EngineError::Validation(format!(
                    "node {} references unknown node {target}",
                    node.node_key
                )));
            }
        }
    }
    Ok(())
}

/// Nearest common descendant of a parallel fork's branches: the
/// shallowest node (by distance from the fork) reachable from every
/// branch head.
fn join_of(nodes: &[NodeConfig], fork: &NodeConfig) -> Result<String> {
    let adjacency: HashMap<&str, &NodeConfig> =
        nodes.iter().map(|n| (n.node_key.as_str(), n)).collect();

    // BFS depth map from one starting key.
    let depths_from = |start: &str| -> HashMap<String, u32> {
        let mut depths = HashMap::new();
        let mut queue = VecDeque::new();
        depths.insert(start.to_string(), 0u32);
        queue.push_back(start.to_string());
        while let Some(key) = queue.pop_front() {
            let depth = depths[&key];
            if let Some(node) = adjacency.get(key.as_str()) {
                for next in &node.next_nodes {
                    if !depths.contains_key(next) {
                        depths.insert(next.clone(), depth + 1);
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        depths
    };

    let mut branch_depths: Vec<HashMap<String, u32>> = Vec::new();
    for head in &fork.next_nodes {
        branch_depths.push(depths_from(head));
    }

    let mut candidates: Vec<(u32, String)> = branch_depths[0]
        .iter()
        .filter(|(key, _)| branch_depths[1..].iter().all(|d| d.contains_key(*key)))
        .map(|(key, _)| {
            let worst = branch_depths
                .iter()
                .map(|d| d[key])
                .max()
                .unwrap_or(u32::MAX);
            (worst, key.clone())
        })
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .map(|(_, key)| key)
        .next()
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "parallel node {} has no common join node",
                fork.node_key
            ))
        })
}

/// Precompute `branch_nodes` (join identity) for every parallel fork
/// with more than one outgoing edge.
pub fn compute_join_nodes(template: &mut Template) -> Result<()> {
    let nodes = template.node_config.clone();
    for node in &mut template.node_config {
        if node.node_type == NodeType::Parallel && node.next_nodes.len() > 1 {
            let join = join_of(&nodes, node)?;
            node.branch_nodes = vec![join];
        }
    }
    Ok(())
}

/// Full structural validation against the service registry.
pub fn validate_template(template: &Template, services: &ServiceRegistry) -> Result<()> {
    if template.node_config.is_empty() {
        return Err(EngineError::Validation("template has no nodes".into()));
    }
    validate_node_relations(template)?;

    let starts: Vec<&NodeConfig> = template
        .node_config
        .iter()
        .filter(|n| n.node_type == NodeType::Start)
        .collect();
    if starts.len() != 1 {
        return Err(EngineError::Validation(format!(
            "template must have exactly one start node, found {}",
            starts.len()
        )));
    }
    let start = starts[0];
    if !start.prev_nodes.is_empty() {
        return Err(EngineError::Validation("start node has predecessors".into()));
    }
    if start.next_nodes.is_empty() {
        return Err(EngineError::Validation("start node has no successor".into()));
    }

    if !template
        .node_config
        .iter()
        .any(|n| n.node_type == NodeType::End)
    {
        return Err(EngineError::Validation("template has no end node".into()));
    }

    for node in &template.node_config {
        match node.node_type {
            NodeType::End => {
                if !node.next_nodes.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "end node {} has successors",
                        node.node_key
                    )));
                }
            }
            NodeType::Exclusive => {
                if node.conditions.len() > node.next_nodes.len() {
                    return Err(EngineError::Validation(format!(
                        "exclusive node {} has more conditions than branches",
                        node.node_key
                    )));
                }
                if let Some(default) = &node.default_branch {
                    if !node.next_nodes.contains(default) {
                        return Err(EngineError::Validation(format!(
                            "exclusive node {} default branch {default} is not an outgoing edge",
                            node.node_key
                        )));
                    }
                }
            }
            NodeType::Approval => {
                if node.assignees.is_empty() && node.candidates.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "approval node {} has no assignees or candidates",
                        node.node_key
                    )));
                }
            }
            NodeType::Service => {
                if node.handlers.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "service node {} names no handlers",
                        node.node_key
                    )));
                }
                for name in &node.handlers {
                    if !services.contains(name) {
                        return Err(EngineError::Validation(format!(
                            "service node {} references unknown handler {name}",
                            node.node_key
                        )));
                    }
                }
            }
            _ => {}
        }
    }

    // Every node reachable from the start.
    let graph = graph_of(&template.node_config);
    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, start.node_key.as_str());
    while let Some(key) = dfs.next(&graph) {
        reached.insert(key);
    }
    for node in &template.node_config {
        if !reached.contains(node.node_key.as_str()) {
            return Err(EngineError::Validation(format!(
                "node {} is unreachable from the start node",
                node.node_key
            )));
        }
    }

    // Every multi-branch parallel fork must have a computable join.
    for node in &template.node_config {
        if node.node_type == NodeType::Parallel && node.next_nodes.len() > 1 {
            join_of(&template.node_config, node)?;
        }
    }

    Ok(())
}

/// Validate and fill the precomputed join identities. Run before a
/// version becomes latest.
pub fn prepare_template(template: &mut Template, services: &ServiceRegistry) -> Result<()> {
    validate_template(template, services)?;
    compute_join_nodes(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReminderConfig, TimeoutConfig};
    use uuid::Uuid;

    fn node(key: &str, node_type: NodeType, next: &[&str]) -> NodeConfig {
        NodeConfig {
            node_key: key.into(),
            name: key.into(),
            node_type,
            prev_nodes: vec![],
            next_nodes: next.iter().map(|s| s.to_string()).collect(),
            parallel_nodes: vec![],
            branch_nodes: vec![],
            conditions: vec![],
            default_branch: None,
            assignees: vec!["alice".into()],
            candidates: vec![],
            countersign: Default::default(),
            assignee_strategy: Default::default(),
            continue_on_reject: false,
            properties: serde_json::Value::Null,
            handlers: vec![],
            retry_times: 0,
            retry_interval_ms: 0,
            is_working_day: false,
            timeout_duration_ms: None,
            timeout_strategy: Default::default(),
        }
    }

    fn template(nodes: Vec<NodeConfig>) -> Template {
        Template {
            id: Uuid::now_v7(),
            template_key: "t".into(),
            code: "t".into(),
            version: 1,
            module_code: "m".into(),
            form_code: "f".into(),
            node_config: nodes,
            process_rules: vec![],
            form_config: serde_json::Value::Null,
            timeout_config: TimeoutConfig::default(),
            reminder_config: ReminderConfig::default(),
            is_latest: true,
            disabled: false,
            effective_time: None,
            expire_time: None,
            allow_cancel: true,
            allow_urge: true,
            allow_delegate: true,
            allow_transfer: true,
        }
    }

    #[test]
    fn accepts_a_simple_linear_template() {
        let t = template(vec![
            node("start", NodeType::Start, &["approve"]),
            node("approve", NodeType::Approval, &["end"]),
            node("end", NodeType::End, &[]),
        ]);
        validate_template(&t, &ServiceRegistry::new()).unwrap();
    }

    #[test]
    fn rejects_dangling_references() {
        let t = template(vec![
            node("start", NodeType::Start, &["ghost"]),
            node("end", NodeType::End, &[]),
        ]);
        let err = validate_node_relations(&t).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_duplicate_keys_and_unreachable_nodes() {
        let t = template(vec![
            node("start", NodeType::Start, &["end"]),
            node("end", NodeType::End, &[]),
            node("end", NodeType::End, &[]),
        ]);
        assert!(validate_node_relations(&t).is_err());

        let t = template(vec![
            node("start", NodeType::Start, &["end"]),
            node("island", NodeType::Approval, &["end"]),
            node("end", NodeType::End, &[]),
        ]);
        let err = validate_template(&t, &ServiceRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn rejects_unknown_service_handler() {
        let mut svc = node("svc", NodeType::Service, &["end"]);
        svc.handlers = vec!["notify".into()];
        let t = template(vec![
            node("start", NodeType::Start, &["svc"]),
            svc,
            node("end", NodeType::End, &[]),
        ]);
        let err = validate_template(&t, &ServiceRegistry::new()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("notify"));
    }

    #[test]
    fn computes_nearest_join_for_parallel_fork() {
        let mut t = template(vec![
            node("start", NodeType::Start, &["fork"]),
            node("fork", NodeType::Parallel, &["a", "b"]),
            node("a", NodeType::Approval, &["join"]),
            node("b", NodeType::Approval, &["b2"]),
            node("b2", NodeType::Approval, &["join"]),
            node("join", NodeType::Parallel, &["end"]),
            node("end", NodeType::End, &[]),
        ]);
        prepare_template(&mut t, &ServiceRegistry::new()).unwrap();
        let fork = t.node("fork").unwrap();
        assert_eq!(fork.branch_nodes, vec!["join".to_string()]);
    }

    #[test]
    fn fork_without_common_descendant_is_rejected() {
        let t = template(vec![
            node("start", NodeType::Start, &["fork"]),
            node("fork", NodeType::Parallel, &["a", "b"]),
            node("a", NodeType::End, &[]),
            node("b", NodeType::End, &[]),
        ]);
        let err = validate_template(&t, &ServiceRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("no common join"));
    }
}
