use anyhow::{anyhow, bail};

use crate::topology::parser::{SwitchChildren, SwitchDef};
use crate::{Map, Set};

const NODES_PER_DEFAULT_SWITCH: u32 = 4;

/// The switch tree built from a parsed topology config (or synthesized from
/// the CPU count). Leaf switches attach compute nodes, interior switches
/// attach other switches; exactly one switch has no parent.
pub struct Topology {
    /// Node names in registration order; the ordinal doubles as the
    /// fallback CPU index.
    nodes: Vec<String>,
    node_index: Map<String, usize>,
    node_leaf: Map<String, String>,
    parent: Map<String, String>,
    children: Map<String, Vec<String>>,
    leaf_nodes: Map<String, Vec<String>>,
    /// Switch levels counted from the leaves: leaf = 1.
    level: Map<String, u32>,
    switch_order: Vec<String>,
}

impl Topology {
    pub fn build(defs: &[SwitchDef]) -> anyhow::Result<Topology> {
        let mut nodes: Vec<String> = Vec::new();
        let mut node_index: Map<String, usize> = Map::new();
        let mut node_leaf: Map<String, String> = Map::new();
        let mut parent: Map<String, String> = Map::new();
        let mut children: Map<String, Vec<String>> = Map::new();
        let mut leaf_nodes: Map<String, Vec<String>> = Map::new();
        let mut switch_order: Vec<String> = Vec::new();
        let mut known: Set<String> = Set::new();

        fn register_switch(name: &str, order: &mut Vec<String>, known: &mut Set<String>) {
            if known.insert(name.to_string()) {
                order.push(name.to_string());
            }
        }

        for def in defs {
            register_switch(&def.name, &mut switch_order, &mut known);
            match &def.children {
                SwitchChildren::Nodes(node_names) => {
                    if children.contains_key(&def.name) {
                        bail!(
                            "Switch '{}' attaches both nodes and switches",
                            def.name
                        );
                    }
                    for node in node_names {
                        if let Some(other) = node_leaf.get(node) {
                            if other != &def.name {
                                bail!(
                                    "Node '{}' is attached to switches '{}' and '{}'",
                                    node,
                                    other,
                                    def.name
                                );
                            }
                            continue;
                        }
                        node_leaf.insert(node.clone(), def.name.clone());
                        node_index.insert(node.clone(), nodes.len());
                        nodes.push(node.clone());
                        leaf_nodes
                            .entry(def.name.clone())
                            .or_default()
                            .push(node.clone());
                    }
                }
                SwitchChildren::Switches(switch_names) => {
                    if leaf_nodes.contains_key(&def.name) {
                        bail!(
                            "Switch '{}' attaches both nodes and switches",
                            def.name
                        );
                    }
                    for child in switch_names {
                        register_switch(child, &mut switch_order, &mut known);
                        if let Some(other) = parent.get(child) {
                            bail!(
                                "Switch '{}' has two parents: '{}' and '{}'",
                                child,
                                other,
                                def.name
                            );
                        }
                        parent.insert(child.clone(), def.name.clone());
                        children
                            .entry(def.name.clone())
                            .or_default()
                            .push(child.clone());
                    }
                }
            }
        }

        if nodes.is_empty() {
            bail!("Topology config attaches no nodes");
        }

        let tops: Vec<&String> = switch_order
            .iter()
            .filter(|name| !parent.contains_key(*name))
            .collect();
        match tops.len() {
            1 => {}
            0 => bail!("Topology has no top switch (switch parents form a cycle)"),
            _ => bail!(
                "Topology must have exactly one top switch, found: {}",
                tops.iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }

        // A switch whose parent chain never reaches the top is part of a
        // cycle disconnected from it.
        let top = tops[0].clone();
        for switch in &switch_order {
            let mut current = switch;
            let mut steps = 0;
            while let Some(up) = parent.get(current) {
                current = up;
                steps += 1;
                if steps > switch_order.len() {
                    bail!("Topology switch hierarchy contains a cycle at '{switch}'");
                }
            }
            if current != &top {
                bail!("Topology switch '{switch}' is not connected to the top switch");
            }
        }

        let mut level: Map<String, u32> = Map::new();
        compute_levels(&top, &children, &mut level);

        Ok(Topology {
            nodes,
            node_index,
            node_leaf,
            parent,
            children,
            leaf_nodes,
            level,
            switch_order,
        })
    }

    /// Default topology when no config file exists: one node per CPU,
    /// grouped four per leaf switch, all under one core switch.
    pub fn synthesize_default(total_cpus: u32) -> Topology {
        let num_switches = total_cpus.div_ceil(NODES_PER_DEFAULT_SWITCH).max(1);
        let mut defs = Vec::new();
        for switch in 0..num_switches {
            let first = switch * NODES_PER_DEFAULT_SWITCH + 1;
            let last = (first + NODES_PER_DEFAULT_SWITCH - 1).min(total_cpus.max(1));
            defs.push(SwitchDef {
                name: format!("switch{}", switch + 1),
                children: SwitchChildren::Nodes(
                    (first..=last).map(|i| format!("node{i}")).collect(),
                ),
            });
        }
        if num_switches > 1 {
            defs.push(SwitchDef {
                name: "core1".to_string(),
                children: SwitchChildren::Switches(
                    (1..=num_switches).map(|i| format!("switch{i}")).collect(),
                ),
            });
        }
        Topology::build(&defs).expect("Synthesized default topology is invalid")
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_names(&self) -> &[String] {
        &self.nodes
    }

    /// CPU index a node maps to: `nodeK` maps to CPU `K - 1`; names without
    /// a numeric suffix fall back to their registration ordinal.
    pub fn cpu_index(&self, node: &str) -> usize {
        let digits_at = node
            .rfind(|c: char| !c.is_ascii_digit())
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let suffix = &node[digits_at..];
        if let Ok(number) = suffix.parse::<usize>() {
            if number >= 1 {
                return number - 1;
            }
        }
        self.node_index.get(node).copied().unwrap_or(0)
    }

    /// Distance between two nodes: twice the depth of their lowest common
    /// ancestor switch, where a leaf switch has depth 1. Same node or same
    /// leaf switch gives 0.
    pub fn distance(&self, a: &str, b: &str) -> u32 {
        if a == b {
            return 0;
        }
        let (leaf_a, leaf_b) = match (self.node_leaf.get(a), self.node_leaf.get(b)) {
            (Some(a), Some(b)) => (a, b),
            _ => return u32::MAX,
        };
        if leaf_a == leaf_b {
            return 0;
        }
        let mut ancestors_a: Set<&str> = Set::new();
        let mut current = leaf_a.as_str();
        ancestors_a.insert(current);
        while let Some(up) = self.parent.get(current) {
            current = up;
            ancestors_a.insert(current);
        }
        let mut current = leaf_b.as_str();
        loop {
            if ancestors_a.contains(current) {
                let level = self.level.get(current).copied().unwrap_or(1);
                return 2 * (level - 1);
            }
            match self.parent.get(current) {
                Some(up) => current = up,
                None => return u32::MAX,
            }
        }
    }

    /// Selects `count` nodes from the free set, minimizing the maximum
    /// pairwise distance: a single leaf switch when one has enough free
    /// nodes, greedy minimax across switches otherwise.
    pub fn select_nodes(&self, count: usize, used: &Set<String>) -> Option<Vec<String>> {
        if count == 0 {
            return Some(Vec::new());
        }

        let mut free_per_leaf: Vec<(&String, Vec<&String>)> = Vec::new();
        let mut total_free = 0;
        for switch in &self.switch_order {
            let Some(leaf_nodes) = self.leaf_nodes.get(switch) else {
                continue;
            };
            let free: Vec<&String> =
                leaf_nodes.iter().filter(|n| !used.contains(*n)).collect();
            total_free += free.len();
            if !free.is_empty() {
                free_per_leaf.push((switch, free));
            }
        }
        if total_free < count {
            return None;
        }

        // Leaf with the most free nodes first, ties by switch name.
        free_per_leaf.sort_by(|(name_a, free_a), (name_b, free_b)| {
            free_b.len().cmp(&free_a.len()).then(name_a.cmp(name_b))
        });
        let (_, seed) = &free_per_leaf[0];
        if seed.len() >= count {
            let mut chosen: Vec<String> =
                seed.iter().take(count).map(|n| n.to_string()).collect();
            chosen.sort_by_key(|n| self.node_index[n]);
            return Some(chosen);
        }

        let mut chosen: Vec<String> = seed.iter().map(|n| n.to_string()).collect();
        let mut remaining: Vec<&String> = free_per_leaf[1..]
            .iter()
            .flat_map(|(_, free)| free.iter().copied())
            .collect();
        remaining.sort();

        let mut current_max = max_pairwise(self, &chosen);
        while chosen.len() < count {
            let mut best: Option<(u32, u32, usize)> = None;
            for (index, candidate) in remaining.iter().enumerate() {
                let mut candidate_max = 0;
                let mut candidate_total = 0;
                for node in &chosen {
                    let d = self.distance(candidate, node);
                    candidate_max = candidate_max.max(d);
                    candidate_total += d;
                }
                let resulting_max = current_max.max(candidate_max);
                let better = match best {
                    None => true,
                    Some((best_max, best_total, best_index)) => {
                        (resulting_max, candidate_total, remaining[index].as_str())
                            < (best_max, best_total, remaining[best_index].as_str())
                    }
                };
                if better {
                    best = Some((resulting_max, candidate_total, index));
                }
            }
            let (resulting_max, _, index) = best?;
            chosen.push(remaining.remove(index).clone());
            current_max = resulting_max;
        }

        chosen.sort_by_key(|n| self.node_index[n]);
        Some(chosen)
    }

    /// Re-emits the tree in the config format; parsing the result yields an
    /// equivalent topology.
    pub fn emit_config(&self) -> String {
        let mut out = String::from("TopologyPlugin=topology/tree\n");
        for switch in &self.switch_order {
            if let Some(nodes) = self.leaf_nodes.get(switch) {
                out.push_str(&format!("SwitchName={} Nodes={}\n", switch, nodes.join(",")));
            }
            if let Some(children) = self.children.get(switch) {
                out.push_str(&format!(
                    "SwitchName={} Switches={}\n",
                    switch,
                    children.join(",")
                ));
            }
        }
        out
    }

    pub fn leaf_of(&self, node: &str) -> Option<&str> {
        self.node_leaf.get(node).map(|s| s.as_str())
    }
}

fn compute_levels(switch: &str, children: &Map<String, Vec<String>>, level: &mut Map<String, u32>) {
    let value = match children.get(switch) {
        Some(kids) => {
            let mut deepest = 0;
            for child in kids {
                compute_levels(child, children, level);
                deepest = deepest.max(level[child]);
            }
            deepest + 1
        }
        None => 1,
    };
    level.insert(switch.to_string(), value);
}

fn max_pairwise(topology: &Topology, nodes: &[String]) -> u32 {
    let mut result = 0;
    for (index, a) in nodes.iter().enumerate() {
        for b in &nodes[index + 1..] {
            result = result.max(topology.distance(a, b));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::Topology;
    use crate::topology::parser::parse_topology_config;
    use crate::Set;

    fn two_level() -> Topology {
        let config = parse_topology_config(
            "SwitchName=switch1 Nodes=node[1-4]\n\
             SwitchName=switch2 Nodes=node[5-8]\n\
             SwitchName=core Switches=switch[1-2]\n",
        )
        .unwrap();
        Topology::build(&config.switches).unwrap()
    }

    fn three_level() -> Topology {
        let config = parse_topology_config(
            "SwitchName=switch1 Nodes=node[1-2]\n\
             SwitchName=switch2 Nodes=node[3-4]\n\
             SwitchName=switch3 Nodes=node[5-6]\n\
             SwitchName=switch4 Nodes=node[7-8]\n\
             SwitchName=agg1 Switches=switch[1-2]\n\
             SwitchName=agg2 Switches=switch[3-4]\n\
             SwitchName=core Switches=agg[1-2]\n",
        )
        .unwrap();
        Topology::build(&config.switches).unwrap()
    }

    #[test]
    fn test_distance_same_node_and_leaf() {
        let topology = two_level();
        assert_eq!(topology.distance("node1", "node1"), 0);
        assert_eq!(topology.distance("node1", "node4"), 0);
    }

    #[test]
    fn test_distance_across_switches() {
        let topology = two_level();
        assert_eq!(topology.distance("node1", "node5"), 2);

        let topology = three_level();
        assert_eq!(topology.distance("node1", "node3"), 2);
        assert_eq!(topology.distance("node1", "node7"), 4);
    }

    #[test]
    fn test_single_top_switch_required() {
        let config = parse_topology_config(
            "SwitchName=switch1 Nodes=node[1-2]\nSwitchName=switch2 Nodes=node[3-4]\n",
        )
        .unwrap();
        assert!(Topology::build(&config.switches).is_err());
    }

    #[test]
    fn test_duplicate_parent_rejected() {
        let config = parse_topology_config(
            "SwitchName=switch1 Nodes=node[1-2]\n\
             SwitchName=core1 Switches=switch1\n\
             SwitchName=core2 Switches=switch1,core1\n",
        )
        .unwrap();
        assert!(Topology::build(&config.switches).is_err());
    }

    #[test]
    fn test_select_prefers_single_leaf() {
        let topology = two_level();
        let nodes = topology.select_nodes(4, &Set::new()).unwrap();
        assert_eq!(nodes, vec!["node1", "node2", "node3", "node4"]);
    }

    #[test]
    fn test_select_prefers_leaf_with_most_free() {
        let topology = two_level();
        let used: Set<String> = ["node1", "node2"].iter().map(|s| s.to_string()).collect();
        let nodes = topology.select_nodes(2, &used).unwrap();
        // switch2 is fully free, switch1 only half.
        assert_eq!(nodes, vec!["node5", "node6"]);
    }

    #[test]
    fn test_select_spills_to_closest_switch() {
        let topology = two_level();
        let used: Set<String> = ["node1"].iter().map(|s| s.to_string()).collect();
        let nodes = topology.select_nodes(5, &used).unwrap();
        // No leaf has five free nodes: seed switch2 (4 free), add the
        // name-smallest spill node from switch1.
        assert_eq!(nodes, vec!["node2", "node5", "node6", "node7", "node8"]);
    }

    #[test]
    fn test_select_minimax_on_three_levels() {
        let topology = three_level();
        // Nodes 1,2 free under agg1; switch3 full free under agg2. Asking
        // for 3 must keep the spill within one aggregation switch.
        let used: Set<String> = ["node3", "node4", "node7", "node8"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let nodes = topology.select_nodes(3, &used).unwrap();
        assert_eq!(nodes, vec!["node1", "node2", "node5"]);
        // max distance is 4 (cross-agg) only because nothing closer exists
        let max = nodes
            .iter()
            .flat_map(|a| nodes.iter().map(|b| topology.distance(a, b)))
            .max()
            .unwrap();
        assert_eq!(max, 4);
    }

    #[test]
    fn test_select_insufficient_nodes() {
        let topology = two_level();
        assert!(topology.select_nodes(9, &Set::new()).is_none());
        let used: Set<String> = topology
            .node_names()
            .iter()
            .take(6)
            .cloned()
            .collect();
        assert!(topology.select_nodes(3, &used).is_none());
    }

    #[test]
    fn test_emit_round_trip() {
        let topology = three_level();
        let emitted = topology.emit_config();
        let reparsed = Topology::build(
            &parse_topology_config(&emitted).unwrap().switches,
        )
        .unwrap();
        assert_eq!(reparsed.node_count(), topology.node_count());
        for a in topology.node_names() {
            assert_eq!(reparsed.leaf_of(a), topology.leaf_of(a));
            for b in topology.node_names() {
                assert_eq!(reparsed.distance(a, b), topology.distance(a, b));
            }
        }
    }

    #[test]
    fn test_synthesized_default() {
        let topology = Topology::synthesize_default(8);
        assert_eq!(topology.node_count(), 8);
        assert_eq!(topology.leaf_of("node1"), Some("switch1"));
        assert_eq!(topology.leaf_of("node5"), Some("switch2"));
        assert_eq!(topology.distance("node1", "node2"), 0);
        assert_eq!(topology.distance("node1", "node5"), 2);
        assert_eq!(topology.cpu_index("node1"), 0);
        assert_eq!(topology.cpu_index("node8"), 7);

        // A small host fits under a single leaf switch.
        let topology = Topology::synthesize_default(3);
        assert_eq!(topology.node_count(), 3);
        assert_eq!(topology.distance("node1", "node3"), 0);
    }
}
