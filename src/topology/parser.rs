use anyhow::{anyhow, Context};
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, space1};
use nom::combinator::{map, map_res, opt};
use nom::multi::separated_list1;
use nom::sequence::{delimited, preceded, separated_pair, tuple};
use nom_supreme::tag::complete::tag;
use nom_supreme::ParserExt;

use crate::common::parser::{consume_all, p_u32, NomResult};

/// One `SwitchName=` line of the topology config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchDef {
    pub name: String,
    pub children: SwitchChildren,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchChildren {
    Nodes(Vec<String>),
    Switches(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub enabled: bool,
    pub switches: Vec<SwitchDef>,
}

fn p_name(input: &str) -> NomResult<String> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
        |name: &str| name.to_string(),
    )(input)
}

/// A list item: a plain name or a `prefix[a-b]` range, expanded inclusively.
fn p_list_item(input: &str) -> NomResult<Vec<String>> {
    map_res(
        tuple((
            p_name,
            opt(delimited(
                char('['),
                separated_pair(p_u32, char('-'), p_u32),
                char(']'),
            )),
        )),
        |(prefix, range)| match range {
            None => Ok(vec![prefix]),
            Some((start, end)) if start <= end => {
                Ok((start..=end).map(|i| format!("{prefix}{i}")).collect())
            }
            Some((start, end)) => Err(anyhow!("Invalid range {start}-{end}")),
        },
    )(input)
}

fn p_name_list(input: &str) -> NomResult<Vec<String>> {
    map(separated_list1(char(','), p_list_item), |items| {
        items.concat()
    })(input)
}

fn p_switch_line(input: &str) -> NomResult<SwitchDef> {
    map(
        tuple((
            preceded(tag("SwitchName="), p_name),
            space1,
            alt((
                map(
                    preceded(tag("Nodes="), p_name_list),
                    SwitchChildren::Nodes,
                ),
                map(
                    preceded(tag("Switches="), p_name_list),
                    SwitchChildren::Switches,
                ),
            ))
            .context("Nodes=<list> or Switches=<list>"),
        )),
        |(name, _, children)| SwitchDef { name, children },
    )(input)
}

fn plugin_enables_topology(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "topology/tree" | "topology" | "yes" | "1" | "true"
    )
}

/// Parses the line-oriented topology config. `#` lines and blank lines are
/// skipped; any other unrecognized line is an error.
pub fn parse_topology_config(text: &str) -> anyhow::Result<TopologyConfig> {
    let mut enabled = true;
    let mut switches = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(value) = line.strip_prefix("TopologyPlugin=") {
            enabled = plugin_enables_topology(value);
        } else if line.starts_with("SwitchName=") {
            let def = consume_all(p_switch_line, line)
                .with_context(|| format!("Topology config line {}: '{}'", index + 1, line))?;
            switches.push(def);
        } else {
            return Err(anyhow!(
                "Topology config line {}: unrecognized directive '{}'",
                index + 1,
                line
            ));
        }
    }

    Ok(TopologyConfig { enabled, switches })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(def: &SwitchDef) -> &[String] {
        match &def.children {
            SwitchChildren::Nodes(nodes) => nodes,
            SwitchChildren::Switches(_) => panic!("expected node children"),
        }
    }

    #[test]
    fn test_parse_plain_list() {
        let config = parse_topology_config("SwitchName=sw1 Nodes=node1,node2,node3").unwrap();
        assert!(config.enabled);
        assert_eq!(nodes(&config.switches[0]), &["node1", "node2", "node3"]);
    }

    #[test]
    fn test_parse_range() {
        let config = parse_topology_config("SwitchName=sw1 Nodes=node[1-4]").unwrap();
        assert_eq!(
            nodes(&config.switches[0]),
            &["node1", "node2", "node3", "node4"]
        );
    }

    #[test]
    fn test_parse_single_element_range() {
        let config = parse_topology_config("SwitchName=sw1 Nodes=node[7-7]").unwrap();
        assert_eq!(nodes(&config.switches[0]), &["node7"]);
    }

    #[test]
    fn test_parse_mixed_list() {
        let config =
            parse_topology_config("SwitchName=sw1 Nodes=head,node[2-3],tail").unwrap();
        assert_eq!(
            nodes(&config.switches[0]),
            &["head", "node2", "node3", "tail"]
        );
    }

    #[test]
    fn test_parse_switches_line() {
        let config = parse_topology_config("SwitchName=core Switches=switch[1-2]").unwrap();
        assert_eq!(
            config.switches[0].children,
            SwitchChildren::Switches(vec!["switch1".to_string(), "switch2".to_string()])
        );
    }

    #[test]
    fn test_parse_comments_and_blank_lines() {
        let text = "# cluster topology\n\nTopologyPlugin=topology/tree\nSwitchName=sw1 Nodes=node[1-2]\n";
        let config = parse_topology_config(text).unwrap();
        assert!(config.enabled);
        assert_eq!(config.switches.len(), 1);
    }

    #[test]
    fn test_plugin_disables_topology() {
        let config = parse_topology_config("TopologyPlugin=off").unwrap();
        assert!(!config.enabled);
        for value in ["topology/tree", "topology", "yes", "1", "true", "TRUE"] {
            let config =
                parse_topology_config(&format!("TopologyPlugin={value}")).unwrap();
            assert!(config.enabled, "{value} should enable topology");
        }
    }

    #[test]
    fn test_parse_reversed_range_fails() {
        assert!(parse_topology_config("SwitchName=sw1 Nodes=node[4-1]").is_err());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_topology_config("NodeName=node1").is_err());
        assert!(parse_topology_config("SwitchName=sw1 Hosts=a,b").is_err());
        assert!(parse_topology_config("SwitchName=sw1 Nodes=").is_err());
    }
}
