use crate::error::{Error, Result};

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub hostname: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(hostname: &str, port: u16) -> NodeInfo {
        NodeInfo {
            hostname: hostname.to_string(),
            port: port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct Group {
    pub name: String,
    pub nodes: Vec<NodeInfo>,
}

/// Cluster topology parsed from a descriptor directory: one file per
/// group, one `hostname:port` per line. Both orders participate in
/// placement, so files are read in filename order and lines in file
/// order. Immutable after load.
#[derive(Clone, Debug)]
pub struct NetworkTopology {
    groups: Vec<Group>,
}

// short name comparison, tolerant of fqdn vs short hostnames;
// address literals only match exactly
fn hosts_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }

    if a.parse::<std::net::IpAddr>().is_ok()
            || b.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }

    let short_a = a.split('.').next().unwrap_or(a);
    let short_b = b.split('.').next().unwrap_or(b);
    short_a == short_b
}

impl NetworkTopology {
    pub fn new(groups: Vec<Group>) -> NetworkTopology {
        NetworkTopology {
            groups: groups,
        }
    }

    pub fn load(directory: &Path) -> Result<NetworkTopology> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            let name = path.file_name()
                .map(|x| x.to_string_lossy().to_string())
                .unwrap_or_default();

            if path.is_file() && !name.starts_with('.') {
                paths.push((name, path));
            }
        }

        paths.sort();

        let mut groups = Vec::new();
        for (name, path) in paths {
            let mut nodes = Vec::new();
            for line in BufReader::new(File::open(&path)?).lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                nodes.push(parse_node(line)?);
            }

            groups.push(Group {
                name: name,
                nodes: nodes,
            });
        }

        Ok(NetworkTopology {
            groups: groups,
        })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn all_nodes(&self) -> Vec<&NodeInfo> {
        self.groups.iter()
            .flat_map(|group| group.nodes.iter())
            .collect()
    }

    pub fn group_of(&self, node: &NodeInfo) -> Option<&Group> {
        self.groups.iter().find(|group| group.nodes.iter()
            .any(|x| x.port == node.port
                && hosts_match(&x.hostname, &node.hostname)))
    }

    pub fn contains_host(&self, hostname: &str) -> bool {
        self.groups.iter()
            .flat_map(|group| group.nodes.iter())
            .any(|node| hosts_match(&node.hostname, hostname))
    }
}

fn parse_node(line: &str) -> Result<NodeInfo> {
    let index = match line.rfind(':') {
        Some(index) => index,
        None => return Err(Error::Validation(format!(
            "malformed node entry '{}'", line))),
    };

    let port = line[index + 1..].parse::<u16>()
        .map_err(|_| Error::Validation(format!(
            "malformed port in '{}'", line)))?;

    Ok(NodeInfo::new(&line[..index], port))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn write_group(directory: &Path, name: &str, lines: &[&str]) {
        let mut file =
            File::create(directory.join(name)).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }

    #[test]
    fn load_sorted_groups() {
        let directory = tempfile::tempdir().unwrap();
        write_group(directory.path(), "beta",
            &["node3:15606", "", "node4:15606"]);
        write_group(directory.path(), "alpha",
            &["# primary group", "node1:15606", "node2:15606"]);

        let topology =
            NetworkTopology::load(directory.path()).unwrap();
        let groups = topology.groups();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "alpha");
        assert_eq!(groups[0].nodes, vec!(
            NodeInfo::new("node1", 15606),
            NodeInfo::new("node2", 15606),
        ));
        assert_eq!(groups[1].nodes.len(), 2);
        assert_eq!(topology.all_nodes().len(), 4);
    }

    #[test]
    fn host_matching_tolerates_fqdn() {
        let topology = NetworkTopology::new(vec!(Group {
            name: "alpha".to_string(),
            nodes: vec!(NodeInfo::new("node1.cluster.local", 15606)),
        }));

        assert!(topology.contains_host("node1"));
        assert!(topology.contains_host("node1.cluster.local"));
        assert!(!topology.contains_host("node2"));

        let group = topology.group_of(&NodeInfo::new("node1", 15606));
        assert_eq!(group.unwrap().name, "alpha");
    }

    #[test]
    fn address_literals_match_exactly() {
        let topology = NetworkTopology::new(vec!(Group {
            name: "alpha".to_string(),
            nodes: vec!(NodeInfo::new("127.0.0.2", 15606)),
        }));

        assert!(topology.contains_host("127.0.0.2"));
        assert!(!topology.contains_host("127.0.0.3"));
    }

    #[test]
    fn malformed_entry_rejected() {
        match parse_node("node1") {
            Err(Error::Validation(_)) => {},
            x => panic!("expected Validation error, found {:?}",
                x.map(|_| ())),
        }

        match parse_node("node1:notaport") {
            Err(Error::Validation(_)) => {},
            x => panic!("expected Validation error, found {:?}",
                x.map(|_| ())),
        }
    }
}
