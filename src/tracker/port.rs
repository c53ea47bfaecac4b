//! Port bookkeeping and connection graph.
//!
//! Ports are kept per module in declaration order. Data connections run
//! from an output to an input; parameter ports connect to each other in
//! either direction.

use std::collections::{BTreeSet, HashMap, HashSet};

use bitflags::bitflags;

use crate::id::Id;
use crate::message::{Link, PortInfo, PortKind};

bitflags! {
    /// Behavior modifiers of a port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PortFlags: u32 {
        /// An input accepting more than one upstream connection.
        const COMBINE = 1 << 0;
        /// Objects arriving here do not trigger compute.
        const NO_COMPUTE = 1 << 1;
    }
}

/// A port and the endpoints it is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub module: Id,
    pub name: String,
    pub kind: PortKind,
    pub flags: PortFlags,
    pub description: String,
    connections: BTreeSet<(Id, String)>,
}

impl Port {
    pub fn new(module: Id, name: impl Into<String>, kind: PortKind, flags: PortFlags) -> Self {
        Self {
            module,
            name: name.into(),
            kind,
            flags,
            description: String::new(),
            connections: BTreeSet::new(),
        }
    }

    pub fn from_info(info: &PortInfo) -> Self {
        let mut port = Self::new(
            info.module,
            info.name.clone(),
            info.kind,
            PortFlags::from_bits_truncate(info.flags),
        );
        port.description = info.description.clone();
        port
    }

    pub fn info(&self) -> PortInfo {
        PortInfo {
            module: self.module,
            name: self.name.clone(),
            kind: self.kind,
            flags: self.flags.bits(),
            description: self.description.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }

    /// Connected endpoints as `(module, port)` pairs.
    pub fn connections(&self) -> impl Iterator<Item = &(Id, String)> {
        self.connections.iter()
    }
}

/// Outcome of [`PortTracker::add_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Added,
    /// Already present.
    Exists,
    /// Kinds cannot be connected or the input is occupied; dropped.
    Rejected,
    /// One of the ports is not known yet.
    Missing,
}

/// Outcome of [`PortTracker::remove_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnection {
    Removed,
    NotConnected,
    Missing,
}

#[derive(Debug, Default, Clone)]
pub struct PortTracker {
    ports: HashMap<Id, Vec<Port>>,
}

impl PortTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port; returns `false` if the module already has one of that
    /// name.
    pub fn add_port(&mut self, port: Port) -> bool {
        let list = self.ports.entry(port.module).or_default();
        if list.iter().any(|p| p.name == port.name) {
            tracing::warn!("duplicate port {}:{}", port.module, port.name);
            return false;
        }
        list.push(port);
        true
    }

    /// Remove a port and every connection it had. Returns the implied
    /// disconnections, or `None` if the port is unknown.
    pub fn remove_port(&mut self, module: Id, name: &str) -> Option<Vec<Link>> {
        let links = self.disconnect_all(module, name)?;
        if let Some(list) = self.ports.get_mut(&module) {
            list.retain(|p| p.name != name);
        }
        Some(links)
    }

    pub fn port(&self, module: Id, name: &str) -> Option<&Port> {
        self.ports.get(&module)?.iter().find(|p| p.name == name)
    }

    fn port_mut(&mut self, module: Id, name: &str) -> Option<&mut Port> {
        self.ports.get_mut(&module)?.iter_mut().find(|p| p.name == name)
    }

    /// All ports of `module` in declaration order.
    pub fn ports(&self, module: Id) -> &[Port] {
        self.ports.get(&module).map_or(&[], Vec::as_slice)
    }

    pub fn ports_of_kind(&self, module: Id, kind: PortKind) -> impl Iterator<Item = &Port> {
        self.ports(module).iter().filter(move |p| p.kind == kind)
    }

    pub fn modules(&self) -> impl Iterator<Item = Id> + '_ {
        self.ports.keys().copied()
    }

    pub fn add_connection(&mut self, a: Id, port_a: &str, b: Id, port_b: &str) -> Connection {
        let (kind_a, kind_b, b_connected, b_combines) = match (self.port(a, port_a), self.port(b, port_b)) {
            (Some(pa), Some(pb)) => (
                pa.kind,
                pb.kind,
                pb.is_connected(),
                pb.flags.contains(PortFlags::COMBINE),
            ),
            _ => return Connection::Missing,
        };

        match (kind_a, kind_b) {
            (PortKind::Output, PortKind::Input) | (PortKind::Parameter, PortKind::Parameter) => {}
            _ => {
                tracing::warn!(
                    "incompatible port kinds: {}:{} ({:?}) -> {}:{} ({:?})",
                    a,
                    port_a,
                    kind_a,
                    b,
                    port_b,
                    kind_b
                );
                return Connection::Rejected;
            }
        }

        let key_b = (b, port_b.to_string());
        if self
            .port(a, port_a)
            .is_some_and(|p| p.connections.contains(&key_b))
        {
            return Connection::Exists;
        }

        if kind_b == PortKind::Input && b_connected && !b_combines {
            tracing::debug!("input {}:{} is already connected", b, port_b);
            return Connection::Rejected;
        }

        if let Some(pa) = self.port_mut(a, port_a) {
            pa.connections.insert(key_b);
        }
        if let Some(pb) = self.port_mut(b, port_b) {
            pb.connections.insert((a, port_a.to_string()));
        }
        Connection::Added
    }

    pub fn remove_connection(&mut self, a: Id, port_a: &str, b: Id, port_b: &str) -> Disconnection {
        if self.port(a, port_a).is_none() || self.port(b, port_b).is_none() {
            return Disconnection::Missing;
        }
        let removed_a = self
            .port_mut(a, port_a)
            .is_some_and(|p| p.connections.remove(&(b, port_b.to_string())));
        let removed_b = self
            .port_mut(b, port_b)
            .is_some_and(|p| p.connections.remove(&(a, port_a.to_string())));
        if removed_a != removed_b {
            tracing::error!(
                "inconsistent connection state between {}:{} and {}:{}",
                a,
                port_a,
                b,
                port_b
            );
            debug_assert_eq!(removed_a, removed_b);
        }
        if removed_a || removed_b {
            Disconnection::Removed
        } else {
            Disconnection::NotConnected
        }
    }

    fn disconnect_all(&mut self, module: Id, name: &str) -> Option<Vec<Link>> {
        let port = self.port(module, name)?;
        let kind = port.kind;
        let others: Vec<(Id, String)> = port.connections.iter().cloned().collect();
        let mut links = Vec::with_capacity(others.len());
        for (other, other_port) in others {
            let link = if kind == PortKind::Input {
                Link {
                    module_a: other,
                    port_a: other_port,
                    module_b: module,
                    port_b: name.to_string(),
                }
            } else {
                Link {
                    module_a: module,
                    port_a: name.to_string(),
                    module_b: other,
                    port_b: other_port,
                }
            };
            if self.remove_connection(link.module_a, &link.port_a, link.module_b, &link.port_b)
                == Disconnection::Removed
            {
                links.push(link);
            }
        }
        Some(links)
    }

    /// Drop all ports of `module`; returns the disconnections this implies.
    pub fn remove_module(&mut self, module: Id) -> Vec<Link> {
        let names: Vec<String> = self.ports(module).iter().map(|p| p.name.clone()).collect();
        let mut links = Vec::new();
        for name in names {
            if let Some(mut l) = self.disconnect_all(module, &name) {
                links.append(&mut l);
            }
        }
        self.ports.remove(&module);
        links
    }

    /// Every connection once: data links from the output side, parameter
    /// links from the lexically smaller endpoint.
    pub fn connections(&self) -> Vec<Link> {
        let mut modules: Vec<Id> = self.ports.keys().copied().collect();
        modules.sort();
        let mut links = Vec::new();
        for module in modules {
            for port in self.ports(module) {
                for (other, other_port) in &port.connections {
                    let emit = match port.kind {
                        PortKind::Output => true,
                        PortKind::Parameter => (module, &port.name) < (*other, other_port),
                        _ => false,
                    };
                    if emit {
                        links.push(Link {
                            module_a: module,
                            port_a: port.name.clone(),
                            module_b: *other,
                            port_b: other_port.clone(),
                        });
                    }
                }
            }
        }
        links
    }

    /// Modules fed by the outputs of `module`.
    pub fn downstream(&self, module: Id) -> HashSet<Id> {
        self.ports_of_kind(module, PortKind::Output)
            .flat_map(|p| p.connections.iter().map(|(m, _)| *m))
            .collect()
    }

    /// Modules feeding the inputs of `module`; restricted to `port` if given.
    pub fn upstream(&self, module: Id, port: Option<&str>) -> HashSet<Id> {
        self.ports_of_kind(module, PortKind::Input)
            .filter(|p| port.map_or(true, |n| p.name == n))
            .flat_map(|p| p.connections.iter().map(|(m, _)| *m))
            .collect()
    }

    /// Graph height of every module in `modules`: sinks are 0, all others
    /// one more than their lowest downstream neighbor. Modules on a cycle
    /// without a path to a sink get no entry.
    pub fn compute_heights(&self, modules: &[Id]) -> HashMap<Id, i32> {
        let known: HashSet<Id> = modules.iter().copied().collect();
        let mut heights: HashMap<Id, i32> = HashMap::new();
        let mut pending: Vec<Id> = modules.to_vec();

        loop {
            let mut progressed = false;
            pending.retain(|m| {
                let down: Vec<Id> = self
                    .downstream(*m)
                    .into_iter()
                    .filter(|d| known.contains(d))
                    .collect();
                let height = if down.is_empty() {
                    Some(0)
                } else {
                    down.iter().filter_map(|d| heights.get(d)).min().map(|h| h + 1)
                };
                match height {
                    Some(h) => {
                        heights.insert(*m, h);
                        progressed = true;
                        false
                    }
                    None => true,
                }
            });
            if pending.is_empty() || !progressed {
                break;
            }
        }
        heights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PortTracker {
        let mut t = PortTracker::new();
        t.add_port(Port::new(Id(1), "data_out", PortKind::Output, PortFlags::empty()));
        t.add_port(Port::new(Id(2), "data_in", PortKind::Input, PortFlags::empty()));
        t.add_port(Port::new(Id(2), "data_out", PortKind::Output, PortFlags::empty()));
        t.add_port(Port::new(Id(3), "data_in", PortKind::Input, PortFlags::COMBINE));
        t
    }

    #[test]
    fn test_ports_keep_order() {
        let t = tracker();
        let names: Vec<_> = t.ports(Id(2)).iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["data_in", "data_out"]);
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut t = tracker();
        assert!(!t.add_port(Port::new(Id(1), "data_out", PortKind::Output, PortFlags::empty())));
    }

    #[test]
    fn test_connect_rules() {
        let mut t = tracker();
        assert_eq!(t.add_connection(Id(1), "data_out", Id(2), "data_in"), Connection::Added);
        assert_eq!(t.add_connection(Id(1), "data_out", Id(2), "data_in"), Connection::Exists);
        // input occupied, no combine flag
        t.add_port(Port::new(Id(4), "data_out", PortKind::Output, PortFlags::empty()));
        assert_eq!(t.add_connection(Id(4), "data_out", Id(2), "data_in"), Connection::Rejected);
        // combine input accepts several
        assert_eq!(t.add_connection(Id(1), "data_out", Id(3), "data_in"), Connection::Added);
        assert_eq!(t.add_connection(Id(2), "data_out", Id(3), "data_in"), Connection::Added);
        // wrong direction
        assert_eq!(t.add_connection(Id(2), "data_in", Id(1), "data_out"), Connection::Rejected);
        assert_eq!(t.add_connection(Id(9), "x", Id(2), "data_in"), Connection::Missing);
    }

    #[test]
    fn test_reversed_duplicate_is_rejected() {
        let mut t = tracker();
        assert_eq!(t.add_connection(Id(1), "data_out", Id(2), "data_in"), Connection::Added);
        assert_eq!(t.add_connection(Id(2), "data_in", Id(1), "data_out"), Connection::Rejected);
        assert_eq!(t.connections().len(), 1);
    }

    #[test]
    fn test_parameter_links() {
        let mut t = PortTracker::new();
        t.add_port(Port::new(Id(1), "iso", PortKind::Parameter, PortFlags::empty()));
        t.add_port(Port::new(Id(2), "iso", PortKind::Parameter, PortFlags::empty()));
        assert_eq!(t.add_connection(Id(2), "iso", Id(1), "iso"), Connection::Added);
        let links = t.connections();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].module_a, Id(1));
        assert_eq!(t.add_connection(Id(1), "iso", Id(2), "iso"), Connection::Exists);
    }

    #[test]
    fn test_remove_module_cascades() {
        let mut t = tracker();
        t.add_connection(Id(1), "data_out", Id(2), "data_in");
        t.add_connection(Id(2), "data_out", Id(3), "data_in");
        let links = t.remove_module(Id(2));
        assert_eq!(links.len(), 2);
        assert!(links.contains(&Link {
            module_a: Id(1),
            port_a: "data_out".into(),
            module_b: Id(2),
            port_b: "data_in".into(),
        }));
        assert!(!t.port(Id(1), "data_out").unwrap().is_connected());
        assert!(!t.port(Id(3), "data_in").unwrap().is_connected());
        assert!(t.connections().is_empty());
    }

    #[test]
    fn test_remove_connection() {
        let mut t = tracker();
        t.add_connection(Id(1), "data_out", Id(2), "data_in");
        assert_eq!(
            t.remove_connection(Id(1), "data_out", Id(2), "data_in"),
            Disconnection::Removed
        );
        assert_eq!(
            t.remove_connection(Id(1), "data_out", Id(2), "data_in"),
            Disconnection::NotConnected
        );
        assert_eq!(
            t.remove_connection(Id(1), "nope", Id(2), "data_in"),
            Disconnection::Missing
        );
    }

    #[test]
    fn test_heights() {
        let mut t = tracker();
        t.add_connection(Id(1), "data_out", Id(2), "data_in");
        t.add_connection(Id(2), "data_out", Id(3), "data_in");
        t.add_connection(Id(1), "data_out", Id(3), "data_in");
        let h = t.compute_heights(&[Id(1), Id(2), Id(3)]);
        assert_eq!(h[&Id(3)], 0);
        assert_eq!(h[&Id(2)], 1);
        assert_eq!(h[&Id(1)], 1);
    }

    #[test]
    fn test_upstream_downstream() {
        let mut t = tracker();
        t.add_connection(Id(1), "data_out", Id(2), "data_in");
        assert!(t.downstream(Id(1)).contains(&Id(2)));
        assert!(t.upstream(Id(2), Some("data_in")).contains(&Id(1)));
        assert!(t.upstream(Id(2), Some("other")).is_empty());
    }
}
