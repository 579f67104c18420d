//! Discovery of the firmware's audio graph from guest memory.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use emu_core::bus::Bus;

use crate::layout::{ConnectionLayout, StreamLayout};

/// One DSP node discovered in the firmware's update list.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    /// Position in the firmware's update order; total tie-breaking order
    /// for readiness.
    pub index: usize,
    /// Guest `this` pointer of the stream object.
    pub this_ptr: u32,
    /// Update entry point (first vtable slot).
    pub update_func: u32,
    /// Incoming connections as `(source ptr, source output index)`.
    pub inputs: BTreeSet<(u32, u32)>,
    /// Outgoing connections as `(destination ptr, destination input index)`.
    pub outputs: BTreeSet<(u32, u32)>,
    /// Nodes this one may unblock on completion (forward edges only).
    pub successors: BTreeSet<u32>,
}

/// The discovered graph: stable for the life of the firmware run.
#[derive(Debug, Default)]
pub struct Graph {
    /// Node pointers in index order.
    pub pipelines: Vec<u32>,
    pub map: BTreeMap<u32, Pipeline>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// True when every *forward* input of `node` is marked finished.
    /// Back-edge inputs (index not smaller than the node's) are exempt by
    /// contract: the firmware's own update order runs them after the node.
    pub fn forward_inputs_finished(&self, node: &Pipeline, finished_flag: &[bool]) -> bool {
        node.inputs.iter().all(|(src, _)| {
            self.map.get(src).is_none_or(|src_node| {
                src_node.index >= node.index
                    || finished_flag.get(src_node.index).copied().unwrap_or(true)
            })
        })
    }

    /// Walk the firmware's intrusive update list and build the graph.
    ///
    /// `first_node` is the head pointer (the value of the firmware's
    /// `first_update` variable). Inactive nodes (active byte zero) are
    /// skipped entirely. Each node's layout is probed per the configured
    /// discriminator: the alternate arrangement applies when the classic
    /// destination slot reads zero and the alternate slot does not.
    pub fn discover(
        bus: &Bus,
        first_node: u32,
        stream: &StreamLayout,
        connection: &ConnectionLayout,
    ) -> Self {
        let mut graph = Graph::default();
        let mut edges: Vec<(u32, u32, u32, u32)> = Vec::new();

        let mut node = first_node;
        let mut index = 0usize;
        while node != 0 {
            let active = bus.read8(node + stream.active) != 0;
            if !active {
                debug!(node = format_args!("{node:#010x}"), "skipping inactive stream");
                node = bus.read32(node + stream.next_update);
                continue;
            }

            let vtable = bus.read32(node);
            let update_func = bus.read32(vtable);

            let classic = bus.read32(node + stream.dest_classic);
            let alternate = bus.read32(node + stream.dest_alt);
            let dest_head = if classic == 0 && alternate != 0 {
                alternate
            } else {
                classic
            };

            let mut conn = dest_head;
            while conn != 0 {
                let src = bus.read32(conn + connection.src);
                let dst = bus.read32(conn + connection.dst);
                let src_index = u32::from(bus.read8(conn + connection.src_index));
                let dst_index = u32::from(bus.read8(conn + connection.dst_index));
                edges.push((src, src_index, dst, dst_index));
                conn = bus.read32(conn + connection.next);
            }

            graph.map.insert(
                node,
                Pipeline {
                    index,
                    this_ptr: node,
                    update_func,
                    ..Default::default()
                },
            );
            graph.pipelines.push(node);
            index += 1;
            node = bus.read32(node + stream.next_update);
        }

        for (src, src_index, dst, dst_index) in edges {
            if !graph.map.contains_key(&dst) {
                debug!(
                    dst = format_args!("{dst:#010x}"),
                    "connection to node outside the update list; ignored"
                );
                continue;
            }
            if let Some(source) = graph.map.get_mut(&src) {
                source.outputs.insert((dst, dst_index));
            }
            if let Some(dest) = graph.map.get_mut(&dst) {
                dest.inputs.insert((src, src_index));
            }
        }

        graph.precompute_successors();
        info!(nodes = graph.len(), "audio graph discovered");
        graph
    }

    /// For each node, keep as successors those outputs reachable purely by
    /// forward edges: every input of the destination comes from a smaller
    /// index. Back-edges are pruned here and recovered by the scheduler's
    /// index-order sweep, never turned into ordering constraints.
    fn precompute_successors(&mut self) {
        let snapshot: BTreeMap<u32, (usize, BTreeSet<(u32, u32)>)> = self
            .map
            .iter()
            .map(|(ptr, node)| (*ptr, (node.index, node.inputs.clone())))
            .collect();

        for node in self.map.values_mut() {
            for (dst, _) in node.outputs.iter() {
                let Some((dst_index, dst_inputs)) = snapshot.get(dst) else {
                    continue;
                };
                let all_forward = dst_inputs.iter().all(|(src, _)| {
                    snapshot
                        .get(src)
                        .is_none_or(|(src_index, _)| src_index < dst_index)
                });
                if all_forward {
                    node.successors.insert(*dst);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::mem::MemoryDevice;
    use std::sync::Arc;

    const RAM: u32 = 0x2000_0000;

    struct GuestGraph {
        bus: Arc<Bus>,
        next_free: u32,
    }

    impl GuestGraph {
        fn new() -> Self {
            let bus = Bus::new();
            bus.bind_device(Arc::new(MemoryDevice::new(RAM, 0x10000)))
                .expect("ram");
            Self {
                bus,
                next_free: RAM + 0x100,
            }
        }

        fn alloc(&mut self, bytes: u32) -> u32 {
            let addr = self.next_free;
            self.next_free += bytes;
            addr
        }

        /// Lay out one stream object (classic layout) with its vtable.
        fn node(&mut self, update_func: u32) -> u32 {
            let vtable = self.alloc(8);
            self.bus.write32(vtable, update_func);
            let node = self.alloc(32);
            self.bus.write32(node, vtable);
            self.bus.write8(node + 4, 1); // active
            node
        }

        fn connect(&mut self, src: u32, src_index: u32, dst: u32, dst_index: u32) {
            let conn = self.alloc(16);
            self.bus.write32(conn, src);
            self.bus.write32(conn + 4, dst);
            self.bus.write8(conn + 8, src_index as u8);
            self.bus.write8(conn + 9, dst_index as u8);
            // Push onto the source's classic destination list.
            let head = self.bus.read32(src + 8);
            self.bus.write32(conn + 12, head);
            self.bus.write32(src + 8, conn);
        }

        fn link_updates(&mut self, nodes: &[u32]) {
            for pair in nodes.windows(2) {
                self.bus.write32(pair[0] + 16, pair[1]);
            }
        }

        fn discover(&self, first: u32) -> Graph {
            Graph::discover(
                &self.bus,
                first,
                &StreamLayout::default(),
                &ConnectionLayout::default(),
            )
        }
    }

    #[test]
    fn diamond_discovery_and_successors() {
        let mut guest = GuestGraph::new();
        let a = guest.node(0x6100_0000);
        let b = guest.node(0x6100_0100);
        let c = guest.node(0x6100_0200);
        let d = guest.node(0x6100_0300);
        guest.link_updates(&[a, b, c, d]);
        guest.connect(a, 0, b, 0);
        guest.connect(a, 1, c, 0);
        guest.connect(b, 0, d, 0);
        guest.connect(c, 0, d, 1);

        let graph = guest.discover(a);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.pipelines, vec![a, b, c, d]);

        let node_a = &graph.map[&a];
        assert_eq!(node_a.index, 0);
        assert_eq!(node_a.update_func, 0x6100_0000);
        assert!(node_a.inputs.is_empty());
        assert_eq!(node_a.outputs.len(), 2);
        assert_eq!(node_a.successors, BTreeSet::from([b, c]));

        let node_d = &graph.map[&d];
        assert_eq!(node_d.inputs, BTreeSet::from([(b, 0), (c, 0)]));
        assert_eq!(graph.map[&b].successors, BTreeSet::from([d]));
        assert_eq!(graph.map[&c].successors, BTreeSet::from([d]));
    }

    #[test]
    fn inactive_nodes_are_skipped() {
        let mut guest = GuestGraph::new();
        let a = guest.node(0x6100_0000);
        let b = guest.node(0x6100_0100);
        let c = guest.node(0x6100_0200);
        guest.link_updates(&[a, b, c]);
        guest.bus.write8(b + 4, 0); // deactivate

        let graph = guest.discover(a);
        assert_eq!(graph.pipelines, vec![a, c]);
        assert_eq!(graph.map[&c].index, 1);
    }

    #[test]
    fn back_edges_are_pruned_from_successors() {
        let mut guest = GuestGraph::new();
        let a = guest.node(0x6100_0000);
        let b = guest.node(0x6100_0100);
        guest.link_updates(&[a, b]);
        guest.connect(a, 0, b, 0);
        guest.connect(b, 0, a, 0); // feedback edge

        let graph = guest.discover(a);
        // a's input from b is a back-edge, so a is not a successor of b.
        assert!(graph.map[&b].successors.is_empty());
        // b's only input is the forward edge from a.
        assert_eq!(graph.map[&a].successors, BTreeSet::from([b]));
        // The back-edge input does not gate a's readiness.
        let flags = vec![false, false];
        assert!(graph.forward_inputs_finished(&graph.map[&a], &flags));
        assert!(!graph.forward_inputs_finished(&graph.map[&b], &flags));
    }

    #[test]
    fn alternate_layout_is_detected_per_node() {
        let mut guest = GuestGraph::new();
        let a = guest.node(0x6100_0000);
        let b = guest.node(0x6100_0100);
        guest.link_updates(&[a, b]);

        // Hand-build a connection on the alternate slot of `a`.
        let conn = guest.alloc(16);
        guest.bus.write32(conn, a);
        guest.bus.write32(conn + 4, b);
        guest.bus.write8(conn + 8, 0);
        guest.bus.write8(conn + 9, 2);
        guest.bus.write32(conn + 12, 0);
        guest.bus.write32(a + 12, conn); // alt slot; classic stays zero

        let graph = guest.discover(a);
        assert_eq!(graph.map[&a].outputs, BTreeSet::from([(b, 2)]));
        assert_eq!(graph.map[&b].inputs, BTreeSet::from([(a, 0)]));
    }
}
