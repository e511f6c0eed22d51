//! General graph algorithms over caller-supplied adjacency closures.

use std::collections::BTreeMap;
use std::hash::Hash;

use rustc_hash::FxHashSet;

enum Visit<V> {
    Enter(V),
    Exit(V),
}

/// Finds strongly connected components. Each node is mapped to its
/// component's representative; two nodes share a component iff they map to
/// the same representative.
pub fn scc_kosaraju<V, NodeIter, PredsFn, SuccsFn, PredsIter, SuccsIter>(
    nodes: NodeIter,
    preds_fn: PredsFn,
    succs_fn: SuccsFn,
) -> BTreeMap<V, V>
where
    V: Copy + Ord + Hash,
    NodeIter: IntoIterator<Item = V> + Clone,
    PredsFn: Fn(V) -> PredsIter,
    SuccsFn: Fn(V) -> SuccsIter,
    PredsIter: IntoIterator<Item = V>,
    SuccsIter: IntoIterator<Item = V>,
{
    // Pass 1: DFS on successor edges, recording finish order.
    let mut visited = FxHashSet::default();
    let mut finish_order = Vec::new();
    for start in nodes.clone() {
        if visited.contains(&start) {
            continue;
        }
        let mut stack = vec![Visit::Enter(start)];
        while let Some(frame) = stack.pop() {
            match frame {
                Visit::Enter(node) => {
                    if !visited.insert(node) {
                        continue;
                    }
                    stack.push(Visit::Exit(node));
                    for succ in succs_fn(node) {
                        if !visited.contains(&succ) {
                            stack.push(Visit::Enter(succ));
                        }
                    }
                }
                Visit::Exit(node) => finish_order.push(node),
            }
        }
    }

    // Pass 2: sweep predecessor edges in reverse finish order; every node
    // reached from an unassigned root belongs to that root's component.
    let mut representative = BTreeMap::new();
    for &root in finish_order.iter().rev() {
        if representative.contains_key(&root) {
            continue;
        }
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if representative.contains_key(&node) {
                continue;
            }
            representative.insert(node, root);
            for pred in preds_fn(node) {
                if !representative.contains_key(&pred) {
                    stack.push(pred);
                }
            }
        }
    }
    representative
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjacency(edges: &[(u32, u32)]) -> (BTreeMap<u32, Vec<u32>>, BTreeMap<u32, Vec<u32>>) {
        let mut preds: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut succs: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for &(from, to) in edges {
            succs.entry(from).or_default().push(to);
            preds.entry(to).or_default().push(from);
        }
        (preds, succs)
    }

    #[test]
    fn chain_has_singleton_components() {
        let (preds, succs) = adjacency(&[(1, 2), (2, 3)]);
        let scc = scc_kosaraju(
            [1u32, 2, 3],
            |v| preds.get(&v).into_iter().flatten().copied(),
            |v| succs.get(&v).into_iter().flatten().copied(),
        );
        assert_ne!(scc[&1], scc[&2]);
        assert_ne!(scc[&2], scc[&3]);
    }

    #[test]
    fn two_cycles_are_distinct_components() {
        let (preds, succs) = adjacency(&[(1, 2), (2, 1), (2, 3), (3, 4), (4, 3)]);
        let scc = scc_kosaraju(
            [1u32, 2, 3, 4],
            |v| preds.get(&v).into_iter().flatten().copied(),
            |v| succs.get(&v).into_iter().flatten().copied(),
        );
        assert_eq!(scc[&1], scc[&2]);
        assert_eq!(scc[&3], scc[&4]);
        assert_ne!(scc[&1], scc[&3]);
    }
}
