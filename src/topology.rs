/// Process groupings: the global rank order, the set of ranks sharing this
/// rank's node (intra), and the node index itself (inter).
///
/// The transport backend supplies the node assignment; when shared-memory home
/// mapping is disabled every rank is placed on its own node, which routes all
/// non-home traffic through the block cache.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    my_rank: usize,
    n_ranks: usize,
    node_of: Vec<usize>,
    my_node: usize,
    n_nodes: usize,
    intra_rank: usize,
    intra_n_ranks: usize,
}

impl Topology {
    pub(crate) fn new(my_rank: usize, node_of: Vec<usize>) -> Topology {
        let n_ranks = node_of.len();
        debug_assert!(my_rank < n_ranks);
        let my_node = node_of[my_rank];
        let n_nodes = node_of.iter().max().map(|m| m + 1).unwrap_or(1);
        let intra_rank = node_of[..my_rank]
            .iter()
            .filter(|&&n| n == my_node)
            .count();
        let intra_n_ranks = node_of.iter().filter(|&&n| n == my_node).count();
        Topology {
            my_rank,
            n_ranks,
            node_of,
            my_node,
            n_nodes,
            intra_rank,
            intra_n_ranks,
        }
    }

    /// Every rank on one node.
    pub(crate) fn single_node(my_rank: usize, n_ranks: usize) -> Topology {
        Topology::new(my_rank, vec![0; n_ranks])
    }

    /// Every rank on its own node; nothing is locally accessible.
    pub(crate) fn isolated(my_rank: usize, n_ranks: usize) -> Topology {
        Topology::new(my_rank, (0..n_ranks).collect())
    }

    pub(crate) fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub(crate) fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    pub(crate) fn my_node(&self) -> usize {
        self.my_node
    }

    pub(crate) fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub(crate) fn intra_rank(&self) -> usize {
        self.intra_rank
    }

    pub(crate) fn intra_n_ranks(&self) -> usize {
        self.intra_n_ranks
    }

    pub(crate) fn node_of(&self, rank: usize) -> usize {
        debug_assert!(rank < self.n_ranks);
        self.node_of[rank]
    }

    /// True iff `rank`'s home memory can be load/store accessed from here.
    pub(crate) fn is_locally_accessible(&self, rank: usize) -> bool {
        self.node_of(rank) == self.my_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groupings() {
        // two nodes: ranks {0,1} and {2,3,4}
        let t = Topology::new(3, vec![0, 0, 1, 1, 1]);
        assert_eq!(t.n_ranks(), 5);
        assert_eq!(t.my_node(), 1);
        assert_eq!(t.n_nodes(), 2);
        assert_eq!(t.intra_rank(), 1);
        assert_eq!(t.intra_n_ranks(), 3);
        assert!(t.is_locally_accessible(2));
        assert!(t.is_locally_accessible(4));
        assert!(!t.is_locally_accessible(0));
    }

    #[test]
    fn isolated_ranks_reach_only_themselves() {
        let t = Topology::isolated(1, 3);
        assert!(t.is_locally_accessible(1));
        assert!(!t.is_locally_accessible(0));
        assert!(!t.is_locally_accessible(2));
        assert_eq!(t.intra_n_ranks(), 1);
        assert_eq!(t.n_nodes(), 3);
    }
}
