//! Pass scheduling: depth-first topological sort rooted at the root
//! pass. Passes not reachable from the root are discarded.

use crate::GraphError;

const WHITE: u8 = 0;
const GREY: u8 = 1;
const BLACK: u8 = 2;

/// Orders passes so every dependency precedes its dependents and the
/// root comes last. `edges` are `(before, after)` pairs.
pub fn schedule(
    pass_count: usize,
    edges: &[(u32, u32)],
    root: Option<u32>,
) -> Result<Vec<u32>, GraphError> {
    let root = root.ok_or(GraphError::MissingRootPass)?;
    debug_assert!((root as usize) < pass_count);

    let mut dependencies: Vec<Vec<u32>> = vec![Vec::new(); pass_count];
    for &(before, after) in edges {
        dependencies[after as usize].push(before);
    }

    let mut state = vec![WHITE; pass_count];
    let mut order = Vec::with_capacity(pass_count);
    visit(root, &dependencies, &mut state, &mut order)?;
    Ok(order)
}

fn visit(
    pass: u32,
    dependencies: &[Vec<u32>],
    state: &mut [u8],
    order: &mut Vec<u32>,
) -> Result<(), GraphError> {
    match state[pass as usize] {
        GREY => return Err(GraphError::Cycle),
        BLACK => return Ok(()),
        _ => {}
    }
    state[pass as usize] = GREY;
    for &dependency in &dependencies[pass as usize] {
        visit(dependency, dependencies, state, order)?;
    }
    state[pass as usize] = BLACK;
    order.push(pass);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[u32], pass: u32) -> usize {
        order.iter().position(|&p| p == pass).unwrap()
    }

    #[test]
    fn chain_orders_dependencies_first() {
        // 0 -> 1 -> 2, root 2.
        let order = schedule(3, &[(0, 1), (1, 2)], Some(2)).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn diamond_respects_all_edges() {
        // 0 feeds 1 and 2; both feed 3.
        let order = schedule(4, &[(0, 1), (0, 2), (1, 3), (2, 3)], Some(3)).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(*order.last().unwrap(), 3);
        assert!(position(&order, 0) < position(&order, 1));
        assert!(position(&order, 0) < position(&order, 2));
        assert!(position(&order, 1) < position(&order, 3));
        assert!(position(&order, 2) < position(&order, 3));
    }

    #[test]
    fn unreachable_passes_are_discarded() {
        // 4 never feeds into the root's dependency closure.
        let order = schedule(5, &[(0, 1), (1, 2), (3, 4)], Some(2)).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn cycle_is_fatal() {
        let result = schedule(3, &[(0, 1), (1, 2), (2, 0)], Some(2));
        assert!(matches!(result, Err(GraphError::Cycle)));
    }

    #[test]
    fn missing_root_is_fatal() {
        assert!(matches!(
            schedule(2, &[(0, 1)], None),
            Err(GraphError::MissingRootPass)
        ));
    }

    #[test]
    fn root_without_dependencies_runs_alone() {
        let order = schedule(3, &[], Some(1)).unwrap();
        assert_eq!(order, vec![1]);
    }
}
