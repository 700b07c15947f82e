//! Intra-batch dependency ordering.
//!
//! Within one assembly round a transaction may consume outputs created
//! by another transaction in the same batch. Producers must apply
//! first, so the batch is ordered by Kahn's algorithm, kept iterative
//! because batches can be large. Ties break toward arrival order, which
//! keeps the result deterministic for a given snapshot.

use std::collections::{BinaryHeap, HashMap};

use log::warn;

use crate::models::SignedTransaction;

/// Map every output key produced inside the batch to its producer's
/// position.
pub fn batch_producers(txs: &[SignedTransaction]) -> HashMap<String, usize> {
    let mut producers = HashMap::new();
    for (position, tx) in txs.iter().enumerate() {
        for output in &tx.outputs {
            producers.insert(output.key(), position);
        }
    }
    producers
}

/// Topologically sort a batch by intra-batch dependencies.
///
/// Returns positions into `txs` in apply order, plus a flag set when a
/// dependency cycle was found (an upstream bug; content-addressed ids
/// cannot legitimately form one), in which case arrival order is used.
pub fn topological_order(txs: &[SignedTransaction]) -> (Vec<usize>, bool) {
    let producers = batch_producers(txs);

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); txs.len()];
    let mut indegree: Vec<usize> = vec![0; txs.len()];
    for (consumer, tx) in txs.iter().enumerate() {
        for input in &tx.inputs {
            if let Some(&producer) = producers.get(&input.key()) {
                if producer != consumer {
                    dependents[producer].push(consumer);
                    indegree[consumer] += 1;
                }
            }
        }
    }

    // Min-heap on position: among the currently ready transactions the
    // earliest-arrived applies first.
    let mut ready: BinaryHeap<std::cmp::Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(position, _)| std::cmp::Reverse(position))
        .collect();

    let mut order = Vec::with_capacity(txs.len());
    while let Some(std::cmp::Reverse(position)) = ready.pop() {
        order.push(position);
        for &dependent in &dependents[position] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(std::cmp::Reverse(dependent));
            }
        }
    }

    if order.len() < txs.len() {
        warn!(
            "dependency cycle among {} pending transactions; falling back to arrival order",
            txs.len() - order.len()
        );
        return ((0..txs.len()).collect(), true);
    }
    (order, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::models::UTXORef;

    fn tx(wallet: &Wallet, input: UTXORef, to: &str, amount: &str) -> SignedTransaction {
        SignedTransaction::create(
            wallet,
            vec![input],
            vec![(to.to_string(), amount.parse().unwrap())],
            "0.01".parse().unwrap(),
            "00".repeat(32),
            1_700_000_000,
        )
    }

    #[test]
    fn independent_transactions_keep_arrival_order() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let txs = vec![
            tx(&a, UTXORef::new("genesis", 0), "x", "1"),
            tx(&b, UTXORef::new("genesis", 1), "y", "1"),
            tx(&a, UTXORef::new("genesis", 2), "z", "1"),
        ];
        let (order, cycled) = topological_order(&txs);
        assert_eq!(order, vec![0, 1, 2]);
        assert!(!cycled);
    }

    #[test]
    fn consumer_follows_its_producer_even_when_admitted_first() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let producer = tx(&a, UTXORef::new("genesis", 0), &b.address(), "1");
        let consumer = tx(&b, UTXORef::new(producer.tx_id.clone(), 0), "z", "0.99");
        // Arrival order has the consumer first.
        let txs = vec![consumer.clone(), producer.clone()];
        let (order, cycled) = topological_order(&txs);
        assert_eq!(order, vec![1, 0]);
        assert!(!cycled);
    }

    #[test]
    fn chains_stay_in_dependency_order() {
        let a = Wallet::generate();
        let b = Wallet::generate();
        let c = Wallet::generate();
        let first = tx(&a, UTXORef::new("genesis", 0), &b.address(), "2");
        let second = tx(&b, UTXORef::new(first.tx_id.clone(), 0), &c.address(), "1.99");
        let third = tx(&c, UTXORef::new(second.tx_id.clone(), 0), "sink", "1.98");
        let txs = vec![third, first, second];
        let (order, cycled) = topological_order(&txs);
        assert_eq!(order, vec![1, 2, 0]);
        assert!(!cycled);
    }

    #[test]
    fn a_forged_cycle_falls_back_to_arrival_order() {
        // Construct two transactions that reference each other's ids by
        // hand. Impossible with content-addressed ids, but the sort must
        // not spin on corrupt input.
        let a = Wallet::generate();
        let mut one = tx(&a, UTXORef::new("placeholder", 0), "x", "1");
        let mut two = tx(&a, UTXORef::new("placeholder", 0), "y", "1");
        one.inputs[0] = UTXORef::new(two.tx_id.clone(), 0);
        two.inputs[0] = UTXORef::new(one.tx_id.clone(), 0);
        let txs = vec![one, two];
        let (order, cycled) = topological_order(&txs);
        assert_eq!(order, vec![0, 1]);
        assert!(cycled);
    }
}
