// src/ledger.rs
//
// A UTXO-like ledger: each transaction consumes prior unspent transactions
// it owns as inputs and produces new spendable outputs. Grounded on
// `trans.py`'s `Ledger`/`Transaction` — genesis construction, greedy input
// selection in `gen_trans`, and the pair-consistency checks in
// `verify_trans` — expressed in the teacher's settlement-module idiom
// (`AdvancedSettlementEngine`'s balance bookkeeping) but UTXO-shaped rather
// than balance-shaped, per the ledger's actual semantics.

use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type TxId = i64;

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Monotonic nanosecond-ish timestamp, bumped to stay strictly increasing
/// even when called faster than the clock's resolution.
fn next_id() -> TxId {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64;
    loop {
        let last = LAST_ID.load(Ordering::SeqCst);
        let candidate = now.max(last + 1);
        if LAST_ID
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return candidate;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub sender: Option<NodeId>,
    pub receiver: NodeId,
    pub witness: Option<NodeId>,
    pub amount: u64,
    pub input_tx: Vec<TxId>,
    pub spent: bool,
}

impl Transaction {
    fn genesis(owner: NodeId, balance: u64) -> Self {
        Transaction {
            id: next_id(),
            sender: None,
            receiver: owner,
            witness: None,
            amount: balance,
            input_tx: vec![],
            spent: false,
        }
    }

    fn new(sender: NodeId, receiver: NodeId, witness: NodeId, amount: u64, input_tx: Vec<TxId>) -> Self {
        Transaction {
            id: next_id(),
            sender: Some(sender),
            receiver,
            witness: Some(witness),
            amount,
            input_tx,
            spent: false,
        }
    }
}

#[derive(Default)]
pub struct Ledger {
    txs: Vec<Transaction>,
}

impl Ledger {
    pub fn new_with_genesis(owner: NodeId, opening_balance: u64) -> Self {
        let mut ledger = Ledger { txs: Vec::new() };
        ledger.add_tx(Transaction::genesis(owner, opening_balance));
        ledger
    }

    pub fn empty() -> Self {
        Ledger { txs: Vec::new() }
    }

    pub fn contains(&self, id: TxId) -> bool {
        self.txs.iter().any(|t| t.id == id)
    }

    pub fn get(&self, id: TxId) -> Option<&Transaction> {
        self.txs.iter().find(|t| t.id == id)
    }

    pub fn all(&self) -> &[Transaction] {
        &self.txs
    }

    /// Idempotent; keeps the ledger sorted by id ascending.
    pub fn add_tx(&mut self, tx: Transaction) {
        if self.contains(tx.id) {
            return;
        }
        let pos = self.txs.partition_point(|t| t.id < tx.id);
        self.txs.insert(pos, tx);
    }

    /// Every unspent output this node owns.
    fn unspent_owned_by(&self, owner: &NodeId) -> Vec<&Transaction> {
        self.txs
            .iter()
            .filter(|t| !t.spent && &t.receiver == owner)
            .collect()
    }

    pub fn balance_of(&self, owner: &NodeId) -> u64 {
        self.unspent_owned_by(owner).iter().map(|t| t.amount).sum()
    }

    /// Greedily selects unspent inputs owned by `sender` covering `amount`,
    /// producing a payment transaction and, if there's change, a refund
    /// transaction back to the sender — both sharing the same inputs.
    pub fn gen_trans(
        &self,
        sender: NodeId,
        receiver: NodeId,
        witness: NodeId,
        amount: u64,
    ) -> Option<(Transaction, Option<Transaction>)> {
        let mut selected: Vec<TxId> = Vec::new();
        let mut total = 0u64;
        for tx in self.unspent_owned_by(&sender) {
            if total >= amount {
                break;
            }
            selected.push(tx.id);
            total += tx.amount;
        }
        if total < amount {
            return None;
        }

        let payment = Transaction::new(sender, receiver, witness, amount, selected.clone());
        let change = total - amount;
        let refund = if change > 0 {
            Some(Transaction::new(sender, sender, witness, change, selected))
        } else {
            None
        };
        Some((payment, refund))
    }

    /// Validates a transaction pair: shared inputs/sender/witness, every
    /// input known/owned/unspent, and input sum equals output sum.
    pub fn verify_trans(&self, txs: &[Transaction]) -> bool {
        if txs.is_empty() || txs.len() > 2 {
            return false;
        }
        let first = &txs[0];
        if txs.len() == 2 {
            let second = &txs[1];
            if first.input_tx != second.input_tx
                || first.sender != second.sender
                || first.witness != second.witness
            {
                return false;
            }
        }
        let Some(sender) = first.sender else {
            return false;
        };
        if first.input_tx.is_empty() {
            return false;
        }

        let mut input_sum: u64 = 0;
        for id in &first.input_tx {
            let Some(input) = self.get(*id) else {
                return false;
            };
            if input.receiver != sender || input.spent {
                return false;
            }
            input_sum += input.amount;
        }

        let output_sum: u64 = txs.iter().map(|t| t.amount).sum();
        input_sum == output_sum
    }

    /// Marks every input of `tx` spent; returns the ids actually flipped so
    /// the caller can keep an undo list for `abort_tx`.
    pub fn mark_spent(&mut self, input_ids: &[TxId]) -> Vec<TxId> {
        let mut flipped = Vec::new();
        for id in input_ids {
            if let Some(t) = self.txs.iter_mut().find(|t| t.id == *id) {
                if !t.spent {
                    t.spent = true;
                    flipped.push(*id);
                }
            }
        }
        flipped
    }

    pub fn unmark_spent(&mut self, input_ids: &[TxId]) {
        for id in input_ids {
            if let Some(t) = self.txs.iter_mut().find(|t| t.id == *id) {
                t.spent = false;
            }
        }
    }

    pub fn remove_tx(&mut self, id: TxId) {
        self.txs.retain(|t| t.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_grants_opening_balance() {
        let owner = NodeId::random();
        let ledger = Ledger::new_with_genesis(owner, 100);
        assert_eq!(ledger.balance_of(&owner), 100);
    }

    #[test]
    fn gen_trans_produces_a_verifiable_pair() {
        let alice = NodeId::random();
        let bob = NodeId::random();
        let witness = NodeId::random();
        let ledger = Ledger::new_with_genesis(alice, 100);
        let (payment, refund) = ledger.gen_trans(alice, bob, witness, 30).unwrap();
        let refund = refund.expect("70 change expected");
        assert_eq!(payment.amount, 30);
        assert_eq!(refund.amount, 70);
        assert!(ledger.verify_trans(&[payment, refund]));
    }

    #[test]
    fn gen_trans_fails_on_insufficient_balance() {
        let alice = NodeId::random();
        let bob = NodeId::random();
        let witness = NodeId::random();
        let ledger = Ledger::new_with_genesis(alice, 100);
        assert!(ledger.gen_trans(alice, bob, witness, 1_000_000).is_none());
    }

    #[test]
    fn verify_trans_rejects_mismatched_pair() {
        let alice = NodeId::random();
        let bob = NodeId::random();
        let witness = NodeId::random();
        let ledger = Ledger::new_with_genesis(alice, 100);
        let (payment, _) = ledger.gen_trans(alice, bob, witness, 30).unwrap();
        let mut bad_refund = payment.clone();
        bad_refund.sender = Some(bob); // disagree on sender
        assert!(!ledger.verify_trans(&[payment, bad_refund]));
    }

    #[test]
    fn verify_trans_rejects_already_spent_input() {
        let alice = NodeId::random();
        let bob = NodeId::random();
        let witness = NodeId::random();
        let mut ledger = Ledger::new_with_genesis(alice, 100);
        let (payment, refund) = ledger.gen_trans(alice, bob, witness, 30).unwrap();
        ledger.mark_spent(&payment.input_tx);
        let refund = refund.unwrap();
        assert!(!ledger.verify_trans(&[payment, refund]));
    }
}
