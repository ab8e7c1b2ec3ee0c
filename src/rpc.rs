// src/rpc.rs
//
// The tagged request/response payloads carried inside transport frames.
// Replaces the original's name-based `@remote` dispatch with a statically
// typed enum matched once in `Node::dispatch` (see DESIGN.md's note on
// redesigning reflection-based RPC dispatch).

use crate::id::NodeId;
use crate::ledger::Transaction;
use ed25519_dalek::{PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Serialize, Deserialize, Debug)]
pub enum Procedure {
    Ping,
    Store { key: NodeId, value: Vec<u8> },
    FindNode { key: NodeId },
    FindValue { key: NodeId },
    BecomeReceiver { txs: Vec<Transaction> },
    BecomeWitness { txs: Vec<Transaction> },
    CommitTx {
        txs: Vec<Transaction>,
        signature: Signature,
        sender_pub: PublicKey,
    },
    AbortTx { txs: Vec<Transaction> },
    GetLedger,
    AddTxToLedger { tx: Transaction },
    PrintLedger,
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Ping => "ping",
            Procedure::Store { .. } => "store",
            Procedure::FindNode { .. } => "find_node",
            Procedure::FindValue { .. } => "find_value",
            Procedure::BecomeReceiver { .. } => "become_receiver",
            Procedure::BecomeWitness { .. } => "become_witness",
            Procedure::CommitTx { .. } => "commit_tx",
            Procedure::AbortTx { .. } => "abort_tx",
            Procedure::GetLedger => "get_ledger",
            Procedure::AddTxToLedger { .. } => "add_tx_to_ledger",
            Procedure::PrintLedger => "print_ledger",
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub enum Response {
    Pong,
    Stored(bool),
    Peers(Vec<(NodeId, SocketAddr)>),
    ValueFound(Vec<u8>),
    ValueNotFound(Vec<(NodeId, SocketAddr)>),
    YesOrBusy(bool),
    CommitResult(bool),
    AbortResult(bool),
    Ledger(Vec<Transaction>),
    Ack(bool),
}

#[derive(Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub caller_id: NodeId,
    pub caller_pub: PublicKey,
    pub procedure: Procedure,
}

#[derive(Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub responder_id: NodeId,
    pub responder_pub: PublicKey,
    pub response: Response,
}

/// Broadcast payload used to gossip a committed transaction pair to the
/// rest of the network by flooding.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommitBroadcast {
    pub txs: Vec<Transaction>,
}

/// Broadcast payload used to gossip a single bookkeeping transaction (a
/// freshly-joined node's genesis record) to the rest of the network.
/// Admitted unconditionally on arrival, unlike `CommitBroadcast`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddTxBroadcast {
    pub tx: Transaction,
}
