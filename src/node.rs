// src/node.rs
//
// Wires the routing table, transport, ledger and 2PC driver into one
// node. Handler dispatch and the iterative lookup follow `kademlia_node.py`
// (`lookup_node`, `join`) and `node.py` (`send_bitcoins`, `become_receiver`,
// `become_witness`, `commit_tx`, `abort_tx`), expressed with the teacher's
// `Arc<Mutex<..>>`-sharing style rather than its raw-pointer self-reference
// trick in `kademlia_service::run_service`.

use crate::config::NodeConfig;
use crate::crypto::{self, Keypair};
use crate::error::CoordError;
use crate::id::NodeId;
use crate::ledger::{Ledger, Transaction, TxId};
use crate::routing_table::RoutingTable;
use crate::rpc::{AddTxBroadcast, CommitBroadcast, Procedure, ReplyEnvelope, RequestEnvelope, Response};
use crate::transport::{Inbound, Transport};
use ed25519_dalek::PublicKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, instrument, warn};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Sender,
    Receiver,
    Witness,
}

struct BusyState {
    txs: Vec<Transaction>,
    role: Role,
}

pub struct Node {
    pub id: NodeId,
    pub keypair: Keypair,
    pub config: NodeConfig,
    transport: Arc<Transport>,
    routing: Mutex<RoutingTable>,
    storage: Mutex<HashMap<NodeId, Vec<u8>>>,
    pubkeys: Mutex<HashMap<NodeId, PublicKey>>,
    ledger: Mutex<Ledger>,
    busy: Mutex<Option<BusyState>>,
    /// `commit_tx`'s undo log: payment-tx id -> input ids it marked spent.
    undo_log: Mutex<HashMap<TxId, Vec<TxId>>>,
    result_tx: Mutex<Option<oneshot::Sender<String>>>,
    driver_notify: Notify,
    stopping: AtomicBool,
}

impl Node {
    pub async fn bind(config: NodeConfig) -> anyhow::Result<Arc<Node>> {
        let id = NodeId::random();
        let addr: SocketAddr = config.listen_addr.parse()?;
        let transport = Transport::bind(
            addr,
            Duration::from_millis(config.request_timeout_ms),
            config.broadcast_seen_capacity,
        )
        .await?;
        let keypair = Keypair::generate();
        let ledger = Ledger::new_with_genesis(id, config.genesis_balance);
        let routing = RoutingTable::new(id, config.k);

        Ok(Arc::new(Node {
            id,
            keypair,
            config,
            transport: Arc::new(transport),
            routing: Mutex::new(routing),
            storage: Mutex::new(HashMap::new()),
            pubkeys: Mutex::new(HashMap::new()),
            ledger: Mutex::new(ledger),
            busy: Mutex::new(None),
            undo_log: Mutex::new(HashMap::new()),
            result_tx: Mutex::new(None),
            driver_notify: Notify::new(),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr().expect("bound socket")
    }

    pub fn ledger_snapshot(&self) -> Vec<Transaction> {
        self.ledger.lock().unwrap().all().to_vec()
    }

    pub fn balance(&self) -> u64 {
        let id = self.id;
        self.ledger.lock().unwrap().balance_of(&id)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.lock().unwrap().is_some()
    }

    /// Asks a peer to print its local ledger to its own logs, for
    /// interactive inspection during debugging.
    pub async fn print_ledger(&self, peer_id: NodeId, peer_addr: SocketAddr) -> Result<bool, CoordError> {
        match self.call(peer_id, peer_addr, Procedure::PrintLedger).await? {
            Response::Ack(ok) => Ok(ok),
            _ => Err(CoordError::ProtocolError("print_ledger".into())),
        }
    }

    /// Spawns the inbound-datagram loop and the 2PC driver task.
    pub fn run(self: &Arc<Self>) {
        let recv_handle = self.clone();
        tokio::spawn(async move { recv_handle.recv_loop().await });
        let driver_handle = self.clone();
        tokio::spawn(async move { driver_handle.two_pc_driver().await });
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    async fn recv_loop(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return;
            }
            match self.transport.recv().await {
                Ok(Some(Inbound::Request {
                    from,
                    msg_id,
                    payload,
                    ..
                })) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_request(from, msg_id, payload).await });
                }
                Ok(Some(Inbound::Broadcast {
                    from,
                    msg_id,
                    procedure,
                    payload,
                })) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.handle_broadcast(from, msg_id, procedure, payload).await });
                }
                Ok(None) => {}
                Err(e) => warn!("transport recv error: {e}"),
            }
        }
    }

    // ---- outbound RPC ----------------------------------------------------

    async fn call(
        &self,
        peer_id: NodeId,
        peer_addr: SocketAddr,
        procedure: Procedure,
    ) -> Result<Response, CoordError> {
        let label = procedure.name();
        let envelope = RequestEnvelope {
            caller_id: self.id,
            caller_pub: self.keypair.public(),
            procedure,
        };
        let payload = bincode::serialize(&envelope)
            .map_err(|e| CoordError::Internal(format!("encode {label}: {e}")))?;
        let raw = self.transport.request(peer_id, peer_addr, label, payload).await?;
        let reply: ReplyEnvelope = bincode::deserialize(&raw)
            .map_err(|e| CoordError::Internal(format!("decode reply to {label}: {e}")))?;
        self.routing.lock().unwrap().update_peer(reply.responder_id, peer_addr);
        self.pubkeys
            .lock()
            .unwrap()
            .insert(reply.responder_id, reply.responder_pub);
        Ok(reply.response)
    }

    // ---- inbound dispatch --------------------------------------------------

    #[instrument(skip(self, payload))]
    async fn handle_request(self: Arc<Self>, from: SocketAddr, msg_id: [u8; 16], payload: Vec<u8>) {
        let envelope: RequestEnvelope = match bincode::deserialize(&payload) {
            Ok(e) => e,
            Err(e) => {
                warn!("malformed request from {from}: {e}");
                return;
            }
        };
        self.routing.lock().unwrap().update_peer(envelope.caller_id, from);
        self.pubkeys.lock().unwrap().insert(envelope.caller_id, envelope.caller_pub);

        let response = self.dispatch(envelope.caller_id, envelope.procedure).await;
        let reply = ReplyEnvelope {
            responder_id: self.id,
            responder_pub: self.keypair.public(),
            response,
        };
        match bincode::serialize(&reply) {
            Ok(bytes) => {
                if let Err(e) = self.transport.reply(from, msg_id, bytes).await {
                    warn!("failed to reply to {from}: {e}");
                }
            }
            Err(e) => warn!("failed to encode reply: {e}"),
        }
    }

    async fn dispatch(&self, caller_id: NodeId, procedure: Procedure) -> Response {
        match procedure {
            Procedure::Ping => Response::Pong,
            Procedure::Store { key, value } => {
                self.storage.lock().unwrap().insert(key, value);
                Response::Stored(true)
            }
            Procedure::FindNode { key } => {
                let peers = self
                    .routing
                    .lock()
                    .unwrap()
                    .find_closest_peers(&key, Some(&caller_id), self.config.k);
                Response::Peers(peers)
            }
            Procedure::FindValue { key } => {
                let local = self.storage.lock().unwrap().get(&key).cloned();
                match local {
                    Some(value) => Response::ValueFound(value),
                    None => {
                        let peers = self
                            .routing
                            .lock()
                            .unwrap()
                            .find_closest_peers(&key, Some(&caller_id), self.config.k);
                        Response::ValueNotFound(peers)
                    }
                }
            }
            Procedure::BecomeReceiver { txs } => self.try_become(txs, Role::Receiver),
            Procedure::BecomeWitness { txs } => self.try_become(txs, Role::Witness),
            Procedure::CommitTx {
                txs,
                signature,
                sender_pub,
            } => Response::CommitResult(self.commit_tx(txs, signature, sender_pub)),
            Procedure::AbortTx { txs } => Response::AbortResult(self.abort_tx(&txs)),
            Procedure::GetLedger => Response::Ledger(self.ledger_snapshot()),
            Procedure::AddTxToLedger { tx } => {
                self.ledger.lock().unwrap().add_tx(tx.clone());
                info!("added transaction {} to the ledger directly", tx.id);
                Response::Ack(true)
            }
            Procedure::PrintLedger => {
                info!("ledger: {:?}", self.ledger_snapshot());
                Response::Ack(true)
            }
        }
    }

    fn try_become(&self, txs: Vec<Transaction>, role: Role) -> Response {
        let mut busy = self.busy.lock().unwrap();
        if busy.is_some() {
            return Response::YesOrBusy(false);
        }
        *busy = Some(BusyState { txs, role });
        Response::YesOrBusy(true)
    }

    /// Verifies the sender's signature, classifies the tx pair as new/old/
    /// weird against this node's ledger, and commits or rejects it.
    fn commit_tx(
        &self,
        txs: Vec<Transaction>,
        signature: ed25519_dalek::Signature,
        sender_pub: PublicKey,
    ) -> bool {
        let canonical = match bincode::serialize(&txs) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if !crypto::verify(&sender_pub, &canonical, &signature) {
            return false;
        }

        let mut ledger = self.ledger.lock().unwrap();
        let first_present = ledger.contains(txs[0].id);
        let second_present = txs.get(1).map(|t| ledger.contains(t.id)).unwrap_or(true);
        let classification = match (first_present, second_present) {
            (false, false) => "new",
            (true, true) => "old",
            _ => "weird",
        };

        let committed = match classification {
            "old" => true,
            "new" => {
                if !ledger.verify_trans(&txs) {
                    false
                } else {
                    let flipped = ledger.mark_spent(&txs[0].input_tx);
                    self.undo_log.lock().unwrap().insert(txs[0].id, flipped);
                    for tx in &txs {
                        ledger.add_tx(tx.clone());
                    }
                    true
                }
            }
            _ => false,
        };
        drop(ledger);

        if committed {
            self.clear_busy_if_participant(&txs);
        }
        committed
    }

    fn abort_tx(&self, txs: &[Transaction]) -> bool {
        if txs.is_empty() {
            return false;
        }
        let payment_id = txs[0].id;
        let mut ledger = self.ledger.lock().unwrap();
        for tx in txs {
            ledger.remove_tx(tx.id);
        }
        if let Some(flipped) = self.undo_log.lock().unwrap().remove(&payment_id) {
            ledger.unmark_spent(&flipped);
        }
        drop(ledger);

        let mut busy = self.busy.lock().unwrap();
        let involved = busy
            .as_ref()
            .map(|b| b.txs.first().map(|t| t.id) == Some(payment_id))
            .unwrap_or(false);
        if involved {
            *busy = None;
            true
        } else {
            false
        }
    }

    fn clear_busy_if_participant(&self, txs: &[Transaction]) {
        let payment = &txs[0];
        let is_participant = Some(self.id) == payment.sender
            || self.id == payment.receiver
            || Some(self.id) == payment.witness;
        if is_participant {
            let mut busy = self.busy.lock().unwrap();
            if busy
                .as_ref()
                .map(|b| b.txs.first().map(|t| t.id) == Some(payment.id))
                .unwrap_or(false)
            {
                *busy = None;
            }
        }
    }

    async fn handle_broadcast(
        self: Arc<Self>,
        from: SocketAddr,
        msg_id: [u8; 16],
        procedure: String,
        payload: Vec<u8>,
    ) {
        if !self.transport.mark_broadcast_seen(msg_id) {
            return;
        }
        let peers = self.routing.lock().unwrap().all_peers();
        let addrs: Vec<SocketAddr> = peers.iter().map(|(_, a)| *a).collect();
        if let Err(e) = self.transport.flood(&addrs, msg_id, &procedure, payload.clone()).await {
            warn!("rebroadcast failed: {e}");
        }

        match procedure.as_str() {
            "add_tx_to_ledger" => match bincode::deserialize::<AddTxBroadcast>(&payload) {
                Ok(msg) => {
                    debug!("received add_tx_to_ledger broadcast from {from} for tx {}", msg.tx.id);
                    self.ledger.lock().unwrap().add_tx(msg.tx);
                }
                Err(e) => warn!("malformed add_tx_to_ledger broadcast from {from}: {e}"),
            },
            _ => match bincode::deserialize::<CommitBroadcast>(&payload) {
                Ok(msg) => {
                    debug!("received commit broadcast from {from} with {} txs", msg.txs.len());
                    let mut ledger = self.ledger.lock().unwrap();
                    if !ledger.contains(msg.txs[0].id) && ledger.verify_trans(&msg.txs) {
                        let flipped = ledger.mark_spent(&msg.txs[0].input_tx);
                        self.undo_log.lock().unwrap().insert(msg.txs[0].id, flipped);
                        for tx in &msg.txs {
                            ledger.add_tx(tx.clone());
                        }
                    }
                }
                Err(e) => warn!("malformed commit broadcast from {from}: {e}"),
            },
        }
    }

    // ---- Kademlia lookups ---------------------------------------------------

    /// Iterative lookup with concurrency `alpha`, returning the `k` closest
    /// live peers to `key` (or, in find-value mode, the stored value).
    pub async fn lookup_node(&self, key: NodeId, find_value: bool) -> Result<LookupResult, CoordError> {
        let seed = {
            let rt = self.routing.lock().unwrap();
            if rt.is_empty() {
                return Err(CoordError::KeyError(key));
            }
            rt.find_closest_peers(&key, None, self.config.k)
        };

        let mut candidates: HashMap<NodeId, SocketAddr> = seed.into_iter().collect();
        let mut contacted: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        let mut dead: std::collections::HashSet<NodeId> = std::collections::HashSet::new();

        loop {
            let mut to_contact: Vec<(NodeId, SocketAddr)> = candidates
                .iter()
                .filter(|(id, _)| !contacted.contains(*id))
                .map(|(id, addr)| (*id, *addr))
                .collect();
            to_contact.sort_by_key(|(id, _)| byte_distance(&key, id));
            to_contact.truncate(self.config.alpha);
            if to_contact.is_empty() {
                break;
            }

            for (peer_id, peer_addr) in to_contact {
                contacted.insert(peer_id);
                let procedure = if find_value {
                    Procedure::FindValue { key }
                } else {
                    Procedure::FindNode { key }
                };
                match self.call(peer_id, peer_addr, procedure).await {
                    Ok(Response::ValueFound(value)) => return Ok(LookupResult::Value(value)),
                    Ok(Response::ValueNotFound(peers)) | Ok(Response::Peers(peers)) => {
                        for (id, addr) in peers {
                            if id != self.id {
                                candidates.insert(id, addr);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        self.routing.lock().unwrap().forget_peer(&peer_id);
                        dead.insert(peer_id);
                    }
                }
            }
        }

        if find_value {
            return Err(CoordError::KeyError(key));
        }

        let mut results: Vec<(NodeId, SocketAddr)> = candidates
            .into_iter()
            .filter(|(id, _)| !dead.contains(id))
            .collect();
        results.sort_by_key(|(id, _)| byte_distance(&key, id));
        results.truncate(self.config.k);
        Ok(LookupResult::Peers(results))
    }

    pub async fn put(&self, raw_key: &[u8], value: Vec<u8>) -> Result<usize, CoordError> {
        let key = NodeId::hash_key(raw_key);
        let peers = match self.lookup_node(key, false).await? {
            LookupResult::Peers(p) => p,
            LookupResult::Value(_) => unreachable!("find_node mode never returns a value"),
        };
        let mut acked = 0;
        for (peer_id, peer_addr) in peers {
            let procedure = Procedure::Store {
                key,
                value: value.clone(),
            };
            if let Ok(Response::Stored(true)) = self.call(peer_id, peer_addr, procedure).await {
                acked += 1;
            }
        }
        Ok(acked)
    }

    pub async fn get(&self, raw_key: &[u8]) -> Result<Vec<u8>, CoordError> {
        let key = NodeId::hash_key(raw_key);
        if let Some(value) = self.storage.lock().unwrap().get(&key).cloned() {
            return Ok(value);
        }
        match self.lookup_node(key, true).await? {
            LookupResult::Value(v) => Ok(v),
            LookupResult::Peers(_) => Err(CoordError::KeyError(key)),
        }
    }

    /// Bootstraps against a known peer: ping it, run a self-lookup to
    /// populate the routing table, announce to every discovered neighbour,
    /// then adopt its ledger wholesale before broadcasting our own genesis.
    pub async fn join(self: &Arc<Self>, bootstrap_addr: SocketAddr) -> Result<(), CoordError> {
        let pong = self.call(NodeId::zero(), bootstrap_addr, Procedure::Ping).await?;
        let bootstrap_id = match pong {
            Response::Pong => self
                .routing
                .lock()
                .unwrap()
                .all_peers()
                .into_iter()
                .find(|(_, a)| *a == bootstrap_addr)
                .map(|(id, _)| id)
                .ok_or_else(|| CoordError::Internal("bootstrap id not learned from ping".into()))?,
            _ => return Err(CoordError::ProtocolError("ping".into())),
        };

        let neighbours = match self.lookup_node(self.id, false).await {
            Ok(LookupResult::Peers(p)) => p,
            _ => vec![],
        };
        for (peer_id, peer_addr) in &neighbours {
            let _ = self.call(*peer_id, *peer_addr, Procedure::Ping).await;
        }

        let known = self
            .lookup_node(self.id, true)
            .await
            .err()
            .map(|_| false)
            .unwrap_or(true);
        if !known {
            let _ = self.put(&self.id.0, self.local_addr().to_string().into_bytes()).await;
        }

        let own_genesis = self
            .ledger
            .lock()
            .unwrap()
            .all()
            .first()
            .cloned()
            .expect("ledger always has a genesis record");

        // register our genesis with the bootstrapper directly, then adopt
        // its ledger, before gossiping the genesis on to everyone else.
        let _ = self
            .call(
                bootstrap_id,
                bootstrap_addr,
                Procedure::AddTxToLedger {
                    tx: own_genesis.clone(),
                },
            )
            .await;

        if let Ok(Response::Ledger(remote_txs)) =
            self.call(bootstrap_id, bootstrap_addr, Procedure::GetLedger).await
        {
            let mut ledger = self.ledger.lock().unwrap();
            for tx in remote_txs {
                ledger.add_tx(tx);
            }
        }

        let payload = bincode::serialize(&AddTxBroadcast { tx: own_genesis })
            .map_err(|e| CoordError::Internal(format!("encode genesis broadcast: {e}")))?;
        let peers = self.routing.lock().unwrap().all_peers();
        let addrs: Vec<SocketAddr> = peers.iter().map(|(_, a)| *a).collect();
        let _ = self.transport.broadcast(&addrs, "add_tx_to_ledger", payload).await;

        info!("joined network via {bootstrap_addr}, {} neighbours known", neighbours.len());
        Ok(())
    }

    // ---- 2PC driver ---------------------------------------------------------

    /// Initiates a send as the sender role: reserves balance locally, then
    /// wakes the driver task to run phase 1/2 across the network.
    pub async fn send_bitcoins(self: &Arc<Self>, receiver: NodeId, witness: NodeId, amount: u64) -> String {
        let generated = {
            let ledger = self.ledger.lock().unwrap();
            ledger.gen_trans(self.id, receiver, witness, amount)
        };
        let Some((payment, refund)) = generated else {
            return "Not enough balance".to_string();
        };
        let mut txs = vec![payment];
        if let Some(r) = refund {
            txs.push(r);
        }

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut busy = self.busy.lock().unwrap();
            if busy.is_some() {
                return "Node already busy with another transaction".to_string();
            }
            *busy = Some(BusyState {
                txs,
                role: Role::Sender,
            });
        }
        *self.result_tx.lock().unwrap() = Some(done_tx);
        self.driver_notify.notify_one();
        done_rx.await.unwrap_or_else(|_| "aborted".to_string())
    }

    async fn two_pc_driver(self: Arc<Self>) {
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return;
            }
            self.driver_notify.notified().await;
            let snapshot = {
                let busy = self.busy.lock().unwrap();
                busy.as_ref()
                    .filter(|b| b.role == Role::Sender)
                    .map(|b| b.txs.clone())
            };
            if let Some(txs) = snapshot {
                let result = self.run_2pc(txs).await;
                if let Some(tx) = self.result_tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            }
        }
    }

    async fn run_2pc(self: &Arc<Self>, txs: Vec<Transaction>) -> String {
        let payment = &txs[0];
        let receiver = payment.receiver;
        let witness = payment.witness.expect("sends always have a witness");

        let receiver_addr = match self.resolve_peer(receiver).await {
            Some(addr) => addr,
            None => {
                self.abort_all(&txs, &[]).await;
                return "Could not resolve receiver".to_string();
            }
        };
        let witness_addr = match self.resolve_peer(witness).await {
            Some(addr) => addr,
            None => {
                self.abort_all(&txs, &[(receiver, receiver_addr)]).await;
                return "Could not resolve witness".to_string();
            }
        };

        let receiver_ok = matches!(
            self.call(receiver, receiver_addr, Procedure::BecomeReceiver { txs: txs.clone() }).await,
            Ok(Response::YesOrBusy(true))
        );
        let witness_ok = matches!(
            self.call(witness, witness_addr, Procedure::BecomeWitness { txs: txs.clone() }).await,
            Ok(Response::YesOrBusy(true))
        );

        if !receiver_ok || !witness_ok {
            self.abort_all(&txs, &[(receiver, receiver_addr), (witness, witness_addr)])
                .await;
            self.busy.lock().unwrap().take();
            return "abort".to_string();
        }

        let canonical = bincode::serialize(&txs).expect("transactions always serialize");
        let signature = self.keypair.sign(&canonical);
        let sender_pub = self.keypair.public();

        let commit_procedure = || Procedure::CommitTx {
            txs: txs.clone(),
            signature,
            sender_pub,
        };
        let receiver_committed = matches!(
            self.call(receiver, receiver_addr, commit_procedure()).await,
            Ok(Response::CommitResult(true))
        );
        let witness_committed = matches!(
            self.call(witness, witness_addr, commit_procedure()).await,
            Ok(Response::CommitResult(true))
        );

        if !receiver_committed || !witness_committed {
            self.abort_all(&txs, &[(receiver, receiver_addr), (witness, witness_addr)])
                .await;
            self.busy.lock().unwrap().take();
            return "abort".to_string();
        }

        self.commit_tx(txs.clone(), signature, sender_pub);

        let payload = bincode::serialize(&CommitBroadcast { txs: txs.clone() })
            .expect("commit broadcast always serializes");
        let peers = self.routing.lock().unwrap().all_peers();
        let addrs: Vec<SocketAddr> = peers.iter().map(|(_, a)| *a).collect();
        let _ = self.transport.broadcast(&addrs, "commit_tx", payload).await;

        "committed".to_string()
    }

    async fn abort_all(&self, txs: &[Transaction], extra_targets: &[(NodeId, SocketAddr)]) {
        for (peer_id, peer_addr) in extra_targets {
            let _ = self
                .call(*peer_id, *peer_addr, Procedure::AbortTx { txs: txs.to_vec() })
                .await;
        }
        self.abort_tx(txs);
    }

    async fn resolve_peer(&self, id: NodeId) -> Option<SocketAddr> {
        if let Some(addr) = self.routing.lock().unwrap().address_of(&id) {
            return Some(addr);
        }
        match self.lookup_node(id, false).await {
            Ok(LookupResult::Peers(peers)) => peers.into_iter().find(|(p, _)| *p == id).map(|(_, a)| a),
            _ => None,
        }
    }
}

pub enum LookupResult {
    Peers(Vec<(NodeId, SocketAddr)>),
    Value(Vec<u8>),
}

fn byte_distance(a: &NodeId, b: &NodeId) -> [u8; crate::id::ID_BYTES] {
    a.xor(b).0
}
