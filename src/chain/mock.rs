//! In-memory regtest chain.
//!
//! Keeps a real block chain starting at the regtest genesis block so the
//! onchain wallet can sync against it like against any other backend.
//! Broadcasts are checked for missing or double-spent inputs, value and
//! time locks. Scripts are not evaluated.

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::relative;
use bitcoin::script::Builder;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, FeeRate, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
    TxOut, Txid, Witness,
};
use tracing::{debug, info};

use super::{ChainError, ChainSource, TxStatus};

const REGTEST_BITS: u32 = 0x207f_ffff;
const BLOCK_INTERVAL_SECS: u32 = 600;

struct Output {
    txout: TxOut,
    spent_by: Option<Txid>,
}

struct State {
    blocks: Vec<Block>,
    mempool: Vec<Transaction>,
    txs: HashMap<Txid, (Transaction, Option<u32>)>,
    outputs: HashMap<OutPoint, Output>,
    fund_counter: u64,
    fee_rate: Option<FeeRate>,
}

impl State {
    fn tip(&self) -> u32 {
        (self.blocks.len() - 1) as u32
    }

    fn add_outputs(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for (vout, txout) in tx.output.iter().enumerate() {
            self.outputs
                .insert(OutPoint::new(txid, vout as u32), Output { txout: txout.clone(), spent_by: None });
        }
    }

    fn validate(&self, tx: &Transaction) -> Result<(), ChainError> {
        let next_height = self.tip() + 1;
        let mut input_value = Amount::ZERO;
        for input in &tx.input {
            let prev = self
                .outputs
                .get(&input.previous_output)
                .ok_or_else(|| ChainError::Rejected(format!("missing-inputs {}", input.previous_output)))?;
            if let Some(spender) = prev.spent_by {
                return Err(ChainError::Rejected(format!("txn-mempool-conflict with {}", spender)));
            }
            input_value += prev.txout.value;

            if tx.version >= Version::TWO {
                if let Some(relative::LockTime::Blocks(h)) = input.sequence.to_relative_lock_time() {
                    let confirmed = self.txs.get(&input.previous_output.txid).and_then(|(_, h)| *h);
                    match confirmed {
                        _ if h.value() == 0 => {}
                        Some(c) if c + h.value() as u32 <= next_height => {}
                        _ => return Err(ChainError::Rejected("non-BIP68-final".into())),
                    }
                }
            }
        }

        if let LockTime::Blocks(h) = tx.lock_time {
            let enabled = tx.input.iter().any(|i| i.sequence != Sequence::MAX);
            if enabled && h.to_consensus_u32() >= next_height {
                return Err(ChainError::Rejected("non-final".into()));
            }
        }

        let output_value: Amount = tx.output.iter().map(|o| o.value).sum();
        if output_value > input_value {
            return Err(ChainError::Rejected("bad-txns-in-belowout".into()));
        }
        Ok(())
    }

    fn accept(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for input in &tx.input {
            if let Some(prev) = self.outputs.get_mut(&input.previous_output) {
                prev.spent_by = Some(txid);
            }
        }
        self.add_outputs(tx);
        self.txs.insert(txid, (tx.clone(), None));
        self.mempool.push(tx.clone());
    }
}

/// Regtest chain living in memory, shared through an `Arc`.
pub struct MockChain {
    state: Mutex<State>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let genesis = genesis_block(bitcoin::Network::Regtest);
        Self {
            state: Mutex::new(State {
                blocks: vec![genesis],
                mempool: Vec::new(),
                txs: HashMap::new(),
                outputs: HashMap::new(),
                fund_counter: 0,
                fee_rate: FeeRate::from_sat_per_vb(2),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, ChainError> {
        self.state.lock().map_err(|_| ChainError::Transport("mock chain lock poisoned".into()))
    }

    pub fn height(&self) -> u32 {
        self.lock().map(|s| s.tip()).unwrap_or(0)
    }

    /// Mine `n` blocks, each confirming the whole mempool in broadcast order.
    pub fn mine(&self, n: u32) -> Result<Vec<BlockHash>, ChainError> {
        let mut state = self.lock()?;
        let mut hashes = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let height = state.tip() + 1;
            let coinbase = Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    script_sig: Builder::new().push_int(height as i64).push_slice(b"mock").into_script(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                }],
                output: vec![TxOut {
                    value: Amount::ZERO,
                    script_pubkey: Builder::new().push_opcode(OP_RETURN).into_script(),
                }],
            };
            let mut txdata = vec![coinbase];
            txdata.append(&mut state.mempool);

            let prev = &state.blocks[state.blocks.len() - 1];
            let mut block = Block {
                header: Header {
                    version: BlockVersion::TWO,
                    prev_blockhash: prev.block_hash(),
                    merkle_root: TxMerkleNode::all_zeros(),
                    time: prev.header.time + BLOCK_INTERVAL_SECS,
                    bits: CompactTarget::from_consensus(REGTEST_BITS),
                    nonce: height,
                },
                txdata,
            };
            if let Some(root) = block.compute_merkle_root() {
                block.header.merkle_root = root;
            }
            for tx in &block.txdata {
                let txid = tx.compute_txid();
                state.txs.insert(txid, (tx.clone(), Some(height)));
            }
            hashes.push(block.block_hash());
            state.blocks.push(block);
        }
        info!(blocks = n, tip = state.tip(), "Mined");
        Ok(hashes)
    }

    /// Pay `amount` to `script_pubkey` from outside the wallet world. The
    /// funding tx sits in the mempool until the next [MockChain::mine].
    pub fn fund(&self, script_pubkey: ScriptBuf, amount: Amount) -> Result<OutPoint, ChainError> {
        let mut state = self.lock()?;
        state.fund_counter += 1;
        let faucet = sha256::Hash::hash(&state.fund_counter.to_be_bytes());
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array(faucet.to_byte_array()), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: amount, script_pubkey }],
        };
        let txid = tx.compute_txid();
        state.add_outputs(&tx);
        state.txs.insert(txid, (tx.clone(), None));
        state.mempool.push(tx);
        debug!(%txid, %amount, "Faucet funded");
        Ok(OutPoint::new(txid, 0))
    }

    pub fn set_fee_rate(&self, fee_rate: Option<FeeRate>) {
        if let Ok(mut state) = self.lock() {
            state.fee_rate = fee_rate;
        }
    }

    pub fn get_tx(&self, txid: &Txid) -> Option<Transaction> {
        self.lock().ok()?.txs.get(txid).map(|(tx, _)| tx.clone())
    }

    pub fn txout(&self, point: &OutPoint) -> Option<TxOut> {
        self.lock().ok()?.outputs.get(point).map(|o| o.txout.clone())
    }

    /// Txid of the transaction spending `point`, if any.
    pub fn spender(&self, point: &OutPoint) -> Option<Txid> {
        self.lock().ok()?.outputs.get(point).and_then(|o| o.spent_by)
    }

    pub fn in_mempool(&self, txid: &Txid) -> bool {
        self.lock().map(|s| s.mempool.iter().any(|tx| tx.compute_txid() == *txid)).unwrap_or(false)
    }
}

impl ChainSource for MockChain {
    fn tip(&self) -> Result<u32, ChainError> {
        Ok(self.lock()?.tip())
    }

    fn block_hash(&self, height: u32) -> Result<BlockHash, ChainError> {
        self.lock()?
            .blocks
            .get(height as usize)
            .map(|b| b.block_hash())
            .ok_or_else(|| ChainError::NotFound(format!("block at height {}", height)))
    }

    fn block(&self, hash: &BlockHash) -> Result<Block, ChainError> {
        self.lock()?
            .blocks
            .iter()
            .find(|b| b.block_hash() == *hash)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("block {}", hash)))
    }

    fn tx_status(&self, txid: &Txid) -> Result<TxStatus, ChainError> {
        let state = self.lock()?;
        Ok(match state.txs.get(txid) {
            None => TxStatus::Unknown,
            Some((_, None)) => TxStatus::Mempool,
            Some((_, Some(height))) => TxStatus::Confirmed {
                height: *height,
                block_hash: state.blocks[*height as usize].block_hash(),
            },
        })
    }

    fn broadcast(&self, tx: &Transaction) -> Result<(), ChainError> {
        let mut state = self.lock()?;
        let txid = tx.compute_txid();
        if state.txs.contains_key(&txid) {
            return Ok(());
        }
        state.validate(tx)?;
        state.accept(tx);
        debug!(%txid, "Accepted into mock mempool");
        Ok(())
    }

    fn broadcast_package(&self, txs: &[Transaction]) -> Result<(), ChainError> {
        // All or nothing: validate each against the state the previous ones create
        let mut state = self.lock()?;
        let snapshot_len = state.mempool.len();
        let mut accepted = Vec::new();
        for tx in txs {
            let txid = tx.compute_txid();
            if state.txs.contains_key(&txid) {
                continue;
            }
            if let Err(e) = state.validate(tx) {
                for (done, _) in accepted.iter().rev() {
                    undo(&mut *state, done);
                }
                state.mempool.truncate(snapshot_len);
                return Err(e);
            }
            state.accept(tx);
            accepted.push((tx.clone(), txid));
        }
        Ok(())
    }

    fn mempool(&self) -> Result<Vec<Transaction>, ChainError> {
        Ok(self.lock()?.mempool.clone())
    }

    fn fee_rate_estimate(&self, _target_blocks: u16) -> Result<Option<FeeRate>, ChainError> {
        Ok(self.lock()?.fee_rate)
    }
}

fn undo(state: &mut State, tx: &Transaction) {
    let txid = tx.compute_txid();
    for input in &tx.input {
        if let Some(prev) = state.outputs.get_mut(&input.previous_output) {
            prev.spent_by = None;
        }
    }
    for vout in 0..tx.output.len() {
        state.outputs.remove(&OutPoint::new(txid, vout as u32));
    }
    state.txs.remove(&txid);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(prev: OutPoint, value: u64, sequence: Sequence) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn { previous_output: prev, script_sig: ScriptBuf::new(), sequence, witness: Witness::new() }],
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn test_genesis_and_mine() {
        let chain = MockChain::new();
        assert_eq!(chain.tip().unwrap(), 0);
        assert_eq!(chain.block_hash(0).unwrap(), genesis_block(bitcoin::Network::Regtest).block_hash());
        chain.mine(3).unwrap();
        assert_eq!(chain.tip().unwrap(), 3);
        let block = chain.block(&chain.block_hash(3).unwrap()).unwrap();
        assert_eq!(block.header.prev_blockhash, chain.block_hash(2).unwrap());
        assert!(block.check_merkle_root());
    }

    #[test]
    fn test_fund_and_confirm() {
        let chain = MockChain::new();
        let point = chain.fund(ScriptBuf::new(), Amount::from_sat(1000)).unwrap();
        assert_eq!(chain.tx_status(&point.txid).unwrap(), TxStatus::Mempool);
        chain.mine(1).unwrap();
        assert_eq!(chain.tx_status(&point.txid).unwrap().confirmed_height(), Some(1));
        assert_eq!(chain.tx_status(&Txid::all_zeros()).unwrap(), TxStatus::Unknown);
    }

    #[test]
    fn test_double_spend_rejected() {
        let chain = MockChain::new();
        let point = chain.fund(ScriptBuf::new(), Amount::from_sat(1000)).unwrap();
        chain.broadcast(&spend(point, 900, Sequence::MAX)).unwrap();
        let err = chain.broadcast(&spend(point, 800, Sequence::MAX)).unwrap_err();
        assert!(matches!(err, ChainError::Rejected(_)));
        assert!(chain.broadcast(&spend(point, 900, Sequence::MAX)).is_ok());
    }

    #[test]
    fn test_value_and_missing_inputs() {
        let chain = MockChain::new();
        let point = chain.fund(ScriptBuf::new(), Amount::from_sat(1000)).unwrap();
        assert!(chain.broadcast(&spend(point, 1001, Sequence::MAX)).is_err());
        assert!(chain.broadcast(&spend(OutPoint::new(Txid::all_zeros(), 5), 1, Sequence::MAX)).is_err());
    }

    #[test]
    fn test_relative_timelock() {
        let chain = MockChain::new();
        let point = chain.fund(ScriptBuf::new(), Amount::from_sat(1000)).unwrap();
        chain.mine(1).unwrap();
        let tx = spend(point, 900, Sequence::from_height(5));
        assert!(chain.broadcast(&tx).is_err());
        chain.mine(3).unwrap();
        // confirmed at 1, tip 4: next block 5 < 6
        assert!(chain.broadcast(&tx).is_err());
        chain.mine(1).unwrap();
        assert!(chain.broadcast(&tx).is_ok());
    }

    #[test]
    fn test_package_is_atomic() {
        let chain = MockChain::new();
        let point = chain.fund(ScriptBuf::new(), Amount::from_sat(1000)).unwrap();
        let parent = spend(point, 900, Sequence::MAX);
        let child = spend(OutPoint::new(parent.compute_txid(), 0), 2000, Sequence::MAX);
        assert!(chain.broadcast_package(&[parent.clone(), child]).is_err());
        assert_eq!(chain.tx_status(&parent.compute_txid()).unwrap(), TxStatus::Unknown);
        assert_eq!(chain.spender(&point), None);

        let child = spend(OutPoint::new(parent.compute_txid(), 0), 800, Sequence::MAX);
        chain.broadcast_package(&[parent.clone(), child]).unwrap();
        assert_eq!(chain.spender(&point), Some(parent.compute_txid()));
    }
}
