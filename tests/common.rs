#![allow(unused)]
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute::LockTime, transaction, Address, Amount, Block, BlockHash, CompactTarget, Network,
    OutPoint, Script, ScriptBuf, Transaction, TxIn, TxMerkleNode, TxOut, Txid,
};

use hdwallet::blockchain::{ChainQuery, NodeApi, StaticFeeRate};
use hdwallet::database::{BatchDatabase, BatchOperations, Database, MemoryDatabase};
use hdwallet::signer::Bip32KeyManager;
use hdwallet::*;

/// In-memory view of a chain, blocks are indexed by height in `best`
#[derive(Debug)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

#[derive(Debug)]
struct ChainState {
    best: Vec<BlockHash>,
    heights: HashMap<BlockHash, u32>,
    history: HashSet<ScriptBuf>,
    history_delay: Duration,
    nonce: u32,
}

impl MockChain {
    pub fn new() -> Self {
        let genesis = BlockHash::all_zeros();
        MockChain {
            state: Mutex::new(ChainState {
                best: vec![genesis],
                heights: vec![(genesis, 0)].into_iter().collect(),
                history: HashSet::new(),
                history_delay: Duration::ZERO,
                nonce: 0,
            }),
        }
    }

    /// Append a block with `txdata` to the best chain
    pub fn mine(&self, txdata: Vec<Transaction>) -> Block {
        let mut state = self.state.lock().unwrap();
        state.nonce += 1;
        let height = state.best.len() as u32;
        let block = Block {
            header: Header {
                version: BlockVersion::ONE,
                prev_blockhash: *state.best.last().unwrap(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: height,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: state.nonce,
            },
            txdata,
        };
        let hash = block.block_hash();
        state.best.push(hash);
        state.heights.insert(hash, height);

        block
    }

    /// Mine `count` empty blocks
    pub fn mine_empty(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine(vec![])).collect()
    }

    /// Drop the last `depth` blocks from the best chain, they stay known at their height
    pub fn disconnect(&self, depth: usize) {
        let mut state = self.state.lock().unwrap();
        let len = state.best.len();
        state.best.truncate(len - depth);
    }

    pub fn tip(&self) -> u32 {
        self.state.lock().unwrap().best.len() as u32 - 1
    }

    pub fn add_history(&self, script: &Script) {
        self.state
            .lock()
            .unwrap()
            .history
            .insert(script.to_owned());
    }

    /// Make every `has_history` call sleep for `delay`
    pub fn set_history_delay(&self, delay: Duration) {
        self.state.lock().unwrap().history_delay = delay;
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn get_best_height(&self) -> Result<u32, Error> {
        Ok(self.tip())
    }

    async fn get_block_height(&self, hash: &BlockHash) -> Result<Option<u32>, Error> {
        Ok(self.state.lock().unwrap().heights.get(hash).copied())
    }

    async fn is_in_best_chain(&self, hash: &BlockHash) -> Result<bool, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .heights
            .get(hash)
            .and_then(|height| state.best.get(*height as usize))
            == Some(hash))
    }

    async fn has_history(&self, script: &Script) -> Result<bool, Error> {
        let (delay, found) = {
            let state = self.state.lock().unwrap();
            (state.history_delay, state.history.contains(script))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(found)
    }
}

/// A node that records what it's asked to broadcast
#[derive(Debug, Default)]
pub struct MockNode {
    broadcasts: Mutex<Vec<Transaction>>,
    attempts: AtomicU32,
    fail: AtomicBool,
}

impl MockNode {
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeApi for MockNode {
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<(), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Generic("node unreachable".into()));
        }
        self.broadcasts.lock().unwrap().push(tx.clone());

        Ok(())
    }
}

/// A [`MemoryDatabase`] whose batches writing a transaction can be made to fail
#[derive(Debug, Default)]
pub struct FlakyDatabase {
    inner: MemoryDatabase,
    fail_tx_writes: Arc<AtomicBool>,
}

impl FlakyDatabase {
    /// Return the database and the switch that makes its transaction writes fail
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let database = FlakyDatabase::default();
        let switch = database.fail_tx_writes.clone();
        (database, switch)
    }
}

impl BatchOperations for FlakyDatabase {
    fn set_account(&mut self, account: &AccountRecord) -> Result<(), Error> {
        self.inner.set_account(account)
    }
    fn set_address(&mut self, address: &AddressRecord) -> Result<(), Error> {
        self.inner.set_address(address)
    }
    fn set_utxo(&mut self, utxo: &SpendingInfo) -> Result<(), Error> {
        self.inner.set_utxo(utxo)
    }
    fn set_tx(&mut self, transaction: &TransactionRecord) -> Result<(), Error> {
        self.inner.set_tx(transaction)
    }
    fn set_last_index(
        &mut self,
        account: &HdAccount,
        chain: ChainType,
        value: u32,
    ) -> Result<(), Error> {
        self.inner.set_last_index(account, chain, value)
    }
    fn set_address_tag(&mut self, script: &Script, tag: &AddressTag) -> Result<(), Error> {
        self.inner.set_address_tag(script, tag)
    }
    fn del_utxo(&mut self, outpoint: &OutPoint) -> Result<Option<SpendingInfo>, Error> {
        self.inner.del_utxo(outpoint)
    }
    fn del_tx(&mut self, txid: &Txid) -> Result<Option<TransactionRecord>, Error> {
        self.inner.del_tx(txid)
    }
    fn del_address_tag(
        &mut self,
        script: &Script,
        name: &str,
    ) -> Result<Option<AddressTag>, Error> {
        self.inner.del_address_tag(script, name)
    }
}

impl Database for FlakyDatabase {
    fn get_account(&self, account: &HdAccount) -> Result<Option<AccountRecord>, Error> {
        self.inner.get_account(account)
    }
    fn get_address(
        &self,
        account: &HdAccount,
        chain: ChainType,
        index: u32,
    ) -> Result<Option<AddressRecord>, Error> {
        self.inner.get_address(account, chain, index)
    }
    fn get_address_by_script(&self, script: &Script) -> Result<Option<AddressRecord>, Error> {
        self.inner.get_address_by_script(script)
    }
    fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<SpendingInfo>, Error> {
        self.inner.get_utxo(outpoint)
    }
    fn get_tx(&self, txid: &Txid) -> Result<Option<TransactionRecord>, Error> {
        self.inner.get_tx(txid)
    }
    fn get_last_index(&self, account: &HdAccount, chain: ChainType) -> Result<Option<u32>, Error> {
        self.inner.get_last_index(account, chain)
    }
    fn iter_accounts(&self) -> Result<Vec<AccountRecord>, Error> {
        self.inner.iter_accounts()
    }
    fn iter_addresses(&self, account: Option<&HdAccount>) -> Result<Vec<AddressRecord>, Error> {
        self.inner.iter_addresses(account)
    }
    fn iter_utxos(&self) -> Result<Vec<SpendingInfo>, Error> {
        self.inner.iter_utxos()
    }
    fn iter_txs(&self) -> Result<Vec<TransactionRecord>, Error> {
        self.inner.iter_txs()
    }
    fn iter_address_tags(&self, script: &Script) -> Result<Vec<AddressTag>, Error> {
        self.inner.iter_address_tags(script)
    }
    fn increment_utxo_id(&mut self) -> Result<u64, Error> {
        self.inner.increment_utxo_id()
    }
}

impl BatchDatabase for FlakyDatabase {
    type Batch = MemoryDatabase;

    fn begin_batch(&self) -> Self::Batch {
        self.inner.begin_batch()
    }

    fn commit_batch(&mut self, batch: Self::Batch) -> Result<(), Error> {
        if self.fail_tx_writes.load(Ordering::SeqCst) && !batch.iter_txs()?.is_empty() {
            return Err(Error::Generic("disk full".into()));
        }
        self.inner.commit_batch(batch)
    }
}

pub struct TestWallet<D = MemoryDatabase> {
    pub wallet: Arc<Wallet<D>>,
    pub chain: Arc<MockChain>,
    pub node: Arc<MockNode>,
}

impl<D> TestWallet<D>
where
    D: BatchDatabase + Send + 'static,
{
    /// Pay `amounts` to new receiving addresses from a foreign transaction, optionally mined
    pub async fn receive(&self, amounts: &[u64], confirmed: bool) -> Transaction {
        let mut outputs = Vec::new();
        for amount in amounts {
            let address = self.wallet.get_new_address().await.unwrap();
            outputs.push(TxOut {
                value: Amount::from_sat(*amount),
                script_pubkey: address.script_pubkey(),
            });
        }
        let tx = foreign_tx(outputs);

        if confirmed {
            let block = self.chain.mine(vec![tx.clone()]);
            self.wallet.process_block(&block).await.unwrap();
        } else {
            self.wallet.process_transaction(&tx, None).await.unwrap();
        }

        tx
    }

    /// Mine `txs` and feed the block to the wallet
    pub async fn mine(&self, txs: Vec<Transaction>) -> Block {
        let block = self.chain.mine(txs);
        self.wallet.process_block(&block).await.unwrap();
        block
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> WalletConfig {
    WalletConfig {
        network: Network::Regtest,
        ..Default::default()
    }
}

pub async fn get_wallet_with_config(config: WalletConfig) -> TestWallet {
    get_wallet_with_database(config, MemoryDatabase::new()).await
}

pub async fn get_wallet_with_database<D>(config: WalletConfig, database: D) -> TestWallet<D>
where
    D: BatchDatabase + Send + 'static,
{
    init_logger();

    let keys = Bip32KeyManager::new(config.network, &[7; 32]).unwrap();
    let chain = Arc::new(MockChain::new());
    let node = Arc::new(MockNode::default());
    let wallet = Wallet::new(
        config,
        database,
        Arc::new(keys),
        chain.clone(),
        node.clone(),
        Arc::new(StaticFeeRate(FeeRate::from_sat_per_vb(1.0))),
    )
    .await
    .unwrap();

    TestWallet {
        wallet: Arc::new(wallet),
        chain,
        node,
    }
}

pub async fn get_wallet() -> TestWallet {
    get_wallet_with_config(test_config()).await
}

/// Return a wallet with one confirmed output per amount
pub async fn get_funded_wallet(amounts: &[u64]) -> TestWallet {
    let test = get_wallet().await;
    test.receive(amounts, true).await;
    test
}

static FOREIGN_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A transaction spending an output the wallet doesn't know about
pub fn foreign_tx(output: Vec<TxOut>) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: FOREIGN_COUNTER.fetch_add(1, Ordering::SeqCst),
            },
            ..Default::default()
        }],
        output,
    }
}

pub fn foreign_address() -> Address {
    Address::from_str("bcrt1q3qtze4ys45tgdvguj66zrk4fu6hq3a3v9pfly5")
        .unwrap()
        .require_network(Network::Regtest)
        .unwrap()
}
