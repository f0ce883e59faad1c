use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Transaction, Txid};

use hdwallet::wallet::fee_bump::FeeBumpStrategy;
use hdwallet::*;

mod common;
use common::*;

async fn fee_of(test: &TestWallet, tx: &Transaction) -> u64 {
    test.wallet
        .find_transaction(&tx.compute_txid())
        .await
        .unwrap()
        .unwrap()
        .fee
        .unwrap()
}

async fn send(test: &TestWallet, sat_vb: f32) -> Transaction {
    test.wallet
        .send_to_address(
            &foreign_address(),
            Amount::from_sat(30_000),
            Some(FeeRate::from_sat_per_vb(sat_vb)),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_bump_fee_rbf() {
    let test = get_funded_wallet(&[100_000]).await;
    let original = send(&test, 5.0).await;
    let txid = original.compute_txid();

    assert_matches!(
        test.wallet
            .bump_fee_rbf(&txid, FeeRate::from_sat_per_vb(4.0))
            .await,
        Err(Error::FeeRateTooLow { .. })
    );
    assert_matches!(
        test.wallet
            .bump_fee_rbf(&txid, FeeRate::from_sat_per_vb(5.0))
            .await,
        Err(Error::FeeRateTooLow { .. })
    );

    let replacement = test
        .wallet
        .bump_fee(&txid, FeeRate::from_sat_per_vb(10.0), FeeBumpStrategy::ReplaceByFee)
        .await
        .unwrap();

    let spent = |tx: &Transaction| {
        tx.input
            .iter()
            .map(|txin| txin.previous_output)
            .collect::<Vec<_>>()
    };
    assert_eq!(spent(&replacement), spent(&original));
    assert_eq!(replacement.output.len(), original.output.len());
    let new_fee = fee_of(&test, &replacement).await;
    assert!(new_fee > fee_of(&test, &original).await);
    assert!(new_fee >= replacement.vsize() as u64 * 10);
    // the recipient is paid the same amount
    assert!(replacement
        .output
        .iter()
        .any(|o| o.script_pubkey == foreign_address().script_pubkey()
            && o.value == Amount::from_sat(30_000)));

    let record = test.wallet.find_transaction(&txid).await.unwrap().unwrap();
    assert_eq!(record.replaced_by, Some(replacement.compute_txid()));
    assert_eq!(
        test.wallet.list_pending_transactions().await.unwrap(),
        vec![replacement.clone()]
    );
    assert_eq!(test.node.broadcasts().len(), 2);

    // the original can't be bumped anymore, the replacement can
    assert_matches!(
        test.wallet
            .bump_fee_rbf(&txid, FeeRate::from_sat_per_vb(20.0))
            .await,
        Err(Error::TransactionNotPending(_))
    );
    test.wallet
        .bump_fee_rbf(&replacement.compute_txid(), FeeRate::from_sat_per_vb(20.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bump_fee_rbf_without_change() {
    let test = get_funded_wallet(&[50_000]).await;
    let sweep = test
        .wallet
        .sweep_wallet(&foreign_address(), Some(FeeRate::from_sat_per_vb(2.0)))
        .await
        .unwrap();
    let old_value = sweep.output[0].value;

    let replacement = test
        .wallet
        .bump_fee_rbf(&sweep.compute_txid(), FeeRate::from_sat_per_vb(8.0))
        .await
        .unwrap();

    assert_eq!(replacement.output.len(), 1);
    assert!(replacement.output[0].value < old_value);
    assert_eq!(
        replacement.output[0].value.to_sat() + fee_of(&test, &replacement).await,
        50_000
    );
}

#[tokio::test]
async fn test_bump_fee_rbf_incoming() {
    let test = get_wallet().await;
    let incoming = test.receive(&[50_000], false).await;

    assert_matches!(
        test.wallet
            .bump_fee_rbf(&incoming.compute_txid(), FeeRate::from_sat_per_vb(10.0))
            .await,
        Err(Error::IrreplaceableTransaction(_))
    );
}

#[tokio::test]
async fn test_bump_fee_cpfp() {
    let test = get_funded_wallet(&[100_000]).await;
    let parent = send(&test, 1.0).await;
    let parent_fee = fee_of(&test, &parent).await;

    let child = test
        .wallet
        .bump_fee(
            &parent.compute_txid(),
            FeeRate::from_sat_per_vb(10.0),
            FeeBumpStrategy::ChildPaysForParent,
        )
        .await
        .unwrap();

    assert_eq!(child.input.len(), 1);
    assert_eq!(child.input[0].previous_output.txid, parent.compute_txid());
    let spent = &parent.output[child.input[0].previous_output.vout as usize];
    assert!(test.wallet.is_change(spent).await.unwrap());
    assert_eq!(child.output.len(), 1);
    assert!(test.wallet.is_change(&child.output[0]).await.unwrap());

    let child_fee = fee_of(&test, &child).await;
    let package_vsize = (parent.vsize() + child.vsize()) as u64;
    assert!(parent_fee + child_fee >= package_vsize * 10);

    let pending = test.wallet.list_pending_transactions().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.contains(&child));
}

#[tokio::test]
async fn test_bump_fee_cpfp_prefers_change() {
    let test = get_funded_wallet(&[100_000]).await;
    // the payment to ourselves is larger than the change
    let own = test.wallet.get_new_address().await.unwrap();
    let parent = test
        .wallet
        .send_to_address(&own, Amount::from_sat(80_000), Some(FeeRate::from_sat_per_vb(1.0)))
        .await
        .unwrap();

    let child = test
        .wallet
        .bump_fee_cpfp(&parent.compute_txid(), FeeRate::from_sat_per_vb(5.0))
        .await
        .unwrap();

    let spent = &parent.output[child.input[0].previous_output.vout as usize];
    assert!(spent.value < Amount::from_sat(80_000));
    assert!(test.wallet.is_change(spent).await.unwrap());
}

#[tokio::test]
async fn test_rbf_of_parent_replaces_cpfp_child() {
    let test = get_funded_wallet(&[100_000]).await;
    let parent = send(&test, 1.0).await;
    let child = test
        .wallet
        .bump_fee_cpfp(&parent.compute_txid(), FeeRate::from_sat_per_vb(5.0))
        .await
        .unwrap();

    let replacement = test
        .wallet
        .bump_fee_rbf(&parent.compute_txid(), FeeRate::from_sat_per_vb(20.0))
        .await
        .unwrap();
    let replacement_txid = replacement.compute_txid();

    for txid in [parent.compute_txid(), child.compute_txid()] {
        let record = test.wallet.find_transaction(&txid).await.unwrap().unwrap();
        assert_eq!(record.replaced_by, Some(replacement_txid));
    }
    assert_eq!(
        test.wallet.list_pending_transactions().await.unwrap(),
        vec![replacement.clone()]
    );
    // nothing created by the parent or the child is left in the ledger
    assert!(test
        .wallet
        .list_utxos()
        .await
        .unwrap()
        .iter()
        .all(|u| u.outpoint.txid != parent.compute_txid()
            && u.outpoint.txid != child.compute_txid()));

    let fee = fee_of(&test, &replacement).await;
    assert_eq!(
        test.wallet.get_balance(None).await.unwrap().total(),
        Amount::from_sat(100_000 - 30_000 - fee)
    );
    // the child can't be bumped anymore
    assert_matches!(
        test.wallet
            .bump_fee_cpfp(&child.compute_txid(), FeeRate::from_sat_per_vb(30.0))
            .await,
        Err(Error::TransactionNotPending(_))
    );
}

#[tokio::test]
async fn test_bump_fee_cpfp_unreserves_on_failure() {
    let (database, fail_tx_writes) = FlakyDatabase::new();
    let test = get_wallet_with_database(test_config(), database).await;
    let incoming = test.receive(&[50_000], false).await;
    let outpoint = OutPoint::new(incoming.compute_txid(), 0);

    fail_tx_writes.store(true, Ordering::SeqCst);
    assert_matches!(
        test.wallet
            .bump_fee_cpfp(&incoming.compute_txid(), FeeRate::from_sat_per_vb(5.0))
            .await,
        Err(Error::Generic(_))
    );

    assert!(test.node.broadcasts().is_empty());
    let utxo = test.wallet.utxos_for_outpoints(&[outpoint]).await.unwrap()[0].clone();
    assert_eq!(utxo.state, TxoState::Unconfirmed);
    assert_eq!(utxo.spending_txid, None);

    fail_tx_writes.store(false, Ordering::SeqCst);
    let child = test
        .wallet
        .bump_fee_cpfp(&incoming.compute_txid(), FeeRate::from_sat_per_vb(5.0))
        .await
        .unwrap();
    assert_eq!(test.node.broadcasts(), vec![child]);
}

#[tokio::test]
async fn test_bump_fee_cpfp_incoming() {
    let test = get_wallet().await;
    let incoming = test.receive(&[50_000], false).await;

    let child = test
        .wallet
        .bump_fee_cpfp(&incoming.compute_txid(), FeeRate::from_sat_per_vb(5.0))
        .await
        .unwrap();

    // the parent fee is unknown, the child pays for the whole package
    let child_fee = fee_of(&test, &child).await;
    assert!(child_fee >= (incoming.vsize() + child.vsize()) as u64 * 5);
}

#[tokio::test]
async fn test_bump_fee_cpfp_no_spendable_output() {
    let test = get_funded_wallet(&[100_000]).await;
    let sweep = test
        .wallet
        .sweep_wallet(&foreign_address(), None)
        .await
        .unwrap();

    assert_matches!(
        test.wallet
            .bump_fee_cpfp(&sweep.compute_txid(), FeeRate::from_sat_per_vb(10.0))
            .await,
        Err(Error::NoSpendableChildOutput(txid)) if txid == sweep.compute_txid()
    );
}

#[tokio::test]
async fn test_bump_fee_confirmed() {
    let test = get_funded_wallet(&[100_000]).await;
    let tx = send(&test, 2.0).await;
    test.mine(vec![tx.clone()]).await;

    for strategy in [
        FeeBumpStrategy::ReplaceByFee,
        FeeBumpStrategy::ChildPaysForParent,
    ] {
        assert_matches!(
            test.wallet
                .bump_fee(&tx.compute_txid(), FeeRate::from_sat_per_vb(10.0), strategy)
                .await,
            Err(Error::TransactionNotPending(_))
        );
    }
}

#[tokio::test]
async fn test_bump_fee_unknown_transaction() {
    let test = get_funded_wallet(&[100_000]).await;
    let txid = Txid::all_zeros();

    assert_matches!(
        test.wallet
            .bump_fee_rbf(&txid, FeeRate::from_sat_per_vb(10.0))
            .await,
        Err(Error::TransactionNotFound(_))
    );
    assert_matches!(
        test.wallet
            .bump_fee_cpfp(&txid, FeeRate::from_sat_per_vb(10.0))
            .await,
        Err(Error::TransactionNotFound(_))
    );
    assert_matches!(
        test.wallet
            .bump_fee_cpfp(&txid, FeeRate::from_sat_per_vb(f32::NAN))
            .await,
        Err(Error::InvalidFeeRate(_))
    );
}
