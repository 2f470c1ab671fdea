mod support {
    pub mod fixtures;
}

use anyhow::{Context as _, Result};

use ln_taproot_swap::network::Currency;
use ln_taproot_swap::swap::store::SqliteSwapStore;
use ln_taproot_swap::swap::{LegSide, SwapState};

use support::fixtures;

#[test]
fn sqlite_store_insert_get_update_list() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("nested").join("swaps.sqlite3");

    let mut store = SqliteSwapStore::open(path.clone()).context("open sqlite store")?;
    assert_eq!(store.schema_version()?, 3);

    let reverse = fixtures::reverse_swap("swap-a", 900_000, 50_000)?;
    store.insert_swap(&reverse.record).context("insert swap-a")?;
    let got = store
        .get_swap("swap-a")
        .context("get swap-a")?
        .context("swap-a missing")?;
    assert_eq!(got, reverse.record);

    store
        .update_status("swap-a", "transaction.mempool")
        .context("update swap-a status")?;
    store.set_invoice("swap-a", "lnbcrt1other").context("set invoice")?;
    let got = store
        .get_swap("swap-a")
        .context("get swap-a after update")?
        .context("swap-a missing after update")?;
    assert_eq!(got.status, "transaction.mempool");
    assert_eq!(got.invoice.as_deref(), Some("lnbcrt1other"));

    let mut submarine = fixtures::submarine_swap("swap-b", 900_000, 50_000)?;
    submarine.record.created_at += 1;
    store.insert_swap(&submarine.record).context("insert swap-b")?;

    let swaps = store.list_swaps().context("list swaps")?;
    assert_eq!(swaps.len(), 2);
    assert_eq!(swaps[0].id, "swap-a");
    assert_eq!(swaps[1].id, "swap-b");
    assert!(swaps[1].to.is_none());

    assert!(store.insert_swap(&submarine.record).is_err());

    let err = store.update_status("missing", "swap.created").unwrap_err();
    assert!(err.to_string().contains("swap not found"));
    let err = store
        .update_state("missing", SwapState::Successful, None)
        .unwrap_err();
    assert!(err.to_string().contains("swap not found"));

    drop(store);
    let store = SqliteSwapStore::open(path).context("reopen sqlite store")?;
    assert_eq!(store.schema_version()?, 3);
    assert_eq!(store.list_swaps()?.len(), 2);
    Ok(())
}

#[test]
fn state_changes_follow_the_transition_table() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteSwapStore::open(dir.path().join("swaps.sqlite3"))?;
    let swap = fixtures::submarine_swap("transitions", 900_000, 50_000)?;
    store.insert_swap(&swap.record)?;

    assert!(store.update_state("transitions", SwapState::Error, Some("lockup lost"))?);
    let got = store.get_swap("transitions")?.context("missing")?;
    assert_eq!(got.state, SwapState::Error);
    assert_eq!(got.error.as_deref(), Some("lockup lost"));

    assert!(!store.update_state("transitions", SwapState::Pending, None)?);
    assert!(store.update_state("transitions", SwapState::ServerError, Some("swap.expired"))?);
    assert!(store.update_state("transitions", SwapState::Refunded, None)?);

    for next in [
        SwapState::Pending,
        SwapState::Successful,
        SwapState::Error,
        SwapState::Abandoned,
    ] {
        assert!(!store.update_state("transitions", next, None)?);
    }
    let got = store.get_swap("transitions")?.context("missing")?;
    assert_eq!(got.state, SwapState::Refunded);
    assert!(got.state.is_final());
    assert!(!SwapState::Error.is_final());
    Ok(())
}

#[test]
fn settlement_is_recorded_once_and_fees_accumulate() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteSwapStore::open(dir.path().join("swaps.sqlite3"))?;
    let swap = fixtures::reverse_swap("settle", 900_000, 50_000)?;
    store.insert_swap(&swap.record)?;

    assert!(store.set_lockup_txid("settle", LegSide::To, "lockup-1")?);
    assert!(!store.set_lockup_txid("settle", LegSide::To, "lockup-2")?);

    assert!(store.set_settlement("settle", LegSide::To, "claim-1", 150)?);
    assert!(!store.set_settlement("settle", LegSide::To, "claim-2", 150)?);
    let got = store.get_swap("settle")?.context("missing")?;
    let leg = got.require_leg(LegSide::To)?;
    assert_eq!(leg.lockup_txid.as_deref(), Some("lockup-1"));
    assert_eq!(leg.settlement_txid.as_deref(), Some("claim-1"));
    assert_eq!(got.onchain_fee, Some(150));

    assert!(store.set_completion_fees("settle", 50, 200)?);
    assert!(!store.set_completion_fees("settle", 50, 200)?);
    let got = store.get_swap("settle")?.context("missing")?;
    assert_eq!(got.service_fee, Some(50));
    assert_eq!(got.onchain_fee, Some(350));
    Ok(())
}

#[test]
fn refundable_and_claimable_queries_select_unsettled_legs() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteSwapStore::open(dir.path().join("swaps.sqlite3"))?;

    let early = fixtures::submarine_swap("refund-early", 800, 50_000)?;
    let late = fixtures::submarine_swap("refund-late", 900, 50_000)?;
    let unfunded = fixtures::submarine_swap("refund-unfunded", 800, 50_000)?;
    let claim = fixtures::reverse_swap("claim", 900_000, 50_000)?;
    for swap in [&early, &late, &unfunded, &claim] {
        store.insert_swap(&swap.record)?;
    }
    store.set_lockup_txid("refund-early", LegSide::From, &early.lockup_txid())?;
    store.set_lockup_txid("refund-late", LegSide::From, &late.lockup_txid())?;

    let ids = |records: Vec<ln_taproot_swap::swap::SwapRecord>| {
        records.into_iter().map(|r| r.id).collect::<Vec<_>>()
    };

    assert_eq!(ids(store.query_refundable(Currency::Btc, 799)?), Vec::<String>::new());
    assert_eq!(ids(store.query_refundable(Currency::Btc, 800)?), vec!["refund-early"]);
    assert_eq!(
        ids(store.query_refundable(Currency::Btc, 900)?),
        vec!["refund-early", "refund-late"]
    );
    assert!(store.query_refundable(Currency::Liquid, 900)?.is_empty());

    assert!(store.query_claimable(Currency::Btc)?.is_empty());
    store.set_lockup_txid("claim", LegSide::To, &claim.lockup_txid())?;
    assert_eq!(ids(store.query_claimable(Currency::Btc)?), vec!["claim"]);

    store.set_settlement("refund-early", LegSide::From, "refund-tx", 100)?;
    store.update_state("refund-late", SwapState::Abandoned, None)?;
    assert!(store.query_refundable(Currency::Btc, 900)?.is_empty());

    assert_eq!(store.query_pending()?.len(), 3);
    assert_eq!(
        ids(store.query_by_states(&[SwapState::Abandoned])?),
        vec!["refund-late"]
    );
    Ok(())
}

#[test]
fn successful_reverse_swaps_stay_claimable_until_settled() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteSwapStore::open(dir.path().join("swaps.sqlite3"))?;

    let reverse = fixtures::reverse_swap("settled-invoice", 900_000, 50_000)?;
    let chain = fixtures::chain_swap("chain-refunded", 900_000, 50_000)?;
    store.insert_swap(&reverse.record)?;
    store.insert_swap(&chain.record)?;
    store.set_lockup_txid("settled-invoice", LegSide::To, &reverse.lockup_txid())?;
    store.set_lockup_txid("chain-refunded", LegSide::To, "server-lockup")?;

    assert!(store.update_state("settled-invoice", SwapState::Successful, None)?);
    assert!(store.update_state("chain-refunded", SwapState::Refunded, None)?);

    let claimable = store.query_claimable(Currency::Btc)?;
    assert_eq!(claimable.len(), 1);
    assert_eq!(claimable[0].id, "settled-invoice");

    store.set_settlement("settled-invoice", LegSide::To, "claim-tx", 120)?;
    assert!(store.query_claimable(Currency::Btc)?.is_empty());
    Ok(())
}

#[test]
fn expected_amount_and_external_pay_persist() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store = SqliteSwapStore::open(dir.path().join("swaps.sqlite3"))?;

    let mut reverse = fixtures::reverse_swap("external", 900_000, 50_000)?;
    reverse.record.external_pay = true;
    store.insert_swap(&reverse.record)?;
    let chain = fixtures::chain_swap("requote", 900_000, 50_000)?;
    store.insert_swap(&chain.record)?;

    store.set_expected_amount("requote", LegSide::To, 48_500)?;
    store.set_expected_amount("requote", LegSide::From, 49_000)?;
    let got = store.get_swap("requote")?.context("missing")?;
    assert_eq!(got.require_leg(LegSide::To)?.expected_amount, 48_500);
    assert_eq!(got.require_leg(LegSide::From)?.expected_amount, 49_000);

    assert!(store.set_expected_amount("external", LegSide::From, 1).is_err());
    assert!(store.get_swap("external")?.context("missing")?.external_pay);
    assert!(!got.external_pay);
    Ok(())
}
