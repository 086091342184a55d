//! Kani formal verification harnesses for percolator-view.
//!
//! Run with: `cargo kani --tests`
//!
//! These harnesses prove properties of the pure quote and layout math:
//! - Bid never above the oracle price, ask never below it
//! - Credibility spread always inside [1, max_bps], zero ceiling rejected
//! - Coverage never exceeds 100%
//! - Record capacity never exceeds the bitmap and always fits the buffer
//! - Signed 128-bit word split is lossless
//!
//! Note: byte-level decoding of whole slabs is NOT modeled.

#![cfg(kani)]

extern crate kani;

use percolator_view::aggregate::effective_spread_bps;
use percolator_view::constants::{ACCOUNTS_OFF, ACCOUNT_LEN, BPS, MAX_ACCOUNTS};
use percolator_view::matcher::{CredibilitySnapshot, MatcherParams};
use percolator_view::pricing::{ask_price, bid_price, coverage_bps, credibility_spread_bps};
use percolator_view::state::max_valid_index;
use percolator_view::wide::{compose_i128, split_i128};

// =============================================================================
// Price bounds
// =============================================================================

#[kani::proof]
fn kani_bid_never_above_oracle() {
    let oracle: u64 = kani::any();
    let edge: u64 = kani::any();
    assert!(bid_price(oracle, edge) <= oracle);
}

#[kani::proof]
fn kani_ask_never_below_oracle() {
    let oracle: u64 = kani::any();
    let edge: u64 = kani::any();
    assert!(ask_price(oracle, edge) >= oracle);
}

#[kani::proof]
fn kani_zero_edge_is_oracle() {
    let oracle: u64 = kani::any();
    assert_eq!(bid_price(oracle, 0), oracle);
    assert_eq!(ask_price(oracle, 0), oracle);
}

// =============================================================================
// Credibility
// =============================================================================

#[kani::proof]
fn kani_coverage_capped() {
    let insurance: u128 = kani::any();
    let oi: u128 = kani::any();
    let cov = coverage_bps(insurance, oi);
    assert!(cov <= BPS);
    if oi == 0 {
        assert_eq!(cov, 0);
    }
}

#[kani::proof]
fn kani_credibility_spread_clamped() {
    let params = MatcherParams {
        fee_bps: kani::any(),
        spread_bps: kani::any(),
        max_bps: kani::any(),
        impact_k_bps: kani::any(),
        liquidity_notional_e6: kani::any(),
        max_fill_abs: 0,
        max_inventory_abs: 0,
    };
    let snapshot = CredibilitySnapshot {
        insurance_balance: kani::any(),
        total_open_interest: kani::any(),
        insurance_weight_bps: kani::any(),
        ..CredibilitySnapshot::default()
    };
    kani::assume(snapshot.insurance_weight_bps <= BPS as u32);
    let inventory: i128 = kani::any();

    match credibility_spread_bps(&params, inventory, &snapshot) {
        Ok((spread, _, discount)) => {
            assert!(params.max_bps >= 1);
            assert!(spread >= 1);
            assert!(spread <= params.max_bps as u64);
            assert!(discount <= snapshot.insurance_weight_bps as u64);
        }
        Err(_) => assert_eq!(params.max_bps, 0),
    }
}

// =============================================================================
// Layout
// =============================================================================

#[kani::proof]
fn kani_max_valid_index_fits_buffer() {
    let len: usize = kani::any();
    kani::assume(len <= usize::MAX / 2);
    let n = max_valid_index(len);
    assert!(n <= MAX_ACCOUNTS);
    if n > 0 {
        assert!(ACCOUNTS_OFF + n * ACCOUNT_LEN <= len);
    }
}

#[kani::proof]
fn kani_i128_split_lossless() {
    let v: i128 = kani::any();
    let (lo, hi) = split_i128(v);
    assert_eq!(compose_i128(lo, hi), v);
}

#[kani::proof]
fn kani_effective_spread_sign() {
    let bid: u64 = kani::any();
    let ask: u64 = kani::any();
    let oracle: u64 = kani::any();
    kani::assume(oracle > 0);
    let s = effective_spread_bps(bid, ask, oracle);
    if ask > bid {
        assert!(s > 0);
    } else if ask < bid {
        assert!(s < 0);
    } else {
        assert_eq!(s, 0);
    }
}
