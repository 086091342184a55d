//! Synthetic slab and matcher-context buffers for the integration tests.

#![allow(dead_code)]

use bytemuck::Pod;
use percolator_view::constants::*;
use percolator_view::layout::{AccountRecord, EngineBlock, MarketConfig, SlabHeader};
use percolator_view::wide::{I128, U128};
use solana_program::pubkey::Pubkey;

fn write_pod<T: Pod>(data: &mut [u8], off: usize, v: &T) {
    data[off..off + core::mem::size_of::<T>()].copy_from_slice(bytemuck::bytes_of(v));
}

fn read_pod<T: Pod>(data: &[u8], off: usize) -> T {
    bytemuck::pod_read_unaligned(&data[off..off + core::mem::size_of::<T>()])
}

pub struct SlabBuilder {
    pub data: Vec<u8>,
}

impl SlabBuilder {
    /// Full-size slab with a valid header and everything else zeroed.
    pub fn new() -> Self {
        let mut data = vec![0u8; SLAB_LEN];
        let header = SlabHeader {
            magic: MAGIC,
            version: VERSION,
            bump: 0,
            _padding: [0; 3],
            admin: [7u8; 32],
            _reserved: [0; 16],
        };
        write_pod(&mut data, 0, &header);
        Self { data }
    }

    pub fn header(mut self, f: impl FnOnce(&mut SlabHeader)) -> Self {
        let mut h: SlabHeader = read_pod(&self.data, 0);
        f(&mut h);
        write_pod(&mut self.data, 0, &h);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut MarketConfig)) -> Self {
        let mut c: MarketConfig = read_pod(&self.data, HEADER_LEN);
        f(&mut c);
        write_pod(&mut self.data, HEADER_LEN, &c);
        self
    }

    pub fn engine(mut self, f: impl FnOnce(&mut EngineBlock)) -> Self {
        let mut e: EngineBlock = read_pod(&self.data, ENGINE_OFF);
        f(&mut e);
        write_pod(&mut self.data, ENGINE_OFF, &e);
        self
    }

    /// Allocator counters stored between the bitmap and the records.
    pub fn counters(mut self, num_used: u16, next_account_id: u64, free_head: u16) -> Self {
        self.data[NUM_USED_OFF..NUM_USED_OFF + 2].copy_from_slice(&num_used.to_le_bytes());
        self.data[NEXT_ACCOUNT_ID_OFF..NEXT_ACCOUNT_ID_OFF + 8]
            .copy_from_slice(&next_account_id.to_le_bytes());
        self.data[FREE_HEAD_OFF..FREE_HEAD_OFF + 2].copy_from_slice(&free_head.to_le_bytes());
        self
    }

    pub fn set_used(mut self, idx: usize) -> Self {
        let off = BITMAP_OFF + (idx / 64) * 8;
        let mut w = u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap());
        w |= 1u64 << (idx % 64);
        self.data[off..off + 8].copy_from_slice(&w.to_le_bytes());
        self
    }

    /// Write a record at `idx` and mark the slot used.
    pub fn account(mut self, idx: usize, f: impl FnOnce(&mut AccountRecord)) -> Self {
        let off = ACCOUNTS_OFF + idx * ACCOUNT_LEN;
        let mut a: AccountRecord = read_pod(&self.data, off);
        a.account_id = idx as u64 + 1;
        f(&mut a);
        write_pod(&mut self.data, off, &a);
        self.set_used(idx)
    }

    pub fn user(self, idx: usize, capital: u128) -> Self {
        self.account(idx, |a| {
            a.kind = 0;
            a.capital = U128::new(capital);
            a.owner = [(idx as u8).wrapping_add(1); 32];
        })
    }

    pub fn lp(self, idx: usize, ctx_key: Pubkey, capital: u128) -> Self {
        self.account(idx, |a| {
            a.kind = 1;
            a.capital = U128::new(capital);
            a.matcher_program = [0xAA; 32];
            a.matcher_context = ctx_key.to_bytes();
            a.owner = [idx as u8 + 1; 32];
        })
    }

    pub fn truncated(mut self, len: usize) -> Self {
        self.data.truncate(len);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

pub fn engine_with_insurance(insurance: u128, open_interest: u128) -> impl FnOnce(&mut EngineBlock) {
    move |e| {
        e.insurance_fund.balance = U128::new(insurance);
        e.total_open_interest = U128::new(open_interest);
        e.net_lp_pos = I128::ZERO;
    }
}

/// Field values for a matcher account; `build` lays them out at their
/// context offsets.
#[derive(Clone, Copy, Debug)]
pub struct CtxSpec {
    pub magic: u64,
    pub version: u32,
    pub kind: u8,
    pub lp_pda: [u8; 32],
    pub fee_bps: u32,
    pub spread_bps: u32,
    pub max_bps: u32,
    pub impact_k_bps: u32,
    pub liquidity_notional_e6: u128,
    pub max_fill_abs: u128,
    pub inventory_base: i128,
    pub last_oracle_price_e6: u64,
    pub last_exec_price_e6: u64,
    pub max_inventory_abs: u128,
    pub insurance: u128,
    pub total_oi: u128,
    pub market_age_slots: u64,
    pub last_deficit_slot: u64,
    pub snapshot_slot: u64,
    pub age_halflife_slots: u32,
    pub insurance_weight_bps: u32,
}

impl Default for CtxSpec {
    fn default() -> Self {
        Self {
            magic: MATCHER_MAGIC,
            version: MATCHER_VERSION,
            kind: 0,
            lp_pda: [0x11; 32],
            fee_bps: 0,
            spread_bps: 0,
            max_bps: 0,
            impact_k_bps: 0,
            liquidity_notional_e6: 0,
            max_fill_abs: 0,
            inventory_base: 0,
            last_oracle_price_e6: 0,
            last_exec_price_e6: 0,
            max_inventory_abs: 0,
            insurance: 0,
            total_oi: 0,
            market_age_slots: 0,
            last_deficit_slot: 0,
            snapshot_slot: 0,
            age_halflife_slots: 0,
            insurance_weight_bps: 0,
        }
    }
}

impl CtxSpec {
    pub fn passive(fee_bps: u32, spread_bps: u32) -> Self {
        Self { kind: 0, fee_bps, spread_bps, ..Self::default() }
    }

    pub fn vamm(fee_bps: u32, spread_bps: u32, impact_k_bps: u32, liquidity: u128) -> Self {
        Self {
            kind: 1,
            fee_bps,
            spread_bps,
            impact_k_bps,
            liquidity_notional_e6: liquidity,
            ..Self::default()
        }
    }

    pub fn credibility(min_spread: u32, max_spread: u32, imbalance_k: u32, weight: u32) -> Self {
        Self {
            kind: 2,
            spread_bps: min_spread,
            max_bps: max_spread,
            impact_k_bps: imbalance_k,
            insurance_weight_bps: weight,
            liquidity_notional_e6: 1_000_000_000,
            ..Self::default()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut d = vec![0u8; MATCHER_ACCOUNT_LEN];
        let b = MATCHER_CTX_BASE;
        let mut put = |off: usize, bytes: &[u8]| {
            d[b + off..b + off + bytes.len()].copy_from_slice(bytes);
        };
        put(CTX_MAGIC_OFF, &self.magic.to_le_bytes());
        put(CTX_VERSION_OFF, &self.version.to_le_bytes());
        put(CTX_KIND_OFF, &[self.kind]);
        put(CTX_LP_PDA_OFF, &self.lp_pda);
        put(CTX_FEE_OFF, &self.fee_bps.to_le_bytes());
        put(CTX_SPREAD_OFF, &self.spread_bps.to_le_bytes());
        put(CTX_MAX_OFF, &self.max_bps.to_le_bytes());
        put(CTX_IMPACT_K_OFF, &self.impact_k_bps.to_le_bytes());
        put(CTX_LIQUIDITY_OFF, &self.liquidity_notional_e6.to_le_bytes());
        put(CTX_MAX_FILL_OFF, &self.max_fill_abs.to_le_bytes());
        put(CTX_INVENTORY_OFF, &self.inventory_base.to_le_bytes());
        put(CTX_LAST_ORACLE_OFF, &self.last_oracle_price_e6.to_le_bytes());
        put(CTX_LAST_EXEC_OFF, &self.last_exec_price_e6.to_le_bytes());
        put(CTX_MAX_INVENTORY_OFF, &self.max_inventory_abs.to_le_bytes());
        put(CTX_INSURANCE_OFF, &self.insurance.to_le_bytes());
        put(CTX_TOTAL_OI_OFF, &self.total_oi.to_le_bytes());
        put(CTX_MARKET_AGE_OFF, &self.market_age_slots.to_le_bytes());
        put(CTX_LAST_DEFICIT_OFF, &self.last_deficit_slot.to_le_bytes());
        put(CTX_SNAPSHOT_SLOT_OFF, &self.snapshot_slot.to_le_bytes());
        put(CTX_AGE_HALFLIFE_OFF, &self.age_halflife_slots.to_le_bytes());
        put(CTX_INSURANCE_WEIGHT_OFF, &self.insurance_weight_bps.to_le_bytes());
        d
    }
}

/// Route crate tracing to the test harness; `RUST_LOG=debug` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(b: u8) -> Pubkey {
    Pubkey::new_from_array([b; 32])
}
