//! Percolator view: read-only decoder for the Percolator slab and matcher
//! context accounts, plus the fixed-point quote math the matchers run on-chain.
//!
//! Everything here is a pure function of byte slices and integers. Nothing is
//! written back; callers fetch account data themselves and hand in the bytes.

#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    use core::mem::{align_of, size_of};
    use crate::layout::{AccountRecord, EngineBlock, MarketConfig, SlabHeader};

    pub const MAGIC: u64 = 0x504552434f4c4154; // "PERCOLAT"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<MarketConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<EngineBlock>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<EngineBlock>();

    pub const MAX_ACCOUNTS: usize = 4096;
    pub const BITMAP_WORDS: usize = (MAX_ACCOUNTS + 63) / 64;
    pub const BITMAP_OFF: usize = ENGINE_OFF + ENGINE_LEN;
    pub const BITMAP_LEN: usize = BITMAP_WORDS * 8;

    // Slot allocator state between the bitmap and the records
    pub const NUM_USED_OFF: usize = BITMAP_OFF + BITMAP_LEN;
    pub const NEXT_ACCOUNT_ID_OFF: usize = align_up(NUM_USED_OFF + 2, 8);
    pub const FREE_HEAD_OFF: usize = NEXT_ACCOUNT_ID_OFF + 8;
    pub const NEXT_FREE_OFF: usize = FREE_HEAD_OFF + 2;
    pub const NEXT_FREE_LEN: usize = MAX_ACCOUNTS * 2;

    pub const ACCOUNTS_OFF: usize =
        align_up(NEXT_FREE_OFF + NEXT_FREE_LEN, align_of::<AccountRecord>());
    pub const ACCOUNT_LEN: usize = size_of::<AccountRecord>();
    pub const SLAB_LEN: usize = ACCOUNTS_OFF + MAX_ACCOUNTS * ACCOUNT_LEN;

    const _: () = assert!(HEADER_LEN == 64);
    const _: () = assert!(ENGINE_OFF == 208);
    const _: () = assert!(BITMAP_OFF == 616);
    const _: () = assert!(NUM_USED_OFF == 1128);
    const _: () = assert!(NEXT_ACCOUNT_ID_OFF == 1136);
    const _: () = assert!(ACCOUNTS_OFF == 9344);
    const _: () = assert!(ACCOUNTS_OFF - ENGINE_OFF == 9136);
    const _: () = assert!(SLAB_LEN == 992_384);

    // Matcher context ("PERCMATC")
    pub const MATCHER_MAGIC: u64 = 0x5045_5243_4d41_5443;
    pub const MATCHER_VERSION: u32 = 4;
    pub const MATCHER_ACCOUNT_LEN: usize = 320;
    /// The first 64 bytes of a matcher account are its return-data area.
    pub const MATCHER_CTX_BASE: usize = 64;
    pub const MATCHER_CONTEXT_LEN: usize = MATCHER_ACCOUNT_LEN - MATCHER_CTX_BASE;

    // Context offsets, relative to MATCHER_CTX_BASE
    pub const CTX_MAGIC_OFF: usize = 0;
    pub const CTX_VERSION_OFF: usize = 8;
    pub const CTX_KIND_OFF: usize = 12;
    pub const CTX_LP_PDA_OFF: usize = 16;
    pub const CTX_FEE_OFF: usize = 48;
    pub const CTX_SPREAD_OFF: usize = 52;
    pub const CTX_MAX_OFF: usize = 56;
    pub const CTX_IMPACT_K_OFF: usize = 60;
    pub const CTX_LIQUIDITY_OFF: usize = 64;
    pub const CTX_MAX_FILL_OFF: usize = 80;
    pub const CTX_INVENTORY_OFF: usize = 96;
    pub const CTX_LAST_ORACLE_OFF: usize = 112;
    pub const CTX_LAST_EXEC_OFF: usize = 120;
    pub const CTX_MAX_INVENTORY_OFF: usize = 128;
    pub const CTX_INSURANCE_OFF: usize = 144;
    pub const CTX_TOTAL_OI_OFF: usize = 160;
    pub const CTX_MARKET_AGE_OFF: usize = 176;
    pub const CTX_LAST_DEFICIT_OFF: usize = 184;
    pub const CTX_SNAPSHOT_SLOT_OFF: usize = 192;
    pub const CTX_AGE_HALFLIFE_OFF: usize = 200;
    pub const CTX_INSURANCE_WEIGHT_OFF: usize = 204;

    pub const BPS: u64 = 10_000;

    /// Spread charged for a venue whose context could not be read or priced.
    pub const FALLBACK_SPREAD_BPS: u64 = 500;
}

// 2. mod wide
/// 128-bit integers stored as two little-endian `u64` words (lo, hi).
///
/// The slab keeps these 8-byte aligned, so native `u128`/`i128` (16-byte
/// aligned on most hosts) cannot be used in the mirror structs directly.
pub mod wide {
    use bytemuck::{Pod, Zeroable};
    use core::fmt;

    #[inline]
    pub const fn compose_u128(lo: u64, hi: u64) -> u128 {
        ((hi as u128) << 64) | (lo as u128)
    }

    /// The high word is the signed half: it is sign-extended before shifting.
    #[inline]
    pub const fn compose_i128(lo: u64, hi: u64) -> i128 {
        (((hi as i64) as i128) << 64) | (lo as u128 as i128)
    }

    #[inline]
    pub const fn split_u128(val: u128) -> (u64, u64) {
        (val as u64, (val >> 64) as u64)
    }

    #[inline]
    pub const fn split_i128(val: i128) -> (u64, u64) {
        (val as u64, (val >> 64) as u64)
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
    pub struct U128([u64; 2]);

    impl U128 {
        pub const ZERO: Self = Self([0, 0]);

        #[inline]
        pub const fn new(val: u128) -> Self {
            let (lo, hi) = split_u128(val);
            Self([lo, hi])
        }

        #[inline]
        pub const fn from_words(lo: u64, hi: u64) -> Self {
            Self([lo, hi])
        }

        #[inline]
        pub const fn get(self) -> u128 {
            compose_u128(self.0[0], self.0[1])
        }

        #[inline]
        pub const fn words(self) -> (u64, u64) {
            (self.0[0], self.0[1])
        }
    }

    impl fmt::Debug for U128 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_tuple("U128").field(&self.get()).finish()
        }
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
    pub struct I128([u64; 2]);

    impl I128 {
        pub const ZERO: Self = Self([0, 0]);

        #[inline]
        pub const fn new(val: i128) -> Self {
            let (lo, hi) = split_i128(val);
            Self([lo, hi])
        }

        #[inline]
        pub const fn from_words(lo: u64, hi: u64) -> Self {
            Self([lo, hi])
        }

        #[inline]
        pub const fn get(self) -> i128 {
            compose_i128(self.0[0], self.0[1])
        }

        #[inline]
        pub const fn words(self) -> (u64, u64) {
            (self.0[0], self.0[1])
        }
    }

    impl fmt::Debug for I128 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_tuple("I128").field(&self.get()).finish()
        }
    }
}

// 3. mod error
pub mod error {
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub enum DecodeError {
        /// Not a blob of this kind at all.
        #[error("bad signature: expected {expected:#018x}, found {found:#018x}")]
        BadSignature { expected: u64, found: u64 },
        #[error("unsupported format version {0}")]
        UnsupportedVersion(u32),
        /// Often a partial fetch; re-fetch and decode again.
        #[error("buffer too short: need {needed} bytes, have {len}")]
        TooShort { needed: usize, len: usize },
        #[error("slot {idx} out of range (buffer holds {max} records)")]
        IndexOutOfRange { idx: usize, max: usize },
        #[error("unknown matcher kind {0}")]
        UnknownMatcherKind(u8),
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub enum PricingError {
        #[error("oracle price is zero")]
        ZeroOraclePrice,
        #[error("trade size {size} exceeds max fill {max}")]
        FillTooLarge { size: u128, max: u128 },
        #[error("inventory {new_abs} would exceed limit {max}")]
        InventoryLimit { new_abs: u128, max: u128 },
        #[error("credibility spread ceiling is zero")]
        ZeroSpreadCeiling,
        #[error("arithmetic overflow")]
        Overflow,
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
    pub enum Error {
        #[error(transparent)]
        Decode(#[from] DecodeError),
        #[error(transparent)]
        Pricing(#[from] PricingError),
    }
}

// 4. mod layout
/// `#[repr(C)]` mirrors of the slab sections and the per-version offset table.
pub mod layout {
    use bytemuck::{Pod, Zeroable};
    use core::mem::{offset_of, size_of};
    use crate::constants::{
        ACCOUNTS_OFF, ACCOUNT_LEN, BITMAP_OFF, BITMAP_WORDS, CONFIG_LEN, ENGINE_LEN, ENGINE_OFF,
        FREE_HEAD_OFF, HEADER_LEN, MAX_ACCOUNTS, NEXT_ACCOUNT_ID_OFF, NUM_USED_OFF, VERSION,
    };
    use crate::error::DecodeError;
    use crate::wide::{I128, U128};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16], // [0..8]=nonce, [8..16]=last_thr_slot
    }

    pub const RESERVED_OFF: usize = offset_of!(SlabHeader, _reserved);
    const _: () = assert!(RESERVED_OFF == 48);

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct MarketConfig {
        pub collateral_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub collateral_oracle: [u8; 32],
        pub index_oracle: [u8; 32],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub vault_authority_bump: u8,
        pub _padding: [u8; 5],
    }

    const _: () = assert!(size_of::<MarketConfig>() == 144);

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct InsuranceFund {
        pub balance: U128,
        pub fee_revenue: U128,
    }

    /// Risk parameters the engine was initialized with. Embedded in the
    /// aggregate block right after the insurance fund.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct RiskParams {
        pub warmup_period_slots: u64,
        pub maintenance_margin_bps: u64,
        pub initial_margin_bps: u64,
        pub trading_fee_bps: u64,
        pub max_accounts: u64,
        pub new_account_fee: U128,
        pub risk_reduction_threshold: U128,
        pub maintenance_fee_per_slot: U128,
        pub max_crank_staleness_slots: u64,
        pub liquidation_fee_bps: u64,
        pub liquidation_fee_cap: U128,
        pub liquidation_buffer_bps: u64,
        pub min_liquidation_abs: U128,
    }

    const _: () = assert!(offset_of!(RiskParams, new_account_fee) == 40);
    const _: () = assert!(offset_of!(RiskParams, max_crank_staleness_slots) == 88);
    const _: () = assert!(size_of::<RiskParams>() == 144);

    /// Flat aggregate block at the start of the risk engine. The used-slot
    /// bitmap follows it directly, then the allocator state, then the records.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct EngineBlock {
        pub vault: U128,
        pub insurance_fund: InsuranceFund,
        pub params: RiskParams,
        pub current_slot: u64,
        pub funding_index_qpb_e6: I128,
        pub last_funding_slot: u64,
        pub funding_rate_bps_per_slot_last: i64,
        pub last_crank_slot: u64,
        pub max_crank_staleness_slots: u64,
        pub total_open_interest: U128,
        pub c_tot: U128,
        pub pnl_pos_tot: U128,
        pub liq_cursor: u16,
        pub gc_cursor: u16,
        pub _padding0: [u8; 4],
        pub last_full_sweep_start_slot: u64,
        pub last_full_sweep_completed_slot: u64,
        pub crank_cursor: u16,
        pub sweep_start_idx: u16,
        pub _padding1: [u8; 4],
        pub lifetime_liquidations: u64,
        pub lifetime_force_realize_closes: u64,
        pub net_lp_pos: I128,
        pub lp_sum_abs: U128,
        pub lp_max_abs: U128,
        pub lp_max_abs_sweep: U128,
    }

    // Offsets the matcher refresh instruction reads directly.
    const _: () = assert!(offset_of!(EngineBlock, insurance_fund) == 16);
    const _: () = assert!(offset_of!(EngineBlock, params) == 48);
    const _: () = assert!(offset_of!(EngineBlock, funding_index_qpb_e6) == 200);
    const _: () = assert!(offset_of!(EngineBlock, last_crank_slot) == 232);
    const _: () = assert!(offset_of!(EngineBlock, total_open_interest) == 248);
    const _: () = assert!(offset_of!(EngineBlock, lifetime_liquidations) == 328);
    const _: () = assert!(size_of::<EngineBlock>() == 408);

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    pub struct AccountRecord {
        pub account_id: u64,
        pub capital: U128,
        pub kind: u8,
        pub _padding0: [u8; 7],
        pub pnl: I128,
        pub reserved_pnl: u64,
        pub warmup_started_at_slot: u64,
        pub warmup_slope_per_step: U128,
        pub position_size: I128,
        pub entry_price: u64,
        pub funding_index: I128,
        pub matcher_program: [u8; 32],
        pub matcher_context: [u8; 32],
        pub owner: [u8; 32],
        pub fee_credits: I128,
        pub last_fee_slot: u64,
    }

    const _: () = assert!(offset_of!(AccountRecord, kind) == 24);
    const _: () = assert!(offset_of!(AccountRecord, owner) == 184);
    const _: () = assert!(size_of::<AccountRecord>() == 240);

    /// Offset table for one slab format version. A new on-chain layout gets a
    /// new table; existing tables are never renumbered.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SlabLayout {
        pub version: u32,
        pub header_len: usize,
        pub config_off: usize,
        pub config_len: usize,
        pub engine_off: usize,
        pub engine_len: usize,
        pub bitmap_off: usize,
        pub bitmap_words: usize,
        pub num_used_off: usize,
        pub next_account_id_off: usize,
        pub free_head_off: usize,
        pub accounts_off: usize,
        pub account_len: usize,
        pub max_accounts: usize,
    }

    pub static SLAB_LAYOUT_V1: SlabLayout = SlabLayout {
        version: VERSION,
        header_len: HEADER_LEN,
        config_off: HEADER_LEN,
        config_len: CONFIG_LEN,
        engine_off: ENGINE_OFF,
        engine_len: ENGINE_LEN,
        bitmap_off: BITMAP_OFF,
        bitmap_words: BITMAP_WORDS,
        num_used_off: NUM_USED_OFF,
        next_account_id_off: NEXT_ACCOUNT_ID_OFF,
        free_head_off: FREE_HEAD_OFF,
        accounts_off: ACCOUNTS_OFF,
        account_len: ACCOUNT_LEN,
        max_accounts: MAX_ACCOUNTS,
    };

    impl SlabLayout {
        pub fn for_version(version: u32) -> Result<&'static SlabLayout, DecodeError> {
            match version {
                VERSION => Ok(&SLAB_LAYOUT_V1),
                other => Err(DecodeError::UnsupportedVersion(other)),
            }
        }

        #[inline]
        pub const fn bitmap_end(&self) -> usize {
            self.bitmap_off + self.bitmap_words * 8
        }

        /// End of the allocator counters the engine decoder reads.
        #[inline]
        pub const fn engine_counters_end(&self) -> usize {
            self.free_head_off + 2
        }

        #[inline]
        pub const fn slab_len(&self) -> usize {
            self.accounts_off + self.max_accounts * self.account_len
        }

        #[inline]
        pub const fn account_off(&self, idx: usize) -> usize {
            self.accounts_off + idx * self.account_len
        }

        /// Whole records that fit in `len` bytes, capped at the bitmap capacity.
        pub fn max_valid_index(&self, len: usize) -> usize {
            let whole = len.saturating_sub(self.accounts_off) / self.account_len;
            whole.min(self.max_accounts)
        }
    }

    pub(crate) fn require_len(data: &[u8], needed: usize) -> Result<(), DecodeError> {
        if data.len() < needed {
            return Err(DecodeError::TooShort { needed, len: data.len() });
        }
        Ok(())
    }

    /// Copy a `Pod` mirror out of `data` at `off`. The slice may be unaligned.
    pub(crate) fn read_pod<T: Pod>(data: &[u8], off: usize) -> Result<T, DecodeError> {
        let end = off.saturating_add(size_of::<T>());
        let src = data
            .get(off..end)
            .ok_or(DecodeError::TooShort { needed: end, len: data.len() })?;
        let mut out = T::zeroed();
        bytemuck::bytes_of_mut(&mut out).copy_from_slice(src);
        Ok(out)
    }
}

// 5. mod state
/// Typed snapshots of the slab and the decoders that produce them.
pub mod state {
    use arrayref::array_ref;
    use core::iter::Enumerate;
    use core::slice::ChunksExact;
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::pubkey::Pubkey;
    use crate::constants::{HEADER_LEN, MAGIC};
    use crate::error::DecodeError;
    use crate::layout::{
        self, AccountRecord, EngineBlock, MarketConfig, RiskParams, SlabHeader, SlabLayout,
        SLAB_LAYOUT_V1,
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct Header {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub admin: Pubkey,
        pub req_nonce: u64,
        pub last_thr_update_slot: u64,
    }

    impl Header {
        /// Admin key burned to the all-zero key (which is also the system program id).
        pub fn admin_burned(&self) -> bool {
            self.admin == Pubkey::default()
        }
    }

    impl From<&SlabHeader> for Header {
        fn from(h: &SlabHeader) -> Self {
            Header {
                magic: h.magic,
                version: h.version,
                bump: h.bump,
                admin: Pubkey::new_from_array(h.admin),
                req_nonce: u64::from_le_bytes(*array_ref![h._reserved, 0, 8]),
                last_thr_update_slot: u64::from_le_bytes(*array_ref![h._reserved, 8, 8]),
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct Config {
        pub collateral_mint: Pubkey,
        pub vault: Pubkey,
        pub collateral_oracle: Pubkey,
        pub index_oracle: Pubkey,
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub vault_authority_bump: u8,
    }

    impl From<&MarketConfig> for Config {
        fn from(c: &MarketConfig) -> Self {
            Config {
                collateral_mint: Pubkey::new_from_array(c.collateral_mint),
                vault: Pubkey::new_from_array(c.vault_pubkey),
                collateral_oracle: Pubkey::new_from_array(c.collateral_oracle),
                index_oracle: Pubkey::new_from_array(c.index_oracle),
                max_staleness_slots: c.max_staleness_slots,
                conf_filter_bps: c.conf_filter_bps,
                vault_authority_bump: c.vault_authority_bump,
            }
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct InsuranceFundState {
        pub balance: u128,
        pub fee_revenue: u128,
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct RiskParamsState {
        pub warmup_period_slots: u64,
        pub maintenance_margin_bps: u64,
        pub initial_margin_bps: u64,
        pub trading_fee_bps: u64,
        pub max_accounts: u64,
        pub new_account_fee: u128,
        pub risk_reduction_threshold: u128,
        pub maintenance_fee_per_slot: u128,
        pub max_crank_staleness_slots: u64,
        pub liquidation_fee_bps: u64,
        pub liquidation_fee_cap: u128,
        pub liquidation_buffer_bps: u64,
        pub min_liquidation_abs: u128,
    }

    impl From<&RiskParams> for RiskParamsState {
        fn from(p: &RiskParams) -> Self {
            RiskParamsState {
                warmup_period_slots: p.warmup_period_slots,
                maintenance_margin_bps: p.maintenance_margin_bps,
                initial_margin_bps: p.initial_margin_bps,
                trading_fee_bps: p.trading_fee_bps,
                max_accounts: p.max_accounts,
                new_account_fee: p.new_account_fee.get(),
                risk_reduction_threshold: p.risk_reduction_threshold.get(),
                maintenance_fee_per_slot: p.maintenance_fee_per_slot.get(),
                max_crank_staleness_slots: p.max_crank_staleness_slots,
                liquidation_fee_bps: p.liquidation_fee_bps,
                liquidation_fee_cap: p.liquidation_fee_cap.get(),
                liquidation_buffer_bps: p.liquidation_buffer_bps,
                min_liquidation_abs: p.min_liquidation_abs.get(),
            }
        }
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct EngineState {
        pub vault: u128,
        pub insurance_fund: InsuranceFundState,
        pub params: RiskParamsState,
        pub current_slot: u64,
        pub funding_index_qpb_e6: i128,
        pub last_funding_slot: u64,
        pub funding_rate_bps_per_slot_last: i64,
        pub last_crank_slot: u64,
        pub max_crank_staleness_slots: u64,
        pub total_open_interest: u128,
        /// Sum of account capital.
        pub c_tot: u128,
        /// Sum of positive account PnL.
        pub pnl_pos_tot: u128,
        pub liq_cursor: u16,
        pub gc_cursor: u16,
        pub last_full_sweep_start_slot: u64,
        pub last_full_sweep_completed_slot: u64,
        pub crank_cursor: u16,
        pub sweep_start_idx: u16,
        pub lifetime_liquidations: u64,
        pub lifetime_force_realize_closes: u64,
        pub net_lp_pos: i128,
        pub lp_sum_abs: u128,
        pub lp_max_abs: u128,
        pub lp_max_abs_sweep: u128,
        pub num_used_accounts: u16,
        pub next_account_id: u64,
        pub free_head: u16,
    }

    impl EngineState {
        /// Same freshness rule the program applies before risk-increasing ops.
        pub fn crank_is_stale(&self, now_slot: u64) -> bool {
            now_slot.saturating_sub(self.last_crank_slot) > self.max_crank_staleness_slots
        }

        /// A full sweep must have started within the staleness window.
        pub fn sweep_is_stale(&self, now_slot: u64) -> bool {
            now_slot.saturating_sub(self.last_full_sweep_start_slot) > self.max_crank_staleness_slots
        }

        /// Insurance at or below the configured threshold puts the market in
        /// risk-reduction mode: positions are force-realized, not opened.
        pub fn risk_reduction_only(&self) -> bool {
            self.insurance_fund.balance <= self.params.risk_reduction_threshold
        }

        /// Fraction of positive PnL the vault can actually pay out, as
        /// `(numerator, denominator)`. `(1, 1)` when nobody is in profit.
        pub fn haircut_ratio(&self) -> (u128, u128) {
            if self.pnl_pos_tot == 0 {
                return (1, 1);
            }
            let residual = self
                .vault
                .saturating_sub(self.c_tot)
                .saturating_sub(self.insurance_fund.balance);
            (residual.min(self.pnl_pos_tot), self.pnl_pos_tot)
        }

        fn from_parts(e: &EngineBlock, num_used_accounts: u16, next_account_id: u64, free_head: u16) -> Self {
            EngineState {
                vault: e.vault.get(),
                insurance_fund: InsuranceFundState {
                    balance: e.insurance_fund.balance.get(),
                    fee_revenue: e.insurance_fund.fee_revenue.get(),
                },
                params: RiskParamsState::from(&e.params),
                current_slot: e.current_slot,
                funding_index_qpb_e6: e.funding_index_qpb_e6.get(),
                last_funding_slot: e.last_funding_slot,
                funding_rate_bps_per_slot_last: e.funding_rate_bps_per_slot_last,
                last_crank_slot: e.last_crank_slot,
                max_crank_staleness_slots: e.max_crank_staleness_slots,
                total_open_interest: e.total_open_interest.get(),
                c_tot: e.c_tot.get(),
                pnl_pos_tot: e.pnl_pos_tot.get(),
                liq_cursor: e.liq_cursor,
                gc_cursor: e.gc_cursor,
                last_full_sweep_start_slot: e.last_full_sweep_start_slot,
                last_full_sweep_completed_slot: e.last_full_sweep_completed_slot,
                crank_cursor: e.crank_cursor,
                sweep_start_idx: e.sweep_start_idx,
                lifetime_liquidations: e.lifetime_liquidations,
                lifetime_force_realize_closes: e.lifetime_force_realize_closes,
                net_lp_pos: e.net_lp_pos.get(),
                lp_sum_abs: e.lp_sum_abs.get(),
                lp_max_abs: e.lp_max_abs.get(),
                lp_max_abs_sweep: e.lp_max_abs_sweep.get(),
                num_used_accounts,
                next_account_id,
                free_head,
            }
        }
    }

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub enum AccountKind {
        User = 0,
        LP = 1,
    }

    /// One account record. Only meaningful when its bitmap bit is set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct Account {
        pub account_id: u64,
        pub capital: u128,
        /// Raw discriminant; see [`Account::kind`].
        pub kind_raw: u8,
        pub pnl: i128,
        pub reserved_pnl: u64,
        pub warmup_started_at_slot: u64,
        pub warmup_slope_per_step: u128,
        pub position_size: i128,
        pub entry_price: u64,
        pub funding_index: i128,
        pub matcher_program: Pubkey,
        pub matcher_context: Pubkey,
        pub owner: Pubkey,
        pub fee_credits: i128,
        pub last_fee_slot: u64,
    }

    impl Account {
        pub fn kind(&self) -> Option<AccountKind> {
            AccountKind::from_u8(self.kind_raw)
        }

        pub fn is_lp(&self) -> bool {
            self.kind() == Some(AccountKind::LP)
        }

        pub fn is_user(&self) -> bool {
            self.kind() == Some(AccountKind::User)
        }
    }

    impl From<&AccountRecord> for Account {
        fn from(a: &AccountRecord) -> Self {
            Account {
                account_id: a.account_id,
                capital: a.capital.get(),
                kind_raw: a.kind,
                pnl: a.pnl.get(),
                reserved_pnl: a.reserved_pnl,
                warmup_started_at_slot: a.warmup_started_at_slot,
                warmup_slope_per_step: a.warmup_slope_per_step.get(),
                position_size: a.position_size.get(),
                entry_price: a.entry_price,
                funding_index: a.funding_index.get(),
                matcher_program: Pubkey::new_from_array(a.matcher_program),
                matcher_context: Pubkey::new_from_array(a.matcher_context),
                owner: Pubkey::new_from_array(a.owner),
                fee_credits: a.fee_credits.get(),
                last_fee_slot: a.last_fee_slot,
            }
        }
    }

    /// Signature check first, then the rest of the header. The version is
    /// returned as-is; compatibility is decided by [`slab_layout`].
    pub fn decode_header(data: &[u8]) -> Result<Header, DecodeError> {
        layout::require_len(data, HEADER_LEN)?;
        let magic = u64::from_le_bytes(*array_ref![data, 0, 8]);
        if magic != MAGIC {
            return Err(DecodeError::BadSignature { expected: MAGIC, found: magic });
        }
        let h: SlabHeader = layout::read_pod(data, 0)?;
        Ok(Header::from(&h))
    }

    /// Validate the header and pick the offset table for its version.
    pub fn slab_layout(data: &[u8]) -> Result<&'static SlabLayout, DecodeError> {
        let header = decode_header(data)?;
        SlabLayout::for_version(header.version)
    }

    pub fn decode_config(data: &[u8]) -> Result<Config, DecodeError> {
        let l = slab_layout(data)?;
        let c: MarketConfig = layout::read_pod(data, l.config_off)?;
        Ok(Config::from(&c))
    }

    /// Aggregate block plus the allocator counters behind the bitmap.
    pub fn decode_engine(data: &[u8]) -> Result<EngineState, DecodeError> {
        let l = slab_layout(data)?;
        let e: EngineBlock = layout::read_pod(data, l.engine_off)?;
        layout::require_len(data, l.engine_counters_end())?;
        let num_used = u16::from_le_bytes(*array_ref![data, l.num_used_off, 2]);
        let next_id = u64::from_le_bytes(*array_ref![data, l.next_account_id_off, 8]);
        let free_head = u16::from_le_bytes(*array_ref![data, l.free_head_off, 2]);
        Ok(EngineState::from_parts(&e, num_used, next_id, free_head))
    }

    /// Ascending indices of set bits in the used-slot bitmap.
    ///
    /// Lazy and finite; call [`used_indices`] again to rescan.
    #[derive(Clone, Debug)]
    pub struct UsedIndices<'a> {
        words: Enumerate<ChunksExact<'a, u8>>,
        base: usize,
        bits: u64,
    }

    impl Iterator for UsedIndices<'_> {
        type Item = usize;

        fn next(&mut self) -> Option<usize> {
            loop {
                if self.bits != 0 {
                    let b = self.bits.trailing_zeros() as usize;
                    self.bits &= self.bits - 1;
                    return Some(self.base + b);
                }
                let (w, chunk) = self.words.next()?;
                self.base = w * 64;
                self.bits = u64::from_le_bytes(*array_ref![chunk, 0, 8]);
            }
        }
    }

    fn bitmap(data: &[u8]) -> Result<(&'static SlabLayout, &[u8]), DecodeError> {
        let l = slab_layout(data)?;
        let end = l.bitmap_end();
        let bytes = data
            .get(l.bitmap_off..end)
            .ok_or(DecodeError::TooShort { needed: end, len: data.len() })?;
        Ok((l, bytes))
    }

    pub fn used_indices(data: &[u8]) -> Result<UsedIndices<'_>, DecodeError> {
        let (_, bytes) = bitmap(data)?;
        Ok(UsedIndices {
            words: bytes.chunks_exact(8).enumerate(),
            base: 0,
            bits: 0,
        })
    }

    pub fn is_slot_used(data: &[u8], idx: usize) -> Result<bool, DecodeError> {
        let (l, bytes) = bitmap(data)?;
        if idx >= l.max_accounts {
            return Err(DecodeError::IndexOutOfRange { idx, max: l.max_accounts });
        }
        let w = idx / 64;
        let word = u64::from_le_bytes(*array_ref![bytes, w * 8, 8]);
        Ok((word >> (idx % 64)) & 1 == 1)
    }

    /// Number of whole account records a buffer of `len` bytes can hold.
    pub fn max_valid_index(len: usize) -> usize {
        SLAB_LAYOUT_V1.max_valid_index(len)
    }

    pub fn decode_account(data: &[u8], idx: usize) -> Result<Account, DecodeError> {
        let l = slab_layout(data)?;
        let max = l.max_valid_index(data.len());
        if idx >= max {
            return Err(DecodeError::IndexOutOfRange { idx, max });
        }
        let rec: AccountRecord = layout::read_pod(data, l.account_off(idx))?;
        Ok(Account::from(&rec))
    }

    /// Every live account the buffer actually contains. Bits pointing past
    /// the end of a truncated buffer are skipped, not reported as errors.
    pub fn decode_all_used_accounts(data: &[u8]) -> Result<Vec<(usize, Account)>, DecodeError> {
        let l = slab_layout(data)?;
        let max = l.max_valid_index(data.len());
        let mut out = Vec::new();
        let mut skipped = 0usize;
        for idx in used_indices(data)? {
            if idx >= max {
                skipped += 1;
                continue;
            }
            let rec: AccountRecord = layout::read_pod(data, l.account_off(idx))?;
            out.push((idx, Account::from(&rec)));
        }
        if skipped > 0 {
            tracing::debug!(skipped, capacity = max, "used slots beyond buffer end");
        }
        Ok(out)
    }

    /// Point-in-time view of one slab fetch.
    #[derive(Clone, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct SlabSnapshot {
        pub header: Header,
        pub config: Config,
        pub engine: EngineState,
        pub accounts: Vec<(usize, Account)>,
    }

    impl SlabSnapshot {
        pub fn lp_accounts(&self) -> impl Iterator<Item = &(usize, Account)> + '_ {
            self.accounts.iter().filter(|(_, a)| a.is_lp())
        }

        pub fn total_capital(&self) -> u128 {
            self.accounts
                .iter()
                .fold(0u128, |acc, (_, a)| acc.saturating_add(a.capital))
        }
    }

    pub fn decode_slab(data: &[u8]) -> Result<SlabSnapshot, DecodeError> {
        Ok(SlabSnapshot {
            header: decode_header(data)?,
            config: decode_config(data)?,
            engine: decode_engine(data)?,
            accounts: decode_all_used_accounts(data)?,
        })
    }
}

// 6. mod matcher
pub mod matcher {
    use arrayref::array_ref;
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::pubkey::Pubkey;
    use crate::constants::*;
    use crate::error::DecodeError;
    use crate::state::{EngineState, Header};

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub enum MatcherKind {
        Passive = 0,
        Vamm = 1,
        Credibility = 2,
    }

    /// Role-independent parameter block. For [`MatcherKind::Credibility`],
    /// `spread_bps` is the minimum spread, `max_bps` the spread ceiling and
    /// `impact_k_bps` the inventory imbalance coefficient.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct MatcherParams {
        pub fee_bps: u32,
        pub spread_bps: u32,
        /// Ceiling on the total edge; zero means no ceiling.
        pub max_bps: u32,
        pub impact_k_bps: u32,
        pub liquidity_notional_e6: u128,
        pub max_fill_abs: u128,
        pub max_inventory_abs: u128,
    }

    /// Insurance/OI as of the last permissionless refresh. May be arbitrarily
    /// old; no freshness is implied.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct CredibilitySnapshot {
        pub insurance_balance: u128,
        pub total_open_interest: u128,
        pub snapshot_slot: u64,
        pub market_age_slots: u64,
        pub last_deficit_slot: u64,
        pub age_halflife_slots: u32,
        pub insurance_weight_bps: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct MatcherContext {
        pub version: u32,
        pub kind: MatcherKind,
        pub lp_pda: Pubkey,
        pub params: MatcherParams,
        pub inventory_base: i128,
        pub last_oracle_price_e6: u64,
        pub last_exec_price_e6: u64,
        pub credibility: CredibilitySnapshot,
    }

    type Ctx = [u8; MATCHER_CONTEXT_LEN];

    fn read_u32(ctx: &Ctx, off: usize) -> u32 {
        u32::from_le_bytes(*array_ref![ctx, off, 4])
    }

    fn read_u64(ctx: &Ctx, off: usize) -> u64 {
        u64::from_le_bytes(*array_ref![ctx, off, 8])
    }

    fn read_u128(ctx: &Ctx, off: usize) -> u128 {
        u128::from_le_bytes(*array_ref![ctx, off, 16])
    }

    fn read_i128(ctx: &Ctx, off: usize) -> i128 {
        i128::from_le_bytes(*array_ref![ctx, off, 16])
    }

    /// Decode a full matcher account (return-data area included).
    pub fn decode_matcher_context(data: &[u8]) -> Result<MatcherContext, DecodeError> {
        if data.len() < MATCHER_ACCOUNT_LEN {
            return Err(DecodeError::TooShort { needed: MATCHER_ACCOUNT_LEN, len: data.len() });
        }
        let ctx: &Ctx = array_ref![data, MATCHER_CTX_BASE, MATCHER_CONTEXT_LEN];

        let magic = read_u64(ctx, CTX_MAGIC_OFF);
        if magic != MATCHER_MAGIC {
            return Err(DecodeError::BadSignature { expected: MATCHER_MAGIC, found: magic });
        }
        let version = read_u32(ctx, CTX_VERSION_OFF);
        if version != MATCHER_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let kind_raw = ctx[CTX_KIND_OFF];
        let kind = MatcherKind::from_u8(kind_raw).ok_or(DecodeError::UnknownMatcherKind(kind_raw))?;

        Ok(MatcherContext {
            version,
            kind,
            lp_pda: Pubkey::new_from_array(*array_ref![ctx, CTX_LP_PDA_OFF, 32]),
            params: MatcherParams {
                fee_bps: read_u32(ctx, CTX_FEE_OFF),
                spread_bps: read_u32(ctx, CTX_SPREAD_OFF),
                max_bps: read_u32(ctx, CTX_MAX_OFF),
                impact_k_bps: read_u32(ctx, CTX_IMPACT_K_OFF),
                liquidity_notional_e6: read_u128(ctx, CTX_LIQUIDITY_OFF),
                max_fill_abs: read_u128(ctx, CTX_MAX_FILL_OFF),
                max_inventory_abs: read_u128(ctx, CTX_MAX_INVENTORY_OFF),
            },
            inventory_base: read_i128(ctx, CTX_INVENTORY_OFF),
            last_oracle_price_e6: read_u64(ctx, CTX_LAST_ORACLE_OFF),
            last_exec_price_e6: read_u64(ctx, CTX_LAST_EXEC_OFF),
            credibility: CredibilitySnapshot {
                insurance_balance: read_u128(ctx, CTX_INSURANCE_OFF),
                total_open_interest: read_u128(ctx, CTX_TOTAL_OI_OFF),
                snapshot_slot: read_u64(ctx, CTX_SNAPSHOT_SLOT_OFF),
                market_age_slots: read_u64(ctx, CTX_MARKET_AGE_OFF),
                last_deficit_slot: read_u64(ctx, CTX_LAST_DEFICIT_OFF),
                age_halflife_slots: read_u32(ctx, CTX_AGE_HALFLIFE_OFF),
                insurance_weight_bps: read_u32(ctx, CTX_INSURANCE_WEIGHT_OFF),
            },
        })
    }

    impl MatcherContext {
        /// The snapshot a refresh at `current_slot` would write, computed from a
        /// decoded slab. Nothing prices off this unless the caller substitutes it.
        pub fn preview_refresh(
            &self,
            header: &Header,
            engine: &EngineState,
            current_slot: u64,
        ) -> CredibilitySnapshot {
            let prev = &self.credibility;
            // Age only accrues once the admin key is burned.
            let market_age_slots = if header.admin_burned() && prev.snapshot_slot > 0 {
                prev.market_age_slots
                    .saturating_add(current_slot.saturating_sub(prev.snapshot_slot))
            } else {
                0
            };
            CredibilitySnapshot {
                insurance_balance: engine.insurance_fund.balance,
                total_open_interest: engine.total_open_interest,
                snapshot_slot: current_slot,
                market_age_slots,
                ..*prev
            }
        }
    }
}

// 7. mod pricing
/// Integer-only quote math. Bids round down and asks round up, so an
/// off-chain quote is never better than what execution produces.
pub mod pricing {
    use crate::constants::{BPS, FALLBACK_SPREAD_BPS};
    use crate::error::PricingError;
    use crate::matcher::{CredibilitySnapshot, MatcherContext, MatcherKind, MatcherParams};

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct Quote {
        pub bid: u64,
        pub ask: u64,
        pub total_edge_bps: u64,
        pub fee_bps: u64,
        pub spread_bps: u64,
        /// Size impact, or inventory imbalance for the credibility matcher.
        pub impact_bps: u64,
        /// Insurance coverage discount (credibility matcher only).
        pub discount_bps: u64,
    }

    impl Quote {
        /// Buys (size > 0) pay the ask; everything else receives the bid.
        pub fn execution_price(&self, size: i128) -> u64 {
            if size > 0 { self.ask } else { self.bid }
        }
    }

    #[inline]
    fn saturate_u64(v: u128) -> u64 {
        v.min(u64::MAX as u128) as u64
    }

    /// floor(price * (10000 - edge) / 10000); an edge of 100% or more bids zero.
    pub fn bid_price(oracle_price: u64, edge_bps: u64) -> u64 {
        let mult = (BPS - edge_bps.min(BPS)) as u128;
        saturate_u64((oracle_price as u128) * mult / (BPS as u128))
    }

    /// ceil(price * (10000 + edge) / 10000), saturating at `u64::MAX`.
    pub fn ask_price(oracle_price: u64, edge_bps: u64) -> u64 {
        let mult = (BPS as u128) + (edge_bps as u128);
        match (oracle_price as u128).checked_mul(mult) {
            Some(n) => {
                let q = n / (BPS as u128);
                let r = n % (BPS as u128);
                saturate_u64(if r != 0 { q + 1 } else { q })
            }
            None => u64::MAX,
        }
    }

    /// floor(|notional| * k / liquidity). Zero liquidity or zero k means no impact.
    pub fn impact_bps(notional_abs: u128, k_bps: u32, liquidity_notional: u128) -> u64 {
        if k_bps == 0 || liquidity_notional == 0 {
            return 0;
        }
        let n = (k_bps as u128).checked_mul(notional_abs).unwrap_or(u128::MAX);
        saturate_u64(n / liquidity_notional)
    }

    /// insurance / open interest in bps, capped at 100%. Zero OI covers nothing.
    pub fn coverage_bps(insurance: u128, open_interest: u128) -> u64 {
        if open_interest == 0 {
            return 0;
        }
        if insurance >= open_interest {
            return BPS;
        }
        let ratio = match insurance.checked_mul(BPS as u128) {
            Some(n) => n / open_interest,
            // insurance < OI here, so OI >= 10000 and the divisor is nonzero
            None => insurance / (open_interest / BPS as u128),
        };
        saturate_u64(ratio).min(BPS)
    }

    pub fn credibility_discount_bps(snapshot: &CredibilitySnapshot) -> u64 {
        if snapshot.insurance_weight_bps == 0 {
            return 0;
        }
        let coverage = coverage_bps(snapshot.insurance_balance, snapshot.total_open_interest);
        coverage * snapshot.insurance_weight_bps as u64 / BPS
    }

    /// Credibility spread decomposition: (spread, imbalance, discount).
    /// The spread is clamped to `[1, max_bps]`. A context with `max_bps == 0`
    /// cannot execute on-chain and is rejected.
    pub fn credibility_spread_bps(
        params: &MatcherParams,
        inventory_base: i128,
        snapshot: &CredibilitySnapshot,
    ) -> Result<(u64, u64, u64), PricingError> {
        if params.max_bps < 1 {
            return Err(PricingError::ZeroSpreadCeiling);
        }
        let imbalance = impact_bps(
            inventory_base.unsigned_abs(),
            params.impact_k_bps,
            params.liquidity_notional_e6,
        );
        let discount = credibility_discount_bps(snapshot);
        let spread = (params.spread_bps as u64)
            .saturating_add(imbalance)
            .saturating_sub(discount)
            .clamp(1, params.max_bps as u64);
        Ok((spread, imbalance, discount))
    }

    fn check_limits(params: &MatcherParams, inventory: i128, size: i128) -> Result<(), PricingError> {
        let abs = size.unsigned_abs();
        if params.max_fill_abs > 0 && abs > params.max_fill_abs {
            return Err(PricingError::FillTooLarge { size: abs, max: params.max_fill_abs });
        }
        if params.max_inventory_abs > 0 {
            let new_abs = inventory.checked_add(size).ok_or(PricingError::Overflow)?.unsigned_abs();
            if new_abs > params.max_inventory_abs {
                return Err(PricingError::InventoryLimit { new_abs, max: params.max_inventory_abs });
            }
        }
        Ok(())
    }

    fn quote_from_edge(
        oracle_price: u64,
        fee_bps: u64,
        spread_bps: u64,
        impact: u64,
        discount: u64,
        total: u64,
    ) -> Quote {
        Quote {
            bid: bid_price(oracle_price, total),
            ask: ask_price(oracle_price, total),
            total_edge_bps: total,
            fee_bps,
            spread_bps,
            impact_bps: impact,
            discount_bps: discount,
        }
    }

    /// Quote a matcher context at `oracle_price_e6`, optionally for a trade of
    /// `trade_size` (signed, same units as the context's liquidity scale).
    pub fn quote(
        ctx: &MatcherContext,
        oracle_price_e6: u64,
        trade_size: Option<i128>,
    ) -> Result<Quote, PricingError> {
        if oracle_price_e6 == 0 {
            return Err(PricingError::ZeroOraclePrice);
        }
        let p = &ctx.params;
        if let Some(size) = trade_size {
            check_limits(p, ctx.inventory_base, size)?;
        }
        let fee = p.fee_bps as u64;

        match ctx.kind {
            MatcherKind::Credibility => {
                let (spread, imbalance, discount) =
                    credibility_spread_bps(p, ctx.inventory_base, &ctx.credibility)?;
                let total = spread.saturating_add(fee);
                Ok(quote_from_edge(oracle_price_e6, fee, spread, imbalance, discount, total))
            }
            MatcherKind::Passive | MatcherKind::Vamm => {
                let impact = trade_size
                    .map(|s| impact_bps(s.unsigned_abs(), p.impact_k_bps, p.liquidity_notional_e6))
                    .unwrap_or(0);
                let spread = (p.spread_bps as u64).saturating_add(impact);
                let mut total = fee.saturating_add(spread);
                if p.max_bps > 0 {
                    total = total.min(p.max_bps as u64);
                }
                Ok(quote_from_edge(oracle_price_e6, fee, spread, impact, 0, total))
            }
        }
    }

    /// Conservative quote used when a venue's context cannot be priced.
    pub fn fallback_quote(oracle_price_e6: u64) -> Quote {
        quote_from_edge(oracle_price_e6, 0, FALLBACK_SPREAD_BPS, 0, 0, FALLBACK_SPREAD_BPS)
    }
}

// 8. mod aggregate
pub mod aggregate {
    use std::collections::HashMap;
    use std::hash::BuildHasher;
    use solana_program::pubkey::Pubkey;
    use crate::constants::BPS;
    use crate::error::{DecodeError, Error, PricingError};
    use crate::matcher::{decode_matcher_context, MatcherKind};
    use crate::pricing::{self, Quote};
    use crate::state::{Account, SlabSnapshot};

    /// Supplies freshly fetched matcher account data by context key.
    pub trait ContextSource {
        fn context_data(&self, key: &Pubkey) -> Option<&[u8]>;
    }

    impl<S: BuildHasher> ContextSource for HashMap<Pubkey, Vec<u8>, S> {
        fn context_data(&self, key: &Pubkey) -> Option<&[u8]> {
            self.get(key).map(Vec::as_slice)
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub enum FallbackReason {
        Missing,
        Unreadable(DecodeError),
        Rejected(PricingError),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub enum QuoteSource {
        Matcher(MatcherKind),
        /// Priced at `FALLBACK_SPREAD_BPS`, not from the venue's context.
        Fallback(FallbackReason),
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct VenueQuote {
        pub slot: usize,
        pub account_id: u64,
        pub matcher_program: Pubkey,
        pub matcher_context: Pubkey,
        pub quote: Quote,
        pub source: QuoteSource,
    }

    impl VenueQuote {
        pub fn is_fallback(&self) -> bool {
            matches!(self.source, QuoteSource::Fallback(_))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct BestPrice {
        pub slot: usize,
        pub price: u64,
        /// Only fallback-priced venues were available on this side.
        pub degraded: bool,
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize))]
    pub struct BookSummary {
        pub oracle_price_e6: u64,
        pub venues: Vec<VenueQuote>,
        pub best_bid: Option<BestPrice>,
        pub best_ask: Option<BestPrice>,
        /// (best ask - best bid) in bps of the oracle price, rounded away from
        /// zero. Negative when venues cross.
        pub effective_spread_bps: Option<i64>,
    }

    pub fn quote_venue<C: ContextSource + ?Sized>(
        slot: usize,
        account: &Account,
        contexts: &C,
        oracle_price_e6: u64,
        trade_size: Option<i128>,
    ) -> VenueQuote {
        let priced = match contexts.context_data(&account.matcher_context) {
            None => Err(FallbackReason::Missing),
            Some(data) => decode_matcher_context(data)
                .map_err(FallbackReason::Unreadable)
                .and_then(|ctx| {
                    pricing::quote(&ctx, oracle_price_e6, trade_size)
                        .map(|q| (q, QuoteSource::Matcher(ctx.kind)))
                        .map_err(FallbackReason::Rejected)
                }),
        };
        let (quote, source) = match priced {
            Ok(ok) => ok,
            Err(reason) => {
                tracing::warn!(slot, context = %account.matcher_context, ?reason, "venue priced at fallback spread");
                (pricing::fallback_quote(oracle_price_e6), QuoteSource::Fallback(reason))
            }
        };
        tracing::debug!(slot, bid = quote.bid, ask = quote.ask, edge_bps = quote.total_edge_bps, "venue quote");
        VenueQuote {
            slot,
            account_id: account.account_id,
            matcher_program: account.matcher_program,
            matcher_context: account.matcher_context,
            quote,
            source,
        }
    }

    /// First strictly-better venue wins, so ties go to the lowest slot.
    /// Fallback venues are considered only when no real quote exists.
    fn select_best(
        venues: &[VenueQuote],
        price: fn(&Quote) -> u64,
        better: fn(u64, u64) -> bool,
    ) -> Option<BestPrice> {
        let pick = |fallback: bool| {
            venues
                .iter()
                .filter(|v| v.is_fallback() == fallback)
                .fold(None::<&VenueQuote>, |best, v| match best {
                    Some(b) if !better(price(&v.quote), price(&b.quote)) => Some(b),
                    _ => Some(v),
                })
                .map(|v| BestPrice { slot: v.slot, price: price(&v.quote), degraded: fallback })
        };
        pick(false).or_else(|| pick(true))
    }

    pub fn effective_spread_bps(best_bid: u64, best_ask: u64, oracle_price_e6: u64) -> i64 {
        if oracle_price_e6 == 0 {
            return 0;
        }
        let diff = best_ask as i128 - best_bid as i128;
        let oracle = oracle_price_e6 as i128;
        let scaled = diff.unsigned_abs() * BPS as u128;
        let mag = (scaled + (oracle as u128 - 1)) / oracle as u128;
        let mag = mag.min(i64::MAX as u128) as i64;
        if diff < 0 { -mag } else { mag }
    }

    /// Quote every LP venue in `snapshot` and pick the best bid and ask.
    pub fn aggregate_quotes<C: ContextSource + ?Sized>(
        snapshot: &SlabSnapshot,
        contexts: &C,
        oracle_price_e6: u64,
        trade_size: Option<i128>,
    ) -> Result<BookSummary, Error> {
        if oracle_price_e6 == 0 {
            return Err(PricingError::ZeroOraclePrice.into());
        }
        let venues: Vec<VenueQuote> = snapshot
            .lp_accounts()
            .map(|(slot, a)| quote_venue(*slot, a, contexts, oracle_price_e6, trade_size))
            .collect();

        let best_bid = select_best(&venues, |q| q.bid, |a, b| a > b);
        let best_ask = select_best(&venues, |q| q.ask, |a, b| a < b);
        let effective_spread_bps = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some(effective_spread_bps(b.price, a.price, oracle_price_e6)),
            _ => None,
        };
        Ok(BookSummary { oracle_price_e6, venues, best_bid, best_ask, effective_spread_bps })
    }
}
