//! ブロックヘッダのワード配置.
//!
//! ヘッダは先頭ページのペイロードの最初の128バイト(64bitワード16個)を占める.
//!
//! ```text
//!  0: state(u16) | flags(u16) << 16 | writer(u32) << 32
//!  1: timestamp (UNIXエポックからのナノ秒)
//!  2: page span
//!  3: lut offset (ユーザデータ領域のサイズ)
//!  4..=10: page cache (先頭7ページのインデックス)
//! 11: writer reference bitmap
//! 12: reader reference bitmap
//! 13: reader visited bitmap
//! 14: generation
//! 15: reserved
//! ```
use crate::{ErrorKind, Result};

pub(crate) const STATE: usize = 0;
pub(crate) const TIMESTAMP: usize = 1;
pub(crate) const SPAN: usize = 2;
pub(crate) const LUT_OFFSET: usize = 3;
pub(crate) const PAGE_CACHE: usize = 4;
pub(crate) const WRITER_REFS: usize = 11;
pub(crate) const READER_REFS: usize = 12;
pub(crate) const VISITED: usize = 13;
pub(crate) const GENERATION: usize = 14;
pub(crate) const RESERVED: usize = 15;

/// ヘッダが占めるワード数.
pub(crate) const WORDS: usize = 16;

/// ページキャッシュに保持されるページ数.
pub const PAGE_CACHE_LEN: usize = 7;

/// ページキャッシュの未使用エントリ.
pub(crate) const NO_PAGE: u64 = u64::max_value();

/// ブロックのライフサイクル上の状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// ライタによる書き込み待ち、あるいは書き込み中.
    Free = 0,

    /// コミット済みで、リーダが読み込み可能.
    Using = 1,

    /// クリーナに回収され、削除待ち.
    Clean = 2,
}

pub(crate) fn pack(state: BlockState, writer: u32) -> u64 {
    (state as u64) | (u64::from(writer) << 32)
}

pub(crate) fn state_of(word: u64) -> Result<BlockState> {
    match word & 0xFFFF {
        0 => Ok(BlockState::Free),
        1 => Ok(BlockState::Using),
        2 => Ok(BlockState::Clean),
        n => track_panic!(ErrorKind::BlockCorrupted, "Unknown block state: {}", n),
    }
}

pub(crate) fn with_state(word: u64, state: BlockState) -> u64 {
    (word & !0xFFFF) | state as u64
}

pub(crate) fn writer_of(word: u64) -> u32 {
    (word >> 32) as u32
}

pub(crate) fn with_writer(word: u64, writer: u32) -> u64 {
    (word & 0xFFFF_FFFF) | (u64::from(writer) << 32)
}
