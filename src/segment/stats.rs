use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::registry::MAX_WRITERS;

/// セグメント単位の統計情報.
#[derive(Debug)]
pub struct SegmentStats {
    page_count: u64,
    live_blocks: AtomicU64,
    used_pages: AtomicU64,
    writer_accesses: [AtomicU64; MAX_WRITERS],
}
impl SegmentStats {
    pub(crate) fn new(page_count: u64) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        SegmentStats {
            page_count,
            live_blocks: AtomicU64::new(0),
            used_pages: AtomicU64::new(0),
            writer_accesses: [ZERO; MAX_WRITERS],
        }
    }

    /// 現在存在するブロックの数.
    pub fn live_blocks(&self) -> u64 {
        self.live_blocks.load(Ordering::Relaxed)
    }

    /// いずれかのブロックに属しているページの数.
    pub fn used_pages(&self) -> u64 {
        self.used_pages.load(Ordering::Relaxed)
    }

    /// ページの使用率(`0.0..=1.0`).
    pub fn usage_rate(&self) -> f64 {
        self.used_pages() as f64 / self.page_count as f64
    }

    /// ブロックの平均ページ数.
    pub fn average_block_length(&self) -> f64 {
        let blocks = self.live_blocks();
        if blocks == 0 {
            0.0
        } else {
            self.used_pages() as f64 / blocks as f64
        }
    }

    /// 指定ライタがこのセグメント内のブロックを書き込み獲得した回数.
    pub fn writer_access_count(&self, writer: usize) -> u64 {
        self.writer_accesses
            .get(writer)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub(crate) fn block_created(&self, pages: u64) {
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.used_pages.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn block_deleted(&self, pages: u64) {
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.used_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    /// 切り出された`pages`は、新しいブロックの作成時に既に数えられている.
    pub(crate) fn block_carved(&self, pages: u64) {
        self.used_pages.fetch_sub(pages, Ordering::Relaxed);
    }

    pub(crate) fn blocks_merged(&self) {
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn writer_accessed(&self, writer: usize) {
        if let Some(c) = self.writer_accesses.get(writer) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// セグメントの保守処理用の情報.
#[derive(Debug, Default, Clone)]
pub struct MaintenanceInfo {
    /// 最後にロックされた時刻.
    pub locked_at: Option<Instant>,

    /// 分割の失敗によってブロック末尾に取り残されたページの累計.
    pub leaked_pages: u64,

    /// 併合処理の実行回数.
    pub merges: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accounting_works() {
        let stats = SegmentStats::new(16);
        assert_eq!(stats.average_block_length(), 0.0);

        stats.block_created(6);
        stats.block_created(2);
        assert_eq!(stats.usage_rate(), 0.5);
        assert_eq!(stats.average_block_length(), 4.0);

        stats.block_carved(2);
        stats.block_deleted(4);
        assert_eq!((stats.live_blocks(), stats.used_pages()), (1, 2));

        stats.writer_accessed(1);
        stats.writer_accessed(MAX_WRITERS);
        assert_eq!(stats.writer_access_count(1), 1);
        assert_eq!(stats.writer_access_count(MAX_WRITERS), 0);
    }
}
