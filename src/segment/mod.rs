//! セグメント: 一度に確保される連続したページ群.
//!
//! セグメントはページ領域、ページ毎の統計情報、セグメント全体の統計情報、
//! および保守処理用の情報を所有する.
//! ブロックはセグメント内の連続したページを切り出して作られる.
use slog::Logger;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use self::allocator::{HeapAllocator, PageAllocator};
pub use self::page::{Page, PageIndex, PageStats, PageTag, PAGE_PAYLOAD_SIZE, PAGE_SIZE};
pub use self::stats::{MaintenanceInfo, SegmentStats};

use crate::backoff;
use crate::block::{Block, MIN_BLOCK_PAGES};
use crate::metrics::BlockMetrics;
use crate::{ErrorKind, Result};

pub(crate) mod allocator;
mod page;
mod stats;

/// セグメントの識別子.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u32);
impl SegmentId {
    /// 新しい`SegmentId`インスタンスを生成する.
    pub fn new(id: u32) -> Self {
        SegmentId(id)
    }

    /// 識別子の値を返す.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}
impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// セグメントの状態.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// 通常稼働中.
    Idle = 0,

    /// 保守処理が完了し、解放可能.
    Locked = 1,

    /// 保守処理のため、ページの静止を待っている.
    Busy = 2,

    /// 異常状態.
    Error = 3,
}
impl SegmentState {
    fn from_u8(n: u8) -> Self {
        match n {
            0 => SegmentState::Idle,
            1 => SegmentState::Locked,
            2 => SegmentState::Busy,
            _ => SegmentState::Error,
        }
    }
}

/// セグメント.
pub struct Segment {
    id: SegmentId,
    state: AtomicU8,
    pages: Vec<Page>,
    page_stats: Vec<PageStats>,
    stats: SegmentStats,
    maintenance: Mutex<MaintenanceInfo>,
    logger: Logger,
    metrics: BlockMetrics,
}
impl Segment {
    /// 新しいセグメントを作成する.
    ///
    /// `allocator`による確保が失敗した場合には、そのエラーがそのまま返される.
    pub(crate) fn create(
        id: SegmentId,
        page_count: usize,
        allocator: &dyn PageAllocator,
        logger: Logger,
        metrics: BlockMetrics,
    ) -> Result<Self> {
        track_assert!(
            page_count >= MIN_BLOCK_PAGES,
            ErrorKind::InvalidInput,
            "Too few pages: {}",
            page_count
        );
        track_assert!(
            page_count <= PageIndex::max_value() as usize,
            ErrorKind::InvalidInput,
            "Too many pages: {}",
            page_count
        );
        let pages = track!(allocator.allocate_pages(page_count))?;
        track_assert_eq!(pages.len(), page_count, ErrorKind::OutOfMemory);
        let page_stats = track!(allocator.allocate_page_stats(page_count))?;
        track_assert_eq!(page_stats.len(), page_count, ErrorKind::OutOfMemory);

        let logger = logger.new(o!("segment" => id.as_u32()));
        info!(logger, "Segment created"; "pages" => page_count);
        Ok(Segment {
            id,
            state: AtomicU8::new(SegmentState::Idle as u8),
            pages,
            page_stats,
            stats: SegmentStats::new(page_count as u64),
            maintenance: Mutex::new(MaintenanceInfo::default()),
            logger,
            metrics,
        })
    }

    /// セグメントの識別子を返す.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// ページ数を返す.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// 現在の状態を返す.
    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// 通常稼働中かどうかを返す.
    pub fn is_available(&self) -> bool {
        self.state() == SegmentState::Idle
    }

    /// セグメント単位の統計情報を返す.
    pub fn stats(&self) -> &SegmentStats {
        &self.stats
    }

    /// 保守処理用の情報のスナップショットを返す.
    pub fn maintenance_info(&self) -> Result<MaintenanceInfo> {
        let info = track!(self.maintenance.lock().map_err(crate::Error::from))?;
        Ok(info.clone())
    }

    /// 指定位置のページを返す.
    pub fn page(&self, index: PageIndex) -> Result<&Page> {
        let page = track_assert_some!(
            self.pages.get(index as usize),
            ErrorKind::InvalidInput,
            "No such page: segment={}, page={}",
            self.id,
            index
        );
        Ok(page)
    }

    /// 指定位置のページの統計情報を返す.
    pub fn page_stats(&self, index: PageIndex) -> Result<&PageStats> {
        let stats = track_assert_some!(
            self.page_stats.get(index as usize),
            ErrorKind::InvalidInput,
            "No such page: segment={}, page={}",
            self.id,
            index
        );
        Ok(stats)
    }

    /// `head`を先頭ページとするブロックを返す.
    pub fn block(&self, head: PageIndex) -> Result<Block> {
        track!(Block::open(self, head))
    }

    /// 現在存在するブロックの先頭ページ一覧を返す.
    ///
    /// 並行して作成・削除されているブロックについては、結果に含まれるかどうかは不定.
    pub fn block_heads(&self) -> Vec<PageIndex> {
        let mut heads = Vec::new();
        let mut i = 0;
        while i < self.pages.len() {
            let index = i as PageIndex;
            if self.pages[i].tag() == PageTag::Head {
                let span = Block::open(self, index).map(|b| b.page_span()).unwrap_or(1);
                heads.push(index);
                i += (span as usize).max(1);
            } else {
                i += 1;
            }
        }
        heads
    }

    /// 連続した`Idle`ページの並びを`(開始位置, ページ数)`の形式で返す.
    pub fn idle_runs(&self) -> Vec<(PageIndex, usize)> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, page) in self.pages.iter().enumerate() {
            match (page.tag() == PageTag::Idle, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push((s as PageIndex, i - s));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push((s as PageIndex, self.pages.len() - s));
        }
        runs
    }

    /// 保守処理のためにセグメントをロックする.
    ///
    /// セグメントおよび全ページの状態が`Busy`になる.
    /// 呼び出し元は、その後`wait_quiesced`で全ページが`Locked`に緩和されるのを待つ必要がある.
    pub fn lock(&self) -> Result<()> {
        let locked = self
            .state
            .compare_exchange(
                SegmentState::Idle as u8,
                SegmentState::Busy as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        track_assert!(
            locked,
            ErrorKind::BlockUnexpected,
            "Cannot lock segment {}: {:?}",
            self.id,
            self.state()
        );
        for page in &self.pages {
            page.force_tag(PageTag::Busy);
        }
        track!(self.maintenance.lock().map_err(crate::Error::from))?.locked_at =
            Some(Instant::now());
        debug!(self.logger, "Segment locked");
        Ok(())
    }

    /// `Busy`状態のページを`Locked`に緩和する.
    ///
    /// ページを使用していた側が、使用を終えたことを通知するために呼び出す.
    pub fn relax(&self, index: PageIndex) -> Result<bool> {
        let page = track!(self.page(index))?;
        Ok(page.transition(PageTag::Busy, PageTag::Locked))
    }

    /// 全てのページが`Locked`に緩和されるまで待機する.
    pub fn wait_quiesced(&self, timeout: Duration) -> Result<()> {
        track_assert_eq!(self.state(), SegmentState::Busy, ErrorKind::BlockUnexpected);
        track!(backoff::wait_until(timeout, || self
            .pages
            .iter()
            .all(|p| p.tag() == PageTag::Locked)))?;
        self.state
            .store(SegmentState::Locked as u8, Ordering::SeqCst);
        Ok(())
    }

    /// セグメントを解放する.
    ///
    /// ロックされていなければロックし、全ページの静止を確認してから、
    /// ページ領域と統計情報を破棄する.
    pub fn release(self, timeout: Duration) -> Result<()> {
        if self.state() == SegmentState::Idle {
            track!(self.lock())?;
        }
        if self.state() == SegmentState::Busy {
            for i in 0..self.pages.len() {
                track!(self.relax(i as PageIndex))?;
            }
            track!(self.wait_quiesced(timeout))?;
        }
        track_assert_eq!(self.state(), SegmentState::Locked, ErrorKind::BlockUnexpected);
        info!(self.logger, "Segment released";
              "pages" => self.pages.len(),
              "live_blocks" => self.stats.live_blocks());
        Ok(())
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    pub(crate) fn metrics(&self) -> &BlockMetrics {
        &self.metrics
    }

    pub(crate) fn record_leak(&self, pages: u64) -> Result<()> {
        let mut info = track!(self.maintenance.lock().map_err(crate::Error::from))?;
        info.leaked_pages += pages;
        Ok(())
    }

    pub(crate) fn record_merge(&self) -> Result<()> {
        let mut info = track!(self.maintenance.lock().map_err(crate::Error::from))?;
        info.merges += 1;
        Ok(())
    }
}
impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pages", &self.pages.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use prometrics::metrics::MetricBuilder;
    use slog::{Discard, Logger};

    use super::*;
    use crate::metrics::PoolMetrics;

    /// ヒープ上に確保したテスト用のセグメントを返す.
    pub fn segment(pages: usize) -> Result<Segment> {
        let metrics = PoolMetrics::new(&MetricBuilder::new()).blocks;
        track!(Segment::create(
            SegmentId::new(0),
            pages,
            &HeapAllocator::new(),
            Logger::root(Discard, o!()),
            metrics
        ))
    }
}
