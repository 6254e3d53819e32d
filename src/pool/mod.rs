//! ブロックプール.
//!
//! プールは全てのセグメントを所有し、ライタの要求に応じて空きブロックを探す
//! (見つからなければ新しいブロックやセグメントを作る).
//! セグメント表は読み込み主体の`RwLock`で保護され、セグメント単位の追加・削除時にのみ書き込みロックが取られる.
//! ブロック自体の操作はロックを一切使わない.
use prometrics::metrics::MetricBuilder;
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

pub use self::builder::PoolBuilder;

use crate::backoff;
use crate::block::{default_user_data_size, required_pages, Block, BlockState, CleanPolicy};
use crate::handle::{BlockHandle, HandleCodec, Location};
use crate::metrics::PoolMetrics;
use crate::registry::{RoleRegistry, WriterId};
use crate::segment::{PageAllocator, PageIndex, PageTag, Segment, SegmentId};
use crate::{Error, ErrorKind, Result};

mod builder;

/// プール内のブロックへの参照.
///
/// セグメントへの強参照を保持しているため、参照が残っている間はセグメントの解放が完了しない.
#[derive(Debug, Clone)]
pub struct BlockRef {
    segment: Arc<Segment>,
    head: PageIndex,
}
impl BlockRef {
    /// ブロックが属するセグメントを返す.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// ブロックの先頭ページを返す.
    pub fn head(&self) -> PageIndex {
        self.head
    }

    /// ブロックの位置を返す.
    pub fn location(&self) -> Location {
        Location {
            segment: self.segment.id(),
            page: self.head,
        }
    }

    /// ブロックを開く.
    ///
    /// ブロックが既に削除されている場合には`ErrorKind::BlockUnexpected`が返される.
    pub fn block(&self) -> Result<Block> {
        track!(self.segment.block(self.head))
    }
}

/// `Pool::collect_garbage`の結果.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcSummary {
    /// 削除されたブロックの数.
    pub deleted_blocks: u64,

    /// 削除によって`Idle`に戻ったページの数.
    pub reclaimed_pages: u64,

    /// 併合によって消滅したブロックの数.
    pub merged_blocks: u64,
}

/// ブロックプール.
///
/// `PoolBuilder`を使って生成する.
pub struct Pool {
    instance_uuid: Uuid,
    segment_page_count: usize,
    max_segments: usize,
    clean_policy: CleanPolicy,
    segments: RwLock<BTreeMap<SegmentId, Arc<Segment>>>,
    next_segment_id: AtomicU32,
    allocator: Box<dyn PageAllocator>,
    codec: HandleCodec,
    registry: RoleRegistry,
    logger: Logger,
    metrics: PoolMetrics,
}
impl Pool {
    #[allow(clippy::too_many_arguments)]
    fn new(
        instance_uuid: Uuid,
        segment_page_count: usize,
        max_segments: usize,
        clean_policy: CleanPolicy,
        allocator: Box<dyn PageAllocator>,
        codec: HandleCodec,
        logger: Logger,
        metrics: &MetricBuilder,
    ) -> Self {
        Pool {
            instance_uuid,
            segment_page_count,
            max_segments,
            clean_policy,
            segments: RwLock::new(BTreeMap::new()),
            next_segment_id: AtomicU32::new(0),
            allocator,
            codec,
            registry: RoleRegistry::new(),
            logger,
            metrics: PoolMetrics::new(metrics),
        }
    }

    /// プールインスタンスのUUIDを返す.
    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// ライタ・リーダの登録簿を返す.
    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// プールのメトリクスを返す.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// 現在保持しているセグメント群を、識別子の昇順で返す.
    pub fn segments(&self) -> Result<Vec<Arc<Segment>>> {
        let segments = track!(self.segments.read().map_err(Error::from))?;
        Ok(segments.values().cloned().collect())
    }

    /// 指定のセグメントを返す.
    pub fn segment(&self, id: SegmentId) -> Result<Option<Arc<Segment>>> {
        let segments = track!(self.segments.read().map_err(Error::from))?;
        Ok(segments.get(&id).cloned())
    }

    /// `size`バイトのユーザデータを持つブロックを、`writer`として書き込み獲得する.
    ///
    /// 既存セグメント内の空きブロック、`Idle`ページの並びの順に探し、
    /// どちらも無ければ(上限に達していない限り)新しいセグメントを作成する.
    ///
    /// # Errors
    ///
    /// - `size`が一つのセグメントに収まらない: `ErrorKind::InvalidInput`
    /// - 全セグメントが埋まっていて、新しいセグメントも作れない: `ErrorKind::PoolExhausted`
    /// - アロケータがセグメント用の領域を確保できなかった: `ErrorKind::OutOfMemory`
    pub fn acquire_for_writing(&self, size: u64, writer: WriterId) -> Result<BlockRef> {
        let need = track!(required_pages(size))?;
        track_assert!(
            need <= self.segment_page_count as u64,
            ErrorKind::InvalidInput,
            "Too large: size={}, need={}, segment_page_count={}",
            size,
            need,
            self.segment_page_count
        );

        for segment in track!(self.segments())? {
            if let Some(found) = track!(self.acquire_in(&segment, size, need, writer))? {
                return Ok(found);
            }
        }

        let segment = match self.create_segment() {
            Err(e) => {
                if *e.kind() == ErrorKind::PoolExhausted {
                    self.metrics.exhausted.increment();
                }
                return Err(track!(e));
            }
            Ok(segment) => segment,
        };
        if let Some(found) = track!(self.acquire_in(&segment, size, need, writer))? {
            return Ok(found);
        }
        self.metrics.exhausted.increment();
        track_panic!(
            ErrorKind::PoolExhausted,
            "No room even in a new segment: size={}",
            size
        );
    }

    /// ブロックのハンドルを返す.
    pub fn handle_of(&self, block: &BlockRef) -> Result<BlockHandle> {
        let generation = track!(block.segment.page_stats(block.head))?.generation();
        track!(self.codec.encode(block.location(), generation))
    }

    /// ハンドルが指すブロックを返す.
    ///
    /// ハンドル発行後にブロックが削除・併合された場合や、
    /// セグメントが解放された場合には`ErrorKind::StaleHandle`が返される.
    pub fn resolve_handle(&self, handle: BlockHandle) -> Result<BlockRef> {
        let location = self.codec.location(handle);
        let segment = track_assert_some!(
            track!(self.segment(location.segment))?,
            ErrorKind::StaleHandle,
            "No such segment: {}",
            location.segment
        );
        let generation = match segment.page_stats(location.page) {
            Ok(stats) => stats.generation(),
            Err(_) => track_panic!(ErrorKind::StaleHandle, "No such page: {}", location.page),
        };
        track!(self.codec.decode(handle, generation))?;
        track_assert_eq!(
            track!(segment.page(location.page))?.tag(),
            PageTag::Head,
            ErrorKind::StaleHandle,
            "handle={}",
            handle
        );
        Ok(BlockRef {
            segment,
            head: location.page,
        })
    }

    /// 設定された回収基準で、ブロックをクリーナとして獲得する.
    pub fn clean(&self, block: &BlockRef) -> Result<()> {
        let b = track!(block.block())?;
        track!(b.acquire_for_cleaning(self.clean_policy))
    }

    /// `CLEAN`状態のブロックを削除し、隣接する空きブロック同士を併合する.
    ///
    /// 並行して使用中のブロックは単に飛ばされる.
    pub fn collect_garbage(&self) -> Result<GcSummary> {
        let mut summary = GcSummary::default();
        for segment in track!(self.segments())? {
            if !segment.is_available() {
                continue;
            }
            for head in segment.block_heads() {
                let block = match segment.block(head) {
                    Ok(block) => block,
                    Err(_) => continue,
                };
                if block.state().ok() != Some(BlockState::Clean) {
                    continue;
                }
                match block.delete() {
                    Ok(deleted) => {
                        summary.deleted_blocks += 1;
                        summary.reclaimed_pages += deleted.pages;
                    }
                    Err(e) => track!(skip_contended(e))?,
                }
            }
            summary.merged_blocks += track!(merge_free_blocks(&segment))?;
        }
        if summary != GcSummary::default() {
            debug!(self.logger, "Garbage collected";
                   "deleted_blocks" => summary.deleted_blocks,
                   "reclaimed_pages" => summary.reclaimed_pages,
                   "merged_blocks" => summary.merged_blocks);
        }
        Ok(summary)
    }

    /// セグメントをプールから外して解放する.
    ///
    /// セグメントをロックした上で、他の`BlockRef`が全て破棄されるのを最大`timeout`まで待つ.
    /// タイムアウトした場合には、セグメントはロックされたままプールに戻される
    /// (新たなブロック操作は受け付けない).
    pub fn release_segment(&self, id: SegmentId, timeout: Duration) -> Result<()> {
        let segment = {
            let mut segments = track!(self.segments.write().map_err(Error::from))?;
            let segment = track_assert_some!(
                segments.remove(&id),
                ErrorKind::InvalidInput,
                "No such segment: {}",
                id
            );
            self.update_gauges(&segments);
            segment
        };
        if segment.is_available() {
            if let Err(e) = segment.lock() {
                track!(self.restore_segment(segment))?;
                return Err(track!(e));
            }
        }

        let waited = backoff::wait_until(timeout, || Arc::strong_count(&segment) == 1);
        if let Err(e) = waited {
            warn!(self.logger, "Segment is still referenced";
                  "segment" => id.as_u32(), "refs" => Arc::strong_count(&segment) - 1);
            track!(self.restore_segment(segment))?;
            return Err(track!(e));
        }
        let segment = match Arc::try_unwrap(segment) {
            Ok(segment) => segment,
            Err(segment) => {
                track!(self.restore_segment(segment))?;
                track_panic!(ErrorKind::Other, "Segment {} was cloned while releasing", id);
            }
        };
        track!(segment.release(timeout))?;
        self.metrics.released_segments.increment();
        Ok(())
    }

    fn acquire_in(
        &self,
        segment: &Arc<Segment>,
        size: u64,
        need: u64,
        writer: WriterId,
    ) -> Result<Option<BlockRef>> {
        if !segment.is_available() {
            return Ok(None);
        }
        let found = |head| BlockRef {
            segment: Arc::clone(segment),
            head,
        };

        for head in segment.block_heads() {
            let block = match segment.block(head) {
                Ok(block) => block,
                Err(_) => continue,
            };
            if block.page_span() < need
                || block.state().ok() != Some(BlockState::Free)
                || block.writer_refs() != 0
                || block.reader_refs() != 0
            {
                continue;
            }
            match block.acquire_for_writing(size, writer) {
                Ok(_) => return Ok(Some(found(head))),
                Err(e) => track!(skip_contended(e))?,
            }
        }

        for (start, len) in segment.idle_runs() {
            let span = len as u64;
            if span < need {
                continue;
            }
            let created = Block::create(
                segment,
                start,
                default_user_data_size(span),
                span,
                PageTag::Idle,
            );
            let block = match created {
                Ok(block) => block,
                Err(e) => {
                    track!(skip_contended(e))?;
                    continue;
                }
            };
            match block.acquire_for_writing(size, writer) {
                Ok(_) => return Ok(Some(found(start))),
                Err(e) => track!(skip_contended(e))?,
            }
        }
        Ok(None)
    }

    fn create_segment(&self) -> Result<Arc<Segment>> {
        let mut segments = track!(self.segments.write().map_err(Error::from))?;
        track_assert!(
            segments.len() < self.max_segments,
            ErrorKind::PoolExhausted,
            "Segment limit reached: {}",
            self.max_segments
        );
        let id = SegmentId::new(self.next_segment_id.fetch_add(1, Ordering::SeqCst));
        let created = Segment::create(
            id,
            self.segment_page_count,
            &*self.allocator,
            self.logger.clone(),
            self.metrics.blocks.clone(),
        );
        let segment = match created {
            Ok(segment) => Arc::new(segment),
            Err(e) => {
                error!(self.logger, "Cannot allocate a segment";
                       "segment" => id.as_u32(), "reason" => %e);
                self.metrics.allocation_failures.increment();
                return Err(track!(e));
            }
        };
        segments.insert(id, Arc::clone(&segment));
        self.update_gauges(&segments);
        self.metrics.created_segments.increment();
        Ok(segment)
    }

    fn restore_segment(&self, segment: Arc<Segment>) -> Result<()> {
        let mut segments = track!(self.segments.write().map_err(Error::from))?;
        segments.insert(segment.id(), segment);
        self.update_gauges(&segments);
        Ok(())
    }

    fn update_gauges(&self, segments: &BTreeMap<SegmentId, Arc<Segment>>) {
        let pages = segments.values().map(|s| s.page_count()).sum::<usize>();
        self.metrics.segments.set(segments.len() as f64);
        self.metrics.pages.set(pages as f64);
    }
}
impl Drop for Pool {
    fn drop(&mut self) {
        let segments = self.segments.read().map(|s| s.len()).unwrap_or(0);
        info!(self.logger, "Pool stopped"; "segments" => segments);
    }
}
impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("instance_uuid", &self.instance_uuid)
            .field("segment_page_count", &self.segment_page_count)
            .field("max_segments", &self.max_segments)
            .field("clean_policy", &self.clean_policy)
            .field("allocator", &self.allocator)
            .finish()
    }
}

/// 他のロールとの競合によるエラーであれば握りつぶす.
fn skip_contended(e: Error) -> Result<()> {
    match *e.kind() {
        ErrorKind::BlockUnexpected | ErrorKind::BlockUnreleased | ErrorKind::WriterConflict => {
            Ok(())
        }
        _ => Err(track!(e)),
    }
}

/// 隣接する空のフリーブロック同士を併合して、消滅したブロックの数を返す.
fn merge_free_blocks(segment: &Segment) -> Result<u64> {
    let mut merged = 0;
    let mut current: Option<Block> = None;
    for head in segment.block_heads() {
        let block = match segment.block(head) {
            Ok(block) => block,
            Err(_) => {
                current = None;
                continue;
            }
        };
        let empty_free = block.state().ok() == Some(BlockState::Free)
            && block.writer_refs() == 0
            && block.reader_refs() == 0
            && block.dtta().is_empty().unwrap_or(false);
        if !empty_free {
            current = None;
            continue;
        }
        if let Some(prev) = current {
            if u64::from(prev.head()) + prev.page_span() == u64::from(head) {
                match prev.merge(block) {
                    Ok(()) => {
                        merged += 1;
                        continue;
                    }
                    Err(e) => track!(skip_contended(e))?,
                }
            }
        }
        current = Some(block);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use trackable::result::TestResult;

    use super::*;
    use crate::segment::allocator::testutil::LimitedAllocator;
    use crate::segment::HeapAllocator;

    fn kind<T>(r: Result<T>) -> Option<ErrorKind> {
        r.err().map(|e| *e.kind())
    }

    fn pool(pages: usize, max_segments: usize) -> Result<Pool> {
        track!(PoolBuilder::new()
            .segment_page_count(pages)
            .max_segments(max_segments)
            .handle_key(0x5A5A_0F0F_1234_5678)
            .finish(HeapAllocator::new()))
    }

    #[test]
    fn builder_rejects_bad_settings() {
        let e = PoolBuilder::new()
            .segment_page_count(1)
            .finish(HeapAllocator::new());
        assert_eq!(kind(e), Some(ErrorKind::InvalidInput));

        let e = PoolBuilder::new().max_segments(0).finish(HeapAllocator::new());
        assert_eq!(kind(e), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn acquire_creates_segments_lazily() -> TestResult {
        let pool = track!(pool(16, 2))?;
        assert!(pool.segments()?.is_empty());
        let writer = track!(pool.registry().register_writer())?;

        let a = track!(pool.acquire_for_writing(1024, writer))?;
        assert_eq!(a.location().segment, SegmentId::new(0));
        assert_eq!(a.head(), 0);
        assert_eq!(track!(a.block())?.page_span(), 4);
        assert_eq!(pool.metrics().segments(), 1);
        assert_eq!(pool.metrics().pages(), 16);

        // 切り出された残りのブロックが再利用される
        let b = track!(pool.acquire_for_writing(1024, writer))?;
        assert_eq!(b.location().segment, SegmentId::new(0));
        assert_eq!(b.head(), 4);

        // 既存の空きブロックには収まらないので新しいセグメントが作られる
        let c = track!(pool.acquire_for_writing(4000, writer))?;
        assert_eq!(c.location().segment, SegmentId::new(1));
        assert_eq!(pool.metrics().created_segments(), 2);

        // 上限に達している
        let d = pool.acquire_for_writing(4000, writer);
        assert_eq!(kind(d), Some(ErrorKind::PoolExhausted));
        assert_eq!(pool.metrics().exhausted(), 1);

        let e = pool.acquire_for_writing(100_000, writer);
        assert_eq!(kind(e), Some(ErrorKind::InvalidInput));
        Ok(())
    }

    #[test]
    fn allocation_failure_is_reported() -> TestResult {
        let pool = track!(PoolBuilder::new()
            .segment_page_count(8)
            .finish(LimitedAllocator::new(0)))?;
        let writer = WriterId::new(0)?;
        let e = pool.acquire_for_writing(64, writer);
        assert_eq!(kind(e), Some(ErrorKind::OutOfMemory));
        assert_eq!(pool.metrics().allocation_failures(), 1);
        assert!(pool.segments()?.is_empty());
        Ok(())
    }

    #[test]
    fn handles_detect_staleness() -> TestResult {
        let pool = track!(pool(16, 1))?;
        let writer = WriterId::new(0)?;
        let reader = track!(crate::registry::ReaderId::new(writer, 0))?;

        // セグメント全体を使うブロック
        let r = track!(pool.acquire_for_writing(6400, writer))?;
        assert_eq!(track!(r.block())?.page_span(), 16);
        let handle = track!(pool.handle_of(&r))?;
        let resolved = track!(pool.resolve_handle(handle))?;
        assert_eq!(resolved.location(), r.location());

        let block = track!(r.block())?;
        track!(block.commit(writer))?;
        track!(block.acquire_for_reading(reader))?;
        block.release_from_reading(reader);
        track!(pool.clean(&r))?;

        let summary = track!(pool.collect_garbage())?;
        assert_eq!(summary.deleted_blocks, 1);
        assert_eq!(kind(pool.resolve_handle(handle)), Some(ErrorKind::StaleHandle));

        // 同じ位置に作り直されても古いハンドルは使えない
        let again = track!(pool.acquire_for_writing(6400, writer))?;
        assert_eq!(again.location(), r.location());
        assert_eq!(kind(pool.resolve_handle(handle)), Some(ErrorKind::StaleHandle));
        let fresh = track!(pool.handle_of(&again))?;
        assert_ne!(fresh, handle);
        track!(pool.resolve_handle(fresh))?;
        Ok(())
    }

    #[test]
    fn collect_garbage_merges_free_blocks() -> TestResult {
        let pool = track!(pool(32, 1))?;
        let writer = WriterId::new(0)?;

        // [a:2][b:2][rest:28]
        let a = track!(pool.acquire_for_writing(64, writer))?;
        let b = track!(pool.acquire_for_writing(64, writer))?;
        assert_eq!((a.head(), b.head()), (0, 2));
        for r in &[&a, &b] {
            let block = track!(r.block())?;
            track!(block.commit(writer))?;
            track!(pool.clean(r))?;
        }

        let summary = track!(pool.collect_garbage())?;
        assert_eq!(summary.deleted_blocks, 2);
        assert_eq!(summary.reclaimed_pages, 4);
        let segment = a.segment();
        assert_eq!(segment.block_heads(), vec![4]);
        assert_eq!(segment.idle_runs(), vec![(0, 4)]);

        // 空きブロックを二つ作って併合させる
        let c = track!(pool.acquire_for_writing(64, writer))?;
        track!(track!(c.block())?.cancel(writer))?;
        assert_eq!(c.head(), 4);
        let heads = segment.block_heads();
        assert_eq!(heads, vec![4, 6]);

        let summary = track!(pool.collect_garbage())?;
        assert_eq!(summary.merged_blocks, 1);
        assert_eq!(segment.block_heads(), vec![4]);
        assert_eq!(track!(segment.block(4))?.page_span(), 28);
        Ok(())
    }

    #[test]
    fn release_segment_waits_for_references() -> TestResult {
        let pool = track!(pool(16, 1))?;
        let writer = WriterId::new(0)?;
        let r = track!(pool.acquire_for_writing(64, writer))?;
        let id = r.location().segment;

        let e = pool.release_segment(id, Duration::from_millis(10));
        assert_eq!(kind(e), Some(ErrorKind::Timeout));
        assert_eq!(pool.segments()?.len(), 1);
        assert!(!r.segment().is_available());
        assert_eq!(
            kind(pool.acquire_for_writing(64, writer)),
            Some(ErrorKind::PoolExhausted)
        );

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(r);
        });
        track!(pool.release_segment(id, Duration::from_secs(10)))?;
        assert!(handle.join().is_ok());
        assert!(pool.segments()?.is_empty());
        assert_eq!(pool.metrics().released_segments(), 1);
        assert_eq!(pool.metrics().segments(), 0);
        Ok(())
    }
}
