use byteorder::{ByteOrder, LittleEndian};
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use uuid::Uuid;

use super::Pool;
use crate::block::{CleanPolicy, MIN_BLOCK_PAGES};
use crate::handle::{HandleCodec, MAX_SEGMENT_ID};
use crate::segment::{PageAllocator, PageIndex};
use crate::{ErrorKind, Result};

/// `Pool`のビルダ.
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    segment_page_count: usize,
    max_segments: usize,
    handle_key: Option<u64>,
    instance_uuid: Option<Uuid>,
    clean_policy: CleanPolicy,
    logger: Logger,
    metrics: MetricBuilder,
}
impl PoolBuilder {
    /// デフォルト設定で`PoolBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        PoolBuilder {
            segment_page_count: 2048,
            max_segments: 64,
            handle_key: None,
            instance_uuid: None,
            clean_policy: CleanPolicy::default(),
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// セグメント一つ当たりのページ数を設定する.
    ///
    /// 一つのブロックはセグメントを跨げないため、この値が書き込み獲得可能なサイズの上限を決める.
    ///
    /// デフォルト値は`2048`(1MiB).
    pub fn segment_page_count(&mut self, pages: usize) -> &mut Self {
        self.segment_page_count = pages;
        self
    }

    /// 同時に保持可能なセグメントの最大数を設定する.
    ///
    /// デフォルト値は`64`.
    pub fn max_segments(&mut self, n: usize) -> &mut Self {
        self.max_segments = n;
        self
    }

    /// ハンドルの難読化に使うキーを設定する.
    ///
    /// 指定されなかった場合には、インスタンスのUUIDから導出される.
    pub fn handle_key(&mut self, key: u64) -> &mut Self {
        self.handle_key = Some(key);
        self
    }

    /// プールインスタンスを識別するためのUUIDを設定する.
    ///
    /// 指定されなかった場合には、ランダムなUUIDが割り当てられる.
    pub fn instance_uuid(&mut self, uuid: Uuid) -> &mut Self {
        self.instance_uuid = Some(uuid);
        self
    }

    /// `Pool::clean`で使われる回収基準を設定する.
    ///
    /// デフォルト値は`CleanPolicy::Any`.
    pub fn clean_policy(&mut self, policy: CleanPolicy) -> &mut Self {
        self.clean_policy = policy;
        self
    }

    /// プール用のロガーを登録する.
    ///
    /// デフォルト値は`Logger::root(Discard, o!())`.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 指定のアロケータを使ってページ領域を確保する`Pool`を生成する.
    ///
    /// セグメントは最初の書き込み獲得時に作成される.
    pub fn finish<A>(&self, allocator: A) -> Result<Pool>
    where
        A: PageAllocator + 'static,
    {
        track_assert!(
            self.segment_page_count >= MIN_BLOCK_PAGES,
            ErrorKind::InvalidInput,
            "Too few pages per segment: {}",
            self.segment_page_count
        );
        track_assert!(
            self.segment_page_count <= PageIndex::max_value() as usize,
            ErrorKind::InvalidInput,
            "Too many pages per segment: {}",
            self.segment_page_count
        );
        track_assert!(
            self.max_segments >= 1 && self.max_segments <= MAX_SEGMENT_ID as usize,
            ErrorKind::InvalidInput,
            "Bad max_segments: {}",
            self.max_segments
        );

        let instance_uuid = self.instance_uuid.unwrap_or_else(Uuid::new_v4);
        let key = self.handle_key.unwrap_or_else(|| {
            let bytes = instance_uuid.as_bytes();
            LittleEndian::read_u64(&bytes[..8]) ^ LittleEndian::read_u64(&bytes[8..])
        });
        let logger = self
            .logger
            .new(o!("pool" => instance_uuid.to_simple().to_string()));
        info!(logger, "Pool started";
              "segment_page_count" => self.segment_page_count,
              "max_segments" => self.max_segments);
        Ok(Pool::new(
            instance_uuid,
            self.segment_page_count,
            self.max_segments,
            self.clean_policy,
            Box::new(allocator),
            HandleCodec::new(key),
            logger,
            &self.metrics,
        ))
    }
}
impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
