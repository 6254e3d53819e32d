//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, Gauge, MetricBuilder};

/// プール全体のメトリクス.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub(crate) segments: Gauge,
    pub(crate) pages: Gauge,
    pub(crate) created_segments: Counter,
    pub(crate) released_segments: Counter,
    pub(crate) allocation_failures: Counter,
    pub(crate) exhausted: Counter,
    pub(crate) blocks: BlockMetrics,
}
impl PoolMetrics {
    /// 現在保持しているセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_pool_segments <GAUGE>
    /// ```
    pub fn segments(&self) -> u64 {
        self.segments.value() as u64
    }

    /// 現在保持しているページの総数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_pool_pages <GAUGE>
    /// ```
    pub fn pages(&self) -> u64 {
        self.pages.value() as u64
    }

    /// 作成されたセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_pool_created_segments_total <COUNTER>
    /// ```
    pub fn created_segments(&self) -> u64 {
        self.created_segments.value() as u64
    }

    /// 解放されたセグメントの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_pool_released_segments_total <COUNTER>
    /// ```
    pub fn released_segments(&self) -> u64 {
        self.released_segments.value() as u64
    }

    /// アロケータがページ領域の確保に失敗した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_pool_allocation_failures_total <COUNTER>
    /// ```
    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures.value() as u64
    }

    /// 空きブロックが見つからずに書き込み獲得が失敗した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_pool_exhausted_total <COUNTER>
    /// ```
    pub fn exhausted(&self) -> u64 {
        self.exhausted.value() as u64
    }

    /// ブロック操作のメトリクス.
    pub fn blocks(&self) -> &BlockMetrics {
        &self.blocks
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("blockpool").subsystem("pool");
        PoolMetrics {
            segments: builder
                .gauge("segments")
                .help("Number of live segments")
                .finish()
                .expect("Never fails"),
            pages: builder
                .gauge("pages")
                .help("Number of pages owned by live segments")
                .finish()
                .expect("Never fails"),
            created_segments: builder
                .counter("created_segments_total")
                .help("Number of created segments")
                .finish()
                .expect("Never fails"),
            released_segments: builder
                .counter("released_segments_total")
                .help("Number of released segments")
                .finish()
                .expect("Never fails"),
            allocation_failures: builder
                .counter("allocation_failures_total")
                .help("Number of failed page arena allocations")
                .finish()
                .expect("Never fails"),
            exhausted: builder
                .counter("exhausted_total")
                .help("Number of write acquisitions that found no free block")
                .finish()
                .expect("Never fails"),
            blocks: BlockMetrics::new(&builder),
        }
    }
}

/// ブロック操作のメトリクス.
#[derive(Debug, Clone)]
pub struct BlockMetrics {
    pub(crate) created_blocks: Counter,
    pub(crate) deleted_blocks: Counter,
    pub(crate) carved_blocks: Counter,
    pub(crate) carve_failures: Counter,
    pub(crate) leaked_pages: Counter,
    pub(crate) merged_blocks: Counter,
    pub(crate) commits: Counter,
    pub(crate) write_conflicts: Counter,
    pub(crate) acquisitions: RoleCounter,
}
impl BlockMetrics {
    /// 作成されたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_created_blocks_total <COUNTER>
    /// ```
    pub fn created_blocks(&self) -> u64 {
        self.created_blocks.value() as u64
    }

    /// 削除されたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_deleted_blocks_total <COUNTER>
    /// ```
    pub fn deleted_blocks(&self) -> u64 {
        self.deleted_blocks.value() as u64
    }

    /// 書き込み獲得時の分割で切り出された空きブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_carved_blocks_total <COUNTER>
    /// ```
    pub fn carved_blocks(&self) -> u64 {
        self.carved_blocks.value() as u64
    }

    /// 分割に失敗した回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_carve_failures_total <COUNTER>
    /// ```
    pub fn carve_failures(&self) -> u64 {
        self.carve_failures.value() as u64
    }

    /// 分割の失敗によって、ブロック末尾に取り残されたページの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_leaked_pages_total <COUNTER>
    /// ```
    pub fn leaked_pages(&self) -> u64 {
        self.leaked_pages.value() as u64
    }

    /// 隣接する空きブロックに併合されて消えたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_merged_blocks_total <COUNTER>
    /// ```
    pub fn merged_blocks(&self) -> u64 {
        self.merged_blocks.value() as u64
    }

    /// ライタによってコミットされたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_commits_total <COUNTER>
    /// ```
    pub fn commits(&self) -> u64 {
        self.commits.value() as u64
    }

    /// ライタ同士の獲得競合に負けた回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_write_conflicts_total <COUNTER>
    /// ```
    pub fn write_conflicts(&self) -> u64 {
        self.write_conflicts.value() as u64
    }

    /// ロール毎の獲得成功数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// blockpool_block_acquisitions_total { role="writer|reader|cleaner" } <COUNTER>
    /// ```
    pub fn acquisitions(&self) -> &RoleCounter {
        &self.acquisitions
    }

    fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.subsystem("block");
        let counter = |name: &str, help: &str| {
            builder
                .counter(name)
                .help(help)
                .finish()
                .expect("Never fails")
        };
        BlockMetrics {
            created_blocks: counter("created_blocks_total", "Number of created blocks"),
            deleted_blocks: counter("deleted_blocks_total", "Number of deleted blocks"),
            carved_blocks: counter("carved_blocks_total", "Number of carved free blocks"),
            carve_failures: counter("carve_failures_total", "Number of failed carves"),
            leaked_pages: counter(
                "leaked_pages_total",
                "Number of pages left behind by failed carves",
            ),
            merged_blocks: counter("merged_blocks_total", "Number of merged free blocks"),
            commits: counter("commits_total", "Number of committed blocks"),
            write_conflicts: counter(
                "write_conflicts_total",
                "Number of lost write acquisition races",
            ),
            acquisitions: RoleCounter::new(&builder, "acquisitions_total", "Number of acquisitions"),
        }
    }
}

/// ロール(ライタ・リーダ・クリーナ)毎のカウンタ.
#[derive(Debug, Clone)]
pub struct RoleCounter {
    pub(crate) writer: Counter,
    pub(crate) reader: Counter,
    pub(crate) cleaner: Counter,
}
impl RoleCounter {
    /// ライタの数.
    pub fn writer(&self) -> u64 {
        self.writer.value() as u64
    }

    /// リーダの数.
    pub fn reader(&self) -> u64 {
        self.reader.value() as u64
    }

    /// クリーナの数.
    pub fn cleaner(&self) -> u64 {
        self.cleaner.value() as u64
    }

    fn new(builder: &MetricBuilder, name: &str, help: &str) -> Self {
        let counter = |role| {
            builder
                .counter(name)
                .help(help)
                .label("role", role)
                .finish()
                .expect("Never fails")
        };
        RoleCounter {
            writer: counter("writer"),
            reader: counter("reader"),
            cleaner: counter("cleaner"),
        }
    }
}
