use std::fmt;

use super::page::{Page, PageStats};
use crate::{ErrorKind, Result};

/// セグメントのページ領域を確保するためのトレイト.
///
/// 確保に失敗した場合には`ErrorKind::OutOfMemory`を返す必要がある.
/// 呼び出し側がリトライすることはない.
pub trait PageAllocator: fmt::Debug + Send + Sync {
    /// ゼロ初期化済みのページを`count`個確保する.
    ///
    /// 各ページのシーケンス番号は、配列内のインデックスとなる.
    fn allocate_pages(&self, count: usize) -> Result<Vec<Page>>;

    /// ページ毎の統計情報を`count`個分確保する.
    fn allocate_page_stats(&self, count: usize) -> Result<Vec<PageStats>>;
}

/// ヒープ上にページを確保するアロケータ.
#[derive(Debug, Default, Clone)]
pub struct HeapAllocator;
impl HeapAllocator {
    /// 新しい`HeapAllocator`インスタンスを生成する.
    pub fn new() -> Self {
        HeapAllocator
    }
}
impl PageAllocator for HeapAllocator {
    fn allocate_pages(&self, count: usize) -> Result<Vec<Page>> {
        track_assert_ne!(count, 0, ErrorKind::InvalidInput);
        let mut pages = Vec::new();
        track!(pages.try_reserve_exact(count).map_err(crate::Error::from))?;
        pages.extend((0..count).map(|i| Page::new(i as u64)));
        Ok(pages)
    }

    fn allocate_page_stats(&self, count: usize) -> Result<Vec<PageStats>> {
        let mut stats = Vec::new();
        track!(stats.try_reserve_exact(count).map_err(crate::Error::from))?;
        stats.extend((0..count).map(|_| PageStats::default()));
        Ok(stats)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// 指定回数だけ確保に成功し、それ以降は失敗するアロケータ.
    #[derive(Debug)]
    pub struct LimitedAllocator {
        remaining: AtomicUsize,
    }
    impl LimitedAllocator {
        pub fn new(successes: usize) -> Self {
            LimitedAllocator {
                remaining: AtomicUsize::new(successes),
            }
        }
    }
    impl PageAllocator for LimitedAllocator {
        fn allocate_pages(&self, count: usize) -> Result<Vec<Page>> {
            let ok = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            track_assert!(ok, ErrorKind::OutOfMemory);
            track!(HeapAllocator.allocate_pages(count))
        }

        fn allocate_page_stats(&self, count: usize) -> Result<Vec<PageStats>> {
            track!(HeapAllocator.allocate_page_stats(count))
        }
    }
}
