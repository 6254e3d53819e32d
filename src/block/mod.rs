//! ブロック: セグメント内の連続したページから構成される可変長レコード.
//!
//! ブロックのアドレス空間は、構成ページのペイロードを連結したもの.
//! オフセット`0`はヘッダの先頭を指す.
//!
//! ```text
//! 0           128                 128+lut_offset      +416
//! +-----------+-------------------+-------------------+-----------------------+
//! |  header   |     user data     |    DTTA table     |   descriptor pool     |
//! +-----------+-------------------+-------------------+-----------------------+
//! ```
//!
//! 先頭7ページのインデックスはヘッダ内のページキャッシュに保持され、
//! それ以降のページには、7ページ目から前方リンクを辿って到達する.
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

pub use self::acquire::CleanPolicy;
pub use self::header::{BlockState, PAGE_CACHE_LEN};

use crate::dtta::{self, Dtta};
use crate::registry::WriterId;
use crate::segment::{Page, PageIndex, PageTag, Segment, PAGE_PAYLOAD_SIZE};
use crate::{ErrorKind, Result};

mod acquire;
pub(crate) mod header;

/// ブロックヘッダのバイトサイズ.
pub const HEADER_SIZE: u64 = 128;

/// ブロックを構成する最小ページ数.
pub const MIN_BLOCK_PAGES: usize = 2;

/// 書き込み獲得時に、記述子領域として最低限確保されるバイト数.
pub const MIN_DESCRIPTOR_POOL: u64 = 64;

const PAYLOAD: u64 = PAGE_PAYLOAD_SIZE as u64;

/// `size`バイトのユーザデータを格納するために必要なページ数を返す.
///
/// ヘッダとDTTAテーブルに加えて、ユーザデータの約10%(最低`MIN_DESCRIPTOR_POOL`バイト)を
/// 記述子領域として見込んでいる.
pub fn required_pages(size: u64) -> Result<u64> {
    let headroom = (size / 10).max(MIN_DESCRIPTOR_POOL);
    let total = track_assert_some!(
        HEADER_SIZE
            .checked_add(size)
            .and_then(|n| n.checked_add(dtta::TABLE_SIZE))
            .and_then(|n| n.checked_add(headroom)),
        ErrorKind::InvalidInput,
        "Too large: {}",
        size
    );
    Ok((total + PAYLOAD - 1) / PAYLOAD)
}

/// `span`ページの空きブロックに割り当てる、デフォルトのユーザデータ領域サイズを返す.
pub fn default_user_data_size(span: u64) -> u64 {
    (span * PAYLOAD).saturating_sub(HEADER_SIZE + dtta::TABLE_SIZE) * 9 / 10
}

/// 削除されたブロックの情報.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedBlock {
    /// 解放されたページ数.
    pub pages: u64,

    /// 最後の所有ライタ.
    pub writer: u32,

    /// コミット時刻(UNIXエポックからのナノ秒). 未コミットなら`0`.
    pub timestamp: u64,
}

/// セグメント内のブロックへのビュー.
#[derive(Clone, Copy)]
pub struct Block<'a> {
    segment: &'a Segment,
    head: PageIndex,
    page: &'a Page,
}
impl<'a> Block<'a> {
    /// `head`を先頭ページとする既存ブロックを開く.
    pub(crate) fn open(segment: &'a Segment, head: PageIndex) -> Result<Self> {
        let page = track!(segment.page(head))?;
        track_assert_eq!(
            page.tag(),
            PageTag::Head,
            ErrorKind::BlockUnexpected,
            "Not a block head: segment={}, page={}",
            segment.id(),
            head
        );
        let block = Block {
            segment,
            head,
            page,
        };
        let span = block.page_span();
        track_assert!(
            span >= 1 && u64::from(head) + span <= segment.page_count() as u64,
            ErrorKind::BlockCorrupted,
            "Bad page span: segment={}, page={}, span={}",
            segment.id(),
            head,
            span
        );
        Ok(block)
    }

    /// 新しい空きブロックを作成する.
    ///
    /// 対象ページ群は`expected`タグを持っている必要がある
    /// (新規の場合は`Idle`、分割の残りの場合は`Mid`).
    /// いずれかのページのロックに失敗した場合には、ロック済みのページを元に戻して
    /// `ErrorKind::BlockUnexpected`を返す.
    pub(crate) fn create(
        segment: &'a Segment,
        head: PageIndex,
        user_data_size: u64,
        span: u64,
        expected: PageTag,
    ) -> Result<Self> {
        track_assert!(
            segment.is_available(),
            ErrorKind::BlockUnexpected,
            "Segment under maintenance: {}",
            segment.id()
        );
        track_assert!(span >= MIN_BLOCK_PAGES as u64, ErrorKind::InvalidInput, "Too short: {}", span);
        track_assert!(
            u64::from(head) + span <= segment.page_count() as u64,
            ErrorKind::InvalidInput,
            "Out of segment: head={}, span={}",
            head,
            span
        );
        let needed = track_assert_some!(
            HEADER_SIZE
                .checked_add(user_data_size)
                .and_then(|n| n.checked_add(dtta::TABLE_SIZE)),
            ErrorKind::InvalidInput
        );
        track_assert!(
            needed <= span * PAYLOAD,
            ErrorKind::InvalidInput,
            "Too large user data: size={}, span={}",
            user_data_size,
            span
        );

        let pages = (0..span)
            .map(|i| head + i as PageIndex)
            .collect::<Vec<_>>();
        track!(lock_pages(segment, &pages, expected))?;

        let page = track!(segment.page(head))?;
        let block = Block {
            segment,
            head,
            page,
        };
        let generation = track!(segment.page_stats(head))?.next_generation();
        block.store(header::STATE, header::pack(BlockState::Free, 0));
        block.store(header::TIMESTAMP, 0);
        block.store(header::SPAN, span);
        block.store(header::LUT_OFFSET, user_data_size);
        for i in 0..PAGE_CACHE_LEN {
            let index = pages.get(i).map_or(header::NO_PAGE, |&p| u64::from(p));
            block.store(header::PAGE_CACHE + i, index);
        }
        block.store(header::WRITER_REFS, 0);
        block.store(header::READER_REFS, 0);
        block.store(header::VISITED, 0);
        block.store(header::GENERATION, generation);
        block.store(header::RESERVED, 0);
        for (i, &index) in pages.iter().enumerate() {
            let p = track!(segment.page(index))?;
            p.set_prev(if i == 0 { None } else { Some(pages[i - 1]) });
            p.set_next(pages.get(i + 1).cloned());
        }
        track!(dtta::initialize(&block))?;

        for &index in pages.iter().skip(1) {
            let ok = track!(segment.page(index))?.transition(PageTag::Locked, PageTag::Mid);
            track_assert!(ok, ErrorKind::BlockUnexpected, "Page stolen: {}", index);
        }
        let ok = page.transition(PageTag::Locked, PageTag::Head);
        track_assert!(ok, ErrorKind::BlockUnexpected, "Page stolen: {}", head);

        segment.stats().block_created(span);
        segment.metrics().created_blocks.increment();
        debug!(segment.logger(), "Block created";
               "head" => head, "span" => span, "user_data_size" => user_data_size);
        Ok(block)
    }

    /// ブロックを削除して、構成ページを`Idle`に戻す.
    ///
    /// 参照ビットが一つでも立っている場合には`ErrorKind::BlockUnreleased`が返される.
    pub fn delete(self) -> Result<DeletedBlock> {
        track_assert!(
            self.page.transition(PageTag::Head, PageTag::Locked),
            ErrorKind::BlockUnexpected,
            "Already locked: segment={}, page={}",
            self.segment.id(),
            self.head
        );
        if self.has_references() {
            self.page.transition(PageTag::Locked, PageTag::Head);
            track_panic!(ErrorKind::BlockUnreleased, "{:?}", self);
        }
        let pages = match self.pages() {
            Ok(pages) => pages,
            Err(e) => {
                self.page.transition(PageTag::Locked, PageTag::Head);
                return Err(track!(e));
            }
        };
        if let Err(e) = lock_pages(self.segment, &pages[1..], PageTag::Mid) {
            self.page.transition(PageTag::Locked, PageTag::Head);
            return Err(track!(e));
        }

        let word = self.load(header::STATE);
        let deleted = DeletedBlock {
            pages: pages.len() as u64,
            writer: header::writer_of(word),
            timestamp: self.load(header::TIMESTAMP),
        };
        self.store(header::SPAN, 0);
        track!(self.segment.page_stats(self.head))?.invalidate();
        for &index in pages.iter().rev() {
            let p = track!(self.segment.page(index))?;
            p.set_prev(None);
            p.set_next(None);
            p.transition(PageTag::Locked, PageTag::Idle);
        }

        self.segment.stats().block_deleted(deleted.pages);
        self.segment.metrics().deleted_blocks.increment();
        debug!(self.segment.logger(), "Block deleted";
               "head" => self.head, "span" => deleted.pages, "writer" => deleted.writer);
        Ok(deleted)
    }

    /// 直後に隣接する空きブロック`next`を、このブロックに併合する.
    ///
    /// 両ブロックとも`FREE`状態で、参照ビットが全て落ちており、DTTAが空である必要がある.
    pub fn merge(self, next: Block<'a>) -> Result<()> {
        track_assert!(ptr::eq(self.segment, next.segment), ErrorKind::InvalidInput);
        let span = self.page_span();
        track_assert_eq!(
            u64::from(self.head) + span,
            u64::from(next.head),
            ErrorKind::InvalidInput,
            "Not adjacent"
        );

        track_assert!(
            self.page.transition(PageTag::Head, PageTag::Locked),
            ErrorKind::BlockUnexpected,
            "Already locked: {}",
            self.head
        );
        if !next.page.transition(PageTag::Head, PageTag::Locked) {
            self.page.transition(PageTag::Locked, PageTag::Head);
            track_panic!(ErrorKind::BlockUnexpected, "Already locked: {}", next.head);
        }
        let unlock = || {
            next.page.transition(PageTag::Locked, PageTag::Head);
            self.page.transition(PageTag::Locked, PageTag::Head);
        };
        if self.has_references() || next.has_references() {
            unlock();
            track_panic!(ErrorKind::BlockUnreleased, "{:?}, {:?}", self, next);
        }
        let mergeable = |b: &Block| -> Result<bool> {
            Ok(track!(b.state())? == BlockState::Free && track!(dtta::entry_count(b))? == 0)
        };
        match (mergeable(&self), mergeable(&next)) {
            (Ok(true), Ok(true)) => {}
            (Err(e), _) | (_, Err(e)) => {
                unlock();
                return Err(track!(e));
            }
            _ => {
                unlock();
                track_panic!(ErrorKind::BlockUnexpected, "Not an empty free block");
            }
        }

        let next_pages = match next.pages() {
            Ok(pages) => pages,
            Err(e) => {
                unlock();
                return Err(track!(e));
            }
        };
        let last = track!(self.page_of(span - 1))?;
        let new_span = span + next_pages.len() as u64;

        next.store(header::SPAN, 0);
        track!(self.segment.page_stats(next.head))?.invalidate();
        next.page.set_prev(Some(last));
        track!(self.segment.page(last))?.set_next(Some(next.head));
        next.page.transition(PageTag::Locked, PageTag::Mid);

        for (i, &index) in next_pages.iter().enumerate() {
            let slot = span as usize + i;
            if slot < PAGE_CACHE_LEN {
                self.store(header::PAGE_CACHE + slot, u64::from(index));
            }
        }
        self.store(header::SPAN, new_span);
        self.store(header::LUT_OFFSET, default_user_data_size(new_span));
        track!(dtta::initialize(&self))?;
        self.page.transition(PageTag::Locked, PageTag::Head);

        self.segment.stats().blocks_merged();
        self.segment.metrics().merged_blocks.increment();
        track!(self.segment.record_merge())?;
        debug!(self.segment.logger(), "Blocks merged";
               "head" => self.head, "merged" => next.head, "span" => new_span);
        Ok(())
    }

    /// このブロックを所有するセグメントを返す.
    pub fn segment(&self) -> &'a Segment {
        self.segment
    }

    /// 先頭ページのインデックスを返す.
    pub fn head(&self) -> PageIndex {
        self.head
    }

    /// 現在の状態を返す.
    pub fn state(&self) -> Result<BlockState> {
        track!(header::state_of(self.load(header::STATE)))
    }

    /// 所有ライタの識別子を返す.
    pub fn writer(&self) -> u32 {
        header::writer_of(self.load(header::STATE))
    }

    /// コミット時刻を返す.
    pub fn timestamp(&self) -> u64 {
        self.load(header::TIMESTAMP)
    }

    /// ブロックを構成するページ数を返す.
    pub fn page_span(&self) -> u64 {
        self.load(header::SPAN)
    }

    /// ユーザデータ領域のサイズ(DTTAテーブルの開始位置)を返す.
    pub fn user_data_size(&self) -> u64 {
        self.load(header::LUT_OFFSET)
    }

    /// ブロックのアドレス空間全体のバイト数を返す.
    pub fn capacity(&self) -> u64 {
        self.page_span() * PAYLOAD
    }

    /// ライタ参照ビットマップを返す.
    pub fn writer_refs(&self) -> u64 {
        self.load(header::WRITER_REFS)
    }

    /// リーダ参照ビットマップを返す.
    pub fn reader_refs(&self) -> u64 {
        self.load(header::READER_REFS)
    }

    /// リーダの訪問済みビットマップを返す.
    pub fn visited(&self) -> u64 {
        self.load(header::VISITED)
    }

    /// ブロック作成時の世代番号を返す.
    pub fn generation(&self) -> u64 {
        self.load(header::GENERATION)
    }

    /// ブロックのDTTAを返す.
    pub fn dtta(&self) -> Dtta<'a> {
        Dtta::new(*self)
    }

    /// ブロック内の`page_no`番目のページのインデックスを返す.
    pub fn page_of(&self, page_no: u64) -> Result<PageIndex> {
        let span = self.page_span();
        track_assert!(
            page_no < span,
            ErrorKind::IllegalOffset,
            "page_no={}, span={}",
            page_no,
            span
        );
        if (page_no as usize) < PAGE_CACHE_LEN {
            let index = self.load(header::PAGE_CACHE + page_no as usize);
            track_assert_ne!(index, header::NO_PAGE, ErrorKind::BlockCorrupted);
            return Ok(index as PageIndex);
        }
        let mut index = self.load(header::PAGE_CACHE + PAGE_CACHE_LEN - 1) as PageIndex;
        for _ in (PAGE_CACHE_LEN as u64 - 1)..page_no {
            index = track_assert_some!(
                track!(self.segment.page(index))?.next(),
                ErrorKind::BlockCorrupted,
                "Broken page chain: head={}, page_no={}",
                self.head,
                page_no
            );
        }
        Ok(index)
    }

    /// ユーザデータ領域の`offset`位置から`buf`分のバイト列を読み込む.
    pub fn read_user_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track!(self.check_user_range(offset, buf.len() as u64))?;
        track!(self.read_bytes(HEADER_SIZE + offset, buf))
    }

    /// ユーザデータ領域の`offset`位置に`data`を書き込む.
    ///
    /// `writer`がこのブロックを書き込み獲得している必要がある.
    pub fn write_user_data(&self, writer: WriterId, offset: u64, data: &[u8]) -> Result<()> {
        track!(self.check_writer(writer))?;
        track!(self.check_user_range(offset, data.len() as u64))?;
        track!(self.write_bytes(HEADER_SIZE + offset, data))
    }

    pub(crate) fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        track!(self.check_range(offset, buf.len() as u64))?;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = track!(self.page_of(pos / PAYLOAD))?;
            let within = (pos % PAYLOAD) as usize;
            let n = (PAGE_PAYLOAD_SIZE - within).min(buf.len() - done);
            track!(self.segment.page(index))?.read_payload(within, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        track!(self.check_range(offset, data.len() as u64))?;
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let index = track!(self.page_of(pos / PAYLOAD))?;
            let within = (pos % PAYLOAD) as usize;
            let n = (PAGE_PAYLOAD_SIZE - within).min(data.len() - done);
            track!(self.segment.page(index))?.write_payload(within, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0; 8];
        track!(self.read_bytes(offset, &mut buf))?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub(crate) fn write_u64(&self, offset: u64, n: u64) -> Result<()> {
        let mut buf = [0; 8];
        LittleEndian::write_u64(&mut buf, n);
        track!(self.write_bytes(offset, &buf))
    }

    pub(crate) fn check_writer(&self, writer: WriterId) -> Result<()> {
        track_assert!(
            self.writer_refs() & writer.bit() != 0,
            ErrorKind::BlockUnexpected,
            "{} does not hold the block",
            writer
        );
        track_assert_eq!(track!(self.state())?, BlockState::Free, ErrorKind::BlockUnexpected);
        Ok(())
    }

    pub(crate) fn word(&self, i: usize) -> &'a AtomicU64 {
        debug_assert!(i < header::WORDS);
        self.page.word(i)
    }

    fn load(&self, i: usize) -> u64 {
        self.word(i).load(Ordering::SeqCst)
    }

    fn store(&self, i: usize, value: u64) {
        self.word(i).store(value, Ordering::SeqCst)
    }

    fn has_references(&self) -> bool {
        self.writer_refs() != 0 || self.reader_refs() != 0
    }

    fn pages(&self) -> Result<Vec<PageIndex>> {
        (0..self.page_span()).map(|i| self.page_of(i)).collect()
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = track_assert_some!(offset.checked_add(len), ErrorKind::IllegalOffset);
        track_assert!(
            end <= self.capacity(),
            ErrorKind::IllegalOffset,
            "offset={}, len={}, capacity={}",
            offset,
            len,
            self.capacity()
        );
        Ok(())
    }

    fn check_user_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = track_assert_some!(offset.checked_add(len), ErrorKind::IllegalOffset);
        track_assert!(
            end <= self.user_data_size(),
            ErrorKind::IllegalOffset,
            "offset={}, len={}, user_data_size={}",
            offset,
            len,
            self.user_data_size()
        );
        Ok(())
    }
}
impl<'a> fmt::Debug for Block<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Block")
            .field("segment", &self.segment.id())
            .field("head", &self.head)
            .field("state", &self.state().ok())
            .field("writer", &self.writer())
            .field("span", &self.page_span())
            .field("writer_refs", &format_args!("0x{:x}", self.writer_refs()))
            .field("reader_refs", &format_args!("0x{:x}", self.reader_refs()))
            .finish()
    }
}

/// `pages`を`expected`から`Locked`に遷移させる.
///
/// 途中で失敗した場合には、ロック済みのページを`expected`に戻す.
fn lock_pages(segment: &Segment, pages: &[PageIndex], expected: PageTag) -> Result<()> {
    for (i, &index) in pages.iter().enumerate() {
        let page = track!(segment.page(index))?;
        if !page.transition(expected, PageTag::Locked) {
            for &locked in &pages[..i] {
                if let Ok(p) = segment.page(locked) {
                    p.transition(PageTag::Locked, expected);
                }
            }
            track_panic!(
                ErrorKind::BlockUnexpected,
                "Cannot lock page: segment={}, page={}, expected={:?}, actual={:?}",
                segment.id(),
                index,
                expected,
                page.tag()
            );
        }
    }
    Ok(())
}
