//! ライタ・リーダ・クリーナによるブロックの獲得と解放.
//!
//! 各ロールは、ヘッダ内の参照ビットマップをアトミックに操作することでブロックを獲得する.
//! 中央のロックは存在しない.
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use super::header::{self, BlockState};
use super::{default_user_data_size, required_pages, Block};
use crate::dtta;
use crate::registry::{ReaderId, WriterId};
use crate::segment::{PageIndex, PageTag};
use crate::{ErrorKind, Result};

/// クリーナがブロックを回収してよいかの判断基準.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanPolicy {
    /// 参照ビットが全て落ちていれば、訪問履歴に関わらず回収する.
    Any,

    /// `subscribers`で指定されたリーダ群(スロット番号のビットマップ)が
    /// 全員訪問済みの場合にのみ回収する.
    AllVisited {
        /// 訪問を待つリーダのスロット番号のビットマップ.
        subscribers: u64,
    },
}
impl Default for CleanPolicy {
    fn default() -> Self {
        CleanPolicy::Any
    }
}

impl<'a> Block<'a> {
    /// ライタとしてブロックを獲得する.
    ///
    /// `FREE`状態のブロックでのみ成功する.
    /// 成功した場合には、ユーザデータ領域が`size`バイトに変更され、DTTAが空に初期化される.
    ///
    /// ブロックに余剰ページがある場合には、末尾が新しい空きブロックとして切り出され、
    /// その先頭ページが返される.
    /// 切り出しに失敗した場合でも獲得自体は成功し、余剰ページはこのブロックに残される.
    ///
    /// # Errors
    ///
    /// - 必要ページ数がブロックのページ数を超える、あるいは`FREE`でない: `ErrorKind::BlockUnexpected`
    /// - いずれかの参照ビットが立っている: `ErrorKind::BlockUnreleased`
    /// - 他のライタとの競合に負けた: `ErrorKind::WriterConflict`
    pub fn acquire_for_writing(&self, size: u64, writer: WriterId) -> Result<Option<PageIndex>> {
        let generation = self.generation();
        track!(self.check_available())?;
        let need = track!(required_pages(size))?;
        let span = self.page_span();
        track_assert!(
            need <= span,
            ErrorKind::BlockUnexpected,
            "Too small block: need={}, span={}",
            need,
            span
        );
        track_assert_eq!(track!(self.state())?, BlockState::Free, ErrorKind::BlockUnexpected);
        track_assert!(
            self.writer_refs() == 0 && self.reader_refs() == 0,
            ErrorKind::BlockUnreleased,
            "{:?}",
            self
        );

        let claimed = self.word(header::WRITER_REFS).compare_exchange(
            0,
            writer.bit(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if let Err(current) = claimed {
            self.segment.metrics().write_conflicts.increment();
            track_panic!(
                ErrorKind::WriterConflict,
                "{} lost the race: writer_refs=0x{:x}",
                writer,
                current
            );
        }
        if let Err(e) = self.confirm_writer(generation) {
            self.release_from_writing(writer);
            return Err(track!(e));
        }

        let _ = self
            .word(header::STATE)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                Some(header::with_writer(w, writer.as_u32()))
            });
        let carved = track!(self.carve(need))?;
        self.word(header::LUT_OFFSET).store(size, Ordering::SeqCst);
        track!(dtta::initialize(self))?;

        self.segment.stats().writer_accessed(writer.as_u32() as usize);
        self.segment.metrics().acquisitions.writer.increment();
        Ok(carved)
    }

    /// リーダとしてブロックを獲得する.
    ///
    /// `USING`状態かつ、リーダの購読対象(`reader_id >> 32`)がブロックの所有ライタと一致する場合にのみ成功する.
    /// 同じリーダが同じ`USING`期間中に二度獲得することはできない.
    pub fn acquire_for_reading(&self, reader: ReaderId) -> Result<()> {
        let generation = self.generation();
        track!(self.check_available())?;
        track_assert_eq!(track!(self.state())?, BlockState::Using, ErrorKind::BlockUnexpected);
        track_assert_eq!(
            reader.affinity(),
            self.writer(),
            ErrorKind::BlockUnexpected,
            "{} is not subscribed to the owner",
            reader
        );

        let bit = reader.bit();
        let visited = self.word(header::VISITED).fetch_or(bit, Ordering::SeqCst);
        track_assert!(
            visited & bit == 0,
            ErrorKind::BlockUnexpected,
            "{} already visited",
            reader
        );
        self.word(header::READER_REFS)
            .fetch_or(bit, Ordering::SeqCst);

        let still_using = self.page.tag() == PageTag::Head
            && self.state().ok() == Some(BlockState::Using)
            && self.generation() == generation;
        if !still_using {
            self.word(header::READER_REFS)
                .fetch_and(!bit, Ordering::SeqCst);
            self.word(header::VISITED).fetch_and(!bit, Ordering::SeqCst);
            track_panic!(ErrorKind::BlockUnexpected, "Changed while acquiring: {:?}", self);
        }
        self.segment.metrics().acquisitions.reader.increment();
        Ok(())
    }

    /// クリーナとしてブロックを獲得し、`CLEAN`状態に遷移させる.
    ///
    /// 成功した場合には、訪問済みビットマップがリセットされる.
    pub fn acquire_for_cleaning(&self, policy: CleanPolicy) -> Result<()> {
        track!(self.check_available())?;
        track_assert_eq!(track!(self.state())?, BlockState::Using, ErrorKind::BlockUnexpected);
        track_assert!(
            self.writer_refs() == 0 && self.reader_refs() == 0,
            ErrorKind::BlockUnreleased,
            "{:?}",
            self
        );
        if let CleanPolicy::AllVisited { subscribers } = policy {
            let visited = self.visited();
            track_assert_eq!(
                visited & subscribers,
                subscribers,
                ErrorKind::BlockUnreleased,
                "Not visited yet"
            );
        }

        let cleaned = self
            .word(header::STATE)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                match header::state_of(w) {
                    Ok(BlockState::Using) => Some(header::with_state(w, BlockState::Clean)),
                    _ => None,
                }
            })
            .is_ok();
        track_assert!(cleaned, ErrorKind::BlockUnexpected, "Lost the race: {:?}", self);

        if self.reader_refs() != 0 || self.writer_refs() != 0 {
            let _ = self
                .word(header::STATE)
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                    Some(header::with_state(w, BlockState::Using))
                });
            track_panic!(ErrorKind::BlockUnreleased, "Late reader: {:?}", self);
        }
        self.word(header::VISITED).store(0, Ordering::SeqCst);
        self.segment.metrics().acquisitions.cleaner.increment();
        Ok(())
    }

    /// ライタの参照ビットを落とす.
    ///
    /// 既に落ちている場合には何もしない.
    pub fn release_from_writing(&self, writer: WriterId) {
        self.word(header::WRITER_REFS)
            .fetch_and(!writer.bit(), Ordering::SeqCst);
    }

    /// リーダの参照ビットを落とす.
    ///
    /// 既に落ちている場合には何もしない.
    pub fn release_from_reading(&self, reader: ReaderId) {
        self.word(header::READER_REFS)
            .fetch_and(!reader.bit(), Ordering::SeqCst);
    }

    /// 書き込みを確定して`USING`状態に遷移させ、ライタの参照ビットを落とす.
    pub fn commit(&self, writer: WriterId) -> Result<()> {
        track!(self.check_writer(writer))?;
        self.word(header::TIMESTAMP)
            .store(now_nanos(), Ordering::SeqCst);
        let committed = self
            .word(header::STATE)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                match header::state_of(w) {
                    Ok(BlockState::Free) => Some(header::with_state(w, BlockState::Using)),
                    _ => None,
                }
            })
            .is_ok();
        track_assert!(committed, ErrorKind::BlockUnexpected, "{:?}", self);
        self.release_from_writing(writer);
        self.segment.metrics().commits.increment();
        Ok(())
    }

    /// 書き込みを取り消す.
    ///
    /// DTTAを空に戻してから、ライタの参照ビットを落とす. ブロックは`FREE`のまま.
    pub fn cancel(&self, writer: WriterId) -> Result<()> {
        track!(self.check_writer(writer))?;
        track!(dtta::initialize(self))?;
        self.release_from_writing(writer);
        Ok(())
    }

    /// 指定ライタが書き込み獲得中かどうかを返す.
    pub fn is_held_by(&self, writer: WriterId) -> bool {
        self.writer_refs() & writer.bit() != 0
    }

    /// 参照ビットを立てた後に、ブロックが削除・再作成されていないことを確認する.
    ///
    /// タグを世代より先に読む必要がある.
    /// 再作成は世代を書き換えた後にタグを`Head`に戻すので、
    /// `Head`を観測した後に読んだ世代は再作成後の値になっている.
    fn confirm_writer(&self, generation: u64) -> Result<()> {
        let unchanged = self.page.tag() == PageTag::Head
            && self.state().ok() == Some(BlockState::Free)
            && self.reader_refs() == 0
            && self.generation() == generation;
        track_assert!(
            unchanged,
            ErrorKind::BlockUnexpected,
            "Changed while acquiring: generation={}, {:?}",
            generation,
            self
        );
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        track_assert!(
            self.segment.is_available(),
            ErrorKind::BlockUnexpected,
            "Segment under maintenance: {}",
            self.segment.id()
        );
        Ok(())
    }

    /// `need`ページ目以降を新しい空きブロックとして切り出す.
    ///
    /// 余剰が一ページ以下の場合には何もしない.
    fn carve(&self, need: u64) -> Result<Option<PageIndex>> {
        let span = self.page_span();
        if span <= need + 1 {
            return Ok(None);
        }
        let rest = span - need;
        let head = track!(self.page_of(need))?;
        let last = track!(self.page_of(need - 1))?;
        match Block::create(
            self.segment,
            head,
            default_user_data_size(rest),
            rest,
            PageTag::Mid,
        ) {
            Ok(_) => {
                track!(self.segment.page(last))?.set_next(None);
                for i in (need as usize)..header::PAGE_CACHE_LEN {
                    self.word(header::PAGE_CACHE + i)
                        .store(header::NO_PAGE, Ordering::SeqCst);
                }
                self.word(header::SPAN).store(need, Ordering::SeqCst);
                self.segment.stats().block_carved(rest);
                self.segment.metrics().carved_blocks.increment();
                Ok(Some(head))
            }
            Err(e) => {
                warn!(self.segment.logger(), "Failed to carve a free block; pages are leaked";
                      "head" => self.head, "leaked_pages" => rest, "reason" => %e);
                self.segment.metrics().carve_failures.increment();
                self.segment.metrics().leaked_pages.add_u64(rest);
                track!(self.segment.record_leak(rest))?;
                Ok(None)
            }
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
