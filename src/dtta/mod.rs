//! DTTA (dynamic type tracking): ブロック内に埋め込まれた型情報のルックアップテーブル.
//!
//! テーブルはユーザデータ領域の直後(ブロックオフセット`128 + lut_offset`)に配置される.
//!
//! ```text
//! +--------------------------------------------------------------+
//! | entry count | first entry offset | pool start | pool length   |  32 bytes
//! +--------------------------------------------------------------+
//! | data offset | descriptor offset | descriptor length |  x 16      24 bytes each
//! +--------------------------------------------------------------+
//! | descriptor pool (append only, up to the end of the block)    |
//! +--------------------------------------------------------------+
//! ```
//!
//! エントリは`data offset`(ユーザデータ領域先頭からの相対位置)の昇順に並ぶ.
//! エントリは追加・更新・並べ替えのみが可能で、削除はできない.
//! テーブルを変更できるのは、ブロックを書き込み獲得しているライタのみ.
use crate::block::{Block, HEADER_SIZE};
use crate::descriptor::TypeDescriptor;
use crate::registry::WriterId;
use crate::{ErrorKind, Result};

pub use self::traverse::Target;

mod traverse;

/// エントリの最大数.
pub const MAX_ENTRIES: usize = 16;

/// エントリ一つのバイトサイズ.
pub const ENTRY_SIZE: u64 = 24;

/// テーブルヘッダのバイトサイズ.
pub const TABLE_HEADER_SIZE: u64 = 32;

/// テーブル(ヘッダと全エントリ)のバイトサイズ.
pub const TABLE_SIZE: u64 = TABLE_HEADER_SIZE + ENTRY_SIZE * MAX_ENTRIES as u64;

const ENTRY_COUNT: u64 = 0;
const FIRST_ENTRY: u64 = 8;
const POOL_START: u64 = 16;
const POOL_LEN: u64 = 24;

/// テーブルのエントリ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// 変数のユーザデータ領域内での開始位置.
    pub data_offset: u64,

    /// 記述子のブロック内での位置.
    pub descriptor_offset: u64,

    /// 記述子のバイト数.
    pub descriptor_len: u64,
}

/// 登録済みの変数.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// ユーザデータ領域内での開始位置.
    pub offset: u64,

    /// バイト数.
    pub size: u64,

    /// 型記述子.
    pub descriptor: Vec<u8>,
}
impl ObjectInfo {
    /// 変数の終端位置を返す.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// `Dtta::query`の結果.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// 指定位置を含む変数.
    Object(ObjectInfo),

    /// 指定位置を含む、型が登録されていない領域(`start..end`).
    Gap {
        /// 直前の変数の終端(なければ`0`).
        start: u64,

        /// 直後の変数の開始位置(なければユーザデータ領域のサイズ).
        end: u64,
    },
}

/// ブロックのDTTAへのビュー.
#[derive(Debug, Clone, Copy)]
pub struct Dtta<'a> {
    block: Block<'a>,
}
impl<'a> Dtta<'a> {
    pub(crate) fn new(block: Block<'a>) -> Self {
        Dtta { block }
    }

    /// 登録済みエントリの数を返す.
    pub fn len(&self) -> Result<usize> {
        track!(entry_count(&self.block)).map(|n| n as usize)
    }

    /// エントリが一つも無いかどうかを返す.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// 全エントリを`data_offset`の昇順で返す.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let count = track!(entry_count(&self.block))?;
        let first = track!(self.read_header(FIRST_ENTRY))?;
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let offset = first + i * ENTRY_SIZE;
            let entry = Entry {
                data_offset: track!(self.block.read_u64(offset))?,
                descriptor_offset: track!(self.block.read_u64(offset + 8))?,
                descriptor_len: track!(self.block.read_u64(offset + 16))?,
            };
            track_assert!(
                self.is_in_block(&entry),
                ErrorKind::BlockCorrupted,
                "Broken DTTA entry: index={}, entry={:?}",
                i,
                entry
            );
            entries.push(entry);
        }
        Ok(entries)
    }

    /// エントリの型記述子を返す.
    ///
    /// 記述子の範囲がブロック外を指す場合には`ErrorKind::IllegalOffset`となる.
    pub fn descriptor(&self, entry: &Entry) -> Result<Vec<u8>> {
        track_assert!(
            self.is_in_block(entry),
            ErrorKind::IllegalOffset,
            "entry={:?}, capacity={}",
            entry,
            self.block.capacity()
        );
        let mut buf = vec![0; entry.descriptor_len as usize];
        track!(self.block.read_bytes(entry.descriptor_offset, &mut buf))?;
        Ok(buf)
    }

    /// 記述子領域の残りバイト数を返す.
    pub fn free_descriptor_space(&self) -> Result<u64> {
        let start = track!(self.read_header(POOL_START))?;
        let used = track!(self.read_header(POOL_LEN))?;
        Ok(self.block.capacity().saturating_sub(start + used))
    }

    /// `data_offset`に、`descriptor`で表される変数を登録する.
    ///
    /// # Errors
    ///
    /// - 記述子が不正、あるいは幅が`0`: `ErrorKind::IllegalDescriptor`
    /// - 変数がユーザデータ領域に収まらない: `ErrorKind::IllegalOffset`
    /// - エントリ数が上限に達している: `ErrorKind::LutFull`
    /// - 既存の変数と範囲が重なる: `ErrorKind::DataConflict`
    /// - 記述子領域に空きがない: `ErrorKind::DttaOverflow`
    pub fn add(&self, writer: WriterId, data_offset: u64, descriptor: &[u8]) -> Result<()> {
        track!(self.block.check_writer(writer))?;
        let width = track!(self.validate(data_offset, descriptor))?;

        let mut entries = track!(self.entries())?;
        track_assert!(
            entries.len() < MAX_ENTRIES,
            ErrorKind::LutFull,
            "data_offset={}",
            data_offset
        );
        let position = track!(self.find_slot(&entries, data_offset, width))?;

        let start = track!(self.read_header(POOL_START))?;
        let used = track!(self.read_header(POOL_LEN))?;
        let len = descriptor.len() as u64;
        track_assert!(
            len <= track!(self.free_descriptor_space())?,
            ErrorKind::DttaOverflow,
            "descriptor_len={}, used={}",
            len,
            used
        );
        track!(self.block.write_bytes(start + used, descriptor))?;
        entries.insert(
            position,
            Entry {
                data_offset,
                descriptor_offset: start + used,
                descriptor_len: len,
            },
        );
        track!(self.write_entries(&entries))?;
        track!(self.write_header(POOL_LEN, used + len))?;
        Ok(())
    }

    /// `old_offset`に登録済みの変数を、`new_offset`に移動しつつ記述子を上書きする.
    ///
    /// 新旧の記述子は、長さと先頭タグが一致している必要がある.
    pub fn modify(
        &self,
        writer: WriterId,
        old_offset: u64,
        new_offset: u64,
        descriptor: &[u8],
    ) -> Result<()> {
        track!(self.block.check_writer(writer))?;
        let width = track!(self.validate(new_offset, descriptor))?;

        let mut entries = track!(self.entries())?;
        let index = match entries.binary_search_by_key(&old_offset, |e| e.data_offset) {
            Ok(index) => index,
            Err(_) => track_panic!(ErrorKind::EntryNotFound, "old_offset={}", old_offset),
        };
        let entry = entries.remove(index);
        let old = track!(self.descriptor(&entry))?;
        track_assert!(
            old.len() == descriptor.len() && old.first() == descriptor.first(),
            ErrorKind::DescriptorMismatch,
            "old={:?}, new={:?}",
            old,
            descriptor
        );
        let position = track!(self.find_slot(&entries, new_offset, width))?;

        track!(self.block.write_bytes(entry.descriptor_offset, descriptor))?;
        entries.insert(
            position,
            Entry {
                data_offset: new_offset,
                ..entry
            },
        );
        track!(self.write_entries(&entries))?;
        Ok(())
    }

    /// ユーザデータ領域内の`offset`を含む変数、あるいは未登録領域を返す.
    ///
    /// `offset`はユーザデータ領域のサイズ未満である必要がある.
    pub fn query(&self, offset: u64) -> Result<Lookup> {
        let limit = self.block.user_data_size();
        track_assert!(
            offset < limit,
            ErrorKind::IllegalOffset,
            "offset={}, user_data_size={}",
            offset,
            limit
        );
        let entries = track!(self.entries())?;
        let index = entries.partition_point(|e| e.data_offset <= offset);
        let mut start = 0;
        if index > 0 {
            let object = track!(self.object(&entries[index - 1]))?;
            if offset < object.end() {
                return Ok(Lookup::Object(object));
            }
            start = object.end();
        }
        let end = entries.get(index).map_or(limit, |e| e.data_offset);
        Ok(Lookup::Gap { start, end })
    }

    fn object(&self, entry: &Entry) -> Result<ObjectInfo> {
        let descriptor = track!(self.descriptor(entry))?;
        let size = track!(crate::descriptor::object_size(&descriptor))?;
        Ok(ObjectInfo {
            offset: entry.data_offset,
            size,
            descriptor,
        })
    }

    /// 記述子を検証して、変数の幅を返す.
    fn validate(&self, data_offset: u64, descriptor: &[u8]) -> Result<u64> {
        let parsed = track!(TypeDescriptor::from_bytes(descriptor))?;
        let width = track!(parsed.object_size())?;
        track_assert_ne!(width, 0, ErrorKind::IllegalDescriptor, "Zero width");
        let end = track_assert_some!(data_offset.checked_add(width), ErrorKind::IllegalOffset);
        track_assert!(
            end <= self.block.user_data_size(),
            ErrorKind::IllegalOffset,
            "data_offset={}, width={}, user_data_size={}",
            data_offset,
            width,
            self.block.user_data_size()
        );
        Ok(width)
    }

    /// `data_offset..data_offset+width`を挿入すべき位置を返す.
    ///
    /// 前後の変数と重なる場合には`ErrorKind::DataConflict`となる.
    fn find_slot(&self, entries: &[Entry], data_offset: u64, width: u64) -> Result<usize> {
        let position = entries.partition_point(|e| e.data_offset < data_offset);
        if position > 0 {
            let prev = track!(self.object(&entries[position - 1]))?;
            track_assert!(
                prev.end() <= data_offset,
                ErrorKind::DataConflict,
                "Overlaps the preceding object: prev={}..{}, new={}",
                prev.offset,
                prev.end(),
                data_offset
            );
        }
        if let Some(next) = entries.get(position) {
            track_assert!(
                data_offset + width <= next.data_offset,
                ErrorKind::DataConflict,
                "Overlaps the following object: new={}..{}, next={}",
                data_offset,
                data_offset + width,
                next.data_offset
            );
        }
        Ok(position)
    }

    fn write_entries(&self, entries: &[Entry]) -> Result<()> {
        let first = track!(self.read_header(FIRST_ENTRY))?;
        for (i, e) in entries.iter().enumerate() {
            let offset = first + i as u64 * ENTRY_SIZE;
            track!(self.block.write_u64(offset, e.data_offset))?;
            track!(self.block.write_u64(offset + 8, e.descriptor_offset))?;
            track!(self.block.write_u64(offset + 16, e.descriptor_len))?;
        }
        track!(self.write_header(ENTRY_COUNT, entries.len() as u64))
    }

    fn is_in_block(&self, entry: &Entry) -> bool {
        entry
            .descriptor_offset
            .checked_add(entry.descriptor_len)
            .map_or(false, |end| end <= self.block.capacity())
    }

    fn read_header(&self, field: u64) -> Result<u64> {
        track!(self.block.read_u64(table_offset(&self.block) + field))
    }

    fn write_header(&self, field: u64, value: u64) -> Result<()> {
        track!(self.block.write_u64(table_offset(&self.block) + field, value))
    }
}

/// ブロックのDTTAを空の状態に初期化する.
pub(crate) fn initialize(block: &Block) -> Result<()> {
    let table = table_offset(block);
    track!(block.write_u64(table + ENTRY_COUNT, 0))?;
    track!(block.write_u64(table + FIRST_ENTRY, table + TABLE_HEADER_SIZE))?;
    track!(block.write_u64(table + POOL_START, table + TABLE_SIZE))?;
    track!(block.write_u64(table + POOL_LEN, 0))?;
    Ok(())
}

pub(crate) fn entry_count(block: &Block) -> Result<u64> {
    let count = track!(block.read_u64(table_offset(block) + ENTRY_COUNT))?;
    track_assert!(
        count <= MAX_ENTRIES as u64,
        ErrorKind::BlockCorrupted,
        "Too many DTTA entries: {}",
        count
    );
    Ok(count)
}

fn table_offset(block: &Block) -> u64 {
    HEADER_SIZE + block.user_data_size()
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::block::testutil::free_block;
    use crate::block::Block;
    use crate::registry::WriterId;
    use crate::segment::Segment;
    use crate::Result;

    /// `writer`が`size`バイトで書き込み獲得したブロックを返す.
    pub fn acquired_block(segment: &Segment, size: u64, writer: WriterId) -> Result<Block> {
        let block = track!(free_block(segment, 0, segment.page_count() as u64))?;
        track!(block.acquire_for_writing(size, writer))?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::testutil::acquired_block;
    use super::*;
    use crate::descriptor::{ClassField, Tag, TypeDescriptor};
    use crate::segment::testutil::segment;

    fn kind<T>(r: Result<T>) -> Option<ErrorKind> {
        r.err().map(|e| *e.kind())
    }

    #[test]
    fn add_and_query() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();
        assert!(dtta.is_empty()?);

        track!(dtta.add(writer, 8, &[Tag::I4.as_u8()]))?;
        track!(dtta.add(writer, 0, &[Tag::U8.as_u8()]))?;
        track!(dtta.add(writer, 100, &[0x0E, 10, 0, 0, 0]))?;
        let offsets = dtta
            .entries()?
            .iter()
            .map(|e| e.data_offset)
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 8, 100]);

        match dtta.query(0)? {
            Lookup::Object(o) => assert_eq!((o.offset, o.size), (0, 8)),
            other => panic!("{:?}", other),
        }
        match dtta.query(110)? {
            Lookup::Object(o) => {
                assert_eq!((o.offset, o.size), (100, 20));
                assert_eq!(o.descriptor, vec![0x0E, 10, 0, 0, 0]);
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(dtta.query(12)?, Lookup::Gap { start: 12, end: 100 });
        assert_eq!(dtta.query(255)?, Lookup::Gap { start: 120, end: 256 });
        assert_eq!(kind(dtta.query(256)), Some(ErrorKind::IllegalOffset));
        Ok(())
    }

    #[test]
    fn query_is_total() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 64, writer))?;
        let dtta = block.dtta();
        track!(dtta.add(writer, 4, &[Tag::I4.as_u8()]))?;
        track!(dtta.add(writer, 8, &[Tag::U2.as_u8()]))?;
        track!(dtta.add(writer, 40, &[Tag::R8.as_u8(), 0]))?;

        for offset in 0..64 {
            match dtta.query(offset)? {
                Lookup::Object(o) => assert!(o.offset <= offset && offset < o.end()),
                Lookup::Gap { start, end } => assert!(start <= offset && offset < end),
            }
        }
        Ok(())
    }

    #[test]
    fn overlapping_add_is_rejected() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();

        track!(dtta.add(writer, 0, &[Tag::I4.as_u8()]))?;
        assert_eq!(
            kind(dtta.add(writer, 2, &[Tag::Char.as_u8()])),
            Some(ErrorKind::DataConflict)
        );
        assert_eq!(
            kind(dtta.add(writer, 0, &[Tag::U1.as_u8()])),
            Some(ErrorKind::DataConflict)
        );
        track!(dtta.add(writer, 10, &[Tag::I4.as_u8()]))?;
        assert_eq!(
            kind(dtta.add(writer, 8, &[Tag::I4.as_u8()])),
            Some(ErrorKind::DataConflict)
        );
        // 隣接はしても重ならなければ良い
        track!(dtta.add(writer, 4, &[Tag::I4.as_u8()]))?;
        assert_eq!(dtta.len()?, 3);
        Ok(())
    }

    #[test]
    fn bad_descriptors_are_rejected() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 32, writer))?;
        let dtta = block.dtta();

        assert_eq!(kind(dtta.add(writer, 0, &[0x15])), Some(ErrorKind::IllegalDescriptor));
        assert_eq!(
            kind(dtta.add(writer, 0, &[Tag::I4.as_u8(), 0])),
            Some(ErrorKind::IllegalDescriptor)
        );
        assert_eq!(
            kind(dtta.add(writer, 0, &[Tag::Internal.as_u8()])),
            Some(ErrorKind::IllegalDescriptor)
        );
        assert_eq!(
            kind(dtta.add(writer, 30, &[Tag::I4.as_u8()])),
            Some(ErrorKind::IllegalOffset)
        );

        let other = WriterId::new(1)?;
        assert_eq!(
            kind(dtta.add(other, 0, &[Tag::I4.as_u8()])),
            Some(ErrorKind::BlockUnexpected)
        );
        Ok(())
    }

    #[test]
    fn capacity_limits() -> TestResult {
        let crowded = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&crowded, 256, writer))?;
        let dtta = block.dtta();
        for i in 0..MAX_ENTRIES as u64 {
            track!(dtta.add(writer, i, &[Tag::U1.as_u8()]))?;
        }
        assert_eq!(
            kind(dtta.add(writer, 100, &[Tag::U1.as_u8()])),
            Some(ErrorKind::LutFull)
        );

        let another = track!(segment(16))?;
        let block = track!(acquired_block(&another, 256, writer))?;
        let dtta = block.dtta();
        let huge = TypeDescriptor::Class {
            header: vec![0; 200],
            fields: vec![ClassField {
                descriptor: TypeDescriptor::I4,
                offset: 0,
                size: 4,
            }],
        };
        assert!(dtta.free_descriptor_space()? < 220);
        assert_eq!(
            kind(dtta.add(writer, 0, &huge.to_bytes()?)),
            Some(ErrorKind::DttaOverflow)
        );
        Ok(())
    }

    #[test]
    fn modify_works() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();
        track!(dtta.add(writer, 0, &[Tag::I4.as_u8()]))?;
        track!(dtta.add(writer, 16, &[Tag::I2.as_u8()]))?;

        // 移動して並び替え
        track!(dtta.modify(writer, 0, 32, &[Tag::I4.as_u8()]))?;
        let offsets = dtta
            .entries()?
            .iter()
            .map(|e| e.data_offset)
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![16, 32]);

        assert_eq!(
            kind(dtta.modify(writer, 1, 40, &[Tag::I4.as_u8()])),
            Some(ErrorKind::EntryNotFound)
        );
        assert_eq!(
            kind(dtta.modify(writer, 32, 40, &[Tag::U4.as_u8()])),
            Some(ErrorKind::DescriptorMismatch)
        );
        assert_eq!(
            kind(dtta.modify(writer, 32, 40, &[Tag::R4.as_u8(), 0])),
            Some(ErrorKind::DescriptorMismatch)
        );
        assert_eq!(
            kind(dtta.modify(writer, 32, 14, &[Tag::I4.as_u8()])),
            Some(ErrorKind::DataConflict)
        );
        // 自分自身との重なりは問題ない
        track!(dtta.modify(writer, 32, 34, &[Tag::I4.as_u8()]))?;

        track!(dtta.add(writer, 64, &[0x0E, 4, 0, 0, 0]))?;
        track!(dtta.modify(writer, 64, 64, &[0x0E, 6, 0, 0, 0]))?;
        match dtta.query(75)? {
            Lookup::Object(o) => assert_eq!(o.size, 12),
            other => panic!("{:?}", other),
        }
        Ok(())
    }

    #[test]
    fn out_of_range_descriptors_are_rejected() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();
        track!(dtta.add(writer, 0, &[Tag::I4.as_u8()]))?;

        let entry = dtta.entries()?[0];
        let broken = Entry {
            descriptor_len: u64::MAX,
            ..entry
        };
        assert_eq!(kind(dtta.descriptor(&broken)), Some(ErrorKind::IllegalOffset));
        let beyond = Entry {
            descriptor_offset: block.capacity(),
            descriptor_len: 1,
            ..entry
        };
        assert_eq!(kind(dtta.descriptor(&beyond)), Some(ErrorKind::IllegalOffset));

        // テーブル上のエントリが壊れている場合
        let first = track!(dtta.read_header(FIRST_ENTRY))?;
        track!(block.write_u64(first + 16, u64::MAX))?;
        assert_eq!(kind(dtta.entries()), Some(ErrorKind::BlockCorrupted));
        assert_eq!(kind(dtta.query(0)), Some(ErrorKind::BlockCorrupted));
        Ok(())
    }
}
