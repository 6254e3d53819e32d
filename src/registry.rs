//! ライタ・リーダの識別子と、その登録簿.
use std::fmt;
use std::sync::Mutex;

use crate::{ErrorKind, Result};

/// 同時に登録可能なライタの最大数.
pub const MAX_WRITERS: usize = 64;

/// 同時に登録可能なリーダの最大数.
pub const MAX_READERS: usize = 64;

/// ライタの識別子.
///
/// 値はブロックの書き込み参照ビットマップ上のビット位置に対応する.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(u32);
impl WriterId {
    /// 新しい`WriterId`インスタンスを生成する.
    ///
    /// `id`は`MAX_WRITERS`未満である必要がある.
    pub fn new(id: u32) -> Result<Self> {
        track_assert!((id as usize) < MAX_WRITERS, ErrorKind::InvalidInput, "Bad writer id: {}", id);
        Ok(WriterId(id))
    }

    /// 識別子の値を返す.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) fn bit(self) -> u64 {
        1 << self.0
    }
}
impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "writer#{}", self.0)
    }
}

/// リーダの識別子.
///
/// 上位32bitは購読対象のライタの識別子、下位32bitはリーダのスロット番号.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(u64);
impl ReaderId {
    /// 新しい`ReaderId`インスタンスを生成する.
    pub fn new(writer: WriterId, slot: u32) -> Result<Self> {
        track_assert!(
            (slot as usize) < MAX_READERS,
            ErrorKind::InvalidInput,
            "Bad reader slot: {}",
            slot
        );
        Ok(ReaderId((u64::from(writer.0) << 32) | u64::from(slot)))
    }

    /// 生の値から`ReaderId`を復元する.
    pub fn from_raw(raw: u64) -> Result<Self> {
        let slot = raw as u32;
        track_assert!((slot as usize) < MAX_READERS, ErrorKind::InvalidInput, "Bad reader id: {}", raw);
        Ok(ReaderId(raw))
    }

    /// 生の値を返す.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// 購読対象のライタの識別子(上位32bit)を返す.
    ///
    /// この値は`MAX_WRITERS`以上になり得る.
    pub fn affinity(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// スロット番号を返す.
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn bit(self) -> u64 {
        1 << self.slot()
    }
}
impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "reader#{}@writer#{}", self.slot(), self.affinity())
    }
}

/// ライタ・リーダの識別子を払い出す登録簿.
///
/// 登録・解除は単一のミューテックスで直列化される.
/// ブロック操作の高速経路では、この登録簿は参照されない.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    inner: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    writers: u64,
    readers: u64,
}
impl RoleRegistry {
    /// 空の登録簿を生成する.
    pub fn new() -> Self {
        RoleRegistry::default()
    }

    /// 空いているライタ識別子を払い出す.
    ///
    /// 全て使用中の場合には`ErrorKind::PoolExhausted`が返される.
    pub fn register_writer(&self) -> Result<WriterId> {
        let mut slots = track!(self.inner.lock().map_err(crate::Error::from))?;
        let id = track!(first_free(slots.writers), "No free writer slot")?;
        slots.writers |= 1 << id;
        Ok(WriterId(id))
    }

    /// ライタ識別子を返却する.
    pub fn unregister_writer(&self, writer: WriterId) -> Result<()> {
        let mut slots = track!(self.inner.lock().map_err(crate::Error::from))?;
        track_assert!(
            slots.writers & writer.bit() != 0,
            ErrorKind::InvalidInput,
            "Unregistered: {}",
            writer
        );
        slots.writers &= !writer.bit();
        Ok(())
    }

    /// `writer`を購読するリーダの識別子を払い出す.
    pub fn register_reader(&self, writer: WriterId) -> Result<ReaderId> {
        let mut slots = track!(self.inner.lock().map_err(crate::Error::from))?;
        track_assert!(
            slots.writers & writer.bit() != 0,
            ErrorKind::InvalidInput,
            "Unregistered: {}",
            writer
        );
        let slot = track!(first_free(slots.readers), "No free reader slot")?;
        slots.readers |= 1 << slot;
        track!(ReaderId::new(writer, slot))
    }

    /// リーダ識別子を返却する.
    pub fn unregister_reader(&self, reader: ReaderId) -> Result<()> {
        let mut slots = track!(self.inner.lock().map_err(crate::Error::from))?;
        track_assert!(
            slots.readers & reader.bit() != 0,
            ErrorKind::InvalidInput,
            "Unregistered: {}",
            reader
        );
        slots.readers &= !reader.bit();
        Ok(())
    }

    /// 登録中のライタ数を返す.
    pub fn writer_count(&self) -> Result<u32> {
        let slots = track!(self.inner.lock().map_err(crate::Error::from))?;
        Ok(slots.writers.count_ones())
    }

    /// 登録中のリーダ数を返す.
    pub fn reader_count(&self) -> Result<u32> {
        let slots = track!(self.inner.lock().map_err(crate::Error::from))?;
        Ok(slots.readers.count_ones())
    }
}

fn first_free(bitmap: u64) -> Result<u32> {
    let id = (!bitmap).trailing_zeros();
    track_assert!(id < 64, ErrorKind::PoolExhausted);
    Ok(id)
}
