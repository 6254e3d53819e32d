//! ブロックを外部に公開するための不透明なハンドル.
//!
//! ハンドルは64bitで、下位60bitがキーで難読化されたブロックの位置、
//! 上位4bitが同じくキーで難読化されたバージョン(先頭ページの世代番号の下位4bit).
//!
//! ブロックが削除・再作成されると先頭ページの世代番号が進むため、
//! 古いハンドルは`decode`時に`ErrorKind::StaleHandle`として検出される
//! (世代番号が16周した場合には検出できない).
use std::fmt;
use std::str::FromStr;
use trackable::error::ErrorKindExt;

use crate::segment::{PageIndex, SegmentId};
use crate::{Error, ErrorKind, Result};

const ADDRESS_BITS: u32 = 60;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const VERSION_MASK: u64 = 0xF;

/// ハンドルに符号化可能なセグメント識別子の上限(この値は含まない).
pub const MAX_SEGMENT_ID: u32 = 1 << (ADDRESS_BITS - 32);

/// ブロックの位置.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// ブロックが属するセグメント.
    pub segment: SegmentId,

    /// ブロックの先頭ページ.
    pub page: PageIndex,
}
impl Location {
    fn to_u64(self) -> u64 {
        (u64::from(self.segment.as_u32()) << 32) | u64::from(self.page)
    }

    fn from_u64(n: u64) -> Self {
        Location {
            segment: SegmentId::new((n >> 32) as u32),
            page: n as PageIndex,
        }
    }
}

/// ブロックのハンドル.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(u64);
impl BlockHandle {
    /// 生の値からハンドルを生成する.
    pub fn from_u64(n: u64) -> Self {
        BlockHandle(n)
    }

    /// ハンドルの生の値を返す.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    fn address(self) -> u64 {
        self.0 & ADDRESS_MASK
    }

    fn version(self) -> u64 {
        self.0 >> ADDRESS_BITS
    }
}
impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
impl FromStr for BlockHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let n = track!(u64::from_str_radix(s, 16).map_err(|e| ErrorKind::InvalidInput.cause(e)))?;
        Ok(BlockHandle(n))
    }
}

/// ブロックの位置とハンドルの相互変換を行う.
#[derive(Debug, Clone, Copy)]
pub struct HandleCodec {
    key: u64,
}
impl HandleCodec {
    /// `key`を使って難読化を行う`HandleCodec`インスタンスを生成する.
    pub fn new(key: u64) -> Self {
        HandleCodec { key }
    }

    /// 位置とバージョンをハンドルに符号化する.
    ///
    /// `version`は下位4bitのみが使われる.
    pub fn encode(&self, location: Location, version: u64) -> Result<BlockHandle> {
        track_assert!(
            location.segment.as_u32() < MAX_SEGMENT_ID,
            ErrorKind::InvalidInput,
            "Too large segment id: {}",
            location.segment
        );
        let address = location.to_u64() ^ (self.key & ADDRESS_MASK);
        let version = (version ^ (self.key >> ADDRESS_BITS)) & VERSION_MASK;
        Ok(BlockHandle((version << ADDRESS_BITS) | address))
    }

    /// ハンドルが指す位置を、バージョンの検証なしに返す.
    pub fn location(&self, handle: BlockHandle) -> Location {
        Location::from_u64(handle.address() ^ (self.key & ADDRESS_MASK))
    }

    /// ハンドルを復号する.
    ///
    /// ハンドル内のバージョンが`expected_version`の下位4bitと一致しない場合には
    /// `ErrorKind::StaleHandle`が返される.
    pub fn decode(&self, handle: BlockHandle, expected_version: u64) -> Result<Location> {
        let version = (handle.version() ^ (self.key >> ADDRESS_BITS)) & VERSION_MASK;
        track_assert_eq!(
            version,
            expected_version & VERSION_MASK,
            ErrorKind::StaleHandle,
            "handle={}",
            handle
        );
        Ok(self.location(handle))
    }
}
