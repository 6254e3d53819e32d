//! 型記述子(type descriptor)のエンコード・デコード.
//!
//! 型記述子は、先頭一バイトのタグと、タグ毎に定まる追加フィールド群から構成される自己区切りのバイト列.
//! 複数バイトのフィールドは全てリトルエンディアンで格納される.
//!
//! このモジュールが提供する主な操作は以下の二つ:
//!
//! - [descriptor_len]: 記述子自体が占めるバイト数を求める
//! - [object_size]: 記述子が表す値の(メモリ上の)バイト数を求める
//!
//! どちらも純粋関数で、未知のタグ・途中で切れている記述子・オーバーフロー等を検出した場合には
//! `ErrorKind::IllegalDescriptor`を返す.
//!
//! [descriptor_len]: ./fn.descriptor_len.html
//! [object_size]: ./fn.object_size.html
use byteorder::{ByteOrder, LittleEndian};

use crate::{ErrorKind, Result};

pub(crate) use self::layout::Children;

mod layout;

/// 入れ子の最大深さ.
pub const MAX_NESTING_DEPTH: usize = 64;

/// `PTR`記述子の長さ.
pub const PTR_DESCRIPTOR_LEN: usize = 9;

/// `BYREF`記述子の長さ.
pub const BYREF_DESCRIPTOR_LEN: usize = 10;

/// ポインタおよび参照が占めるバイト数.
pub const POINTER_SIZE: u64 = 8;

/// 型記述子の先頭タグ.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    End = 0x00,
    Void = 0x01,
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0A,
    U8 = 0x0B,
    R4 = 0x0C,
    R8 = 0x0D,
    String = 0x0E,
    Ptr = 0x0F,
    ByRef = 0x10,
    ValueType = 0x11,
    Class = 0x12,
    Var = 0x13,
    Array = 0x14,
    NativeInt = 0x18,
    NativeUInt = 0x19,
    Object = 0x1C,
    SzArray = 0x1D,
    Internal = 0x21,
    Separator = 0x40,
    SignedAscii = 0x44,
    UnsignedAscii = 0x45,
    FixedPoint = 0x4D,
    RawBits = 0x5C,
    Prefix = 0x80,
}
impl Tag {
    /// バイト値に対応するタグを返す.
    ///
    /// 未知の値の場合には`None`が返される.
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => Tag::End,
            0x01 => Tag::Void,
            0x02 => Tag::Boolean,
            0x03 => Tag::Char,
            0x04 => Tag::I1,
            0x05 => Tag::U1,
            0x06 => Tag::I2,
            0x07 => Tag::U2,
            0x08 => Tag::I4,
            0x09 => Tag::U4,
            0x0A => Tag::I8,
            0x0B => Tag::U8,
            0x0C => Tag::R4,
            0x0D => Tag::R8,
            0x0E => Tag::String,
            0x0F => Tag::Ptr,
            0x10 => Tag::ByRef,
            0x11 => Tag::ValueType,
            0x12 => Tag::Class,
            0x13 => Tag::Var,
            0x14 => Tag::Array,
            0x18 => Tag::NativeInt,
            0x19 => Tag::NativeUInt,
            0x1C => Tag::Object,
            0x1D => Tag::SzArray,
            0x21 => Tag::Internal,
            0x40 => Tag::Separator,
            0x44 => Tag::SignedAscii,
            0x45 => Tag::UnsignedAscii,
            0x4D => Tag::FixedPoint,
            0x5C => Tag::RawBits,
            0x80 => Tag::Prefix,
            _ => return None,
        })
    }

    /// タグのバイト値を返す.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// `CLASS`のフィールド.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassField {
    /// フィールドの型.
    pub descriptor: TypeDescriptor,

    /// クラス先頭からのオフセット.
    pub offset: u64,

    /// フィールドのサイズ.
    pub size: u64,
}

/// `ARRAY`の次元.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimension {
    /// 下限インデックス.
    pub lower_bound: u64,

    /// 要素数.
    pub length: u64,
}

/// デコード済みの型記述子.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    End,
    Void { width: u8 },
    Boolean,
    /// UTF-16の一文字.
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4 { precision: u8 },
    R8 { precision: u8 },
    /// UTF-16の固定長文字列.
    String { chars: u32 },
    Ptr { target_size: u64 },
    ByRef { target_tag: u8, target_size: u64 },
    /// 構造体.
    ///
    /// `align`が`0`の場合にはパディングなしで詰められる.
    ValueType { align: u8, fields: Vec<TypeDescriptor> },
    Class { header: Vec<u8>, fields: Vec<ClassField> },
    Var,
    /// 多次元配列(テンソル).
    Array { element: Box<TypeDescriptor>, dims: Vec<Dimension> },
    NativeInt { width: u8 },
    NativeUInt { width: u8 },
    Object { width: u64 },
    /// 一次元配列.
    SzArray { element: Box<TypeDescriptor>, count: u32 },
    Internal,
    Separator,
    SignedAscii,
    UnsignedAscii,
    FixedPoint { width: u8 },
    RawBits { length: u64 },
    Prefix,
}
impl TypeDescriptor {
    /// バイト列の先頭から記述子を一つデコードする.
    ///
    /// 結果のタプルの第二要素は、消費したバイト数.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut reader = Reader::new(bytes);
        let descriptor = track!(reader.descriptor(0))?;
        Ok((descriptor, reader.position))
    }

    /// バイト列全体を一つの記述子としてデコードする.
    ///
    /// 末尾に余剰なバイトがある場合には`ErrorKind::IllegalDescriptor`が返される.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (descriptor, len) = track!(Self::decode(bytes))?;
        track_assert_eq!(len, bytes.len(), ErrorKind::IllegalDescriptor);
        Ok(descriptor)
    }

    /// 記述子をバイト列にエンコードする.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        track!(self.encode(&mut buf, 0))?;
        Ok(buf)
    }

    /// 先頭タグを返す.
    pub fn tag(&self) -> Tag {
        match *self {
            TypeDescriptor::End => Tag::End,
            TypeDescriptor::Void { .. } => Tag::Void,
            TypeDescriptor::Boolean => Tag::Boolean,
            TypeDescriptor::Char => Tag::Char,
            TypeDescriptor::I1 => Tag::I1,
            TypeDescriptor::U1 => Tag::U1,
            TypeDescriptor::I2 => Tag::I2,
            TypeDescriptor::U2 => Tag::U2,
            TypeDescriptor::I4 => Tag::I4,
            TypeDescriptor::U4 => Tag::U4,
            TypeDescriptor::I8 => Tag::I8,
            TypeDescriptor::U8 => Tag::U8,
            TypeDescriptor::R4 { .. } => Tag::R4,
            TypeDescriptor::R8 { .. } => Tag::R8,
            TypeDescriptor::String { .. } => Tag::String,
            TypeDescriptor::Ptr { .. } => Tag::Ptr,
            TypeDescriptor::ByRef { .. } => Tag::ByRef,
            TypeDescriptor::ValueType { .. } => Tag::ValueType,
            TypeDescriptor::Class { .. } => Tag::Class,
            TypeDescriptor::Var => Tag::Var,
            TypeDescriptor::Array { .. } => Tag::Array,
            TypeDescriptor::NativeInt { .. } => Tag::NativeInt,
            TypeDescriptor::NativeUInt { .. } => Tag::NativeUInt,
            TypeDescriptor::Object { .. } => Tag::Object,
            TypeDescriptor::SzArray { .. } => Tag::SzArray,
            TypeDescriptor::Internal => Tag::Internal,
            TypeDescriptor::Separator => Tag::Separator,
            TypeDescriptor::SignedAscii => Tag::SignedAscii,
            TypeDescriptor::UnsignedAscii => Tag::UnsignedAscii,
            TypeDescriptor::FixedPoint { .. } => Tag::FixedPoint,
            TypeDescriptor::RawBits { .. } => Tag::RawBits,
            TypeDescriptor::Prefix => Tag::Prefix,
        }
    }

    /// 記述子が表す値のバイト数を返す.
    ///
    /// `SEPARATOR`および`PREFIX`は値を表さないので`ErrorKind::IllegalDescriptor`となる.
    pub fn object_size(&self) -> Result<u64> {
        let size = match *self {
            TypeDescriptor::End | TypeDescriptor::Internal => 0,
            TypeDescriptor::Boolean
            | TypeDescriptor::I1
            | TypeDescriptor::U1
            | TypeDescriptor::Var
            | TypeDescriptor::SignedAscii
            | TypeDescriptor::UnsignedAscii => 1,
            TypeDescriptor::Char | TypeDescriptor::I2 | TypeDescriptor::U2 => 2,
            TypeDescriptor::I4 | TypeDescriptor::U4 | TypeDescriptor::R4 { .. } => 4,
            TypeDescriptor::I8 | TypeDescriptor::U8 | TypeDescriptor::R8 { .. } => 8,
            TypeDescriptor::Ptr { .. } | TypeDescriptor::ByRef { .. } => POINTER_SIZE,
            TypeDescriptor::Void { width }
            | TypeDescriptor::NativeInt { width }
            | TypeDescriptor::NativeUInt { width }
            | TypeDescriptor::FixedPoint { width } => u64::from(width),
            TypeDescriptor::Object { width } => width,
            TypeDescriptor::RawBits { length } => length,
            TypeDescriptor::String { chars } => u64::from(chars) * 2,
            TypeDescriptor::ValueType { align, ref fields } => {
                let (_, size) = track!(layout::struct_layout(align, fields))?;
                size
            }
            TypeDescriptor::Class { ref fields, .. } => {
                let mut total = 0u64;
                for f in fields {
                    total = track_assert_some!(
                        total.checked_add(f.size),
                        ErrorKind::IllegalDescriptor
                    );
                }
                // 各フィールドはクラスの範囲内に収まっている必要がある
                for (i, f) in fields.iter().enumerate() {
                    let end = track_assert_some!(
                        f.offset.checked_add(f.size),
                        ErrorKind::IllegalDescriptor
                    );
                    track_assert!(
                        end <= total,
                        ErrorKind::IllegalDescriptor,
                        "Class field out of range: field={}, end={}, size={}",
                        i,
                        end,
                        total
                    );
                }
                total
            }
            TypeDescriptor::Array {
                ref element,
                ref dims,
            } => {
                let mut total = track!(element.object_size())?;
                for d in dims {
                    total = track_assert_some!(
                        total.checked_mul(d.length),
                        ErrorKind::IllegalDescriptor
                    );
                }
                total
            }
            TypeDescriptor::SzArray { ref element, count } => {
                let element_size = track!(element.object_size())?;
                track_assert_some!(
                    element_size.checked_mul(u64::from(count)),
                    ErrorKind::IllegalDescriptor
                )
            }
            TypeDescriptor::Separator | TypeDescriptor::Prefix => {
                track_panic!(ErrorKind::IllegalDescriptor, "Not a value: {:?}", self.tag())
            }
        };
        Ok(size)
    }

    pub(crate) fn children(&self) -> Result<Children> {
        track!(layout::children(self))
    }

    fn encode(&self, buf: &mut Vec<u8>, depth: usize) -> Result<()> {
        track_assert!(depth < MAX_NESTING_DEPTH, ErrorKind::IllegalDescriptor);
        buf.push(self.tag().as_u8());
        match *self {
            TypeDescriptor::Void { width }
            | TypeDescriptor::NativeInt { width }
            | TypeDescriptor::NativeUInt { width }
            | TypeDescriptor::FixedPoint { width } => buf.push(width),
            TypeDescriptor::R4 { precision } | TypeDescriptor::R8 { precision } => {
                buf.push(precision)
            }
            TypeDescriptor::String { chars } => put_u32(buf, chars),
            TypeDescriptor::Ptr { target_size } => put_u64(buf, target_size),
            TypeDescriptor::ByRef {
                target_tag,
                target_size,
            } => {
                buf.push(target_tag);
                put_u64(buf, target_size);
            }
            TypeDescriptor::ValueType { align, ref fields } => {
                track_assert!(
                    fields.len() <= usize::from(u16::max_value()),
                    ErrorKind::IllegalDescriptor
                );
                buf.push(align);
                put_u16(buf, fields.len() as u16);
                for f in fields {
                    track!(f.encode(buf, depth + 1))?;
                }
            }
            TypeDescriptor::Class {
                ref header,
                ref fields,
            } => {
                track_assert!(fields.len() <= 0xFF, ErrorKind::IllegalDescriptor);
                track_assert!(header.len() <= 0xFF, ErrorKind::IllegalDescriptor);
                buf.push(fields.len() as u8);
                buf.push(header.len() as u8);
                buf.extend_from_slice(header);
                for f in fields {
                    track!(f.descriptor.encode(buf, depth + 1))?;
                    put_u64(buf, f.offset);
                    put_u64(buf, f.size);
                }
            }
            TypeDescriptor::Array {
                ref element,
                ref dims,
            } => {
                track_assert!(dims.len() <= 0xFF, ErrorKind::IllegalDescriptor);
                buf.push(dims.len() as u8);
                track!(element.encode(buf, depth + 1))?;
                for d in dims {
                    put_u64(buf, d.lower_bound);
                    put_u64(buf, d.length);
                }
            }
            TypeDescriptor::Object { width } => put_u64(buf, width),
            TypeDescriptor::SzArray { ref element, count } => {
                track!(element.encode(buf, depth + 1))?;
                put_u32(buf, count);
            }
            TypeDescriptor::RawBits { length } => put_u64(buf, length),
            _ => {}
        }
        Ok(())
    }
}

/// 記述子自体が占めるバイト数を返す.
///
/// `desc`の後ろに余分なバイトが続いていても構わない.
pub fn descriptor_len(desc: &[u8]) -> Result<usize> {
    let (_, len) = track!(TypeDescriptor::decode(desc))?;
    Ok(len)
}

/// 記述子が表す値のバイト数を返す.
pub fn object_size(desc: &[u8]) -> Result<u64> {
    let (descriptor, _) = track!(TypeDescriptor::decode(desc))?;
    track!(descriptor.object_size())
}

fn put_u16(buf: &mut Vec<u8>, n: u16) {
    let mut bytes = [0; 2];
    LittleEndian::write_u16(&mut bytes, n);
    buf.extend_from_slice(&bytes);
}

fn put_u32(buf: &mut Vec<u8>, n: u32) {
    let mut bytes = [0; 4];
    LittleEndian::write_u32(&mut bytes, n);
    buf.extend_from_slice(&bytes);
}

fn put_u64(buf: &mut Vec<u8>, n: u64) {
    let mut bytes = [0; 8];
    LittleEndian::write_u64(&mut bytes, n);
    buf.extend_from_slice(&bytes);
}

#[derive(Debug)]
struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}
impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, position: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = track_assert_some!(self.position.checked_add(n), ErrorKind::IllegalDescriptor);
        track_assert!(
            end <= self.bytes.len(),
            ErrorKind::IllegalDescriptor,
            "Truncated descriptor: position={}, need={}, len={}",
            self.position,
            n,
            self.bytes.len()
        );
        let bytes = &self.bytes[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(track!(self.take(1))?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(track!(self.take(2))?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(track!(self.take(4))?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(track!(self.take(8))?))
    }

    fn descriptor(&mut self, depth: usize) -> Result<TypeDescriptor> {
        track_assert!(
            depth < MAX_NESTING_DEPTH,
            ErrorKind::IllegalDescriptor,
            "Too deeply nested"
        );
        let b = track!(self.u8())?;
        let tag = track_assert_some!(
            Tag::from_u8(b),
            ErrorKind::IllegalDescriptor,
            "Unknown tag: 0x{:02x}",
            b
        );
        let descriptor = match tag {
            Tag::End => TypeDescriptor::End,
            Tag::Void => TypeDescriptor::Void {
                width: track!(self.u8())?,
            },
            Tag::Boolean => TypeDescriptor::Boolean,
            Tag::Char => TypeDescriptor::Char,
            Tag::I1 => TypeDescriptor::I1,
            Tag::U1 => TypeDescriptor::U1,
            Tag::I2 => TypeDescriptor::I2,
            Tag::U2 => TypeDescriptor::U2,
            Tag::I4 => TypeDescriptor::I4,
            Tag::U4 => TypeDescriptor::U4,
            Tag::I8 => TypeDescriptor::I8,
            Tag::U8 => TypeDescriptor::U8,
            Tag::R4 => TypeDescriptor::R4 {
                precision: track!(self.u8())?,
            },
            Tag::R8 => TypeDescriptor::R8 {
                precision: track!(self.u8())?,
            },
            Tag::String => TypeDescriptor::String {
                chars: track!(self.u32())?,
            },
            Tag::Ptr => TypeDescriptor::Ptr {
                target_size: track!(self.u64())?,
            },
            Tag::ByRef => {
                let target_tag = track!(self.u8())?;
                let target_size = track!(self.u64())?;
                TypeDescriptor::ByRef {
                    target_tag,
                    target_size,
                }
            }
            Tag::ValueType => {
                let align = track!(self.u8())?;
                let count = track!(self.u16())?;
                let mut fields = Vec::new();
                for _ in 0..count {
                    fields.push(track!(self.descriptor(depth + 1))?);
                }
                TypeDescriptor::ValueType { align, fields }
            }
            Tag::Class => {
                let count = track!(self.u8())?;
                let header_len = track!(self.u8())?;
                let header = track!(self.take(usize::from(header_len)))?.to_vec();
                let mut fields = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let descriptor = track!(self.descriptor(depth + 1))?;
                    let offset = track!(self.u64())?;
                    let size = track!(self.u64())?;
                    fields.push(ClassField {
                        descriptor,
                        offset,
                        size,
                    });
                }
                TypeDescriptor::Class { header, fields }
            }
            Tag::Var => TypeDescriptor::Var,
            Tag::Array => {
                let rank = track!(self.u8())?;
                let element = Box::new(track!(self.descriptor(depth + 1))?);
                let mut dims = Vec::with_capacity(usize::from(rank));
                for _ in 0..rank {
                    let lower_bound = track!(self.u64())?;
                    let length = track!(self.u64())?;
                    dims.push(Dimension {
                        lower_bound,
                        length,
                    });
                }
                TypeDescriptor::Array { element, dims }
            }
            Tag::NativeInt => TypeDescriptor::NativeInt {
                width: track!(self.u8())?,
            },
            Tag::NativeUInt => TypeDescriptor::NativeUInt {
                width: track!(self.u8())?,
            },
            Tag::Object => TypeDescriptor::Object {
                width: track!(self.u64())?,
            },
            Tag::SzArray => {
                let element = Box::new(track!(self.descriptor(depth + 1))?);
                let count = track!(self.u32())?;
                TypeDescriptor::SzArray { element, count }
            }
            Tag::Internal => TypeDescriptor::Internal,
            Tag::Separator => TypeDescriptor::Separator,
            Tag::SignedAscii => TypeDescriptor::SignedAscii,
            Tag::UnsignedAscii => TypeDescriptor::UnsignedAscii,
            Tag::FixedPoint => TypeDescriptor::FixedPoint {
                width: track!(self.u8())?,
            },
            Tag::RawBits => TypeDescriptor::RawBits {
                length: track!(self.u64())?,
            },
            Tag::Prefix => TypeDescriptor::Prefix,
        };
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    fn size_of(d: TypeDescriptor) -> Result<u64> {
        let bytes = track!(d.to_bytes())?;
        track!(object_size(&bytes))
    }

    #[test]
    fn primitive_sizes() -> TestResult {
        assert_eq!(object_size(&[0x02])?, 1);
        assert_eq!(object_size(&[0x03])?, 2);
        assert_eq!(object_size(&[0x08])?, 4);
        assert_eq!(object_size(&[0x0B])?, 8);
        assert_eq!(object_size(&[0x0C, 7])?, 4);
        assert_eq!(object_size(&[0x01, 3])?, 3);
        assert_eq!(object_size(&[0x18, 8])?, 8);
        assert_eq!(object_size(&[0x21])?, 0);
        assert_eq!(object_size(&[0x0E, 5, 0, 0, 0])?, 10);
        assert_eq!(descriptor_len(&[0x0E, 5, 0, 0, 0, 0xFF])?, 5);
        Ok(())
    }

    #[test]
    fn pointer_and_reference_are_eight_bytes() -> TestResult {
        assert_eq!(size_of(TypeDescriptor::Ptr { target_size: 100 })?, 8);
        let byref = TypeDescriptor::ByRef {
            target_tag: Tag::I4.as_u8(),
            target_size: 4,
        };
        assert_eq!(byref.to_bytes()?.len(), BYREF_DESCRIPTOR_LEN);
        assert_eq!(size_of(byref)?, 8);
        Ok(())
    }

    #[test]
    fn struct_layout_works() -> TestResult {
        let fields = vec![TypeDescriptor::U1, TypeDescriptor::I4, TypeDescriptor::U2];
        let packed = TypeDescriptor::ValueType {
            align: 0,
            fields: fields.clone(),
        };
        assert_eq!(size_of(packed)?, 7);

        let aligned = TypeDescriptor::ValueType { align: 4, fields };
        assert_eq!(size_of(aligned)?, 12);

        let empty = TypeDescriptor::ValueType {
            align: 8,
            fields: Vec::new(),
        };
        assert_eq!(size_of(empty)?, 1);

        let bad = TypeDescriptor::ValueType {
            align: 3,
            fields: vec![TypeDescriptor::I4],
        };
        assert_eq!(
            size_of(bad).err().map(|e| *e.kind()),
            Some(ErrorKind::IllegalDescriptor)
        );
        Ok(())
    }

    #[test]
    fn aggregate_sizes() -> TestResult {
        let array = TypeDescriptor::Array {
            element: Box::new(TypeDescriptor::I4),
            dims: vec![
                Dimension {
                    lower_bound: 0,
                    length: 2,
                },
                Dimension {
                    lower_bound: 1,
                    length: 3,
                },
            ],
        };
        assert_eq!(size_of(array)?, 24);

        let szarray = TypeDescriptor::SzArray {
            element: Box::new(TypeDescriptor::U2),
            count: 5,
        };
        assert_eq!(size_of(szarray)?, 10);

        let class = TypeDescriptor::Class {
            header: b"Point".to_vec(),
            fields: vec![
                ClassField {
                    descriptor: TypeDescriptor::I4,
                    offset: 0,
                    size: 4,
                },
                ClassField {
                    descriptor: TypeDescriptor::R8 { precision: 0 },
                    offset: 4,
                    size: 8,
                },
            ],
        };
        assert_eq!(size_of(class)?, 12);

        // パディングを挟んでクラスの範囲をはみ出すフィールド
        let padded = TypeDescriptor::Class {
            header: b"Point".to_vec(),
            fields: vec![
                ClassField {
                    descriptor: TypeDescriptor::I4,
                    offset: 0,
                    size: 4,
                },
                ClassField {
                    descriptor: TypeDescriptor::R8 { precision: 0 },
                    offset: 8,
                    size: 8,
                },
            ],
        };
        assert_eq!(
            padded.object_size().err().map(|e| *e.kind()),
            Some(ErrorKind::IllegalDescriptor)
        );
        Ok(())
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        let kind = |bytes: &[u8]| object_size(bytes).err().map(|e| *e.kind());

        assert_eq!(kind(&[]), Some(ErrorKind::IllegalDescriptor));
        assert_eq!(kind(&[0x15]), Some(ErrorKind::IllegalDescriptor));
        assert_eq!(kind(&[0x0F, 1, 2, 3]), Some(ErrorKind::IllegalDescriptor));
        assert_eq!(kind(&[0x11, 0, 2, 0, 0x08]), Some(ErrorKind::IllegalDescriptor));
        assert_eq!(kind(&[0x40]), Some(ErrorKind::IllegalDescriptor));
        assert!(descriptor_len(&[0x40]).is_ok());

        // 要素数とサイズの積がオーバーフローする
        let mut huge = vec![0x1D, 0x1C];
        huge.extend_from_slice(&u64::max_value().to_le_bytes());
        huge.extend_from_slice(&2u32.to_le_bytes());
        assert_eq!(kind(&huge), Some(ErrorKind::IllegalDescriptor));
    }

    #[test]
    fn nesting_limit() {
        let mut bytes = vec![0x1D; MAX_NESTING_DEPTH + 1];
        bytes.push(0x08);
        bytes.extend(std::iter::repeat(1).take(4 * (MAX_NESTING_DEPTH + 1)));
        assert_eq!(
            descriptor_len(&bytes).err().map(|e| *e.kind()),
            Some(ErrorKind::IllegalDescriptor)
        );
    }

    #[test]
    fn every_shape_survives_encoding() -> TestResult {
        let shapes = vec![
            TypeDescriptor::End,
            TypeDescriptor::Void { width: 2 },
            TypeDescriptor::Boolean,
            TypeDescriptor::Char,
            TypeDescriptor::I1,
            TypeDescriptor::U1,
            TypeDescriptor::I2,
            TypeDescriptor::U2,
            TypeDescriptor::I4,
            TypeDescriptor::U4,
            TypeDescriptor::I8,
            TypeDescriptor::U8,
            TypeDescriptor::R4 { precision: 6 },
            TypeDescriptor::R8 { precision: 15 },
            TypeDescriptor::String { chars: 12 },
            TypeDescriptor::Ptr { target_size: 16 },
            TypeDescriptor::ByRef {
                target_tag: 0x08,
                target_size: 4,
            },
            TypeDescriptor::ValueType {
                align: 8,
                fields: vec![TypeDescriptor::U1, TypeDescriptor::R8 { precision: 0 }],
            },
            TypeDescriptor::Class {
                header: vec![1, 2, 3],
                fields: vec![ClassField {
                    descriptor: TypeDescriptor::Char,
                    offset: 0,
                    size: 2,
                }],
            },
            TypeDescriptor::Var,
            TypeDescriptor::Array {
                element: Box::new(TypeDescriptor::U1),
                dims: vec![Dimension {
                    lower_bound: 3,
                    length: 4,
                }],
            },
            TypeDescriptor::NativeInt { width: 8 },
            TypeDescriptor::NativeUInt { width: 4 },
            TypeDescriptor::Object { width: 40 },
            TypeDescriptor::SzArray {
                element: Box::new(TypeDescriptor::I8),
                count: 3,
            },
            TypeDescriptor::Internal,
            TypeDescriptor::Separator,
            TypeDescriptor::SignedAscii,
            TypeDescriptor::UnsignedAscii,
            TypeDescriptor::FixedPoint { width: 4 },
            TypeDescriptor::RawBits { length: 13 },
            TypeDescriptor::Prefix,
        ];
        for shape in shapes {
            let bytes = shape.to_bytes()?;
            assert_eq!(bytes[0], shape.tag().as_u8());
            assert_eq!(descriptor_len(&bytes)?, bytes.len());
            assert_eq!(TypeDescriptor::from_bytes(&bytes)?, shape);
        }
        Ok(())
    }
}
