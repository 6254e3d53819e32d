//! ポインタ・参照の検証付き解決.
use super::{Dtta, Lookup, ObjectInfo};
use crate::block::HEADER_SIZE;
use crate::descriptor::{Children, TypeDescriptor, BYREF_DESCRIPTOR_LEN, PTR_DESCRIPTOR_LEN};
use crate::{ErrorKind, Result};

/// ポインタ・参照の参照先.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// 参照先の開始位置(ユーザデータ領域内).
    pub offset: u64,

    /// 参照先のバイト数.
    pub size: u64,

    /// 参照先を含む変数.
    pub object: ObjectInfo,
}

/// ある位置から始まるノード(変数、フィールド、配列要素).
#[derive(Debug)]
struct Node<'d> {
    tag: u8,
    end: u64,
    index: u64,
    parent: Option<Parent<'d>>,
}

#[derive(Debug)]
struct Parent<'d> {
    base: u64,
    end: u64,
    children: Children<'d>,
}

impl<'a> Dtta<'a> {
    /// `ptr_offset`にある`PTR`変数を解決する.
    ///
    /// # Errors
    ///
    /// - `ptr_offset`が`PTR`変数の開始位置ではない、あるいは参照先が変数内に収まらない:
    ///   `ErrorKind::IllegalPointer`
    /// - 変数の記述子が`PTR`ではない: `ErrorKind::IllegalDescriptor`
    pub fn resolve_pointer(&self, ptr_offset: u64) -> Result<Target> {
        let variable = track!(self.variable_at(ptr_offset, ErrorKind::IllegalPointer))?;
        let target_size = match track!(TypeDescriptor::from_bytes(&variable.descriptor))? {
            TypeDescriptor::Ptr { target_size }
                if variable.descriptor.len() == PTR_DESCRIPTOR_LEN =>
            {
                target_size
            }
            other => track_panic!(ErrorKind::IllegalDescriptor, "Not a pointer: {:?}", other),
        };
        let target = track!(self.block.read_u64(HEADER_SIZE + ptr_offset))?;
        let object = track!(self.target_object(target, target_size, ErrorKind::IllegalPointer))?;
        Ok(Target {
            offset: target,
            size: target_size,
            object,
        })
    }

    /// `byref_offset`にある`BYREF`変数を解決する.
    ///
    /// `resolve_pointer`の検証に加えて、参照範囲が一つ以上の連続した兄弟ノードの境界と
    /// 正確に一致し、かつ先頭ノードのタグが記述子で宣言されたものと一致する必要がある.
    pub fn resolve_byref(&self, byref_offset: u64) -> Result<Target> {
        let variable = track!(self.variable_at(byref_offset, ErrorKind::IllegalByref))?;
        let (target_tag, target_size) =
            match track!(TypeDescriptor::from_bytes(&variable.descriptor))? {
                TypeDescriptor::ByRef {
                    target_tag,
                    target_size,
                } if variable.descriptor.len() == BYREF_DESCRIPTOR_LEN => {
                    (target_tag, target_size)
                }
                other => {
                    track_panic!(ErrorKind::IllegalDescriptor, "Not a reference: {:?}", other)
                }
            };
        track_assert_ne!(target_size, 0, ErrorKind::IllegalByref);
        let target = track!(self.block.read_u64(HEADER_SIZE + byref_offset))?;
        let object = track!(self.target_object(target, target_size, ErrorKind::IllegalByref))?;

        let descriptor = track!(TypeDescriptor::from_bytes(&object.descriptor))?;
        let nodes = track!(nodes_at(&descriptor, object.offset, target))?;
        let node = track_assert_some!(
            nodes.into_iter().find(|n| n.tag == target_tag),
            ErrorKind::IllegalByref,
            "No node tagged 0x{:02x} at {}",
            target_tag,
            target
        );

        let end = target + target_size;
        match node.parent {
            None => track_assert_eq!(node.end, end, ErrorKind::IllegalByref),
            Some(parent) => {
                let mut index = node.index;
                loop {
                    let child = track_assert_some!(
                        parent.children.get(index),
                        ErrorKind::IllegalByref,
                        "Runs past the last sibling: target={}, end={}",
                        target,
                        end
                    );
                    let child_end = parent.base + child.end;
                    track_assert!(
                        child_end <= end,
                        ErrorKind::IllegalByref,
                        "Splits a field: target={}, end={}, field_end={}",
                        target,
                        end,
                        child_end
                    );
                    if child_end == end {
                        break;
                    }
                    index += 1;
                }
            }
        }
        Ok(Target {
            offset: target,
            size: target_size,
            object,
        })
    }

    /// `offset`が変数あるいは(入れ子の)フィールドの開始位置である場合に、
    /// その最も外側のノードの次の兄弟ノードの開始位置を返す.
    ///
    /// 兄弟ノードとの間のパディングは飛ばされる.
    /// 最後のフィールドの場合は親ノードの終端、トップレベルの変数の場合はその終端となる.
    /// `offset`がどのノードの開始位置でもない場合には`None`が返される.
    pub fn next_sibling_offset(&self, offset: u64) -> Result<Option<u64>> {
        let object = match track!(self.query(offset))? {
            Lookup::Object(object) => object,
            Lookup::Gap { .. } => return Ok(None),
        };
        let descriptor = track!(TypeDescriptor::from_bytes(&object.descriptor))?;
        let nodes = track!(nodes_at(&descriptor, object.offset, offset))?;
        Ok(nodes.into_iter().next().map(|node| match node.parent {
            None => node.end,
            Some(parent) => parent
                .children
                .get(node.index + 1)
                .map_or(parent.end, |c| parent.base + c.start),
        }))
    }

    fn variable_at(&self, offset: u64, kind: ErrorKind) -> Result<ObjectInfo> {
        match track!(self.query(offset))? {
            Lookup::Object(ref o) if o.offset == offset => Ok(o.clone()),
            other => track_panic!(kind, "No variable starts at {}: {:?}", offset, other),
        }
    }

    fn target_object(&self, target: u64, size: u64, kind: ErrorKind) -> Result<ObjectInfo> {
        let limit = self.block.user_data_size();
        track_assert!(
            target < limit,
            kind,
            "Out of user data: target={}, user_data_size={}",
            target,
            limit
        );
        let end = track_assert_some!(target.checked_add(size), kind);
        match track!(self.query(target))? {
            Lookup::Object(o) => {
                track_assert!(
                    end <= o.end(),
                    kind,
                    "Runs past the object: target={}..{}, object={}..{}",
                    target,
                    end,
                    o.offset,
                    o.end()
                );
                Ok(o)
            }
            Lookup::Gap { start, end } => {
                track_panic!(kind, "Untyped target: {} in gap {}..{}", target, start, end)
            }
        }
    }
}

/// `base`に置かれた`descriptor`の変数について、`offset`から始まるノード群を外側から順に返す.
fn nodes_at(descriptor: &TypeDescriptor, base: u64, offset: u64) -> Result<Vec<Node>> {
    let size = track!(descriptor.object_size())?;
    let mut nodes = Vec::new();
    if offset == base {
        nodes.push(Node {
            tag: descriptor.tag().as_u8(),
            end: base + size,
            index: 0,
            parent: None,
        });
    }

    let mut current = descriptor;
    let mut current_base = base;
    let mut current_end = base + size;
    loop {
        let children = track!(current.children())?;
        let child = match children.containing(offset - current_base) {
            Some(child) => child,
            None => break,
        };
        let start = current_base + child.start;
        let end = current_base + child.end;
        if start == offset {
            nodes.push(Node {
                tag: child.descriptor.tag().as_u8(),
                end,
                index: child.index,
                parent: Some(Parent {
                    base: current_base,
                    end: current_end,
                    children: children.clone(),
                }),
            });
        }
        current = child.descriptor;
        current_base = start;
        current_end = end;
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::descriptor::{ClassField, Tag};
    use crate::dtta::testutil::acquired_block;
    use crate::registry::WriterId;
    use crate::segment::testutil::segment;

    fn kind<T>(r: Result<T>) -> Option<ErrorKind> {
        r.err().map(|e| *e.kind())
    }

    fn ptr(target_size: u64) -> Vec<u8> {
        TypeDescriptor::Ptr { target_size }
            .to_bytes()
            .expect("Never fails")
    }

    fn byref(tag: Tag, target_size: u64) -> Vec<u8> {
        TypeDescriptor::ByRef {
            target_tag: tag.as_u8(),
            target_size,
        }
        .to_bytes()
        .expect("Never fails")
    }

    fn point() -> Vec<u8> {
        TypeDescriptor::ValueType {
            align: 4,
            fields: vec![TypeDescriptor::U1, TypeDescriptor::I4, TypeDescriptor::U2],
        }
        .to_bytes()
        .expect("Never fails")
    }

    #[test]
    fn resolve_pointer_works() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();
        track!(dtta.add(writer, 0, &ptr(4)))?;
        track!(dtta.add(writer, 8, &ptr(4)))?;
        track!(dtta.add(writer, 16, &[0x08]))?;
        track!(dtta.add(writer, 24, &[0x0E, 8, 0, 0, 0]))?;

        // 整数変数を指す
        track!(block.write_user_data(writer, 0, &16u64.to_le_bytes()))?;
        let target = track!(dtta.resolve_pointer(0))?;
        assert_eq!((target.offset, target.size), (16, 4));
        assert_eq!(target.object.offset, 16);

        // 文字列の途中を指す
        track!(block.write_user_data(writer, 8, &30u64.to_le_bytes()))?;
        let target = track!(dtta.resolve_pointer(8))?;
        assert_eq!(target.object.offset, 24);

        // 未登録領域を指す
        track!(block.write_user_data(writer, 8, &100u64.to_le_bytes()))?;
        assert_eq!(kind(dtta.resolve_pointer(8)), Some(ErrorKind::IllegalPointer));

        // 変数の末尾をはみ出す
        track!(block.write_user_data(writer, 8, &38u64.to_le_bytes()))?;
        assert_eq!(kind(dtta.resolve_pointer(8)), Some(ErrorKind::IllegalPointer));

        // ユーザデータ領域の外
        track!(block.write_user_data(writer, 8, &1000u64.to_le_bytes()))?;
        assert_eq!(kind(dtta.resolve_pointer(8)), Some(ErrorKind::IllegalPointer));

        // ポインタ変数ではない
        assert_eq!(kind(dtta.resolve_pointer(16)), Some(ErrorKind::IllegalDescriptor));
        assert_eq!(kind(dtta.resolve_pointer(4)), Some(ErrorKind::IllegalPointer));
        Ok(())
    }

    #[test]
    fn resolve_byref_works() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();

        // point: U1 @16, (pad), I4 @20, U2 @24, (pad) .. 28
        track!(dtta.add(writer, 16, &point()))?;
        let array = TypeDescriptor::SzArray {
            element: Box::new(TypeDescriptor::I4),
            count: 4,
        };
        track!(dtta.add(writer, 32, &array.to_bytes()?))?;

        let cases = vec![
            (byref(Tag::I4, 4), 20, None),
            (byref(Tag::I4, 6), 20, None),
            (byref(Tag::ValueType, 12), 16, None),
            (byref(Tag::U1, 1), 16, None),
            (byref(Tag::I4, 8), 36, None),
            (byref(Tag::SzArray, 16), 32, None),
            (byref(Tag::U1, 4), 16, Some(ErrorKind::IllegalByref)),
            (byref(Tag::U2, 4), 20, Some(ErrorKind::IllegalByref)),
            (byref(Tag::I4, 6), 36, Some(ErrorKind::IllegalByref)),
            (byref(Tag::I4, 12), 20, Some(ErrorKind::IllegalByref)),
            (byref(Tag::ValueType, 8), 16, Some(ErrorKind::IllegalByref)),
            (byref(Tag::I4, 4), 100, Some(ErrorKind::IllegalByref)),
        ];
        for (i, (descriptor, target, expected)) in cases.into_iter().enumerate() {
            let offset = 64 + 16 * i as u64;
            track!(dtta.add(writer, offset, &descriptor))?;
            track!(block.write_user_data(writer, offset, &(target as u64).to_le_bytes()))?;
            let result = dtta.resolve_byref(offset);
            assert_eq!(kind(result), expected, "case #{}", i);
        }
        Ok(())
    }

    #[test]
    fn next_sibling_offset_works() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();
        track!(dtta.add(writer, 16, &point()))?;
        track!(dtta.add(writer, 40, &[0x0B]))?;

        assert_eq!(dtta.next_sibling_offset(16)?, Some(28));
        assert_eq!(dtta.next_sibling_offset(17)?, None);
        assert_eq!(dtta.next_sibling_offset(20)?, Some(24));
        assert_eq!(dtta.next_sibling_offset(21)?, None);
        assert_eq!(dtta.next_sibling_offset(24)?, Some(28));
        assert_eq!(dtta.next_sibling_offset(30)?, None);
        assert_eq!(dtta.next_sibling_offset(40)?, Some(48));
        Ok(())
    }

    #[test]
    fn class_fields_are_traversable() -> TestResult {
        let segment = track!(segment(16))?;
        let writer = WriterId::new(0)?;
        let block = track!(acquired_block(&segment, 256, writer))?;
        let dtta = block.dtta();

        let field = |descriptor, offset, size| ClassField {
            descriptor,
            offset,
            size,
        };
        let class = TypeDescriptor::Class {
            header: b"Pair".to_vec(),
            fields: vec![
                field(TypeDescriptor::I2, 6, 2),
                field(TypeDescriptor::I4, 0, 4),
                field(TypeDescriptor::U2, 4, 2),
            ],
        };
        track!(dtta.add(writer, 48, &class.to_bytes()?))?;
        assert_eq!(dtta.next_sibling_offset(48)?, Some(56));
        assert_eq!(dtta.next_sibling_offset(52)?, Some(54));
        assert_eq!(dtta.next_sibling_offset(54)?, Some(56));

        track!(dtta.add(writer, 64, &byref(Tag::U2, 2)))?;
        track!(block.write_user_data(writer, 64, &52u64.to_le_bytes()))?;
        let target = track!(dtta.resolve_byref(64))?;
        assert_eq!((target.offset, target.object.offset), (52, 48));

        // 宣言サイズをはみ出すフィールドを持つクラスは登録できない
        let padded = TypeDescriptor::Class {
            header: b"Point".to_vec(),
            fields: vec![
                field(TypeDescriptor::I4, 0, 4),
                field(TypeDescriptor::R8 { precision: 0 }, 8, 8),
            ],
        };
        assert_eq!(
            kind(dtta.add(writer, 96, &padded.to_bytes()?)),
            Some(ErrorKind::IllegalDescriptor)
        );
        Ok(())
    }
}
