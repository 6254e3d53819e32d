use super::TypeDescriptor;
use crate::{ErrorKind, Result};

/// 親オブジェクト内での子ノード(フィールドあるいは配列要素)の位置.
///
/// `start`と`end`は親の先頭からの相対オフセット.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Child<'a> {
    pub index: u64,
    pub start: u64,
    pub end: u64,
    pub descriptor: &'a TypeDescriptor,
}

#[derive(Debug, Clone)]
pub(crate) enum Children<'a> {
    Leaf,
    Fields(Vec<Child<'a>>),
    Elements {
        element: &'a TypeDescriptor,
        element_size: u64,
        count: u64,
    },
}
impl<'a> Children<'a> {
    pub fn get(&self, index: u64) -> Option<Child<'a>> {
        match *self {
            Children::Leaf => None,
            Children::Fields(ref fields) => fields.get(index as usize).cloned(),
            Children::Elements {
                element,
                element_size,
                count,
            } => {
                if index < count {
                    Some(Child {
                        index,
                        start: index * element_size,
                        end: (index + 1) * element_size,
                        descriptor: element,
                    })
                } else {
                    None
                }
            }
        }
    }

    /// `offset`を含む子ノードを返す.
    pub fn containing(&self, offset: u64) -> Option<Child<'a>> {
        match *self {
            Children::Leaf => None,
            Children::Fields(ref fields) => fields
                .iter()
                .find(|f| f.start <= offset && offset < f.end)
                .cloned(),
            Children::Elements { element_size, .. } => {
                if element_size == 0 {
                    None
                } else {
                    self.get(offset / element_size)
                }
            }
        }
    }
}

/// 構造体の各フィールドの`(開始位置, サイズ)`と、構造体全体のサイズを返す.
pub(crate) fn struct_layout(align: u8, fields: &[TypeDescriptor]) -> Result<(Vec<(u64, u64)>, u64)> {
    if fields.is_empty() {
        return Ok((Vec::new(), 1));
    }
    let align = u64::from(align);
    track_assert!(
        align == 0 || align.is_power_of_two(),
        ErrorKind::IllegalDescriptor,
        "Bad struct alignment: {}",
        align
    );

    let mut offset = 0u64;
    let mut positions = Vec::with_capacity(fields.len());
    for field in fields {
        let size = track!(field.object_size())?;
        if align != 0 {
            let field_align = size.min(align).max(1);
            offset = track!(round_up(offset, field_align))?;
        }
        positions.push((offset, size));
        offset = track_assert_some!(offset.checked_add(size), ErrorKind::IllegalDescriptor);
    }
    if align != 0 {
        offset = track!(round_up(offset, align))?;
    }
    Ok((positions, offset))
}

pub(crate) fn children(descriptor: &TypeDescriptor) -> Result<Children> {
    let children = match *descriptor {
        TypeDescriptor::ValueType { align, ref fields } => {
            let (positions, _) = track!(struct_layout(align, fields))?;
            let children = fields
                .iter()
                .zip(positions)
                .enumerate()
                .map(|(i, (descriptor, (start, size)))| Child {
                    index: i as u64,
                    start,
                    end: start + size,
                    descriptor,
                })
                .collect();
            Children::Fields(children)
        }
        TypeDescriptor::Class { ref fields, .. } => {
            // フィールドの範囲は`object_size()`で検証される
            track!(descriptor.object_size())?;
            let mut children = fields
                .iter()
                .enumerate()
                .map(|(i, f)| Child {
                    index: i as u64,
                    start: f.offset,
                    end: f.offset + f.size,
                    descriptor: &f.descriptor,
                })
                .collect::<Vec<_>>();
            children.sort_by_key(|c| c.start);
            for (i, c) in children.iter_mut().enumerate() {
                c.index = i as u64;
            }
            Children::Fields(children)
        }
        TypeDescriptor::Array {
            ref element,
            ref dims,
        } => {
            let mut count = 1u64;
            for d in dims {
                count = track_assert_some!(count.checked_mul(d.length), ErrorKind::IllegalDescriptor);
            }
            Children::Elements {
                element,
                element_size: track!(element.object_size())?,
                count,
            }
        }
        TypeDescriptor::SzArray { ref element, count } => Children::Elements {
            element,
            element_size: track!(element.object_size())?,
            count: u64::from(count),
        },
        _ => Children::Leaf,
    };
    Ok(children)
}

fn round_up(n: u64, unit: u64) -> Result<u64> {
    let n = track_assert_some!(n.checked_add(unit - 1), ErrorKind::IllegalDescriptor);
    Ok(n / unit * unit)
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn field_positions() -> TestResult {
        let fields = [TypeDescriptor::U1, TypeDescriptor::I4, TypeDescriptor::U2];
        let (positions, size) = track!(struct_layout(4, &fields))?;
        assert_eq!(positions, vec![(0, 1), (4, 4), (8, 2)]);
        assert_eq!(size, 12);

        let (positions, size) = track!(struct_layout(0, &fields))?;
        assert_eq!(positions, vec![(0, 1), (1, 4), (5, 2)]);
        assert_eq!(size, 7);
        Ok(())
    }

    #[test]
    fn elements_are_computed() -> TestResult {
        let d = TypeDescriptor::SzArray {
            element: Box::new(TypeDescriptor::I4),
            count: 3,
        };
        let children = track!(d.children())?;
        let c = children.containing(9).map(|c| (c.index, c.start, c.end));
        assert_eq!(c, Some((2, 8, 12)));
        assert!(children.containing(12).is_none());
        assert!(children.get(3).is_none());
        Ok(())
    }
}
