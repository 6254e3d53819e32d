use std::sync::atomic::{AtomicU64, Ordering};

/// ページのバイトサイズ.
pub const PAGE_SIZE: usize = 512;

/// ページのペイロード部分のバイトサイズ.
pub const PAGE_PAYLOAD_SIZE: usize = 488;

/// ペイロードを構成する64bitワードの数.
pub const PAGE_PAYLOAD_WORDS: usize = PAGE_PAYLOAD_SIZE / 8;

const SEQUENCE_MASK: u64 = (1 << 61) - 1;
const TAG_SHIFT: u32 = 61;

/// セグメント内でのページの位置.
pub type PageIndex = u32;

/// ページのライフサイクルを表すタグ.
///
/// ヘッダワードの上位3bitに格納される.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageTag {
    /// どのブロックにも属していない.
    Idle = 0,

    /// ブロックの先頭ページ.
    Head = 1,

    /// ブロックの二ページ目以降.
    Mid = 2,

    /// DTTA専用ページ(予約).
    Dtta = 3,

    /// ブロックの作成・削除のためにロックされている.
    Locked = 5,

    /// セグメントの保守処理のために使用中.
    Busy = 6,

    /// 異常状態.
    Error = 7,
}
impl PageTag {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => PageTag::Idle,
            1 => PageTag::Head,
            2 => PageTag::Mid,
            3 => PageTag::Dtta,
            5 => PageTag::Locked,
            6 => PageTag::Busy,
            _ => PageTag::Error,
        }
    }
}

/// 512バイト固定長の物理ページ.
///
/// ```text
/// +--------+--------+-------------------------+--------+
/// | header |  prev  |   payload (488 bytes)   |  next  |
/// +--------+--------+-------------------------+--------+
///    8B       8B                                  8B
/// ```
///
/// `header`の下位61bitはシーケンス番号、上位3bitは`PageTag`.
/// `prev`と`next`には、同じセグメント内のページインデックスに`1`を足した値が格納される(`0`は「なし」).
#[repr(C)]
#[derive(Debug)]
pub struct Page {
    header: AtomicU64,
    prev: AtomicU64,
    payload: [AtomicU64; PAGE_PAYLOAD_WORDS],
    next: AtomicU64,
}
impl Page {
    pub(crate) fn new(sequence: u64) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Page {
            header: AtomicU64::new(sequence & SEQUENCE_MASK),
            prev: AtomicU64::new(0),
            payload: [ZERO; PAGE_PAYLOAD_WORDS],
            next: AtomicU64::new(0),
        }
    }

    /// シーケンス番号を返す.
    pub fn sequence(&self) -> u64 {
        self.header.load(Ordering::Acquire) & SEQUENCE_MASK
    }

    /// 現在のタグを返す.
    pub fn tag(&self) -> PageTag {
        PageTag::from_bits(self.header.load(Ordering::SeqCst) >> TAG_SHIFT)
    }

    /// タグが`from`である場合に限り、`to`に遷移させる.
    ///
    /// シーケンス番号部分は保持される.
    pub fn transition(&self, from: PageTag, to: PageTag) -> bool {
        self.header
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| {
                if PageTag::from_bits(h >> TAG_SHIFT) == from {
                    Some((h & SEQUENCE_MASK) | ((to as u64) << TAG_SHIFT))
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// 前のタグに関わらず、タグを`to`に設定する.
    ///
    /// 返り値は、変更前のタグ.
    pub(crate) fn force_tag(&self, to: PageTag) -> PageTag {
        let old = self
            .header
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| {
                Some((h & SEQUENCE_MASK) | ((to as u64) << TAG_SHIFT))
            })
            .unwrap_or_else(|h| h);
        PageTag::from_bits(old >> TAG_SHIFT)
    }

    /// 後方リンクを返す.
    pub fn prev(&self) -> Option<PageIndex> {
        decode_link(self.prev.load(Ordering::Acquire))
    }

    /// 前方リンクを返す.
    pub fn next(&self) -> Option<PageIndex> {
        decode_link(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn set_prev(&self, index: Option<PageIndex>) {
        self.prev.store(encode_link(index), Ordering::Release);
    }

    pub(crate) fn set_next(&self, index: Option<PageIndex>) {
        self.next.store(encode_link(index), Ordering::Release);
    }

    pub(crate) fn word(&self, i: usize) -> &AtomicU64 {
        &self.payload[i]
    }

    pub(crate) fn read_payload(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= PAGE_PAYLOAD_SIZE);
        for (i, b) in buf.iter_mut().enumerate() {
            let pos = offset + i;
            let word = self.payload[pos / 8].load(Ordering::Acquire);
            *b = (word >> ((pos % 8) * 8)) as u8;
        }
    }

    pub(crate) fn write_payload(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= PAGE_PAYLOAD_SIZE);
        let mut i = 0;
        while i < data.len() {
            let pos = offset + i;
            let shift = pos % 8;
            let n = (8 - shift).min(data.len() - i);
            let word = &self.payload[pos / 8];
            if n == 8 {
                let mut bytes = [0; 8];
                bytes.copy_from_slice(&data[i..i + 8]);
                word.store(u64::from_le_bytes(bytes), Ordering::Release);
            } else {
                let mut value = 0u64;
                let mut mask = 0u64;
                for (j, &b) in data[i..i + n].iter().enumerate() {
                    value |= u64::from(b) << ((shift + j) * 8);
                    mask |= 0xFF << ((shift + j) * 8);
                }
                let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                    Some((w & !mask) | value)
                });
            }
            i += n;
        }
    }
}

fn encode_link(index: Option<PageIndex>) -> u64 {
    index.map_or(0, |i| u64::from(i) + 1)
}

fn decode_link(link: u64) -> Option<PageIndex> {
    if link == 0 {
        None
    } else {
        Some((link - 1) as PageIndex)
    }
}

/// ページ毎の統計情報.
#[derive(Debug, Default)]
pub struct PageStats {
    generation: AtomicU64,
    block_creations: AtomicU64,
}
impl PageStats {
    /// このページを先頭とするブロックが作成・削除される度に進む世代番号.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// このページを先頭として作成されたブロックの数.
    pub fn block_creations(&self) -> u64 {
        self.block_creations.load(Ordering::Relaxed)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.block_creations.fetch_add(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn page_is_512_bytes() {
        assert_eq!(mem::size_of::<Page>(), PAGE_SIZE);
    }

    #[test]
    fn tag_transition_preserves_sequence() {
        let page = Page::new(12345);
        assert_eq!(page.tag(), PageTag::Idle);
        assert!(page.transition(PageTag::Idle, PageTag::Locked));
        assert!(!page.transition(PageTag::Idle, PageTag::Head));
        assert_eq!(page.tag(), PageTag::Locked);
        assert_eq!(page.sequence(), 12345);
        assert_eq!(page.force_tag(PageTag::Busy), PageTag::Locked);
        assert_eq!(page.sequence(), 12345);
    }

    #[test]
    fn unaligned_payload_access() {
        let page = Page::new(0);
        page.write_payload(5, b"hello, world");
        page.write_payload(480, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut buf = [0; 12];
        page.read_payload(5, &mut buf);
        assert_eq!(&buf, b"hello, world");

        let mut buf = [0; 4];
        page.read_payload(3, &mut buf);
        assert_eq!(buf, [0, 0, b'h', b'e']);

        let mut buf = [0; 8];
        page.read_payload(480, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn links() {
        let page = Page::new(0);
        assert_eq!(page.next(), None);
        page.set_next(Some(0));
        page.set_prev(Some(41));
        assert_eq!(page.next(), Some(0));
        assert_eq!(page.prev(), Some(41));
    }
}
