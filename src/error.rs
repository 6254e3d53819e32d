use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::Other.cause(e.to_string()).into()
    }
}
impl From<std::collections::TryReserveError> for Error {
    fn from(e: std::collections::TryReserveError) -> Self {
        ErrorKind::OutOfMemory.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 入力が不正.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 指定されたオフセットが、ブロックのユーザデータ領域の範囲外.
    IllegalOffset,

    /// ブロックのヘッダやページ連結が壊れている.
    ///
    /// プログラムのバグか、共有メモリが外部から書き換えられたことを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - 該当セグメントを解放して作り直す
    BlockCorrupted,

    /// ブロックの状態が、要求された操作の前提条件を満たしていない.
    ///
    /// E.g., `USING`状態でないブロックに対する読み込み獲得、既に訪問済みのリーダによる再獲得
    BlockUnexpected,

    /// 他のロールがまだブロックの参照ビットを保持している.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者が時間をおいてリトライする
    BlockUnreleased,

    /// 同じブロックに対する書き込み獲得の競合に負けた.
    ///
    /// # 典型的な対応策
    ///
    /// - 別のブロックを選択してやり直す
    WriterConflict,

    /// 渡されたハンドルが指すブロックは既に作り直されている.
    StaleHandle,

    /// 待機処理がタイムアウトした.
    Timeout,

    /// プール内に、要求を満たせる空きページが存在しない.
    ///
    /// # 典型的な対応策
    ///
    /// - 不要なブロックを掃除・削除する
    /// - セグメントの上限数を増やす
    PoolExhausted,

    /// DTTAのエントリ数が上限に達している.
    LutFull,

    /// DTTAの記述子領域に空きがない.
    DttaOverflow,

    /// 下位のアロケータがメモリを確保できなかった.
    OutOfMemory,

    /// 型記述子の形式が不正.
    IllegalDescriptor,

    /// 既存エントリと新しい記述子の長さ、あるいは先頭タグが一致しない.
    DescriptorMismatch,

    /// 登録しようとした範囲が既存のオブジェクトと重なっている.
    DataConflict,

    /// 指定オフセットから始まるDTTAエントリが存在しない.
    EntryNotFound,

    /// ポインタの参照先が、登録済みオブジェクトの内部に収まっていない.
    IllegalPointer,

    /// 参照(byref)の参照先が、フィールド境界と一致しない.
    IllegalByref,

    /// その他エラー.
    Other,
}
impl ErrorKind {
    /// 時間をおいて同じ操作をやり直せば成功し得るエラーかどうかを返す.
    pub fn is_retriable(self) -> bool {
        match self {
            ErrorKind::BlockUnreleased
            | ErrorKind::WriterConflict
            | ErrorKind::Timeout
            | ErrorKind::PoolExhausted => true,
            _ => false,
        }
    }
}
impl trackable::error::ErrorKind for ErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(ErrorKind::BlockUnreleased.is_retriable());
        assert!(ErrorKind::WriterConflict.is_retriable());
        assert!(!ErrorKind::IllegalDescriptor.is_retriable());
        assert!(!ErrorKind::BlockCorrupted.is_retriable());
    }

    #[test]
    fn poison_error_maps_to_other() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock();
            panic!("poison");
        })
        .join();
        let e: Error = lock.lock().map(|_| ()).unwrap_err().into();
        assert_eq!(*e.kind(), ErrorKind::Other);
    }
}
