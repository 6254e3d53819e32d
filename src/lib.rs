//! Shared Block Pool.
//!
//! `blockpool`は、ストリーム処理のパイプラインで、ライタ・リーダ・クリーナの各ロールが
//! データをコピーせずに受け渡すための、共有メモリ上のブロックプール.
//!
//! # 特徴
//!
//! - 固定長(512バイト)の[ページ][segment]を連続して束ねた、可変長の[ブロック][block]を単位にデータを管理
//! - ブロックの獲得・解放はヘッダ内の参照ビットマップに対するアトミック操作のみで行われ、中央のロックを持たない
//!   - ライタは`FREE`状態のブロックを排他的に獲得して書き込み、コミットして`USING`状態にする
//!   - リーダは購読しているライタのブロックを、`USING`期間中に一度だけ獲得できる
//!   - クリーナは参照が全て外れたブロックを`CLEAN`状態にし、削除可能にする
//! - 各ブロックは、ユーザデータ領域のどこにどの型の値が置かれているかを記録する
//!   [DTTA][dtta](dynamic type tracking)テーブルを内蔵する
//!   - 型は[型記述子][descriptor]というタグ付きのバイト列で表現される
//!   - ポインタや参照(byref)の参照先が、登録済みの変数の境界に収まっているかを検証できる
//! - ブロックは不透明な[ハンドル][handle]で外部に公開でき、削除後の古いハンドルは検出される
//! - コア操作は待機しない. 待機が必要な呼び出し元は[バックオフ][backoff]を使う
//!
//! # モジュールの依存関係
//!
//! ```text
//! pool => block => dtta => descriptor
//!           \=> segment
//! ```
//!
//! - [pool]モジュール:
//!   - 主に[Pool]構造体を提供
//!   - 利用者が直接触るのはこの構造体で、セグメント群の管理と空きブロックの探索を担当する
//! - [block]モジュール:
//!   - ブロックの作成・削除・分割・併合と、各ロールによる獲得・解放を提供
//! - [dtta]モジュール:
//!   - ブロック内の型情報テーブルの検索・更新と、ポインタ・参照の検証を提供
//! - [segment]モジュール:
//!   - ページ領域の確保([PageAllocator])とページ単位の状態管理を提供
//!
//! [segment]: ./segment/index.html
//! [block]: ./block/index.html
//! [dtta]: ./dtta/index.html
//! [descriptor]: ./descriptor/index.html
//! [handle]: ./handle/index.html
//! [backoff]: ./backoff/index.html
//! [pool]: ./pool/index.html
//! [Pool]: ./pool/struct.Pool.html
//! [PageAllocator]: ./segment/trait.PageAllocator.html
#![warn(missing_docs)]
extern crate byteorder;
extern crate prometrics;
#[macro_use]
extern crate trackable;
extern crate uuid;
#[macro_use]
extern crate slog;

pub use crate::error::{Error, ErrorKind};

pub mod backoff;
pub mod block;
pub mod descriptor;
pub mod dtta;
pub mod handle;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod segment;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
