//! 上限付きのバックオフ.
//!
//! コア操作は決して待機しないため、待機が必要な呼び出し元はこのモジュールを使って
//! スピン・`yield`・スリープの順に間隔を伸ばしながら再試行する.
use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use crate::{ErrorKind, Result};

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const MAX_SLEEP: Duration = Duration::from_millis(10);

/// タイムアウト付きのバックオフ.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
    deadline: Instant,
}
impl Backoff {
    /// `timeout`経過後に失敗するバックオフを生成する.
    pub fn new(timeout: Duration) -> Self {
        Backoff {
            step: 0,
            deadline: Instant::now() + timeout,
        }
    }

    /// 一回分待機する.
    ///
    /// 期限を過ぎている場合には`ErrorKind::Timeout`が返される.
    pub fn snooze(&mut self) -> Result<()> {
        track_assert!(
            Instant::now() < self.deadline,
            ErrorKind::Timeout,
            "step={}",
            self.step
        );
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1 << self.step) {
                hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            thread::yield_now();
        } else {
            let sleep = Duration::from_micros(1 << (self.step - YIELD_LIMIT).min(14));
            thread::sleep(sleep.min(MAX_SLEEP));
        }
        self.step = self.step.saturating_add(1);
        Ok(())
    }
}

/// `f`が`true`を返すまで、バックオフを挟みつつ繰り返し呼び出す.
pub fn wait_until<F>(timeout: Duration, mut f: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let mut backoff = Backoff::new(timeout);
    while !f() {
        track!(backoff.snooze())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn wait_until_works() -> TestResult {
        let mut n = 0;
        track!(wait_until(Duration::from_secs(10), || {
            n += 1;
            n == 20
        }))?;
        assert_eq!(n, 20);
        Ok(())
    }

    #[test]
    fn timeout() {
        let e = wait_until(Duration::from_millis(5), || false).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::Timeout));
    }
}
