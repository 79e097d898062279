//! 割り込み遅延プロトコル（`INTOFF` / `INTON`）。
//!
//! [`InterruptState`] は [`ShellInstance`](crate::shell::ShellInstance) ごとに 1 つ存在する
//! ネスト可能なカウンタ。[`InterruptState::enter`] が返す [`CriticalSection`] が生きている間は
//! シグナルを「記録して戻る」だけにし、最外側のガードが drop された時点で保留シグナルを
//! まとめてディスパッチする。
//!
//! ミューテックスではない（ブロックしない）。シグナル配送経路に「今は処理するな」と
//! 伝えるだけの協調的なマーカーである。ヒープ・fd テーブル・ジョブテーブルの変更のうち、
//! シグナルハンドラ側のコードから到達しうるものはこの区間内で行う。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use crate::signal::SIGINT;

/// 保留シグナルのディスパッチ先。引数はシグナル番号。
pub type Dispatcher = Box<dyn Fn(i32) + Send + Sync>;

/// 割り込み遅延の状態。
pub struct InterruptState {
    /// `INTOFF` のネスト深さ。
    depth: AtomicU32,
    /// 区間内で記録されたシグナルのビットマスク（bit n = シグナル n）。
    pending: AtomicU64,
    /// SIGINT を受け取ったことを示すフラグ。評価器が [`take_interrupt`](Self::take_interrupt) で消費する。
    interrupted: AtomicBool,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl fmt::Debug for InterruptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptState")
            .field("depth", &self.depth())
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("interrupted", &self.interrupt_pending())
            .finish()
    }
}

impl Default for InterruptState {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            pending: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        }
    }

    /// クリティカルセクションに入る（`INTOFF`）。ガードの drop で抜ける（`INTON`）。
    pub fn enter(&self) -> CriticalSection<'_> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        CriticalSection { state: self }
    }

    /// 現在のネスト深さ。
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// クリティカルセクション内なら `true`。
    pub fn is_deferred(&self) -> bool {
        self.depth() > 0
    }

    /// シグナルを記録する。区間外ならその場でディスパッチする。
    ///
    /// ビットを先に立ててから深さを確認するため、[`CriticalSection`] の drop と競合しても
    /// 取りこぼしも二重ディスパッチも起きない（ビットの取り出しは `swap` で一度きり）。
    pub fn record(&self, signo: i32) {
        if !(1..64).contains(&signo) {
            return;
        }
        if signo == SIGINT {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        self.pending.fetch_or(1u64 << signo, Ordering::SeqCst);
        if !self.is_deferred() {
            self.dispatch_pending();
        } else {
            trace!(signo, depth = self.depth(), "signal deferred");
        }
    }

    /// 記録済みで未ディスパッチのシグナル番号（昇順）。
    pub fn pending_signals(&self) -> Vec<i32> {
        let mask = self.pending.load(Ordering::SeqCst);
        (1..64).filter(|n| mask & (1u64 << n) != 0).collect()
    }

    /// SIGINT を受け取っていれば `true`。
    pub fn interrupt_pending(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// SIGINT フラグを取り出してクリアする。
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// 保留シグナルのディスパッチ先を設定する。
    pub fn set_dispatcher(&self, dispatcher: Dispatcher) {
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(dispatcher);
    }

    fn leave(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "INTON without matching INTOFF");
        if prev == 1 {
            self.dispatch_pending();
        }
    }

    fn dispatch_pending(&self) {
        let mask = self.pending.swap(0, Ordering::SeqCst);
        if mask == 0 {
            return;
        }
        let guard = self
            .dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for signo in (1..64).filter(|n| mask & (1u64 << n) != 0) {
            trace!(signo, "dispatching signal");
            if let Some(dispatch) = guard.as_ref() {
                dispatch(signo);
            }
        }
    }
}

/// `INTOFF` 区間を表す RAII ガード。早期 return や `?` による伝播でも必ず `INTON` される。
#[must_use = "dropping the guard immediately ends the critical section"]
pub struct CriticalSection<'a> {
    state: &'a InterruptState,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        self.state.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counting_state() -> (InterruptState, Arc<Mutex<Vec<i32>>>) {
        let state = InterruptState::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        state.set_dispatcher(Box::new(move |sig| sink.lock().unwrap().push(sig)));
        (state, seen)
    }

    #[test]
    fn dispatches_immediately_outside_section() {
        let (state, seen) = counting_state();
        state.record(SIGINT);
        assert_eq!(*seen.lock().unwrap(), vec![SIGINT]);
        assert!(state.pending_signals().is_empty());
    }

    #[test]
    fn nested_sections_defer_until_outermost_exit() {
        let (state, seen) = counting_state();
        let depth = 4;
        let mut guards = Vec::new();
        for _ in 0..depth {
            guards.push(state.enter());
        }
        state.record(SIGINT);
        state.record(SIGINT);
        assert_eq!(state.pending_signals(), vec![SIGINT]);

        while guards.len() > 1 {
            guards.pop();
            assert!(seen.lock().unwrap().is_empty(), "dispatched before outermost INTON");
        }
        guards.pop();
        assert_eq!(*seen.lock().unwrap(), vec![SIGINT]);
        assert_eq!(state.depth(), 0);
    }

    #[test]
    fn early_return_releases_section() {
        let (state, seen) = counting_state();
        fn fallible(state: &InterruptState) -> Result<(), ()> {
            let _g = state.enter();
            state.record(15);
            Err(())
        }
        assert!(fallible(&state).is_err());
        assert_eq!(state.depth(), 0);
        assert_eq!(*seen.lock().unwrap(), vec![15]);
    }

    #[test]
    fn interrupt_flag_is_sticky_until_taken() {
        let state = InterruptState::new();
        {
            let _g = state.enter();
            state.record(SIGINT);
        }
        assert!(state.interrupt_pending());
        assert!(state.take_interrupt());
        assert!(!state.interrupt_pending());
    }

    #[test]
    fn out_of_range_signals_ignored() {
        let (state, seen) = counting_state();
        state.record(0);
        state.record(64);
        assert!(seen.lock().unwrap().is_empty());
    }
}
