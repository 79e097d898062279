//! シェルコンテキストのレジストリ。
//!
//! OS スレッドごとに「いま実行している [`ShellInstance`]」を 1 つ結び付ける。
//! スレッドモードでは 1 プロセスに複数のインスタンスが共存するため、
//! プロセス全体のグローバル変数ではなくスレッドローカルで持つ。
//!
//! あわせて、シェル PID → インスタンスのプロセス全体の索引を持つ。
//! スレッドモードの疑似 PID からインスタンスを引くために使う。

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::trace;

use crate::shell::{Pid, ShellInstance};

thread_local! {
    static CURRENT: RefCell<Option<Arc<ShellInstance>>> = const { RefCell::new(None) };
}

/// 呼び出し元スレッドに `shell` を結び付ける。ガードの drop で直前の結び付きに戻る。
pub fn bind(shell: Arc<ShellInstance>) -> BindGuard {
    trace!(pid = shell.pid(), "bind context");
    let previous = CURRENT.with(|c| c.borrow_mut().replace(shell));
    BindGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// 呼び出し元スレッドに結び付いたインスタンス。未結合なら `None`。
pub fn current() -> Option<Arc<ShellInstance>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// 結び付いたインスタンスがあれば `f` を呼ぶ。`Arc` の複製を作らない。
pub fn with_current<R>(f: impl FnOnce(&Arc<ShellInstance>) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow().as_ref().map(f))
}

/// 結び付きを外して返す。
pub fn unbind() -> Option<Arc<ShellInstance>> {
    CURRENT.with(|c| c.borrow_mut().take())
}

/// [`bind`] が返すガード。生成したスレッドでしか drop できない。
#[must_use = "dropping the guard immediately unbinds the context"]
pub struct BindGuard {
    previous: Option<Arc<ShellInstance>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

// ── PID 索引 ─────────────────────────────────────────────────────────

fn index() -> MutexGuard<'static, HashMap<Pid, Weak<ShellInstance>>> {
    static INDEX: OnceLock<Mutex<HashMap<Pid, Weak<ShellInstance>>>> = OnceLock::new();
    INDEX
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// インスタンスを PID で引けるようにする。
pub fn register(shell: &Arc<ShellInstance>) {
    index().insert(shell.pid(), Arc::downgrade(shell));
}

/// `pid` の登録を消す。生きている別インスタンスが同じ PID を持つ場合は消さない。
pub fn unregister(pid: Pid) {
    let mut index = index();
    if index.get(&pid).is_some_and(|w| w.strong_count() == 0) {
        index.remove(&pid);
    }
}

/// PID からインスタンスを引く。
pub fn lookup(pid: Pid) -> Option<Arc<ShellInstance>> {
    index().get(&pid).and_then(Weak::upgrade)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn shell() -> Arc<ShellInstance> {
        ShellInstance::detached(Arc::new(Config::default()))
    }

    #[test]
    fn unbind_takes_the_binding() {
        let s = shell();
        let pid = s.pid();
        std::thread::spawn(move || {
            let _g = bind(s);
            assert_eq!(unbind().map(|s| s.pid()), Some(pid));
            assert!(current().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn unbound_thread_has_no_context() {
        std::thread::spawn(|| assert!(current().is_none()))
            .join()
            .unwrap();
    }

    #[test]
    fn bind_restores_previous_on_drop() {
        let outer = shell();
        let inner = shell();
        let _g1 = bind(Arc::clone(&outer));
        {
            let _g2 = bind(Arc::clone(&inner));
            assert_eq!(current().map(|s| s.pid()), Some(inner.pid()));
        }
        assert_eq!(current().map(|s| s.pid()), Some(outer.pid()));
        assert_eq!(with_current(|s| s.pid()), Some(outer.pid()));
    }

    #[test]
    fn bindings_are_per_thread() {
        let a = shell();
        let b = shell();
        let _g = bind(Arc::clone(&a));
        let b_pid = b.pid();
        std::thread::spawn(move || {
            let _g = bind(b);
            assert_eq!(current().map(|s| s.pid()), Some(b_pid));
        })
        .join()
        .unwrap();
        assert_eq!(current().map(|s| s.pid()), Some(a.pid()));
    }

    #[test]
    fn lookup_by_pid_until_dropped() {
        let s = shell();
        register(&s);
        let pid = s.pid();
        assert!(lookup(pid).is_some_and(|found| Arc::ptr_eq(&found, &s)));
        drop(s);
        assert!(lookup(pid).is_none());
    }
}
