//! シェルインスタンス（プロセスに相当する実行コンテキスト）。
//!
//! [`ShellInstance`] は実プロセス・スレッド・疑似 fork の子のいずれとしても存在しうる。
//! 自分専用の fd テーブル、ジョブテーブル、シグナル処分、割り込み遅延状態を持ち、
//! カレントディレクトリは fd テーブルが保持する。
//!
//! インスタンスは [`Arc`] で共有され、[`context`](crate::context) がスレッドに結び付ける。
//! 親へのリンクは [`Weak`] なので、子が親を生かし続けることはない。

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::ThreadId;

use tracing::debug;

use crate::config::Config;
use crate::context;
use crate::error::Result;
use crate::fd::FdTable;
use crate::intr::{CriticalSection, InterruptState};
use crate::job::JobTable;
use crate::native;
use crate::signal::SignalTable;

/// シェルから見えるプロセス ID。スレッドモードの子には [`FAKE_PID_BASE`] 以上の疑似値が振られる。
pub type Pid = i32;

/// スレッドモードの疑似 PID の開始値。OS の PID 範囲と重ならない。
pub const FAKE_PID_BASE: Pid = 0x4000_0000;

static NEXT_FAKE_PID: AtomicI32 = AtomicI32::new(FAKE_PID_BASE);

/// 新しい疑似 PID を払い出す。
pub fn next_fake_pid() -> Pid {
    NEXT_FAKE_PID.fetch_add(1, Ordering::Relaxed)
}

/// 疑似 PID なら `true`。
pub fn is_fake_pid(pid: Pid) -> bool {
    pid >= FAKE_PID_BASE
}

/// インスタンスの実体。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// 独自の OS プロセスを持つ（ルート、ネイティブ fork、疑似 fork の子）。
    Process,
    /// 親と同じプロセス内のスレッド。
    Thread,
}

/// スレッドモードのコンテキストを終了させるための unwind ペイロード。
///
/// [`ShellInstance::exit_shell`] が送出し、スレッドの入口で捕まえて終了ステータスにする。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExit(pub i32);

/// プロセスに相当するシェルの実行状態。
pub struct ShellInstance {
    pid: Pid,
    parent_pid: Pid,
    thread_id: ThreadId,
    kind: ContextKind,
    config: Arc<Config>,
    fds: FdTable,
    jobs: Mutex<JobTable>,
    signals: SignalTable,
    intr: InterruptState,
    parent: Weak<ShellInstance>,
    /// このインスタンスが作った子の PID。
    children: Mutex<Vec<Pid>>,
    /// 直前のバックグラウンドプロセス（`$!`）。
    last_bg_pid: AtomicI32,
}

impl fmt::Debug for ShellInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellInstance")
            .field("pid", &self.pid)
            .field("parent_pid", &self.parent_pid)
            .field("kind", &self.kind)
            .field("cwd", &self.fds.cwd())
            .finish()
    }
}

impl ShellInstance {
    /// 最初のインスタンス。プロセスの標準入出力を fd 0〜2 に取り込み、PID 索引に登録する。
    pub fn root(config: Arc<Config>) -> Result<Arc<ShellInstance>> {
        let fds = FdTable::from_process(config.max_fds)?;
        if let Some(trace_fd) = config.trace_fd {
            fds.set_trace(trace_fd)?;
        }
        let pid = native::getpid();
        let shell = Arc::new(ShellInstance {
            pid,
            parent_pid: 0,
            thread_id: std::thread::current().id(),
            kind: ContextKind::Process,
            config,
            fds,
            jobs: Mutex::new(JobTable::new(pid)),
            signals: SignalTable::new(),
            intr: InterruptState::new(),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            last_bg_pid: AtomicI32::new(0),
        });
        context::register(&shell);
        debug!(pid, "root shell instance created");
        Ok(shell)
    }

    /// fork で作られた子のインスタンス。`fds` と `jobs` は呼び出し側が用意する。
    pub fn fork_child(
        parent: &Arc<ShellInstance>,
        pid: Pid,
        kind: ContextKind,
        fds: FdTable,
        jobs: JobTable,
    ) -> Arc<ShellInstance> {
        let shell = Arc::new(ShellInstance {
            pid,
            parent_pid: parent.pid,
            thread_id: std::thread::current().id(),
            kind,
            config: Arc::clone(&parent.config),
            fds,
            jobs: Mutex::new(jobs),
            signals: parent.signals.for_child(kind == ContextKind::Process),
            intr: InterruptState::new(),
            parent: Arc::downgrade(parent),
            children: Mutex::new(Vec::new()),
            last_bg_pid: AtomicI32::new(0),
        });
        context::register(&shell);
        debug!(pid, parent = parent.pid, ?kind, "child shell instance created");
        shell
    }

    /// 親を持たない独立したインスタンス（空の fd テーブル、疑似 PID）。
    ///
    /// プロセスの状態に触れないので、テストや埋め込み用途で使う。
    pub fn detached(config: Arc<Config>) -> Arc<ShellInstance> {
        let pid = next_fake_pid();
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "/".to_string());
        Arc::new(ShellInstance {
            pid,
            parent_pid: 0,
            thread_id: std::thread::current().id(),
            kind: ContextKind::Thread,
            fds: FdTable::new(config.max_fds, cwd),
            config,
            jobs: Mutex::new(JobTable::new(pid)),
            signals: SignalTable::new().for_child(false),
            intr: InterruptState::new(),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            last_bg_pid: AtomicI32::new(0),
        })
    }

    /// 疑似 fork の子で、受け取った状態からインスタンスを作る。
    pub(crate) fn resumed(
        pid: Pid,
        parent_pid: Pid,
        config: Arc<Config>,
        fds: FdTable,
        jobs: JobTable,
    ) -> Arc<ShellInstance> {
        let shell = Arc::new(ShellInstance {
            pid,
            parent_pid,
            thread_id: std::thread::current().id(),
            kind: ContextKind::Process,
            config,
            fds,
            jobs: Mutex::new(jobs),
            signals: SignalTable::new(),
            intr: InterruptState::new(),
            parent: Weak::new(),
            children: Mutex::new(Vec::new()),
            last_bg_pid: AtomicI32::new(0),
        });
        context::register(&shell);
        shell
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    /// ジョブテーブルをロックする。
    pub fn jobs(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    pub fn intr(&self) -> &InterruptState {
        &self.intr
    }

    /// 割り込みを遅延させる区間に入る（`INTOFF`）。
    pub fn intoff(&self) -> CriticalSection<'_> {
        self.intr.enter()
    }

    /// 親インスタンス（同じプロセス内で生きていれば）。
    pub fn parent(&self) -> Option<Arc<ShellInstance>> {
        self.parent.upgrade()
    }

    pub fn cwd(&self) -> String {
        self.fds.cwd()
    }

    pub fn children(&self) -> Vec<Pid> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn add_child(&self, pid: Pid) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pid);
    }

    pub(crate) fn remove_child(&self, pid: Pid) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|&p| p != pid);
    }

    pub fn last_bg_pid(&self) -> Pid {
        self.last_bg_pid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_bg_pid(&self, pid: Pid) {
        self.last_bg_pid.store(pid, Ordering::Relaxed);
    }

    /// このコンテキストを `status` で終了させる。
    ///
    /// 実プロセスなら `_exit`。スレッドなら [`ThreadExit`] で unwind し、
    /// スレッドの入口でステータスに変換される（途中の drop は通常どおり走る）。
    pub fn exit_shell(&self, status: i32) -> ! {
        debug!(pid = self.pid, status, "exit shell");
        match self.kind {
            ContextKind::Process => native::exit_process(status),
            ContextKind::Thread => std::panic::resume_unwind(Box::new(ThreadExit(status))),
        }
    }
}

impl Drop for ShellInstance {
    fn drop(&mut self) {
        context::unregister(self.pid);
    }
}
