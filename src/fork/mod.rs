//! fork のエミュレーション。
//!
//! [`fork_shell`] は構文木の一部を独立したコンテキストで評価させ、呼び出し元へすぐ戻る。
//! 子の作り方は [`ForkBackend`] の実装ごとに異なるが、評価器から見た契約は同じ。
//!
//! | 戦略 | 実装 | 子の実体 |
//! |------|------|---------|
//! | native | [`native::NativeFork`] | OS の `fork()` で作った子プロセス（Unix のみ） |
//! | thread | [`thread::ThreadFork`] | 同じプロセス内のスレッド。PID は疑似値 |
//! | pseudo | [`pseudo::PseudoFork`] | 停止状態で作った子プロセスにヒープを複製して再開する |
//!
//! 親側の後始末（ジョブへの登録、プロセスグループ、`$!`）と、子側の初期化
//! （プロセスグループ、端末、シグナル、fd の付け替え）はどの戦略でも共通で、このモジュールが持つ。

#[cfg(unix)]
pub mod native;
pub mod pseudo;
pub mod thread;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::arena::ArenaHandle;
use crate::config::ForkStrategy;
use crate::error::{Errno, Error, Result};
use crate::eval::Evaluator;
use crate::fd::{FdTable, OpenFlags};
use crate::native as os;
use crate::shell::{is_fake_pid, ContextKind, Pid, ShellInstance};
use crate::signal::{Disposition, SIGINT, SIGQUIT};

#[cfg(unix)]
const DEV_NULL: &str = "/dev/null";
#[cfg(windows)]
const DEV_NULL: &str = "NUL";

/// 子をどう扱うか。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkMode {
    /// 端末を渡して待つジョブの一員。
    Foreground,
    /// 待たないジョブ。ジョブ制御がなければ SIGINT / SIGQUIT を無視し、stdin は `/dev/null`。
    Background,
    /// ジョブにもプロセスグループにも入れない（コマンド置換など）。
    NoJob,
}

// ── fd の付け替え計画 ────────────────────────────────────────────────

/// 子が評価を始める前に自分の fd テーブルへ適用する操作。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdStep {
    /// `dup2(from, to)`
    Dup { from: i32, to: i32 },
    Close(i32),
}

/// パイプラインやリダイレクトの配線。親のテーブルと同じ番号で記述する。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdPlan {
    steps: Vec<FdStep>,
}

impl FdPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dup(&mut self, from: i32, to: i32) -> &mut Self {
        self.steps.push(FdStep::Dup { from, to });
        self
    }

    pub fn close(&mut self, fd: i32) -> &mut Self {
        self.steps.push(FdStep::Close(fd));
        self
    }

    /// `from` を `to` に付け替えて `from` を閉じる。同じ番号なら何もしない。
    pub fn move_to(&mut self, from: i32, to: i32) -> &mut Self {
        if from != to {
            self.dup(from, to).close(from);
        }
        self
    }

    pub fn steps(&self) -> &[FdStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 順に適用する。すでに閉じている fd の `Close` は無視する。
    pub fn apply(&self, fds: &FdTable) -> Result<()> {
        for step in &self.steps {
            match *step {
                FdStep::Dup { from, to } => {
                    fds.dup_onto(from, to)?;
                }
                FdStep::Close(fd) => match fds.close(fd) {
                    Err(e) if e.errno() == Some(Errno::EBADF) => {}
                    other => other?,
                },
            }
        }
        Ok(())
    }
}

// ── 要求と結果 ───────────────────────────────────────────────────────

/// [`fork_shell`] への要求。
pub struct ForkRequest {
    /// 子を加えるジョブ。
    pub job: Option<usize>,
    /// 子が評価する木。
    pub node: ArenaHandle,
    pub mode: ForkMode,
    pub fd_plan: FdPlan,
    /// 子で `node` を評価する評価器。
    pub evaluator: Arc<dyn Evaluator>,
}

impl ForkRequest {
    pub fn new(node: ArenaHandle, mode: ForkMode, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            job: None,
            node,
            mode,
            fd_plan: FdPlan::default(),
            evaluator,
        }
    }

    pub fn in_job(mut self, job: usize) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_fd_plan(mut self, plan: FdPlan) -> Self {
        self.fd_plan = plan;
        self
    }
}

/// 作った子。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildHandle {
    pub pid: Pid,
    pub strategy: ForkStrategy,
}

/// 子側の初期化内容。親で決めて子に渡す（疑似 fork ではプロセス境界を越える）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSetup {
    /// 入るプロセスグループ。`Some(0)` は自分がリーダーの新しいグループ。
    pgrp: Option<Pid>,
    /// フォアグラウンドなら端末を渡す tty fd。
    tty: Option<i32>,
    /// ジョブ制御なしのバックグラウンド: SIGINT / SIGQUIT を無視する。
    ignore_interrupts: bool,
    /// ジョブの最初のプロセスなら stdin を `/dev/null` にする。
    stdin_null: bool,
    fd_plan: FdPlan,
}

/// バックエンドに渡す子の仕事。
pub struct ChildTask {
    node: ArenaHandle,
    evaluator: Arc<dyn Evaluator>,
    setup: ChildSetup,
}

impl ChildTask {
    pub fn node(&self) -> &ArenaHandle {
        &self.node
    }

    pub fn setup(&self) -> &ChildSetup {
        &self.setup
    }

    /// 子コンテキストで初期化してから評価する。戻り値は終了ステータス。
    pub fn run(self, shell: &Arc<ShellInstance>) -> i32 {
        match init_child(shell, &self.setup) {
            Ok(()) => self.evaluator.evaluate(shell, self.node.root()),
            Err(e) => {
                eprintln!("rush: {}", e);
                2
            }
        }
    }
}

/// 子コンテキストを作る方法。
pub trait ForkBackend {
    fn strategy(&self) -> ForkStrategy;

    /// 子を作って `task` を評価させ、親に子の PID を返す。
    fn fork(&self, parent: &Arc<ShellInstance>, task: ChildTask) -> Result<Pid>;
}

/// 設定された戦略のバックエンド。
pub fn backend_for(strategy: ForkStrategy) -> Result<Box<dyn ForkBackend>> {
    match strategy.resolve() {
        #[cfg(unix)]
        ForkStrategy::Native => Ok(Box::new(native::NativeFork)),
        ForkStrategy::Thread => Ok(Box::new(thread::ThreadFork)),
        #[cfg(windows)]
        ForkStrategy::Pseudo => Ok(Box::new(pseudo::PseudoFork::new(pseudo::ProcessLauncher))),
        other => Err(Error::Fork(format!(
            "{:?} fork is not available on this platform",
            other
        ))),
    }
}

// ── fork_shell ───────────────────────────────────────────────────────

/// 設定の戦略で子を作る。
pub fn fork_shell(shell: &Arc<ShellInstance>, req: ForkRequest) -> Result<ChildHandle> {
    let backend = backend_for(shell.config().fork_strategy)?;
    fork_with(shell, backend.as_ref(), req)
}

/// 指定したバックエンドで子を作る。
///
/// 子の作成から親側の登録までを割り込み遅延区間で行う。
pub fn fork_with(
    shell: &Arc<ShellInstance>,
    backend: &dyn ForkBackend,
    req: ForkRequest,
) -> Result<ChildHandle> {
    let strategy = backend.strategy();
    let cmd = req.node.root().command_text();
    let setup = plan_child(shell, &req, strategy);
    let group = setup.pgrp;
    let task = ChildTask {
        node: req.node,
        evaluator: req.evaluator,
        setup,
    };

    let _intoff = shell.intoff();
    let pid = backend.fork(shell, task)?;

    shell.add_child(pid);
    if let Some(g) = group {
        if !is_fake_pid(pid) {
            let pgrp = if g == 0 { pid } else { g };
            // 子がすでに exec 済みなら EACCES。子側でも設定するので無視してよい。
            if let Err(e) = os::setpgid(pid, pgrp) {
                debug!(pid, pgrp, errno = %e, "setpgid in parent failed");
            }
        }
    }
    if req.mode == ForkMode::Background {
        shell.set_last_bg_pid(pid);
    }
    if let Some(id) = req.job {
        shell.jobs().add_process(id, pid, cmd)?;
    }
    debug!(pid, ?strategy, mode = ?req.mode, job = ?req.job, "forked");
    Ok(ChildHandle { pid, strategy })
}

/// 親の状態から子の初期化内容を決める。
fn plan_child(shell: &ShellInstance, req: &ForkRequest, strategy: ForkStrategy) -> ChildSetup {
    let jobs = shell.jobs();
    let jobctl = jobs.job_control();
    let leader = req
        .job
        .and_then(|id| jobs.job(id))
        .filter(|j| !j.procs().is_empty())
        .map(|j| j.pgid());
    let pgrp = (jobctl && req.mode != ForkMode::NoJob && strategy != ForkStrategy::Thread)
        .then(|| leader.unwrap_or(0));
    let background_plain = req.mode == ForkMode::Background && !jobctl;
    ChildSetup {
        pgrp,
        tty: if req.mode == ForkMode::Foreground && pgrp.is_some() {
            jobs.tty_fd()
        } else {
            None
        },
        ignore_interrupts: background_plain,
        stdin_null: background_plain && leader.is_none(),
        fd_plan: req.fd_plan.clone(),
    }
}

/// 子コンテキスト側の初期化。ジョブテーブルは呼び出し側が親の写しで用意している。
pub(crate) fn init_child(shell: &ShellInstance, setup: &ChildSetup) -> Result<()> {
    let _intoff = shell.intoff();
    if shell.kind() == ContextKind::Process {
        if let Some(g) = setup.pgrp {
            let pgrp = if g == 0 { shell.pid() } else { g };
            os::setpgid(0, pgrp).map_err(|e| Error::JobControl(format!("setpgid: {}", e)))?;
            if let Some(tty) = setup.tty {
                if let Err(e) = shell.fds().tcsetpgrp(tty, pgrp) {
                    warn!(tty, pgrp, error = %e, "cannot give terminal to child");
                }
            }
        }
        shell.signals().reset_for_child()?;
    }
    if setup.ignore_interrupts {
        shell.signals().set(SIGINT, Disposition::Ignore)?;
        shell.signals().set(SIGQUIT, Disposition::Ignore)?;
    }
    if setup.stdin_null {
        let fds = shell.fds();
        let _ = fds.close(0);
        let fd = fds.open(DEV_NULL, OpenFlags::READ, 0)?;
        if fd != 0 {
            fds.dup_onto(fd, 0)?;
            fds.close(fd)?;
        }
    }
    setup.fd_plan.apply(shell.fds())
}
