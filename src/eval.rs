//! 評価器との境界と、コアの機能だけで動く最小の評価器。
//!
//! 本物のシェルでは構文木の評価は外部の評価器が行い、このクレートは [`Evaluator`] として
//! それを受け取る（fork した子で木の続きを評価させるため）。
//!
//! [`CommandRunner`] は単純コマンド / パイプライン / サブシェル / 並びを
//! fork・exec・ジョブ・fd テーブルだけで実行する。ドライバとテストが使う。
//!
//! - 単一ビルトイン: fork せず、リダイレクトを退避・復元して実行
//! - 外部コマンド: 子を fork して子側で `exec`
//! - パイプライン: N-1 本のパイプを張り、各要素を同じジョブの子として fork
//! - `&`: バックグラウンドジョブとして fork し、待たずに 0 を返す

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::arena::{NodeKind, NodeRef, Redirect, RedirectKind};
use crate::error::{Error, Result};
use crate::exec;
use crate::fd::{FdTable, OpenFlags};
use crate::fork::{fork_shell, FdPlan, ForkMode, ForkRequest};
use crate::job::{self, ShowMode};
use crate::shell::{Pid, ShellInstance};
use crate::signal;

/// 構文木を評価するもの。
///
/// fork した子はこれを受け取って、渡された木を自分のコンテキストで評価する。
pub trait Evaluator: Send + Sync {
    /// `node` を評価して終了ステータスを返す。
    fn evaluate(&self, shell: &Arc<ShellInstance>, node: NodeRef<'_>) -> i32;
}

/// リダイレクトの退避先の下限（ユーザーの fd と重ならない番号）。
const SAVE_FD_MIN: i32 = 10;

/// 既定の `PATH`。
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// 最小のコマンド実行器。
#[derive(Debug)]
pub struct CommandRunner {
    path: String,
    env: Vec<String>,
    /// fork 済みの子として動いている。外部コマンドは fork せずにそのまま exec する。
    forked: bool,
    /// 引き継いだ木を評価する子プロセスの入口。最初の評価で `forked` を決める。
    resumed: bool,
    last_status: AtomicI32,
}

impl Clone for CommandRunner {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            env: self.env.clone(),
            forked: self.forked,
            resumed: self.resumed,
            last_status: AtomicI32::new(self.last_status()),
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    /// プロセスの環境（`PATH` を含む）で作る。
    pub fn new() -> Self {
        let path = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
        Self::with_env(path, exec::environ())
    }

    pub fn with_env(path: impl Into<String>, env: Vec<String>) -> Self {
        Self {
            path: path.into(),
            env,
            forked: false,
            resumed: false,
            last_status: AtomicI32::new(0),
        }
    }

    /// 疑似 fork の子プロセスで、親から引き継いだ木を評価するための評価器。
    pub fn resumed(mut self) -> Self {
        self.resumed = true;
        self
    }

    /// 直前に評価したコマンドの終了ステータス（`$?`）。
    pub fn last_status(&self) -> i32 {
        self.last_status.load(Ordering::Relaxed)
    }

    /// `node` を評価する子のための評価器。単純コマンドならその場で exec させる。
    fn for_child(&self, node: &NodeRef<'_>) -> CommandRunner {
        let mut child = self.clone();
        child.forked = matches!(node.kind(), NodeKind::Command { .. });
        child.resumed = false;
        child
    }

    fn run(&self, shell: &Arc<ShellInstance>, node: NodeRef<'_>) -> Result<i32> {
        match node.kind() {
            NodeKind::Command { argv, redirects } => self.command(shell, node, &argv, &redirects),
            NodeKind::Pipeline(cmds) if cmds.len() == 1 => self.run(shell, cmds[0]),
            NodeKind::Pipeline(cmds) => self.pipeline(shell, &cmds, ForkMode::Foreground),
            NodeKind::Subshell(body) => self.foreground(shell, body),
            NodeKind::Sequence(items) => {
                let mut status = 0;
                for (item, background) in items {
                    signal::poll_signals(shell);
                    if shell.intr().take_interrupt() {
                        return Ok(crate::error::exit_status_for_signal(signal::SIGINT));
                    }
                    status = if background {
                        self.background(shell, item)?
                    } else {
                        let s = self.run(shell, item)?;
                        self.last_status.store(s, Ordering::Relaxed);
                        s
                    };
                }
                Ok(status)
            }
        }
    }

    // ── 単純コマンド ─────────────────────────────────────────────────

    fn command(
        &self,
        shell: &Arc<ShellInstance>,
        node: NodeRef<'_>,
        argv: &[&str],
        redirects: &[Redirect],
    ) -> Result<i32> {
        let fds = shell.fds();
        if let Some(&name) = argv.first() {
            if is_builtin(name) {
                if self.forked {
                    apply_redirects(fds, redirects)?;
                    return Ok(self.builtin(shell, argv));
                }
                let saved = SavedFds::push(fds, redirects)?;
                let status = self.builtin(shell, argv);
                drop(saved);
                return Ok(status);
            }
        }
        if !self.forked {
            return self.foreground(shell, node);
        }

        apply_redirects(fds, redirects)?;
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        if argv.is_empty() {
            return Ok(0);
        }
        let err = exec::exec_image(shell, &argv, &self.env, &self.path);
        eprintln!("rush: {}", err);
        Ok(err.status())
    }

    fn builtin(&self, shell: &Arc<ShellInstance>, argv: &[&str]) -> i32 {
        match run_builtin(shell, argv, self.last_status()) {
            Ok(status) => status,
            Err(e) => {
                eprintln!("rush: {}: {}", argv[0], e);
                1
            }
        }
    }

    // ── fork ─────────────────────────────────────────────────────────

    fn spawn(
        &self,
        shell: &Arc<ShellInstance>,
        node: NodeRef<'_>,
        mode: ForkMode,
        job: usize,
        plan: FdPlan,
    ) -> Result<Pid> {
        let evaluator = Arc::new(self.for_child(&node));
        let req = ForkRequest::new(node.share(), mode, evaluator)
            .in_job(job)
            .with_fd_plan(plan);
        Ok(fork_shell(shell, req)?.pid)
    }

    /// 1 つの子で `node` を評価し、終わるまで待つ。
    fn foreground(&self, shell: &Arc<ShellInstance>, node: NodeRef<'_>) -> Result<i32> {
        let id = new_job(shell, 1, true)?;
        self.spawn(shell, node, ForkMode::Foreground, id, FdPlan::new())?;
        job::wait_for_job(shell, id)
    }

    fn background(&self, shell: &Arc<ShellInstance>, node: NodeRef<'_>) -> Result<i32> {
        if let NodeKind::Pipeline(cmds) = node.kind() {
            if cmds.len() > 1 {
                return self.pipeline(shell, &cmds, ForkMode::Background);
            }
        }
        let id = new_job(shell, 1, false)?;
        let pid = self.spawn(shell, node, ForkMode::Background, id, FdPlan::new())?;
        announce(shell, id, pid);
        Ok(0)
    }

    /// パイプライン。各要素の stdout を次の要素の stdin につなぐ。
    fn pipeline(
        &self,
        shell: &Arc<ShellInstance>,
        cmds: &[NodeRef<'_>],
        mode: ForkMode,
    ) -> Result<i32> {
        let n = cmds.len();
        let id = new_job(shell, n, mode == ForkMode::Foreground)?;
        let fds = shell.fds();

        let mut prev_read: Option<i32> = None;
        let mut last_pid = 0;
        for (i, cmd) in cmds.iter().enumerate() {
            let next = if i + 1 < n {
                match fds.pipe() {
                    Ok(p) => Some(p),
                    Err(e) => {
                        close_quietly(fds, prev_read);
                        return Err(e);
                    }
                }
            } else {
                None
            };

            let mut plan = FdPlan::new();
            if let Some(r) = prev_read {
                plan.move_to(r, 0);
            }
            if let Some((r, w)) = next {
                plan.move_to(w, 1).close(r);
            }
            let spawned = self.spawn(shell, *cmd, mode, id, plan);

            // 親は使い終わった端を閉じる。
            close_quietly(fds, prev_read.take());
            if let Some((r, w)) = next {
                close_quietly(fds, Some(w));
                prev_read = Some(r);
            }
            match spawned {
                Ok(pid) => last_pid = pid,
                Err(e) => {
                    close_quietly(fds, prev_read);
                    return Err(e);
                }
            }
        }
        debug!(job = id, n, ?mode, "pipeline started");

        if mode == ForkMode::Background {
            announce(shell, id, last_pid);
            return Ok(0);
        }
        job::wait_for_job(shell, id)
    }
}

impl Evaluator for CommandRunner {
    fn evaluate(&self, shell: &Arc<ShellInstance>, node: NodeRef<'_>) -> i32 {
        if self.resumed {
            return self.for_child(&node).evaluate(shell, node);
        }
        let status = match self.run(shell, node) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("rush: {}", e);
                2
            }
        };
        self.last_status.store(status, Ordering::Relaxed);
        status
    }
}

fn new_job(shell: &ShellInstance, nprocs: usize, foreground: bool) -> Result<usize> {
    let mut jobs = shell.jobs();
    let id = jobs.make_job(nprocs);
    jobs.set_foreground(id, foreground)?;
    Ok(id)
}

/// ジョブ制御中なら `[N] pid` を表示する。
fn announce(shell: &ShellInstance, id: usize, pid: Pid) {
    if shell.jobs().job_control() {
        eprintln!("[{}] {}", id, pid);
    }
}

fn close_quietly(fds: &FdTable, fd: Option<i32>) {
    if let Some(fd) = fd {
        let _ = fds.close(fd);
    }
}

// ── リダイレクト ─────────────────────────────────────────────────────

/// 1 つのリダイレクトを現在の fd テーブルに適用する。
fn apply_redirect(fds: &FdTable, r: &Redirect) -> Result<()> {
    let flags = match r.kind {
        RedirectKind::Input => OpenFlags::READ,
        RedirectKind::Output => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        RedirectKind::Append => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        RedirectKind::Dup => {
            if r.target == "-" {
                return match fds.close(r.fd) {
                    Err(e) if e.errno() == Some(crate::error::Errno::EBADF) => Ok(()),
                    other => other,
                };
            }
            let src: i32 = r
                .target
                .parse()
                .map_err(|_| Error::os(r.target.clone(), crate::error::Errno::EBADF))?;
            fds.dup_onto(src, r.fd)?;
            return Ok(());
        }
    };
    let fd = fds.open(&r.target, flags, 0o666)?;
    if fd != r.fd {
        let moved = fds.dup_onto(fd, r.fd);
        fds.close(fd)?;
        moved?;
    }
    Ok(())
}

fn apply_redirects(fds: &FdTable, redirects: &[Redirect]) -> Result<()> {
    redirects.iter().try_for_each(|r| apply_redirect(fds, r))
}

/// ビルトイン用に退避した fd。drop で元に戻す。
struct SavedFds<'a> {
    fds: &'a FdTable,
    /// (対象 fd, 退避先)。退避先が `None` なら元は閉じていた。
    saved: Vec<(i32, Option<i32>)>,
}

impl<'a> SavedFds<'a> {
    fn push(fds: &'a FdTable, redirects: &[Redirect]) -> Result<Self> {
        let mut saved = SavedFds {
            fds,
            saved: Vec::with_capacity(redirects.len()),
        };
        for r in redirects {
            let backup = match fds.entry(r.fd) {
                Some(e) if e.is_open() => {
                    let b = fds.dup_above(r.fd, SAVE_FD_MIN)?;
                    fds.set_close_on_exec(b, true)?;
                    Some(b)
                }
                _ => None,
            };
            saved.saved.push((r.fd, backup));
            apply_redirect(fds, r)?;
        }
        Ok(saved)
    }
}

impl Drop for SavedFds<'_> {
    fn drop(&mut self) {
        for (fd, backup) in self.saved.drain(..).rev() {
            match backup {
                Some(b) => {
                    let _ = self.fds.dup_onto(b, fd);
                    let _ = self.fds.close(b);
                }
                None => {
                    let _ = self.fds.close(fd);
                }
            }
        }
    }
}

// ── ビルトイン ───────────────────────────────────────────────────────

fn is_builtin(name: &str) -> bool {
    matches!(name, "exit" | "cd" | "pwd" | "jobs" | "fg" | "bg" | "wait")
}

fn run_builtin(shell: &Arc<ShellInstance>, argv: &[&str], last_status: i32) -> Result<i32> {
    let arg = argv.get(1).copied();
    match argv[0] {
        "exit" => {
            let status = match arg {
                Some(a) => a.parse::<i32>().unwrap_or_else(|_| {
                    eprintln!("rush: exit: {}: numeric argument required", a);
                    2
                }),
                None => last_status,
            };
            shell.exit_shell(status)
        }
        "cd" => {
            let target = match arg {
                Some(dir) => dir.to_string(),
                None => match std::env::var("HOME") {
                    Ok(home) => home,
                    Err(_) => {
                        eprintln!("rush: cd: HOME not set");
                        return Ok(1);
                    }
                },
            };
            shell.fds().chdir(&target)?;
            Ok(0)
        }
        "pwd" => {
            let line = format!("{}\n", shell.cwd());
            shell.fds().write_all(1, line.as_bytes())?;
            Ok(0)
        }
        "jobs" => {
            let mode = match arg {
                Some("-l") => ShowMode::Long,
                Some("-p") => ShowMode::PidsOnly,
                _ => ShowMode::Normal,
            };
            job::show_jobs(shell, mode)?;
            Ok(0)
        }
        "fg" | "bg" => {
            let id = shell.jobs().get_job(arg.unwrap_or("%%"))?;
            job::restart_job(shell, id, argv[0] == "fg")
        }
        "wait" => match arg {
            Some(spec) => {
                let id = shell.jobs().get_job(spec)?;
                job::wait_for_job(shell, id)
            }
            None => {
                let ids = shell.jobs().ids();
                let mut status = 0;
                for id in ids {
                    status = job::wait_for_job(shell, id)?;
                }
                Ok(status)
            }
        },
        other => Err(Error::internal(format!("{}: not a builtin", other))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arena::{ArenaBuilder, ArenaHandle};
    use crate::heap::{Heap, DEFAULT_MIN_CHUNK};

    /// 単純コマンド 1 つの木。
    pub(crate) fn command_arena(argv: &[&str]) -> ArenaHandle {
        let mut b = ArenaBuilder::new(Arc::new(Heap::new(DEFAULT_MIN_CHUNK)));
        let c = b.command(argv, &[]).unwrap();
        b.finish(c).unwrap()
    }

    struct Noop;

    impl Evaluator for Noop {
        fn evaluate(&self, _shell: &Arc<ShellInstance>, _node: NodeRef<'_>) -> i32 {
            0
        }
    }

    pub(crate) fn noop() -> Arc<dyn Evaluator> {
        Arc::new(Noop)
    }

    /// 木を見ずに決まったステータスで終わる評価器。
    pub(crate) struct ExitWith(pub i32);

    impl Evaluator for ExitWith {
        fn evaluate(&self, _shell: &Arc<ShellInstance>, _node: NodeRef<'_>) -> i32 {
            self.0
        }
    }

    #[test]
    fn builtin_names() {
        assert!(is_builtin("cd"));
        assert!(is_builtin("wait"));
        assert!(!is_builtin("ls"));
    }

    #[test]
    fn child_runner_execs_simple_commands_only() {
        let runner = CommandRunner::with_env("/bin", Vec::new());
        let cmd = command_arena(&["ls"]);
        assert!(runner.for_child(&cmd.root()).forked);

        let mut b = ArenaBuilder::new(Arc::new(Heap::new(DEFAULT_MIN_CHUNK)));
        let ls = b.command(&["ls"], &[]).unwrap();
        let sub = b.subshell(ls).unwrap();
        let arena = b.finish(sub).unwrap();
        assert!(!runner.for_child(&arena.root()).forked);

        let resumed = runner.resumed();
        let child = resumed.for_child(&cmd.root());
        assert!(child.forked);
        assert!(!child.resumed);
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use super::command_arena;
        use crate::arena::{ArenaBuilder, ArenaHandle};
        use crate::config::{Config, ForkStrategy};
        use crate::heap::{Heap, DEFAULT_MIN_CHUNK};
        use pretty_assertions::assert_eq;

        /// fd 0〜2 を `/dev/null` にした、指定の fork 戦略のシェル。
        fn shell_with(strategy: ForkStrategy, cwd: &std::path::Path) -> Arc<ShellInstance> {
            let config = Config {
                fork_strategy: strategy,
                ..Config::default()
            };
            let shell = ShellInstance::detached(Arc::new(config));
            let fds = shell.fds();
            fds.open("/dev/null", OpenFlags::READ, 0).unwrap();
            fds.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
            fds.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
            fds.chdir(&cwd.to_string_lossy()).unwrap();
            shell
        }

        fn runner() -> CommandRunner {
            CommandRunner::with_env("/bin:/usr/bin", vec!["LC_ALL=C".to_string()])
        }

        fn out(target: &str) -> Redirect {
            Redirect {
                fd: 1,
                kind: RedirectKind::Output,
                target: target.to_string(),
            }
        }

        /// `a | b > target`
        fn pipeline(a: &[&str], b: &[&str], target: &str) -> ArenaHandle {
            let mut builder = ArenaBuilder::new(Arc::new(Heap::new(DEFAULT_MIN_CHUNK)));
            let first = builder.command(a, &[]).unwrap();
            let second = builder.command(b, &[out(target)]).unwrap();
            let p = builder.pipeline(vec![first, second]).unwrap();
            builder.finish(p).unwrap()
        }

        fn check_pipeline(strategy: ForkStrategy) {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_with(strategy, dir.path());
            let tree = pipeline(&["echo", "hello"], &["tr", "a-z", "A-Z"], "out.txt");
            assert_eq!(runner().evaluate(&shell, tree.root()), 0);
            let got = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
            assert_eq!(got, "HELLO\n");
            assert!(shell.jobs().is_empty(), "finished job is freed");
            assert_eq!(shell.fds().open_fds(), vec![0, 1, 2], "pipe ends closed");
        }

        #[test]
        fn pipeline_through_threads() {
            check_pipeline(ForkStrategy::Thread);
        }

        #[test]
        fn pipeline_through_native_fork() {
            check_pipeline(ForkStrategy::Native);
        }

        #[test]
        fn sequence_status_is_last_command() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_with(ForkStrategy::Thread, dir.path());
            let mut b = ArenaBuilder::new(Arc::new(Heap::new(DEFAULT_MIN_CHUNK)));
            let t = b.command(&["true"], &[]).unwrap();
            let f = b.command(&["sh", "-c", "exit 3"], &[]).unwrap();
            let seq = b.sequence(vec![(t, false), (f, false)]).unwrap();
            let tree = b.finish(seq).unwrap();
            let r = runner();
            assert_eq!(r.evaluate(&shell, tree.root()), 3);
            assert_eq!(r.last_status(), 3);
        }

        #[test]
        fn missing_command_is_127() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_with(ForkStrategy::Thread, dir.path());
            let tree = command_arena(&["rush-definitely-missing"]);
            assert_eq!(runner().evaluate(&shell, tree.root()), 127);
        }

        #[test]
        fn builtin_redirect_is_restored() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("sub")).unwrap();
            let shell = shell_with(ForkStrategy::Thread, dir.path());
            let mut b = ArenaBuilder::new(Arc::new(Heap::new(DEFAULT_MIN_CHUNK)));
            let cd = b.command(&["cd", "sub"], &[]).unwrap();
            let pwd = b.command(&["pwd"], &[out("where")]).unwrap();
            let seq = b.sequence(vec![(cd, false), (pwd, false)]).unwrap();
            let tree = b.finish(seq).unwrap();

            let before = shell.fds().entry(1).unwrap();
            assert_eq!(runner().evaluate(&shell, tree.root()), 0);
            let sub = dir.path().join("sub");
            let got = std::fs::read_to_string(sub.join("where")).unwrap();
            assert_eq!(got.trim_end(), sub.to_string_lossy());
            assert_eq!(shell.fds().entry(1).unwrap().oflags, before.oflags);
            assert_eq!(shell.fds().open_fds(), vec![0, 1, 2]);
        }

        #[test]
        fn background_job_is_waited_by_wait_builtin() {
            let dir = tempfile::tempdir().unwrap();
            let shell = shell_with(ForkStrategy::Thread, dir.path());
            let mut b = ArenaBuilder::new(Arc::new(Heap::new(DEFAULT_MIN_CHUNK)));
            let bg = b.command(&["sh", "-c", "exit 5"], &[]).unwrap();
            let wait = b.command(&["wait"], &[]).unwrap();
            let seq = b.sequence(vec![(bg, true), (wait, false)]).unwrap();
            let tree = b.finish(seq).unwrap();
            assert_eq!(runner().evaluate(&shell, tree.root()), 5);
            assert_ne!(shell.last_bg_pid(), 0);
            assert!(shell.jobs().is_empty());
        }
    }
}
