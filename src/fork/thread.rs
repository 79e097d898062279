//! スレッドによる子コンテキスト。
//!
//! 子は同じプロセス内のスレッドで、疑似 PID（[`FAKE_PID_BASE`](crate::shell::FAKE_PID_BASE) 以上）を持つ。
//! fd テーブルは複製、ジョブテーブルは親の写し、構文木は親とアリーナを共有する。
//!
//! 終了ステータスはプロセス全体のスレッド表に置かれ、[`wait_thread`] が
//! 条件変数で待って回収する。スレッドの join は回収時に行う。

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ForkStrategy;
use crate::context;
use crate::error::{Errno, Error, Result};
use crate::job::{JobTable, ProcState};
use crate::shell::{next_fake_pid, ContextKind, Pid, ShellInstance, ThreadExit};

use super::{ChildTask, ForkBackend};

#[derive(Default)]
struct Slot {
    status: Option<ProcState>,
    handle: Option<JoinHandle<()>>,
}

struct Registry {
    slots: Mutex<HashMap<Pid, Slot>>,
    changed: Condvar,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        slots: Mutex::new(HashMap::new()),
        changed: Condvar::new(),
    })
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, pid: Pid, state: ProcState) {
        if let Some(slot) = self.lock().get_mut(&pid) {
            slot.status = Some(state);
        }
        self.changed.notify_all();
    }
}

/// スレッドバックエンド。
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadFork;

impl ForkBackend for ThreadFork {
    fn strategy(&self) -> ForkStrategy {
        ForkStrategy::Thread
    }

    fn fork(&self, parent: &Arc<ShellInstance>, task: ChildTask) -> Result<Pid> {
        let pid = next_fake_pid();
        let fds = parent.fds().duplicate()?;
        let jobs = parent.jobs().fork_copy();
        let reg = registry();
        reg.lock().insert(pid, Slot::default());

        let parent = Arc::clone(parent);
        let spawned = std::thread::Builder::new()
            .name(format!("rush-{}", pid))
            .spawn(move || {
                let status = run_child(parent, pid, fds, jobs, task);
                registry().publish(pid, ProcState::Exited(status));
            });
        match spawned {
            Ok(handle) => {
                if let Some(slot) = reg.lock().get_mut(&pid) {
                    slot.handle = Some(handle);
                }
                debug!(pid, "thread fork");
                Ok(pid)
            }
            Err(e) => {
                reg.lock().remove(&pid);
                Err(Error::Fork(format!("cannot start thread: {}", e)))
            }
        }
    }
}

/// スレッドの本体。子インスタンスを drop して fd を閉じてから戻る。
fn run_child(
    parent: Arc<ShellInstance>,
    pid: Pid,
    fds: crate::fd::FdTable,
    jobs: JobTable,
    task: ChildTask,
) -> i32 {
    let shell = ShellInstance::fork_child(&parent, pid, ContextKind::Thread, fds, jobs);
    drop(parent);
    let bind = context::bind(Arc::clone(&shell));
    let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(&shell)));
    drop(bind);
    drop(shell);
    match result {
        Ok(status) => status,
        Err(payload) => match payload.downcast_ref::<ThreadExit>() {
            Some(ThreadExit(status)) => *status,
            None => {
                warn!(pid, "thread context panicked");
                2
            }
        },
    }
}

/// 疑似 PID の子の状態を回収する。
///
/// 終了していればスロットを消して join し、状態を返す。`block` が偽で未終了なら `Ok(None)`。
/// 知らない PID（回収済みを含む）は `ECHILD`。
pub fn wait_thread(pid: Pid, block: bool) -> std::result::Result<Option<ProcState>, Errno> {
    let reg = registry();
    let mut slots = reg.lock();
    loop {
        let done = match slots.get(&pid) {
            None => return Err(Errno::ECHILD),
            Some(slot) => slot.status,
        };
        if let Some(state) = done {
            let handle = slots.remove(&pid).and_then(|s| s.handle);
            drop(slots);
            if let Some(h) = handle {
                let _ = h.join();
            }
            return Ok(Some(state));
        }
        if !block {
            return Ok(None);
        }
        slots = reg
            .changed
            .wait(slots)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// `pids` のどれか 1 つの終了を回収する。
///
/// 同じ条件変数で眠るので、どのスレッドの終了でもすぐ起きる。`timeout` が切れたら `Ok(None)`。
/// どの PID も表になければ `ECHILD`。
pub fn wait_any_thread(
    pids: &[Pid],
    timeout: Option<Duration>,
) -> std::result::Result<Option<(Pid, ProcState)>, Errno> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let reg = registry();
    let mut slots = reg.lock();
    loop {
        let mut known = false;
        let mut done = None;
        for &pid in pids {
            if let Some(slot) = slots.get(&pid) {
                known = true;
                if let Some(state) = slot.status {
                    done = Some((pid, state));
                    break;
                }
            }
        }
        if let Some((pid, state)) = done {
            let handle = slots.remove(&pid).and_then(|s| s.handle);
            drop(slots);
            if let Some(h) = handle {
                let _ = h.join();
            }
            return Ok(Some((pid, state)));
        }
        if !known {
            return Err(Errno::ECHILD);
        }
        slots = match deadline {
            None => reg.changed.wait(slots).unwrap_or_else(PoisonError::into_inner),
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(None);
                }
                reg.changed
                    .wait_timeout(slots, left)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|e| e.into_inner().0)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::arena::NodeRef;
    use crate::eval::tests::{command_arena, ExitWith};
    use crate::eval::Evaluator;
    use crate::fork::{fork_with, ForkMode, ForkRequest};
    use crate::job::wait_for_job;
    use crate::shell::is_fake_pid;

    fn shell() -> Arc<ShellInstance> {
        ShellInstance::detached(Arc::new(Config::default()))
    }

    #[test]
    fn thread_child_reports_status_through_job() {
        let shell = shell();
        let id = shell.jobs().make_job(1);
        let req = ForkRequest::new(
            command_arena(&["exit", "3"]),
            ForkMode::Foreground,
            Arc::new(ExitWith(3)),
        )
        .in_job(id);
        let child = fork_with(&shell, &ThreadFork, req).unwrap();
        assert!(is_fake_pid(child.pid));
        assert_eq!(wait_for_job(&shell, id).unwrap(), 3);
        assert_eq!(wait_thread(child.pid, false), Err(Errno::ECHILD));
    }

    struct ExitShell;

    impl Evaluator for ExitShell {
        fn evaluate(&self, shell: &Arc<ShellInstance>, _node: NodeRef<'_>) -> i32 {
            shell.exit_shell(9)
        }
    }

    #[test]
    fn exit_shell_unwinds_to_thread_entry() {
        let shell = shell();
        let req = ForkRequest::new(command_arena(&["exit"]), ForkMode::NoJob, Arc::new(ExitShell));
        let child = fork_with(&shell, &ThreadFork, req).unwrap();
        assert_eq!(wait_thread(child.pid, true), Ok(Some(ProcState::Exited(9))));
    }

    struct Snapshot(std::sync::mpsc::Sender<(bool, String, JobTable)>);

    impl Evaluator for Snapshot {
        fn evaluate(&self, shell: &Arc<ShellInstance>, node: NodeRef<'_>) -> i32 {
            let bound = context::with_current(|c| Arc::ptr_eq(c, shell)).unwrap_or(false);
            let _ = self.0.send((bound, node.command_text(), shell.jobs().clone()));
            0
        }
    }

    #[test]
    fn child_is_bound_with_parent_jobs_and_shared_tree() {
        let shell = shell();
        {
            let mut jobs = shell.jobs();
            let id = jobs.make_job(1);
            jobs.add_process(id, 100, "sleep 100").unwrap();
        }
        let arena = command_arena(&["echo", "hi"]);
        let (tx, rx) = std::sync::mpsc::channel();
        let req = ForkRequest::new(arena.retain(), ForkMode::NoJob, Arc::new(Snapshot(tx)));
        let child = fork_with(&shell, &ThreadFork, req).unwrap();
        let (bound, text, jobs) = rx.recv().unwrap();
        assert!(bound);
        assert_eq!(text, "echo hi");
        assert_eq!(jobs, shell.jobs().fork_copy());
        assert_eq!(jobs.job(1).unwrap().procs()[0].pid, 100);
        assert_eq!(wait_thread(child.pid, true), Ok(Some(ProcState::Exited(0))));
        assert_eq!(arena.refcount(), 1, "child released its reference");
    }

    struct Blocked(Mutex<std::sync::mpsc::Receiver<()>>);

    impl Evaluator for Blocked {
        fn evaluate(&self, _shell: &Arc<ShellInstance>, _node: NodeRef<'_>) -> i32 {
            let _ = self.0.lock().unwrap().recv();
            0
        }
    }

    #[test]
    fn any_wait_returns_whichever_exits_first() {
        let shell = shell();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let slow = fork_with(
            &shell,
            &ThreadFork,
            ForkRequest::new(
                command_arena(&["sleep"]),
                ForkMode::NoJob,
                Arc::new(Blocked(Mutex::new(rx))),
            ),
        )
        .unwrap();
        let fast = fork_with(
            &shell,
            &ThreadFork,
            ForkRequest::new(command_arena(&["exit", "4"]), ForkMode::NoJob, Arc::new(ExitWith(4))),
        )
        .unwrap();

        let pids = [slow.pid, fast.pid];
        assert_eq!(
            wait_any_thread(&pids, None),
            Ok(Some((fast.pid, ProcState::Exited(4))))
        );
        assert_eq!(
            wait_any_thread(&pids, Some(Duration::from_millis(20))),
            Ok(None)
        );
        tx.send(()).unwrap();
        assert_eq!(
            wait_any_thread(&pids, None),
            Ok(Some((slow.pid, ProcState::Exited(0))))
        );
        assert_eq!(wait_any_thread(&pids, None), Err(Errno::ECHILD));
    }

    #[test]
    fn poll_before_exit_returns_none() {
        let shell = shell();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        struct WaitFor(Mutex<std::sync::mpsc::Receiver<()>>);
        impl Evaluator for WaitFor {
            fn evaluate(&self, _shell: &Arc<ShellInstance>, _node: NodeRef<'_>) -> i32 {
                let _ = self.0.lock().unwrap().recv();
                0
            }
        }
        let req = ForkRequest::new(
            command_arena(&["sleep"]),
            ForkMode::NoJob,
            Arc::new(WaitFor(Mutex::new(rx))),
        );
        let child = fork_with(&shell, &ThreadFork, req).unwrap();
        assert_eq!(wait_thread(child.pid, false), Ok(None));
        tx.send(()).unwrap();
        assert_eq!(wait_thread(child.pid, true), Ok(Some(ProcState::Exited(0))));
    }
}
