//! OS の `fork()` による子コンテキスト。
//!
//! 子は親のアドレス空間の写しを持つので、構文木のアリーナも fd テーブルもそのまま使える。
//! ジョブテーブルは fork 直前の写し（[`JobTable::fork_copy`]）。
//! fd テーブルはネイティブハンドルを複製し直さず、OS が複製した同じ番号を引き継ぐ。

use std::sync::Arc;

use tracing::debug;

use crate::config::ForkStrategy;
use crate::context;
use crate::error::{Error, Result};
use crate::job::JobTable;
use crate::native;
use crate::shell::{ContextKind, Pid, ShellInstance};

use super::{ChildTask, ForkBackend};

/// `fork(2)` バックエンド。
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeFork;

impl ForkBackend for NativeFork {
    fn strategy(&self) -> ForkStrategy {
        ForkStrategy::Native
    }

    fn fork(&self, parent: &Arc<ShellInstance>, task: ChildTask) -> Result<Pid> {
        // ジョブテーブルのロックは fork 前に取る。子は他スレッドが握っていたロックに触れない。
        let jobs = parent.jobs().fork_copy();
        match unsafe { native::fork() } {
            Err(e) => Err(Error::Fork(format!("fork: {}", e))),
            Ok(0) => child_main(parent, task, jobs),
            Ok(pid) => {
                debug!(pid, "native fork");
                Ok(pid)
            }
        }
    }
}

/// 子プロセスの入口。戻らない。
fn child_main(parent: &Arc<ShellInstance>, task: ChildTask, jobs: JobTable) -> ! {
    let pid = native::getpid();
    let fds = parent.fds().adopt_inherited();
    let shell = ShellInstance::fork_child(parent, pid, ContextKind::Process, fds, jobs);
    let _bind = context::bind(Arc::clone(&shell));
    let status = task.run(&shell);
    shell.exit_shell(status)
}
