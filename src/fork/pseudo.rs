//! 疑似 fork（`fork()` のないプラットフォーム用）。
//!
//! 現在の実行ファイルを停止状態で起動し、親のヒープのチャンクを子の同じアドレスへ
//! 書き込んでから再開する。子は [`RESUME_FLAG`] 付きで起動され、[`resume_child`] で
//! 引き継ぎ情報を読んで評価を始める。
//!
//! ## 引き継ぎ
//!
//! 引き継ぎ情報（[`ForkHandoff`]）は JSON にしてヒープのブロックに置き、
//! ヒープと一緒に子へ写す。fd テーブル、ジョブテーブル、評価する木はここから組み立て直す。子に渡す引数はそのブロックのアドレスと長さだけ。
//! 引き継ぎ情報はヒープの配置自体を含むので、ブロックを確保したあとの配置を記録し、
//! 書き込み時（ヒープをロックした状態）に配置が変わっていないことを確かめる。
//! 変わっていれば子を捨ててやり直す。
//!
//! 子の同じアドレスが使えなければ別の場所へは移さず、[`Error::AddressUnavailable`] で失敗する。

use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::arena::{ArenaHandle, OwnedNode};
use crate::config::{Config, ForkStrategy};
use crate::context;
use crate::error::{Errno, Error, Result};
use crate::eval::Evaluator;
use crate::fd::{ExecHandles, FdEntry, FdTable};
use crate::heap::{ChunkLayout, Heap};
use crate::job::JobTable;
use crate::native;
use crate::shell::{Pid, ShellInstance};

use super::{ChildSetup, ChildTask, ForkBackend};

/// 子プロセスの起動引数の先頭。
pub const RESUME_FLAG: &str = "--fork-resume";

/// 配置の確認に失敗したときの試行回数の上限。
const MAX_ATTEMPTS: usize = 5;

/// 引き継ぎブロックの余裕分。確保で配置が伸びても収まるようにする。
const STAGE_SLACK: usize = 1024;

// ── 子プロセスの抽象 ─────────────────────────────────────────────────

/// 停止状態で作った子プロセス。
pub trait SuspendedChild {
    fn pid(&self) -> Pid;

    /// 子のアドレス空間の `addr` にちょうど `size` バイトを確保する。
    fn reserve_at(&mut self, addr: usize, size: usize) -> std::result::Result<(), Errno>;

    fn write(&mut self, addr: usize, bytes: &[u8]) -> std::result::Result<(), Errno>;

    /// 主スレッドを再開する。`pgid` は子を入れるプロセスグループ。
    fn resume(self, pgid: Option<Pid>) -> std::result::Result<Pid, Errno>;

    fn terminate(&mut self);
}

/// 子プロセスを停止状態で起動する方法。
pub trait ChildLauncher {
    type Child: SuspendedChild;

    /// `args` は実行ファイル名を除いた引数。`handles` は子の fd 0..N。
    fn launch(&self, args: &[String], handles: &ExecHandles)
        -> std::result::Result<Self::Child, Errno>;
}

/// 自分自身の実行ファイルを起動するランチャー。
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[cfg(windows)]
impl ChildLauncher for ProcessLauncher {
    type Child = native::SuspendedProcess;

    fn launch(
        &self,
        args: &[String],
        handles: &ExecHandles,
    ) -> std::result::Result<Self::Child, Errno> {
        native::SuspendedProcess::launch(args, handles)
    }
}

#[cfg(windows)]
impl SuspendedChild for native::SuspendedProcess {
    fn pid(&self) -> Pid {
        native::SuspendedProcess::pid(self)
    }

    fn reserve_at(&mut self, addr: usize, size: usize) -> std::result::Result<(), Errno> {
        native::SuspendedProcess::reserve_at(self, addr, size)
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) -> std::result::Result<(), Errno> {
        native::SuspendedProcess::write(self, addr, bytes)
    }

    fn resume(self, pgid: Option<Pid>) -> std::result::Result<Pid, Errno> {
        native::SuspendedProcess::resume(self, pgid)
    }

    fn terminate(&mut self) {
        native::SuspendedProcess::terminate(self)
    }
}

// ── 引き継ぎ情報 ─────────────────────────────────────────────────────

/// 親から子へ渡す状態。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkHandoff {
    pub parent_pid: Pid,
    pub config: Config,
    pub cwd: String,
    /// 親の fd テーブル。ネイティブハンドルは継承で同じ値のまま子に届く。
    pub fds: Vec<FdEntry>,
    /// fork の瞬間の親のジョブテーブル（[`JobTable::fork_copy`]）。
    pub jobs: JobTable,
    pub setup: ChildSetup,
    pub node: OwnedNode,
    /// 写したヒープの配置。引き継ぎブロック自身も含む。
    pub heap: Vec<ChunkLayout>,
}

/// ヒープに置いた引き継ぎブロック。
struct Staged {
    ptr: NonNull<u8>,
    len: usize,
    layout: Vec<ChunkLayout>,
}

fn resume_args(addr: usize, len: usize) -> Vec<String> {
    vec![
        RESUME_FLAG.to_string(),
        format!("{:#x}", addr),
        len.to_string(),
    ]
}

/// `[RESUME_FLAG, addr, len]` を解釈する。疑似 fork の子でなければ `None`。
pub fn parse_resume_args(args: &[String]) -> Option<(usize, usize)> {
    match args {
        [flag, addr, len] if flag == RESUME_FLAG => {
            let addr = usize::from_str_radix(addr.strip_prefix("0x")?, 16).ok()?;
            let len = len.parse().ok()?;
            (addr != 0).then_some((addr, len))
        }
        _ => None,
    }
}

// ── 親側 ─────────────────────────────────────────────────────────────

/// 疑似 fork バックエンド。
pub struct PseudoFork<L> {
    launcher: L,
    heap: Arc<Heap>,
}

impl<L: ChildLauncher> PseudoFork<L> {
    /// プロセス全体のヒープを写す。
    pub fn new(launcher: L) -> Self {
        Self::with_heap(launcher, Heap::global())
    }

    pub fn with_heap(launcher: L, heap: Arc<Heap>) -> Self {
        Self { launcher, heap }
    }

    /// 引き継ぎ情報を JSON にしてヒープに置く。
    fn stage(&self, handoff: &mut ForkHandoff) -> Result<Staged> {
        let mut capacity = encode(handoff)?.len() + STAGE_SLACK;
        loop {
            let ptr = self.heap.alloc(capacity)?;
            handoff.heap = self.heap.layout();
            let json = match encode(handoff) {
                Ok(j) => j,
                Err(e) => {
                    let _ = self.heap.free(ptr);
                    return Err(e);
                }
            };
            if json.len() <= capacity {
                unsafe { std::ptr::copy_nonoverlapping(json.as_ptr(), ptr.as_ptr(), json.len()) };
                return Ok(Staged {
                    ptr,
                    len: json.len(),
                    layout: handoff.heap.clone(),
                });
            }
            self.heap.free(ptr)?;
            capacity = json.len() + STAGE_SLACK;
        }
    }

    /// 子を起動してヒープを写し、再開する。配置が変わっていたら `Ok(None)`。
    fn launch_with(
        &self,
        staged: &Staged,
        handles: &ExecHandles,
        pgrp: Option<Pid>,
    ) -> Result<Option<Pid>> {
        let args = resume_args(staged.ptr.as_ptr() as usize, staged.len);
        let mut child = self
            .launcher
            .launch(&args, handles)
            .map_err(|e| Error::Fork(format!("cannot start child: {}", e)))?;
        let copied = self
            .heap
            .with_chunks(|chunks| copy_chunks(&mut child, &staged.layout, chunks));
        match copied {
            Ok(true) => {}
            Ok(false) => {
                child.terminate();
                return Ok(None);
            }
            Err(e) => {
                child.terminate();
                return Err(e);
            }
        }
        let pid = child.pid();
        let group = pgrp.map(|g| if g == 0 { pid } else { g });
        child
            .resume(group)
            .map(Some)
            .map_err(|e| Error::Fork(format!("cannot resume child: {}", e)))
    }

    fn spawn_copy(
        &self,
        parent: &Arc<ShellInstance>,
        task: &ChildTask,
        handles: &ExecHandles,
    ) -> Result<Pid> {
        let mut handoff = ForkHandoff {
            parent_pid: parent.pid(),
            config: Config::clone(parent.config()),
            cwd: parent.cwd(),
            fds: parent.fds().entries(),
            jobs: parent.jobs().fork_copy(),
            setup: task.setup.clone(),
            node: task.node.to_owned_node(),
            heap: Vec::new(),
        };
        for attempt in 1..=MAX_ATTEMPTS {
            let staged = self.stage(&mut handoff)?;
            let outcome = self.launch_with(&staged, handles, task.setup.pgrp);
            if let Err(e) = self.heap.free(staged.ptr) {
                warn!(error = %e, "cannot free fork handoff block");
            }
            match outcome? {
                Some(pid) => {
                    debug!(pid, attempt, bytes = staged.len, "pseudo fork");
                    return Ok(pid);
                }
                None => debug!(attempt, "heap changed while staging, retrying"),
            }
        }
        Err(Error::Fork(
            "heap layout kept changing during pseudo-fork".to_string(),
        ))
    }
}

impl<L: ChildLauncher> ForkBackend for PseudoFork<L> {
    fn strategy(&self) -> ForkStrategy {
        ForkStrategy::Pseudo
    }

    fn fork(&self, parent: &Arc<ShellInstance>, task: ChildTask) -> Result<Pid> {
        let handles = parent.fds().prepare_for_fork()?;
        let result = self.spawn_copy(parent, &task, &handles);
        parent.fds().restore_inheritance();
        result
    }
}

fn encode(handoff: &ForkHandoff) -> Result<Vec<u8>> {
    serde_json::to_vec(handoff).map_err(|e| Error::internal(format!("fork handoff: {}", e)))
}

/// ヒープのロック中に呼ばれる。配置が `expected` と違えば何も書かずに `Ok(false)`。
fn copy_chunks<C: SuspendedChild>(
    child: &mut C,
    expected: &[ChunkLayout],
    chunks: &[(ChunkLayout, &[u8])],
) -> Result<bool> {
    let unchanged = chunks.len() == expected.len()
        && chunks.iter().zip(expected).all(|((have, _), want)| have == want);
    if !unchanged {
        return Ok(false);
    }
    for (layout, bytes) in chunks {
        child.reserve_at(layout.addr, layout.size).map_err(|e| {
            debug!(addr = layout.addr, size = layout.size, errno = %e, "child address unavailable");
            Error::AddressUnavailable {
                addr: layout.addr,
                size: layout.size,
            }
        })?;
        child
            .write(layout.addr, bytes)
            .map_err(|e| Error::os("write child memory", e))?;
    }
    Ok(true)
}

// ── 子側 ─────────────────────────────────────────────────────────────

/// 疑似 fork の子として状態を組み立て、引き継いだ木を評価する。戻り値は終了ステータス。
///
/// # Safety
///
/// 親が [`PseudoFork`] でこのプロセスに書き込んだ直後で、`addr` から `len` バイトが
/// 引き継ぎブロックであること。プロセス全体のヒープはまだ何も持っていないこと。
pub unsafe fn resume_child(addr: usize, len: usize, evaluator: Arc<dyn Evaluator>) -> Result<i32> {
    let raw = std::slice::from_raw_parts(addr as *const u8, len);
    let handoff: ForkHandoff = serde_json::from_slice(raw)
        .map_err(|e| Error::internal(format!("fork handoff: {}", e)))?;

    let heap = Heap::global();
    heap.adopt_mapped(&handoff.heap)?;
    if let Some(block) = NonNull::new(addr as *mut u8) {
        heap.free(block)?;
    }
    start_child(heap, native::getpid(), handoff, evaluator)
}

/// 引き継ぎ情報からインスタンスを組み立てて評価する。`heap` は木を置き直す先。
fn start_child(
    heap: Arc<Heap>,
    pid: Pid,
    handoff: ForkHandoff,
    evaluator: Arc<dyn Evaluator>,
) -> Result<i32> {
    let fds = FdTable::from_entries(handoff.config.max_fds, handoff.cwd, &handoff.fds)?;
    let shell = ShellInstance::resumed(
        pid,
        handoff.parent_pid,
        Arc::new(handoff.config),
        fds,
        handoff.jobs,
    );
    let _bind = context::bind(Arc::clone(&shell));
    let node = ArenaHandle::from_owned(heap, &handoff.node)?;
    debug!(pid, parent = handoff.parent_pid, "pseudo fork child resumed");
    let task = ChildTask {
        node,
        evaluator,
        setup: handoff.setup,
    };
    Ok(task.run(&shell))
}

/// 起動引数が疑似 fork の再開なら子として評価し、その終了ステータスを返す。
///
/// # Safety
///
/// [`resume_child`] と同じ。`args` は親の [`PseudoFork`] が付けたものであること。
pub unsafe fn resume_from_args(args: &[String], evaluator: Arc<dyn Evaluator>) -> Option<Result<i32>> {
    let (addr, len) = parse_resume_args(args)?;
    Some(resume_child(addr, len, evaluator))
}
