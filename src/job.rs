//! ジョブテーブルとジョブ制御。
//!
//! パイプラインやサブシェルの子プロセス群を 1 つのジョブとしてまとめ、
//! 実行中 / 停止 / 完了 の遷移、`%` 指定によるジョブ検索、
//! 制御端末のプロセスグループの受け渡しを扱う。
//!
//! | 関数 | 役割 |
//! |------|------|
//! | [`dowait`] | 子の状態変化を 1 つ回収してジョブに反映する |
//! | [`wait_for_job`] | ジョブが実行中でなくなるまで待ち、終了ステータスを返す |
//! | [`set_job_control`] | 制御端末を取得 / 返却する |
//! | [`restart_job`] | `fg` / `bg` の本体 |
//! | [`show_jobs`] / [`show_changed_jobs`] | `jobs` と、プロンプト前の完了通知 |
//!
//! `waitpid(-1, ...)` は使わない。同じプロセス内の別コンテキスト（スレッドモード）の
//! 子を横取りしないよう、待つのは常にジョブに登録された PID の集合かプロセスグループ。
//! 集合のどれか 1 つを待つときは、実 PID とスレッドの疑似 PID を交互に短く待つ。

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Errno, Error, Result};
use crate::fd::OpenFlags;
use crate::native::{self, WaitTarget};
use crate::shell::{is_fake_pid, ContextKind, Pid, ShellInstance};
use crate::signal::{self, Disposition, SIGCONT, SIGINT, SIGPIPE, SIGTSTP, SIGTTIN, SIGTTOU};

// ── データ構造 ───────────────────────────────────────────────────────

/// 1 プロセスの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcState {
    Running,
    Exited(i32),
    Signaled { sig: i32, core: bool },
    Stopped(i32),
}

impl ProcState {
    /// `waitpid` の raw status を解釈する。
    #[cfg(unix)]
    pub fn from_raw(raw: i32) -> ProcState {
        if libc::WIFEXITED(raw) {
            ProcState::Exited(libc::WEXITSTATUS(raw))
        } else if libc::WIFSIGNALED(raw) {
            ProcState::Signaled {
                sig: libc::WTERMSIG(raw),
                core: libc::WCOREDUMP(raw),
            }
        } else if libc::WIFSTOPPED(raw) {
            ProcState::Stopped(libc::WSTOPSIG(raw))
        } else {
            ProcState::Running
        }
    }

    /// 終了済み（exit かシグナル）なら `true`。
    pub fn is_done(self) -> bool {
        matches!(self, ProcState::Exited(_) | ProcState::Signaled { .. })
    }

    /// シェルの終了ステータス（`$?`）。シグナルと停止は 128 + n。
    pub fn exit_status(self) -> i32 {
        match self {
            ProcState::Running => 0,
            ProcState::Exited(n) => n,
            ProcState::Signaled { sig, .. } | ProcState::Stopped(sig) => {
                crate::error::exit_status_for_signal(sig)
            }
        }
    }
}

/// ジョブ内の 1 プロセス。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStat {
    pub pid: Pid,
    pub state: ProcState,
    /// 表示用のコマンド文字列。
    pub cmd: String,
}

/// ジョブの集約状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Stopped,
    Done,
}

/// ジョブ。パイプライン 1 本、またはサブシェル 1 つに対応する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: usize,
    procs: Vec<ProcStat>,
    /// `make_job` で宣言されたプロセス数。これだけ揃うまで完了にならない。
    nprocs: usize,
    state: JobState,
    pgid: Pid,
    /// シェルが制御端末を渡したジョブ。
    jobctl: bool,
    foreground: bool,
    /// フォアグラウンドで待っている間に SIGINT で終わったプロセスがある。
    sigint: bool,
    /// 状態が変わったがまだ通知していない。
    changed: bool,
    /// fork で親から写したジョブ。プロセスはこのコンテキストの子ではない。
    inherited: bool,
}

impl Job {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn procs(&self) -> &[ProcStat] {
        &self.procs
    }

    pub fn expected_procs(&self) -> usize {
        self.nprocs
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// 表示用のコマンド文字列（パイプラインは ` | ` で連結）。
    pub fn command(&self) -> String {
        self.procs
            .iter()
            .map(|p| p.cmd.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// ジョブの終了ステータス。最後のプロセスのもの。停止していれば 128 + 停止シグナル。
    pub fn exit_status(&self) -> i32 {
        if self.state == JobState::Stopped {
            if let Some(p) = self
                .procs
                .iter()
                .rev()
                .find(|p| matches!(p.state, ProcState::Stopped(_)))
            {
                return p.state.exit_status();
            }
        }
        self.procs.last().map(|p| p.state.exit_status()).unwrap_or(0)
    }

    fn recompute(&self) -> JobState {
        if self.procs.iter().any(|p| p.state == ProcState::Running) {
            return JobState::Running;
        }
        if self.procs.iter().any(|p| matches!(p.state, ProcState::Stopped(_))) {
            return JobState::Stopped;
        }
        if self.procs.len() < self.nprocs {
            // まだ全員が登録されていない。
            return JobState::Running;
        }
        JobState::Done
    }

    fn status_text(&self) -> String {
        match self.state {
            JobState::Running => "Running".to_string(),
            JobState::Stopped => {
                let sig = self.procs.iter().find_map(|p| match p.state {
                    ProcState::Stopped(s) => Some(s),
                    _ => None,
                });
                format!("Stopped ({})", signal::signal_name(sig.unwrap_or(SIGTSTP)))
            }
            JobState::Done => match self.procs.last().map(|p| p.state) {
                Some(ProcState::Exited(0)) | None => "Done".to_string(),
                Some(ProcState::Exited(n)) => format!("Done({})", n),
                Some(ProcState::Signaled { sig, core }) => {
                    let mut s = signal::signal_description(sig);
                    if core {
                        s.push_str(" (core dumped)");
                    }
                    s
                }
                Some(_) => "Done".to_string(),
            },
        }
    }
}

/// [`JobTable::format_job`] の表示形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowMode {
    /// `[1]+  Running    cmd`
    Normal,
    /// `jobs -l`: PID も表示する。
    Long,
    /// `jobs -p`: プロセスグループ（なければ先頭 PID）のみ。
    PidsOnly,
}

// ── JobTable ─────────────────────────────────────────────────────────

/// ジョブテーブル。[`ShellInstance`] ごとに 1 つ。
///
/// fork の子は [`JobTable::fork_copy`] で親の写しを持つ（疑似 fork では引き継ぎ情報に載る）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTable {
    /// スロット。インデックス + 1 がジョブ番号。
    slots: Vec<Option<Job>>,
    /// 直近に使ったジョブから順に並べたジョブ番号。先頭が `%+`、次が `%-`。
    order: VecDeque<usize>,
    jobctl: bool,
    ttyfd: Option<i32>,
    /// ジョブ制御を有効にする前のプロセスグループ。無効化で戻す。
    initial_pgrp: Pid,
    rootpid: Pid,
}

/// `order` への挿入方法。
#[derive(Clone, Copy, PartialEq, Eq)]
enum CurMode {
    /// 先頭へ。ただし停止中のジョブがあればその後ろ。
    Running,
    /// 先頭へ。
    Stopped,
    Delete,
}

impl JobTable {
    pub fn new(rootpid: Pid) -> Self {
        Self {
            slots: Vec::new(),
            order: VecDeque::new(),
            jobctl: false,
            ttyfd: None,
            initial_pgrp: 0,
            rootpid,
        }
    }

    /// fork の瞬間の写し。ジョブの中身はそのままで、子ではジョブ制御を切り、
    /// すべてのジョブを親のもの（待たない、通知しない）として扱う。
    pub fn fork_copy(&self) -> JobTable {
        let mut copy = self.clone();
        copy.jobctl = false;
        copy.ttyfd = None;
        for job in copy.slots.iter_mut().flatten() {
            job.inherited = true;
        }
        copy
    }

    pub fn job_control(&self) -> bool {
        self.jobctl
    }

    pub fn tty_fd(&self) -> Option<i32> {
        self.ttyfd
    }

    fn slot(&self, id: usize) -> Option<&Job> {
        id.checked_sub(1)
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: usize) -> Option<&mut Job> {
        id.checked_sub(1)
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
    }

    fn require_mut(&mut self, id: usize) -> Result<&mut Job> {
        self.slot_mut(id)
            .ok_or_else(|| Error::NoSuchJob(format!("%{}", id)))
    }

    pub fn job(&self, id: usize) -> Option<&Job> {
        self.slot(id)
    }

    /// 使用中のジョブ番号（昇順）。
    pub fn ids(&self) -> Vec<usize> {
        self.slots.iter().flatten().map(|j| j.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// `%+` のジョブ。
    pub fn current(&self) -> Option<usize> {
        self.order.front().copied()
    }

    /// `%-` のジョブ。
    pub fn previous(&self) -> Option<usize> {
        self.order.get(1).copied()
    }

    fn set_current(&mut self, id: usize, mode: CurMode) {
        self.order.retain(|&j| j != id);
        match mode {
            CurMode::Delete => {}
            CurMode::Stopped => self.order.push_front(id),
            CurMode::Running => {
                let stopped = |t: &JobTable, j: usize| {
                    t.slot(j).is_some_and(|job| job.state == JobState::Stopped)
                };
                let pos = self
                    .order
                    .iter()
                    .take_while(|&&j| stopped(self, j))
                    .count();
                self.order.insert(pos, id);
            }
        }
    }

    /// 新しいジョブを作る。空きスロットがあれば再利用し、なければテーブルを伸ばす。
    pub fn make_job(&mut self, nprocs: usize) -> usize {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = index + 1;
        self.slots[index] = Some(Job {
            id,
            procs: Vec::with_capacity(nprocs),
            nprocs: nprocs.max(1),
            state: JobState::Running,
            pgid: 0,
            jobctl: self.jobctl,
            foreground: false,
            sigint: false,
            changed: false,
            inherited: false,
        });
        self.set_current(id, CurMode::Running);
        debug!(job = id, nprocs, "job created");
        id
    }

    /// ジョブにプロセスを加える。最初のプロセスがプロセスグループのリーダーになる。
    pub fn add_process(&mut self, id: usize, pid: Pid, cmd: impl Into<String>) -> Result<()> {
        let job = self.require_mut(id)?;
        if job.procs.len() >= job.nprocs {
            return Err(Error::internal(format!(
                "job {} already has {} processes",
                id, job.nprocs
            )));
        }
        if job.pgid == 0 {
            job.pgid = pid;
        }
        job.procs.push(ProcStat {
            pid,
            state: ProcState::Running,
            cmd: cmd.into(),
        });
        job.state = JobState::Running;
        Ok(())
    }

    pub fn set_foreground(&mut self, id: usize, foreground: bool) -> Result<()> {
        self.require_mut(id)?.foreground = foreground;
        Ok(())
    }

    /// `pid` の新しい状態を記録し、所属ジョブの集約状態を計算し直す。
    ///
    /// 戻り値は所属ジョブの番号（テーブルにない PID なら `None`）。
    pub fn record_status(&mut self, pid: Pid, state: ProcState) -> Option<usize> {
        let job = self
            .slots
            .iter_mut()
            .flatten()
            .find(|j| j.procs.iter().any(|p| p.pid == pid))?;
        for p in job.procs.iter_mut().filter(|p| p.pid == pid) {
            p.state = state;
        }
        if job.foreground && matches!(state, ProcState::Signaled { sig, .. } if sig == SIGINT) {
            job.sigint = true;
        }
        let id = job.id;
        let new_state = job.recompute();
        if new_state != job.state {
            debug!(job = id, from = ?job.state, to = ?new_state, "job state changed");
            job.state = new_state;
            job.changed = true;
            if new_state == JobState::Stopped {
                self.set_current(id, CurMode::Stopped);
            }
        }
        Some(id)
    }

    /// ジョブのスロットを解放する。
    pub fn free_job(&mut self, id: usize) {
        if let Some(slot) = id.checked_sub(1).and_then(|i| self.slots.get_mut(i)) {
            if slot.take().is_some() {
                debug!(job = id, "job freed");
            }
        }
        self.set_current(id, CurMode::Delete);
    }

    /// 待つべき実行中のプロセスの PID。`id` を指定すればそのジョブのみ。親から写したジョブは除く。
    pub fn running_pids(&self, id: Option<usize>) -> Vec<Pid> {
        self.slots
            .iter()
            .flatten()
            .filter(|j| !j.inherited && id.map_or(true, |id| j.id == id))
            .flat_map(|j| j.procs.iter())
            .filter(|p| p.state == ProcState::Running)
            .map(|p| p.pid)
            .collect()
    }

    /// ジョブ指定を解決する。
    ///
    /// `%%` / `%+` / `%`（現在）、`%-`（直前）、`%N`（番号）、`%?pat`（部分一致）、
    /// `%pat`（前方一致）、`%` なしの数字（PID）を受け付ける。
    pub fn get_job(&self, spec: &str) -> Result<usize> {
        let no_such = || Error::NoSuchJob(spec.to_string());
        let Some(rest) = spec.strip_prefix('%') else {
            if spec.is_empty() {
                return self.current().ok_or_else(no_such);
            }
            let pid: Pid = spec.parse().map_err(|_| no_such())?;
            return self
                .slots
                .iter()
                .flatten()
                .find(|j| j.procs.iter().any(|p| p.pid == pid))
                .map(|j| j.id)
                .ok_or_else(no_such);
        };
        match rest {
            "" | "%" | "+" => self.current().ok_or_else(no_such),
            "-" => self.previous().ok_or_else(no_such),
            digits if digits.bytes().all(|b| b.is_ascii_digit()) => {
                let n: usize = digits.parse().map_err(|_| no_such())?;
                self.slot(n).map(|j| j.id).ok_or_else(no_such)
            }
            pattern => {
                let (substring, pat) = match pattern.strip_prefix('?') {
                    Some(p) => (true, p),
                    None => (false, pattern),
                };
                let mut found = None;
                for job in self.slots.iter().flatten() {
                    let hit = if substring {
                        job.procs.iter().any(|p| p.cmd.contains(pat))
                    } else {
                        job.procs.first().is_some_and(|p| p.cmd.starts_with(pat))
                    };
                    if hit {
                        if found.is_some() {
                            return Err(Error::AmbiguousJob(spec.to_string()));
                        }
                        found = Some(job.id);
                    }
                }
                found.ok_or_else(no_such)
            }
        }
    }

    /// 1 ジョブ分の状態表示。
    pub fn format_job(&self, id: usize, mode: ShowMode) -> Option<String> {
        let job = self.slot(id)?;
        if mode == ShowMode::PidsOnly {
            let pid = if job.pgid != 0 {
                job.pgid
            } else {
                job.procs.first().map(|p| p.pid)?
            };
            return Some(format!("{}\n", pid));
        }
        let marker = if self.current() == Some(id) {
            '+'
        } else if self.previous() == Some(id) {
            '-'
        } else {
            ' '
        };
        let status = job.status_text();
        let mut out = String::new();
        match mode {
            ShowMode::Long => {
                for (i, p) in job.procs.iter().enumerate() {
                    if i == 0 {
                        let _ = write!(out, "[{}]{} {:>5} {:<24}{}", id, marker, p.pid, status, p.cmd);
                    } else {
                        let _ = write!(out, "\n     {:>5}{:<25}| {}", p.pid, "", p.cmd);
                    }
                }
                out.push('\n');
            }
            _ => {
                let _ = writeln!(out, "[{}]{}  {:<24}{}", id, marker, status, job.command());
            }
        }
        Some(out)
    }

    /// 状態変化を通知済みにし、完了していたジョブを解放する。通知すべき行を返す。
    fn take_changed(&mut self, mode: ShowMode) -> Vec<String> {
        let changed: Vec<usize> = self
            .slots
            .iter()
            .flatten()
            .filter(|j| j.changed && !j.foreground && !j.inherited)
            .map(|j| j.id)
            .collect();
        let mut lines = Vec::new();
        for id in changed {
            if let Some(line) = self.format_job(id, mode) {
                lines.push(line);
            }
            let done = match self.slot_mut(id) {
                Some(job) => {
                    job.changed = false;
                    job.state == JobState::Done
                }
                None => false,
            };
            if done {
                self.free_job(id);
            }
        }
        lines
    }
}

// ── 待機 ─────────────────────────────────────────────────────────────

/// [`dowait`] の待ち方。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Block,
    Poll,
}

/// 1 PID の状態変化を回収する。スレッドモードの疑似 PID はスレッド表から。
fn reap_one(pid: Pid, block: bool) -> std::result::Result<Option<(Pid, ProcState)>, Errno> {
    if is_fake_pid(pid) {
        return crate::fork::thread::wait_thread(pid, block).map(|s| s.map(|st| (pid, st)));
    }
    native::wait_pid(WaitTarget::Pid(pid), block)
}

/// 実 PID と疑似 PID が混ざっているとき、片方を待つ 1 回の長さ。
const MIXED_WAIT_SLICE: Duration = Duration::from_millis(10);

/// `pids` のどれか 1 つの状態変化を待って回収する。どれも自分の子でなければ `ECHILD`。
fn reap_any(pids: &[Pid]) -> std::result::Result<Option<(Pid, ProcState)>, Errno> {
    let (mut fake, mut real): (Vec<Pid>, Vec<Pid>) = pids.iter().partition(|&&p| is_fake_pid(p));
    loop {
        let slice = if fake.is_empty() || real.is_empty() {
            None
        } else {
            Some(MIXED_WAIT_SLICE)
        };
        if fake.is_empty() && real.is_empty() {
            return Err(Errno::ECHILD);
        }
        if !fake.is_empty() {
            match crate::fork::thread::wait_any_thread(&fake, slice) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) if e == Errno::ECHILD => fake.clear(),
                Err(e) => return Err(e),
            }
        }
        if !real.is_empty() {
            match native::wait_any(&real, slice) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) if e == Errno::ECHILD => real.clear(),
                Err(e) => return Err(e),
            }
        }
    }
}

/// 子の状態変化を 1 つだけ回収してジョブテーブルに反映する。
///
/// `job` を指定すればそのジョブのプロセスだけを待つ。回収した PID を返す。
/// 回収できるものがない（`Poll` で誰も変化していない、または `ECHILD`）なら `Ok(None)`。
pub fn dowait(shell: &ShellInstance, mode: WaitMode, job: Option<usize>) -> Result<Option<Pid>> {
    let (candidates, group) = {
        let jobs = shell.jobs();
        let group = job
            .and_then(|id| jobs.job(id))
            .filter(|j| j.jobctl && j.pgid > 0 && !is_fake_pid(j.pgid))
            .map(|j| j.pgid);
        (jobs.running_pids(job), group)
    };
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut reaped = None;
    for &pid in &candidates {
        match reap_one(pid, false) {
            Ok(Some(hit)) => {
                reaped = Some(hit);
                break;
            }
            Ok(None) => {}
            Err(e) if e == Errno::ECHILD => {
                warn!(pid, "child already reaped elsewhere");
            }
            Err(e) => return Err(Error::os("wait", e)),
        }
    }

    if reaped.is_none() && mode == WaitMode::Block {
        let result = match group {
            Some(pgid) => native::wait_pid(WaitTarget::Group(pgid), true),
            None => reap_any(&candidates),
        };
        match result {
            Ok(hit) => reaped = hit,
            Err(e) if e == Errno::ECHILD => return Ok(None),
            Err(e) => return Err(Error::os("wait", e)),
        }
    }

    let Some((pid, state)) = reaped else {
        return Ok(None);
    };
    let _intoff = shell.intoff();
    let id = shell.jobs().record_status(pid, state);
    if state.is_done() {
        shell.remove_child(pid);
    }
    debug!(pid, ?state, job = ?id, "child status");
    Ok(Some(pid))
}

/// ジョブが実行中でなくなるまで待ち、終了ステータスを返す。
///
/// ジョブ制御中なら制御端末をシェルに戻す。フォアグラウンドのジョブが SIGINT で
/// 終わっていれば、シェル自身にも割り込みを記録する（端末を渡していた間にシェルが
/// 受け取れなかった SIGINT を補う）。完了したジョブは解放する。
pub fn wait_for_job(shell: &ShellInstance, id: usize) -> Result<i32> {
    loop {
        let state = shell
            .jobs()
            .job(id)
            .map(|j| j.state)
            .ok_or_else(|| Error::NoSuchJob(format!("%{}", id)))?;
        if state != JobState::Running {
            break;
        }
        if dowait(shell, WaitMode::Block, Some(id))?.is_none() {
            break;
        }
    }

    let _intoff = shell.intoff();
    let mut jobs = shell.jobs();
    let job = jobs
        .job(id)
        .cloned()
        .ok_or_else(|| Error::NoSuchJob(format!("%{}", id)))?;
    let status = job.exit_status();

    if job.jobctl {
        if let Some(tty) = jobs.ttyfd {
            shell
                .fds()
                .tcsetpgrp(tty, jobs.rootpid)
                .map_err(|e| Error::JobControl(format!("cannot reclaim terminal: {}", e)))?;
        }
    }
    match job.state {
        JobState::Done => jobs.free_job(id),
        JobState::Stopped => {
            // 停止したフォアグラウンドジョブは以後バックグラウンド扱いで通知する。
            if let Some(j) = jobs.slot_mut(id) {
                j.foreground = false;
            }
        }
        JobState::Running => {}
    }
    drop(jobs);

    if job.sigint {
        shell.intr().record(SIGINT);
    }
    if job.foreground && job.state == JobState::Done {
        if let Some(ProcState::Signaled { sig, core }) = job.procs.last().map(|p| p.state) {
            if sig != SIGINT && sig != SIGPIPE {
                let mut msg = signal::signal_description(sig);
                if core {
                    msg.push_str(" (core dumped)");
                }
                msg.push('\n');
                let _ = shell.fds().write_all(2, msg.as_bytes());
            }
        }
    }
    Ok(status)
}

// ── ジョブ制御 ───────────────────────────────────────────────────────

/// 制御端末を取得（`enable`）または返却する。
///
/// 取得時は端末のフォアグラウンドグループが自分になるまで SIGTTIN で自分を止め、
/// `SIGTSTP` / `SIGTTIN` / `SIGTTOU` を無視し、自分のプロセスグループを作って端末を握る。
/// 失敗はジョブ制御を続けられないので [`Error::JobControl`] になる。
pub fn set_job_control(shell: &ShellInstance, enable: bool) -> Result<()> {
    if shell.jobs().jobctl == enable {
        return Ok(());
    }
    if shell.kind() == ContextKind::Thread {
        return Err(Error::JobControl(
            "not available in a thread-mode context".to_string(),
        ));
    }
    let fds = shell.fds();
    let _intoff = shell.intoff();

    if enable {
        let tty = match fds.open_min("/dev/tty", OpenFlags::RDWR, 0, 10) {
            Ok(fd) => fd,
            Err(_) if fds.isatty(2) => fds.dup_above(2, 10)?,
            Err(e) => {
                return Err(Error::JobControl(format!("can't access tty: {}", e)));
            }
        };
        fds.set_close_on_exec(tty, true)?;
        let pgrp = loop {
            let pgrp = match fds.tcgetpgrp(tty) {
                Ok(p) => p,
                Err(e) => {
                    let _ = fds.close(tty);
                    return Err(Error::JobControl(format!("can't access tty: {}", e)));
                }
            };
            if pgrp == native::getpgrp() {
                break pgrp;
            }
            // 端末を持っていないので、持てるまで自分を止める。
            let _ = native::killpg(0, SIGTTIN);
        };
        for sig in [SIGTSTP, SIGTTIN, SIGTTOU] {
            shell.signals().set(sig, Disposition::Ignore)?;
        }
        let pid = shell.pid();
        native::setpgid(0, pid)
            .and_then(|_| native::tcsetpgrp(fds.native_of(tty).map_err(|_| Errno::EBADF)?, pid))
            .map_err(|e| Error::JobControl(format!("can't take terminal: {}", e)))?;
        let mut jobs = shell.jobs();
        jobs.ttyfd = Some(tty);
        jobs.initial_pgrp = pgrp;
        jobs.rootpid = pid;
        jobs.jobctl = true;
        debug!(tty, pgrp = pid, "job control enabled");
    } else {
        let (tty, pgrp) = {
            let jobs = shell.jobs();
            (jobs.ttyfd, jobs.initial_pgrp)
        };
        if let Some(tty) = tty {
            let restored = fds
                .tcsetpgrp(tty, pgrp)
                .and_then(|_| native::setpgid(0, pgrp).map_err(|e| Error::os("setpgid", e)));
            let _ = fds.close(tty);
            restored.map_err(|e| Error::JobControl(format!("can't release terminal: {}", e)))?;
        }
        for sig in [SIGTSTP, SIGTTIN, SIGTTOU] {
            shell.signals().set(sig, Disposition::Default)?;
        }
        let mut jobs = shell.jobs();
        jobs.ttyfd = None;
        jobs.jobctl = false;
        debug!(pgrp, "job control disabled");
    }
    Ok(())
}

/// 停止中または実行中のジョブを再開する（`fg` / `bg`）。
///
/// フォアグラウンドなら端末を渡してから待ち、その終了ステータスを返す。
/// バックグラウンドなら 0。
pub fn restart_job(shell: &ShellInstance, id: usize, foreground: bool) -> Result<i32> {
    let (pgid, pids, jobctl, tty, stopped) = {
        let _intoff = shell.intoff();
        let mut jobs = shell.jobs();
        let tty = jobs.ttyfd;
        let job = jobs.require_mut(id)?;
        if job.state == JobState::Done {
            return Err(Error::NoSuchJob(format!("%{}", id)));
        }
        if job.inherited {
            return Err(Error::JobControl(format!(
                "%{}: job not created under this shell",
                id
            )));
        }
        let stopped = job.state == JobState::Stopped;
        for p in job.procs.iter_mut() {
            if matches!(p.state, ProcState::Stopped(_)) {
                p.state = ProcState::Running;
            }
        }
        job.state = JobState::Running;
        job.foreground = foreground;
        let info = (
            job.pgid,
            job.procs.iter().map(|p| p.pid).collect::<Vec<_>>(),
            job.jobctl,
            tty,
            stopped,
        );
        jobs.set_current(id, CurMode::Running);
        info
    };

    if foreground && jobctl && !is_fake_pid(pgid) {
        if let Some(tty) = tty {
            shell
                .fds()
                .tcsetpgrp(tty, pgid)
                .map_err(|e| Error::JobControl(format!("can't give terminal: {}", e)))?;
        }
    }
    if stopped {
        let sent = if jobctl && pgid > 0 && !is_fake_pid(pgid) {
            native::killpg(pgid, SIGCONT)
        } else {
            pids.iter()
                .filter(|&&p| !is_fake_pid(p))
                .try_for_each(|&p| native::kill(p, SIGCONT))
        };
        sent.map_err(|e| Error::os("kill SIGCONT", e))?;
    }
    debug!(job = id, foreground, "job restarted");
    if foreground {
        wait_for_job(shell, id)
    } else {
        Ok(0)
    }
}

/// ジョブ一覧を表示する（`jobs`）。先に状態変化を回収する。
pub fn show_jobs(shell: &ShellInstance, mode: ShowMode) -> Result<()> {
    while dowait(shell, WaitMode::Poll, None)?.is_some() {}
    let mut out = String::new();
    {
        let mut jobs = shell.jobs();
        for id in jobs.ids() {
            if let Some(line) = jobs.format_job(id, mode) {
                out.push_str(&line);
            }
            let done = jobs.job(id).is_some_and(|j| j.state == JobState::Done);
            if let Some(j) = jobs.slot_mut(id) {
                j.changed = false;
            }
            if done {
                jobs.free_job(id);
            }
        }
    }
    shell.fds().write_all(1, out.as_bytes())
}

/// バックグラウンドジョブの状態変化を stderr に通知する（プロンプト前に呼ぶ）。
pub fn show_changed_jobs(shell: &ShellInstance) -> Result<()> {
    while dowait(shell, WaitMode::Poll, None)?.is_some() {}
    let lines = {
        let _intoff = shell.intoff();
        shell.jobs().take_changed(ShowMode::Normal)
    };
    for line in lines {
        let _ = shell.fds().write_all(2, line.as_bytes());
    }
    Ok(())
}

/// ジョブの終了ステータス。`None` ならそのジョブはない。
pub fn job_exit_status(shell: &ShellInstance, id: usize) -> Option<i32> {
    shell.jobs().job(id).map(Job::exit_status)
}
