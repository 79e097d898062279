//! `posix_spawn()` の安全な Rust ラッパー。
//!
//! スレッドモードの `exec` は自分のプロセスを置き換えられないため、
//! 対象プログラムを子プロセスとして起動し、その終了を待つ。
//! fd テーブルが用意した配置（[`ExecHandles`]）を `posix_spawn` のファイルアクションで再現する。
//!
//! ## 構成
//!
//! | 型 | 役割 |
//! |-----|------|
//! | [`SpawnAttr`] | `posix_spawnattr_t` の RAII ラッパー（プロセスグループ、シグナル設定） |
//! | [`FileActions`] | `posix_spawn_file_actions_t` の RAII ラッパー（fd 操作） |
//! | [`CStringVec`] | argv/envp 用の NULL 終端ポインタ配列（`execve` からも使う） |
//! | [`spawn`] | 上記を組み合わせて `posix_spawn` を呼ぶ公開関数 |

use std::ffi::CString;

use tracing::debug;

use crate::error::Errno;
use crate::fd::ExecHandles;
use crate::shell::Pid;

// ── SpawnAttr ─────────────────────────────────────────────────────

/// `posix_spawnattr_t` の RAII ラッパー。Drop で自動 destroy。
struct SpawnAttr {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttr {
    fn new() -> Self {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            libc::posix_spawnattr_init(&mut attr);
            Self { inner: attr }
        }
    }

    fn add_flags(&mut self, add: libc::c_int) {
        unsafe {
            let mut flags: libc::c_short = 0;
            libc::posix_spawnattr_getflags(&self.inner, &mut flags);
            flags |= add as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);
        }
    }

    /// 子のプロセスグループを `pgid` にする。`0` なら子自身がリーダー。
    fn set_pgroup(&mut self, pgid: Pid) {
        self.add_flags(libc::POSIX_SPAWN_SETPGROUP);
        unsafe {
            libc::posix_spawnattr_setpgroup(&mut self.inner, pgid);
        }
    }

    /// シェルが無視しているジョブ制御系シグナルを子で既定に戻す。
    fn set_sigdefault(&mut self) {
        self.add_flags(libc::POSIX_SPAWN_SETSIGDEF);
        unsafe {
            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            for sig in [
                libc::SIGINT,
                libc::SIGQUIT,
                libc::SIGTSTP,
                libc::SIGTTOU,
                libc::SIGTTIN,
            ] {
                libc::sigaddset(&mut sigset, sig);
            }
            libc::posix_spawnattr_setsigdefault(&mut self.inner, &sigset);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.inner
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

// ── FileActions ───────────────────────────────────────────────────

/// `posix_spawn_file_actions_t` の RAII ラッパー。Drop で自動 destroy。
struct FileActions {
    inner: libc::posix_spawn_file_actions_t,
}

impl FileActions {
    fn new() -> Self {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            libc::posix_spawn_file_actions_init(&mut actions);
            Self { inner: actions }
        }
    }

    fn add_dup2(&mut self, fd: i32, newfd: i32) {
        unsafe {
            libc::posix_spawn_file_actions_adddup2(&mut self.inner, fd, newfd);
        }
    }

    fn add_close(&mut self, fd: i32) {
        unsafe {
            libc::posix_spawn_file_actions_addclose(&mut self.inner, fd);
        }
    }

    /// 子の作業ディレクトリを `dir` にする。fd 操作より後に積むこと。
    #[cfg(any(target_os = "linux", target_vendor = "apple"))]
    fn add_chdir(&mut self, dir: &CString) -> Result<(), Errno> {
        let ret = unsafe { libc::posix_spawn_file_actions_addchdir_np(&mut self.inner, dir.as_ptr()) };
        if ret != 0 {
            return Err(Errno(ret));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
    fn add_chdir(&mut self, _dir: &CString) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// 子の fd 0..N を `handles` の配置にするアクションを積む。
    ///
    /// `native::install_exec_layout` と同じ 2 段階: まず全ハンドルを配置先と重ならない
    /// 高い番号へ退避し、次に目的の番号へ移す。配置のない 0〜2 番は、
    /// 親で継承可能なまま開いていれば閉じる。
    fn layout(&mut self, handles: &ExecHandles) {
        let n = handles.handles.len();
        let max_native = handles.handles.iter().flatten().copied().max().unwrap_or(-1);
        let floor = (n as i32).max(max_native + 1).max(3);

        for (i, h) in handles.handles.iter().enumerate() {
            if let Some(h) = h {
                self.add_dup2(*h, floor + i as i32);
            }
        }
        for (i, h) in handles.handles.iter().enumerate() {
            if h.is_some() {
                let parked = floor + i as i32;
                self.add_dup2(parked, i as i32);
                self.add_close(parked);
            }
        }
        for target in 0..n.max(3) {
            let assigned = handles.handles.get(target).is_some_and(Option::is_some);
            if !assigned && inherited_by_child(target as i32) {
                self.add_close(target as i32);
            }
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        &self.inner
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.inner);
        }
    }
}

/// 親の `fd` が開いていて close-on-exec でなければ `true`。
///
/// 開いていない fd への close アクションは実装によっては spawn 自体を失敗させる。
fn inherited_by_child(fd: i32) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    flags != -1 && flags & libc::FD_CLOEXEC == 0
}

// ── CStringVec ────────────────────────────────────────────────────

/// argv/envp 用の CString ベクタ。NULL 終端のポインタ配列を構築する。
pub struct CStringVec {
    _strings: Vec<CString>,
    ptrs: Vec<*mut libc::c_char>,
}

impl CStringVec {
    /// 各要素を `CString` に変換し、NULL 終端ポインタ配列を作る。NUL を含む要素は空文字列になる。
    pub fn from_args(args: &[String]) -> Self {
        let strings: Vec<CString> = args
            .iter()
            .map(|s| CString::new(s.as_str()).unwrap_or_default())
            .collect();
        let mut ptrs: Vec<*mut libc::c_char> = strings
            .iter()
            .map(|s| s.as_ptr() as *mut libc::c_char)
            .collect();
        ptrs.push(std::ptr::null_mut()); // NULL 終端
        Self {
            _strings: strings,
            ptrs,
        }
    }

    /// NULL 終端ポインタ配列を返す。
    pub fn as_ptr(&self) -> *const *mut libc::c_char {
        self.ptrs.as_ptr()
    }
}

// ── spawn 関数 ────────────────────────────────────────────────────

/// `posix_spawn` で `path` を起動する。成功時は子 PID を返す。
///
/// - `argv` / `envp`: そのまま子に渡す（PATH 検索はしない）
/// - `handles`: 子の fd 0..N の配置
/// - `cwd`: `Some(dir)` なら子はそこから始まる（シェルの仮想 cwd）
/// - `pgroup`: `Some(pgid)` ならそのプロセスグループに入れる（`Some(0)` で新しいグループ）
pub fn spawn(
    path: &str,
    argv: &[String],
    envp: &[String],
    handles: &ExecHandles,
    cwd: Option<&str>,
    pgroup: Option<Pid>,
) -> Result<Pid, Errno> {
    let c_path = CString::new(path).map_err(|_| Errno::EINVAL)?;
    let c_cwd = cwd
        .map(|d| CString::new(d).map_err(|_| Errno::EINVAL))
        .transpose()?;
    let argv_c = CStringVec::from_args(argv);
    let envp_c = CStringVec::from_args(envp);

    let mut attr = SpawnAttr::new();
    if let Some(pgid) = pgroup {
        attr.set_pgroup(pgid);
    }
    attr.set_sigdefault();

    let mut actions = FileActions::new();
    actions.layout(handles);
    if let Some(dir) = &c_cwd {
        actions.add_chdir(dir)?;
    }

    let mut pid: libc::pid_t = 0;
    let ret = unsafe {
        libc::posix_spawn(
            &mut pid,
            c_path.as_ptr(),
            actions.as_ptr(),
            attr.as_ptr(),
            argv_c.as_ptr(),
            envp_c.as_ptr(),
        )
    };
    if ret != 0 {
        return Err(Errno(ret));
    }
    debug!(pid, path, "spawned");
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ProcState;
    use crate::native::{self, WaitTarget};

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn wait(pid: Pid) -> ProcState {
        native::wait_pid(WaitTarget::Pid(pid), true)
            .unwrap()
            .map(|(_, st)| st)
            .unwrap()
    }

    #[test]
    fn spawn_reports_exit_status() {
        let pid = spawn(
            "/bin/sh",
            &args(&["sh", "-c", "exit 7"]),
            &[],
            &ExecHandles::default(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(wait(pid), ProcState::Exited(7));
    }

    #[test]
    fn missing_program_is_enoent() {
        let err = spawn(
            "/nonexistent/prog",
            &args(&["prog"]),
            &[],
            &ExecHandles::default(),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn layout_places_pipe_on_stdout() {
        let (r, w) = native::pipe().unwrap();
        let handles = ExecHandles {
            handles: vec![None, Some(w)],
            flags: vec![Default::default(); 2],
        };
        let pid = spawn(
            "/bin/sh",
            &args(&["sh", "-c", "echo hello"]),
            &[],
            &handles,
            None,
            None,
        )
        .unwrap();
        native::close(w).unwrap();
        let mut buf = [0u8; 16];
        let n = native::read(r, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
        assert_eq!(wait(pid), ProcState::Exited(0));
        native::close(r).unwrap();
    }

    #[test]
    fn child_starts_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canon = std::fs::canonicalize(dir.path()).unwrap();
        let (r, w) = native::pipe().unwrap();
        let handles = ExecHandles {
            handles: vec![None, Some(w)],
            flags: vec![Default::default(); 2],
        };
        let pid = spawn(
            "/bin/sh",
            &args(&["sh", "-c", "pwd -P"]),
            &[],
            &handles,
            Some(&canon.to_string_lossy()),
            None,
        )
        .unwrap();
        native::close(w).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = native::read(r, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(wait(pid), ProcState::Exited(0));
        native::close(r).unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim_end(), canon.to_string_lossy());
    }

    #[test]
    fn missing_directory_fails_the_spawn() {
        let err = spawn(
            "/bin/sh",
            &args(&["sh", "-c", "exit 0"]),
            &[],
            &ExecHandles::default(),
            Some("/nonexistent/rush-dir"),
            None,
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn argv_with_nul_becomes_empty() {
        let v = CStringVec::from_args(&args(&["ok", "bad\0arg"]));
        let second = unsafe { std::ffi::CStr::from_ptr(*v.as_ptr().add(1)) };
        assert_eq!(second.to_bytes(), b"");
        assert!(unsafe { (*v.as_ptr().add(2)).is_null() });
    }
}
