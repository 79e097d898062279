//! Unix 実装（`libc` 直呼び出し）。

use std::ffi::CString;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::error::Errno;
use crate::fd::{ExecHandles, OpenFlags};
use crate::job::ProcState;
use crate::shell::Pid;

use super::WaitTarget;

/// ネイティブハンドル（Unix ではファイルディスクリプタ番号）。
pub type RawHandle = libc::c_int;

/// 空きスロットを表す無効ハンドル。
pub const INVALID_HANDLE: RawHandle = -1;

/// 複製したネイティブ fd はこの番号以上に置く。シェルから見える低い番号と重なりにくくするため。
const NATIVE_FD_FLOOR: libc::c_int = 10;

fn cstring(s: &str) -> Result<CString, Errno> {
    CString::new(s).map_err(|_| Errno::EINVAL)
}

fn check(ret: libc::c_int) -> Result<libc::c_int, Errno> {
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn posix_open_flags(flags: OpenFlags) -> libc::c_int {
    let mut f = match (flags.contains(OpenFlags::READ), flags.contains(OpenFlags::WRITE)) {
        (true, true) => libc::O_RDWR,
        (false, true) => libc::O_WRONLY,
        _ => libc::O_RDONLY,
    };
    if flags.contains(OpenFlags::CREATE) {
        f |= libc::O_CREAT;
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        f |= libc::O_TRUNC;
    }
    if flags.contains(OpenFlags::APPEND) {
        f |= libc::O_APPEND;
    }
    if flags.contains(OpenFlags::EXCLUSIVE) {
        f |= libc::O_EXCL;
    }
    if flags.contains(OpenFlags::NOCTTY) {
        f |= libc::O_NOCTTY;
    }
    if flags.contains(OpenFlags::DIRECTORY) {
        f |= libc::O_DIRECTORY;
    }
    f
}

// ── ハンドル操作 ─────────────────────────────────────────────────────

/// ファイルを開く。ネイティブレベルでは常に close-on-exec。
pub fn open(path: &str, flags: OpenFlags, mode: u32) -> Result<RawHandle, Errno> {
    let c_path = cstring(path)?;
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            posix_open_flags(flags) | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    };
    check(fd)
}

pub fn close(h: RawHandle) -> Result<(), Errno> {
    check(unsafe { libc::close(h) }).map(|_| ())
}

/// ハンドルを複製する。複製は close-on-exec。
pub fn dup(h: RawHandle) -> Result<RawHandle, Errno> {
    check(unsafe { libc::fcntl(h, libc::F_DUPFD_CLOEXEC, NATIVE_FD_FLOOR) })
}

pub fn read(h: RawHandle, buf: &mut [u8]) -> Result<usize, Errno> {
    loop {
        let n = unsafe { libc::read(h, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let e = Errno::last();
        if e != Errno::EINTR {
            return Err(e);
        }
    }
}

pub fn write(h: RawHandle, buf: &[u8]) -> Result<usize, Errno> {
    loop {
        let n = unsafe { libc::write(h, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let e = Errno::last();
        if e != Errno::EINTR {
            return Err(e);
        }
    }
}

/// `whence` は `SEEK_SET` / `SEEK_CUR` / `SEEK_END`（0 / 1 / 2）。
pub fn lseek(h: RawHandle, offset: i64, whence: i32) -> Result<i64, Errno> {
    let off = unsafe { libc::lseek(h, offset as libc::off_t, whence) };
    if off == -1 {
        Err(Errno::last())
    } else {
        Ok(off as i64)
    }
}

pub fn isatty(h: RawHandle) -> bool {
    unsafe { libc::isatty(h) == 1 }
}

/// パイプを作る。両端とも close-on-exec。
pub fn pipe() -> Result<(RawHandle, RawHandle), Errno> {
    let mut fds = [-1 as libc::c_int; 2];
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        for &fd in &fds {
            set_inheritable(fd, false)?;
        }
    }
    Ok((fds[0], fds[1]))
}

pub fn is_valid(h: RawHandle) -> bool {
    h >= 0 && unsafe { libc::fcntl(h, libc::F_GETFD) } != -1
}

/// 継承可否（`FD_CLOEXEC` の逆）を切り替える。
pub fn set_inheritable(h: RawHandle, inheritable: bool) -> Result<(), Errno> {
    let flags = check(unsafe { libc::fcntl(h, libc::F_GETFD) })?;
    let new = if inheritable {
        flags & !libc::FD_CLOEXEC
    } else {
        flags | libc::FD_CLOEXEC
    };
    if new != flags {
        check(unsafe { libc::fcntl(h, libc::F_SETFD, new) })?;
    }
    Ok(())
}

/// `access(2)`。`mode` は `R_OK` / `W_OK` / `X_OK` の組み合わせ。
pub fn access(path: &str, mode: i32) -> Result<(), Errno> {
    let c_path = cstring(path)?;
    check(unsafe { libc::access(c_path.as_ptr(), mode) }).map(|_| ())
}

/// `ioctl(2)` をそのまま呼ぶ。
///
/// # Safety
///
/// `arg` は `request` が要求する型・サイズの領域を指していなければならない。
pub unsafe fn ioctl(h: RawHandle, request: libc::c_ulong, arg: *mut libc::c_void) -> Result<i32, Errno> {
    check(libc::ioctl(h, request as _, arg))
}

// ── 端末とプロセスグループ ───────────────────────────────────────────

pub fn tcgetpgrp(h: RawHandle) -> Result<Pid, Errno> {
    check(unsafe { libc::tcgetpgrp(h) })
}

pub fn tcsetpgrp(h: RawHandle, pgid: Pid) -> Result<(), Errno> {
    check(unsafe { libc::tcsetpgrp(h, pgid) }).map(|_| ())
}

pub fn setpgid(pid: Pid, pgid: Pid) -> Result<(), Errno> {
    check(unsafe { libc::setpgid(pid, pgid) }).map(|_| ())
}

pub fn getpgrp() -> Pid {
    unsafe { libc::getpgrp() }
}

pub fn getpid() -> Pid {
    unsafe { libc::getpid() }
}

pub fn kill(pid: Pid, signo: i32) -> Result<(), Errno> {
    check(unsafe { libc::kill(pid, signo) }).map(|_| ())
}

pub fn killpg(pgid: Pid, signo: i32) -> Result<(), Errno> {
    check(unsafe { libc::killpg(pgid, signo) }).map(|_| ())
}

// ── プロセス生成と待機 ───────────────────────────────────────────────

/// `fork(2)`。子では 0、親では子の PID を返す。
///
/// # Safety
///
/// マルチスレッドのプロセスで呼ぶと、子は fork したスレッドだけを持つ。
/// 子ではロックを保持していたかもしれない他スレッドが存在しないため、
/// 評価か `execve` に速やかに進むこと。
pub unsafe fn fork() -> Result<Pid, Errno> {
    check(libc::fork())
}

/// 1 プロセス分の状態変化を回収する。`block` が偽なら `WNOHANG`。
///
/// 回収できるものがなければ `Ok(None)`。子がいなければ `Err(ECHILD)`。
pub fn wait_pid(target: WaitTarget, block: bool) -> Result<Option<(Pid, ProcState)>, Errno> {
    let pid = match target {
        WaitTarget::Pid(p) => p,
        WaitTarget::Group(g) => -g,
    };
    let flags = if block {
        libc::WUNTRACED
    } else {
        libc::WNOHANG | libc::WUNTRACED
    };
    loop {
        let mut raw: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut raw, flags) };
        match ret {
            0 => return Ok(None),
            -1 => {
                let e = Errno::last();
                if e == Errno::EINTR && block {
                    continue;
                }
                return Err(e);
            }
            reaped => return Ok(Some((reaped, ProcState::from_raw(raw)))),
        }
    }
}

/// 停止は pidfd に現れないので、この間隔で見直す。
const STOP_RECHECK: Duration = Duration::from_millis(20);

/// `pids` のどれか 1 つの状態変化を回収する。`waitpid(-1)` は使わない。
///
/// 終了は pidfd（Linux）で即座に気づき、停止は [`STOP_RECHECK`] ごとの見直しで拾う。
/// `timeout` が切れたら `Ok(None)`。どの PID も自分の子でなければ `ECHILD`。
pub fn wait_any(pids: &[Pid], timeout: Option<Duration>) -> Result<Option<(Pid, ProcState)>, Errno> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut lost = 0;
        for &pid in pids {
            match wait_pid(WaitTarget::Pid(pid), false) {
                Ok(Some(hit)) => return Ok(Some(hit)),
                Ok(None) => {}
                Err(e) if e == Errno::ECHILD => lost += 1,
                Err(e) => return Err(e),
            }
        }
        if lost == pids.len() {
            return Err(Errno::ECHILD);
        }
        let slice = match deadline {
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(None);
                }
                left.min(STOP_RECHECK)
            }
            None => STOP_RECHECK,
        };
        sleep_until_exit(pids, slice);
    }
}

/// どれかが終了するか `slice` が過ぎるまで眠る。
#[cfg(target_os = "linux")]
fn sleep_until_exit(pids: &[Pid], slice: Duration) {
    let mut polls: Vec<libc::pollfd> = pids
        .iter()
        .filter_map(|&pid| {
            let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) } as libc::c_int;
            (fd >= 0).then_some(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
        })
        .collect();
    if polls.is_empty() {
        // pidfd が使えないカーネル。
        std::thread::sleep(slice);
        return;
    }
    let ms = slice.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
    unsafe { libc::poll(polls.as_mut_ptr(), polls.len() as libc::nfds_t, ms) };
    for p in &polls {
        unsafe { libc::close(p.fd) };
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_until_exit(_pids: &[Pid], slice: Duration) {
    std::thread::sleep(slice);
}

/// 現在のプロセスの fd 0..N を `handles` の配置にする（`execve` 直前に呼ぶ）。
///
/// 2 段階で行う: まず全ハンドルを十分高い番号へ退避し、次に目的の番号へ `dup2` する。
/// 退避しないと、ある目的番号がまだ配置していない別のハンドルと衝突しうる。
/// 配置のない 0〜2 番は閉じる。
pub fn install_exec_layout(handles: &ExecHandles) -> Result<(), Errno> {
    let n = handles.handles.len();
    let max_native = handles
        .handles
        .iter()
        .flatten()
        .copied()
        .max()
        .unwrap_or(-1);
    let floor = (n as libc::c_int).max(max_native + 1).max(3);

    let mut parked: Vec<Option<libc::c_int>> = Vec::with_capacity(n);
    for h in &handles.handles {
        match h {
            Some(h) => parked.push(Some(check(unsafe {
                libc::fcntl(*h, libc::F_DUPFD_CLOEXEC, floor)
            })?)),
            None => parked.push(None),
        }
    }

    for (target, tmp) in parked.iter().enumerate() {
        let target = target as libc::c_int;
        match tmp {
            Some(tmp) => {
                // dup2 した先は FD_CLOEXEC が落ちる。
                check(unsafe { libc::dup2(*tmp, target) })?;
                unsafe { libc::close(*tmp) };
            }
            None => unsafe {
                libc::close(target);
            },
        }
    }
    for target in n..3 {
        unsafe { libc::close(target as libc::c_int) };
    }
    Ok(())
}

/// `execve(2)`。成功すれば戻らない。戻った場合は失敗理由の errno を返す。
pub fn execve(path: &str, argv: &[String], envp: &[String]) -> Errno {
    let c_path = match cstring(path) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let argv = crate::spawn::CStringVec::from_args(argv);
    let envp = crate::spawn::CStringVec::from_args(envp);
    unsafe {
        libc::execve(
            c_path.as_ptr(),
            argv.as_ptr() as *const *const libc::c_char,
            envp.as_ptr() as *const *const libc::c_char,
        );
    }
    Errno::last()
}

/// 外部プログラムを子プロセスとして起動する（スレッドモードの exec 用）。
pub fn spawn_program(
    path: &str,
    argv: &[String],
    envp: &[String],
    handles: &ExecHandles,
    cwd: &str,
) -> Result<Pid, Errno> {
    crate::spawn::spawn(path, argv, envp, handles, Some(cwd), None)
}

/// 現在のプロセスを即座に終了する。atexit やバッファのフラッシュは行わない。
pub fn exit_process(status: i32) -> ! {
    unsafe { libc::_exit(status) }
}

// ── メモリ領域 ───────────────────────────────────────────────────────

pub fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

/// 匿名の読み書き可能領域を確保する。
pub fn map_region(size: usize) -> Result<NonNull<u8>, Errno> {
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    NonNull::new(p as *mut u8).ok_or(Errno::ENOMEM)
}

/// `addr` ちょうどに領域を確保する。その範囲が使用中なら `EEXIST`（再配置はしない）。
pub fn map_region_at(addr: usize, size: usize) -> Result<NonNull<u8>, Errno> {
    #[cfg(target_os = "linux")]
    let extra = libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    let extra = 0;

    let p = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON | extra,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        let e = Errno::last();
        return Err(if e == Errno::ENOMEM { e } else { Errno::EEXIST });
    }
    if p as usize != addr {
        // ヒントとして扱われ別の場所に置かれた。
        unsafe { libc::munmap(p, size) };
        return Err(Errno::EEXIST);
    }
    NonNull::new(p as *mut u8).ok_or(Errno::ENOMEM)
}

/// # Safety
///
/// `ptr` / `size` は [`map_region`] か [`map_region_at`] が返した領域そのものであること。
pub unsafe fn unmap_region(ptr: NonNull<u8>, size: usize) {
    libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
}
