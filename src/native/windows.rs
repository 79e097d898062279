//! Windows 実装（`windows-sys` 直呼び出し）。
//!
//! プロセスグループと制御端末は存在しないため、ジョブ制御系は `ENOSYS` を返す。
//! 起動した子プロセスは PID → プロセスハンドルの表に登録し、`wait_pid` はそこから待つ。

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, OnceLock, PoisonError};

use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, SetHandleInformation, DUPLICATE_SAME_ACCESS, GENERIC_READ,
    GENERIC_WRITE, HANDLE, HANDLE_FLAG_INHERIT, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileType, ReadFile, SetFilePointerEx, WriteFile, CREATE_ALWAYS, CREATE_NEW,
    FILE_APPEND_DATA, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, FILE_TYPE_CHAR, OPEN_ALWAYS, OPEN_EXISTING,
    TRUNCATE_EXISTING,
};
use windows_sys::Win32::System::Console::{
    GetConsoleMode, GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows_sys::Win32::System::Diagnostics::Debug::WriteProcessMemory;
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualAllocEx, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, ExitProcess, GetCurrentProcess, GetCurrentProcessId, GetExitCodeProcess,
    ResumeThread, TerminateProcess, WaitForMultipleObjects,
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION,
    STARTF_USESTDHANDLES, STARTUPINFOW,
};

use crate::error::Errno;
use crate::fd::{ExecHandles, OpenFlags, ShFlags};
use crate::job::ProcState;
use crate::shell::Pid;

use super::WaitTarget;

/// ネイティブハンドル。`HANDLE` をアドレス値として保持する（スレッド間で送れるように）。
pub type RawHandle = isize;

/// 空きスロットを表す無効ハンドル（`INVALID_HANDLE_VALUE`）。
pub const INVALID_HANDLE: RawHandle = -1;

/// CRT の fd 継承ブロック（`lpReserved2`）のフラグ。
const FOPEN: u8 = 0x01;
const FPIPE: u8 = 0x08;
const FDEV: u8 = 0x40;

/// `WaitForMultipleObjects` が一度に待てるハンドル数。
const MAX_WAIT_OBJECTS: usize = 64;

fn as_handle(h: RawHandle) -> HANDLE {
    h as HANDLE
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn check_bool(ok: i32) -> Result<(), Errno> {
    if ok == 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

// ── ハンドル操作 ─────────────────────────────────────────────────────

/// ファイルを開く。ハンドルは非継承で作る。
pub fn open(path: &str, flags: OpenFlags, _mode: u32) -> Result<RawHandle, Errno> {
    let mut access = 0;
    if flags.contains(OpenFlags::READ) || !flags.contains(OpenFlags::WRITE) {
        access |= GENERIC_READ;
    }
    if flags.contains(OpenFlags::WRITE) {
        access |= if flags.contains(OpenFlags::APPEND) {
            FILE_APPEND_DATA
        } else {
            GENERIC_WRITE
        };
    }
    let disposition = match (
        flags.contains(OpenFlags::CREATE),
        flags.contains(OpenFlags::EXCLUSIVE),
        flags.contains(OpenFlags::TRUNCATE),
    ) {
        (true, true, _) => CREATE_NEW,
        (true, false, true) => CREATE_ALWAYS,
        (true, false, false) => OPEN_ALWAYS,
        (false, _, true) => TRUNCATE_EXISTING,
        (false, _, false) => OPEN_EXISTING,
    };
    let path = wide(path);
    let h = unsafe {
        CreateFileW(
            path.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            disposition,
            FILE_ATTRIBUTE_NORMAL | FILE_FLAG_BACKUP_SEMANTICS,
            ptr::null_mut(),
        )
    };
    if h as RawHandle == INVALID_HANDLE {
        return Err(Errno::last());
    }
    Ok(h as RawHandle)
}

pub fn close(h: RawHandle) -> Result<(), Errno> {
    check_bool(unsafe { CloseHandle(as_handle(h)) })
}

fn duplicate(h: RawHandle, inherit: bool) -> Result<RawHandle, Errno> {
    let mut out: HANDLE = ptr::null_mut();
    check_bool(unsafe {
        let me = GetCurrentProcess();
        DuplicateHandle(
            me,
            as_handle(h),
            me,
            &mut out,
            0,
            inherit as i32,
            DUPLICATE_SAME_ACCESS,
        )
    })?;
    Ok(out as RawHandle)
}

/// 非継承の複製を作る。
pub fn dup(h: RawHandle) -> Result<RawHandle, Errno> {
    duplicate(h, false)
}

/// 継承可能な複製を作る（継承フラグを切り替えられないコンソールハンドル用）。
pub fn dup_inheritable(h: RawHandle) -> Result<RawHandle, Errno> {
    duplicate(h, true)
}

pub fn read(h: RawHandle, buf: &mut [u8]) -> Result<usize, Errno> {
    let mut n: u32 = 0;
    let len = buf.len().min(u32::MAX as usize) as u32;
    let ok = unsafe { ReadFile(as_handle(h), buf.as_mut_ptr(), len, &mut n, ptr::null_mut()) };
    if ok == 0 {
        let e = Errno::last();
        // 書き込み側が閉じたパイプは EOF。
        if e == Errno::EPIPE {
            return Ok(0);
        }
        return Err(e);
    }
    Ok(n as usize)
}

pub fn write(h: RawHandle, buf: &[u8]) -> Result<usize, Errno> {
    let mut n: u32 = 0;
    let len = buf.len().min(u32::MAX as usize) as u32;
    check_bool(unsafe { WriteFile(as_handle(h), buf.as_ptr(), len, &mut n, ptr::null_mut()) })?;
    Ok(n as usize)
}

pub fn lseek(h: RawHandle, offset: i64, whence: i32) -> Result<i64, Errno> {
    let mut pos: i64 = 0;
    check_bool(unsafe { SetFilePointerEx(as_handle(h), offset, &mut pos, whence as u32) })?;
    Ok(pos)
}

pub fn isatty(h: RawHandle) -> bool {
    let mut mode = 0u32;
    unsafe { GetFileType(as_handle(h)) == FILE_TYPE_CHAR && GetConsoleMode(as_handle(h), &mut mode) != 0 }
}

pub fn pipe() -> Result<(RawHandle, RawHandle), Errno> {
    let mut r: HANDLE = ptr::null_mut();
    let mut w: HANDLE = ptr::null_mut();
    check_bool(unsafe { CreatePipe(&mut r, &mut w, ptr::null::<SECURITY_ATTRIBUTES>(), 0) })?;
    Ok((r as RawHandle, w as RawHandle))
}

pub fn is_valid(h: RawHandle) -> bool {
    h != INVALID_HANDLE && h != 0
}

pub fn set_inheritable(h: RawHandle, inheritable: bool) -> Result<(), Errno> {
    let flag = if inheritable { HANDLE_FLAG_INHERIT } else { 0 };
    check_bool(unsafe { SetHandleInformation(as_handle(h), HANDLE_FLAG_INHERIT, flag) })
}

/// プロセスの標準入力・出力・エラーのハンドル。
pub fn std_handles() -> [RawHandle; 3] {
    unsafe {
        [
            GetStdHandle(STD_INPUT_HANDLE) as RawHandle,
            GetStdHandle(STD_OUTPUT_HANDLE) as RawHandle,
            GetStdHandle(STD_ERROR_HANDLE) as RawHandle,
        ]
    }
}

// ── 端末とプロセスグループ ───────────────────────────────────────────

pub fn tcgetpgrp(_h: RawHandle) -> Result<Pid, Errno> {
    Err(Errno::ENOSYS)
}

pub fn tcsetpgrp(_h: RawHandle, _pgid: Pid) -> Result<(), Errno> {
    Err(Errno::ENOSYS)
}

/// プロセスグループは表の上でだけ記録する。
pub fn setpgid(pid: Pid, pgid: Pid) -> Result<(), Errno> {
    let mut children = registry();
    if let Some(child) = children.get_mut(&pid) {
        child.pgid = if pgid == 0 { pid } else { pgid };
    }
    Ok(())
}

pub fn getpgrp() -> Pid {
    getpid()
}

pub fn getpid() -> Pid {
    unsafe { GetCurrentProcessId() as Pid }
}

/// `SIGCONT` 以外は強制終了として扱う。
pub fn kill(pid: Pid, signo: i32) -> Result<(), Errno> {
    if signo == crate::signal::SIGCONT || signo == 0 {
        return Ok(());
    }
    let children = registry();
    let child = children.get(&pid).ok_or(Errno::ESRCH)?;
    check_bool(unsafe { TerminateProcess(as_handle(child.process), (128 + signo) as u32) })
}

pub fn killpg(pgid: Pid, signo: i32) -> Result<(), Errno> {
    let members: Vec<Pid> = registry()
        .iter()
        .filter(|(_, c)| c.pgid == pgid)
        .map(|(&pid, _)| pid)
        .collect();
    if members.is_empty() {
        return Err(Errno::ESRCH);
    }
    for pid in members {
        kill(pid, signo)?;
    }
    Ok(())
}

// ── 子プロセス表と待機 ───────────────────────────────────────────────

struct Child {
    process: RawHandle,
    pgid: Pid,
}

fn registry() -> std::sync::MutexGuard<'static, HashMap<Pid, Child>> {
    static CHILDREN: OnceLock<Mutex<HashMap<Pid, Child>>> = OnceLock::new();
    CHILDREN
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn register_child(pid: Pid, process: RawHandle, pgid: Option<Pid>) {
    registry().insert(
        pid,
        Child {
            process,
            pgid: pgid.filter(|&g| g != 0).unwrap_or(pid),
        },
    );
}

fn reap(pid: Pid) -> Result<(Pid, ProcState), Errno> {
    let child = registry().remove(&pid).ok_or(Errno::ECHILD)?;
    let mut code: u32 = 0;
    let ok = unsafe { GetExitCodeProcess(as_handle(child.process), &mut code) };
    unsafe { CloseHandle(as_handle(child.process)) };
    check_bool(ok)?;
    Ok((pid, ProcState::Exited(code as i32)))
}

/// 登録済みの子の終了を 1 つ回収する。`block` が偽なら待たない。
pub fn wait_pid(target: WaitTarget, block: bool) -> Result<Option<(Pid, ProcState)>, Errno> {
    let members: Vec<(Pid, RawHandle)> = {
        let children = registry();
        match target {
            WaitTarget::Pid(pid) => children
                .get(&pid)
                .map(|c| vec![(pid, c.process)])
                .unwrap_or_default(),
            WaitTarget::Group(pgid) => children
                .iter()
                .filter(|(_, c)| c.pgid == pgid)
                .map(|(&pid, c)| (pid, c.process))
                .collect(),
        }
    };
    wait_members(&members, if block { INFINITE } else { 0 })
}

/// `pids` のどれか 1 つの終了を回収する。`timeout` が切れたら `Ok(None)`。
pub fn wait_any(
    pids: &[Pid],
    timeout: Option<std::time::Duration>,
) -> Result<Option<(Pid, ProcState)>, Errno> {
    let members: Vec<(Pid, RawHandle)> = {
        let children = registry();
        pids.iter()
            .filter_map(|pid| children.get(pid).map(|c| (*pid, c.process)))
            .collect()
    };
    let ms = match timeout {
        Some(t) => t.as_millis().min(u128::from(INFINITE - 1)) as u32,
        None => INFINITE,
    };
    if members.len() > MAX_WAIT_OBJECTS {
        // 一度に待てる数を超える分は、先頭の組を短く待つことを繰り返して拾う。
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            for group in members.chunks(MAX_WAIT_OBJECTS) {
                if let Some(hit) = wait_members(group, 0)? {
                    return Ok(Some(hit));
                }
            }
            if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                return Ok(None);
            }
            wait_members(&members[..MAX_WAIT_OBJECTS], ms.min(20))?;
        }
    }
    wait_members(&members, ms)
}

fn wait_members(members: &[(Pid, RawHandle)], timeout_ms: u32) -> Result<Option<(Pid, ProcState)>, Errno> {
    if members.is_empty() {
        return Err(Errno::ECHILD);
    }
    let handles: Vec<HANDLE> = members.iter().map(|&(_, h)| as_handle(h)).collect();
    let ret = unsafe {
        WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, timeout_ms)
    };
    if ret == WAIT_TIMEOUT {
        return Ok(None);
    }
    if ret == WAIT_FAILED {
        return Err(Errno::last());
    }
    let index = ret.wrapping_sub(WAIT_OBJECT_0) as usize;
    let &(pid, _) = members.get(index).ok_or(Errno::EINVAL)?;
    reap(pid).map(Some)
}

// ── プロセス生成 ─────────────────────────────────────────────────────

/// MSVC の引数解析規則に従って 1 引数をクォートする。
fn quote_arg(arg: &str, out: &mut String) {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\u{0b}', '"']) {
        out.push_str(arg);
        return;
    }
    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            c => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

fn command_line(argv: &[String]) -> Vec<u16> {
    let mut line = String::new();
    for (i, arg) in argv.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        quote_arg(arg, &mut line);
    }
    wide(&line)
}

fn environment_block(envp: &[String]) -> Vec<u16> {
    let mut block: Vec<u16> = Vec::new();
    for var in envp {
        block.extend(var.encode_utf16());
        block.push(0);
    }
    if envp.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// CRT が子の fd 0..N を復元するための `lpReserved2` ブロック。
///
/// 形式: `u32` 個数、個数分のフラグバイト、個数分のハンドル。
fn crt_fd_block(handles: &ExecHandles) -> Vec<u8> {
    let n = handles.handles.len();
    let mut block = Vec::with_capacity(4 + n * (1 + std::mem::size_of::<RawHandle>()));
    block.extend_from_slice(&(n as u32).to_ne_bytes());
    for (i, h) in handles.handles.iter().enumerate() {
        let flags = handles.flags.get(i).copied().unwrap_or_default();
        let mut crt = 0u8;
        if h.is_some() {
            crt |= FOPEN;
            if flags.contains(ShFlags::PIPE) {
                crt |= FPIPE;
            }
            if flags.contains(ShFlags::TTY) {
                crt |= FDEV;
            }
        }
        block.push(crt);
    }
    for h in &handles.handles {
        block.extend_from_slice(&h.unwrap_or(INVALID_HANDLE).to_ne_bytes());
    }
    block
}

struct Created {
    pid: Pid,
    process: RawHandle,
    thread: RawHandle,
}

fn create_process(
    path: &str,
    argv: &[String],
    envp: Option<&[String]>,
    handles: &ExecHandles,
    cwd: Option<&str>,
    suspended: bool,
) -> Result<Created, Errno> {
    let app = wide(path);
    let dir = cwd.map(wide);
    let mut cmd = command_line(argv);
    let env = envp.map(environment_block);
    let mut reserved = crt_fd_block(handles);
    let std = |i: usize| {
        handles
            .handles
            .get(i)
            .copied()
            .flatten()
            .map(as_handle)
            .unwrap_or(ptr::null_mut())
    };

    let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
    si.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    si.dwFlags = STARTF_USESTDHANDLES;
    si.hStdInput = std(0);
    si.hStdOutput = std(1);
    si.hStdError = std(2);
    si.cbReserved2 = reserved.len() as u16;
    si.lpReserved2 = reserved.as_mut_ptr();

    let mut flags = CREATE_UNICODE_ENVIRONMENT;
    if suspended {
        flags |= CREATE_SUSPENDED;
    }
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    check_bool(unsafe {
        CreateProcessW(
            app.as_ptr(),
            cmd.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            1,
            flags,
            env.as_ref()
                .map(|e| e.as_ptr() as *const c_void)
                .unwrap_or(ptr::null()),
            dir.as_ref().map(|d| d.as_ptr()).unwrap_or(ptr::null()),
            &si,
            &mut pi,
        )
    })?;
    Ok(Created {
        pid: pi.dwProcessId as Pid,
        process: pi.hProcess as RawHandle,
        thread: pi.hThread as RawHandle,
    })
}

/// 外部プログラムを起動して子プロセス表に登録する。
pub fn spawn_program(
    path: &str,
    argv: &[String],
    envp: &[String],
    handles: &ExecHandles,
    cwd: &str,
) -> Result<Pid, Errno> {
    let created = create_process(path, argv, Some(envp), handles, Some(cwd), false)?;
    unsafe { CloseHandle(as_handle(created.thread)) };
    register_child(created.pid, created.process, None);
    Ok(created.pid)
}

/// 停止状態で作った子プロセス。疑似 fork がメモリを書き込んでから再開する。
#[derive(Debug)]
pub struct SuspendedProcess {
    pid: Pid,
    process: RawHandle,
    thread: RawHandle,
    resumed: bool,
}

impl SuspendedProcess {
    /// 現在の実行ファイルを停止状態で起動する。
    pub fn launch(args: &[String], handles: &ExecHandles) -> Result<Self, Errno> {
        let exe = std::env::current_exe().map_err(|e| Errno::from_io(&e))?;
        let exe = exe.to_string_lossy().into_owned();
        let mut argv = vec![exe.clone()];
        argv.extend_from_slice(args);
        let created = create_process(&exe, &argv, None, handles, None, true)?;
        Ok(Self {
            pid: created.pid,
            process: created.process,
            thread: created.thread,
            resumed: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 子のアドレス空間の `addr` に `size` バイトを確保する。別の場所になったら失敗。
    pub fn reserve_at(&self, addr: usize, size: usize) -> Result<(), Errno> {
        let got = unsafe {
            VirtualAllocEx(
                as_handle(self.process),
                addr as *const c_void,
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if got.is_null() {
            return Err(Errno::last());
        }
        if got as usize != addr {
            return Err(Errno::EEXIST);
        }
        Ok(())
    }

    pub fn write(&self, addr: usize, bytes: &[u8]) -> Result<(), Errno> {
        let mut written = 0usize;
        check_bool(unsafe {
            WriteProcessMemory(
                as_handle(self.process),
                addr as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                &mut written,
            )
        })?;
        if written != bytes.len() {
            return Err(Errno::EIO);
        }
        Ok(())
    }

    /// 主スレッドを再開し、子プロセス表に登録する。
    pub fn resume(mut self, pgid: Option<Pid>) -> Result<Pid, Errno> {
        if unsafe { ResumeThread(as_handle(self.thread)) } == u32::MAX {
            return Err(Errno::last());
        }
        self.resumed = true;
        register_child(self.pid, self.process, pgid);
        Ok(self.pid)
    }

    pub fn terminate(&mut self) {
        if !self.resumed {
            unsafe { TerminateProcess(as_handle(self.process), 1) };
        }
    }
}

impl Drop for SuspendedProcess {
    fn drop(&mut self) {
        self.terminate();
        unsafe {
            CloseHandle(as_handle(self.thread));
            if !self.resumed {
                // 再開済みなら process ハンドルは子プロセス表が持つ。
                CloseHandle(as_handle(self.process));
            }
        }
    }
}

pub fn exit_process(status: i32) -> ! {
    unsafe { ExitProcess(status as u32) };
    unreachable!("ExitProcess returned")
}

// ── メモリ領域 ───────────────────────────────────────────────────────

pub fn page_size() -> usize {
    4096
}

pub fn map_region(size: usize) -> Result<NonNull<u8>, Errno> {
    let p = unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    NonNull::new(p as *mut u8).ok_or_else(Errno::last)
}

pub fn map_region_at(addr: usize, size: usize) -> Result<NonNull<u8>, Errno> {
    let p = unsafe {
        VirtualAlloc(
            addr as *const c_void,
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    match NonNull::new(p as *mut u8) {
        Some(p) if p.as_ptr() as usize == addr => Ok(p),
        Some(p) => {
            unsafe { VirtualFree(p.as_ptr() as *mut c_void, 0, MEM_RELEASE) };
            Err(Errno::EEXIST)
        }
        None => Err(Errno::EEXIST),
    }
}

/// # Safety
///
/// `ptr` は `map_region` / `map_region_at` が返した領域の先頭であること。
pub unsafe fn unmap_region(ptr: NonNull<u8>, _size: usize) {
    VirtualFree(ptr.as_ptr() as *mut c_void, 0, MEM_RELEASE);
}
