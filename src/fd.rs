//! 仮想ファイルディスクリプタテーブル。
//!
//! シェルから見える小さな fd 番号と、OS のネイティブハンドル（Unix の fd / Windows の HANDLE）を
//! 切り離す。1 つのプロセス内に複数の [`ShellInstance`](crate::shell::ShellInstance) が共存する
//! スレッドモードでも、各コンテキストが独立した fd 0/1/2 とカレントディレクトリを持てる。
//!
//! ## 不変条件
//!
//! - ネイティブハンドルが無効（[`INVALID_HANDLE`]）なスロットは空き。
//! - テーブルは単調に伸びる（縮まない）。上限は [`Config::max_fds`](crate::config::Config::max_fds)。
//! - ネイティブレベルでは全ハンドルが close-on-exec。子への公開は
//!   [`FdTable::prepare_for_exec`] だけが決める。
//! - 同じネイティブハンドルを 2 つのスロットが共有することはない（複製は常に新しいハンドルを作る）。
//!
//! テーブルの変更はすべて内部のミューテックスで直列化する。`read` / `write` は
//! ハンドルを取り出した後ロックを離してから OS を呼ぶため、ブロックしても他の操作を止めない。

use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::error::{Errno, Error, Result};
use crate::native::{self, RawHandle, INVALID_HANDLE};
use crate::shell::Pid;

/// 拡張時に一度に増やすスロット数。
const GROW_BY: usize = 32;

bitflags! {
    /// `open` に渡すフラグ（POSIX の `O_*` に相当）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct OpenFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const RDWR = Self::READ.bits() | Self::WRITE.bits();
        const CREATE = 0x0010;
        const TRUNCATE = 0x0020;
        const APPEND = 0x0040;
        const EXCLUSIVE = 0x0080;
        const NOCTTY = 0x0100;
        const DIRECTORY = 0x0200;
    }
}

bitflags! {
    /// シェル専用のフラグ。ネイティブ側には exec 時まで影響しない。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
    pub struct ShFlags: u32 {
        const PIPE = 0x01;
        const DIR = 0x02;
        const TTY = 0x04;
        const CLOEXEC = 0x08;
        const TRACE = 0x10;
        /// ネイティブハンドルを差し替えた（コンソールハンドルの再複製など）。
        const DIRTY = 0x20;
        /// `prepare_for_exec` で継承可能にした。
        const INHERIT = 0x40;
    }
}

/// 1 つの仮想 fd。
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FdEntry {
    pub fd: i32,
    pub oflags: OpenFlags,
    pub shflags: ShFlags,
    pub native: RawHandle,
}

impl FdEntry {
    fn free(fd: i32) -> Self {
        Self {
            fd,
            oflags: OpenFlags::empty(),
            shflags: ShFlags::empty(),
            native: INVALID_HANDLE,
        }
    }

    pub fn is_open(&self) -> bool {
        self.native != INVALID_HANDLE
    }
}

/// exec 先に渡すハンドル配置。`handles[i]` が子の fd `i` になる。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecHandles {
    pub handles: Vec<Option<RawHandle>>,
    pub flags: Vec<ShFlags>,
}

struct Inner {
    entries: Vec<FdEntry>,
    cwd: String,
    max: usize,
    /// `prepare_for_exec` で継承可能にした fd。
    exec_prepared: Vec<i32>,
}

impl Inner {
    fn get(&self, fd: i32) -> Result<&FdEntry> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.entries.get(i))
            .filter(|e| e.is_open())
            .ok_or_else(|| Error::os(format!("fd {}", fd), Errno::EBADF))
    }

    fn get_mut(&mut self, fd: i32) -> Result<&mut FdEntry> {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.entries.get_mut(i))
            .filter(|e| e.is_open())
            .ok_or_else(|| Error::os(format!("fd {}", fd), Errno::EBADF))
    }

    /// `len` 以上のスロットを持つよう伸ばす。上限を超えるなら `TableFull`。
    fn ensure_len(&mut self, len: usize) -> Result<()> {
        if len <= self.entries.len() {
            return Ok(());
        }
        if len > self.max {
            return Err(Error::TableFull);
        }
        let new_len = (self.entries.len() + GROW_BY).max(len).min(self.max);
        let start = self.entries.len();
        self.entries
            .extend((start..new_len).map(|fd| FdEntry::free(fd as i32)));
        trace!(from = start, to = new_len, "fd table grown");
        Ok(())
    }

    /// `min` 以上で最小の空きスロットを確保する。
    fn alloc_slot(&mut self, min: i32) -> Result<usize> {
        let min = usize::try_from(min)
            .map_err(|_| Error::os(format!("fd {}", min), Errno::EINVAL))?;
        if let Some(i) = self.entries.iter().skip(min).position(|e| !e.is_open()) {
            return Ok(min + i);
        }
        let slot = self.entries.len().max(min);
        self.ensure_len(slot + 1)?;
        Ok(slot)
    }

    fn install(&mut self, slot: usize, oflags: OpenFlags, shflags: ShFlags, native: RawHandle) {
        self.entries[slot] = FdEntry {
            fd: slot as i32,
            oflags,
            shflags,
            native,
        };
    }
}

/// 仮想 fd テーブル。
pub struct FdTable {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("FdTable")
            .field("open", &inner.entries.iter().filter(|e| e.is_open()).count())
            .field("size", &inner.entries.len())
            .field("cwd", &inner.cwd)
            .finish()
    }
}

impl FdTable {
    /// 空のテーブル。
    pub fn new(max_fds: usize, cwd: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                cwd: cwd.into(),
                max: max_fds,
                exec_prepared: Vec::new(),
            }),
        }
    }

    /// プロセスの標準入出力を複製して 0/1/2 に置いたテーブル。
    ///
    /// 複製するので、テーブルの teardown がプロセス自身の標準入出力を閉じることはない。
    pub fn from_process(max_fds: usize) -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::os("getcwd", Errno::from_io(&e)))?
            .to_string_lossy()
            .into_owned();
        let table = Self::new(max_fds, cwd);
        {
            let mut inner = table.lock();
            inner.ensure_len(3)?;
            for (fd, native) in std_handles().into_iter().enumerate() {
                if !native::is_valid(native) {
                    continue;
                }
                let dup = native::dup(native).map_err(|e| Error::os(format!("fd {}", fd), e))?;
                let oflags = if fd == 0 {
                    OpenFlags::READ
                } else {
                    OpenFlags::WRITE
                };
                let shflags = if native::isatty(dup) {
                    ShFlags::TTY
                } else {
                    ShFlags::empty()
                };
                inner.install(fd, oflags, shflags, dup);
            }
        }
        Ok(table)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// fork 用の複製。有効なネイティブハンドルをすべて複製し、フラグと cwd をコピーする。
    pub fn duplicate(&self) -> Result<FdTable> {
        let inner = self.lock();
        let copy = FdTable::new(inner.max, inner.cwd.clone());
        {
            let mut dst = copy.lock();
            dst.ensure_len(inner.entries.len())?;
            for e in inner.entries.iter().filter(|e| e.is_open()) {
                // 途中で失敗したら、作りかけの copy の drop がそれまでの複製を閉じる。
                let native =
                    native::dup(e.native).map_err(|err| Error::os(format!("fd {}", e.fd), err))?;
                dst.install(e.fd as usize, e.oflags, e.shflags, native);
            }
        }
        Ok(copy)
    }

    /// ネイティブの fork 直後の子で使う。OS がすでに全ハンドルを複製しているので、
    /// ハンドル値はそのまま引き継ぐ。
    pub fn adopt_inherited(&self) -> FdTable {
        let inner = self.lock();
        FdTable {
            inner: Mutex::new(Inner {
                entries: inner.entries.clone(),
                cwd: inner.cwd.clone(),
                max: inner.max,
                exec_prepared: Vec::new(),
            }),
        }
    }

    /// 外部から受け取ったエントリ群でテーブルを組み立てる（疑似 fork の子側）。
    pub fn from_entries(max_fds: usize, cwd: String, entries: &[FdEntry]) -> Result<FdTable> {
        let table = FdTable::new(max_fds, cwd);
        {
            let mut inner = table.lock();
            for e in entries.iter().filter(|e| e.is_open()) {
                let slot = usize::try_from(e.fd)
                    .map_err(|_| Error::internal(format!("bad fd {} in handoff", e.fd)))?;
                inner.ensure_len(slot + 1)?;
                inner.install(slot, e.oflags, e.shflags - ShFlags::INHERIT, e.native);
            }
        }
        Ok(table)
    }

    // ── open / dup / close ───────────────────────────────────────────

    /// `path` を開き、最小の空きスロットに置く。
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<i32> {
        self.open_min(path, flags, mode, 0)
    }

    /// `path` を開き、`min` 以上の最小の空きスロットに置く。
    ///
    /// 相対パスはテーブル自身の cwd で解決する。ネイティブハンドルは常に close-on-exec。
    pub fn open_min(&self, path: &str, flags: OpenFlags, mode: u32, min: i32) -> Result<i32> {
        let full = self.make_path(path);
        let handle = native::open(&full, flags, mode).map_err(|e| Error::os(path, e))?;
        let mut shflags = ShFlags::empty();
        if native::isatty(handle) {
            shflags |= ShFlags::TTY;
        }
        if flags.contains(OpenFlags::DIRECTORY) || fs::metadata(&full).map(|m| m.is_dir()).unwrap_or(false) {
            shflags |= ShFlags::DIR;
        }
        let mut inner = self.lock();
        let slot = match inner.alloc_slot(min) {
            Ok(slot) => slot,
            Err(e) => {
                drop(inner);
                let _ = native::close(handle);
                return Err(e);
            }
        };
        inner.install(slot, flags, shflags, handle);
        trace!(fd = slot, native = ?handle, path = %full, "open");
        Ok(slot as i32)
    }

    /// `dup(2)` 相当。最小の空きスロットに複製する。
    pub fn dup(&self, fd: i32) -> Result<i32> {
        self.dup_above(fd, 0)
    }

    /// `fcntl(F_DUPFD)` 相当。`min` 以上の最小の空きスロットに複製する。
    pub fn dup_above(&self, fd: i32, min: i32) -> Result<i32> {
        let mut inner = self.lock();
        let src = *inner.get(fd)?;
        let slot = inner.alloc_slot(min)?;
        let native = native::dup(src.native).map_err(|e| Error::os(format!("fd {}", fd), e))?;
        // 複製先では close-on-exec とトレース指定は引き継がない。
        let shflags = src.shflags - ShFlags::CLOEXEC - ShFlags::TRACE - ShFlags::INHERIT;
        inner.install(slot, src.oflags, shflags, native);
        trace!(fd, new_fd = slot, "dup");
        Ok(slot as i32)
    }

    /// `dup2(2)` 相当。`target` が開いていれば先に閉じる。`fd == target` なら検証のみ。
    pub fn dup_onto(&self, fd: i32, target: i32) -> Result<i32> {
        let mut inner = self.lock();
        let src = *inner.get(fd)?;
        if fd == target {
            return Ok(target);
        }
        let slot = usize::try_from(target)
            .ok()
            .filter(|&t| t < inner.max)
            .ok_or_else(|| Error::os(format!("fd {}", target), Errno::EBADF))?;
        inner.ensure_len(slot + 1)?;
        let native = native::dup(src.native).map_err(|e| Error::os(format!("fd {}", fd), e))?;
        let old = inner.entries[slot];
        if old.is_open() {
            if let Err(e) = native::close(old.native) {
                warn!(fd = target, errno = %e, "close of replaced descriptor failed");
            }
        }
        let shflags = src.shflags - ShFlags::CLOEXEC - ShFlags::TRACE - ShFlags::INHERIT;
        inner.install(slot, src.oflags, shflags, native);
        trace!(fd, target, "dup2");
        Ok(target)
    }

    /// fd を閉じる。開いていない fd は `EBADF`。
    pub fn close(&self, fd: i32) -> Result<()> {
        let mut inner = self.lock();
        let entry = *inner.get(fd)?;
        inner.entries[fd as usize] = FdEntry::free(fd);
        inner.exec_prepared.retain(|&p| p != fd);
        drop(inner);
        trace!(fd, "close");
        native::close(entry.native).map_err(|e| Error::os(format!("fd {}", fd), e))
    }

    /// `fd` を `min` 以上の番号へ移す（複製してから元を閉じる）。
    pub fn move_above(&self, fd: i32, min: i32) -> Result<i32> {
        if fd >= min {
            self.get_flags(fd)?;
            return Ok(fd);
        }
        let new_fd = self.dup_above(fd, min)?;
        let flags = self.get_flags(fd)?.1;
        self.close(fd)?;
        if flags.contains(ShFlags::CLOEXEC) {
            self.set_close_on_exec(new_fd, true)?;
        }
        Ok(new_fd)
    }

    /// パイプを作り、`(読み込み側, 書き込み側)` を最小の空きスロットに置く。
    pub fn pipe(&self) -> Result<(i32, i32)> {
        let (r, w) = native::pipe().map_err(|e| Error::os("pipe", e))?;
        let mut inner = self.lock();
        let rd = match inner.alloc_slot(0) {
            Ok(slot) => slot,
            Err(e) => {
                drop(inner);
                let _ = native::close(r);
                let _ = native::close(w);
                return Err(e);
            }
        };
        inner.install(rd, OpenFlags::READ, ShFlags::PIPE, r);
        let wr = match inner.alloc_slot(0) {
            Ok(slot) => slot,
            Err(e) => {
                inner.entries[rd] = FdEntry::free(rd as i32);
                drop(inner);
                let _ = native::close(r);
                let _ = native::close(w);
                return Err(e);
            }
        };
        inner.install(wr, OpenFlags::WRITE, ShFlags::PIPE, w);
        trace!(rd, wr, "pipe");
        Ok((rd as i32, wr as i32))
    }

    // ── 入出力の委譲 ─────────────────────────────────────────────────

    /// fd のネイティブハンドル。
    pub fn native_of(&self, fd: i32) -> Result<RawHandle> {
        Ok(self.lock().get(fd)?.native)
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let h = self.native_of(fd)?;
        native::read(h, buf).map_err(|e| Error::os(format!("read fd {}", fd), e))
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        let h = self.native_of(fd)?;
        native::write(h, buf).map_err(|e| Error::os(format!("write fd {}", fd), e))
    }

    /// `buf` をすべて書き込む。
    pub fn write_all(&self, fd: i32, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(fd, buf)?;
            if n == 0 {
                return Err(Error::os(format!("write fd {}", fd), Errno::EIO));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: i32) -> Result<i64> {
        let h = self.native_of(fd)?;
        native::lseek(h, offset, whence).map_err(|e| Error::os(format!("lseek fd {}", fd), e))
    }

    pub fn isatty(&self, fd: i32) -> bool {
        self.native_of(fd).map(native::isatty).unwrap_or(false)
    }

    /// `ioctl(2)` をテーブル経由で呼ぶ。
    ///
    /// # Safety
    ///
    /// `arg` は `request` が要求する型の領域を指していること。
    #[cfg(unix)]
    pub unsafe fn ioctl(&self, fd: i32, request: libc::c_ulong, arg: *mut libc::c_void) -> Result<i32> {
        let h = self.native_of(fd)?;
        native::ioctl(h, request, arg).map_err(|e| Error::os(format!("ioctl fd {}", fd), e))
    }

    pub fn tcgetpgrp(&self, fd: i32) -> Result<Pid> {
        let h = self.native_of(fd)?;
        native::tcgetpgrp(h).map_err(|e| Error::os("tcgetpgrp", e))
    }

    pub fn tcsetpgrp(&self, fd: i32, pgid: Pid) -> Result<()> {
        let h = self.native_of(fd)?;
        native::tcsetpgrp(h, pgid).map_err(|e| Error::os("tcsetpgrp", e))
    }

    // ── フラグ ───────────────────────────────────────────────────────

    pub fn get_flags(&self, fd: i32) -> Result<(OpenFlags, ShFlags)> {
        let inner = self.lock();
        let e = inner.get(fd)?;
        Ok((e.oflags, e.shflags))
    }

    /// close-on-exec を設定する。ネイティブには exec 時まで反映しない。
    pub fn set_close_on_exec(&self, fd: i32, on: bool) -> Result<()> {
        let mut inner = self.lock();
        let e = inner.get_mut(fd)?;
        e.shflags.set(ShFlags::CLOEXEC, on);
        Ok(())
    }

    /// `fd` をトレース出力用にする。他の fd のトレース指定は外す。
    pub fn set_trace(&self, fd: i32) -> Result<()> {
        let mut inner = self.lock();
        inner.get(fd)?;
        for e in inner.entries.iter_mut() {
            e.shflags.remove(ShFlags::TRACE);
        }
        inner.get_mut(fd)?.shflags.insert(ShFlags::TRACE);
        Ok(())
    }

    /// 開いている fd の昇順リスト。
    pub fn open_fds(&self) -> Vec<i32> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.is_open())
            .map(|e| e.fd)
            .collect()
    }

    /// 開いているエントリの写し（疑似 fork の引き継ぎ用）。
    pub fn entries(&self) -> Vec<FdEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.is_open())
            .copied()
            .collect()
    }

    pub fn entry(&self, fd: i32) -> Option<FdEntry> {
        self.lock().get(fd).ok().copied()
    }

    /// 現在のスロット数（単調増加）。
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn max_fds(&self) -> usize {
        self.lock().max
    }

    // ── パスと cwd ───────────────────────────────────────────────────

    pub fn cwd(&self) -> String {
        self.lock().cwd.clone()
    }

    /// `relative` をテーブルの cwd で絶対パスにする（OS プロセスの cwd は見ない）。
    pub fn make_path(&self, relative: &str) -> String {
        if is_absolute(relative) {
            return normalize(relative);
        }
        let cwd = self.cwd();
        normalize(&format!("{}/{}", cwd.trim_end_matches(['/', '\\']), relative))
    }

    /// カレントディレクトリを変える。OS プロセスの cwd には触れない。
    pub fn chdir(&self, path: &str) -> Result<()> {
        let full = self.make_path(path);
        let meta = fs::metadata(&full).map_err(|e| Error::os(path, Errno::from_io(&e)))?;
        if !meta.is_dir() {
            return Err(Error::os(path, Errno::ENOTDIR));
        }
        let mut inner = self.lock();
        debug!(from = %inner.cwd, to = %full, "chdir");
        inner.cwd = full;
        Ok(())
    }

    /// テーブルの cwd で解決した `stat`。
    pub fn stat(&self, path: &str) -> Result<fs::Metadata> {
        fs::metadata(self.make_path(path)).map_err(|e| Error::os(path, Errno::from_io(&e)))
    }

    /// テーブルの cwd で解決した `lstat`。
    pub fn lstat(&self, path: &str) -> Result<fs::Metadata> {
        fs::symlink_metadata(self.make_path(path)).map_err(|e| Error::os(path, Errno::from_io(&e)))
    }

    /// テーブルの cwd で解決した `access(2)`。
    #[cfg(unix)]
    pub fn access(&self, path: &str, mode: i32) -> Result<()> {
        native::access(&self.make_path(path), mode).map_err(|e| Error::os(path, e))
    }

    // ── exec 時の継承 ────────────────────────────────────────────────

    /// close-on-exec でない全エントリを継承可能にし、子の fd 0..N の配置を返す。
    ///
    /// Windows では継承フラグを切り替えられないコンソールハンドルを継承可能な複製に差し替える。
    /// Unix ではネイティブ側は何もしない（配置は `install_exec_layout` か
    /// `posix_spawn` のファイルアクションが行う）。
    pub fn prepare_for_exec(&self) -> Result<ExecHandles> {
        self.prepare(ShFlags::CLOEXEC | ShFlags::TRACE)
    }

    /// 疑似 fork 用。fork は close-on-exec の fd も引き継ぐので、開いている全エントリを継承可能にする。
    pub fn prepare_for_fork(&self) -> Result<ExecHandles> {
        self.prepare(ShFlags::empty())
    }

    fn prepare(&self, skip: ShFlags) -> Result<ExecHandles> {
        let mut inner = self.lock();
        let mut out = ExecHandles::default();
        let mut prepared = Vec::new();
        for i in 0..inner.entries.len() {
            let e = inner.entries[i];
            if !e.is_open() || e.shflags.intersects(skip) {
                continue;
            }
            let native = make_inheritable(&e)?;
            let entry = &mut inner.entries[i];
            if native != e.native {
                entry.native = native;
                entry.shflags.insert(ShFlags::DIRTY);
            }
            entry.shflags.insert(ShFlags::INHERIT);
            let idx = e.fd as usize;
            if out.handles.len() <= idx {
                out.handles.resize(idx + 1, None);
                out.flags.resize(idx + 1, ShFlags::empty());
            }
            out.handles[idx] = Some(native);
            out.flags[idx] = entry.shflags;
            prepared.push(e.fd);
        }
        debug!(count = prepared.len(), "descriptors prepared for exec");
        inner.exec_prepared = prepared;
        Ok(out)
    }

    /// exec の後始末。失敗なら継承可能にした印を戻し、成功なら子に渡したエントリを閉じる。
    pub fn finalize_after_exec(&self, success: bool) {
        if success {
            let mut inner = self.lock();
            let prepared = std::mem::take(&mut inner.exec_prepared);
            let mut to_close = Vec::new();
            for fd in prepared {
                if let Some(e) = inner.entries.get_mut(fd as usize) {
                    if e.is_open() {
                        to_close.push(e.native);
                        *e = FdEntry::free(fd);
                    }
                }
            }
            drop(inner);
            for h in to_close {
                let _ = native::close(h);
            }
        } else {
            self.restore_inheritance();
        }
    }

    /// `prepare_for_exec` で継承可能にしたエントリを非継承に戻す。
    pub fn restore_inheritance(&self) {
        let mut inner = self.lock();
        let prepared = std::mem::take(&mut inner.exec_prepared);
        for fd in prepared {
            if let Some(e) = inner.entries.get_mut(fd as usize) {
                if e.is_open() && e.shflags.contains(ShFlags::INHERIT) {
                    if cfg!(windows) {
                        if let Err(err) = native::set_inheritable(e.native, false) {
                            warn!(fd, errno = %err, "could not clear inheritance");
                        }
                    }
                    e.shflags.remove(ShFlags::INHERIT);
                }
            }
        }
    }

    /// 開いている全ネイティブハンドルを閉じる。トレース fd だけは残す。
    pub fn close_all(&self) {
        let mut inner = self.lock();
        let mut to_close = Vec::new();
        for e in inner.entries.iter_mut() {
            if e.is_open() && !e.shflags.contains(ShFlags::TRACE) {
                to_close.push(e.native);
                *e = FdEntry::free(e.fd);
            }
        }
        inner.exec_prepared.clear();
        drop(inner);
        for h in to_close {
            let _ = native::close(h);
        }
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(unix)]
fn std_handles() -> [RawHandle; 3] {
    [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
}

#[cfg(windows)]
fn std_handles() -> [RawHandle; 3] {
    native::std_handles()
}

#[cfg(unix)]
fn make_inheritable(e: &FdEntry) -> Result<RawHandle> {
    Ok(e.native)
}

#[cfg(windows)]
fn make_inheritable(e: &FdEntry) -> Result<RawHandle> {
    match native::set_inheritable(e.native, true) {
        Ok(()) => Ok(e.native),
        Err(_) if e.shflags.contains(ShFlags::TTY) => {
            let dup = native::dup_inheritable(e.native)
                .map_err(|err| Error::os(format!("fd {}", e.fd), err))?;
            let _ = native::close(e.native);
            Ok(dup)
        }
        Err(err) => Err(Error::os(format!("fd {}", e.fd), err)),
    }
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    if cfg!(windows) {
        let b = path.as_bytes();
        return path.starts_with('\\')
            || (b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'/' || b[2] == b'\\'));
    }
    false
}

/// `.` と `..` を字句的に畳み込み、区切りを `/` にそろえる。
fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let (prefix, rest) = match unified.find('/') {
        Some(0) => ("/".to_string(), &unified[1..]),
        Some(i) if cfg!(windows) && unified[..i].ends_with(':') => {
            (format!("{}/", &unified[..i]), &unified[i + 1..])
        }
        _ => (String::new(), unified.as_str()),
    };
    let mut parts: Vec<&str> = Vec::new();
    for comp in rest.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    let joined = parts.join("/");
    if prefix.is_empty() && joined.is_empty() {
        ".".to_string()
    } else {
        format!("{}{}", prefix, joined)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn table() -> FdTable {
        FdTable::new(64, "/")
    }

    #[test]
    fn open_nonexistent_is_enoent() {
        let t = table();
        let err = t.open("/nonexistent", OpenFlags::READ, 0).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }

    #[test]
    fn open_uses_lowest_free_slot() {
        let t = table();
        assert_eq!(t.open("/dev/null", OpenFlags::READ, 0).unwrap(), 0);
        assert_eq!(t.open("/dev/null", OpenFlags::READ, 0).unwrap(), 1);
        assert_eq!(t.open("/dev/null", OpenFlags::READ, 0).unwrap(), 2);
        t.close(1).unwrap();
        assert_eq!(t.open("/dev/null", OpenFlags::READ, 0).unwrap(), 1);
        assert_eq!(t.open_min("/dev/null", OpenFlags::READ, 0, 10).unwrap(), 10);
        assert_eq!(t.open_fds(), vec![0, 1, 2, 10]);
    }

    #[test]
    fn close_invalid_is_ebadf() {
        let t = table();
        assert_eq!(t.close(3).unwrap_err().errno(), Some(Errno::EBADF));
        assert_eq!(t.close(-1).unwrap_err().errno(), Some(Errno::EBADF));
        let fd = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        t.close(fd).unwrap();
        assert_eq!(t.close(fd).unwrap_err().errno(), Some(Errno::EBADF));
    }

    #[test]
    fn dup_variants_leave_source_intact() {
        let t = table();
        let fd = t.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
        t.set_close_on_exec(fd, true).unwrap();
        let d1 = t.dup(fd).unwrap();
        let d2 = t.dup_above(fd, 20).unwrap();
        let d3 = t.dup_onto(fd, 7).unwrap();
        assert_eq!((d1, d2, d3), (1, 20, 7));
        assert!(t.get_flags(fd).unwrap().1.contains(ShFlags::CLOEXEC));
        assert!(!t.get_flags(d1).unwrap().1.contains(ShFlags::CLOEXEC));
        let natives: BTreeSet<_> = [fd, d1, d2, d3]
            .iter()
            .map(|&f| t.native_of(f).unwrap())
            .collect();
        assert_eq!(natives.len(), 4);
    }

    #[test]
    fn dup_onto_replaces_open_target() {
        let t = table();
        let a = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        let b = t.open("/dev/zero", OpenFlags::READ, 0).unwrap();
        assert_eq!(t.dup_onto(b, a).unwrap(), a);
        let mut buf = [1u8; 4];
        assert_eq!(t.read(a, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0; 4]);
        assert_eq!(t.dup_onto(b, b).unwrap(), b);
        assert_eq!(t.dup_onto(b, 64).unwrap_err().errno(), Some(Errno::EBADF));
    }

    #[test]
    fn move_above_keeps_cloexec_and_frees_source() {
        let t = table();
        let fd = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        t.set_close_on_exec(fd, true).unwrap();
        let moved = t.move_above(fd, 10).unwrap();
        assert_eq!(moved, 10);
        assert!(t.get_flags(moved).unwrap().1.contains(ShFlags::CLOEXEC));
        assert_eq!(t.open_fds(), vec![10]);
        assert_eq!(t.move_above(moved, 5).unwrap(), 10);
    }

    #[test]
    fn table_exhaustion_is_emfile() {
        let t = FdTable::new(4, "/");
        for _ in 0..4 {
            t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        }
        let err = t.open("/dev/null", OpenFlags::READ, 0).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EMFILE));
        assert_eq!(t.dup(0).unwrap_err().errno(), Some(Errno::EMFILE));
        assert_eq!(t.size(), 4);
    }

    #[test]
    fn size_never_shrinks() {
        let t = table();
        let fd = t.open_min("/dev/null", OpenFlags::READ, 0, 40).unwrap();
        let size = t.size();
        assert!(size > 40);
        t.close(fd).unwrap();
        assert_eq!(t.size(), size);
    }

    #[test]
    fn pipe_through_table() {
        let t = table();
        let (r, w) = t.pipe().unwrap();
        assert_eq!((r, w), (0, 1));
        assert!(t.get_flags(r).unwrap().1.contains(ShFlags::PIPE));
        t.write_all(w, b"hello").unwrap();
        t.close(w).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(t.read(r, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn relative_paths_use_table_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("file.txt"), b"data").unwrap();

        let t = FdTable::new(16, dir.path().to_string_lossy().into_owned());
        t.chdir("sub").unwrap();
        assert_eq!(t.cwd(), sub.to_string_lossy());
        let fd = t.open("file.txt", OpenFlags::READ, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(t.read(fd, &mut buf).unwrap(), 4);
        assert!(t.stat("file.txt").unwrap().is_file());

        assert_eq!(
            t.chdir("file.txt").unwrap_err().errno(),
            Some(Errno::ENOTDIR)
        );
        assert_eq!(t.chdir("missing").unwrap_err().errno(), Some(Errno::ENOENT));
        assert_eq!(t.cwd(), sub.to_string_lossy());
    }

    #[test]
    fn make_path_normalizes() {
        let t = FdTable::new(4, "/usr/local");
        assert_eq!(t.make_path("bin"), "/usr/local/bin");
        assert_eq!(t.make_path("../lib/./x"), "/usr/lib/x");
        assert_eq!(t.make_path("/etc//passwd"), "/etc/passwd");
        assert_eq!(t.make_path("../../../.."), "/");
    }

    #[test]
    fn duplicate_copies_flags_with_fresh_natives() {
        let t = table();
        let fd = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        t.set_close_on_exec(fd, true).unwrap();
        let copy = t.duplicate().unwrap();
        assert_eq!(copy.open_fds(), vec![fd]);
        assert_eq!(copy.get_flags(fd).unwrap(), t.get_flags(fd).unwrap());
        assert_ne!(copy.native_of(fd).unwrap(), t.native_of(fd).unwrap());
        assert_eq!(copy.cwd(), t.cwd());
    }

    #[test]
    fn prepare_for_exec_skips_cloexec_and_trace() {
        let t = table();
        let a = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        let b = t.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
        let c = t.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
        let d = t.open_min("/dev/null", OpenFlags::WRITE, 0, 5).unwrap();
        t.set_close_on_exec(b, true).unwrap();
        t.set_trace(d).unwrap();

        let handles = t.prepare_for_exec().unwrap();
        assert_eq!(handles.handles.len(), 3);
        assert_eq!(handles.handles[a as usize], Some(t.native_of(a).unwrap()));
        assert_eq!(handles.handles[b as usize], None);
        assert_eq!(handles.handles[c as usize], Some(t.native_of(c).unwrap()));
        assert!(t.get_flags(a).unwrap().1.contains(ShFlags::INHERIT));

        t.finalize_after_exec(false);
        assert!(!t.get_flags(a).unwrap().1.contains(ShFlags::INHERIT));
        assert_eq!(t.open_fds(), vec![a, b, c, d]);

        t.prepare_for_exec().unwrap();
        t.finalize_after_exec(true);
        assert_eq!(t.open_fds(), vec![b, d]);
    }

    #[test]
    fn prepare_for_fork_includes_cloexec() {
        let t = table();
        let a = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        let b = t.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
        t.set_close_on_exec(b, true).unwrap();
        let handles = t.prepare_for_fork().unwrap();
        assert_eq!(handles.handles.iter().flatten().count(), 2);
        t.restore_inheritance();
        assert!(!t.get_flags(a).unwrap().1.contains(ShFlags::INHERIT));
        assert!(!t.get_flags(b).unwrap().1.contains(ShFlags::INHERIT));
    }

    #[test]
    fn teardown_spares_trace_fd() {
        let t = table();
        let _a = t.open("/dev/null", OpenFlags::READ, 0).unwrap();
        let trace = t.open("/dev/null", OpenFlags::WRITE, 0).unwrap();
        t.set_trace(trace).unwrap();
        let native = t.native_of(trace).unwrap();
        t.close_all();
        assert_eq!(t.open_fds(), vec![trace]);
        drop(t);
        // トレース fd は teardown の対象外なので、ネイティブはまだ有効。
        assert!(native::is_valid(native));
        native::close(native).unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Open,
        Dup(usize),
        DupOnto(usize, i32),
        Close(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Open),
            any::<usize>().prop_map(Op::Dup),
            (any::<usize>(), 0..12i32).prop_map(|(i, t)| Op::DupOnto(i, t)),
            any::<usize>().prop_map(Op::Close),
        ]
    }

    proptest! {
        #[test]
        fn open_set_matches_model(ops in proptest::collection::vec(op(), 1..60)) {
            let t = FdTable::new(16, "/");
            let mut model: BTreeSet<i32> = BTreeSet::new();
            for op in ops {
                let open: Vec<i32> = model.iter().copied().collect();
                match op {
                    Op::Open => {
                        if let Ok(fd) = t.open("/dev/null", OpenFlags::READ, 0) {
                            prop_assert!(model.insert(fd));
                        }
                    }
                    Op::Dup(i) if !open.is_empty() => {
                        if let Ok(fd) = t.dup(open[i % open.len()]) {
                            prop_assert!(model.insert(fd));
                        }
                    }
                    Op::DupOnto(i, target) if !open.is_empty() => {
                        let fd = t.dup_onto(open[i % open.len()], target).unwrap();
                        model.insert(fd);
                    }
                    Op::Close(i) if !open.is_empty() => {
                        let fd = open[i % open.len()];
                        t.close(fd).unwrap();
                        model.remove(&fd);
                    }
                    _ => {}
                }
                let actual: BTreeSet<i32> = t.open_fds().into_iter().collect();
                prop_assert_eq!(&actual, &model);
                let natives: BTreeSet<RawHandle> =
                    t.entries().iter().map(|e| e.native).collect();
                prop_assert_eq!(natives.len(), model.len());
            }
        }
    }
}
