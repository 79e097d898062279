//! ネイティブ OS 境界。
//!
//! fd テーブル・ヒープ・fork/exec が必要とする OS 操作をプラットフォームごとに実装する。
//! 上位モジュールはこのモジュールの関数だけを呼び、`libc` / `windows-sys` を直接は触らない
//! （シグナル処分と `posix_spawn` ラッパーを除く）。
//!
//! | 関数群 | Unix | Windows |
//! |--------|------|---------|
//! | ハンドル操作 | `open` / `dup` / `close` / `read` / `write` / `lseek` | `CreateFileW` / `DuplicateHandle` / `ReadFile` / ... |
//! | 継承制御 | `FD_CLOEXEC` | `HANDLE_FLAG_INHERIT`（コンソールは複製し直す） |
//! | メモリ領域 | `mmap` / `munmap` | `VirtualAlloc` / `VirtualFree` |
//! | プロセス | `fork` / `execve` / `waitpid` / `setpgid` / `tcsetpgrp` | `CreateProcessW` / `WaitForSingleObject` / `GetExitCodeProcess` |
//!
//! すべての失敗は [`Errno`](crate::error::Errno) で返す。

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
pub mod windows;
#[cfg(windows)]
pub use self::windows::*;

/// `wait_pid` の待機対象。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// 特定のプロセス。
    Pid(crate::shell::Pid),
    /// プロセスグループ内の任意のプロセス（`waitpid(-pgid, ...)`）。
    Group(crate::shell::Pid),
}
