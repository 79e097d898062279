//! エラー型。
//!
//! OS のエラーはすべて POSIX 形式の [`Errno`] に正規化する。Windows のエラーコードは
//! 固定の変換表（[`Errno::from_win32`]）で errno に対応付ける。変換表は純粋なデータなので
//! 全プラットフォームでコンパイルされ、Unix 上でもテストできる。
//!
//! ## 分類
//!
//! | 種別 | バリアント | 扱い |
//! |------|-----------|------|
//! | 資源枯渇 | [`Error::OutOfMemory`], [`Error::TableFull`] | 呼び出し元に返し、通常は現在のコマンドを失敗させる |
//! | OS エラー | [`Error::Os`] | errno をそのままシェルのエラーメッセージにする |
//! | プロセス制御 | [`Error::JobControl`] | ジョブ制御の継続不能として扱う |
//! | 内部不整合 | [`Error::Internal`] | 二重解放・閉じた fd の使用など、コア自身のバグ |
//!
//! 外部コマンド起動の失敗は [`ExecError`] で表し、終了ステータス 126 / 127 / 2 に対応付ける。

use std::fmt;
use std::io;

/// POSIX errno 値。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const ESRCH: Errno = Errno(libc::ESRCH);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const E2BIG: Errno = Errno(libc::E2BIG);
    pub const ENOEXEC: Errno = Errno(libc::ENOEXEC);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const ECHILD: Errno = Errno(libc::ECHILD);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const EXDEV: Errno = Errno(libc::EXDEV);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EISDIR: Errno = Errno(libc::EISDIR);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EMFILE: Errno = Errno(libc::EMFILE);
    pub const ENOTTY: Errno = Errno(libc::ENOTTY);
    pub const ENOSPC: Errno = Errno(libc::ENOSPC);
    pub const ESPIPE: Errno = Errno(libc::ESPIPE);
    pub const EPIPE: Errno = Errno(libc::EPIPE);
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ENOTEMPTY: Errno = Errno(libc::ENOTEMPTY);

    /// 直前の OS エラーを errno として取得する。
    #[cfg(unix)]
    pub fn last() -> Errno {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// 直前の OS エラーを errno として取得する（`GetLastError` を変換表で変換）。
    #[cfg(windows)]
    pub fn last() -> Errno {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Errno::from_win32(code as u32)
    }

    /// `std::io::Error` を errno に変換する。
    ///
    /// raw OS エラーがあればそれを優先し（Windows では変換表を通す）、
    /// なければ [`io::ErrorKind`] から推定する。
    pub fn from_io(err: &io::Error) -> Errno {
        if let Some(raw) = err.raw_os_error() {
            #[cfg(windows)]
            return Errno::from_win32(raw as u32);
            #[cfg(not(windows))]
            return Errno(raw);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Errno::ENOENT,
            io::ErrorKind::PermissionDenied => Errno::EACCES,
            io::ErrorKind::AlreadyExists => Errno::EEXIST,
            io::ErrorKind::InvalidInput => Errno::EINVAL,
            io::ErrorKind::BrokenPipe => Errno::EPIPE,
            io::ErrorKind::Interrupted => Errno::EINTR,
            io::ErrorKind::OutOfMemory => Errno::ENOMEM,
            _ => Errno::EIO,
        }
    }

    /// Win32 エラーコードを errno に変換する。表にないコードは `EINVAL`。
    ///
    /// 19〜36 の書き込み保護・共有違反系はまとめて `EACCES`、
    /// 188〜202 の実行形式エラーはまとめて `ENOEXEC` になる。
    pub fn from_win32(code: u32) -> Errno {
        if let Ok(i) = WIN32_ERRNO.binary_search_by_key(&code, |&(c, _)| c) {
            return Errno(WIN32_ERRNO[i].1);
        }
        match code {
            19..=36 => Errno::EACCES,
            188..=202 => Errno::ENOEXEC,
            _ => Errno::EINVAL,
        }
    }

    /// `strerror` 相当のメッセージ。
    pub fn message(self) -> String {
        let text = match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::EIO => "Input/output error",
            Errno::E2BIG => "Argument list too long",
            Errno::ENOEXEC => "Exec format error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Resource temporarily unavailable",
            Errno::ENOMEM => "Cannot allocate memory",
            Errno::EACCES => "Permission denied",
            Errno::EEXIST => "File exists",
            Errno::EXDEV => "Invalid cross-device link",
            Errno::ENOTDIR => "Not a directory",
            Errno::EISDIR => "Is a directory",
            Errno::EINVAL => "Invalid argument",
            Errno::EMFILE => "Too many open files",
            Errno::ENOTTY => "Inappropriate ioctl for device",
            Errno::ENOSPC => "No space left on device",
            Errno::ESPIPE => "Illegal seek",
            Errno::EPIPE => "Broken pipe",
            Errno::ENAMETOOLONG => "File name too long",
            Errno::ENOSYS => "Function not implemented",
            Errno::ENOTEMPTY => "Directory not empty",
            Errno(n) => return format!("Unknown error {}", n),
        };
        text.to_string()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Win32 エラーコード → errno 変換表。コード昇順（二分探索するため）。
const WIN32_ERRNO: &[(u32, i32)] = &[
    (1, libc::EINVAL),    // ERROR_INVALID_FUNCTION
    (2, libc::ENOENT),    // ERROR_FILE_NOT_FOUND
    (3, libc::ENOENT),    // ERROR_PATH_NOT_FOUND
    (4, libc::EMFILE),    // ERROR_TOO_MANY_OPEN_FILES
    (5, libc::EACCES),    // ERROR_ACCESS_DENIED
    (6, libc::EBADF),     // ERROR_INVALID_HANDLE
    (7, libc::ENOMEM),    // ERROR_ARENA_TRASHED
    (8, libc::ENOMEM),    // ERROR_NOT_ENOUGH_MEMORY
    (9, libc::ENOMEM),    // ERROR_INVALID_BLOCK
    (10, libc::E2BIG),    // ERROR_BAD_ENVIRONMENT
    (11, libc::ENOEXEC),  // ERROR_BAD_FORMAT
    (12, libc::EINVAL),   // ERROR_INVALID_ACCESS
    (13, libc::EINVAL),   // ERROR_INVALID_DATA
    (14, libc::ENOMEM),   // ERROR_OUTOFMEMORY
    (15, libc::ENOENT),   // ERROR_INVALID_DRIVE
    (16, libc::EACCES),   // ERROR_CURRENT_DIRECTORY
    (17, libc::EXDEV),    // ERROR_NOT_SAME_DEVICE
    (18, libc::ENOENT),   // ERROR_NO_MORE_FILES
    (53, libc::ENOENT),   // ERROR_BAD_NETPATH
    (65, libc::EACCES),   // ERROR_NETWORK_ACCESS_DENIED
    (67, libc::ENOENT),   // ERROR_BAD_NET_NAME
    (80, libc::EEXIST),   // ERROR_FILE_EXISTS
    (82, libc::EACCES),   // ERROR_CANNOT_MAKE
    (83, libc::EACCES),   // ERROR_FAIL_I24
    (87, libc::EINVAL),   // ERROR_INVALID_PARAMETER
    (89, libc::EAGAIN),   // ERROR_NO_PROC_SLOTS
    (108, libc::EACCES),  // ERROR_DRIVE_LOCKED
    (109, libc::EPIPE),   // ERROR_BROKEN_PIPE
    (112, libc::ENOSPC),  // ERROR_DISK_FULL
    (114, libc::EBADF),   // ERROR_INVALID_TARGET_HANDLE
    (128, libc::ECHILD),  // ERROR_WAIT_NO_CHILDREN
    (129, libc::ECHILD),  // ERROR_CHILD_NOT_COMPLETE
    (130, libc::EBADF),   // ERROR_DIRECT_ACCESS_HANDLE
    (131, libc::EINVAL),  // ERROR_NEGATIVE_SEEK
    (132, libc::ESPIPE),  // ERROR_SEEK_ON_DEVICE
    (145, libc::ENOTEMPTY), // ERROR_DIR_NOT_EMPTY
    (158, libc::EACCES),  // ERROR_NOT_LOCKED
    (161, libc::ENOENT),  // ERROR_BAD_PATHNAME
    (164, libc::EAGAIN),  // ERROR_MAX_THRDS_REACHED
    (167, libc::EACCES),  // ERROR_LOCK_FAILED
    (183, libc::EEXIST),  // ERROR_ALREADY_EXISTS
    (206, libc::ENAMETOOLONG), // ERROR_FILENAME_EXCED_RANGE
    (215, libc::EAGAIN),  // ERROR_NESTING_NOT_ALLOWED
    (232, libc::EPIPE),   // ERROR_NO_DATA
    (267, libc::ENOTDIR), // ERROR_DIRECTORY
    (1816, libc::ENOMEM), // ERROR_NOT_ENOUGH_QUOTA
];

// ── Error ───────────────────────────────────────────────────────────

/// コア全体で使うエラー型。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OS 呼び出しの失敗。`subject` はパスや操作名。
    #[error("{subject}: {errno}")]
    Os { subject: String, errno: Errno },

    /// ヒープの確保失敗。
    #[error("out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    /// fd テーブルに空きスロットがなく、拡張もできない（`EMFILE`）。
    #[error("too many open files")]
    TableFull,

    /// プロセスグループ / 制御端末の操作失敗。ジョブ制御はこれ以上続行できない。
    #[error("job control: {0}")]
    JobControl(String),

    /// `%` 指定に一致するジョブがない。
    #[error("{0}: no such job")]
    NoSuchJob(String),

    /// `%pat` / `%?pat` が複数のジョブに一致した。
    #[error("{0}: ambiguous job spec")]
    AmbiguousJob(String),

    /// 疑似 fork で子プロセスの同一アドレスにヒープを配置できなかった。
    #[error("pseudo-fork: address range {addr:#x}+{size:#x} unavailable")]
    AddressUnavailable { addr: usize, size: usize },

    /// 実行コンテキストの生成失敗（スレッド生成、子プロセスの起動など）。
    #[error("fork: {0}")]
    Fork(String),

    /// コア内部の不変条件違反（二重解放など）。ユーザーの誤りではない。
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn os(subject: impl Into<String>, errno: Errno) -> Self {
        Self::Os {
            subject: subject.into(),
            errno,
        }
    }

    /// 直前の OS エラーから [`Error::Os`] を作る。
    pub fn last_os(subject: impl Into<String>) -> Self {
        Self::os(subject, Errno::last())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// このエラーに対応する errno。対応がないものは `None`。
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os { errno, .. } => Some(*errno),
            Self::OutOfMemory { .. } => Some(Errno::ENOMEM),
            Self::TableFull => Some(Errno::EMFILE),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ── ExecError ───────────────────────────────────────────────────────

/// 外部コマンドへの置き換えに失敗したことを表す。
///
/// `exec_image` は成功すれば戻らないため、戻り値は常にこの型になる。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{command}: {}", self.reason())]
pub struct ExecError {
    /// コマンド名（エラーメッセージ用）。
    pub command: String,
    /// 最も意味のある失敗理由。`PATH` 検索中の `ENOENT` は他の errno に上書きされる。
    pub errno: Errno,
}

impl ExecError {
    /// 終了ステータス。126 = 実行不可、127 = 見つからない、2 = その他。
    pub fn status(&self) -> i32 {
        match self.errno {
            Errno::EACCES => 126,
            Errno::ENOENT | Errno::ENOTDIR => 127,
            _ => 2,
        }
    }

    fn reason(&self) -> String {
        match self.errno {
            Errno::ENOENT | Errno::ENOTDIR => "command not found".to_string(),
            Errno::EACCES => "permission denied".to_string(),
            e => e.message(),
        }
    }
}

/// シグナル `sig` で終了したプロセスの終了ステータス（128 + n）。
pub fn exit_status_for_signal(sig: i32) -> i32 {
    128 + sig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win32_table_is_sorted() {
        for pair in WIN32_ERRNO.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} >= {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn win32_common_codes() {
        assert_eq!(Errno::from_win32(2), Errno::ENOENT);
        assert_eq!(Errno::from_win32(3), Errno::ENOENT);
        assert_eq!(Errno::from_win32(4), Errno::EMFILE);
        assert_eq!(Errno::from_win32(5), Errno::EACCES);
        assert_eq!(Errno::from_win32(6), Errno::EBADF);
        assert_eq!(Errno::from_win32(109), Errno::EPIPE);
        assert_eq!(Errno::from_win32(267), Errno::ENOTDIR);
    }

    #[test]
    fn win32_ranges_and_default() {
        assert_eq!(Errno::from_win32(32), Errno::EACCES); // ERROR_SHARING_VIOLATION
        assert_eq!(Errno::from_win32(193), Errno::ENOEXEC); // ERROR_BAD_EXE_FORMAT
        assert_eq!(Errno::from_win32(99999), Errno::EINVAL);
    }

    #[test]
    fn io_error_kind_fallback() {
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Errno::from_io(&e), Errno::ENOENT);
        let e = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert_eq!(Errno::from_io(&e), Errno::EACCES);
    }

    #[cfg(unix)]
    #[test]
    fn io_error_raw_os() {
        let e = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(Errno::from_io(&e), Errno::EMFILE);
    }

    #[test]
    fn exec_status_taxonomy() {
        let e = |errno| ExecError {
            command: "foo".into(),
            errno,
        };
        assert_eq!(e(Errno::ENOENT).status(), 127);
        assert_eq!(e(Errno::ENOTDIR).status(), 127);
        assert_eq!(e(Errno::EACCES).status(), 126);
        assert_eq!(e(Errno::ENOEXEC).status(), 2);
        assert_eq!(e(Errno::ENOENT).to_string(), "foo: command not found");
        assert_eq!(e(Errno::EACCES).to_string(), "foo: permission denied");
    }

    #[test]
    fn error_errno_mapping() {
        assert_eq!(Error::TableFull.errno(), Some(Errno::EMFILE));
        assert_eq!(
            Error::OutOfMemory { requested: 8 }.errno(),
            Some(Errno::ENOMEM)
        );
        assert_eq!(Error::os("x", Errno::EBADF).errno(), Some(Errno::EBADF));
        assert_eq!(Error::JobControl("tty".into()).errno(), None);
        assert_eq!(
            Error::os("/nonexistent", Errno::ENOENT).to_string(),
            "/nonexistent: No such file or directory"
        );
    }

    #[test]
    fn signal_status() {
        assert_eq!(exit_status_for_signal(2), 130);
        assert_eq!(exit_status_for_signal(9), 137);
    }
}
