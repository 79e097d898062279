//! シグナル処分テーブルとプロセスレベルのシグナル受信。
//!
//! OS のハンドラ（[`record_signal`]）は非同期シグナル安全な操作しかしない:
//! プロセス全体のビットマスク [`RECEIVED`] にシグナル番号を立てるだけ。
//! 評価器は安全な地点で [`poll_signals`] を呼び、受信済みシグナルを
//! 現在の [`ShellInstance`] の割り込み遅延状態（[`intr`](crate::intr)）へ移す。
//!
//! スレッドモードの子コンテキストはプロセスを共有するため、処分の変更は
//! テーブル上の記録だけにとどめ、OS のハンドラは触らない。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Errno, Error, Result};
use crate::shell::ShellInstance;

#[cfg(unix)]
pub use libc::{
    SIGCHLD, SIGCONT, SIGHUP, SIGINT, SIGKILL, SIGPIPE, SIGQUIT, SIGSTOP, SIGTERM, SIGTSTP,
    SIGTTIN, SIGTTOU,
};

// Windows には POSIX のジョブ制御シグナルがないため、BSD の番号を流用する。
#[cfg(windows)]
mod numbers {
    pub const SIGHUP: i32 = 1;
    pub const SIGINT: i32 = 2;
    pub const SIGQUIT: i32 = 3;
    pub const SIGKILL: i32 = 9;
    pub const SIGPIPE: i32 = 13;
    pub const SIGTERM: i32 = 15;
    pub const SIGSTOP: i32 = 17;
    pub const SIGTSTP: i32 = 18;
    pub const SIGCONT: i32 = 19;
    pub const SIGCHLD: i32 = 20;
    pub const SIGTTIN: i32 = 21;
    pub const SIGTTOU: i32 = 22;
}
#[cfg(windows)]
pub use numbers::*;

/// 扱うシグナル番号の上限（排他）。ビットマスクが 64 ビットのため。
pub const NSIG: usize = 64;

/// OS ハンドラが受信シグナルを記録するビットマスク。
static RECEIVED: AtomicU64 = AtomicU64::new(0);

/// シグナルの処分。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Default,
    Ignore,
    /// [`record_signal`] で受信して評価器に渡す（`trap` 相当）。
    Catch,
}

/// シェルコンテキストごとのシグナル処分テーブル。
#[derive(Debug)]
pub struct SignalTable {
    dispositions: Mutex<[Disposition; NSIG]>,
    /// OS のハンドラを変更してよいか。スレッドモードの子では `false`。
    owns_process: bool,
}

impl SignalTable {
    /// プロセスを所有するコンテキスト用のテーブル。
    pub fn new() -> Self {
        Self {
            dispositions: Mutex::new([Disposition::Default; NSIG]),
            owns_process: true,
        }
    }

    /// fork した子のテーブル。`Catch` は `Default` に戻し、`Ignore` は引き継ぐ。
    pub fn for_child(&self, owns_process: bool) -> Self {
        let mut table = *self.lock();
        for d in table.iter_mut() {
            if *d == Disposition::Catch {
                *d = Disposition::Default;
            }
        }
        Self {
            dispositions: Mutex::new(table),
            owns_process,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [Disposition; NSIG]> {
        self.dispositions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn disposition(&self, signo: i32) -> Disposition {
        usize::try_from(signo)
            .ok()
            .filter(|&n| n > 0 && n < NSIG)
            .map(|n| self.lock()[n])
            .unwrap_or(Disposition::Default)
    }

    /// 処分を変更する。プロセスを所有していれば OS のハンドラも合わせて設定する。
    pub fn set(&self, signo: i32, disposition: Disposition) -> Result<()> {
        let index = usize::try_from(signo)
            .ok()
            .filter(|&n| n > 0 && n < NSIG)
            .ok_or_else(|| Error::os(format!("signal {}", signo), Errno::EINVAL))?;
        let mut table = self.lock();
        if table[index] == disposition {
            return Ok(());
        }
        if self.owns_process {
            install(signo, disposition)?;
        }
        table[index] = disposition;
        debug!(signo, ?disposition, "signal disposition changed");
        Ok(())
    }

    /// 対話シェルの初期処分。SIGINT は捕捉して評価器に渡し、SIGQUIT / SIGTERM は無視する。
    pub fn init_interactive(&self) -> Result<()> {
        self.set(SIGINT, Disposition::Catch)?;
        self.set(SIGQUIT, Disposition::Ignore)?;
        self.set(SIGTERM, Disposition::Ignore)
    }

    /// ジョブ制御シグナルと SIGINT / SIGQUIT を既定に戻す（fork 直後の子用）。
    pub fn reset_for_child(&self) -> Result<()> {
        for sig in [SIGINT, SIGQUIT, SIGTSTP, SIGTTIN, SIGTTOU] {
            self.set(sig, Disposition::Default)?;
        }
        Ok(())
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// OS のシグナルハンドラ。受信ビットを立てるだけ。
extern "C" fn record_signal(signo: libc::c_int) {
    if signo > 0 && (signo as usize) < NSIG {
        RECEIVED.fetch_or(1u64 << signo, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn install(signo: i32, disposition: Disposition) -> Result<()> {
    let handler = match disposition {
        Disposition::Default => libc::SIG_DFL,
        Disposition::Ignore => libc::SIG_IGN,
        Disposition::Catch => record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
    };
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler;
        act.sa_flags = 0;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(signo, &act, std::ptr::null_mut()) != 0 {
            return Err(Error::last_os(format!("sigaction({})", signo)));
        }
    }
    Ok(())
}

#[cfg(windows)]
fn install(signo: i32, disposition: Disposition) -> Result<()> {
    // CRT の signal() が扱えるのは SIGINT などごく一部。それ以外は記録のみ。
    if signo != SIGINT && signo != libc::SIGTERM {
        return Ok(());
    }
    let handler = match disposition {
        Disposition::Default => libc::SIG_DFL,
        Disposition::Ignore => libc::SIG_IGN,
        Disposition::Catch => record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
    };
    unsafe {
        if libc::signal(signo, handler) == libc::SIG_ERR {
            return Err(Error::last_os(format!("signal({})", signo)));
        }
    }
    Ok(())
}

/// OS ハンドラが記録したシグナルを `shell` の割り込み遅延状態に移す。
///
/// 戻り値は移したシグナルの数。
pub fn poll_signals(shell: &ShellInstance) -> usize {
    let mask = RECEIVED.swap(0, Ordering::SeqCst);
    let mut count = 0;
    for signo in (1..NSIG as i32).filter(|n| mask & (1u64 << n) != 0) {
        shell.intr().record(signo);
        count += 1;
    }
    count
}

/// `SIGINT` 形式のシグナル名。
pub fn signal_name(signo: i32) -> String {
    let name = match signo {
        s if s == SIGHUP => "SIGHUP",
        s if s == SIGINT => "SIGINT",
        s if s == SIGQUIT => "SIGQUIT",
        s if s == SIGKILL => "SIGKILL",
        s if s == SIGPIPE => "SIGPIPE",
        s if s == SIGTERM => "SIGTERM",
        s if s == SIGSTOP => "SIGSTOP",
        s if s == SIGTSTP => "SIGTSTP",
        s if s == SIGCONT => "SIGCONT",
        s if s == SIGCHLD => "SIGCHLD",
        s if s == SIGTTIN => "SIGTTIN",
        s if s == SIGTTOU => "SIGTTOU",
        _ => return format!("SIG{}", signo),
    };
    name.to_string()
}

/// シグナル名（`INT` / `SIGINT` / 数字）から番号を引く。
pub fn signal_number(name: &str) -> Option<i32> {
    if let Ok(n) = name.parse::<i32>() {
        return (n > 0 && (n as usize) < NSIG).then_some(n);
    }
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    (1..NSIG as i32).find(|&n| signal_name(n) == format!("SIG{}", bare))
}

/// ジョブ表示用のシグナル説明（`strsignal` 相当）。
pub fn signal_description(signo: i32) -> String {
    let text = match signo {
        s if s == SIGHUP => "Hangup",
        s if s == SIGINT => "Interrupt",
        s if s == SIGQUIT => "Quit",
        s if s == SIGKILL => "Killed",
        s if s == SIGPIPE => "Broken pipe",
        s if s == SIGTERM => "Terminated",
        s if s == SIGSTOP => "Stopped (signal)",
        s if s == SIGTSTP => "Stopped",
        s if s == SIGTTIN => "Stopped (tty input)",
        s if s == SIGTTOU => "Stopped (tty output)",
        _ => return format!("Signal {}", signo),
    };
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(signal_name(SIGINT), "SIGINT");
        assert_eq!(signal_number("INT"), Some(SIGINT));
        assert_eq!(signal_number("sigterm"), Some(SIGTERM));
        assert_eq!(signal_number("9"), Some(9));
        assert_eq!(signal_number("BOGUS"), None);
        assert_eq!(signal_number("0"), None);
    }

    #[test]
    fn descriptions() {
        assert_eq!(signal_description(SIGINT), "Interrupt");
        assert_eq!(signal_description(SIGKILL), "Killed");
        assert_eq!(signal_description(63), "Signal 63");
    }

    #[test]
    fn child_table_resets_catches_keeps_ignores() {
        let parent = SignalTable {
            dispositions: Mutex::new([Disposition::Default; NSIG]),
            owns_process: false,
        };
        parent.set(SIGINT, Disposition::Catch).unwrap();
        parent.set(SIGQUIT, Disposition::Ignore).unwrap();
        let child = parent.for_child(false);
        assert_eq!(child.disposition(SIGINT), Disposition::Default);
        assert_eq!(child.disposition(SIGQUIT), Disposition::Ignore);
    }

    #[test]
    fn interactive_defaults() {
        let table = SignalTable::new().for_child(false);
        table.init_interactive().unwrap();
        assert_eq!(table.disposition(SIGINT), Disposition::Catch);
        assert_eq!(table.disposition(SIGQUIT), Disposition::Ignore);
        assert_eq!(table.disposition(SIGTERM), Disposition::Ignore);
        assert_eq!(table.disposition(SIGTSTP), Disposition::Default);
    }

    #[test]
    fn invalid_signal_rejected() {
        let table = SignalTable::new().for_child(false);
        assert!(table.set(0, Disposition::Ignore).is_err());
        assert!(table.set(NSIG as i32, Disposition::Ignore).is_err());
        assert_eq!(table.disposition(-3), Disposition::Default);
    }
}
