//! 外部プログラムによる置き換え（`exec`）。
//!
//! [`exec_image`] はコマンド名を `PATH` で探し、見つかった候補で現在のコンテキストを置き換える。
//! 成功すれば戻らない。
//!
//! - 実プロセス（Unix）: fd テーブルの配置をプロセスの fd 0..N に敷いてから `execve`
//! - スレッド / Windows: 置き換える像がないので、同じ配置で子プロセスを起動して待ち、
//!   その終了ステータスでコンテキストを終える
//!
//! `ENOEXEC`（実行形式でない）なら `#!` 行のインタプリタ、なければ設定のスクリプトシェルで実行し直す。

use std::io::Read as _;

use tracing::debug;

use crate::error::{Errno, ExecError};
use crate::fd::FdTable;
use crate::native::{self, WaitTarget};
use crate::shell::{ContextKind, Pid, ShellInstance};

#[cfg(unix)]
const PATH_SEP: char = ':';
#[cfg(windows)]
const PATH_SEP: char = ';';

/// `access(2)` の実行可能ビット。
#[cfg(unix)]
const X_OK: i32 = 1;

/// `#!` 行として読む最大バイト数。
const SHEBANG_MAX: usize = 256;

/// 現在のプロセス環境を `KEY=VALUE` の列にする。
pub fn environ() -> Vec<String> {
    std::env::vars_os()
        .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
        .collect()
}

fn has_separator(name: &str) -> bool {
    name.contains('/') || (cfg!(windows) && name.contains('\\'))
}

/// `path` の各要素に `name` を付けた候補を順に返す。空の要素はカレントディレクトリ。
pub fn path_search<'a>(path: &'a str, name: &'a str) -> impl Iterator<Item = String> + 'a {
    path.split(PATH_SEP).map(move |dir| {
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", dir.trim_end_matches('/'), name)
        }
    })
}

fn check_executable(fds: &FdTable, candidate: &str) -> Result<(), Errno> {
    let meta = fds.stat(candidate).map_err(|e| e.errno().unwrap_or(Errno::ENOENT))?;
    if !meta.is_file() {
        return Err(Errno::EACCES);
    }
    #[cfg(unix)]
    fds.access(candidate, X_OK)
        .map_err(|e| e.errno().unwrap_or(Errno::EACCES))?;
    Ok(())
}

/// コマンド名を実行可能なファイルの絶対パスに解決する。
///
/// 区切りを含む名前は探索せずにテーブルの cwd で解決する。
/// 見つからなければ `ENOENT`、見つかったがどれも実行できなければ最後の理由（`EACCES` など）。
pub fn find_command(fds: &FdTable, name: &str, path: &str) -> Result<String, Errno> {
    if name.is_empty() {
        return Err(Errno::ENOENT);
    }
    if has_separator(name) {
        check_executable(fds, name)?;
        return Ok(fds.make_path(name));
    }
    let mut errno = Errno::ENOENT;
    for candidate in path_search(path, name) {
        match check_executable(fds, &candidate) {
            Ok(()) => return Ok(fds.make_path(&candidate)),
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {}
            Err(e) => errno = e,
        }
    }
    Err(errno)
}

/// `#!` 行を解釈する。インタプリタと、あれば 1 つの引数（行の残り全体）を返す。
pub fn parse_shebang(head: &[u8]) -> Option<(String, Option<String>)> {
    let rest = head.strip_prefix(b"#!")?;
    let line = rest.split(|&b| b == b'\n').next()?;
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches('\r').trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once([' ', '\t']) {
        Some((interp, arg)) => {
            let arg = arg.trim();
            Some((interp.to_string(), (!arg.is_empty()).then(|| arg.to_string())))
        }
        None => Some((line.to_string(), None)),
    }
}

/// 実行形式でなかったファイルを動かす argv を作る。
fn script_argv(shell: &ShellInstance, path: &str, argv: &[String]) -> Vec<String> {
    let mut head = Vec::with_capacity(SHEBANG_MAX);
    if let Ok(f) = std::fs::File::open(path) {
        let _ = f.take(SHEBANG_MAX as u64).read_to_end(&mut head);
    }
    let mut out = match parse_shebang(&head) {
        Some((interp, arg)) => std::iter::once(interp).chain(arg).collect(),
        None => vec![shell.config().script_shell.to_string_lossy().into_owned()],
    };
    out.push(path.to_string());
    out.extend(argv.iter().skip(1).cloned());
    out
}

/// `argv[0]` を `path` で探して現在のコンテキストを置き換える。戻ったら失敗。
///
/// 候補ごとに試し、`ENOENT` / `ENOTDIR` 以外の失敗理由を覚えておく。
/// 実プロセスでは fd の配置を一度敷いたら戻さないので、失敗したら呼び出し側は終了すること。
pub fn exec_image(shell: &ShellInstance, argv: &[String], envp: &[String], path: &str) -> ExecError {
    let Some(name) = argv.first() else {
        return ExecError {
            command: String::new(),
            errno: Errno::ENOENT,
        };
    };
    let fds = shell.fds();
    let candidates: Vec<String> = if has_separator(name) {
        vec![fds.make_path(name)]
    } else {
        path_search(path, name).map(|c| fds.make_path(&c)).collect()
    };

    let mut layout_installed = false;
    let mut errno = Errno::ENOENT;
    for candidate in candidates {
        if let Err(e) = check_executable(fds, &candidate) {
            if e != Errno::ENOENT && e != Errno::ENOTDIR {
                errno = e;
            }
            continue;
        }
        let mut e = run_image(shell, &candidate, argv, envp, &mut layout_installed);
        if e == Errno::ENOEXEC {
            let script = script_argv(shell, &candidate, argv);
            let interp = script[0].clone();
            debug!(path = %candidate, interp = %interp, "running as script");
            e = run_image(shell, &interp, &script, envp, &mut layout_installed);
        }
        if e != Errno::ENOENT && e != Errno::ENOTDIR {
            errno = e;
        }
    }
    ExecError {
        command: name.clone(),
        errno,
    }
}

/// 1 つの候補で置き換える。戻り値は失敗理由。
fn run_image(
    shell: &ShellInstance,
    path: &str,
    argv: &[String],
    envp: &[String],
    layout_installed: &mut bool,
) -> Errno {
    #[cfg(unix)]
    {
        if shell.kind() == ContextKind::Process {
            return replace_image(shell, path, argv, envp, layout_installed);
        }
    }
    let _ = layout_installed;
    spawn_and_exit(shell, path, argv, envp)
}

#[cfg(unix)]
fn replace_image(
    shell: &ShellInstance,
    path: &str,
    argv: &[String],
    envp: &[String],
    layout_installed: &mut bool,
) -> Errno {
    let fds = shell.fds();
    if !*layout_installed {
        let handles = match fds.prepare_for_exec() {
            Ok(h) => h,
            Err(e) => return e.errno().unwrap_or(Errno::EIO),
        };
        // 仮想 cwd を実プロセスに反映する。置き換え後のプログラムはそこから始まる。
        if let Err(e) = std::env::set_current_dir(fds.cwd()) {
            fds.finalize_after_exec(false);
            return Errno::from_io(&e);
        }
        if let Err(e) = native::install_exec_layout(&handles) {
            fds.finalize_after_exec(false);
            return e;
        }
        *layout_installed = true;
    }
    debug!(path, pid = shell.pid(), "exec");
    let e = native::execve(path, argv, envp);
    debug!(path, errno = %e, "execve failed");
    e
}

/// 子プロセスとして起動し、終了を待ってコンテキストを同じステータスで終える。
fn spawn_and_exit(shell: &ShellInstance, path: &str, argv: &[String], envp: &[String]) -> Errno {
    let fds = shell.fds();
    let handles = match fds.prepare_for_exec() {
        Ok(h) => h,
        Err(e) => return e.errno().unwrap_or(Errno::EIO),
    };
    let spawned = native::spawn_program(path, argv, envp, &handles, &fds.cwd());
    fds.restore_inheritance();
    match spawned {
        Err(e) => e,
        Ok(pid) => {
            debug!(path, pid, context = shell.pid(), "exec by spawn");
            let status = wait_exit(pid);
            shell.exit_shell(status)
        }
    }
}

/// `pid` が終わるまで待ってステータスを返す。
fn wait_exit(pid: Pid) -> i32 {
    loop {
        match native::wait_pid(WaitTarget::Pid(pid), true) {
            Ok(Some((_, state))) if state.is_done() => return state.exit_status(),
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(e) => {
                debug!(pid, errno = %e, "lost exec child");
                return 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn path_search_yields_in_order() {
        let got: Vec<String> = path_search("/bin:/usr/bin:", "ls").collect();
        assert_eq!(got, vec!["/bin/ls", "/usr/bin/ls", "ls"]);
    }

    #[test]
    fn shebang_forms() {
        assert_eq!(
            parse_shebang(b"#!/bin/sh\necho hi\n"),
            Some(("/bin/sh".to_string(), None))
        );
        assert_eq!(
            parse_shebang(b"#! /usr/bin/env  python3 -u\r\n"),
            Some(("/usr/bin/env".to_string(), Some("python3 -u".to_string())))
        );
        assert_eq!(parse_shebang(b"#!\n"), None);
        assert_eq!(parse_shebang(b"echo hi\n"), None);
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use crate::config::Config;
        use crate::eval::Evaluator;
        use crate::arena::NodeRef;
        use crate::fork::thread::{wait_thread, ThreadFork};
        use crate::fork::{fork_with, ForkMode, ForkRequest};
        use crate::job::ProcState;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        fn make_exe(dir: &std::path::Path, name: &str, mode: u32) {
            let p = dir.join(name);
            std::fs::write(&p, "#!/bin/sh\nexit 0\n").unwrap();
            std::fs::set_permissions(&p, std::fs::Permissions::from_mode(mode)).unwrap();
        }

        #[test]
        fn earlier_path_entry_wins() {
            let a = tempfile::tempdir().unwrap();
            let b = tempfile::tempdir().unwrap();
            make_exe(a.path(), "tool", 0o755);
            make_exe(b.path(), "tool", 0o755);
            let path = format!("{}:{}", a.path().display(), b.path().display());
            let fds = FdTable::new(16, "/");
            let found = find_command(&fds, "tool", &path).unwrap();
            assert_eq!(found, format!("{}/tool", a.path().display()));
        }

        #[test]
        fn not_executable_beats_not_found() {
            let a = tempfile::tempdir().unwrap();
            make_exe(a.path(), "data", 0o644);
            let path = format!("/nonexistent:{}", a.path().display());
            let fds = FdTable::new(16, "/");
            // 実行ビットが 1 つもなければ root でも access(X_OK) は EACCES。
            assert_eq!(find_command(&fds, "data", &path), Err(Errno::EACCES));
            assert_eq!(find_command(&fds, "nope", &path), Err(Errno::ENOENT));
        }

        #[test]
        fn relative_name_uses_table_cwd() {
            let a = tempfile::tempdir().unwrap();
            make_exe(a.path(), "run", 0o755);
            let fds = FdTable::new(16, a.path().to_string_lossy().into_owned());
            let found = find_command(&fds, "./run", "").unwrap();
            assert_eq!(found, format!("{}/run", a.path().display()));
        }

        struct Exec(Vec<String>);

        impl Evaluator for Exec {
            fn evaluate(&self, shell: &Arc<ShellInstance>, _node: NodeRef<'_>) -> i32 {
                let err = exec_image(shell, &self.0, &environ(), "/bin:/usr/bin");
                err.status()
            }
        }

        fn exec_request(argv: &[&str]) -> ForkRequest {
            let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            ForkRequest::new(
                crate::eval::tests::command_arena(&["exec"]),
                ForkMode::NoJob,
                Arc::new(Exec(argv)),
            )
        }

        fn run_in_thread(argv: &[&str]) -> ProcState {
            let shell = ShellInstance::detached(Arc::new(Config::default()));
            let child = fork_with(&shell, &ThreadFork, exec_request(argv)).unwrap();
            wait_thread(child.pid, true).unwrap().unwrap()
        }

        #[test]
        fn thread_exec_starts_in_shell_cwd() {
            let dir = tempfile::tempdir().unwrap();
            let canon = std::fs::canonicalize(dir.path()).unwrap();
            let shell = ShellInstance::detached(Arc::new(Config::default()));
            shell.fds().chdir(&canon.to_string_lossy()).unwrap();
            assert_ne!(std::env::current_dir().unwrap(), canon);

            let req = exec_request(&["sh", "-c", "pwd -P > where"]);
            let child = fork_with(&shell, &ThreadFork, req).unwrap();
            assert_eq!(
                wait_thread(child.pid, true).unwrap().unwrap(),
                ProcState::Exited(0)
            );
            let printed = std::fs::read_to_string(canon.join("where")).unwrap();
            assert_eq!(printed.trim_end(), canon.to_string_lossy());
        }

        #[test]
        fn process_exec_fails_when_cwd_is_gone() {
            use crate::fork::native::NativeFork;

            let dir = tempfile::tempdir().unwrap();
            let gone = dir.path().join("gone");
            std::fs::create_dir(&gone).unwrap();
            let shell = ShellInstance::detached(Arc::new(Config::default()));
            shell.fds().chdir(&gone.to_string_lossy()).unwrap();
            std::fs::remove_dir(&gone).unwrap();

            let child = fork_with(&shell, &NativeFork, exec_request(&["sh", "-c", "exit 0"])).unwrap();
            let reaped = native::wait_pid(WaitTarget::Pid(child.pid), true).unwrap();
            assert_eq!(reaped, Some((child.pid, ProcState::Exited(127))));
        }

        #[test]
        fn thread_exec_ends_with_program_status() {
            assert_eq!(run_in_thread(&["sh", "-c", "exit 4"]), ProcState::Exited(4));
        }

        #[test]
        fn thread_exec_of_missing_command_is_127() {
            assert_eq!(
                run_in_thread(&["rush-no-such-command"]),
                ProcState::Exited(127)
            );
        }

        #[test]
        fn script_without_shebang_runs_in_script_shell() {
            let dir = tempfile::tempdir().unwrap();
            let p = dir.path().join("plain");
            std::fs::write(&p, "exit 6\n").unwrap();
            std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
            let path = p.to_string_lossy().into_owned();
            assert_eq!(run_in_thread(&[&path]), ProcState::Exited(6));
        }
    }
}
