//! rush-core ドライバ: 最小の評価器でシェル基盤を動かす。
//!
//! 使い方:
//!
//! - `rush-core -c 'cmd | cmd; cmd &'` で 1 行を評価して終わる
//! - 引数なしなら標準入力を 1 行ずつ評価する（端末ならプロンプトを出し、ジョブ制御を有効にする）
//! - `--fork-resume <addr> <len>` は疑似 fork の子プロセスとしての起動（親が付ける）
//!
//! ログは `RUSH_LOG`（`tracing-subscriber` の `EnvFilter` 書式、既定 `warn`）で標準エラーへ。

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use rush_core::config::Config;
use rush_core::context;
use rush_core::eval::{CommandRunner, Evaluator};
use rush_core::fork::pseudo;
use rush_core::job;
use rush_core::reader;
use rush_core::shell::ShellInstance;
use rush_core::signal;

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUSH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// 1 行を読み取って評価する。構文エラーは 2。
fn run_line(shell: &Arc<ShellInstance>, runner: &CommandRunner, line: &str) -> Option<i32> {
    match reader::read_line(line) {
        Ok(Some(tree)) => Some(runner.evaluate(shell, tree.root())),
        Ok(None) => None,
        Err(e) => {
            eprintln!("rush: {}", e);
            Some(2)
        }
    }
}

fn main() {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();

    // 疑似 fork の子: 親が書き込んだ引き継ぎブロックから再開する。
    // SAFETY: この引数は親の PseudoFork だけが付け、ヒープはまだ何も確保していない。
    let resumed = Arc::new(CommandRunner::new().resumed());
    if let Some(result) = unsafe { pseudo::resume_from_args(&args, resumed) } {
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                eprintln!("rush: {}", e);
                2
            }
        };
        let _ = io::stdout().flush();
        std::process::exit(status);
    }

    let config = Arc::new(Config::from_env());
    let shell = match ShellInstance::root(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("rush: {}", e);
            std::process::exit(2);
        }
    };
    let bind = context::bind(Arc::clone(&shell));
    let runner = CommandRunner::new();

    let status = match args.first().map(String::as_str) {
        Some("-c") => match args.get(1) {
            Some(line) => run_line(&shell, &runner, line).unwrap_or(0),
            None => {
                eprintln!("rush: -c: option requires an argument");
                2
            }
        },
        Some(other) => {
            eprintln!("rush: {}: unknown option", other);
            2
        }
        None => repl(&shell, &runner),
    };

    drop(bind);
    drop(shell);
    let _ = io::stdout().flush();
    std::process::exit(status);
}

/// 標準入力の行ループ。EOF で最後のステータスを返す。
fn repl(shell: &Arc<ShellInstance>, runner: &CommandRunner) -> i32 {
    let interactive = shell.fds().isatty(0) && shell.fds().isatty(2);
    if interactive {
        if let Err(e) = shell.signals().init_interactive() {
            eprintln!("rush: {}", e);
        }
        if let Err(e) = job::set_job_control(shell, true) {
            eprintln!("rush: {}", e);
        }
    }

    let stdin = io::stdin();
    let mut status = 0;
    let mut line = String::new();
    loop {
        // プロンプト前に終わったジョブを知らせる。
        if let Err(e) = job::show_changed_jobs(shell) {
            eprintln!("rush: {}", e);
        }
        if interactive {
            // 終了ステータスが非ゼロなら接頭辞に付ける
            if status == 0 {
                eprint!("rush$ ");
            } else {
                eprint!("[{}] rush$ ", status);
            }
        }

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("rush: read error: {}", e);
                status = 2;
                break;
            }
        }
        // 入力待ちの間の Ctrl+C はこの行に持ち越さない。
        signal::poll_signals(shell);
        let _ = shell.intr().take_interrupt();
        if let Some(s) = run_line(shell, runner, &line) {
            status = s;
        }
    }

    if interactive {
        eprintln!();
        if let Err(e) = job::set_job_control(shell, false) {
            eprintln!("rush: {}", e);
        }
    }
    status
}
