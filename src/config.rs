//! 実行時設定。
//!
//! 環境変数から読み込む。不正な値は `warn!` を出してデフォルトを維持する。
//!
//! | 変数 | 意味 | デフォルト |
//! |------|------|-----------|
//! | `RUSH_FORK_MODE` | fork 戦略（`auto` / `native` / `thread` / `pseudo`） | `auto` |
//! | `RUSH_HEAP_CHUNK` | ヒープチャンクの最小サイズ（バイト） | 65536 |
//! | `RUSH_MAX_FDS` | fd テーブルのスロット上限 | 1024 |
//! | `RUSH_SCRIPT_SHELL` | `#!` 行のないスクリプトを実行するインタプリタ | `/bin/sh` |
//! | `RUSH_TRACE_FD` | トレース出力用 fd（teardown と exec 継承から除外） | なし |

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// `fork_shell` が子コンテキストを作る方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ForkStrategy {
    /// プラットフォームに応じて自動選択（Unix は native、Windows は pseudo）。
    Auto,
    /// OS の `fork()`。
    Native,
    /// 同一プロセス内のスレッド。プロセス ID は疑似的なもの。
    Thread,
    /// 一時停止状態の子プロセスにヒープを複製して再開する。
    Pseudo,
}

impl ForkStrategy {
    /// `Auto` を具体的な戦略に解決する。
    pub fn resolve(self) -> ForkStrategy {
        match self {
            ForkStrategy::Auto => {
                if cfg!(unix) {
                    ForkStrategy::Native
                } else {
                    ForkStrategy::Pseudo
                }
            }
            other => other,
        }
    }
}

impl FromStr for ForkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(ForkStrategy::Auto),
            "native" | "fork" => Ok(ForkStrategy::Native),
            "thread" => Ok(ForkStrategy::Thread),
            "pseudo" => Ok(ForkStrategy::Pseudo),
            other => Err(format!("unknown fork mode `{}`", other)),
        }
    }
}

/// シェルコアの設定。[`ShellInstance`](crate::shell::ShellInstance) が共有参照で保持する。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub fork_strategy: ForkStrategy,
    /// ヒープが OS から確保するチャンクの最小サイズ。
    pub min_chunk_size: usize,
    /// fd テーブルが拡張できる上限スロット数。超えると `EMFILE`。
    pub max_fds: usize,
    /// `#!` 行のないスクリプトを実行するインタプリタ。
    pub script_shell: PathBuf,
    /// トレース出力用のシェル fd。
    pub trace_fd: Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fork_strategy: ForkStrategy::Auto,
            min_chunk_size: 64 * 1024,
            max_fds: 1024,
            script_shell: PathBuf::from("/bin/sh"),
            trace_fd: None,
        }
    }
}

impl Config {
    /// プロセスの環境変数から読み込む。
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` で与えられた変数から読み込む。テストから環境を汚さずに使うための入口。
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("RUSH_FORK_MODE") {
            match v.parse() {
                Ok(mode) => config.fork_strategy = mode,
                Err(e) => warn!(value = %v, "RUSH_FORK_MODE: {}", e),
            }
        }
        if let Some(v) = lookup("RUSH_HEAP_CHUNK") {
            match v.trim().parse::<usize>() {
                Ok(n) if n >= 4096 => config.min_chunk_size = n,
                _ => warn!(value = %v, "RUSH_HEAP_CHUNK: expected a size of at least 4096"),
            }
        }
        if let Some(v) = lookup("RUSH_MAX_FDS") {
            match v.trim().parse::<usize>() {
                Ok(n) if n >= 3 => config.max_fds = n,
                _ => warn!(value = %v, "RUSH_MAX_FDS: expected a number of at least 3"),
            }
        }
        if let Some(v) = lookup("RUSH_SCRIPT_SHELL") {
            if v.is_empty() {
                warn!("RUSH_SCRIPT_SHELL: empty value ignored");
            } else {
                config.script_shell = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("RUSH_TRACE_FD") {
            match v.trim().parse::<i32>() {
                Ok(fd) if fd >= 0 => config.trace_fd = Some(fd),
                _ => warn!(value = %v, "RUSH_TRACE_FD: expected a descriptor number"),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let c = config_from(&[]);
        assert_eq!(c.fork_strategy, ForkStrategy::Auto);
        assert_eq!(c.min_chunk_size, 64 * 1024);
        assert_eq!(c.max_fds, 1024);
        assert_eq!(c.script_shell, PathBuf::from("/bin/sh"));
        assert_eq!(c.trace_fd, None);
    }

    #[test]
    fn reads_all_variables() {
        let c = config_from(&[
            ("RUSH_FORK_MODE", "Thread"),
            ("RUSH_HEAP_CHUNK", "131072"),
            ("RUSH_MAX_FDS", "64"),
            ("RUSH_SCRIPT_SHELL", "/usr/bin/dash"),
            ("RUSH_TRACE_FD", "9"),
        ]);
        assert_eq!(c.fork_strategy, ForkStrategy::Thread);
        assert_eq!(c.min_chunk_size, 131072);
        assert_eq!(c.max_fds, 64);
        assert_eq!(c.script_shell, PathBuf::from("/usr/bin/dash"));
        assert_eq!(c.trace_fd, Some(9));
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let c = config_from(&[
            ("RUSH_FORK_MODE", "vfork"),
            ("RUSH_HEAP_CHUNK", "12"),
            ("RUSH_MAX_FDS", "lots"),
            ("RUSH_TRACE_FD", "-1"),
        ]);
        assert_eq!(c.fork_strategy, ForkStrategy::Auto);
        assert_eq!(c.min_chunk_size, 64 * 1024);
        assert_eq!(c.max_fds, 1024);
        assert_eq!(c.trace_fd, None);
    }

    #[test]
    fn auto_resolves_per_platform() {
        let resolved = ForkStrategy::Auto.resolve();
        if cfg!(unix) {
            assert_eq!(resolved, ForkStrategy::Native);
        } else {
            assert_eq!(resolved, ForkStrategy::Pseudo);
        }
        assert_eq!(ForkStrategy::Thread.resolve(), ForkStrategy::Thread);
    }
}
