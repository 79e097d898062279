//! rush-core: シェルのプロセス・資源基盤。
//!
//! 評価器（構文木を解釈する側）から見た「OS っぽいもの」をまとめて提供する。
//! 実行コンテキストの登録、fork 可能なヒープ、仮想 fd テーブル、fork / exec の
//! 3 方式（ネイティブ・スレッド・疑似）、ジョブ管理、割り込み遅延、構文木アリーナ。
//!
//! バイナリ本体（`main.rs`）は最小の評価器 [`eval::CommandRunner`] を載せたドライバ。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`context`] | 現在のシェルコンテキスト（スレッドローカル束縛、PID 索引） |
//! | [`shell`] | [`ShellInstance`](shell::ShellInstance): コンテキストごとの状態、疑似 PID、`exit_shell` |
//! | [`heap`] | チャンク単位のヒープ（first-fit、結合、スナップショットと同一アドレス復元） |
//! | [`fd`] | 仮想 fd テーブル（最小番号割り当て、`dup`/`dup2`/`pipe`、cwd、exec 用配置） |
//! | [`fork`] | fork の 3 方式と [`ForkRequest`](fork::ForkRequest)（fd 計画、ジョブ登録） |
//! | [`exec`] | `PATH` 探索、`#!` 解釈、プロセスイメージの置き換え |
//! | [`job`] | ジョブテーブル、`wait`、ジョブ制御（端末の受け渡し、`fg`/`bg`）、状態表示 |
//! | [`intr`] | `INTOFF`/`INTON` 相当の割り込み遅延 |
//! | [`signal`] | シグナル処分テーブル、受信の記録、シグナル名 |
//! | [`arena`] | 参照カウント付き構文木アリーナ |
//! | [`eval`] | 評価器の境界 [`Evaluator`](eval::Evaluator) と最小実装 |
//! | [`reader`] | ドライバ用の行リーダー（1 行 → アリーナ） |
//! | [`native`] | OS 呼び出しの薄い層（Unix / Windows） |
//! | [`spawn`] | `posix_spawn` ラッパー（スレッドモードの exec） |
//! | [`config`] | 環境変数からの設定 |
//! | [`error`] | エラー型、`Errno`、終了ステータス |

pub mod arena;
pub mod config;
pub mod context;
pub mod error;
pub mod eval;
pub mod exec;
pub mod fd;
pub mod fork;
pub mod heap;
pub mod intr;
pub mod job;
pub mod native;
pub mod reader;
pub mod shell;
pub mod signal;
#[cfg(unix)]
pub mod spawn;
