//! rush-core ベンチマーク: ヒープ、fd テーブル、構文木アリーナ、ジョブ名解決、fork の計測。
//!
//! `std::time::Instant` による手動計測（外部クレート不要）。
//!
//! 実行: `cargo bench`

use std::sync::Arc;
use std::time::{Duration, Instant};

use rush_core::arena::ArenaBuilder;
use rush_core::config::{Config, ForkStrategy};
use rush_core::eval::{CommandRunner, Evaluator};
use rush_core::fd::{FdTable, OpenFlags};
use rush_core::heap::{Heap, DEFAULT_MIN_CHUNK};
use rush_core::job::JobTable;
use rush_core::reader;
use rush_core::shell::ShellInstance;

// ── ベンチマークインフラ ──────────────────────────────────────────

struct BenchResult {
    category: &'static str,
    name: &'static str,
    avg: Duration,
    iters: u64,
}

impl BenchResult {
    fn print(&self) {
        let avg_us = self.avg.as_nanos() as f64 / 1000.0;
        println!(
            "[{:<8}] {:<40}: avg {:>10.2}µs  ({} iters)",
            self.category, self.name, avg_us, self.iters,
        );
    }
}

fn bench<F: FnMut()>(category: &'static str, name: &'static str, iters: u64, mut f: F) -> BenchResult {
    // ウォームアップ
    for _ in 0..iters.min(100) {
        f();
    }

    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    let elapsed = start.elapsed();

    BenchResult {
        category,
        name,
        avg: elapsed / iters as u32,
        iters,
    }
}

fn flush(results: &mut Vec<BenchResult>) {
    for r in results.iter() {
        r.print();
    }
    results.clear();
}

// ── メイン ────────────────────────────────────────────────────────

fn main() {
    println!("rush-core benchmark suite");
    println!("{}", "=".repeat(80));

    let mut results = Vec::new();

    // ── ヒープ ──
    println!("\n--- Heap ---");

    let heap = Heap::new(DEFAULT_MIN_CHUNK);
    results.push(bench("heap", "alloc + free 64B", 100_000, || {
        if let Ok(p) = heap.alloc(64) {
            let _ = heap.free(p);
        }
    }));
    results.push(bench("heap", "alloc 32 x 256B, free in reverse", 10_000, || {
        let blocks: Vec<_> = (0..32).filter_map(|_| heap.alloc(256).ok()).collect();
        for p in blocks.into_iter().rev() {
            let _ = heap.free(p);
        }
    }));
    results.push(bench("heap", "snapshot_chunks (1 chunk)", 10_000, || {
        let _ = heap.snapshot_chunks();
    }));
    flush(&mut results);

    // ── fd テーブル ──
    println!("\n--- Fd table ---");

    let fds = FdTable::new(1024, "/");
    match fds.open("/dev/null", OpenFlags::READ, 0) {
        Ok(fd) => {
            results.push(bench("fd", "dup + close", 10_000, || {
                if let Ok(d) = fds.dup(fd) {
                    let _ = fds.close(d);
                }
            }));
            results.push(bench("fd", "dup_onto(10) + close", 10_000, || {
                if fds.dup_onto(fd, 10).is_ok() {
                    let _ = fds.close(10);
                }
            }));
        }
        Err(e) => eprintln!("skip fd benchmarks: {}", e),
    }
    results.push(bench("fd", "pipe + close both", 10_000, || {
        if let Ok((r, w)) = fds.pipe() {
            let _ = fds.close(r);
            let _ = fds.close(w);
        }
    }));
    flush(&mut results);

    // ── 構文木アリーナ ──
    println!("\n--- Arena ---");

    let arena_heap = Arc::new(Heap::new(DEFAULT_MIN_CHUNK));
    results.push(bench("arena", "build `ls -l /tmp`", 10_000, || {
        let mut b = ArenaBuilder::new(Arc::clone(&arena_heap));
        if let Ok(c) = b.command(&["ls", "-l", "/tmp"], &[]) {
            let _ = b.finish(c);
        }
    }));
    results.push(bench("arena", "read `a | b | c > out; d &`", 10_000, || {
        let _ = reader::read_line_in(&arena_heap, "a | b | c > out; d &");
    }));
    if let Ok(Some(tree)) = reader::read_line_in(&arena_heap, "a | b | c > out; d &") {
        results.push(bench("arena", "retain + release", 100_000, || {
            tree.retain().release();
        }));
        results.push(bench("arena", "command_text", 10_000, || {
            let _ = tree.root().command_text();
        }));
    }
    flush(&mut results);

    // ── ジョブ名解決 ──
    println!("\n--- Jobs ---");

    let mut jobs = JobTable::new(1);
    for i in 0..16 {
        let id = jobs.make_job(1);
        let _ = jobs.add_process(id, 1000 + i, format!("sleep {}", i));
    }
    results.push(bench("job", "get_job(\"%+\")", 100_000, || {
        let _ = jobs.get_job("%+");
    }));
    results.push(bench("job", "get_job(\"%8\")", 100_000, || {
        let _ = jobs.get_job("%8");
    }));
    results.push(bench("job", "get_job(\"%?leep 15\")", 100_000, || {
        let _ = jobs.get_job("%?leep 15");
    }));
    flush(&mut results);

    // ── fork ──
    println!("\n--- Fork (evaluate `true`) ---");

    let runner = CommandRunner::new();
    let mut strategies = vec![("thread fork + wait", ForkStrategy::Thread)];
    #[cfg(unix)]
    strategies.push(("native fork + wait", ForkStrategy::Native));
    for (name, strategy) in strategies {
        let config = Config {
            fork_strategy: strategy,
            ..Config::default()
        };
        let shell = ShellInstance::detached(Arc::new(config));
        let Ok(Some(tree)) = reader::read_line_in(&arena_heap, "true") else {
            continue;
        };
        results.push(bench("fork", name, 200, || {
            let _ = runner.evaluate(&shell, tree.root());
        }));
    }
    flush(&mut results);

    println!("\n{}", "=".repeat(80));
    println!("done.");
}
