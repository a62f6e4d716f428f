//! rlsh ベンチマーク: 分割、展開、分類、検証、spawn の計測。
//!
//! `std::time::Instant` による手動計測。
//!
//! 実行: `cargo bench`

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rlsh::policy::{PathPolicy, Policy};
use rlsh::spawn::{self, Launch};
use rlsh::validate::Validator;

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
    for _ in 0..iters.min(100) {
        f();
    }

    let start = Instant::now();
    for _ in 0..iters {
        f();
    }

    BenchResult {
        category,
        name,
        avg: start.elapsed() / iters as u32,
        iters,
    }
}

fn flush(results: &mut Vec<BenchResult>) {
    for r in results.iter() {
        r.print();
    }
    results.clear();
}

const LINES: &[&str] = &[
    "echo hello",
    "ls -l | grep Cargo | head -1",
    "A=1 echo \"a && b\" && cat notes.txt || echo $HOME",
    "sudo -u admin ls /srv; sleep 1 &",
];

// ── メイン ────────────────────────────────────────────────────────

fn main() {
    println!("rlsh benchmark suite");
    println!("{}", "=".repeat(80));

    let mut results = Vec::new();

    println!("\n--- Lexer ---");
    for &line in LINES {
        results.push(bench("split", line, 10_000, || {
            let _ = rlsh::lexer::split(line);
        }));
    }
    flush(&mut results);

    println!("\n--- Expander ---");
    let mut aliases = BTreeMap::new();
    aliases.insert("ll".to_string(), "ls -l".to_string());
    let mut env = HashMap::new();
    env.insert("HOME".to_string(), "/home/bench".to_string());
    results.push(bench("expand", "ll $HOME ${HOME}/x $?", 10_000, || {
        let _ = rlsh::expand::expand("ll $HOME ${HOME}/x $?", &aliases, &env, 0);
    }));
    flush(&mut results);

    println!("\n--- Classifier ---");
    results.push(bench("classify", "A=1 B='x y' cmd \"a b\" > out 2>&1", 10_000, || {
        let _ = rlsh::parser::classify("A=1 B='x y' cmd \"a b\" > out 2>&1");
    }));
    flush(&mut results);

    println!("\n--- Validator ---");
    let mut policy = Policy::new("/");
    policy.paths = PathPolicy::new(vec!["/".to_string()], Vec::new()).unwrap_or_else(|e| panic!("{}", e));
    for cmd in ["echo", "ls", "grep", "head", "cat", "sleep"] {
        policy.allowed.insert(cmd.to_string());
    }
    policy.sudo_commands.insert("ls".to_string());
    policy.forbidden.clear();
    let validator = Validator::new(&policy, false, &env);
    for &line in LINES {
        results.push(bench("validate", line, 5_000, || {
            let _ = validator.check_line(line, 0);
        }));
    }
    flush(&mut results);

    println!("\n--- Spawn (posix_spawnp) ---");
    let argv = vec!["/bin/true".to_string()];
    results.push(bench("spawn", "/bin/true", 1_000, || {
        if let Ok(pid) = spawn::spawn(&Launch {
            argv: &argv,
            ..Launch::default()
        }) {
            spawn::wait_status(pid);
        }
    }));
    flush(&mut results);

    println!("\n{}", "=".repeat(80));
    println!("done.");
}
