//! ビルトインコマンドの実装。
//!
//! ビルトインは fork/exec を経由せずプロセス内で直接実行される。
//! 名前の一覧は [`policy::BUILTINS`](crate::policy::BUILTINS) にあり、
//! ここに来る時点でポリシー検証は済んでいる。

use std::env;
use std::io::Write;
use std::path::PathBuf;

use crate::executor;
use crate::job;
use crate::lexer::{self, SplitError};
use crate::shell::Shell;

/// `source` の入れ子上限。
const MAX_SOURCE_DEPTH: usize = 16;

/// ビルトインを実行し、終了ステータスを返す。`argv[0]` はビルトイン名。
pub fn run(shell: &mut Shell, argv: &[String], out: &mut dyn Write) -> i32 {
    let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
    let status = match argv.first().map(String::as_str) {
        Some("cd") => builtin_cd(shell, &args, out),
        Some("exit") => builtin_exit(shell, &args),
        Some("export") => builtin_export(&args, out),
        Some("source") => builtin_source(shell, &args),
        Some("history") => builtin_history(shell, &args, out),
        Some("lpath") => builtin_lpath(shell, out),
        Some("lsudo") => builtin_lsudo(shell, out),
        Some("help") => builtin_help(shell, out),
        Some("jobs") => builtin_jobs(shell, out),
        Some("fg") => builtin_fg(shell, &args),
        Some("bg") => {
            eprintln!("rlsh: bg: not supported");
            1
        }
        Some(other) => {
            eprintln!("rlsh: {}: not a builtin", other);
            1
        }
        None => 0,
    };
    let _ = out.flush();
    status
}

/// `io::Error` の表示から ` (os error N)` を落とす。
fn os_message(e: &std::io::Error) -> String {
    let text = e.to_string();
    match text.find(" (os error") {
        Some(at) => text[..at].to_string(),
        None => text,
    }
}

/// `cd [dir|-]`。引数なしはホーム、`-` は直前のディレクトリ。
fn builtin_cd(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let (target, shown): (PathBuf, String) = match args.first() {
        None => (shell.policy.home_path.clone(), shell.policy.home_path.display().to_string()),
        Some(&"-") => match &shell.oldpwd {
            Some(prev) => (prev.clone(), prev.display().to_string()),
            None => {
                eprintln!("rlsh: cd: OLDPWD not set");
                return 1;
            }
        },
        Some(dir) => (PathBuf::from(crate::path::expand_tilde(dir).as_ref()), dir.to_string()),
    };

    if let Err(e) = shell.change_dir(&target) {
        eprintln!("rlsh: cd: {}: {}", shown, os_message(&e));
        return 1;
    }
    if args.first() == Some(&"-") {
        let _ = writeln!(out, "{}", target.display());
    }
    0
}

/// `exit [N]`。`disable_exit` なら拒否する。
fn builtin_exit(shell: &mut Shell, args: &[&str]) -> i32 {
    if shell.policy.disable_exit {
        eprintln!("rlsh: exit: disabled");
        return 1;
    }
    shell.should_exit = true;
    match args.first() {
        Some(n) => n.parse::<i32>().unwrap_or_else(|_| {
            eprintln!("rlsh: exit: {}: numeric argument required", n);
            2
        }),
        None => shell.last_status,
    }
}

/// `export` / `export NAME=value` / `export NAME`。保護された名前は検証器が既に拒否している。
fn builtin_export(args: &[&str], out: &mut dyn Write) -> i32 {
    if args.is_empty() {
        let mut vars: Vec<(String, String)> = env::vars().collect();
        vars.sort();
        for (name, value) in vars {
            let _ = writeln!(out, "declare -x {}=\"{}\"", name, value);
        }
        return 0;
    }
    let mut status = 0;
    for arg in args {
        let (name, value) = match arg.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (*arg, None),
        };
        if !is_identifier(name) {
            eprintln!("rlsh: export: `{}': not a valid identifier", arg);
            status = 1;
            continue;
        }
        match value {
            Some(v) => env::set_var(name, v),
            None if env::var_os(name).is_none() => env::set_var(name, ""),
            None => {}
        }
    }
    status
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `source FILE`: 各行を通常の入力と同じく検証してから実行する。
fn builtin_source(shell: &mut Shell, args: &[&str]) -> i32 {
    let Some(file) = args.first() else {
        eprintln!("rlsh: source: filename argument required");
        return 2;
    };
    if shell.source_depth >= MAX_SOURCE_DEPTH {
        eprintln!("rlsh: source: {}: nested too deeply", file);
        return 1;
    }
    let path = crate::path::expand_tilde(file).into_owned();
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("rlsh: source: {}: {}", file, os_message(&e));
            return 1;
        }
    };

    shell.source_depth += 1;
    let mut status = 0;
    let mut pending = String::new();
    for line in content.lines() {
        if pending.is_empty() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            pending.push_str(trimmed);
        } else {
            lexer::join_continuation(&mut pending, line);
        }
        if matches!(lexer::split(&pending), Err(SplitError::NeedsMoreInput)) {
            continue;
        }
        status = executor::run_line(shell, &pending);
        pending.clear();
        if shell.finished() {
            break;
        }
    }
    if !pending.is_empty() && !shell.finished() {
        status = executor::reject_incomplete(shell, &pending);
    }
    shell.source_depth -= 1;
    status
}

fn builtin_history(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    match shell.history.command(args.first().copied()) {
        Ok(lines) => {
            for line in lines {
                let _ = writeln!(out, "{}", line);
            }
            0
        }
        Err(e) => {
            eprintln!("rlsh: history: {}", e);
            2
        }
    }
}

fn builtin_lpath(shell: &Shell, out: &mut dyn Write) -> i32 {
    let paths = &shell.policy.paths;
    let _ = writeln!(out, "Allowed:");
    for p in paths.allowed() {
        let _ = writeln!(out, " {}", p);
    }
    if !paths.denied().is_empty() {
        let _ = writeln!(out, "Denied:");
        for p in paths.denied() {
            let _ = writeln!(out, " {}", p);
        }
    }
    0
}

fn builtin_lsudo(shell: &Shell, out: &mut dyn Write) -> i32 {
    let _ = writeln!(out, "Allowed sudo commands:");
    for cmd in &shell.policy.sudo_commands {
        let _ = writeln!(out, " - {}", cmd);
    }
    0
}

fn builtin_help(shell: &Shell, out: &mut dyn Write) -> i32 {
    let names: Vec<&str> = shell.policy.commands(shell.ssh).iter().map(String::as_str).collect();
    let _ = writeln!(out, "{}", names.join("  "));
    0
}

fn builtin_jobs(shell: &mut Shell, out: &mut dyn Write) -> i32 {
    job::reap_jobs(&mut shell.jobs);
    for line in shell.jobs.listing() {
        let _ = writeln!(out, "{}", line);
    }
    0
}

fn builtin_fg(shell: &mut Shell, args: &[&str]) -> i32 {
    match job::resume(&mut shell.jobs, args.first().copied(), shell.terminal_fd, shell.shell_pgid) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("rlsh: fg: {}", e);
            1
        }
    }
}
