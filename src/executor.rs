//! ディスパッチャ: 1 行を検証してから演算子列どおりに実行する。
//!
//! - 行全体を先に [`Validator::check_line`] にかけ、違反が 1 つでもあれば何も実行しない
//! - 各パイプラインは直前の `$?` で展開し直し、[`Validator::check_segment`] で再検査する
//! - コマンド置換はクォート状態を見ながらテキスト上で置き換え、結果をもう一度検査する
//! - 単一ビルトインは fork せずに実行、それ以外は [`spawn`] でプロセスグループ単位に起動
//! - foreground は `tcsetpgrp` で端末を渡して待ち、停止したらジョブテーブルへ登録

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd};

use crate::builtins;
use crate::expand::{self, ProcessEnv};
use crate::job::{self, JobTable};
use crate::lexer::{self, Operator};
use crate::logging;
use crate::parser::{self, Redirect, RedirectKind, Segment};
use crate::path;
use crate::policy::{self, Policy};
use crate::shell::Shell;
use crate::spawn::{self, Launch};
use crate::validate::{Report, Validator, Violation, ViolationKind};
use crate::violation::Verdict;

/// 検証で拒否した行の終了ステータス。
pub const REJECTED: i32 = 126;

/// 行を検証し、通れば実行する。戻り値は `$?` になる。
pub fn run_line(shell: &mut Shell, line: &str) -> i32 {
    let line = line.trim();
    if line.is_empty() || shell.finished() {
        return shell.last_status;
    }
    job::reap_jobs(&mut shell.jobs);

    let report = Validator::new(&shell.policy, shell.ssh, &ProcessEnv).check_line(line, shell.last_status);
    if let Err(status) = enforce(shell, &report) {
        shell.last_status = status;
        return status;
    }

    let pieces = match lexer::split(line) {
        Ok(pieces) => pieces,
        Err(_) => return reject_incomplete(shell, line),
    };
    logging::command_executed(&shell.user, line);

    let status = run_list(shell, &pipelines(&pieces));
    shell.last_status = status;
    status
}

/// 閉じていない入力（EOF で終わった継続行など）を構文違反として扱う。
pub fn reject_incomplete(shell: &mut Shell, text: &str) -> i32 {
    let report = Report {
        violations: vec![Violation::new(ViolationKind::Syntax, text.trim())],
        reset_cwd: false,
    };
    let status = enforce(shell, &report).err().unwrap_or(REJECTED);
    shell.last_status = status;
    status
}

/// 検査結果を反映する。違反があれば警告カウンタを進めて `Err(126)`。
fn enforce(shell: &mut Shell, report: &Report) -> Result<(), i32> {
    if report.reset_cwd {
        shell.return_home();
    }
    if report.is_clean() {
        return Ok(());
    }
    if shell.tracker.record(report) == Verdict::KickedOut {
        shell.kicked_out = true;
    }
    Err(REJECTED)
}

// ── コマンドリスト ──────────────────────────────────────────────────

/// `|` で繋がったステージ列と、その後ろの演算子。
#[derive(Debug, PartialEq)]
struct Pipeline<'a> {
    stages: Vec<&'a str>,
    op: Operator,
}

fn pipelines(pieces: &[(String, Operator)]) -> Vec<Pipeline<'_>> {
    let mut out = Vec::new();
    let mut stages = Vec::new();
    for (text, op) in pieces {
        stages.push(text.as_str());
        if *op != Operator::Pipe {
            out.push(Pipeline {
                stages: std::mem::take(&mut stages),
                op: *op,
            });
        }
    }
    out
}

/// `&&` / `||` は直前のパイプラインの終了ステータスで短絡する。
fn run_list(shell: &mut Shell, list: &[Pipeline<'_>]) -> i32 {
    let mut status = shell.last_status;
    let mut previous: Option<Operator> = None;
    for pipeline in list {
        let skip = match previous {
            Some(Operator::And) => status != 0,
            Some(Operator::Or) => status == 0,
            _ => false,
        };
        previous = Some(pipeline.op);
        if skip {
            continue;
        }
        status = run_pipeline(shell, &pipeline.stages, pipeline.op == Operator::Background);
        shell.last_status = status;
        if shell.finished() {
            break;
        }
    }
    status
}

fn run_pipeline(shell: &mut Shell, stages: &[&str], background: bool) -> i32 {
    let mut segments = Vec::with_capacity(stages.len());
    for text in stages {
        match prepare(shell, text) {
            Ok(segment) => segments.push(segment),
            Err(status) => return status,
        }
        if shell.finished() {
            return REJECTED;
        }
    }

    if let Some(name) = segments
        .iter()
        .filter_map(|s| s.executable.as_deref())
        .find(|exe| policy::is_builtin(exe))
    {
        if segments.len() > 1 {
            eprintln!("rlsh: {}: cannot be used in a pipeline", name);
            return 1;
        }
        if background {
            eprintln!("rlsh: {}: cannot be run in the background", name);
            return 1;
        }
        return run_builtin(shell, &segments[0]);
    }

    if segments.len() == 1 && segments[0].executable.is_none() {
        assign(&segments[0].assignments);
        return 0;
    }
    if segments.iter().any(|s| s.executable.is_none()) {
        eprintln!("rlsh: syntax error: empty command in pipeline");
        return 2;
    }

    let display = stages.iter().map(|s| s.trim()).collect::<Vec<_>>().join(" | ");
    execute_job(shell, &segments, &display, background)
}

/// 1 ステージを展開・再検査・置換・分類する。拒否したら `Err(終了ステータス)`。
fn prepare(shell: &mut Shell, text: &str) -> Result<Segment, i32> {
    let expanded = expand::expand(text, &shell.policy.aliases, &ProcessEnv, shell.last_status);
    recheck(shell, &expanded)?;

    let substituted = substitute_commands(shell, &expanded);
    if substituted != expanded {
        recheck(shell, &substituted)?;
    }

    parser::classify(&substituted).map_err(|e| {
        tracing::debug!("classify failed: {}", e);
        reject_incomplete(shell, &substituted)
    })
}

fn recheck(shell: &mut Shell, expanded: &str) -> Result<(), i32> {
    let report = Validator::new(&shell.policy, shell.ssh, &ProcessEnv).check_segment(expanded, shell.last_status);
    enforce(shell, &report)
}

/// 代入だけのセグメント（`NAME=value`）はシェル自身の環境を変える。
fn assign(assignments: &[(String, String)]) {
    for (name, value) in assignments {
        std::env::set_var(name, path::expand_tilde(value).as_ref());
    }
}

/// 実行ファイルはチルダ展開のみ、引数はクォートされていなければ glob も展開する。
fn argv_of(segment: &Segment) -> Vec<String> {
    let mut argv = Vec::with_capacity(segment.args.len() + 1);
    if let Some(exe) = &segment.executable {
        argv.push(path::expand_tilde(exe).into_owned());
    }
    for (arg, &quoted) in segment.args.iter().zip(&segment.quoted) {
        if quoted {
            argv.push(arg.clone());
        } else {
            argv.extend(path::expand_for_exec(arg));
        }
    }
    argv
}

/// 子プロセスに上書きする環境: 先頭の代入と、必要なら noexec の `LD_PRELOAD`。
fn child_env(policy: &Policy, segment: &Segment) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = segment
        .assignments
        .iter()
        .map(|(name, value)| (name.clone(), path::expand_tilde(value).into_owned()))
        .collect();
    if let Some(lib) = segment.executable.as_deref().and_then(|exe| policy.noexec_for(exe)) {
        env.push(("LD_PRELOAD".to_string(), lib.display().to_string()));
    }
    env
}

// ── コマンド置換 ────────────────────────────────────────────────────

/// `$( ... )` と `` `...` `` を実行結果で置き換える。シングルクォート内は触らない。
///
/// 結果はクォートし直して埋め込むので、出力に含まれる演算子やクォートが
/// 構文として解釈されることはない。
fn substitute_commands(shell: &mut Shell, text: &str) -> String {
    if !text.contains("$(") && !text.contains('`') {
        return text.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_single {
            in_single = c != '\'';
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '\\' => {
                let end = (i + 2).min(chars.len());
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' if !in_double => {
                in_single = true;
                out.push(c);
                i += 1;
            }
            '"' => {
                in_double = !in_double;
                out.push(c);
                i += 1;
            }
            '$' if chars.get(i + 1) == Some(&'(') => {
                let end = expand::find_closing_paren(&chars, i + 2);
                let inner = inner_text(&chars, i + 2, end, ')');
                out.push_str(&quote_output(&capture(shell, &inner), in_double));
                i = end;
            }
            '`' => {
                let end = expand::find_closing_backtick(&chars, i + 1);
                let inner = inner_text(&chars, i + 1, end, '`');
                out.push_str(&quote_output(&capture(shell, &inner), in_double));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// `chars[start..end]` から閉じ記号を除いた部分。
fn inner_text(chars: &[char], start: usize, end: usize, close: char) -> String {
    let stop = if end > start && chars[end - 1] == close {
        end - 1
    } else {
        end
    };
    chars[start.min(stop)..stop].iter().collect()
}

/// クォート外では空白で分割して語ごとにシングルクォート、ダブルクォート内ではエスケープ。
fn quote_output(output: &str, in_double: bool) -> String {
    if in_double {
        let mut quoted = String::with_capacity(output.len());
        for c in output.chars() {
            if matches!(c, '"' | '\\' | '$' | '`') {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        return quoted;
    }
    output
        .split_whitespace()
        .map(|word| format!("'{}'", word.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// サブシェルで `inner` を実行し、stdout を末尾の改行を除いて返す。
///
/// 子は同じ [`Shell`] の複製で [`run_line`] を回すので、内側の行も同じ検証を通る。
/// 子側の違反カウントは親に戻らない（内側の行は外側の検査で既に通っている）。
fn capture(shell: &mut Shell, inner: &str) -> String {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        eprintln!("rlsh: pipe: {}", io::Error::last_os_error());
        return String::new();
    }
    let _ = io::stdout().flush();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        eprintln!("rlsh: fork: {}", io::Error::last_os_error());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return String::new();
    }

    if pid == 0 {
        unsafe {
            libc::close(fds[0]);
            libc::dup2(fds[1], libc::STDOUT_FILENO);
            libc::close(fds[1]);
        }
        shell.jobs = JobTable::new();
        shell.terminal_fd = -1;
        let status = run_line(shell, inner);
        let _ = io::stdout().flush();
        unsafe { libc::_exit(status) }
    }

    unsafe {
        libc::close(fds[1]);
    }
    let mut output = Vec::new();
    let mut reader = unsafe { File::from_raw_fd(fds[0]) };
    if let Err(e) = reader.read_to_end(&mut output) {
        tracing::debug!("substitution output: {}", e);
    }
    drop(reader);
    spawn::wait_status(pid);

    String::from_utf8_lossy(&output).trim_end_matches('\n').to_string()
}

// ── ビルトイン ──────────────────────────────────────────────────────

fn run_builtin(shell: &mut Shell, segment: &Segment) -> i32 {
    let argv = argv_of(segment);
    match open_builtin_stdout(&segment.redirects) {
        Ok(Some(mut file)) => builtins::run(shell, &argv, &mut file),
        Ok(None) => builtins::run(shell, &argv, &mut io::stdout()),
        Err(status) => status,
    }
}

/// `>` / `>>` の最後の指定先を開く。指定がなければ `Ok(None)`。
fn open_builtin_stdout(redirects: &[Redirect]) -> Result<Option<File>, i32> {
    for r in redirects.iter().rev() {
        let append = match r.kind {
            RedirectKind::Output => false,
            RedirectKind::Append => true,
            _ => continue,
        };
        return open_target(&r.target, append, true).map(Some);
    }
    Ok(None)
}

fn open_target(target: &str, append: bool, write: bool) -> Result<File, i32> {
    let expanded = path::expand_tilde(target);
    let result = if !write {
        File::open(expanded.as_ref())
    } else if append {
        OpenOptions::new().create(true).append(true).open(expanded.as_ref())
    } else {
        File::create(expanded.as_ref())
    };
    result.map_err(|e| {
        eprintln!("rlsh: {}: {}", target, e);
        1
    })
}

// ── 外部コマンド ────────────────────────────────────────────────────

/// リダイレクト先として開いた fd。spawn 後に親で閉じる。
#[derive(Default)]
struct RedirectFds {
    stdin_fd: Option<i32>,
    stdout_fd: Option<i32>,
    stderr_fd: Option<i32>,
    dup_actions: Vec<(i32, i32)>,
}

impl RedirectFds {
    fn replace(slot: &mut Option<i32>, file: File) {
        if let Some(old) = slot.replace(file.into_raw_fd()) {
            unsafe {
                libc::close(old);
            }
        }
    }

    fn close(&self) {
        for fd in [self.stdin_fd, self.stdout_fd, self.stderr_fd].into_iter().flatten() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn open_redirect_fds(redirects: &[Redirect]) -> Result<RedirectFds, i32> {
    let mut fds = RedirectFds::default();
    for r in redirects {
        let opened = match r.kind {
            RedirectKind::Output => open_target(&r.target, false, true).map(|f| RedirectFds::replace(&mut fds.stdout_fd, f)),
            RedirectKind::Append => open_target(&r.target, true, true).map(|f| RedirectFds::replace(&mut fds.stdout_fd, f)),
            RedirectKind::Input => open_target(&r.target, false, false).map(|f| RedirectFds::replace(&mut fds.stdin_fd, f)),
            RedirectKind::Stderr => open_target(&r.target, false, true).map(|f| RedirectFds::replace(&mut fds.stderr_fd, f)),
            RedirectKind::FdDup { src_fd, dst_fd } => {
                fds.dup_actions.push((src_fd, dst_fd));
                Ok(())
            }
        };
        if let Err(status) = opened {
            fds.close();
            return Err(status);
        }
    }
    Ok(fds)
}

fn close_fd(fd: &mut i32) {
    if *fd >= 0 {
        unsafe {
            libc::close(*fd);
        }
        *fd = -1;
    }
}

/// パイプラインをプロセスグループとして起動し、foreground なら終了か停止まで待つ。
fn execute_job(shell: &mut Shell, segments: &[Segment], display: &str, background: bool) -> i32 {
    let n = segments.len();
    let mut pipes: Vec<[i32; 2]> = Vec::with_capacity(n.saturating_sub(1));
    for _ in 1..n {
        let mut p = [-1i32; 2];
        if unsafe { libc::pipe(p.as_mut_ptr()) } != 0 {
            eprintln!("rlsh: pipe: {}", io::Error::last_os_error());
            for created in pipes.iter_mut() {
                close_fd(&mut created[0]);
                close_fd(&mut created[1]);
            }
            return 1;
        }
        pipes.push(p);
    }

    let mut pids: Vec<libc::pid_t> = Vec::with_capacity(n);
    let mut pgid: libc::pid_t = 0;
    let mut failure: Option<i32> = None;

    for (i, segment) in segments.iter().enumerate() {
        let argv = argv_of(segment);
        let env = child_env(&shell.policy, segment);
        let redirs = match open_redirect_fds(&segment.redirects) {
            Ok(fds) => fds,
            Err(status) => {
                failure = Some(status);
                break;
            }
        };

        let stdin_fd = redirs.stdin_fd.or(if i > 0 { Some(pipes[i - 1][0]) } else { None });
        let stdout_fd = redirs.stdout_fd.or(if i + 1 < n { Some(pipes[i][1]) } else { None });
        let fds_to_close: Vec<i32> = pipes
            .iter()
            .flat_map(|p| [p[0], p[1]])
            .filter(|&fd| fd >= 0 && Some(fd) != stdin_fd && Some(fd) != stdout_fd)
            .collect();

        let result = spawn::spawn(&Launch {
            argv: &argv,
            env: &env,
            pgid,
            stdin_fd,
            stdout_fd,
            stderr_fd: redirs.stderr_fd,
            fds_to_close: &fds_to_close,
            dup2s: &redirs.dup_actions,
        });
        redirs.close();

        match result {
            Ok(pid) => {
                if pgid == 0 {
                    pgid = pid;
                }
                unsafe {
                    libc::setpgid(pid, pgid);
                }
                pids.push(pid);
            }
            Err(e) => {
                eprintln!("{}", e);
                failure = Some(e.exit_status());
                break;
            }
        }

        if i > 0 {
            close_fd(&mut pipes[i - 1][0]);
        }
        if i + 1 < n {
            close_fd(&mut pipes[i][1]);
        }
    }

    for p in pipes.iter_mut() {
        close_fd(&mut p[0]);
        close_fd(&mut p[1]);
    }

    if let Some(status) = failure {
        for &pid in &pids {
            spawn::wait_status(pid);
        }
        return status;
    }
    let Some(&last_pid) = pids.last() else {
        return 1;
    };

    if background {
        let id = shell.jobs.insert(pgid, display.to_string(), pids);
        println!("[{}] {} (pid: {})", id, display, pgid);
        return 0;
    }

    job::give_terminal_to(shell.terminal_fd, pgid);
    let (status, stopped) = job::wait_for_fg(&mut shell.jobs, pgid, last_pid);
    job::take_terminal_back(shell.terminal_fd, shell.shell_pgid);

    if stopped {
        let id = shell.jobs.insert_stopped(pgid, display.to_string(), pids);
        eprintln!("\n[{}]+  Stopped        {}", id, display);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::policy::PathPolicy;
    use crate::violation::TrackerState;

    /// どこでも許可するパスポリシーと、禁止文字なしのポリシー。
    fn open_shell(allowed: &[&str]) -> Shell {
        let mut policy = Policy::new("/");
        policy.strict = true;
        policy.paths = PathPolicy::new(vec!["/".into()], Vec::new()).unwrap();
        policy.forbidden.clear();
        policy.allowed.extend(allowed.iter().map(|s| s.to_string()));
        Shell::new("tester", policy, History::in_memory(0))
    }

    fn read(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    // ── リスト構造 ──

    #[test]
    fn pipes_group_into_pipelines() {
        let pieces = lexer::split("a | b && c; d &").unwrap();
        let list = pipelines(&pieces);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].stages, vec!["a", "b"]);
        assert_eq!(list[0].op, Operator::And);
        assert_eq!(list[2].op, Operator::Background);
    }

    #[test]
    fn and_or_short_circuit() {
        let mut shell = open_shell(&["true", "false"]);
        assert_eq!(run_line(&mut shell, "false && true"), 1);
        assert_eq!(run_line(&mut shell, "false || true"), 0);
        assert_eq!(run_line(&mut shell, "true && false || true"), 0);
        assert_eq!(run_line(&mut shell, "true; false"), 1);
        assert_eq!(shell.last_status, 1);
    }

    // ── 拒否 ──

    #[test]
    fn forbidden_command_rejects_whole_line() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let mut shell = open_shell(&["echo"]);
        let line = format!("echo hi > {}; rm -rf {}", marker.display(), dir.path().display());
        assert_eq!(run_line(&mut shell, &line), REJECTED);
        assert!(!marker.exists());
        assert_eq!(shell.tracker.state(), TrackerState::Warn(1));
    }

    #[test]
    fn kicked_out_after_warnings() {
        let mut shell = open_shell(&[]);
        shell.policy.warning_counter = 0;
        shell.tracker = crate::violation::Tracker::new(&shell.policy, "tester");
        run_line(&mut shell, "rm x");
        assert!(!shell.finished());
        run_line(&mut shell, "rm x");
        assert!(shell.kicked_out);
        assert_eq!(run_line(&mut shell, "true"), REJECTED);
    }

    #[test]
    fn incomplete_input_is_syntax_violation() {
        let mut shell = open_shell(&["echo"]);
        assert_eq!(reject_incomplete(&mut shell, "echo 'open"), REJECTED);
        assert_eq!(shell.tracker.state(), TrackerState::Warn(2));
    }

    // ── 実行 ──

    #[test]
    fn redirect_and_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut shell = open_shell(&["echo", "tr"]);
        let line = format!("echo hello | tr a-z A-Z > {}", out.display());
        assert_eq!(run_line(&mut shell, &line), 0);
        assert_eq!(read(&out), "HELLO\n");
    }

    #[test]
    fn assignments_scope() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut shell = open_shell(&["printenv"]);
        let line = format!("RLSH_EXEC_INLINE=1 printenv RLSH_EXEC_INLINE > {}", out.display());
        assert_eq!(run_line(&mut shell, &line), 0);
        assert_eq!(read(&out), "1\n");
        assert!(std::env::var_os("RLSH_EXEC_INLINE").is_none());

        assert_eq!(run_line(&mut shell, "RLSH_EXEC_SET=yes"), 0);
        assert_eq!(std::env::var("RLSH_EXEC_SET").as_deref(), Ok("yes"));
    }

    #[test]
    fn protected_assignment_rejected() {
        let before = std::env::var_os("PATH");
        let mut shell = open_shell(&[]);
        assert_eq!(run_line(&mut shell, "PATH=/tmp/evil"), REJECTED);
        assert_eq!(std::env::var_os("PATH"), before);
    }

    #[test]
    fn unknown_program_is_127() {
        let mut shell = open_shell(&["rlsh-no-such-program"]);
        assert_eq!(run_line(&mut shell, "rlsh-no-such-program"), 127);
    }

    #[test]
    fn builtin_in_pipeline_refused() {
        let mut shell = open_shell(&["cat"]);
        assert_eq!(run_line(&mut shell, "history | cat"), 1);
        assert_eq!(run_line(&mut shell, "jobs &"), 1);
    }

    #[test]
    fn background_job_registered() {
        let mut shell = open_shell(&["true"]);
        assert_eq!(run_line(&mut shell, "true &"), 0);
        assert_eq!(shell.jobs.iter().count(), 1);
        let pgid = shell.jobs.iter().next().unwrap().pgid;
        unsafe {
            libc::waitpid(pgid, std::ptr::null_mut(), 0);
        }
    }

    #[test]
    fn fg_returns_status_of_finished_job() {
        let mut shell = open_shell(&["sh"]);
        assert_eq!(run_line(&mut shell, "sh -c 'exit 3' &"), 0);
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert_eq!(run_line(&mut shell, "fg 1"), 3);
        assert_eq!(shell.last_status, 3);
        assert!(shell.jobs.is_empty());
    }

    // ── コマンド置換 ──

    #[test]
    fn quote_output_outside_quotes() {
        assert_eq!(quote_output("a b\nc", false), "'a' 'b' 'c'");
        assert_eq!(quote_output("it's", false), r"'it'\''s'");
        assert_eq!(quote_output("", false), "");
    }

    #[test]
    fn quote_output_inside_double_quotes() {
        assert_eq!(quote_output(r#"say "$x" \ `y`"#, true), r#"say \"\$x\" \\ \`y\`"#);
    }

    #[test]
    fn inner_text_strips_closer() {
        let chars: Vec<char> = "$(echo hi)".chars().collect();
        assert_eq!(inner_text(&chars, 2, 10, ')'), "echo hi");
        let open: Vec<char> = "$(echo".chars().collect();
        assert_eq!(inner_text(&open, 2, 6, ')'), "echo");
    }

    #[test]
    fn single_quoted_substitution_untouched() {
        let mut shell = open_shell(&[]);
        assert_eq!(substitute_commands(&mut shell, "echo '$(id)' '`id`'"), "echo '$(id)' '`id`'");
        assert_eq!(substitute_commands(&mut shell, r"echo \$(id)"), r"echo \$(id)");
    }

    #[test]
    fn substitution_output_is_data() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut shell = open_shell(&["echo", "printf"]);
        let line = format!("echo $(printf 'a;b') \"$(printf 'x  y')\" > {}", out.display());
        assert_eq!(run_line(&mut shell, &line), 0);
        assert_eq!(read(&out), "a;b x  y\n");
    }

    #[test]
    fn substituted_command_is_checked() {
        let mut shell = open_shell(&["echo"]);
        assert_eq!(run_line(&mut shell, "$(echo rm) -rf /nonexistent-rlsh"), REJECTED);
        assert_eq!(shell.tracker.state(), TrackerState::Warn(1));
    }
}
