//! rlsh: 制限付きログインシェル
//!
//! 起動: ユーザー解決 → 設定読み込み → ログ初期化 → 環境設定 → ログインスクリプト。
//! `-c` か `SSH_ORIGINAL_COMMAND` があれば強制コマンドとして 1 回だけ実行して終了し、
//! なければ REPL（プロンプト → 入力 → 検証 → 実行）に入る。

use std::env;
use std::io::{self, BufRead, IsTerminal};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

use rlsh::complete::RlshHelper;
use rlsh::config::{self, Identity, DEFAULT_CONFIG_PATH};
use rlsh::history::History;
use rlsh::lexer::{self, SplitError};
use rlsh::policy::Policy;
use rlsh::shell::Shell;
use rlsh::signal::{self, IdleTimer};
use rlsh::spawn::{self, Launch};
use rlsh::{executor, job, logging, ssh};

const DEFAULT_INTRO: &str = "You are in a limited shell.\nType 'help' to get the list of allowed commands";

#[derive(Parser, Debug)]
#[command(name = "rlsh", version, about = "Restricted login shell")]
struct Cli {
    /// 設定ファイル（未指定なら `$RLSH_CONFIG`、それもなければ /etc/rlsh.toml）
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// 強制コマンドとして 1 回だけ実行する
    #[arg(short = 'c', value_name = "COMMAND")]
    command: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let status = match run(&cli) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("rlsh: {:#}", e);
            1
        }
    };
    std::process::exit(status);
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let identity = Identity::current()?;
    let path = cli
        .config
        .clone()
        .or_else(|| env::var_os("RLSH_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let cfg = config::load(&path, &identity)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    logging::init(&cfg.global, &identity.user);

    let policy = cfg.policy;
    apply_environment(&policy);
    let history = History::open(&policy.history_file, policy.history_size);
    let mut shell = Shell::new(&identity.user, policy, history);
    let home = shell.policy.home_path.clone();
    shell
        .change_dir(&home)
        .with_context(|| format!("cannot enter home directory {}", home.display()))?;

    logging::session_start(&shell.user);
    if let Some(script) = shell.policy.login_script.clone() {
        run_login_script(&script);
    }

    let forced = cli
        .command
        .clone()
        .or_else(|| env::var("SSH_ORIGINAL_COMMAND").ok());
    let status = match forced {
        Some(command) => ssh::run_forced(&mut shell, &command),
        None => {
            println!("{}", shell.policy.intro.as_deref().unwrap_or(DEFAULT_INTRO));
            interactive(&mut shell)?
        }
    };

    let status = if shell.kicked_out { 1 } else { status };
    logging::session_end(&shell.user, status);
    Ok(status)
}

/// `env_path` を `PATH` の末尾に足し、`env_vars` と `HOME` を設定する。
fn apply_environment(policy: &Policy) {
    if let Some(extra) = &policy.env_path {
        let joined = match env::var("PATH") {
            Ok(current) if !current.is_empty() => format!("{}:{}", current, extra),
            _ => extra.clone(),
        };
        env::set_var("PATH", joined);
    }
    for (name, value) in &policy.env_vars {
        env::set_var(name, value);
    }
    env::set_var("HOME", &policy.home_path);
}

/// 管理者が設定したスクリプトなので検証にはかけない。
fn run_login_script(script: &str) {
    let argv = ["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
    match spawn::spawn(&Launch {
        argv: &argv,
        ..Launch::default()
    }) {
        Ok(pid) => {
            let status = spawn::wait_status(pid);
            if status != 0 {
                tracing::warn!("login_script exited with {}", status);
            }
        }
        Err(e) => tracing::error!("login_script: {}", e),
    }
}

// ── 入力 ────────────────────────────────────────────────────────────

enum Line {
    Text(String),
    Interrupted,
    Eof,
}

/// 端末なら rustyline、パイプやファイルなら 1 行ずつ素読み。
enum Input {
    Editor(Box<Editor<RlshHelper, DefaultHistory>>),
    Plain(io::StdinLock<'static>),
}

impl Input {
    fn open(shell: &Shell) -> anyhow::Result<Self> {
        if !io::stdin().is_terminal() {
            return Ok(Self::Plain(io::stdin().lock()));
        }
        let mut editor = Editor::<RlshHelper, DefaultHistory>::new().context("cannot initialize line editor")?;
        editor.set_helper(Some(RlshHelper::new(&shell.policy, shell.ssh)));
        for entry in shell.history.entries() {
            let _ = editor.add_history_entry(entry.as_str());
        }
        Ok(Self::Editor(Box::new(editor)))
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Editor(_))
    }

    fn read(&mut self, prompt: &str) -> Line {
        match self {
            Self::Editor(editor) => match editor.readline(prompt) {
                Ok(line) => Line::Text(line),
                Err(ReadlineError::Interrupted) => Line::Interrupted,
                Err(ReadlineError::Eof) => Line::Eof,
                Err(e) => {
                    tracing::error!("readline: {}", e);
                    Line::Eof
                }
            },
            Self::Plain(stdin) => {
                let mut buf = String::new();
                match stdin.read_line(&mut buf) {
                    Ok(0) => Line::Eof,
                    Ok(_) => Line::Text(buf.trim_end_matches(['\n', '\r']).to_string()),
                    Err(e) => {
                        tracing::error!("stdin: {}", e);
                        Line::Eof
                    }
                }
            }
        }
    }

    fn remember(&mut self, line: &str) {
        if let Self::Editor(editor) = self {
            let _ = editor.add_history_entry(line);
        }
    }
}

// ── REPL ────────────────────────────────────────────────────────────

fn interactive(shell: &mut Shell) -> anyhow::Result<i32> {
    signal::ignore_job_control();
    if io::stdin().is_terminal() {
        unsafe {
            let pid = libc::getpid();
            libc::setpgid(pid, pid);
            libc::tcsetpgrp(libc::STDIN_FILENO, pid);
        }
        shell.shell_pgid = unsafe { libc::getpgrp() };
    }

    let mut input = Input::open(shell)?;
    let timer = IdleTimer::install(shell.policy.timer);
    if timer.seconds() > 0 {
        logging::timer_armed(&shell.user, timer.seconds());
    }

    loop {
        job::reap_jobs(&mut shell.jobs);
        job::notify_and_clean(&mut shell.jobs);

        timer.arm();
        let mut line = match input.read(&shell.prompt()) {
            Line::Text(line) => line,
            Line::Interrupted => {
                timer.disarm();
                continue;
            }
            Line::Eof => {
                timer.disarm();
                if shell.policy.disable_exit && input.is_terminal() {
                    println!();
                    continue;
                }
                break;
            }
        };

        let mut incomplete = false;
        while matches!(lexer::split(&line), Err(SplitError::NeedsMoreInput)) {
            match input.read("> ") {
                Line::Text(next) => lexer::join_continuation(&mut line, &next),
                Line::Interrupted => {
                    line.clear();
                    break;
                }
                Line::Eof => {
                    incomplete = true;
                    break;
                }
            }
        }
        timer.disarm();

        if line.trim().is_empty() {
            continue;
        }
        input.remember(&line);
        shell.history.add(&line);
        if incomplete {
            executor::reject_incomplete(shell, &line);
        } else {
            executor::run_line(shell, &line);
        }
        if shell.finished() {
            break;
        }
    }

    Ok(shell.last_status)
}
