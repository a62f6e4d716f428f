//! SSH 強制コマンド（`SSH_ORIGINAL_COMMAND` / `-c`）の処理。
//!
//! 許可集合は `overssh` に差し替わる。`scp` と `sftp-server` だけは専用の設定
//! （`scp`, `scp_upload`, `scp_download`, `sftp`）で判定し、転送をログに残す。

use std::path::Path;

use crate::executor;
use crate::expand::ProcessEnv;
use crate::lexer::{self, Operator};
use crate::logging;
use crate::parser;
use crate::path;
use crate::shell::Shell;
use crate::spawn::{self, Launch};
use crate::validate::{self, Validator};

/// sshd が起動しうる sftp-server の置き場所。
const SFTP_SERVERS: &[&str] = &[
    "/usr/lib/openssh/sftp-server",
    "/usr/libexec/openssh/sftp-server",
    "/usr/lib/ssh/sftp-server",
    "/usr/libexec/sftp-server",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// `scp -f`: サーバーからクライアントへ
    Download,
    /// `scp -t`: クライアントからサーバーへ
    Upload,
}

/// 強制コマンドの種類。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forced {
    Scp {
        transfer: Transfer,
        /// オプション以外の引数すべて。scp はそれぞれを転送対象として扱う。
        paths: Vec<String>,
        argv: Vec<String>,
    },
    Sftp(String),
    /// それ以外。通常の検証器に `ssh = true` でかける。
    Command,
}

/// 強制コマンド文字列を分類する。演算子を含む行や解釈できない行は [`Forced::Command`]。
pub fn classify_forced(command: &str) -> Forced {
    match lexer::split(command) {
        Ok(pieces) if pieces.len() == 1 && pieces[0].1 == Operator::End => {}
        _ => return Forced::Command,
    }
    let Ok(segment) = parser::classify(command) else {
        return Forced::Command;
    };
    if !segment.assignments.is_empty() || !segment.redirects.is_empty() {
        return Forced::Command;
    }
    let Some(exe) = segment.executable.as_deref() else {
        return Forced::Command;
    };

    if Path::new(exe).file_name().is_some_and(|n| n == "sftp-server") && segment.args.is_empty() {
        return Forced::Sftp(exe.to_string());
    }
    if exe != "scp" {
        return Forced::Command;
    }

    let mut transfer = None;
    let mut paths = Vec::new();
    let mut options_done = false;
    for arg in &segment.args {
        if !options_done && arg == "--" {
            options_done = true;
        } else if !options_done && arg.starts_with('-') {
            if arg.contains('f') {
                transfer = Some(Transfer::Download);
            } else if arg.contains('t') {
                transfer = Some(Transfer::Upload);
            }
        } else {
            paths.push(arg.clone());
        }
    }
    match transfer {
        Some(transfer) if !paths.is_empty() => Forced::Scp {
            transfer,
            paths,
            argv: segment.argv(),
        },
        _ => Forced::Command,
    }
}

/// 強制コマンドを 1 回だけ実行し、プロセスの終了ステータスを返す。
pub fn run_forced(shell: &mut Shell, command: &str) -> i32 {
    shell.ssh = true;
    match classify_forced(command) {
        Forced::Scp {
            transfer,
            paths,
            argv,
        } => run_scp(shell, command, transfer, &paths, &argv),
        Forced::Sftp(server) => run_sftp(shell, command, &server),
        Forced::Command => {
            let report = Validator::new(&shell.policy, true, &ProcessEnv).check_line(command, 0);
            if !report.is_clean() {
                for v in &report.violations {
                    logging::violation(&shell.user, v.kind.as_str(), &v.detail);
                }
                return forbidden(shell, command);
            }
            executor::run_line(shell, command)
        }
    }
}

fn forbidden(shell: &Shell, command: &str) -> i32 {
    logging::violation(&shell.user, "forbidden_ssh_command", command);
    eprintln!("*** forbidden command over SSH: \"{}\"", command);
    1
}

/// 対象パスが 1 つでも許可外なら何も転送しない。
fn run_scp(shell: &mut Shell, command: &str, transfer: Transfer, targets: &[String], argv: &[String]) -> i32 {
    let policy = &shell.policy;
    let permitted = policy.scp
        && match transfer {
            Transfer::Download => policy.scp_download,
            Transfer::Upload => policy.scp_upload,
        };
    if !permitted || !targets.iter().all(|t| scp_target_allowed(shell, t)) {
        return forbidden(shell, command);
    }

    for target in targets {
        match transfer {
            Transfer::Download => logging::scp_get(&shell.user, target),
            Transfer::Upload => logging::scp_put(&shell.user, target),
        }
    }
    launch(argv)
}

fn scp_target_allowed(shell: &Shell, target: &str) -> bool {
    if !validate::check_characters(target, &shell.policy.forbidden).is_empty() {
        return false;
    }
    let expanded = path::expand_tilde(target);
    path::resolve(Path::new(expanded.as_ref())).is_some_and(|p| shell.policy.paths.permits(&p))
}

fn run_sftp(shell: &mut Shell, command: &str, server: &str) -> i32 {
    if !shell.policy.sftp || !SFTP_SERVERS.contains(&server) {
        return forbidden(shell, command);
    }
    logging::sftp_connect(&shell.user);
    let status = launch(&[server.to_string()]);
    logging::sftp_disconnect(&shell.user);
    status
}

/// 標準入出力をそのまま引き継いで起動し、終了を待つ。
fn launch(argv: &[String]) -> i32 {
    match spawn::spawn(&Launch {
        argv,
        ..Launch::default()
    }) {
        Ok(pid) => spawn::wait_status(pid),
        Err(e) => {
            eprintln!("{}", e);
            e.exit_status()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::policy::{PathPolicy, Policy};

    fn shell_with(policy: Policy) -> Shell {
        Shell::new("tester", policy, History::in_memory(0))
    }

    fn open_policy() -> Policy {
        let mut policy = Policy::new("/");
        policy.paths = PathPolicy::new(vec!["/".into()], Vec::new()).unwrap();
        policy
    }

    // ── 分類 ──

    #[test]
    fn scp_directions() {
        assert_eq!(
            classify_forced("scp -f /home/u/a.txt"),
            Forced::Scp {
                transfer: Transfer::Download,
                paths: vec!["/home/u/a.txt".into()],
                argv: vec!["scp".into(), "-f".into(), "/home/u/a.txt".into()],
            }
        );
        assert!(matches!(
            classify_forced("scp -v -t -- upload"),
            Forced::Scp { transfer: Transfer::Upload, ref paths, .. } if paths == &["upload"]
        ));
    }

    #[test]
    fn scp_collects_every_source() {
        assert!(matches!(
            classify_forced("scp -f /etc/shadow /home/u/ok.txt"),
            Forced::Scp { ref paths, .. } if paths == &["/etc/shadow", "/home/u/ok.txt"]
        ));
    }

    #[test]
    fn scp_without_direction_is_plain_command() {
        assert_eq!(classify_forced("scp a b"), Forced::Command);
        assert_eq!(classify_forced("scp -t"), Forced::Command);
    }

    #[test]
    fn sftp_and_chains() {
        assert_eq!(
            classify_forced("/usr/lib/openssh/sftp-server"),
            Forced::Sftp("/usr/lib/openssh/sftp-server".into())
        );
        assert_eq!(classify_forced("scp -f x; id"), Forced::Command);
        assert_eq!(classify_forced("ls"), Forced::Command);
    }

    // ── 実行可否 ──

    #[test]
    fn overssh_replaces_allowed() {
        let mut policy = open_policy();
        policy.allowed.insert("true".into());
        let mut shell = shell_with(policy);
        assert_eq!(run_forced(&mut shell, "true"), 1);

        let mut policy = open_policy();
        policy.overssh.insert("true".into());
        let mut shell = shell_with(policy);
        assert_eq!(run_forced(&mut shell, "true"), 0);
    }

    #[test]
    fn scp_requires_flags() {
        let mut policy = open_policy();
        policy.scp = true;
        let mut shell = shell_with(policy);
        assert_eq!(run_forced(&mut shell, "scp -f /etc/hostname"), 1);
        assert_eq!(run_forced(&mut shell, "scp -t /tmp"), 1);
    }

    #[test]
    fn scp_path_checked() {
        let mut policy = Policy::new("/rlsh-home");
        policy.scp = true;
        policy.scp_download = true;
        let mut shell = shell_with(policy);
        assert_eq!(run_forced(&mut shell, "scp -f /etc/passwd"), 1);
    }

    #[test]
    fn scp_rejects_any_forbidden_source() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().canonicalize().unwrap();
        let allowed = home.join("ok.txt");
        std::fs::write(&allowed, "ok").unwrap();

        let mut policy = Policy::new(home.to_str().unwrap());
        policy.scp = true;
        policy.scp_download = true;
        let mut shell = shell_with(policy);
        let line = format!("scp -f /etc/passwd {}", allowed.display());
        assert_eq!(run_forced(&mut shell, &line), 1);
    }

    #[test]
    fn sftp_requires_flag_and_known_server() {
        let mut shell = shell_with(open_policy());
        assert_eq!(run_forced(&mut shell, "/usr/lib/openssh/sftp-server"), 1);

        let mut policy = open_policy();
        policy.sftp = true;
        let mut shell = shell_with(policy);
        assert_eq!(run_forced(&mut shell, "/tmp/sftp-server"), 1);
    }
}
