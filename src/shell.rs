//! セッション状態。
//!
//! 環境変数は `std::env` を直接使い、子プロセスへの継承に任せる。
//! ポリシーは起動時に一度だけ解決され、セッション中に変わるのは
//! 警告カウンタ（[`Tracker`]）とカレントディレクトリ（`oldpwd` を含む）だけ。

use std::path::{Path, PathBuf};

use libc::pid_t;

use crate::history::History;
use crate::job::JobTable;
use crate::policy::Policy;
use crate::violation::Tracker;

pub struct Shell {
    pub user: String,
    pub policy: Policy,
    pub tracker: Tracker,
    pub jobs: JobTable,
    pub history: History,
    /// 直前のコマンドの終了ステータス。`$?` に展開される。
    pub last_status: i32,
    /// `exit` で true になり、REPL を終える。
    pub should_exit: bool,
    /// 警告を使い切って強制終了する。
    pub kicked_out: bool,
    /// SSH 強制コマンドとして動いている（許可集合が `overssh` になる）。
    pub ssh: bool,
    /// `cd -` の戻り先。
    pub oldpwd: Option<PathBuf>,
    pub shell_pgid: pid_t,
    pub terminal_fd: i32,
    /// `source` のネスト深さ。
    pub source_depth: usize,
}

impl Shell {
    pub fn new(user: &str, policy: Policy, history: History) -> Self {
        let tracker = Tracker::new(&policy, user);
        Self {
            user: user.to_string(),
            tracker,
            policy,
            jobs: JobTable::new(),
            history,
            last_status: 0,
            should_exit: false,
            kicked_out: false,
            ssh: false,
            oldpwd: None,
            shell_pgid: unsafe { libc::getpgrp() },
            terminal_fd: libc::STDIN_FILENO,
            source_depth: 0,
        }
    }

    /// 対話セッションを終えるべきか。
    pub fn finished(&self) -> bool {
        self.should_exit || self.kicked_out
    }

    /// カレントディレクトリを変え、`PWD` / `OLDPWD` と `oldpwd` を更新する。
    pub fn change_dir(&mut self, target: &Path) -> std::io::Result<()> {
        let previous = std::env::current_dir().ok();
        std::env::set_current_dir(target)?;
        if let Ok(now) = std::env::current_dir() {
            std::env::set_var("PWD", &now);
        }
        if let Some(prev) = previous {
            std::env::set_var("OLDPWD", &prev);
            self.oldpwd = Some(prev);
        }
        Ok(())
    }

    /// 許可範囲外にいたときの復帰処理。
    pub fn return_home(&mut self) {
        let home = self.policy.home_path.clone();
        if let Err(e) = self.change_dir(&home) {
            tracing::error!("cannot return to home {}: {}", home.display(), e);
        }
    }

    /// プロンプト文字列。`%u` はユーザー、`%h` はホスト名。
    pub fn prompt(&self) -> String {
        let head = self
            .policy
            .prompt
            .replace("%u", &self.user)
            .replace("%h", &hostname());
        let cwd = std::env::current_dir().unwrap_or_else(|_| self.policy.home_path.clone());
        format!("{}:{}$ ", head, display_cwd(&cwd, &self.policy.home_path, self.policy.prompt_short))
    }
}

/// `prompt_short`: 0 = ホーム相対（`~`）、1 = 末尾の名前だけ、2 = フルパス。
pub fn display_cwd(cwd: &Path, home: &Path, prompt_short: u8) -> String {
    match prompt_short {
        1 => cwd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string()),
        2 => cwd.display().to_string(),
        _ => match cwd.strip_prefix(home) {
            Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => cwd.display().to_string(),
        },
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ok = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) } == 0;
    if !ok {
        return String::new();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    name.split('.').next().unwrap_or_default().to_string()
}
