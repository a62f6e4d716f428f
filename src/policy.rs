//! 解決済みのセキュリティポリシー。
//!
//! [`config`](crate::config) が設定ファイルから 1 度だけ生成し、セッション中は不変。
//! 可変な状態（残り警告数、カレントディレクトリ）は [`Shell`](crate::shell::Shell) 側が持つ。

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;

/// プロセス内で実行するビルトイン（アルファベット順）。ポリシー上は常に許可される。
pub const BUILTINS: &[&str] = &[
    "bg", "cd", "exit", "export", "fg", "help", "history", "jobs", "lpath", "lsudo", "source",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.binary_search(&name).is_ok()
}

/// 既定の禁止文字・禁止シーケンス。
pub const DEFAULT_FORBIDDEN: &[&str] = &[";", "&", "|", "`", ">", "<", "$("];

// ── PathPolicy ──────────────────────────────────────────────────────

/// 許可/拒否パスの組。元のリテラルリストと、そこからコンパイルした前方一致 matcher を持つ。
#[derive(Debug, Clone)]
pub struct PathPolicy {
    allowed: Vec<String>,
    denied: Vec<String>,
    allow_re: Option<Regex>,
    deny_re: Option<Regex>,
}

impl PathPolicy {
    pub fn new(allowed: Vec<String>, denied: Vec<String>) -> Result<Self, regex::Error> {
        let allow_re = compile_prefixes(&allowed)?;
        let deny_re = compile_prefixes(&denied)?;
        Ok(Self {
            allowed,
            denied,
            allow_re,
            deny_re,
        })
    }

    /// 正規化済みの絶対パスがポリシーに適合するか。
    ///
    /// 末尾に `/` を付けて照合するため、`/home/u` は `/home/user2` に一致しない。
    pub fn permits(&self, canonical: &Path) -> bool {
        let mut s = canonical.to_string_lossy().into_owned();
        if !s.ends_with('/') {
            s.push('/');
        }
        let allowed = self.allow_re.as_ref().is_some_and(|re| re.is_match(&s));
        let denied = self.deny_re.as_ref().is_some_and(|re| re.is_match(&s));
        allowed && !denied
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn denied(&self) -> &[String] {
        &self.denied
    }
}

/// `["/a", "/b/"]` → `^(?:/a/|/b/)`。空リストなら `None`（何にも一致しない）。
fn compile_prefixes(list: &[String]) -> Result<Option<Regex>, regex::Error> {
    if list.is_empty() {
        return Ok(None);
    }
    let alternatives: Vec<String> = list
        .iter()
        .map(|p| format!("{}/", regex::escape(p.trim_end_matches('/'))))
        .collect();
    Regex::new(&format!("^(?:{})", alternatives.join("|"))).map(Some)
}

// ── Policy ──────────────────────────────────────────────────────────

/// ユーザー 1 人分の解決済みポリシー。
#[derive(Debug, Clone)]
pub struct Policy {
    /// 許可コマンド。`"echo asd"` のような複数語エントリを含みうる。
    pub allowed: BTreeSet<String>,
    /// noexec ラップを免除するコマンド。
    pub allowed_shell_escape: BTreeSet<String>,
    /// 許可するファイル拡張子（`.txt` 形式）。空なら無制限。
    pub allowed_file_extensions: BTreeSet<String>,
    /// 禁止文字・禁止シーケンス。
    pub forbidden: Vec<String>,
    /// `sudo` 経由で許可するサブコマンド。
    pub sudo_commands: BTreeSet<String>,
    /// SSH 強制コマンドとして許可するコマンド。
    pub overssh: BTreeSet<String>,
    pub paths: PathPolicy,
    /// エイリアス（コマンド名 → 置換文字列）。
    pub aliases: BTreeMap<String, String>,
    /// 残り警告数の初期値。`-1` は無制限（ログのみ）。
    pub warning_counter: i32,
    pub strict: bool,
    pub quiet: bool,
    pub disable_exit: bool,
    pub home_path: PathBuf,
    /// `LD_PRELOAD` で注入する noexec ライブラリ。
    pub path_noexec: Option<PathBuf>,
    /// 起動時に `PATH` へ追加するディレクトリ。
    pub env_path: Option<String>,
    /// 起動時に設定する環境変数。
    pub env_vars: BTreeMap<String, String>,
    /// アイドルタイムアウト（秒）。0 なら無効。
    pub timer: u32,
    pub intro: Option<String>,
    pub prompt: String,
    pub prompt_short: u8,
    pub history_size: usize,
    pub history_file: PathBuf,
    pub login_script: Option<String>,
    pub scp: bool,
    pub scp_upload: bool,
    pub scp_download: bool,
    pub sftp: bool,
}

impl Policy {
    /// ホームディレクトリだけを許可する最小ポリシー。設定解決の出発点とテストで使う。
    pub fn new(home_path: impl Into<PathBuf>) -> Self {
        let home_path = home_path.into();
        let home_str = home_path.to_string_lossy().into_owned();
        Self {
            allowed: BUILTINS.iter().map(|s| s.to_string()).collect(),
            allowed_shell_escape: BTreeSet::new(),
            allowed_file_extensions: BTreeSet::new(),
            forbidden: DEFAULT_FORBIDDEN.iter().map(|s| s.to_string()).collect(),
            sudo_commands: BTreeSet::new(),
            overssh: BTreeSet::new(),
            paths: PathPolicy::new(vec![home_str], Vec::new())
                .unwrap_or_else(|_| PathPolicy::empty()),
            aliases: BTreeMap::new(),
            warning_counter: 2,
            strict: false,
            quiet: false,
            disable_exit: false,
            history_file: home_path.join(".lhistory"),
            home_path,
            path_noexec: None,
            env_path: None,
            env_vars: BTreeMap::new(),
            timer: 0,
            intro: None,
            prompt: "%u".to_string(),
            prompt_short: 0,
            history_size: 100,
            login_script: None,
            scp: false,
            scp_upload: false,
            scp_download: false,
            sftp: false,
        }
    }

    /// コマンド判定に使う許可集合。SSH 強制コマンドでは `overssh` に差し替える。
    pub fn commands(&self, ssh: bool) -> &BTreeSet<String> {
        if ssh {
            &self.overssh
        } else {
            &self.allowed
        }
    }

    /// このコマンドを noexec ラップすべきなら注入するライブラリを返す。
    pub fn noexec_for(&self, command: &str) -> Option<&Path> {
        if self.allowed_shell_escape.contains(command) {
            return None;
        }
        self.path_noexec.as_deref()
    }

    /// 補完 UI 用: 違反カウンタに触れずにディレクトリ候補を判定する。
    pub fn validate_path_for_completion(&self, candidate_dir: &Path) -> bool {
        match crate::path::resolve(candidate_dir) {
            Some(canonical) => self.paths.permits(&canonical),
            None => false,
        }
    }
}

impl PathPolicy {
    fn empty() -> Self {
        Self {
            allowed: Vec::new(),
            denied: Vec::new(),
            allow_re: None,
            deny_re: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(allow: &[&str], deny: &[&str]) -> PathPolicy {
        PathPolicy::new(
            allow.iter().map(|s| s.to_string()).collect(),
            deny.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn builtins_sorted_for_binary_search() {
        let mut sorted = BUILTINS.to_vec();
        sorted.sort();
        assert_eq!(sorted, BUILTINS);
        assert!(is_builtin("cd"));
        assert!(!is_builtin("ls"));
    }

    #[test]
    fn prefix_match_respects_component_boundary() {
        let p = paths(&["/home/u"], &[]);
        assert!(p.permits(Path::new("/home/u")));
        assert!(p.permits(Path::new("/home/u/notes.txt")));
        assert!(!p.permits(Path::new("/home/user2")));
        assert!(!p.permits(Path::new("/etc/passwd")));
    }

    #[test]
    fn deny_overrides_allow() {
        let p = paths(&["/home/u/"], &["/home/u/secret"]);
        assert!(p.permits(Path::new("/home/u/public")));
        assert!(!p.permits(Path::new("/home/u/secret/key")));
    }

    #[test]
    fn root_allows_everything() {
        let p = paths(&["/"], &["/etc"]);
        assert!(p.permits(Path::new("/usr/bin")));
        assert!(!p.permits(Path::new("/etc/shadow")));
    }

    #[test]
    fn empty_allow_list_permits_nothing() {
        let p = paths(&[], &[]);
        assert!(!p.permits(Path::new("/")));
    }

    #[test]
    fn regex_metacharacters_are_escaped() {
        let p = paths(&["/srv/a+b"], &[]);
        assert!(p.permits(Path::new("/srv/a+b/x")));
        assert!(!p.permits(Path::new("/srv/aab/x")));
    }

    #[test]
    fn noexec_skips_shell_escape_commands() {
        let mut policy = Policy::new("/home/u");
        policy.path_noexec = Some(PathBuf::from("/usr/lib/sudo/sudo_noexec.so"));
        policy.allowed_shell_escape.insert("vim".to_string());
        assert!(policy.noexec_for("less").is_some());
        assert!(policy.noexec_for("vim").is_none());
    }
}
