//! ポリシー検証器: 1 行（またはセグメント）を実行前に検査し、違反を値として返す。
//!
//! ## 検査の段階
//!
//! | 段階 | 対象 | 内容 |
//! |---|---|---|
//! | 1 | 生の行 | 制御文字、禁止文字（`&&` / `||` は `&` / `|` に一致しない） |
//! | 2 | 生の行 | [`lexer::split`] が失敗したら構文違反 |
//! | 3 | 展開後の各セグメント | 禁止文字、置換の再帰検査、環境変数の保護、コマンド許可、sudo、パス、拡張子 |
//!
//! 段階 1・2 で違反があれば以降は検査しない。段階 3 はセグメント内の違反をすべて集める。
//! 検証はエラーを返さず、違反の有無だけを [`Report`] で伝える。

use std::fmt;
use std::path::{Path, PathBuf};

use crate::expand::{self, EnvView};
use crate::lexer;
use crate::parser::{self, Segment};
use crate::path;
use crate::policy::{self, Policy};

/// 代入・`export` を拒否する環境変数（完全一致）。`LD_` / `DYLD_` 接頭辞も拒否する。
pub const PROTECTED_ENV: &[&str] = &[
    "BASHOPTS",
    "BASH_ENV",
    "CDPATH",
    "ENV",
    "GCONV_PATH",
    "GLOBIGNORE",
    "HOSTALIASES",
    "IFS",
    "LOCALDOMAIN",
    "NODE_OPTIONS",
    "PATH",
    "PERL5LIB",
    "PERL5OPT",
    "PERLLIB",
    "PROMPT_COMMAND",
    "PS4",
    "PYTHONHOME",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "RES_OPTIONS",
    "RUBYLIB",
    "RUBYOPT",
    "SHELL",
    "SHELLOPTS",
];

/// 置換のネスト上限。超えたら構文違反。
const MAX_DEPTH: usize = 8;

pub fn is_protected_env(name: &str) -> bool {
    PROTECTED_ENV.contains(&name) || name.starts_with("LD_") || name.starts_with("DYLD_")
}

// ── 違反 ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    ControlCharacter,
    ForbiddenCharacter,
    ForbiddenCommand,
    ForbiddenSudo,
    ForbiddenPath,
    ForbiddenExtension,
    ProtectedEnv,
    Syntax,
}

impl ViolationKind {
    /// ログの `kind` フィールドに使う名前。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ControlCharacter => "control_character",
            Self::ForbiddenCharacter => "forbidden_character",
            Self::ForbiddenCommand => "forbidden_command",
            Self::ForbiddenSudo => "forbidden_sudo",
            Self::ForbiddenPath => "forbidden_path",
            Self::ForbiddenExtension => "forbidden_extension",
            Self::ProtectedEnv => "protected_env",
            Self::Syntax => "syntax",
        }
    }

    /// 警告カウンタを消費するか。構文エラーは消費しない。
    pub fn counts(self) -> bool {
        self != Self::Syntax
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            ViolationKind::ControlCharacter => "forbidden control character",
            ViolationKind::ForbiddenCharacter => "forbidden character",
            ViolationKind::ForbiddenCommand => "forbidden command",
            ViolationKind::ForbiddenSudo => "forbidden sudo command",
            ViolationKind::ForbiddenPath => "forbidden path",
            ViolationKind::ForbiddenExtension => "forbidden extension",
            ViolationKind::ProtectedEnv => "forbidden environment variable",
            ViolationKind::Syntax => "unknown syntax",
        };
        write!(f, "*** {}: {}", label, self.detail)
    }
}

/// 検証結果。
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Report {
    pub violations: Vec<Violation>,
    /// カレントディレクトリが許可範囲外だった。呼び出し側がホームへ戻す。
    pub reset_cwd: bool,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// 警告カウンタを消費する違反があるか。
    pub fn counts(&self) -> bool {
        self.violations.iter().any(|v| v.kind.counts())
    }

    fn push(&mut self, violation: Violation) {
        if !self.violations.contains(&violation) {
            self.violations.push(violation);
        }
    }

    fn merge(&mut self, other: Report) {
        for v in other.violations {
            self.push(v);
        }
        self.reset_cwd |= other.reset_cwd;
    }
}

// ── 検証器 ──────────────────────────────────────────────────────────

/// 1 セッション分の検証コンテキスト。
pub struct Validator<'a> {
    pub policy: &'a Policy,
    /// SSH 強制コマンドとして検証する（許可集合を `overssh` に差し替える）。
    pub ssh: bool,
    pub env: &'a dyn EnvView,
    /// 相対パスの基準。
    pub cwd: PathBuf,
}

impl<'a> Validator<'a> {
    pub fn new(policy: &'a Policy, ssh: bool, env: &'a dyn EnvView) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| policy.home_path.clone());
        Self {
            policy,
            ssh,
            env,
            cwd,
        }
    }

    /// 行全体を検査する。`last_status` は `$?` の展開に使う。
    pub fn check_line(&self, line: &str, last_status: i32) -> Report {
        let mut report = Report::default();
        if !self.policy.paths.permits(&self.cwd) {
            report.push(Violation::new(
                ViolationKind::ForbiddenPath,
                self.cwd.display().to_string(),
            ));
            report.reset_cwd = true;
        }
        report.merge(self.check_line_at(line, last_status, 0));
        report
    }

    /// 展開済みセグメントを 1 つ検査する。ディスパッチ直前の再検査に使う。
    pub fn check_segment(&self, expanded: &str, last_status: i32) -> Report {
        self.check_segment_at(expanded, last_status, 0)
    }

    fn check_line_at(&self, line: &str, last_status: i32, depth: usize) -> Report {
        let mut report = Report::default();

        // 段階 1
        for v in check_characters(line, &self.policy.forbidden) {
            report.push(v);
        }
        if !report.is_clean() {
            return report;
        }

        // 段階 2
        let pieces = match lexer::split(line) {
            Ok(p) => p,
            Err(_) => {
                report.push(Violation::new(ViolationKind::Syntax, line.trim()));
                return report;
            }
        };

        // 段階 3
        for (segment, _) in &pieces {
            let expanded = expand::expand(segment, &self.policy.aliases, self.env, last_status);
            report.merge(self.check_segment_at(&expanded, last_status, depth));
        }
        report
    }

    fn check_segment_at(&self, expanded: &str, last_status: i32, depth: usize) -> Report {
        let mut report = Report::default();
        for v in check_characters(expanded, &self.policy.forbidden) {
            report.push(v);
        }

        // 置換の中身を再帰的に検査
        let subs = substitutions(expanded);
        if !subs.commands.is_empty() && depth >= MAX_DEPTH {
            report.push(Violation::new(ViolationKind::Syntax, expanded.trim()));
            return report;
        }
        for inner in &subs.commands {
            report.merge(self.check_line_at(inner, last_status, depth + 1));
        }
        for operand in &subs.operands {
            self.check_path_word(operand, false, &mut report);
        }

        let segment = match parser::classify(expanded) {
            Ok(s) => s,
            Err(_) => {
                report.push(Violation::new(ViolationKind::Syntax, expanded.trim()));
                return report;
            }
        };

        self.check_env(&segment, &mut report);

        let bare_substitution = is_bare_substitution(expanded);
        if !bare_substitution {
            self.check_command(&segment, &mut report);
        }
        self.check_paths(&segment, &mut report);
        self.check_extensions(&segment, &mut report);
        report
    }

    // ── 個別の検査 ──

    fn check_env(&self, segment: &Segment, report: &mut Report) {
        for (name, _) in &segment.assignments {
            if is_protected_env(name) {
                report.push(Violation::new(ViolationKind::ProtectedEnv, name.clone()));
            }
        }
        if segment.executable.as_deref() == Some("export") {
            for arg in &segment.args {
                let name = arg.split('=').next().unwrap_or(arg);
                if is_protected_env(name) {
                    report.push(Violation::new(ViolationKind::ProtectedEnv, name));
                }
            }
        }
    }

    fn check_command(&self, segment: &Segment, report: &mut Report) {
        let Some(exe) = segment.executable.as_deref() else {
            return;
        };

        if exe == "sudo" && self.permits_command(segment) {
            self.check_sudo(segment, report);
            return;
        }
        if !self.permits_command(segment) {
            report.push(Violation::new(ViolationKind::ForbiddenCommand, exe));
        }
    }

    /// 実行ファイル名が許可集合にあるか、複数語エントリが呼び出しの語単位の前方一致になっているか。
    fn permits_command(&self, segment: &Segment) -> bool {
        let Some(exe) = segment.executable.as_deref() else {
            return true;
        };
        let allowed = self.policy.commands(self.ssh);
        if allowed.contains(exe) {
            return true;
        }
        if !self.ssh && policy::is_builtin(exe) {
            return true;
        }
        let argv = segment.argv();
        allowed.iter().any(|entry| {
            let words: Vec<&str> = entry.split_whitespace().collect();
            words.len() > 1
                && words.len() <= argv.len()
                && words.iter().zip(&argv).all(|(w, a)| *w == a.as_str())
        })
    }

    /// `sudo [-u USER] CMD ...` のみ受理する。
    fn check_sudo(&self, segment: &Segment, report: &mut Report) {
        let args = &segment.args;
        let mut i = 0;
        if args.first().map(String::as_str) == Some("-u") {
            if args.len() < 2 {
                report.push(Violation::new(ViolationKind::ForbiddenSudo, segment.raw.trim()));
                return;
            }
            i = 2;
        }
        match args.get(i) {
            None => {
                report.push(Violation::new(ViolationKind::ForbiddenSudo, segment.raw.trim()));
            }
            Some(flag) if flag.starts_with('-') => {
                report.push(Violation::new(ViolationKind::ForbiddenSudo, segment.raw.trim()));
            }
            Some(cmd) if !self.policy.sudo_commands.contains(cmd) => {
                report.push(Violation::new(ViolationKind::ForbiddenSudo, cmd.clone()));
            }
            Some(_) => {}
        }
    }

    fn check_paths(&self, segment: &Segment, report: &mut Report) {
        for (_, value) in &segment.assignments {
            self.check_path_word(value, false, report);
        }
        for (arg, &quoted) in segment.args.iter().zip(&segment.quoted) {
            self.check_path_word(arg, quoted, report);
            // `--file=/etc/passwd` の右辺
            if let Some((_, rhs)) = arg.split_once('=') {
                if rhs.starts_with('/') || rhs.starts_with('~') || rhs.contains("..") {
                    self.check_path_word(rhs, quoted, report);
                }
            }
        }
        for redirect in &segment.redirects {
            if !matches!(redirect.kind, parser::RedirectKind::FdDup { .. }) {
                self.check_path_word(&redirect.target, false, report);
            }
        }
    }

    fn check_path_word(&self, word: &str, quoted: bool, report: &mut Report) {
        if word.is_empty() || word.contains("$(") || word.contains('`') {
            return;
        }
        let candidates = if quoted {
            vec![word.to_string()]
        } else {
            path::expand_for_check(word)
        };
        for candidate in candidates {
            let resolved = path::resolve_in(Path::new(&candidate), &self.cwd);
            if !self.policy.paths.permits(&resolved) {
                report.push(Violation::new(
                    ViolationKind::ForbiddenPath,
                    resolved.display().to_string(),
                ));
            }
        }
    }

    fn check_extensions(&self, segment: &Segment, report: &mut Report) {
        if self.policy.allowed_file_extensions.is_empty() {
            return;
        }
        let Some(exe) = segment.executable.as_deref() else {
            return;
        };
        if policy::is_builtin(exe) {
            return;
        }
        for (arg, &quoted) in segment.args.iter().zip(&segment.quoted) {
            let candidates = if quoted {
                vec![arg.clone()]
            } else {
                path::expand_for_check(arg)
            };
            for candidate in candidates {
                let resolved = path::resolve_in(Path::new(&candidate), &self.cwd);
                if !resolved.is_file() {
                    continue;
                }
                let ext = resolved
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                if !self.policy.allowed_file_extensions.contains(&ext) {
                    let shown = if ext.is_empty() { "(none)".to_string() } else { ext };
                    report.push(Violation::new(
                        ViolationKind::ForbiddenExtension,
                        format!("{}: {}", shown, segment.raw.trim()),
                    ));
                }
            }
        }
    }
}

// ── 文字検査 ────────────────────────────────────────────────────────

/// 制御文字と禁止文字を検査する。
///
/// `&` / `|` は単独の出現だけを違反とする（`&&` / `||` は可）。
/// 行末（末尾空白を除く）の単独 `&` はバックグラウンド指定として許可する。
pub fn check_characters(text: &str, forbidden: &[String]) -> Vec<Violation> {
    let mut out = Vec::new();

    if let Some(c) = text.chars().find(|&c| c.is_control() && c != '\n' && c != '\t') {
        out.push(Violation::new(
            ViolationKind::ControlCharacter,
            format!("{:?}", c).trim_matches('\'').to_string(),
        ));
    }

    for token in forbidden {
        let hit = match token.as_str() {
            "" => false,
            "&" => has_lone(text, '&', true),
            "|" => has_lone(text, '|', false),
            t => text.contains(t),
        };
        if hit {
            out.push(Violation::new(ViolationKind::ForbiddenCharacter, token.clone()));
        }
    }
    out
}

/// 前後に同じ文字が隣接しない `c` があるか。
fn has_lone(text: &str, c: char, allow_trailing: bool) -> bool {
    let chars: Vec<char> = text.chars().collect();
    let last_non_ws = chars.iter().rposition(|ch| !ch.is_whitespace());
    (0..chars.len()).any(|i| {
        chars[i] == c
            && (i == 0 || chars[i - 1] != c)
            && chars.get(i + 1) != Some(&c)
            && !(allow_trailing && Some(i) == last_non_ws)
    })
}

// ── 置換 ────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Substitutions {
    /// `$( ... )` と `` `...` `` の中身。
    commands: Vec<String>,
    /// `${NAME op WORD}` の `WORD`。
    operands: Vec<String>,
}

/// シングルクォートの外にある置換を取り出す。
fn substitutions(text: &str) -> Substitutions {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut subs = Substitutions::default();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < len {
        let c = chars[i];
        if in_single {
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\\' => i += 2,
            '\'' if !in_double => {
                in_single = true;
                i += 1;
            }
            '"' => {
                in_double = !in_double;
                i += 1;
            }
            '`' => {
                let end = expand::find_closing_backtick(&chars, i + 1);
                let inner_end = if end > i + 1 && chars[end - 1] == '`' { end - 1 } else { end };
                subs.commands.push(chars[i + 1..inner_end].iter().collect());
                i = end;
            }
            '$' if chars.get(i + 1) == Some(&'(') => {
                let end = expand::find_closing_paren(&chars, i + 2);
                let inner_end = if end > i + 2 && chars[end - 1] == ')' { end - 1 } else { end };
                subs.commands.push(chars[i + 2..inner_end].iter().collect());
                i = end;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let close = chars[i + 2..]
                    .iter()
                    .position(|&ch| ch == '}')
                    .map(|p| i + 2 + p)
                    .unwrap_or(len);
                let inner: String = chars[i + 2..close].iter().collect();
                let operand = inner
                    .trim_start_matches(|ch: char| ch.is_ascii_alphanumeric() || ch == '_')
                    .trim_start_matches([':', '-', '+', '=', '?', '#', '%', '/']);
                if !operand.is_empty() {
                    subs.operands.push(operand.to_string());
                }
                i = close + 1;
            }
            _ => i += 1,
        }
    }
    subs
}

/// セグメント全体が 1 つの `$( ... )` または `` `...` `` か。
pub fn is_bare_substitution(text: &str) -> bool {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if trimmed.starts_with("$(") {
        expand::find_closing_paren(&chars, 2) == chars.len() && chars.last() == Some(&')')
    } else if trimmed.starts_with('`') && chars.len() > 1 {
        expand::find_closing_backtick(&chars, 1) == chars.len() && chars.last() == Some(&'`')
    } else {
        false
    }
}
