//! パスの展開（チルダ・環境変数・glob）と realpath 相当の正規化。
//!
//! 検証器と実行器は同じ展開関数を通すので、検証されたパスと実際に子プロセスへ渡るパスは一致する。

use std::borrow::Cow;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// glob メタ文字（`*`, `?`, `[`）を含むか。
pub fn has_glob_chars(s: &str) -> bool {
    s.bytes().any(|b| b == b'*' || b == b'?' || b == b'[')
}

// ── 展開 ────────────────────────────────────────────────────────────

/// 語頭の `~` / `~/path` / `~user/path` を展開する。展開できなければそのまま返す。
pub fn expand_tilde(s: &str) -> Cow<'_, str> {
    if !s.starts_with('~') {
        return Cow::Borrowed(s);
    }
    let rest_start = s[1..].find('/').map(|i| i + 1).unwrap_or(s.len());
    let user_part = &s[1..rest_start];
    let rest = &s[rest_start..];

    let home = if user_part.is_empty() {
        std::env::var("HOME").ok()
    } else {
        home_of(user_part)
    };
    match home {
        Some(h) => Cow::Owned(format!("{}{}", h, rest)),
        None => Cow::Borrowed(s),
    }
}

/// `getpwnam` でユーザーのホームディレクトリを引く。
pub fn home_of(user: &str) -> Option<String> {
    let c_user = std::ffi::CString::new(user).ok()?;
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let home = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) };
    home.to_str().ok().map(str::to_string)
}

/// `$VAR` / `${VAR}` を現在の環境で展開する。未定義の変数は残す。
pub fn expand_env(s: &str) -> Cow<'_, str> {
    if !s.contains('$') {
        return Cow::Borrowed(s);
    }
    shellexpand::env_with_context_no_errors(s, |name| std::env::var(name).ok())
}

/// glob を展開してソート済みで返す。マッチなし・不正パターンなら元の語を返す。
pub fn expand_glob(pattern: &str) -> Vec<String> {
    if !has_glob_chars(pattern) {
        return vec![pattern.to_string()];
    }
    let mut matches: Vec<String> = match glob::glob(pattern) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    if matches.is_empty() {
        return vec![pattern.to_string()];
    }
    matches.sort();
    matches
}

/// パス検査用の展開: チルダ → 環境変数 → glob。
pub fn expand_for_check(word: &str) -> Vec<String> {
    let tilde = expand_tilde(word);
    let env = expand_env(&tilde);
    expand_glob(&env)
}

/// 実行用の展開: チルダ → glob。環境変数は展開器が処理済み。
pub fn expand_for_exec(word: &str) -> Vec<String> {
    let tilde = expand_tilde(word);
    expand_glob(&tilde)
}

// ── 正規化 ──────────────────────────────────────────────────────────

/// `cwd` 基準で絶対パス化し、成分ごとにシンボリックリンクを解決する。
///
/// 存在しない成分に達したら以降は字句的に `.` / `..` を畳む。
/// `link/..` はリンク先の親になる（realpath と同じ）。
pub fn resolve_in(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut out = PathBuf::from("/");
    let mut exists = true;
    for comp in joined.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => {
                out.push(name);
                if exists {
                    match fs::canonicalize(&out) {
                        Ok(real) => out = real,
                        Err(_) => exists = false,
                    }
                }
            }
        }
    }
    out
}

/// カレントディレクトリ基準の [`resolve_in`]。カレントが取れなければ `None`。
pub fn resolve(path: &Path) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    Some(resolve_in(path, &cwd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_chars_detected() {
        assert!(has_glob_chars("*.rs"));
        assert!(has_glob_chars("file?.txt"));
        assert!(has_glob_chars("[abc]"));
        assert!(!has_glob_chars("plain"));
    }

    #[test]
    fn tilde_uses_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde("~/x"), format!("{}/x", home));
            assert_eq!(expand_tilde("~"), home);
        }
    }

    #[test]
    fn tilde_unknown_user_unchanged() {
        assert_eq!(expand_tilde("~no_such_user_rlsh/x"), "~no_such_user_rlsh/x");
        assert_eq!(expand_tilde("a~b"), "a~b");
    }

    #[test]
    fn env_undefined_left_in_place() {
        assert_eq!(expand_env("$RLSH_SURELY_UNSET_VAR/x"), "$RLSH_SURELY_UNSET_VAR/x");
        assert_eq!(expand_env("no vars"), "no vars");
    }

    #[test]
    fn glob_expands_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::write(dir.path().join("c.log"), "").unwrap();
        let pattern = format!("{}/*.txt", dir.path().display());
        let got = expand_glob(&pattern);
        assert_eq!(got.len(), 2);
        assert!(got[0].ends_with("a.txt"));
        assert!(got[1].ends_with("b.txt"));
    }

    #[test]
    fn glob_no_match_returns_pattern() {
        assert_eq!(expand_glob("/nonexistent_rlsh_dir/*.zz"), vec!["/nonexistent_rlsh_dir/*.zz"]);
    }

    #[test]
    fn resolve_collapses_dots_for_missing_paths() {
        let got = resolve_in(Path::new("a/./b/../c"), Path::new("/nonexistent_rlsh"));
        assert_eq!(got, PathBuf::from("/nonexistent_rlsh/a/c"));
    }

    #[test]
    fn resolve_cannot_escape_root() {
        let got = resolve_in(Path::new("../../../../x_rlsh"), Path::new("/"));
        assert_eq!(got, PathBuf::from("/x_rlsh"));
    }

    #[test]
    fn resolve_follows_symlink_before_parent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(base.join("real/inner")).unwrap();
        std::os::unix::fs::symlink(base.join("real/inner"), base.join("link")).unwrap();
        let got = resolve_in(Path::new("link/../x"), &base);
        assert_eq!(got, base.join("real/x"));
    }
}
