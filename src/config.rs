//! 設定ファイルの読み込みとユーザーごとのポリシー解決。
//!
//! | セクション | 用途 |
//! |---|---|
//! | `[global]` | ログ設定（`logpath` / `loglevel` / `logfilename`） |
//! | `[default]` | 全ユーザー共通 |
//! | `["grp:<group>"]` | 所属グループごと（OS が返す順） |
//! | `[<user>]` | ユーザー個別 |
//!
//! 組み込み既定値 → `[default]` → グループ → ユーザー の順に重ね、後のものが勝つ。
//! 値はネイティブな TOML 値か、[`literal`](crate::literal) 式を書いた文字列。
//! 先頭が `+` / `-` の式は下位セクションから継承した値への差分になる。

use std::collections::BTreeMap;
use std::ffi::CStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::literal::{self, Expr, LiteralError, Sign, Value};
use crate::path;
use crate::policy::{PathPolicy, Policy, DEFAULT_FORBIDDEN};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rlsh.toml";

/// `path_noexec` 未指定時に探す場所。
const NOEXEC_CANDIDATES: &[&str] = &[
    "/usr/lib/sudo/sudo_noexec.so",
    "/usr/libexec/sudo/sudo_noexec.so",
    "/usr/lib64/sudo/sudo_noexec.so",
    "/usr/local/libexec/sudo/sudo_noexec.so",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("[{section}] {key}: {source}")]
    Literal {
        section: String,
        key: String,
        #[source]
        source: LiteralError,
    },
    #[error("[{section}] {key}: {message}")]
    Invalid {
        section: String,
        key: String,
        message: String,
    },
    #[error("[{section}] unknown key `{key}`")]
    UnknownKey { section: String, key: String },
    #[error("invalid path pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("cannot resolve the current user (uid {0})")]
    NoUser(u32),
}

// ── 入力 ────────────────────────────────────────────────────────────

/// `[global]` セクション。ログ出力先だけを持つ。
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalConfig {
    pub logpath: PathBuf,
    /// 0 = off, 1 = error, 2 = warn, 3 = info, 4 = debug
    pub loglevel: u8,
    /// `%u` / `%y` / `%m` / `%d` を置換したものが `<logpath>/<logfilename>.log` になる。
    pub logfilename: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            logpath: PathBuf::from("/var/log/rlsh"),
            loglevel: 2,
            logfilename: "%y%m%d-%u".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    global: GlobalConfig,
    #[serde(flatten)]
    sections: BTreeMap<String, toml::Table>,
}

/// 設定を解決する対象ユーザー。
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: String,
    pub home: PathBuf,
    /// 所属グループ名（主グループが先頭）。
    pub groups: Vec<String>,
}

impl Identity {
    /// 実 UID から `getpwuid` / `getgroups` で現在のユーザーを引く。
    pub fn current() -> Result<Self, ConfigError> {
        let uid = unsafe { libc::getuid() };
        let pw = unsafe { libc::getpwuid(uid) };
        if pw.is_null() {
            return Err(ConfigError::NoUser(uid));
        }
        let (user, home, primary) = unsafe {
            (
                CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned(),
                PathBuf::from(CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned()),
                (*pw).pw_gid,
            )
        };

        let mut gids = vec![primary];
        let n = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
        if n > 0 {
            let mut buf = vec![0 as libc::gid_t; n as usize];
            let got = unsafe { libc::getgroups(n, buf.as_mut_ptr()) };
            if got > 0 {
                buf.truncate(got as usize);
                for gid in buf {
                    if !gids.contains(&gid) {
                        gids.push(gid);
                    }
                }
            }
        }
        let groups = gids.into_iter().filter_map(group_name).collect();

        Ok(Self { user, home, groups })
    }
}

fn group_name(gid: libc::gid_t) -> Option<String> {
    let gr = unsafe { libc::getgrgid(gid) };
    if gr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr((*gr).gr_name) }.to_string_lossy().into_owned())
}

/// 読み込み結果。
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub policy: Policy,
}

/// 設定ファイルを読み込み、`id` のポリシーを解決する。
pub fn load(path: &Path, id: &Identity) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, id)
}

/// TOML テキストからポリシーを解決する。
pub fn parse(text: &str, id: &Identity) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;

    let mut draft = Draft::default();
    let mut order: Vec<String> = vec!["default".to_string()];
    order.extend(id.groups.iter().map(|g| format!("grp:{g}")));
    order.push(id.user.clone());

    for name in &order {
        if let Some(table) = raw.sections.get(name) {
            tracing::debug!(section = %name, "applying config section");
            draft.apply_section(name, table)?;
        }
    }

    let policy = draft.finish(id)?;
    Ok(Config {
        global: raw.global,
        policy,
    })
}

// ── 重ね合わせ ──────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    List,
    Map,
    Path,
    Scalar,
}

fn kind_of(key: &str) -> Option<Kind> {
    let kind = match key {
        "allowed" | "allowed_shell_escape" | "allowed_file_extensions" | "forbidden"
        | "sudo_commands" | "overssh" | "allowed_cmd_path" => Kind::List,
        "aliases" | "env_vars" => Kind::Map,
        "path" => Kind::Path,
        "home_path" | "env_path" | "warning_counter" | "strict" | "quiet" | "disable_exit"
        | "timer" | "intro" | "prompt" | "prompt_short" | "history_size" | "history_file"
        | "login_script" | "scp" | "scp_upload" | "scp_download" | "sftp" | "path_noexec" => {
            Kind::Scalar
        }
        _ => return None,
    };
    Some(kind)
}

/// エラー報告用の位置（セクション名 + キー）。
struct Site<'a> {
    section: &'a str,
    key: &'a str,
}

impl Site<'_> {
    fn literal(&self, source: LiteralError) -> ConfigError {
        ConfigError::Literal {
            section: self.section.to_string(),
            key: self.key.to_string(),
            source,
        }
    }

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            section: self.section.to_string(),
            key: self.key.to_string(),
            message: message.into(),
        }
    }
}

/// 解決途中の値。キーごとに最後に適用された結果を保持する。
struct Draft {
    lists: BTreeMap<String, Vec<Value>>,
    maps: BTreeMap<String, Vec<(String, Value)>>,
    path_allow: Option<Vec<Value>>,
    path_deny: Vec<Value>,
    scalars: BTreeMap<String, Value>,
}

impl Default for Draft {
    fn default() -> Self {
        let mut lists = BTreeMap::new();
        lists.insert(
            "forbidden".to_string(),
            DEFAULT_FORBIDDEN.iter().map(|s| Value::Str(s.to_string())).collect(),
        );
        let mut scalars = BTreeMap::new();
        scalars.insert("warning_counter".to_string(), Value::Int(2));
        Self {
            lists,
            maps: BTreeMap::new(),
            path_allow: None,
            path_deny: Vec::new(),
            scalars,
        }
    }
}

impl Draft {
    fn apply_section(&mut self, section: &str, table: &toml::Table) -> Result<(), ConfigError> {
        for (key, raw) in table {
            let site = Site { section, key };
            let kind = kind_of(key).ok_or_else(|| ConfigError::UnknownKey {
                section: section.to_string(),
                key: key.clone(),
            })?;
            let expr = to_expr(raw, kind, &site)?;

            match kind {
                Kind::List => {
                    let base = self.lists.get(key).map(Vec::as_slice).unwrap_or(&[]);
                    let (list, _) = expr.apply_list(base).map_err(|e| site.literal(e))?;
                    self.lists.insert(key.clone(), list);
                }
                Kind::Map => {
                    let base = self.maps.get(key).map(Vec::as_slice).unwrap_or(&[]);
                    let map = expr.apply_map(base).map_err(|e| site.literal(e))?;
                    self.maps.insert(key.clone(), map);
                }
                Kind::Path => {
                    let base = self.path_allow.as_deref().unwrap_or(&[]);
                    let (allow, removed) = expr.apply_list(base).map_err(|e| site.literal(e))?;
                    if !expr.incremental {
                        self.path_deny.clear();
                    }
                    for item in removed {
                        if !self.path_deny.contains(&item) {
                            self.path_deny.push(item);
                        }
                    }
                    self.path_allow = Some(allow);
                }
                Kind::Scalar => {
                    let value = expr
                        .as_scalar()
                        .cloned()
                        .ok_or_else(|| site.invalid("expected a single value"))?;
                    self.scalars.insert(key.clone(), value);
                }
            }
        }
        Ok(())
    }

    // ── 取り出し ──

    fn strings(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let site = Site { section: "resolved", key };
        self.lists
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|v| v.to_text().ok_or_else(|| site.invalid("list items must be strings")))
            .collect()
    }

    fn map(&self, key: &str) -> Result<BTreeMap<String, String>, ConfigError> {
        let site = Site { section: "resolved", key };
        self.maps
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|(k, v)| {
                v.to_text()
                    .map(|text| (k.clone(), text))
                    .ok_or_else(|| site.invalid("mapping values must be strings"))
            })
            .collect()
    }

    fn text(&self, key: &str) -> Option<String> {
        self.scalars.get(key).and_then(Value::to_text)
    }

    fn int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        let site = Site { section: "resolved", key };
        match self.scalars.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| site.invalid(format!("expected an integer, got `{s}`"))),
            Some(v) => v
                .as_int()
                .map(Some)
                .ok_or_else(|| site.invalid("expected an integer")),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        Ok(self.int(key)?.unwrap_or(0) != 0)
    }

    fn bounded<T: TryFrom<i64>>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.int(key)? {
            None => Ok(default),
            Some(n) => T::try_from(n).map_err(|_| {
                Site { section: "resolved", key }.invalid(format!("value {n} is out of range"))
            }),
        }
    }

    fn finish(self, id: &Identity) -> Result<Policy, ConfigError> {
        let home = match self.text("home_path") {
            Some(h) => PathBuf::from(substitute_user(&h, &id.user)),
            None => id.home.clone(),
        };
        let mut policy = Policy::new(home.clone());

        // ── コマンド集合 ──
        let mut allowed = self.strings("allowed")?;
        if let Some(pos) = allowed.iter().position(|c| c == "all") {
            allowed.remove(pos);
            let search = std::env::var("PATH").unwrap_or_default();
            let extra = self.text("env_path").unwrap_or_default();
            for dir in search.split(':').chain(extra.split(':')).filter(|d| !d.is_empty()) {
                allowed.extend(executables_in(Path::new(dir)));
            }
        }
        for dir in self.strings("allowed_cmd_path")? {
            allowed.extend(executables_in(Path::new(&dir)));
        }
        policy.allowed.extend(allowed);

        policy.sudo_commands = self.strings("sudo_commands")?.into_iter().collect();
        if !policy.sudo_commands.is_empty() {
            policy.allowed.insert("sudo".to_string());
        }
        policy.allowed_shell_escape = self.strings("allowed_shell_escape")?.into_iter().collect();
        policy.allowed_file_extensions = self
            .strings("allowed_file_extensions")?
            .into_iter()
            .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
            .collect();
        policy.forbidden = self.strings("forbidden")?;
        policy.overssh = self.strings("overssh")?.into_iter().collect();

        // ── パス ──
        let to_canonical = |items: &[Value]| -> Result<Vec<String>, ConfigError> {
            items
                .iter()
                .map(|v| {
                    let text = v.to_text().ok_or_else(|| {
                        Site { section: "resolved", key: "path" }.invalid("paths must be strings")
                    })?;
                    let text = substitute_user(&path::expand_tilde(&text), &id.user);
                    let canonical = path::resolve_in(Path::new(&text), &home);
                    Ok(canonical.to_string_lossy().into_owned())
                })
                .collect()
        };
        // ホームは常に許可
        let mut allow = to_canonical(self.path_allow.as_deref().unwrap_or(&[]))?;
        let home_canonical = path::resolve_in(&home, Path::new("/")).to_string_lossy().into_owned();
        if !allow.contains(&home_canonical) {
            allow.push(home_canonical);
        }
        let deny = to_canonical(&self.path_deny)?;
        policy.paths = PathPolicy::new(allow, deny)?;

        // ── その他 ──
        policy.aliases = self.map("aliases")?;
        policy.env_vars = self.map("env_vars")?;
        policy.env_path = self.text("env_path");
        policy.warning_counter = self.bounded("warning_counter", 2)?;
        policy.strict = self.flag("strict")?;
        policy.quiet = self.flag("quiet")?;
        policy.disable_exit = self.flag("disable_exit")?;
        policy.timer = self.bounded("timer", 0)?;
        policy.intro = self.text("intro");
        if let Some(p) = self.text("prompt") {
            policy.prompt = p;
        }
        policy.prompt_short = self.bounded("prompt_short", 0)?;
        policy.history_size = self.bounded("history_size", 100)?;
        if let Some(h) = self.text("history_file") {
            let h = substitute_user(&h, &id.user);
            policy.history_file = home.join(path::expand_tilde(&h).as_ref());
        }
        policy.login_script = self.text("login_script");
        policy.scp = self.flag("scp")?;
        policy.scp_upload = self.flag("scp_upload")?;
        policy.scp_download = self.flag("scp_download")?;
        policy.sftp = self.flag("sftp")?;
        policy.path_noexec = match self.text("path_noexec") {
            Some(p) if !p.is_empty() => Some(PathBuf::from(p)),
            Some(_) => None,
            None => NOEXEC_CANDIDATES.iter().map(PathBuf::from).find(|p| p.is_file()),
        };

        Ok(policy)
    }
}

/// TOML 値をリテラル式に変換する。
///
/// 文字列はリテラル式として解釈するが、スカラーキーの素の文字列と、
/// リストキーでもクォートや括弧で始まらない素の文字列（`"all"` など）はそのまま 1 つの値になる。
fn to_expr(raw: &toml::Value, kind: Kind, site: &Site<'_>) -> Result<Expr, ConfigError> {
    if let toml::Value::String(s) = raw {
        if looks_like_literal(s, kind) {
            return literal::parse(s).map_err(|e| site.literal(e));
        }
    }
    Ok(Expr {
        incremental: false,
        terms: vec![(Sign::Plus, from_toml(raw, site)?)],
    })
}

fn looks_like_literal(s: &str, kind: Kind) -> bool {
    match s.trim_start().chars().next() {
        Some('\'' | '"' | '[' | '{') => true,
        Some('+' | '-') => kind != Kind::Scalar,
        _ => false,
    }
}

fn from_toml(raw: &toml::Value, site: &Site<'_>) -> Result<Value, ConfigError> {
    Ok(match raw {
        toml::Value::String(s) => Value::Str(s.clone()),
        toml::Value::Integer(n) => Value::Int(*n),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Array(items) => Value::List(
            items
                .iter()
                .map(|v| from_toml(v, site))
                .collect::<Result<_, _>>()?,
        ),
        toml::Value::Table(table) => Value::Map(
            table
                .iter()
                .map(|(k, v)| Ok((k.clone(), from_toml(v, site)?)))
                .collect::<Result<_, ConfigError>>()?,
        ),
        other => {
            return Err(site.invalid(format!("unsupported value type `{}`", other.type_str())))
        }
    })
}

fn substitute_user(s: &str, user: &str) -> String {
    s.replace("%u", user)
}

/// ディレクトリ直下の実行可能ファイル名。読めなければ空。
pub fn executables_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for entry in entries.flatten() {
        let is_exec = entry
            .path()
            .metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);
        if is_exec {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice(home: &Path) -> Identity {
        Identity {
            user: "alice".to_string(),
            home: home.to_path_buf(),
            groups: vec!["alice".to_string(), "dev".to_string()],
        }
    }

    fn resolve(toml_text: &str) -> Policy {
        parse(toml_text, &alice(Path::new("/home/alice"))).unwrap().policy
    }

    // ── 既定値 ──

    #[test]
    fn empty_file_gives_defaults() {
        let policy = resolve("");
        assert_eq!(policy.forbidden, DEFAULT_FORBIDDEN);
        assert_eq!(policy.warning_counter, 2);
        assert!(!policy.strict);
        assert!(policy.allowed.contains("cd"));
        assert!(policy.allowed.contains("lpath"));
        assert!(policy.overssh.is_empty());
        assert_eq!(policy.history_size, 100);
    }

    #[test]
    fn global_section_parsed() {
        let cfg = parse(
            "[global]\nlogpath = \"/tmp/logs\"\nloglevel = 4\n",
            &alice(Path::new("/home/alice")),
        )
        .unwrap();
        assert_eq!(cfg.global.logpath, PathBuf::from("/tmp/logs"));
        assert_eq!(cfg.global.loglevel, 4);
        assert_eq!(cfg.global.logfilename, "%y%m%d-%u");
    }

    // ── 優先順位 ──

    #[test]
    fn user_overrides_group_overrides_default() {
        let policy = resolve(
            r#"
[default]
warning_counter = 5
strict = 1

["grp:dev"]
warning_counter = 3

[alice]
warning_counter = 1
"#,
        );
        assert_eq!(policy.warning_counter, 1);
        assert!(policy.strict);
    }

    #[test]
    fn incremental_list_builds_on_inherited() {
        let policy = resolve(
            r#"
[default]
allowed = "['ls', 'echo']"

[alice]
allowed = "+ ['vim'] - ['ls']"
"#,
        );
        assert!(policy.allowed.contains("echo"));
        assert!(policy.allowed.contains("vim"));
        assert!(!policy.allowed.contains("ls"));
    }

    #[test]
    fn non_incremental_list_replaces() {
        let policy = resolve(
            r#"
[default]
allowed = ["ls", "echo"]

[alice]
allowed = ["cat"]
"#,
        );
        assert!(policy.allowed.contains("cat"));
        assert!(!policy.allowed.contains("ls"));
    }

    #[test]
    fn forbidden_literal_can_cancel_out() {
        let policy = resolve(
            r#"
[default]
forbidden = "[';'] - [';']"
"#,
        );
        assert!(policy.forbidden.is_empty());
    }

    #[test]
    fn escaped_literal_in_toml_literal_string() {
        let policy = resolve(
            r#"
[default]
forbidden = '''[';']'''
"#,
        );
        assert_eq!(policy.forbidden, vec![";"]);
    }

    // ── 派生値 ──

    #[test]
    fn sudo_added_when_sudo_commands_present() {
        let policy = resolve("[default]\nsudo_commands = [\"ls\"]\n");
        assert!(policy.allowed.contains("sudo"));
        assert!(policy.sudo_commands.contains("ls"));
    }

    #[test]
    fn all_sentinel_is_not_a_command() {
        let policy = resolve("[default]\nallowed = \"all\"\n");
        assert!(!policy.allowed.contains("all"));
    }

    #[test]
    fn extensions_normalized_with_dot() {
        let policy = resolve("[default]\nallowed_file_extensions = [\"txt\", \".log\"]\n");
        assert!(policy.allowed_file_extensions.contains(".txt"));
        assert!(policy.allowed_file_extensions.contains(".log"));
    }

    #[test]
    fn aliases_from_native_table() {
        let policy = resolve("[default]\naliases = { ll = \"ls -l\" }\n");
        assert_eq!(policy.aliases.get("ll").map(String::as_str), Some("ls -l"));
    }

    #[test]
    fn history_file_user_template() {
        let policy = resolve("[default]\nhistory_file = \"/var/hist/%u\"\n");
        assert_eq!(policy.history_file, PathBuf::from("/var/hist/alice"));
    }

    #[test]
    fn path_minus_items_become_denied() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().canonicalize().unwrap();
        std::fs::create_dir(home.join("secret")).unwrap();
        let text = format!(
            "[default]\npath = \"['{0}'] - ['{0}/secret']\"\n",
            home.display()
        );
        let policy = parse(&text, &alice(&home)).unwrap().policy;
        assert!(policy.paths.permits(&home.join("notes")));
        assert!(!policy.paths.permits(&home.join("secret/key")));
        assert_eq!(policy.paths.denied().len(), 1);
    }

    #[test]
    fn path_defaults_to_home() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().canonicalize().unwrap();
        let policy = parse("", &alice(&home)).unwrap().policy;
        assert!(policy.paths.permits(&home));
        assert!(!policy.paths.permits(Path::new("/etc")));
    }

    // ── エラー ──

    #[test]
    fn unknown_key_rejected() {
        let err = parse("[default]\nallowd = []\n", &alice(Path::new("/h"))).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey { ref key, .. } if key == "allowd"));
    }

    #[test]
    fn bad_literal_reports_site() {
        let err = parse("[alice]\nallowed = \"['ls'\"\n", &alice(Path::new("/h"))).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[alice] allowed"), "{msg}");
    }

    #[test]
    fn negative_unsigned_rejected() {
        let err = parse("[default]\ntimer = -5\n", &alice(Path::new("/h"))).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unlimited_warning_counter() {
        let policy = resolve("[default]\nwarning_counter = -1\n");
        assert_eq!(policy.warning_counter, -1);
    }
}
