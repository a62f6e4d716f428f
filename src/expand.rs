//! 展開器: エイリアス展開と変数展開（`$NAME`, `${NAME}`, `$?`）。
//!
//! 展開結果はクォートを含んだままのテキストで、検証器はこの完全に展開された形を検査する。
//! `$( ... )` とバッククォートはここでは触らない（検証後に実行器が展開する）。

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// 変数の参照先。
pub trait EnvView {
    fn var(&self, name: &str) -> Option<String>;
}

/// プロセス環境（`std::env`）をそのまま参照する。
pub struct ProcessEnv;

impl EnvView for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvView for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// エイリアス展開 → 変数展開の順に適用する。
pub fn expand(
    segment: &str,
    aliases: &BTreeMap<String, String>,
    env: &dyn EnvView,
    last_status: i32,
) -> String {
    let aliased = expand_aliases(segment, aliases);
    expand_variables(&aliased, env, last_status)
}

// ── エイリアス ──────────────────────────────────────────────────────

/// セグメント先頭の語がエイリアスなら置換する。
///
/// 置換後の先頭語にも繰り返し適用するが、同じエイリアスは 1 度しか使わない。
/// 部分一致（`ll` が `llx` に一致する等）はしない。
pub fn expand_aliases(segment: &str, aliases: &BTreeMap<String, String>) -> String {
    let mut text = segment.to_string();
    if aliases.is_empty() {
        return text;
    }
    let mut used: BTreeSet<String> = BTreeSet::new();

    loop {
        let start = text.len() - text.trim_start().len();
        let end = text[start..]
            .find(char::is_whitespace)
            .map(|i| start + i)
            .unwrap_or(text.len());
        let word = &text[start..end];
        let Some(replacement) = aliases.get(word) else {
            break;
        };
        if !used.insert(word.to_string()) {
            break;
        }
        text = format!("{}{}{}", &text[..start], replacement, &text[end..]);
    }
    text
}

// ── 変数 ────────────────────────────────────────────────────────────

/// `$NAME` / `${NAME}` / `$?` を展開する。
///
/// - シングルクォート内はそのまま
/// - `\$` はリテラルの `$`（バックスラッシュごと保持する）
/// - `${NAME:-w}`, `${NAME-w}`, `${NAME:+w}`, `${NAME+w}` に対応。それ以外の `${...}` は残す
/// - 未定義の変数は空文字列
pub fn expand_variables(text: &str, env: &dyn EnvView, last_status: i32) -> String {
    if !text.contains('$') {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(text.len());
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < len {
        let c = chars[i];

        if in_single {
            out.push(c);
            if c == '\'' {
                in_single = false;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
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
            '`' => {
                let end = find_closing_backtick(&chars, i + 1);
                out.extend(&chars[i..end]);
                i = end;
            }
            '$' => {
                i = expand_dollar(&chars, i, &mut out, env, last_status);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// `chars[at] == '$'` を処理し、次に読む位置を返す。
fn expand_dollar(
    chars: &[char],
    at: usize,
    out: &mut String,
    env: &dyn EnvView,
    last_status: i32,
) -> usize {
    let len = chars.len();
    match chars.get(at + 1).copied() {
        Some('(') => {
            // $( ... ) はそのまま
            let end = find_closing_paren(chars, at + 2);
            out.extend(&chars[at..end]);
            end
        }
        Some('?') => {
            out.push_str(&last_status.to_string());
            at + 2
        }
        Some('{') => {
            let Some(close) = chars[at + 2..].iter().position(|&c| c == '}').map(|p| at + 2 + p)
            else {
                out.extend(&chars[at..]);
                return len;
            };
            let inner: String = chars[at + 2..close].iter().collect();
            match expand_braced(&inner, env, last_status) {
                Some(value) => out.push_str(&value),
                None => out.extend(&chars[at..=close]),
            }
            close + 1
        }
        Some(c) if is_var_start(c) => {
            let mut end = at + 1;
            while end < len && is_var_char(chars[end]) {
                end += 1;
            }
            let name: String = chars[at + 1..end].iter().collect();
            out.push_str(&env.var(&name).unwrap_or_default());
            end
        }
        _ => {
            out.push('$');
            at + 1
        }
    }
}

/// `${...}` の中身を展開する。対応しない形式なら `None`。
fn expand_braced(inner: &str, env: &dyn EnvView, last_status: i32) -> Option<String> {
    if inner == "?" {
        return Some(last_status.to_string());
    }
    let name_len = inner
        .char_indices()
        .find(|&(_, c)| !is_var_char(c))
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    let name = &inner[..name_len];
    if name.is_empty() || !name.starts_with(is_var_start) {
        return None;
    }
    let rest = &inner[name_len..];
    let value = env.var(name);

    let (op, word) = if let Some(w) = rest.strip_prefix(":-") {
        (":-", w)
    } else if let Some(w) = rest.strip_prefix(":+") {
        (":+", w)
    } else if let Some(w) = rest.strip_prefix('-') {
        ("-", w)
    } else if let Some(w) = rest.strip_prefix('+') {
        ("+", w)
    } else if rest.is_empty() {
        return Some(value.unwrap_or_default());
    } else {
        return None;
    };

    let word = expand_variables(word, env, last_status);
    let set_nonempty = value.as_deref().is_some_and(|v| !v.is_empty());
    Some(match op {
        ":-" if set_nonempty => value.unwrap_or_default(),
        ":-" => word,
        "-" => value.unwrap_or(word),
        ":+" if set_nonempty => word,
        "+" if value.is_some() => word,
        _ => String::new(),
    })
}

/// `chars[from..]` から対応する `)` の直後の位置を返す。見つからなければ末尾。
pub(crate) fn find_closing_paren(chars: &[char], from: usize) -> usize {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut i = from;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '\\' => i += 1,
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    chars.len()
}

/// `chars[from..]` から閉じバッククォートの直後の位置を返す。見つからなければ末尾。
pub(crate) fn find_closing_backtick(chars: &[char], from: usize) -> usize {
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '`' => return i + 1,
            _ => {}
        }
        i += 1;
    }
    chars.len()
}

fn is_var_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_var_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
