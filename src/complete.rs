//! Tab 補完（rustyline の `Helper`）。
//!
//! - **コマンド名補完**（行頭 or `|`/`&&`/`||`/`;` の後の最初の単語）:
//!   許可コマンド集合の先頭語だけを候補にする
//! - **ファイル名補完**（それ以外）: パスポリシーが許す項目だけを候補にする。
//!   `~/` はチルダ展開して検索し、表示は `~` のまま
//!
//! 候補の絞り込みは [`Policy::validate_path_for_completion`] を使い、違反カウンタには触れない。

use std::path::Path;

use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};

use crate::path;
use crate::policy::Policy;

pub struct RlshHelper {
    policy: Policy,
    ssh: bool,
}

impl RlshHelper {
    pub fn new(policy: &Policy, ssh: bool) -> Self {
        Self {
            policy: policy.clone(),
            ssh,
        }
    }

    fn find_commands(&self, prefix: &str) -> Vec<String> {
        let mut results: Vec<String> = self
            .policy
            .commands(self.ssh)
            .iter()
            .filter_map(|entry| entry.split_whitespace().next())
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect();
        results.sort();
        results.dedup();
        results
    }

    /// ディレクトリには末尾 `/` を付ける。隠しファイルは `prefix` が `.` で始まる時だけ。
    fn find_files(&self, prefix: &str) -> Vec<String> {
        let expanded = path::expand_tilde(prefix);
        let (search_dir, file_prefix, display_dir) = match expanded.rfind('/') {
            Some(slash) => {
                let display = match prefix.rfind('/') {
                    Some(orig) if prefix.starts_with('~') => &prefix[..orig + 1],
                    _ => &expanded[..slash + 1],
                };
                (&expanded[..slash + 1], &expanded[slash + 1..], display.to_string())
            }
            None => ("./", &expanded[..], String::new()),
        };

        let mut results = Vec::new();
        let Ok(entries) = std::fs::read_dir(search_dir) else {
            return results;
        };
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with(file_prefix) || (name.starts_with('.') && !file_prefix.starts_with('.')) {
                continue;
            }
            let full = Path::new(search_dir).join(&name);
            if !self.policy.validate_path_for_completion(&full) {
                continue;
            }
            let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
            results.push(format!("{}{}{}", display_dir, name, if is_dir { "/" } else { "" }));
        }
        results.sort();
        results
    }
}

/// カーソル位置の単語を抽出する。戻り値: (開始バイト位置, 単語, コマンド位置か)
fn current_word(buf: &str, cursor: usize) -> (usize, &str, bool) {
    let before = &buf[..cursor];
    let word_start = before
        .rfind(|c: char| c == ' ' || c == '\t')
        .map(|i| i + 1)
        .unwrap_or(0);
    let word = &buf[word_start..cursor];

    let prefix = buf[..word_start].trim_end();
    let is_command = prefix.is_empty()
        || prefix.ends_with('|')
        || prefix.ends_with("&&")
        || prefix.ends_with(';');

    (word_start, word, is_command)
}

impl Completer for RlshHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> rustyline::Result<(usize, Vec<Pair>)> {
        let (start, word, is_command) = current_word(line, pos);
        let found = if is_command {
            self.find_commands(word)
        } else {
            self.find_files(word)
        };
        let pairs = found
            .into_iter()
            .map(|c| Pair {
                display: c.clone(),
                replacement: c,
            })
            .collect();
        Ok((start, pairs))
    }
}

impl Hinter for RlshHelper {
    type Hint = String;
}

impl Highlighter for RlshHelper {}

impl Validator for RlshHelper {}

impl Helper for RlshHelper {}
