//! コマンド履歴の管理。
//!
//! `history_file` にプレーンテキスト（1 行 1 コマンド）で永続化し、起動時に読み込む。
//!
//! - 書き込み: 追記モードで 1 コマンドずつ
//! - 最大エントリ数: `history_size`（0 なら無制限）。超過分は古いものから捨てる
//! - 直前と同一のコマンドは追加しない
//!
//! 行編集中の ↑↓ ナビゲーションは rustyline 側の履歴が受け持つ。

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub struct History {
    /// 古い順。
    entries: Vec<String>,
    max_size: usize,
    /// `None` ならメモリ上のみ。
    path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("{0}: numeric argument required")]
    NotANumber(String),
}

impl History {
    /// 履歴ファイルから読み込む。ファイルが無ければ空で始める。
    pub fn open(path: &Path, max_size: usize) -> Self {
        let mut h = Self {
            entries: Vec::new(),
            max_size,
            path: Some(path.to_path_buf()),
        };
        h.load();
        h
    }

    pub fn in_memory(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size,
            path: None,
        }
    }

    fn load(&mut self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Ok(file) = fs::File::open(path) {
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(Result::ok) {
                if !line.is_empty() {
                    self.entries.push(line);
                }
            }
            self.trim();
        }
    }

    fn trim(&mut self) {
        if self.max_size > 0 && self.entries.len() > self.max_size {
            let excess = self.entries.len() - self.max_size;
            self.entries.drain(..excess);
        }
    }

    /// エントリ追加 + ファイル追記。空行・直前との重複はスキップ。
    pub fn add(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || self.entries.last().is_some_and(|last| last == line) {
            return;
        }
        self.entries.push(line.to_string());
        self.trim();
        if let Some(path) = &self.path {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", line);
                }
                Err(e) => tracing::debug!("history file {}: {}", path.display(), e),
            }
        }
    }

    /// メモリとファイルの両方を空にする。
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Some(path) = &self.path {
            let _ = fs::write(path, "");
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// `history [N | -c]` の出力行。
    pub fn command(&mut self, arg: Option<&str>) -> Result<Vec<String>, HistoryError> {
        let start = match arg {
            Some("-c") => {
                self.clear();
                return Ok(Vec::new());
            }
            Some(n) => {
                let n: usize = n.parse().map_err(|_| HistoryError::NotANumber(n.to_string()))?;
                self.entries.len().saturating_sub(n)
            }
            None => 0,
        };
        Ok(self.entries[start..]
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{:5}  {}", start + i + 1, entry))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_history(entries: &[&str]) -> History {
        let mut h = History::in_memory(0);
        for e in entries {
            h.add(e);
        }
        h
    }

    #[test]
    fn add_skips_empty_and_duplicates() {
        let mut h = make_history(&[]);
        h.add("");
        h.add("  ");
        assert!(h.entries().is_empty());

        h.add("echo hello");
        h.add("echo hello");
        assert_eq!(h.entries().len(), 1);

        h.add("echo world");
        h.add("echo hello");
        assert_eq!(h.entries().len(), 3);
    }

    #[test]
    fn size_cap_drops_oldest() {
        let mut h = History::in_memory(2);
        for e in ["a", "b", "c"] {
            h.add(e);
        }
        assert_eq!(h.entries(), ["b", "c"]);
    }

    #[test]
    fn numbered_listing() {
        let mut h = make_history(&["ls", "pwd", "echo x"]);
        assert_eq!(h.command(None).unwrap(), vec!["    1  ls", "    2  pwd", "    3  echo x"]);
        assert_eq!(h.command(Some("1")).unwrap(), vec!["    3  echo x"]);
        assert_eq!(
            h.command(Some("x")),
            Err(HistoryError::NotANumber("x".to_string()))
        );
    }

    #[test]
    fn persisted_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lhistory");
        {
            let mut h = History::open(&path, 100);
            h.add("ls");
            h.add("pwd");
        }
        let mut h = History::open(&path, 1);
        assert_eq!(h.entries(), ["pwd"]);
        h.command(Some("-c")).unwrap();
        assert!(History::open(&path, 100).entries().is_empty());
    }
}
