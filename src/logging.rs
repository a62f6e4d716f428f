//! ログ出力と監査イベント。
//!
//! `tracing-subscriber` の fmt レイヤーを `<logpath>/<logfilename>.log` に向ける。
//! ファイルを開けなければ stderr に ERROR のみを出す。
//!
//! 監査イベントはすべて target `rlsh::audit` で、`user` などのフィールド付きで出力する。

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{Datelike, Local};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;

use crate::config::GlobalConfig;

const AUDIT: &str = "rlsh::audit";

/// グローバル subscriber を設定する。実際に書き込むログファイルのパスを返す。
///
/// 2 回目以降の呼び出しは何もしない（テストから複数回呼ばれうる）。
pub fn init(global: &GlobalConfig, user: &str) -> Option<PathBuf> {
    let filter = level_filter(global.loglevel);
    let name = log_file_name(&global.logfilename, user, today());
    let path = global.logpath.join(format!("{}.log", name));

    let opened = fs::create_dir_all(&global.logpath)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));

    match opened {
        Ok(file) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(filter);
            let _ = tracing_subscriber::registry().with(layer).try_init();
            Some(path)
        }
        Err(e) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .without_time()
                .with_filter(LevelFilter::ERROR);
            let _ = tracing_subscriber::registry().with(layer).try_init();
            tracing::error!("cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}

/// `loglevel` の数値をフィルタに変換する。4 以上は debug。
pub fn level_filter(loglevel: u8) -> LevelFilter {
    match loglevel {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// `%u` `%y` `%m` `%d` を展開する。`%y` は 4 桁の年。未知の `%X` はそのまま残す。
pub fn log_file_name(template: &str, user: &str, (year, month, day): (i32, u32, u32)) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(user),
            Some('y') => out.push_str(&format!("{:04}", year)),
            Some('m') => out.push_str(&format!("{:02}", month)),
            Some('d') => out.push_str(&format!("{:02}", day)),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// ローカル時刻での今日の日付。
fn today() -> (i32, u32, u32) {
    let now = Local::now();
    (now.year(), now.month(), now.day())
}

// ── 監査イベント ─────────────────────────────────────────────────────

pub fn session_start(user: &str) {
    tracing::info!(target: AUDIT, user, "session start");
}

pub fn session_end(user: &str, status: i32) {
    tracing::info!(target: AUDIT, user, status, "session end");
}

pub fn command_executed(user: &str, line: &str) {
    tracing::info!(target: AUDIT, user, line, "command executed");
}

pub fn violation(user: &str, kind: &str, detail: &str) {
    tracing::warn!(target: AUDIT, user, kind, detail, "policy violation");
}

pub fn warned(user: &str, remaining: u32) {
    tracing::warn!(target: AUDIT, user, remaining, "warning issued");
}

pub fn kicked_out(user: &str) {
    tracing::error!(target: AUDIT, user, "kicked out");
}

pub fn timer_armed(user: &str, seconds: u32) {
    tracing::debug!(target: AUDIT, user, seconds, "idle timer armed");
}

pub fn sftp_connect(user: &str) {
    tracing::info!(target: AUDIT, user, "sftp connect");
}

pub fn sftp_disconnect(user: &str) {
    tracing::info!(target: AUDIT, user, "sftp disconnect");
}

pub fn scp_get(user: &str, path: &str) {
    tracing::info!(target: AUDIT, user, path, "scp download");
}

pub fn scp_put(user: &str, path: &str) {
    tracing::info!(target: AUDIT, user, path, "scp upload");
}
