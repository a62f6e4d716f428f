//! 違反トラッカー: 残り警告数の状態機械。
//!
//! | 状態 | 意味 |
//! |---|---|
//! | `Warn(n)` | strict モード。あと `n` 回は警告で済む |
//! | `Exhausted` | 警告を使い切った。次の違反で強制終了 |
//! | `Unlimited` | `warning_counter = -1`。ログのみで終了しない |
//! | `Terminated` | 強制終了済み |
//!
//! 非 strict モードでは状態を変えず、メッセージとログだけを出す。
//! 違反のある行 1 つにつき 1 回だけカウンタを消費する。

use crate::logging;
use crate::policy::Policy;
use crate::validate::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Warn(u32),
    Exhausted,
    Unlimited,
    Terminated,
}

/// 違反 1 件（1 行分）を記録した結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    KickedOut,
}

#[derive(Debug, Clone)]
pub struct Tracker {
    state: TrackerState,
    strict: bool,
    quiet: bool,
    user: String,
}

impl Tracker {
    pub fn new(policy: &Policy, user: &str) -> Self {
        let state = match u32::try_from(policy.warning_counter) {
            Ok(n) => TrackerState::Warn(n),
            Err(_) => TrackerState::Unlimited,
        };
        Self {
            state,
            strict: policy.strict,
            quiet: policy.quiet,
            user: user.to_string(),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// 検証結果を記録し、違反メッセージを stderr に出す。
    pub fn record(&mut self, report: &Report) -> Verdict {
        for v in &report.violations {
            logging::violation(&self.user, v.kind.as_str(), &v.detail);
            if !self.quiet {
                eprintln!("{}", v);
            }
        }
        if !report.counts() {
            return Verdict::Continue;
        }
        let (verdict, message) = self.advance();
        if let Some(message) = message {
            if !self.quiet || verdict == Verdict::KickedOut {
                eprintln!("{}", message);
            }
        }
        verdict
    }

    /// 状態を 1 つ進め、表示すべきメッセージを返す。
    fn advance(&mut self) -> (Verdict, Option<String>) {
        if !self.strict {
            return (Verdict::Continue, None);
        }
        match self.state {
            TrackerState::Unlimited => (Verdict::Continue, None),
            TrackerState::Warn(n) => {
                self.state = if n == 0 {
                    TrackerState::Exhausted
                } else {
                    TrackerState::Warn(n - 1)
                };
                logging::warned(&self.user, n);
                (
                    Verdict::Continue,
                    Some(format!(
                        "*** You have {} warning(s) left, before getting kicked out.",
                        n
                    )),
                )
            }
            TrackerState::Exhausted | TrackerState::Terminated => {
                self.state = TrackerState::Terminated;
                logging::kicked_out(&self.user);
                (Verdict::KickedOut, Some("*** Kicked out".to_string()))
            }
        }
    }
}
