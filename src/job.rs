//! ジョブテーブルとジョブ制御ヘルパー。
//!
//! フォアグラウンド待機 ([`wait_for_fg`])、バックグラウンド reap ([`reap_jobs`])、
//! 完了通知 ([`notify_and_clean`])、`fg` による再開 ([`resume`])、
//! ターミナル制御 ([`give_terminal_to`] / [`take_terminal_back`]) を提供する。

use libc::pid_t;

use crate::spawn::decode_status;

/// ユーザー自身の Ctrl-C で終わったジョブの終了ステータス（128 + SIGINT）。
/// このジョブは完了通知なしで削除する。
pub const INTERRUPTED: i32 = 130;

/// Ctrl-Z で止まったフォアグラウンドのステータス（128 + SIGTSTP）。
pub const STOPPED: i32 = 148;

// ── データ構造 ───────────────────────────────────────────────────────

/// ジョブ内の個別プロセス。パイプライン中の各コマンドに対応する。
#[derive(Debug, Clone)]
pub struct JobProcess {
    pub pid: pid_t,
    pub completed: bool,
    pub stopped: bool,
    /// `waitpid` の raw status。
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
    /// 全プロセスが正常終了。最終コマンドの終了コード。
    Done(i32),
    /// 最終コマンドがシグナルで終了。`128 + signo`。
    Killed(i32),
}

impl JobStatus {
    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::Done(code) | Self::Killed(code) => Some(code),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        self.exit_code().is_some()
    }

    fn label(self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Done(0) => "Done",
            Self::Done(_) | Self::Killed(_) => "Failed",
        }
    }
}

/// パイプライン 1 つ分のプロセスグループ。
#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub pgid: pid_t,
    /// 表示用コマンド文字列（`&` は含まない）。
    pub command: String,
    pub processes: Vec<JobProcess>,
    /// バックグラウンド化・停止の順序。大きいほど新しい。
    touched: u64,
}

impl Job {
    /// 判定優先度: Stopped > 完了 > Running。
    pub fn status(&self) -> JobStatus {
        if self.processes.iter().any(|p| p.stopped) {
            return JobStatus::Stopped;
        }
        if !self.processes.iter().all(|p| p.completed) {
            return JobStatus::Running;
        }
        match self.processes.last() {
            Some(last) if libc::WIFSIGNALED(last.status) => JobStatus::Killed(decode_status(last.status)),
            Some(last) => JobStatus::Done(decode_status(last.status)),
            None => JobStatus::Done(0),
        }
    }

    pub fn pids(&self) -> Vec<pid_t> {
        self.processes.iter().map(|p| p.pid).collect()
    }
}

// ── JobTable ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Vec<Job>,
    clock: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// ジョブを追加し、最小の未使用 ID を割り当てて返す。
    pub fn insert(&mut self, pgid: pid_t, command: String, pids: Vec<pid_t>) -> usize {
        let mut id = 1;
        while self.jobs.iter().any(|j| j.id == id) {
            id += 1;
        }
        self.clock += 1;
        let processes = pids
            .into_iter()
            .map(|pid| JobProcess {
                pid,
                completed: false,
                stopped: false,
                status: 0,
            })
            .collect();
        self.jobs.push(Job {
            id,
            pgid,
            command,
            processes,
            touched: self.clock,
        });
        self.jobs.sort_by_key(|j| j.id);
        id
    }

    /// 停止したジョブとして追加する（Ctrl-Z）。
    pub fn insert_stopped(&mut self, pgid: pid_t, command: String, pids: Vec<pid_t>) -> usize {
        let id = self.insert(pgid, command, pids);
        if let Some(job) = self.get_mut(id) {
            for p in &mut job.processes {
                p.stopped = true;
            }
        }
        id
    }

    pub fn get(&self, id: usize) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Job> {
        let at = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(at))
    }

    /// ジョブを「最新」に更新する（再停止時など）。
    pub fn touch(&mut self, id: usize) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(job) = self.get_mut(id) {
            job.touched = clock;
        }
    }

    /// `+` の付くジョブ（最も新しくバックグラウンド化・停止したもの）。
    pub fn current_job_id(&self) -> Option<usize> {
        self.by_recency().first().copied()
    }

    /// 表示記号: 最新 `+`、2 番目 `-`、それ以外は空白。
    pub fn symbol(&self, id: usize) -> char {
        let order = self.by_recency();
        match order.iter().position(|&j| j == id) {
            Some(0) => '+',
            Some(1) => '-',
            _ => ' ',
        }
    }

    fn by_recency(&self) -> Vec<usize> {
        let mut live: Vec<&Job> = self.jobs.iter().filter(|j| !j.status().is_finished()).collect();
        live.sort_by(|a, b| b.touched.cmp(&a.touched));
        live.into_iter().map(|j| j.id).collect()
    }

    /// `waitpid` の結果でプロセスの状態を更新する。未知の PID は無視する。
    pub fn mark_pid(&mut self, pid: pid_t, raw_status: i32) {
        for job in &mut self.jobs {
            for proc in &mut job.processes {
                if proc.pid == pid {
                    proc.status = raw_status;
                    if libc::WIFSTOPPED(raw_status) {
                        proc.stopped = true;
                        proc.completed = false;
                    } else if libc::WIFCONTINUED(raw_status) {
                        proc.stopped = false;
                    } else {
                        proc.completed = true;
                        proc.stopped = false;
                    }
                    return;
                }
            }
        }
    }

    /// `jobs` の出力行。
    pub fn listing(&self) -> Vec<String> {
        self.jobs
            .iter()
            .map(|j| format!("[{}]{}  {}        {}", j.id, self.symbol(j.id), j.status().label(), j.command))
            .collect()
    }

    /// 完了したジョブを取り除き、通知すべき行を返す。
    /// [`INTERRUPTED`] で終わったジョブは通知しない。
    pub fn take_finished(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        let mut kept = Vec::with_capacity(self.jobs.len());
        for job in self.jobs.drain(..) {
            match job.status().exit_code() {
                Some(INTERRUPTED) => {}
                Some(_) => messages.push(format!(
                    "[{}]   {}        {}",
                    job.id,
                    job.status().label(),
                    job.command
                )),
                None => kept.push(job),
            }
        }
        self.jobs = kept;
        messages
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }
}

// ── 待機ヘルパー ─────────────────────────────────────────────────────

/// フォアグラウンドのプロセスグループを待つ。戻り値: `(終了ステータス, 停止したか)`。
///
/// テーブル登録済みのジョブ（`fg` で再開したもの）は全プロセスの状態から、
/// 未登録のものは最後に報告された PID の raw status から判定する。
/// `last_pid` はパイプラインの最終コマンド。
pub fn wait_for_fg(jobs: &mut JobTable, pgid: pid_t, last_pid: pid_t) -> (i32, bool) {
    let mut last_status: Option<i32> = None;
    loop {
        let mut raw: i32 = 0;
        let pid = unsafe { libc::waitpid(-pgid, &mut raw, libc::WUNTRACED) };
        if pid < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break;
        }
        jobs.mark_pid(pid, raw);

        if let Some(job) = jobs.iter().find(|j| j.pgid == pgid) {
            match job.status() {
                JobStatus::Stopped => return (STOPPED, true),
                JobStatus::Running => continue,
                finished => return (finished.exit_code().unwrap_or(0), false),
            }
        }

        if libc::WIFSTOPPED(raw) {
            return (STOPPED, true);
        }
        if pid == last_pid {
            last_status = Some(decode_status(raw));
        }
    }
    (last_status.unwrap_or(0), false)
}

/// 終了・停止したバックグラウンドプロセスを非ブロッキングで回収する。
pub fn reap_jobs(jobs: &mut JobTable) {
    if jobs.is_empty() {
        return;
    }
    loop {
        let mut raw: i32 = 0;
        let pid = unsafe {
            libc::waitpid(-1, &mut raw, libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED)
        };
        if pid <= 0 {
            break;
        }
        jobs.mark_pid(pid, raw);
    }
}

/// 完了ジョブを stderr に通知してテーブルから削除する。プロンプト前に呼ぶ。
pub fn notify_and_clean(jobs: &mut JobTable) {
    for line in jobs.take_finished() {
        eprintln!("{}", line);
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobError {
    #[error("no current job")]
    NoCurrentJob,
    #[error("{0}: no such job")]
    NoSuchJob(String),
}

/// `fg [id]`: SIGCONT を送りフォアグラウンドで待つ。終了したらテーブルから外す。
pub fn resume(jobs: &mut JobTable, spec: Option<&str>, terminal_fd: i32, shell_pgid: pid_t) -> Result<i32, JobError> {
    let id = match spec {
        None => jobs.current_job_id().ok_or(JobError::NoCurrentJob)?,
        Some(s) => s
            .trim_start_matches('%')
            .parse::<usize>()
            .ok()
            .filter(|id| jobs.get(*id).is_some())
            .ok_or_else(|| JobError::NoSuchJob(s.to_string()))?,
    };
    let Some(job) = jobs.get_mut(id) else {
        return Err(JobError::NoSuchJob(id.to_string()));
    };
    // プロンプト前の reap で既に終わっていたジョブ。グループはもう存在しない。
    if let Some(code) = job.status().exit_code() {
        println!("{}", job.command);
        jobs.remove(id);
        return Ok(code);
    }
    for p in &mut job.processes {
        p.stopped = false;
    }
    let pgid = job.pgid;
    let last_pid = job.processes.last().map(|p| p.pid).unwrap_or(pgid);
    println!("{}", job.command);

    give_terminal_to(terminal_fd, pgid);
    unsafe {
        libc::kill(-pgid, libc::SIGCONT);
    }
    let (status, stopped) = wait_for_fg(jobs, pgid, last_pid);
    take_terminal_back(terminal_fd, shell_pgid);

    if stopped {
        jobs.touch(id);
        if let Some(job) = jobs.get(id) {
            eprintln!("\n[{}]+  Stopped        {}", id, job.command);
        }
    } else {
        jobs.remove(id);
    }
    Ok(status)
}

// ── ターミナル制御 ───────────────────────────────────────────────────

/// 端末でなければ何もしない（`tcsetpgrp` が失敗するだけ）。
pub fn give_terminal_to(terminal_fd: i32, pgid: pid_t) {
    unsafe {
        if libc::isatty(terminal_fd) == 1 {
            libc::tcsetpgrp(terminal_fd, pgid);
        }
    }
}

pub fn take_terminal_back(terminal_fd: i32, shell_pgid: pid_t) {
    give_terminal_to(terminal_fd, shell_pgid);
}

#[cfg(test)]
mod tests {
    use super::*;

    // 合成した waitpid ステータス（Linux のエンコーディング）
    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn signaled(sig: i32) -> i32 {
        sig & 0x7f
    }

    fn stopped_by(sig: i32) -> i32 {
        (sig << 8) | 0x7f
    }

    // ── ID ──

    #[test]
    fn ids_reuse_lowest_gap() {
        let mut t = JobTable::new();
        assert_eq!(t.insert(100, "a".into(), vec![100]), 1);
        assert_eq!(t.insert(200, "b".into(), vec![200]), 2);
        assert_eq!(t.insert(300, "c".into(), vec![300]), 3);
        t.remove(2);
        assert_eq!(t.insert(400, "d".into(), vec![400]), 2);
    }

    // ── 表示 ──

    #[test]
    fn listing_format_and_symbols() {
        let mut t = JobTable::new();
        t.insert(100, "sleep 60".into(), vec![100]);
        t.insert(200, "sleep 70".into(), vec![200]);
        t.insert(300, "sleep 80".into(), vec![300]);
        assert_eq!(
            t.listing(),
            vec![
                "[1]   Running        sleep 60",
                "[2]-  Running        sleep 70",
                "[3]+  Running        sleep 80",
            ]
        );
    }

    #[test]
    fn touch_moves_current() {
        let mut t = JobTable::new();
        t.insert(100, "a".into(), vec![100]);
        t.insert(200, "b".into(), vec![200]);
        t.touch(1);
        assert_eq!(t.current_job_id(), Some(1));
        assert_eq!(t.symbol(2), '-');
    }

    #[test]
    fn stopped_job_label() {
        let mut t = JobTable::new();
        let id = t.insert_stopped(100, "vi".into(), vec![100]);
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Stopped);
        assert_eq!(t.listing(), vec!["[1]+  Stopped        vi"]);
    }

    // ── 状態遷移 ──

    #[test]
    fn pipeline_done_when_all_complete() {
        let mut t = JobTable::new();
        let id = t.insert(100, "a | b".into(), vec![100, 101]);
        t.mark_pid(100, exited(0));
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Running);
        t.mark_pid(101, exited(3));
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Done(3));
    }

    #[test]
    fn killed_by_signal() {
        let mut t = JobTable::new();
        let id = t.insert(100, "a".into(), vec![100]);
        t.mark_pid(100, signaled(libc::SIGKILL));
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Killed(128 + libc::SIGKILL));
    }

    #[test]
    fn stop_then_continue() {
        let mut t = JobTable::new();
        let id = t.insert(100, "a".into(), vec![100]);
        t.mark_pid(100, stopped_by(libc::SIGTSTP));
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Stopped);
        t.mark_pid(100, 0xffff);
        assert_eq!(t.get(id).unwrap().status(), JobStatus::Running);
    }

    // ── 通知 ──

    #[test]
    fn finished_jobs_reported_once() {
        let mut t = JobTable::new();
        t.insert(100, "true".into(), vec![100]);
        t.insert(200, "false".into(), vec![200]);
        t.insert(300, "sleep 60".into(), vec![300]);
        t.mark_pid(100, exited(0));
        t.mark_pid(200, exited(1));
        assert_eq!(
            t.take_finished(),
            vec!["[1]   Done        true", "[2]   Failed        false"]
        );
        assert!(t.take_finished().is_empty());
        assert_eq!(t.iter().count(), 1);
    }

    #[test]
    fn interrupted_job_removed_silently() {
        let mut t = JobTable::new();
        t.insert(100, "sleep 60".into(), vec![100]);
        t.mark_pid(100, signaled(libc::SIGINT));
        assert!(t.take_finished().is_empty());
        assert!(t.is_empty());
    }

    #[test]
    fn killed_job_reported_as_failed() {
        let mut t = JobTable::new();
        t.insert(100, "sleep 60".into(), vec![100]);
        t.mark_pid(100, signaled(libc::SIGTERM));
        assert_eq!(t.take_finished(), vec!["[1]   Failed        sleep 60"]);
    }

    // ── fg ──

    #[test]
    fn resume_finished_job_keeps_exit_code() {
        let mut t = JobTable::new();
        let id = t.insert(100, "sh -c 'exit 3'".into(), vec![100]);
        t.mark_pid(100, exited(3));
        assert_eq!(resume(&mut t, Some("1"), -1, 0), Ok(3));
        assert!(t.get(id).is_none());
    }

    #[test]
    fn resume_unknown_job() {
        let mut t = JobTable::new();
        assert_eq!(resume(&mut t, None, -1, 0), Err(JobError::NoCurrentJob));
        assert_eq!(resume(&mut t, Some("4"), -1, 0), Err(JobError::NoSuchJob("4".into())));
    }
}
