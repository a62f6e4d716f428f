//! シグナル設定とアイドルタイマー。
//!
//! シェル自身はジョブ制御系のシグナルを無視し、子は [`spawn`](crate::spawn) で既定に戻す。
//! アイドルタイマーは `alarm(2)` で、入力待ちの間だけ有効にする。

/// シェルが無視し、子で既定に戻すシグナル。
pub const JOB_CONTROL_SIGNALS: [libc::c_int; 4] =
    [libc::SIGINT, libc::SIGTSTP, libc::SIGTTOU, libc::SIGTTIN];

const TIMER_MESSAGE: &[u8] = b"\n*** Timer expired\n";

pub fn ignore_job_control() {
    unsafe {
        for sig in JOB_CONTROL_SIGNALS {
            libc::signal(sig, libc::SIG_IGN);
        }
    }
}

/// SIGALRM ハンドラ。write(2) と _exit(2) だけを使う。
extern "C" fn on_alarm(_: libc::c_int) {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            TIMER_MESSAGE.as_ptr() as *const libc::c_void,
            TIMER_MESSAGE.len(),
        );
        libc::_exit(1);
    }
}

/// 入力待ちの間だけ張るアイドルタイマー。`seconds == 0` なら何もしない。
#[derive(Debug, Clone, Copy)]
pub struct IdleTimer {
    seconds: u32,
}

impl IdleTimer {
    pub fn install(seconds: u32) -> Self {
        if seconds > 0 {
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_alarm as extern "C" fn(libc::c_int) as libc::sighandler_t;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut());
            }
        }
        Self { seconds }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn arm(&self) {
        if self.seconds > 0 {
            unsafe {
                libc::alarm(self.seconds);
            }
        }
    }

    pub fn disarm(&self) {
        if self.seconds > 0 {
            unsafe {
                libc::alarm(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timer_is_inert() {
        let t = IdleTimer::install(0);
        t.arm();
        let left = unsafe { libc::alarm(0) };
        assert_eq!(left, 0);
        assert_eq!(t.seconds(), 0);
    }
}
