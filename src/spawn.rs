//! `posix_spawnp()` のラッパー（外部コマンドの起動）。
//!
//! | 型 | 役割 |
//! |-----|------|
//! | [`SpawnAttr`] | `posix_spawnattr_t` の RAII ラッパー（プロセスグループ、シグナル既定化） |
//! | [`FileActions`] | `posix_spawn_file_actions_t` の RAII ラッパー（fd 操作） |
//! | [`CStringVec`] | argv/envp 用の NULL 終端ポインタ配列 |
//! | [`spawn`] | 上記を組み合わせて `posix_spawnp` を呼ぶ |
//!
//! 子の環境はシェルの環境に [`Launch::env`] を上書きしたもの。
//! コマンド単位の代入（`A=1 cmd`）と noexec の `LD_PRELOAD` はここで渡し、
//! シェル自身の環境は変更しない。

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

#[derive(Debug, thiserror::Error)]
#[error("rlsh: {command}: {}", reason(.errno))]
pub struct SpawnError {
    pub errno: i32,
    pub command: String,
}

fn reason(errno: &i32) -> &'static str {
    match *errno {
        libc::ENOENT => "command not found",
        libc::EACCES => "permission denied",
        libc::EINVAL => "invalid argument",
        _ => "spawn failed",
    }
}

impl SpawnError {
    /// 127 = command not found, 126 = permission denied, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self.errno {
            libc::ENOENT => 127,
            libc::EACCES => 126,
            _ => 1,
        }
    }
}

// ── SpawnAttr ─────────────────────────────────────────────────────

struct SpawnAttr {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttr {
    fn new() -> Self {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            libc::posix_spawnattr_init(&mut attr);
            Self { inner: attr }
        }
    }

    fn add_flags(&mut self, extra: libc::c_int) {
        unsafe {
            let mut flags: libc::c_short = 0;
            libc::posix_spawnattr_getflags(&self.inner, &mut flags);
            flags |= extra as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);
        }
    }

    /// `pgid == 0` なら子自身がグループリーダーになる。
    fn set_pgroup(&mut self, pgid: libc::pid_t) {
        self.add_flags(libc::POSIX_SPAWN_SETPGROUP);
        unsafe {
            libc::posix_spawnattr_setpgroup(&mut self.inner, pgid);
        }
    }

    /// シェルが無視しているシグナルを子で `SIG_DFL` に戻す。
    fn set_sigdefault(&mut self) {
        self.add_flags(libc::POSIX_SPAWN_SETSIGDEF);
        unsafe {
            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            for sig in crate::signal::JOB_CONTROL_SIGNALS {
                libc::sigaddset(&mut sigset, sig);
            }
            libc::sigaddset(&mut sigset, libc::SIGALRM);
            libc::posix_spawnattr_setsigdefault(&mut self.inner, &sigset);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.inner
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

// ── FileActions ───────────────────────────────────────────────────

struct FileActions {
    inner: libc::posix_spawn_file_actions_t,
}

impl FileActions {
    fn new() -> Self {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            libc::posix_spawn_file_actions_init(&mut actions);
            Self { inner: actions }
        }
    }

    fn add_dup2(&mut self, fd: i32, newfd: i32) {
        unsafe {
            libc::posix_spawn_file_actions_adddup2(&mut self.inner, fd, newfd);
        }
    }

    fn add_close(&mut self, fd: i32) {
        unsafe {
            libc::posix_spawn_file_actions_addclose(&mut self.inner, fd);
        }
    }

    /// `fd` を `target` に付け替え、元の fd は閉じる。
    fn redirect(&mut self, fd: Option<i32>, target: i32) {
        if let Some(fd) = fd {
            self.add_dup2(fd, target);
            if fd != target {
                self.add_close(fd);
            }
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        &self.inner
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.inner);
        }
    }
}

// ── CStringVec ────────────────────────────────────────────────────

struct CStringVec {
    _strings: Vec<CString>,
    ptrs: Vec<*mut libc::c_char>,
}

impl CStringVec {
    /// NUL を含む要素があれば `None`。
    fn new<I, B>(items: I) -> Option<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let strings = items
            .into_iter()
            .map(|s| CString::new(s).ok())
            .collect::<Option<Vec<CString>>>()?;
        let mut ptrs: Vec<*mut libc::c_char> = strings
            .iter()
            .map(|s| s.as_ptr() as *mut libc::c_char)
            .collect();
        ptrs.push(std::ptr::null_mut());
        Some(Self {
            _strings: strings,
            ptrs,
        })
    }

    fn as_ptr(&self) -> *const *mut libc::c_char {
        self.ptrs.as_ptr()
    }
}

// ── spawn ─────────────────────────────────────────────────────────

/// 1 プロセス分の起動パラメータ。
#[derive(Debug, Default)]
pub struct Launch<'a> {
    /// `argv[0]` がコマンド名（PATH 検索あり）。
    pub argv: &'a [String],
    /// シェルの環境に上書きする変数。
    pub env: &'a [(String, String)],
    /// 0 なら子の PID をグループリーダーにする。
    pub pgid: libc::pid_t,
    pub stdin_fd: Option<i32>,
    pub stdout_fd: Option<i32>,
    pub stderr_fd: Option<i32>,
    /// 子で閉じる fd（パイプの未使用端など）。
    pub fds_to_close: &'a [i32],
    /// `(src_fd, dst_fd)`: 子で `dup2(dst_fd, src_fd)` する（`2>&1` 等）。
    pub dup2s: &'a [(i32, i32)],
}

/// シェルの環境に `overrides` を上書きした `NAME=value` 列。
pub fn child_environment(overrides: &[(String, String)]) -> Vec<Vec<u8>> {
    let mut vars: BTreeMap<Vec<u8>, Vec<u8>> = std::env::vars_os()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect();
    for (name, value) in overrides {
        vars.insert(name.as_bytes().to_vec(), value.as_bytes().to_vec());
    }
    vars.into_iter()
        .map(|(mut k, v)| {
            k.push(b'=');
            k.extend_from_slice(&v);
            k
        })
        .collect()
}

/// 子プロセスを起動し、PID を返す。
pub fn spawn(launch: &Launch<'_>) -> Result<libc::pid_t, SpawnError> {
    let command = launch.argv.first().cloned().unwrap_or_default();
    let invalid = || SpawnError {
        errno: libc::EINVAL,
        command: command.clone(),
    };
    if launch.argv.is_empty() {
        return Err(invalid());
    }
    let argv = CStringVec::new(launch.argv.iter().map(|s| s.as_bytes().to_vec())).ok_or_else(invalid)?;
    let envp = CStringVec::new(child_environment(launch.env)).ok_or_else(invalid)?;

    let mut attr = SpawnAttr::new();
    attr.set_pgroup(launch.pgid);
    attr.set_sigdefault();

    let mut actions = FileActions::new();
    actions.redirect(launch.stdin_fd, libc::STDIN_FILENO);
    actions.redirect(launch.stdout_fd, libc::STDOUT_FILENO);
    actions.redirect(launch.stderr_fd, libc::STDERR_FILENO);

    for &(src, dst) in launch.dup2s {
        actions.add_dup2(dst, src);
    }

    let redirected = [launch.stdin_fd, launch.stdout_fd, launch.stderr_fd];
    for &fd in launch.fds_to_close {
        if !redirected.contains(&Some(fd)) {
            actions.add_close(fd);
        }
    }

    let mut pid: libc::pid_t = 0;
    let ret = unsafe {
        libc::posix_spawnp(
            &mut pid,
            argv.as_ptr().read() as *const libc::c_char,
            actions.as_ptr(),
            attr.as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
        )
    };

    if ret != 0 {
        return Err(SpawnError { errno: ret, command });
    }
    Ok(pid)
}

/// 子の終了を待ち、終了ステータスを返す（シグナル終了は 128 + signo）。
pub fn wait_status(pid: libc::pid_t) -> i32 {
    let mut raw: i32 = 0;
    loop {
        let r = unsafe { libc::waitpid(pid, &mut raw, 0) };
        if r == pid {
            return decode_status(raw);
        }
        if r < 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return 1;
        }
    }
}

/// `waitpid` の raw status を終了ステータスに変換する。
pub fn decode_status(raw: i32) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        128 + libc::WTERMSIG(raw)
    } else if libc::WIFSTOPPED(raw) {
        128 + libc::WSTOPSIG(raw)
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exit_status_is_propagated() {
        let args = argv(&["sh", "-c", "exit 3"]);
        let pid = spawn(&Launch {
            argv: &args,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(wait_status(pid), 3);
    }

    #[test]
    fn env_override_reaches_child_only() {
        let args = argv(&["sh", "-c", "test \"$RLSH_SPAWN_TEST\" = yes"]);
        let env = vec![("RLSH_SPAWN_TEST".to_string(), "yes".to_string())];
        let pid = spawn(&Launch {
            argv: &args,
            env: &env,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(wait_status(pid), 0);
        assert!(std::env::var("RLSH_SPAWN_TEST").is_err());
    }

    #[test]
    fn missing_command_is_127() {
        let args = argv(&["rlsh-definitely-missing-command"]);
        let err = spawn(&Launch {
            argv: &args,
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.exit_status(), 127);
        assert_eq!(
            err.to_string(),
            "rlsh: rlsh-definitely-missing-command: command not found"
        );
    }

    #[test]
    fn nul_in_argument_rejected() {
        let args = argv(&["echo", "a\0b"]);
        assert!(spawn(&Launch {
            argv: &args,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn child_environment_overrides() {
        let env = child_environment(&[("PATH".to_string(), "/x".to_string())]);
        assert!(env.iter().any(|e| e == b"PATH=/x"));
        assert_eq!(env.iter().filter(|e| e.starts_with(b"PATH=")).count(), 1);
    }
}
