//! OS signal delivery through the reactor.
//!
//! A [`SignalSet`] watches a set of signal numbers for its executor. Signal
//! handlers write the signal number to a self-pipe; the pipe's read end is
//! armed on the executor like any other descriptor, so delivery happens on
//! the loop thread. Each signal number can be watched by at most one set at
//! a time (the handler table is process-global).

use crate::error::{NetError, NetResult};
use crate::executor::{next_token, Executor, Interest, Token};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

const MAX_SIGNAL: usize = 64;

/// Write ends of the self-pipes, indexed by signal number. -1 = unclaimed.
static SIGNAL_TARGETS: [AtomicI32; MAX_SIGNAL] = [const { AtomicI32::new(-1) }; MAX_SIGNAL];

extern "C" fn on_signal(signum: libc::c_int) {
    if signum < 0 || signum as usize >= MAX_SIGNAL {
        return;
    }
    let fd = SIGNAL_TARGETS[signum as usize].load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// A set of watched OS signals bound to an executor.
pub struct SignalSet {
    ios: Executor,
    read_fd: RawFd,
    write_fd: RawFd,
    token: Token,
    watched: Mutex<Vec<i32>>,
}

impl SignalSet {
    pub fn new(ios: &Executor) -> NetResult<SignalSet> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                let fdflags = libc::fcntl(fd, libc::F_GETFD);
                libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
            }
        }
        Ok(SignalSet {
            ios: ios.clone(),
            read_fd: fds[0],
            write_fd: fds[1],
            token: next_token(),
            watched: Mutex::new(Vec::new()),
        })
    }

    /// Add a signal number to the set, installing the process handler. Fails
    /// if another set already claims the signal.
    pub fn add(&self, signum: i32) -> NetResult<()> {
        if signum <= 0 || signum as usize >= MAX_SIGNAL {
            return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
        }
        let slot = &SIGNAL_TARGETS[signum as usize];
        if slot
            .compare_exchange(-1, self.write_fd, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io::Error::from(io::ErrorKind::AddrInUse).into());
        }
        unsafe {
            let handler: extern "C" fn(libc::c_int) = on_signal;
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) < 0 {
                slot.store(-1, Ordering::SeqCst);
                return Err(io::Error::last_os_error().into());
            }
        }
        self.watched.lock().push(signum);
        Ok(())
    }

    /// Wait for the next watched signal. One-shot: re-arm from the callback
    /// for continuous watching. The callback runs on the executor thread.
    pub fn async_wait<F>(&self, handler: F)
    where
        F: FnOnce(NetResult<i32>) + Send + 'static,
    {
        let read_fd = self.read_fd;
        let result = self.ios.arm(
            read_fd,
            self.token,
            Interest::READABLE,
            Box::new(move |ready| match ready {
                Ok(()) => {
                    let mut byte = 0u8;
                    let n = unsafe {
                        libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1)
                    };
                    if n == 1 {
                        handler(Ok(byte as i32));
                    } else {
                        handler(Err(io::Error::last_os_error().into()));
                    }
                }
                Err(err) => handler(Err(err)),
            }),
        );
        if let Err((err, _callback)) = result {
            let ios = self.ios.clone();
            ios.post(move || {
                log::warn!("signal wait arm failed: {}", err);
            });
        }
    }

    /// Restore default dispositions and release claimed signal numbers.
    pub fn clear(&self) {
        let mut watched = self.watched.lock();
        for signum in watched.drain(..) {
            SIGNAL_TARGETS[signum as usize].store(-1, Ordering::SeqCst);
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(signum, &action, std::ptr::null_mut());
            }
        }
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        self.clear();
        for callback in self.ios.disarm(self.token) {
            callback(Err(NetError::Cancelled));
        }
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn delivers_raised_signal() {
        let ios = Executor::new().unwrap();
        let signals = SignalSet::new(&ios).unwrap();
        signals.add(libc::SIGUSR1).unwrap();

        let seen = Arc::new(AtomicBool::new(false));
        let s = seen.clone();
        signals.async_wait(move |result| {
            if matches!(result, Ok(signum) if signum == libc::SIGUSR1) {
                s.store(true, Ordering::SeqCst);
            }
        });

        unsafe { libc::raise(libc::SIGUSR1) };
        ios.run_for(Duration::from_millis(500));
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn signal_numbers_are_exclusive() {
        let ios = Executor::new().unwrap();
        let first = SignalSet::new(&ios).unwrap();
        first.add(libc::SIGUSR2).unwrap();

        let second = SignalSet::new(&ios).unwrap();
        assert!(second.add(libc::SIGUSR2).is_err());

        first.clear();
        assert!(second.add(libc::SIGUSR2).is_ok());
    }
}
