//! Per-carrier one-shot interval timer (§4.D).
//!
//! Built on POSIX `timer_create`/`timer_settime` configured with
//! `SIGEV_THREAD_ID` so delivery always targets the carrier task that armed
//! it. The signal handler itself is installed once per process with
//! `sa_mask` set to every signal, so it runs atomically with respect to any
//! other signal (§4.I).

use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

/// Signal number reserved for preemption. The library strips this from
/// every user-supplied sigmask change (§5 "Forbidden").
pub fn PREEMPT_SIGNAL() -> libc::c_int {
    libc::SIGRTMIN()
}

/// Installs `handler` for [`PREEMPT_SIGNAL`] with every signal masked
/// during its execution. Idempotent; call once per process.
///
/// Registered `SA_SIGINFO` so the handler can recover the mask that was
/// live the instant the signal arrived (`ucontext_t::uc_sigmask`) — needed
/// because the handler suspends the interrupted thread by jumping to a
/// different stack instead of returning normally, which skips the kernel's
/// usual mask restore on `sigreturn`.
pub(crate) fn install_preempt_handler(
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) {
    // Safety: `sa_mask` is a valid out-param for sigfillset.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigfillset(&mut action.sa_mask);
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        let rc = libc::sigaction(PREEMPT_SIGNAL(), &action, std::ptr::null_mut());
        assert_eq!(rc, 0, "failed to install preemption signal handler");
    }
}

/// A one-shot timer bound to the calling carrier task, armed and
/// disarmed around each dispatched thread's time slice.
pub(crate) struct CarrierTimer {
    timer: libc::timer_t,
}

impl CarrierTimer {
    /// Creates a timer that delivers [`PREEMPT_SIGNAL`] to the calling
    /// kernel task specifically (`SIGEV_THREAD_ID`).
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: `sevp` and `timer` are valid out-params; `tid` is read
        // from the running task, which is always valid.
        unsafe {
            let tid = libc::syscall(libc::SYS_gettid) as libc::c_int;

            let mut sevp: libc::sigevent = std::mem::zeroed();
            sevp.sigev_notify = libc::SIGEV_THREAD_ID;
            sevp.sigev_signo = PREEMPT_SIGNAL();
            sevp.sigev_notify_thread_id = tid;

            let mut timer = MaybeUninit::uninit();
            let rc = libc::timer_create(libc::CLOCK_MONOTONIC, &mut sevp, timer.as_mut_ptr());
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                timer: timer.assume_init(),
            })
        }
    }

    /// Arms the timer to fire once after `slice`.
    pub(crate) fn start(&self, slice: Duration) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: slice.as_secs().try_into().unwrap_or(i64::MAX),
                tv_nsec: i64::from(slice.subsec_nanos()),
            },
        };
        // Safety: `self.timer` was created by `timer_create` above and is
        // owned exclusively by this `CarrierTimer`.
        unsafe {
            libc::timer_settime(self.timer, 0, &spec, std::ptr::null_mut());
        }
    }

    /// Disarms the timer. Idempotent.
    pub(crate) fn stop(&self) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        // Safety: see `start`.
        unsafe {
            libc::timer_settime(self.timer, 0, &spec, std::ptr::null_mut());
        }
    }
}

impl Drop for CarrierTimer {
    fn drop(&mut self) {
        // Safety: `self.timer` is owned exclusively by this value.
        unsafe {
            libc::timer_delete(self.timer);
        }
    }
}
