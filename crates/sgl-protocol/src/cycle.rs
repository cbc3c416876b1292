//! The submit/ready command cycle.
//!
//! The `lock` register names the side allowed to touch the command area and
//! the result slots:
//!
//! 1. The client CASes `lock` from free to client, writes the command record
//!    and stores the command id into `submit`.
//! 2. The host sees `submit` with `lock == client` and CASes `lock` to host.
//! 3. The host writes `retval`, `status` and the vector slot, clears `submit`,
//!    raises `ready_hint` and stores `lock = client`.
//! 4. The client sees `ready_hint` together with `lock == client`, reads the
//!    results, clears `ready_hint`, then either releases `lock` or keeps it for
//!    the next block of a bulk session.
//!
//! [`ClientLock`] is the client's ownership of step 1..4. Dropping it releases
//! the lock, which is how every client-side error path rolls back.

use crate::backoff::Wait;
use crate::error::{Status, WaitError};
use crate::layout::{LOCK_CLIENT, LOCK_FREE, LOCK_HOST};
use crate::regs::{Reg, RegisterFile};

/// Results of one completed cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub retval: u32,
    pub status: u32,
}

impl Completion {
    pub fn status(&self) -> Option<Status> {
        Status::from_u32(self.status)
    }
}

/// Client ownership of the `lock` register.
#[derive(Debug)]
pub struct ClientLock<'r, R: RegisterFile + ?Sized> {
    regs: &'r R,
    held: bool,
}

/// Single attempt at taking the lock.
pub fn try_acquire_lock<R: RegisterFile + ?Sized>(regs: &R) -> Option<ClientLock<'_, R>> {
    regs.compare_exchange(Reg::Lock, LOCK_FREE, LOCK_CLIENT)
        .ok()
        .map(|_| ClientLock { regs, held: true })
}

pub fn acquire_lock<'r, R, W>(regs: &'r R, wait: &mut W) -> Result<ClientLock<'r, R>, WaitError>
where
    R: RegisterFile + ?Sized,
    W: Wait + ?Sized,
{
    loop {
        if let Some(lock) = try_acquire_lock(regs) {
            return Ok(lock);
        }
        wait.wait()?;
    }
}

impl<'r, R: RegisterFile + ?Sized> ClientLock<'r, R> {
    pub fn regs(&self) -> &'r R {
        self.regs
    }

    /// Hands the command area to the host. The record must already be written.
    pub fn submit(&mut self, command: u32) {
        debug_assert_ne!(command, 0, "command ids start at 1");
        self.regs.store(Reg::Submit, command);
    }

    /// Collects the results if the host has finished the cycle.
    pub fn poll_ready(&mut self) -> Option<Completion> {
        if self.regs.load(Reg::ReadyHint) == 0 || self.regs.load(Reg::Lock) != LOCK_CLIENT {
            return None;
        }
        let completion = Completion {
            retval: self.regs.load(Reg::Retval),
            status: self.regs.load(Reg::Status),
        };
        self.regs.store(Reg::ReadyHint, 0);
        Some(completion)
    }

    /// Submits `command` and waits for the host to finish the cycle.
    ///
    /// On a wait failure the submission is withdrawn if the host has not taken
    /// it yet; otherwise the lock is left for the host watchdog to reclaim.
    pub fn transact<W: Wait + ?Sized>(
        &mut self,
        command: u32,
        wait: &mut W,
    ) -> Result<Completion, WaitError> {
        self.submit(command);
        loop {
            if let Some(completion) = self.poll_ready() {
                return Ok(completion);
            }
            if let Err(err) = wait.wait() {
                self.withdraw();
                return Err(err);
            }
        }
    }

    fn withdraw(&mut self) {
        // Succeeds only while the host is not inside the cycle.
        if self
            .regs
            .compare_exchange(Reg::Lock, LOCK_CLIENT, LOCK_FREE)
            .is_ok()
        {
            self.regs.store(Reg::Submit, 0);
            self.regs.store(Reg::ReadyHint, 0);
            self.held = false;
        }
    }

    pub fn release(self) {}
}

impl<R: RegisterFile + ?Sized> Drop for ClientLock<'_, R> {
    fn drop(&mut self) {
        if self.held {
            let _ = self
                .regs
                .compare_exchange(Reg::Lock, LOCK_CLIENT, LOCK_FREE);
        }
    }
}

/// Host side of step 2: takes ownership of a pending submission.
pub fn take_submission<R: RegisterFile + ?Sized>(regs: &R) -> Option<u32> {
    let command = regs.load(Reg::Submit);
    if command == 0 {
        return None;
    }
    regs.compare_exchange(Reg::Lock, LOCK_CLIENT, LOCK_HOST).ok()?;
    Some(command)
}

/// Host side of step 3. The vector slot must already be written.
pub fn complete<R: RegisterFile + ?Sized>(regs: &R, retval: u32, status: Status) {
    regs.store(Reg::Retval, retval);
    regs.store(Reg::Status, status.as_u32());
    regs.store(Reg::Submit, 0);
    regs.store(Reg::ReadyHint, 1);
    regs.store(Reg::Lock, LOCK_CLIENT);
}
