use super::DkgError;
use std::fmt::Display;

/// Observable lifecycle of the key generation actor. The wire phases
/// (deal, response, justification) live inside the protocol instance;
/// what the operator sees is the coarse progress below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkgStatus {
    /// Nothing running; also the state after a timeout or abort.
    Idle,
    /// Kick received or sent, waiting for the execution to start.
    Announced,
    /// Protocol instance is exchanging bundles.
    Running,
    /// A share and an augmented group were produced.
    Finished,
}

impl Display for DkgStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DkgStatus::Idle => "idle",
            DkgStatus::Announced => "announced",
            DkgStatus::Running => "running",
            DkgStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Outcome delivered by the execution task back to the actor.
#[derive(Debug)]
pub enum DkgOutcome {
    /// Qualified participant: share persisted, epoch starts at the round.
    Finished { first_round: u64 },
    /// Old-group member not retained by the resharing; participated up
    /// to dealing and holds no new share.
    Left,
    /// Protocol failed or was rejected.
    Aborted(DkgError),
    /// Operator timeout elapsed; state returns to idle, no share produced.
    TimedOut,
}

/// Tracks status transitions and the epoch counter.
#[derive(Debug)]
pub struct StateMachine {
    status: DkgStatus,
    epoch: u32,
}

impl StateMachine {
    pub fn new(has_completed_epoch: bool) -> Self {
        Self {
            status: if has_completed_epoch {
                DkgStatus::Finished
            } else {
                DkgStatus::Idle
            },
            epoch: u32::from(has_completed_epoch),
        }
    }

    pub fn status(&self) -> DkgStatus {
        self.status
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// A new key generation can start unless one is in flight. A reshare
    /// whose old group is itself mid-DKG is rejected here.
    pub fn announce(&mut self) -> Result<(), DkgError> {
        match self.status {
            DkgStatus::Announced | DkgStatus::Running => Err(DkgError::AlreadyRunning),
            DkgStatus::Idle | DkgStatus::Finished => {
                self.status = DkgStatus::Announced;
                Ok(())
            }
        }
    }

    pub fn executing(&mut self) {
        self.status = DkgStatus::Running;
    }

    /// Rolls back a failed announcement to the pre-announce state.
    pub fn abort_announce(&mut self) {
        self.status = if self.epoch > 0 {
            DkgStatus::Finished
        } else {
            DkgStatus::Idle
        };
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, DkgStatus::Announced | DkgStatus::Running)
    }

    pub fn apply(&mut self, outcome: &DkgOutcome) {
        match outcome {
            DkgOutcome::Finished { .. } => {
                self.epoch += 1;
                self.status = DkgStatus::Finished;
            }
            DkgOutcome::Left => self.status = DkgStatus::Idle,
            DkgOutcome::Aborted(_) | DkgOutcome::TimedOut => self.status = DkgStatus::Idle,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_second_announce_while_running() {
        let mut sm = StateMachine::new(false);
        assert_eq!(sm.status(), DkgStatus::Idle);

        sm.announce().unwrap();
        assert!(matches!(sm.announce(), Err(DkgError::AlreadyRunning)));
        sm.executing();
        assert!(matches!(sm.announce(), Err(DkgError::AlreadyRunning)));

        sm.apply(&DkgOutcome::TimedOut);
        assert_eq!(sm.status(), DkgStatus::Idle);
        sm.announce().unwrap();
    }

    #[test]
    fn epoch_advances_only_on_finish() {
        let mut sm = StateMachine::new(false);
        sm.announce().unwrap();
        sm.executing();
        sm.apply(&DkgOutcome::Aborted(DkgError::Timeout));
        assert_eq!(sm.epoch(), 0);

        sm.announce().unwrap();
        sm.executing();
        sm.apply(&DkgOutcome::Finished { first_round: 1 });
        assert_eq!(sm.epoch(), 1);
        assert_eq!(sm.status(), DkgStatus::Finished);

        // Resharing starts from a finished epoch.
        sm.announce().unwrap();
        sm.apply(&DkgOutcome::Finished { first_round: 42 });
        assert_eq!(sm.epoch(), 2);
    }
}
