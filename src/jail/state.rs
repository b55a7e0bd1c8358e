//! Jail lifecycle state
//!
//! The persisted state of a jail is derived, never stored: a jail is absent,
//! stopped or running depending on what is on disk and in the kernel. The
//! transient states of a single start or stop live in an in-memory
//! state machine (state-machines crate, dynamic dispatch) that the
//! lifecycle controller drives phase by phase.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::jail::record::JailRecord;
use machine::{DynamicJailMachine, JailMachine, JailMachineEvent};

// Generated code names std's two-parameter Result
mod machine {
    use state_machines::state_machine;

    state_machine! {
    name: JailMachine,
    dynamic: true,
    initial: Stopped,
    states: [Stopped, Starting, Running, Stopping],
    events {
        start {
            transition: { from: Stopped, to: Starting }
        }
        started {
            transition: { from: Starting, to: Running }
        }
        // A failed start unwinds through the stop path
        stop {
            transition: { from: [Running, Starting], to: Stopping }
        }
        stopped {
            transition: { from: Stopping, to: Stopped }
        }
    }
    }
}

/// Observed state of a jail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailState {
    Absent,
    Stopped,
    Running,
}

impl JailState {
    /// Derive the state from the jail directory and the kernel
    pub fn observe(ctx: &Context, record: &JailRecord) -> Self {
        if ctx.host().jail_id(&record.kernel_name()).is_some() {
            JailState::Running
        } else if record.dir(ctx).is_dir() {
            JailState::Stopped
        } else {
            JailState::Absent
        }
    }
}

impl std::fmt::Display for JailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JailState::Absent => "absent",
            JailState::Stopped => "down",
            JailState::Running => "up",
        };
        write!(f, "{}", s)
    }
}

/// In-flight lifecycle operation on one jail
pub struct Transition {
    jail: String,
    machine: DynamicJailMachine<()>,
}

impl Transition {
    /// Begin tracking from an observed state
    pub fn from_observed(jail: &str, state: JailState) -> Result<Self> {
        let mut transition = Self {
            jail: jail.to_string(),
            machine: JailMachine::new(()).into_dynamic(),
        };
        match state {
            JailState::Absent => return Err(Error::NotFound(format!("jail '{}'", jail))),
            JailState::Stopped => {}
            JailState::Running => {
                transition.fire(JailMachineEvent::Start)?;
                transition.fire(JailMachineEvent::Started)?;
            }
        }
        Ok(transition)
    }

    fn fire(&mut self, event: JailMachineEvent) -> Result<()> {
        let from = self.machine.current_state().to_string();
        self.machine.handle(event).map_err(|_| {
            Error::InvalidConfiguration(format!(
                "jail '{}' cannot make that transition from state {}",
                self.jail, from
            ))
        })?;
        tracing::trace!(jail = %self.jail, from = %from, to = self.machine.current_state(), "transition");
        Ok(())
    }

    pub fn state(&self) -> &str {
        self.machine.current_state()
    }

    pub fn start(&mut self) -> Result<()> {
        self.fire(JailMachineEvent::Start)
    }

    pub fn started(&mut self) -> Result<()> {
        self.fire(JailMachineEvent::Started)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.fire(JailMachineEvent::Stop)
    }

    pub fn stopped(&mut self) -> Result<()> {
        self.fire(JailMachineEvent::Stopped)
    }
}
