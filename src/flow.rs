//! Remote-ready / local-ready handshake.
//!
//! Two out-of-band lines keep the peers from talking over each other:
//! - `remote_ready` (input): the peer asserts it when it wants to transfer
//! - `local_ready` (output): we assert it when we are prepared to transfer
//!
//! The side with data asserts its line first; the transfer starts when the
//! peer's line goes active. If we have a transmit staged when the remote
//! line asserts, the same edge carries it (bidirectional transaction).
//!
//! Edge notifications are treated as hints: the physical input is sampled
//! and compared with the tracked logical state, so a duplicated edge is
//! ignored and a missed one is recovered when the transfer completes.
//!
//! Links without the handshake use [`FlowControl::disabled`], which is
//! always ready and only tracks whether a transmit is in flight.

/// The two handshake lines plus the power constraint held during a transfer.
pub trait FlowLines: Send {
    /// Physical state of the remote-ready input (`true` = asserted).
    fn remote_ready(&self) -> bool;

    /// Drive the local-ready output.
    fn set_local_ready(&mut self, asserted: bool);

    /// Hold or release the "stay awake" constraint while a transfer is active.
    fn set_transfer_constraint(&mut self, _held: bool) {}
}

/// Lines for a link without hardware handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl FlowLines for AlwaysReady {
    fn remote_ready(&self) -> bool {
        true
    }

    fn set_local_ready(&mut self, _asserted: bool) {}
}

/// Edge reported by the interrupt side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEdge {
    /// Remote-ready went active.
    Asserted,
    /// Remote-ready went inactive.
    Deasserted,
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Nothing in flight.
    Idle,
    /// Peer asserted; a receive is running.
    RemoteAssertedAwaitingRead,
    /// A transmit (possibly bidirectional) is running.
    Transmitting,
}

/// What the task must ask the transport to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Arm a receive.
    BeginRead,
    /// Hand the staged buffer to the transport.
    BeginTransmit,
    /// Finish the running receive.
    StopRead,
}

/// Result of asking to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Write to the transport immediately.
    SendNow,
    /// Local-ready asserted; wait for the peer's edge.
    Staged,
    /// A transfer is already running or staged.
    Busy,
}

/// Handshake state machine.
pub struct FlowControl {
    lines: Box<dyn FlowLines>,
    enabled: bool,
    state: FlowState,
    remote_asserted: bool,
    tx_staged: bool,
    constraint_held: bool,
}

impl FlowControl {
    /// Handshake over the given lines.
    pub fn new(lines: Box<dyn FlowLines>) -> Self {
        let remote_asserted = lines.remote_ready();
        Self {
            lines,
            enabled: true,
            state: FlowState::Idle,
            remote_asserted,
            tx_staged: false,
            constraint_held: false,
        }
    }

    /// No handshake: always ready.
    pub fn disabled() -> Self {
        Self {
            lines: Box::new(AlwaysReady),
            enabled: false,
            state: FlowState::Idle,
            remote_asserted: true,
            tx_staged: false,
            constraint_held: false,
        }
    }

    /// Whether the handshake lines are in use.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// A transmit is waiting for the peer's edge.
    #[inline]
    pub fn tx_staged(&self) -> bool {
        self.tx_staged
    }

    /// A transfer is running or staged, so no new transmit can start.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.tx_staged || self.state != FlowState::Idle
    }

    fn hold_constraint(&mut self, held: bool) {
        if self.constraint_held != held {
            self.constraint_held = held;
            self.lines.set_transfer_constraint(held);
        }
    }

    /// Handle an edge notification.
    pub fn on_edge(&mut self, reported: FlowEdge) -> Option<FlowAction> {
        if !self.enabled {
            return None;
        }

        let physical = self.lines.remote_ready();
        let reported_asserted = reported == FlowEdge::Asserted;
        if physical != reported_asserted {
            tracing::debug!(?reported, physical, "edge disagrees with line, using line");
        }
        self.resolve(physical)
    }

    fn resolve(&mut self, physical: bool) -> Option<FlowAction> {
        if physical == self.remote_asserted {
            tracing::trace!(physical, "duplicate flow edge ignored");
            return None;
        }
        self.remote_asserted = physical;

        if physical {
            match self.state {
                FlowState::Idle if self.tx_staged => {
                    self.tx_staged = false;
                    self.state = FlowState::Transmitting;
                    tracing::debug!("remote ready, sending staged frame");
                    Some(FlowAction::BeginTransmit)
                }
                FlowState::Idle => {
                    self.hold_constraint(true);
                    self.lines.set_local_ready(true);
                    self.state = FlowState::RemoteAssertedAwaitingRead;
                    tracing::debug!("remote ready, receiving");
                    Some(FlowAction::BeginRead)
                }
                _ => None,
            }
        } else if self.state == FlowState::RemoteAssertedAwaitingRead {
            Some(FlowAction::StopRead)
        } else {
            None
        }
    }

    /// Ask to transmit a frame.
    pub fn stage_transmit(&mut self) -> StageOutcome {
        if self.is_busy() {
            return StageOutcome::Busy;
        }

        if !self.enabled {
            self.state = FlowState::Transmitting;
            return StageOutcome::SendNow;
        }

        self.hold_constraint(true);
        self.lines.set_local_ready(true);

        if self.remote_asserted {
            self.state = FlowState::Transmitting;
            StageOutcome::SendNow
        } else {
            self.tx_staged = true;
            StageOutcome::Staged
        }
    }

    /// A transfer finished.
    ///
    /// Returns a follow-up action if the remote line moved while the
    /// transfer was running and its edge was missed.
    pub fn on_transfer_complete(&mut self, tx_len: usize) -> Option<FlowAction> {
        if self.state == FlowState::Transmitting && tx_len == 0 {
            // Receive-only completion while our transmit is still running.
            return None;
        }

        self.state = FlowState::Idle;
        if !self.enabled {
            return None;
        }

        if !self.tx_staged {
            self.lines.set_local_ready(false);
            self.hold_constraint(false);
        }

        let physical = self.lines.remote_ready();
        if physical != self.remote_asserted {
            tracing::debug!(physical, "recovering missed flow edge");
            return self.resolve(physical);
        }
        None
    }

    /// Drop any staged transmit and release the lines.
    pub fn reset(&mut self) {
        self.tx_staged = false;
        self.state = FlowState::Idle;
        if self.enabled {
            self.lines.set_local_ready(false);
        }
        self.hold_constraint(false);
    }
}
