/// Where a worker stands with its broker, judged from message cadence alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Connected and heard from within the last interval.
    Live,
    /// Connected, but at least one interval passed in silence.
    Degraded,
    /// Silence ran out; the connection is being reopened.
    Reconnecting,
    /// Reconnect attempts are exhausted.
    Terminated,
}

/// What to do after an interval passed in silence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Wait,
    Reconnect,
    Terminate,
}

/// The worker's side of heartbeating. `liveness` counts the silent
/// intervals still tolerated; `retries_left` counts the reconnects still
/// allowed. Any receipt refills both.
#[derive(Clone, Debug)]
pub struct Liveness {
    max_liveness: u32,
    max_retries: u32,
    liveness: u32,
    retries_left: u32,
    state: LinkState,
}

impl Liveness {
    pub fn new(max_liveness: u32, max_retries: u32) -> Self {
        let max_liveness = max_liveness.max(1);
        Liveness {
            max_liveness,
            max_retries,
            liveness: max_liveness,
            retries_left: max_retries,
            state: LinkState::Live,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn liveness(&self) -> u32 {
        self.liveness
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn on_job(&mut self) {
        self.on_heartbeat();
    }

    pub fn on_heartbeat(&mut self) {
        self.liveness = self.max_liveness;
        self.state = LinkState::Live;
        self.forgive();
    }

    /// A message that proves the link works without counting as a
    /// heartbeat.
    pub fn on_other(&mut self) {
        self.forgive();
    }

    fn forgive(&mut self) {
        if self.retries_left < self.max_retries {
            self.retries_left = self.max_retries;
        }
    }

    pub fn on_silence(&mut self) -> Verdict {
        if self.state == LinkState::Terminated {
            return Verdict::Terminate;
        }
        self.liveness = self.liveness.saturating_sub(1);
        if self.liveness > 0 {
            self.state = LinkState::Degraded;
            return Verdict::Wait;
        }
        if self.retries_left == 0 {
            self.state = LinkState::Terminated;
            return Verdict::Terminate;
        }
        self.retries_left -= 1;
        self.state = LinkState::Reconnecting;
        Verdict::Reconnect
    }

    /// The connection was reopened and READY sent again.
    pub fn on_reconnected(&mut self) {
        self.liveness = self.max_liveness;
        self.state = LinkState::Live;
    }
}
