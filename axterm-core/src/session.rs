//! The AX.25 connected-mode session state machine.
//!
//! Pure in the same sense as [`SoftTnc::handle_frame`] in the teacher
//! codebase this is grounded on: `handle` takes the current state and an
//! event and returns a new state plus an ordered list of actions. It never
//! performs I/O, never owns a clock, and never holds onto unacked payloads -
//! retransmission and timer scheduling are the runtime's responsibility, the
//! session only ever reports what V(A)/V(S)/V(R) currently are.

/// Clamp `windowSize`/`maxRetries` the way `LinkSetup`/`M17Address` validate
/// their inputs at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AX25SessionConfig {
    pub window_size: u8,
    pub max_retries: u32,
    pub extended: bool,
}

impl Default for AX25SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 2,
            max_retries: 10,
            extended: false,
        }
    }
}

impl AX25SessionConfig {
    pub fn new(window_size: u8, max_retries: u32, extended: bool) -> Self {
        let max_window = if extended { 127 } else { 7 };
        Self {
            window_size: window_size.clamp(1, max_window),
            max_retries: max_retries.max(1),
            extended,
        }
    }

    fn modulo(&self) -> u8 {
        if self.extended {
            128
        } else {
            8
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ConnectRequest,
    DisconnectRequest,
    SendData(Vec<u8>),
    ReceivedUa,
    ReceivedDm,
    ReceivedSabm,
    ReceivedDisc,
    ReceivedFrmr,
    ReceivedRr { nr: u8 },
    ReceivedRnr { nr: u8 },
    ReceivedRej { nr: u8 },
    ReceivedI { ns: u8, nr: u8, payload: Vec<u8> },
    T1Timeout,
    T3Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SendSabm,
    SendUa,
    SendDm,
    SendDisc,
    SendRr { nr: u8, poll_final: bool },
    SendRnr { nr: u8 },
    SendRej { nr: u8 },
    SendI { ns: u8, nr: u8, payload: Vec<u8> },
    StartT1,
    StopT1,
    StartT3,
    StopT3,
    DeliverData(Vec<u8>),
    NotifyConnected,
    NotifyDisconnected,
    NotifyError(String),
}

/// T3 (idle keepalive) is fixed, unlike T1 which is estimated and backed off.
pub const T3_SECONDS: f64 = 180.0;
const RTO_MIN_SECONDS: f64 = 1.0;
const RTO_MAX_SECONDS: f64 = 30.0;
const RTO_INITIAL_SECONDS: f64 = 3.0;
const RTO_ALPHA: f64 = 1.0 / 8.0;
const RTO_BETA: f64 = 1.0 / 4.0;

/// Jacobson/Karels RTO estimator, clamped to `[1s, 30s]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtoEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: 0.0,
            rto: RTO_INITIAL_SECONDS,
        }
    }
}

impl RtoEstimator {
    pub fn rto_seconds(&self) -> f64 {
        self.rto
    }

    /// Fold in a fresh RTT sample (seconds).
    pub fn record_sample(&mut self, sample_secs: f64) {
        match self.srtt {
            None => {
                self.srtt = Some(sample_secs);
                self.rttvar = sample_secs / 2.0;
            }
            Some(srtt) => {
                let err = (srtt - sample_secs).abs();
                self.rttvar = (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * err;
                self.srtt = Some((1.0 - RTO_ALPHA) * srtt + RTO_ALPHA * sample_secs);
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + 4.0 * self.rttvar).clamp(RTO_MIN_SECONDS, RTO_MAX_SECONDS);
    }

    /// Exponential backoff applied on a retransmission timeout: doubles RTO
    /// up to the 30s ceiling without touching the SRTT/RTTVAR samples.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2.0).min(RTO_MAX_SECONDS);
    }
}

/// One AX.25 connected-mode session. Holds only sequence-number state, the
/// retry counter for the current state, and the RTO estimator - no queued
/// payloads, no sockets, no clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    config: AX25SessionConfig,
    state: SessionState,
    vs: u8,
    vr: u8,
    va: u8,
    retry: u32,
    rto: RtoEstimator,
}

impl Session {
    pub fn new(config: AX25SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            vs: 0,
            vr: 0,
            va: 0,
            retry: 0,
            rto: RtoEstimator::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn vs(&self) -> u8 {
        self.vs
    }

    pub fn vr(&self) -> u8 {
        self.vr
    }

    pub fn va(&self) -> u8 {
        self.va
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn rto(&self) -> &RtoEstimator {
        &self.rto
    }

    pub fn rto_mut(&mut self) -> &mut RtoEstimator {
        &mut self.rto
    }

    fn modulo(&self) -> u16 {
        self.config.modulo() as u16
    }

    /// `(V(S) - V(A)) mod modulo`: frames sent but not yet acked.
    pub fn outstanding(&self) -> u16 {
        let modulo = self.modulo();
        (self.vs as u16 + modulo - self.va as u16) % modulo
    }

    pub fn can_send(&self) -> bool {
        self.outstanding() < self.config.window_size as u16
    }

    fn reset_sequence(&mut self) {
        self.vs = 0;
        self.vr = 0;
        self.va = 0;
    }

    fn ack_up_to(&mut self, nr: u8) {
        self.va = nr % self.config.modulo();
    }

    fn enter(&mut self, state: SessionState) {
        self.state = state;
        self.retry = 0;
    }

    /// Apply one event, returning the ordered actions the runtime must carry
    /// out. Any (state, event) pair not called out below is a no-op: the
    /// state stays put and no actions are emitted.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        use SessionState::*;

        match (self.state, event) {
            (Disconnected, Event::ConnectRequest) => {
                self.reset_sequence();
                self.enter(Connecting);
                vec![Action::SendSabm, Action::StartT1]
            }
            (Disconnected, Event::ReceivedSabm) => {
                self.reset_sequence();
                self.enter(Connected);
                vec![Action::SendUa, Action::StartT3, Action::NotifyConnected]
            }
            (Disconnected, Event::ReceivedDisc) => {
                vec![Action::SendDm]
            }

            (Connecting, Event::ReceivedUa) => {
                self.enter(Connected);
                vec![Action::StopT1, Action::StartT3, Action::NotifyConnected]
            }
            (Connecting, Event::ReceivedDm) => {
                self.enter(Disconnected);
                vec![Action::StopT1, Action::NotifyError("refused".to_string())]
            }
            (Connecting, Event::T1Timeout) => self.handle_connect_retry(),

            (Connected, Event::DisconnectRequest) => {
                self.enter(Disconnecting);
                vec![Action::SendDisc, Action::StopT3, Action::StartT1]
            }
            (Connected, Event::ReceivedDisc) => {
                self.enter(Disconnected);
                vec![Action::SendUa, Action::StopT3, Action::NotifyDisconnected]
            }
            (Connected, Event::ReceivedSabm) => {
                self.reset_sequence();
                // still connected, just re-synchronized
                self.retry = 0;
                vec![Action::SendUa, Action::StartT3]
            }
            (Connected, Event::ReceivedI { ns, nr, payload }) => self.handle_i_frame(ns, nr, payload),
            (Connected, Event::ReceivedRr { nr }) => {
                if self.outstanding() > 0 {
                    self.ack_up_to(nr);
                }
                if self.outstanding() == 0 {
                    vec![Action::StopT1, Action::StartT3]
                } else {
                    vec![]
                }
            }
            (Connected, Event::ReceivedRnr { nr }) => {
                if self.outstanding() > 0 {
                    self.ack_up_to(nr);
                }
                vec![Action::StopT1]
            }
            (Connected, Event::ReceivedRej { nr }) => {
                if self.outstanding() > 0 {
                    self.ack_up_to(nr);
                }
                vec![Action::StartT1]
            }
            (Connected, Event::ReceivedFrmr) => {
                self.enter(Error);
                vec![Action::StopT3, Action::NotifyError("protocolError".to_string())]
            }
            (Connected, Event::ReceivedDm) => {
                self.enter(Disconnected);
                vec![Action::StopT3, Action::NotifyError("protocolError".to_string())]
            }
            (Connected, Event::T1Timeout) => self.handle_connected_retry(),
            (Connected, Event::T3Timeout) => {
                vec![
                    Action::SendRr {
                        nr: self.vr,
                        poll_final: true,
                    },
                    Action::StartT1,
                ]
            }
            (Connected, Event::SendData(payload)) => {
                if self.can_send() {
                    let ns = self.vs;
                    self.vs = ((self.vs as u16 + 1) % self.modulo()) as u8;
                    vec![
                        Action::SendI {
                            ns,
                            nr: self.vr,
                            payload,
                        },
                        Action::StartT1,
                    ]
                } else {
                    vec![]
                }
            }

            (Disconnecting, Event::ReceivedUa) | (Disconnecting, Event::ReceivedDm) => {
                self.enter(Disconnected);
                vec![Action::StopT1, Action::NotifyDisconnected]
            }
            (Disconnecting, Event::T1Timeout) => self.handle_disconnecting_retry(),

            (Error, Event::ConnectRequest) => {
                self.reset_sequence();
                self.enter(Connecting);
                vec![Action::SendSabm, Action::StartT1]
            }

            _ => vec![],
        }
    }

    fn handle_connect_retry(&mut self) -> Vec<Action> {
        self.retry += 1;
        self.rto.backoff();
        if self.retry > self.config.max_retries {
            self.state = SessionState::Error;
            vec![Action::NotifyError("retriesExceeded".to_string())]
        } else {
            vec![Action::SendSabm, Action::StartT1]
        }
    }

    fn handle_connected_retry(&mut self) -> Vec<Action> {
        self.retry += 1;
        self.rto.backoff();
        if self.retry > self.config.max_retries {
            self.state = SessionState::Error;
            vec![Action::NotifyError("retriesExceeded".to_string())]
        } else {
            vec![Action::StartT1]
        }
    }

    fn handle_disconnecting_retry(&mut self) -> Vec<Action> {
        self.retry += 1;
        self.rto.backoff();
        if self.retry > self.config.max_retries {
            self.enter(SessionState::Disconnected);
            vec![Action::NotifyDisconnected]
        } else {
            vec![Action::SendDisc, Action::StartT1]
        }
    }

    fn handle_i_frame(&mut self, ns: u8, nr: u8, payload: Vec<u8>) -> Vec<Action> {
        if self.outstanding() > 0 {
            self.ack_up_to(nr);
        }
        if ns == self.vr {
            self.vr = ((self.vr as u16 + 1) % self.modulo()) as u8;
            let mut actions = vec![
                Action::DeliverData(payload),
                Action::SendRr {
                    nr: self.vr,
                    poll_final: false,
                },
                Action::StartT3,
            ];
            if self.outstanding() == 0 {
                actions.push(Action::StopT1);
            }
            actions
        } else {
            vec![Action::SendRej { nr: self.vr }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_arithmetic_invariant() {
        for modulo in [8u16, 128] {
            let extended = modulo == 128;
            let mut session = Session::new(AX25SessionConfig::new(1, 10, extended));
            session.vs = 5;
            session.va = 2;
            if extended {
                session.vs = 100;
                session.va = 90;
            }
            let outstanding = session.outstanding();
            assert!(outstanding < modulo);
        }
    }

    #[test]
    fn window_matches_can_send() {
        let mut session = Session::new(AX25SessionConfig::new(2, 10, false));
        session.state = SessionState::Connected;
        assert!(session.can_send());
        session.vs = 2;
        assert!(!session.can_send());
    }

    #[test]
    fn rto_stays_clamped() {
        let mut rto = RtoEstimator::default();
        for _ in 0..5 {
            rto.backoff();
        }
        assert!(rto.rto_seconds() <= 30.0);
        rto.record_sample(0.05);
        assert!(rto.rto_seconds() >= 1.0);
    }

    #[test]
    fn rto_first_sample_sets_srtt_and_half_rttvar() {
        let mut rto = RtoEstimator::default();
        rto.record_sample(2.0);
        // srtt=2.0, rttvar=1.0 -> rto = 2.0 + 4.0 = 6.0
        assert!((rto.rto_seconds() - 6.0).abs() < 1e-9);
    }

    // S1 — Connect/disconnect
    #[test]
    fn s1_connect_disconnect() {
        let mut session = Session::new(AX25SessionConfig::default());
        assert_eq!(
            session.handle(Event::ConnectRequest),
            vec![Action::SendSabm, Action::StartT1]
        );
        assert_eq!(
            session.handle(Event::ReceivedUa),
            vec![Action::StopT1, Action::StartT3, Action::NotifyConnected]
        );
        assert_eq!(
            session.handle(Event::DisconnectRequest),
            vec![Action::SendDisc, Action::StopT3, Action::StartT1]
        );
        assert_eq!(
            session.handle(Event::ReceivedUa),
            vec![Action::StopT1, Action::NotifyDisconnected]
        );
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    // S2 — Out-of-sequence I-frame
    #[test]
    fn s2_out_of_sequence_i_frame() {
        let mut session = Session::new(AX25SessionConfig::default());
        session.state = SessionState::Connected;
        assert_eq!(session.vr(), 0);
        let actions = session.handle(Event::ReceivedI {
            ns: 1,
            nr: 0,
            payload: b"x".to_vec(),
        });
        assert_eq!(actions, vec![Action::SendRej { nr: 0 }]);
        assert_eq!(session.vr(), 0);
    }

    // S3 — In-sequence I-frame
    #[test]
    fn s3_in_sequence_i_frame() {
        let mut session = Session::new(AX25SessionConfig::default());
        session.state = SessionState::Connected;
        let actions = session.handle(Event::ReceivedI {
            ns: 0,
            nr: 0,
            payload: b"x".to_vec(),
        });
        assert_eq!(
            actions,
            vec![
                Action::DeliverData(b"x".to_vec()),
                Action::SendRr {
                    nr: 1,
                    poll_final: false
                },
                Action::StartT3,
                Action::StopT1,
            ]
        );
        assert_eq!(session.vr(), 1);
    }

    #[test]
    fn retry_counter_resets_on_state_entry() {
        let mut session = Session::new(AX25SessionConfig::new(1, 2, false));
        session.handle(Event::ConnectRequest);
        session.handle(Event::T1Timeout);
        assert_eq!(session.retry(), 1);
        session.handle(Event::ReceivedUa);
        assert_eq!(session.retry(), 0);
    }

    #[test]
    fn retries_exceeded_moves_to_error() {
        let mut session = Session::new(AX25SessionConfig::new(1, 2, false));
        session.handle(Event::ConnectRequest);
        session.handle(Event::T1Timeout);
        session.handle(Event::T1Timeout);
        let actions = session.handle(Event::T1Timeout);
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(
            actions,
            vec![Action::NotifyError("retriesExceeded".to_string())]
        );
    }

    #[test]
    fn rej_triggers_start_t1_without_retransmitting_itself() {
        let mut session = Session::new(AX25SessionConfig::new(4, 10, false));
        session.state = SessionState::Connected;
        session.vs = 3;
        session.va = 0;
        let actions = session.handle(Event::ReceivedRej { nr: 1 });
        assert_eq!(actions, vec![Action::StartT1]);
        assert_eq!(session.va(), 1);
    }

    #[test]
    fn send_data_respects_window() {
        let mut session = Session::new(AX25SessionConfig::new(1, 10, false));
        session.state = SessionState::Connected;
        let actions = session.handle(Event::SendData(b"a".to_vec()));
        assert_eq!(
            actions,
            vec![
                Action::SendI {
                    ns: 0,
                    nr: 0,
                    payload: b"a".to_vec()
                },
                Action::StartT1
            ]
        );
        // window size 1, one frame outstanding: second send is a no-op
        assert_eq!(session.handle(Event::SendData(b"b".to_vec())), vec![]);
    }
}
