//! Transaction state machines of RFC 3261 section 17 as a pure function.
//!
//! `transition` takes the current state and an input and returns the next
//! state together with the actions the executor must perform. It never does
//! I/O itself, so every path can be checked without sockets or clocks.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionType::ClientInvite => write!(f, "ClientInvite"),
            TransactionType::ClientNonInvite => write!(f, "ClientNonInvite"),
            TransactionType::ServerInvite => write!(f, "ServerInvite"),
            TransactionType::ServerNonInvite => write!(f, "ServerNonInvite"),
        }
    }
}

/// `retransmits` counts retransmissions already performed in the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Nothing,
    Calling { retransmits: u32 },
    Trying,
    Proceeding { retransmits: u32 },
    Completed { retransmits: u32 },
    Confirmed,
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, TransactionState::Terminated)
    }

    /// A final response has been sent or received.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed { .. }
                | TransactionState::Confirmed
                | TransactionState::Terminated
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Nothing => write!(f, "Nothing"),
            TransactionState::Calling { .. } => write!(f, "Calling"),
            TransactionState::Trying => write!(f, "Trying"),
            TransactionState::Proceeding { .. } => write!(f, "Proceeding"),
            TransactionState::Completed { .. } => write!(f, "Completed"),
            TransactionState::Confirmed => write!(f, "Confirmed"),
            TransactionState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// INVITE request retransmit
    A,
    /// INVITE transaction timeout
    B,
    /// wait for response retransmits
    D,
    /// non-INVITE request retransmit
    E,
    /// non-INVITE transaction timeout
    F,
    /// INVITE final response retransmit
    G,
    /// wait for ACK
    H,
    /// wait for ACK retransmits
    I,
    /// wait for non-INVITE request retransmits
    J,
    /// wait for non-INVITE response retransmits
    K,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timer{:?}", self)
    }
}

/// What drives a transition. Responses are classified by status class;
/// for client transactions they were received, for server transactions
/// the transaction user is sending them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionInput {
    SendRequest,
    ReceiveRequest,
    RetransmittedRequest,
    Ack,
    Cancel,
    Provisional,
    Success,
    Failure,
    Timer(TimerKind),
    TransportError,
    /// The transaction user sent a CANCEL for this INVITE.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionFailure {
    Timeout,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionAction {
    /// First transmission of the original request.
    Transmit,
    /// Resend the original request (client) or the last response (server).
    Retransmit,
    /// Generate and send the ACK for a non-2xx final response.
    SendAck,
    /// Resend the cached ACK on a retransmitted final response.
    ResendAck,
    SendTrying,
    /// Send the response handed in by the transaction user.
    SendResponse,
    /// Hand the message that caused the transition to the transaction user.
    Deliver,
    Schedule(TimerKind, Duration),
    CancelTimer(TimerKind),
    Fail(TransactionFailure),
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPolicy {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub max_retransmits: u32,
    /// Stream transports never retransmit and use zero wait timers.
    pub reliable: bool,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        TimerPolicy {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            max_retransmits: 10,
            reliable: false,
        }
    }
}

impl TimerPolicy {
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Interval before retransmission number `n + 1`.
    pub fn backoff(&self, n: u32, capped: bool) -> Duration {
        let interval = self.t1.saturating_mul(1u32 << n.min(16));
        if capped {
            interval.min(self.t2)
        } else {
            interval
        }
    }

    fn wait(&self, duration: Duration) -> Duration {
        if self.reliable {
            Duration::ZERO
        } else {
            duration
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: TransactionState,
    pub actions: Vec<TransactionAction>,
}

impl Transition {
    fn to(state: TransactionState, actions: Vec<TransactionAction>) -> Option<Self> {
        Some(Transition { state, actions })
    }
}

/// Compute the next state. `None` means the input is not legal in `state`
/// and must be ignored (or refused, when it came from the transaction user).
pub fn transition(
    kind: TransactionType,
    state: TransactionState,
    input: TransactionInput,
    policy: &TimerPolicy,
) -> Option<Transition> {
    use TransactionAction::*;
    use TransactionInput as In;
    use TransactionState as S;

    if let In::TransportError = input {
        return match state {
            S::Terminated => None,
            S::Completed { .. } | S::Confirmed => Transition::to(S::Terminated, vec![Terminate]),
            _ => Transition::to(
                S::Terminated,
                vec![Fail(TransactionFailure::Transport), Terminate],
            ),
        };
    }

    match kind {
        TransactionType::ClientInvite => client_invite(state, input, policy),
        TransactionType::ClientNonInvite => client_non_invite(state, input, policy),
        TransactionType::ServerInvite => server_invite(state, input, policy),
        TransactionType::ServerNonInvite => server_non_invite(state, input, policy),
    }
    .map(|mut t| {
        if t.state.is_terminated() && !t.actions.contains(&Terminate) {
            t.actions.push(Terminate);
        }
        t
    })
}

fn timed_out() -> Vec<TransactionAction> {
    vec![
        TransactionAction::Fail(TransactionFailure::Timeout),
        TransactionAction::Terminate,
    ]
}

fn client_invite(
    state: TransactionState,
    input: TransactionInput,
    policy: &TimerPolicy,
) -> Option<Transition> {
    use TimerKind::*;
    use TransactionAction::*;
    use TransactionInput as In;
    use TransactionState as S;

    match (state, input) {
        (S::Nothing, In::SendRequest) => {
            let mut actions = vec![Transmit];
            if !policy.reliable {
                actions.push(Schedule(A, policy.t1));
            }
            actions.push(Schedule(B, policy.timeout()));
            Transition::to(S::Calling { retransmits: 0 }, actions)
        }
        (S::Calling { retransmits }, In::Timer(A)) => {
            if retransmits >= policy.max_retransmits {
                return Transition::to(S::Terminated, timed_out());
            }
            Transition::to(
                S::Calling {
                    retransmits: retransmits + 1,
                },
                vec![
                    Retransmit,
                    Schedule(A, policy.backoff(retransmits + 1, false)),
                ],
            )
        }
        (S::Calling { .. }, In::Timer(B)) => Transition::to(S::Terminated, timed_out()),
        (S::Calling { .. }, In::Provisional) => Transition::to(
            S::Proceeding { retransmits: 0 },
            vec![CancelTimer(A), CancelTimer(B), Deliver],
        ),
        (S::Proceeding { .. }, In::Provisional) => Transition::to(state, vec![Deliver]),
        // RFC 3261 9.1: without a final response 64*T1 after the CANCEL the
        // INVITE is given up. Timer B is reused for that wait.
        (S::Proceeding { .. }, In::Cancelled) => {
            Transition::to(state, vec![Schedule(B, policy.timeout())])
        }
        (S::Proceeding { .. }, In::Timer(B)) => Transition::to(S::Terminated, timed_out()),
        (S::Calling { .. } | S::Proceeding { .. }, In::Success) => Transition::to(
            S::Completed { retransmits: 0 },
            vec![
                CancelTimer(A),
                CancelTimer(B),
                Deliver,
                Schedule(D, policy.timeout()),
            ],
        ),
        (S::Calling { .. } | S::Proceeding { .. }, In::Failure) => Transition::to(
            S::Completed { retransmits: 0 },
            vec![
                CancelTimer(A),
                CancelTimer(B),
                SendAck,
                Deliver,
                Schedule(D, policy.wait(policy.timeout())),
            ],
        ),
        (S::Completed { .. }, In::Success | In::Failure) => Transition::to(state, vec![ResendAck]),
        (S::Completed { .. }, In::Timer(D)) => Transition::to(S::Terminated, vec![Terminate]),
        _ => None,
    }
}

fn client_non_invite(
    state: TransactionState,
    input: TransactionInput,
    policy: &TimerPolicy,
) -> Option<Transition> {
    use TimerKind::*;
    use TransactionAction::*;
    use TransactionInput as In;
    use TransactionState as S;

    match (state, input) {
        (S::Nothing, In::SendRequest) => {
            let mut actions = vec![Transmit];
            if !policy.reliable {
                actions.push(Schedule(E, policy.t1));
            }
            actions.push(Schedule(F, policy.timeout()));
            Transition::to(S::Calling { retransmits: 0 }, actions)
        }
        (S::Calling { retransmits } | S::Proceeding { retransmits }, In::Timer(E)) => {
            if retransmits >= policy.max_retransmits {
                return Transition::to(S::Terminated, timed_out());
            }
            let next = match state {
                S::Proceeding { .. } => S::Proceeding {
                    retransmits: retransmits + 1,
                },
                _ => S::Calling {
                    retransmits: retransmits + 1,
                },
            };
            let interval = match state {
                S::Proceeding { .. } => policy.t2,
                _ => policy.backoff(retransmits + 1, true),
            };
            Transition::to(next, vec![Retransmit, Schedule(E, interval)])
        }
        (S::Calling { .. } | S::Proceeding { .. }, In::Timer(F)) => {
            Transition::to(S::Terminated, timed_out())
        }
        (S::Calling { retransmits } | S::Proceeding { retransmits }, In::Provisional) => {
            Transition::to(S::Proceeding { retransmits }, vec![Deliver])
        }
        (S::Calling { .. } | S::Proceeding { .. }, In::Success | In::Failure) => Transition::to(
            S::Completed { retransmits: 0 },
            vec![
                CancelTimer(E),
                CancelTimer(F),
                Deliver,
                Schedule(K, policy.wait(policy.t4)),
            ],
        ),
        (S::Completed { .. }, In::Provisional | In::Success | In::Failure) => {
            Transition::to(state, vec![])
        }
        (S::Completed { .. }, In::Timer(K)) => Transition::to(S::Terminated, vec![Terminate]),
        _ => None,
    }
}

fn server_invite(
    state: TransactionState,
    input: TransactionInput,
    policy: &TimerPolicy,
) -> Option<Transition> {
    use TimerKind::*;
    use TransactionAction::*;
    use TransactionInput as In;
    use TransactionState as S;

    match (state, input) {
        (S::Nothing, In::ReceiveRequest) => Transition::to(
            S::Proceeding { retransmits: 0 },
            vec![SendTrying, Deliver],
        ),
        (S::Proceeding { .. }, In::RetransmittedRequest) => {
            Transition::to(state, vec![Retransmit])
        }
        (S::Proceeding { .. }, In::Cancel) => Transition::to(state, vec![Deliver]),
        (S::Proceeding { .. }, In::Provisional) => Transition::to(state, vec![SendResponse]),
        (S::Proceeding { .. }, In::Success | In::Failure) => {
            let mut actions = vec![SendResponse];
            if !policy.reliable {
                actions.push(Schedule(G, policy.t1));
            }
            actions.push(Schedule(H, policy.timeout()));
            Transition::to(S::Completed { retransmits: 0 }, actions)
        }
        (S::Completed { retransmits }, In::Timer(G)) => {
            if retransmits >= policy.max_retransmits {
                return Transition::to(state, vec![]);
            }
            Transition::to(
                S::Completed {
                    retransmits: retransmits + 1,
                },
                vec![
                    Retransmit,
                    Schedule(G, policy.backoff(retransmits + 1, true)),
                ],
            )
        }
        (S::Completed { .. }, In::RetransmittedRequest) => Transition::to(state, vec![Retransmit]),
        (S::Completed { .. }, In::Cancel) => Transition::to(state, vec![]),
        (S::Completed { .. }, In::Timer(H)) => Transition::to(S::Terminated, timed_out()),
        (S::Completed { .. }, In::Ack) => Transition::to(
            S::Confirmed,
            vec![
                CancelTimer(G),
                CancelTimer(H),
                Deliver,
                Schedule(I, policy.wait(policy.t4)),
            ],
        ),
        (S::Confirmed, In::Ack | In::RetransmittedRequest) => Transition::to(state, vec![]),
        (S::Confirmed, In::Timer(I)) => Transition::to(S::Terminated, vec![Terminate]),
        _ => None,
    }
}

fn server_non_invite(
    state: TransactionState,
    input: TransactionInput,
    policy: &TimerPolicy,
) -> Option<Transition> {
    use TimerKind::*;
    use TransactionAction::*;
    use TransactionInput as In;
    use TransactionState as S;

    match (state, input) {
        (S::Nothing, In::ReceiveRequest) => Transition::to(S::Trying, vec![Deliver]),
        (S::Trying, In::RetransmittedRequest) => Transition::to(state, vec![]),
        (S::Trying | S::Proceeding { .. }, In::Provisional) => {
            Transition::to(S::Proceeding { retransmits: 0 }, vec![SendResponse])
        }
        (S::Proceeding { .. }, In::RetransmittedRequest) => {
            Transition::to(state, vec![Retransmit])
        }
        (S::Trying | S::Proceeding { .. }, In::Success | In::Failure) => Transition::to(
            S::Completed { retransmits: 0 },
            vec![SendResponse, Schedule(J, policy.wait(policy.timeout()))],
        ),
        (S::Completed { .. }, In::RetransmittedRequest) => Transition::to(state, vec![Retransmit]),
        (S::Completed { .. }, In::Timer(J)) => Transition::to(S::Terminated, vec![Terminate]),
        _ => None,
    }
}
