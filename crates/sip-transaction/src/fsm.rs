// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sans-IO transaction state machines (RFC 3261 §17).
//!
//! Each machine consumes an event and returns the actions the runtime must
//! perform. Machines never touch the network or the clock themselves.
//! Every event reaching a terminated machine yields no actions, with two
//! exceptions while an INVITE record lingers after a 2xx: the `Linger` timer
//! purges it, and a client still forwards further 2xx responses.

use std::time::Duration;

use bytes::Bytes;
use sip_core::{CSeq, HeaderAccess, Headers, Method, Request, RequestLine, Response};
use smol_str::SmolStr;

use crate::{
    timers::TransportAwareTimers, ClientInviteState, ClientNonInviteState, ServerInviteState,
    ServerNonInviteState, TimeoutKind, TransactionTimer,
};

/// Events that drive the client INVITE transaction state machine (RFC 3261 §17.1.1).
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    SendInvite(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Events that drive the client non-INVITE transaction state machine (RFC 3261 §17.1.2).
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    SendRequest(Request),
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the client state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Send (or resend) a request: the original, or the ACK for a non-2xx.
    Transmit(Request),
    /// Hand a response to the transaction user.
    Deliver(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Timeout(TimeoutKind),
    Terminate {
        reason: SmolStr,
    },
}

/// Events that drive the server INVITE transaction state machine (RFC 3261 §17.2.1).
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    ReceiveInvite(Request),
    SendProvisional(Response),
    SendFinal(Response),
    ReceiveAck,
    TimerFired(TransactionTimer),
    TransportError,
}

/// Events that drive the server non-INVITE transaction state machine (RFC 3261 §17.2.2).
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRequest(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
    TransportError,
}

/// Actions emitted by the server state machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Hand the request to the transaction user (first arrival only).
    Deliver(Request),
    /// Send (or resend) a response.
    Transmit(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    Timeout(TimeoutKind),
    Terminate {
        reason: SmolStr,
    },
}

/// Builds the ACK a client INVITE transaction sends for a 3xx-6xx response
/// (RFC 3261 §17.1.1.3).
///
/// Request-URI, Call-ID, From and the top Via come from the INVITE; To
/// comes from the response so it carries the remote tag. Route headers of
/// the INVITE are preserved.
pub fn build_non_2xx_ack(invite: &Request, response: &Response) -> Option<Request> {
    let mut headers = Headers::new();
    headers.push("Via", invite.headers().values("Via").into_iter().next()?);
    for route in invite.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    headers.push("Max-Forwards", "70");
    headers.push("From", invite.headers().get("From")?.clone());
    let to = response
        .headers()
        .get("To")
        .or_else(|| invite.headers().get("To"))?;
    headers.push("To", to.clone());
    headers.push("Call-ID", invite.call_id()?);
    headers.push(
        "CSeq",
        CSeq::new(invite.cseq()?.number, Method::Ack).to_string(),
    );
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Ack, invite.uri().clone()),
        headers,
        Bytes::new(),
    )
    .ok()
}

fn terminate(reason: &str) -> SmolStr {
    SmolStr::new(reason)
}

/// Implements RFC 3261 Figure 5 for INVITE client transactions.
///
/// A 2xx moves the machine straight to `Terminated`; the record then lingers
/// for the `Linger` period so retransmitted or forked 2xx responses still
/// reach the transaction user.
#[derive(Debug)]
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    invite: Option<Request>,
    ack: Option<Request>,
    lingering: bool,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.duration(TransactionTimer::A),
            timers,
            invite: None,
            ack: None,
            lingering: false,
        }
    }

    /// The INVITE this transaction carries.
    pub fn request(&self) -> Option<&Request> {
        self.invite.as_ref()
    }

    /// The ACK generated for a non-2xx final response, if any.
    pub fn ack(&self) -> Option<&Request> {
        self.ack.as_ref()
    }

    /// Handles an INVITE transaction event and returns actions for the runtime.
    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<ClientAction> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientInviteEvent::SendInvite(invite)) if self.invite.is_none() => {
                self.handle_send_invite(invite)
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                if response.is_success() {
                    self.handle_final_2xx(response)
                } else {
                    self.handle_final_non_2xx(response)
                }
            }
            (Completed, ClientInviteEvent::ReceiveFinal(response)) if !response.is_success() => {
                // Our ACK was lost; resend it without bothering the TU.
                self.ack.iter().cloned().map(ClientAction::Transmit).collect()
            }
            (Terminated, ClientInviteEvent::ReceiveFinal(response))
                if self.lingering && response.is_success() =>
            {
                vec![ClientAction::Deliver(response)]
            }
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::A)) => self.handle_timer_a(),
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(TransactionTimer::A),
                    ClientAction::Timeout(TimeoutKind::Transaction),
                    ClientAction::Terminate {
                        reason: terminate("Timer B expired"),
                    },
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: terminate("Timer D expired"),
                }]
            }
            (Terminated, ClientInviteEvent::TimerFired(TransactionTimer::Linger))
                if self.lingering =>
            {
                self.lingering = false;
                vec![ClientAction::Terminate {
                    reason: terminate("2xx linger expired"),
                }]
            }
            (Calling | Proceeding | Completed, ClientInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: terminate("transport error"),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn handle_send_invite(&mut self, invite: Request) -> Vec<ClientAction> {
        self.invite = Some(invite.clone());
        let mut actions = vec![ClientAction::Transmit(invite)];
        if self.timers.should_retransmit() {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        // A ringing call may stay in Proceeding for as long as it likes.
        self.state = ClientInviteState::Proceeding;
        vec![
            ClientAction::Cancel(TransactionTimer::A),
            ClientAction::Cancel(TransactionTimer::B),
            ClientAction::Deliver(response),
        ]
    }

    fn handle_final_2xx(&mut self, response: Response) -> Vec<ClientAction> {
        self.state = ClientInviteState::Terminated;
        self.lingering = true;
        vec![
            ClientAction::Cancel(TransactionTimer::A),
            ClientAction::Cancel(TransactionTimer::B),
            ClientAction::Deliver(response),
            ClientAction::Schedule {
                timer: TransactionTimer::Linger,
                duration: self.timers.duration(TransactionTimer::Linger),
            },
        ]
    }

    fn handle_final_non_2xx(&mut self, response: Response) -> Vec<ClientAction> {
        let mut actions = vec![
            ClientAction::Cancel(TransactionTimer::A),
            ClientAction::Cancel(TransactionTimer::B),
        ];
        self.ack = self
            .invite
            .as_ref()
            .and_then(|invite| build_non_2xx_ack(invite, &response));
        if let Some(ack) = &self.ack {
            actions.push(ClientAction::Transmit(ack.clone()));
        }
        actions.push(ClientAction::Deliver(response));

        let wait = self.timers.duration(TransactionTimer::D);
        if wait.is_zero() {
            self.state = ClientInviteState::Terminated;
            actions.push(ClientAction::Terminate {
                reason: terminate("final response on reliable transport"),
            });
        } else {
            self.state = ClientInviteState::Completed;
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::D,
                duration: wait,
            });
        }
        actions
    }

    fn handle_timer_a(&mut self) -> Vec<ClientAction> {
        let Some(invite) = &self.invite else {
            return Vec::new();
        };
        self.a_interval = self
            .timers
            .next_interval(TransactionTimer::A, self.a_interval);
        vec![
            ClientAction::Transmit(invite.clone()),
            ClientAction::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            },
        ]
    }
}

/// Implements RFC 3261 Figure 6 for non-INVITE client transactions.
#[derive(Debug)]
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    request: Option<Request>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.duration(TransactionTimer::E),
            timers,
            request: None,
        }
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Handles an event, returning the resulting actions.
    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<ClientAction> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientNonInviteEvent::SendRequest(request)) if self.request.is_none() => {
                self.handle_initial_send(request)
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.handle_provisional(response)
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                self.handle_timer_e()
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    ClientAction::Cancel(TransactionTimer::E),
                    ClientAction::Timeout(TimeoutKind::Transaction),
                    ClientAction::Terminate {
                        reason: terminate("Timer F expired"),
                    },
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: terminate("Timer K expired"),
                }]
            }
            (Trying | Proceeding | Completed, ClientNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ClientAction::Terminate {
                    reason: terminate("transport error"),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn handle_initial_send(&mut self, request: Request) -> Vec<ClientAction> {
        self.request = Some(request.clone());
        let mut actions = vec![ClientAction::Transmit(request)];
        if self.timers.should_retransmit() {
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions.push(ClientAction::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        actions
    }

    fn handle_provisional(&mut self, response: Response) -> Vec<ClientAction> {
        let entering = self.state == ClientNonInviteState::Trying;
        self.state = ClientNonInviteState::Proceeding;
        let mut actions = vec![ClientAction::Deliver(response)];
        if entering && self.timers.should_retransmit() {
            // E restarts at T2 rather than finishing its Trying interval.
            self.e_interval = self.timers.duration(TransactionTimer::T2);
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions
    }

    fn handle_final(&mut self, response: Response) -> Vec<ClientAction> {
        let mut actions = vec![
            ClientAction::Cancel(TransactionTimer::E),
            ClientAction::Cancel(TransactionTimer::F),
            ClientAction::Deliver(response),
        ];
        let wait = self.timers.duration(TransactionTimer::K);
        if wait.is_zero() {
            self.state = ClientNonInviteState::Terminated;
            actions.push(ClientAction::Terminate {
                reason: terminate("final response on reliable transport"),
            });
        } else {
            self.state = ClientNonInviteState::Completed;
            actions.push(ClientAction::Schedule {
                timer: TransactionTimer::K,
                duration: wait,
            });
        }
        actions
    }

    fn handle_timer_e(&mut self) -> Vec<ClientAction> {
        let Some(request) = &self.request else {
            return Vec::new();
        };
        self.e_interval = if self.state == ClientNonInviteState::Proceeding {
            self.timers.duration(TransactionTimer::T2)
        } else {
            self.timers
                .next_interval(TransactionTimer::E, self.e_interval)
        };
        vec![
            ClientAction::Transmit(request.clone()),
            ClientAction::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            },
        ]
    }
}

/// Implements RFC 3261 Figure 7 for INVITE server transactions.
///
/// A 2xx moves the machine straight to `Terminated`; the record lingers to
/// swallow retransmitted INVITEs. Retransmitting the 2xx itself belongs to
/// the layer above.
#[derive(Debug)]
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    request: Option<Request>,
    last_response: Option<Response>,
    lingering: bool,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.duration(TransactionTimer::G),
            timers,
            request: None,
            last_response: None,
            lingering: false,
        }
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    /// Only the Proceeding state accepts responses from the TU.
    pub fn can_respond(&self) -> bool {
        self.state == ServerInviteState::Proceeding
    }

    /// Handles an event, returning the resulting actions.
    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<ServerAction> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerInviteEvent::ReceiveInvite(invite)) if self.request.is_none() => {
                self.request = Some(invite.clone());
                vec![
                    ServerAction::Deliver(invite),
                    ServerAction::Schedule {
                        timer: TransactionTimer::Trying,
                        duration: self.timers.duration(TransactionTimer::Trying),
                    },
                ]
            }
            (Proceeding | Completed, ServerInviteEvent::ReceiveInvite(_)) => {
                self.last_response
                    .iter()
                    .cloned()
                    .map(ServerAction::Transmit)
                    .collect()
            }
            (Proceeding, ServerInviteEvent::TimerFired(TransactionTimer::Trying)) => {
                self.handle_trying_timer()
            }
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                self.last_response = Some(response.clone());
                vec![
                    ServerAction::Cancel(TransactionTimer::Trying),
                    ServerAction::Transmit(response),
                ]
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => {
                if response.is_success() {
                    self.handle_final_2xx(response)
                } else {
                    self.handle_final_non_2xx(response)
                }
            }
            (Completed, ServerInviteEvent::ReceiveAck) => self.handle_ack(),
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::G)) => {
                self.handle_timer_g()
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    ServerAction::Cancel(TransactionTimer::G),
                    ServerAction::Timeout(TimeoutKind::Transaction),
                    ServerAction::Terminate {
                        reason: terminate("Timer H expired"),
                    },
                ]
            }
            (Confirmed, ServerInviteEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: terminate("Timer I expired"),
                }]
            }
            (Terminated, ServerInviteEvent::TimerFired(TransactionTimer::Linger))
                if self.lingering =>
            {
                self.lingering = false;
                vec![ServerAction::Terminate {
                    reason: terminate("2xx linger expired"),
                }]
            }
            (Proceeding | Completed | Confirmed, ServerInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: terminate("transport error"),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn handle_trying_timer(&mut self) -> Vec<ServerAction> {
        if self.last_response.is_some() {
            return Vec::new();
        }
        let Some(trying) = self
            .request
            .as_ref()
            .and_then(|invite| Response::for_request(invite, 100, "Trying").ok())
        else {
            return Vec::new();
        };
        self.last_response = Some(trying.clone());
        vec![ServerAction::Transmit(trying)]
    }

    fn handle_final_2xx(&mut self, response: Response) -> Vec<ServerAction> {
        self.state = ServerInviteState::Terminated;
        self.lingering = true;
        self.last_response = Some(response.clone());
        vec![
            ServerAction::Cancel(TransactionTimer::Trying),
            ServerAction::Transmit(response),
            ServerAction::Schedule {
                timer: TransactionTimer::Linger,
                duration: self.timers.duration(TransactionTimer::Linger),
            },
        ]
    }

    fn handle_final_non_2xx(&mut self, response: Response) -> Vec<ServerAction> {
        self.state = ServerInviteState::Completed;
        self.last_response = Some(response.clone());
        let mut actions = vec![
            ServerAction::Cancel(TransactionTimer::Trying),
            ServerAction::Transmit(response),
        ];
        if self.timers.should_retransmit() {
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            });
        }
        actions.push(ServerAction::Schedule {
            timer: TransactionTimer::H,
            duration: self.timers.duration(TransactionTimer::H),
        });
        actions
    }

    fn handle_ack(&mut self) -> Vec<ServerAction> {
        let mut actions = vec![
            ServerAction::Cancel(TransactionTimer::G),
            ServerAction::Cancel(TransactionTimer::H),
        ];
        let wait = self.timers.duration(TransactionTimer::I);
        if wait.is_zero() {
            self.state = ServerInviteState::Terminated;
            actions.push(ServerAction::Terminate {
                reason: terminate("ACK on reliable transport"),
            });
        } else {
            self.state = ServerInviteState::Confirmed;
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::I,
                duration: wait,
            });
        }
        actions
    }

    fn handle_timer_g(&mut self) -> Vec<ServerAction> {
        let Some(response) = &self.last_response else {
            return Vec::new();
        };
        self.g_interval = self
            .timers
            .next_interval(TransactionTimer::G, self.g_interval);
        vec![
            ServerAction::Transmit(response.clone()),
            ServerAction::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            },
        ]
    }
}

/// Implements RFC 3261 Figure 8 for non-INVITE server transactions.
#[derive(Debug)]
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    timers: TransportAwareTimers,
    request: Option<Request>,
    last_response: Option<Response>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            request: None,
            last_response: None,
        }
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn last_response(&self) -> Option<&Response> {
        self.last_response.as_ref()
    }

    pub fn can_respond(&self) -> bool {
        matches!(
            self.state,
            ServerNonInviteState::Trying | ServerNonInviteState::Proceeding
        )
    }

    /// Handles an event, returning the resulting actions.
    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<ServerAction> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Trying, ServerNonInviteEvent::ReceiveRequest(request)) if self.request.is_none() => {
                self.request = Some(request.clone());
                vec![ServerAction::Deliver(request)]
            }
            (Proceeding | Completed, ServerNonInviteEvent::ReceiveRequest(_)) => self
                .last_response
                .iter()
                .cloned()
                .map(ServerAction::Transmit)
                .collect(),
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                self.last_response = Some(response.clone());
                vec![ServerAction::Transmit(response)]
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.handle_final(response)
            }
            (Completed, ServerNonInviteEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: terminate("Timer J expired"),
                }]
            }
            (Trying | Proceeding | Completed, ServerNonInviteEvent::TransportError) => {
                self.state = Terminated;
                vec![ServerAction::Terminate {
                    reason: terminate("transport error"),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<ServerAction> {
        self.last_response = Some(response.clone());
        let mut actions = vec![ServerAction::Transmit(response)];
        let wait = self.timers.duration(TransactionTimer::J);
        if wait.is_zero() {
            self.state = ServerNonInviteState::Terminated;
            actions.push(ServerAction::Terminate {
                reason: terminate("final response on reliable transport"),
            });
        } else {
            self.state = ServerNonInviteState::Completed;
            actions.push(ServerAction::Schedule {
                timer: TransactionTimer::J,
                duration: wait,
            });
        }
        actions
    }
}
