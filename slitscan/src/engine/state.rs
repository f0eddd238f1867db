//! The per-candidate state machine (§4.5), shared by outbound candidate
//! records and inbound connect-back records (both carry a `State`, exactly
//! as the original `Client` base class did).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initiated,
    Established,
    SentConnect,
    RecvCode,
    SameBack,
    DiffBack,
    SentToken,
    RecvToken,
    Discovered,
}

impl State {
    pub fn label(self) -> &'static str {
        match self {
            State::Initiated => "INITIATED",
            State::Established => "ESTABLISHED",
            State::SentConnect => "SENT_CONNECT",
            State::RecvCode => "RECV_CODE",
            State::SameBack => "SAME_BACK",
            State::DiffBack => "DIFF_BACK",
            State::SentToken => "SENT_TOKEN",
            State::RecvToken => "RECV_TOKEN",
            State::Discovered => "DISCOVERED",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
