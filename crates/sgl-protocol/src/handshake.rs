//! Connect handshake and the host's connection state.
//!
//! A client claims the segment by CASing `claim_id` from zero to
//! [`CLAIM_PENDING`] and then writing a request word into `connect`. The host
//! answers the request by allocating a claim id and publishing the negotiated
//! API version, or rejects it when a session is already active.

use std::fmt;
use std::str::FromStr;

use tracing::{info, warn};

use crate::backoff::Wait;
use crate::error::{ParseVersionError, WaitError};
use crate::layout::{connect_word, CLAIM_NONE, CLAIM_PENDING};
use crate::regs::{Reg, RegisterFile};

/// Graphics API version, ordered by `(major, minor)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
}

impl ApiVersion {
    pub const DEFAULT: ApiVersion = ApiVersion::new(4, 6);

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        let major: u16 = major.parse().map_err(|_| invalid())?;
        let minor: u16 = minor.parse().map_err(|_| invalid())?;
        // The request word carries the major version in 15 bits.
        if major > 0x7FFF {
            return Err(invalid());
        }
        Ok(Self { major, minor })
    }
}

/// Builds the `connect` request word. `None` asks for the host default.
pub fn encode_request(requested: Option<ApiVersion>) -> u32 {
    let version = requested.unwrap_or(ApiVersion::new(0, 0));
    connect_word::REQUEST_BIT | (u32::from(version.major) & 0x7FFF) << 16 | u32::from(version.minor)
}

/// Parses a `connect` word. Returns `None` when it is not a request;
/// `Some(None)` for a request that leaves the version to the host.
pub fn decode_request(word: u32) -> Option<Option<ApiVersion>> {
    if word & connect_word::REQUEST_BIT == 0 {
        return None;
    }
    let major = ((word >> 16) & 0x7FFF) as u16;
    let minor = (word & 0xFFFF) as u16;
    if (major, minor) == (0, 0) {
        Some(None)
    } else {
        Some(Some(ApiVersion::new(major, minor)))
    }
}

/// The claim register held a live session id when a client tried to connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimTaken {
    pub claim_id: u32,
}

/// Client steps 1 and 2: claims the segment and posts the request.
///
/// Fails without touching any register when another session holds the claim.
pub fn begin_connect<R: RegisterFile + ?Sized>(
    regs: &R,
    requested: Option<ApiVersion>,
) -> Result<(), ClaimTaken> {
    regs.compare_exchange(Reg::ClaimId, CLAIM_NONE, CLAIM_PENDING)
        .map_err(|claim_id| ClaimTaken { claim_id })?;
    regs.store(Reg::Connect, encode_request(requested));
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted { claim_id: u32, version: ApiVersion },
    Rejected,
}

/// Client steps 3 and 4: waits for the host's answer and acknowledges it.
///
/// If the wait fails, the request and the pending claim are rolled back.
pub fn await_connect<R, W>(regs: &R, wait: &mut W) -> Result<ConnectOutcome, WaitError>
where
    R: RegisterFile + ?Sized,
    W: Wait + ?Sized,
{
    loop {
        match regs.load(Reg::Connect) {
            connect_word::ACCEPTED => {
                let outcome = ConnectOutcome::Accepted {
                    claim_id: regs.load(Reg::ClaimId),
                    version: ApiVersion::new(
                        regs.load(Reg::ApiMajor) as u16,
                        regs.load(Reg::ApiMinor) as u16,
                    ),
                };
                regs.store(Reg::Connect, connect_word::IDLE);
                return Ok(outcome);
            }
            connect_word::REJECTED => {
                regs.store(Reg::Connect, connect_word::IDLE);
                return Ok(ConnectOutcome::Rejected);
            }
            _ => {}
        }
        if let Err(err) = wait.wait() {
            let request = regs.load(Reg::Connect);
            if request & connect_word::REQUEST_BIT != 0 {
                let _ = regs.compare_exchange(Reg::Connect, request, connect_word::IDLE);
                let _ = regs.compare_exchange(Reg::ClaimId, CLAIM_PENDING, CLAIM_NONE);
            }
            return Err(err);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { claim_id: u32, version: ApiVersion },
}

/// Host reaction to a connect request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectEvent {
    Accepted { claim_id: u32, version: ApiVersion },
    Rejected { active_claim: u32 },
}

/// Host-side connection state.
///
/// The only way into [`ConnectionState::Connected`] is
/// [`HostSession::poll_connect`] answering a request while the claim register
/// holds no live session.
#[derive(Debug)]
pub struct HostSession {
    state: ConnectionState,
    default_version: ApiVersion,
    max_version: ApiVersion,
    next_claim: u32,
}

impl HostSession {
    pub fn new(default_version: ApiVersion, max_version: ApiVersion) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            default_version: default_version.min(max_version),
            max_version,
            next_claim: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn claim_id(&self) -> Option<u32> {
        match self.state {
            ConnectionState::Connected { claim_id, .. } => Some(claim_id),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<ApiVersion> {
        match self.state {
            ConnectionState::Connected { version, .. } => Some(version),
            _ => None,
        }
    }

    /// Whether a session is connected and the claim register still names it.
    pub fn is_active<R: RegisterFile + ?Sized>(&self, regs: &R) -> bool {
        self.claim_id()
            .is_some_and(|claim_id| regs.load(Reg::ClaimId) == claim_id)
    }

    pub fn negotiate(&self, requested: Option<ApiVersion>) -> ApiVersion {
        match requested {
            None => self.default_version,
            Some(version) if version <= self.max_version => version,
            Some(version) => {
                warn!(
                    requested = %version,
                    max = %self.max_version,
                    "requested API version above host maximum, clamping"
                );
                self.max_version
            }
        }
    }

    /// Answers a pending connect request, if there is one.
    pub fn poll_connect<R: RegisterFile + ?Sized>(&mut self, regs: &R) -> Option<ConnectEvent> {
        let word = regs.load(Reg::Connect);
        let requested = decode_request(word)?;

        let claim = regs.load(Reg::ClaimId);
        if claim != CLAIM_NONE && claim != CLAIM_PENDING {
            warn!(active_claim = claim, "rejecting connect request, segment already claimed");
            regs.store(Reg::Connect, connect_word::REJECTED);
            return Some(ConnectEvent::Rejected {
                active_claim: claim,
            });
        }

        self.state = ConnectionState::Connecting;
        let version = self.negotiate(requested);
        let claim_id = self.allocate_claim();
        regs.store(Reg::ApiMajor, u32::from(version.major));
        regs.store(Reg::ApiMinor, u32::from(version.minor));
        regs.store(Reg::ClaimId, claim_id);
        regs.store(Reg::Connect, connect_word::ACCEPTED);
        self.state = ConnectionState::Connected { claim_id, version };
        info!(claim_id, %version, "client connected");
        Some(ConnectEvent::Accepted { claim_id, version })
    }

    /// Ends the current session and frees the claim. Returns the claim id that
    /// was active, if any.
    pub fn disconnect<R: RegisterFile + ?Sized>(&mut self, regs: &R) -> Option<u32> {
        let previous = self.claim_id();
        regs.store(Reg::ClaimId, CLAIM_NONE);
        regs.store(Reg::Connect, connect_word::IDLE);
        self.state = ConnectionState::Disconnected;
        if let Some(claim_id) = previous {
            info!(claim_id, "client disconnected");
        }
        previous
    }

    fn allocate_claim(&mut self) -> u32 {
        let claim_id = self.next_claim;
        self.next_claim = match self.next_claim.wrapping_add(1) {
            CLAIM_NONE | CLAIM_PENDING => 1,
            next => next,
        };
        claim_id
    }
}
