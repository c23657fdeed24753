use tankfall_core::frame::FrameError;
use tankfall_core::session::MatchPhase;

/// Why a connection could not be admitted into the match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    InvalidName,
    ProtocolMismatch { client: u8, server: u8 },
    /// The match has left the lobby or the roster is full.
    RegistrationOverflow { phase: MatchPhase, admitted: usize },
    /// Binding the participant's side-channel port failed.
    SideChannelUnavailable { port: u16, reason: String },
    /// The coordinator task is gone.
    CoordinatorUnavailable,
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "Invalid player name"),
            Self::ProtocolMismatch { client, server } => {
                write!(
                    f,
                    "Protocol version mismatch: client={client}, server={server}"
                )
            },
            Self::RegistrationOverflow { phase, admitted } => {
                write!(
                    f,
                    "Match is not accepting players (phase {phase}, {admitted} admitted)"
                )
            },
            Self::SideChannelUnavailable { port, reason } => {
                write!(f, "Side channel port {port} unavailable: {reason}")
            },
            Self::CoordinatorUnavailable => write!(f, "Match is shutting down"),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Failures inside a side-channel listener. None of these stop the listener.
#[derive(Debug)]
pub enum SideChannelError {
    Accept(std::io::Error),
    Read(std::io::Error),
    Write(std::io::Error),
    WriteTimeout,
    Frame(FrameError),
}

impl std::fmt::Display for SideChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept(e) => write!(f, "accept failed: {e}"),
            Self::Read(e) => write!(f, "read failed: {e}"),
            Self::Write(e) => write!(f, "echo failed: {e}"),
            Self::WriteTimeout => write!(f, "echo timed out"),
            Self::Frame(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SideChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Accept(e) | Self::Read(e) | Self::Write(e) => Some(e),
            Self::Frame(e) => Some(e),
            Self::WriteTimeout => None,
        }
    }
}

impl From<FrameError> for SideChannelError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// External address discovery failed.
#[derive(Debug)]
pub enum LookupError {
    Http(reqwest::Error),
    Status(u16),
    /// The service answered with something that is not an IP address.
    InvalidBody(String),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "address lookup request failed: {e}"),
            Self::Status(code) => write!(f, "address lookup returned HTTP {code}"),
            Self::InvalidBody(body) => {
                write!(f, "address lookup returned a non-address body: {body:?}")
            },
        }
    }
}

impl std::error::Error for LookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_messages_are_client_facing() {
        let e = AdmissionError::ProtocolMismatch {
            client: 9,
            server: 1,
        };
        assert_eq!(
            e.to_string(),
            "Protocol version mismatch: client=9, server=1"
        );
        let e = AdmissionError::RegistrationOverflow {
            phase: MatchPhase::Playing,
            admitted: 2,
        };
        assert!(e.to_string().contains("Playing"));
    }

    #[test]
    fn side_channel_error_exposes_source() {
        use std::error::Error;
        let e = SideChannelError::Read(std::io::Error::other("boom"));
        assert!(e.source().is_some());
        assert!(SideChannelError::WriteTimeout.source().is_none());
        let frame = SideChannelError::from(FrameError::FrameTooLarge { len: 10, max: 8 });
        assert!(frame.to_string().contains("frame too large"));
    }
}
